use std::collections::{BTreeMap, BTreeSet};
use std::sync::Mutex;

use crate::config::StateBackendKind;
use crate::errors::StateError;
use crate::state::StateBackend;
use crate::window::{PendingWindows, WindowBucket};

#[derive(Default)]
struct Inner {
    buckets: BTreeMap<(String, i64), WindowBucket>,
    dirty: BTreeSet<(String, i64)>,
}

/// Heap-only window state. Fast, but a crash loses everything that is not in
/// a completed checkpoint.
#[derive(Default)]
pub struct MemoryStateBackend {
    inner: Mutex<Inner>,
}

impl MemoryStateBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::result::Result<std::sync::MutexGuard<'_, Inner>, StateError> {
        self.inner.lock().map_err(|_| StateError::Poisoned)
    }
}

impl StateBackend for MemoryStateBackend {
    fn kind(&self) -> StateBackendKind {
        StateBackendKind::Memory
    }

    fn upsert(&self, bucket: &WindowBucket) -> std::result::Result<(), StateError> {
        let mut inner = self.lock()?;
        let id = (bucket.key.clone(), bucket.window_start);
        inner.dirty.insert(id.clone());
        inner.buckets.insert(id, bucket.clone());
        Ok(())
    }

    fn remove(&self, key: &str, window_start: i64) -> std::result::Result<(), StateError> {
        let mut inner = self.lock()?;
        let id = (key.to_string(), window_start);
        inner.buckets.remove(&id);
        inner.dirty.insert(id);
        Ok(())
    }

    fn snapshot(&self) -> std::result::Result<PendingWindows, StateError> {
        let mut inner = self.lock()?;
        inner.dirty.clear();
        Ok(PendingWindows {
            buckets: inner.buckets.values().cloned().collect(),
        })
    }

    fn restore(&self, pending: &PendingWindows) -> std::result::Result<(), StateError> {
        let mut inner = self.lock()?;
        inner.buckets = pending
            .buckets
            .iter()
            .cloned()
            .map(|b| ((b.key.clone(), b.window_start), b))
            .collect();
        inner.dirty.clear();
        Ok(())
    }

    fn dirty_buckets(&self) -> usize {
        self.lock().map(|inner| inner.dirty.len()).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::InboundMessage;
    use std::collections::HashMap;

    fn bucket(key: &str, start: i64) -> WindowBucket {
        let mut headers = HashMap::new();
        headers.insert("CompanyId".to_string(), "COMP000001".to_string());
        headers.insert("MessageType".to_string(), "ORDER".to_string());
        headers.insert("SenderId".to_string(), "SENDER001".to_string());
        WindowBucket {
            key: key.to_string(),
            window_start: start,
            window_end: start + 5_000,
            members: vec![
                InboundMessage::from_parts("<order/>".to_string(), headers, 0, 7).unwrap(),
            ],
        }
    }

    #[test]
    fn tracks_dirty_buckets_between_snapshots() {
        let backend = MemoryStateBackend::new();
        backend.upsert(&bucket("key-0", 0)).unwrap();
        backend.upsert(&bucket("key-1", 0)).unwrap();
        assert_eq!(backend.dirty_buckets(), 2);

        let snap = backend.snapshot().unwrap();
        assert_eq!(snap.len(), 2);
        assert_eq!(backend.dirty_buckets(), 0);

        backend.remove("key-0", 0).unwrap();
        assert_eq!(backend.dirty_buckets(), 1);
        assert_eq!(backend.snapshot().unwrap().len(), 1);
    }

    #[test]
    fn restore_replaces_state() {
        let backend = MemoryStateBackend::new();
        backend.upsert(&bucket("key-0", 0)).unwrap();

        let recovered = PendingWindows {
            buckets: vec![bucket("key-3", 10_000)],
        };
        backend.restore(&recovered).unwrap();
        assert_eq!(backend.snapshot().unwrap(), recovered);
    }
}
