pub mod durable;
pub mod memory;

use std::sync::Arc;

use tracing::{info, warn};

use crate::config::{StateBackendKind, StateConfig};
use crate::errors::StateError;
use crate::window::{PendingWindows, WindowBucket};

/// Storage strategy for not-yet-fired window state.
///
/// The window assigner writes through on every mutation; the checkpoint
/// coordinator calls `snapshot` at epoch boundaries and `restore` during
/// recovery. Implementations must be `Send + Sync` for use behind
/// `Arc<dyn StateBackend>`.
pub trait StateBackend: Send + Sync {
    fn kind(&self) -> StateBackendKind;

    /// Record the current contents of one bucket.
    fn upsert(&self, bucket: &WindowBucket) -> std::result::Result<(), StateError>;

    /// Drop a bucket after it fired.
    fn remove(&self, key: &str, window_start: i64) -> std::result::Result<(), StateError>;

    /// Consistent view of every open bucket. Resets the dirty counter.
    fn snapshot(&self) -> std::result::Result<PendingWindows, StateError>;

    /// Replace all state with a recovered snapshot.
    fn restore(&self, pending: &PendingWindows) -> std::result::Result<(), StateError>;

    /// Buckets touched since the last snapshot.
    fn dirty_buckets(&self) -> usize;
}

/// Build the configured backend. A durable backend that cannot initialize
/// degrades to the in-memory one instead of failing startup; checkpoints
/// remain the only crash protection in that mode.
pub fn open_backend(config: &StateConfig) -> Arc<dyn StateBackend> {
    match config.kind {
        StateBackendKind::Memory => Arc::new(memory::MemoryStateBackend::new()),
        StateBackendKind::Durable => match durable::DurableStateBackend::open(config) {
            Ok(backend) => {
                info!(
                    incremental = config.incremental,
                    "opened durable state backend"
                );
                Arc::new(backend)
            }
            Err(e) => {
                warn!(error = %e, "durable state backend unavailable, degrading to in-memory");
                Arc::new(memory::MemoryStateBackend::new())
            }
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn open_backend_falls_back_to_memory_on_bad_path() {
        let config = StateConfig {
            kind: StateBackendKind::Durable,
            path: Some(PathBuf::from("/nonexistent-dir/deeper/state.db")),
            incremental: true,
        };
        let backend = open_backend(&config);
        assert_eq!(backend.kind(), StateBackendKind::Memory);
    }

    #[test]
    fn open_backend_requires_a_path_for_durable_state() {
        let config = StateConfig {
            kind: StateBackendKind::Durable,
            path: None,
            incremental: true,
        };
        let backend = open_backend(&config);
        assert_eq!(backend.kind(), StateBackendKind::Memory);
    }
}
