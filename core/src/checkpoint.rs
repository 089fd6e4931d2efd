use std::fs;
use std::io::Write as _;
use std::path::PathBuf;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::{CheckpointConfig, CleanupPolicy};
use crate::errors::CheckpointError;
use crate::source::SourceOffsets;
use crate::window::PendingWindows;

/// A globally consistent snapshot of pipeline progress: the next offset to
/// read per partition plus every not-yet-fired window bucket as of one
/// instant. Read once at recovery time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointRecord {
    pub epoch: u64,
    pub source_offsets: SourceOffsets,
    pub pending: PendingWindows,
    pub snapshot_location: PathBuf,
    pub completed_at: String,
}

const RECORD_FILE: &str = "checkpoint.json";

/// Durable per-epoch checkpoint layout: one `epoch-<n>` directory per record
/// under a common root.
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    dir: PathBuf,
}

impl CheckpointStore {
    pub fn open(dir: impl Into<PathBuf>) -> std::io::Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn epoch_dir(&self, epoch: u64) -> PathBuf {
        self.dir.join(format!("epoch-{epoch:010}"))
    }

    /// Persist a record. The JSON lands in a temp file first and is renamed
    /// into place, so a crash mid-write never leaves a readable half-record.
    pub fn write(&self, record: &CheckpointRecord) -> std::result::Result<PathBuf, CheckpointError> {
        let epoch_dir = self.epoch_dir(record.epoch);
        fs::create_dir_all(&epoch_dir)?;

        let tmp = epoch_dir.join(format!("{RECORD_FILE}.tmp"));
        let mut file = fs::File::create(&tmp)?;
        file.write_all(&serde_json::to_vec_pretty(record)?)?;
        file.sync_all()?;
        drop(file);

        let target = epoch_dir.join(RECORD_FILE);
        fs::rename(&tmp, &target)?;
        Ok(target)
    }

    /// Load the newest complete record, skipping epochs whose record never
    /// finished writing.
    pub fn latest(&self) -> std::result::Result<Option<CheckpointRecord>, CheckpointError> {
        let mut epochs = self.list_epochs()?;
        epochs.sort_unstable_by(|a, b| b.cmp(a));

        for epoch in epochs {
            let path = self.epoch_dir(epoch).join(RECORD_FILE);
            match fs::read(&path) {
                Ok(bytes) => match serde_json::from_slice::<CheckpointRecord>(&bytes) {
                    Ok(record) => return Ok(Some(record)),
                    Err(e) => {
                        warn!(epoch, error = %e, "skipping unreadable checkpoint record")
                    }
                },
                Err(_) => debug!(epoch, "skipping incomplete checkpoint directory"),
            }
        }
        Ok(None)
    }

    /// Remove superseded epochs, keeping the newest `retained`.
    pub fn prune(&self, retained: usize) -> std::result::Result<usize, CheckpointError> {
        let mut epochs = self.list_epochs()?;
        epochs.sort_unstable_by(|a, b| b.cmp(a));

        let mut removed = 0;
        for &epoch in epochs.iter().skip(retained.max(1)) {
            fs::remove_dir_all(self.epoch_dir(epoch))?;
            removed += 1;
        }
        Ok(removed)
    }

    /// Drop every epoch. Used by the delete-on-cancel cleanup policy.
    pub fn clear(&self) -> std::result::Result<usize, CheckpointError> {
        let epochs = self.list_epochs()?;
        let mut removed = 0;
        for epoch in &epochs {
            fs::remove_dir_all(self.epoch_dir(*epoch))?;
            removed += 1;
        }
        Ok(removed)
    }

    fn list_epochs(&self) -> std::io::Result<Vec<u64>> {
        let mut epochs = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(raw) = name.to_str().and_then(|n| n.strip_prefix("epoch-")) else {
                continue;
            };
            if let Ok(epoch) = raw.parse::<u64>() {
                epochs.push(epoch);
            }
        }
        Ok(epochs)
    }
}

/// Drives periodic epoch snapshots.
///
/// At most one snapshot is ever in flight; a minimum pause between completed
/// epochs bounds overhead. Timeouts and write failures are skippable until
/// the consecutive-failure limit is reached, at which point the coordinator
/// escalates to a fatal pipeline error.
pub struct CheckpointCoordinator {
    store: CheckpointStore,
    config: CheckpointConfig,
    next_epoch: u64,
    last_attempt_ms: i64,
    last_completed_ms: i64,
    consecutive_failures: u32,
}

impl CheckpointCoordinator {
    pub fn new(store: CheckpointStore, config: CheckpointConfig, now_ms: i64) -> Self {
        Self {
            store,
            config,
            next_epoch: 0,
            last_attempt_ms: now_ms,
            last_completed_ms: now_ms,
            consecutive_failures: 0,
        }
    }

    /// Continue the epoch sequence after recovering `record`.
    pub fn resume_after(mut self, record: &CheckpointRecord) -> Self {
        self.next_epoch = record.epoch + 1;
        self
    }

    pub fn next_epoch(&self) -> u64 {
        self.next_epoch
    }

    pub fn due(&self, now_ms: i64) -> bool {
        now_ms - self.last_attempt_ms >= self.config.interval_ms as i64
            && now_ms - self.last_completed_ms >= self.config.min_pause_ms as i64
    }

    /// Take one aligned snapshot. The caller captures `offsets` and `pending`
    /// at a single lock point and hands them over; nothing here reaches back
    /// into live pipeline state.
    pub async fn run_once(
        &mut self,
        offsets: SourceOffsets,
        pending: PendingWindows,
        dirty_buckets: usize,
        now_ms: i64,
    ) -> std::result::Result<CheckpointRecord, CheckpointError> {
        self.last_attempt_ms = now_ms;
        let epoch = self.next_epoch;

        let record = CheckpointRecord {
            epoch,
            source_offsets: offsets,
            pending,
            snapshot_location: self.store.epoch_dir(epoch),
            completed_at: Utc::now().to_rfc3339(),
        };

        let store = self.store.clone();
        let to_write = record.clone();
        let write = tokio::task::spawn_blocking(move || store.write(&to_write));

        let timeout_ms = self.config.timeout_ms;
        let written = match tokio::time::timeout(Duration::from_millis(timeout_ms), write).await {
            Err(_) => {
                return Err(self.register_failure(CheckpointError::Timeout { epoch, timeout_ms }));
            }
            Ok(Err(join_err)) => {
                return Err(self.register_failure(CheckpointError::Failed {
                    epoch,
                    reason: join_err.to_string(),
                }));
            }
            Ok(Ok(Err(e))) => return Err(self.register_failure(e)),
            Ok(Ok(Ok(path))) => path,
        };

        self.next_epoch += 1;
        self.consecutive_failures = 0;
        self.last_completed_ms = now_ms;

        if let Err(e) = self.store.prune(self.config.retained) {
            warn!(error = %e, "failed to prune superseded checkpoints");
        }

        info!(
            epoch,
            buckets = record.pending.len(),
            dirty_buckets,
            path = %written.display(),
            "checkpoint complete"
        );
        Ok(record)
    }

    fn register_failure(&mut self, error: CheckpointError) -> CheckpointError {
        self.consecutive_failures += 1;
        warn!(
            error = %error,
            failures = self.consecutive_failures,
            "checkpoint attempt failed"
        );
        if self.consecutive_failures > self.config.max_consecutive_failures {
            CheckpointError::TooManyFailures {
                failures: self.consecutive_failures,
                limit: self.config.max_consecutive_failures,
            }
        } else {
            error
        }
    }

    /// Apply the externalized cleanup policy when the pipeline is cancelled.
    pub fn on_cancel(&self) {
        match self.config.cleanup {
            CleanupPolicy::RetainOnCancel => {
                info!("retaining externalized checkpoints on cancellation");
            }
            CleanupPolicy::DeleteOnCancel => match self.store.clear() {
                Ok(removed) => info!(removed, "deleted externalized checkpoints on cancellation"),
                Err(e) => warn!(error = %e, "failed to delete checkpoints on cancellation"),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(epoch: u64, store: &CheckpointStore) -> CheckpointRecord {
        let mut offsets = SourceOffsets::new();
        offsets.insert(0, (epoch as i64 + 1) * 10);
        CheckpointRecord {
            epoch,
            source_offsets: offsets,
            pending: PendingWindows::default(),
            snapshot_location: store.epoch_dir(epoch),
            completed_at: Utc::now().to_rfc3339(),
        }
    }

    fn config(dir: &std::path::Path) -> CheckpointConfig {
        CheckpointConfig {
            dir: dir.to_path_buf(),
            interval_ms: 1_000,
            timeout_ms: 5_000,
            min_pause_ms: 500,
            max_concurrent: 1,
            retained: 2,
            cleanup: CleanupPolicy::RetainOnCancel,
            max_consecutive_failures: 1,
        }
    }

    #[test]
    fn store_round_trips_latest_record() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::open(dir.path()).unwrap();
        assert!(store.latest().unwrap().is_none());

        store.write(&record(0, &store)).unwrap();
        store.write(&record(1, &store)).unwrap();

        let latest = store.latest().unwrap().unwrap();
        assert_eq!(latest.epoch, 1);
        assert_eq!(latest.source_offsets.get(&0), Some(&20));
    }

    #[test]
    fn latest_skips_incomplete_epoch_directories() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::open(dir.path()).unwrap();
        store.write(&record(0, &store)).unwrap();

        // an epoch directory without a finished record, as after a crash
        fs::create_dir_all(store.epoch_dir(1)).unwrap();

        let latest = store.latest().unwrap().unwrap();
        assert_eq!(latest.epoch, 0);
    }

    #[test]
    fn prune_keeps_newest_epochs() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::open(dir.path()).unwrap();
        for epoch in 0..5 {
            store.write(&record(epoch, &store)).unwrap();
        }

        let removed = store.prune(2).unwrap();
        assert_eq!(removed, 3);
        assert!(store.epoch_dir(4).exists());
        assert!(store.epoch_dir(3).exists());
        assert!(!store.epoch_dir(0).exists());
        assert_eq!(store.latest().unwrap().unwrap().epoch, 4);
    }

    #[tokio::test]
    async fn coordinator_advances_epochs_and_prunes() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::open(dir.path()).unwrap();
        let mut coordinator = CheckpointCoordinator::new(store.clone(), config(dir.path()), 0);

        assert!(!coordinator.due(500));
        assert!(coordinator.due(1_000));

        for i in 0..4u64 {
            let now = (i as i64 + 1) * 1_000;
            let rec = coordinator
                .run_once(SourceOffsets::new(), PendingWindows::default(), 0, now)
                .await
                .unwrap();
            assert_eq!(rec.epoch, i);
        }

        assert_eq!(coordinator.next_epoch(), 4);
        // retained = 2
        assert!(!store.epoch_dir(0).exists());
        assert!(store.epoch_dir(2).exists());
        assert!(store.epoch_dir(3).exists());
    }

    #[tokio::test]
    async fn repeated_failures_escalate() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::open(dir.path()).unwrap();
        let mut coordinator = CheckpointCoordinator::new(store.clone(), config(dir.path()), 0);

        // make the store root unusable by replacing the epoch path with a file
        fs::write(store.epoch_dir(0), b"not a directory").unwrap();

        let first = coordinator
            .run_once(SourceOffsets::new(), PendingWindows::default(), 0, 1_000)
            .await
            .unwrap_err();
        assert!(first.is_recoverable());

        let second = coordinator
            .run_once(SourceOffsets::new(), PendingWindows::default(), 0, 2_000)
            .await
            .unwrap_err();
        assert!(matches!(
            second,
            CheckpointError::TooManyFailures { failures: 2, limit: 1 }
        ));
    }

    #[tokio::test]
    async fn resume_continues_the_epoch_sequence() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::open(dir.path()).unwrap();
        let recovered = record(7, &store);
        let coordinator = CheckpointCoordinator::new(store, config(dir.path()), 0)
            .resume_after(&recovered);
        assert_eq!(coordinator.next_epoch(), 8);
    }
}
