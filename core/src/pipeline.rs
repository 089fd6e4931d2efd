use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::checkpoint::{CheckpointCoordinator, CheckpointRecord};
use crate::config::WindowConfig;
use crate::errors::{PipelineError, SourceError};
use crate::processor::WindowFunction;
use crate::source::{PolledBatch, Source, SourceOffsets};
use crate::state::StateBackend;
use crate::supervisor::PipelineRunState;
use crate::telemetry::IngestMetrics;
use crate::window::{WindowAssigner, WindowBucket};

const IDLE_POLL_DELAY_MS: u64 = 200;
const TRANSIENT_RETRY_DELAY_MS: u64 = 500;

/// One processing attempt: a poll-assign-fire-checkpoint cycle owning the
/// source cursor and the window table, the only cross-task mutable state.
/// Snapshots happen at a single point in the loop, so every checkpoint sees
/// offsets and buckets from the same instant.
///
/// Collaborators arrive through the constructor; a fatal error tears the
/// attempt down and the restart supervisor rebuilds everything from the
/// latest checkpoint.
pub struct Pipeline<S: Source, W: WindowFunction> {
    source: S,
    window_fn: W,
    assigner: WindowAssigner,
    backend: Arc<dyn StateBackend>,
    coordinator: CheckpointCoordinator,
    offsets: SourceOffsets,
    drain_on_shutdown: bool,
    metrics: Arc<IngestMetrics>,
    run_state: watch::Sender<PipelineRunState>,
}

impl<S: Source, W: WindowFunction> Pipeline<S, W> {
    pub fn new(
        window_config: &WindowConfig,
        source: S,
        window_fn: W,
        backend: Arc<dyn StateBackend>,
        coordinator: CheckpointCoordinator,
        metrics: Arc<IngestMetrics>,
        run_state: watch::Sender<PipelineRunState>,
    ) -> Self {
        Self {
            source,
            window_fn,
            assigner: WindowAssigner::new(
                (window_config.size_seconds * 1_000) as i64,
                window_config.parallelism,
            ),
            backend,
            coordinator,
            offsets: SourceOffsets::new(),
            drain_on_shutdown: window_config.drain_on_shutdown,
            metrics,
            run_state,
        }
    }

    /// Reload the state a recovered checkpoint captured: offset cursor and
    /// pending buckets. The source is repositioned when `run` starts.
    pub fn restore(&mut self, record: &CheckpointRecord) -> std::result::Result<(), PipelineError> {
        self.offsets = record.source_offsets.clone();
        self.assigner.restore(&record.pending);
        self.backend.restore(&record.pending)?;
        info!(
            epoch = record.epoch,
            buckets = record.pending.len(),
            "restored pipeline state from checkpoint"
        );
        Ok(())
    }

    /// Drive the pipeline until shutdown is signalled or a fatal error
    /// occurs. Graceful shutdown drains or abandons open buckets per
    /// configuration and takes a final checkpoint when it can.
    pub async fn run(
        mut self,
        shutdown: watch::Receiver<bool>,
    ) -> std::result::Result<(), PipelineError> {
        if !self.offsets.is_empty() {
            self.source.seek(&self.offsets).await?;
        }
        info!("pipeline running");

        loop {
            if *shutdown.borrow() {
                break;
            }

            match self.source.poll_batch().await {
                Ok(batch) => {
                    let quiet = batch.messages.is_empty() && batch.rejected == 0;
                    self.intake(batch)?;
                    if quiet {
                        tokio::time::sleep(Duration::from_millis(IDLE_POLL_DELAY_MS)).await;
                    }
                }
                Err(SourceError::Transient { source }) => {
                    warn!(error = %source, "transient source error, retrying");
                    tokio::time::sleep(Duration::from_millis(TRANSIENT_RETRY_DELAY_MS)).await;
                }
                Err(e) => return Err(e.into()),
            }

            let now_ms = now_ms();
            self.fire_due(now_ms).await?;
            self.maybe_checkpoint(now_ms).await?;
        }

        self.shutdown().await
    }

    fn intake(&mut self, batch: PolledBatch) -> std::result::Result<(), PipelineError> {
        IngestMetrics::add(&self.metrics.intake_rejected, batch.rejected as u64);
        IngestMetrics::add(&self.metrics.messages_polled, batch.messages.len() as u64);

        let now_ms = now_ms();
        for message in batch.messages {
            let next = message.offset + 1;
            let cursor = self.offsets.entry(message.partition).or_insert(next);
            *cursor = (*cursor).max(next);

            let bucket = self.assigner.assign(message, now_ms);
            self.backend.upsert(bucket)?;
        }
        Ok(())
    }

    /// Fire every due bucket. Different keys are processed concurrently;
    /// windows of the same key stay in window order.
    async fn fire_due(&mut self, now_ms: i64) -> std::result::Result<(), PipelineError> {
        let fired = self.assigner.close_due(now_ms);
        if fired.is_empty() {
            return Ok(());
        }
        for bucket in &fired {
            self.backend.remove(&bucket.key, bucket.window_start)?;
        }

        let mut by_key: BTreeMap<String, Vec<WindowBucket>> = BTreeMap::new();
        for bucket in fired {
            by_key.entry(bucket.key.clone()).or_default().push(bucket);
        }

        let window_fn = &self.window_fn;
        let per_key = by_key.into_values().map(|buckets| async move {
            let mut results = Vec::with_capacity(buckets.len());
            for bucket in buckets {
                results.push(window_fn.process(bucket).await);
            }
            results
        });
        let outcomes = futures::future::join_all(per_key).await;

        for outcome in outcomes.into_iter().flatten() {
            let result = outcome?;
            IngestMetrics::add(&self.metrics.decode_failures, result.decode_failures as u64);
            IngestMetrics::add(
                &self.metrics.validation_failures,
                result.validation_failures as u64,
            );
            IngestMetrics::add(&self.metrics.orders_persisted, result.rows_written);
            if result.rows_written > 0 {
                IngestMetrics::incr(&self.metrics.batches_flushed);
            } else {
                IngestMetrics::incr(&self.metrics.empty_windows);
            }
        }
        Ok(())
    }

    async fn maybe_checkpoint(&mut self, now_ms: i64) -> std::result::Result<(), PipelineError> {
        if !self.coordinator.due(now_ms) {
            return Ok(());
        }

        let _ = self.run_state.send(PipelineRunState::Checkpointing);
        let result = self.checkpoint_once(now_ms).await;
        let _ = self.run_state.send(PipelineRunState::Running);

        match result {
            Ok(()) => Ok(()),
            Err(PipelineError::Checkpoint(e)) if e.is_recoverable() => {
                IngestMetrics::incr(&self.metrics.checkpoints_failed);
                warn!(error = %e, "skipping failed checkpoint, will retry next interval");
                Ok(())
            }
            Err(e) => {
                IngestMetrics::incr(&self.metrics.checkpoints_failed);
                Err(e)
            }
        }
    }

    async fn checkpoint_once(&mut self, now_ms: i64) -> std::result::Result<(), PipelineError> {
        // the loop owns both the cursor and the bucket table, so cloning them
        // back to back is the aligned snapshot point
        let offsets = self.offsets.clone();
        let pending = self.assigner.pending();
        let dirty = self.backend.dirty_buckets();

        let record = self
            .coordinator
            .run_once(offsets, pending, dirty, now_ms)
            .await?;
        self.backend.snapshot()?;

        // only now may the source acknowledge progress with the queue
        match self.source.commit(&record.source_offsets).await {
            Ok(()) => {}
            Err(SourceError::Transient { source }) => {
                warn!(error = %source, "offset commit failed, retrying at next epoch");
            }
            Err(e) => return Err(e.into()),
        }

        IngestMetrics::incr(&self.metrics.checkpoints_completed);
        Ok(())
    }

    async fn shutdown(mut self) -> std::result::Result<(), PipelineError> {
        info!("pipeline shutting down");

        if self.drain_on_shutdown {
            self.fire_due(i64::MAX).await?;
        } else if self.assigner.open_buckets() > 0 {
            warn!(
                abandoned = self.assigner.open_buckets(),
                "abandoning open buckets, the final checkpoint records them"
            );
        }

        match self.checkpoint_once(now_ms()).await {
            Ok(()) => {}
            Err(e) => warn!(error = %e, "final checkpoint failed during shutdown"),
        }

        self.coordinator.on_cancel();
        self.source.shutdown().await?;
        info!(metrics = ?self.metrics.snapshot(), "pipeline stopped");
        Ok(())
    }
}

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}
