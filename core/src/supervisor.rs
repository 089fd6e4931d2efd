use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::config::RestartConfig;
use crate::errors::{PipelineError, SupervisorError};
use crate::telemetry::IngestMetrics;

/// Process-wide pipeline lifecycle, published on a watch channel. Written
/// only by the restart supervisor and the checkpoint coordinator path inside
/// the run loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PipelineRunState {
    Starting,
    Running,
    Checkpointing,
    Failed,
    Restarting,
    Stopped,
}

#[derive(Debug, Clone)]
pub struct RestartPolicy {
    pub max_attempts: u32,
    pub delay: Duration,
}

impl From<&RestartConfig> for RestartPolicy {
    fn from(config: &RestartConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            delay: Duration::from_millis(config.delay_ms),
        }
    }
}

/// Fixed-delay restart supervision around the whole pipeline.
///
/// Each fatal attempt failure consumes one restart from a bounded budget; the
/// budget refills when an attempt makes checkpoint progress before dying.
/// Exhausting it parks the pipeline in a terminal stopped state that needs
/// operator intervention.
pub struct RestartSupervisor {
    policy: RestartPolicy,
    state_tx: watch::Sender<PipelineRunState>,
}

impl RestartSupervisor {
    pub fn new(policy: RestartPolicy) -> (Self, watch::Receiver<PipelineRunState>) {
        let (state_tx, state_rx) = watch::channel(PipelineRunState::Starting);
        (Self { policy, state_tx }, state_rx)
    }

    /// Handle the run loop uses to flag checkpoint alignment phases.
    pub fn state_handle(&self) -> watch::Sender<PipelineRunState> {
        self.state_tx.clone()
    }

    /// Run `attempt_fn` until it returns cleanly or the restart budget is
    /// exhausted. The closure builds a fresh pipeline from the latest
    /// checkpoint on every call; a clean return means graceful shutdown.
    pub async fn supervise<F, Fut>(
        &self,
        metrics: Arc<IngestMetrics>,
        mut attempt_fn: F,
    ) -> std::result::Result<(), SupervisorError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = std::result::Result<(), PipelineError>>,
    {
        let mut attempt: u32 = 0;
        let mut restarts_used: u32 = 0;

        loop {
            self.set(if attempt == 0 {
                PipelineRunState::Starting
            } else {
                PipelineRunState::Restarting
            });

            let progress_before = metrics.snapshot().checkpoints_completed;
            self.set(PipelineRunState::Running);

            match attempt_fn(attempt).await {
                Ok(()) => {
                    info!(attempt, "pipeline stopped cleanly");
                    self.set(PipelineRunState::Stopped);
                    return Ok(());
                }
                Err(e) => {
                    self.set(PipelineRunState::Failed);

                    let progressed =
                        metrics.snapshot().checkpoints_completed > progress_before;
                    if progressed {
                        restarts_used = 0;
                    }

                    if restarts_used >= self.policy.max_attempts {
                        error!(
                            attempts = restarts_used,
                            error = %e,
                            "restart budget exhausted, operator intervention required"
                        );
                        self.set(PipelineRunState::Stopped);
                        return Err(SupervisorError::RestartsExhausted {
                            attempts: restarts_used,
                            last_error: e.to_string(),
                        });
                    }

                    restarts_used += 1;
                    attempt += 1;
                    IngestMetrics::incr(&metrics.restarts);
                    warn!(
                        attempt,
                        restarts_used,
                        max = self.policy.max_attempts,
                        delay_ms = self.policy.delay.as_millis() as u64,
                        error = %e,
                        "pipeline failed, restarting from latest checkpoint"
                    );
                    tokio::time::sleep(self.policy.delay).await;
                }
            }
        }
    }

    fn set(&self, state: PipelineRunState) {
        let _ = self.state_tx.send(state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::{ProcessorError, SinkError};
    use std::sync::atomic::{AtomicU32, Ordering};

    fn policy(max_attempts: u32) -> RestartPolicy {
        RestartPolicy {
            max_attempts,
            delay: Duration::from_millis(1),
        }
    }

    fn persistence_failure() -> PipelineError {
        PipelineError::Processor(ProcessorError::Persistence {
            key: "key-0".to_string(),
            window_start: 0,
            window_end: 5_000,
            source: SinkError::Write {
                reason: "db down".to_string(),
            },
        })
    }

    #[tokio::test]
    async fn recovers_after_transient_attempt_failures() {
        let (supervisor, state_rx) = RestartSupervisor::new(policy(3));
        let metrics = Arc::new(IngestMetrics::default());
        let calls = AtomicU32::new(0);

        let result = supervisor
            .supervise(metrics.clone(), |_| {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(persistence_failure())
                    } else {
                        Ok(())
                    }
                }
            })
            .await;

        assert!(result.is_ok());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(metrics.snapshot().restarts, 2);
        assert_eq!(*state_rx.borrow(), PipelineRunState::Stopped);
    }

    #[tokio::test]
    async fn exhausting_the_budget_is_terminal() {
        let (supervisor, state_rx) = RestartSupervisor::new(policy(2));
        let metrics = Arc::new(IngestMetrics::default());
        let calls = AtomicU32::new(0);

        let result = supervisor
            .supervise(metrics, |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(persistence_failure()) }
            })
            .await;

        match result {
            Err(SupervisorError::RestartsExhausted { attempts, .. }) => {
                assert_eq!(attempts, 2)
            }
            other => panic!("expected exhausted restarts, got {other:?}"),
        }
        // initial run plus two restarts
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(*state_rx.borrow(), PipelineRunState::Stopped);
    }

    #[tokio::test]
    async fn checkpoint_progress_refills_the_budget() {
        let (supervisor, _state_rx) = RestartSupervisor::new(policy(1));
        let metrics = Arc::new(IngestMetrics::default());
        let calls = AtomicU32::new(0);

        let result = supervisor
            .supervise(metrics.clone(), |_| {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                let metrics = metrics.clone();
                async move {
                    match n {
                        // dies, but only after completing a checkpoint
                        0 | 1 => {
                            IngestMetrics::incr(&metrics.checkpoints_completed);
                            Err(persistence_failure())
                        }
                        _ => Ok(()),
                    }
                }
            })
            .await;

        // a budget of one restart still survives two failures because each
        // made checkpoint progress first
        assert!(result.is_ok());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
