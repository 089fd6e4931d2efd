pub mod kafka;

use std::collections::BTreeMap;

use crate::errors::SourceError;
use crate::message::InboundMessage;

/// Consumption progress per partition: the next offset to read. Committed to
/// the queue only in lock-step with a completed checkpoint.
pub type SourceOffsets = BTreeMap<i32, i64>;

/// One poll's worth of gated messages. `rejected` counts records that failed
/// the intake gate (empty payload, missing header, unknown message type) and
/// were dropped before window assignment.
#[derive(Debug, Default)]
pub struct PolledBatch {
    pub messages: Vec<InboundMessage>,
    pub rejected: usize,
}

/// A restartable queue consumer.
///
/// Progress is never acknowledged from inside `poll_batch`; the checkpoint
/// coordinator drives `commit` once an epoch is durable, so a restart
/// re-delivers everything after the last completed checkpoint.
pub trait Source: Send {
    /// Receive the next batch of messages. Blocks until messages are
    /// available or the poll timeout elapses; an empty batch means a quiet
    /// topic, not end of stream.
    async fn poll_batch(&mut self) -> std::result::Result<PolledBatch, SourceError>;

    /// Durably acknowledge consumption progress with the queue.
    async fn commit(&mut self, offsets: &SourceOffsets) -> std::result::Result<(), SourceError>;

    /// Reposition to the offsets recorded in a recovered checkpoint.
    async fn seek(&mut self, offsets: &SourceOffsets) -> std::result::Result<(), SourceError>;

    /// Close the connection during graceful shutdown.
    async fn shutdown(&mut self) -> std::result::Result<(), SourceError>;
}
