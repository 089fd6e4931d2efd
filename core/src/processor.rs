use std::sync::Arc;

use tracing::{debug, info};

use crate::decode::OrderDecoder;
use crate::errors::ProcessorError;
use crate::sink::OrderSink;
use crate::validate::OrderValidator;
use crate::window::WindowBucket;

/// Outcome of one fired window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchResult {
    pub key: String,
    pub window_start: i64,
    pub window_end: i64,
    pub valid: usize,
    pub decode_failures: usize,
    pub validation_failures: usize,
    pub rows_written: u64,
}

impl BatchResult {
    pub fn invalid(&self) -> usize {
        self.decode_failures + self.validation_failures
    }
}

/// The one capability a fired window needs: turn a bucket of messages into a
/// batch outcome. Implemented by plain value types; no lifecycle hooks.
pub trait WindowFunction: Send + Sync {
    fn process(
        &self,
        bucket: WindowBucket,
    ) -> impl Future<Output = std::result::Result<BatchResult, ProcessorError>> + Send;
}

/// Decode, validate and persist one window's messages as a unit.
///
/// Collaborators are injected at construction. Records that fail to decode or
/// validate are dropped and counted, never retried; all surviving records go
/// to the sink in exactly one write call. A sink failure condemns the whole
/// bucket and aborts the processing attempt.
pub struct BatchProcessor<D> {
    decoder: D,
    validator: OrderValidator,
    sink: Arc<dyn OrderSink>,
}

impl<D: OrderDecoder> BatchProcessor<D> {
    pub fn new(decoder: D, validator: OrderValidator, sink: Arc<dyn OrderSink>) -> Self {
        Self {
            decoder,
            validator,
            sink,
        }
    }
}

impl<D: OrderDecoder> WindowFunction for BatchProcessor<D> {
    async fn process(
        &self,
        bucket: WindowBucket,
    ) -> std::result::Result<BatchResult, ProcessorError> {
        let mut orders = Vec::with_capacity(bucket.members.len());
        let mut decode_failures = 0usize;
        let mut validation_failures = 0usize;

        for message in &bucket.members {
            let order = match self.decoder.decode(message) {
                Ok(order) => order,
                Err(e) => {
                    debug!(
                        partition = message.partition,
                        offset = message.offset,
                        error = %e,
                        "dropping undecodable record"
                    );
                    decode_failures += 1;
                    continue;
                }
            };
            match self.validator.validate(&order) {
                Ok(()) => orders.push(order),
                Err(e) => {
                    debug!(order_id = %order.order_id, error = %e, "dropping invalid record");
                    validation_failures += 1;
                }
            }
        }

        let rows_written = if orders.is_empty() {
            0
        } else {
            self.sink
                .write_batch(&orders)
                .map_err(|source| ProcessorError::Persistence {
                    key: bucket.key.clone(),
                    window_start: bucket.window_start,
                    window_end: bucket.window_end,
                    source,
                })?
        };

        let result = BatchResult {
            key: bucket.key,
            window_start: bucket.window_start,
            window_end: bucket.window_end,
            valid: orders.len(),
            decode_failures,
            validation_failures,
            rows_written,
        };
        info!(
            key = %result.key,
            window_start = result.window_start,
            valid = result.valid,
            invalid = result.invalid(),
            rows = result.rows_written,
            "processed window batch"
        );
        Ok(result)
    }
}
