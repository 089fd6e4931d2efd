pub mod memory;
pub mod sqlite;

use chrono::{DateTime, Utc};

use crate::decode::ParsedOrder;
use crate::errors::SinkError;

/// A persisted order row, timestamps assigned by the sink.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredOrder {
    pub order: ParsedOrder,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Durable destination for validated orders.
///
/// `write_batch` is all-or-nothing: either every order in the slice is
/// committed or none is. Writes are keyed on the order id, so replaying a
/// batch after a restart updates rows instead of duplicating them.
pub trait OrderSink: Send + Sync {
    fn write_batch(&self, orders: &[ParsedOrder]) -> std::result::Result<u64, SinkError>;

    /// Look a persisted order up by its order id.
    fn fetch(&self, order_id: &str) -> std::result::Result<Option<StoredOrder>, SinkError>;
}
