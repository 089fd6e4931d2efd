use std::collections::BTreeMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use chrono::Utc;

use crate::decode::ParsedOrder;
use crate::errors::SinkError;
use crate::sink::{OrderSink, StoredOrder};

/// In-memory sink for tests and dry runs. Supports injecting write failures
/// to exercise the restart path.
#[derive(Default)]
pub struct MemoryOrderSink {
    rows: Mutex<BTreeMap<String, StoredOrder>>,
    write_calls: AtomicU64,
    fail_remaining: AtomicU32,
}

impl MemoryOrderSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` write_batch calls fail before touching any row.
    pub fn fail_next_writes(&self, n: u32) {
        self.fail_remaining.store(n, Ordering::SeqCst);
    }

    pub fn write_calls(&self) -> u64 {
        self.write_calls.load(Ordering::SeqCst)
    }

    pub fn len(&self) -> usize {
        self.rows.lock().map(|r| r.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl OrderSink for MemoryOrderSink {
    fn write_batch(&self, orders: &[ParsedOrder]) -> std::result::Result<u64, SinkError> {
        if orders.is_empty() {
            return Ok(0);
        }
        self.write_calls.fetch_add(1, Ordering::SeqCst);

        let remaining = self.fail_remaining.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_remaining.store(remaining - 1, Ordering::SeqCst);
            return Err(SinkError::Write {
                reason: "injected write failure".to_string(),
            });
        }

        let now = Utc::now();
        let mut rows = self.rows.lock().map_err(|_| SinkError::Write {
            reason: "sink mutex poisoned".to_string(),
        })?;
        for order in orders {
            match rows.get_mut(&order.order_id) {
                Some(existing) => {
                    existing.order = order.clone();
                    existing.updated_at = now;
                }
                None => {
                    rows.insert(
                        order.order_id.clone(),
                        StoredOrder {
                            order: order.clone(),
                            created_at: now,
                            updated_at: now,
                        },
                    );
                }
            }
        }
        Ok(orders.len() as u64)
    }

    fn fetch(&self, order_id: &str) -> std::result::Result<Option<StoredOrder>, SinkError> {
        let rows = self.rows.lock().map_err(|_| SinkError::Write {
            reason: "sink mutex poisoned".to_string(),
        })?;
        Ok(rows.get(order_id).cloned())
    }
}
