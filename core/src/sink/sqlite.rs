use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use rust_decimal::Decimal;
use tracing::debug;

use crate::decode::ParsedOrder;
use crate::errors::SinkError;
use crate::sink::{OrderSink, StoredOrder};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS orders (
    id            INTEGER PRIMARY KEY AUTOINCREMENT,
    order_id      TEXT NOT NULL UNIQUE,
    company_id    TEXT NOT NULL,
    customer_name TEXT,
    total_amount  TEXT,
    status        TEXT,
    created_at    TEXT NOT NULL,
    updated_at    TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_orders_company_id ON orders (company_id);
";

const UPSERT: &str = "
INSERT INTO orders (order_id, company_id, customer_name, total_amount, status, created_at, updated_at)
VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)
ON CONFLICT(order_id) DO UPDATE SET
    company_id    = excluded.company_id,
    customer_name = excluded.customer_name,
    total_amount  = excluded.total_amount,
    status        = excluded.status,
    updated_at    = excluded.updated_at
";

/// Relational sink backed by a sqlite database file. One transaction per
/// batch; order ids carry a unique constraint so replayed batches update in
/// place instead of inserting twice.
pub struct SqliteOrderSink {
    conn: Mutex<Connection>,
}

impl SqliteOrderSink {
    pub fn open(path: &Path) -> std::result::Result<Self, SinkError> {
        let conn = Connection::open(path)?;
        Self::with_connection(conn)
    }

    pub fn in_memory() -> std::result::Result<Self, SinkError> {
        let conn = Connection::open_in_memory()?;
        Self::with_connection(conn)
    }

    fn with_connection(conn: Connection) -> std::result::Result<Self, SinkError> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> std::result::Result<std::sync::MutexGuard<'_, Connection>, SinkError> {
        self.conn.lock().map_err(|_| SinkError::Write {
            reason: "sink connection mutex poisoned".to_string(),
        })
    }
}

impl OrderSink for SqliteOrderSink {
    fn write_batch(&self, orders: &[ParsedOrder]) -> std::result::Result<u64, SinkError> {
        if orders.is_empty() {
            return Ok(0);
        }

        let now = Utc::now().to_rfc3339();
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        for order in orders {
            tx.execute(
                UPSERT,
                params![
                    order.order_id,
                    order.company_id,
                    order.customer_name,
                    order.total_amount.map(|a| a.to_string()),
                    order.status,
                    now,
                ],
            )?;
        }
        tx.commit()?;

        debug!(rows = orders.len(), "committed order batch");
        Ok(orders.len() as u64)
    }

    fn fetch(&self, order_id: &str) -> std::result::Result<Option<StoredOrder>, SinkError> {
        let conn = self.lock()?;
        let row = conn
            .query_row(
                "SELECT order_id, company_id, customer_name, total_amount, status,
                        created_at, updated_at
                 FROM orders WHERE order_id = ?1",
                params![order_id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, Option<String>>(2)?,
                        row.get::<_, Option<String>>(3)?,
                        row.get::<_, Option<String>>(4)?,
                        row.get::<_, String>(5)?,
                        row.get::<_, String>(6)?,
                    ))
                },
            )
            .optional()?;

        let Some((order_id, company_id, customer_name, amount, status, created, updated)) = row
        else {
            return Ok(None);
        };

        let total_amount = match amount {
            Some(raw) => Some(raw.parse::<Decimal>().map_err(|e| SinkError::Write {
                reason: format!("stored amount is not a decimal: {e}"),
            })?),
            None => None,
        };

        Ok(Some(StoredOrder {
            order: ParsedOrder {
                order_id,
                company_id,
                customer_name: customer_name.unwrap_or_default(),
                total_amount,
                status: status.unwrap_or_default(),
            },
            created_at: parse_timestamp(&created)?,
            updated_at: parse_timestamp(&updated)?,
        }))
    }
}

fn parse_timestamp(raw: &str) -> std::result::Result<DateTime<Utc>, SinkError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| SinkError::Write {
            reason: format!("stored timestamp is not RFC3339: {e}"),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn order(id: &str, amount: &str) -> ParsedOrder {
        ParsedOrder {
            order_id: id.to_string(),
            company_id: "COMP000001".to_string(),
            customer_name: "John Doe".to_string(),
            total_amount: Some(amount.parse().unwrap()),
            status: "PENDING".to_string(),
        }
    }

    #[test]
    fn round_trips_a_batch() {
        let sink = SqliteOrderSink::in_memory().unwrap();
        let written = sink
            .write_batch(&[order("ORDER001", "100.00"), order("ORDER002", "0")])
            .unwrap();
        assert_eq!(written, 2);

        let stored = sink.fetch("ORDER001").unwrap().unwrap();
        assert_eq!(stored.order, order("ORDER001", "100.00"));
        assert_eq!(stored.created_at, stored.updated_at);

        assert!(sink.fetch("ORDER999").unwrap().is_none());
    }

    #[test]
    fn replayed_batch_does_not_duplicate_rows() {
        let sink = SqliteOrderSink::in_memory().unwrap();
        sink.write_batch(&[order("ORDER001", "100.00")]).unwrap();
        let first = sink.fetch("ORDER001").unwrap().unwrap();

        // same batch again, as after a restart from an earlier checkpoint
        sink.write_batch(&[order("ORDER001", "100.00")]).unwrap();

        let conn = sink.conn.lock().unwrap();
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM orders", [], |r| r.get(0))
            .unwrap();
        drop(conn);
        assert_eq!(count, 1);

        let second = sink.fetch("ORDER001").unwrap().unwrap();
        assert_eq!(second.created_at, first.created_at);
        assert!(second.updated_at >= first.updated_at);
    }

    #[test]
    fn empty_batch_is_a_noop() {
        let sink = SqliteOrderSink::in_memory().unwrap();
        assert_eq!(sink.write_batch(&[]).unwrap(), 0);
    }
}
