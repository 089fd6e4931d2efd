use std::collections::BTreeSet;
use std::sync::Mutex;

use rusqlite::{Connection, params};

use crate::config::{StateBackendKind, StateConfig};
use crate::errors::StateError;
use crate::state::StateBackend;
use crate::window::{PendingWindows, WindowBucket};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS pending_windows (
    part_key     TEXT NOT NULL,
    window_start INTEGER NOT NULL,
    bucket       TEXT NOT NULL,
    PRIMARY KEY (part_key, window_start)
);
";

struct Inner {
    conn: Connection,
    dirty: BTreeSet<(String, i64)>,
}

/// Window state persisted to a sqlite file as it mutates.
///
/// Every upsert/remove hits disk, so the file itself survives a crash and a
/// snapshot is cheap: with `incremental` on, only the buckets dirtied since
/// the previous epoch were written in the meantime; with it off, `snapshot`
/// rewrites the whole table the way a full-snapshot backend would.
pub struct DurableStateBackend {
    inner: Mutex<Inner>,
    incremental: bool,
}

impl DurableStateBackend {
    pub fn open(config: &StateConfig) -> std::result::Result<Self, StateError> {
        let path = config
            .path
            .as_ref()
            .ok_or_else(|| StateError::Storage(rusqlite::Error::InvalidPath("durable state backend requires a path".into())))?;
        let conn = Connection::open(path)?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            inner: Mutex::new(Inner {
                conn,
                dirty: BTreeSet::new(),
            }),
            incremental: config.incremental,
        })
    }

    fn lock(&self) -> std::result::Result<std::sync::MutexGuard<'_, Inner>, StateError> {
        self.inner.lock().map_err(|_| StateError::Poisoned)
    }

    fn read_all(conn: &Connection) -> std::result::Result<PendingWindows, StateError> {
        let mut stmt = conn.prepare(
            "SELECT bucket FROM pending_windows ORDER BY part_key, window_start",
        )?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;

        let mut buckets = Vec::new();
        for raw in rows {
            let bucket: WindowBucket = serde_json::from_str(&raw?)?;
            buckets.push(bucket);
        }
        Ok(PendingWindows { buckets })
    }

    fn write_all(
        inner: &mut Inner,
        pending: &PendingWindows,
    ) -> std::result::Result<(), StateError> {
        let tx = inner.conn.transaction()?;
        tx.execute("DELETE FROM pending_windows", [])?;
        for bucket in &pending.buckets {
            tx.execute(
                "INSERT INTO pending_windows (part_key, window_start, bucket) VALUES (?1, ?2, ?3)",
                params![bucket.key, bucket.window_start, serde_json::to_string(bucket)?],
            )?;
        }
        tx.commit()?;
        inner.dirty.clear();
        Ok(())
    }
}

impl StateBackend for DurableStateBackend {
    fn kind(&self) -> StateBackendKind {
        StateBackendKind::Durable
    }

    fn upsert(&self, bucket: &WindowBucket) -> std::result::Result<(), StateError> {
        let mut inner = self.lock()?;
        inner.conn.execute(
            "INSERT INTO pending_windows (part_key, window_start, bucket) VALUES (?1, ?2, ?3)
             ON CONFLICT(part_key, window_start) DO UPDATE SET bucket = excluded.bucket",
            params![bucket.key, bucket.window_start, serde_json::to_string(bucket)?],
        )?;
        inner.dirty.insert((bucket.key.clone(), bucket.window_start));
        Ok(())
    }

    fn remove(&self, key: &str, window_start: i64) -> std::result::Result<(), StateError> {
        let mut inner = self.lock()?;
        inner.conn.execute(
            "DELETE FROM pending_windows WHERE part_key = ?1 AND window_start = ?2",
            params![key, window_start],
        )?;
        inner.dirty.insert((key.to_string(), window_start));
        Ok(())
    }

    fn snapshot(&self) -> std::result::Result<PendingWindows, StateError> {
        let mut inner = self.lock()?;
        let pending = Self::read_all(&inner.conn)?;
        if self.incremental {
            inner.dirty.clear();
        } else {
            Self::write_all(&mut inner, &pending)?;
        }
        Ok(pending)
    }

    fn restore(&self, pending: &PendingWindows) -> std::result::Result<(), StateError> {
        let mut inner = self.lock()?;
        Self::write_all(&mut inner, pending)
    }

    fn dirty_buckets(&self) -> usize {
        self.lock().map(|inner| inner.dirty.len()).unwrap_or(0)
    }
}
