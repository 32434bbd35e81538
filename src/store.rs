//! SQLite persistence for exported recommendation state.

use anyhow::{Context, Result};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;
use std::path::Path;

/// Keeps the latest exported discovery state in a single row.
///
/// The connection sits behind a sync mutex so no guard is held across an
/// `.await`.
pub struct StateStore {
    conn: Mutex<Connection>,
}

impl StateStore {
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self> {
        let db_path = db_path.as_ref();
        if let Some(dir) = db_path.parent().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create store dir: {}", dir.display()))?;
        }

        let conn = Connection::open(db_path)
            .with_context(|| format!("Failed to open state DB: {}", db_path.display()))?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous  = NORMAL;
             CREATE TABLE IF NOT EXISTS discovery_state (
                 id       INTEGER PRIMARY KEY CHECK (id = 1),
                 state    TEXT NOT NULL,
                 saved_at INTEGER NOT NULL
             );",
        )?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn save(&self, state: &Value) -> Result<()> {
        let json = serde_json::to_string(state)?;
        let conn = self.conn.lock();
        conn.execute(
            "INSERT OR REPLACE INTO discovery_state (id, state, saved_at) VALUES (1, ?1, ?2)",
            params![json, chrono::Utc::now().timestamp()],
        )?;
        Ok(())
    }

    /// The last saved state. A row that no longer parses is reported as
    /// absent.
    pub fn load(&self) -> Result<Option<Value>> {
        let raw: Option<String> = {
            let conn = self.conn.lock();
            conn.query_row("SELECT state FROM discovery_state WHERE id = 1", [], |row| {
                row.get(0)
            })
            .optional()?
        };

        Ok(raw.and_then(|json| match serde_json::from_str(&json) {
            Ok(value) => Some(value),
            Err(e) => {
                tracing::warn!("Ignoring unreadable saved discovery state: {e}");
                None
            }
        }))
    }
}
