// src/core/control/store.rs

//! The Control Store: a single embedded SQLite database holding the kernel's
//! `meta`, `auth_state`, `remote_config` and `apps` tables. Every write goes
//! through `commit`, which assigns a monotonically increasing per-table
//! revision and stamps the row with a SHA-256 checksum of its canonical JSON
//! payload, so followers and export consumers can detect tampering or
//! truncation independent of SQLite's own integrity checks.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use rusqlite::Connection;
use sha2::{Digest, Sha256};
use tracing::info;

use crate::core::errors::PiccoloError;

const TABLES: [&str; 4] = ["meta", "auth_state", "remote_config", "apps"];

#[derive(Debug, Clone)]
pub struct CommitRecord {
    pub table: String,
    pub key: String,
    pub revision: u64,
    pub payload: serde_json::Value,
    pub checksum: String,
}

pub struct ControlStore {
    conn: Mutex<Connection>,
    path: PathBuf,
    read_only: AtomicBool,
}

impl ControlStore {
    /// Opens (creating if absent) the control store at `path`. `read_only`
    /// reflects whether the underlying volume is currently mounted
    /// read-write (follower nodes mount their copy read-only).
    pub fn open(path: PathBuf, read_only: bool) -> Result<Self, PiccoloError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(&path)?;
        conn.pragma_update(None, "journal_mode", "wal")?;
        let store = Self {
            conn: Mutex::new(conn),
            path,
            read_only: AtomicBool::new(false),
        };
        store.migrate()?;
        store.set_read_only(read_only)?;
        Ok(store)
    }

    fn migrate(&self) -> Result<(), PiccoloError> {
        let conn = self.conn.lock();
        for table in TABLES {
            conn.execute(
                &format!(
                    "CREATE TABLE IF NOT EXISTS {table} (
                        key TEXT NOT NULL,
                        revision INTEGER NOT NULL,
                        payload TEXT NOT NULL,
                        checksum TEXT NOT NULL,
                        PRIMARY KEY (key, revision)
                    )"
                ),
                [],
            )?;
        }
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only.load(Ordering::SeqCst)
    }

    /// Switches the connection between writable and `PRAGMA query_only`
    /// modes, mirroring the read/write state of the underlying host mount.
    pub fn set_read_only(&self, read_only: bool) -> Result<(), PiccoloError> {
        let conn = self.conn.lock();
        conn.pragma_update(None, "query_only", read_only)?;
        self.read_only.store(read_only, Ordering::SeqCst);
        info!(read_only, "control store mode switched");
        Ok(())
    }

    /// Commits `payload` under `table`/`key`, assigning the next revision for
    /// that key and stamping it with a SHA-256 checksum of the canonical
    /// (key-sorted) JSON encoding.
    pub fn commit(
        &self,
        table: &str,
        key: &str,
        payload: &serde_json::Value,
    ) -> Result<CommitRecord, PiccoloError> {
        if !TABLES.contains(&table) {
            return Err(PiccoloError::InvalidInput(format!("unknown control table '{table}'")));
        }
        if self.is_read_only() {
            return Err(PiccoloError::Locked);
        }

        let canonical = canonical_json(payload)?;
        let checksum = hex::encode(Sha256::digest(canonical.as_bytes()));

        let conn = self.conn.lock();
        let tx = conn.unchecked_transaction()?;
        let next_revision: u64 = tx.query_row(
            &format!("SELECT COALESCE(MAX(revision), 0) + 1 FROM {table} WHERE key = ?1"),
            [key],
            |row| row.get::<_, i64>(0),
        )? as u64;
        tx.execute(
            &format!("INSERT INTO {table} (key, revision, payload, checksum) VALUES (?1, ?2, ?3, ?4)"),
            rusqlite::params![key, next_revision as i64, canonical, checksum],
        )?;
        tx.commit()?;

        Ok(CommitRecord {
            table: table.to_string(),
            key: key.to_string(),
            revision: next_revision,
            payload: payload.clone(),
            checksum,
        })
    }

    pub fn latest(&self, table: &str, key: &str) -> Result<Option<CommitRecord>, PiccoloError> {
        if !TABLES.contains(&table) {
            return Err(PiccoloError::InvalidInput(format!("unknown control table '{table}'")));
        }
        let conn = self.conn.lock();
        let result = conn.query_row(
            &format!(
                "SELECT revision, payload, checksum FROM {table} WHERE key = ?1 ORDER BY revision DESC LIMIT 1"
            ),
            [key],
            |row| {
                let revision: i64 = row.get(0)?;
                let payload_str: String = row.get(1)?;
                let checksum: String = row.get(2)?;
                Ok((revision as u64, payload_str, checksum))
            },
        );
        match result {
            Ok((revision, payload_str, checksum)) => {
                let payload = serde_json::from_str(&payload_str)?;
                Ok(Some(CommitRecord {
                    table: table.to_string(),
                    key: key.to_string(),
                    revision,
                    payload,
                    checksum,
                }))
            }
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// The highest revision committed across all keys of `table`, used by the
    /// follower poller to detect new commits without re-reading every key.
    pub fn table_high_water_mark(&self, table: &str) -> Result<u64, PiccoloError> {
        if !TABLES.contains(&table) {
            return Err(PiccoloError::InvalidInput(format!("unknown control table '{table}'")));
        }
        let conn = self.conn.lock();
        let revision: i64 = conn.query_row(
            &format!("SELECT COALESCE(MAX(revision), 0) FROM {table}"),
            [],
            |row| row.get(0),
        )?;
        Ok(revision as u64)
    }

    /// Runs `PRAGMA quick_check` and reports whether the database is intact.
    pub fn quick_check(&self) -> Result<bool, PiccoloError> {
        let conn = self.conn.lock();
        let result: String = conn.query_row("PRAGMA quick_check", [], |row| row.get(0))?;
        Ok(result == "ok")
    }

    pub fn checkpoint(&self) -> Result<(), PiccoloError> {
        let conn = self.conn.lock();
        conn.pragma_update(None, "wal_checkpoint", "PASSIVE")?;
        Ok(())
    }
}

/// Serializes `value` with object keys sorted, so the same logical payload
/// always hashes to the same checksum regardless of construction order.
fn canonical_json(value: &serde_json::Value) -> Result<String, PiccoloError> {
    fn sort(value: &serde_json::Value) -> serde_json::Value {
        match value {
            serde_json::Value::Object(map) => {
                let mut sorted = serde_json::Map::new();
                let mut keys: Vec<&String> = map.keys().collect();
                keys.sort();
                for k in keys {
                    sorted.insert(k.clone(), sort(&map[k]));
                }
                serde_json::Value::Object(sorted)
            }
            serde_json::Value::Array(items) => {
                serde_json::Value::Array(items.iter().map(sort).collect())
            }
            other => other.clone(),
        }
    }
    Ok(serde_json::to_string(&sort(value))?)
}
