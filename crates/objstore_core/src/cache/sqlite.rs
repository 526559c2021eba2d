//! SQLite cache backend.
//!
//! # Invariants
//! - Values are stored as JSON text in `cache.value`.
//! - Expired rows are deleted on access and on every `set`.

use crate::cache::{expires_at, prefixed, CacheBackend};
use crate::db::migrations::{apply_migrations, CACHE_MIGRATIONS};
use crate::db::{open_db, open_db_in_memory};
use crate::error::{BackendError, CoreResult};
use crate::utils::now_millis;
use log::info;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;
use std::path::Path;

/// Cache persisted in SQLite.
pub struct SqliteCache {
    prefix: String,
    conn: Mutex<Connection>,
}

impl SqliteCache {
    /// Wraps an open connection. Call `initialize_schema` before use.
    pub fn new(conn: Connection, prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            conn: Mutex::new(conn),
        }
    }

    pub fn open(path: impl AsRef<Path>, prefix: impl Into<String>) -> CoreResult<Self> {
        Ok(Self::new(open_db(path)?, prefix))
    }

    pub fn open_in_memory(prefix: impl Into<String>) -> CoreResult<Self> {
        Ok(Self::new(open_db_in_memory()?, prefix))
    }
}

/// Reads a live row, deleting it when expired.
fn live_row(conn: &Connection, key: &str, now: i64) -> CoreResult<Option<(Value, i64)>> {
    let row: Option<(String, i64)> = conn
        .query_row(
            "SELECT value, expires_at FROM cache WHERE key = ?1;",
            [key],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?;

    let Some((text, expires)) = row else {
        return Ok(None);
    };
    if expires <= now {
        conn.execute("DELETE FROM cache WHERE key = ?1;", [key])?;
        return Ok(None);
    }
    let value = serde_json::from_str(&text).map_err(BackendError::from)?;
    Ok(Some((value, expires)))
}

impl CacheBackend for SqliteCache {
    fn initialize_schema(&self, dry_run: bool) -> CoreResult<()> {
        let mut conn = self.conn.lock();
        apply_migrations(&mut conn, &CACHE_MIGRATIONS, dry_run)?;
        Ok(())
    }

    fn flush(&self) -> CoreResult<()> {
        let conn = self.conn.lock();
        let removed = conn.execute(
            "DELETE FROM cache WHERE substr(key, 1, length(?1)) = ?1;",
            [&self.prefix],
        )?;
        info!(
            "event=flush module=cache status=ok backend=sqlite removed={}",
            removed
        );
        Ok(())
    }

    fn set(&self, key: &str, value: &Value, ttl_ms: i64) -> CoreResult<()> {
        let now = now_millis();
        let text = serde_json::to_string(value).map_err(BackendError::from)?;
        let conn = self.conn.lock();
        conn.execute("DELETE FROM cache WHERE expires_at <= ?1;", [now])?;
        conn.execute(
            "INSERT INTO cache (key, value, expires_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET
                value = excluded.value,
                expires_at = excluded.expires_at;",
            params![prefixed(&self.prefix, key), text, expires_at(now, ttl_ms)],
        )?;
        Ok(())
    }

    fn get(&self, key: &str) -> CoreResult<Option<Value>> {
        let conn = self.conn.lock();
        let row = live_row(&conn, &prefixed(&self.prefix, key), now_millis())?;
        Ok(row.map(|(value, _)| value))
    }

    fn delete(&self, key: &str) -> CoreResult<Option<Value>> {
        let key = prefixed(&self.prefix, key);
        let conn = self.conn.lock();
        let row = live_row(&conn, &key, now_millis())?;
        conn.execute("DELETE FROM cache WHERE key = ?1;", [&key])?;
        Ok(row.map(|(value, _)| value))
    }

    fn ttl(&self, key: &str) -> CoreResult<Option<i64>> {
        let now = now_millis();
        let conn = self.conn.lock();
        let row = live_row(&conn, &prefixed(&self.prefix, key), now)?;
        Ok(row.map(|(_, expires)| expires - now))
    }

    fn expire(&self, key: &str, ttl_ms: i64) -> CoreResult<()> {
        let now = now_millis();
        let key = prefixed(&self.prefix, key);
        let conn = self.conn.lock();
        if live_row(&conn, &key, now)?.is_some() {
            conn.execute(
                "UPDATE cache SET expires_at = ?2 WHERE key = ?1;",
                params![key, expires_at(now, ttl_ms)],
            )?;
        }
        Ok(())
    }
}
