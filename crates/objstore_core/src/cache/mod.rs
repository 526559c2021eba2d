//! Cache backend contract.
//!
//! # Responsibility
//! - Provide a TTL key/value store for higher layers (sessions, rendered
//!   responses, rate counters).
//!
//! # Invariants
//! - Every key is stored under the configured prefix.
//! - An expired entry is never returned; it is removed on the next access.

use crate::error::CoreResult;
use serde_json::Value;

pub mod memory;
pub mod sqlite;

pub use memory::MemoryCache;
pub use sqlite::SqliteCache;

/// Key/value store with per-entry expiry in milliseconds.
pub trait CacheBackend: Send + Sync {
    /// Creates backend structures; `dry_run` only reports pending steps.
    fn initialize_schema(&self, dry_run: bool) -> CoreResult<()>;

    /// Removes every entry under this cache's prefix.
    fn flush(&self) -> CoreResult<()>;

    /// Stores `value` for `ttl_ms` milliseconds, replacing any previous entry.
    fn set(&self, key: &str, value: &Value, ttl_ms: i64) -> CoreResult<()>;

    fn get(&self, key: &str) -> CoreResult<Option<Value>>;

    /// Removes `key` and returns the value it held, if still live.
    fn delete(&self, key: &str) -> CoreResult<Option<Value>>;

    /// Remaining lifetime of `key` in milliseconds.
    fn ttl(&self, key: &str) -> CoreResult<Option<i64>>;

    /// Resets the lifetime of a live `key`; missing keys are ignored.
    fn expire(&self, key: &str, ttl_ms: i64) -> CoreResult<()>;
}

pub(crate) fn prefixed(prefix: &str, key: &str) -> String {
    format!("{prefix}{key}")
}

pub(crate) fn expires_at(now: i64, ttl_ms: i64) -> i64 {
    now.saturating_add(ttl_ms)
}
