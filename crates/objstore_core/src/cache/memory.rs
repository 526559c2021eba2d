//! In-process cache backend.

use crate::cache::{expires_at, prefixed, CacheBackend};
use crate::error::CoreResult;
use crate::utils::now_millis;
use log::info;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;

#[derive(Debug, Clone)]
struct CacheEntry {
    value: Value,
    expires_at: i64,
}

/// Cache kept entirely in memory.
pub struct MemoryCache {
    prefix: String,
    entries: Mutex<HashMap<String, CacheEntry>>,
}

impl MemoryCache {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the live entry for `key`, dropping it when expired.
    fn live_entry(
        entries: &mut HashMap<String, CacheEntry>,
        key: &str,
        now: i64,
    ) -> Option<CacheEntry> {
        let entry = entries.get(key)?;
        if entry.expires_at <= now {
            entries.remove(key);
            return None;
        }
        Some(entry.clone())
    }
}

impl CacheBackend for MemoryCache {
    fn initialize_schema(&self, dry_run: bool) -> CoreResult<()> {
        info!(
            "event=schema_migrate module=cache status=skip backend=memory dry_run={}",
            dry_run
        );
        Ok(())
    }

    fn flush(&self) -> CoreResult<()> {
        self.entries.lock().clear();
        info!("event=flush module=cache status=ok backend=memory");
        Ok(())
    }

    fn set(&self, key: &str, value: &Value, ttl_ms: i64) -> CoreResult<()> {
        let entry = CacheEntry {
            value: value.clone(),
            expires_at: expires_at(now_millis(), ttl_ms),
        };
        self.entries
            .lock()
            .insert(prefixed(&self.prefix, key), entry);
        Ok(())
    }

    fn get(&self, key: &str) -> CoreResult<Option<Value>> {
        let mut entries = self.entries.lock();
        Ok(
            Self::live_entry(&mut entries, &prefixed(&self.prefix, key), now_millis())
                .map(|entry| entry.value),
        )
    }

    fn delete(&self, key: &str) -> CoreResult<Option<Value>> {
        let now = now_millis();
        let removed = self.entries.lock().remove(&prefixed(&self.prefix, key));
        Ok(removed
            .filter(|entry| entry.expires_at > now)
            .map(|entry| entry.value))
    }

    fn ttl(&self, key: &str) -> CoreResult<Option<i64>> {
        let now = now_millis();
        let mut entries = self.entries.lock();
        Ok(Self::live_entry(&mut entries, &prefixed(&self.prefix, key), now)
            .map(|entry| entry.expires_at - now))
    }

    fn expire(&self, key: &str, ttl_ms: i64) -> CoreResult<()> {
        let now = now_millis();
        let key = prefixed(&self.prefix, key);
        let mut entries = self.entries.lock();
        if Self::live_entry(&mut entries, &key, now).is_some() {
            if let Some(entry) = entries.get_mut(&key) {
                entry.expires_at = expires_at(now, ttl_ms);
            }
        }
        Ok(())
    }
}
