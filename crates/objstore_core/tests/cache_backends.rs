mod common;

use common::caches;
use objstore_core::{CacheBackend, SqliteCache};
use serde_json::json;

#[test]
fn set_then_get_returns_the_stored_value() {
    for (name, cache) in caches("test:") {
        let value = json!({"user": "alice", "scopes": ["read", "write"]});
        cache.set("session:1", &value, 60_000).unwrap();
        assert_eq!(cache.get("session:1").unwrap(), Some(value), "{name}");
        assert_eq!(cache.get("session:2").unwrap(), None, "{name}");
    }
}

#[test]
fn set_replaces_value_and_lifetime() {
    for (name, cache) in caches("test:") {
        cache.set("k", &json!(1), 1_000).unwrap();
        cache.set("k", &json!(2), 60_000).unwrap();
        assert_eq!(cache.get("k").unwrap(), Some(json!(2)), "{name}");
        assert!(cache.ttl("k").unwrap().unwrap() > 1_000, "{name}");
    }
}

#[test]
fn zero_ttl_entry_is_never_returned() {
    for (name, cache) in caches("test:") {
        cache.set("gone", &json!("v"), 0).unwrap();
        assert_eq!(cache.get("gone").unwrap(), None, "{name}");
        assert_eq!(cache.ttl("gone").unwrap(), None, "{name}");
        assert_eq!(cache.delete("gone").unwrap(), None, "{name}");
    }
}

#[test]
fn ttl_reports_remaining_lifetime() {
    for (name, cache) in caches("test:") {
        cache.set("k", &json!(true), 30_000).unwrap();
        let remaining = cache.ttl("k").unwrap().unwrap();
        assert!(remaining > 0 && remaining <= 30_000, "{name}: {remaining}");
        assert_eq!(cache.ttl("missing").unwrap(), None, "{name}");
    }
}

#[test]
fn expire_resets_lifetime_and_ignores_missing_keys() {
    for (name, cache) in caches("test:") {
        cache.set("k", &json!("v"), 30_000).unwrap();
        cache.expire("k", 120_000).unwrap();
        assert!(cache.ttl("k").unwrap().unwrap() > 30_000, "{name}");

        cache.expire("k", 0).unwrap();
        assert_eq!(cache.get("k").unwrap(), None, "{name}");

        cache.expire("missing", 10_000).unwrap();
        assert_eq!(cache.get("missing").unwrap(), None, "{name}");
    }
}

#[test]
fn delete_returns_previous_value_once() {
    for (name, cache) in caches("test:") {
        cache.set("k", &json!([1, 2, 3]), 60_000).unwrap();
        assert_eq!(cache.delete("k").unwrap(), Some(json!([1, 2, 3])), "{name}");
        assert_eq!(cache.delete("k").unwrap(), None, "{name}");
        assert_eq!(cache.get("k").unwrap(), None, "{name}");
    }
}

#[test]
fn flush_clears_every_entry() {
    for (name, cache) in caches("test:") {
        cache.set("a", &json!(1), 60_000).unwrap();
        cache.set("b", &json!(2), 60_000).unwrap();
        cache.flush().unwrap();
        assert_eq!(cache.get("a").unwrap(), None, "{name}");
        assert_eq!(cache.get("b").unwrap(), None, "{name}");
    }
}

#[test]
fn sqlite_flush_only_touches_its_own_prefix() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("cache.sqlite3");

    let app = SqliteCache::open(&path, "app:").unwrap();
    app.initialize_schema(false).unwrap();
    let other = SqliteCache::open(&path, "other:").unwrap();
    other.initialize_schema(false).unwrap();

    app.set("k", &json!("app"), 60_000).unwrap();
    other.set("k", &json!("other"), 60_000).unwrap();

    app.flush().unwrap();
    assert_eq!(app.get("k").unwrap(), None);
    assert_eq!(other.get("k").unwrap(), Some(json!("other")));
}
