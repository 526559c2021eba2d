#![allow(dead_code)]

use objstore_core::{
    Backends, CacheBackend, MemoryCache, MemoryPermission, MemoryStorage, Object,
    PermissionBackend, PrincipalSet, SqliteCache, SqlitePermission, SqliteStorage,
    StorageBackend,
};
use serde_json::Value;
use std::sync::Arc;

pub const RESOURCE: &str = "record";
pub const PARENT: &str = "/buckets/b1/collections/c1";

pub fn object(value: Value) -> Object {
    value.as_object().cloned().unwrap()
}

pub fn id_of(object: &Object) -> &str {
    object.get("id").and_then(Value::as_str).unwrap()
}

pub fn last_modified(object: &Object) -> i64 {
    object.get("last_modified").and_then(Value::as_i64).unwrap()
}

pub fn ids(objects: &[Object]) -> Vec<String> {
    objects.iter().map(|object| id_of(object).to_string()).collect()
}

pub fn principals(values: &[&str]) -> PrincipalSet {
    values.iter().map(|value| value.to_string()).collect()
}

/// Memory and in-memory SQLite storage, schemas initialized.
pub fn storages() -> Vec<(&'static str, Arc<dyn StorageBackend>)> {
    let memory: Arc<dyn StorageBackend> = Arc::new(MemoryStorage::new());
    let sqlite: Arc<dyn StorageBackend> = Arc::new(SqliteStorage::open_in_memory().unwrap());
    sqlite.initialize_schema(false).unwrap();
    vec![("memory", memory), ("sqlite", sqlite)]
}

pub fn permissions() -> Vec<(&'static str, Arc<dyn PermissionBackend>)> {
    let memory: Arc<dyn PermissionBackend> = Arc::new(MemoryPermission::new());
    let sqlite: Arc<dyn PermissionBackend> = Arc::new(SqlitePermission::open_in_memory().unwrap());
    sqlite.initialize_schema(false).unwrap();
    vec![("memory", memory), ("sqlite", sqlite)]
}

pub fn caches(prefix: &str) -> Vec<(&'static str, Arc<dyn CacheBackend>)> {
    let memory: Arc<dyn CacheBackend> = Arc::new(MemoryCache::new(prefix));
    let sqlite: Arc<dyn CacheBackend> = Arc::new(SqliteCache::open_in_memory(prefix).unwrap());
    sqlite.initialize_schema(false).unwrap();
    vec![("memory", memory), ("sqlite", sqlite)]
}

/// One memory bundle and one SQLite bundle.
pub fn backend_sets() -> Vec<(&'static str, Backends)> {
    let storage = SqliteStorage::open_in_memory().unwrap();
    storage.initialize_schema(false).unwrap();
    let permission = SqlitePermission::open_in_memory().unwrap();
    permission.initialize_schema(false).unwrap();
    let cache = SqliteCache::open_in_memory("test:").unwrap();
    cache.initialize_schema(false).unwrap();

    vec![
        ("memory", Backends::in_memory("test:")),
        (
            "sqlite",
            Backends::new(Arc::new(storage), Arc::new(permission), Arc::new(cache)),
        ),
    ]
}
