//! Backend wiring and operator entry points.
//!
//! # Responsibility
//! - Build the storage, permission and cache backends selected by settings.
//! - Run schema migration, tombstone purge and cache flush.
//!
//! # Invariants
//! - Read-only mode turns storage and permission migrations into logged
//!   no-ops; the cache schema is always initialized.
//! - `purge_deleted` and `flush_cache` are safe to re-run.

use crate::cache::{CacheBackend, MemoryCache, SqliteCache};
use crate::config::{BackendKind, ConfigError, CoreSettings};
use crate::error::{BackendError, CoreResult};
use crate::permission::{MemoryPermission, PermissionBackend, SqlitePermission};
use crate::storage::{MemoryStorage, SqliteStorage, StorageBackend};
use log::{error, info};
use std::path::Path;
use std::sync::Arc;

/// Parent pattern matching every scope of a resource.
pub const ANY_PARENT: &str = "*";

/// Explicit handles to the three backends, shared by models and scripts.
#[derive(Clone)]
pub struct Backends {
    pub storage: Arc<dyn StorageBackend>,
    pub permission: Arc<dyn PermissionBackend>,
    pub cache: Arc<dyn CacheBackend>,
}

impl Backends {
    pub fn new(
        storage: Arc<dyn StorageBackend>,
        permission: Arc<dyn PermissionBackend>,
        cache: Arc<dyn CacheBackend>,
    ) -> Self {
        Self {
            storage,
            permission,
            cache,
        }
    }

    /// In-memory backends, typically for tests.
    pub fn in_memory(cache_prefix: &str) -> Self {
        Self::new(
            Arc::new(MemoryStorage::new()),
            Arc::new(MemoryPermission::new()),
            Arc::new(MemoryCache::new(cache_prefix)),
        )
    }

    /// Opens the backends selected by `settings`. Schemas are not touched;
    /// call [`migrate`] for that.
    pub fn from_settings(settings: &CoreSettings) -> CoreResult<Self> {
        settings.validate().map_err(BackendError::from)?;

        let storage: Arc<dyn StorageBackend> = match settings.storage_backend {
            BackendKind::Memory => Arc::new(MemoryStorage::new()),
            BackendKind::Sqlite => Arc::new(SqliteStorage::open(sqlite_path(settings)?)?),
        };
        let permission: Arc<dyn PermissionBackend> = match settings.permission_backend {
            BackendKind::Memory => Arc::new(MemoryPermission::new()),
            BackendKind::Sqlite => Arc::new(SqlitePermission::open(sqlite_path(settings)?)?),
        };
        let cache: Arc<dyn CacheBackend> = match settings.cache_backend {
            BackendKind::Memory => Arc::new(MemoryCache::new(settings.cache_prefix.clone())),
            BackendKind::Sqlite => Arc::new(SqliteCache::open(
                sqlite_path(settings)?,
                settings.cache_prefix.clone(),
            )?),
        };

        info!(
            "event=backends_open module=admin status=ok storage={} permission={} cache={}",
            settings.storage_backend, settings.permission_backend, settings.cache_backend
        );
        Ok(Self::new(storage, permission, cache))
    }
}

fn sqlite_path(settings: &CoreSettings) -> CoreResult<&Path> {
    settings.sqlite_path.as_deref().ok_or_else(|| {
        BackendError::from(ConfigError::ValidationFailed(
            "sqlite_path is not set".to_string(),
        ))
        .into()
    })
}

/// Initializes backend schemas.
///
/// # Contract
/// - In read-only mode storage and permission are skipped with an error
///   log; the cache is migrated regardless.
/// - `dry_run` only logs pending steps.
pub fn migrate(backends: &Backends, settings: &CoreSettings, dry_run: bool) -> CoreResult<()> {
    if settings.readonly {
        error!(
            "event=schema_migrate module=admin status=skip backends=storage,permission reason=readonly"
        );
    } else {
        backends.storage.initialize_schema(dry_run)?;
        backends.permission.initialize_schema(dry_run)?;
    }
    backends.cache.initialize_schema(dry_run)?;

    info!(
        "event=schema_migrate module=admin status=ok dry_run={} readonly={}",
        dry_run, settings.readonly
    );
    Ok(())
}

/// Purges tombstones of every scope of `resource_names`, keeping the
/// `max_retained` most recent per scope. Returns the total removed.
pub fn purge_deleted(
    storage: &dyn StorageBackend,
    resource_names: &[&str],
    max_retained: Option<usize>,
) -> CoreResult<usize> {
    let mut total = 0;
    for resource_name in resource_names {
        let removed = storage.purge_deleted(resource_name, ANY_PARENT, max_retained, None)?;
        info!(
            "event=purge_deleted module=admin status=ok resource={} removed={}",
            resource_name, removed
        );
        total += removed;
    }
    info!(
        "event=purge_deleted module=admin status=ok resources={} total={}",
        resource_names.len(),
        total
    );
    Ok(total)
}

/// Clears the cache backend only.
pub fn flush_cache(cache: &dyn CacheBackend) -> CoreResult<()> {
    cache.flush()?;
    info!("event=flush_cache module=admin status=ok");
    Ok(())
}
