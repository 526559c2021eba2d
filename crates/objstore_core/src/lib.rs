//! Storage, permission and cache core for a generic JSON object API.
//!
//! Objects live under a `(resource_name, parent_id, id)` key-space with
//! per-scope monotonic timestamps, tombstones and per-object ACLs. Backends
//! are chosen at startup and passed around explicitly through [`Backends`].

pub mod admin;
pub mod cache;
pub mod config;
pub mod db;
pub mod error;
pub mod id_generator;
pub mod logging;
pub mod model;
pub mod pagination;
pub mod permission;
pub mod storage;
pub mod utils;

pub use admin::{flush_cache, migrate, purge_deleted, Backends};
pub use cache::{CacheBackend, MemoryCache, SqliteCache};
pub use config::{BackendKind, ConfigError, CoreSettings, LoggingSettings};
pub use error::{ApiErrno, BackendError, CoreError, CoreResult};
pub use id_generator::{IdGenerator, PatternIdGenerator, Uuid4Generator};
pub use logging::{init_logging, logging_status, LogTarget};
pub use model::{
    ListScope, Model, ModelConfig, ModelEvent, ModelListener, ObjectValidator, Page, PageRequest,
};
pub use pagination::{build_pagination_rules, PaginationToken};
pub use permission::{
    MemoryPermission, PermissionBackend, PermissionMap, PrincipalSet, SqlitePermission,
};
pub use storage::{
    Direction, Filter, FilterOp, ListOptions, MemoryStorage, Object, ObjectPage, Sort,
    SqliteStorage, StorageBackend,
};

/// Returns the core crate version.
pub fn core_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
