//! SQLite migration registry and executor.
//!
//! # Responsibility
//! - Register schema migrations per backend in strictly increasing order.
//! - Apply pending migrations atomically, or only report them on dry runs.
//!
//! # Invariants
//! - `version` values must remain monotonic within a set.
//! - Applied versions are mirrored to `metadata.<backend>_schema_version`.

use crate::db::{DbError, DbResult};
use log::info;
use rusqlite::{Connection, OptionalExtension};

#[derive(Debug, Clone, Copy)]
struct Migration {
    version: u32,
    sql: &'static str,
}

/// Ordered migrations owned by one backend.
#[derive(Debug, Clone, Copy)]
pub struct MigrationSet {
    backend: &'static str,
    migrations: &'static [Migration],
}

pub const STORAGE_MIGRATIONS: MigrationSet = MigrationSet {
    backend: "storage",
    migrations: &[
        Migration {
            version: 1,
            sql: include_str!("storage_0001_init.sql"),
        },
        Migration {
            version: 2,
            sql: include_str!("storage_0002_tombstones.sql"),
        },
    ],
};

pub const PERMISSION_MIGRATIONS: MigrationSet = MigrationSet {
    backend: "permission",
    migrations: &[Migration {
        version: 1,
        sql: include_str!("permission_0001_init.sql"),
    }],
};

pub const CACHE_MIGRATIONS: MigrationSet = MigrationSet {
    backend: "cache",
    migrations: &[Migration {
        version: 1,
        sql: include_str!("cache_0001_init.sql"),
    }],
};

const METADATA_SQL: &str = "CREATE TABLE IF NOT EXISTS metadata (
    name TEXT PRIMARY KEY NOT NULL,
    value TEXT NOT NULL
);";

impl MigrationSet {
    pub fn backend(&self) -> &'static str {
        self.backend
    }

    /// Returns the latest migration version known by this binary.
    pub fn latest_version(&self) -> u32 {
        self.migrations
            .last()
            .map_or(0, |migration| migration.version)
    }

    fn version_key(&self) -> String {
        format!("{}_schema_version", self.backend)
    }
}

/// Returns the schema version recorded for `set`, `0` when never migrated.
pub fn current_version(conn: &Connection, set: &MigrationSet) -> DbResult<u32> {
    let has_metadata: i64 = conn.query_row(
        "SELECT EXISTS(
            SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = 'metadata'
        );",
        [],
        |row| row.get(0),
    )?;
    if has_metadata == 0 {
        return Ok(0);
    }

    let value: Option<String> = conn
        .query_row(
            "SELECT value FROM metadata WHERE name = ?1;",
            [set.version_key()],
            |row| row.get(0),
        )
        .optional()?;
    Ok(value.and_then(|text| text.parse().ok()).unwrap_or(0))
}

/// Applies (or, with `dry_run`, only lists) pending migrations for `set`.
///
/// Returns the versions that were applied, or would be applied on a dry run.
pub fn apply_migrations(
    conn: &mut Connection,
    set: &MigrationSet,
    dry_run: bool,
) -> DbResult<Vec<u32>> {
    let current = current_version(conn, set)?;
    let latest = set.latest_version();

    if current > latest {
        return Err(DbError::UnsupportedSchemaVersion {
            backend: set.backend,
            db_version: current,
            latest_supported: latest,
        });
    }

    let pending: Vec<u32> = set
        .migrations
        .iter()
        .filter(|migration| migration.version > current)
        .map(|migration| migration.version)
        .collect();

    if pending.is_empty() {
        info!(
            "event=schema_migrate module=db status=ok backend={} version={} pending=0",
            set.backend, current
        );
        return Ok(pending);
    }

    if dry_run {
        for version in &pending {
            info!(
                "event=schema_migrate module=db status=dry_run backend={} version={}",
                set.backend, version
            );
        }
        return Ok(pending);
    }

    let tx = conn.transaction()?;
    tx.execute_batch(METADATA_SQL)?;
    for migration in set.migrations {
        if migration.version <= current {
            continue;
        }
        tx.execute_batch(migration.sql)
            .map_err(|source| DbError::Migration {
                backend: set.backend,
                version: migration.version,
                source,
            })?;
        tx.execute(
            "INSERT INTO metadata (name, value) VALUES (?1, ?2)
             ON CONFLICT(name) DO UPDATE SET value = excluded.value;",
            [set.version_key(), migration.version.to_string()],
        )?;
    }
    tx.commit()?;

    info!(
        "event=schema_migrate module=db status=ok backend={} from={} to={}",
        set.backend, current, latest
    );
    Ok(pending)
}
