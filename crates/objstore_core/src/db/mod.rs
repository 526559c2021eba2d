//! SQLite bootstrap and schema migration entry points.
//!
//! # Responsibility
//! - Open and configure SQLite connections shared by the SQLite backends.
//! - Apply per-backend schema migrations in deterministic order.
//!
//! # Invariants
//! - Each backend tracks its own schema version in the `metadata` table.
//! - Backends must not read/write data before their migrations succeed.

use std::error::Error;
use std::fmt::{Display, Formatter};

pub mod migrations;
mod open;

pub use open::{open_db, open_db_in_memory};

pub type DbResult<T> = Result<T, DbError>;

/// Failure while opening a database or migrating one backend's schema.
#[derive(Debug)]
pub enum DbError {
    Sqlite(rusqlite::Error),
    /// A migration script failed; the whole batch was rolled back.
    Migration {
        backend: &'static str,
        version: u32,
        source: rusqlite::Error,
    },
    /// The database was migrated by a newer build.
    UnsupportedSchemaVersion {
        backend: &'static str,
        db_version: u32,
        latest_supported: u32,
    },
}

impl DbError {
    /// Backend whose schema is involved, when known.
    pub fn backend(&self) -> Option<&'static str> {
        match self {
            Self::Sqlite(_) => None,
            Self::Migration { backend, .. } | Self::UnsupportedSchemaVersion { backend, .. } => {
                Some(*backend)
            }
        }
    }
}

impl Display for DbError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Sqlite(err) => write!(f, "{err}"),
            Self::Migration {
                backend,
                version,
                source,
            } => write!(f, "{backend} migration {version} failed: {source}"),
            Self::UnsupportedSchemaVersion {
                backend,
                db_version,
                latest_supported,
            } => write!(
                f,
                "{backend} schema version {db_version} is newer than supported {latest_supported}"
            ),
        }
    }
}

impl Error for DbError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Sqlite(err) | Self::Migration { source: err, .. } => Some(err),
            Self::UnsupportedSchemaVersion { .. } => None,
        }
    }
}

impl From<rusqlite::Error> for DbError {
    fn from(value: rusqlite::Error) -> Self {
        Self::Sqlite(value)
    }
}
