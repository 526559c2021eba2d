//! Error taxonomy shared by backends, the model layer and admin operations.
//!
//! # Responsibility
//! - Give callers semantic errors (`ObjectNotFound`, `Conflict`, ...) that map
//!   to stable API error numbers and HTTP status classes.
//! - Keep technology failures wrapped in `BackendError`.
//!
//! # Invariants
//! - The core never retries a `Backend` error; retry policy belongs to callers.
//! - `PartialWrite` is returned, never masked, when storage succeeded but the
//!   permission write failed.

use crate::config::ConfigError;
use crate::db::DbError;
use crate::storage::Object;
use std::error::Error;
use std::fmt::{Display, Formatter};

pub type CoreResult<T> = Result<T, CoreError>;

/// Stable application-level error numbers exposed by the object API.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiErrno {
    InvalidParameters,
    InvalidPostedData,
    MissingResource,
    ModifiedMeanwhile,
    MethodNotAllowed,
    ConstraintViolated,
    Backend,
    Undefined,
}

impl ApiErrno {
    pub fn code(self) -> u16 {
        match self {
            Self::InvalidParameters => 107,
            Self::InvalidPostedData => 109,
            Self::MissingResource => 111,
            Self::ModifiedMeanwhile => 114,
            Self::MethodNotAllowed => 115,
            Self::ConstraintViolated => 122,
            Self::Backend => 201,
            Self::Undefined => 999,
        }
    }
}

/// Failure of the underlying storage/permission/cache technology.
#[derive(Debug)]
pub enum BackendError {
    Db(DbError),
    /// Settings do not describe a usable backend.
    Config(ConfigError),
    Json(serde_json::Error),
    /// Principal string rejected at the permission backend boundary.
    InvalidPrincipal(String),
    /// Pagination token could not be decoded.
    InvalidCursor(String),
    /// Persisted data cannot be converted back to an object.
    InvalidData(String),
}

impl Display for BackendError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Db(err) => write!(f, "{err}"),
            Self::Config(err) => write!(f, "{err}"),
            Self::Json(err) => write!(f, "json error: {err}"),
            Self::InvalidPrincipal(value) => write!(f, "invalid principal: `{value}`"),
            Self::InvalidCursor(message) => write!(f, "invalid pagination token: {message}"),
            Self::InvalidData(message) => write!(f, "invalid persisted data: {message}"),
        }
    }
}

impl Error for BackendError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Db(err) => Some(err),
            Self::Config(err) => Some(err),
            Self::Json(err) => Some(err),
            Self::InvalidPrincipal(_) | Self::InvalidCursor(_) | Self::InvalidData(_) => None,
        }
    }
}

impl From<DbError> for BackendError {
    fn from(value: DbError) -> Self {
        Self::Db(value)
    }
}

impl From<ConfigError> for BackendError {
    fn from(value: ConfigError) -> Self {
        Self::Config(value)
    }
}

impl From<rusqlite::Error> for BackendError {
    fn from(value: rusqlite::Error) -> Self {
        Self::Db(DbError::Sqlite(value))
    }
}

impl From<serde_json::Error> for BackendError {
    fn from(value: serde_json::Error) -> Self {
        Self::Json(value)
    }
}

/// Error returned by every core operation.
#[derive(Debug)]
pub enum CoreError {
    /// Read/update/delete target is missing or tombstoned.
    ObjectNotFound {
        resource_name: String,
        parent_id: String,
        id: String,
    },
    /// A unique field (or the id itself) collides with a live object.
    Unicity {
        resource_name: String,
        field: String,
        existing: Box<Object>,
    },
    /// Optimistic concurrency check failed.
    Conflict {
        id: String,
        expected: Option<i64>,
        current: Option<i64>,
    },
    /// Caller-supplied id does not match the resource id pattern.
    InvalidId { resource_name: String, id: String },
    /// A validation hook rejected the object.
    InvalidObject(String),
    /// Write attempted while the core runs read-only.
    ReadOnly(&'static str),
    /// Storage writes succeeded but the permission write failed.
    PartialWrite {
        objects: Vec<Object>,
        source: Box<CoreError>,
    },
    Backend(BackendError),
}

impl CoreError {
    pub(crate) fn not_found(resource_name: &str, parent_id: &str, id: &str) -> Self {
        Self::ObjectNotFound {
            resource_name: resource_name.to_string(),
            parent_id: parent_id.to_string(),
            id: id.to_string(),
        }
    }

    pub(crate) fn unicity(resource_name: &str, field: &str, existing: &Object) -> Self {
        Self::Unicity {
            resource_name: resource_name.to_string(),
            field: field.to_string(),
            existing: Box::new(existing.clone()),
        }
    }

    /// Stable API error number for this error.
    pub fn errno(&self) -> ApiErrno {
        match self {
            Self::ObjectNotFound { .. } => ApiErrno::MissingResource,
            Self::Unicity { .. } => ApiErrno::ConstraintViolated,
            Self::Conflict { .. } => ApiErrno::ModifiedMeanwhile,
            Self::InvalidId { .. } => ApiErrno::InvalidParameters,
            Self::InvalidObject(_) => ApiErrno::InvalidPostedData,
            Self::ReadOnly(_) => ApiErrno::MethodNotAllowed,
            Self::PartialWrite { .. } => ApiErrno::Undefined,
            Self::Backend(_) => ApiErrno::Backend,
        }
    }

    /// HTTP status class a view layer should render.
    pub fn http_status(&self) -> u16 {
        match self {
            Self::ObjectNotFound { .. } => 404,
            Self::Unicity { .. } => 409,
            Self::Conflict { .. } => 412,
            Self::InvalidId { .. } | Self::InvalidObject(_) => 400,
            Self::ReadOnly(_) => 405,
            Self::PartialWrite { .. } => 500,
            Self::Backend(_) => 503,
        }
    }
}

impl Display for CoreError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ObjectNotFound {
                resource_name,
                parent_id,
                id,
            } => write!(
                f,
                "object not found: {resource_name} `{id}` in parent `{parent_id}`"
            ),
            Self::Unicity {
                resource_name,
                field,
                ..
            } => write!(
                f,
                "conflicting {resource_name} exists with the same `{field}`"
            ),
            Self::Conflict {
                id,
                expected,
                current,
            } => write!(
                f,
                "object `{id}` was modified meanwhile (expected {}, current {})",
                format_revision(*expected),
                format_revision(*current)
            ),
            Self::InvalidId { resource_name, id } => {
                write!(f, "invalid {resource_name} id: `{id}`")
            }
            Self::InvalidObject(message) => write!(f, "invalid object: {message}"),
            Self::ReadOnly(operation) => write!(f, "`{operation}` refused in readonly mode"),
            Self::PartialWrite { objects, source } => {
                let ids: Vec<&str> = objects
                    .iter()
                    .filter_map(|object| object.get("id").and_then(|value| value.as_str()))
                    .collect();
                write!(
                    f,
                    "objects [{}] stored but permissions were not written: {source}",
                    ids.join(", ")
                )
            }
            Self::Backend(err) => write!(f, "backend failure: {err}"),
        }
    }
}

fn format_revision(value: Option<i64>) -> String {
    value.map_or_else(|| "none".to_string(), |v| v.to_string())
}

impl Error for CoreError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::PartialWrite { source, .. } => Some(source.as_ref()),
            Self::Backend(err) => Some(err),
            _ => None,
        }
    }
}

impl From<BackendError> for CoreError {
    fn from(value: BackendError) -> Self {
        Self::Backend(value)
    }
}

impl From<DbError> for CoreError {
    fn from(value: DbError) -> Self {
        Self::Backend(BackendError::Db(value))
    }
}

impl From<rusqlite::Error> for CoreError {
    fn from(value: rusqlite::Error) -> Self {
        Self::Backend(BackendError::from(value))
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(value: serde_json::Error) -> Self {
        Self::Backend(BackendError::Json(value))
    }
}
