//! Storage backend contract and query types.
//!
//! # Responsibility
//! - Define the object key-space `(resource_name, parent_id, id)` and the
//!   operations every storage backend implements.
//! - Define the filter/sort/pagination query language consumed from callers.
//!
//! # Invariants
//! - Within one scope, `last_modified` values are unique and strictly
//!   increasing across creates, updates and deletes.
//! - Deleted objects become tombstones `{id, last_modified, deleted: true}`
//!   and stay until `purge_deleted` removes them.
//! - `parent_id` may contain `*` wildcards for `list_all`, `delete_all` and
//!   `purge_deleted`.

use crate::error::CoreResult;
use crate::id_generator::IdGenerator;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub mod memory;
pub mod query;
pub mod sqlite;

pub use memory::MemoryStorage;
pub use sqlite::SqliteStorage;

/// JSON object stored by the core.
pub type Object = Map<String, Value>;

pub const ID_FIELD: &str = "id";
pub const MODIFIED_FIELD: &str = "last_modified";
pub const DELETED_FIELD: &str = "deleted";

/// Filter comparison operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterOp {
    Eq,
    Not,
    In,
    Exclude,
    Like,
    Lt,
    Le,
    Gt,
    Ge,
    /// Field presence (`true`) or absence (`false`).
    Has,
    /// Array field contains every given value.
    Contains,
    /// Array field contains at least one given value.
    ContainsAny,
}

/// One `(field, operator, value)` constraint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Filter {
    pub field: String,
    pub op: FilterOp,
    pub value: Value,
}

impl Filter {
    pub fn new(field: impl Into<String>, op: FilterOp, value: impl Into<Value>) -> Self {
        Self {
            field: field.into(),
            op,
            value: value.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Asc,
    Desc,
}

/// One `(field, direction)` sort key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sort {
    pub field: String,
    pub direction: Direction,
}

impl Sort {
    pub fn asc(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            direction: Direction::Asc,
        }
    }

    pub fn desc(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            direction: Direction::Desc,
        }
    }
}

/// Keyset pagination constraints: OR of AND-groups.
pub type PaginationRules = Vec<Vec<Filter>>;

/// Options shared by `list_all` and `delete_all`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ListOptions {
    pub filters: Vec<Filter>,
    pub sorting: Vec<Sort>,
    pub pagination_rules: PaginationRules,
    pub limit: Option<usize>,
    pub include_deleted: bool,
}

/// Result of a listing: one page plus the total matching `filters`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ObjectPage {
    pub objects: Vec<Object>,
    pub count: usize,
}

/// Durable, versioned store of JSON objects.
///
/// Implementations serialize timestamp assignment per scope; everything else
/// may run concurrently.
pub trait StorageBackend: Send + Sync {
    /// Creates backend structures; `dry_run` only reports pending steps.
    fn initialize_schema(&self, dry_run: bool) -> CoreResult<()>;

    /// Removes every object, tombstone and timestamp.
    fn flush(&self) -> CoreResult<()>;

    /// Current timestamp of a scope, initialized to now when the scope is empty.
    fn resource_timestamp(&self, resource_name: &str, parent_id: &str) -> CoreResult<i64>;

    /// Stores a new object, generating its id when absent.
    fn create(
        &self,
        resource_name: &str,
        parent_id: &str,
        object: Object,
        id_generator: &dyn IdGenerator,
        unique_fields: &[String],
    ) -> CoreResult<Object>;

    fn get(&self, resource_name: &str, parent_id: &str, id: &str) -> CoreResult<Object>;

    /// Replaces (or creates) the object stored under `id`.
    fn update(
        &self,
        resource_name: &str,
        parent_id: &str,
        id: &str,
        object: Object,
        unique_fields: &[String],
    ) -> CoreResult<Object>;

    /// Replaces the object with a tombstone and returns the tombstone.
    fn delete(
        &self,
        resource_name: &str,
        parent_id: &str,
        id: &str,
        last_modified: Option<i64>,
    ) -> CoreResult<Object>;

    /// Tombstones every live object matching `options`.
    fn delete_all(
        &self,
        resource_name: &str,
        parent_id: &str,
        options: &ListOptions,
    ) -> CoreResult<Vec<Object>>;

    fn list_all(
        &self,
        resource_name: &str,
        parent_id: &str,
        options: &ListOptions,
    ) -> CoreResult<ObjectPage>;

    /// Removes tombstones beyond the `max_retained` most recent per scope,
    /// optionally only those older than `before`. Returns the removed count.
    fn purge_deleted(
        &self,
        resource_name: &str,
        parent_id: &str,
        max_retained: Option<usize>,
        before: Option<i64>,
    ) -> CoreResult<usize>;
}

/// Next scope timestamp: explicit values win when they keep monotonicity.
pub(crate) fn bump_timestamp(previous: Option<i64>, now: i64, explicit: Option<i64>) -> i64 {
    let floor = previous.map_or(i64::MIN, |value| value.saturating_add(1));
    match explicit {
        Some(value) => value.max(floor),
        None => now.max(floor),
    }
}

/// Builds the tombstone stored in place of a deleted object.
pub(crate) fn tombstone(id: &str, last_modified: i64) -> Object {
    let mut object = Object::new();
    object.insert(ID_FIELD.to_string(), Value::String(id.to_string()));
    object.insert(MODIFIED_FIELD.to_string(), Value::from(last_modified));
    object.insert(DELETED_FIELD.to_string(), Value::Bool(true));
    object
}

pub(crate) fn is_tombstone(object: &Object) -> bool {
    object
        .get(DELETED_FIELD)
        .and_then(Value::as_bool)
        .unwrap_or(false)
}

pub(crate) fn explicit_timestamp(object: &Object) -> Option<i64> {
    object.get(MODIFIED_FIELD).and_then(Value::as_i64)
}

/// Returns the live object sharing a unique field value with `object`.
pub(crate) fn find_unicity_conflict<'a, I>(
    candidates: I,
    object: &Object,
    unique_fields: &[String],
) -> Option<(&'a Object, String)>
where
    I: IntoIterator<Item = &'a Object>,
{
    let own_id = object.get(ID_FIELD);
    let wanted: Vec<(&String, &Value)> = unique_fields
        .iter()
        .filter_map(|field| object.get(field).map(|value| (field, value)))
        .filter(|(_, value)| !value.is_null())
        .collect();
    if wanted.is_empty() {
        return None;
    }

    candidates
        .into_iter()
        .filter(|existing| !is_tombstone(existing) && existing.get(ID_FIELD) != own_id)
        .find_map(|existing| {
            wanted
                .iter()
                .find(|(field, value)| existing.get(field.as_str()) == Some(*value))
                .map(|(field, _)| (existing, (*field).clone()))
        })
}

#[cfg(test)]
mod tests {
    use super::{bump_timestamp, find_unicity_conflict, tombstone, Object};
    use serde_json::json;

    #[test]
    fn bump_never_goes_backwards() {
        assert_eq!(bump_timestamp(None, 100, None), 100);
        assert_eq!(bump_timestamp(Some(100), 100, None), 101);
        assert_eq!(bump_timestamp(Some(200), 100, None), 201);
        assert_eq!(bump_timestamp(Some(100), 150, Some(500)), 500);
        assert_eq!(bump_timestamp(Some(100), 150, Some(50)), 101);
    }

    #[test]
    fn unicity_ignores_tombstones_and_self() {
        let first = json!({"id": "a", "email": "x@y"}).as_object().cloned().expect("object");
        let dead = tombstone("b", 3);
        let candidates: Vec<Object> = vec![first.clone(), dead];

        let same = json!({"id": "a", "email": "x@y"}).as_object().cloned().expect("object");
        assert!(find_unicity_conflict(&candidates, &same, &["email".to_string()]).is_none());

        let other = json!({"id": "c", "email": "x@y"}).as_object().cloned().expect("object");
        let (existing, field) =
            find_unicity_conflict(&candidates, &other, &["email".to_string()]).expect("conflict");
        assert_eq!(existing, &first);
        assert_eq!(field, "email");
    }
}
