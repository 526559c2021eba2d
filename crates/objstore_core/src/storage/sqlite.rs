//! SQLite storage backend.
//!
//! # Responsibility
//! - Persist objects and tombstones in the `objects` table, scope timestamps
//!   in `timestamps`.
//! - Push `last_modified` range filters into SQL; evaluate the rest of the
//!   query language with `storage::query`.
//!
//! # Invariants
//! - Every write runs in a `BEGIN IMMEDIATE` transaction, which serializes the
//!   read-previous/assign-next timestamp step across connections.
//! - `objects.data` never contains `id` or `last_modified`; they are columns.

use crate::db::migrations::{apply_migrations, STORAGE_MIGRATIONS};
use crate::db::{open_db, open_db_in_memory};
use crate::error::{BackendError, CoreError, CoreResult};
use crate::id_generator::IdGenerator;
use crate::storage::query;
use crate::storage::{
    bump_timestamp, explicit_timestamp, find_unicity_conflict, is_tombstone, tombstone, FilterOp,
    ListOptions, Object, ObjectPage, StorageBackend, DELETED_FIELD, ID_FIELD, MODIFIED_FIELD,
};
use crate::utils::{glob_match, now_millis};
use log::{debug, info};
use parking_lot::Mutex;
use rusqlite::types::Value as SqlValue;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row, TransactionBehavior};
use serde_json::Value;
use std::path::Path;

const OBJECT_SELECT_SQL: &str = "SELECT
    id,
    last_modified,
    data,
    deleted
FROM objects";

/// Storage backend persisted in SQLite.
pub struct SqliteStorage {
    conn: Mutex<Connection>,
}

impl SqliteStorage {
    /// Wraps an open connection. Call `initialize_schema` before use.
    pub fn new(conn: Connection) -> Self {
        Self {
            conn: Mutex::new(conn),
        }
    }

    pub fn open(path: impl AsRef<Path>) -> CoreResult<Self> {
        Ok(Self::new(open_db(path)?))
    }

    pub fn open_in_memory() -> CoreResult<Self> {
        Ok(Self::new(open_db_in_memory()?))
    }
}

impl StorageBackend for SqliteStorage {
    fn initialize_schema(&self, dry_run: bool) -> CoreResult<()> {
        let mut conn = self.conn.lock();
        apply_migrations(&mut conn, &STORAGE_MIGRATIONS, dry_run)?;
        Ok(())
    }

    fn flush(&self) -> CoreResult<()> {
        let conn = self.conn.lock();
        conn.execute_batch("DELETE FROM objects; DELETE FROM timestamps;")?;
        info!("event=flush module=storage status=ok backend=sqlite");
        Ok(())
    }

    fn resource_timestamp(&self, resource_name: &str, parent_id: &str) -> CoreResult<i64> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let timestamp = match current_timestamp(&tx, resource_name, parent_id)? {
            Some(current) => current,
            None => bump_scope_timestamp(&tx, resource_name, parent_id, None)?,
        };
        tx.commit()?;
        Ok(timestamp)
    }

    fn create(
        &self,
        resource_name: &str,
        parent_id: &str,
        object: Object,
        id_generator: &dyn IdGenerator,
        unique_fields: &[String],
    ) -> CoreResult<Object> {
        let id = match object.get(ID_FIELD).and_then(Value::as_str) {
            Some(id) => id.to_string(),
            None => id_generator.generate(resource_name),
        };

        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        if let Some(existing) = fetch_object(&tx, resource_name, parent_id, &id)? {
            if !is_tombstone(&existing) {
                return Err(CoreError::unicity(resource_name, ID_FIELD, &existing));
            }
        }
        let created = write_object(&tx, resource_name, parent_id, &id, object, unique_fields)?;
        tx.commit()?;

        debug!(
            "event=object_create module=storage status=ok backend=sqlite resource={}",
            resource_name
        );
        Ok(created)
    }

    fn get(&self, resource_name: &str, parent_id: &str, id: &str) -> CoreResult<Object> {
        let conn = self.conn.lock();
        fetch_object(&conn, resource_name, parent_id, id)?
            .filter(|object| !is_tombstone(object))
            .ok_or_else(|| CoreError::not_found(resource_name, parent_id, id))
    }

    fn update(
        &self,
        resource_name: &str,
        parent_id: &str,
        id: &str,
        object: Object,
        unique_fields: &[String],
    ) -> CoreResult<Object> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let updated = write_object(&tx, resource_name, parent_id, id, object, unique_fields)?;
        tx.commit()?;
        Ok(updated)
    }

    fn delete(
        &self,
        resource_name: &str,
        parent_id: &str,
        id: &str,
        last_modified: Option<i64>,
    ) -> CoreResult<Object> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let exists = fetch_object(&tx, resource_name, parent_id, id)?
            .is_some_and(|object| !is_tombstone(&object));
        if !exists {
            return Err(CoreError::not_found(resource_name, parent_id, id));
        }

        let deleted = tombstone_row(&tx, resource_name, parent_id, id, last_modified)?;
        tx.commit()?;
        Ok(deleted)
    }

    fn delete_all(
        &self,
        resource_name: &str,
        parent_id: &str,
        options: &ListOptions,
    ) -> CoreResult<Vec<Object>> {
        let live_only = ListOptions {
            include_deleted: false,
            ..options.clone()
        };

        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let mut deleted = Vec::new();
        for parent in matching_parents(&tx, resource_name, parent_id)? {
            let candidates = load_scope(&tx, resource_name, &parent, &live_only)?;
            for object in query::apply(candidates, &live_only).objects {
                let Some(id) = object.get(ID_FIELD).and_then(Value::as_str) else {
                    continue;
                };
                deleted.push(tombstone_row(&tx, resource_name, &parent, id, None)?);
            }
        }
        tx.commit()?;
        Ok(deleted)
    }

    fn list_all(
        &self,
        resource_name: &str,
        parent_id: &str,
        options: &ListOptions,
    ) -> CoreResult<ObjectPage> {
        let conn = self.conn.lock();
        let mut candidates = Vec::new();
        for parent in matching_parents(&conn, resource_name, parent_id)? {
            candidates.extend(load_scope(&conn, resource_name, &parent, options)?);
        }
        Ok(query::apply(candidates, options))
    }

    fn purge_deleted(
        &self,
        resource_name: &str,
        parent_id: &str,
        max_retained: Option<usize>,
        before: Option<i64>,
    ) -> CoreResult<usize> {
        let retained = i64::try_from(max_retained.unwrap_or(0)).unwrap_or(i64::MAX);

        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let mut removed = 0;
        for parent in matching_parents(&tx, resource_name, parent_id)? {
            removed += tx.execute(
                "DELETE FROM objects
                 WHERE resource_name = ?1
                   AND parent_id = ?2
                   AND deleted = 1
                   AND (?4 IS NULL OR last_modified < ?4)
                   AND id NOT IN (
                       SELECT id
                       FROM objects
                       WHERE resource_name = ?1
                         AND parent_id = ?2
                         AND deleted = 1
                       ORDER BY last_modified DESC
                       LIMIT ?3
                   );",
                params![resource_name, parent, retained, before],
            )?;
        }
        tx.commit()?;

        info!(
            "event=purge_deleted module=storage status=ok backend=sqlite resource={} removed={}",
            resource_name, removed
        );
        Ok(removed)
    }
}

fn write_object(
    conn: &Connection,
    resource_name: &str,
    parent_id: &str,
    id: &str,
    mut object: Object,
    unique_fields: &[String],
) -> CoreResult<Object> {
    object.insert(ID_FIELD.to_string(), Value::String(id.to_string()));
    object.remove(DELETED_FIELD);

    if !unique_fields.is_empty() {
        let scope = load_scope(conn, resource_name, parent_id, &ListOptions::default())?;
        if let Some((existing, field)) = find_unicity_conflict(&scope, &object, unique_fields) {
            return Err(CoreError::unicity(resource_name, &field, existing));
        }
    }

    let last_modified =
        bump_scope_timestamp(conn, resource_name, parent_id, explicit_timestamp(&object))?;
    object.insert(MODIFIED_FIELD.to_string(), Value::from(last_modified));

    let mut data = object.clone();
    data.remove(ID_FIELD);
    data.remove(MODIFIED_FIELD);
    conn.execute(
        "INSERT INTO objects (id, parent_id, resource_name, last_modified, data, deleted)
         VALUES (?1, ?2, ?3, ?4, ?5, 0)
         ON CONFLICT(id, parent_id, resource_name) DO UPDATE SET
            last_modified = excluded.last_modified,
            data = excluded.data,
            deleted = 0;",
        params![
            id,
            parent_id,
            resource_name,
            last_modified,
            serde_json::to_string(&data)?,
        ],
    )?;

    Ok(object)
}

fn tombstone_row(
    conn: &Connection,
    resource_name: &str,
    parent_id: &str,
    id: &str,
    last_modified: Option<i64>,
) -> CoreResult<Object> {
    let timestamp = bump_scope_timestamp(conn, resource_name, parent_id, last_modified)?;
    conn.execute(
        "UPDATE objects
         SET
            deleted = 1,
            data = '{}',
            last_modified = ?4
         WHERE id = ?1
           AND parent_id = ?2
           AND resource_name = ?3;",
        params![id, parent_id, resource_name, timestamp],
    )?;
    Ok(tombstone(id, timestamp))
}

fn current_timestamp(
    conn: &Connection,
    resource_name: &str,
    parent_id: &str,
) -> CoreResult<Option<i64>> {
    let value: Option<i64> = conn
        .query_row(
            "SELECT last_modified FROM timestamps WHERE parent_id = ?1 AND resource_name = ?2;",
            params![parent_id, resource_name],
            |row| row.get(0),
        )
        .optional()?;
    Ok(value)
}

fn bump_scope_timestamp(
    conn: &Connection,
    resource_name: &str,
    parent_id: &str,
    explicit: Option<i64>,
) -> CoreResult<i64> {
    let previous = current_timestamp(conn, resource_name, parent_id)?;
    let next = bump_timestamp(previous, now_millis(), explicit);
    conn.execute(
        "INSERT INTO timestamps (parent_id, resource_name, last_modified)
         VALUES (?1, ?2, ?3)
         ON CONFLICT(parent_id, resource_name) DO UPDATE SET
            last_modified = excluded.last_modified;",
        params![parent_id, resource_name, next],
    )?;
    Ok(next)
}

fn fetch_object(
    conn: &Connection,
    resource_name: &str,
    parent_id: &str,
    id: &str,
) -> CoreResult<Option<Object>> {
    let mut stmt = conn.prepare(&format!(
        "{OBJECT_SELECT_SQL}
         WHERE id = ?1
           AND parent_id = ?2
           AND resource_name = ?3;"
    ))?;
    let mut rows = stmt.query(params![id, parent_id, resource_name])?;
    if let Some(row) = rows.next()? {
        return Ok(Some(parse_object_row(row)?));
    }
    Ok(None)
}

/// Parents of `resource_name` matching `pattern` (`*` wildcards allowed).
fn matching_parents(
    conn: &Connection,
    resource_name: &str,
    pattern: &str,
) -> CoreResult<Vec<String>> {
    if !pattern.contains('*') {
        return Ok(vec![pattern.to_string()]);
    }

    let mut stmt = conn.prepare(
        "SELECT DISTINCT parent_id FROM objects WHERE resource_name = ?1 ORDER BY parent_id;",
    )?;
    let mut rows = stmt.query([resource_name])?;
    let mut parents = Vec::new();
    while let Some(row) = rows.next()? {
        let parent: String = row.get(0)?;
        if glob_match(pattern, &parent) {
            parents.push(parent);
        }
    }
    Ok(parents)
}

/// Loads one scope, pushing tombstone visibility and `last_modified`
/// comparisons into SQL.
fn load_scope(
    conn: &Connection,
    resource_name: &str,
    parent_id: &str,
    options: &ListOptions,
) -> CoreResult<Vec<Object>> {
    let mut sql = format!("{OBJECT_SELECT_SQL} WHERE resource_name = ? AND parent_id = ?");
    let mut bind_values = vec![
        SqlValue::Text(resource_name.to_string()),
        SqlValue::Text(parent_id.to_string()),
    ];

    if !options.include_deleted {
        sql.push_str(" AND deleted = 0");
    }

    for filter in &options.filters {
        if filter.field != MODIFIED_FIELD {
            continue;
        }
        let Some(value) = filter.value.as_i64() else {
            continue;
        };
        let operator = match filter.op {
            FilterOp::Eq => "=",
            FilterOp::Lt => "<",
            FilterOp::Le => "<=",
            FilterOp::Gt => ">",
            FilterOp::Ge => ">=",
            _ => continue,
        };
        sql.push_str(&format!(" AND last_modified {operator} ?"));
        bind_values.push(SqlValue::Integer(value));
    }

    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query(params_from_iter(bind_values))?;
    let mut objects = Vec::new();
    while let Some(row) = rows.next()? {
        objects.push(parse_object_row(row)?);
    }
    Ok(objects)
}

fn parse_object_row(row: &Row<'_>) -> CoreResult<Object> {
    let id: String = row.get("id")?;
    let last_modified: i64 = row.get("last_modified")?;

    let deleted = match row.get::<_, i64>("deleted")? {
        0 => false,
        1 => true,
        other => {
            return Err(BackendError::InvalidData(format!(
                "invalid deleted value `{other}` in objects.deleted"
            ))
            .into());
        }
    };
    if deleted {
        return Ok(tombstone(&id, last_modified));
    }

    let data: String = row.get("data")?;
    let mut object: Object = serde_json::from_str(&data)?;
    object.insert(ID_FIELD.to_string(), Value::String(id));
    object.insert(MODIFIED_FIELD.to_string(), Value::from(last_modified));
    Ok(object)
}
