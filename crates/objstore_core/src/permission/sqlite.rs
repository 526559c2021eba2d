//! SQLite permission backend.
//!
//! # Responsibility
//! - Persist ACEs in `access_control_entries` and memberships in
//!   `user_principals`.
//!
//! # Invariants
//! - One row per `(object_id, permission, principal)`; inserts are idempotent.
//! - Object-id patterns are translated to SQLite `GLOB` with every character
//!   other than `*` matched literally.

use crate::db::migrations::{apply_migrations, PERMISSION_MIGRATIONS};
use crate::db::{open_db, open_db_in_memory};
use crate::error::CoreResult;
use crate::permission::{
    expand_members, is_bound, validate_principal, validate_principals, BoundPermission,
    PermissionBackend, PermissionMap, PrincipalSet,
};
use log::info;
use parking_lot::Mutex;
use rusqlite::{params, params_from_iter, Connection, TransactionBehavior};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

/// Permission backend persisted in SQLite.
pub struct SqlitePermission {
    conn: Mutex<Connection>,
}

impl SqlitePermission {
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

impl PermissionBackend for SqlitePermission {
    fn initialize_schema(&self, dry_run: bool) -> CoreResult<()> {
        let mut conn = self.conn.lock();
        apply_migrations(&mut conn, &PERMISSION_MIGRATIONS, dry_run)?;
        Ok(())
    }

    fn flush(&self) -> CoreResult<()> {
        let conn = self.conn.lock();
        conn.execute_batch("DELETE FROM access_control_entries; DELETE FROM user_principals;")?;
        info!("event=flush module=permission status=ok backend=sqlite");
        Ok(())
    }

    fn add_user_principal(&self, user_id: &str, principal: &str) -> CoreResult<()> {
        validate_principal(user_id)?;
        validate_principal(principal)?;
        let conn = self.conn.lock();
        conn.execute(
            "INSERT OR IGNORE INTO user_principals (user_id, principal) VALUES (?1, ?2);",
            params![user_id, principal],
        )?;
        Ok(())
    }

    fn remove_user_principal(&self, user_id: &str, principal: &str) -> CoreResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "DELETE FROM user_principals WHERE user_id = ?1 AND principal = ?2;",
            params![user_id, principal],
        )?;
        Ok(())
    }

    fn remove_principal(&self, principal: &str) -> CoreResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "DELETE FROM user_principals WHERE principal = ?1;",
            [principal],
        )?;
        Ok(())
    }

    fn user_principals(&self, user_id: &str) -> CoreResult<PrincipalSet> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT principal FROM user_principals WHERE user_id = ?1 ORDER BY principal;",
        )?;
        let mut rows = stmt.query([user_id])?;
        let mut principals = PrincipalSet::new();
        while let Some(row) = rows.next()? {
            principals.insert(row.get(0)?);
        }
        Ok(principals)
    }

    fn add_principal_to_ace(
        &self,
        object_id: &str,
        permission: &str,
        principal: &str,
    ) -> CoreResult<()> {
        validate_principal(principal)?;
        let conn = self.conn.lock();
        conn.execute(
            "INSERT OR IGNORE INTO access_control_entries (object_id, permission, principal)
             VALUES (?1, ?2, ?3);",
            params![object_id, permission, principal],
        )?;
        Ok(())
    }

    fn remove_principal_from_ace(
        &self,
        object_id: &str,
        permission: &str,
        principal: &str,
    ) -> CoreResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "DELETE FROM access_control_entries
             WHERE object_id = ?1
               AND permission = ?2
               AND principal = ?3;",
            params![object_id, permission, principal],
        )?;
        Ok(())
    }

    fn object_permission_principals(
        &self,
        object_id: &str,
        permission: &str,
        with_children: bool,
    ) -> CoreResult<PrincipalSet> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT principal
             FROM access_control_entries
             WHERE object_id = ?1
               AND permission = ?2;",
        )?;
        let mut rows = stmt.query(params![object_id, permission])?;
        let mut direct = PrincipalSet::new();
        while let Some(row) = rows.next()? {
            direct.insert(row.get(0)?);
        }
        if !with_children {
            return Ok(direct);
        }
        Ok(expand_members(direct, &load_memberships(&conn)?))
    }

    fn object_permissions(
        &self,
        object_id: &str,
        permissions: Option<&[&str]>,
    ) -> CoreResult<PermissionMap> {
        let conn = self.conn.lock();
        read_object_permissions(&conn, object_id, permissions)
    }

    fn replace_object_permissions(
        &self,
        object_id: &str,
        permissions: &PermissionMap,
    ) -> CoreResult<PermissionMap> {
        validate_principals(permissions.values().flatten())?;

        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        tx.execute(
            "DELETE FROM access_control_entries WHERE object_id = ?1;",
            [object_id],
        )?;
        for (permission, principals) in permissions {
            for principal in principals {
                tx.execute(
                    "INSERT INTO access_control_entries (object_id, permission, principal)
                     VALUES (?1, ?2, ?3);",
                    params![object_id, permission, principal],
                )?;
            }
        }
        let replaced = read_object_permissions(&tx, object_id, None)?;
        tx.commit()?;
        Ok(replaced)
    }

    fn delete_object_permissions(&self, object_id_patterns: &[&str]) -> CoreResult<()> {
        if object_id_patterns.is_empty() {
            return Ok(());
        }
        let clauses = vec!["object_id GLOB ?"; object_id_patterns.len()].join(" OR ");
        let sql = format!("DELETE FROM access_control_entries WHERE {clauses};");

        let conn = self.conn.lock();
        let removed = conn.execute(
            &sql,
            params_from_iter(object_id_patterns.iter().map(|pattern| sql_glob(pattern))),
        )?;
        info!(
            "event=permissions_delete module=permission status=ok backend=sqlite patterns={} removed={}",
            object_id_patterns.len(),
            removed
        );
        Ok(())
    }

    fn delete_object_permissions_exact(&self, object_ids: &[&str]) -> CoreResult<()> {
        if object_ids.is_empty() {
            return Ok(());
        }
        let placeholders = vec!["?"; object_ids.len()].join(", ");
        let sql = format!("DELETE FROM access_control_entries WHERE object_id IN ({placeholders});");

        let conn = self.conn.lock();
        let removed = conn.execute(&sql, params_from_iter(object_ids.iter()))?;
        info!(
            "event=permissions_delete module=permission status=ok backend=sqlite objects={} removed={}",
            object_ids.len(),
            removed
        );
        Ok(())
    }

    fn accessible_objects(
        &self,
        principals: &PrincipalSet,
        bound_permissions: &[BoundPermission],
    ) -> CoreResult<BTreeMap<String, BTreeSet<String>>> {
        validate_principals(principals)?;
        if principals.is_empty() {
            return Ok(BTreeMap::new());
        }
        let placeholders = vec!["?"; principals.len()].join(", ");
        let sql = format!(
            "SELECT DISTINCT object_id, permission
             FROM access_control_entries
             WHERE principal IN ({placeholders})
             ORDER BY object_id, permission;"
        );

        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&sql)?;
        let mut rows = stmt.query(params_from_iter(principals.iter()))?;
        let mut accessible: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        while let Some(row) = rows.next()? {
            let object_id: String = row.get(0)?;
            let permission: String = row.get(1)?;
            if is_bound(&object_id, &permission, bound_permissions) {
                accessible.entry(object_id).or_default().insert(permission);
            }
        }
        Ok(accessible)
    }

    fn authorized_principals(
        &self,
        bound_permissions: &[BoundPermission],
    ) -> CoreResult<PrincipalSet> {
        let conn = self.conn.lock();
        let mut stmt =
            conn.prepare("SELECT object_id, permission, principal FROM access_control_entries;")?;
        let mut rows = stmt.query([])?;
        let mut principals = PrincipalSet::new();
        while let Some(row) = rows.next()? {
            let object_id: String = row.get(0)?;
            let permission: String = row.get(1)?;
            if is_bound(&object_id, &permission, bound_permissions) {
                principals.insert(row.get(2)?);
            }
        }
        Ok(principals)
    }
}

fn read_object_permissions(
    conn: &Connection,
    object_id: &str,
    permissions: Option<&[&str]>,
) -> CoreResult<PermissionMap> {
    let mut stmt = conn.prepare(
        "SELECT permission, principal
         FROM access_control_entries
         WHERE object_id = ?1
         ORDER BY permission, principal;",
    )?;
    let mut rows = stmt.query([object_id])?;
    let mut map = PermissionMap::new();
    while let Some(row) = rows.next()? {
        let permission: String = row.get(0)?;
        if permissions.is_some_and(|wanted| !wanted.contains(&permission.as_str())) {
            continue;
        }
        map.entry(permission).or_default().insert(row.get(1)?);
    }
    Ok(map)
}

fn load_memberships(conn: &Connection) -> CoreResult<BTreeMap<String, PrincipalSet>> {
    let mut stmt = conn.prepare("SELECT user_id, principal FROM user_principals;")?;
    let mut rows = stmt.query([])?;
    let mut memberships: BTreeMap<String, PrincipalSet> = BTreeMap::new();
    while let Some(row) = rows.next()? {
        let user_id: String = row.get(0)?;
        memberships.entry(user_id).or_default().insert(row.get(1)?);
    }
    Ok(memberships)
}

/// Escapes GLOB metacharacters except `*`.
fn sql_glob(pattern: &str) -> String {
    let mut escaped = String::with_capacity(pattern.len());
    for ch in pattern.chars() {
        match ch {
            '?' => escaped.push_str("[?]"),
            '[' => escaped.push_str("[[]"),
            other => escaped.push(other),
        }
    }
    escaped
}

#[cfg(test)]
mod tests {
    use super::sql_glob;

    #[test]
    fn glob_escaping_keeps_only_star_wildcards() {
        assert_eq!(sql_glob("/buckets/*"), "/buckets/*");
        assert_eq!(sql_glob("/a?b[c]"), "/a[?]b[[]c]");
    }
}
