//! Permission backend contract.
//!
//! # Responsibility
//! - Store access control entries `(object_id, permission) -> principals`.
//! - Store group membership `user_id -> principals` and resolve it
//!   transitively.
//! - Answer "which objects can these principals reach" for shared listings.
//!
//! # Invariants
//! - An object without ACL entries has an empty principal set.
//! - Every principal entering a backend passes `validate_principal`.
//! - Object-id patterns use `*` as the only wildcard.

use crate::error::{BackendError, CoreResult};
use crate::utils::glob_match;
use std::collections::{BTreeMap, BTreeSet};

pub mod memory;
pub mod sqlite;

pub use memory::MemoryPermission;
pub use sqlite::SqlitePermission;

pub type PrincipalSet = BTreeSet<String>;

/// Permission name to principals, for one object.
pub type PermissionMap = BTreeMap<String, PrincipalSet>;

/// Object id (or `*` pattern) paired with a permission name.
pub type BoundPermission = (String, String);

/// Durable ACL store.
pub trait PermissionBackend: Send + Sync {
    /// Creates backend structures; `dry_run` only reports pending steps.
    fn initialize_schema(&self, dry_run: bool) -> CoreResult<()>;

    /// Removes every ACE and user principal.
    fn flush(&self) -> CoreResult<()>;

    fn add_user_principal(&self, user_id: &str, principal: &str) -> CoreResult<()>;

    fn remove_user_principal(&self, user_id: &str, principal: &str) -> CoreResult<()>;

    /// Removes `principal` from every user.
    fn remove_principal(&self, principal: &str) -> CoreResult<()>;

    /// Principals directly granted to `user_id`.
    fn user_principals(&self, user_id: &str) -> CoreResult<PrincipalSet>;

    fn add_principal_to_ace(
        &self,
        object_id: &str,
        permission: &str,
        principal: &str,
    ) -> CoreResult<()>;

    fn remove_principal_from_ace(
        &self,
        object_id: &str,
        permission: &str,
        principal: &str,
    ) -> CoreResult<()>;

    /// Principals holding `permission` on `object_id`.
    ///
    /// With `with_children`, every user inheriting one of them (through any
    /// depth of membership) is included too.
    fn object_permission_principals(
        &self,
        object_id: &str,
        permission: &str,
        with_children: bool,
    ) -> CoreResult<PrincipalSet>;

    /// Every permission of `object_id`, optionally restricted to `permissions`.
    fn object_permissions(
        &self,
        object_id: &str,
        permissions: Option<&[&str]>,
    ) -> CoreResult<PermissionMap>;

    /// Sets the full ACL of `object_id` to `permissions`.
    ///
    /// Every prior entry of the object is dropped first; permissions mapped
    /// to an empty set are not stored. Returns the resulting permissions.
    fn replace_object_permissions(
        &self,
        object_id: &str,
        permissions: &PermissionMap,
    ) -> CoreResult<PermissionMap>;

    /// Removes every ACE whose object id matches one of the patterns.
    fn delete_object_permissions(&self, object_id_patterns: &[&str]) -> CoreResult<()>;

    /// Removes every ACE of exactly these object ids; `*` is not a wildcard.
    fn delete_object_permissions_exact(&self, object_ids: &[&str]) -> CoreResult<()>;

    /// Objects on which any of `principals` holds a bound permission.
    ///
    /// An empty `bound_permissions` matches every permission of every object.
    fn accessible_objects(
        &self,
        principals: &PrincipalSet,
        bound_permissions: &[BoundPermission],
    ) -> CoreResult<BTreeMap<String, BTreeSet<String>>>;

    /// Principals holding at least one of `bound_permissions`.
    fn authorized_principals(
        &self,
        bound_permissions: &[BoundPermission],
    ) -> CoreResult<PrincipalSet>;

    /// `user_id` plus every principal it inherits transitively.
    fn resolve_principals(&self, user_id: &str) -> CoreResult<PrincipalSet> {
        validate_principal(user_id)?;
        let mut resolved = PrincipalSet::new();
        let mut pending = vec![user_id.to_string()];
        while let Some(next) = pending.pop() {
            if !resolved.insert(next.clone()) {
                continue;
            }
            pending.extend(
                self.user_principals(&next)?
                    .into_iter()
                    .filter(|principal| !resolved.contains(principal)),
            );
        }
        Ok(resolved)
    }

    fn check_permission(
        &self,
        principals: &PrincipalSet,
        bound_permissions: &[BoundPermission],
    ) -> CoreResult<bool> {
        validate_principals(principals)?;
        let authorized = self.authorized_principals(bound_permissions)?;
        Ok(!authorized.is_disjoint(principals))
    }
}

/// Rejects empty principals and principals with whitespace or control chars.
pub fn validate_principal(principal: &str) -> CoreResult<()> {
    if principal.is_empty()
        || principal
            .chars()
            .any(|ch| ch.is_whitespace() || ch.is_control())
    {
        return Err(BackendError::InvalidPrincipal(principal.to_string()).into());
    }
    Ok(())
}

pub(crate) fn validate_principals<'a>(
    principals: impl IntoIterator<Item = &'a String>,
) -> CoreResult<()> {
    principals
        .into_iter()
        .try_for_each(|principal| validate_principal(principal))
}

/// True when `permission` on `object_id` is covered by `bound_permissions`.
pub(crate) fn is_bound(
    object_id: &str,
    permission: &str,
    bound_permissions: &[BoundPermission],
) -> bool {
    bound_permissions.is_empty()
        || bound_permissions.iter().any(|(pattern, bound)| {
            bound == permission && glob_match(pattern, object_id)
        })
}

/// Expands `direct` with every user whose membership reaches one of them.
pub(crate) fn expand_members(
    direct: PrincipalSet,
    memberships: &BTreeMap<String, PrincipalSet>,
) -> PrincipalSet {
    let mut expanded = direct;
    loop {
        let before = expanded.len();
        let inheriting: Vec<String> = memberships
            .iter()
            .filter(|(user_id, principals)| {
                !expanded.contains(*user_id) && !principals.is_disjoint(&expanded)
            })
            .map(|(user_id, _)| user_id.clone())
            .collect();
        expanded.extend(inheriting);
        if expanded.len() == before {
            return expanded;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{expand_members, is_bound, validate_principal, PrincipalSet};
    use std::collections::BTreeMap;

    fn set(values: &[&str]) -> PrincipalSet {
        values.iter().map(|value| value.to_string()).collect()
    }

    #[test]
    fn principal_validation_rejects_blank_and_spaced_values() {
        assert!(validate_principal("account:alice").is_ok());
        assert!(validate_principal("").is_err());
        assert!(validate_principal("account: alice").is_err());
        assert!(validate_principal("group\u{7}").is_err());
    }

    #[test]
    fn bound_permissions_match_patterns_and_names() {
        let bound = vec![("/buckets/*".to_string(), "read".to_string())];
        assert!(is_bound("/buckets/a", "read", &bound));
        assert!(!is_bound("/buckets/a", "write", &bound));
        assert!(!is_bound("/groups/a", "read", &bound));
        assert!(is_bound("/groups/a", "write", &[]));
    }

    #[test]
    fn member_expansion_is_transitive() {
        let mut memberships = BTreeMap::new();
        memberships.insert("alice".to_string(), set(&["group:dev"]));
        memberships.insert("group:dev".to_string(), set(&["group:staff"]));
        memberships.insert("bob".to_string(), set(&["group:ops"]));

        let expanded = expand_members(set(&["group:staff"]), &memberships);
        assert_eq!(expanded, set(&["alice", "group:dev", "group:staff"]));
    }
}
