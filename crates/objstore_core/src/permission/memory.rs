//! In-process permission backend.

use crate::error::CoreResult;
use crate::permission::{
    expand_members, is_bound, validate_principal, validate_principals, BoundPermission,
    PermissionBackend, PermissionMap, PrincipalSet,
};
use crate::utils::glob_match;
use log::info;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};

type AceKey = (String, String);

#[derive(Default)]
struct PermissionState {
    aces: BTreeMap<AceKey, PrincipalSet>,
    memberships: BTreeMap<String, PrincipalSet>,
}

/// Permission backend kept entirely in memory.
#[derive(Default)]
pub struct MemoryPermission {
    state: Mutex<PermissionState>,
}

impl MemoryPermission {
    pub fn new() -> Self {
        Self::default()
    }
}

fn ace_key(object_id: &str, permission: &str) -> AceKey {
    (object_id.to_string(), permission.to_string())
}

impl PermissionBackend for MemoryPermission {
    fn initialize_schema(&self, dry_run: bool) -> CoreResult<()> {
        info!(
            "event=schema_migrate module=permission status=skip backend=memory dry_run={}",
            dry_run
        );
        Ok(())
    }

    fn flush(&self) -> CoreResult<()> {
        let mut state = self.state.lock();
        state.aces.clear();
        state.memberships.clear();
        info!("event=flush module=permission status=ok backend=memory");
        Ok(())
    }

    fn add_user_principal(&self, user_id: &str, principal: &str) -> CoreResult<()> {
        validate_principal(user_id)?;
        validate_principal(principal)?;
        self.state
            .lock()
            .memberships
            .entry(user_id.to_string())
            .or_default()
            .insert(principal.to_string());
        Ok(())
    }

    fn remove_user_principal(&self, user_id: &str, principal: &str) -> CoreResult<()> {
        let mut state = self.state.lock();
        if let Some(principals) = state.memberships.get_mut(user_id) {
            principals.remove(principal);
            if principals.is_empty() {
                state.memberships.remove(user_id);
            }
        }
        Ok(())
    }

    fn remove_principal(&self, principal: &str) -> CoreResult<()> {
        let mut state = self.state.lock();
        for principals in state.memberships.values_mut() {
            principals.remove(principal);
        }
        state.memberships.retain(|_, principals| !principals.is_empty());
        Ok(())
    }

    fn user_principals(&self, user_id: &str) -> CoreResult<PrincipalSet> {
        Ok(self
            .state
            .lock()
            .memberships
            .get(user_id)
            .cloned()
            .unwrap_or_default())
    }

    fn add_principal_to_ace(
        &self,
        object_id: &str,
        permission: &str,
        principal: &str,
    ) -> CoreResult<()> {
        validate_principal(principal)?;
        self.state
            .lock()
            .aces
            .entry(ace_key(object_id, permission))
            .or_default()
            .insert(principal.to_string());
        Ok(())
    }

    fn remove_principal_from_ace(
        &self,
        object_id: &str,
        permission: &str,
        principal: &str,
    ) -> CoreResult<()> {
        let mut state = self.state.lock();
        let key = ace_key(object_id, permission);
        if let Some(principals) = state.aces.get_mut(&key) {
            principals.remove(principal);
            if principals.is_empty() {
                state.aces.remove(&key);
            }
        }
        Ok(())
    }

    fn object_permission_principals(
        &self,
        object_id: &str,
        permission: &str,
        with_children: bool,
    ) -> CoreResult<PrincipalSet> {
        let state = self.state.lock();
        let direct = state
            .aces
            .get(&ace_key(object_id, permission))
            .cloned()
            .unwrap_or_default();
        if !with_children {
            return Ok(direct);
        }
        Ok(expand_members(direct, &state.memberships))
    }

    fn object_permissions(
        &self,
        object_id: &str,
        permissions: Option<&[&str]>,
    ) -> CoreResult<PermissionMap> {
        let state = self.state.lock();
        Ok(state
            .aces
            .iter()
            .filter(|((id, permission), _)| {
                id == object_id
                    && permissions.map_or(true, |wanted| wanted.contains(&permission.as_str()))
            })
            .map(|((_, permission), principals)| (permission.clone(), principals.clone()))
            .collect())
    }

    fn replace_object_permissions(
        &self,
        object_id: &str,
        permissions: &PermissionMap,
    ) -> CoreResult<PermissionMap> {
        validate_principals(permissions.values().flatten())?;
        {
            let mut state = self.state.lock();
            state.aces.retain(|(id, _), _| id != object_id);
            for (permission, principals) in permissions {
                if !principals.is_empty() {
                    state
                        .aces
                        .insert(ace_key(object_id, permission), principals.clone());
                }
            }
        }
        self.object_permissions(object_id, None)
    }

    fn delete_object_permissions(&self, object_id_patterns: &[&str]) -> CoreResult<()> {
        if object_id_patterns.is_empty() {
            return Ok(());
        }
        let mut state = self.state.lock();
        state.aces.retain(|(object_id, _), _| {
            !object_id_patterns
                .iter()
                .any(|pattern| glob_match(pattern, object_id))
        });
        Ok(())
    }

    fn delete_object_permissions_exact(&self, object_ids: &[&str]) -> CoreResult<()> {
        if object_ids.is_empty() {
            return Ok(());
        }
        let mut state = self.state.lock();
        state
            .aces
            .retain(|(object_id, _), _| !object_ids.contains(&object_id.as_str()));
        Ok(())
    }

    fn accessible_objects(
        &self,
        principals: &PrincipalSet,
        bound_permissions: &[BoundPermission],
    ) -> CoreResult<BTreeMap<String, BTreeSet<String>>> {
        validate_principals(principals)?;
        let state = self.state.lock();
        let mut accessible: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        for ((object_id, permission), granted) in &state.aces {
            if granted.is_disjoint(principals)
                || !is_bound(object_id, permission, bound_permissions)
            {
                continue;
            }
            accessible
                .entry(object_id.clone())
                .or_default()
                .insert(permission.clone());
        }
        Ok(accessible)
    }

    fn authorized_principals(
        &self,
        bound_permissions: &[BoundPermission],
    ) -> CoreResult<PrincipalSet> {
        let state = self.state.lock();
        Ok(state
            .aces
            .iter()
            .filter(|((object_id, permission), _)| {
                is_bound(object_id, permission, bound_permissions)
            })
            .flat_map(|(_, principals)| principals.iter().cloned())
            .collect())
    }
}
