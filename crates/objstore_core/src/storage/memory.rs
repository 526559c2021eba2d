//! In-process storage backend.
//!
//! # Responsibility
//! - Keep objects and tombstones per scope in ordered maps.
//! - Serve tests and single-process deployments.
//!
//! # Invariants
//! - One mutex guards every scope, so timestamp assignment is serialized.
//! - Nothing survives the process.

use crate::error::{CoreError, CoreResult};
use crate::id_generator::IdGenerator;
use crate::storage::query;
use crate::storage::{
    bump_timestamp, explicit_timestamp, find_unicity_conflict, is_tombstone, tombstone,
    ListOptions, Object, ObjectPage, StorageBackend, DELETED_FIELD, ID_FIELD, MODIFIED_FIELD,
};
use crate::utils::{glob_match, now_millis};
use log::{debug, info};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::BTreeMap;

type ScopeKey = (String, String);

#[derive(Default)]
struct MemoryState {
    scopes: BTreeMap<ScopeKey, BTreeMap<String, Object>>,
    timestamps: BTreeMap<ScopeKey, i64>,
}

impl MemoryState {
    fn bump(&mut self, key: &ScopeKey, explicit: Option<i64>) -> i64 {
        let next = bump_timestamp(self.timestamps.get(key).copied(), now_millis(), explicit);
        self.timestamps.insert(key.clone(), next);
        next
    }

    fn matching_scopes(&self, resource_name: &str, parent_id: &str) -> Vec<ScopeKey> {
        self.scopes
            .keys()
            .filter(|(resource, parent)| resource == resource_name && glob_match(parent_id, parent))
            .cloned()
            .collect()
    }

    fn store(
        &mut self,
        key: ScopeKey,
        id: String,
        mut object: Object,
        resource_name: &str,
        unique_fields: &[String],
    ) -> CoreResult<Object> {
        object.insert(ID_FIELD.to_string(), Value::String(id.clone()));
        object.remove(DELETED_FIELD);

        if let Some(scope) = self.scopes.get(&key) {
            if let Some((existing, field)) =
                find_unicity_conflict(scope.values(), &object, unique_fields)
            {
                return Err(CoreError::unicity(resource_name, &field, existing));
            }
        }

        let last_modified = self.bump(&key, explicit_timestamp(&object));
        object.insert(MODIFIED_FIELD.to_string(), Value::from(last_modified));
        self.scopes
            .entry(key)
            .or_default()
            .insert(id, object.clone());
        Ok(object)
    }
}

/// Storage backend kept entirely in memory.
#[derive(Default)]
pub struct MemoryStorage {
    state: Mutex<MemoryState>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

fn scope_key(resource_name: &str, parent_id: &str) -> ScopeKey {
    (resource_name.to_string(), parent_id.to_string())
}

impl StorageBackend for MemoryStorage {
    fn initialize_schema(&self, dry_run: bool) -> CoreResult<()> {
        info!(
            "event=schema_migrate module=storage status=skip backend=memory dry_run={}",
            dry_run
        );
        Ok(())
    }

    fn flush(&self) -> CoreResult<()> {
        let mut state = self.state.lock();
        state.scopes.clear();
        state.timestamps.clear();
        info!("event=flush module=storage status=ok backend=memory");
        Ok(())
    }

    fn resource_timestamp(&self, resource_name: &str, parent_id: &str) -> CoreResult<i64> {
        let mut state = self.state.lock();
        let key = scope_key(resource_name, parent_id);
        if let Some(current) = state.timestamps.get(&key) {
            return Ok(*current);
        }
        Ok(state.bump(&key, None))
    }

    fn create(
        &self,
        resource_name: &str,
        parent_id: &str,
        object: Object,
        id_generator: &dyn IdGenerator,
        unique_fields: &[String],
    ) -> CoreResult<Object> {
        let mut state = self.state.lock();
        let key = scope_key(resource_name, parent_id);
        let id = match object.get(ID_FIELD).and_then(Value::as_str) {
            Some(id) => id.to_string(),
            None => id_generator.generate(resource_name),
        };

        if let Some(existing) = state.scopes.get(&key).and_then(|scope| scope.get(&id)) {
            if !is_tombstone(existing) {
                return Err(CoreError::unicity(resource_name, ID_FIELD, existing));
            }
        }

        let created = state.store(key, id, object, resource_name, unique_fields)?;
        debug!(
            "event=object_create module=storage status=ok backend=memory resource={}",
            resource_name
        );
        Ok(created)
    }

    fn get(&self, resource_name: &str, parent_id: &str, id: &str) -> CoreResult<Object> {
        let state = self.state.lock();
        state
            .scopes
            .get(&scope_key(resource_name, parent_id))
            .and_then(|scope| scope.get(id))
            .filter(|object| !is_tombstone(object))
            .cloned()
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
        let mut state = self.state.lock();
        let key = scope_key(resource_name, parent_id);
        state.store(key, id.to_string(), object, resource_name, unique_fields)
    }

    fn delete(
        &self,
        resource_name: &str,
        parent_id: &str,
        id: &str,
        last_modified: Option<i64>,
    ) -> CoreResult<Object> {
        let mut state = self.state.lock();
        let key = scope_key(resource_name, parent_id);
        let exists = state
            .scopes
            .get(&key)
            .and_then(|scope| scope.get(id))
            .is_some_and(|object| !is_tombstone(object));
        if !exists {
            return Err(CoreError::not_found(resource_name, parent_id, id));
        }

        let timestamp = state.bump(&key, last_modified);
        let deleted = tombstone(id, timestamp);
        state
            .scopes
            .entry(key)
            .or_default()
            .insert(id.to_string(), deleted.clone());
        Ok(deleted)
    }

    fn delete_all(
        &self,
        resource_name: &str,
        parent_id: &str,
        options: &ListOptions,
    ) -> CoreResult<Vec<Object>> {
        let mut state = self.state.lock();
        let live_only = ListOptions {
            include_deleted: false,
            ..options.clone()
        };

        let mut deleted = Vec::new();
        for key in state.matching_scopes(resource_name, parent_id) {
            let candidates: Vec<Object> = state
                .scopes
                .get(&key)
                .map(|scope| scope.values().cloned().collect())
                .unwrap_or_default();
            let page = query::apply(candidates, &live_only);

            for object in page.objects {
                let Some(id) = object.get(ID_FIELD).and_then(Value::as_str) else {
                    continue;
                };
                let timestamp = state.bump(&key, None);
                let marker = tombstone(id, timestamp);
                state
                    .scopes
                    .entry(key.clone())
                    .or_default()
                    .insert(id.to_string(), marker.clone());
                deleted.push(marker);
            }
        }
        Ok(deleted)
    }

    fn list_all(
        &self,
        resource_name: &str,
        parent_id: &str,
        options: &ListOptions,
    ) -> CoreResult<ObjectPage> {
        let state = self.state.lock();
        let candidates: Vec<Object> = state
            .matching_scopes(resource_name, parent_id)
            .iter()
            .filter_map(|key| state.scopes.get(key))
            .flat_map(|scope| scope.values().cloned())
            .collect();
        Ok(query::apply(candidates, options))
    }

    fn purge_deleted(
        &self,
        resource_name: &str,
        parent_id: &str,
        max_retained: Option<usize>,
        before: Option<i64>,
    ) -> CoreResult<usize> {
        let mut state = self.state.lock();
        let mut removed = 0;

        for key in state.matching_scopes(resource_name, parent_id) {
            let Some(scope) = state.scopes.get_mut(&key) else {
                continue;
            };
            let mut tombstones: Vec<(i64, String)> = scope
                .iter()
                .filter(|(_, object)| is_tombstone(object))
                .map(|(id, object)| (explicit_timestamp(object).unwrap_or(0), id.clone()))
                .collect();
            tombstones.sort_by(|a, b| b.cmp(a));

            for (last_modified, id) in tombstones.into_iter().skip(max_retained.unwrap_or(0)) {
                if before.is_some_and(|limit| last_modified >= limit) {
                    continue;
                }
                scope.remove(&id);
                removed += 1;
            }
        }

        info!(
            "event=purge_deleted module=storage status=ok backend=memory resource={} removed={}",
            resource_name, removed
        );
        Ok(removed)
    }
}
