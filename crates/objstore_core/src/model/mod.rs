//! Resource model orchestrating storage and permissions for one scope.
//!
//! # Responsibility
//! - Apply validation, key sanitization, id generation and optimistic
//!   concurrency checks before delegating to the storage backend.
//! - Seed and remove ACLs around object writes.
//! - Serve filtered listings and keyset-paginated pages.
//!
//! # Invariants
//! - Storage is always written first, permissions second. A permission
//!   failure yields `PartialWrite` and is logged; storage is not rolled back.
//! - The `last_modified` precondition is checked here, not in backends.
//! - Caller-supplied `last_modified` is ignored except by `import_object`.
//!
//! # See also
//! - `crate::storage::StorageBackend`
//! - `crate::permission::PermissionBackend`

pub mod hooks;

pub use hooks::{ModelEvent, ModelListener, ObjectValidator};

use crate::admin::Backends;
use crate::error::{CoreError, CoreResult};
use crate::id_generator::{IdGenerator, Uuid4Generator};
use crate::pagination::PaginationToken;
use crate::permission::{BoundPermission, PermissionBackend, PermissionMap, PrincipalSet};
use crate::storage::{
    explicit_timestamp, Filter, FilterOp, ListOptions, Object, ObjectPage, Sort,
    StorageBackend, ID_FIELD, MODIFIED_FIELD,
};
use crate::utils::{merge_patch, sanitize_object};
use log::{debug, error, info};
use serde_json::Value;
use std::sync::Arc;

/// Permissions that make an object visible in shared listings.
pub const READ_PERMISSIONS: [&str; 2] = ["read", "write"];

/// Static configuration of one model instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelConfig {
    pub resource_name: String,
    pub parent_id: String,
    /// Principal performing writes; receives `creator_permissions`.
    pub current_principal: Option<String>,
    pub creator_permissions: Vec<String>,
    /// Fields whose values must be unique among live objects of the scope.
    pub unique_fields: Vec<String>,
    /// When false, creators get no ACE of their own and rely on inherited
    /// permissions.
    pub explicit_permissions: bool,
    pub readonly: bool,
    /// Page size used by `get_page` when the request sets no limit.
    pub paginate_by: Option<usize>,
}

impl ModelConfig {
    pub fn new(resource_name: impl Into<String>, parent_id: impl Into<String>) -> Self {
        Self {
            resource_name: resource_name.into(),
            parent_id: parent_id.into(),
            current_principal: None,
            creator_permissions: vec!["read".to_string(), "write".to_string()],
            unique_fields: Vec::new(),
            explicit_permissions: true,
            readonly: false,
            paginate_by: None,
        }
    }

    pub fn with_principal(mut self, principal: impl Into<String>) -> Self {
        self.current_principal = Some(principal.into());
        self
    }
}

/// Visibility applied to listings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListScope {
    /// Every object of the scope.
    All,
    /// Only objects on which one of the principals holds a read permission.
    Shared(PrincipalSet),
}

/// One keyset-paginated page request.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PageRequest {
    pub filters: Vec<Filter>,
    pub sorting: Vec<Sort>,
    pub limit: Option<usize>,
    /// Opaque cursor returned as `Page::next_cursor` by the previous page.
    pub token: Option<String>,
    pub include_deleted: bool,
}

/// Page of objects plus the cursor of the following page, if any.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Page {
    pub objects: Vec<Object>,
    /// Objects matching the filters as of the first page's snapshot.
    pub count: usize,
    pub next_cursor: Option<String>,
}

/// Resource model for one `(resource_name, parent_id)` scope.
pub struct Model {
    storage: Arc<dyn StorageBackend>,
    permission: Arc<dyn PermissionBackend>,
    id_generator: Arc<dyn IdGenerator>,
    validators: Vec<Box<dyn ObjectValidator>>,
    listeners: Vec<Arc<dyn ModelListener>>,
    config: ModelConfig,
}

impl Model {
    /// Creates a model sharing the storage and permission handles of `backends`.
    pub fn new(backends: &Backends, config: ModelConfig) -> Self {
        Self {
            storage: Arc::clone(&backends.storage),
            permission: Arc::clone(&backends.permission),
            id_generator: Arc::new(Uuid4Generator::default()),
            validators: Vec::new(),
            listeners: Vec::new(),
            config,
        }
    }

    pub fn with_id_generator(mut self, id_generator: Arc<dyn IdGenerator>) -> Self {
        self.id_generator = id_generator;
        self
    }

    pub fn with_validator(mut self, validator: impl ObjectValidator + 'static) -> Self {
        self.validators.push(Box::new(validator));
        self
    }

    pub fn with_listener(mut self, listener: Arc<dyn ModelListener>) -> Self {
        self.listeners.push(listener);
        self
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    /// Current timestamp of the model scope.
    pub fn timestamp(&self) -> CoreResult<i64> {
        self.storage
            .resource_timestamp(&self.config.resource_name, &self.config.parent_id)
    }

    /// Object id used as key in the permission backend.
    pub fn permission_object_id(&self, id: &str) -> String {
        format!(
            "{}/{}/{}",
            self.config.parent_id, self.config.resource_name, id
        )
    }

    /// Creates a new object.
    ///
    /// # Contract
    /// - Validators run on the raw object; keys are sanitized afterwards.
    /// - Caller `last_modified` is dropped; caller `id` must match the id
    ///   generator.
    /// - The creator and `permissions` are written to the permission
    ///   backend after storage succeeds.
    pub fn create_object(&self, object: Object, permissions: &PermissionMap) -> CoreResult<Object> {
        self.ensure_writable("create_object")?;
        self.run_validators(&object)?;

        let mut object = sanitize_object(object);
        object.remove(MODIFIED_FIELD);
        self.caller_id(&object)?;

        let created = self.storage.create(
            &self.config.resource_name,
            &self.config.parent_id,
            object,
            self.id_generator.as_ref(),
            &self.config.unique_fields,
        )?;
        self.seed_permissions(&created, permissions)?;

        info!(
            "event=object_create module=model status=ok resource={} parent={} id={}",
            self.config.resource_name,
            self.config.parent_id,
            object_id(&created)
        );
        self.notify(|| ModelEvent::Created {
            object: created.clone(),
        });
        Ok(created)
    }

    /// Restores an object keeping its `id` and `last_modified`.
    ///
    /// The stored `last_modified` still honours scope monotonicity: a value
    /// not above the scope timestamp is replaced by the next one.
    pub fn import_object(&self, object: Object) -> CoreResult<Object> {
        self.ensure_writable("import_object")?;
        self.run_validators(&object)?;

        let object = sanitize_object(object);
        let id = match self.caller_id(&object)? {
            Some(id) => id,
            None => self.id_generator.generate(&self.config.resource_name),
        };
        let existing = self.find_object(&id)?;
        self.store(&id, object, existing)
    }

    pub fn get_object(&self, id: &str) -> CoreResult<Object> {
        self.storage
            .get(&self.config.resource_name, &self.config.parent_id, id)
    }

    /// Replaces (or creates) the object stored under `id`.
    ///
    /// # Contract
    /// - With `last_modified`, fails with `Conflict` unless the stored object
    ///   exists and carries exactly that value.
    /// - Returns the stored object with a strictly greater `last_modified`.
    pub fn update_object(
        &self,
        id: &str,
        object: Object,
        last_modified: Option<i64>,
    ) -> CoreResult<Object> {
        self.ensure_writable("update_object")?;
        self.id_generator
            .validate(&self.config.resource_name, id)?;

        let existing = self.find_object(id)?;
        check_revision(id, existing.as_ref(), last_modified)?;
        self.run_validators(&object)?;

        let mut object = sanitize_object(object);
        object.remove(MODIFIED_FIELD);
        self.store(id, object, existing)
    }

    /// Applies a JSON merge patch to an existing object.
    pub fn patch_object(
        &self,
        id: &str,
        changes: &Object,
        last_modified: Option<i64>,
    ) -> CoreResult<Object> {
        self.ensure_writable("patch_object")?;
        let existing = self.get_object(id)?;
        check_revision(id, Some(&existing), last_modified)?;

        let mut merged = Value::Object(existing.clone());
        merge_patch(&mut merged, &Value::Object(changes.clone()));
        let Value::Object(mut object) = merged else {
            return Err(CoreError::InvalidObject(
                "merge patch did not produce an object".to_string(),
            ));
        };
        self.run_validators(&object)?;

        object = sanitize_object(object);
        object.remove(MODIFIED_FIELD);
        self.store(id, object, Some(existing))
    }

    /// Tombstones the object and removes its ACL.
    pub fn delete_object(&self, id: &str, last_modified: Option<i64>) -> CoreResult<Object> {
        self.ensure_writable("delete_object")?;
        let existing = self.get_object(id)?;
        check_revision(id, Some(&existing), last_modified)?;

        let tombstone = self.storage.delete(
            &self.config.resource_name,
            &self.config.parent_id,
            id,
            None,
        )?;
        let acl_id = self.permission_object_id(id);
        if let Err(err) = self.permission.delete_object_permissions_exact(&[acl_id.as_str()]) {
            return Err(self.partial_write(vec![tombstone], err));
        }

        info!(
            "event=object_delete module=model status=ok resource={} parent={} id={}",
            self.config.resource_name, self.config.parent_id, id
        );
        self.notify(|| ModelEvent::Deleted {
            old: Some(existing.clone()),
            tombstone: tombstone.clone(),
        });
        Ok(tombstone)
    }

    /// Tombstones every live object matching `options` and removes their ACLs.
    pub fn delete_objects(&self, options: &ListOptions) -> CoreResult<Vec<Object>> {
        self.ensure_writable("delete_objects")?;
        let deleted = self.storage.delete_all(
            &self.config.resource_name,
            &self.config.parent_id,
            options,
        )?;
        if deleted.is_empty() {
            return Ok(deleted);
        }

        let acl_ids: Vec<String> = deleted
            .iter()
            .map(|tombstone| self.permission_object_id(object_id(tombstone)))
            .collect();
        let acl_refs: Vec<&str> = acl_ids.iter().map(String::as_str).collect();
        if let Err(err) = self.permission.delete_object_permissions_exact(&acl_refs) {
            return Err(self.partial_write(deleted, err));
        }

        info!(
            "event=objects_delete module=model status=ok resource={} parent={} count={}",
            self.config.resource_name,
            self.config.parent_id,
            deleted.len()
        );
        for tombstone in &deleted {
            self.notify(|| ModelEvent::Deleted {
                old: None,
                tombstone: tombstone.clone(),
            });
        }
        Ok(deleted)
    }

    /// Lists objects of the scope, optionally restricted to shared ones.
    pub fn get_objects(&self, options: &ListOptions, scope: &ListScope) -> CoreResult<ObjectPage> {
        let Some(options) = self.scoped_options(options, scope)? else {
            return Ok(ObjectPage::default());
        };
        self.storage.list_all(
            &self.config.resource_name,
            &self.config.parent_id,
            &options,
        )
    }

    /// Returns one keyset-paginated page.
    ///
    /// # Contract
    /// - Sorting defaults to `last_modified` ascending; `last_modified` is
    ///   appended as the final key so every page boundary is exact.
    /// - Pages only contain objects written at or before the first page's
    ///   snapshot, so later writes never shift or duplicate served rows.
    pub fn get_page(&self, request: &PageRequest, scope: &ListScope) -> CoreResult<Page> {
        let mut sorting = request.sorting.clone();
        if !sorting.iter().any(|sort| sort.field == MODIFIED_FIELD) {
            sorting.push(Sort::asc(MODIFIED_FIELD));
        }

        let (pagination_rules, snapshot) = match request.token.as_deref() {
            Some(token) => {
                let token = PaginationToken::decode(token)?;
                (token.rules(&sorting), token.snapshot)
            }
            None => (Vec::new(), self.timestamp()?),
        };

        let mut filters = request.filters.clone();
        filters.push(Filter::new(MODIFIED_FIELD, FilterOp::Le, snapshot));
        let limit = request.limit.or(self.config.paginate_by);

        let options = ListOptions {
            filters,
            sorting: sorting.clone(),
            pagination_rules,
            limit: limit.map(|value| value.saturating_add(1)),
            include_deleted: request.include_deleted,
        };
        let ObjectPage {
            mut objects,
            count,
        } = self.get_objects(&options, scope)?;

        let mut next_cursor = None;
        if let Some(limit) = limit {
            if objects.len() > limit {
                objects.truncate(limit);
                if let Some(last) = objects.last() {
                    next_cursor =
                        Some(PaginationToken::from_last_object(last, &sorting, snapshot).encode()?);
                }
            }
        }

        debug!(
            "event=page_read module=model status=ok resource={} parent={} returned={} count={} has_next={}",
            self.config.resource_name,
            self.config.parent_id,
            objects.len(),
            count,
            next_cursor.is_some()
        );
        Ok(Page {
            objects,
            count,
            next_cursor,
        })
    }

    /// Adds an `id IN [...]` filter for shared scopes.
    ///
    /// Returns `None` when the principals can reach no object at all.
    fn scoped_options(
        &self,
        options: &ListOptions,
        scope: &ListScope,
    ) -> CoreResult<Option<ListOptions>> {
        let principals = match scope {
            ListScope::All => return Ok(Some(options.clone())),
            ListScope::Shared(principals) => principals,
        };

        let pattern = self.permission_object_id("*");
        let bound: Vec<BoundPermission> = READ_PERMISSIONS
            .iter()
            .map(|permission| (pattern.clone(), permission.to_string()))
            .collect();
        let prefix = self.permission_object_id("");
        let ids: Vec<Value> = self
            .permission
            .accessible_objects(principals, &bound)?
            .into_keys()
            .filter_map(|acl_id| acl_id.strip_prefix(&prefix).map(str::to_string))
            .map(Value::String)
            .collect();
        if ids.is_empty() {
            return Ok(None);
        }

        let mut scoped = options.clone();
        scoped
            .filters
            .push(Filter::new(ID_FIELD, FilterOp::In, Value::Array(ids)));
        Ok(Some(scoped))
    }

    /// Upserts `object` under `id`; seeds ACLs when it did not exist.
    fn store(&self, id: &str, object: Object, existing: Option<Object>) -> CoreResult<Object> {
        let stored = self.storage.update(
            &self.config.resource_name,
            &self.config.parent_id,
            id,
            object,
            &self.config.unique_fields,
        )?;

        match existing {
            Some(old) => {
                info!(
                    "event=object_update module=model status=ok resource={} parent={} id={}",
                    self.config.resource_name, self.config.parent_id, id
                );
                self.notify(|| ModelEvent::Updated {
                    old: old.clone(),
                    new: stored.clone(),
                });
            }
            None => {
                self.seed_permissions(&stored, &PermissionMap::new())?;
                info!(
                    "event=object_create module=model status=ok resource={} parent={} id={}",
                    self.config.resource_name, self.config.parent_id, id
                );
                self.notify(|| ModelEvent::Created {
                    object: stored.clone(),
                });
            }
        }
        Ok(stored)
    }

    fn seed_permissions(&self, stored: &Object, permissions: &PermissionMap) -> CoreResult<()> {
        let mut merged = permissions.clone();
        if self.config.explicit_permissions {
            if let Some(principal) = &self.config.current_principal {
                for permission in &self.config.creator_permissions {
                    merged
                        .entry(permission.clone())
                        .or_default()
                        .insert(principal.clone());
                }
            }
        }
        if merged.is_empty() {
            return Ok(());
        }

        let acl_id = self.permission_object_id(object_id(stored));
        match self.permission.replace_object_permissions(&acl_id, &merged) {
            Ok(_) => Ok(()),
            Err(err) => Err(self.partial_write(vec![stored.clone()], err)),
        }
    }

    fn partial_write(&self, objects: Vec<Object>, source: CoreError) -> CoreError {
        error!(
            "event=permission_write module=model status=error resource={} parent={} objects={} error={}",
            self.config.resource_name,
            self.config.parent_id,
            objects.len(),
            source
        );
        CoreError::PartialWrite {
            objects,
            source: Box::new(source),
        }
    }

    fn find_object(&self, id: &str) -> CoreResult<Option<Object>> {
        match self.get_object(id) {
            Ok(object) => Ok(Some(object)),
            Err(CoreError::ObjectNotFound { .. }) => Ok(None),
            Err(err) => Err(err),
        }
    }

    /// Validates the caller-supplied `id`, if any.
    fn caller_id(&self, object: &Object) -> CoreResult<Option<String>> {
        match object.get(ID_FIELD) {
            None => Ok(None),
            Some(Value::String(id)) => {
                self.id_generator
                    .validate(&self.config.resource_name, id)?;
                Ok(Some(id.clone()))
            }
            Some(other) => Err(CoreError::InvalidId {
                resource_name: self.config.resource_name.clone(),
                id: other.to_string(),
            }),
        }
    }

    fn run_validators(&self, object: &Object) -> CoreResult<()> {
        for validator in &self.validators {
            validator
                .validate(&self.config.resource_name, object)
                .map_err(CoreError::InvalidObject)?;
        }
        Ok(())
    }

    fn ensure_writable(&self, operation: &'static str) -> CoreResult<()> {
        if self.config.readonly {
            info!(
                "event=write_refused module=model status=skip resource={} operation={}",
                self.config.resource_name, operation
            );
            return Err(CoreError::ReadOnly(operation));
        }
        Ok(())
    }

    fn notify(&self, event: impl FnOnce() -> ModelEvent) {
        if self.listeners.is_empty() {
            return;
        }
        let event = event();
        for listener in &self.listeners {
            listener.on_event(&self.config.resource_name, &self.config.parent_id, &event);
        }
    }
}

fn object_id(object: &Object) -> &str {
    object
        .get(ID_FIELD)
        .and_then(Value::as_str)
        .unwrap_or_default()
}

fn check_revision(id: &str, existing: Option<&Object>, expected: Option<i64>) -> CoreResult<()> {
    let Some(expected) = expected else {
        return Ok(());
    };
    let current = existing.and_then(explicit_timestamp);
    if current == Some(expected) {
        return Ok(());
    }
    Err(CoreError::Conflict {
        id: id.to_string(),
        expected: Some(expected),
        current,
    })
}
