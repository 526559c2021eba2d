//! Extension points invoked by [`crate::model::Model`].
//!
//! Validators run before any write and can reject the incoming object.
//! Listeners observe successful writes; they cannot fail the operation.

use crate::storage::Object;

/// Validation hook run on incoming objects before sanitization.
pub trait ObjectValidator: Send + Sync {
    /// Returns a human-readable rejection reason when `object` is invalid.
    fn validate(&self, resource_name: &str, object: &Object) -> Result<(), String>;
}

impl<F> ObjectValidator for F
where
    F: Fn(&str, &Object) -> Result<(), String> + Send + Sync,
{
    fn validate(&self, resource_name: &str, object: &Object) -> Result<(), String> {
        self(resource_name, object)
    }
}

/// Write notification delivered after storage and permissions succeeded.
#[derive(Debug, Clone, PartialEq)]
pub enum ModelEvent {
    Created {
        object: Object,
    },
    Updated {
        old: Object,
        new: Object,
    },
    /// `old` is `None` for bulk deletes, which only see tombstones.
    Deleted {
        old: Option<Object>,
        tombstone: Object,
    },
}

impl ModelEvent {
    pub fn action(&self) -> &'static str {
        match self {
            Self::Created { .. } => "create",
            Self::Updated { .. } => "update",
            Self::Deleted { .. } => "delete",
        }
    }
}

/// Observer of model writes (history, quotas, notifications).
pub trait ModelListener: Send + Sync {
    fn on_event(&self, resource_name: &str, parent_id: &str, event: &ModelEvent);
}
