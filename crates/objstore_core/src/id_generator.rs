//! Object id generation and validation.
//!
//! # Responsibility
//! - Produce collision-resistant ids for new objects.
//! - Validate caller-supplied ids against a resource-specific format.
//!
//! # Invariants
//! - Generators are pure: no I/O and no shared mutable state.
//! - Only caller-supplied ids go through `validate`.

use crate::error::{CoreError, CoreResult};
use once_cell::sync::Lazy;
use regex::Regex;
use uuid::Uuid;

static UUID4_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[a-fA-F0-9]{8}-[a-fA-F0-9]{4}-[a-fA-F0-9]{4}-[a-fA-F0-9]{4}-[a-fA-F0-9]{12}$")
        .expect("valid uuid regex")
});

/// Pattern accepted by [`PatternIdGenerator::relaxed`].
pub const RELAXED_ID_PATTERN: &str = r"^[a-zA-Z0-9][a-zA-Z0-9_-]*$";

static RELAXED_ID_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(RELAXED_ID_PATTERN).expect("valid relaxed id regex"));

/// Pluggable id strategy for one resource type.
pub trait IdGenerator: Send + Sync {
    /// Returns a new id, statistically unique within the resource.
    fn generate(&self, resource_name: &str) -> String;

    /// Returns whether `id` is acceptable as a caller-supplied id.
    fn matches(&self, id: &str) -> bool {
        !id.is_empty()
    }

    /// Fails with `InvalidId` when `id` does not match.
    fn validate(&self, resource_name: &str, id: &str) -> CoreResult<()> {
        if self.matches(id) {
            Ok(())
        } else {
            Err(CoreError::InvalidId {
                resource_name: resource_name.to_string(),
                id: id.to_string(),
            })
        }
    }
}

/// Random UUIDv4 ids.
///
/// The default instance accepts any non-empty caller id; `strict()` only
/// accepts canonical UUID text.
#[derive(Debug, Clone, Copy, Default)]
pub struct Uuid4Generator {
    strict: bool,
}

impl Uuid4Generator {
    pub fn strict() -> Self {
        Self { strict: true }
    }
}

impl IdGenerator for Uuid4Generator {
    fn generate(&self, _resource_name: &str) -> String {
        Uuid::new_v4().to_string()
    }

    fn matches(&self, id: &str) -> bool {
        if self.strict {
            UUID4_RE.is_match(id)
        } else {
            !id.is_empty()
        }
    }
}

/// UUIDv4 ids with a resource-specific validation pattern.
#[derive(Debug, Clone)]
pub struct PatternIdGenerator {
    pattern: Regex,
}

impl PatternIdGenerator {
    /// Installs `pattern` as the accepted caller id format.
    pub fn new(pattern: &str) -> Result<Self, regex::Error> {
        Ok(Self {
            pattern: Regex::new(pattern)?,
        })
    }

    /// Alphanumeric ids, allowing `_` and `-` after the first character.
    pub fn relaxed() -> Self {
        Self {
            pattern: RELAXED_ID_RE.clone(),
        }
    }

    pub fn pattern(&self) -> &str {
        self.pattern.as_str()
    }
}

impl IdGenerator for PatternIdGenerator {
    fn generate(&self, _resource_name: &str) -> String {
        Uuid::new_v4().to_string()
    }

    fn matches(&self, id: &str) -> bool {
        !id.is_empty() && self.pattern.is_match(id)
    }
}
