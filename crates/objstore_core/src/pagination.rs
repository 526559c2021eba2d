//! Keyset pagination rules and opaque cursor tokens.
//!
//! # Responsibility
//! - Derive the OR-of-AND range constraints that resume a listing after the
//!   last row a client saw.
//! - Encode the last-seen sort-key tuple as a URL-safe token.
//!
//! # Invariants
//! - A token carries only sort-key values, `id`, `last_modified`, and the
//!   scope timestamp observed when the first page was served.
//! - Decoding never panics; malformed tokens are `InvalidCursor` errors.

use crate::error::{BackendError, CoreResult};
use crate::storage::{
    Direction, Filter, FilterOp, Object, PaginationRules, Sort, ID_FIELD, MODIFIED_FIELD,
};
use crate::utils::find_field;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Resume point of a paginated listing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaginationToken {
    /// Sort-key values of the last returned object, keyed by field path.
    pub last_object: Object,
    /// Scope timestamp when the first page was served.
    pub snapshot: i64,
}

impl PaginationToken {
    /// Captures the sort keys of `last` for the given `sorting`.
    pub fn from_last_object(last: &Object, sorting: &[Sort], snapshot: i64) -> Self {
        let mut last_object = Object::new();
        let fields = sorting
            .iter()
            .map(|sort| sort.field.as_str())
            .chain([ID_FIELD, MODIFIED_FIELD]);
        for field in fields {
            let value = find_field(last, field).cloned().unwrap_or(Value::Null);
            last_object.insert(field.to_string(), value);
        }
        Self {
            last_object,
            snapshot,
        }
    }

    pub fn encode(&self) -> CoreResult<String> {
        let json = serde_json::to_vec(self).map_err(BackendError::from)?;
        Ok(URL_SAFE_NO_PAD.encode(json))
    }

    pub fn decode(token: &str) -> CoreResult<Self> {
        let bytes = URL_SAFE_NO_PAD
            .decode(token.trim())
            .map_err(|err| BackendError::InvalidCursor(err.to_string()))?;
        let decoded = serde_json::from_slice(&bytes)
            .map_err(|err| BackendError::InvalidCursor(err.to_string()))?;
        Ok(decoded)
    }

    /// Rules selecting every object strictly after this token in `sorting`.
    pub fn rules(&self, sorting: &[Sort]) -> PaginationRules {
        build_pagination_rules(sorting, &self.last_object)
    }
}

/// Builds keyset rules: for keys `k1..kn`, group *i* is
/// `k1 == v1 AND ... AND k(i-1) == v(i-1) AND ki > vi` (`<` when descending).
pub fn build_pagination_rules(sorting: &[Sort], last_object: &Object) -> PaginationRules {
    let value_of = |field: &str| find_field(last_object, field).cloned().unwrap_or(Value::Null);

    sorting
        .iter()
        .enumerate()
        .map(|(position, sort)| {
            let mut group: Vec<Filter> = sorting[..position]
                .iter()
                .map(|previous| {
                    Filter::new(previous.field.clone(), FilterOp::Eq, value_of(&previous.field))
                })
                .collect();
            let op = match sort.direction {
                Direction::Asc => FilterOp::Gt,
                Direction::Desc => FilterOp::Lt,
            };
            group.push(Filter::new(sort.field.clone(), op, value_of(&sort.field)));
            group
        })
        .collect()
}
