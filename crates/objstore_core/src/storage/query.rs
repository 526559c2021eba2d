//! In-process evaluation of filters, keyset pagination rules and sorting.
//!
//! Both the memory and SQLite backends run listings through this engine, so
//! they agree on operator semantics and ordering.
//!
//! # Invariants
//! - User filters never match a missing field, except `Not`, `Exclude` and
//!   `Has(false)`.
//! - Tombstones only expose `id`, `last_modified` and `deleted`; filters on
//!   other fields do not hide them.
//! - Sorting and pagination rules treat a missing field as `null`, so a page
//!   boundary always agrees with the sort order.

use crate::storage::{
    is_tombstone, Direction, Filter, FilterOp, ListOptions, Object, ObjectPage, Sort,
    DELETED_FIELD, ID_FIELD, MODIFIED_FIELD,
};
use crate::utils::{compare_values, find_field, values_equal};
use regex::RegexBuilder;
use serde_json::Value;
use std::cmp::Ordering;

static NULL: Value = Value::Null;

/// Filters, counts, paginates, sorts and limits `objects`.
pub fn apply(objects: impl IntoIterator<Item = Object>, options: &ListOptions) -> ObjectPage {
    let mut matched: Vec<Object> = objects
        .into_iter()
        .filter(|object| options.include_deleted || !is_tombstone(object))
        .filter(|object| matches_filters(object, &options.filters))
        .collect();
    let count = matched.len();

    matched.retain(|object| matches_pagination(object, &options.pagination_rules));
    sort_objects(&mut matched, &options.sorting);
    if let Some(limit) = options.limit {
        matched.truncate(limit);
    }

    ObjectPage {
        objects: matched,
        count,
    }
}

pub fn matches_filters(object: &Object, filters: &[Filter]) -> bool {
    let tombstone = is_tombstone(object);
    filters.iter().all(|filter| {
        if tombstone && !is_tombstone_field(&filter.field) {
            return true;
        }
        matches_filter(object, filter)
    })
}

fn is_tombstone_field(field: &str) -> bool {
    field == ID_FIELD || field == MODIFIED_FIELD || field == DELETED_FIELD
}

/// Evaluates one user filter.
pub fn matches_filter(object: &Object, filter: &Filter) -> bool {
    let field = find_field(object, &filter.field);
    let expected = &filter.value;

    match filter.op {
        FilterOp::Has => field.is_some() == expected.as_bool().unwrap_or(true),
        FilterOp::Not => field.map_or(true, |value| !values_equal(value, expected)),
        FilterOp::Exclude => field.map_or(true, |value| !contained_in(value, expected)),
        FilterOp::Eq => field.is_some_and(|value| values_equal(value, expected)),
        FilterOp::In => field.is_some_and(|value| contained_in(value, expected)),
        FilterOp::Like => field.is_some_and(|value| like(value, expected)),
        FilterOp::Lt | FilterOp::Le | FilterOp::Gt | FilterOp::Ge => {
            field.is_some_and(|value| range(filter.op, value, expected))
        }
        FilterOp::Contains => field.is_some_and(|value| array_contains(value, expected, true)),
        FilterOp::ContainsAny => {
            field.is_some_and(|value| array_contains(value, expected, false))
        }
    }
}

/// Returns true when `object` satisfies at least one AND-group of `rules`.
pub fn matches_pagination(object: &Object, rules: &[Vec<Filter>]) -> bool {
    if rules.is_empty() {
        return true;
    }
    rules.iter().any(|group| {
        group.iter().all(|filter| {
            let value = find_field(object, &filter.field).unwrap_or(&NULL);
            match filter.op {
                FilterOp::Eq => compare_values(Some(value), Some(&filter.value)).is_eq(),
                FilterOp::Lt | FilterOp::Le | FilterOp::Gt | FilterOp::Ge => {
                    range(filter.op, value, &filter.value)
                }
                _ => matches_filter(object, filter),
            }
        })
    })
}

/// Sorts by `sorting`, then `last_modified`, then `id`, all stable.
pub fn sort_objects(objects: &mut [Object], sorting: &[Sort]) {
    let mut keys: Vec<Sort> = sorting.to_vec();
    for tie_break in [MODIFIED_FIELD, ID_FIELD] {
        if !keys.iter().any(|sort| sort.field == tie_break) {
            keys.push(Sort::asc(tie_break));
        }
    }

    objects.sort_by(|left, right| {
        for sort in &keys {
            let a = find_field(left, &sort.field).unwrap_or(&NULL);
            let b = find_field(right, &sort.field).unwrap_or(&NULL);
            let ordering = match sort.direction {
                Direction::Asc => compare_values(Some(a), Some(b)),
                Direction::Desc => compare_values(Some(b), Some(a)),
            };
            if ordering != Ordering::Equal {
                return ordering;
            }
        }
        Ordering::Equal
    });
}

fn range(op: FilterOp, value: &Value, expected: &Value) -> bool {
    let ordering = compare_values(Some(value), Some(expected));
    match op {
        FilterOp::Lt => ordering.is_lt(),
        FilterOp::Le => ordering.is_le(),
        FilterOp::Gt => ordering.is_gt(),
        FilterOp::Ge => ordering.is_ge(),
        _ => false,
    }
}

fn contained_in(value: &Value, candidates: &Value) -> bool {
    match candidates {
        Value::Array(items) => items.iter().any(|item| values_equal(value, item)),
        single => values_equal(value, single),
    }
}

fn array_contains(value: &Value, expected: &Value, all: bool) -> bool {
    let Value::Array(items) = value else {
        return false;
    };
    let wanted: Vec<&Value> = match expected {
        Value::Array(values) => values.iter().collect(),
        single => vec![single],
    };
    let present = |needle: &&Value| items.iter().any(|item| values_equal(item, needle));
    if all {
        wanted.iter().all(present)
    } else {
        wanted.iter().any(present)
    }
}

/// Case-insensitive match; `*` is a wildcard, otherwise a substring test.
fn like(value: &Value, pattern: &Value) -> bool {
    let text = match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    };
    let pattern = match pattern {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    };

    let source = if pattern.contains('*') {
        let body = pattern
            .split('*')
            .map(regex::escape)
            .collect::<Vec<_>>()
            .join(".*");
        format!("^{body}$")
    } else {
        regex::escape(&pattern)
    };

    RegexBuilder::new(&source)
        .case_insensitive(true)
        .build()
        .is_ok_and(|re| re.is_match(&text))
}

#[cfg(test)]
mod tests {
    use super::{apply, matches_filter, matches_pagination, sort_objects};
    use crate::storage::{tombstone, Filter, FilterOp, ListOptions, Object, Sort};
    use serde_json::{json, Value};

    fn object(value: Value) -> Object {
        value.as_object().cloned().expect("fixture must be an object")
    }

    #[test]
    fn operators_follow_missing_field_rules() {
        let item = object(json!({"id": "a", "age": 30, "tags": ["x", "y"], "name": "Alice"}));

        assert!(matches_filter(&item, &Filter::new("age", FilterOp::Eq, 30.0)));
        assert!(matches_filter(&item, &Filter::new("age", FilterOp::Ge, 30)));
        assert!(!matches_filter(&item, &Filter::new("age", FilterOp::Lt, 30)));
        assert!(matches_filter(&item, &Filter::new("missing", FilterOp::Not, 1)));
        assert!(matches_filter(&item, &Filter::new("missing", FilterOp::Exclude, json!([1]))));
        assert!(!matches_filter(&item, &Filter::new("missing", FilterOp::Lt, 1)));
        assert!(matches_filter(&item, &Filter::new("missing", FilterOp::Has, false)));
        assert!(matches_filter(&item, &Filter::new("name", FilterOp::Has, true)));
        assert!(matches_filter(&item, &Filter::new("age", FilterOp::In, json!([1, 30]))));
        assert!(matches_filter(&item, &Filter::new("tags", FilterOp::Contains, json!(["x", "y"]))));
        assert!(!matches_filter(&item, &Filter::new("tags", FilterOp::Contains, json!(["x", "z"]))));
        assert!(matches_filter(&item, &Filter::new("tags", FilterOp::ContainsAny, json!(["z", "y"]))));
    }

    #[test]
    fn like_is_case_insensitive_with_wildcards() {
        let item = object(json!({"name": "Alice Liddell"}));
        assert!(matches_filter(&item, &Filter::new("name", FilterOp::Like, "lid")));
        assert!(matches_filter(&item, &Filter::new("name", FilterOp::Like, "ali*")));
        assert!(!matches_filter(&item, &Filter::new("name", FilterOp::Like, "lid*")));
        assert!(!matches_filter(&item, &Filter::new("name", FilterOp::Like, "a.ice")));
    }

    #[test]
    fn tombstones_survive_filters_on_fields_they_do_not_carry() {
        let options = ListOptions {
            filters: vec![Filter::new("color", FilterOp::Eq, "red")],
            include_deleted: true,
            ..ListOptions::default()
        };
        let page = apply(
            vec![
                object(json!({"id": "a", "last_modified": 1, "color": "red"})),
                object(json!({"id": "b", "last_modified": 2, "color": "blue"})),
                tombstone("c", 3),
            ],
            &options,
        );
        let ids: Vec<&str> = page
            .objects
            .iter()
            .filter_map(|o| o.get("id").and_then(Value::as_str))
            .collect();
        assert_eq!(ids, vec!["a", "c"]);
        assert_eq!(page.count, 2);
    }

    #[test]
    fn sort_uses_last_modified_as_final_tie_break() {
        let mut items = vec![
            object(json!({"id": "b", "last_modified": 3, "rank": 1})),
            object(json!({"id": "a", "last_modified": 2, "rank": 1})),
            object(json!({"id": "c", "last_modified": 1, "rank": 0})),
        ];
        sort_objects(&mut items, &[Sort::desc("rank")]);
        let ids: Vec<&str> = items
            .iter()
            .filter_map(|o| o.get("id").and_then(Value::as_str))
            .collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
    }

    #[test]
    fn pagination_rules_treat_missing_as_null() {
        let without = object(json!({"id": "a", "last_modified": 5}));
        let rules = vec![
            vec![Filter::new("title", FilterOp::Gt, Value::Null)],
            vec![
                Filter::new("title", FilterOp::Eq, Value::Null),
                Filter::new("last_modified", FilterOp::Gt, 4),
            ],
        ];
        assert!(matches_pagination(&without, &rules));
        assert!(matches_pagination(&without, &[]));
    }
}
