//! JSON helpers shared by backends and the model layer.
//!
//! # Responsibility
//! - Rewrite backend-reserved characters in object keys.
//! - Resolve dotted field paths and order heterogeneous JSON values.
//! - Match `*` wildcard patterns for parent ids and permission object ids.
//!
//! # Invariants
//! - Key sanitization touches mapping keys only, never array elements or
//!   scalar values, and is never reversed.
//! - `compare_values` is a total order: missing < null < bool < number <
//!   string < array < object.

use crate::storage::Object;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use std::cmp::Ordering;
use std::time::{SystemTime, UNIX_EPOCH};

static RESERVED_KEY_CHARS_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[.=+]").expect("valid reserved key regex"));

/// Recursively rewrites `.`, `=` and `+` in mapping keys to `_`.
pub fn sanitize_keys(value: Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(sanitize_object(map)),
        other => other,
    }
}

/// Same as [`sanitize_keys`] for a top-level object.
pub fn sanitize_object(map: Object) -> Object {
    map.into_iter()
        .map(|(key, value)| {
            let key = RESERVED_KEY_CHARS_RE.replace_all(&key, "_").into_owned();
            (key, sanitize_keys(value))
        })
        .collect()
}

/// Current wall clock in epoch milliseconds.
pub fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |elapsed| elapsed.as_millis() as i64)
}

/// Looks up `path` in `object`, descending into nested mappings on `.`.
///
/// An exact top-level key wins over the dotted interpretation.
pub fn find_field<'a>(object: &'a Object, path: &str) -> Option<&'a Value> {
    if let Some(value) = object.get(path) {
        return Some(value);
    }
    let mut parts = path.split('.');
    let mut current = object.get(parts.next()?)?;
    for part in parts {
        current = current.as_object()?.get(part)?;
    }
    Some(current)
}

fn type_rank(value: Option<&Value>) -> u8 {
    match value {
        None => 0,
        Some(Value::Null) => 1,
        Some(Value::Bool(_)) => 2,
        Some(Value::Number(_)) => 3,
        Some(Value::String(_)) => 4,
        Some(Value::Array(_)) => 5,
        Some(Value::Object(_)) => 6,
    }
}

/// Total order over optional JSON values used by sorting and range filters.
pub fn compare_values(left: Option<&Value>, right: Option<&Value>) -> Ordering {
    let rank = type_rank(left).cmp(&type_rank(right));
    if rank != Ordering::Equal {
        return rank;
    }
    match (left, right) {
        (Some(Value::Bool(a)), Some(Value::Bool(b))) => a.cmp(b),
        (Some(Value::Number(a)), Some(Value::Number(b))) => {
            let a = a.as_f64().unwrap_or(0.0);
            let b = b.as_f64().unwrap_or(0.0);
            a.partial_cmp(&b).unwrap_or(Ordering::Equal)
        }
        (Some(Value::String(a)), Some(Value::String(b))) => a.cmp(b),
        (Some(Value::Array(a)), Some(Value::Array(b))) => {
            for (x, y) in a.iter().zip(b.iter()) {
                let ordering = compare_values(Some(x), Some(y));
                if ordering != Ordering::Equal {
                    return ordering;
                }
            }
            a.len().cmp(&b.len())
        }
        (Some(Value::Object(a)), Some(Value::Object(b))) => {
            Value::Object(a.clone()).to_string().cmp(&Value::Object(b.clone()).to_string())
        }
        _ => Ordering::Equal,
    }
}

/// Equality with numeric normalization (`1 == 1.0`).
pub fn values_equal(left: &Value, right: &Value) -> bool {
    match (left, right) {
        (Value::Number(_), Value::Number(_)) => {
            compare_values(Some(left), Some(right)) == Ordering::Equal
        }
        _ => left == right,
    }
}

/// Matches `text` against `pattern`, where `*` stands for any run of characters.
pub fn glob_match(pattern: &str, text: &str) -> bool {
    if !pattern.contains('*') {
        return pattern == text;
    }
    let body = pattern
        .split('*')
        .map(regex::escape)
        .collect::<Vec<_>>()
        .join(".*");
    Regex::new(&format!("^{body}$")).is_ok_and(|re| re.is_match(text))
}

/// Applies an RFC 7396 merge patch: `null` removes keys, mappings merge.
pub fn merge_patch(target: &mut Value, patch: &Value) {
    let Value::Object(changes) = patch else {
        *target = patch.clone();
        return;
    };
    if !target.is_object() {
        *target = Value::Object(Object::new());
    }
    if let Value::Object(map) = target {
        for (key, value) in changes {
            if value.is_null() {
                map.remove(key);
            } else {
                merge_patch(map.entry(key.clone()).or_insert(Value::Null), value);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{
        compare_values, find_field, glob_match, merge_patch, sanitize_keys, values_equal,
    };
    use serde_json::json;
    use std::cmp::Ordering;

    #[test]
    fn sanitize_rewrites_reserved_characters_in_nested_mappings() {
        let value = sanitize_keys(json!({
            "foo.bar": "value",
            "a=b": {"c+d": 1, "keep-me": {"x.y": true}},
            "list": [{"not.touched": 1}],
            "scalar": "a.b=c+d"
        }));
        assert_eq!(value["foo_bar"], "value");
        assert_eq!(value["a_b"]["c_d"], 1);
        assert_eq!(value["a_b"]["keep-me"]["x_y"], true);
        assert_eq!(value["list"][0]["not.touched"], 1);
        assert_eq!(value["scalar"], "a.b=c+d");
        assert!(value.get("foo.bar").is_none());
    }

    #[test]
    fn sanitize_preserves_other_punctuation() {
        let value = sanitize_keys(json!({"a-b": 1, "c#d": 2, "e!f": 3, "g*h": 4, "i~j": 5, "k@l": 6}));
        for key in ["a-b", "c#d", "e!f", "g*h", "i~j", "k@l"] {
            assert!(value.get(key).is_some(), "{key} should be preserved");
        }
    }

    #[test]
    fn find_field_descends_dotted_paths() {
        let value = json!({"author": {"name": "ana"}, "title": "t"});
        let object = value.as_object().expect("object");
        assert_eq!(find_field(object, "author.name"), Some(&json!("ana")));
        assert_eq!(find_field(object, "title"), Some(&json!("t")));
        assert_eq!(find_field(object, "author.age"), None);
        assert_eq!(find_field(object, "title.sub"), None);
    }

    #[test]
    fn compare_orders_by_type_then_value() {
        assert_eq!(compare_values(None, Some(&json!(null))), Ordering::Less);
        assert_eq!(compare_values(Some(&json!(true)), Some(&json!(0))), Ordering::Less);
        assert_eq!(compare_values(Some(&json!(2)), Some(&json!(10))), Ordering::Less);
        assert_eq!(compare_values(Some(&json!(99)), Some(&json!("1"))), Ordering::Less);
        assert_eq!(compare_values(Some(&json!("b")), Some(&json!("a"))), Ordering::Greater);
        assert!(values_equal(&json!(1), &json!(1.0)));
    }

    #[test]
    fn glob_match_handles_wildcards_and_escaping() {
        assert!(glob_match("/buckets/*", "/buckets/a"));
        assert!(glob_match("*", ""));
        assert!(glob_match("/buckets/*/collections/*", "/buckets/a/collections/b"));
        assert!(!glob_match("/buckets/*", "/groups/a"));
        assert!(!glob_match("a.c", "abc"));
        assert!(glob_match("a.c*", "a.cd"));
    }

    #[test]
    fn merge_patch_merges_and_removes() {
        let mut target = json!({"a": 1, "nested": {"x": 1, "y": 2}});
        merge_patch(&mut target, &json!({"a": null, "nested": {"y": 3}, "b": [1]}));
        assert_eq!(target, json!({"nested": {"x": 1, "y": 3}, "b": [1]}));
    }
}
