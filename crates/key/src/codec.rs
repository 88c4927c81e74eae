//! Canonical serialization and structural matching of key segments.

use serde_json::Value;
use std::fmt::Write;

/// Serialize `segments` as a JSON array with every object's keys sorted.
///
/// Two keys that differ only in the insertion order of object fields
/// produce the same string; arrays keep their order.
///
/// ```
/// use serde_json::json;
/// use stash_key::to_cache_key;
///
/// let a = to_cache_key(&[json!({"a": 1, "b": 2})]);
/// let b = to_cache_key(&[json!({"b": 2, "a": 1})]);
/// assert_eq!(a, b);
/// assert_ne!(to_cache_key(&[json!("a"), json!("b")]), to_cache_key(&[json!("b"), json!("a")]));
/// ```
pub fn to_cache_key(segments: &[Value]) -> String {
    let mut out = String::with_capacity(segments.len() * 8);
    write_array(&mut out, segments);
    out
}

/// Canonical string for a single segment; the unit the key tree branches on.
///
/// Strings keep their JSON quotes so `"1"` and `1` stay distinct branches.
pub fn canonical_segment(segment: &Value) -> String {
    let mut out = String::new();
    write_canonical(&mut out, segment);
    out
}

fn write_array(out: &mut String, items: &[Value]) {
    out.push('[');
    for (i, item) in items.iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        write_canonical(out, item);
    }
    out.push(']');
}

fn write_canonical(out: &mut String, value: &Value) {
    match value {
        Value::Array(items) => write_array(out, items),
        Value::Object(map) => {
            let mut fields: Vec<_> = map.iter().collect();
            fields.sort_unstable_by(|(a, _), (b, _)| a.cmp(b));
            out.push('{');
            for (i, (name, field)) in fields.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                // Writing into a String never fails.
                _ = write!(out, "{}:", Value::String(name.clone()));
                write_canonical(out, field);
            }
            out.push('}');
        },
        scalar => {
            _ = write!(out, "{scalar}");
        },
    }
}

/// Recursive structural subset check.
///
/// - Scalars match only when equal.
/// - An object matches when every field it has is present in `fullset` and
///   matches recursively. Fields absent from the subset are ignored; a field
///   that is `null` in the subset requires a `null` (not a missing field) in
///   `fullset`.
/// - An array matches as a prefix: each element must match the element at
///   the same index, and `fullset` may be longer.
///
/// ```
/// use serde_json::json;
/// use stash_key::is_subset_of;
///
/// assert!(is_subset_of(&json!({"page": 1}), &json!({"page": 1, "sort": "name"})));
/// assert!(!is_subset_of(&json!({"page": null}), &json!({"sort": "name"})));
/// assert!(is_subset_of(&json!(["todos"]), &json!(["todos", 1])));
/// ```
pub fn is_subset_of(subset: &Value, fullset: &Value) -> bool {
    match (subset, fullset) {
        (Value::Object(sub), Value::Object(full)) => {
            sub.iter().all(|(name, value)| full.get(name).is_some_and(|other| is_subset_of(value, other)))
        },
        (Value::Array(sub), Value::Array(full)) => {
            sub.len() <= full.len() && sub.iter().zip(full).all(|(a, b)| is_subset_of(a, b))
        },
        (a, b) => a == b,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use serde_json::json;

    #[rstest]
    #[case(json!([{"a": 1, "b": 2}]), json!([{"b": 2, "a": 1}]))]
    #[case(json!([{"outer": {"z": 1, "y": [1, {"d": 0, "c": 0}]}}]), json!([{"outer": {"y": [1, {"c": 0, "d": 0}], "z": 1}}]))]
    #[case(json!(["users", 1, null, true]), json!(["users", 1, null, true]))]
    fn cache_key_is_order_independent_for_objects(#[case] a: Value, #[case] b: Value) {
        let (Value::Array(a), Value::Array(b)) = (a, b) else { unreachable!() };
        assert_eq!(to_cache_key(&a), to_cache_key(&b));
    }

    #[rstest]
    #[case(json!(["a", "b"]), json!(["b", "a"]))]
    #[case(json!([[1, 2]]), json!([[2, 1]]))]
    #[case(json!(["1"]), json!([1]))]
    fn cache_key_is_order_dependent_for_arrays(#[case] a: Value, #[case] b: Value) {
        let (Value::Array(a), Value::Array(b)) = (a, b) else { unreachable!() };
        assert_ne!(to_cache_key(&a), to_cache_key(&b));
    }

    #[test]
    fn cache_key_escapes_strings() {
        assert_eq!(to_cache_key(&[json!("quote\"d")]), r#"["quote\"d"]"#);
        assert_eq!(to_cache_key(&[json!({"k\"": 1})]), r#"[{"k\"":1}]"#);
    }

    #[test]
    fn cache_key_parses_back_as_json() {
        let segments = vec![json!("users"), json!({"b": [1, 2], "a": null}), json!(1.5)];
        let parsed: Vec<Value> = serde_json::from_str(&to_cache_key(&segments)).unwrap();
        assert_eq!(parsed, segments);
    }

    #[rstest]
    #[case(json!(1), json!(1), true)]
    #[case(json!("a"), json!("b"), false)]
    #[case(json!({}), json!({"a": 1}), true)]
    #[case(json!({"a": 1}), json!({"a": 1, "b": 2}), true)]
    #[case(json!({"a": 1, "b": 2}), json!({"a": 1}), false)]
    #[case(json!({"a": {"b": 1}}), json!({"a": {"b": 1, "c": 2}}), true)]
    #[case(json!({"a": null}), json!({"a": null}), true)]
    #[case(json!({"a": null}), json!({}), false)]
    #[case(json!({"a": null}), json!({"a": 0}), false)]
    #[case(json!([1]), json!([1, 2]), true)]
    #[case(json!([1, 2, 3]), json!([1, 2]), false)]
    #[case(json!([{"id": 1}]), json!([{"id": 1, "name": "x"}]), true)]
    #[case(json!({"a": 1}), json!([1]), false)]
    fn subset_matching(#[case] subset: Value, #[case] fullset: Value, #[case] expected: bool) {
        assert_eq!(is_subset_of(&subset, &fullset), expected);
    }
}
