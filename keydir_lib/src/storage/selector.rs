/*
 * Copyright (c) 2026. Keydir Contributors. Keydir Keyserver. GPL-3.0-only.
 * SPDX-License-Identifier: GPL-3.0-only
 */

//! Selector and patch evaluation over JSON documents.
//!
//! Supports the subset of document-store query syntax the directory relies
//! on: top-level field equality with dotted paths (mapping over arrays),
//! `$ne`, `$lt`, `$or` and `$elemMatch`, plus patches whose dotted paths may
//! contain the positional `$` segment resolved against the selector's
//! `$elemMatch` clause.

use serde_json::{Map, Value};

/// Whether `doc` satisfies `selector`.
pub fn matches(selector: &Value, doc: &Value) -> bool {
    let clauses = match selector.as_object() {
        Some(c) => c,
        None => return false,
    };
    clauses.iter().all(|(key, condition)| match key.as_str() {
        "$or" => condition
            .as_array()
            .map_or(false, |alternatives| alternatives.iter().any(|alt| matches(alt, doc))),
        path => match_field(doc, path, condition),
    })
}

fn match_field(doc: &Value, path: &str, condition: &Value) -> bool {
    let values = resolve_path(doc, path);
    match condition.as_object() {
        Some(ops) if is_operator_object(ops) => ops.iter().all(|(op, operand)| match op.as_str() {
            "$ne" => !values.iter().any(|v| contains_value(v, operand)),
            "$lt" => values.iter().any(|v| value_lt(v, operand)),
            "$elemMatch" => values.iter().any(|v| {
                v.as_array()
                    .map_or(false, |elements| elements.iter().any(|e| matches(operand, e)))
            }),
            _ => false,
        }),
        _ => values.iter().any(|v| contains_value(v, condition)),
    }
}

fn is_operator_object(ops: &Map<String, Value>) -> bool {
    ops.keys().any(|k| k.starts_with('$'))
}

/// Equality with array membership semantics: an array field is equal to a
/// literal if any of its elements is.
fn contains_value(value: &Value, literal: &Value) -> bool {
    match value {
        Value::Array(elements) if !literal.is_array() => elements.iter().any(|e| e == literal),
        other => other == literal,
    }
}

fn value_lt(value: &Value, operand: &Value) -> bool {
    match (value, operand) {
        (Value::Number(a), Value::Number(b)) => match (a.as_f64(), b.as_f64()) {
            (Some(a), Some(b)) => a < b,
            _ => false,
        },
        (Value::String(a), Value::String(b)) => a < b,
        _ => false,
    }
}

/// Walks a dotted path, fanning out over intermediate arrays.
///
/// The terminal value is returned as-is (arrays are not flattened at the
/// end), so `$elemMatch` can address the array itself while equality on
/// `"userIds.verified"` sees one value per array element.
fn resolve_path<'a>(doc: &'a Value, path: &str) -> Vec<&'a Value> {
    let mut current = vec![doc];
    for segment in path.split('.') {
        let mut next = Vec::new();
        for value in current {
            match value {
                Value::Object(fields) => {
                    if let Some(v) = fields.get(segment) {
                        next.push(v);
                    }
                }
                Value::Array(elements) => {
                    for element in elements {
                        if let Some(v) = element.get(segment) {
                            next.push(v);
                        }
                    }
                }
                _ => {}
            }
        }
        current = next;
    }
    current
}

/// Applies a patch of dotted-path assignments to `doc`.
///
/// A `$` segment addresses the first element of the preceding array field
/// that satisfies the selector's `$elemMatch` condition for that field.
pub fn apply_patch(doc: &mut Value, patch: &Value, selector: &Value) {
    let assignments = match patch.as_object() {
        Some(a) => a,
        None => return,
    };
    for (path, new_value) in assignments {
        set_path(doc, path, new_value, selector);
    }
}

fn set_path(doc: &mut Value, path: &str, new_value: &Value, selector: &Value) {
    let segments: Vec<&str> = path.split('.').collect();
    let mut current = doc;
    let mut walked = String::new();
    for (i, segment) in segments.iter().enumerate() {
        let last = i == segments.len() - 1;
        if *segment == "$" {
            let index = match positional_index(current, selector, &walked) {
                Some(index) => index,
                None => return,
            };
            current = match current.get_mut(index) {
                Some(element) => element,
                None => return,
            };
            continue;
        }
        if !walked.is_empty() {
            walked.push('.');
        }
        walked.push_str(segment);
        if last {
            if let Value::Object(fields) = current {
                fields.insert((*segment).to_string(), new_value.clone());
            }
            return;
        }
        current = match current.get_mut(*segment) {
            Some(v) => v,
            None => return,
        };
    }
}

fn positional_index(array: &Value, selector: &Value, array_path: &str) -> Option<usize> {
    let condition = selector.as_object()?.get(array_path)?;
    let element_selector = condition.as_object()?.get("$elemMatch")?;
    array
        .as_array()?
        .iter()
        .position(|element| matches(element_selector, element))
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{apply_patch, matches};

    fn record() -> serde_json::Value {
        json!({
            "keyId": "0123456789abcdef",
            "fingerprint": "aa".repeat(20),
            "uploaded": 1000,
            "userIds": [
                {"email": "a@example.org", "verified": true, "nonce": null},
                {"email": "b@example.org", "verified": false, "nonce": "n1"},
            ],
        })
    }

    #[test]
    fn field_equality() {
        assert!(matches(&json!({"keyId": "0123456789abcdef"}), &record()));
        assert!(!matches(&json!({"keyId": "ffff"}), &record()));
    }

    #[test]
    fn dotted_path_maps_over_arrays() {
        assert!(matches(&json!({"userIds.email": "b@example.org"}), &record()));
        assert!(matches(&json!({"userIds.verified": {"$ne": false}}), &json!({"userIds": []})));
        assert!(!matches(&json!({"userIds.verified": {"$ne": true}}), &record()));
    }

    #[test]
    fn lt_on_numbers() {
        assert!(matches(&json!({"uploaded": {"$lt": 2000}}), &record()));
        assert!(!matches(&json!({"uploaded": {"$lt": 1000}}), &record()));
    }

    #[test]
    fn or_of_alternatives() {
        let selector = json!({"$or": [{"keyId": "ffff"}, {"userIds.email": "a@example.org"}]});
        assert!(matches(&selector, &record()));
        let selector = json!({"$or": [{"keyId": "ffff"}, {"keyId": "eeee"}]});
        assert!(!matches(&selector, &record()));
    }

    #[test]
    fn elem_match_requires_one_element_satisfying_all() {
        let selector = json!({"userIds": {"$elemMatch": {"email": "a@example.org", "verified": true}}});
        assert!(matches(&selector, &record()));
        let selector = json!({"userIds": {"$elemMatch": {"email": "b@example.org", "verified": true}}});
        assert!(!matches(&selector, &record()));
    }

    #[test]
    fn positional_patch_addresses_matching_element() {
        let mut doc = record();
        let selector = json!({"keyId": "0123456789abcdef", "userIds": {"$elemMatch": {"nonce": "n1"}}});
        let patch = json!({
            "publicKeyArmored": "ARMOR",
            "userIds.$.verified": true,
            "userIds.$.nonce": null,
        });
        apply_patch(&mut doc, &patch, &selector);
        assert_eq!(doc["publicKeyArmored"], "ARMOR");
        assert_eq!(doc["userIds"][1]["verified"], true);
        assert_eq!(doc["userIds"][1]["nonce"], serde_json::Value::Null);
        assert_eq!(doc["userIds"][0]["verified"], true);
    }
}
