use std::collections::HashMap;

use rollsync_core::{MappedOperation, PlanAction, PlannedOperation};
use rollsync_storage::sha256_hex;
use serde_json::Value as JsonValue;

/// Serializes JSON with object keys sorted at every depth and no whitespace.
/// Array order is preserved.
pub fn canonical_json(value: &JsonValue) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &JsonValue, out: &mut String) {
    match value {
        JsonValue::Object(map) => {
            let mut keys = map.keys().collect::<Vec<_>>();
            keys.sort();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&JsonValue::String(key.clone()).to_string());
                out.push(':');
                if let Some(inner) = map.get(key) {
                    write_canonical(inner, out);
                }
            }
            out.push('}');
        }
        JsonValue::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

pub fn payload_hash(payload: &JsonValue) -> String {
    sha256_hex(canonical_json(payload).as_bytes())
}

/// Marks each operation `noop` when its payload hash equals the last hash
/// written for the same `entity_type:entity_key`, `upsert` otherwise.
pub fn plan_operations(
    operations: Vec<MappedOperation>,
    known_hashes: &HashMap<String, String>,
) -> Vec<PlannedOperation> {
    operations
        .into_iter()
        .map(|operation| {
            let payload_hash = payload_hash(&operation.payload);
            let action = match known_hashes.get(&operation.cache_key()) {
                Some(known) if *known == payload_hash => PlanAction::Noop,
                _ => PlanAction::Upsert,
            };
            PlannedOperation {
                operation,
                payload_hash,
                action,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn op(key: &str, status: &str) -> MappedOperation {
        MappedOperation {
            entity_type: "attendance".into(),
            entity_key: key.into(),
            payload: json!({"student_id": "s1", "date": "2024-03-04", "status": status}),
            external_row_reference: "r1".into(),
        }
    }

    #[test]
    fn canonical_json_sorts_nested_keys() {
        let value = json!({"b": {"z": 1, "a": [3, {"y": null, "x": "q"}]}, "a": true});
        assert_eq!(
            canonical_json(&value),
            r#"{"a":true,"b":{"a":[3,{"x":"q","y":null}],"z":1}}"#
        );
    }

    #[test]
    fn hash_ignores_key_order_but_not_values() {
        let a = json!({"student_id": "s1", "status": "present", "date": "2024-03-04"});
        let b = json!({"date": "2024-03-04", "status": "present", "student_id": "s1"});
        let c = json!({"date": "2024-03-04", "status": "absent", "student_id": "s1"});
        assert_eq!(payload_hash(&a), payload_hash(&b));
        assert_ne!(payload_hash(&a), payload_hash(&c));
        assert_eq!(payload_hash(&a).len(), 64);
    }

    #[test]
    fn array_order_matters() {
        assert_ne!(payload_hash(&json!([1, 2])), payload_hash(&json!([2, 1])));
    }

    #[test]
    fn strings_are_escaped() {
        assert_eq!(canonical_json(&json!({"k\"": "a\nb"})), r#"{"k\"":"a\nb"}"#);
    }

    #[test]
    fn plans_noop_only_for_identical_hash() {
        let unchanged = op("s1:2024-03-04", "present");
        let mut known = HashMap::new();
        known.insert(unchanged.cache_key(), payload_hash(&unchanged.payload));
        known.insert("attendance:s2:2024-03-04".to_string(), "stale".to_string());

        let planned = plan_operations(
            vec![unchanged, op("s2:2024-03-04", "late"), op("s3:2024-03-04", "absent")],
            &known,
        );
        let actions = planned.iter().map(|p| p.action).collect::<Vec<_>>();
        assert_eq!(
            actions,
            vec![PlanAction::Noop, PlanAction::Upsert, PlanAction::Upsert]
        );
        assert!(planned.iter().all(|p| p.payload_hash.len() == 64));
    }

    #[test]
    fn empty_cache_plans_everything_as_upsert() {
        let planned = plan_operations(vec![op("s1:2024-03-04", "present")], &HashMap::new());
        assert_eq!(planned[0].action, PlanAction::Upsert);
    }
}
