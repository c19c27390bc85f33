//! JSON merge patches (RFC 7386) computed from an old and a new revision of
//! an object, the way a merge-from patch is built against the API server.
//! Patches are applied with [`json_patch::merge`].

use serde_json::{Map, Value};

/// Computes the merge patch that turns `old` into `new`. Returns an empty
/// object when both are equal.
pub fn diff(old: &Value, new: &Value) -> Value {
    match (old, new) {
        (Value::Object(old), Value::Object(new)) => {
            let mut patch = Map::new();
            for (key, old_value) in old {
                match new.get(key) {
                    None => {
                        patch.insert(key.clone(), Value::Null);
                    }
                    Some(new_value) if new_value != old_value => {
                        let nested = match (old_value, new_value) {
                            (Value::Object(_), Value::Object(_)) => diff(old_value, new_value),
                            _ => new_value.clone(),
                        };
                        patch.insert(key.clone(), nested);
                    }
                    Some(_) => {}
                }
            }
            for (key, new_value) in new {
                if !old.contains_key(key) {
                    patch.insert(key.clone(), new_value.clone());
                }
            }
            Value::Object(patch)
        }
        _ => new.clone(),
    }
}

pub fn is_empty(patch: &Value) -> bool {
    matches!(patch, Value::Object(map) if map.is_empty())
}
