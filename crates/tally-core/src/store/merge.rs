use serde_json::{Map, Value};

/// Deep-merge `patch` into `target`.
///
/// Objects merge key by key; a `null` in the patch deletes that key. Any
/// other patch value replaces the target wholesale. Nulls nested inside a
/// replacement are dropped so the stored value never carries them.
pub fn merge_json(target: &mut Value, patch: &Value) {
    if let (Value::Object(target_map), Value::Object(patch_map)) = (&mut *target, patch) {
        for (key, value) in patch_map {
            if value.is_null() {
                target_map.remove(key);
                continue;
            }
            match target_map.get_mut(key) {
                Some(existing) => merge_json(existing, value),
                None => {
                    target_map.insert(key.clone(), strip_nulls(value));
                }
            }
        }
        return;
    }
    *target = strip_nulls(patch);
}

/// Copy of `value` with null object fields removed at every depth.
pub fn strip_nulls(value: &Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.iter()
                .filter(|(_, v)| !v.is_null())
                .map(|(k, v)| (k.clone(), strip_nulls(v)))
                .collect::<Map<String, Value>>(),
        ),
        Value::Array(items) => Value::Array(items.iter().map(strip_nulls).collect()),
        other => other.clone(),
    }
}
