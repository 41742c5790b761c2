//! Recursive-override merge of nested configuration maps.

use serde_json::Value;

/// Merge `overlay` into `base`.
///
/// Maps merge key-wise and recursively; any other overlay value (scalar,
/// array, null) replaces the base value; keys absent from the overlay keep
/// the base value.
pub fn deep_merge(base: &mut Value, overlay: &Value) {
    match (base, overlay) {
        (Value::Object(base_map), Value::Object(overlay_map)) => {
            for (key, overlay_value) in overlay_map {
                match base_map.get_mut(key) {
                    Some(base_value) if base_value.is_object() && overlay_value.is_object() => {
                        deep_merge(base_value, overlay_value);
                    }
                    _ => {
                        base_map.insert(key.clone(), overlay_value.clone());
                    }
                }
            }
        }
        (base, overlay) => *base = overlay.clone(),
    }
}
