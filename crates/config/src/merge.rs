use serde_json::Value;

/// Deep-merge `patch` into `target`. Objects merge recursively; any other
/// value (arrays included) replaces the target wholesale.
pub fn merge_values(target: &mut Value, patch: Value) {
    match (target, patch) {
        (Value::Object(target), Value::Object(patch)) => {
            for (key, value) in patch {
                match target.get_mut(&key) {
                    Some(slot) => merge_values(slot, value),
                    None => {
                        target.insert(key, value);
                    }
                }
            }
        }
        (target, patch) => *target = patch,
    }
}

/// Set a dotted `path` within `target` to `value`, creating intermediate
/// objects as needed. Path segments match existing keys case-insensitively
/// so environment-variable overrides reach camelCase keys.
pub fn set_path(target: &mut Value, path: &str, value: Value) {
    let mut node = target;
    let segments: Vec<&str> = path.split('.').collect();

    for (i, segment) in segments.iter().enumerate() {
        if !node.is_object() {
            *node = Value::Object(Default::default());
        }
        let map = node.as_object_mut().unwrap();
        let key = map
            .keys()
            .find(|k| k.eq_ignore_ascii_case(segment))
            .cloned()
            .unwrap_or_else(|| segment.to_string());

        if i + 1 == segments.len() {
            map.insert(key, value);
            return;
        }
        node = map.entry(key).or_insert(Value::Object(Default::default()));
    }
}
