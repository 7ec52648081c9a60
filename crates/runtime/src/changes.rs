//! The outgoing change-message builder consumes the per-cell changed
//! flags of an entity's properties.

use models::{Entity, FieldValue};
use serde_json::{json, Map, Value};

/// Collect every property cell whose value changed since the last
/// collection into a `{path: value}` map, clearing the flags. Nested
/// maps contribute dot-joined paths.
pub fn collect_property_changes(entity: &mut Entity) -> Map<String, Value> {
    let mut out = Map::new();
    for key in entity
        .fields
        .sorted_keys()
        .into_iter()
        .map(str::to_string)
        .collect::<Vec<_>>()
    {
        if let Some(value) = entity.fields.get_mut(&key) {
            walk(&key, value, &mut out);
        }
    }
    out
}

fn walk(path: &str, value: &mut FieldValue, out: &mut Map<String, Value>) {
    match value {
        FieldValue::Property(p) => {
            if p.take_changed() {
                out.insert(path.to_string(), json!(p.value));
            }
        }
        FieldValue::Map(map) => {
            for key in map
                .sorted_keys()
                .into_iter()
                .map(str::to_string)
                .collect::<Vec<_>>()
            {
                if let Some(child) = map.get_mut(&key) {
                    walk(&format!("{path}.{key}"), child, out);
                }
            }
        }
        _ => (),
    }
}
