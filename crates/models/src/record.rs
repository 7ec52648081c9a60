//! Transforms between persisted JSON records and in-memory field trees.
//!
//! `proxify` replaces persisted reference records with `Ref` values which
//! resolve lazily through the cache; `refify` produces a fresh JSON tree
//! in which references and properties are collapsed back to their record
//! forms. Because inter-entity edges are ids, reference cycles terminate
//! naturally: a ref is a leaf of the tree being walked.

use crate::{Entity, Error, FieldValue, Id, OrderedHash, Property, Ref};
use serde_json::{json, Map, Value};

/// Header keys of the persisted record which are not domain fields.
const HEADER_KEYS: &[&str] = &["id", "class", "created", "label"];

/// Convert a persisted JSON tree into a FieldValue tree.
/// `{id, label, isRef: true}` objects become `Ref`s and
/// `{value, bottom, top, isProp: true}` objects become `Property` cells.
pub fn proxify(value: Value) -> FieldValue {
    match value {
        Value::Null => FieldValue::Null,
        Value::Bool(b) => FieldValue::Bool(b),
        Value::Number(n) => match n.as_i64() {
            Some(i) => FieldValue::Int(i),
            None => FieldValue::Float(n.as_f64().unwrap_or(0.0)),
        },
        Value::String(s) => FieldValue::Str(s),
        Value::Array(items) => FieldValue::List(items.into_iter().map(proxify).collect()),
        Value::Object(map) => proxify_object(map),
    }
}

fn proxify_object(map: Map<String, Value>) -> FieldValue {
    if map.get("isRef").and_then(Value::as_bool) == Some(true) {
        if let Some(id) = map.get("id").and_then(Value::as_str) {
            if let Ok(id) = Id::parse(id) {
                let label = map
                    .get("label")
                    .and_then(Value::as_str)
                    .map(str::to_string);
                return FieldValue::Ref(Ref { id, label });
            }
        }
    }
    if map.get("isProp").and_then(Value::as_bool) == Some(true) {
        if let (Some(value), Some(bottom), Some(top)) = (
            map.get("value").and_then(Value::as_i64),
            map.get("bottom").and_then(Value::as_i64),
            map.get("top").and_then(Value::as_i64),
        ) {
            return FieldValue::Property(Property::new(value, bottom, top));
        }
    }
    FieldValue::Map(map.into_iter().map(|(k, v)| (k, proxify(v))).collect())
}

/// Produce a fresh JSON tree from a FieldValue tree, collapsing `Ref` and
/// `Property` values to their persisted record forms. Map keys beginning
/// with `!` are never serialized.
pub fn refify(value: &FieldValue) -> Value {
    match value {
        FieldValue::Null => Value::Null,
        FieldValue::Bool(b) => Value::Bool(*b),
        FieldValue::Int(i) => json!(i),
        FieldValue::Float(f) => json!(f),
        FieldValue::Str(s) => Value::String(s.clone()),
        FieldValue::List(items) => Value::Array(items.iter().map(refify).collect()),
        FieldValue::Map(map) => {
            let mut out = Map::new();
            for (k, v) in map.iter() {
                if k.starts_with('!') {
                    continue;
                }
                out.insert(k.to_string(), refify(v));
            }
            Value::Object(out)
        }
        FieldValue::Ref(r) => ref_record(r),
        FieldValue::Property(p) => json!({
            "value": p.value,
            "bottom": p.bottom,
            "top": p.top,
            "isProp": true,
        }),
    }
}

fn ref_record(r: &Ref) -> Value {
    match &r.label {
        Some(label) => json!({"id": r.id, "label": label, "isRef": true}),
        None => json!({"id": r.id, "isRef": true}),
    }
}

pub(crate) fn entity_to_record(entity: &Entity) -> Value {
    let mut out = Map::new();
    out.insert("id".to_string(), json!(entity.id));
    out.insert("class".to_string(), json!(entity.class));
    out.insert("created".to_string(), json!(entity.created_ms));
    if let Some(label) = &entity.label {
        out.insert("label".to_string(), json!(label));
    }
    for (k, v) in entity.fields.iter() {
        if k.starts_with('!') || HEADER_KEYS.contains(&k) {
            continue;
        }
        out.insert(k.to_string(), refify(v));
    }
    Value::Object(out)
}

pub(crate) fn entity_from_record(value: Value) -> Result<Entity, Error> {
    let Value::Object(map) = value else {
        return Err(Error::MalformedRecord(value.to_string()));
    };

    let id = map
        .get("id")
        .and_then(Value::as_str)
        .ok_or_else(|| Error::MalformedRecord("missing 'id'".to_string()))?;
    let id = Id::parse(id)?;

    let class = map
        .get("class")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let created_ms = map.get("created").and_then(Value::as_i64).unwrap_or(0);
    let label = map
        .get("label")
        .and_then(Value::as_str)
        .map(str::to_string);

    let mut fields = OrderedHash::new();
    for (k, v) in map {
        if HEADER_KEYS.contains(&k.as_str()) {
            continue;
        }
        fields.insert(k, proxify(v));
    }

    Ok(Entity {
        id,
        class,
        created_ms,
        label,
        fields,
        deleted: false,
    })
}
