use crate::{record, Error, FieldValue, Id, OrderedHash, Property, Ref};

/// Entity is a live game object: a location, group, item, bag, player,
/// quest, data container, or geometry record. Domain fields beyond the
/// fixed header are uninterpreted by the runtime.
#[derive(Debug, Clone, PartialEq)]
pub struct Entity {
    pub id: Id,
    /// Class tag selecting a script prototype.
    pub class: String,
    /// Creation timestamp, milliseconds since the epoch.
    pub created_ms: i64,
    pub label: Option<String>,
    pub fields: OrderedHash,
    /// Marked by `del()`; a deleted entity is removed from storage at the
    /// end of the request instead of written.
    pub deleted: bool,
}

impl Entity {
    pub fn new(id: Id, class: impl Into<String>, created_ms: i64) -> Self {
        Self {
            id,
            class: class.into(),
            created_ms,
            label: None,
            fields: OrderedHash::new(),
            deleted: false,
        }
    }

    /// Mark this entity deleted. It is removed from storage at the end of
    /// the current request.
    pub fn del(&mut self) {
        self.deleted = true;
    }

    pub fn get(&self, key: &str) -> Option<&FieldValue> {
        self.fields.get(key)
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<FieldValue>) {
        self.fields.insert(key, value.into());
    }

    pub fn get_ref(&self, key: &str) -> Option<&Ref> {
        self.fields.get(key).and_then(FieldValue::as_ref_value)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.fields.get(key).and_then(FieldValue::as_str)
    }

    pub fn get_int(&self, key: &str) -> Option<i64> {
        self.fields.get(key).and_then(FieldValue::as_int)
    }

    pub fn get_property_mut(&mut self, key: &str) -> Option<&mut Property> {
        self.fields.get_mut(key).and_then(FieldValue::as_property_mut)
    }

    /// A reference record naming this entity.
    pub fn to_ref(&self) -> Ref {
        Ref {
            id: self.id.clone(),
            label: self.label.clone(),
        }
    }

    /// Serialize to the persisted record form. References collapse to
    /// `{id, label, isRef}` records; keys beginning with `!` are skipped.
    pub fn to_record(&self) -> serde_json::Value {
        record::entity_to_record(self)
    }

    /// Construct from a persisted record, replacing reference records
    /// with `Ref` values.
    pub fn from_record(value: serde_json::Value) -> Result<Self, Error> {
        record::entity_from_record(value)
    }
}
