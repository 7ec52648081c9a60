use crate::FieldValue;
use std::collections::HashMap;

/// OrderedHash is a string-keyed map whose iteration order is the natural
/// string sort of the keys present when iteration begins. Writes are O(1);
/// reads which iterate pay an O(n log n) sort.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct OrderedHash {
    inner: HashMap<String, FieldValue>,
}

impl OrderedHash {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn get(&self, key: &str) -> Option<&FieldValue> {
        self.inner.get(key)
    }

    pub fn get_mut(&mut self, key: &str) -> Option<&mut FieldValue> {
        self.inner.get_mut(key)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: FieldValue) -> Option<FieldValue> {
        self.inner.insert(key.into(), value)
    }

    pub fn remove(&mut self, key: &str) -> Option<FieldValue> {
        self.inner.remove(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.inner.contains_key(key)
    }

    /// Keys in natural string sort order, as of this call.
    pub fn sorted_keys(&self) -> Vec<&str> {
        let mut keys: Vec<&str> = self.inner.keys().map(String::as_str).collect();
        keys.sort_unstable();
        keys
    }

    /// Iterate entries in sorted-key order. The order is fixed at the
    /// moment of the call; concurrent inserts are not observed.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &FieldValue)> {
        self.sorted_keys()
            .into_iter()
            .map(|k| (k, self.inner.get(k).unwrap()))
    }

    pub fn values_mut(&mut self) -> impl Iterator<Item = &mut FieldValue> {
        self.inner.values_mut()
    }
}

impl FromIterator<(String, FieldValue)> for OrderedHash {
    fn from_iter<T: IntoIterator<Item = (String, FieldValue)>>(iter: T) -> Self {
        Self {
            inner: iter.into_iter().collect(),
        }
    }
}
