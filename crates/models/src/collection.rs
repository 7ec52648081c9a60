use crate::{Entity, Id, Ref};
use indexmap::IndexMap;

/// Collection is an id-keyed map derived from a list of references.
/// Entries hold refs, not live objects, so members which have been
/// unloaded from the cache are re-fetched on next access through the
/// resolver supplied by the caller.
#[derive(Debug, Clone, Default)]
pub struct Collection {
    entries: IndexMap<Id, Ref>,
}

impl Collection {
    pub fn from_refs(refs: impl IntoIterator<Item = Ref>) -> Self {
        Self {
            entries: refs.into_iter().map(|r| (r.id.clone(), r)).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, id: &Id) -> bool {
        self.entries.contains_key(id)
    }

    pub fn insert(&mut self, r: Ref) {
        self.entries.insert(r.id.clone(), r);
    }

    pub fn remove(&mut self, id: &Id) -> Option<Ref> {
        self.entries.shift_remove(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Ref> {
        self.entries.values()
    }

    /// Resolve every member through `resolve`, which performs the cache
    /// lookup (and a storage load for unloaded members).
    pub fn resolved<E>(
        &self,
        mut resolve: impl FnMut(&Ref) -> Result<Entity, E>,
    ) -> Result<Vec<Entity>, E> {
        self.iter().map(|r| resolve(r)).collect()
    }

    /// Members whose class tag equals `class`, resolved through `resolve`.
    pub fn filter_class<E>(
        &self,
        class: &str,
        resolve: impl FnMut(&Ref) -> Result<Entity, E>,
    ) -> Result<Vec<Entity>, E> {
        Ok(self
            .resolved(resolve)?
            .into_iter()
            .filter(|e| e.class == class)
            .collect())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::EntityKind;

    #[test]
    fn test_collection_filter_by_class() {
        let ids: Vec<Id> = ["IAA1", "IAA2", "IAA3"]
            .iter()
            .map(|s| Id::parse(s).unwrap())
            .collect();
        let coll = Collection::from_refs(ids.iter().cloned().map(Ref::new));
        assert_eq!(coll.len(), 3);
        assert!(coll.contains(&ids[1]));

        let resolve = |r: &Ref| -> Result<Entity, std::convert::Infallible> {
            let class = if r.id == ids[2] { "apple" } else { "rock" };
            Ok(Entity::new(r.id.clone(), class, 0))
        };
        let apples = coll.filter_class("apple", resolve).unwrap();
        assert_eq!(apples.len(), 1);
        assert_eq!(apples[0].id, ids[2]);
        assert_eq!(apples[0].id.kind(), EntityKind::Item);
    }
}
