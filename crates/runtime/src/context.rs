use crate::{Cache, CacheError, EntityRef};
use indexmap::IndexMap;
use models::{EntityKind, Id, Ref};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// Per-request state: a tag for logs, the owning entity, an optional
/// session, a local object view, and the dirty and unload sets.
///
/// The local view guarantees read-your-writes inside one request: a read
/// of an id dirtied earlier in the same request returns that same
/// instance. Handlers mark mutations explicitly with `set_dirty`; on
/// successful return the context drives persistence, and on failure the
/// dirty set is discarded untouched.
pub struct RequestContext {
    pub tag: String,
    pub owner: Option<Id>,
    pub session: Option<String>,
    cache: Arc<Cache>,
    local: HashMap<Id, EntityRef>,
    dirty: IndexMap<Id, EntityRef>,
    unload: HashSet<Id>,
}

impl RequestContext {
    pub fn new(
        cache: Arc<Cache>,
        tag: impl Into<String>,
        owner: Option<Id>,
        session: Option<String>,
    ) -> Self {
        Self {
            tag: tag.into(),
            owner,
            session,
            cache,
            local: HashMap::new(),
            dirty: IndexMap::new(),
            unload: HashSet::new(),
        }
    }

    pub fn cache(&self) -> &Arc<Cache> {
        &self.cache
    }

    /// Fetch an entity, preferring the request-local view so that reads
    /// observe writes made earlier in this request.
    pub async fn get(&mut self, id: &Id) -> Result<EntityRef, CacheError> {
        if let Some(entity) = self.local.get(id) {
            return Ok(entity.clone());
        }
        let entity = self.cache.get(id).await?;
        self.local.insert(id.clone(), entity.clone());
        Ok(entity)
    }

    /// Resolve a reference through the cache.
    pub async fn resolve(&mut self, r: &Ref) -> Result<EntityRef, CacheError> {
        self.get(&r.id).await
    }

    /// Create a fresh entity; it enters the cache and this context's
    /// dirty set immediately.
    pub fn create(&mut self, kind: EntityKind, class: &str) -> EntityRef {
        let entity = self.cache.create(kind, class);
        self.set_dirty(&entity);
        entity
    }

    /// Flag an entity for write-back at end of request. Idempotent by id.
    pub fn set_dirty(&mut self, entity: &EntityRef) {
        let id = entity.read().unwrap().id.clone();
        self.local.insert(id.clone(), entity.clone());
        self.dirty.entry(id).or_insert_with(|| entity.clone());
    }

    /// Schedule an entity for eviction from the live cache at end of
    /// request. It reloads on next access.
    pub fn set_unload(&mut self, id: &Id) {
        self.unload.insert(id.clone());
    }

    pub fn dirty_ids(&self) -> impl Iterator<Item = &Id> {
        self.dirty.keys()
    }

    /// Drive end-of-request persistence for this context's dirty and
    /// unload sets. Consumes the context; called by the RQ run loop after
    /// a successful handler return.
    pub async fn persist(self) -> Result<(), CacheError> {
        let Self {
            tag,
            cache,
            dirty,
            unload,
            ..
        } = self;
        if dirty.is_empty() && unload.is_empty() {
            return Ok(());
        }
        let dirty: Vec<EntityRef> = dirty.into_values().collect();
        tracing::debug!(%tag, dirty = dirty.len(), unload = unload.len(), "persisting request");
        cache.post_request_proc(dirty, unload, &tag).await
    }
}
