use futures::future::{BoxFuture, FutureExt, Shared};
use models::{Entity, EntityKind, Id, IdGenerator, Ref};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{SystemTime, UNIX_EPOCH};
use store::{Store, StoreError};

/// A live cached entity. Mutation happens only on the entity's owning RQ,
/// so the lock is held for short synchronous sections and never across an
/// await point.
pub type EntityRef = Arc<RwLock<Entity>>;

#[derive(Debug, Clone, thiserror::Error)]
pub enum CacheError {
    #[error("reference to missing entity '{0}'")]
    ReferenceMissing(Id),
    #[error(transparent)]
    Storage(#[from] StoreError),
    #[error("malformed record for '{0}'")]
    BadRecord(Id, #[source] models::Error),
}

// A load in progress. Concurrent gets for the same id share this future,
// which is what bounds loads to at most one in flight per id.
type LoadFuture = Shared<BoxFuture<'static, Result<EntityRef, CacheError>>>;

enum Slot {
    Live(EntityRef),
    Loading(LoadFuture),
}

/// The process-wide live-object cache: one mapping from id to entity,
/// loading on miss and writing dirty entities back after each request.
pub struct Cache {
    slots: Mutex<HashMap<Id, Slot>>,
    store: Arc<dyn Store>,
    ids: IdGenerator,
}

impl Cache {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
            store,
            ids: IdGenerator::new(),
        }
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    /// Fetch the live instance for `id`, loading it from storage on miss.
    /// A concurrent `get` for an id already being loaded joins that load.
    pub async fn get(&self, id: &Id) -> Result<EntityRef, CacheError> {
        let load = {
            let mut slots = self.slots.lock().unwrap();
            match slots.get(id) {
                Some(Slot::Live(entity)) => return Ok(entity.clone()),
                Some(Slot::Loading(load)) => load.clone(),
                None => {
                    let store = self.store.clone();
                    let load_id = id.clone();
                    let load = async move {
                        let record = store.read(&load_id).await?;
                        let record = record.ok_or_else(|| {
                            CacheError::ReferenceMissing(load_id.clone())
                        })?;
                        let entity = Entity::from_record(record)
                            .map_err(|err| CacheError::BadRecord(load_id.clone(), err))?;
                        Ok(Arc::new(RwLock::new(entity)))
                    }
                    .boxed()
                    .shared();
                    slots.insert(id.clone(), Slot::Loading(load.clone()));
                    load
                }
            }
        };

        let result = load.await;
        let mut slots = self.slots.lock().unwrap();
        match &result {
            Ok(entity) => {
                // First waiter through promotes the slot; the entry may
                // already be Live if another waiter beat us here.
                if !matches!(slots.get(id), Some(Slot::Live(_))) {
                    slots.insert(id.clone(), Slot::Live(entity.clone()));
                }
            }
            Err(_) => {
                if matches!(slots.get(id), Some(Slot::Loading(_))) {
                    slots.remove(id);
                }
            }
        }
        result
    }

    /// Resolve a reference, failing with `ReferenceMissing` when the
    /// target is absent from storage.
    pub async fn resolve(&self, r: &Ref) -> Result<EntityRef, CacheError> {
        self.get(&r.id).await
    }

    /// Construct a fresh entity with a newly allocated id and cache it.
    /// The caller (the request context) flags it dirty.
    pub fn create(&self, kind: EntityKind, class: &str) -> EntityRef {
        let id = self.ids.next(kind);
        let entity = Arc::new(RwLock::new(Entity::new(id.clone(), class, now_ms())));
        let mut slots = self.slots.lock().unwrap();
        slots.insert(id, Slot::Live(entity.clone()));
        entity
    }

    pub fn contains(&self, id: &Id) -> bool {
        matches!(self.slots.lock().unwrap().get(id), Some(Slot::Live(_)))
    }

    pub fn evict(&self, id: &Id) {
        self.slots.lock().unwrap().remove(id);
    }

    /// End-of-request persistence: write every dirty entity (deleted ones
    /// are removed from storage instead), then evict the unload set.
    /// Transient storage failures are retried once.
    pub async fn post_request_proc(
        &self,
        dirty: Vec<EntityRef>,
        unload: HashSet<Id>,
        tag: &str,
    ) -> Result<(), CacheError> {
        for entity in dirty {
            let (id, deleted, record) = {
                let entity = entity.read().unwrap();
                (entity.id.clone(), entity.deleted, entity.to_record())
            };
            if deleted {
                with_retry(tag, &id, || self.store.delete(&id)).await?;
                self.evict(&id);
            } else {
                with_retry(tag, &id, || self.store.write(&id, record.clone())).await?;
            }
        }
        for id in &unload {
            self.evict(id);
        }
        Ok(())
    }
}

async fn with_retry<F, Fut>(tag: &str, id: &Id, mut op: F) -> Result<(), CacheError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<(), StoreError>>,
{
    match op().await {
        Err(err) if err.is_transient() => {
            tracing::warn!(%tag, %id, %err, "transient storage failure, retrying");
            Ok(op().await?)
        }
        other => Ok(other?),
    }
}

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;
    use store::MemStore;

    async fn cache_with(records: &[(&str, serde_json::Value)]) -> (Arc<Cache>, Arc<MemStore>) {
        let store = Arc::new(MemStore::new());
        let cache = Arc::new(Cache::new(store.clone()));
        for (id, record) in records {
            let id = Id::parse(id).unwrap();
            store.write(&id, record.clone()).await.unwrap();
        }
        (cache, store)
    }

    #[tokio::test]
    async fn test_load_on_miss_and_cache_hit() {
        let (cache, _) = cache_with(&[("LX1", json!({"id": "LX1", "class": "loc"}))]).await;
        let id = Id::parse("LX1").unwrap();

        assert!(!cache.contains(&id));
        let first = cache.get(&id).await.unwrap();
        assert!(cache.contains(&id));

        // The second get returns the same instance.
        let second = cache.get(&id).await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[tokio::test]
    async fn test_concurrent_gets_coalesce() {
        let (cache, _) = cache_with(&[("LX1", json!({"id": "LX1", "class": "loc"}))]).await;
        let id = Id::parse("LX1").unwrap();

        let (a, b) = tokio::join!(cache.get(&id), cache.get(&id));
        assert!(Arc::ptr_eq(&a.unwrap(), &b.unwrap()));
    }

    #[tokio::test]
    async fn test_missing_target_is_reference_missing() {
        let (cache, _) = cache_with(&[]).await;
        let r = Ref::new(Id::parse("LNOPE").unwrap());
        assert!(matches!(
            cache.resolve(&r).await,
            Err(CacheError::ReferenceMissing(_))
        ));
        // A failed load leaves no slot behind; a later get retries.
        assert!(!cache.contains(&r.id));
    }

    #[tokio::test]
    async fn test_post_request_writes_dirty_and_evicts_unload() {
        let (cache, store) = cache_with(&[("LX1", json!({"id": "LX1", "class": "loc"}))]).await;
        let id = Id::parse("LX1").unwrap();

        let entity = cache.get(&id).await.unwrap();
        entity.write().unwrap().set("population", 7);

        let unload: HashSet<Id> = [id.clone()].into();
        cache
            .post_request_proc(vec![entity], unload, "test")
            .await
            .unwrap();

        // The write landed and the entry was evicted; the next get loads.
        assert!(!cache.contains(&id));
        let reloaded = cache.get(&id).await.unwrap();
        assert_eq!(reloaded.read().unwrap().get_int("population"), Some(7));
        assert_eq!(store.table_len(&id), 1);
    }

    #[tokio::test]
    async fn test_deleted_entity_is_removed_not_written() {
        let (cache, store) = cache_with(&[("IX1", json!({"id": "IX1", "class": "rock"}))]).await;
        let id = Id::parse("IX1").unwrap();

        let entity = cache.get(&id).await.unwrap();
        entity.write().unwrap().del();
        cache
            .post_request_proc(vec![entity], HashSet::new(), "test")
            .await
            .unwrap();

        assert_eq!(store.table_len(&id), 0);
        assert!(!cache.contains(&id));
    }

    #[tokio::test]
    async fn test_transient_write_failure_is_retried_once() {
        let (cache, store) = cache_with(&[]).await;
        let entity = cache.create(EntityKind::Location, "loc");
        store.fail_next_writes(1);

        cache
            .post_request_proc(vec![entity.clone()], HashSet::new(), "test")
            .await
            .unwrap();
        let id = entity.read().unwrap().id.clone();
        assert_eq!(store.table_len(&id), 1);

        // Two consecutive failures surface.
        store.fail_next_writes(2);
        let err = cache
            .post_request_proc(vec![entity], HashSet::new(), "test")
            .await
            .unwrap_err();
        assert!(matches!(err, CacheError::Storage(_)));
    }

    #[tokio::test]
    async fn test_created_ids_are_fresh_and_cached() {
        let (cache, _) = cache_with(&[]).await;
        let a = cache.create(EntityKind::Player, "human");
        let b = cache.create(EntityKind::Player, "human");
        let (a_id, b_id) = (
            a.read().unwrap().id.clone(),
            b.read().unwrap().id.clone(),
        );
        assert_ne!(a_id, b_id);
        assert!(cache.contains(&a_id));
        assert!(cache.contains(&b_id));
    }
}
