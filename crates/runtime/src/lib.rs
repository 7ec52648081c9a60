//! The per-peer core: the process-wide persistence cache, request
//! contexts with dirty/unload tracking, and the per-owner request queues
//! which serialize all mutation of an entity.

mod cache;
mod changes;
mod context;
mod items;
mod moves;
mod ports;
mod rq;

pub use cache::{Cache, CacheError, EntityRef};
pub use changes::collect_property_changes;
pub use context::RequestContext;
pub use items::{add_to_slot, item_in_slot};
pub use moves::{move_player, players_in};
pub use ports::{Auth, GroupHooks, NoopAuth, NoopScriptHost, RosterDecorator, ScriptHost};
pub use rq::{
    Callback, Handler, RequestQueue, RqDirectory, RqOpts, RqState, RqStatsSnapshot, TagTimer,
    GLOBAL_DISPATCH_RQ, GLOBAL_LOAD_RQ,
};

use models::{Entity, Id};
use std::sync::Arc;

/// Runtime gathers the process-wide state of one peer: configuration,
/// the peer table, the cache, and the RQ directory. It is constructed
/// once in the worker entry point and threaded through explicitly;
/// nothing here lives in ambient globals.
pub struct Runtime {
    pub cfg: config::Config,
    pub peers: config::PeerTable,
    /// This peer's id (`<hostId>-NN`).
    pub peer_id: String,
    pub cache: Arc<Cache>,
    pub rqs: Arc<RqDirectory>,
    pub script: Arc<dyn ScriptHost>,
    pub auth: Arc<dyn Auth>,
    pub hooks: GroupHooks,
}

impl Runtime {
    pub fn new(
        cfg: config::Config,
        peers: config::PeerTable,
        peer_id: String,
        store: Arc<dyn store::Store>,
        script: Arc<dyn ScriptHost>,
        auth: Arc<dyn Auth>,
    ) -> Arc<Self> {
        let cache = Arc::new(Cache::new(store));
        let rqs = RqDirectory::new(cache.clone());
        Arc::new(Self {
            cfg,
            peers,
            peer_id,
            cache,
            rqs,
            script,
            auth,
            hooks: GroupHooks::default(),
        })
    }

    /// The owning peer of `entity`, following at most a few `Via` hops
    /// (an item carried by a player routes through that player).
    pub async fn owner_of(&self, entity: &Entity) -> anyhow::Result<String> {
        let mut routed = routing::route_entity(&self.peers, entity)?;
        for _ in 0..4 {
            match routed {
                routing::Routed::Peer(peer) => return Ok(peer),
                routing::Routed::Via(id) => {
                    let via = self.cache.get(&id).await?;
                    let via = via.read().unwrap().clone();
                    routed = routing::route_entity(&self.peers, &via)?;
                }
            }
        }
        Err(routing::RoutingError::TooManyHops(entity.id.clone()).into())
    }

    /// The owning peer of `id`, loading the entity when the id alone does
    /// not classify.
    pub async fn owner_of_id(&self, id: &Id) -> anyhow::Result<String> {
        match routing::owner_of_id(&self.peers, id) {
            Ok(peer) => Ok(peer),
            Err(routing::RoutingError::NeedsEntity(_)) => {
                let entity = self.cache.get(id).await?;
                let entity = entity.read().unwrap().clone();
                self.owner_of(&entity).await
            }
            Err(err) => Err(err.into()),
        }
    }

    pub async fn is_local(&self, id: &Id) -> anyhow::Result<bool> {
        Ok(self.owner_of_id(id).await? == self.peer_id)
    }

    /// Run `func` as a request on the named queue — an owner id, or one
    /// of the well-known global queues — and return the handler's result.
    /// Login and other work with no owner queue yet runs on
    /// [`GLOBAL_LOAD_RQ`]; owner resolution runs on [`GLOBAL_DISPATCH_RQ`].
    pub async fn run_queued(
        &self,
        queue: &str,
        tag: &str,
        opts: RqOpts,
        func: Handler,
    ) -> anyhow::Result<serde_json::Value> {
        let rq = self.rqs.get_or_create(queue);
        let (tx, rx) = tokio::sync::oneshot::channel();
        let accepted = rq.push(
            tag,
            func,
            Some(Box::new(move |result| {
                let _ = tx.send(result);
            })),
            opts,
        );
        if !accepted {
            anyhow::bail!("request queue '{queue}' is closed");
        }
        rx.await
            .map_err(|_| anyhow::anyhow!("request dropped before completion"))?
    }

    /// The entity whose RQ serializes work for `id`: the location or
    /// group at the end of the routing chain. Geometry serializes on its
    /// location's queue; players on their current location's.
    pub async fn rq_owner_of(&self, id: &Id) -> anyhow::Result<Id> {
        use models::EntityKind as K;

        let mut current = id.clone();
        for _ in 0..4 {
            match current.kind() {
                K::Location | K::Group => return Ok(current),
                K::Geometry => return Ok(current.with_kind(K::Location)),
                _ => {
                    let entity = self.cache.get(&current).await?;
                    let entity = entity.read().unwrap();
                    current = match current.kind() {
                        K::Player => {
                            entity
                                .get_ref("location")
                                .ok_or_else(|| {
                                    routing::RoutingError::MissingField(
                                        entity.id.clone(),
                                        "location",
                                    )
                                })?
                                .id
                                .clone()
                        }
                        K::Item | K::Bag => entity
                            .get_str("tcont")
                            .and_then(|s| Id::parse(s).ok())
                            .ok_or_else(|| {
                                routing::RoutingError::MissingField(entity.id.clone(), "tcont")
                            })?,
                        K::Quest | K::DataContainer => {
                            entity
                                .get_ref("owner")
                                .ok_or_else(|| {
                                    routing::RoutingError::MissingField(entity.id.clone(), "owner")
                                })?
                                .id
                                .clone()
                        }
                        _ => unreachable!("handled above"),
                    };
                }
            }
        }
        Err(routing::RoutingError::TooManyHops(id.clone()).into())
    }
}
