//! The shard router: a pure mapping from entities to their owning peer.
//!
//! Locations and groups hash their own id into the sorted peer list.
//! Geometry shares its location's hash. Players route to their current
//! location, items to their top container, quests and data containers to
//! their owner; where that detour passes through another entity which is
//! not routable by id alone, the router returns a `Via` hop and the
//! caller resolves it through the cache. The hash skips the id's type
//! prefix so that a location and its geometry co-locate.

use config::PeerTable;
use models::{Entity, EntityKind, Id};

#[derive(Debug, thiserror::Error)]
pub enum RoutingError {
    #[error("id '{0}' cannot be routed without its entity")]
    NeedsEntity(Id),
    #[error("entity '{0}' is missing the '{1}' field required for routing")]
    MissingField(Id, &'static str),
    #[error("routing of '{0}' did not terminate")]
    TooManyHops(Id),
    #[error("the peer table is empty")]
    NoPeers,
}

/// The outcome of one routing step: either the owning peer, or another
/// entity through which routing continues.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Routed {
    Peer(String),
    Via(Id),
}

/// Route an id without its entity. Only locations, groups, and geometry
/// are routable this way; other prefixes fail.
pub fn owner_of_id(peers: &PeerTable, id: &Id) -> Result<String, RoutingError> {
    match id.kind() {
        EntityKind::Location | EntityKind::Group | EntityKind::Geometry => {
            owner_by_hash(peers, id)
        }
        _ => Err(RoutingError::NeedsEntity(id.clone())),
    }
}

/// One routing step for an entity, applying the per-kind rules.
pub fn route_entity(peers: &PeerTable, entity: &Entity) -> Result<Routed, RoutingError> {
    let hop = |id: &Id| -> Result<Routed, RoutingError> {
        match id.kind() {
            EntityKind::Location | EntityKind::Group | EntityKind::Geometry => {
                Ok(Routed::Peer(owner_by_hash(peers, id)?))
            }
            _ => Ok(Routed::Via(id.clone())),
        }
    };

    match entity.id.kind() {
        EntityKind::Location | EntityKind::Group | EntityKind::Geometry => {
            Ok(Routed::Peer(owner_by_hash(peers, &entity.id)?))
        }
        EntityKind::Player => {
            let location = entity
                .get_ref("location")
                .ok_or(RoutingError::MissingField(entity.id.clone(), "location"))?;
            hop(&location.id)
        }
        EntityKind::Item | EntityKind::Bag => {
            // `tcont` names the top container, always a location or player.
            let tcont = entity
                .get_str("tcont")
                .and_then(|s| Id::parse(s).ok())
                .ok_or(RoutingError::MissingField(entity.id.clone(), "tcont"))?;
            hop(&tcont)
        }
        EntityKind::Quest | EntityKind::DataContainer => {
            let owner = entity
                .get_ref("owner")
                .ok_or(RoutingError::MissingField(entity.id.clone(), "owner"))?;
            hop(&owner.id)
        }
    }
}

/// Whether `id` is owned by `this_peer`. Only valid for ids routable
/// without their entity.
pub fn is_local_id(peers: &PeerTable, this_peer: &str, id: &Id) -> Result<bool, RoutingError> {
    Ok(owner_of_id(peers, id)? == this_peer)
}

// The stable hash: the sum of character codes from index 1 onward.
// Index 0 carries the type prefix and is deliberately excluded so that
// ids differing only in prefix land on the same peer.
fn owner_by_hash(peers: &PeerTable, id: &Id) -> Result<String, RoutingError> {
    if peers.is_empty() {
        return Err(RoutingError::NoPeers);
    }
    let hash: u64 = id.token().chars().map(|c| c as u64).sum();
    let index = (hash % peers.len() as u64) as usize;
    Ok(peers.iter().nth(index).unwrap().id.clone())
}
