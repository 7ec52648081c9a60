use crate::{PeerNet, RpcError};
use models::{Entity, FieldValue, Id};
use std::sync::Arc;

/// Local stand-in for an entity owned by another peer. Field reads pass
/// through to the cached snapshot (when one has been fetched); method
/// invocations marshal their arguments to reference records and dispatch
/// to the owning peer, which runs the method on the entity's own RQ.
pub struct RemoteEntity {
    pub id: Id,
    /// The owning peer, as resolved by the shard router.
    pub peer: String,
    net: Arc<PeerNet>,
    snapshot: Option<Entity>,
}

impl RemoteEntity {
    pub fn new(id: Id, peer: String, net: Arc<PeerNet>) -> Self {
        Self {
            id,
            peer,
            net,
            snapshot: None,
        }
    }

    pub fn with_snapshot(mut self, snapshot: Entity) -> Self {
        self.snapshot = Some(snapshot);
        self
    }

    /// A non-function property read: served from the snapshot without
    /// touching the network.
    pub fn field(&self, name: &str) -> Option<&FieldValue> {
        self.snapshot.as_ref().and_then(|e| e.get(name))
    }

    /// Invoke a method on the remote entity. Arguments refify on the way
    /// out; the result proxifies on the way back in.
    pub async fn call(
        &self,
        method: &str,
        args: Vec<FieldValue>,
    ) -> Result<FieldValue, RpcError> {
        let client = self.net.client_for(&self.peer).await?;
        let mut params = vec![
            serde_json::json!(self.id),
            serde_json::json!(method),
        ];
        params.extend(args.iter().map(models::refify));

        let result = client.call("obj.invoke", params).await?;
        Ok(models::proxify(result))
    }
}
