//! Message dispatch: inbound work lands on the owning entity's RQ when
//! the owner is local, and travels to the owning peer as an `obj.invoke`
//! RPC otherwise. Each peer runs both sides.

use crate::{code, ErrorPayload, PeerNet, RpcHandler};
use models::Id;
use runtime::{RqOpts, Runtime, GLOBAL_DISPATCH_RQ};
use std::sync::Arc;
use tokio::sync::watch;

/// Run `method` on `target` inside a request context on the owning
/// entity's RQ. Arguments proxify on the way in; the result refifies on
/// the way out. Requests dispatched this way block on persistence
/// (`wait_pers`): both the REPL-style reply and the inter-peer handoff
/// depend on durability.
pub async fn dispatch_local(
    rt: &Arc<Runtime>,
    target: Id,
    method: String,
    args: Vec<serde_json::Value>,
    session: Option<String>,
) -> anyhow::Result<serde_json::Value> {
    let rq_owner = rt.rq_owner_of(&target).await?;
    let script = rt.script.clone();
    let tag = format!("invoke.{method}");

    rt.run_queued(
        rq_owner.as_str(),
        &tag,
        RqOpts {
            wait_pers: true,
            session,
            close: false,
        },
        Box::new(move |ctx| {
            Box::pin(async move {
                let entity = ctx.get(&target).await?;
                let args = args.into_iter().map(models::proxify).collect();
                let result = script.invoke(ctx, entity, &method, args).await?;
                Ok(models::refify(&result))
            })
        }),
    )
    .await
}

/// Route a method invocation to wherever `target` is owned: the local RQ,
/// or the owning peer over RPC.
///
/// Locations, groups, and geometry classify from the id alone. Any other
/// target needs entity loads to find its owner; those resolutions run as
/// requests on the global dispatch queue.
pub async fn dispatch(
    rt: &Arc<Runtime>,
    net: &Arc<PeerNet>,
    target: Id,
    method: String,
    args: Vec<serde_json::Value>,
    session: Option<String>,
) -> anyhow::Result<serde_json::Value> {
    let owner = match routing::owner_of_id(&rt.peers, &target) {
        Ok(owner) => owner,
        Err(routing::RoutingError::NeedsEntity(_)) => resolve_owner(rt, target.clone()).await?,
        Err(err) => return Err(err.into()),
    };

    if owner == rt.peer_id {
        return dispatch_local(rt, target, method, args, session).await;
    }

    tracing::debug!(%target, %method, %owner, "dispatching to remote owner");
    let client = net.client_for(&owner).await?;
    let mut params = vec![serde_json::json!(target), serde_json::json!(method)];
    params.extend(args);
    Ok(client.call("obj.invoke", params).await?)
}

// Owner resolution that must load entities (a player's location, an
// item's container chain) runs serialized on the global dispatch queue.
async fn resolve_owner(rt: &Arc<Runtime>, target: Id) -> anyhow::Result<String> {
    let rt_in = rt.clone();
    let owner = rt
        .run_queued(
            GLOBAL_DISPATCH_RQ,
            "resolve_owner",
            RqOpts::default(),
            Box::new(move |_ctx| {
                Box::pin(async move {
                    let owner = rt_in.owner_of_id(&target).await?;
                    Ok(serde_json::json!(owner))
                })
            }),
        )
        .await?;
    owner
        .as_str()
        .map(str::to_string)
        .ok_or_else(|| anyhow::anyhow!("owner resolution returned a non-string"))
}

/// The core method set served by every peer.
pub struct CoreDispatcher {
    runtime: Arc<Runtime>,
    shutdown: watch::Sender<bool>,
}

impl CoreDispatcher {
    pub fn new(runtime: Arc<Runtime>, shutdown: watch::Sender<bool>) -> Arc<Self> {
        Arc::new(Self { runtime, shutdown })
    }
}

#[async_trait::async_trait]
impl RpcHandler for CoreDispatcher {
    async fn handle(
        &self,
        method: &str,
        params: Vec<serde_json::Value>,
    ) -> Result<serde_json::Value, ErrorPayload> {
        match method {
            "gs.ping" => Ok(serde_json::json!({"pong": self.runtime.peer_id})),
            "gs.shutdown" => {
                tracing::info!("received in-band shutdown request");
                let _ = self.shutdown.send(true);
                Ok(serde_json::Value::Null)
            }
            "obj.invoke" => {
                let mut params = params.into_iter();
                let target = params
                    .next()
                    .and_then(|v| v.as_str().and_then(|s| Id::parse(s).ok()))
                    .ok_or_else(|| {
                        ErrorPayload::new(code::INVALID_PARAMS, "params[0] must be an entity id")
                    })?;
                let invoked = params
                    .next()
                    .and_then(|v| v.as_str().map(str::to_string))
                    .ok_or_else(|| {
                        ErrorPayload::new(code::INVALID_PARAMS, "params[1] must be a method name")
                    })?;
                let args: Vec<serde_json::Value> = params.collect();

                dispatch_local(&self.runtime, target, invoked, args, None)
                    .await
                    .map_err(|err| {
                        ErrorPayload::new(code::INTERNAL_ERROR, format!("{err:#}"))
                    })
            }
            other => Err(ErrorPayload::new(
                code::METHOD_NOT_FOUND,
                format!("unknown method '{other}'"),
            )),
        }
    }
}
