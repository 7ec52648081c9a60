//! Ports to the collaborators kept outside the core: the game-script
//! layer and authentication. The worker owns their lifecycles; the core
//! only dispatches through these interfaces.

use crate::{EntityRef, RequestContext};
use models::{FieldValue, Id, Ref};
use std::sync::{Arc, Mutex};

/// The script host defines entity behavior. Prototypes load during
/// worker startup; `invoke` runs a scripted method on an entity inside a
/// request context on the entity's owning RQ. Arguments and results are
/// field trees: the RPC boundary refifies them outbound and proxifies
/// them inbound.
#[async_trait::async_trait]
pub trait ScriptHost: Send + Sync {
    async fn load_prototypes(&self) -> anyhow::Result<()>;

    async fn invoke(
        &self,
        ctx: &mut RequestContext,
        target: EntityRef,
        method: &str,
        args: Vec<FieldValue>,
    ) -> anyhow::Result<FieldValue>;
}

/// Script host that accepts any method and returns null. Stands in until
/// a game-script layer is attached.
pub struct NoopScriptHost;

#[async_trait::async_trait]
impl ScriptHost for NoopScriptHost {
    async fn load_prototypes(&self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn invoke(
        &self,
        _ctx: &mut RequestContext,
        target: EntityRef,
        method: &str,
        _args: Vec<FieldValue>,
    ) -> anyhow::Result<FieldValue> {
        let id = target.read().unwrap().id.clone();
        tracing::debug!(%id, %method, "no script host attached, ignoring invocation");
        Ok(FieldValue::Null)
    }
}

/// Authentication port, initialized during worker startup.
#[async_trait::async_trait]
pub trait Auth: Send + Sync {
    /// Validate a client token and return the player id it names.
    async fn validate_token(&self, token: &str) -> anyhow::Result<Id>;
}

/// Accepts tokens of the form `<playerId>` verbatim. Development only.
pub struct NoopAuth;

#[async_trait::async_trait]
impl Auth for NoopAuth {
    async fn validate_token(&self, token: &str) -> anyhow::Result<Id> {
        Ok(Id::parse(token)?)
    }
}

/// A registered transformation of a group's member roster, applied when
/// the roster is assembled for delivery (chat bridges decorate rosters
/// this way).
pub type RosterDecorator = Arc<dyn Fn(Vec<Ref>) -> Vec<Ref> + Send + Sync>;

/// The documented extension hook on groups: named decorators registered
/// once and dispatched in registration order.
#[derive(Default)]
pub struct GroupHooks {
    decorators: Mutex<Vec<(String, RosterDecorator)>>,
}

impl GroupHooks {
    pub fn register(&self, name: impl Into<String>, decorator: RosterDecorator) {
        self.decorators.lock().unwrap().push((name.into(), decorator));
    }

    pub fn apply(&self, mut roster: Vec<Ref>) -> Vec<Ref> {
        for (name, decorator) in self.decorators.lock().unwrap().iter() {
            tracing::trace!(%name, "applying roster decorator");
            roster = decorator(roster);
        }
        roster
    }
}
