use crate::{Client, RpcError};
use config::PeerTable;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

// A connection which may be ready (Some), currently being dialed (the
// async lock is held), or neither.
type DialState = Arc<futures::lock::Mutex<Option<Arc<Client>>>>;

/// The per-peer RPC connection table. Connections dial lazily on first
/// use and are shared by all callers; a concurrent caller for a peer
/// being dialed waits on the same dial.
pub struct PeerNet {
    states: std::sync::Mutex<HashMap<String, DialState>>,
    peers: PeerTable,
    timeout: Duration,
}

impl PeerNet {
    pub fn new(peers: PeerTable, timeout: Duration) -> Arc<Self> {
        Arc::new(Self {
            states: std::sync::Mutex::new(HashMap::new()),
            peers,
            timeout,
        })
    }

    pub fn peers(&self) -> &PeerTable {
        &self.peers
    }

    /// A ready client for `peer_id`, dialing if necessary.
    pub async fn client_for(&self, peer_id: &str) -> Result<Arc<Client>, RpcError> {
        let state = {
            // Non-async lock, never held across an await point.
            let mut states = self.states.lock().unwrap();
            states.entry(peer_id.to_string()).or_default().clone()
        };

        // Peer-specific, async-aware lock.
        let mut state = state.lock().await;

        // Fast path: dialed and still healthy.
        if let Some(client) = &*state {
            if client.is_healthy() {
                return Ok(client.clone());
            }
        }

        // Slow path: (re)dial the peer's RPC service port.
        let peer = self
            .peers
            .get(peer_id)
            .ok_or_else(|| config::ConfigError::UnknownPeer(peer_id.to_string()))?;
        let port = self.peers.rpc_port(peer_id)?;
        tracing::debug!(%peer_id, host = %peer.host, port, "dialing peer");
        let client = Client::connect(peer_id, (peer.host.as_str(), port), self.timeout).await?;

        *state = Some(client.clone());
        Ok(client)
    }

    /// Drop the connection to `peer_id` (e.g. after the master restarts
    /// that worker); the next call re-dials.
    pub fn disconnect(&self, peer_id: &str) {
        self.states.lock().unwrap().remove(peer_id);
    }
}
