use crate::{ConfigError, NetConfig};
use std::net::UdpSocket;
use std::sync::Mutex;

/// One game-server process in the cluster.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct Peer {
    /// `<hostId>-NN`, with NN the 1-based, zero-padded port index.
    pub id: String,
    pub host: String,
    pub port: u16,
    /// Whether `host` matches one of this machine's interface addresses.
    pub local: bool,
}

/// The derived global peer table. Peers are held in lexicographic id
/// order, which fixes both shard-hash assignment and iteration order.
#[derive(Debug, Clone)]
pub struct PeerTable {
    peers: Vec<Peer>,
    rpc_base_port: u16,
    client_base_port: u16,
}

impl PeerTable {
    pub fn derive(net: &NetConfig, local: &[String]) -> Result<Self, ConfigError> {
        let mut peers = Vec::new();
        for (host_id, host_cfg) in &net.gameservers {
            let is_local = local.iter().any(|a| a == &host_cfg.host);
            for (i, port) in host_cfg.ports.iter().enumerate() {
                peers.push(Peer {
                    id: format!("{}-{:02}", host_id, i + 1),
                    host: host_cfg.host.clone(),
                    port: *port,
                    local: is_local,
                });
            }
        }
        if peers.is_empty() {
            return Err(ConfigError::NoPeers);
        }
        peers.sort_by(|a, b| a.id.cmp(&b.id));

        Ok(Self {
            peers,
            rpc_base_port: net.rpc.base_port,
            client_base_port: net.client_base_port,
        })
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&Peer> {
        self.peers.iter().find(|p| p.id == id)
    }

    /// All peers in lexicographic id order.
    pub fn iter(&self) -> impl Iterator<Item = &Peer> {
        self.peers.iter()
    }

    /// Peers running on this machine, in lexicographic id order.
    pub fn local_peers(&self) -> impl Iterator<Item = &Peer> {
        self.peers.iter().filter(|p| p.local)
    }

    /// Peers running elsewhere, in lexicographic id order.
    pub fn remote_peers(&self) -> impl Iterator<Item = &Peer> {
        self.peers.iter().filter(|p| !p.local)
    }

    pub fn index_of(&self, id: &str) -> Result<usize, ConfigError> {
        self.peers
            .iter()
            .position(|p| p.id == id)
            .ok_or_else(|| ConfigError::UnknownPeer(id.to_string()))
    }

    /// The RPC service port of a peer: `basePort + 1 + index` in the
    /// sorted peer list. The master itself uses `basePort`.
    pub fn rpc_port(&self, id: &str) -> Result<u16, ConfigError> {
        Ok(self.rpc_base_port + 1 + self.index_of(id)? as u16)
    }

    pub fn master_rpc_port(&self) -> u16 {
        self.rpc_base_port
    }

    /// The client (session) listen port of a peer, offset the same way.
    pub fn client_port(&self, id: &str) -> Result<u16, ConfigError> {
        Ok(self.client_base_port + 1 + self.index_of(id)? as u16)
    }
}

static LOCAL_ADDRS: Mutex<Option<Vec<String>>> = Mutex::new(None);

/// Addresses considered local to this machine: the loopback addresses plus
/// the primary outbound interface address. The probe result is cached for
/// the life of the process.
pub fn local_addrs() -> Vec<String> {
    let mut cached = LOCAL_ADDRS.lock().unwrap();
    if let Some(addrs) = cached.as_ref() {
        return addrs.clone();
    }

    let mut addrs = vec![
        "127.0.0.1".to_string(),
        "::1".to_string(),
        "localhost".to_string(),
    ];
    // Routing probe: connect() on a UDP socket selects the outbound
    // interface without sending a packet.
    if let Ok(socket) = UdpSocket::bind("0.0.0.0:0") {
        if socket.connect("198.51.100.1:80").is_ok() {
            if let Ok(addr) = socket.local_addr() {
                addrs.push(addr.ip().to_string());
            }
        }
    }

    *cached = Some(addrs.clone());
    addrs
}

/// Drop the cached local-address probe. Test use only.
pub fn reset() {
    *LOCAL_ADDRS.lock().unwrap() = None;
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{Config, HostConfig};

    fn net_fixture() -> crate::NetConfig {
        let mut cfg = Config::from_value(crate::defaults()).unwrap();
        cfg.net.gameservers.insert(
            "gs1".to_string(),
            HostConfig {
                host: "10.0.0.1".to_string(),
                ports: vec![1443, 1444],
            },
        );
        cfg.net.gameservers.insert(
            "gs2".to_string(),
            HostConfig {
                host: "10.0.0.2".to_string(),
                ports: vec![1443],
            },
        );
        cfg.net
    }

    #[test]
    fn test_peer_derivation_and_iteration_order() {
        let table = PeerTable::derive(&net_fixture(), &["10.0.0.1".to_string()]).unwrap();

        let locals: Vec<&str> = table.local_peers().map(|p| p.id.as_str()).collect();
        assert_eq!(locals, vec!["gs1-01", "gs1-02"]);

        let remotes: Vec<&str> = table.remote_peers().map(|p| p.id.as_str()).collect();
        assert_eq!(remotes, vec!["gs2-01"]);

        assert_eq!(table.get("gs1-02").unwrap().port, 1444);
        assert!(table.get("gs3-01").is_none());
    }

    #[test]
    fn test_service_ports_follow_sorted_index() {
        let table = PeerTable::derive(&net_fixture(), &[]).unwrap();
        assert_eq!(table.master_rpc_port(), 17000);
        assert_eq!(table.rpc_port("gs1-01").unwrap(), 17001);
        assert_eq!(table.rpc_port("gs1-02").unwrap(), 17002);
        assert_eq!(table.rpc_port("gs2-01").unwrap(), 17003);
        assert!(table.rpc_port("nope-01").is_err());
    }

    #[test]
    fn test_no_peers_is_an_error() {
        let mut net = net_fixture();
        net.gameservers.clear();
        assert!(matches!(
            PeerTable::derive(&net, &[]),
            Err(ConfigError::NoPeers)
        ));
    }
}
