//! Cluster configuration: merged sources, the derived peer table, and
//! per-peer service ports.
//!
//! Precedence, highest first: process environment, command-line overrides,
//! the local config file, the base config file, built-in defaults.
//! Configuration is derived once during startup and handed to the runtime;
//! it is not mutated afterwards.

mod merge;
mod peers;

pub use merge::{merge_values, set_path};
pub use peers::{local_addrs, reset, Peer, PeerTable};

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

/// Environment variable carrying a worker's peer id. Absent for the master.
pub const GSID_VAR: &str = "gsid";

/// Prefix of environment variables which override config values.
/// `BURROW_NET__RPC__BASEPORT=18000` overrides `net.rpc.basePort`.
pub const ENV_PREFIX: &str = "BURROW_";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file '{path}'")]
    ReadFile {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file '{path}'")]
    ParseFile {
        path: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("config does not match the expected schema")]
    Schema(#[source] serde_json::Error),
    #[error("invalid override '{0}' (expected path=value)")]
    BadOverride(String),
    #[error("no game servers are configured")]
    NoPeers,
    #[error("unknown peer id '{0}'")]
    UnknownPeer(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    pub net: NetConfig,
    #[serde(rename = "proc")]
    pub proc_: ProcConfig,
    pub data: DataConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetConfig {
    /// Host id to `{host, ports[]}`; one worker peer is derived per port.
    pub gameservers: BTreeMap<String, HostConfig>,
    pub rpc: RpcConfig,
    pub heartbeat: HeartbeatConfig,
    /// Port on which workers accept client (session) connections,
    /// offset by the worker's peer index.
    pub client_base_port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostConfig {
    pub host: String,
    pub ports: Vec<u16>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RpcConfig {
    /// The master listens on `basePort`; worker NN's RPC service port is
    /// `basePort + 1 + index(peer)` in the sorted peer list.
    pub base_port: u16,
    /// Requests pending longer than this are swept and fail their callers.
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatConfig {
    #[serde(with = "humantime_serde")]
    pub interval: Duration,
    /// A worker silent past this is assumed dead and restarted.
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcConfig {
    /// Grace period after the in-band shutdown message.
    #[serde(with = "humantime_serde")]
    pub shutdown_timeout: Duration,
    /// Grace period between the escalating kill signals.
    #[serde(with = "humantime_serde")]
    pub kill_timeout: Duration,
    /// Bound on the master's entire shutdown sequence.
    #[serde(with = "humantime_serde")]
    pub master_timeout: Duration,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataConfig {
    /// Storage backend selector: "mem" or "fs".
    pub backend: String,
    /// Root directory of the "fs" backend.
    pub dir: String,
    /// Table-name overrides by id type prefix, e.g. `{"P": "avatars"}`.
    /// Prefixes not listed use the built-in one-table-per-type mapping.
    #[serde(default)]
    pub tables: BTreeMap<String, String>,
}

/// Built-in defaults, the lowest-precedence source.
pub fn defaults() -> serde_json::Value {
    serde_json::json!({
        "net": {
            "gameservers": {},
            "rpc": {"basePort": 17000, "timeout": "10s"},
            "heartbeat": {"interval": "5s", "timeout": "15s"},
            "clientBasePort": 1443,
        },
        "proc": {
            "shutdownTimeout": "10s",
            "killTimeout": "5s",
            "masterTimeout": "60s",
        },
        "data": {"backend": "fs", "dir": "./data"},
    })
}

impl Config {
    /// Load and merge all configuration sources.
    /// `overrides` are `path=value` pairs from the command line; the
    /// process environment is consulted last (highest precedence).
    pub fn load(
        base_file: Option<&Path>,
        local_file: Option<&Path>,
        overrides: &[String],
    ) -> Result<Self, ConfigError> {
        let mut merged = defaults();

        for path in [base_file, local_file].into_iter().flatten() {
            merge_values(&mut merged, read_file(path)?);
        }
        for entry in overrides {
            let (path, value) = entry
                .split_once('=')
                .ok_or_else(|| ConfigError::BadOverride(entry.clone()))?;
            set_path(&mut merged, path, parse_scalar(value));
        }
        for (key, value) in std::env::vars() {
            let Some(stripped) = key.strip_prefix(ENV_PREFIX) else {
                continue;
            };
            let path = stripped.split("__").collect::<Vec<_>>().join(".");
            set_path(&mut merged, &path, parse_scalar(&value));
        }

        Self::from_value(merged)
    }

    pub fn from_value(value: serde_json::Value) -> Result<Self, ConfigError> {
        serde_json::from_value(value).map_err(ConfigError::Schema)
    }

    /// Derive the global peer table, marking peers whose host matches one
    /// of `local` as local to this machine.
    pub fn peer_table(&self, local: &[String]) -> Result<PeerTable, ConfigError> {
        PeerTable::derive(&self.net, local)
    }
}

fn read_file(path: &Path) -> Result<serde_json::Value, ConfigError> {
    let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::ReadFile {
        path: path.display().to_string(),
        source,
    })?;
    serde_json::from_str(&raw).map_err(|source| ConfigError::ParseFile {
        path: path.display().to_string(),
        source,
    })
}

// Override values parse as JSON scalars where possible ("17000" becomes a
// number, "true" a bool) and fall back to plain strings.
fn parse_scalar(raw: &str) -> serde_json::Value {
    serde_json::from_str(raw).unwrap_or_else(|_| serde_json::Value::String(raw.to_string()))
}
