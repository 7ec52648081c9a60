//! The symmetric peer-to-peer RPC layer: a length-framed JSON wire
//! protocol, a client with per-request correlation and timeout sweeping,
//! a server which dispatches onto the owning entity's RQ, and the remote
//! entity proxy.

mod client;
mod codec;
mod dispatch;
mod net;
mod proxy;
mod server;

pub use client::Client;
pub use codec::{read_frame, write_frame, ErrorPayload, Frame, Request, Response, MAX_FRAME};
pub use dispatch::{dispatch, dispatch_local, CoreDispatcher};
pub use net::PeerNet;
pub use proxy::RemoteEntity;
pub use server::{serve, RpcHandler};

/// Reserved error codes of the wire protocol.
pub mod code {
    pub const PARSE_ERROR: i32 = -32700;
    pub const INVALID_REQUEST: i32 = -32600;
    pub const METHOD_NOT_FOUND: i32 = -32601;
    pub const INVALID_PARAMS: i32 = -32602;
    pub const INTERNAL_ERROR: i32 = -32603;
    /// Implementation-defined server errors occupy this range.
    pub const SERVER_ERROR_MIN: i32 = -32099;
    pub const SERVER_ERROR_MAX: i32 = -32000;
}

#[derive(Debug, thiserror::Error)]
pub enum RpcError {
    #[error("Request Timed Out")]
    Timeout,
    #[error("remote error {code}: {message}")]
    Remote {
        code: i32,
        message: String,
        data: Option<serde_json::Value>,
    },
    #[error("frame of {0} bytes exceeds the maximum")]
    FrameTooLarge(usize),
    #[error("connection to peer closed")]
    ConnectionClosed,
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("malformed frame")]
    Codec(#[from] serde_json::Error),
    #[error(transparent)]
    Config(#[from] config::ConfigError),
}

impl From<ErrorPayload> for RpcError {
    fn from(payload: ErrorPayload) -> Self {
        RpcError::Remote {
            code: payload.code,
            message: payload.message,
            data: payload.data,
        }
    }
}
