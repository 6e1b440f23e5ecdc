//! Node error types.

use crate::msg::MessageError;
use crate::rpc::RpcError;
use roslink_protocol::ProtocolError;
use thiserror::Error;

/// Errors surfaced to callers of the node API.
///
/// Peer-level faults (socket drops, decode failures on a single frame)
/// are not represented here; those are emitted as events on the owning
/// subscription or publication and the runtime heals itself.
#[derive(Debug, Error)]
pub enum NodeError {
    #[error("node has been shut down")]
    Shutdown,

    #[error("topic {0} is not advertised")]
    NotAdvertised(String),

    #[error("topic {0} is not subscribed")]
    NotSubscribed(String),

    #[error("invalid name: {0:?} (must be an absolute /-prefixed path)")]
    InvalidName(String),

    #[error("no TCP listener bound; cannot accept subscribers")]
    NoListener,

    #[error("invalid peer URL: {0}")]
    InvalidPeerUrl(String),

    #[error("ROS_MASTER_URI is not set")]
    MasterUriUnset,

    #[error("RPC error: {0}")]
    Rpc(#[from] RpcError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("message error: {0}")]
    Message(#[from] MessageError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
