//! RPC seams and the `(code, statusMessage, value)` reply convention.
//!
//! The XML-RPC transport itself is an external collaborator: the runtime
//! only needs request/response calls against the master and against peer
//! nodes, and an inbound dispatch surface for the calls peers make on us.
//! Values travel as [`serde_json::Value`]; XML-RPC's scalar, array, and
//! struct model embeds losslessly.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;

/// RPC value model.
pub type RpcValue = Value;

/// Reply code for success in the ROS triple convention.
pub const CODE_SUCCESS: i64 = 1;

/// Reply code for a request that was understood but failed.
pub const CODE_FAILURE: i64 = 0;

/// Reply code for a malformed or invalid request.
pub const CODE_ERROR: i64 = -1;

#[derive(Debug, Error)]
pub enum RpcError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("malformed reply: {0}")]
    Malformed(String),

    #[error("{message} (code {code})")]
    Fault { code: i64, message: String },
}

/// Outbound request/response client for one remote endpoint.
#[async_trait]
pub trait RpcClient: Send + Sync {
    async fn call(&self, method: &str, params: Vec<RpcValue>) -> Result<RpcValue, RpcError>;
}

/// Creates clients for peer endpoints discovered at runtime.
pub trait RpcClientFactory: Send + Sync {
    fn connect(&self, url: &str) -> Result<Arc<dyn RpcClient>, RpcError>;
}

/// Per-request context handed to the inbound dispatch.
#[derive(Debug, Clone, Default)]
pub struct RpcContext {
    /// Local address of the HTTP socket the request arrived on.
    pub local_addr: Option<SocketAddr>,
    /// Remote address of the caller.
    pub remote_addr: Option<SocketAddr>,
}

/// Inbound call handler. Always answers with a reply triple; transport
/// faults are the transport's problem, not the handler's.
#[async_trait]
pub trait RpcDispatch: Send + Sync {
    async fn dispatch(&self, method: &str, params: &[RpcValue], ctx: &RpcContext) -> RpcValue;
}

/// Inbound server transport: binds a listener on the advertised hostname
/// and routes requests into a dispatch.
#[async_trait]
pub trait RpcServerTransport: Send + Sync {
    async fn bind(
        &self,
        hostname: &str,
        dispatch: Arc<dyn RpcDispatch>,
    ) -> Result<Box<dyn BoundRpcServer>, RpcError>;
}

/// A bound inbound server.
#[async_trait]
pub trait BoundRpcServer: Send + Sync {
    /// The URL peers use to reach this server.
    fn url(&self) -> String;

    async fn close(&self);
}

/// Builds a success triple.
pub fn reply_ok(message: &str, value: RpcValue) -> RpcValue {
    json!([CODE_SUCCESS, message, value])
}

/// Builds a failure triple (request understood, operation failed).
pub fn reply_failure(message: &str) -> RpcValue {
    json!([CODE_FAILURE, message, Value::Array(Vec::new())])
}

/// Builds an error triple (malformed request).
pub fn reply_error(message: &str) -> RpcValue {
    json!([CODE_ERROR, message, 0])
}

/// Splits a reply triple into `(code, statusMessage, value)`.
pub fn parse_reply(reply: &RpcValue) -> Result<(i64, String, RpcValue), RpcError> {
    let items = reply
        .as_array()
        .ok_or_else(|| RpcError::Malformed(format!("expected reply triple, got {reply}")))?;
    if items.len() != 3 {
        return Err(RpcError::Malformed(format!(
            "expected 3 reply elements, got {}",
            items.len()
        )));
    }
    let code = items[0]
        .as_i64()
        .ok_or_else(|| RpcError::Malformed("reply code is not an integer".to_string()))?;
    let message = items[1].as_str().unwrap_or_default().to_string();
    Ok((code, message, items[2].clone()))
}

/// Parses a reply triple and requires a success code, returning the value.
pub fn expect_success(reply: &RpcValue) -> Result<RpcValue, RpcError> {
    let (code, message, value) = parse_reply(reply)?;
    if code != CODE_SUCCESS {
        return Err(RpcError::Fault { code, message });
    }
    Ok(value)
}
