//! The follower RPC surface: the nine methods other nodes and the
//! master invoke on us.
//!
//! Every method answers a `(code, statusMessage, value)` triple.
//! Argument arity and types are validated before any side effect; a
//! malformed request gets an error triple, never a transport fault.

use crate::node::NodeInner;
use crate::rpc::{reply_error, reply_failure, reply_ok, RpcContext, RpcDispatch, RpcValue};
use async_trait::async_trait;
use parking_lot::Mutex;
use roslink_protocol::TCPROS;
use serde_json::{json, Value};
use std::sync::{Arc, Weak};

/// Dispatch for the follower server. Holds the node weakly: the server
/// transport may outlive the runtime briefly during shutdown.
pub(crate) struct FollowerApi {
    node: Mutex<Weak<NodeInner>>,
}

impl FollowerApi {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            node: Mutex::new(Weak::new()),
        })
    }

    pub(crate) fn attach(&self, node: Weak<NodeInner>) {
        *self.node.lock() = node;
    }

    fn node(&self) -> Option<Arc<NodeInner>> {
        self.node.lock().upgrade()
    }
}

#[async_trait]
impl RpcDispatch for FollowerApi {
    async fn dispatch(&self, method: &str, params: &[RpcValue], ctx: &RpcContext) -> RpcValue {
        let Some(node) = self.node() else {
            return reply_error("node is shutting down");
        };

        // Every method carries the caller id first.
        let Some(caller) = params.first().and_then(Value::as_str) else {
            return reply_error("caller id must be a string");
        };

        match method {
            "getBusStats" => {
                if params.len() != 1 {
                    return reply_error("getBusStats takes no arguments");
                }
                reply_ok("bus stats", node.bus_stats())
            }
            "getBusInfo" => {
                if params.len() != 1 {
                    return reply_error("getBusInfo takes no arguments");
                }
                reply_ok("bus info", json!(""))
            }
            "shutdown" => {
                if params.len() > 2 {
                    return reply_error("shutdown takes an optional message");
                }
                let reason = params
                    .get(1)
                    .and_then(Value::as_str)
                    .unwrap_or("(no reason given)");
                tracing::info!("shutdown requested by {}: {}", caller, reason);
                tokio::spawn(node.shutdown());
                reply_ok("shutting down", json!(0))
            }
            "getPid" => {
                if params.len() != 1 {
                    return reply_error("getPid takes no arguments");
                }
                reply_ok("pid", json!(node.pid))
            }
            "getSubscriptions" => {
                if params.len() != 1 {
                    return reply_error("getSubscriptions takes no arguments");
                }
                reply_ok("subscriptions", node.subscriptions_list())
            }
            "getPublications" => {
                if params.len() != 1 {
                    return reply_error("getPublications takes no arguments");
                }
                reply_ok("publications", node.publications_list())
            }
            "paramUpdate" => {
                if params.len() != 3 {
                    return reply_error("paramUpdate takes a key and a value");
                }
                let (Some(key), Some(value)) =
                    (params.get(1).and_then(Value::as_str), params.get(2))
                else {
                    return reply_error("paramUpdate takes a key and a value");
                };
                node.apply_param_update(key, value.clone());
                reply_ok("parameter updated", json!(0))
            }
            "publisherUpdate" => {
                if params.len() != 3 {
                    return reply_error("publisherUpdate takes a topic and a publisher list");
                }
                let (Some(topic), Some(publishers)) = (
                    params.get(1).and_then(Value::as_str),
                    params.get(2).and_then(Value::as_array),
                ) else {
                    return reply_error("publisherUpdate takes a topic and a publisher list");
                };
                let mut urls = Vec::with_capacity(publishers.len());
                for publisher in publishers {
                    match publisher.as_str() {
                        Some(url) => urls.push(url.to_string()),
                        None => return reply_error("publisher list entries must be strings"),
                    }
                }
                tracing::debug!(
                    "publisherUpdate from {} for {}: {} publisher(s)",
                    caller,
                    topic,
                    urls.len()
                );
                node.handle_publisher_update(topic, urls);
                reply_ok("publisher list updated", json!(0))
            }
            "requestTopic" => {
                if params.len() != 3 {
                    return reply_error("requestTopic takes a topic and a protocol list");
                }
                let (Some(topic), Some(protocols)) = (
                    params.get(1).and_then(Value::as_str),
                    params.get(2).and_then(Value::as_array),
                ) else {
                    return reply_error("requestTopic takes a topic and a protocol list");
                };

                if !node.publications.contains_key(topic) {
                    return reply_failure(&format!("topic {topic} is not published here"));
                }

                let wants_tcpros = protocols.iter().any(|p| {
                    p.as_array()
                        .and_then(|entry| entry.first())
                        .and_then(Value::as_str)
                        == Some(TCPROS)
                });
                if !wants_tcpros {
                    return reply_failure("unsupported protocol");
                }

                let Some(listener) = node.listener.as_ref() else {
                    return reply_failure("cannot receive incoming connections");
                };

                // Reach us back on the same route the request came in on;
                // the port is the TCPROS listener's, not the RPC server's.
                let host = ctx
                    .local_addr
                    .map(|addr| addr.ip().to_string())
                    .unwrap_or_else(|| node.hostname.clone());
                reply_ok(
                    &format!("ready on {host}"),
                    json!([TCPROS, host, listener.local_port()]),
                )
            }
            other => reply_error(&format!("unknown method {other}")),
        }
    }
}
