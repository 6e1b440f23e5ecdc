//! # roslink-node
//!
//! A standalone ROS 1 node runtime. A node registers the topics it
//! publishes and subscribes with a central master, negotiates direct
//! TCPROS connections with peer nodes, and streams typed messages over
//! them, reconnecting with truncated exponential backoff when the master
//! or a peer goes away.
//!
//! The XML-RPC transport, message serialization, and platform discovery
//! are injected collaborators: see [`rpc`], [`msg`], and [`transport`]
//! for the seams, and [`node::Node`] for the runtime that drives them.

pub mod backoff;
pub mod cancel;
pub mod error;
pub mod follower;
pub mod hostname;
pub mod master;
pub mod msg;
pub mod node;
pub mod publication;
pub mod publisher_link;
pub mod rpc;
pub mod stats;
pub mod subscriber_link;
pub mod subscription;
pub mod transport;

#[cfg(test)]
pub(crate) mod testing;

pub use error::NodeError;
pub use node::{AdvertiseOptions, Node, NodeOptions, NodeTransports, SubscribeOptions};
pub use publication::Publication;
pub use subscription::Subscription;

/// Wildcard accepted in place of a concrete type name or MD5 checksum
/// during connection handshakes.
pub const ANY: &str = "*";
