//! # roslink-protocol
//!
//! Wire protocol implementation for TCPROS, the length-prefixed TCP
//! transport used between ROS 1 nodes.
//!
//! This crate provides:
//! - Length-prefixed binary framing (`u32le length || payload`)
//! - The connection-header codec (`key=value` fields, each length-prefixed)
//! - Protocol constants and error types

pub mod error;
pub mod frame;
pub mod header;

pub use error::ProtocolError;
pub use frame::{encode_frame, FrameDecoder, FRAME_PREFIX_SIZE};
pub use header::ConnectionHeader;

/// Maximum frame payload size (1,000,000,000 bytes).
///
/// A declared length above this poisons the stream; the peer is either
/// malicious or desynchronized and the socket must be closed.
pub const MAX_PAYLOAD_SIZE: u32 = 1_000_000_000;

/// Transport name exchanged in protocol negotiation tuples.
pub const TCPROS: &str = "TCPROS";
