//! Protocol error types.

use thiserror::Error;

/// Errors that can occur while framing or parsing TCPROS traffic.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: u32, max: u32 },

    #[error("stream poisoned by an earlier framing error")]
    Poisoned,

    #[error("missing required header field: {0}")]
    MissingField(&'static str),
}
