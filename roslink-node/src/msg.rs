//! Message-codec seam.
//!
//! Turning a ROS message definition into a typed reader/writer is an
//! external collaborator. The runtime asks the codec for a schema by
//! data-type name and definition text; the schema carries the MD5
//! checksum and canonical text used during handshakes and knows how to
//! move between wire bytes and structured values.

use bytes::Bytes;
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;

/// Structured message value model.
pub type MessageValue = Value;

#[derive(Debug, Error)]
pub enum MessageError {
    #[error("failed to parse message definition: {0}")]
    Definition(String),

    #[error("failed to decode message: {0}")]
    Decode(String),

    #[error("failed to encode message: {0}")]
    Encode(String),
}

/// A compiled message definition for one data type.
pub trait MessageSchema: Send + Sync {
    /// Full data-type name, e.g. `std_msgs/Bool`.
    fn data_type(&self) -> &str;

    /// 32-lowercase-hex-digit checksum of the definition.
    fn md5sum(&self) -> &str;

    /// Canonical (re-stringified) definition text.
    fn canonical_text(&self) -> &str;

    /// Decodes one serialized message body.
    fn read(&self, bytes: &[u8]) -> Result<MessageValue, MessageError>;

    /// Encodes one message body.
    fn write(&self, value: &MessageValue) -> Result<Bytes, MessageError>;
}

impl std::fmt::Debug for dyn MessageSchema {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageSchema")
            .field("data_type", &self.data_type())
            .finish()
    }
}

/// Compiles message definitions into schemas.
pub trait MessageCodec: Send + Sync {
    fn schema(
        &self,
        data_type: &str,
        definition_text: &str,
    ) -> Result<Arc<dyn MessageSchema>, MessageError>;
}
