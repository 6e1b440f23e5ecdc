//! Connection-header codec.
//!
//! A TCPROS connection header is a flat list of `key=value` strings, each
//! encoded as `u32le(byte_length) || utf8(string)` and concatenated. The
//! whole list travels as the payload of one frame (see [`crate::frame`]).
//!
//! Parsing is deliberately tolerant of malformed peers: a declared field
//! length is clamped to the bytes actually remaining, an entry without
//! `=` becomes a key with an empty value, and non-UTF-8 bytes are
//! replaced rather than rejected.

use crate::error::ProtocolError;
use bytes::{BufMut, BytesMut};
use std::collections::BTreeMap;

/// An ordered set of `key=value` header fields.
///
/// Fields serialize in sorted key order, so equal headers produce equal
/// bytes. Unknown keys are preserved; required-key checks are the
/// caller's business via [`require`](Self::require).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectionHeader {
    fields: BTreeMap<String, String>,
}

impl ConnectionHeader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses a header from a frame payload.
    pub fn parse(payload: &[u8]) -> Self {
        let mut fields = BTreeMap::new();
        let mut rest = payload;

        while rest.len() >= 4 {
            let declared = u32::from_le_bytes([rest[0], rest[1], rest[2], rest[3]]) as usize;
            rest = &rest[4..];

            // Clamp to what the peer actually sent.
            let take = declared.min(rest.len());
            let entry = String::from_utf8_lossy(&rest[..take]);
            rest = &rest[take..];

            match entry.split_once('=') {
                Some((key, value)) => {
                    fields.insert(key.to_string(), value.to_string());
                }
                None => {
                    if !entry.is_empty() {
                        fields.insert(entry.to_string(), String::new());
                    }
                }
            }
        }

        Self { fields }
    }

    /// Serializes the fields (without the outer frame prefix).
    pub fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::new();
        for (key, value) in &self.fields {
            let entry_len = key.len() + 1 + value.len();
            buf.put_u32_le(entry_len as u32);
            buf.put_slice(key.as_bytes());
            buf.put_u8(b'=');
            buf.put_slice(value.as_bytes());
        }
        buf
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.fields.insert(key.into(), value.into());
    }

    /// Builder-style insert.
    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.fields.get(key).map(|s| s.as_str())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.fields.contains_key(key)
    }

    /// Returns the value for `key`, or a [`ProtocolError::MissingField`].
    pub fn require(&self, key: &'static str) -> Result<&str, ProtocolError> {
        self.get(key).ok_or(ProtocolError::MissingField(key))
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

impl FromIterator<(String, String)> for ConnectionHeader {
    fn from_iter<T: IntoIterator<Item = (String, String)>>(iter: T) -> Self {
        Self {
            fields: iter.into_iter().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> ConnectionHeader {
        ConnectionHeader::new()
            .with_field("topic", "/chatter")
            .with_field("md5sum", "992ce8a1687cec8c8bd883ec73ca41d1")
            .with_field("callerid", "/talker")
            .with_field("type", "std_msgs/String")
            .with_field("tcp_nodelay", "0")
    }

    #[test]
    fn test_roundtrip() {
        let header = sample();
        let parsed = ConnectionHeader::parse(&header.encode());
        assert_eq!(parsed, header);
    }

    #[test]
    fn test_deterministic_sorted_encoding() {
        let a = ConnectionHeader::new()
            .with_field("b", "2")
            .with_field("a", "1");
        let b = ConnectionHeader::new()
            .with_field("a", "1")
            .with_field("b", "2");
        assert_eq!(a.encode(), b.encode());

        // Sorted order: "a=1" precedes "b=2".
        let bytes = a.encode();
        assert_eq!(&bytes[4..7], b"a=1");
    }

    #[test]
    fn test_missing_equals_becomes_bare_key() {
        let mut buf = BytesMut::new();
        buf.put_u32_le(9);
        buf.put_slice(b"keyonly_x");

        let parsed = ConnectionHeader::parse(&buf);
        assert_eq!(parsed.get("keyonly_x"), Some(""));
    }

    #[test]
    fn test_declared_length_clamped_to_remaining() {
        // Entry claims 100 bytes but only 7 follow.
        let mut buf = BytesMut::new();
        buf.put_u32_le(100);
        buf.put_slice(b"topic=/");

        let parsed = ConnectionHeader::parse(&buf);
        assert_eq!(parsed.get("topic"), Some("/"));
    }

    #[test]
    fn test_trailing_garbage_shorter_than_prefix_ignored() {
        let mut buf = sample().encode();
        buf.put_slice(&[1, 2]);
        let parsed = ConnectionHeader::parse(&buf);
        assert_eq!(parsed, sample());
    }

    #[test]
    fn test_empty_value_preserved() {
        let header = ConnectionHeader::new().with_field("message_definition", "");
        let parsed = ConnectionHeader::parse(&header.encode());
        assert_eq!(parsed.get("message_definition"), Some(""));
    }

    #[test]
    fn test_require() {
        let header = sample();
        assert_eq!(header.require("topic").unwrap(), "/chatter");
        assert!(matches!(
            header.require("latching"),
            Err(ProtocolError::MissingField("latching"))
        ));
    }
}
