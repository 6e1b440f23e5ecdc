//! Publication state: the advertised topic, its compiled schema, the
//! attached subscriber connections, and the latched payload cache.
//!
//! `publish` encodes a message once and fans the pre-framed bytes out to
//! every attached subscriber; per-subscriber delivery is independent, so
//! one slow or dead peer cannot stall the rest.

use crate::error::NodeError;
use crate::msg::{MessageSchema, MessageValue};
use crate::subscriber_link::SubscriberConnection;
use bytes::Bytes;
use parking_lot::Mutex;
use roslink_protocol::{encode_frame, ConnectionHeader};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Transport kinds a latched payload is cached for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportKind {
    Tcpros,
}

/// Handle to one advertised topic. Cheap to clone.
#[derive(Clone)]
pub struct Publication {
    inner: Arc<PublicationInner>,
}

pub(crate) struct PublicationInner {
    topic: String,
    data_type: String,
    md5sum: String,
    latching: bool,
    caller_id: String,
    schema: Arc<dyn MessageSchema>,
    subscribers: Mutex<HashMap<u64, SubscriberConnection>>,
    latched: Mutex<HashMap<TransportKind, Bytes>>,
    closed: AtomicBool,
}

impl Publication {
    pub(crate) fn new(
        topic: impl Into<String>,
        data_type: impl Into<String>,
        md5sum: impl Into<String>,
        latching: bool,
        caller_id: impl Into<String>,
        schema: Arc<dyn MessageSchema>,
    ) -> Self {
        Self {
            inner: Arc::new(PublicationInner {
                topic: topic.into(),
                data_type: data_type.into(),
                md5sum: md5sum.into(),
                latching,
                caller_id: caller_id.into(),
                schema,
                subscribers: Mutex::new(HashMap::new()),
                latched: Mutex::new(HashMap::new()),
                closed: AtomicBool::new(false),
            }),
        }
    }

    pub fn topic(&self) -> &str {
        &self.inner.topic
    }

    pub fn data_type(&self) -> &str {
        &self.inner.data_type
    }

    pub fn md5sum(&self) -> &str {
        &self.inner.md5sum
    }

    pub fn latching(&self) -> bool {
        self.inner.latching
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.subscribers.lock().len()
    }

    /// Snapshot of the attached subscriber connections.
    pub fn subscribers(&self) -> Vec<SubscriberConnection> {
        self.inner.subscribers.lock().values().cloned().collect()
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    pub(crate) fn inner_weak(&self) -> std::sync::Weak<PublicationInner> {
        Arc::downgrade(&self.inner)
    }

    /// The six-field header written back to an accepted subscriber.
    pub(crate) fn response_header(&self) -> ConnectionHeader {
        ConnectionHeader::new()
            .with_field("callerid", &self.inner.caller_id)
            .with_field("latching", if self.inner.latching { "1" } else { "0" })
            .with_field("md5sum", &self.inner.md5sum)
            .with_field("message_definition", self.inner.schema.canonical_text())
            .with_field("topic", &self.inner.topic)
            .with_field("type", &self.inner.data_type)
    }

    /// The pre-framed latched payload for `kind`, if one is cached.
    pub(crate) fn latched_frame(&self, kind: TransportKind) -> Option<Bytes> {
        self.inner.latched.lock().get(&kind).cloned()
    }

    /// Attaches an accepted subscriber. Refused once closed.
    pub(crate) fn add_subscriber(&self, connection: SubscriberConnection) -> bool {
        if self.is_closed() {
            connection.close();
            return false;
        }
        self.inner
            .subscribers
            .lock()
            .insert(connection.connection_id(), connection);
        true
    }

    /// Encodes `msg` once and offers the framed bytes to every attached
    /// subscriber. A failed or slow peer affects only its own delivery.
    pub async fn publish(&self, msg: &MessageValue) -> Result<(), NodeError> {
        if self.is_closed() {
            return Err(NodeError::NotAdvertised(self.inner.topic.clone()));
        }

        let body = self.inner.schema.write(msg)?;
        let frame = encode_frame(&body).freeze();

        if self.inner.latching {
            self.inner
                .latched
                .lock()
                .insert(TransportKind::Tcpros, frame.clone());
        }

        let subscribers = self.subscribers();
        let mut dead = Vec::new();
        for subscriber in &subscribers {
            if !subscriber.send_frame(frame.clone()) {
                dead.push(subscriber.connection_id());
            }
        }
        for id in dead {
            self.inner.remove_subscriber(id);
        }
        Ok(())
    }

    /// Closes the publication and every attached subscriber connection.
    pub(crate) fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let subscribers: Vec<_> = {
            let mut map = self.inner.subscribers.lock();
            map.drain().map(|(_, c)| c).collect()
        };
        for subscriber in subscribers {
            subscriber.close();
        }
        tracing::debug!("publication of {} closed", self.inner.topic);
    }

    /// Drops every attached subscriber connection without closing the
    /// publication itself (peers will reconnect).
    #[cfg(test)]
    pub(crate) fn disconnect_subscribers(&self) {
        let subscribers: Vec<_> = {
            let mut map = self.inner.subscribers.lock();
            map.drain().map(|(_, c)| c).collect()
        };
        for subscriber in subscribers {
            subscriber.close();
        }
    }
}

impl PublicationInner {
    pub(crate) fn remove_subscriber(&self, id: u64) {
        if let Some(connection) = self.subscribers.lock().remove(&id) {
            connection.close();
            tracing::debug!("subscriber {} detached from {}", id, self.topic);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{BoolSchema, BOOL_DEFINITION, BOOL_MD5};
    use serde_json::json;

    fn publication(latching: bool) -> Publication {
        Publication::new(
            "/flag",
            "std_msgs/Bool",
            BOOL_MD5,
            latching,
            "/talker",
            Arc::new(BoolSchema),
        )
    }

    #[test]
    fn test_response_header_has_exactly_six_keys() {
        let header = publication(true).response_header();
        assert_eq!(header.len(), 6);
        assert_eq!(header.get("callerid"), Some("/talker"));
        assert_eq!(header.get("latching"), Some("1"));
        assert_eq!(header.get("md5sum"), Some(BOOL_MD5));
        assert_eq!(header.get("message_definition"), Some(BOOL_DEFINITION));
        assert_eq!(header.get("topic"), Some("/flag"));
        assert_eq!(header.get("type"), Some("std_msgs/Bool"));
    }

    #[tokio::test]
    async fn test_latched_payload_replaced_on_publish() {
        let publication = publication(true);
        assert!(publication.latched_frame(TransportKind::Tcpros).is_none());

        publication.publish(&json!({"data": true})).await.unwrap();
        let first = publication.latched_frame(TransportKind::Tcpros).unwrap();
        assert_eq!(&first[..], &[1, 0, 0, 0, 1]);

        publication.publish(&json!({"data": false})).await.unwrap();
        let second = publication.latched_frame(TransportKind::Tcpros).unwrap();
        assert_eq!(&second[..], &[1, 0, 0, 0, 0]);
    }

    #[tokio::test]
    async fn test_unlatched_publication_caches_nothing() {
        let publication = publication(false);
        publication.publish(&json!({"data": true})).await.unwrap();
        assert!(publication.latched_frame(TransportKind::Tcpros).is_none());
    }

    #[tokio::test]
    async fn test_publish_after_close_fails() {
        let publication = publication(false);
        publication.close();
        assert!(matches!(
            publication.publish(&json!({"data": true})).await,
            Err(NodeError::NotAdvertised(_))
        ));
    }

    #[tokio::test]
    async fn test_encode_error_surfaces() {
        let publication = publication(false);
        assert!(matches!(
            publication.publish(&json!({"wrong": 1})).await,
            Err(NodeError::Message(_))
        ));
    }
}
