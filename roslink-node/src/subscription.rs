//! Subscription state and its event surface.
//!
//! A subscription owns the outbound connections to every publisher of
//! its topic. Connections push [`LinkEvent`]s into a per-subscription
//! channel; a pump task fans them out to the `header` / `message` /
//! `error` broadcast streams observers subscribe to.

use crate::cancel::{cancel_pair, CancelToken};
use crate::msg::{MessageSchema, MessageValue};
use crate::publisher_link::PublisherConnection;
use bytes::Bytes;
use parking_lot::Mutex;
use roslink_protocol::ConnectionHeader;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};

/// Capacity of the per-subscription event channel.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Capacity of each observer broadcast channel.
const BROADCAST_CAPACITY: usize = 1024;

/// Event pushed upward by a publisher connection.
#[derive(Debug, Clone)]
pub enum LinkEvent {
    Header {
        connection_id: u64,
        fields: ConnectionHeader,
        schema: Arc<dyn MessageSchema>,
    },
    Message {
        connection_id: u64,
        value: MessageValue,
        raw: Bytes,
    },
    Error {
        connection_id: u64,
        message: String,
    },
}

/// Peer header received on a connection, with the compiled schema.
#[derive(Debug, Clone)]
pub struct TopicHeader {
    pub connection_id: u64,
    pub fields: ConnectionHeader,
    pub schema: Arc<dyn MessageSchema>,
}

/// One decoded message, with the raw serialized body.
#[derive(Debug, Clone)]
pub struct TopicMessage {
    pub connection_id: u64,
    pub value: MessageValue,
    pub raw: Bytes,
}

/// A non-fatal fault observed on a connection.
#[derive(Debug, Clone)]
pub struct TopicError {
    pub connection_id: u64,
    pub message: String,
}

/// Handle to one topic subscription. Cheap to clone.
#[derive(Clone)]
pub struct Subscription {
    inner: Arc<SubscriptionInner>,
}

struct SubscriptionInner {
    topic: String,
    data_type: String,
    md5sum: String,
    tcp_nodelay: bool,
    connections: Mutex<HashMap<u64, PublisherConnection>>,
    event_tx: mpsc::Sender<LinkEvent>,
    headers_tx: broadcast::Sender<TopicHeader>,
    messages_tx: broadcast::Sender<TopicMessage>,
    errors_tx: broadcast::Sender<TopicError>,
    cancel: crate::cancel::CancelHandle,
    closed: AtomicBool,
}

impl Subscription {
    pub(crate) fn new(
        topic: impl Into<String>,
        data_type: impl Into<String>,
        md5sum: impl Into<String>,
        tcp_nodelay: bool,
    ) -> Self {
        let (cancel, token) = cancel_pair();
        let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let (headers_tx, _) = broadcast::channel(BROADCAST_CAPACITY);
        let (messages_tx, _) = broadcast::channel(BROADCAST_CAPACITY);
        let (errors_tx, _) = broadcast::channel(BROADCAST_CAPACITY);

        let inner = Arc::new(SubscriptionInner {
            topic: topic.into(),
            data_type: data_type.into(),
            md5sum: md5sum.into(),
            tcp_nodelay,
            connections: Mutex::new(HashMap::new()),
            event_tx,
            headers_tx: headers_tx.clone(),
            messages_tx: messages_tx.clone(),
            errors_tx: errors_tx.clone(),
            cancel,
            closed: AtomicBool::new(false),
        });

        tokio::spawn(pump_events(
            event_rx,
            headers_tx,
            messages_tx,
            errors_tx,
            token,
        ));

        Self { inner }
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

    pub fn tcp_nodelay(&self) -> bool {
        self.inner.tcp_nodelay
    }

    /// Stream of peer headers (one per completed handshake).
    pub fn headers(&self) -> broadcast::Receiver<TopicHeader> {
        self.inner.headers_tx.subscribe()
    }

    /// Stream of decoded messages from all connected publishers.
    pub fn messages(&self) -> broadcast::Receiver<TopicMessage> {
        self.inner.messages_tx.subscribe()
    }

    /// Stream of non-fatal connection faults.
    pub fn errors(&self) -> broadcast::Receiver<TopicError> {
        self.inner.errors_tx.subscribe()
    }

    pub fn connection_count(&self) -> usize {
        self.inner.connections.lock().len()
    }

    /// Snapshot of the current publisher connections.
    pub fn connections(&self) -> Vec<PublisherConnection> {
        self.inner.connections.lock().values().cloned().collect()
    }

    /// Follower URLs of the publishers currently connected or connecting.
    pub fn publisher_urls(&self) -> Vec<String> {
        self.inner
            .connections
            .lock()
            .values()
            .map(|c| c.publisher_url().to_string())
            .collect()
    }

    pub(crate) fn is_live(&self) -> bool {
        !self.inner.closed.load(Ordering::SeqCst)
    }

    pub(crate) fn token(&self) -> CancelToken {
        self.inner.cancel.token()
    }

    pub(crate) fn event_sender(&self) -> mpsc::Sender<LinkEvent> {
        self.inner.event_tx.clone()
    }

    /// Registers a started connection. Refused after close so a racing
    /// `requestTopic` cannot resurrect a torn-down subscription.
    pub(crate) fn add_connection(&self, connection: PublisherConnection) -> bool {
        if !self.is_live() {
            connection.close();
            return false;
        }
        let mut connections = self.inner.connections.lock();
        if connections
            .values()
            .any(|c| c.publisher_url() == connection.publisher_url())
        {
            connection.close();
            return false;
        }
        connections.insert(connection.connection_id(), connection);
        true
    }

    pub(crate) fn has_publisher(&self, url: &str) -> bool {
        self.inner
            .connections
            .lock()
            .values()
            .any(|c| c.publisher_url() == url)
    }

    /// Closes and removes the connection to `url`, if any.
    pub(crate) fn remove_publisher(&self, url: &str) -> bool {
        let mut connections = self.inner.connections.lock();
        let id = connections
            .iter()
            .find(|(_, c)| c.publisher_url() == url)
            .map(|(id, _)| *id);
        match id {
            Some(id) => {
                if let Some(connection) = connections.remove(&id) {
                    connection.close();
                }
                true
            }
            None => false,
        }
    }

    /// Tears down the subscription: cancels the registration retry and
    /// closes every publisher connection.
    pub(crate) fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.cancel.cancel();
        let connections: Vec<_> = {
            let mut map = self.inner.connections.lock();
            map.drain().map(|(_, c)| c).collect()
        };
        for connection in connections {
            connection.close();
        }
        tracing::debug!("subscription to {} closed", self.inner.topic);
    }
}

async fn pump_events(
    mut rx: mpsc::Receiver<LinkEvent>,
    headers_tx: broadcast::Sender<TopicHeader>,
    messages_tx: broadcast::Sender<TopicMessage>,
    errors_tx: broadcast::Sender<TopicError>,
    token: CancelToken,
) {
    loop {
        let event = tokio::select! {
            event = rx.recv() => match event {
                Some(event) => event,
                None => break,
            },
            _ = token.cancelled() => break,
        };

        // Send errors only mean "no observers"; that is fine.
        match event {
            LinkEvent::Header {
                connection_id,
                fields,
                schema,
            } => {
                let _ = headers_tx.send(TopicHeader {
                    connection_id,
                    fields,
                    schema,
                });
            }
            LinkEvent::Message {
                connection_id,
                value,
                raw,
            } => {
                let _ = messages_tx.send(TopicMessage {
                    connection_id,
                    value,
                    raw,
                });
            }
            LinkEvent::Error {
                connection_id,
                message,
            } => {
                let _ = errors_tx.send(TopicError {
                    connection_id,
                    message,
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct NoopSchema;

    impl MessageSchema for NoopSchema {
        fn data_type(&self) -> &str {
            "test_msgs/Noop"
        }
        fn md5sum(&self) -> &str {
            "d41d8cd98f00b204e9800998ecf8427e"
        }
        fn canonical_text(&self) -> &str {
            ""
        }
        fn read(&self, _bytes: &[u8]) -> Result<MessageValue, crate::msg::MessageError> {
            Ok(json!({}))
        }
        fn write(&self, _value: &MessageValue) -> Result<Bytes, crate::msg::MessageError> {
            Ok(Bytes::new())
        }
    }

    #[tokio::test]
    async fn test_events_fan_out_to_observers() {
        let sub = Subscription::new("/t", "test_msgs/Noop", "*", false);
        let mut headers = sub.headers();
        let mut messages = sub.messages();
        let mut errors = sub.errors();

        let tx = sub.event_sender();
        tx.send(LinkEvent::Header {
            connection_id: 7,
            fields: ConnectionHeader::new().with_field("topic", "/t"),
            schema: Arc::new(NoopSchema),
        })
        .await
        .unwrap();
        tx.send(LinkEvent::Message {
            connection_id: 7,
            value: json!({"data": 1}),
            raw: Bytes::from_static(&[1]),
        })
        .await
        .unwrap();
        tx.send(LinkEvent::Error {
            connection_id: 7,
            message: "decode failed".to_string(),
        })
        .await
        .unwrap();

        let header = headers.recv().await.unwrap();
        assert_eq!(header.connection_id, 7);
        assert_eq!(header.fields.get("topic"), Some("/t"));

        let message = messages.recv().await.unwrap();
        assert_eq!(message.value, json!({"data": 1}));
        assert_eq!(&message.raw[..], &[1]);

        let error = errors.recv().await.unwrap();
        assert_eq!(error.message, "decode failed");
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_marks_dead() {
        let sub = Subscription::new("/t", "test_msgs/Noop", "*", false);
        assert!(sub.is_live());
        sub.close();
        assert!(!sub.is_live());
        sub.close();
        assert_eq!(sub.connection_count(), 0);
    }
}
