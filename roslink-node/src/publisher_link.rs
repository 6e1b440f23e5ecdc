//! Outbound TCPROS connection: the subscriber side of one topic session
//! with a remote publisher.
//!
//! Lifecycle: connect, send the request header, receive the response
//! header, then stream message frames upward. Socket-level faults are
//! never fatal: the connection reports them as events and reconnects
//! with backoff until it is explicitly closed.

use crate::backoff::Backoff;
use crate::cancel::{cancel_pair, CancelHandle, CancelToken};
use crate::msg::{MessageCodec, MessageSchema};
use crate::stats::{ConnectionStats, StatsSnapshot};
use crate::subscription::LinkEvent;
use crate::transport::{Connector, IoStream};
use bytes::Bytes;
use parking_lot::Mutex;
use roslink_protocol::{encode_frame, ConnectionHeader, FrameDecoder};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;

/// Socket read buffer size (8 KiB).
const READ_BUFFER_SIZE: usize = 8192;

/// Handle to one outbound publisher connection. Cheap to clone.
#[derive(Clone)]
pub struct PublisherConnection {
    inner: Arc<Inner>,
}

struct Inner {
    id: u64,
    topic: String,
    publisher_url: String,
    host: String,
    port: u16,
    request_header: ConnectionHeader,
    request_frame: Bytes,
    nodelay: bool,
    connector: Arc<dyn Connector>,
    codec: Arc<dyn MessageCodec>,
    events: mpsc::Sender<LinkEvent>,
    stats: ConnectionStats,
    backoff: Backoff,
    connected: AtomicBool,
    cancel: CancelHandle,
    remote_header: Mutex<Option<ConnectionHeader>>,
    endpoints: Mutex<Option<(Option<SocketAddr>, Option<SocketAddr>)>>,
}

/// Why a connected session ended.
enum SessionEnd {
    Cancelled,
    Disconnected(String),
}

impl PublisherConnection {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        id: u64,
        topic: impl Into<String>,
        publisher_url: impl Into<String>,
        host: impl Into<String>,
        port: u16,
        request_header: ConnectionHeader,
        connector: Arc<dyn Connector>,
        codec: Arc<dyn MessageCodec>,
        events: mpsc::Sender<LinkEvent>,
    ) -> Self {
        let request_frame = encode_frame(&request_header.encode()).freeze();
        let nodelay = request_header.get("tcp_nodelay") == Some("1");
        let (cancel, _) = cancel_pair();

        Self {
            inner: Arc::new(Inner {
                id,
                topic: topic.into(),
                publisher_url: publisher_url.into(),
                host: host.into(),
                port,
                request_header,
                request_frame,
                nodelay,
                connector,
                codec,
                events,
                stats: ConnectionStats::new(),
                backoff: Backoff::default(),
                connected: AtomicBool::new(false),
                cancel,
                remote_header: Mutex::new(None),
                endpoints: Mutex::new(None),
            }),
        }
    }

    /// Launches the connect/handshake/stream loop.
    pub(crate) fn start(&self) {
        let inner = self.inner.clone();
        let token = self.inner.cancel.token();
        tokio::spawn(run(inner, token));
    }

    /// Closes the connection permanently; it will not reconnect.
    pub fn close(&self) {
        self.inner.cancel.cancel();
        self.inner.connected.store(false, Ordering::SeqCst);
    }

    pub fn connection_id(&self) -> u64 {
        self.inner.id
    }

    pub fn topic(&self) -> &str {
        &self.inner.topic
    }

    /// Follower URL of the publisher this connection was negotiated with.
    pub fn publisher_url(&self) -> &str {
        &self.inner.publisher_url
    }

    pub fn connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.inner.stats.snapshot_outbound()
    }

    /// The request header sent on every (re)connect.
    pub fn request_header(&self) -> &ConnectionHeader {
        &self.inner.request_header
    }

    /// The most recent response header from the publisher, if any.
    pub fn header(&self) -> Option<ConnectionHeader> {
        self.inner.remote_header.lock().clone()
    }

    /// Human-readable description of the session endpoints.
    pub fn transport_info(&self) -> String {
        let local = self
            .inner
            .endpoints
            .lock()
            .as_ref()
            .and_then(|(local, _)| *local)
            .map(|a| a.port())
            .unwrap_or(0);
        format!(
            "TCPROS connection on port {} to [{}:{} on topic {}]",
            local, self.inner.host, self.inner.port, self.inner.topic
        )
    }
}

async fn run(inner: Arc<Inner>, token: CancelToken) {
    let mut retries: u32 = 0;

    loop {
        if token.is_cancelled() {
            break;
        }

        let connect = tokio::select! {
            result = inner.connector.connect(&inner.host, inner.port) => result,
            _ = token.cancelled() => break,
        };

        let mut stream = match connect {
            Ok(stream) => stream,
            Err(e) => {
                inner
                    .emit_error(format!(
                        "connect to {}:{} failed: {e}",
                        inner.host, inner.port
                    ))
                    .await;
                retries += 1;
                if !sleep_backoff(&inner.backoff, retries, &token).await {
                    break;
                }
                continue;
            }
        };
        retries = 0;

        if inner.nodelay {
            let _ = stream.set_nodelay(true);
        }
        *inner.endpoints.lock() = Some((stream.local_addr(), stream.peer_addr()));

        if let Err(e) = stream.write_all(&inner.request_frame).await {
            inner.emit_error(format!("header write failed: {e}")).await;
            retries += 1;
            if !sleep_backoff(&inner.backoff, retries, &token).await {
                break;
            }
            continue;
        }
        inner.stats.add_bytes_sent(inner.request_frame.len() as u64);
        inner.connected.store(true, Ordering::SeqCst);
        tracing::debug!(
            "connected to publisher {}:{} for {}",
            inner.host,
            inner.port,
            inner.topic
        );

        let end = read_session(&inner, &mut stream, &token).await;
        inner.connected.store(false, Ordering::SeqCst);

        match end {
            SessionEnd::Cancelled => break,
            SessionEnd::Disconnected(reason) => {
                if token.is_cancelled() {
                    break;
                }
                tracing::debug!(
                    "lost publisher {}:{} for {}: {}",
                    inner.host,
                    inner.port,
                    inner.topic,
                    reason
                );
                inner.emit_error(reason).await;
                retries += 1;
                if !sleep_backoff(&inner.backoff, retries, &token).await {
                    break;
                }
            }
        }
    }

    inner.connected.store(false, Ordering::SeqCst);
}

async fn read_session(
    inner: &Arc<Inner>,
    stream: &mut Box<dyn IoStream>,
    token: &CancelToken,
) -> SessionEnd {
    let mut decoder = FrameDecoder::new();
    let mut buf = vec![0u8; READ_BUFFER_SIZE];
    let mut schema: Option<Arc<dyn MessageSchema>> = None;

    loop {
        let n = tokio::select! {
            result = stream.read(&mut buf) => match result {
                Ok(0) => return SessionEnd::Disconnected("connection closed by publisher".to_string()),
                Ok(n) => n,
                Err(e) => return SessionEnd::Disconnected(format!("read failed: {e}")),
            },
            _ = token.cancelled() => return SessionEnd::Cancelled,
        };
        inner.stats.add_bytes_received(n as u64);
        decoder.extend(&buf[..n]);

        loop {
            let frame = match decoder.decode() {
                Ok(Some(frame)) => frame,
                Ok(None) => break,
                Err(e) => return SessionEnd::Disconnected(format!("framing error: {e}")),
            };

            let Some(compiled) = schema.clone() else {
                // First frame back is the publisher's response header.
                let fields = ConnectionHeader::parse(&frame);
                let data_type = fields
                    .get("type")
                    .or_else(|| inner.request_header.get("type"))
                    .unwrap_or_default()
                    .to_string();
                let definition = fields.get("message_definition").unwrap_or_default();

                let compiled = match inner.codec.schema(&data_type, definition) {
                    Ok(compiled) => compiled,
                    Err(e) => {
                        return SessionEnd::Disconnected(format!(
                            "unusable publisher header: {e}"
                        ));
                    }
                };

                *inner.remote_header.lock() = Some(fields.clone());
                let _ = inner
                    .events
                    .send(LinkEvent::Header {
                        connection_id: inner.id,
                        fields,
                        schema: compiled.clone(),
                    })
                    .await;
                schema = Some(compiled);
                continue;
            };

            match compiled.read(&frame) {
                Ok(value) => {
                    inner.stats.add_message_received();
                    let _ = inner
                        .events
                        .send(LinkEvent::Message {
                            connection_id: inner.id,
                            value,
                            raw: frame,
                        })
                        .await;
                }
                Err(e) => {
                    // A bad body does not end the session; the next
                    // frame may be fine.
                    inner.emit_error(format!("message decode failed: {e}")).await;
                }
            }
        }
    }
}

async fn sleep_backoff(backoff: &Backoff, retries: u32, token: &CancelToken) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(backoff.delay(retries)) => true,
        _ = token.cancelled() => false,
    }
}

impl Inner {
    async fn emit_error(&self, message: String) {
        tracing::debug!("publisher connection {} error: {}", self.id, message);
        let _ = self
            .events
            .send(LinkEvent::Error {
                connection_id: self.id,
                message,
            })
            .await;
    }
}
