//! Inbound TCPROS connection: serves one accepted socket that expects to
//! receive messages from us on exactly one topic.
//!
//! The first frame from the peer is its request header; it is validated
//! against the publication table, answered with our response header (and
//! any latched payload), and the socket then only ever receives our
//! message frames. There is no retry on this side: any failure closes
//! the connection and the subscriber is expected to renegotiate.

use crate::cancel::{cancel_pair, CancelHandle, CancelToken};
use crate::publication::{Publication, PublicationInner, TransportKind};
use crate::stats::{ConnectionStats, StatsSnapshot};
use crate::transport::IoStream;
use bytes::Bytes;
use dashmap::DashMap;
use roslink_protocol::{encode_frame, ConnectionHeader, FrameDecoder};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

/// Outgoing frames queued per subscriber before overflow drops kick in.
const WRITE_QUEUE_CAPACITY: usize = 256;

/// Socket read buffer size (4 KiB; subscribers send almost nothing).
const READ_BUFFER_SIZE: usize = 4096;

/// Handle to one attached subscriber. Cheap to clone.
#[derive(Clone)]
pub struct SubscriberConnection {
    inner: Arc<Inner>,
}

struct Inner {
    id: u64,
    caller_id: String,
    topic: String,
    tx: mpsc::Sender<Bytes>,
    stats: Arc<ConnectionStats>,
    connected: AtomicBool,
    cancel: CancelHandle,
    local_addr: Option<SocketAddr>,
    peer_addr: Option<SocketAddr>,
}

impl SubscriberConnection {
    pub fn connection_id(&self) -> u64 {
        self.inner.id
    }

    /// The remote subscriber's caller id.
    pub fn caller_id(&self) -> &str {
        &self.inner.caller_id
    }

    pub fn topic(&self) -> &str {
        &self.inner.topic
    }

    pub fn connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.inner.stats.snapshot_inbound()
    }

    /// Human-readable description of the session endpoints.
    pub fn transport_info(&self) -> String {
        let local = self.inner.local_addr.map(|a| a.port()).unwrap_or(0);
        let peer = self
            .inner
            .peer_addr
            .map(|a| a.to_string())
            .unwrap_or_else(|| "unknown".to_string());
        format!(
            "TCPROS connection on port {} to [{} on topic {}]",
            local, peer, self.inner.topic
        )
    }

    /// Offers one pre-framed payload without blocking. Overflow drops the
    /// message for this subscriber only; `false` means the peer is gone.
    pub(crate) fn send_frame(&self, frame: Bytes) -> bool {
        match self.inner.tx.try_send(frame) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                self.inner.stats.add_drop();
                tracing::warn!(
                    "subscriber {} on {} is slow, dropping message",
                    self.inner.caller_id,
                    self.inner.topic
                );
                true
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }

    pub(crate) fn close(&self) {
        self.inner.cancel.cancel();
        self.inner.connected.store(false, Ordering::SeqCst);
    }
}

/// Serves one accepted socket: handshake, validation, response, then the
/// writer/reader task pair. Rejections close the socket silently.
pub(crate) async fn handle_inbound(
    mut stream: Box<dyn IoStream>,
    publications: Arc<DashMap<String, Publication>>,
    id: u64,
) {
    let stats = Arc::new(ConnectionStats::new());

    // First frame is the subscriber's request header.
    let request = match read_request_header(&mut stream, &stats).await {
        Some(request) => request,
        None => return,
    };

    let (topic, caller_id) = match validate(&request, &publications) {
        Ok(accepted) => accepted,
        Err(reason) => {
            tracing::warn!("rejecting subscriber handshake: {}", reason);
            return;
        }
    };
    let publication = match publications.get(&topic) {
        Some(entry) => entry.value().clone(),
        None => return,
    };

    let nodelay = request.get("tcp_nodelay") == Some("1");
    let _ = stream.set_nodelay(nodelay);
    let local_addr = stream.local_addr();
    let peer_addr = stream.peer_addr();

    let (read_half, mut write_half) = tokio::io::split(stream);

    // Respond, then immediately replay the latched payload if one exists.
    let response = encode_frame(&publication.response_header().encode());
    if let Err(e) = write_half.write_all(&response).await {
        tracing::warn!("subscriber handshake response failed: {}", e);
        return;
    }
    stats.add_bytes_sent(response.len() as u64);

    if let Some(latched) = publication.latched_frame(TransportKind::Tcpros) {
        if let Err(e) = write_half.write_all(&latched).await {
            tracing::warn!("latched replay to {} failed: {}", caller_id, e);
            return;
        }
        stats.add_bytes_sent(latched.len() as u64);
        stats.add_message_sent();
    }

    let (tx, rx) = mpsc::channel(WRITE_QUEUE_CAPACITY);
    let (cancel, token) = cancel_pair();
    let connection = SubscriberConnection {
        inner: Arc::new(Inner {
            id,
            caller_id: caller_id.clone(),
            topic: topic.clone(),
            tx,
            stats: stats.clone(),
            connected: AtomicBool::new(true),
            cancel,
            local_addr,
            peer_addr,
        }),
    };

    if !publication.add_subscriber(connection.clone()) {
        return;
    }
    tracing::info!("new subscriber {} on {}", caller_id, topic);

    let weak = publication.inner_weak();
    tokio::spawn(write_loop(
        write_half,
        rx,
        stats.clone(),
        weak.clone(),
        id,
        token.clone(),
    ));
    tokio::spawn(drain_loop(read_half, stats, weak, id, token));
}

async fn read_request_header(
    stream: &mut Box<dyn IoStream>,
    stats: &ConnectionStats,
) -> Option<ConnectionHeader> {
    let mut decoder = FrameDecoder::new();
    let mut buf = vec![0u8; READ_BUFFER_SIZE];

    loop {
        match decoder.decode() {
            Ok(Some(frame)) => return Some(ConnectionHeader::parse(&frame)),
            Ok(None) => {}
            Err(e) => {
                tracing::warn!("bad subscriber handshake framing: {}", e);
                return None;
            }
        }

        match stream.read(&mut buf).await {
            Ok(0) => return None,
            Ok(n) => {
                stats.add_bytes_received(n as u64);
                decoder.extend(&buf[..n]);
            }
            Err(e) => {
                tracing::debug!("subscriber handshake read failed: {}", e);
                return None;
            }
        }
    }
}

/// Checks the request header against the publication table. Returns the
/// accepted `(topic, caller_id)` or a rejection reason.
fn validate(
    request: &ConnectionHeader,
    publications: &DashMap<String, Publication>,
) -> Result<(String, String), String> {
    let topic = request
        .get("topic")
        .ok_or_else(|| "missing topic field".to_string())?;
    let caller_id = request
        .get("callerid")
        .ok_or_else(|| "missing callerid field".to_string())?;
    let data_type = request
        .get("type")
        .ok_or_else(|| "missing type field".to_string())?;

    let publication = publications
        .get(topic)
        .ok_or_else(|| format!("topic {topic} is not advertised here"))?;

    if data_type != crate::ANY
        && publication.data_type() != crate::ANY
        && data_type != publication.data_type()
    {
        return Err(format!(
            "type mismatch on {topic}: requested {data_type}, publishing {}",
            publication.data_type()
        ));
    }

    if let Some(md5sum) = request.get("md5sum") {
        if md5sum != crate::ANY
            && publication.md5sum() != crate::ANY
            && md5sum != publication.md5sum()
        {
            return Err(format!(
                "md5sum mismatch on {topic}: requested {md5sum}, publishing {}",
                publication.md5sum()
            ));
        }
    }

    Ok((topic.to_string(), caller_id.to_string()))
}

async fn write_loop(
    mut write_half: WriteHalf<Box<dyn IoStream>>,
    mut rx: mpsc::Receiver<Bytes>,
    stats: Arc<ConnectionStats>,
    publication: Weak<PublicationInner>,
    id: u64,
    token: CancelToken,
) {
    loop {
        let frame = tokio::select! {
            frame = rx.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
            _ = token.cancelled() => break,
        };

        if let Err(e) = write_half.write_all(&frame).await {
            tracing::debug!("write to subscriber {} failed: {}", id, e);
            break;
        }
        stats.add_bytes_sent(frame.len() as u64);
        stats.add_message_sent();
    }

    let _ = write_half.shutdown().await;
    if let Some(publication) = publication.upgrade() {
        publication.remove_subscriber(id);
    }
}

/// Subscribers send no message traffic after the handshake; anything
/// that arrives is counted and discarded, and EOF tears the link down.
async fn drain_loop(
    mut read_half: ReadHalf<Box<dyn IoStream>>,
    stats: Arc<ConnectionStats>,
    publication: Weak<PublicationInner>,
    id: u64,
    token: CancelToken,
) {
    let mut buf = vec![0u8; READ_BUFFER_SIZE];
    loop {
        tokio::select! {
            result = read_half.read(&mut buf) => match result {
                Ok(0) | Err(_) => break,
                Ok(n) => stats.add_bytes_received(n as u64),
            },
            _ = token.cancelled() => return,
        }
    }

    if let Some(publication) = publication.upgrade() {
        publication.remove_subscriber(id);
    }
}
