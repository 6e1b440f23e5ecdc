//! Shared test fixtures: an in-process master, a loopback follower-RPC
//! transport, a fixed `bool data` message schema, and in-memory duplex
//! streams.

use crate::msg::{MessageCodec, MessageError, MessageSchema, MessageValue};
use crate::rpc::{
    reply_ok, BoundRpcServer, RpcClient, RpcClientFactory, RpcContext, RpcDispatch, RpcError,
    RpcServerTransport, RpcValue,
};
use crate::transport::{Connector, IoStream};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use roslink_protocol::{encode_frame, ConnectionHeader, FrameDecoder};
use serde_json::{json, Value};
use std::collections::{HashMap, VecDeque};
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicU16, AtomicU32, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, AsyncReadExt, AsyncWriteExt, DuplexStream, ReadBuf};
use tokio::sync::{oneshot, Mutex as AsyncMutex};

/// MD5 checksum of the `std_msgs/Bool` definition.
pub const BOOL_MD5: &str = "8b94c1b53db61fb6aed406028ad6332a";

/// Canonical text of the `std_msgs/Bool` definition.
pub const BOOL_DEFINITION: &str = "bool data";

// ---------------------------------------------------------------------------
// Message codec
// ---------------------------------------------------------------------------

/// Codec that only understands `std_msgs/Bool`.
pub struct TestCodec;

impl MessageCodec for TestCodec {
    fn schema(
        &self,
        data_type: &str,
        _definition_text: &str,
    ) -> Result<Arc<dyn MessageSchema>, MessageError> {
        if data_type != "std_msgs/Bool" {
            return Err(MessageError::Definition(format!(
                "unknown data type {data_type}"
            )));
        }
        Ok(Arc::new(BoolSchema))
    }
}

/// Compiled `std_msgs/Bool`: one byte, zero or nonzero.
pub struct BoolSchema;

impl MessageSchema for BoolSchema {
    fn data_type(&self) -> &str {
        "std_msgs/Bool"
    }

    fn md5sum(&self) -> &str {
        BOOL_MD5
    }

    fn canonical_text(&self) -> &str {
        BOOL_DEFINITION
    }

    fn read(&self, bytes: &[u8]) -> Result<MessageValue, MessageError> {
        match bytes {
            [b] => Ok(json!({ "data": *b != 0 })),
            _ => Err(MessageError::Decode(format!(
                "expected 1 byte, got {}",
                bytes.len()
            ))),
        }
    }

    fn write(&self, value: &MessageValue) -> Result<Bytes, MessageError> {
        match value.get("data").and_then(Value::as_bool) {
            Some(b) => Ok(Bytes::from(vec![u8::from(b)])),
            None => Err(MessageError::Encode("missing bool field data".to_string())),
        }
    }
}

// ---------------------------------------------------------------------------
// Duplex streams
// ---------------------------------------------------------------------------

/// In-memory [`IoStream`] over `tokio::io::duplex`.
pub struct TestStream(pub DuplexStream);

impl AsyncRead for TestStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.0).poll_read(cx, buf)
    }
}

impl AsyncWrite for TestStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.0).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.0).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.0).poll_shutdown(cx)
    }
}

impl IoStream for TestStream {
    fn local_addr(&self) -> Option<SocketAddr> {
        None
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        None
    }

    fn set_nodelay(&self, _nodelay: bool) -> io::Result<()> {
        Ok(())
    }
}

/// Server end of one duplex connection.
pub struct DuplexPeer {
    read: AsyncMutex<tokio::io::ReadHalf<DuplexStream>>,
    write: AsyncMutex<tokio::io::WriteHalf<DuplexStream>>,
    decoder: AsyncMutex<FrameDecoder>,
}

impl DuplexPeer {
    pub fn new(stream: DuplexStream) -> Self {
        let (read, write) = tokio::io::split(stream);
        Self {
            read: AsyncMutex::new(read),
            write: AsyncMutex::new(write),
            decoder: AsyncMutex::new(FrameDecoder::new()),
        }
    }

    /// Reads until one complete frame is available.
    pub async fn read_frame(&self) -> Bytes {
        let mut read = self.read.lock().await;
        let mut decoder = self.decoder.lock().await;
        let mut buf = [0u8; 4096];
        loop {
            if let Some(frame) = decoder.decode().unwrap() {
                return frame;
            }
            let n = read.read(&mut buf).await.unwrap();
            assert_ne!(n, 0, "peer closed while a frame was expected");
            decoder.extend(&buf[..n]);
        }
    }

    pub async fn write_frame(&self, payload: &[u8]) {
        self.write
            .lock()
            .await
            .write_all(&encode_frame(payload))
            .await
            .unwrap();
    }

    pub async fn write_raw(&self, bytes: &[u8]) {
        self.write.lock().await.write_all(bytes).await.unwrap();
    }

    /// Asserts the other end closes the stream (EOF) rather than
    /// sending anything further.
    pub async fn expect_close(&self) {
        let mut read = self.read.lock().await;
        let mut buf = [0u8; 256];
        loop {
            match read.read(&mut buf).await {
                Ok(0) | Err(_) => return,
                Ok(_) => {}
            }
        }
    }
}

/// [`Connector`] that hands out in-memory duplex streams.
pub struct DuplexConnector {
    waiting: Mutex<VecDeque<oneshot::Sender<DuplexPeer>>>,
    unclaimed: Mutex<Vec<DuplexPeer>>,
}

impl DuplexConnector {
    pub fn new() -> Self {
        Self {
            waiting: Mutex::new(VecDeque::new()),
            unclaimed: Mutex::new(Vec::new()),
        }
    }

    /// Registers for the next inbound connect; resolves to its peer end.
    /// A connect that already happened is claimed immediately.
    pub fn expect_connection(&self) -> oneshot::Receiver<DuplexPeer> {
        let (tx, rx) = oneshot::channel();
        let already = self.unclaimed.lock().pop();
        match already {
            Some(peer) => {
                let _ = tx.send(peer);
            }
            None => self.waiting.lock().push_back(tx),
        }
        rx
    }

    /// Connects that arrived with nobody expecting them.
    pub fn pending_accepts(&self) -> usize {
        self.unclaimed.lock().len()
    }
}

#[async_trait]
impl Connector for DuplexConnector {
    async fn connect(&self, _host: &str, _port: u16) -> io::Result<Box<dyn IoStream>> {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let peer = DuplexPeer::new(server);
        match self.waiting.lock().pop_front() {
            Some(tx) => {
                let _ = tx.send(peer);
            }
            None => self.unclaimed.lock().push(peer),
        }
        Ok(Box::new(TestStream(client)))
    }
}

/// Completes the publisher side of a handshake on `peer` and streams the
/// given message bodies. Returns the subscriber's request header.
pub async fn serve_publisher(peer: &DuplexPeer, bodies: &[&[u8]]) -> ConnectionHeader {
    let request = ConnectionHeader::parse(&peer.read_frame().await);

    let response = ConnectionHeader::new()
        .with_field("callerid", "/test_publisher")
        .with_field("latching", "0")
        .with_field("md5sum", BOOL_MD5)
        .with_field("message_definition", BOOL_DEFINITION)
        .with_field("topic", request.get("topic").unwrap_or("/unknown"))
        .with_field("type", "std_msgs/Bool");
    peer.write_frame(&response.encode()).await;

    for body in bodies {
        peer.write_frame(body).await;
    }
    request
}

// ---------------------------------------------------------------------------
// In-process master
// ---------------------------------------------------------------------------

/// Minimal master + parameter server reachable as an [`RpcClient`].
///
/// Tracks registrations and parameters; does not push `publisherUpdate`
/// itself (tests drive the follower surface directly when they need a
/// push).
pub struct TestMaster {
    publishers: Mutex<HashMap<String, Vec<(String, String)>>>,
    subscribers: Mutex<HashMap<String, Vec<(String, String)>>>,
    topic_types: Mutex<HashMap<String, String>>,
    params: Mutex<HashMap<String, Value>>,
    /// While nonzero, registration calls fail with a transport error.
    pub fail_registrations: AtomicU32,
}

impl TestMaster {
    pub fn new() -> Self {
        Self {
            publishers: Mutex::new(HashMap::new()),
            subscribers: Mutex::new(HashMap::new()),
            topic_types: Mutex::new(HashMap::new()),
            params: Mutex::new(HashMap::new()),
            fail_registrations: AtomicU32::new(0),
        }
    }

    pub fn publisher_apis(&self, topic: &str) -> Vec<String> {
        self.publishers
            .lock()
            .get(topic)
            .map(|entries| entries.iter().map(|(_, api)| api.clone()).collect())
            .unwrap_or_default()
    }

    pub fn subscriber_apis(&self, topic: &str) -> Vec<String> {
        self.subscribers
            .lock()
            .get(topic)
            .map(|entries| entries.iter().map(|(_, api)| api.clone()).collect())
            .unwrap_or_default()
    }

    pub fn set_test_param(&self, key: &str, value: Value) {
        self.params.lock().insert(key.to_string(), value);
    }

    pub fn remove_test_param(&self, key: &str) {
        self.params.lock().remove(key);
    }

    fn register(
        table: &Mutex<HashMap<String, Vec<(String, String)>>>,
        topic: &str,
        caller: &str,
        api: &str,
    ) {
        let mut table = table.lock();
        let entries = table.entry(topic.to_string()).or_default();
        entries.retain(|(c, _)| c != caller);
        entries.push((caller.to_string(), api.to_string()));
    }

    fn unregister(
        table: &Mutex<HashMap<String, Vec<(String, String)>>>,
        topic: &str,
        api: &str,
    ) -> usize {
        let mut table = table.lock();
        if let Some(entries) = table.get_mut(topic) {
            let before = entries.len();
            entries.retain(|(_, a)| a != api);
            return before - entries.len();
        }
        0
    }

    fn param_value(&self, key: &str) -> Value {
        // An unset key answers with an empty struct, exactly like the
        // real parameter server.
        self.params
            .lock()
            .get(key)
            .cloned()
            .unwrap_or_else(|| json!({}))
    }
}

#[async_trait]
impl RpcClient for TestMaster {
    async fn call(&self, method: &str, params: Vec<RpcValue>) -> Result<RpcValue, RpcError> {
        let arg = |i: usize| -> &str { params.get(i).and_then(Value::as_str).unwrap_or_default() };

        if matches!(
            method,
            "registerPublisher" | "registerSubscriber" | "unregisterPublisher" | "unregisterSubscriber"
        ) {
            let pending = self.fail_registrations.load(Ordering::SeqCst);
            if pending > 0 {
                self.fail_registrations.store(pending - 1, Ordering::SeqCst);
                return Err(RpcError::Transport("master unavailable".to_string()));
            }
        }

        let reply = match method {
            "registerPublisher" => {
                let (caller, topic, data_type, api) = (arg(0), arg(1), arg(2), arg(3));
                Self::register(&self.publishers, topic, caller, api);
                self.topic_types
                    .lock()
                    .insert(topic.to_string(), data_type.to_string());
                reply_ok("registered publisher", json!(self.subscriber_apis(topic)))
            }
            "unregisterPublisher" => {
                let removed = Self::unregister(&self.publishers, arg(1), arg(2));
                reply_ok("unregistered publisher", json!(removed))
            }
            "registerSubscriber" => {
                let (caller, topic, _data_type, api) = (arg(0), arg(1), arg(2), arg(3));
                Self::register(&self.subscribers, topic, caller, api);
                reply_ok("registered subscriber", json!(self.publisher_apis(topic)))
            }
            "unregisterSubscriber" => {
                let removed = Self::unregister(&self.subscribers, arg(1), arg(2));
                reply_ok("unregistered subscriber", json!(removed))
            }
            "getPublishedTopics" => {
                let types = self.topic_types.lock();
                let pairs: Vec<Value> = self
                    .publishers
                    .lock()
                    .keys()
                    .map(|topic| {
                        json!([
                            topic,
                            types.get(topic).cloned().unwrap_or_default()
                        ])
                    })
                    .collect();
                reply_ok("current topics", json!(pairs))
            }
            "getSystemState" => {
                let state = |table: &Mutex<HashMap<String, Vec<(String, String)>>>| -> Vec<Value> {
                    table
                        .lock()
                        .iter()
                        .map(|(topic, entries)| {
                            let callers: Vec<&String> =
                                entries.iter().map(|(caller, _)| caller).collect();
                            json!([topic, callers])
                        })
                        .collect()
                };
                reply_ok(
                    "system state",
                    json!([
                        state(&self.publishers),
                        state(&self.subscribers),
                        Vec::<Value>::new()
                    ]),
                )
            }
            "setParam" => {
                let key = arg(1).trim_end_matches('/').to_string();
                self.params
                    .lock()
                    .insert(key, params.get(2).cloned().unwrap_or(Value::Null));
                reply_ok("parameter set", json!(0))
            }
            "getParamNames" => {
                let names: Vec<String> = self.params.lock().keys().cloned().collect();
                reply_ok("parameter names", json!(names))
            }
            "subscribeParam" => reply_ok("subscribed", self.param_value(arg(2))),
            "unsubscribeParam" => reply_ok("unsubscribed", json!(1)),
            "subscribeParams" => {
                let keys = params
                    .get(2)
                    .and_then(Value::as_array)
                    .cloned()
                    .unwrap_or_default();
                let replies: Vec<Value> = keys
                    .iter()
                    .map(|key| {
                        let key = key.as_str().unwrap_or_default();
                        // A reserved key for exercising per-key faults.
                        if key == "/forbidden" {
                            json!([0, "forbidden parameter", {}])
                        } else {
                            reply_ok("subscribed", self.param_value(key))
                        }
                    })
                    .collect();
                reply_ok("subscribed batch", json!(replies))
            }
            "unsubscribeParams" => {
                let keys = params
                    .get(2)
                    .and_then(Value::as_array)
                    .cloned()
                    .unwrap_or_default();
                let replies: Vec<Value> =
                    keys.iter().map(|_| reply_ok("unsubscribed", json!(1))).collect();
                reply_ok("unsubscribed batch", json!(replies))
            }
            other => {
                return Err(RpcError::Transport(format!("unknown master method {other}")));
            }
        };
        Ok(reply)
    }
}

// ---------------------------------------------------------------------------
// Loopback follower RPC
// ---------------------------------------------------------------------------

/// In-process RPC fabric: binds follower servers into a registry and
/// routes client calls straight into the bound dispatch. The master URL
/// routes to a [`TestMaster`].
pub struct LoopbackRpcHub {
    master_url: String,
    master: Arc<TestMaster>,
    servers: Mutex<HashMap<String, Arc<dyn RpcDispatch>>>,
    next_port: AtomicU16,
    self_weak: std::sync::Weak<LoopbackRpcHub>,
}

impl LoopbackRpcHub {
    pub fn new(master_url: &str, master: Arc<TestMaster>) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            master_url: master_url.to_string(),
            master,
            servers: Mutex::new(HashMap::new()),
            next_port: AtomicU16::new(20_000),
            self_weak: weak.clone(),
        })
    }

    pub fn master(&self) -> Arc<TestMaster> {
        self.master.clone()
    }
}

impl RpcClientFactory for LoopbackRpcHub {
    fn connect(&self, url: &str) -> Result<Arc<dyn RpcClient>, RpcError> {
        if url == self.master_url {
            return Ok(self.master.clone());
        }
        let dispatch = self
            .servers
            .lock()
            .get(url)
            .cloned()
            .ok_or_else(|| RpcError::Transport(format!("no server at {url}")))?;
        Ok(Arc::new(LoopbackClient { dispatch }))
    }
}

#[async_trait]
impl RpcServerTransport for LoopbackRpcHub {
    async fn bind(
        &self,
        hostname: &str,
        dispatch: Arc<dyn RpcDispatch>,
    ) -> Result<Box<dyn BoundRpcServer>, RpcError> {
        let port = self.next_port.fetch_add(1, Ordering::SeqCst);
        let url = format!("http://{hostname}:{port}/");
        self.servers.lock().insert(url.clone(), dispatch);
        Ok(Box::new(LoopbackBound {
            url,
            hub: self.self_weak.clone(),
        }))
    }
}

struct LoopbackClient {
    dispatch: Arc<dyn RpcDispatch>,
}

#[async_trait]
impl RpcClient for LoopbackClient {
    async fn call(&self, method: &str, params: Vec<RpcValue>) -> Result<RpcValue, RpcError> {
        Ok(self
            .dispatch
            .dispatch(method, &params, &RpcContext::default())
            .await)
    }
}

/// Follower stand-in that answers `requestTopic` with a fixed endpoint.
pub struct StubFollower {
    pub host: String,
    pub port: u16,
}

#[async_trait]
impl RpcDispatch for StubFollower {
    async fn dispatch(&self, method: &str, _params: &[RpcValue], _ctx: &RpcContext) -> RpcValue {
        match method {
            "requestTopic" => reply_ok(
                "ready",
                json!([roslink_protocol::TCPROS, self.host, self.port]),
            ),
            other => crate::rpc::reply_error(&format!("stub does not implement {other}")),
        }
    }
}

struct LoopbackBound {
    url: String,
    hub: std::sync::Weak<LoopbackRpcHub>,
}

#[async_trait]
impl BoundRpcServer for LoopbackBound {
    fn url(&self) -> String {
        self.url.clone()
    }

    async fn close(&self) {
        if let Some(hub) = self.hub.upgrade() {
            hub.servers.lock().remove(&self.url);
        }
    }
}
