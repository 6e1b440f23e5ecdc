//! The node runtime.
//!
//! A [`Node`] owns the publication and subscription tables, the master
//! and parameter-server clients, the inbound TCP accept loop, and the
//! follower RPC server peers use to negotiate connections and push
//! updates.

use crate::backoff::{retry_forever, Backoff};
use crate::cancel::{cancel_pair, CancelHandle, CancelToken};
use crate::error::NodeError;
use crate::follower::FollowerApi;
use crate::hostname::{resolve_advertise_host, HostDiscovery};
use crate::master::{MasterClient, ParamClient};
use crate::msg::{MessageCodec, MessageValue};
use crate::publication::Publication;
use crate::publisher_link::PublisherConnection;
use crate::rpc::{
    expect_success, BoundRpcServer, RpcClientFactory, RpcServerTransport, RpcValue,
};
use crate::subscriber_link::handle_inbound;
use crate::subscription::Subscription;
use crate::transport::{Connector, StreamListener};
use crate::ANY;
use dashmap::DashMap;
use parking_lot::Mutex;
use roslink_protocol::{ConnectionHeader, TCPROS};
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::broadcast;

/// Capacity of the node-level event broadcast channels.
const NODE_EVENT_CAPACITY: usize = 256;

/// Node identity and master location.
#[derive(Debug, Clone)]
pub struct NodeOptions {
    pub name: String,
    pub master_uri: String,
    pub hostname: Option<String>,
    pub pid: Option<u32>,
}

impl NodeOptions {
    pub fn new(name: impl Into<String>, master_uri: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            master_uri: master_uri.into(),
            hostname: None,
            pid: None,
        }
    }

    /// Builds options with the master location taken from
    /// `ROS_MASTER_URI`.
    pub fn from_env(name: impl Into<String>) -> Result<Self, NodeError> {
        let master_uri = std::env::var("ROS_MASTER_URI")
            .ok()
            .filter(|uri| !uri.is_empty())
            .ok_or(NodeError::MasterUriUnset)?;
        Ok(Self::new(name, master_uri))
    }

    /// Overrides the advertised hostname (otherwise resolved from the
    /// environment).
    pub fn with_hostname(mut self, hostname: impl Into<String>) -> Self {
        self.hostname = Some(hostname.into());
        self
    }

    /// Overrides the reported process id.
    pub fn with_pid(mut self, pid: u32) -> Self {
        self.pid = Some(pid);
        self
    }
}

/// Injected collaborators: RPC transports, message codec, sockets.
pub struct NodeTransports {
    pub rpc_factory: Arc<dyn RpcClientFactory>,
    pub rpc_server: Arc<dyn RpcServerTransport>,
    pub connector: Arc<dyn Connector>,
    pub codec: Arc<dyn MessageCodec>,
    /// Inbound TCP listener; required only to publish.
    pub listener: Option<Arc<dyn StreamListener>>,
}

/// Options for [`Node::advertise`].
#[derive(Debug, Clone)]
pub struct AdvertiseOptions {
    pub topic: String,
    pub data_type: String,
    pub definition_text: String,
    pub latching: bool,
    /// Explicit checksum; computed from the definition when absent.
    pub md5sum: Option<String>,
}

impl AdvertiseOptions {
    pub fn new(topic: impl Into<String>, data_type: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            data_type: data_type.into(),
            definition_text: String::new(),
            latching: false,
            md5sum: None,
        }
    }

    pub fn with_definition(mut self, text: impl Into<String>) -> Self {
        self.definition_text = text.into();
        self
    }

    pub fn latching(mut self, latching: bool) -> Self {
        self.latching = latching;
        self
    }

    pub fn with_md5sum(mut self, md5sum: impl Into<String>) -> Self {
        self.md5sum = Some(md5sum.into());
        self
    }
}

/// Options for [`Node::subscribe`].
#[derive(Debug, Clone)]
pub struct SubscribeOptions {
    pub topic: String,
    pub data_type: String,
    /// Expected checksum; `"*"` accepts any publisher.
    pub md5sum: String,
    pub tcp_nodelay: bool,
}

impl SubscribeOptions {
    pub fn new(topic: impl Into<String>, data_type: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            data_type: data_type.into(),
            md5sum: ANY.to_string(),
            tcp_nodelay: false,
        }
    }

    pub fn with_md5sum(mut self, md5sum: impl Into<String>) -> Self {
        self.md5sum = md5sum.into();
        self
    }

    pub fn tcp_nodelay(mut self, tcp_nodelay: bool) -> Self {
        self.tcp_nodelay = tcp_nodelay;
        self
    }
}

/// A parameter change observed by this node.
#[derive(Debug, Clone)]
pub struct ParamUpdate {
    pub key: String,
    pub previous: Option<RpcValue>,
    pub value: RpcValue,
}

/// Handle to a running node. Cheap to clone.
#[derive(Clone)]
pub struct Node {
    inner: Arc<NodeInner>,
}

pub(crate) struct NodeInner {
    pub(crate) name: String,
    pub(crate) hostname: String,
    pub(crate) pid: u32,
    pub(crate) caller_api: String,
    master: MasterClient,
    params: ParamClient,
    rpc_factory: Arc<dyn RpcClientFactory>,
    connector: Arc<dyn Connector>,
    codec: Arc<dyn MessageCodec>,
    pub(crate) listener: Option<Arc<dyn StreamListener>>,
    follower: Mutex<Option<Box<dyn BoundRpcServer>>>,
    pub(crate) publications: Arc<DashMap<String, Publication>>,
    pub(crate) subscriptions: Arc<DashMap<String, Subscription>>,
    param_cache: Mutex<HashMap<String, RpcValue>>,
    next_connection_id: AtomicU64,
    stopped: AtomicBool,
    root_cancel: CancelHandle,
    param_events: broadcast::Sender<ParamUpdate>,
    errors: broadcast::Sender<String>,
    backoff: Backoff,
}

impl Node {
    /// Starts the node: resolves its identity, binds the follower RPC
    /// server (whose URL becomes this node's `caller_api`), and starts
    /// accepting inbound TCPROS connections if a listener was provided.
    pub async fn start(
        options: NodeOptions,
        transports: NodeTransports,
    ) -> Result<Node, NodeError> {
        validate_name(&options.name)?;

        let hostname = options
            .hostname
            .unwrap_or_else(|| resolve_advertise_host(&HostDiscovery::from_env()));
        let pid = options.pid.unwrap_or_else(std::process::id);

        let dispatch = FollowerApi::new();
        let follower = transports.rpc_server.bind(&hostname, dispatch.clone()).await?;
        let caller_api = follower.url();

        let master_client = transports.rpc_factory.connect(&options.master_uri)?;
        let master = MasterClient::new(master_client.clone(), &options.name);
        let params = ParamClient::new(master_client, &options.name, &caller_api);

        let (root_cancel, root_token) = cancel_pair();
        let (param_events, _) = broadcast::channel(NODE_EVENT_CAPACITY);
        let (errors, _) = broadcast::channel(NODE_EVENT_CAPACITY);

        let inner = Arc::new(NodeInner {
            name: options.name,
            hostname,
            pid,
            caller_api,
            master,
            params,
            rpc_factory: transports.rpc_factory,
            connector: transports.connector,
            codec: transports.codec,
            listener: transports.listener,
            follower: Mutex::new(Some(follower)),
            publications: Arc::new(DashMap::new()),
            subscriptions: Arc::new(DashMap::new()),
            param_cache: Mutex::new(HashMap::new()),
            next_connection_id: AtomicU64::new(0),
            stopped: AtomicBool::new(false),
            root_cancel,
            param_events,
            errors,
            backoff: Backoff::default(),
        });
        dispatch.attach(Arc::downgrade(&inner));

        if let Some(listener) = inner.listener.clone() {
            tokio::spawn(accept_loop(Arc::downgrade(&inner), listener, root_token));
        }

        tracing::info!(
            "node {} started at {} (pid {})",
            inner.name,
            inner.caller_api,
            inner.pid
        );
        Ok(Node { inner })
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// The follower RPC URL peers and the master use to reach this node.
    pub fn caller_api(&self) -> &str {
        &self.inner.caller_api
    }

    pub fn hostname(&self) -> &str {
        &self.inner.hostname
    }

    pub fn pid(&self) -> u32 {
        self.inner.pid
    }

    /// Port of the inbound TCPROS listener, if one is bound.
    pub fn tcp_port(&self) -> Option<u16> {
        self.inner.listener.as_ref().map(|l| l.local_port())
    }

    pub fn is_advertising(&self, topic: &str) -> bool {
        self.inner.publications.contains_key(topic)
    }

    pub fn is_subscribed_to(&self, topic: &str) -> bool {
        self.inner.subscriptions.contains_key(topic)
    }

    pub fn publication(&self, topic: &str) -> Option<Publication> {
        self.inner.publications.get(topic).map(|e| e.value().clone())
    }

    pub fn subscription(&self, topic: &str) -> Option<Subscription> {
        self.inner.subscriptions.get(topic).map(|e| e.value().clone())
    }

    /// Stream of parameter changes (master pushes and local writes).
    pub fn param_updates(&self) -> broadcast::Receiver<ParamUpdate> {
        self.inner.param_events.subscribe()
    }

    /// Stream of non-fatal node-level faults.
    pub fn errors(&self) -> broadcast::Receiver<String> {
        self.inner.errors.subscribe()
    }

    /// The cached value of a subscribed parameter; `None` when unknown
    /// or recorded as unset.
    pub fn cached_param(&self, key: &str) -> Option<RpcValue> {
        let key = normalize_param_key(key);
        match self.inner.param_cache.lock().get(&key) {
            Some(Value::Null) | None => None,
            Some(value) => Some(value.clone()),
        }
    }

    /// Advertises `topic`, registering this node as a publisher.
    ///
    /// Returns the existing publication when the topic is already
    /// advertised. The publication is created before the master call, so
    /// a registration failure leaves it in place; the error still
    /// reaches the caller.
    pub async fn advertise(&self, options: AdvertiseOptions) -> Result<Publication, NodeError> {
        self.ensure_running()?;
        validate_name(&options.topic)?;
        if let Some(existing) = self.inner.publications.get(&options.topic) {
            return Ok(existing.value().clone());
        }
        if self.inner.listener.is_none() {
            return Err(NodeError::NoListener);
        }

        let schema = self
            .inner
            .codec
            .schema(&options.data_type, &options.definition_text)?;
        let md5sum = options
            .md5sum
            .unwrap_or_else(|| schema.md5sum().to_string());

        let publication = Publication::new(
            &options.topic,
            &options.data_type,
            md5sum,
            options.latching,
            &self.inner.name,
            schema,
        );
        self.inner
            .publications
            .insert(options.topic.clone(), publication.clone());
        tracing::info!(
            "advertising {} as {} (latching: {})",
            options.topic,
            options.data_type,
            options.latching
        );

        self.inner
            .master
            .register_publisher(&options.topic, &options.data_type, &self.inner.caller_api)
            .await?;
        Ok(publication)
    }

    /// Stops advertising `topic`: closes every attached subscriber and
    /// unregisters from the master in the background.
    pub async fn unadvertise(&self, topic: &str) -> Result<(), NodeError> {
        let (_, publication) = self
            .inner
            .publications
            .remove(topic)
            .ok_or_else(|| NodeError::NotAdvertised(topic.to_string()))?;
        publication.close();

        let inner = self.inner.clone();
        let topic = topic.to_string();
        tokio::spawn(async move {
            if let Err(e) = inner
                .master
                .unregister_publisher(&topic, &inner.caller_api)
                .await
            {
                tracing::warn!("unregisterPublisher for {} failed: {}", topic, e);
            }
        });
        Ok(())
    }

    /// Encodes `msg` once and fans it out to every connected subscriber.
    pub async fn publish(&self, topic: &str, msg: &MessageValue) -> Result<(), NodeError> {
        self.ensure_running()?;
        let publication = self
            .inner
            .publications
            .get(topic)
            .map(|e| e.value().clone())
            .ok_or_else(|| NodeError::NotAdvertised(topic.to_string()))?;
        publication.publish(msg).await
    }

    /// Subscribes to `topic`. Idempotent: an existing subscription is
    /// returned as-is.
    ///
    /// Registration with the master happens in the background and is
    /// retried forever (with backoff) until it succeeds or the
    /// subscription is torn down; discovered publishers are then
    /// contacted concurrently.
    pub async fn subscribe(&self, options: SubscribeOptions) -> Result<Subscription, NodeError> {
        self.ensure_running()?;
        validate_name(&options.topic)?;
        if let Some(existing) = self.inner.subscriptions.get(&options.topic) {
            return Ok(existing.value().clone());
        }

        let subscription = Subscription::new(
            &options.topic,
            &options.data_type,
            &options.md5sum,
            options.tcp_nodelay,
        );
        self.inner
            .subscriptions
            .insert(options.topic.clone(), subscription.clone());
        tracing::info!("subscribing to {} as {}", options.topic, options.data_type);

        let inner = self.inner.clone();
        let sub = subscription.clone();
        tokio::spawn(async move {
            let token = sub.token();
            let urls = retry_forever(&inner.backoff, &token, || {
                inner
                    .master
                    .register_subscriber(sub.topic(), sub.data_type(), &inner.caller_api)
            })
            .await;

            let Some(urls) = urls else { return };
            tracing::debug!("{} has {} publisher(s)", sub.topic(), urls.len());
            for url in urls {
                let inner = inner.clone();
                let sub = sub.clone();
                tokio::spawn(async move {
                    inner.subscribe_to_publisher(&sub, &url).await;
                });
            }
        });

        Ok(subscription)
    }

    /// Tears down the subscription to `topic` and unregisters from the
    /// master in the background.
    pub async fn unsubscribe(&self, topic: &str) -> Result<(), NodeError> {
        let (_, subscription) = self
            .inner
            .subscriptions
            .remove(topic)
            .ok_or_else(|| NodeError::NotSubscribed(topic.to_string()))?;
        subscription.close();

        let inner = self.inner.clone();
        let topic = topic.to_string();
        tokio::spawn(async move {
            if let Err(e) = inner
                .master
                .unregister_subscriber(&topic, &inner.caller_api)
                .await
            {
                tracing::warn!("unregisterSubscriber for {} failed: {}", topic, e);
            }
        });
        Ok(())
    }

    /// `(topic, type)` pairs currently published anywhere in the graph.
    pub async fn get_published_topics(
        &self,
        subgraph: &str,
    ) -> Result<Vec<(String, String)>, NodeError> {
        self.ensure_running()?;
        Ok(self.inner.master.get_published_topics(subgraph).await?)
    }

    /// The master's full `[publishers, subscribers, services]` state.
    pub async fn get_system_state(&self) -> Result<RpcValue, NodeError> {
        self.ensure_running()?;
        Ok(self.inner.master.get_system_state().await?)
    }

    /// Writes a parameter on the master and applies the change locally
    /// (the master does not echo our own writes back).
    pub async fn set_parameter(&self, key: &str, value: RpcValue) -> Result<(), NodeError> {
        self.ensure_running()?;
        self.inner.params.set_param(key, &value).await?;
        self.inner.apply_param_update(key, value);
        Ok(())
    }

    /// Subscribes to one parameter and caches its current value. An
    /// empty-struct reply means the key is unset and is recorded as "no
    /// value".
    pub async fn subscribe_param(&self, key: &str) -> Result<RpcValue, NodeError> {
        self.ensure_running()?;
        let value = normalize_param_value(self.inner.params.subscribe_param(key).await?);
        self.inner
            .param_cache
            .lock()
            .insert(normalize_param_key(key), value.clone());
        Ok(value)
    }

    /// Synchronizes the cache against the full parameter list: entries
    /// the server no longer knows are dropped, new keys are subscribed
    /// in one batch. Per-key faults are emitted as error events while
    /// the rest proceed.
    pub async fn subscribe_all_params(&self) -> Result<(), NodeError> {
        self.ensure_running()?;
        let names: HashSet<String> = self
            .inner
            .params
            .get_param_names()
            .await?
            .into_iter()
            .map(|k| normalize_param_key(&k))
            .collect();

        let new_keys: Vec<String> = {
            let mut cache = self.inner.param_cache.lock();
            cache.retain(|key, _| names.contains(key));
            names
                .iter()
                .filter(|key| !cache.contains_key(*key))
                .cloned()
                .collect()
        };
        if new_keys.is_empty() {
            return Ok(());
        }

        let replies = self.inner.params.subscribe_params(&new_keys).await?;
        for (key, (code, message, value)) in new_keys.into_iter().zip(replies) {
            if code == crate::rpc::CODE_SUCCESS {
                self.inner
                    .param_cache
                    .lock()
                    .insert(key, normalize_param_value(value));
            } else {
                self.inner
                    .emit_error(format!("subscribeParam {key} failed: {message}"));
            }
        }
        Ok(())
    }

    /// Unsubscribes every cached parameter; the dual of
    /// [`subscribe_all_params`](Self::subscribe_all_params).
    pub async fn unsubscribe_all_params(&self) -> Result<(), NodeError> {
        self.inner.unsubscribe_all_params().await
    }

    /// Stops the node: cancels retries and the accept loop, drops all
    /// parameter subscriptions (best-effort), closes every publication
    /// and subscription, and shuts the follower server down. Idempotent.
    pub async fn shutdown(&self) {
        self.inner.clone().shutdown().await;
    }

    pub fn is_running(&self) -> bool {
        !self.inner.stopped.load(Ordering::SeqCst)
    }

    fn ensure_running(&self) -> Result<(), NodeError> {
        if self.inner.stopped.load(Ordering::SeqCst) {
            return Err(NodeError::Shutdown);
        }
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn inner(&self) -> &Arc<NodeInner> {
        &self.inner
    }
}

impl NodeInner {
    /// Negotiates a TCPROS session with the publisher at `url` and
    /// attaches the resulting connection to `subscription`.
    ///
    /// Any fault is logged and the attempt abandoned; the master will
    /// push a fresh `publisherUpdate` if the publisher is still around.
    pub(crate) async fn subscribe_to_publisher(
        self: &Arc<Self>,
        subscription: &Subscription,
        url: &str,
    ) {
        if self.stopped.load(Ordering::SeqCst)
            || !subscription.is_live()
            || subscription.has_publisher(url)
        {
            return;
        }

        let client = match self.rpc_factory.connect(url) {
            Ok(client) => client,
            Err(e) => {
                tracing::warn!("cannot reach publisher {}: {}", url, e);
                return;
            }
        };

        let reply = match client
            .call(
                "requestTopic",
                vec![
                    json!(self.name),
                    json!(subscription.topic()),
                    json!([[TCPROS]]),
                ],
            )
            .await
        {
            Ok(reply) => reply,
            Err(e) => {
                tracing::warn!("requestTopic on {} failed: {}", url, e);
                return;
            }
        };
        let value = match expect_success(&reply) {
            Ok(value) => value,
            Err(e) => {
                tracing::warn!("requestTopic on {} refused: {}", url, e);
                return;
            }
        };
        let Some((host, port)) = parse_protocol_endpoint(&value) else {
            tracing::warn!("malformed requestTopic reply from {}: {}", url, value);
            return;
        };

        if !subscription.is_live() {
            return;
        }

        let request_header = ConnectionHeader::new()
            .with_field("topic", subscription.topic())
            .with_field("md5sum", subscription.md5sum())
            .with_field("callerid", &self.name)
            .with_field("type", subscription.data_type())
            .with_field(
                "tcp_nodelay",
                if subscription.tcp_nodelay() { "1" } else { "0" },
            );

        let id = self.next_connection_id.fetch_add(1, Ordering::SeqCst);
        let connection = PublisherConnection::new(
            id,
            subscription.topic(),
            url,
            host,
            port,
            request_header,
            self.connector.clone(),
            self.codec.clone(),
            subscription.event_sender(),
        );

        if subscription.add_connection(connection.clone()) {
            connection.start();
            tracing::debug!(
                "connecting to publisher {} for {} (connection {})",
                url,
                subscription.topic(),
                id
            );
        }
    }

    /// Reconciles a subscription against the master's current publisher
    /// list: vanished publishers are disconnected, new ones contacted.
    pub(crate) fn handle_publisher_update(
        self: &Arc<Self>,
        topic: &str,
        publishers: Vec<String>,
    ) {
        let Some(subscription) = self.subscriptions.get(topic).map(|e| e.value().clone()) else {
            tracing::debug!("publisherUpdate for unsubscribed topic {}", topic);
            return;
        };

        let current: HashSet<String> = subscription.publisher_urls().into_iter().collect();
        let target: HashSet<String> = publishers.into_iter().collect();

        for url in current.difference(&target) {
            tracing::info!("publisher {} left {}", url, topic);
            subscription.remove_publisher(url);
        }
        for url in target.difference(&current) {
            tracing::info!("publisher {} joined {}", url, topic);
            let inner = self.clone();
            let subscription = subscription.clone();
            let url = url.clone();
            tokio::spawn(async move {
                inner.subscribe_to_publisher(&subscription, &url).await;
            });
        }
    }

    /// Applies a parameter change (master push or local write) to the
    /// cache and notifies observers.
    pub(crate) fn apply_param_update(&self, key: &str, value: RpcValue) {
        let key = normalize_param_key(key);
        let previous = self.param_cache.lock().insert(key.clone(), value.clone());
        tracing::debug!("parameter {} updated", key);
        let _ = self.param_events.send(ParamUpdate {
            key,
            previous,
            value,
        });
    }

    async fn unsubscribe_all_params(&self) -> Result<(), NodeError> {
        let keys: Vec<String> = self.param_cache.lock().keys().cloned().collect();
        if keys.is_empty() {
            return Ok(());
        }

        let replies = self.params.unsubscribe_params(&keys).await?;
        for (key, (code, message, _)) in keys.iter().zip(replies) {
            if code != crate::rpc::CODE_SUCCESS {
                self.emit_error(format!("unsubscribeParam {key} failed: {message}"));
            }
        }
        self.param_cache.lock().clear();
        Ok(())
    }

    pub(crate) async fn shutdown(self: Arc<Self>) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::info!("node {} shutting down", self.name);
        self.root_cancel.cancel();

        if let Err(e) = self.unsubscribe_all_params().await {
            tracing::warn!("parameter unsubscribe during shutdown failed: {}", e);
        }

        let subscriptions: Vec<(String, Subscription)> = {
            let topics: Vec<String> = self.subscriptions.iter().map(|e| e.key().clone()).collect();
            topics
                .into_iter()
                .filter_map(|t| self.subscriptions.remove(&t))
                .collect()
        };
        for (topic, subscription) in subscriptions {
            subscription.close();
            let inner = self.clone();
            tokio::spawn(async move {
                if let Err(e) = inner
                    .master
                    .unregister_subscriber(&topic, &inner.caller_api)
                    .await
                {
                    tracing::warn!("unregisterSubscriber for {} failed: {}", topic, e);
                }
            });
        }

        let publications: Vec<(String, Publication)> = {
            let topics: Vec<String> = self.publications.iter().map(|e| e.key().clone()).collect();
            topics
                .into_iter()
                .filter_map(|t| self.publications.remove(&t))
                .collect()
        };
        for (topic, publication) in publications {
            publication.close();
            let inner = self.clone();
            tokio::spawn(async move {
                if let Err(e) = inner
                    .master
                    .unregister_publisher(&topic, &inner.caller_api)
                    .await
                {
                    tracing::warn!("unregisterPublisher for {} failed: {}", topic, e);
                }
            });
        }

        let follower = self.follower.lock().take();
        if let Some(follower) = follower {
            follower.close().await;
        }
        tracing::info!("node {} stopped", self.name);
    }

    /// `[pubStats, subStats, svcStats]` for `getBusStats`.
    pub(crate) fn bus_stats(&self) -> RpcValue {
        let pub_stats: Vec<Value> = self
            .publications
            .iter()
            .map(|entry| {
                let connections: Vec<Value> = entry
                    .subscribers()
                    .iter()
                    .map(|c| {
                        let stats = c.stats();
                        json!([
                            c.connection_id(),
                            stats.bytes_sent,
                            stats.messages_sent,
                            c.connected()
                        ])
                    })
                    .collect();
                json!([entry.topic(), connections])
            })
            .collect();

        let sub_stats: Vec<Value> = self
            .subscriptions
            .iter()
            .map(|entry| {
                let connections: Vec<Value> = entry
                    .connections()
                    .iter()
                    .map(|c| {
                        let stats = c.stats();
                        json!([
                            c.connection_id(),
                            stats.bytes_received,
                            stats.messages_received,
                            stats.drop_estimate,
                            c.connected()
                        ])
                    })
                    .collect();
                json!([entry.topic(), connections])
            })
            .collect();

        json!([pub_stats, sub_stats, Vec::<Value>::new()])
    }

    /// `[topic, type]` pairs for `getSubscriptions`.
    pub(crate) fn subscriptions_list(&self) -> RpcValue {
        let pairs: Vec<Value> = self
            .subscriptions
            .iter()
            .map(|e| json!([e.topic(), e.data_type()]))
            .collect();
        json!(pairs)
    }

    /// `[topic, type]` pairs for `getPublications`.
    pub(crate) fn publications_list(&self) -> RpcValue {
        let pairs: Vec<Value> = self
            .publications
            .iter()
            .map(|e| json!([e.topic(), e.data_type()]))
            .collect();
        json!(pairs)
    }

    fn emit_error(&self, message: String) {
        tracing::warn!("{}", message);
        let _ = self.errors.send(message);
    }
}

async fn accept_loop(
    node: Weak<NodeInner>,
    listener: Arc<dyn StreamListener>,
    token: CancelToken,
) {
    loop {
        let stream = tokio::select! {
            result = listener.accept() => match result {
                Ok(stream) => stream,
                Err(e) => {
                    tracing::warn!("accept failed: {}", e);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    continue;
                }
            },
            _ = token.cancelled() => break,
        };

        let Some(inner) = node.upgrade() else { break };
        if inner.stopped.load(Ordering::SeqCst) {
            break;
        }
        let id = inner.next_connection_id.fetch_add(1, Ordering::SeqCst);
        tokio::spawn(handle_inbound(stream, inner.publications.clone(), id));
    }
}

/// Extracts `(host, port)` from a `["TCPROS", host, port]` tuple.
fn parse_protocol_endpoint(value: &RpcValue) -> Option<(String, u16)> {
    let items = value.as_array()?;
    if items.first()?.as_str()? != TCPROS {
        return None;
    }
    let host = items.get(1)?.as_str()?.to_string();
    let port = u16::try_from(items.get(2)?.as_u64()?).ok()?;
    Some((host, port))
}

fn validate_name(name: &str) -> Result<(), NodeError> {
    if !name.starts_with('/') || name.len() < 2 {
        return Err(NodeError::InvalidName(name.to_string()));
    }
    Ok(())
}

/// Strips the trailing `/` a sloppy caller may have left on a key.
fn normalize_param_key(key: &str) -> String {
    match key.strip_suffix('/') {
        Some(stripped) if !stripped.is_empty() => stripped.to_string(),
        _ => key.to_string(),
    }
}

/// The parameter server answers an unset key with an empty struct; that
/// reply is collapsed into the "no value" sentinel.
fn normalize_param_value(value: RpcValue) -> RpcValue {
    match &value {
        Value::Object(map) if map.is_empty() => Value::Null,
        _ => value,
    }
}
