//! Typed clients for the master and parameter-server APIs.
//!
//! Thin method wrappers over an [`RpcClient`]: build the parameter list,
//! unwrap the reply triple, map non-success codes to [`RpcError::Fault`].

use crate::rpc::{expect_success, parse_reply, RpcClient, RpcError, RpcValue};
use serde_json::json;
use std::sync::Arc;

/// Client for the master's registration and lookup API.
pub struct MasterClient {
    client: Arc<dyn RpcClient>,
    caller_id: String,
}

impl MasterClient {
    pub fn new(client: Arc<dyn RpcClient>, caller_id: impl Into<String>) -> Self {
        Self {
            client,
            caller_id: caller_id.into(),
        }
    }

    async fn call(&self, method: &str, mut params: Vec<RpcValue>) -> Result<RpcValue, RpcError> {
        params.insert(0, json!(self.caller_id));
        let reply = self.client.call(method, params).await?;
        expect_success(&reply)
    }

    /// Registers a publication; returns the topic's current subscribers.
    pub async fn register_publisher(
        &self,
        topic: &str,
        data_type: &str,
        caller_api: &str,
    ) -> Result<Vec<String>, RpcError> {
        let value = self
            .call(
                "registerPublisher",
                vec![json!(topic), json!(data_type), json!(caller_api)],
            )
            .await?;
        Ok(url_list(&value))
    }

    pub async fn unregister_publisher(
        &self,
        topic: &str,
        caller_api: &str,
    ) -> Result<(), RpcError> {
        self.call("unregisterPublisher", vec![json!(topic), json!(caller_api)])
            .await?;
        Ok(())
    }

    /// Registers a subscription; returns the topic's current publishers.
    pub async fn register_subscriber(
        &self,
        topic: &str,
        data_type: &str,
        caller_api: &str,
    ) -> Result<Vec<String>, RpcError> {
        let value = self
            .call(
                "registerSubscriber",
                vec![json!(topic), json!(data_type), json!(caller_api)],
            )
            .await?;
        Ok(url_list(&value))
    }

    pub async fn unregister_subscriber(
        &self,
        topic: &str,
        caller_api: &str,
    ) -> Result<(), RpcError> {
        self.call("unregisterSubscriber", vec![json!(topic), json!(caller_api)])
            .await?;
        Ok(())
    }

    /// Returns `(topic, type)` pairs currently published in `subgraph`
    /// (empty string for all).
    pub async fn get_published_topics(
        &self,
        subgraph: &str,
    ) -> Result<Vec<(String, String)>, RpcError> {
        let value = self
            .call("getPublishedTopics", vec![json!(subgraph)])
            .await?;
        let pairs = value
            .as_array()
            .map(|items| {
                items
                    .iter()
                    .filter_map(|pair| {
                        let pair = pair.as_array()?;
                        Some((
                            pair.first()?.as_str()?.to_string(),
                            pair.get(1)?.as_str()?.to_string(),
                        ))
                    })
                    .collect()
            })
            .unwrap_or_default();
        Ok(pairs)
    }

    /// Returns the master's `[publishers, subscribers, services]` state.
    pub async fn get_system_state(&self) -> Result<RpcValue, RpcError> {
        self.call("getSystemState", Vec::new()).await
    }
}

/// Client for the parameter-server API.
pub struct ParamClient {
    client: Arc<dyn RpcClient>,
    caller_id: String,
    caller_api: String,
}

impl ParamClient {
    pub fn new(
        client: Arc<dyn RpcClient>,
        caller_id: impl Into<String>,
        caller_api: impl Into<String>,
    ) -> Self {
        Self {
            client,
            caller_id: caller_id.into(),
            caller_api: caller_api.into(),
        }
    }

    pub async fn set_param(&self, key: &str, value: &RpcValue) -> Result<(), RpcError> {
        let reply = self
            .client
            .call("setParam", vec![json!(self.caller_id), json!(key), value.clone()])
            .await?;
        expect_success(&reply)?;
        Ok(())
    }

    pub async fn get_param_names(&self) -> Result<Vec<String>, RpcError> {
        let reply = self
            .client
            .call("getParamNames", vec![json!(self.caller_id)])
            .await?;
        let value = expect_success(&reply)?;
        Ok(value
            .as_array()
            .map(|items| {
                items
                    .iter()
                    .filter_map(|v| v.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default())
    }

    /// Subscribes to one key; the returned value is the current parameter
    /// value (an empty struct when the key is unset).
    pub async fn subscribe_param(&self, key: &str) -> Result<RpcValue, RpcError> {
        let reply = self
            .client
            .call(
                "subscribeParam",
                vec![json!(self.caller_id), json!(self.caller_api), json!(key)],
            )
            .await?;
        expect_success(&reply)
    }

    pub async fn unsubscribe_param(&self, key: &str) -> Result<(), RpcError> {
        let reply = self
            .client
            .call(
                "unsubscribeParam",
                vec![json!(self.caller_id), json!(self.caller_api), json!(key)],
            )
            .await?;
        expect_success(&reply)?;
        Ok(())
    }

    /// Batch subscribe. Returns one reply triple per key, in key order;
    /// per-key faults stay in their triple rather than failing the batch.
    pub async fn subscribe_params(
        &self,
        keys: &[String],
    ) -> Result<Vec<(i64, String, RpcValue)>, RpcError> {
        let reply = self
            .client
            .call(
                "subscribeParams",
                vec![json!(self.caller_id), json!(self.caller_api), json!(keys)],
            )
            .await?;
        per_key_replies(&reply, keys.len())
    }

    /// Batch unsubscribe; same per-key reply shape as
    /// [`subscribe_params`](Self::subscribe_params).
    pub async fn unsubscribe_params(
        &self,
        keys: &[String],
    ) -> Result<Vec<(i64, String, RpcValue)>, RpcError> {
        let reply = self
            .client
            .call(
                "unsubscribeParams",
                vec![json!(self.caller_id), json!(self.caller_api), json!(keys)],
            )
            .await?;
        per_key_replies(&reply, keys.len())
    }
}

fn url_list(value: &RpcValue) -> Vec<String> {
    value
        .as_array()
        .map(|items| {
            items
                .iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default()
}

fn per_key_replies(
    reply: &RpcValue,
    expected: usize,
) -> Result<Vec<(i64, String, RpcValue)>, RpcError> {
    let value = expect_success(reply)?;
    let items = value
        .as_array()
        .ok_or_else(|| RpcError::Malformed("batch reply value is not an array".to_string()))?;
    if items.len() != expected {
        return Err(RpcError::Malformed(format!(
            "batch reply has {} entries, expected {expected}",
            items.len()
        )));
    }
    items.iter().map(parse_reply).collect()
}
