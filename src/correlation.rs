//! Matching operation responses to the calls waiting for them.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::oneshot;

pub type Parameters = HashMap<String, Value>;

/// Payload on `.../<operation>/REQ`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationRequest {
    pub req_id: String,
    #[serde(default, deserialize_with = "params_or_empty")]
    pub params: Parameters,
}

fn params_or_empty<'de, D>(deserializer: D) -> Result<Parameters, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let params: Option<Parameters> = Option::deserialize(deserializer)?;
    Ok(params.unwrap_or_default())
}

impl OperationRequest {
    pub fn param(&self, name: &str) -> Option<&Value> {
        self.params.get(name)
    }

    pub fn param_as<T: serde::de::DeserializeOwned>(&self, name: &str) -> Option<T> {
        self.params
            .get(name)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    pub fn param_i64(&self, name: &str) -> Option<i64> {
        self.params.get(name).and_then(Value::as_i64)
    }

    pub fn param_f64(&self, name: &str) -> Option<f64> {
        self.params.get(name).and_then(Value::as_f64)
    }

    pub fn param_bool(&self, name: &str) -> Option<bool> {
        self.params.get(name).and_then(Value::as_bool)
    }

    pub fn param_str(&self, name: &str) -> Option<&str> {
        self.params.get(name).and_then(Value::as_str)
    }
}

/// Payload on `.../<operation>/RESP`. A null result is sent without `resp`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationResponse {
    pub req_id: String,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub resp: Value,
}

#[derive(Debug)]
struct PendingCall {
    registered_at: Instant,
    reply: oneshot::Sender<OperationResponse>,
}

/// Outstanding calls keyed by request id. A response is handed to at most one
/// caller; responses nobody waits for are discarded.
#[derive(Debug)]
pub struct ResponseStore {
    pending: DashMap<String, PendingCall>,
    max_age: Duration,
}

impl ResponseStore {
    pub fn new(max_age: Duration) -> Self {
        ResponseStore {
            pending: DashMap::new(),
            max_age,
        }
    }

    /// Must happen before the request is published so a fast reply is not lost.
    pub fn register(self: &Arc<Self>, req_id: &str) -> PendingReply {
        let (tx, rx) = oneshot::channel();
        self.pending.insert(
            req_id.to_string(),
            PendingCall {
                registered_at: Instant::now(),
                reply: tx,
            },
        );
        PendingReply {
            store: Arc::clone(self),
            req_id: req_id.to_string(),
            rx,
        }
    }

    /// Returns false when no call is waiting for this request id.
    pub fn deliver(&self, response: OperationResponse) -> bool {
        match self.pending.remove(&response.req_id) {
            Some((_, call)) => call.reply.send(response).is_ok(),
            None => false,
        }
    }

    /// Drops pending calls older than the configured age.
    pub fn evict_expired(&self) -> usize {
        let before = self.pending.len();
        let max_age = self.max_age;
        self.pending.retain(|_, call| call.registered_at.elapsed() < max_age);
        before.saturating_sub(self.pending.len())
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

/// Removes its store entry when dropped, so abandoned calls do not linger.
#[derive(Debug)]
pub struct PendingReply {
    store: Arc<ResponseStore>,
    req_id: String,
    rx: oneshot::Receiver<OperationResponse>,
}

impl PendingReply {
    pub fn req_id(&self) -> &str {
        &self.req_id
    }

    /// `None` if nothing arrived within `timeout`.
    pub async fn wait(mut self, timeout: Duration) -> Option<OperationResponse> {
        match tokio::time::timeout(timeout, &mut self.rx).await {
            Ok(Ok(response)) => Some(response),
            Ok(Err(_)) | Err(_) => None,
        }
    }
}

impl Drop for PendingReply {
    fn drop(&mut self) {
        self.store.pending.remove(&self.req_id);
    }
}
