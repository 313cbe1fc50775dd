//! Request/reply bridge to the external forum-API proxy (C4).
//!
//! Grounded on `original_source/src/utils/reddit_proxy.py::send_request`: a
//! fresh correlation uuid per call, published to the shared request queue
//! alongside the caller's own response-queue name, then consumed back off
//! that response queue with a 10-minute inactivity heartbeat, nacking (here:
//! silently discarding) anything whose uuid doesn't match.
//!
//! The broker itself is out of scope (spec §1); [`BusForumProxy`] expresses
//! the queue protocol entirely in terms of [`crate::bus::EventBus`], so the
//! same in-memory bus used for lifecycle events doubles as the request/
//! response transport in tests and single-process operation.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

use crate::bus::EventBus;

pub const REQUEST_TOPIC: &str = "forum_proxy.request";
const INACTIVITY_TIMEOUT: Duration = Duration::from_secs(600);

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("no response received within the inactivity timeout")]
    Timeout,
    #[error("forum proxy bridge is gone")]
    BridgeClosed,
}

#[derive(Debug, Clone)]
pub struct ProxyResponse {
    pub kind: String,
    pub info: Value,
}

impl ProxyResponse {
    /// §4.4: a response whose `type` isn't `"copy"` is a non-fatal
    /// informational condition — callers treat it as "no data".
    pub fn data(&self) -> Option<&Value> {
        (self.kind == "copy").then_some(&self.info)
    }
}

/// The out-of-scope forum API, reached only through this request/reply
/// protocol (spec §1, §4.4).
#[async_trait]
pub trait ForumProxyClient: Send + Sync {
    async fn send_request(&self, request_type: &str, args: Value) -> Result<ProxyResponse, ProxyError>;
}

/// A worker's bridge handle: its own response-queue topic (named by
/// `worker_id`) and boot timestamp (`version`), used so the real proxy can
/// drop requests whose response queue has since been torn down.
pub struct BusForumProxy {
    bus: std::sync::Arc<dyn EventBus>,
    worker_id: String,
    version: i64,
}

impl BusForumProxy {
    pub fn new(bus: std::sync::Arc<dyn EventBus>, worker_id: impl Into<String>, version: i64) -> Self {
        Self { bus, worker_id: worker_id.into(), version }
    }

    fn response_topic(&self) -> String {
        format!("forum_proxy.response.{}", self.worker_id)
    }
}

#[async_trait]
impl ForumProxyClient for BusForumProxy {
    async fn send_request(&self, request_type: &str, args: Value) -> Result<ProxyResponse, ProxyError> {
        let response_topic = self.response_topic();
        let mut sub = self.bus.subscribe(&response_topic);

        let msg_uuid = Uuid::new_v4().to_string();
        let envelope = serde_json::json!({
            "type": request_type,
            "response_queue": response_topic,
            "uuid": msg_uuid,
            "version_utc_seconds": self.version,
            "sent_at": chrono::Utc::now().timestamp(),
            "args": args,
        });
        self.bus
            .publish(REQUEST_TOPIC, envelope)
            .await
            .map_err(|_| ProxyError::BridgeClosed)?;

        loop {
            let next = tokio::time::timeout(INACTIVITY_TIMEOUT, sub.recv()).await;
            let (_, body) = match next {
                Ok(Some(msg)) => msg,
                Ok(None) => return Err(ProxyError::BridgeClosed),
                Err(_) => {
                    tracing::error!(uuid = %msg_uuid, request_type, "no response within inactivity timeout");
                    return Err(ProxyError::Timeout);
                }
            };

            let Some(got_uuid) = body.get("uuid").and_then(|v| v.as_str()) else { continue };
            if got_uuid != msg_uuid {
                tracing::debug!(got_uuid, expected = %msg_uuid, "ignoring stale proxy response");
                continue;
            }

            let kind = body.get("type").and_then(|v| v.as_str()).unwrap_or("").to_string();
            let info = body.get("info").cloned().unwrap_or(Value::Null);
            return Ok(ProxyResponse { kind, info });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::InMemoryEventBus;
    use serde_json::json;
    use std::sync::Arc;

    #[tokio::test]
    async fn round_trips_a_matching_response() {
        let bus: Arc<dyn EventBus> = Arc::new(InMemoryEventBus::new());
        let proxy = BusForumProxy::new(bus.clone(), "scanner", 1);

        let responder_bus = bus.clone();
        let responder = tokio::spawn(async move {
            let mut req_sub = responder_bus.subscribe(REQUEST_TOPIC);
            let (_, req) = req_sub.recv().await.unwrap();
            let response_queue = req["response_queue"].as_str().unwrap().to_string();
            let uuid = req["uuid"].as_str().unwrap().to_string();
            responder_bus
                .publish(&response_queue, json!({"uuid": uuid, "type": "copy", "info": {"ok": true}}))
                .await
                .unwrap();
        });

        let response = proxy.send_request("show_user", json!({"username": "alice"})).await.unwrap();
        responder.await.unwrap();
        assert_eq!(response.kind, "copy");
        assert_eq!(response.data().unwrap()["ok"], true);
    }

    #[tokio::test]
    async fn mismatched_uuid_is_ignored_until_the_real_one_arrives() {
        let bus: Arc<dyn EventBus> = Arc::new(InMemoryEventBus::new());
        let proxy = BusForumProxy::new(bus.clone(), "scanner2", 1);

        let responder_bus = bus.clone();
        let responder = tokio::spawn(async move {
            let mut req_sub = responder_bus.subscribe(REQUEST_TOPIC);
            let (_, req) = req_sub.recv().await.unwrap();
            let response_queue = req["response_queue"].as_str().unwrap().to_string();
            let real_uuid = req["uuid"].as_str().unwrap().to_string();
            responder_bus
                .publish(&response_queue, json!({"uuid": "not-it", "type": "copy", "info": {}}))
                .await
                .unwrap();
            responder_bus
                .publish(&response_queue, json!({"uuid": real_uuid, "type": "copy", "info": {"ok": true}}))
                .await
                .unwrap();
        });

        let response = proxy.send_request("show_user", json!({})).await.unwrap();
        responder.await.unwrap();
        assert_eq!(response.data().unwrap()["ok"], true);
    }

    #[tokio::test]
    async fn non_copy_response_surfaces_as_no_data() {
        let bus: Arc<dyn EventBus> = Arc::new(InMemoryEventBus::new());
        let proxy = BusForumProxy::new(bus.clone(), "scanner3", 1);

        let responder_bus = bus.clone();
        let responder = tokio::spawn(async move {
            let mut req_sub = responder_bus.subscribe(REQUEST_TOPIC);
            let (_, req) = req_sub.recv().await.unwrap();
            let response_queue = req["response_queue"].as_str().unwrap().to_string();
            let uuid = req["uuid"].as_str().unwrap().to_string();
            responder_bus
                .publish(&response_queue, json!({"uuid": uuid, "type": "error", "info": {}}))
                .await
                .unwrap();
        });

        let response = proxy.send_request("show_user", json!({})).await.unwrap();
        responder.await.unwrap();
        assert!(response.data().is_none());
    }
}
