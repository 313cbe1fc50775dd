//! Event bus & worker harness scaffolding (C7).
//!
//! The broker itself is out of scope per spec §1 — "defined below only by
//! the interface the core consumes." [`EventBus`] is that interface;
//! [`InMemoryEventBus`] is the only concrete adapter, sufficient for
//! single-process operation and for tests. Swapping in a real AMQP/NATS
//! client is an adapter-only change with no change to any worker.

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::broadcast;

/// A topic exchange carrying routing keys like `loans.create`, `modlog.banuser`.
#[async_trait]
pub trait EventBus: Send + Sync {
    async fn publish(&self, topic: &str, payload: Value) -> anyhow::Result<()>;

    /// Binds an exclusive anonymous queue to `pattern` (`modlog.*` style
    /// single-level wildcard suffix, or an exact topic).
    fn subscribe(&self, pattern: &str) -> Subscription;
}

/// A long-lived subscriber's view of the bus: a 10-minute inactivity
/// heartbeat wraps `recv` at the worker harness level (§4.7), not here.
pub struct Subscription {
    pattern: String,
    rx: broadcast::Receiver<(String, Value)>,
}

impl Subscription {
    /// Waits for the next message whose topic matches this subscription's
    /// pattern, skipping others. Returns `None` only if the bus itself is
    /// gone (all senders dropped).
    pub async fn recv(&mut self) -> Option<(String, Value)> {
        loop {
            match self.rx.recv().await {
                Ok((topic, payload)) => {
                    if topic_matches(&self.pattern, &topic) {
                        return Some((topic, payload));
                    }
                }
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

fn topic_matches(pattern: &str, topic: &str) -> bool {
    match pattern.strip_suffix(".*") {
        Some(prefix) => topic.starts_with(prefix) && topic[prefix.len()..].starts_with('.'),
        None => pattern == topic,
    }
}

/// `tokio::sync::broadcast`-backed bus. Every subscriber receives every
/// publish and filters by its own pattern; lagged subscribers silently skip
/// ahead rather than erroring, matching an at-least-once, order-agnostic
/// broker (§5: "events on the bus carry no global ordering guarantee").
pub struct InMemoryEventBus {
    tx: broadcast::Sender<(String, Value)>,
}

impl InMemoryEventBus {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(1024);
        Self { tx }
    }
}

impl Default for InMemoryEventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EventBus for InMemoryEventBus {
    async fn publish(&self, topic: &str, payload: Value) -> anyhow::Result<()> {
        // No receivers is not an error: a topic with no subscribers yet is normal.
        let _ = self.tx.send((topic.to_string(), payload));
        Ok(())
    }

    fn subscribe(&self, pattern: &str) -> Subscription {
        Subscription { pattern: pattern.to_string(), rx: self.tx.subscribe() }
    }
}
