//! Delayed queue: a "do this later" mailbox for workers that need to defer
//! an action past the current critical section (§3's "Delayed queue entry"
//! collaborator: `(queue, due_at, payload)`).
//!
//! `trust_loan_delays` is the one consumer today: it stores a lender's next
//! review as a due-at timestamp rather than acting immediately, and
//! `lender_queue_trusts` drains whatever has come due.
//!
//! Grounded on [`crate::cache::TtlCache`]'s `Mutex<HashMap<..>>` shape,
//! generalized to a per-queue ordered list instead of single keyed values.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;

/// A named FIFO-by-due-date mailbox of JSON payloads.
#[async_trait]
pub trait DelayedQueue: Send + Sync {
    async fn enqueue(&self, queue: &str, due_at: i64, payload: serde_json::Value);
    /// Removes and returns every entry in `queue` with `due_at <= now`,
    /// oldest due first.
    async fn drain_due(&self, queue: &str, now: i64) -> Vec<serde_json::Value>;
}

struct QueueEntry {
    due_at: i64,
    payload: serde_json::Value,
}

/// In-process delayed queue. Sufficient for single-node operation and for
/// tests; a real deployment would back this with a persistent broker queue.
pub struct InMemoryDelayedQueue {
    queues: Mutex<HashMap<String, Vec<QueueEntry>>>,
}

impl InMemoryDelayedQueue {
    pub fn new() -> Self {
        Self {
            queues: Mutex::new(HashMap::new()),
        }
    }
}

impl Default for InMemoryDelayedQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DelayedQueue for InMemoryDelayedQueue {
    async fn enqueue(&self, queue: &str, due_at: i64, payload: serde_json::Value) {
        let mut queues = self.queues.lock().unwrap();
        queues.entry(queue.to_string()).or_default().push(QueueEntry { due_at, payload });
    }

    async fn drain_due(&self, queue: &str, now: i64) -> Vec<serde_json::Value> {
        let mut queues = self.queues.lock().unwrap();
        let Some(entries) = queues.get_mut(queue) else {
            return Vec::new();
        };
        entries.sort_by_key(|e| e.due_at);
        let split_at = entries.partition_point(|e| e.due_at <= now);
        entries.drain(..split_at).map(|e| e.payload).collect()
    }
}
