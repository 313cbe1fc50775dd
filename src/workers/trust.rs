//! Trust-queue and recheck-permission reactions to `loans.paid`.
//!
//! Grounded on `original_source/src/runners/trust_loan_delays.py`,
//! `lender_queue_trusts.py` and `recheck_permission.py`. All three watch the
//! same event and only ever grant standing, never revoke it, so they're kept
//! as three independent handlers on the same subscription rather than one
//! merged dispatcher — matching the original's one-runner-per-concern split.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;

use crate::bus::EventBus;
use crate::model::events::LoansPaid;
use crate::model::{Trust, TrustStatus};
use crate::perms::PRIMARY_SUBREDDIT;
use crate::proxy::ForumProxyClient;
use crate::queue::DelayedQueue;
use crate::signals::ShutdownToken;
use crate::store::Store;
use crate::templates::{self, TemplateStore};

const LENDER_QUEUE_TRUSTS_THRESHOLD: i64 = 15;
const RECHECK_PERMISSION: &str = "recheck";
const RECHECK_MINIMUM_COMPLETED_LOANS: i64 = 5;
const TRUST_QUEUE: &str = "trust";

/// `trust_loan_delays.py`: once a lender with a pending review delay reaches
/// its loan-count threshold, drops the delay and re-queues them for review.
pub async fn trust_loan_delays_worker(
    store: Arc<dyn Store>,
    queue: Arc<dyn DelayedQueue>,
    bus: Arc<dyn EventBus>,
    shutdown: ShutdownToken,
    now_fn: impl Fn() -> i64,
) -> anyhow::Result<()> {
    let mut sub = bus.subscribe("loans.paid");
    loop {
        if shutdown.is_shutting_down() {
            return Ok(());
        }
        let Some((_, payload)) = sub.recv().await else { return Ok(()) };
        let guard = shutdown.delay();

        if let Err(err) = handle_trust_loan_delay(&store, &queue, &payload, now_fn()).await {
            tracing::warn!(?err, "trust_loan_delays handler failed");
        }

        if guard.was_already_shutting_down() {
            return Ok(());
        }
    }
}

async fn handle_trust_loan_delay(store: &Arc<dyn Store>, queue: &Arc<dyn DelayedQueue>, payload: &Value, now: i64) -> anyhow::Result<()> {
    let event: LoansPaid = serde_json::from_value(payload.clone())?;

    let Some(delay) = store.get_trust_loan_delay(event.lender.id).await? else {
        return Ok(());
    };

    let completed = store.count_completed_as_lender(event.lender.id).await?;
    if completed < delay.threshold {
        return Ok(());
    }

    store.delete_trust_loan_delay(event.lender.id).await?;
    let due_at = delay.min_review_at.max(now);
    queue.enqueue(TRUST_QUEUE, due_at, serde_json::json!({"username": event.lender.username.to_lowercase()})).await;
    Ok(())
}

/// `lender_queue_trusts.py`: gives a lender an explicit `unknown` trust
/// status and queues them for review the first time they cross the
/// completed-as-lender threshold.
pub async fn lender_queue_trusts_worker(
    store: Arc<dyn Store>,
    proxy: Arc<dyn ForumProxyClient>,
    templates: Arc<dyn TemplateStore>,
    queue: Arc<dyn DelayedQueue>,
    bus: Arc<dyn EventBus>,
    shutdown: ShutdownToken,
    now_fn: impl Fn() -> i64,
) -> anyhow::Result<()> {
    let mut sub = bus.subscribe("loans.paid");
    loop {
        if shutdown.is_shutting_down() {
            return Ok(());
        }
        let Some((_, payload)) = sub.recv().await else { return Ok(()) };
        let guard = shutdown.delay();

        if let Err(err) = handle_lender_queue_trusts(&store, &proxy, &templates, &queue, &payload, now_fn()).await {
            tracing::warn!(?err, "lender_queue_trusts handler failed");
        }

        if guard.was_already_shutting_down() {
            return Ok(());
        }
    }
}

async fn handle_lender_queue_trusts(
    store: &Arc<dyn Store>,
    proxy: &Arc<dyn ForumProxyClient>,
    templates: &Arc<dyn TemplateStore>,
    queue: &Arc<dyn DelayedQueue>,
    payload: &Value,
    now: i64,
) -> anyhow::Result<()> {
    let event: LoansPaid = serde_json::from_value(payload.clone())?;

    if store.get_trust(event.lender.id).await?.is_some() {
        return Ok(());
    }

    let completed = store.count_completed_as_lender(event.lender.id).await?;
    if completed < LENDER_QUEUE_TRUSTS_THRESHOLD {
        return Ok(());
    }

    store
        .set_trust(&Trust { user_id: event.lender.id, status: TrustStatus::Unknown, reason: "Vetting required".to_string() })
        .await?;
    queue.enqueue(TRUST_QUEUE, now, serde_json::json!({"username": event.lender.username.to_lowercase()})).await;

    let mut params = HashMap::new();
    params.insert("username", event.lender.username.clone());
    if let Some((title, body)) = templates::render_letter(templates.as_ref(), "queue_trust_pm", &params) {
        proxy
            .send_request("compose", serde_json::json!({"recipient": format!("/r/{PRIMARY_SUBREDDIT}"), "subject": title, "body": body}))
            .await?;
    }
    Ok(())
}

/// `recheck_permission.py`: grants the `recheck` permission to a signed-up,
/// non-`bad`-trust lender once they've completed enough loans.
pub async fn recheck_permission_worker(
    store: Arc<dyn Store>,
    proxy: Arc<dyn ForumProxyClient>,
    templates: Arc<dyn TemplateStore>,
    bus: Arc<dyn EventBus>,
    shutdown: ShutdownToken,
    now_fn: impl Fn() -> i64,
) -> anyhow::Result<()> {
    let mut sub = bus.subscribe("loans.paid");
    loop {
        if shutdown.is_shutting_down() {
            return Ok(());
        }
        let Some((_, payload)) = sub.recv().await else { return Ok(()) };
        let guard = shutdown.delay();

        if let Err(err) = handle_recheck_permission(&store, &proxy, &templates, &payload, now_fn()).await {
            tracing::warn!(?err, "recheck_permission handler failed");
        }

        if guard.was_already_shutting_down() {
            return Ok(());
        }
    }
}

async fn handle_recheck_permission(store: &Arc<dyn Store>, proxy: &Arc<dyn ForumProxyClient>, templates: &Arc<dyn TemplateStore>, payload: &Value, _now: i64) -> anyhow::Result<()> {
    let event: LoansPaid = serde_json::from_value(payload.clone())?;

    if let Some(trust) = store.get_trust(event.lender.id).await? {
        if trust.status == TrustStatus::Bad {
            return Ok(());
        }
    }

    // auth_method_id == user_id: see DESIGN.md for the password_authentications simplification.
    if !store.is_account_claimed(event.lender.id).await? {
        return Ok(());
    }

    if store.get_permission_grant(event.lender.id, RECHECK_PERMISSION).await?.is_some() {
        return Ok(());
    }

    let completed = store.count_completed_as_lender(event.lender.id).await?;
    if completed < RECHECK_MINIMUM_COMPLETED_LOANS {
        return Ok(());
    }

    store.insert_permission_grant(event.lender.id, RECHECK_PERMISSION).await?;

    let mut params = HashMap::new();
    params.insert("username", event.lender.username.clone());
    if let Some((title, body)) = templates::render_letter(templates.as_ref(), "user_granted_recheck_pm", &params) {
        proxy
            .send_request("compose", serde_json::json!({"recipient": event.lender.username, "subject": title, "body": body}))
            .await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::events::{CommentDescriptor, MoneyPayload, UserDescriptor};
    use crate::proxy::ProxyResponse;
    use crate::queue::InMemoryDelayedQueue;
    use crate::store::sqlite::SqliteStore;
    use crate::templates::StaticTemplateStore;
    use async_trait::async_trait;
    use std::sync::Mutex;

    struct RecordingProxy {
        sent: Mutex<Vec<(String, Value)>>,
    }

    #[async_trait]
    impl ForumProxyClient for RecordingProxy {
        async fn send_request(&self, request_type: &str, args: Value) -> Result<ProxyResponse, crate::proxy::ProxyError> {
            self.sent.lock().unwrap().push((request_type.to_string(), args));
            Ok(ProxyResponse { kind: "copy".into(), info: serde_json::json!({}) })
        }
    }

    fn paid_event(lender_id: i64, was_unpaid: bool) -> Value {
        serde_json::to_value(LoansPaid {
            loan_id: 1,
            lender: UserDescriptor { id: lender_id, username: "lender".into() },
            borrower: UserDescriptor { id: 2, username: "borrower".into() },
            amount: MoneyPayload { minor: 1000, currency: "USD".into(), exp: 2, symbol: Some("$".into()), symbol_on_left: true },
            was_unpaid,
        })
        .unwrap()
    }

    #[tokio::test]
    async fn trust_loan_delay_fires_only_once_threshold_reached() {
        let store: Arc<dyn Store> = Arc::new(SqliteStore::open_in_memory().unwrap());
        let lender = store.find_or_create_user("lender").await.unwrap();
        store.set_trust_loan_delay(lender.id, 3, 500).await.unwrap();
        let queue: Arc<dyn DelayedQueue> = Arc::new(InMemoryDelayedQueue::new());

        let payload = paid_event(lender.id, false);
        handle_trust_loan_delay(&store, &queue, &payload, 100).await.unwrap();
        assert!(queue.drain_due(TRUST_QUEUE, 1_000).await.is_empty());
        assert!(store.get_trust_loan_delay(lender.id).await.unwrap().is_some());

        let currency = store.find_or_create_currency("USD").await.unwrap();
        let principal = store.create_money(currency.id, 100, 100).await.unwrap();
        let repaid = store.create_money(currency.id, 100, 100).await.unwrap();
        for i in 0..3 {
            let loan = store.create_loan(lender.id, 2, principal.id, repaid.id, i).await.unwrap();
            store.set_loan_repaid_at(loan.id, Some(i + 1)).await.unwrap();
        }

        handle_trust_loan_delay(&store, &queue, &payload, 100).await.unwrap();
        assert!(store.get_trust_loan_delay(lender.id).await.unwrap().is_none());
        let due = queue.drain_due(TRUST_QUEUE, 1_000).await;
        assert_eq!(due.len(), 1);
        assert_eq!(due[0]["username"], "lender");
    }

    #[tokio::test]
    async fn lender_queue_trusts_requires_threshold_and_no_existing_entry() {
        let store: Arc<dyn Store> = Arc::new(SqliteStore::open_in_memory().unwrap());
        let lender = store.find_or_create_user("lender").await.unwrap();
        let currency = store.find_or_create_currency("USD").await.unwrap();
        let principal = store.create_money(currency.id, 100, 100).await.unwrap();
        let repaid = store.create_money(currency.id, 100, 100).await.unwrap();
        for i in 0..LENDER_QUEUE_TRUSTS_THRESHOLD {
            let loan = store.create_loan(lender.id, 2, principal.id, repaid.id, i).await.unwrap();
            store.set_loan_repaid_at(loan.id, Some(i + 1)).await.unwrap();
        }

        let proxy = Arc::new(RecordingProxy { sent: Mutex::new(Vec::new()) });
        let templates: Arc<dyn TemplateStore> = Arc::new(StaticTemplateStore::new());
        let queue: Arc<dyn DelayedQueue> = Arc::new(InMemoryDelayedQueue::new());
        let payload = paid_event(lender.id, false);

        handle_lender_queue_trusts(&store, &(proxy.clone() as Arc<dyn ForumProxyClient>), &templates, &queue, &payload, 1_000).await.unwrap();
        assert!(store.get_trust(lender.id).await.unwrap().is_some());
        assert_eq!(queue.drain_due(TRUST_QUEUE, 1_000).await.len(), 1);
        assert!(proxy.sent.lock().unwrap().iter().any(|(k, _)| k == "compose"));

        // a second loans.paid event should be a no-op now that a trust entry exists
        proxy.sent.lock().unwrap().clear();
        handle_lender_queue_trusts(&store, &(proxy.clone() as Arc<dyn ForumProxyClient>), &templates, &queue, &payload, 2_000).await.unwrap();
        assert!(proxy.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn recheck_permission_requires_claimed_account_and_completed_loans() {
        let store: Arc<dyn Store> = Arc::new(SqliteStore::open_in_memory().unwrap());
        let lender = store.find_or_create_user("lender").await.unwrap();
        let proxy = Arc::new(RecordingProxy { sent: Mutex::new(Vec::new()) });
        let templates: Arc<dyn TemplateStore> = Arc::new(StaticTemplateStore::new());
        let payload = paid_event(lender.id, false);

        // not claimed yet: no-op
        handle_recheck_permission(&store, &(proxy.clone() as Arc<dyn ForumProxyClient>), &templates, &payload, 0).await.unwrap();
        assert!(proxy.sent.lock().unwrap().is_empty());

        store.mark_account_claimed(lender.id).await.unwrap();
        let currency = store.find_or_create_currency("USD").await.unwrap();
        let principal = store.create_money(currency.id, 100, 100).await.unwrap();
        let repaid = store.create_money(currency.id, 100, 100).await.unwrap();
        for i in 0..RECHECK_MINIMUM_COMPLETED_LOANS {
            let loan = store.create_loan(lender.id, 2, principal.id, repaid.id, i).await.unwrap();
            store.set_loan_repaid_at(loan.id, Some(i + 1)).await.unwrap();
        }

        handle_recheck_permission(&store, &(proxy.clone() as Arc<dyn ForumProxyClient>), &templates, &payload, 0).await.unwrap();
        assert!(store.get_permission_grant(lender.id, RECHECK_PERMISSION).await.unwrap().is_some());
        assert!(proxy.sent.lock().unwrap().iter().any(|(k, _)| k == "compose"));

        proxy.sent.lock().unwrap().clear();
        handle_recheck_permission(&store, &(proxy.clone() as Arc<dyn ForumProxyClient>), &templates, &payload, 0).await.unwrap();
        assert!(proxy.sent.lock().unwrap().is_empty());
    }
}
