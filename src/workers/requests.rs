//! Borrower-request notices and default-permission grants on signup.
//!
//! Grounded on `original_source/src/runners/borrower_request.py` (notify
//! every distinct lender of a requesting borrower's open loans, unless that
//! lender opted out) and `original_source/src/runners/default_permissions.py`
//! (grant a configured permission list to a newly signed-up user's human
//! auth method).

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;

use crate::bus::EventBus;
use crate::cache::Cache;
use crate::model::events::{LoansRequest, UserSignup};
use crate::proxy::ForumProxyClient;
use crate::signals::ShutdownToken;
use crate::store::Store;
use crate::templates::{self, TemplateStore};

/// Per-lender opt-out flag for borrower-request PMs. Not part of the owned
/// namespaces in spec §5 (it's a user-settings concern external to the
/// ledger); kept in the shared cache rather than inventing a settings table
/// — see DESIGN.md.
fn opt_out_cache_key(user_id: crate::model::UserId) -> String {
    format!("loansbot/settings/borrower_req_pm_opt_out/{user_id}")
}

async fn has_opted_out(cache: &dyn Cache, user_id: crate::model::UserId) -> bool {
    cache.get(&opt_out_cache_key(user_id)).await.as_deref() == Some("1")
}

/// `borrower_request.py`: for each distinct lender of the requesting
/// borrower's currently-open loans, PM them the borrower's history with
/// them — unless that lender has opted out.
pub async fn borrower_request_worker(
    store: Arc<dyn Store>,
    proxy: Arc<dyn ForumProxyClient>,
    templates: Arc<dyn TemplateStore>,
    cache: Arc<dyn Cache>,
    bus: Arc<dyn EventBus>,
    shutdown: ShutdownToken,
) -> anyhow::Result<()> {
    let mut sub = bus.subscribe("loans.request");
    loop {
        if shutdown.is_shutting_down() {
            return Ok(());
        }
        let Some((_, payload)) = sub.recv().await else { return Ok(()) };
        let guard = shutdown.delay();

        if let Err(err) = handle_borrower_request(&store, &proxy, &templates, &cache, &payload).await {
            tracing::warn!(?err, "borrower_request handler failed");
        }

        if guard.was_already_shutting_down() {
            return Ok(());
        }
    }
}

async fn handle_borrower_request(
    store: &Arc<dyn Store>,
    proxy: &Arc<dyn ForumProxyClient>,
    templates: &Arc<dyn TemplateStore>,
    cache: &Arc<dyn Cache>,
    payload: &Value,
) -> anyhow::Result<()> {
    let event: LoansRequest = serde_json::from_value(payload.clone())?;

    let Some(borrower) = store.get_user_by_name(&event.post.author).await? else {
        tracing::trace!(author = %event.post.author, "loan request from a user with no loan history, ignoring");
        return Ok(());
    };

    let open_loans: Vec<_> = store
        .list_loans_as_borrower(borrower.id)
        .await?
        .into_iter()
        .filter(|l| l.is_open())
        .collect();
    if open_loans.is_empty() {
        return Ok(());
    }

    let mut by_lender: HashMap<crate::model::UserId, Vec<crate::model::Loan>> = HashMap::new();
    for loan in open_loans {
        by_lender.entry(loan.lender_id).or_default().push(loan);
    }

    let thread = format!(
        "https://reddit.com/r/{}/comments/{}/redditloans",
        event.post.subreddit,
        event.post.fullname.strip_prefix("t3_").unwrap_or(&event.post.fullname)
    );

    for (lender_id, loans) in by_lender {
        if has_opted_out(cache.as_ref(), lender_id).await {
            tracing::trace!(lender_id, "not sending borrower_request alert - opted out");
            continue;
        }
        let Some(lender) = store.get_user(lender_id).await? else { continue };

        let mut views = Vec::with_capacity(loans.len());
        for loan in &loans {
            let principal = store.get_money(loan.principal_id).await?;
            let repaid = store.get_money(loan.principal_repaid_id).await?;
            let currency = match &principal {
                Some(p) => store.get_currency(p.currency_id).await?,
                None => None,
            };
            let (symbol, left) = currency.as_ref().map(|c| (c.symbol.clone(), c.symbol_on_left)).unwrap_or((None, false));
            let code = currency.map(|c| c.code).unwrap_or_else(|| "USD".to_string());
            let render = |minor: i64| -> String {
                crate::money::Money::new(minor, &code).map(|m| m.with_display(symbol.clone(), left).display()).unwrap_or_default()
            };
            views.push(templates::LoanView {
                id: Some(loan.id),
                lender: lender.username.clone(),
                borrower: borrower.username.clone(),
                principal: principal.map(|p| render(p.amount_minor)).unwrap_or_default(),
                principal_repayment: repaid.map(|r| render(r.amount_minor)).unwrap_or_default(),
                permalink: String::new(),
                created_at: loan.created_at,
                repaid_at: loan.repaid_at,
                unpaid_at: loan.unpaid_at,
            });
        }

        let mut params = HashMap::new();
        params.insert("lender_username", lender.username.clone());
        params.insert("borrower_username", borrower.username.clone());
        params.insert("thread", thread.clone());
        params.insert("loans", templates::format_loan_table(&views, true));

        let Some(body) = templates::render(templates.as_ref(), "borrower_request", &params) else {
            continue;
        };

        proxy
            .send_request(
                "compose",
                serde_json::json!({
                    "recipient": lender.username,
                    "subject": format!("/u/{} has made a request thread", borrower.username),
                    "body": body,
                }),
            )
            .await?;
    }
    Ok(())
}

/// `default_permissions.py`: grants every configured default permission to
/// a newly signed-up user's human auth method.
pub async fn default_permissions_worker(
    store: Arc<dyn Store>,
    default_permissions: Vec<String>,
    bus: Arc<dyn EventBus>,
    shutdown: ShutdownToken,
) -> anyhow::Result<()> {
    let mut sub = bus.subscribe("user.signup");
    loop {
        if shutdown.is_shutting_down() {
            return Ok(());
        }
        let Some((_, payload)) = sub.recv().await else { return Ok(()) };
        let guard = shutdown.delay();

        if let Err(err) = handle_default_permissions(&store, &default_permissions, &payload).await {
            tracing::warn!(?err, "default_permissions handler failed");
        }

        if guard.was_already_shutting_down() {
            return Ok(());
        }
    }
}

async fn handle_default_permissions(store: &Arc<dyn Store>, default_permissions: &[String], payload: &Value) -> anyhow::Result<()> {
    let event: UserSignup = serde_json::from_value(payload.clone())?;

    if default_permissions.is_empty() {
        return Ok(());
    }
    if !store.is_account_claimed(event.user_id).await? {
        // Race: the auth method that triggered this signup hasn't landed yet.
        tracing::warn!(user_id = event.user_id, "user.signup fired before the claim was visible, skipping default permissions");
        return Ok(());
    }

    for permission in default_permissions {
        if store.get_permission_grant(event.user_id, permission).await?.is_none() {
            store.insert_permission_grant(event.user_id, permission).await?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::TtlCache;
    use crate::model::events::{RequestDetails, RequestPost};
    use crate::proxy::ProxyResponse;
    use crate::store::sqlite::SqliteStore;
    use crate::templates::StaticTemplateStore;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use std::time::Duration;

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

    fn request_event(author: &str) -> Value {
        serde_json::to_value(LoansRequest {
            post: RequestPost { author: author.to_string(), subreddit: "borrow".into(), fullname: "t3_abc".into(), title: "[REQ] $100".into() },
            request: RequestDetails::default(),
        })
        .unwrap()
    }

    #[tokio::test]
    async fn notifies_each_distinct_lender_with_open_loans() {
        let store: Arc<dyn Store> = Arc::new(SqliteStore::open_in_memory().unwrap());
        let borrower = store.find_or_create_user("borrower").await.unwrap();
        let lender1 = store.find_or_create_user("lender1").await.unwrap();
        let lender2 = store.find_or_create_user("lender2").await.unwrap();
        let currency = store.find_or_create_currency("USD").await.unwrap();
        let principal = store.create_money(currency.id, 1000, 1000).await.unwrap();
        let repaid = store.create_money(currency.id, 0, 0).await.unwrap();
        store.create_loan(lender1.id, borrower.id, principal.id, repaid.id, 0).await.unwrap();
        store.create_loan(lender2.id, borrower.id, principal.id, repaid.id, 0).await.unwrap();

        let proxy = Arc::new(RecordingProxy { sent: Mutex::new(Vec::new()) });
        let templates: Arc<dyn TemplateStore> = Arc::new(StaticTemplateStore::new());
        let cache: Arc<dyn Cache> = Arc::new(TtlCache::new());
        let payload = request_event("borrower");

        handle_borrower_request(&store, &(proxy.clone() as Arc<dyn ForumProxyClient>), &templates, &cache, &payload).await.unwrap();
        let sent = proxy.sent.lock().unwrap();
        assert_eq!(sent.iter().filter(|(k, _)| k == "compose").count(), 2);
    }

    #[tokio::test]
    async fn skips_a_lender_who_opted_out() {
        let store: Arc<dyn Store> = Arc::new(SqliteStore::open_in_memory().unwrap());
        let borrower = store.find_or_create_user("borrower").await.unwrap();
        let lender = store.find_or_create_user("lender1").await.unwrap();
        let currency = store.find_or_create_currency("USD").await.unwrap();
        let principal = store.create_money(currency.id, 1000, 1000).await.unwrap();
        let repaid = store.create_money(currency.id, 0, 0).await.unwrap();
        store.create_loan(lender.id, borrower.id, principal.id, repaid.id, 0).await.unwrap();

        let proxy = Arc::new(RecordingProxy { sent: Mutex::new(Vec::new()) });
        let templates: Arc<dyn TemplateStore> = Arc::new(StaticTemplateStore::new());
        let cache: Arc<dyn Cache> = Arc::new(TtlCache::new());
        cache.set(&opt_out_cache_key(lender.id), "1".to_string(), Duration::from_secs(60)).await;
        let payload = request_event("borrower");

        handle_borrower_request(&store, &(proxy.clone() as Arc<dyn ForumProxyClient>), &templates, &cache, &payload).await.unwrap();
        assert!(proxy.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn unknown_author_with_no_history_is_a_noop() {
        let store: Arc<dyn Store> = Arc::new(SqliteStore::open_in_memory().unwrap());
        let proxy = Arc::new(RecordingProxy { sent: Mutex::new(Vec::new()) });
        let templates: Arc<dyn TemplateStore> = Arc::new(StaticTemplateStore::new());
        let cache: Arc<dyn Cache> = Arc::new(TtlCache::new());
        let payload = request_event("ghost");

        handle_borrower_request(&store, &(proxy.clone() as Arc<dyn ForumProxyClient>), &templates, &cache, &payload).await.unwrap();
        assert!(proxy.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn grants_every_configured_default_permission_once() {
        let store: Arc<dyn Store> = Arc::new(SqliteStore::open_in_memory().unwrap());
        let user = store.find_or_create_user("alice").await.unwrap();
        store.mark_account_claimed(user.id).await.unwrap();
        let payload = serde_json::to_value(UserSignup { user_id: user.id }).unwrap();

        handle_default_permissions(&store, &["read".to_string(), "post".to_string()], &payload).await.unwrap();
        assert!(store.get_permission_grant(user.id, "read").await.unwrap().is_some());
        assert!(store.get_permission_grant(user.id, "post").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn unclaimed_account_is_skipped() {
        let store: Arc<dyn Store> = Arc::new(SqliteStore::open_in_memory().unwrap());
        let user = store.find_or_create_user("alice").await.unwrap();
        let payload = serde_json::to_value(UserSignup { user_id: user.id }).unwrap();

        handle_default_permissions(&store, &["read".to_string()], &payload).await.unwrap();
        assert!(store.get_permission_grant(user.id, "read").await.unwrap().is_none());
    }
}
