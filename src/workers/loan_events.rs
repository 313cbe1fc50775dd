//! Reactions to `loans.create`/`loans.paid`/`loans.unpaid` that aren't the
//! ledger's own job: first-loan alerts, lender-gone-borrower scrutiny,
//! automatic bans/unbans on default, and thread flairing.
//!
//! Grounded on `original_source/src/runners/new_lender.py`, `lender_loan.py`,
//! `ban_unpaid.py`, `unban_repaid.py` and `flair_loan_threads_completed.py`.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;

use crate::bus::EventBus;
use crate::ledger::Ledger;
use crate::model::events::{LoansCreate, LoansPaid};
use crate::model::Loan;
use crate::money::Money;
use crate::perms::{PermissionCache, PRIMARY_SUBREDDIT};
use crate::proxy::ForumProxyClient;
use crate::signals::ShutdownToken;
use crate::store::Store;
use crate::templates::{self, LoanView, TemplateStore};

const LENDERSCAMP_SUBREDDIT: &str = "lenderscamp";
const SUMMARY_TABLE_THRESHOLD: usize = 5;

/// Mirrors `summons::build_loan_views` (private to that module): joins a
/// loan list up to display strings for [`templates::format_loan_table`].
async fn build_loan_views(store: &dyn Store, loans: &[Loan]) -> anyhow::Result<Vec<LoanView>> {
    let mut views = Vec::with_capacity(loans.len());
    for loan in loans {
        let lender = store.get_user(loan.lender_id).await?;
        let borrower = store.get_user(loan.borrower_id).await?;
        let principal = store.get_money(loan.principal_id).await?;
        let repaid = store.get_money(loan.principal_repaid_id).await?;
        let currency = match &principal {
            Some(p) => store.get_currency(p.currency_id).await?,
            None => None,
        };
        let (symbol, left) = currency.as_ref().map(|c| (c.symbol.clone(), c.symbol_on_left)).unwrap_or((None, false));
        let code = currency.map(|c| c.code).unwrap_or_else(|| "USD".to_string());
        let render_amount = |minor: i64| -> String { Money::new(minor, &code).map(|m| m.with_display(symbol.clone(), left).display()).unwrap_or_default() };

        views.push(LoanView {
            id: Some(loan.id),
            lender: lender.map(|u| u.username).unwrap_or_default(),
            borrower: borrower.map(|u| u.username).unwrap_or_default(),
            principal: principal.map(|p| render_amount(p.amount_minor)).unwrap_or_default(),
            principal_repayment: repaid.map(|r| render_amount(r.amount_minor)).unwrap_or_default(),
            permalink: String::new(),
            created_at: loan.created_at,
            repaid_at: loan.repaid_at,
            unpaid_at: loan.unpaid_at,
        });
    }
    Ok(views)
}

/// `loan_format_helper.get_and_format_all_or_summary`'s table-or-summary
/// rendering, as embedded in the lender_loan modmail body.
async fn format_loan_history(store: &Arc<dyn Store>, ledger: &Arc<Ledger>, user_id: crate::model::UserId, username: &str, now: i64) -> anyhow::Result<String> {
    let (loans, summary) = ledger.get_and_format_all_or_summary(user_id, SUMMARY_TABLE_THRESHOLD, now).await?;
    Ok(match summary {
        None => {
            let views = build_loan_views(store.as_ref(), &loans).await?;
            templates::format_loan_table(&views, true)
        }
        Some(summary) => templates::format_summary(username, &summary),
    })
}

/// `new_lender.py`: alerts `/r/borrow` modmail the first time someone lends.
pub async fn new_lender_worker(
    store: Arc<dyn Store>,
    proxy: Arc<dyn ForumProxyClient>,
    templates: Arc<dyn TemplateStore>,
    bus: Arc<dyn EventBus>,
    shutdown: ShutdownToken,
) -> anyhow::Result<()> {
    let mut sub = bus.subscribe("loans.create");
    loop {
        if shutdown.is_shutting_down() {
            return Ok(());
        }
        let Some((_, payload)) = sub.recv().await else { return Ok(()) };
        let guard = shutdown.delay();

        if let Err(err) = handle_new_lender(&store, &proxy, &templates, &payload).await {
            tracing::warn!(?err, "new_lender handler failed");
        }

        if guard.was_already_shutting_down() {
            return Ok(());
        }
    }
}

async fn handle_new_lender(store: &Arc<dyn Store>, proxy: &Arc<dyn ForumProxyClient>, templates: &Arc<dyn TemplateStore>, payload: &Value) -> anyhow::Result<()> {
    let event: LoansCreate = serde_json::from_value(payload.clone())?;

    // The just-created loan is itself already counted; zero means this is
    // the lender's first loan ever.
    let total_as_lender = store.count_loans_as_lender(event.lender.id).await?;
    if total_as_lender > 1 {
        return Ok(());
    }

    let mut params = HashMap::new();
    params.insert("lender_username", event.lender.username.clone());
    params.insert("borrower_username", event.borrower.username.clone());
    params.insert("amount", format!("{}{}", event.amount.currency, event.amount.minor));
    params.insert("permalink", event.permalink.clone());
    let Some(body) = templates::render(templates.as_ref(), "new_lender", &params) else {
        return Ok(());
    };

    proxy
        .send_request(
            "compose",
            serde_json::json!({
                "recipient": format!("/r/{PRIMARY_SUBREDDIT}"),
                "subject": format!("New Lender: /u/{}", event.lender.username),
                "body": body,
            }),
        )
        .await?;
    Ok(())
}

/// `lender_loan.py`: when a loan's *borrower* has lending history of their
/// own, alert `/r/borrow` modmail and strip their `/r/lenderscamp` standing
/// unless they're a moderator or approved submitter there.
pub async fn lender_loan_worker(
    store: Arc<dyn Store>,
    ledger: Arc<Ledger>,
    proxy: Arc<dyn ForumProxyClient>,
    perms: Arc<PermissionCache>,
    templates: Arc<dyn TemplateStore>,
    bus: Arc<dyn EventBus>,
    shutdown: ShutdownToken,
    now_fn: impl Fn() -> i64,
) -> anyhow::Result<()> {
    let mut sub = bus.subscribe("loans.create");
    loop {
        if shutdown.is_shutting_down() {
            return Ok(());
        }
        let Some((_, payload)) = sub.recv().await else { return Ok(()) };
        let guard = shutdown.delay();

        if let Err(err) = handle_lender_loan(&store, &ledger, &proxy, &perms, &templates, &payload, now_fn()).await {
            tracing::warn!(?err, "lender_loan handler failed");
        }

        if guard.was_already_shutting_down() {
            return Ok(());
        }
    }
}

async fn handle_lender_loan(
    store: &Arc<dyn Store>,
    ledger: &Arc<Ledger>,
    proxy: &Arc<dyn ForumProxyClient>,
    perms: &Arc<PermissionCache>,
    templates: &Arc<dyn TemplateStore>,
    payload: &Value,
    now: i64,
) -> anyhow::Result<()> {
    let event: LoansCreate = serde_json::from_value(payload.clone())?;

    let borrower_loans_as_lender = store.count_loans_as_lender(event.borrower.id).await?;
    if borrower_loans_as_lender == 0 {
        return Ok(());
    }

    let Some(info) = perms.fetch_info(&event.borrower.username, now).await? else {
        return Ok(());
    };
    if info.moderator {
        return Ok(());
    }

    let loans_table = format_loan_history(store, ledger, event.borrower.id, &event.borrower.username, now).await?;

    let mut params = HashMap::new();
    params.insert("lender_username", event.lender.username.clone());
    params.insert("borrower_username", event.borrower.username.clone());
    params.insert("loan_id", event.loan_id.to_string());
    params.insert("loans_table", loans_table);

    if info.approved {
        if let Some((title, body)) = templates::render_letter(templates.as_ref(), "approved_lender_received_loan_modmail_pm", &params) {
            proxy
                .send_request("compose", serde_json::json!({"recipient": format!("/r/{PRIMARY_SUBREDDIT}"), "subject": title, "body": body}))
                .await?;
        }
        return Ok(());
    }

    if let Some((title, body)) = templates::render_letter(templates.as_ref(), "lender_received_loan_modmail_pm", &params) {
        proxy
            .send_request("compose", serde_json::json!({"recipient": format!("/r/{PRIMARY_SUBREDDIT}"), "subject": title, "body": body}))
            .await?;
    }

    let is_moderator_there = proxy
        .send_request("user_is_moderator", serde_json::json!({"subreddit": LENDERSCAMP_SUBREDDIT, "username": event.borrower.username}))
        .await?;
    if is_moderator_there.data().and_then(|v| v["moderator"].as_bool()).unwrap_or(false) {
        return Ok(());
    }

    let is_approved_there = proxy
        .send_request("user_is_approved", serde_json::json!({"subreddit": LENDERSCAMP_SUBREDDIT, "username": event.borrower.username}))
        .await?;
    if is_approved_there.data().and_then(|v| v["approved"].as_bool()).unwrap_or(false) {
        proxy
            .send_request("disapprove_user", serde_json::json!({"subreddit": LENDERSCAMP_SUBREDDIT, "username": event.borrower.username}))
            .await?;
    }
    Ok(())
}

/// `ban_unpaid.py`: auto-bans a borrower who defaults, unless they're a
/// moderator (skip) or approved submitter (PM only, no ban).
pub async fn ban_unpaid_worker(
    store: Arc<dyn Store>,
    proxy: Arc<dyn ForumProxyClient>,
    perms: Arc<PermissionCache>,
    templates: Arc<dyn TemplateStore>,
    bus: Arc<dyn EventBus>,
    shutdown: ShutdownToken,
    now_fn: impl Fn() -> i64,
) -> anyhow::Result<()> {
    let mut sub = bus.subscribe("loans.unpaid");
    loop {
        if shutdown.is_shutting_down() {
            return Ok(());
        }
        let Some((_, payload)) = sub.recv().await else { return Ok(()) };
        let guard = shutdown.delay();

        if let Err(err) = handle_ban_unpaid(&store, &proxy, &perms, &templates, &payload, now_fn()).await {
            tracing::warn!(?err, "ban_unpaid handler failed");
        }

        if guard.was_already_shutting_down() {
            return Ok(());
        }
    }
}

async fn handle_ban_unpaid(
    store: &Arc<dyn Store>,
    proxy: &Arc<dyn ForumProxyClient>,
    perms: &Arc<PermissionCache>,
    templates: &Arc<dyn TemplateStore>,
    payload: &Value,
    now: i64,
) -> anyhow::Result<()> {
    let event_id = payload.get("loan_unpaid_event_id").and_then(|v| v.as_i64());
    let Some(event_id) = event_id else {
        tracing::warn!(?payload, "loans.unpaid payload missing loan_unpaid_event_id");
        return Ok(());
    };
    let Some(unpaid_event) = store.get_unpaid_event(event_id).await? else {
        tracing::warn!(event_id, "unpaid event not found, skipping");
        return Ok(());
    };
    let Some(loan) = store.get_loan(unpaid_event.loan_id).await? else {
        return Ok(());
    };
    let (Some(borrower), Some(lender)) = (store.get_user(loan.borrower_id).await?, store.get_user(loan.lender_id).await?) else {
        return Ok(());
    };

    let Some(info) = perms.fetch_info(&borrower.username, now).await? else {
        return Ok(());
    };
    if info.banned || info.moderator {
        return Ok(());
    }

    if info.approved {
        proxy
            .send_request(
                "compose",
                serde_json::json!({
                    "recipient": format!("/r/{PRIMARY_SUBREDDIT}"),
                    "subject": "Approved Submitter Unpaid Loan",
                    "body": format!(
                        "/u/{} defaulted on a loan but did not get banned since they are an approved submitter.",
                        borrower.username
                    ),
                }),
            )
            .await?;
        return Ok(());
    }

    let mut params = HashMap::new();
    params.insert("lender_username", lender.username.clone());
    let message = templates::render(templates.as_ref(), "unpaid_ban_message", &params).unwrap_or_default();
    let note = templates::render(templates.as_ref(), "unpaid_ban_note", &params).unwrap_or_default();

    proxy
        .send_request(
            "ban_user",
            serde_json::json!({"subreddit": PRIMARY_SUBREDDIT, "username": borrower.username, "message": message, "note": note}),
        )
        .await?;
    perms.flush_cache(&borrower.username).await?;
    Ok(())
}

/// `unban_repaid.py`: lifts an unpaid-triggered ban once the borrower clears
/// every remaining unpaid loan.
pub async fn unban_repaid_worker(
    store: Arc<dyn Store>,
    proxy: Arc<dyn ForumProxyClient>,
    perms: Arc<PermissionCache>,
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

        if let Err(err) = handle_unban_repaid(&store, &proxy, &perms, &payload, now_fn()).await {
            tracing::warn!(?err, "unban_repaid handler failed");
        }

        if guard.was_already_shutting_down() {
            return Ok(());
        }
    }
}

async fn handle_unban_repaid(store: &Arc<dyn Store>, proxy: &Arc<dyn ForumProxyClient>, perms: &Arc<PermissionCache>, payload: &Value, now: i64) -> anyhow::Result<()> {
    let event: LoansPaid = serde_json::from_value(payload.clone())?;
    if !event.was_unpaid {
        return Ok(());
    }

    let Some(info) = perms.fetch_info(&event.borrower.username, now).await? else {
        return Ok(());
    };
    if !info.banned {
        return Ok(());
    }

    let still_unpaid = store.count_unpaid_as_borrower(event.borrower.id).await?;
    if still_unpaid > 0 {
        return Ok(());
    }

    proxy
        .send_request("unban_user", serde_json::json!({"subreddit": PRIMARY_SUBREDDIT, "username": event.borrower.username}))
        .await?;
    perms.flush_cache(&event.borrower.username.to_lowercase()).await?;
    Ok(())
}

const COMPLETED_FLAIR_CSS_CLASS: &str = "991c8042-3ecc-11e4-8052-12313d05258a";

/// `flair_loan_threads_completed.py`: flairs the originating thread as
/// completed once a loan is created against it.
pub async fn flair_loan_threads_completed_worker(
    proxy: Arc<dyn ForumProxyClient>,
    bus: Arc<dyn EventBus>,
    subreddit: String,
    shutdown: ShutdownToken,
) -> anyhow::Result<()> {
    let mut sub = bus.subscribe("loans.create");
    loop {
        if shutdown.is_shutting_down() {
            return Ok(());
        }
        let Some((_, payload)) = sub.recv().await else { return Ok(()) };
        let guard = shutdown.delay();

        if let Ok(event) = serde_json::from_value::<LoansCreate>(payload) {
            if let Err(err) = proxy
                .send_request(
                    "flair_link",
                    serde_json::json!({"subreddit": subreddit, "link_fullname": event.comment.link_fullname, "css_class": COMPLETED_FLAIR_CSS_CLASS}),
                )
                .await
            {
                tracing::warn!(?err, "failed to flair completed loan thread");
            }
        }

        if guard.was_already_shutting_down() {
            return Ok(());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::InMemoryEventBus;
    use crate::config::Config;
    use crate::model::events::{CommentDescriptor, MoneyPayload, UserDescriptor};
    use crate::proxy::ProxyResponse;
    use crate::store::sqlite::SqliteStore;
    use crate::templates::StaticTemplateStore;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use std::time::Duration;

    struct RecordingProxy {
        sent: Mutex<Vec<(String, Value)>>,
        scripted: HashMap<&'static str, Value>,
    }

    #[async_trait]
    impl ForumProxyClient for RecordingProxy {
        async fn send_request(&self, request_type: &str, args: Value) -> Result<ProxyResponse, crate::proxy::ProxyError> {
            self.sent.lock().unwrap().push((request_type.to_string(), args));
            let info = self.scripted.get(request_type).cloned().unwrap_or(serde_json::json!({}));
            Ok(ProxyResponse { kind: "copy".into(), info })
        }
    }

    fn cfg() -> Arc<Config> {
        Arc::new(Config {
            currency_layer_api_key: "k".into(),
            currency_layer_cache_time_seconds: 14_400,
            subreddits: vec!["borrow".into()],
            amqp_url: "".into(),
            amqp_reddit_proxy_queue: "".into(),
            amqp_response_queue_prefix: "".into(),
            memcached_host: "".into(),
            memcached_port: 0,
            karma_min: 0,
            comment_karma_min: 0,
            account_age_seconds_min: 0,
            ignored_users: vec![],
            default_permissions: vec![],
            mod_permissions: vec![],
            appname: "loansbot".into(),
            deprecated_endpoint_sunsets: vec![],
        })
    }

    fn make_event(lender_id: i64, borrower_id: i64, loan_id: i64) -> LoansCreate {
        LoansCreate {
            loan_id,
            comment: CommentDescriptor { link_fullname: "t3_x".into(), fullname: "t1_y".into() },
            lender: UserDescriptor { id: lender_id, username: "lender".into() },
            borrower: UserDescriptor { id: borrower_id, username: "borrower".into() },
            amount: MoneyPayload { minor: 1000, currency: "USD".into(), exp: 2, symbol: Some("$".into()), symbol_on_left: true },
            permalink: "https://example/1".into(),
        }
    }

    #[tokio::test]
    async fn new_lender_alerts_only_on_first_loan() {
        let store: Arc<dyn Store> = Arc::new(SqliteStore::open_in_memory().unwrap());
        let lender = store.find_or_create_user("lender").await.unwrap();
        let borrower = store.find_or_create_user("borrower").await.unwrap();
        let currency = store.find_or_create_currency("USD").await.unwrap();
        let principal = store.create_money(currency.id, 1000, 1000).await.unwrap();
        let repaid = store.create_money(currency.id, 0, 0).await.unwrap();
        let loan = store.create_loan(lender.id, borrower.id, principal.id, repaid.id, 0).await.unwrap();

        let proxy = Arc::new(RecordingProxy { sent: Mutex::new(Vec::new()), scripted: HashMap::new() });
        let templates: Arc<dyn TemplateStore> = Arc::new(StaticTemplateStore::new());
        let payload = serde_json::to_value(make_event(lender.id, borrower.id, loan.id)).unwrap();

        handle_new_lender(&store, &(proxy.clone() as Arc<dyn ForumProxyClient>), &templates, &payload).await.unwrap();
        assert!(proxy.sent.lock().unwrap().iter().any(|(k, _)| k == "compose"));

        // a second loan by the same lender should not alert again
        let loan2 = store.create_loan(lender.id, borrower.id, principal.id, repaid.id, 1).await.unwrap();
        proxy.sent.lock().unwrap().clear();
        let payload2 = serde_json::to_value(make_event(lender.id, borrower.id, loan2.id)).unwrap();
        handle_new_lender(&store, &(proxy.clone() as Arc<dyn ForumProxyClient>), &templates, &payload2).await.unwrap();
        assert!(proxy.sent.lock().unwrap().is_empty());
    }

    struct IdentityFx;
    #[async_trait]
    impl crate::money::fx::FxSource for IdentityFx {
        async fn fetch_rates(&self, _source: &str) -> anyhow::Result<std::collections::HashMap<String, f64>> {
            Ok(crate::money::SUPPORTED_CURRENCIES.iter().map(|c| (c.code.to_string(), 1.0)).collect())
        }
    }

    fn test_ledger(store: Arc<dyn Store>, bus: Arc<dyn EventBus>) -> Arc<Ledger> {
        let cache = Arc::new(crate::cache::TtlCache::new());
        let fx = Arc::new(crate::money::fx::FxCache::new(cache, Arc::new(IdentityFx), Duration::from_secs(60)));
        Arc::new(Ledger::new(store, fx, bus))
    }

    #[tokio::test]
    async fn lender_loan_skips_when_borrower_never_lent() {
        let store: Arc<dyn Store> = Arc::new(SqliteStore::open_in_memory().unwrap());
        let bus: Arc<dyn EventBus> = Arc::new(InMemoryEventBus::new());
        let lender = store.find_or_create_user("lender").await.unwrap();
        let borrower = store.find_or_create_user("borrower").await.unwrap();
        let ledger = test_ledger(store.clone(), bus);

        let proxy: Arc<dyn ForumProxyClient> = Arc::new(RecordingProxy { sent: Mutex::new(Vec::new()), scripted: HashMap::new() });
        let perms = Arc::new(PermissionCache::new(store.clone(), proxy.clone(), cfg()));
        let templates: Arc<dyn TemplateStore> = Arc::new(StaticTemplateStore::new());
        let payload = serde_json::to_value(make_event(lender.id, borrower.id, 1)).unwrap();

        handle_lender_loan(&store, &ledger, &proxy, &perms, &templates, &payload, 0).await.unwrap();
        // no proxy calls expected beyond none, since borrower has no lending history
    }

    #[tokio::test]
    async fn ban_unpaid_bans_a_non_approved_non_moderator_defaulter() {
        let store: Arc<dyn Store> = Arc::new(SqliteStore::open_in_memory().unwrap());
        let lender = store.find_or_create_user("lender").await.unwrap();
        let borrower = store.find_or_create_user("borrower").await.unwrap();
        let currency = store.find_or_create_currency("USD").await.unwrap();
        let principal = store.create_money(currency.id, 1000, 1000).await.unwrap();
        let repaid = store.create_money(currency.id, 0, 0).await.unwrap();
        let loan = store.create_loan(lender.id, borrower.id, principal.id, repaid.id, 0).await.unwrap();
        let unpaid_event = store.insert_unpaid_event(loan.id, crate::model::UnpaidEventKind::Unpaid, 0).await.unwrap();

        let mut scripted = HashMap::new();
        scripted.insert("show_user", serde_json::json!({"cumulative_karma": 100, "comment_karma": 40, "created_at_utc_seconds": 0}));
        scripted.insert("user_is_moderator", serde_json::json!({"moderator": false}));
        scripted.insert("user_is_approved", serde_json::json!({"approved": false}));
        scripted.insert("user_is_banned", serde_json::json!({"banned": false}));
        let proxy = Arc::new(RecordingProxy { sent: Mutex::new(Vec::new()), scripted });
        let perms = Arc::new(PermissionCache::new(store.clone(), proxy.clone() as Arc<dyn ForumProxyClient>, cfg()));
        let templates: Arc<dyn TemplateStore> = Arc::new(StaticTemplateStore::new());

        let payload = serde_json::json!({"loan_unpaid_event_id": unpaid_event.id});
        handle_ban_unpaid(&store, &(proxy.clone() as Arc<dyn ForumProxyClient>), &perms, &templates, &payload, 1000).await.unwrap();

        assert!(proxy.sent.lock().unwrap().iter().any(|(k, _)| k == "ban_user"));
    }

    #[tokio::test]
    async fn flair_worker_flairs_completed_link() {
        let bus: Arc<dyn EventBus> = Arc::new(InMemoryEventBus::new());
        let proxy = Arc::new(RecordingProxy { sent: Mutex::new(Vec::new()), scripted: HashMap::new() });
        let shutdown = ShutdownToken::new();

        bus.publish("loans.create", serde_json::to_value(make_event(1, 2, 1)).unwrap()).await.unwrap();
        let shutdown_clone = shutdown.clone();
        let bus_clone = bus.clone();
        let proxy_clone = proxy.clone() as Arc<dyn ForumProxyClient>;
        let handle = tokio::spawn(async move { flair_loan_threads_completed_worker(proxy_clone, bus_clone, "borrow".to_string(), shutdown_clone).await });

        tokio::time::sleep(Duration::from_millis(50)).await;
        shutdown.trigger();
        bus.publish("loans.create", serde_json::to_value(make_event(1, 2, 2)).unwrap()).await.ok();
        let _ = handle.await;

        assert!(proxy.sent.lock().unwrap().iter().any(|(k, _)| k == "flair_link"));
    }
}
