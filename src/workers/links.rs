//! Self-post submission scanner (§4.6's request-thread detection, the
//! other half of `loans.request`'s publish/subscribe pair alongside
//! `requests::borrower_request_worker`).
//!
//! Grounded on `original_source/src/runners/links.py`: page through new
//! submissions every 120s with the same handled-fullnames dedupe as the
//! comment scanner, self-posts before link-posts. A `[req]`-tagged self-post
//! is interpreted and published as `loans.request`; anything else gets an
//! automatic loan-history `check` reply, unless the author has opted out of
//! that courtesy check.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;

use crate::bus::EventBus;
use crate::cache::Cache;
use crate::ledger::Ledger;
use crate::model::events::{LoansRequest, RequestDetails, RequestPost};
use crate::perms::PermissionCache;
use crate::proxy::ForumProxyClient;
use crate::request_interpreter;
use crate::signals::ShutdownToken;
use crate::store::Store;
use crate::summons::{SUMMARY_TABLE_THRESHOLD, build_loan_views};
use crate::templates::{self, TemplateStore};

const SCAN_INTERVAL: Duration = Duration::from_secs(120);

/// Per-author opt-out flag for the automatic non-request "check" reply.
/// Kept in the shared cache alongside `borrower_req_pm_opt_out` rather than
/// a dedicated settings table (see DESIGN.md).
fn non_req_opt_out_cache_key(username: &str) -> String {
    format!("loansbot/settings/non_req_response_opt_out/{}", username.to_lowercase())
}

struct FetchedPost {
    fullname: String,
    author: String,
    subreddit: String,
    title: String,
    is_self: bool,
}

impl FetchedPost {
    fn from_json(v: &Value, is_self: bool) -> Option<Self> {
        Some(Self {
            fullname: v.get("fullname")?.as_str()?.to_string(),
            author: v.get("author")?.as_str()?.to_string(),
            subreddit: v.get("subreddit")?.as_str()?.to_string(),
            title: v.get("title")?.as_str()?.to_string(),
            is_self,
        })
    }
}

pub async fn link_scan_worker(
    store: Arc<dyn Store>,
    proxy: Arc<dyn ForumProxyClient>,
    perms: Arc<PermissionCache>,
    ledger: Arc<Ledger>,
    templates: Arc<dyn TemplateStore>,
    cache: Arc<dyn Cache>,
    bus: Arc<dyn EventBus>,
    subreddits: Vec<String>,
    shutdown: ShutdownToken,
    now_fn: impl Fn() -> i64,
) -> anyhow::Result<()> {
    loop {
        if shutdown.is_shutting_down() {
            return Ok(());
        }
        if let Err(err) = scan_once(&store, &proxy, &perms, &ledger, &templates, &cache, &bus, &subreddits, now_fn()).await {
            tracing::error!(?err, "link scan failed");
        }
        tokio::time::sleep(SCAN_INTERVAL).await;
    }
}

async fn fetch_links(proxy: &Arc<dyn ForumProxyClient>, subreddits: &[String], after: Option<String>) -> anyhow::Result<(Vec<FetchedPost>, Option<String>)> {
    let resp = proxy.send_request("subreddit_links", serde_json::json!({"subreddit": subreddits, "after": after})).await?;
    let Some(data) = resp.data() else {
        return Ok((Vec::new(), None));
    };
    let mut posts: Vec<FetchedPost> = data
        .get("self")
        .and_then(|v| v.as_array())
        .map(|arr| arr.iter().filter_map(|p| FetchedPost::from_json(p, true)).collect())
        .unwrap_or_default();
    posts.extend(
        data.get("url")
            .and_then(|v| v.as_array())
            .map(|arr| arr.iter().filter_map(|p| FetchedPost::from_json(p, false)))
            .into_iter()
            .flatten(),
    );
    let after = data.get("after").and_then(|v| v.as_str()).map(|s| s.to_string());
    Ok((posts, after))
}

/// One full paged scan, self-posts handled ahead of url-posts on each page
/// (matches `links.py::scan_for_links`'s ordering).
pub async fn scan_once(
    store: &Arc<dyn Store>,
    proxy: &Arc<dyn ForumProxyClient>,
    perms: &Arc<PermissionCache>,
    ledger: &Arc<Ledger>,
    templates: &Arc<dyn TemplateStore>,
    cache: &Arc<dyn Cache>,
    bus: &Arc<dyn EventBus>,
    subreddits: &[String],
    now: i64,
) -> anyhow::Result<()> {
    let mut after: Option<String> = None;
    loop {
        let (mut posts, next_after) = fetch_links(proxy, subreddits, after).await?;
        if posts.is_empty() {
            break;
        }
        posts.sort_by_key(|p| !p.is_self);

        let fullnames: Vec<String> = posts.iter().map(|p| p.fullname.clone()).collect();
        let already_handled: HashSet<String> = store.filter_handled_fullnames(&fullnames).await?.into_iter().collect();

        let mut remaining = fullnames.len() - already_handled.len();
        if remaining == 0 {
            break;
        }

        for post in &posts {
            if already_handled.contains(&post.fullname) {
                continue;
            }
            handle_post(store, proxy, perms, ledger, templates, cache, bus, post, now).await;
            remaining -= 1;
            if remaining == 0 {
                break;
            }
        }

        after = next_after;
        if after.is_none() {
            break;
        }
    }
    Ok(())
}

async fn handle_post(
    store: &Arc<dyn Store>,
    proxy: &Arc<dyn ForumProxyClient>,
    perms: &Arc<PermissionCache>,
    ledger: &Arc<Ledger>,
    templates: &Arc<dyn TemplateStore>,
    cache: &Arc<dyn Cache>,
    bus: &Arc<dyn EventBus>,
    post: &FetchedPost,
    now: i64,
) {
    if let Err(err) = try_handle_post(store, proxy, perms, ledger, templates, cache, bus, post, now).await {
        tracing::warn!(fullname = %post.fullname, ?err, "link handler failed");
    }
    if let Err(err) = store.insert_handled_fullname(&post.fullname, now).await {
        tracing::error!(fullname = %post.fullname, ?err, "failed to record handled fullname");
    }
}

async fn try_handle_post(
    store: &Arc<dyn Store>,
    proxy: &Arc<dyn ForumProxyClient>,
    perms: &Arc<PermissionCache>,
    ledger: &Arc<Ledger>,
    templates: &Arc<dyn TemplateStore>,
    cache: &Arc<dyn Cache>,
    bus: &Arc<dyn EventBus>,
    post: &FetchedPost,
    now: i64,
) -> anyhow::Result<()> {
    if !post.is_self {
        tracing::trace!(author = %post.author, subreddit = %post.subreddit, "ignoring non-self submission");
        return Ok(());
    }
    if !perms.can_interact(&post.author, now).await? {
        return Ok(());
    }

    if post.title.to_lowercase().contains("[req]") {
        let request = request_interpreter::interpret(&post.title);
        let event = LoansRequest {
            post: RequestPost { author: post.author.clone(), subreddit: post.subreddit.clone(), fullname: post.fullname.clone(), title: post.title.clone() },
            request: RequestDetails {
                title: request.title,
                location: request.location,
                city: request.city,
                state: request.state,
                country: request.country,
                terms: request.terms,
                processor: request.processor,
                notes: request.notes,
            },
        };
        bus.publish("loans.request", serde_json::to_value(&event)?).await?;
    } else if cache.get(&non_req_opt_out_cache_key(&post.author)).await.as_deref() == Some("1") {
        tracing::trace!(author = %post.author, "non-request post, author opted out of the courtesy check");
        return Ok(());
    }

    let report = match store.get_user_by_name(&post.author).await? {
        None => "This user has no loan history.".to_string(),
        Some(user) => {
            let (loans, summary) = ledger.get_and_format_all_or_summary(user.id, SUMMARY_TABLE_THRESHOLD, now).await?;
            match summary {
                None => {
                    let views = build_loan_views(store.as_ref(), &loans).await?;
                    templates::format_loan_table(&views, true)
                }
                Some(summary) => templates::format_summary(&post.author, &summary),
            }
        }
    };

    let mut params = std::collections::HashMap::new();
    params.insert("target_username", post.author.clone());
    params.insert("report", report);
    let Some(body) = templates::render(templates.as_ref(), "check_summary", &params) else {
        return Ok(());
    };
    proxy.send_request("post_comment", serde_json::json!({"parent": post.fullname, "text": body})).await?;
    Ok(())
}
