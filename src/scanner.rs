//! Comment scanner, recheck consumer, and moderator-log poller (C6).
//!
//! Grounded on `original_source/src/runners/comments.py` (the scan loop:
//! page through new comments, stop once every fullname on a page is
//! already `handled_fullnames`, and wrap each comment's handler +
//! dedupe-insert in a `delay_signals` critical section),
//! `original_source/src/runners/rechecks.py` (the recheck consumer — same
//! dispatch, no dedupe) and `original_source/src/runners/modlog.py` (hourly
//! poll of the moderator log, replaying only actions newer than the last
//! seen timestamp).

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;

use crate::bus::EventBus;
use crate::cache::Cache;
use crate::perms::PermissionCache;
use crate::proxy::ForumProxyClient;
use crate::signals::ShutdownToken;
use crate::store::Store;
use crate::summons::{CommentContext, SummonRegistry, SummonServices};

const SCAN_INTERVAL: Duration = Duration::from_secs(60);
const MODLOG_POLL_INTERVAL: Duration = Duration::from_secs(3600);
const MODLOG_LAST_SEEN_KEY: &str = "loansbot_runners_modlog_last_action_at";
const MODLOG_LAST_SEEN_TTL: Duration = Duration::from_secs(365 * 86_400);

struct FetchedComment {
    fullname: String,
    author: String,
    body: String,
    link_fullname: String,
    link_author: String,
    permalink: String,
}

impl FetchedComment {
    fn from_json(v: &Value) -> Option<Self> {
        Some(Self {
            fullname: v.get("fullname")?.as_str()?.to_string(),
            author: v.get("author")?.as_str()?.to_string(),
            body: v.get("body")?.as_str()?.to_string(),
            link_fullname: v.get("link_fullname").and_then(|x| x.as_str()).unwrap_or("").to_string(),
            link_author: v.get("link_author").and_then(|x| x.as_str()).unwrap_or("").to_string(),
            permalink: v.get("permalink").and_then(|x| x.as_str()).unwrap_or("").to_string(),
        })
    }
}

/// The comment-scanning daemon: polls for new comments every 60s, dispatches
/// matching summons, and sends each matched summon's reply back through the
/// proxy.
pub struct Scanner {
    store: Arc<dyn Store>,
    proxy: Arc<dyn ForumProxyClient>,
    perms: Arc<PermissionCache>,
    registry: Arc<SummonRegistry>,
    services: Arc<SummonServices>,
    subreddits: Vec<String>,
    shutdown: ShutdownToken,
}

impl Scanner {
    pub fn new(
        store: Arc<dyn Store>,
        proxy: Arc<dyn ForumProxyClient>,
        perms: Arc<PermissionCache>,
        registry: Arc<SummonRegistry>,
        services: Arc<SummonServices>,
        subreddits: Vec<String>,
        shutdown: ShutdownToken,
    ) -> Self {
        Self { store, proxy, perms, registry, services, subreddits, shutdown }
    }

    /// Runs the 60-second poll loop until shutdown. `now_fn` is injected so
    /// tests can control the clock.
    pub async fn run(&self, now_fn: impl Fn() -> i64) -> anyhow::Result<()> {
        loop {
            if self.shutdown.is_shutting_down() {
                return Ok(());
            }
            if let Err(err) = self.scan_once(now_fn()).await {
                tracing::error!(?err, "comment scan failed");
            }
            tokio::time::sleep(SCAN_INTERVAL).await;
        }
    }

    /// One full paged scan: fetch a page, stop if every fullname on it is
    /// already known, otherwise handle the unseen ones and keep paging.
    pub async fn scan_once(&self, now: i64) -> anyhow::Result<()> {
        let mut after: Option<String> = None;
        loop {
            let (comments, next_after) = self.fetch_comments(after).await?;
            if comments.is_empty() {
                break;
            }

            let fullnames: Vec<String> = comments.iter().map(|c| c.fullname.clone()).collect();
            let already_handled: HashSet<String> = self.store.filter_handled_fullnames(&fullnames).await?.into_iter().collect();

            let mut remaining = fullnames.len() - already_handled.len();
            if remaining == 0 {
                break;
            }

            for comment in &comments {
                if already_handled.contains(&comment.fullname) {
                    continue;
                }
                self.handle_comment(comment, now).await;
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

    /// Handler + dedupe-insert as one signals-delayed critical section
    /// (§4.6, §5): the fullname is recorded whether or not a summon matched
    /// and whether or not the handler succeeded, so a poison comment is
    /// never retried forever.
    async fn handle_comment(&self, comment: &FetchedComment, now: i64) {
        let guard = self.shutdown.delay();

        if let Err(err) = self.try_handle_comment(comment, now).await {
            tracing::warn!(fullname = %comment.fullname, ?err, "summon handler failed");
        }

        if let Err(err) = self.store.insert_handled_fullname(&comment.fullname, now).await {
            tracing::error!(fullname = %comment.fullname, ?err, "failed to record handled fullname");
        }

        drop(guard);
    }

    /// The original scanner leaves the author's permission unchecked before
    /// dispatch (a standing `TODO check author`); here `can_interact` gates
    /// dispatch the same way it already gates every other entry point.
    async fn try_handle_comment(&self, comment: &FetchedComment, now: i64) -> anyhow::Result<()> {
        if !self.registry.might_apply(&comment.body) {
            return Ok(());
        }
        if !self.perms.can_interact(&comment.author, now).await? {
            return Ok(());
        }

        let ctx = CommentContext {
            author: comment.author.clone(),
            fullname: comment.fullname.clone(),
            link_fullname: comment.link_fullname.clone(),
            link_author: comment.link_author.clone(),
            permalink: comment.permalink.clone(),
            created_at: now,
        };
        if let Some(reply) = self.registry.dispatch(&self.services, &ctx, &comment.body).await? {
            let _ = self.proxy.send_request("reply", serde_json::json!({"fullname": comment.fullname, "body": reply})).await;
        }
        Ok(())
    }

    async fn fetch_comments(&self, after: Option<String>) -> anyhow::Result<(Vec<FetchedComment>, Option<String>)> {
        let resp = self
            .proxy
            .send_request("comments", serde_json::json!({"subreddits": self.subreddits, "after": after}))
            .await?;
        let Some(data) = resp.data() else {
            return Ok((Vec::new(), None));
        };
        let comments = data
            .get("comments")
            .and_then(|v| v.as_array())
            .map(|arr| arr.iter().filter_map(FetchedComment::from_json).collect())
            .unwrap_or_default();
        let after = data.get("after").and_then(|v| v.as_str()).map(|s| s.to_string());
        Ok((comments, after))
    }
}

/// Listens for edit-triggered recheck requests (originally the `lbrechecks`
/// queue): looks the comment back up by fullname and dispatches it through
/// the same summon registry, without the handled-fullnames dedupe check
/// since a recheck is, by definition, of an already-handled comment.
pub async fn rechecks_worker(
    proxy: Arc<dyn ForumProxyClient>,
    registry: Arc<SummonRegistry>,
    services: Arc<SummonServices>,
    bus: Arc<dyn EventBus>,
    shutdown: ShutdownToken,
    now_fn: impl Fn() -> i64,
) -> anyhow::Result<()> {
    let mut sub = bus.subscribe("rechecks.requested");
    loop {
        if shutdown.is_shutting_down() {
            return Ok(());
        }
        let Some((_, payload)) = sub.recv().await else { return Ok(()) };
        let guard = shutdown.delay();

        match (payload.get("link_fullname").and_then(|v| v.as_str()), payload.get("comment_fullname").and_then(|v| v.as_str())) {
            (Some(link_fullname), Some(comment_fullname)) => {
                if let Err(err) = handle_recheck(&proxy, &registry, &services, link_fullname, comment_fullname, now_fn()).await {
                    tracing::warn!(?err, comment_fullname, "recheck failed");
                }
            }
            _ => tracing::warn!(?payload, "malformed recheck request, ignoring"),
        }

        if guard.was_already_shutting_down() {
            return Ok(());
        }
    }
}

async fn handle_recheck(
    proxy: &Arc<dyn ForumProxyClient>,
    registry: &Arc<SummonRegistry>,
    services: &Arc<SummonServices>,
    link_fullname: &str,
    comment_fullname: &str,
    now: i64,
) -> anyhow::Result<()> {
    let resp = proxy
        .send_request("lookup_comment", serde_json::json!({"link_fullname": link_fullname, "comment_fullname": comment_fullname}))
        .await?;
    let Some(info) = resp.data() else {
        return Ok(());
    };
    let Some(comment) = FetchedComment::from_json(info) else {
        return Ok(());
    };
    if !registry.might_apply(&comment.body) {
        return Ok(());
    }

    let ctx = CommentContext {
        author: comment.author.clone(),
        fullname: comment.fullname.clone(),
        link_fullname: comment.link_fullname.clone(),
        link_author: comment.link_author.clone(),
        permalink: comment.permalink.clone(),
        created_at: now,
    };
    if let Some(reply) = registry.dispatch(services, &ctx, &comment.body).await? {
        let _ = proxy.send_request("reply", serde_json::json!({"fullname": comment.fullname, "body": reply})).await;
    }
    Ok(())
}

const PERMS_RELATED_ACTIONS: &[&str] =
    &["banuser", "unbanuser", "acceptmoderatorinvite", "removemoderator", "addcontributor", "removecontributor"];

/// Hourly poll of the moderator log (§4.5/§4.9): replays only actions newer
/// than the cached last-seen timestamp, publishing each as `modlog.<action>`
/// for the permission cache and moderator-roster workers to react to.
pub async fn modlog_poll_worker(
    proxy: Arc<dyn ForumProxyClient>,
    bus: Arc<dyn EventBus>,
    cache: Arc<dyn Cache>,
    subreddits: Vec<String>,
    shutdown: ShutdownToken,
) -> anyhow::Result<()> {
    loop {
        if shutdown.is_shutting_down() {
            return Ok(());
        }
        if let Err(err) = scan_modlog_once(&proxy, &bus, &cache, &subreddits).await {
            tracing::error!(?err, "modlog scan failed");
        }
        tokio::time::sleep(MODLOG_POLL_INTERVAL).await;
    }
}

async fn scan_modlog_once(proxy: &Arc<dyn ForumProxyClient>, bus: &Arc<dyn EventBus>, cache: &Arc<dyn Cache>, subreddits: &[String]) -> anyhow::Result<()> {
    let last_seen: Option<f64> = cache.get(MODLOG_LAST_SEEN_KEY).await.and_then(|s| s.parse().ok());
    let mut after: Option<String> = None;
    let mut new_last_seen = last_seen;

    loop {
        let resp = proxy.send_request("modlog", serde_json::json!({"subreddits": subreddits, "after": after})).await?;
        let Some(data) = resp.data() else { break };
        let actions = data.get("actions").and_then(|v| v.as_array()).cloned().unwrap_or_default();
        let next_after = data.get("after").and_then(|v| v.as_str()).map(|s| s.to_string());

        let mut hit_known_action = false;
        for act in &actions {
            let created_at = act.get("created_at").and_then(|v| v.as_f64()).unwrap_or(0.0);
            if last_seen.is_none_or(|seen| created_at > seen) {
                publish_modlog_action(bus, act).await;
                new_last_seen = Some(created_at);
            } else {
                hit_known_action = true;
                break;
            }
        }
        if hit_known_action {
            break;
        }

        after = next_after;
        if after.is_none() {
            break;
        }
    }

    if let Some(seen) = new_last_seen {
        cache.set(MODLOG_LAST_SEEN_KEY, seen.to_string(), MODLOG_LAST_SEEN_TTL).await;
    }
    Ok(())
}

async fn publish_modlog_action(bus: &Arc<dyn EventBus>, act: &Value) {
    let action = act.get("action").and_then(|v| v.as_str()).unwrap_or("");
    if action.is_empty() || !PERMS_RELATED_ACTIONS.contains(&action) {
        let _ = bus;
        return;
    }
    // Normalize the raw forum-proxy shape (`mod`/`target_author`) to the
    // `ModlogRecord` field names every `modlog.*` subscriber expects.
    let record = serde_json::json!({
        "action": action,
        "mod_username": act.get("mod").and_then(|v| v.as_str()).unwrap_or(""),
        "target_username": act.get("target_author").and_then(|v| v.as_str()),
        "subreddit": act.get("subreddit").and_then(|v| v.as_str()).unwrap_or(""),
        "details": act.get("details").and_then(|v| v.as_str()),
        "created_at": act.get("created_at").and_then(|v| v.as_f64()).unwrap_or(0.0) as i64,
    });
    let topic = format!("modlog.{action}");
    let _ = bus.publish(&topic, record).await;
}
