//! Permission/trust cache (C5): cached user metadata, TTL + modlog-driven
//! invalidation, and the temporary-ban reaper.
//!
//! Grounded on `original_source/src/perms/manager.py` (`can_interact`,
//! `fetch_info`, `flush_cache`) and `original_source/src/runners/temp_ban_expired_cache_flush.py`
//! (the reaper poll loop).

use std::sync::Arc;

use crate::config::Config;
use crate::model::PermissionSnapshot;
use crate::parsing::temp_ban::parse_temporary_ban;
use crate::proxy::ForumProxyClient;
use crate::store::Store;

pub(crate) const PRIMARY_SUBREDDIT: &str = "borrow";
const STALENESS_AGE_SECONDS: i64 = 86_400;
const ASSUMED_KARMA_PER_DAY: f64 = 100.0;
/// Hard backstop matching the snapshot's 1yr TTL (§4.5, SPEC_FULL §6):
/// the original's KV store expires the document outright at this age, so a
/// snapshot this old is a miss regardless of karma.
const SNAPSHOT_TTL_SECONDS: i64 = 365 * 86_400;

pub struct PermissionCache {
    store: Arc<dyn Store>,
    proxy: Arc<dyn ForumProxyClient>,
    config: Arc<Config>,
}

impl PermissionCache {
    pub fn new(store: Arc<dyn Store>, proxy: Arc<dyn ForumProxyClient>, config: Arc<Config>) -> Self {
        Self { store, proxy, config }
    }

    /// §4.5 `can_interact`.
    pub async fn can_interact(&self, username: &str, now: i64) -> anyhow::Result<bool> {
        if self.config.ignored_users.contains(&username.to_lowercase()) {
            return Ok(false);
        }
        let Some(info) = self.fetch_info(username, now).await? else {
            return Ok(false);
        };
        Ok(!info.banned
            && (info.moderator
                || info.approved
                || (info.combined_karma > self.config.karma_min
                    && info.comment_karma > self.config.comment_karma_min
                    && now - info.account_created_at > self.config.account_age_seconds_min)))
    }

    /// §4.5 `fetch_info`: cache read, legacy-schema and stale-karma miss
    /// rules, four-call refresh on miss, `None` if the account doesn't exist.
    pub async fn fetch_info(&self, username: &str, now: i64) -> anyhow::Result<Option<PermissionSnapshot>> {
        let cached = self.store.get_permission_snapshot(username).await?;

        let is_miss = match &cached {
            None => true,
            Some(snap) => self.is_stale(snap, now),
        };

        if !is_miss {
            return Ok(cached);
        }

        let karma_resp = self.proxy.send_request("show_user", serde_json::json!({"username": username})).await?;
        let Some(karma_info) = karma_resp.data() else {
            return Ok(None);
        };

        let is_moderator = self
            .proxy
            .send_request("user_is_moderator", serde_json::json!({"subreddit": PRIMARY_SUBREDDIT, "username": username}))
            .await?;
        let is_approved = self
            .proxy
            .send_request("user_is_approved", serde_json::json!({"subreddit": PRIMARY_SUBREDDIT, "username": username}))
            .await?;
        let is_banned = self
            .proxy
            .send_request("user_is_banned", serde_json::json!({"subreddit": PRIMARY_SUBREDDIT, "username": username}))
            .await?;

        let snapshot = PermissionSnapshot {
            username: username.to_lowercase(),
            combined_karma: karma_info["cumulative_karma"].as_i64().unwrap_or(0),
            comment_karma: karma_info["comment_karma"].as_i64().unwrap_or(0),
            account_created_at: karma_info["created_at_utc_seconds"].as_i64().unwrap_or(0),
            approved: is_approved.data().and_then(|v| v["approved"].as_bool()).unwrap_or(false),
            moderator: is_moderator.data().and_then(|v| v["moderator"].as_bool()).unwrap_or(false),
            banned: is_banned.data().and_then(|v| v["banned"].as_bool()).unwrap_or(false),
            checked_at: now,
        };
        self.store.set_permission_snapshot(&snapshot).await?;
        Ok(Some(snapshot))
    }

    /// The karma-staleness-by-accrual-estimate rule (§4.5, SPEC_FULL §6): a
    /// snapshot older than 24h with karma below the minimum is still treated
    /// as fresh unless a linear 100-karma/day estimate says they'd have
    /// crossed the threshold by now. A snapshot past the 1yr TTL is always
    /// a miss, matching the original's KV store expiring the document
    /// outright at that age rather than relying solely on the modlog to
    /// invalidate it.
    fn is_stale(&self, snap: &PermissionSnapshot, now: i64) -> bool {
        let age = now - snap.checked_at;
        if age > SNAPSHOT_TTL_SECONDS {
            return true;
        }
        if age <= STALENESS_AGE_SECONDS {
            return false;
        }
        if snap.combined_karma >= self.config.karma_min {
            return false;
        }
        let age_days = age as f64 / 86_400.0;
        let projected = snap.combined_karma as f64 + ASSUMED_KARMA_PER_DAY * age_days;
        projected >= self.config.karma_min as f64
    }

    pub async fn flush_cache(&self, username: &str) -> anyhow::Result<()> {
        self.store.delete_permission_snapshot(username).await?;
        Ok(())
    }
}

/// §4.5 "Modlog-driven invalidation": subscribes to `modlog.*` and flushes
/// or creates temporary-ban rows in reaction to moderation actions.
pub async fn modlog_cache_flush_worker(
    store: Arc<dyn Store>,
    bus: Arc<dyn crate::bus::EventBus>,
    shutdown: crate::signals::ShutdownToken,
    now_fn: impl Fn() -> i64,
) -> anyhow::Result<()> {
    let mut sub = bus.subscribe("modlog.*");
    loop {
        if shutdown.is_shutting_down() {
            return Ok(());
        }
        let Some((topic, payload)) = sub.recv().await else { return Ok(()) };
        let guard = shutdown.delay();

        let action = topic.strip_prefix("modlog.").unwrap_or(&topic);
        let target = payload.get("target_username").and_then(|v| v.as_str());
        let subreddit = payload.get("subreddit").and_then(|v| v.as_str()).unwrap_or("");
        let now = now_fn();

        match action {
            "banuser" | "unbanuser" | "acceptmoderatorinvite" | "removemoderator" | "addcontributor" | "removecontributor" => {
                if let Some(username) = target {
                    store.delete_permission_snapshot(username).await?;

                    if action == "banuser" {
                        let details = payload.get("details").and_then(|v| v.as_str()).unwrap_or("");
                        if details != "permanent" {
                            if let Ok(duration) = parse_temporary_ban(details) {
                                store.delete_temporary_ban_for_subreddit(username, subreddit).await?;
                                store.insert_temporary_ban(username, payload.get("mod_username").and_then(|v| v.as_str()).unwrap_or(""), subreddit, now, now + duration).await?;
                            }
                        }
                    } else if action == "unbanuser" {
                        store.delete_temporary_ban_for_subreddit(username, subreddit).await?;
                    }
                }
            }
            _ => {}
        }

        if guard.was_already_shutting_down() {
            return Ok(());
        }
    }
}

/// §4.5 "Temp-ban reaper": every 10 minutes, drain rows due within a minute.
pub async fn temp_ban_expired_cache_flush_worker(
    store: Arc<dyn Store>,
    shutdown: crate::signals::ShutdownToken,
    now_fn: impl Fn() -> i64,
) -> anyhow::Result<()> {
    loop {
        if shutdown.is_shutting_down() {
            return Ok(());
        }
        reap_once(&*store, now_fn()).await?;
        tokio::time::sleep(std::time::Duration::from_secs(600)).await;
    }
}

async fn reap_once(store: &dyn Store, now: i64) -> anyhow::Result<()> {
    loop {
        let due = store.list_expiring_temporary_bans(now + 60, 100).await?;
        let count = due.len();
        for ban in due {
            store.delete_permission_snapshot(&ban.username).await?;
            store.delete_temporary_ban(ban.id).await?;
        }
        if count < 100 {
            break;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::ProxyResponse;
    use crate::store::sqlite::SqliteStore;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

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
            karma_min: 100,
            comment_karma_min: 40,
            account_age_seconds_min: 86_400,
            ignored_users: vec!["loansbot".into()],
            default_permissions: vec![],
            mod_permissions: vec![],
            appname: "loansbot".into(),
            deprecated_endpoint_sunsets: vec![],
        })
    }

    struct FakeProxy {
        calls: AtomicUsize,
        exists: bool,
    }

    #[async_trait]
    impl ForumProxyClient for FakeProxy {
        async fn send_request(&self, request_type: &str, _args: serde_json::Value) -> Result<ProxyResponse, crate::proxy::ProxyError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if !self.exists && request_type == "show_user" {
                return Ok(ProxyResponse { kind: "error".into(), info: json!({}) });
            }
            let info = match request_type {
                "show_user" => json!({"cumulative_karma": 1000, "comment_karma": 500, "created_at_utc_seconds": 0}),
                "user_is_moderator" => json!({"moderator": false}),
                "user_is_approved" => json!({"approved": false}),
                "user_is_banned" => json!({"banned": false}),
                _ => json!({}),
            };
            Ok(ProxyResponse { kind: "copy".into(), info })
        }
    }

    fn perms(exists: bool) -> (PermissionCache, Arc<FakeProxy>) {
        let store: Arc<dyn Store> = Arc::new(SqliteStore::open_in_memory().unwrap());
        let proxy = Arc::new(FakeProxy { calls: AtomicUsize::new(0), exists });
        (PermissionCache::new(store, proxy.clone(), cfg()), proxy)
    }

    #[tokio::test]
    async fn ignored_user_never_interacts() {
        let (p, _proxy) = perms(true);
        assert!(!p.can_interact("LoansBot", 10_000_000).await.unwrap());
    }

    #[tokio::test]
    async fn nonexistent_account_cannot_interact() {
        let (p, _proxy) = perms(false);
        assert!(!p.can_interact("ghost", 10_000_000).await.unwrap());
    }

    #[tokio::test]
    async fn sufficient_karma_and_age_permits_interaction() {
        let (p, proxy) = perms(true);
        let ok = p.can_interact("alice", 10_000_000).await.unwrap();
        assert!(ok);
        assert_eq!(proxy.calls.load(Ordering::SeqCst), 4);

        // second call within TTL should hit the cache, not the proxy again
        let ok2 = p.can_interact("alice", 10_000_001).await.unwrap();
        assert!(ok2);
        assert_eq!(proxy.calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn flush_cache_forces_a_refetch() {
        let (p, proxy) = perms(true);
        p.can_interact("alice", 0).await.unwrap();
        assert_eq!(proxy.calls.load(Ordering::SeqCst), 4);
        p.flush_cache("alice").await.unwrap();
        p.can_interact("alice", 1).await.unwrap();
        assert_eq!(proxy.calls.load(Ordering::SeqCst), 8);
    }

    #[tokio::test]
    async fn snapshot_past_one_year_ttl_is_refetched_even_with_sufficient_karma() {
        let (p, proxy) = perms(true);
        p.can_interact("alice", 0).await.unwrap();
        assert_eq!(proxy.calls.load(Ordering::SeqCst), 4);

        // still within the TTL: high-karma snapshot stays cached.
        p.can_interact("alice", SNAPSHOT_TTL_SECONDS - 1).await.unwrap();
        assert_eq!(proxy.calls.load(Ordering::SeqCst), 4);

        // past the 1yr TTL: a miss even though combined_karma (1000) is
        // well above karma_min, matching the original's hard KV expiry.
        p.can_interact("alice", SNAPSHOT_TTL_SECONDS + 1).await.unwrap();
        assert_eq!(proxy.calls.load(Ordering::SeqCst), 8);
    }

    #[tokio::test]
    async fn temp_ban_reaper_drains_due_rows() {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        store.insert_temporary_ban("alice", "mod1", "borrow", 0, 100).await.unwrap();
        reap_once(&*store, 100).await.unwrap();
        assert!(store.list_expiring_temporary_bans(1_000, 100).await.unwrap().is_empty());
    }
}
