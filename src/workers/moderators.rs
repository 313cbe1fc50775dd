//! Moderator roster lifecycle: detection, onboarding, offboarding, the
//! drip-feed of onboarding tips, and the weekly poll-based reconciliation.
//!
//! Grounded on `original_source/src/runners/mod_changes.py`,
//! `mod_onboarding.py`, `mod_onboarding_claim.py`, `mod_offboarding.py`,
//! `mod_onboarding_messages.py`, `mod_sync.py` and
//! `original_source/src/utils/mod_onboarding_utils.py` (`grant_mod_permissions`/
//! `revoke_mod_permissions`).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;

use crate::bus::EventBus;
use crate::cache::Cache;
use crate::model::events::{ModlogRecord, ModsChanged, UserSignup};
use crate::perms::PRIMARY_SUBREDDIT;
use crate::proxy::ForumProxyClient;
use crate::signals::ShutdownToken;
use crate::store::Store;
use crate::templates::{self, TemplateStore};

const MESSAGE_SCHEDULE_HOUR: u32 = 13;
const MESSAGE_SCHEDULE_MINUTE: u32 = 30;
/// "1PM UTC at half to avoid conflict with deprecated_alerts" (mod_onboarding_messages.py).
const ONBOARDING_MESSAGE_SEQUENCE: &[&str] = &["mod_onboarding_msg1", "mod_onboarding_msg2"];

const MOD_SYNC_LAST_CHECK_KEY: &str = "loansbot/runners/mod_sync/last_check_at";
const MOD_SYNC_INTERVAL: Duration = Duration::from_secs(7 * 86_400);

/// `mod_changes.py`: listens to `modlog.*` and keeps the moderator roster in
/// sync with `acceptmoderatorinvite`/`removemoderator` actions.
///
/// The original's `removemoderator` branch looks up `new_mod_username` — a
/// name bound only in the other branch — which reads as a copy-paste bug
/// rather than intentional behavior; here each branch consistently resolves
/// the user named by its own event (`mod_username` for an invite accepted,
/// `target_username` for a removal).
pub async fn mod_changes_worker(store: Arc<dyn Store>, bus: Arc<dyn EventBus>, shutdown: ShutdownToken) -> anyhow::Result<()> {
    let mut sub = bus.subscribe("modlog.*");
    loop {
        if shutdown.is_shutting_down() {
            return Ok(());
        }
        let Some((topic, payload)) = sub.recv().await else { return Ok(()) };
        let guard = shutdown.delay();

        let action = topic.strip_prefix("modlog.").unwrap_or(&topic);
        if matches!(action, "acceptmoderatorinvite" | "removemoderator") {
            if let Err(err) = handle_mod_change(&store, &bus, &payload).await {
                tracing::warn!(?err, action, "mod_changes handler failed");
            }
        }

        if guard.was_already_shutting_down() {
            return Ok(());
        }
    }
}

async fn handle_mod_change(store: &Arc<dyn Store>, bus: &Arc<dyn EventBus>, payload: &Value) -> anyhow::Result<()> {
    let record: ModlogRecord = serde_json::from_value(payload.clone())?;

    match record.action.as_str() {
        "acceptmoderatorinvite" => {
            let username = record.mod_username;
            let user = store.find_or_create_user(&username).await?;
            let moderators = store.list_moderators(PRIMARY_SUBREDDIT).await?;
            if !moderators.iter().any(|m| m == &user.username) {
                store.add_moderator(&user.username, PRIMARY_SUBREDDIT).await?;
                tracing::info!(username = %user.username, "now a moderator");
                bus.publish("mods.added", serde_json::to_value(ModsChanged { username: user.username, user_id: user.id })?).await?;
            }
        }
        "removemoderator" => {
            let Some(username) = record.target_username else { return Ok(()) };
            let user = store.find_or_create_user(&username).await?;
            let moderators = store.list_moderators(PRIMARY_SUBREDDIT).await?;
            if moderators.iter().any(|m| m == &user.username) {
                store.remove_moderator(&user.username, PRIMARY_SUBREDDIT).await?;
                tracing::info!(username = %user.username, "no longer a moderator");
                bus.publish("mods.removed", serde_json::to_value(ModsChanged { username: user.username, user_id: user.id })?).await?;
            }
        }
        _ => {}
    }
    Ok(())
}

/// `mod_onboarding.py`: on `mods.added`, grants full mod permissions to a
/// claimed account, or asks an unclaimed one to claim first (permissions
/// follow later, from `mod_onboarding_claim_worker`).
pub async fn mod_onboarding_worker(
    store: Arc<dyn Store>,
    proxy: Arc<dyn ForumProxyClient>,
    templates: Arc<dyn TemplateStore>,
    mod_permissions: Vec<String>,
    bus: Arc<dyn EventBus>,
    shutdown: ShutdownToken,
) -> anyhow::Result<()> {
    let mut sub = bus.subscribe("mods.added");
    loop {
        if shutdown.is_shutting_down() {
            return Ok(());
        }
        let Some((_, payload)) = sub.recv().await else { return Ok(()) };
        let guard = shutdown.delay();

        if let Err(err) = handle_mod_onboarding(&store, &proxy, &templates, &mod_permissions, &payload).await {
            tracing::warn!(?err, "mod_onboarding handler failed");
        }

        if guard.was_already_shutting_down() {
            return Ok(());
        }
    }
}

async fn handle_mod_onboarding(
    store: &Arc<dyn Store>,
    proxy: &Arc<dyn ForumProxyClient>,
    templates: &Arc<dyn TemplateStore>,
    mod_permissions: &[String],
    payload: &Value,
) -> anyhow::Result<()> {
    let event: ModsChanged = serde_json::from_value(payload.clone())?;

    let mut params = HashMap::new();
    params.insert("username", event.username.clone());

    if !store.is_account_claimed(event.user_id).await? {
        if let Some((title, body)) = templates::render_letter(templates.as_ref(), "mod_onboarding_unclaimed", &params) {
            proxy.send_request("compose", serde_json::json!({"recipient": event.username, "subject": title, "body": body})).await?;
        }
        return Ok(());
    }

    grant_permissions_not_yet_granted(store.as_ref(), event.user_id, mod_permissions).await?;

    if let Some((title, body)) = templates::render_letter(templates.as_ref(), "mod_onboarding_greeting", &params) {
        proxy.send_request("compose", serde_json::json!({"recipient": event.username, "subject": title, "body": body})).await?;
    }
    Ok(())
}

async fn grant_permissions_not_yet_granted(store: &dyn Store, user_id: crate::model::UserId, permissions: &[String]) -> anyhow::Result<()> {
    for permission in permissions {
        if store.get_permission_grant(user_id, permission).await?.is_none() {
            store.insert_permission_grant(user_id, permission).await?;
        }
    }
    Ok(())
}

/// `mod_onboarding_claim.py`: on `user.signup`, grants full mod permissions
/// to a moderator who just claimed their account (the onboarding the
/// `mods.added` handler above deferred for being unclaimed at the time).
pub async fn mod_onboarding_claim_worker(
    store: Arc<dyn Store>,
    proxy: Arc<dyn ForumProxyClient>,
    templates: Arc<dyn TemplateStore>,
    mod_permissions: Vec<String>,
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

        if let Err(err) = handle_mod_onboarding_claim(&store, &proxy, &templates, &mod_permissions, &payload).await {
            tracing::warn!(?err, "mod_onboarding_claim handler failed");
        }

        if guard.was_already_shutting_down() {
            return Ok(());
        }
    }
}

async fn handle_mod_onboarding_claim(
    store: &Arc<dyn Store>,
    proxy: &Arc<dyn ForumProxyClient>,
    templates: &Arc<dyn TemplateStore>,
    mod_permissions: &[String],
    payload: &Value,
) -> anyhow::Result<()> {
    let event: UserSignup = serde_json::from_value(payload.clone())?;

    let Some(user) = store.get_user(event.user_id).await? else { return Ok(()) };
    let moderators = store.list_moderators(PRIMARY_SUBREDDIT).await?;
    if !moderators.iter().any(|m| m == &user.username) {
        return Ok(());
    }

    grant_permissions_not_yet_granted(store.as_ref(), user.id, mod_permissions).await?;

    let mut params = HashMap::new();
    params.insert("username", user.username.clone());
    if let Some((title, body)) = templates::render_letter(templates.as_ref(), "mod_onboarding_claim_greeting", &params) {
        proxy.send_request("compose", serde_json::json!({"recipient": user.username, "subject": title, "body": body})).await?;
    }
    Ok(())
}

/// `mod_offboarding.py`: on `mods.removed`, strips every granted permission
/// except the defaults and sends a farewell. The original also claims to
/// "log out all sessions"; no session store is modeled here (see DESIGN.md),
/// so that part is a no-op beyond the permission revocation it actually
/// performs.
pub async fn mod_offboarding_worker(
    store: Arc<dyn Store>,
    proxy: Arc<dyn ForumProxyClient>,
    templates: Arc<dyn TemplateStore>,
    default_permissions: Vec<String>,
    bus: Arc<dyn EventBus>,
    shutdown: ShutdownToken,
) -> anyhow::Result<()> {
    let mut sub = bus.subscribe("mods.removed");
    loop {
        if shutdown.is_shutting_down() {
            return Ok(());
        }
        let Some((_, payload)) = sub.recv().await else { return Ok(()) };
        let guard = shutdown.delay();

        if let Err(err) = handle_mod_offboarding(&store, &proxy, &templates, &default_permissions, &payload).await {
            tracing::warn!(?err, "mod_offboarding handler failed");
        }

        if guard.was_already_shutting_down() {
            return Ok(());
        }
    }
}

async fn handle_mod_offboarding(
    store: &Arc<dyn Store>,
    proxy: &Arc<dyn ForumProxyClient>,
    templates: &Arc<dyn TemplateStore>,
    default_permissions: &[String],
    payload: &Value,
) -> anyhow::Result<()> {
    let event: ModsChanged = serde_json::from_value(payload.clone())?;

    let granted = store.list_permission_grants(event.user_id).await?;
    for permission in granted {
        if !default_permissions.contains(&permission) {
            store.revoke_permission_grant(event.user_id, &permission).await?;
        }
    }

    let mut params = HashMap::new();
    params.insert("username", event.username.clone());
    if let Some((title, body)) = templates::render_letter(templates.as_ref(), "mod_offboarding_farewell", &params) {
        proxy.send_request("compose", serde_json::json!({"recipient": event.username, "subject": title, "body": body})).await?;
    }
    Ok(())
}

/// `mod_onboarding_messages.py`: once a day, sends every moderator who
/// hasn't received the full onboarding sequence the next message in it.
pub async fn mod_onboarding_messages_worker(
    store: Arc<dyn Store>,
    proxy: Arc<dyn ForumProxyClient>,
    templates: Arc<dyn TemplateStore>,
    shutdown: ShutdownToken,
    now_fn: impl Fn() -> i64,
) -> anyhow::Result<()> {
    loop {
        if shutdown.is_shutting_down() {
            return Ok(());
        }
        tokio::time::sleep(super::duration_until(MESSAGE_SCHEDULE_HOUR, MESSAGE_SCHEDULE_MINUTE, now_fn())).await;
        if shutdown.is_shutting_down() {
            return Ok(());
        }
        if let Err(err) = send_onboarding_messages(&store, &proxy, &templates).await {
            tracing::error!(?err, "mod_onboarding_messages run failed");
        }
    }
}

async fn send_onboarding_messages(store: &Arc<dyn Store>, proxy: &Arc<dyn ForumProxyClient>, templates: &Arc<dyn TemplateStore>) -> anyhow::Result<()> {
    for username in store.list_moderators(PRIMARY_SUBREDDIT).await? {
        let progress = store.get_mod_onboarding_progress(&username).await?;
        let Some(&name) = ONBOARDING_MESSAGE_SEQUENCE.get(progress as usize) else {
            continue;
        };

        let mut params = HashMap::new();
        params.insert("username", username.clone());
        let Some((title, body)) = templates::render_letter(templates.as_ref(), name, &params) else {
            continue;
        };

        proxy.send_request("compose", serde_json::json!({"recipient": username, "subject": title, "body": body})).await?;
        store.set_mod_onboarding_progress(&username, progress + 1).await?;
        tracing::info!(username, msg_order = progress + 1, "sent moderator onboarding message");
    }
    Ok(())
}

/// `mod_sync.py`: weekly poll-and-diff reconciliation of our moderator
/// roster against the forum's, in case a `modlog.*` event was ever missed.
pub async fn mod_sync_worker(
    store: Arc<dyn Store>,
    proxy: Arc<dyn ForumProxyClient>,
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

        let now = now_fn();
        let last_check_at: Option<i64> = cache.get(MOD_SYNC_LAST_CHECK_KEY).await.and_then(|s| s.parse().ok());
        if let Some(last) = last_check_at {
            let elapsed = Duration::from_secs((now - last).max(0) as u64);
            if elapsed < MOD_SYNC_INTERVAL {
                tokio::time::sleep(MOD_SYNC_INTERVAL - elapsed).await;
                continue;
            }
        }

        if let Err(err) = sync_moderators(&store, &proxy, &bus, &subreddits).await {
            tracing::error!(?err, "mod_sync failed");
        }
        cache.set(MOD_SYNC_LAST_CHECK_KEY, now.to_string(), MOD_SYNC_INTERVAL * 2).await;
    }
}

async fn sync_moderators(store: &Arc<dyn Store>, proxy: &Arc<dyn ForumProxyClient>, bus: &Arc<dyn EventBus>, subreddits: &[String]) -> anyhow::Result<()> {
    let mut live_mods = std::collections::HashSet::new();
    for subreddit in subreddits {
        let resp = proxy.send_request("subreddit_moderators", serde_json::json!({"subreddit": subreddit})).await?;
        let Some(data) = resp.data() else {
            tracing::info!(subreddit, "non-copy response for subreddit_moderators, not syncing");
            return Ok(());
        };
        let mods = data.get("mods").and_then(|v| v.as_array()).cloned().unwrap_or_default();
        for m in mods {
            if let Some(username) = m.get("username").and_then(|v| v.as_str()) {
                live_mods.insert(username.to_lowercase());
            }
        }
    }

    let known_mods = store.list_moderators(PRIMARY_SUBREDDIT).await?;
    for username in &known_mods {
        if !live_mods.contains(username) {
            let user = store.find_or_create_user(username).await?;
            store.remove_moderator(username, PRIMARY_SUBREDDIT).await?;
            tracing::info!(username, "no longer a moderator (sync)");
            bus.publish("mods.removed", serde_json::to_value(ModsChanged { username: user.username, user_id: user.id })?).await?;
        }
    }

    let known: std::collections::HashSet<String> = known_mods.into_iter().collect();
    for username in &live_mods {
        if !known.contains(username) {
            let user = store.find_or_create_user(username).await?;
            store.add_moderator(&user.username, PRIMARY_SUBREDDIT).await?;
            tracing::info!(username, "now a moderator (sync)");
            bus.publish("mods.added", serde_json::to_value(ModsChanged { username: user.username, user_id: user.id })?).await?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::ProxyResponse;
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

    fn modlog_payload(action: &str, mod_username: &str, target_username: Option<&str>) -> Value {
        serde_json::to_value(ModlogRecord {
            action: action.to_string(),
            mod_username: mod_username.to_string(),
            target_username: target_username.map(|s| s.to_string()),
            subreddit: "borrow".into(),
            details: None,
            created_at: 0,
        })
        .unwrap()
    }

    #[tokio::test]
    async fn accept_invite_adds_moderator_and_publishes() {
        let store: Arc<dyn Store> = Arc::new(SqliteStore::open_in_memory().unwrap());
        let bus: Arc<dyn EventBus> = Arc::new(crate::bus::InMemoryEventBus::new());
        let mut sub = bus.subscribe("mods.added");

        handle_mod_change(&store, &bus, &modlog_payload("acceptmoderatorinvite", "alice", None)).await.unwrap();

        assert!(store.list_moderators(PRIMARY_SUBREDDIT).await.unwrap().contains(&"alice".to_string()));
        let (_, payload) = sub.recv().await.unwrap();
        assert_eq!(payload["username"], "alice");
    }

    #[tokio::test]
    async fn remove_moderator_uses_target_not_mod_field() {
        let store: Arc<dyn Store> = Arc::new(SqliteStore::open_in_memory().unwrap());
        store.add_moderator("bob", PRIMARY_SUBREDDIT).await.unwrap();
        let bus: Arc<dyn EventBus> = Arc::new(crate::bus::InMemoryEventBus::new());
        let mut sub = bus.subscribe("mods.removed");

        // mod_username is the moderator who performed the removal, not the
        // removed moderator - the payload's target_username must drive this.
        handle_mod_change(&store, &bus, &modlog_payload("removemoderator", "admin", Some("bob"))).await.unwrap();

        assert!(!store.list_moderators(PRIMARY_SUBREDDIT).await.unwrap().contains(&"bob".to_string()));
        let (_, payload) = sub.recv().await.unwrap();
        assert_eq!(payload["username"], "bob");
    }

    #[tokio::test]
    async fn unclaimed_new_mod_gets_claim_request_not_permissions() {
        let store: Arc<dyn Store> = Arc::new(SqliteStore::open_in_memory().unwrap());
        let user = store.find_or_create_user("alice").await.unwrap();
        let proxy = Arc::new(RecordingProxy { sent: Mutex::new(Vec::new()) });
        let templates: Arc<dyn TemplateStore> = Arc::new(StaticTemplateStore::new());
        let payload = serde_json::to_value(ModsChanged { username: "alice".into(), user_id: user.id }).unwrap();

        handle_mod_onboarding(&store, &(proxy.clone() as Arc<dyn ForumProxyClient>), &templates, &["read".to_string()], &payload).await.unwrap();

        assert!(store.get_permission_grant(user.id, "read").await.unwrap().is_none());
        let sent = proxy.sent.lock().unwrap();
        assert_eq!(sent[0].1["subject"], "Please claim your account");
    }

    #[tokio::test]
    async fn claimed_new_mod_gets_full_permissions_and_greeting() {
        let store: Arc<dyn Store> = Arc::new(SqliteStore::open_in_memory().unwrap());
        let user = store.find_or_create_user("alice").await.unwrap();
        store.mark_account_claimed(user.id).await.unwrap();
        let proxy = Arc::new(RecordingProxy { sent: Mutex::new(Vec::new()) });
        let templates: Arc<dyn TemplateStore> = Arc::new(StaticTemplateStore::new());
        let payload = serde_json::to_value(ModsChanged { username: "alice".into(), user_id: user.id }).unwrap();

        handle_mod_onboarding(&store, &(proxy.clone() as Arc<dyn ForumProxyClient>), &templates, &["read".to_string(), "post".to_string()], &payload)
            .await
            .unwrap();

        assert!(store.get_permission_grant(user.id, "read").await.unwrap().is_some());
        assert!(store.get_permission_grant(user.id, "post").await.unwrap().is_some());
        assert!(proxy.sent.lock().unwrap()[0].1["subject"].as_str().unwrap().contains("Welcome"));
    }

    #[tokio::test]
    async fn claim_grants_permissions_only_to_moderators() {
        let store: Arc<dyn Store> = Arc::new(SqliteStore::open_in_memory().unwrap());
        let non_mod = store.find_or_create_user("carol").await.unwrap();
        let proxy = Arc::new(RecordingProxy { sent: Mutex::new(Vec::new()) });
        let templates: Arc<dyn TemplateStore> = Arc::new(StaticTemplateStore::new());
        let payload = serde_json::to_value(UserSignup { user_id: non_mod.id }).unwrap();

        handle_mod_onboarding_claim(&store, &(proxy.clone() as Arc<dyn ForumProxyClient>), &templates, &["read".to_string()], &payload).await.unwrap();
        assert!(store.get_permission_grant(non_mod.id, "read").await.unwrap().is_none());
        assert!(proxy.sent.lock().unwrap().is_empty());

        store.add_moderator("carol", PRIMARY_SUBREDDIT).await.unwrap();
        handle_mod_onboarding_claim(&store, &(proxy.clone() as Arc<dyn ForumProxyClient>), &templates, &["read".to_string()], &payload).await.unwrap();
        assert!(store.get_permission_grant(non_mod.id, "read").await.unwrap().is_some());
        assert!(!proxy.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn offboarding_revokes_all_but_default_permissions() {
        let store: Arc<dyn Store> = Arc::new(SqliteStore::open_in_memory().unwrap());
        let user = store.find_or_create_user("alice").await.unwrap();
        store.insert_permission_grant(user.id, "read").await.unwrap();
        store.insert_permission_grant(user.id, "ban").await.unwrap();
        let proxy = Arc::new(RecordingProxy { sent: Mutex::new(Vec::new()) });
        let templates: Arc<dyn TemplateStore> = Arc::new(StaticTemplateStore::new());
        let payload = serde_json::to_value(ModsChanged { username: "alice".into(), user_id: user.id }).unwrap();

        handle_mod_offboarding(&store, &(proxy.clone() as Arc<dyn ForumProxyClient>), &templates, &["read".to_string()], &payload).await.unwrap();

        assert!(store.list_permission_grants(user.id).await.unwrap().contains(&"read".to_string()));
        assert!(!store.list_permission_grants(user.id).await.unwrap().contains(&"ban".to_string()));
        assert!(proxy.sent.lock().unwrap()[0].1["subject"].as_str().unwrap().contains("Thanks"));
    }

    #[tokio::test]
    async fn onboarding_messages_sends_the_next_one_in_sequence_and_advances() {
        let store: Arc<dyn Store> = Arc::new(SqliteStore::open_in_memory().unwrap());
        store.add_moderator("alice", PRIMARY_SUBREDDIT).await.unwrap();
        let proxy = Arc::new(RecordingProxy { sent: Mutex::new(Vec::new()) });
        let templates: Arc<dyn TemplateStore> = Arc::new(StaticTemplateStore::new());

        send_onboarding_messages(&store, &(proxy.clone() as Arc<dyn ForumProxyClient>), &templates).await.unwrap();
        assert_eq!(store.get_mod_onboarding_progress("alice").await.unwrap(), 1);
        assert!(proxy.sent.lock().unwrap()[0].1["subject"].as_str().unwrap().contains("1/2"));

        send_onboarding_messages(&store, &(proxy.clone() as Arc<dyn ForumProxyClient>), &templates).await.unwrap();
        assert_eq!(store.get_mod_onboarding_progress("alice").await.unwrap(), 2);
        assert!(proxy.sent.lock().unwrap()[1].1["subject"].as_str().unwrap().contains("2/2"));

        // sequence exhausted: a third run sends nothing further
        proxy.sent.lock().unwrap().clear();
        send_onboarding_messages(&store, &(proxy.clone() as Arc<dyn ForumProxyClient>), &templates).await.unwrap();
        assert!(proxy.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn sync_adds_and_removes_moderators_against_the_live_list() {
        let store: Arc<dyn Store> = Arc::new(SqliteStore::open_in_memory().unwrap());
        store.add_moderator("stale", PRIMARY_SUBREDDIT).await.unwrap();

        struct FakeProxy;
        #[async_trait]
        impl ForumProxyClient for FakeProxy {
            async fn send_request(&self, request_type: &str, _args: Value) -> Result<ProxyResponse, crate::proxy::ProxyError> {
                assert_eq!(request_type, "subreddit_moderators");
                Ok(ProxyResponse { kind: "copy".into(), info: serde_json::json!({"mods": [{"username": "fresh"}]}) })
            }
        }
        let proxy: Arc<dyn ForumProxyClient> = Arc::new(FakeProxy);
        let bus: Arc<dyn EventBus> = Arc::new(crate::bus::InMemoryEventBus::new());
        let mut added_sub = bus.subscribe("mods.added");
        let mut removed_sub = bus.subscribe("mods.removed");

        sync_moderators(&store, &proxy, &bus, &["borrow".to_string()]).await.unwrap();

        let moderators = store.list_moderators(PRIMARY_SUBREDDIT).await.unwrap();
        assert!(moderators.contains(&"fresh".to_string()));
        assert!(!moderators.contains(&"stale".to_string()));
        assert_eq!(removed_sub.recv().await.unwrap().1["username"], "stale");
        assert_eq!(added_sub.recv().await.unwrap().1["username"], "fresh");
    }

}
