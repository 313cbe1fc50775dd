//! Deprecated-endpoint usage reminders (§4.9 "deprecated_alerts").
//!
//! Grounded on `original_source/src/runners/deprecated_alerts.py`'s three
//! alert passes — initial (never alerted), monthly reminder, and a
//! throttled-every-3-days urgent pass once within 27 days of sunset — but
//! collapsed onto the simpler `(username, endpoint) -> (last_used_at,
//! last_alerted_at)` pair this crate tracks instead of the original's
//! separate `endpoint_users`/`endpoint_alerts` audit tables (see DESIGN.md).
//! A single pass over [`Store::list_endpoint_alert_states`] picks whichever
//! rule applies to each row instead of running three separate queries.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{TimeZone, Utc};

use crate::config::Config;
use crate::proxy::ForumProxyClient;
use crate::signals::ShutdownToken;
use crate::store::Store;
use crate::templates::{self, TemplateStore};

const SCHEDULE_HOUR: u32 = 13;
const SCHEDULE_MINUTE: u32 = 0;
const URGENT_WINDOW_SECONDS: i64 = 27 * 86_400;
const URGENT_THROTTLE_SECONDS: i64 = 3 * 86_400;
/// Stands in for "once per calendar month" (§9's collapsed schema keeps no
/// calendar-aligned boundary, only a last-alerted timestamp).
const MONTHLY_THROTTLE_SECONDS: i64 = 30 * 86_400;

pub async fn deprecated_alerts_worker(
    store: Arc<dyn Store>,
    proxy: Arc<dyn ForumProxyClient>,
    templates: Arc<dyn TemplateStore>,
    config: Arc<Config>,
    shutdown: ShutdownToken,
    now_fn: impl Fn() -> i64,
) -> anyhow::Result<()> {
    loop {
        if shutdown.is_shutting_down() {
            return Ok(());
        }
        tokio::time::sleep(super::duration_until(SCHEDULE_HOUR, SCHEDULE_MINUTE, now_fn())).await;
        if shutdown.is_shutting_down() {
            return Ok(());
        }
        if let Err(err) = send_due_alerts(&store, &proxy, &templates, &config, now_fn()).await {
            tracing::error!(?err, "deprecated_alerts run failed");
        }
    }
}

struct DueEndpoint {
    endpoint: String,
    last_used_at: i64,
    sunset_at: i64,
}

pub async fn send_due_alerts(store: &Arc<dyn Store>, proxy: &Arc<dyn ForumProxyClient>, templates: &Arc<dyn TemplateStore>, config: &Arc<Config>, now: i64) -> anyhow::Result<()> {
    let states = store.list_endpoint_alert_states().await?;

    let mut due_by_user: HashMap<String, Vec<DueEndpoint>> = HashMap::new();
    for (username, endpoint, last_used_at, last_alerted_at) in states {
        let Some(&(_, sunset_at)) = config.deprecated_endpoint_sunsets.iter().find(|(e, _)| e == &endpoint) else {
            continue;
        };
        // Nothing to say if the user hasn't touched the endpoint since we
        // last told them about it (this also lets the never-alerted case
        // through, since `last_alerted_at` starts at 0).
        if last_used_at <= last_alerted_at {
            continue;
        }

        let throttle = if sunset_at > now && sunset_at - now <= URGENT_WINDOW_SECONDS {
            URGENT_THROTTLE_SECONDS
        } else {
            MONTHLY_THROTTLE_SECONDS
        };
        if last_alerted_at != 0 && now - last_alerted_at < throttle {
            continue;
        }

        due_by_user.entry(username).or_default().push(DueEndpoint { endpoint, last_used_at, sunset_at });
    }

    for (username, endpoints) in due_by_user {
        send_alert_for_user(store, proxy, templates, &username, &endpoints, now).await?;
    }
    Ok(())
}

async fn send_alert_for_user(store: &Arc<dyn Store>, proxy: &Arc<dyn ForumProxyClient>, templates: &Arc<dyn TemplateStore>, username: &str, endpoints: &[DueEndpoint], now: i64) -> anyhow::Result<()> {
    let mut lines = vec!["Endpoint | Sunsets on".to_string(), ":--|:--".to_string()];
    for ep in endpoints {
        lines.push(format!("{}|{}", ep.endpoint, pretty_date(ep.sunset_at)));
    }

    let mut params = HashMap::new();
    params.insert("username", username.to_string());
    params.insert("endpoints_table", lines.join("\n"));
    let Some((title, body)) = templates::render_letter(templates.as_ref(), "deprecated_alerts_reminder", &params) else {
        return Ok(());
    };

    proxy.send_request("compose", serde_json::json!({"recipient": username, "subject": title, "body": body})).await?;

    for ep in endpoints {
        store.set_endpoint_alert_state(username, &ep.endpoint, ep.last_used_at, now).await?;
    }
    Ok(())
}

fn pretty_date(epoch: i64) -> String {
    Utc.timestamp_opt(epoch, 0).single().map(|dt| dt.format("%b %d, %Y").to_string()).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::ProxyResponse;
    use crate::store::sqlite::SqliteStore;
    use crate::templates::StaticTemplateStore;
    use async_trait::async_trait;
    use serde_json::Value;
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

    fn cfg(sunsets: Vec<(String, i64)>) -> Arc<Config> {
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
            deprecated_endpoint_sunsets: sunsets,
        })
    }

    #[tokio::test]
    async fn never_alerted_user_gets_an_initial_alert() {
        let store: Arc<dyn Store> = Arc::new(SqliteStore::open_in_memory().unwrap());
        store.set_endpoint_alert_state("alice", "/v1/old", 1_000, 0).await.unwrap();
        let proxy = Arc::new(RecordingProxy { sent: Mutex::new(Vec::new()) });
        let templates: Arc<dyn TemplateStore> = Arc::new(StaticTemplateStore::new());
        let config = cfg(vec![("/v1/old".to_string(), 50_000_000)]);

        send_due_alerts(&store, &(proxy.clone() as Arc<dyn ForumProxyClient>), &templates, &config, 2_000).await.unwrap();

        assert_eq!(proxy.sent.lock().unwrap().len(), 1);
        let (_, _, _, last_alerted_at) = store.list_endpoint_alert_states().await.unwrap().into_iter().next().unwrap();
        assert_eq!(last_alerted_at, 2_000);
    }

    #[tokio::test]
    async fn throttles_monthly_alert_until_the_interval_passes() {
        let store: Arc<dyn Store> = Arc::new(SqliteStore::open_in_memory().unwrap());
        store.set_endpoint_alert_state("alice", "/v1/old", 1_000, 500).await.unwrap();
        let proxy = Arc::new(RecordingProxy { sent: Mutex::new(Vec::new()) });
        let templates: Arc<dyn TemplateStore> = Arc::new(StaticTemplateStore::new());
        let config = cfg(vec![("/v1/old".to_string(), 50_000_000)]);

        // only a day since the last alert and far from sunset: not due yet
        send_due_alerts(&store, &(proxy.clone() as Arc<dyn ForumProxyClient>), &templates, &config, 500 + 86_400).await.unwrap();
        assert!(proxy.sent.lock().unwrap().is_empty());

        // past the monthly throttle, and used again since the last alert
        store.set_endpoint_alert_state("alice", "/v1/old", 500 + MONTHLY_THROTTLE_SECONDS + 10, 500).await.unwrap();
        send_due_alerts(&store, &(proxy.clone() as Arc<dyn ForumProxyClient>), &templates, &config, 500 + MONTHLY_THROTTLE_SECONDS + 20).await.unwrap();
        assert_eq!(proxy.sent.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn urgent_window_throttles_every_three_days_instead_of_monthly() {
        let store: Arc<dyn Store> = Arc::new(SqliteStore::open_in_memory().unwrap());
        let now = 10_000_000;
        let sunset_at = now + 10 * 86_400; // inside the 27-day urgent window
        store.set_endpoint_alert_state("alice", "/v1/old", now - 1, now - URGENT_THROTTLE_SECONDS).await.unwrap();
        let proxy = Arc::new(RecordingProxy { sent: Mutex::new(Vec::new()) });
        let templates: Arc<dyn TemplateStore> = Arc::new(StaticTemplateStore::new());
        let config = cfg(vec![("/v1/old".to_string(), sunset_at)]);

        send_due_alerts(&store, &(proxy.clone() as Arc<dyn ForumProxyClient>), &templates, &config, now).await.unwrap();
        assert_eq!(proxy.sent.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn no_usage_since_last_alert_is_skipped() {
        let store: Arc<dyn Store> = Arc::new(SqliteStore::open_in_memory().unwrap());
        store.set_endpoint_alert_state("alice", "/v1/old", 500, 500).await.unwrap();
        let proxy = Arc::new(RecordingProxy { sent: Mutex::new(Vec::new()) });
        let templates: Arc<dyn TemplateStore> = Arc::new(StaticTemplateStore::new());
        let config = cfg(vec![("/v1/old".to_string(), 50_000_000)]);

        send_due_alerts(&store, &(proxy.clone() as Arc<dyn ForumProxyClient>), &templates, &config, 500 + MONTHLY_THROTTLE_SECONDS * 2).await.unwrap();
        assert!(proxy.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn unknown_endpoint_is_ignored() {
        let store: Arc<dyn Store> = Arc::new(SqliteStore::open_in_memory().unwrap());
        store.set_endpoint_alert_state("alice", "/v1/mystery", 1_000, 0).await.unwrap();
        let proxy = Arc::new(RecordingProxy { sent: Mutex::new(Vec::new()) });
        let templates: Arc<dyn TemplateStore> = Arc::new(StaticTemplateStore::new());
        let config = cfg(vec![]);

        send_due_alerts(&store, &(proxy.clone() as Arc<dyn ForumProxyClient>), &templates, &config, 2_000).await.unwrap();
        assert!(proxy.sent.lock().unwrap().is_empty());
    }
}
