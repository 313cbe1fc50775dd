//! Runtime configuration loaded once from the environment (§6).
//!
//! Grounded on the teacher's `run::config::RuntimeConfig::from_cli`: plain
//! `std::env::var` resolution, no external config-file crate, missing
//! required variables fail fast with a named, contextual error.

use anyhow::{Context, Result, bail};

/// Resolved runtime configuration. One instance is built at process start
/// and handed (behind an `Arc`) to every worker in the fleet.
#[derive(Debug, Clone)]
pub struct Config {
    pub currency_layer_api_key: String,
    pub currency_layer_cache_time_seconds: u64,
    pub subreddits: Vec<String>,
    pub amqp_url: String,
    pub amqp_reddit_proxy_queue: String,
    pub amqp_response_queue_prefix: String,
    pub memcached_host: String,
    pub memcached_port: u16,
    pub karma_min: i64,
    pub comment_karma_min: i64,
    pub account_age_seconds_min: i64,
    pub ignored_users: Vec<String>,
    pub default_permissions: Vec<String>,
    /// Permissions granted in full to every moderator on onboarding/claim and
    /// stripped on offboarding (§4.9 mod_onboarding/mod_onboarding_claim/
    /// mod_offboarding). Distinct from `default_permissions`, which applies
    /// to every signed-up user regardless of moderator status.
    pub mod_permissions: Vec<String>,
    pub appname: String,
    /// `endpoint:unix_timestamp` pairs naming when a deprecated endpoint's
    /// replacement goes live, consumed by the deprecated_alerts worker.
    /// Not part of the owned-namespace schema (see DESIGN.md); kept here
    /// rather than inventing an `endpoints` table.
    pub deprecated_endpoint_sunsets: Vec<(String, i64)>,
}

impl Config {
    /// Resolution order and defaults match `perms/manager.py` and
    /// `convert.py` in `original_source`. `CURRENCY_LAYER_CACHE_TIME`'s
    /// default-of-14400 decision is recorded in DESIGN.md (§9 Open Question).
    pub fn from_env() -> Result<Self> {
        let currency_layer_api_key =
            std::env::var("CURRENCY_LAYER_API_KEY").context("CURRENCY_LAYER_API_KEY must be set")?;

        let currency_layer_cache_time_seconds = match std::env::var("CURRENCY_LAYER_CACHE_TIME") {
            Ok(v) => v.parse().context("CURRENCY_LAYER_CACHE_TIME must be an integer number of seconds")?,
            Err(_) => crate::money::fx::DEFAULT_CACHE_TTL_SECONDS,
        };

        let subreddits: Vec<String> = std::env::var("SUBREDDITS")
            .context("SUBREDDITS must be set (comma-separated list)")?
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();
        if subreddits.is_empty() {
            bail!("SUBREDDITS must name at least one subreddit");
        }

        let amqp_url = std::env::var("AMQP_URL").unwrap_or_else(|_| "amqp://localhost:5672/%2f".to_string());
        let amqp_reddit_proxy_queue =
            std::env::var("AMQP_REDDIT_PROXY_QUEUE").unwrap_or_else(|_| "reddit_proxy".to_string());
        let amqp_response_queue_prefix =
            std::env::var("AMQP_RESPONSE_QUEUE_PREFIX").unwrap_or_else(|_| "responses".to_string());

        let memcached_host = std::env::var("MEMCACHED_HOST").unwrap_or_else(|_| "localhost".to_string());
        let memcached_port: u16 = std::env::var("MEMCACHED_PORT")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(11211);

        let karma_min: i64 = std::env::var("KARMA_MIN").context("KARMA_MIN must be set")?.parse().context("KARMA_MIN must be an integer")?;
        let comment_karma_min: i64 = match std::env::var("COMMENT_KARMA_MIN") {
            Ok(v) => v.parse().context("COMMENT_KARMA_MIN must be an integer")?,
            Err(_) => (0.4 * karma_min as f64) as i64,
        };
        let account_age_seconds_min: i64 = std::env::var("ACCOUNT_AGE_SECONDS_MIN")
            .context("ACCOUNT_AGE_SECONDS_MIN must be set")?
            .parse()
            .context("ACCOUNT_AGE_SECONDS_MIN must be an integer")?;

        let ignored_users: Vec<String> = std::env::var("IGNORED_USERS")
            .unwrap_or_else(|_| "LoansBot".to_string())
            .split(',')
            .map(|s| s.trim().to_lowercase())
            .filter(|s| !s.is_empty())
            .collect();

        let default_permissions: Vec<String> = std::env::var("DEFAULT_PERMISSIONS")
            .unwrap_or_default()
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        let mod_permissions: Vec<String> = std::env::var("MOD_PERMISSIONS")
            .unwrap_or_default()
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        let appname = std::env::var("APPNAME").unwrap_or_else(|_| "loansbot".to_string());

        let deprecated_endpoint_sunsets: Vec<(String, i64)> = std::env::var("DEPRECATED_ENDPOINT_SUNSETS")
            .unwrap_or_default()
            .split(',')
            .filter_map(|pair| {
                let pair = pair.trim();
                if pair.is_empty() {
                    return None;
                }
                let (endpoint, ts) = pair.split_once(':')?;
                ts.trim().parse::<i64>().ok().map(|ts| (endpoint.trim().to_string(), ts))
            })
            .collect();

        Ok(Self {
            currency_layer_api_key,
            currency_layer_cache_time_seconds,
            subreddits,
            amqp_url,
            amqp_reddit_proxy_queue,
            amqp_response_queue_prefix,
            memcached_host,
            memcached_port,
            karma_min,
            comment_karma_min,
            account_age_seconds_min,
            ignored_users,
            default_permissions,
            mod_permissions,
            appname,
            deprecated_endpoint_sunsets,
        })
    }
}
