//! Currency conversion with a cached external rate source (C2).
//!
//! Grounded on `original_source/src/convert.py` for the rate semantics and
//! cache-fill-on-miss behavior, and on the teacher's
//! `fetch_data/providers/hyperliquid.rs` for the reqwest + exponential-backoff
//! retry idiom.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use super::{SUPPORTED_CURRENCIES, exponent_for};
use crate::cache::Cache;

pub const CACHE_KEY_PREFIX: &str = "loansbot/convert";
pub const DEFAULT_CACHE_TTL_SECONDS: u64 = 14_400;

#[derive(Debug, Error)]
pub enum FxError {
    #[error("unknown currency code `{0}`")]
    UnknownCurrency(String),
    #[error("fx source failed after retries: {0}")]
    Source(#[from] anyhow::Error),
}

/// The external currency-rate API (e.g. currencylayer), defined only by the
/// interface the core consumes: given a source currency, return the minor-unit
/// rate to every supported target in a single request.
#[async_trait]
pub trait FxSource: Send + Sync {
    /// Returns `{target_iso: dollar_rate}` where `dollar_rate` is the raw
    /// major-unit rate reported by the API (not yet adjusted for exponents).
    async fn fetch_rates(&self, source: &str) -> anyhow::Result<HashMap<String, f64>>;
}

/// reqwest-backed adapter for a currencylayer-shaped `/live` endpoint, with
/// up to 5 retries at `2^attempt` second backoff — identical to
/// `convert.py::fill_cache`.
pub struct HttpFxSource {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl HttpFxSource {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
            api_key: api_key.into(),
        }
    }
}

#[async_trait]
impl FxSource for HttpFxSource {
    async fn fetch_rates(&self, source: &str) -> anyhow::Result<HashMap<String, f64>> {
        let currencies: Vec<&str> = SUPPORTED_CURRENCIES.iter().map(|c| c.code).collect();
        let mut last_err = None;
        for attempt in 1..=5u32 {
            let result = self
                .client
                .get(format!("{}/live", self.base_url))
                .query(&[
                    ("access_key", self.api_key.as_str()),
                    ("currencies", currencies.join(",").as_str()),
                    ("source", source),
                    ("format", "1"),
                ])
                .send()
                .await
                .and_then(|r| r.error_for_status());

            match result {
                Ok(resp) => {
                    let body: serde_json::Value = resp.json().await?;
                    let quotes = body
                        .get("quotes")
                        .and_then(|q| q.as_object())
                        .ok_or_else(|| anyhow::anyhow!("fx response missing `quotes`"))?;
                    let mut rates = HashMap::new();
                    for (pair, rate) in quotes {
                        if let Some(target) = pair.strip_prefix(source) {
                            if let Some(r) = rate.as_f64() {
                                rates.insert(target.to_string(), r);
                            }
                        }
                    }
                    return Ok(rates);
                }
                Err(e) => {
                    tracing::warn!(attempt, source, error = %e, "fx source request failed");
                    last_err = Some(e);
                    if attempt < 5 {
                        tokio::time::sleep(Duration::from_secs(2u64.pow(attempt))).await;
                    }
                }
            }
        }
        Err(anyhow::anyhow!(last_err.unwrap()))
    }
}

/// Cached FX conversion. `convert(from, to)` returns a rate such that
/// `minor_from * rate = minor_to` (exponent difference already embedded).
pub struct FxCache {
    cache: Arc<dyn Cache>,
    source: Arc<dyn FxSource>,
    ttl: Duration,
}

impl FxCache {
    pub fn new(cache: Arc<dyn Cache>, source: Arc<dyn FxSource>, ttl: Duration) -> Self {
        Self { cache, source, ttl }
    }

    fn cache_key(from: &str, to: &str) -> String {
        format!("{CACHE_KEY_PREFIX}/{from}-{to}")
    }

    pub async fn convert(&self, from: &str, to: &str) -> Result<f64, FxError> {
        let from_exp = exponent_for(from).map_err(|_| FxError::UnknownCurrency(from.to_string()))?;
        let to_exp = exponent_for(to).map_err(|_| FxError::UnknownCurrency(to.to_string()))?;

        if from == to {
            return Ok(1.0);
        }

        let dollar_rate = if let Some(raw) = self.cache.get(&Self::cache_key(from, to)).await {
            raw.parse::<f64>().unwrap_or(1.0)
        } else if let Some(raw) = self.cache.get(&Self::cache_key(to, from)).await {
            1.0 / raw.parse::<f64>().unwrap_or(1.0)
        } else {
            self.fill_cache(from).await?;
            let raw = self
                .cache
                .get(&Self::cache_key(from, to))
                .await
                .ok_or_else(|| FxError::Source(anyhow::anyhow!("fx cache fill did not populate {from}-{to}")))?;
            raw.parse::<f64>().unwrap_or(1.0)
        };

        let exp_diff = to_exp as i32 - from_exp as i32;
        Ok(dollar_rate * 10f64.powi(exp_diff))
    }

    /// Fetch `from -> {all supported targets}` in one request and cache
    /// every pair, matching `convert.py::fill_cache`.
    async fn fill_cache(&self, from: &str) -> Result<(), FxError> {
        let rates = self.source.fetch_rates(from).await?;
        for (target, rate) in rates {
            self.cache
                .set(&Self::cache_key(from, &target), rate.to_string(), self.ttl)
                .await;
        }
        Ok(())
    }
}
