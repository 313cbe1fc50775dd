//! Daily loans-stats cache population (§4.9 "loans_stats").
//!
//! Grounded on `original_source/src/runners/loans_stats.py`: group every
//! non-deleted loan's created/repaid/unpaid timestamps by UTC year and
//! month, tally a count and a USD total per bucket, flatten to parallel
//! categories/series arrays, then roll the monthly series up to quarterly.
//! The four resulting plots are written to the memcached-backed cache under
//! `stats/loans/{count,usd}/{monthly,quarterly}`, which is what serves the
//! `/api/loans/stats/{unit}/{frequency}` endpoint (out of scope here).

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{Datelike, TimeZone, Utc};
use serde_json::{Value, json};

use crate::cache::Cache;
use crate::signals::ShutdownToken;
use crate::store::Store;

const SCHEDULE_HOUR: u32 = 8;
const SCHEDULE_MINUTE: u32 = 0;
/// A year's worth of history is plenty to answer the stats endpoint; no
/// original analogue needed one (the cache is simply overwritten daily).
const PLOT_CACHE_TTL: Duration = Duration::from_secs(2 * 86_400);

/// Runs `update_stats` once a day at 08:00 UTC, matching the original's
/// "presumably off-peak hours" comment.
pub async fn loans_stats_worker(store: Arc<dyn Store>, cache: Arc<dyn Cache>, shutdown: ShutdownToken, now_fn: impl Fn() -> i64) -> anyhow::Result<()> {
    loop {
        if shutdown.is_shutting_down() {
            return Ok(());
        }
        tokio::time::sleep(super::duration_until(SCHEDULE_HOUR, SCHEDULE_MINUTE, now_fn())).await;
        if shutdown.is_shutting_down() {
            return Ok(());
        }
        if let Err(err) = update_stats(&store, &cache, now_fn()).await {
            tracing::error!(?err, "loans_stats update failed");
        }
    }
}

#[derive(Default, Clone, Copy)]
struct Bucket {
    count: i64,
    usd_minor: i64,
}

/// One (year, month) key per §9.1's calendar bucketing; `BTreeMap` keeps the
/// keys sorted without a separate sort pass, matching the original's
/// `sorted(all_keys)`.
type Series = BTreeMap<(i32, u32), Bucket>;

pub async fn update_stats(store: &Arc<dyn Store>, cache: &Arc<dyn Cache>, now: i64) -> anyhow::Result<()> {
    let loans = store.list_loans_with_usd_for_stats().await?;

    let mut lent = Series::new();
    let mut repaid = Series::new();
    let mut unpaid = Series::new();

    for (loan, principal_usd_minor) in &loans {
        if let Some(key) = year_month(loan.created_at) {
            accumulate(&mut lent, key, *principal_usd_minor);
        }
        if let Some(repaid_at) = loan.repaid_at {
            if let Some(key) = year_month(repaid_at) {
                accumulate(&mut repaid, key, *principal_usd_minor);
            }
        }
        if let Some(unpaid_at) = loan.unpaid_at {
            if let Some(key) = year_month(unpaid_at) {
                accumulate(&mut unpaid, key, *principal_usd_minor);
            }
        }
    }

    let mut categories: Vec<(i32, u32)> = lent.keys().chain(repaid.keys()).chain(unpaid.keys()).copied().collect();
    categories.sort_unstable();
    categories.dedup();

    let monthly_categories: Vec<String> = categories.iter().map(|(y, m)| format!("{y}-{m}")).collect();
    let quarterly_categories = quarterly_category_labels(&categories);

    let count_monthly = build_plot("Monthly Count", "Month", "Count", now, &monthly_categories, &categories, &lent, &repaid, &unpaid, |b| b.count);
    let usd_monthly = build_plot("Monthly Usd", "Month", "Usd", now, &monthly_categories, &categories, &lent, &repaid, &unpaid, |b| b.usd_minor / 100);

    let count_quarterly = roll_up_to_quarterly("Quarterly Count", "Quarter", "Count", now, &categories, &quarterly_categories, &count_monthly);
    let usd_quarterly = roll_up_to_quarterly("Quarterly Usd", "Quarter", "Usd", now, &categories, &quarterly_categories, &usd_monthly);

    cache.set("stats/loans/count/monthly", count_monthly.to_string(), PLOT_CACHE_TTL).await;
    cache.set("stats/loans/usd/monthly", usd_monthly.to_string(), PLOT_CACHE_TTL).await;
    cache.set("stats/loans/count/quarterly", count_quarterly.to_string(), PLOT_CACHE_TTL).await;
    cache.set("stats/loans/usd/quarterly", usd_quarterly.to_string(), PLOT_CACHE_TTL).await;
    Ok(())
}

fn year_month(epoch: i64) -> Option<(i32, u32)> {
    Utc.timestamp_opt(epoch, 0).single().map(|dt| (dt.year(), dt.month()))
}

fn accumulate(series: &mut Series, key: (i32, u32), usd_minor: i64) {
    let bucket = series.entry(key).or_default();
    bucket.count += 1;
    bucket.usd_minor += usd_minor;
}

fn month_to_quarter(month: u32) -> u32 {
    (month - 1) / 3 + 1
}

fn quarterly_category_labels(categories: &[(i32, u32)]) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for (year, month) in categories {
        let label = format!("{year}Q{}", month_to_quarter(*month));
        if out.last() != Some(&label) {
            out.push(label);
        }
    }
    out
}

#[allow(clippy::too_many_arguments)]
fn build_plot(
    title: &str,
    x_axis: &str,
    y_axis: &str,
    generated_at: i64,
    pretty_categories: &[String],
    categories: &[(i32, u32)],
    lent: &Series,
    repaid: &Series,
    unpaid: &Series,
    extract: impl Fn(&Bucket) -> i64,
) -> Value {
    let series = |name: &str, values: &Series| -> Value {
        let data: Vec<i64> = categories.iter().map(|k| values.get(k).map(&extract).unwrap_or(0)).collect();
        json!({"name": name, "data": data})
    };

    json!({
        "title": title,
        "x_axis": x_axis,
        "y_axis": y_axis,
        "generated_at": generated_at,
        "data": {
            "categories": pretty_categories,
            "series": [series("Lent", lent), series("Repaid", repaid), series("Unpaid", unpaid)],
        },
    })
}

/// Sums adjacent monthly entries that fall in the same quarter, for each
/// series in `monthly_plot` in turn.
fn roll_up_to_quarterly(title: &str, x_axis: &str, y_axis: &str, generated_at: i64, categories: &[(i32, u32)], quarterly_categories: &[String], monthly_plot: &Value) -> Value {
    let quarter_keys: Vec<(i32, u32)> = categories.iter().map(|(y, m)| (*y, month_to_quarter(*m))).collect();

    let series_list = monthly_plot["data"]["series"].as_array().cloned().unwrap_or_default();
    let rolled: Vec<Value> = series_list
        .into_iter()
        .map(|series| {
            let name = series["name"].as_str().unwrap_or("").to_string();
            let monthly_values: Vec<i64> = series["data"].as_array().map(|a| a.iter().filter_map(|v| v.as_i64()).collect()).unwrap_or_default();

            let mut quarterly_values: Vec<i64> = Vec::new();
            let mut last_key: Option<(i32, u32)> = None;
            for (idx, key) in quarter_keys.iter().enumerate() {
                let value = monthly_values.get(idx).copied().unwrap_or(0);
                if last_key == Some(*key) {
                    *quarterly_values.last_mut().unwrap() += value;
                } else {
                    last_key = Some(*key);
                    quarterly_values.push(value);
                }
            }
            json!({"name": name, "data": quarterly_values})
        })
        .collect();

    json!({
        "title": title,
        "x_axis": x_axis,
        "y_axis": y_axis,
        "generated_at": generated_at,
        "data": {"categories": quarterly_categories, "series": rolled},
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::TtlCache;
    use crate::store::sqlite::SqliteStore;

    fn epoch(year: i32, month: u32, day: u32) -> i64 {
        Utc.with_ymd_and_hms(year, month, day, 0, 0, 0).unwrap().timestamp()
    }

    #[tokio::test]
    async fn aggregates_lent_repaid_and_unpaid_across_months() {
        let store: Arc<dyn Store> = Arc::new(SqliteStore::open_in_memory().unwrap());
        let lender = store.find_or_create_user("alice").await.unwrap();
        let borrower = store.find_or_create_user("bob").await.unwrap();
        let currency = store.find_or_create_currency("USD").await.unwrap();

        let principal1 = store.create_money(currency.id, 10_000, 10_000).await.unwrap();
        let repaid_money = store.create_money(currency.id, 10_000, 10_000).await.unwrap();
        let loan1 = store.create_loan(lender.id, borrower.id, principal1.id, repaid_money.id, epoch(2024, 1, 15)).await.unwrap();
        store.set_loan_repaid_at(loan1.id, Some(epoch(2024, 2, 1))).await.unwrap();

        let principal2 = store.create_money(currency.id, 5_000, 5_000).await.unwrap();
        let unrepaid = store.create_money(currency.id, 0, 0).await.unwrap();
        let loan2 = store.create_loan(lender.id, borrower.id, principal2.id, unrepaid.id, epoch(2024, 1, 20)).await.unwrap();
        store.set_loan_unpaid_at(loan2.id, Some(epoch(2024, 3, 1))).await.unwrap();

        let cache: Arc<dyn Cache> = Arc::new(TtlCache::new());
        update_stats(&store, &cache, epoch(2024, 3, 2)).await.unwrap();

        let count_monthly: Value = serde_json::from_str(&cache.get("stats/loans/count/monthly").await.unwrap()).unwrap();
        assert_eq!(count_monthly["data"]["categories"], json!(["2024-1", "2024-2", "2024-3"]));
        let lent_series = count_monthly["data"]["series"][0].clone();
        assert_eq!(lent_series["name"], "Lent");
        assert_eq!(lent_series["data"], json!([2, 0, 0]));
        let repaid_series = count_monthly["data"]["series"][1].clone();
        assert_eq!(repaid_series["data"], json!([0, 1, 0]));
        let unpaid_series = count_monthly["data"]["series"][2].clone();
        assert_eq!(unpaid_series["data"], json!([0, 0, 1]));

        let usd_monthly: Value = serde_json::from_str(&cache.get("stats/loans/usd/monthly").await.unwrap()).unwrap();
        assert_eq!(usd_monthly["data"]["series"][0]["data"], json!([150, 0, 0]));
    }

    #[tokio::test]
    async fn quarterly_sums_adjacent_same_quarter_months() {
        let store: Arc<dyn Store> = Arc::new(SqliteStore::open_in_memory().unwrap());
        let lender = store.find_or_create_user("alice").await.unwrap();
        let borrower = store.find_or_create_user("bob").await.unwrap();
        let currency = store.find_or_create_currency("USD").await.unwrap();
        let repaid_money = store.create_money(currency.id, 0, 0).await.unwrap();

        for (month, amount) in [(1, 1_000), (2, 2_000), (4, 3_000)] {
            let principal = store.create_money(currency.id, amount, amount).await.unwrap();
            store.create_loan(lender.id, borrower.id, principal.id, repaid_money.id, epoch(2024, month, 1)).await.unwrap();
        }

        let cache: Arc<dyn Cache> = Arc::new(TtlCache::new());
        update_stats(&store, &cache, epoch(2024, 4, 2)).await.unwrap();

        let count_quarterly: Value = serde_json::from_str(&cache.get("stats/loans/count/quarterly").await.unwrap()).unwrap();
        assert_eq!(count_quarterly["data"]["categories"], json!(["2024Q1", "2024Q2"]));
        assert_eq!(count_quarterly["data"]["series"][0]["data"], json!([2, 1]));

        let usd_quarterly: Value = serde_json::from_str(&cache.get("stats/loans/usd/quarterly").await.unwrap()).unwrap();
        assert_eq!(usd_quarterly["data"]["series"][0]["data"], json!([30, 30]));
    }

    #[tokio::test]
    async fn empty_store_produces_empty_plots_without_error() {
        let store: Arc<dyn Store> = Arc::new(SqliteStore::open_in_memory().unwrap());
        let cache: Arc<dyn Cache> = Arc::new(TtlCache::new());
        update_stats(&store, &cache, 0).await.unwrap();
        let count_monthly: Value = serde_json::from_str(&cache.get("stats/loans/count/monthly").await.unwrap()).unwrap();
        assert_eq!(count_monthly["data"]["categories"], json!([]));
    }
}
