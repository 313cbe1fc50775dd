//! Supervisor binary: wires the ledger, permission cache, template store,
//! and forum-proxy bridge, then spawns the full worker fleet (§4, §5).
//!
//! Grounded on the teacher's `run::run`/`run_async` split (parse CLI,
//! build a tokio runtime, hand off to an async entry point) and on
//! `workers/mod.rs`'s documented contract: tear down the whole fleet the
//! moment any one worker task returns or panics, rather than trying to keep
//! the process alive half-staffed.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use clap::Parser;
use tokio::task::JoinSet;

use loansbot::bus::{EventBus, InMemoryEventBus};
use loansbot::cache::{Cache, TtlCache};
use loansbot::config::Config;
use loansbot::ledger::Ledger;
use loansbot::money::fx::{FxCache, HttpFxSource};
use loansbot::perms::{self, PermissionCache};
use loansbot::proxy::{BusForumProxy, ForumProxyClient};
use loansbot::queue::{DelayedQueue, InMemoryDelayedQueue};
use loansbot::scanner::{self, Scanner};
use loansbot::signals::ShutdownToken;
use loansbot::store::Store;
use loansbot::store::sqlite::SqliteStore;
use loansbot::summons::{SummonRegistry, SummonServices};
use loansbot::templates::{StaticTemplateStore, TemplateStore};
use loansbot::workers;

/// LoansBot: the automated loan-tracking and moderation bot for r/borrow.
#[derive(Parser)]
#[command(name = "loansbot", version, about)]
struct Cli {
    /// Path to the sqlite database file. Defaults to a per-user data directory.
    #[arg(long)]
    db: Option<PathBuf>,
}

fn unix_now() -> i64 {
    SystemTime::now().duration_since(UNIX_EPOCH).expect("system clock before 1970").as_secs() as i64
}

fn default_db_path() -> PathBuf {
    dirs::data_dir().unwrap_or_else(std::env::temp_dir).join("loansbot").join("loansbot.sqlite3")
}

fn main() -> anyhow::Result<()> {
    loansbot::logs::init();
    let cli = Cli::parse();
    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(run(cli))
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();

    let config = Arc::new(Config::from_env()?);

    let db_path = cli.db.unwrap_or_else(default_db_path);
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent).ok();
    }
    let store: Arc<dyn Store> = Arc::new(SqliteStore::open(&db_path)?);

    let cache: Arc<dyn Cache> = Arc::new(TtlCache::new());
    let bus: Arc<dyn EventBus> = Arc::new(InMemoryEventBus::new());
    let queue: Arc<dyn DelayedQueue> = Arc::new(InMemoryDelayedQueue::new());

    let fx_source = Arc::new(HttpFxSource::new("https://api.currencylayer.com", config.currency_layer_api_key.clone()));
    let fx = Arc::new(FxCache::new(cache.clone(), fx_source, Duration::from_secs(config.currency_layer_cache_time_seconds)));
    let ledger = Arc::new(Ledger::new(store.clone(), fx.clone(), bus.clone()));

    let templates: Arc<dyn TemplateStore> = Arc::new(StaticTemplateStore::new());
    let registry = Arc::new(SummonRegistry::new());
    let services = Arc::new(SummonServices::new(store.clone(), ledger.clone(), fx.clone()));

    let shutdown = ShutdownToken::new();
    shutdown.install()?;

    let boot = unix_now();
    let new_proxy = |worker_id: &str| -> Arc<dyn ForumProxyClient> { Arc::new(BusForumProxy::new(bus.clone(), worker_id.to_string(), boot)) };
    let perms = Arc::new(PermissionCache::new(store.clone(), new_proxy("perms"), config.clone()));

    let mut tasks = JoinSet::new();

    let scanner = Arc::new(Scanner::new(
        store.clone(),
        new_proxy("scanner"),
        perms.clone(),
        registry.clone(),
        services.clone(),
        config.subreddits.clone(),
        shutdown.clone(),
    ));
    tasks.spawn(async move { scanner.run(unix_now).await });
    tasks.spawn(scanner::rechecks_worker(new_proxy("rechecks"), registry.clone(), services.clone(), bus.clone(), shutdown.clone(), unix_now));
    tasks.spawn(scanner::modlog_poll_worker(new_proxy("modlog_poll"), bus.clone(), cache.clone(), config.subreddits.clone(), shutdown.clone()));

    tasks.spawn(workers::links::link_scan_worker(
        store.clone(),
        new_proxy("links"),
        perms.clone(),
        ledger.clone(),
        templates.clone(),
        cache.clone(),
        bus.clone(),
        config.subreddits.clone(),
        shutdown.clone(),
        unix_now,
    ));

    tasks.spawn(workers::loan_events::new_lender_worker(store.clone(), new_proxy("new_lender"), templates.clone(), bus.clone(), shutdown.clone()));
    tasks.spawn(workers::loan_events::lender_loan_worker(
        store.clone(),
        ledger.clone(),
        new_proxy("lender_loan"),
        perms.clone(),
        templates.clone(),
        bus.clone(),
        shutdown.clone(),
        unix_now,
    ));
    tasks.spawn(workers::loan_events::ban_unpaid_worker(store.clone(), new_proxy("ban_unpaid"), perms.clone(), templates.clone(), bus.clone(), shutdown.clone(), unix_now));
    tasks.spawn(workers::loan_events::unban_repaid_worker(store.clone(), new_proxy("unban_repaid"), perms.clone(), bus.clone(), shutdown.clone(), unix_now));
    for subreddit in &config.subreddits {
        tasks.spawn(workers::loan_events::flair_loan_threads_completed_worker(
            new_proxy("flair_loan_threads_completed"),
            bus.clone(),
            subreddit.clone(),
            shutdown.clone(),
        ));
    }

    tasks.spawn(workers::trust::trust_loan_delays_worker(store.clone(), queue.clone(), bus.clone(), shutdown.clone(), unix_now));
    tasks.spawn(workers::trust::lender_queue_trusts_worker(
        store.clone(),
        new_proxy("lender_queue_trusts"),
        templates.clone(),
        queue.clone(),
        bus.clone(),
        shutdown.clone(),
        unix_now,
    ));
    tasks.spawn(workers::trust::recheck_permission_worker(store.clone(), new_proxy("recheck_permission"), templates.clone(), bus.clone(), shutdown.clone(), unix_now));

    tasks.spawn(workers::requests::borrower_request_worker(store.clone(), new_proxy("borrower_request"), templates.clone(), cache.clone(), bus.clone(), shutdown.clone()));
    tasks.spawn(workers::requests::default_permissions_worker(store.clone(), config.default_permissions.clone(), bus.clone(), shutdown.clone()));

    tasks.spawn(workers::moderators::mod_changes_worker(store.clone(), bus.clone(), shutdown.clone()));
    tasks.spawn(workers::moderators::mod_onboarding_worker(
        store.clone(),
        new_proxy("mod_onboarding"),
        templates.clone(),
        config.mod_permissions.clone(),
        bus.clone(),
        shutdown.clone(),
    ));
    tasks.spawn(workers::moderators::mod_onboarding_claim_worker(
        store.clone(),
        new_proxy("mod_onboarding_claim"),
        templates.clone(),
        config.mod_permissions.clone(),
        bus.clone(),
        shutdown.clone(),
    ));
    tasks.spawn(workers::moderators::mod_offboarding_worker(
        store.clone(),
        new_proxy("mod_offboarding"),
        templates.clone(),
        config.default_permissions.clone(),
        bus.clone(),
        shutdown.clone(),
    ));
    tasks.spawn(workers::moderators::mod_onboarding_messages_worker(store.clone(), new_proxy("mod_onboarding_messages"), templates.clone(), shutdown.clone(), unix_now));
    tasks.spawn(workers::moderators::mod_sync_worker(
        store.clone(),
        new_proxy("mod_sync"),
        cache.clone(),
        bus.clone(),
        config.subreddits.clone(),
        shutdown.clone(),
        unix_now,
    ));

    tasks.spawn(workers::stats::loans_stats_worker(store.clone(), cache.clone(), shutdown.clone(), unix_now));
    tasks.spawn(workers::alerts::deprecated_alerts_worker(store.clone(), new_proxy("deprecated_alerts"), templates.clone(), config.clone(), shutdown.clone(), unix_now));

    tasks.spawn(perms::modlog_cache_flush_worker(store.clone(), bus.clone(), shutdown.clone(), unix_now));
    tasks.spawn(perms::temp_ban_expired_cache_flush_worker(store.clone(), shutdown.clone(), unix_now));

    tracing::info!(workers = tasks.len(), db = %db_path.display(), "worker fleet started");

    let first = tasks.join_next().await;
    match first {
        Some(Ok(Ok(()))) => tracing::info!("a worker exited; tearing down the fleet"),
        Some(Ok(Err(err))) => tracing::error!(?err, "a worker returned an error; tearing down the fleet"),
        Some(Err(join_err)) => tracing::error!(?join_err, "a worker task panicked; tearing down the fleet"),
        None => {}
    }

    shutdown.trigger();
    tasks.shutdown().await;
    Ok(())
}
