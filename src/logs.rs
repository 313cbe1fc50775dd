//! Structured logging init for the worker fleet (SPEC_FULL §10.1).
//!
//! `tracing-subscriber`'s `EnvFilter` is set up once at process start; every
//! worker then logs through an `info_span!` scoped to its own name.

/// Initializes the global tracing subscriber from `RUST_LOG`, defaulting to
/// `info` when unset or invalid. Safe to call more than once per process
/// (e.g. in tests); later calls are no-ops.
pub fn init() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

/// Span a block of work under the named worker, matching the
/// `itgs.logger.print(Level, ...)` call sites in the Python source — one
/// span per worker, fields carried on individual events within it.
#[macro_export]
macro_rules! worker_span {
    ($name:expr) => {
        tracing::info_span!("worker", name = $name)
    };
}
