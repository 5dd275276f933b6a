//! Optional structured-logging bootstrap for binaries embedding this crate.
//!
//! This crate itself only ever calls into `tracing`'s macros; nothing here
//! installs a subscriber implicitly. A hosting process calls
//! [`init_tracing`] once at startup if it wants the default formatter.

/// Installs a `tracing_subscriber::fmt` subscriber reading `RUST_LOG`
/// (falling back to `info`). Safe to call more than once; later calls are
/// no-ops.
pub fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}
