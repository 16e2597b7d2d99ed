//! Shared `tracing-subscriber` bootstrap.
//!
//! Every binary in this workspace calls [`init`] exactly once. It reads
//! `RUST_LOG` and falls back to `info` so a pipeline run is quiet by
//! default but fully instrumented on request (`RUST_LOG=skein_core=debug`).

/// Installs the global `tracing` subscriber. Safe to call more than once;
/// subsequent calls are no-ops (tracing's global dispatcher can only be set
/// once per process, and test binaries frequently call this from many
/// `#[test]` functions).
pub fn init() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(true)
        .compact()
        .try_init();
}
