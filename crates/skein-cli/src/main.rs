//! Command-line front-end for the filter graph engine (§10.4).
//!
//! The pipeline description itself is parsed with the engine's own
//! argument syntax (`skein_core::args`), not `clap` — `clap` only covers
//! the orthogonal top-level flags (`--config`, `--threads`) that sit
//! outside the pipeline string, mirroring how this workspace's existing
//! binaries split "how do I run" flags from the payload they carry.

use std::path::PathBuf;

use clap::Parser;
use tracing::{error, info};

use skein_core::config::{AbortMode, SessionConfig};
use skein_core::session::Session;

mod filters;

use filters::{log_sink_register, pattern_source_register};

/// Runs a pipeline description against the engine and exits with a
/// nonzero status if the session reported a connect or process error.
#[derive(Parser, Debug)]
#[command(name = "skein", about = "Run a filter graph pipeline")]
struct Cli {
    /// Path to a TOML session config (§10.3). Unset fields fall back to
    /// the engine's documented defaults.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Overrides `threads` from the config file, 0 meaning "run the
    /// scheduler on the calling thread" (useful for deterministic runs).
    #[arg(long)]
    threads: Option<usize>,

    /// Pipeline filter specs in link order, each `register_name[:arg=val:...]`
    /// using the engine's own `:`/`=`/`,` argument syntax (§4.4, §6), e.g.
    /// `pattern_source:count=5 log_sink`.
    #[arg(trailing_var_arg = true, required = true)]
    pipeline: Vec<String>,
}

/// Splits one pipeline token into its register name and the raw argument
/// string `Session::instantiate` expects (§4.4: the register name always
/// comes first, terminated by the first `:`).
fn split_spec(spec: &str) -> (&str, &str) {
    match spec.split_once(':') {
        Some((name, rest)) => (name, rest),
        None => (spec, ""),
    }
}

fn main() -> anyhow::Result<()> {
    skein_common::logging::init();
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .map_err(|e| anyhow::anyhow!("reading config {}: {e}", path.display()))?;
            SessionConfig::from_toml_str(&text)?
        }
        None => SessionConfig::default(),
    };
    if let Some(threads) = cli.threads {
        config.threads = threads;
    }

    let session = Session::new(config);
    session.register_filter(pattern_source_register());
    session.register_filter(log_sink_register());

    let mut ids = Vec::with_capacity(cli.pipeline.len());
    for spec in &cli.pipeline {
        let (name, args) = split_spec(spec);
        let id = session.instantiate(name, args)?;
        ids.push(id);
    }
    for pair in ids.windows(2) {
        session.connect(pair[0], pair[1])?;
    }

    // Ctrl-C requests a fast abort (§4.6 "Cancellation"): stop posting new
    // process tasks and let in-flight ones finish, rather than tearing the
    // session down mid-callback. Same pattern as this workspace's other
    // signal-driven shutdowns.
    let abort_session = session.clone();
    ctrlc::set_handler(move || {
        info!("ctrl-c received, requesting fast abort");
        abort_session.abort(AbortMode::Fast);
    })?;

    session.run();

    let mut failed = false;
    if let Some(e) = session.last_connect_error() {
        error!(error = %e, "last connect error");
        failed = true;
    }
    if let Some(e) = session.last_process_error() {
        error!(error = %e, "last process error");
        failed = true;
    }
    if failed {
        std::process::exit(1);
    }
    Ok(())
}
