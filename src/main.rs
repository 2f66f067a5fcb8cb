//! cf-init binary.
//!
//! Runs as PID 1. Takes no flags: whatever the kernel passes in argv is
//! forwarded untouched to the handoff candidates that request it.

use anyhow::Context;
use cf_init::journal::{self, Journal};
use cf_init::{signals, BootConfig, ExitCode, Init};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

fn main() {
    let code = match run() {
        Ok(code) => code,
        Err(e) => {
            error!("{:#}", e);
            ExitCode::FAILURE
        }
    };
    std::process::exit(code);
}

fn run() -> anyhow::Result<i32> {
    let loaded = BootConfig::load();
    let (config, load_error) = match loaded {
        Ok(Some(config)) => (config, None),
        Ok(None) => (BootConfig::default(), None),
        Err(e) => (BootConfig::default(), Some(e)),
    };

    // Logging comes up first so every later step is visible somewhere.
    let journal = Arc::new(Journal::system(&config.journal.kmsg, &config.journal.console));
    if !journal::init_tracing(Arc::clone(&journal)) {
        journal.log("tracing subscriber already installed");
    }

    let config_path = BootConfig::path();
    match load_error {
        Some(e) => warn!(
            path = %config_path.display(),
            error = %e,
            "Ignoring unusable configuration, using defaults"
        ),
        None if config_path.exists() => info!(path = %config_path.display(), "Loaded configuration"),
        None => debug!("No configuration file, using defaults"),
    }

    signals::install().context("installing signal handlers")?;

    let args = std::env::args_os().collect();
    Ok(Init::new(config, args).run())
}
