use anyhow::Context;
use std::fs::{self, File};
use std::path::Path;
use std::sync::Mutex;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Console layer on stderr plus a plain-text copy in `log_file`. `RUST_LOG`
/// takes precedence over `verbose`.
pub(super) fn init(log_file: &Path, verbose: bool) -> anyhow::Result<()> {
    if let Some(parent) = log_file
        .parent()
        .filter(|parent| !parent.as_os_str().is_empty())
    {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create log directory '{}'", parent.display()))?;
    }
    let file = File::create(log_file)
        .with_context(|| format!("failed to open log file '{}'", log_file.display()))?;

    let level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!("yambo_tester={level},yambo_tester_core={level}"))
    });

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).with_target(false))
        .with(fmt::layer().with_ansi(false).with_writer(Mutex::new(file)))
        .try_init()
        .context("failed to install the log subscriber")
}
