use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use std::fs;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Where and how much to log
#[derive(Debug, Clone)]
pub struct LogOptions {
    /// Directory for the daily log files
    pub log_dir: Utf8PathBuf,

    /// File name prefix (e.g. `audiosr-host` → `audiosr-host.2026-10-16`)
    pub log_prefix: String,

    /// Debug level instead of info; `RUST_LOG` overrides both
    pub debug_mode: bool,

    /// Also log to stderr
    pub console_output: bool,
}

impl Default for LogOptions {
    fn default() -> Self {
        Self {
            log_dir: Utf8PathBuf::from("logs"),
            log_prefix: "audiosr-host".to_string(),
            debug_mode: false,
            console_output: true,
        }
    }
}

impl LogOptions {
    /// The filter used when `RUST_LOG` is not set
    pub fn default_directive(&self) -> &'static str {
        if self.debug_mode { "debug" } else { "info" }
    }
}

/// Create the log directory if needed
pub fn ensure_log_dir(log_dir: &Utf8Path) -> Result<()> {
    if !log_dir.exists() {
        fs::create_dir_all(log_dir)
            .with_context(|| format!("Failed to create log directory: {}", log_dir))?;
    }
    Ok(())
}

/// Install the global subscriber: a daily rotating file plus optional console output.
///
/// Worker stderr lines are logged under the `audiosr_host::worker` target at
/// debug level, so `RUST_LOG=info,audiosr_host::worker=debug` shows them
/// without the rest of the debug output.
///
/// # Returns
/// A guard that must be held for the duration of the program to keep logging active
pub fn setup_logging(options: &LogOptions) -> Result<WorkerGuard> {
    ensure_log_dir(&options.log_dir)?;

    let file_appender = rolling::daily(&options.log_dir, &options.log_prefix);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(options.default_directive()));

    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(non_blocking)
        .with_ansi(false) // No ANSI codes in log files
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true);

    // stdout is reserved for the CLI's own output
    let console_layer = options.console_output.then(|| {
        tracing_subscriber::fmt::layer()
            .with_writer(std::io::stderr)
            .with_ansi(true)
            .with_target(false)
    });

    tracing_subscriber::registry()
        .with(env_filter)
        .with(file_layer)
        .with(console_layer)
        .try_init()
        .context("Failed to install tracing subscriber")?;

    tracing::info!(
        "Logging initialized: dir={}, prefix={}, debug={}, console={}",
        options.log_dir,
        options.log_prefix,
        options.debug_mode,
        options.console_output
    );

    Ok(guard)
}
