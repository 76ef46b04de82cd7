//! audiosr-host - batch front-end for the AudioSR worker
//!
//! # Execution Flow
//!
//! 1. Load settings from `<config-dir>/audiosr-host.yaml` and `AUDIOSR_*`
//! 2. Initialize logging → `<log-dir>/audiosr-host.<date>`
//! 3. Create the tokio runtime
//! 4. Initialize the worker host (provisioning on first run, then spawn and handshake)
//! 5. Process every file in order; Ctrl-C cancels the current file and skips the rest
//! 6. Shut the worker down and print a per-file summary
//!
//! The process exits non-zero when any file was not processed.

use anyhow::{Context, Result};
use audiosr_host::logging::{self, LogOptions};
use audiosr_host::models::ProgressEvent;
use audiosr_host::services::{FileProgressFn, ProvisionProgressFn};
use audiosr_host::{
    APP_NAME, BatchItem, ConfigManager, DevicePreference, HostSettings, ProcessError, VERSION,
    WorkerHost,
};
use camino::Utf8PathBuf;
use clap::{Parser, ValueEnum};
use std::io::Write;
use std::process::ExitCode;
use std::sync::Arc;
use tokio::sync::watch;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum DeviceArg {
    Auto,
    Cuda,
    Cpu,
}

impl From<DeviceArg> for DevicePreference {
    fn from(arg: DeviceArg) -> Self {
        match arg {
            DeviceArg::Auto => DevicePreference::Auto,
            DeviceArg::Cuda => DevicePreference::Cuda,
            DeviceArg::Cpu => DevicePreference::Cpu,
        }
    }
}

#[derive(Debug, Parser)]
#[command(name = "audiosr-host", about = "Run AudioSR super-resolution over audio files", author, version)]
struct Cli {
    /// Directory holding audiosr-host.yaml
    #[arg(long = "config-dir", env = "AUDIOSR_CONFIG_DIR", default_value = "config")]
    config_dir: Utf8PathBuf,

    /// Write results here instead of next to each input
    #[arg(long = "output-dir", value_name = "DIR")]
    output_dir: Option<Utf8PathBuf>,

    #[arg(long = "log-dir", default_value = "logs")]
    log_dir: Utf8PathBuf,

    /// Model name passed to the worker (overrides settings)
    #[arg(long)]
    model: Option<String>,

    /// Diffusion steps (overrides settings)
    #[arg(long)]
    steps: Option<u32>,

    /// Guidance scale (overrides settings)
    #[arg(long)]
    guidance: Option<f64>,

    #[arg(long)]
    seed: Option<i64>,

    #[arg(long, value_enum)]
    device: Option<DeviceArg>,

    /// Debug-level logging
    #[arg(long, default_value_t = false)]
    debug: bool,

    #[arg(required = true, value_name = "FILE")]
    files: Vec<Utf8PathBuf>,
}

impl Cli {
    fn apply_overrides(&self, settings: &mut HostSettings) {
        if let Some(model) = &self.model {
            settings.model_name = model.clone();
        }
        if let Some(steps) = self.steps {
            settings.ddim_steps = steps;
        }
        if let Some(guidance) = self.guidance {
            settings.guidance_scale = guidance;
        }
        if self.seed.is_some() {
            settings.seed = self.seed;
        }
        if let Some(device) = self.device {
            settings.device = device.into();
        }
        settings.debug_logging |= self.debug;
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    match run(cli) {
        Ok(code) => code,
        Err(e) => {
            tracing::error!("{:#}", e);
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<ExitCode> {
    // Loaded before logging: debug_logging picks the level
    let config_manager = ConfigManager::new(&cli.config_dir)?;
    let mut settings = config_manager.load_settings()?;
    cli.apply_overrides(&mut settings);

    let _guard = logging::setup_logging(&LogOptions {
        log_dir: cli.log_dir.clone(),
        debug_mode: settings.debug_logging,
        ..LogOptions::default()
    })?;

    tracing::info!("Starting {} v{}", APP_NAME, VERSION);
    tracing::info!("Settings: {}", config_manager.settings_path());

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("audiosr-host-worker")
        .build()
        .context("Failed to create tokio runtime")?;

    let code = runtime.block_on(run_batch(&cli, settings));

    tracing::info!("Application shutdown complete");
    code
}

async fn run_batch(cli: &Cli, settings: HostSettings) -> Result<ExitCode> {
    let host = WorkerHost::new(settings);

    let (cancel_tx, cancel_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupt received, cancelling");
            let _ = cancel_tx.send(true);
        }
    });

    let provision_progress: ProvisionProgressFn = Arc::new(|stage: usize, total: usize, message: &str| {
        eprintln!("[setup {}/{}] {}", stage, total, message);
    });

    let mut interrupted = cancel_rx.clone();
    let outcome = tokio::select! {
        outcome = host.initialize(Some(provision_progress)) => outcome,
        Ok(_) = interrupted.wait_for(|cancelled| *cancelled) => {
            eprintln!("Interrupted during setup");
            host.shutdown().await;
            return Ok(ExitCode::FAILURE);
        }
    };

    match outcome {
        Ok(outcome) => tracing::debug!("Initialization outcome: {:?}", outcome),
        Err(e) => {
            host.shutdown().await;
            return Err(e).context("Failed to start the AudioSR worker");
        }
    }

    let jobs = cli
        .files
        .iter()
        .map(|input| host.job_for(input, cli.output_dir.as_deref()))
        .collect();

    let file_progress: FileProgressFn = Arc::new(print_progress);
    let items = host
        .process_batch(jobs, Some(file_progress), Some(cancel_rx))
        .await;
    eprintln!();

    host.shutdown().await;

    let failed = print_summary(&items);
    Ok(if failed == 0 {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

fn print_progress(event: ProgressEvent) {
    let mut stderr = std::io::stderr().lock();
    let _ = match event.fraction() {
        Some(fraction) => write!(stderr, "\r  {:>5.1}%", fraction * 100.0),
        None => write!(stderr, "\r  step {}", event.current),
    };
    let _ = stderr.flush();
}

/// Print one line per file; returns the number of files not processed
fn print_summary(items: &[BatchItem]) -> usize {
    let mut failed = 0;

    for item in items {
        match &item.result {
            Ok(outcome) => println!(
                "ok        {} -> {} ({:.1}s on {})",
                item.input,
                outcome.output,
                outcome.duration.as_secs_f64(),
                outcome.device
            ),
            Err(ProcessError::Cancelled) => {
                failed += 1;
                println!("cancelled {}", item.input);
            }
            Err(e) => {
                failed += 1;
                println!("failed    {}: {}", item.input, e);
                if let ProcessError::Worker {
                    traceback: Some(traceback),
                    ..
                } = e
                {
                    tracing::debug!("Worker traceback for {}:\n{}", item.input, traceback);
                }
            }
        }
    }

    println!(
        "{} of {} file(s) processed",
        items.len() - failed,
        items.len()
    );
    failed
}
