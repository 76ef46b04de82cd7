//! Worker host: the public face of the crate.
//!
//! A [`WorkerHost`] owns at most one worker process. It runs the
//! initialization sequence once (marker check, provisioning, spawn,
//! handshake), then turns file jobs into `process` commands on the
//! single-flight channel.
//!
//! # Lifecycle
//!
//! ```text
//! NotStarted ──▶ Provisioning ──▶ WorkerStarting ──▶ Ready
//!      │                ▲               │
//!      └── marker ok ───┘               │
//!      (any non-terminal state) ──────────────────▶ Failed
//! ```
//!
//! `Ready` and `Failed` are terminal. After [`WorkerHost::shutdown`] every
//! call fails with a `ShutDown` error.

use crate::metrics::Metrics;
use crate::models::{Command, Device, HostSettings, ProcessRequest};
use crate::services::channel::{self, ChannelError, SendOptions};
use crate::services::device::{DeviceSelector, GpuProbe, SystemGpuProbe};
use crate::services::diagnostics::{FileProgressFn, ProgressSlot};
use crate::services::provisioning::{
    self, MarkerFile, PackageInstaller, PipInstaller, ProvisionError, ProvisionProgressFn,
};
use crate::services::supervisor::{self, HandshakeError, SpawnError, WorkerHandle, WorkerLayout};
use crate::state::{InitState, InvalidTransition, StateChange, StateManager};
use camino::{Utf8Path, Utf8PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{broadcast, watch};

/// What [`WorkerHost::initialize`] did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitOutcome {
    /// This call ran the sequence and the worker is ready
    Initialized,
    AlreadyReady,
    /// Another caller is initializing; this call did nothing
    AlreadyInProgress,
}

#[derive(Error, Debug)]
pub enum InitError {
    #[error("Provisioning failed: {0}")]
    Provision(#[from] ProvisionError),

    #[error(transparent)]
    Spawn(#[from] SpawnError),

    #[error(transparent)]
    Handshake(#[from] HandshakeError),

    #[error(transparent)]
    InvalidTransition(#[from] InvalidTransition),

    #[error("Initialization previously failed: {0}")]
    PreviouslyFailed(String),

    #[error("Host has been shut down")]
    ShutDown,
}

#[derive(Error, Debug)]
pub enum ProcessError {
    #[error("Worker is not ready (state: {0})")]
    NotReady(InitState),

    #[error("Host has been shut down")]
    ShutDown,

    #[error("Input file not found: {0}")]
    InputNotFound(Utf8PathBuf),

    #[error("Failed to create output directory {path}: {source}")]
    OutputDir {
        path: Utf8PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to remove previous output {path}: {source}")]
    StaleOutput {
        path: Utf8PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Worker reported an error: {message}")]
    Worker {
        message: String,
        traceback: Option<String>,
    },

    #[error("Worker reported success but no output exists at {0}")]
    InvariantViolation(Utf8PathBuf),

    #[error("Processing was cancelled")]
    Cancelled,

    #[error(transparent)]
    Channel(ChannelError),
}

impl From<ChannelError> for ProcessError {
    fn from(err: ChannelError) -> Self {
        match err {
            ChannelError::Cancelled => ProcessError::Cancelled,
            other => ProcessError::Channel(other),
        }
    }
}

/// Model parameters sent with every `process` command
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessOptions {
    pub model_name: String,
    pub ddim_steps: u32,
    pub guidance_scale: f64,
    pub seed: Option<i64>,
}

impl ProcessOptions {
    pub fn from_settings(settings: &HostSettings) -> Self {
        Self {
            model_name: settings.model_name.clone(),
            ddim_steps: settings.ddim_steps,
            guidance_scale: settings.guidance_scale,
            seed: settings.seed,
        }
    }
}

/// One file to process
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessJob {
    pub input: Utf8PathBuf,
    pub output: Utf8PathBuf,
    pub options: ProcessOptions,
}

/// A successfully processed file
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessOutcome {
    pub input: Utf8PathBuf,
    pub output: Utf8PathBuf,
    pub device: Device,
    pub duration: Duration,

    /// The worker's response message
    pub message: String,
}

/// Result for one file of a batch
#[derive(Debug)]
pub struct BatchItem {
    pub input: Utf8PathBuf,
    pub result: Result<ProcessOutcome, ProcessError>,
}

impl BatchItem {
    pub fn succeeded(&self) -> bool {
        self.result.is_ok()
    }
}

/// Supervised AudioSR worker with a one-time initialization gate
pub struct WorkerHost {
    settings: HostSettings,
    layout: WorkerLayout,
    installer: Arc<dyn PackageInstaller>,
    devices: DeviceSelector,
    lifecycle: StateManager,

    /// Held for the whole initialization sequence
    init_gate: tokio::sync::Mutex<()>,

    /// Held from progress registration until the response arrives
    dispatch: tokio::sync::Mutex<()>,

    worker: Mutex<Option<WorkerHandle>>,
    progress: ProgressSlot,
    metrics: Arc<Metrics>,
    shut_down: AtomicBool,
}

impl WorkerHost {
    /// Host using pip for provisioning and the platform GPU probe
    pub fn new(settings: HostSettings) -> Self {
        let installer = Arc::new(PipInstaller::from_settings(&settings));
        Self::with_collaborators(settings, installer, Arc::new(SystemGpuProbe))
    }

    pub fn with_collaborators(
        settings: HostSettings,
        installer: Arc<dyn PackageInstaller>,
        probe: Arc<dyn GpuProbe>,
    ) -> Self {
        Self {
            layout: WorkerLayout::from_settings(&settings),
            devices: DeviceSelector::new(settings.device, probe),
            installer,
            settings,
            lifecycle: StateManager::new(),
            init_gate: tokio::sync::Mutex::new(()),
            dispatch: tokio::sync::Mutex::new(()),
            worker: Mutex::new(None),
            progress: ProgressSlot::new(),
            metrics: Arc::new(Metrics::new()),
            shut_down: AtomicBool::new(false),
        }
    }

    pub fn settings(&self) -> &HostSettings {
        &self.settings
    }

    pub fn state(&self) -> InitState {
        self.lifecycle.current()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StateChange> {
        self.lifecycle.subscribe()
    }

    pub fn metrics(&self) -> Arc<Metrics> {
        Arc::clone(&self.metrics)
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }

    /// The device chosen for processing, once the first file has been sent
    pub fn selected_device(&self) -> Option<Device> {
        self.devices.selected()
    }

    pub fn worker_pid(&self) -> Option<u32> {
        self.worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .and_then(WorkerHandle::pid)
    }

    /// Job for `input` with the configured model parameters
    pub fn job_for(&self, input: &Utf8Path, output_dir: Option<&Utf8Path>) -> ProcessJob {
        ProcessJob {
            input: input.to_path_buf(),
            output: self.settings.output_path_for(input, output_dir),
            options: ProcessOptions::from_settings(&self.settings),
        }
    }

    /// Bring the worker up, provisioning dependencies first if the marker
    /// token does not match.
    ///
    /// Runs at most once per host. A failure leaves the host in `Failed`
    /// and is never retried; build a new host instead.
    pub async fn initialize(
        &self,
        progress: Option<ProvisionProgressFn>,
    ) -> Result<InitOutcome, InitError> {
        if self.is_shut_down() {
            return Err(InitError::ShutDown);
        }

        let Ok(_gate) = self.init_gate.try_lock() else {
            tracing::info!("Initialization already in progress; ignoring request");
            return Ok(InitOutcome::AlreadyInProgress);
        };

        match self.lifecycle.current() {
            InitState::Ready => return Ok(InitOutcome::AlreadyReady),
            InitState::Failed => {
                let reason = self.lifecycle.failure_reason().unwrap_or_default();
                return Err(InitError::PreviouslyFailed(reason));
            }
            _ => {}
        }

        match self.run_initialization(progress.as_ref()).await {
            Ok(()) => {
                tracing::info!("Worker host ready");
                Ok(InitOutcome::Initialized)
            }
            Err(e) => {
                tracing::error!("Initialization failed: {}", e);
                if let Err(transition) = self.lifecycle.fail(e.to_string()) {
                    tracing::warn!("{}", transition);
                }
                Err(e)
            }
        }
    }

    async fn run_initialization(
        &self,
        progress: Option<&ProvisionProgressFn>,
    ) -> Result<(), InitError> {
        let marker = MarkerFile::new(self.settings.marker_path());

        if marker.matches(&self.settings.marker_token) {
            tracing::info!("Dependencies already provisioned ({})", marker.path());
            self.lifecycle.transition(InitState::WorkerStarting)?;
        } else {
            self.lifecycle.transition(InitState::Provisioning)?;
            provisioning::provision(
                &self.layout.package_dir,
                &self.settings.packages,
                self.installer.as_ref(),
                progress,
            )
            .await?;
            marker.write(&self.settings.marker_token)?;
            self.lifecycle.transition(InitState::WorkerStarting)?;
        }

        let handle = supervisor::spawn(&self.layout, self.progress.clone(), self.metrics.clone())?;
        if let Err(e) = supervisor::health_check(&handle, self.settings.handshake_timeout()).await {
            supervisor::terminate(handle).await;
            return Err(e.into());
        }

        // Checked under the worker lock so a concurrent shutdown either sees
        // the handle or is seen here
        let rejected = {
            let mut slot = self.worker.lock().unwrap_or_else(PoisonError::into_inner);
            if self.is_shut_down() {
                Some(handle)
            } else {
                *slot = Some(handle);
                None
            }
        };
        if let Some(handle) = rejected {
            supervisor::terminate(handle).await;
            return Err(InitError::ShutDown);
        }

        self.lifecycle.transition(InitState::Ready)?;
        Ok(())
    }

    /// Process one file.
    ///
    /// `progress` receives the worker's progress events for this file only.
    /// Cancelling abandons the wait; the worker keeps running and the output
    /// file state is undefined.
    pub async fn process(
        &self,
        job: ProcessJob,
        progress: Option<FileProgressFn>,
        cancel: Option<watch::Receiver<bool>>,
    ) -> Result<ProcessOutcome, ProcessError> {
        let started = Instant::now();
        let result = self.dispatch_job(job, progress, cancel, started).await;

        match &result {
            Ok(_) => self.metrics.record_file(true, started.elapsed()),
            Err(ProcessError::NotReady(_) | ProcessError::ShutDown | ProcessError::Cancelled) => {}
            Err(_) => self.metrics.record_file(false, started.elapsed()),
        }
        result
    }

    async fn dispatch_job(
        &self,
        job: ProcessJob,
        progress: Option<FileProgressFn>,
        mut cancel: Option<watch::Receiver<bool>>,
        started: Instant,
    ) -> Result<ProcessOutcome, ProcessError> {
        if self.is_shut_down() {
            return Err(ProcessError::ShutDown);
        }
        let state = self.lifecycle.current();
        if state != InitState::Ready {
            return Err(ProcessError::NotReady(state));
        }
        if channel::is_cancelled(&cancel) {
            return Err(ProcessError::Cancelled);
        }

        if !job.input.is_file() {
            return Err(ProcessError::InputNotFound(job.input));
        }
        if let Some(dir) = job.output.parent().filter(|dir| !dir.as_str().is_empty()) {
            std::fs::create_dir_all(dir).map_err(|source| ProcessError::OutputDir {
                path: dir.to_path_buf(),
                source,
            })?;
        }

        let worker_channel = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(WorkerHandle::channel)
            .ok_or(ProcessError::ShutDown)?;

        let device = self.devices.select().await;

        let _turn = tokio::select! {
            turn = self.dispatch.lock() => turn,
            _ = channel::cancelled(&mut cancel) => return Err(ProcessError::Cancelled),
        };
        // A leftover file would satisfy the output check without a fresh write
        if job.output != job.input && job.output.is_file() {
            tracing::debug!(output = %job.output, "Removing previous output");
            std::fs::remove_file(&job.output).map_err(|source| ProcessError::StaleOutput {
                path: job.output.clone(),
                source,
            })?;
        }
        let _registration = self.progress.register(progress);

        tracing::info!(
            input = %job.input,
            output = %job.output,
            device = %device,
            model = %job.options.model_name,
            "Processing file"
        );

        let command = Command::Process(ProcessRequest {
            input: job.input.clone(),
            output: job.output.clone(),
            model_name: job.options.model_name,
            device,
            ddim_steps: job.options.ddim_steps,
            guidance_scale: job.options.guidance_scale,
            seed: job.options.seed,
        });
        let options = SendOptions::with_timeout(self.settings.process_timeout()).cancel_on(cancel);
        let response = worker_channel.send(&command, options).await?;

        if !response.is_ok() {
            return Err(ProcessError::Worker {
                message: response.message,
                traceback: response.traceback,
            });
        }
        if !job.output.is_file() {
            return Err(ProcessError::InvariantViolation(job.output));
        }

        let duration = started.elapsed();
        tracing::info!(output = %job.output, "Processed in {:.1}s", duration.as_secs_f64());

        Ok(ProcessOutcome {
            input: job.input,
            output: job.output,
            device,
            duration,
            message: response.message,
        })
    }

    /// Process files in order. A failure affects only its own item; once
    /// cancelled, the remaining items are reported as cancelled without
    /// reaching the worker.
    pub async fn process_batch(
        &self,
        jobs: Vec<ProcessJob>,
        progress: Option<FileProgressFn>,
        cancel: Option<watch::Receiver<bool>>,
    ) -> Vec<BatchItem> {
        let total = jobs.len();
        let mut items = Vec::with_capacity(total);
        let mut stopped = false;

        for (index, job) in jobs.into_iter().enumerate() {
            let input = job.input.clone();

            if stopped || channel::is_cancelled(&cancel) {
                stopped = true;
                items.push(BatchItem {
                    input,
                    result: Err(ProcessError::Cancelled),
                });
                continue;
            }

            tracing::info!("[{}/{}] {}", index + 1, total, input);
            let result = self.process(job, progress.clone(), cancel.clone()).await;

            match &result {
                Ok(_) => {}
                Err(ProcessError::Cancelled) => {
                    tracing::info!("Batch cancelled at {}", input);
                    stopped = true;
                }
                Err(e) => tracing::warn!("Failed to process {}: {}", input, e),
            }
            items.push(BatchItem { input, result });
        }

        items
    }

    /// Stop the worker and release it. Safe to call more than once; never fails.
    pub async fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }

        let handle = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        match handle {
            Some(handle) => supervisor::terminate(handle).await,
            None => tracing::debug!("Shutdown requested with no running worker"),
        }

        self.metrics.log_summary();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::device::MockGpuProbe;
    use async_trait::async_trait;
    use tempfile::TempDir;

    struct NoopInstaller;

    #[async_trait]
    impl PackageInstaller for NoopInstaller {
        async fn has_package_manager(&self) -> Result<bool, ProvisionError> {
            Ok(true)
        }

        async fn install_package_manager(&self) -> Result<(), ProvisionError> {
            Ok(())
        }

        async fn install_packages(&self, _packages: &[String]) -> Result<(), ProvisionError> {
            Ok(())
        }
    }

    fn host_in(root: &Utf8Path) -> WorkerHost {
        let settings = HostSettings {
            runtime_home: root.join("runtime"),
            app_dir: root.join("app"),
            ..HostSettings::default()
        };
        WorkerHost::with_collaborators(settings, Arc::new(NoopInstaller), Arc::new(MockGpuProbe::new()))
    }

    fn temp_root() -> (TempDir, Utf8PathBuf) {
        let temp_dir = TempDir::new().unwrap();
        let root = Utf8PathBuf::try_from(temp_dir.path().to_path_buf()).unwrap();
        (temp_dir, root)
    }

    #[test]
    fn test_channel_cancel_maps_to_cancelled() {
        assert!(matches!(
            ProcessError::from(ChannelError::Cancelled),
            ProcessError::Cancelled
        ));
        assert!(matches!(
            ProcessError::from(ChannelError::NoResponse),
            ProcessError::Channel(ChannelError::NoResponse)
        ));
    }

    #[test]
    fn test_job_for_uses_settings() {
        let (_temp, root) = temp_root();
        let host = host_in(&root);
        let job = host.job_for(Utf8Path::new("/in/song.mp3"), Some(Utf8Path::new("/out")));

        assert_eq!(job.output, Utf8PathBuf::from("/out/song_AudioSR.wav"));
        assert_eq!(job.options.model_name, "basic");
        assert_eq!(job.options.ddim_steps, 50);
    }

    #[tokio::test]
    async fn test_process_before_initialize_is_rejected() {
        let (_temp, root) = temp_root();
        let host = host_in(&root);
        let job = host.job_for(&root.join("in.wav"), None);

        let err = host.process(job, None, None).await.unwrap_err();
        assert!(matches!(err, ProcessError::NotReady(InitState::NotStarted)));
    }

    #[tokio::test]
    async fn test_shutdown_is_idempotent_and_final() {
        let (_temp, root) = temp_root();
        let host = host_in(&root);

        host.shutdown().await;
        host.shutdown().await;

        assert!(host.is_shut_down());
        assert!(matches!(host.initialize(None).await, Err(InitError::ShutDown)));
        let job = host.job_for(&root.join("in.wav"), None);
        assert!(matches!(
            host.process(job, None, None).await,
            Err(ProcessError::ShutDown)
        ));
    }

    #[tokio::test]
    async fn test_spawn_failure_marks_host_failed() {
        let (_temp, root) = temp_root();
        let host = host_in(&root);

        let err = host.initialize(None).await.unwrap_err();
        assert!(matches!(err, InitError::Spawn(SpawnError::InterpreterNotFound(_))));
        assert_eq!(host.state(), InitState::Failed);

        // Provisioning ran and its marker stays valid for the next host
        assert!(MarkerFile::new(host.settings().marker_path()).matches(&host.settings().marker_token));

        let again = host.initialize(None).await.unwrap_err();
        assert!(matches!(again, InitError::PreviouslyFailed(reason) if reason.contains("interpreter")));
    }

    #[tokio::test]
    async fn test_cancelled_batch_skips_all_items() {
        let (_temp, root) = temp_root();
        let host = host_in(&root);
        let jobs = vec![
            host.job_for(&root.join("a.wav"), None),
            host.job_for(&root.join("b.wav"), None),
        ];
        let (_tx, rx) = watch::channel(true);

        let items = host.process_batch(jobs, None, Some(rx)).await;
        assert_eq!(items.len(), 2);
        assert!(items.iter().all(|item| matches!(item.result, Err(ProcessError::Cancelled))));
    }
}
