use crate::metrics::Metrics;
use crate::models::{Command, HostSettings};
use crate::services::channel::{ChannelError, CommandChannel, SendOptions, WorkerChannel};
use crate::services::diagnostics::{DiagnosticClassifier, ProgressSlot};
use camino::{Utf8Path, Utf8PathBuf};
use std::ffi::OsString;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::BufReader;
use tokio::process::{Child, Command as ProcessCommand};
use tokio::task::JoinHandle;
use tokio::time::timeout;

/// How long an exiting worker gets before it is killed
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(3);

/// Limit on waiting for an in-flight command before sending `shutdown`
const SHUTDOWN_ACQUIRE_TIMEOUT: Duration = Duration::from_secs(2);

const SHUTDOWN_RESPONSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Upper bound on joining the diagnostic reader after the process is gone
const DIAGNOSTICS_JOIN_TIMEOUT: Duration = Duration::from_secs(1);

#[cfg(windows)]
pub(crate) const CREATE_NO_WINDOW: u32 = 0x0800_0000;

/// Errors that prevent the worker from starting
#[derive(Error, Debug)]
pub enum SpawnError {
    #[error("Runtime directory not found: {0}")]
    RuntimeNotFound(Utf8PathBuf),

    #[error("No interpreter executable found in {0}")]
    InterpreterNotFound(Utf8PathBuf),

    #[error("Worker script {name} not found (looked in {primary} and {fallback})")]
    ScriptNotFound {
        name: String,
        primary: Utf8PathBuf,
        fallback: Utf8PathBuf,
    },

    #[error("Invalid worker environment: {0}")]
    Environment(String),

    #[error("Failed to spawn worker process: {0}")]
    Io(#[from] std::io::Error),

    #[error("Worker process has no {0} pipe")]
    MissingPipe(&'static str),
}

/// Errors from the post-spawn `ping` handshake
#[derive(Error, Debug)]
pub enum HandshakeError {
    #[error("Worker rejected handshake: {0}")]
    Rejected(String),

    #[error("Worker handshake failed: {0}")]
    Channel(#[from] ChannelError),
}

/// Filesystem layout needed to launch the worker
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerLayout {
    /// Interpreter distribution root
    pub runtime_home: Utf8PathBuf,

    /// Installed packages (site-packages)
    pub package_dir: Utf8PathBuf,

    /// Base directory searched for the worker script
    pub app_dir: Utf8PathBuf,

    pub script_name: String,
}

impl WorkerLayout {
    pub fn from_settings(settings: &HostSettings) -> Self {
        Self {
            runtime_home: settings.runtime_home.clone(),
            package_dir: settings.package_path(),
            app_dir: settings.app_dir.clone(),
            script_name: settings.script_name.clone(),
        }
    }

    /// Interpreter locations inside `runtime_home`, most specific first
    pub fn interpreter_candidates(&self) -> Vec<Utf8PathBuf> {
        let names: &[&str] = if cfg!(windows) {
            &["python.exe"]
        } else {
            &["bin/python3", "bin/python", "python3", "python"]
        };
        names.iter().map(|name| self.runtime_home.join(name)).collect()
    }

    pub fn find_interpreter(&self) -> Option<Utf8PathBuf> {
        self.interpreter_candidates()
            .into_iter()
            .find(|candidate| candidate.is_file())
    }

    /// Primary (`<app_dir>/python/<script>`) and flat fallback (`<app_dir>/<script>`)
    pub fn script_candidates(&self) -> (Utf8PathBuf, Utf8PathBuf) {
        (
            self.app_dir.join("python").join(&self.script_name),
            self.app_dir.join(&self.script_name),
        )
    }

    pub fn find_script(&self) -> Result<Utf8PathBuf, SpawnError> {
        let (primary, fallback) = self.script_candidates();
        if primary.is_file() {
            Ok(primary)
        } else if fallback.is_file() {
            tracing::debug!("Using flat worker script location: {}", fallback);
            Ok(fallback)
        } else {
            Err(SpawnError::ScriptNotFound {
                name: self.script_name.clone(),
                primary,
                fallback,
            })
        }
    }

    /// Module search path: the package directory, then the script's own directory
    pub fn python_path(&self, script: &Utf8Path) -> Result<OsString, SpawnError> {
        let script_dir = script.parent().unwrap_or(self.app_dir.as_path());
        std::env::join_paths([self.package_dir.as_std_path(), script_dir.as_std_path()])
            .map_err(|e| SpawnError::Environment(e.to_string()))
    }

    /// Executable search path with `runtime_home` prepended
    pub fn search_path(&self) -> Result<OsString, SpawnError> {
        let mut paths = vec![self.runtime_home.clone().into_std_path_buf()];
        if let Some(existing) = std::env::var_os("PATH") {
            paths.extend(std::env::split_paths(&existing));
        }
        std::env::join_paths(paths).map_err(|e| SpawnError::Environment(e.to_string()))
    }
}

/// A running worker process and its I/O.
///
/// Stdin/stdout belong to the [`WorkerChannel`]; stderr belongs to the
/// diagnostic reader task. Consumed by [`terminate`].
pub struct WorkerHandle {
    child: Child,
    pid: Option<u32>,
    channel: Arc<WorkerChannel>,
    diagnostics: JoinHandle<()>,
}

impl WorkerHandle {
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn channel(&self) -> Arc<WorkerChannel> {
        Arc::clone(&self.channel)
    }

    /// Check if the worker process is still running
    pub fn is_alive(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }
}

/// Start the worker and its diagnostic reader.
///
/// All three standard streams are piped; the process is killed if the handle
/// is dropped without [`terminate`].
pub fn spawn(
    layout: &WorkerLayout,
    progress: ProgressSlot,
    metrics: Arc<Metrics>,
) -> Result<WorkerHandle, SpawnError> {
    if !layout.runtime_home.is_dir() {
        return Err(SpawnError::RuntimeNotFound(layout.runtime_home.clone()));
    }

    let interpreter = layout
        .find_interpreter()
        .ok_or_else(|| SpawnError::InterpreterNotFound(layout.runtime_home.clone()))?;
    let script = layout.find_script()?;

    tracing::info!(
        interpreter = %interpreter,
        script = %script,
        "Starting worker process"
    );

    let mut cmd = ProcessCommand::new(interpreter.as_std_path());
    cmd.arg("-u")
        .arg(script.as_std_path())
        .env("PYTHONPATH", layout.python_path(&script)?)
        .env("PATH", layout.search_path()?)
        .env("PYTHONUNBUFFERED", "1")
        .env("PYTHONIOENCODING", "utf-8")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    #[cfg(windows)]
    cmd.creation_flags(CREATE_NO_WINDOW);

    let mut child = cmd.spawn()?;
    let pid = child.id();

    let stdin = child.stdin.take().ok_or(SpawnError::MissingPipe("stdin"))?;
    let stdout = child.stdout.take().ok_or(SpawnError::MissingPipe("stdout"))?;
    let stderr = child.stderr.take().ok_or(SpawnError::MissingPipe("stderr"))?;

    let channel = Arc::new(CommandChannel::new(stdin, BufReader::new(stdout), metrics.clone()));
    let diagnostics = DiagnosticClassifier::new(progress, metrics).spawn(stderr);

    tracing::info!(pid = ?pid, "Worker process spawned");

    Ok(WorkerHandle {
        child,
        pid,
        channel,
        diagnostics,
    })
}

/// Confirm a freshly spawned worker answers `ping` with `ok`.
///
/// A worker that fails the handshake must not be reused.
pub async fn health_check(handle: &WorkerHandle, limit: Duration) -> Result<(), HandshakeError> {
    let response = handle
        .channel
        .send(&Command::Ping, SendOptions::with_timeout(limit))
        .await?;

    if response.is_ok() {
        tracing::info!(pid = ?handle.pid, message = %response.message, "Worker handshake complete");
        Ok(())
    } else {
        Err(HandshakeError::Rejected(response.message))
    }
}

/// Stop the worker: polite `shutdown`, a grace period, then a kill.
///
/// Never fails; every step logs and moves on. The handle and its streams are
/// released when this returns.
pub async fn terminate(mut handle: WorkerHandle) {
    let pid = handle.pid;
    tracing::info!(pid = ?pid, "Shutting down worker");

    let options = SendOptions::with_timeout(SHUTDOWN_RESPONSE_TIMEOUT)
        .acquire_within(SHUTDOWN_ACQUIRE_TIMEOUT);
    match handle.channel.send(&Command::Shutdown, options).await {
        Ok(response) if response.is_ok() => {
            tracing::debug!(pid = ?pid, "Worker acknowledged shutdown");
        }
        Ok(response) => {
            tracing::warn!(pid = ?pid, message = %response.message, "Worker rejected shutdown");
        }
        Err(e) => {
            tracing::warn!(pid = ?pid, error = %e, "Could not deliver shutdown command");
        }
    }

    handle.channel.dispose();

    match timeout(SHUTDOWN_GRACE, handle.child.wait()).await {
        Ok(Ok(status)) => {
            tracing::info!(pid = ?pid, %status, "Worker exited");
        }
        Ok(Err(e)) => {
            tracing::warn!(pid = ?pid, error = %e, "Failed to wait for worker; killing");
            kill(&mut handle.child, pid).await;
        }
        Err(_) => {
            tracing::warn!(pid = ?pid, "Worker did not exit within {:?}; killing", SHUTDOWN_GRACE);
            kill(&mut handle.child, pid).await;
        }
    }

    match timeout(DIAGNOSTICS_JOIN_TIMEOUT, &mut handle.diagnostics).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) if e.is_panic() => {
            tracing::error!(pid = ?pid, "Diagnostic reader panicked: {}", e);
        }
        Ok(Err(_)) => {}
        Err(_) => {
            tracing::debug!(pid = ?pid, "Diagnostic reader still running; aborting");
            handle.diagnostics.abort();
        }
    }
}

async fn kill(child: &mut Child, pid: Option<u32>) {
    if let Err(e) = child.kill().await {
        tracing::warn!(pid = ?pid, error = %e, "Failed to kill worker");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn layout_in(dir: &Utf8Path) -> WorkerLayout {
        WorkerLayout {
            runtime_home: dir.join("runtime"),
            package_dir: dir.join("runtime/Lib/site-packages"),
            app_dir: dir.join("app"),
            script_name: "audiosr_worker.py".to_string(),
        }
    }

    fn temp_root() -> (TempDir, Utf8PathBuf) {
        let temp_dir = TempDir::new().unwrap();
        let root = Utf8PathBuf::try_from(temp_dir.path().to_path_buf()).unwrap();
        (temp_dir, root)
    }

    #[test]
    fn test_script_primary_location_preferred() {
        let (_temp, root) = temp_root();
        let layout = layout_in(&root);
        std::fs::create_dir_all(root.join("app/python")).unwrap();
        std::fs::write(root.join("app/python/audiosr_worker.py"), "").unwrap();
        std::fs::write(root.join("app/audiosr_worker.py"), "").unwrap();

        assert_eq!(layout.find_script().unwrap(), root.join("app/python/audiosr_worker.py"));
    }

    #[test]
    fn test_script_flat_fallback() {
        let (_temp, root) = temp_root();
        let layout = layout_in(&root);
        std::fs::create_dir_all(root.join("app")).unwrap();
        std::fs::write(root.join("app/audiosr_worker.py"), "").unwrap();

        assert_eq!(layout.find_script().unwrap(), root.join("app/audiosr_worker.py"));
    }

    #[test]
    fn test_script_missing() {
        let (_temp, root) = temp_root();
        let err = layout_in(&root).find_script().unwrap_err();
        assert!(matches!(err, SpawnError::ScriptNotFound { .. }));
        assert!(err.to_string().contains("audiosr_worker.py"));
    }

    #[test]
    fn test_search_path_starts_with_runtime() {
        let (_temp, root) = temp_root();
        let layout = layout_in(&root);
        let path = layout.search_path().unwrap();
        let first = std::env::split_paths(&path).next().unwrap();
        assert_eq!(first, root.join("runtime").into_std_path_buf());
    }

    #[test]
    fn test_python_path_contains_packages_and_script_dir() {
        let (_temp, root) = temp_root();
        let layout = layout_in(&root);
        let script = root.join("app/python/audiosr_worker.py");

        let entries: Vec<_> = std::env::split_paths(&layout.python_path(&script).unwrap()).collect();
        assert_eq!(
            entries,
            vec![
                root.join("runtime/Lib/site-packages").into_std_path_buf(),
                root.join("app/python").into_std_path_buf(),
            ]
        );
    }

    #[tokio::test]
    async fn test_spawn_requires_runtime_dir() {
        let (_temp, root) = temp_root();
        let result = spawn(&layout_in(&root), ProgressSlot::new(), Arc::new(Metrics::new()));
        assert!(matches!(result, Err(SpawnError::RuntimeNotFound(_))));
    }

    #[tokio::test]
    async fn test_spawn_requires_interpreter() {
        let (_temp, root) = temp_root();
        std::fs::create_dir_all(root.join("runtime")).unwrap();
        let result = spawn(&layout_in(&root), ProgressSlot::new(), Arc::new(Metrics::new()));
        assert!(matches!(result, Err(SpawnError::InterpreterNotFound(_))));
    }

    #[test]
    fn test_error_messages() {
        let err = HandshakeError::Rejected("not ready".to_string());
        assert!(err.to_string().contains("not ready"));

        let err = HandshakeError::from(ChannelError::NoResponse);
        assert!(err.to_string().contains("closed its output"));
    }
}
