//! One-time dependency provisioning for the worker runtime.
//!
//! Provisioning prepares the package directory, bootstraps pip when the
//! runtime ships without it, and installs the worker's packages. Completion is
//! recorded by a [`MarkerFile`] holding a version token; a matching token lets
//! later starts skip the whole sequence.

use crate::models::HostSettings;
use crate::services::supervisor::WorkerLayout;
use async_trait::async_trait;
use camino::{Utf8Path, Utf8PathBuf};
use std::fs;
use std::io::ErrorKind;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::process::Command;
use tokio::time::timeout;

/// Number of coarse stages reported to the progress sink
pub const PROVISION_STAGES: usize = 3;

/// Lines of captured output kept in error reports
const OUTPUT_TAIL_LINES: usize = 20;

const PIP_CHECK_TIMEOUT: Duration = Duration::from_secs(60);
const PIP_BOOTSTRAP_TIMEOUT: Duration = Duration::from_secs(10 * 60);
const PACKAGE_INSTALL_TIMEOUT: Duration = Duration::from_secs(60 * 60);

/// Callback receiving `(stage, stage_count, message)`
pub type ProvisionProgressFn = Arc<dyn Fn(usize, usize, &str) + Send + Sync>;

/// Errors during provisioning. No marker is written when any of these occur.
#[derive(Error, Debug)]
pub enum ProvisionError {
    #[error("Failed to prepare {path}: {source}")]
    Filesystem {
        path: Utf8PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("No interpreter executable found in {0}")]
    InterpreterNotFound(Utf8PathBuf),

    #[error("pip bootstrap script not found: {0}")]
    BootstrapScriptMissing(Utf8PathBuf),

    #[error("Failed to launch {step}: {source}")]
    Launch {
        step: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{step} timed out after {timeout:?}")]
    Timeout { step: String, timeout: Duration },

    #[error(
        "{step} failed with exit code {code:?}\n--- stdout (tail) ---\n{stdout_tail}\n--- stderr (tail) ---\n{stderr_tail}"
    )]
    CommandFailed {
        step: String,
        code: Option<i32>,
        stdout_tail: String,
        stderr_tail: String,
    },
}

/// Persisted provisioning marker
#[derive(Debug, Clone)]
pub struct MarkerFile {
    path: Utf8PathBuf,
}

impl MarkerFile {
    pub fn new<P: AsRef<Utf8Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Utf8Path {
        &self.path
    }

    /// The stored token, or `None` when the marker is absent or unreadable
    pub fn read(&self) -> Option<String> {
        match fs::read_to_string(&self.path) {
            Ok(content) => Some(content.trim().to_string()),
            Err(e) if e.kind() == ErrorKind::NotFound => None,
            Err(e) => {
                tracing::warn!("Failed to read marker {}: {}", self.path, e);
                None
            }
        }
    }

    pub fn matches(&self, expected: &str) -> bool {
        self.read().is_some_and(|token| token == expected)
    }

    pub fn write(&self, token: &str) -> Result<(), ProvisionError> {
        if let Some(parent) = self.path.parent().filter(|dir| !dir.as_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|source| ProvisionError::Filesystem {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        fs::write(&self.path, token).map_err(|source| ProvisionError::Filesystem {
            path: self.path.clone(),
            source,
        })?;
        tracing::info!("Wrote provisioning marker {} ({})", self.path, token);
        Ok(())
    }
}

/// Package manager operations used during provisioning
#[async_trait]
pub trait PackageInstaller: Send + Sync {
    async fn has_package_manager(&self) -> Result<bool, ProvisionError>;

    async fn install_package_manager(&self) -> Result<(), ProvisionError>;

    async fn install_packages(&self, packages: &[String]) -> Result<(), ProvisionError>;
}

/// Installer driving pip through the runtime's own interpreter
#[derive(Debug, Clone)]
pub struct PipInstaller {
    layout: WorkerLayout,
    get_pip: Utf8PathBuf,
}

impl PipInstaller {
    pub fn new(layout: WorkerLayout, get_pip: Utf8PathBuf) -> Self {
        Self { layout, get_pip }
    }

    pub fn from_settings(settings: &HostSettings) -> Self {
        Self::new(WorkerLayout::from_settings(settings), settings.get_pip_path())
    }

    fn interpreter(&self) -> Result<Utf8PathBuf, ProvisionError> {
        self.layout
            .find_interpreter()
            .ok_or_else(|| ProvisionError::InterpreterNotFound(self.layout.runtime_home.clone()))
    }

    /// Run the interpreter with `args`, capturing output
    async fn run_python(
        &self,
        step: &str,
        args: &[&str],
        limit: Duration,
    ) -> Result<std::process::Output, ProvisionError> {
        let interpreter = self.interpreter()?;
        tracing::info!("{}: {} {}", step, interpreter, args.join(" "));

        let mut cmd = Command::new(interpreter.as_std_path());
        cmd.args(args)
            .env("PYTHONPATH", self.layout.package_dir.as_std_path())
            .env("PYTHONIOENCODING", "utf-8")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        #[cfg(windows)]
        cmd.creation_flags(crate::services::supervisor::CREATE_NO_WINDOW);

        let child = cmd.spawn().map_err(|source| ProvisionError::Launch {
            step: step.to_string(),
            source,
        })?;

        timeout(limit, child.wait_with_output())
            .await
            .map_err(|_| ProvisionError::Timeout {
                step: step.to_string(),
                timeout: limit,
            })?
            .map_err(|source| ProvisionError::Launch {
                step: step.to_string(),
                source,
            })
    }

    async fn run_checked(&self, step: &str, args: &[&str], limit: Duration) -> Result<(), ProvisionError> {
        let output = self.run_python(step, args, limit).await?;
        if output.status.success() {
            return Ok(());
        }

        Err(ProvisionError::CommandFailed {
            step: step.to_string(),
            code: output.status.code(),
            stdout_tail: tail_lines(&output.stdout, OUTPUT_TAIL_LINES),
            stderr_tail: tail_lines(&output.stderr, OUTPUT_TAIL_LINES),
        })
    }
}

#[async_trait]
impl PackageInstaller for PipInstaller {
    async fn has_package_manager(&self) -> Result<bool, ProvisionError> {
        let output = self
            .run_python("pip check", &["-m", "pip", "--version"], PIP_CHECK_TIMEOUT)
            .await?;
        Ok(output.status.success())
    }

    async fn install_package_manager(&self) -> Result<(), ProvisionError> {
        if !self.get_pip.is_file() {
            return Err(ProvisionError::BootstrapScriptMissing(self.get_pip.clone()));
        }
        self.run_checked(
            "pip bootstrap",
            &[self.get_pip.as_str(), "--no-warn-script-location"],
            PIP_BOOTSTRAP_TIMEOUT,
        )
        .await
    }

    async fn install_packages(&self, packages: &[String]) -> Result<(), ProvisionError> {
        let mut args = vec![
            "-m",
            "pip",
            "install",
            "--no-warn-script-location",
            "--disable-pip-version-check",
        ];
        args.extend(packages.iter().map(String::as_str));
        self.run_checked("package install", &args, PACKAGE_INSTALL_TIMEOUT)
            .await
    }
}

/// Last `count` lines of captured process output
pub fn tail_lines(bytes: &[u8], count: usize) -> String {
    let text = String::from_utf8_lossy(bytes);
    let lines: Vec<&str> = text.lines().collect();
    let start = lines.len().saturating_sub(count);
    lines[start..].join("\n")
}

/// Run the provisioning sequence.
///
/// Does not touch the marker; the caller writes it once this returns `Ok`.
pub async fn provision(
    package_dir: &Utf8Path,
    packages: &[String],
    installer: &dyn PackageInstaller,
    progress: Option<&ProvisionProgressFn>,
) -> Result<(), ProvisionError> {
    let report = |stage: usize, message: &str| {
        tracing::info!("Provisioning [{}/{}]: {}", stage, PROVISION_STAGES, message);
        if let Some(progress) = progress {
            progress(stage, PROVISION_STAGES, message);
        }
    };

    report(1, "Preparing package directory");
    fs::create_dir_all(package_dir).map_err(|source| ProvisionError::Filesystem {
        path: package_dir.to_path_buf(),
        source,
    })?;

    report(2, "Checking for pip");
    if installer.has_package_manager().await? {
        tracing::debug!("pip already available");
    } else {
        report(2, "Installing pip");
        installer.install_package_manager().await?;
    }

    report(3, &format!("Installing packages: {}", packages.join(", ")));
    installer.install_packages(packages).await?;

    tracing::info!("Provisioning complete");
    Ok(())
}
