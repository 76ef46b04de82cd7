//! Shared fixtures for integration tests
#![allow(dead_code)]

use async_trait::async_trait;
use audiosr_host::HostSettings;
use audiosr_host::services::{GpuProbe, PackageInstaller, ProvisionError};
use camino::{Utf8Path, Utf8PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tempfile::TempDir;

pub fn temp_root() -> (TempDir, Utf8PathBuf) {
    let temp_dir = TempDir::new().unwrap();
    let root = Utf8PathBuf::try_from(temp_dir.path().to_path_buf()).unwrap();
    (temp_dir, root)
}

/// Settings rooted in `root` with short timeouts
pub fn settings_in(root: &Utf8Path) -> HostSettings {
    HostSettings {
        runtime_home: root.join("runtime"),
        app_dir: root.join("app"),
        handshake_timeout_secs: 5,
        process_timeout_secs: 10,
        device: audiosr_host::DevicePreference::Cpu,
        ..HostSettings::default()
    }
}

/// Installer that counts calls and optionally fails the package install
#[derive(Default)]
pub struct CountingInstaller {
    pub checks: AtomicUsize,
    pub installs: AtomicUsize,
    pub fail_install: bool,
}

impl CountingInstaller {
    pub fn failing() -> Self {
        Self {
            fail_install: true,
            ..Self::default()
        }
    }

    pub fn side_effects(&self) -> usize {
        self.checks.load(Ordering::SeqCst) + self.installs.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PackageInstaller for CountingInstaller {
    async fn has_package_manager(&self) -> Result<bool, ProvisionError> {
        self.checks.fetch_add(1, Ordering::SeqCst);
        Ok(true)
    }

    async fn install_package_manager(&self) -> Result<(), ProvisionError> {
        Ok(())
    }

    async fn install_packages(&self, _packages: &[String]) -> Result<(), ProvisionError> {
        self.installs.fetch_add(1, Ordering::SeqCst);
        if self.fail_install {
            return Err(ProvisionError::CommandFailed {
                step: "package install".to_string(),
                code: Some(1),
                stdout_tail: String::new(),
                stderr_tail: "ERROR: Could not find a version that satisfies the requirement".to_string(),
            });
        }
        Ok(())
    }
}

/// Probe that reports no adapters
pub struct NoGpu;

impl GpuProbe for NoGpu {
    fn adapter_names(&self) -> anyhow::Result<Vec<String>> {
        Ok(Vec::new())
    }
}

pub fn no_gpu() -> Arc<dyn GpuProbe> {
    Arc::new(NoGpu)
}

/// Fake worker speaking the line protocol.
///
/// - `ping` → ok
/// - `process` with `bad_input` in the line → error status with a traceback
/// - `process` with `no_output` in the line → ok without writing the output
/// - other `process` → progress on stderr, a noise line on stdout, touch the output, ok
/// - `shutdown` → ok and exit
pub const FAKE_WORKER: &str = r#"
echo "fake worker starting" >&2
while IFS= read -r line; do
  case "$line" in
    *'"command":"ping"'*)
      printf '%s\n' '{"status":"ok","message":"pong"}'
      ;;
    *'"command":"shutdown"'*)
      printf '%s\n' '{"status":"ok","message":"bye"}'
      exit 0
      ;;
    *'"command":"process"'*)
      case "$line" in
        *bad_input*)
          printf '%s\n' '{"status":"error","message":"could not decode audio","traceback":"Traceback (most recent call last): boom"}'
          ;;
        *no_output*)
          printf '%s\n' '{"status":"ok","message":"done"}'
          ;;
        *)
          out=${line#*\"output\":\"}
          out=${out%%\"*}
          printf ' 50%%|#####     | 1/2 [00:01<00:01]\r100%%|##########| 2/2 [00:02<00:00]\n' >&2
          sleep 0.3
          echo "Loading checkpoint"
          : > "$out"
          printf '%s\n' '{"status":"ok","message":"done"}'
          ;;
      esac
      ;;
    *)
      printf '%s\n' '{"status":"error","message":"unknown command"}'
      ;;
  esac
done
"#;

/// Worker that answers the handshake, then ignores everything (including EOF)
pub const STUBBORN_WORKER: &str = r#"
IFS= read -r line
printf '%s\n' '{"status":"ok","message":"pong"}'
trap '' TERM
while :; do sleep 1; done
"#;

/// Lay out a runtime whose interpreter is `/bin/sh` running `script`
#[cfg(unix)]
pub fn install_fake_worker(settings: &HostSettings, script: &str) {
    let bin = settings.runtime_home.join("bin");
    std::fs::create_dir_all(&bin).unwrap();
    std::os::unix::fs::symlink("/bin/sh", bin.join("python3")).unwrap();

    let script_dir = settings.app_dir.join("python");
    std::fs::create_dir_all(&script_dir).unwrap();
    std::fs::write(script_dir.join(&settings.script_name), script).unwrap();
}

/// Pretend provisioning already happened
pub fn write_marker(settings: &HostSettings) {
    std::fs::create_dir_all(&settings.runtime_home).unwrap();
    std::fs::write(settings.marker_path(), &settings.marker_token).unwrap();
}
