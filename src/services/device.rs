//! Processing device selection.
//!
//! The worker accepts `cuda` or `cpu`. With [`DevicePreference::Auto`] the
//! host enumerates graphics adapters once, on the first processing request,
//! and picks `cuda` only for adapters known to drive the CUDA backend.
//! Probe failures never propagate; they fall back to `cpu`.

use crate::models::{Device, DevicePreference};
use anyhow::{Context, Result, bail};
use std::process::Command;
use std::sync::Arc;
use tokio::sync::OnceCell;

/// Adapter name fragments that indicate a CUDA-capable card
const CUDA_VENDOR_HINTS: &[&str] = &["nvidia", "geforce", "quadro", "tesla", "rtx"];

/// Enumerates graphics adapter names
#[cfg_attr(test, mockall::automock)]
pub trait GpuProbe: Send + Sync {
    fn adapter_names(&self) -> Result<Vec<String>>;
}

/// Probe backed by the platform's own tooling
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemGpuProbe;

impl GpuProbe for SystemGpuProbe {
    fn adapter_names(&self) -> Result<Vec<String>> {
        let mut cmd = if cfg!(windows) {
            let mut c = Command::new("powershell");
            c.args([
                "-NoProfile",
                "-NonInteractive",
                "-Command",
                "Get-CimInstance Win32_VideoController | Select-Object -ExpandProperty Name",
            ]);
            c
        } else {
            let mut c = Command::new("nvidia-smi");
            c.args(["--query-gpu=name", "--format=csv,noheader"]);
            c
        };

        #[cfg(windows)]
        {
            use std::os::windows::process::CommandExt;
            cmd.creation_flags(crate::services::supervisor::CREATE_NO_WINDOW);
        }

        let output = cmd.output().context("Failed to run GPU enumeration")?;
        if !output.status.success() {
            bail!("GPU enumeration exited with {}", output.status);
        }

        Ok(String::from_utf8_lossy(&output.stdout)
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(String::from)
            .collect())
    }
}

/// Map adapter names to a device; anything unrecognised is `cpu`
pub fn classify_adapters(names: &[String]) -> Device {
    let cuda = names.iter().any(|name| {
        let lower = name.to_lowercase();
        CUDA_VENDOR_HINTS.iter().any(|hint| lower.contains(hint))
    });

    if cuda { Device::Cuda } else { Device::Cpu }
}

/// Memoized device choice for one host
pub struct DeviceSelector {
    preference: DevicePreference,
    probe: Arc<dyn GpuProbe>,
    selected: OnceCell<Device>,
}

impl DeviceSelector {
    pub fn new(preference: DevicePreference, probe: Arc<dyn GpuProbe>) -> Self {
        Self {
            preference,
            probe,
            selected: OnceCell::new(),
        }
    }

    /// The chosen device, probing on first call only
    pub async fn select(&self) -> Device {
        *self
            .selected
            .get_or_init(|| async {
                if let Some(device) = self.preference.forced() {
                    tracing::info!("Using configured device: {}", device);
                    return device;
                }

                let probe = Arc::clone(&self.probe);
                match tokio::task::spawn_blocking(move || probe.adapter_names()).await {
                    Ok(Ok(names)) => {
                        let device = classify_adapters(&names);
                        tracing::info!("Detected adapters {:?}; using {}", names, device);
                        device
                    }
                    Ok(Err(e)) => {
                        tracing::warn!("GPU detection failed, falling back to cpu: {:#}", e);
                        Device::Cpu
                    }
                    Err(e) => {
                        tracing::warn!("GPU detection task failed, falling back to cpu: {}", e);
                        Device::Cpu
                    }
                }
            })
            .await
    }

    /// The memoized device, if a selection has happened
    pub fn selected(&self) -> Option<Device> {
        self.selected.get().copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_classify_nvidia() {
        assert_eq!(classify_adapters(&names(&["NVIDIA GeForce RTX 4070"])), Device::Cuda);
        assert_eq!(classify_adapters(&names(&["Quadro P2000"])), Device::Cuda);
    }

    #[test]
    fn test_classify_other_vendors() {
        assert_eq!(
            classify_adapters(&names(&["AMD Radeon RX 7900 XTX", "Intel(R) UHD Graphics 770"])),
            Device::Cpu
        );
        assert_eq!(classify_adapters(&[]), Device::Cpu);
    }

    #[test]
    fn test_classify_mixed_adapters_prefers_cuda() {
        assert_eq!(
            classify_adapters(&names(&["Intel(R) UHD Graphics", "NVIDIA RTX A2000"])),
            Device::Cuda
        );
    }

    #[tokio::test]
    async fn test_selection_is_memoized() {
        let mut probe = MockGpuProbe::new();
        probe
            .expect_adapter_names()
            .times(1)
            .returning(|| Ok(vec!["NVIDIA GeForce GTX 1080".to_string()]));

        let selector = DeviceSelector::new(DevicePreference::Auto, Arc::new(probe));
        assert_eq!(selector.selected(), None);
        assert_eq!(selector.select().await, Device::Cuda);
        assert_eq!(selector.select().await, Device::Cuda);
        assert_eq!(selector.selected(), Some(Device::Cuda));
    }

    #[tokio::test]
    async fn test_probe_failure_falls_back_to_cpu() {
        let mut probe = MockGpuProbe::new();
        probe
            .expect_adapter_names()
            .returning(|| Err(anyhow::anyhow!("nvidia-smi not found")));

        let selector = DeviceSelector::new(DevicePreference::Auto, Arc::new(probe));
        assert_eq!(selector.select().await, Device::Cpu);
    }

    #[tokio::test]
    async fn test_forced_preference_skips_probe() {
        let mut probe = MockGpuProbe::new();
        probe.expect_adapter_names().never();

        let selector = DeviceSelector::new(DevicePreference::Cpu, Arc::new(probe));
        assert_eq!(selector.select().await, Device::Cpu);
    }
}
