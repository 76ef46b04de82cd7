use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::models::protocol::Device;

/// Which processing backend to request from the worker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DevicePreference {
    /// Probe the graphics hardware on first use
    #[default]
    Auto,
    Cuda,
    Cpu,
}

impl DevicePreference {
    /// The forced device, if any
    pub fn forced(&self) -> Option<Device> {
        match self {
            DevicePreference::Auto => None,
            DevicePreference::Cuda => Some(Device::Cuda),
            DevicePreference::Cpu => Some(Device::Cpu),
        }
    }
}

/// Host settings from `audiosr-host.yaml`
///
/// Relative paths are resolved against the process working directory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HostSettings {
    /// Directory of the embedded interpreter distribution
    pub runtime_home: Utf8PathBuf,

    /// Application directory that holds the worker script (or its `python/` subfolder)
    pub app_dir: Utf8PathBuf,

    pub script_name: String,

    /// Package directory, relative to `runtime_home`
    pub package_dir: Utf8PathBuf,

    /// Marker file name, relative to `runtime_home`
    pub marker_file: String,

    /// Expected marker token; bump it to force re-provisioning
    pub marker_token: String,

    /// pip bootstrap script, relative to `runtime_home`
    pub get_pip_script: Utf8PathBuf,

    pub packages: Vec<String>,

    pub handshake_timeout_secs: u64,
    pub process_timeout_secs: u64,

    pub model_name: String,
    pub ddim_steps: u32,
    pub guidance_scale: f64,
    pub seed: Option<i64>,
    pub device: DevicePreference,

    /// Appended to the input file stem when deriving output names
    pub output_suffix: String,

    pub debug_logging: bool,
}

impl Default for HostSettings {
    fn default() -> Self {
        Self {
            runtime_home: Utf8PathBuf::from("python"),
            app_dir: Utf8PathBuf::from("."),
            script_name: "audiosr_worker.py".to_string(),
            package_dir: Utf8PathBuf::from("Lib/site-packages"),
            marker_file: ".audiosr_installed".to_string(),
            marker_token: "audiosr-0.0.7-r1".to_string(),
            get_pip_script: Utf8PathBuf::from("get-pip.py"),
            packages: default_packages(),
            handshake_timeout_secs: 30,
            process_timeout_secs: 600,
            model_name: "basic".to_string(),
            ddim_steps: 50,
            guidance_scale: 3.5,
            seed: None,
            device: DevicePreference::Auto,
            output_suffix: "_AudioSR".to_string(),
            debug_logging: false,
        }
    }
}

fn default_packages() -> Vec<String> {
    ["audiosr==0.0.7", "torch", "torchaudio", "soundfile", "numpy<2"]
        .into_iter()
        .map(String::from)
        .collect()
}

impl HostSettings {
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }

    pub fn process_timeout(&self) -> Duration {
        Duration::from_secs(self.process_timeout_secs)
    }

    pub fn package_path(&self) -> Utf8PathBuf {
        self.runtime_home.join(&self.package_dir)
    }

    pub fn marker_path(&self) -> Utf8PathBuf {
        self.runtime_home.join(&self.marker_file)
    }

    pub fn get_pip_path(&self) -> Utf8PathBuf {
        self.runtime_home.join(&self.get_pip_script)
    }

    /// Output path for `input`: `<dir>/<stem><suffix>.wav`, next to the input unless `output_dir` is given
    pub fn output_path_for(&self, input: &Utf8Path, output_dir: Option<&Utf8Path>) -> Utf8PathBuf {
        let stem = input.file_stem().unwrap_or("output");
        let dir = output_dir
            .or_else(|| input.parent())
            .unwrap_or_else(|| Utf8Path::new("."));
        dir.join(format!("{}{}.wav", stem, self.output_suffix))
    }
}
