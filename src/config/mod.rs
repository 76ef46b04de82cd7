use crate::models::HostSettings;
use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use config::{Config, Environment, File, FileFormat};
use std::fs;

/// Settings file name inside the configuration directory
pub const SETTINGS_FILE: &str = "audiosr-host.yaml";

/// Prefix of environment variables that override file settings
pub const ENV_PREFIX: &str = "AUDIOSR";

/// Configuration manager for loading and saving host settings.
///
/// Settings come from `audiosr-host.yaml` in the configuration directory,
/// overridden by `AUDIOSR_*` environment variables
/// (e.g. `AUDIOSR_PROCESS_TIMEOUT_SECS=900`). Any field left unset falls back
/// to [`HostSettings::default`].
#[derive(Debug, Clone)]
pub struct ConfigManager {
    config_dir: Utf8PathBuf,
    settings_path: Utf8PathBuf,
    env_prefix: String,
}

impl ConfigManager {
    /// Create a new ConfigManager with the specified configuration directory.
    ///
    /// The directory is created if it does not exist.
    pub fn new<P: AsRef<Utf8Path>>(config_dir: P) -> Result<Self> {
        let config_dir = config_dir.as_ref().to_path_buf();

        if !config_dir.exists() {
            fs::create_dir_all(&config_dir)
                .with_context(|| format!("Failed to create config directory: {}", config_dir))?;
        }

        Ok(Self {
            settings_path: config_dir.join(SETTINGS_FILE),
            config_dir,
            env_prefix: ENV_PREFIX.to_string(),
        })
    }

    /// Use a different environment variable prefix
    pub fn with_env_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.env_prefix = prefix.into();
        self
    }

    /// Load settings from the YAML file and the environment.
    ///
    /// # Returns
    /// The merged settings; defaults when neither source sets anything
    pub fn load_settings(&self) -> Result<HostSettings> {
        if !self.settings_path.exists() {
            tracing::warn!(
                "Settings file not found at {}, using defaults",
                self.settings_path
            );
        }

        let settings: HostSettings = Config::builder()
            .add_source(
                File::from(self.settings_path.as_std_path())
                    .format(FileFormat::Yaml)
                    .required(false),
            )
            .add_source(Environment::with_prefix(&self.env_prefix).try_parsing(true))
            .build()
            .with_context(|| format!("Failed to read settings: {}", self.settings_path))?
            .try_deserialize()
            .with_context(|| format!("Failed to parse settings: {}", self.settings_path))?;

        tracing::info!("Loaded settings from {}", self.settings_path);
        Ok(settings)
    }

    /// Save settings to the YAML file.
    pub fn save_settings(&self, settings: &HostSettings) -> Result<()> {
        let yaml_string =
            serde_yaml_ng::to_string(settings).context("Failed to serialize settings to YAML")?;

        fs::write(&self.settings_path, yaml_string)
            .with_context(|| format!("Failed to write settings: {}", self.settings_path))?;

        tracing::info!("Saved settings to {}", self.settings_path);
        Ok(())
    }

    pub fn settings_path(&self) -> &Utf8Path {
        &self.settings_path
    }

    /// Get the configuration directory path.
    pub fn config_dir(&self) -> &Utf8Path {
        &self.config_dir
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::DevicePreference;
    use tempfile::TempDir;

    fn create_test_config_manager() -> (ConfigManager, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let config_path = Utf8PathBuf::try_from(temp_dir.path().to_path_buf()).unwrap();
        let manager = ConfigManager::new(&config_path)
            .unwrap()
            .with_env_prefix("AUDIOSR_UNIT_TEST");
        (manager, temp_dir)
    }

    #[test]
    fn test_missing_file_gives_defaults() {
        let (manager, _temp_dir) = create_test_config_manager();
        assert_eq!(manager.load_settings().unwrap(), HostSettings::default());
    }

    #[test]
    fn test_load_save_settings() {
        let (manager, _temp_dir) = create_test_config_manager();

        let settings = HostSettings {
            ddim_steps: 100,
            seed: Some(42),
            device: DevicePreference::Cpu,
            ..HostSettings::default()
        };
        manager.save_settings(&settings).unwrap();

        let loaded = manager.load_settings().unwrap();
        assert_eq!(loaded, settings);
    }

    #[test]
    fn test_partial_file_keeps_other_defaults() {
        let (manager, _temp_dir) = create_test_config_manager();
        fs::write(manager.settings_path(), "model_name: speech\nprocess_timeout_secs: 1200\n").unwrap();

        let loaded = manager.load_settings().unwrap();
        assert_eq!(loaded.model_name, "speech");
        assert_eq!(loaded.process_timeout_secs, 1200);
        assert_eq!(loaded.ddim_steps, 50);
    }

    #[test]
    fn test_invalid_yaml_is_an_error() {
        let (manager, _temp_dir) = create_test_config_manager();
        fs::write(manager.settings_path(), "ddim_steps: [not, a, number]\n").unwrap();
        assert!(manager.load_settings().is_err());
    }
}
