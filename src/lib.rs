// audiosr-host - Supervisor for the AudioSR super-resolution worker
//
// This is the library crate: worker process supervision, the line protocol,
// dependency provisioning and configuration. The binary crate (main.rs)
// provides a batch command line front-end.

pub mod config;
pub mod host;
pub mod logging;
pub mod metrics;
pub mod models;
pub mod services;
pub mod state;

// Re-export commonly used types for convenience
pub use config::ConfigManager;
pub use host::{
    BatchItem, InitError, InitOutcome, ProcessError, ProcessJob, ProcessOptions, ProcessOutcome,
    WorkerHost,
};
pub use metrics::Metrics;
pub use models::{Device, DevicePreference, HostSettings, ProgressEvent};
pub use state::{InitState, StateChange, StateManager};

/// Application version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application name
pub const APP_NAME: &str = env!("CARGO_PKG_NAME");
