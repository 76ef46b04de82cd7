//! Services module - worker process plumbing.
//!
//! Everything needed to run the external AudioSR worker lives here. The
//! services know nothing about the CLI; they are composed by
//! [`WorkerHost`](crate::host::WorkerHost).
//!
//! # Components
//!
//! - [`channel`]: single-flight JSON line protocol over the worker's stdin/stdout.
//!   At most one command is outstanding; cancellation, timeouts and disposal all
//!   release the channel.
//! - [`diagnostics`]: reader for the worker's stderr. Splits on `\r` and `\n`,
//!   turns progress bars into [`ProgressEvent`](crate::models::ProgressEvent)s
//!   and logs everything else.
//! - [`supervisor`]: locating the interpreter and script, spawning the process,
//!   the `ping` handshake and the shutdown/kill sequence.
//! - [`provisioning`]: one-time pip bootstrap and package install, tracked by a
//!   version marker file.
//! - [`device`]: `cuda`/`cpu` choice from the configured preference or a
//!   graphics adapter probe.
//!
//! # Process model
//!
//! ```text
//!   host ──stdin (commands)──▶ worker
//!   host ◀─stdout (responses)── worker
//!   host ◀─stderr (progress + logs)── worker
//! ```

pub mod channel;
pub mod device;
pub mod diagnostics;
pub mod provisioning;
pub mod supervisor;

pub use channel::{ChannelError, CommandChannel, SendOptions, WorkerChannel};
pub use device::{DeviceSelector, GpuProbe, SystemGpuProbe};
pub use diagnostics::{DiagnosticClassifier, FileProgressFn, ProgressParser, ProgressSlot};
pub use provisioning::{MarkerFile, PackageInstaller, PipInstaller, ProvisionError, ProvisionProgressFn};
pub use supervisor::{HandshakeError, SpawnError, WorkerHandle, WorkerLayout};
