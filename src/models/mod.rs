//! Data models shared across the host.
//!
//! - [`protocol`]: the worker wire types ([`Command`], [`Response`]) and [`ProgressEvent`]
//! - [`config`]: [`HostSettings`] persisted in `audiosr-host.yaml`
//!
//! Wire types mirror the worker's JSON shape exactly; the worker script is not
//! under our control, so field names here are part of the protocol.

pub mod config;
pub mod protocol;

pub use config::{DevicePreference, HostSettings};
pub use protocol::{Command, Device, ProcessRequest, ProgressEvent, Response, ResponseStatus};
