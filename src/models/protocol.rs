use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Processing backend requested from the worker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Device {
    Cuda,
    Cpu,
}

impl Device {
    pub fn as_str(&self) -> &'static str {
        match self {
            Device::Cuda => "cuda",
            Device::Cpu => "cpu",
        }
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Parameters of a single `process` command
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProcessRequest {
    pub input: Utf8PathBuf,
    pub output: Utf8PathBuf,
    pub model_name: String,
    pub device: Device,
    pub ddim_steps: u32,
    pub guidance_scale: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seed: Option<i64>,
}

/// Outbound request to the worker.
///
/// Serialized as a single JSON object whose `command` field carries the
/// variant name, e.g. `{"command":"ping"}`. Variant fields are flattened
/// next to the discriminator, which is the shape the worker reads.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "command", rename_all = "lowercase")]
pub enum Command {
    Ping,
    Process(ProcessRequest),
    Shutdown,
}

impl Command {
    /// Name used on the wire and in logs
    pub fn kind(&self) -> &'static str {
        match self {
            Command::Ping => "ping",
            Command::Process(_) => "process",
            Command::Shutdown => "shutdown",
        }
    }

    /// Serialize to one newline-terminated protocol line
    pub fn to_line(&self) -> serde_json::Result<String> {
        let mut line = serde_json::to_string(self)?;
        line.push('\n');
        Ok(line)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseStatus {
    Ok,
    Error,
}

/// Inbound reply from the worker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub status: ResponseStatus,
    #[serde(default)]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub traceback: Option<String>,
}

impl Response {
    /// Parse a stdout line; anything that is not a well-formed reply yields `None`
    pub fn parse_line(line: &str) -> Option<Self> {
        serde_json::from_str(line.trim()).ok()
    }

    pub fn is_ok(&self) -> bool {
        self.status == ResponseStatus::Ok
    }
}

/// A progress sample taken from the worker's diagnostic stream.
///
/// `total == 0` means the total is unknown and `current` is a running counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgressEvent {
    pub current: u64,
    pub total: u64,
}

impl ProgressEvent {
    pub fn is_indeterminate(&self) -> bool {
        self.total == 0
    }

    /// Completed fraction in `0.0..=1.0`, or `None` when the total is unknown
    pub fn fraction(&self) -> Option<f64> {
        if self.total == 0 {
            None
        } else {
            Some((self.current as f64 / self.total as f64).clamp(0.0, 1.0))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_simple_commands_serialize() {
        assert_eq!(Command::Ping.to_line().unwrap(), "{\"command\":\"ping\"}\n");
        assert_eq!(
            serde_json::to_string(&Command::Shutdown).unwrap(),
            r#"{"command":"shutdown"}"#
        );
    }

    #[test]
    fn test_process_command_shape() {
        let command = Command::Process(ProcessRequest {
            input: "in.wav".into(),
            output: "out.wav".into(),
            model_name: "basic".to_string(),
            device: Device::Cuda,
            ddim_steps: 50,
            guidance_scale: 3.5,
            seed: None,
        });

        let value: serde_json::Value = serde_json::to_value(&command).unwrap();
        assert_eq!(value["command"], "process");
        assert_eq!(value["input"], "in.wav");
        assert_eq!(value["device"], "cuda");
        assert_eq!(value["ddim_steps"], 50);
        assert!(value.get("seed").is_none());
    }

    #[test]
    fn test_seed_included_when_present() {
        let command = Command::Process(ProcessRequest {
            input: "a.wav".into(),
            output: "b.wav".into(),
            model_name: "speech".to_string(),
            device: Device::Cpu,
            ddim_steps: 10,
            guidance_scale: 2.0,
            seed: Some(42),
        });

        let line = command.to_line().unwrap();
        assert!(line.ends_with('\n'));
        assert!(line.contains(r#""seed":42"#));
    }

    #[test]
    fn test_response_parsing() {
        let ok = Response::parse_line(r#"{"status": "ok", "message": "ready"}"#).unwrap();
        assert!(ok.is_ok());
        assert_eq!(ok.message, "ready");

        let err = Response::parse_line(
            r#"{"status":"error","message":"boom","traceback":"Traceback..."}"#,
        )
        .unwrap();
        assert_eq!(err.status, ResponseStatus::Error);
        assert_eq!(err.traceback.as_deref(), Some("Traceback..."));
    }

    #[test]
    fn test_non_protocol_lines_rejected() {
        assert!(Response::parse_line("Loading model...").is_none());
        assert!(Response::parse_line(r#"{"status":"pending","message":"x"}"#).is_none());
        assert!(Response::parse_line(r#"{"message":"no status"}"#).is_none());
        assert!(Response::parse_line("").is_none());
    }

    #[test]
    fn test_progress_fraction() {
        assert_eq!(ProgressEvent { current: 25, total: 100 }.fraction(), Some(0.25));
        let heartbeat = ProgressEvent { current: 17, total: 0 };
        assert!(heartbeat.is_indeterminate());
        assert_eq!(heartbeat.fraction(), None);
    }
}
