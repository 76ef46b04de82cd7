use crate::metrics::Metrics;
use crate::models::ProgressEvent;
use regex::Regex;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, PoisonError, RwLock};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::task::JoinHandle;

/// Longest segment kept before it is flushed as a line on its own
const MAX_SEGMENT_BYTES: usize = 64 * 1024;

/// Combined progress pattern for the worker's progress bars.
///
/// - `definite`: `current[unit]/total[unit]`, optionally after a `NN%|bar|` prefix,
///   e.g. ` 42%|████      | 42/100 [00:01<00:02, 30it/s]` or `1.5M/3.0M`
/// - `count`: indeterminate counters such as `17it [00:02, 8.1it/s]`
const PROGRESS_PATTERN: &str = concat!(
    r"(?:\d+%\|[^|]*\|\s*)?",
    r"(?P<current>\d+(?:\.\d+)?)[A-Za-z]*/(?P<total>\d+(?:\.\d+)?)[A-Za-z]*",
    r"|(?P<count>\d+)it \["
);

/// Callback receiving per-file progress
pub type FileProgressFn = Arc<dyn Fn(ProgressEvent) + Send + Sync>;

/// Classification of one diagnostic segment
#[derive(Debug, Clone, PartialEq)]
pub enum DiagnosticLine {
    Progress(ProgressEvent),
    Log(String),
}

/// Parser for progress lines.
///
/// Unit suffixes are dropped; decimal magnitudes are scaled to a shared
/// integer base so that `current / total` keeps its ratio.
#[derive(Debug, Clone)]
pub struct ProgressParser {
    pattern: Regex,
}

impl ProgressParser {
    pub fn new() -> Self {
        Self {
            pattern: Regex::new(PROGRESS_PATTERN).expect("Invalid progress regex"),
        }
    }

    pub fn parse(&self, line: &str) -> Option<ProgressEvent> {
        let caps = self.pattern.captures(line)?;

        if let Some(count) = caps.name("count") {
            let current = count.as_str().parse().ok()?;
            return Some(ProgressEvent { current, total: 0 });
        }

        let (current, total) = scaled_pair(caps.name("current")?.as_str(), caps.name("total")?.as_str())?;
        Some(ProgressEvent { current, total })
    }

    pub fn classify(&self, line: &str) -> DiagnosticLine {
        match self.parse(line) {
            Some(event) => DiagnosticLine::Progress(event),
            None => DiagnosticLine::Log(line.to_string()),
        }
    }
}

impl Default for ProgressParser {
    fn default() -> Self {
        Self::new()
    }
}

fn fraction_digits(number: &str) -> usize {
    number.split_once('.').map_or(0, |(_, frac)| frac.len())
}

fn scale(number: &str, digits: usize) -> Option<u64> {
    let (int, frac) = number.split_once('.').unwrap_or((number, ""));
    let mut joined = String::with_capacity(int.len() + digits);
    joined.push_str(int);
    joined.push_str(frac);
    joined.extend(std::iter::repeat_n('0', digits - frac.len()));
    joined.parse().ok()
}

fn scaled_pair(current: &str, total: &str) -> Option<(u64, u64)> {
    let digits = fraction_digits(current).max(fraction_digits(total));
    Some((scale(current, digits)?, scale(total, digits)?))
}

/// Holder for the progress callback of the command currently in flight
///
/// Shared between the host (which registers callbacks per file) and the
/// classifier task (which emits into whatever is registered).
#[derive(Clone, Default)]
pub struct ProgressSlot {
    callback: Arc<RwLock<Option<FileProgressFn>>>,
}

impl ProgressSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install `callback` until the returned registration is dropped
    pub fn register(&self, callback: Option<FileProgressFn>) -> ProgressRegistration {
        *self.callback.write().unwrap_or_else(PoisonError::into_inner) = callback;
        ProgressRegistration { slot: self.clone() }
    }

    pub fn is_registered(&self) -> bool {
        self.callback
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Deliver an event; a panicking callback is logged and otherwise ignored
    pub fn emit(&self, event: ProgressEvent) {
        let callback = self
            .callback
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        if let Some(callback) = callback {
            if catch_unwind(AssertUnwindSafe(|| callback(event))).is_err() {
                tracing::error!("Progress callback panicked; event dropped");
            }
        }
    }

    fn clear(&self) {
        *self.callback.write().unwrap_or_else(PoisonError::into_inner) = None;
    }
}

/// Clears the slot when dropped
pub struct ProgressRegistration {
    slot: ProgressSlot,
}

impl Drop for ProgressRegistration {
    fn drop(&mut self) {
        self.slot.clear();
    }
}

/// Reader for the worker's diagnostic stream (stderr).
///
/// Progress bars redraw in place with `\r`, so segments are split on both
/// `\r` and `\n`. Progress goes to the registered callback and is not logged;
/// everything else is logged verbatim at debug level.
pub struct DiagnosticClassifier {
    parser: ProgressParser,
    progress: ProgressSlot,
    metrics: Arc<Metrics>,
}

impl DiagnosticClassifier {
    pub fn new(progress: ProgressSlot, metrics: Arc<Metrics>) -> Self {
        Self {
            parser: ProgressParser::new(),
            progress,
            metrics,
        }
    }

    /// Classify and dispatch one segment
    pub fn handle_segment(&self, raw: &[u8]) {
        let text = String::from_utf8_lossy(raw);
        let line = text.trim();
        if line.is_empty() {
            return;
        }

        match self.parser.classify(line) {
            DiagnosticLine::Progress(event) => {
                self.metrics.record_progress_event();
                self.progress.emit(event);
            }
            DiagnosticLine::Log(line) => {
                self.metrics.record_worker_log_line();
                tracing::debug!(target: "audiosr_host::worker", "{}", line);
            }
        }
    }

    /// Drain `reader` until EOF or a read error
    pub async fn run<R>(self, reader: R)
    where
        R: AsyncRead + Unpin,
    {
        let mut reader = BufReader::new(reader);
        let mut pending: Vec<u8> = Vec::new();

        loop {
            let buf = match reader.fill_buf().await {
                Ok(buf) => buf,
                Err(e) => {
                    tracing::debug!("Diagnostic stream read failed: {}", e);
                    break;
                }
            };

            if buf.is_empty() {
                break;
            }

            match buf.iter().position(|b| *b == b'\n' || *b == b'\r') {
                Some(pos) => {
                    pending.extend_from_slice(&buf[..pos]);
                    reader.consume(pos + 1);
                    self.handle_segment(&pending);
                    pending.clear();
                }
                None => {
                    let len = buf.len();
                    pending.extend_from_slice(buf);
                    reader.consume(len);
                    if pending.len() >= MAX_SEGMENT_BYTES {
                        self.handle_segment(&pending);
                        pending.clear();
                    }
                }
            }
        }

        self.handle_segment(&pending);
        tracing::debug!("Diagnostic stream closed");
    }

    /// Run the classifier as a background task
    pub fn spawn<R>(self, reader: R) -> JoinHandle<()>
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        tokio::spawn(self.run(reader))
    }
}
