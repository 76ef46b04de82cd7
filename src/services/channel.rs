//! Single-flight request/response channel over the worker's stdin/stdout.
//!
//! The channel is the only writer of the worker's stdin and the only reader of
//! its stdout. One command is outstanding at a time: a caller holds the
//! channel mutex from the moment it starts writing until a response line has
//! been consumed (or the wait is abandoned), so responses never need
//! correlation ids.

use crate::metrics::Metrics;
use crate::models::{Command, Response};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::process::{ChildStdin, ChildStdout};
use tokio::sync::{Mutex, MutexGuard, watch};

/// Default response timeout for processing commands
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(600);

/// Errors from a single command exchange
///
/// None of these poison the channel: the single-flight guard is released on
/// every path, so a later `send` can proceed.
#[derive(Error, Debug)]
pub enum ChannelError {
    #[error("Command channel has been disposed")]
    Disposed,

    #[error("Command was cancelled")]
    Cancelled,

    #[error("No response from worker within {0:?}")]
    Timeout(Duration),

    #[error("Worker closed its output before responding")]
    NoResponse,

    #[error("Failed to serialize command: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("Worker I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Per-call limits for [`CommandChannel::send`]
#[derive(Debug, Clone)]
pub struct SendOptions {
    /// Limit on the write-and-wait exchange, measured after the guard is held
    pub timeout: Duration,

    /// Limit on acquiring the single-flight guard; `None` waits indefinitely
    pub acquire_timeout: Option<Duration>,

    /// Cancellation signal; the send aborts once the value becomes `true`
    pub cancel: Option<watch::Receiver<bool>>,
}

impl SendOptions {
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout,
            acquire_timeout: None,
            cancel: None,
        }
    }

    pub fn acquire_within(mut self, limit: Duration) -> Self {
        self.acquire_timeout = Some(limit);
        self
    }

    pub fn cancel_on(mut self, cancel: Option<watch::Receiver<bool>>) -> Self {
        self.cancel = cancel;
        self
    }
}

impl Default for SendOptions {
    fn default() -> Self {
        Self::with_timeout(DEFAULT_COMMAND_TIMEOUT)
    }
}

struct ChannelIo<W, R> {
    writer: W,
    reader: R,
    /// Bytes of the stdout line currently being read; survives an abandoned wait
    pending: Vec<u8>,
    /// Set while a command line is only partly written to stdin
    torn_write: bool,
}

/// Line protocol client with an at-most-one-in-flight guarantee
pub struct CommandChannel<W, R> {
    io: Mutex<ChannelIo<W, R>>,
    disposed: watch::Sender<bool>,
    metrics: Arc<Metrics>,
}

/// The channel as wired to a spawned worker process
pub type WorkerChannel = CommandChannel<ChildStdin, BufReader<ChildStdout>>;

impl<W, R> CommandChannel<W, R>
where
    W: AsyncWrite + Unpin + Send,
    R: AsyncBufRead + Unpin + Send,
{
    pub fn new(writer: W, reader: R, metrics: Arc<Metrics>) -> Self {
        let (disposed, _) = watch::channel(false);
        Self {
            io: Mutex::new(ChannelIo {
                writer,
                reader,
                pending: Vec::new(),
                torn_write: false,
            }),
            disposed,
            metrics,
        }
    }

    pub fn is_disposed(&self) -> bool {
        *self.disposed.borrow()
    }

    /// Mark the channel unusable.
    ///
    /// Callers blocked in `send` (waiting for the guard or for a response)
    /// return [`ChannelError::Disposed`] and release the guard.
    pub fn dispose(&self) {
        if !self.disposed.send_replace(true) {
            tracing::debug!("Command channel disposed");
        }
    }

    /// Send one command and wait for the worker's response.
    ///
    /// Stdout lines that are not protocol responses are logged at warn level
    /// and skipped; they never count as the answer.
    pub async fn send(
        &self,
        command: &Command,
        options: SendOptions,
    ) -> Result<Response, ChannelError> {
        if self.is_disposed() {
            return Err(ChannelError::Disposed);
        }

        let SendOptions {
            timeout,
            acquire_timeout,
            mut cancel,
        } = options;
        let mut disposed = self.disposed.subscribe();

        let mut io = tokio::select! {
            guard = acquire(&self.io, acquire_timeout) => guard?,
            _ = cancelled(&mut cancel) => {
                self.metrics.record_cancellation();
                tracing::debug!(command = command.kind(), "Cancelled while waiting for the channel");
                return Err(ChannelError::Cancelled);
            }
            _ = raised(&mut disposed) => return Err(ChannelError::Disposed),
        };

        // Disposal may have raced the guard
        if self.is_disposed() {
            return Err(ChannelError::Disposed);
        }

        let result = tokio::select! {
            exchanged = tokio::time::timeout(timeout, exchange(&mut *io, command, &self.metrics)) => {
                match exchanged {
                    Ok(result) => result,
                    Err(_) => {
                        self.metrics.record_timeout();
                        tracing::warn!(
                            command = command.kind(),
                            timeout_ms = timeout.as_millis() as u64,
                            "Worker did not respond in time"
                        );
                        Err(ChannelError::Timeout(timeout))
                    }
                }
            }
            _ = cancelled(&mut cancel) => {
                self.metrics.record_cancellation();
                tracing::info!(command = command.kind(), "Command cancelled while awaiting response");
                Err(ChannelError::Cancelled)
            }
            _ = raised(&mut disposed) => {
                tracing::debug!(command = command.kind(), "Channel disposed while awaiting response");
                Err(ChannelError::Disposed)
            }
        };

        // An abandoned write leaves a partial line on stdin that would prefix
        // the next command
        if io.torn_write {
            tracing::warn!(
                command = command.kind(),
                "Command write abandoned mid-line; disposing channel"
            );
            self.dispose();
        }

        drop(io);
        result
    }
}

async fn acquire<T>(
    mutex: &Mutex<T>,
    limit: Option<Duration>,
) -> Result<MutexGuard<'_, T>, ChannelError> {
    match limit {
        Some(limit) => tokio::time::timeout(limit, mutex.lock())
            .await
            .map_err(|_| ChannelError::Timeout(limit)),
        None => Ok(mutex.lock().await),
    }
}

async fn exchange<W, R>(
    io: &mut ChannelIo<W, R>,
    command: &Command,
    metrics: &Metrics,
) -> Result<Response, ChannelError>
where
    W: AsyncWrite + Unpin + Send,
    R: AsyncBufRead + Unpin + Send,
{
    let line = command.to_line()?;
    io.torn_write = true;
    io.writer.write_all(line.as_bytes()).await?;
    io.writer.flush().await?;
    io.torn_write = false;
    metrics.record_command_sent();
    tracing::debug!(command = command.kind(), "Command written to worker");

    while let Some(line) = next_line(io).await? {
        if let Some(response) = Response::parse_line(&line) {
            metrics.record_response(response.is_ok());
            tracing::debug!(
                command = command.kind(),
                status = ?response.status,
                message = %response.message,
                "Worker responded"
            );
            return Ok(response);
        }

        if !line.trim().is_empty() {
            metrics.record_discarded_line();
            tracing::warn!("Ignoring non-protocol worker output: {}", line);
        }
    }

    Err(ChannelError::NoResponse)
}

/// Read one stdout line, decoding lossily so stray binary output stays a
/// discardable line instead of an I/O error
async fn next_line<W, R>(io: &mut ChannelIo<W, R>) -> std::io::Result<Option<String>>
where
    R: AsyncBufRead + Unpin,
{
    let read = io.reader.read_until(b'\n', &mut io.pending).await?;
    if read == 0 && io.pending.is_empty() {
        return Ok(None);
    }

    let line = String::from_utf8_lossy(&io.pending)
        .trim_end_matches(['\n', '\r'])
        .to_string();
    io.pending.clear();
    Ok(Some(line))
}

/// Resolves once the cancel flag is raised; never resolves without a signal
pub(crate) async fn cancelled(cancel: &mut Option<watch::Receiver<bool>>) {
    match cancel {
        Some(rx) => raised(rx).await,
        None => std::future::pending().await,
    }
}

/// Whether the cancel flag is already raised
pub(crate) fn is_cancelled(cancel: &Option<watch::Receiver<bool>>) -> bool {
    cancel.as_ref().is_some_and(|rx| *rx.borrow())
}

async fn raised(flag: &mut watch::Receiver<bool>) {
    let closed = flag.wait_for(|raised| *raised).await.is_err();
    if closed {
        // Sender gone without raising: nothing will ever fire
        std::future::pending::<()>().await;
    }
}
