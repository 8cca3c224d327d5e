use log::{debug, info};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use url::Url;

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

mod consumer;
mod signal;
mod timer;

#[cfg(test)]
mod test_server;

use self::consumer::StreamConsumer;
use self::timer::{CaptureResult, TimerController};

pub const DEFAULT_CHUNK_SIZE: usize = 1024;

/**
 * Defines the categories of errors that may abort a recording session.
 * Failing to reach the stream at all is not one of them: that is reported
 * as `CompletionReason::ConnectionFailed` on the outcome.
 */
#[derive(Debug, Error)]
pub enum RecordingError {
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid stream URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    #[error("recording duration must be greater than zero and representable as a deadline")]
    InvalidDuration,

    #[error("chunk size must be at least one byte")]
    InvalidChunkSize,
}

/**
 * Why a session ended.
 */
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletionReason {
    Completed,
    Interrupted,
    ConnectionFailed,
    StreamEnded,
    /** The connection broke in the middle of the recording. */
    StreamFailed,
}

impl CompletionReason {
    /**
     * Whether the process should exit cleanly. Bytes captured before a
     * `StreamFailed` are kept on disk all the same.
     */
    pub fn is_success(&self) -> bool {
        !matches!(self, Self::ConnectionFailed | Self::StreamFailed)
    }
}

/** Who asked the capture to stop. The first cause recorded wins. */
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StopCause {
    Elapsed,
    Interrupted,
}

impl From<StopCause> for CompletionReason {
    fn from(cause: StopCause) -> Self {
        match cause {
            StopCause::Elapsed => CompletionReason::Completed,
            StopCause::Interrupted => CompletionReason::Interrupted,
        }
    }
}

/**
 * Session state machine.
 *
 * ```text
 * Idle → Connecting → Recording → Stopping → Terminated(reason)
 *            ↓            ↓
 *   Terminated(ConnectionFailed)  Terminated(StreamEnded | StreamFailed)
 * ```
 *
 * `Failed` is entered from any state when the session returns an error.
 */
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Connecting,
    Recording,
    Stopping,
    Terminated(CompletionReason),
    Failed,
}

impl SessionState {
    pub fn is_terminated(&self) -> bool {
        matches!(self, Self::Terminated(_) | Self::Failed)
    }
}

/**
 * What the caller gets back once the capture has stopped and the
 * destination file has been closed.
 */
#[derive(Debug, Clone, Serialize)]
pub struct RecordingOutcome {
    pub file_path: PathBuf,
    pub bytes_written: u64,
    pub reason: CompletionReason,
    pub elapsed_secs: f64,
}

/**
 * A stream URL, the file to write it to, and how long to record.
 */
#[derive(Debug, Clone)]
pub struct RecordingRequest {
    url: Url,
    destination: PathBuf,
    duration: Duration,
}

impl RecordingRequest {
    pub fn new(
        url: &str,
        destination: impl Into<PathBuf>,
        minutes: u64,
    ) -> Result<Self, RecordingError> {
        let seconds = minutes
            .checked_mul(60)
            .ok_or(RecordingError::InvalidDuration)?;
        Self::with_duration(url, destination, Duration::from_secs(seconds))
    }

    pub fn with_duration(
        url: &str,
        destination: impl Into<PathBuf>,
        duration: Duration,
    ) -> Result<Self, RecordingError> {
        // The timer needs `now + duration` to exist as an instant.
        if duration.is_zero() || Instant::now().checked_add(duration).is_none() {
            return Err(RecordingError::InvalidDuration);
        }
        Ok(RecordingRequest {
            url: Url::parse(url)?,
            destination: destination.into(),
            duration,
        })
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn destination(&self) -> &Path {
        &self.destination
    }

    pub fn duration(&self) -> Duration {
        self.duration
    }
}

/**
 * Tunables for a session. The defaults are what the command line uses.
 */
#[derive(Debug, Clone)]
pub struct RecorderOptions {
    /** Upper bound for a single write to the destination file. */
    pub chunk_size: usize,
    pub connect_timeout: Duration,
    /** How long a stopped capture may take to wind down before it is aborted. */
    pub stop_grace: Duration,
    /** Turn Ctrl-C (and SIGTERM on Unix) into an interrupt of this session. */
    pub handle_signals: bool,
}

impl RecorderOptions {
    pub fn validate(&self) -> Result<(), RecordingError> {
        if self.chunk_size == 0 {
            return Err(RecordingError::InvalidChunkSize);
        }
        Ok(())
    }
}

impl Default for RecorderOptions {
    fn default() -> Self {
        RecorderOptions {
            chunk_size: DEFAULT_CHUNK_SIZE,
            connect_timeout: Duration::from_secs(30),
            stop_grace: Duration::from_secs(5),
            handle_signals: true,
        }
    }
}

/**
 * Cloneable handle used to stop a running session from the outside.
 */
#[derive(Clone)]
pub struct StopHandle {
    sender: Arc<watch::Sender<Option<StopCause>>>,
}

impl StopHandle {
    fn new() -> Self {
        let (sender, _) = watch::channel(None);
        StopHandle {
            sender: Arc::new(sender),
        }
    }

    /**
     * Requests a graceful stop that is reported as `Interrupted`. Returns
     * false if the session was already stopping.
     */
    pub fn interrupt(&self) -> bool {
        self.request(StopCause::Interrupted)
    }

    pub(crate) fn request(&self, cause: StopCause) -> bool {
        self.sender.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = Some(cause);
            true
        })
    }

    pub(crate) fn cause(&self) -> Option<StopCause> {
        *self.sender.borrow()
    }

    pub(crate) fn signal(&self) -> StopSignal {
        StopSignal {
            receiver: self.sender.subscribe(),
        }
    }
}

/** Receiving side of a `StopHandle`. */
pub(crate) struct StopSignal {
    receiver: watch::Receiver<Option<StopCause>>,
}

impl StopSignal {
    /** Resolves once a stop has been requested; immediately if one already was. */
    pub(crate) async fn wait(&mut self) -> StopCause {
        loop {
            if let Some(cause) = *self.receiver.borrow_and_update() {
                return cause;
            }
            if self.receiver.changed().await.is_err() {
                // Every handle is gone, nobody can stop us any more.
                std::future::pending::<()>().await;
            }
        }
    }
}

/**
 * Shared view of the session state, written by the session and the consumer.
 * Watchers only see the latest state, so every state entered is also kept
 * in `visited`.
 */
#[derive(Clone)]
pub(crate) struct StateCell {
    sender: Arc<watch::Sender<SessionState>>,
    visited: Arc<Mutex<Vec<SessionState>>>,
}

impl StateCell {
    fn new() -> Self {
        let (sender, _) = watch::channel(SessionState::Idle);
        StateCell {
            sender: Arc::new(sender),
            visited: Arc::new(Mutex::new(vec![SessionState::Idle])),
        }
    }

    /** Moves to `next` unless the session has already terminated. */
    pub(crate) fn transition(&self, next: SessionState) {
        self.sender.send_if_modified(|current| {
            if current.is_terminated() || *current == next {
                return false;
            }
            self.enter(current, next);
            true
        });
    }

    /** Moves to `next` only when currently in `from`. */
    pub(crate) fn advance(&self, from: SessionState, next: SessionState) {
        self.sender.send_if_modified(|current| {
            if *current != from {
                return false;
            }
            self.enter(current, next);
            true
        });
    }

    fn enter(&self, current: &mut SessionState, next: SessionState) {
        debug!("Session state {:?} -> {:?}", current, next);
        *current = next;
        if let Ok(mut visited) = self.visited.lock() {
            visited.push(next);
        }
    }

    fn get(&self) -> SessionState {
        *self.sender.borrow()
    }

    fn history(&self) -> Vec<SessionState> {
        self.visited
            .lock()
            .map(|visited| visited.clone())
            .unwrap_or_default()
    }

    fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.sender.subscribe()
    }
}

/**
 * ----------------------------------------------------------------------------
 * One timed capture of a live stream into a file. The capture runs on its
 * own task while a timer waits out the requested duration; whichever of the
 * timer, an interrupt or the stream itself finishes first ends the session.
 */
pub struct RecordingSession {
    request: RecordingRequest,
    options: RecorderOptions,
    stop: StopHandle,
    state: StateCell,
}

impl RecordingSession {
    pub fn new(request: RecordingRequest) -> Self {
        RecordingSession {
            request,
            options: RecorderOptions::default(),
            stop: StopHandle::new(),
            state: StateCell::new(),
        }
    }

    pub fn with_options(
        request: RecordingRequest,
        options: RecorderOptions,
    ) -> Result<Self, RecordingError> {
        options.validate()?;
        Ok(RecordingSession {
            options,
            ..Self::new(request)
        })
    }

    pub fn request(&self) -> &RecordingRequest {
        &self.request
    }

    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    pub fn state(&self) -> SessionState {
        self.state.get()
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    /** Every state entered so far, starting with `Idle`. */
    pub fn history(&self) -> Vec<SessionState> {
        self.state.history()
    }

    /**
     * Runs the session to the end. Returns only after the capture task has
     * finished (or been aborted) so the file and the socket are released.
     */
    pub async fn run(self) -> Result<RecordingOutcome, RecordingError> {
        let started = Instant::now();
        let bytes_written = Arc::new(AtomicU64::new(0));
        let consumer = StreamConsumer::new(
            &self.request,
            &self.options,
            Arc::clone(&bytes_written),
            self.state.clone(),
        )?;

        info!(
            "Recording {} into {} for {:?}",
            self.request.url,
            self.request.destination.display(),
            self.request.duration
        );
        self.state.transition(SessionState::Connecting);
        let capture = tokio::spawn(consumer.run(self.stop.signal()));
        self.supervise(started, capture, &bytes_written).await
    }

    /**
     * Waits for the capture task to end, stopping it when the timer or an
     * interrupt says so, and turns its result into the session outcome.
     */
    async fn supervise(
        &self,
        started: Instant,
        mut capture: JoinHandle<Result<CompletionReason, RecordingError>>,
        bytes_written: &AtomicU64,
    ) -> Result<RecordingOutcome, RecordingError> {
        let interrupts = if self.options.handle_signals {
            Some(tokio::spawn(signal::forward_interrupts(self.stop.clone())))
        } else {
            None
        };

        let timer = TimerController::new(started, self.request.duration, self.stop.clone());
        let joined: CaptureResult = tokio::select! {
            joined = &mut capture => joined,
            cause = timer.run() => {
                debug!("Stop requested: {:?}", cause);
                self.state.transition(SessionState::Stopping);
                timer::await_capture(&mut capture, self.options.stop_grace).await
            }
        };

        if let Some(listener) = interrupts {
            listener.abort();
        }

        // The capture may notice a stop before the timer branch does.
        if self.stop.cause().is_some() {
            self.state.transition(SessionState::Stopping);
        }

        let reason = match joined {
            Ok(Ok(reason)) => reason,
            Ok(Err(e)) => {
                self.state.transition(SessionState::Failed);
                debug!("Session states: {:?}", self.state.history());
                return Err(e);
            }
            Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
            // Aborted after the grace period: report the cause that stopped it.
            Err(_) => self
                .stop
                .cause()
                .map(CompletionReason::from)
                .unwrap_or(CompletionReason::Interrupted),
        };
        self.state.transition(SessionState::Terminated(reason));
        debug!("Session states: {:?}", self.state.history());

        let outcome = RecordingOutcome {
            file_path: self.request.destination.clone(),
            bytes_written: bytes_written.load(Ordering::SeqCst),
            reason,
            elapsed_secs: started.elapsed().as_secs_f64(),
        };
        info!(
            "Session finished: {:?}, {} bytes in {:.1}s",
            outcome.reason, outcome.bytes_written, outcome.elapsed_secs
        );
        Ok(outcome)
    }
}
