use log::{info, warn};
use tokio::task::{JoinError, JoinHandle};
use tokio::time::{self, Instant};

use std::time::Duration;

use super::{CompletionReason, RecordingError, StopCause, StopHandle};

pub(crate) type CaptureResult = Result<Result<CompletionReason, RecordingError>, JoinError>;

/**
 * Waits out the recording duration and then tells the capture to stop.
 * Gives up early, without issuing anything, when something else has
 * already requested a stop.
 */
pub(crate) struct TimerController {
    /** None when `started + duration` is past what an `Instant` can hold. */
    deadline: Option<Instant>,
    stop: StopHandle,
}

impl TimerController {
    pub(crate) fn new(started: Instant, duration: Duration, stop: StopHandle) -> Self {
        TimerController {
            deadline: started.checked_add(duration),
            stop,
        }
    }

    /**
     * Resolves with the cause of the stop, whoever issued it.
     */
    pub(crate) async fn run(self) -> StopCause {
        let mut signal = self.stop.signal();
        let elapsed = async {
            match self.deadline {
                Some(deadline) => time::sleep_until(deadline).await,
                None => std::future::pending::<()>().await,
            }
        };
        tokio::select! {
            _ = elapsed => {
                if self.stop.request(StopCause::Elapsed) {
                    info!("Recording time is up, stopping capture");
                }
            }
            _ = signal.wait() => {}
        }
        self.stop.cause().unwrap_or(StopCause::Elapsed)
    }
}

/**
 * Gives a stopped capture `grace` to flush and close its file, then aborts
 * the task. Either way the task is awaited, so its file handle and socket
 * are gone when this returns.
 */
pub(crate) async fn await_capture(
    capture: &mut JoinHandle<Result<CompletionReason, RecordingError>>,
    grace: Duration,
) -> CaptureResult {
    match time::timeout(grace, &mut *capture).await {
        Ok(joined) => joined,
        Err(_) => {
            warn!("Capture did not stop within {:?}, aborting it", grace);
            capture.abort();
            capture.await
        }
    }
}
