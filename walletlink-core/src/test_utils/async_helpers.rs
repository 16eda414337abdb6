//! Async test helpers
//!
//! Channel receive helpers with timeouts, used by the relay and engine tests.

use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tokio::time::{timeout, Duration};

/// Default timeout for end-to-end steps (5 seconds)
pub const DEFAULT_TEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Short timeout for things that should fail fast (100ms)
pub const SHORT_TEST_TIMEOUT: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum RecvTimeoutError {
    #[error("nothing received before the deadline")]
    Timeout,
    #[error("sender side dropped")]
    Closed,
}

pub async fn recv_timeout<T>(
    rx: &mut mpsc::Receiver<T>,
    duration: Duration,
) -> Result<T, RecvTimeoutError> {
    timeout(duration, rx.recv())
        .await
        .map_err(|_| RecvTimeoutError::Timeout)?
        .ok_or(RecvTimeoutError::Closed)
}

/// Receive from a broadcast channel until `pick` returns `Some`, skipping
/// everything else (lagged gaps included)
pub async fn recv_matching<T, R, F>(
    rx: &mut broadcast::Receiver<T>,
    duration: Duration,
    mut pick: F,
) -> Result<R, RecvTimeoutError>
where
    T: Clone,
    F: FnMut(T) -> Option<R>,
{
    let search = async {
        loop {
            match rx.recv().await {
                Ok(value) => {
                    if let Some(found) = pick(value) {
                        return Ok(found);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return Err(RecvTimeoutError::Closed),
            }
        }
    };
    timeout(duration, search)
        .await
        .map_err(|_| RecvTimeoutError::Timeout)?
}
