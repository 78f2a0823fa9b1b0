use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::timeout;

/// Default timeout for test waits.
///
/// Processing a handful of in-memory tasks takes milliseconds, anything close to this means the
/// awaited state is never reached.
pub const DEFAULT_NOTIFY_TIMEOUT: Duration = Duration::from_secs(30);

/// [`Arc<Notify>`] whose waits panic after a timeout instead of hanging the test.
#[derive(Clone)]
pub struct TimedNotify {
    notify: Arc<Notify>,
    timeout_duration: Duration,
}

impl TimedNotify {
    pub fn new(notify: Arc<Notify>) -> Self {
        Self::with_timeout(notify, DEFAULT_NOTIFY_TIMEOUT)
    }

    pub fn with_timeout(notify: Arc<Notify>, timeout_duration: Duration) -> Self {
        Self {
            notify,
            timeout_duration,
        }
    }

    /// Waits for a notification.
    ///
    /// # Panics
    ///
    /// Panics if the timeout elapses first.
    pub async fn notified(&self) {
        if timeout(self.timeout_duration, self.notify.notified())
            .await
            .is_err()
        {
            panic!(
                "Test notification timed out after {:?}, the awaited condition was never met",
                self.timeout_duration
            );
        }
    }

    pub fn inner(&self) -> &Arc<Notify> {
        &self.notify
    }
}

impl fmt::Debug for TimedNotify {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimedNotify")
            .field("timeout_duration", &self.timeout_duration)
            .finish()
    }
}

/// Awaits `future` for at most [`DEFAULT_NOTIFY_TIMEOUT`].
///
/// # Panics
///
/// Panics if the timeout elapses first, naming `what` was awaited.
pub async fn within_timeout<F>(what: &str, future: F) -> F::Output
where
    F: Future,
{
    match timeout(DEFAULT_NOTIFY_TIMEOUT, future).await {
        Ok(output) => output,
        Err(_) => panic!("Timed out after {DEFAULT_NOTIFY_TIMEOUT:?} waiting for {what}"),
    }
}
