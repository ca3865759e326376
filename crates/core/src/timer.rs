use std::time::Duration;
use tokio::time::Instant;

/// A cancellable one-shot timer.
///
/// The timer is just an optional expiry instant; the owning event loop waits on
/// [`sleep_until`] with the current value. Re-arming replaces the previous
/// expiry, so a resource never has two live timers.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Deadline {
    at: Option<Instant>,
}

impl Deadline {
    pub fn arm(&mut self, after: Duration) {
        self.at = Some(Instant::now() + after);
    }

    pub fn cancel(&mut self) {
        self.at = None;
    }

    pub fn at(&self) -> Option<Instant> {
        self.at
    }

    /// Disarms the timer if it has expired, reporting whether it had.
    pub fn take_expired(&mut self) -> bool {
        match self.at {
            Some(at) if at <= Instant::now() => {
                self.at = None;
                true
            }
            _ => false,
        }
    }
}

/// Sleeps until `deadline`, or forever when there is none.
pub async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}
