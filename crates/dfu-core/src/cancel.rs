//! Cooperative cancellation and the wait seam used by the protocol engine.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use crate::error::DfuError;

/// Cancellation token shared between the caller and a running operation.
///
/// Cloning yields a handle to the same flag.
#[derive(Debug, Clone, Default)]
pub struct Cancellable {
    flag: Arc<AtomicBool>,
}

impl Cancellable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Fail with [`DfuError::Cancelled`] once cancellation was requested.
    pub fn check(&self) -> Result<(), DfuError> {
        if self.is_cancelled() {
            Err(DfuError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Blocking delay between status polls and enumeration checks.
pub trait Sleeper: Send + Sync {
    fn sleep(&self, duration: Duration);
}

/// Real delays via [`std::thread::sleep`].
#[derive(Debug, Default, Clone, Copy)]
pub struct ThreadSleeper;

impl Sleeper for ThreadSleeper {
    fn sleep(&self, duration: Duration) {
        thread::sleep(duration);
    }
}

/// Records requested delays instead of sleeping.
#[derive(Debug, Default, Clone)]
pub struct RecordingSleeper {
    sleeps: Arc<Mutex<Vec<Duration>>>,
}

impl RecordingSleeper {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sleeps(&self) -> Vec<Duration> {
        self.sleeps
            .lock()
            .map(|s| s.clone())
            .unwrap_or_default()
    }

    pub fn total(&self) -> Duration {
        self.sleeps().iter().sum()
    }
}

impl Sleeper for RecordingSleeper {
    fn sleep(&self, duration: Duration) {
        if let Ok(mut sleeps) = self.sleeps.lock() {
            sleeps.push(duration);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancel_shared_between_clones() {
        let token = Cancellable::new();
        let handle = token.clone();
        assert!(token.check().is_ok());

        handle.cancel();
        assert!(token.is_cancelled());
        assert!(matches!(token.check(), Err(DfuError::Cancelled)));
    }

    #[test]
    fn test_recording_sleeper() {
        let sleeper = RecordingSleeper::new();
        let shared = sleeper.clone();
        sleeper.sleep(Duration::from_millis(10));
        sleeper.sleep(Duration::from_millis(15));
        assert_eq!(shared.sleeps().len(), 2);
        assert_eq!(shared.total(), Duration::from_millis(25));
    }
}
