//! Cooperative cancellation for long-running geometry passes.
//!
//! A [`CancellationToken`] is cloned into the worker that runs a pass. The pass calls
//! [`CancellationToken::check`] between bounded units of work and returns early with
//! the component's `Cancelled` error; no partial result is ever handed back.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Marker returned by [`CancellationToken::check`]. Every cancellable component error
/// converts from it into its own `Cancelled` variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cancelled;

#[derive(Debug, Clone)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    #[must_use]
    pub fn new() -> Self {
        Self {
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Returns `Err(Cancelled)` once [`cancel`](Self::cancel) has been called on any clone.
    ///
    /// # Errors
    /// Returns [`Cancelled`] when cancellation was requested.
    pub fn check(&self) -> Result<(), Cancelled> {
        if self.is_cancelled() {
            Err(Cancelled)
        } else {
            Ok(())
        }
    }
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clones_share_state() {
        let token = CancellationToken::new();
        let worker_side = token.clone();
        assert!(worker_side.check().is_ok());

        token.cancel();
        assert!(worker_side.is_cancelled());
        assert_eq!(worker_side.check(), Err(Cancelled));
    }
}
