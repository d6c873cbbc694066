//! Stop signal shared between a transport and its watcher task.
//!
//! The watcher never blocks indefinitely: it polls its socket with a bounded
//! timeout and checks this token between polls, so a `close()` is observed
//! within one poll interval.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// A cooperative cancellation token.
///
/// Clones share state; cancelling any clone is observed by all of them.
/// Cancellation is one-way.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Return an error if cancellation has been requested.
    pub fn check(&self) -> Result<(), CancelledError> {
        if self.is_cancelled() {
            Err(CancelledError)
        } else {
            Ok(())
        }
    }
}

/// Error returned when an operation observes a cancelled token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CancelledError;

impl std::fmt::Display for CancelledError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "transport is closed")
    }
}

impl std::error::Error for CancelledError {}

impl From<CancelledError> for crate::error::RpcError {
    fn from(err: CancelledError) -> Self {
        crate::error::RpcError::transport(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RpcError;

    #[test]
    fn test_new_token_not_cancelled() {
        let token = CancellationToken::new();
        assert!(!token.is_cancelled());
        assert!(token.check().is_ok());
    }

    #[test]
    fn test_clone_shares_state() {
        let token = CancellationToken::new();
        let watcher_side = token.clone();

        token.cancel();

        assert!(watcher_side.is_cancelled());
        assert_eq!(watcher_side.check(), Err(CancelledError));
    }

    #[test]
    fn test_cancelled_error_maps_to_transport_error() {
        let err: RpcError = CancelledError.into();
        assert!(matches!(err, RpcError::Transport { .. }));
    }
}
