// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Error taxonomy shared by every primitive.

use thiserror::Error;

/// Failure surfaced by a coordination primitive to its immediate caller.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SyncError {
    /// Nonsensical size passed to a constructor.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    /// Operation is meaningless in the primitive's current state.
    #[error("illegal state: {0}")]
    IllegalState(String),
    /// The barrier generation this caller belonged to did not complete.
    #[error("barrier is broken")]
    BrokenBarrier,
    /// The barrier action panicked on the triggering thread.
    #[error("barrier action failed: {0}")]
    BarrierActionFailed(String),
    /// A cancellation token fired while the caller was parked.
    #[error("wait interrupted")]
    Interrupted,
    /// The caller's deadline elapsed before it was released.
    #[error("wait timed out")]
    TimedOut,
}

impl SyncError {
    pub(crate) fn invalid(msg: impl Into<String>) -> Self {
        SyncError::InvalidArgument(msg.into())
    }

    pub(crate) fn illegal(msg: impl Into<String>) -> Self {
        SyncError::IllegalState(msg.into())
    }

    /// True for the outcomes that only concern the caller's own wait.
    pub fn is_wait_abort(&self) -> bool {
        matches!(self, SyncError::Interrupted | SyncError::TimedOut)
    }
}

pub type Result<T> = std::result::Result<T, SyncError>;

/// Best-effort message from a caught panic payload.
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
