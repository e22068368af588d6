//! Error values cached inside signals.

use std::sync::Arc;

/// Error value carried by a signal.
///
/// Signal values are always a `Result`, never a bare panic: a failing node
/// caches a `SignalError` and lets consumers decide whether to propagate it
/// (`map`, `join`) or contain it (`flat_map`, `lift_to_try`).
#[derive(Debug, Clone, thiserror::Error)]
pub enum SignalError {
    /// The signal has never been reconciled. Reading a signal before the
    /// first `reconcile` reaching it is a host programming error.
    #[error("signal has not been reconciled")]
    Unreconciled,

    /// User-supplied failure, e.g. an import-list parse error.
    #[error("{0}")]
    User(Arc<anyhow::Error>),
}

impl SignalError {
    /// Create a user error from a message.
    pub fn msg(msg: impl std::fmt::Display) -> Self {
        SignalError::User(Arc::new(anyhow::anyhow!("{msg}")))
    }

    /// Returns a reference to the inner user error, if any.
    pub fn user_error(&self) -> Option<&Arc<anyhow::Error>> {
        match self {
            SignalError::User(e) => Some(e),
            _ => None,
        }
    }
}

impl From<anyhow::Error> for SignalError {
    fn from(err: anyhow::Error) -> Self {
        SignalError::User(Arc::new(err))
    }
}

/// Equality on errors is identity for user errors: a recomputation that
/// produces a distinct error allocation counts as a change.
impl PartialEq for SignalError {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (SignalError::Unreconciled, SignalError::Unreconciled) => true,
            (SignalError::User(a), SignalError::User(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}
