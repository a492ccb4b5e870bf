//! Result and error types for engine invariant violations.

/// The result type for operations that can only fail through an engine bug.
///
/// `Err` never describes a property of the host program: non-cacheable
/// values, cache misses, codec faults and store faults are all absorbed
/// where they occur. An `Err` means the engine's own bookkeeping is
/// inconsistent, and continuing could commit a wrong cached result.
pub type MemoResult<T> = Result<T, InternalError>;

/// An invariant violation inside the memoization engine.
///
/// These errors should never occur during normal operation. Callers that
/// receive one abort instead of risking a wrong-but-cached result.
#[derive(Debug, thiserror::Error)]
#[error("memoir invariant violation: {message}")]
pub struct InternalError {
    /// Description of the violated invariant.
    pub message: String,
}

impl InternalError {
    /// Creates a new internal error with the given message.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl From<String> for InternalError {
    fn from(message: String) -> Self {
        Self { message }
    }
}
