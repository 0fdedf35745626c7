//! Error types for scheduling-core operations.

/// Failures raised by targets, streams and the token table.
///
/// Every variant is local to one request; nothing in the core retries.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CoreError {
    /// The target was torn down with `Target::die`.
    #[error("target is dead: {0}")]
    TargetDead(String),

    /// Activation found an empty priority queue.
    #[error("no streams available in target: {0}")]
    NoStreamsAvailable(String),

    /// The token does not resolve to a live session (never issued,
    /// stopped, or expired).
    #[error("no active lease for token")]
    NoActiveLease,

    /// The stream id is already queued or leased in this target.
    #[error("stream already present in target: {0}")]
    DuplicateStream(String),

    /// The stream id is unknown to the target.
    #[error("stream not found: {0}")]
    StreamNotFound(String),

    /// The stream has been disabled after repeated failures.
    #[error("stream is disabled: {0}")]
    StreamDisabled(String),
}
