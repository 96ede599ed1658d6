//! Transport error taxonomy.
//!
//! Every failure surfaced through the public API is one of the kinds below.
//! The dispatcher treats `Cancelled` as non-retryable and everything else as
//! retryable until the per-request retry cap is reached.

use thiserror::Error;

use crate::identity::PeerAddress;

#[derive(Debug, Error)]
pub enum TransportError {
    /// Frame structure, version frame, or signature failed to parse or verify.
    #[error("invalid message: {0}")]
    InvalidMessage(String),

    /// The sender's app protocol version is incompatible with ours.
    #[error(
        "peer {peer} advertises app protocol version {actual}, expected {expected}"
    )]
    DifferentAppProtocolVersion {
        peer: PeerAddress,
        expected: u64,
        actual: u64,
    },

    /// A network operation did not complete within its deadline.
    #[error("operation timed out")]
    Timeout,

    /// The operation was cancelled cooperatively.
    #[error("operation cancelled")]
    Cancelled,

    /// An operation that requires a running transport was invoked before `run`.
    #[error("transport is not running")]
    NoSwarmContext,

    /// `start` or `run` was entered twice.
    #[error("transport is already running")]
    AlreadyRunning,

    /// A socket-level fault. On TURN paths this triggers client re-creation.
    #[error("socket error: {0}")]
    Socket(String),

    /// Anything that does not fit the kinds above.
    #[error("unexpected transport error: {0}")]
    Unexpected(String),
}

impl From<std::io::Error> for TransportError {
    fn from(err: std::io::Error) -> Self {
        TransportError::Socket(err.to_string())
    }
}

impl TransportError {
    /// Whether the dispatcher may re-enqueue a request that failed with this
    /// error. Cancellation aborts immediately; everything else retries until
    /// the cap.
    pub(crate) fn is_retryable(&self) -> bool {
        !matches!(self, TransportError::Cancelled)
    }
}
