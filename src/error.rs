//! Error types for the tunnel.

use thiserror::Error;

/// Result type alias for tunnel operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while tunneling streams over relay events.
#[derive(Error, Debug)]
pub enum Error {
    /// Decryption or signature verification failed
    #[error("bad crypto: {0}")]
    BadCrypto(String),

    /// A frame or envelope could not be parsed
    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    /// The destination string could not be resolved to a peer key
    #[error("destination resolution failed: {0}")]
    ResolutionFailed(String),

    /// The exit could not reach its backend, or the entry its peer
    #[error("dial failed: {0}")]
    DialFailed(String),

    /// No relay accepted a published event within the deadline
    #[error("transport unavailable: no relay accepted the event")]
    TransportUnavailable,

    /// A relay connection hiccuped; retried internally, never surfaced
    #[error("relay transient failure: {0}")]
    RelayTransient(String),

    /// DATA arrived for a session this process does not know
    #[error("unknown session {0}")]
    SessionUnknown(String),

    /// An operation exceeded its deadline
    #[error("timed out after {0}ms")]
    Timeout(u64),

    /// Unrecoverable startup failure (certificate material, key parsing)
    #[error("fatal: {0}")]
    Fatal(String),

    /// Key material could not be parsed or derived
    #[error("key error: {0}")]
    Key(String),

    /// Configuration is missing or inconsistent
    #[error("configuration error: {0}")]
    Config(String),

    /// Network I/O error
    #[error("network error: {0}")]
    Network(#[from] std::io::Error),
}

impl Error {
    /// Create a new crypto error.
    pub fn crypto(msg: impl Into<String>) -> Self {
        Error::BadCrypto(msg.into())
    }

    /// Create a new malformed-frame error.
    pub fn malformed(msg: impl Into<String>) -> Self {
        Error::MalformedFrame(msg.into())
    }

    /// Create a new resolution error.
    pub fn resolution(msg: impl Into<String>) -> Self {
        Error::ResolutionFailed(msg.into())
    }

    /// Create a new dial error.
    pub fn dial(msg: impl Into<String>) -> Self {
        Error::DialFailed(msg.into())
    }

    /// Create a new configuration error.
    pub fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }

    /// Create a new fatal error.
    pub fn fatal(msg: impl Into<String>) -> Self {
        Error::Fatal(msg.into())
    }

    /// Whether the event that produced this error should simply be dropped.
    ///
    /// The relay network is lossy and adversarial; decrypt failures,
    /// malformed frames and unknown sessions never propagate past the
    /// handler that saw them.
    pub fn is_droppable(&self) -> bool {
        matches!(
            self,
            Error::BadCrypto(_) | Error::MalformedFrame(_) | Error::SessionUnknown(_)
        )
    }

    /// Whether this error aborts the process.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Fatal(_))
    }
}
