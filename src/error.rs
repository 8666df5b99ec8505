//! Error types for webimage-dl
//!
//! The taxonomy mirrors how failures propagate to callers: transport-level
//! failures are retryable (a later request with `retry_failed` set will hit
//! the network again), cancellations are never treated as failures by the
//! blacklist, and decode errors are terminal for the payload in question.

use thiserror::Error;

/// Result type alias for webimage-dl operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for webimage-dl
#[derive(Debug, Error)]
pub enum Error {
    /// Transport failure reported by a custom [`Transport`](crate::transport::Transport)
    /// implementation
    #[error("transport error: {0}")]
    Transport(String),

    /// HTTP transport failure (connection, TLS, timeout, error status)
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    /// The download was cancelled before a result was produced
    #[error("download cancelled")]
    Cancelled,

    /// The downloaded payload is unusable (e.g. zero bytes)
    #[error("decode error: {0}")]
    Decode(String),

    /// The cache key failed previously and the request did not ask to retry
    #[error("blacklisted after previous failure: {0}")]
    Blacklisted(String),

    /// Conflicting or malformed request options
    #[error("invalid options: {0}")]
    InvalidOptions(String),

    /// The request URL could not be parsed
    #[error("invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),
}

impl Error {
    /// True for cancellation outcomes.
    ///
    /// Cancellations never populate the blacklist and are not surfaced as a
    /// failure to the subscriber that initiated the cancel.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Error::Cancelled)
    }

    /// True for transport-category failures (connection, TLS, timeout,
    /// error status). These are the failures that land a cache key on the
    /// blacklist.
    pub fn is_transport(&self) -> bool {
        matches!(self, Error::Transport(_) | Error::Network(_))
    }
}
