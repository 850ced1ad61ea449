//! Error taxonomy for the transport and correlation layers.
//!
//! Errors fall into a handful of classes:
//!
//! - **Local I/O** (`Io`): bind, accept, connect and write failures.
//! - **Protocol** (`Protocol`): malformed or ambiguous envelopes.
//! - **Correlation** (`UntrackedResponse`, `Timeout`): surfaced through the
//!   same handler path as task failures when they concern a Response.
//! - **Misuse** (`DuplicateId`, `NotTracked`, `NotStarted`, ...): returned
//!   synchronously, with no state mutated.

use std::time::Duration;

use crate::protocol::ResponseError;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, AcommError>;

/// Errors returned by acomm operations.
#[derive(Debug, thiserror::Error)]
pub enum AcommError {
    /// Local socket or file I/O failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// An envelope could not be decoded or violates the wire contract.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// A Response arrived for an ID no longer (or never) tracked.
    #[error("untracked response: {0}")]
    UntrackedResponse(String),

    /// No Response arrived within the allotted time.
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// The Request ID is already being tracked.
    #[error("request already tracked: {0}")]
    DuplicateId(String),

    /// The Request ID is not being tracked.
    #[error("request not tracked: {0}")]
    NotTracked(String),

    /// A MultiRequest name was added twice.
    #[error("duplicate request name: {0}")]
    DuplicateName(String),

    /// The Tracker has not been started.
    #[error("tracker not started")]
    NotStarted,

    /// The component is draining and accepts no new work.
    #[error("shutdown in progress")]
    Stopping,

    /// A one-shot component was started again after being stopped.
    #[error("already stopped")]
    AlreadyStopped,

    /// A URL could not be parsed or has an unsupported scheme.
    #[error("invalid url {url}: {reason}")]
    InvalidUrl {
        /// The offending URL.
        url: String,
        /// Why it was rejected.
        reason: String,
    },

    /// The HTTP client failed.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// A remote hook answered with an error.
    #[error("remote error: {0}")]
    Remote(ResponseError),

    /// Invalid configuration value.
    #[error("config error: {0}")]
    Config(String),
}

impl AcommError {
    /// Shorthand for a [`AcommError::Protocol`] error.
    pub(crate) fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    /// Shorthand for a [`AcommError::InvalidUrl`] error.
    pub(crate) fn invalid_url(url: &str, reason: impl Into<String>) -> Self {
        Self::InvalidUrl {
            url: url.to_string(),
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_display() {
        let err = AcommError::Timeout(Duration::from_secs(2));
        assert_eq!(err.to_string(), "timed out after 2s");
    }

    #[test]
    fn test_display_includes_detail() {
        let err = AcommError::invalid_url("ftp://x", "unsupported scheme");
        assert_eq!(err.to_string(), "invalid url ftp://x: unsupported scheme");
    }
}
