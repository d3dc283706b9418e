//! Error types for the prefetch engine.
//!
//! Most failures below the assembly layer are absorbed into segment state
//! rather than propagated; the variants here describe what happened at the
//! point of failure so callers can decide between retry, fallback, and
//! surfacing an "unavailable" state.

use thiserror::Error;

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for engine operations.
#[derive(Debug, Error)]
pub enum Error {
    /// No usable manifest exists for the source (absent, unparseable, or
    /// malformed). Expected, not exceptional: the resolver converts it to
    /// the single-segment fallback before it reaches callers.
    #[error("Manifest unavailable for {0}")]
    ManifestUnavailable(String),

    /// Transport-level failure (connect, timeout, non-success status).
    /// Retryable with priority demotion.
    #[error("Network failure: {0}")]
    Network(String),

    /// Downloaded byte count does not match the manifest's declared size.
    /// Treated exactly like a network failure.
    #[error("Size mismatch: expected {expected} bytes, got {actual}")]
    SizeMismatch { expected: u64, actual: u64 },

    /// The cache budget is fully occupied by plan-protected entries. Soft
    /// reject: the segment stays `Pending` and is retried on the next plan
    /// cycle.
    #[error("Cache full: {needed} bytes do not fit in budget of {budget}")]
    CacheFull { needed: u64, budget: u64 },

    /// The platform player cannot consume the media. Not retried; never
    /// constructed by the engine itself — embedders report player decode
    /// failures through it so the presentation layer can surface a single
    /// "media unavailable" state.
    #[error("Unsupported media: {0}")]
    DecodeUnsupported(String),

    /// The video id has never appeared in a feed.
    #[error("Unknown video: {0}")]
    UnknownVideo(String),

    /// Spool file I/O failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The engine has been shut down.
    #[error("Engine is shut down")]
    Shutdown,
}

impl Error {
    /// Create a network error.
    pub fn network(msg: impl Into<String>) -> Self {
        Self::Network(msg.into())
    }

    /// Whether a failed download should be re-enqueued at a demoted
    /// priority.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Network(_) | Error::SizeMismatch { .. })
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        Error::Network(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn network_and_size_mismatch_are_retryable() {
        assert!(Error::network("connection reset").is_retryable());
        assert!(Error::SizeMismatch {
            expected: 10,
            actual: 4
        }
        .is_retryable());
    }

    #[test]
    fn cache_full_is_not_retryable() {
        let e = Error::CacheFull {
            needed: 100,
            budget: 50,
        };
        assert!(!e.is_retryable());
    }

    #[test]
    fn display_includes_detail() {
        let e = Error::SizeMismatch {
            expected: 2048,
            actual: 100,
        };
        assert_eq!(e.to_string(), "Size mismatch: expected 2048 bytes, got 100");
    }
}
