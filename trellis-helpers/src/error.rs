//! Error types for the scroll and bulk helpers.

use thiserror::Error;
use trellis_transport::TransportError;

/// Result type for helper operations.
pub type Result<T> = std::result::Result<T, HelperError>;

/// Errors emitted by [`ScrollAll`](crate::ScrollAll) and
/// [`BulkAll`](crate::BulkAll) sessions.
#[derive(Debug, Error)]
pub enum HelperError {
    /// The session was cancelled by the caller.
    #[error("helper session cancelled")]
    Cancelled,

    /// Cancelled while waiting for the consumer to release back-pressure.
    #[error("cancelled while waiting on back-pressure")]
    BackPressureCancelled,

    /// A slice received a page it could not use.
    #[error("scroll slice {slice} failed on page {page}: {reason}")]
    ScrollFailed {
        /// Slice id.
        slice: usize,
        /// Page the slice was fetching.
        page: usize,
        /// What went wrong.
        reason: String,
    },

    /// A bulk page could not be indexed.
    #[error("bulk page {page} failed after {retries} retries: {reason}")]
    BulkFailed {
        /// Page number.
        page: usize,
        /// Back-off retries spent on the page.
        retries: usize,
        /// What went wrong.
        reason: String,
    },

    /// Invalid helper request.
    #[error("invalid helper request: {0}")]
    InvalidRequest(String),

    /// Transport error.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl HelperError {
    /// Check if the session stopped because of cancellation rather than a
    /// failure.
    pub fn is_cancelled(&self) -> bool {
        match self {
            Self::Cancelled | Self::BackPressureCancelled => true,
            Self::Transport(e) => e.is_cancelled(),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancellation_classification() {
        assert!(HelperError::Cancelled.is_cancelled());
        assert!(HelperError::BackPressureCancelled.is_cancelled());
        assert!(
            HelperError::Transport(TransportError::Cancelled {
                audit_trail: Vec::new()
            })
            .is_cancelled()
        );
        assert!(
            !HelperError::BulkFailed {
                page: 1,
                retries: 2,
                reason: "mapping".to_string()
            }
            .is_cancelled()
        );
    }

    #[test]
    fn test_display() {
        let error = HelperError::ScrollFailed {
            slice: 1,
            page: 3,
            reason: "bad body".to_string(),
        };
        assert_eq!(error.to_string(), "scroll slice 1 failed on page 3: bad body");
    }
}
