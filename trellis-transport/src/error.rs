//! Transport error types.

use crate::audit::Audit;
use http::StatusCode;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Result type for transport operations.
pub type Result<T> = std::result::Result<T, TransportError>;

/// Errors surfaced by [`Transport`](crate::Transport).
#[derive(Debug, Error)]
pub enum TransportError {
    /// The request could not be served; carries the full audit trail.
    #[error(transparent)]
    Pipeline(Box<PipelineError>),

    /// The caller cancelled the request.
    #[error("request cancelled after {} audited attempts", .audit_trail.len())]
    Cancelled {
        /// Everything that happened before cancellation was observed.
        audit_trail: Vec<Audit>,
    },

    /// Invalid transport or pool configuration.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The underlying HTTP client could not be built.
    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),
}

impl TransportError {
    /// Check if this error signals caller cancellation.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }

    /// The pipeline failure, if this error came out of the request pipeline.
    pub fn pipeline(&self) -> Option<&PipelineError> {
        match self {
            Self::Pipeline(e) => Some(e),
            _ => None,
        }
    }

    /// The audit trail recorded before the error surfaced.
    pub fn audit_trail(&self) -> &[Audit] {
        match self {
            Self::Pipeline(e) => &e.audit_trail,
            Self::Cancelled { audit_trail } => audit_trail,
            _ => &[],
        }
    }
}

impl From<PipelineError> for TransportError {
    fn from(error: PipelineError) -> Self {
        Self::Pipeline(Box::new(error))
    }
}

/// Errors raised while building settings or pools.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    /// A pool was seeded without nodes.
    #[error("a connection pool needs at least one node")]
    EmptyNodes,

    /// Seed nodes disagree on the URI scheme.
    #[error("seed nodes mix http and https schemes")]
    MixedSchemes,

    /// A node URI could not be parsed.
    #[error("invalid node URI '{0}'")]
    InvalidUri(String),

    /// A configuration value could not be parsed.
    #[error("invalid value '{value}' for {key}")]
    InvalidValue {
        /// Configuration key.
        key: String,
        /// Offending value.
        value: String,
    },
}

/// Errors raised by a single [`Connection`](crate::Connection) round trip.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConnectionError {
    /// The request exceeded its timeout.
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    /// The node could not be reached.
    #[error("connection failed: {0}")]
    Connect(String),

    /// Any other I/O or protocol failure.
    #[error("transport failure: {0}")]
    Other(String),
}

impl ConnectionError {
    /// Check if this is a timeout error.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout(_))
    }

    /// Check if this is a connection error.
    pub fn is_connect(&self) -> bool {
        matches!(self, Self::Connect(_))
    }
}

/// Why the pipeline gave up on a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PipelineFailure {
    /// A node rejected the credentials.
    BadAuthentication,
    /// The call failed or returned an unsuccessful status.
    BadResponse,
    /// A ping failed.
    PingFailure,
    /// No node could answer the sniff request.
    SniffFailure,
    /// The startup sniff lock could not be taken in time.
    CouldNotStartSniffOnStartup,
    /// The overall retry timeout elapsed.
    MaxTimeoutReached,
    /// The retry budget was spent.
    MaxRetriesReached,
    /// Every eligible node was tried and failed.
    FailedOverAllNodes,
    /// No node was eligible for the call.
    NoNodesAttempted,
    /// The request could not be built.
    BadRequest,
    /// Anything the pipeline did not anticipate.
    Unexpected,
}

impl PipelineFailure {
    /// Whether the pipeline may fail over to another node.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::BadResponse | Self::PingFailure)
    }
}

impl fmt::Display for PipelineFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::BadAuthentication => "could not authenticate with the specified node",
            Self::BadResponse => "an error occurred trying to read the response from the specified node",
            Self::PingFailure => "failed to ping the specified node",
            Self::SniffFailure => "failed sniffing cluster state",
            Self::CouldNotStartSniffOnStartup => "failed to start the sniff on startup",
            Self::MaxTimeoutReached => "maximum timeout was reached",
            Self::MaxRetriesReached => "maximum number of retries reached",
            Self::FailedOverAllNodes => "tried all nodes and every one failed",
            Self::NoNodesAttempted => "no nodes were attempted, this can happen when a node predicate does not match any nodes",
            Self::BadRequest => "the request could not be sent",
            Self::Unexpected => "an unexpected error occurred",
        };
        f.write_str(text)
    }
}

/// A pipeline failure with everything needed to diagnose it.
#[derive(Debug, Clone, Error)]
#[error("{failure}{}", .source.as_ref().map(|e| format!(": {e}")).unwrap_or_default())]
pub struct PipelineError {
    /// The failure reason.
    pub failure: PipelineFailure,
    /// Ordered record of every ping, sniff and call made.
    pub audit_trail: Vec<Audit>,
    /// The last connection-level error, if any.
    pub source: Option<ConnectionError>,
    /// The last HTTP status received, if any.
    pub status: Option<StatusCode>,
}

impl PipelineError {
    pub(crate) fn new(failure: PipelineFailure) -> Self {
        Self {
            failure,
            audit_trail: Vec::new(),
            source: None,
            status: None,
        }
    }

    pub(crate) fn with_source(mut self, source: ConnectionError) -> Self {
        self.source = Some(source);
        self
    }

    pub(crate) fn with_status(mut self, status: StatusCode) -> Self {
        self.status = Some(status);
        self
    }

    /// Whether the pipeline may fail over to another node.
    pub fn is_recoverable(&self) -> bool {
        self.failure.is_recoverable()
    }

    /// Human readable rendering of the failure and its audit trail.
    pub fn debug_information(&self) -> String {
        let mut out = format!("# FailureReason: {:?} {}\n", self.failure, self);
        if let Some(status) = self.status {
            out.push_str(&format!("# Last status: {status}\n"));
        }
        out.push_str("# Audit trail of this API call:\n");
        for (i, audit) in self.audit_trail.iter().enumerate() {
            out.push_str(&format!(" - [{}] {}\n", i + 1, audit));
        }
        out
    }
}
