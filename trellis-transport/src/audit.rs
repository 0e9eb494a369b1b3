//! Audit trail of pings, sniffs and calls.

use chrono::{DateTime, Utc};
use std::fmt;
use url::Url;

/// Kind of an audited step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AuditEvent {
    /// Sniff performed on the first use of the pool.
    SniffOnStartup,
    /// Sniff performed after a node failed.
    SniffOnFail,
    /// Sniff performed because the cluster state is too old.
    SniffOnStaleCluster,
    /// A sniff succeeded and the pool was reseeded.
    SniffSuccess,
    /// A sniff against a node failed.
    SniffFailure,
    /// A ping succeeded.
    PingSuccess,
    /// A ping failed.
    PingFailure,
    /// A dead node became eligible again.
    Resurrection,
    /// Every node in the pool was dead.
    AllNodesDead,
    /// A call failed.
    BadResponse,
    /// A call succeeded.
    HealthyResponse,
    /// The overall retry timeout elapsed.
    MaxTimeoutReached,
    /// The retry budget was spent.
    MaxRetriesReached,
    /// The request could not be sent.
    BadRequest,
    /// No node matched the node predicate.
    NoNodesAttempted,
    /// The caller cancelled the request.
    CancellationRequested,
    /// Every eligible node was tried.
    FailedOverAllNodes,
}

impl fmt::Display for AuditEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// One entry of the audit trail.
#[derive(Debug, Clone, PartialEq)]
pub struct Audit {
    /// What happened.
    pub event: AuditEvent,
    /// The node involved, if any.
    pub node: Option<Url>,
    /// When the step started.
    pub started: DateTime<Utc>,
    /// When the step ended.
    pub ended: DateTime<Utc>,
    /// Request path, for calls.
    pub path: Option<String>,
    /// Error text, for failed steps.
    pub error: Option<String>,
}

impl Audit {
    /// Create an instantaneous audit entry.
    pub fn new(event: AuditEvent, node: Option<Url>, at: DateTime<Utc>) -> Self {
        Self {
            event,
            node,
            started: at,
            ended: at,
            path: None,
            error: None,
        }
    }

    /// Port of the audited node, if any.
    pub fn port(&self) -> Option<u16> {
        self.node.as_ref().and_then(|n| n.port_or_known_default())
    }

    /// Time spent in this step.
    pub fn took(&self) -> chrono::Duration {
        self.ended - self.started
    }
}

impl fmt::Display for Audit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.event)?;
        if let Some(node) = &self.node {
            write!(f, ": Node: {node}")?;
        }
        if let Some(path) = &self.path {
            write!(f, " Path: {path}")?;
        }
        write!(f, " Took: {}ms", self.took().num_milliseconds())?;
        if let Some(error) = &self.error {
            write!(f, " Error: {error}")?;
        }
        Ok(())
    }
}
