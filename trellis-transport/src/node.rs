//! A single cluster endpoint and its health state.

use crate::error::ConfigError;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use url::Url;

/// Role flags advertised by a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeRoles {
    /// Node stores data.
    pub holds_data: bool,
    /// Node may be elected cluster manager.
    pub cluster_manager_eligible: bool,
    /// Node runs ingest pipelines.
    pub ingest_enabled: bool,
    /// Node serves HTTP.
    pub http_enabled: bool,
}

impl Default for NodeRoles {
    fn default() -> Self {
        Self {
            holds_data: true,
            cluster_manager_eligible: true,
            ingest_enabled: true,
            http_enabled: true,
        }
    }
}

/// Mutable health state of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeState {
    /// Node is considered alive.
    pub is_alive: bool,
    /// Node must be pinged before its next use.
    pub is_resurrected: bool,
    /// Failures since the node was last alive.
    pub failed_attempts: u32,
    /// Node must not be tried before this instant.
    pub dead_until: Option<DateTime<Utc>>,
}

impl Default for NodeState {
    fn default() -> Self {
        Self {
            is_alive: true,
            is_resurrected: true,
            failed_attempts: 0,
            dead_until: None,
        }
    }
}

/// A cluster endpoint. Nodes compare equal when their URIs do.
pub struct Node {
    uri: Url,
    roles: NodeRoles,
    id: Option<String>,
    name: Option<String>,
    settings: HashMap<String, String>,
    state: Mutex<NodeState>,
}

impl Node {
    /// Create a node. A new node is alive and pinged before first use.
    pub fn new(uri: Url) -> Self {
        Self {
            uri: normalize(uri),
            roles: NodeRoles::default(),
            id: None,
            name: None,
            settings: HashMap::new(),
            state: Mutex::new(NodeState::default()),
        }
    }

    /// Parse a node from a URI string.
    pub fn parse(uri: &str) -> Result<Self, ConfigError> {
        Url::parse(uri)
            .map(Self::new)
            .map_err(|_| ConfigError::InvalidUri(uri.to_string()))
    }

    /// Set role flags.
    pub fn with_roles(mut self, roles: NodeRoles) -> Self {
        self.roles = roles;
        self
    }

    /// Set the node id.
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Set the node name.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Set node settings.
    pub fn with_settings(mut self, settings: HashMap<String, String>) -> Self {
        self.settings = settings;
        self
    }

    /// Node URI, always ending in `/`.
    pub fn uri(&self) -> &Url {
        &self.uri
    }

    /// Role flags.
    pub fn roles(&self) -> NodeRoles {
        self.roles
    }

    /// Node id, when known from a sniff.
    pub fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    /// Node name, when known from a sniff.
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Node settings, when known from a sniff.
    pub fn settings(&self) -> &HashMap<String, String> {
        &self.settings
    }

    /// A node that only coordinates cluster state.
    pub fn is_cluster_manager_only(&self) -> bool {
        self.roles.cluster_manager_eligible && !self.roles.holds_data && !self.roles.ingest_enabled
    }

    /// Snapshot of the health state.
    pub fn state(&self) -> NodeState {
        *self.state.lock()
    }

    /// Node is considered alive.
    pub fn is_alive(&self) -> bool {
        self.state.lock().is_alive
    }

    /// Node must be pinged before its next use.
    pub fn is_resurrected(&self) -> bool {
        self.state.lock().is_resurrected
    }

    /// Failures since the node was last alive.
    pub fn failed_attempts(&self) -> u32 {
        self.state.lock().failed_attempts
    }

    /// Deadline before which the node must not be tried.
    pub fn dead_until(&self) -> Option<DateTime<Utc>> {
        self.state.lock().dead_until
    }

    /// Whether the node may be tried at `now`.
    pub fn is_available(&self, now: DateTime<Utc>) -> bool {
        let state = self.state.lock();
        state.is_alive || state.dead_until.is_none_or(|until| until <= now)
    }

    /// Take the node out of rotation until `dead_until`.
    pub fn mark_dead(&self, dead_until: DateTime<Utc>) {
        let mut state = self.state.lock();
        state.failed_attempts = state.failed_attempts.saturating_add(1);
        state.is_alive = false;
        state.is_resurrected = false;
        state.dead_until = Some(dead_until);
    }

    /// Put the node back in rotation.
    pub fn mark_alive(&self) {
        let mut state = self.state.lock();
        state.failed_attempts = 0;
        state.is_alive = true;
        state.is_resurrected = false;
        state.dead_until = None;
    }

    /// Flag the node for a ping before its next use.
    pub fn resurrect(&self) {
        self.state.lock().is_resurrected = true;
    }
}

fn normalize(mut uri: Url) -> Url {
    if !uri.path().ends_with('/') {
        let path = format!("{}/", uri.path());
        uri.set_path(&path);
    }
    uri
}

impl Clone for Node {
    fn clone(&self) -> Self {
        Self {
            uri: self.uri.clone(),
            roles: self.roles,
            id: self.id.clone(),
            name: self.name.clone(),
            settings: self.settings.clone(),
            state: Mutex::new(self.state()),
        }
    }
}

impl PartialEq for Node {
    fn eq(&self, other: &Self) -> bool {
        self.uri == other.uri
    }
}

impl Eq for Node {}

impl Hash for Node {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.uri.hash(state);
    }
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("uri", &self.uri.as_str())
            .field("name", &self.name)
            .field("state", &self.state())
            .finish()
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.uri.as_str())
    }
}
