//! Connection pools: the set of known nodes and how to pick among them.

mod single;
mod sniffing;
mod static_pool;

pub use single::SingleNodePool;
pub use sniffing::SniffingPool;
pub use static_pool::StaticPool;

use crate::audit::AuditEvent;
use crate::clock::{DateTimeProvider, SystemClock};
use crate::error::ConfigError;
use crate::node::Node;
use chrono::{DateTime, Utc};
use std::fmt;
use std::sync::Arc;

/// Immutable snapshot of a pool's nodes.
pub type NodeSnapshot = Arc<Vec<Arc<Node>>>;

/// A set of nodes plus the policy for choosing among them.
///
/// Implementations must be safe under concurrent `create_view` and `reseed`:
/// a view is always taken from one consistent snapshot.
pub trait ConnectionPool: Send + Sync + fmt::Debug {
    /// Current node snapshot.
    fn nodes(&self) -> NodeSnapshot;

    /// Candidate nodes for one request, in the order they should be tried.
    fn create_view(&self) -> NodeView;

    /// Replace the node set wholesale. A no-op for pools that cannot reseed.
    fn reseed(&self, nodes: Vec<Node>) -> Result<(), ConfigError> {
        let _ = nodes;
        Ok(())
    }

    /// Whether nodes are pinged before first use and after resurrection.
    fn supports_pinging(&self) -> bool;

    /// Whether the pool can be reseeded from a sniff.
    fn supports_reseeding(&self) -> bool;

    /// Whether the nodes are reached over TLS.
    fn uses_ssl(&self) -> bool;

    /// When the node set was last replaced.
    fn last_update(&self) -> DateTime<Utc>;

    /// Whether the startup sniff already ran.
    fn sniffed_on_startup(&self) -> bool;

    /// Record that the startup sniff ran.
    fn set_sniffed_on_startup(&self, sniffed: bool);

    /// Most retries a single request can make against this pool.
    fn max_retries(&self) -> usize {
        self.nodes().len().saturating_sub(1)
    }
}

/// Construction options shared by the multi-node pools.
#[derive(Debug, Clone)]
pub struct PoolOptions {
    /// Shuffle the seed order once at construction and on reseed.
    pub randomize: bool,
    /// Time source for dead-node deadlines and `last_update`.
    pub clock: Arc<dyn DateTimeProvider>,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            randomize: true,
            clock: Arc::new(SystemClock),
        }
    }
}

impl PoolOptions {
    /// Enable or disable seed shuffling.
    pub fn with_randomize(mut self, randomize: bool) -> Self {
        self.randomize = randomize;
        self
    }

    /// Set the time source.
    pub fn with_clock(mut self, clock: Arc<dyn DateTimeProvider>) -> Self {
        self.clock = clock;
        self
    }
}

/// One request's ordered walk over the pool.
///
/// Audit events (`AllNodesDead`, `Resurrection`) are emitted as nodes are
/// drawn, so nodes that are never reached leave no trace and are not flagged.
#[derive(Debug)]
pub struct NodeView {
    nodes: Vec<Arc<Node>>,
    cursor: usize,
    remaining: usize,
    all_dead: bool,
    revive: bool,
}

impl NodeView {
    /// A view yielding `nodes` starting at `start`, wrapping around once.
    pub fn new(nodes: Vec<Arc<Node>>, start: usize) -> Self {
        let remaining = nodes.len();
        let cursor = if remaining == 0 { 0 } else { start % remaining };
        Self {
            nodes,
            cursor,
            remaining,
            all_dead: false,
            revive: true,
        }
    }

    /// A view that ignores liveness: nodes are yielded as they are, without
    /// resurrection.
    pub fn fixed(nodes: Vec<Arc<Node>>) -> Self {
        Self {
            revive: false,
            ..Self::new(nodes, 0)
        }
    }

    /// A last-resort view over a single dead node.
    pub fn all_dead(node: Arc<Node>) -> Self {
        Self {
            nodes: vec![node],
            cursor: 0,
            remaining: 1,
            all_dead: true,
            revive: true,
        }
    }

    /// Whether this view only exists because every node was dead.
    pub fn is_all_dead(&self) -> bool {
        self.all_dead
    }

    /// Nodes not yet drawn.
    pub fn remaining(&self) -> usize {
        self.remaining
    }

    /// Draw the next node, reporting audit events through `audit`.
    pub fn next_audited(
        &mut self,
        audit: &mut dyn FnMut(AuditEvent, Option<&Node>),
    ) -> Option<Arc<Node>> {
        if self.remaining == 0 {
            return None;
        }
        if self.all_dead && self.remaining == self.nodes.len() {
            audit(AuditEvent::AllNodesDead, None);
        }

        let node = Arc::clone(&self.nodes[self.cursor]);
        self.cursor = (self.cursor + 1) % self.nodes.len();
        self.remaining -= 1;

        if self.revive && !node.is_alive() {
            node.resurrect();
            audit(AuditEvent::Resurrection, Some(&node));
        }
        Some(node)
    }
}

impl Iterator for NodeView {
    type Item = Arc<Node>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_audited(&mut |_, _| {})
    }
}

/// Validate seed nodes and report whether they use TLS.
pub(crate) fn validate_seed(nodes: &[Node]) -> Result<bool, ConfigError> {
    let first = nodes.first().ok_or(ConfigError::EmptyNodes)?;
    let uses_ssl = first.uri().scheme() == "https";
    if nodes
        .iter()
        .any(|n| (n.uri().scheme() == "https") != uses_ssl)
    {
        return Err(ConfigError::MixedSchemes);
    }
    Ok(uses_ssl)
}

/// The last-resort node when everything is dead: the one that recovers first.
pub(crate) fn earliest_recovery(nodes: &[Arc<Node>]) -> Option<Arc<Node>> {
    nodes.iter().min_by_key(|n| n.dead_until()).cloned()
}
