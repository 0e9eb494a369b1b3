//! Single-node pool: one fixed endpoint, no liveness tracking.

use super::{ConnectionPool, NodeSnapshot, NodeView};
use crate::clock::{DateTimeProvider, SystemClock};
use crate::node::Node;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use url::Url;

/// A pool of exactly one node. Never pings, never reseeds, never gives up on
/// its node.
#[derive(Debug)]
pub struct SingleNodePool {
    nodes: NodeSnapshot,
    uses_ssl: bool,
    last_update: DateTime<Utc>,
    sniffed_on_startup: AtomicBool,
}

impl SingleNodePool {
    /// Create a pool for `uri`.
    pub fn new(uri: Url) -> Self {
        Self::with_clock(uri, &SystemClock)
    }

    /// Create a pool for `uri`, stamping `last_update` from `clock`.
    pub fn with_clock(uri: Url, clock: &dyn DateTimeProvider) -> Self {
        let node = Node::new(uri);
        let uses_ssl = node.uri().scheme() == "https";
        Self {
            nodes: Arc::new(vec![Arc::new(node)]),
            uses_ssl,
            last_update: clock.now(),
            sniffed_on_startup: AtomicBool::new(false),
        }
    }
}

impl ConnectionPool for SingleNodePool {
    fn nodes(&self) -> NodeSnapshot {
        Arc::clone(&self.nodes)
    }

    fn create_view(&self) -> NodeView {
        NodeView::fixed(self.nodes.as_ref().clone())
    }

    fn supports_pinging(&self) -> bool {
        false
    }

    fn supports_reseeding(&self) -> bool {
        false
    }

    fn uses_ssl(&self) -> bool {
        self.uses_ssl
    }

    fn last_update(&self) -> DateTime<Utc> {
        self.last_update
    }

    fn sniffed_on_startup(&self) -> bool {
        self.sniffed_on_startup.load(Ordering::SeqCst)
    }

    fn set_sniffed_on_startup(&self, sniffed: bool) {
        self.sniffed_on_startup.store(sniffed, Ordering::SeqCst);
    }

    fn max_retries(&self) -> usize {
        0
    }
}
