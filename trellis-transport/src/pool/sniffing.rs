//! Pool that can be reseeded from sniffed cluster state.

use super::static_pool::{Selection, StaticPool};
use super::{ConnectionPool, NodeSnapshot, NodeView, PoolOptions};
use crate::error::ConfigError;
use crate::node::Node;
use chrono::{DateTime, Utc};

/// A round-robin pool whose node set is replaced from cluster sniffs.
#[derive(Debug)]
pub struct SniffingPool {
    inner: StaticPool,
}

impl SniffingPool {
    /// Round-robin sniffing pool.
    pub fn new(nodes: Vec<Node>, options: PoolOptions) -> Result<Self, ConfigError> {
        StaticPool::build(nodes, options, Selection::RoundRobin).map(|inner| Self { inner })
    }

    /// Sticky sniffing pool.
    pub fn sticky(nodes: Vec<Node>, options: PoolOptions) -> Result<Self, ConfigError> {
        StaticPool::build(nodes, options, Selection::Sticky).map(|inner| Self { inner })
    }
}

impl ConnectionPool for SniffingPool {
    fn nodes(&self) -> NodeSnapshot {
        self.inner.nodes()
    }

    fn create_view(&self) -> NodeView {
        self.inner.create_view()
    }

    fn reseed(&self, nodes: Vec<Node>) -> Result<(), ConfigError> {
        self.inner.replace(nodes)
    }

    fn supports_pinging(&self) -> bool {
        true
    }

    fn supports_reseeding(&self) -> bool {
        true
    }

    fn uses_ssl(&self) -> bool {
        self.inner.uses_ssl()
    }

    fn last_update(&self) -> DateTime<Utc> {
        self.inner.last_update()
    }

    fn sniffed_on_startup(&self) -> bool {
        self.inner.sniffed_on_startup()
    }

    fn set_sniffed_on_startup(&self, sniffed: bool) {
        self.inner.set_sniffed_on_startup(sniffed);
    }
}
