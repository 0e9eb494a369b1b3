//! Fixed node set with round-robin or sticky selection.

use super::{
    earliest_recovery, validate_seed, ConnectionPool, NodeSnapshot, NodeView, PoolOptions,
};
use crate::error::ConfigError;
use crate::node::Node;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use rand::seq::SliceRandom;
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tracing::debug;

/// Where each view starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Selection {
    /// Rotate the start offset on every view.
    RoundRobin,
    /// Always start at the first live node in seed order.
    Sticky,
}

/// A fixed set of nodes with round-robin (or sticky) selection and pinging.
#[derive(Debug)]
pub struct StaticPool {
    nodes: RwLock<NodeSnapshot>,
    cursor: AtomicUsize,
    last_update: RwLock<DateTime<Utc>>,
    sniffed_on_startup: AtomicBool,
    uses_ssl: bool,
    selection: Selection,
    options: PoolOptions,
}

impl StaticPool {
    /// Round-robin pool with default options.
    pub fn new(nodes: Vec<Node>) -> Result<Self, ConfigError> {
        Self::with_options(nodes, PoolOptions::default())
    }

    /// Round-robin pool.
    pub fn with_options(nodes: Vec<Node>, options: PoolOptions) -> Result<Self, ConfigError> {
        Self::build(nodes, options, Selection::RoundRobin)
    }

    /// Sticky pool: every view starts at the first live node, so traffic
    /// stays on one node until it fails.
    pub fn sticky(nodes: Vec<Node>, options: PoolOptions) -> Result<Self, ConfigError> {
        Self::build(nodes, options, Selection::Sticky)
    }

    pub(crate) fn build(
        nodes: Vec<Node>,
        options: PoolOptions,
        selection: Selection,
    ) -> Result<Self, ConfigError> {
        let uses_ssl = validate_seed(&nodes)?;
        let snapshot = prepare(nodes, options.randomize);
        let last_update = options.clock.now();
        Ok(Self {
            nodes: RwLock::new(snapshot),
            cursor: AtomicUsize::new(0),
            last_update: RwLock::new(last_update),
            sniffed_on_startup: AtomicBool::new(false),
            uses_ssl,
            selection,
            options,
        })
    }

    /// Publish a new node set. Concurrent views keep the snapshot they took.
    pub(crate) fn replace(&self, nodes: Vec<Node>) -> Result<(), ConfigError> {
        if nodes.is_empty() {
            return Err(ConfigError::EmptyNodes);
        }
        let snapshot = prepare(nodes, self.options.randomize);
        debug!(nodes = snapshot.len(), "Reseeding connection pool");
        *self.nodes.write() = snapshot;
        self.cursor.store(0, Ordering::SeqCst);
        *self.last_update.write() = self.options.clock.now();
        Ok(())
    }
}

fn prepare(nodes: Vec<Node>, randomize: bool) -> NodeSnapshot {
    let mut seen = HashSet::new();
    let mut unique: Vec<Arc<Node>> = nodes
        .into_iter()
        .filter(|n| seen.insert(n.uri().clone()))
        .map(Arc::new)
        .collect();
    if randomize {
        unique.shuffle(&mut rand::rng());
    }
    Arc::new(unique)
}

impl ConnectionPool for StaticPool {
    fn nodes(&self) -> NodeSnapshot {
        self.nodes.read().clone()
    }

    fn create_view(&self) -> NodeView {
        let snapshot = self.nodes();
        let now = self.options.clock.now();
        let alive: Vec<Arc<Node>> = snapshot
            .iter()
            .filter(|n| n.is_available(now))
            .cloned()
            .collect();

        if alive.is_empty() {
            return match earliest_recovery(&snapshot) {
                Some(node) => NodeView::all_dead(node),
                None => NodeView::new(Vec::new(), 0),
            };
        }

        let start = match self.selection {
            Selection::RoundRobin => self.cursor.fetch_add(1, Ordering::SeqCst),
            Selection::Sticky => 0,
        };
        NodeView::new(alive, start)
    }

    fn supports_pinging(&self) -> bool {
        true
    }

    fn supports_reseeding(&self) -> bool {
        false
    }

    fn uses_ssl(&self) -> bool {
        self.uses_ssl
    }

    fn last_update(&self) -> DateTime<Utc> {
        *self.last_update.read()
    }

    fn sniffed_on_startup(&self) -> bool {
        self.sniffed_on_startup.load(Ordering::SeqCst)
    }

    fn set_sniffed_on_startup(&self, sniffed: bool) {
        self.sniffed_on_startup.store(sniffed, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::AuditEvent;
    use chrono::Duration;

    fn seed(ports: &[u16]) -> Vec<Node> {
        ports
            .iter()
            .map(|p| Node::parse(&format!("http://localhost:{p}")).unwrap())
            .collect()
    }

    fn ordered() -> PoolOptions {
        PoolOptions::default().with_randomize(false)
    }

    fn first_port(pool: &dyn ConnectionPool) -> u16 {
        pool.create_view().next().unwrap().uri().port().unwrap()
    }

    #[test]
    fn test_round_robin_start_rotates() {
        let pool = StaticPool::with_options(seed(&[9200, 9201, 9202, 9203]), ordered()).unwrap();
        let firsts: Vec<u16> = (0..4).map(|_| first_port(&pool)).collect();
        assert_eq!(firsts, vec![9200, 9201, 9202, 9203]);
    }

    #[test]
    fn test_dead_nodes_are_skipped_until_deadline() {
        let pool = StaticPool::with_options(seed(&[9200, 9201, 9202]), ordered()).unwrap();
        let until = Utc::now() + Duration::hours(1);
        pool.nodes()[1].mark_dead(until);

        let ports: Vec<u16> = pool.create_view().map(|n| n.uri().port().unwrap()).collect();
        assert_eq!(ports, vec![9200, 9202]);
    }

    #[test]
    fn test_all_dead_yields_one_node() {
        let pool = StaticPool::with_options(seed(&[9200, 9201]), ordered()).unwrap();
        let later = Utc::now() + Duration::hours(2);
        let sooner = Utc::now() + Duration::hours(1);
        pool.nodes()[0].mark_dead(later);
        pool.nodes()[1].mark_dead(sooner);

        let mut view = pool.create_view();
        let mut events = Vec::new();
        let node = view.next_audited(&mut |e, _| events.push(e)).unwrap();
        assert_eq!(node.uri().port(), Some(9201));
        assert!(node.is_resurrected());
        assert!(view.next().is_none());
        assert_eq!(events, vec![AuditEvent::AllNodesDead, AuditEvent::Resurrection]);
    }

    #[test]
    fn test_sticky_prefers_first_live_node() {
        let pool = StaticPool::sticky(seed(&[9200, 9201, 9202]), ordered()).unwrap();
        assert_eq!(first_port(&pool), 9200);
        assert_eq!(first_port(&pool), 9200);

        pool.nodes()[0].mark_dead(Utc::now() + Duration::hours(1));
        assert_eq!(first_port(&pool), 9201);
        assert_eq!(first_port(&pool), 9201);
    }

    #[test]
    fn test_duplicate_seeds_collapse() {
        let pool = StaticPool::with_options(seed(&[9200, 9200, 9201]), ordered()).unwrap();
        assert_eq!(pool.nodes().len(), 2);
        assert_eq!(pool.max_retries(), 1);
    }

    #[test]
    fn test_randomized_pool_keeps_every_node() {
        let pool = StaticPool::new(seed(&[9200, 9201, 9202, 9203, 9204])).unwrap();
        let mut ports: Vec<u16> = pool.nodes().iter().map(|n| n.uri().port().unwrap()).collect();
        ports.sort();
        assert_eq!(ports, vec![9200, 9201, 9202, 9203, 9204]);
    }

    #[test]
    fn test_static_pool_does_not_reseed() {
        let pool = StaticPool::with_options(seed(&[9200]), ordered()).unwrap();
        pool.reseed(seed(&[9300, 9301])).unwrap();
        assert_eq!(pool.nodes().len(), 1);
        assert!(!pool.supports_reseeding());
    }

    #[test]
    fn test_concurrent_views_lead_with_distinct_nodes() {
        let ports: Vec<u16> = (9200..9208).collect();
        let pool = StaticPool::with_options(seed(&ports), ordered()).unwrap();
        let barrier = std::sync::Barrier::new(ports.len());

        let mut leaders: Vec<u16> = std::thread::scope(|s| {
            let handles: Vec<_> = (0..ports.len())
                .map(|_| {
                    s.spawn(|| {
                        barrier.wait();
                        first_port(&pool)
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });
        leaders.sort_unstable();
        assert_eq!(leaders, ports);
    }

    #[test]
    fn test_views_never_mix_old_and_new_node_sets() {
        let small: Vec<u16> = vec![9200, 9201, 9202];
        let large: Vec<u16> = vec![9300, 9301, 9302, 9303, 9304];
        let pool = StaticPool::with_options(seed(&small), ordered()).unwrap();
        let done = AtomicBool::new(false);

        std::thread::scope(|s| {
            s.spawn(|| {
                for round in 0..500 {
                    let next = if round % 2 == 0 { &large } else { &small };
                    pool.replace(seed(next)).unwrap();
                }
                done.store(true, Ordering::SeqCst);
            });

            for _ in 0..4 {
                s.spawn(|| {
                    while !done.load(Ordering::SeqCst) {
                        let len = pool.nodes().len();
                        assert!(len == small.len() || len == large.len());

                        let mut seen: Vec<u16> =
                            pool.create_view().map(|n| n.uri().port().unwrap()).collect();
                        seen.sort_unstable();
                        assert!(seen == small || seen == large, "torn view: {seen:?}");
                    }
                });
            }
        });
    }
}
