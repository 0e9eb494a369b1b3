//! Virtual cluster builder.

use crate::clock::TestClock;
use crate::connection::{ClusterNode, Responder, VirtualizedConnection};
use crate::rules::Rule;
use bytes::Bytes;
use http::Method;
use std::sync::Arc;
use trellis_transport::{
    ConfigError, ConnectionPool, Node, NodeRoles, PoolOptions, RequestConfig, Result,
    SingleNodePool, SniffingPool, StaticPool, Transport, TransportResponse, TransportSettings,
    TransportSettingsBuilder,
};
use url::Url;

/// Which pool the virtual cluster is seeded into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolKind {
    /// One node, no pings.
    SingleNode,
    /// Fixed round robin.
    Static,
    /// Fixed, sticking to the first live node.
    Sticky,
    /// Round robin with reseeding.
    Sniffing,
    /// Sticky with reseeding.
    StickySniffing,
}

/// Builder for a cluster of virtual nodes on `localhost`.
///
/// ```
/// use trellis_testing::{Rule, Times, VirtualCluster};
///
/// # tokio_test::block_on(async {
/// let cluster = VirtualCluster::nodes([9200, 9201])
///     .ping(Rule::fails(Times::Once).on_port(9200))
///     .static_pool()
///     .build();
///
/// let response = cluster.call(Default::default()).await.unwrap();
/// assert!(response.is_valid());
/// # });
/// ```
pub struct VirtualCluster {
    nodes: Vec<ClusterNode>,
    sniff_nodes: Option<Vec<ClusterNode>>,
    pings: Vec<Rule>,
    calls: Vec<Rule>,
    sniffs: Vec<Rule>,
    responder: Option<Responder>,
    settings: TransportSettingsBuilder,
    pool: PoolKind,
    clock: TestClock,
}

impl VirtualCluster {
    /// A cluster with one node per port, all with every role.
    pub fn nodes(ports: impl IntoIterator<Item = u16>) -> Self {
        Self {
            nodes: ports.into_iter().map(ClusterNode::new).collect(),
            sniff_nodes: None,
            pings: Vec::new(),
            calls: Vec::new(),
            sniffs: Vec::new(),
            responder: None,
            settings: TransportSettings::builder(),
            pool: PoolKind::Static,
            clock: TestClock::new(),
        }
    }

    /// Give the node on `port` specific roles.
    pub fn roles(mut self, port: u16, roles: NodeRoles) -> Self {
        for node in self.nodes.iter_mut().filter(|n| n.port == port) {
            node.roles = roles;
        }
        self
    }

    /// Nodes the cluster reports when sniffed. Defaults to the seed nodes.
    pub fn sniff_returns(mut self, nodes: Vec<ClusterNode>) -> Self {
        self.sniff_nodes = Some(nodes);
        self
    }

    /// Script a ping.
    pub fn ping(mut self, rule: Rule) -> Self {
        self.pings.push(rule);
        self
    }

    /// Script an API call.
    pub fn client_call(mut self, rule: Rule) -> Self {
        self.calls.push(rule);
        self
    }

    /// Script a sniff.
    pub fn sniff(mut self, rule: Rule) -> Self {
        self.sniffs.push(rule);
        self
    }

    /// Answer API calls no rule matches with `responder`.
    pub fn responder<F>(mut self, responder: F) -> Self
    where
        F: Fn(&trellis_transport::RequestData) -> Option<trellis_transport::ConnectionResponse>
            + Send
            + Sync
            + 'static,
    {
        self.responder = Some(Arc::new(responder));
        self
    }

    /// Adjust transport settings.
    pub fn settings(
        mut self,
        configure: impl FnOnce(TransportSettingsBuilder) -> TransportSettingsBuilder,
    ) -> Self {
        self.settings = configure(self.settings);
        self
    }

    /// Seed a single node pool with the first node.
    pub fn single_node(mut self) -> Self {
        self.pool = PoolKind::SingleNode;
        self
    }

    /// Seed a static round robin pool.
    pub fn static_pool(mut self) -> Self {
        self.pool = PoolKind::Static;
        self
    }

    /// Seed a sticky pool.
    pub fn sticky_pool(mut self) -> Self {
        self.pool = PoolKind::Sticky;
        self
    }

    /// Seed a sniffing pool.
    pub fn sniffing_pool(mut self) -> Self {
        self.pool = PoolKind::Sniffing;
        self
    }

    /// Seed a sticky sniffing pool.
    pub fn sticky_sniffing_pool(mut self) -> Self {
        self.pool = PoolKind::StickySniffing;
        self
    }

    /// Use `clock` instead of a fresh test clock.
    pub fn clock(mut self, clock: TestClock) -> Self {
        self.clock = clock;
        self
    }

    /// Build the cluster, panicking on an invalid seed.
    pub fn build(self) -> VirtualizedCluster {
        match self.try_build() {
            Ok(cluster) => cluster,
            Err(e) => panic!("invalid virtual cluster: {e}"),
        }
    }

    /// Build the cluster.
    pub fn try_build(self) -> Result<VirtualizedCluster> {
        let clock = self.clock;
        let seed: Vec<Node> = self
            .nodes
            .iter()
            .map(|n| {
                Node::parse(&format!("http://localhost:{}", n.port))
                    .map(|node| node.with_roles(n.roles))
            })
            .collect::<std::result::Result<_, ConfigError>>()?;

        let options = PoolOptions::default()
            .with_randomize(false)
            .with_clock(Arc::new(clock.clone()));
        let pool: Arc<dyn ConnectionPool> = match self.pool {
            PoolKind::SingleNode => {
                let first = seed.first().ok_or(ConfigError::EmptyNodes)?;
                Arc::new(SingleNodePool::with_clock(first.uri().clone(), &clock))
            }
            PoolKind::Static => Arc::new(StaticPool::with_options(seed, options)?),
            PoolKind::Sticky => Arc::new(StaticPool::sticky(seed, options)?),
            PoolKind::Sniffing => Arc::new(SniffingPool::new(seed, options)?),
            PoolKind::StickySniffing => Arc::new(SniffingPool::sticky(seed, options)?),
        };

        let mut connection = VirtualizedConnection::new(clock.clone())
            .with_sniff_nodes(self.sniff_nodes.unwrap_or(self.nodes));
        for rule in self.pings {
            connection = connection.with_ping(rule);
        }
        for rule in self.calls {
            connection = connection.with_call(rule);
        }
        for rule in self.sniffs {
            connection = connection.with_sniff(rule);
        }
        if let Some(responder) = self.responder {
            connection = connection.with_responder(responder);
        }
        let connection = Arc::new(connection);

        let transport = Transport::builder(Arc::clone(&pool))
            .settings(self.settings.build())
            .connection(connection.clone())
            .clock(Arc::new(clock.clone()))
            .build()?;

        Ok(VirtualizedCluster {
            transport,
            connection,
            clock,
        })
    }
}

/// A transport wired to a virtual cluster.
#[derive(Debug, Clone)]
pub struct VirtualizedCluster {
    transport: Transport,
    connection: Arc<VirtualizedConnection>,
    clock: TestClock,
}

impl VirtualizedCluster {
    /// Send a search request.
    pub async fn call(&self, config: RequestConfig) -> Result<TransportResponse> {
        self.transport
            .request(Method::GET, "test/_search", None, &config)
            .await
    }

    /// Send an arbitrary request.
    pub async fn request(
        &self,
        method: Method,
        path: &str,
        body: Option<Bytes>,
        config: RequestConfig,
    ) -> Result<TransportResponse> {
        self.transport.request(method, path, body, &config).await
    }

    /// The transport.
    pub fn transport(&self) -> &Transport {
        &self.transport
    }

    /// The pool.
    pub fn pool(&self) -> &Arc<dyn ConnectionPool> {
        self.transport.pool()
    }

    /// The scripted connection.
    pub fn connection(&self) -> &VirtualizedConnection {
        &self.connection
    }

    /// The shared clock.
    pub fn clock(&self) -> &TestClock {
        &self.clock
    }

    /// Node of the pool on `port`.
    pub fn node(&self, port: u16) -> Option<Arc<Node>> {
        self.pool()
            .nodes()
            .iter()
            .find(|n| n.uri().port() == Some(port))
            .cloned()
    }

    /// URI of the virtual node on `port`.
    pub fn uri(port: u16) -> Option<Url> {
        Url::parse(&format!("http://localhost:{port}/")).ok()
    }
}
