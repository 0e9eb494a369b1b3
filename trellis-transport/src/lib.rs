//! # Trellis Transport
//!
//! A resilient transport for OpenSearch clients: connection pools that track
//! node health, pings before first use, cluster sniffing, and a request
//! pipeline that fails over between nodes within a retry budget.
//!
//! ## Features
//!
//! - **Connection Pools**: single node, static round robin, sticky, and sniffing pools
//! - **Dead Node Tracking**: escalating dead windows with resurrection and re-ping
//! - **Sniffing**: on startup, on connection faults, and when cluster state grows stale
//! - **Failover**: bounded retries and an overall retry timeout
//! - **Audit Trail**: every ping, sniff and call is recorded on the response
//! - **Cancellation**: per-request tokens abort in-flight calls and pending retries
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use trellis_transport::{Node, PoolOptions, SniffingPool, Transport, TransportSettings};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let nodes = vec![
//!         Node::parse("http://localhost:9200")?,
//!         Node::parse("http://localhost:9201")?,
//!     ];
//!     let pool = Arc::new(SniffingPool::new(nodes, PoolOptions::default())?);
//!     let transport = Transport::new(pool, TransportSettings::default())?;
//!
//!     let response = transport.get("_cluster/health").await?;
//!     println!("valid: {}", response.is_valid());
//!     Ok(())
//! }
//! ```
//!
//! ## Configuration From The Environment
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use trellis_transport::{EnvLoader, PoolOptions, StaticPool, Transport, TransportSettings};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let loader = EnvLoader::default();
//! let settings = TransportSettings::from_loader(&loader)?;
//! let nodes = TransportSettings::seed_nodes(&loader)?;
//! let pool = Arc::new(StaticPool::with_options(nodes, PoolOptions::default())?);
//! let transport = Transport::new(pool, settings)?;
//! # Ok(())
//! # }
//! ```

mod audit;
pub mod clock;
mod config;
mod connection;
mod env;
mod error;
mod meta;
mod node;
mod pipeline;
pub mod pool;
mod request;
mod response;
pub mod sniff;
mod transport;

pub use audit::{Audit, AuditEvent};
pub use clock::{DateTimeProvider, SystemClock};
pub use config::{
    DEFAULT_PING_TIMEOUT, DEFAULT_PING_TIMEOUT_TLS, DEFAULT_REQUEST_TIMEOUT,
    DEFAULT_SNIFF_LIFE_SPAN, NodePredicate, RequestCompletedHook, TransportSettings,
    TransportSettingsBuilder, default_node_predicate,
};
pub use connection::{Connection, ConnectionResponse, HttpConnection, RequestData, RequestKind};
pub use env::{ENV_PREFIX, EnvLoader};
pub use error::{
    ConfigError, ConnectionError, PipelineError, PipelineFailure, Result, TransportError,
};
pub use meta::{Helper, META_HEADER_NAME, MetaHeader};
pub use node::{Node, NodeRoles, NodeState};
pub use pipeline::MAX_VIEW_REFRESHES;
pub use pool::{ConnectionPool, NodeView, PoolOptions, SingleNodePool, SniffingPool, StaticPool};
pub use request::{OPAQUE_ID_HEADER, RequestConfig};
pub use response::{ApiCallDetails, TransportResponse};
pub use transport::{Transport, TransportBuilder};

/// Prelude for common imports.
pub mod prelude {
    pub use crate::{
        AuditEvent, ConnectionPool, Node, PipelineFailure, PoolOptions, RequestConfig,
        SingleNodePool, SniffingPool, StaticPool, Transport, TransportError, TransportResponse,
        TransportSettings,
    };
}
