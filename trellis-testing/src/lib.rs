//! Testing utilities for Trellis transports.
//!
//! ## Features
//!
//! - **VirtualCluster** - Builder for a scripted cluster of localhost nodes
//! - **Rules** - Per-port ping, sniff and call behavior with usage limits
//! - **TestClock** - A clock that only moves when a test (or a slow rule) moves it
//! - **Assertions** - Audit trail comparisons
//!
//! ## Quick Start
//!
//! ```no_run
//! use trellis_testing::*;
//! use trellis_transport::{AuditEvent, RequestConfig};
//!
//! # tokio_test::block_on(async {
//! let cluster = VirtualCluster::nodes([9200, 9201])
//!     .ping(Rule::fails(Times::Once).on_port(9200))
//!     .build();
//!
//! let response = cluster.call(RequestConfig::default()).await.unwrap();
//! assert_audits(
//!     response.audit_trail(),
//!     &[
//!         (AuditEvent::PingFailure, Some(9200)),
//!         (AuditEvent::PingSuccess, Some(9201)),
//!         (AuditEvent::HealthyResponse, Some(9201)),
//!     ],
//! );
//! # });
//! ```

mod assertions;
mod clock;
mod cluster;
mod connection;
mod rules;

pub use assertions::{assert_audits, audit_events, count_events};
pub use clock::TestClock;
pub use cluster::{PoolKind, VirtualCluster, VirtualizedCluster};
pub use connection::{
    ClusterNode, RecordedCall, Responder, VirtualizedConnection, nodes_info,
};
pub use rules::{Outcome, Rule, Times};

/// Install a `tracing` subscriber for tests, filtered by `RUST_LOG`.
///
/// Safe to call from every test; only the first call installs.
pub fn init_tracing() {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_test_writer())
        .try_init();
}
