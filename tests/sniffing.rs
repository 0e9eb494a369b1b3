//! Integration tests for cluster discovery: startup, failure and stale sniffs.

use std::time::Duration;
use trellis::prelude::*;
use trellis::{AuditEvent::*, NodeRoles, RequestKind};
use trellis_testing::*;

fn pool_ports(cluster: &VirtualizedCluster) -> Vec<u16> {
    cluster
        .pool()
        .nodes()
        .iter()
        .filter_map(|n| n.uri().port())
        .collect()
}

// =============================================================================
// Sniff On Startup
// =============================================================================

#[tokio::test]
async fn test_first_request_sniffs_and_reseeds() {
    let cluster = VirtualCluster::nodes([9200])
        .sniff_returns(vec![
            ClusterNode::new(9200),
            ClusterNode::new(9201),
            ClusterNode::new(9202),
        ])
        .sniffing_pool()
        .build();

    let first = cluster.call(RequestConfig::default()).await.unwrap();
    assert_audits(
        first.audit_trail(),
        &[
            (SniffOnStartup, None),
            (SniffSuccess, Some(9200)),
            (PingSuccess, Some(9200)),
            (HealthyResponse, Some(9200)),
        ],
    );
    assert_eq!(pool_ports(&cluster), vec![9200, 9201, 9202]);
    assert!(cluster.pool().sniffed_on_startup());

    let second = cluster.call(RequestConfig::default()).await.unwrap();
    assert_audits(
        second.audit_trail(),
        &[(PingSuccess, Some(9201)), (HealthyResponse, Some(9201))],
    );
    assert_eq!(cluster.connection().count(RequestKind::Sniff), 1);
}

#[tokio::test]
async fn test_failed_startup_sniff_is_not_fatal() {
    let cluster = VirtualCluster::nodes([9200, 9201])
        .sniff(Rule::fails(Times::Times(2)))
        .sniffing_pool()
        .build();

    let first = cluster.call(RequestConfig::default()).await.unwrap();
    assert!(first.is_valid());
    let events = audit_events(first.audit_trail());
    assert_eq!(
        &events[..3],
        &[
            (SniffOnStartup, None),
            (SniffFailure, Some(9200)),
            (SniffFailure, Some(9201)),
        ]
    );
    assert_eq!(events.last().unwrap().0, HealthyResponse);
    assert!(!cluster.pool().sniffed_on_startup());

    // Startup sniffing is retried until it succeeds.
    let second = cluster.call(RequestConfig::default()).await.unwrap();
    assert_eq!(second.audit_trail()[0].event, SniffOnStartup);
    assert_eq!(count_events(second.audit_trail(), SniffSuccess), 1);
    assert!(cluster.pool().sniffed_on_startup());

    let third = cluster.call(RequestConfig::default()).await.unwrap();
    assert_eq!(count_events(third.audit_trail(), SniffOnStartup), 0);
    assert_eq!(cluster.connection().count(RequestKind::Sniff), 3);
}

#[tokio::test]
async fn test_request_can_skip_sniffing() {
    let cluster = VirtualCluster::nodes([9200]).sniffing_pool().build();

    let response = cluster
        .call(RequestConfig::new().with_disable_sniff(true))
        .await
        .unwrap();
    assert_eq!(count_events(response.audit_trail(), SniffOnStartup), 0);
    assert_eq!(cluster.connection().count(RequestKind::Sniff), 0);

    let next = cluster.call(RequestConfig::default()).await.unwrap();
    assert_eq!(next.audit_trail()[0].event, SniffOnStartup);
}

// =============================================================================
// Sniff On Failure
// =============================================================================

#[tokio::test]
async fn test_failed_call_sniffs_and_moves_to_new_nodes() {
    let cluster = VirtualCluster::nodes([9200, 9201])
        .client_call(Rule::fails(Times::Once).on_port(9200).returns_status(503))
        .sniff_returns(vec![ClusterNode::new(9201), ClusterNode::new(9202)])
        .settings(|s| s.sniff_on_startup(false))
        .sniffing_pool()
        .build();

    let response = cluster.call(RequestConfig::default()).await.unwrap();
    assert!(response.is_valid());
    assert_audits(
        response.audit_trail(),
        &[
            (PingSuccess, Some(9200)),
            (BadResponse, Some(9200)),
            (SniffOnFail, None),
            (SniffSuccess, Some(9201)),
            (PingSuccess, Some(9201)),
            (HealthyResponse, Some(9201)),
        ],
    );
    assert_eq!(pool_ports(&cluster), vec![9201, 9202]);
}

#[tokio::test]
async fn test_sniff_on_fault_can_be_disabled() {
    let cluster = VirtualCluster::nodes([9200, 9201])
        .client_call(Rule::fails(Times::Once).on_port(9200).returns_status(503))
        .settings(|s| s.sniff_on_startup(false).sniff_on_connection_fault(false))
        .sniffing_pool()
        .build();

    let response = cluster.call(RequestConfig::default()).await.unwrap();
    assert!(response.is_valid());
    assert_eq!(cluster.connection().count(RequestKind::Sniff), 0);
}

#[tokio::test]
async fn test_static_pool_never_sniffs() {
    let cluster = VirtualCluster::nodes([9200, 9201])
        .client_call(Rule::fails(Times::Once).on_port(9200).returns_status(503))
        .static_pool()
        .build();

    let response = cluster.call(RequestConfig::default()).await.unwrap();
    assert!(response.is_valid());
    assert_eq!(cluster.connection().count(RequestKind::Sniff), 0);
    assert_eq!(pool_ports(&cluster), vec![9200, 9201]);
}

// =============================================================================
// Stale Cluster State
// =============================================================================

#[tokio::test]
async fn test_stale_cluster_state_is_refreshed() {
    let cluster = VirtualCluster::nodes([9200])
        .settings(|s| s.sniff_on_startup(false))
        .sniffing_pool()
        .build();

    let fresh = cluster.call(RequestConfig::default()).await.unwrap();
    assert_eq!(count_events(fresh.audit_trail(), SniffOnStaleCluster), 0);

    cluster.clock().advance(Duration::from_secs(2 * 60 * 60));

    let stale = cluster.call(RequestConfig::default()).await.unwrap();
    assert_audits(
        stale.audit_trail(),
        &[
            (SniffOnStaleCluster, None),
            (SniffSuccess, Some(9200)),
            (PingSuccess, Some(9200)),
            (HealthyResponse, Some(9200)),
        ],
    );

    let next = cluster.call(RequestConfig::default()).await.unwrap();
    assert_eq!(count_events(next.audit_trail(), SniffOnStaleCluster), 0);
}

#[tokio::test]
async fn test_stale_sniffing_can_be_disabled() {
    let cluster = VirtualCluster::nodes([9200])
        .settings(|s| s.sniff_on_startup(false).sniff_life_span(None))
        .sniffing_pool()
        .build();

    cluster.call(RequestConfig::default()).await.unwrap();
    cluster.clock().advance(Duration::from_secs(24 * 60 * 60));
    cluster.call(RequestConfig::default()).await.unwrap();

    assert_eq!(cluster.connection().count(RequestKind::Sniff), 0);
}

// =============================================================================
// Discovered Roles
// =============================================================================

#[tokio::test]
async fn test_cluster_manager_only_nodes_are_not_used() {
    let manager = NodeRoles {
        holds_data: false,
        cluster_manager_eligible: true,
        ingest_enabled: false,
        http_enabled: true,
    };
    let cluster = VirtualCluster::nodes([9200])
        .sniff_returns(vec![
            ClusterNode::new(9200),
            ClusterNode {
                port: 9201,
                roles: manager,
            },
            ClusterNode::new(9202),
        ])
        .sniffing_pool()
        .build();

    cluster.call(RequestConfig::default()).await.unwrap();
    assert_eq!(pool_ports(&cluster), vec![9200, 9202]);
}

#[tokio::test]
async fn test_nodes_without_http_are_not_used() {
    let no_http = NodeRoles {
        http_enabled: false,
        ..NodeRoles::default()
    };
    let cluster = VirtualCluster::nodes([9200])
        .sniff_returns(vec![
            ClusterNode::new(9200),
            ClusterNode {
                port: 9201,
                roles: no_http,
            },
        ])
        .sniffing_pool()
        .build();

    cluster.call(RequestConfig::default()).await.unwrap();
    assert_eq!(pool_ports(&cluster), vec![9200]);
}

#[tokio::test]
async fn test_unbounded_life_span_never_goes_stale() {
    init_tracing();
    let cluster = VirtualCluster::nodes([9200])
        .settings(|s| {
            s.sniff_on_startup(false)
                .sniff_life_span(Some(Duration::from_secs(u64::MAX / 4)))
        })
        .sniffing_pool()
        .build();

    cluster.call(RequestConfig::default()).await.unwrap();
    cluster.clock().advance(Duration::from_secs(365 * 24 * 60 * 60));
    let response = cluster.call(RequestConfig::default()).await.unwrap();

    assert!(response.is_valid());
    assert_eq!(cluster.connection().count(RequestKind::Sniff), 0);
}
