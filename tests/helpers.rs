//! Integration tests for back-pressure pacing of the scroll and bulk helpers.

use bytes::Bytes;
use futures::StreamExt;
use http::{HeaderMap, Method, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;
use trellis::prelude::*;
use trellis::{ConnectionResponse, RequestData, RequestKind};
use trellis_testing::*;

#[derive(Debug, Serialize, Deserialize)]
struct Doc {
    n: usize,
}

fn respond(body: Value) -> ConnectionResponse {
    ConnectionResponse {
        status: StatusCode::OK,
        headers: HeaderMap::new(),
        body: Bytes::from(body.to_string()),
    }
}

/// Five pages per scroll, one hit each; every bulk item is created.
fn responder(data: &RequestData) -> Option<ConnectionResponse> {
    let body: Value = data
        .body
        .as_ref()
        .and_then(|b| serde_json::from_slice(b).ok())
        .unwrap_or(Value::Null);

    if data.path.ends_with("_bulk") {
        let lines = data
            .body
            .as_ref()
            .map(|b| b.split(|c| *c == b'\n').filter(|l| !l.is_empty()).count())
            .unwrap_or(0);
        let items: Vec<Value> = (0..lines / 2)
            .map(|_| json!({"index": {"_index": "docs", "status": 201, "result": "created"}}))
            .collect();
        return Some(respond(json!({"errors": false, "items": items})));
    }
    if data.method == Method::DELETE {
        return Some(respond(json!({"succeeded": true})));
    }

    let page = if data.path.contains("_search?scroll=") {
        1
    } else {
        body["scroll_id"].as_str()?.parse::<usize>().ok()? + 1
    };
    let hits = if page <= 5 {
        vec![json!({"_index": "docs", "_id": page.to_string(), "_source": {"n": page}})]
    } else {
        Vec::new()
    };
    Some(respond(
        json!({"_scroll_id": page.to_string(), "hits": {"hits": hits}}),
    ))
}

fn cluster() -> VirtualizedCluster {
    VirtualCluster::nodes([9200]).responder(responder).build()
}

fn posts_to(cluster: &VirtualizedCluster, path: &str) -> usize {
    cluster
        .connection()
        .recorded_calls()
        .iter()
        .filter(|c| c.kind == RequestKind::Call && c.method == Method::POST && c.path.ends_with(path))
        .count()
}

// =============================================================================
// Scroll
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_unreleased_scroll_fetches_at_most_one_page_ahead() {
    init_tracing();
    let cluster = cluster();
    let back_pressure = Arc::new(BackPressure::new(1, Some(1)));
    let request = ScrollAllRequest::new("docs", 1).back_pressure(Arc::clone(&back_pressure));

    let mut pages = cluster.transport().scroll_all::<Doc>(request).unwrap();
    let first = pages.next().await.unwrap().unwrap();
    assert_eq!(first.hits[0].source.as_ref().unwrap().n, 1);

    tokio::time::sleep(Duration::from_secs(5)).await;
    assert!(posts_to(&cluster, "_search/scroll") <= 1);
    assert_eq!(back_pressure.available(), 0);

    for expected in 2..=5 {
        assert_eq!(back_pressure.release(), 1);
        let page = pages.next().await.unwrap().unwrap();
        assert_eq!(page.hits[0].source.as_ref().unwrap().n, expected);
    }
    assert!(pages.next().await.is_none());
}

// =============================================================================
// Bulk
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_unreleased_bulk_indexes_one_page() {
    init_tracing();
    let cluster = cluster();
    let back_pressure = Arc::new(BackPressure::new(1, Some(1)));
    let documents = (0..9).map(|n| Doc { n });
    let request = BulkAllRequest::new("docs", documents)
        .size(3)
        .max_degree_of_parallelism(1)
        .back_pressure(Arc::clone(&back_pressure));

    let mut responses = cluster.transport().bulk_all(request).unwrap();
    let first = responses.next().await.unwrap().unwrap();
    assert_eq!(first.items.len(), 3);

    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(posts_to(&cluster, "_bulk"), 1);

    back_pressure.release();
    responses.next().await.unwrap().unwrap();
    back_pressure.release();
    responses.next().await.unwrap().unwrap();
    assert!(responses.next().await.is_none());
    assert_eq!(posts_to(&cluster, "_bulk"), 3);
}
