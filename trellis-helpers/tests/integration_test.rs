//! Integration tests for trellis-helpers against a virtual cluster

use bytes::Bytes;
use futures::StreamExt;
use http::{HeaderMap, Method, StatusCode};
use serde::Deserialize;
use serde_json::{Value, json};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use trellis_helpers::*;
use trellis_testing::{RecordedCall, VirtualCluster, VirtualizedCluster};
use trellis_transport::{
    ConnectionResponse, META_HEADER_NAME, RequestConfig, RequestData, RequestKind,
};

const PAGES_PER_SLICE: u64 = 3;

#[derive(Debug, Deserialize)]
struct Entry {
    slice: u64,
    page: u64,
}

fn respond(status: StatusCode, body: Value) -> ConnectionResponse {
    ConnectionResponse {
        status,
        headers: HeaderMap::new(),
        body: Bytes::from(body.to_string()),
    }
}

fn body_of(data: &RequestData) -> Value {
    data.body
        .as_ref()
        .and_then(|b| serde_json::from_slice(b).ok())
        .unwrap_or(Value::Null)
}

fn scroll_page(slice: u64, page: u64) -> ConnectionResponse {
    let hits: Vec<Value> = if page <= PAGES_PER_SLICE {
        vec![json!({
            "_index": "logs",
            "_id": format!("{slice}-{page}"),
            "_source": {"slice": slice, "page": page}
        })]
    } else {
        Vec::new()
    };
    respond(
        StatusCode::OK,
        json!({"_scroll_id": format!("{slice}:{page}"), "hits": {"hits": hits}}),
    )
}

/// Serves every slice `PAGES_PER_SLICE` pages; scroll ids encode `slice:page`.
fn scroll_responder(data: &RequestData) -> Option<ConnectionResponse> {
    let body = body_of(data);
    if data.method == Method::DELETE {
        return Some(respond(StatusCode::OK, json!({"succeeded": true})));
    }
    if data.path.contains("_search?scroll=") {
        let slice = body["slice"]["id"].as_u64().unwrap_or(0);
        return Some(scroll_page(slice, 1));
    }
    if data.path.trim_start_matches('/') == "_search/scroll" {
        let (slice, page) = body["scroll_id"].as_str()?.split_once(':')?;
        let (slice, page) = (slice.parse().ok()?, page.parse::<u64>().ok()?);
        return Some(scroll_page(slice, page + 1));
    }
    None
}

fn scroll_cluster() -> VirtualizedCluster {
    VirtualCluster::nodes([9200])
        .responder(scroll_responder)
        .build()
}

fn calls_to(cluster: &VirtualizedCluster, method: Method, path: &str) -> Vec<RecordedCall> {
    cluster
        .connection()
        .recorded_calls()
        .into_iter()
        .filter(|c| c.kind == RequestKind::Call && c.method == method && c.path.contains(path))
        .collect()
}

fn meta_header(call: &RecordedCall) -> String {
    call.headers
        .get(META_HEADER_NAME)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string()
}

#[tokio::test]
async fn test_scroll_all_pages_arrive_in_order_per_slice() {
    let cluster = scroll_cluster();
    let request = ScrollAllRequest::new("logs", 3).max_degree_of_parallelism(2);

    let pages: Vec<ScrollAllPage<Entry>> = cluster
        .transport()
        .scroll_all::<Entry>(request)
        .unwrap()
        .map(|page| page.unwrap())
        .collect()
        .await;

    let mut per_slice: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
    for page in &pages {
        per_slice.entry(page.slice).or_default().push(page.page);
        let entry = page.hits[0].source.as_ref().unwrap();
        assert_eq!(entry.slice, page.slice as u64);
        assert_eq!(entry.page, page.page as u64);
    }
    assert_eq!(per_slice.len(), 3);
    for pages in per_slice.values() {
        assert_eq!(pages, &vec![1, 2, 3]);
    }

    let opened = calls_to(&cluster, Method::POST, "logs/_search");
    assert_eq!(opened.len(), 3);
    assert!(meta_header(&opened[0]).ends_with(",h=s"));
    assert_eq!(calls_to(&cluster, Method::DELETE, "_search/scroll").len(), 3);
}

#[tokio::test]
async fn test_scroll_all_sends_slice_template() {
    let cluster = scroll_cluster();
    let request = ScrollAllRequest::new("logs", 2)
        .size(50)
        .routing_field("tenant")
        .search(json!({"query": {"term": {"level": "error"}}}));

    let pages: Vec<_> = cluster
        .transport()
        .scroll_all::<Entry>(request)
        .unwrap()
        .collect()
        .await;
    assert_eq!(pages.len(), 6);

    let mut slices: Vec<u64> = calls_to(&cluster, Method::POST, "logs/_search")
        .iter()
        .map(|call| {
            let body: Value = serde_json::from_slice(call.body.as_ref().unwrap()).unwrap();
            assert_eq!(body["size"], 50);
            assert_eq!(body["sort"], json!(["_doc"]));
            assert_eq!(body["slice"]["max"], 2);
            assert_eq!(body["slice"]["field"], "tenant");
            assert_eq!(body["query"]["term"]["level"], "error");
            body["slice"]["id"].as_u64().unwrap()
        })
        .collect();
    slices.sort_unstable();
    assert_eq!(slices, vec![0, 1]);
}

#[tokio::test]
async fn test_scroll_all_invalid_page_fails_session() {
    let cluster = VirtualCluster::nodes([9200])
        .responder(|data: &RequestData| {
            let body = body_of(data);
            if body["scroll_id"] == "1:1" {
                return Some(ConnectionResponse {
                    status: StatusCode::OK,
                    headers: HeaderMap::new(),
                    body: Bytes::from_static(b"not json"),
                });
            }
            scroll_responder(data)
        })
        .build();

    let results: Vec<_> = cluster
        .transport()
        .scroll_all::<Entry>(ScrollAllRequest::new("logs", 2))
        .unwrap()
        .collect()
        .await;

    let errors: Vec<&HelperError> = results.iter().filter_map(|r| r.as_ref().err()).collect();
    assert_eq!(errors.len(), 1);
    assert!(matches!(
        errors[0],
        HelperError::ScrollFailed { slice: 1, page: 2, .. }
    ));
    assert!(matches!(results.last(), Some(Err(_))));
}

#[tokio::test]
async fn test_scroll_all_failure_stops_sibling_slices() {
    // Slice 0 breaks on its second page while slice 1 never runs dry.
    let cluster = VirtualCluster::nodes([9200])
        .responder(|data: &RequestData| {
            let body = body_of(data);
            if body["scroll_id"] == "0:1" {
                return Some(ConnectionResponse {
                    status: StatusCode::OK,
                    headers: HeaderMap::new(),
                    body: Bytes::from_static(b"not json"),
                });
            }
            if let Some(page) = body["scroll_id"]
                .as_str()
                .and_then(|id| id.strip_prefix("1:"))
                .and_then(|page| page.parse::<u64>().ok())
            {
                return Some(respond(
                    StatusCode::OK,
                    json!({
                        "_scroll_id": format!("1:{}", page + 1),
                        "hits": {"hits": [{"_index": "logs", "_source": {"slice": 1, "page": page + 1}}]}
                    }),
                ));
            }
            scroll_responder(data)
        })
        .build();

    let results: Vec<_> = cluster
        .transport()
        .scroll_all::<Entry>(ScrollAllRequest::new("logs", 2))
        .unwrap()
        .collect()
        .await;
    let errors: Vec<&HelperError> = results.iter().filter_map(|r| r.as_ref().err()).collect();
    assert_eq!(errors.len(), 1);
    assert!(matches!(
        errors[0],
        HelperError::ScrollFailed { slice: 0, page: 2, .. }
    ));

    let calls = cluster.connection().recorded_calls();
    let failed_at = calls
        .iter()
        .position(|c| {
            c.body
                .as_ref()
                .and_then(|b| serde_json::from_slice::<Value>(b).ok())
                .is_some_and(|body| body["scroll_id"] == "0:1")
        })
        .unwrap();
    let later_searches = calls[failed_at + 1..]
        .iter()
        .filter(|c| c.method == Method::POST)
        .count();
    assert_eq!(later_searches, 0);
    assert_eq!(calls_to(&cluster, Method::DELETE, "_search/scroll").len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_scroll_all_waits_for_back_pressure() {
    let cluster = scroll_cluster();
    let back_pressure = Arc::new(BackPressure::new(1, Some(1)));
    let request = ScrollAllRequest::new("logs", 1).back_pressure(Arc::clone(&back_pressure));

    let mut pages = cluster.transport().scroll_all::<Entry>(request).unwrap();
    let first = pages.next().await.unwrap().unwrap();
    assert_eq!(first.page, 1);

    let blocked = tokio::time::timeout(Duration::from_millis(100), pages.next()).await;
    assert!(blocked.is_err());

    assert_eq!(back_pressure.release(), 1);
    let second = pages.next().await.unwrap().unwrap();
    assert_eq!(second.page, 2);
}

#[tokio::test]
async fn test_dropping_scroll_stream_cancels_session() {
    let cluster = scroll_cluster();
    let mut pages = cluster
        .transport()
        .scroll_all::<Entry>(ScrollAllRequest::new("logs", 2))
        .unwrap();
    let token = pages.cancellation_token().clone();

    pages.next().await.unwrap().unwrap();
    drop(pages);
    assert!(token.is_cancelled());
}

#[tokio::test]
async fn test_scroll_all_external_cancellation() {
    let cluster = scroll_cluster();
    let token = CancellationToken::new();
    token.cancel();
    let request = ScrollAllRequest::new("logs", 2)
        .request_config(RequestConfig::new().with_cancellation(token));

    let results: Vec<_> = cluster
        .transport()
        .scroll_all::<Entry>(request)
        .unwrap()
        .collect()
        .await;

    assert_eq!(results.len(), 1);
    assert!(matches!(results[0], Err(HelperError::Cancelled)));
}

#[test]
fn test_scroll_all_rejects_invalid_request() {
    let cluster = scroll_cluster();
    let result = cluster
        .transport()
        .scroll_all::<Entry>(ScrollAllRequest::new("logs", 0));
    assert!(matches!(result, Err(HelperError::InvalidRequest(_))));
}

fn documents_in(data: &RequestData) -> usize {
    data.body
        .as_ref()
        .map(|b| b.split(|c| *c == b'\n').filter(|l| !l.is_empty()).count() / 2)
        .unwrap_or(0)
}

fn bulk_items(statuses: &[u16]) -> Value {
    let items: Vec<Value> = statuses
        .iter()
        .enumerate()
        .map(|(i, status)| {
            if *status < 300 {
                json!({"index": {"_index": "logs", "_id": i.to_string(), "status": status, "result": "created"}})
            } else {
                json!({"index": {"_index": "logs", "status": status,
                    "error": {"type": "rejected", "reason": format!("status {status}")}}})
            }
        })
        .collect();
    json!({"took": 1, "errors": statuses.iter().any(|s| *s >= 300), "items": items})
}

fn bulk_cluster<F>(statuses: F) -> VirtualizedCluster
where
    F: Fn(usize, usize) -> Vec<u16> + Send + Sync + 'static,
{
    let calls = AtomicUsize::new(0);
    VirtualCluster::nodes([9200])
        .responder(move |data: &RequestData| {
            if data.path.ends_with("_bulk") {
                let call = calls.fetch_add(1, Ordering::SeqCst);
                let statuses = statuses(call, documents_in(data));
                return Some(respond(StatusCode::OK, bulk_items(&statuses)));
            }
            None
        })
        .build()
}

fn all_created(_call: usize, documents: usize) -> Vec<u16> {
    vec![201; documents]
}

#[tokio::test]
async fn test_bulk_all_indexes_in_pages() {
    let cluster = bulk_cluster(all_created);
    let request = BulkAllRequest::new("logs", (0..10).map(|n| json!({"n": n})))
        .size(4)
        .max_degree_of_parallelism(2);

    let mut responses: Vec<BulkAllResponse> = cluster
        .transport()
        .bulk_all(request)
        .unwrap()
        .map(|r| r.unwrap())
        .collect()
        .await;
    responses.sort_by_key(|r| r.page);

    let pages: Vec<usize> = responses.iter().map(|r| r.page).collect();
    assert_eq!(pages, vec![1, 2, 3]);
    let items: usize = responses.iter().map(|r| r.items.len()).sum();
    assert_eq!(items, 10);
    assert!(responses.iter().all(|r| r.retries == 0));

    let bulks = calls_to(&cluster, Method::POST, "logs/_bulk");
    assert_eq!(bulks.len(), 3);
    assert_eq!(
        bulks[0].headers.get("content-type").unwrap(),
        "application/x-ndjson"
    );
    assert!(meta_header(&bulks[0]).ends_with(",h=b"));
}

#[tokio::test]
async fn test_bulk_all_uses_document_ids() {
    let cluster = bulk_cluster(all_created);
    let request = BulkAllRequest::new("logs", vec![json!({"id": "a"}), json!({"id": "b"})])
        .document_id(|doc: &Value| doc["id"].as_str().map(str::to_string));

    let responses: Vec<_> = cluster.transport().bulk_all(request).unwrap().collect().await;
    assert_eq!(responses.len(), 1);

    let bulks = calls_to(&cluster, Method::POST, "logs/_bulk");
    let body = String::from_utf8(bulks[0].body.as_ref().unwrap().to_vec()).unwrap();
    assert_eq!(
        body,
        "{\"index\":{\"_id\":\"a\"}}\n{\"id\":\"a\"}\n{\"index\":{\"_id\":\"b\"}}\n{\"id\":\"b\"}\n"
    );
}

#[tokio::test(start_paused = true)]
async fn test_bulk_all_resends_rejected_documents() {
    let cluster = bulk_cluster(|call, documents| {
        let mut statuses = vec![201; documents];
        if call == 0 {
            statuses[1] = 429;
        }
        statuses
    });
    let request = BulkAllRequest::new("logs", (0..3).map(|n| json!({"n": n})))
        .back_off_retries(2)
        .back_off_time(Duration::from_secs(1));

    let responses: Vec<BulkAllResponse> = cluster
        .transport()
        .bulk_all(request)
        .unwrap()
        .map(|r| r.unwrap())
        .collect()
        .await;

    assert_eq!(responses.len(), 1);
    assert_eq!(responses[0].retries, 1);
    assert_eq!(responses[0].items.len(), 3);

    let bulks = calls_to(&cluster, Method::POST, "logs/_bulk");
    assert_eq!(bulks.len(), 2);
    let resent = String::from_utf8(bulks[1].body.as_ref().unwrap().to_vec()).unwrap();
    assert_eq!(resent, "{\"index\":{}}\n{\"n\":1}\n");
}

#[tokio::test(start_paused = true)]
async fn test_bulk_all_gives_up_after_back_off_retries() {
    let cluster = bulk_cluster(|_, documents| vec![429; documents]);
    let request = BulkAllRequest::new("logs", vec![json!({"n": 1})])
        .back_off_retries(1)
        .back_off_time(Duration::from_millis(10));

    let results: Vec<_> = cluster.transport().bulk_all(request).unwrap().collect().await;

    assert_eq!(results.len(), 1);
    assert!(matches!(
        results[0],
        Err(HelperError::BulkFailed { page: 1, retries: 1, .. })
    ));
    assert_eq!(calls_to(&cluster, Method::POST, "logs/_bulk").len(), 2);
}

#[tokio::test]
async fn test_bulk_all_fails_on_rejected_document() {
    let cluster = bulk_cluster(|_, documents| {
        let mut statuses = vec![201; documents];
        statuses[0] = 400;
        statuses
    });
    let request = BulkAllRequest::new("logs", (0..4).map(|n| json!({"n": n}))).size(2);

    let results: Vec<_> = cluster
        .transport()
        .bulk_all(request)
        .unwrap()
        .collect()
        .await;

    let error = results
        .iter()
        .find_map(|r| r.as_ref().err())
        .expect("session should fail");
    match error {
        HelperError::BulkFailed { retries, reason, .. } => {
            assert_eq!(*retries, 0);
            assert!(reason.contains("400"));
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(matches!(results.last(), Some(Err(_))));
}

#[tokio::test]
async fn test_bulk_all_refreshes_on_completion() {
    let cluster = bulk_cluster(all_created);
    let request = BulkAllRequest::new("logs", vec![json!({"n": 1})]).refresh_on_completed(true);

    let results: Vec<_> = cluster.transport().bulk_all(request).unwrap().collect().await;
    assert!(results.iter().all(|r| r.is_ok()));
    assert_eq!(calls_to(&cluster, Method::POST, "logs/_refresh").len(), 1);
}

#[tokio::test]
async fn test_bulk_all_custom_retry_predicate() {
    let cluster = bulk_cluster(|call, documents| {
        if call == 0 { vec![503; documents] } else { vec![201; documents] }
    });
    let request = BulkAllRequest::new("logs", vec![json!({"n": 1})])
        .back_off_retries(1)
        .back_off_time(Duration::from_millis(1))
        .retry_document(|item| item.status().status == 503);

    let responses: Vec<BulkAllResponse> = cluster
        .transport()
        .bulk_all(request)
        .unwrap()
        .map(|r| r.unwrap())
        .collect()
        .await;
    assert_eq!(responses[0].retries, 1);
}
