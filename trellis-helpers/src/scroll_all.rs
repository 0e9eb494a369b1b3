//! Sliced scroll over a whole index.
//!
//! Each slice opens its own scroll and pages through it strictly in order;
//! slices run in parallel up to the configured degree of parallelism. Pages
//! are validated before they are emitted, and the first invalid page fails the
//! session and cancels every other slice.

use crate::backpressure::BackPressure;
use crate::error::{HelperError, Result};
use crate::stream::HelperStream;
use bytes::Bytes;
use futures::StreamExt;
use http::Method;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value, json};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use trellis_transport::{Helper, RequestConfig, Transport, TransportResponse};

/// Default scroll keep-alive.
pub const DEFAULT_SCROLL: &str = "1m";

/// Default number of hits per page and slice.
pub const DEFAULT_SCROLL_SIZE: usize = 1000;

/// Pages of a scroll-all session.
pub type ScrollAll<T> = HelperStream<ScrollAllPage<T>>;

/// One document of a page.
#[derive(Debug, Clone, Deserialize)]
#[serde(bound(deserialize = "T: DeserializeOwned"))]
pub struct Hit<T> {
    /// Index holding the document.
    #[serde(rename = "_index", default)]
    pub index: String,
    /// Document id.
    #[serde(rename = "_id", default)]
    pub id: Option<String>,
    /// Relevance score; usually absent when sorting by `_doc`.
    #[serde(rename = "_score", default)]
    pub score: Option<f64>,
    /// Routing value, if the document was routed.
    #[serde(rename = "_routing", default)]
    pub routing: Option<String>,
    /// Document body, unless `_source` was disabled.
    #[serde(rename = "_source", default)]
    pub source: Option<T>,
    /// Sort values.
    #[serde(default)]
    pub sort: Vec<Value>,
}

/// A page emitted by one slice.
#[derive(Debug, Clone)]
pub struct ScrollAllPage<T> {
    /// Slice id, `0..slices`.
    pub slice: usize,
    /// Page number within the slice, starting at 1.
    pub page: usize,
    /// Documents on the page.
    pub hits: Vec<Hit<T>>,
}

#[derive(Debug, Deserialize)]
#[serde(bound(deserialize = "T: DeserializeOwned"))]
struct SearchPage<T> {
    #[serde(rename = "_scroll_id", default)]
    scroll_id: Option<String>,
    hits: HitsEnvelope<T>,
}

#[derive(Debug, Deserialize)]
#[serde(bound(deserialize = "T: DeserializeOwned"))]
struct HitsEnvelope<T> {
    #[serde(default = "Vec::new")]
    hits: Vec<Hit<T>>,
}

/// What to scroll and how.
///
/// ```
/// use serde_json::json;
/// use trellis_helpers::ScrollAllRequest;
///
/// let request = ScrollAllRequest::new("logs", 4)
///     .max_degree_of_parallelism(2)
///     .scroll("30s")
///     .size(500)
///     .search(json!({"query": {"term": {"level": "error"}}}));
/// assert_eq!(request.parallelism(), 2);
/// ```
#[derive(Debug, Clone)]
pub struct ScrollAllRequest {
    index: String,
    slices: usize,
    max_degree_of_parallelism: Option<usize>,
    scroll: String,
    size: usize,
    routing_field: Option<String>,
    search: Value,
    back_pressure: Option<Arc<BackPressure>>,
    config: RequestConfig,
}

impl ScrollAllRequest {
    /// Scroll `index` in `slices` slices.
    pub fn new(index: impl Into<String>, slices: usize) -> Self {
        Self {
            index: index.into(),
            slices,
            max_degree_of_parallelism: None,
            scroll: DEFAULT_SCROLL.to_string(),
            size: DEFAULT_SCROLL_SIZE,
            routing_field: None,
            search: Value::Null,
            back_pressure: None,
            config: RequestConfig::default(),
        }
    }

    /// Slices fetched at the same time. Defaults to all of them; capped at
    /// the slice count.
    pub fn max_degree_of_parallelism(mut self, parallelism: usize) -> Self {
        self.max_degree_of_parallelism = Some(parallelism);
        self
    }

    /// Scroll keep-alive, e.g. `"1m"`.
    pub fn scroll(mut self, keep_alive: impl Into<String>) -> Self {
        self.scroll = keep_alive.into();
        self
    }

    /// Hits per page and slice.
    pub fn size(mut self, size: usize) -> Self {
        self.size = size;
        self
    }

    /// Field used to split slices instead of `_id`.
    pub fn routing_field(mut self, field: impl Into<String>) -> Self {
        self.routing_field = Some(field.into());
        self
    }

    /// Search body template (query, `_source` filters, ...). The slice, size
    /// and sort are filled in per slice.
    pub fn search(mut self, search: Value) -> Self {
        self.search = search;
        self
    }

    /// Pace emission with `back_pressure`.
    pub fn back_pressure(mut self, back_pressure: Arc<BackPressure>) -> Self {
        self.back_pressure = Some(back_pressure);
        self
    }

    /// Overrides for every request of the session. Its cancellation token,
    /// if any, cancels the whole session.
    pub fn request_config(mut self, config: RequestConfig) -> Self {
        self.config = config;
        self
    }

    /// Slices fetched at the same time.
    pub fn parallelism(&self) -> usize {
        self.max_degree_of_parallelism
            .unwrap_or(self.slices)
            .clamp(1, self.slices.max(1))
    }

    fn template(&self) -> Result<Map<String, Value>> {
        if self.index.is_empty() {
            return Err(HelperError::InvalidRequest("index must not be empty".to_string()));
        }
        if self.slices == 0 {
            return Err(HelperError::InvalidRequest("slices must be at least 1".to_string()));
        }
        if self.size == 0 {
            return Err(HelperError::InvalidRequest("size must be at least 1".to_string()));
        }
        match &self.search {
            Value::Null => Ok(Map::new()),
            Value::Object(map) => Ok(map.clone()),
            other => Err(HelperError::InvalidRequest(format!(
                "search template must be a JSON object, got {other}"
            ))),
        }
    }
}

/// Start a scroll-all session. Pages arrive on the returned stream; dropping
/// it stops the session.
///
/// Must be called within a Tokio runtime.
pub fn scroll_all<T>(transport: &Transport, request: ScrollAllRequest) -> Result<ScrollAll<T>>
where
    T: DeserializeOwned + Send + 'static,
{
    let template = request.template()?;
    let token = request
        .config
        .cancellation
        .as_ref()
        .map(CancellationToken::child_token)
        .unwrap_or_default();
    let parallelism = request.parallelism();
    let (sender, receiver) = mpsc::channel(parallelism * 2);

    info!(
        index = %request.index,
        slices = request.slices,
        parallelism,
        "Starting scroll all"
    );

    let session = Arc::new(ScrollSession {
        transport: transport.clone(),
        template: Mutex::new(template),
        token: token.clone(),
        failed: AtomicBool::new(false),
        request,
    });
    tokio::spawn(session.run::<T>(parallelism, sender));

    Ok(HelperStream::new(receiver, token))
}

type PageSender<T> = mpsc::Sender<Result<ScrollAllPage<T>>>;

struct ScrollSession {
    transport: Transport,
    request: ScrollAllRequest,
    template: Mutex<Map<String, Value>>,
    token: CancellationToken,
    failed: AtomicBool,
}

impl ScrollSession {
    async fn run<T>(self: Arc<Self>, parallelism: usize, sender: PageSender<T>)
    where
        T: DeserializeOwned + Send + 'static,
    {
        futures::stream::iter(0..self.request.slices)
            .for_each_concurrent(parallelism, |slice| {
                let session = Arc::clone(&self);
                let sender = sender.clone();
                async move { session.scroll_slice(slice, &sender).await }
            })
            .await;

        if self.failed.load(Ordering::SeqCst) {
            return;
        }
        if self.token.is_cancelled() {
            debug!(index = %self.request.index, "Scroll all cancelled");
            let _ = sender.send(Err(HelperError::Cancelled)).await;
        } else {
            info!(index = %self.request.index, "Scroll all complete");
        }
    }

    async fn fail<T>(&self, error: HelperError, sender: &PageSender<T>) {
        if error.is_cancelled() && self.token.is_cancelled() {
            return;
        }
        if self.failed.swap(true, Ordering::SeqCst) {
            return;
        }
        warn!(error = %error, "Scroll all failed, cancelling remaining slices");
        self.token.cancel();
        let _ = sender.send(Err(error)).await;
    }

    /// Drain one slice, then clear its scroll ids. A failure cancels the
    /// sibling slices before any cleanup request is sent.
    async fn scroll_slice<T>(&self, slice: usize, sender: &PageSender<T>)
    where
        T: DeserializeOwned,
    {
        let mut scroll_ids = Vec::new();
        if let Err(error) = self.drain_slice(slice, sender, &mut scroll_ids).await {
            self.fail(error, sender).await;
        }
        self.clear_scroll(slice, scroll_ids).await;
    }

    async fn drain_slice<T>(
        &self,
        slice: usize,
        sender: &PageSender<T>,
        scroll_ids: &mut Vec<String>,
    ) -> Result<()>
    where
        T: DeserializeOwned,
    {
        let mut page = 1;
        let mut current = self.initiate::<T>(slice).await?;

        loop {
            if let Some(id) = &current.scroll_id
                && !scroll_ids.contains(id)
            {
                scroll_ids.push(id.clone());
            }
            if current.hits.hits.is_empty() {
                debug!(slice, pages = page - 1, "Scroll slice complete");
                return Ok(());
            }
            let scroll_id = current.scroll_id.ok_or_else(|| HelperError::ScrollFailed {
                slice,
                page,
                reason: "response carries no scroll id".to_string(),
            })?;

            if let Some(back_pressure) = &self.request.back_pressure {
                back_pressure.wait(&self.token).await?;
            }
            if self.token.is_cancelled() {
                return Err(HelperError::Cancelled);
            }
            let emitted = ScrollAllPage {
                slice,
                page,
                hits: current.hits.hits,
            };
            if sender.send(Ok(emitted)).await.is_err() {
                self.token.cancel();
                return Err(HelperError::Cancelled);
            }

            page += 1;
            current = self.next_page(slice, page, &scroll_id).await?;
        }
    }

    async fn initiate<T>(&self, slice: usize) -> Result<SearchPage<T>>
    where
        T: DeserializeOwned,
    {
        let request = &self.request;
        let mut template = self.template.lock().await;
        if request.slices > 1 {
            let mut slicing = json!({"id": slice, "max": request.slices});
            if let Some(field) = &request.routing_field {
                slicing["field"] = json!(field);
            }
            template.insert("slice".to_string(), slicing);
        }
        template.insert("size".to_string(), json!(request.size));
        template
            .entry("sort")
            .or_insert_with(|| json!(["_doc"]));

        let body = Bytes::from(serde_json::to_vec(&*template)?);
        let path = format!("{}/_search?scroll={}", request.index, request.scroll);
        debug!(slice, path = %path, "Opening scroll");
        let result = self
            .transport
            .request(Method::POST, &path, Some(body), &self.config())
            .await;
        drop(template);

        self.page(slice, 1, result)
    }

    async fn next_page<T>(&self, slice: usize, page: usize, scroll_id: &str) -> Result<SearchPage<T>>
    where
        T: DeserializeOwned,
    {
        let body = json!({"scroll": self.request.scroll, "scroll_id": scroll_id});
        let body = Bytes::from(serde_json::to_vec(&body)?);
        let result = self
            .transport
            .request(Method::POST, "_search/scroll", Some(body), &self.config())
            .await;
        self.page(slice, page, result)
    }

    fn page<T>(
        &self,
        slice: usize,
        page: usize,
        result: trellis_transport::Result<TransportResponse>,
    ) -> Result<SearchPage<T>>
    where
        T: DeserializeOwned,
    {
        let response = match result {
            Ok(response) => response,
            Err(e) if e.is_cancelled() => return Err(HelperError::Cancelled),
            Err(e) => return Err(e.into()),
        };
        if !response.is_valid() {
            let reason = match response.original_error() {
                Some(error) => error.to_string(),
                None => format!("unsuccessful response {:?}", response.status()),
            };
            return Err(HelperError::ScrollFailed { slice, page, reason });
        }
        serde_json::from_slice(response.body()).map_err(|e| HelperError::ScrollFailed {
            slice,
            page,
            reason: format!("unparseable page: {e}"),
        })
    }

    async fn clear_scroll(&self, slice: usize, scroll_ids: Vec<String>) {
        if scroll_ids.is_empty() {
            return;
        }
        let mut config = self
            .request
            .config
            .clone()
            .with_helper(Helper::Scroll)
            .with_throw_exceptions(false);
        config.cancellation = None;

        let body = match serde_json::to_vec(&json!({"scroll_id": scroll_ids})) {
            Ok(body) => Bytes::from(body),
            Err(e) => {
                warn!(slice, error = %e, "Failed to encode clear scroll request");
                return;
            }
        };
        match self
            .transport
            .request(Method::DELETE, "_search/scroll", Some(body), &config)
            .await
        {
            Ok(response) if response.is_valid() => debug!(slice, "Cleared scroll"),
            Ok(response) => warn!(slice, status = ?response.status(), "Failed to clear scroll"),
            Err(e) => warn!(slice, error = %e, "Failed to clear scroll"),
        }
    }

    fn config(&self) -> RequestConfig {
        self.request
            .config
            .clone()
            .with_helper(Helper::Scroll)
            .with_cancellation(self.token.clone())
            .with_throw_exceptions(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Deserialize, PartialEq)]
    struct Log {
        message: String,
    }

    #[test]
    fn test_parallelism_is_capped_by_slices() {
        assert_eq!(ScrollAllRequest::new("logs", 3).parallelism(), 3);
        assert_eq!(
            ScrollAllRequest::new("logs", 3)
                .max_degree_of_parallelism(8)
                .parallelism(),
            3
        );
        assert_eq!(
            ScrollAllRequest::new("logs", 3)
                .max_degree_of_parallelism(0)
                .parallelism(),
            1
        );
    }

    #[test]
    fn test_invalid_requests() {
        assert!(ScrollAllRequest::new("", 2).template().is_err());
        assert!(ScrollAllRequest::new("logs", 0).template().is_err());
        assert!(ScrollAllRequest::new("logs", 2).size(0).template().is_err());
        assert!(
            ScrollAllRequest::new("logs", 2)
                .search(json!(["not", "an", "object"]))
                .template()
                .is_err()
        );
        let template = ScrollAllRequest::new("logs", 2)
            .search(json!({"query": {"match_all": {}}}))
            .template()
            .unwrap();
        assert!(template.contains_key("query"));
    }

    #[test]
    fn test_search_page_decoding() {
        let body = json!({
            "_scroll_id": "abc",
            "hits": {
                "total": {"value": 2, "relation": "eq"},
                "hits": [
                    {"_index": "logs", "_id": "1", "_score": null, "_source": {"message": "a"}, "sort": [0]},
                    {"_index": "logs", "_id": "2", "_source": {"message": "b"}}
                ]
            }
        });
        let page: SearchPage<Log> = serde_json::from_value(body).unwrap();
        assert_eq!(page.scroll_id.as_deref(), Some("abc"));
        assert_eq!(page.hits.hits.len(), 2);
        assert_eq!(
            page.hits.hits[1].source,
            Some(Log {
                message: "b".to_string()
            })
        );
        assert_eq!(page.hits.hits[0].sort, vec![json!(0)]);
    }
}
