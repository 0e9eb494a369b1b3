//! Index a document source in parallel bulk requests.
//!
//! Documents are pulled lazily in batches; up to the configured degree of
//! parallelism bulk requests are in flight at once. Documents the cluster
//! rejects with a retryable status (429 by default) are resent after a fixed
//! back-off. A page that still fails, or a bulk call that fails outright, fails
//! the session and cancels the pages in flight.

use crate::backpressure::BackPressure;
use crate::error::{HelperError, Result};
use crate::stream::HelperStream;
use bytes::Bytes;
use futures::StreamExt;
use http::{Method, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use trellis_transport::{Helper, RequestConfig, Transport, TransportResponse};

/// Default documents per bulk request.
pub const DEFAULT_BULK_SIZE: usize = 1000;

/// Default bulk requests in flight.
pub const DEFAULT_BULK_PARALLELISM: usize = 4;

/// Default wait before resending rejected documents.
pub const DEFAULT_BACK_OFF_TIME: Duration = Duration::from_secs(60);

const NDJSON: &str = "application/x-ndjson";

/// Responses of a bulk-all session, one per indexed page.
pub type BulkAll = HelperStream<BulkAllResponse>;

/// Decides whether a rejected document is sent again.
pub type RetryDocumentPredicate = Arc<dyn Fn(&BulkResponseItem) -> bool + Send + Sync>;

/// Derives a document id; `None` lets the cluster pick one.
pub type DocumentIdFn<D> = Arc<dyn Fn(&D) -> Option<String> + Send + Sync>;

/// Item of a bulk response, keyed by operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BulkResponseItem {
    /// Index result.
    Index(BulkItemStatus),
    /// Create result.
    Create(BulkItemStatus),
    /// Update result.
    Update(BulkItemStatus),
    /// Delete result.
    Delete(BulkItemStatus),
}

impl BulkResponseItem {
    /// Outcome of the operation.
    pub fn status(&self) -> &BulkItemStatus {
        match self {
            Self::Index(s) | Self::Create(s) | Self::Update(s) | Self::Delete(s) => s,
        }
    }

    /// Operation name.
    pub fn operation(&self) -> &'static str {
        match self {
            Self::Index(_) => "index",
            Self::Create(_) => "create",
            Self::Update(_) => "update",
            Self::Delete(_) => "delete",
        }
    }
}

/// Outcome of one bulk operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BulkItemStatus {
    /// Index name.
    #[serde(rename = "_index", default)]
    pub index: String,
    /// Document id.
    #[serde(rename = "_id", default)]
    pub id: Option<String>,
    /// Document version.
    #[serde(rename = "_version", default)]
    pub version: Option<i64>,
    /// Result, e.g. `created`.
    #[serde(default)]
    pub result: Option<String>,
    /// HTTP status of the operation.
    pub status: u16,
    /// Failure details.
    #[serde(default)]
    pub error: Option<BulkItemError>,
}

impl BulkItemStatus {
    /// Check if the operation succeeded.
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Failure details of one bulk operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BulkItemError {
    /// Error type.
    #[serde(rename = "type")]
    pub error_type: String,
    /// Error reason.
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct BulkResponse {
    #[serde(default)]
    items: Vec<BulkResponseItem>,
}

/// A page that made it into the index.
#[derive(Debug, Clone)]
pub struct BulkAllResponse {
    /// Page number, starting at 1. Pages may complete out of order.
    pub page: usize,
    /// Back-off retries spent on the page.
    pub retries: usize,
    /// Item results for every document of the page.
    pub items: Vec<BulkResponseItem>,
}

/// What to index and how.
///
/// ```
/// use std::time::Duration;
/// use trellis_helpers::BulkAllRequest;
///
/// let request = BulkAllRequest::new("logs", (0..10_000).map(|i| serde_json::json!({"n": i})))
///     .size(500)
///     .max_degree_of_parallelism(2)
///     .back_off_retries(3)
///     .back_off_time(Duration::from_secs(5))
///     .refresh_on_completed(true);
/// ```
pub struct BulkAllRequest<D> {
    index: String,
    documents: Box<dyn Iterator<Item = D> + Send>,
    size: usize,
    max_degree_of_parallelism: usize,
    back_off_retries: usize,
    back_off_time: Duration,
    refresh_on_completed: bool,
    retry_document: RetryDocumentPredicate,
    document_id: Option<DocumentIdFn<D>>,
    back_pressure: Option<Arc<BackPressure>>,
    config: RequestConfig,
}

impl<D> BulkAllRequest<D> {
    /// Index `documents` into `index`.
    pub fn new<I>(index: impl Into<String>, documents: I) -> Self
    where
        I: IntoIterator<Item = D>,
        I::IntoIter: Send + 'static,
    {
        Self {
            index: index.into(),
            documents: Box::new(documents.into_iter()),
            size: DEFAULT_BULK_SIZE,
            max_degree_of_parallelism: DEFAULT_BULK_PARALLELISM,
            back_off_retries: 0,
            back_off_time: DEFAULT_BACK_OFF_TIME,
            refresh_on_completed: false,
            retry_document: Arc::new(|item: &BulkResponseItem| {
                item.status().status == StatusCode::TOO_MANY_REQUESTS.as_u16()
            }),
            document_id: None,
            back_pressure: None,
            config: RequestConfig::default(),
        }
    }

    /// Documents per bulk request.
    pub fn size(mut self, size: usize) -> Self {
        self.size = size;
        self
    }

    /// Bulk requests in flight.
    pub fn max_degree_of_parallelism(mut self, parallelism: usize) -> Self {
        self.max_degree_of_parallelism = parallelism;
        self
    }

    /// Times rejected documents of a page are resent.
    pub fn back_off_retries(mut self, retries: usize) -> Self {
        self.back_off_retries = retries;
        self
    }

    /// Wait before resending rejected documents.
    pub fn back_off_time(mut self, time: Duration) -> Self {
        self.back_off_time = time;
        self
    }

    /// Refresh the index once every page is in.
    pub fn refresh_on_completed(mut self, refresh: bool) -> Self {
        self.refresh_on_completed = refresh;
        self
    }

    /// Decide which rejected documents are resent.
    pub fn retry_document<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&BulkResponseItem) -> bool + Send + Sync + 'static,
    {
        self.retry_document = Arc::new(predicate);
        self
    }

    /// Derive document ids.
    pub fn document_id<F>(mut self, id: F) -> Self
    where
        F: Fn(&D) -> Option<String> + Send + Sync + 'static,
    {
        self.document_id = Some(Arc::new(id));
        self
    }

    /// Pace page dispatch with `back_pressure`.
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

    fn validate(&self) -> Result<()> {
        if self.index.is_empty() {
            return Err(HelperError::InvalidRequest("index must not be empty".to_string()));
        }
        if self.size == 0 {
            return Err(HelperError::InvalidRequest("size must be at least 1".to_string()));
        }
        if self.max_degree_of_parallelism == 0 {
            return Err(HelperError::InvalidRequest(
                "max_degree_of_parallelism must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

impl<D> fmt::Debug for BulkAllRequest<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BulkAllRequest")
            .field("index", &self.index)
            .field("size", &self.size)
            .field("max_degree_of_parallelism", &self.max_degree_of_parallelism)
            .field("back_off_retries", &self.back_off_retries)
            .field("back_off_time", &self.back_off_time)
            .field("refresh_on_completed", &self.refresh_on_completed)
            .finish_non_exhaustive()
    }
}

/// Start a bulk-all session. Indexed pages arrive on the returned stream;
/// dropping it stops the session.
///
/// Must be called within a Tokio runtime.
pub fn bulk_all<D>(transport: &Transport, request: BulkAllRequest<D>) -> Result<BulkAll>
where
    D: Serialize + Send + 'static,
{
    request.validate()?;
    let token = request
        .config
        .cancellation
        .as_ref()
        .map(CancellationToken::child_token)
        .unwrap_or_default();
    let (sender, receiver) = mpsc::channel(request.max_degree_of_parallelism * 2);

    info!(
        index = %request.index,
        size = request.size,
        parallelism = request.max_degree_of_parallelism,
        "Starting bulk all"
    );

    let base = request
        .config
        .clone()
        .with_helper(Helper::Bulk)
        .with_cancellation(token.clone())
        .with_throw_exceptions(false);
    let session = Arc::new(BulkSession {
        transport: transport.clone(),
        path: format!("{}/_bulk", request.index),
        back_off_retries: request.back_off_retries,
        back_off_time: request.back_off_time,
        retry_document: request.retry_document,
        back_pressure: request.back_pressure,
        bulk_config: base.clone().with_header("content-type", NDJSON),
        base_config: base,
        token: token.clone(),
    });
    let batches = Batches {
        documents: request.documents,
        size: request.size,
        document_id: request.document_id,
    };
    let finish = Finish {
        index: request.index,
        refresh: request.refresh_on_completed,
    };
    tokio::spawn(session.run(batches, request.max_degree_of_parallelism, finish, sender));

    Ok(HelperStream::new(receiver, token))
}

/// A document serialized as a bulk action and source line.
#[derive(Debug, Clone)]
struct BulkLine {
    action: String,
    source: String,
}

impl BulkLine {
    fn index<D: Serialize>(document: &D, id: Option<String>) -> Result<Self> {
        let action = match id {
            Some(id) => json!({"index": {"_id": id}}),
            None => json!({"index": {}}),
        };
        Ok(Self {
            action: action.to_string(),
            source: serde_json::to_string(document)?,
        })
    }
}

fn ndjson(lines: &[BulkLine]) -> Bytes {
    let mut body = String::new();
    for line in lines {
        body.push_str(&line.action);
        body.push('\n');
        body.push_str(&line.source);
        body.push('\n');
    }
    Bytes::from(body)
}

struct Batches<D> {
    documents: Box<dyn Iterator<Item = D> + Send>,
    size: usize,
    document_id: Option<DocumentIdFn<D>>,
}

impl<D: Serialize> Iterator for Batches<D> {
    type Item = Result<Vec<BulkLine>>;

    fn next(&mut self) -> Option<Self::Item> {
        let batch: Vec<D> = (&mut self.documents).take(self.size).collect();
        if batch.is_empty() {
            return None;
        }
        Some(
            batch
                .iter()
                .map(|doc| {
                    let id = self.document_id.as_ref().and_then(|id| id(doc));
                    BulkLine::index(doc, id)
                })
                .collect(),
        )
    }
}

struct Finish {
    index: String,
    refresh: bool,
}

struct BulkSession {
    transport: Transport,
    path: String,
    back_off_retries: usize,
    back_off_time: Duration,
    retry_document: RetryDocumentPredicate,
    back_pressure: Option<Arc<BackPressure>>,
    base_config: RequestConfig,
    bulk_config: RequestConfig,
    token: CancellationToken,
}

impl BulkSession {
    async fn run<D>(
        self: Arc<Self>,
        batches: Batches<D>,
        parallelism: usize,
        finish: Finish,
        sender: mpsc::Sender<Result<BulkAllResponse>>,
    ) where
        D: Serialize + Send + 'static,
    {
        let mut pages = futures::stream::iter(batches.enumerate())
            .map(|(index, batch)| {
                let session = Arc::clone(&self);
                async move { session.index_page(index + 1, batch?).await }
            })
            .buffer_unordered(parallelism);

        let mut outcome = Ok(0usize);
        while let Some(result) = pages.next().await {
            match result {
                Ok(response) => {
                    if sender.send(Ok(response)).await.is_err() {
                        self.token.cancel();
                        return;
                    }
                    outcome = outcome.map(|indexed| indexed + 1);
                }
                Err(error) => {
                    outcome = Err(error);
                    break;
                }
            }
        }
        drop(pages);

        let error = match outcome {
            Ok(_) if self.token.is_cancelled() => HelperError::Cancelled,
            Ok(indexed) => {
                if finish.refresh
                    && let Err(error) = self.refresh(&finish.index).await
                {
                    let _ = sender.send(Err(error)).await;
                    return;
                }
                info!(index = %finish.index, pages = indexed, "Bulk all complete");
                return;
            }
            Err(error) if error.is_cancelled() && self.token.is_cancelled() => {
                HelperError::Cancelled
            }
            Err(error) => {
                warn!(error = %error, "Bulk all failed, cancelling pages in flight");
                self.token.cancel();
                error
            }
        };
        let _ = sender.send(Err(error)).await;
    }

    async fn index_page(&self, page: usize, mut pending: Vec<BulkLine>) -> Result<BulkAllResponse> {
        if let Some(back_pressure) = &self.back_pressure {
            back_pressure.wait(&self.token).await?;
        }

        let mut retries = 0;
        let mut items = Vec::with_capacity(pending.len());
        loop {
            let response = self.send(&pending).await?;
            if !response.is_valid() {
                if response.status() == Some(StatusCode::TOO_MANY_REQUESTS)
                    && retries < self.back_off_retries
                {
                    retries += 1;
                    warn!(page, retries, "Bulk request rejected, backing off");
                    self.back_off().await?;
                    continue;
                }
                return Err(HelperError::BulkFailed {
                    page,
                    retries,
                    reason: describe(&response),
                });
            }

            let bulk: BulkResponse =
                serde_json::from_slice(response.body()).map_err(|e| HelperError::BulkFailed {
                    page,
                    retries,
                    reason: format!("unparseable bulk response: {e}"),
                })?;
            if bulk.items.len() != pending.len() {
                return Err(HelperError::BulkFailed {
                    page,
                    retries,
                    reason: format!(
                        "sent {} documents but got {} items back",
                        pending.len(),
                        bulk.items.len()
                    ),
                });
            }

            let mut retry = Vec::new();
            for (item, line) in bulk.items.into_iter().zip(pending) {
                if item.status().is_success() {
                    items.push(item);
                } else if (self.retry_document)(&item) {
                    retry.push(line);
                } else {
                    return Err(HelperError::BulkFailed {
                        page,
                        retries,
                        reason: describe_item(&item),
                    });
                }
            }

            if retry.is_empty() {
                debug!(page, retries, documents = items.len(), "Bulk page indexed");
                return Ok(BulkAllResponse {
                    page,
                    retries,
                    items,
                });
            }
            if retries >= self.back_off_retries {
                return Err(HelperError::BulkFailed {
                    page,
                    retries,
                    reason: format!("{} documents still rejected", retry.len()),
                });
            }
            retries += 1;
            warn!(page, retries, documents = retry.len(), "Resending rejected documents");
            self.back_off().await?;
            pending = retry;
        }
    }

    async fn send(&self, lines: &[BulkLine]) -> Result<TransportResponse> {
        match self
            .transport
            .request(Method::POST, &self.path, Some(ndjson(lines)), &self.bulk_config)
            .await
        {
            Ok(response) => Ok(response),
            Err(e) if e.is_cancelled() => Err(HelperError::Cancelled),
            Err(e) => Err(e.into()),
        }
    }

    async fn back_off(&self) -> Result<()> {
        tokio::select! {
            biased;
            _ = self.token.cancelled() => Err(HelperError::Cancelled),
            _ = tokio::time::sleep(self.back_off_time) => Ok(()),
        }
    }

    async fn refresh(&self, index: &str) -> Result<()> {
        let config = self.base_config.clone().with_throw_exceptions(true);
        self.transport
            .request(Method::POST, &format!("{index}/_refresh"), None, &config)
            .await?;
        debug!(index, "Refreshed after bulk all");
        Ok(())
    }
}

fn describe(response: &TransportResponse) -> String {
    match response.original_error() {
        Some(error) => error.to_string(),
        None => format!("unsuccessful response {:?}", response.status()),
    }
}

fn describe_item(item: &BulkResponseItem) -> String {
    let status = item.status();
    match &status.error {
        Some(error) => format!(
            "{} of {:?} failed with {}: {} ({})",
            item.operation(),
            status.id,
            status.status,
            error.error_type,
            error.reason.as_deref().unwrap_or("no reason given")
        ),
        None => format!("{} of {:?} failed with {}", item.operation(), status.id, status.status),
    }
}
