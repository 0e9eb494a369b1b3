//! The HTTP seam between the pipeline and the network.

use crate::config::TransportSettings;
use crate::error::ConnectionError;
use async_trait::async_trait;
use base64::Engine;
use bytes::Bytes;
use flate2::Compression;
use flate2::write::GzEncoder;
use http::header::{AUTHORIZATION, CONTENT_ENCODING, HeaderValue};
use http::{HeaderMap, Method, StatusCode};
use std::fmt;
use std::io::Write;
use std::time::Duration;
use tracing::debug;
use url::Url;

/// What a request is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestKind {
    /// Liveness check.
    Ping,
    /// Cluster state discovery.
    Sniff,
    /// API call.
    Call,
}

/// Everything needed to send one request to one node.
#[derive(Debug, Clone)]
pub struct RequestData {
    /// HTTP method.
    pub method: Method,
    /// Target node.
    pub node: Url,
    /// Path and query, relative to the node.
    pub path: String,
    /// Request headers.
    pub headers: HeaderMap,
    /// Request body.
    pub body: Option<Bytes>,
    /// Timeout for this round trip.
    pub request_timeout: Duration,
    /// Gzip the body.
    pub http_compression: bool,
    /// Basic authentication credentials.
    pub basic_auth: Option<(String, String)>,
    /// What the request is for.
    pub kind: RequestKind,
}

impl RequestData {
    /// Absolute request URI.
    pub fn uri(&self) -> Result<Url, ConnectionError> {
        self.node
            .join(self.path.trim_start_matches('/'))
            .map_err(|e| ConnectionError::Other(format!("invalid path '{}': {e}", self.path)))
    }
}

/// Raw response of one round trip.
#[derive(Debug, Clone)]
pub struct ConnectionResponse {
    /// HTTP status.
    pub status: StatusCode,
    /// Response headers.
    pub headers: HeaderMap,
    /// Response body, decompressed.
    pub body: Bytes,
}

impl ConnectionResponse {
    /// Response with an empty body and no headers.
    pub fn status(status: StatusCode) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            body: Bytes::new(),
        }
    }
}

/// Sends a single request to a single node. Retries and failover live above
/// this trait.
#[async_trait]
pub trait Connection: Send + Sync + fmt::Debug {
    /// Perform one round trip.
    async fn request(&self, request: &RequestData) -> Result<ConnectionResponse, ConnectionError>;
}

/// [`Connection`] over a pooled reqwest client.
#[derive(Debug, Clone)]
pub struct HttpConnection {
    inner: reqwest::Client,
}

impl HttpConnection {
    /// Build the underlying HTTP client from `settings`.
    pub fn new(settings: &TransportSettings) -> Result<Self, reqwest::Error> {
        let inner = reqwest::Client::builder()
            .connect_timeout(settings.connect_timeout)
            .pool_idle_timeout(settings.pool_idle_timeout)
            .pool_max_idle_per_host(settings.pool_max_idle_per_host)
            .user_agent(&settings.user_agent)
            .gzip(true)
            .brotli(true)
            .redirect(reqwest::redirect::Policy::none())
            .build()?;
        Ok(Self { inner })
    }

    /// Get the underlying reqwest client.
    pub fn inner(&self) -> &reqwest::Client {
        &self.inner
    }
}

#[async_trait]
impl Connection for HttpConnection {
    async fn request(&self, request: &RequestData) -> Result<ConnectionResponse, ConnectionError> {
        let uri = request.uri()?;
        let mut headers = request.headers.clone();

        if let Some((username, password)) = &request.basic_auth {
            let encoded = base64::engine::general_purpose::STANDARD
                .encode(format!("{username}:{password}"));
            let value = HeaderValue::try_from(format!("Basic {encoded}"))
                .map_err(|e| ConnectionError::Other(e.to_string()))?;
            headers.insert(AUTHORIZATION, value);
        }

        let body = match &request.body {
            Some(body) if request.http_compression => {
                headers.insert(CONTENT_ENCODING, HeaderValue::from_static("gzip"));
                Some(gzip(body)?)
            }
            Some(body) => Some(body.clone()),
            None => None,
        };

        debug!(method = %request.method, uri = %uri, kind = ?request.kind, "Sending request");

        let mut builder = self
            .inner
            .request(request.method.clone(), uri)
            .headers(headers)
            .timeout(request.request_timeout);
        if let Some(body) = body {
            builder = builder.body(body);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| classify(e, request.request_timeout))?;
        let status = response.status();
        let headers = response.headers().clone();
        let body = response
            .bytes()
            .await
            .map_err(|e| classify(e, request.request_timeout))?;

        Ok(ConnectionResponse {
            status,
            headers,
            body,
        })
    }
}

fn gzip(body: &[u8]) -> Result<Bytes, ConnectionError> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(body)
        .and_then(|_| encoder.finish())
        .map(Bytes::from)
        .map_err(|e| ConnectionError::Other(format!("failed to compress request body: {e}")))
}

fn classify(error: reqwest::Error, timeout: Duration) -> ConnectionError {
    if error.is_timeout() {
        ConnectionError::Timeout(timeout)
    } else if error.is_connect() {
        ConnectionError::Connect(error.to_string())
    } else {
        ConnectionError::Other(error.to_string())
    }
}
