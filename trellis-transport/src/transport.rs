//! The transport: a pool, a connection and settings behind one handle.

use crate::clock::{DateTimeProvider, SystemClock};
use crate::config::TransportSettings;
use crate::connection::{Connection, HttpConnection};
use crate::error::Result;
use crate::meta::MetaHeader;
use crate::pipeline::{PipelineContext, RequestPipeline};
use crate::pool::ConnectionPool;
use crate::request::RequestConfig;
use crate::response::TransportResponse;
use bytes::Bytes;
use http::Method;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use tokio::sync::Mutex;

struct Inner {
    settings: TransportSettings,
    pool: Arc<dyn ConnectionPool>,
    connection: Arc<dyn Connection>,
    clock: Arc<dyn DateTimeProvider>,
    meta: MetaHeader,
    bootstrap: Mutex<()>,
}

/// Sends requests through a connection pool with pinging, sniffing and
/// failover. Cheap to clone.
#[derive(Clone)]
pub struct Transport {
    inner: Arc<Inner>,
}

impl Transport {
    /// Transport over `pool` using a reqwest connection.
    pub fn new(pool: Arc<dyn ConnectionPool>, settings: TransportSettings) -> Result<Self> {
        Self::builder(pool).settings(settings).build()
    }

    /// Start building a transport over `pool`.
    pub fn builder(pool: Arc<dyn ConnectionPool>) -> TransportBuilder {
        TransportBuilder {
            pool,
            settings: TransportSettings::default(),
            connection: None,
            clock: None,
        }
    }

    /// Transport settings.
    pub fn settings(&self) -> &TransportSettings {
        &self.inner.settings
    }

    /// The connection pool.
    pub fn pool(&self) -> &Arc<dyn ConnectionPool> {
        &self.inner.pool
    }

    /// The time source.
    pub fn clock(&self) -> &Arc<dyn DateTimeProvider> {
        &self.inner.clock
    }

    /// Send a request.
    pub async fn request(
        &self,
        method: Method,
        path: &str,
        body: Option<Bytes>,
        config: &RequestConfig,
    ) -> Result<TransportResponse> {
        let inner = self.inner.as_ref();
        let ctx = PipelineContext {
            settings: &inner.settings,
            pool: inner.pool.as_ref(),
            connection: inner.connection.as_ref(),
            clock: inner.clock.as_ref(),
            meta: &inner.meta,
            bootstrap: &inner.bootstrap,
        };
        RequestPipeline::new(ctx, config)
            .execute(method, path, body)
            .await
    }

    /// Send a GET request.
    pub async fn get(&self, path: &str) -> Result<TransportResponse> {
        self.request(Method::GET, path, None, &RequestConfig::default())
            .await
    }

    /// Send a HEAD request.
    pub async fn head(&self, path: &str) -> Result<TransportResponse> {
        self.request(Method::HEAD, path, None, &RequestConfig::default())
            .await
    }

    /// Send a DELETE request.
    pub async fn delete(&self, path: &str) -> Result<TransportResponse> {
        self.request(Method::DELETE, path, None, &RequestConfig::default())
            .await
    }

    /// Send a POST request with a JSON body.
    pub async fn post_json<T: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &T,
        config: &RequestConfig,
    ) -> Result<TransportResponse> {
        let body = Bytes::from(serde_json::to_vec(body)?);
        self.request(Method::POST, path, Some(body), config).await
    }

    /// Send a PUT request with a JSON body.
    pub async fn put_json<T: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &T,
        config: &RequestConfig,
    ) -> Result<TransportResponse> {
        let body = Bytes::from(serde_json::to_vec(body)?);
        self.request(Method::PUT, path, Some(body), config).await
    }
}

impl fmt::Debug for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transport")
            .field("settings", &self.inner.settings)
            .field("pool", &self.inner.pool)
            .field("connection", &self.inner.connection)
            .finish_non_exhaustive()
    }
}

/// Builder for [`Transport`].
pub struct TransportBuilder {
    pool: Arc<dyn ConnectionPool>,
    settings: TransportSettings,
    connection: Option<Arc<dyn Connection>>,
    clock: Option<Arc<dyn DateTimeProvider>>,
}

impl TransportBuilder {
    /// Set the transport settings.
    pub fn settings(mut self, settings: TransportSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Use `connection` instead of a reqwest connection.
    pub fn connection(mut self, connection: Arc<dyn Connection>) -> Self {
        self.connection = Some(connection);
        self
    }

    /// Use `clock` instead of the wall clock.
    pub fn clock(mut self, clock: Arc<dyn DateTimeProvider>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Build the transport.
    pub fn build(self) -> Result<Transport> {
        let connection: Arc<dyn Connection> = match self.connection {
            Some(connection) => connection,
            None => Arc::new(HttpConnection::new(&self.settings)?),
        };
        Ok(Transport {
            inner: Arc::new(Inner {
                settings: self.settings,
                pool: self.pool,
                connection,
                clock: self.clock.unwrap_or_else(|| Arc::new(SystemClock)),
                meta: MetaHeader::new(),
                bootstrap: Mutex::new(()),
            }),
        })
    }
}

impl fmt::Debug for TransportBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportBuilder")
            .field("settings", &self.settings)
            .field("pool", &self.pool)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::SingleNodePool;
    use url::Url;

    #[test]
    fn test_transport_builds_with_http_connection() {
        let pool = Arc::new(SingleNodePool::new(Url::parse("http://localhost:9200").unwrap()));
        let transport = Transport::new(pool, TransportSettings::default()).unwrap();
        assert_eq!(transport.pool().nodes().len(), 1);
        assert!(format!("{transport:?}").contains("Transport"));
    }
}
