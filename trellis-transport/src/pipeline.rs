//! The per-request state machine: node selection, pings, sniffs, calls and
//! failover.

use crate::audit::{Audit, AuditEvent};
use crate::clock::{DateTimeProvider, saturating_add, to_chrono};
use crate::config::{DEFAULT_PING_TIMEOUT, DEFAULT_PING_TIMEOUT_TLS, TransportSettings};
use crate::connection::{Connection, ConnectionResponse, RequestData, RequestKind};
use crate::error::{ConnectionError, PipelineError, PipelineFailure, Result, TransportError};
use crate::meta::{META_HEADER_NAME, MetaHeader};
use crate::node::Node;
use crate::pool::{ConnectionPool, NodeView};
use crate::request::{OPAQUE_ID_HEADER, RequestConfig};
use crate::response::{ApiCallDetails, TransportResponse, deprecation_warnings};
use crate::sniff::{parse_nodes, sniff_path};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use http::header::{CONTENT_TYPE, HeaderName, HeaderValue};
use http::{HeaderMap, Method, StatusCode};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use url::Url;

/// Most times one request may restart node selection after a reseed.
pub const MAX_VIEW_REFRESHES: usize = 100;

/// Share of the retry timeout after which no new attempt is started.
const TIMEOUT_HEADROOM: f64 = 0.98;

/// Shared pieces a pipeline borrows from its transport.
pub(crate) struct PipelineContext<'a> {
    pub settings: &'a TransportSettings,
    pub pool: &'a dyn ConnectionPool,
    pub connection: &'a dyn Connection,
    pub clock: &'a dyn DateTimeProvider,
    pub meta: &'a MetaHeader,
    pub bootstrap: &'a Mutex<()>,
}

/// Result of one call attempt against one node.
enum Attempt {
    /// Successful call.
    Success(ConnectionResponse),
    /// The node answered but the call cannot succeed anywhere.
    Known(ConnectionResponse),
    /// The call failed on this node and may succeed on another.
    Retryable {
        error: PipelineError,
        response: Option<ConnectionResponse>,
    },
    /// The call must not be retried.
    Fatal {
        error: PipelineError,
        response: Option<ConnectionResponse>,
    },
}

/// Drives a single request through the pool.
pub(crate) struct RequestPipeline<'a> {
    ctx: PipelineContext<'a>,
    config: &'a RequestConfig,
    started_on: DateTime<Utc>,
    retried: usize,
    refresh: bool,
    attempted: bool,
    fatal: bool,
    failure: Option<PipelineError>,
    last_uri: Option<Url>,
    last_response: Option<ConnectionResponse>,
    audit_trail: Vec<Audit>,
}

impl<'a> RequestPipeline<'a> {
    pub(crate) fn new(ctx: PipelineContext<'a>, config: &'a RequestConfig) -> Self {
        let started_on = ctx.clock.now();
        Self {
            ctx,
            config,
            started_on,
            retried: 0,
            refresh: false,
            attempted: false,
            fatal: false,
            failure: None,
            last_uri: None,
            last_response: None,
            audit_trail: Vec::new(),
        }
    }

    /// Run the request to completion.
    pub(crate) async fn execute(
        mut self,
        method: Method,
        path: &str,
        body: Option<Bytes>,
    ) -> Result<TransportResponse> {
        if self.config.is_cancelled() {
            return Err(self.cancelled(None));
        }

        self.first_pool_usage().await?;
        if !self.fatal {
            self.sniff_on_stale_cluster().await?;
        }
        if !self.fatal
            && let Some(response) = self.run(&method, path, body).await?
        {
            return self.finish_success(method, response);
        }
        self.finish_failure(method)
    }

    async fn run(
        &mut self,
        method: &Method,
        path: &str,
        body: Option<Bytes>,
    ) -> Result<Option<ConnectionResponse>> {
        for _ in 0..MAX_VIEW_REFRESHES {
            self.refresh = false;
            let mut view = self.view();

            loop {
                if self.depleted_retries() {
                    return Ok(None);
                }
                let Some(node) = self.next_node(&mut view) else {
                    break;
                };
                if self.config.is_cancelled() {
                    return Err(self.cancelled(Some(node.uri())));
                }
                if self.config.force_node.is_none()
                    && !(self.ctx.settings.node_predicate)(node.as_ref())
                {
                    debug!(node = %node, "Node rejected by node predicate");
                    continue;
                }
                self.attempted = true;

                if let Some(error) = self.ping(&node).await? {
                    if !error.is_recoverable() {
                        self.fail_fatal(error, None);
                        return Ok(None);
                    }
                    self.mark_dead(&node);
                    self.failure = Some(error);
                    self.sniff_on_connection_failure().await?;
                    if self.refresh {
                        break;
                    }
                    continue;
                }

                match self.call(&node, method, path, body.clone()).await? {
                    Attempt::Success(response) => {
                        node.mark_alive();
                        return Ok(Some(response));
                    }
                    Attempt::Known(response) => {
                        node.mark_alive();
                        let status = response.status;
                        self.fail_fatal(
                            PipelineError::new(PipelineFailure::BadResponse).with_status(status),
                            Some(response),
                        );
                        return Ok(None);
                    }
                    Attempt::Fatal { error, response } => {
                        self.fail_fatal(error, response);
                        return Ok(None);
                    }
                    Attempt::Retryable { error, response } => {
                        self.mark_dead(&node);
                        self.failure = Some(error);
                        self.last_response = response;
                        self.sniff_on_connection_failure().await?;
                        if self.refresh {
                            break;
                        }
                    }
                }
            }

            if !self.refresh {
                break;
            }
        }
        debug!(retried = self.retried, "Exhausted candidate nodes");
        Ok(None)
    }

    fn view(&self) -> NodeView {
        match &self.config.force_node {
            Some(uri) => NodeView::fixed(vec![Arc::new(Node::new(uri.clone()))]),
            None => self.ctx.pool.create_view(),
        }
    }

    fn next_node(&mut self, view: &mut NodeView) -> Option<Arc<Node>> {
        let mut events = Vec::new();
        let node = view.next_audited(&mut |event, node| {
            events.push((event, node.map(|n| n.uri().clone())));
        });
        let now = self.ctx.clock.now();
        for (event, uri) in events {
            self.audit_trail.push(Audit::new(event, uri, now));
        }
        node
    }

    fn request_timeout(&self) -> Duration {
        self.config
            .request_timeout
            .unwrap_or(self.ctx.settings.request_timeout)
    }

    fn ping_timeout(&self) -> Duration {
        self.config
            .ping_timeout
            .or(self.ctx.settings.ping_timeout)
            .unwrap_or(if self.ctx.pool.uses_ssl() {
                DEFAULT_PING_TIMEOUT_TLS
            } else {
                DEFAULT_PING_TIMEOUT
            })
    }

    fn max_retry_timeout(&self) -> Duration {
        self.ctx
            .settings
            .max_retry_timeout
            .unwrap_or_else(|| self.request_timeout())
    }

    fn max_retries(&self) -> usize {
        if self.config.force_node.is_some() {
            return 0;
        }
        self.config
            .max_retries
            .or(self.ctx.settings.max_retries)
            .unwrap_or(usize::MAX)
            .min(self.ctx.pool.max_retries())
    }

    fn is_taking_too_long(&self) -> bool {
        let budget = self.max_retry_timeout().mul_f64(TIMEOUT_HEADROOM);
        self.ctx.clock.now() - self.started_on >= to_chrono(budget)
    }

    fn retries_exhausted(&self) -> bool {
        self.retried >= self.max_retries().saturating_add(1)
    }

    fn depleted_retries(&self) -> bool {
        self.retries_exhausted() || self.is_taking_too_long()
    }

    fn sniff_allowed(&self) -> bool {
        self.ctx.pool.supports_reseeding()
            && !self.config.disable_sniff
            && self.config.force_node.is_none()
    }

    fn mark_dead(&mut self, node: &Node) {
        let settings = self.ctx.settings;
        let until = self.ctx.clock.dead_time(
            node.failed_attempts(),
            settings.dead_timeout,
            settings.max_dead_timeout,
        );
        node.mark_dead(until);
        self.retried += 1;
        warn!(
            node = %node,
            failed_attempts = node.failed_attempts(),
            dead_until = %until,
            "Marking node dead"
        );
    }

    fn fail_fatal(&mut self, error: PipelineError, response: Option<ConnectionResponse>) {
        self.fatal = true;
        self.failure = Some(error);
        if response.is_some() {
            self.last_response = response;
        }
    }

    fn audit(
        &mut self,
        event: AuditEvent,
        node: Option<&Url>,
        started: DateTime<Utc>,
        path: Option<&str>,
        error: Option<String>,
    ) {
        let mut audit = Audit::new(event, node.cloned(), started);
        audit.ended = self.ctx.clock.now();
        audit.path = path.map(String::from);
        audit.error = error;
        self.audit_trail.push(audit);
    }

    fn cancelled(&mut self, node: Option<&Url>) -> TransportError {
        let now = self.ctx.clock.now();
        self.audit_trail
            .push(Audit::new(AuditEvent::CancellationRequested, node.cloned(), now));
        debug!("Request cancelled");
        TransportError::Cancelled {
            audit_trail: std::mem::take(&mut self.audit_trail),
        }
    }

    fn headers(&self, with_body: bool) -> HeaderMap {
        let mut headers = HeaderMap::new();
        let mut insert = |name: &str, value: &str| {
            match (HeaderName::try_from(name), HeaderValue::try_from(value)) {
                (Ok(name), Ok(value)) => {
                    headers.insert(name, value);
                }
                _ => debug!(header = name, "Skipping invalid header"),
            }
        };

        for (name, value) in &self.ctx.settings.default_headers {
            insert(name, value);
        }
        if !self.ctx.settings.disable_meta_header {
            insert(META_HEADER_NAME, &self.ctx.meta.value(self.config.helper));
        }
        if let Some(id) = &self.config.opaque_id {
            insert(OPAQUE_ID_HEADER, id);
        }
        for (name, value) in &self.config.headers {
            insert(name, value);
        }
        if with_body && !headers.contains_key(CONTENT_TYPE) {
            headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        }
        headers
    }

    fn request_data(
        &self,
        kind: RequestKind,
        method: Method,
        node: &Node,
        path: &str,
        body: Option<Bytes>,
        timeout: Duration,
    ) -> RequestData {
        RequestData {
            method,
            node: node.uri().clone(),
            path: path.to_string(),
            headers: self.headers(body.is_some()),
            body,
            request_timeout: timeout,
            http_compression: self.ctx.settings.http_compression,
            basic_auth: self.ctx.settings.basic_auth.clone(),
            kind,
        }
    }

    async fn send(
        &mut self,
        data: &RequestData,
    ) -> Result<std::result::Result<ConnectionResponse, ConnectionError>> {
        let connection = self.ctx.connection;
        let config = self.config;
        match &config.cancellation {
            Some(token) => tokio::select! {
                biased;
                _ = token.cancelled() => Err(self.cancelled(Some(&data.node))),
                result = connection.request(data) => Ok(result),
            },
            None => Ok(connection.request(data).await),
        }
    }

    async fn first_pool_usage(&mut self) -> Result<()> {
        if !self.ctx.settings.sniff_on_startup
            || !self.sniff_allowed()
            || self.ctx.pool.sniffed_on_startup()
        {
            return Ok(());
        }

        let bootstrap = self.ctx.bootstrap;
        let timeout = self.request_timeout();
        let Ok(_guard) = tokio::time::timeout(timeout, bootstrap.lock()).await else {
            warn!(?timeout, "Timed out waiting for the startup sniff");
            self.fail_fatal(
                PipelineError::new(PipelineFailure::CouldNotStartSniffOnStartup),
                None,
            );
            return Ok(());
        };

        // Another request may have sniffed while this one waited.
        if self.ctx.pool.sniffed_on_startup() {
            return Ok(());
        }
        if self.sniff(AuditEvent::SniffOnStartup).await? {
            self.ctx.pool.set_sniffed_on_startup(true);
        }
        Ok(())
    }

    async fn sniff_on_stale_cluster(&mut self) -> Result<()> {
        if !self.sniff_allowed() {
            return Ok(());
        }
        let Some(span) = self.ctx.settings.sniff_life_span else {
            return Ok(());
        };
        if saturating_add(self.ctx.pool.last_update(), span) < self.ctx.clock.now() {
            self.sniff(AuditEvent::SniffOnStaleCluster).await?;
        }
        Ok(())
    }

    async fn sniff_on_connection_failure(&mut self) -> Result<()> {
        if self.ctx.settings.sniff_on_connection_fault && self.sniff_allowed() {
            self.sniff(AuditEvent::SniffOnFail).await?;
        }
        Ok(())
    }

    /// Sniff the cluster and reseed the pool. Returns whether a node answered.
    async fn sniff(&mut self, reason: AuditEvent) -> Result<bool> {
        let started = self.ctx.clock.now();
        let wrapper = self.audit_trail.len();
        self.audit_trail.push(Audit::new(reason, None, started));

        let mut candidates: Vec<Arc<Node>> = self.ctx.pool.create_view().collect();
        candidates.sort_by_key(|n| !n.roles().cluster_manager_eligible);

        let path = sniff_path(self.ping_timeout());
        let mut sniffed = false;
        let mut last_error = None;

        for node in candidates {
            if self.config.is_cancelled() {
                return Err(self.cancelled(Some(node.uri())));
            }
            let step_started = self.ctx.clock.now();
            let data = self.request_data(
                RequestKind::Sniff,
                Method::GET,
                &node,
                &path,
                None,
                self.ping_timeout(),
            );

            let error = match self.send(&data).await? {
                Ok(response) if response.status.is_success() => {
                    match self.reseed(&response.body) {
                        Ok(count) => {
                            self.audit(
                                AuditEvent::SniffSuccess,
                                Some(node.uri()),
                                step_started,
                                Some(&path),
                                None,
                            );
                            info!(node = %node, nodes = count, reason = %reason, "Sniffed cluster state");
                            self.refresh = true;
                            sniffed = true;
                            break;
                        }
                        Err(error) => error,
                    }
                }
                Ok(response) => format!("sniff returned status {}", response.status),
                Err(error) => error.to_string(),
            };

            warn!(node = %node, error = %error, "Sniff failed");
            self.audit(
                AuditEvent::SniffFailure,
                Some(node.uri()),
                step_started,
                Some(&path),
                Some(error.clone()),
            );
            last_error = Some(error);
        }

        let ended = self.ctx.clock.now();
        if let Some(audit) = self.audit_trail.get_mut(wrapper) {
            audit.ended = ended;
        }
        if !sniffed && self.failure.is_none() {
            let mut error = PipelineError::new(PipelineFailure::SniffFailure);
            if let Some(message) = last_error {
                error = error.with_source(ConnectionError::Other(message));
            }
            self.failure = Some(error);
        }
        Ok(sniffed)
    }

    fn reseed(&self, body: &[u8]) -> std::result::Result<usize, String> {
        let predicate = &self.ctx.settings.node_predicate;
        let nodes: Vec<Node> = parse_nodes(body, self.ctx.pool.uses_ssl())
            .map_err(|e| format!("invalid nodes info response: {e}"))?
            .into_iter()
            .filter(|n| predicate(n))
            .collect();
        let count = nodes.len();
        self.ctx.pool.reseed(nodes).map_err(|e| e.to_string())?;
        Ok(count)
    }

    /// Ping `node` when it needs one. Returns the failure, if any.
    async fn ping(&mut self, node: &Node) -> Result<Option<PipelineError>> {
        let needs_ping = self.ctx.pool.supports_pinging()
            && !self.ctx.settings.disable_pings
            && !self.config.disable_ping
            && self.config.force_node.is_none()
            && node.is_resurrected();
        if !needs_ping {
            return Ok(None);
        }

        let started = self.ctx.clock.now();
        let data = self.request_data(
            RequestKind::Ping,
            Method::HEAD,
            node,
            "",
            None,
            self.ping_timeout(),
        );
        debug!(node = %node, "Pinging node");

        let error = match self.send(&data).await? {
            Ok(response) if response.status.is_success() => {
                self.audit(AuditEvent::PingSuccess, Some(node.uri()), started, Some("/"), None);
                return Ok(None);
            }
            Ok(response) if response.status == StatusCode::UNAUTHORIZED => {
                PipelineError::new(PipelineFailure::BadAuthentication).with_status(response.status)
            }
            Ok(response) => {
                PipelineError::new(PipelineFailure::PingFailure).with_status(response.status)
            }
            Err(error) => PipelineError::new(PipelineFailure::PingFailure).with_source(error),
        };

        self.audit(
            AuditEvent::PingFailure,
            Some(node.uri()),
            started,
            Some("/"),
            Some(error.to_string()),
        );
        Ok(Some(error))
    }

    fn is_success(&self, method: &Method, status: StatusCode) -> bool {
        status.is_success()
            || (*method == Method::HEAD && status == StatusCode::NOT_FOUND)
            || self.config.allowed_status_codes.contains(&status.as_u16())
    }

    async fn call(
        &mut self,
        node: &Node,
        method: &Method,
        path: &str,
        body: Option<Bytes>,
    ) -> Result<Attempt> {
        let started = self.ctx.clock.now();
        let data = self.request_data(
            RequestKind::Call,
            method.clone(),
            node,
            path,
            body,
            self.request_timeout(),
        );
        self.last_uri = data.uri().ok();
        debug!(node = %node, method = %method, path, attempt = self.retried + 1, "Calling node");

        let attempt = match self.send(&data).await? {
            Ok(response) if self.is_success(method, response.status) => Attempt::Success(response),
            Ok(response) if response.status == StatusCode::UNAUTHORIZED => Attempt::Fatal {
                error: PipelineError::new(PipelineFailure::BadAuthentication)
                    .with_status(response.status),
                response: Some(response),
            },
            Ok(response) if response.status.is_server_error() => Attempt::Retryable {
                error: PipelineError::new(PipelineFailure::BadResponse).with_status(response.status),
                response: Some(response),
            },
            Ok(response) => Attempt::Known(response),
            Err(error) => Attempt::Retryable {
                error: PipelineError::new(PipelineFailure::BadResponse).with_source(error),
                response: None,
            },
        };

        let (event, error) = match &attempt {
            Attempt::Success(_) | Attempt::Known(_) => (AuditEvent::HealthyResponse, None),
            Attempt::Retryable { error, .. } | Attempt::Fatal { error, .. } => {
                (AuditEvent::BadResponse, Some(error.to_string()))
            }
        };
        self.audit(event, Some(node.uri()), started, Some(path), error);
        Ok(attempt)
    }

    fn finish_success(mut self, method: Method, response: ConnectionResponse) -> Result<TransportResponse> {
        let details = ApiCallDetails {
            success: true,
            status: Some(response.status),
            method,
            uri: self.last_uri.take(),
            audit_trail: std::mem::take(&mut self.audit_trail),
            deprecation_warnings: deprecation_warnings(&response.headers),
            original_error: None,
        };
        self.completed(&details);
        Ok(TransportResponse::new(details, response.headers, response.body))
    }

    fn finish_failure(mut self, method: Method) -> Result<TransportResponse> {
        let mut error = self.final_error();
        error.audit_trail = self.audit_trail.clone();

        let response = self.last_response.take();
        let status = response.as_ref().map(|r| r.status).or(error.status);
        let (headers, body) = response
            .map(|r| (r.headers, r.body))
            .unwrap_or_default();

        warn!(failure = ?error.failure, retried = self.retried, "Request failed");

        let details = ApiCallDetails {
            success: false,
            status,
            method,
            uri: self.last_uri.take(),
            audit_trail: std::mem::take(&mut self.audit_trail),
            deprecation_warnings: deprecation_warnings(&headers),
            original_error: Some(error.clone()),
        };
        self.completed(&details);

        let throw = self
            .config
            .throw_exceptions
            .unwrap_or(self.ctx.settings.throw_exceptions);
        if throw {
            return Err(error.into());
        }
        Ok(TransportResponse::new(details, headers, body))
    }

    fn final_error(&mut self) -> PipelineError {
        let last = self.failure.take();
        if self.fatal
            && let Some(error) = last
        {
            return error;
        }

        let (failure, event) = if !self.attempted {
            (PipelineFailure::NoNodesAttempted, AuditEvent::NoNodesAttempted)
        } else if self.is_taking_too_long() {
            (PipelineFailure::MaxTimeoutReached, AuditEvent::MaxTimeoutReached)
        } else if self.retries_exhausted() {
            (PipelineFailure::MaxRetriesReached, AuditEvent::MaxRetriesReached)
        } else {
            (PipelineFailure::FailedOverAllNodes, AuditEvent::FailedOverAllNodes)
        };
        let now = self.ctx.clock.now();
        self.audit_trail.push(Audit::new(event, None, now));

        let mut error = PipelineError::new(failure);
        if let Some(last) = last {
            error.source = last.source;
            error.status = last.status;
        }
        error
    }

    fn completed(&self, details: &ApiCallDetails) {
        if let Some(hook) = &self.ctx.settings.on_request_completed {
            hook(details);
        }
    }
}
