//! Per-request overrides.

use crate::meta::Helper;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use url::Url;

/// Header used to correlate a request with server-side tasks and logs.
pub const OPAQUE_ID_HEADER: &str = "x-opaque-id";

/// Overrides applied to a single request. Unset fields fall back to the
/// transport settings.
#[derive(Debug, Clone, Default)]
pub struct RequestConfig {
    /// Call timeout.
    pub request_timeout: Option<Duration>,
    /// Ping timeout.
    pub ping_timeout: Option<Duration>,
    /// Retry budget.
    pub max_retries: Option<usize>,
    /// Skip pings for this request.
    pub disable_ping: bool,
    /// Skip sniffs for this request.
    pub disable_sniff: bool,
    /// Send to this node only, bypassing the pool. Never retried.
    pub force_node: Option<Url>,
    /// Extra status codes treated as success.
    pub allowed_status_codes: Vec<u16>,
    /// Extra headers.
    pub headers: Vec<(String, String)>,
    /// Value of the `X-Opaque-Id` header.
    pub opaque_id: Option<String>,
    /// Helper tag for the meta header.
    pub helper: Option<Helper>,
    /// Aborts the request, including pending retries.
    pub cancellation: Option<CancellationToken>,
    /// Override of the transport's error mode.
    pub throw_exceptions: Option<bool>,
}

impl RequestConfig {
    /// Empty overrides.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the call timeout.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = Some(timeout);
        self
    }

    /// Set the ping timeout.
    pub fn with_ping_timeout(mut self, timeout: Duration) -> Self {
        self.ping_timeout = Some(timeout);
        self
    }

    /// Set the retry budget.
    pub fn with_max_retries(mut self, retries: usize) -> Self {
        self.max_retries = Some(retries);
        self
    }

    /// Skip pings.
    pub fn with_disable_ping(mut self, disable: bool) -> Self {
        self.disable_ping = disable;
        self
    }

    /// Skip sniffs.
    pub fn with_disable_sniff(mut self, disable: bool) -> Self {
        self.disable_sniff = disable;
        self
    }

    /// Send to `node` only.
    pub fn with_force_node(mut self, node: Url) -> Self {
        self.force_node = Some(node);
        self
    }

    /// Treat `status` as success.
    pub fn with_allowed_status_code(mut self, status: u16) -> Self {
        self.allowed_status_codes.push(status);
        self
    }

    /// Add a header.
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Set the opaque id.
    pub fn with_opaque_id(mut self, id: impl Into<String>) -> Self {
        self.opaque_id = Some(id.into());
        self
    }

    /// Tag the request as issued by `helper`.
    pub fn with_helper(mut self, helper: Helper) -> Self {
        self.helper = Some(helper);
        self
    }

    /// Attach a cancellation token.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = Some(token);
        self
    }

    /// Override the error mode.
    pub fn with_throw_exceptions(mut self, throw: bool) -> Self {
        self.throw_exceptions = Some(throw);
        self
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.cancellation.as_ref().is_some_and(|t| t.is_cancelled())
    }
}
