//! Transport configuration.

use crate::clock::{DEFAULT_DEAD_TIMEOUT, DEFAULT_MAX_DEAD_TIMEOUT};
use crate::env::EnvLoader;
use crate::error::ConfigError;
use crate::node::Node;
use crate::response::ApiCallDetails;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Default request timeout.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// Default ping timeout for plain HTTP pools.
pub const DEFAULT_PING_TIMEOUT: Duration = Duration::from_secs(2);

/// Default ping timeout for TLS pools.
pub const DEFAULT_PING_TIMEOUT_TLS: Duration = Duration::from_secs(5);

/// Default age after which the cluster state is sniffed again.
pub const DEFAULT_SNIFF_LIFE_SPAN: Duration = Duration::from_secs(60 * 60);

/// Decides which nodes may serve API calls.
pub type NodePredicate = Arc<dyn Fn(&Node) -> bool + Send + Sync>;

/// Invoked after every request, successful or not.
pub type RequestCompletedHook = Arc<dyn Fn(&ApiCallDetails) + Send + Sync>;

/// Transport-wide settings.
#[derive(Clone)]
pub struct TransportSettings {
    /// Timeout of a single call.
    pub request_timeout: Duration,
    /// Timeout of a ping. Defaults to 2s, or 5s when the pool uses TLS.
    pub ping_timeout: Option<Duration>,
    /// Retry budget. Never exceeds what the pool can serve.
    pub max_retries: Option<usize>,
    /// Overall time budget across retries. Defaults to the request timeout.
    pub max_retry_timeout: Option<Duration>,
    /// Base window a failed node stays dead.
    pub dead_timeout: Duration,
    /// Cap on how long a node stays dead.
    pub max_dead_timeout: Duration,
    /// Sniff the cluster on the first request.
    pub sniff_on_startup: bool,
    /// Sniff the cluster when a node fails.
    pub sniff_on_connection_fault: bool,
    /// Sniff again once the cluster state is older than this.
    pub sniff_life_span: Option<Duration>,
    /// Never ping nodes.
    pub disable_pings: bool,
    /// Which nodes may serve calls.
    pub node_predicate: NodePredicate,
    /// Turn unsuccessful calls into errors instead of invalid responses.
    pub throw_exceptions: bool,
    /// Gzip request bodies.
    pub http_compression: bool,
    /// Basic authentication credentials.
    pub basic_auth: Option<(String, String)>,
    /// User agent string.
    pub user_agent: String,
    /// Headers added to every request.
    pub default_headers: Vec<(String, String)>,
    /// Skip the client meta header.
    pub disable_meta_header: bool,
    /// Hook invoked after every request.
    pub on_request_completed: Option<RequestCompletedHook>,
    /// Connection timeout of the HTTP client.
    pub connect_timeout: Duration,
    /// Idle timeout of pooled HTTP connections.
    pub pool_idle_timeout: Duration,
    /// Idle HTTP connections kept per host.
    pub pool_max_idle_per_host: usize,
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self {
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            ping_timeout: None,
            max_retries: None,
            max_retry_timeout: None,
            dead_timeout: DEFAULT_DEAD_TIMEOUT,
            max_dead_timeout: DEFAULT_MAX_DEAD_TIMEOUT,
            sniff_on_startup: true,
            sniff_on_connection_fault: true,
            sniff_life_span: Some(DEFAULT_SNIFF_LIFE_SPAN),
            disable_pings: false,
            node_predicate: Arc::new(default_node_predicate),
            throw_exceptions: false,
            http_compression: false,
            basic_auth: None,
            user_agent: format!("trellis/{}", env!("CARGO_PKG_VERSION")),
            default_headers: Vec::new(),
            disable_meta_header: false,
            on_request_completed: None,
            connect_timeout: Duration::from_secs(10),
            pool_idle_timeout: Duration::from_secs(90),
            pool_max_idle_per_host: 32,
        }
    }
}

/// Accepts every node except cluster-manager-only ones.
pub fn default_node_predicate(node: &Node) -> bool {
    !node.is_cluster_manager_only()
}

impl TransportSettings {
    /// Create a new settings builder.
    pub fn builder() -> TransportSettingsBuilder {
        TransportSettingsBuilder::default()
    }

    /// Load settings from `TRELLIS_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_loader(&EnvLoader::default())
    }

    /// Load settings through `loader`, starting from the defaults.
    pub fn from_loader(loader: &EnvLoader) -> Result<Self, ConfigError> {
        let mut builder = Self::builder();
        if let Some(timeout) = loader.millis("REQUEST_TIMEOUT_MS")? {
            builder = builder.request_timeout(timeout);
        }
        if let Some(timeout) = loader.millis("PING_TIMEOUT_MS")? {
            builder = builder.ping_timeout(timeout);
        }
        if let Some(retries) = loader.parse("MAX_RETRIES")? {
            builder = builder.max_retries(retries);
        }
        if let Some(disable) = loader.flag("DISABLE_PINGS")? {
            builder = builder.disable_pings(disable);
        }
        if let Some(sniff) = loader.flag("SNIFF_ON_STARTUP")? {
            builder = builder.sniff_on_startup(sniff);
        }
        if let Some(sniff) = loader.flag("SNIFF_ON_CONNECTION_FAULT")? {
            builder = builder.sniff_on_connection_fault(sniff);
        }
        if let Some(span) = loader.secs("SNIFF_LIFE_SPAN_SECS")? {
            builder = builder.sniff_life_span(Some(span));
        }
        if let Some(compress) = loader.flag("HTTP_COMPRESSION")? {
            builder = builder.http_compression(compress);
        }
        if let (Some(user), Some(pass)) = (loader.load_var("USERNAME"), loader.load_var("PASSWORD")) {
            builder = builder.basic_auth(user, pass);
        }
        Ok(builder.build())
    }

    /// Seed nodes listed in `TRELLIS_NODES`.
    pub fn seed_nodes(loader: &EnvLoader) -> Result<Vec<Node>, ConfigError> {
        let nodes = loader
            .list("NODES")
            .iter()
            .map(|uri| Node::parse(uri))
            .collect::<Result<Vec<_>, _>>()?;
        if nodes.is_empty() {
            return Err(ConfigError::EmptyNodes);
        }
        Ok(nodes)
    }

    /// Effective overall retry timeout.
    pub fn max_retry_timeout(&self) -> Duration {
        self.max_retry_timeout.unwrap_or(self.request_timeout)
    }
}

impl fmt::Debug for TransportSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportSettings")
            .field("request_timeout", &self.request_timeout)
            .field("ping_timeout", &self.ping_timeout)
            .field("max_retries", &self.max_retries)
            .field("max_retry_timeout", &self.max_retry_timeout)
            .field("dead_timeout", &self.dead_timeout)
            .field("max_dead_timeout", &self.max_dead_timeout)
            .field("sniff_on_startup", &self.sniff_on_startup)
            .field("sniff_on_connection_fault", &self.sniff_on_connection_fault)
            .field("sniff_life_span", &self.sniff_life_span)
            .field("disable_pings", &self.disable_pings)
            .field("throw_exceptions", &self.throw_exceptions)
            .field("http_compression", &self.http_compression)
            .field("basic_auth", &self.basic_auth.as_ref().map(|(user, _)| user))
            .field("user_agent", &self.user_agent)
            .field("default_headers", &self.default_headers)
            .field("disable_meta_header", &self.disable_meta_header)
            .finish_non_exhaustive()
    }
}

/// Builder for transport settings.
#[derive(Debug, Default)]
pub struct TransportSettingsBuilder {
    settings: TransportSettings,
}

impl TransportSettingsBuilder {
    /// Set the request timeout.
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.settings.request_timeout = timeout;
        self
    }

    /// Set the ping timeout.
    pub fn ping_timeout(mut self, timeout: Duration) -> Self {
        self.settings.ping_timeout = Some(timeout);
        self
    }

    /// Set the retry budget.
    pub fn max_retries(mut self, retries: usize) -> Self {
        self.settings.max_retries = Some(retries);
        self
    }

    /// Set the overall retry timeout.
    pub fn max_retry_timeout(mut self, timeout: Duration) -> Self {
        self.settings.max_retry_timeout = Some(timeout);
        self
    }

    /// Set the base dead window.
    pub fn dead_timeout(mut self, timeout: Duration) -> Self {
        self.settings.dead_timeout = timeout;
        self
    }

    /// Set the dead window cap.
    pub fn max_dead_timeout(mut self, timeout: Duration) -> Self {
        self.settings.max_dead_timeout = timeout;
        self
    }

    /// Enable or disable the startup sniff.
    pub fn sniff_on_startup(mut self, enable: bool) -> Self {
        self.settings.sniff_on_startup = enable;
        self
    }

    /// Enable or disable sniffing after node failures.
    pub fn sniff_on_connection_fault(mut self, enable: bool) -> Self {
        self.settings.sniff_on_connection_fault = enable;
        self
    }

    /// Set the cluster state life span. `None` disables stale sniffs.
    pub fn sniff_life_span(mut self, span: Option<Duration>) -> Self {
        self.settings.sniff_life_span = span;
        self
    }

    /// Enable or disable pings.
    pub fn disable_pings(mut self, disable: bool) -> Self {
        self.settings.disable_pings = disable;
        self
    }

    /// Set the node predicate.
    pub fn node_predicate<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&Node) -> bool + Send + Sync + 'static,
    {
        self.settings.node_predicate = Arc::new(predicate);
        self
    }

    /// Return errors instead of invalid responses.
    pub fn throw_exceptions(mut self, enable: bool) -> Self {
        self.settings.throw_exceptions = enable;
        self
    }

    /// Enable or disable request body compression.
    pub fn http_compression(mut self, enable: bool) -> Self {
        self.settings.http_compression = enable;
        self
    }

    /// Set basic authentication credentials.
    pub fn basic_auth(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.settings.basic_auth = Some((username.into(), password.into()));
        self
    }

    /// Set the user agent string.
    pub fn user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.settings.user_agent = user_agent.into();
        self
    }

    /// Add a header sent with every request.
    pub fn default_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.settings.default_headers.push((name.into(), value.into()));
        self
    }

    /// Skip the client meta header.
    pub fn disable_meta_header(mut self, disable: bool) -> Self {
        self.settings.disable_meta_header = disable;
        self
    }

    /// Set the hook invoked after every request.
    pub fn on_request_completed<F>(mut self, hook: F) -> Self
    where
        F: Fn(&ApiCallDetails) + Send + Sync + 'static,
    {
        self.settings.on_request_completed = Some(Arc::new(hook));
        self
    }

    /// Set the HTTP connect timeout.
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.settings.connect_timeout = timeout;
        self
    }

    /// Set the idle timeout of pooled HTTP connections.
    pub fn pool_idle_timeout(mut self, timeout: Duration) -> Self {
        self.settings.pool_idle_timeout = timeout;
        self
    }

    /// Set the idle HTTP connections kept per host.
    pub fn pool_max_idle_per_host(mut self, max: usize) -> Self {
        self.settings.pool_max_idle_per_host = max;
        self
    }

    /// Build the settings.
    pub fn build(self) -> TransportSettings {
        self.settings
    }
}
