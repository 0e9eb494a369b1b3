//! Scripted connection.

use crate::clock::TestClock;
use crate::rules::{Outcome, Rule};
use async_trait::async_trait;
use bytes::Bytes;
use http::{HeaderMap, Method, StatusCode};
use parking_lot::Mutex;
use serde_json::{Value, json};
use std::fmt;
use std::sync::Arc;
use trellis_transport::{
    Connection, ConnectionError, ConnectionResponse, NodeRoles, RequestData, RequestKind,
};

/// Computes a response from the request; `None` falls through to the default.
pub type Responder = Arc<dyn Fn(&RequestData) -> Option<ConnectionResponse> + Send + Sync>;

/// A node as reported by the virtual cluster's nodes info API.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClusterNode {
    /// Port on localhost.
    pub port: u16,
    /// Advertised roles.
    pub roles: NodeRoles,
}

impl ClusterNode {
    /// A node with every role.
    pub fn new(port: u16) -> Self {
        Self {
            port,
            roles: NodeRoles::default(),
        }
    }
}

/// Nodes info body listing `nodes`, all published on localhost.
pub fn nodes_info(nodes: &[ClusterNode]) -> Value {
    let entries: serde_json::Map<String, Value> = nodes
        .iter()
        .map(|node| {
            let mut roles = Vec::new();
            if node.roles.holds_data {
                roles.push("data");
            }
            if node.roles.cluster_manager_eligible {
                roles.push("cluster_manager");
            }
            if node.roles.ingest_enabled {
                roles.push("ingest");
            }
            let mut info = json!({
                "name": format!("node-{}", node.port),
                "host": "127.0.0.1",
                "ip": "127.0.0.1",
                "roles": roles,
                "settings": {"cluster.name": "virtual"},
            });
            if node.roles.http_enabled {
                info["http"] = json!({"publish_address": format!("localhost/127.0.0.1:{}", node.port)});
            }
            (format!("node-{}", node.port), info)
        })
        .collect();
    json!({"cluster_name": "virtual", "nodes": entries})
}

/// A request the virtual cluster received.
#[derive(Debug, Clone)]
pub struct RecordedCall {
    /// Ping, sniff or call.
    pub kind: RequestKind,
    /// HTTP method.
    pub method: Method,
    /// Target port.
    pub port: Option<u16>,
    /// Path relative to the node.
    pub path: String,
    /// Request headers.
    pub headers: HeaderMap,
    /// Request body.
    pub body: Option<Bytes>,
}

/// A [`Connection`] that answers from scripted rules instead of the network.
///
/// Rules are tried in order; the first one that matches the port and path and
/// still has uses left decides the outcome. Requests no rule matches succeed.
pub struct VirtualizedConnection {
    clock: TestClock,
    pings: Mutex<Vec<Rule>>,
    calls: Mutex<Vec<Rule>>,
    sniffs: Mutex<Vec<Rule>>,
    sniff_nodes: Mutex<Vec<ClusterNode>>,
    responder: Option<Responder>,
    recorded: Mutex<Vec<RecordedCall>>,
}

impl VirtualizedConnection {
    /// Connection with no rules.
    pub fn new(clock: TestClock) -> Self {
        Self {
            clock,
            pings: Mutex::new(Vec::new()),
            calls: Mutex::new(Vec::new()),
            sniffs: Mutex::new(Vec::new()),
            sniff_nodes: Mutex::new(Vec::new()),
            responder: None,
            recorded: Mutex::new(Vec::new()),
        }
    }

    /// Add a ping rule.
    pub fn with_ping(self, rule: Rule) -> Self {
        self.pings.lock().push(rule);
        self
    }

    /// Add an API call rule.
    pub fn with_call(self, rule: Rule) -> Self {
        self.calls.lock().push(rule);
        self
    }

    /// Add a sniff rule.
    pub fn with_sniff(self, rule: Rule) -> Self {
        self.sniffs.lock().push(rule);
        self
    }

    /// Nodes reported by sniffs that no rule answers.
    pub fn with_sniff_nodes(self, nodes: Vec<ClusterNode>) -> Self {
        *self.sniff_nodes.lock() = nodes;
        self
    }

    /// Compute API call responses with `responder`.
    pub fn with_responder(mut self, responder: Responder) -> Self {
        self.responder = Some(responder);
        self
    }

    /// Change the nodes a default sniff reports.
    pub fn set_sniff_nodes(&self, nodes: Vec<ClusterNode>) {
        *self.sniff_nodes.lock() = nodes;
    }

    /// Every request received so far.
    pub fn recorded_calls(&self) -> Vec<RecordedCall> {
        self.recorded.lock().clone()
    }

    /// Requests of `kind` received so far.
    pub fn count(&self, kind: RequestKind) -> usize {
        self.recorded.lock().iter().filter(|c| c.kind == kind).count()
    }

    /// Requests of `kind` sent to `port`.
    pub fn count_on_port(&self, kind: RequestKind, port: u16) -> usize {
        self.recorded
            .lock()
            .iter()
            .filter(|c| c.kind == kind && c.port == Some(port))
            .count()
    }

    /// Forget recorded requests.
    pub fn clear_recorded(&self) {
        self.recorded.lock().clear();
    }

    fn rules(&self, kind: RequestKind) -> &Mutex<Vec<Rule>> {
        match kind {
            RequestKind::Ping => &self.pings,
            RequestKind::Sniff => &self.sniffs,
            RequestKind::Call => &self.calls,
        }
    }

    fn default_body(&self, kind: RequestKind) -> Bytes {
        match kind {
            RequestKind::Ping => Bytes::new(),
            RequestKind::Sniff => Bytes::from(nodes_info(&self.sniff_nodes.lock()).to_string()),
            RequestKind::Call => Bytes::from_static(b"{}"),
        }
    }
}

impl fmt::Debug for VirtualizedConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VirtualizedConnection")
            .field("pings", &self.pings.lock().len())
            .field("calls", &self.calls.lock().len())
            .field("sniffs", &self.sniffs.lock().len())
            .field("recorded", &self.recorded.lock().len())
            .finish()
    }
}

#[async_trait]
impl Connection for VirtualizedConnection {
    async fn request(&self, request: &RequestData) -> Result<ConnectionResponse, ConnectionError> {
        tokio::task::yield_now().await;

        let port = request.node.port_or_known_default();
        self.recorded.lock().push(RecordedCall {
            kind: request.kind,
            method: request.method.clone(),
            port,
            path: request.path.clone(),
            headers: request.headers.clone(),
            body: request.body.clone(),
        });

        let rule = {
            let mut rules = self.rules(request.kind).lock();
            rules
                .iter_mut()
                .find(|r| r.matches(port, &request.path))
                .map(|r| {
                    r.consume();
                    r.clone()
                })
        };

        let Some(rule) = rule else {
            if request.kind == RequestKind::Call
                && let Some(response) = self.responder.as_ref().and_then(|r| r(request))
            {
                return Ok(response);
            }
            return Ok(ConnectionResponse {
                status: StatusCode::OK,
                headers: HeaderMap::new(),
                body: self.default_body(request.kind),
            });
        };

        if let Some(duration) = rule.duration() {
            if duration >= request.request_timeout {
                self.clock.advance(request.request_timeout);
                return Err(ConnectionError::Timeout(request.request_timeout));
            }
            self.clock.advance(duration);
        }

        match rule.outcome(|| self.default_body(request.kind)) {
            Outcome::Respond { status, body } => Ok(ConnectionResponse {
                status,
                headers: HeaderMap::new(),
                body,
            }),
            Outcome::Refused => Err(ConnectionError::Connect(format!(
                "connection refused by virtual node on port {}",
                port.unwrap_or_default()
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::Times;
    use std::time::Duration;
    use trellis_transport::DateTimeProvider;
    use trellis_transport::sniff::parse_nodes;
    use url::Url;

    fn data(kind: RequestKind, port: u16) -> RequestData {
        RequestData {
            method: Method::GET,
            node: Url::parse(&format!("http://localhost:{port}/")).unwrap(),
            path: String::new(),
            headers: HeaderMap::new(),
            body: None,
            request_timeout: Duration::from_secs(10),
            http_compression: false,
            basic_auth: None,
            kind,
        }
    }

    #[tokio::test]
    async fn test_rules_apply_in_order_then_default() {
        let connection = VirtualizedConnection::new(TestClock::new())
            .with_call(Rule::fails(Times::Once).on_port(9200));

        assert!(connection.request(&data(RequestKind::Call, 9200)).await.is_err());
        assert!(connection.request(&data(RequestKind::Call, 9200)).await.is_ok());
        assert_eq!(connection.count_on_port(RequestKind::Call, 9200), 2);
    }

    #[tokio::test]
    async fn test_slow_rule_times_out_and_advances_clock() {
        let clock = TestClock::new();
        let start = clock.now();
        let connection = VirtualizedConnection::new(clock.clone())
            .with_call(Rule::succeeds(Times::Always).takes(Duration::from_secs(20)));

        let error = connection
            .request(&data(RequestKind::Call, 9200))
            .await
            .unwrap_err();
        assert!(error.is_timeout());
        assert_eq!((clock.now() - start).num_seconds(), 10);
    }

    #[tokio::test]
    async fn test_default_sniff_lists_nodes() {
        let connection = VirtualizedConnection::new(TestClock::new())
            .with_sniff_nodes(vec![ClusterNode::new(9200), ClusterNode::new(9201)]);

        let response = connection
            .request(&data(RequestKind::Sniff, 9200))
            .await
            .unwrap();
        let nodes = parse_nodes(&response.body, false).unwrap();
        let uris: Vec<&str> = nodes.iter().map(|n| n.uri().as_str()).collect();
        assert_eq!(uris, vec!["http://localhost:9200/", "http://localhost:9201/"]);
    }
}
