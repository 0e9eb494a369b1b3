//! Cluster state discovery from the nodes info API.

use crate::node::{Node, NodeRoles};
use serde::Deserialize;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;
use url::Url;

/// Path of the sniff request for the given timeout.
pub fn sniff_path(timeout: Duration) -> String {
    format!(
        "_nodes/http,settings?timeout={}ms&flat_settings",
        timeout.as_millis()
    )
}

/// Body of `GET /_nodes/http,settings`.
#[derive(Debug, Clone, Deserialize)]
pub struct NodesInfoResponse {
    /// Nodes keyed by id.
    #[serde(default)]
    pub nodes: BTreeMap<String, NodeInfo>,
}

/// One node of a nodes info response.
#[derive(Debug, Clone, Deserialize)]
pub struct NodeInfo {
    /// Node name.
    #[serde(default)]
    pub name: Option<String>,
    /// Host the node binds to.
    #[serde(default)]
    pub host: Option<String>,
    /// IP the node binds to.
    #[serde(default)]
    pub ip: Option<String>,
    /// Advertised roles. Missing means every role.
    #[serde(default)]
    pub roles: Option<Vec<NodeRole>>,
    /// HTTP section; absent when HTTP is disabled.
    #[serde(default)]
    pub http: Option<HttpInfo>,
    /// Flat node settings.
    #[serde(default)]
    pub settings: HashMap<String, Value>,
}

/// HTTP section of a node.
#[derive(Debug, Clone, Deserialize)]
pub struct HttpInfo {
    /// `host/ip:port` or `ip:port`.
    pub publish_address: String,
}

/// A node role as reported by the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeRole {
    /// Holds data.
    Data,
    /// Cluster manager eligible.
    ClusterManager,
    /// Legacy name of `cluster_manager`.
    Master,
    /// Runs ingest pipelines.
    Ingest,
    /// Anything else.
    #[serde(other)]
    Other,
}

impl NodeInfo {
    /// Role flags of this node.
    pub fn node_roles(&self) -> NodeRoles {
        match &self.roles {
            None => NodeRoles::default(),
            Some(roles) => NodeRoles {
                holds_data: roles.contains(&NodeRole::Data),
                cluster_manager_eligible: roles
                    .iter()
                    .any(|r| matches!(r, NodeRole::ClusterManager | NodeRole::Master)),
                ingest_enabled: roles.contains(&NodeRole::Ingest),
                http_enabled: self.http.is_some(),
            },
        }
    }

    fn flat_settings(&self) -> HashMap<String, String> {
        self.settings
            .iter()
            .map(|(k, v)| {
                let value = match v {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                (k.clone(), value)
            })
            .collect()
    }
}

/// Turn a nodes info body into pool nodes. Nodes without HTTP are dropped.
pub fn parse_nodes(body: &[u8], uses_ssl: bool) -> Result<Vec<Node>, serde_json::Error> {
    let response: NodesInfoResponse = serde_json::from_slice(body)?;
    let scheme = if uses_ssl { "https" } else { "http" };

    let nodes = response
        .nodes
        .into_iter()
        .filter_map(|(id, info)| {
            let http = info.http.as_ref()?;
            let uri = publish_uri(scheme, &http.publish_address)?;
            let mut node = Node::new(uri)
                .with_id(id)
                .with_roles(info.node_roles())
                .with_settings(info.flat_settings());
            if let Some(name) = &info.name {
                node = node.with_name(name.clone());
            }
            Some(node)
        })
        .collect();
    Ok(nodes)
}

/// `host/ip:port` keeps the host name; `ip:port` uses the IP.
fn publish_uri(scheme: &str, address: &str) -> Option<Url> {
    let (host_part, addr_part) = match address.split_once('/') {
        Some((host, addr)) => (Some(host), addr),
        None => (None, address),
    };
    let (ip, port) = addr_part.rsplit_once(':')?;
    let port: u16 = port.parse().ok()?;
    let host = match host_part {
        Some(host) if !host.is_empty() => host,
        _ => ip,
    };
    let host = if host.contains(':') && !host.starts_with('[') {
        format!("[{host}]")
    } else {
        host.to_string()
    };
    Url::parse(&format!("{scheme}://{host}:{port}")).ok()
}
