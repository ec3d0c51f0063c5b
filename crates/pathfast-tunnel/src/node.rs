//! Proxy Nodes and Outbound Specifications
//!
//! A [`ProxyNode`] is one entry of the remote node list. An
//! [`OutboundSpec`] is the validated, protocol-specific dial descriptor
//! derived from it; each protocol is its own variant with its own
//! constructor, so adding a protocol means adding a variant.

use async_trait::async_trait;
use pathfast_network::HttpClient;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::fmt;
use tracing::{debug, warn};
use uuid::Uuid;

/// SOCKS username used when a node does not carry one
pub const DEFAULT_SOCKS_USERNAME: &str = "playfast";

/// Shadowsocks ciphers the engine accepts
const SHADOWSOCKS_METHODS: &[&str] = &[
    "none",
    "aes-128-gcm",
    "aes-192-gcm",
    "aes-256-gcm",
    "chacha20-ietf-poly1305",
    "xchacha20-ietf-poly1305",
    "2022-blake3-aes-128-gcm",
    "2022-blake3-aes-256-gcm",
    "2022-blake3-chacha20-poly1305",
];

/// Node list entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyNode {
    /// Unique, user-facing name
    pub name: String,
    /// `shadowsocks`, `vless` or `socks`
    pub protocol: String,
    pub host: String,
    pub port: u16,
    /// Shadowsocks cipher
    #[serde(default)]
    pub method: String,
    /// Password, or the UUID for vless
    #[serde(default)]
    pub password: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
}

/// Node and outbound construction errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NodeError {
    #[error("unsupported protocol: {0}")]
    UnsupportedProtocol(String),

    #[error("invalid {field}: {reason}")]
    InvalidParameter { field: &'static str, reason: String },

    #[error("malformed node list: {0}")]
    Malformed(String),
}

impl NodeError {
    fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidParameter {
            field,
            reason: reason.into(),
        }
    }
}

/// Remote proxy server address
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerAddr {
    pub host: String,
    pub port: u16,
}

impl ServerAddr {
    pub fn new(host: &str, port: u16) -> Result<Self, NodeError> {
        let host = host.trim();
        if host.is_empty() {
            return Err(NodeError::invalid("host", "empty"));
        }
        if host.contains(char::is_whitespace) {
            return Err(NodeError::invalid("host", format!("{:?} contains whitespace", host)));
        }
        if port == 0 {
            return Err(NodeError::invalid("port", "must be non-zero"));
        }
        Ok(Self {
            host: host.to_string(),
            port,
        })
    }
}

impl fmt::Display for ServerAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShadowsocksOutbound {
    pub server: ServerAddr,
    pub method: String,
    pub password: String,
}

impl ShadowsocksOutbound {
    pub fn new(server: ServerAddr, method: &str, password: &str) -> Result<Self, NodeError> {
        if !SHADOWSOCKS_METHODS.contains(&method) {
            return Err(NodeError::invalid("method", format!("unknown cipher {:?}", method)));
        }
        if method != "none" && password.is_empty() {
            return Err(NodeError::invalid("password", "empty"));
        }
        Ok(Self {
            server,
            method: method.to_string(),
            password: password.to_string(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VlessOutbound {
    pub server: ServerAddr,
    pub uuid: Uuid,
}

impl VlessOutbound {
    pub fn new(server: ServerAddr, uuid: &str) -> Result<Self, NodeError> {
        let uuid = Uuid::parse_str(uuid.trim())
            .map_err(|e| NodeError::invalid("uuid", e.to_string()))?;
        Ok(Self { server, uuid })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SocksOutbound {
    pub server: ServerAddr,
    pub username: String,
    pub password: String,
}

impl SocksOutbound {
    pub fn new(server: ServerAddr, username: Option<&str>, password: &str) -> Result<Self, NodeError> {
        let username = username.unwrap_or(DEFAULT_SOCKS_USERNAME);
        if username.len() > 255 || password.len() > 255 {
            return Err(NodeError::invalid("credentials", "longer than 255 bytes"));
        }
        Ok(Self {
            server,
            username: username.to_string(),
            password: password.to_string(),
        })
    }
}

/// Validated dial descriptor, one variant per protocol
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundSpec {
    Shadowsocks(ShadowsocksOutbound),
    Vless(VlessOutbound),
    Socks(SocksOutbound),
}

impl OutboundSpec {
    /// Derive the spec for `node`
    pub fn from_node(node: &ProxyNode) -> Result<Self, NodeError> {
        let server = ServerAddr::new(&node.host, node.port)?;
        match node.protocol.as_str() {
            "shadowsocks" => Ok(Self::Shadowsocks(ShadowsocksOutbound::new(
                server,
                &node.method,
                &node.password,
            )?)),
            "vless" => Ok(Self::Vless(VlessOutbound::new(server, &node.password)?)),
            "socks" => Ok(Self::Socks(SocksOutbound::new(
                server,
                node.username.as_deref(),
                &node.password,
            )?)),
            other => Err(NodeError::UnsupportedProtocol(other.to_string())),
        }
    }

    pub fn protocol(&self) -> &'static str {
        match self {
            Self::Shadowsocks(_) => "shadowsocks",
            Self::Vless(_) => "vless",
            Self::Socks(_) => "socks",
        }
    }

    pub fn server(&self) -> &ServerAddr {
        match self {
            Self::Shadowsocks(o) => &o.server,
            Self::Vless(o) => &o.server,
            Self::Socks(o) => &o.server,
        }
    }

    /// Engine outbound object tagged `tag`
    pub fn to_engine_json(&self, tag: &str) -> Value {
        let server = self.server();
        let mut outbound = json!({
            "type": self.protocol(),
            "tag": tag,
            "server": server.host,
            "server_port": server.port,
        });
        let extra = match self {
            Self::Shadowsocks(o) => json!({
                "method": o.method,
                "password": o.password,
                "udp_over_tcp": { "enabled": true, "version": 2 },
            }),
            Self::Vless(o) => json!({
                "uuid": o.uuid.to_string(),
                "multiplex": {
                    "enabled": true,
                    "protocol": "h2mux",
                    "max_connections": 8,
                    "min_streams": 16,
                    "padding": false,
                },
            }),
            Self::Socks(o) => json!({
                "version": "5",
                "username": o.username,
                "password": o.password,
                "udp_over_tcp": { "enabled": true, "version": 2 },
            }),
        };
        if let (Some(target), Value::Object(fields)) = (outbound.as_object_mut(), extra) {
            target.extend(fields);
        }
        outbound
    }
}

/// Where the node list comes from
#[async_trait]
pub trait NodeSource: Send + Sync {
    async fn fetch_nodes(&self) -> Result<Vec<ProxyNode>, NodeError>;
}

/// Node list fetched from `<api_base>/proxy.json`
///
/// Transport failures fall back to the bundled nodes; a list that arrives
/// but does not parse is an error.
pub struct RemoteNodeSource {
    client: HttpClient,
    url: String,
    fallback: Vec<ProxyNode>,
}

impl RemoteNodeSource {
    pub fn new(client: HttpClient, url: impl Into<String>, fallback: Vec<ProxyNode>) -> Self {
        Self {
            client,
            url: url.into(),
            fallback,
        }
    }
}

#[async_trait]
impl NodeSource for RemoteNodeSource {
    async fn fetch_nodes(&self) -> Result<Vec<ProxyNode>, NodeError> {
        let response = match self.client.get(&self.url).await {
            Ok(response) => response,
            Err(e) => {
                warn!(
                    "Node list fetch from {} failed ({}), using {} bundled nodes",
                    self.url,
                    e,
                    self.fallback.len()
                );
                return Ok(self.fallback.clone());
            }
        };
        let nodes = parse_node_list(&response.body)?;
        debug!("Fetched {} nodes from {}", nodes.len(), self.url);
        Ok(nodes)
    }
}

/// Decode a JSON node list
pub fn parse_node_list(body: &[u8]) -> Result<Vec<ProxyNode>, NodeError> {
    serde_json::from_slice(body).map_err(|e| NodeError::Malformed(e.to_string()))
}
