//! Node Validator
//!
//! Resolves a node name to a validated outbound and proves the path works
//! before anything else is touched: the node is looked up, its outbound is
//! materialized as a dialer, and a single latency probe is sent through it.

use crate::node::{NodeError, NodeSource, OutboundSpec, ProxyNode};
use crate::outbound::{OutboundError, OutboundRegistry};
use pathfast_network::{DnsError, HostResolver, LatencyProbe};
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Validation errors
#[derive(Debug, thiserror::Error)]
pub enum ValidateError {
    #[error("node {0:?} not found")]
    NotFound(String),

    #[error("node list unavailable: {0}")]
    Nodes(#[source] NodeError),

    #[error("invalid outbound: {0}")]
    InvalidOutbound(#[source] NodeError),

    #[error("outbound construction failed: {0}")]
    Outbound(#[from] OutboundError),

    #[error("node timed out")]
    NodeTimedOut,

    #[error("cannot resolve proxy server: {0}")]
    Resolve(#[from] DnsError),
}

/// Probe parameters for the health check
#[derive(Debug, Clone)]
pub struct ValidatorConfig {
    /// Probe destination, reached through the node
    pub target: String,
    pub timeout: Duration,
    pub payload: Vec<u8>,
}

impl Default for ValidatorConfig {
    fn default() -> Self {
        Self {
            target: "1.1.1.1:80".to_string(),
            timeout: Duration::from_secs(3),
            payload: b"GET / HTTP/1.1\r\nHost: 1.1.1.1\r\nAccept: *\r\n\r\n\r\n".to_vec(),
        }
    }
}

/// A node that passed the health check
#[derive(Debug, Clone)]
pub struct ValidatedNode {
    /// Position of the node in the fetched list
    pub index: usize,
    pub node: ProxyNode,
    pub spec: OutboundSpec,
    /// IPv4 address of the proxy server
    pub server_ip: Ipv4Addr,
    pub latency: Duration,
}

pub struct NodeValidator {
    nodes: Arc<dyn NodeSource>,
    registry: Arc<dyn OutboundRegistry>,
    resolver: Arc<dyn HostResolver>,
    config: ValidatorConfig,
}

impl NodeValidator {
    pub fn new(
        nodes: Arc<dyn NodeSource>,
        registry: Arc<dyn OutboundRegistry>,
        resolver: Arc<dyn HostResolver>,
        config: ValidatorConfig,
    ) -> Self {
        Self {
            nodes,
            registry,
            resolver,
            config,
        }
    }

    /// All node names currently offered
    pub async fn node_names(&self) -> Result<Vec<String>, ValidateError> {
        let nodes = self.nodes.fetch_nodes().await.map_err(ValidateError::Nodes)?;
        Ok(nodes.into_iter().map(|n| n.name).collect())
    }

    /// Look up `name`, build its outbound and probe through it
    pub async fn validate(&self, name: &str) -> Result<ValidatedNode, ValidateError> {
        let nodes = self.nodes.fetch_nodes().await.map_err(ValidateError::Nodes)?;
        let (index, node) = nodes
            .into_iter()
            .enumerate()
            .find(|(_, n)| n.name == name)
            .ok_or_else(|| ValidateError::NotFound(name.to_string()))?;

        let spec = OutboundSpec::from_node(&node).map_err(ValidateError::InvalidOutbound)?;
        let dialer = self.registry.create_outbound(&spec).await?;

        let probe = LatencyProbe::new(self.config.target.clone())
            .with_timeout(self.config.timeout)
            .with_dialer(dialer);
        if let Err(e) = probe.connect().await {
            warn!("Node {} unreachable: {}", name, e);
            return Err(ValidateError::NodeTimedOut);
        }
        let result = probe.test(&self.config.payload).await;
        probe.close().await;

        if !result.success || result.latency.is_zero() {
            warn!(
                "Node {} failed health check: {}",
                name,
                result.error.as_deref().unwrap_or("zero latency")
            );
            return Err(ValidateError::NodeTimedOut);
        }

        let server_ip = self.resolver.resolve_ipv4(&node.host).await?;
        debug!("Proxy server {} resolved to {}", node.host, server_ip);

        info!(
            "node selected: id={} name={} server={} latency={:?}",
            index,
            node.name,
            spec.server(),
            result.latency
        );
        Ok(ValidatedNode {
            index,
            node,
            spec,
            server_ip,
            latency: result.latency,
        })
    }
}
