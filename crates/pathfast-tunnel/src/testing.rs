//! In-memory collaborators for unit tests

use crate::engine::{EngineConfig, EngineError, EngineFactory, TunnelEngine};
use crate::node::{NodeError, NodeSource, OutboundSpec, ProxyNode};
use crate::outbound::{OutboundError, OutboundRegistry};
use crate::route::{InterfaceMetric, NetworkInfo, RouteEntry, RouteError, RouteTable};
use async_trait::async_trait;
use ipnet::Ipv4Net;
use parking_lot::Mutex;
use pathfast_network::{BoxedStream, Dialer, DnsError, HostResolver, parse_ipv4_literal};
use std::collections::HashSet;
use std::io;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

pub fn socks_node(name: &str, host: &str) -> ProxyNode {
    ProxyNode {
        name: name.to_string(),
        protocol: "socks".to_string(),
        host: host.to_string(),
        port: 1080,
        method: String::new(),
        password: "pw".to_string(),
        username: None,
    }
}

pub struct StaticNodes(pub Vec<ProxyNode>);

#[async_trait]
impl NodeSource for StaticNodes {
    async fn fetch_nodes(&self) -> Result<Vec<ProxyNode>, NodeError> {
        Ok(self.0.clone())
    }
}

/// Resolves IPv4 literals only
pub struct LiteralResolver;

#[async_trait]
impl HostResolver for LiteralResolver {
    async fn resolve_ipv4(&self, host: &str) -> Result<Ipv4Addr, DnsError> {
        parse_ipv4_literal(host).ok_or_else(|| DnsError::NoAddresses(host.to_string()))
    }
}

#[derive(Debug, Clone, Copy)]
enum PeerMode {
    Echo,
    Refuse,
    Silent,
}

struct MockDialer(PeerMode);

#[async_trait]
impl Dialer for MockDialer {
    async fn dial(&self, _addr: &str) -> io::Result<BoxedStream> {
        let (client, mut server) = tokio::io::duplex(4096);
        match self.0 {
            PeerMode::Refuse => return Err(io::ErrorKind::ConnectionRefused.into()),
            PeerMode::Echo => {
                tokio::spawn(async move {
                    let mut buf = [0u8; 1024];
                    while let Ok(n) = server.read(&mut buf).await {
                        // keep latency measurably above zero
                        tokio::time::sleep(std::time::Duration::from_millis(1)).await;
                        if n == 0 || server.write_all(&buf[..n]).await.is_err() {
                            break;
                        }
                    }
                });
            }
            PeerMode::Silent => {
                tokio::spawn(async move {
                    let mut buf = [0u8; 1024];
                    while let Ok(n) = server.read(&mut buf).await {
                        if n == 0 {
                            break;
                        }
                    }
                });
            }
        }
        Ok(Box::new(client))
    }
}

/// Registry whose outbounds reach an in-process peer
pub struct MockRegistry {
    mode: PeerMode,
    created: AtomicUsize,
}

impl MockRegistry {
    fn new(mode: PeerMode) -> Self {
        Self {
            mode,
            created: AtomicUsize::new(0),
        }
    }

    pub fn echo() -> Self {
        Self::new(PeerMode::Echo)
    }

    pub fn refusing() -> Self {
        Self::new(PeerMode::Refuse)
    }

    pub fn silent() -> Self {
        Self::new(PeerMode::Silent)
    }

    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl OutboundRegistry for MockRegistry {
    async fn create_outbound(&self, _spec: &OutboundSpec) -> Result<Arc<dyn Dialer>, OutboundError> {
        self.created.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(MockDialer(self.mode)))
    }
}

/// Engine lifecycle counters
#[derive(Debug, Default)]
pub struct EngineCounters {
    pub created: AtomicUsize,
    pub started: AtomicUsize,
    pub closed: AtomicUsize,
}

pub struct MockEngineFactory {
    pub counters: Arc<EngineCounters>,
    fail_start: bool,
    start_delay: Duration,
    last_config: Mutex<Option<serde_json::Value>>,
}

impl MockEngineFactory {
    pub fn new() -> Self {
        Self {
            counters: Arc::new(EngineCounters::default()),
            fail_start: false,
            start_delay: Duration::ZERO,
            last_config: Mutex::new(None),
        }
    }

    pub fn failing() -> Self {
        Self {
            fail_start: true,
            ..Self::new()
        }
    }

    /// Engines whose start takes `delay`
    pub fn slow(delay: Duration) -> Self {
        Self {
            start_delay: delay,
            ..Self::new()
        }
    }

    pub fn created(&self) -> usize {
        self.counters.created.load(Ordering::SeqCst)
    }

    pub fn started(&self) -> usize {
        self.counters.started.load(Ordering::SeqCst)
    }

    pub fn closed(&self) -> usize {
        self.counters.closed.load(Ordering::SeqCst)
    }

    pub fn last_config(&self) -> Option<serde_json::Value> {
        self.last_config.lock().clone()
    }
}

impl EngineFactory for MockEngineFactory {
    fn create(&self, config: EngineConfig) -> Box<dyn TunnelEngine> {
        self.counters.created.fetch_add(1, Ordering::SeqCst);
        *self.last_config.lock() = Some(config.to_json());
        Box::new(MockEngine {
            counters: self.counters.clone(),
            fail_start: self.fail_start,
            start_delay: self.start_delay,
        })
    }
}

struct MockEngine {
    counters: Arc<EngineCounters>,
    fail_start: bool,
    start_delay: Duration,
}

#[async_trait]
impl TunnelEngine for MockEngine {
    async fn start(&mut self) -> Result<(), EngineError> {
        tokio::time::sleep(self.start_delay).await;
        if self.fail_start {
            return Err(EngineError::Exited("exit status: 1".to_string()));
        }
        self.counters.started.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&mut self) -> Result<(), EngineError> {
        self.counters.closed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Route table mutation, as recorded by [`MockRouteTable`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteCall {
    Add(RouteEntry),
    Delete(RouteEntry),
    InterfaceMetric(u32, InterfaceMetric),
    DefaultMetric(u32),
    Forwarding(u32, bool),
}

struct RouteState {
    network: NetworkInfo,
    routes: Vec<RouteEntry>,
    calls: Vec<RouteCall>,
    interface_metric: InterfaceMetric,
    forwarding: bool,
    tunnel: bool,
    fail_add: HashSet<Ipv4Net>,
    fail_default_metric: bool,
}

/// Route table kept in memory
pub struct MockRouteTable {
    state: Mutex<RouteState>,
}

impl MockRouteTable {
    pub const TUN_INDEX: u32 = 42;

    pub fn new() -> Self {
        Self {
            state: Mutex::new(RouteState {
                network: NetworkInfo {
                    if_index: 7,
                    if_name: "eth0".to_string(),
                    local_subnet: "192.168.1.23/24".parse().unwrap_or_default(),
                    gateway: Ipv4Addr::new(192, 168, 1, 1),
                    metric: 25,
                },
                routes: Vec::new(),
                calls: Vec::new(),
                interface_metric: InterfaceMetric::Automatic,
                forwarding: false,
                tunnel: true,
                fail_add: HashSet::new(),
                fail_default_metric: false,
            }),
        }
    }

    pub fn without_tunnel(self) -> Self {
        self.state.lock().tunnel = false;
        self
    }

    pub fn fail_add(&self, destination: Ipv4Net) {
        self.state.lock().fail_add.insert(destination);
    }

    pub fn fail_default_metric(&self) {
        self.state.lock().fail_default_metric = true;
    }

    pub fn network(&self) -> NetworkInfo {
        self.state.lock().network.clone()
    }

    pub fn routes(&self) -> Vec<RouteEntry> {
        self.state.lock().routes.clone()
    }

    pub fn calls(&self) -> Vec<RouteCall> {
        self.state.lock().calls.clone()
    }

    pub fn interface_metric(&self) -> InterfaceMetric {
        self.state.lock().interface_metric
    }

    pub fn default_metric(&self) -> u32 {
        self.state.lock().network.metric
    }

    pub fn forwarding(&self) -> bool {
        self.state.lock().forwarding
    }

    /// Whether any mutating call was made
    pub fn mutated(&self) -> bool {
        !self.state.lock().calls.is_empty()
    }
}

fn refused(command: &str) -> RouteError {
    RouteError::Command {
        command: command.to_string(),
        reason: "refused by mock".to_string(),
    }
}

#[async_trait]
impl RouteTable for MockRouteTable {
    async fn default_network(&self) -> Result<NetworkInfo, RouteError> {
        Ok(self.network())
    }

    async fn default_route_metric(&self, _if_index: u32) -> Result<u32, RouteError> {
        let state = self.state.lock();
        let interface = match state.interface_metric {
            InterfaceMetric::Fixed(m) => m,
            InterfaceMetric::Automatic => 25,
        };
        Ok(state.network.metric + interface)
    }

    async fn add_route(&self, route: &RouteEntry) -> Result<(), RouteError> {
        let mut state = self.state.lock();
        if state.fail_add.contains(&route.destination) {
            return Err(refused("add"));
        }
        state.calls.push(RouteCall::Add(route.clone()));
        state.routes.push(route.clone());
        Ok(())
    }

    async fn delete_route(&self, route: &RouteEntry) -> Result<(), RouteError> {
        let mut state = self.state.lock();
        state.calls.push(RouteCall::Delete(route.clone()));
        let pos = state
            .routes
            .iter()
            .position(|r| r == route)
            .ok_or_else(|| refused("delete"))?;
        state.routes.remove(pos);
        Ok(())
    }

    async fn set_interface_metric(
        &self,
        if_index: u32,
        metric: InterfaceMetric,
    ) -> Result<(), RouteError> {
        let mut state = self.state.lock();
        state.calls.push(RouteCall::InterfaceMetric(if_index, metric));
        state.interface_metric = metric;
        Ok(())
    }

    async fn set_default_route_metric(
        &self,
        _network: &NetworkInfo,
        metric: u32,
    ) -> Result<(), RouteError> {
        let mut state = self.state.lock();
        if state.fail_default_metric {
            return Err(refused("default metric"));
        }
        state.calls.push(RouteCall::DefaultMetric(metric));
        state.network.metric = metric;
        Ok(())
    }

    async fn set_ip_forwarding(&self, if_index: u32, enabled: bool) -> Result<(), RouteError> {
        let mut state = self.state.lock();
        state.calls.push(RouteCall::Forwarding(if_index, enabled));
        state.forwarding = enabled;
        Ok(())
    }

    async fn interface_index(&self, _name: &str) -> Result<Option<u32>, RouteError> {
        Ok(self.state.lock().tunnel.then_some(Self::TUN_INDEX))
    }
}
