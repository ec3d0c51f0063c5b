//! PathFast Tunnel - Split-Tunnel Session and Routing
//!
//! Routes a device's traffic through a chosen proxy node while domestic
//! and blocked destinations keep using the normal default route.
//!
//! # Architecture
//!
//! ```text
//!  start(proxy, routing)
//!          │
//!          ▼
//!  ┌───────────────┐   ┌──────────────┐   ┌───────────────────┐
//!  │ NodeValidator │──▶│ TunnelEngine │──▶│ RoutePolicyManager│
//!  │ probe via node│   │ TUN + rules  │   │ OS routes/metrics │
//!  └───────────────┘   └──────────────┘   └───────────────────┘
//!          │                                        │
//!          ▼                                        ▼
//!   node list + DNS                        geo-IP rule snapshot
//! ```
//!
//! # Features
//!
//! - **Pre-flight check**: every start probes the node through its own outbound
//! - **One engine at a time**: start/stop serialize on the session lock
//! - **Symmetric teardown**: every route mutation is journaled and undone
//! - **Versioned rule assets**: refresh never mutates a snapshot in use

mod config;
mod engine;
mod node;
mod outbound;
mod route;
mod rules;
mod session;
mod system;
mod validator;

#[cfg(test)]
mod testing;

pub use config::{
    AppConfig, ConfigError, EngineSection, ProbeSection, RoutingSection, ScanSection,
};
pub use engine::{
    DIRECT_TAG, EngineConfig, EngineError, EngineFactory, EngineSettings, PROXY_TAG,
    ProcessEngine, ProcessEngineFactory, TunnelEngine,
};
pub use node::{
    DEFAULT_SOCKS_USERNAME, NodeError, NodeSource, OutboundSpec, ProxyNode, RemoteNodeSource,
    ServerAddr, ShadowsocksOutbound, SocksOutbound, VlessOutbound, parse_node_list,
};
pub use outbound::{OutboundError, OutboundRegistry, ProcessOutboundRegistry, Socks5Dialer};
pub use route::{
    DeviceLease, InstallReport, InterfaceMetric, MIN_DEFAULT_METRIC, NetworkInfo, RouteEntry, RouteError,
    RoutePolicy, RoutePolicyManager, RouteTable,
};
pub use rules::{
    RefreshReport, RuleAssets, RuleError, RuleKind, RuleSources, RuleStore,
    extract_ipv4_prefixes,
};
pub use session::{SessionComponents, SessionError, SessionInfo, SessionState, TunnelSession};
pub use system::{IpRouteTable, NetshRouteTable, system_route_table};
pub use validator::{NodeValidator, ValidateError, ValidatedNode, ValidatorConfig};
