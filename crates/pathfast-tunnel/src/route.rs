//! Route Policy Manager
//!
//! Installs the split-tunnel routing policy and tears it down again.
//!
//! # Policy
//!
//! With the default route at effective metric `m` after re-weighting:
//!
//! ```text
//! geo-IP prefixes + proxy /32  via original gateway   metric m-2
//! 0.0.0.0/0                    via tunnel gateway     metric m-1
//! 0.0.0.0/0                    via original gateway   metric m
//! ```
//!
//! Every successful mutation is journaled with its compensating action.
//! A fatal failure during install replays the journal in reverse;
//! [`RoutePolicyManager::remove`] does the same on request.

use crate::rules::RuleStore;
use async_trait::async_trait;
use ipnet::Ipv4Net;
use std::collections::BTreeSet;
use std::io;
use std::net::Ipv4Addr;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Smallest effective default-route metric that fits the tunnel default
/// (`m-1`) and the direct prefixes (`m-2`) strictly below it
pub const MIN_DEFAULT_METRIC: u32 = 2;

/// Routing errors
#[derive(Debug, thiserror::Error)]
pub enum RouteError {
    #[error("no IPv4 default route")]
    NoDefaultRoute,

    #[error("`{command}` failed: {reason}")]
    Command { command: String, reason: String },

    #[error("unexpected output from `{command}`: {reason}")]
    Parse { command: String, reason: String },

    #[error("routes already installed")]
    AlreadyInstalled,

    #[error("default route metric {0} leaves no room below it for the tunnel (minimum 2)")]
    MetricTooLow(u32),

    #[error("route IO error: {0}")]
    Io(#[from] io::Error),
}

/// The network that currently carries the default route
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkInfo {
    pub if_index: u32,
    pub if_name: String,
    /// Interface address with its prefix length
    pub local_subnet: Ipv4Net,
    pub gateway: Ipv4Addr,
    /// Metric of the default route
    pub metric: u32,
}

/// One IPv4 route
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RouteEntry {
    pub destination: Ipv4Net,
    pub gateway: Ipv4Addr,
    pub metric: u32,
    pub if_index: u32,
}

impl RouteEntry {
    pub fn mask(&self) -> Ipv4Addr {
        self.destination.netmask()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterfaceMetric {
    Automatic,
    Fixed(u32),
}

/// OS routing surface
#[async_trait]
pub trait RouteTable: Send + Sync {
    async fn default_network(&self) -> Result<NetworkInfo, RouteError>;

    /// Effective metric of the default route on `if_index`
    async fn default_route_metric(&self, if_index: u32) -> Result<u32, RouteError>;

    async fn add_route(&self, route: &RouteEntry) -> Result<(), RouteError>;

    async fn delete_route(&self, route: &RouteEntry) -> Result<(), RouteError>;

    async fn set_interface_metric(
        &self,
        if_index: u32,
        metric: InterfaceMetric,
    ) -> Result<(), RouteError>;

    /// Re-weight the default route of `network`
    async fn set_default_route_metric(
        &self,
        network: &NetworkInfo,
        metric: u32,
    ) -> Result<(), RouteError>;

    async fn set_ip_forwarding(&self, if_index: u32, enabled: bool) -> Result<(), RouteError>;

    /// Index of the interface called `name`, if it exists
    async fn interface_index(&self, name: &str) -> Result<Option<u32>, RouteError>;
}

/// Metrics and tunnel addressing used by the manager
#[derive(Debug, Clone)]
pub struct RoutePolicy {
    pub interface_metric: u32,
    pub default_metric: u32,
    pub tun_interface: String,
    pub tun_gateway: Ipv4Addr,
}

impl Default for RoutePolicy {
    fn default() -> Self {
        Self {
            interface_metric: 1,
            default_metric: 10,
            tun_interface: "utun25".to_string(),
            tun_gateway: Ipv4Addr::new(172, 25, 0, 1),
        }
    }
}

/// What [`RoutePolicyManager::install`] did
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallReport {
    pub installed: usize,
    /// Prefixes whose route could not be added
    pub skipped: usize,
    /// Whether the tunnel default route was added
    pub tunnel_default: bool,
    /// Effective default-route metric the policy was computed from
    pub metric: u32,
}

#[derive(Debug, Clone)]
enum Compensation {
    RestoreInterfaceMetric { if_index: u32 },
    RestoreDefaultMetric { network: NetworkInfo, original: u32 },
    DeleteRoute(RouteEntry),
}

pub struct RoutePolicyManager {
    table: Arc<dyn RouteTable>,
    rules: Arc<RuleStore>,
    policy: RoutePolicy,
    snapshot: Option<NetworkInfo>,
    journal: Vec<Compensation>,
}

impl RoutePolicyManager {
    pub fn new(table: Arc<dyn RouteTable>, rules: Arc<RuleStore>, policy: RoutePolicy) -> Self {
        Self {
            table,
            rules,
            policy,
            snapshot: None,
            journal: Vec::new(),
        }
    }

    pub fn table(&self) -> &Arc<dyn RouteTable> {
        &self.table
    }

    pub fn rules(&self) -> &Arc<RuleStore> {
        &self.rules
    }

    /// Network captured at install time
    pub fn snapshot(&self) -> Option<&NetworkInfo> {
        self.snapshot.as_ref()
    }

    pub fn is_installed(&self) -> bool {
        !self.journal.is_empty()
    }

    /// Geo-IP prefixes from the current rule snapshot plus `appends`
    pub fn route_prefixes(&self, appends: &[Ipv4Net]) -> Vec<Ipv4Net> {
        let assets = self.rules.snapshot();
        let set: BTreeSet<Ipv4Net> = assets
            .geoip_prefixes()
            .iter()
            .chain(appends)
            .map(|p| p.trunc())
            .collect();
        set.into_iter().collect()
    }

    /// Install the policy; `appends` are extra prefixes routed direct
    pub async fn install(&mut self, appends: &[Ipv4Net]) -> Result<InstallReport, RouteError> {
        if self.is_installed() {
            return Err(RouteError::AlreadyInstalled);
        }

        match self.try_install(appends).await {
            Ok(report) => {
                info!(
                    "Routes installed: {} prefixes ({} skipped), tunnel default {}, metric {}",
                    report.installed, report.skipped, report.tunnel_default, report.metric
                );
                Ok(report)
            }
            Err(e) => {
                error!("Route install failed, rolling back: {}", e);
                if let Err(rollback) = self.unwind().await {
                    warn!("Rollback incomplete: {}", rollback);
                }
                Err(e)
            }
        }
    }

    async fn try_install(&mut self, appends: &[Ipv4Net]) -> Result<InstallReport, RouteError> {
        let network = self.table.default_network().await?;
        debug!(
            "Default network: {} (#{}) {} via {} metric {}",
            network.if_name, network.if_index, network.local_subnet, network.gateway, network.metric
        );
        self.snapshot = Some(network.clone());

        self.table
            .set_interface_metric(network.if_index, InterfaceMetric::Fixed(self.policy.interface_metric))
            .await?;
        self.journal.push(Compensation::RestoreInterfaceMetric {
            if_index: network.if_index,
        });

        self.table
            .set_default_route_metric(&network, self.policy.default_metric)
            .await?;
        self.journal.push(Compensation::RestoreDefaultMetric {
            network: NetworkInfo {
                metric: self.policy.default_metric,
                ..network.clone()
            },
            original: network.metric,
        });

        let metric = self.table.default_route_metric(network.if_index).await?;
        if metric < MIN_DEFAULT_METRIC {
            return Err(RouteError::MetricTooLow(metric));
        }
        let prefix_metric = metric - 2;

        let mut installed = 0;
        let mut skipped = 0;
        for destination in self.route_prefixes(appends) {
            let entry = RouteEntry {
                destination,
                gateway: network.gateway,
                metric: prefix_metric,
                if_index: network.if_index,
            };
            match self.table.add_route(&entry).await {
                Ok(()) => {
                    installed += 1;
                    self.journal.push(Compensation::DeleteRoute(entry));
                }
                Err(e) => {
                    warn!("Skipping route {}: {}", destination, e);
                    skipped += 1;
                }
            }
        }

        let tunnel_default = match self.table.interface_index(&self.policy.tun_interface).await? {
            Some(tun_index) => {
                let entry = RouteEntry {
                    destination: Ipv4Net::default(),
                    gateway: self.policy.tun_gateway,
                    metric: metric - 1,
                    if_index: tun_index,
                };
                self.table.add_route(&entry).await?;
                self.journal.push(Compensation::DeleteRoute(entry));
                true
            }
            None => {
                warn!("Tunnel interface {} not present", self.policy.tun_interface);
                false
            }
        };

        Ok(InstallReport {
            installed,
            skipped,
            tunnel_default,
            metric,
        })
    }

    /// Undo everything `install` did; every step is attempted
    pub async fn remove(&mut self) -> Result<(), RouteError> {
        if !self.is_installed() {
            return Ok(());
        }
        let count = self.journal.len();
        let result = self.unwind().await;
        info!("Routing policy removed ({} actions replayed)", count);
        result
    }

    async fn unwind(&mut self) -> Result<(), RouteError> {
        let mut first_error = None;
        while let Some(action) = self.journal.pop() {
            let outcome = match &action {
                Compensation::DeleteRoute(entry) => self.table.delete_route(entry).await,
                Compensation::RestoreDefaultMetric { network, original } => {
                    self.table.set_default_route_metric(network, *original).await
                }
                Compensation::RestoreInterfaceMetric { if_index } => {
                    self.table
                        .set_interface_metric(*if_index, InterfaceMetric::Automatic)
                        .await
                }
            };
            if let Err(e) = outcome {
                warn!("Compensation {:?} failed: {}", action, e);
                first_error.get_or_insert(e);
            }
        }
        self.snapshot = None;
        first_error.map_or(Ok(()), Err)
    }
}

/// Addressing for a device routed through this host
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceLease {
    pub address: Ipv4Addr,
    pub gateway: Ipv4Addr,
    pub netmask: Ipv4Addr,
}

impl DeviceLease {
    pub fn for_network(address: Ipv4Addr, network: &NetworkInfo) -> Self {
        Self {
            address,
            gateway: network.gateway,
            netmask: network.local_subnet.netmask(),
        }
    }
}

impl std::fmt::Display for DeviceLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "address {} netmask {} gateway {}",
            self.address, self.netmask, self.gateway
        )
    }
}
