//! Tunnel Engine
//!
//! The packet engine is an opaque collaborator with `start`/`close`. This
//! module builds its JSON configuration (TUN inbound, split DNS, the fixed
//! route rule chain) and drives an external engine process.
//!
//! # Route rule priority
//!
//! ```text
//! 1. reject UDP/443           (forces QUIC back to TCP)
//! 2. sniff dns/http/tls/quic
//! 3. black-list      -> reject
//! 4. direct-list     -> direct
//! 5. DNS protocol    -> hijack
//! 6. geosite/geoip   -> direct
//! 7. everything else -> proxy
//! ```

use crate::node::OutboundSpec;
use crate::rules::{RuleKind, RuleStore};
use async_trait::async_trait;
use ipnet::Ipv4Net;
use pathfast_network::parse_ipv4_literal;
use serde_json::{Value, json};
use std::io;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

/// Outbound tag of the selected node
pub const PROXY_TAG: &str = "proxy";
pub const DIRECT_TAG: &str = "direct";
const PROXY_DNS_TAG: &str = "proxyDns";
const LOCAL_DNS_TAG: &str = "localDns";

/// Engine lifecycle errors
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("failed to write engine config {path}: {source}")]
    Config {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to spawn engine {binary}: {source}")]
    Spawn {
        binary: String,
        #[source]
        source: io::Error,
    },

    #[error("engine exited during startup: {0}")]
    Exited(String),

    #[error("engine already started")]
    AlreadyStarted,

    #[error("engine IO error: {0}")]
    Io(#[from] io::Error),
}

/// Static engine parameters
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub binary: String,
    pub tun_interface: String,
    pub tun_address: Ipv4Net,
    pub mtu: u32,
    pub clash_api: String,
    /// Holds `config.json` and `run.log`
    pub data_dir: PathBuf,
}

impl EngineSettings {
    pub fn config_path(&self) -> PathBuf {
        self.data_dir.join("config.json")
    }

    pub fn log_path(&self) -> PathBuf {
        self.data_dir.join("run.log")
    }
}

/// Complete configuration for one engine run
#[derive(Debug, Clone)]
pub struct EngineConfig {
    outbound: OutboundSpec,
    /// Names resolved through the local DNS server
    local_domains: Vec<String>,
    settings: EngineSettings,
    rule_paths: Vec<(RuleKind, PathBuf)>,
}

impl EngineConfig {
    pub fn new(outbound: OutboundSpec, settings: EngineSettings, rules: &RuleStore) -> Self {
        // the proxy host itself must never be resolved through the proxy
        let host = &outbound.server().host;
        let local_domains = if parse_ipv4_literal(host).is_some() || host.contains(':') {
            Vec::new()
        } else {
            vec![host.clone()]
        };
        Self {
            local_domains,
            settings,
            rule_paths: RuleKind::ALL.iter().map(|k| (*k, rules.path(*k))).collect(),
            outbound,
        }
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    pub fn outbound(&self) -> &OutboundSpec {
        &self.outbound
    }

    pub fn to_json(&self) -> Value {
        let s = &self.settings;

        let mut dns_rules = vec![json!({
            "rule_set": RuleKind::GeoSite.tag(),
            "server": LOCAL_DNS_TAG,
        })];
        if !self.local_domains.is_empty() {
            dns_rules.push(json!({
                "domain": self.local_domains,
                "server": LOCAL_DNS_TAG,
            }));
        }

        let rule_sets: Vec<Value> = self
            .rule_paths
            .iter()
            .map(|(kind, path)| {
                json!({
                    "type": "local",
                    "tag": kind.tag(),
                    "format": "source",
                    "path": path.to_string_lossy(),
                })
            })
            .collect();

        json!({
            "log": {
                "level": "info",
                "output": s.log_path().to_string_lossy(),
                "timestamp": true,
            },
            "dns": {
                "servers": [
                    {
                        "tag": PROXY_DNS_TAG,
                        "type": "https",
                        "server": "cloudflare-dns.com",
                        "server_port": 443,
                        "detour": PROXY_TAG,
                    },
                    {
                        "tag": LOCAL_DNS_TAG,
                        "type": "https",
                        "server": "223.5.5.5",
                        "server_port": 443,
                    },
                ],
                "rules": dns_rules,
                "final": PROXY_DNS_TAG,
                "strategy": "ipv4_only",
                "cache_capacity": 2048,
            },
            "inbounds": [{
                "type": "tun",
                "tag": "tun-in",
                "interface_name": s.tun_interface,
                "address": [s.tun_address.to_string()],
                "mtu": s.mtu,
                "auto_route": false,
                "stack": "gvisor",
                "udp_timeout": "300s",
            }],
            "outbounds": [
                self.outbound.to_engine_json(PROXY_TAG),
                { "type": "direct", "tag": DIRECT_TAG },
            ],
            "route": {
                "rules": [
                    { "network": "udp", "port": 443, "action": "reject" },
                    { "action": "sniff", "sniffer": ["dns", "http", "tls", "quic"] },
                    { "rule_set": RuleKind::BlackList.tag(), "action": "reject" },
                    { "rule_set": RuleKind::DirectList.tag(), "outbound": DIRECT_TAG },
                    { "protocol": "dns", "action": "hijack-dns" },
                    {
                        "rule_set": [RuleKind::GeoSite.tag(), RuleKind::GeoIp.tag()],
                        "outbound": DIRECT_TAG,
                    },
                ],
                "rule_set": rule_sets,
                "final": PROXY_TAG,
                "auto_detect_interface": true,
                "default_domain_resolver": LOCAL_DNS_TAG,
            },
            "experimental": {
                "clash_api": { "external_controller": s.clash_api },
            },
        })
    }
}

/// A running (or startable) engine instance
#[async_trait]
pub trait TunnelEngine: Send {
    async fn start(&mut self) -> Result<(), EngineError>;
    async fn close(&mut self) -> Result<(), EngineError>;
}

/// Builds engine instances from a configuration
pub trait EngineFactory: Send + Sync {
    fn create(&self, config: EngineConfig) -> Box<dyn TunnelEngine>;
}

/// Factory for [`ProcessEngine`]
#[derive(Debug, Clone)]
pub struct ProcessEngineFactory {
    startup_grace: Duration,
}

impl ProcessEngineFactory {
    pub fn new(startup_grace: Duration) -> Self {
        Self { startup_grace }
    }
}

impl Default for ProcessEngineFactory {
    fn default() -> Self {
        Self::new(Duration::from_millis(1500))
    }
}

impl EngineFactory for ProcessEngineFactory {
    fn create(&self, config: EngineConfig) -> Box<dyn TunnelEngine> {
        Box::new(ProcessEngine {
            config,
            child: None,
            startup_grace: self.startup_grace,
        })
    }
}

/// Engine running as `<binary> run -c <data_dir>/config.json`
pub struct ProcessEngine {
    config: EngineConfig,
    child: Option<Child>,
    startup_grace: Duration,
}

impl ProcessEngine {
    async fn write_config(&self) -> Result<PathBuf, EngineError> {
        let settings = self.config.settings();
        let path = settings.config_path();
        let config_err = |source| EngineError::Config {
            path: path.clone(),
            source,
        };

        tokio::fs::create_dir_all(&settings.data_dir).await.map_err(config_err)?;
        match tokio::fs::remove_file(settings.log_path()).await {
            Ok(()) => debug!("Removed previous {}", settings.log_path().display()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!("Cannot remove {}: {}", settings.log_path().display(), e),
        }

        let body = serde_json::to_vec_pretty(&self.config.to_json())
            .map_err(|e| config_err(io::Error::new(io::ErrorKind::InvalidData, e)))?;
        tokio::fs::write(&path, body).await.map_err(config_err)?;
        Ok(path)
    }
}

#[async_trait]
impl TunnelEngine for ProcessEngine {
    async fn start(&mut self) -> Result<(), EngineError> {
        if self.child.is_some() {
            return Err(EngineError::AlreadyStarted);
        }

        let path = self.write_config().await?;
        let binary = &self.config.settings().binary;
        let mut child = Command::new(binary)
            .arg("run")
            .arg("-c")
            .arg(&path)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| EngineError::Spawn {
                binary: binary.clone(),
                source,
            })?;

        tokio::time::sleep(self.startup_grace).await;
        if let Some(status) = child.try_wait()? {
            return Err(EngineError::Exited(status.to_string()));
        }

        info!(
            "Engine started (pid {:?}, outbound {} via {})",
            child.id(),
            self.config.outbound().protocol(),
            self.config.outbound().server()
        );
        self.child = Some(child);
        Ok(())
    }

    async fn close(&mut self) -> Result<(), EngineError> {
        let Some(mut child) = self.child.take() else {
            return Ok(());
        };
        if child.try_wait()?.is_none() {
            child.kill().await?;
        }
        info!("Engine stopped");
        Ok(())
    }
}
