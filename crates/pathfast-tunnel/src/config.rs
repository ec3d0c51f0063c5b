//! Application Configuration
//!
//! Loaded from TOML or JSON (chosen by file extension). Every field has a
//! default, so an empty file is a valid configuration.
//!
//! ```toml
//! api_base = "https://api.pathfast.net"
//!
//! [engine]
//! binary = "/usr/local/bin/sing-box"
//!
//! [scan]
//! max_workers = 32
//!
//! [[nodes]]
//! name = "fallback-hk"
//! protocol = "socks"
//! host = "203.0.113.7"
//! port = 1080
//! password = "secret"
//! ```

use crate::engine::EngineSettings;
use crate::node::ProxyNode;
use crate::route::{MIN_DEFAULT_METRIC, RoutePolicy};
use crate::rules::RuleSources;
use crate::validator::ValidatorConfig;
use ipnet::Ipv4Net;
use pathfast_network::ScanConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("parse error: {0}")]
    Parse(String),

    #[error("unsupported config format: {0:?}")]
    UnsupportedFormat(String),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Top-level configuration file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Remote list service base URL
    #[serde(default = "default_api_base")]
    pub api_base: String,
    /// Where rule sets, engine config and logs live
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    #[serde(default = "default_geoip_url")]
    pub geoip_url: String,
    #[serde(default = "default_geosite_url")]
    pub geosite_url: String,
    #[serde(default)]
    pub engine: EngineSection,
    #[serde(default)]
    pub probe: ProbeSection,
    #[serde(default)]
    pub routing: RoutingSection,
    #[serde(default)]
    pub scan: ScanSection,
    /// Used when the remote node list is unreachable
    #[serde(default)]
    pub nodes: Vec<ProxyNode>,
}

fn default_api_base() -> String {
    "https://api.pathfast.net".to_string()
}

fn default_data_dir() -> PathBuf {
    directories::ProjectDirs::from("net", "pathfast", "PathFast")
        .map(|dirs| dirs.data_dir().to_path_buf())
        .unwrap_or_else(|| PathBuf::from("pathfast-data"))
}

fn default_geoip_url() -> String {
    "https://raw.githubusercontent.com/lyc8503/sing-box-rules/refs/heads/rule-set-geoip/geoip-cn.json"
        .to_string()
}

fn default_geosite_url() -> String {
    "https://raw.githubusercontent.com/lyc8503/sing-box-rules/refs/heads/rule-set-geosite/geosite-cn.json"
        .to_string()
}

/// `[engine]`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSection {
    /// Engine executable
    pub binary: String,
    pub tun_interface: String,
    /// TUN address with prefix, e.g. `172.25.0.1/30`
    pub tun_address: Ipv4Net,
    pub mtu: u32,
    /// Clash API listen address
    pub clash_api: String,
}

impl Default for EngineSection {
    fn default() -> Self {
        Self {
            binary: "sing-box".to_string(),
            tun_interface: "utun25".to_string(),
            tun_address: Ipv4Net::new(std::net::Ipv4Addr::new(172, 25, 0, 1), 30)
                .unwrap_or_default(),
            mtu: 1500,
            clash_api: "127.0.0.1:54713".to_string(),
        }
    }
}

/// `[probe]`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProbeSection {
    pub target: String,
    pub timeout_ms: u64,
    pub payload: String,
}

impl Default for ProbeSection {
    fn default() -> Self {
        Self {
            target: "1.1.1.1:80".to_string(),
            timeout_ms: 3000,
            payload: "GET / HTTP/1.1\r\nHost: 1.1.1.1\r\nAccept: *\r\n\r\n\r\n".to_string(),
        }
    }
}

/// `[routing]`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RoutingSection {
    pub interface_metric: u32,
    pub default_metric: u32,
}

impl Default for RoutingSection {
    fn default() -> Self {
        Self {
            interface_metric: 1,
            default_metric: 10,
        }
    }
}

/// `[scan]`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanSection {
    pub max_workers: usize,
    pub retries: u32,
    pub min_success_rate: f64,
    pub ping_timeout_ms: u64,
    pub ping_count: u32,
}

impl Default for ScanSection {
    fn default() -> Self {
        let scan = ScanConfig::default();
        Self {
            max_workers: scan.max_workers,
            retries: scan.retries,
            min_success_rate: scan.min_success_rate,
            ping_timeout_ms: scan.ping_timeout.as_millis() as u64,
            ping_count: scan.ping_count,
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            api_base: default_api_base(),
            data_dir: default_data_dir(),
            geoip_url: default_geoip_url(),
            geosite_url: default_geosite_url(),
            engine: EngineSection::default(),
            probe: ProbeSection::default(),
            routing: RoutingSection::default(),
            scan: ScanSection::default(),
            nodes: Vec::new(),
        }
    }
}

impl AppConfig {
    /// Load from `path`, format chosen by extension
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        let config = match ext {
            "toml" => Self::from_toml(&content)?,
            "json" => Self::from_json(&content)?,
            other => return Err(ConfigError::UnsupportedFormat(other.to_string())),
        };
        config.validate()?;

        info!("Loaded config from {} ({} bundled nodes)", path.display(), config.nodes.len());
        Ok(config)
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    pub fn from_json(content: &str) -> Result<Self, ConfigError> {
        serde_json::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.scan.max_workers == 0 {
            return Err(ConfigError::Invalid("scan.max_workers must be at least 1".into()));
        }
        let rate = self.scan.min_success_rate;
        if !(rate > 0.0 && rate <= 1.0) {
            return Err(ConfigError::Invalid(format!(
                "scan.min_success_rate {} outside (0, 1]",
                rate
            )));
        }
        if self.routing.default_metric < MIN_DEFAULT_METRIC {
            return Err(ConfigError::Invalid(format!(
                "routing.default_metric {} must be at least {}",
                self.routing.default_metric, MIN_DEFAULT_METRIC
            )));
        }
        if self.engine.binary.trim().is_empty() {
            return Err(ConfigError::Invalid("engine.binary is empty".into()));
        }
        for (field, value) in [
            ("api_base", &self.api_base),
            ("geoip_url", &self.geoip_url),
            ("geosite_url", &self.geosite_url),
        ] {
            let parsed = url::Url::parse(value)
                .map_err(|e| ConfigError::Invalid(format!("{} {:?}: {}", field, value, e)))?;
            if !matches!(parsed.scheme(), "http" | "https") {
                return Err(ConfigError::Invalid(format!(
                    "{} must be an http(s) URL, got {:?}",
                    field, value
                )));
            }
        }
        let tun = self.engine.tun_address;
        if tun.prefix_len() > 30 || tun.addr() == tun.network() || tun.addr() == tun.broadcast() {
            return Err(ConfigError::Invalid(format!(
                "engine.tun_address {} is not a usable host address",
                tun
            )));
        }
        Ok(())
    }

    /// Node list URL
    pub fn nodes_url(&self) -> String {
        format!("{}/proxy.json", self.api_base.trim_end_matches('/'))
    }

    pub fn rule_sources(&self) -> RuleSources {
        let base = self.api_base.trim_end_matches('/');
        RuleSources {
            geoip_url: self.geoip_url.clone(),
            geosite_url: self.geosite_url.clone(),
            black_list_url: format!("{}/black-list.json", base),
            direct_list_url: format!("{}/direct-list.json", base),
        }
    }

    pub fn rules_dir(&self) -> PathBuf {
        self.data_dir.join("rules")
    }

    pub fn scan_config(&self) -> ScanConfig {
        ScanConfig {
            max_workers: self.scan.max_workers,
            retries: self.scan.retries,
            min_success_rate: self.scan.min_success_rate,
            ping_count: self.scan.ping_count,
            ping_timeout: Duration::from_millis(self.scan.ping_timeout_ms),
        }
    }

    pub fn validator_config(&self) -> ValidatorConfig {
        ValidatorConfig {
            target: self.probe.target.clone(),
            timeout: Duration::from_millis(self.probe.timeout_ms),
            payload: self.probe.payload.clone().into_bytes(),
        }
    }

    pub fn route_policy(&self) -> RoutePolicy {
        RoutePolicy {
            interface_metric: self.routing.interface_metric,
            default_metric: self.routing.default_metric,
            tun_interface: self.engine.tun_interface.clone(),
            tun_gateway: self.engine.tun_address.addr(),
        }
    }

    pub fn engine_settings(&self) -> EngineSettings {
        EngineSettings {
            binary: self.engine.binary.clone(),
            tun_interface: self.engine.tun_interface.clone(),
            tun_address: self.engine.tun_address,
            mtu: self.engine.mtu,
            clash_api: self.engine.clash_api.clone(),
            data_dir: self.data_dir.clone(),
        }
    }
}
