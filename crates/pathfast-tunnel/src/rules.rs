//! Rule Assets
//!
//! The four rule sets handed to the engine: domestic geo-IP and geo-site,
//! the black list and the direct list. All are source-format JSON rule
//! sets stored under the data directory.
//!
//! Readers take an `Arc` snapshot; [`RuleStore::refresh`] builds a new
//! [`RuleAssets`] and swaps the pointer, so a snapshot in use by an active
//! session is never mutated. Files are replaced via temp file + rename.

use ipnet::Ipv4Net;
use parking_lot::RwLock;
use pathfast_network::HttpClient;
use serde::Deserialize;
use serde_json::Value;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info, warn};

const BUNDLED_GEOIP: &[u8] = include_bytes!("../assets/geoip-cn.json");
const BUNDLED_GEOSITE: &[u8] = include_bytes!("../assets/geosite-cn.json");
const BUNDLED_BLACK_LIST: &[u8] = include_bytes!("../assets/black-list.json");
const BUNDLED_DIRECT_LIST: &[u8] = include_bytes!("../assets/direct-list.json");

/// One of the engine's rule sets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RuleKind {
    GeoIp,
    GeoSite,
    BlackList,
    DirectList,
}

impl RuleKind {
    pub const ALL: [RuleKind; 4] = [
        RuleKind::GeoIp,
        RuleKind::GeoSite,
        RuleKind::BlackList,
        RuleKind::DirectList,
    ];

    /// Rule-set tag referenced by engine rules
    pub fn tag(&self) -> &'static str {
        match self {
            RuleKind::GeoIp => "geoip-cn",
            RuleKind::GeoSite => "geosite-cn",
            RuleKind::BlackList => "black-list",
            RuleKind::DirectList => "direct-list",
        }
    }

    pub fn file_name(&self) -> String {
        format!("{}.json", self.tag())
    }

    fn index(&self) -> usize {
        match self {
            RuleKind::GeoIp => 0,
            RuleKind::GeoSite => 1,
            RuleKind::BlackList => 2,
            RuleKind::DirectList => 3,
        }
    }
}

/// Rule asset errors
#[derive(Debug, thiserror::Error)]
pub enum RuleError {
    #[error("Invalid {kind} rule set: {reason}")]
    Invalid { kind: &'static str, reason: String },

    #[error("Rule file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Deserialize)]
struct RuleSetSource {
    rules: Vec<Value>,
}

fn parse_rule_set(kind: RuleKind, bytes: &[u8]) -> Result<RuleSetSource, RuleError> {
    serde_json::from_slice(bytes).map_err(|e| RuleError::Invalid {
        kind: kind.tag(),
        reason: e.to_string(),
    })
}

/// IPv4 prefixes listed under `ip_cidr` anywhere in a rule set
///
/// Bare addresses become /32; IPv6 entries are skipped.
pub fn extract_ipv4_prefixes(bytes: &[u8]) -> Result<Vec<Ipv4Net>, RuleError> {
    let source = parse_rule_set(RuleKind::GeoIp, bytes)?;
    let mut prefixes = Vec::new();
    for rule in &source.rules {
        collect_prefixes(rule, &mut prefixes);
    }
    Ok(prefixes)
}

fn collect_prefixes(rule: &Value, out: &mut Vec<Ipv4Net>) {
    match rule.get("ip_cidr") {
        Some(Value::Array(entries)) => {
            for entry in entries.iter().filter_map(Value::as_str) {
                if let Some(net) = parse_ipv4_prefix(entry) {
                    out.push(net);
                }
            }
        }
        Some(Value::String(entry)) => {
            if let Some(net) = parse_ipv4_prefix(entry) {
                out.push(net);
            }
        }
        _ => {}
    }
    // logical rules nest their members
    if let Some(Value::Array(nested)) = rule.get("rules") {
        for inner in nested {
            collect_prefixes(inner, out);
        }
    }
}

fn parse_ipv4_prefix(entry: &str) -> Option<Ipv4Net> {
    let entry = entry.trim();
    if let Ok(net) = entry.parse::<Ipv4Net>() {
        return Some(net.trunc());
    }
    entry
        .parse::<Ipv4Addr>()
        .ok()
        .and_then(|addr| Ipv4Net::new(addr, 32).ok())
}

/// Immutable set of rule-set payloads
#[derive(Debug, Clone)]
pub struct RuleAssets {
    version: u64,
    payloads: [Arc<[u8]>; 4],
    geoip_prefixes: Arc<[Ipv4Net]>,
}

impl RuleAssets {
    /// Snapshot compiled into the binary
    pub fn bundled() -> Self {
        let payloads = [
            Arc::from(BUNDLED_GEOIP),
            Arc::from(BUNDLED_GEOSITE),
            Arc::from(BUNDLED_BLACK_LIST),
            Arc::from(BUNDLED_DIRECT_LIST),
        ];
        let prefixes = extract_ipv4_prefixes(BUNDLED_GEOIP).unwrap_or_default();
        Self {
            version: 0,
            payloads,
            geoip_prefixes: prefixes.into(),
        }
    }

    /// Build from raw payloads, validating each one
    pub fn from_payloads(
        version: u64,
        geoip: Vec<u8>,
        geosite: Vec<u8>,
        black_list: Vec<u8>,
        direct_list: Vec<u8>,
    ) -> Result<Self, RuleError> {
        for (kind, bytes) in RuleKind::ALL
            .iter()
            .zip([&geoip, &geosite, &black_list, &direct_list])
        {
            parse_rule_set(*kind, bytes)?;
        }
        let prefixes = extract_ipv4_prefixes(&geoip)?;
        Ok(Self {
            version,
            payloads: [
                geoip.into(),
                geosite.into(),
                black_list.into(),
                direct_list.into(),
            ],
            geoip_prefixes: prefixes.into(),
        })
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn payload(&self, kind: RuleKind) -> &[u8] {
        &self.payloads[kind.index()]
    }

    pub fn geoip_prefixes(&self) -> &[Ipv4Net] {
        &self.geoip_prefixes
    }

    fn with_payload(&self, kind: RuleKind, bytes: Arc<[u8]>) -> Result<Self, RuleError> {
        parse_rule_set(kind, &bytes)?;
        let mut next = self.clone();
        if kind == RuleKind::GeoIp {
            next.geoip_prefixes = extract_ipv4_prefixes(&bytes)?.into();
        }
        next.payloads[kind.index()] = bytes;
        Ok(next)
    }
}

/// Remote locations of each rule set
#[derive(Debug, Clone)]
pub struct RuleSources {
    pub geoip_url: String,
    pub geosite_url: String,
    pub black_list_url: String,
    pub direct_list_url: String,
}

impl RuleSources {
    pub fn url(&self, kind: RuleKind) -> &str {
        match kind {
            RuleKind::GeoIp => &self.geoip_url,
            RuleKind::GeoSite => &self.geosite_url,
            RuleKind::BlackList => &self.black_list_url,
            RuleKind::DirectList => &self.direct_list_url,
        }
    }
}

/// Outcome of a refresh
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefreshReport {
    pub version: u64,
    pub fetched: Vec<RuleKind>,
    pub fallback: Vec<RuleKind>,
}

/// Versioned store for rule assets
pub struct RuleStore {
    dir: PathBuf,
    defaults: RuleAssets,
    current: RwLock<Arc<RuleAssets>>,
    next_version: AtomicU64,
}

impl RuleStore {
    /// In-memory store over `defaults`; nothing is read or written
    pub fn new(dir: impl Into<PathBuf>, defaults: RuleAssets) -> Self {
        let version = defaults.version();
        Self {
            dir: dir.into(),
            current: RwLock::new(Arc::new(defaults.clone())),
            defaults,
            next_version: AtomicU64::new(version + 1),
        }
    }

    /// Load rule files from `dir`, falling back to `defaults` for any that
    /// are missing or invalid, and write the result back
    pub async fn open(dir: impl Into<PathBuf>, defaults: RuleAssets) -> Result<Self, RuleError> {
        let store = Self::new(dir, defaults);
        tokio::fs::create_dir_all(&store.dir)
            .await
            .map_err(|source| RuleError::Io {
                path: store.dir.clone(),
                source,
            })?;

        let mut assets = store.defaults.clone();
        for kind in RuleKind::ALL {
            let path = store.path(kind);
            match tokio::fs::read(&path).await {
                Ok(bytes) => match assets.with_payload(kind, bytes.into()) {
                    Ok(next) => assets = next,
                    Err(e) => warn!("Ignoring {}: {}", path.display(), e),
                },
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!("Cannot read {}: {}", path.display(), e),
            }
        }
        assets.version = store.next_version.fetch_add(1, Ordering::SeqCst);

        store.write_all(&assets).await?;
        *store.current.write() = Arc::new(assets);
        info!("Rule assets loaded from {}", store.dir.display());
        Ok(store)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path(&self, kind: RuleKind) -> PathBuf {
        self.dir.join(kind.file_name())
    }

    /// Current assets; the returned snapshot never changes
    pub fn snapshot(&self) -> Arc<RuleAssets> {
        self.current.read().clone()
    }

    /// Fetch every rule set, substituting the bundled payload for any that
    /// fails to download or parse, then write and swap in the new version
    pub async fn refresh(
        &self,
        client: &HttpClient,
        sources: &RuleSources,
    ) -> Result<RefreshReport, RuleError> {
        let mut assets = self.defaults.clone();
        let mut fetched = Vec::new();
        let mut fallback = Vec::new();

        for kind in RuleKind::ALL {
            let url = sources.url(kind);
            let outcome = match client.get(url).await {
                Ok(response) => assets
                    .with_payload(kind, Arc::from(&response.body[..]))
                    .map_err(|e| e.to_string()),
                Err(e) => Err(e.to_string()),
            };
            match outcome {
                Ok(next) => {
                    debug!("Fetched {} from {}", kind.tag(), url);
                    assets = next;
                    fetched.push(kind);
                }
                Err(reason) => {
                    warn!("Using bundled {} ({})", kind.tag(), reason);
                    fallback.push(kind);
                }
            }
        }

        assets.version = self.next_version.fetch_add(1, Ordering::SeqCst);
        self.write_all(&assets).await?;
        let version = assets.version;
        *self.current.write() = Arc::new(assets);

        info!(
            "Rule assets refreshed to v{} ({} fetched, {} bundled)",
            version,
            fetched.len(),
            fallback.len()
        );
        Ok(RefreshReport {
            version,
            fetched,
            fallback,
        })
    }

    async fn write_all(&self, assets: &RuleAssets) -> Result<(), RuleError> {
        for kind in RuleKind::ALL {
            write_atomic(&self.path(kind), assets.payload(kind)).await?;
        }
        Ok(())
    }
}

async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), RuleError> {
    let tmp = path.with_extension("json.tmp");
    let io_err = |source| RuleError::Io {
        path: path.to_path_buf(),
        source,
    };
    tokio::fs::write(&tmp, bytes).await.map_err(io_err)?;
    tokio::fs::rename(&tmp, path).await.map_err(io_err)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn unreachable_sources() -> RuleSources {
        // port 9 on loopback is closed in test environments
        let base = "http://127.0.0.1:9";
        RuleSources {
            geoip_url: format!("{}/geoip-cn.json", base),
            geosite_url: format!("{}/geosite-cn.json", base),
            black_list_url: format!("{}/black-list.json", base),
            direct_list_url: format!("{}/direct-list.json", base),
        }
    }

    #[test]
    fn test_bundled_assets_are_valid() {
        let assets = RuleAssets::bundled();
        assert!(!assets.geoip_prefixes().is_empty());
        assert!(
            assets
                .geoip_prefixes()
                .contains(&"1.0.1.0/24".parse::<Ipv4Net>().unwrap())
        );
        for kind in RuleKind::ALL {
            assert!(parse_rule_set(kind, assets.payload(kind)).is_ok());
        }
    }

    #[test]
    fn test_extract_prefixes() {
        let json = br#"{
            "version": 2,
            "rules": [
                {"ip_cidr": ["10.1.0.0/16", "2001:db8::/32", "192.0.2.7", "bogus"]},
                {"domain": ["example.com"]},
                {"type": "logical", "mode": "or", "rules": [{"ip_cidr": "198.51.100.9/24"}]}
            ]
        }"#;
        let prefixes = extract_ipv4_prefixes(json).unwrap();
        let expected: Vec<Ipv4Net> = ["10.1.0.0/16", "192.0.2.7/32", "198.51.100.0/24"]
            .iter()
            .map(|s| s.parse().unwrap())
            .collect();
        assert_eq!(prefixes, expected);
    }

    #[test]
    fn test_invalid_rule_set() {
        assert!(extract_ipv4_prefixes(b"[1, 2, 3]").is_err());
        let result = RuleAssets::from_payloads(1, b"{}".to_vec(), vec![], vec![], vec![]);
        assert!(matches!(result, Err(RuleError::Invalid { .. })));
    }

    #[tokio::test]
    async fn test_open_writes_missing_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = RuleStore::open(dir.path(), RuleAssets::bundled()).await.unwrap();

        for kind in RuleKind::ALL {
            let on_disk = std::fs::read(store.path(kind)).unwrap();
            assert_eq!(on_disk, store.snapshot().payload(kind));
        }
    }

    #[tokio::test]
    async fn test_open_keeps_valid_files_and_replaces_invalid() {
        let dir = tempfile::tempdir().unwrap();
        let custom = br#"{"version":2,"rules":[{"ip_cidr":["203.0.113.0/24"]}]}"#;
        std::fs::write(dir.path().join("geoip-cn.json"), custom).unwrap();
        std::fs::write(dir.path().join("black-list.json"), b"not json").unwrap();

        let store = RuleStore::open(dir.path(), RuleAssets::bundled()).await.unwrap();
        let snapshot = store.snapshot();
        assert_eq!(
            snapshot.geoip_prefixes(),
            &["203.0.113.0/24".parse::<Ipv4Net>().unwrap()]
        );
        assert_eq!(
            snapshot.payload(RuleKind::BlackList),
            RuleAssets::bundled().payload(RuleKind::BlackList)
        );
        let rewritten = std::fs::read(store.path(RuleKind::BlackList)).unwrap();
        assert_eq!(rewritten, RuleAssets::bundled().payload(RuleKind::BlackList));
    }

    #[tokio::test]
    async fn test_refresh_falls_back_and_keeps_old_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let store = RuleStore::open(dir.path(), RuleAssets::bundled()).await.unwrap();
        let before = store.snapshot();

        let report = store
            .refresh(&HttpClient::with_defaults(), &unreachable_sources())
            .await
            .unwrap();

        assert_eq!(report.fallback.len(), 4);
        assert!(report.fetched.is_empty());
        assert!(report.version > before.version());

        let after = store.snapshot();
        assert_eq!(after.version(), report.version);
        // the earlier snapshot is untouched
        assert_eq!(before.version() + 1, report.version);
        assert_eq!(before.geoip_prefixes(), after.geoip_prefixes());
    }

    #[tokio::test]
    async fn test_refresh_fetches_remote_geoip() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let body = r#"{"version":2,"rules":[{"ip_cidr":["100.100.0.0/16"]}]}"#;
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 2048];
            let _ = socket.read(&mut buf).await;
            let reply = format!(
                "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                body.len(),
                body
            );
            socket.write_all(reply.as_bytes()).await.unwrap();
        });

        let dir = tempfile::tempdir().unwrap();
        let store = RuleStore::new(dir.path(), RuleAssets::bundled());
        let old = store.snapshot();
        let mut sources = unreachable_sources();
        sources.geoip_url = format!("http://{}/geoip-cn.json", addr);

        let report = store
            .refresh(&HttpClient::with_defaults(), &sources)
            .await
            .unwrap();
        assert_eq!(report.fetched, vec![RuleKind::GeoIp]);

        let snapshot = store.snapshot();
        assert_eq!(
            snapshot.geoip_prefixes(),
            &["100.100.0.0/16".parse::<Ipv4Net>().unwrap()]
        );
        assert_ne!(old.geoip_prefixes(), snapshot.geoip_prefixes());
        assert!(!dir.path().join("geoip-cn.json.tmp").exists());
    }
}
