//! Subnet Scanner
//!
//! Finds a free address in a local IPv4 block by pinging every host
//! address from the top of the range down. Probing runs on a bounded
//! worker pool; the first address judged unreachable wins and every
//! outstanding probe is aborted.

use async_trait::async_trait;
use ipnet::Ipv4Net;
use std::io;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Reachability check for a single address
#[async_trait]
pub trait Pinger: Send + Sync {
    /// Send `count` echo requests and return how many were answered
    async fn ping(&self, addr: Ipv4Addr, count: u32, timeout: Duration) -> io::Result<u32>;
}

/// Pinger backed by the platform `ping` binary
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemPinger;

#[async_trait]
impl Pinger for SystemPinger {
    async fn ping(&self, addr: Ipv4Addr, count: u32, timeout: Duration) -> io::Result<u32> {
        let mut cmd = Command::new("ping");
        if cfg!(windows) {
            cmd.arg("-n")
                .arg(count.to_string())
                .arg("-w")
                .arg(timeout.as_millis().to_string());
        } else if cfg!(target_os = "macos") {
            cmd.arg("-c")
                .arg(count.to_string())
                .arg("-i")
                .arg("0.1")
                .arg("-W")
                .arg(timeout.as_millis().to_string());
        } else {
            cmd.arg("-c")
                .arg(count.to_string())
                .arg("-i")
                .arg("0.2")
                .arg("-W")
                .arg(timeout.as_secs().max(1).to_string());
        }
        cmd.arg(addr.to_string()).kill_on_drop(true);

        // Generous bound: every packet may wait its full timeout.
        let budget = timeout * (count + 1) + Duration::from_secs(1);
        let output = tokio::time::timeout(budget, cmd.output())
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "ping did not finish"))??;

        let stdout = String::from_utf8_lossy(&output.stdout);
        Ok(parse_received(&stdout).unwrap_or(if output.status.success() { count } else { 0 }))
    }
}

/// Extract the received-packet count from `ping` output
///
/// Understands the iputils/BSD summary (`3 packets transmitted, 2 received`)
/// and the Windows one (`Sent = 3, Received = 2`).
pub fn parse_received(output: &str) -> Option<u32> {
    for line in output.lines() {
        if let Some(idx) = line.find("Received = ") {
            let rest = &line[idx + "Received = ".len()..];
            return leading_number(rest);
        }
        if line.contains("transmitted") {
            for part in line.split(',') {
                let part = part.trim();
                if part.ends_with("received") || part.ends_with("packets received") {
                    return leading_number(part);
                }
            }
        }
    }
    None
}

fn leading_number(s: &str) -> Option<u32> {
    let digits: String = s.chars().take_while(|c| c.is_ascii_digit()).collect();
    digits.parse().ok()
}

/// Scanner tuning
#[derive(Debug, Clone)]
pub struct ScanConfig {
    /// Concurrent probe ceiling
    pub max_workers: usize,
    /// Ping bursts per address before it is judged unreachable
    pub retries: u32,
    /// Fraction of a burst that must be answered
    pub min_success_rate: f64,
    /// Packets per burst
    pub ping_count: u32,
    /// Per-packet timeout
    pub ping_timeout: Duration,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            max_workers: 50,
            retries: 2,
            min_success_rate: 0.5,
            ping_count: 3,
            ping_timeout: Duration::from_millis(500),
        }
    }
}

/// Scanner errors
#[derive(Debug, thiserror::Error)]
pub enum ScanError {
    #[error("all addresses in {0} are in use")]
    AllInUse(Ipv4Net),

    #[error("scan cancelled")]
    Cancelled,
}

/// Concurrent free-address finder
pub struct SubnetScanner {
    config: ScanConfig,
    pinger: Arc<dyn Pinger>,
}

impl SubnetScanner {
    pub fn new(config: ScanConfig, pinger: Arc<dyn Pinger>) -> Self {
        Self { config, pinger }
    }

    /// Scanner using the system `ping` and default tuning
    pub fn with_defaults() -> Self {
        Self::new(ScanConfig::default(), Arc::new(SystemPinger))
    }

    /// Return the first host address in `cidr` that does not answer pings
    pub async fn find_unused_address(
        &self,
        cidr: Ipv4Net,
        cancel: &CancellationToken,
    ) -> Result<Ipv4Addr, ScanError> {
        let hosts = host_addresses(cidr);
        info!(
            "Scanning {} ({} hosts, {} workers)",
            cidr,
            hosts.len(),
            self.config.max_workers
        );

        let semaphore = Arc::new(Semaphore::new(self.config.max_workers.max(1)));
        let mut pending = hosts;
        let mut next = pending.next();
        let mut tasks: JoinSet<(Ipv4Addr, bool)> = JoinSet::new();

        loop {
            if next.is_none() && tasks.is_empty() {
                return Err(ScanError::AllInUse(cidr));
            }

            tokio::select! {
                biased;

                _ = cancel.cancelled() => {
                    tasks.abort_all();
                    return Err(ScanError::Cancelled);
                }

                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    match joined {
                        Ok((addr, false)) => {
                            tasks.abort_all();
                            info!("Found unused address {}", addr);
                            return Ok(addr);
                        }
                        Ok((_, true)) => {}
                        Err(e) if e.is_cancelled() => {}
                        Err(e) => warn!("Probe task failed: {}", e),
                    }
                }

                permit = semaphore.clone().acquire_owned(), if next.is_some() => {
                    let Ok(permit) = permit else {
                        return Err(ScanError::Cancelled);
                    };
                    if let Some(addr) = next.take() {
                        let pinger = self.pinger.clone();
                        let config = self.config.clone();
                        tasks.spawn(async move {
                            let reachable = is_reachable(pinger.as_ref(), addr, &config).await;
                            drop(permit);
                            (addr, reachable)
                        });
                    }
                    next = pending.next();
                }
            }
        }
    }
}

async fn is_reachable(pinger: &dyn Pinger, addr: Ipv4Addr, config: &ScanConfig) -> bool {
    let count = config.ping_count.max(1);
    for attempt in 0..config.retries.max(1) {
        match pinger.ping(addr, count, config.ping_timeout).await {
            Ok(received) => {
                if f64::from(received) / f64::from(count) >= config.min_success_rate {
                    return true;
                }
            }
            Err(e) => debug!("Ping {} attempt {} failed: {}", addr, attempt + 1, e),
        }
    }
    false
}

/// Host addresses of `net`, highest first, without network and broadcast
///
/// Lazy, so even a `/0` costs nothing until addresses are pulled.
pub fn host_addresses(net: Ipv4Net) -> impl ExactSizeIterator<Item = Ipv4Addr> + Send {
    let network = u32::from(net.network());
    let broadcast = u32::from(net.broadcast());
    (network.saturating_add(1)..broadcast)
        .rev()
        .map(Ipv4Addr::from)
}
