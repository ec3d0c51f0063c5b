//! Outbound Registry
//!
//! Turns an [`OutboundSpec`] into a [`Dialer`] so a latency probe can
//! exercise the same path real traffic will take.
//!
//! SOCKS nodes are dialed directly with a SOCKS5 client. Shadowsocks and
//! VLESS nodes get a short-lived helper engine process exposing a local
//! SOCKS inbound, and are dialed through that.

use crate::node::OutboundSpec;
use async_trait::async_trait;
use parking_lot::Mutex;
use pathfast_network::{BoxedStream, Dialer};
use serde_json::json;
use std::io;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

/// SOCKS5 version
const SOCKS5_VERSION: u8 = 0x05;

/// SOCKS5 authentication methods
const AUTH_NO_AUTH: u8 = 0x00;
const AUTH_USER_PASS: u8 = 0x02;
const AUTH_NO_ACCEPTABLE: u8 = 0xFF;

/// Username/password sub-negotiation version (RFC 1929)
const USER_PASS_VERSION: u8 = 0x01;

/// SOCKS5 commands
const CMD_CONNECT: u8 = 0x01;

/// SOCKS5 address types
const ADDR_IPV4: u8 = 0x01;
const ADDR_DOMAIN: u8 = 0x03;
const ADDR_IPV6: u8 = 0x04;

/// SOCKS5 reply codes
const REPLY_SUCCESS: u8 = 0x00;

/// Outbound construction errors
#[derive(Debug, thiserror::Error)]
pub enum OutboundError {
    #[error("failed to write helper config {path}: {source}")]
    Config {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to spawn {binary}: {source}")]
    Spawn {
        binary: String,
        #[source]
        source: io::Error,
    },

    #[error("helper exited before accepting connections")]
    HelperExited,

    #[error("helper not ready after {0:?}")]
    HelperTimeout(Duration),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Materializes outbounds as dialers
#[async_trait]
pub trait OutboundRegistry: Send + Sync {
    async fn create_outbound(&self, spec: &OutboundSpec) -> Result<Arc<dyn Dialer>, OutboundError>;
}

/// SOCKS5 client dialer
#[derive(Debug, Clone)]
pub struct Socks5Dialer {
    proxy: String,
    credentials: Option<(String, String)>,
}

impl Socks5Dialer {
    pub fn new(proxy: impl Into<String>) -> Self {
        Self {
            proxy: proxy.into(),
            credentials: None,
        }
    }

    pub fn with_credentials(mut self, username: &str, password: &str) -> Self {
        self.credentials = Some((username.to_string(), password.to_string()));
        self
    }

    async fn handshake(&self, stream: &mut TcpStream, target: &str) -> io::Result<()> {
        // ===== Method negotiation =====
        let greeting: &[u8] = match self.credentials {
            Some(_) => &[SOCKS5_VERSION, 2, AUTH_NO_AUTH, AUTH_USER_PASS],
            None => &[SOCKS5_VERSION, 1, AUTH_NO_AUTH],
        };
        stream.write_all(greeting).await?;

        let mut choice = [0u8; 2];
        stream.read_exact(&mut choice).await?;
        if choice[0] != SOCKS5_VERSION {
            return Err(protocol_error("invalid SOCKS version in method reply"));
        }
        match (choice[1], &self.credentials) {
            (AUTH_NO_AUTH, _) => {}
            (AUTH_USER_PASS, Some((user, pass))) => {
                let mut request = Vec::with_capacity(3 + user.len() + pass.len());
                request.push(USER_PASS_VERSION);
                request.push(user.len() as u8);
                request.extend_from_slice(user.as_bytes());
                request.push(pass.len() as u8);
                request.extend_from_slice(pass.as_bytes());
                stream.write_all(&request).await?;

                let mut status = [0u8; 2];
                stream.read_exact(&mut status).await?;
                if status[1] != 0x00 {
                    return Err(io::Error::new(
                        io::ErrorKind::PermissionDenied,
                        "SOCKS5 authentication rejected",
                    ));
                }
            }
            (AUTH_NO_ACCEPTABLE, _) => {
                return Err(protocol_error("no acceptable SOCKS5 auth method"));
            }
            (other, _) => {
                return Err(protocol_error(&format!("unexpected SOCKS5 method {:#04x}", other)));
            }
        }

        // ===== Connect request =====
        let (host, port) = split_host_port(target)?;
        let mut request = vec![SOCKS5_VERSION, CMD_CONNECT, 0x00];
        match host.parse::<std::net::IpAddr>() {
            Ok(std::net::IpAddr::V4(v4)) => {
                request.push(ADDR_IPV4);
                request.extend_from_slice(&v4.octets());
            }
            Ok(std::net::IpAddr::V6(v6)) => {
                request.push(ADDR_IPV6);
                request.extend_from_slice(&v6.octets());
            }
            Err(_) => {
                if host.len() > 255 {
                    return Err(protocol_error("target host longer than 255 bytes"));
                }
                request.push(ADDR_DOMAIN);
                request.push(host.len() as u8);
                request.extend_from_slice(host.as_bytes());
            }
        }
        request.extend_from_slice(&port.to_be_bytes());
        stream.write_all(&request).await?;

        // ===== Reply =====
        let mut header = [0u8; 4];
        stream.read_exact(&mut header).await?;
        if header[0] != SOCKS5_VERSION {
            return Err(protocol_error("invalid SOCKS version in reply"));
        }
        if header[1] != REPLY_SUCCESS {
            return Err(io::Error::new(
                io::ErrorKind::ConnectionRefused,
                format!("SOCKS5 connect to {} failed with code {:#04x}", target, header[1]),
            ));
        }
        let bound_len = match header[3] {
            ADDR_IPV4 => 4,
            ADDR_IPV6 => 16,
            ADDR_DOMAIN => {
                let mut len = [0u8; 1];
                stream.read_exact(&mut len).await?;
                len[0] as usize
            }
            _ => return Err(protocol_error("invalid bound address type")),
        };
        let mut bound = vec![0u8; bound_len + 2];
        stream.read_exact(&mut bound).await?;
        Ok(())
    }
}

#[async_trait]
impl Dialer for Socks5Dialer {
    async fn dial(&self, addr: &str) -> io::Result<BoxedStream> {
        let mut stream = TcpStream::connect(&self.proxy).await?;
        stream.set_nodelay(true)?;
        self.handshake(&mut stream, addr).await?;
        debug!("SOCKS5 {} -> {} established", self.proxy, addr);
        Ok(Box::new(stream))
    }
}

fn protocol_error(msg: &str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg.to_string())
}

fn split_host_port(addr: &str) -> io::Result<(&str, u16)> {
    let (host, port) = addr
        .rsplit_once(':')
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "missing port"))?;
    let port = port
        .parse()
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "invalid port"))?;
    Ok((host.trim_start_matches('[').trim_end_matches(']'), port))
}

/// Dialer backed by a helper engine process; the process lives as long
/// as the dialer
struct HelperDialer {
    inner: Socks5Dialer,
    _child: Mutex<Child>,
}

#[async_trait]
impl Dialer for HelperDialer {
    async fn dial(&self, addr: &str) -> io::Result<BoxedStream> {
        self.inner.dial(addr).await
    }
}

/// Registry that spawns helper engine processes for encrypted protocols
pub struct ProcessOutboundRegistry {
    binary: String,
    work_dir: PathBuf,
    startup_grace: Duration,
}

impl ProcessOutboundRegistry {
    pub fn new(binary: impl Into<String>, work_dir: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
            work_dir: work_dir.into(),
            startup_grace: Duration::from_secs(3),
        }
    }

    pub fn with_startup_grace(mut self, grace: Duration) -> Self {
        self.startup_grace = grace;
        self
    }

    async fn spawn_helper(&self, spec: &OutboundSpec) -> Result<HelperDialer, OutboundError> {
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").await?;
            listener.local_addr()?.port()
        };

        let config = json!({
            "log": { "level": "warn" },
            "inbounds": [{
                "type": "socks",
                "tag": "probe-in",
                "listen": "127.0.0.1",
                "listen_port": port,
            }],
            "outbounds": [spec.to_engine_json("proxy")],
        });

        let path = self.work_dir.join(format!("probe-{}.json", port));
        let config_err = |source| OutboundError::Config {
            path: path.clone(),
            source,
        };
        tokio::fs::create_dir_all(&self.work_dir).await.map_err(config_err)?;
        tokio::fs::write(&path, config.to_string()).await.map_err(config_err)?;

        let spawned = Command::new(&self.binary)
            .arg("run")
            .arg("-c")
            .arg(&path)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn();
        let mut child = match spawned {
            Ok(child) => child,
            Err(source) => {
                remove_quietly(&path).await;
                return Err(OutboundError::Spawn {
                    binary: self.binary.clone(),
                    source,
                });
            }
        };

        let proxy = format!("127.0.0.1:{}", port);
        let ready = wait_until_listening(&mut child, &proxy, self.startup_grace).await;
        remove_quietly(&path).await;
        ready?;

        info!("Helper outbound for {} listening on {}", spec.server(), proxy);
        Ok(HelperDialer {
            inner: Socks5Dialer::new(proxy),
            _child: Mutex::new(child),
        })
    }
}

#[async_trait]
impl OutboundRegistry for ProcessOutboundRegistry {
    async fn create_outbound(&self, spec: &OutboundSpec) -> Result<Arc<dyn Dialer>, OutboundError> {
        match spec {
            OutboundSpec::Socks(socks) => {
                let dialer = Socks5Dialer::new(socks.server.to_string())
                    .with_credentials(&socks.username, &socks.password);
                Ok(Arc::new(dialer))
            }
            OutboundSpec::Shadowsocks(_) | OutboundSpec::Vless(_) => {
                Ok(Arc::new(self.spawn_helper(spec).await?))
            }
        }
    }
}

async fn wait_until_listening(
    child: &mut Child,
    addr: &str,
    grace: Duration,
) -> Result<(), OutboundError> {
    let deadline = Instant::now() + grace;
    loop {
        if child.try_wait()?.is_some() {
            return Err(OutboundError::HelperExited);
        }
        if TcpStream::connect(addr).await.is_ok() {
            return Ok(());
        }
        if Instant::now() >= deadline {
            return Err(OutboundError::HelperTimeout(grace));
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

async fn remove_quietly(path: &std::path::Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        warn!("Cannot remove {}: {}", path.display(), e);
    }
}
