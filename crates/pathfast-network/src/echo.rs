//! Diagnostic TCP Echo Server
//!
//! Mirrors every byte it reads back to the sender. Used to exercise
//! [`LatencyProbe`](crate::LatencyProbe) against a known-good peer.
//!
//! Shutdown is cooperative: cancelling the server token stops the accept
//! loop, then every in-flight connection is closed and awaited.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

/// Echo server configuration
#[derive(Debug, Clone)]
pub struct EchoConfig {
    /// Listen address
    pub listen_addr: SocketAddr,
    /// Idle read deadline per connection
    pub read_timeout: Duration,
    /// Write deadline per chunk
    pub write_timeout: Duration,
    /// Log counters on every accepted connection
    pub log_stats: bool,
    /// Per-connection copy buffer
    pub buffer_size: usize,
}

impl Default for EchoConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 19999)),
            read_timeout: Duration::from_secs(30),
            write_timeout: Duration::from_secs(30),
            log_stats: true,
            buffer_size: 4096,
        }
    }
}

/// Echo server errors
#[derive(Debug, thiserror::Error)]
pub enum EchoError {
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },
}

/// Aggregate connection counters
#[derive(Debug, Default)]
pub struct EchoStats {
    total_connections: AtomicU64,
    active_connections: AtomicU64,
    total_bytes: AtomicU64,
}

impl EchoStats {
    pub fn total_connections(&self) -> u64 {
        self.total_connections.load(Ordering::Relaxed)
    }

    pub fn active_connections(&self) -> u64 {
        self.active_connections.load(Ordering::Relaxed)
    }

    pub fn total_bytes(&self) -> u64 {
        self.total_bytes.load(Ordering::Relaxed)
    }

    fn format(&self) -> String {
        format!(
            "connections: {} total, {} active, {} bytes echoed",
            self.total_connections(),
            self.active_connections(),
            self.total_bytes()
        )
    }
}

/// TCP echo server
pub struct EchoServer {
    config: EchoConfig,
    stats: Arc<EchoStats>,
    shutdown: CancellationToken,
    tracker: TaskTracker,
}

impl EchoServer {
    pub fn new(config: EchoConfig) -> Self {
        Self {
            config,
            stats: Arc::new(EchoStats::default()),
            shutdown: CancellationToken::new(),
            tracker: TaskTracker::new(),
        }
    }

    /// Token that stops the server when cancelled
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn stats(&self) -> Arc<EchoStats> {
        self.stats.clone()
    }

    /// Bind the configured address and serve until shutdown
    pub async fn run(&self) -> Result<(), EchoError> {
        let listener = TcpListener::bind(self.config.listen_addr)
            .await
            .map_err(|source| EchoError::Bind {
                addr: self.config.listen_addr,
                source,
            })?;
        self.serve(listener).await;
        Ok(())
    }

    /// Serve on an already-bound listener until shutdown
    pub async fn serve(&self, listener: TcpListener) {
        match listener.local_addr() {
            Ok(addr) => info!("Echo server listening on {}", addr),
            Err(_) => info!("Echo server listening"),
        }

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                accepted = listener.accept() => {
                    let (socket, peer) = match accepted {
                        Ok(pair) => pair,
                        Err(e) => {
                            warn!("Accept error: {}", e);
                            continue;
                        }
                    };

                    self.stats.total_connections.fetch_add(1, Ordering::Relaxed);
                    self.stats.active_connections.fetch_add(1, Ordering::Relaxed);
                    if self.config.log_stats {
                        info!("{}", self.stats.format());
                    }

                    let config = self.config.clone();
                    let stats = self.stats.clone();
                    let shutdown = self.shutdown.clone();
                    self.tracker.spawn(async move {
                        let copied = handle_connection(socket, &config, &stats, &shutdown).await;
                        stats.active_connections.fetch_sub(1, Ordering::Relaxed);
                        debug!("Connection from {} closed, {} bytes echoed", peer, copied);
                    });
                }
            }
        }

        info!("Echo server shutting down");
        drop(listener);
        self.tracker.close();
        self.tracker.wait().await;
        info!("Echo server stopped ({})", self.stats.format());
    }
}

async fn handle_connection(
    mut socket: TcpStream,
    config: &EchoConfig,
    stats: &EchoStats,
    shutdown: &CancellationToken,
) -> u64 {
    let mut buf = vec![0u8; config.buffer_size.max(1)];
    let mut copied = 0u64;

    loop {
        let read = tokio::select! {
            _ = shutdown.cancelled() => break,
            read = tokio::time::timeout(config.read_timeout, socket.read(&mut buf)) => read,
        };

        let n = match read {
            Ok(Ok(0)) => break,
            Ok(Ok(n)) => n,
            Ok(Err(e)) => {
                if !is_closed_error(&e) {
                    warn!("Connection read error: {}", e);
                }
                break;
            }
            Err(_) => {
                debug!("Connection idle past read deadline");
                break;
            }
        };

        match tokio::time::timeout(config.write_timeout, socket.write_all(&buf[..n])).await {
            Ok(Ok(())) => {
                copied += n as u64;
                stats.total_bytes.fetch_add(n as u64, Ordering::Relaxed);
            }
            Ok(Err(e)) => {
                if !is_closed_error(&e) {
                    warn!("Connection write error: {}", e);
                }
                break;
            }
            Err(_) => {
                debug!("Connection write deadline elapsed");
                break;
            }
        }
    }

    let _ = socket.shutdown().await;
    copied
}

fn is_closed_error(e: &std::io::Error) -> bool {
    use std::io::ErrorKind::*;
    matches!(
        e.kind(),
        UnexpectedEof | ConnectionReset | ConnectionAborted | BrokenPipe
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::LatencyProbe;

    async fn start_server(config: EchoConfig) -> (Arc<EchoServer>, SocketAddr, tokio::task::JoinHandle<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = Arc::new(EchoServer::new(config));
        let handle = {
            let server = server.clone();
            tokio::spawn(async move { server.serve(listener).await })
        };
        (server, addr, handle)
    }

    #[test]
    fn test_default_config() {
        let config = EchoConfig::default();
        assert_eq!(config.listen_addr.port(), 19999);
        assert_eq!(config.read_timeout, Duration::from_secs(30));
        assert!(config.log_stats);
    }

    #[tokio::test]
    async fn test_probe_against_echo_server() {
        let (server, addr, handle) = start_server(EchoConfig::default()).await;

        let probe = LatencyProbe::new(addr.to_string());
        probe.connect().await.unwrap();
        for payload in [&b"a"[..], b"hello world", &[0u8; 1024][..]] {
            let result = probe.test(payload).await;
            assert!(result.success);
            assert!(result.is_matching);
        }
        probe.close().await;

        server.shutdown_token().cancel();
        handle.await.unwrap();

        let stats = server.stats();
        assert_eq!(stats.total_connections(), 1);
        assert_eq!(stats.active_connections(), 0);
        assert_eq!(stats.total_bytes(), 1 + 11 + 1024);
    }

    #[tokio::test]
    async fn test_shutdown_closes_in_flight_connections() {
        let (server, addr, handle) = start_server(EchoConfig::default()).await;

        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(b"x").await.unwrap();
        let mut one = [0u8; 1];
        client.read_exact(&mut one).await.unwrap();

        server.shutdown_token().cancel();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("server should stop")
            .unwrap();

        let mut rest = Vec::new();
        let n = client.read_to_end(&mut rest).await.unwrap_or(0);
        assert_eq!(n, 0);
        assert_eq!(server.stats().active_connections(), 0);
    }

    #[tokio::test]
    async fn test_read_deadline_drops_idle_connection() {
        let config = EchoConfig {
            read_timeout: Duration::from_millis(100),
            log_stats: false,
            ..EchoConfig::default()
        };
        let (server, addr, _handle) = start_server(config).await;

        let mut client = TcpStream::connect(addr).await.unwrap();
        let mut buf = [0u8; 1];
        let n = tokio::time::timeout(Duration::from_secs(2), client.read(&mut buf))
            .await
            .expect("idle connection should be closed")
            .unwrap_or(0);
        assert_eq!(n, 0);
        server.shutdown_token().cancel();
    }
}
