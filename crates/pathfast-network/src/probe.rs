//! Latency Probe
//!
//! Round-trip prober over an arbitrary dial path. The remote end must
//! mirror every request byte-for-byte: a probe writes its payload and
//! reads back exactly as many bytes, timing the exchange.
//!
//! # Usage
//!
//! ```rust,ignore
//! let probe = LatencyProbe::new("1.1.1.1:80")
//!     .with_timeout(Duration::from_secs(3))
//!     .with_dialer(outbound);
//! probe.connect().await?;
//! let result = probe.test(b"ping").await;
//! println!("{}", probe.summary());
//! ```

use crate::stats::{Stats, StatsSummary};
use async_trait::async_trait;
use std::io;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Default probe timeout
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// A byte stream a dialer can hand back
pub trait ProbeStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> ProbeStream for T {}

/// Boxed dialed connection
pub type BoxedStream = Box<dyn ProbeStream>;

/// Something that can open a stream to `host:port`
///
/// Implemented by the plain TCP dialer and by proxy outbounds, so a probe
/// can measure the exact path real traffic would take.
#[async_trait]
pub trait Dialer: Send + Sync {
    async fn dial(&self, addr: &str) -> io::Result<BoxedStream>;
}

/// Direct TCP dialer
#[derive(Debug, Default, Clone, Copy)]
pub struct TcpDialer;

#[async_trait]
impl Dialer for TcpDialer {
    async fn dial(&self, addr: &str) -> io::Result<BoxedStream> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        Ok(Box::new(stream))
    }
}

/// Probe errors
#[derive(Debug, thiserror::Error)]
pub enum ProbeError {
    #[error("not connected")]
    NotConnected,

    #[error("connect to {addr} failed: {source}")]
    Connect {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("probe timed out after {0:?}")]
    Timeout(Duration),

    #[error("connection closed by server")]
    Closed,

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Outcome of a single exchange
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeResult {
    pub success: bool,
    /// Zero when the exchange failed
    pub latency: Duration,
    pub data_size: usize,
    /// Only ever true on success
    pub is_matching: bool,
    pub error: Option<String>,
}

/// Connection held by a probe
enum Link {
    Idle,
    Open(BoxedStream),
    /// The last exchange failed part-way; a reply may still be in flight,
    /// so the stream was dropped and the next send dials afresh
    Stale,
}

/// Echo-based latency prober
pub struct LatencyProbe {
    /// Target `host:port`
    server_addr: String,
    /// Bound for connect and for each exchange
    timeout: Duration,
    /// Dial path
    dialer: Arc<dyn Dialer>,
    /// Held for the full duration of connect and send
    conn: Mutex<Link>,
    stats: parking_lot::Mutex<Stats>,
}

impl LatencyProbe {
    /// Create a probe using the direct TCP dialer
    pub fn new(server_addr: impl Into<String>) -> Self {
        Self {
            server_addr: server_addr.into(),
            timeout: DEFAULT_TIMEOUT,
            dialer: Arc::new(TcpDialer),
            conn: Mutex::new(Link::Idle),
            stats: parking_lot::Mutex::new(Stats::default()),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Route the probe through another dial path
    pub fn with_dialer(mut self, dialer: Arc<dyn Dialer>) -> Self {
        self.dialer = dialer;
        self
    }

    pub fn server_addr(&self) -> &str {
        &self.server_addr
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    async fn dial(&self) -> Result<BoxedStream, ProbeError> {
        tokio::time::timeout(self.timeout, self.dialer.dial(&self.server_addr))
            .await
            .map_err(|_| ProbeError::Timeout(self.timeout))?
            .map_err(|source| ProbeError::Connect {
                addr: self.server_addr.clone(),
                source,
            })
    }

    /// Open a fresh connection, dropping any existing one
    pub async fn connect(&self) -> Result<(), ProbeError> {
        let mut conn = self.conn.lock().await;
        if let Link::Open(mut old) = std::mem::replace(&mut *conn, Link::Idle) {
            let _ = old.shutdown().await;
        }

        let start = Instant::now();
        let stream = self.dial().await?;
        let elapsed = start.elapsed();

        self.stats.lock().connect_time = Some(elapsed);
        *conn = Link::Open(stream);

        debug!("Probe connected to {} in {:?}", self.server_addr, elapsed);
        Ok(())
    }

    /// Whether a connection is currently held
    pub async fn is_connected(&self) -> bool {
        matches!(*self.conn.lock().await, Link::Open(_))
    }

    /// Write `payload` and read back exactly `payload.len()` bytes
    ///
    /// A failed exchange discards the stream, since a late reply would
    /// otherwise be read as the answer to the next payload. The following
    /// send reconnects.
    pub async fn send(&self, payload: &[u8]) -> Result<(Vec<u8>, Duration), ProbeError> {
        let mut conn = self.conn.lock().await;
        if matches!(*conn, Link::Stale) {
            match self.dial().await {
                Ok(stream) => {
                    debug!("Probe reconnected to {}", self.server_addr);
                    *conn = Link::Open(stream);
                }
                Err(e) => {
                    self.stats.lock().record_error();
                    return Err(e);
                }
            }
        }
        let Link::Open(stream) = &mut *conn else {
            self.stats.lock().record_error();
            return Err(ProbeError::NotConnected);
        };

        let start = Instant::now();
        let exchange = async {
            stream.write_all(payload).await?;
            stream.flush().await?;
            let mut response = vec![0u8; payload.len()];
            stream.read_exact(&mut response).await?;
            Ok::<_, io::Error>(response)
        };
        let outcome = tokio::time::timeout(self.timeout, exchange).await;
        let latency = start.elapsed();

        let result = match outcome {
            Ok(Ok(response)) => Ok((response, latency)),
            Ok(Err(e)) if e.kind() == io::ErrorKind::UnexpectedEof => Err(ProbeError::Closed),
            Ok(Err(e)) => Err(ProbeError::Io(e)),
            Err(_) => Err(ProbeError::Timeout(self.timeout)),
        };

        match &result {
            Ok(_) => self.stats.lock().record_latency(latency),
            Err(e) => {
                self.stats.lock().record_error();
                debug!("Probe to {} failed: {}", self.server_addr, e);
                *conn = Link::Stale;
            }
        }
        result
    }

    /// Run one exchange and report it as a [`ProbeResult`]
    pub async fn test(&self, payload: &[u8]) -> ProbeResult {
        match self.send(payload).await {
            Ok((response, latency)) => ProbeResult {
                success: true,
                latency,
                data_size: payload.len(),
                is_matching: response == payload,
                error: None,
            },
            Err(e) => ProbeResult {
                success: false,
                latency: Duration::ZERO,
                data_size: payload.len(),
                is_matching: false,
                error: Some(e.to_string()),
            },
        }
    }

    /// Run `count` sequential exchanges, `interval` apart
    ///
    /// Cancellation is checked before every exchange and during every
    /// wait; whatever was collected so far is returned.
    pub async fn multi_test(
        &self,
        payload: &[u8],
        count: usize,
        interval: Duration,
        cancel: &CancellationToken,
    ) -> Vec<ProbeResult> {
        let mut results = Vec::with_capacity(count);

        for i in 0..count {
            if cancel.is_cancelled() {
                break;
            }
            results.push(self.test(payload).await);

            if i + 1 < count {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
            }
        }

        if results.len() < count {
            warn!(
                "Probe run to {} cancelled after {}/{} exchanges",
                self.server_addr,
                results.len(),
                count
            );
        }
        results
    }

    /// Snapshot of the accumulated statistics
    pub fn stats(&self) -> Stats {
        self.stats.lock().clone()
    }

    /// Clear statistics, keeping the connect time
    pub fn reset_stats(&self) {
        self.stats.lock().reset();
    }

    pub fn connect_time(&self) -> Option<Duration> {
        self.stats.lock().connect_time
    }

    pub fn summary(&self) -> StatsSummary {
        self.stats.lock().summary()
    }

    /// Drop the current connection
    pub async fn close(&self) {
        let mut conn = self.conn.lock().await;
        if let Link::Open(mut stream) = std::mem::replace(&mut *conn, Link::Idle) {
            let _ = stream.shutdown().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::net::TcpListener;

    /// Echo server reading fixed `chunk`-sized messages; the `skip`-th
    /// message (1-based, counted across connections) is swallowed
    /// without a reply.
    async fn spawn_echo(chunk: usize, skip: Option<usize>) -> SocketAddr {
        spawn_echo_with(chunk, move |seen| {
            if Some(seen) == skip { None } else { Some(Duration::ZERO) }
        })
        .await
    }

    /// Echo server whose reply to the `n`-th message is delayed by
    /// `reply(n)`, or never sent when it returns `None`
    async fn spawn_echo_with<F>(chunk: usize, reply: F) -> SocketAddr
    where
        F: Fn(usize) -> Option<Duration> + Send + Sync + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let reply = Arc::new(reply);
        let seen = Arc::new(AtomicUsize::new(0));
        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                let reply = reply.clone();
                let seen = seen.clone();
                tokio::spawn(async move {
                    let mut buf = vec![0u8; chunk];
                    while socket.read_exact(&mut buf).await.is_ok() {
                        let n = seen.fetch_add(1, Ordering::SeqCst) + 1;
                        let Some(delay) = reply(n) else { continue };
                        tokio::time::sleep(delay).await;
                        if socket.write_all(&buf).await.is_err() {
                            break;
                        }
                    }
                });
            }
        });
        addr
    }

    #[tokio::test]
    async fn test_send_before_connect() {
        let probe = LatencyProbe::new("127.0.0.1:9");
        let err = probe.send(b"abc").await.unwrap_err();
        assert!(matches!(err, ProbeError::NotConnected));
        assert_eq!(probe.stats().errors, 1);
    }

    #[tokio::test]
    async fn test_echo_roundtrip() {
        let addr = spawn_echo(4, None).await;
        let probe = LatencyProbe::new(addr.to_string());
        probe.connect().await.unwrap();

        let result = probe.test(b"ping").await;
        assert!(result.success);
        assert!(result.is_matching);
        assert_eq!(result.data_size, 4);
        assert!(result.latency > Duration::ZERO);

        let stats = probe.stats();
        assert_eq!(stats.count, 1);
        assert_eq!(stats.errors, 0);
        assert!(stats.connect_time.is_some());
    }

    #[tokio::test]
    async fn test_mismatched_echo() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 4];
            socket.read_exact(&mut buf).await.unwrap();
            socket.write_all(b"pong").await.unwrap();
        });

        let probe = LatencyProbe::new(addr.to_string());
        probe.connect().await.unwrap();
        let result = probe.test(b"ping").await;
        assert!(result.success);
        assert!(!result.is_matching);
    }

    #[tokio::test]
    async fn test_closed_by_server() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 4];
            let _ = socket.read_exact(&mut buf).await;
            // dropped without replying
        });

        let probe = LatencyProbe::new(addr.to_string());
        probe.connect().await.unwrap();
        let err = probe.send(b"ping").await.unwrap_err();
        assert!(matches!(err, ProbeError::Closed | ProbeError::Io(_)));

        let result = probe.test(b"ping").await;
        assert!(!result.success);
        assert!(!result.is_matching);
        assert_eq!(result.latency, Duration::ZERO);
    }

    #[tokio::test]
    async fn test_timeout() {
        let addr = spawn_echo(4, Some(1)).await;
        let probe = LatencyProbe::new(addr.to_string()).with_timeout(Duration::from_millis(100));
        probe.connect().await.unwrap();

        let err = probe.send(b"ping").await.unwrap_err();
        assert!(matches!(err, ProbeError::Timeout(_)));
        assert_eq!(probe.stats().errors, 1);
    }

    #[tokio::test]
    async fn test_late_reply_not_read_by_next_exchange() {
        let addr = spawn_echo_with(4, |n| {
            Some(if n == 1 { Duration::from_millis(200) } else { Duration::ZERO })
        })
        .await;
        let probe = LatencyProbe::new(addr.to_string()).with_timeout(Duration::from_millis(100));
        probe.connect().await.unwrap();

        let first = probe.test(b"aaaa").await;
        assert!(!first.success);
        assert!(!probe.is_connected().await);

        // let the delayed "aaaa" arrive on the dropped connection
        tokio::time::sleep(Duration::from_millis(150)).await;

        let second = probe.test(b"bbbb").await;
        assert!(second.success);
        assert!(second.is_matching);
        assert!(probe.is_connected().await);

        let stats = probe.stats();
        assert_eq!(stats.errors, 1);
        assert_eq!(stats.count, 1);
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let probe = LatencyProbe::new(addr.to_string());
        let err = probe.connect().await.unwrap_err();
        assert!(matches!(err, ProbeError::Connect { .. } | ProbeError::Timeout(_)));
        assert!(!probe.is_connected().await);
    }

    #[tokio::test]
    async fn test_multi_test_with_one_failure() {
        let addr = spawn_echo(4, Some(3)).await;
        let probe = LatencyProbe::new(addr.to_string()).with_timeout(Duration::from_millis(300));
        probe.connect().await.unwrap();

        let cancel = CancellationToken::new();
        let results = probe
            .multi_test(b"ping", 5, Duration::from_millis(100), &cancel)
            .await;

        assert_eq!(results.len(), 5);
        assert_eq!(results.iter().filter(|r| !r.success).count(), 1);
        assert!(!results[2].success);

        let stats = probe.stats();
        assert_eq!(stats.errors, 1);
        assert_eq!(stats.count, 4);
    }

    #[tokio::test]
    async fn test_multi_test_cancelled() {
        let addr = spawn_echo(4, None).await;
        let probe = LatencyProbe::new(addr.to_string());
        probe.connect().await.unwrap();

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(150)).await;
            trigger.cancel();
        });

        let results = probe
            .multi_test(b"ping", 50, Duration::from_millis(100), &cancel)
            .await;
        assert!(!results.is_empty());
        assert!(results.len() < 50);
        assert!(results.iter().all(|r| r.success));
    }

    #[tokio::test]
    async fn test_reset_keeps_connect_time() {
        let addr = spawn_echo(4, None).await;
        let probe = LatencyProbe::new(addr.to_string());
        probe.connect().await.unwrap();
        probe.test(b"ping").await;

        let connect_time = probe.connect_time();
        probe.reset_stats();

        let stats = probe.stats();
        assert_eq!(stats.count, 0);
        assert_eq!(stats.connect_time, connect_time);
        assert!(connect_time.is_some());
    }

    #[tokio::test]
    async fn test_custom_dialer() {
        struct Redirect(SocketAddr);

        #[async_trait]
        impl Dialer for Redirect {
            async fn dial(&self, _addr: &str) -> io::Result<BoxedStream> {
                Ok(Box::new(TcpStream::connect(self.0).await?))
            }
        }

        let addr = spawn_echo(5, None).await;
        let probe = LatencyProbe::new("198.51.100.1:80").with_dialer(Arc::new(Redirect(addr)));
        probe.connect().await.unwrap();
        let result = probe.test(b"hello").await;
        assert!(result.success && result.is_matching);
    }
}
