//! HTTP Fetch Client
//!
//! Minimal GET client for the remote list service. Uses hyper over a
//! tokio TCP stream, wrapped in rustls for `https` URLs.

use http_body_util::{BodyExt, Empty, Limited};
use hyper::body::Bytes;
use hyper::header::{HOST, USER_AGENT};
use hyper::{Request, StatusCode};
use rustls::ClientConfig;
use serde::de::DeserializeOwned;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tracing::{debug, warn};
use url::Url;

/// HTTP client errors
#[derive(Debug, Error)]
pub enum HttpError {
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Request timeout")]
    Timeout,

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("Unexpected status {0}")]
    Status(StatusCode),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("Body read error: {0}")]
    Body(String),
}

/// HTTP client configuration
#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    /// Whole-request timeout
    pub timeout: Duration,
    /// User-Agent string
    pub user_agent: String,
    /// Maximum response body size
    pub max_body_size: usize,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
                         (KHTML, like Gecko) Chrome/58.0.3029.110 Safari/537.36"
                .to_string(),
            max_body_size: 32 * 1024 * 1024,
        }
    }
}

/// Fetched response
#[derive(Debug)]
pub struct Response {
    pub status: StatusCode,
    pub body: Bytes,
    pub total_time: Duration,
}

/// GET-only HTTP client
#[derive(Clone)]
pub struct HttpClient {
    config: HttpClientConfig,
    tls: TlsConnector,
}

impl HttpClient {
    pub fn new(config: HttpClientConfig) -> Self {
        let mut root_store = rustls::RootCertStore::empty();
        root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        let tls_config = ClientConfig::builder()
            .with_root_certificates(root_store)
            .with_no_client_auth();

        Self {
            config,
            tls: TlsConnector::from(Arc::new(tls_config)),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(HttpClientConfig::default())
    }

    /// Fetch `url`; non-2xx statuses are errors
    pub async fn get(&self, url: &str) -> Result<Response, HttpError> {
        tokio::time::timeout(self.config.timeout, self.fetch(url))
            .await
            .map_err(|_| HttpError::Timeout)?
    }

    /// Fetch `url` and decode the body as JSON
    pub async fn get_json<T: DeserializeOwned>(&self, url: &str) -> Result<T, HttpError> {
        let response = self.get(url).await?;
        serde_json::from_slice(&response.body).map_err(|e| HttpError::Body(e.to_string()))
    }

    async fn fetch(&self, url: &str) -> Result<Response, HttpError> {
        let start = Instant::now();
        let parsed = Url::parse(url).map_err(|e| HttpError::InvalidUrl(e.to_string()))?;
        let is_https = match parsed.scheme() {
            "https" => true,
            "http" => false,
            other => return Err(HttpError::InvalidUrl(format!("unsupported scheme {}", other))),
        };
        let host = parsed
            .host_str()
            .ok_or_else(|| HttpError::InvalidUrl("No host in URL".to_string()))?
            .to_string();
        let port = parsed
            .port_or_known_default()
            .ok_or_else(|| HttpError::InvalidUrl("No port for URL".to_string()))?;

        let path = match parsed.query() {
            Some(q) => format!("{}?{}", parsed.path(), q),
            None => parsed.path().to_string(),
        };
        let request = Request::get(path)
            .header(HOST, host_header(&parsed, &host))
            .header(USER_AGENT, &self.config.user_agent)
            .body(Empty::<Bytes>::new())
            .map_err(|e| HttpError::Http(e.to_string()))?;

        let stream = TcpStream::connect((host.as_str(), port))
            .await
            .map_err(|e| HttpError::ConnectionFailed(e.to_string()))?;

        let response = if is_https {
            let server_name = rustls::pki_types::ServerName::try_from(host.clone())
                .map_err(|_| HttpError::Tls("Invalid server name".to_string()))?;
            let tls_stream = self
                .tls
                .connect(server_name, stream)
                .await
                .map_err(|e| HttpError::Tls(e.to_string()))?;
            send(tls_stream, request).await?
        } else {
            send(stream, request).await?
        };

        let status = response.status();
        if !status.is_success() {
            return Err(HttpError::Status(status));
        }

        let body = Limited::new(response.into_body(), self.config.max_body_size)
            .collect()
            .await
            .map_err(|e| HttpError::Body(e.to_string()))?
            .to_bytes();

        let total_time = start.elapsed();
        debug!("GET {} -> {} ({} bytes, {:?})", url, status, body.len(), total_time);

        Ok(Response {
            status,
            body,
            total_time,
        })
    }
}

/// `Host` value for `url`; the port is kept only when it is not the
/// scheme's default
fn host_header(url: &Url, host: &str) -> String {
    match url.port() {
        Some(port) => format!("{}:{}", host, port),
        None => host.to_string(),
    }
}

async fn send<S>(
    stream: S,
    request: Request<Empty<Bytes>>,
) -> Result<hyper::Response<hyper::body::Incoming>, HttpError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let io = hyper_util::rt::TokioIo::new(stream);
    let (mut sender, conn) = hyper::client::conn::http1::handshake(io)
        .await
        .map_err(|e| HttpError::Http(e.to_string()))?;

    tokio::spawn(async move {
        if let Err(e) = conn.await {
            warn!("Connection error: {}", e);
        }
    });

    sender
        .send_request(request)
        .await
        .map_err(|e| HttpError::Http(e.to_string()))
}
