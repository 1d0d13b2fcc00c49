//! Domain-fronting transport: one HTTPS POST per message with SNI ≠ Host.
//!
//! The TLS ClientHello names the front domain; the inner Host header names
//! the hidden origin. The CDN terminates TLS on the front certificate and
//! routes by Host, so a passive observer only ever sees the front domain.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http::header::{ACCEPT, ACCEPT_LANGUAGE, CONNECTION, CONTENT_TYPE, HOST, USER_AGENT};
use http::{Method, Request, StatusCode};
use http_body_util::{BodyExt, Full};
use hyper_util::rt::TokioIo;
use rustls::pki_types::ServerName;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::TlsConnector;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::SendError;
use crate::resolve::{default_resolver_chain, HostResolver};
use crate::transport::Transport;

pub const FRONTING_NAME: &str = "domain-fronting";

/// Fixed endpoint path. Routing to the hidden origin happens at the CDN via
/// the Host header, not via the path.
const ENDPOINT_PATH: &str = "/message";

const HTTPS_PORT: u16 = 443;
const RESOLVE_TIMEOUT: Duration = Duration::from_secs(5);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const TLS_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(8);

const BROWSER_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36";

/// How much of an error response body is kept for the error message.
const ERROR_BODY_PREFIX: usize = 256;

/// Sends each payload as a single `POST https://<front>/message` whose TLS
/// SNI carries the front domain and whose Host header carries the hidden
/// domain.
pub struct FrontingTransport {
    front_domain: String,
    hidden_domain: String,
    port: u16,
    server_name: ServerName<'static>,
    resolvers: Vec<Arc<dyn HostResolver>>,
    tls_config: Arc<rustls::ClientConfig>,
}

impl FrontingTransport {
    /// `front_domain` is what the network observes (SNI); `hidden_domain`
    /// is where the CDN routes the request (Host header).
    pub fn new(front_domain: &str, hidden_domain: &str) -> anyhow::Result<Self> {
        let server_name = ServerName::try_from(front_domain.to_string())
            .map_err(|e| anyhow::anyhow!("invalid front domain {front_domain}: {e}"))?;

        Ok(Self {
            front_domain: front_domain.to_string(),
            hidden_domain: hidden_domain.to_string(),
            port: HTTPS_PORT,
            server_name,
            resolvers: default_resolver_chain(),
            tls_config: Arc::new(hydra_tls::webpki_client_config()),
        })
    }

    /// Override the TCP port (nonstandard edges, tests).
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Override the TLS configuration (dev CAs).
    pub fn with_tls_config(mut self, config: Arc<rustls::ClientConfig>) -> Self {
        self.tls_config = config;
        self
    }

    /// Override the resolver chain (pinned addresses).
    pub fn with_resolvers(mut self, resolvers: Vec<Arc<dyn HostResolver>>) -> Self {
        self.resolvers = resolvers;
        self
    }

    pub fn front_domain(&self) -> &str {
        &self.front_domain
    }

    pub fn hidden_domain(&self) -> &str {
        &self.hidden_domain
    }

    /// Dial the front edge. Each resolver in turn: resolve the front
    /// domain, open TCP, wrap in TLS with SNI = front domain. First success
    /// wins. Resolution exhaustion and connect failure are reported as
    /// distinct reasons.
    async fn dial(&self) -> Result<tokio_rustls::client::TlsStream<TcpStream>, SendError> {
        let connector = TlsConnector::from(self.tls_config.clone());
        let mut last_dial_error: Option<String> = None;

        for resolver in &self.resolvers {
            let addrs = match timeout(RESOLVE_TIMEOUT, resolver.resolve(&self.front_domain)).await {
                Ok(Ok(addrs)) => addrs,
                Ok(Err(err)) => {
                    debug!(
                        "resolver {} failed for {}: {err:#}",
                        resolver.label(),
                        self.front_domain
                    );
                    continue;
                }
                Err(_) => {
                    debug!(
                        "resolver {} timed out for {}",
                        resolver.label(),
                        self.front_domain
                    );
                    continue;
                }
            };

            for addr in addrs {
                let tcp = match timeout(CONNECT_TIMEOUT, TcpStream::connect((addr, self.port))).await
                {
                    Ok(Ok(tcp)) => tcp,
                    Ok(Err(err)) => {
                        debug!("tcp connect {addr}:{} failed: {err}", self.port);
                        last_dial_error = Some(err.to_string());
                        continue;
                    }
                    Err(_) => {
                        debug!("tcp connect {addr}:{} timed out", self.port);
                        last_dial_error = Some("connect timed out".into());
                        continue;
                    }
                };

                match timeout(
                    TLS_HANDSHAKE_TIMEOUT,
                    connector.connect(self.server_name.clone(), tcp),
                )
                .await
                {
                    Ok(Ok(tls)) => return Ok(tls),
                    Ok(Err(err)) => {
                        debug!("tls handshake with {addr} failed: {err}");
                        last_dial_error = Some(err.to_string());
                    }
                    Err(_) => {
                        debug!("tls handshake with {addr} timed out");
                        last_dial_error = Some("tls handshake timed out".into());
                    }
                }
            }
        }

        Err(match last_dial_error {
            Some(reason) => SendError::Dial {
                domain: self.front_domain.clone(),
                reason,
            },
            None => SendError::DnsExhausted {
                domain: self.front_domain.clone(),
            },
        })
    }

    async fn round_trip(&self, payload: &[u8]) -> Result<(), SendError> {
        let tls = self.dial().await?;

        let (mut sender, connection) = hyper::client::conn::http1::handshake(TokioIo::new(tls))
            .await
            .map_err(|e| SendError::Other(format!("request to {} failed: {e}", self.front_domain)))?;

        // The connection task ends once the sender and response are dropped.
        tokio::spawn(async move {
            if let Err(err) = connection.await {
                debug!("fronting connection closed: {err}");
            }
        });

        let request = Request::builder()
            .method(Method::POST)
            .uri(ENDPOINT_PATH)
            // The CDN sees SNI = front domain but routes by this header.
            .header(HOST, self.hidden_domain.as_str())
            .header(CONTENT_TYPE, "application/octet-stream")
            .header(USER_AGENT, BROWSER_USER_AGENT)
            .header(ACCEPT, "*/*")
            .header(ACCEPT_LANGUAGE, "en-US,en;q=0.5")
            .header(CONNECTION, "keep-alive")
            .body(Full::new(Bytes::copy_from_slice(payload)))
            .map_err(|e| {
                SendError::Other(format!(
                    "failed to create request for {}: {e}",
                    self.front_domain
                ))
            })?;

        let response = sender
            .send_request(request)
            .await
            .map_err(|e| SendError::Other(format!("request to {} failed: {e}", self.front_domain)))?;

        let status = response.status();
        if status == StatusCode::OK {
            return Ok(());
        }

        let body = match response.into_body().collect().await {
            Ok(collected) => {
                let bytes = collected.to_bytes();
                let prefix = &bytes[..bytes.len().min(ERROR_BODY_PREFIX)];
                String::from_utf8_lossy(prefix).into_owned()
            }
            Err(_) => String::new(),
        };

        Err(match status.as_u16() {
            403 => SendError::CdnBlocked {
                domain: self.front_domain.clone(),
            },
            404 => SendError::EndpointMissing {
                domain: self.front_domain.clone(),
            },
            502 | 503 | 504 => SendError::CdnGateway {
                status: status.as_u16(),
                domain: self.front_domain.clone(),
            },
            code => SendError::ServerStatus {
                domain: self.front_domain.clone(),
                status: code,
                body,
            },
        })
    }
}

#[async_trait::async_trait]
impl Transport for FrontingTransport {
    fn name(&self) -> &'static str {
        FRONTING_NAME
    }

    async fn connect(&self, _cancel: &CancellationToken) -> anyhow::Result<()> {
        // Stateless over HTTP; each send dials for itself.
        Ok(())
    }

    async fn send(&self, cancel: &CancellationToken, payload: &[u8]) -> Result<(), SendError> {
        if cancel.is_cancelled() {
            return Err(SendError::Cancelled);
        }

        tokio::select! {
            _ = cancel.cancelled() => Err(SendError::Cancelled),
            result = timeout(REQUEST_TIMEOUT, self.round_trip(payload)) => match result {
                Ok(inner) => inner,
                Err(_) => Err(SendError::Timeout {
                    domain: self.front_domain.clone(),
                    seconds: REQUEST_TIMEOUT.as_secs(),
                }),
            },
        }
    }

    fn is_available(&self) -> bool {
        true
    }
}
