use crate::admin::{handle_admin_request, is_admin_path, ADMIN_PREFIX};
use crate::config::Config;
use crate::discovery::{DiscoveryEngine, WELL_KNOWN_PATH};
use crate::error::{full_body, json_error_response, text_error_response, ErrorResponse, ProxyBody, ProxyErrorCode};
use crate::forward::Forwarder;
use crate::store::{normalize_hostname, RoutingStore};
use http_body_util::{BodyExt, LengthLimitError, Limited};
use hyper::body::{Bytes, Incoming};
use hyper::header::HeaderValue;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Header name for request ID
const X_REQUEST_ID: &str = "x-request-id";
/// Header name for forwarded-for
const X_FORWARDED_FOR: &str = "x-forwarded-for";
/// Header name for forwarded host
const X_FORWARDED_HOST: &str = "x-forwarded-host";
/// Header name for forwarded proto
const X_FORWARDED_PROTO: &str = "x-forwarded-proto";

/// Maximum hostname length per DNS specification
const MAX_HOSTNAME_LEN: usize = 253;

/// Failure to buffer a request body
#[derive(Debug, Error)]
pub enum BodyError {
    #[error("request body exceeds {limit} bytes")]
    TooLarge { limit: usize },
    #[error("failed to read request body: {0}")]
    Read(String),
}

/// Buffer a body, refusing anything over `limit` bytes
pub(crate) async fn read_body<B>(body: B, limit: usize) -> Result<Bytes, BodyError>
where
    B: hyper::body::Body<Data = Bytes>,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    match Limited::new(body, limit).collect().await {
        Ok(collected) => Ok(collected.to_bytes()),
        Err(e) if e.is::<LengthLimitError>() => Err(BodyError::TooLarge { limit }),
        Err(e) => Err(BodyError::Read(e.to_string())),
    }
}

/// Alphanumerics, hyphens and dots only, within the DNS length limit.
/// Keeps arbitrary header bytes out of logs and the routing table.
pub(crate) fn is_valid_hostname(hostname: &str) -> bool {
    !hostname.is_empty()
        && hostname.len() <= MAX_HOSTNAME_LEN
        && hostname.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.')
}

/// Hostname from the Host header, or the request authority for HTTP/2
fn extract_hostname<B>(req: &Request<B>) -> Option<String> {
    let raw = match req.headers().get(hyper::header::HOST) {
        Some(value) => value.to_str().ok()?,
        None => req.uri().host()?,
    };

    normalize_hostname(raw).filter(|h| is_valid_hostname(h))
}

/// Per-listener settings the dispatcher needs from configuration
#[derive(Debug, Clone)]
pub struct DispatchSettings {
    /// Host value that reaches the admin API
    pub admin_hostname: String,
    /// Reject admin requests whose peer is not a loopback address
    pub admin_loopback_only: bool,
    /// Advertised in not-found responses
    pub admin_url: String,
    /// Upper bound on one forwarded exchange
    pub request_timeout: Duration,
    /// Largest request body buffered before dispatch
    pub max_body_bytes: usize,
}

impl DispatchSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            admin_hostname: config.admin.hostname.to_ascii_lowercase(),
            admin_loopback_only: config.admin.loopback_only,
            admin_url: admin_url(config),
            request_timeout: config.server.request_timeout(),
            max_body_bytes: config.server.max_body_bytes,
        }
    }
}

/// Public location of the admin console, preferring the HTTPS listener
fn admin_url(config: &Config) -> String {
    let server = &config.server;
    let (scheme, port, default_port) = if server.https_port() > 0 {
        ("https", server.https_port(), 443)
    } else {
        ("http", server.http_port(), 80)
    };

    let host = &config.admin.hostname;
    if port == default_port || port == 0 {
        format!("{}://{}{}", scheme, host, ADMIN_PREFIX)
    } else {
        format!("{}://{}:{}{}", scheme, host, port, ADMIN_PREFIX)
    }
}

/// Label given to routes registered by discovery
fn auto_discovered_name(hostname: &str) -> String {
    format!("{} (auto-discovered)", hostname)
}

/// Routes buffered requests to the admin API, a known backend, or discovery
pub struct Dispatcher {
    store: Arc<RoutingStore>,
    discovery: Arc<DiscoveryEngine>,
    forwarder: Arc<dyn Forwarder>,
    settings: DispatchSettings,
}

impl Dispatcher {
    pub fn new(
        store: Arc<RoutingStore>,
        discovery: Arc<DiscoveryEngine>,
        forwarder: Arc<dyn Forwarder>,
        settings: DispatchSettings,
    ) -> Self {
        Self {
            store,
            discovery,
            forwarder,
            settings,
        }
    }

    pub fn store(&self) -> &Arc<RoutingStore> {
        &self.store
    }

    pub fn settings(&self) -> &DispatchSettings {
        &self.settings
    }

    pub async fn dispatch(&self, mut req: Request<Bytes>, client_addr: SocketAddr, is_tls: bool) -> Response<ProxyBody> {
        // Generate or propagate request ID
        let request_id = req
            .headers()
            .get(X_REQUEST_ID)
            .and_then(|v| v.to_str().ok())
            .map(String::from)
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let hostname = match extract_hostname(&req) {
            Some(h) => h,
            None => {
                return json_error_response(ProxyErrorCode::MissingHostHeader, "Missing or invalid Host header");
            }
        };

        debug!(hostname, method = %req.method(), uri = %req.uri(), request_id, "Incoming request");

        // Admin requests are answered here and never reach a backend
        if hostname == self.settings.admin_hostname && is_admin_path(req.uri().path()) {
            if self.settings.admin_loopback_only && !client_addr.ip().is_loopback() {
                warn!(client = %client_addr, path = %req.uri().path(), "Rejected admin request from non-loopback peer");
                return json_error_response(
                    ProxyErrorCode::AdminForbidden,
                    "The admin API is only available from the local machine",
                );
            }
            return handle_admin_request(req, &self.store).await;
        }

        // Host as the client sent it, port and case intact
        let original_host = req.headers().get(hyper::header::HOST).cloned().or_else(|| {
            req.uri()
                .authority()
                .and_then(|authority| HeaderValue::from_str(authority.as_str()).ok())
        });

        // Overwrite rather than append: this proxy is the first trusted hop
        let headers = req.headers_mut();
        if let Ok(value) = HeaderValue::from_str(&request_id) {
            headers.insert(X_REQUEST_ID, value);
        }
        if let Ok(value) = HeaderValue::from_str(&client_addr.ip().to_string()) {
            headers.insert(X_FORWARDED_FOR, value);
        }
        if let Some(value) = original_host {
            headers.insert(X_FORWARDED_HOST, value);
        }
        let proto = if is_tls { "https" } else { "http" };
        headers.insert(X_FORWARDED_PROTO, HeaderValue::from_static(proto));

        let target = match self.store.get(&hostname) {
            Some(route) => route.target,
            None if req.uri().path() == WELL_KNOWN_PATH => match self.discover(&hostname).await {
                Some(target) => target,
                None => {
                    return ErrorResponse::new(
                        ProxyErrorCode::DiscoveryFailed,
                        format!("No issuer answered discovery for {}", hostname),
                    )
                    .with_admin_url(&self.settings.admin_url)
                    .into_response();
                }
            },
            None => {
                debug!(hostname, "No route for host");
                return ErrorResponse::new(
                    ProxyErrorCode::HostNotFound,
                    format!(
                        "No route configured for {}. Add one at {}",
                        hostname, self.settings.admin_url
                    ),
                )
                .with_admin_url(&self.settings.admin_url)
                .into_response();
            }
        };

        self.forward(req, &hostname, &target, &request_id).await
    }

    /// Probe for an issuer and register it. Returns the target on success.
    async fn discover(&self, hostname: &str) -> Option<String> {
        let found = self.discovery.discover(hostname).await.ok()?;

        // The request is still served if the route could not be saved
        if let Err(e) = self
            .store
            .upsert(hostname, &found.target, Some(&auto_discovered_name(hostname)))
            .await
        {
            error!(hostname, target = %found.target, error = %e, "Failed to save discovered route");
        }

        Some(found.target)
    }

    async fn forward(&self, req: Request<Bytes>, hostname: &str, target: &str, request_id: &str) -> Response<ProxyBody> {
        let timeout = self.settings.request_timeout;

        match tokio::time::timeout(timeout, self.forwarder.forward(req, target)).await {
            Ok(Ok(response)) => {
                debug!(hostname, target, request_id, status = %response.status(), "Forwarded request");
                response.map(full_body)
            }
            Ok(Err(e)) => {
                error!(hostname, target, request_id, error = %e, "Failed to forward request");
                text_error_response(ProxyErrorCode::BackendUnavailable, format!("Proxy error: {}", e))
            }
            Err(_) => {
                warn!(hostname, target, request_id, timeout_secs = timeout.as_secs(), "Request timed out");
                text_error_response(
                    ProxyErrorCode::BackendUnavailable,
                    format!(
                        "Proxy error: backend {} did not respond within {} seconds",
                        target,
                        timeout.as_secs()
                    ),
                )
            }
        }
    }
}

/// The main reverse proxy server
pub struct ProxyServer {
    bind_addr: SocketAddr,
    dispatcher: Arc<Dispatcher>,
    shutdown_rx: watch::Receiver<bool>,
    tls_acceptor: Option<TlsAcceptor>,
}

impl ProxyServer {
    pub fn new(bind_addr: SocketAddr, dispatcher: Arc<Dispatcher>, shutdown_rx: watch::Receiver<bool>) -> Self {
        Self {
            bind_addr,
            dispatcher,
            shutdown_rx,
            tls_acceptor: None,
        }
    }

    pub fn with_tls(mut self, acceptor: TlsAcceptor) -> Self {
        self.tls_acceptor = Some(acceptor);
        self
    }

    pub fn tls_enabled(&self) -> bool {
        self.tls_acceptor.is_some()
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        let protocol = if self.tls_acceptor.is_some() { "HTTPS" } else { "HTTP" };
        info!(addr = %self.bind_addr, protocol, "Proxy server listening (HTTP/1.1 and HTTP/2)");

        let mut shutdown_rx = self.shutdown_rx.clone();
        let tls_acceptor = self.tls_acceptor.clone();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let dispatcher = Arc::clone(&self.dispatcher);
                            let tls_acceptor = tls_acceptor.clone();

                            tokio::spawn(async move {
                                if let Some(acceptor) = tls_acceptor {
                                    match acceptor.accept(stream).await {
                                        Ok(tls_stream) => {
                                            if let Err(e) = handle_connection(tls_stream, addr, dispatcher, true).await {
                                                debug!(addr = %addr, error = %e, "TLS connection error");
                                            }
                                        }
                                        Err(e) => {
                                            debug!(addr = %addr, error = %e, "TLS handshake failed");
                                        }
                                    }
                                } else if let Err(e) = handle_connection(stream, addr, dispatcher, false).await {
                                    debug!(addr = %addr, error = %e, "Connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Proxy server shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn handle_connection<S>(stream: S, addr: SocketAddr, dispatcher: Arc<Dispatcher>, is_tls: bool) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let io = TokioIo::new(stream);

    let service = service_fn(move |req: Request<Incoming>| {
        let dispatcher = Arc::clone(&dispatcher);
        async move { handle_request(req, dispatcher, addr, is_tls).await }
    });

    // HTTP/2 arrives as h2 over TLS (ALPN) or h2c on the plain listener
    AutoBuilder::new(TokioExecutor::new())
        .http1()
        .preserve_header_case(true)
        .http2()
        .max_concurrent_streams(250)
        .serve_connection(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Connection error: {}", e))?;

    Ok(())
}

async fn handle_request(
    req: Request<Incoming>,
    dispatcher: Arc<Dispatcher>,
    client_addr: SocketAddr,
    is_tls: bool,
) -> Result<Response<ProxyBody>, hyper::Error> {
    let limit = dispatcher.settings().max_body_bytes;
    let (parts, body) = req.into_parts();

    let body = match read_body(body, limit).await {
        Ok(body) => body,
        Err(BodyError::TooLarge { limit }) => {
            return Ok(json_error_response(
                ProxyErrorCode::PayloadTooLarge,
                format!("Request body exceeds {} bytes", limit),
            ));
        }
        Err(e) => {
            debug!(client = %client_addr, error = %e, "Failed to read request body");
            return Ok(json_error_response(ProxyErrorCode::InvalidRequest, "Failed to read request body"));
        }
    };

    Ok(dispatcher
        .dispatch(Request::from_parts(parts, body), client_addr, is_tls)
        .await)
}
