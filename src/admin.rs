//! Admin API for inspecting and editing the routing table
//!
//! The API lives under `/proxy-admin` and is reachable two ways: through the
//! admin hostname on the proxy listeners (subject to the loopback check in the
//! dispatcher), and on a dedicated listener bound to 127.0.0.1.

use crate::error::{full_body, ProxyBody};
use crate::proxy::{is_valid_hostname, read_body, BodyError};
use crate::store::{normalize_hostname, Route, RoutingStore, StoreError};
use hyper::body::{Bytes, Incoming};
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use serde::Deserialize;
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Version information for the proxy
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");

/// Path prefix of every admin route
pub const ADMIN_PREFIX: &str = "/proxy-admin";

/// Largest accepted admin request body
const MAX_ADMIN_BODY: usize = 64 * 1024;

const CONSOLE_HTML: &str = include_str!("console.html");

/// Helper to create a simple response - infallible with valid StatusCode
fn response(status: StatusCode, content_type: &'static str, body: impl Into<Bytes>) -> Response<ProxyBody> {
    Response::builder()
        .status(status)
        .header("content-type", content_type)
        .body(full_body(body))
        .expect("valid response with StatusCode enum and static header")
}

/// Helper to create a JSON response
fn json_response(status: StatusCode, body: serde_json::Value) -> Response<ProxyBody> {
    response(status, "application/json", body.to_string())
}

/// Whether `path` is the admin prefix or below it
pub fn is_admin_path(path: &str) -> bool {
    match path.strip_prefix(ADMIN_PREFIX) {
        Some(rest) => rest.is_empty() || rest.starts_with('/'),
        None => false,
    }
}

/// Admin request failures, each mapped to a status and a stable message
#[derive(Debug, Error)]
pub enum AdminError {
    #[error("malformed body")]
    MalformedBody,
    #[error("missing required fields")]
    MissingFields,
    #[error("invalid hostname")]
    InvalidHostname,
    #[error("invalid target")]
    InvalidTarget,
    #[error("body too large")]
    BodyTooLarge,
    #[error("persistence failed")]
    Persistence(#[source] StoreError),
}

impl AdminError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            AdminError::MalformedBody
            | AdminError::MissingFields
            | AdminError::InvalidHostname
            | AdminError::InvalidTarget => StatusCode::BAD_REQUEST,
            AdminError::BodyTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            AdminError::Persistence(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn into_response(self) -> Response<ProxyBody> {
        json_response(
            self.status_code(),
            serde_json::json!({ "error": self.to_string() }),
        )
    }
}

/// Body of `POST /proxy-admin/add`
#[derive(Debug, Deserialize)]
pub struct AddRouteRequest {
    #[serde(default)]
    pub hostname: String,
    #[serde(default)]
    pub target: String,
    #[serde(default)]
    pub name: Option<String>,
}

/// A target must be a bare http(s) origin the forwarder can reach
fn is_valid_target(target: &str) -> bool {
    // Same parser the forwarder uses, so out-of-range ports are rejected here
    let Ok(url) = reqwest::Url::parse(target) else {
        return false;
    };
    let scheme_ok = matches!(url.scheme(), "http" | "https");
    let host_ok = url.host_str().is_some_and(|h| !h.is_empty());
    let path_ok = url.path() == "/" && url.query().is_none() && url.fragment().is_none();
    let no_userinfo = url.username().is_empty() && url.password().is_none();

    // "host:" parses with no port at all
    let authority = target
        .split_once("://")
        .and_then(|(_, rest)| rest.split(['/', '?', '#']).next())
        .unwrap_or_default();

    scheme_ok && host_ok && path_ok && no_userinfo && !authority.ends_with(':')
}

async fn add_route(body: &Bytes, store: &RoutingStore) -> Result<Route, AdminError> {
    if body.len() > MAX_ADMIN_BODY {
        return Err(AdminError::BodyTooLarge);
    }

    // Only a JSON object has the right shape; serde would also accept an array
    let value: serde_json::Value = serde_json::from_slice(body).map_err(|_| AdminError::MalformedBody)?;
    if !value.is_object() {
        return Err(AdminError::MalformedBody);
    }
    let request: AddRouteRequest = serde_json::from_value(value).map_err(|_| AdminError::MalformedBody)?;
    let hostname = request.hostname.trim();
    let target = request.target.trim();

    if hostname.is_empty() || target.is_empty() {
        return Err(AdminError::MissingFields);
    }

    let hostname = normalize_hostname(hostname).ok_or(AdminError::MissingFields)?;
    if !is_valid_hostname(&hostname) {
        return Err(AdminError::InvalidHostname);
    }
    if !is_valid_target(target) {
        return Err(AdminError::InvalidTarget);
    }

    store
        .upsert(&hostname, target, request.name.as_deref())
        .await
        .map_err(AdminError::Persistence)
}

fn list_routes(store: &RoutingStore) -> Response<ProxyBody> {
    let table = store.snapshot();
    let routes: Vec<Route> = table.routes().collect();
    json_response(
        StatusCode::OK,
        serde_json::json!({
            "routes": routes,
            "count": routes.len(),
        }),
    )
}

/// Handle a request whose path is under [`ADMIN_PREFIX`]
pub async fn handle_admin_request(req: Request<Bytes>, store: &RoutingStore) -> Response<ProxyBody> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let route = path.strip_prefix(ADMIN_PREFIX).unwrap_or(&path);

    debug!(%method, %path, "Admin API request");

    match (&method, route) {
        (&Method::GET, "" | "/") => response(StatusCode::OK, "text/html; charset=utf-8", CONSOLE_HTML),

        (&Method::GET, "/list") => list_routes(store),

        (&Method::POST, "/add") => match add_route(req.body(), store).await {
            Ok(route) => json_response(
                StatusCode::OK,
                serde_json::json!({ "success": true, "route": route }),
            ),
            Err(e) => {
                match &e {
                    AdminError::Persistence(source) => error!(error = %source, "Failed to persist route"),
                    other => warn!(error = %other, "Rejected admin add request"),
                }
                e.into_response()
            }
        },

        (_, "" | "/" | "/list" | "/add") => json_response(
            StatusCode::METHOD_NOT_ALLOWED,
            serde_json::json!({ "error": "method not allowed" }),
        ),

        _ => json_response(StatusCode::NOT_FOUND, serde_json::json!({ "error": "not found" })),
    }
}

/// Admin API server bound to the loopback interface
pub struct AdminServer {
    bind_addr: SocketAddr,
    store: Arc<RoutingStore>,
    shutdown_rx: watch::Receiver<bool>,
}

impl AdminServer {
    pub fn new(bind_addr: SocketAddr, store: Arc<RoutingStore>, shutdown_rx: watch::Receiver<bool>) -> Self {
        Self {
            bind_addr,
            store,
            shutdown_rx,
        }
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        info!(addr = %self.bind_addr, "Admin API server listening (HTTP/1.1 and HTTP/2)");

        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let store = Arc::clone(&self.store);
                            tokio::spawn(async move {
                                if let Err(e) = serve_admin_connection(stream, store).await {
                                    debug!(addr = %addr, error = %e, "Admin connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept admin connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Admin server shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn serve_admin_connection<S>(stream: S, store: Arc<RoutingStore>) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let io = TokioIo::new(stream);
    let service = service_fn(move |req| {
        let store = Arc::clone(&store);
        async move { handle_loopback_request(req, store).await }
    });

    AutoBuilder::new(TokioExecutor::new())
        .serve_connection(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Admin connection error: {}", e))?;

    Ok(())
}

async fn handle_loopback_request(
    req: Request<Incoming>,
    store: Arc<RoutingStore>,
) -> Result<Response<ProxyBody>, hyper::Error> {
    let path = req.uri().path();

    let response = match (req.method(), path) {
        (&Method::GET, "/health") => response(StatusCode::OK, "text/plain", "ok"),

        (&Method::GET, "/version") => json_response(
            StatusCode::OK,
            serde_json::json!({
                "name": PKG_NAME,
                "version": VERSION,
            }),
        ),

        (_, path) if is_admin_path(path) => {
            let (parts, body) = req.into_parts();
            match read_body(body, MAX_ADMIN_BODY).await {
                Ok(bytes) => handle_admin_request(Request::from_parts(parts, bytes), &store).await,
                Err(BodyError::TooLarge { .. }) => AdminError::BodyTooLarge.into_response(),
                Err(e) => {
                    debug!(error = %e, "Failed to read admin request body");
                    AdminError::MalformedBody.into_response()
                }
            }
        }

        _ => json_response(StatusCode::NOT_FOUND, serde_json::json!({ "error": "not found" })),
    };

    Ok(response)
}
