//! Forwarding of buffered requests to issuer backends
//!
//! Requests are replayed against the route target with the original method,
//! path, query, headers and body. `Host` is rewritten to the target authority
//! and hop-by-hop headers are dropped in both directions.

use crate::config::UpstreamConfig;
use async_trait::async_trait;
use hyper::body::Bytes;
use hyper::header::{self, HeaderMap, HeaderName};
use hyper::{Request, Response};
use thiserror::Error;
use tracing::debug;

/// Error type for forwarding operations
#[derive(Debug, Error)]
pub enum ForwardError {
    /// The route target does not form a valid URL with the request path
    #[error("invalid backend url {0}")]
    InvalidUrl(String),
    /// The backend could not be reached or the exchange failed midway
    #[error("request to {url} failed: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    /// The backend response body could not be read
    #[error("failed to read response body from {url}: {source}")]
    Body {
        url: String,
        #[source]
        source: reqwest::Error,
    },
}

/// Transport that sends a request to a backend origin
#[async_trait]
pub trait Forwarder: Send + Sync {
    /// Send `req` to `target` (an origin such as `https://localhost:5001`)
    async fn forward(&self, req: Request<Bytes>, target: &str) -> Result<Response<Bytes>, ForwardError>;
}

/// Headers that describe a single connection and must not be forwarded
const HOP_BY_HOP: [HeaderName; 8] = [
    header::CONNECTION,
    HeaderName::from_static("keep-alive"),
    header::PROXY_AUTHENTICATE,
    header::PROXY_AUTHORIZATION,
    header::TE,
    header::TRAILER,
    header::TRANSFER_ENCODING,
    header::UPGRADE,
];

fn strip_hop_by_hop(headers: &mut HeaderMap) {
    for name in HOP_BY_HOP.iter() {
        headers.remove(name);
    }
}

/// Join a target origin with the request's path and query
pub fn backend_url(target: &str, req: &Request<Bytes>) -> String {
    let path = req.uri().path_and_query().map(|pq| pq.as_str()).unwrap_or("/");
    format!("{}{}", target.trim_end_matches('/'), path)
}

/// Client for talking to issuer backends, shared by forwarding and discovery.
///
/// Redirects are passed back to the caller untouched and system proxy
/// settings are ignored, since every backend is local.
pub fn backend_client(accept_invalid_certs: bool) -> reqwest::Result<reqwest::Client> {
    reqwest::Client::builder()
        .danger_accept_invalid_certs(accept_invalid_certs)
        .redirect(reqwest::redirect::Policy::none())
        .no_proxy()
        .build()
}

/// Forwarder backed by a reqwest client
pub struct HttpForwarder {
    client: reqwest::Client,
}

impl HttpForwarder {
    pub fn new(accept_invalid_certs: bool) -> reqwest::Result<Self> {
        let client = backend_client(accept_invalid_certs)?;

        debug!(accept_invalid_certs, "Backend HTTP client initialized");

        Ok(Self { client })
    }

    pub fn from_config(config: &UpstreamConfig) -> reqwest::Result<Self> {
        Self::new(config.accept_invalid_certs)
    }
}

#[async_trait]
impl Forwarder for HttpForwarder {
    async fn forward(&self, req: Request<Bytes>, target: &str) -> Result<Response<Bytes>, ForwardError> {
        let url = backend_url(target, &req);
        let parsed = reqwest::Url::parse(&url).map_err(|_| ForwardError::InvalidUrl(url.clone()))?;
        let (parts, body) = req.into_parts();

        let mut headers = parts.headers;
        strip_hop_by_hop(&mut headers);
        // reqwest derives these from the URL and body
        headers.remove(header::HOST);
        headers.remove(header::CONTENT_LENGTH);

        let response = self
            .client
            .request(parts.method, parsed)
            .headers(headers)
            .body(body)
            .send()
            .await
            .map_err(|source| ForwardError::Request {
                url: url.clone(),
                source,
            })?;

        let status = response.status();
        let mut headers = response.headers().clone();
        strip_hop_by_hop(&mut headers);
        headers.remove(header::CONTENT_LENGTH);

        let body = response
            .bytes()
            .await
            .map_err(|source| ForwardError::Body { url, source })?;

        let mut forwarded = Response::new(body);
        *forwarded.status_mut() = status;
        *forwarded.headers_mut() = headers;
        Ok(forwarded)
    }
}
