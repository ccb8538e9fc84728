//! Error codes and client-facing error responses for the proxy

use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Response, StatusCode};
use serde::Serialize;

/// Body type for every response the proxy produces
pub type ProxyBody = BoxBody<Bytes, hyper::Error>;

/// Wrap a complete in-memory body
pub fn full_body(body: impl Into<Bytes>) -> ProxyBody {
    Full::new(body.into()).map_err(|never| match never {}).boxed()
}

/// Error codes for proxy errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProxyErrorCode {
    /// Missing Host header in request
    MissingHostHeader,
    /// Request body could not be read
    InvalidRequest,
    /// No route for the hostname and the request was not a discovery request
    HostNotFound,
    /// No candidate port answered the discovery probe
    DiscoveryFailed,
    /// Admin hostname reached from a non-loopback peer
    AdminForbidden,
    /// Request body exceeds the configured limit
    PayloadTooLarge,
    /// Forwarding to the resolved backend failed
    BackendUnavailable,
}

impl ProxyErrorCode {
    /// Get the default HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            ProxyErrorCode::MissingHostHeader => StatusCode::BAD_REQUEST,
            ProxyErrorCode::InvalidRequest => StatusCode::BAD_REQUEST,
            ProxyErrorCode::HostNotFound => StatusCode::NOT_FOUND,
            ProxyErrorCode::DiscoveryFailed => StatusCode::NOT_FOUND,
            ProxyErrorCode::AdminForbidden => StatusCode::FORBIDDEN,
            ProxyErrorCode::PayloadTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            ProxyErrorCode::BackendUnavailable => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Get the error code as a string for the X-Proxy-Error header
    pub fn as_header_value(&self) -> &'static str {
        match self {
            ProxyErrorCode::MissingHostHeader => "MISSING_HOST_HEADER",
            ProxyErrorCode::InvalidRequest => "INVALID_REQUEST",
            ProxyErrorCode::HostNotFound => "HOST_NOT_FOUND",
            ProxyErrorCode::DiscoveryFailed => "DISCOVERY_FAILED",
            ProxyErrorCode::AdminForbidden => "ADMIN_FORBIDDEN",
            ProxyErrorCode::PayloadTooLarge => "PAYLOAD_TOO_LARGE",
            ProxyErrorCode::BackendUnavailable => "BACKEND_UNAVAILABLE",
        }
    }
}

/// JSON error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    /// The error code
    pub error: ProxyErrorCode,
    /// Human-readable error message
    pub message: String,
    /// Where an operator can register the missing route
    #[serde(skip_serializing_if = "Option::is_none")]
    pub admin_url: Option<String>,
    /// HTTP status code (for reference)
    pub status: u16,
}

impl ErrorResponse {
    pub fn new(code: ProxyErrorCode, message: impl Into<String>) -> Self {
        Self {
            status: code.status_code().as_u16(),
            error: code,
            message: message.into(),
            admin_url: None,
        }
    }

    pub fn with_admin_url(mut self, admin_url: impl Into<String>) -> Self {
        self.admin_url = Some(admin_url.into());
        self
    }

    /// Convert to JSON string
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            format!(
                r#"{{"error":"{}","message":"{}","status":{}}}"#,
                self.error.as_header_value(),
                self.message.replace('\"', "\\\""),
                self.status
            )
        })
    }

    /// Build the HTTP response carrying this error
    pub fn into_response(self) -> Response<ProxyBody> {
        let status = self.error.status_code();
        let header = self.error.as_header_value();
        let body = self.to_json();

        Response::builder()
            .status(status)
            .header("Content-Type", "application/json")
            .header("X-Proxy-Error", header)
            .body(full_body(body))
            .expect("valid response with StatusCode enum and static headers")
    }
}

/// Create a JSON error response with X-Proxy-Error header
pub fn json_error_response(code: ProxyErrorCode, message: impl Into<String>) -> Response<ProxyBody> {
    ErrorResponse::new(code, message).into_response()
}

/// Create a plain-text error response with X-Proxy-Error header
pub fn text_error_response(code: ProxyErrorCode, message: impl Into<String>) -> Response<ProxyBody> {
    Response::builder()
        .status(code.status_code())
        .header("Content-Type", "text/plain; charset=utf-8")
        .header("X-Proxy-Error", code.as_header_value())
        .body(full_body(message.into()))
        .expect("valid response with StatusCode enum and static headers")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_status_codes() {
        assert_eq!(
            ProxyErrorCode::MissingHostHeader.status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(ProxyErrorCode::HostNotFound.status_code(), StatusCode::NOT_FOUND);
        assert_eq!(ProxyErrorCode::DiscoveryFailed.status_code(), StatusCode::NOT_FOUND);
        assert_eq!(ProxyErrorCode::AdminForbidden.status_code(), StatusCode::FORBIDDEN);
        assert_eq!(
            ProxyErrorCode::BackendUnavailable.status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_error_response_json() {
        let error = ErrorResponse::new(ProxyErrorCode::HostNotFound, "No route for example.com")
            .with_admin_url("https://localhost/proxy-admin");
        let json: serde_json::Value = serde_json::from_str(&error.to_json()).unwrap();

        assert_eq!(json["error"], "HOST_NOT_FOUND");
        assert_eq!(json["message"], "No route for example.com");
        assert_eq!(json["admin_url"], "https://localhost/proxy-admin");
        assert_eq!(json["status"], 404);
    }

    #[test]
    fn test_admin_url_omitted_when_absent() {
        let error = ErrorResponse::new(ProxyErrorCode::MissingHostHeader, "Missing Host header");
        assert!(!error.to_json().contains("admin_url"));
    }

    #[test]
    fn test_json_error_response() {
        let response = json_error_response(ProxyErrorCode::DiscoveryFailed, "nothing answered");

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(
            response.headers().get("Content-Type").unwrap(),
            "application/json"
        );
        assert_eq!(
            response.headers().get("X-Proxy-Error").unwrap(),
            "DISCOVERY_FAILED"
        );
    }

    #[test]
    fn test_text_error_response() {
        let response = text_error_response(ProxyErrorCode::BackendUnavailable, "connection refused");

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(
            response.headers().get("Content-Type").unwrap(),
            "text/plain; charset=utf-8"
        );
        assert_eq!(
            response.headers().get("X-Proxy-Error").unwrap(),
            "BACKEND_UNAVAILABLE"
        );
    }
}
