//! Error types and plain-text error responses for the gateway

use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Response, StatusCode};
use std::net::SocketAddr;
use thiserror::Error;

/// Errors raised while registering sites
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("invalid domain '{0}'")]
    InvalidDomain(String),

    #[error("invalid handler for '{domain}': {reason}")]
    InvalidHandler { domain: String, reason: String },

    /// Port 80 belongs to the certificate manager outside local mode
    #[error("port 80 is reserved for ACME challenges (domain '{0}')")]
    ReservedPort(String),
}

/// Errors raised while assembling and starting listeners
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("failed to bind listener on {addr}: {source}")]
    ListenerBind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid bind address '{host}:{port}'")]
    InvalidBindAddress { host: String, port: u16 },

    #[error(
        "site registry was built for {registry} but the gateway is configured for {config}"
    )]
    RegistryMismatch { registry: String, config: String },

    #[error("certificate manager failed to initialize: {0:#}")]
    CertificateManager(anyhow::Error),

    #[error("TLS configuration error: {0}")]
    Tls(#[from] rustls::Error),

    #[error("no upgrade route for host {0:?}")]
    UpgradeRouteNotFound(Option<String>),

    #[error("upgrade rejected by site '{0}'")]
    UpgradeRejected(String),

    #[error(transparent)]
    Registry(#[from] RegistryError),
}

/// Certificate lookup failure. Never fatal; the handshake for that name fails.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CertificateError {
    #[error("no certificate available for '{domain}': {reason}")]
    Unavailable { domain: String, reason: String },
}

impl CertificateError {
    pub fn unavailable(domain: impl Into<String>, reason: impl Into<String>) -> Self {
        CertificateError::Unavailable {
            domain: domain.into(),
            reason: reason.into(),
        }
    }
}

/// Error codes the dispatcher reports to clients
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatewayErrorCode {
    /// Host not registered on this listener
    SiteNotFound,
    /// Malformed or aborted request
    BadRequest,
    /// Request body exceeded the configured limit
    PayloadTooLarge,
}

impl GatewayErrorCode {
    pub fn status_code(&self) -> StatusCode {
        match self {
            GatewayErrorCode::SiteNotFound => StatusCode::NOT_FOUND,
            GatewayErrorCode::BadRequest => StatusCode::BAD_REQUEST,
            GatewayErrorCode::PayloadTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
        }
    }

    /// Value for the X-Gateway-Error header
    pub fn as_header_value(&self) -> &'static str {
        match self {
            GatewayErrorCode::SiteNotFound => "SITE_NOT_FOUND",
            GatewayErrorCode::BadRequest => "BAD_REQUEST",
            GatewayErrorCode::PayloadTooLarge => "PAYLOAD_TOO_LARGE",
        }
    }
}

pub const X_GATEWAY_ERROR: &str = "x-gateway-error";

/// Build a plain-text error response tagged with X-Gateway-Error
pub fn error_response(
    code: GatewayErrorCode,
    message: impl Into<String>,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    Response::builder()
        .status(code.status_code())
        .header(hyper::header::CONTENT_TYPE, "text/plain")
        .header(X_GATEWAY_ERROR, code.as_header_value())
        .body(
            Full::new(Bytes::from(message.into()))
                .map_err(|never| match never {})
                .boxed(),
        )
        .expect("valid response with StatusCode enum and static headers")
}

/// The 404 every unmatched host receives
pub fn site_not_found() -> Response<BoxBody<Bytes, hyper::Error>> {
    error_response(GatewayErrorCode::SiteNotFound, "Site not found")
}
