use http::StatusCode;
use thiserror::Error;

use crate::http::ParseError;

/// Unified error type for the proxy core
#[derive(Error, Debug)]
pub enum ProxyError {
    // Parse errors
    #[error("Malformed HTTP message: {0}")]
    Parse(#[from] ParseError),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Timed out waiting for client request")]
    ClientTimeout,

    // Upstream errors
    #[error("Upstream connection to {target} failed: {source}")]
    UpstreamConnect {
        target: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Upstream connection to {0} timed out")]
    UpstreamTimeout(String),

    // TLS errors
    #[error("TLS handshake failed: {0}")]
    TlsHandshake(String),

    #[error("TLS error: {0}")]
    Tls(#[from] rustls::Error),

    #[error("Certificate error: {0}")]
    Certificate(#[from] CertificateError),

    // Relay errors
    #[error("Relay I/O error: {0}")]
    Relay(#[source] std::io::Error),

    // Plugin-side errors
    #[error("Authentication failed")]
    AuthenticationFailed,

    #[error("Rate limit exceeded for {client_ip}")]
    RateLimitExceeded { client_ip: String },

    // Configuration errors
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // I/O errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias for proxy operations
pub type Result<T> = std::result::Result<T, ProxyError>;

impl ProxyError {
    /// Get the HTTP status code reported to the client for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            // 413 Payload Too Large
            ProxyError::Parse(ParseError::BodyTooLarge { .. }) => StatusCode::PAYLOAD_TOO_LARGE,

            // 400 Bad Request
            ProxyError::Parse(_) | ProxyError::InvalidRequest(_) => StatusCode::BAD_REQUEST,

            // 407 Proxy Authentication Required
            ProxyError::AuthenticationFailed => StatusCode::PROXY_AUTHENTICATION_REQUIRED,

            // 408 Request Timeout
            ProxyError::ClientTimeout => StatusCode::REQUEST_TIMEOUT,

            // 429 Too Many Requests
            ProxyError::RateLimitExceeded { .. } => StatusCode::TOO_MANY_REQUESTS,

            // 502 Bad Gateway
            ProxyError::UpstreamConnect { .. }
            | ProxyError::TlsHandshake(_)
            | ProxyError::Tls(_)
            | ProxyError::Relay(_) => StatusCode::BAD_GATEWAY,

            // 504 Gateway Timeout
            ProxyError::UpstreamTimeout(_) => StatusCode::GATEWAY_TIMEOUT,

            // 500 Internal Server Error
            ProxyError::Certificate(_)
            | ProxyError::InvalidConfig(_)
            | ProxyError::Io(_)
            | ProxyError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Check if this is a client error (4xx)
    pub fn is_client_error(&self) -> bool {
        self.status_code().is_client_error()
    }

    /// Check if this is a server error (5xx)
    pub fn is_server_error(&self) -> bool {
        self.status_code().is_server_error()
    }
}

/// Certificate authority error type.
#[derive(Debug, Error)]
pub enum CertificateError {
    /// Failed to read CA material from disk.
    #[error("Failed to read CA: {0}")]
    Read(#[from] std::io::Error),

    /// CA certificate or key could not be parsed.
    #[error("Failed to parse CA: {0}")]
    Parse(String),

    /// Leaf or root certificate generation failed.
    #[error("Failed to generate certificate: {0}")]
    Generation(String),

    /// Failed to persist CA material.
    #[error("Failed to write CA: {0}")]
    Write(String),
}

impl From<rcgen::Error> for CertificateError {
    fn from(err: rcgen::Error) -> Self {
        CertificateError::Generation(err.to_string())
    }
}
