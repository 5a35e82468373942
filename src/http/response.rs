use bytes::Bytes;
use http::StatusCode;

use crate::error::ProxyError;

/// Reply sent to a client after a successful CONNECT
pub const CONNECTION_ESTABLISHED: &[u8] = b"HTTP/1.1 200 Connection Established\r\n\r\n";

/// A synthesized response that ends the connection.
///
/// Produced by plugins that reject a request and by the connection handler for
/// parse, timeout, and upstream failures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rejection {
    status: StatusCode,
    reason: Option<String>,
    headers: Vec<(String, String)>,
    body: Bytes,
}

impl Rejection {
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            reason: None,
            headers: Vec::new(),
            body: Bytes::new(),
        }
    }

    /// Build from a numeric status. Non-standard codes such as 444 are accepted.
    pub fn from_code(code: u16) -> Option<Self> {
        StatusCode::from_u16(code).ok().map(Self::new)
    }

    /// Gateway or client error response matching `err`
    pub fn from_error(err: &ProxyError) -> Self {
        let rejection = Self::new(err.status_code());
        match err {
            ProxyError::AuthenticationFailed => {
                rejection.with_header("Proxy-Authenticate", "Basic realm=\"interpose\"")
            }
            _ => rejection,
        }
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn headers(&self) -> &[(String, String)] {
        &self.headers
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Serialize as an HTTP/1.1 response. `Connection: close` is added unless the
    /// rejection already names a Connection header, and Content-Length accompanies
    /// a non-empty body.
    pub fn to_bytes(&self) -> Vec<u8> {
        let reason = self
            .reason
            .as_deref()
            .or_else(|| self.status.canonical_reason())
            .unwrap_or_default();

        let mut out = format!("HTTP/1.1 {} {}\r\n", self.status.as_u16(), reason).into_bytes();
        let has = |name: &str| self.headers.iter().any(|(n, _)| n.eq_ignore_ascii_case(name));

        for (name, value) in &self.headers {
            out.extend_from_slice(format!("{name}: {value}\r\n").as_bytes());
        }
        if !has("connection") {
            out.extend_from_slice(b"Connection: close\r\n");
        }
        if !self.body.is_empty() && !has("content-length") {
            out.extend_from_slice(format!("Content-Length: {}\r\n", self.body.len()).as_bytes());
        }
        out.extend_from_slice(b"\r\n");
        out.extend_from_slice(&self.body);
        out
    }
}
