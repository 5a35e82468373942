//! Proxy authentication plugin
//!
//! Handles Basic authentication for the proxy server.

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use tracing::{debug, warn};

use super::{HttpProxyPlugin, RequestDecision};
use crate::error::{ProxyError, Result};
use crate::http::{HttpParser, Rejection};

/// Basic credential check for `Proxy-Authorization`
#[derive(Clone)]
pub struct ProxyAuth {
    /// Expected username
    username: String,
    /// Expected password
    password: String,
}

impl ProxyAuth {
    /// Create a new proxy auth handler
    pub fn new(username: String, password: String) -> Self {
        Self { username, password }
    }

    /// Validate the Proxy-Authorization header of `request`
    pub fn validate(&self, request: &HttpParser) -> Result<()> {
        let auth_str = request
            .headers()
            .get_str("proxy-authorization")
            .ok_or(ProxyError::AuthenticationFailed)?;

        // Parse "Basic <base64>"
        let Some(encoded) = auth_str.strip_prefix("Basic ") else {
            warn!("Invalid auth scheme, expected Basic");
            return Err(ProxyError::AuthenticationFailed);
        };

        let decoded = BASE64
            .decode(encoded.trim())
            .map_err(|_| ProxyError::AuthenticationFailed)?;

        let credentials = String::from_utf8(decoded).map_err(|_| ProxyError::AuthenticationFailed)?;

        let (user, pass) = credentials
            .split_once(':')
            .ok_or(ProxyError::AuthenticationFailed)?;

        if user == self.username && pass == self.password {
            debug!("Proxy authentication successful for user: {}", user);
            Ok(())
        } else {
            warn!("Proxy authentication failed for user: {}", user);
            Err(ProxyError::AuthenticationFailed)
        }
    }

    /// 407 Proxy Authentication Required with a Basic challenge
    pub fn challenge(&self) -> Rejection {
        Rejection::from_error(&ProxyError::AuthenticationFailed)
    }
}

/// Rejects unauthenticated requests before an upstream connection is opened
pub struct ProxyAuthPlugin {
    auth: ProxyAuth,
}

impl ProxyAuthPlugin {
    pub fn new(auth: ProxyAuth) -> Self {
        Self { auth }
    }
}

#[async_trait]
impl HttpProxyPlugin for ProxyAuthPlugin {
    fn name(&self) -> &'static str {
        "proxy_auth"
    }

    async fn before_upstream_connection(&mut self, request: HttpParser) -> RequestDecision {
        match self.auth.validate(&request) {
            Ok(()) => RequestDecision::Forward(request),
            Err(_) => RequestDecision::Reject(self.auth.challenge()),
        }
    }
}
