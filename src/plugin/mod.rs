//! Plugin hooks
//!
//! A plugin observes, rewrites, or rejects traffic at five points in a
//! connection's life. One instance is created per connection by a
//! `PluginFactory`, so instance state never leaks between clients. Plugins that
//! share state across instances (rule lists, rate limiters) hold it behind `Arc`.

mod auth;
mod dispatcher;
mod filter;
mod rate_limit;

pub use auth::{ProxyAuth, ProxyAuthPlugin};
pub use dispatcher::PluginDispatcher;
pub use filter::{FilterByUrlRegexPlugin, FilterRule, FilterRules};
pub use rate_limit::{RateLimitPlugin, RateLimiter};

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

use crate::config::PluginConfig;
use crate::error::Result;
use crate::http::{HttpParser, Rejection};
use crate::proxy::connection::ConnectionId;

/// Outcome of a request hook
#[derive(Debug)]
pub enum RequestDecision {
    /// Continue with this (possibly modified) request
    Forward(HttpParser),
    /// Stop processing and close the connection without a response
    Drop,
    /// Stop processing and answer with this response
    Reject(Rejection),
}

/// Who a plugin instance is serving
#[derive(Debug, Clone, Copy)]
pub struct ClientContext {
    pub connection_id: ConnectionId,
    pub peer_addr: SocketAddr,
}

/// Hook interface every plugin implements. All hooks default to pass-through.
///
/// Hooks that run while a connection is relaying take `&self`: a request hook
/// may still be pending while upstream chunks flow to the client, so both
/// directions call into the same instance concurrently. Per-instance state
/// touched from those hooks needs interior mutability.
#[async_trait]
pub trait HttpProxyPlugin: Send + Sync {
    fn name(&self) -> &'static str;

    /// Runs before any upstream connection is attempted
    async fn before_upstream_connection(&mut self, request: HttpParser) -> RequestDecision {
        RequestDecision::Forward(request)
    }

    /// Runs for every request, including requests inside an established session
    async fn handle_client_request(&self, request: HttpParser) -> RequestDecision {
        RequestDecision::Forward(request)
    }

    /// Client to upstream bytes
    fn handle_client_chunk(&self, chunk: Bytes) -> Bytes {
        chunk
    }

    /// Upstream to client bytes
    fn handle_upstream_chunk(&self, chunk: Bytes) -> Bytes {
        chunk
    }

    /// Called once after an upstream connection closes
    fn on_upstream_connection_close(&mut self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Creates one plugin instance per connection
pub trait PluginFactory: Send + Sync {
    fn name(&self) -> &'static str;

    fn create(&self, client: &ClientContext) -> Box<dyn HttpProxyPlugin>;
}

/// Factory backed by a closure
pub struct FnPluginFactory<F> {
    name: &'static str,
    make: F,
}

impl<F> PluginFactory for FnPluginFactory<F>
where
    F: Fn(&ClientContext) -> Box<dyn HttpProxyPlugin> + Send + Sync,
{
    fn name(&self) -> &'static str {
        self.name
    }

    fn create(&self, client: &ClientContext) -> Box<dyn HttpProxyPlugin> {
        (self.make)(client)
    }
}

pub fn factory_fn<F>(name: &'static str, make: F) -> Arc<dyn PluginFactory>
where
    F: Fn(&ClientContext) -> Box<dyn HttpProxyPlugin> + Send + Sync + 'static,
{
    Arc::new(FnPluginFactory { name, make })
}

/// Built-in plugins selectable by name
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PluginKind {
    FilterByUrlRegex,
    ProxyAuth,
    RateLimit,
}

impl PluginKind {
    pub fn from_str(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "filter_by_url_regex" | "filterbyurlregex" | "filter-by-url-regex" | "url_filter" => {
                Some(Self::FilterByUrlRegex)
            }
            "proxy_auth" | "proxyauth" | "proxy-auth" | "auth" => Some(Self::ProxyAuth),
            "rate_limit" | "ratelimit" | "rate-limit" => Some(Self::RateLimit),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::FilterByUrlRegex => "filter_by_url_regex",
            Self::ProxyAuth => "proxy_auth",
            Self::RateLimit => "rate_limit",
        }
    }
}

/// Create the factory for a built-in plugin
pub fn create_factory(kind: PluginKind, config: &PluginConfig) -> Result<Arc<dyn PluginFactory>> {
    Ok(match kind {
        PluginKind::FilterByUrlRegex => {
            let rules = match &config.filter_rules_file {
                Some(path) => FilterRules::from_file(path)?,
                None => FilterRules::default_rules()?,
            };
            let rules = Arc::new(rules);
            factory_fn(kind.as_str(), move |_| {
                Box::new(FilterByUrlRegexPlugin::new(rules.clone()))
            })
        }
        PluginKind::ProxyAuth => {
            let auth = ProxyAuth::new(config.auth_username.clone(), config.auth_password.clone());
            factory_fn(kind.as_str(), move |_| Box::new(ProxyAuthPlugin::new(auth.clone())))
        }
        PluginKind::RateLimit => {
            let limiter = RateLimiter::new(config.rate_limit_per_second, config.rate_limit_burst);
            factory_fn(kind.as_str(), move |client| {
                Box::new(RateLimitPlugin::new(limiter.clone(), client.peer_addr.ip()))
            })
        }
    })
}

/// Ordered plugin factories shared by all connections
#[derive(Clone, Default)]
pub struct PluginRegistry {
    factories: Vec<Arc<dyn PluginFactory>>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the registry: authentication, rate limiting, then the configured
    /// plugin list in order. Each built-in is registered at most once.
    pub fn from_config(config: &PluginConfig) -> Result<Self> {
        let mut kinds = Vec::new();
        if config.auth_enabled {
            kinds.push(PluginKind::ProxyAuth);
        }
        if config.rate_limit_enabled {
            kinds.push(PluginKind::RateLimit);
        }
        for kind in &config.plugins {
            if !kinds.contains(kind) {
                kinds.push(*kind);
            }
        }

        let mut registry = Self::new();
        for kind in kinds {
            registry.register(create_factory(kind, config)?);
        }
        Ok(registry)
    }

    pub fn register(&mut self, factory: Arc<dyn PluginFactory>) {
        self.factories.push(factory);
    }

    pub fn with(mut self, factory: Arc<dyn PluginFactory>) -> Self {
        self.register(factory);
        self
    }

    pub fn len(&self) -> usize {
        self.factories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.factories.is_empty()
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.factories.iter().map(|f| f.name()).collect()
    }

    /// Fresh plugin instances for one connection, in registration order
    pub fn instantiate(&self, client: &ClientContext) -> PluginDispatcher {
        PluginDispatcher::new(self.factories.iter().map(|f| f.create(client)).collect())
    }
}

impl std::fmt::Debug for PluginRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginRegistry")
            .field("plugins", &self.names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plugin_kind_from_str() {
        assert_eq!(
            PluginKind::from_str("filter_by_url_regex"),
            Some(PluginKind::FilterByUrlRegex)
        );
        assert_eq!(PluginKind::from_str("Proxy-Auth"), Some(PluginKind::ProxyAuth));
        assert_eq!(PluginKind::from_str(" ratelimit "), Some(PluginKind::RateLimit));
        assert_eq!(PluginKind::from_str("unknown"), None);
    }

    #[test]
    fn test_plugin_kind_as_str_round_trips() {
        for kind in [
            PluginKind::FilterByUrlRegex,
            PluginKind::ProxyAuth,
            PluginKind::RateLimit,
        ] {
            assert_eq!(PluginKind::from_str(kind.as_str()), Some(kind));
        }
    }

    #[test]
    fn test_registry_from_config_ordering() {
        let config = PluginConfig {
            plugins: vec![PluginKind::FilterByUrlRegex, PluginKind::RateLimit],
            auth_enabled: true,
            auth_username: "user".to_string(),
            auth_password: "pass".to_string(),
            rate_limit_enabled: true,
            ..PluginConfig::default()
        };
        let registry = PluginRegistry::from_config(&config).unwrap();
        assert_eq!(
            registry.names(),
            vec!["proxy_auth", "rate_limit", "filter_by_url_regex"]
        );
    }

    #[test]
    fn test_registry_instantiates_per_connection() {
        let registry = PluginRegistry::new().with(factory_fn("noop", |_| {
            struct Noop;
            #[async_trait::async_trait]
            impl HttpProxyPlugin for Noop {
                fn name(&self) -> &'static str {
                    "noop"
                }
            }
            Box::new(Noop)
        }));
        let client = ClientContext {
            connection_id: ConnectionId::next(),
            peer_addr: "127.0.0.1:5000".parse().unwrap(),
        };
        assert_eq!(registry.instantiate(&client).len(), 1);
        assert_eq!(registry.instantiate(&client).len(), 1);
        assert!(PluginRegistry::new().instantiate(&client).is_empty());
    }
}
