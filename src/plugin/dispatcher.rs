use std::panic::{self, AssertUnwindSafe};

use bytes::Bytes;
use tracing::{debug, error, warn};

use super::{HttpProxyPlugin, RequestDecision};
use crate::http::HttpParser;

/// Runs one connection's plugin instances in registration order.
///
/// Request hooks short-circuit: the first plugin to reject or drop a request
/// ends the chain and later plugins are not invoked for it.
pub struct PluginDispatcher {
    plugins: Vec<Box<dyn HttpProxyPlugin>>,
}

impl PluginDispatcher {
    pub fn new(plugins: Vec<Box<dyn HttpProxyPlugin>>) -> Self {
        Self { plugins }
    }

    pub fn len(&self) -> usize {
        self.plugins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }

    /// `before_upstream_connection` across all plugins, then
    /// `handle_client_request` across all plugins
    pub async fn run_request_hooks(&mut self, request: HttpParser) -> RequestDecision {
        match self.before_upstream_connection(request).await {
            RequestDecision::Forward(request) => self.handle_client_request(request).await,
            other => other,
        }
    }

    pub async fn before_upstream_connection(&mut self, mut request: HttpParser) -> RequestDecision {
        for plugin in self.plugins.iter_mut() {
            match plugin.before_upstream_connection(request).await {
                RequestDecision::Forward(next) => request = next,
                decision => {
                    log_short_circuit(plugin.name(), "before_upstream_connection", &decision);
                    return decision;
                }
            }
        }
        RequestDecision::Forward(request)
    }

    /// Takes `&self` so it can run while the relay is folding chunks through
    /// the same plugins
    pub async fn handle_client_request(&self, mut request: HttpParser) -> RequestDecision {
        for plugin in self.plugins.iter() {
            match plugin.handle_client_request(request).await {
                RequestDecision::Forward(next) => request = next,
                decision => {
                    log_short_circuit(plugin.name(), "handle_client_request", &decision);
                    return decision;
                }
            }
        }
        RequestDecision::Forward(request)
    }

    pub fn handle_client_chunk(&self, chunk: Bytes) -> Bytes {
        self.plugins
            .iter()
            .fold(chunk, |chunk, plugin| plugin.handle_client_chunk(chunk))
    }

    pub fn handle_upstream_chunk(&self, chunk: Bytes) -> Bytes {
        self.plugins
            .iter()
            .fold(chunk, |chunk, plugin| plugin.handle_upstream_chunk(chunk))
    }

    /// Notify every plugin. Errors and panics are logged and never propagate.
    pub fn on_upstream_connection_close(&mut self) {
        for plugin in self.plugins.iter_mut() {
            let name = plugin.name();
            match panic::catch_unwind(AssertUnwindSafe(|| plugin.on_upstream_connection_close())) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(plugin = name, error = %e, "on_upstream_connection_close failed"),
                Err(_) => error!(plugin = name, "on_upstream_connection_close panicked"),
            }
        }
    }
}

fn log_short_circuit(plugin: &str, hook: &str, decision: &RequestDecision) {
    match decision {
        RequestDecision::Reject(rejection) => debug!(
            plugin,
            hook,
            status = rejection.status().as_u16(),
            "Request rejected by plugin"
        ),
        RequestDecision::Drop => debug!(plugin, hook, "Request dropped by plugin"),
        RequestDecision::Forward(_) => {}
    }
}
