//! Listener and accept loop
//!
//! Accepts client connections and spawns a `ConnectionHandler` for each. A
//! semaphore permit is taken before `accept()`, so once `max_connections` are
//! being served further clients wait in the kernel backlog.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::{watch, Semaphore};
use tracing::{debug, error, info, instrument, Instrument};

use super::connection::ConnectionTracker;
use super::handler::{ConnectionHandler, ProxyContext};
use crate::config::ProxyServerConfig;
use crate::error::{ProxyError, Result};

const MIN_ACCEPT_BACKOFF: Duration = Duration::from_millis(5);
const MAX_ACCEPT_BACKOFF: Duration = Duration::from_secs(1);

/// Proxy server
pub struct ProxyServer {
    listener: TcpListener,
    context: Arc<ProxyContext>,
    limit: Arc<Semaphore>,
    tracker: ConnectionTracker,
}

impl ProxyServer {
    /// Bind the listening socket
    pub async fn bind(config: &ProxyServerConfig, context: ProxyContext) -> Result<Self> {
        if config.max_connections == 0 {
            return Err(ProxyError::InvalidConfig(
                "max_connections must be at least 1".into(),
            ));
        }
        let addr = format!("{}:{}", config.host, config.port);
        let listener = TcpListener::bind(&addr).await?;
        info!("Proxy server listening on {}", listener.local_addr()?);

        Ok(Self {
            listener,
            context: Arc::new(context),
            limit: Arc::new(Semaphore::new(config.max_connections)),
            tracker: ConnectionTracker::new(),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Connections currently being served
    pub fn active_connections(&self) -> usize {
        self.tracker.active_count()
    }

    pub fn tracker(&self) -> ConnectionTracker {
        self.tracker.clone()
    }

    /// Run the accept loop until `shutdown` flips to true
    #[instrument(skip_all)]
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let mut backoff = MIN_ACCEPT_BACKOFF;

        loop {
            let permit = tokio::select! {
                permit = self.limit.clone().acquire_owned() => permit
                    .map_err(|_| ProxyError::Internal("connection limiter closed".into()))?,
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
            };

            let accepted = tokio::select! {
                accepted = self.listener.accept() => accepted,
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
            };

            match accepted {
                Ok((stream, peer)) => {
                    backoff = MIN_ACCEPT_BACKOFF;
                    if let Err(e) = stream.set_nodelay(true) {
                        debug!("Failed to set TCP_NODELAY: {}", e);
                    }

                    let guard = self.tracker.track();
                    let id = guard.id();
                    let context = self.context.clone();
                    debug!(conn = %id, peer = %peer, "Accepted connection");

                    tokio::spawn(
                        async move {
                            let _permit = permit;
                            let _guard = guard;
                            let handler = ConnectionHandler::new(id, stream, peer, context);
                            if let Err(e) = handler.run().await {
                                debug!(conn = %id, error = %e, "Connection error");
                            }
                        }
                        .in_current_span(),
                    );
                }
                Err(e) => {
                    error!(error = %e, backoff_ms = backoff.as_millis() as u64, "Accept error");
                    drop(permit);
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(MAX_ACCEPT_BACKOFF);
                }
            }
        }

        info!(
            served = self.tracker.total_count(),
            active = self.tracker.active_count(),
            "Proxy server shutting down"
        );
        Ok(())
    }
}
