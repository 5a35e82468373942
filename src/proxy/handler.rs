//! Connection handler
//!
//! Drives one client connection: read the first request, run the request
//! hooks, open the upstream, then hand the two legs to the relay loop.
//!
//! CONNECT requests are answered with `200 Connection Established` once the
//! upstream TCP connection is up. With interception enabled the client's TLS is
//! terminated using a certificate minted for the CONNECT host, a second TLS
//! session is opened to the real upstream, and the decrypted traffic is relayed
//! as HTTP. If the upstream TLS handshake fails the connection falls back to a
//! transparent tunnel.

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, info, instrument, trace, warn};

use super::connection::{ConnectionId, ConnectionState};
use super::transport::{format_authority, prepare_forward_request, Rewind, UpstreamTransport};
use super::tunnel::{teardown_timeout, HttpRelay, RelayEnd, RelayMode, RelayOptions, TunnelHandler};
use crate::config::{Config, ProxyServerConfig};
use crate::error::{ProxyError, Result};
use crate::http::{HttpParser, ParseStatus, ParserState, Rejection, CONNECTION_ESTABLISHED, DEFAULT_HTTP_PORT};
use crate::plugin::{ClientContext, PluginDispatcher, PluginRegistry, RequestDecision};
use crate::tls::{CertificateAuthority, TlsInterceptor};

/// Everything a connection needs, shared by all connections
pub struct ProxyContext {
    pub config: ProxyServerConfig,
    pub interceptor: Option<Arc<TlsInterceptor>>,
    pub plugins: PluginRegistry,
}

impl ProxyContext {
    pub fn new(config: ProxyServerConfig, plugins: PluginRegistry) -> Self {
        Self {
            config,
            interceptor: None,
            plugins,
        }
    }

    pub fn with_interceptor(mut self, interceptor: Arc<TlsInterceptor>) -> Self {
        self.interceptor = Some(interceptor);
        self
    }

    /// Build the plugin registry and, when interception is on, load the CA
    pub fn from_config(config: &Config) -> Result<Self> {
        let plugins = PluginRegistry::from_config(&config.plugins)?;
        let context = Self::new(config.proxy.clone(), plugins);

        if !config.tls.intercept {
            return Ok(context);
        }
        let (Some(cert), Some(key)) = (&config.tls.ca_cert_file, &config.tls.ca_key_file) else {
            return Err(ProxyError::InvalidConfig(
                "TLS interception requires a CA certificate and key".into(),
            ));
        };
        let authority = Arc::new(CertificateAuthority::from_pem_files(cert, key)?);
        info!(cert = %cert.display(), "Loaded interception CA");
        let interceptor =
            TlsInterceptor::with_webpki_roots(authority, config.tls.upstream_ca_file.as_deref())?;
        Ok(context.with_interceptor(Arc::new(interceptor)))
    }

    fn relay_options(&self, mode: RelayMode) -> RelayOptions {
        RelayOptions {
            mode,
            close_policy: self.config.close_policy,
            idle_timeout: self.config.idle_timeout(),
            buffer_size: self.config.buffer_size,
            limits: self.config.parser_limits(),
        }
    }
}

enum ReadOutcome {
    Request(HttpParser),
    Closed,
    Reject(Rejection),
}

/// State machine for a single client connection
pub struct ConnectionHandler<S> {
    id: ConnectionId,
    peer: SocketAddr,
    client: S,
    context: Arc<ProxyContext>,
    state: ConnectionState,
}

impl<S> ConnectionHandler<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub fn new(id: ConnectionId, client: S, peer: SocketAddr, context: Arc<ProxyContext>) -> Self {
        Self {
            id,
            peer,
            client,
            context,
            state: ConnectionState::Accepted,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Serve the connection to completion
    #[instrument(skip_all, fields(conn = %self.id, peer = %self.peer))]
    pub async fn run(mut self) -> Result<()> {
        let mut plugins = self.context.plugins.instantiate(&ClientContext {
            connection_id: self.id,
            peer_addr: self.peer,
        });

        self.transition(ConnectionState::ReadingRequest);
        let mut request = match self.read_request().await? {
            ReadOutcome::Request(request) => request,
            ReadOutcome::Closed => {
                self.close().await;
                return Ok(());
            }
            ReadOutcome::Reject(rejection) => {
                self.reject(rejection).await;
                return Ok(());
            }
        };
        let leftover = request.take_buffered();

        let Some(host) = request.host().filter(|h| !h.is_empty()).map(str::to_string) else {
            debug!("Request has no host");
            let err = ProxyError::InvalidRequest("request has no host".into());
            self.reject(Rejection::from_error(&err)).await;
            return Ok(());
        };
        debug!(
            method = request.method().map(|m| m.as_str()).unwrap_or("-"),
            url = %request.url(),
            "Request received"
        );

        let request = match plugins.run_request_hooks(request).await {
            RequestDecision::Forward(request) => request,
            RequestDecision::Reject(rejection) => {
                self.reject(rejection).await;
                return Ok(());
            }
            RequestDecision::Drop => {
                self.close().await;
                return Ok(());
            }
        };
        let host = request.host().map(str::to_string).unwrap_or(host);
        let port = request.port().unwrap_or(DEFAULT_HTTP_PORT);

        self.transition(ConnectionState::ConnectingUpstream);
        let upstream =
            match UpstreamTransport::connect(&host, port, self.context.config.connect_timeout()).await {
                Ok(upstream) => upstream,
                Err(e) => {
                    warn!(upstream = %format_authority(&host, port), error = %e, "Upstream connection failed");
                    self.reject(Rejection::from_error(&e)).await;
                    return Ok(());
                }
            };

        let result = if request.is_connect() {
            self.handle_connect(&host, port, upstream, leftover, &plugins)
                .await
        } else {
            self.handle_http(request, &host, port, upstream, leftover, &plugins)
                .await
        };
        plugins.on_upstream_connection_close();
        self.transition(ConnectionState::Closed);

        let end = result?;
        info!(
            upstream = %format_authority(&host, port),
            client_bytes = end.client_bytes,
            upstream_bytes = end.upstream_bytes,
            reason = ?end.reason,
            "Connection closed"
        );
        Ok(())
    }

    async fn read_request(&mut self) -> Result<ReadOutcome> {
        let config = &self.context.config;
        let idle = config.idle_timeout();
        let mut parser = HttpParser::request(config.parser_limits());
        let mut buf = vec![0u8; config.buffer_size.max(1)];

        loop {
            let n = match timeout(idle, self.client.read(&mut buf)).await {
                Ok(read) => read?,
                Err(_) if parser.state() >= ParserState::LineRcvd => {
                    debug!("Timed out reading request");
                    return Ok(ReadOutcome::Reject(Rejection::from_error(
                        &ProxyError::ClientTimeout,
                    )));
                }
                Err(_) => {
                    debug!("Timed out waiting for a request");
                    return Ok(ReadOutcome::Closed);
                }
            };
            if n == 0 {
                debug!("Client closed before sending a complete request");
                return Ok(ReadOutcome::Closed);
            }

            match parser.feed(&buf[..n]) {
                Ok(ParseStatus::Complete) => return Ok(ReadOutcome::Request(parser)),
                Ok(ParseStatus::NeedMore) => {}
                Err(e) if parser.state() >= ParserState::LineRcvd => {
                    debug!(error = %e, "Malformed request");
                    return Ok(ReadOutcome::Reject(Rejection::from_error(&ProxyError::Parse(e))));
                }
                Err(e) => {
                    debug!(error = %e, "Unparseable request line");
                    return Ok(ReadOutcome::Closed);
                }
            }
        }
    }

    async fn handle_connect(
        &mut self,
        host: &str,
        port: u16,
        upstream: TcpStream,
        leftover: Bytes,
        plugins: &PluginDispatcher,
    ) -> Result<RelayEnd> {
        self.client.write_all(CONNECTION_ESTABLISHED).await?;

        match self.context.interceptor.clone() {
            Some(interceptor) => {
                self.intercept(&interceptor, host, port, upstream, leftover, plugins)
                    .await
            }
            None => self.tunnel(upstream, leftover, plugins).await,
        }
    }

    async fn intercept(
        &mut self,
        interceptor: &TlsInterceptor,
        host: &str,
        port: u16,
        upstream: TcpStream,
        leftover: Bytes,
        plugins: &PluginDispatcher,
    ) -> Result<RelayEnd> {
        let handshake_timeout = self.context.config.connect_timeout();

        let leaf = match interceptor.certificate_for(host).await {
            Ok(leaf) => leaf,
            Err(e) => {
                warn!(host, error = %e, "Certificate generation failed, tunneling instead");
                return self.tunnel(upstream, leftover, plugins).await;
            }
        };

        let upstream_tls = timeout(handshake_timeout, interceptor.connect_upstream(upstream, host))
            .await
            .unwrap_or_else(|_| Err(ProxyError::UpstreamTimeout(format_authority(host, port))));
        let mut upstream_tls = match upstream_tls {
            Ok(stream) => stream,
            Err(e) => {
                warn!(
                    upstream = %format_authority(host, port),
                    error = %e,
                    "Upstream TLS failed, falling back to a transparent tunnel"
                );
                let upstream = UpstreamTransport::connect(host, port, handshake_timeout).await?;
                return self.tunnel(upstream, leftover, plugins).await;
            }
        };

        self.transition(ConnectionState::RelayingHttp);
        let options = self
            .context
            .relay_options(RelayMode::Http(HttpRelay::intercepted(port)));
        let client_io = Rewind::new(&mut self.client, leftover);
        let mut client_tls = timeout(handshake_timeout, interceptor.accept_client(client_io, &leaf))
            .await
            .unwrap_or_else(|_| {
                Err(ProxyError::TlsHandshake(format!(
                    "client side for {host} timed out"
                )))
            })?;
        debug!(host, "TLS session intercepted");

        TunnelHandler::relay(
            &mut client_tls,
            &mut upstream_tls,
            Bytes::new(),
            plugins,
            &options,
        )
        .await
    }

    async fn tunnel(
        &mut self,
        mut upstream: TcpStream,
        leftover: Bytes,
        plugins: &PluginDispatcher,
    ) -> Result<RelayEnd> {
        self.transition(ConnectionState::Tunneling);
        let options = self.context.relay_options(RelayMode::Tunnel);
        TunnelHandler::relay(&mut self.client, &mut upstream, leftover, plugins, &options).await
    }

    async fn handle_http(
        &mut self,
        mut request: HttpParser,
        host: &str,
        port: u16,
        mut upstream: TcpStream,
        leftover: Bytes,
        plugins: &PluginDispatcher,
    ) -> Result<RelayEnd> {
        prepare_forward_request(&mut request);
        upstream
            .write_all(&request.build())
            .await
            .map_err(ProxyError::Relay)?;

        self.transition(ConnectionState::RelayingHttp);
        let relay = HttpRelay::plain(host, port, request.method().cloned());
        let options = self.context.relay_options(RelayMode::Http(relay));
        TunnelHandler::relay(&mut self.client, &mut upstream, leftover, plugins, &options).await
    }

    async fn reject(&mut self, rejection: Rejection) {
        self.transition(ConnectionState::Rejected);
        debug!(status = rejection.status().as_u16(), "Rejecting request");
        let grace = teardown_timeout(self.context.config.idle_timeout());
        match timeout(grace, self.client.write_all(&rejection.to_bytes())).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!("Failed to send rejection: {}", e),
            Err(_) => debug!(timeout = ?grace, "Client did not read the rejection"),
        }
        self.close().await;
    }

    async fn close(&mut self) {
        let grace = teardown_timeout(self.context.config.idle_timeout());
        match timeout(grace, self.client.shutdown()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => trace!("Client shutdown: {}", e),
            Err(_) => debug!(timeout = ?grace, "Client shutdown timed out"),
        }
        self.transition(ConnectionState::Closed);
    }

    fn transition(&mut self, next: ConnectionState) {
        trace!(from = %self.state, to = %next, "State change");
        self.state = next;
    }
}
