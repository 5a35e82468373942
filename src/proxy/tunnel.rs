//! Relay loop
//!
//! Moves bytes between the client and upstream legs of an established
//! connection. Every read passes through the plugin chunk hooks. In HTTP mode
//! client bytes are also parsed so each pipelined request goes through
//! `handle_client_request` before it is forwarded.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use bytes::Bytes;
use http::Method;
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::{timeout, Instant};
use tracing::{debug, instrument};

use super::transport::prepare_forward_request;
use crate::error::{ProxyError, Result};
use crate::http::{HttpParser, ParseStatus, ParserLimits, Rejection, DEFAULT_HTTP_PORT};
use crate::plugin::{PluginDispatcher, RequestDecision};

/// Longest wait for a closing response or a shutdown to reach a peer
pub const TEARDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Teardown bound for a connection with the given idle timeout
pub fn teardown_timeout(idle_timeout: Duration) -> Duration {
    idle_timeout.min(TEARDOWN_TIMEOUT)
}

/// What happens to the other direction when one side reaches EOF
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ClosePolicy {
    /// Tear down both legs
    #[default]
    CloseBoth,
    /// Forward the FIN and keep relaying the other direction
    HalfClose,
}

impl ClosePolicy {
    pub fn from_str(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "close_both" | "closeboth" | "close-both" | "both" => Some(Self::CloseBoth),
            "half_close" | "halfclose" | "half-close" | "half" => Some(Self::HalfClose),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CloseBoth => "close_both",
            Self::HalfClose => "half_close",
        }
    }
}

/// Settings for relaying parsed HTTP traffic
#[derive(Debug, Clone)]
pub struct HttpRelay {
    /// Port assumed for origin-form requests
    pub default_port: u16,
    /// Authority every request must target; any other ends the relay
    pub pinned_authority: Option<(String, u16)>,
    /// Apply plain-proxy header rewriting to each forwarded request
    pub rewrite_requests: bool,
    /// Method of a request forwarded before the relay started
    pub in_flight: Option<Method>,
}

impl HttpRelay {
    /// Plain HTTP proxying to `host:port`
    pub fn plain(host: impl Into<String>, port: u16, in_flight: Option<Method>) -> Self {
        Self {
            default_port: DEFAULT_HTTP_PORT,
            pinned_authority: Some((host.into(), port)),
            rewrite_requests: true,
            in_flight,
        }
    }

    /// Decrypted traffic inside an intercepted TLS session opened by
    /// `CONNECT host:port`. Requests whose `Host` omits a port get `port`.
    pub fn intercepted(port: u16) -> Self {
        Self {
            default_port: port,
            pinned_authority: None,
            rewrite_requests: false,
            in_flight: None,
        }
    }
}

#[derive(Debug, Clone)]
pub enum RelayMode {
    /// Opaque bytes
    Tunnel,
    /// HTTP/1.x requests and responses
    Http(HttpRelay),
}

impl RelayMode {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Tunnel => "tunnel",
            Self::Http(_) => "http",
        }
    }
}

#[derive(Debug, Clone)]
pub struct RelayOptions {
    pub mode: RelayMode,
    pub close_policy: ClosePolicy,
    pub idle_timeout: Duration,
    pub buffer_size: usize,
    pub limits: ParserLimits,
}

impl Default for RelayOptions {
    fn default() -> Self {
        Self {
            mode: RelayMode::Tunnel,
            close_policy: ClosePolicy::CloseBoth,
            idle_timeout: Duration::from_secs(30),
            buffer_size: 16 * 1024,
            limits: ParserLimits::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RelayEndReason {
    /// A peer closed
    Closed,
    /// No bytes moved in either direction for the idle timeout
    IdleTimeout,
    /// A pipelined request was rejected; the response was sent to the client
    Rejected(Rejection),
    /// A pipelined request was dropped
    Dropped,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RelayEnd {
    pub reason: RelayEndReason,
    /// Bytes read from the client
    pub client_bytes: u64,
    /// Bytes read from the upstream
    pub upstream_bytes: u64,
}

/// How the client-to-upstream direction finished
enum ClientEnd {
    Eof,
    AuthorityChanged,
    Rejected(Rejection),
    Dropped,
}

/// Last time a byte moved in either direction
struct Activity {
    last: Mutex<Instant>,
}

impl Activity {
    fn new() -> Self {
        Self {
            last: Mutex::new(Instant::now()),
        }
    }

    fn touch(&self) {
        *self.last.lock() = Instant::now();
    }

    /// Resolves once `timeout` passes without a `touch`
    async fn expired(&self, timeout: Duration) {
        loop {
            let deadline = *self.last.lock() + timeout;
            if Instant::now() >= deadline {
                return;
            }
            tokio::time::sleep_until(deadline).await;
        }
    }
}

/// Follows upstream responses for logging. Bodies are framed, not kept.
struct ResponseObserver {
    parser: HttpParser,
    awaiting_method: bool,
}

impl ResponseObserver {
    fn new(limits: ParserLimits) -> Self {
        Self {
            parser: HttpParser::response(limits).discard_body(),
            awaiting_method: true,
        }
    }

    /// False once the stream stops looking like HTTP
    fn observe(&mut self, chunk: &[u8], in_flight: &Mutex<VecDeque<Method>>) -> bool {
        let mut input = chunk;
        loop {
            if self.awaiting_method {
                if let Some(method) = in_flight.lock().pop_front() {
                    self.parser.expect_response_to(method);
                }
                self.awaiting_method = false;
            }
            match self.parser.feed(input) {
                Ok(ParseStatus::NeedMore) => return true,
                Ok(ParseStatus::Complete) => {
                    let response = self.parser.take_message();
                    Self::log(&response);
                    self.awaiting_method = true;
                    if self.parser.buffered() == 0 {
                        return true;
                    }
                    input = &[];
                }
                Err(e) => {
                    debug!(error = %e, "Stopped following upstream responses");
                    return false;
                }
            }
        }
    }

    fn finish(&mut self) {
        if let Ok(ParseStatus::Complete) = self.parser.finish() {
            Self::log(&self.parser);
        }
    }

    fn log(response: &HttpParser) {
        debug!(
            status = response.status_code().unwrap_or_default(),
            reason = response.reason().unwrap_or_default(),
            "Upstream response"
        );
    }
}

/// Bidirectional relay between a client and an upstream
pub struct TunnelHandler;

impl TunnelHandler {
    /// Relay until a peer closes, the idle timeout fires, or a plugin stops a
    /// pipelined request. `leftover` holds client bytes already read past the
    /// first request and is relayed before anything else.
    ///
    /// Both legs are shut down before returning. A rejection is written to the
    /// client first. Teardown gives up after [`teardown_timeout`] and leaves the
    /// streams to be dropped.
    #[instrument(skip_all, fields(mode = options.mode.name()))]
    pub async fn relay<C, U>(
        client: &mut C,
        upstream: &mut U,
        leftover: Bytes,
        plugins: &PluginDispatcher,
        options: &RelayOptions,
    ) -> Result<RelayEnd>
    where
        C: AsyncRead + AsyncWrite + Unpin + Send,
        U: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let activity = Activity::new();
        let client_bytes = AtomicU64::new(0);
        let upstream_bytes = AtomicU64::new(0);
        let in_flight = Mutex::new(VecDeque::new());
        if let RelayMode::Http(HttpRelay {
            in_flight: Some(method),
            ..
        }) = &options.mode
        {
            in_flight.lock().push_back(method.clone());
        }

        let reason = {
            let (client_read, client_write) = tokio::io::split(&mut *client);
            let (upstream_read, upstream_write) = tokio::io::split(&mut *upstream);

            let client_to_upstream = Self::pump_client(
                client_read,
                upstream_write,
                leftover,
                plugins,
                options,
                &activity,
                &client_bytes,
                &in_flight,
            );
            let upstream_to_client = Self::pump_upstream(
                upstream_read,
                client_write,
                plugins,
                options,
                &activity,
                &upstream_bytes,
                &in_flight,
            );
            let idle = activity.expired(options.idle_timeout);
            tokio::pin!(client_to_upstream, upstream_to_client, idle);

            let mut client_done = false;
            let mut upstream_done = false;
            loop {
                tokio::select! {
                    end = &mut client_to_upstream, if !client_done => match end? {
                        ClientEnd::Eof => {
                            debug!("Client closed");
                            client_done = true;
                            if options.close_policy == ClosePolicy::CloseBoth || upstream_done {
                                break RelayEndReason::Closed;
                            }
                        }
                        ClientEnd::AuthorityChanged => break RelayEndReason::Closed,
                        ClientEnd::Rejected(rejection) => break RelayEndReason::Rejected(rejection),
                        ClientEnd::Dropped => break RelayEndReason::Dropped,
                    },
                    end = &mut upstream_to_client, if !upstream_done => {
                        end?;
                        debug!("Upstream closed");
                        upstream_done = true;
                        if options.close_policy == ClosePolicy::CloseBoth || client_done {
                            break RelayEndReason::Closed;
                        }
                    }
                    _ = &mut idle => {
                        debug!(timeout = ?options.idle_timeout, "Relay idle");
                        break RelayEndReason::IdleTimeout;
                    }
                }
            }
        };

        // A peer that stopped reading must not hold the connection open.
        let grace = teardown_timeout(options.idle_timeout);
        let client_teardown = async {
            if let RelayEndReason::Rejected(rejection) = &reason {
                if let Err(e) = client.write_all(&rejection.to_bytes()).await {
                    debug!("Failed to send rejection: {}", e);
                }
            }
            if let Err(e) = client.shutdown().await {
                debug!("Client shutdown: {}", e);
            }
        };
        let (client_closed, upstream_closed) = tokio::join!(
            timeout(grace, client_teardown),
            timeout(grace, upstream.shutdown()),
        );
        if client_closed.is_err() {
            debug!(timeout = ?grace, "Client teardown timed out");
        }
        match upstream_closed {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!("Upstream shutdown: {}", e),
            Err(_) => debug!(timeout = ?grace, "Upstream teardown timed out"),
        }

        let end = RelayEnd {
            reason,
            client_bytes: client_bytes.load(Ordering::Relaxed),
            upstream_bytes: upstream_bytes.load(Ordering::Relaxed),
        };
        debug!(
            client_bytes = end.client_bytes,
            upstream_bytes = end.upstream_bytes,
            reason = ?end.reason,
            "Relay finished"
        );
        Ok(end)
    }

    #[allow(clippy::too_many_arguments)]
    async fn pump_client<R, W>(
        mut reader: R,
        mut writer: W,
        leftover: Bytes,
        plugins: &PluginDispatcher,
        options: &RelayOptions,
        activity: &Activity,
        counter: &AtomicU64,
        in_flight: &Mutex<VecDeque<Method>>,
    ) -> Result<ClientEnd>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut buf = vec![0u8; options.buffer_size.max(1)];
        let mut requests = match &options.mode {
            RelayMode::Http(http) => Some((
                http,
                HttpParser::request(options.limits).with_default_port(http.default_port),
            )),
            RelayMode::Tunnel => None,
        };
        let mut pending = Some(leftover).filter(|bytes| !bytes.is_empty());

        loop {
            let chunk = match pending.take() {
                Some(chunk) => chunk,
                None => {
                    let n = reader.read(&mut buf).await.map_err(ProxyError::Relay)?;
                    if n == 0 {
                        if options.close_policy == ClosePolicy::HalfClose {
                            if let Err(e) = writer.shutdown().await {
                                debug!("Upstream half-close: {}", e);
                            }
                        }
                        return Ok(ClientEnd::Eof);
                    }
                    activity.touch();
                    Bytes::copy_from_slice(&buf[..n])
                }
            };
            counter.fetch_add(chunk.len() as u64, Ordering::Relaxed);

            let chunk = plugins.handle_client_chunk(chunk);
            match requests.as_mut() {
                None => writer.write_all(&chunk).await.map_err(ProxyError::Relay)?,
                Some((http, parser)) => {
                    if let Some(end) =
                        Self::forward_requests(parser, &chunk, http, &mut writer, plugins, in_flight).await?
                    {
                        return Ok(end);
                    }
                }
            }
            activity.touch();
        }
    }

    /// Feed client bytes and forward every request they complete
    async fn forward_requests<W>(
        parser: &mut HttpParser,
        chunk: &[u8],
        relay: &HttpRelay,
        writer: &mut W,
        plugins: &PluginDispatcher,
        in_flight: &Mutex<VecDeque<Method>>,
    ) -> Result<Option<ClientEnd>>
    where
        W: AsyncWrite + Unpin,
    {
        let mut input: &[u8] = chunk;
        loop {
            match parser.feed(input) {
                Ok(ParseStatus::NeedMore) => return Ok(None),
                Ok(ParseStatus::Complete) => {}
                Err(e) => {
                    debug!(error = %e, "Malformed request on relayed connection");
                    let rejection = Rejection::from_error(&ProxyError::Parse(e));
                    return Ok(Some(ClientEnd::Rejected(rejection)));
                }
            }
            input = &[];

            let request = parser.take_message();
            if let Some((host, port)) = &relay.pinned_authority {
                let same_authority = request
                    .host()
                    .is_some_and(|h| h.eq_ignore_ascii_case(host))
                    && request.port() == Some(*port);
                if !same_authority {
                    debug!(url = %request.url(), "Request targets a different authority");
                    return Ok(Some(ClientEnd::AuthorityChanged));
                }
            }

            let decision = plugins.handle_client_request(request).await;
            let mut request = match decision {
                RequestDecision::Forward(request) => request,
                RequestDecision::Reject(rejection) => return Ok(Some(ClientEnd::Rejected(rejection))),
                RequestDecision::Drop => return Ok(Some(ClientEnd::Dropped)),
            };
            if relay.rewrite_requests {
                prepare_forward_request(&mut request);
            }
            if let Some(method) = request.method() {
                in_flight.lock().push_back(method.clone());
            }
            writer
                .write_all(&request.build())
                .await
                .map_err(ProxyError::Relay)?;
        }
    }

    async fn pump_upstream<R, W>(
        mut reader: R,
        mut writer: W,
        plugins: &PluginDispatcher,
        options: &RelayOptions,
        activity: &Activity,
        counter: &AtomicU64,
        in_flight: &Mutex<VecDeque<Method>>,
    ) -> Result<()>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut buf = vec![0u8; options.buffer_size.max(1)];
        let mut observer = match options.mode {
            RelayMode::Http(_) => Some(ResponseObserver::new(options.limits)),
            RelayMode::Tunnel => None,
        };

        loop {
            let n = reader.read(&mut buf).await.map_err(ProxyError::Relay)?;
            if n == 0 {
                if let Some(observer) = observer.as_mut() {
                    observer.finish();
                }
                if options.close_policy == ClosePolicy::HalfClose {
                    if let Err(e) = writer.shutdown().await {
                        debug!("Client half-close: {}", e);
                    }
                }
                return Ok(());
            }
            activity.touch();
            counter.fetch_add(n as u64, Ordering::Relaxed);

            let raw = Bytes::copy_from_slice(&buf[..n]);
            let following = observer
                .as_mut()
                .map_or(false, |observer| observer.observe(&raw, in_flight));
            if !following {
                observer = None;
            }

            let chunk = plugins.handle_upstream_chunk(raw);
            writer.write_all(&chunk).await.map_err(ProxyError::Relay)?;
            activity.touch();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugin::{FilterByUrlRegexPlugin, FilterRules, HttpProxyPlugin};
    use async_trait::async_trait;
    use std::sync::Arc;
    use tokio::io::{duplex, DuplexStream};
    use tokio::task::JoinHandle;
    use tokio::time::timeout;

    fn spawn_relay(
        plugins: Vec<Box<dyn HttpProxyPlugin>>,
        leftover: &'static [u8],
        options: RelayOptions,
    ) -> (DuplexStream, DuplexStream, JoinHandle<Result<RelayEnd>>) {
        spawn_relay_with_client_buffer(4096, plugins, leftover, options)
    }

    fn spawn_relay_with_client_buffer(
        client_buffer: usize,
        plugins: Vec<Box<dyn HttpProxyPlugin>>,
        leftover: &'static [u8],
        options: RelayOptions,
    ) -> (DuplexStream, DuplexStream, JoinHandle<Result<RelayEnd>>) {
        let (client_app, mut client_side) = duplex(client_buffer);
        let (mut upstream_side, upstream_app) = duplex(4096);
        let handle = tokio::spawn(async move {
            let plugins = PluginDispatcher::new(plugins);
            TunnelHandler::relay(
                &mut client_side,
                &mut upstream_side,
                Bytes::from_static(leftover),
                &plugins,
                &options,
            )
            .await
        });
        (client_app, upstream_app, handle)
    }

    async fn finished(handle: JoinHandle<Result<RelayEnd>>) -> RelayEnd {
        timeout(Duration::from_secs(2), handle)
            .await
            .expect("relay did not finish")
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn test_tunnel_relays_both_directions() {
        let (mut client, mut upstream, handle) = spawn_relay(vec![], b"", RelayOptions::default());

        client.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        upstream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        upstream.write_all(b"pong!").await.unwrap();
        let mut buf = [0u8; 5];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong!");

        drop(upstream);
        let end = finished(handle).await;
        assert_eq!(end.reason, RelayEndReason::Closed);
        assert_eq!(end.client_bytes, 4);
        assert_eq!(end.upstream_bytes, 5);

        let mut rest = Vec::new();
        client.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
    }

    #[tokio::test]
    async fn test_leftover_relayed_first() {
        let (mut client, mut upstream, handle) =
            spawn_relay(vec![], b"early", RelayOptions::default());

        client.write_all(b"-late").await.unwrap();
        let mut buf = [0u8; 10];
        upstream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"early-late");

        drop(client);
        assert_eq!(finished(handle).await.client_bytes, 10);
    }

    struct Shout;

    #[async_trait]
    impl HttpProxyPlugin for Shout {
        fn name(&self) -> &'static str {
            "shout"
        }

        fn handle_client_chunk(&self, chunk: Bytes) -> Bytes {
            chunk.to_ascii_uppercase().into()
        }

        fn handle_upstream_chunk(&self, chunk: Bytes) -> Bytes {
            [b"<", &chunk[..]].concat().into()
        }
    }

    #[tokio::test]
    async fn test_chunk_hooks_applied_per_direction() {
        let (mut client, mut upstream, handle) =
            spawn_relay(vec![Box::new(Shout)], b"", RelayOptions::default());

        client.write_all(b"abc").await.unwrap();
        let mut buf = [0u8; 3];
        upstream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ABC");

        upstream.write_all(b"xyz").await.unwrap();
        let mut buf = [0u8; 4];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"<xyz");

        drop(client);
        let end = finished(handle).await;
        assert_eq!(end.client_bytes, 3);
        assert_eq!(end.upstream_bytes, 3);
    }

    #[tokio::test]
    async fn test_idle_timeout_ends_relay() {
        let options = RelayOptions {
            idle_timeout: Duration::from_millis(100),
            ..RelayOptions::default()
        };
        let (mut client, _upstream, handle) = spawn_relay(vec![], b"", options);

        let end = finished(handle).await;
        assert_eq!(end.reason, RelayEndReason::IdleTimeout);

        let mut rest = Vec::new();
        client.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
    }

    #[tokio::test]
    async fn test_activity_defers_idle_timeout() {
        let options = RelayOptions {
            idle_timeout: Duration::from_millis(200),
            ..RelayOptions::default()
        };
        let (mut client, mut upstream, handle) = spawn_relay(vec![], b"", options);

        for _ in 0..4 {
            tokio::time::sleep(Duration::from_millis(100)).await;
            client.write_all(b"x").await.unwrap();
            let mut buf = [0u8; 1];
            upstream.read_exact(&mut buf).await.unwrap();
        }
        assert!(!handle.is_finished());

        let end = finished(handle).await;
        assert_eq!(end.reason, RelayEndReason::IdleTimeout);
        assert_eq!(end.client_bytes, 4);
    }

    #[tokio::test]
    async fn test_half_close_keeps_other_direction_open() {
        let options = RelayOptions {
            close_policy: ClosePolicy::HalfClose,
            ..RelayOptions::default()
        };
        let (mut client, mut upstream, handle) = spawn_relay(vec![], b"", options);

        client.write_all(b"request").await.unwrap();
        client.shutdown().await.unwrap();

        let mut received = Vec::new();
        upstream.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, b"request");

        upstream.write_all(b"late reply").await.unwrap();
        let mut buf = [0u8; 10];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"late reply");

        drop(upstream);
        assert_eq!(finished(handle).await.reason, RelayEndReason::Closed);
    }

    #[tokio::test]
    async fn test_close_both_ends_on_first_eof() {
        let (mut client, mut upstream, handle) = spawn_relay(vec![], b"", RelayOptions::default());

        client.shutdown().await.unwrap();
        assert_eq!(finished(handle).await.reason, RelayEndReason::Closed);

        let mut rest = Vec::new();
        upstream.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
    }

    fn http_options() -> RelayOptions {
        RelayOptions {
            mode: RelayMode::Http(HttpRelay::plain("example.com", 80, None)),
            ..RelayOptions::default()
        }
    }

    fn blocking_filter() -> Box<dyn HttpProxyPlugin> {
        let rules = FilterRules::from_json(r#"[{"regex": "/blocked$", "status_code": 403}]"#).unwrap();
        Box::new(FilterByUrlRegexPlugin::new(Arc::new(rules)))
    }

    #[tokio::test]
    async fn test_http_mode_runs_request_hook_per_pipelined_request() {
        let (mut client, mut upstream, handle) =
            spawn_relay(vec![blocking_filter()], b"", http_options());

        client
            .write_all(
                b"GET http://example.com/ok HTTP/1.1\r\nHost: example.com\r\n\r\n\
                  GET http://example.com/blocked HTTP/1.1\r\nHost: example.com\r\n\r\n",
            )
            .await
            .unwrap();

        let expected = b"GET /ok HTTP/1.1\r\nHost: example.com\r\nVia: 1.1 interpose\r\nConnection: close\r\n\r\n";
        let mut forwarded = vec![0u8; expected.len()];
        upstream.read_exact(&mut forwarded).await.unwrap();
        assert_eq!(forwarded, expected);

        let end = finished(handle).await;
        assert!(matches!(&end.reason, RelayEndReason::Rejected(r) if r.status().as_u16() == 403));

        let mut response = Vec::new();
        client.read_to_end(&mut response).await.unwrap();
        assert_eq!(response, b"HTTP/1.1 403 Forbidden\r\nConnection: close\r\n\r\n");

        let mut rest = Vec::new();
        upstream.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
    }

    #[tokio::test]
    async fn test_http_mode_ends_on_authority_change() {
        let (mut client, mut upstream, handle) = spawn_relay(vec![], b"", http_options());

        client
            .write_all(b"GET http://other.example/ HTTP/1.1\r\nHost: other.example\r\n\r\n")
            .await
            .unwrap();

        assert_eq!(finished(handle).await.reason, RelayEndReason::Closed);
        let mut rest = Vec::new();
        upstream.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
    }

    #[tokio::test]
    async fn test_http_mode_relays_responses_verbatim() {
        let options = RelayOptions {
            mode: RelayMode::Http(HttpRelay::plain("example.com", 80, Some(Method::GET))),
            ..RelayOptions::default()
        };
        let (mut client, mut upstream, handle) = spawn_relay(vec![], b"", options);

        let response: &[u8] = b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n5\r\nhello\r\n0\r\n\r\n";
        upstream.write_all(response).await.unwrap();
        drop(upstream);

        let mut received = Vec::new();
        client.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, response);
        assert_eq!(finished(handle).await.upstream_bytes, response.len() as u64);
    }

    #[tokio::test]
    async fn test_malformed_pipelined_request_gets_400() {
        let (mut client, _upstream, handle) = spawn_relay(vec![], b"", http_options());

        client
            .write_all(b"GET / HTTP/1.1\r\nbad header line\r\n\r\n")
            .await
            .unwrap();

        let end = finished(handle).await;
        assert!(matches!(&end.reason, RelayEndReason::Rejected(r) if r.status().as_u16() == 400));
        let mut response = Vec::new();
        client.read_to_end(&mut response).await.unwrap();
        assert!(response.starts_with(b"HTTP/1.1 400 Bad Request\r\n"));
    }

    struct SlowRequests;

    #[async_trait]
    impl HttpProxyPlugin for SlowRequests {
        fn name(&self) -> &'static str {
            "slow_requests"
        }

        async fn handle_client_request(&self, request: HttpParser) -> RequestDecision {
            tokio::time::sleep(Duration::from_millis(1500)).await;
            RequestDecision::Forward(request)
        }
    }

    #[tokio::test]
    async fn test_pending_request_hook_does_not_stall_upstream() {
        let options = RelayOptions {
            mode: RelayMode::Http(HttpRelay::intercepted(443)),
            ..RelayOptions::default()
        };
        let (mut client, mut upstream, handle) =
            spawn_relay(vec![Box::new(SlowRequests)], b"", options);

        let request: &[u8] = b"GET /a HTTP/1.1\r\nHost: example.com\r\n\r\n";
        client.write_all(request).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        upstream.write_all(b"push").await.unwrap();

        let mut pushed = [0u8; 4];
        timeout(Duration::from_millis(500), client.read_exact(&mut pushed))
            .await
            .expect("upstream bytes waited for the request hook")
            .unwrap();
        assert_eq!(&pushed, b"push");

        let mut forwarded = vec![0u8; request.len()];
        timeout(Duration::from_secs(3), upstream.read_exact(&mut forwarded))
            .await
            .expect("request was not forwarded")
            .unwrap();
        assert_eq!(forwarded, request);

        drop(client);
        assert_eq!(finished(handle).await.reason, RelayEndReason::Closed);
    }

    #[tokio::test]
    async fn test_intercepted_requests_default_to_connect_port() {
        let rules = FilterRules::from_json(r#"[{"regex": "example\\.com:8443/x$", "status_code": 403}]"#).unwrap();
        let options = RelayOptions {
            mode: RelayMode::Http(HttpRelay::intercepted(8443)),
            ..RelayOptions::default()
        };
        let (mut client, _upstream, handle) = spawn_relay(
            vec![Box::new(FilterByUrlRegexPlugin::new(Arc::new(rules)))],
            b"",
            options,
        );

        client
            .write_all(b"GET /x HTTP/1.1\r\nHost: example.com\r\n\r\n")
            .await
            .unwrap();

        let end = finished(handle).await;
        assert!(matches!(&end.reason, RelayEndReason::Rejected(r) if r.status().as_u16() == 403));
    }

    #[tokio::test]
    async fn test_teardown_gives_up_on_client_that_stopped_reading() {
        let options = RelayOptions {
            mode: RelayMode::Http(HttpRelay::intercepted(443)),
            idle_timeout: Duration::from_millis(200),
            ..RelayOptions::default()
        };
        let (mut client, mut upstream, handle) =
            spawn_relay_with_client_buffer(16, vec![], b"", options);

        // Fill the client's receive buffer; the client never reads it.
        upstream.write_all(&[b'x'; 64]).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        client
            .write_all(b"GET / HTTP/1.1\r\nbad header line\r\n\r\n")
            .await
            .unwrap();

        let end = finished(handle).await;
        assert!(matches!(&end.reason, RelayEndReason::Rejected(r) if r.status().as_u16() == 400));
        drop(client);
    }

    #[test]
    fn test_close_policy_names() {
        assert_eq!(ClosePolicy::from_str("half_close"), Some(ClosePolicy::HalfClose));
        assert_eq!(ClosePolicy::from_str("Close-Both"), Some(ClosePolicy::CloseBoth));
        assert_eq!(ClosePolicy::from_str("sometimes"), None);
        assert_eq!(ClosePolicy::HalfClose.as_str(), "half_close");
        assert_eq!(ClosePolicy::default(), ClosePolicy::CloseBoth);
    }
}
