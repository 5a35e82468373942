//! Upstream transport
//!
//! Opens TCP connections to origin servers and prepares requests for the wire.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::{Buf, Bytes};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tracing::{debug, instrument};

use crate::error::{ProxyError, Result};
use crate::http::{HttpParser, DEFAULT_HTTP_PORT};

/// Value of the `Via` header added to forwarded requests
pub const VIA: &str = "1.1 interpose";

/// Headers that only apply to the client-proxy hop
const HOP_BY_HOP: &[&str] = &[
    "proxy-connection",
    "proxy-authorization",
    "connection",
    "keep-alive",
];

/// Direct TCP transport to origin servers
pub struct UpstreamTransport;

impl UpstreamTransport {
    /// Connect to `host:port`, giving up after `timeout`
    #[instrument(skip(timeout), fields(upstream = %format_authority(host, port)))]
    pub async fn connect(host: &str, port: u16, timeout: Duration) -> Result<TcpStream> {
        let target = format_authority(host, port);
        match tokio::time::timeout(timeout, TcpStream::connect((host, port))).await {
            Err(_) => Err(ProxyError::UpstreamTimeout(target)),
            Ok(Err(source)) => Err(ProxyError::UpstreamConnect { target, source }),
            Ok(Ok(stream)) => {
                if let Err(e) = stream.set_nodelay(true) {
                    debug!("Failed to set TCP_NODELAY: {}", e);
                }
                debug!("Connected to upstream");
                Ok(stream)
            }
        }
    }
}

/// `host:port`, bracketing IPv6 literals
pub fn format_authority(host: &str, port: u16) -> String {
    if host.contains(':') {
        format!("[{host}]:{port}")
    } else {
        format!("{host}:{port}")
    }
}

/// Rewrite a plain-HTTP proxy request for the origin server.
///
/// Drops proxy hop-by-hop headers (and any header the client's `Connection`
/// field names), fills in `Host` when missing, and asks the origin to close
/// after the response. `build()` then emits the origin-form path.
pub fn prepare_forward_request(request: &mut HttpParser) {
    let named: Vec<String> = request
        .headers()
        .get_all("connection")
        .flat_map(|value| {
            String::from_utf8_lossy(value)
                .split(',')
                .map(|token| token.trim().to_string())
                .filter(|token| !token.is_empty())
                .collect::<Vec<_>>()
        })
        .collect();

    let headers = request.headers_mut();
    for name in named.iter().map(String::as_str).chain(HOP_BY_HOP.iter().copied()) {
        headers.remove(name);
    }

    if !request.headers().contains("host") {
        if let (Some(host), Some(port)) = (request.host(), request.port()) {
            let value = if port != DEFAULT_HTTP_PORT {
                format_authority(host, port)
            } else if host.contains(':') {
                format!("[{host}]")
            } else {
                host.to_string()
            };
            request.headers_mut().insert("Host", value);
        }
    }

    let headers = request.headers_mut();
    headers.append("Via", VIA);
    headers.insert("Connection", "close");
}

/// Replays `prefix` before reading from the wrapped stream.
///
/// Used when bytes were read past a request head (a TLS ClientHello sent right
/// after CONNECT, for instance) and must reach the next consumer.
#[derive(Debug)]
pub struct Rewind<S> {
    prefix: Bytes,
    inner: S,
}

impl<S> Rewind<S> {
    pub fn new(inner: S, prefix: Bytes) -> Self {
        Self { prefix, inner }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for Rewind<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if !self.prefix.is_empty() {
            let n = self.prefix.len().min(buf.remaining());
            buf.put_slice(&self.prefix[..n]);
            self.prefix.advance(n);
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for Rewind<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::ParserLimits;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn parse(raw: &[u8]) -> HttpParser {
        let mut parser = HttpParser::request(ParserLimits::default());
        parser.feed(raw).unwrap();
        parser
    }

    #[test]
    fn test_prepare_forward_request_rewrites_headers() {
        let mut request = parse(
            b"GET http://example.com/a?b=1 HTTP/1.1\r\n\
              Host: example.com\r\n\
              Proxy-Connection: keep-alive\r\n\
              Proxy-Authorization: Basic dXNlcjpwYXNz\r\n\
              Connection: keep-alive, X-Trace\r\n\
              Keep-Alive: timeout=5\r\n\
              X-Trace: 1\r\n\
              Accept: */*\r\n\r\n",
        );
        prepare_forward_request(&mut request);

        assert_eq!(
            request.build(),
            b"GET /a?b=1 HTTP/1.1\r\n\
              Host: example.com\r\n\
              Accept: */*\r\n\
              Via: 1.1 interpose\r\n\
              Connection: close\r\n\r\n"
                .to_vec()
        );
    }

    #[test]
    fn test_prepare_forward_request_adds_host() {
        let mut request = parse(b"GET http://example.com:8080/ HTTP/1.1\r\n\r\n");
        prepare_forward_request(&mut request);
        assert_eq!(request.headers().get_str("host"), Some("example.com:8080"));

        let mut request = parse(b"GET http://example.com/ HTTP/1.1\r\n\r\n");
        prepare_forward_request(&mut request);
        assert_eq!(request.headers().get_str("host"), Some("example.com"));
    }

    #[test]
    fn test_format_authority_brackets_ipv6() {
        assert_eq!(format_authority("example.com", 443), "example.com:443");
        assert_eq!(format_authority("::1", 8080), "[::1]:8080");
    }

    #[tokio::test]
    async fn test_rewind_replays_prefix() {
        let (client, mut server) = tokio::io::duplex(64);
        server.write_all(b" world").await.unwrap();
        drop(server);

        let mut stream = Rewind::new(client, Bytes::from_static(b"hello"));
        let mut out = String::new();
        stream.read_to_string(&mut out).await.unwrap();
        assert_eq!(out, "hello world");
    }

    #[tokio::test]
    async fn test_rewind_respects_small_buffers() {
        let (client, _server) = tokio::io::duplex(64);
        let mut stream = Rewind::new(client, Bytes::from_static(b"abcdef"));
        let mut buf = [0u8; 4];
        let n = stream.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"abcd");
        let n = stream.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"ef");
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let err = UpstreamTransport::connect("127.0.0.1", port, Duration::from_secs(2))
            .await
            .unwrap_err();
        assert!(matches!(err, ProxyError::UpstreamConnect { .. }));
        assert_eq!(err.status_code(), http::StatusCode::BAD_GATEWAY);
    }

    #[tokio::test]
    async fn test_connect_succeeds() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let stream = UpstreamTransport::connect("127.0.0.1", port, Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(stream.peer_addr().unwrap().port(), port);
    }
}
