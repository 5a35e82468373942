//! Incremental HTTP/1.x message parser
//!
//! `HttpParser` accepts bytes as they arrive from a socket and advances through
//! `Initialized -> LineRcvd -> HeadersComplete -> RcvingBody -> Complete`. A
//! message may be split across any number of `feed` calls; the parsed result does
//! not depend on where the splits fall.

use bytes::{Bytes, BytesMut};
use http::Method;
use thiserror::Error;
use url::Url;

use super::chunked::{self, ChunkParser};
use super::find_crlf;

pub const DEFAULT_HTTP_PORT: u16 = 80;
pub const DEFAULT_HTTPS_PORT: u16 = 443;
pub const DEFAULT_MAX_HEADER_BYTES: usize = 64 * 1024;
pub const DEFAULT_MAX_HEADERS: usize = 100;
pub const DEFAULT_MAX_BODY_BYTES: usize = 10 * 1024 * 1024;

/// Reasons a byte stream is not a valid HTTP/1.x message
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("invalid start line: {0}")]
    InvalidStartLine(String),

    #[error("unsupported HTTP version: {0}")]
    InvalidVersion(String),

    #[error("invalid request target: {0}")]
    InvalidTarget(String),

    #[error("invalid header line: {0}")]
    InvalidHeader(String),

    #[error("header section exceeds {limit} bytes")]
    HeadersTooLarge { limit: usize },

    #[error("more than {limit} header fields")]
    TooManyHeaders { limit: usize },

    #[error("body exceeds {limit} bytes")]
    BodyTooLarge { limit: usize },

    #[error("invalid Content-Length: {0}")]
    InvalidContentLength(String),

    #[error("invalid chunk size: {0}")]
    InvalidChunkSize(String),

    #[error("chunk data not terminated by CRLF")]
    InvalidChunkTerminator,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParserType {
    Request,
    Response,
}

/// Parse progress. Ordering follows the lifecycle so `state >= HeadersComplete`
/// reads naturally.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ParserState {
    Initialized,
    LineRcvd,
    HeadersComplete,
    RcvingBody,
    Complete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseStatus {
    NeedMore,
    Complete,
}

pub type ParseResult = Result<ParseStatus, ParseError>;

/// Size limits applied to the start line and header section
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParserLimits {
    /// Maximum bytes of start line plus headers, including CRLFs
    pub max_header_bytes: usize,
    /// Maximum number of header fields
    pub max_headers: usize,
    /// Maximum kept body size. Not applied to parsers that discard bodies.
    pub max_body_bytes: usize,
}

impl Default for ParserLimits {
    fn default() -> Self {
        Self {
            max_header_bytes: DEFAULT_MAX_HEADER_BYTES,
            max_headers: DEFAULT_MAX_HEADERS,
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
        }
    }
}

/// Ordered header fields with case-insensitive lookup.
///
/// Names keep their original case for re-serialization. Repeated fields are kept
/// as separate entries.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers {
    entries: Vec<(String, Bytes)>,
}

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// First value for `name`
    pub fn get(&self, name: &str) -> Option<&[u8]> {
        self.entries
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_ref())
    }

    /// All values for `name`, in message order
    pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a [u8]> + 'a {
        self.entries
            .iter()
            .filter(move |(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_ref())
    }

    /// First value for `name` if it is valid UTF-8
    pub fn get_str(&self, name: &str) -> Option<&str> {
        self.get(name).and_then(|v| std::str::from_utf8(v).ok())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Whether any `name` field lists `token` in its comma-separated value
    pub fn has_token(&self, name: &str, token: &str) -> bool {
        self.get_all(name).any(|value| {
            String::from_utf8_lossy(value)
                .split(',')
                .any(|item| item.trim().eq_ignore_ascii_case(token))
        })
    }

    /// Set `name` to a single value. The first existing field keeps its position,
    /// any further duplicates are removed.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<Bytes>) {
        let name = name.into();
        let value = value.into();
        match self
            .entries
            .iter()
            .position(|(n, _)| n.eq_ignore_ascii_case(&name))
        {
            Some(index) => {
                self.entries[index].1 = value;
                let mut seen = 0usize;
                self.entries.retain(|(n, _)| {
                    if n.eq_ignore_ascii_case(&name) {
                        seen += 1;
                        seen == 1
                    } else {
                        true
                    }
                });
            }
            None => self.entries.push((name, value)),
        }
    }

    pub fn append(&mut self, name: impl Into<String>, value: impl Into<Bytes>) {
        self.entries.push((name.into(), value.into()));
    }

    /// Remove every `name` field, returning the first value
    pub fn remove(&mut self, name: &str) -> Option<Bytes> {
        let mut removed = None;
        self.entries.retain(|(n, v)| {
            if n.eq_ignore_ascii_case(name) {
                if removed.is_none() {
                    removed = Some(v.clone());
                }
                false
            } else {
                true
            }
        });
        removed
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[u8])> {
        self.entries.iter().map(|(n, v)| (n.as_str(), v.as_ref()))
    }
}

#[derive(Debug, Clone)]
enum BodyFraming {
    None,
    Length(usize),
    Chunked(ChunkParser),
    UntilClose,
}

/// Incremental request or response parser
#[derive(Debug, Clone)]
pub struct HttpParser {
    parser_type: ParserType,
    state: ParserState,
    limits: ParserLimits,
    default_port: u16,
    buffer: BytesMut,
    head_bytes: usize,
    error: Option<ParseError>,

    method: Option<Method>,
    target: Option<String>,
    host: Option<String>,
    port: Option<u16>,
    path: Option<String>,
    version: Option<String>,
    status_code: Option<u16>,
    reason: Option<String>,
    headers: Headers,
    body: BytesMut,
    chunked: bool,
    framing: BodyFraming,
    request_method: Option<Method>,
    store_body: bool,
}

impl HttpParser {
    pub fn new(parser_type: ParserType, limits: ParserLimits) -> Self {
        Self {
            parser_type,
            state: ParserState::Initialized,
            limits,
            default_port: DEFAULT_HTTP_PORT,
            buffer: BytesMut::new(),
            head_bytes: 0,
            error: None,
            method: None,
            target: None,
            host: None,
            port: None,
            path: None,
            version: None,
            status_code: None,
            reason: None,
            headers: Headers::new(),
            body: BytesMut::new(),
            chunked: false,
            framing: BodyFraming::None,
            request_method: None,
            store_body: true,
        }
    }

    pub fn request(limits: ParserLimits) -> Self {
        Self::new(ParserType::Request, limits)
    }

    pub fn response(limits: ParserLimits) -> Self {
        Self::new(ParserType::Response, limits)
    }

    /// Port assumed for origin-form requests whose `Host` header has none
    pub fn with_default_port(mut self, port: u16) -> Self {
        self.default_port = port;
        self
    }

    /// Track body framing without keeping body bytes
    pub fn discard_body(mut self) -> Self {
        self.store_body = false;
        self
    }

    /// Method of the request this response answers; decides whether a body follows
    pub fn expect_response_to(&mut self, method: Method) {
        self.request_method = Some(method);
    }

    /// Append `data` and advance as far as the buffered bytes allow.
    ///
    /// Bytes past the end of a complete message stay buffered for the next one.
    pub fn feed(&mut self, data: &[u8]) -> ParseResult {
        if let Some(err) = &self.error {
            return Err(err.clone());
        }
        self.buffer.extend_from_slice(data);
        match self.process() {
            Ok(status) => Ok(status),
            Err(err) => {
                self.error = Some(err.clone());
                Err(err)
            }
        }
    }

    /// Signal that the peer closed. Completes a read-until-close body.
    pub fn finish(&mut self) -> ParseResult {
        if let Some(err) = &self.error {
            return Err(err.clone());
        }
        if self.state == ParserState::RcvingBody && matches!(self.framing, BodyFraming::UntilClose) {
            let rest = self.buffer.split();
            if self.store_body {
                self.body.extend_from_slice(&rest);
                if let Err(err) = self.check_body_size(self.body.len()) {
                    self.error = Some(err.clone());
                    return Err(err);
                }
            }
            self.state = ParserState::Complete;
        }
        Ok(self.status())
    }

    fn status(&self) -> ParseStatus {
        if self.state == ParserState::Complete {
            ParseStatus::Complete
        } else {
            ParseStatus::NeedMore
        }
    }

    fn process(&mut self) -> ParseResult {
        loop {
            match self.state {
                ParserState::Initialized => {
                    let Some(line) = self.next_head_line()? else {
                        return Ok(ParseStatus::NeedMore);
                    };
                    if line.is_empty() {
                        continue;
                    }
                    self.parse_start_line(&line)?;
                    self.state = ParserState::LineRcvd;
                }
                ParserState::LineRcvd => {
                    let Some(line) = self.next_head_line()? else {
                        return Ok(ParseStatus::NeedMore);
                    };
                    if line.is_empty() {
                        self.on_headers_complete()?;
                        self.state = ParserState::HeadersComplete;
                    } else {
                        self.parse_header_line(&line)?;
                    }
                }
                ParserState::HeadersComplete => {
                    self.state = match self.framing {
                        BodyFraming::None => ParserState::Complete,
                        _ => ParserState::RcvingBody,
                    };
                }
                ParserState::RcvingBody => {
                    if !self.read_body()? {
                        return Ok(ParseStatus::NeedMore);
                    }
                    self.state = ParserState::Complete;
                }
                ParserState::Complete => return Ok(ParseStatus::Complete),
            }
        }
    }

    /// Pop the next CRLF-terminated line of the head, without its CRLF
    fn next_head_line(&mut self) -> Result<Option<BytesMut>, ParseError> {
        let limit = self.limits.max_header_bytes;
        match find_crlf(&self.buffer) {
            Some(pos) => {
                self.head_bytes += pos + 2;
                if self.head_bytes > limit {
                    return Err(ParseError::HeadersTooLarge { limit });
                }
                let mut line = self.buffer.split_to(pos + 2);
                line.truncate(pos);
                Ok(Some(line))
            }
            None if self.head_bytes + self.buffer.len() > limit => {
                Err(ParseError::HeadersTooLarge { limit })
            }
            None => Ok(None),
        }
    }

    fn parse_start_line(&mut self, line: &[u8]) -> Result<(), ParseError> {
        let text = std::str::from_utf8(line)
            .map_err(|_| ParseError::InvalidStartLine(String::from_utf8_lossy(line).into_owned()))?;
        let invalid = || ParseError::InvalidStartLine(text.to_string());

        match self.parser_type {
            ParserType::Request => {
                let mut parts = text.split(' ');
                let (Some(method), Some(target), Some(version), None) =
                    (parts.next(), parts.next(), parts.next(), parts.next())
                else {
                    return Err(invalid());
                };
                if method.is_empty() || target.is_empty() {
                    return Err(invalid());
                }
                let method = Method::from_bytes(method.as_bytes()).map_err(|_| invalid())?;
                self.version = Some(parse_version(version)?);
                self.set_target(method == Method::CONNECT, target)?;
                self.method = Some(method);
            }
            ParserType::Response => {
                let mut parts = text.splitn(3, ' ');
                let version = parts.next().unwrap_or_default();
                let code = parts.next().ok_or_else(invalid)?;
                let reason = parts.next().unwrap_or_default();
                self.version = Some(parse_version(version)?);
                if code.len() != 3 || !code.bytes().all(|b| b.is_ascii_digit()) {
                    return Err(invalid());
                }
                self.status_code = Some(code.parse().map_err(|_| invalid())?);
                self.reason = Some(reason.to_string());
            }
        }
        Ok(())
    }

    fn set_target(&mut self, is_connect: bool, target: &str) -> Result<(), ParseError> {
        let invalid = || ParseError::InvalidTarget(target.to_string());

        if is_connect {
            let (host, port) = parse_authority(target, DEFAULT_HTTPS_PORT).ok_or_else(invalid)?;
            self.host = Some(host);
            self.port = Some(port);
            self.path = Some(target.to_string());
        } else if target.starts_with('/') || target == "*" {
            self.path = Some(target.to_string());
        } else if let Some(scheme_end) = target.find("://") {
            let scheme = &target[..scheme_end];
            if !scheme.eq_ignore_ascii_case("http") && !scheme.eq_ignore_ascii_case("https") {
                return Err(invalid());
            }
            let url = Url::parse(target).map_err(|_| invalid())?;
            let host = url
                .host_str()
                .filter(|h| !h.is_empty())
                .ok_or_else(invalid)?;
            let host = host.trim_start_matches('[').trim_end_matches(']');
            let port = url.port_or_known_default().ok_or_else(invalid)?;

            // Path and query are taken from the raw target so they are forwarded
            // byte-for-byte rather than in normalized form.
            let rest = &target[scheme_end + 3..];
            let path = match rest.find(['/', '?']) {
                Some(index) if rest[index..].starts_with('?') => format!("/{}", &rest[index..]),
                Some(index) => rest[index..].to_string(),
                None => "/".to_string(),
            };
            let path = match path.find('#') {
                Some(index) => path[..index].to_string(),
                None => path,
            };

            self.host = Some(host.to_string());
            self.port = Some(port);
            self.path = Some(path);
        } else {
            return Err(invalid());
        }
        self.target = Some(target.to_string());
        Ok(())
    }

    fn parse_header_line(&mut self, line: &[u8]) -> Result<(), ParseError> {
        let invalid = || ParseError::InvalidHeader(String::from_utf8_lossy(line).into_owned());

        if self.headers.len() >= self.limits.max_headers {
            return Err(ParseError::TooManyHeaders {
                limit: self.limits.max_headers,
            });
        }
        // Obsolete line folding is rejected outright.
        if matches!(line.first(), Some(b' ' | b'\t')) {
            return Err(invalid());
        }
        let colon = line.iter().position(|&b| b == b':').ok_or_else(invalid)?;
        let name = &line[..colon];
        if name.is_empty() || !name.iter().copied().all(is_token_byte) {
            return Err(invalid());
        }
        let name = std::str::from_utf8(name).map_err(|_| invalid())?;
        let value = trim_ows(&line[colon + 1..]);
        self.headers
            .append(name.to_string(), Bytes::copy_from_slice(value));
        Ok(())
    }

    fn on_headers_complete(&mut self) -> Result<(), ParseError> {
        match self.parser_type {
            ParserType::Request => {
                if self.host.is_none() {
                    if let Some((host, port)) = self
                        .headers
                        .get_str("host")
                        .and_then(|value| parse_authority(value, self.default_port))
                    {
                        self.host = Some(host);
                        self.port = Some(port);
                    }
                }
                self.framing = if self.is_connect() {
                    BodyFraming::None
                } else {
                    self.framing_from_headers()?.unwrap_or(BodyFraming::None)
                };
            }
            ParserType::Response => {
                let code = self.status_code.unwrap_or_default();
                let bodyless = (100..200).contains(&code)
                    || code == 204
                    || code == 304
                    || self.request_method == Some(Method::HEAD)
                    || (self.request_method == Some(Method::CONNECT) && (200..300).contains(&code));
                self.framing = if bodyless {
                    BodyFraming::None
                } else {
                    self.framing_from_headers()?
                        .unwrap_or(BodyFraming::UntilClose)
                };
            }
        }
        Ok(())
    }

    /// Framing declared by the headers. Content-Length takes precedence over
    /// `Transfer-Encoding: chunked`.
    fn framing_from_headers(&mut self) -> Result<Option<BodyFraming>, ParseError> {
        let mut length: Option<usize> = None;
        for value in self.headers.get_all("content-length") {
            let text = String::from_utf8_lossy(value);
            let text = text.trim();
            if text.is_empty() || !text.bytes().all(|b| b.is_ascii_digit()) {
                return Err(ParseError::InvalidContentLength(text.to_string()));
            }
            let parsed: usize = text
                .parse()
                .map_err(|_| ParseError::InvalidContentLength(text.to_string()))?;
            match length {
                Some(existing) if existing != parsed => {
                    return Err(ParseError::InvalidContentLength(text.to_string()));
                }
                _ => length = Some(parsed),
            }
        }

        if let Some(length) = length {
            self.check_body_size(length)?;
            return Ok(Some(if length == 0 {
                BodyFraming::None
            } else {
                BodyFraming::Length(length)
            }));
        }
        if self.headers.has_token("transfer-encoding", "chunked") {
            self.chunked = true;
            return Ok(Some(BodyFraming::Chunked(ChunkParser::new())));
        }
        Ok(None)
    }

    /// Move buffered body bytes into `body`; true once the body is complete
    fn read_body(&mut self) -> Result<bool, ParseError> {
        let done = self.fill_body()?;
        if !self.store_body {
            self.body.clear();
        }
        self.check_body_size(self.body.len())?;
        Ok(done)
    }

    fn check_body_size(&self, len: usize) -> Result<(), ParseError> {
        let limit = self.limits.max_body_bytes;
        if self.store_body && len > limit {
            return Err(ParseError::BodyTooLarge { limit });
        }
        Ok(())
    }

    fn fill_body(&mut self) -> Result<bool, ParseError> {
        match &mut self.framing {
            BodyFraming::None => Ok(true),
            BodyFraming::Length(remaining) => {
                let take = (*remaining).min(self.buffer.len());
                self.body.extend_from_slice(&self.buffer.split_to(take));
                *remaining -= take;
                Ok(*remaining == 0)
            }
            BodyFraming::Chunked(decoder) => decoder.decode(&mut self.buffer, &mut self.body),
            BodyFraming::UntilClose => {
                self.body.extend_from_slice(&self.buffer.split());
                Ok(false)
            }
        }
    }

    /// Take the parsed message, leaving a fresh parser that keeps the unconsumed bytes
    pub fn take_message(&mut self) -> HttpParser {
        let mut fresh = HttpParser::new(self.parser_type, self.limits).with_default_port(self.default_port);
        fresh.store_body = self.store_body;
        fresh.buffer = self.buffer.split();
        std::mem::replace(self, fresh)
    }

    /// Discard the current message, keeping unconsumed bytes
    pub fn reset(&mut self) {
        let _ = self.take_message();
    }

    /// Re-serialize the message for the wire
    pub fn build(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(256 + self.body.len());
        let version = self.version.as_deref().unwrap_or("HTTP/1.1");
        match self.parser_type {
            ParserType::Request => {
                let method = self.method.as_ref().map(Method::as_str).unwrap_or("GET");
                let path = self.path.as_deref().unwrap_or("/");
                out.extend_from_slice(format!("{method} {path} {version}").as_bytes());
            }
            ParserType::Response => {
                let code = self.status_code.unwrap_or(200);
                let reason = self.reason.as_deref().unwrap_or_default();
                out.extend_from_slice(format!("{version} {code} {reason}").as_bytes());
            }
        }
        out.extend_from_slice(b"\r\n");
        for (name, value) in self.headers.iter() {
            out.extend_from_slice(name.as_bytes());
            out.extend_from_slice(b": ");
            out.extend_from_slice(value);
            out.extend_from_slice(b"\r\n");
        }
        out.extend_from_slice(b"\r\n");
        if self.chunked {
            out.extend_from_slice(&chunked::encode(&self.body));
        } else {
            out.extend_from_slice(&self.body);
        }
        out
    }

    /// URL used for matching: `http://host:port/path`
    pub fn url(&self) -> String {
        let host = self.host.as_deref().unwrap_or_default();
        let host = if host.contains(':') {
            format!("[{host}]")
        } else {
            host.to_string()
        };
        let port = self.port.unwrap_or(self.default_port);
        let path = if self.is_connect() {
            ""
        } else {
            self.path.as_deref().unwrap_or("/")
        };
        format!("http://{host}:{port}{path}")
    }

    pub fn parser_type(&self) -> ParserType {
        self.parser_type
    }

    pub fn state(&self) -> ParserState {
        self.state
    }

    pub fn method(&self) -> Option<&Method> {
        self.method.as_ref()
    }

    pub fn is_connect(&self) -> bool {
        self.method.as_ref() == Some(&Method::CONNECT)
    }

    /// Raw request target as received
    pub fn target(&self) -> Option<&str> {
        self.target.as_deref()
    }

    pub fn host(&self) -> Option<&str> {
        self.host.as_deref()
    }

    pub fn port(&self) -> Option<u16> {
        self.port
    }

    /// Origin-form path (authority for CONNECT)
    pub fn path(&self) -> Option<&str> {
        self.path.as_deref()
    }

    pub fn version(&self) -> Option<&str> {
        self.version.as_deref()
    }

    pub fn status_code(&self) -> Option<u16> {
        self.status_code
    }

    pub fn reason(&self) -> Option<&str> {
        self.reason.as_deref()
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn headers_mut(&mut self) -> &mut Headers {
        &mut self.headers
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub fn is_chunked(&self) -> bool {
        self.chunked
    }

    /// Bytes received past the end of the current message
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Drain bytes buffered past the current message
    pub fn take_buffered(&mut self) -> Bytes {
        self.buffer.split().freeze()
    }

    pub fn set_method(&mut self, method: Method) {
        self.method = Some(method);
    }

    pub fn set_path(&mut self, path: impl Into<String>) {
        self.path = Some(path.into());
    }

    pub fn set_host(&mut self, host: impl Into<String>, port: u16) {
        self.host = Some(host.into());
        self.port = Some(port);
    }

    /// Replace the body. A Content-Length header, when present or when the
    /// message is not chunked and the body is non-empty, is set to the new length.
    pub fn set_body(&mut self, body: impl AsRef<[u8]>) {
        let body = body.as_ref();
        self.body = BytesMut::from(body);
        if !self.chunked && (self.headers.contains("content-length") || !body.is_empty()) {
            self.headers
                .insert("Content-Length", body.len().to_string());
        }
    }
}

fn parse_version(version: &str) -> Result<String, ParseError> {
    match version {
        "HTTP/1.0" | "HTTP/1.1" => Ok(version.to_string()),
        other => Err(ParseError::InvalidVersion(other.to_string())),
    }
}

fn is_token_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b"!#$%&'*+-.^_`|~".contains(&b)
}

fn trim_ows(value: &[u8]) -> &[u8] {
    let start = value
        .iter()
        .position(|&b| b != b' ' && b != b'\t')
        .unwrap_or(value.len());
    let end = value
        .iter()
        .rposition(|&b| b != b' ' && b != b'\t')
        .map_or(start, |i| i + 1);
    &value[start..end]
}

/// Split `host[:port]` or `[v6][:port]` into host and port
pub fn parse_authority(authority: &str, default_port: u16) -> Option<(String, u16)> {
    let authority = authority.trim();
    if authority.is_empty() {
        return None;
    }

    let (host, port) = if let Some(rest) = authority.strip_prefix('[') {
        let (host, after) = rest.split_once(']')?;
        let port = match after {
            "" => default_port,
            p => p.strip_prefix(':')?.parse().ok()?,
        };
        (host, port)
    } else {
        match authority.rsplit_once(':') {
            Some((host, _)) if host.contains(':') => return None,
            Some((host, port)) => (host, port.parse().ok()?),
            None => (authority, default_port),
        }
    };

    if host.is_empty() || host.contains(|c: char| c.is_whitespace() || c == '/' || c == '@') {
        return None;
    }
    Some((host.to_string(), port))
}
