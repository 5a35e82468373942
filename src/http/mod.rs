//! HTTP/1.x message handling
//!
//! This module provides the wire-level pieces the proxy needs:
//! - Incremental request/response parsing tolerant of partial reads
//! - Chunked transfer-coding decode/encode
//! - Synthesized rejection and error responses

pub mod chunked;
pub mod parser;
pub mod response;

pub use chunked::ChunkParser;
pub use parser::{
    parse_authority, Headers, HttpParser, ParseError, ParseResult, ParseStatus, ParserLimits,
    ParserState, ParserType, DEFAULT_HTTPS_PORT, DEFAULT_HTTP_PORT,
};
pub use response::{Rejection, CONNECTION_ESTABLISHED};

/// Position of the first CRLF in `buf`, if any.
pub(crate) fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|window| window == b"\r\n")
}
