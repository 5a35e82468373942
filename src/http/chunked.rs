//! Chunked transfer-coding
//!
//! `ChunkParser` decodes `size CRLF data CRLF ... 0 CRLF trailers CRLF` incrementally,
//! so a chunk stream may arrive split at any byte boundary.

use bytes::{Buf, BytesMut};

use super::find_crlf;
use super::parser::ParseError;

/// Longest chunk-size line (including extensions) or trailer line accepted.
const MAX_CHUNK_LINE: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChunkState {
    Size,
    Data { remaining: usize },
    DataEnd,
    Trailer,
    Done,
}

/// Incremental decoder for a chunked message body
#[derive(Debug, Clone)]
pub struct ChunkParser {
    state: ChunkState,
}

impl ChunkParser {
    pub fn new() -> Self {
        Self {
            state: ChunkState::Size,
        }
    }

    /// Consume as much of `input` as possible, appending decoded data to `body`.
    ///
    /// Returns `Ok(true)` once the body is complete. Bytes after the final CRLF
    /// are left in `input`.
    pub fn decode(&mut self, input: &mut BytesMut, body: &mut BytesMut) -> Result<bool, ParseError> {
        loop {
            match self.state {
                ChunkState::Size => {
                    let Some(pos) = find_crlf(input) else {
                        return Self::need_line(input);
                    };
                    let line = input.split_to(pos + 2);
                    let size = parse_chunk_size(&line[..pos])?;
                    self.state = if size == 0 {
                        ChunkState::Trailer
                    } else {
                        ChunkState::Data { remaining: size }
                    };
                }
                ChunkState::Data { remaining } => {
                    if input.is_empty() {
                        return Ok(false);
                    }
                    let take = remaining.min(input.len());
                    body.extend_from_slice(&input.split_to(take));
                    let remaining = remaining - take;
                    self.state = if remaining == 0 {
                        ChunkState::DataEnd
                    } else {
                        ChunkState::Data { remaining }
                    };
                }
                ChunkState::DataEnd => {
                    if input.len() < 2 {
                        return Ok(false);
                    }
                    if &input[..2] != b"\r\n" {
                        return Err(ParseError::InvalidChunkTerminator);
                    }
                    input.advance(2);
                    self.state = ChunkState::Size;
                }
                ChunkState::Trailer => {
                    let Some(pos) = find_crlf(input) else {
                        return Self::need_line(input);
                    };
                    input.advance(pos + 2);
                    // An empty line ends the trailer section; trailer fields are dropped.
                    if pos == 0 {
                        self.state = ChunkState::Done;
                    }
                }
                ChunkState::Done => return Ok(true),
            }
        }
    }

    fn need_line(input: &BytesMut) -> Result<bool, ParseError> {
        if input.len() > MAX_CHUNK_LINE {
            return Err(ParseError::InvalidChunkSize(
                "chunk line exceeds limit".to_string(),
            ));
        }
        Ok(false)
    }
}

impl Default for ChunkParser {
    fn default() -> Self {
        Self::new()
    }
}

fn parse_chunk_size(line: &[u8]) -> Result<usize, ParseError> {
    let invalid = || ParseError::InvalidChunkSize(String::from_utf8_lossy(line).into_owned());

    let text = std::str::from_utf8(line).map_err(|_| invalid())?;
    // Chunk extensions (";name=value") are ignored.
    let digits = text.split(';').next().unwrap_or_default().trim();
    if digits.is_empty() || digits.len() > 15 || !digits.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(invalid());
    }
    usize::from_str_radix(digits, 16).map_err(|_| invalid())
}

/// Encode `body` as a single data chunk followed by the terminal chunk
pub fn encode(body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(body.len() + 16);
    if !body.is_empty() {
        out.extend_from_slice(format!("{:x}\r\n", body.len()).as_bytes());
        out.extend_from_slice(body);
        out.extend_from_slice(b"\r\n");
    }
    out.extend_from_slice(b"0\r\n\r\n");
    out
}
