//! # MJPEG Push Stream Parser
//!
//! Incremental parser for `multipart/x-mixed-replace` bodies. Chunks arrive
//! from the HTTP response stream in arbitrary sizes; every complete part is
//! returned as one frame.
//!
//! A part's `Content-Length` header is used when present. Parts without it
//! are delimited by scanning for the next boundary line.

use bytes::{Buf, Bytes, BytesMut};

use crate::error::{LinkError, LinkResult};

/// Largest part we are willing to buffer before giving up on the stream.
pub const MAX_PART_BYTES: usize = 16 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    /// Looking for the next `--boundary` line.
    SeekBoundary,
    /// Boundary consumed, reading part headers.
    Headers,
    /// Reading a part body, with a known length when the headers gave one.
    Body(Option<usize>),
    /// Closing delimiter seen; further input is ignored.
    Done,
}

/// Splits a `multipart/x-mixed-replace` byte stream into parts.
#[derive(Debug)]
pub struct MjpegParser {
    delimiter: Vec<u8>,
    buf: BytesMut,
    state: State,
}

impl MjpegParser {
    /// Create a parser for the given boundary (without the leading `--`).
    pub fn new(boundary: &str) -> Self {
        let boundary = boundary.trim_start_matches("--");
        let mut delimiter = Vec::with_capacity(boundary.len() + 2);
        delimiter.extend_from_slice(b"--");
        delimiter.extend_from_slice(boundary.as_bytes());
        Self {
            delimiter,
            buf: BytesMut::new(),
            state: State::SeekBoundary,
        }
    }

    /// Create a parser from a response `Content-Type` header value.
    ///
    /// # Errors
    /// Returns [`LinkError::ProtocolError`] if the content type is not
    /// multipart or carries no boundary parameter.
    pub fn from_content_type(content_type: &str) -> LinkResult<Self> {
        boundary_from_content_type(content_type)
            .map(|b| Self::new(&b))
            .ok_or_else(|| LinkError::ProtocolError {
                reason: format!("not a multipart stream: '{content_type}'"),
            })
    }

    /// Returns `true` once the closing delimiter has been consumed.
    pub fn is_finished(&self) -> bool {
        self.state == State::Done
    }

    /// Feed a chunk and collect every part it completes.
    ///
    /// # Errors
    /// Returns [`LinkError::ProtocolError`] if a single part grows past
    /// [`MAX_PART_BYTES`].
    pub fn push(&mut self, chunk: &[u8]) -> LinkResult<Vec<Bytes>> {
        if self.state == State::Done {
            return Ok(Vec::new());
        }
        self.buf.extend_from_slice(chunk);

        let mut frames = Vec::new();
        loop {
            match self.state {
                State::Done => break,
                State::SeekBoundary => {
                    if let Some(pos) = find(&self.buf, &self.delimiter) {
                        self.buf.advance(pos + self.delimiter.len());
                        self.state = State::Headers;
                    } else {
                        // Keep a tail that may hold a split delimiter.
                        let keep = self.delimiter.len().saturating_sub(1);
                        if self.buf.len() > keep {
                            let drop = self.buf.len() - keep;
                            self.buf.advance(drop);
                        }
                        break;
                    }
                }
                State::Headers => {
                    if self.buf.starts_with(b"--") {
                        self.state = State::Done;
                        self.buf.clear();
                        break;
                    }
                    let Some((end, terminator)) = find_header_end(&self.buf) else {
                        self.check_size()?;
                        break;
                    };
                    let length = content_length(&self.buf[..end]);
                    self.buf.advance(end + terminator);
                    self.state = State::Body(length);
                }
                State::Body(Some(len)) => {
                    if len > MAX_PART_BYTES {
                        return Err(oversized());
                    }
                    if self.buf.len() < len {
                        break;
                    }
                    let part = self.buf.split_to(len).freeze();
                    if !part.is_empty() {
                        frames.push(part);
                    }
                    self.state = State::SeekBoundary;
                }
                State::Body(None) => {
                    let Some(pos) = find(&self.buf, &self.delimiter) else {
                        self.check_size()?;
                        break;
                    };
                    let mut part = self.buf.split_to(pos).freeze();
                    part = trim_trailing_newline(part);
                    if !part.is_empty() {
                        frames.push(part);
                    }
                    self.state = State::SeekBoundary;
                }
            }
        }
        Ok(frames)
    }

    fn check_size(&self) -> LinkResult<()> {
        if self.buf.len() > MAX_PART_BYTES {
            Err(oversized())
        } else {
            Ok(())
        }
    }
}

fn oversized() -> LinkError {
    LinkError::ProtocolError {
        reason: format!("multipart part exceeds {MAX_PART_BYTES} bytes"),
    }
}

/// Extract the `boundary` parameter from a multipart content type.
pub fn boundary_from_content_type(content_type: &str) -> Option<String> {
    let mut params = content_type.split(';');
    let mime = params.next()?.trim();
    if !mime.to_ascii_lowercase().starts_with("multipart/") {
        return None;
    }
    params.find_map(|param| {
        let (key, value) = param.split_once('=')?;
        if key.trim().eq_ignore_ascii_case("boundary") {
            let value = value.trim().trim_matches('"');
            (!value.is_empty()).then(|| value.to_string())
        } else {
            None
        }
    })
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Position and length of the blank line ending a header block.
///
/// The block starts with the remainder of the boundary line, so a part with
/// no headers at all is just `\r\n\r\n`.
fn find_header_end(buf: &[u8]) -> Option<(usize, usize)> {
    let crlf = find(buf, b"\r\n\r\n").map(|p| (p, 4));
    let lf = find(buf, b"\n\n").map(|p| (p, 2));
    match (crlf, lf) {
        (Some(a), Some(b)) => Some(if a.0 <= b.0 { a } else { b }),
        (a, b) => a.or(b),
    }
}

fn content_length(headers: &[u8]) -> Option<usize> {
    let text = std::str::from_utf8(headers).ok()?;
    text.lines().find_map(|line| {
        let (name, value) = line.split_once(':')?;
        if name.trim().eq_ignore_ascii_case("content-length") {
            value.trim().parse().ok()
        } else {
            None
        }
    })
}

fn trim_trailing_newline(mut part: Bytes) -> Bytes {
    if part.ends_with(b"\r\n") {
        part.truncate(part.len() - 2);
    } else if part.ends_with(b"\n") {
        part.truncate(part.len() - 1);
    }
    part
}
