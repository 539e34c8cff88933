//! JSON-RPC message framing for the stdio transport.
//!
//! Two inbound framings are accepted on the same stream, discriminated per
//! message:
//!
//! - **Content-Length**: `Content-Length: N\r\n\r\n<N bytes>` (LSP-style; the
//!   header name is case-insensitive and bytes before it on the header line
//!   are tolerated)
//! - **Newline-delimited**: one JSON object per `\n`-terminated line
//!
//! Outbound messages are always written newline-delimited.
//!
//! Decoding is incremental: [`FrameDecoder`] accepts bytes in arbitrary
//! chunks and yields whole frames in arrival order. A frame is raw text; the
//! caller parses it as JSON and drops (with a diagnostic) anything that does
//! not parse, so a bad frame never poisons the stream.

use std::io;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

const MARKER: &[u8] = b"content-length:";

/// Incremental dual-framing decoder.
///
/// Feed bytes with [`FrameDecoder::push`], then drain complete frames with
/// [`FrameDecoder::next_frame`]. At end of stream, [`FrameDecoder::finish`]
/// flushes a trailing unterminated line, if any.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: Vec<u8>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk of raw bytes from the stream.
    pub fn push(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Pop the next complete frame, or `None` if more bytes are needed.
    ///
    /// Selection rule: a `Content-Length:` marker on the first buffered line
    /// switches that message to length-prefixed framing; otherwise the line
    /// itself is the frame. A marker preceded by a newline is left in place
    /// until the lines ahead of it have been consumed, so mixed framings
    /// decode in arrival order.
    pub fn next_frame(&mut self) -> Option<String> {
        loop {
            if self.buf.is_empty() {
                return None;
            }

            let nl = self.buf.iter().position(|&b| b == b'\n');
            let marker = find_marker(&self.buf);

            let header_first = match (marker, nl) {
                (Some(m), Some(n)) => m < n,
                (Some(_), None) => true,
                (None, _) => false,
            };

            if header_first {
                let m = marker.unwrap_or_default();
                // The header value runs to the end of its line.
                let Some(line_end) = nl else {
                    return None;
                };
                let value = &self.buf[m + MARKER.len()..line_end];
                let value = std::str::from_utf8(value).ok().map(str::trim);
                match value.and_then(|v| v.parse::<usize>().ok()) {
                    Some(len) => {
                        let Some(body_start) = find_header_end(&self.buf, m) else {
                            return None;
                        };
                        if self.buf.len() < body_start + len {
                            return None;
                        }
                        let body =
                            String::from_utf8_lossy(&self.buf[body_start..body_start + len])
                                .into_owned();
                        self.buf.drain(..body_start + len);
                        return Some(body);
                    }
                    None => {
                        // Malformed header: skip the header line and keep going.
                        tracing::warn!("skipping malformed Content-Length header");
                        self.buf.drain(..=line_end);
                        continue;
                    }
                }
            }

            // Newline-delimited: the line is the frame; empty lines are ignored.
            let Some(n) = nl else {
                return None;
            };
            let line = String::from_utf8_lossy(&self.buf[..n])
                .trim()
                .to_string();
            self.buf.drain(..=n);
            if line.is_empty() {
                continue;
            }
            return Some(line);
        }
    }

    /// Flush a trailing unterminated line at end of stream.
    pub fn finish(&mut self) -> Option<String> {
        if self.buf.is_empty() {
            return None;
        }
        let line = String::from_utf8_lossy(&self.buf).trim().to_string();
        self.buf.clear();
        if line.is_empty() { None } else { Some(line) }
    }
}

/// Case-insensitive search for the `Content-Length:` marker.
fn find_marker(buf: &[u8]) -> Option<usize> {
    buf.windows(MARKER.len())
        .position(|w| w.eq_ignore_ascii_case(MARKER))
}

/// Find the end of the header region (first blank line) starting at `from`.
///
/// Returns the index of the first body byte. Accepts both `\r\n\r\n` and bare
/// `\n\n` separators; intervening headers (e.g. `Content-Type`) are skipped.
fn find_header_end(buf: &[u8], from: usize) -> Option<usize> {
    let crlf = buf[from..]
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .map(|i| (from + i, from + i + 4));
    let lf = buf[from..]
        .windows(2)
        .position(|w| w == b"\n\n")
        .map(|i| (from + i, from + i + 2));
    match (crlf, lf) {
        (Some((a, ae)), Some((b, be))) => Some(if a < b { ae } else { be }),
        (Some((_, ae)), None) => Some(ae),
        (None, Some((_, be))) => Some(be),
        (None, None) => None,
    }
}

/// Reads whole JSON-RPC frames from an async byte stream.
pub struct MessageReader<R> {
    inner: R,
    decoder: FrameDecoder,
    eof: bool,
}

impl<R: AsyncRead + Unpin> MessageReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            decoder: FrameDecoder::new(),
            eof: false,
        }
    }

    /// Read the next frame, returning `None` once the stream is exhausted.
    ///
    /// # Errors
    ///
    /// Returns the underlying I/O error if reading fails.
    pub async fn next_message(&mut self) -> io::Result<Option<String>> {
        loop {
            if let Some(frame) = self.decoder.next_frame() {
                return Ok(Some(frame));
            }
            if self.eof {
                return Ok(self.decoder.finish());
            }
            let mut chunk = [0u8; 4096];
            let n = self.inner.read(&mut chunk).await?;
            if n == 0 {
                self.eof = true;
                continue;
            }
            self.decoder.push(&chunk[..n]);
        }
    }
}

/// Write one JSON message in newline-delimited format and flush.
///
/// The `json` string must not contain embedded newlines. Callers serialize
/// writes per stream (one writer task or a mutex), so frames never interleave.
///
/// # Errors
///
/// Returns an I/O error if writing or flushing fails.
pub async fn write_newline_delimited<W: AsyncWrite + Unpin>(
    writer: &mut W,
    json: &str,
) -> io::Result<()> {
    writer.write_all(json.as_bytes()).await?;
    writer.write_all(b"\n").await?;
    writer.flush().await?;
    Ok(())
}

/// Encode a JSON message in Content-Length framing.
pub fn encode_content_length(json: &str) -> Vec<u8> {
    let header = format!("Content-Length: {}\r\n\r\n", json.len());
    let mut buf = Vec::with_capacity(header.len() + json.len());
    buf.extend_from_slice(header.as_bytes());
    buf.extend_from_slice(json.as_bytes());
    buf
}
