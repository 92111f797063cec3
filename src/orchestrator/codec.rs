//! Line codec for stage process output.
//!
//! Child output is arbitrary bytes: daemons print Latin-1 text, progress
//! bars without newlines, or binary garbage. [`OutputLineCodec`] frames it
//! on `\n` for [`tokio_util::codec::FramedRead`] without ever failing on
//! content. Invalid UTF-8 is decoded lossily and lines longer than the
//! limit are cut, with the remainder discarded up to the next newline, so
//! the pipe keeps draining and the buffer stays bounded.

use std::io;

use bytes::{Buf, BytesMut};
use tokio_util::codec::Decoder;

/// Maximum bytes kept from a single output line: 64 KiB.
pub const MAX_OUTPUT_LINE_BYTES: usize = 65_536;

/// One decoded line of child output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputLine {
    /// Line text without the trailing `\n` / `\r\n`.
    pub text: String,
    /// The line exceeded the limit and only its head is kept.
    pub truncated: bool,
}

impl OutputLine {
    fn from_bytes(raw: &[u8], truncated: bool) -> Self {
        let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
        Self {
            text: String::from_utf8_lossy(raw).into_owned(),
            truncated,
        }
    }
}

/// Newline framing that tolerates any byte sequence.
#[derive(Debug)]
pub struct OutputLineCodec {
    max_length: usize,
    /// Bytes already scanned for a newline.
    next_index: usize,
    /// Dropping the tail of an over-long line.
    discarding: bool,
}

impl OutputLineCodec {
    /// Codec with the default [`MAX_OUTPUT_LINE_BYTES`] limit.
    #[must_use]
    pub fn new() -> Self {
        Self::with_max_length(MAX_OUTPUT_LINE_BYTES)
    }

    /// Codec keeping at most `max_length` bytes per line.
    #[must_use]
    pub fn with_max_length(max_length: usize) -> Self {
        Self {
            max_length: max_length.max(1),
            next_index: 0,
            discarding: false,
        }
    }

    /// Configured line limit.
    #[must_use]
    pub fn max_length(&self) -> usize {
        self.max_length
    }
}

impl Default for OutputLineCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for OutputLineCodec {
    type Item = OutputLine;
    type Error = io::Error;

    fn decode(&mut self, buf: &mut BytesMut) -> io::Result<Option<OutputLine>> {
        loop {
            let newline = buf[self.next_index..]
                .iter()
                .position(|b| *b == b'\n')
                .map(|offset| offset + self.next_index);

            if self.discarding {
                self.next_index = 0;
                match newline {
                    Some(end) => {
                        buf.advance(end + 1);
                        self.discarding = false;
                        continue;
                    }
                    None => {
                        buf.clear();
                        return Ok(None);
                    }
                }
            }

            return Ok(match newline {
                Some(end) => {
                    self.next_index = 0;
                    let line = buf.split_to(end + 1);
                    let body = &line[..end];
                    if body.len() > self.max_length {
                        Some(OutputLine::from_bytes(&body[..self.max_length], true))
                    } else {
                        Some(OutputLine::from_bytes(body, false))
                    }
                }
                None if buf.len() > self.max_length => {
                    self.next_index = 0;
                    self.discarding = true;
                    let head = buf.split_to(self.max_length);
                    Some(OutputLine::from_bytes(&head, true))
                }
                None => {
                    self.next_index = buf.len();
                    None
                }
            });
        }
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> io::Result<Option<OutputLine>> {
        if let Some(line) = self.decode(buf)? {
            return Ok(Some(line));
        }
        self.next_index = 0;
        if self.discarding || buf.is_empty() {
            self.discarding = false;
            buf.clear();
            return Ok(None);
        }
        let rest = buf.split();
        Ok(Some(OutputLine::from_bytes(&rest, false)))
    }
}
