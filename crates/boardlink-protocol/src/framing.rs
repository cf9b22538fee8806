//! Newline framing for the inbound byte stream.
//!
//! Serial reads return arbitrary chunks: half a line, several lines, or a
//! line split across three reads. [`LineBuffer`] accumulates chunks and
//! yields complete `\n`-terminated lines. A line that grows past the
//! buffer limit is discarded up to its terminating newline and reported as
//! a single [`Frame::Overflow`].

use tracing::warn;

/// Maximum accepted line length in bytes, excluding the terminator.
pub const MAX_LINE: usize = 8192;

/// One item produced by [`LineBuffer::push`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// A complete line with the `\n` (and a trailing `\r`, if any) removed.
    /// The bytes are not guaranteed to be UTF-8.
    Line(Vec<u8>),

    /// An over-long line was dropped. `discarded` counts the bytes dropped
    /// when the limit was hit.
    Overflow { discarded: usize },
}

/// Accumulates inbound bytes and splits them into lines.
#[derive(Debug)]
pub struct LineBuffer {
    buf: Vec<u8>,
    limit: usize,
    /// Set after an overflow: skip bytes until the next newline.
    discarding: bool,
}

impl Default for LineBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::with_limit(MAX_LINE)
    }

    pub fn with_limit(limit: usize) -> Self {
        LineBuffer {
            buf: Vec::with_capacity(256),
            limit,
            discarding: false,
        }
    }

    /// Bytes currently buffered (an incomplete line).
    pub fn pending_len(&self) -> usize {
        self.buf.len()
    }

    /// Feed a chunk and collect every frame it completes.
    pub fn push(&mut self, mut chunk: &[u8]) -> Vec<Frame> {
        let mut frames = Vec::new();

        while !chunk.is_empty() {
            match chunk.iter().position(|&b| b == b'\n') {
                Some(pos) => {
                    let (head, rest) = chunk.split_at(pos);
                    chunk = &rest[1..];

                    if self.discarding {
                        self.discarding = false;
                        continue;
                    }
                    if self.buf.len() + head.len() > self.limit {
                        let discarded = self.buf.len() + head.len();
                        self.overflow(discarded, &mut frames);
                        self.discarding = false;
                        continue;
                    }

                    self.buf.extend_from_slice(head);
                    let mut line = std::mem::take(&mut self.buf);
                    if line.last() == Some(&b'\r') {
                        line.pop();
                    }
                    frames.push(Frame::Line(line));
                }
                None => {
                    if !self.discarding {
                        if self.buf.len() + chunk.len() > self.limit {
                            let discarded = self.buf.len() + chunk.len();
                            self.overflow(discarded, &mut frames);
                        } else {
                            self.buf.extend_from_slice(chunk);
                        }
                    }
                    break;
                }
            }
        }

        frames
    }

    fn overflow(&mut self, discarded: usize, frames: &mut Vec<Frame>) {
        warn!(
            discarded,
            limit = self.limit,
            "line buffer overflow, resetting"
        );
        self.buf.clear();
        self.discarding = true;
        frames.push(Frame::Overflow { discarded });
    }
}
