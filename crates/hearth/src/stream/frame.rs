//! Newline-delimited JSON framing over a chunked byte stream
//!
//! Network chunks do not respect line boundaries. The decoder keeps the
//! unterminated tail of the last chunk and only decodes complete lines.
//! A line that is not valid JSON is logged and skipped, and so is a line
//! that grows past [`MAX_LINE_BYTES`] without a newline.

use bytes::Bytes;
use futures::stream::Stream;
use serde_json::Value;
use std::collections::VecDeque;
use std::marker::PhantomData;
use std::pin::Pin;
use std::task::{Context, Poll};

/// Longest line the decoder buffers while waiting for its newline
pub const MAX_LINE_BYTES: usize = 8 * 1024 * 1024;

/// Incremental NDJSON decoder with a carry-over buffer
#[derive(Debug)]
pub struct FrameDecoder {
    buffer: Vec<u8>,
    max_line: usize,
    /// Inside an oversized line; bytes are dropped up to the next newline
    discarding: bool,
    skipped: usize,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::with_max_line(MAX_LINE_BYTES)
    }
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_line(max_line: usize) -> Self {
        Self {
            buffer: Vec::new(),
            max_line,
            discarding: false,
            skipped: 0,
        }
    }

    /// Append a chunk and return every frame completed by it, in order
    pub fn push(&mut self, mut chunk: &[u8]) -> Vec<Value> {
        if self.discarding {
            let Some(newline) = chunk.iter().position(|b| *b == b'\n') else {
                return Vec::new();
            };
            chunk = &chunk[newline + 1..];
            self.discarding = false;
        }
        self.buffer.extend_from_slice(chunk);

        let frames = match self.buffer.iter().rposition(|b| *b == b'\n') {
            Some(last_newline) => {
                let tail = self.buffer.split_off(last_newline + 1);
                let complete = std::mem::replace(&mut self.buffer, tail);
                complete
                    .split(|b| *b == b'\n')
                    .filter_map(|line| self.decode_line(line))
                    .collect()
            }
            None => Vec::new(),
        };

        if self.buffer.len() > self.max_line {
            self.skipped += 1;
            tracing::warn!(
                line_len = self.buffer.len(),
                max_line = self.max_line,
                "Dropping oversized stream frame"
            );
            self.buffer = Vec::new();
            self.discarding = true;
        }
        frames
    }

    /// Decode whatever is left once the connection has ended
    pub fn finish(&mut self) -> Option<Value> {
        if std::mem::take(&mut self.discarding) {
            self.buffer.clear();
            return None;
        }
        let rest = std::mem::take(&mut self.buffer);
        self.decode_line(&rest)
    }

    /// Bytes held back waiting for a newline
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    /// Number of malformed lines dropped so far
    pub fn skipped(&self) -> usize {
        self.skipped
    }

    fn decode_line(&mut self, line: &[u8]) -> Option<Value> {
        let line = trim_ascii_whitespace(line);
        if line.is_empty() {
            return None;
        }
        if line.len() > self.max_line {
            self.skipped += 1;
            tracing::warn!(
                line_len = line.len(),
                max_line = self.max_line,
                "Dropping oversized stream frame"
            );
            return None;
        }
        match serde_json::from_slice(line) {
            Ok(value) => Some(value),
            Err(e) => {
                self.skipped += 1;
                tracing::warn!(
                    error = %e,
                    line_len = line.len(),
                    "Dropping malformed stream frame"
                );
                None
            }
        }
    }
}

fn trim_ascii_whitespace(mut line: &[u8]) -> &[u8] {
    while let [first, rest @ ..] = line {
        if first.is_ascii_whitespace() {
            line = rest;
        } else {
            break;
        }
    }
    while let [rest @ .., last] = line {
        if last.is_ascii_whitespace() {
            line = rest;
        } else {
            break;
        }
    }
    line
}

/// Stream adaptor yielding decoded frames from a byte stream
///
/// Forward-only and not restartable. Ends when the inner stream ends; a
/// transport error is yielded once and the stream is finished afterwards.
pub struct FrameStream<S, E>
where
    S: Stream<Item = Result<Bytes, E>> + Unpin,
{
    inner: S,
    decoder: FrameDecoder,
    ready: VecDeque<Value>,
    finished: bool,
    _error: PhantomData<fn() -> E>,
}

impl<S, E> FrameStream<S, E>
where
    S: Stream<Item = Result<Bytes, E>> + Unpin,
{
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            decoder: FrameDecoder::new(),
            ready: VecDeque::new(),
            finished: false,
            _error: PhantomData,
        }
    }

    pub fn decoder(&self) -> &FrameDecoder {
        &self.decoder
    }
}

impl<S, E> Stream for FrameStream<S, E>
where
    S: Stream<Item = Result<Bytes, E>> + Unpin,
{
    type Item = Result<Value, E>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = &mut *self;

        loop {
            if let Some(frame) = this.ready.pop_front() {
                return Poll::Ready(Some(Ok(frame)));
            }
            if this.finished {
                return Poll::Ready(None);
            }

            match Pin::new(&mut this.inner).poll_next(cx) {
                Poll::Ready(Some(Ok(bytes))) => {
                    this.ready.extend(this.decoder.push(&bytes));
                }
                Poll::Ready(Some(Err(e))) => {
                    this.finished = true;
                    return Poll::Ready(Some(Err(e)));
                }
                Poll::Ready(None) => {
                    this.finished = true;
                    this.ready.extend(this.decoder.finish());
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}
