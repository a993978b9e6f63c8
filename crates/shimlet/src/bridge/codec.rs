//! Newline framing for the worker's stdio pipes.
//!
//! `LineFramer` splits a byte stream on `\n` without decoding text; UTF-8 is
//! left to the JSON parser, so a multi-byte character split across two reads
//! is reassembled by the buffer before anything looks at it.
//! `JsonLinesCodec` layers serde_json on top for typed messages.

use std::cmp;
use std::io;
use std::marker::PhantomData;

use serde::{Serialize, de::DeserializeOwned};
use tokio_util::bytes::{BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

/// Default upper bound for a single line, excluding the newline.
pub const DEFAULT_MAX_LINE_BYTES: usize = 16 * 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum FramingError {
    #[error("pipe I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("line exceeds {limit} bytes without a newline")]
    LineTooLong { limit: usize },

    /// Stream closed with bytes buffered after the last newline.
    #[error("stream ended inside an unterminated line ({len} bytes buffered)")]
    UnterminatedLine { len: usize },

    #[error("invalid JSON line: {0}")]
    Json(#[from] serde_json::Error),
}

/// Splits raw bytes into newline-terminated lines.
///
/// Yields each line without its trailing `\n`. Partial data stays buffered
/// until the next newline arrives.
#[derive(Debug, Clone)]
pub struct LineFramer {
    max_length: usize,
    /// Where to resume the newline search, so a long partial line is not
    /// rescanned on every read.
    next_index: usize,
}

impl Default for LineFramer {
    fn default() -> Self {
        Self::new()
    }
}

impl LineFramer {
    pub fn new() -> Self {
        Self::with_max_length(DEFAULT_MAX_LINE_BYTES)
    }

    pub fn with_max_length(max_length: usize) -> Self {
        Self {
            max_length,
            next_index: 0,
        }
    }

    pub fn max_length(&self) -> usize {
        self.max_length
    }
}

impl Decoder for LineFramer {
    type Item = Bytes;
    type Error = FramingError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let read_to = cmp::min(self.max_length.saturating_add(1), src.len());
        let search_from = cmp::min(self.next_index, read_to);

        match src[search_from..read_to].iter().position(|b| *b == b'\n') {
            Some(offset) => {
                let newline_at = search_from + offset;
                self.next_index = 0;
                let mut line = src.split_to(newline_at + 1);
                line.truncate(newline_at);
                Ok(Some(line.freeze()))
            }
            None if src.len() > self.max_length => Err(FramingError::LineTooLong {
                limit: self.max_length,
            }),
            None => {
                self.next_index = read_to;
                Ok(None)
            }
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if let Some(line) = self.decode(src)? {
            return Ok(Some(line));
        }
        if src.is_empty() {
            return Ok(None);
        }

        let len = src.len();
        src.clear();
        self.next_index = 0;
        Err(FramingError::UnterminatedLine { len })
    }
}

/// Codec that frames messages as one compact JSON document per line.
pub struct JsonLinesCodec<T> {
    framer: LineFramer,
    _phantom: PhantomData<T>,
}

impl<T> Default for JsonLinesCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> JsonLinesCodec<T> {
    pub fn new() -> Self {
        Self::with_max_length(DEFAULT_MAX_LINE_BYTES)
    }

    pub fn with_max_length(max_length: usize) -> Self {
        Self {
            framer: LineFramer::with_max_length(max_length),
            _phantom: PhantomData,
        }
    }
}

impl<T: DeserializeOwned> Decoder for JsonLinesCodec<T> {
    type Item = T;
    type Error = FramingError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.framer.decode(src)? {
            Some(line) => Ok(Some(serde_json::from_slice(&line)?)),
            None => Ok(None),
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.framer.decode_eof(src)? {
            Some(line) => Ok(Some(serde_json::from_slice(&line)?)),
            None => Ok(None),
        }
    }
}

impl<T: Serialize> Encoder<T> for JsonLinesCodec<T> {
    type Error = FramingError;

    fn encode(&mut self, item: T, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let json = serde_json::to_vec(&item)?;
        // Compact serde_json output escapes control characters inside strings.
        debug_assert!(!json.contains(&b'\n'), "encoded line contains a newline");

        tracing::trace!(json_size_bytes = json.len(), "Encoding line");
        if json.len() > self.framer.max_length() {
            tracing::warn!(
                json_size_bytes = json.len(),
                limit = self.framer.max_length(),
                "Encoded line is larger than the peer's configured read limit"
            );
        }

        dst.reserve(json.len() + 1);
        dst.put_slice(&json);
        dst.put_u8(b'\n');
        Ok(())
    }
}
