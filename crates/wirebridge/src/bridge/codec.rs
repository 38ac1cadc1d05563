//! Newline framing for the worker's stdio streams.
//!
//! Wraps LinesCodec, but never lets a bad line poison the stream: oversized
//! lines, invalid UTF-8 and blank lines are dropped and decoding carries on
//! with the next line. Works over any AsyncRead/AsyncWrite.

use std::io;

use tokio_util::bytes::BytesMut;
use tokio_util::codec::{Decoder, Encoder, LinesCodec, LinesCodecError};

/// Default upper bound for a single line (8 MiB).
pub const DEFAULT_MAX_LINE_LENGTH: usize = 8 * 1024 * 1024;

/// Codec that splits a byte stream into newline-terminated text units.
pub struct LineCodec {
    inner: LinesCodec,
    max_length: usize,
}

impl Default for LineCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl LineCodec {
    pub fn new() -> Self {
        Self::with_max_length(DEFAULT_MAX_LINE_LENGTH)
    }

    pub fn with_max_length(max_length: usize) -> Self {
        Self {
            inner: LinesCodec::new_with_max_length(max_length),
            max_length,
        }
    }

    pub fn max_length(&self) -> usize {
        self.max_length
    }
}

impl Decoder for LineCodec {
    type Item = String;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            match self.inner.decode(src) {
                Ok(Some(line)) => {
                    if line.trim().is_empty() {
                        continue;
                    }
                    tracing::trace!(line_bytes = line.len(), "Decoded line");
                    return Ok(Some(line));
                }
                Ok(None) => return Ok(None),
                Err(LinesCodecError::MaxLineLengthExceeded) => {
                    // LinesCodec switches to discard mode until the next newline.
                    tracing::warn!(
                        max_length = self.max_length,
                        "Dropping line that exceeds maximum length"
                    );
                }
                Err(LinesCodecError::Io(e)) if e.kind() == io::ErrorKind::InvalidData => {
                    tracing::warn!(error = %e, "Dropping line that is not valid UTF-8");
                }
                Err(LinesCodecError::Io(e)) => return Err(e),
            }
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if let Some(line) = self.decode(src)? {
            return Ok(Some(line));
        }
        if !src.is_empty() {
            tracing::debug!(
                remaining_bytes = src.len(),
                "Discarding unterminated fragment at end of stream"
            );
            src.clear();
        }
        Ok(None)
    }
}

impl Encoder<String> for LineCodec {
    type Error = io::Error;

    fn encode(&mut self, item: String, dst: &mut BytesMut) -> Result<(), Self::Error> {
        tracing::trace!(line_bytes = item.len(), "Encoding line");
        self.inner.encode(item, dst).map_err(|e| match e {
            LinesCodecError::Io(e) => e,
            LinesCodecError::MaxLineLengthExceeded => {
                io::Error::new(io::ErrorKind::InvalidInput, "line exceeds maximum length")
            }
        })
    }
}
