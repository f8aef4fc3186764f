//! Framing of envelopes over byte streams and message-oriented channels.
//!
//! Byte streams use [`DelimitedCodec`]: each record is the JSON text of one
//! envelope followed by an end-of-message delimiter (`__EOM__` by default).
//! Channels that already preserve message boundaries carry one JSON text per
//! frame and go through [`decode_frame`] and [`encode_frame`].

pub mod error;

use bytes::{Buf, BufMut, BytesMut};
use log::warn;
use serde_json::Value;
use tokio_util::codec::{Decoder, Encoder};

pub use self::error::{CodecError, FrameError};
use crate::envelope::{Envelope, MARKER_FIELD};

/// Default end-of-message delimiter.
pub const DEFAULT_EOM: &str = "__EOM__";
/// Default cap on buffered bytes without a delimiter (16 MiB).
pub const DEFAULT_MAX_RECORD: usize = 16 * 1024 * 1024;

/// One record extracted from a byte stream.
#[derive(Debug)]
pub enum Decoded {
    Envelope(Envelope),
    /// Valid JSON that does not carry the protocol marker.
    Foreign(Value),
    /// Text that could not be parsed.
    Malformed { raw: String, error: String },
}

/// Delimiter-based framing for byte streams.
///
/// Decoding scans the buffer for the delimiter, so every complete record in
/// a chunk is yielded in order and a delimiter split across reads is found
/// once the remaining bytes arrive.
#[derive(Clone, Debug)]
pub struct DelimitedCodec {
    eom: Vec<u8>,
    max_record: usize,
    scanned: usize,
}

impl DelimitedCodec {
    /// Create a codec for the given delimiter. An empty delimiter falls back
    /// to [`DEFAULT_EOM`].
    #[must_use]
    pub fn new(eom: &str) -> Self {
        let eom = if eom.is_empty() { DEFAULT_EOM } else { eom };
        Self {
            eom: eom.as_bytes().to_vec(),
            max_record: DEFAULT_MAX_RECORD,
            scanned: 0,
        }
    }

    #[must_use]
    pub fn with_max_record(mut self, max: usize) -> Self {
        self.max_record = max;
        self
    }

    #[must_use]
    pub fn eom(&self) -> &[u8] { &self.eom }

    fn find_delimiter(&self, src: &[u8]) -> Option<usize> {
        let start = self.scanned.min(src.len());
        src[start..]
            .windows(self.eom.len())
            .position(|w| w == self.eom.as_slice())
            .map(|pos| start + pos)
    }
}

impl Default for DelimitedCodec {
    fn default() -> Self { Self::new(DEFAULT_EOM) }
}

impl Decoder for DelimitedCodec {
    type Item = Decoded;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let Some(end) = self.find_delimiter(src) else {
            if src.len() > self.max_record {
                return Err(CodecError::Oversized {
                    size: src.len(),
                    max: self.max_record,
                });
            }
            // Resume where a partial delimiter could still begin.
            self.scanned = src.len().saturating_sub(self.eom.len() - 1);
            return Ok(None);
        };
        let record = src.split_to(end);
        src.advance(self.eom.len());
        self.scanned = 0;
        Ok(Some(parse_record(&record)))
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if let Some(item) = self.decode(buf)? {
            return Ok(Some(item));
        }
        if !buf.is_empty() {
            warn!(
                "discarding incomplete record at end of stream: bytes={}",
                buf.len()
            );
            buf.clear();
            self.scanned = 0;
        }
        Ok(None)
    }
}

impl Encoder<&Envelope> for DelimitedCodec {
    type Error = CodecError;

    fn encode(&mut self, item: &Envelope, dst: &mut BytesMut) -> Result<(), Self::Error> {
        serde_json::to_writer(dst.writer(), item)?;
        dst.extend_from_slice(&self.eom);
        Ok(())
    }
}

impl Encoder<Envelope> for DelimitedCodec {
    type Error = CodecError;

    fn encode(&mut self, item: Envelope, dst: &mut BytesMut) -> Result<(), Self::Error> {
        self.encode(&item, dst)
    }
}

fn parse_record(record: &[u8]) -> Decoded {
    let text = String::from_utf8_lossy(record);
    match decode_frame(&text) {
        Ok(envelope) => Decoded::Envelope(envelope),
        Err(FrameError::Foreign) => match serde_json::from_str(&text) {
            Ok(value) => Decoded::Foreign(value),
            Err(e) => Decoded::Malformed {
                raw: text.into_owned(),
                error: e.to_string(),
            },
        },
        Err(FrameError::Malformed(error)) => Decoded::Malformed {
            raw: text.into_owned(),
            error,
        },
    }
}

/// Parse one frame from a message-oriented channel.
///
/// # Errors
///
/// Returns [`FrameError::Malformed`] for invalid JSON or envelope shape and
/// [`FrameError::Foreign`] when the protocol marker is missing.
pub fn decode_frame(text: &str) -> Result<Envelope, FrameError> {
    let value: Value =
        serde_json::from_str(text.trim()).map_err(|e| FrameError::Malformed(e.to_string()))?;
    decode_value(value)
}

/// Parse an envelope from an already decoded JSON value.
///
/// # Errors
///
/// As for [`decode_frame`].
pub fn decode_value(value: Value) -> Result<Envelope, FrameError> {
    let marked = value
        .get(MARKER_FIELD)
        .and_then(Value::as_bool)
        .unwrap_or(false);
    if !marked {
        return Err(FrameError::Foreign);
    }
    serde_json::from_value(value).map_err(|e| FrameError::Malformed(e.to_string()))
}

/// Serialize an envelope into a single frame.
///
/// # Errors
///
/// Returns the serializer error if the payload cannot be encoded.
pub fn encode_frame(envelope: &Envelope) -> Result<String, serde_json::Error> {
    serde_json::to_string(envelope)
}
