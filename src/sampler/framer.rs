//! Record framing for the sampler's stdout.
//!
//! powermetrics writes one XML property list per interval, occasionally
//! interleaved with diagnostics. [`PlistFramer`] cuts the byte stream into
//! one [`RawSample`] per record; bytes outside a start/end marker pair are
//! dropped here and never reach the decoder.

use bytes::{Buf, Bytes, BytesMut};
use thiserror::Error;
use tokio_util::codec::Decoder;

/// XML prolog that opens a normal powermetrics record.
pub const XML_PROLOG: &[u8] = b"<?xml";

/// Bare plist root, accepted as a record start when the prolog is missing.
pub const PLIST_OPEN: &[u8] = b"<plist";

/// Closing tag of every record.
pub const PLIST_CLOSE: &[u8] = b"</plist>";

/// Default hard cap on buffered bytes without a complete record (10 MiB).
pub const DEFAULT_MAX_BUFFER_BYTES: usize = 10 * 1024 * 1024;

/// Bytes kept from a marker-free buffer so a start marker split across two
/// reads is still found.
const START_TAIL: usize = PLIST_OPEN.len() - 1;

/// Errors returned while framing the sampler stream.
#[derive(Error, Debug)]
pub enum FramingError {
    #[error("no complete record within {limit} bytes (buffered {size})")]
    BufferOverflow { size: usize, limit: usize },

    #[error("reading sampler output: {0}")]
    Io(#[from] std::io::Error),
}

/// One framed record, start marker through end marker inclusive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawSample {
    pub bytes: Bytes,
    /// False only for the dangling record flushed at end of stream.
    pub complete: bool,
}

impl RawSample {
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

/// Codec that extracts plist records from a continuous byte stream.
#[derive(Debug)]
pub struct PlistFramer {
    max_buffer_bytes: usize,
    /// Whether `buf[0]` is the start marker of the record being assembled.
    in_record: bool,
    /// Offset into the buffer where the next end-marker search resumes.
    scan_from: usize,
}

impl PlistFramer {
    /// Creates a framer that fails once `max_buffer_bytes` are buffered
    /// without a complete record.
    pub fn new(max_buffer_bytes: usize) -> Self {
        Self {
            max_buffer_bytes,
            in_record: false,
            scan_from: 0,
        }
    }

    pub fn max_buffer_bytes(&self) -> usize {
        self.max_buffer_bytes
    }

    fn reset(&mut self) {
        self.in_record = false;
        self.scan_from = 0;
    }
}

impl Default for PlistFramer {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_BUFFER_BYTES)
    }
}

impl Decoder for PlistFramer {
    type Item = RawSample;
    type Error = FramingError;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<RawSample>, FramingError> {
        if !self.in_record {
            match find_start(buf) {
                Some(start) => {
                    buf.advance(start);
                    self.in_record = true;
                    self.scan_from = 0;
                }
                None => {
                    let keep = START_TAIL.min(buf.len());
                    buf.advance(buf.len() - keep);
                    return Ok(None);
                }
            }
        }

        if let Some(pos) = find(&buf[self.scan_from..], PLIST_CLOSE) {
            let end = self.scan_from + pos + PLIST_CLOSE.len();
            let bytes = buf.split_to(end).freeze();
            self.reset();
            return Ok(Some(RawSample {
                bytes,
                complete: true,
            }));
        }

        if buf.len() > self.max_buffer_bytes {
            return Err(FramingError::BufferOverflow {
                size: buf.len(),
                limit: self.max_buffer_bytes,
            });
        }

        // The close tag may straddle this read and the next one.
        self.scan_from = buf.len().saturating_sub(PLIST_CLOSE.len() - 1);
        Ok(None)
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<RawSample>, FramingError> {
        if let Some(sample) = self.decode(buf)? {
            return Ok(Some(sample));
        }

        if self.in_record && !buf.is_empty() {
            let bytes = buf.split().freeze();
            self.reset();
            return Ok(Some(RawSample {
                bytes,
                complete: false,
            }));
        }

        buf.clear();
        self.reset();
        Ok(None)
    }
}

/// Position of the earliest accepted start marker.
fn find_start(haystack: &[u8]) -> Option<usize> {
    match (find(haystack, XML_PROLOG), find(haystack, PLIST_OPEN)) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if haystack.len() < needle.len() {
        return None;
    }
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}
