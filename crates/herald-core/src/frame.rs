//! # Wire Framing
//!
//! Line-based text framing for envelopes on the push channel.
//!
//! ## Frame Format
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Push Channel Frames                             │
//! │                                                                         │
//! │  data: {"type":"connected","timestamp":"..."}\n                        │
//! │  \n                                          ◄── blank line ends frame │
//! │  data: {"type":"new_order","data":{..},"timestamp":"..."}\n            │
//! │  \n                                                                     │
//! │                                                                         │
//! │  DECODER RULES                                                         │
//! │  ─────────────                                                         │
//! │  • Frames end at a blank line (\n\n or \r\n\r\n)                       │
//! │  • Multiple `data:` lines are joined with \n                           │
//! │  • Lines starting with `:` are comments and ignored                    │
//! │  • `event:`, `id:`, `retry:` and unknown fields are ignored            │
//! │  • A frame over the size limit (1 MiB) is dropped with one error       │
//! │  • A frame with no data lines yields nothing (not an error)            │
//! │  • Bytes may arrive split anywhere, including inside UTF-8 sequences   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use crate::envelope::EventEnvelope;
use crate::error::{CoreError, CoreResult};

/// Encodes an envelope as a single `data: <json>\n\n` frame.
pub fn encode_frame(envelope: &EventEnvelope) -> CoreResult<String> {
    let json = envelope
        .to_json()
        .map_err(|e| CoreError::EncodeFailed(e.to_string()))?;
    Ok(format!("data: {}\n\n", json))
}

/// Largest frame the decoder buffers before giving up on it.
pub const DEFAULT_MAX_FRAME_LEN: usize = 1024 * 1024;

/// Bytes at the end of the buffer that may hold the start of a delimiter.
const DELIMITER_OVERLAP: usize = 2;

/// Incremental decoder for a byte stream of frames.
///
/// Feed chunks with [`FrameDecoder::push`]; each call returns the results
/// for every frame completed by that chunk, in stream order. A malformed
/// frame produces an `Err` entry and never affects the frames around it.
///
/// Each push only scans the bytes it added. A frame that grows past
/// `max_frame_len` without a terminating blank line is reported once and
/// its remaining bytes are skipped up to the next frame boundary.
#[derive(Debug)]
pub struct FrameDecoder {
    /// Undecoded bytes (may end in a partial UTF-8 sequence).
    pending: Vec<u8>,
    /// Offset in `pending` where the next delimiter search starts.
    scanned: usize,
    max_frame_len: usize,
    /// Set while skipping the tail of an oversized frame.
    discarding: bool,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::with_max_frame_len(DEFAULT_MAX_FRAME_LEN)
    }
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_frame_len(max_frame_len: usize) -> Self {
        FrameDecoder {
            pending: Vec::new(),
            scanned: 0,
            max_frame_len,
            discarding: false,
        }
    }

    /// Appends a chunk and decodes all frames it completes.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<CoreResult<EventEnvelope>> {
        self.pending.extend_from_slice(chunk);

        let mut results = Vec::new();
        while let Some((end, delimiter_len)) = find_frame_end(&self.pending, self.scanned) {
            let frame: Vec<u8> = self.pending.drain(..end + delimiter_len).collect();
            self.scanned = 0;
            if std::mem::take(&mut self.discarding) {
                continue;
            }
            if end > self.max_frame_len {
                results.push(Err(self.oversized()));
                continue;
            }
            if let Some(result) = decode_frame(&frame[..end]) {
                results.push(result);
            }
        }

        if self.pending.len() > self.max_frame_len {
            if !self.discarding {
                results.push(Err(self.oversized()));
                self.discarding = true;
            }
            let keep_from = self.pending.len().saturating_sub(DELIMITER_OVERLAP);
            self.pending.drain(..keep_from);
        }
        self.scanned = self.pending.len().saturating_sub(DELIMITER_OVERLAP);

        results
    }

    /// Decodes whatever is left once the stream has ended.
    ///
    /// A trailing frame without its blank line is still delivered.
    pub fn finish(&mut self) -> Option<CoreResult<EventEnvelope>> {
        let frame = std::mem::take(&mut self.pending);
        self.scanned = 0;
        if std::mem::take(&mut self.discarding) || frame.is_empty() {
            return None;
        }
        decode_frame(&frame)
    }

    fn oversized(&self) -> CoreError {
        CoreError::MalformedFrame(format!("frame exceeds {} bytes", self.max_frame_len))
    }

    /// Number of buffered bytes not yet forming a complete frame.
    pub fn buffered(&self) -> usize {
        self.pending.len()
    }
}

/// Finds the first blank-line delimiter at or after `from`, returning
/// (frame_end, delimiter_len).
fn find_frame_end(buf: &[u8], from: usize) -> Option<(usize, usize)> {
    let mut i = from;
    while i + 1 < buf.len() {
        if buf[i] == b'\n' {
            if buf[i + 1] == b'\n' {
                return Some((i, 2));
            }
            if buf[i + 1] == b'\r' && buf.get(i + 2) == Some(&b'\n') {
                return Some((i, 3));
            }
        }
        i += 1;
    }
    None
}

/// Decodes one frame body (without its terminating blank line).
fn decode_frame(raw: &[u8]) -> Option<CoreResult<EventEnvelope>> {
    let text = match std::str::from_utf8(raw) {
        Ok(text) => text,
        Err(e) => return Some(Err(CoreError::MalformedFrame(format!("invalid UTF-8: {}", e)))),
    };

    let mut data_lines: Vec<&str> = Vec::new();
    for line in text.lines() {
        let line = line.strip_suffix('\r').unwrap_or(line);
        if line.is_empty() || line.starts_with(':') {
            continue;
        }
        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        if field == "data" {
            data_lines.push(value);
        }
    }

    if data_lines.is_empty() {
        return None;
    }

    let payload = data_lines.join("\n");
    Some(EventEnvelope::from_json(&payload).map_err(|e| CoreError::InvalidEnvelope(e.to_string())))
}
