//! Demultiplexing of control frames out of device byte streams.
//!
//! Two extractors share one marker scanner:
//!
//! - [`EmbeddedFrameExtractor`] splits the device media stream into audio
//!   bytes and `<control>…</control>` frame bodies.
//! - [`ControlLaneExtractor`] reads the dedicated control connection, which
//!   carries marker-wrapped frames and bare newline-terminated lines.
//!
//! Neither keeps ordering state; each discovered frame body is returned
//! exactly once for the coordinator.

use once_cell::sync::Lazy;
use regex::Regex;
use sisi_proto::{CONTROL_END, CONTROL_START};
use tracing::warn;

/// Pending-byte cap for the media stream before an unterminated frame is
/// flushed as audio.
pub const EMBEDDED_MAX_PENDING_BYTES: usize = 64 * 1024;

/// Pending-byte cap for marker scanning on the control lane.
pub const CONTROL_LANE_MAX_PENDING_BYTES: usize = 32 * 1024;

/// Line buffer cap on the control lane before it is flushed as one payload.
pub const CONTROL_LANE_MAX_LINE_BYTES: usize = 2048;

static USERNAME_TAG: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)<username>(.*?)</username>").unwrap_or_else(|_| unreachable!()));

static OUTPUT_TAG: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)<output>(.*?)</output>").unwrap_or_else(|_| unreachable!()));

/// A piece of the device media stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    /// Bytes for the audio path.
    Media(Vec<u8>),
    /// Trimmed, non-empty control frame body.
    Control(String),
}

/// Decode a frame body, dropping invalid UTF-8.
fn decode_body(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes)
        .replace(char::REPLACEMENT_CHARACTER, "")
        .trim()
        .to_string()
}

fn find(haystack: &[u8], needle: &[u8], from: usize) -> Option<usize> {
    if from > haystack.len() {
        return None;
    }
    haystack[from..]
        .windows(needle.len())
        .position(|window| window == needle)
        .map(|pos| pos + from)
}

/// Length of the longest suffix of `buf` that is a proper prefix of `marker`.
fn partial_marker_len(buf: &[u8], marker: &[u8]) -> usize {
    let max = marker.len().saturating_sub(1).min(buf.len());
    (1..=max)
        .rev()
        .find(|&n| buf[buf.len() - n..] == marker[..n])
        .unwrap_or(0)
}

enum Scanned {
    Passthrough(Vec<u8>),
    Frame(String),
}

/// Finds `<control>…</control>` frames in a byte stream.
#[derive(Debug)]
struct MarkerScanner {
    pending: Vec<u8>,
    max_pending: usize,
    lane: &'static str,
}

impl MarkerScanner {
    fn new(max_pending: usize, lane: &'static str) -> Self {
        Self {
            pending: Vec::new(),
            max_pending,
            lane,
        }
    }

    fn scan(&mut self, data: &[u8]) -> Vec<Scanned> {
        let start = CONTROL_START.as_bytes();
        let end = CONTROL_END.as_bytes();
        let mut out = Vec::new();
        self.pending.extend_from_slice(data);

        loop {
            let Some(start_idx) = find(&self.pending, start, 0) else {
                // Hold back only bytes that could begin a split start marker.
                let keep = partial_marker_len(&self.pending, start);
                let flush_len = self.pending.len() - keep;
                if flush_len > 0 {
                    out.push(Scanned::Passthrough(self.pending.drain(..flush_len).collect()));
                }
                return out;
            };

            if start_idx > 0 {
                out.push(Scanned::Passthrough(self.pending.drain(..start_idx).collect()));
                continue;
            }

            let Some(end_idx) = find(&self.pending, end, start.len()) else {
                if self.pending.len() > self.max_pending {
                    warn!(
                        lane = self.lane,
                        pending = self.pending.len(),
                        "pending buffer overflow, flushing unterminated frame"
                    );
                    out.push(Scanned::Passthrough(std::mem::take(&mut self.pending)));
                }
                return out;
            };

            let body = decode_body(&self.pending[start.len()..end_idx]);
            self.pending.drain(..end_idx + end.len());
            if !body.is_empty() {
                out.push(Scanned::Frame(body));
            }
        }
    }

    fn buffered(&self) -> usize {
        self.pending.len()
    }
}

/// Splits the device media stream into audio and control frames.
#[derive(Debug)]
pub struct EmbeddedFrameExtractor {
    scanner: MarkerScanner,
}

impl Default for EmbeddedFrameExtractor {
    fn default() -> Self {
        Self::new()
    }
}

impl EmbeddedFrameExtractor {
    /// Create an extractor with the default pending cap.
    #[must_use]
    pub fn new() -> Self {
        Self::with_max_pending(EMBEDDED_MAX_PENDING_BYTES)
    }

    /// Create an extractor with a custom pending cap.
    #[must_use]
    pub fn with_max_pending(max_pending: usize) -> Self {
        Self {
            scanner: MarkerScanner::new(max_pending, "mixed_audio"),
        }
    }

    /// Consume one network read. Segments come out in stream order.
    pub fn feed(&mut self, data: &[u8]) -> Vec<Segment> {
        self.scanner
            .scan(data)
            .into_iter()
            .map(|scanned| match scanned {
                Scanned::Passthrough(bytes) => Segment::Media(bytes),
                Scanned::Frame(body) => Segment::Control(body),
            })
            .collect()
    }

    /// Bytes held back waiting for more data.
    #[must_use]
    pub fn buffered(&self) -> usize {
        self.scanner.buffered()
    }
}

/// Reads control frames from the dedicated control connection.
#[derive(Debug)]
pub struct ControlLaneExtractor {
    scanner: MarkerScanner,
    line: Vec<u8>,
    max_line: usize,
}

impl Default for ControlLaneExtractor {
    fn default() -> Self {
        Self::new()
    }
}

impl ControlLaneExtractor {
    /// Create an extractor with the default caps.
    #[must_use]
    pub fn new() -> Self {
        Self {
            scanner: MarkerScanner::new(CONTROL_LANE_MAX_PENDING_BYTES, "control_lane"),
            line: Vec::new(),
            max_line: CONTROL_LANE_MAX_LINE_BYTES,
        }
    }

    /// Consume one network read and return the frame bodies found.
    pub fn feed(&mut self, data: &[u8]) -> Vec<String> {
        let mut payloads = Vec::new();
        for scanned in self.scanner.scan(data) {
            match scanned {
                Scanned::Frame(body) => payloads.push(body),
                Scanned::Passthrough(bytes) => self.consume_lines(&bytes, &mut payloads),
            }
        }
        payloads
    }

    fn consume_lines(&mut self, chunk: &[u8], payloads: &mut Vec<String>) {
        self.line.extend_from_slice(chunk);
        while let Some(idx) = self.line.iter().position(|&b| b == b'\n') {
            let text = decode_body(&self.line[..idx]);
            self.line.drain(..=idx);
            if !text.is_empty() {
                payloads.push(text);
            }
        }
        if self.line.len() > self.max_line {
            warn!(pending = self.line.len(), "control lane line overflow, flushing");
            let text = decode_body(&self.line);
            self.line.clear();
            if !text.is_empty() {
                payloads.push(text);
            }
        }
    }

    /// Bytes held back waiting for more data.
    #[must_use]
    pub fn buffered(&self) -> usize {
        self.scanner.buffered() + self.line.len()
    }
}

/// What a non-control media chunk carries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MediaChunk {
    /// `<username>…</username>` metadata.
    Username(String),
    /// `<output>True|False</output>` metadata.
    Output(bool),
    /// Audio bytes.
    Audio(Vec<u8>),
}

/// Classify a media chunk as device metadata or audio.
#[must_use]
pub fn classify_media_chunk(chunk: Vec<u8>) -> MediaChunk {
    if find(&chunk, b"<username>", 0).is_some() {
        let text = String::from_utf8_lossy(&chunk);
        if let Some(caps) = USERNAME_TAG.captures(&text) {
            return MediaChunk::Username(caps[1].to_string());
        }
    }
    if find(&chunk, b"<output>", 0).is_some() {
        let text = String::from_utf8_lossy(&chunk);
        if let Some(caps) = OUTPUT_TAG.captures(&text) {
            return MediaChunk::Output(&caps[1] == "True");
        }
    }
    MediaChunk::Audio(chunk)
}
