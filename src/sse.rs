//! Server-Sent Events framing.
//!
//! [`SseDecoder`] reads provider streams (`data: {...}` lines terminated by
//! `data: [DONE]`), buffering across TCP chunk boundaries. [`encode_data`]
//! writes the outbound `data: <json>\n\n` frames consumed by callers.

use serde::Serialize;
use serde_json::Value;

/// One decoded `data:` payload.
#[derive(Debug, Clone, PartialEq)]
pub enum SseFrame {
    /// A JSON payload.
    Data(Value),
    /// The `[DONE]` terminator.
    Done,
}

/// SSE stream decoder for OpenAI-compatible APIs.
///
/// Ignores `event:`/`id:`/comment lines and empty keep-alive lines. Lines
/// whose payload is not valid JSON are dropped.
///
/// # Example
///
/// ```
/// use agent_pipeline::sse::{SseDecoder, SseFrame};
///
/// let mut decoder = SseDecoder::new();
/// let frames = decoder.decode(b"data: {\"n\":1}\n\ndata: [DONE]\n\n");
/// assert_eq!(frames.len(), 2);
/// assert_eq!(frames[1], SseFrame::Done);
/// ```
#[derive(Debug, Default)]
pub struct SseDecoder {
    /// Raw bytes of the current incomplete line. Kept undecoded so a
    /// multibyte character split across chunks survives.
    buffer: Vec<u8>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed raw bytes and return every frame completed by this chunk.
    pub fn decode(&mut self, chunk: &[u8]) -> Vec<SseFrame> {
        self.buffer.extend_from_slice(chunk);

        let mut frames = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            if let Some(frame) = parse_raw_line(&line) {
                frames.push(frame);
            }
        }
        frames
    }

    /// Parse whatever is left once the stream has ended.
    pub fn flush(&mut self) -> Vec<SseFrame> {
        let remaining = std::mem::take(&mut self.buffer);
        remaining
            .split(|&b| b == b'\n')
            .filter_map(parse_raw_line)
            .collect()
    }
}

fn parse_raw_line(line: &[u8]) -> Option<SseFrame> {
    match std::str::from_utf8(line) {
        Ok(line) => parse_line(line),
        Err(e) => {
            tracing::warn!(error = %e, "Dropping SSE line with invalid UTF-8");
            None
        }
    }
}

fn parse_line(line: &str) -> Option<SseFrame> {
    let line = line.trim();
    let data = line
        .strip_prefix("data: ")
        .or_else(|| line.strip_prefix("data:"))?
        .trim();

    if data == "[DONE]" {
        return Some(SseFrame::Done);
    }
    serde_json::from_str::<Value>(data).ok().map(SseFrame::Data)
}

/// Serialize `event` as a single `data: <json>\n\n` frame.
pub fn encode_data<T: Serialize>(event: &T) -> serde_json::Result<String> {
    Ok(format!("data: {}\n\n", serde_json::to_string(event)?))
}
