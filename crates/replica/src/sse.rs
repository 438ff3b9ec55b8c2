//! Incremental decoder for `text/event-stream` bodies.
//!
//! Bytes arrive in arbitrary chunks; frames may be split anywhere, including
//! inside a UTF-8 sequence. Only `data` fields matter to the notification
//! protocol. Comments, `event`, `id` and `retry` fields are skipped.
//!
//! A frame larger than [`MAX_FRAME_LEN`] is a stream error.

use crate::error::TransportError;
use protocol::StreamMessage;

/// Upper bound on an unterminated line and on one event's data.
pub const MAX_FRAME_LEN: usize = 64 * 1024;

/// Turns a byte stream into [`StreamMessage`]s.
#[derive(Debug, Default)]
pub struct EventStreamDecoder {
    buffer: Vec<u8>,
    data: Vec<String>,
    data_len: usize,
}

impl EventStreamDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk and return every message it completed.
    pub fn feed(&mut self, chunk: &[u8]) -> Result<Vec<StreamMessage>, TransportError> {
        self.buffer.extend_from_slice(chunk);
        let mut messages = Vec::new();

        while let Some(pos) = self.buffer.iter().position(|&b| b == b'\n') {
            let mut line: Vec<u8> = self.buffer.drain(..=pos).collect();
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            let line = String::from_utf8_lossy(&line);

            if line.is_empty() {
                if !self.data.is_empty() {
                    let data = self.data.join("\n");
                    self.data.clear();
                    self.data_len = 0;
                    messages.push(StreamMessage::from(data.as_str()));
                }
                continue;
            }
            if line.starts_with(':') {
                continue;
            }

            let (field, value) = match line.split_once(':') {
                Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
                None => (&*line, ""),
            };
            if field == "data" {
                self.data_len += value.len();
                if self.data_len > MAX_FRAME_LEN {
                    return Err(self.overflow("event data"));
                }
                self.data.push(value.to_string());
            }
        }

        if self.buffer.len() > MAX_FRAME_LEN {
            return Err(self.overflow("unterminated line"));
        }
        Ok(messages)
    }

    fn overflow(&mut self, what: &str) -> TransportError {
        self.buffer.clear();
        self.data.clear();
        self.data_len = 0;
        TransportError::Stream(format!("{what} exceeds {MAX_FRAME_LEN} bytes"))
    }
}
