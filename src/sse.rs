//! SSE transport helpers shared by the streaming adaptors.

use crate::types::EngineError;
use anyhow::Result;

/// Splits an arbitrary byte-chunk stream into complete lines.
///
/// Buffering is byte-level so multi-byte UTF-8 sequences split across chunk
/// boundaries survive; each completed line is validated as UTF-8 on its own.
#[derive(Debug, Default)]
pub struct SseLineBuffer {
    buffer: Vec<u8>,
}

impl SseLineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds one transport chunk, returning the lines it completed.
    pub fn push(&mut self, chunk: &[u8]) -> Result<Vec<String>> {
        let mut lines = Vec::new();
        for &byte in chunk {
            if byte == b'\n' {
                lines.push(self.take_line()?);
            } else {
                self.buffer.push(byte);
            }
        }
        Ok(lines)
    }

    /// Flushes a trailing line lacking a final newline (streams that end
    /// abruptly still deliver their last event).
    pub fn finish(&mut self) -> Result<Option<String>> {
        if self.buffer.is_empty() {
            Ok(None)
        } else {
            self.take_line().map(Some)
        }
    }

    fn take_line(&mut self) -> Result<String> {
        let mut line = std::mem::take(&mut self.buffer);
        if line.last() == Some(&b'\r') {
            line.pop();
        }
        String::from_utf8(line)
            .map_err(|_| EngineError::ResponseInvalid("Invalid UTF-8 in event stream".to_string()).into())
    }
}

/// Extracts the payload of a `data:` SSE line. Returns `None` for blank
/// lines, comments, and other SSE fields (`event:`, `id:`, ...).
pub fn data_payload(line: &str) -> Option<&str> {
    let rest = line.strip_prefix("data:")?;
    Some(rest.strip_prefix(' ').unwrap_or(rest))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lines_split_across_chunks() {
        let mut buffer = SseLineBuffer::new();
        assert!(buffer.push(b"data: {\"a\":").unwrap().is_empty());
        let lines = buffer.push(b" 1}\n\ndata: done\n").unwrap();
        assert_eq!(lines, vec!["data: {\"a\": 1}", "", "data: done"]);
    }

    #[test]
    fn multibyte_utf8_survives_chunk_boundary() {
        let text = "data: grüße\n".as_bytes();
        // Split in the middle of the two-byte 'ü'.
        let split = text.iter().position(|&b| b == 0xc3).unwrap() + 1;
        let mut buffer = SseLineBuffer::new();
        assert!(buffer.push(&text[..split]).unwrap().is_empty());
        let lines = buffer.push(&text[split..]).unwrap();
        assert_eq!(lines, vec!["data: grüße"]);
    }

    #[test]
    fn crlf_terminators_are_stripped() {
        let mut buffer = SseLineBuffer::new();
        let lines = buffer.push(b"data: x\r\n").unwrap();
        assert_eq!(lines, vec!["data: x"]);
    }

    #[test]
    fn finish_flushes_trailing_line() {
        let mut buffer = SseLineBuffer::new();
        buffer.push(b"data: tail").unwrap();
        assert_eq!(buffer.finish().unwrap(), Some("data: tail".to_string()));
        assert_eq!(buffer.finish().unwrap(), None);
    }

    #[test]
    fn invalid_utf8_is_a_response_error() {
        let mut buffer = SseLineBuffer::new();
        let err = buffer.push(&[0xff, 0xfe, b'\n']).unwrap_err();
        assert!(err.downcast_ref::<EngineError>().is_some());
    }

    #[test]
    fn data_payload_extraction() {
        assert_eq!(data_payload("data: {\"x\":1}"), Some("{\"x\":1}"));
        assert_eq!(data_payload("data:{\"x\":1}"), Some("{\"x\":1}"));
        assert_eq!(data_payload("event: ping"), None);
        assert_eq!(data_payload(""), None);
        assert_eq!(data_payload(": comment"), None);
    }
}
