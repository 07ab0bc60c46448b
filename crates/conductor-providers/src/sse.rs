//! Server-Sent Events (SSE) parser with line buffering.
//!
//! SSE lines can span multiple TCP packets, so bytes are buffered until a
//! complete line is available.

/// A parsed SSE event.
#[derive(Debug, Clone, PartialEq)]
pub struct SseEvent {
    /// The event type (from "event:" line)
    pub event: Option<String>,
    /// The event data (from "data:" lines, joined with newlines)
    pub data: String,
}

/// SSE parser that handles line buffering across chunks.
#[derive(Debug, Default)]
pub struct SseParser {
    buffer: Vec<u8>,
    current_event: Option<String>,
    current_data: Vec<String>,
}

impl SseParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed bytes into the parser and return any complete events.
    ///
    /// Bytes are buffered raw so multi-byte UTF-8 sequences split across
    /// chunks decode correctly.
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<SseEvent> {
        self.buffer.extend_from_slice(bytes);
        let mut events = Vec::new();

        while let Some(newline) = self.buffer.iter().position(|&b| b == b'\n') {
            let raw: Vec<u8> = self.buffer.drain(..=newline).collect();
            let line = String::from_utf8_lossy(&raw[..raw.len() - 1]);
            let line = line.trim_end_matches('\r');

            // Empty line signals end of event
            if line.is_empty() {
                if let Some(event) = self.finalize_event() {
                    events.push(event);
                }
                continue;
            }

            match Self::parse_field(line) {
                Some(("event", value)) => self.current_event = Some(value.to_string()),
                Some(("data", value)) => self.current_data.push(value.to_string()),
                _ => {}
            }
        }

        events
    }

    fn parse_field(line: &str) -> Option<(&str, &str)> {
        if line.starts_with(':') {
            return None;
        }
        match line.split_once(':') {
            Some((field, value)) => Some((field, value.strip_prefix(' ').unwrap_or(value))),
            None => Some((line, "")),
        }
    }

    fn finalize_event(&mut self) -> Option<SseEvent> {
        if self.current_data.is_empty() {
            self.current_event = None;
            return None;
        }

        let event = SseEvent {
            event: self.current_event.take(),
            data: self.current_data.join("\n"),
        };
        self.current_data.clear();
        Some(event)
    }

    /// Check if there's any buffered data.
    pub fn has_buffered_data(&self) -> bool {
        !self.buffer.is_empty() || !self.current_data.is_empty()
    }
}
