//! Incremental server-sent-events parser

/// Comment sent by Plex as soon as the stream is open
pub const CONNECTION_ESTABLISHED: &str = ": connection established";

/// Longest line kept while waiting for its newline
pub const MAX_LINE_LEN: usize = 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SseItem {
    /// Out-of-band signal that the stream is live
    Connected,
    /// Body of a complete event (`data:` lines joined with `\n`)
    Data(String),
}

#[derive(Debug, Default)]
pub struct SseParser {
    buffer: Vec<u8>,
    data_lines: Vec<String>,
}

impl SseParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds raw bytes and returns every item completed by them.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<SseItem> {
        self.buffer.extend_from_slice(chunk);
        let mut items = Vec::new();

        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let mut line: Vec<u8> = self.buffer.drain(..=pos).collect();
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            let line = String::from_utf8_lossy(&line);
            if let Some(item) = self.process_line(&line) {
                items.push(item);
            }
        }

        if self.buffer.len() > MAX_LINE_LEN {
            tracing::warn!(
                "Discarding event stream line over {} bytes without a newline",
                MAX_LINE_LEN
            );
            self.buffer.clear();
            self.data_lines.clear();
        }
        items
    }

    fn process_line(&mut self, line: &str) -> Option<SseItem> {
        if line.is_empty() {
            return self.dispatch();
        }

        if line.starts_with(':') {
            return line
                .starts_with(CONNECTION_ESTABLISHED)
                .then_some(SseItem::Connected);
        }

        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };

        // event, id and retry are valid fields but nothing downstream uses them
        if field == "data" {
            self.data_lines.push(value.to_string());
        }
        None
    }

    fn dispatch(&mut self) -> Option<SseItem> {
        if self.data_lines.is_empty() {
            return None;
        }
        let body = std::mem::take(&mut self.data_lines).join("\n");
        Some(SseItem::Data(body))
    }
}
