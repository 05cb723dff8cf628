/// Field prefix that marks a significant event-stream line.
pub const DATA_FIELD: &str = "data:";

/// Incremental line splitter for an event-stream body.
///
/// Bytes are buffered rather than text so a multi-byte character split
/// across two chunks is decoded once both halves have arrived. A trailing
/// partial line stays buffered until its newline shows up.
#[derive(Debug, Default)]
pub struct LineFramer {
    buffer: Vec<u8>,
}

impl LineFramer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one chunk and return every line it completed, in order.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(chunk);

        let mut lines = Vec::new();
        let mut start = 0;
        while let Some(offset) = self.buffer[start..].iter().position(|&b| b == b'\n') {
            let end = start + offset;
            lines.push(decode_line(&self.buffer[start..end]));
            start = end + 1;
        }
        self.buffer.drain(..start);
        lines
    }

    /// Take whatever is left once the body has ended.
    pub fn finish(&mut self) -> Option<String> {
        if self.buffer.is_empty() {
            return None;
        }
        let rest = std::mem::take(&mut self.buffer);
        Some(decode_line(&rest))
    }

    /// Bytes waiting for a newline.
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }
}

fn decode_line(bytes: &[u8]) -> String {
    let bytes = bytes.strip_suffix(b"\r").unwrap_or(bytes);
    String::from_utf8_lossy(bytes).into_owned()
}

/// Payload of a `data:` line. Blank lines, comments and other fields yield None.
pub fn data_payload(line: &str) -> Option<&str> {
    let rest = line.strip_prefix(DATA_FIELD)?;
    let payload = rest.trim();
    if payload.is_empty() {
        None
    } else {
        Some(payload)
    }
}
