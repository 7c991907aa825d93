//! Incremental event-frame parser
//!
//! Upstream streaming bodies arrive as `data: <json>\n\n` records
//! terminated by `data: [DONE]`, but the HTTP layer hands us arbitrary
//! byte chunks that can split a record anywhere. The parser buffers
//! partial input and yields only complete frames, so feeding the same
//! byte sequence under any chunking produces the same frame sequence.

/// One complete parsed frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Payload of a `data:` record (raw JSON text, unparsed).
    Data(String),
    /// The `data: [DONE]` sentinel.
    Done,
}

/// Stateful parser over a chunked byte stream.
#[derive(Debug, Default)]
pub struct FrameParser {
    buffer: Vec<u8>,
}

impl FrameParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one chunk of bytes, returning every frame completed by it.
    ///
    /// Chunks can split a record anywhere, including inside a
    /// multi-byte codepoint, so bytes are buffered raw and decoded
    /// only per complete record.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<Frame> {
        self.buffer.extend_from_slice(chunk);
        let mut frames = Vec::new();

        // A record ends at a blank line; tolerate CRLF.
        while let Some((record, sep_len)) = find_record_end(&self.buffer) {
            let raw: Vec<u8> = self.buffer.drain(..record + sep_len).collect();
            let record_text = String::from_utf8_lossy(&raw[..record]);
            frames.extend(parse_record(&record_text));
        }
        frames
    }

    /// Whether a partial record is still buffered (diagnostics only).
    pub fn has_pending(&self) -> bool {
        !self.buffer.is_empty()
    }
}

/// Locate the end of the first complete record: offset of the blank
/// line plus its separator length.
fn find_record_end(buffer: &[u8]) -> Option<(usize, usize)> {
    let lf = find_subslice(buffer, b"\n\n").map(|i| (i, 2));
    let crlf = find_subslice(buffer, b"\r\n\r\n").map(|i| (i, 4));
    match (lf, crlf) {
        (Some((a, la)), Some((b, lb))) => {
            if a < b {
                Some((a, la))
            } else {
                Some((b, lb))
            }
        }
        (one, None) => one,
        (None, one) => one,
    }
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

/// Extract the data payload from one record's lines.
///
/// Multi-line data fields are joined with newlines per the event-stream
/// format. Non-data lines (`event:`, comments) are ignored here; the
/// consumer only needs payloads.
fn parse_record(record: &str) -> Option<Frame> {
    let mut payload: Option<String> = None;
    for line in record.lines() {
        let Some(value) = line.strip_prefix("data:") else {
            continue;
        };
        let value = value.strip_prefix(' ').unwrap_or(value);
        match payload {
            Some(ref mut p) => {
                p.push('\n');
                p.push_str(value);
            }
            None => payload = Some(value.to_string()),
        }
    }
    let payload = payload?;
    if payload == "[DONE]" {
        Some(Frame::Done)
    } else {
        Some(Frame::Data(payload))
    }
}
