/// Reassembles `data:` payloads from a server-sent-event byte stream.
/// Network chunks can split an event anywhere, so bytes are buffered until a
/// full line is available. Comment lines and other fields are dropped.
#[derive(Debug, Default)]
pub struct SseLineBuffer {
    buf: Vec<u8>,
}

impl SseLineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    /// Next complete `data:` payload, if one is buffered.
    pub fn next_data(&mut self) -> Option<String> {
        while let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.buf.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&line);
            let line = line.trim_end_matches(['\n', '\r']);

            if let Some(data) = line.strip_prefix("data:") {
                return Some(data.trim_start().to_string());
            }
            // Event separators, comments, and named fields carry nothing we use.
        }
        None
    }
}
