// Bounded capture of a program's output streams

/// Keeps the first `limit` bytes of a stream and counts the rest.
///
/// Callers keep feeding chunks after the cap is hit so the producer never
/// blocks on a full pipe; the excess is only counted.
#[derive(Debug)]
pub struct CappedOutput {
    bytes: Vec<u8>,
    limit: usize,
    omitted: usize,
}

impl CappedOutput {
    pub fn new(limit: usize) -> Self {
        Self {
            bytes: Vec::new(),
            limit,
            omitted: 0,
        }
    }

    pub fn push(&mut self, chunk: &[u8]) {
        let room = self.limit.saturating_sub(self.bytes.len());
        let kept = chunk.len().min(room);
        self.bytes.extend_from_slice(&chunk[..kept]);
        self.omitted += chunk.len() - kept;
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn is_truncated(&self) -> bool {
        self.omitted > 0
    }

    pub fn omitted(&self) -> usize {
        self.omitted
    }

    /// Lossy UTF-8 text, with a trailing note when bytes were dropped
    pub fn to_text(&self) -> String {
        let mut text = String::from_utf8_lossy(&self.bytes).into_owned();
        if self.is_truncated() {
            text.push_str(&truncation_note(self.omitted));
        }
        text
    }
}

pub fn truncation_note(omitted: usize) -> String {
    format!("\n[output truncated: {} bytes omitted]", omitted)
}
