use serde::{Deserialize, Serialize};

/// Bounded capture of everything a script prints.
///
/// The buffer never grows past its limit: bytes beyond it are dropped and
/// the truncation flag is set.
#[derive(Debug)]
pub struct OutputBuffer {
    buf: Vec<u8>,
    limit: usize,
    truncated: bool,
}

impl OutputBuffer {
    pub fn new(limit: usize) -> Self {
        Self {
            buf: Vec::with_capacity(limit.min(8 * 1024)),
            limit,
            truncated: false,
        }
    }

    pub fn write(&mut self, bytes: &[u8]) {
        let room = self.limit.saturating_sub(self.buf.len());
        if bytes.len() <= room {
            self.buf.extend_from_slice(bytes);
        } else {
            self.buf.extend_from_slice(&bytes[..room]);
            self.truncated = true;
        }
    }

    pub fn write_str(&mut self, text: &str) {
        self.write(text.as_bytes());
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn is_truncated(&self) -> bool {
        self.truncated
    }

    /// Snapshot the captured text. A multi-byte character cut by the limit
    /// is left out.
    pub fn snapshot(&self) -> CapturedOutput {
        let text = match std::str::from_utf8(&self.buf) {
            Ok(text) => text.to_string(),
            Err(e) => String::from_utf8_lossy(&self.buf[..e.valid_up_to()]).into_owned(),
        };
        CapturedOutput {
            bytes: text.len(),
            text,
            truncated: self.truncated,
        }
    }
}

/// Output returned with every result
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapturedOutput {
    pub text: String,
    /// Byte length of `text`, never above the output ceiling
    pub bytes: usize,
    pub truncated: bool,
}

impl CapturedOutput {
    /// Cut the text back to `limit` bytes on a character boundary.
    pub(crate) fn enforce_limit(&mut self, limit: usize) {
        if self.text.len() > limit {
            let mut end = limit;
            while !self.text.is_char_boundary(end) {
                end -= 1;
            }
            self.text.truncate(end);
            self.truncated = true;
        }
        self.bytes = self.text.len();
    }
}
