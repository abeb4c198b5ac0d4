//! Capped capture of build output.

use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::Mutex;

pub(crate) const TRUNCATION_MARKER: &str = "\n[output truncated]\n";

/// Combined stdout/stderr, dropping bytes past `limit`.
#[derive(Debug)]
pub(crate) struct OutputBuffer {
    bytes: Vec<u8>,
    limit: usize,
    truncated: bool,
}

impl OutputBuffer {
    pub(crate) fn new(limit: usize) -> Self {
        Self {
            bytes: Vec::new(),
            limit,
            truncated: false,
        }
    }

    pub(crate) fn push(&mut self, chunk: &[u8]) {
        let room = self.limit.saturating_sub(self.bytes.len());
        if chunk.len() > room {
            self.truncated = true;
        }
        self.bytes.extend_from_slice(&chunk[..chunk.len().min(room)]);
    }

    /// The captured text and whether anything was dropped.
    pub(crate) fn finish(&self) -> (String, bool) {
        let mut text = String::from_utf8_lossy(&self.bytes).into_owned();
        if self.truncated {
            text.push_str(TRUNCATION_MARKER);
        }
        (text, self.truncated)
    }
}

/// Copy a stream into the shared buffer until EOF.
///
/// Keeps reading past the limit so the child never blocks on a full pipe.
pub(crate) async fn capture<R>(mut reader: R, buffer: Arc<Mutex<OutputBuffer>>)
where
    R: AsyncRead + Unpin,
{
    let mut chunk = [0u8; 8192];
    loop {
        match reader.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => buffer.lock().await.push(&chunk[..n]),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncates_past_limit() {
        let mut buffer = OutputBuffer::new(5);
        buffer.push(b"abc");
        buffer.push(b"defgh");
        buffer.push(b"ij");
        let (text, truncated) = buffer.finish();
        assert!(truncated);
        assert_eq!(text, format!("abcde{}", TRUNCATION_MARKER));
    }

    #[test]
    fn test_exact_limit_is_not_truncated() {
        let mut buffer = OutputBuffer::new(3);
        buffer.push(b"abc");
        assert_eq!(buffer.finish(), ("abc".to_string(), false));
    }

    #[tokio::test]
    async fn test_capture_reads_to_eof() {
        let buffer = Arc::new(Mutex::new(OutputBuffer::new(1024)));
        capture(&b"hello\nworld\n"[..], buffer.clone()).await;
        assert_eq!(buffer.lock().await.finish().0, "hello\nworld\n");
    }
}
