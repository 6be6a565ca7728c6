//! Accumulates stage output as text, optionally mirroring it live.
//!
//! Bytes are decoded as UTF-8 incrementally: a multi-byte character split
//! across two reads is held back until its tail arrives, and invalid
//! sequences become U+FFFD. Decoded text is appended in arrival order and is
//! never reordered or dropped.

use std::io::{self, Read, Write};

/// Bytes read from the output pipe per readiness event.
pub const READ_CHUNK_SIZE: usize = 4096;

pub struct OutputSink {
    text: String,
    pending: Vec<u8>,
    mirror: Option<Box<dyn Write + Send>>,
}

impl Default for OutputSink {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for OutputSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutputSink")
            .field("len", &self.text.len())
            .field("pending", &self.pending.len())
            .field("mirrored", &self.mirror.is_some())
            .finish()
    }
}

impl OutputSink {
    pub fn new() -> Self {
        Self {
            text: String::new(),
            pending: Vec::new(),
            mirror: None,
        }
    }

    /// A sink that also writes every decoded chunk to `mirror` as it arrives.
    pub fn mirrored(mirror: Box<dyn Write + Send>) -> Self {
        Self {
            mirror: Some(mirror),
            ..Self::new()
        }
    }

    pub fn is_mirrored(&self) -> bool {
        self.mirror.is_some()
    }

    /// Append raw bytes read from the stage.
    pub fn push(&mut self, bytes: &[u8]) {
        let start = self.text.len();
        let mut pending = std::mem::take(&mut self.pending);
        pending.extend_from_slice(bytes);

        let mut rest = pending.as_slice();
        loop {
            match std::str::from_utf8(rest) {
                Ok(valid) => {
                    self.text.push_str(valid);
                    rest = &[];
                    break;
                }
                Err(e) => {
                    let (valid, after) = rest.split_at(e.valid_up_to());
                    self.text.push_str(&String::from_utf8_lossy(valid));
                    match e.error_len() {
                        Some(len) => {
                            self.text.push(char::REPLACEMENT_CHARACTER);
                            rest = &after[len..];
                        }
                        None => {
                            // Truncated sequence at the end: wait for more bytes.
                            rest = after;
                            break;
                        }
                    }
                }
            }
        }
        self.pending = rest.to_vec();

        self.mirror_from(start);
    }

    /// Flush any held-back partial character. Call once the pipe is done.
    pub fn finish(&mut self) {
        if self.pending.is_empty() {
            return;
        }
        let start = self.text.len();
        let pending = std::mem::take(&mut self.pending);
        self.text.push_str(&String::from_utf8_lossy(&pending));
        self.mirror_from(start);
    }

    /// Read from a non-blocking source until it would block or hits EOF.
    ///
    /// Returns the number of bytes consumed.
    pub fn drain_nonblocking(&mut self, mut source: impl Read) -> io::Result<usize> {
        let mut buf = [0u8; READ_CHUNK_SIZE];
        let mut total = 0;
        loop {
            match source.read(&mut buf) {
                Ok(0) => return Ok(total),
                Ok(n) => {
                    total += n;
                    self.push(&buf[..n]);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(total),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }

    pub fn as_str(&self) -> &str {
        &self.text
    }

    pub fn into_string(mut self) -> String {
        self.finish();
        std::mem::take(&mut self.text)
    }

    fn mirror_from(&mut self, start: usize) {
        let chunk = &self.text[start..];
        if chunk.is_empty() {
            return;
        }
        if let Some(mirror) = self.mirror.as_mut() {
            let res = mirror
                .write_all(chunk.as_bytes())
                .and_then(|()| mirror.flush());
            if let Err(e) = res {
                tracing::warn!(error = %e, "Output mirror failed, disabling it");
                self.mirror = None;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    struct Shared(Arc<Mutex<Vec<u8>>>);

    impl Write for Shared {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    struct Broken;

    impl Write for Broken {
        fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
            Err(io::Error::from(io::ErrorKind::BrokenPipe))
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn appends_in_order() {
        let mut sink = OutputSink::new();
        sink.push(b"one ");
        sink.push(b"two ");
        sink.push(b"three");
        assert_eq!(sink.as_str(), "one two three");
    }

    #[test]
    fn split_multibyte_character_is_reassembled() {
        let bytes = "héllo wörld".as_bytes();
        let mut sink = OutputSink::new();
        // 'é' is two bytes starting at offset 1; split between them.
        sink.push(&bytes[..2]);
        assert_eq!(sink.as_str(), "h");
        sink.push(&bytes[2..]);
        assert_eq!(sink.into_string(), "héllo wörld");
    }

    #[test]
    fn invalid_bytes_become_replacement_characters() {
        let mut sink = OutputSink::new();
        sink.push(b"ok\xffok");
        assert_eq!(sink.as_str(), "ok\u{FFFD}ok");
    }

    #[test]
    fn finish_flushes_truncated_tail() {
        let mut sink = OutputSink::new();
        sink.push(b"abc\xe2\x82");
        assert_eq!(sink.as_str(), "abc");
        sink.finish();
        assert_eq!(sink.as_str(), "abc\u{FFFD}");
    }

    #[test]
    fn mirror_sees_same_text_in_same_order() {
        let mirror = Shared::default();
        let mut sink = OutputSink::mirrored(Box::new(mirror.clone()));
        sink.push(b"step 1\n");
        sink.push("step 2 \u{2713}\n".as_bytes());

        let mirrored = String::from_utf8(mirror.0.lock().unwrap().clone()).unwrap();
        assert_eq!(mirrored, sink.as_str());
    }

    #[test]
    fn failing_mirror_does_not_lose_output() {
        let mut sink = OutputSink::mirrored(Box::new(Broken));
        sink.push(b"first");
        assert!(!sink.is_mirrored());
        sink.push(b" second");
        assert_eq!(sink.as_str(), "first second");
    }

    #[test]
    fn drain_reads_until_eof() {
        let data = vec![b'x'; READ_CHUNK_SIZE * 2 + 17];
        let mut sink = OutputSink::new();

        let n = sink.drain_nonblocking(data.as_slice()).unwrap();

        assert_eq!(n, data.len());
        assert_eq!(sink.as_str().len(), data.len());
    }
}
