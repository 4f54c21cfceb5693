use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};

/// Accumulated stdout/stderr text for one terminal.
///
/// Each stream is capped at `max_bytes`; once full, the oldest bytes are
/// dropped so the newest output is always retained. After `close()` the buffer
/// is frozen: reader tasks that outlive terminal removal can no longer mutate
/// it.
#[derive(Debug)]
pub struct OutputBuffer {
    stdout: Mutex<Vec<u8>>,
    stderr: Mutex<Vec<u8>>,
    closed: AtomicBool,
    max_bytes: usize,
}

impl OutputBuffer {
    pub fn new(max_bytes: usize) -> Self {
        Self {
            stdout: Mutex::new(Vec::new()),
            stderr: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
            max_bytes,
        }
    }

    pub fn append_stdout(&self, chunk: &[u8]) {
        self.append(&self.stdout, chunk);
    }

    pub fn append_stderr(&self, chunk: &[u8]) {
        self.append(&self.stderr, chunk);
    }

    fn append(&self, stream: &Mutex<Vec<u8>>, chunk: &[u8]) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        let mut buf = stream.lock().unwrap_or_else(PoisonError::into_inner);
        buf.extend_from_slice(chunk);
        if buf.len() > self.max_bytes {
            let overflow = buf.len() - self.max_bytes;
            buf.drain(0..overflow);
        }
    }

    pub fn stdout(&self) -> String {
        let buf = self.stdout.lock().unwrap_or_else(PoisonError::into_inner);
        String::from_utf8_lossy(&buf).into_owned()
    }

    pub fn stderr(&self) -> String {
        let buf = self.stderr.lock().unwrap_or_else(PoisonError::into_inner);
        String::from_utf8_lossy(&buf).into_owned()
    }

    /// Detach: subsequent appends become no-ops. Called when the terminal is
    /// removed from the registry.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_append_and_read_back() {
        let buffer = OutputBuffer::new(1024);
        buffer.append_stdout(b"hello ");
        buffer.append_stdout(b"world\n");
        buffer.append_stderr(b"oops\n");
        assert_eq!(buffer.stdout(), "hello world\n");
        assert_eq!(buffer.stderr(), "oops\n");
    }

    #[test]
    fn test_cap_drops_oldest_bytes() {
        let buffer = OutputBuffer::new(8);
        buffer.append_stdout(b"0123456789");
        assert_eq!(buffer.stdout(), "23456789");
        buffer.append_stdout(b"ab");
        assert_eq!(buffer.stdout(), "456789ab");
    }

    #[test]
    fn test_closed_buffer_rejects_appends() {
        let buffer = OutputBuffer::new(1024);
        buffer.append_stdout(b"before");
        buffer.close();
        assert!(buffer.is_closed());
        buffer.append_stdout(b"after");
        buffer.append_stderr(b"after");
        assert_eq!(buffer.stdout(), "before");
        assert_eq!(buffer.stderr(), "");
    }

    #[test]
    fn test_streams_are_independent() {
        let buffer = OutputBuffer::new(4);
        buffer.append_stdout(b"aaaaaa");
        buffer.append_stderr(b"b");
        assert_eq!(buffer.stdout(), "aaaa");
        assert_eq!(buffer.stderr(), "b");
    }
}
