//! Bounded output sinks shared between a runner and the driver's flusher.
//!
//! Runners write line-oriented chunks as they arrive; the driver
//! periodically persists the dirty tail into the step execution row. The
//! buffer keeps only the last `max_bytes` bytes, which bounds both memory
//! and row size and provides back-pressure-free streaming.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

#[derive(Debug)]
struct OutputBuffer {
    tail: VecDeque<u8>,
    max_bytes: usize,
    truncated: bool,
    dirty: bool,
}

/// Clonable handle to a bounded output buffer. A step's stdout and stderr
/// sinks are clones of the same handle, interleaving into one tail.
#[derive(Debug, Clone)]
pub struct OutputSink {
    inner: Arc<Mutex<OutputBuffer>>,
}

impl OutputSink {
    pub fn new(max_bytes: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(OutputBuffer {
                tail: VecDeque::with_capacity(max_bytes.min(4096)),
                max_bytes: max_bytes.max(1),
                truncated: false,
                dirty: false,
            })),
        }
    }

    pub fn write(&self, bytes: &[u8]) {
        if bytes.is_empty() {
            return;
        }

        let mut buf = self.inner.lock().unwrap();
        buf.dirty = true;

        for &byte in bytes {
            if buf.tail.len() == buf.max_bytes {
                buf.tail.pop_front();
                buf.truncated = true;
            }
            buf.tail.push_back(byte);
        }
    }

    /// Current tail as lossy UTF-8, prefixed with an ellipsis marker when
    /// earlier output has been dropped.
    pub fn contents(&self) -> String {
        let buf = self.inner.lock().unwrap();
        render(&buf)
    }

    /// Returns the tail only if new output arrived since the last call,
    /// clearing the dirty flag.
    pub fn take_if_dirty(&self) -> Option<String> {
        let mut buf = self.inner.lock().unwrap();
        if !buf.dirty {
            return None;
        }
        buf.dirty = false;
        Some(render(&buf))
    }
}

fn render(buf: &OutputBuffer) -> String {
    let (front, back) = buf.tail.as_slices();
    let mut bytes = Vec::with_capacity(front.len() + back.len());
    bytes.extend_from_slice(front);
    bytes.extend_from_slice(back);

    let text = String::from_utf8_lossy(&bytes).into_owned();
    if buf.truncated {
        format!("[...]{text}")
    } else {
        text
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collects_written_chunks() {
        let sink = OutputSink::new(1024);
        sink.write(b"hello ");
        sink.write(b"world\n");
        assert_eq!(sink.contents(), "hello world\n");
    }

    #[test]
    fn keeps_only_the_tail() {
        let sink = OutputSink::new(8);
        sink.write(b"0123456789abcdef");
        assert_eq!(sink.contents(), "[...]89abcdef");
    }

    #[test]
    fn dirty_flag_tracks_new_output() {
        let sink = OutputSink::new(64);
        assert!(sink.take_if_dirty().is_none());

        sink.write(b"line\n");
        assert_eq!(sink.take_if_dirty().as_deref(), Some("line\n"));
        assert!(sink.take_if_dirty().is_none());

        sink.write(b"more\n");
        assert_eq!(sink.take_if_dirty().as_deref(), Some("line\nmore\n"));
    }

    #[test]
    fn clones_share_the_buffer() {
        let stdout = OutputSink::new(64);
        let stderr = stdout.clone();

        stdout.write(b"out");
        stderr.write(b"err");
        assert_eq!(stdout.contents(), "outerr");
    }
}
