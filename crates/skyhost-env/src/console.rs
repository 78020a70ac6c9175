//! Bounded console history

use parking_lot::Mutex;
use std::collections::VecDeque;

use skyhost_core::ConsoleLog;

/// Ring buffer of console chunks, bounded by total text size. Each chunk
/// carries a strictly increasing millisecond epoch so readers can resume
/// with [`ConsoleBuffer::read_since`].
#[derive(Debug)]
pub struct ConsoleBuffer {
    inner: Mutex<Ring>,
}

#[derive(Debug)]
struct Ring {
    chunks: VecDeque<ConsoleLog>,
    size: usize,
    capacity: usize,
    last_epoch: i64,
}

impl ConsoleBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Ring {
                chunks: VecDeque::new(),
                size: 0,
                capacity: capacity.max(1),
                last_epoch: 0,
            }),
        }
    }

    /// Append raw output and return the chunk as stored
    pub fn write(&self, data: &[u8]) -> ConsoleLog {
        let mut text = String::from_utf8_lossy(data).into_owned();
        let mut ring = self.inner.lock();

        if text.len() > ring.capacity {
            let mut cut = text.len() - ring.capacity;
            while !text.is_char_boundary(cut) {
                cut += 1;
            }
            text.drain(..cut);
        }

        let epoch = chrono::Utc::now().timestamp_millis().max(ring.last_epoch + 1);
        ring.last_epoch = epoch;

        let chunk = ConsoleLog { logs: text, epoch };
        ring.size += chunk.logs.len();
        ring.chunks.push_back(chunk.clone());

        while ring.size > ring.capacity {
            match ring.chunks.pop_front() {
                Some(old) => ring.size -= old.logs.len(),
                None => break,
            }
        }
        chunk
    }

    /// Everything written after `since`, plus the epoch to resume from
    pub fn read_since(&self, since: i64) -> (String, i64) {
        let ring = self.inner.lock();
        let mut out = String::new();
        let mut last = since;
        for chunk in ring.chunks.iter().filter(|c| c.epoch > since) {
            out.push_str(&chunk.logs);
            last = chunk.epoch;
        }
        (out, last)
    }

    pub fn read_all(&self) -> (String, i64) {
        self.read_since(i64::MIN)
    }

    pub fn clear(&self) {
        let mut ring = self.inner.lock();
        ring.chunks.clear();
        ring.size = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_since_resumes() {
        let buffer = ConsoleBuffer::new(1024);
        let first = buffer.write(b"one\n");
        buffer.write(b"two\n");

        let (all, last) = buffer.read_all();
        assert_eq!(all, "one\ntwo\n");

        let (after_first, _) = buffer.read_since(first.epoch);
        assert_eq!(after_first, "two\n");

        let (nothing, same) = buffer.read_since(last);
        assert!(nothing.is_empty());
        assert_eq!(same, last);
    }

    #[test]
    fn test_epochs_strictly_increase() {
        let buffer = ConsoleBuffer::new(1024);
        let a = buffer.write(b"a");
        let b = buffer.write(b"b");
        assert!(b.epoch > a.epoch);
    }

    #[test]
    fn test_oldest_chunks_evicted() {
        let buffer = ConsoleBuffer::new(8);
        buffer.write(b"12345");
        buffer.write(b"67890");
        let (all, _) = buffer.read_all();
        assert_eq!(all, "67890");
    }

    #[test]
    fn test_oversized_chunk_keeps_tail() {
        let buffer = ConsoleBuffer::new(4);
        buffer.write(b"abcdefgh");
        assert_eq!(buffer.read_all().0, "efgh");
    }
}
