//! Bounded replay buffer for session output.
//!
//! [`OutputBuffer`] keeps the most recent output chunks of a shell session so
//! an observer that detaches and later re-attaches sees the recent tail
//! instead of a blank terminal. When the buffer is full, the oldest entry is
//! evicted.

use std::collections::VecDeque;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::Serialize;

/// Which output stream produced the data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputStream {
    Stdout,
    Stderr,
    /// Synthetic messages from the session runtime (e.g. "Process exited with code 0").
    System,
}

impl OutputStream {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Stdout => "stdout",
            Self::Stderr => "stderr",
            Self::System => "system",
        }
    }
}

/// A single sequenced output chunk.
#[derive(Debug, Clone, Serialize)]
pub struct OutputEntry {
    /// Monotonically increasing sequence number (unique within a session).
    pub seq: u64,
    /// Which stream produced this entry.
    pub stream: OutputStream,
    /// The output data. Bytes that are not valid UTF-8 become U+FFFD.
    pub data: String,
    /// Unix timestamp in milliseconds when the entry was created.
    pub timestamp_ms: u64,
}

/// Fixed-capacity ring of [`OutputEntry`] items in insertion order.
#[derive(Debug)]
pub struct OutputBuffer {
    entries: VecDeque<OutputEntry>,
    next_seq: u64,
    max_entries: usize,
}

impl OutputBuffer {
    /// Create a new buffer that holds at most `max_entries` items (at least one).
    pub fn new(max_entries: usize) -> Self {
        let max_entries = max_entries.max(1);
        Self {
            entries: VecDeque::with_capacity(max_entries.min(256)),
            next_seq: 1,
            max_entries,
        }
    }

    /// Append a chunk, evicting the oldest if full. Returns the stored entry.
    pub fn push(&mut self, stream: OutputStream, data: String) -> &OutputEntry {
        let seq = self.next_seq;
        self.next_seq += 1;

        let timestamp_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |d| d.as_millis() as u64);

        if self.entries.len() >= self.max_entries {
            self.entries.pop_front();
        }

        self.entries.push_back(OutputEntry {
            seq,
            stream,
            data,
            timestamp_ms,
        });
        &self.entries[self.entries.len() - 1]
    }

    /// Current contents, oldest first. Does not consume anything.
    pub fn snapshot(&self) -> Vec<OutputEntry> {
        self.entries.iter().cloned().collect()
    }

    /// Number of entries currently held.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.max_entries
    }

    /// Sequence number the next pushed entry will get.
    pub fn next_seq(&self) -> u64 {
        self.next_seq
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn data(buf: &OutputBuffer) -> Vec<String> {
        buf.snapshot().into_iter().map(|e| e.data).collect()
    }

    #[test]
    fn test_snapshot_preserves_insertion_order() {
        let mut buf = OutputBuffer::new(10);
        buf.push(OutputStream::Stdout, "a".into());
        buf.push(OutputStream::Stderr, "b".into());
        buf.push(OutputStream::Stdout, "c".into());
        assert_eq!(data(&buf), vec!["a", "b", "c"]);
        let seqs: Vec<u64> = buf.snapshot().iter().map(|e| e.seq).collect();
        assert_eq!(seqs, vec![1, 2, 3]);
    }

    #[test]
    fn test_overflow_evicts_oldest() {
        let mut buf = OutputBuffer::new(3);
        for chunk in ["1", "2", "3", "4", "5"] {
            buf.push(OutputStream::Stdout, chunk.into());
        }
        assert_eq!(buf.len(), 3);
        assert_eq!(data(&buf), vec!["3", "4", "5"]);
        assert_eq!(buf.snapshot()[0].seq, 3);
        assert_eq!(buf.next_seq(), 6);
    }

    #[test]
    fn test_snapshot_is_non_destructive() {
        let mut buf = OutputBuffer::new(4);
        buf.push(OutputStream::Stdout, "x".into());
        let first = data(&buf);
        let second = data(&buf);
        assert_eq!(first, second);
        assert_eq!(buf.len(), 1);
    }

    #[test]
    fn test_zero_capacity_is_clamped() {
        let mut buf = OutputBuffer::new(0);
        assert_eq!(buf.capacity(), 1);
        buf.push(OutputStream::Stdout, "a".into());
        buf.push(OutputStream::Stdout, "b".into());
        assert_eq!(data(&buf), vec!["b"]);
    }

    #[test]
    fn test_empty_buffer() {
        let buf = OutputBuffer::new(5);
        assert!(buf.is_empty());
        assert!(buf.snapshot().is_empty());
    }
}
