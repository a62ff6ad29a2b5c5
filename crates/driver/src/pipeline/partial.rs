//! Partial — reassembly of fragmented log lines.
//!
//! Docker splits lines longer than 16KB into several entries flagged as
//! partial. A [`PartialBuffer`] glues them back together for one source stream
//! until the terminal fragment arrives or the buffer grows too old.

use std::time::{Duration, Instant};

use super::model::{LogFragment, LogRecord};

pub struct PartialBuffer {
    buf: Vec<u8>,
    source: String,
    timestamp_nanos: i64,
    started: Instant,
    max_bytes: usize,
    timeout: Duration,
}

impl PartialBuffer {
    pub fn new(max_bytes: usize, timeout: Duration) -> Self {
        Self {
            buf: Vec::new(),
            source: String::new(),
            timestamp_nanos: 0,
            started: Instant::now(),
            max_bytes,
            timeout,
        }
    }

    /// Append a fragment. Returns the completed record when `fragment` is
    /// terminal and something has been buffered.
    ///
    /// Bytes beyond `max_bytes` are dropped. Source and timestamp come from
    /// the first fragment of the record.
    pub fn add(&mut self, fragment: &LogFragment) -> Option<LogRecord> {
        if !fragment.bytes.is_empty() {
            if self.buf.is_empty() {
                self.source.clone_from(&fragment.source);
                self.timestamp_nanos = fragment.timestamp_nanos;
                self.started = Instant::now();
            }
            let room = self.max_bytes.saturating_sub(self.buf.len());
            let take = room.min(fragment.bytes.len());
            self.buf.extend_from_slice(&fragment.bytes[..take]);
        }

        if fragment.is_partial {
            None
        } else {
            self.flush()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// True once buffered content has waited longer than the timeout.
    pub fn is_expired(&self, now: Instant) -> bool {
        !self.buf.is_empty() && now.saturating_duration_since(self.started) > self.timeout
    }

    /// When the current record started buffering, if anything is buffered.
    pub fn pending_since(&self) -> Option<Instant> {
        (!self.buf.is_empty()).then_some(self.started)
    }

    /// Emit whatever is buffered and reset.
    pub fn flush(&mut self) -> Option<LogRecord> {
        if self.buf.is_empty() {
            return None;
        }
        let record = LogRecord {
            source: std::mem::take(&mut self.source),
            timestamp_nanos: self.timestamp_nanos,
            bytes: std::mem::take(&mut self.buf),
        };
        self.started = Instant::now();
        Some(record)
    }
}
