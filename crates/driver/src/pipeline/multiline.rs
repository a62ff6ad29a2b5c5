//! Multiline — regex-driven grouping of consecutive records into one event.
//!
//! Two policies are supported:
//! - `after`: a matching line continues the event started before it
//!   (stack traces, indented continuations)
//! - `before`: a matching line starts a new event and non-matching lines
//!   are appended to it
//!
//! `negate` inverts the pattern. An optional flush pattern closes the current
//! event on the line that matches it. Byte, line and age caps always win over
//! the matching policy.

use std::time::{Duration, Instant};
use grep_matcher::Matcher;
use grep_regex::{RegexMatcher, RegexMatcherBuilder};
use thiserror::Error;

use crate::conf::{MatchMode, MultilineConfig};
use super::model::{AggregatedEvent, LogRecord};

#[derive(Error, Debug)]
pub enum MultilineError {
    #[error("invalid multiline pattern {pattern:?}: {reason}")]
    InvalidPattern { pattern: String, reason: String },
    #[error("multiline {0} must be greater than zero")]
    InvalidLimit(&'static str),
}

#[derive(Clone)]
pub struct MultilineAggregator {
    mode: MatchMode,
    matcher: RegexMatcher,
    flush_matcher: Option<RegexMatcher>,
    negate: bool,
    separator: Vec<u8>,
    max_lines: usize,
    max_bytes: usize,
    timeout: Duration,

    buf: Vec<u8>,
    num_lines: usize,
    last_source: String,
    last_timestamp_nanos: i64,
    started: Instant,
}

fn compile(pattern: &str) -> Result<RegexMatcher, MultilineError> {
    RegexMatcherBuilder::new()
        .multi_line(false)
        .build(pattern)
        .map_err(|e| MultilineError::InvalidPattern {
            pattern: pattern.to_string(),
            reason: e.to_string(),
        })
}

impl MultilineAggregator {
    /// Compiles both patterns up front; a bad pattern fails here rather than
    /// silently never matching later.
    pub fn new(config: &MultilineConfig) -> Result<Self, MultilineError> {
        if config.max_lines == 0 {
            return Err(MultilineError::InvalidLimit("max lines"));
        }
        if config.max_bytes == 0 {
            return Err(MultilineError::InvalidLimit("max bytes"));
        }

        let matcher = compile(&config.pattern)?;
        let flush_matcher = match config.flush_pattern.as_deref() {
            Some(p) if !p.is_empty() => Some(compile(p)?),
            _ => None,
        };

        Ok(Self {
            mode: config.mode,
            matcher,
            flush_matcher,
            negate: config.negate,
            separator: config.separator.as_bytes().to_vec(),
            max_lines: config.max_lines,
            max_bytes: config.max_bytes,
            timeout: config.timeout,
            buf: Vec::new(),
            num_lines: 0,
            last_source: String::new(),
            last_timestamp_nanos: 0,
            started: Instant::now(),
        })
    }

    /// Feed one complete record. Returns the events it completed, in order.
    pub fn add(&mut self, record: LogRecord) -> Vec<AggregatedEvent> {
        let mut out = Vec::new();
        match self.mode {
            MatchMode::After => self.match_after(record, &mut out),
            MatchMode::Before => self.match_before(record, &mut out),
        }
        out
    }

    fn match_after(&mut self, record: LogRecord, out: &mut Vec<AggregatedEvent>) {
        if self.num_lines == 0 || self.is_match(&record.bytes) {
            self.append(record);
            self.finalize(out);
        } else if self.is_flush_match(&record.bytes) {
            self.append(record);
            out.extend(self.flush());
        } else {
            out.extend(self.flush());
            self.append(record);
            self.finalize(out);
        }
    }

    fn match_before(&mut self, record: LogRecord, out: &mut Vec<AggregatedEvent>) {
        if self.is_match(&record.bytes) {
            if self.num_lines > 0 {
                out.extend(self.flush());
            }
            self.append(record);
            self.finalize(out);
        } else if self.is_flush_match(&record.bytes) {
            self.append(record);
            out.extend(self.flush());
        } else if self.num_lines > 0 {
            self.append(record);
            self.finalize(out);
        } else {
            let mut event = AggregatedEvent::from(record);
            event.bytes.truncate(self.max_bytes);
            out.push(event);
        }
    }

    #[inline]
    fn is_match(&self, line: &[u8]) -> bool {
        self.negate ^ self.matcher.is_match(line).unwrap_or(false)
    }

    #[inline]
    fn is_flush_match(&self, line: &[u8]) -> bool {
        self.flush_matcher
            .as_ref()
            .map(|m| m.is_match(line).unwrap_or(false))
            .unwrap_or(false)
    }

    /// Join with the separator and truncate so the buffer never passes
    /// `max_bytes`. The line still counts even if nothing of it fit.
    fn append(&mut self, record: LogRecord) {
        if self.num_lines == 0 {
            self.started = Instant::now();
        } else {
            self.buf.extend_from_slice(&self.separator);
        }
        self.buf.extend_from_slice(&record.bytes);
        self.buf.truncate(self.max_bytes);
        self.num_lines += 1;
        self.last_source = record.source;
        self.last_timestamp_nanos = record.timestamp_nanos;
    }

    fn finalize(&mut self, out: &mut Vec<AggregatedEvent>) {
        if self.max_bytes <= self.buf.len()
            || self.num_lines >= self.max_lines
            || self.started.elapsed() > self.timeout
        {
            out.extend(self.flush());
        }
    }

    pub fn is_empty(&self) -> bool {
        self.num_lines == 0
    }

    /// True once the pending event is older than the configured timeout.
    pub fn is_expired(&self, now: Instant) -> bool {
        self.num_lines > 0 && now.saturating_duration_since(self.started) > self.timeout
    }

    pub fn pending_since(&self) -> Option<Instant> {
        (self.num_lines > 0).then_some(self.started)
    }

    /// Emit the pending event tagged with the last appended record's metadata.
    pub fn flush(&mut self) -> Option<AggregatedEvent> {
        if self.num_lines == 0 {
            return None;
        }
        let event = AggregatedEvent {
            source: std::mem::take(&mut self.last_source),
            timestamp_nanos: self.last_timestamp_nanos,
            bytes: std::mem::take(&mut self.buf),
            line_count: self.num_lines,
        };
        self.num_lines = 0;
        self.started = Instant::now();
        Some(event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn aggregator(config: MultilineConfig) -> MultilineAggregator {
        MultilineAggregator::new(&config).unwrap()
    }

    fn feed(agg: &mut MultilineAggregator, lines: &[&str]) -> Vec<String> {
        let mut out = Vec::new();
        for (i, line) in lines.iter().enumerate() {
            for event in agg.add(LogRecord::new("stdout", i as i64, *line)) {
                out.push(String::from_utf8(event.bytes).unwrap());
            }
        }
        out
    }

    fn flushed(agg: &mut MultilineAggregator) -> String {
        String::from_utf8(agg.flush().unwrap().bytes).unwrap()
    }

    // ── construction ────────────────────────────────────────────

    #[test]
    fn test_bad_pattern_rejected() {
        let err = MultilineAggregator::new(&MultilineConfig::with_pattern("(")).err().unwrap();
        assert!(matches!(err, MultilineError::InvalidPattern { .. }));

        let mut config = MultilineConfig::with_pattern("x");
        config.flush_pattern = Some("[".to_string());
        assert!(MultilineAggregator::new(&config).is_err());
    }

    #[test]
    fn test_zero_limits_rejected() {
        let mut config = MultilineConfig::with_pattern("x");
        config.max_lines = 0;
        assert!(MultilineAggregator::new(&config).is_err());
    }

    // ── after mode ──────────────────────────────────────────────

    #[test]
    fn test_after_tab_continuation() {
        let mut agg = aggregator(MultilineConfig::with_pattern("^[\\t]"));
        let out = feed(&mut agg, &["line1", "\tline1.1", "line2"]);
        assert_eq!(out, vec!["line1\n\tline1.1"]);
        assert_eq!(flushed(&mut agg), "line2");
        assert!(agg.flush().is_none());
    }

    #[test]
    fn test_after_java_stack_trace() {
        let trace = "Exception in thread \"main\" java.lang.NullPointerException\n\
                     \tat com.example.myproject.Book.getTitle(Book.java:16)\n\
                     \tat com.example.myproject.Author.getBookTitles(Author.java:25)\n\
                     \tat com.example.myproject.Bootstrap.main(Bootstrap.java:14)";
        let mut agg = aggregator(MultilineConfig::with_pattern("^[[:space:]]"));
        let lines: Vec<&str> = trace.split('\n').collect();
        assert!(feed(&mut agg, &lines).is_empty());
        let event = agg.flush().unwrap();
        assert_eq!(event.line_count, 4);
        assert_eq!(String::from_utf8(event.bytes).unwrap(), trace);
    }

    #[test]
    fn test_after_negated_timestamp() {
        let mut config = MultilineConfig::with_pattern("^\\[[0-9]{4}-[0-9]{2}-[0-9]{2}");
        config.negate = true;
        config.separator = String::new();
        let mut agg = aggregator(config);
        let out = feed(&mut agg, &[
            "[2015-08-24 11:49:14] Error occured",
            " more detail",
            "[2015-08-24 11:49:15] Next",
        ]);
        assert_eq!(out, vec!["[2015-08-24 11:49:14] Error occured more detail"]);
        assert_eq!(flushed(&mut agg), "[2015-08-24 11:49:15] Next");
    }

    #[test]
    fn test_after_flush_pattern_closes_event() {
        let mut config = MultilineConfig::with_pattern("^\\s");
        config.flush_pattern = Some("^END".to_string());
        let mut agg = aggregator(config);
        let out = feed(&mut agg, &["BEGIN", "  a", "END", "next"]);
        assert_eq!(out, vec!["BEGIN\n  a\nEND"]);
        assert_eq!(flushed(&mut agg), "next");
    }

    #[test]
    fn test_event_takes_last_record_metadata() {
        let mut agg = aggregator(MultilineConfig::with_pattern("^\\s"));
        agg.add(LogRecord::new("stdout", 10, "head"));
        agg.add(LogRecord::new("stderr", 20, " tail"));
        let event = agg.flush().unwrap();
        assert_eq!(event.source, "stderr");
        assert_eq!(event.timestamp_nanos, 20);
    }

    // ── before mode ─────────────────────────────────────────────

    #[test]
    fn test_before_timestamp_starts_event() {
        let mut config = MultilineConfig::with_pattern("^\\d{4}-");
        config.mode = MatchMode::Before;
        let mut agg = aggregator(config);
        let out = feed(&mut agg, &["2024-01-01 start", "  detail", "2024-01-02 next"]);
        assert_eq!(out, vec!["2024-01-01 start\n  detail"]);
        assert_eq!(flushed(&mut agg), "2024-01-02 next");
    }

    #[test]
    fn test_before_unmatched_first_line_passes_through() {
        let mut config = MultilineConfig::with_pattern("^START");
        config.mode = MatchMode::Before;
        let mut agg = aggregator(config);
        let events = agg.add(LogRecord::new("stdout", 1, "orphan"));
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].bytes, b"orphan");
        assert_eq!(events[0].line_count, 1);
        assert!(agg.is_empty());
    }

    #[test]
    fn test_before_flush_pattern() {
        let mut config = MultilineConfig::with_pattern("^BEGIN");
        config.mode = MatchMode::Before;
        config.flush_pattern = Some("^END".to_string());
        let mut agg = aggregator(config);
        let out = feed(&mut agg, &["BEGIN", "body", "END"]);
        assert_eq!(out, vec!["BEGIN\nbody\nEND"]);
        assert!(agg.is_empty());
    }

    // ── caps ────────────────────────────────────────────────────

    #[test]
    fn test_max_bytes_truncates_first_line() {
        let mut config = MultilineConfig::with_pattern("^\\s");
        config.max_bytes = 5;
        let mut agg = aggregator(config);
        let events = agg.add(LogRecord::new("stdout", 1, "hello world"));
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].bytes, b"hello");
    }

    #[test]
    fn test_max_bytes_truncates_appended_line_exactly() {
        let mut config = MultilineConfig::with_pattern("^\\s");
        config.max_bytes = 10;
        let mut agg = aggregator(config);
        assert!(agg.add(LogRecord::new("stdout", 1, "abcd")).is_empty());
        let events = agg.add(LogRecord::new("stdout", 2, " 123456789"));
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].bytes.len(), 10);
        assert_eq!(events[0].bytes, b"abcd\n 1234");
        assert_eq!(events[0].line_count, 2);
        assert_eq!(events[0].timestamp_nanos, 2);
    }

    #[test]
    fn test_max_lines_flushes() {
        let mut config = MultilineConfig::with_pattern("^\\s");
        config.max_lines = 2;
        let mut agg = aggregator(config);
        let out = feed(&mut agg, &["a", " b", " c"]);
        assert_eq!(out, vec!["a\n b"]);
        assert_eq!(flushed(&mut agg), " c");
    }

    #[test]
    fn test_flush_then_cap_emits_two_events() {
        let mut config = MultilineConfig::with_pattern("^\\s");
        config.max_bytes = 3;
        let mut agg = aggregator(config);
        assert!(agg.add(LogRecord::new("stdout", 1, "ab")).is_empty());
        let events = agg.add(LogRecord::new("stdout", 2, "xyzzy"));
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].bytes, b"ab");
        assert_eq!(events[1].bytes, b"xyz");
    }

    #[test]
    fn test_expiry() {
        let mut config = MultilineConfig::with_pattern("^\\s");
        config.timeout = Duration::from_millis(20);
        let mut agg = aggregator(config);
        assert!(!agg.is_expired(Instant::now()));
        agg.add(LogRecord::new("stdout", 1, "waiting"));
        assert!(agg.pending_since().is_some());
        assert!(agg.is_expired(Instant::now() + Duration::from_millis(50)));
    }

    #[test]
    fn test_elapsed_timeout_flushes_on_append() {
        let mut config = MultilineConfig::with_pattern("^\\s");
        config.timeout = Duration::from_millis(10);
        let mut agg = aggregator(config);
        agg.add(LogRecord::new("stdout", 1, "first"));
        std::thread::sleep(Duration::from_millis(25));
        let events = agg.add(LogRecord::new("stdout", 2, " late"));
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].bytes, b"first\n late");
    }
}
