//! Model — records flowing through a container pipeline.

/// One wire-level chunk of a log line as read from the container stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogFragment {
    pub source: String,
    pub timestamp_nanos: i64,
    pub bytes: Vec<u8>,
    /// More fragments of the same record follow.
    pub is_partial: bool,
}

/// A complete, reassembled log line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    pub source: String,
    pub timestamp_nanos: i64,
    pub bytes: Vec<u8>,
}

/// One or more records merged into a single logical event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AggregatedEvent {
    pub source: String,
    pub timestamp_nanos: i64,
    pub bytes: Vec<u8>,
    pub line_count: usize,
}

impl From<LogRecord> for AggregatedEvent {
    fn from(record: LogRecord) -> Self {
        Self {
            source: record.source,
            timestamp_nanos: record.timestamp_nanos,
            bytes: record.bytes,
            line_count: 1,
        }
    }
}

impl LogFragment {
    pub fn complete(source: &str, timestamp_nanos: i64, bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            source: source.to_string(),
            timestamp_nanos,
            bytes: bytes.into(),
            is_partial: false,
        }
    }

    pub fn partial(source: &str, timestamp_nanos: i64, bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            is_partial: true,
            ..Self::complete(source, timestamp_nanos, bytes)
        }
    }
}

impl LogRecord {
    pub fn new(source: &str, timestamp_nanos: i64, bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            source: source.to_string(),
            timestamp_nanos,
            bytes: bytes.into(),
        }
    }
}

/// What Docker tells us about a container when logging starts.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerInfo {
    pub id: String,
    pub name: String,
    pub image_id: String,
    pub image_name: String,
    pub daemon_name: String,
    /// `KEY=VALUE` pairs.
    pub env: Vec<String>,
    pub labels: std::collections::HashMap<String, String>,
    /// The container's `--log-opt` map.
    pub config: std::collections::HashMap<String, String>,
    /// Where the daemon expects the local log copy; may be empty.
    pub log_path: String,
}
