//! Codec — Docker `LogEntry` protobuf messages in 4-byte length-prefixed frames.

use bytes::{Bytes, BytesMut};
use prost::Message;
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder, FramedRead, FramedWrite, LengthDelimitedCodec};
use tracing::warn;

use crate::pipeline::LogFragment;

/// Largest frame accepted from the daemon.
pub const MAX_FRAME_LENGTH: usize = 1024 * 1024;

#[derive(Clone, PartialEq, Message)]
pub struct LogEntry {
    #[prost(string, tag = "1")]
    pub source: String,
    #[prost(int64, tag = "2")]
    pub time_nano: i64,
    #[prost(bytes = "vec", tag = "3")]
    pub line: Vec<u8>,
    #[prost(bool, tag = "4")]
    pub partial: bool,
    #[prost(message, optional, tag = "5")]
    pub partial_log_metadata: Option<PartialLogEntryMetadata>,
}

#[derive(Clone, PartialEq, Message)]
pub struct PartialLogEntryMetadata {
    #[prost(bool, tag = "1")]
    pub last: bool,
    #[prost(string, tag = "2")]
    pub id: String,
    #[prost(int32, tag = "3")]
    pub ordinal: i32,
}

impl LogEntry {
    pub fn new(source: &str, time_nano: i64, line: impl Into<Vec<u8>>) -> Self {
        Self {
            source: source.to_string(),
            time_nano,
            line: line.into(),
            partial: false,
            partial_log_metadata: None,
        }
    }

    /// More entries of the same line follow this one.
    pub fn is_partial(&self) -> bool {
        self.partial || self.partial_log_metadata.as_ref().is_some_and(|m| !m.last)
    }
}

impl From<LogEntry> for LogFragment {
    fn from(entry: LogEntry) -> Self {
        let is_partial = entry.is_partial();
        LogFragment {
            source: entry.source,
            timestamp_nanos: entry.time_nano,
            bytes: entry.line,
            is_partial,
        }
    }
}

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("log stream i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("cannot encode log entry: {0}")]
    Encode(#[from] prost::EncodeError),
}

/// Length-delimited framing plus protobuf (de)serialization.
///
/// A frame whose payload is not a valid `LogEntry` is skipped with a warning;
/// framing errors end the current read.
pub struct LogEntryCodec {
    frames: LengthDelimitedCodec,
}

impl LogEntryCodec {
    pub fn new() -> Self {
        Self {
            frames: LengthDelimitedCodec::builder()
                .big_endian()
                .length_field_length(4)
                .max_frame_length(MAX_FRAME_LENGTH)
                .new_codec(),
        }
    }
}

impl Default for LogEntryCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for LogEntryCodec {
    type Item = LogEntry;
    type Error = TransportError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<LogEntry>, TransportError> {
        loop {
            let Some(frame) = self.frames.decode(src)? else {
                return Ok(None);
            };
            match LogEntry::decode(frame.freeze()) {
                Ok(entry) => return Ok(Some(entry)),
                Err(e) => warn!(error = %e, "Skipping undecodable log entry frame"),
            }
        }
    }
}

impl Encoder<&LogEntry> for LogEntryCodec {
    type Error = TransportError;

    fn encode(&mut self, entry: &LogEntry, dst: &mut BytesMut) -> Result<(), TransportError> {
        let mut payload = BytesMut::with_capacity(entry.encoded_len());
        entry.encode(&mut payload)?;
        self.frames.encode(payload.freeze(), dst)?;
        Ok(())
    }
}

impl Encoder<LogEntry> for LogEntryCodec {
    type Error = TransportError;

    fn encode(&mut self, entry: LogEntry, dst: &mut BytesMut) -> Result<(), TransportError> {
        Encoder::<&LogEntry>::encode(self, &entry, dst)
    }
}

pub type FrameReader<R> = FramedRead<R, LogEntryCodec>;
pub type FrameWriter<W> = FramedWrite<W, LogEntryCodec>;

/// One framed entry as it appears on the wire.
pub fn encode_frame(entry: &LogEntry) -> Result<Bytes, TransportError> {
    let mut buf = BytesMut::with_capacity(entry.encoded_len() + 4);
    LogEntryCodec::new().encode(entry, &mut buf)?;
    Ok(buf.freeze())
}
