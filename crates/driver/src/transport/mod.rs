//! Transport — the framed byte stream Docker writes container logs to.

pub mod codec;
pub mod fifo;

use tokio::io::AsyncRead;

pub use codec::{encode_frame, FrameReader, FrameWriter, LogEntry, LogEntryCodec, PartialLogEntryMetadata, TransportError};

/// Any readable source of framed log entries (a FIFO in production).
pub type LogStream = Box<dyn AsyncRead + Send + Unpin>;
