//! Sender — outbound delivery of serialized events.
//!
//! A [`Sender`] is shared by every pipeline writing to the same destination.
//! `send` only enqueues; durable buffering and retries happen inside the
//! implementation.

pub mod http;
pub mod registry;
pub mod testing;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

pub use http::{HttpSender, HttpSenderConfig};
pub use registry::{fingerprint, SenderRegistry};

#[derive(Error, Debug)]
pub enum SendError {
    #[error("sender is stopped")]
    Stopped,
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("listener rejected batch with status {status}: {body}")]
    Rejected { status: u16, body: String },
    #[error("listener returned status {0}")]
    Status(u16),
    #[error("spool i/o failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid listener url {url:?}: {reason}")]
    InvalidUrl { url: String, reason: String },
}

#[async_trait]
pub trait Sender: Send + Sync {
    /// Enqueue one serialized event. Never waits on the network.
    fn send(&self, payload: Bytes) -> Result<(), SendError>;

    /// Deliver everything queued so far.
    async fn flush(&self) -> Result<(), SendError>;

    /// Final drain, then refuse further sends. Safe to call twice.
    async fn stop(&self);

    /// Drop pooled connections.
    fn close_idle_connections(&self);
}
