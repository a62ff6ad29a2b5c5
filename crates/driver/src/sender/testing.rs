//! Testing — in-memory [`Sender`] that records payloads.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;

use super::{SendError, Sender};

#[derive(Default)]
pub struct RecordingSender {
    payloads: Mutex<Vec<Bytes>>,
    stops: AtomicUsize,
    idle_closes: AtomicUsize,
    stopped: AtomicBool,
    failing: AtomicBool,
}

impl RecordingSender {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent `send` return an error.
    pub fn fail_sends(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn payloads(&self) -> Vec<Bytes> {
        self.payloads.lock().clone()
    }

    /// Payloads parsed back into JSON values.
    pub fn json(&self) -> Vec<serde_json::Value> {
        self.payloads
            .lock()
            .iter()
            .filter_map(|p| serde_json::from_slice(p).ok())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.payloads.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.payloads.lock().is_empty()
    }

    pub fn stop_count(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }

    pub fn idle_close_count(&self) -> usize {
        self.idle_closes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Sender for RecordingSender {
    fn send(&self, payload: Bytes) -> Result<(), SendError> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(SendError::Stopped);
        }
        if self.failing.load(Ordering::SeqCst) {
            return Err(SendError::Status(503));
        }
        self.payloads.lock().push(payload);
        Ok(())
    }

    async fn flush(&self) -> Result<(), SendError> {
        Ok(())
    }

    async fn stop(&self) {
        if !self.stopped.swap(true, Ordering::SeqCst) {
            self.stops.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn close_idle_connections(&self) {
        self.idle_closes.fetch_add(1, Ordering::SeqCst);
    }
}
