//! Registry — one shared sender per listener token.
//!
//! Containers logging with the same token share a single [`Sender`]. The
//! fingerprint identifies the full destination (token, spool directory,
//! format); a second fingerprint for an already registered token is a
//! configuration conflict that is logged while the first registration wins.
//!
//! A sender whose last container is gone stays registered while its final
//! drain runs. `acquire` for that token waits for the drain to finish, so two
//! senders never work the same spool directory.

use std::collections::HashMap;
use std::sync::Arc;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{SendError, Sender};

/// Stable identifier for a destination configuration.
pub fn fingerprint(token: &str, dir: &str, format: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    hasher.update(dir.as_bytes());
    hasher.update(format.as_bytes());
    hex::encode(hasher.finalize())
}

struct Entry {
    fingerprint: String,
    sender: Arc<dyn Sender>,
    refs: usize,
}

enum Slot {
    Live(Entry),
    /// Cancelled once the stopped sender has been removed.
    Stopping(CancellationToken),
}

#[derive(Default)]
pub struct SenderRegistry {
    entries: Mutex<HashMap<String, Slot>>,
}

impl SenderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the sender registered for `token`, creating it with `factory`
    /// when none exists. The boolean is true when a new sender was built.
    ///
    /// `factory` runs under the registry lock and must not block.
    pub async fn acquire<F>(
        &self,
        token: &str,
        fingerprint: &str,
        factory: F,
    ) -> Result<(Arc<dyn Sender>, bool), SendError>
    where
        F: FnOnce() -> Result<Arc<dyn Sender>, SendError>,
    {
        loop {
            let stopping = {
                let mut entries = self.entries.lock();
                match entries.get_mut(token) {
                    Some(Slot::Live(entry)) => {
                        if entry.fingerprint != fingerprint {
                            warn!(
                                existing = %entry.fingerprint,
                                requested = %fingerprint,
                                "Sender for this token already exists with a different configuration; reusing the existing one"
                            );
                        }
                        entry.refs += 1;
                        debug!(fingerprint = %entry.fingerprint, refs = entry.refs, "Reusing sender");
                        return Ok((entry.sender.clone(), false));
                    }
                    Some(Slot::Stopping(done)) => done.clone(),
                    None => {
                        let sender = factory()?;
                        entries.insert(
                            token.to_string(),
                            Slot::Live(Entry {
                                fingerprint: fingerprint.to_string(),
                                sender: sender.clone(),
                                refs: 1,
                            }),
                        );
                        info!(fingerprint = %fingerprint, "Created sender");
                        return Ok((sender, true));
                    }
                }
            };
            debug!(fingerprint = %fingerprint, "Waiting for previous sender to finish stopping");
            stopping.cancelled().await;
        }
    }

    /// Drop one reference. The last release stops the sender and frees its
    /// connections.
    pub async fn release(&self, token: &str) {
        let finished = {
            let mut entries = self.entries.lock();
            let last = match entries.get_mut(token) {
                Some(Slot::Live(entry)) if entry.refs > 1 => {
                    entry.refs -= 1;
                    false
                }
                Some(Slot::Live(_)) => true,
                Some(Slot::Stopping(_)) | None => false,
            };
            if last {
                let done = CancellationToken::new();
                match entries.insert(token.to_string(), Slot::Stopping(done.clone())) {
                    Some(Slot::Live(entry)) => Some((entry, done)),
                    _ => None,
                }
            } else {
                None
            }
        };

        if let Some((entry, done)) = finished {
            info!(fingerprint = %entry.fingerprint, "Last container released sender, stopping");
            entry.sender.stop().await;
            entry.sender.close_idle_connections();
            self.entries.lock().remove(token);
            done.cancel();
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Live references for `token`; 0 while its sender is stopping.
    pub fn refs(&self, token: &str) -> usize {
        match self.entries.lock().get(token) {
            Some(Slot::Live(entry)) => entry.refs,
            _ => 0,
        }
    }
}
