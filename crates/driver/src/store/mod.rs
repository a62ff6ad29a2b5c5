//! Store — local copy of each container's log for `docker logs`.

pub mod jsonfile;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use jsonfile::LocalStore;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("log store i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("log store entry is not valid json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("log store is closed")]
    Closed,
}

/// One line of the store, in Docker's json-file layout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredEntry {
    pub log: String,
    pub stream: String,
    pub time: DateTime<Utc>,
}

/// Read-back selection, as requested by `docker logs`.
#[derive(Debug, Clone, PartialEq)]
pub struct ReadConfig {
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    /// Negative for the whole history, 0 for none of it.
    pub tail: i64,
    pub follow: bool,
}

impl Default for ReadConfig {
    fn default() -> Self {
        Self {
            since: None,
            until: None,
            tail: -1,
            follow: false,
        }
    }
}

impl ReadConfig {
    pub(crate) fn admits(&self, entry: &StoredEntry) -> bool {
        self.since.map_or(true, |since| entry.time >= since)
            && self.until.map_or(true, |until| entry.time <= until)
    }

    pub(crate) fn is_past_until(&self, entry: &StoredEntry) -> bool {
        self.until.is_some_and(|until| entry.time > until)
    }
}
