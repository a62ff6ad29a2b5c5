//! Error — crate-level error taxonomy.
//!
//! Each concern owns a narrow error enum; [`DriverError`] is what the
//! plugin surface (`StartLogging`, `StopLogging`, `ReadLogs`) reports.

use thiserror::Error;

use crate::conf::ConfigError;
use crate::pipeline::multiline::MultilineError;
use crate::sender::SendError;
use crate::store::StoreError;

#[derive(Error, Debug)]
pub enum DriverError {
    #[error("error in one of the logger options: {0}")]
    Config(#[from] ConfigError),
    #[error("invalid multiline configuration: {0}")]
    Multiline(#[from] MultilineError),
    #[error("logger for {0:?} already exists")]
    AlreadyExists(String),
    #[error("logger does not exist for {0}")]
    NotFound(String),
    #[error("error opening logger fifo {path:?}: {source}")]
    Stream {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("error creating local log store: {0}")]
    Store(#[from] StoreError),
    #[error("error creating sender: {0}")]
    Sender(#[from] SendError),
    #[error("cannot access hostname to set source field: {0}")]
    Hostname(std::io::Error),
}

pub type DriverResult<T> = Result<T, DriverError>;
