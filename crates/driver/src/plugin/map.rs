//! Map — Docker plugin protocol wire types and their domain conversions.

use std::collections::HashMap;
use bytes::Bytes;
use chrono::{DateTime, Datelike, Utc};
use serde::{Deserialize, Deserializer, Serialize};

use crate::pipeline::ContainerInfo;
use crate::store::{ReadConfig, StoredEntry};
use crate::transport::{encode_frame, LogEntry, TransportError};

/// Docker encodes empty maps and lists as `null`.
fn null_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct Info {
    #[serde(deserialize_with = "null_default")]
    pub config: HashMap<String, String>,
    #[serde(rename = "ContainerID")]
    pub container_id: String,
    pub container_name: String,
    #[serde(rename = "ContainerImageID")]
    pub container_image_id: String,
    pub container_image_name: String,
    #[serde(deserialize_with = "null_default")]
    pub container_env: Vec<String>,
    #[serde(deserialize_with = "null_default")]
    pub container_labels: HashMap<String, String>,
    pub log_path: String,
    pub daemon_name: String,
    pub container_created: Option<String>,
}

impl From<Info> for ContainerInfo {
    fn from(info: Info) -> Self {
        ContainerInfo {
            id: info.container_id,
            name: info.container_name,
            image_id: info.container_image_id,
            image_name: info.container_image_name,
            daemon_name: info.daemon_name,
            env: info.container_env,
            labels: info.container_labels,
            config: info.config,
            log_path: info.log_path,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct StartLoggingRequest {
    pub file: String,
    #[serde(default)]
    pub info: Info,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct StopLoggingRequest {
    pub file: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct ReadConfigWire {
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub tail: i64,
    pub follow: bool,
}

impl Default for ReadConfigWire {
    fn default() -> Self {
        Self {
            since: None,
            until: None,
            tail: -1,
            follow: false,
        }
    }
}

/// Go's zero `time.Time` means "unset".
fn non_zero(time: Option<DateTime<Utc>>) -> Option<DateTime<Utc>> {
    time.filter(|t| t.year() > 1)
}

impl From<ReadConfigWire> for ReadConfig {
    fn from(wire: ReadConfigWire) -> Self {
        ReadConfig {
            since: non_zero(wire.since),
            until: non_zero(wire.until),
            tail: wire.tail,
            follow: wire.follow,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ReadLogsRequest {
    #[serde(default)]
    pub info: Info,
    #[serde(default)]
    pub config: ReadConfigWire,
}

/// `{"Err": ""}` on success, the error text otherwise.
#[derive(Debug, Serialize, Deserialize, PartialEq)]
pub struct PluginResponse {
    #[serde(rename = "Err")]
    pub err: String,
}

impl PluginResponse {
    pub fn ok() -> Self {
        Self { err: String::new() }
    }

    pub fn error(err: impl ToString) -> Self {
        Self { err: err.to_string() }
    }
}

impl<E: ToString> From<Result<(), E>> for PluginResponse {
    fn from(result: Result<(), E>) -> Self {
        match result {
            Ok(()) => PluginResponse::ok(),
            Err(e) => PluginResponse::error(e),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ActivateResponse {
    #[serde(rename = "Implements")]
    pub implements: Vec<&'static str>,
}

#[derive(Debug, Serialize)]
pub struct Capability {
    #[serde(rename = "ReadLogs")]
    pub read_logs: bool,
}

#[derive(Debug, Serialize)]
pub struct CapabilitiesResponse {
    #[serde(rename = "Cap")]
    pub cap: Capability,
}

/// Stored entry back into the framed form `docker logs` reads.
pub fn stored_to_frame(entry: StoredEntry) -> Result<Bytes, TransportError> {
    let log_entry = LogEntry::new(
        &entry.stream,
        entry.time.timestamp_nanos_opt().unwrap_or_default(),
        entry.log.into_bytes(),
    );
    encode_frame(&log_entry)
}
