//! Enrich — static per-container metadata merged into every event.

use std::collections::{BTreeMap, HashMap};
use chrono::{DateTime, SecondsFormat, Utc};
use grep_matcher::Matcher;
use serde::Serialize;
use serde_json::Value;
use tracing::warn;

use crate::conf::{ConfigError, LogFormat, LogOptions};
use super::model::{AggregatedEvent, ContainerInfo};

const RESERVED_FIELDS: &[&str] = &[
    "message",
    "hostname",
    "type",
    "log_source",
    "@timestamp",
    "driver_timestamp",
    "tags",
    "lines",
    "codec",
];

const DEFAULT_TAG_TEMPLATE: &str = "{{.ID}}";

/// One outbound JSON document.
#[derive(Debug, Clone, Serialize)]
pub struct OutboundMessage {
    pub message: Value,
    pub hostname: String,
    #[serde(rename = "type")]
    pub source_type: String,
    pub log_source: String,
    #[serde(rename = "@timestamp")]
    pub timestamp: String,
    pub driver_timestamp: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub tags: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lines: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub codec: Option<&'static str>,
    /// Extra attributes and `logzio-attributes`, one key each.
    #[serde(flatten)]
    pub fields: serde_json::Map<String, Value>,
}

/// Computed once when logging starts; never mutated afterwards.
#[derive(Debug, Clone)]
pub struct Metadata {
    pub hostname: String,
    pub tags: String,
    pub source_type: String,
    pub log_source: Option<String>,
    pub fields: serde_json::Map<String, Value>,
    pub format: LogFormat,
}

impl Metadata {
    pub fn new(
        options: &LogOptions,
        info: &ContainerInfo,
        hostname: impl Into<String>,
    ) -> Result<Self, ConfigError> {
        let template = options.tag.as_deref().unwrap_or(DEFAULT_TAG_TEMPLATE);
        let tags = render_tag(template, info)?;

        let fields = merge_fields(extra_attributes(options, info), &options.attributes);

        Ok(Self {
            hostname: hostname.into(),
            tags,
            source_type: options.source_type.clone(),
            log_source: options.log_source.clone(),
            fields,
            format: options.format,
        })
    }

    /// Build the outbound document for one event.
    pub fn enrich(&self, event: &AggregatedEvent) -> OutboundMessage {
        let (message, codec) = decode_body(&event.bytes, self.format);
        let time = DateTime::<Utc>::from_timestamp_nanos(event.timestamp_nanos);

        OutboundMessage {
            message,
            hostname: self.hostname.clone(),
            source_type: self.source_type.clone(),
            log_source: self
                .log_source
                .clone()
                .unwrap_or_else(|| event.source.clone()),
            timestamp: time.to_rfc3339_opts(SecondsFormat::Millis, true),
            driver_timestamp: time.to_rfc3339_opts(SecondsFormat::Nanos, true),
            tags: self.tags.clone(),
            lines: (event.line_count > 1).then_some(event.line_count),
            codec,
            fields: self.fields.clone(),
        }
    }
}

fn keep_field(key: &str, origin: &str) -> bool {
    let reserved = RESERVED_FIELDS.contains(&key);
    if reserved {
        warn!(field = %key, origin, "Ignoring attribute that shadows a built-in field");
    }
    !reserved
}

/// Flatten extras and structured attributes into one map. On a shared key
/// the structured attribute wins.
fn merge_fields(
    extras: BTreeMap<String, String>,
    attributes: &serde_json::Map<String, Value>,
) -> serde_json::Map<String, Value> {
    let mut fields: serde_json::Map<String, Value> = extras
        .into_iter()
        .filter(|(key, _)| keep_field(key, "extra attribute"))
        .map(|(key, value)| (key, Value::String(value)))
        .collect();

    for (key, value) in attributes {
        if !keep_field(key, "logzio-attributes") {
            continue;
        }
        if let Some(previous) = fields.insert(key.clone(), value.clone()) {
            warn!(field = %key, dropped = %previous, "logzio-attributes overrides extra attribute");
        }
    }
    fields
}

fn decode_body(bytes: &[u8], format: LogFormat) -> (Value, Option<&'static str>) {
    if format == LogFormat::Json {
        if let Ok(value) = serde_json::from_slice::<Value>(bytes) {
            return (value, Some("json"));
        }
    }
    (Value::String(String::from_utf8_lossy(bytes).into_owned()), None)
}

fn short_id(id: &str) -> &str {
    let id = id.strip_prefix("sha256:").unwrap_or(id);
    id.get(..12).unwrap_or(id)
}

/// Render a Docker-style tag template such as `{{.Name}}/{{.ID}}`.
pub fn render_tag(template: &str, info: &ContainerInfo) -> Result<String, ConfigError> {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let end = after
            .find("}}")
            .ok_or_else(|| ConfigError::TagTemplate(format!("unclosed placeholder in {:?}", template)))?;
        let field = after[..end].trim();
        let value = match field {
            ".ID" => short_id(&info.id),
            ".FullID" => info.id.as_str(),
            ".Name" => info.name.trim_start_matches('/'),
            ".ImageID" => short_id(&info.image_id),
            ".ImageFullID" => info.image_id.as_str(),
            ".ImageName" => info.image_name.as_str(),
            ".DaemonName" => info.daemon_name.as_str(),
            other => {
                return Err(ConfigError::TagTemplate(format!("unknown placeholder {:?}", other)));
            }
        };
        out.push_str(value);
        rest = &after[end + 2..];
    }
    out.push_str(rest);
    Ok(out)
}

fn extra_attributes(options: &LogOptions, info: &ContainerInfo) -> BTreeMap<String, String> {
    let mut extras = BTreeMap::new();

    for name in &options.labels {
        if let Some(value) = info.labels.get(name) {
            extras.insert(name.clone(), value.clone());
        }
    }

    let env: HashMap<&str, &str> = info
        .env
        .iter()
        .filter_map(|kv| kv.split_once('='))
        .collect();

    for name in &options.env {
        if let Some(value) = env.get(name.as_str()) {
            extras.insert(name.clone(), value.to_string());
        }
    }

    if let Some(matcher) = &options.env_regex {
        for (key, value) in &env {
            if matcher.is_match(key.as_bytes()).unwrap_or(false) {
                extras.insert(key.to_string(), value.to_string());
            }
        }
    }

    extras
}
