//! Options — per-container `--log-opt` parsing and validation.

use std::collections::HashMap;
use grep_regex::{RegexMatcher, RegexMatcherBuilder};
use thiserror::Error;
use tracing::error;

use super::model::MultilineConfig;

pub const OPT_TOKEN: &str = "logzio-token";
pub const OPT_DIR_PATH: &str = "logzio-dir-path";
pub const OPT_URL: &str = "logzio-url";
pub const OPT_TAG: &str = "logzio-tag";
pub const OPT_FORMAT: &str = "logzio-format";
pub const OPT_TYPE: &str = "logzio-type";
pub const OPT_SOURCE: &str = "logzio-source";
pub const OPT_ATTRIBUTES: &str = "logzio-attributes";
pub const OPT_LABELS: &str = "labels";
pub const OPT_ENV: &str = "env";
pub const OPT_ENV_REGEX: &str = "env-regex";

pub const OPT_MULTILINE_PATTERN: &str = "logzio-multiline-pattern";
pub const OPT_MULTILINE_NEGATE: &str = "logzio-multiline-negate";
pub const OPT_MULTILINE_MATCH: &str = "logzio-multiline-match";
pub const OPT_MULTILINE_SEPARATOR: &str = "logzio-multiline-separator";
pub const OPT_MULTILINE_MAX_LINES: &str = "logzio-multiline-max-lines";
pub const OPT_MULTILINE_MAX_BYTES: &str = "logzio-multiline-max-bytes";
pub const OPT_MULTILINE_TIMEOUT: &str = "logzio-multiline-timeout";
pub const OPT_MULTILINE_FLUSH_PATTERN: &str = "logzio-multiline-flush-pattern";

const KNOWN_OPTIONS: &[&str] = &[
    OPT_TOKEN,
    OPT_DIR_PATH,
    OPT_URL,
    OPT_TAG,
    OPT_FORMAT,
    OPT_TYPE,
    OPT_SOURCE,
    OPT_ATTRIBUTES,
    OPT_LABELS,
    OPT_ENV,
    OPT_ENV_REGEX,
    OPT_MULTILINE_PATTERN,
    OPT_MULTILINE_NEGATE,
    OPT_MULTILINE_MATCH,
    OPT_MULTILINE_SEPARATOR,
    OPT_MULTILINE_MAX_LINES,
    OPT_MULTILINE_MAX_BYTES,
    OPT_MULTILINE_TIMEOUT,
    OPT_MULTILINE_FLUSH_PATTERN,
];

pub const DEFAULT_URL: &str = "https://listener.logz.io:8071";
pub const DEFAULT_SOURCE_TYPE: &str = "logzio-docker-driver";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("wrong log-opt: '{key}' - {container_id}")]
    UnknownOption { key: String, container_id: String },
    #[error("logz.io token is required")]
    MissingToken,
    #[error("logz.io dir path is required")]
    MissingDirPath,
    #[error("invalid value {value:?} for {key}: {reason}")]
    InvalidOption {
        key: String,
        value: String,
        reason: String,
    },
    #[error("invalid tag template: {0}")]
    TagTemplate(String),
    #[error("invalid configuration: {0}")]
    Invalid(String),
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config file: {0}")]
    Toml(#[from] toml::de::Error),
}

impl ConfigError {
    pub(crate) fn invalid_option(key: &str, value: &str, reason: impl ToString) -> Self {
        ConfigError::InvalidOption {
            key: key.to_string(),
            value: value.to_string(),
            reason: reason.to_string(),
        }
    }
}

/// How the event body is placed in the outbound `message` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

impl LogFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogFormat::Text => "text",
            LogFormat::Json => "json",
        }
    }

    /// Unknown formats are logged and treated as text.
    fn from_option(value: &str) -> Self {
        match value {
            "" | "text" => LogFormat::Text,
            "json" => LogFormat::Json,
            other => {
                error!(format = %other, "Unknown logzio-format, falling back to text");
                LogFormat::Text
            }
        }
    }
}

/// Validated per-container options.
#[derive(Debug, Clone)]
pub struct LogOptions {
    pub token: String,
    pub dir_path: String,
    pub url: String,
    /// `None` means the option was not given; `Some("")` disables tags.
    pub tag: Option<String>,
    pub format: LogFormat,
    pub source_type: String,
    pub log_source: Option<String>,
    pub attributes: serde_json::Map<String, serde_json::Value>,
    pub labels: Vec<String>,
    pub env: Vec<String>,
    pub env_regex: Option<RegexMatcher>,
    pub multiline: Option<MultilineConfig>,
}

impl LogOptions {
    /// Validate and parse the raw option map Docker hands over in `Info.Config`.
    pub fn parse(opts: &HashMap<String, String>, container_id: &str) -> Result<Self, ConfigError> {
        let mut keys: Vec<&String> = opts.keys().collect();
        keys.sort();
        if let Some(key) = keys.into_iter().find(|k| !KNOWN_OPTIONS.contains(&k.as_str())) {
            return Err(ConfigError::UnknownOption {
                key: key.clone(),
                container_id: container_id.to_string(),
            });
        }

        let dir_path = non_empty(opts, OPT_DIR_PATH).ok_or(ConfigError::MissingDirPath)?;
        let token = non_empty(opts, OPT_TOKEN).ok_or(ConfigError::MissingToken)?;

        let url = non_empty(opts, OPT_URL)
            .map(|u| u.trim_end_matches('/').to_string())
            .unwrap_or_else(|| DEFAULT_URL.to_string());

        let attributes = match non_empty(opts, OPT_ATTRIBUTES) {
            Some(raw) => parse_attributes(raw)?,
            None => serde_json::Map::new(),
        };

        let env_regex = match non_empty(opts, OPT_ENV_REGEX) {
            Some(pattern) => Some(
                RegexMatcherBuilder::new()
                    .build(pattern)
                    .map_err(|e| ConfigError::invalid_option(OPT_ENV_REGEX, pattern, e))?,
            ),
            None => None,
        };

        Ok(Self {
            token: token.to_string(),
            dir_path: dir_path.to_string(),
            url,
            tag: opts.get(OPT_TAG).cloned(),
            format: LogFormat::from_option(opts.get(OPT_FORMAT).map(String::as_str).unwrap_or("")),
            source_type: non_empty(opts, OPT_TYPE)
                .unwrap_or(DEFAULT_SOURCE_TYPE)
                .to_string(),
            log_source: non_empty(opts, OPT_SOURCE).map(str::to_string),
            attributes,
            labels: split_list(opts.get(OPT_LABELS)),
            env: split_list(opts.get(OPT_ENV)),
            env_regex,
            multiline: MultilineConfig::from_options(opts)?,
        })
    }
}

fn non_empty<'a>(opts: &'a HashMap<String, String>, key: &str) -> Option<&'a str> {
    opts.get(key).map(|v| v.trim()).filter(|v| !v.is_empty())
}

fn split_list(raw: Option<&String>) -> Vec<String> {
    raw.map(|s| {
        s.split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect()
    })
    .unwrap_or_default()
}

fn parse_attributes(raw: &str) -> Result<serde_json::Map<String, serde_json::Value>, ConfigError> {
    match serde_json::from_str::<serde_json::Value>(raw) {
        Ok(serde_json::Value::Object(map)) => Ok(map),
        Ok(_) => Err(ConfigError::invalid_option(OPT_ATTRIBUTES, raw, "expected a JSON object")),
        Err(e) => Err(ConfigError::invalid_option(OPT_ATTRIBUTES, raw, e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn opts(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    fn base() -> Vec<(&'static str, &'static str)> {
        vec![(OPT_TOKEN, "secret"), (OPT_DIR_PATH, "/tmp/logzio")]
    }

    // ── required keys ───────────────────────────────────────────

    #[test]
    fn test_minimal_options() {
        let parsed = LogOptions::parse(&opts(&base()), "abc").unwrap();
        assert_eq!(parsed.token, "secret");
        assert_eq!(parsed.dir_path, "/tmp/logzio");
        assert_eq!(parsed.url, DEFAULT_URL);
        assert_eq!(parsed.source_type, DEFAULT_SOURCE_TYPE);
        assert_eq!(parsed.format, LogFormat::Text);
        assert!(parsed.tag.is_none());
        assert!(parsed.multiline.is_none());
    }

    #[test]
    fn test_missing_token() {
        let err = LogOptions::parse(&opts(&[(OPT_DIR_PATH, "/tmp")]), "abc").unwrap_err();
        assert!(matches!(err, ConfigError::MissingToken));
    }

    #[test]
    fn test_missing_dir_path() {
        let err = LogOptions::parse(&opts(&[(OPT_TOKEN, "secret")]), "abc").unwrap_err();
        assert!(matches!(err, ConfigError::MissingDirPath));
    }

    #[test]
    fn test_blank_token_is_missing() {
        let err = LogOptions::parse(&opts(&[(OPT_TOKEN, "  "), (OPT_DIR_PATH, "/tmp")]), "abc")
            .unwrap_err();
        assert!(matches!(err, ConfigError::MissingToken));
    }

    #[test]
    fn test_unknown_option_rejected() {
        let mut pairs = base();
        pairs.push(("max-size", "10m"));
        let err = LogOptions::parse(&opts(&pairs), "abc").unwrap_err();
        assert_eq!(err.to_string(), "wrong log-opt: 'max-size' - abc");
    }

    // ── optional keys ───────────────────────────────────────────

    #[test]
    fn test_unknown_format_falls_back_to_text() {
        let mut pairs = base();
        pairs.push((OPT_FORMAT, "xml"));
        let parsed = LogOptions::parse(&opts(&pairs), "abc").unwrap();
        assert_eq!(parsed.format, LogFormat::Text);
    }

    #[test]
    fn test_json_format() {
        let mut pairs = base();
        pairs.push((OPT_FORMAT, "json"));
        let parsed = LogOptions::parse(&opts(&pairs), "abc").unwrap();
        assert_eq!(parsed.format, LogFormat::Json);
    }

    #[test]
    fn test_attributes_must_be_object() {
        let mut pairs = base();
        pairs.push((OPT_ATTRIBUTES, "[1,2]"));
        assert!(LogOptions::parse(&opts(&pairs), "abc").is_err());

        let mut pairs = base();
        pairs.push((OPT_ATTRIBUTES, "{not json"));
        assert!(LogOptions::parse(&opts(&pairs), "abc").is_err());

        let mut pairs = base();
        pairs.push((OPT_ATTRIBUTES, r#"{"team":"core","tier":3}"#));
        let parsed = LogOptions::parse(&opts(&pairs), "abc").unwrap();
        assert_eq!(parsed.attributes["team"], "core");
        assert_eq!(parsed.attributes["tier"], 3);
    }

    #[test]
    fn test_lists_and_trailing_slash() {
        let mut pairs = base();
        pairs.push((OPT_LABELS, "app, tier,,"));
        pairs.push((OPT_ENV, "HOME"));
        pairs.push((OPT_URL, "https://listener-eu.logz.io:8071/"));
        let parsed = LogOptions::parse(&opts(&pairs), "abc").unwrap();
        assert_eq!(parsed.labels, vec!["app", "tier"]);
        assert_eq!(parsed.env, vec!["HOME"]);
        assert_eq!(parsed.url, "https://listener-eu.logz.io:8071");
    }

    #[test]
    fn test_empty_tag_is_kept() {
        let mut pairs = base();
        pairs.push((OPT_TAG, ""));
        let parsed = LogOptions::parse(&opts(&pairs), "abc").unwrap();
        assert_eq!(parsed.tag.as_deref(), Some(""));
    }

    #[test]
    fn test_bad_env_regex() {
        let mut pairs = base();
        pairs.push((OPT_ENV_REGEX, "(unclosed"));
        let err = LogOptions::parse(&opts(&pairs), "abc").unwrap_err();
        assert!(matches!(err, ConfigError::InvalidOption { .. }));
    }

    #[test]
    fn test_multiline_enabled_by_pattern() {
        let mut pairs = base();
        pairs.push((OPT_MULTILINE_PATTERN, "^\\s"));
        let parsed = LogOptions::parse(&opts(&pairs), "abc").unwrap();
        assert_eq!(parsed.multiline.unwrap().pattern, "^\\s");
    }
}
