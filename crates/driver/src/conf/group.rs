//! Group — multiline grouping options resolved from a container's log-opts.

use std::collections::HashMap;

use super::model::{MatchMode, MultilineConfig};
use super::options::{
    ConfigError, OPT_MULTILINE_FLUSH_PATTERN, OPT_MULTILINE_MATCH, OPT_MULTILINE_MAX_BYTES,
    OPT_MULTILINE_MAX_LINES, OPT_MULTILINE_NEGATE, OPT_MULTILINE_PATTERN,
    OPT_MULTILINE_SEPARATOR, OPT_MULTILINE_TIMEOUT,
};

impl MultilineConfig {
    /// Build the grouping config for a container.
    /// Returns `None` when no pattern is configured; grouping is then disabled.
    pub fn from_options(opts: &HashMap<String, String>) -> Result<Option<Self>, ConfigError> {
        let pattern = match opts.get(OPT_MULTILINE_PATTERN) {
            Some(p) if !p.is_empty() => p,
            _ => return Ok(None),
        };

        let mut config = Self::with_pattern(pattern.as_str());

        if let Some(raw) = opts.get(OPT_MULTILINE_NEGATE) {
            config.negate = raw
                .parse::<bool>()
                .map_err(|e| ConfigError::invalid_option(OPT_MULTILINE_NEGATE, raw, e))?;
        }

        if let Some(raw) = opts.get(OPT_MULTILINE_MATCH) {
            config.mode = raw
                .parse::<MatchMode>()
                .map_err(|e| ConfigError::invalid_option(OPT_MULTILINE_MATCH, raw, e))?;
        }

        if let Some(raw) = opts.get(OPT_MULTILINE_SEPARATOR) {
            config.separator = raw.clone();
        }

        if let Some(raw) = opts.get(OPT_MULTILINE_MAX_LINES) {
            config.max_lines = positive(OPT_MULTILINE_MAX_LINES, raw)?;
        }

        if let Some(raw) = opts.get(OPT_MULTILINE_MAX_BYTES) {
            config.max_bytes = positive(OPT_MULTILINE_MAX_BYTES, raw)?;
        }

        if let Some(raw) = opts.get(OPT_MULTILINE_TIMEOUT) {
            config.timeout = humantime::parse_duration(raw)
                .map_err(|e| ConfigError::invalid_option(OPT_MULTILINE_TIMEOUT, raw, e))?;
        }

        if let Some(raw) = opts.get(OPT_MULTILINE_FLUSH_PATTERN) {
            if !raw.is_empty() {
                config.flush_pattern = Some(raw.clone());
            }
        }

        Ok(Some(config))
    }
}

fn positive(key: &str, raw: &str) -> Result<usize, ConfigError> {
    match raw.parse::<usize>() {
        Ok(0) => Err(ConfigError::invalid_option(key, raw, "must be greater than zero")),
        Ok(n) => Ok(n),
        Err(e) => Err(ConfigError::invalid_option(key, raw, e)),
    }
}
