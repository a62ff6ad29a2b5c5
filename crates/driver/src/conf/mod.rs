//! Conf module — process tunables, per-container log options, and multiline grouping config.

pub mod model;
pub mod load;
pub mod options;
pub mod group;

pub use model::{DriverConfig, MatchMode, MultilineConfig};
pub use options::{ConfigError, LogFormat, LogOptions};
