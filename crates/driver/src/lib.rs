// Domain-driven module structure for the Logz.io Docker logging driver.

// Core infrastructure
pub mod error;
pub mod conf;
pub mod transport;
pub mod store;

// Domain modules
pub mod pipeline;
pub mod sender;
pub mod plugin;
pub mod runtime;
