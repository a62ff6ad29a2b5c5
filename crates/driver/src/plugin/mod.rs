//! Plugin — Docker logging plugin protocol served over a unix socket.

pub mod map;
pub mod route;

pub use route::router;
