//! KDL configuration parsing for the Keel CI server.
//!
//! The whole server (storage, working root, webhook secrets, builder
//! strategy, notifier channels and projects) is described by one KDL file,
//! read once at startup and immutable afterwards.

pub mod error;
mod nodes;
pub mod project;
pub mod server;

pub use error::{ConfigError, ConfigResult};
pub use server::{BuilderStrategy, ServerConfig, load_server_config, parse_server_config};
