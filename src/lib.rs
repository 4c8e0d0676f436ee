//! slapdtest - disposable slapd servers
//!
//! Stands up an ephemeral OpenLDAP slapd instance with a private working
//! tree for integration tests, and tears it down cleanly afterward.

pub mod commands;
pub mod config;
pub mod paths;
pub mod server;

mod cleanup;

pub use commands::{CommandError, CommandOutput};
pub use config::{ConfigError, ServerConfig, ServerOptions};
pub use paths::ToolPaths;
pub use server::{ServerInfo, SlapdServer, StartError};
