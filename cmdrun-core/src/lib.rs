pub mod config;
pub mod error;
pub mod models;

pub use config::Config;
pub use error::{CmdRunError, Result};
pub use models::*;

/// Version identifier shared by every binary built from this workspace.
///
/// Injected at build time from the workspace package version; tools that honor
/// the `--version` contract print exactly this string.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
