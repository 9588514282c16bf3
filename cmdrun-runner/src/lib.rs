//! Process Runner: launches one external command per runner, drains its
//! output concurrently with the wait, enforces an optional timeout and exposes
//! the terminal state, exit code and captured text.

pub mod executor;
pub mod process;
pub mod version;

pub use executor::ProcessRunner;
pub use version::{check_versions, version_request, VersionCheck};
