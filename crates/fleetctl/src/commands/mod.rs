//! Command implementations.

use crate::Format;
use std::collections::BTreeMap;
use std::path::PathBuf;

pub mod fleet;
pub mod validate;

/// Everything a command needs from the command line and the process
pub struct Invocation {
    /// Configuration file in use
    pub config_path: PathBuf,
    /// Environment name
    pub environment: String,
    /// Environment snapshot taken at startup
    pub env: BTreeMap<String, String>,
    /// Directory fleetctl runs from
    pub working_directory: PathBuf,
    /// Report without acting
    pub dry_run: bool,
    /// Show raw errors and recommendations
    pub verbose: bool,
    /// Suppress informational output
    pub quiet: bool,
    /// Output format
    pub format: Format,
}
