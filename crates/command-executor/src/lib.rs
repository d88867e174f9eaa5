//! Subprocess execution for fleetctl.
//!
//! Every platform strategy that shells out (container runtime, infrastructure
//! tool, cloud provider CLI, local processes) goes through the [`Runner`]
//! trait so that tests can substitute a scripted implementation.

#![warn(missing_docs)]

pub mod command;
pub mod error;
pub mod process;
pub mod runner;
#[cfg(any(test, feature = "test-utils"))]
pub mod scripted;

pub use command::Command;
pub use error::{Error, Result};
pub use process::{CommandOutput, ExitStatus};
pub use runner::{LocalRunner, Runner};
#[cfg(any(test, feature = "test-utils"))]
pub use scripted::{ScriptedResponse, ScriptedRunner};
