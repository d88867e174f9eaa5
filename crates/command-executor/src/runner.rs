//! Runners execute [`Command`]s and report their output.

use crate::command::Command;
use crate::error::{Error, Result};
use crate::process::CommandOutput;
use async_io::Timer;
use async_process::{Command as AsyncCommand, Stdio};
use async_trait::async_trait;
use futures_lite::FutureExt;
use std::time::Duration;
use tracing::debug;

/// Executes commands on behalf of platform strategies
#[async_trait]
pub trait Runner: Send + Sync {
    /// Run a command to completion and capture its output
    ///
    /// A non-zero exit code is not an error; callers inspect
    /// [`CommandOutput::success`]. Errors mean the command could not be
    /// run at all or exceeded its time bound.
    async fn output(&self, command: &Command) -> Result<CommandOutput>;

    /// Start a long-running process that outlives this invocation
    ///
    /// Returns the process id. On unix the process leads a new process
    /// group, so the id is also the group id. Output goes to the command's
    /// log file when one is set, otherwise it is discarded.
    async fn spawn_detached(&self, command: &Command) -> Result<u32>;
}

/// Runner for processes on the local machine
#[derive(Debug, Clone)]
pub struct LocalRunner {
    timeout: Option<Duration>,
}

impl LocalRunner {
    /// Runner without a time bound
    pub fn new() -> Self {
        Self { timeout: None }
    }

    /// Runner that fails commands running longer than `timeout`
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout: Some(timeout),
        }
    }

    /// Configured time bound
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }
}

impl Default for LocalRunner {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Runner for LocalRunner {
    async fn output(&self, command: &Command) -> Result<CommandOutput> {
        let program = command.get_program().to_string_lossy().into_owned();
        debug!("Running: {}", command);

        let mut cmd = command.prepare();
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let child = cmd
            .spawn()
            .map_err(|e| Error::from_spawn(&program, e))?;

        let finished = async { child.output().await.map_err(Error::from) };
        let output = match command.get_timeout().or(self.timeout) {
            Some(limit) => {
                let label = command.to_string();
                finished
                    .or(async move {
                        Timer::after(limit).await;
                        Err(Error::TimedOut {
                            command: label,
                            after: limit,
                        })
                    })
                    .await?
            }
            None => finished.await?,
        };

        let result = CommandOutput {
            status: output.status.into(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        };
        debug!("{} exited with {:?}", program, result.status.code);
        Ok(result)
    }

    async fn spawn_detached(&self, command: &Command) -> Result<u32> {
        let program = command.get_program().to_string_lossy().into_owned();
        debug!("Spawning detached: {}", command);

        let mut std_cmd = command.prepare_std();
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            std_cmd.process_group(0);
        }
        let mut cmd = AsyncCommand::from(std_cmd);
        cmd.stdin(Stdio::null());

        match command.get_log_file() {
            Some(path) => {
                if let Some(parent) = path.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                let stdout = std::fs::OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)?;
                let stderr = stdout.try_clone()?;
                cmd.stdout(Stdio::from(stdout)).stderr(Stdio::from(stderr));
            }
            None => {
                cmd.stdout(Stdio::null()).stderr(Stdio::null());
            }
        }

        // Dropping the child does not kill it; the process keeps running
        // after this invocation exits.
        let child = cmd
            .spawn()
            .map_err(|e| Error::from_spawn(&program, e))?;
        Ok(child.id())
    }
}
