//! Infrastructure-as-code tool invocations.

use crate::{Error, Result};
use command_executor::{Command, Runner};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Write action on a stack
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StackAction {
    /// Create or update
    Deploy,
    /// Tear down
    Destroy,
}

impl StackAction {
    fn as_str(&self) -> &'static str {
        match self {
            StackAction::Deploy => "deploy",
            StackAction::Destroy => "destroy",
        }
    }
}

/// One stack invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StackRequest<'a> {
    /// Action
    pub action: StackAction,
    /// Stack name
    pub stack: &'a str,
    /// Environment context value
    pub environment: &'a str,
    /// Service context value
    pub service: &'a str,
    /// Extra `-c key=value` context, such as `desiredCount` or `imageTag`
    pub context: Vec<(&'static str, String)>,
}

impl<'a> StackRequest<'a> {
    /// Deploy `stack`
    pub fn deploy(stack: &'a str, environment: &'a str, service: &'a str) -> Self {
        Self {
            action: StackAction::Deploy,
            stack,
            environment,
            service,
            context: Vec::new(),
        }
    }

    /// Destroy `stack`
    pub fn destroy(stack: &'a str, environment: &'a str, service: &'a str) -> Self {
        Self {
            action: StackAction::Destroy,
            ..Self::deploy(stack, environment, service)
        }
    }

    /// Add a context value
    pub fn with(mut self, key: &'static str, value: impl Into<String>) -> Self {
        self.context.push((key, value.into()));
        self
    }
}

/// The external infrastructure tool
pub struct IacTool {
    runner: Arc<dyn Runner>,
    binary: String,
    outputs_file: PathBuf,
    timeout: Duration,
}

impl IacTool {
    /// Tool invoking `binary`, writing outputs to `outputs_file`
    pub fn new(
        runner: Arc<dyn Runner>,
        binary: impl Into<String>,
        outputs_file: impl Into<PathBuf>,
        timeout: Duration,
    ) -> Self {
        Self {
            runner,
            binary: binary.into(),
            outputs_file: outputs_file.into(),
            timeout,
        }
    }

    /// Where deploys write their outputs
    pub fn outputs_file(&self) -> &Path {
        &self.outputs_file
    }

    /// Command line for a request
    pub fn command(&self, request: &StackRequest<'_>) -> Command {
        let mut cmd = Command::new(&self.binary);
        cmd.arg(request.action.as_str()).arg(request.stack);
        cmd.arg("-c")
            .arg(format!("environment={}", request.environment));
        cmd.arg("-c").arg(format!("service={}", request.service));
        for (key, value) in &request.context {
            cmd.arg("-c").arg(format!("{}={}", key, value));
        }
        match request.action {
            StackAction::Deploy => {
                cmd.arg("--outputs-file")
                    .arg(&self.outputs_file)
                    .args(["--require-approval", "never"]);
            }
            StackAction::Destroy => {
                cmd.arg("--force");
            }
        }
        cmd.timeout(self.timeout);
        cmd
    }

    /// Run a request; a non-zero exit is a failure carrying the tool output
    pub async fn run(&self, request: &StackRequest<'_>) -> Result<String> {
        let cmd = self.command(request);
        info!(
            "{} {} {} for {} ({})",
            self.binary,
            request.action.as_str(),
            request.stack,
            request.service,
            request.environment
        );
        let output = self.runner.output(&cmd).await?;
        if !output.success() {
            return Err(Error::Transient(format!(
                "{} {} {} failed: {}",
                self.binary,
                request.action.as_str(),
                request.stack,
                output.failure_message()
            )));
        }
        Ok(output.stdout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use command_executor::ScriptedRunner;

    fn tool() -> IacTool {
        IacTool::new(
            Arc::new(ScriptedRunner::new()),
            "cdk",
            "cdk-outputs.json",
            Duration::from_secs(60),
        )
    }

    #[test]
    fn test_deploy_flag_contract() {
        let request = StackRequest::deploy("FleetApiBackend-prod", "prod", "api-backend")
            .with("desiredCount", "1")
            .with("imageTag", "1.4.2");
        let cmd = tool().command(&request);
        assert_eq!(
            cmd.to_string(),
            "cdk deploy FleetApiBackend-prod -c environment=prod -c service=api-backend \
             -c desiredCount=1 -c imageTag=1.4.2 --outputs-file cdk-outputs.json \
             --require-approval never"
        );
        assert_eq!(cmd.get_timeout(), Some(Duration::from_secs(60)));
    }

    #[test]
    fn test_destroy_flag_contract() {
        let request = StackRequest::destroy("FleetDatabase-prod", "prod", "database");
        assert_eq!(
            tool().command(&request).to_string(),
            "cdk destroy FleetDatabase-prod -c environment=prod -c service=database --force"
        );
    }
}
