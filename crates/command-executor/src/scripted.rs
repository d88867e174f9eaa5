//! Scripted runner that answers commands from a rule table and records
//! every call. Used by tests of crates that shell out.

use crate::command::Command;
use crate::error::{Error, Result};
use crate::process::CommandOutput;
use crate::runner::Runner;
use async_trait::async_trait;
use std::sync::{Mutex, PoisonError};

/// What a scripted rule answers with
#[derive(Debug, Clone)]
pub enum ScriptedResponse {
    /// Completed command output
    Output(CommandOutput),
    /// Process id for a detached spawn
    Pid(u32),
    /// Spawn failure with the given reason
    SpawnError(String),
}

#[derive(Debug)]
struct Rule {
    pattern: Vec<String>,
    response: ScriptedResponse,
    remaining: Option<usize>,
}

impl Rule {
    fn matches(&self, argv: &[String]) -> bool {
        if self.remaining == Some(0) {
            return false;
        }
        if self.pattern.is_empty() {
            return true;
        }
        argv.windows(self.pattern.len())
            .any(|window| window == self.pattern.as_slice())
    }
}

/// Runner that never touches the system
#[derive(Debug, Default)]
pub struct ScriptedRunner {
    rules: Mutex<Vec<Rule>>,
    calls: Mutex<Vec<Vec<String>>>,
}

impl ScriptedRunner {
    /// Runner that answers every command with empty successful output
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer every command whose argv contains `pattern` contiguously
    pub fn on(&self, pattern: &[&str], response: ScriptedResponse) -> &Self {
        self.push(pattern, response, None)
    }

    /// Like [`ScriptedRunner::on`] but only for the next matching call
    pub fn on_once(&self, pattern: &[&str], response: ScriptedResponse) -> &Self {
        self.push(pattern, response, Some(1))
    }

    fn push(&self, pattern: &[&str], response: ScriptedResponse, remaining: Option<usize>) -> &Self {
        self.rules
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Rule {
                pattern: pattern.iter().map(|s| s.to_string()).collect(),
                response,
                remaining,
            });
        self
    }

    /// Every argv seen so far, in call order
    pub fn calls(&self) -> Vec<Vec<String>> {
        self.calls.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Whether any recorded call contains `pattern` contiguously
    pub fn called_with(&self, pattern: &[&str]) -> bool {
        let pattern: Vec<String> = pattern.iter().map(|s| s.to_string()).collect();
        if pattern.is_empty() {
            return !self.calls().is_empty();
        }
        self.calls()
            .iter()
            .any(|argv| argv.windows(pattern.len()).any(|w| w == pattern.as_slice()))
    }

    fn respond(&self, command: &Command) -> ScriptedResponse {
        let argv = command.argv();
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(argv.clone());

        let mut rules = self.rules.lock().unwrap_or_else(PoisonError::into_inner);
        for rule in rules.iter_mut() {
            if rule.matches(&argv) {
                if let Some(n) = rule.remaining.as_mut() {
                    *n -= 1;
                }
                return rule.response.clone();
            }
        }
        ScriptedResponse::Output(CommandOutput::ok(""))
    }
}

#[async_trait]
impl Runner for ScriptedRunner {
    async fn output(&self, command: &Command) -> Result<CommandOutput> {
        match self.respond(command) {
            ScriptedResponse::Output(output) => Ok(output),
            ScriptedResponse::Pid(_) => Ok(CommandOutput::ok("")),
            ScriptedResponse::SpawnError(reason) => Err(Error::spawn_failed(reason)),
        }
    }

    async fn spawn_detached(&self, command: &Command) -> Result<u32> {
        match self.respond(command) {
            ScriptedResponse::Pid(pid) => Ok(pid),
            ScriptedResponse::Output(output) if output.success() => Ok(4242),
            ScriptedResponse::Output(output) => Err(Error::spawn_failed(output.failure_message())),
            ScriptedResponse::SpawnError(reason) => Err(Error::spawn_failed(reason)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rules_match_in_order_and_once_rules_expire() {
        smol::block_on(async {
            let runner = ScriptedRunner::new();
            runner
                .on_once(&["ps"], ScriptedResponse::Output(CommandOutput::ok("first")))
                .on(&["ps"], ScriptedResponse::Output(CommandOutput::ok("later")));

            let mut cmd = Command::new("docker");
            cmd.args(["ps", "-a"]);

            assert_eq!(runner.output(&cmd).await.unwrap().stdout, "first");
            assert_eq!(runner.output(&cmd).await.unwrap().stdout, "later");
            assert_eq!(runner.calls().len(), 2);
            assert!(runner.called_with(&["docker", "ps"]));
            assert!(!runner.called_with(&["docker", "run"]));
        });
    }
}
