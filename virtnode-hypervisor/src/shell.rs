//! Shell command execution.

use async_trait::async_trait;
use std::sync::{Mutex, PoisonError};
use tokio::process::Command;
use tracing::{debug, error};

use crate::error::{Result, VirtError};

/// Runs host shell commands and returns their output.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run `command` through the shell. Returns combined stdout/stderr with
    /// the trailing newline stripped; a non-zero exit is a
    /// [`VirtError::Command`].
    async fn execute(&self, command: &str) -> Result<String>;
}

/// Executes commands with `sh -c` under the C locale.
#[derive(Debug, Clone)]
pub struct ShellRunner {
    shell: String,
}

impl ShellRunner {
    pub fn new() -> Self {
        Self {
            shell: "sh".to_string(),
        }
    }
}

impl Default for ShellRunner {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CommandRunner for ShellRunner {
    async fn execute(&self, command: &str) -> Result<String> {
        debug!(command = %command, "Executing command");

        let output = Command::new(&self.shell)
            .arg("-c")
            .arg(format!("exec 2>&1; {}", command))
            .env("LC_ALL", "C")
            .output()
            .await
            .map_err(|e| VirtError::Internal(format!("Failed to execute {}: {}", self.shell, e)))?;

        let text = String::from_utf8_lossy(&output.stdout)
            .trim_end_matches('\n')
            .to_string();

        if !output.status.success() {
            error!(command = %command, status = ?output.status.code(), "Command failed");
            return Err(VirtError::Command {
                command: command.to_string(),
                status: output.status.code(),
                output: text,
            });
        }

        Ok(text)
    }
}

/// Canned responses for tests and dry runs.
///
/// Each rule matches commands containing its pattern; the first match wins.
/// Unmatched commands fail with status 127.
#[derive(Debug, Default)]
pub struct ScriptedRunner {
    rules: Mutex<Vec<(String, std::result::Result<String, (i32, String)>)>>,
    executed: Mutex<Vec<String>>,
}

impl ScriptedRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer commands containing `pattern` with `output`.
    pub fn respond(self, pattern: impl Into<String>, output: impl Into<String>) -> Self {
        self.rules
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((pattern.into(), Ok(output.into())));
        self
    }

    /// Fail commands containing `pattern` with `status`.
    pub fn fail(self, pattern: impl Into<String>, status: i32, output: impl Into<String>) -> Self {
        self.rules
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((pattern.into(), Err((status, output.into()))));
        self
    }

    /// Every command executed so far, in order.
    pub fn executed(&self) -> Vec<String> {
        self.executed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl CommandRunner for ScriptedRunner {
    async fn execute(&self, command: &str) -> Result<String> {
        self.executed
            .lock()
            .map_err(|_| VirtError::Internal("Lock poisoned".to_string()))?
            .push(command.to_string());

        let rules = self
            .rules
            .lock()
            .map_err(|_| VirtError::Internal("Lock poisoned".to_string()))?;

        let outcome = rules
            .iter()
            .find(|(pattern, _)| command.contains(pattern.as_str()))
            .map(|(_, outcome)| outcome.clone())
            .unwrap_or_else(|| Err((127, format!("sh: {}: not found", command))));

        outcome.map_err(|(status, output)| VirtError::Command {
            command: command.to_string(),
            status: Some(status),
            output,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_shell_runner_output_and_status() {
        let runner = ShellRunner::new();

        let out = runner.execute("echo hello; echo oops >&2").await.unwrap();
        assert_eq!(out, "hello\noops");

        let err = runner.execute("echo broken; exit 3").await.unwrap_err();
        match err {
            VirtError::Command { status, output, .. } => {
                assert_eq!(status, Some(3));
                assert_eq!(output, "broken");
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_shell_runner_uses_c_locale() {
        let out = ShellRunner::new().execute("echo $LC_ALL").await.unwrap();
        assert_eq!(out, "C");
    }

    #[tokio::test]
    async fn test_scripted_runner() {
        let runner = ScriptedRunner::new()
            .respond("vzlist", "101")
            .fail("vzctl stop", 1, "Container is not running");

        assert_eq!(runner.execute("vzlist -H -o ctid").await.unwrap(), "101");
        assert!(runner.execute("vzctl stop 101").await.is_err());
        assert!(runner.execute("uptime").await.is_err());
        assert_eq!(runner.executed().len(), 3);
    }
}
