use std::process::Stdio;

use tokio::process::Command;

use crate::error::{Result, SwarmError};
use crate::graph::Target;

/// Result of building one target.
#[derive(Debug)]
pub struct ExecutionOutcome {
    pub target: Target,
    pub success: bool,
    pub exit_code: Option<i32>,
    pub output: Option<String>,
    pub error: Option<String>,
}

/// Builds a single target. Minions drive this once per target, in
/// dependency order within a work unit.
///
/// Returning `Err` means the build could not be attempted at all;
/// a build that ran and failed is an `Ok` outcome with `success` false.
#[tonic::async_trait]
pub trait BuildExecutor: Send + Sync {
    async fn build_target(&self, target: &Target) -> Result<ExecutionOutcome>;
}

/// Runs a shell command per target, with `{target}` substituted.
#[derive(Debug, Clone)]
pub struct CommandExecutor {
    command_template: String,
}

impl CommandExecutor {
    pub fn new(command_template: impl Into<String>) -> Self {
        Self {
            command_template: command_template.into(),
        }
    }

    fn render(&self, target: &Target) -> String {
        self.command_template.replace("{target}", target.as_str())
    }

    fn process_output(target: &Target, output: std::process::Output) -> ExecutionOutcome {
        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();
        let exit_code = output.status.code();
        let success = output.status.success();

        let error = if success {
            None
        } else if stderr.is_empty() {
            Some(format!("Exit code: {:?}", exit_code))
        } else {
            Some(stderr)
        };

        tracing::info!(
            target = %target,
            success,
            exit_code = ?exit_code,
            "Target build finished"
        );

        ExecutionOutcome {
            target: target.clone(),
            success,
            exit_code,
            output: if stdout.is_empty() { None } else { Some(stdout) },
            error,
        }
    }
}

#[tonic::async_trait]
impl BuildExecutor for CommandExecutor {
    async fn build_target(&self, target: &Target) -> Result<ExecutionOutcome> {
        let command = self.render(target);
        tracing::info!(target = %target, command, "Building target");

        let result = Command::new("sh")
            .arg("-c")
            .arg(&command)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await;

        match result {
            Ok(output) => Ok(Self::process_output(target, output)),
            Err(e) => {
                tracing::error!(target = %target, error = %e, "Could not run build command");
                Err(SwarmError::Execution {
                    target: target.to_string(),
                    reason: e.to_string(),
                })
            }
        }
    }
}

/// Executor that builds nothing and reports success. Useful for dry
/// runs and for exercising the scheduling path without a toolchain.
#[derive(Debug, Clone, Default)]
pub struct NoopExecutor;

#[tonic::async_trait]
impl BuildExecutor for NoopExecutor {
    async fn build_target(&self, target: &Target) -> Result<ExecutionOutcome> {
        tracing::debug!(target = %target, "Noop build");
        Ok(ExecutionOutcome {
            target: target.clone(),
            success: true,
            exit_code: Some(0),
            output: None,
            error: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn command_executor_reports_success_and_output() {
        let executor = CommandExecutor::new("echo built {target}");
        let outcome = executor
            .build_target(&Target::from("//app:lib"))
            .await
            .unwrap();
        assert!(outcome.success);
        assert_eq!(outcome.exit_code, Some(0));
        assert!(outcome.output.unwrap().contains("//app:lib"));
        assert!(outcome.error.is_none());
    }

    #[tokio::test]
    async fn command_executor_reports_failure_exit_code() {
        let executor = CommandExecutor::new("exit 3");
        let outcome = executor
            .build_target(&Target::from("//app:broken"))
            .await
            .unwrap();
        assert!(!outcome.success);
        assert_eq!(outcome.exit_code, Some(3));
        assert!(outcome.error.is_some());
    }

    #[tokio::test]
    async fn noop_executor_always_succeeds() {
        let outcome = NoopExecutor
            .build_target(&Target::from("//app:anything"))
            .await
            .unwrap();
        assert!(outcome.success);
    }
}
