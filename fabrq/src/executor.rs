//! Running job payloads.
//!
//! The worker hands each payload to a [`CommandExecutor`]. [`ShellExecutor`] runs it with
//! `sh -c` in a child process that is killed as soon as its timeout elapses.
use std::{io, process::Stdio, time::Duration};

use async_trait::async_trait;
use thiserror::Error;
use tokio::process::Command;

use crate::job::{ErrorType, JobError};

/// The result of a command that exited successfully.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionOutput {
    pub exit_code: i32,
    /// Standard output followed by standard error.
    pub output: String,
}

#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error("Command exited with status {}", exit_status(.exit_code))]
    Failed {
        exit_code: Option<i32>,
        output: String,
    },
    #[error("Command timed out after {0:?}")]
    Timeout(Duration),
    #[error("Failed to start command: {0}")]
    Spawn(#[from] io::Error),
}

fn exit_status(exit_code: &Option<i32>) -> String {
    match exit_code {
        Some(code) => code.to_string(),
        None => "unknown (killed by signal)".to_owned(),
    }
}

impl From<&ExecutionError> for JobError {
    fn from(error: &ExecutionError) -> Self {
        match error {
            ExecutionError::Failed { exit_code, output } if output.is_empty() => {
                JobError::new(ErrorType::Exit(*exit_code), error.to_string())
            }
            ExecutionError::Failed { exit_code, output } => {
                JobError::new(ErrorType::Exit(*exit_code), format!("{error}\n{output}"))
            }
            ExecutionError::Timeout(_) => JobError::new(ErrorType::Timeout, error.to_string()),
            ExecutionError::Spawn(_) => JobError::new(ErrorType::Spawn, error.to_string()),
        }
    }
}

/// Runs a job payload to completion.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CommandExecutor: Send + Sync + 'static {
    /// Run `command`, giving up after `timeout` if one is set.
    ///
    /// A non-zero exit is reported as [`ExecutionError::Failed`] and an elapsed timeout as
    /// [`ExecutionError::Timeout`].
    async fn execute(
        &self,
        command: &str,
        timeout: Option<Duration>,
    ) -> Result<ExecutionOutput, ExecutionError>;
}

/// Executes payloads with `sh -c`.
#[derive(Debug, Clone, Copy, Default)]
pub struct ShellExecutor;

#[async_trait]
impl CommandExecutor for ShellExecutor {
    async fn execute(
        &self,
        command: &str,
        timeout: Option<Duration>,
    ) -> Result<ExecutionOutput, ExecutionError> {
        let child = Command::new("sh")
            .arg("-c")
            .arg(command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        // Dropping the pending future drops the child, which kills it.
        let output = match timeout {
            Some(timeout) => tokio::time::timeout(timeout, child.wait_with_output())
                .await
                .map_err(|_| ExecutionError::Timeout(timeout))??,
            None => child.wait_with_output().await?,
        };

        let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
        combined.push_str(&String::from_utf8_lossy(&output.stderr));

        match output.status.code() {
            Some(0) => Ok(ExecutionOutput {
                exit_code: 0,
                output: combined,
            }),
            exit_code => Err(ExecutionError::Failed {
                exit_code,
                output: combined,
            }),
        }
    }
}
