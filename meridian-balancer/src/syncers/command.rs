//! Host command execution.

use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::CommandError;

/// Runs host tools on behalf of syncers and interface operations.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run `program` to completion and return its stdout.
    ///
    /// # Errors
    ///
    /// Returns an error if the program cannot be spawned or exits non-zero.
    async fn run(&self, program: &str, args: &[String]) -> Result<String, CommandError>;

    /// Run a long-lived `program` until `cancel` fires, then stop it.
    ///
    /// # Errors
    ///
    /// Returns an error if the program cannot be spawned or exits on its own.
    async fn supervise(
        &self,
        program: &str,
        args: &[String],
        cancel: CancellationToken,
    ) -> Result<(), CommandError>;
}

/// Render a command line for logs and errors.
pub fn command_line(program: &str, args: &[String]) -> String {
    let mut line = program.to_string();
    for arg in args {
        line.push(' ');
        line.push_str(arg);
    }
    line
}

/// Build an owned argument vector.
pub fn args<I, S>(parts: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: ToString,
{
    parts.into_iter().map(|p| p.to_string()).collect()
}

/// Runs commands on the host.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemRunner;

#[async_trait]
impl CommandRunner for SystemRunner {
    async fn run(&self, program: &str, args: &[String]) -> Result<String, CommandError> {
        let command = command_line(program, args);
        debug!(%command, "running");

        let output = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| CommandError {
                command: command.clone(),
                reason: e.to_string(),
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(CommandError {
                command,
                reason: format!("{}: {}", output.status, stderr.trim()),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    async fn supervise(
        &self,
        program: &str,
        args: &[String],
        cancel: CancellationToken,
    ) -> Result<(), CommandError> {
        let command = command_line(program, args);
        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| CommandError {
                command: command.clone(),
                reason: e.to_string(),
            })?;
        info!(%command, pid = child.id(), "supervising");

        tokio::select! {
            _ = cancel.cancelled() => {
                if let Err(e) = child.kill().await {
                    warn!(%command, error = %e, "failed to stop supervised process");
                }
                Ok(())
            }
            status = child.wait() => {
                let reason = match status {
                    Ok(status) => format!("exited with {status}"),
                    Err(e) => e.to_string(),
                };
                Err(CommandError { command, reason })
            }
        }
    }
}

/// Logs commands instead of running them.
#[derive(Debug, Default, Clone, Copy)]
pub struct DryRunRunner;

#[async_trait]
impl CommandRunner for DryRunRunner {
    async fn run(&self, program: &str, args: &[String]) -> Result<String, CommandError> {
        info!(command = %command_line(program, args), "dry run");
        Ok(String::new())
    }

    async fn supervise(
        &self,
        program: &str,
        args: &[String],
        cancel: CancellationToken,
    ) -> Result<(), CommandError> {
        info!(command = %command_line(program, args), "dry run, not supervising");
        cancel.cancelled().await;
        Ok(())
    }
}
