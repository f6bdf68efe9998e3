//! Command gateway for the `ceph` and `rbd` administrative tools.
//!
//! The driver never speaks the Ceph wire protocol; every cluster operation
//! goes through this gateway as a subprocess invocation. The gateway is a
//! trait so the in-memory simulator can stand in for the real tools behind
//! the same seam.

use std::future::Future;
use std::pin::Pin;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{Result, StorageError};

/// Exit code reported when a child terminates on a signal.
const EXIT_CODE_SIGNALLED: i32 = -1;

/// Boxed stream handles used for spawned command stdio.
pub type CommandWrite = Box<dyn AsyncWrite + Send + Unpin>;
/// Boxed read handle for spawned command stdout/stderr.
pub type CommandRead = Box<dyn AsyncRead + Send + Unpin>;

/// Seam between the driver and the cluster's administrative tools.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run a command to completion and return its stdout.
    ///
    /// A non-zero exit surfaces as [`StorageError::Remote`] carrying the
    /// child's exit code and captured stderr; callers inspect the exit
    /// code rather than the stderr text.
    async fn run(
        &self,
        cancel: &CancellationToken,
        program: &str,
        args: &[String],
    ) -> Result<String>;

    /// Spawn a command with piped stdio for streaming pipelines.
    async fn spawn(
        &self,
        cancel: &CancellationToken,
        program: &str,
        args: &[String],
    ) -> Result<SpawnedCommand>;
}

/// Handles to a spawned command's stdio and exit status.
pub struct SpawnedCommand {
    /// Pipe feeding the child's stdin.
    pub stdin: Option<CommandWrite>,
    /// Pipe carrying the child's stdout.
    pub stdout: Option<CommandRead>,
    /// Pipe carrying the child's stderr.
    pub stderr: Option<CommandRead>,
    waiter: Pin<Box<dyn Future<Output = Result<i32>> + Send>>,
}

impl SpawnedCommand {
    /// Assemble a spawned command from stream handles and a waiter future
    /// resolving to the exit code.
    pub fn new(
        stdin: Option<CommandWrite>,
        stdout: Option<CommandRead>,
        stderr: Option<CommandRead>,
        waiter: impl Future<Output = Result<i32>> + Send + 'static,
    ) -> Self {
        Self {
            stdin,
            stdout,
            stderr,
            waiter: Box::pin(waiter),
        }
    }

    /// Wait for the command to exit and return its exit code.
    pub async fn wait(self) -> Result<i32> {
        self.waiter.await
    }
}

/// Production gateway running real subprocesses through tokio.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemRunner;

impl SystemRunner {
    /// Create a new system runner.
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl CommandRunner for SystemRunner {
    async fn run(
        &self,
        cancel: &CancellationToken,
        program: &str,
        args: &[String],
    ) -> Result<String> {
        debug!(program = %program, args = ?args, "Running command");

        let mut cmd = Command::new(program);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let child = cmd
            .spawn()
            .map_err(|e| StorageError::Transport(format!("Failed to execute {}: {}", program, e)))?;

        // Dropping the output future on cancellation kills the child.
        let output = tokio::select! {
            _ = cancel.cancelled() => return Err(StorageError::Cancelled),
            output = child.wait_with_output() => output,
        };

        let output = output
            .map_err(|e| StorageError::Transport(format!("Failed to wait for {}: {}", program, e)))?;

        if !output.status.success() {
            return Err(StorageError::Remote {
                exit_code: output.status.code().unwrap_or(EXIT_CODE_SIGNALLED),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    async fn spawn(
        &self,
        cancel: &CancellationToken,
        program: &str,
        args: &[String],
    ) -> Result<SpawnedCommand> {
        debug!(program = %program, args = ?args, "Spawning command");

        let mut cmd = Command::new(program);
        cmd.args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd
            .spawn()
            .map_err(|e| StorageError::Transport(format!("Failed to execute {}: {}", program, e)))?;

        let stdin = child
            .stdin
            .take()
            .map(|s| Box::new(s) as CommandWrite);
        let stdout = child
            .stdout
            .take()
            .map(|s| Box::new(s) as CommandRead);
        let stderr = child
            .stderr
            .take()
            .map(|s| Box::new(s) as CommandRead);

        let program = program.to_string();
        let cancel = cancel.clone();
        let waiter = async move {
            let status = tokio::select! {
                _ = cancel.cancelled() => None,
                status = child.wait() => Some(status),
            };

            match status {
                None => {
                    let _ = child.kill().await;
                    Err(StorageError::Cancelled)
                }
                Some(Ok(status)) => Ok(status.code().unwrap_or(EXIT_CODE_SIGNALLED)),
                Some(Err(e)) => Err(StorageError::Transport(format!(
                    "Failed to wait for {}: {}",
                    program, e
                ))),
            }
        };

        Ok(SpawnedCommand::new(stdin, stdout, stderr, waiter))
    }
}
