//! Incremental volume replication over `export-diff`/`import-diff`
//! streams.
//!
//! Sending a volume `a` with snapshots `snap0` and `snap1` from `pool1`
//! to `pool2` takes three incremental passes:
//!
//! ```text
//! rbd export-diff pool1/container_a@snapshot_snap0 - | rbd import-diff - pool2/container_a
//! rbd export-diff pool1/container_a@snapshot_snap1 --from-snap snapshot_snap0 - | rbd import-diff - pool2/container_a
//! rbd export-diff pool1/container_a --from-snap snapshot_snap1 - | rbd import-diff - pool2/container_a
//! ```
//!
//! The receiving side must have created `pool2/container_a` beforehand.

use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

use crate::cmd::{CommandRead, SpawnedCommand};
use crate::error::{Result, StorageError};

use super::CephRbdDriver;

/// Observer for bytes moved through a replication stream.
///
/// The handler receives the cumulative byte count after every write.
#[derive(Clone)]
pub struct ProgressTracker {
    handler: Arc<dyn Fn(u64) + Send + Sync>,
}

impl ProgressTracker {
    /// Create a tracker from a progress handler.
    pub fn new(handler: impl Fn(u64) + Send + Sync + 'static) -> Self {
        Self {
            handler: Arc::new(handler),
        }
    }

    fn observe(&self, total_bytes: u64) {
        (self.handler)(total_bytes);
    }
}

impl std::fmt::Debug for ProgressTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ProgressTracker")
    }
}

/// Write adapter reporting cumulative progress to a tracker.
pub struct ProgressWriter<W> {
    inner: W,
    total_bytes: u64,
    tracker: ProgressTracker,
}

impl<W> ProgressWriter<W> {
    /// Wrap a writer with a progress tracker.
    pub fn new(inner: W, tracker: ProgressTracker) -> Self {
        Self {
            inner,
            total_bytes: 0,
            tracker,
        }
    }
}

impl<W: AsyncWrite + Unpin> AsyncWrite for ProgressWriter<W> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        match Pin::new(&mut this.inner).poll_write(cx, buf) {
            Poll::Ready(Ok(written)) => {
                this.total_bytes += written as u64;
                this.tracker.observe(this.total_bytes);
                Poll::Ready(Ok(written))
            }
            other => other,
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

impl CephRbdDriver {
    /// Stream an incremental diff of `volume_name` into `conn`.
    ///
    /// With `parent_snapshot_name` only the delta since that snapshot is
    /// exported. The connection is shut down on every exit path so the
    /// remote end unblocks, including on cancellation.
    pub async fn send_volume<W>(
        &self,
        mut conn: W,
        volume_name: &str,
        parent_snapshot_name: Option<&str>,
        tracker: Option<ProgressTracker>,
    ) -> Result<()>
    where
        W: AsyncWrite + Send + Unpin,
    {
        let result = self
            .send_volume_inner(&mut conn, volume_name, parent_snapshot_name, tracker)
            .await;
        let _ = conn.shutdown().await;
        result
    }

    async fn send_volume_inner<W>(
        &self,
        conn: &mut W,
        volume_name: &str,
        parent_snapshot_name: Option<&str>,
        tracker: Option<ProgressTracker>,
    ) -> Result<()>
    where
        W: AsyncWrite + Send + Unpin,
    {
        let mut args = vec!["export-diff".to_string()];
        args.extend(self.rbd_id_args());
        args.push(volume_name.to_string());

        if let Some(parent) = parent_snapshot_name {
            args.push("--from-snap".to_string());
            args.push(parent.to_string());
        }

        // Write the diff to stdout.
        args.push("-".to_string());

        debug!(
            vol_name = %volume_name,
            vol_parent_name = ?parent_snapshot_name,
            "Sending RBD volume"
        );

        let mut child = self.runner.spawn(&self.cancel, "rbd", &args).await?;
        let mut stdout = take_stdout(&mut child)?;
        let stderr = take_stderr(&mut child)?;
        drop(child.stdin.take());

        let copy = async {
            match tracker {
                Some(tracker) => {
                    let mut writer = ProgressWriter::new(conn, tracker);
                    tokio::io::copy(&mut stdout, &mut writer).await
                }
                None => tokio::io::copy(&mut stdout, conn).await,
            }
        };

        let (copy_result, stderr_output) = tokio::select! {
            _ = self.cancel.cancelled() => return Err(StorageError::Cancelled),
            io_result = async { tokio::join!(copy, drain(stderr)) } => io_result,
        };

        let exit_code = child.wait().await?;
        if exit_code != 0 {
            return Err(StorageError::Remote {
                exit_code,
                stderr: format!("rbd export-diff failed: {}", stderr_output),
            });
        }

        copy_result
            .map_err(|e| StorageError::Transport(format!("Failed to stream RBD diff: {}", e)))?;

        Ok(())
    }

    /// Apply an incremental diff read from `conn` onto `volume_name`.
    ///
    /// The target image must already exist.
    pub async fn receive_volume<R>(
        &self,
        volume_name: &str,
        mut conn: R,
        tracker: Option<ProgressTracker>,
    ) -> Result<()>
    where
        R: AsyncRead + Send + Unpin,
    {
        let mut args = vec!["import-diff".to_string()];
        args.extend(self.rbd_id_args());
        args.push("-".to_string());
        args.push(volume_name.to_string());

        debug!(vol_name = %volume_name, "Receiving RBD volume");

        let mut child = self.runner.spawn(&self.cancel, "rbd", &args).await?;
        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| StorageError::Transport("Missing stdin pipe".to_string()))?;
        let stderr = take_stderr(&mut child)?;
        drop(child.stdout.take());

        // Forward the connection into the child's stdin, closing it so
        // import-diff sees end of stream.
        let copy = async {
            let result = match tracker {
                Some(tracker) => {
                    let mut writer = ProgressWriter::new(&mut stdin, tracker);
                    tokio::io::copy(&mut conn, &mut writer).await
                }
                None => tokio::io::copy(&mut conn, &mut stdin).await,
            };
            let _ = stdin.shutdown().await;
            drop(stdin);
            result
        };

        let (copy_result, stderr_output) = tokio::select! {
            _ = self.cancel.cancelled() => return Err(StorageError::Cancelled),
            io_result = async { tokio::join!(copy, drain(stderr)) } => io_result,
        };

        let exit_code = child.wait().await?;
        if exit_code != 0 {
            let mut detail = stderr_output;
            if let Err(copy_err) = &copy_result {
                detail = format!("{} (stream error: {})", detail, copy_err);
            }

            return Err(StorageError::Remote {
                exit_code,
                stderr: format!("rbd import-diff failed: {}", detail),
            });
        }

        copy_result
            .map_err(|e| StorageError::Transport(format!("Failed to stream RBD diff: {}", e)))?;

        Ok(())
    }

    /// Sparse-copy a volume by piping `export-diff` straight into
    /// `import-diff` in-process.
    ///
    /// Unlike a clone this introduces no dependency relation between
    /// source and target; unlike a full export only modified sectors
    /// move.
    pub async fn copy_volume_diff(
        &self,
        source_volume_name: &str,
        target_volume_name: &str,
        source_parent_snapshot: Option<&str>,
    ) -> Result<()> {
        let mut send_args = vec!["export-diff".to_string()];
        send_args.extend(self.rbd_id_args());
        send_args.push(source_volume_name.to_string());

        if let Some(parent) = source_parent_snapshot {
            send_args.push("--from-snap".to_string());
            send_args.push(parent.to_string());
        }

        send_args.push("-".to_string());

        let mut recv_args = vec!["import-diff".to_string()];
        recv_args.extend(self.rbd_id_args());
        recv_args.push("-".to_string());
        recv_args.push(target_volume_name.to_string());

        debug!(
            src_vol_name = %source_volume_name,
            vol_name = %target_volume_name,
            src_parent_snap = ?source_parent_snapshot,
            "Copying RBD volume"
        );

        let mut sender = self.runner.spawn(&self.cancel, "rbd", &send_args).await?;
        let mut receiver = self.runner.spawn(&self.cancel, "rbd", &recv_args).await?;

        let mut sender_stdout = take_stdout(&mut sender)?;
        let sender_stderr = take_stderr(&mut sender)?;
        let mut receiver_stdin = receiver
            .stdin
            .take()
            .ok_or_else(|| StorageError::Transport("Missing stdin pipe".to_string()))?;
        let receiver_stderr = take_stderr(&mut receiver)?;
        drop(sender.stdin.take());
        drop(receiver.stdout.take());

        let pump = async {
            let result = tokio::io::copy(&mut sender_stdout, &mut receiver_stdin).await;
            let _ = receiver_stdin.shutdown().await;
            drop(receiver_stdin);
            result
        };

        let (copy_result, send_stderr, recv_stderr) = tokio::select! {
            _ = self.cancel.cancelled() => return Err(StorageError::Cancelled),
            io_result = async {
                tokio::join!(pump, drain(sender_stderr), drain(receiver_stderr))
            } => io_result,
        };

        let send_exit = sender.wait().await?;
        let recv_exit = receiver.wait().await?;

        if send_exit != 0 {
            return Err(StorageError::Remote {
                exit_code: send_exit,
                stderr: format!("rbd export-diff failed: {}", send_stderr),
            });
        }

        if recv_exit != 0 {
            return Err(StorageError::Remote {
                exit_code: recv_exit,
                stderr: format!("rbd import-diff failed: {}", recv_stderr),
            });
        }

        copy_result
            .map_err(|e| StorageError::Transport(format!("Failed to stream RBD diff: {}", e)))?;

        Ok(())
    }
}

fn take_stdout(child: &mut SpawnedCommand) -> Result<CommandRead> {
    child
        .stdout
        .take()
        .ok_or_else(|| StorageError::Transport("Missing stdout pipe".to_string()))
}

fn take_stderr(child: &mut SpawnedCommand) -> Result<CommandRead> {
    child
        .stderr
        .take()
        .ok_or_else(|| StorageError::Transport("Missing stderr pipe".to_string()))
}

/// Read a stderr stream to completion.
async fn drain(mut stream: CommandRead) -> String {
    let mut buf = Vec::new();
    let _ = stream.read_to_end(&mut buf).await;
    String::from_utf8_lossy(&buf).trim().to_string()
}
