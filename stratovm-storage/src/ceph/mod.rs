//! Ceph RBD storage driver core.
//!
//! This driver mediates between volume lifecycle requests and the `rbd`
//! and `ceph` command line tools against an OSD pool. It owns the RBD
//! image naming discipline, the zombie dependency graph and its garbage
//! collection, kernel mapping lifecycle, and diff-based replication.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                     CephRbdDriver                        │
//! │  naming ── primitives ── mapping ── GC ── replication    │
//! └─────────────────────────┬────────────────────────────────┘
//!                           │
//!                    ┌──────┴───────┐
//!                    ▼              ▼
//!             ┌────────────┐ ┌────────────┐
//!             │SystemRunner│ │ SimCluster │
//!             │ (rbd/ceph) │ │ (in-memory)│
//!             └────────────┘ └────────────┘
//! ```
//!
//! Callers are expected to serialize operations per image; the driver is
//! reentrant but performs no internal locking.

mod cluster;
mod gc;
mod mapping;
mod name;
mod rbd;
mod refresh;
mod replication;

pub use cluster::build_mount;
pub use gc::DeleteResult;
pub use name::{parse_clone, parse_parent, rbd_image_name, ParsedClone};
pub use refresh::find_last_common_snapshot_index;
pub use replication::{ProgressTracker, ProgressWriter};

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::cmd::{CommandRunner, SystemRunner};
use crate::error::Result;
use crate::types::CephRbdConfig;

/// Ceph RBD storage driver.
///
/// All persistent state lives inside the Ceph cluster as RBD images and
/// snapshots; the driver itself only carries its immutable configuration.
pub struct CephRbdDriver {
    config: CephRbdConfig,
    runner: Arc<dyn CommandRunner>,
    cancel: CancellationToken,
}

impl CephRbdDriver {
    /// Create a driver shelling out to the real `rbd`/`ceph` tools.
    pub fn new(config: CephRbdConfig) -> Self {
        Self::with_runner(config, Arc::new(SystemRunner::new()))
    }

    /// Create a driver on top of a custom command runner.
    pub fn with_runner(config: CephRbdConfig, runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            config,
            runner,
            cancel: CancellationToken::new(),
        }
    }

    /// Driver configuration.
    pub fn config(&self) -> &CephRbdConfig {
        &self.config
    }

    /// Token cancelling every in-flight and future subprocess invocation
    /// of this driver.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Identity arguments for `rbd` invocations.
    fn rbd_id_args(&self) -> Vec<String> {
        vec![
            "--id".to_string(),
            self.config.user_name.clone(),
            "--cluster".to_string(),
            self.config.cluster_name.clone(),
        ]
    }

    /// Identity arguments plus the driver's pool for pool-scoped `rbd`
    /// invocations.
    fn rbd_pool_args(&self) -> Vec<String> {
        let mut args = self.rbd_id_args();
        args.push("--pool".to_string());
        args.push(self.config.pool_name.clone());
        args
    }

    /// Identity arguments for `ceph` invocations.
    fn ceph_name_args(&self) -> Vec<String> {
        vec![
            "--name".to_string(),
            format!("client.{}", self.config.user_name),
            "--cluster".to_string(),
            self.config.cluster_name.clone(),
        ]
    }

    async fn run_rbd(&self, args: Vec<String>) -> Result<String> {
        self.runner.run(&self.cancel, "rbd", &args).await
    }

    async fn run_ceph(&self, args: Vec<String>) -> Result<String> {
        self.runner.run(&self.cancel, "ceph", &args).await
    }
}

/// Round a byte count up to the next multiple of 512.
///
/// Ceph allows writing only to images whose size is a multiple of 512
/// bytes.
pub fn round_up_to_512(size_bytes: u64) -> u64 {
    let result = (size_bytes / 512) * 512;
    if size_bytes % 512 != 0 {
        result + 512
    } else {
        result
    }
}
