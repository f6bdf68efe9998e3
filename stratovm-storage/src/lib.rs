//! # stratovm Storage
//!
//! Ceph RBD storage driver core for the stratovm container/VM manager.
//!
//! The driver mediates between volume lifecycle requests (create,
//! snapshot, clone, copy, refresh, send/receive, delete, resize) and the
//! `rbd`/`ceph` command line tools against an OSD pool. Dependencies
//! between images are encoded entirely in on-disk names: clones depend on
//! protected snapshots, which depend on their parent images. Entities
//! that can not be deleted yet are renamed into `zombie_` state and
//! reaped once their last dependent disappears.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use stratovm_storage::{CephRbdConfig, CephRbdDriver, ContentType, Volume, VolumeType};
//!
//! #[tokio::main]
//! async fn main() {
//!     let driver = CephRbdDriver::new(CephRbdConfig::new("rbd"));
//!
//!     let vol = Volume::new(VolumeType::Custom, ContentType::Block, "vol1", "rbd");
//!     driver.create_image(&vol, 10 * 1024 * 1024 * 1024).await.unwrap();
//!     driver.delete_volume(&vol).await.unwrap();
//! }
//! ```
//!
//! Callers must serialize operations per image; the driver is reentrant
//! but performs no internal locking.

pub mod ceph;
pub mod cmd;
pub mod error;
pub mod sim;
pub mod types;

pub use ceph::{
    build_mount,
    find_last_common_snapshot_index,
    parse_clone,
    parse_parent,
    rbd_image_name,
    round_up_to_512,
    CephRbdDriver,
    DeleteResult,
    ParsedClone,
    ProgressTracker,
    ProgressWriter,
};
pub use cmd::{CommandRunner, SpawnedCommand, SystemRunner};
pub use error::{Result, StorageError};
pub use sim::SimCluster;
pub use types::{
    CephRbdConfig,
    ContentType,
    Monitors,
    RbdMapping,
    Volume,
    VolumeType,
    CEPH_DEFAULT_CLUSTER,
    CEPH_DEFAULT_USER,
};
