//! Storage type definitions.

use std::collections::HashMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Default ceph cluster name.
pub const CEPH_DEFAULT_CLUSTER: &str = "ceph";

/// Default ceph user name.
pub const CEPH_DEFAULT_USER: &str = "admin";

/// Filesystem assumed for image volumes that carry no explicit
/// `block.filesystem` setting.
pub const DEFAULT_FILESYSTEM: &str = "ext4";

/// Type of a logical storage volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VolumeType {
    /// Container root filesystem
    Container,
    /// Virtual machine disk
    VirtualMachine,
    /// Read-only base image
    Image,
    /// User-defined volume
    Custom,
    /// Image kept on disk only for its dependent clones. Internal to the
    /// zombie garbage collection protocol.
    ZombieImage,
}

impl VolumeType {
    /// Storage volume name tag used as the RBD image name prefix.
    pub fn tag(&self) -> &'static str {
        match self {
            Self::Container => "container",
            Self::VirtualMachine => "virtual_machine",
            Self::Image => "image",
            Self::Custom => "custom",
            Self::ZombieImage => "zombie_image",
        }
    }
}

/// Content type stored inside a volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentType {
    /// A mountable filesystem
    Fs,
    /// A raw block device
    Block,
    /// An ISO 9660 image
    Iso,
}

/// Logical handle for an RBD-backed object.
///
/// A volume name containing a `/` refers to a snapshot of the volume named
/// by the part before the separator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Volume {
    /// Logical volume name, optionally `parent/snapshot`.
    pub name: String,
    /// Volume type.
    pub vol_type: VolumeType,
    /// Content type.
    pub content_type: ContentType,
    /// Enclosing OSD pool name.
    pub pool: String,
    /// Volume configuration; only `block.filesystem` is significant here.
    #[serde(default)]
    pub config: HashMap<String, String>,
    /// Whether the backing image has been renamed into zombie state and
    /// dropped from the volume catalog.
    #[serde(default)]
    pub is_deleted: bool,
}

impl Volume {
    /// Create a volume handle.
    pub fn new(
        vol_type: VolumeType,
        content_type: ContentType,
        name: impl Into<String>,
        pool: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            vol_type,
            content_type,
            pool: pool.into(),
            config: HashMap::new(),
            is_deleted: false,
        }
    }

    /// Set a configuration key.
    pub fn with_config(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.config.insert(key.into(), value.into());
        self
    }

    /// Whether this volume refers to a snapshot.
    pub fn is_snapshot(&self) -> bool {
        self.name.contains('/')
    }

    /// Split the volume name into its parent name and optional snapshot
    /// name.
    pub fn parent_and_snapshot(&self) -> (&str, Option<&str>) {
        match self.name.split_once('/') {
            Some((parent, snapshot)) => (parent, Some(snapshot)),
            None => (self.name.as_str(), None),
        }
    }

    /// Filesystem configured for the volume, defaulting to ext4.
    pub fn block_filesystem(&self) -> &str {
        self.config
            .get("block.filesystem")
            .map(String::as_str)
            .unwrap_or(DEFAULT_FILESYSTEM)
    }
}

/// Ceph monitor addresses grouped by messenger protocol version.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Monitors {
    /// v1 (legacy) protocol addresses
    pub v1: Vec<String>,
    /// v2 protocol addresses
    pub v2: Vec<String>,
}

/// A kernel RBD device record discovered through sysfs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RbdMapping {
    /// Device index; the block device is `/dev/rbd<device_index>`.
    pub device_index: u64,
    /// OSD pool of the mapped image.
    pub pool: String,
    /// RBD image name.
    pub image: String,
    /// Mapped snapshot name, `-` or empty for the image head.
    pub current_snap: String,
}

/// Immutable Ceph RBD driver configuration, threaded to every primitive.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CephRbdConfig {
    /// Ceph cluster name.
    #[serde(default = "default_cluster_name")]
    pub cluster_name: String,
    /// Ceph client user name, without the `client.` prefix.
    #[serde(default = "default_user_name")]
    pub user_name: String,
    /// OSD pool backing the driver's images.
    pub pool_name: String,
    /// Optional separate OSD pool for image data (erasure coded setups).
    #[serde(default)]
    pub data_pool_name: Option<String>,
    /// RBD image features, comma separated. Unset means `layering` only.
    #[serde(default)]
    pub rbd_features: Option<String>,
    /// Sysfs directory where the kernel exposes RBD device records.
    #[serde(default = "default_rbd_sysfs_path")]
    pub rbd_sysfs_path: PathBuf,
}

fn default_cluster_name() -> String {
    CEPH_DEFAULT_CLUSTER.to_string()
}

fn default_user_name() -> String {
    CEPH_DEFAULT_USER.to_string()
}

fn default_rbd_sysfs_path() -> PathBuf {
    PathBuf::from("/sys/devices/rbd")
}

impl CephRbdConfig {
    /// Create a configuration for the given OSD pool with default cluster
    /// and user names.
    pub fn new(pool_name: impl Into<String>) -> Self {
        Self {
            cluster_name: default_cluster_name(),
            user_name: default_user_name(),
            pool_name: pool_name.into(),
            data_pool_name: None,
            rbd_features: None,
            rbd_sysfs_path: default_rbd_sysfs_path(),
        }
    }

    /// RBD image features passed to create and clone.
    ///
    /// The default is intentionally limited to `layering` to minimize the
    /// chance of a feature conflict between the userspace library and the
    /// kernel module.
    pub fn image_features(&self) -> Vec<String> {
        let features: Vec<String> = self
            .rbd_features
            .as_deref()
            .unwrap_or_default()
            .split(',')
            .map(str::trim)
            .filter(|f| !f.is_empty())
            .map(String::from)
            .collect();

        if features.is_empty() {
            vec!["layering".to_string()]
        } else {
            features
        }
    }
}
