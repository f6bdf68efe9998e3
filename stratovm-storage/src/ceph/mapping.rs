//! Kernel RBD mapping discovery through sysfs.

use std::fs;
use std::io::ErrorKind;
use std::path::Path;

use crate::error::{Result, StorageError};
use crate::types::{RbdMapping, Volume};

use super::CephRbdDriver;

impl CephRbdDriver {
    /// Locate the `/dev/rbd<idx>` device a volume is mapped to by
    /// scanning sysfs. Returns whether a fresh map was needed along with
    /// the device path.
    ///
    /// The sysfs namespace is shared and read without locking, so the
    /// scan is advisory: when nothing matches and `map_if_missing` is
    /// set, a map is attempted regardless.
    pub async fn mapped_device_path(
        &self,
        vol: &Volume,
        map_if_missing: bool,
    ) -> Result<(bool, String)> {
        let rbd_name = self.volume_name(vol, None, false);

        // Split the RBD name into its image and snapshot parts.
        let (image_name, snap_part) = match rbd_name.split_once('@') {
            Some((image, snap)) => (image, Some(snap)),
            None => (rbd_name.as_str(), None),
        };

        for mapping in self.scan_rbd_sysfs()? {
            if mapping.pool != self.config().pool_name {
                continue;
            }

            if mapping.image != image_name {
                continue;
            }

            let matched = if vol.is_snapshot() {
                // The device must be mapped to the volume's snapshot.
                snap_part == Some(mapping.current_snap.as_str())
            } else {
                // Neither the volume nor the device is a snapshot.
                mapping.current_snap == "-" || mapping.current_snap.is_empty()
            };

            if matched {
                return Ok((false, format!("/dev/rbd{}", mapping.device_index)));
            }
        }

        // No device could be found, map it ourselves.
        if map_if_missing {
            let dev_path = self.map_image(vol).await?;
            return Ok((true, dev_path));
        }

        Err(StorageError::NotFound(format!(
            "Volume {:?} not mapped to an RBD device",
            vol.name
        )))
    }

    /// Read the kernel's RBD device records from sysfs.
    fn scan_rbd_sysfs(&self) -> Result<Vec<RbdMapping>> {
        let dir = &self.config().rbd_sysfs_path;

        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => {
                return Err(StorageError::Transport(format!(
                    "Failed to read {}: {}",
                    dir.display(),
                    err
                )));
            }
        };

        let mut mappings = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|err| {
                StorageError::Transport(format!("Failed to read {}: {}", dir.display(), err))
            })?;

            // Device directories are named by their index.
            let file_name = entry.file_name();
            let Ok(device_index) = file_name.to_string_lossy().parse::<u64>() else {
                continue;
            };

            if !entry.path().is_dir() {
                continue;
            }

            let Some(pool) = read_sysfs_attr(&entry.path(), "pool")? else {
                continue;
            };
            let Some(image) = read_sysfs_attr(&entry.path(), "name")? else {
                continue;
            };
            let current_snap = read_sysfs_attr(&entry.path(), "current_snap")?.unwrap_or_default();

            mappings.push(RbdMapping {
                device_index,
                pool,
                image,
                current_snap,
            });
        }

        Ok(mappings)
    }
}

/// Read and trim one sysfs attribute, `None` when the file is absent.
fn read_sysfs_attr(dir: &Path, attr: &str) -> Result<Option<String>> {
    match fs::read_to_string(dir.join(attr)) {
        Ok(content) => Ok(Some(content.trim().to_string())),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
        Err(err) => Err(StorageError::Transport(format!(
            "Failed to read {}/{}: {}",
            dir.display(),
            attr,
            err
        ))),
    }
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::Path;
    use std::sync::Arc;

    use crate::sim::SimCluster;
    use crate::types::{CephRbdConfig, ContentType, Volume, VolumeType};

    use super::super::CephRbdDriver;

    fn stage_device(root: &Path, idx: u64, pool: &str, name: &str, snap: &str) {
        let dir = root.join(idx.to_string());
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("pool"), format!("{}\n", pool)).unwrap();
        fs::write(dir.join("name"), format!("{}\n", name)).unwrap();
        fs::write(dir.join("current_snap"), format!("{}\n", snap)).unwrap();
    }

    fn driver_with_sysfs(root: &Path) -> (Arc<SimCluster>, CephRbdDriver) {
        let sim = Arc::new(SimCluster::new("rbd"));
        let mut config = CephRbdConfig::new("rbd");
        config.rbd_sysfs_path = root.to_path_buf();
        (sim.clone(), CephRbdDriver::with_runner(config, sim))
    }

    #[tokio::test]
    async fn test_finds_mapped_image() {
        let root = tempfile::tempdir().unwrap();
        stage_device(root.path(), 0, "other", "container_c1", "-");
        stage_device(root.path(), 3, "rbd", "container_c1", "-");

        let (_, driver) = driver_with_sysfs(root.path());
        let vol = Volume::new(VolumeType::Container, ContentType::Fs, "c1", "rbd");

        let (mapped, dev) = driver.mapped_device_path(&vol, false).await.unwrap();
        assert!(!mapped);
        assert_eq!(dev, "/dev/rbd3");
    }

    #[tokio::test]
    async fn test_discriminates_snapshots() {
        let root = tempfile::tempdir().unwrap();
        stage_device(root.path(), 0, "rbd", "container_c1", "-");
        stage_device(root.path(), 1, "rbd", "container_c1", "snapshot_snap0");

        let (_, driver) = driver_with_sysfs(root.path());

        let head = Volume::new(VolumeType::Container, ContentType::Fs, "c1", "rbd");
        let (_, dev) = driver.mapped_device_path(&head, false).await.unwrap();
        assert_eq!(dev, "/dev/rbd0");

        let snap = Volume::new(VolumeType::Container, ContentType::Fs, "c1/snap0", "rbd");
        let (_, dev) = driver.mapped_device_path(&snap, false).await.unwrap();
        assert_eq!(dev, "/dev/rbd1");
    }

    #[tokio::test]
    async fn test_not_mapped_without_fallback() {
        let root = tempfile::tempdir().unwrap();
        let (_, driver) = driver_with_sysfs(root.path());
        let vol = Volume::new(VolumeType::Container, ContentType::Fs, "c1", "rbd");

        let err = driver.mapped_device_path(&vol, false).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_maps_when_missing() {
        let root = tempfile::tempdir().unwrap();
        let (sim, driver) = driver_with_sysfs(root.path());

        let vol = Volume::new(VolumeType::Container, ContentType::Fs, "c1", "rbd");
        driver.create_image(&vol, 1 << 20).await.unwrap();

        let (mapped, dev) = driver.mapped_device_path(&vol, true).await.unwrap();
        assert!(mapped);
        assert!(dev.starts_with("/dev/rbd"));
        assert_eq!(sim.mapped_count("rbd"), 1);
    }
}
