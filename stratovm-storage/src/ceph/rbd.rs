//! Single-operation wrappers around the `rbd` tool.
//!
//! Each primitive is one subprocess contract; exit codes 2 (not found),
//! 16 (EBUSY) and 22 (EINVAL) carry meaning and are translated here
//! rather than parsed out of stderr.

use std::time::Duration;

use serde::Deserialize;
use tracing::debug;

use crate::error::{Result, StorageError};
use crate::types::Volume;

use super::name::rbd_image_name;
use super::{round_up_to_512, CephRbdDriver};

/// Exit code meaning the requested entity does not exist.
pub(crate) const EXIT_NOT_FOUND: i32 = 2;

/// Exit code for EBUSY.
pub(crate) const EXIT_EBUSY: i32 = 16;

/// Exit code for EINVAL.
pub(crate) const EXIT_EINVAL: i32 = 22;

/// Attempts before an EBUSY unmap is given up on.
const UNMAP_BUSY_ATTEMPTS: u32 = 10;

impl CephRbdDriver {
    /// Name of the volume's image as used by `rbd`, optionally
    /// pool-qualified.
    pub(crate) fn volume_name(&self, vol: &Volume, snap_name: Option<&str>, with_pool: bool) -> String {
        rbd_image_name(vol, snap_name, with_pool, &self.config().pool_name)
    }

    /// Create the RBD image backing a volume.
    ///
    /// The feature set is passed explicitly (default `layering`) to keep
    /// userspace/kernel feature skew to a minimum; see
    /// [`crate::types::CephRbdConfig::image_features`].
    pub async fn create_image(&self, vol: &Volume, size_bytes: u64) -> Result<()> {
        let mut args = self.rbd_pool_args();

        for feature in self.config().image_features() {
            args.push("--image-feature".to_string());
            args.push(feature);
        }

        if let Some(data_pool) = &self.config().data_pool_name {
            args.push("--data-pool".to_string());
            args.push(data_pool.clone());
        }

        args.push("--size".to_string());
        args.push(format!("{}B", round_up_to_512(size_bytes)));
        args.push("create".to_string());
        args.push(self.volume_name(vol, None, false));

        self.run_rbd(args).await?;
        Ok(())
    }

    /// Delete the RBD image backing a volume. A missing image is a no-op.
    pub async fn delete_image(&self, vol: &Volume) -> Result<()> {
        let mut args = self.rbd_pool_args();
        args.push("rm".to_string());
        args.push(self.volume_name(vol, None, false));

        match self.run_rbd(args).await {
            Ok(_) => Ok(()),
            Err(err) if err.exit_code() == Some(EXIT_NOT_FOUND) => Ok(()),
            Err(err) => Err(err),
        }
    }

    /// Map a volume's image to a kernel block device and return the
    /// `/dev/rbd<idx>` path.
    pub async fn map_image(&self, vol: &Volume) -> Result<String> {
        let rbd_name = self.volume_name(vol, None, false);

        let mut args = self.rbd_pool_args();
        args.push("map".to_string());
        args.push(rbd_name.clone());

        let output = self.run_rbd(args).await?;

        let idx = output
            .find("/dev/rbd")
            .ok_or_else(|| StorageError::Parse("Failed to detect mapped device path".to_string()))?;
        let dev_path = output[idx..].trim().to_string();

        debug!(vol_name = %rbd_name, dev = %dev_path, "Activated RBD volume");
        Ok(dev_path)
    }

    /// Unmap the kernel block device of a volume.
    ///
    /// EINVAL from `rbd unmap` means the device is already unmapped and
    /// counts as success; with `until_einval` the unmap is repeated until
    /// that point, guaranteeing every kernel reference is torn down even
    /// when the image was mapped more than once. EBUSY is retried with a
    /// one second pause for up to ten attempts.
    pub async fn unmap_image(&self, vol: &Volume, until_einval: bool) -> Result<()> {
        let rbd_name = self.volume_name(vol, None, false);
        let mut busy_count = 0;
        let mut our_deactivate = false;

        loop {
            match self.unmap_once(&rbd_name).await {
                Ok(()) => {
                    if until_einval {
                        our_deactivate = true;
                        continue;
                    }

                    debug!(vol_name = %rbd_name, "Deactivated RBD volume");
                    return Ok(());
                }
                Err(StorageError::AlreadyUnmapped(_)) => {
                    if our_deactivate {
                        debug!(vol_name = %rbd_name, "Deactivated RBD volume");
                    }

                    return Ok(());
                }
                Err(StorageError::Busy(_)) => {
                    busy_count += 1;
                    if busy_count == UNMAP_BUSY_ATTEMPTS {
                        return Err(StorageError::Busy(rbd_name));
                    }

                    // Wait a second and try again.
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Unmap the kernel block device of a volume snapshot.
    ///
    /// EINVAL counts as success; with `until_einval` the unmap is
    /// repeated until that point.
    pub async fn unmap_image_snapshot(
        &self,
        vol: &Volume,
        snapshot_name: &str,
        until_einval: bool,
    ) -> Result<()> {
        let rbd_name = self.volume_name(vol, Some(snapshot_name), false);

        loop {
            match self.unmap_once(&rbd_name).await {
                Ok(()) => {
                    if until_einval {
                        continue;
                    }

                    return Ok(());
                }
                Err(StorageError::AlreadyUnmapped(_)) => return Ok(()),
                Err(err) => return Err(err),
            }
        }
    }

    /// One `rbd unmap` invocation with its exit code translated.
    async fn unmap_once(&self, rbd_name: &str) -> Result<()> {
        let mut args = self.rbd_pool_args();
        args.push("unmap".to_string());
        args.push(rbd_name.to_string());

        match self.run_rbd(args).await {
            Ok(_) => Ok(()),
            Err(err) if err.exit_code() == Some(EXIT_EINVAL) => {
                Err(StorageError::AlreadyUnmapped(rbd_name.to_string()))
            }
            Err(err) if err.exit_code() == Some(EXIT_EBUSY) => {
                Err(StorageError::Busy(rbd_name.to_string()))
            }
            Err(err) => Err(err),
        }
    }

    /// Create a snapshot of a volume's image.
    pub async fn create_image_snapshot(&self, vol: &Volume, snapshot_name: &str) -> Result<()> {
        let mut args = self.rbd_pool_args();
        args.extend([
            "snap".to_string(),
            "create".to_string(),
            "--snap".to_string(),
            snapshot_name.to_string(),
            self.volume_name(vol, None, false),
        ]);

        self.run_rbd(args).await?;
        Ok(())
    }

    /// Protect a snapshot from deletion, a precondition for cloning from
    /// it. An already protected snapshot (EBUSY) counts as success.
    pub async fn protect_image_snapshot(&self, vol: &Volume, snapshot_name: &str) -> Result<()> {
        let mut args = self.rbd_pool_args();
        args.extend([
            "snap".to_string(),
            "protect".to_string(),
            "--snap".to_string(),
            snapshot_name.to_string(),
            self.volume_name(vol, None, false),
        ]);

        match self.run_rbd(args).await {
            Ok(_) => Ok(()),
            Err(err) if err.exit_code() == Some(EXIT_EBUSY) => Ok(()),
            Err(err) => Err(err),
        }
    }

    /// Unprotect a snapshot, a precondition for deleting it. Only
    /// succeeds once the snapshot has no clones; an already unprotected
    /// snapshot (EINVAL) counts as success.
    pub async fn unprotect_image_snapshot(&self, vol: &Volume, snapshot_name: &str) -> Result<()> {
        let mut args = self.rbd_pool_args();
        args.extend([
            "snap".to_string(),
            "unprotect".to_string(),
            "--snap".to_string(),
            snapshot_name.to_string(),
            self.volume_name(vol, None, false),
        ]);

        match self.run_rbd(args).await {
            Ok(_) => Ok(()),
            Err(err) if err.exit_code() == Some(EXIT_EINVAL) => Ok(()),
            Err(err) => Err(err),
        }
    }

    /// Delete a snapshot. Requires it to be unprotected, unmapped and
    /// without clones.
    pub async fn delete_image_snapshot(&self, vol: &Volume, snapshot_name: &str) -> Result<()> {
        let mut args = self.rbd_pool_args();
        args.extend([
            "snap".to_string(),
            "rm".to_string(),
            self.volume_name(vol, Some(snapshot_name), false),
        ]);

        self.run_rbd(args).await?;
        Ok(())
    }

    /// Rename a snapshot. A mapped snapshot must be unmapped under its
    /// original name first or it ends up mapped twice, which prevents
    /// deletion.
    pub async fn rename_image_snapshot(
        &self,
        vol: &Volume,
        old_snapshot_name: &str,
        new_snapshot_name: &str,
    ) -> Result<()> {
        let mut args = self.rbd_id_args();
        args.extend([
            "snap".to_string(),
            "rename".to_string(),
            self.volume_name(vol, Some(old_snapshot_name), true),
            self.volume_name(vol, Some(new_snapshot_name), true),
        ]);

        self.run_rbd(args).await?;
        Ok(())
    }

    /// Clone a new image from a protected snapshot.
    pub async fn clone_image(
        &self,
        source_vol: &Volume,
        source_snapshot_name: &str,
        target_vol: &Volume,
    ) -> Result<()> {
        let mut args = self.rbd_id_args();

        for feature in self.config().image_features() {
            args.push("--image-feature".to_string());
            args.push(feature);
        }

        if let Some(data_pool) = &self.config().data_pool_name {
            args.push("--data-pool".to_string());
            args.push(data_pool.clone());
        }

        args.push("clone".to_string());
        args.push(self.volume_name(source_vol, Some(source_snapshot_name), true));
        args.push(self.volume_name(target_vol, None, true));

        self.run_rbd(args).await?;
        Ok(())
    }

    /// Rename the image backing a volume, keeping its configuration.
    ///
    /// The image must be unmapped under its original name before callers
    /// map it under the new one, or it ends up mapped twice.
    pub async fn rename_image(&self, vol: &Volume, new_volume_name: &str) -> Result<()> {
        // The new volume keeps the source config so the filesystem suffix
        // stays on the generated name.
        let mut new_vol = vol.clone();
        new_vol.name = new_volume_name.to_string();
        new_vol.is_deleted = false;

        let mut args = self.rbd_id_args();
        args.extend([
            "mv".to_string(),
            self.volume_name(vol, None, true),
            self.volume_name(&new_vol, None, true),
        ]);

        self.run_rbd(args).await?;
        Ok(())
    }

    /// Rename the image backing a volume into zombie state.
    ///
    /// A zombie image is no longer tracked in the volume catalog but is
    /// kept on disk for the sake of dependent entities, typically clones
    /// of its protected snapshots.
    pub async fn mark_image_deleted(&self, vol: &Volume, new_volume_name: &str) -> Result<()> {
        let mut new_vol = vol.clone();
        new_vol.name = new_volume_name.to_string();
        new_vol.is_deleted = true;

        let mut args = self.rbd_id_args();
        args.extend([
            "mv".to_string(),
            self.volume_name(vol, None, true),
            self.volume_name(&new_vol, None, true),
        ]);

        self.run_rbd(args).await?;
        Ok(())
    }

    /// List the on-disk snapshot names of a volume's image.
    ///
    /// Returns [`StorageError::NotFound`] when the image has no snapshots
    /// or does not exist.
    pub async fn list_image_snapshots(&self, vol: &Volume) -> Result<Vec<String>> {
        let mut args = self.rbd_pool_args();
        args.extend([
            "--format".to_string(),
            "json".to_string(),
            "snap".to_string(),
            "ls".to_string(),
            self.volume_name(vol, None, false),
        ]);

        let output = match self.run_rbd(args).await {
            Ok(output) => output,
            Err(err) if err.exit_code() == Some(EXIT_NOT_FOUND) => {
                return Err(StorageError::NotFound(format!(
                    "RBD volume {:?} not found",
                    vol.name
                )));
            }
            Err(err) => return Err(err),
        };

        #[derive(Deserialize)]
        struct SnapshotEntry {
            name: String,
        }

        let entries: Vec<SnapshotEntry> = serde_json::from_str(output.trim())
            .map_err(|e| StorageError::Parse(format!("Failed to parse snapshot listing: {}", e)))?;

        let snapshots: Vec<String> = entries
            .into_iter()
            .map(|entry| entry.name.trim().to_string())
            .collect();

        if snapshots.is_empty() {
            return Err(StorageError::NotFound(
                "RBD volume snapshot(s) not found".to_string(),
            ));
        }

        Ok(snapshots)
    }

    /// List the pool-qualified clones of an image snapshot.
    ///
    /// An empty child list is reported as [`StorageError::NotFound`].
    pub async fn list_snapshot_clones(
        &self,
        vol: &Volume,
        snapshot_name: &str,
    ) -> Result<Vec<String>> {
        let mut args = self.rbd_pool_args();
        args.extend([
            "children".to_string(),
            "--image".to_string(),
            self.volume_name(vol, None, false),
            "--snap".to_string(),
            snapshot_name.to_string(),
        ]);

        let output = match self.run_rbd(args).await {
            Ok(output) => output,
            Err(err) if err.exit_code() == Some(EXIT_NOT_FOUND) => {
                return Err(StorageError::NotFound(
                    "RBD volume snapshot not found".to_string(),
                ));
            }
            Err(err) => return Err(err),
        };

        let clones: Vec<String> = output.split_whitespace().map(String::from).collect();
        if clones.is_empty() {
            return Err(StorageError::NotFound(
                "RBD volume snapshot not found".to_string(),
            ));
        }

        Ok(clones)
    }

    /// Return the `pool/image@snap` path of the snapshot this volume's
    /// image was cloned from, or [`StorageError::NotFound`] when the
    /// image is not a clone.
    pub async fn image_parent(&self, vol: &Volume) -> Result<String> {
        let mut args = self.rbd_pool_args();
        args.extend(["info".to_string(), self.volume_name(vol, None, false)]);

        let output = match self.run_rbd(args).await {
            Ok(output) => output,
            Err(err) if err.exit_code() == Some(EXIT_NOT_FOUND) => {
                return Err(StorageError::NotFound(format!(
                    "RBD volume {:?} not found",
                    vol.name
                )));
            }
            Err(err) => return Err(err),
        };

        const PARENT_FIELD: &str = "parent: ";
        let idx = output
            .find(PARENT_FIELD)
            .ok_or_else(|| StorageError::NotFound("RBD volume parent not found".to_string()))?;

        let parent = output[idx + PARENT_FIELD.len()..]
            .trim_start()
            .lines()
            .next()
            .unwrap_or("")
            .trim()
            .to_string();

        if parent.is_empty() {
            return Err(StorageError::Parse(
                "Malformed parent field in rbd info output".to_string(),
            ));
        }

        Ok(parent)
    }

    /// Resize a volume's image. Does not resize any filesystem inside it.
    pub async fn resize_image(
        &self,
        vol: &Volume,
        size_bytes: u64,
        allow_shrink: bool,
    ) -> Result<()> {
        let mut args = vec!["resize".to_string()];

        if allow_shrink {
            args.push("--allow-shrink".to_string());
        }

        args.extend(self.rbd_pool_args());
        args.push("--size".to_string());
        args.push(format!("{}B", round_up_to_512(size_bytes)));
        args.push(self.volume_name(vol, None, false));

        self.run_rbd(args).await?;
        Ok(())
    }
}
