//! Zombie mark-and-sweep garbage collection over the clone dependency
//! graph.
//!
//! RBD will not delete an image with protected snapshots nor a snapshot
//! with clones. Instead of failing volume deletion, entities that still
//! have live dependents are renamed with a `zombie_` prefix, dropped from
//! the volume catalog, and reaped later when the last dependent
//! disappears. The graph is a DAG encoded entirely in image names;
//! [`delete_volume`](CephRbdDriver::delete_volume) and
//! [`delete_volume_snapshot`](CephRbdDriver::delete_volume_snapshot)
//! recurse through it, each step either removing a node or consuming a
//! dependent.

use std::future::Future;
use std::pin::Pin;

use tracing::debug;
use uuid::Uuid;

use crate::error::{Result, StorageError};
use crate::types::Volume;

use super::name::{parse_clone, parse_parent, ZOMBIE_PREFIX};
use super::CephRbdDriver;

/// Maximum clone/parent recursion depth, guarding against pathological
/// pools.
const MAX_GC_DEPTH: u32 = 32;

/// Outcome of a garbage collection pass over a volume or snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteResult {
    /// The on-disk entity was removed.
    Deleted,
    /// The entity remains on disk in zombie state because dependents
    /// still need it.
    Zombified,
}

type GcFuture<'a> = Pin<Box<dyn Future<Output = Result<DeleteResult>> + Send + 'a>>;

impl CephRbdDriver {
    /// Delete the RBD image of a volume including any dependencies.
    ///
    /// Any zombie entities whose existence depended solely on this volume
    /// are reaped along the way; conversely, when other entities in the
    /// pool still depend on this volume, it is renamed into zombie state
    /// instead of deleted and [`DeleteResult::Zombified`] is returned.
    pub async fn delete_volume(&self, vol: &Volume) -> Result<DeleteResult> {
        self.delete_volume_at(vol, 0).await
    }

    /// Delete an RBD snapshot of a volume including any dependencies.
    ///
    /// The companion of [`delete_volume`](Self::delete_volume): together
    /// they recurse through the pool to find and remove entities that
    /// were kept around only for their dependency relations.
    pub async fn delete_volume_snapshot(
        &self,
        vol: &Volume,
        snapshot_name: &str,
    ) -> Result<DeleteResult> {
        self.delete_volume_snapshot_at(vol, snapshot_name, 0).await
    }

    fn delete_volume_at<'a>(&'a self, vol: &'a Volume, depth: u32) -> GcFuture<'a> {
        Box::pin(async move {
            if depth > MAX_GC_DEPTH {
                return Err(StorageError::Internal(format!(
                    "Dependency recursion exceeded {} levels at volume {:?}",
                    MAX_GC_DEPTH, vol.name
                )));
            }

            match self.list_image_snapshots(vol).await {
                Ok(snapshots) => {
                    let mut zombies = 0;
                    for snapshot_name in &snapshots {
                        let result = self
                            .delete_volume_snapshot_at(vol, snapshot_name, depth + 1)
                            .await?;
                        if result == DeleteResult::Zombified {
                            zombies += 1;
                        }
                    }

                    if zombies > 0 {
                        self.unmap_image(vol, true).await?;

                        if vol.is_deleted {
                            // Already a zombie, nothing more to do.
                            return Ok(DeleteResult::Zombified);
                        }

                        let new_volume_name = format!("{}_{}", vol.name, Uuid::new_v4());
                        self.mark_image_deleted(vol, &new_volume_name).await?;

                        debug!(
                            vol_name = %vol.name,
                            new_name = %new_volume_name,
                            "Marked RBD volume as zombie"
                        );
                        return Ok(DeleteResult::Zombified);
                    }

                    // No snapshot survived as a zombie; the image itself
                    // can go. RBD refuses to remove an image with live
                    // snapshots, so a stale listing surfaces here as an
                    // error rather than a silent success.
                    self.delete_image(vol).await?;
                    Ok(DeleteResult::Deleted)
                }
                Err(err) if err.is_not_found() => {
                    match self.image_parent(vol).await {
                        Ok(parent) => {
                            let (parent_vol, parent_snapshot_name) = parse_parent(&parent)?;

                            self.unmap_image(vol, true).await?;
                            self.delete_image(vol).await?;

                            // Only delete the parent snapshot if it is a
                            // zombie, either because the parent volume is
                            // one or because the snapshot itself was
                            // tombstoned. A live snapshot is still
                            // referenced by the volume catalog.
                            if parent_vol.is_deleted
                                || parent_snapshot_name.starts_with(ZOMBIE_PREFIX)
                            {
                                self.delete_volume_snapshot_at(
                                    &parent_vol,
                                    &parent_snapshot_name,
                                    depth + 1,
                                )
                                .await?;
                            }

                            Ok(DeleteResult::Deleted)
                        }
                        Err(err) if err.is_not_found() => {
                            self.unmap_image(vol, true).await?;
                            self.delete_image(vol).await?;
                            Ok(DeleteResult::Deleted)
                        }
                        Err(err) => Err(err),
                    }
                }
                Err(err) => Err(err),
            }
        })
    }

    fn delete_volume_snapshot_at<'a>(
        &'a self,
        vol: &'a Volume,
        snapshot_name: &'a str,
        depth: u32,
    ) -> GcFuture<'a> {
        Box::pin(async move {
            if depth > MAX_GC_DEPTH {
                return Err(StorageError::Internal(format!(
                    "Dependency recursion exceeded {} levels at snapshot {:?}",
                    MAX_GC_DEPTH, snapshot_name
                )));
            }

            let clones = match self.list_snapshot_clones(vol, snapshot_name).await {
                Ok(clones) => clones,
                Err(err) if err.is_not_found() => {
                    // No clones left; the snapshot can be removed.
                    self.unprotect_image_snapshot(vol, snapshot_name).await?;
                    self.unmap_image_snapshot(vol, snapshot_name, true).await?;
                    self.delete_image_snapshot(vol, snapshot_name).await?;

                    // Only delete the parent image if it is a zombie. A
                    // live image is still referenced by the catalog.
                    if vol.is_deleted {
                        self.delete_volume_at(vol, depth + 1).await?;
                    }

                    return Ok(DeleteResult::Deleted);
                }
                Err(err) => return Err(err),
            };

            let mut can_delete = true;
            for clone in &clones {
                let parsed = parse_clone(clone)?;

                if !parsed.is_deleted {
                    can_delete = false;
                    continue;
                }

                let clone_vol = parsed.into_volume();
                let result = self.delete_volume_at(&clone_vol, depth + 1).await?;
                if result == DeleteResult::Zombified {
                    // The clone is still needed and so is this snapshot.
                    can_delete = false;
                }
            }

            if can_delete {
                self.unprotect_image_snapshot(vol, snapshot_name).await?;
                self.unmap_image_snapshot(vol, snapshot_name, true).await?;
                self.delete_image_snapshot(vol, snapshot_name).await?;

                if vol.is_deleted {
                    self.delete_volume_at(vol, depth + 1).await?;
                }
            } else if !snapshot_name.starts_with(ZOMBIE_PREFIX) {
                self.unmap_image_snapshot(vol, snapshot_name, true).await?;

                let new_snapshot_name = format!("zombie_snapshot_{}", Uuid::new_v4());
                self.rename_image_snapshot(vol, snapshot_name, &new_snapshot_name)
                    .await?;

                debug!(
                    vol_name = %vol.name,
                    snapshot_name = %snapshot_name,
                    new_name = %new_snapshot_name,
                    "Marked RBD snapshot as zombie"
                );
            }

            Ok(DeleteResult::Zombified)
        })
    }
}
