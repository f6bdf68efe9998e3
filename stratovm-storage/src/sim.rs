//! In-memory Ceph cluster simulator for testing and development.
//!
//! Implements the [`CommandRunner`] seam by interpreting `rbd` and `ceph`
//! argv against a model of pools, images, snapshots, clone children and
//! kernel mappings, reproducing the exit codes the real tools use
//! (2 not-found, 16 EBUSY, 22 EINVAL). This lets the full driver stack
//! run without a cluster:
//! - Unit and integration testing
//! - Development without ceph installed
//!
//! The simulated `export-diff` stream carries the full endpoint contents
//! behind a small frame header; incremental diff encoding is not
//! modeled.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::json;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::cmd::{CommandRead, CommandRunner, CommandWrite, SpawnedCommand};
use crate::error::{Result, StorageError};

const EXIT_NOT_FOUND: i32 = 2;
const EXIT_EBUSY: i32 = 16;
const EXIT_EEXIST: i32 = 17;
const EXIT_EINVAL: i32 = 22;
const EXIT_ENOTEMPTY: i32 = 39;

/// Frame header for the simulated diff stream.
const DIFF_MAGIC: &[u8] = b"rbd-diff-sim\n";

#[derive(Debug, Clone, Default)]
struct SimSnapshot {
    protected: bool,
    data: Vec<u8>,
    /// Pool-qualified names of clones created from this snapshot.
    children: Vec<String>,
}

#[derive(Debug, Clone, Default)]
struct SimImage {
    size_bytes: u64,
    data: Vec<u8>,
    /// `pool/image@snap` this image was cloned from.
    parent: Option<String>,
    /// Snapshots in creation order.
    snapshots: Vec<(String, SimSnapshot)>,
}

impl SimImage {
    fn snapshot(&self, name: &str) -> Option<&SimSnapshot> {
        self.snapshots
            .iter()
            .find(|(snap_name, _)| snap_name == name)
            .map(|(_, snap)| snap)
    }

    fn snapshot_mut(&mut self, name: &str) -> Option<&mut SimSnapshot> {
        self.snapshots
            .iter_mut()
            .find(|(snap_name, _)| snap_name == name)
            .map(|(_, snap)| snap)
    }
}

#[derive(Debug, Clone)]
struct SimMappingRecord {
    device_index: u64,
    pool: String,
    image: String,
    snap: Option<String>,
}

#[derive(Debug)]
struct SimState {
    /// Images keyed by `pool/image`.
    images: HashMap<String, SimImage>,
    pools: HashSet<String>,
    filesystems: HashSet<String>,
    mappings: Vec<SimMappingRecord>,
    next_device_index: u64,
    /// Scripted EBUSY results for upcoming unmap calls.
    unmap_busy_remaining: u32,
    /// Monitor address records as `(type, addr)` pairs.
    monitors: Vec<(String, String)>,
    fsid: String,
    auth_key: String,
    cephx_enabled: bool,
    osd_pool_default_size: i64,
}

impl Default for SimState {
    fn default() -> Self {
        Self {
            images: HashMap::new(),
            pools: HashSet::new(),
            filesystems: HashSet::new(),
            mappings: Vec::new(),
            next_device_index: 0,
            unmap_busy_remaining: 0,
            monitors: Vec::new(),
            fsid: "00000000-0000-0000-0000-000000000000".to_string(),
            auth_key: "AQBzKBNYSimulatedKeyAAAAkqrMQ7e0FBA5lKuJhQ==".to_string(),
            cephx_enabled: true,
            osd_pool_default_size: 3,
        }
    }
}

/// In-memory Ceph cluster behind the command gateway seam.
pub struct SimCluster {
    state: Arc<Mutex<SimState>>,
}

impl SimCluster {
    /// Create a simulated cluster with one OSD pool.
    pub fn new(pool_name: &str) -> Self {
        let mut state = SimState::default();
        state.pools.insert(pool_name.to_string());
        Self {
            state: Arc::new(Mutex::new(state)),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SimState> {
        self.state.lock().expect("simulator state lock poisoned")
    }

    /// Register an additional OSD pool.
    pub fn add_pool(&self, pool_name: &str) {
        self.lock().pools.insert(pool_name.to_string());
    }

    /// Register a CephFS filesystem.
    pub fn add_filesystem(&self, fs_name: &str) {
        self.lock().filesystems.insert(fs_name.to_string());
    }

    /// Register a monitor address record (`kind` is `v1` or `v2`).
    pub fn add_monitor(&self, kind: &str, addr: &str) {
        self.lock()
            .monitors
            .push((kind.to_string(), addr.to_string()));
    }

    /// Set the cluster FSID.
    pub fn set_fsid(&self, fsid: &str) {
        self.lock().fsid = fsid.to_string();
    }

    /// Set the CephX key handed out by `auth get-key`.
    pub fn set_auth_key(&self, key: &str) {
        self.lock().auth_key = key.to_string();
    }

    /// Turn cephx authentication off for the cluster.
    pub fn disable_cephx(&self) {
        self.lock().cephx_enabled = false;
    }

    /// Script the next `attempts` unmap calls to fail with EBUSY.
    pub fn inject_unmap_busy(&self, attempts: u32) {
        self.lock().unmap_busy_remaining = attempts;
    }

    /// Create an image with the given contents, bypassing the driver.
    pub fn seed_image(&self, pool: &str, image: &str, data: &[u8]) {
        self.lock().images.insert(
            format!("{}/{}", pool, image),
            SimImage {
                size_bytes: data.len() as u64,
                data: data.to_vec(),
                parent: None,
                snapshots: Vec::new(),
            },
        );
    }

    /// Overwrite an image's contents, leaving its snapshots alone.
    pub fn write_image_data(&self, pool: &str, image: &str, data: &[u8]) {
        let mut state = self.lock();
        if let Some(image) = state.images.get_mut(&format!("{}/{}", pool, image)) {
            image.data = data.to_vec();
            if image.size_bytes < data.len() as u64 {
                image.size_bytes = data.len() as u64;
            }
        }
    }

    /// Size of an image in bytes.
    pub fn image_size(&self, pool: &str, image: &str) -> Option<u64> {
        self.lock()
            .images
            .get(&format!("{}/{}", pool, image))
            .map(|img| img.size_bytes)
    }

    /// Whether an image exists.
    pub fn has_image(&self, pool: &str, image: &str) -> bool {
        self.lock()
            .images
            .contains_key(&format!("{}/{}", pool, image))
    }

    /// Sorted image names in a pool.
    pub fn image_names(&self, pool: &str) -> Vec<String> {
        let prefix = format!("{}/", pool);
        let mut names: Vec<String> = self
            .lock()
            .images
            .keys()
            .filter_map(|key| key.strip_prefix(&prefix).map(String::from))
            .collect();
        names.sort();
        names
    }

    /// Whether a pool holds no images.
    pub fn pool_is_empty(&self, pool: &str) -> bool {
        self.image_names(pool).is_empty()
    }

    /// Snapshot names of an image, in creation order.
    pub fn snapshot_names(&self, pool: &str, image: &str) -> Vec<String> {
        self.lock()
            .images
            .get(&format!("{}/{}", pool, image))
            .map(|img| img.snapshots.iter().map(|(name, _)| name.clone()).collect())
            .unwrap_or_default()
    }

    /// Whether a snapshot is protected.
    pub fn snapshot_protected(&self, pool: &str, image: &str, snap: &str) -> bool {
        self.lock()
            .images
            .get(&format!("{}/{}", pool, image))
            .and_then(|img| img.snapshot(snap))
            .map(|snap| snap.protected)
            .unwrap_or(false)
    }

    /// Contents of an image.
    pub fn image_data(&self, pool: &str, image: &str) -> Option<Vec<u8>> {
        self.lock()
            .images
            .get(&format!("{}/{}", pool, image))
            .map(|img| img.data.clone())
    }

    /// Number of kernel mappings in a pool.
    pub fn mapped_count(&self, pool: &str) -> usize {
        self.lock()
            .mappings
            .iter()
            .filter(|mapping| mapping.pool == pool)
            .count()
    }

    fn run_rbd(&self, args: &ParsedArgs) -> Result<String> {
        let Some(subcommand) = args.positionals.first() else {
            return Err(remote(EXIT_EINVAL, "missing subcommand"));
        };

        match subcommand.as_str() {
            "create" => self.rbd_create(args),
            "rm" => self.rbd_rm(args),
            "mv" => self.rbd_mv(args),
            "map" => self.rbd_map(args),
            "unmap" => self.rbd_unmap(args),
            "clone" => self.rbd_clone(args),
            "info" => self.rbd_info(args),
            "children" => self.rbd_children(args),
            "resize" => self.rbd_resize(args),
            "snap" => self.rbd_snap(args),
            other => Err(StorageError::Transport(format!(
                "Simulator does not understand rbd {:?}",
                other
            ))),
        }
    }

    fn rbd_create(&self, args: &ParsedArgs) -> Result<String> {
        let key = args.image_key(1)?;
        let size_bytes = args.size_bytes()?;

        let mut state = self.lock();
        if state.images.contains_key(&key) {
            return Err(remote(EXIT_EEXIST, "image already exists"));
        }

        state.images.insert(
            key,
            SimImage {
                size_bytes,
                ..Default::default()
            },
        );
        Ok(String::new())
    }

    fn rbd_rm(&self, args: &ParsedArgs) -> Result<String> {
        let key = args.image_key(1)?;

        let mut state = self.lock();
        let Some(image) = state.images.get(&key) else {
            return Err(remote(EXIT_NOT_FOUND, "No such file or directory"));
        };

        if !image.snapshots.is_empty() {
            return Err(remote(
                EXIT_ENOTEMPTY,
                "image has snapshots - these must be deleted with 'rbd snap purge' before the image can be removed",
            ));
        }

        let (pool, name) = split_key(&key);
        if state
            .mappings
            .iter()
            .any(|mapping| mapping.pool == pool && mapping.image == name)
        {
            return Err(remote(EXIT_EBUSY, "image still has watchers"));
        }

        let Some(image) = state.images.remove(&key) else {
            return Err(remote(EXIT_NOT_FOUND, "No such file or directory"));
        };

        // Drop the clone registration from the parent snapshot.
        if let Some(parent) = image.parent {
            let (parent_key, parent_snap) = split_snap_spec(&parent);
            if let Some(parent_image) = state.images.get_mut(parent_key) {
                if let Some(snap_name) = parent_snap {
                    if let Some(snap) = parent_image.snapshot_mut(snap_name) {
                        snap.children.retain(|child| child != &key);
                    }
                }
            }
        }

        Ok(String::new())
    }

    fn rbd_mv(&self, args: &ParsedArgs) -> Result<String> {
        let source_key = args.positional(1)?.to_string();
        let target_key = args.positional(2)?.to_string();

        let mut state = self.lock();
        if state.images.contains_key(&target_key) {
            return Err(remote(EXIT_EEXIST, "image already exists"));
        }

        let Some(image) = state.images.remove(&source_key) else {
            return Err(remote(EXIT_NOT_FOUND, "No such file or directory"));
        };

        // Renames resolve live: the parent's child registration and every
        // clone's parent reference must follow the new name.
        if let Some(parent) = &image.parent {
            let (parent_key, parent_snap) = split_snap_spec(parent);
            let parent_key = parent_key.to_string();
            let parent_snap = parent_snap.map(String::from);
            if let Some(parent_image) = state.images.get_mut(&parent_key) {
                if let Some(snap_name) = parent_snap {
                    if let Some(snap) = parent_image.snapshot_mut(&snap_name) {
                        for child in &mut snap.children {
                            if child == &source_key {
                                *child = target_key.clone();
                            }
                        }
                    }
                }
            }
        }

        let child_updates: Vec<(String, String)> = image
            .snapshots
            .iter()
            .flat_map(|(snap_name, snap)| {
                snap.children
                    .iter()
                    .map(move |child| (child.clone(), snap_name.clone()))
            })
            .collect();

        for (child_key, snap_name) in child_updates {
            if let Some(child) = state.images.get_mut(&child_key) {
                child.parent = Some(format!("{}@{}", target_key, snap_name));
            }
        }

        state.images.insert(target_key, image);
        Ok(String::new())
    }

    fn rbd_map(&self, args: &ParsedArgs) -> Result<String> {
        let key = args.image_key(1)?;
        let (key, snap) = split_owned_snap_spec(key);

        let mut state = self.lock();
        let Some(image) = state.images.get(&key) else {
            return Err(remote(EXIT_NOT_FOUND, "No such file or directory"));
        };

        if let Some(snap_name) = &snap {
            if image.snapshot(snap_name).is_none() {
                return Err(remote(EXIT_NOT_FOUND, "No such file or directory"));
            }
        }

        let (pool, name) = split_key(&key);
        let device_index = state.next_device_index;
        state.next_device_index += 1;

        let record = SimMappingRecord {
            device_index,
            pool: pool.to_string(),
            image: name.to_string(),
            snap,
        };
        state.mappings.push(record);

        Ok(format!("/dev/rbd{}\n", device_index))
    }

    fn rbd_unmap(&self, args: &ParsedArgs) -> Result<String> {
        let key = args.image_key(1)?;
        let (key, snap) = split_owned_snap_spec(key);
        let (pool, name) = split_key(&key);

        let mut state = self.lock();
        if state.unmap_busy_remaining > 0 {
            state.unmap_busy_remaining -= 1;
            return Err(remote(EXIT_EBUSY, "sysfs write failed: device is busy"));
        }

        let position = state.mappings.iter().position(|mapping| {
            mapping.pool == pool && mapping.image == name && mapping.snap == snap
        });

        match position {
            Some(position) => {
                state.mappings.remove(position);
                Ok(String::new())
            }
            None => Err(remote(EXIT_EINVAL, "not a mapped image or snapshot")),
        }
    }

    fn rbd_clone(&self, args: &ParsedArgs) -> Result<String> {
        let source_spec = args.positional(1)?.to_string();
        let target_key = args.positional(2)?.to_string();

        let (source_key, source_snap) = split_snap_spec(&source_spec);
        let Some(source_snap) = source_snap else {
            return Err(remote(EXIT_EINVAL, "snapshot name was not specified"));
        };

        let mut state = self.lock();
        let Some(source) = state.images.get(source_key) else {
            return Err(remote(EXIT_NOT_FOUND, "No such file or directory"));
        };

        let Some(snap) = source.snapshot(source_snap) else {
            return Err(remote(EXIT_NOT_FOUND, "No such file or directory"));
        };

        if !snap.protected {
            return Err(remote(EXIT_EINVAL, "parent snapshot must be protected"));
        }

        if state.images.contains_key(&target_key) {
            return Err(remote(EXIT_EEXIST, "image already exists"));
        }

        let clone = SimImage {
            size_bytes: source.size_bytes,
            data: snap.data.clone(),
            parent: Some(source_spec.clone()),
            snapshots: Vec::new(),
        };

        let source_key = source_key.to_string();
        let source_snap = source_snap.to_string();
        state.images.insert(target_key.clone(), clone);
        if let Some(source) = state.images.get_mut(&source_key) {
            if let Some(snap) = source.snapshot_mut(&source_snap) {
                snap.children.push(target_key);
            }
        }

        Ok(String::new())
    }

    fn rbd_info(&self, args: &ParsedArgs) -> Result<String> {
        let key = args.image_key(1)?;

        let state = self.lock();
        let Some(image) = state.images.get(&key) else {
            return Err(remote(EXIT_NOT_FOUND, "No such file or directory"));
        };

        let (_, name) = split_key(&key);
        let mut output = format!(
            "rbd image '{}':\n\tsize {} B\n\tformat: 2\n\tfeatures: layering\n",
            name, image.size_bytes
        );
        if let Some(parent) = &image.parent {
            output.push_str(&format!("\tparent: {}\n", parent));
        }

        Ok(output)
    }

    fn rbd_children(&self, args: &ParsedArgs) -> Result<String> {
        let image_name = args.flag("--image")?;
        let snap_name = args.flag("--snap")?;
        let pool = args.flag("--pool")?;
        let key = format!("{}/{}", pool, image_name);

        let state = self.lock();
        let Some(image) = state.images.get(&key) else {
            return Err(remote(EXIT_NOT_FOUND, "No such file or directory"));
        };

        let Some(snap) = image.snapshot(snap_name) else {
            return Err(remote(EXIT_NOT_FOUND, "No such file or directory"));
        };

        Ok(format!("{}\n", snap.children.join(" ")))
    }

    fn rbd_resize(&self, args: &ParsedArgs) -> Result<String> {
        let key = args.image_key(1)?;
        let size_bytes = args.size_bytes()?;
        let allow_shrink = args.has_flag("--allow-shrink");

        let mut state = self.lock();
        let Some(image) = state.images.get_mut(&key) else {
            return Err(remote(EXIT_NOT_FOUND, "No such file or directory"));
        };

        if size_bytes < image.size_bytes && !allow_shrink {
            return Err(remote(
                EXIT_EINVAL,
                "shrinking an image is only allowed with the --allow-shrink flag",
            ));
        }

        image.size_bytes = size_bytes;
        Ok(String::new())
    }

    fn rbd_snap(&self, args: &ParsedArgs) -> Result<String> {
        let action = args.positional(1)?;

        match action {
            "create" => {
                let key = args.image_key(2)?;
                let snap_name = args.flag("--snap")?.to_string();

                let mut state = self.lock();
                let Some(image) = state.images.get_mut(&key) else {
                    return Err(remote(EXIT_NOT_FOUND, "No such file or directory"));
                };

                if image.snapshot(&snap_name).is_some() {
                    return Err(remote(EXIT_EEXIST, "snapshot already exists"));
                }

                let data = image.data.clone();
                image.snapshots.push((
                    snap_name,
                    SimSnapshot {
                        protected: false,
                        data,
                        children: Vec::new(),
                    },
                ));
                Ok(String::new())
            }
            "rm" => {
                let spec = args.image_key(2)?;
                let (key, snap_name) = split_owned_snap_spec(spec);
                let Some(snap_name) = snap_name else {
                    return Err(remote(EXIT_EINVAL, "snapshot name was not specified"));
                };

                let mut state = self.lock();
                let Some(image) = state.images.get_mut(&key) else {
                    return Err(remote(EXIT_NOT_FOUND, "No such file or directory"));
                };

                let Some(snap) = image.snapshot(&snap_name) else {
                    return Err(remote(EXIT_NOT_FOUND, "No such file or directory"));
                };

                if snap.protected {
                    return Err(remote(EXIT_EBUSY, "snapshot is protected from removal"));
                }

                image.snapshots.retain(|(name, _)| name != &snap_name);
                Ok(String::new())
            }
            "protect" => {
                let key = args.image_key(2)?;
                let snap_name = args.flag("--snap")?;

                let mut state = self.lock();
                let snap = self.snapshot_entry(&mut state, &key, snap_name)?;
                if snap.protected {
                    return Err(remote(EXIT_EBUSY, "snap is already protected"));
                }

                snap.protected = true;
                Ok(String::new())
            }
            "unprotect" => {
                let key = args.image_key(2)?;
                let snap_name = args.flag("--snap")?;

                let mut state = self.lock();
                let snap = self.snapshot_entry(&mut state, &key, snap_name)?;
                if !snap.protected {
                    return Err(remote(EXIT_EINVAL, "snap is already unprotected"));
                }

                if !snap.children.is_empty() {
                    return Err(remote(
                        EXIT_EBUSY,
                        "cannot unprotect: at least 1 child(ren) in pool",
                    ));
                }

                snap.protected = false;
                Ok(String::new())
            }
            "rename" => {
                let old_spec = args.positional(2)?.to_string();
                let new_spec = args.positional(3)?.to_string();

                let (old_key, old_snap) = split_snap_spec(&old_spec);
                let (new_key, new_snap) = split_snap_spec(&new_spec);
                let (Some(old_snap), Some(new_snap)) = (old_snap, new_snap) else {
                    return Err(remote(EXIT_EINVAL, "snapshot name was not specified"));
                };

                if old_key != new_key {
                    return Err(remote(EXIT_EINVAL, "source and destination image differ"));
                }

                let old_key = old_key.to_string();
                let mut state = self.lock();
                let Some(image) = state.images.get_mut(&old_key) else {
                    return Err(remote(EXIT_NOT_FOUND, "No such file or directory"));
                };

                if image.snapshot(new_snap).is_some() {
                    return Err(remote(EXIT_EEXIST, "snapshot already exists"));
                }

                let mut children = Vec::new();
                match image.snapshots.iter_mut().find(|(name, _)| name == old_snap) {
                    Some((name, snap)) => {
                        *name = new_snap.to_string();
                        children = snap.children.clone();
                    }
                    None => return Err(remote(EXIT_NOT_FOUND, "No such file or directory")),
                }

                // Clone parent references resolve live and must follow
                // the rename.
                for child_key in children {
                    if let Some(child) = state.images.get_mut(&child_key) {
                        child.parent = Some(format!("{}@{}", old_key, new_snap));
                    }
                }

                Ok(String::new())
            }
            "ls" => {
                let key = args.image_key(2)?;

                let state = self.lock();
                let Some(image) = state.images.get(&key) else {
                    return Err(remote(EXIT_NOT_FOUND, "No such file or directory"));
                };

                let entries: Vec<serde_json::Value> = image
                    .snapshots
                    .iter()
                    .enumerate()
                    .map(|(id, (name, snap))| {
                        json!({"id": id, "name": name, "size": snap.data.len()})
                    })
                    .collect();

                Ok(serde_json::Value::Array(entries).to_string())
            }
            other => Err(StorageError::Transport(format!(
                "Simulator does not understand rbd snap {:?}",
                other
            ))),
        }
    }

    fn snapshot_entry<'a>(
        &self,
        state: &'a mut SimState,
        key: &str,
        snap_name: &str,
    ) -> Result<&'a mut SimSnapshot> {
        let Some(image) = state.images.get_mut(key) else {
            return Err(remote(EXIT_NOT_FOUND, "No such file or directory"));
        };

        image
            .snapshot_mut(snap_name)
            .ok_or_else(|| remote(EXIT_NOT_FOUND, "No such file or directory"))
    }

    fn run_ceph(&self, args: &ParsedArgs) -> Result<String> {
        let positionals: Vec<&str> = args.positionals.iter().map(String::as_str).collect();

        match positionals.as_slice() {
            ["mon", "dump"] => {
                let state = self.lock();
                let addrvec: Vec<serde_json::Value> = state
                    .monitors
                    .iter()
                    .map(|(kind, addr)| json!({"type": kind, "addr": addr}))
                    .collect();

                Ok(json!({"mons": [{"public_addrs": {"addrvec": addrvec}}]}).to_string())
            }
            ["auth", "get-key", _client] => {
                let state = self.lock();
                Ok(json!({"key": state.auth_key}).to_string())
            }
            ["config", "get", _client, "auth_service_required"] => {
                let state = self.lock();
                Ok(if state.cephx_enabled {
                    "cephx\n".to_string()
                } else {
                    "none\n".to_string()
                })
            }
            ["config", "get", "mon", "osd_pool_default_size"] => {
                let state = self.lock();
                Ok(format!("{}\n", state.osd_pool_default_size))
            }
            ["fsid"] => {
                let state = self.lock();
                Ok(json!({"fsid": state.fsid}).to_string())
            }
            ["osd", "pool", "get", pool, "size"] => {
                let state = self.lock();
                if state.pools.contains(*pool) {
                    Ok("size: 3\n".to_string())
                } else {
                    Err(remote(EXIT_NOT_FOUND, "unrecognized pool"))
                }
            }
            ["osd", "pool", "delete", pool, _confirm] => {
                if !args.has_flag("--yes-i-really-really-mean-it") {
                    return Err(remote(
                        EXIT_EINVAL,
                        "this will PERMANENTLY DESTROY all data stored in pool",
                    ));
                }

                let prefix = format!("{}/", pool);
                let mut state = self.lock();
                state.pools.remove(*pool);
                state.images.retain(|key, _| !key.starts_with(&prefix));
                state.mappings.retain(|mapping| mapping.pool != *pool);
                Ok(String::new())
            }
            ["fs", "get", fs_name] => {
                let state = self.lock();
                if state.filesystems.contains(*fs_name) {
                    Ok(format!("Filesystem '{}'\n", fs_name))
                } else {
                    Err(remote(EXIT_NOT_FOUND, "Filesystem not found"))
                }
            }
            other => Err(StorageError::Transport(format!(
                "Simulator does not understand ceph {:?}",
                other
            ))),
        }
    }

    fn spawn_export_diff(&self, args: &ParsedArgs) -> Result<SpawnedCommand> {
        let source_spec = args.positional(1)?.to_string();
        let state = self.state.clone();

        let (stdout_read, mut stdout_write) = tokio::io::duplex(64 * 1024);
        let (stderr_read, mut stderr_write) = tokio::io::duplex(1024);

        let handle = tokio::spawn(async move {
            let data = {
                let state = state.lock().expect("simulator state lock poisoned");
                let (key, snap) = split_snap_spec(&source_spec);
                match state.images.get(key) {
                    Some(image) => match snap {
                        Some(snap_name) => image.snapshot(snap_name).map(|snap| snap.data.clone()),
                        None => Some(image.data.clone()),
                    },
                    None => None,
                }
            };

            let Some(data) = data else {
                let _ = stderr_write
                    .write_all(b"rbd: error opening image: No such file or directory\n")
                    .await;
                return EXIT_NOT_FOUND;
            };

            let mut frame = Vec::with_capacity(DIFF_MAGIC.len() + 8 + data.len());
            frame.extend_from_slice(DIFF_MAGIC);
            frame.extend_from_slice(&(data.len() as u64).to_be_bytes());
            frame.extend_from_slice(&data);

            match stdout_write.write_all(&frame).await {
                Ok(()) => 0,
                Err(_) => 1,
            }
        });

        Ok(SpawnedCommand::new(
            None,
            Some(Box::new(stdout_read) as CommandRead),
            Some(Box::new(stderr_read) as CommandRead),
            async move {
                handle
                    .await
                    .map_err(|e| StorageError::Transport(format!("Simulated child failed: {}", e)))
            },
        ))
    }

    fn spawn_import_diff(&self, args: &ParsedArgs) -> Result<SpawnedCommand> {
        let target_key = args.positional(2)?.to_string();
        let state = self.state.clone();

        let (stdin_write, mut stdin_read) = tokio::io::duplex(64 * 1024);
        let (stderr_read, mut stderr_write) = tokio::io::duplex(1024);

        let handle = tokio::spawn(async move {
            let mut buf = Vec::new();
            if stdin_read.read_to_end(&mut buf).await.is_err() {
                return 1;
            }

            if buf.len() < DIFF_MAGIC.len() + 8 || &buf[..DIFF_MAGIC.len()] != DIFF_MAGIC {
                let _ = stderr_write
                    .write_all(b"rbd: import-diff failed: not a valid diff\n")
                    .await;
                return EXIT_EINVAL;
            }

            let mut length_bytes = [0u8; 8];
            length_bytes.copy_from_slice(&buf[DIFF_MAGIC.len()..DIFF_MAGIC.len() + 8]);
            let length = u64::from_be_bytes(length_bytes) as usize;
            let payload = &buf[DIFF_MAGIC.len() + 8..];
            if payload.len() != length {
                let _ = stderr_write
                    .write_all(b"rbd: import-diff failed: truncated diff\n")
                    .await;
                return EXIT_EINVAL;
            }

            let found = {
                let mut state = state.lock().expect("simulator state lock poisoned");
                match state.images.get_mut(&target_key) {
                    Some(image) => {
                        image.data = payload.to_vec();
                        if image.size_bytes < length as u64 {
                            image.size_bytes = length as u64;
                        }
                        true
                    }
                    None => false,
                }
            };

            if !found {
                let _ = stderr_write
                    .write_all(b"rbd: error opening image: No such file or directory\n")
                    .await;
                return EXIT_NOT_FOUND;
            }

            0
        });

        Ok(SpawnedCommand::new(
            Some(Box::new(stdin_write) as CommandWrite),
            None,
            Some(Box::new(stderr_read) as CommandRead),
            async move {
                handle
                    .await
                    .map_err(|e| StorageError::Transport(format!("Simulated child failed: {}", e)))
            },
        ))
    }
}

#[async_trait]
impl CommandRunner for SimCluster {
    async fn run(
        &self,
        cancel: &CancellationToken,
        program: &str,
        args: &[String],
    ) -> Result<String> {
        if cancel.is_cancelled() {
            return Err(StorageError::Cancelled);
        }

        debug!(program = %program, args = ?args, "Simulating command");

        let parsed = ParsedArgs::parse(args);
        match program {
            "rbd" => self.run_rbd(&parsed),
            "ceph" => self.run_ceph(&parsed),
            other => Err(StorageError::Transport(format!(
                "Simulator does not understand program {:?}",
                other
            ))),
        }
    }

    async fn spawn(
        &self,
        cancel: &CancellationToken,
        program: &str,
        args: &[String],
    ) -> Result<SpawnedCommand> {
        if cancel.is_cancelled() {
            return Err(StorageError::Cancelled);
        }

        debug!(program = %program, args = ?args, "Simulating spawned command");

        let parsed = ParsedArgs::parse(args);
        let subcommand = parsed.positional(0)?;
        match (program, subcommand) {
            ("rbd", "export-diff") => self.spawn_export_diff(&parsed),
            ("rbd", "import-diff") => self.spawn_import_diff(&parsed),
            other => Err(StorageError::Transport(format!(
                "Simulator cannot stream {:?}",
                other
            ))),
        }
    }
}

/// Flags that take a value in the `rbd`/`ceph` invocations the driver
/// issues.
const VALUE_FLAGS: [&str; 11] = [
    "--id",
    "--cluster",
    "--pool",
    "--image",
    "--snap",
    "--format",
    "--size",
    "--from-snap",
    "--data-pool",
    "--image-feature",
    "--name",
];

/// Flags without a value.
const BARE_FLAGS: [&str; 2] = ["--allow-shrink", "--yes-i-really-really-mean-it"];

#[derive(Debug, Default)]
struct ParsedArgs {
    flags: HashMap<String, String>,
    bare_flags: HashSet<String>,
    positionals: Vec<String>,
}

impl ParsedArgs {
    fn parse(args: &[String]) -> Self {
        let mut parsed = Self::default();

        let mut iter = args.iter().peekable();
        while let Some(arg) = iter.next() {
            if VALUE_FLAGS.contains(&arg.as_str()) {
                if let Some(value) = iter.next() {
                    parsed.flags.insert(arg.clone(), value.clone());
                }
            } else if BARE_FLAGS.contains(&arg.as_str()) {
                parsed.bare_flags.insert(arg.clone());
            } else {
                parsed.positionals.push(arg.clone());
            }
        }

        parsed
    }

    fn flag(&self, name: &str) -> Result<&str> {
        self.flags
            .get(name)
            .map(String::as_str)
            .ok_or_else(|| remote(EXIT_EINVAL, &format!("missing {} flag", name)))
    }

    fn has_flag(&self, name: &str) -> bool {
        self.bare_flags.contains(name)
    }

    fn positional(&self, index: usize) -> Result<&str> {
        self.positionals
            .get(index)
            .map(String::as_str)
            .ok_or_else(|| remote(EXIT_EINVAL, "missing argument"))
    }

    /// Pool-qualified key for the image at the given positional index.
    fn image_key(&self, index: usize) -> Result<String> {
        let name = self.positional(index)?;
        if name.contains('/') {
            Ok(name.to_string())
        } else {
            Ok(format!("{}/{}", self.flag("--pool")?, name))
        }
    }

    /// Byte count from the `--size` flag (`<n>B` format).
    fn size_bytes(&self) -> Result<u64> {
        let raw = self.flag("--size")?;
        raw.strip_suffix('B')
            .unwrap_or(raw)
            .parse::<u64>()
            .map_err(|_| remote(EXIT_EINVAL, "invalid size"))
    }
}

fn remote(exit_code: i32, stderr: &str) -> StorageError {
    StorageError::Remote {
        exit_code,
        stderr: stderr.to_string(),
    }
}

/// Split `pool/image` into its components.
fn split_key(key: &str) -> (&str, &str) {
    key.split_once('/').unwrap_or(("", key))
}

/// Split `image@snap` into image and optional snapshot name.
fn split_snap_spec(spec: &str) -> (&str, Option<&str>) {
    match spec.split_once('@') {
        Some((image, snap)) => (image, Some(snap)),
        None => (spec, None),
    }
}

/// Owned variant of [`split_snap_spec`].
fn split_owned_snap_spec(spec: String) -> (String, Option<String>) {
    match spec.split_once('@') {
        Some((image, snap)) => (image.to_string(), Some(snap.to_string())),
        None => (spec, None),
    }
}
