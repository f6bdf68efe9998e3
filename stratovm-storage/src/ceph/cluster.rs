//! Cluster introspection and CephFS side-channel probes.

use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::{info, warn};

use crate::error::{Result, StorageError};
use crate::types::Monitors;

use super::rbd::EXIT_NOT_FOUND;
use super::CephRbdDriver;

#[derive(Deserialize)]
struct MonDump {
    mons: Vec<MonEntry>,
}

#[derive(Deserialize)]
struct MonEntry {
    public_addrs: PublicAddrs,
}

#[derive(Deserialize)]
struct PublicAddrs {
    addrvec: Vec<MonAddr>,
}

#[derive(Deserialize)]
struct MonAddr {
    #[serde(rename = "type")]
    kind: String,
    addr: String,
}

impl CephRbdDriver {
    /// Run `ceph` with the driver's identity and parse its JSON output.
    async fn call_ceph_json<T: DeserializeOwned>(&self, args: &[&str]) -> Result<T> {
        let mut full_args = vec!["--format".to_string(), "json".to_string()];
        full_args.extend(self.ceph_name_args());
        full_args.extend(args.iter().map(|s| s.to_string()));

        let output = self.run_ceph(full_args).await?;

        serde_json::from_str(output.trim())
            .map_err(|e| StorageError::Parse(format!("Failed to parse ceph output: {}", e)))
    }

    /// Public monitor addresses of the cluster, grouped by messenger
    /// protocol version.
    pub async fn monitors(&self) -> Result<Monitors> {
        // The monitor dump carries the public address vectors; there may
        // be better ways but this is quick and easy.
        let dump: MonDump = self.call_ceph_json(&["mon", "dump"]).await?;

        let mut monitors = Monitors::default();
        for mon in dump.mons {
            for addr in mon.public_addrs.addrvec {
                match addr.kind.as_str() {
                    "v1" => monitors.v1.push(addr.addr),
                    "v2" => monitors.v2.push(addr.addr),
                    _ => warn!(
                        kind = %addr.kind,
                        addr = %addr.addr,
                        "Unknown ceph monitor address type"
                    ),
                }
            }
        }

        if monitors.v2.is_empty() {
            if monitors.v1.is_empty() {
                return Err(StorageError::NotFound(format!(
                    "No ceph monitors for {:?}",
                    self.config().cluster_name
                )));
            }

            warn!(
                cluster = %self.config().cluster_name,
                "Only found v1 monitors for ceph cluster"
            );
        }

        Ok(monitors)
    }

    /// CephX key of the driver's client, or an empty string when the
    /// cluster has cephx disabled.
    pub async fn keyring(&self) -> Result<String> {
        let client = format!("client.{}", self.config().user_name);

        let mut args = self.ceph_name_args();
        args.extend([
            "config".to_string(),
            "get".to_string(),
            client.clone(),
            "auth_service_required".to_string(),
        ]);

        let auth_type = self.run_ceph(args).await?;
        if auth_type.trim() == "none" {
            info!(cluster = %self.config().cluster_name, "Ceph cluster has disabled cephx");
            return Ok(String::new());
        }

        #[derive(Deserialize)]
        struct KeyOutput {
            key: String,
        }

        let output: KeyOutput = self.call_ceph_json(&["auth", "get-key", &client]).await?;
        Ok(output.key)
    }

    /// FSID of the cluster.
    pub async fn fsid(&self) -> Result<String> {
        #[derive(Deserialize)]
        struct FsidOutput {
            fsid: String,
        }

        let output: FsidOutput = self.call_ceph_json(&["fsid"]).await?;
        Ok(output.fsid)
    }

    /// Global OSD default pool size, used for pools created without an
    /// explicit size.
    pub async fn osd_pool_default_size(&self) -> Result<i64> {
        self.call_ceph_json(&["config", "get", "mon", "osd_pool_default_size"])
            .await
    }

    /// Whether the driver's OSD pool exists.
    ///
    /// Exit status 2 means the pool definitely does not exist. Any other
    /// failure leaves the question open (network issue, internal ceph
    /// issue) and surfaces as an error.
    pub async fn osd_pool_exists(&self) -> Result<bool> {
        let mut args = self.ceph_name_args();
        args.extend([
            "osd".to_string(),
            "pool".to_string(),
            "get".to_string(),
            self.config().pool_name.clone(),
            "size".to_string(),
        ]);

        match self.run_ceph(args).await {
            Ok(_) => Ok(true),
            Err(err) if err.exit_code() == Some(EXIT_NOT_FOUND) => Ok(false),
            Err(err) => Err(err),
        }
    }

    /// Whether a CephFS filesystem exists on the cluster. Same exit
    /// status contract as [`osd_pool_exists`](Self::osd_pool_exists).
    pub async fn fs_exists(&self, fs_name: &str) -> Result<bool> {
        let mut args = self.ceph_name_args();
        args.extend(["fs".to_string(), "get".to_string(), fs_name.to_string()]);

        match self.run_ceph(args).await {
            Ok(_) => Ok(true),
            Err(err) if err.exit_code() == Some(EXIT_NOT_FOUND) => Ok(false),
            Err(err) => Err(err),
        }
    }

    /// Destroy the driver's OSD pool including any volumes still in it.
    ///
    /// Deleting a pool that does not exist still exits 0; callers that
    /// need certainty must probe for existence first.
    pub async fn osd_delete_pool(&self) -> Result<()> {
        let mut args = self.ceph_name_args();
        args.extend([
            "osd".to_string(),
            "pool".to_string(),
            "delete".to_string(),
            self.config().pool_name.clone(),
            self.config().pool_name.clone(),
            "--yes-i-really-really-mean-it".to_string(),
        ]);

        self.run_ceph(args).await?;
        Ok(())
    }
}

/// Build a CephFS mount source string and option list.
///
/// The source has the form `user@fsid.fsName=path`. The options carry the
/// monitor addresses, the user name, the secret when cephx is enabled,
/// and the messenger mode: `prefer-crc` when any v2 monitor is
/// available, `legacy` otherwise.
pub fn build_mount(
    user: &str,
    key: &str,
    fsid: &str,
    monitors: &Monitors,
    fs_name: &str,
    path: &str,
) -> (String, Vec<String>) {
    // Ceph mount paths must begin with a '/'; prefix it now if absent.
    // The leading '/' can be stripped out during option parsing.
    let path = if path.starts_with('/') {
        path.to_string()
    } else {
        format!("/{}", path)
    };

    let (msgr_v2, mon_addrs) = if monitors.v2.is_empty() {
        (false, &monitors.v1)
    } else {
        (true, &monitors.v2)
    };

    let source = format!("{}@{}.{}={}", user, fsid, fs_name, path);

    let mut options = vec![
        format!("mon_addr={}", mon_addrs.join("/")),
        format!("name={}", user),
    ];

    // A blank key means cephx is disabled.
    if !key.is_empty() {
        options.push(format!("secret={}", key));
    }

    options.push(
        if msgr_v2 {
            "ms_mode=prefer-crc"
        } else {
            "ms_mode=legacy"
        }
        .to_string(),
    );

    (source, options)
}
