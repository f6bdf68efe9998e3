//! RBD image naming discipline and name parsers.
//!
//! The parent/clone dependency graph is encoded entirely in on-disk image
//! names, so every attribute of a [`Volume`] must survive a round trip
//! through [`rbd_image_name`] and [`parse_parent`].

use std::collections::HashMap;

use crate::error::{Result, StorageError};
use crate::types::{ContentType, Volume, VolumeType};

/// Suffix used for block content type volumes.
pub(crate) const BLOCK_VOL_SUFFIX: &str = ".block";

/// Suffix used for iso content type volumes.
pub(crate) const ISO_VOL_SUFFIX: &str = ".iso";

/// Prefix marking entities dropped from the volume catalog but kept on
/// disk for their dependents.
pub(crate) const ZOMBIE_PREFIX: &str = "zombie_";

/// Prefix qualifying user snapshot names on disk.
pub const SNAPSHOT_PREFIX: &str = "snapshot_";

/// Volume types recognized in image names, longest tag first so that
/// `image_` never matches inside another tag.
const PARSED_VOLUME_TYPES: [VolumeType; 4] = [
    VolumeType::VirtualMachine,
    VolumeType::Container,
    VolumeType::Custom,
    VolumeType::Image,
];

/// Return the RBD image name for a volume as used by the `rbd` tool.
///
/// A snapshot reference in the volume name is qualified with
/// `snapshot_`; an explicit `snap_name` takes precedence and is used
/// verbatim (see `man 8 rbd` for the snap-spec format). Image volumes
/// carry their filesystem as a name suffix for all content types. With
/// `with_pool` the result is prefixed `<pool>/`.
pub fn rbd_image_name(vol: &Volume, snap_name: Option<&str>, with_pool: bool, pool: &str) -> String {
    let (parent, vol_snap) = vol.parent_and_snapshot();
    let mut parent = parent.to_string();
    let vol_snap = vol_snap.map(|snap| format!("{}{}", SNAPSHOT_PREFIX, snap));

    if matches!(vol.vol_type, VolumeType::Image | VolumeType::ZombieImage) {
        parent = format!("{}_{}", parent, vol.block_filesystem());
    }

    match vol.content_type {
        ContentType::Block => parent.push_str(BLOCK_VOL_SUFFIX),
        ContentType::Iso => parent.push_str(ISO_VOL_SUFFIX),
        ContentType::Fs => {}
    }

    let mut image_name = format!("{}_{}", vol.vol_type.tag(), parent);

    // A deleted volume is no longer tracked in the catalog; its name says
    // so.
    if vol.is_deleted {
        image_name = format!("{}{}", ZOMBIE_PREFIX, image_name);
    }

    if let Some(snap) = snap_name {
        image_name = format!("{}@{}", image_name, snap);
    } else if let Some(snap) = vol_snap {
        image_name = format!("{}@{}", image_name, snap);
    }

    if with_pool {
        image_name = format!("{}/{}", pool, image_name);
    }

    image_name
}

/// Split a parent path like `<pool>/<prefix>_<name>@<snap>` back into a
/// volume and on-disk snapshot name. Inverse of [`rbd_image_name`].
pub fn parse_parent(parent: &str) -> Result<(Volume, String)> {
    let (pool, body) = parent
        .split_once('/')
        .ok_or_else(|| StorageError::Parse(format!("Pool delimiter not found in {:?}", parent)))?;

    let (body, is_deleted) = match body.strip_prefix(ZOMBIE_PREFIX) {
        Some(rest) => (rest, true),
        None => (body, false),
    };

    let (vol_type, rest) = match_volume_type(body)
        .ok_or_else(|| StorageError::Parse(format!("Unrecognized parent {:?}", parent)))?;

    let (name_part, snap_name) = match rest.rsplit_once('@') {
        Some((name, snap)) => (name, snap.to_string()),
        None => (rest, String::new()),
    };

    let (name, content_type) = split_content_suffix(name_part);
    let mut name = name.to_string();

    // Image names carry their filesystem as the last underscore field.
    let mut config = HashMap::new();
    if vol_type == VolumeType::Image {
        if let Some((base, filesystem)) = name.rsplit_once('_') {
            config.insert("block.filesystem".to_string(), filesystem.to_string());
            name = base.to_string();
        }
    }

    let vol = Volume {
        name,
        vol_type,
        content_type,
        pool: pool.to_string(),
        config,
        is_deleted,
    };

    Ok((vol, snap_name))
}

/// Components of a clone path returned by `rbd children`.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedClone {
    /// OSD pool holding the clone.
    pub pool: String,
    /// Volume type parsed from the name prefix.
    pub vol_type: VolumeType,
    /// Logical volume name.
    pub name: String,
    /// Content type parsed from the name suffix.
    pub content_type: ContentType,
    /// Filesystem suffix, for image type clones.
    pub filesystem: Option<String>,
    /// Whether the clone is in zombie state.
    pub is_deleted: bool,
}

impl ParsedClone {
    /// Reassemble the volume handle for this clone.
    pub fn into_volume(self) -> Volume {
        let mut vol = Volume::new(self.vol_type, self.content_type, self.name, self.pool);
        if let Some(filesystem) = self.filesystem {
            vol = vol.with_config("block.filesystem", filesystem);
        }
        vol.is_deleted = self.is_deleted;
        vol
    }
}

/// Split a clone path like `<pool>/<prefix>_<name>` into its components.
pub fn parse_clone(clone: &str) -> Result<ParsedClone> {
    let (pool, body) = clone
        .split_once('/')
        .ok_or_else(|| StorageError::Parse(format!("Pool delimiter not found in {:?}", clone)))?;

    let (body, is_deleted) = match body.strip_prefix(ZOMBIE_PREFIX) {
        Some(rest) => (rest, true),
        None => (body, false),
    };

    let (vol_type, rest) = match_volume_type(body)
        .ok_or_else(|| StorageError::Parse(format!("Unrecognized clone {:?}", clone)))?;

    let (name, content_type) = split_content_suffix(rest);
    let mut name = name.to_string();

    let mut filesystem = None;
    if vol_type == VolumeType::Image {
        if let Some((base, fs)) = name.rsplit_once('_') {
            filesystem = Some(fs.to_string());
            name = base.to_string();
        }
    }

    Ok(ParsedClone {
        pool: pool.to_string(),
        vol_type,
        name,
        content_type,
        filesystem,
        is_deleted,
    })
}

/// Match a `<type>_` prefix, longest tag first.
fn match_volume_type(body: &str) -> Option<(VolumeType, &str)> {
    PARSED_VOLUME_TYPES.iter().find_map(|vol_type| {
        body.strip_prefix(vol_type.tag())
            .and_then(|rest| rest.strip_prefix('_'))
            .map(|rest| (*vol_type, rest))
    })
}

/// Strip a trailing content type suffix off an image name.
fn split_content_suffix(name: &str) -> (&str, ContentType) {
    if let Some(stripped) = name.strip_suffix(BLOCK_VOL_SUFFIX) {
        (stripped, ContentType::Block)
    } else if let Some(stripped) = name.strip_suffix(ISO_VOL_SUFFIX) {
        (stripped, ContentType::Iso)
    } else {
        (name, ContentType::Fs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_plain_volumes() {
        let vol = Volume::new(VolumeType::Custom, ContentType::Block, "foo", "rbd");
        assert_eq!(rbd_image_name(&vol, None, false, "rbd"), "custom_foo.block");
        assert_eq!(rbd_image_name(&vol, None, true, "rbd"), "rbd/custom_foo.block");

        let vol = Volume::new(VolumeType::Container, ContentType::Fs, "c1", "rbd");
        assert_eq!(rbd_image_name(&vol, None, false, "rbd"), "container_c1");

        let vol = Volume::new(VolumeType::VirtualMachine, ContentType::Block, "v1", "rbd");
        assert_eq!(rbd_image_name(&vol, None, false, "rbd"), "virtual_machine_v1.block");
    }

    #[test]
    fn test_encode_image_filesystem_suffix() {
        let vol = Volume::new(VolumeType::Image, ContentType::Block, "img1", "rbd");
        assert_eq!(rbd_image_name(&vol, None, false, "rbd"), "image_img1_ext4.block");

        let vol = Volume::new(VolumeType::Image, ContentType::Fs, "img1", "rbd")
            .with_config("block.filesystem", "xfs");
        assert_eq!(rbd_image_name(&vol, None, false, "rbd"), "image_img1_xfs");
    }

    #[test]
    fn test_encode_zombie_prefix() {
        let mut vol = Volume::new(VolumeType::Image, ContentType::Block, "img1", "rbd");
        vol.is_deleted = true;
        assert_eq!(
            rbd_image_name(&vol, None, false, "rbd"),
            "zombie_image_img1_ext4.block"
        );

        let vol = Volume::new(VolumeType::ZombieImage, ContentType::Block, "img1", "rbd");
        assert_eq!(
            rbd_image_name(&vol, None, false, "rbd"),
            "zombie_image_img1_ext4.block"
        );
    }

    #[test]
    fn test_encode_snapshot_names() {
        let vol = Volume::new(VolumeType::Container, ContentType::Fs, "c1/snap0", "rbd");
        assert_eq!(
            rbd_image_name(&vol, None, false, "rbd"),
            "container_c1@snapshot_snap0"
        );

        // An explicit snapshot name is used verbatim and wins over the
        // volume's own snapshot reference.
        let vol = Volume::new(VolumeType::Container, ContentType::Fs, "c1", "rbd");
        assert_eq!(
            rbd_image_name(&vol, Some("zombie_snapshot_x"), true, "pool1"),
            "pool1/container_c1@zombie_snapshot_x"
        );
    }

    #[test]
    fn test_parse_parent_roundtrip() {
        let fs_configs: [Option<&str>; 2] = [None, Some("xfs")];
        let types = [
            VolumeType::Container,
            VolumeType::VirtualMachine,
            VolumeType::Image,
            VolumeType::Custom,
        ];
        let contents = [ContentType::Fs, ContentType::Block, ContentType::Iso];

        for vol_type in types {
            for content_type in contents {
                for is_deleted in [false, true] {
                    for name in ["vol1", "vol1/snap0"] {
                        for fs in fs_configs {
                            let mut vol = Volume::new(vol_type, content_type, name, "rbd");
                            vol.is_deleted = is_deleted;
                            if let Some(fs) = fs {
                                vol = vol.with_config("block.filesystem", fs);
                            }

                            let encoded = rbd_image_name(&vol, None, true, "rbd");
                            let (decoded, snap) = parse_parent(&encoded).unwrap();

                            assert_eq!(decoded.vol_type, vol_type, "{}", encoded);
                            assert_eq!(decoded.content_type, content_type, "{}", encoded);
                            assert_eq!(decoded.is_deleted, is_deleted, "{}", encoded);
                            assert_eq!(decoded.pool, "rbd", "{}", encoded);

                            let (parent, vol_snap) = vol.parent_and_snapshot();
                            assert_eq!(decoded.name, parent, "{}", encoded);
                            match vol_snap {
                                Some(s) => assert_eq!(snap, format!("snapshot_{}", s)),
                                None => assert!(snap.is_empty()),
                            }

                            if vol_type == VolumeType::Image {
                                assert_eq!(
                                    decoded.block_filesystem(),
                                    vol.block_filesystem(),
                                    "{}",
                                    encoded
                                );
                            }
                        }
                    }
                }
            }
        }
    }

    #[test]
    fn test_parse_parent_zombie_snapshot() {
        let (vol, snap) =
            parse_parent("rbd/zombie_image_img1_ext4.block@zombie_snapshot_0c0c").unwrap();
        assert_eq!(vol.vol_type, VolumeType::Image);
        assert_eq!(vol.content_type, ContentType::Block);
        assert!(vol.is_deleted);
        assert_eq!(vol.name, "img1");
        assert_eq!(vol.block_filesystem(), "ext4");
        assert_eq!(snap, "zombie_snapshot_0c0c");
    }

    #[test]
    fn test_parse_parent_rejects_unknown_prefix() {
        assert!(parse_parent("rbd/widget_foo").is_err());
        assert!(parse_parent("no-pool-delimiter").is_err());
    }

    #[test]
    fn test_parse_clone() {
        let clone = parse_clone("rbd/container_c1").unwrap();
        assert_eq!(clone.pool, "rbd");
        assert_eq!(clone.vol_type, VolumeType::Container);
        assert_eq!(clone.name, "c1");
        assert_eq!(clone.content_type, ContentType::Fs);
        assert!(!clone.is_deleted);

        let clone = parse_clone("rbd/zombie_virtual_machine_v1.block").unwrap();
        assert_eq!(clone.vol_type, VolumeType::VirtualMachine);
        assert_eq!(clone.name, "v1");
        assert_eq!(clone.content_type, ContentType::Block);
        assert!(clone.is_deleted);

        let vol = clone.into_volume();
        assert_eq!(
            rbd_image_name(&vol, None, false, "rbd"),
            "zombie_virtual_machine_v1.block"
        );

        assert!(parse_clone("rbd/widget_foo").is_err());
    }

    #[test]
    fn test_parse_clone_image_filesystem() {
        let clone = parse_clone("rbd/zombie_image_img1_ext4.block").unwrap();
        assert_eq!(clone.vol_type, VolumeType::Image);
        assert_eq!(clone.name, "img1");
        assert_eq!(clone.filesystem.as_deref(), Some("ext4"));

        let vol = clone.into_volume();
        assert_eq!(
            rbd_image_name(&vol, None, false, "rbd"),
            "zombie_image_img1_ext4.block"
        );
    }
}
