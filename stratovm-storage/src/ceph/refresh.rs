//! Selection of the incremental base snapshot for volume refresh.

use crate::types::Volume;

/// Find the last snapshot common to the source and target of a refresh.
///
/// `target_snapshots` is the wanted snapshot list on the target volume,
/// in catalog order. `refresh_snapshots` holds the names of source
/// snapshots that are missing or out of date on the target. The returned
/// number is the index of the last common snapshot in
/// `target_snapshots`, the base for the incremental stream; `-1` means
/// there is no common snapshot and the refresh must start from scratch.
///
/// The cases, in order:
/// 1. Nothing is marked for refresh: the last target snapshot is the
///    base.
/// 2. The first target snapshot already needs a refresh: no common
///    prefix exists.
/// 3. Otherwise the base is the predecessor of the first snapshot that
///    needs a refresh.
/// 4. Without a single target snapshot there is nothing to base on.
pub fn find_last_common_snapshot_index(
    target_snapshots: &[Volume],
    refresh_snapshots: &[String],
) -> isize {
    if !target_snapshots.is_empty() {
        // Case 1:
        // sourceVol   ->   targetVol
        // \_ snap0         \_ snap0
        // \_ snap1         \_ snap1
        // \_ snap2         \_ snap2
        if refresh_snapshots.is_empty() {
            return target_snapshots.len() as isize - 1;
        }

        // Case 2:
        // sourceVol   ->   targetVol
        // \_ snap0
        // \_ snap1
        // \_ snap2
        if snapshot_leaf_name(&target_snapshots[0]) == refresh_snapshots[0] {
            return -1;
        }

        // Case 3:
        // sourceVol   ->   targetVol
        // \_ snap0         \_ snap0
        // \_ snap1         \_ snap1
        // \_ snap2
        for (i, target_snapshot) in target_snapshots.iter().enumerate() {
            if snapshot_leaf_name(target_snapshot) == refresh_snapshots[0] {
                return i as isize - 1;
            }
        }
    }

    // Case 4.
    -1
}

/// Leaf snapshot name of a snapshot volume (`parent/snap` -> `snap`).
fn snapshot_leaf_name(vol: &Volume) -> &str {
    let (_, snapshot) = vol.parent_and_snapshot();
    snapshot.unwrap_or("")
}

#[cfg(test)]
mod tests {
    use crate::types::{ContentType, Volume, VolumeType};

    use super::*;

    fn snapshots(names: &[&str]) -> Vec<Volume> {
        names
            .iter()
            .map(|name| {
                Volume::new(
                    VolumeType::Container,
                    ContentType::Fs,
                    format!("c1/{}", name),
                    "rbd",
                )
            })
            .collect()
    }

    fn refresh(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_all_snapshots_in_sync() {
        let targets = snapshots(&["s0", "s1", "s2"]);
        assert_eq!(find_last_common_snapshot_index(&targets, &[]), 2);
    }

    #[test]
    fn test_no_common_snapshot() {
        let targets = snapshots(&["s0", "s1", "s2"]);
        assert_eq!(
            find_last_common_snapshot_index(&targets, &refresh(&["s0"])),
            -1
        );
    }

    #[test]
    fn test_base_is_predecessor_of_first_refresh() {
        let targets = snapshots(&["s0", "s1", "s2"]);
        assert_eq!(
            find_last_common_snapshot_index(&targets, &refresh(&["s1", "s2"])),
            0
        );
        assert_eq!(
            find_last_common_snapshot_index(&targets, &refresh(&["s2"])),
            1
        );
    }

    #[test]
    fn test_empty_target() {
        assert_eq!(find_last_common_snapshot_index(&[], &refresh(&["s0"])), -1);
        assert_eq!(find_last_common_snapshot_index(&[], &[]), -1);
    }

    #[test]
    fn test_refresh_snapshot_unknown_to_target() {
        let targets = snapshots(&["s0", "s1"]);
        assert_eq!(
            find_last_common_snapshot_index(&targets, &refresh(&["s9"])),
            -1
        );
    }

    #[test]
    fn test_index_always_within_bounds() {
        let targets = snapshots(&["s0", "s1", "s2"]);
        for refresh_names in [vec![], vec!["s0"], vec!["s1"], vec!["s2"], vec!["s9"]] {
            let refresh_list = refresh(&refresh_names);
            let index = find_last_common_snapshot_index(&targets, &refresh_list);
            assert!(index < targets.len() as isize);
            assert!(index >= -1);
        }
    }
}
