//! Replication pipeline scenarios against the simulated cluster.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use stratovm_storage::{
    CephRbdConfig, CephRbdDriver, ContentType, ProgressTracker, SimCluster, StorageError, Volume,
    VolumeType,
};

fn sim_driver() -> (Arc<SimCluster>, CephRbdDriver) {
    let sim = Arc::new(SimCluster::new("pool1"));
    sim.add_pool("pool2");
    let driver = CephRbdDriver::with_runner(CephRbdConfig::new("pool1"), sim.clone());
    (sim, driver)
}

fn payload(len: usize, seed: u8) -> Vec<u8> {
    (0..len).map(|i| (i as u8).wrapping_mul(seed)).collect()
}

#[tokio::test]
async fn test_send_receive_round_trip() {
    let (sim, driver) = sim_driver();

    let data = payload(256 * 1024, 7);
    sim.seed_image("pool1", "container_a", &data);

    let vol = Volume::new(VolumeType::Container, ContentType::Fs, "a", "pool1");
    driver
        .create_image_snapshot(&vol, "snapshot_snap0")
        .await
        .unwrap();

    // The receiving side pre-creates the target image.
    sim.seed_image("pool2", "container_a", &[]);

    let (local, remote) = tokio::io::duplex(64 * 1024);
    let (send_result, recv_result) = tokio::join!(
        driver.send_volume(local, "pool1/container_a@snapshot_snap0", None, None),
        driver.receive_volume("pool2/container_a", remote, None),
    );
    send_result.unwrap();
    recv_result.unwrap();

    assert_eq!(sim.image_data("pool2", "container_a").unwrap(), data);
}

#[tokio::test]
async fn test_incremental_send_chain() {
    let (sim, driver) = sim_driver();

    let v1 = payload(64 * 1024, 3);
    let v2 = payload(64 * 1024, 5);
    let v3 = payload(96 * 1024, 11);

    sim.seed_image("pool1", "container_a", &v1);
    let vol = Volume::new(VolumeType::Container, ContentType::Fs, "a", "pool1");
    driver
        .create_image_snapshot(&vol, "snapshot_snap0")
        .await
        .unwrap();
    sim.write_image_data("pool1", "container_a", &v2);
    driver
        .create_image_snapshot(&vol, "snapshot_snap1")
        .await
        .unwrap();
    sim.write_image_data("pool1", "container_a", &v3);

    sim.seed_image("pool2", "container_a", &[]);

    // The refresh choreography: base snapshot, intermediate snapshot,
    // then the head on top of the last snapshot.
    let passes: [(&str, Option<&str>); 3] = [
        ("pool1/container_a@snapshot_snap0", None),
        ("pool1/container_a@snapshot_snap1", Some("snapshot_snap0")),
        ("pool1/container_a", Some("snapshot_snap1")),
    ];

    for (source, parent) in passes {
        let (local, remote) = tokio::io::duplex(64 * 1024);
        let (send_result, recv_result) = tokio::join!(
            driver.send_volume(local, source, parent, None),
            driver.receive_volume("pool2/container_a", remote, None),
        );
        send_result.unwrap();
        recv_result.unwrap();
    }

    assert_eq!(sim.image_data("pool2", "container_a").unwrap(), v3);
}

#[tokio::test]
async fn test_send_reports_progress() {
    let (sim, driver) = sim_driver();

    let data = payload(128 * 1024, 13);
    sim.seed_image("pool1", "container_a", &data);
    sim.seed_image("pool2", "container_a", &[]);

    let sent = Arc::new(AtomicU64::new(0));
    let tracker = ProgressTracker::new({
        let sent = sent.clone();
        move |total| sent.store(total, Ordering::Relaxed)
    });

    let (local, remote) = tokio::io::duplex(64 * 1024);
    let (send_result, recv_result) = tokio::join!(
        driver.send_volume(local, "pool1/container_a", None, Some(tracker)),
        driver.receive_volume("pool2/container_a", remote, None),
    );
    send_result.unwrap();
    recv_result.unwrap();

    // The tracker saw at least the image payload go by.
    assert!(sent.load(Ordering::Relaxed) >= data.len() as u64);
}

#[tokio::test]
async fn test_receive_into_missing_image_fails() {
    let (sim, driver) = sim_driver();

    let data = payload(8 * 1024, 17);
    sim.seed_image("pool1", "container_a", &data);

    let (local, remote) = tokio::io::duplex(64 * 1024);
    let (send_result, recv_result) = tokio::join!(
        driver.send_volume(local, "pool1/container_a", None, None),
        driver.receive_volume("pool2/container_missing", remote, None),
    );

    send_result.unwrap();
    let err = recv_result.unwrap_err();
    assert_eq!(err.exit_code(), Some(2));
}

#[tokio::test]
async fn test_copy_volume_diff() {
    let (sim, driver) = sim_driver();

    let data = payload(200 * 1024, 19);
    sim.seed_image("pool1", "custom_src", &data);
    sim.seed_image("pool2", "custom_dst", &[]);

    driver
        .copy_volume_diff("pool1/custom_src", "pool2/custom_dst", None)
        .await
        .unwrap();

    assert_eq!(sim.image_data("pool2", "custom_dst").unwrap(), data);
}

#[tokio::test]
async fn test_copy_volume_diff_with_parent_snapshot() {
    let (sim, driver) = sim_driver();

    let old = payload(32 * 1024, 23);
    let new = payload(48 * 1024, 29);

    sim.seed_image("pool1", "custom_src", &old);
    let vol = Volume::new(VolumeType::Custom, ContentType::Fs, "src", "pool1");
    driver
        .create_image_snapshot(&vol, "snapshot_s0")
        .await
        .unwrap();
    sim.write_image_data("pool1", "custom_src", &new);

    sim.seed_image("pool2", "custom_dst", &old);

    driver
        .copy_volume_diff("pool1/custom_src", "pool2/custom_dst", Some("snapshot_s0"))
        .await
        .unwrap();

    assert_eq!(sim.image_data("pool2", "custom_dst").unwrap(), new);
}

#[tokio::test]
async fn test_cancelled_driver_refuses_replication() {
    let (sim, driver) = sim_driver();
    sim.seed_image("pool1", "container_a", b"data");

    driver.cancellation_token().cancel();

    let (local, _remote) = tokio::io::duplex(1024);
    let err = driver
        .send_volume(local, "pool1/container_a", None, None)
        .await
        .unwrap_err();
    assert!(matches!(err, StorageError::Cancelled));
}
