//! End-to-end zombie garbage collection scenarios against the simulated
//! cluster.

use std::sync::Arc;
use std::sync::Once;
use std::time::Duration;

use stratovm_storage::{
    CephRbdConfig, CephRbdDriver, ContentType, DeleteResult, SimCluster, Volume, VolumeType,
};

fn init_logging() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = stratovm_common::init_logging("warn");
    });
}

fn sim_driver(pool: &str) -> (Arc<SimCluster>, CephRbdDriver) {
    init_logging();
    let sim = Arc::new(SimCluster::new(pool));
    let driver = CephRbdDriver::with_runner(CephRbdConfig::new(pool), sim.clone());
    (sim, driver)
}

/// Create an image volume with a protected snapshot and a container
/// cloned from it.
async fn image_with_clone(driver: &CephRbdDriver) -> (Volume, Volume) {
    let image = Volume::new(VolumeType::Image, ContentType::Block, "img1", "rbd");
    driver.create_image(&image, 8 << 20).await.unwrap();
    driver
        .create_image_snapshot(&image, "snapshot_readonly")
        .await
        .unwrap();
    driver
        .protect_image_snapshot(&image, "snapshot_readonly")
        .await
        .unwrap();

    let container = Volume::new(VolumeType::Container, ContentType::Fs, "c1", "rbd");
    driver
        .clone_image(&image, "snapshot_readonly", &container)
        .await
        .unwrap();

    (image, container)
}

#[tokio::test]
async fn test_delete_volume_without_dependents() {
    let (sim, driver) = sim_driver("rbd");

    let vol = Volume::new(VolumeType::Custom, ContentType::Block, "foo", "rbd");
    driver.create_image(&vol, 10 << 20).await.unwrap();
    assert!(sim.has_image("rbd", "custom_foo.block"));

    let result = driver.delete_volume(&vol).await.unwrap();
    assert_eq!(result, DeleteResult::Deleted);
    assert!(sim.pool_is_empty("rbd"));
}

#[tokio::test]
async fn test_delete_volume_is_idempotent_for_missing_images() {
    let (sim, driver) = sim_driver("rbd");

    let vol = Volume::new(VolumeType::Custom, ContentType::Fs, "ghost", "rbd");
    let result = driver.delete_volume(&vol).await.unwrap();
    assert_eq!(result, DeleteResult::Deleted);
    assert!(sim.pool_is_empty("rbd"));
}

#[tokio::test]
async fn test_delete_image_with_live_clone_leaves_zombie() {
    let (sim, driver) = sim_driver("rbd");
    let (image, _container) = image_with_clone(&driver).await;

    let result = driver.delete_volume(&image).await.unwrap();
    assert_eq!(result, DeleteResult::Zombified);

    // The image was renamed out of the catalog, its snapshot tombstoned
    // but still protected, and the clone left untouched.
    let names = sim.image_names("rbd");
    assert_eq!(names.len(), 2);
    assert!(names.contains(&"container_c1".to_string()));

    let zombie = names
        .iter()
        .find(|name| name.starts_with("zombie_image_img1_"))
        .expect("zombie image missing");
    assert!(zombie.ends_with("_ext4.block"));

    let snapshots = sim.snapshot_names("rbd", zombie);
    assert_eq!(snapshots.len(), 1);
    assert!(snapshots[0].starts_with("zombie_snapshot_"));
    assert!(sim.snapshot_protected("rbd", zombie, &snapshots[0]));
}

#[tokio::test]
async fn test_deleting_last_clone_reaps_zombie_parent() {
    let (sim, driver) = sim_driver("rbd");
    let (image, container) = image_with_clone(&driver).await;

    let result = driver.delete_volume(&image).await.unwrap();
    assert_eq!(result, DeleteResult::Zombified);

    // Dropping the last dependent walks the parent chain and reaps the
    // zombie image and its tombstoned snapshot.
    let result = driver.delete_volume(&container).await.unwrap();
    assert_eq!(result, DeleteResult::Deleted);
    assert!(sim.pool_is_empty("rbd"));
}

#[tokio::test]
async fn test_deleting_clone_keeps_live_parent() {
    let (sim, driver) = sim_driver("rbd");
    let (_image, container) = image_with_clone(&driver).await;

    let result = driver.delete_volume(&container).await.unwrap();
    assert_eq!(result, DeleteResult::Deleted);

    // The image is still in the catalog, so the clone's parent snapshot
    // must survive.
    assert_eq!(sim.image_names("rbd"), vec!["image_img1_ext4.block"]);
    assert_eq!(
        sim.snapshot_names("rbd", "image_img1_ext4.block"),
        vec!["snapshot_readonly"]
    );
    assert!(sim.snapshot_protected("rbd", "image_img1_ext4.block", "snapshot_readonly"));
}

#[tokio::test]
async fn test_zombie_chain_is_reaped_bottom_up() {
    let (sim, driver) = sim_driver("rbd");

    // image -> c1 (clone) -> c2 (clone of a c1 snapshot)
    let image = Volume::new(VolumeType::Image, ContentType::Fs, "img", "rbd");
    driver.create_image(&image, 4 << 20).await.unwrap();
    driver
        .create_image_snapshot(&image, "snapshot_base")
        .await
        .unwrap();
    driver
        .protect_image_snapshot(&image, "snapshot_base")
        .await
        .unwrap();

    let c1 = Volume::new(VolumeType::Container, ContentType::Fs, "c1", "rbd");
    driver.clone_image(&image, "snapshot_base", &c1).await.unwrap();
    driver.create_image_snapshot(&c1, "snapshot_s0").await.unwrap();
    driver.protect_image_snapshot(&c1, "snapshot_s0").await.unwrap();

    let c2 = Volume::new(VolumeType::Container, ContentType::Fs, "c2", "rbd");
    driver.clone_image(&c1, "snapshot_s0", &c2).await.unwrap();

    // Deleting the middle of the chain and then the root only produces
    // zombies; everything is still needed by c2.
    assert_eq!(
        driver.delete_volume(&c1).await.unwrap(),
        DeleteResult::Zombified
    );
    assert_eq!(
        driver.delete_volume(&image).await.unwrap(),
        DeleteResult::Zombified
    );
    assert_eq!(sim.image_names("rbd").len(), 3);

    // Dropping the leaf reaps the whole chain.
    assert_eq!(
        driver.delete_volume(&c2).await.unwrap(),
        DeleteResult::Deleted
    );
    assert!(sim.pool_is_empty("rbd"));
}

#[tokio::test(start_paused = true)]
async fn test_unmap_retries_while_busy() {
    let (sim, driver) = sim_driver("rbd");

    let vol = Volume::new(VolumeType::Custom, ContentType::Fs, "busy", "rbd");
    driver.create_image(&vol, 1 << 20).await.unwrap();
    driver.map_image(&vol).await.unwrap();
    assert_eq!(sim.mapped_count("rbd"), 1);

    sim.inject_unmap_busy(2);

    let started = tokio::time::Instant::now();
    driver.unmap_image(&vol, false).await.unwrap();

    // Two EBUSY rounds mean two one-second pauses before the unmap went
    // through.
    assert!(started.elapsed() >= Duration::from_secs(2));
    assert_eq!(sim.mapped_count("rbd"), 0);
}

#[tokio::test]
async fn test_delete_image_surfaces_snapshot_refusal() {
    let (_sim, driver) = sim_driver("rbd");

    let vol = Volume::new(VolumeType::Custom, ContentType::Fs, "a", "rbd");
    driver.create_image(&vol, 1 << 20).await.unwrap();
    driver
        .create_image_snapshot(&vol, "snapshot_s0")
        .await
        .unwrap();

    // rbd rm refuses to remove an image with live snapshots; the error
    // must surface rather than turn into a silent success.
    let err = driver.delete_image(&vol).await.unwrap_err();
    assert_eq!(err.exit_code(), Some(39));
}

#[tokio::test]
async fn test_resize_rounds_and_guards_shrink() {
    let (sim, driver) = sim_driver("rbd");

    let vol = Volume::new(VolumeType::Custom, ContentType::Fs, "vol1", "rbd");
    driver.create_image(&vol, (1 << 20) + 1).await.unwrap();
    assert_eq!(
        sim.image_size("rbd", "custom_vol1"),
        Some((1 << 20) + 512)
    );

    driver.resize_image(&vol, 4 << 20, false).await.unwrap();
    assert_eq!(sim.image_size("rbd", "custom_vol1"), Some(4 << 20));

    let err = driver.resize_image(&vol, 2 << 20, false).await.unwrap_err();
    assert_eq!(err.exit_code(), Some(22));

    driver.resize_image(&vol, 2 << 20, true).await.unwrap();
    assert_eq!(sim.image_size("rbd", "custom_vol1"), Some(2 << 20));
}
