//! End-to-end volume lifecycle through the bootstrapped managers, backed by
//! the simulated storage backend and OS driver.

#[path = "common/test_constants.rs"]
mod test_constants;

use std::time::Duration;

use camino::Utf8PathBuf;
use rstest::{fixture, rstest};
use tempfile::TempDir;
use volplane::test_support::{SimOsDriver, SimStorageDriver};
use volplane::{Config, DriverManager, DriverRegistry, ErrorKind, MountOptions, VolplaneError};

use test_constants::{DEFAULT_VOLUME_SIZE_GIB, SIM_BACKEND, SIM_OS};

struct Harness {
    root: TempDir,
    sim: SimStorageDriver,
    os: SimOsDriver,
    manager: DriverManager,
}

impl Harness {
    fn build(adjust: impl FnOnce(&mut Config)) -> Self {
        let root = TempDir::new().unwrap_or_else(|err| panic!("temp dir: {err}"));
        let sim = SimStorageDriver::new(SIM_BACKEND);
        let os = SimOsDriver::named(SIM_OS);
        let mut registry = DriverRegistry::with_builtin_drivers();
        registry.register_storage(SIM_BACKEND, sim.init());
        registry.register_os(SIM_OS, os.init());

        let mut config = Config {
            os_drivers: String::from(SIM_OS),
            mount_root: root_path(&root).to_string(),
            ..Config::baseline()
        };
        adjust(&mut config);
        let manager = DriverManager::new(&config, &registry);
        Self {
            root,
            sim,
            os,
            manager,
        }
    }

    fn expected_target(&self, name: &str) -> Utf8PathBuf {
        root_path(&self.root).join(name)
    }

    fn device_of(volume_id: &str) -> String {
        format!("/dev/disk/sim/{volume_id}")
    }
}

fn root_path(root: &TempDir) -> Utf8PathBuf {
    Utf8PathBuf::from_path_buf(root.path().to_path_buf())
        .unwrap_or_else(|path| panic!("non UTF-8 temp path: {}", path.display()))
}

#[fixture]
fn harness() -> Harness {
    Harness::build(|_| {})
}

#[rstest]
#[tokio::test]
async fn create_mount_remove_scenario(harness: Harness) {
    let volumes = harness.manager.volume();

    let created = volumes
        .create("data1")
        .await
        .unwrap_or_else(|err| panic!("create: {err}"));
    assert_eq!(created.size_gib, DEFAULT_VOLUME_SIZE_GIB);
    let again = volumes
        .create("data1")
        .await
        .unwrap_or_else(|err| panic!("second create: {err}"));
    assert_eq!(again.volume_id, created.volume_id);
    assert_eq!(harness.sim.create_calls(), 1);

    let target = volumes
        .mount("", "data1", &MountOptions::default())
        .await
        .unwrap_or_else(|err| panic!("mount: {err}"));
    assert_eq!(target, harness.expected_target("data1"));
    assert!(target.is_dir());
    assert_eq!(harness.sim.attach_calls(), 1);
    assert_eq!(harness.os.format_count(), 1);
    let device = Harness::device_of(&created.volume_id);
    assert_eq!(harness.os.fs_type(&device).as_deref(), Some("ext4"));

    let remounted = volumes
        .mount("", "data1", &MountOptions::default())
        .await
        .unwrap_or_else(|err| panic!("second mount: {err}"));
    assert_eq!(remounted, target);
    assert_eq!(harness.os.format_count(), 1);
    assert_eq!(harness.os.mount_calls(), 1);
    assert_eq!(harness.sim.attach_calls(), 1);

    let path = volumes
        .path(&created.volume_id, "")
        .await
        .unwrap_or_else(|err| panic!("path: {err}"));
    assert_eq!(path, Some(target));

    volumes
        .remove("data1")
        .await
        .unwrap_or_else(|err| panic!("remove: {err}"));
    assert!(harness.os.mount_table().is_empty());
    assert_eq!(harness.sim.detach_calls(), 1);
    let remaining = harness
        .manager
        .storage()
        .volumes("", "data1")
        .await
        .unwrap_or_else(|err| panic!("volumes: {err}"));
    assert!(remaining.is_empty());
}

#[rstest]
#[tokio::test]
async fn unmount_twice_is_a_noop_the_second_time(harness: Harness) {
    let volumes = harness.manager.volume();
    harness.sim.seed_volume("data1", DEFAULT_VOLUME_SIZE_GIB);
    volumes
        .mount("", "data1", &MountOptions::default())
        .await
        .unwrap_or_else(|err| panic!("mount: {err}"));

    volumes
        .unmount("", "data1")
        .await
        .unwrap_or_else(|err| panic!("unmount: {err}"));
    assert!(harness.os.mount_table().is_empty());
    assert_eq!(harness.sim.detach_calls(), 1);

    volumes
        .unmount("", "data1")
        .await
        .unwrap_or_else(|err| panic!("second unmount: {err}"));
    volumes
        .detach("data1", "")
        .await
        .unwrap_or_else(|err| panic!("detach of detached volume: {err}"));
    assert_eq!(harness.os.unmount_calls(), 1);
    assert_eq!(
        volumes
            .path("", "data1")
            .await
            .unwrap_or_else(|err| panic!("path: {err}")),
        None
    );
}

#[rstest]
#[tokio::test]
async fn existing_file_system_is_never_reformatted(harness: Harness) {
    let volume = harness.sim.seed_volume("logs", DEFAULT_VOLUME_SIZE_GIB);
    let device = Harness::device_of(&volume.volume_id);
    harness.os.set_fs_type(&device, "xfs");

    harness
        .manager
        .volume()
        .mount("", "logs", &MountOptions::default())
        .await
        .unwrap_or_else(|err| panic!("mount: {err}"));

    assert_eq!(harness.os.format_count(), 0);
    assert_eq!(harness.os.fs_type(&device).as_deref(), Some("xfs"));
    let mounted: Vec<_> = harness
        .os
        .mount_table()
        .into_iter()
        .map(|entry| entry.fs_type)
        .collect();
    assert_eq!(mounted, vec![String::from("xfs")]);
}

#[rstest]
#[tokio::test]
async fn overwrite_reformats_on_request(harness: Harness) {
    let volume = harness.sim.seed_volume("scratch", DEFAULT_VOLUME_SIZE_GIB);
    let device = Harness::device_of(&volume.volume_id);
    harness.os.set_fs_type(&device, "xfs");

    let options = MountOptions {
        overwrite_fs: true,
        fs_type: None,
    };
    harness
        .manager
        .volume()
        .mount("", "scratch", &options)
        .await
        .unwrap_or_else(|err| panic!("mount: {err}"));

    assert_eq!(harness.os.format_count(), 1);
    assert_eq!(harness.os.fs_type(&device).as_deref(), Some("ext4"));
}

#[rstest]
#[tokio::test]
async fn ambiguous_names_change_nothing(harness: Harness) {
    harness.sim.seed_volume("dup", DEFAULT_VOLUME_SIZE_GIB);
    harness.sim.seed_volume("dup", DEFAULT_VOLUME_SIZE_GIB);
    let volumes = harness.manager.volume();

    let outcomes = [
        volumes.create("dup").await.map(drop),
        volumes
            .mount("", "dup", &MountOptions::default())
            .await
            .map(drop),
        volumes.unmount("", "dup").await,
        volumes.path("", "dup").await.map(drop),
        volumes.remove("dup").await,
        volumes.attach("dup", "").await.map(drop),
        volumes.detach("dup", "").await,
    ];
    for outcome in outcomes {
        let err = outcome.expect_err("ambiguous name must be refused");
        assert_eq!(err.kind(), ErrorKind::AmbiguousResult, "unexpected error: {err}");
    }

    assert_eq!(harness.sim.create_calls(), 0);
    assert_eq!(harness.sim.attach_calls(), 0);
    assert_eq!(harness.sim.detach_calls(), 0);
    assert_eq!(harness.sim.remove_calls(), 0);
    assert_eq!(harness.sim.volume_count(), 2);
    assert_eq!(harness.os.mount_calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn slow_device_times_out_then_mounts_once_visible() {
    let harness = Harness::build(|config| {
        config.attach_timeout_ms = 1_000;
        config.attach_poll_interval_ms = 100;
    });
    harness.sim.set_enumeration_delay(Duration::from_secs(5));
    harness.sim.seed_volume("slow", DEFAULT_VOLUME_SIZE_GIB);
    let volumes = harness.manager.volume();

    let err = volumes
        .mount("", "slow", &MountOptions::default())
        .await
        .expect_err("device appears after the timeout");
    assert_eq!(err.kind(), ErrorKind::AttachTimeout);
    assert!(harness.os.mount_table().is_empty());
    assert_eq!(harness.os.format_count(), 0);

    tokio::time::sleep(Duration::from_secs(5)).await;
    let target = volumes
        .mount("", "slow", &MountOptions::default())
        .await
        .unwrap_or_else(|err| panic!("mount after device appeared: {err}"));
    assert_eq!(target, harness.expected_target("slow"));
    assert_eq!(harness.sim.attach_calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn device_within_the_bound_mounts_on_first_try() {
    let harness = Harness::build(|config| {
        config.attach_timeout_ms = 1_000;
    });
    harness.sim.set_enumeration_delay(Duration::from_millis(250));
    harness.sim.seed_volume("quick", DEFAULT_VOLUME_SIZE_GIB);

    harness
        .manager
        .volume()
        .mount("", "quick", &MountOptions::default())
        .await
        .unwrap_or_else(|err| panic!("mount: {err}"));
    assert_eq!(harness.os.mount_calls(), 1);
}

#[rstest]
#[tokio::test]
async fn attach_reports_network_name(harness: Harness) {
    let volume = harness.sim.seed_volume("data1", DEFAULT_VOLUME_SIZE_GIB);
    let volumes = harness.manager.volume();

    let network_name = volumes
        .attach("data1", "")
        .await
        .unwrap_or_else(|err| panic!("attach: {err}"));
    assert_eq!(network_name, volume.network_name);
    assert_eq!(
        volumes
            .network_name("data1", "")
            .await
            .unwrap_or_else(|err| panic!("network name: {err}")),
        network_name
    );
}

#[tokio::test]
async fn missing_identifiers_are_invalid() {
    let harness = Harness::build(|_| {});
    let err = harness
        .manager
        .volume()
        .mount("", "  ", &MountOptions::default())
        .await
        .expect_err("an identifier is required");
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    assert!(matches!(err, VolplaneError::Backend { .. }));
}
