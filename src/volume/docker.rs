//! Docker volume integration.
//!
//! Volumes are mounted at `<mount_root>/<volume name>`. Every call resolves
//! exactly one instance and one volume before acting.

use std::sync::Arc;

use camino::{Utf8Path, Utf8PathBuf};
use cap_std::{ambient_authority, fs_utf8::Dir};
use tokio::task::spawn_blocking;
use tracing::{debug, info};

use super::wait::AttachWait;
use super::{MountOptions, VolumeDriver};
use crate::config::Config;
use crate::error::{Fields, Result, VolplaneError};
use crate::os::OsManager;
use crate::storage::{DriverFuture, StorageManager};
use crate::types::{Instance, MountInfo, Volume, VolumeAttachment, VolumeRequest};

/// Create and mount parameters applied by [`DockerVolumeDriver`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct VolumeSettings {
    /// Base directory for mountpoints.
    pub mount_root: Utf8PathBuf,
    /// Size of new volumes in GiB.
    pub size_gib: u64,
    /// Volume type for new volumes.
    pub volume_type: Option<String>,
    /// Provisioned IOPS for new volumes.
    pub iops: Option<u64>,
    /// Availability zone for new volumes.
    pub availability_zone: Option<String>,
    /// File system created on blank devices.
    pub fs_type: String,
    /// Bounds on waiting for attached devices.
    pub attach_wait: AttachWait,
}

impl VolumeSettings {
    /// Reads the settings from `config`.
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        Self {
            mount_root: config.mount_root_path(),
            size_gib: config.volume_size_gib,
            volume_type: config.volume_type.clone(),
            iops: config.volume_iops,
            availability_zone: config.availability_zone.clone(),
            fs_type: config.default_fs_type.trim().to_owned(),
            attach_wait: AttachWait::from_config(config),
        }
    }
}

/// Volume integration for container runtimes.
#[derive(Debug)]
pub struct DockerVolumeDriver {
    storage: Arc<StorageManager>,
    os: Arc<OsManager>,
    settings: VolumeSettings,
}

fn require_identifier(volume_id: &str, name: &str) -> Result<()> {
    if volume_id.trim().is_empty() && name.trim().is_empty() {
        return Err(VolplaneError::invalid_argument(
            "a volume id or name is required",
            Fields::new(),
        ));
    }
    Ok(())
}

fn require_name(name: &str) -> Result<()> {
    if name.trim().is_empty() {
        return Err(VolplaneError::invalid_argument(
            "a volume name is required",
            Fields::new(),
        ));
    }
    Ok(())
}

/// Rejects names that cannot serve as a single directory under the mount root.
fn require_mountable(leaf: &str) -> Result<()> {
    if leaf.is_empty() || leaf == "." || leaf == ".." || leaf.contains('/') {
        return Err(VolplaneError::invalid_argument(
            "volume name cannot be used as a directory name",
            Fields::new().with("name", leaf),
        ));
    }
    Ok(())
}

impl DockerVolumeDriver {
    /// Registered name.
    pub const NAME: &'static str = "docker";

    /// Creates the integration from configuration.
    #[must_use]
    pub fn new(config: &Config, storage: Arc<StorageManager>, os: Arc<OsManager>) -> Self {
        Self::with_settings(VolumeSettings::from_config(config), storage, os)
    }

    /// Creates the integration with explicit settings.
    #[must_use]
    pub const fn with_settings(
        settings: VolumeSettings,
        storage: Arc<StorageManager>,
        os: Arc<OsManager>,
    ) -> Self {
        Self {
            storage,
            os,
            settings,
        }
    }

    /// Deterministic mountpoint for `volume`.
    ///
    /// # Errors
    ///
    /// Returns [`VolplaneError::InvalidArgument`] for names that would escape
    /// the mount root.
    pub fn mount_target(&self, volume: &Volume) -> Result<Utf8PathBuf> {
        let leaf = if volume.name.is_empty() {
            volume.volume_id.as_str()
        } else {
            volume.name.as_str()
        };
        require_mountable(leaf)?;
        Ok(self.settings.mount_root.join(leaf))
    }

    /// Runs host OS calls on the blocking pool; the helpers they spawn can
    /// take a long time (`mkfs` on a large device).
    async fn on_host<T, F>(&self, operation: &'static str, call: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&OsManager) -> Result<T> + Send + 'static,
    {
        let os = Arc::clone(&self.os);
        spawn_blocking(move || call(&os)).await.map_err(|err| {
            VolplaneError::backend(
                "host task did not complete",
                Fields::new()
                    .with("operation", operation)
                    .with("error", err),
            )
        })?
    }

    async fn resolve(&self, volume_id: &str, name: &str) -> Result<(Instance, Volume)> {
        require_identifier(volume_id, name)?;
        let instance = self.storage.single_instance().await?;
        let volume = self.storage.single_volume(volume_id, name).await?;
        Ok((instance, volume))
    }

    async fn local_attachment(
        &self,
        volume: &Volume,
        instance: &Instance,
    ) -> Result<Option<VolumeAttachment>> {
        let attachments = self
            .storage
            .volume_attachments(&volume.volume_id, &instance.instance_id)
            .await?;
        let (ready, pending): (Vec<_>, Vec<_>) = attachments
            .into_iter()
            .partition(VolumeAttachment::has_device);
        Ok(ready.into_iter().chain(pending).next())
    }

    /// Attaches `volume` when needed and waits for its host device.
    async fn ensure_device(&self, volume: &Volume, instance: &Instance) -> Result<String> {
        match self.local_attachment(volume, instance).await? {
            Some(attachment) if attachment.has_device() => return Ok(attachment.device_name),
            Some(_) => {
                debug!(volume_id = %volume.volume_id, "attachment exists; waiting for host device");
            }
            None => {
                self.storage
                    .attach_volume(false, &volume.volume_id, &instance.instance_id)
                    .await?;
            }
        }
        let storage = &self.storage;
        let device = self
            .settings
            .attach_wait
            .wait_for_device(&volume.volume_id, move || storage.volume_mapping())
            .await?;
        Ok(device.device_name)
    }

    fn create_mount_dir(target: &Utf8Path) -> Result<()> {
        Dir::create_ambient_dir_all(target, ambient_authority()).map_err(|err| VolplaneError::Io {
            path: target.to_string(),
            message: err.to_string(),
        })
    }

    /// Unmounts every mount of the attached device. Returns `false` when
    /// nothing was mounted.
    async fn unmount_device(&self, attachment: &VolumeAttachment) -> Result<bool> {
        if !attachment.has_device() {
            return Ok(false);
        }
        let device = attachment.device_name.clone();
        self.on_host("unmount", move |os| {
            let mounts = os.mounts(&device, "")?;
            for entry in &mounts {
                os.unmount(Utf8Path::new(&entry.mountpoint))?;
            }
            Ok(!mounts.is_empty())
        })
        .await
    }

    async fn device_mounts(&self, device: &str) -> Result<Vec<MountInfo>> {
        let device = device.to_owned();
        self.on_host("mounts", move |os| os.mounts(&device, "")).await
    }

    async fn mount_volume(
        &self,
        volume_id: &str,
        name: &str,
        options: &MountOptions,
    ) -> Result<Utf8PathBuf> {
        let (instance, volume) = self.resolve(volume_id, name).await?;
        let target = self.mount_target(&volume)?;
        let device = self.ensure_device(&volume, &instance).await?;

        if let Some(existing) = self.device_mounts(&device).await?.into_iter().next() {
            debug!(volume_id = %volume.volume_id, mountpoint = %existing.mountpoint, "volume already mounted");
            return Ok(Utf8PathBuf::from(existing.mountpoint));
        }

        let fs_type = options
            .fs_type
            .as_deref()
            .map(str::trim)
            .filter(|fs| !fs.is_empty())
            .unwrap_or(&self.settings.fs_type)
            .to_owned();
        let overwrite = options.overwrite_fs;
        let host_device = device.clone();
        let host_target = target.clone();
        self.on_host("mount", move |os| {
            os.format(&host_device, &fs_type, overwrite)?;
            Self::create_mount_dir(&host_target)?;
            os.mount(&host_device, &host_target, "", "")
        })
        .await?;
        info!(volume_id = %volume.volume_id, device = %device, target = %target, "volume mounted");
        Ok(target)
    }

    async fn unmount_volume(&self, volume_id: &str, name: &str) -> Result<()> {
        let (instance, volume) = self.resolve(volume_id, name).await?;
        let Some(attachment) = self.local_attachment(&volume, &instance).await? else {
            debug!(volume_id = %volume.volume_id, "volume not attached; nothing to unmount");
            return Ok(());
        };
        if !self.unmount_device(&attachment).await? {
            debug!(volume_id = %volume.volume_id, "volume not mounted; nothing to unmount");
            return Ok(());
        }
        self.storage
            .detach_volume(false, &volume.volume_id, &instance.instance_id)
            .await
    }

    async fn volume_path(&self, volume_id: &str, name: &str) -> Result<Option<Utf8PathBuf>> {
        let (instance, volume) = self.resolve(volume_id, name).await?;
        let Some(attachment) = self.local_attachment(&volume, &instance).await? else {
            return Ok(None);
        };
        if !attachment.has_device() {
            return Ok(None);
        }
        Ok(self
            .device_mounts(&attachment.device_name)
            .await?
            .into_iter()
            .next()
            .map(|entry| Utf8PathBuf::from(entry.mountpoint)))
    }

    async fn create_volume(&self, name: &str) -> Result<Volume> {
        require_name(name)?;
        require_mountable(name.trim())?;
        self.storage.single_instance().await?;
        let mut existing = self.storage.volumes("", name).await?;
        if existing.len() > 1 {
            return Err(VolplaneError::AmbiguousResult {
                entity: "volume",
                count: existing.len(),
                fields: Fields::new().with("name", name),
            });
        }
        if let Some(volume) = existing.pop() {
            debug!(name, volume_id = %volume.volume_id, "volume already exists");
            return Ok(volume);
        }
        let request = VolumeRequest::builder()
            .name(name)
            .size_gib(self.settings.size_gib)
            .volume_type(self.settings.volume_type.clone())
            .iops(self.settings.iops)
            .availability_zone(self.settings.availability_zone.clone())
            .build()?;
        self.storage.create_volume(&request).await
    }

    async fn remove_volume(&self, name: &str) -> Result<()> {
        require_name(name)?;
        let (instance, volume) = self.resolve("", name).await?;
        if let Some(attachment) = self.local_attachment(&volume, &instance).await? {
            self.unmount_device(&attachment).await?;
            self.storage
                .detach_volume(false, &volume.volume_id, &instance.instance_id)
                .await?;
        }
        self.storage.remove_volume(&volume.volume_id).await
    }

    async fn attach_volume(&self, name: &str, instance_id: &str) -> Result<String> {
        require_name(name)?;
        let volume = self.storage.single_volume("", name).await?;
        self.storage
            .attach_volume(true, &volume.volume_id, instance_id)
            .await?;
        let refreshed = self.storage.single_volume(&volume.volume_id, "").await?;
        Ok(refreshed.network_name)
    }

    async fn detach_volume(&self, name: &str, instance_id: &str) -> Result<()> {
        require_name(name)?;
        let volume = self.storage.single_volume("", name).await?;
        self.storage
            .detach_volume(true, &volume.volume_id, instance_id)
            .await
    }

    async fn volume_network_name(&self, name: &str, instance_id: &str) -> Result<String> {
        require_name(name)?;
        let volume = self.storage.single_volume("", name).await?;
        let attachments = self
            .storage
            .volume_attachments(&volume.volume_id, instance_id)
            .await?;
        if attachments.is_empty() {
            return Err(VolplaneError::NotFound {
                entity: "attachment",
                fields: Fields::new()
                    .with("volume_id", &volume.volume_id)
                    .with("instance_id", instance_id),
            });
        }
        Ok(volume.network_name)
    }
}

impl VolumeDriver for DockerVolumeDriver {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn create<'a>(&'a self, name: &'a str) -> DriverFuture<'a, Volume> {
        Box::pin(self.create_volume(name))
    }

    fn mount<'a>(
        &'a self,
        volume_id: &'a str,
        name: &'a str,
        options: &'a MountOptions,
    ) -> DriverFuture<'a, Utf8PathBuf> {
        Box::pin(self.mount_volume(volume_id, name, options))
    }

    fn unmount<'a>(&'a self, volume_id: &'a str, name: &'a str) -> DriverFuture<'a, ()> {
        Box::pin(self.unmount_volume(volume_id, name))
    }

    fn path<'a>(
        &'a self,
        volume_id: &'a str,
        name: &'a str,
    ) -> DriverFuture<'a, Option<Utf8PathBuf>> {
        Box::pin(self.volume_path(volume_id, name))
    }

    fn remove<'a>(&'a self, name: &'a str) -> DriverFuture<'a, ()> {
        Box::pin(self.remove_volume(name))
    }

    fn attach<'a>(&'a self, name: &'a str, instance_id: &'a str) -> DriverFuture<'a, String> {
        Box::pin(self.attach_volume(name, instance_id))
    }

    fn detach<'a>(&'a self, name: &'a str, instance_id: &'a str) -> DriverFuture<'a, ()> {
        Box::pin(self.detach_volume(name, instance_id))
    }

    fn network_name<'a>(
        &'a self,
        name: &'a str,
        instance_id: &'a str,
    ) -> DriverFuture<'a, String> {
        Box::pin(self.volume_network_name(name, instance_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::os::OsDriver;
    use crate::storage::StorageDriver;
    use crate::test_support::{SimOsDriver, SimStorageDriver};
    use rstest::{fixture, rstest};
    use std::collections::BTreeMap;
    use std::time::Duration;
    use tempfile::TempDir;

    struct Harness {
        _root: TempDir,
        sim: SimStorageDriver,
        os: SimOsDriver,
        driver: DockerVolumeDriver,
    }

    #[fixture]
    fn harness() -> Harness {
        let root = TempDir::new().unwrap_or_else(|err| panic!("temp dir: {err}"));
        let mount_root = Utf8PathBuf::from_path_buf(root.path().to_path_buf())
            .unwrap_or_else(|path| panic!("non UTF-8 temp path: {}", path.display()));
        let sim = SimStorageDriver::new("sim");
        let os = SimOsDriver::named("sim-os");
        let storage = StorageManager::new(BTreeMap::from([(
            String::from("sim"),
            Arc::new(sim.clone()) as Arc<dyn StorageDriver>,
        )]));
        let os_manager = OsManager::new(BTreeMap::from([(
            String::from("sim-os"),
            Arc::new(os.clone()) as Arc<dyn OsDriver>,
        )]));
        let config = Config {
            mount_root: mount_root.to_string(),
            ..Config::baseline()
        };
        let driver = DockerVolumeDriver::new(&config, Arc::new(storage), Arc::new(os_manager));
        Harness {
            _root: root,
            sim,
            os,
            driver,
        }
    }

    #[rstest]
    #[case::slash("a/b")]
    #[case::parent("..")]
    fn names_escaping_the_root_are_rejected(harness: Harness, #[case] name: &str) {
        let volume = Volume {
            name: name.to_owned(),
            ..Volume::default()
        };
        let err = harness
            .driver
            .mount_target(&volume)
            .expect_err("name must not escape");
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    }

    #[rstest]
    #[case::slash("a/b")]
    #[case::parent("..")]
    #[tokio::test]
    async fn unmountable_names_are_refused_before_touching_the_device(
        harness: Harness,
        #[case] name: &str,
    ) {
        harness.sim.seed_volume(name, 16);

        let err = harness
            .driver
            .mount("", name, &MountOptions::default())
            .await
            .expect_err("name cannot become a mountpoint");
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
        assert_eq!(harness.sim.attach_calls(), 0);
        assert_eq!(harness.os.format_count(), 0);
        assert_eq!(harness.os.mount_calls(), 0);

        let err = harness
            .driver
            .create(name)
            .await
            .expect_err("name cannot become a mountpoint");
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
        assert_eq!(harness.sim.create_calls(), 0);
    }

    #[rstest]
    #[tokio::test]
    async fn create_needs_a_known_host(harness: Harness) {
        harness.sim.fail("instance");

        let err = harness
            .driver
            .create("data1")
            .await
            .expect_err("host cannot be identified");
        assert_eq!(err.kind(), ErrorKind::Discovery);
        assert_eq!(harness.sim.calls("instance"), 1);
        assert_eq!(harness.sim.create_calls(), 0);
        assert_eq!(harness.sim.volume_count(), 0);
    }

    #[rstest]
    #[tokio::test]
    async fn host_calls_leave_the_runtime_thread(harness: Harness) {
        let runtime_thread = std::thread::current().id();
        let host_thread = harness
            .driver
            .on_host("thread", |_| Ok(std::thread::current().id()))
            .await
            .unwrap_or_else(|err| panic!("host call: {err}"));
        assert_ne!(host_thread, runtime_thread);
    }

    #[rstest]
    #[tokio::test]
    async fn unmount_of_unattached_volume_is_noop(harness: Harness) {
        harness.sim.seed_volume("data1", 16);
        harness
            .driver
            .unmount("", "data1")
            .await
            .unwrap_or_else(|err| panic!("unmount: {err}"));
        assert_eq!(harness.sim.detach_calls(), 0);
    }

    #[rstest]
    #[tokio::test]
    async fn path_never_attaches(harness: Harness) {
        harness.sim.seed_volume("data1", 16);
        let path = harness
            .driver
            .path("", "data1")
            .await
            .unwrap_or_else(|err| panic!("path: {err}"));
        assert_eq!(path, None);
        assert_eq!(harness.sim.attach_calls(), 0);
    }

    #[rstest]
    #[tokio::test(start_paused = true)]
    async fn mount_uses_requested_fs_type(harness: Harness) {
        harness.sim.set_enumeration_delay(Duration::from_millis(150));
        harness.sim.seed_volume("logs", 16);
        let options = MountOptions {
            overwrite_fs: false,
            fs_type: Some(String::from("xfs")),
        };
        let target = harness
            .driver
            .mount("", "logs", &options)
            .await
            .unwrap_or_else(|err| panic!("mount: {err}"));
        assert!(target.ends_with("logs"));
        assert!(target.is_dir());
        let device = harness
            .os
            .mounts("", target.as_str())
            .unwrap_or_else(|err| panic!("mounts: {err}"))
            .into_iter()
            .next()
            .unwrap_or_else(|| panic!("volume should be mounted"));
        assert_eq!(device.fs_type, "xfs");
    }

    #[rstest]
    #[tokio::test]
    async fn network_name_requires_attachment(harness: Harness) {
        harness.sim.seed_volume("data1", 16);
        let err = harness
            .driver
            .network_name("data1", "")
            .await
            .expect_err("volume is not attached");
        assert_eq!(err.kind(), ErrorKind::NotFound);

        let network_name = harness
            .driver
            .attach("data1", "")
            .await
            .unwrap_or_else(|err| panic!("attach: {err}"));
        assert!(!network_name.is_empty());
        assert_eq!(
            harness
                .driver
                .network_name("data1", "")
                .await
                .unwrap_or_else(|err| panic!("network name: {err}")),
            network_name
        );
    }
}
