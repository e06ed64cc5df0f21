//! Consumer-facing volume integrations and their manager.
//!
//! A [`VolumeDriver`] composes the storage and OS managers into the
//! create → attach → format → mount lifecycle and its teardown. State is
//! re-derived from the backends and the mount table on every call, so every
//! operation is idempotent.

pub mod docker;
pub mod wait;

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use camino::Utf8PathBuf;
use tracing::debug;

use crate::config::Config;
use crate::error::{Fields, Result, VolplaneError};
use crate::os::OsManager;
use crate::registry::DriverRegistry;
use crate::storage::{DriverFuture, StorageManager};
use crate::types::Volume;

pub use wait::AttachWait;

/// Options for [`VolumeDriver::mount`].
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct MountOptions {
    /// Reformat the device even when it already carries a file system.
    pub overwrite_fs: bool,
    /// File system to create; the configured default when `None`.
    pub fs_type: Option<String>,
}

/// Volume lifecycle exposed to consumers such as container runtimes.
///
/// Volumes are addressed by id or name; at least one must be non-empty.
pub trait VolumeDriver: Send + Sync {
    /// Registered integration name.
    fn name(&self) -> &str;

    /// Creates a volume named `name`, or returns the existing one.
    fn create<'a>(&'a self, name: &'a str) -> DriverFuture<'a, Volume>;

    /// Attaches the volume if needed, waits for its device, formats it once
    /// and mounts it. Returns the mountpoint.
    fn mount<'a>(
        &'a self,
        volume_id: &'a str,
        name: &'a str,
        options: &'a MountOptions,
    ) -> DriverFuture<'a, Utf8PathBuf>;

    /// Unmounts and detaches the volume. Nothing happens when it is not
    /// attached or not mounted.
    fn unmount<'a>(&'a self, volume_id: &'a str, name: &'a str) -> DriverFuture<'a, ()>;

    /// Returns the current mountpoint without side effects.
    fn path<'a>(&'a self, volume_id: &'a str, name: &'a str)
    -> DriverFuture<'a, Option<Utf8PathBuf>>;

    /// Tears the volume down and removes it from the backend.
    fn remove<'a>(&'a self, name: &'a str) -> DriverFuture<'a, ()>;

    /// Attaches the volume and returns its network name.
    fn attach<'a>(&'a self, name: &'a str, instance_id: &'a str) -> DriverFuture<'a, String>;

    /// Detaches the volume.
    fn detach<'a>(&'a self, name: &'a str, instance_id: &'a str) -> DriverFuture<'a, ()>;

    /// Returns the backend discovery string of an attached volume.
    fn network_name<'a>(&'a self, name: &'a str, instance_id: &'a str)
    -> DriverFuture<'a, String>;
}

/// Dispatches to the first active volume integration by name.
pub struct VolumeManager {
    drivers: BTreeMap<String, Arc<dyn VolumeDriver>>,
}

impl fmt::Debug for VolumeManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VolumeManager")
            .field("drivers", &self.drivers.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl VolumeManager {
    /// Wraps an already initialized integration set.
    #[must_use]
    pub fn new(drivers: BTreeMap<String, Arc<dyn VolumeDriver>>) -> Self {
        if drivers.is_empty() {
            debug!("no volume drivers initialized");
        }
        Self { drivers }
    }

    /// Initializes the integrations selected by `config`.
    #[must_use]
    pub fn from_registry(
        config: &Config,
        registry: &DriverRegistry,
        storage: &Arc<StorageManager>,
        os: &Arc<OsManager>,
    ) -> Self {
        Self::new(registry.volume_drivers(config, storage, os))
    }

    /// Names of the active integrations.
    #[must_use]
    pub fn driver_names(&self) -> Vec<String> {
        self.drivers.keys().cloned().collect()
    }

    fn driver(&self) -> Result<&Arc<dyn VolumeDriver>> {
        self.drivers
            .values()
            .next()
            .ok_or(VolplaneError::NoVolumeDriver)
    }

    fn fields(driver: &Arc<dyn VolumeDriver>, volume_id: &str, name: &str) -> Fields {
        Fields::new()
            .with("volume_driver", driver.name())
            .with("volume_id", volume_id)
            .with("name", name)
    }

    /// See [`VolumeDriver::create`].
    ///
    /// # Errors
    ///
    /// Returns [`VolplaneError::NoVolumeDriver`] or the wrapped driver error.
    pub async fn create(&self, name: &str) -> Result<Volume> {
        let driver = self.driver()?;
        driver
            .create(name)
            .await
            .map_err(|err| err.context("volume create failed", Self::fields(driver, "", name)))
    }

    /// See [`VolumeDriver::mount`].
    ///
    /// # Errors
    ///
    /// Returns [`VolplaneError::NoVolumeDriver`] or the wrapped driver error.
    pub async fn mount(
        &self,
        volume_id: &str,
        name: &str,
        options: &MountOptions,
    ) -> Result<Utf8PathBuf> {
        let driver = self.driver()?;
        driver
            .mount(volume_id, name, options)
            .await
            .map_err(|err| err.context("volume mount failed", Self::fields(driver, volume_id, name)))
    }

    /// See [`VolumeDriver::unmount`].
    ///
    /// # Errors
    ///
    /// Returns [`VolplaneError::NoVolumeDriver`] or the wrapped driver error.
    pub async fn unmount(&self, volume_id: &str, name: &str) -> Result<()> {
        let driver = self.driver()?;
        driver.unmount(volume_id, name).await.map_err(|err| {
            err.context("volume unmount failed", Self::fields(driver, volume_id, name))
        })
    }

    /// See [`VolumeDriver::path`].
    ///
    /// # Errors
    ///
    /// Returns [`VolplaneError::NoVolumeDriver`] or the wrapped driver error.
    pub async fn path(&self, volume_id: &str, name: &str) -> Result<Option<Utf8PathBuf>> {
        let driver = self.driver()?;
        driver
            .path(volume_id, name)
            .await
            .map_err(|err| err.context("volume path lookup failed", Self::fields(driver, volume_id, name)))
    }

    /// See [`VolumeDriver::remove`].
    ///
    /// # Errors
    ///
    /// Returns [`VolplaneError::NoVolumeDriver`] or the wrapped driver error.
    pub async fn remove(&self, name: &str) -> Result<()> {
        let driver = self.driver()?;
        driver
            .remove(name)
            .await
            .map_err(|err| err.context("volume remove failed", Self::fields(driver, "", name)))
    }

    /// See [`VolumeDriver::attach`].
    ///
    /// # Errors
    ///
    /// Returns [`VolplaneError::NoVolumeDriver`] or the wrapped driver error.
    pub async fn attach(&self, name: &str, instance_id: &str) -> Result<String> {
        let driver = self.driver()?;
        driver.attach(name, instance_id).await.map_err(|err| {
            err.context(
                "volume attach failed",
                Self::fields(driver, "", name).with("instance_id", instance_id),
            )
        })
    }

    /// See [`VolumeDriver::detach`].
    ///
    /// # Errors
    ///
    /// Returns [`VolplaneError::NoVolumeDriver`] or the wrapped driver error.
    pub async fn detach(&self, name: &str, instance_id: &str) -> Result<()> {
        let driver = self.driver()?;
        driver.detach(name, instance_id).await.map_err(|err| {
            err.context(
                "volume detach failed",
                Self::fields(driver, "", name).with("instance_id", instance_id),
            )
        })
    }

    /// See [`VolumeDriver::network_name`].
    ///
    /// # Errors
    ///
    /// Returns [`VolplaneError::NoVolumeDriver`] or the wrapped driver error.
    pub async fn network_name(&self, name: &str, instance_id: &str) -> Result<String> {
        let driver = self.driver()?;
        driver.network_name(name, instance_id).await.map_err(|err| {
            err.context(
                "volume network name lookup failed",
                Self::fields(driver, "", name).with("instance_id", instance_id),
            )
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn empty_manager_reports_no_volume_driver() {
        let manager = VolumeManager::new(BTreeMap::new());
        assert_eq!(
            manager.create("data1").await.expect_err("no driver"),
            VolplaneError::NoVolumeDriver
        );
        assert_eq!(
            manager.path("", "data1").await.expect_err("no driver"),
            VolplaneError::NoVolumeDriver
        );
        assert!(manager.driver_names().is_empty());
    }
}
