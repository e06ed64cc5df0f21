//! Storage manager: fans reads out across every active backend and routes
//! mutations to the single active one.
//!
//! Mutating calls never guess. With zero active backends they fail with
//! [`VolplaneError::NoActiveBackend`]; with more than one they fail with
//! [`VolplaneError::MultipleActiveBackends`] before touching any backend.

mod driver;

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use tracing::{debug, info};

use crate::config::Config;
use crate::error::{Fields, Result, VolplaneError, exactly_one};
use crate::registry::DriverRegistry;
use crate::types::{
    BlockDevice, CopySnapshotRequest, Instance, Snapshot, SnapshotRequest, Volume,
    VolumeAttachment, VolumeRequest,
};

pub use driver::{DriverFuture, StorageDriver};

/// Aggregating front for the active storage backends.
pub struct StorageManager {
    drivers: BTreeMap<String, Arc<dyn StorageDriver>>,
    min_volume_size_gib: Option<u64>,
}

impl fmt::Debug for StorageManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StorageManager")
            .field("drivers", &self.drivers.keys().collect::<Vec<_>>())
            .field("min_volume_size_gib", &self.min_volume_size_gib)
            .finish()
    }
}

fn provider(driver: &Arc<dyn StorageDriver>) -> Fields {
    Fields::new().with("provider", driver.name())
}

fn require(value: &str, what: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(VolplaneError::invalid_argument(
            format!("{what} is required"),
            Fields::new(),
        ));
    }
    Ok(())
}

impl StorageManager {
    /// Wraps an already initialized backend set.
    #[must_use]
    pub fn new(drivers: BTreeMap<String, Arc<dyn StorageDriver>>) -> Self {
        if drivers.is_empty() {
            debug!("no storage drivers initialized");
        }
        Self {
            drivers,
            min_volume_size_gib: None,
        }
    }

    /// Raises non-zero create sizes below `floor` to `floor`.
    #[must_use]
    pub fn with_min_volume_size(mut self, floor: Option<u64>) -> Self {
        self.min_volume_size_gib = floor;
        self
    }

    /// Initializes the backends selected by `config`.
    #[must_use]
    pub fn from_registry(config: &Config, registry: &DriverRegistry) -> Self {
        Self::new(registry.storage_drivers(config)).with_min_volume_size(config.min_volume_size_gib)
    }

    /// Names of the active backends.
    #[must_use]
    pub fn driver_names(&self) -> Vec<String> {
        self.drivers.keys().cloned().collect()
    }

    fn active_driver(&self, operation: &'static str) -> Result<&Arc<dyn StorageDriver>> {
        let mut active = self.drivers.values();
        match (active.next(), active.next()) {
            (Some(driver), None) => Ok(driver),
            (None, _) => Err(VolplaneError::NoActiveBackend { operation }),
            (Some(_), Some(_)) => Err(VolplaneError::MultipleActiveBackends {
                operation,
                drivers: self.driver_names(),
            }),
        }
    }

    /// Identifies the local host through every active backend.
    ///
    /// # Errors
    ///
    /// Returns [`VolplaneError::Discovery`] when any backend cannot identify
    /// the host.
    pub async fn instances(&self) -> Result<Vec<Instance>> {
        let mut instances = Vec::with_capacity(self.drivers.len());
        for driver in self.drivers.values() {
            let instance = driver
                .instance()
                .await
                .map_err(|err| VolplaneError::Discovery {
                    message: String::from("failed to identify the local instance"),
                    fields: provider(driver),
                    source: Some(Box::new(err)),
                })?;
            instances.push(instance);
        }
        Ok(instances)
    }

    /// Returns the one instance the host is known as.
    ///
    /// # Errors
    ///
    /// Returns [`VolplaneError::NotFound`] with no backends and
    /// [`VolplaneError::AmbiguousResult`] when backends disagree.
    pub async fn single_instance(&self) -> Result<Instance> {
        exactly_one(self.instances().await?, "instance", Fields::new())
    }

    /// Enumerates host block device mappings across every active backend.
    ///
    /// # Errors
    ///
    /// Returns the first backend failure, wrapped with the provider name.
    pub async fn volume_mapping(&self) -> Result<Vec<BlockDevice>> {
        let mut devices = Vec::new();
        for driver in self.drivers.values() {
            let mapped = driver
                .volume_mapping()
                .await
                .map_err(|err| err.context("failed to enumerate block devices", provider(driver)))?;
            devices.extend(mapped);
        }
        Ok(devices)
    }

    /// Returns volumes matching the filters across every active backend.
    ///
    /// # Errors
    ///
    /// Returns the first backend failure, wrapped with the provider name.
    pub async fn volumes(&self, volume_id: &str, name: &str) -> Result<Vec<Volume>> {
        let mut volumes = Vec::new();
        for driver in self.drivers.values() {
            let found = driver.volumes(volume_id, name).await.map_err(|err| {
                err.context(
                    "failed to list volumes",
                    provider(driver)
                        .with("volume_id", volume_id)
                        .with("name", name),
                )
            })?;
            volumes.extend(found);
        }
        Ok(volumes)
    }

    /// Resolves `volume_id` or `name` to exactly one volume.
    ///
    /// # Errors
    ///
    /// Returns [`VolplaneError::InvalidArgument`] when both are empty,
    /// [`VolplaneError::NotFound`] for no match and
    /// [`VolplaneError::AmbiguousResult`] for several.
    pub async fn single_volume(&self, volume_id: &str, name: &str) -> Result<Volume> {
        if volume_id.trim().is_empty() && name.trim().is_empty() {
            return Err(VolplaneError::invalid_argument(
                "a volume id or name is required",
                Fields::new(),
            ));
        }
        let matches = self.volumes(volume_id, name).await?;
        exactly_one(
            matches,
            "volume",
            Fields::new().with("volume_id", volume_id).with("name", name),
        )
    }

    /// Returns snapshots matching the filters across every active backend.
    ///
    /// # Errors
    ///
    /// Returns the first backend failure, wrapped with the provider name.
    pub async fn snapshots(
        &self,
        volume_id: &str,
        snapshot_id: &str,
        name: &str,
    ) -> Result<Vec<Snapshot>> {
        let mut snapshots = Vec::new();
        for driver in self.drivers.values() {
            let found = driver
                .snapshots(volume_id, snapshot_id, name)
                .await
                .map_err(|err| {
                    err.context(
                        "failed to list snapshots",
                        provider(driver)
                            .with("volume_id", volume_id)
                            .with("snapshot_id", snapshot_id)
                            .with("name", name),
                    )
                })?;
            snapshots.extend(found);
        }
        Ok(snapshots)
    }

    /// Returns attachments of `volume_id`, optionally limited to one
    /// instance.
    ///
    /// # Errors
    ///
    /// Requires exactly one active backend, since attachment state belongs
    /// to the backend owning the volume. Returns
    /// [`VolplaneError::InvalidArgument`] for an empty volume id.
    pub async fn volume_attachments(
        &self,
        volume_id: &str,
        instance_id: &str,
    ) -> Result<Vec<VolumeAttachment>> {
        let driver = self.active_driver("volume_attachments")?;
        require(volume_id, "volume id")?;
        driver
            .volume_attachments(volume_id, instance_id)
            .await
            .map_err(|err| {
                err.context(
                    "failed to list attachments",
                    provider(driver)
                        .with("volume_id", volume_id)
                        .with("instance_id", instance_id),
                )
            })
    }

    /// Returns the device slot for the next attach, if the backend needs one.
    ///
    /// # Errors
    ///
    /// Requires exactly one active backend.
    pub async fn next_available_device(&self) -> Result<Option<String>> {
        let driver = self.active_driver("next_available_device")?;
        driver
            .next_available_device()
            .await
            .map_err(|err| err.context("failed to choose a device slot", provider(driver)))
    }

    /// Creates a volume on the active backend.
    ///
    /// A non-zero size below the configured floor is raised to the floor.
    ///
    /// # Errors
    ///
    /// Requires exactly one active backend and a valid request.
    pub async fn create_volume(&self, request: &VolumeRequest) -> Result<Volume> {
        let driver = self.active_driver("create_volume")?;
        request.validate()?;
        let mut effective = request.clone();
        if let Some(floor) = self.min_volume_size_gib {
            if effective.size_gib > 0 && effective.size_gib < floor {
                info!(
                    name = %effective.name,
                    requested = effective.size_gib,
                    floor,
                    "raising volume size to the configured minimum"
                );
                effective.size_gib = floor;
            }
        }
        let volume = driver.create_volume(&effective).await.map_err(|err| {
            err.context(
                "failed to create volume",
                provider(driver).with("name", &effective.name),
            )
        })?;
        info!(provider = driver.name(), volume_id = %volume.volume_id, name = %volume.name, "created volume");
        Ok(volume)
    }

    /// Removes a volume from the active backend.
    ///
    /// # Errors
    ///
    /// Requires exactly one active backend and a non-empty id.
    pub async fn remove_volume(&self, volume_id: &str) -> Result<()> {
        let driver = self.active_driver("remove_volume")?;
        require(volume_id, "volume id")?;
        driver.remove_volume(volume_id).await.map_err(|err| {
            err.context(
                "failed to remove volume",
                provider(driver).with("volume_id", volume_id),
            )
        })?;
        info!(provider = driver.name(), volume_id, "removed volume");
        Ok(())
    }

    async fn resolve_instance_id(
        driver: &Arc<dyn StorageDriver>,
        instance_id: &str,
    ) -> Result<String> {
        if !instance_id.trim().is_empty() {
            return Ok(instance_id.to_owned());
        }
        let instance = driver
            .instance()
            .await
            .map_err(|err| VolplaneError::Discovery {
                message: String::from("failed to identify the local instance"),
                fields: provider(driver),
                source: Some(Box::new(err)),
            })?;
        Ok(instance.instance_id)
    }

    /// Attaches a volume. An empty `instance_id` targets the local host.
    ///
    /// # Errors
    ///
    /// Requires exactly one active backend and a non-empty volume id.
    pub async fn attach_volume(
        &self,
        run_async: bool,
        volume_id: &str,
        instance_id: &str,
    ) -> Result<Vec<VolumeAttachment>> {
        let driver = self.active_driver("attach_volume")?;
        require(volume_id, "volume id")?;
        let target = Self::resolve_instance_id(driver, instance_id).await?;
        let attachments = driver
            .attach_volume(run_async, volume_id, &target)
            .await
            .map_err(|err| {
                err.context(
                    "failed to attach volume",
                    provider(driver)
                        .with("volume_id", volume_id)
                        .with("instance_id", &target),
                )
            })?;
        info!(provider = driver.name(), volume_id, instance_id = %target, "attached volume");
        Ok(attachments)
    }

    /// Detaches a volume. An empty `instance_id` targets the local host.
    ///
    /// # Errors
    ///
    /// Requires exactly one active backend and a non-empty volume id.
    pub async fn detach_volume(
        &self,
        run_async: bool,
        volume_id: &str,
        instance_id: &str,
    ) -> Result<()> {
        let driver = self.active_driver("detach_volume")?;
        require(volume_id, "volume id")?;
        let target = Self::resolve_instance_id(driver, instance_id).await?;
        driver
            .detach_volume(run_async, volume_id, &target)
            .await
            .map_err(|err| {
                err.context(
                    "failed to detach volume",
                    provider(driver)
                        .with("volume_id", volume_id)
                        .with("instance_id", &target),
                )
            })?;
        info!(provider = driver.name(), volume_id, instance_id = %target, "detached volume");
        Ok(())
    }

    /// Snapshots a volume on the active backend.
    ///
    /// # Errors
    ///
    /// Requires exactly one active backend.
    pub async fn create_snapshot(&self, request: &SnapshotRequest) -> Result<Vec<Snapshot>> {
        let driver = self.active_driver("create_snapshot")?;
        require(&request.volume_id, "volume id")?;
        driver
            .create_snapshot(
                request.run_async,
                &request.name,
                &request.volume_id,
                &request.description,
            )
            .await
            .map_err(|err| {
                err.context(
                    "failed to create snapshot",
                    provider(driver)
                        .with("volume_id", &request.volume_id)
                        .with("name", &request.name),
                )
            })
    }

    /// Removes a snapshot from the active backend.
    ///
    /// # Errors
    ///
    /// Requires exactly one active backend and a non-empty id.
    pub async fn remove_snapshot(&self, snapshot_id: &str) -> Result<()> {
        let driver = self.active_driver("remove_snapshot")?;
        require(snapshot_id, "snapshot id")?;
        driver.remove_snapshot(snapshot_id).await.map_err(|err| {
            err.context(
                "failed to remove snapshot",
                provider(driver).with("snapshot_id", snapshot_id),
            )
        })
    }

    /// Copies a snapshot on the active backend.
    ///
    /// # Errors
    ///
    /// Requires exactly one active backend. Backends lacking the capability
    /// report [`crate::ErrorKind::NotImplemented`] through the wrapper.
    pub async fn copy_snapshot(&self, request: &CopySnapshotRequest) -> Result<Snapshot> {
        let driver = self.active_driver("copy_snapshot")?;
        request.validate()?;
        driver.copy_snapshot(request).await.map_err(|err| {
            err.context(
                "failed to copy snapshot",
                provider(driver).with("target_name", &request.target_name),
            )
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::test_support::SimStorageDriver;

    fn manager(drivers: &[&SimStorageDriver]) -> StorageManager {
        StorageManager::new(
            drivers
                .iter()
                .map(|driver| {
                    (
                        driver.name().to_owned(),
                        Arc::new((*driver).clone()) as Arc<dyn StorageDriver>,
                    )
                })
                .collect(),
        )
    }

    fn request(size: u64) -> VolumeRequest {
        VolumeRequest::builder()
            .name("data1")
            .size_gib(size)
            .build()
            .unwrap_or_else(|err| panic!("request should build: {err}"))
    }

    #[tokio::test]
    async fn floor_raises_small_sizes_only() {
        let sim = SimStorageDriver::new("sim");
        let storage = manager(&[&sim]).with_min_volume_size(Some(8));

        let small = storage
            .create_volume(&request(1))
            .await
            .unwrap_or_else(|err| panic!("create: {err}"));
        assert_eq!(small.size_gib, 8);

        let large = storage
            .create_volume(&request(32))
            .await
            .unwrap_or_else(|err| panic!("create: {err}"));
        assert_eq!(large.size_gib, 32);
    }

    #[tokio::test]
    async fn mutation_without_backends_is_refused() {
        let storage = StorageManager::new(BTreeMap::new());
        let err = storage
            .remove_volume("vol-1")
            .await
            .expect_err("no backend is active");
        assert_eq!(
            err,
            VolplaneError::NoActiveBackend {
                operation: "remove_volume"
            }
        );
        assert!(
            storage
                .volumes("", "")
                .await
                .unwrap_or_else(|err| panic!("list: {err}"))
                .is_empty()
        );
    }

    #[tokio::test]
    async fn attach_defaults_to_local_instance() {
        let sim = SimStorageDriver::new("sim");
        let volume = sim.seed_volume("data1", 16);
        let storage = manager(&[&sim]);

        let attachments = storage
            .attach_volume(false, &volume.volume_id, "")
            .await
            .unwrap_or_else(|err| panic!("attach: {err}"));
        assert_eq!(
            attachments.first().map(|a| a.instance_id.as_str()),
            Some(sim.instance_id())
        );
    }

    #[tokio::test]
    async fn copy_snapshot_reports_not_implemented() {
        let sim = SimStorageDriver::new("sim");
        let storage = manager(&[&sim]);
        let err = storage
            .copy_snapshot(&CopySnapshotRequest {
                snapshot_id: Some(String::from("snap-1")),
                target_name: String::from("copy"),
                ..CopySnapshotRequest::default()
            })
            .await
            .expect_err("sim cannot copy snapshots");
        assert_eq!(err.kind(), ErrorKind::NotImplemented);
        assert!(err.to_string().contains("provider=sim"));
    }
}
