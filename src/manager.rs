//! Process-wide bootstrap of the three manager layers.
//!
//! OS drivers initialize first, storage backends second and volume
//! integrations last, because volume integrations hold handles to both lower
//! layers. The managers are immutable once built and safe to share.

use std::sync::Arc;

use tracing::info;

use crate::config::Config;
use crate::os::OsManager;
use crate::registry::DriverRegistry;
use crate::storage::StorageManager;
use crate::volume::VolumeManager;

/// The assembled OS, storage and volume managers.
#[derive(Debug)]
pub struct DriverManager {
    os: Arc<OsManager>,
    storage: Arc<StorageManager>,
    volume: VolumeManager,
}

impl DriverManager {
    /// Initializes every layer from `registry` using the drivers selected by
    /// `config`.
    ///
    /// Drivers that fail to initialize are skipped, so a layer may end up
    /// empty; the resulting error surfaces on the first call that needs it.
    #[must_use]
    pub fn new(config: &Config, registry: &DriverRegistry) -> Self {
        let os = Arc::new(OsManager::from_registry(config, registry));
        let storage = Arc::new(StorageManager::from_registry(config, registry));
        let volume = VolumeManager::from_registry(config, registry, &storage, &os);
        info!(
            os_drivers = ?os.driver_names(),
            storage_drivers = ?storage.driver_names(),
            volume_drivers = ?volume.driver_names(),
            "drivers initialized"
        );
        Self {
            os,
            storage,
            volume,
        }
    }

    /// OS layer.
    #[must_use]
    pub fn os(&self) -> &OsManager {
        &self.os
    }

    /// Storage layer.
    #[must_use]
    pub fn storage(&self) -> &StorageManager {
        &self.storage
    }

    /// Volume layer.
    #[must_use]
    pub const fn volume(&self) -> &VolumeManager {
        &self.volume
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::VolplaneError;
    use crate::test_support::{SimOsDriver, SimStorageDriver};

    fn registry_with(sim: &SimStorageDriver, os: &SimOsDriver) -> DriverRegistry {
        let mut registry = DriverRegistry::with_builtin_drivers();
        registry.register_storage("sim", sim.init());
        registry.register_os("sim-os", os.init());
        registry
    }

    #[test]
    fn layers_follow_configured_driver_names() {
        let sim = SimStorageDriver::new("sim");
        let os = SimOsDriver::named("sim-os");
        let config = Config {
            os_drivers: String::from("sim-os"),
            ..Config::baseline()
        };

        let manager = DriverManager::new(&config, &registry_with(&sim, &os));

        assert_eq!(manager.os().driver_names(), vec![String::from("sim-os")]);
        assert_eq!(manager.storage().driver_names(), vec![String::from("sim")]);
        assert_eq!(manager.volume().driver_names(), vec![String::from("docker")]);
    }

    #[tokio::test]
    async fn volume_layer_reaches_storage_layer() {
        let sim = SimStorageDriver::new("sim");
        let os = SimOsDriver::named("sim-os");
        let seeded = sim.seed_volume("data1", 16);
        let config = Config {
            os_drivers: String::from("sim-os"),
            ..Config::baseline()
        };
        let manager = DriverManager::new(&config, &registry_with(&sim, &os));

        let volume = manager
            .volume()
            .create("data1")
            .await
            .unwrap_or_else(|err| panic!("create: {err}"));

        assert_eq!(volume.volume_id, seeded.volume_id);
        assert_eq!(sim.create_calls(), 0);
    }

    #[tokio::test]
    async fn empty_layers_fail_lazily() {
        let config = Config {
            os_drivers: String::new(),
            volume_drivers: String::from("none"),
            ..Config::baseline()
        };
        let manager = DriverManager::new(&config, &DriverRegistry::new());

        assert_eq!(
            manager.volume().create("data1").await.expect_err("no volume driver"),
            VolplaneError::NoVolumeDriver
        );
        assert_eq!(
            manager.os().mounts("", "").expect_err("no os driver"),
            VolplaneError::NoOsDriver
        );
    }
}
