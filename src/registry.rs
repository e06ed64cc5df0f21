//! Explicit driver registries.
//!
//! The host program builds a [`DriverRegistry`] at start-up, registers every
//! driver it ships, and hands the registry to [`crate::DriverManager`].
//! Registration replaces any previous initializer with the same name.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::config::Config;
use crate::error::Result;
use crate::os::linux::{self, LinuxOsDriver};
use crate::os::{OsDriver, OsManager};
use crate::storage::{StorageDriver, StorageManager};
use crate::volume::VolumeDriver;
use crate::volume::docker::DockerVolumeDriver;

/// Initializer for a storage backend.
pub type StorageDriverInit = Arc<dyn Fn(&Config) -> Result<Arc<dyn StorageDriver>> + Send + Sync>;

/// Initializer for an OS driver.
pub type OsDriverInit = Arc<dyn Fn(&Config) -> Result<Arc<dyn OsDriver>> + Send + Sync>;

/// Initializer for a volume integration. Receives the managers it composes.
pub type VolumeDriverInit = Arc<
    dyn Fn(&Config, &Arc<StorageManager>, &Arc<OsManager>) -> Result<Arc<dyn VolumeDriver>>
        + Send
        + Sync,
>;

/// Name → initializer table for one kind of driver.
pub struct Registry<F> {
    kind: &'static str,
    inits: BTreeMap<String, F>,
}

impl<F> Registry<F> {
    /// Creates an empty registry for drivers of `kind`.
    #[must_use]
    pub const fn new(kind: &'static str) -> Self {
        Self {
            kind,
            inits: BTreeMap::new(),
        }
    }

    /// Registers `init` under `name`; a later registration with the same
    /// name wins.
    pub fn register(&mut self, name: impl Into<String>, init: F) {
        let key = name.into().to_lowercase();
        if self.inits.insert(key.clone(), init).is_some() {
            debug!(kind = self.kind, driver = %key, "replaced driver registration");
        }
    }

    /// Registered names in dispatch order.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        self.inits.keys().cloned().collect()
    }

    /// Initializes every registered driver allowed by `filter`.
    ///
    /// An empty filter allows every name. A driver whose initializer fails
    /// is logged and left out of the result.
    pub fn instantiate<D>(
        &self,
        filter: &[String],
        mut init: impl FnMut(&F) -> Result<D>,
    ) -> BTreeMap<String, D> {
        let mut drivers = BTreeMap::new();
        for (name, initializer) in &self.inits {
            if !filter.is_empty() && !filter.contains(name) {
                continue;
            }
            match init(initializer) {
                Ok(driver) => {
                    debug!(kind = self.kind, driver = %name, "initialized driver");
                    drivers.insert(name.clone(), driver);
                }
                Err(err) => {
                    warn!(kind = self.kind, driver = %name, error = %err, "driver initialization failed; skipping");
                }
            }
        }
        for wanted in filter {
            if !self.inits.contains_key(wanted) {
                warn!(kind = self.kind, driver = %wanted, "configured driver is not registered");
            }
        }
        drivers
    }
}

impl<F> fmt::Debug for Registry<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("kind", &self.kind)
            .field("names", &self.inits.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Registries for every driver kind.
#[derive(Debug)]
pub struct DriverRegistry {
    storage: Registry<StorageDriverInit>,
    os: Registry<OsDriverInit>,
    volume: Registry<VolumeDriverInit>,
}

impl Default for DriverRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl DriverRegistry {
    /// Creates registries with no drivers.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            storage: Registry::new("storage"),
            os: Registry::new("os"),
            volume: Registry::new("volume"),
        }
    }

    /// Creates registries holding the drivers shipped with the crate: the
    /// `linux` OS driver and the `docker` volume integration.
    #[must_use]
    pub fn with_builtin_drivers() -> Self {
        let mut registry = Self::new();
        registry.register_os(
            linux::DRIVER_NAME,
            Arc::new(|_config: &Config| -> Result<Arc<dyn OsDriver>> {
                Ok(Arc::new(LinuxOsDriver::new()))
            }),
        );
        registry.register_volume(
            DockerVolumeDriver::NAME,
            Arc::new(
                |config: &Config,
                 storage: &Arc<StorageManager>,
                 os: &Arc<OsManager>|
                 -> Result<Arc<dyn VolumeDriver>> {
                    Ok(Arc::new(DockerVolumeDriver::new(
                        config,
                        Arc::clone(storage),
                        Arc::clone(os),
                    )))
                },
            ),
        );
        registry
    }

    /// Registers a storage backend.
    pub fn register_storage(&mut self, name: impl Into<String>, init: StorageDriverInit) {
        self.storage.register(name, init);
    }

    /// Registers an OS driver.
    pub fn register_os(&mut self, name: impl Into<String>, init: OsDriverInit) {
        self.os.register(name, init);
    }

    /// Registers a volume integration.
    pub fn register_volume(&mut self, name: impl Into<String>, init: VolumeDriverInit) {
        self.volume.register(name, init);
    }

    /// Registered storage backend names.
    #[must_use]
    pub fn storage_names(&self) -> Vec<String> {
        self.storage.names()
    }

    /// Registered OS driver names.
    #[must_use]
    pub fn os_names(&self) -> Vec<String> {
        self.os.names()
    }

    /// Registered volume integration names.
    #[must_use]
    pub fn volume_names(&self) -> Vec<String> {
        self.volume.names()
    }

    /// Initializes the storage backends selected by `config`.
    #[must_use]
    pub fn storage_drivers(&self, config: &Config) -> BTreeMap<String, Arc<dyn StorageDriver>> {
        self.storage
            .instantiate(&config.storage_driver_names(), |init| init(config))
    }

    /// Initializes the OS drivers selected by `config`.
    #[must_use]
    pub fn os_drivers(&self, config: &Config) -> BTreeMap<String, Arc<dyn OsDriver>> {
        self.os
            .instantiate(&config.os_driver_names(), |init| init(config))
    }

    /// Initializes the volume integrations selected by `config`.
    #[must_use]
    pub fn volume_drivers(
        &self,
        config: &Config,
        storage: &Arc<StorageManager>,
        os: &Arc<OsManager>,
    ) -> BTreeMap<String, Arc<dyn VolumeDriver>> {
        self.volume
            .instantiate(&config.volume_driver_names(), |init| {
                init(config, storage, os)
            })
    }
}
