//! Host operating system capabilities: mount table queries, formatting and
//! mounting of block devices.
//!
//! [`OsManager`] dispatches to the first active [`OsDriver`] by name; a
//! process is expected to run a single OS family.

pub mod command;
pub mod linux;

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use camino::Utf8Path;
use tracing::{debug, info};

use crate::config::Config;
use crate::error::{Fields, Result, VolplaneError};
use crate::registry::DriverRegistry;
use crate::types::MountInfo;

pub use command::{CommandOutput, CommandRunner, ProcessCommandRunner};

/// Capabilities implemented per host OS family.
///
/// Implementations must be safe to call concurrently.
pub trait OsDriver: Send + Sync {
    /// Registered driver name.
    fn name(&self) -> &str;

    /// Returns mount table entries, filtered by `device` and `mountpoint`
    /// when they are non-empty.
    ///
    /// # Errors
    ///
    /// Returns an error when the mount table cannot be read.
    fn mounts(&self, device: &str, mountpoint: &str) -> Result<Vec<MountInfo>>;

    /// Returns `true` when something is mounted at `mountpoint`.
    ///
    /// # Errors
    ///
    /// Returns an error when the mount table cannot be read.
    fn is_mounted(&self, mountpoint: &str) -> Result<bool> {
        Ok(!self.mounts("", mountpoint)?.is_empty())
    }

    /// Mounts `device` at `target`. `label` is an optional security label.
    ///
    /// # Errors
    ///
    /// Returns an error when the mount fails.
    fn mount(&self, device: &str, target: &Utf8Path, options: &str, label: &str) -> Result<()>;

    /// Unmounts whatever is mounted at `mountpoint`.
    ///
    /// # Errors
    ///
    /// Returns an error when the unmount fails.
    fn unmount(&self, mountpoint: &Utf8Path) -> Result<()>;

    /// Creates a `fs_type` file system on `device`.
    ///
    /// A device that already carries a file system is left untouched unless
    /// `overwrite` is set. Returns `true` when the device was formatted.
    ///
    /// # Errors
    ///
    /// Returns an error when probing or formatting fails.
    fn format(&self, device: &str, fs_type: &str, overwrite: bool) -> Result<bool>;
}

/// Single merged mount and format surface over the active OS drivers.
pub struct OsManager {
    drivers: BTreeMap<String, Arc<dyn OsDriver>>,
}

impl fmt::Debug for OsManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OsManager")
            .field("drivers", &self.drivers.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl OsManager {
    /// Wraps an already initialized driver set.
    #[must_use]
    pub fn new(drivers: BTreeMap<String, Arc<dyn OsDriver>>) -> Self {
        if drivers.is_empty() {
            debug!("no OS drivers initialized");
        }
        Self { drivers }
    }

    /// Initializes the OS drivers selected by `config`.
    #[must_use]
    pub fn from_registry(config: &Config, registry: &DriverRegistry) -> Self {
        Self::new(registry.os_drivers(config))
    }

    /// Names of the active drivers in dispatch order.
    #[must_use]
    pub fn driver_names(&self) -> Vec<String> {
        self.drivers.keys().cloned().collect()
    }

    fn driver(&self) -> Result<&Arc<dyn OsDriver>> {
        self.drivers.values().next().ok_or(VolplaneError::NoOsDriver)
    }

    /// See [`OsDriver::mounts`].
    ///
    /// # Errors
    ///
    /// Returns [`VolplaneError::NoOsDriver`] when no driver is active, or the
    /// driver error wrapped with context.
    pub fn mounts(&self, device: &str, mountpoint: &str) -> Result<Vec<MountInfo>> {
        let driver = self.driver()?;
        driver.mounts(device, mountpoint).map_err(|err| {
            err.context(
                "failed to read mount table",
                Fields::new()
                    .with("os_driver", driver.name())
                    .with("device", device)
                    .with("mountpoint", mountpoint),
            )
        })
    }

    /// See [`OsDriver::is_mounted`].
    ///
    /// # Errors
    ///
    /// Returns [`VolplaneError::NoOsDriver`] when no driver is active, or the
    /// driver error wrapped with context.
    pub fn is_mounted(&self, mountpoint: &str) -> Result<bool> {
        let driver = self.driver()?;
        driver.is_mounted(mountpoint).map_err(|err| {
            err.context(
                "failed to check mountpoint",
                Fields::new()
                    .with("os_driver", driver.name())
                    .with("mountpoint", mountpoint),
            )
        })
    }

    /// See [`OsDriver::mount`].
    ///
    /// # Errors
    ///
    /// Returns [`VolplaneError::NoOsDriver`] when no driver is active, or the
    /// driver error wrapped with context.
    pub fn mount(&self, device: &str, target: &Utf8Path, options: &str, label: &str) -> Result<()> {
        let driver = self.driver()?;
        driver.mount(device, target, options, label).map_err(|err| {
            err.context(
                "failed to mount device",
                Fields::new()
                    .with("os_driver", driver.name())
                    .with("device", device)
                    .with("target", target),
            )
        })?;
        info!(device, target = %target, "mounted device");
        Ok(())
    }

    /// See [`OsDriver::unmount`].
    ///
    /// # Errors
    ///
    /// Returns [`VolplaneError::NoOsDriver`] when no driver is active, or the
    /// driver error wrapped with context.
    pub fn unmount(&self, mountpoint: &Utf8Path) -> Result<()> {
        let driver = self.driver()?;
        driver.unmount(mountpoint).map_err(|err| {
            err.context(
                "failed to unmount",
                Fields::new()
                    .with("os_driver", driver.name())
                    .with("mountpoint", mountpoint),
            )
        })?;
        info!(mountpoint = %mountpoint, "unmounted");
        Ok(())
    }

    /// See [`OsDriver::format`].
    ///
    /// # Errors
    ///
    /// Returns [`VolplaneError::NoOsDriver`] when no driver is active, or the
    /// driver error wrapped with context.
    pub fn format(&self, device: &str, fs_type: &str, overwrite: bool) -> Result<bool> {
        let driver = self.driver()?;
        let formatted = driver.format(device, fs_type, overwrite).map_err(|err| {
            err.context(
                "failed to format device",
                Fields::new()
                    .with("os_driver", driver.name())
                    .with("device", device)
                    .with("fs_type", fs_type),
            )
        })?;
        if formatted {
            info!(device, fs_type, "formatted device");
        } else {
            debug!(device, "device already carries a file system");
        }
        Ok(formatted)
    }
}
