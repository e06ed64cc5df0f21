//! Configuration loading via `ortho-config`.
//!
//! The managers consume a resolved [`Config`] snapshot and never reload it.
//! Driver selections are comma separated name lists; an empty list selects
//! every registered driver of that kind.

use std::time::Duration;

use camino::Utf8PathBuf;
use ortho_config::OrthoConfig;
use serde::Deserialize;
use thiserror::Error;

/// Default base directory for volume mountpoints.
pub const DEFAULT_MOUNT_ROOT: &str = "/var/lib/docker/volumes";

/// Default file system created on blank devices.
pub const DEFAULT_FS_TYPE: &str = "ext4";

/// Default size, in GiB, of volumes created by the volume integration.
pub const DEFAULT_VOLUME_SIZE_GIB: u64 = 16;

/// Default bound on the attach wait, in milliseconds.
pub const DEFAULT_ATTACH_TIMEOUT_MS: u64 = 10_000;

/// Default interval between device mapping polls, in milliseconds.
pub const DEFAULT_ATTACH_POLL_INTERVAL_MS: u64 = 100;

/// Resolved settings for the driver managers.
#[derive(Clone, Debug, Deserialize, OrthoConfig, PartialEq, Eq)]
#[ortho_config(
    prefix = "VOLPLANE",
    discovery(
        app_name = "volplane",
        env_var = "VOLPLANE_CONFIG_PATH",
        config_file_name = "volplane.toml",
        dotfile_name = ".volplane.toml",
        project_file_name = "volplane.toml"
    )
)]
pub struct Config {
    /// OS drivers to activate.
    #[ortho_config(default = "linux".to_owned())]
    pub os_drivers: String,
    /// Storage drivers to activate. Empty activates every registered backend.
    #[ortho_config(default = String::new())]
    pub storage_drivers: String,
    /// Volume integrations to activate.
    #[ortho_config(default = "docker".to_owned())]
    pub volume_drivers: String,
    /// Log filter used by the binary when `RUST_LOG` is unset.
    #[ortho_config(default = "warn".to_owned())]
    pub log_level: String,
    /// Base directory under which volumes are mounted by name.
    #[ortho_config(default = DEFAULT_MOUNT_ROOT.to_owned())]
    pub mount_root: String,
    /// File system used when formatting blank devices.
    #[ortho_config(default = DEFAULT_FS_TYPE.to_owned())]
    pub default_fs_type: String,
    /// Size of volumes created by name, in GiB.
    #[ortho_config(default = DEFAULT_VOLUME_SIZE_GIB)]
    pub volume_size_gib: u64,
    /// Smallest size the storage manager will request, in GiB.
    pub min_volume_size_gib: Option<u64>,
    /// Volume type passed to the backend on create.
    pub volume_type: Option<String>,
    /// Provisioned IOPS passed to the backend on create.
    pub volume_iops: Option<u64>,
    /// Availability zone passed to the backend on create.
    pub availability_zone: Option<String>,
    /// Upper bound on waiting for an attached device to appear.
    #[ortho_config(default = DEFAULT_ATTACH_TIMEOUT_MS)]
    pub attach_timeout_ms: u64,
    /// Interval between device mapping polls while waiting.
    #[ortho_config(default = DEFAULT_ATTACH_POLL_INTERVAL_MS)]
    pub attach_poll_interval_ms: u64,
}

/// Metadata for a configuration field, used to generate actionable error messages.
struct FieldMetadata {
    description: &'static str,
    env_var: &'static str,
    toml_key: &'static str,
}

impl FieldMetadata {
    const fn new(description: &'static str, env_var: &'static str, toml_key: &'static str) -> Self {
        Self {
            description,
            env_var,
            toml_key,
        }
    }

    fn missing(&self) -> ConfigError {
        ConfigError::MissingField(format!(
            "missing {}: set {} or add {} to volplane.toml",
            self.description, self.env_var, self.toml_key
        ))
    }

    fn invalid(&self, reason: &str) -> ConfigError {
        ConfigError::Invalid(format!(
            "invalid {}: {reason}; set {} or {} in volplane.toml",
            self.description, self.env_var, self.toml_key
        ))
    }
}

const MOUNT_ROOT: FieldMetadata =
    FieldMetadata::new("mount root", "VOLPLANE_MOUNT_ROOT", "mount_root");
const FS_TYPE: FieldMetadata = FieldMetadata::new(
    "default file system type",
    "VOLPLANE_DEFAULT_FS_TYPE",
    "default_fs_type",
);
const VOLUME_SIZE: FieldMetadata = FieldMetadata::new(
    "default volume size",
    "VOLPLANE_VOLUME_SIZE_GIB",
    "volume_size_gib",
);
const ATTACH_TIMEOUT: FieldMetadata = FieldMetadata::new(
    "attach timeout",
    "VOLPLANE_ATTACH_TIMEOUT_MS",
    "attach_timeout_ms",
);
const POLL_INTERVAL: FieldMetadata = FieldMetadata::new(
    "attach poll interval",
    "VOLPLANE_ATTACH_POLL_INTERVAL_MS",
    "attach_poll_interval_ms",
);

impl Config {
    /// Returns the built-in defaults without consulting any source.
    #[must_use]
    pub fn baseline() -> Self {
        Self {
            os_drivers: String::from("linux"),
            storage_drivers: String::new(),
            volume_drivers: String::from("docker"),
            log_level: String::from("warn"),
            mount_root: String::from(DEFAULT_MOUNT_ROOT),
            default_fs_type: String::from(DEFAULT_FS_TYPE),
            volume_size_gib: DEFAULT_VOLUME_SIZE_GIB,
            min_volume_size_gib: None,
            volume_type: None,
            volume_iops: None,
            availability_zone: None,
            attach_timeout_ms: DEFAULT_ATTACH_TIMEOUT_MS,
            attach_poll_interval_ms: DEFAULT_ATTACH_POLL_INTERVAL_MS,
        }
    }

    /// Loads configuration without attempting to parse CLI arguments. Values
    /// merge defaults, configuration files, and environment variables.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] when the merge fails.
    pub fn load_without_cli_args() -> Result<Self, ConfigError> {
        Self::load_from_iter([std::ffi::OsString::from("volplane")])
            .map_err(|err| ConfigError::Parse(err.to_string()))
    }

    /// Performs semantic validation. Error messages name the environment
    /// variable and TOML key that supply the offending value.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingField`] when a required value is empty
    /// and [`ConfigError::Invalid`] when a value is out of range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.mount_root.trim().is_empty() {
            return Err(MOUNT_ROOT.missing());
        }
        if !self.mount_root.trim().starts_with('/') {
            return Err(MOUNT_ROOT.invalid("must be an absolute path"));
        }
        if self.default_fs_type.trim().is_empty() {
            return Err(FS_TYPE.missing());
        }
        if self.volume_size_gib == 0 {
            return Err(VOLUME_SIZE.invalid("must be greater than zero"));
        }
        if self.attach_timeout_ms == 0 {
            return Err(ATTACH_TIMEOUT.invalid("must be greater than zero"));
        }
        if self.attach_poll_interval_ms == 0 {
            return Err(POLL_INTERVAL.invalid("must be greater than zero"));
        }
        if self.attach_poll_interval_ms > self.attach_timeout_ms {
            return Err(POLL_INTERVAL.invalid("must not exceed the attach timeout"));
        }
        Ok(())
    }

    /// Names of the OS drivers to activate.
    #[must_use]
    pub fn os_driver_names(&self) -> Vec<String> {
        split_names(&self.os_drivers)
    }

    /// Names of the storage drivers to activate.
    #[must_use]
    pub fn storage_driver_names(&self) -> Vec<String> {
        split_names(&self.storage_drivers)
    }

    /// Names of the volume integrations to activate.
    #[must_use]
    pub fn volume_driver_names(&self) -> Vec<String> {
        split_names(&self.volume_drivers)
    }

    /// Base directory for mountpoints.
    #[must_use]
    pub fn mount_root_path(&self) -> Utf8PathBuf {
        Utf8PathBuf::from(self.mount_root.trim())
    }

    /// Bound on the attach wait.
    #[must_use]
    pub const fn attach_timeout(&self) -> Duration {
        Duration::from_millis(self.attach_timeout_ms)
    }

    /// Interval between device mapping polls.
    #[must_use]
    pub const fn attach_poll_interval(&self) -> Duration {
        Duration::from_millis(self.attach_poll_interval_ms)
    }
}

fn split_names(list: &str) -> Vec<String> {
    list.split(',')
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .map(str::to_lowercase)
        .collect()
}

/// Errors raised during configuration loading and validation.
#[derive(Debug, Error, Eq, PartialEq)]
pub enum ConfigError {
    /// Indicates a required configuration field is empty or missing.
    #[error("missing configuration field: {0}")]
    MissingField(String),
    /// Indicates a configuration value is present but unusable.
    #[error("invalid configuration value: {0}")]
    Invalid(String),
    /// Surfaces errors from the `ortho-config` loader.
    #[error("configuration parsing failed: {0}")]
    Parse(String),
}

impl From<ortho_config::OrthoError> for ConfigError {
    fn from(value: ortho_config::OrthoError) -> Self {
        Self::Parse(value.to_string())
    }
}
