//! Core library for the volplane block-storage orchestrator.
//!
//! The crate layers three managers over pluggable drivers: an OS manager
//! (mount table, format, mount), a storage manager fronting the active
//! storage backends, and a volume manager that drives the
//! create → attach → format → mount lifecycle for consumers such as container
//! runtimes. Drivers are registered by name in a [`DriverRegistry`] and
//! assembled once at startup by [`DriverManager`].

pub mod config;
pub mod error;
pub mod manager;
pub mod os;
pub mod registry;
pub mod storage;
pub mod test_support;
pub mod types;
pub mod volume;

pub use config::{Config, ConfigError};
pub use error::{ErrorKind, Fields, Result, VolplaneError};
pub use manager::DriverManager;
pub use os::{OsDriver, OsManager};
pub use registry::DriverRegistry;
pub use storage::{DriverFuture, StorageDriver, StorageManager};
pub use types::{
    BlockDevice, CopySnapshotRequest, Instance, MountInfo, Snapshot, SnapshotRequest, Volume,
    VolumeAttachment, VolumeRequest, VolumeRequestBuilder,
};
pub use volume::{AttachWait, MountOptions, VolumeDriver, VolumeManager};
