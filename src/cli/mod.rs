//! Command-line interface definitions for the `volplane` binary.
//!
//! This module centralises the clap parser structures so both the main binary
//! and the build script can reuse them when generating the manual page.

use clap::{Args, Parser, Subcommand};

/// Top-level CLI for the `volplane` binary.
#[derive(Debug, Parser)]
#[command(
    name = "volplane",
    about = "Orchestrate block-storage volumes and mount them on this host",
    arg_required_else_help = true
)]
pub(crate) enum Cli {
    /// Identify this host through every active storage backend.
    #[command(name = "instance")]
    Instance,
    /// Inspect and prepare block devices on this host.
    #[command(subcommand)]
    Device(DeviceCommand),
    /// Manage volumes on the active storage backend.
    #[command(subcommand)]
    Volume(VolumeCommand),
    /// Manage snapshots on the active storage backend.
    #[command(subcommand)]
    Snapshot(SnapshotCommand),
}

/// `volplane device` subcommands.
#[derive(Debug, Subcommand)]
pub(crate) enum DeviceCommand {
    /// List attached volumes and their host device names.
    List,
    /// Show mount table entries, optionally filtered.
    Mounts {
        /// Only show entries for this device.
        #[arg(long)]
        device: Option<String>,
        /// Only show entries for this mountpoint.
        #[arg(long)]
        mountpoint: Option<String>,
    },
    /// Create a file system on a device unless one already exists.
    Format {
        /// Device to format.
        device: String,
        /// File system type.
        #[arg(long = "fs-type", default_value = "ext4")]
        fs_type: String,
        /// Reformat even when a file system is present.
        #[arg(long)]
        overwrite: bool,
    },
    /// Mount a device on a target directory.
    Mount {
        /// Device to mount.
        device: String,
        /// Target directory.
        target: String,
        /// Comma separated mount options.
        #[arg(long, short = 'o', default_value = "")]
        options: String,
        /// SELinux context label.
        #[arg(long, default_value = "")]
        label: String,
    },
    /// Unmount a mountpoint.
    Unmount {
        /// Mountpoint to release.
        mountpoint: String,
    },
}

/// Selects a volume by id or name.
#[derive(Debug, Args)]
pub(crate) struct VolumeSelector {
    /// Volume identifier.
    #[arg(long = "volume-id")]
    pub(crate) volume_id: Option<String>,
    /// Volume name.
    #[arg(long)]
    pub(crate) name: Option<String>,
}

/// `volplane volume` subcommands.
#[derive(Debug, Subcommand)]
pub(crate) enum VolumeCommand {
    /// List volumes across every active backend.
    List(VolumeSelector),
    /// Create a volume on the active backend.
    Create(CreateVolumeCommand),
    /// Remove a volume from the active backend.
    Remove {
        /// Volume identifier.
        #[arg(long = "volume-id")]
        volume_id: String,
    },
    /// Attach a volume to an instance.
    Attach(AttachmentCommand),
    /// Detach a volume from an instance.
    Detach(AttachmentCommand),
    /// Attach, format if blank, and mount a volume under the mount root.
    Mount {
        #[command(flatten)]
        selector: VolumeSelector,
        /// Reformat even when a file system is present.
        #[arg(long = "overwrite-fs")]
        overwrite_fs: bool,
        /// File system type used when formatting.
        #[arg(long = "fs-type")]
        fs_type: Option<String>,
    },
    /// Unmount and detach a volume.
    Unmount(VolumeSelector),
    /// Print the mountpoint of a volume, if mounted.
    Path(VolumeSelector),
}

/// Arguments for `volplane volume create`.
#[derive(Debug, Args)]
pub(crate) struct CreateVolumeCommand {
    /// Name of the new volume.
    #[arg(long)]
    pub(crate) name: String,
    /// Size in GiB; zero inherits the source size.
    #[arg(long = "size-gib", default_value_t = 0)]
    pub(crate) size_gib: u64,
    /// Backend volume type.
    #[arg(long = "volume-type")]
    pub(crate) volume_type: Option<String>,
    /// Provisioned IOPS.
    #[arg(long)]
    pub(crate) iops: Option<u64>,
    /// Availability zone.
    #[arg(long = "availability-zone")]
    pub(crate) availability_zone: Option<String>,
    /// Clone from this volume.
    #[arg(long = "source-volume-id")]
    pub(crate) source_volume_id: Option<String>,
    /// Restore from this snapshot.
    #[arg(long = "source-snapshot-id")]
    pub(crate) source_snapshot_id: Option<String>,
    /// Return without waiting for the backend to confirm.
    #[arg(long = "async")]
    pub(crate) run_async: bool,
}

/// Arguments for `volplane volume attach` and `detach`.
#[derive(Debug, Args)]
pub(crate) struct AttachmentCommand {
    /// Volume identifier.
    #[arg(long = "volume-id")]
    pub(crate) volume_id: String,
    /// Instance identifier; defaults to this host.
    #[arg(long = "instance-id")]
    pub(crate) instance_id: Option<String>,
    /// Return without waiting for the backend to confirm.
    #[arg(long = "async")]
    pub(crate) run_async: bool,
}

/// `volplane snapshot` subcommands.
#[derive(Debug, Subcommand)]
pub(crate) enum SnapshotCommand {
    /// List snapshots across every active backend.
    List {
        /// Only snapshots of this volume.
        #[arg(long = "volume-id")]
        volume_id: Option<String>,
        /// Snapshot identifier.
        #[arg(long = "snapshot-id")]
        snapshot_id: Option<String>,
        /// Snapshot name.
        #[arg(long)]
        name: Option<String>,
    },
    /// Snapshot a volume.
    Create {
        /// Volume identifier.
        #[arg(long = "volume-id")]
        volume_id: String,
        /// Snapshot name.
        #[arg(long, default_value = "")]
        name: String,
        /// Free form description.
        #[arg(long, default_value = "")]
        description: String,
        /// Return without waiting for the backend to confirm.
        #[arg(long = "async")]
        run_async: bool,
    },
    /// Remove a snapshot.
    Remove {
        /// Snapshot identifier.
        #[arg(long = "snapshot-id")]
        snapshot_id: String,
    },
    /// Copy a snapshot, possibly to another region.
    Copy {
        /// Volume whose snapshot is copied.
        #[arg(long = "volume-id")]
        volume_id: Option<String>,
        /// Snapshot identifier.
        #[arg(long = "snapshot-id")]
        snapshot_id: Option<String>,
        /// Snapshot name.
        #[arg(long = "snapshot-name")]
        snapshot_name: Option<String>,
        /// Name of the copy.
        #[arg(long = "target-name", default_value = "")]
        target_name: String,
        /// Region receiving the copy.
        #[arg(long = "target-region")]
        target_region: Option<String>,
        /// Return without waiting for the backend to confirm.
        #[arg(long = "async")]
        run_async: bool,
    },
}
