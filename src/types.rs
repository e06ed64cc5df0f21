//! Backend-reported entities and the request types used to mutate them.
//!
//! Entities are transient views: every manager call re-queries the backend
//! and nothing here is cached.

use serde::Serialize;

use crate::error::{Fields, Result, VolplaneError};

/// The local host as seen by a storage backend.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize)]
pub struct Instance {
    /// Name of the storage driver that reported the instance.
    pub provider_name: String,
    /// Provider specific instance identifier.
    pub instance_id: String,
    /// Region or zone the instance runs in.
    pub region: String,
    /// Human readable instance name.
    pub name: String,
}

/// Binding between a volume and an instance.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize)]
pub struct VolumeAttachment {
    /// Attached volume.
    pub volume_id: String,
    /// Instance the volume is attached to.
    pub instance_id: String,
    /// Host block device path. Empty until the host has enumerated the device.
    pub device_name: String,
    /// Backend specific attachment status.
    pub status: String,
}

impl VolumeAttachment {
    /// Returns `true` once the host has enumerated the device.
    #[must_use]
    pub fn has_device(&self) -> bool {
        !self.device_name.is_empty()
    }
}

/// A block-storage volume.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize)]
pub struct Volume {
    /// Human readable name.
    pub name: String,
    /// Backend assigned identifier.
    pub volume_id: String,
    /// Availability zone holding the volume.
    pub availability_zone: String,
    /// Backend specific status.
    pub status: String,
    /// Backend specific volume type.
    pub volume_type: String,
    /// Provisioned IOPS, zero when not applicable.
    pub iops: u64,
    /// Size in GiB.
    pub size_gib: u64,
    /// Backend specific discovery string for network-mapped devices.
    pub network_name: String,
    /// Current attachments.
    pub attachments: Vec<VolumeAttachment>,
}

/// Point-in-time copy of a volume.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize)]
pub struct Snapshot {
    /// Human readable name.
    pub name: String,
    /// Ancestor volume.
    pub volume_id: String,
    /// Backend assigned identifier.
    pub snapshot_id: String,
    /// Size in GiB.
    pub size_gib: u64,
    /// Backend reported start time.
    pub start_time: String,
    /// Free form description.
    pub description: String,
    /// Backend specific status.
    pub status: String,
}

/// Raw host-visible block device mapping.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize)]
pub struct BlockDevice {
    /// Name of the storage driver that reported the mapping.
    pub provider_name: String,
    /// Instance the device is mapped to.
    pub instance_id: String,
    /// Region of the instance.
    pub region: String,
    /// Host device path. Empty until the host has enumerated the device.
    pub device_name: String,
    /// Volume backing the device.
    pub volume_id: String,
    /// Backend specific status.
    pub status: String,
}

/// Host mount table entry.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize)]
pub struct MountInfo {
    /// Mounted device or source.
    pub device: String,
    /// Directory the device is mounted on.
    pub mountpoint: String,
    /// File system type.
    pub fs_type: String,
    /// Comma separated mount options.
    pub options: String,
}

/// Parameters for creating a volume.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct VolumeRequest {
    /// Name of the new volume.
    pub name: String,
    /// Volume to copy from.
    pub source_volume_id: Option<String>,
    /// Snapshot to restore from.
    pub source_snapshot_id: Option<String>,
    /// Backend specific volume type.
    pub volume_type: Option<String>,
    /// Provisioned IOPS.
    pub iops: Option<u64>,
    /// Size in GiB; zero lets the backend size a volume created from a source.
    pub size_gib: u64,
    /// Target availability zone.
    pub availability_zone: Option<String>,
    /// When set the backend returns without awaiting its own confirmation.
    pub run_async: bool,
}

impl VolumeRequest {
    /// Starts a builder for a [`VolumeRequest`].
    #[must_use]
    pub fn builder() -> VolumeRequestBuilder {
        VolumeRequestBuilder::default()
    }

    /// Returns `true` when the request restores or copies an existing source.
    #[must_use]
    pub const fn has_source(&self) -> bool {
        self.source_volume_id.is_some() || self.source_snapshot_id.is_some()
    }

    /// Validates the request.
    ///
    /// # Errors
    ///
    /// Returns [`VolplaneError::InvalidArgument`] when the name is empty or
    /// when a new volume is requested without a size.
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(VolplaneError::invalid_argument(
                "volume name is required",
                Fields::new(),
            ));
        }
        if self.size_gib == 0 && !self.has_source() {
            return Err(VolplaneError::invalid_argument(
                "size is required unless a source volume or snapshot is given",
                Fields::new().with("name", &self.name),
            ));
        }
        Ok(())
    }
}

/// Builder for [`VolumeRequest`] that trims inputs and validates on build.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct VolumeRequestBuilder {
    name: String,
    source_volume_id: Option<String>,
    source_snapshot_id: Option<String>,
    volume_type: Option<String>,
    iops: Option<u64>,
    size_gib: u64,
    availability_zone: Option<String>,
    run_async: bool,
}

impl VolumeRequestBuilder {
    /// Sets the volume name.
    #[must_use]
    pub fn name(mut self, value: impl Into<String>) -> Self {
        self.name = value.into();
        self
    }

    /// Sets the volume to copy from.
    #[must_use]
    pub fn source_volume_id(mut self, value: Option<String>) -> Self {
        self.source_volume_id = value;
        self
    }

    /// Sets the snapshot to restore from.
    #[must_use]
    pub fn source_snapshot_id(mut self, value: Option<String>) -> Self {
        self.source_snapshot_id = value;
        self
    }

    /// Sets the volume type.
    #[must_use]
    pub fn volume_type(mut self, value: Option<String>) -> Self {
        self.volume_type = value;
        self
    }

    /// Sets provisioned IOPS.
    #[must_use]
    pub const fn iops(mut self, value: Option<u64>) -> Self {
        self.iops = value;
        self
    }

    /// Sets the size in GiB.
    #[must_use]
    pub const fn size_gib(mut self, value: u64) -> Self {
        self.size_gib = value;
        self
    }

    /// Sets the availability zone.
    #[must_use]
    pub fn availability_zone(mut self, value: Option<String>) -> Self {
        self.availability_zone = value;
        self
    }

    /// Sets whether the backend skips awaiting its own confirmation.
    #[must_use]
    pub const fn run_async(mut self, value: bool) -> Self {
        self.run_async = value;
        self
    }

    /// Builds and validates the [`VolumeRequest`], trimming string inputs.
    /// Optional values that are blank after trimming are dropped.
    ///
    /// # Errors
    ///
    /// Returns [`VolplaneError::InvalidArgument`] when validation fails.
    pub fn build(self) -> Result<VolumeRequest> {
        let request = VolumeRequest {
            name: self.name.trim().to_owned(),
            source_volume_id: trimmed(self.source_volume_id),
            source_snapshot_id: trimmed(self.source_snapshot_id),
            volume_type: trimmed(self.volume_type),
            iops: self.iops,
            size_gib: self.size_gib,
            availability_zone: trimmed(self.availability_zone),
            run_async: self.run_async,
        };
        request.validate()?;
        Ok(request)
    }
}

/// Parameters for creating a snapshot.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct SnapshotRequest {
    /// Name of the new snapshot.
    pub name: String,
    /// Volume to snapshot.
    pub volume_id: String,
    /// Free form description.
    pub description: String,
    /// When set the backend returns without awaiting its own confirmation.
    pub run_async: bool,
}

impl SnapshotRequest {
    /// Creates a snapshot request, trimming string inputs.
    ///
    /// # Errors
    ///
    /// Returns [`VolplaneError::InvalidArgument`] when the volume id is empty.
    pub fn new(
        name: impl Into<String>,
        volume_id: impl Into<String>,
        description: impl Into<String>,
        run_async: bool,
    ) -> Result<Self> {
        let request = Self {
            name: name.into().trim().to_owned(),
            volume_id: volume_id.into().trim().to_owned(),
            description: description.into().trim().to_owned(),
            run_async,
        };
        if request.volume_id.is_empty() {
            return Err(VolplaneError::invalid_argument(
                "volume id is required to create a snapshot",
                Fields::new().with("name", &request.name),
            ));
        }
        Ok(request)
    }
}

/// Parameters for copying a snapshot, possibly across regions.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct CopySnapshotRequest {
    /// Volume whose snapshot is copied, used when the snapshot id is unknown.
    pub volume_id: Option<String>,
    /// Snapshot to copy.
    pub snapshot_id: Option<String>,
    /// Name of the snapshot to copy.
    pub snapshot_name: Option<String>,
    /// Name of the copy.
    pub target_name: String,
    /// Region receiving the copy.
    pub target_region: Option<String>,
    /// When set the backend returns without awaiting its own confirmation.
    pub run_async: bool,
}

impl CopySnapshotRequest {
    /// Validates that the source snapshot is identifiable.
    ///
    /// # Errors
    ///
    /// Returns [`VolplaneError::InvalidArgument`] when no source identifier
    /// is present.
    pub fn validate(&self) -> Result<()> {
        let identified = [&self.volume_id, &self.snapshot_id, &self.snapshot_name]
            .iter()
            .any(|value| value.as_deref().is_some_and(|text| !text.trim().is_empty()));
        if identified {
            Ok(())
        } else {
            Err(VolplaneError::invalid_argument(
                "a volume id, snapshot id or snapshot name is required to copy a snapshot",
                Fields::new().with("target_name", &self.target_name),
            ))
        }
    }
}

fn trimmed(value: Option<String>) -> Option<String> {
    value
        .map(|text| text.trim().to_owned())
        .filter(|text| !text.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use rstest::rstest;

    #[test]
    fn builder_trims_and_drops_blank_options() {
        let request = VolumeRequest::builder()
            .name("  data1 ")
            .volume_type(Some(String::from("  ")))
            .availability_zone(Some(String::from(" zone-a ")))
            .size_gib(16)
            .build()
            .unwrap_or_else(|err| panic!("request should build: {err}"));

        assert_eq!(request.name, "data1");
        assert_eq!(request.volume_type, None);
        assert_eq!(request.availability_zone.as_deref(), Some("zone-a"));
    }

    #[rstest]
    #[case::missing_name("", 16, None)]
    #[case::zero_size_without_source("data1", 0, None)]
    fn builder_rejects_invalid_requests(
        #[case] name: &str,
        #[case] size: u64,
        #[case] source: Option<String>,
    ) {
        let err = VolumeRequest::builder()
            .name(name)
            .size_gib(size)
            .source_snapshot_id(source)
            .build()
            .expect_err("request should be rejected");
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    }

    #[test]
    fn zero_size_is_allowed_when_restoring() {
        let request = VolumeRequest::builder()
            .name("restored")
            .source_snapshot_id(Some(String::from("snap-1")))
            .build()
            .unwrap_or_else(|err| panic!("restore should build: {err}"));
        assert!(request.has_source());
        assert_eq!(request.size_gib, 0);
    }

    #[test]
    fn snapshot_request_requires_volume() {
        let err = SnapshotRequest::new("nightly", "  ", "", false)
            .expect_err("volume id is required");
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    }

    #[test]
    fn copy_request_requires_a_source_identifier() {
        let request = CopySnapshotRequest {
            target_name: String::from("copy"),
            snapshot_name: Some(String::from(" ")),
            ..CopySnapshotRequest::default()
        };
        assert!(request.validate().is_err());

        let named = CopySnapshotRequest {
            snapshot_id: Some(String::from("snap-1")),
            ..request
        };
        assert!(named.validate().is_ok());
    }
}
