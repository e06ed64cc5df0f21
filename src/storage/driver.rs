//! Capability contract implemented by every storage backend.

use std::future::Future;
use std::pin::Pin;

use crate::error::{Result, VolplaneError};
use crate::types::{
    BlockDevice, CopySnapshotRequest, Instance, Snapshot, Volume, VolumeAttachment, VolumeRequest,
};

/// Future returned by storage backend operations.
pub type DriverFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Operations a storage backend provides to the managers.
///
/// Backends report entities without enforcing uniqueness; the managers
/// decide when exactly one match is required. The `run_async` flags only
/// control whether the backend awaits its own provider-side confirmation.
/// Implementations must be safe to call concurrently.
pub trait StorageDriver: Send + Sync {
    /// Registered driver name.
    fn name(&self) -> &str;

    /// Identifies the local host.
    fn instance(&self) -> DriverFuture<'_, Instance>;

    /// Enumerates host-local block device mappings.
    fn volume_mapping(&self) -> DriverFuture<'_, Vec<BlockDevice>>;

    /// Returns volumes matching `volume_id` and `name`; empty filters match
    /// everything.
    fn volumes<'a>(&'a self, volume_id: &'a str, name: &'a str) -> DriverFuture<'a, Vec<Volume>>;

    /// Returns attachments of `volume_id`; an empty `instance_id` returns
    /// attachments to every instance.
    fn volume_attachments<'a>(
        &'a self,
        volume_id: &'a str,
        instance_id: &'a str,
    ) -> DriverFuture<'a, Vec<VolumeAttachment>>;

    /// Creates a volume, restoring from a source when the request names one.
    fn create_volume<'a>(&'a self, request: &'a VolumeRequest) -> DriverFuture<'a, Volume>;

    /// Removes a volume.
    fn remove_volume<'a>(&'a self, volume_id: &'a str) -> DriverFuture<'a, ()>;

    /// Attaches a volume to an instance.
    fn attach_volume<'a>(
        &'a self,
        run_async: bool,
        volume_id: &'a str,
        instance_id: &'a str,
    ) -> DriverFuture<'a, Vec<VolumeAttachment>>;

    /// Detaches a volume from an instance.
    fn detach_volume<'a>(
        &'a self,
        run_async: bool,
        volume_id: &'a str,
        instance_id: &'a str,
    ) -> DriverFuture<'a, ()>;

    /// Returns snapshots matching the non-empty filters.
    fn snapshots<'a>(
        &'a self,
        volume_id: &'a str,
        snapshot_id: &'a str,
        name: &'a str,
    ) -> DriverFuture<'a, Vec<Snapshot>>;

    /// Creates a snapshot of a volume.
    fn create_snapshot<'a>(
        &'a self,
        run_async: bool,
        name: &'a str,
        volume_id: &'a str,
        description: &'a str,
    ) -> DriverFuture<'a, Vec<Snapshot>>;

    /// Removes a snapshot.
    fn remove_snapshot<'a>(&'a self, snapshot_id: &'a str) -> DriverFuture<'a, ()>;

    /// Copies a snapshot. Backends without the capability keep this default.
    fn copy_snapshot<'a>(&'a self, _request: &'a CopySnapshotRequest) -> DriverFuture<'a, Snapshot> {
        Box::pin(async move {
            Err(VolplaneError::NotImplemented {
                driver: self.name().to_owned(),
                operation: "copy_snapshot",
            })
        })
    }

    /// Returns the device slot to use for the next attach, for backends that
    /// make the caller choose one.
    fn next_available_device(&self) -> DriverFuture<'_, Option<String>> {
        Box::pin(async { Ok(None) })
    }
}
