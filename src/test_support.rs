//! Test support utilities shared across unit and integration tests.
//!
//! [`SimStorageDriver`] and [`SimOsDriver`] keep their state behind shared
//! handles, so a clone kept by a test observes every call made through the
//! clone handed to a manager.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::env;
use std::ffi::OsString;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use camino::Utf8Path;
use tokio::sync::{Mutex as AsyncMutex, MutexGuard as AsyncMutexGuard};
use tokio::time::Instant;
use uuid::Uuid;

use crate::config::Config;
use crate::error::{Fields, Result, VolplaneError};
use crate::os::{CommandOutput, CommandRunner, OsDriver};
use crate::registry::{OsDriverInit, StorageDriverInit};
use crate::storage::{DriverFuture, StorageDriver};
use crate::types::{
    BlockDevice, Instance, MountInfo, Snapshot, Volume, VolumeAttachment, VolumeRequest,
};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Scripted command runner that returns pre-seeded outputs in FIFO order.
///
/// Used to drive deterministic command outcomes without spawning processes.
#[derive(Clone, Debug, Default)]
pub struct ScriptedRunner {
    responses: Arc<Mutex<VecDeque<CommandOutput>>>,
    invocations: Arc<Mutex<Vec<CommandInvocation>>>,
}

/// Records a single invocation made through [`ScriptedRunner`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CommandInvocation {
    /// Program name as passed to the runner.
    pub program: String,
    /// Arguments passed to the program.
    pub args: Vec<OsString>,
}

impl CommandInvocation {
    /// Returns a shell-like command string for assertions.
    #[must_use]
    pub fn command_string(&self) -> String {
        let mut parts = Vec::with_capacity(self.args.len() + 1);
        parts.push(self.program.clone());
        parts.extend(
            self.args
                .iter()
                .map(|arg| arg.to_string_lossy().into_owned()),
        );
        parts.join(" ")
    }
}

impl ScriptedRunner {
    /// Creates a new runner with no queued responses.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a snapshot of all invocations recorded so far.
    #[must_use]
    pub fn invocations(&self) -> Vec<CommandInvocation> {
        lock(&self.invocations).clone()
    }

    /// Pushes a successful exit status.
    pub fn push_success(&self) {
        self.push_output(Some(0), "", "");
    }

    /// Pushes a failing exit code with stderr text.
    pub fn push_failure(&self, code: i32) {
        self.push_output(Some(code), "", "simulated failure");
    }

    /// Pushes an explicit command output response.
    pub fn push_output(
        &self,
        code: Option<i32>,
        stdout: impl Into<String>,
        stderr: impl Into<String>,
    ) {
        lock(&self.responses).push_back(CommandOutput {
            code,
            stdout: stdout.into(),
            stderr: stderr.into(),
        });
    }
}

impl CommandRunner for ScriptedRunner {
    fn run(&self, program: &str, args: &[OsString]) -> Result<CommandOutput> {
        lock(&self.invocations).push(CommandInvocation {
            program: program.to_owned(),
            args: args.to_vec(),
        });
        lock(&self.responses)
            .pop_front()
            .ok_or_else(|| VolplaneError::Spawn {
                program: program.to_owned(),
                message: String::from("no scripted response available"),
            })
    }
}

#[derive(Debug)]
struct SimAttachment {
    volume_id: String,
    instance_id: String,
    device_name: String,
    visible_at: Instant,
}

impl SimAttachment {
    fn view(&self, now: Instant) -> VolumeAttachment {
        VolumeAttachment {
            volume_id: self.volume_id.clone(),
            instance_id: self.instance_id.clone(),
            device_name: if now >= self.visible_at {
                self.device_name.clone()
            } else {
                String::new()
            },
            status: String::from("attached"),
        }
    }
}

#[derive(Debug, Default)]
struct SimStorageState {
    volumes: Vec<Volume>,
    attachments: Vec<SimAttachment>,
    snapshots: Vec<Snapshot>,
    enumeration_delay: Duration,
    failing: BTreeSet<String>,
    calls: BTreeMap<&'static str, usize>,
    created: Vec<VolumeRequest>,
}

impl SimStorageState {
    fn attachments_of(&self, volume_id: &str, now: Instant) -> Vec<VolumeAttachment> {
        self.attachments
            .iter()
            .filter(|attachment| attachment.volume_id == volume_id)
            .map(|attachment| attachment.view(now))
            .collect()
    }

    fn volume(&self, volume_id: &str) -> Result<&Volume> {
        self.volumes
            .iter()
            .find(|volume| volume.volume_id == volume_id)
            .ok_or_else(|| VolplaneError::NotFound {
                entity: "volume",
                fields: Fields::new().with("volume_id", volume_id),
            })
    }
}

/// In-memory storage backend.
///
/// Attachments become visible as host devices after the configured
/// enumeration delay, measured on the tokio clock so paused-time tests can
/// step through it. `run_async` flags are accepted and ignored because the
/// simulation confirms every request immediately.
#[derive(Clone, Debug)]
pub struct SimStorageDriver {
    name: String,
    instance: Instance,
    state: Arc<Mutex<SimStorageState>>,
}

impl SimStorageDriver {
    /// Creates an empty backend whose local instance is `i-<name>`.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        let driver_name = name.into();
        let instance = Instance {
            provider_name: driver_name.clone(),
            instance_id: format!("i-{driver_name}"),
            region: String::from("sim-region-1"),
            name: format!("{driver_name}-host"),
        };
        Self {
            name: driver_name,
            instance,
            state: Arc::new(Mutex::new(SimStorageState::default())),
        }
    }

    /// Registry initializer handing out clones sharing this driver's state.
    #[must_use]
    pub fn init(&self) -> StorageDriverInit {
        let driver = self.clone();
        Arc::new(move |_config: &Config| -> Result<Arc<dyn StorageDriver>> {
            Ok(Arc::new(driver.clone()))
        })
    }

    /// Identifier of the simulated local instance.
    #[must_use]
    pub fn instance_id(&self) -> &str {
        &self.instance.instance_id
    }

    /// Delays device visibility after an attach.
    pub fn set_enumeration_delay(&self, delay: Duration) {
        lock(&self.state).enumeration_delay = delay;
    }

    /// Makes every later call to `operation` fail.
    pub fn fail(&self, operation: &str) {
        lock(&self.state).failing.insert(operation.to_owned());
    }

    /// Inserts a volume directly and returns it.
    pub fn seed_volume(&self, name: &str, size_gib: u64) -> Volume {
        let volume = Self::new_volume(name, size_gib, None, None, None);
        lock(&self.state).volumes.push(volume.clone());
        volume
    }

    /// Inserts a snapshot of `volume_id` directly and returns it.
    pub fn seed_snapshot(&self, volume_id: &str, name: &str) -> Snapshot {
        let snapshot = Snapshot {
            name: name.to_owned(),
            volume_id: volume_id.to_owned(),
            snapshot_id: format!("snap-{}", Uuid::new_v4().simple()),
            size_gib: 0,
            start_time: unix_seconds(),
            description: String::new(),
            status: String::from("completed"),
        };
        lock(&self.state).snapshots.push(snapshot.clone());
        snapshot
    }

    /// Number of calls made to `operation`, including failed ones.
    #[must_use]
    pub fn calls(&self, operation: &str) -> usize {
        lock(&self.state)
            .calls
            .get(operation)
            .copied()
            .unwrap_or_default()
    }

    /// Number of `create_volume` calls.
    #[must_use]
    pub fn create_calls(&self) -> usize {
        self.calls("create_volume")
    }

    /// Number of `attach_volume` calls.
    #[must_use]
    pub fn attach_calls(&self) -> usize {
        self.calls("attach_volume")
    }

    /// Number of `detach_volume` calls.
    #[must_use]
    pub fn detach_calls(&self) -> usize {
        self.calls("detach_volume")
    }

    /// Number of `remove_volume` calls.
    #[must_use]
    pub fn remove_calls(&self) -> usize {
        self.calls("remove_volume")
    }

    /// Number of volumes currently held.
    #[must_use]
    pub fn volume_count(&self) -> usize {
        lock(&self.state).volumes.len()
    }

    /// Requests received by `create_volume`, in order.
    #[must_use]
    pub fn created_requests(&self) -> Vec<VolumeRequest> {
        lock(&self.state).created.clone()
    }

    fn new_volume(
        name: &str,
        size_gib: u64,
        volume_type: Option<&str>,
        iops: Option<u64>,
        zone: Option<&str>,
    ) -> Volume {
        let volume_id = format!("vol-{}", Uuid::new_v4().simple());
        Volume {
            name: name.to_owned(),
            network_name: format!("iqn.2016-01.sim:{volume_id}"),
            volume_id,
            availability_zone: zone.unwrap_or("sim-zone-a").to_owned(),
            status: String::from("available"),
            volume_type: volume_type.unwrap_or("standard").to_owned(),
            iops: iops.unwrap_or_default(),
            size_gib,
            attachments: Vec::new(),
        }
    }

    /// Counts the call and applies failure injection.
    fn enter(&self, operation: &'static str) -> Result<MutexGuard<'_, SimStorageState>> {
        let mut state = lock(&self.state);
        *state.calls.entry(operation).or_default() += 1;
        if state.failing.contains(operation) {
            return Err(VolplaneError::backend(
                format!("simulated {operation} failure"),
                Fields::new().with("provider", &self.name),
            ));
        }
        Ok(state)
    }

    fn list_volumes(&self, volume_id: &str, name: &str) -> Result<Vec<Volume>> {
        let state = self.enter("volumes")?;
        let now = Instant::now();
        Ok(state
            .volumes
            .iter()
            .filter(|volume| volume_id.is_empty() || volume.volume_id == volume_id)
            .filter(|volume| name.is_empty() || volume.name == name)
            .map(|volume| Volume {
                attachments: state.attachments_of(&volume.volume_id, now),
                ..volume.clone()
            })
            .collect())
    }

    fn create(&self, request: &VolumeRequest) -> Result<Volume> {
        let mut state = self.enter("create_volume")?;
        state.created.push(request.clone());
        let mut size_gib = request.size_gib;
        if let Some(source) = request.source_volume_id.as_deref() {
            let source_size = state.volume(source)?.size_gib;
            if size_gib == 0 {
                size_gib = source_size;
            }
        }
        if let Some(source) = request.source_snapshot_id.as_deref() {
            let snapshot = state
                .snapshots
                .iter()
                .find(|snapshot| snapshot.snapshot_id == source)
                .ok_or_else(|| VolplaneError::NotFound {
                    entity: "snapshot",
                    fields: Fields::new().with("snapshot_id", source),
                })?;
            if size_gib == 0 {
                size_gib = snapshot.size_gib;
            }
        }
        let volume = Self::new_volume(
            &request.name,
            size_gib,
            request.volume_type.as_deref(),
            request.iops,
            request.availability_zone.as_deref(),
        );
        state.volumes.push(volume.clone());
        Ok(volume)
    }

    fn remove(&self, volume_id: &str) -> Result<()> {
        let mut state = self.enter("remove_volume")?;
        state.volume(volume_id)?;
        if state
            .attachments
            .iter()
            .any(|attachment| attachment.volume_id == volume_id)
        {
            return Err(VolplaneError::backend(
                "volume is still attached",
                Fields::new().with("volume_id", volume_id),
            ));
        }
        state.volumes.retain(|volume| volume.volume_id != volume_id);
        Ok(())
    }

    fn attach(&self, volume_id: &str, instance_id: &str) -> Result<Vec<VolumeAttachment>> {
        let mut state = self.enter("attach_volume")?;
        state.volume(volume_id)?;
        let now = Instant::now();
        let existing = state
            .attachments
            .iter()
            .find(|attachment| attachment.volume_id == volume_id);
        match existing {
            Some(attachment) if attachment.instance_id == instance_id => {}
            Some(attachment) => {
                return Err(VolplaneError::backend(
                    "volume is attached to another instance",
                    Fields::new()
                        .with("volume_id", volume_id)
                        .with("instance_id", &attachment.instance_id),
                ));
            }
            None => {
                let visible_at = now + state.enumeration_delay;
                state.attachments.push(SimAttachment {
                    volume_id: volume_id.to_owned(),
                    instance_id: instance_id.to_owned(),
                    device_name: format!("/dev/disk/sim/{volume_id}"),
                    visible_at,
                });
            }
        }
        Ok(state.attachments_of(volume_id, now))
    }

    fn detach(&self, volume_id: &str, instance_id: &str) -> Result<()> {
        let mut state = self.enter("detach_volume")?;
        state.volume(volume_id)?;
        state.attachments.retain(|attachment| {
            attachment.volume_id != volume_id
                || (!instance_id.is_empty() && attachment.instance_id != instance_id)
        });
        Ok(())
    }

    fn snapshot(&self, name: &str, volume_id: &str, description: &str) -> Result<Vec<Snapshot>> {
        let mut state = self.enter("create_snapshot")?;
        let size_gib = state.volume(volume_id)?.size_gib;
        let snapshot = Snapshot {
            name: name.to_owned(),
            volume_id: volume_id.to_owned(),
            snapshot_id: format!("snap-{}", Uuid::new_v4().simple()),
            size_gib,
            start_time: unix_seconds(),
            description: description.to_owned(),
            status: String::from("completed"),
        };
        state.snapshots.push(snapshot.clone());
        Ok(vec![snapshot])
    }
}

fn unix_seconds() -> String {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs().to_string())
        .unwrap_or_default()
}

impl StorageDriver for SimStorageDriver {
    fn name(&self) -> &str {
        &self.name
    }

    fn instance(&self) -> DriverFuture<'_, Instance> {
        Box::pin(async move {
            drop(self.enter("instance")?);
            Ok(self.instance.clone())
        })
    }

    fn volume_mapping(&self) -> DriverFuture<'_, Vec<BlockDevice>> {
        Box::pin(async move {
            let state = self.enter("volume_mapping")?;
            let now = Instant::now();
            Ok(state
                .attachments
                .iter()
                .filter(|attachment| attachment.instance_id == self.instance.instance_id)
                .map(|attachment| {
                    let view = attachment.view(now);
                    BlockDevice {
                        provider_name: self.name.clone(),
                        instance_id: view.instance_id,
                        region: self.instance.region.clone(),
                        device_name: view.device_name,
                        volume_id: view.volume_id,
                        status: view.status,
                    }
                })
                .collect())
        })
    }

    fn volumes<'a>(&'a self, volume_id: &'a str, name: &'a str) -> DriverFuture<'a, Vec<Volume>> {
        Box::pin(async move { self.list_volumes(volume_id, name) })
    }

    fn volume_attachments<'a>(
        &'a self,
        volume_id: &'a str,
        instance_id: &'a str,
    ) -> DriverFuture<'a, Vec<VolumeAttachment>> {
        Box::pin(async move {
            let state = self.enter("volume_attachments")?;
            Ok(state
                .attachments_of(volume_id, Instant::now())
                .into_iter()
                .filter(|attachment| instance_id.is_empty() || attachment.instance_id == instance_id)
                .collect())
        })
    }

    fn create_volume<'a>(&'a self, request: &'a VolumeRequest) -> DriverFuture<'a, Volume> {
        Box::pin(async move { self.create(request) })
    }

    fn remove_volume<'a>(&'a self, volume_id: &'a str) -> DriverFuture<'a, ()> {
        Box::pin(async move { self.remove(volume_id) })
    }

    fn attach_volume<'a>(
        &'a self,
        _run_async: bool,
        volume_id: &'a str,
        instance_id: &'a str,
    ) -> DriverFuture<'a, Vec<VolumeAttachment>> {
        Box::pin(async move { self.attach(volume_id, instance_id) })
    }

    fn detach_volume<'a>(
        &'a self,
        _run_async: bool,
        volume_id: &'a str,
        instance_id: &'a str,
    ) -> DriverFuture<'a, ()> {
        Box::pin(async move { self.detach(volume_id, instance_id) })
    }

    fn snapshots<'a>(
        &'a self,
        volume_id: &'a str,
        snapshot_id: &'a str,
        name: &'a str,
    ) -> DriverFuture<'a, Vec<Snapshot>> {
        Box::pin(async move {
            let state = self.enter("snapshots")?;
            Ok(state
                .snapshots
                .iter()
                .filter(|snapshot| volume_id.is_empty() || snapshot.volume_id == volume_id)
                .filter(|snapshot| snapshot_id.is_empty() || snapshot.snapshot_id == snapshot_id)
                .filter(|snapshot| name.is_empty() || snapshot.name == name)
                .cloned()
                .collect())
        })
    }

    fn create_snapshot<'a>(
        &'a self,
        _run_async: bool,
        name: &'a str,
        volume_id: &'a str,
        description: &'a str,
    ) -> DriverFuture<'a, Vec<Snapshot>> {
        Box::pin(async move { self.snapshot(name, volume_id, description) })
    }

    fn remove_snapshot<'a>(&'a self, snapshot_id: &'a str) -> DriverFuture<'a, ()> {
        Box::pin(async move {
            let mut state = self.enter("remove_snapshot")?;
            let before = state.snapshots.len();
            state
                .snapshots
                .retain(|snapshot| snapshot.snapshot_id != snapshot_id);
            if state.snapshots.len() == before {
                return Err(VolplaneError::NotFound {
                    entity: "snapshot",
                    fields: Fields::new().with("snapshot_id", snapshot_id),
                });
            }
            Ok(())
        })
    }
}

#[derive(Debug, Default)]
struct SimOsState {
    fs_types: BTreeMap<String, String>,
    mounts: Vec<MountInfo>,
    format_count: usize,
    mount_calls: usize,
    unmount_calls: usize,
}

/// In-memory OS driver with a mount table and per-device file systems.
#[derive(Clone, Debug)]
pub struct SimOsDriver {
    name: String,
    state: Arc<Mutex<SimOsState>>,
}

impl Default for SimOsDriver {
    fn default() -> Self {
        Self::named("sim")
    }
}

impl SimOsDriver {
    /// Creates a driver registered as `name`.
    #[must_use]
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: Arc::new(Mutex::new(SimOsState::default())),
        }
    }

    /// Registry initializer handing out clones sharing this driver's state.
    #[must_use]
    pub fn init(&self) -> OsDriverInit {
        let driver = self.clone();
        Arc::new(move |_config: &Config| -> Result<Arc<dyn OsDriver>> {
            Ok(Arc::new(driver.clone()))
        })
    }

    /// Marks `device` as carrying a `fs_type` file system.
    pub fn set_fs_type(&self, device: &str, fs_type: &str) {
        lock(&self.state)
            .fs_types
            .insert(device.to_owned(), fs_type.to_owned());
    }

    /// File system currently on `device`.
    #[must_use]
    pub fn fs_type(&self, device: &str) -> Option<String> {
        lock(&self.state).fs_types.get(device).cloned()
    }

    /// Number of file systems actually written.
    #[must_use]
    pub fn format_count(&self) -> usize {
        lock(&self.state).format_count
    }

    /// Number of mount calls.
    #[must_use]
    pub fn mount_calls(&self) -> usize {
        lock(&self.state).mount_calls
    }

    /// Number of unmount calls.
    #[must_use]
    pub fn unmount_calls(&self) -> usize {
        lock(&self.state).unmount_calls
    }

    /// Current mount table.
    #[must_use]
    pub fn mount_table(&self) -> Vec<MountInfo> {
        lock(&self.state).mounts.clone()
    }
}

impl OsDriver for SimOsDriver {
    fn name(&self) -> &str {
        &self.name
    }

    fn mounts(&self, device: &str, mountpoint: &str) -> Result<Vec<MountInfo>> {
        Ok(lock(&self.state)
            .mounts
            .iter()
            .filter(|entry| device.is_empty() || entry.device == device)
            .filter(|entry| mountpoint.is_empty() || entry.mountpoint == mountpoint)
            .cloned()
            .collect())
    }

    fn mount(&self, device: &str, target: &Utf8Path, options: &str, _label: &str) -> Result<()> {
        let mut state = lock(&self.state);
        state.mount_calls += 1;
        let Some(fs_type) = state.fs_types.get(device).cloned() else {
            return Err(VolplaneError::backend(
                "wrong fs type, bad option, bad superblock",
                Fields::new().with("device", device),
            ));
        };
        if state.mounts.iter().any(|entry| entry.mountpoint == target.as_str()) {
            return Err(VolplaneError::backend(
                "mountpoint is busy",
                Fields::new().with("target", target),
            ));
        }
        state.mounts.push(MountInfo {
            device: device.to_owned(),
            mountpoint: target.to_string(),
            fs_type,
            options: if options.is_empty() {
                String::from("rw")
            } else {
                options.to_owned()
            },
        });
        Ok(())
    }

    fn unmount(&self, mountpoint: &Utf8Path) -> Result<()> {
        let mut state = lock(&self.state);
        state.unmount_calls += 1;
        let before = state.mounts.len();
        state
            .mounts
            .retain(|entry| entry.mountpoint != mountpoint.as_str());
        if state.mounts.len() == before {
            return Err(VolplaneError::backend(
                "not mounted",
                Fields::new().with("mountpoint", mountpoint),
            ));
        }
        Ok(())
    }

    fn format(&self, device: &str, fs_type: &str, overwrite: bool) -> Result<bool> {
        let mut state = lock(&self.state);
        if state.fs_types.contains_key(device) && !overwrite {
            return Ok(false);
        }
        state
            .fs_types
            .insert(device.to_owned(), fs_type.to_owned());
        state.format_count += 1;
        Ok(true)
    }
}

/// Global mutex used to serialise environment mutation in tests.
pub static ENV_LOCK: AsyncMutex<()> = AsyncMutex::const_new(());

/// Guard that holds the env mutex and cleans up variables on drop.
pub struct EnvGuard {
    previous: Vec<(String, Option<OsString>)>,
    _guard: AsyncMutexGuard<'static, ()>,
}

impl EnvGuard {
    /// Sets multiple environment variables while holding a global mutex.
    pub async fn set_vars(pairs: &[(&str, &str)]) -> Self {
        let guard = ENV_LOCK.lock().await;
        let mut previous = Vec::with_capacity(pairs.len());
        for (key, value) in pairs {
            let old = env::var_os(key);
            // SAFETY: Environment mutation is serialised by `ENV_LOCK`, preventing races.
            unsafe { env::set_var(key, value) };
            previous.push(((*key).to_owned(), old));
        }

        Self {
            previous,
            _guard: guard,
        }
    }
}

impl Drop for EnvGuard {
    fn drop(&mut self) {
        for (key, old) in self.previous.iter().rev() {
            // SAFETY: Environment mutation is serialised by holding `_guard`.
            unsafe {
                match old {
                    Some(val) => env::set_var(key, val),
                    None => env::remove_var(key),
                }
            }
        }
    }
}
