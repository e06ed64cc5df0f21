//! Linux OS driver backed by `/proc/self/mounts`, `blkid`, `mkfs`, `mount`
//! and `umount`.

use std::ffi::OsString;

use camino::{Utf8Path, Utf8PathBuf};
use cap_std::{ambient_authority, fs_utf8::Dir};
use tracing::debug;

use super::OsDriver;
use super::command::{CommandRunner, ProcessCommandRunner};
use crate::error::{Result, VolplaneError};
use crate::types::MountInfo;

/// Default location of the kernel mount table.
pub const DEFAULT_MOUNT_TABLE: &str = "/proc/self/mounts";

/// Registered name of the Linux OS driver.
pub const DRIVER_NAME: &str = "linux";

/// Exit status `blkid` uses when the probed device has no recognised tag.
const BLKID_NOT_FOUND: i32 = 2;

/// OS driver for Linux hosts.
#[derive(Clone, Debug)]
pub struct LinuxOsDriver<R = ProcessCommandRunner> {
    runner: R,
    mount_table: Utf8PathBuf,
}

impl LinuxOsDriver<ProcessCommandRunner> {
    /// Creates a driver that runs real host commands.
    #[must_use]
    pub fn new() -> Self {
        Self::with_runner(ProcessCommandRunner)
    }
}

impl Default for LinuxOsDriver<ProcessCommandRunner> {
    fn default() -> Self {
        Self::new()
    }
}

impl<R: CommandRunner> LinuxOsDriver<R> {
    /// Creates a driver that executes commands through `runner`.
    #[must_use]
    pub fn with_runner(runner: R) -> Self {
        Self {
            runner,
            mount_table: Utf8PathBuf::from(DEFAULT_MOUNT_TABLE),
        }
    }

    /// Reads mounts from `path` instead of the kernel mount table.
    #[must_use]
    pub fn with_mount_table(mut self, path: impl Into<Utf8PathBuf>) -> Self {
        self.mount_table = path.into();
        self
    }

    fn read_mount_table(&self) -> Result<Vec<MountInfo>> {
        let io_error = |err: std::io::Error| VolplaneError::Io {
            path: self.mount_table.to_string(),
            message: err.to_string(),
        };
        let parent = self.mount_table.parent().unwrap_or_else(|| Utf8Path::new("/"));
        let file_name = self.mount_table.file_name().ok_or_else(|| VolplaneError::Io {
            path: self.mount_table.to_string(),
            message: String::from("mount table path has no file name"),
        })?;
        let dir = Dir::open_ambient_dir(parent, ambient_authority()).map_err(io_error)?;
        let contents = dir.read_to_string(file_name).map_err(io_error)?;
        Ok(parse_mount_table(&contents))
    }

    fn run_checked(&self, program: &str, args: &[OsString]) -> Result<()> {
        debug!(program, args = ?args, "running host command");
        self.runner.run(program, args)?.into_success(program)?;
        Ok(())
    }

    /// Probes `device` and returns its file system type, if any.
    fn existing_fs_type(&self, device: &str) -> Result<Option<String>> {
        let program = "blkid";
        let args = [
            OsString::from("-o"),
            OsString::from("value"),
            OsString::from("-s"),
            OsString::from("TYPE"),
            OsString::from(device),
        ];
        let output = self.runner.run(program, &args)?;
        if output.code == Some(BLKID_NOT_FOUND) {
            return Ok(None);
        }
        let probed = output.into_success(program)?;
        let fs_type = probed.stdout.trim();
        Ok((!fs_type.is_empty()).then(|| fs_type.to_owned()))
    }
}

impl<R: CommandRunner> OsDriver for LinuxOsDriver<R> {
    fn name(&self) -> &str {
        DRIVER_NAME
    }

    fn mounts(&self, device: &str, mountpoint: &str) -> Result<Vec<MountInfo>> {
        let wanted_mountpoint = normalise_mountpoint(mountpoint);
        let entries = self.read_mount_table()?;
        Ok(entries
            .into_iter()
            .filter(|entry| device.is_empty() || same_device(&entry.device, device))
            .filter(|entry| {
                wanted_mountpoint.is_empty()
                    || normalise_mountpoint(&entry.mountpoint) == wanted_mountpoint
            })
            .collect())
    }

    fn mount(&self, device: &str, target: &Utf8Path, options: &str, label: &str) -> Result<()> {
        let mut args = Vec::new();
        let mut option_list: Vec<String> = options
            .split(',')
            .map(str::trim)
            .filter(|option| !option.is_empty())
            .map(str::to_owned)
            .collect();
        if !label.is_empty() {
            option_list.push(format!("context=\"{label}\""));
        }
        if !option_list.is_empty() {
            args.push(OsString::from("-o"));
            args.push(OsString::from(option_list.join(",")));
        }
        args.push(OsString::from(device));
        args.push(OsString::from(target.as_str()));
        self.run_checked("mount", &args)
    }

    fn unmount(&self, mountpoint: &Utf8Path) -> Result<()> {
        self.run_checked("umount", &[OsString::from(mountpoint.as_str())])
    }

    fn format(&self, device: &str, fs_type: &str, overwrite: bool) -> Result<bool> {
        let existing = self.existing_fs_type(device)?;
        if let Some(found) = existing.as_deref() {
            if !overwrite {
                debug!(device, existing = found, "skipping format of initialised device");
                return Ok(false);
            }
        }
        let mut args = Vec::new();
        if let Some(flag) = force_flag(fs_type) {
            args.push(OsString::from(flag));
        }
        args.push(OsString::from(device));
        self.run_checked(&format!("mkfs.{fs_type}"), &args)?;
        Ok(true)
    }
}

/// Flag that makes `mkfs.<fs_type>` proceed without prompting.
fn force_flag(fs_type: &str) -> Option<&'static str> {
    if fs_type.starts_with("ext") {
        Some("-F")
    } else if fs_type == "xfs" || fs_type == "btrfs" {
        Some("-f")
    } else {
        None
    }
}

fn normalise_mountpoint(path: &str) -> &str {
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() && path.starts_with('/') {
        "/"
    } else {
        trimmed
    }
}

fn same_device(entry: &str, wanted: &str) -> bool {
    if entry == wanted {
        return true;
    }
    // Devices are often referenced through symlinks such as /dev/disk/by-id.
    let resolve = |path: &str| Utf8Path::new(path).canonicalize_utf8().ok();
    match (resolve(entry), resolve(wanted)) {
        (Some(left), Some(right)) => left == right,
        _ => false,
    }
}

/// Parses the contents of a `/proc/<pid>/mounts` style table.
#[must_use]
pub fn parse_mount_table(contents: &str) -> Vec<MountInfo> {
    contents
        .lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let device = fields.next()?;
            let mountpoint = fields.next()?;
            let fs_type = fields.next()?;
            let options = fields.next().unwrap_or_default();
            Some(MountInfo {
                device: unescape_octal(device),
                mountpoint: unescape_octal(mountpoint),
                fs_type: unescape_octal(fs_type),
                options: options.to_owned(),
            })
        })
        .collect()
}

/// Decodes the `\NNN` octal escapes the kernel uses for whitespace.
fn unescape_octal(field: &str) -> String {
    let mut decoded = String::with_capacity(field.len());
    let mut chars = field.chars();
    while let Some(ch) = chars.next() {
        if ch == '\\' {
            let digits: String = chars.clone().take(3).collect();
            let is_octal = digits.len() == 3 && digits.chars().all(|d| ('0'..='7').contains(&d));
            if let Some(byte) = is_octal
                .then(|| u8::from_str_radix(&digits, 8).ok())
                .flatten()
            {
                decoded.push(char::from(byte));
                chars.nth(2);
                continue;
            }
        }
        decoded.push(ch);
    }
    decoded
}
