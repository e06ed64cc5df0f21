//! Binary entry point for the volplane CLI.

use std::io::{self, Write};
use std::process;

use camino::{Utf8Path, Utf8PathBuf};
use clap::Parser;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::prelude::*;

use volplane::{
    Config, ConfigError, CopySnapshotRequest, DriverManager, DriverRegistry, MountOptions,
    SnapshotRequest, VolplaneError, VolumeRequest,
};

mod cli;

use cli::{Cli, DeviceCommand, SnapshotCommand, VolumeCommand};

#[derive(Debug, Error)]
enum CliError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Volplane(#[from] VolplaneError),
    #[error("failed to write output: {0}")]
    Output(String),
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let exit_code = match run(cli).await {
        Ok(()) => 0,
        Err(err) => {
            report_error(&err);
            1
        }
    };

    process::exit(exit_code);
}

async fn run(cli: Cli) -> Result<(), CliError> {
    let config = Config::load_without_cli_args()?;
    config.validate()?;
    init_tracing(&config.log_level);

    let manager = DriverManager::new(&config, &DriverRegistry::with_builtin_drivers());
    if let Some(output) = dispatch(&manager, cli).await? {
        write_json(io::stdout(), &output)?;
    }
    Ok(())
}

fn init_tracing(log_level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
        .try_init()
        .ok();
}

async fn dispatch(manager: &DriverManager, cli: Cli) -> Result<Option<Value>, CliError> {
    match cli {
        Cli::Instance => render(&manager.storage().instances().await?),
        Cli::Device(command) => device(manager, command).await,
        Cli::Volume(command) => volume(manager, command).await,
        Cli::Snapshot(command) => snapshot(manager, command).await,
    }
}

async fn device(manager: &DriverManager, command: DeviceCommand) -> Result<Option<Value>, CliError> {
    match command {
        DeviceCommand::List => render(&manager.storage().volume_mapping().await?),
        DeviceCommand::Mounts { device, mountpoint } => render(
            &manager
                .os()
                .mounts(text(device.as_deref()), text(mountpoint.as_deref()))?,
        ),
        DeviceCommand::Format {
            device,
            fs_type,
            overwrite,
        } => render(&manager.os().format(&device, &fs_type, overwrite)?),
        DeviceCommand::Mount {
            device,
            target,
            options,
            label,
        } => {
            manager
                .os()
                .mount(&device, Utf8Path::new(&target), &options, &label)?;
            Ok(None)
        }
        DeviceCommand::Unmount { mountpoint } => {
            manager.os().unmount(Utf8Path::new(&mountpoint))?;
            Ok(None)
        }
    }
}

async fn volume(manager: &DriverManager, command: VolumeCommand) -> Result<Option<Value>, CliError> {
    let storage = manager.storage();
    match command {
        VolumeCommand::List(selector) => render(
            &storage
                .volumes(
                    text(selector.volume_id.as_deref()),
                    text(selector.name.as_deref()),
                )
                .await?,
        ),
        VolumeCommand::Create(args) => {
            let request = VolumeRequest::builder()
                .name(args.name)
                .size_gib(args.size_gib)
                .volume_type(args.volume_type)
                .iops(args.iops)
                .availability_zone(args.availability_zone)
                .source_volume_id(args.source_volume_id)
                .source_snapshot_id(args.source_snapshot_id)
                .run_async(args.run_async)
                .build()?;
            render(&storage.create_volume(&request).await?)
        }
        VolumeCommand::Remove { volume_id } => {
            storage.remove_volume(&volume_id).await?;
            Ok(None)
        }
        VolumeCommand::Attach(args) => render(
            &storage
                .attach_volume(
                    args.run_async,
                    &args.volume_id,
                    text(args.instance_id.as_deref()),
                )
                .await?,
        ),
        VolumeCommand::Detach(args) => {
            storage
                .detach_volume(
                    args.run_async,
                    &args.volume_id,
                    text(args.instance_id.as_deref()),
                )
                .await?;
            Ok(None)
        }
        VolumeCommand::Mount {
            selector,
            overwrite_fs,
            fs_type,
        } => {
            let options = MountOptions {
                overwrite_fs,
                fs_type,
            };
            let target = manager
                .volume()
                .mount(
                    text(selector.volume_id.as_deref()),
                    text(selector.name.as_deref()),
                    &options,
                )
                .await?;
            render(&target.into_string())
        }
        VolumeCommand::Unmount(selector) => {
            manager
                .volume()
                .unmount(
                    text(selector.volume_id.as_deref()),
                    text(selector.name.as_deref()),
                )
                .await?;
            Ok(None)
        }
        VolumeCommand::Path(selector) => {
            let path = manager
                .volume()
                .path(
                    text(selector.volume_id.as_deref()),
                    text(selector.name.as_deref()),
                )
                .await?;
            render(&path.map(Utf8PathBuf::into_string))
        }
    }
}

async fn snapshot(
    manager: &DriverManager,
    command: SnapshotCommand,
) -> Result<Option<Value>, CliError> {
    let storage = manager.storage();
    match command {
        SnapshotCommand::List {
            volume_id,
            snapshot_id,
            name,
        } => render(
            &storage
                .snapshots(
                    text(volume_id.as_deref()),
                    text(snapshot_id.as_deref()),
                    text(name.as_deref()),
                )
                .await?,
        ),
        SnapshotCommand::Create {
            volume_id,
            name,
            description,
            run_async,
        } => {
            let request = SnapshotRequest::new(name, volume_id, description, run_async)?;
            render(&storage.create_snapshot(&request).await?)
        }
        SnapshotCommand::Remove { snapshot_id } => {
            storage.remove_snapshot(&snapshot_id).await?;
            Ok(None)
        }
        SnapshotCommand::Copy {
            volume_id,
            snapshot_id,
            snapshot_name,
            target_name,
            target_region,
            run_async,
        } => {
            let request = CopySnapshotRequest {
                volume_id,
                snapshot_id,
                snapshot_name,
                target_name,
                target_region,
                run_async,
            };
            render(&storage.copy_snapshot(&request).await?)
        }
    }
}

fn text(value: Option<&str>) -> &str {
    value.unwrap_or_default()
}

fn render<T: Serialize>(value: &T) -> Result<Option<Value>, CliError> {
    serde_json::to_value(value)
        .map(Some)
        .map_err(|err| CliError::Output(err.to_string()))
}

fn write_json(mut target: impl Write, value: &Value) -> Result<(), CliError> {
    serde_json::to_writer_pretty(&mut target, value)
        .map_err(|err| CliError::Output(err.to_string()))?;
    writeln!(target).map_err(|err| CliError::Output(err.to_string()))
}

fn report_error(err: &CliError) {
    write_error(io::stderr(), err);
}

fn write_error(mut target: impl Write, err: &CliError) {
    writeln!(target, "{err}").ok();
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn volume_mount_parses_selector_and_options() {
        let cli = Cli::try_parse_from([
            "volplane",
            "volume",
            "mount",
            "--name",
            "data1",
            "--fs-type",
            "xfs",
        ])
        .unwrap_or_else(|err| panic!("parse: {err}"));
        assert!(matches!(
            cli,
            Cli::Volume(VolumeCommand::Mount { ref selector, overwrite_fs: false, ref fs_type })
                if selector.name.as_deref() == Some("data1") && fs_type.as_deref() == Some("xfs")
        ));
    }

    #[test]
    fn write_json_pretty_prints_with_trailing_newline() {
        let mut buf = Vec::new();
        write_json(&mut buf, &serde_json::json!([]))
            .unwrap_or_else(|err| panic!("write: {err}"));
        assert_eq!(String::from_utf8(buf).unwrap_or_default(), "[]\n");
    }

    #[test]
    fn write_error_renders_kind_and_fields() {
        let mut buf = Vec::new();
        let err = CliError::Volplane(VolplaneError::MultipleActiveBackends {
            operation: "create_volume",
            drivers: vec![String::from("a"), String::from("b")],
        });
        write_error(&mut buf, &err);
        let rendered = String::from_utf8(buf).unwrap_or_default();
        assert!(rendered.contains("create_volume"), "rendered: {rendered}");
    }
}
