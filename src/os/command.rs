//! Command runner abstraction used by host drivers.

use std::ffi::OsString;
use std::process::Command;

use crate::error::{Result, VolplaneError};

/// Result of running an external command.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CommandOutput {
    /// Exit code reported by the process, if available.
    pub code: Option<i32>,
    /// Captured standard output.
    pub stdout: String,
    /// Captured standard error.
    pub stderr: String,
}

impl CommandOutput {
    /// Returns `true` when the exit code equals zero.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self.code, Some(0))
    }

    /// Converts a non-zero exit into [`VolplaneError::CommandFailure`].
    ///
    /// # Errors
    ///
    /// Returns [`VolplaneError::CommandFailure`] unless the command succeeded.
    pub fn into_success(self, program: &str) -> Result<Self> {
        if self.is_success() {
            return Ok(self);
        }
        Err(VolplaneError::CommandFailure {
            program: program.to_owned(),
            status: self.code,
            status_text: self
                .code
                .map_or_else(|| String::from("unknown"), |code| code.to_string()),
            stderr: self.stderr.trim().to_owned(),
        })
    }
}

/// Abstraction over command execution to support fakes in tests.
pub trait CommandRunner: Send + Sync {
    /// Runs `program` with the given arguments, capturing stdout and stderr.
    ///
    /// # Errors
    ///
    /// Returns [`VolplaneError::Spawn`] if the command cannot be started.
    fn run(&self, program: &str, args: &[OsString]) -> Result<CommandOutput>;
}

/// Real command runner that shells out to the host operating system.
#[derive(Clone, Debug, Default)]
pub struct ProcessCommandRunner;

impl CommandRunner for ProcessCommandRunner {
    fn run(&self, program: &str, args: &[OsString]) -> Result<CommandOutput> {
        let output = Command::new(program)
            .args(args)
            .output()
            .map_err(|err| VolplaneError::Spawn {
                program: program.to_owned(),
                message: err.to_string(),
            })?;

        Ok(CommandOutput {
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn failed_exit_becomes_command_failure() {
        let output = CommandOutput {
            code: Some(32),
            stdout: String::new(),
            stderr: String::from("mount: wrong fs type\n"),
        };
        let err = output
            .into_success("mount")
            .expect_err("non-zero exit should fail");
        assert_eq!(err.kind(), ErrorKind::Command);
        assert_eq!(err.to_string(), "mount exited with status 32: mount: wrong fs type");
    }

    #[test]
    fn missing_exit_code_is_reported_as_unknown() {
        let output = CommandOutput {
            code: None,
            stdout: String::new(),
            stderr: String::new(),
        };
        let err = output.into_success("umount").expect_err("signal should fail");
        assert!(err.to_string().contains("status unknown"));
    }

    #[test]
    fn spawn_failure_names_the_program() {
        let err = ProcessCommandRunner
            .run("volplane-definitely-missing-binary", &[])
            .expect_err("missing binary should fail");
        assert!(matches!(err, VolplaneError::Spawn { ref program, .. } if program == "volplane-definitely-missing-binary"));
    }
}
