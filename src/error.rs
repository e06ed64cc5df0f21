//! Error types shared by every manager layer.
//!
//! Errors carry ordered key/value context ([`Fields`]) so a message that has
//! crossed several manager boundaries still names the provider, volume and
//! instance involved. Wrapping never hides the root cause: [`VolplaneError::kind`]
//! looks through [`VolplaneError::Backend`] wrappers.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use thiserror::Error;

use crate::config::ConfigError;

/// Result alias used across the crate.
pub type Result<T, E = VolplaneError> = std::result::Result<T, E>;

/// Ordered diagnostic context attached to an error.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Fields(BTreeMap<&'static str, String>);

impl Fields {
    /// Creates an empty field set.
    #[must_use]
    pub const fn new() -> Self {
        Self(BTreeMap::new())
    }

    /// Adds a field, replacing any previous value stored under `key`.
    #[must_use]
    pub fn with(mut self, key: &'static str, value: impl fmt::Display) -> Self {
        self.insert(key, value);
        self
    }

    /// Inserts a field in place.
    pub fn insert(&mut self, key: &'static str, value: impl fmt::Display) {
        self.0.insert(key, value.to_string());
    }

    /// Returns the value stored under `key`.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    /// Returns `true` when no fields are set.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for Fields {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            return Ok(());
        }
        f.write_str(" (")?;
        for (index, (key, value)) in self.0.iter().enumerate() {
            if index > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{key}={value}")?;
        }
        f.write_str(")")
    }
}

/// Renders an optional inner error as a `: cause` suffix.
struct Cause<'a>(Option<&'a VolplaneError>);

impl fmt::Display for Cause<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            Some(inner) => write!(f, ": {inner}"),
            None => Ok(()),
        }
    }
}

/// Errors raised by drivers and managers.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum VolplaneError {
    /// Raised when the caller supplied insufficient identifying information.
    #[error("invalid argument: {message}{fields}")]
    InvalidArgument {
        /// Description of what is missing or malformed.
        message: String,
        /// Diagnostic context.
        fields: Fields,
    },
    /// Raised when a lookup that required one match found none.
    #[error("no {entity} found{fields}")]
    NotFound {
        /// Kind of entity looked up (for example `volume`).
        entity: &'static str,
        /// Diagnostic context.
        fields: Fields,
    },
    /// Raised when a lookup that required one match found several.
    #[error("{count} {entity} matches where exactly one was expected{fields}")]
    AmbiguousResult {
        /// Kind of entity looked up.
        entity: &'static str,
        /// Number of matches returned.
        count: usize,
        /// Diagnostic context.
        fields: Fields,
    },
    /// Raised when instance or backend identity cannot be established.
    #[error("discovery failed: {message}{fields}{}", Cause(.source.as_deref()))]
    Discovery {
        /// Description of the failed discovery step.
        message: String,
        /// Diagnostic context.
        fields: Fields,
        /// Underlying driver error.
        #[source]
        source: Option<Box<VolplaneError>>,
    },
    /// Raised when a mutating call finds more than one active storage backend.
    #[error(
        "{operation} requires exactly one active storage backend but {} are active: {}; restrict storage_drivers",
        .drivers.len(),
        .drivers.join(", ")
    )]
    MultipleActiveBackends {
        /// Operation that was refused.
        operation: &'static str,
        /// Names of the active backends.
        drivers: Vec<String>,
    },
    /// Raised when a mutating call finds no active storage backend.
    #[error("{operation} requires an active storage backend but none is configured")]
    NoActiveBackend {
        /// Operation that was refused.
        operation: &'static str,
    },
    /// Raised when no OS driver is active.
    #[error("no OS driver is active")]
    NoOsDriver,
    /// Raised when no volume driver is active.
    #[error("no volume driver is active")]
    NoVolumeDriver,
    /// Raised when an attached device does not appear on the host in time.
    #[error("timed out after {timeout:?} waiting for volume {volume_id} to appear on the host")]
    AttachTimeout {
        /// Volume whose device never appeared.
        volume_id: String,
        /// Bound that elapsed.
        timeout: Duration,
    },
    /// Raised when a driver lacks a capability.
    #[error("{driver} does not implement {operation}")]
    NotImplemented {
        /// Driver name.
        driver: String,
        /// Operation that is unsupported.
        operation: &'static str,
    },
    /// Wrapper for lower-level failures with added context.
    #[error("{message}{fields}{}", Cause(.source.as_deref()))]
    Backend {
        /// Description of the failed step.
        message: String,
        /// Diagnostic context.
        fields: Fields,
        /// Wrapped error, if any.
        #[source]
        source: Option<Box<VolplaneError>>,
    },
    /// Raised when configuration is incomplete or invalid.
    #[error("configuration error: {0}")]
    Config(String),
    /// Raised when a host file system operation fails.
    #[error("failed to access {path}: {message}")]
    Io {
        /// Path that could not be accessed.
        path: String,
        /// Human-readable error message.
        message: String,
    },
    /// Raised when a helper program cannot be started.
    #[error("failed to start {program}: {message}")]
    Spawn {
        /// Program that failed to start.
        program: String,
        /// Human-readable error message.
        message: String,
    },
    /// Raised when a helper program exits unsuccessfully.
    #[error("{program} exited with status {status_text}: {stderr}")]
    CommandFailure {
        /// Program that failed.
        program: String,
        /// Exit status reported by the OS.
        status: Option<i32>,
        /// Human readable representation of the exit status.
        status_text: String,
        /// Stderr captured from the command.
        stderr: String,
    },
}

/// Coarse classification of a [`VolplaneError`], stable across wrapping.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum ErrorKind {
    /// See [`VolplaneError::InvalidArgument`].
    InvalidArgument,
    /// See [`VolplaneError::NotFound`].
    NotFound,
    /// See [`VolplaneError::AmbiguousResult`].
    AmbiguousResult,
    /// See [`VolplaneError::Discovery`].
    Discovery,
    /// See [`VolplaneError::MultipleActiveBackends`].
    MultipleActiveBackends,
    /// See [`VolplaneError::NoActiveBackend`].
    NoActiveBackend,
    /// See [`VolplaneError::NoOsDriver`].
    NoOsDriver,
    /// See [`VolplaneError::NoVolumeDriver`].
    NoVolumeDriver,
    /// See [`VolplaneError::AttachTimeout`].
    AttachTimeout,
    /// See [`VolplaneError::NotImplemented`].
    NotImplemented,
    /// A [`VolplaneError::Backend`] wrapper with no typed cause.
    Backend,
    /// See [`VolplaneError::Config`].
    Config,
    /// See [`VolplaneError::Io`].
    Io,
    /// See [`VolplaneError::Spawn`] and [`VolplaneError::CommandFailure`].
    Command,
}

impl VolplaneError {
    /// Builds a [`VolplaneError::InvalidArgument`].
    #[must_use]
    pub fn invalid_argument(message: impl Into<String>, fields: Fields) -> Self {
        Self::InvalidArgument {
            message: message.into(),
            fields,
        }
    }

    /// Builds a [`VolplaneError::Backend`] without an inner cause.
    #[must_use]
    pub fn backend(message: impl Into<String>, fields: Fields) -> Self {
        Self::Backend {
            message: message.into(),
            fields,
            source: None,
        }
    }

    /// Wraps `self` with a message and diagnostic fields.
    #[must_use]
    pub fn context(self, message: impl Into<String>, fields: Fields) -> Self {
        Self::Backend {
            message: message.into(),
            fields,
            source: Some(Box::new(self)),
        }
    }

    /// Returns the classification of the root cause.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidArgument { .. } => ErrorKind::InvalidArgument,
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::AmbiguousResult { .. } => ErrorKind::AmbiguousResult,
            Self::Discovery { .. } => ErrorKind::Discovery,
            Self::MultipleActiveBackends { .. } => ErrorKind::MultipleActiveBackends,
            Self::NoActiveBackend { .. } => ErrorKind::NoActiveBackend,
            Self::NoOsDriver => ErrorKind::NoOsDriver,
            Self::NoVolumeDriver => ErrorKind::NoVolumeDriver,
            Self::AttachTimeout { .. } => ErrorKind::AttachTimeout,
            Self::NotImplemented { .. } => ErrorKind::NotImplemented,
            Self::Backend {
                source: Some(inner),
                ..
            } => inner.kind(),
            Self::Backend { source: None, .. } => ErrorKind::Backend,
            Self::Config(_) => ErrorKind::Config,
            Self::Io { .. } => ErrorKind::Io,
            Self::Spawn { .. } | Self::CommandFailure { .. } => ErrorKind::Command,
        }
    }
}

impl From<ConfigError> for VolplaneError {
    fn from(value: ConfigError) -> Self {
        Self::Config(value.to_string())
    }
}

/// Returns the single item in `items`.
///
/// # Errors
///
/// Returns [`VolplaneError::NotFound`] for an empty list and
/// [`VolplaneError::AmbiguousResult`] when more than one item is present; the first
/// match is never picked silently.
pub fn exactly_one<T>(items: Vec<T>, entity: &'static str, fields: Fields) -> Result<T> {
    let count = items.len();
    let mut iter = items.into_iter();
    match (iter.next(), count) {
        (Some(item), 1) => Ok(item),
        (None, _) => Err(VolplaneError::NotFound { entity, fields }),
        (Some(_), _) => Err(VolplaneError::AmbiguousResult {
            entity,
            count,
            fields,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fields_render_in_key_order() {
        let fields = Fields::new()
            .with("volume_id", "vol-1")
            .with("provider", "sim");
        assert_eq!(fields.to_string(), " (provider=sim, volume_id=vol-1)");
    }

    #[test]
    fn empty_fields_render_nothing() {
        let err = VolplaneError::NotFound {
            entity: "volume",
            fields: Fields::new(),
        };
        assert_eq!(err.to_string(), "no volume found");
    }

    #[test]
    fn context_accumulates_messages() {
        let err = VolplaneError::NotImplemented {
            driver: String::from("sim"),
            operation: "copy_snapshot",
        }
        .context(
            "failed to copy snapshot",
            Fields::new().with("provider", "sim"),
        );
        assert_eq!(
            err.to_string(),
            "failed to copy snapshot (provider=sim): sim does not implement copy_snapshot"
        );
    }

    #[test]
    fn kind_sees_through_wrappers() {
        let err = VolplaneError::AttachTimeout {
            volume_id: String::from("vol-1"),
            timeout: Duration::from_secs(10),
        }
        .context("mount failed", Fields::new())
        .context("docker driver", Fields::new());
        assert_eq!(err.kind(), ErrorKind::AttachTimeout);
        assert_eq!(
            VolplaneError::backend("plain", Fields::new()).kind(),
            ErrorKind::Backend
        );
    }

    #[test]
    fn exactly_one_rejects_empty_and_ambiguous() {
        let none = exactly_one(Vec::<u8>::new(), "volume", Fields::new());
        assert!(matches!(none, Err(VolplaneError::NotFound { entity: "volume", .. })));

        let many = exactly_one(vec![1, 2], "volume", Fields::new());
        assert!(matches!(
            many,
            Err(VolplaneError::AmbiguousResult { count: 2, .. })
        ));

        assert_eq!(exactly_one(vec![7], "volume", Fields::new()), Ok(7));
    }
}
