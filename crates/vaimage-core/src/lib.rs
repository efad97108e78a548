//! Core engine for building virtual-appliance disk images.
//!
//! This crate ties the schema and runtime layers together: `Image` binds a raw
//! image to a loop device, partitions, formats and mounts it according to a
//! `Topology`, and tears the stack down in reverse order; `customize` applies the
//! declarative platform passes to the mounted root; `build_image` sequences the
//! whole build around a caller-supplied `Rootfs` populator. Teardown is also
//! reachable from a signal handler through a process-wide release registry.

pub mod builder;
pub mod concurrency;
pub mod customize;
pub mod discovery;
pub mod image;

pub use builder::{build_image, customize_image, BuildOptions, BuildReport, Rootfs};
pub use concurrency::{shutdown_requested, ImageLock, InterruptGuard};
pub use customize::{customize, CustomizeReport, PassOutcome};
pub use discovery::DiscoveryPolicy;
pub use image::{make_bootable, Image, LoopDevice, MapperDevice};

use std::path::PathBuf;
use thiserror::Error;
use vaimage_runtime::RuntimeError;
use vaimage_schema::SchemaError;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("descriptor error: {0}")]
    Schema(#[from] SchemaError),
    #[error("{0}")]
    Runtime(#[from] RuntimeError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to {op} {}: {source}", path.display())]
    Fs {
        op: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("amount of partitions defined = {declared}, actual amount is {actual}")]
    PartitionMismatch { declared: usize, actual: usize },
    #[error("mappers not found for {}", .0.display())]
    MappersNotFound(PathBuf),
    #[error("device error: {0}")]
    Device(String),
    #[error("image {} is already bound to {}", image.display(), device.display())]
    AlreadyParsed { image: PathBuf, device: PathBuf },
    #[error("no partition of {} is mounted; parse the image first", .0.display())]
    NotParsed(PathBuf),
    #[error("configuration error: {0}")]
    Config(String),
    #[error("invalid pattern '{pattern}': {source}")]
    Pattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },
    #[error("interrupted by signal")]
    Interrupted,
    #[error("image teardown failed, block devices may still be bound: {0}")]
    TeardownFailed(Box<CoreError>),
    #[error("image {} is in use by another vaimage process", .0.display())]
    Locked(PathBuf),
}

/// Coarse classification of every [`CoreError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// A required external utility is absent from the search path.
    ToolNotFound,
    /// Declared configuration disagrees with observed state, or a descriptor
    /// uses a value the engine does not support.
    ConfigMismatch,
    IoFailure,
    /// A bind/format/mount/unmount/unbind step failed.
    DeviceFailure,
    /// Malformed descriptor or configuration document.
    ParseFailure,
    Interrupted,
    Teardown,
}

impl CoreError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Schema(SchemaError::Io(_)) | Self::Io(_) | Self::Fs { .. } => {
                ErrorKind::IoFailure
            }
            Self::Schema(e) if e.is_parse_failure() => ErrorKind::ParseFailure,
            Self::Schema(_) | Self::PartitionMismatch { .. } | Self::Config(_) | Self::Pattern { .. } => {
                ErrorKind::ConfigMismatch
            }
            Self::Runtime(RuntimeError::ToolNotFound(_)) => ErrorKind::ToolNotFound,
            Self::Runtime(RuntimeError::Io(_)) => ErrorKind::IoFailure,
            Self::Runtime(_)
            | Self::MappersNotFound(_)
            | Self::Device(_)
            | Self::AlreadyParsed { .. }
            | Self::NotParsed(_)
            | Self::Locked(_) => ErrorKind::DeviceFailure,
            Self::Interrupted => ErrorKind::Interrupted,
            Self::TeardownFailed(_) => ErrorKind::Teardown,
        }
    }

    pub(crate) fn fs(op: &'static str, path: impl Into<PathBuf>) -> impl FnOnce(std::io::Error) -> Self {
        let path = path.into();
        move |source| Self::Fs { op, path, source }
    }
}
