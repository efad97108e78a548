//! Host tool seam for vaimage.
//!
//! This crate implements the execution layer the image engine sequences:
//! `ToolCommand` (an external utility invocation, on the host or inside a
//! `chroot`), the pluggable `Host` trait with the real `SystemHost` and the
//! simulated `MockHost`, `/proc/mounts` parsing, prerequisite checking, and the
//! synchronous filesystem helpers used by the customization passes.

pub mod command;
pub mod fsutil;
pub mod host;
pub mod mock;
pub mod mount;
pub mod prereq;
pub mod system;

pub use command::{CommandTarget, ToolCommand, ToolOutput};
pub use host::{probe, run_checked, Host};
pub use mock::MockHost;
pub use mount::{is_mounted, parse_mount_table, MountEntry};
pub use prereq::{check_block_device_prereqs, format_missing, is_root, MissingPrereq};
pub use system::SystemHost;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("runtime I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("required tool '{0}' not found on this host")]
    ToolNotFound(String),
    #[error("command '{command}' failed: {output}")]
    ToolFailed { command: String, output: String },
    #[error("failed to read mount table: {0}")]
    MountTable(String),
}
