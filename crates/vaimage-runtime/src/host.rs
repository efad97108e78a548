use crate::command::{ToolCommand, ToolOutput};
use crate::mount::MountEntry;
use crate::RuntimeError;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

/// Everything the image engine needs from the machine it runs on.
///
/// `SystemHost` talks to the real kernel and utilities; `MockHost` simulates
/// loop devices, device-mapper nodes and the mount table in memory.
pub trait Host: Send + Sync {
    fn find_tool(&self, program: &str) -> Option<PathBuf>;

    /// Run a command to completion. A non-zero exit is reported through
    /// `ToolOutput`; only a failure to start the process is an error.
    fn execute(&self, command: &ToolCommand) -> Result<ToolOutput, RuntimeError>;

    fn mount_table(&self) -> Result<Vec<MountEntry>, RuntimeError>;

    /// Names of the block-special files directly inside `dir`.
    fn block_devices(&self, dir: &Path) -> Result<Vec<String>, RuntimeError>;

    fn settle(&self, delay: Duration);
}

/// Run a command and turn a non-zero exit into `ToolFailed`.
pub fn run_checked(host: &dyn Host, command: &ToolCommand) -> Result<ToolOutput, RuntimeError> {
    debug!("running: {command}");
    let output = host.execute(command)?;
    if output.success() {
        Ok(output)
    } else {
        Err(RuntimeError::ToolFailed {
            command: command.to_string(),
            output: output.combined(),
        })
    }
}

/// Run a command whose exit status is the answer to a question.
pub fn probe(host: &dyn Host, command: &ToolCommand) -> Result<bool, RuntimeError> {
    debug!("probing: {command}");
    Ok(host.execute(command)?.success())
}
