use crate::command::{ToolCommand, ToolOutput};
use crate::host::Host;
use crate::mount::{parse_mount_table, MountEntry};
use crate::RuntimeError;
use std::io::{ErrorKind, Write as _};
use std::os::unix::fs::FileTypeExt;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::Duration;

/// The real machine: spawns utilities with `std::process` and reads kernel
/// state from `/proc` and `/dev`.
pub struct SystemHost {
    mounts_path: PathBuf,
}

impl Default for SystemHost {
    fn default() -> Self {
        Self {
            mounts_path: PathBuf::from("/proc/mounts"),
        }
    }
}

impl SystemHost {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_mounts_path(path: impl Into<PathBuf>) -> Self {
        Self {
            mounts_path: path.into(),
        }
    }
}

impl Host for SystemHost {
    fn find_tool(&self, program: &str) -> Option<PathBuf> {
        which::which(program).ok()
    }

    fn execute(&self, command: &ToolCommand) -> Result<ToolOutput, RuntimeError> {
        let mut cmd = Command::new(command.executable());
        cmd.args(command.argv())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .stdin(if command.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            });

        let mut child = cmd.spawn().map_err(|e| {
            if e.kind() == ErrorKind::NotFound {
                RuntimeError::ToolNotFound(command.executable().to_owned())
            } else {
                RuntimeError::Io(e)
            }
        })?;

        if let (Some(input), Some(mut pipe)) = (command.stdin.as_deref(), child.stdin.take()) {
            // The tool may exit before consuming everything; its status tells the story.
            if let Err(e) = pipe.write_all(input.as_bytes()) {
                if e.kind() != ErrorKind::BrokenPipe {
                    return Err(RuntimeError::Io(e));
                }
            }
        }

        let output = child.wait_with_output()?;
        Ok(ToolOutput {
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }

    fn mount_table(&self) -> Result<Vec<MountEntry>, RuntimeError> {
        let content = std::fs::read_to_string(&self.mounts_path).map_err(|e| {
            RuntimeError::MountTable(format!("{}: {e}", self.mounts_path.display()))
        })?;
        Ok(parse_mount_table(&content))
    }

    fn block_devices(&self, dir: &Path) -> Result<Vec<String>, RuntimeError> {
        let mut names = Vec::new();
        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            // udev usually publishes mapper nodes as symlinks to ../dm-N.
            let Ok(meta) = std::fs::metadata(entry.path()) else {
                continue;
            };
            if meta.file_type().is_block_device() {
                names.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        Ok(names)
    }

    fn settle(&self, delay: Duration) {
        std::thread::sleep(delay);
    }
}
