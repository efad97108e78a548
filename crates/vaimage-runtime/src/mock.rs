use crate::command::{ToolCommand, ToolOutput};
use crate::host::Host;
use crate::mount::MountEntry;
use crate::RuntimeError;
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub command: String,
    pub stdin: Option<String>,
}

#[derive(Default)]
struct MockState {
    bound: BTreeMap<String, PathBuf>,
    nodes: BTreeMap<String, Vec<String>>,
    mounts: Vec<MountEntry>,
    history: Vec<Invocation>,
    hidden_polls_left: u32,
    settles: u32,
}

/// In-memory host that records every invocation and simulates `losetup`,
/// `kpartx`, `mount` and `umount` state. Every other tool succeeds silently
/// unless told to fail.
pub struct MockHost {
    partitions: usize,
    hidden_polls: u32,
    failures: Vec<String>,
    missing: HashSet<String>,
    state: Mutex<MockState>,
}

impl Default for MockHost {
    fn default() -> Self {
        Self {
            partitions: 1,
            hidden_polls: 0,
            failures: Vec::new(),
            missing: HashSet::new(),
            state: Mutex::new(MockState::default()),
        }
    }
}

impl MockHost {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of partition mappings `kpartx -av` publishes. With four or more,
    /// numbering follows an msdos label with an extended partition: `p4` is
    /// published as well and the fourth data partition is `p5`.
    #[must_use]
    pub fn with_partitions(mut self, count: usize) -> Self {
        self.partitions = count;
        self
    }

    /// Number of `/dev/mapper` listings that come back empty after each
    /// `kpartx -av`, as if udev were slow.
    #[must_use]
    pub fn with_hidden_polls(mut self, polls: u32) -> Self {
        self.hidden_polls = polls;
        self
    }

    /// Fail every command whose command line starts with `prefix`.
    #[must_use]
    pub fn fail_on(mut self, prefix: impl Into<String>) -> Self {
        self.failures.push(prefix.into());
        self
    }

    #[must_use]
    pub fn without_tool(mut self, program: impl Into<String>) -> Self {
        self.missing.insert(program.into());
        self
    }

    /// Pretend `source` is already mounted on `target`.
    #[must_use]
    pub fn with_mount(self, source: impl Into<PathBuf>, target: impl Into<PathBuf>) -> Self {
        self.lock().mounts.push(MountEntry {
            source: source.into(),
            target: target.into(),
        });
        self
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn history(&self) -> Vec<String> {
        self.lock()
            .history
            .iter()
            .map(|i| i.command.clone())
            .collect()
    }

    pub fn invocations(&self) -> Vec<Invocation> {
        self.lock().history.clone()
    }

    /// Recorded command lines for one executable.
    pub fn commands_for(&self, program: &str) -> Vec<String> {
        self.history()
            .into_iter()
            .filter(|c| c == program || c.starts_with(&format!("{program} ")))
            .collect()
    }

    pub fn mounts(&self) -> Vec<MountEntry> {
        self.lock().mounts.clone()
    }

    pub fn bound_devices(&self) -> Vec<String> {
        self.lock().bound.keys().cloned().collect()
    }

    pub fn mapper_nodes(&self) -> Vec<String> {
        self.lock().nodes.values().flatten().cloned().collect()
    }

    pub fn settle_count(&self) -> u32 {
        self.lock().settles
    }

    fn partition_numbers(&self) -> Vec<usize> {
        let mut numbers: Vec<usize> = (1..).filter(|n| *n != 4).take(self.partitions).collect();
        if self.partitions >= 4 {
            numbers.push(4);
        }
        numbers
    }

    fn simulate(&self, state: &mut MockState, command: &ToolCommand) -> ToolOutput {
        let args: Vec<&str> = command.args.iter().map(String::as_str).collect();
        match (command.program.as_str(), args.as_slice()) {
            ("losetup", ["-f"]) => {
                let free = (0..)
                    .map(|n| format!("/dev/loop{n}"))
                    .find(|d| !state.bound.contains_key(d))
                    .unwrap_or_default();
                ok(format!("{free}\n"))
            }
            ("losetup", ["-d", dev]) => match state.bound.remove(*dev) {
                Some(_) => ok(String::new()),
                None => failed(format!("losetup: {dev}: detach failed: No such device")),
            },
            ("losetup", [dev, image]) => {
                if state.bound.contains_key(*dev) {
                    failed(format!("losetup: {dev}: failed to set up loop device: Device or resource busy"))
                } else {
                    state.bound.insert((*dev).to_owned(), PathBuf::from(image));
                    ok(String::new())
                }
            }
            ("kpartx", ["-av", dev]) => {
                if !state.bound.contains_key(*dev) {
                    return failed(format!("kpartx: {dev}: not a loop device"));
                }
                let base = Path::new(dev)
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default();
                let names: Vec<String> = self
                    .partition_numbers()
                    .into_iter()
                    .map(|n| format!("{base}p{n}"))
                    .collect();
                let report = names
                    .iter()
                    .map(|n| format!("add map {n} (253:0): 0 2048 linear {dev} 2048\n"))
                    .collect();
                state.nodes.insert((*dev).to_owned(), names);
                state.hidden_polls_left = self.hidden_polls;
                ok(report)
            }
            ("kpartx", ["-d", dev]) => {
                state.nodes.remove(*dev);
                ok(String::new())
            }
            ("mount", [.., source, target]) => {
                state.mounts.push(MountEntry {
                    source: PathBuf::from(source),
                    target: PathBuf::from(target),
                });
                ok(String::new())
            }
            ("umount", [.., target]) => {
                let target = Path::new(target);
                match state.mounts.iter().rposition(|m| m.target == target) {
                    Some(pos) => {
                        state.mounts.remove(pos);
                        ok(String::new())
                    }
                    None => failed(format!("umount: {}: not mounted", target.display())),
                }
            }
            _ => ok(String::new()),
        }
    }
}

fn ok(stdout: String) -> ToolOutput {
    ToolOutput {
        code: Some(0),
        stdout,
        stderr: String::new(),
    }
}

fn failed(stderr: String) -> ToolOutput {
    ToolOutput {
        code: Some(1),
        stdout: String::new(),
        stderr,
    }
}

impl Host for MockHost {
    fn find_tool(&self, program: &str) -> Option<PathBuf> {
        if self.missing.contains(program) {
            None
        } else {
            Some(PathBuf::from("/usr/sbin").join(program))
        }
    }

    fn execute(&self, command: &ToolCommand) -> Result<ToolOutput, RuntimeError> {
        let line = command.to_string();
        let mut state = self.lock();
        state.history.push(Invocation {
            command: line.clone(),
            stdin: command.stdin.clone(),
        });

        if self.missing.contains(command.executable()) {
            return Err(RuntimeError::ToolNotFound(command.executable().to_owned()));
        }
        if self.failures.iter().any(|prefix| line.starts_with(prefix.as_str())) {
            return Ok(failed(format!("{line}: simulated failure")));
        }
        if matches!(command.target, crate::CommandTarget::Chroot(_)) {
            return Ok(ok(String::new()));
        }
        Ok(self.simulate(&mut state, command))
    }

    fn mount_table(&self) -> Result<Vec<MountEntry>, RuntimeError> {
        Ok(self.mounts())
    }

    fn block_devices(&self, _dir: &Path) -> Result<Vec<String>, RuntimeError> {
        let mut state = self.lock();
        if state.hidden_polls_left > 0 {
            state.hidden_polls_left -= 1;
            return Ok(Vec::new());
        }
        Ok(state.nodes.values().flatten().cloned().collect())
    }

    fn settle(&self, _delay: Duration) {
        self.lock().settles += 1;
    }
}
