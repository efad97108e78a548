pub mod build;
pub mod completions;
pub mod customize;
pub mod doctor;
pub mod topologies;

use indicatif::{ProgressBar, ProgressStyle};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use vaimage_core::{CoreError, ErrorKind};
use vaimage_runtime::{check_block_device_prereqs, format_missing, Host, MockHost, SystemHost};
use vaimage_schema::SchemaError;

pub const EXIT_SUCCESS: u8 = 0;
pub const EXIT_FAILURE: u8 = 1;
pub const EXIT_CONFIG_ERROR: u8 = 2;
pub const EXIT_DEVICE_ERROR: u8 = 3;
pub const EXIT_TEARDOWN_ERROR: u8 = 4;

/// A failed command: the message for stderr and the process exit code.
#[derive(Debug)]
pub struct Failure {
    pub code: u8,
    pub message: String,
}

impl Failure {
    pub fn new(code: u8, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl From<CoreError> for Failure {
    fn from(e: CoreError) -> Self {
        Self::new(exit_code(e.kind()), e.to_string())
    }
}

impl From<SchemaError> for Failure {
    fn from(e: SchemaError) -> Self {
        CoreError::from(e).into()
    }
}

impl From<String> for Failure {
    fn from(message: String) -> Self {
        Self::new(EXIT_FAILURE, message)
    }
}

pub fn exit_code(kind: ErrorKind) -> u8 {
    match kind {
        ErrorKind::ConfigMismatch | ErrorKind::ParseFailure => EXIT_CONFIG_ERROR,
        ErrorKind::DeviceFailure | ErrorKind::ToolNotFound => EXIT_DEVICE_ERROR,
        ErrorKind::Teardown => EXIT_TEARDOWN_ERROR,
        ErrorKind::IoFailure | ErrorKind::Interrupted => EXIT_FAILURE,
    }
}

/// Refuse to touch block devices when a required host tool is missing.
pub fn require_host_tools(host: &dyn Host) -> Result<(), Failure> {
    let missing = check_block_device_prereqs(host);
    if missing.is_empty() {
        return Ok(());
    }
    Err(Failure::new(
        exit_code(ErrorKind::ToolNotFound),
        format_missing(&missing),
    ))
}

/// The host tool seam to build against: the real machine, or a simulation
/// that records invocations without touching any device.
pub enum HostChoice {
    System(Arc<SystemHost>),
    Simulated(Arc<MockHost>),
}

impl HostChoice {
    pub fn new(simulate: bool) -> Self {
        if simulate {
            Self::Simulated(Arc::new(MockHost::new()))
        } else {
            Self::System(Arc::new(SystemHost::new()))
        }
    }

    pub fn host(&self) -> Arc<dyn Host> {
        match self {
            Self::System(h) => h.clone(),
            Self::Simulated(h) => h.clone(),
        }
    }

    /// Command lines recorded by a simulated host.
    pub fn recorded(&self) -> Option<Vec<String>> {
        match self {
            Self::System(_) => None,
            Self::Simulated(h) => Some(h.history()),
        }
    }
}

pub fn json_pretty(value: &impl serde::Serialize) -> Result<String, String> {
    serde_json::to_string_pretty(value).map_err(|e| format!("JSON serialization failed: {e}"))
}

pub fn print_recorded(choice: &HostChoice) {
    if let Some(commands) = choice.recorded() {
        println!("simulated commands:");
        for command in commands {
            println!("  {command}");
        }
    }
}

pub fn spinner(msg: &str) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    pb.set_style(
        ProgressStyle::with_template("{spinner:.cyan} {msg}")
            .expect("valid template")
            .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]),
    );
    pb.set_message(msg.to_owned());
    pb.enable_steady_tick(Duration::from_millis(80));
    pb
}

pub fn spin_ok(pb: &ProgressBar, msg: &str) {
    pb.set_style(ProgressStyle::with_template("{msg}").expect("valid template"));
    pb.finish_with_message(format!("✓ {msg}"));
}

pub fn spin_fail(pb: &ProgressBar, msg: &str) {
    pb.set_style(ProgressStyle::with_template("{msg}").expect("valid template"));
    pb.finish_with_message(format!("✗ {msg}"));
}

/// Run `work` under a spinner unless JSON output was requested.
pub fn with_spinner<T>(
    json: bool,
    message: &str,
    done: &str,
    failed: &str,
    work: impl FnOnce() -> Result<T, CoreError>,
) -> Result<T, CoreError> {
    let pb = if json { None } else { Some(spinner(message)) };
    let result = work();
    if let Some(pb) = &pb {
        match &result {
            Ok(_) => spin_ok(pb, done),
            Err(_) => spin_fail(pb, failed),
        }
    }
    result
}
