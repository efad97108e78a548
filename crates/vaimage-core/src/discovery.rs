use crate::CoreError;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;
use vaimage_runtime::{run_checked, Host, ToolCommand};

/// Directory where device-mapper publishes partition nodes.
pub const MAPPER_DIR: &str = "/dev/mapper";

/// Partition slot taken by the extended partition of an msdos label.
const EXTENDED_SLOT: u32 = 4;

/// How long to wait for `kpartx` mappings to appear.
///
/// Mapper nodes are created asynchronously by udev; after the scan the binder
/// sleeps `settle` and lists `/dev/mapper`, repeating up to `max_polls` times
/// until every declared partition is visible.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiscoveryPolicy {
    pub settle: Duration,
    pub max_polls: u32,
}

impl Default for DiscoveryPolicy {
    fn default() -> Self {
        Self {
            settle: Duration::from_secs(1),
            max_polls: 5,
        }
    }
}

impl DiscoveryPolicy {
    pub fn new(settle: Duration, max_polls: u32) -> Self {
        Self {
            settle,
            max_polls: max_polls.max(1),
        }
    }

    pub fn from_millis(settle_ms: u64, max_polls: u32) -> Self {
        Self::new(Duration::from_millis(settle_ms), max_polls)
    }
}

/// Partition number of a mapper node named `<loop>p<N>`.
pub fn partition_number(node: &str, loop_name: &str) -> Option<u32> {
    node.strip_prefix(loop_name)?.strip_prefix('p')?.parse().ok()
}

/// Create the partition mappings of `loop_device` and return their nodes in
/// partition order, extended slot excluded.
pub fn discover_mappers(
    host: &dyn Host,
    loop_device: &Path,
    expected: usize,
    policy: &DiscoveryPolicy,
) -> Result<Vec<PathBuf>, CoreError> {
    run_checked(host, &ToolCommand::new("kpartx").arg("-av").path_arg(loop_device))?;

    let loop_name = loop_device
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| CoreError::Device(format!("invalid loop device {}", loop_device.display())))?;

    let mut nodes = Vec::new();
    for poll in 1..=policy.max_polls.max(1) {
        host.settle(policy.settle);
        nodes = list_partition_nodes(host, &loop_name)?;
        if nodes.len() >= expected {
            break;
        }
        debug!(
            "{loop_name}: {} of {expected} mappings visible after poll {poll}",
            nodes.len()
        );
    }

    if nodes.is_empty() {
        return Err(CoreError::MappersNotFound(loop_device.to_path_buf()));
    }
    Ok(nodes)
}

fn list_partition_nodes(host: &dyn Host, loop_name: &str) -> Result<Vec<PathBuf>, CoreError> {
    let dir = Path::new(MAPPER_DIR);
    let mut numbered: Vec<(u32, String)> = host
        .block_devices(dir)?
        .into_iter()
        .filter_map(|name| partition_number(&name, loop_name).map(|n| (n, name)))
        .filter(|(n, _)| *n != EXTENDED_SLOT)
        .collect();
    numbered.sort_by_key(|(n, _)| *n);
    Ok(numbered.into_iter().map(|(_, name)| dir.join(name)).collect())
}
