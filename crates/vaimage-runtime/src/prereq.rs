use crate::host::Host;
use std::fmt;

/// A missing prerequisite with actionable install instructions.
#[derive(Debug)]
pub struct MissingPrereq {
    pub name: &'static str,
    pub purpose: &'static str,
    pub install_hint: &'static str,
}

impl fmt::Display for MissingPrereq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "  - {}: {} (install: {})",
            self.name, self.purpose, self.install_hint
        )
    }
}

const UTIL_LINUX: &str =
    "part of util-linux (zypper install util-linux | apt install util-linux | dnf install util-linux)";

const BLOCK_DEVICE_TOOLS: &[(&str, &str, &str)] = &[
    ("losetup", "loop device binding", UTIL_LINUX),
    (
        "kpartx",
        "partition mappings for loop devices",
        "zypper install kpartx | apt install kpartx | dnf install kpartx",
    ),
    ("fdisk", "partition table creation", UTIL_LINUX),
    ("mkfs", "filesystem creation", UTIL_LINUX),
    ("mkswap", "swap area creation", UTIL_LINUX),
    ("mount", "mounting partitions", UTIL_LINUX),
    ("umount", "unmounting partitions", UTIL_LINUX),
    (
        "chroot",
        "running package and service tools inside the image",
        "part of coreutils (usually pre-installed)",
    ),
];

/// Check every external tool the block-device binder relies on.
/// Returns a list of missing items. Empty list means all prerequisites are met.
pub fn check_block_device_prereqs(host: &dyn Host) -> Vec<MissingPrereq> {
    BLOCK_DEVICE_TOOLS
        .iter()
        .filter(|(name, _, _)| host.find_tool(name).is_none())
        .map(|&(name, purpose, install_hint)| MissingPrereq {
            name,
            purpose,
            install_hint,
        })
        .collect()
}

/// Safe wrapper around libc::geteuid().
#[allow(unsafe_code)]
fn effective_uid() -> u32 {
    // SAFETY: geteuid() takes no arguments and cannot fail.
    unsafe { libc::geteuid() }
}

/// Loop devices, device-mapper and mount all need root.
pub fn is_root() -> bool {
    effective_uid() == 0
}

/// Format a list of missing prerequisites into a user-friendly error message.
pub fn format_missing(missing: &[MissingPrereq]) -> String {
    use std::fmt::Write as _;
    let mut msg = String::from("missing prerequisites:\n");
    for m in missing {
        let _ = writeln!(msg, "{m}");
    }
    msg.push_str("\nvaimage requires these tools to build disk images.");
    msg
}
