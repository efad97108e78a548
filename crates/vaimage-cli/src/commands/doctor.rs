use super::{Failure, EXIT_FAILURE, EXIT_SUCCESS};
use serde::Serialize;
use std::path::Path;
use vaimage_runtime::{check_block_device_prereqs, format_missing, is_root, SystemHost};

pub fn run(json_output: bool) -> Result<u8, Failure> {
    let mut checks: Vec<Check> = Vec::new();
    let mut all_pass = true;

    check_prereqs(&mut checks, &mut all_pass);

    if is_root() {
        checks.push(Check::pass("privileges", "Running as root"));
    } else {
        checks.push(Check::warn(
            "privileges",
            "Not running as root (build and customize need root)",
        ));
    }

    check_device_node(
        &mut checks,
        "loop_control",
        Path::new("/dev/loop-control"),
        "Loop device control",
    );
    check_device_node(
        &mut checks,
        "device_mapper",
        Path::new("/dev/mapper/control"),
        "Device-mapper control",
    );

    print_results(&checks, all_pass, json_output)
}

fn check_prereqs(checks: &mut Vec<Check>, all_pass: &mut bool) {
    let missing = check_block_device_prereqs(&SystemHost::new());
    if missing.is_empty() {
        checks.push(Check::pass("host_tools", "Host tool prerequisites satisfied"));
    } else {
        *all_pass = false;
        checks.push(Check::fail("host_tools", &format_missing(&missing)));
    }
}

fn check_device_node(checks: &mut Vec<Check>, name: &str, node: &Path, what: &str) {
    if node.exists() {
        checks.push(Check::pass(name, &format!("{what} {} present", node.display())));
    } else {
        checks.push(Check::warn(
            name,
            &format!("{what} {} missing (kernel module not loaded?)", node.display()),
        ));
    }
}

fn print_results(checks: &[Check], all_pass: bool, json_output: bool) -> Result<u8, Failure> {
    if json_output {
        let json = serde_json::json!({
            "healthy": all_pass,
            "checks": checks,
        });
        println!("{}", super::json_pretty(&json)?);
    } else {
        println!("vaimage doctor\n");
        for check in checks {
            let icon = match check.status {
                "pass" => "✓",
                "fail" => "✗",
                "warn" => "⚠",
                _ => "ℹ",
            };
            println!("  {icon} {}", check.message);
        }
        println!();
        if all_pass {
            println!("All checks passed.");
        } else {
            println!("Some checks failed. See above for details.");
        }
    }
    Ok(if all_pass { EXIT_SUCCESS } else { EXIT_FAILURE })
}

#[derive(Serialize)]
struct Check {
    name: String,
    status: &'static str,
    message: String,
}

impl Check {
    fn new(name: &str, status: &'static str, message: &str) -> Self {
        Self {
            name: name.to_owned(),
            status,
            message: message.to_owned(),
        }
    }

    fn pass(name: &str, message: &str) -> Self {
        Self::new(name, "pass", message)
    }

    fn fail(name: &str, message: &str) -> Self {
        Self::new(name, "fail", message)
    }

    fn warn(name: &str, message: &str) -> Self {
        Self::new(name, "warn", message)
    }
}
