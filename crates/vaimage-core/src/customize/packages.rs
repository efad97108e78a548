use crate::CoreError;
use std::path::Path;
use tracing::info;
use vaimage_runtime::{run_checked, CommandTarget, Host, ToolCommand};
use vaimage_schema::PackageDirective;

pub(crate) fn command(root: &Path, d: &PackageDirective) -> ToolCommand {
    ToolCommand::new(d.manager.tool())
        .args(["-y", d.action.as_str()])
        .arg(d.name.as_str())
        .target(CommandTarget::for_flag(d.chroot, root))
}

pub(crate) fn apply(host: &dyn Host, root: &Path, d: &PackageDirective) -> Result<(), CoreError> {
    info!("package {}: {}", d.name, d.action);
    run_checked(host, &command(root, d))?;
    Ok(())
}
