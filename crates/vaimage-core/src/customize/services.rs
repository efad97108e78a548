use crate::image::within_root;
use crate::CoreError;
use std::fs;
use std::path::Path;
use tracing::{debug, info, warn};
use vaimage_runtime::{fsutil, probe, run_checked, CommandTarget, Host, ToolCommand};
use vaimage_schema::{ServiceDirective, ServiceManager, ServiceStatus};

const UPSTART_JOBS: &str = "/etc/init";

pub(crate) fn apply(host: &dyn Host, root: &Path, d: &ServiceDirective) -> Result<(), CoreError> {
    match d.manager {
        ServiceManager::SysV => apply_sysv(host, root, d),
        ServiceManager::Upstart => apply_upstart(host, root, d),
    }
}

fn apply_sysv(host: &dyn Host, root: &Path, d: &ServiceDirective) -> Result<(), CoreError> {
    if let Some(status) = d.status {
        let target = CommandTarget::for_flag(d.chroot, root);
        let list = ToolCommand::new("chkconfig")
            .args(["--list", d.name.as_str()])
            .target(target.clone());
        if probe(host, &list)? {
            run_checked(
                host,
                &ToolCommand::new("chkconfig")
                    .args([d.name.as_str(), status.as_str()])
                    .target(target),
            )?;
            info!("service {}: {status}", d.name);
        } else {
            warn!("service {} is not registered with chkconfig, status left unchanged", d.name);
        }
    }
    if let Some(action) = d.action {
        run_checked(
            host,
            &ToolCommand::new("service").args([d.name.as_str(), action.as_str()]),
        )?;
        info!("service {}: {action}", d.name);
    }
    Ok(())
}

fn apply_upstart(host: &dyn Host, root: &Path, d: &ServiceDirective) -> Result<(), CoreError> {
    let jobs = within_root(root, UPSTART_JOBS);
    let override_file = jobs.join(format!("{}.override", d.name));
    match d.status {
        Some(ServiceStatus::Off) => {
            if jobs.join(format!("{}.conf", d.name)).is_file() {
                fs::write(&override_file, "manual\n")
                    .map_err(CoreError::fs("write", &override_file))?;
                info!("upstart job {}: manual", d.name);
            } else {
                debug!("upstart job {} has no configuration, nothing to disable", d.name);
            }
        }
        Some(ServiceStatus::On) => {
            if fsutil::remove_path(&override_file)
                .map_err(CoreError::fs("remove", &override_file))?
            {
                info!("upstart job {}: automatic", d.name);
            }
        }
        None => {}
    }
    if let Some(action) = d.action {
        run_checked(
            host,
            &ToolCommand::new("initctl").args([action.as_str(), d.name.as_str()]),
        )?;
        info!("upstart job {}: {action}", d.name);
    }
    Ok(())
}
