//! Declarative customization of a mounted image root.
//!
//! A platform directory may hold up to four descriptors. Each present
//! descriptor is parsed completely, then applied record by record in file
//! order; the first failing record aborts customization. Passes run in a
//! fixed order: packages, inject items, services, file content.

mod files;
mod inject;
mod packages;
mod services;

use crate::CoreError;
use serde::Serialize;
use std::fs;
use std::path::Path;
use tracing::{debug, info};
use vaimage_runtime::Host;
use vaimage_schema::{
    parse_file_edits, parse_inject_items, parse_packages, parse_services, SchemaError,
    FILES_CONTENT_FILE, INJECT_DIR, INJECT_ITEMS_FILE, PACKAGES_FILE, SERVICES_FILE,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PassOutcome {
    /// The descriptor file is absent.
    Skipped,
    /// Number of records applied.
    Applied(usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CustomizeReport {
    pub packages: PassOutcome,
    pub inject_items: PassOutcome,
    pub services: PassOutcome,
    pub files_content: PassOutcome,
}

/// Run every customization pass whose descriptor exists in `platform_dir`
/// against the image mounted at `root`.
pub fn customize(
    host: &dyn Host,
    root: &Path,
    platform_dir: &Path,
) -> Result<CustomizeReport, CoreError> {
    info!(
        "customizing {} from {}",
        root.display(),
        platform_dir.display()
    );

    let packages = run_pass(&platform_dir.join(PACKAGES_FILE), parse_packages, |d| {
        packages::apply(host, root, d)
    })?;

    let inject_dir = platform_dir.join(INJECT_DIR);
    let inject_items = run_pass(
        &platform_dir.join(INJECT_ITEMS_FILE),
        parse_inject_items,
        |d| inject::apply(root, &inject_dir, d),
    )?;

    let services = run_pass(&platform_dir.join(SERVICES_FILE), parse_services, |d| {
        services::apply(host, root, d)
    })?;

    let files_content = run_pass(
        &platform_dir.join(FILES_CONTENT_FILE),
        parse_file_edits,
        |e| files::apply(root, e),
    )?;

    Ok(CustomizeReport {
        packages,
        inject_items,
        services,
        files_content,
    })
}

fn run_pass<T>(
    descriptor: &Path,
    parse: fn(&str) -> Result<Vec<T>, SchemaError>,
    mut apply: impl FnMut(&T) -> Result<(), CoreError>,
) -> Result<PassOutcome, CoreError> {
    if !descriptor.is_file() {
        debug!("{} not present, skipping", descriptor.display());
        return Ok(PassOutcome::Skipped);
    }
    let content = fs::read_to_string(descriptor).map_err(CoreError::fs("read", descriptor))?;
    let records = parse(&content)?;
    for record in &records {
        apply(record)?;
    }
    debug!("{}: applied {} record(s)", descriptor.display(), records.len());
    Ok(PassOutcome::Applied(records.len()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ErrorKind;
    use vaimage_runtime::MockHost;

    #[test]
    fn empty_platform_dir_skips_everything() {
        let root = tempfile::tempdir().unwrap();
        let platform = tempfile::tempdir().unwrap();
        let report = customize(&MockHost::new(), root.path(), platform.path()).unwrap();
        assert_eq!(report.packages, PassOutcome::Skipped);
        assert_eq!(report.inject_items, PassOutcome::Skipped);
        assert_eq!(report.services, PassOutcome::Skipped);
        assert_eq!(report.files_content, PassOutcome::Skipped);
    }

    #[test]
    fn passes_run_in_fixed_order() {
        let root = tempfile::tempdir().unwrap();
        let platform = tempfile::tempdir().unwrap();
        fs::create_dir_all(root.path().join("etc")).unwrap();
        fs::write(root.path().join("etc/motd"), "hello\n").unwrap();

        fs::write(
            platform.path().join(PACKAGES_FILE),
            "<Packages><Package><Name>tunctl</Name><Type>rpm</Type><Action>install</Action></Package></Packages>",
        )
        .unwrap();
        fs::write(
            platform.path().join(SERVICES_FILE),
            "<Services><Service><Name>sshd</Name><Type>sysv</Type><Action>restart</Action></Service></Services>",
        )
        .unwrap();
        fs::write(
            platform.path().join(FILES_CONTENT_FILE),
            "<Files><File><Path>/etc/motd</Path><Action>append</Action><NewPattern>welcome</NewPattern></File></Files>",
        )
        .unwrap();

        let host = MockHost::new();
        let report = customize(&host, root.path(), platform.path()).unwrap();
        assert_eq!(report.packages, PassOutcome::Applied(1));
        assert_eq!(report.inject_items, PassOutcome::Skipped);
        assert_eq!(report.services, PassOutcome::Applied(1));
        assert_eq!(report.files_content, PassOutcome::Applied(1));
        assert_eq!(
            host.history(),
            vec!["yum -y install tunctl", "service sshd restart"]
        );
        assert_eq!(
            fs::read_to_string(root.path().join("etc/motd")).unwrap(),
            "hello\nwelcome\n"
        );
    }

    #[test]
    fn bad_record_aborts_before_any_side_effect_of_its_pass() {
        let root = tempfile::tempdir().unwrap();
        let platform = tempfile::tempdir().unwrap();
        fs::write(
            platform.path().join(PACKAGES_FILE),
            "<Packages>\
               <Package><Name>a</Name><Type>rpm</Type><Action>install</Action></Package>\
               <Package><Name>b</Name><Type>tgz</Type><Action>install</Action></Package>\
             </Packages>",
        )
        .unwrap();
        let host = MockHost::new();
        let err = customize(&host, root.path(), platform.path()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ConfigMismatch);
        assert!(host.history().is_empty());
    }

    #[test]
    fn first_failing_record_stops_later_passes() {
        let root = tempfile::tempdir().unwrap();
        let platform = tempfile::tempdir().unwrap();
        fs::write(
            platform.path().join(PACKAGES_FILE),
            "<Packages>\
               <Package><Name>a</Name><Type>deb</Type><Action>remove</Action></Package>\
               <Package><Name>b</Name><Type>deb</Type><Action>remove</Action></Package>\
             </Packages>",
        )
        .unwrap();
        fs::write(
            platform.path().join(SERVICES_FILE),
            "<Services><Service><Name>x</Name><Type>sysv</Type><Action>start</Action></Service></Services>",
        )
        .unwrap();
        let host = MockHost::new().fail_on("apt-get -y remove a");
        let err = customize(&host, root.path(), platform.path()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DeviceFailure);
        assert_eq!(host.history(), vec!["apt-get -y remove a"]);
    }

    #[test]
    fn malformed_descriptor_is_parse_failure() {
        let root = tempfile::tempdir().unwrap();
        let platform = tempfile::tempdir().unwrap();
        fs::write(platform.path().join(SERVICES_FILE), "<Services><Service>").unwrap();
        let err = customize(&MockHost::new(), root.path(), platform.path()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ParseFailure);
    }
}
