use crate::image::within_root;
use crate::CoreError;
use std::fs::File;
use std::path::Path;
use tracing::{debug, info};
use vaimage_runtime::fsutil;
use vaimage_schema::{InjectDirective, InjectOp};

const DEFAULT_DIR_MODE: u32 = 0o755;

pub(crate) fn apply(root: &Path, inject_dir: &Path, d: &InjectDirective) -> Result<(), CoreError> {
    let location = within_root(root, &d.location);
    let target = location.join(&d.name);
    let source = inject_dir.join(&d.name);

    match &d.op {
        InjectOp::Remove { backup } => {
            if let Some(backup) = backup {
                let renamed = fsutil::rename_if_exists(&target, &location.join(backup))
                    .map_err(CoreError::fs("back up", &target))?;
                if renamed {
                    info!("inject {}: moved to {backup}", target.display());
                }
            } else if fsutil::remove_path(&target).map_err(CoreError::fs("remove", &target))? {
                info!("inject {}: removed", target.display());
            } else {
                debug!("inject {}: nothing to remove", target.display());
            }
        }
        InjectOp::File { upload, backup } => {
            fsutil::ensure_dir(&location, DEFAULT_DIR_MODE, d.owner, d.group)
                .map_err(CoreError::fs("create directory", &location))?;
            back_up(&location, &target, backup.as_deref())?;
            if *upload {
                fsutil::copy_file(&source, &target).map_err(CoreError::fs("upload", &source))?;
                info!("inject {}: uploaded", target.display());
            } else {
                File::create(&target).map_err(CoreError::fs("create", &target))?;
                info!("inject {}: created", target.display());
            }
            fsutil::chown(&target, d.owner, d.group).map_err(CoreError::fs("chown", &target))?;
        }
        InjectOp::Directory { upload, backup } => {
            back_up(&location, &target, backup.as_deref())?;
            let mode = d.permissions.unwrap_or(DEFAULT_DIR_MODE);
            fsutil::ensure_dir(&target, mode, d.owner, d.group)
                .map_err(CoreError::fs("create directory", &target))?;
            if *upload {
                fsutil::copy_dir_contents(&source, &target)
                    .map_err(CoreError::fs("upload", &source))?;
                info!("inject {}: uploaded directory", target.display());
            } else {
                info!("inject {}: created directory", target.display());
            }
        }
        InjectOp::Link { target: link_to } => {
            fsutil::ensure_dir(&location, DEFAULT_DIR_MODE, d.owner, d.group)
                .map_err(CoreError::fs("create directory", &location))?;
            fsutil::replace_with_symlink(Path::new(link_to), &target)
                .map_err(CoreError::fs("link", &target))?;
            info!("inject {} -> {link_to}", target.display());
        }
    }
    Ok(())
}

fn back_up(location: &Path, target: &Path, backup: Option<&str>) -> Result<(), CoreError> {
    let Some(backup) = backup else {
        return Ok(());
    };
    if fsutil::rename_if_exists(target, &location.join(backup))
        .map_err(CoreError::fs("back up", target))?
    {
        debug!("backed up {} as {backup}", target.display());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::os::unix::fs::PermissionsExt;

    fn directive(name: &str, location: &str, op: InjectOp) -> InjectDirective {
        InjectDirective {
            name: name.to_owned(),
            location: location.to_owned(),
            op,
            permissions: None,
            owner: None,
            group: None,
        }
    }

    struct Fixture {
        root: tempfile::TempDir,
        inject: tempfile::TempDir,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                root: tempfile::tempdir().unwrap(),
                inject: tempfile::tempdir().unwrap(),
            }
        }

        fn apply(&self, d: &InjectDirective) -> Result<(), CoreError> {
            apply(self.root.path(), self.inject.path(), d)
        }
    }

    #[test]
    fn remove_without_backup_deletes_tree() {
        let fx = Fixture::new();
        let target = fx.root.path().join("etc/app");
        fs::create_dir_all(target.join("conf.d")).unwrap();
        fs::write(target.join("conf.d/a.conf"), "x").unwrap();

        fx.apply(&directive("app", "/etc", InjectOp::Remove { backup: None }))
            .unwrap();
        assert!(!target.exists());
        assert!(fx.root.path().join("etc").is_dir());
    }

    #[test]
    fn remove_with_backup_renames() {
        let fx = Fixture::new();
        fs::create_dir_all(fx.root.path().join("etc")).unwrap();
        fs::write(fx.root.path().join("etc/hosts"), "127.0.0.1 localhost\n").unwrap();

        fx.apply(&directive(
            "hosts",
            "/etc",
            InjectOp::Remove {
                backup: Some("hosts.orig".to_owned()),
            },
        ))
        .unwrap();
        assert!(!fx.root.path().join("etc/hosts").exists());
        assert_eq!(
            fs::read_to_string(fx.root.path().join("etc/hosts.orig")).unwrap(),
            "127.0.0.1 localhost\n"
        );
    }

    #[test]
    fn remove_missing_target_is_noop() {
        let fx = Fixture::new();
        fx.apply(&directive("ghost", "/opt", InjectOp::Remove { backup: None }))
            .unwrap();
        fx.apply(&directive(
            "ghost",
            "/opt",
            InjectOp::Remove {
                backup: Some("ghost.bak".to_owned()),
            },
        ))
        .unwrap();
        assert!(!fx.root.path().join("opt/ghost.bak").exists());
    }

    #[test]
    fn file_upload_creates_location_and_backs_up() {
        let fx = Fixture::new();
        fs::write(fx.inject.path().join("app.conf"), "new\n").unwrap();
        let location = fx.root.path().join("etc/app");
        fs::create_dir_all(&location).unwrap();
        fs::write(location.join("app.conf"), "old\n").unwrap();

        fx.apply(&directive(
            "app.conf",
            "/etc/app",
            InjectOp::File {
                upload: true,
                backup: Some("app.conf.bak".to_owned()),
            },
        ))
        .unwrap();
        assert_eq!(fs::read_to_string(location.join("app.conf")).unwrap(), "new\n");
        assert_eq!(
            fs::read_to_string(location.join("app.conf.bak")).unwrap(),
            "old\n"
        );
    }

    #[test]
    fn file_create_makes_empty_file_in_new_location() {
        let fx = Fixture::new();
        fx.apply(&directive(
            "marker",
            "var/lib/app",
            InjectOp::File {
                upload: false,
                backup: None,
            },
        ))
        .unwrap();
        let location = fx.root.path().join("var/lib/app");
        assert_eq!(fs::read(location.join("marker")).unwrap(), b"");
        let mode = fs::metadata(&location).unwrap().permissions().mode() & 0o7777;
        assert_eq!(mode, 0o755);
    }

    #[test]
    fn missing_upload_source_is_io_failure() {
        let fx = Fixture::new();
        let err = fx
            .apply(&directive(
                "absent",
                "/etc",
                InjectOp::File {
                    upload: true,
                    backup: None,
                },
            ))
            .unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::IoFailure);
    }

    #[test]
    fn directory_upload_copies_contents_with_declared_mode() {
        let fx = Fixture::new();
        let src = fx.inject.path().join("site");
        fs::create_dir_all(src.join("css")).unwrap();
        fs::write(src.join("index.html"), "<html/>").unwrap();
        fs::write(src.join("css/main.css"), "body{}").unwrap();

        let mut d = directive(
            "site",
            "/srv",
            InjectOp::Directory {
                upload: true,
                backup: None,
            },
        );
        d.permissions = Some(0o750);
        fx.apply(&d).unwrap();

        let target = fx.root.path().join("srv/site");
        assert_eq!(fs::read_to_string(target.join("index.html")).unwrap(), "<html/>");
        assert_eq!(
            fs::read_to_string(target.join("css/main.css")).unwrap(),
            "body{}"
        );
        let mode = fs::metadata(&target).unwrap().permissions().mode() & 0o7777;
        assert_eq!(mode, 0o750);
    }

    #[test]
    fn directory_create_backs_up_existing() {
        let fx = Fixture::new();
        let target = fx.root.path().join("opt/data");
        fs::create_dir_all(&target).unwrap();
        fs::write(target.join("old"), "x").unwrap();

        fx.apply(&directive(
            "data",
            "/opt",
            InjectOp::Directory {
                upload: false,
                backup: Some("data.old".to_owned()),
            },
        ))
        .unwrap();
        assert!(target.is_dir());
        assert!(!target.join("old").exists());
        assert!(fx.root.path().join("opt/data.old/old").exists());
    }

    #[test]
    fn link_replaces_existing_target() {
        let fx = Fixture::new();
        let location = fx.root.path().join("etc");
        fs::create_dir_all(&location).unwrap();
        fs::write(location.join("localtime"), "stale").unwrap();

        fx.apply(&directive(
            "localtime",
            "/etc",
            InjectOp::Link {
                target: "/usr/share/zoneinfo/UTC".to_owned(),
            },
        ))
        .unwrap();
        let link = location.join("localtime");
        assert!(fs::symlink_metadata(&link).unwrap().file_type().is_symlink());
        assert_eq!(
            fs::read_link(&link).unwrap(),
            Path::new("/usr/share/zoneinfo/UTC")
        );
    }

    #[test]
    fn link_creates_parent() {
        let fx = Fixture::new();
        fx.apply(&directive(
            "current",
            "/opt/app",
            InjectOp::Link {
                target: "releases/1.0".to_owned(),
            },
        ))
        .unwrap();
        assert_eq!(
            fs::read_link(fx.root.path().join("opt/app/current")).unwrap(),
            Path::new("releases/1.0")
        );
    }
}
