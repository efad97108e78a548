//! Root filesystem population used by `vaimage build`.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};
use vaimage_core::{CoreError, Rootfs};
use vaimage_runtime::{fsutil, run_checked, Host, ToolCommand};

/// Copies a prepared directory tree into the image and runs an optional
/// installer executable with the mounted root as its argument.
pub struct TreePopulator {
    source: Option<PathBuf>,
    install_script: Option<PathBuf>,
    host: Arc<dyn Host>,
}

impl TreePopulator {
    pub fn new(source: Option<PathBuf>, install_script: Option<PathBuf>, host: Arc<dyn Host>) -> Self {
        Self {
            source,
            install_script,
            host,
        }
    }
}

impl Rootfs for TreePopulator {
    fn make_rootfs(&self, root: &Path) -> Result<(), CoreError> {
        let Some(source) = &self.source else {
            debug!("no rootfs source configured");
            return Ok(());
        };
        if !source.is_dir() {
            return Err(CoreError::Config(format!(
                "rootfs source {} is not a directory",
                source.display()
            )));
        }
        fsutil::copy_dir_contents(source, root).map_err(|e| CoreError::Fs {
            op: "copy rootfs from",
            path: source.clone(),
            source: e,
        })?;
        info!("copied {} into {}", source.display(), root.display());
        Ok(())
    }

    fn install_app(&self, root: &Path) -> Result<(), CoreError> {
        let Some(script) = &self.install_script else {
            debug!("no install script configured");
            return Ok(());
        };
        run_checked(
            self.host.as_ref(),
            &ToolCommand::new(script.to_string_lossy()).path_arg(root),
        )?;
        info!("ran {}", script.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use vaimage_runtime::MockHost;

    #[test]
    fn copies_tree_into_root() {
        let src = tempfile::tempdir().unwrap();
        let root = tempfile::tempdir().unwrap();
        fs::create_dir_all(src.path().join("etc")).unwrap();
        fs::write(src.path().join("etc/hostname"), "appliance\n").unwrap();

        let populator =
            TreePopulator::new(Some(src.path().to_path_buf()), None, Arc::new(MockHost::new()));
        populator.make_rootfs(root.path()).unwrap();
        assert_eq!(
            fs::read_to_string(root.path().join("etc/hostname")).unwrap(),
            "appliance\n"
        );
    }

    #[test]
    fn missing_source_is_config_error() {
        let root = tempfile::tempdir().unwrap();
        let populator = TreePopulator::new(
            Some(root.path().join("absent")),
            None,
            Arc::new(MockHost::new()),
        );
        let err = populator.make_rootfs(root.path()).unwrap_err();
        assert!(matches!(err, CoreError::Config(_)));
    }

    #[test]
    fn installer_receives_root() {
        let host = Arc::new(MockHost::new());
        let populator =
            TreePopulator::new(None, Some(PathBuf::from("/srv/install.sh")), host.clone());
        populator.install_app(Path::new("/mnt/va")).unwrap();
        assert_eq!(host.history(), vec!["/srv/install.sh /mnt/va"]);
    }

    #[test]
    fn nothing_configured_is_a_noop() {
        let host = Arc::new(MockHost::new());
        let populator = TreePopulator::new(None, None, host.clone());
        populator.make_rootfs(Path::new("/mnt/va")).unwrap();
        populator.install_app(Path::new("/mnt/va")).unwrap();
        assert!(host.history().is_empty());
    }
}
