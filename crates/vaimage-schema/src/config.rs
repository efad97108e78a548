use crate::SchemaError;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// `vaimage.toml`: everything the CLI needs to run one build.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct BuildConfig {
    pub image: ImageSection,
    pub topology: TopologySection,
    #[serde(default)]
    pub customize: Option<CustomizeSection>,
    #[serde(default)]
    pub rootfs: Option<RootfsSection>,
    #[serde(default)]
    pub app: Option<AppSection>,
    #[serde(default)]
    pub bootloader: Option<BootloaderSection>,
    #[serde(default)]
    pub discovery: DiscoverySection,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ImageSection {
    pub path: PathBuf,
    pub mount_dir: PathBuf,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct TopologySection {
    pub file: PathBuf,
    #[serde(rename = "type")]
    pub type_id: String,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct CustomizeSection {
    pub platform_dir: PathBuf,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct RootfsSection {
    /// Directory tree copied into the mounted root.
    pub source: PathBuf,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct AppSection {
    /// Executable run with the mounted root as its only argument.
    pub install_script: PathBuf,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct BootloaderSection {
    pub grub: PathBuf,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct DiscoverySection {
    #[serde(default = "default_settle_ms")]
    pub settle_ms: u64,
    #[serde(default = "default_max_polls")]
    pub max_polls: u32,
}

impl Default for DiscoverySection {
    fn default() -> Self {
        Self {
            settle_ms: default_settle_ms(),
            max_polls: default_max_polls(),
        }
    }
}

fn default_settle_ms() -> u64 {
    1000
}

fn default_max_polls() -> u32 {
    5
}

/// A [`BuildConfig`] with every path made absolute against the directory of
/// the configuration file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedBuildConfig {
    pub image_path: PathBuf,
    pub mount_dir: PathBuf,
    pub topology_file: PathBuf,
    pub topology_type: String,
    pub platform_dir: Option<PathBuf>,
    pub rootfs_source: Option<PathBuf>,
    pub install_script: Option<PathBuf>,
    pub grub: Option<PathBuf>,
    pub settle_ms: u64,
    pub max_polls: u32,
}

impl BuildConfig {
    pub fn resolve(&self, base_dir: &Path) -> Result<ResolvedBuildConfig, SchemaError> {
        let topology_type = self.topology.type_id.trim().to_owned();
        if topology_type.is_empty() {
            return Err(SchemaError::MissingField("topology.type"));
        }
        if self.discovery.max_polls == 0 {
            return Err(SchemaError::InvalidValue {
                field: "discovery.max_polls",
                value: "0".to_owned(),
            });
        }

        let abs = |p: &Path| {
            if p.is_absolute() {
                p.to_path_buf()
            } else {
                base_dir.join(p)
            }
        };

        Ok(ResolvedBuildConfig {
            image_path: abs(&self.image.path),
            mount_dir: abs(&self.image.mount_dir),
            topology_file: abs(&self.topology.file),
            topology_type,
            platform_dir: self.customize.as_ref().map(|c| abs(&c.platform_dir)),
            rootfs_source: self.rootfs.as_ref().map(|r| abs(&r.source)),
            install_script: self.app.as_ref().map(|a| abs(&a.install_script)),
            grub: self.bootloader.as_ref().map(|b| b.grub.clone()),
            settle_ms: self.discovery.settle_ms,
            max_polls: self.discovery.max_polls,
        })
    }
}

pub fn parse_config_str(input: &str) -> Result<BuildConfig, SchemaError> {
    Ok(toml::from_str(input)?)
}

/// Read and resolve a configuration file; relative paths are taken from the
/// file's own directory.
pub fn parse_config_file(path: impl AsRef<Path>) -> Result<ResolvedBuildConfig, SchemaError> {
    let path = path.as_ref();
    let content = fs::read_to_string(path)?;
    let base = path.parent().unwrap_or(Path::new("."));
    parse_config_str(&content)?.resolve(base)
}
