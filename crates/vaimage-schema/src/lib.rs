//! Descriptor parsing and normalization for vaimage.
//!
//! This crate defines the schema layer: the XML topology descriptor
//! (`PlatformsV1`) and its validated form (`Topology`), the four optional
//! customization descriptors with their closed directive enums, and the TOML
//! build configuration consumed by the CLI (`BuildConfig`).

pub mod config;
pub mod descriptor;
pub mod normalize;
pub mod topology;
pub mod types;

pub use config::{
    parse_config_file, parse_config_str, BuildConfig, DiscoverySection, ResolvedBuildConfig,
};
pub use descriptor::{
    parse_file_edits, parse_inject_items, parse_packages, parse_services, EditAction,
    FileEdit, InjectAction, InjectDirective, InjectOp, ItemKind, PackageAction,
    PackageDirective, PackageManager, ServiceAction, ServiceDirective, ServiceManager,
    ServiceStatus, FILES_CONTENT_FILE, INJECT_DIR, INJECT_ITEMS_FILE, PACKAGES_FILE,
    SERVICES_FILE,
};
pub use normalize::{Partition, Topology, SWAP_MOUNT_POINT};
pub use topology::{
    parse_platforms_file, parse_platforms_str, PartitionDescriptor, PlatformsV1,
    TopologyDescriptor,
};
pub use types::{Label, TopologyType};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SchemaError {
    #[error("failed to read descriptor: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse descriptor: {0}")]
    ParseXml(#[from] quick_xml::DeError),
    #[error("failed to parse configuration: {0}")]
    ParseToml(#[from] toml::de::Error),
    #[error("invalid {field} value: '{value}'")]
    InvalidValue { field: &'static str, value: String },
    #[error("unsupported {field}: '{value}'")]
    Unsupported { field: &'static str, value: String },
    #[error("{0} must not be empty")]
    MissingField(&'static str),
    #[error("topology '{topology}': partition #{position} declares sequence {found}, expected {position}")]
    SequenceMismatch {
        topology: String,
        position: usize,
        found: u32,
    },
    #[error("topology '{topology}': partition '{label}' has invalid mount point '{mount_point}'")]
    InvalidMountPoint {
        topology: String,
        label: String,
        mount_point: String,
    },
    #[error("topology '{0}' declares no partitions")]
    NoPartitions(String),
    #[error("no topology of type '{0}' in descriptor")]
    UnknownTopology(String),
}

impl SchemaError {
    /// Whether the error comes from a malformed document rather than from a
    /// well-formed document carrying values the engine cannot act on.
    pub fn is_parse_failure(&self) -> bool {
        matches!(self, Self::ParseXml(_) | Self::ParseToml(_))
    }
}
