use crate::SchemaError;
use serde::Deserialize;
use std::fs;
use std::path::Path;

/// Root of a topology descriptor: every appliance topology a platform knows.
///
/// ```xml
/// <Platforms>
///   <Topology>
///     <Name>Test</Name>
///     <Type>1</Type>
///     <Cpus>2</Cpus>
///     <RamSizeMb>3072</RamSizeMb>
///     <HddSizeGb>5</HddSizeGb>
///     <FdiskCmd>n\np\n1\n\n+%vM\nn\np\n2\n\n\nt\n2\n82\na\n1\nw\n</FdiskCmd>
///     <Partition>
///       <Sequence>1</Sequence>
///       <SizeMb>3045</SizeMb>
///       <Label>SLASH</Label>
///       <MountPoint>/</MountPoint>
///       <FileSystem>ext4</FileSystem>
///     </Partition>
///   </Topology>
/// </Platforms>
/// ```
///
/// Every leaf is kept as text here; numbers, flags and invariants are checked
/// by [`TopologyDescriptor::normalize`].
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
pub struct PlatformsV1 {
    #[serde(rename = "Topology", alias = "Platform", default)]
    pub topologies: Vec<TopologyDescriptor>,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
pub struct TopologyDescriptor {
    #[serde(rename = "Name", default)]
    pub name: String,
    #[serde(rename = "Type", default)]
    pub type_id: String,
    #[serde(rename = "Cpus", default)]
    pub cpus: String,
    #[serde(rename = "RamSizeMb", default)]
    pub ram_size_mb: String,
    #[serde(rename = "HddSizeGb", default)]
    pub hdd_size_gb: String,
    #[serde(rename = "Description", default)]
    pub description: String,
    #[serde(rename = "FdiskCmd", default)]
    pub fdisk_cmd: String,
    #[serde(rename = "Partition", default)]
    pub partitions: Vec<PartitionDescriptor>,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
pub struct PartitionDescriptor {
    #[serde(rename = "Sequence", default)]
    pub sequence: String,
    #[serde(rename = "SizeMb", default)]
    pub size_mb: String,
    #[serde(rename = "Label", default)]
    pub label: String,
    #[serde(rename = "MountPoint", default)]
    pub mount_point: String,
    #[serde(rename = "FileSystem", default)]
    pub file_system: String,
    #[serde(rename = "FileSystemArgs", default)]
    pub file_system_args: String,
    #[serde(rename = "Description", alias = "description", default)]
    pub description: String,
}

pub fn parse_platforms_str(input: &str) -> Result<PlatformsV1, SchemaError> {
    Ok(quick_xml::de::from_str(input)?)
}

pub fn parse_platforms_file(path: impl AsRef<Path>) -> Result<PlatformsV1, SchemaError> {
    let content = fs::read_to_string(path)?;
    parse_platforms_str(&content)
}
