use crate::topology::{PartitionDescriptor, PlatformsV1, TopologyDescriptor};
use crate::types::{Label, TopologyType};
use crate::SchemaError;
use serde::{Deserialize, Serialize};

/// Mount point sentinel marking a partition that is never mounted.
pub const SWAP_MOUNT_POINT: &str = "SWAP";

const SWAP_FILESYSTEM: &str = "swap";
const BYTES_PER_GIB: u64 = 1024 * 1024 * 1024;

/// Validated appliance topology: sizing plus the ordered partition layout.
///
/// Produced by [`TopologyDescriptor::normalize`]; immutable afterwards.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Topology {
    pub name: String,
    pub type_id: TopologyType,
    pub cpus: u32,
    pub ram_size_mb: u64,
    pub hdd_size_gb: u64,
    pub description: String,
    /// Keystroke script for the partitioning tool, exactly as declared.
    pub fdisk_cmd: String,
    pub partitions: Vec<Partition>,
}

/// One declared partition. `mount_point` is `None` for swap.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Partition {
    pub sequence: u32,
    pub size_mb: u64,
    pub label: Label,
    pub mount_point: Option<String>,
    pub file_system: String,
    pub file_system_args: Vec<String>,
    pub description: String,
}

impl Partition {
    pub fn is_swap(&self) -> bool {
        self.mount_point.is_none()
    }
}

impl Topology {
    /// Size of the raw image file in bytes.
    pub fn disk_size_bytes(&self) -> u64 {
        self.hdd_size_gb.saturating_mul(BYTES_PER_GIB)
    }

    /// The script fed to the partitioning tool on stdin.
    ///
    /// Backslash escapes (`\n`, `\t`, `\\`) are expanded the way `echo -e`
    /// does, and each `%v` is replaced by the next declared partition size in
    /// MB. Placeholders beyond the partition count are left untouched.
    pub fn partitioning_script(&self) -> String {
        let mut sizes = self.partitions.iter().map(|p| p.size_mb);
        let mut out = String::with_capacity(self.fdisk_cmd.len());
        let mut chars = self.fdisk_cmd.chars().peekable();
        while let Some(c) = chars.next() {
            match (c, chars.peek().copied()) {
                ('\\', Some('n')) => {
                    chars.next();
                    out.push('\n');
                }
                ('\\', Some('t')) => {
                    chars.next();
                    out.push('\t');
                }
                ('\\', Some('\\')) => {
                    chars.next();
                    out.push('\\');
                }
                ('%', Some('v')) => {
                    chars.next();
                    match sizes.next() {
                        Some(size) => out.push_str(&size.to_string()),
                        None => out.push_str("%v"),
                    }
                }
                _ => out.push(c),
            }
        }
        out
    }
}

impl TopologyDescriptor {
    /// Validate the descriptor: parse numbers, resolve the swap sentinel and
    /// check that sequences follow declaration order.
    pub fn normalize(&self) -> Result<Topology, SchemaError> {
        let name = self.name.trim().to_owned();
        if name.is_empty() {
            return Err(SchemaError::MissingField("Topology.Name"));
        }

        let hdd_size_gb = parse_number::<u64>("HddSizeGb", &self.hdd_size_gb)?;
        if hdd_size_gb == 0 {
            return Err(SchemaError::InvalidValue {
                field: "HddSizeGb",
                value: self.hdd_size_gb.clone(),
            });
        }

        if self.partitions.is_empty() {
            return Err(SchemaError::NoPartitions(name));
        }

        let mut partitions = Vec::with_capacity(self.partitions.len());
        for (index, raw) in self.partitions.iter().enumerate() {
            partitions.push(normalize_partition(&name, index + 1, raw)?);
        }

        Ok(Topology {
            type_id: TopologyType::new(self.type_id.trim()),
            cpus: parse_number("Cpus", &self.cpus)?,
            ram_size_mb: parse_number("RamSizeMb", &self.ram_size_mb)?,
            hdd_size_gb,
            description: self.description.trim().to_owned(),
            fdisk_cmd: self.fdisk_cmd.trim().to_owned(),
            partitions,
            name,
        })
    }
}

impl PlatformsV1 {
    /// Normalize every topology in the descriptor.
    pub fn normalize(&self) -> Result<Vec<Topology>, SchemaError> {
        self.topologies
            .iter()
            .map(TopologyDescriptor::normalize)
            .collect()
    }

    /// Select the topology whose `Type` matches and normalize it.
    pub fn topology_for_type(&self, type_id: &str) -> Result<Topology, SchemaError> {
        self.topologies
            .iter()
            .find(|t| t.type_id.trim() == type_id)
            .ok_or_else(|| SchemaError::UnknownTopology(type_id.to_owned()))?
            .normalize()
    }
}

fn normalize_partition(
    topology: &str,
    position: usize,
    raw: &PartitionDescriptor,
) -> Result<Partition, SchemaError> {
    let sequence = parse_number::<u32>("Sequence", &raw.sequence)?;
    if sequence as usize != position {
        return Err(SchemaError::SequenceMismatch {
            topology: topology.to_owned(),
            position,
            found: sequence,
        });
    }

    let label = raw.label.trim();
    if label.is_empty() {
        return Err(SchemaError::MissingField("Partition.Label"));
    }
    let file_system = raw.file_system.trim().to_lowercase();
    if file_system.is_empty() {
        return Err(SchemaError::MissingField("Partition.FileSystem"));
    }

    let declared_mount = raw.mount_point.trim();
    let mount_point = if file_system == SWAP_FILESYSTEM {
        None
    } else if declared_mount.starts_with('/') {
        Some(declared_mount.to_owned())
    } else {
        return Err(SchemaError::InvalidMountPoint {
            topology: topology.to_owned(),
            label: label.to_owned(),
            mount_point: declared_mount.to_owned(),
        });
    };

    Ok(Partition {
        sequence,
        size_mb: parse_number("SizeMb", &raw.size_mb)?,
        label: Label::new(label),
        mount_point,
        file_system,
        file_system_args: raw
            .file_system_args
            .split_whitespace()
            .map(str::to_owned)
            .collect(),
        description: raw.description.trim().to_owned(),
    })
}

/// Empty numeric fields read as zero.
fn parse_number<T>(field: &'static str, value: &str) -> Result<T, SchemaError>
where
    T: std::str::FromStr + Default,
{
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Ok(T::default());
    }
    trimmed.parse().map_err(|_| SchemaError::InvalidValue {
        field,
        value: value.to_owned(),
    })
}

#[cfg(test)]
mod tests {
    use crate::topology::parse_platforms_str;
    use crate::SchemaError;

    const TWO_PARTITIONS: &str = r"
<Platforms>
  <Topology>
    <Name>Test</Name>
    <Type>1</Type>
    <Cpus>2</Cpus>
    <RamSizeMb>3072</RamSizeMb>
    <HddSizeGb>5</HddSizeGb>
    <FdiskCmd>n\np\n1\n\n+%vM\nn\np\n2\n\n\nt\n2\n82\na\n1\nw\n</FdiskCmd>
    <Partition>
      <Sequence>1</Sequence>
      <SizeMb>3045</SizeMb>
      <Label>SLASH</Label>
      <MountPoint>/</MountPoint>
      <FileSystem>ext4</FileSystem>
      <FileSystemArgs>-O ^has_journal</FileSystemArgs>
    </Partition>
    <Partition>
      <Sequence>2</Sequence>
      <SizeMb>400</SizeMb>
      <Label>SWAP</Label>
      <MountPoint>SWAP</MountPoint>
      <FileSystem>SWAP</FileSystem>
    </Partition>
  </Topology>
  <Topology>
    <Name>Small</Name>
    <Type>2</Type>
    <HddSizeGb>1</HddSizeGb>
    <Partition>
      <Sequence>1</Sequence>
      <Label>SLASH</Label>
      <MountPoint>/</MountPoint>
      <FileSystem>ext4</FileSystem>
    </Partition>
  </Topology>
</Platforms>
";

    fn single(partitions: &str) -> String {
        format!(
            "<Platforms><Topology><Name>T</Name><Type>t</Type><HddSizeGb>1</HddSizeGb>{partitions}</Topology></Platforms>"
        )
    }

    #[test]
    fn normalizes_two_partition_topology() {
        let platforms = parse_platforms_str(TWO_PARTITIONS).unwrap();
        let topo = platforms.topology_for_type("1").unwrap();

        assert_eq!(topo.name, "Test");
        assert_eq!(topo.cpus, 2);
        assert_eq!(topo.ram_size_mb, 3072);
        assert_eq!(topo.disk_size_bytes(), 5 * 1024 * 1024 * 1024);
        assert_eq!(topo.partitions.len(), 2);
        assert_eq!(topo.partitions[0].mount_point.as_deref(), Some("/"));
        assert_eq!(topo.partitions[0].file_system_args, vec!["-O", "^has_journal"]);
        assert!(topo.partitions[1].is_swap());
        assert_eq!(topo.partitions[1].file_system, "swap");
        assert_eq!(topo.partitions.iter().filter(|p| !p.is_swap()).count(), 1);
    }

    #[test]
    fn empty_numbers_default_to_zero() {
        let platforms = parse_platforms_str(TWO_PARTITIONS).unwrap();
        let topo = platforms.topology_for_type("2").unwrap();
        assert_eq!(topo.cpus, 0);
        assert_eq!(topo.partitions[0].size_mb, 0);
    }

    #[test]
    fn unknown_type_is_rejected() {
        let platforms = parse_platforms_str(TWO_PARTITIONS).unwrap();
        let err = platforms.topology_for_type("9").unwrap_err();
        assert!(matches!(err, SchemaError::UnknownTopology(t) if t == "9"));
    }

    #[test]
    fn normalizes_all_topologies() {
        let platforms = parse_platforms_str(TWO_PARTITIONS).unwrap();
        let all = platforms.normalize().unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[1].type_id, "2");
    }

    #[test]
    fn partitioning_script_expands_escapes_and_sizes() {
        let platforms = parse_platforms_str(TWO_PARTITIONS).unwrap();
        let topo = platforms.topology_for_type("1").unwrap();
        assert_eq!(
            topo.partitioning_script(),
            "n\np\n1\n\n+3045M\nn\np\n2\n\n\nt\n2\n82\na\n1\nw\n"
        );
    }

    #[test]
    fn surplus_placeholders_are_kept() {
        let mut topo = parse_platforms_str(TWO_PARTITIONS)
            .unwrap()
            .topology_for_type("2")
            .unwrap();
        topo.fdisk_cmd = r"+%vM\n+%vM".to_owned();
        assert_eq!(topo.partitioning_script(), "+0M\n+%vM");
    }

    #[test]
    fn rejects_out_of_order_sequence() {
        let xml = single(
            "<Partition><Sequence>2</Sequence><Label>A</Label><MountPoint>/</MountPoint><FileSystem>ext4</FileSystem></Partition>",
        );
        let err = parse_platforms_str(&xml)
            .unwrap()
            .topology_for_type("t")
            .unwrap_err();
        assert!(matches!(
            err,
            SchemaError::SequenceMismatch {
                position: 1,
                found: 2,
                ..
            }
        ));
    }

    #[test]
    fn rejects_relative_mount_point() {
        let xml = single(
            "<Partition><Sequence>1</Sequence><Label>A</Label><MountPoint>boot</MountPoint><FileSystem>ext4</FileSystem></Partition>",
        );
        let err = parse_platforms_str(&xml)
            .unwrap()
            .topology_for_type("t")
            .unwrap_err();
        assert!(matches!(err, SchemaError::InvalidMountPoint { .. }));
    }

    #[test]
    fn rejects_swap_sentinel_on_regular_filesystem() {
        let xml = single(
            "<Partition><Sequence>1</Sequence><Label>A</Label><MountPoint>SWAP</MountPoint><FileSystem>ext4</FileSystem></Partition>",
        );
        assert!(parse_platforms_str(&xml)
            .unwrap()
            .topology_for_type("t")
            .is_err());
    }

    #[test]
    fn rejects_topology_without_partitions() {
        let xml = single("");
        let err = parse_platforms_str(&xml)
            .unwrap()
            .topology_for_type("t")
            .unwrap_err();
        assert!(matches!(err, SchemaError::NoPartitions(_)));
    }

    #[test]
    fn rejects_zero_disk_size() {
        let xml = "<Platforms><Topology><Name>T</Name><Type>t</Type><HddSizeGb>0</HddSizeGb></Topology></Platforms>";
        let err = parse_platforms_str(xml)
            .unwrap()
            .topology_for_type("t")
            .unwrap_err();
        assert!(matches!(err, SchemaError::InvalidValue { field: "HddSizeGb", .. }));
    }

    #[test]
    fn rejects_non_numeric_size() {
        let xml = single(
            "<Partition><Sequence>1</Sequence><SizeMb>big</SizeMb><Label>A</Label><MountPoint>/</MountPoint><FileSystem>ext4</FileSystem></Partition>",
        );
        let err = parse_platforms_str(&xml)
            .unwrap()
            .topology_for_type("t")
            .unwrap_err();
        assert!(matches!(err, SchemaError::InvalidValue { field: "SizeMb", .. }));
    }
}
