//! Image lifecycle tests against the simulated host.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Barrier};
use std::time::Duration;
use vaimage_core::{CoreError, DiscoveryPolicy, ErrorKind, Image, PassOutcome};
use vaimage_runtime::MockHost;
use vaimage_schema::{parse_platforms_str, Topology};

const PLATFORMS: &str = r"
<Platforms>
  <Topology>
    <Name>single</Name>
    <Type>1</Type>
    <HddSizeGb>1</HddSizeGb>
    <FdiskCmd>n\np\n1\n\n\nw\n</FdiskCmd>
    <Partition>
      <Sequence>1</Sequence>
      <SizeMb>1024</SizeMb>
      <Label>SLASH</Label>
      <MountPoint>/</MountPoint>
      <FileSystem>ext3</FileSystem>
    </Partition>
  </Topology>
  <Topology>
    <Name>root and swap</Name>
    <Type>2</Type>
    <HddSizeGb>2</HddSizeGb>
    <FdiskCmd>n\np\n1\n\n+%vM\nn\np\n2\n\n\nt\n2\n82\nw\n</FdiskCmd>
    <Partition>
      <Sequence>1</Sequence>
      <SizeMb>1536</SizeMb>
      <Label>SLASH</Label>
      <MountPoint>/</MountPoint>
      <FileSystem>ext3</FileSystem>
    </Partition>
    <Partition>
      <Sequence>2</Sequence>
      <SizeMb>512</SizeMb>
      <Label>SWAP</Label>
      <MountPoint>SWAP</MountPoint>
      <FileSystem>swap</FileSystem>
    </Partition>
  </Topology>
  <Topology>
    <Name>split var</Name>
    <Type>3</Type>
    <HddSizeGb>4</HddSizeGb>
    <FdiskCmd>n\np\n1\n\n+%vM\nn\np\n2\n\n+%vM\nn\np\n3\n\n\nt\n3\n82\nw\n</FdiskCmd>
    <Partition>
      <Sequence>1</Sequence>
      <SizeMb>2048</SizeMb>
      <Label>SLASH</Label>
      <MountPoint>/</MountPoint>
      <FileSystem>ext3</FileSystem>
    </Partition>
    <Partition>
      <Sequence>2</Sequence>
      <SizeMb>1536</SizeMb>
      <Label>VAR</Label>
      <MountPoint>/var</MountPoint>
      <FileSystem>ext3</FileSystem>
    </Partition>
    <Partition>
      <Sequence>3</Sequence>
      <SizeMb>512</SizeMb>
      <Label>SWAP</Label>
      <MountPoint>SWAP</MountPoint>
      <FileSystem>swap</FileSystem>
    </Partition>
  </Topology>
</Platforms>";

fn topology(type_id: &str) -> Topology {
    parse_platforms_str(PLATFORMS)
        .unwrap()
        .topology_for_type(type_id)
        .unwrap()
}

struct Workspace {
    dir: tempfile::TempDir,
}

impl Workspace {
    fn new() -> Self {
        Self {
            dir: tempfile::tempdir().unwrap(),
        }
    }

    fn image_path(&self) -> PathBuf {
        self.dir.path().join("va.img")
    }

    fn mount_dir(&self) -> PathBuf {
        self.dir.path().join("mnt")
    }

    fn platform_dir(&self) -> PathBuf {
        let dir = self.dir.path().join("platform");
        fs::create_dir_all(dir.join("inject")).unwrap();
        dir
    }

    fn open(&self, type_id: &str, host: &Arc<MockHost>) -> Image {
        Image::open(
            self.image_path(),
            self.mount_dir(),
            topology(type_id),
            host.clone(),
        )
        .unwrap()
        .with_discovery_policy(DiscoveryPolicy::new(Duration::ZERO, 3))
    }
}

fn write(path: &Path, content: &str) {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).unwrap();
    }
    fs::write(path, content).unwrap();
}

#[test]
fn fresh_image_mounts_every_non_swap_partition() {
    let ws = Workspace::new();
    let host = Arc::new(MockHost::new().with_partitions(3));
    let image = ws.open("3", &host);
    assert!(image.needs_partitioning());

    image.parse().unwrap();
    assert_eq!(image.amount_of_mappers(), 2);
    let mount_points: Vec<PathBuf> = image.mappers().into_iter().map(|m| m.mount_point).collect();
    assert_eq!(mount_points, vec![ws.mount_dir(), ws.mount_dir().join("var")]);

    assert_eq!(host.commands_for("mkfs").len(), 2);
    assert_eq!(
        host.commands_for("mkswap"),
        vec!["mkswap -L SWAP /dev/mapper/loop0p3"]
    );
    let fdisk = host
        .invocations()
        .into_iter()
        .find(|i| i.command == "fdisk /dev/loop0")
        .unwrap();
    assert_eq!(
        fdisk.stdin.unwrap(),
        "n\np\n1\n\n+2048M\nn\np\n2\n\n+1536M\nn\np\n3\n\n\nt\n3\n82\nw\n"
    );

    image.release().unwrap();
}

#[test]
fn existing_image_is_mounted_without_formatting() {
    let ws = Workspace::new();
    fs::write(ws.image_path(), b"").unwrap();
    let host = Arc::new(MockHost::new().with_partitions(3));
    let image = ws.open("3", &host);
    assert!(!image.needs_partitioning());

    image.parse().unwrap();
    assert_eq!(image.amount_of_mappers(), 2);
    assert!(host.commands_for("fdisk").is_empty());
    assert!(host.commands_for("mkfs").is_empty());
    assert!(host.commands_for("mkswap").is_empty());
    image.release().unwrap();
}

#[test]
fn mapping_count_mismatch_names_both_counts() {
    let ws = Workspace::new();
    let host = Arc::new(MockHost::new().with_partitions(2));
    let image = ws.open("3", &host);

    let err = image.parse().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ConfigMismatch);
    let msg = err.to_string();
    assert!(msg.contains("defined = 3"), "{msg}");
    assert!(msg.contains("actual amount is 2"), "{msg}");
    assert_eq!(image.amount_of_mappers(), 0);

    image.release().unwrap();
    assert!(host.bound_devices().is_empty());
}

#[test]
fn second_release_is_a_noop() {
    let ws = Workspace::new();
    let host = Arc::new(MockHost::new());
    let image = ws.open("1", &host);
    image.parse().unwrap();

    image.release().unwrap();
    let after_first = host.history().len();
    image.release().unwrap();
    assert_eq!(host.history().len(), after_first);
    assert_eq!(image.loop_device(), None);
}

#[test]
fn racing_releases_tear_down_once() {
    let ws = Workspace::new();
    let host = Arc::new(MockHost::new().with_partitions(3));
    let image = ws.open("3", &host);
    image.parse().unwrap();
    let _guard = image.release_on_interrupt();

    let barrier = Barrier::new(2);
    let results: Vec<Result<(), CoreError>> = std::thread::scope(|s| {
        let handles: Vec<_> = (0..2)
            .map(|_| {
                s.spawn(|| {
                    barrier.wait();
                    image.release()
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    assert!(results.iter().all(Result::is_ok), "{results:?}");
    assert_eq!(image.amount_of_mappers(), 0);
    assert!(host.bound_devices().is_empty());
    assert!(host.mounts().is_empty());
    let detaches: Vec<String> = host
        .commands_for("losetup")
        .into_iter()
        .filter(|c| c.starts_with("losetup -d"))
        .collect();
    assert_eq!(detaches, vec!["losetup -d /dev/loop0"]);
}

#[test]
fn single_partition_lifecycle_leaves_nothing_behind() {
    let ws = Workspace::new();
    let host = Arc::new(MockHost::new());
    let image = ws.open("1", &host);

    image.parse().unwrap();
    assert_eq!(image.amount_of_mappers(), 1);
    assert_eq!(image.loop_device(), Some(PathBuf::from("/dev/loop0")));
    assert_eq!(host.mounts().len(), 1);
    assert!(ws.mount_dir().is_dir());

    image.release().unwrap();
    assert_eq!(image.amount_of_mappers(), 0);
    assert!(host.mounts().is_empty());
    assert!(host.mapper_nodes().is_empty());
    assert!(host.bound_devices().is_empty());
    assert!(!ws.mount_dir().exists());

    let teardown: Vec<String> = host.history().into_iter().rev().take(3).collect();
    assert_eq!(
        teardown,
        vec![
            "losetup -d /dev/loop0".to_owned(),
            "kpartx -d /dev/loop0".to_owned(),
            format!("umount -l {}", ws.mount_dir().display()),
        ]
    );
}

#[test]
fn swap_partition_is_never_mounted() {
    let ws = Workspace::new();
    let host = Arc::new(MockHost::new().with_partitions(2));
    let image = ws.open("2", &host);

    image.parse().unwrap();
    assert_eq!(image.amount_of_mappers(), 1);
    assert_eq!(host.mounts().len(), 1);
    image.release().unwrap();
}

#[test]
fn nested_mounts_unmount_in_reverse_order() {
    let ws = Workspace::new();
    let host = Arc::new(MockHost::new().with_partitions(3));
    let image = ws.open("3", &host);
    image.parse().unwrap();
    image.release().unwrap();

    let umounts = host.commands_for("umount");
    assert_eq!(
        umounts,
        vec![
            format!("umount -l {}", ws.mount_dir().join("var").display()),
            format!("umount -l {}", ws.mount_dir().display()),
        ]
    );
}

#[test]
fn customize_before_parse_is_rejected() {
    let ws = Workspace::new();
    let host = Arc::new(MockHost::new());
    let image = ws.open("1", &host);

    let err = image.customize(&ws.platform_dir()).unwrap_err();
    assert!(matches!(err, CoreError::NotParsed(_)));
    assert!(host.history().is_empty());
}

#[test]
fn customize_inject_items_on_mounted_root() {
    let ws = Workspace::new();
    let host = Arc::new(MockHost::new());
    let image = ws.open("1", &host);
    image.parse().unwrap();

    let root = ws.mount_dir();
    write(&root.join("etc/issue"), "stock\n");
    write(&root.join("etc/motd"), "stock\n");

    let platform = ws.platform_dir();
    write(&platform.join("inject/banner"), "welcome\n");
    write(
        &platform.join("inject_items.xml"),
        "<InjectItems>\
           <InjectItem><Name>issue</Name><Action>remove</Action><Location>/etc</Location></InjectItem>\
           <InjectItem><Name>motd</Name><BkpName>motd.dist</BkpName><Action>remove</Action><Location>/etc</Location></InjectItem>\
           <InjectItem><Name>banner</Name><Action>upload</Action><Type>file</Type><Location>/etc/app</Location></InjectItem>\
         </InjectItems>",
    );

    let report = image.customize(&platform).unwrap();
    assert_eq!(report.inject_items, PassOutcome::Applied(3));
    assert!(!root.join("etc/issue").exists());
    assert!(!root.join("etc/motd").exists());
    assert_eq!(fs::read_to_string(root.join("etc/motd.dist")).unwrap(), "stock\n");
    assert_eq!(
        fs::read_to_string(root.join("etc/app/banner")).unwrap(),
        "welcome\n"
    );

    image.release().unwrap();
}

#[test]
fn customize_file_content_is_idempotent() {
    let ws = Workspace::new();
    let host = Arc::new(MockHost::new());
    let image = ws.open("1", &host);
    image.parse().unwrap();

    let root = ws.mount_dir();
    write(&root.join("etc/sysctl.conf"), "kernel.panic = 0\n");

    let platform = ws.platform_dir();
    write(
        &platform.join("files_content.xml"),
        "<Files>\
           <File><Path>/etc/sysctl.conf</Path><Action>replace</Action><OldPattern>^kernel.panic = 0$</OldPattern><NewPattern>kernel.panic = 10</NewPattern></File>\
           <File><Path>/etc/sysctl.conf</Path><Action>append</Action><NewPattern>vm.swappiness = 10</NewPattern></File>\
         </Files>",
    );

    image.customize(&platform).unwrap();
    image.customize(&platform).unwrap();
    assert_eq!(
        fs::read_to_string(root.join("etc/sysctl.conf")).unwrap(),
        "kernel.panic = 10\nvm.swappiness = 10\n"
    );
    image.release().unwrap();
}

#[test]
fn replace_without_old_pattern_fails_first() {
    let ws = Workspace::new();
    let host = Arc::new(MockHost::new());
    let image = ws.open("1", &host);
    image.parse().unwrap();

    let root = ws.mount_dir();
    write(&root.join("etc/hosts"), "127.0.0.1 localhost\n");
    let platform = ws.platform_dir();
    write(
        &platform.join("files_content.xml"),
        "<Files><File><Path>/etc/hosts</Path><BkpName>/etc/hosts.orig</BkpName><Action>replace</Action><NewPattern>x</NewPattern></File></Files>",
    );

    let err = image.customize(&platform).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ConfigMismatch);
    assert_eq!(
        fs::read_to_string(root.join("etc/hosts")).unwrap(),
        "127.0.0.1 localhost\n"
    );
    assert!(!root.join("etc/hosts.orig").exists());
    image.release().unwrap();
}

#[test]
fn failed_mount_is_not_tracked() {
    let ws = Workspace::new();
    let host = Arc::new(MockHost::new().with_partitions(3).fail_on("mount /dev/mapper/loop0p2"));
    let image = ws.open("3", &host);

    let err = image.parse().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::DeviceFailure);
    assert_eq!(image.amount_of_mappers(), 1);

    image.release().unwrap();
    assert_eq!(host.commands_for("umount").len(), 1);
    assert!(host.bound_devices().is_empty());
}
