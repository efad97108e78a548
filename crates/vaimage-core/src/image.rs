use crate::concurrency::{self, InterruptGuard, ReleaseHook};
use crate::customize::{self, CustomizeReport};
use crate::discovery::{discover_mappers, DiscoveryPolicy};
use crate::CoreError;
use std::fs::{self, OpenOptions};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, info, warn};
use vaimage_runtime::fsutil;
use vaimage_runtime::{is_mounted, run_checked, Host, ToolCommand};
use vaimage_schema::{Partition, Topology};

/// A partition node mounted inside the image root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MapperDevice {
    pub device: PathBuf,
    pub mount_point: PathBuf,
}

/// Live block-device state of a bound image.
///
/// `mappers` holds exactly the mounted partitions, in mount order. Entries are
/// pushed after a successful mount and popped after a successful unmount.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoopDevice {
    path: Option<PathBuf>,
    mappers: Vec<MapperDevice>,
}

impl LoopDevice {
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn mappers(&self) -> &[MapperDevice] {
        &self.mappers
    }

    pub fn amount_of_mappers(&self) -> usize {
        self.mappers.len()
    }
}

/// The part of an image shared with the interrupt handler.
struct Binding {
    image_path: PathBuf,
    root_mount: PathBuf,
    host: Arc<dyn Host>,
    device: Mutex<LoopDevice>,
}

impl Binding {
    fn lock(&self) -> MutexGuard<'_, LoopDevice> {
        self.device.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn teardown(&self) -> Result<(), CoreError> {
        let mut device = self.lock();
        let host = self.host.as_ref();

        while let Some(mapper) = device.mappers.last().cloned() {
            let table = host.mount_table()?;
            if is_mounted(&table, &mapper.device, &mapper.mount_point) {
                run_checked(
                    host,
                    &ToolCommand::new("umount")
                        .arg("-l")
                        .path_arg(&mapper.mount_point),
                )?;
                debug!("unmounted {}", mapper.mount_point.display());
            } else {
                debug!("{} is no longer mounted", mapper.mount_point.display());
            }
            device.mappers.pop();
        }

        if fsutil::path_exists(&self.root_mount) {
            fsutil::remove_path(&self.root_mount)
                .map_err(CoreError::fs("remove", &self.root_mount))?;
        }

        if let Some(loop_device) = device.path.clone() {
            run_checked(host, &ToolCommand::new("kpartx").arg("-d").path_arg(&loop_device))?;
            run_checked(host, &ToolCommand::new("losetup").arg("-d").path_arg(&loop_device))?;
            device.path = None;
            info!(
                "released {} from {}",
                self.image_path.display(),
                loop_device.display()
            );
        }
        Ok(())
    }
}

impl ReleaseHook for Binding {
    fn describe(&self) -> String {
        self.image_path.display().to_string()
    }

    fn release(&self) -> Result<(), CoreError> {
        self.teardown()
    }
}

/// A raw disk image and the block-device stack built on top of it.
pub struct Image {
    binding: Arc<Binding>,
    topology: Topology,
    needs_partitioning: bool,
    policy: DiscoveryPolicy,
}

impl Image {
    /// Open `raw_image`, allocating a sparse file of the topology's disk size
    /// when it does not exist yet. A freshly allocated image is partitioned and
    /// formatted by [`Image::parse`]; an existing one is only mounted.
    pub fn open(
        raw_image: impl Into<PathBuf>,
        root_mount: impl Into<PathBuf>,
        topology: Topology,
        host: Arc<dyn Host>,
    ) -> Result<Self, CoreError> {
        let image_path = raw_image.into();
        let needs_partitioning = match fs::metadata(&image_path) {
            Ok(meta) if meta.is_dir() => {
                return Err(CoreError::Fs {
                    op: "open image",
                    path: image_path,
                    source: std::io::Error::new(ErrorKind::InvalidInput, "is a directory"),
                });
            }
            Ok(_) => false,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                allocate_sparse(&image_path, topology.disk_size_bytes())?;
                true
            }
            Err(e) => {
                return Err(CoreError::Fs {
                    op: "stat",
                    path: image_path,
                    source: e,
                })
            }
        };

        Ok(Self {
            binding: Arc::new(Binding {
                image_path,
                root_mount: root_mount.into(),
                host,
                device: Mutex::new(LoopDevice::default()),
            }),
            topology,
            needs_partitioning,
            policy: DiscoveryPolicy::default(),
        })
    }

    #[must_use]
    pub fn with_discovery_policy(mut self, policy: DiscoveryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn image_path(&self) -> &Path {
        &self.binding.image_path
    }

    pub fn root_mount(&self) -> &Path {
        &self.binding.root_mount
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    pub fn needs_partitioning(&self) -> bool {
        self.needs_partitioning
    }

    pub fn loop_device(&self) -> Option<PathBuf> {
        self.binding.lock().path.clone()
    }

    pub fn mappers(&self) -> Vec<MapperDevice> {
        self.binding.lock().mappers.clone()
    }

    pub fn amount_of_mappers(&self) -> usize {
        self.binding.lock().amount_of_mappers()
    }

    fn host(&self) -> &dyn Host {
        self.binding.host.as_ref()
    }

    /// Bind the image to the next free loop device, then either partition,
    /// format and mount it (fresh image) or mount its existing partitions.
    pub fn parse(&self) -> Result<(), CoreError> {
        let mut device = self.binding.lock();
        if let Some(bound) = &device.path {
            return Err(CoreError::AlreadyParsed {
                image: self.binding.image_path.clone(),
                device: bound.clone(),
            });
        }

        let loop_device = self.bind()?;
        device.path = Some(loop_device.clone());

        if self.needs_partitioning {
            self.write_partition_table(&loop_device)?;
        }
        let nodes = self.discover(&loop_device)?;

        for (partition, node) in self.topology.partitions.iter().zip(&nodes) {
            if self.needs_partitioning {
                self.format(partition, node)?;
            }
            if let Some(mount_point) = &partition.mount_point {
                self.add_mapper(&mut device, node, mount_point)?;
            }
        }
        info!(
            "{} bound to {} with {} mounted partition(s)",
            self.binding.image_path.display(),
            loop_device.display(),
            device.mappers.len()
        );
        Ok(())
    }

    fn bind(&self) -> Result<PathBuf, CoreError> {
        let host = self.host();
        let free = run_checked(host, &ToolCommand::new("losetup").arg("-f"))?;
        let loop_device = free.stdout.trim();
        if loop_device.is_empty() {
            return Err(CoreError::Device("no free loop device".to_owned()));
        }
        let loop_device = PathBuf::from(loop_device);
        run_checked(
            host,
            &ToolCommand::new("losetup")
                .path_arg(&loop_device)
                .path_arg(&self.binding.image_path),
        )?;
        debug!(
            "bound {} to {}",
            self.binding.image_path.display(),
            loop_device.display()
        );
        Ok(loop_device)
    }

    fn write_partition_table(&self, loop_device: &Path) -> Result<(), CoreError> {
        let cmd = ToolCommand::new("fdisk")
            .path_arg(loop_device)
            .stdin(self.topology.partitioning_script());
        let output = self.host().execute(&cmd)?;
        if !output.success() {
            // fdisk commonly fails to re-read the table of a loop device even
            // though the table was written; kpartx reads it from the image.
            warn!(
                "'{cmd}' exited with {:?}: {}",
                output.code,
                output.combined()
            );
        }
        Ok(())
    }

    fn discover(&self, loop_device: &Path) -> Result<Vec<PathBuf>, CoreError> {
        let declared = self.topology.partitions.len();
        let nodes = discover_mappers(self.host(), loop_device, declared, &self.policy)?;
        if nodes.len() != declared {
            return Err(CoreError::PartitionMismatch {
                declared,
                actual: nodes.len(),
            });
        }
        Ok(nodes)
    }

    fn format(&self, partition: &Partition, node: &Path) -> Result<(), CoreError> {
        let cmd = if partition.is_swap() {
            ToolCommand::new("mkswap")
                .arg("-L")
                .arg(partition.label.as_str())
                .path_arg(node)
        } else {
            ToolCommand::new("mkfs")
                .args(["-t", partition.file_system.as_str()])
                .args(["-L", partition.label.as_str()])
                .args(partition.file_system_args.iter().cloned())
                .path_arg(node)
        };
        run_checked(self.host(), &cmd)?;
        debug!("formatted {} as {}", node.display(), partition.file_system);
        Ok(())
    }

    /// Mount `node` at `mount_point` under the image root and register it.
    fn add_mapper(
        &self,
        device: &mut LoopDevice,
        node: &Path,
        mount_point: &str,
    ) -> Result<(), CoreError> {
        let target = within_root(&self.binding.root_mount, mount_point);
        fsutil::ensure_dir(&target, 0o755, None, None).map_err(CoreError::fs("create", &target))?;

        let table = self.host().mount_table()?;
        if is_mounted(&table, node, &target) {
            debug!("{} already mounted", target.display());
        } else {
            run_checked(
                self.host(),
                &ToolCommand::new("mount").path_arg(node).path_arg(&target),
            )?;
        }
        device.mappers.push(MapperDevice {
            device: node.to_path_buf(),
            mount_point: target,
        });
        Ok(())
    }

    /// Apply the customization descriptors found in `platform_dir` to the
    /// mounted root.
    pub fn customize(&self, platform_dir: &Path) -> Result<CustomizeReport, CoreError> {
        if self.amount_of_mappers() == 0 {
            return Err(CoreError::NotParsed(self.binding.image_path.clone()));
        }
        customize::customize(self.host(), &self.binding.root_mount, platform_dir)
    }

    /// Unmount every partition in reverse order, remove the root mount
    /// directory, drop the partition mappings and detach the loop device.
    /// Calling it again after success does nothing.
    pub fn release(&self) -> Result<(), CoreError> {
        self.binding.teardown()
    }

    /// Release this image from the SIGINT / SIGTERM / SIGHUP handler as well.
    /// The registration lasts until the returned guard is dropped.
    pub fn release_on_interrupt(&self) -> InterruptGuard {
        let hook: Arc<dyn ReleaseHook> = self.binding.clone();
        concurrency::release_on_interrupt(&hook)
    }
}

/// `path` interpreted relative to `root`, whether or not it starts with `/`.
pub(crate) fn within_root(root: &Path, path: &str) -> PathBuf {
    let relative = path.trim_start_matches('/');
    if relative.is_empty() {
        root.to_path_buf()
    } else {
        root.join(relative)
    }
}

fn allocate_sparse(path: &Path, size: u64) -> Result<(), CoreError> {
    let file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .map_err(CoreError::fs("create image", path))?;
    file.set_len(size)
        .map_err(CoreError::fs("allocate image", path))?;
    info!(
        "allocated {} ({} bytes, sparse)",
        path.display(),
        size
    );
    Ok(())
}

/// Install legacy GRUB into the MBR of `image` by driving the GRUB shell.
pub fn make_bootable(host: &dyn Host, grub: &Path, image: &Path) -> Result<(), CoreError> {
    let script = format!(
        "device (hd0) {}\nroot (hd0,0)\nsetup (hd0)\n",
        image.display()
    );
    run_checked(
        host,
        &ToolCommand::new(grub.to_string_lossy()).stdin(script),
    )?;
    info!("installed boot loader into {}", image.display());
    Ok(())
}
