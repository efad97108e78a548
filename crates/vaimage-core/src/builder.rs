use crate::concurrency::shutdown_requested;
use crate::customize::CustomizeReport;
use crate::discovery::DiscoveryPolicy;
use crate::image::{make_bootable, Image};
use crate::CoreError;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info};
use vaimage_runtime::Host;
use vaimage_schema::Topology;

/// Populates the mounted image root.
pub trait Rootfs {
    /// Lay down the base filesystem under `root`.
    fn make_rootfs(&self, root: &Path) -> Result<(), CoreError>;

    /// Install the appliance payload after customization.
    fn install_app(&self, root: &Path) -> Result<(), CoreError>;
}

#[derive(Debug, Clone, Default)]
pub struct BuildOptions {
    pub discovery: DiscoveryPolicy,
    /// Legacy GRUB shell to install a boot loader with once the image is
    /// released.
    pub grub: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BuildReport {
    pub image: PathBuf,
    pub topology: String,
    /// The image file did not exist and was partitioned and formatted.
    pub created: bool,
    pub mounted_partitions: usize,
    pub customize: Option<CustomizeReport>,
    pub bootable: bool,
}

/// Build (or refresh) a disk image.
///
/// The image is opened, bound and mounted, populated by `filler`, customized
/// from `platform_dir` when one is given, and released again. Release runs
/// exactly once after a successful open, whatever happened in between.
pub fn build_image(
    filler: &dyn Rootfs,
    topology: Topology,
    raw_image: &Path,
    root_mount: &Path,
    platform_dir: Option<&Path>,
    host: Arc<dyn Host>,
    options: &BuildOptions,
) -> Result<BuildReport, CoreError> {
    info!(
        "building {} with topology {} ({})",
        raw_image.display(),
        topology.type_id,
        topology.name
    );
    let topology_name = topology.name.clone();
    let image = Image::open(raw_image, root_mount, topology, Arc::clone(&host))?
        .with_discovery_policy(options.discovery);
    let created = image.needs_partitioning();

    let (mounted_partitions, customize) =
        with_released(&image, || {
            run_steps(&image, filler, platform_dir, shutdown_requested)
        })?;

    let bootable = match &options.grub {
        Some(grub) => {
            make_bootable(host.as_ref(), grub, raw_image)?;
            true
        }
        None => false,
    };

    info!("built {}", raw_image.display());
    Ok(BuildReport {
        image: raw_image.to_path_buf(),
        topology: topology_name,
        created,
        mounted_partitions,
        customize,
        bootable,
    })
}

/// Mount an existing image, apply the descriptors in `platform_dir` and
/// release it again.
pub fn customize_image(
    topology: Topology,
    raw_image: &Path,
    root_mount: &Path,
    platform_dir: &Path,
    host: Arc<dyn Host>,
    discovery: DiscoveryPolicy,
) -> Result<CustomizeReport, CoreError> {
    if !raw_image.is_file() {
        return Err(CoreError::Config(format!(
            "image {} does not exist",
            raw_image.display()
        )));
    }
    let image =
        Image::open(raw_image, root_mount, topology, host)?.with_discovery_policy(discovery);
    with_released(&image, || {
        checkpoint(shutdown_requested)?;
        image.parse()?;
        checkpoint(shutdown_requested)?;
        image.customize(platform_dir)
    })
}

/// Run `steps` while `image` is registered for interrupt teardown, then
/// release it. A release failure is fatal only when the steps succeeded.
fn with_released<T>(
    image: &Image,
    steps: impl FnOnce() -> Result<T, CoreError>,
) -> Result<T, CoreError> {
    let guard = image.release_on_interrupt();
    let outcome = steps();
    let released = image.release();
    drop(guard);

    match (outcome, released) {
        (Ok(value), Ok(())) => Ok(value),
        (Ok(_), Err(e)) => Err(CoreError::TeardownFailed(Box::new(e))),
        (Err(e), Ok(())) => Err(e),
        (Err(e), Err(release_err)) => {
            error!(
                "failed to release {} after error: {release_err}",
                image.image_path().display()
            );
            Err(e)
        }
    }
}

fn run_steps(
    image: &Image,
    filler: &dyn Rootfs,
    platform_dir: Option<&Path>,
    interrupted: fn() -> bool,
) -> Result<(usize, Option<CustomizeReport>), CoreError> {
    let root = image.root_mount();

    // The handler may fire after registration but before anything is bound.
    checkpoint(interrupted)?;
    image.parse()?;
    let mounted = image.amount_of_mappers();

    checkpoint(interrupted)?;
    filler.make_rootfs(root)?;

    checkpoint(interrupted)?;
    let report = match platform_dir {
        Some(dir) => Some(image.customize(dir)?),
        None => None,
    };

    checkpoint(interrupted)?;
    filler.install_app(root)?;
    Ok((mounted, report))
}

fn checkpoint(interrupted: fn() -> bool) -> Result<(), CoreError> {
    if interrupted() {
        return Err(CoreError::Interrupted);
    }
    Ok(())
}
