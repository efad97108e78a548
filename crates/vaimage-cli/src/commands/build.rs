use super::{
    json_pretty, print_recorded, with_spinner, Failure, HostChoice, EXIT_CONFIG_ERROR, EXIT_SUCCESS,
};
use crate::populate::TreePopulator;
use vaimage_core::{build_image, BuildOptions, DiscoveryPolicy, ImageLock};
use vaimage_schema::{parse_config_file, parse_platforms_file};
use std::path::Path;

pub fn run(config: &Path, json: bool, simulate: bool) -> Result<u8, Failure> {
    if !config.is_file() {
        return Err(Failure::new(
            EXIT_CONFIG_ERROR,
            format!("config file {} not found", config.display()),
        ));
    }
    let resolved = parse_config_file(config)?;
    let topology =
        parse_platforms_file(&resolved.topology_file)?.topology_for_type(&resolved.topology_type)?;

    let _lock = ImageLock::try_acquire(&resolved.image_path)?;
    let choice = HostChoice::new(simulate);
    let filler = TreePopulator::new(
        resolved.rootfs_source.clone(),
        resolved.install_script.clone(),
        choice.host(),
    );
    let options = BuildOptions {
        discovery: DiscoveryPolicy::from_millis(resolved.settle_ms, resolved.max_polls),
        grub: resolved.grub.clone(),
    };

    let report = with_spinner(json, "building image...", "image built", "build failed", || {
        build_image(
            &filler,
            topology,
            &resolved.image_path,
            &resolved.mount_dir,
            resolved.platform_dir.as_deref(),
            choice.host(),
            &options,
        )
    })?;

    if json {
        let payload = serde_json::json!({
            "report": report,
            "simulated_commands": choice.recorded(),
        });
        println!("{}", json_pretty(&payload)?);
    } else {
        let action = if report.created { "created" } else { "refreshed" };
        println!(
            "{action} {} (topology '{}', {} mounted partition(s))",
            report.image.display(),
            report.topology,
            report.mounted_partitions
        );
        if report.bootable {
            println!("boot loader installed");
        }
        print_recorded(&choice);
    }
    Ok(EXIT_SUCCESS)
}
