use super::{json_pretty, print_recorded, with_spinner, Failure, HostChoice, EXIT_SUCCESS};
use vaimage_core::{customize_image, DiscoveryPolicy, ImageLock, PassOutcome};
use vaimage_schema::parse_platforms_file;
use std::path::Path;

pub struct CustomizeArgs<'a> {
    pub image: &'a Path,
    pub mount_dir: &'a Path,
    pub topology: &'a Path,
    pub type_id: &'a str,
    pub platform_dir: &'a Path,
}

pub fn run(args: &CustomizeArgs<'_>, json: bool, simulate: bool) -> Result<u8, Failure> {
    let topology = parse_platforms_file(args.topology)?.topology_for_type(args.type_id)?;
    let _lock = ImageLock::try_acquire(args.image)?;
    let choice = HostChoice::new(simulate);

    let report = with_spinner(
        json,
        "customizing image...",
        "image customized",
        "customization failed",
        || {
            customize_image(
                topology,
                args.image,
                args.mount_dir,
                args.platform_dir,
                choice.host(),
                DiscoveryPolicy::default(),
            )
        },
    )?;

    if json {
        let payload = serde_json::json!({
            "image": args.image,
            "passes": report,
            "simulated_commands": choice.recorded(),
        });
        println!("{}", json_pretty(&payload)?);
    } else {
        for (pass, outcome) in [
            ("packages", report.packages),
            ("inject items", report.inject_items),
            ("services", report.services),
            ("file content", report.files_content),
        ] {
            match outcome {
                PassOutcome::Skipped => println!("{pass}: skipped"),
                PassOutcome::Applied(n) => println!("{pass}: {n} applied"),
            }
        }
        print_recorded(&choice);
    }
    Ok(EXIT_SUCCESS)
}
