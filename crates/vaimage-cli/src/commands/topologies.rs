use super::{json_pretty, Failure, EXIT_SUCCESS};
use vaimage_schema::parse_platforms_file;
use std::path::Path;

pub fn run(file: &Path, json: bool) -> Result<u8, Failure> {
    let topologies = parse_platforms_file(file)?.normalize()?;

    if json {
        println!("{}", json_pretty(&topologies)?);
        return Ok(EXIT_SUCCESS);
    }
    if topologies.is_empty() {
        println!("no topologies in {}", file.display());
        return Ok(EXIT_SUCCESS);
    }
    println!(
        "{:<6} {:<24} {:>6} {:>8} {:>5}  PARTITIONS",
        "TYPE", "NAME", "DISK", "RAM", "CPUS"
    );
    for t in &topologies {
        let layout: Vec<String> = t
            .partitions
            .iter()
            .map(|p| {
                format!(
                    "{}:{}M",
                    p.mount_point.as_deref().unwrap_or("swap"),
                    p.size_mb
                )
            })
            .collect();
        println!(
            "{:<6} {:<24} {:>5}G {:>7}M {:>5}  {}",
            t.type_id.as_str(),
            t.name,
            t.hdd_size_gb,
            t.ram_size_mb,
            t.cpus,
            layout.join(" ")
        );
    }
    Ok(EXIT_SUCCESS)
}
