mod commands;
mod populate;

use clap::{Parser, Subcommand};
use clap_complete::Shell;
use commands::customize::CustomizeArgs;
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Debug, Parser)]
#[command(
    name = "vaimage",
    version,
    about = "Build and customize partitioned virtual appliance disk images"
)]
struct Cli {
    /// Output results as structured JSON.
    #[arg(long, default_value_t = false, global = true)]
    json: bool,

    /// Enable verbose (debug) logging output.
    #[arg(short, long, default_value_t = false, global = true)]
    verbose: bool,

    /// Enable trace-level logging (more detailed than --verbose).
    #[arg(long, default_value_t = false, global = true)]
    trace: bool,

    /// Record block-device, package and service commands instead of running
    /// them. Image files and mount directories are still created.
    #[arg(long, default_value_t = false, global = true)]
    simulate: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Build or refresh a disk image from a build configuration.
    Build {
        /// Path to the build configuration file.
        #[arg(long, default_value = "vaimage.toml")]
        config: PathBuf,
    },
    /// Mount an existing image and apply platform descriptors to it.
    Customize {
        /// Raw disk image to customize.
        #[arg(long)]
        image: PathBuf,
        /// Directory the image root is mounted on.
        #[arg(long)]
        mount_dir: PathBuf,
        /// Topology descriptor (XML) the image was built with.
        #[arg(long)]
        topology: PathBuf,
        /// Topology type identifier inside the descriptor.
        #[arg(long = "type")]
        type_id: String,
        /// Directory holding packages.xml, inject_items.xml, services.xml
        /// and files_content.xml.
        #[arg(long)]
        platform_dir: PathBuf,
    },
    /// List the topologies of a topology descriptor.
    Topologies {
        /// Topology descriptor (XML).
        file: PathBuf,
    },
    /// Run diagnostic checks on the host.
    Doctor,
    /// Generate shell completions for bash, zsh, fish, elvish, or powershell.
    Completions {
        /// Shell to generate completions for.
        shell: Shell,
    },
}

fn main() -> ExitCode {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        let msg = info.to_string();
        if msg.contains("Broken pipe")
            || msg.contains("broken pipe")
            || msg.contains("os error 32")
            || msg.contains("failed printing to stdout")
        {
            std::process::exit(0);
        }
        default_hook(info);
    }));

    let cli = Cli::parse();

    let default_level = if cli.trace {
        "trace"
    } else if cli.verbose {
        "debug"
    } else {
        "warn"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_env("VAIMAGE_LOG")
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .without_time()
        .init();

    let json_output = cli.json;
    let simulate = cli.simulate;

    let needs_devices = matches!(
        cli.command,
        Commands::Build { .. } | Commands::Customize { .. }
    );
    if needs_devices
        && !simulate
        && std::env::var("VAIMAGE_SKIP_PREREQS").as_deref() != Ok("1")
    {
        if let Err(failure) = commands::require_host_tools(&vaimage_runtime::SystemHost::new()) {
            eprintln!("error: {failure}");
            return ExitCode::from(failure.code);
        }
    }

    let result = match cli.command {
        Commands::Build { config } => commands::build::run(&config, json_output, simulate),
        Commands::Customize {
            image,
            mount_dir,
            topology,
            type_id,
            platform_dir,
        } => commands::customize::run(
            &CustomizeArgs {
                image: &image,
                mount_dir: &mount_dir,
                topology: &topology,
                type_id: &type_id,
                platform_dir: &platform_dir,
            },
            json_output,
            simulate,
        ),
        Commands::Topologies { file } => commands::topologies::run(&file, json_output),
        Commands::Doctor => commands::doctor::run(json_output),
        Commands::Completions { shell } => commands::completions::run::<Cli>(shell),
    };

    match result {
        Ok(code) => ExitCode::from(code),
        Err(failure) => {
            eprintln!("error: {failure}");
            ExitCode::from(failure.code)
        }
    }
}
