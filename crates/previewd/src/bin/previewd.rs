use clap::{Args, Parser, Subcommand};
use previewd::config::{read_rc, ProjectConfig};
use previewd::serve::{run_serve, ServeOptions};
use previewd::{companion, simulator, Result};
use std::path::PathBuf;
use std::process;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "previewd",
    version,
    about = "SwiftUI live-preview backend for headless simulators"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the multi-stream backend: JSON commands on stdin, events on stdout
    Serve(ServeArgs),
    /// Manage simulators in the previewd device set
    Devices {
        #[command(subcommand)]
        command: DeviceCommands,
    },
}

#[derive(Args)]
struct ServeArgs {
    /// Path to the .xcodeproj (or PROJECT in .axerc)
    #[arg(long)]
    project: Option<PathBuf>,
    /// Path to the .xcworkspace (or WORKSPACE in .axerc)
    #[arg(long)]
    workspace: Option<PathBuf>,
    /// Xcode scheme to build (or SCHEME in .axerc)
    #[arg(long)]
    scheme: Option<String>,
    /// Build configuration, e.g. Debug or Release (or CONFIGURATION in .axerc)
    #[arg(long)]
    configuration: Option<String>,
    /// Simulator UDID to prefer (or DEVICE in .axerc)
    #[arg(long)]
    device: Option<String>,
    /// Skip xcodebuild and reuse artifacts from a previous build
    #[arg(long)]
    reuse_build: bool,
}

#[derive(Subcommand)]
enum DeviceCommands {
    /// List devices in the previewd device set
    List,
    /// List device types with at least one available runtime
    ListAvailable,
    /// Create a device from a device type and runtime identifier
    Add {
        device_type_id: String,
        runtime_id: String,
    },
    /// Delete a device from the set
    Remove { udid: String },
    /// Remember a device as the default for new streams
    SetDefault { udid: String },
}

#[tokio::main]
async fn main() {
    // stdout carries the event protocol; all logging goes to stderr.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    if let Err(err) = run(Cli::parse()).await {
        eprintln!("Error: {}", err);
        process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Serve(args) => serve(args).await,
        Commands::Devices { command } => devices(command).await,
    }
}

async fn serve(args: ServeArgs) -> Result<()> {
    let cwd = std::env::current_dir()?;
    let rc = read_rc(&cwd);
    let rc_path = |key: &str| rc.get(key).map(PathBuf::from);

    let config = ProjectConfig::new(
        args.project.or_else(|| rc_path("PROJECT")),
        args.workspace.or_else(|| rc_path("WORKSPACE")),
        args.scheme
            .or_else(|| rc.get("SCHEME").cloned())
            .unwrap_or_default(),
        args.configuration.or_else(|| rc.get("CONFIGURATION").cloned()),
    )?;
    let default_device = args.device.or_else(|| rc.get("DEVICE").cloned());

    // Headless boot and frame streaming both need the companion; fail
    // before accepting any command.
    companion::check_companion()?;
    simulator::device_set_path()?;

    eprintln!(
        "[Serve] backend ready for scheme {} ({})",
        config.scheme,
        config.configuration_or_default()
    );
    run_serve(ServeOptions {
        config,
        reuse_build: args.reuse_build,
        default_device,
    })
    .await
}

async fn devices(command: DeviceCommands) -> Result<()> {
    match command {
        DeviceCommands::List => {
            let devices = simulator::list().await?;
            let default = simulator::get_default()?;
            if devices.is_empty() {
                println!("no devices in the previewd device set");
                return Ok(());
            }
            for device in devices {
                let marker = if default.as_deref() == Some(device.udid.as_str()) {
                    "*"
                } else {
                    " "
                };
                println!(
                    "{} {}  {}  {}  {}",
                    marker,
                    device.udid,
                    device.name,
                    device.state,
                    simulator::human_readable_runtime(&device.runtime),
                );
            }
        }
        DeviceCommands::ListAvailable => {
            for device_type in simulator::list_available().await? {
                let runtimes: Vec<&str> = device_type
                    .runtimes
                    .iter()
                    .map(|rt| rt.name.as_str())
                    .collect();
                println!(
                    "{}  {}  [{}]",
                    device_type.identifier,
                    device_type.name,
                    runtimes.join(", ")
                );
            }
        }
        DeviceCommands::Add {
            device_type_id,
            runtime_id,
        } => {
            let udid = simulator::add(&device_type_id, &runtime_id).await?;
            println!("{}", udid);
        }
        DeviceCommands::Remove { udid } => {
            simulator::remove(&udid).await?;
        }
        DeviceCommands::SetDefault { udid } => {
            simulator::set_default(&udid)?;
        }
    }
    Ok(())
}
