use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use parking::{CarparkConfig, ServeArgs, ServerConfig, telemetry};
use tracing::info;

use crate::backends::{DetectorBackend, SourceBackend};

#[derive(Debug, Parser)]
#[command(name = "smart-parking", version, about = "Car park stall occupancy from CCTV feeds")]
pub struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the camera workers, aggregator and preview server.
    Serve(ServeArgs),
    /// Check a camera config file and print the devices it needs.
    ValidateConfig {
        #[arg(value_name = "PATH", default_value = "./configs/camera_config.json")]
        path: PathBuf,
    },
}

pub fn run() -> Result<()> {
    match Cli::parse().command {
        Command::Serve(args) => serve(args),
        Command::ValidateConfig { path } => validate_config(path),
    }
}

fn serve(args: ServeArgs) -> Result<()> {
    let config = ServerConfig::try_from(args)?;
    let _telemetry = telemetry::init(&config.telemetry)?;
    telemetry::init_metrics_recorder();

    let sources = SourceBackend;
    let detectors = DetectorBackend::new(config.model_path.clone(), config.confidence_threshold);
    parking::run(config, &sources, &detectors)
}

fn validate_config(path: PathBuf) -> Result<()> {
    let carpark = CarparkConfig::load(&path)?;
    println!("{}: {} camera(s)", path.display(), carpark.cameras.len());
    for (index, camera) in carpark.cameras.iter().enumerate() {
        println!(
            "  #{index} {} [{}] on {} <- {}",
            camera.address, camera.analytics, camera.device, camera.path
        );
    }
    println!("devices: {}", carpark.devices.join(", "));
    info!(cameras = carpark.cameras.len(), "Camera config is valid");
    Ok(())
}
