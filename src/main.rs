//! CLI Entry Point for hcsr04
//!
//! Attaches the sensors listed in the configuration file and either lists
//! them or reads distances from one of them.
//!
//! # Usage
//!
//! ```bash
//! hcsr04 --config config/hcsr04.toml list --json
//! hcsr04 read 0 --samples 5 --interval-ms 200
//! ```
//!
//! Without the `rpi` feature (or with `backend = "simulated"`) every sensor
//! is simulated and answers with `--simulate-mm`.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use hcsr04_daq::config::{Backend, SonarConfig, DEFAULT_CONFIG_PATH};
use hcsr04_daq::driver::SonarDriver;
use hcsr04_daq::hal::{AsyncDistanceSensor, DistanceReadable};
use hcsr04_daq::hardware::mock::{EchoResponse, SimulatedLines};
use hcsr04_daq::hardware::LineProvider;
use hcsr04_daq::tracing_setup;
use tracing::{debug, info};

#[derive(Parser)]
#[command(name = "hcsr04")]
#[command(about = "HC-SR04 ultrasonic ranging driver", long_about = None)]
struct Cli {
    /// Configuration file
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Echo distance answered by simulated sensors (mm)
    #[arg(long, global = true, default_value_t = 1000)]
    simulate_mm: i64,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List attached sensors
    List {
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },

    /// Read distances from one sensor
    Read {
        /// Slot number of the sensor
        minor: u32,

        /// Number of readings
        #[arg(long, default_value_t = 1)]
        samples: u32,

        /// Pause between readings
        #[arg(long, default_value_t = 100)]
        interval_ms: u64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = SonarConfig::load_from(&cli.config)
        .with_context(|| format!("Failed to load {}", cli.config.display()))?;
    tracing_setup::init_from_config(&config).map_err(anyhow::Error::msg)?;
    info!(name = %config.application.name, backend = ?config.backend, "Starting");

    let driver = SonarDriver::from_config(&config)?;
    let mut lines = line_provider(config.backend, cli.simulate_mm)?;
    for (node, result) in driver.attach_configured(&config, lines.as_mut()) {
        match result {
            Ok(number) => debug!(%node, %number, "Attached"),
            Err(e) => eprintln!("{node}: not attached: {e}"),
        }
    }

    match cli.command {
        Commands::List { json } => list(&driver, json),
        Commands::Read {
            minor,
            samples,
            interval_ms,
        } => read(&driver, minor, samples, Duration::from_millis(interval_ms)).await,
    }
}

fn line_provider(backend: Backend, simulate_mm: i64) -> Result<Box<dyn LineProvider>> {
    match backend {
        Backend::Simulated => Ok(Box::new(SimulatedLines::new(EchoResponse::distance_mm(
            simulate_mm,
        )))),
        #[cfg(feature = "rpi")]
        Backend::Rpi => Ok(Box::new(hcsr04_daq::hardware::rpi::RpiLines)),
        #[cfg(not(feature = "rpi"))]
        Backend::Rpi => bail!("backend \"rpi\" requires building with --features rpi"),
    }
}

fn list(driver: &SonarDriver, json: bool) -> Result<()> {
    let devices = driver.devices();
    if json {
        println!("{}", serde_json::to_string_pretty(&devices)?);
        return Ok(());
    }

    if devices.is_empty() {
        println!("No sensors attached");
        return Ok(());
    }
    println!("{:<10} {:<8} {:<16} LABEL", "NODE", "DEVICE", "PHYSICAL");
    for device in devices {
        println!(
            "{:<10} {:<8} {:<16} {}",
            device.node,
            device.identity.to_string(),
            device.physical.as_str(),
            device.label
        );
    }
    Ok(())
}

async fn read(driver: &SonarDriver, minor: u32, samples: u32, interval: Duration) -> Result<()> {
    if samples == 0 {
        bail!("--samples must be at least 1");
    }
    let handle = driver
        .open_minor(minor)
        .with_context(|| format!("Cannot open hcsr04-{minor}"))?;
    let sensor = AsyncDistanceSensor::new(handle);

    for i in 0..samples {
        if i > 0 {
            tokio::time::sleep(interval).await;
        }
        match sensor.read_distance_mm().await {
            Ok(mm) => println!("distance: {mm} [mm]"),
            Err(e) => eprintln!("read failed: {e:#}"),
        }
    }
    Ok(())
}
