//! Command server for one fluorescence-reading PCR instrument.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use tracing::{error, info, info_span, Instrument};

use pcr_runner::config::{RunnerConfig, DEFAULT_CONFIG_PATH};
use pcr_runner::instrument::camera::no_camera_driver;
use pcr_runner::logging;
use pcr_runner::server::{Hardware, Runner};

#[derive(Parser)]
#[command(name = "pcr_runner")]
#[command(about = "LED/camera acquisition runner for a HelloPCR instrument")]
#[command(version)]
struct Cli {
    /// 5-character instrument serial number
    #[arg(value_parser = parse_serial)]
    serial: String,

    /// TCP port (overrides the configuration file)
    #[arg(short, long)]
    port: Option<u16>,

    /// Replace the hardware with a simulated controller and RFU curve
    #[arg(short = 'e', visible_short_alias = 'E', long)]
    emulate: bool,

    /// Configuration file
    #[arg(short, long, value_name = "PATH", default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,
}

fn parse_serial(value: &str) -> Result<String, String> {
    if value.chars().count() != 5 {
        return Err("Serial number must be 5 characters".to_string());
    }
    Ok(value.to_string())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = RunnerConfig::load_from(&cli.config)
        .with_context(|| format!("Failed to load {}", cli.config.display()))?;
    if let Some(port) = cli.port {
        config.server.port = port;
    }

    let instrument_id = config.instrument.instrument_id(&cli.serial);
    let instrument_dir = config.instrument.instrument_dir(&instrument_id);
    let log_file = logging::init(&config.logging, &instrument_dir)?;

    let span = info_span!("instrument", id = %instrument_id);
    async move {
        if let Some(path) = log_file {
            info!("Logging to {}", path.display());
        }

        let hardware = if cli.emulate {
            Hardware::Emulated
        } else {
            Hardware::Physical(Box::new(no_camera_driver))
        };
        let runner = Runner::start(config, &instrument_id, hardware).await;
        let listener = runner.bind().await?;

        tokio::select! {
            result = runner.serve(listener) => {
                if let Err(e) = result {
                    error!("Server failed: {}", e);
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Keyboard interrupt");
            }
        }

        runner.close().await;
        Ok::<(), anyhow::Error>(())
    }
    .instrument(span)
    .await
}
