//! `raster_daq` command-line front end.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use raster_daq::config::{Settings, DEFAULT_CONFIG_PATH};
use raster_daq::data::{export_stack, load_raster_archive, FrameSelection, LoadOptions};
use raster_daq::hardware::MockScanHead;
use raster_daq::{AcquisitionOrchestrator, AcquisitionReport, Operation, ScanRequest};

/// Command line arguments
#[derive(Parser, Debug)]
#[command(name = "raster_daq")]
#[command(about = "Galvo raster-scan acquisition and decoding", long_about = None)]
struct Args {
    /// Configuration file (TOML); RASTERDAQ_* environment variables override it
    #[arg(long, value_name = "PATH", default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Acquire raster frames with the configured scan parameters
    Scan {
        /// Frames to acquire
        #[arg(long, default_value_t = 1)]
        frames: usize,
        /// Destination of the returned archive
        #[arg(long, value_name = "FILE")]
        output: Option<PathBuf>,
        /// Live focus frame
        #[arg(long)]
        focus: bool,
        /// Regenerate waveforms even if unchanged
        #[arg(long)]
        force: bool,
        /// Also return stage position data
        #[arg(long)]
        position_data: bool,
    },
    /// Send a one-way named command, e.g. CloseShutter
    Command {
        /// Command name
        name: String,
    },
    /// Load photometry waveforms for a later trigger
    ArmPhotometry {
        /// Ask for position data with the photometry episode
        #[arg(long)]
        position_data: bool,
    },
    /// Short photometry sweep at a spot, printing the mean responses
    TestPhotometry {
        /// Spot X (V)
        #[arg(long, allow_hyphen_values = true)]
        x: f64,
        /// Spot Y (V)
        #[arg(long, allow_hyphen_values = true)]
        y: f64,
    },
    /// Decode a returned raster archive
    Decode {
        /// `.gsi` archive
        file: PathBuf,
        /// Post-hoc lag adjustment in pixels
        #[arg(long, default_value_t = 0, allow_hyphen_values = true)]
        lag_adjust: i64,
        /// Channel letters to extract, e.g. AB
        #[arg(long)]
        channels: Option<String>,
        /// Skip the percentile statistic
        #[arg(long)]
        fast: bool,
        /// Write each channel as raw int16 next to the archive
        #[arg(long)]
        export_bin: bool,
        /// Export only this frame
        #[arg(long, requires = "export_bin")]
        frame: Option<usize>,
    },
    /// Run the mock scan head on the configured hardware address
    Simulate,
    /// Print the effective settings (file plus environment) as TOML
    ShowConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let settings = Settings::load_from(&args.config)
        .with_context(|| format!("loading configuration from {}", args.config.display()))?;

    // RUST_LOG wins over the configured level
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&settings.application.log_level)),
        )
        .init();

    match args.command {
        Command::Scan {
            frames,
            output,
            focus,
            force,
            position_data,
        } => {
            let destination = output.unwrap_or_else(|| {
                settings
                    .application
                    .output_dir
                    .join(format!("{}.gsi", chrono::Local::now().format("%Y%m%d_%H%M%S")))
            });
            let config = settings.scan_configuration();
            let request = ScanRequest {
                frames,
                destination,
                focus,
                force_refresh: force,
                position_data,
            };
            let mut orchestrator = AcquisitionOrchestrator::new(settings);
            report(orchestrator.execute(Operation::Scan { config, request }).await)
        }
        Command::Command { name } => {
            let mut orchestrator = AcquisitionOrchestrator::new(settings);
            report(orchestrator.execute(Operation::Command(name)).await)
        }
        Command::ArmPhotometry { position_data } => {
            let config = settings.photometry.clone();
            let mut orchestrator = AcquisitionOrchestrator::new(settings);
            report(
                orchestrator
                    .execute(Operation::ArmPhotometry {
                        config,
                        position_data,
                    })
                    .await,
            )
        }
        Command::TestPhotometry { x, y } => {
            let config = settings.photometry.clone().at(x, y);
            let mut orchestrator = AcquisitionOrchestrator::new(settings);
            let outcome = orchestrator
                .execute(Operation::TestPhotometry { config })
                .await;
            if let Some(means) = outcome.means {
                println!("mean A = {:.3}  mean B = {:.3}", means.a, means.b);
            }
            report(outcome)
        }
        Command::Decode {
            file,
            lag_adjust,
            channels,
            fast,
            export_bin,
            frame,
        } => {
            let options = LoadOptions {
                channels,
                lag_adjust,
                fast,
            };
            let stack = load_raster_archive(&file, &options)?;
            println!(
                "{}: {} x {} pixels, {} frame(s), max possible value {}",
                file.display(),
                stack.x_size,
                stack.y_size,
                stack.frame_count,
                stack.max_possible_value
            );
            for channel in stack.channels.values() {
                println!(
                    "  ADC {} ({}): max value {}",
                    channel.letter, channel.name, channel.max_value
                );
            }
            if export_bin {
                let selection = frame.map_or(FrameSelection::All, FrameSelection::Single);
                for path in export_stack(&stack, &file, selection)? {
                    println!("  saved {}", path.display());
                }
            }
            Ok(())
        }
        Command::Simulate => {
            let head = Arc::new(MockScanHead::bind(settings.system.hardware_addr()).await?);
            info!(address = %head.local_addr(), "simulating scan head; Ctrl-C to stop");
            let task = head.spawn();
            tokio::signal::ctrl_c().await?;
            task.abort();
            Ok(())
        }
        Command::ShowConfig => {
            print!("{}", settings.to_toml()?);
            Ok(())
        }
    }
}

fn report(report: AcquisitionReport) -> Result<()> {
    if !report.success {
        bail!("{}", report.message);
    }
    println!("{}", report.message);
    if let Some(path) = &report.artifact {
        println!("data: {}", path.display());
    }
    if let Some(path) = &report.descriptor {
        println!("descriptor: {}", path.display());
    }
    Ok(())
}
