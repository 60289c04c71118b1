//! daqscan - DAQiFi instrument console
//!
//! Discovers DAQiFi devices on the local network and streams live samples
//! to the console.
//!
//! ```bash
//! # Find devices (3 second probe window)
//! daqscan discover
//!
//! # Stream AI0/AI1 at 100 Hz for ten seconds
//! daqscan stream 192.168.1.77 --mask 0x3
//!
//! # Machine-readable output
//! daqscan discover --json
//! ```

mod config;

use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use tokio_util::sync::CancellationToken;
use tracing::info;

use daqifi_core::device::{DeviceSession, SessionConfig, SessionEvent};
use daqifi_core::discovery::{DiscoveryConfig, DiscoveryEvent, DiscoveryService};

use crate::config::DaqscanConfig;

#[derive(Parser)]
#[command(name = "daqscan", version, about = "DAQiFi instrument discovery and streaming console")]
struct Args {
    /// Configuration file (YAML)
    #[arg(short, long, default_value = "daqscan.yaml")]
    config: String,

    /// Verbose logging (equivalent to RUST_LOG=debug)
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Probe the local network for devices
    Discover {
        /// Probe window in seconds
        #[arg(long, default_value_t = 3)]
        timeout: u64,

        /// Emit descriptors as JSON
        #[arg(long)]
        json: bool,
    },

    /// Connect to a device and stream samples
    Stream {
        /// Device host name or IP address
        host: String,

        /// Device TCP port
        #[arg(long, default_value_t = 9760)]
        port: u16,

        /// Stream frequency in Hz (1..=1000)
        #[arg(long)]
        frequency: Option<u32>,

        /// ADC channel enable mask, LSB = AI0
        #[arg(long)]
        mask: Option<u32>,

        /// How long to stream before disconnecting, in seconds
        #[arg(long, default_value_t = 10)]
        duration: u64,

        /// Emit records as JSON lines
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let default_level = if args.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .with_target(false)
        .init();

    let config = DaqscanConfig::load(&args.config)?;

    match args.command {
        Commands::Discover { timeout, json } => discover(&config, timeout, json).await,
        Commands::Stream {
            host,
            port,
            frequency,
            mask,
            duration,
            json,
        } => {
            stream(
                &config,
                &host,
                port,
                frequency.unwrap_or(config.stream_frequency),
                mask.unwrap_or(config.channel_mask),
                duration,
                json,
            )
            .await
        }
    }
}

async fn discover(config: &DaqscanConfig, timeout: u64, json: bool) -> Result<()> {
    let service = DiscoveryService::new(DiscoveryConfig {
        port: config.discovery_port,
    });
    let mut events = service.subscribe();
    let cancel = CancellationToken::new();

    let printer = tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                DiscoveryEvent::DeviceDiscovered(device) => {
                    if !json {
                        println!(
                            "  {} {} ({}) at {}:{} mac {} power {}",
                            "found".green().bold(),
                            device.name,
                            device.device_kind,
                            device.ip_address,
                            device.tcp_port,
                            device.mac_address,
                            if device.power_on { "on".green() } else { "off".yellow() },
                        );
                    }
                }
                DiscoveryEvent::Completed => break,
            }
        }
    });

    if !json {
        println!(
            "{} probing UDP port {} for {}s...",
            "daqscan".bold(),
            config.discovery_port,
            timeout
        );
    }
    let devices = service
        .discover(Duration::from_secs(timeout), &cancel)
        .await
        .context("discovery failed")?;
    let _ = printer.await;

    if json {
        println!("{}", serde_json::to_string_pretty(&devices)?);
    } else if devices.is_empty() {
        println!("  {}", "no devices answered".yellow());
    } else {
        println!("{} device(s) discovered", devices.len());
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn stream(
    _config: &DaqscanConfig,
    host: &str,
    port: u16,
    frequency: u32,
    mask: u32,
    duration: u64,
    json: bool,
) -> Result<()> {
    let mut session = DeviceSession::new(SessionConfig::new(host, port));
    let mut events = session.subscribe();

    info!("Connecting to {}:{}", host, port);
    session.connect().await.context("connection failed")?;
    session.initialize().await.context("initialization failed")?;

    let metadata = session.metadata();
    if !json {
        println!(
            "{} connected to {} ({}) fw {} sn {}",
            "daqscan".bold(),
            metadata.host_name,
            metadata.device_kind,
            metadata.firmware_revision,
            metadata.serial_number,
        );
    }

    session
        .set_channels_enabled(mask)
        .context("channel enable failed")?;
    session
        .start_streaming(frequency)
        .context("stream start failed")?;

    let deadline = tokio::time::Instant::now() + Duration::from_secs(duration);
    loop {
        let now = tokio::time::Instant::now();
        if now >= deadline {
            break;
        }
        match tokio::time::timeout(deadline - now, events.recv()).await {
            Ok(Ok(SessionEvent::RecordReceived(_))) => {
                let channels = session.channels();
                if json {
                    let snapshot: Vec<_> = channels
                        .iter()
                        .filter(|c| c.enabled())
                        .map(|c| c.snapshot())
                        .collect();
                    println!("{}", serde_json::to_string(&snapshot)?);
                } else {
                    let line = channels
                        .iter()
                        .filter(|c| c.enabled())
                        .filter_map(|c| {
                            c.last_sample()
                                .map(|s| format!("{}={:.6}", c.name(), s.value.as_f64()))
                        })
                        .collect::<Vec<_>>()
                        .join("  ");
                    if !line.is_empty() {
                        println!("  {line}");
                    }
                }
            }
            Ok(Ok(SessionEvent::StatusChanged { status, error })) => {
                if !status.is_connected() {
                    println!(
                        "  {} connection {} {}",
                        "!".red().bold(),
                        status,
                        error.unwrap_or_default().red()
                    );
                    break;
                }
            }
            Ok(Ok(_)) => {}
            Ok(Err(_)) | Err(_) => break,
        }
    }

    let _ = session.stop_streaming();
    session.disconnect().await;
    if !json {
        println!("{} disconnected", "daqscan".bold());
    }
    Ok(())
}
