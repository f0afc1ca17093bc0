mod telemetry;

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use headconf::HeadsetConfig;
use headproto::sim::{SimOptions, SimulatedHeadset};
use headproto::{Axis, BatteryInfo, ChannelId, DeviceInfo, GainMode};
use headset::{Annotation, Session, SessionError, StreamStats};
use serde::Serialize;

/// Drive a headset session against the simulated device
#[derive(Parser, Debug)]
#[command(name = "headctl", version, about, long_about = None)]
struct Cli {
    /// Config file, replaces ./headset.toml
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the effective configuration and the sources it came from
    Config,

    /// Connect, stage channels and stream for a while
    Stream {
        /// Device identifier to connect to
        #[arg(short, long, default_value = "HALO-SIM")]
        device: String,

        /// Channels to enable in index order: electrode numbers, sample, digital, accel-x/y/z
        #[arg(long, value_delimiter = ',', default_value = "0,1,2,3", value_parser = parse_channel)]
        channels: Vec<ChannelId>,

        /// Gain multiplier applied to every enabled electrode (1, 2, 4, 6, 8, 12, 24)
        #[arg(long, value_parser = parse_gain)]
        gain: Option<GainMode>,

        /// How long to stream
        #[arg(short, long, default_value_t = 2.0)]
        seconds: f64,

        /// Annotation recorded once streaming has started (repeatable)
        #[arg(short, long)]
        annotate: Vec<String>,

        /// Simulated calibration window after stream start, in milliseconds
        #[arg(long)]
        calibration_ms: Option<u64>,

        /// Print the summary as JSON
        #[arg(long)]
        json: bool,
    },

    /// Push a firmware image to the simulated device
    Update {
        /// Device identifier to connect to
        #[arg(short, long, default_value = "HALO-SIM")]
        device: String,

        /// Firmware image, defaults to update.firmware_path
        #[arg(short, long)]
        firmware: Option<PathBuf>,
    },
}

fn parse_channel(value: &str) -> Result<ChannelId, String> {
    let channel = match value.trim().to_ascii_lowercase().as_str() {
        "sample" => ChannelId::SampleNumber,
        "digital" => ChannelId::DigitalInput,
        "accel-x" => ChannelId::Accelerometer(Axis::X),
        "accel-y" => ChannelId::Accelerometer(Axis::Y),
        "accel-z" => ChannelId::Accelerometer(Axis::Z),
        other => other
            .parse::<u8>()
            .map(ChannelId::Electrode)
            .map_err(|_| format!("unknown channel {:?}", value))?,
    };
    if !channel.is_representable() {
        return Err(format!("channel {} is out of range", channel));
    }
    Ok(channel)
}

fn parse_gain(value: &str) -> Result<GainMode, String> {
    value
        .parse::<u8>()
        .ok()
        .and_then(|n| GainMode::from_u8(n).ok())
        .ok_or_else(|| format!("unsupported gain {:?}", value))
}

fn stream_duration(seconds: f64) -> Result<Duration> {
    Duration::try_from_secs_f64(seconds.max(0.0))
        .with_context(|| format!("Invalid stream duration {} seconds", seconds))
}

#[derive(Debug, Serialize)]
struct StreamSummary {
    device: DeviceInfo,
    channels: Vec<String>,
    chunks: u64,
    samples: u64,
    stats: StreamStats,
    battery: BatteryInfo,
    annotations: Vec<Annotation>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let (config, sources) = HeadsetConfig::load_with_sources_from(cli.config.as_deref())
        .context("Failed to load configuration")?;

    match cli.command {
        Command::Config => {
            print_config(&config, &sources);
            Ok(())
        }
        Command::Stream {
            device,
            channels,
            gain,
            seconds,
            annotate,
            calibration_ms,
            json,
        } => {
            telemetry::init(&config.logging).context("Failed to initialize logging")?;
            let options = SimOptions {
                calibration: calibration_ms.map(Duration::from_millis),
                ..Default::default()
            };
            let request = StreamRequest {
                device,
                channels,
                gain,
                duration: stream_duration(seconds)?,
                annotations: annotate,
            };
            let summary = run_stream(&config, options, request).await?;
            print_summary(&summary, json)
        }
        Command::Update { device, firmware } => {
            telemetry::init(&config.logging).context("Failed to initialize logging")?;
            let firmware = firmware.unwrap_or_else(|| config.update.firmware_path.clone());
            run_update(&config, &device, firmware).await
        }
    }
}

fn print_config(config: &HeadsetConfig, sources: &headconf::ConfigSources) {
    if sources.files.is_empty() {
        println!("# No config files found, using defaults");
    }
    for file in &sources.files {
        println!("# Loaded: {}", file.display());
    }
    for var in &sources.env_overrides {
        println!("# Env override: {}", var);
    }
    println!();
    print!("{}", config.to_toml());
}

struct StreamRequest {
    device: String,
    channels: Vec<ChannelId>,
    gain: Option<GainMode>,
    duration: Duration,
    annotations: Vec<String>,
}

async fn run_stream(config: &HeadsetConfig, options: SimOptions, request: StreamRequest) -> Result<StreamSummary> {
    let sim = SimulatedHeadset::new(options);
    let mut session = Session::new(Arc::new(sim), config)?;

    session
        .connect(&request.device)?
        .await
        .with_context(|| format!("Failed to connect to {}", request.device))?;
    let device = session.device_info()?;
    tracing::info!("connected to serial {}", device.serial_number);

    for channel in &request.channels {
        session.set_channel_enabled(*channel, true)?;
        if let Some(gain) = request.gain {
            session.set_channel_gain(*channel, gain)?;
        }
    }

    let chunks = Arc::new(AtomicU64::new(0));
    let samples = Arc::new(AtomicU64::new(0));
    {
        let chunks = chunks.clone();
        let samples = samples.clone();
        session.set_chunk_callback(move |chunk| {
            chunks.fetch_add(1, Ordering::Relaxed);
            samples.fetch_add(chunk.sample_count() as u64, Ordering::Relaxed);
        });
    }
    session.set_battery_callback(|battery| tracing::debug!("battery {}%", battery.level));
    session.set_disconnect_callback(|| tracing::warn!("headset link lost"));

    session.start_stream()?.await.context("Failed to start streaming")?;
    let channels = session
        .streamed_channels()?
        .iter()
        .map(ToString::to_string)
        .collect();

    for text in &request.annotations {
        annotate_when_ready(&mut session, text).await?;
    }
    tokio::time::sleep(request.duration).await;

    session.stop_stream()?.await.context("Failed to stop streaming")?;
    let summary = StreamSummary {
        device,
        channels,
        chunks: chunks.load(Ordering::Relaxed),
        samples: samples.load(Ordering::Relaxed),
        stats: session.stream_stats(),
        battery: session.battery_info(),
        annotations: session.annotations(),
    };
    session.close();
    Ok(summary)
}

/// Retry while the device calibrates.
async fn annotate_when_ready(session: &mut Session, text: &str) -> Result<()> {
    loop {
        match session.annotate(text) {
            Err(SessionError::AnnotationUnavailableCalibrating) => {
                tracing::info!("device calibrating, holding annotation");
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
            other => return other.context("Failed to annotate"),
        }
    }
}

fn print_summary(summary: &StreamSummary, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(summary)?);
        return Ok(());
    }

    println!(
        "{:?} serial {} firmware {} @ {} Hz",
        summary.device.model,
        summary.device.serial_number,
        summary.device.firmware_version,
        summary.device.sample_frequency
    );
    println!("channels:    {}", summary.channels.join(", "));
    println!("chunks:      {} ({} samples per channel)", summary.chunks, summary.samples);
    println!(
        "frames:      {} accepted, {} malformed, {} late, {} missing",
        summary.stats.frames_accepted,
        summary.stats.frames_malformed,
        summary.stats.frames_late,
        summary.stats.frames_missing
    );
    println!(
        "battery:     {}%{}",
        summary.battery.level,
        if summary.battery.is_charging { " (charging)" } else { "" }
    );
    for annotation in &summary.annotations {
        println!("annotation:  {} {}", annotation.timestamp.to_rfc3339(), annotation.text);
    }
    Ok(())
}

async fn run_update(config: &HeadsetConfig, device: &str, firmware: PathBuf) -> Result<()> {
    let sim = SimulatedHeadset::default();
    let mut session = Session::new(Arc::new(sim.clone()), config)?;

    session
        .connect(device)?
        .await
        .with_context(|| format!("Failed to connect to {}", device))?;

    println!("updating {} from {}", device, firmware.display());
    let result = session
        .start_update_from(&firmware, |sent, total| {
            let percent = if total == 0 { 100 } else { sent * 100 / total };
            println!("  {:>3}% ({}/{} bytes)", percent, sent, total);
        })?
        .await;

    if let Err(e) = result {
        anyhow::bail!("Firmware update failed [{}]: {}", e.code(), e);
    }
    if let Some(digest) = sim.installed_firmware() {
        println!("installed blake3 {}", blake3::Hash::from(digest).to_hex());
    }
    session.close();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_channel_names() {
        assert_eq!(parse_channel("3"), Ok(ChannelId::Electrode(3)));
        assert_eq!(parse_channel("Sample"), Ok(ChannelId::SampleNumber));
        assert_eq!(parse_channel("accel-z"), Ok(ChannelId::Accelerometer(Axis::Z)));
        assert!(parse_channel("200").is_err());
        assert!(parse_channel("gyro").is_err());
    }

    #[test]
    fn test_parse_gain() {
        assert_eq!(parse_gain("24"), Ok(GainMode::X24));
        assert!(parse_gain("3").is_err());
    }

    #[test]
    fn test_stream_duration_rejects_unrepresentable() {
        assert_eq!(stream_duration(1.5).unwrap(), Duration::from_millis(1500));
        assert_eq!(stream_duration(-3.0).unwrap(), Duration::ZERO);
        assert!(stream_duration(f64::INFINITY).is_err());
        assert!(stream_duration(1e30).is_err());
    }

    #[test]
    fn test_cli_parses_stream_flags() {
        let cli = Cli::try_parse_from([
            "headctl", "stream", "--channels", "0,sample", "--gain", "8", "-s", "0.5", "-a", "rest",
        ])
        .unwrap();
        let Command::Stream {
            channels,
            gain,
            annotate,
            ..
        } = cli.command
        else {
            panic!("expected stream");
        };
        assert_eq!(channels, vec![ChannelId::Electrode(0), ChannelId::SampleNumber]);
        assert_eq!(gain, Some(GainMode::X8));
        assert_eq!(annotate, vec!["rest".to_string()]);
    }

    #[tokio::test]
    async fn test_stream_against_simulator() {
        let mut config = HeadsetConfig::default();
        config.stream.chunk_size = 5;
        let request = StreamRequest {
            device: "HALO-SIM".to_string(),
            channels: vec![ChannelId::Electrode(0), ChannelId::SampleNumber],
            gain: Some(GainMode::X4),
            duration: Duration::from_millis(200),
            annotations: vec!["baseline".to_string()],
        };

        let summary = run_stream(&config, SimOptions::default(), request).await.unwrap();
        assert_eq!(summary.channels, vec!["E0".to_string(), "sample".to_string()]);
        assert!(summary.chunks > 0);
        assert_eq!(summary.annotations.len(), 1);
        assert!(serde_json::to_string(&summary).unwrap().contains("baseline"));
    }
}
