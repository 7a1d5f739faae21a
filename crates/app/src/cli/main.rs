//! Ballad CLI: play a file through the three-band equalizer

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing::{info, warn};

use ballad_core::domain::audio::AudioEnumerator;
use ballad_core::domain::config::{BalladConfig, ConfigManager};
use ballad_infra::audio::{AudioOutput, CpalEnumerator};
use ballad_infra::playback::PlaybackController;

#[derive(Parser)]
#[command(name = "ballad")]
#[command(about = "Buffered audio player with a three-band equalizer", long_about = None)]
struct Cli {
    /// Audio file to play
    file: Option<PathBuf>,

    /// Loop the file until interrupted
    #[arg(short, long = "loop")]
    looping: bool,

    /// Low shelf gain in dB
    #[arg(long, allow_hyphen_values = true)]
    low: Option<f32>,

    /// Mid peak gain in dB
    #[arg(long, allow_hyphen_values = true)]
    mid: Option<f32>,

    /// High shelf gain in dB
    #[arg(long, allow_hyphen_values = true)]
    high: Option<f32>,

    /// Play without equalization
    #[arg(long)]
    bypass_eq: bool,

    /// Start position in seconds
    #[arg(long)]
    start: Option<f64>,

    /// Config file directory (defaults to the user config dir)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Output device name (defaults to the config, then the system default)
    #[arg(short, long)]
    device: Option<String>,

    /// List output devices and exit
    #[arg(long)]
    list_devices: bool,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if cli.verbose {
        tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_max_level(tracing::Level::INFO)
            .init();
    }

    let enumerator = CpalEnumerator::new();
    if cli.list_devices {
        for device in enumerator.output_devices()? {
            println!(
                "{}  ({} Hz, {} ch)",
                device.name,
                device.default_sample_rate.map_or(0, |r| r.hz()),
                device.default_channels.map_or(0, |c| c.count())
            );
        }
        return Ok(());
    }

    let Some(file) = cli.file.clone() else {
        anyhow::bail!("no input file given (see --help)");
    };

    let config_dir = match &cli.config {
        Some(dir) => dir.clone(),
        None => ConfigManager::default_config_dir()?,
    };
    let mut config = ConfigManager::new(config_dir).load().await;
    apply_overrides(&cli, &mut config);
    config.validate().context("invalid settings")?;

    info!("Ballad starting");

    let mut player = PlaybackController::new(&config)?;
    player.set_looping(cli.looping);
    player
        .set_file(&file)
        .with_context(|| format!("cannot play {}", file.display()))?;

    if let Some(seconds) = cli.start {
        player.set_position_seconds(seconds);
    }

    let producer = player
        .take_output()
        .context("output chain already taken")?;
    let output = AudioOutput::start(&enumerator, &config.engine, producer)?;
    info!(
        device = output.device(),
        length = ?player.length_seconds(),
        "Playing {}",
        file.display()
    );

    player.start();

    let mut ticker = tokio::time::interval(Duration::from_millis(50));
    let mut last_underruns = 0;
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if player.poll_transport() {
                    break;
                }
                let stats = player.stats();
                if stats.underruns > last_underruns {
                    warn!(underruns = stats.underruns, "Prefetch fell behind playback");
                    last_underruns = stats.underruns;
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                player.stop();
                break;
            }
        }
    }

    info!(
        position = %format!("{:.2}s", player.position_seconds()),
        read_errors = player.stats().read_errors,
        "Playback finished"
    );
    drop(output);
    Ok(())
}

fn apply_overrides(cli: &Cli, config: &mut BalladConfig) {
    if let Some(device) = &cli.device {
        config.engine.output_device = device.clone();
    }
    if let Some(gain) = cli.low {
        config.equalizer.low.gain_db = gain;
    }
    if let Some(gain) = cli.mid {
        config.equalizer.mid.gain_db = gain;
    }
    if let Some(gain) = cli.high {
        config.equalizer.high.gain_db = gain;
    }
    if cli.bypass_eq {
        config.equalizer.bypass = true;
    }
}
