//! Configuration management for Ballad
//!
//! This module provides:
//! - Configuration structs for the output engine, the streaming buffer and
//!   the equalizer
//! - TOML (de)serialization with validation
//! - `ConfigManager` for the per-user config file, with fallback to factory
//!   defaults

use crate::domain::audio::PlaybackSpec;
use crate::domain::dsp::params;
use crate::domain::equalizer::{Band, EqualizerSettings};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::fs;
use tracing::{debug, error, info, instrument};

pub type Result<T> = std::result::Result<T, ConfigError>;

/// Errors that can occur during configuration operations
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parsing error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialization error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Output engine configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Output sample rate in Hz
    pub sample_rate: u32,

    /// Output channel count
    pub channels: u16,

    /// Frames per device callback
    pub block_size: u32,

    /// Output device ID (empty = use default)
    pub output_device: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            sample_rate: 44100,
            channels: 2,
            block_size: 512,
            output_device: String::new(),
        }
    }
}

impl EngineConfig {
    pub fn playback_spec(&self) -> PlaybackSpec {
        PlaybackSpec::new(self.sample_rate, self.channels, self.block_size as usize)
    }
}

/// Prefetch buffer configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamingConfig {
    /// Ring capacity in frames, rounded up to a power of two
    pub ring_capacity_frames: usize,

    /// Below this many buffered frames the prefetch task asks for immediate service
    pub low_water_frames: usize,

    /// Frames decoded per reader call
    pub read_chunk_frames: usize,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            ring_capacity_frames: 32768,
            low_water_frames: 8192,
            read_chunk_frames: 2048,
        }
    }
}

/// Complete Ballad configuration
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BalladConfig {
    pub engine: EngineConfig,
    pub streaming: StreamingConfig,
    pub equalizer: EqualizerSettings,
}

impl BalladConfig {
    /// Factory default configuration
    pub fn factory_default() -> Self {
        Self::default()
    }

    /// Check every value is usable
    pub fn validate(&self) -> Result<()> {
        let engine = &self.engine;
        if !(8000..=384_000).contains(&engine.sample_rate) {
            return Err(invalid(format!("sample_rate {} out of range", engine.sample_rate)));
        }
        if !(1..=8).contains(&engine.channels) {
            return Err(invalid(format!("channels {} out of range", engine.channels)));
        }
        if !(16..=8192).contains(&engine.block_size) {
            return Err(invalid(format!("block_size {} out of range", engine.block_size)));
        }

        let streaming = &self.streaming;
        if streaming.read_chunk_frames == 0 {
            return Err(invalid("read_chunk_frames must be positive".to_string()));
        }
        if streaming.ring_capacity_frames < 2 * streaming.read_chunk_frames {
            return Err(invalid(format!(
                "ring_capacity_frames {} must hold at least two read chunks of {}",
                streaming.ring_capacity_frames, streaming.read_chunk_frames
            )));
        }
        // Refilling to low water must leave room for a whole chunk
        let max_low_water = streaming.ring_capacity_frames - streaming.read_chunk_frames;
        if streaming.low_water_frames > max_low_water {
            return Err(invalid(format!(
                "low_water_frames {} must not exceed ring_capacity_frames minus read_chunk_frames ({})",
                streaming.low_water_frames, max_low_water
            )));
        }

        for band in Band::ALL {
            let settings = self.equalizer.band(band);
            if !settings.frequency.is_finite() || settings.frequency < params::BAND_FREQ_MIN {
                return Err(invalid(format!("{} band frequency {}", band, settings.frequency)));
            }
            if !settings.q.is_finite() || settings.q <= 0.0 {
                return Err(invalid(format!("{} band Q {}", band, settings.q)));
            }
            if !settings.gain_db.is_finite() {
                return Err(invalid(format!("{} band gain {}", band, settings.gain_db)));
            }
        }

        Ok(())
    }

    /// Load and validate configuration from a TOML file
    #[instrument(skip(path))]
    pub async fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading configuration");

        let contents = fs::read_to_string(path).await?;
        let config: Self = toml::from_str(&contents)?;
        config.validate()?;

        debug!("Configuration loaded successfully");
        Ok(config)
    }

    /// Save configuration to a TOML file
    #[instrument(skip(self, path))]
    pub async fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        info!(path = %path.display(), "Saving configuration");

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let toml_str = toml::to_string_pretty(self)?;
        fs::write(path, toml_str).await?;

        debug!("Configuration saved successfully");
        Ok(())
    }
}

fn invalid(message: String) -> ConfigError {
    ConfigError::Invalid(message)
}

/// Manager for the per-user config file
///
/// The file lives at `<config dir>/ballad/config.toml`.
pub struct ConfigManager {
    config_dir: PathBuf,
    config_path: PathBuf,
}

impl ConfigManager {
    pub fn new(config_dir: PathBuf) -> Self {
        let config_path = config_dir.join("config.toml");
        Self {
            config_dir,
            config_path,
        }
    }

    /// Default config directory
    ///
    /// `~/.config/ballad` on Linux, the platform equivalent elsewhere.
    pub fn default_config_dir() -> Result<PathBuf> {
        dirs::config_dir()
            .map(|p| p.join("ballad"))
            .ok_or_else(|| ConfigError::Invalid("Could not determine config directory".to_string()))
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    /// Load configuration from file
    ///
    /// A missing file yields the factory default. A corrupt or invalid file
    /// is logged, copied to `config.toml.corrupt`, and replaced by the
    /// factory default in memory.
    #[instrument(skip(self))]
    pub async fn load(&self) -> BalladConfig {
        if !self.config_path.exists() {
            info!(
                path = %self.config_path.display(),
                "Config file not found, using factory default"
            );
            return BalladConfig::factory_default();
        }

        match BalladConfig::load_from_file(&self.config_path).await {
            Ok(config) => config,
            Err(e) => {
                error!(
                    path = %self.config_path.display(),
                    error = %e,
                    "Failed to load config, using factory default"
                );

                let backup_path = self.config_path.with_extension("toml.corrupt");
                if let Err(copy_err) = fs::copy(&self.config_path, &backup_path).await {
                    error!(
                        path = %backup_path.display(),
                        error = %copy_err,
                        "Failed to backup corrupt config"
                    );
                }

                BalladConfig::factory_default()
            }
        }
    }

    #[instrument(skip(self, config))]
    pub async fn save(&self, config: &BalladConfig) -> Result<()> {
        config.validate()?;
        fs::create_dir_all(&self.config_dir).await?;
        config.save_to_file(&self.config_path).await
    }

    /// Delete the config file
    #[instrument(skip(self))]
    pub async fn clear(&self) -> Result<()> {
        if self.config_path.exists() {
            fs::remove_file(&self.config_path).await?;
            info!(path = %self.config_path.display(), "Configuration cleared");
        }
        Ok(())
    }

    pub fn exists(&self) -> bool {
        self.config_path.exists()
    }
}
