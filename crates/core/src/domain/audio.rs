//! Audio domain types and the block-producer capability
//!
//! This module defines the platform-agnostic pieces every stage of the
//! playback chain agrees on: the error type, stream formats, and the
//! `BlockProducer` trait pulled by the real-time callback. Platform code
//! (cpal output, background threads) lives in the `infra` crate.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::reader::ReaderError;

/// Errors that can occur in the audio subsystem
#[derive(Debug, Error)]
pub enum AudioError {
    /// Requested audio device was not found
    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    /// Error in audio stream creation or processing
    #[error("Stream error: {0}")]
    StreamError(String),

    /// Invalid configuration for a stage or device
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// Input/Output error at the OS level
    #[error("OS error: {0}")]
    OsError(String),

    /// Device does not support the requested configuration
    #[error("Unsupported configuration: {0}")]
    UnsupportedConfiguration(String),

    /// No registered format could open the input
    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),

    /// Input could not be opened
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The reader failed while being opened or positioned
    #[error("Reader error: {0}")]
    Reader(#[from] ReaderError),
}

pub type Result<T> = std::result::Result<T, AudioError>;

/// Unique identifier for an audio device
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceId(String);

impl DeviceId {
    pub fn new(id: String) -> Self {
        Self(id)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Audio sample rate in Hz
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SampleRate {
    Hz44100,
    Hz48000,
    Hz96000,
    Hz192000,
    Custom(u32),
}

impl SampleRate {
    pub fn hz(&self) -> u32 {
        match self {
            SampleRate::Hz44100 => 44100,
            SampleRate::Hz48000 => 48000,
            SampleRate::Hz96000 => 96000,
            SampleRate::Hz192000 => 192000,
            SampleRate::Custom(hz) => *hz,
        }
    }

    pub fn from_hz(hz: u32) -> Self {
        match hz {
            44100 => SampleRate::Hz44100,
            48000 => SampleRate::Hz48000,
            96000 => SampleRate::Hz96000,
            192000 => SampleRate::Hz192000,
            hz => SampleRate::Custom(hz),
        }
    }
}

/// Number of audio channels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChannelCount {
    Mono,
    Stereo,
    Surround(u16),
}

impl ChannelCount {
    pub fn count(&self) -> u16 {
        match self {
            ChannelCount::Mono => 1,
            ChannelCount::Stereo => 2,
            ChannelCount::Surround(n) => *n,
        }
    }

    pub fn from_count(count: u16) -> Self {
        match count {
            1 => ChannelCount::Mono,
            2 => ChannelCount::Stereo,
            n => ChannelCount::Surround(n),
        }
    }
}

/// Format agreed between the real-time callback and the producer chain
///
/// Blocks are interleaved `f32` with `channels` samples per frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlaybackSpec {
    pub sample_rate: SampleRate,
    pub channels: ChannelCount,
    /// Frames per callback the device is expected to ask for
    pub block_frames: usize,
}

impl PlaybackSpec {
    pub fn new(sample_rate: u32, channels: u16, block_frames: usize) -> Self {
        Self {
            sample_rate: SampleRate::from_hz(sample_rate),
            channels: ChannelCount::from_count(channels),
            block_frames,
        }
    }

    /// Channel count as a slice stride
    pub fn stride(&self) -> usize {
        self.channels.count() as usize
    }
}

impl Default for PlaybackSpec {
    fn default() -> Self {
        Self {
            sample_rate: SampleRate::Hz44100,
            channels: ChannelCount::Stereo,
            block_frames: 512,
        }
    }
}

/// A stage of the playback chain that fills blocks on demand
///
/// `pull_block` runs on the real-time callback and must not block, allocate
/// or perform I/O. `prepare` and `release` bracket a playback session and
/// run on a normal thread.
pub trait BlockProducer: Send {
    /// Get ready to deliver blocks in the given format
    ///
    /// Returns `InvalidConfiguration` when the stage cannot honour the
    /// format (for example a fixed channel layout that does not match).
    fn prepare(&mut self, spec: PlaybackSpec) -> Result<()>;

    /// Free resources acquired in `prepare`
    fn release(&mut self);

    /// Fill `buffer` (interleaved, `spec.channels` per frame) with the next block
    fn pull_block(&mut self, buffer: &mut [f32]);
}

impl<P: BlockProducer + ?Sized> BlockProducer for Box<P> {
    fn prepare(&mut self, spec: PlaybackSpec) -> Result<()> {
        (**self).prepare(spec)
    }

    fn release(&mut self) {
        (**self).release()
    }

    fn pull_block(&mut self, buffer: &mut [f32]) {
        (**self).pull_block(buffer)
    }
}

/// Type of audio device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeviceType {
    Input,
    Output,
    Duplex,
}

/// Information about an audio device
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub id: DeviceId,
    pub name: String,
    pub device_type: DeviceType,
    pub default_sample_rate: Option<SampleRate>,
    pub default_channels: Option<ChannelCount>,
}

/// Trait for enumerating playback devices
pub trait AudioEnumerator: Send + Sync {
    /// List all available output devices
    fn output_devices(&self) -> Result<Vec<DeviceInfo>>;

    /// Get the default output device
    fn default_output_device(&self) -> Result<DeviceInfo>;

    /// Find a device by its ID
    fn device_by_id(&self, id: &DeviceId) -> Result<DeviceInfo> {
        self.output_devices()?
            .into_iter()
            .find(|d| d.id == *id)
            .ok_or_else(|| AudioError::DeviceNotFound(id.as_str().to_string()))
    }
}
