//! Domain entities and playback rules

pub mod audio;
pub mod config;
pub mod dsp;
pub mod equalizer;
pub mod events;
pub mod input;
pub mod ownership;
pub mod reader;

// Re-export specific items to avoid ambiguous glob imports
pub use audio::{
    AudioEnumerator, AudioError, BlockProducer, ChannelCount, DeviceId, DeviceInfo, DeviceType,
    PlaybackSpec, SampleRate,
};
pub use config::{BalladConfig, ConfigError, ConfigManager, EngineConfig, StreamingConfig};
pub use dsp::{BiquadCoeffs, BiquadDesign, BiquadFilter, FilterKind};
pub use equalizer::{Band, BandSettings, CascadedEqualizer, EqualizerControl, EqualizerSettings};
pub use events::{ListenerRegistry, Parameter, PlayerEvent, PlayerListener};
pub use input::{InputKind, PlayerInput, RetainedInput};
pub use ownership::Ownership;
pub use reader::{AudioReader, FormatRegistry, FormatResolver, MediaStream, MemoryReader, ReaderError};
