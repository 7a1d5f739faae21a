//! Platform audio: CPAL output devices and streams, plus the WAV reader
//!
//! CPAL abstracts the platform APIs:
//! - Windows: WASAPI
//! - Linux: ALSA/PulseAudio
//! - macOS: CoreAudio

pub mod cpal_backend;
pub mod output;
pub mod wav;

pub use cpal_backend::CpalEnumerator;
pub use output::AudioOutput;
pub use wav::{BasicFormats, WavResolver, WavStreamReader};
