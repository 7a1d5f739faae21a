//! RIFF/WAVE reader built on `hound`
//!
//! Integer PCM is scaled to `[-1.0, 1.0)` by its bit depth; float PCM is
//! passed through.

use std::io::Read;

use ballad_core::domain::reader::{AudioReader, FormatRegistry, FormatResolver, MediaStream, ReaderError};
use hound::{SampleFormat, WavReader};
use tracing::debug;

/// Resolver for RIFF/WAVE streams
#[derive(Debug, Default, Clone, Copy)]
pub struct WavResolver;

impl FormatResolver for WavResolver {
    fn name(&self) -> &str {
        "wav"
    }

    fn can_read(&self, stream: &mut dyn MediaStream) -> bool {
        let mut header = [0u8; 12];
        stream.read_exact(&mut header).is_ok() && &header[0..4] == b"RIFF" && &header[8..12] == b"WAVE"
    }

    fn open(&self, stream: Box<dyn MediaStream>) -> Result<Box<dyn AudioReader>, ReaderError> {
        Ok(Box::new(WavStreamReader::new(stream)?))
    }
}

/// Registry preloaded with the formats this crate can decode
pub trait BasicFormats {
    fn with_basic_formats() -> Self;
}

impl BasicFormats for FormatRegistry {
    fn with_basic_formats() -> Self {
        let mut registry = FormatRegistry::new();
        registry.register(Box::new(WavResolver));
        registry
    }
}

/// Decoded view over one WAV stream
pub struct WavStreamReader {
    reader: WavReader<Box<dyn MediaStream>>,
    channels: u16,
    sample_rate: u32,
    total_frames: u64,
    position: u64,
    /// Integer scale, `None` for float data
    int_scale: Option<f32>,
}

impl WavStreamReader {
    pub fn new(stream: Box<dyn MediaStream>) -> Result<Self, ReaderError> {
        let reader = WavReader::new(stream).map_err(wav_error)?;
        let spec = reader.spec();

        let int_scale = match spec.sample_format {
            SampleFormat::Float if spec.bits_per_sample == 32 => None,
            SampleFormat::Int if (1..=32).contains(&spec.bits_per_sample) => {
                Some(1.0 / (1u64 << (spec.bits_per_sample - 1)) as f32)
            }
            format => {
                return Err(ReaderError::Unsupported(format!(
                    "{:?} samples of {} bits",
                    format, spec.bits_per_sample
                )));
            }
        };

        if spec.channels == 0 {
            return Err(ReaderError::Decode("WAV header declares no channels".to_string()));
        }

        debug!(
            channels = spec.channels,
            sample_rate = spec.sample_rate,
            bits = spec.bits_per_sample,
            frames = reader.duration(),
            "Opened WAV stream"
        );

        Ok(Self {
            channels: spec.channels,
            sample_rate: spec.sample_rate,
            total_frames: u64::from(reader.duration()),
            position: 0,
            int_scale,
            reader,
        })
    }
}

impl AudioReader for WavStreamReader {
    fn channels(&self) -> u16 {
        self.channels
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn total_frames(&self) -> Option<u64> {
        Some(self.total_frames)
    }

    fn seek(&mut self, frame: u64) -> Result<(), ReaderError> {
        if frame > self.total_frames {
            return Err(ReaderError::SeekOutOfRange {
                requested: frame,
                total: self.total_frames,
            });
        }
        // total_frames came from a u32
        self.reader.seek(frame as u32)?;
        self.position = frame;
        Ok(())
    }

    fn read_frames(&mut self, buffer: &mut [f32]) -> Result<usize, ReaderError> {
        let channels = self.channels as usize;
        let remaining = self.total_frames - self.position;
        let frames = ((buffer.len() / channels) as u64).min(remaining) as usize;
        let wanted = frames * channels;

        let mut written = 0;
        match self.int_scale {
            Some(scale) => {
                for (slot, sample) in buffer[..wanted].iter_mut().zip(self.reader.samples::<i32>()) {
                    *slot = sample.map_err(wav_error)? as f32 * scale;
                    written += 1;
                }
            }
            None => {
                for (slot, sample) in buffer[..wanted].iter_mut().zip(self.reader.samples::<f32>()) {
                    *slot = sample.map_err(wav_error)?;
                    written += 1;
                }
            }
        }

        // A truncated data chunk ends early; drop the partial frame
        let frames = written / channels;
        self.position += frames as u64;
        if written < wanted {
            self.total_frames = self.position;
        }
        Ok(frames)
    }
}

impl std::fmt::Debug for WavStreamReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WavStreamReader")
            .field("channels", &self.channels)
            .field("sample_rate", &self.sample_rate)
            .field("total_frames", &self.total_frames)
            .field("position", &self.position)
            .finish()
    }
}

fn wav_error(e: hound::Error) -> ReaderError {
    match e {
        hound::Error::IoError(io) => ReaderError::Io(io),
        other => ReaderError::Decode(other.to_string()),
    }
}
