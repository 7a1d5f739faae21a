//! Real-time output stream
//!
//! Opens a CPAL f32 output stream and pulls one block from the producer chain
//! per device callback.

use cpal::traits::{DeviceTrait, StreamTrait};
use cpal::{Stream, StreamConfig as CpalStreamConfig};
use tracing::{error, info};

use ballad_core::domain::audio::{AudioError, BlockProducer, PlaybackSpec, Result};
use ballad_core::domain::config::EngineConfig;

use super::cpal_backend::{device_name, CpalEnumerator};

/// Producer owned by the callback; released when the stream is dropped
struct CallbackProducer(Box<dyn BlockProducer>);

impl Drop for CallbackProducer {
    fn drop(&mut self) {
        self.0.release();
    }
}

/// A running output stream
///
/// Playback stops when this is dropped.
pub struct AudioOutput {
    _stream: Stream,
    spec: PlaybackSpec,
    device: String,
}

impl AudioOutput {
    /// Prepare `producer` and start pulling it from the configured device
    pub fn start(
        enumerator: &CpalEnumerator,
        config: &EngineConfig,
        mut producer: Box<dyn BlockProducer>,
    ) -> Result<Self> {
        let device = enumerator.find_output(&config.output_device)?;
        let name = device_name(&device);
        let spec = config.playback_spec();

        info!(
            device = %name,
            sample_rate = config.sample_rate,
            channels = config.channels,
            block_size = config.block_size,
            "Creating output stream"
        );

        producer.prepare(spec)?;
        let mut producer = CallbackProducer(producer);

        let cpal_config = CpalStreamConfig {
            channels: config.channels,
            sample_rate: config.sample_rate,
            buffer_size: cpal::BufferSize::Fixed(config.block_size),
        };

        let stream = device
            .build_output_stream(
                &cpal_config,
                move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                    producer.0.pull_block(data);
                },
                |err| error!("Output stream error: {}", err),
                None,
            )
            .map_err(|e| AudioError::StreamError(format!("Failed to build stream: {}", e)))?;

        stream
            .play()
            .map_err(|e| AudioError::StreamError(format!("Failed to start stream: {}", e)))?;

        Ok(Self {
            _stream: stream,
            spec,
            device: name,
        })
    }

    pub fn spec(&self) -> PlaybackSpec {
        self.spec
    }

    pub fn device(&self) -> &str {
        &self.device
    }
}

impl std::fmt::Debug for AudioOutput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AudioOutput")
            .field("device", &self.device)
            .field("spec", &self.spec)
            .finish()
    }
}
