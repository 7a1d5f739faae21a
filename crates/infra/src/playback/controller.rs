//! Playback controller
//!
//! Top-level facade of the player. It resolves inputs into readers, wires
//! reader → streaming source → equalizer, exposes transport and EQ controls,
//! and tells listeners what changed.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

use ballad_core::domain::audio::{BlockProducer, Result};
use ballad_core::domain::config::BalladConfig;
use ballad_core::domain::equalizer::{Band, BandSettings, CascadedEqualizer, EqualizerControl};
use ballad_core::domain::events::{ListenerRegistry, Parameter, PlayerEvent, PlayerListener};
use ballad_core::domain::input::{InputKind, PlayerInput, RetainedInput};
use ballad_core::domain::ownership::Ownership;
use ballad_core::domain::reader::{AudioReader, FormatRegistry, MediaStream};

use crate::audio::wav::BasicFormats;

use super::streaming::{BufferedStreamingSource, StreamState, StreamStats, StreamingHandle};
use super::worker::{ClientId, PrefetchWorker};

/// Player facade: input, transport, equalizer and listeners
pub struct PlaybackController {
    worker: Ownership<PrefetchWorker>,
    formats: Ownership<FormatRegistry>,
    client: ClientId,
    stream: StreamingHandle,
    equalizer: EqualizerControl,
    /// Producer chain until the audio output takes it
    output: Option<CascadedEqualizer>,
    input: RetainedInput,
    listeners: ListenerRegistry,
    was_finished: bool,
}

impl PlaybackController {
    /// Create a player with its own worker thread and the basic formats
    pub fn new(config: &BalladConfig) -> Result<Self> {
        let worker = PrefetchWorker::spawn("ballad-prefetch")?;
        Ok(Self::with_collaborators(
            config,
            Ownership::Owned(worker),
            Ownership::Owned(FormatRegistry::with_basic_formats()),
        ))
    }

    /// Create a player around a given worker and format registry
    ///
    /// Shared collaborators are only detached from when the player is dropped.
    pub fn with_collaborators(
        config: &BalladConfig,
        worker: Ownership<PrefetchWorker>,
        formats: Ownership<FormatRegistry>,
    ) -> Self {
        let source = BufferedStreamingSource::new(&config.streaming, config.engine.channels);
        let client = source.attach(&worker);
        let stream = source.handle();

        let equalizer = CascadedEqualizer::with_settings(Some(Box::new(source)), &config.equalizer);
        let control = equalizer.control();

        info!(
            worker = worker.name(),
            owned_worker = worker.is_owned(),
            formats = ?formats.formats(),
            "Playback controller created"
        );

        Self {
            worker,
            formats,
            client,
            stream,
            equalizer: control,
            output: Some(equalizer),
            input: RetainedInput::None,
            listeners: ListenerRegistry::new(),
            was_finished: false,
        }
    }

    // ========================================================================
    // LISTENERS
    // ========================================================================

    /// Register a listener; returns `false` if it was already registered
    pub fn add_listener(&self, listener: Arc<dyn PlayerListener>) -> bool {
        self.listeners.add(listener)
    }

    pub fn remove_listener(&self, listener: &Arc<dyn PlayerListener>) -> bool {
        self.listeners.remove(listener)
    }

    fn notify(&self, event: PlayerEvent) {
        self.listeners.notify(&event);
    }

    // ========================================================================
    // INPUT
    // ========================================================================

    /// Replace the input
    ///
    /// Playback stops and the looping flag is kept. Listeners get exactly one
    /// `InputChanged` whatever the outcome; on failure the player has no input.
    pub fn set_input(&mut self, input: PlayerInput) -> Result<()> {
        let kind = input.kind();
        self.stream.stop();

        let result = match self.open(input) {
            Ok((reader, retained)) => {
                info!(
                    ?kind,
                    channels = reader.channels(),
                    sample_rate = reader.sample_rate(),
                    frames = ?reader.total_frames(),
                    "Input loaded"
                );
                self.stream.set_reader(Some(reader));
                self.input = retained;
                Ok(())
            }
            Err(e) => {
                warn!(?kind, error = %e, "Failed to load input");
                self.stream.set_reader(None);
                self.input = RetainedInput::None;
                Err(e)
            }
        };

        self.was_finished = false;
        self.notify(PlayerEvent::InputChanged);
        result
    }

    fn open(&self, input: PlayerInput) -> Result<(Box<dyn AudioReader>, RetainedInput)> {
        let (stream, retained) = input.open()?;
        let reader = self.formats.create_reader(stream)?;
        Ok((reader, retained))
    }

    pub fn set_file(&mut self, path: impl Into<PathBuf>) -> Result<()> {
        self.set_input(PlayerInput::File(path.into()))
    }

    pub fn set_memory_block(&mut self, bytes: Arc<[u8]>) -> Result<()> {
        self.set_input(PlayerInput::MemoryBlock(bytes))
    }

    pub fn set_memory_stream(&mut self, bytes: Vec<u8>) -> Result<()> {
        self.set_input(PlayerInput::MemoryStream(bytes))
    }

    pub fn set_input_stream(&mut self, stream: Box<dyn MediaStream>) -> Result<()> {
        self.set_input(PlayerInput::Stream(stream))
    }

    pub fn input_kind(&self) -> InputKind {
        self.input.kind()
    }

    /// Path of the current input when it is a file
    pub fn file(&self) -> Option<&Path> {
        self.input.file()
    }

    /// A fresh stream over the current input, positioned at the start
    ///
    /// `None` without an input or for a generic stream, which the reader owns.
    pub fn input_stream(&self) -> Option<std::io::Result<Box<dyn MediaStream>>> {
        self.input.reopen()
    }

    // ========================================================================
    // TRANSPORT
    // ========================================================================

    pub fn start(&self) {
        self.stream.start();
        debug!("Transport started");
        self.notify(PlayerEvent::TransportChanged { playing: true });
    }

    pub fn stop(&self) {
        self.stream.stop();
        debug!("Transport stopped");
        self.notify(PlayerEvent::TransportChanged { playing: false });
    }

    /// Toggle between playing and stopped
    pub fn pause(&self) {
        let playing = !self.stream.is_playing();
        if playing {
            self.stream.start();
        } else {
            self.stream.stop();
        }
        debug!(playing, "Transport toggled");
        self.notify(PlayerEvent::TransportChanged { playing });
    }

    /// Seek to the start and play; does nothing without an input
    pub fn start_from_zero(&mut self) {
        if !self.stream.has_reader() {
            return;
        }
        self.was_finished = false;
        self.stream.set_position(0);
        self.start();
    }

    /// Emit `TransportChanged` if the stream ended since the last poll
    ///
    /// Call periodically from a control thread. Returns whether an event was
    /// sent.
    pub fn poll_transport(&mut self) -> bool {
        let finished = self.stream.has_finished();
        let ended = finished && !self.was_finished;
        self.was_finished = finished;

        if ended {
            info!("Playback reached end of stream");
            self.notify(PlayerEvent::TransportChanged { playing: false });
        }
        ended
    }

    /// Seek to a reader frame; listeners are not notified
    pub fn set_position(&self, frame: u64) {
        self.stream.set_position(frame);
    }

    /// Seek to a time in seconds; ignored without an input
    pub fn set_position_seconds(&self, seconds: f64) {
        if let Some(rate) = self.stream.sample_rate() {
            let frame = (seconds.max(0.0) * f64::from(rate)).round() as u64;
            self.stream.set_position(frame);
        }
    }

    pub fn position(&self) -> u64 {
        self.stream.position()
    }

    pub fn position_seconds(&self) -> f64 {
        self.stream
            .sample_rate()
            .map_or(0.0, |rate| self.stream.position() as f64 / f64::from(rate))
    }

    pub fn total_frames(&self) -> Option<u64> {
        self.stream.total_frames()
    }

    /// Input length in seconds, `None` when unknown
    pub fn length_seconds(&self) -> Option<f64> {
        let rate = self.stream.sample_rate()?;
        let total = self.stream.total_frames()?;
        Some(total as f64 / f64::from(rate))
    }

    pub fn is_playing(&self) -> bool {
        self.stream.is_playing()
    }

    pub fn has_stream_finished(&self) -> bool {
        self.stream.has_finished()
    }

    pub fn set_looping(&self, looping: bool) {
        self.stream.set_looping(looping);
    }

    pub fn is_looping(&self) -> bool {
        self.stream.is_looping()
    }

    pub fn state(&self) -> StreamState {
        self.stream.state()
    }

    pub fn stats(&self) -> StreamStats {
        self.stream.stats()
    }

    // ========================================================================
    // EQUALIZER
    // ========================================================================

    /// Set a band's gain; notifies only when the value changed
    pub fn set_band_gain(&self, band: Band, gain_db: f32) -> bool {
        let changed = self.equalizer.set_band_gain(band, gain_db);
        if changed {
            let value = self.equalizer.band(band).gain_db;
            self.notify(PlayerEvent::ParameterChanged {
                parameter: Parameter::Gain(band),
                value,
            });
        }
        changed
    }

    pub fn set_band_frequency(&self, band: Band, frequency: f32) -> bool {
        let changed = self.equalizer.set_band_frequency(band, frequency);
        if changed {
            let value = self.equalizer.band(band).frequency;
            self.notify(PlayerEvent::ParameterChanged {
                parameter: Parameter::Frequency(band),
                value,
            });
        }
        changed
    }

    pub fn set_band_q(&self, band: Band, q: f32) -> bool {
        let changed = self.equalizer.set_band_q(band, q);
        if changed {
            let value = self.equalizer.band(band).q;
            self.notify(PlayerEvent::ParameterChanged {
                parameter: Parameter::Q(band),
                value,
            });
        }
        changed
    }

    pub fn set_bypass(&self, bypass: bool) -> bool {
        let changed = self.equalizer.set_bypass(bypass);
        if changed {
            self.notify(PlayerEvent::ParameterChanged {
                parameter: Parameter::Bypass,
                value: if bypass { 1.0 } else { 0.0 },
            });
        }
        changed
    }

    pub fn band(&self, band: Band) -> BandSettings {
        self.equalizer.band(band)
    }

    pub fn equalizer(&self) -> &EqualizerControl {
        &self.equalizer
    }

    // ========================================================================
    // OUTPUT
    // ========================================================================

    /// Hand the producer chain to the audio output; `None` after the first call
    pub fn take_output(&mut self) -> Option<Box<dyn BlockProducer>> {
        self.output
            .take()
            .map(|equalizer| Box::new(equalizer) as Box<dyn BlockProducer>)
    }
}

impl Drop for PlaybackController {
    fn drop(&mut self) {
        self.stream.stop();
        self.stream.close();
        self.worker.unregister(self.client);
        self.stream.set_reader(None);
        debug!(owned_worker = self.worker.is_owned(), "Playback controller dropped");
    }
}

impl std::fmt::Debug for PlaybackController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlaybackController")
            .field("input", &self.input.kind())
            .field("stream", &self.stream)
            .field("output_taken", &self.output.is_none())
            .finish()
    }
}
