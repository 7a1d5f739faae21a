//! Three-band cascaded equalizer
//!
//! `CascadedEqualizer` wraps an inner [`BlockProducer`] and runs every channel
//! through a low shelf, a mid peaking band and a high shelf. The equalizer
//! itself lives inside the real-time callback; control threads tune it
//! through a cloneable [`EqualizerControl`].
//!
//! Parameter updates recompute coefficients under a short mutex and bump a
//! generation counter. The callback checks the counter at block start and
//! copies the new set with `try_lock`, so it never waits: if the lock is
//! busy it keeps the previous set for one more block.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, TryLockError};

use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::domain::audio::{BlockProducer, PlaybackSpec, Result};
use crate::domain::dsp::{params, BiquadCoeffs, BiquadDesign, BiquadFilter};

/// One of the three equalizer stages
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Band {
    Low,
    Mid,
    High,
}

impl Band {
    /// Bands in processing order
    pub const ALL: [Band; 3] = [Band::Low, Band::Mid, Band::High];

    pub fn index(self) -> usize {
        match self {
            Band::Low => 0,
            Band::Mid => 1,
            Band::High => 2,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Band::Low => "low",
            Band::Mid => "mid",
            Band::High => "high",
        }
    }
}

impl std::fmt::Display for Band {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(self.name())
    }
}

/// User-facing parameters of one band
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BandSettings {
    /// Corner (shelves) or center (mid) frequency in Hz
    pub frequency: f32,
    pub q: f32,
    pub gain_db: f32,
}

impl BandSettings {
    pub fn default_for(band: Band) -> Self {
        match band {
            Band::Low => Self {
                frequency: params::FREQ_LOW_SHELF,
                q: params::Q_BUTTERWORTH,
                gain_db: 0.0,
            },
            Band::Mid => Self {
                frequency: params::FREQ_MID_CENTER,
                q: 1.0,
                gain_db: 0.0,
            },
            Band::High => Self {
                frequency: params::FREQ_HIGH_SHELF,
                q: params::Q_BUTTERWORTH,
                gain_db: 0.0,
            },
        }
    }

    /// Clamp every field into its accepted range
    pub fn clamped(self) -> Self {
        Self {
            frequency: self.frequency.max(params::BAND_FREQ_MIN),
            q: self.q.clamp(params::BAND_Q_MIN, params::BAND_Q_MAX),
            gain_db: self.gain_db.clamp(params::GAIN_MIN_DB, params::GAIN_MAX_DB),
        }
    }

    pub fn is_finite(&self) -> bool {
        self.frequency.is_finite() && self.q.is_finite() && self.gain_db.is_finite()
    }

    /// Normalized coefficients for `band` at `sample_rate`
    pub fn design(&self, band: Band, sample_rate: f64) -> BiquadCoeffs {
        let max_freq = (params::BAND_FREQ_MAX_RATIO as f64) * sample_rate;
        let freq = (self.frequency as f64).clamp(params::BAND_FREQ_MIN as f64, max_freq);
        let q = self.q as f64;
        let gain = self.gain_db as f64;

        let design = match band {
            Band::Low => BiquadDesign::low_shelf(sample_rate, freq, gain, q),
            Band::Mid => BiquadDesign::peaking(sample_rate, freq, gain, q),
            Band::High => BiquadDesign::high_shelf(sample_rate, freq, gain, q),
        };
        design.normalize()
    }
}

/// Complete equalizer parameter set
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EqualizerSettings {
    pub bypass: bool,
    pub low: BandSettings,
    pub mid: BandSettings,
    pub high: BandSettings,
}

impl Default for EqualizerSettings {
    fn default() -> Self {
        Self {
            bypass: false,
            low: BandSettings::default_for(Band::Low),
            mid: BandSettings::default_for(Band::Mid),
            high: BandSettings::default_for(Band::High),
        }
    }
}

impl EqualizerSettings {
    pub fn band(&self, band: Band) -> &BandSettings {
        match band {
            Band::Low => &self.low,
            Band::Mid => &self.mid,
            Band::High => &self.high,
        }
    }
}

// ============================================================================
// SHARED STATE
// ============================================================================

const DEFAULT_SAMPLE_RATE: f64 = 44100.0;

/// Parameters and the coefficient set derived from them
#[derive(Debug)]
struct EqState {
    bands: [BandSettings; 3],
    sample_rate: f64,
    coeffs: [BiquadCoeffs; 3],
    generation: u64,
}

impl EqState {
    fn new(settings: &EqualizerSettings) -> Self {
        let bands = Band::ALL.map(|band| settings.band(band).clamped());
        let mut state = Self {
            bands,
            sample_rate: DEFAULT_SAMPLE_RATE,
            coeffs: [BiquadCoeffs::default(); 3],
            generation: 0,
        };
        state.redesign_all();
        state
    }

    fn redesign(&mut self, band: Band) {
        let i = band.index();
        self.coeffs[i] = self.bands[i].design(band, self.sample_rate);
    }

    fn redesign_all(&mut self) {
        for band in Band::ALL {
            self.redesign(band);
        }
    }
}

#[derive(Debug)]
struct EqShared {
    state: Mutex<EqState>,
    /// Mirrors `EqState::generation` so the callback can skip the lock
    generation: AtomicU64,
    bypass: AtomicBool,
}

impl EqShared {
    fn lock(&self) -> MutexGuard<'_, EqState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Apply `update` to one band; returns whether anything changed
    fn update_band(&self, band: Band, update: impl FnOnce(&mut BandSettings)) -> bool {
        let mut state = self.lock();
        let i = band.index();

        let mut next = state.bands[i];
        update(&mut next);
        let next = next.clamped();
        if !next.is_finite() || next == state.bands[i] {
            return false;
        }

        state.bands[i] = next;
        state.redesign(band);
        state.generation += 1;
        self.generation.store(state.generation, Ordering::Release);

        trace!(
            "EQ {} updated: {:.1}dB @ {:.0}Hz, Q={:.2}",
            band,
            next.gain_db,
            next.frequency,
            next.q
        );
        true
    }
}

// ============================================================================
// CONTROL HANDLE
// ============================================================================

/// Cloneable handle for tuning an equalizer from control threads
#[derive(Debug, Clone)]
pub struct EqualizerControl {
    shared: Arc<EqShared>,
}

impl EqualizerControl {
    /// Set a band's gain in dB, clamped to ±12 dB
    ///
    /// Returns `false` when the clamped value equals the current one; nothing
    /// is recomputed in that case.
    pub fn set_band_gain(&self, band: Band, gain_db: f32) -> bool {
        self.shared.update_band(band, |b| b.gain_db = gain_db)
    }

    /// Set a band's frequency in Hz
    pub fn set_band_frequency(&self, band: Band, frequency: f32) -> bool {
        self.shared.update_band(band, |b| b.frequency = frequency)
    }

    /// Set a band's quality factor, clamped to `[0.1, 10]`
    pub fn set_band_q(&self, band: Band, q: f32) -> bool {
        self.shared.update_band(band, |b| b.q = q)
    }

    /// Enable or disable bypass; returns whether the state changed
    pub fn set_bypass(&self, bypass: bool) -> bool {
        let previous = self.shared.bypass.swap(bypass, Ordering::AcqRel);
        if previous != bypass {
            debug!(bypass, "EQ bypass changed");
        }
        previous != bypass
    }

    pub fn is_bypassed(&self) -> bool {
        self.shared.bypass.load(Ordering::Acquire)
    }

    pub fn band(&self, band: Band) -> BandSettings {
        self.shared.lock().bands[band.index()]
    }

    /// Current coefficients of one band
    pub fn coefficients(&self, band: Band) -> BiquadCoeffs {
        self.shared.lock().coeffs[band.index()]
    }

    /// Snapshot of every parameter
    pub fn settings(&self) -> EqualizerSettings {
        let state = self.shared.lock();
        EqualizerSettings {
            bypass: self.is_bypassed(),
            low: state.bands[0],
            mid: state.bands[1],
            high: state.bands[2],
        }
    }

    /// Apply a complete parameter set
    pub fn apply(&self, settings: &EqualizerSettings) {
        for band in Band::ALL {
            let target = *settings.band(band);
            self.shared.update_band(band, |b| *b = target);
        }
        self.set_bypass(settings.bypass);
    }
}

// ============================================================================
// EQUALIZER
// ============================================================================

/// Three-band equalizer stage of the playback chain
pub struct CascadedEqualizer {
    inner: Option<Box<dyn BlockProducer>>,
    shared: Arc<EqShared>,
    /// One `[low, mid, high]` cascade per channel
    stages: Vec<[BiquadFilter; 3]>,
    coeffs: [BiquadCoeffs; 3],
    seen_generation: u64,
    was_bypassed: bool,
}

impl CascadedEqualizer {
    /// Create an equalizer with flat default bands
    pub fn new(inner: Option<Box<dyn BlockProducer>>) -> Self {
        Self::with_settings(inner, &EqualizerSettings::default())
    }

    pub fn with_settings(inner: Option<Box<dyn BlockProducer>>, settings: &EqualizerSettings) -> Self {
        let state = EqState::new(settings);
        let coeffs = state.coeffs;
        let shared = Arc::new(EqShared {
            state: Mutex::new(state),
            generation: AtomicU64::new(0),
            bypass: AtomicBool::new(settings.bypass),
        });

        Self {
            inner,
            shared,
            stages: Vec::new(),
            coeffs,
            seen_generation: 0,
            was_bypassed: settings.bypass,
        }
    }

    /// Handle for changing parameters from other threads
    pub fn control(&self) -> EqualizerControl {
        EqualizerControl {
            shared: Arc::clone(&self.shared),
        }
    }

    pub fn set_band_gain(&self, band: Band, gain_db: f32) -> bool {
        self.control().set_band_gain(band, gain_db)
    }

    pub fn set_bypass(&self, bypass: bool) -> bool {
        self.control().set_bypass(bypass)
    }

    /// Replace the wrapped producer; takes effect on the next `prepare`
    pub fn set_inner(&mut self, inner: Option<Box<dyn BlockProducer>>) {
        self.inner = inner;
    }

    fn install_coeffs(&mut self, coeffs: [BiquadCoeffs; 3], generation: u64) {
        self.coeffs = coeffs;
        self.seen_generation = generation;
        for channel in &mut self.stages {
            for (stage, c) in channel.iter_mut().zip(coeffs) {
                stage.set_coeffs(c);
            }
        }
    }

    /// Pick up a newer coefficient set without waiting
    fn refresh_coeffs(&mut self) {
        if self.shared.generation.load(Ordering::Acquire) == self.seen_generation {
            return;
        }
        let update = match self.shared.state.try_lock() {
            Ok(state) => Some((state.coeffs, state.generation)),
            Err(TryLockError::Poisoned(poisoned)) => {
                let state = poisoned.into_inner();
                Some((state.coeffs, state.generation))
            }
            Err(TryLockError::WouldBlock) => None,
        };
        if let Some((coeffs, generation)) = update {
            self.install_coeffs(coeffs, generation);
        }
    }

    fn reset_memory(&mut self) {
        for channel in &mut self.stages {
            for stage in channel.iter_mut() {
                stage.reset();
            }
        }
    }
}

impl BlockProducer for CascadedEqualizer {
    fn prepare(&mut self, spec: PlaybackSpec) -> Result<()> {
        if let Some(inner) = self.inner.as_mut() {
            inner.prepare(spec)?;
        }

        let (coeffs, generation) = {
            let mut state = self.shared.lock();
            state.sample_rate = spec.sample_rate.hz() as f64;
            state.redesign_all();
            state.generation += 1;
            self.shared.generation.store(state.generation, Ordering::Release);
            (state.coeffs, state.generation)
        };

        self.stages = vec![
            [BiquadFilter::bypass(), BiquadFilter::bypass(), BiquadFilter::bypass()];
            spec.stride()
        ];
        self.install_coeffs(coeffs, generation);

        debug!(
            sample_rate = spec.sample_rate.hz(),
            channels = spec.stride(),
            "Equalizer prepared"
        );
        Ok(())
    }

    fn release(&mut self) {
        if let Some(inner) = self.inner.as_mut() {
            inner.release();
        }
    }

    fn pull_block(&mut self, buffer: &mut [f32]) {
        match self.inner.as_mut() {
            Some(inner) => inner.pull_block(buffer),
            None => {
                buffer.fill(0.0);
                return;
            }
        }

        if self.shared.bypass.load(Ordering::Acquire) {
            self.was_bypassed = true;
            return;
        }
        if self.was_bypassed {
            self.reset_memory();
            self.was_bypassed = false;
        }

        let channels = self.stages.len();
        if channels == 0 {
            return;
        }
        debug_assert_eq!(buffer.len() % channels, 0);

        self.refresh_coeffs();

        for frame in buffer.chunks_exact_mut(channels) {
            for (sample, cascade) in frame.iter_mut().zip(self.stages.iter_mut()) {
                let mut x = *sample;
                for stage in cascade.iter_mut() {
                    x = stage.process_sample(x);
                }
                *sample = x;
            }
        }
    }
}
