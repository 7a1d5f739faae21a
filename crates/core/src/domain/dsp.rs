//! Biquad filter design and processing
//!
//! This module provides:
//! - `BiquadDesign`: six raw coefficients from the RBJ cookbook formulas
//! - `BiquadCoeffs`: the normalized five-coefficient form used at run time
//! - `BiquadFilter`: one Direct Form I section with its sample memory
//!
//! Design is pure and runs on control threads; filtering is allocation-free
//! and runs inside the real-time callback.

use serde::{Deserialize, Serialize};
use std::f64::consts::PI;

/// Parameter constraints for filter design
pub mod params {
    /// Quality factor range accepted by the designer
    pub const Q_MIN: f64 = 0.00001;
    pub const Q_MAX: f64 = 1000.0;

    /// Equalizer gain range (dB)
    pub const GAIN_MIN_DB: f32 = -12.0;
    pub const GAIN_MAX_DB: f32 = 12.0;

    /// Equalizer band Q range
    pub const BAND_Q_MIN: f32 = 0.1;
    pub const BAND_Q_MAX: f32 = 10.0;

    /// Lowest band frequency (Hz); the upper bound is a fraction of the sample rate
    pub const BAND_FREQ_MIN: f32 = 10.0;
    pub const BAND_FREQ_MAX_RATIO: f32 = 0.49;

    /// Default band frequencies (Hz)
    pub const FREQ_LOW_SHELF: f32 = 200.0;
    pub const FREQ_MID_CENTER: f32 = 1000.0;
    pub const FREQ_HIGH_SHELF: f32 = 2000.0;

    /// Butterworth Q, used by the shelving bands
    pub const Q_BUTTERWORTH: f32 = 0.707;
}

// ============================================================================
// DESIGN
// ============================================================================

/// Second-order filter response
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum FilterKind {
    LowPass,
    HighPass,
    /// Constant 0 dB peak gain
    BandPass,
    /// Notch
    BandStop,
    AllPass,
    LowShelf { gain_db: f64 },
    HighShelf { gain_db: f64 },
    Peaking { gain_db: f64 },
}

/// Un-normalized biquad coefficients `(b0, b1, b2, a0, a1, a2)`
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BiquadDesign {
    pub b0: f64,
    pub b1: f64,
    pub b2: f64,
    pub a0: f64,
    pub a1: f64,
    pub a2: f64,
}

/// Angular terms shared by every design
struct Omega {
    cos: f64,
    alpha: f64,
}

impl Omega {
    fn new(sample_rate: f64, freq: f64, q: f64) -> Self {
        let q = q.clamp(params::Q_MIN, params::Q_MAX);
        let w0 = 2.0 * PI * freq / sample_rate;
        Self {
            cos: w0.cos(),
            alpha: w0.sin() / (2.0 * q),
        }
    }
}

impl BiquadDesign {
    /// Design a filter of any supported kind
    #[must_use]
    pub fn design(kind: FilterKind, sample_rate: f64, freq: f64, q: f64) -> Self {
        match kind {
            FilterKind::LowPass => Self::low_pass(sample_rate, freq, q),
            FilterKind::HighPass => Self::high_pass(sample_rate, freq, q),
            FilterKind::BandPass => Self::band_pass(sample_rate, freq, q),
            FilterKind::BandStop => Self::band_stop(sample_rate, freq, q),
            FilterKind::AllPass => Self::all_pass(sample_rate, freq, q),
            FilterKind::LowShelf { gain_db } => Self::low_shelf(sample_rate, freq, gain_db, q),
            FilterKind::HighShelf { gain_db } => Self::high_shelf(sample_rate, freq, gain_db, q),
            FilterKind::Peaking { gain_db } => Self::peaking(sample_rate, freq, gain_db, q),
        }
    }

    #[must_use]
    pub fn low_pass(sample_rate: f64, freq: f64, q: f64) -> Self {
        let w = Omega::new(sample_rate, freq, q);
        let b1 = 1.0 - w.cos;
        Self {
            b0: b1 / 2.0,
            b1,
            b2: b1 / 2.0,
            a0: 1.0 + w.alpha,
            a1: -2.0 * w.cos,
            a2: 1.0 - w.alpha,
        }
    }

    #[must_use]
    pub fn high_pass(sample_rate: f64, freq: f64, q: f64) -> Self {
        let w = Omega::new(sample_rate, freq, q);
        let b1 = -(1.0 + w.cos);
        Self {
            b0: -b1 / 2.0,
            b1,
            b2: -b1 / 2.0,
            a0: 1.0 + w.alpha,
            a1: -2.0 * w.cos,
            a2: 1.0 - w.alpha,
        }
    }

    /// Band-pass with 0 dB gain at the center frequency
    #[must_use]
    pub fn band_pass(sample_rate: f64, freq: f64, q: f64) -> Self {
        let w = Omega::new(sample_rate, freq, q);
        Self {
            b0: w.alpha,
            b1: 0.0,
            b2: -w.alpha,
            a0: 1.0 + w.alpha,
            a1: -2.0 * w.cos,
            a2: 1.0 - w.alpha,
        }
    }

    #[must_use]
    pub fn band_stop(sample_rate: f64, freq: f64, q: f64) -> Self {
        let w = Omega::new(sample_rate, freq, q);
        Self {
            b0: 1.0,
            b1: -2.0 * w.cos,
            b2: 1.0,
            a0: 1.0 + w.alpha,
            a1: -2.0 * w.cos,
            a2: 1.0 - w.alpha,
        }
    }

    #[must_use]
    pub fn all_pass(sample_rate: f64, freq: f64, q: f64) -> Self {
        let w = Omega::new(sample_rate, freq, q);
        Self {
            b0: 1.0 - w.alpha,
            b1: -2.0 * w.cos,
            b2: 1.0 + w.alpha,
            a0: 1.0 + w.alpha,
            a1: -2.0 * w.cos,
            a2: 1.0 - w.alpha,
        }
    }

    /// Boosts or cuts frequencies below `freq`
    #[must_use]
    pub fn low_shelf(sample_rate: f64, freq: f64, gain_db: f64, q: f64) -> Self {
        let a = 10.0_f64.powf(gain_db / 40.0);
        let w = Omega::new(sample_rate, freq, q);
        let sqrt_alpha = 2.0 * a.sqrt() * w.alpha;

        Self {
            b0: a * ((a + 1.0) - (a - 1.0) * w.cos + sqrt_alpha),
            b1: 2.0 * a * ((a - 1.0) - (a + 1.0) * w.cos),
            b2: a * ((a + 1.0) - (a - 1.0) * w.cos - sqrt_alpha),
            a0: (a + 1.0) + (a - 1.0) * w.cos + sqrt_alpha,
            a1: -2.0 * ((a - 1.0) + (a + 1.0) * w.cos),
            a2: (a + 1.0) + (a - 1.0) * w.cos - sqrt_alpha,
        }
    }

    /// Boosts or cuts frequencies above `freq`
    #[must_use]
    pub fn high_shelf(sample_rate: f64, freq: f64, gain_db: f64, q: f64) -> Self {
        let a = 10.0_f64.powf(gain_db / 40.0);
        let w = Omega::new(sample_rate, freq, q);
        let sqrt_alpha = 2.0 * a.sqrt() * w.alpha;

        Self {
            b0: a * ((a + 1.0) + (a - 1.0) * w.cos + sqrt_alpha),
            b1: -2.0 * a * ((a - 1.0) + (a + 1.0) * w.cos),
            b2: a * ((a + 1.0) + (a - 1.0) * w.cos - sqrt_alpha),
            a0: (a + 1.0) - (a - 1.0) * w.cos + sqrt_alpha,
            a1: 2.0 * ((a - 1.0) - (a + 1.0) * w.cos),
            a2: (a + 1.0) - (a - 1.0) * w.cos - sqrt_alpha,
        }
    }

    /// Boosts or cuts frequencies around `freq`
    #[must_use]
    pub fn peaking(sample_rate: f64, freq: f64, gain_db: f64, q: f64) -> Self {
        let a = 10.0_f64.powf(gain_db / 40.0);
        let w = Omega::new(sample_rate, freq, q);

        Self {
            b0: 1.0 + w.alpha * a,
            b1: -2.0 * w.cos,
            b2: 1.0 - w.alpha * a,
            a0: 1.0 + w.alpha / a,
            a1: -2.0 * w.cos,
            a2: 1.0 - w.alpha / a,
        }
    }

    /// Divide through by `a0`
    #[must_use]
    pub fn normalize(&self) -> BiquadCoeffs {
        BiquadCoeffs {
            b0: (self.b0 / self.a0) as f32,
            b1: (self.b1 / self.a0) as f32,
            b2: (self.b2 / self.a0) as f32,
            a1: (self.a1 / self.a0) as f32,
            a2: (self.a2 / self.a0) as f32,
        }
    }
}

// ============================================================================
// BIQUAD FILTER
// ============================================================================

/// Normalized biquad coefficients (a0 = 1)
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BiquadCoeffs {
    /// Numerator coefficients
    pub b0: f32,
    pub b1: f32,
    pub b2: f32,
    /// Denominator coefficients
    pub a1: f32,
    pub a2: f32,
}

impl Default for BiquadCoeffs {
    fn default() -> Self {
        // Unity gain (no filtering)
        Self {
            b0: 1.0,
            b1: 0.0,
            b2: 0.0,
            a1: 0.0,
            a2: 0.0,
        }
    }
}

impl From<BiquadDesign> for BiquadCoeffs {
    fn from(design: BiquadDesign) -> Self {
        design.normalize()
    }
}

impl BiquadCoeffs {
    /// Magnitude of the frequency response `|H(e^jw)|` at `freq`
    #[must_use]
    pub fn magnitude_at(&self, freq: f64, sample_rate: f64) -> f64 {
        let w = 2.0 * PI * freq / sample_rate;
        let (c1, s1) = (w.cos(), w.sin());
        let (c2, s2) = ((2.0 * w).cos(), (2.0 * w).sin());

        let (b0, b1, b2) = (self.b0 as f64, self.b1 as f64, self.b2 as f64);
        let (a1, a2) = (self.a1 as f64, self.a2 as f64);

        let num_re = b0 + b1 * c1 + b2 * c2;
        let num_im = -(b1 * s1 + b2 * s2);
        let den_re = 1.0 + a1 * c1 + a2 * c2;
        let den_im = -(a1 * s1 + a2 * s2);

        (num_re.hypot(num_im)) / (den_re.hypot(den_im))
    }

    /// Magnitude response in dB
    #[must_use]
    pub fn magnitude_db_at(&self, freq: f64, sample_rate: f64) -> f64 {
        20.0 * self.magnitude_at(freq, sample_rate).log10()
    }
}

/// Stateful biquad filter using Direct Form I
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BiquadFilter {
    coeffs: BiquadCoeffs,
    // Previous input samples (x[n-1], x[n-2])
    x1: f32,
    x2: f32,
    // Previous output samples (y[n-1], y[n-2])
    y1: f32,
    y2: f32,
}

impl Default for BiquadFilter {
    fn default() -> Self {
        Self::bypass()
    }
}

impl BiquadFilter {
    /// Create a new biquad filter with given coefficients
    pub fn new(coeffs: BiquadCoeffs) -> Self {
        Self {
            coeffs,
            x1: 0.0,
            x2: 0.0,
            y1: 0.0,
            y2: 0.0,
        }
    }

    /// Create a bypass filter (unity gain)
    pub fn bypass() -> Self {
        Self::new(BiquadCoeffs::default())
    }

    /// Replace the coefficients, keeping the sample memory
    pub fn set_coeffs(&mut self, coeffs: BiquadCoeffs) {
        self.coeffs = coeffs;
    }

    pub fn coeffs(&self) -> &BiquadCoeffs {
        &self.coeffs
    }

    /// Process a single sample
    #[inline]
    pub fn process_sample(&mut self, x: f32) -> f32 {
        // y[n] = b0*x[n] + b1*x[n-1] + b2*x[n-2] - a1*y[n-1] - a2*y[n-2]
        let y = self.coeffs.b0 * x + self.coeffs.b1 * self.x1 + self.coeffs.b2 * self.x2
            - self.coeffs.a1 * self.y1
            - self.coeffs.a2 * self.y2;

        self.x2 = self.x1;
        self.x1 = x;
        self.y2 = self.y1;
        self.y1 = y;

        y
    }

    /// Process a mono buffer in place
    pub fn process(&mut self, buffer: &mut [f32]) {
        for sample in buffer.iter_mut() {
            *sample = self.process_sample(*sample);
        }
    }

    /// Clear the sample memory
    pub fn reset(&mut self) {
        self.x1 = 0.0;
        self.x2 = 0.0;
        self.y1 = 0.0;
        self.y2 = 0.0;
    }
}

// ============================================================================
// TESTS
// ============================================================================
