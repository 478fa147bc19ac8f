//! Baseband conversion
//!
//! Turns IQ samples into the two streams which the pulse
//! detector slices:
//!
//! 1. an unsigned **level** stream, either
//!    * the *amplitude* `I² + Q²` (the default for `cu8`), or
//!    * the *magnitude* `√(I² + Q²)` (always for `cs16`,
//!      optional for `cu8`)
//!
//!    smoothed by a first-order low-pass filter;
//!
//! 2. a signed **FM** stream: the phase difference between
//!    successive samples, where ±32767 is ±π radians per sample
//!    (± half the sampling rate).
//!
//! Levels are scaled so that a full-scale carrier reads 16384
//! in either representation. This makes 0 dB the full-scale
//! level for both [`amp_to_db()`] and [`mag_to_db()`].

use num_complex::Complex;
use num_traits::{Float, NumCast};

use crate::iq::IqFrame;

/// Dynamic range of the amplitude representation (dB)
///
/// `10·log10(16384)`
pub const AMP_RANGE_DB: f32 = 42.1442;

/// Dynamic range of the magnitude representation (dB)
///
/// `20·log10(16384)`
pub const MAG_RANGE_DB: f32 = 84.2884;

/// Low-pass cutoff of the level stream (fraction of Nyquist)
pub const LEVEL_CUTOFF: f32 = 0.05;

/// Amplitude to dB full scale
#[inline]
pub fn amp_to_db(amp: f32) -> f32 {
    10.0 * amp.log10() - AMP_RANGE_DB
}

/// dB full scale to amplitude
#[inline]
pub fn db_to_amp(db: f32) -> f32 {
    10.0f32.powf((db + AMP_RANGE_DB) / 10.0)
}

/// Magnitude to dB full scale
#[inline]
pub fn mag_to_db(mag: f32) -> f32 {
    20.0 * mag.log10() - MAG_RANGE_DB
}

/// dB full scale to magnitude
#[inline]
pub fn db_to_mag(db: f32) -> f32 {
    10.0f32.powf((db + MAG_RANGE_DB) / 20.0)
}

/// First-order Butterworth low-pass filter
///
/// Implements
///
/// ```txt
/// y[n] = a·y[n-1] + b·(x[n] + x[n-1])
/// ```
///
/// with coefficients from the bilinear transform of a
/// one-pole analog prototype.
#[derive(Clone, Debug)]
pub struct LowPass<T>
where
    T: Float,
{
    a: T,
    b: T,
    x_prev: T,
    y_prev: T,
}

impl<T> LowPass<T>
where
    T: Float,
{
    /// New filter with the given `cutoff`
    ///
    /// The cutoff is a fraction of the Nyquist rate, in
    /// `(0.0, 1.0)`. Values outside this range are clamped.
    pub fn new(cutoff: T) -> Self {
        let eps = T::epsilon();
        let cutoff = cutoff.max(eps).min(T::one() - eps);
        let half = <T as NumCast>::from(0.5).unwrap_or_else(T::one);
        let pi = <T as NumCast>::from(std::f64::consts::PI).unwrap_or_else(T::one);
        let k = (pi * cutoff * half).tan();
        Self {
            a: (T::one() - k) / (T::one() + k),
            b: k / (T::one() + k),
            x_prev: T::zero(),
            y_prev: T::zero(),
        }
    }

    /// Reset to zero initial conditions
    pub fn reset(&mut self) {
        self.x_prev = T::zero();
        self.y_prev = T::zero();
    }

    /// Filter one sample
    #[inline]
    pub fn filter(&mut self, x: T) -> T {
        let y = self.a * self.y_prev + self.b * (x + self.x_prev);
        self.x_prev = x;
        self.y_prev = y;
        y
    }

    /// Feedback and feedforward coefficients `(a, b)`
    pub fn coefficients(&self) -> (T, T) {
        (self.a, self.b)
    }
}

/// Frequency discriminator
///
/// Measures the phase advance of each sample relative to
/// the previous one.
#[derive(Clone, Debug)]
pub struct FmDemod {
    prev: Complex<f32>,
    lowpass: LowPass<f32>,
}

impl FmDemod {
    /// New discriminator with an output low-pass `cutoff`
    pub fn new(cutoff: f32) -> Self {
        Self {
            prev: Complex::new(0.0, 0.0),
            lowpass: LowPass::new(cutoff),
        }
    }

    /// Reset to zero initial conditions
    pub fn reset(&mut self) {
        self.prev = Complex::new(0.0, 0.0);
        self.lowpass.reset();
    }

    /// Demodulate one sample
    #[inline]
    pub fn input(&mut self, sample: Complex<f32>) -> i16 {
        let delta = sample * self.prev.conj();
        self.prev = sample;
        let fm = delta.arg() / std::f32::consts::PI * i16::MAX as f32;
        self.lowpass
            .filter(fm)
            .round()
            .clamp(-(i16::MAX as f32), i16::MAX as f32) as i16
    }
}

/// Level and FM streams of one frame
#[derive(Clone, Debug, Default, PartialEq)]
pub struct BasebandFrame {
    /// Filtered level, amplitude or magnitude
    pub level: Vec<i32>,
    /// Filtered FM discriminator output
    pub fm: Vec<i16>,
    /// Mean unfiltered level of the frame (dB full scale)
    pub avg_db: f32,
}

/// IQ to level and FM conversion
#[derive(Clone, Debug)]
pub struct Baseband {
    use_mag_est: bool,
    level_lp: LowPass<f32>,
    fm: FmDemod,
}

impl Baseband {
    /// New converter
    ///
    /// If `use_mag_est`, `cu8` frames produce magnitudes
    /// instead of amplitudes. `cs16` frames always produce
    /// magnitudes. The FM stream is smoothed with a low-pass
    /// filter of `fm_cutoff`.
    pub fn new(use_mag_est: bool, fm_cutoff: f32) -> Self {
        Self {
            use_mag_est,
            level_lp: LowPass::new(LEVEL_CUTOFF),
            fm: FmDemod::new(fm_cutoff),
        }
    }

    /// Reset to zero initial conditions
    pub fn reset(&mut self) {
        self.level_lp.reset();
        self.fm.reset();
    }

    /// True if `frame` will be converted to magnitudes
    pub fn uses_magnitude(&self, frame: &IqFrame) -> bool {
        self.use_mag_est || matches!(frame, IqFrame::Cs16(_))
    }

    /// Convert one frame
    pub fn process(&mut self, frame: &IqFrame) -> BasebandFrame {
        let use_mag = self.uses_magnitude(frame);
        let n = frame.len();
        let mut out = BasebandFrame {
            level: Vec::with_capacity(n),
            fm: Vec::with_capacity(n),
            avg_db: 0.0,
        };

        let mut sum = 0.0f64;
        for i in 0..n {
            // centered sample, full scale ±128
            let (x, y) = match frame {
                IqFrame::Cu8(v) => (127.0 - v[2 * i] as f32, 127.0 - v[2 * i + 1] as f32),
                IqFrame::Cs16(v) => (v[2 * i] as f32 / 256.0, v[2 * i + 1] as f32 / 256.0),
            };
            let power = x * x + y * y;
            let raw = if use_mag {
                power.sqrt() * 128.0
            } else {
                power
            };
            sum += raw as f64;

            let level = self.level_lp.filter(raw);
            out.level.push(level.round().clamp(0.0, i32::MAX as f32) as i32);
            out.fm.push(self.fm.input(Complex::new(x, y)));
        }

        let mean = if n > 0 { (sum / n as f64) as f32 } else { 0.0 };
        let mean = mean.max(1.0);
        out.avg_db = if use_mag {
            mag_to_db(mean)
        } else {
            amp_to_db(mean)
        };
        out
    }
}
