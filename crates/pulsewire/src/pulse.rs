//! Pulse/gap model of a single radio burst
//!
//! A [`PulseData`] is one contiguous transmission, captured as the
//! strict alternation `pulse[0], gap[0], pulse[1], gap[1], …`. All
//! durations are measured in *samples* at the burst's
//! [`sample_rate()`](PulseData::sample_rate). Wire formats which
//! carry microseconds convert at the boundary with
//! [`samples_to_us()`](PulseData::samples_to_us) and
//! [`us_to_samples()`](PulseData::us_to_samples).

use std::num::NonZeroU32;

use arrayvec::ArrayVec;
use strum_macros::{Display, EnumString, IntoStaticStr};
use thiserror::Error;

#[cfg(not(test))]
use log::warn;

#[cfg(test)]
use std::println as warn;

/// Maximum number of pulses in one burst
pub const PD_MAX: usize = 1200;

/// Minimum number of pulses for a burst to be considered decodable
///
/// Shorter bursts are suspected noise. They may still be shipped
/// in compressed hex form.
pub const PD_MIN_PULSES: usize = 16;

/// Modulation family of a burst
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Display, EnumString, IntoStaticStr)]
pub enum Modulation {
    /// On-off keying
    #[strum(serialize = "OOK", ascii_case_insensitive)]
    Ook,

    /// Frequency-shift keying
    #[strum(serialize = "FSK", ascii_case_insensitive)]
    Fsk,

    /// Amplitude-shift keying
    #[strum(serialize = "ASK", ascii_case_insensitive)]
    Ask,
}

/// Error constructing a burst
#[derive(Error, Clone, Debug, PartialEq, Eq)]
pub enum PulseError {
    /// The sampling rate must be positive
    #[error("sample rate must be greater than zero")]
    ZeroSampleRate,
}

/// One radio burst
///
/// Pulse and gap widths live in fixed-capacity storage of
/// [`PD_MAX`] entries each. The widths can only grow by
/// [`push()`](PulseData::push), which refuses to exceed the
/// capacity. The scalar metadata is public: detectors and
/// codecs fill it in while the burst is being built.
///
/// Once a burst has been handed off it is not changed again;
/// consumers [`clone()`](Clone::clone) it if they need their own
/// copy.
#[derive(Clone, Debug, PartialEq)]
pub struct PulseData {
    sample_rate: u32,
    pulse: ArrayVec<u32, PD_MAX>,
    gap: ArrayVec<u32, PD_MAX>,
    truncated: bool,

    /// Receiver center frequency (Hz)
    pub centerfreq_hz: f64,
    /// Estimated mark frequency (Hz), FSK only
    pub freq1_hz: f64,
    /// Estimated space frequency (Hz), FSK only
    pub freq2_hz: f64,

    /// Received signal strength (dB)
    pub rssi_db: f32,
    /// Signal to noise ratio (dB)
    pub snr_db: f32,
    /// Noise floor (dB)
    pub noise_db: f32,
    /// Dynamic range of the sample format (dB)
    pub range_db: f32,

    /// Envelope level estimate of the gaps
    pub ook_low_estimate: i32,
    /// Envelope level estimate of the pulses
    pub ook_high_estimate: i32,
    /// FM discriminator estimate of the mark frequency
    pub fsk_f1_est: i32,
    /// FM discriminator estimate of the space frequency
    ///
    /// Non-zero only for FSK bursts.
    pub fsk_f2_est: i32,

    /// Absolute sample position of the burst start in the stream
    pub offset: u64,
    /// Samples between the burst start and emission
    pub start_ago: u32,
    /// Samples between the burst end and emission
    pub end_ago: u32,

    /// Sample depth of the source (bits)
    pub depth_bits: u32,
}

impl PulseData {
    /// Empty burst at the given `sample_rate`
    ///
    /// Every field other than the sampling rate is zero.
    pub fn new(sample_rate: u32) -> Result<Self, PulseError> {
        NonZeroU32::new(sample_rate)
            .map(Self::with_rate)
            .ok_or(PulseError::ZeroSampleRate)
    }

    /// Empty burst at a known-good `sample_rate`
    pub(crate) fn with_rate(sample_rate: NonZeroU32) -> Self {
        Self {
            sample_rate: sample_rate.get(),
            pulse: ArrayVec::new(),
            gap: ArrayVec::new(),
            truncated: false,
            centerfreq_hz: 0.0,
            freq1_hz: 0.0,
            freq2_hz: 0.0,
            rssi_db: 0.0,
            snr_db: 0.0,
            noise_db: 0.0,
            range_db: 0.0,
            ook_low_estimate: 0,
            ook_high_estimate: 0,
            fsk_f1_est: 0,
            fsk_f2_est: 0,
            offset: 0,
            start_ago: 0,
            end_ago: 0,
            depth_bits: 0,
        }
    }

    /// Burst from an alternating `pulse, gap, pulse, gap, …` slice
    ///
    /// A trailing odd element is a final pulse with a zero gap.
    /// Input beyond [`PD_MAX`] pairs is discarded with a warning.
    pub fn from_pairs(sample_rate: u32, alternating: &[u32]) -> Result<Self, PulseError> {
        let mut out = Self::new(sample_rate)?;
        for pair in alternating.chunks(2) {
            let pulse = pair[0];
            let gap = pair.get(1).copied().unwrap_or(0);
            if !out.push(pulse, gap) {
                break;
            }
        }
        Ok(out)
    }

    /// Append a pulse and its following gap
    ///
    /// Returns `false`, and marks the burst as
    /// [truncated](PulseData::is_truncated), if the burst is
    /// already full.
    pub fn push(&mut self, pulse: u32, gap: u32) -> bool {
        if self.pulse.is_full() {
            if !self.truncated {
                warn!(
                    "burst exceeds {} pulses at offset {}: truncated",
                    PD_MAX, self.offset
                );
            }
            self.truncated = true;
            return false;
        }

        self.pulse.push(pulse);
        self.gap.push(gap);
        true
    }

    /// Change the width of the final gap
    ///
    /// Detectors close a burst by measuring its final gap
    /// after the last pulse has been stored.
    pub(crate) fn set_last_gap(&mut self, gap: u32) {
        if let Some(last) = self.gap.last_mut() {
            *last = gap;
        }
    }

    /// Sampling rate (Hz)
    #[inline]
    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Number of pulse/gap pairs
    #[inline]
    pub fn num_pulses(&self) -> usize {
        self.pulse.len()
    }

    /// True if the burst contains no pulses
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.pulse.is_empty()
    }

    /// Pulse widths (samples)
    #[inline]
    pub fn pulses(&self) -> &[u32] {
        self.pulse.as_slice()
    }

    /// Gap widths (samples)
    #[inline]
    pub fn gaps(&self) -> &[u32] {
        self.gap.as_slice()
    }

    /// Iterate `(pulse, gap)` pairs (samples)
    pub fn pairs(&self) -> impl Iterator<Item = (u32, u32)> + '_ {
        self.pulse.iter().copied().zip(self.gap.iter().copied())
    }

    /// Flatten to `pulse, gap, pulse, gap, …` (samples)
    pub fn to_alternating(&self) -> Vec<u32> {
        self.pairs().flat_map(|(p, g)| [p, g]).collect()
    }

    /// True if pulses were discarded because the burst was full
    #[inline]
    pub fn is_truncated(&self) -> bool {
        self.truncated
    }

    /// Modulation family
    ///
    /// A burst with a second FSK frequency estimate is FSK;
    /// everything else is OOK.
    pub fn modulation(&self) -> Modulation {
        if self.fsk_f2_est != 0 {
            Modulation::Fsk
        } else {
            Modulation::Ook
        }
    }

    /// True if the burst is long enough to decode
    #[inline]
    pub fn is_decodable(&self) -> bool {
        self.num_pulses() >= PD_MIN_PULSES
    }

    /// Convert a sample count to microseconds
    #[inline]
    pub fn samples_to_us(&self, samples: u32) -> f64 {
        samples as f64 * 1.0e6 / self.sample_rate as f64
    }

    /// Convert microseconds to a sample count, rounding to nearest
    #[inline]
    pub fn us_to_samples(&self, us: f64) -> u32 {
        (us * self.sample_rate as f64 / 1.0e6).round().max(0.0) as u32
    }

    /// Total burst duration (µs)
    pub fn duration_us(&self) -> f64 {
        let total: u64 = self.pairs().map(|(p, g)| p as u64 + g as u64).sum();
        total as f64 * 1.0e6 / self.sample_rate as f64
    }

    /// Copy of this burst at a different sampling rate
    ///
    /// Every width is rescaled, rounding to nearest. Metadata is
    /// copied unchanged.
    pub fn resampled(&self, sample_rate: u32) -> Result<PulseData, PulseError> {
        if sample_rate == 0 {
            return Err(PulseError::ZeroSampleRate);
        }

        let ratio = sample_rate as f64 / self.sample_rate as f64;
        let scale = |w: u32| (w as f64 * ratio).round() as u32;

        let mut out = self.clone();
        out.sample_rate = sample_rate;
        out.pulse = self.pulse.iter().map(|w| scale(*w)).collect();
        out.gap = self.gap.iter().map(|w| scale(*w)).collect();
        Ok(out)
    }

    /// Remove all pulses, keeping the metadata
    pub(crate) fn clear_pulses(&mut self) {
        self.pulse.clear();
        self.gap.clear();
        self.truncated = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use assert_approx_eq::assert_approx_eq;

    #[test]
    fn test_new_rejects_zero_rate() {
        assert_eq!(PulseData::new(0), Err(PulseError::ZeroSampleRate));

        let pd = PulseData::new(250000).expect("valid rate");
        assert_eq!(pd.num_pulses(), 0);
        assert_eq!(pd.fsk_f2_est, 0);
        assert_eq!(pd.modulation(), Modulation::Ook);
        assert!(!pd.is_decodable());
    }

    #[test]
    fn test_from_pairs() {
        let pd = PulseData::from_pairs(250000, &[40, 60, 40, 64, 140]).unwrap();
        assert_eq!(pd.num_pulses(), 3);
        assert_eq!(pd.pulses(), &[40, 40, 140]);
        assert_eq!(pd.gaps(), &[60, 64, 0]);
        assert_eq!(pd.to_alternating(), vec![40, 60, 40, 64, 140, 0]);
    }

    #[test]
    fn test_capacity_clamp() {
        let input: Vec<u32> = std::iter::repeat(10).take(2 * (PD_MAX + 1)).collect();
        let pd = PulseData::from_pairs(1000000, &input).unwrap();
        assert_eq!(pd.num_pulses(), PD_MAX);
        assert!(pd.is_truncated());

        let input: Vec<u32> = std::iter::repeat(10).take(2 * PD_MAX).collect();
        let pd = PulseData::from_pairs(1000000, &input).unwrap();
        assert_eq!(pd.num_pulses(), PD_MAX);
        assert!(!pd.is_truncated());
    }

    #[test]
    fn test_unit_conversion() {
        let mut pd = PulseData::from_pairs(250000, &[100, 200]).unwrap();
        assert_approx_eq!(pd.samples_to_us(100), 400.0f64);
        assert_eq!(pd.us_to_samples(400.0), 100);
        assert_approx_eq!(pd.duration_us(), 1200.0f64);

        pd.fsk_f2_est = -10916;
        assert_eq!(pd.modulation(), Modulation::Fsk);
        assert_eq!(pd.modulation().to_string(), "FSK");
        assert_eq!("ook".parse::<Modulation>(), Ok(Modulation::Ook));
    }

    #[test]
    fn test_resampled() {
        let pd = PulseData::from_pairs(1000000, &[400, 800, 1200, 4000]).unwrap();
        let rs = pd.resampled(250000).unwrap();
        assert_eq!(rs.sample_rate(), 250000);
        assert_eq!(rs.to_alternating(), vec![100, 200, 300, 1000]);
        assert!(pd.resampled(0).is_err());
    }
}
