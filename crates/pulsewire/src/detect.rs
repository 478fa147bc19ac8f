//! Pulse detector
//!
//! Slices the level and FM streams of successive IQ frames into
//! bursts of pulses and gaps. One burst may span any number of
//! frames.
//!
//! ## OOK
//!
//! The level stream is compared against a threshold halfway
//! between a running *low* (noise) estimate and a running *high*
//! (carrier) estimate, with ⅛ hysteresis:
//!
//! ```txt
//!          ┌──────── rising edge ────────┐
//!          ▼                             │
//!   Idle ──► Pulse ──► GapStart ──► Gap ─┘
//!    ▲         │                     │
//!    └─────────┴── short / long gap ─┘
//! ```
//!
//! Pulses shorter than ten samples are glitches. A burst closes
//! when a gap grows longer than ten times the longest pulse *and*
//! longer than 10 ms, or longer than 100 ms in any case.
//!
//! ## FSK
//!
//! While the first OOK pulse of a burst is in progress, the FM
//! stream is fed to an FSK slicer. If the slicer finds more than
//! [`PD_MIN_PULSES`] mark/space alternations inside that one
//! carrier, the burst is emitted as FSK instead of OOK. Two
//! slicers are available; see [`FskMode`].

use std::num::NonZeroU32;

use strum_macros::{Display, EnumString};

#[cfg(not(test))]
use log::{debug, warn};

#[cfg(test)]
use std::{println as debug, println as warn};

use crate::baseband::{
    db_to_amp, db_to_mag, Baseband, BasebandFrame, AMP_RANGE_DB, MAG_RANGE_DB,
};
use crate::iq::IqFrame;
use crate::level::LevelTracker;
use crate::pulse::{Modulation, PulseData, PD_MAX, PD_MIN_PULSES};

/// Default FSK detector switch-over frequency (Hz)
///
/// Above this center frequency, [`FskMode::Auto`] selects the
/// min/max slicer.
pub const FSK_PULSE_DETECTOR_LIMIT: f64 = 800_000_000.0;

/// Minimum FM deviation between mark and space
pub const FSK_DEFAULT_FM_DELTA: i32 = 6000;

/// Default fixed level: automatic (dB)
pub const DEFAULT_LEVEL_DB: f32 = 0.0;

/// Default minimum detection level (dB)
pub const DEFAULT_MIN_LEVEL_DB: f32 = -12.0;

/// Default minimum signal-to-noise ratio (dB)
pub const DEFAULT_MIN_SNR_DB: f32 = 9.0;

const PD_MIN_PULSE_SAMPLES: u32 = 10;
const PD_MAX_GAP_RATIO: u32 = 10;
const PD_MIN_GAP_MS: u32 = 10;
const PD_MAX_GAP_MS: u32 = 100;

const OOK_EST_HIGH_RATIO: i32 = 64;
const OOK_EST_LOW_RATIO: i32 = 1024;
const OOK_MAX_HIGH_LEVEL: i32 = 16384;

const FSK_EST_FAST: i32 = 16;
const FSK_EST_SLOW: i32 = 64;

// min/max slicer ignores the start-up transient
const FSK_MINMAX_SKIP: u32 = 40;

const FM_CUTOFF_CLASSIC: f32 = 0.1;
const FM_CUTOFF_MINMAX: f32 = 0.2;

/// FSK slicer selection
#[derive(Clone, Copy, Debug, PartialEq, Eq, Display, EnumString)]
pub enum FskMode {
    /// Choose by center frequency
    #[strum(serialize = "auto", ascii_case_insensitive)]
    Auto,

    /// Classic slicer
    ///
    /// Tracks the mark and space frequencies with separate
    /// running estimates and switches to whichever is closer.
    #[strum(serialize = "classic", serialize = "old", ascii_case_insensitive)]
    Old,

    /// Min/max slicer
    ///
    /// Slices at the midpoint of the observed FM extremes with
    /// ⅛ hysteresis. Tolerates the larger carrier offsets of
    /// high-band receivers.
    #[strum(serialize = "minmax", serialize = "new", ascii_case_insensitive)]
    New,
}

impl FskMode {
    /// Resolve `Auto` for a receiver tuned to `center_freq` (Hz)
    ///
    /// `Auto` becomes `New` strictly above `limit`, and `Old`
    /// otherwise. The other modes resolve to themselves.
    pub fn resolve(self, center_freq: f64, limit: f64) -> FskMode {
        match self {
            FskMode::Auto if center_freq > limit => FskMode::New,
            FskMode::Auto => FskMode::Old,
            other => other,
        }
    }
}

impl Default for FskMode {
    fn default() -> Self {
        FskMode::Auto
    }
}

/// One detected burst
#[derive(Clone, Debug, PartialEq)]
pub struct Burst {
    /// Pulse and gap widths with metadata
    pub pulse: PulseData,

    /// OOK or FSK
    pub modulation: Modulation,
}

/// Builds a [`PulseDetector`]
///
/// ```
/// use pulsewire::{FskMode, PulseDetectorBuilder};
///
/// let detector = PulseDetectorBuilder::new(250_000)
///     .with_center_frequency(433.92e6)
///     .with_min_level(-15.0)
///     .with_fsk_mode(FskMode::Old)
///     .build();
/// assert_eq!(detector.fsk_mode(), FskMode::Old);
/// ```
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PulseDetectorBuilder {
    sample_rate: u32,
    center_freq: f64,
    level_db: f32,
    min_level_db: f32,
    min_snr_db: f32,
    auto_level: bool,
    squelch: bool,
    use_mag_est: bool,
    fsk_mode: FskMode,
    fsk_limit: f64,
    analyze: bool,
}

impl PulseDetectorBuilder {
    /// New detector configuration for the given `sample_rate` (Hz)
    pub fn new(sample_rate: u32) -> Self {
        Self {
            sample_rate: sample_rate.max(1),
            center_freq: 0.0,
            level_db: DEFAULT_LEVEL_DB,
            min_level_db: DEFAULT_MIN_LEVEL_DB,
            min_snr_db: DEFAULT_MIN_SNR_DB,
            auto_level: false,
            squelch: false,
            use_mag_est: false,
            fsk_mode: FskMode::Auto,
            fsk_limit: FSK_PULSE_DETECTOR_LIMIT,
            analyze: false,
        }
    }

    /// Build the detector
    pub fn build(&self) -> PulseDetector {
        PulseDetector::from(self)
    }

    /// Receiver center frequency (Hz)
    pub fn with_center_frequency(&mut self, hz: f64) -> &mut Self {
        self.center_freq = hz.max(0.0);
        self
    }

    /// Fixed detection level (dB full scale)
    ///
    /// Negative values replace the adaptive threshold with a
    /// fixed one. Zero or positive values select the adaptive
    /// threshold.
    pub fn with_level(&mut self, db: f32) -> &mut Self {
        self.level_db = db.min(0.0);
        self
    }

    /// Minimum detection level (dB full scale)
    pub fn with_min_level(&mut self, db: f32) -> &mut Self {
        self.min_level_db = db.clamp(-99.0, 0.0);
        self
    }

    /// Minimum signal-to-noise ratio (dB)
    pub fn with_min_snr(&mut self, db: f32) -> &mut Self {
        self.min_snr_db = db.clamp(0.0, 99.0);
        self
    }

    /// Lower the minimum level to follow a quiet noise floor
    pub fn with_auto_level(&mut self, on: bool) -> &mut Self {
        self.auto_level = on;
        self
    }

    /// Skip frames which contain only noise
    pub fn with_squelch(&mut self, on: bool) -> &mut Self {
        self.squelch = on;
        self
    }

    /// Use magnitude instead of amplitude for `cu8` input
    pub fn with_magnitude_estimate(&mut self, on: bool) -> &mut Self {
        self.use_mag_est = on;
        self
    }

    /// FSK slicer
    pub fn with_fsk_mode(&mut self, mode: FskMode) -> &mut Self {
        self.fsk_mode = mode;
        self
    }

    /// Center frequency above which `Auto` means `New` (Hz)
    pub fn with_fsk_limit(&mut self, hz: f64) -> &mut Self {
        self.fsk_limit = hz;
        self
    }

    /// Process every frame, even with squelch enabled
    pub fn with_analyze(&mut self, on: bool) -> &mut Self {
        self.analyze = on;
        self
    }

    /// Sampling rate (Hz)
    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Center frequency (Hz)
    pub fn center_frequency(&self) -> f64 {
        self.center_freq
    }

    /// Fixed level (dB), or zero for adaptive
    pub fn level(&self) -> f32 {
        self.level_db
    }

    /// Minimum level (dB)
    pub fn min_level(&self) -> f32 {
        self.min_level_db
    }

    /// Minimum SNR (dB)
    pub fn min_snr(&self) -> f32 {
        self.min_snr_db
    }

    /// Configured FSK mode, before resolution
    pub fn fsk_mode(&self) -> FskMode {
        self.fsk_mode
    }
}

impl Default for PulseDetectorBuilder {
    fn default() -> Self {
        Self::new(crate::json::DEFAULT_SAMPLE_RATE)
    }
}

impl From<&PulseDetectorBuilder> for PulseDetector {
    fn from(cfg: &PulseDetectorBuilder) -> Self {
        let fsk_mode = cfg.fsk_mode.resolve(cfg.center_freq, cfg.fsk_limit);
        let fm_cutoff = match fsk_mode {
            FskMode::New => FM_CUTOFF_MINMAX,
            _ => FM_CUTOFF_CLASSIC,
        };

        Self {
            sample_rate: NonZeroU32::new(cfg.sample_rate).unwrap_or(NonZeroU32::MIN),
            center_freq: cfg.center_freq,
            level_db: cfg.level_db,
            min_snr_db: cfg.min_snr_db,
            baseband: Baseband::new(cfg.use_mag_est, fm_cutoff),
            tracker: LevelTracker::new(cfg.min_level_db)
                .with_auto_level(cfg.auto_level)
                .with_squelch(cfg.squelch)
                .with_analyze(cfg.analyze),
            state: OokState::Idle,
            pulse_length: 0,
            max_pulse: 0,
            ook_low: 0,
            ook_high: 0,
            ook: Train::new(),
            fsk_train: Train::new(),
            fsk: FskSlicer::new(fsk_mode),
            position: 0,
        }
    }
}

/// Pulse detector
///
/// Feed it consecutive frames with [`process()`](Self::process).
/// Each call returns the bursts which closed during that frame.
#[derive(Clone, Debug)]
pub struct PulseDetector {
    sample_rate: NonZeroU32,
    center_freq: f64,
    level_db: f32,
    min_snr_db: f32,

    // conversion and squelch
    baseband: Baseband,
    tracker: LevelTracker,

    // OOK slicer
    state: OokState,
    pulse_length: u32,
    max_pulse: u32,
    ook_low: i32,
    ook_high: i32,
    ook: Train,

    // FSK slicer, within the first OOK pulse
    fsk_train: Train,
    fsk: FskSlicer,

    // samples consumed before the current frame
    position: u64,
}

impl PulseDetector {
    /// Slice one frame
    ///
    /// Returns the bursts that ended within `frame`, in order.
    /// A burst still in progress at the end of the frame
    /// continues into the next one.
    pub fn process(&mut self, frame: &IqFrame) -> Vec<Burst> {
        let mut out = Vec::new();
        let len = frame.len();
        if len == 0 {
            return out;
        }

        let use_mag = self.baseband.uses_magnitude(frame);
        let bb = self.baseband.process(frame);
        let verdict = self.tracker.update(bb.avg_db);
        if !verdict.process {
            self.position += len as u64;
            return out;
        }

        let levels = Levels::new(
            use_mag,
            self.level_db,
            self.tracker.min_level_db(),
            self.min_snr_db,
        );

        // trains in progress move one frame further back
        self.ook.start_ago = self.ook.start_ago.saturating_add(len as u32);
        self.fsk_train.start_ago = self.fsk_train.start_ago.saturating_add(len as u32);
        self.ook_high = self.ook_high.max(levels.min_high);

        let mut i = 0;
        while i < len {
            match self.step(i, &bb, &levels) {
                Some(kind) => {
                    let mut burst = self.emit(kind, frame, &levels);
                    burst.pulse.end_ago = (len - i) as u32;
                    debug!(
                        "detector: {} burst at offset {}, {} pulses",
                        burst.modulation,
                        burst.pulse.offset,
                        burst.pulse.num_pulses()
                    );
                    out.push(burst);
                    self.ook_high = self.ook_high.max(levels.min_high);
                    // sample i is sliced again from Idle
                }
                None => i += 1,
            }
        }

        self.position += len as u64;
        out
    }

    /// Discard any burst in progress
    ///
    /// Noise estimates and filter states are kept.
    pub fn reset(&mut self) {
        self.state = OokState::Idle;
        self.pulse_length = 0;
        self.max_pulse = 0;
        self.ook.clear();
        self.fsk_train.clear();
        self.fsk.restart();
    }

    /// Resolved FSK slicer
    pub fn fsk_mode(&self) -> FskMode {
        self.fsk.mode
    }

    /// Minimum detection level in effect (dB)
    pub fn min_level_db(&self) -> f32 {
        self.tracker.min_level_db()
    }

    /// Noise floor estimate (dB)
    pub fn noise_db(&self) -> f32 {
        self.tracker.noise_db()
    }

    /// Samples consumed so far
    pub fn position(&self) -> u64 {
        self.position
    }

    /// True if a burst is in progress
    pub fn is_busy(&self) -> bool {
        self.state != OokState::Idle
    }

    // Slice sample `i`. Returns the kind of burst to emit, if any.
    fn step(&mut self, i: usize, bb: &BasebandFrame, lv: &Levels) -> Option<Modulation> {
        let am = bb.level[i];
        let fm = bb.fm[i];
        let len = bb.level.len();

        let threshold = if lv.fixed_high > 0 {
            lv.fixed_high
        } else {
            (self.ook_low + self.ook_high) / 2
        };
        let hysteresis = threshold / 8;

        match self.state {
            OokState::Idle => {
                if am > threshold + hysteresis && am > lv.min_high {
                    self.ook.clear();
                    self.fsk_train.clear();
                    self.ook.offset = self.position + i as u64;
                    self.fsk_train.offset = self.ook.offset;
                    self.ook.start_ago = (len - i) as u32;
                    self.fsk_train.start_ago = self.ook.start_ago;
                    self.pulse_length = 0;
                    self.max_pulse = 0;
                    self.fsk.restart();
                    self.state = OokState::Pulse;
                } else {
                    let delta = am - self.ook_low;
                    self.ook_low += delta / OOK_EST_LOW_RATIO;
                    self.ook_low += if delta > 0 { 1 } else { -1 };
                    let high = (lv.ratio * self.ook_low as f32) as i32;
                    self.ook_high = high.min(OOK_MAX_HIGH_LEVEL).max(lv.min_high);
                }
            }
            OokState::Pulse => {
                self.pulse_length += 1;
                if am < threshold - hysteresis {
                    if self.pulse_length < PD_MIN_PULSE_SAMPLES {
                        // glitch
                        self.state = OokState::Idle;
                    } else {
                        self.ook.pulse[self.ook.num] = self.pulse_length;
                        self.max_pulse = self.max_pulse.max(self.pulse_length);
                        self.pulse_length = 0;
                        self.state = OokState::GapStart;
                    }
                } else {
                    self.ook_high += am / OOK_EST_HIGH_RATIO - self.ook_high / OOK_EST_HIGH_RATIO;
                    self.ook_high = self.ook_high.min(OOK_MAX_HIGH_LEVEL).max(lv.min_high);
                    self.ook.f1_est +=
                        fm as i32 / OOK_EST_HIGH_RATIO - self.ook.f1_est / OOK_EST_HIGH_RATIO;
                }
                if self.ook.num == 0 {
                    self.fsk.input(fm, &mut self.fsk_train);
                }
            }
            OokState::GapStart => {
                self.pulse_length += 1;
                if am > threshold + hysteresis {
                    // spurious gap: resume the pulse
                    self.pulse_length += self.ook.pulse[self.ook.num];
                    self.state = OokState::Pulse;
                } else if self.pulse_length >= PD_MIN_PULSE_SAMPLES {
                    self.state = OokState::Gap;
                    if self.fsk_train.num > PD_MIN_PULSES {
                        self.fsk.wrap_up(&mut self.fsk_train);
                        self.fsk_train.f1_est = self.fsk.f1_est;
                        self.fsk_train.f2_est = self.fsk.f2_est;
                        self.state = OokState::Idle;
                        return Some(Modulation::Fsk);
                    }
                }
                if self.ook.num == 0 {
                    self.fsk.input(fm, &mut self.fsk_train);
                }
            }
            OokState::Gap => {
                self.pulse_length += 1;
                if am > threshold + hysteresis {
                    self.ook.gap[self.ook.num] = self.pulse_length;
                    self.ook.num += 1;
                    if self.ook.num >= PD_MAX {
                        warn!(
                            "detector: burst at offset {} reached {} pulses, splitting",
                            self.ook.offset, PD_MAX
                        );
                        self.state = OokState::Idle;
                        return Some(Modulation::Ook);
                    }
                    self.pulse_length = 0;
                    self.state = OokState::Pulse;
                }

                let samples_per_ms = self.sample_rate.get() / 1000;
                let gap = self.pulse_length;
                if (gap > PD_MAX_GAP_RATIO.saturating_mul(self.max_pulse)
                    && gap > PD_MIN_GAP_MS * samples_per_ms)
                    || gap > PD_MAX_GAP_MS * samples_per_ms
                {
                    self.ook.gap[self.ook.num] = gap;
                    self.ook.num += 1;
                    self.state = OokState::Idle;
                    return Some(Modulation::Ook);
                }
            }
        }

        None
    }

    // Package the finished train of the given kind
    fn emit(&self, kind: Modulation, frame: &IqFrame, lv: &Levels) -> Burst {
        let train = match kind {
            Modulation::Fsk => &self.fsk_train,
            _ => &self.ook,
        };

        let mut pulse = train.to_pulse_data(self.sample_rate);
        pulse.offset = train.offset;
        pulse.start_ago = train.start_ago;
        pulse.centerfreq_hz = self.center_freq;
        pulse.depth_bits = frame.depth_bits();
        pulse.ook_low_estimate = self.ook_low;
        pulse.ook_high_estimate = self.ook_high;
        pulse.fsk_f1_est = train.f1_est;
        pulse.fsk_f2_est = match kind {
            // a zero second estimate would read as OOK
            Modulation::Fsk if train.f2_est == 0 => -1,
            Modulation::Fsk => train.f2_est,
            _ => 0,
        };
        calc_rssi_snr(&mut pulse, lv.use_mag);

        Burst {
            modulation: pulse.modulation(),
            pulse,
        }
    }
}

/// Compute signal quality and carrier frequencies of a burst
///
/// Uses the OOK level estimates and FSK frequency estimates
/// already stored in `data`. Frequency estimates are scaled
/// from the FM discriminator range (±32767 = ± half the sample
/// rate) and offset by the center frequency. The second
/// frequency is only filled in for FSK bursts.
pub fn calc_rssi_snr(data: &mut PulseData, use_mag: bool) {
    let high = data.ook_high_estimate.max(1) as f32;
    let low = data.ook_low_estimate.max(1) as f32;
    let asnr = high / low;

    let scale = data.sample_rate() as f64 / 2.0 / i16::MAX as f64;
    data.freq1_hz = data.fsk_f1_est as f64 * scale + data.centerfreq_hz;
    if data.modulation() == Modulation::Fsk {
        data.freq2_hz = data.fsk_f2_est as f64 * scale + data.centerfreq_hz;
    } else {
        data.freq2_hz = 0.0;
    }

    if use_mag {
        data.range_db = MAG_RANGE_DB;
        data.rssi_db = 20.0 * high.log10() - MAG_RANGE_DB;
        data.noise_db = 20.0 * low.log10() - MAG_RANGE_DB;
        data.snr_db = 20.0 * asnr.log10();
    } else {
        data.range_db = AMP_RANGE_DB;
        data.rssi_db = 10.0 * high.log10() - AMP_RANGE_DB;
        data.noise_db = 10.0 * low.log10() - AMP_RANGE_DB;
        data.snr_db = 10.0 * asnr.log10();
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum OokState {
    Idle,
    Pulse,
    GapStart,
    Gap,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum FskState {
    Init,
    F1,
    F2,
    Error,
}

// Thresholds for one frame
#[derive(Clone, Copy, Debug)]
struct Levels {
    use_mag: bool,
    fixed_high: i32,
    min_high: i32,
    ratio: f32,
}

impl Levels {
    fn new(use_mag: bool, level_db: f32, min_level_db: f32, min_snr_db: f32) -> Self {
        let (to_level, snr_div) = if use_mag {
            (db_to_mag as fn(f32) -> f32, 20.0)
        } else {
            (db_to_amp as fn(f32) -> f32, 10.0)
        };
        Self {
            use_mag,
            fixed_high: if level_db < 0.0 {
                to_level(level_db) as i32
            } else {
                0
            },
            min_high: to_level(min_level_db) as i32,
            ratio: 10.0f32.powf(min_snr_db / snr_div),
        }
    }
}

// Pulse train under construction
//
// Indexed storage with one spare slot, so the slicers may write
// pulse[num] and gap[num] before advancing.
#[derive(Clone, Debug)]
struct Train {
    pulse: Vec<u32>,
    gap: Vec<u32>,
    num: usize,
    offset: u64,
    start_ago: u32,
    f1_est: i32,
    f2_est: i32,
}

impl Train {
    fn new() -> Self {
        Self {
            pulse: vec![0; PD_MAX + 1],
            gap: vec![0; PD_MAX + 1],
            num: 0,
            offset: 0,
            start_ago: 0,
            f1_est: 0,
            f2_est: 0,
        }
    }

    fn clear(&mut self) {
        self.pulse.iter_mut().for_each(|w| *w = 0);
        self.gap.iter_mut().for_each(|w| *w = 0);
        self.num = 0;
        self.f1_est = 0;
        self.f2_est = 0;
    }

    fn to_pulse_data(&self, sample_rate: NonZeroU32) -> PulseData {
        let mut out = PulseData::with_rate(sample_rate);
        for k in 0..self.num.min(PD_MAX) {
            out.push(self.pulse[k], self.gap[k]);
        }
        out
    }
}

// FSK slicer state
#[derive(Clone, Debug)]
struct FskSlicer {
    mode: FskMode,
    state: FskState,
    pulse_length: u32,
    f1_est: i32,
    f2_est: i32,
    var_max: i32,
    var_min: i32,
    skip: u32,
}

impl FskSlicer {
    fn new(mode: FskMode) -> Self {
        let mut out = Self {
            mode,
            state: FskState::Init,
            pulse_length: 0,
            f1_est: 0,
            f2_est: 0,
            var_max: 0,
            var_min: 0,
            skip: 0,
        };
        out.restart();
        out
    }

    fn restart(&mut self) {
        self.state = FskState::Init;
        self.pulse_length = 0;
        self.f1_est = 0;
        self.f2_est = 0;
        self.var_max = i16::MIN as i32;
        self.var_min = i16::MAX as i32;
        self.skip = FSK_MINMAX_SKIP;
    }

    fn input(&mut self, fm: i16, t: &mut Train) {
        match self.mode {
            FskMode::New => self.minmax(fm as i32, t),
            _ => self.classic(fm as i32, t),
        }
    }

    fn classic(&mut self, fm: i32, t: &mut Train) {
        let f1_delta = (fm - self.f1_est).abs();
        let f2_delta = (fm - self.f2_est).abs();
        self.pulse_length += 1;

        match self.state {
            FskState::Init => {
                if self.pulse_length < PD_MIN_PULSE_SAMPLES {
                    self.f1_est = self.f1_est / 2 + fm / 2;
                } else if f1_delta > FSK_DEFAULT_FM_DELTA / 2 {
                    if fm > self.f1_est {
                        // the initial frequency was the space
                        self.state = FskState::F1;
                        self.f2_est = self.f1_est;
                        self.f1_est = fm;
                        t.pulse[0] = 0;
                        t.gap[0] = self.pulse_length;
                        t.num += 1;
                        self.pulse_length = 0;
                    } else {
                        self.state = FskState::F2;
                        self.f2_est = fm;
                        t.pulse[0] = self.pulse_length;
                        self.pulse_length = 0;
                    }
                } else {
                    self.f1_est += fm / FSK_EST_FAST - self.f1_est / FSK_EST_FAST;
                }
            }
            FskState::F1 => {
                if f1_delta > f2_delta {
                    self.end_mark(t);
                } else if fm > self.f1_est {
                    self.f1_est += fm / FSK_EST_FAST - self.f1_est / FSK_EST_FAST;
                } else {
                    self.f1_est += fm / FSK_EST_SLOW - self.f1_est / FSK_EST_SLOW;
                }
            }
            FskState::F2 => {
                if f2_delta > f1_delta {
                    self.end_space(t);
                } else if fm < self.f2_est {
                    self.f2_est += fm / FSK_EST_FAST - self.f2_est / FSK_EST_FAST;
                } else {
                    self.f2_est += fm / FSK_EST_SLOW - self.f2_est / FSK_EST_SLOW;
                }
            }
            FskState::Error => {}
        }
    }

    fn minmax(&mut self, fm: i32, t: &mut Train) {
        self.pulse_length += 1;
        if self.skip > 0 {
            self.skip -= 1;
            return;
        }

        self.var_max = self.var_max.max(fm);
        self.var_min = self.var_min.min(fm);
        let spread = self.var_max - self.var_min;
        if spread < FSK_DEFAULT_FM_DELTA / 2 {
            return;
        }

        let mid = (self.var_max + self.var_min) / 2;
        let hysteresis = spread / 8;
        let high = fm > mid + hysteresis;
        let low = fm < mid - hysteresis;

        match self.state {
            FskState::Init => {
                if high {
                    self.state = FskState::F1;
                    self.f1_est = fm;
                    self.f2_est = self.var_min;
                    t.pulse[0] = 0;
                    t.gap[0] = self.pulse_length;
                    t.num += 1;
                    self.pulse_length = 0;
                } else if low {
                    self.state = FskState::F2;
                    self.f1_est = self.var_max;
                    self.f2_est = fm;
                    t.pulse[0] = self.pulse_length;
                    self.pulse_length = 0;
                }
            }
            FskState::F1 => {
                if low {
                    self.end_mark(t);
                } else {
                    self.f1_est += fm / FSK_EST_FAST - self.f1_est / FSK_EST_FAST;
                }
            }
            FskState::F2 => {
                if high {
                    self.end_space(t);
                } else {
                    self.f2_est += fm / FSK_EST_FAST - self.f2_est / FSK_EST_FAST;
                }
            }
            FskState::Error => {}
        }
    }

    // Mark → space transition
    fn end_mark(&mut self, t: &mut Train) {
        self.state = FskState::F2;
        if self.pulse_length >= PD_MIN_PULSE_SAMPLES {
            t.pulse[t.num] = self.pulse_length;
            self.pulse_length = 0;
            return;
        }

        // too short: fold back into the previous space
        match t.num.checked_sub(1) {
            Some(prev) => {
                self.pulse_length += t.gap[prev];
                t.num = prev;
                if t.num == 0 && t.pulse[0] == 0 {
                    self.f1_est = self.f2_est;
                    self.state = FskState::Init;
                }
            }
            None => self.state = FskState::Init,
        }
    }

    // Space → mark transition
    fn end_space(&mut self, t: &mut Train) {
        self.state = FskState::F1;
        if self.pulse_length >= PD_MIN_PULSE_SAMPLES {
            t.gap[t.num] = self.pulse_length;
            t.num += 1;
            self.pulse_length = 0;
            if t.num >= PD_MAX {
                warn!("detector: FSK burst exceeds {} pulses", PD_MAX);
                self.state = FskState::Error;
            }
            return;
        }

        // too short: fold back into the previous mark
        self.pulse_length += t.pulse[t.num];
        if t.num == 0 {
            self.state = FskState::Init;
        }
    }

    // Close the final pulse or gap
    fn wrap_up(&mut self, t: &mut Train) {
        if t.num >= PD_MAX {
            return;
        }
        self.pulse_length += 1;
        if self.state == FskState::F1 {
            t.pulse[t.num] = self.pulse_length;
            t.gap[t.num] = 0;
        } else {
            t.gap[t.num] = self.pulse_length;
        }
        t.num += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::f32::consts::PI;
    use std::str::FromStr;

    const RATE: u32 = 250_000;

    // cu8 test signal generator
    struct Synth {
        phase: f32,
        seed: u32,
        out: Vec<u8>,
    }

    impl Synth {
        fn new() -> Self {
            Self {
                phase: 0.0,
                seed: 12345,
                out: Vec::new(),
            }
        }

        fn noise(&mut self) -> f32 {
            self.seed = self.seed.wrapping_mul(1664525).wrapping_add(1013904223);
            ((self.seed >> 16) % 5) as f32 - 2.0
        }

        fn push(&mut self, i: f32, q: f32) {
            let i = i + self.noise();
            let q = q + self.noise();
            self.out.push((127.5 + i).round().clamp(0.0, 255.0) as u8);
            self.out.push((127.5 + q).round().clamp(0.0, 255.0) as u8);
        }

        fn carrier(&mut self, n: usize, amplitude: f32, freq: f32) {
            for _ in 0..n {
                self.phase += 2.0 * PI * freq / RATE as f32;
                if self.phase > PI {
                    self.phase -= 2.0 * PI;
                } else if self.phase < -PI {
                    self.phase += 2.0 * PI;
                }
                self.push(amplitude * self.phase.cos(), amplitude * self.phase.sin());
            }
        }

        fn silence(&mut self, n: usize) {
            for _ in 0..n {
                self.push(0.0, 0.0);
            }
        }

        fn frame(&self) -> IqFrame {
            IqFrame::Cu8(self.out.clone())
        }
    }

    fn pwm_signal() -> Synth {
        let mut s = Synth::new();
        s.silence(5000);
        for k in 0..20 {
            if k % 2 == 0 {
                s.carrier(100, 100.0, 0.0);
                s.silence(200);
            } else {
                s.carrier(200, 100.0, 0.0);
                s.silence(100);
            }
        }
        s.silence(30000);
        s
    }

    fn fsk_signal() -> Synth {
        let mut s = Synth::new();
        s.silence(5000);
        for k in 0..40 {
            let freq = if k % 2 == 0 { 40_000.0 } else { -40_000.0 };
            s.carrier(100, 100.0, freq);
        }
        s.silence(30000);
        s
    }

    fn detector(mode: FskMode) -> PulseDetector {
        PulseDetectorBuilder::new(RATE)
            .with_center_frequency(433.92e6)
            .with_fsk_mode(mode)
            .build()
    }

    #[test]
    fn test_fsk_mode_resolve() {
        assert_eq!(FskMode::Auto.resolve(433.92e6, FSK_PULSE_DETECTOR_LIMIT), FskMode::Old);
        assert_eq!(FskMode::Auto.resolve(868.3e6, FSK_PULSE_DETECTOR_LIMIT), FskMode::New);
        assert_eq!(FskMode::Auto.resolve(433.92e6, 300.0e6), FskMode::New);
        assert_eq!(FskMode::Old.resolve(915.0e6, FSK_PULSE_DETECTOR_LIMIT), FskMode::Old);
        assert_eq!(FskMode::from_str("minmax"), Ok(FskMode::New));
        assert_eq!(FskMode::from_str("Classic"), Ok(FskMode::Old));

        let det = PulseDetectorBuilder::new(RATE)
            .with_center_frequency(915.0e6)
            .build();
        assert_eq!(det.fsk_mode(), FskMode::New);
    }

    #[test]
    fn test_builder_clamps() {
        let mut b = PulseDetectorBuilder::new(0);
        b.with_level(3.0).with_min_level(-200.0).with_min_snr(-5.0);
        assert_eq!(b.sample_rate(), 1);
        assert_eq!(b.level(), 0.0);
        assert_eq!(b.min_level(), -99.0);
        assert_eq!(b.min_snr(), 0.0);
    }

    #[test]
    fn test_ook_pwm() {
        let sig = pwm_signal();
        let mut det = detector(FskMode::Auto);
        let bursts = det.process(&sig.frame());
        assert_eq!(bursts.len(), 1);

        let b = &bursts[0];
        assert_eq!(b.modulation, Modulation::Ook);
        assert_eq!(b.pulse.num_pulses(), 20);
        assert_eq!(b.pulse.sample_rate(), RATE);
        assert_eq!(b.pulse.depth_bits, 8);
        assert!((b.pulse.offset as i64 - 5000).abs() < 10);
        assert_eq!(b.pulse.centerfreq_hz, 433.92e6);
        assert_eq!(b.pulse.freq2_hz, 0.0);

        for (k, (p, g)) in b.pulse.pairs().enumerate() {
            let (want_p, want_g) = if k % 2 == 0 { (100, 200) } else { (200, 100) };
            assert!((p as i32 - want_p).abs() <= 8, "pulse {}: {}", k, p);
            if k < 19 {
                assert!((g as i32 - want_g).abs() <= 8, "gap {}: {}", k, g);
            }
        }
        // closing gap exceeds 10 ms
        assert!(*b.pulse.gaps().last().unwrap() > 2500);

        // carrier at about 100² above a noise floor of a few units
        assert!(b.pulse.rssi_db > -10.0 && b.pulse.rssi_db < 0.0);
        assert!(b.pulse.snr_db > 20.0);
        assert!(!det.is_busy());
    }

    #[test]
    fn test_frames_are_seamless() {
        let sig = pwm_signal();
        let mut whole = detector(FskMode::Auto);
        let expect = whole.process(&sig.frame());

        let mut split = detector(FskMode::Auto);
        let mut got = Vec::new();
        for chunk in sig.out.chunks(4096 * 2) {
            got.extend(split.process(&IqFrame::Cu8(chunk.to_vec())));
        }
        assert_eq!(got.len(), expect.len());
        assert_eq!(got[0].pulse.pulses(), expect[0].pulse.pulses());
        assert_eq!(got[0].pulse.gaps(), expect[0].pulse.gaps());
        assert_eq!(got[0].pulse.offset, expect[0].pulse.offset);
        assert_eq!(split.position(), sig.out.len() as u64 / 2);
    }

    fn check_fsk(mode: FskMode) {
        let sig = fsk_signal();
        let mut det = detector(mode);
        let bursts = det.process(&sig.frame());
        assert_eq!(bursts.len(), 1);

        let b = &bursts[0];
        assert_eq!(b.modulation, Modulation::Fsk);
        let n = b.pulse.num_pulses();
        assert!((19..=21).contains(&n), "{} pulses", n);
        assert!(b.pulse.fsk_f1_est > 0);
        assert!(b.pulse.fsk_f2_est < 0);
        assert!(b.pulse.freq1_hz > 433.92e6);
        assert!(b.pulse.freq2_hz < 433.92e6);

        // interior marks and spaces
        for k in 1..15 {
            let p = b.pulse.pulses()[k] as i32;
            let g = b.pulse.gaps()[k] as i32;
            assert!((p - 100).abs() <= 10, "{:?} pulse {}: {}", mode, k, p);
            assert!((g - 100).abs() <= 10, "{:?} gap {}: {}", mode, k, g);
        }
    }

    #[test]
    fn test_fsk_classic() {
        check_fsk(FskMode::Old);
    }

    #[test]
    fn test_fsk_minmax() {
        check_fsk(FskMode::New);
    }

    #[test]
    fn test_weak_and_glitch() {
        // below the minimum level
        let mut s = Synth::new();
        s.silence(5000);
        s.carrier(2000, 20.0, 0.0);
        s.silence(30000);
        let mut det = detector(FskMode::Auto);
        assert!(det.process(&s.frame()).is_empty());

        // a one-sample spike
        let mut s = Synth::new();
        s.silence(5000);
        s.carrier(1, 100.0, 0.0);
        s.silence(30000);
        let mut det = detector(FskMode::Auto);
        assert!(det.process(&s.frame()).is_empty());
        assert!(!det.is_busy());
    }

    #[test]
    fn test_reset() {
        let sig = pwm_signal();
        let mut det = detector(FskMode::Auto);

        // stop in the middle of the burst
        let cut = 2 * (5000 + 1500);
        assert!(det.process(&IqFrame::Cu8(sig.out[..cut].to_vec())).is_empty());
        assert!(det.is_busy());
        det.reset();
        assert!(!det.is_busy());

        // the remainder is a shorter burst
        let bursts = det.process(&IqFrame::Cu8(sig.out[cut..].to_vec()));
        assert_eq!(bursts.len(), 1);
        assert!(bursts[0].pulse.num_pulses() < 20);
    }

    #[test]
    fn test_calc_rssi_snr() {
        let mut p = PulseData::new(RATE).unwrap();
        p.centerfreq_hz = 868.0e6;
        p.ook_high_estimate = 16384;
        p.ook_low_estimate = 16;
        p.fsk_f1_est = 16384;
        p.fsk_f2_est = -16384;
        calc_rssi_snr(&mut p, false);
        assert!(p.rssi_db.abs() < 1.0e-3);
        assert!((p.snr_db - 30.103).abs() < 1.0e-2);
        assert!((p.noise_db - -30.103).abs() < 1.0e-2);
        assert!((p.freq1_hz - 868.0625e6).abs() < 10.0);
        assert!((p.freq2_hz - 867.9375e6).abs() < 10.0);

        p.fsk_f2_est = 0;
        calc_rssi_snr(&mut p, true);
        assert_eq!(p.freq2_hz, 0.0);
        assert_eq!(p.range_db, MAG_RANGE_DB);
        assert!((p.snr_db - 60.206).abs() < 1.0e-2);
    }
}
