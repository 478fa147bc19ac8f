//! Pulse slicers
//!
//! A slicer turns the pulse and gap widths of a burst into rows
//! of bits, according to a line [`Coding`] and its [`Timing`].
//! FSK codings slice the same widths as their OOK
//! counterparts: in an FSK burst, a "pulse" is time spent on
//! the mark frequency.

use phf::phf_map;
use strum_macros::{Display, IntoStaticStr};

use crate::bitbuffer::BitBuffer;
use crate::pulse::{Modulation, PulseData};

/// Line coding of a decoder
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Display, IntoStaticStr)]
pub enum Coding {
    /// Non-return-to-zero, one symbol per `short` width
    #[strum(serialize = "OOK_PCM")]
    OokPcm,

    /// Pulse width: short pulse is 1, long pulse is 0
    #[strum(serialize = "OOK_PWM")]
    OokPwm,

    /// Pulse position: short gap is 0, long gap is 1
    #[strum(serialize = "OOK_PPM")]
    OokPpm,

    /// Manchester, with an implicit leading zero bit
    #[strum(serialize = "OOK_MC_ZEROBIT")]
    OokManchesterZeroBit,

    /// FSK, non-return-to-zero
    #[strum(serialize = "FSK_PCM")]
    FskPcm,

    /// FSK, pulse width
    #[strum(serialize = "FSK_PWM")]
    FskPwm,

    /// FSK, Manchester with an implicit leading zero bit
    #[strum(serialize = "FSK_MC_ZEROBIT")]
    FskManchesterZeroBit,
}

static CODINGS: phf::Map<&'static str, Coding> = phf_map! {
    "OOK_PCM" => Coding::OokPcm,
    "OOK_NRZ" => Coding::OokPcm,
    "OOK_RZ" => Coding::OokPcm,
    "OOK_PWM" => Coding::OokPwm,
    "OOK_PPM" => Coding::OokPpm,
    "OOK_MC_ZEROBIT" => Coding::OokManchesterZeroBit,
    "FSK_PCM" => Coding::FskPcm,
    "FSK_NRZ" => Coding::FskPcm,
    "FSK_PWM" => Coding::FskPwm,
    "FSK_MC_ZEROBIT" => Coding::FskManchesterZeroBit,
};

impl Coding {
    /// Look up a coding by name, ignoring case
    pub fn from_name(name: &str) -> Option<Coding> {
        CODINGS.get(name.trim().to_ascii_uppercase().as_str()).copied()
    }

    /// Modulation family of bursts this coding applies to
    pub fn modulation(self) -> Modulation {
        match self {
            Coding::FskPcm | Coding::FskPwm | Coding::FskManchesterZeroBit => Modulation::Fsk,
            _ => Modulation::Ook,
        }
    }

    /// True if the `long` width is required
    pub fn needs_long(self) -> bool {
        matches!(self, Coding::OokPwm | Coding::OokPpm | Coding::FskPwm)
    }
}

/// Timing of a line coding (µs)
///
/// Zero disables an optional limit.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Timing {
    /// Short pulse or gap, or the symbol width
    pub short_us: f64,
    /// Long pulse or gap
    pub long_us: f64,
    /// Sync pulse, skipped when sliced
    pub sync_us: f64,
    /// A gap longer than this starts a new row
    pub gap_us: f64,
    /// A gap longer than this ends the message
    pub reset_us: f64,
    /// Maximum deviation from a nominal width
    pub tolerance_us: f64,
}

/// Slice `data` with `coding` and `timing`
pub fn slice(coding: Coding, timing: &Timing, data: &PulseData) -> BitBuffer {
    let w = Widths::new(timing, data);
    match coding {
        Coding::OokPcm | Coding::FskPcm => slice_pcm(&w, data),
        Coding::OokPwm | Coding::FskPwm => slice_pwm(&w, data),
        Coding::OokPpm => slice_ppm(&w, data),
        Coding::OokManchesterZeroBit | Coding::FskManchesterZeroBit => slice_manchester(&w, data),
    }
}

// Timing converted to samples
struct Widths {
    short: f64,
    long: f64,
    sync: f64,
    gap: f64,
    reset: f64,
    tolerance: f64,
}

impl Widths {
    fn new(t: &Timing, data: &PulseData) -> Self {
        let scale = data.sample_rate() as f64 / 1.0e6;
        let tolerance = if t.tolerance_us > 0.0 {
            t.tolerance_us
        } else {
            // ¼ of the shortest nominal width
            let long = if t.long_us > 0.0 { t.long_us } else { t.short_us };
            t.short_us.min(long) / 4.0
        };
        Self {
            short: t.short_us * scale,
            long: if t.long_us > 0.0 { t.long_us } else { t.short_us } * scale,
            sync: t.sync_us * scale,
            gap: t.gap_us * scale,
            reset: t.reset_us * scale,
            tolerance: tolerance * scale,
        }
    }

    #[inline]
    fn is_reset(&self, gap: u32) -> bool {
        self.reset > 0.0 && gap as f64 > self.reset
    }

    #[inline]
    fn is_row_gap(&self, gap: u32) -> bool {
        self.gap > 0.0 && gap as f64 > self.gap
    }

    #[inline]
    fn near(&self, width: u32, nominal: f64) -> bool {
        (width as f64 - nominal).abs() <= self.tolerance
    }
}

fn slice_pcm(w: &Widths, data: &PulseData) -> BitBuffer {
    let mut bits = BitBuffer::new();
    if w.short <= 0.0 {
        return bits;
    }

    for (pulse, gap) in data.pairs() {
        let highs = (pulse as f64 / w.short).round() as usize;
        bits.add_bits(true, highs);

        if gap == 0 || w.is_reset(gap) || w.is_row_gap(gap) {
            bits.add_row();
        } else {
            let lows = (gap as f64 / w.long).round() as usize;
            bits.add_bits(false, lows);
        }
    }
    bits
}

fn slice_pwm(w: &Widths, data: &PulseData) -> BitBuffer {
    let mut bits = BitBuffer::new();
    let threshold = (w.short + w.long) / 2.0;
    let tolerate = w.tolerance > 0.0 && w.long > w.short;

    for (pulse, gap) in data.pairs() {
        if w.sync > 0.0 && w.near(pulse, w.sync) {
            bits.add_row();
        } else if tolerate && !w.near(pulse, w.short) && !w.near(pulse, w.long) {
            // neither width: the row is garbled
            bits.add_row();
        } else {
            bits.add_bit((pulse as f64) < threshold);
        }

        if gap == 0 || w.is_reset(gap) || w.is_row_gap(gap) {
            bits.add_row();
        }
    }
    bits
}

fn slice_ppm(w: &Widths, data: &PulseData) -> BitBuffer {
    let mut bits = BitBuffer::new();
    let threshold = (w.short + w.long) / 2.0;

    for (_, gap) in data.pairs() {
        if gap == 0 || w.is_reset(gap) || w.is_row_gap(gap) {
            bits.add_row();
        } else {
            bits.add_bit(gap as f64 >= threshold);
        }
    }
    bits
}

fn slice_manchester(w: &Widths, data: &PulseData) -> BitBuffer {
    let mut bits = BitBuffer::new();
    if w.short <= 0.0 {
        return bits;
    }

    // an edge more than 1½ half-bits after the last mid-bit
    // edge is itself a mid-bit edge
    let limit = w.short * 1.5;
    let mut since = 0.0;
    let mut fresh = true;

    for (pulse, gap) in data.pairs() {
        if fresh {
            bits.add_bit(false);
            fresh = false;
        }
        if pulse as f64 + since > limit {
            bits.add_bit(true);
            since = 0.0;
        } else {
            since += pulse as f64;
        }

        if gap == 0 || w.is_reset(gap) {
            bits.add_row();
            fresh = true;
            since = 0.0;
        } else if gap as f64 + since > limit {
            bits.add_bit(false);
            since = 0.0;
        } else {
            since += gap as f64;
        }
    }
    bits
}

#[cfg(test)]
mod tests {
    use super::*;

    // 1 µs per sample
    fn burst(alternating: &[u32]) -> PulseData {
        PulseData::from_pairs(1_000_000, alternating).unwrap()
    }

    fn timing(short: f64, long: f64, reset: f64) -> Timing {
        Timing {
            short_us: short,
            long_us: long,
            reset_us: reset,
            ..Timing::default()
        }
    }

    #[test]
    fn test_coding_names() {
        assert_eq!(Coding::from_name("ook_pwm"), Some(Coding::OokPwm));
        assert_eq!(Coding::from_name(" FSK_PCM "), Some(Coding::FskPcm));
        assert_eq!(Coding::from_name("OOK_NRZ"), Some(Coding::OokPcm));
        assert_eq!(Coding::from_name("OOK_DMC"), None);
        assert_eq!(Coding::FskManchesterZeroBit.to_string(), "FSK_MC_ZEROBIT");
        assert_eq!(Coding::FskPwm.modulation(), Modulation::Fsk);
        assert_eq!(Coding::OokPpm.modulation(), Modulation::Ook);
    }

    #[test]
    fn test_pcm() {
        // 1 00 11 0 1 | 1
        let data = burst(&[100, 200, 200, 100, 100, 5000, 100, 0]);
        let bits = slice(Coding::OokPcm, &timing(100.0, 100.0, 1000.0), &data);
        assert_eq!(bits.num_rows(), 2);
        assert_eq!(bits.row(0), Some((&[0x9au8][..], 7)));
        assert_eq!(bits.row(1), Some((&[0x80u8][..], 1)));
    }

    #[test]
    fn test_pwm() {
        let t = Timing {
            short_us: 300.0,
            long_us: 900.0,
            gap_us: 2000.0,
            reset_us: 6000.0,
            ..Timing::default()
        };
        let data = burst(&[
            310, 900, 890, 300, 305, 900, 910, 3000, // 1 0 1 0 | row
            300, 900, 300, 9000,
        ]);
        let bits = slice(Coding::OokPwm, &t, &data);
        assert_eq!(bits.num_rows(), 2);
        assert_eq!(bits.row(0), Some((&[0xa0u8][..], 4)));
        assert_eq!(bits.row(1), Some((&[0xc0u8][..], 2)));

        // a pulse of neither width garbles the row
        let data = burst(&[300, 900, 600, 900, 900, 900, 300, 0]);
        let bits = slice(Coding::OokPwm, &t, &data);
        assert_eq!(bits.num_rows(), 2);
        assert_eq!(bits.row(0), Some((&[0x80u8][..], 1)));
        assert_eq!(bits.row(1), Some((&[0x40u8][..], 2)));
    }

    #[test]
    fn test_ppm() {
        let t = timing(1000.0, 2000.0, 4000.0);
        let data = burst(&[500, 1000, 500, 2000, 500, 2000, 500, 1000, 500, 9000]);
        let bits = slice(Coding::OokPpm, &t, &data);
        assert_eq!(bits.num_rows(), 1);
        assert_eq!(bits.row(0), Some((&[0x60u8][..], 4)));
    }

    #[test]
    fn test_manchester_zerobit() {
        // half-bit 100 µs, bits 0 1 1 0 0 1
        // levels (0)1 10 10 01 01 10
        let data = burst(&[200, 100, 100, 200, 100, 100, 200, 0]);
        let bits = slice(Coding::OokManchesterZeroBit, &timing(100.0, 0.0, 1000.0), &data);
        assert_eq!(bits.row(0), Some((&[0x64u8][..], 6)));
        assert_eq!(bits.num_rows(), 1);
    }
}
