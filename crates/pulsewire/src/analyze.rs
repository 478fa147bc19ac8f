//! Pulse analysis
//!
//! Summarizes a burst for a human: width distributions, level
//! and frequency estimates, a guess at the line coding with a
//! matching flex decoder, and the rfraw hex with a link to the
//! triq.org viewer.

use std::fmt;

use crate::bitbuffer::BitBuffer;
use crate::pulse::{Modulation, PulseData};
use crate::rfraw::{self, Histogram, TOLERANCE};
use crate::slicer::{self, Coding, Timing};

/// Guessed line coding of a burst (widths in µs)
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Guess {
    /// No pulses
    Empty,

    /// Exactly one pulse
    SinglePulse { width_us: f64 },

    /// One pulse width and one gap width
    Unmodulated { pulse_us: f64, gap_us: f64 },

    /// Fixed pulse width, two or more gap widths
    PulsePosition { short_us: f64, long_us: f64 },

    /// Two pulse widths
    PulseWidth { short_us: f64, long_us: f64 },

    /// Two pulse widths, two gap widths, three periods
    Manchester { half_us: f64 },

    /// Every width a multiple of one symbol
    PulseCode { symbol_us: f64 },

    /// Nothing recognizable
    NoClue,
}

impl Guess {
    /// Human-readable description
    pub fn description(&self) -> &'static str {
        match self {
            Guess::Empty => "No pulses",
            Guess::SinglePulse { .. } => "Single pulse detected. Probably Frequency Shift Keying or just noise",
            Guess::Unmodulated { .. } => "Un-modulated signal. Maybe a preamble",
            Guess::PulsePosition { .. } => "Pulse Position Modulation with fixed pulse width",
            Guess::PulseWidth { .. } => "Pulse Width Modulation",
            Guess::Manchester { .. } => "Manchester coding",
            Guess::PulseCode { .. } => "Pulse Code Modulation (Not Return to Zero)",
            Guess::NoClue => "No clue",
        }
    }

    /// Coding which a flex decoder would use
    pub fn coding(&self, modulation: Modulation) -> Option<Coding> {
        let fsk = modulation == Modulation::Fsk;
        match self {
            Guess::PulsePosition { .. } => Some(Coding::OokPpm),
            Guess::PulseWidth { .. } if fsk => Some(Coding::FskPwm),
            Guess::PulseWidth { .. } => Some(Coding::OokPwm),
            Guess::Manchester { .. } if fsk => Some(Coding::FskManchesterZeroBit),
            Guess::Manchester { .. } => Some(Coding::OokManchesterZeroBit),
            Guess::PulseCode { .. } if fsk => Some(Coding::FskPcm),
            Guess::PulseCode { .. } => Some(Coding::OokPcm),
            _ => None,
        }
    }

    /// Short and long widths
    fn widths(&self) -> Option<(f64, f64)> {
        match *self {
            Guess::PulsePosition { short_us, long_us } | Guess::PulseWidth { short_us, long_us } => {
                Some((short_us, long_us))
            }
            Guess::Manchester { half_us } => Some((half_us, 0.0)),
            Guess::PulseCode { symbol_us } => Some((symbol_us, symbol_us)),
            _ => None,
        }
    }
}

impl fmt::Display for Guess {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.description())
    }
}

/// Analysis of one burst
#[derive(Clone, Debug)]
pub struct PulseAnalysis {
    data: PulseData,
    pulses: Histogram,
    gaps: Histogram,
    periods: Histogram,
    guess: Guess,
    timing: Option<Timing>,
    hex: Option<String>,
}

impl PulseAnalysis {
    /// Analyze `data`
    pub fn new(data: &PulseData) -> Self {
        let pulses = histogram(data.pairs().map(|(p, _)| p));
        let gaps = histogram(data.pairs().map(|(_, g)| g));
        let periods = histogram(data.pairs().filter(|(_, g)| *g > 0).map(|(p, g)| p + g));

        let guess = guess(data, &pulses, &gaps, &periods);
        let timing = guess.widths().map(|(short_us, long_us)| {
            let longest = gaps.bins().last().map_or(0, |b| b.max);
            Timing {
                short_us: short_us.round(),
                long_us: long_us.round(),
                reset_us: (data.samples_to_us(longest) * 1.2).round(),
                ..Timing::default()
            }
        });

        Self {
            data: data.clone(),
            pulses,
            gaps,
            periods,
            guess,
            timing,
            hex: rfraw::encode(data),
        }
    }

    /// Pulse width distribution, ascending
    pub fn pulses(&self) -> &Histogram {
        &self.pulses
    }

    /// Gap width distribution, ascending
    pub fn gaps(&self) -> &Histogram {
        &self.gaps
    }

    /// Pulse period distribution, ascending
    pub fn periods(&self) -> &Histogram {
        &self.periods
    }

    /// Guessed line coding
    pub fn guess(&self) -> Guess {
        self.guess
    }

    /// rfraw hex, if the burst is encodable
    pub fn hex(&self) -> Option<&str> {
        self.hex.as_deref()
    }

    /// Link to the triq.org viewer
    pub fn triq_url(&self) -> Option<String> {
        self.hex
            .as_ref()
            .map(|hex| format!("https://triq.org/pdv/#{}", hex))
    }

    /// Flex decoder specification matching the guess
    pub fn flex_spec(&self) -> Option<String> {
        let coding = self.guess.coding(self.data.modulation())?;
        let t = self.timing?;
        let mut spec = format!("n=name,m={},s={}", coding, t.short_us);
        if t.long_us > 0.0 {
            spec.push_str(&format!(",l={}", t.long_us));
        }
        if t.reset_us > 0.0 {
            spec.push_str(&format!(",r={}", t.reset_us));
        }
        Some(spec)
    }

    /// Bits sliced with the guessed coding
    pub fn bits(&self) -> Option<BitBuffer> {
        let coding = self.guess.coding(self.data.modulation())?;
        let t = self.timing?;
        Some(slicer::slice(coding, &t, &self.data))
    }

    fn write_histogram(&self, f: &mut fmt::Formatter<'_>, title: &str, hist: &Histogram) -> fmt::Result {
        writeln!(f, "{} distribution:", title)?;
        for (i, bin) in hist.bins().iter().enumerate() {
            writeln!(
                f,
                " [{:2}] count: {:4},  width: {:5.0} us [{:.0};{:.0}]\t({:4} S)",
                i,
                bin.count,
                self.data.samples_to_us(bin.mean),
                self.data.samples_to_us(bin.min),
                self.data.samples_to_us(bin.max),
                bin.mean
            )?;
        }
        Ok(())
    }
}

impl fmt::Display for PulseAnalysis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let d = &self.data;
        writeln!(f, "Analyzing pulses...")?;
        writeln!(
            f,
            "Total count: {:4},  width: {:.2} ms\t\t({} S)",
            d.num_pulses(),
            d.duration_us() / 1000.0,
            d.us_to_samples(d.duration_us())
        )?;
        self.write_histogram(f, "Pulse width", &self.pulses)?;
        self.write_histogram(f, "Gap width", &self.gaps)?;
        self.write_histogram(f, "Pulse period", &self.periods)?;
        writeln!(
            f,
            "Level estimates [high, low]: {:6}, {:6}",
            d.ook_high_estimate, d.ook_low_estimate
        )?;
        writeln!(
            f,
            "RSSI: {:.1} dB SNR: {:.1} dB Noise: {:.1} dB",
            d.rssi_db, d.snr_db, d.noise_db
        )?;
        if d.modulation() == Modulation::Fsk {
            writeln!(
                f,
                "Frequency offsets [F1, F2]: {:6}, {:6}\t({:+.1} kHz, {:+.1} kHz)",
                d.fsk_f1_est,
                d.fsk_f2_est,
                d.fsk_f1_est as f64 / i16::MAX as f64 * d.sample_rate() as f64 / 2.0 / 1000.0,
                d.fsk_f2_est as f64 / i16::MAX as f64 * d.sample_rate() as f64 / 2.0 / 1000.0,
            )?;
        }
        writeln!(f, "Guessing modulation: {}", self.guess)?;
        if let Some(spec) = self.flex_spec() {
            writeln!(f, "Use a flex decoder with -X '{}'", spec)?;
        }
        if let Some(bits) = self.bits().filter(|b| !b.is_empty()) {
            writeln!(f, "{}", bits)?;
        }
        match (&self.hex, self.triq_url()) {
            (Some(hex), Some(url)) => {
                writeln!(f, "rfraw: {}", hex)?;
                write!(f, "view at {}", url)
            }
            _ => write!(f, "rfraw: (too many timings)"),
        }
    }
}

// fused, ascending histogram of the non-zero widths
fn histogram<I: Iterator<Item = u32>>(widths: I) -> Histogram {
    let widths: Vec<u32> = widths.filter(|w| *w > 0).collect();
    let mut hist = Histogram::sum(&widths, TOLERANCE);
    hist.fuse(TOLERANCE);
    hist.sort_by_mean();
    hist
}

fn guess(data: &PulseData, pulses: &Histogram, gaps: &Histogram, periods: &Histogram) -> Guess {
    let us = |hist: &Histogram, i: usize| data.samples_to_us(hist.bins()[i].mean);

    match (pulses.len(), gaps.len(), periods.len()) {
        (0, _, _) => Guess::Empty,
        _ if data.num_pulses() == 1 => Guess::SinglePulse {
            width_us: us(pulses, 0),
        },
        (1, 0, _) => Guess::SinglePulse {
            width_us: us(pulses, 0),
        },
        (1, 1, _) => Guess::Unmodulated {
            pulse_us: us(pulses, 0),
            gap_us: us(gaps, 0),
        },
        (1, _, _) => Guess::PulsePosition {
            short_us: us(gaps, 0),
            long_us: us(gaps, 1),
        },
        (2, 2, 3) if is_multiple(us(pulses, 1), us(pulses, 0), 2) => Guess::Manchester {
            half_us: us(pulses, 0),
        },
        (2, _, _) => Guess::PulseWidth {
            short_us: us(pulses, 0),
            long_us: us(pulses, 1),
        },
        (p, g, _) if p >= 3 && g >= 2 => {
            let symbol = us(pulses, 0);
            let all = pulses.bins().iter().chain(gaps.bins()).all(|bin| {
                let w = data.samples_to_us(bin.mean);
                let n = (w / symbol).round();
                n >= 1.0 && (w - n * symbol).abs() <= symbol * 0.25
            });
            if all {
                Guess::PulseCode { symbol_us: symbol }
            } else {
                Guess::NoClue
            }
        }
        _ => Guess::NoClue,
    }
}

// true if `long` is close to `factor` times `short`
fn is_multiple(long: f64, short: f64, factor: u32) -> bool {
    (long - short * factor as f64).abs() <= short * 0.25
}

#[cfg(test)]
mod tests {
    use super::*;

    use assert_approx_eq::assert_approx_eq;

    fn burst(alternating: &[u32]) -> PulseData {
        PulseData::from_pairs(1_000_000, alternating).unwrap()
    }

    // short pulse 1, long pulse 0, fixed period
    fn pwm(bits: &[bool]) -> PulseData {
        let mut widths = Vec::new();
        for (i, &b) in bits.iter().enumerate() {
            widths.push(if b { 400 } else { 1200 });
            let gap = if i + 1 == bits.len() {
                9000
            } else if b {
                1200
            } else {
                400
            };
            widths.push(gap);
        }
        burst(&widths)
    }

    #[test]
    fn test_guess_pwm() {
        let bits = [true, false, false, true, true, false, true, false, true, true, false, false];
        let an = PulseAnalysis::new(&pwm(&bits));
        match an.guess() {
            Guess::PulseWidth { short_us, long_us } => {
                assert_approx_eq!(short_us, 400.0);
                assert_approx_eq!(long_us, 1200.0);
            }
            other => panic!("unexpected guess {:?}", other),
        }
        assert_eq!(an.pulses().len(), 2);
        assert_eq!(an.gaps().len(), 3);
        assert_eq!(an.periods().len(), 2);
        assert_eq!(
            an.flex_spec().as_deref(),
            Some("n=name,m=OOK_PWM,s=400,l=1200,r=10800")
        );

        let sliced = an.bits().unwrap();
        assert_eq!(sliced.row(0), Some((&[0x9a, 0xc0][..], 12)));

        let text = an.to_string();
        assert!(text.contains("Pulse Width Modulation"));
        assert!(text.contains("view at https://triq.org/pdv/#AAB0"));
        println!("{}", text);
    }

    #[test]
    fn test_guess_ppm() {
        let an = PulseAnalysis::new(&burst(&[
            500, 1000, 500, 2000, 500, 2000, 500, 1000, 500, 1000, 500, 2000, 500, 9000,
        ]));
        match an.guess() {
            Guess::PulsePosition { short_us, long_us } => {
                assert_approx_eq!(short_us, 1000.0);
                assert_approx_eq!(long_us, 2000.0);
            }
            other => panic!("unexpected guess {:?}", other),
        }
        assert!(an.flex_spec().unwrap().starts_with("n=name,m=OOK_PPM,s=1000,l=2000"));
    }

    #[test]
    fn test_guess_other() {
        assert_eq!(PulseAnalysis::new(&burst(&[])).guess(), Guess::Empty);
        assert_eq!(
            PulseAnalysis::new(&burst(&[300, 0])).guess(),
            Guess::SinglePulse { width_us: 300.0 }
        );
        assert_eq!(
            PulseAnalysis::new(&burst(&[300, 300, 300, 300, 300, 300])).guess(),
            Guess::Unmodulated {
                pulse_us: 300.0,
                gap_us: 300.0
            }
        );

        // widths of 1, 2 and 3 symbols
        let an = PulseAnalysis::new(&burst(&[100, 200, 300, 100, 200, 100, 100, 300, 100, 0]));
        assert_eq!(an.guess(), Guess::PulseCode { symbol_us: 100.0 });
        assert_eq!(an.guess().coding(Modulation::Fsk), Some(Coding::FskPcm));
        assert!(an.hex().is_some());
    }
}
