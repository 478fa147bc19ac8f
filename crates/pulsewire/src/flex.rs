//! General-purpose "flex" decoders
//!
//! A flex decoder is described by a one-line specification of
//! comma-separated `key=value` pairs:
//!
//! ```txt
//! n=doorbell,m=OOK_PWM,s=400,l=800,r=8000,g=1000,bits>=24,repeats>=2,match=5a
//! ```
//!
//! | Key | Meaning |
//! |---|---|
//! | `n`, `name` | model name (required) |
//! | `m`, `modulation` | line coding, e.g. `OOK_PWM` (required) |
//! | `s`, `short` | short width or symbol width, µs (required) |
//! | `l`, `long` | long width, µs (required for PWM and PPM) |
//! | `y`, `sync` | sync pulse width, µs |
//! | `g`, `gap` | row gap limit, µs |
//! | `r`, `reset` | message reset limit, µs |
//! | `t`, `tolerance` | width tolerance, µs |
//! | `bits>=N`, `bits<=N`, `bits=N` | row length filter |
//! | `rows>=N` | minimum number of matching rows |
//! | `repeats>=N` | minimum copies of one row |
//! | `match=HEX` | keep rows containing this bit pattern |
//! | `preamble=HEX` | keep rows containing this pattern, aligned after it |
//! | `invert` | invert all bits |
//! | `unique` | drop duplicate rows |
//!
//! Hex patterns may be written `{N}HEX` to use only the first
//! `N` bits.

use std::str::FromStr;

use thiserror::Error;

use crate::bitbuffer::{extract_bytes, search, BitBuffer};
use crate::decoder::{DecodeError, Decoder};
use crate::pulse::PulseData;
use crate::record::DeviceRecord;
use crate::slicer::{slice, Coding, Timing};

/// Error parsing a flex specification
#[derive(Error, Clone, Debug, PartialEq, Eq)]
pub enum FlexError {
    /// The specification has no `n=` name
    #[error("flex spec has no name (n=)")]
    MissingName,

    /// The specification has no `m=` modulation
    #[error("flex spec has no modulation (m=)")]
    MissingModulation,

    /// The modulation is not known
    #[error("unknown flex modulation \"{0}\"")]
    UnknownModulation(String),

    /// A required width is missing
    #[error("flex spec requires {0}")]
    MissingTiming(&'static str),

    /// A key is not recognized
    #[error("unknown flex key \"{0}\"")]
    UnknownKey(String),

    /// A value does not parse
    #[error("bad value for flex key \"{key}\": \"{value}\"")]
    BadValue { key: String, value: String },
}

/// A bit pattern for `match=` and `preamble=`
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BitPattern {
    /// Packed bits, MSB first
    pub bytes: Vec<u8>,
    /// Number of significant bits
    pub bits: usize,
}

impl FromStr for BitPattern {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let (limit, hex) = match s.strip_prefix('{') {
            Some(rest) => {
                let (n, hex) = rest.split_once('}').ok_or(())?;
                (Some(n.trim().parse::<usize>().map_err(|_| ())?), hex)
            }
            None => (None, s),
        };
        let hex = hex.trim_start_matches("0x").trim_start_matches("0X");
        if hex.is_empty() || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(());
        }

        let mut bytes = Vec::with_capacity((hex.len() + 1) / 2);
        let digits: Vec<u8> = hex
            .chars()
            .filter_map(|c| c.to_digit(16))
            .map(|d| d as u8)
            .collect();
        for pair in digits.chunks(2) {
            bytes.push((pair[0] << 4) | pair.get(1).copied().unwrap_or(0));
        }

        let all = hex.len() * 4;
        let bits = limit.map_or(all, |n| n.min(all));
        if bits == 0 {
            return Err(());
        }
        Ok(BitPattern { bytes, bits })
    }
}

/// Parsed flex specification
#[derive(Clone, Debug, PartialEq)]
pub struct FlexSpec {
    /// Model name
    pub name: String,
    /// Line coding
    pub coding: Coding,
    /// Widths (µs)
    pub timing: Timing,
    /// Minimum row length (bits)
    pub min_bits: usize,
    /// Maximum row length (bits), zero for unlimited
    pub max_bits: usize,
    /// Minimum number of surviving rows
    pub min_rows: usize,
    /// Minimum copies of one row
    pub min_repeats: usize,
    /// Required bit pattern
    pub match_bits: Option<BitPattern>,
    /// Preamble to align rows on
    pub preamble: Option<BitPattern>,
    /// Invert sliced bits
    pub invert: bool,
    /// Drop duplicate rows
    pub unique: bool,
}

impl FromStr for FlexSpec {
    type Err = FlexError;

    fn from_str(spec: &str) -> Result<Self, Self::Err> {
        let mut name = None;
        let mut coding = None;
        let mut timing = Timing::default();
        let mut min_bits = 0;
        let mut max_bits = 0;
        let mut min_rows = 1;
        let mut min_repeats = 0;
        let mut match_bits = None;
        let mut preamble = None;
        let mut invert = false;
        let mut unique = false;

        for item in spec.split(',').map(str::trim).filter(|s| !s.is_empty()) {
            let (key, op, value) = split_item(item);
            let bad = || FlexError::BadValue {
                key: key.to_owned(),
                value: value.to_owned(),
            };
            let width = || value.parse::<f64>().ok().filter(|v| *v >= 0.0).ok_or_else(bad);
            let count = || value.parse::<usize>().map_err(|_| bad());

            match (key.to_ascii_lowercase().as_str(), op) {
                ("n" | "name", "=") if !value.is_empty() => name = Some(value.to_owned()),
                ("m" | "modulation", "=") => {
                    coding = Some(
                        Coding::from_name(value)
                            .ok_or_else(|| FlexError::UnknownModulation(value.to_owned()))?,
                    )
                }
                ("s" | "short", "=") => timing.short_us = width()?,
                ("l" | "long", "=") => timing.long_us = width()?,
                ("y" | "sync", "=") => timing.sync_us = width()?,
                ("g" | "gap", "=") => timing.gap_us = width()?,
                ("r" | "reset", "=") => timing.reset_us = width()?,
                ("t" | "tolerance", "=") => timing.tolerance_us = width()?,
                ("bits", ">=") => min_bits = count()?,
                ("bits", "<=") => max_bits = count()?,
                ("bits", "=") => {
                    min_bits = count()?;
                    max_bits = min_bits;
                }
                ("rows", ">=") => min_rows = count()?.max(1),
                ("repeats", ">=") => min_repeats = count()?,
                ("match", "=") => match_bits = Some(value.parse().map_err(|_| bad())?),
                ("preamble", "=") => preamble = Some(value.parse().map_err(|_| bad())?),
                ("invert", "") => invert = true,
                ("unique", "") => unique = true,
                _ => return Err(FlexError::UnknownKey(item.to_owned())),
            }
        }

        let name = name.ok_or(FlexError::MissingName)?;
        let coding = coding.ok_or(FlexError::MissingModulation)?;
        if timing.short_us <= 0.0 {
            return Err(FlexError::MissingTiming("a short width (s=)"));
        }
        if coding.needs_long() && timing.long_us <= 0.0 {
            return Err(FlexError::MissingTiming("a long width (l=)"));
        }

        Ok(FlexSpec {
            name,
            coding,
            timing,
            min_bits,
            max_bits,
            min_rows,
            min_repeats,
            match_bits,
            preamble,
            invert,
            unique,
        })
    }
}

// split "key>=value", "key=value" or "flag"
fn split_item(item: &str) -> (&str, &str, &str) {
    for op in [">=", "<=", "="] {
        if let Some((k, v)) = item.split_once(op) {
            return (k.trim(), op, v.trim());
        }
    }
    (item, "", "")
}

/// Decoder built from a [`FlexSpec`]
///
/// Emits at most one record per burst, with the fields
///
/// * `count`: copies of the first surviving row
/// * `num_rows`: surviving rows
/// * `len`: bit length of the first surviving row
/// * `data`: hex of the first surviving row
/// * `rows`: hex of every surviving row, space-separated
#[derive(Clone, Debug)]
pub struct FlexDecoder {
    spec: FlexSpec,
}

impl FlexDecoder {
    /// Decoder for a parsed specification
    pub fn new(spec: FlexSpec) -> Self {
        Self { spec }
    }

    /// Parse a specification and build its decoder
    pub fn parse(spec: &str) -> Result<Self, FlexError> {
        Ok(Self::new(spec.parse()?))
    }

    /// The specification
    pub fn spec(&self) -> &FlexSpec {
        &self.spec
    }

    // Apply the row filters; returns (bytes, bits) per row
    fn filter_rows(&self, bits: &BitBuffer) -> Vec<(Vec<u8>, usize)> {
        let spec = &self.spec;
        let mut rows: Vec<(Vec<u8>, usize)> = Vec::new();

        for (row, len) in bits.rows() {
            let (row, len) = match &spec.preamble {
                Some(p) => {
                    let pos = search(row, len, 0, &p.bytes, p.bits);
                    if pos + p.bits > len {
                        continue;
                    }
                    let start = pos + p.bits;
                    (extract_bytes(row, start, len - start), len - start)
                }
                None => (row.to_vec(), len),
            };

            if len < spec.min_bits || (spec.max_bits > 0 && len > spec.max_bits) {
                continue;
            }
            if let Some(m) = &spec.match_bits {
                if search(&row, len, 0, &m.bytes, m.bits) + m.bits > len {
                    continue;
                }
            }
            if spec.unique && rows.iter().any(|r| r.0 == row && r.1 == len) {
                continue;
            }
            rows.push((row, len));
        }
        rows
    }
}

impl Decoder for FlexDecoder {
    fn name(&self) -> &str {
        &self.spec.name
    }

    fn coding(&self) -> Coding {
        self.spec.coding
    }

    fn timing(&self) -> Timing {
        self.spec.timing
    }

    fn decode(&self, data: &PulseData) -> Result<Vec<DeviceRecord>, DecodeError> {
        let mut bits = slice(self.spec.coding, &self.spec.timing, data);
        if bits.is_empty() {
            return Err(DecodeError::AbortEarly);
        }
        if self.spec.invert {
            bits.invert();
        }

        let rows = self.filter_rows(&bits);
        if rows.len() < self.spec.min_rows {
            return Err(DecodeError::AbortLength);
        }

        let first = &rows[0];
        let count = rows.iter().filter(|r| *r == first).count();
        if count < self.spec.min_repeats {
            return Err(DecodeError::AbortEarly);
        }

        let hex: Vec<String> = rows
            .iter()
            .map(|(row, _)| crate::record::hex_upper(row))
            .collect();
        let record = DeviceRecord::new(self.spec.name.as_str())
            .with_protocol(self.spec.coding.to_string())
            .with("count", count as i64)
            .with("num_rows", rows.len() as i64)
            .with("len", first.1 as i64)
            .with("data", hex[0].clone())
            .with("rows", hex.join(" "));
        Ok(vec![record])
    }
}
