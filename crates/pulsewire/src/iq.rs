//! IQ sample input
//!
//! Recordings are raw interleaved `I, Q, I, Q, …` samples. The
//! sample type is given by the file extension:
//!
//! | extension | sample              | converted to |
//! |-----------|---------------------|--------------|
//! | `.cu8`    | unsigned 8-bit      | n/a          |
//! | `.cs8`    | signed 8-bit        | `cu8`        |
//! | `.cs16`   | signed 16-bit LE    | n/a          |
//! | `.cf32`   | 32-bit float LE     | `cs16`       |
//!
//! The detector consumes only [`IqFrame::Cu8`] and
//! [`IqFrame::Cs16`].
//!
//! File names may also carry the capture settings as tokens,
//! like `g001_433.92M_250k.cu8`. See [`FileInfo::from_path()`].

use std::io::{self, Read};
use std::path::Path;

use byteorder::{ByteOrder, LittleEndian};
use lazy_static::lazy_static;
use regex::Regex;
use strum_macros::{Display, EnumString};
use thiserror::Error;

#[cfg(not(test))]
use log::{debug, warn};

#[cfg(test)]
use std::{println as debug, println as warn};

/// Default frame length, in complex samples
pub const DEFAULT_FRAME_SAMPLES: usize = 131072 / 2;

// tokens in a capture file name
lazy_static! {
    static ref TOKEN: Regex =
        Regex::new(r"^(?i)(\d+(?:\.\d+)?)([kmg])(hz|sps)?$").expect("bad token regexp");
}

// frequencies below this are sampling rates, when ambiguous
const MIN_TOKEN_FREQ_HZ: f64 = 30.0e6;

/// Error reading IQ samples
#[derive(Error, Debug)]
pub enum IqError {
    /// Unknown or unsupported sample type
    #[error("unsupported sample format \"{0}\": use .cu8, .cs8, .cs16 or .cf32")]
    UnsupportedFormat(String),

    /// Buffer is not a whole number of complex samples
    #[error("buffer of {len} bytes is not a multiple of the {size}-byte sample size")]
    Misaligned {
        /// Buffer length (bytes)
        len: usize,
        /// Complex sample size (bytes)
        size: usize,
    },

    /// Read failed
    #[error("read error: {0}")]
    Io(#[from] io::Error),
}

/// Sample type of a recording
#[derive(Clone, Copy, Debug, PartialEq, Eq, Display, EnumString)]
#[strum(ascii_case_insensitive)]
pub enum SampleFormat {
    /// Unsigned 8-bit, offset 127.5
    #[strum(serialize = "cu8")]
    Cu8,
    /// Signed 8-bit
    #[strum(serialize = "cs8")]
    Cs8,
    /// Signed 16-bit, little-endian
    #[strum(serialize = "cs16")]
    Cs16,
    /// 32-bit float, little-endian, full scale ±1.0
    #[strum(serialize = "cf32")]
    Cf32,
}

impl SampleFormat {
    /// Size of one complex sample (bytes)
    pub fn sample_size(self) -> usize {
        match self {
            SampleFormat::Cu8 | SampleFormat::Cs8 => 2,
            SampleFormat::Cs16 => 4,
            SampleFormat::Cf32 => 8,
        }
    }

    /// Sample depth after conversion (bits)
    pub fn depth_bits(self) -> u32 {
        match self {
            SampleFormat::Cu8 | SampleFormat::Cs8 => 8,
            SampleFormat::Cs16 | SampleFormat::Cf32 => 16,
        }
    }
}

/// Capture settings recovered from a file name
#[derive(Clone, Debug, PartialEq)]
pub struct FileInfo {
    /// Sample type, from the extension
    pub format: SampleFormat,
    /// Sampling rate (Hz), if named
    pub sample_rate: Option<u32>,
    /// Center frequency (Hz), if named
    pub center_freq: Option<f64>,
}

impl FileInfo {
    /// Parse a capture file name
    ///
    /// The extension selects the [`SampleFormat`]. The stem is
    /// split on `_`, `-` and `:` into tokens. Tokens with a
    /// `k`, `M` or `G` multiplier are read as
    ///
    /// * a sampling rate if suffixed with `sps`, or if the
    ///   multiplier is `k`;
    /// * a frequency if suffixed with `Hz`;
    /// * otherwise, a frequency if at least 30 MHz, else a
    ///   sampling rate.
    ///
    /// Other tokens are ignored. `.cu16` and unknown extensions
    /// are errors.
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<FileInfo, IqError> {
        let path = path.as_ref();
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();
        let format: SampleFormat = ext
            .parse()
            .map_err(|_| IqError::UnsupportedFormat(ext.to_owned()))?;

        let mut info = FileInfo {
            format,
            sample_rate: None,
            center_freq: None,
        };

        let stem = path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or_default();
        for token in stem.split(|c| c == '_' || c == '-' || c == ':') {
            let caps = match TOKEN.captures(token) {
                Some(c) => c,
                None => continue,
            };
            let value: f64 = match caps[1].parse() {
                Ok(v) => v,
                Err(_) => continue,
            };
            let mult = &caps[2];
            let hz = value
                * match mult.to_ascii_lowercase().as_str() {
                    "k" => 1.0e3,
                    "m" => 1.0e6,
                    _ => 1.0e9,
                };
            let unit = caps.get(3).map(|m| m.as_str().to_ascii_lowercase());

            let is_rate = match unit.as_deref() {
                Some("sps") => true,
                Some(_) => false,
                None => mult.eq_ignore_ascii_case("k") || hz < MIN_TOKEN_FREQ_HZ,
            };
            if is_rate {
                info.sample_rate = Some(hz.round() as u32);
            } else {
                info.center_freq = Some(hz.round());
            }
        }

        debug!("iq: file \"{}\" is {:?}", path.display(), info);
        Ok(info)
    }
}

/// A block of complex samples
#[derive(Clone, Debug, PartialEq)]
pub enum IqFrame {
    /// Interleaved unsigned 8-bit
    Cu8(Vec<u8>),
    /// Interleaved signed 16-bit
    Cs16(Vec<i16>),
}

impl IqFrame {
    /// Convert raw bytes in the given format
    ///
    /// `bytes` must hold a whole number of complex samples.
    pub fn from_bytes(format: SampleFormat, bytes: &[u8]) -> Result<IqFrame, IqError> {
        let size = format.sample_size();
        if bytes.len() % size != 0 {
            return Err(IqError::Misaligned {
                len: bytes.len(),
                size,
            });
        }

        Ok(match format {
            SampleFormat::Cu8 => IqFrame::Cu8(bytes.to_vec()),
            SampleFormat::Cs8 => IqFrame::Cu8(bytes.iter().map(|b| (*b as i8 as i16 + 128) as u8).collect()),
            SampleFormat::Cs16 => {
                let mut out = vec![0i16; bytes.len() / 2];
                LittleEndian::read_i16_into(bytes, &mut out);
                IqFrame::Cs16(out)
            }
            SampleFormat::Cf32 => {
                let mut floats = vec![0.0f32; bytes.len() / 4];
                LittleEndian::read_f32_into(bytes, &mut floats);
                IqFrame::Cs16(
                    floats
                        .iter()
                        .map(|f| (f * 32768.0).round().clamp(-32768.0, 32767.0) as i16)
                        .collect(),
                )
            }
        })
    }

    /// Number of complex samples
    pub fn len(&self) -> usize {
        match self {
            IqFrame::Cu8(v) => v.len() / 2,
            IqFrame::Cs16(v) => v.len() / 2,
        }
    }

    /// True if the frame has no samples
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Sample depth (bits)
    pub fn depth_bits(&self) -> u32 {
        match self {
            IqFrame::Cu8(_) => 8,
            IqFrame::Cs16(_) => 16,
        }
    }
}

/// Reads fixed-size frames from a byte stream
#[derive(Debug)]
pub struct IqReader<R: Read> {
    inner: R,
    format: SampleFormat,
    buf: Vec<u8>,
    eof: bool,
}

impl<R: Read> IqReader<R> {
    /// Read `format` samples from `inner`
    ///
    /// Each frame holds up to `frame_samples` complex samples.
    pub fn new(inner: R, format: SampleFormat, frame_samples: usize) -> Self {
        Self {
            inner,
            format,
            buf: vec![0u8; frame_samples.max(1) * format.sample_size()],
            eof: false,
        }
    }

    /// Sample type
    pub fn format(&self) -> SampleFormat {
        self.format
    }

    /// Next frame, or `None` at end of input
    ///
    /// The final frame may be short. A trailing partial sample
    /// is dropped with a warning.
    pub fn next_frame(&mut self) -> Result<Option<IqFrame>, IqError> {
        if self.eof {
            return Ok(None);
        }

        let mut filled = 0;
        while filled < self.buf.len() {
            match self.inner.read(&mut self.buf[filled..]) {
                Ok(0) => {
                    self.eof = true;
                    break;
                }
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }

        let size = self.format.sample_size();
        let whole = filled - filled % size;
        if whole != filled {
            warn!(
                "iq: dropping {} trailing bytes of a partial {} sample",
                filled - whole,
                self.format
            );
        }
        if whole == 0 {
            self.eof = true;
            return Ok(None);
        }
        IqFrame::from_bytes(self.format, &self.buf[..whole]).map(Some)
    }
}

impl<R: Read> Iterator for IqReader<R> {
    type Item = Result<IqFrame, IqError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_frame().transpose()
    }
}
