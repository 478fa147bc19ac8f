//! ASN.1 message envelope
//!
//! Every message on the ASN.1 topology is one `RTL433Message`,
//! encoded with the unaligned packed encoding rules
//! ([`per`](crate::per)):
//!
//! ```txt
//! RTL433Message ::= CHOICE {
//!   signalMessage   SignalMessage,
//!   detectedMessage DetectedMessage,
//!   statusMessage   StatusMessage,
//!   configMessage   ConfigMessage,
//!   ...
//! }
//!
//! SignalMessage ::= SEQUENCE {
//!   packageId       INTEGER OPTIONAL,
//!   timestamp       GeneralizedTime OPTIONAL,
//!   sampleRate      INTEGER (1..10000000),
//!   frequency       RFParameters,
//!   modulation      ModulationType,
//!   signalData      SignalData,
//!   signalQuality   SignalQuality OPTIONAL,
//!   timingInfo      TimingInfo OPTIONAL,
//!   ...
//! }
//!
//! RFParameters ::= SEQUENCE {
//!   centerFreq INTEGER, freq1 INTEGER OPTIONAL, freq2 INTEGER OPTIONAL, ...
//! }
//! ModulationType ::= ENUMERATED { ook, fsk, ask, ... }
//!
//! SignalData ::= CHOICE {
//!   pulsesArray  PulsesData,
//!   hexStrings   SEQUENCE (SIZE(1..32)) OF OCTET STRING (SIZE(1..512)),
//!   hexString    OCTET STRING (SIZE(1..512)),
//!   ...
//! }
//! PulsesData ::= SEQUENCE {
//!   count INTEGER (16..65535), sampleRate INTEGER, pulses SEQUENCE OF INTEGER, ...
//! }
//!
//! SignalQuality ::= SEQUENCE {
//!   rssiDb REAL OPTIONAL, snrDb REAL OPTIONAL, noiseDb REAL OPTIONAL,
//!   rangeDb REAL OPTIONAL, depthBits INTEGER OPTIONAL, ...
//! }
//! TimingInfo ::= SEQUENCE {
//!   offset INTEGER OPTIONAL, startAgo INTEGER OPTIONAL, endAgo INTEGER OPTIONAL,
//!   ookLowEstimate INTEGER OPTIONAL, ookHighEstimate INTEGER OPTIONAL,
//!   fskF1Est INTEGER OPTIONAL, fskF2Est INTEGER OPTIONAL, ...
//! }
//!
//! DetectedMessage ::= SEQUENCE {
//!   packageId         INTEGER OPTIONAL,
//!   timestamp         GeneralizedTime OPTIONAL,
//!   deviceInfo        DeviceInfo,
//!   deviceData        SEQUENCE OF DeviceField,
//!   detectionMetadata DetectionMetadata OPTIONAL,
//!   ...
//! }
//! DeviceInfo ::= SEQUENCE {
//!   model UTF8String, deviceType UTF8String OPTIONAL,
//!   deviceId UTF8String OPTIONAL, protocol UTF8String OPTIONAL, ...
//! }
//! DeviceField ::= SEQUENCE { fieldName UTF8String, fieldValue FieldValue, ... }
//! FieldValue ::= CHOICE {
//!   intValue INTEGER, realValue REAL, stringValue UTF8String,
//!   boolValue BOOLEAN, bytesValue OCTET STRING, ...
//! }
//! DetectionMetadata ::= SEQUENCE {
//!   confidence INTEGER (0..100), errorCorrection BOOLEAN,
//!   protocolVersion UTF8String OPTIONAL, rawBits OCTET STRING OPTIONAL, ...
//! }
//!
//! StatusMessage ::= SEQUENCE {
//!   timestamp GeneralizedTime OPTIONAL, source UTF8String,
//!   uptimeSeconds INTEGER (0..MAX) OPTIONAL, counters SEQUENCE OF Counter, ...
//! }
//! Counter ::= SEQUENCE { name UTF8String, value INTEGER (0..MAX), ... }
//!
//! ConfigMessage ::= SEQUENCE {
//!   timestamp GeneralizedTime OPTIONAL, entries SEQUENCE OF ConfigEntry, ...
//! }
//! ConfigEntry ::= SEQUENCE { name UTF8String, value UTF8String, ... }
//! ```
//!
//! Every `SEQUENCE` carries an extension marker. Newer senders may
//! append fields; this decoder skips any it does not know.

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use thiserror::Error;

use crate::per::{BitReader, BitWriter, PerError};
use crate::pulse::{Modulation, PulseData, PulseError, PD_MAX, PD_MIN_PULSES};
use crate::record::{hex_upper, DeviceRecord, FieldValue};
use crate::rfraw;

#[cfg(not(test))]
use log::{debug, warn};

#[cfg(test)]
use std::{println as debug, println as warn};

/// Largest sampling rate a `SignalMessage` can carry
pub const MAX_SAMPLE_RATE: u32 = 10_000_000;

/// Maximum number of frames in `hexStrings`
pub const MAX_HEX_STRINGS: usize = 32;

/// Maximum size of one rfraw frame, in octets
pub const MAX_HEX_OCTETS: usize = 512;

/// Epoch of relative `@<seconds>s` timestamps: 2024-01-01T00:00:00Z
pub const RELATIVE_TIME_BASE: i64 = 1_704_067_200;

/// Error building, encoding or decoding an envelope
#[derive(Error, Clone, Debug, PartialEq)]
pub enum EnvelopeError {
    /// Neither a pulse array nor an rfraw fallback is possible
    #[error("signal too short to encode: {0} pulses and no hex fallback")]
    TooShort(usize),

    /// The pulse array does not hold two values per pulse
    #[error("pulse array holds {len} values for {count} pulses")]
    PulseCount {
        /// Declared number of pulses
        count: usize,
        /// Number of values present
        len: usize,
    },

    /// A pulse width cannot be represented
    #[error("invalid pulse width {0}")]
    PulseWidth(i64),

    /// The rfraw payload is not valid hex or is too large
    #[error("invalid rfraw hex payload")]
    InvalidHex,

    /// The sampling rate is outside `1..=10000000`
    #[error("sample rate {0} outside 1..=10000000")]
    SampleRate(i64),

    /// An integer field does not fit the burst model
    #[error("{field} value {value} out of range")]
    OutOfRange {
        /// Schema field name
        field: &'static str,
        /// Value received
        value: i64,
    },

    /// The envelope is not valid UPER for this schema
    #[error("malformed envelope: {0}")]
    Per(#[from] PerError),
}

impl From<PulseError> for EnvelopeError {
    fn from(_: PulseError) -> Self {
        EnvelopeError::SampleRate(0)
    }
}

/// One envelope
#[derive(Clone, Debug, PartialEq)]
pub enum Message {
    /// A captured burst
    Signal(SignalMessage),
    /// A decoded device
    Detected(DetectedMessage),
    /// Health and counters of a component
    Status(StatusMessage),
    /// Configuration key/value pairs
    Config(ConfigMessage),
}

impl Message {
    /// Encode to UPER
    ///
    /// Encoding is a pure function of the message: the same
    /// message always yields the same octets.
    pub fn encode(&self) -> Result<Vec<u8>, EnvelopeError> {
        let mut w = BitWriter::new();
        match self {
            Message::Signal(m) => {
                w.write_index(0, 4, true)?;
                m.write(&mut w)?;
            }
            Message::Detected(m) => {
                w.write_index(1, 4, true)?;
                m.write(&mut w)?;
            }
            Message::Status(m) => {
                w.write_index(2, 4, true)?;
                m.write(&mut w)?;
            }
            Message::Config(m) => {
                w.write_index(3, 4, true)?;
                m.write(&mut w)?;
            }
        }
        Ok(w.into_bytes())
    }

    /// Decode from UPER
    pub fn decode(buf: &[u8]) -> Result<Message, EnvelopeError> {
        let mut r = BitReader::new(buf);
        let msg = match r.read_index(4, true)? {
            0 => Message::Signal(SignalMessage::read(&mut r)?),
            1 => Message::Detected(DetectedMessage::read(&mut r)?),
            2 => Message::Status(StatusMessage::read(&mut r)?),
            _ => Message::Config(ConfigMessage::read(&mut r)?),
        };
        Ok(msg)
    }
}

/// Signal timing payload
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SignalData {
    /// Lossless: alternating pulse, gap widths in samples
    Pulses {
        /// Sampling rate of the widths (Hz)
        sample_rate: u32,
        /// `pulse, gap, pulse, gap, …`
        pulses: Vec<u32>,
    },

    /// Several rfraw frames, one per element
    HexStrings(Vec<Vec<u8>>),

    /// A single rfraw frame
    HexString(Vec<u8>),
}

impl SignalData {
    /// rfraw text form, frames joined with `+`
    ///
    /// Returns `None` for a pulse array.
    pub fn hex(&self) -> Option<String> {
        match self {
            SignalData::Pulses { .. } => None,
            SignalData::HexString(frame) => Some(hex_upper(frame)),
            SignalData::HexStrings(frames) => Some(
                frames
                    .iter()
                    .map(|f| hex_upper(f))
                    .collect::<Vec<String>>()
                    .join("+"),
            ),
        }
    }

    /// Octet form of rfraw text
    ///
    /// A single frame becomes [`SignalData::HexString`], several
    /// `+`-separated frames become [`SignalData::HexStrings`].
    pub fn from_hex(text: &str) -> Result<SignalData, EnvelopeError> {
        let frames: Vec<Vec<u8>> = text
            .split('+')
            .map(str::trim)
            .filter(|f| !f.is_empty())
            .map(hex_to_bytes)
            .collect::<Option<Vec<Vec<u8>>>>()
            .ok_or(EnvelopeError::InvalidHex)?;

        if frames.is_empty()
            || frames.len() > MAX_HEX_STRINGS
            || frames.iter().any(|f| f.is_empty() || f.len() > MAX_HEX_OCTETS)
        {
            return Err(EnvelopeError::InvalidHex);
        }

        let mut frames = frames;
        Ok(if frames.len() == 1 {
            SignalData::HexString(frames.remove(0))
        } else {
            SignalData::HexStrings(frames)
        })
    }
}

/// Receiver frequencies (Hz)
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RfParameters {
    /// Center frequency
    pub center_freq: i64,
    /// FSK mark frequency
    pub freq1: Option<i64>,
    /// FSK space frequency
    pub freq2: Option<i64>,
}

/// Signal quality (dB)
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SignalQuality {
    /// Received signal strength
    pub rssi_db: Option<f64>,
    /// Signal to noise ratio
    pub snr_db: Option<f64>,
    /// Noise floor
    pub noise_db: Option<f64>,
    /// Dynamic range of the sample format
    pub range_db: Option<f64>,
    /// Sample depth (bits)
    pub depth_bits: Option<i64>,
}

/// Timing and level estimates
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TimingInfo {
    /// Sample position of the burst start in the capture stream
    pub offset: Option<i64>,
    /// Samples from burst start to emission
    pub start_ago: Option<i64>,
    /// Samples from burst end to emission
    pub end_ago: Option<i64>,
    /// Envelope level of gaps
    pub ook_low_estimate: Option<i64>,
    /// Envelope level of pulses
    pub ook_high_estimate: Option<i64>,
    /// FM estimate of the mark frequency
    pub fsk_f1_est: Option<i64>,
    /// FM estimate of the space frequency
    pub fsk_f2_est: Option<i64>,
}

/// A captured burst on the wire
#[derive(Clone, Debug, PartialEq)]
pub struct SignalMessage {
    /// Sender-unique sequence number
    pub package_id: Option<u32>,
    /// `GeneralizedTime` text, e.g. `20240101000000.262144Z`
    pub timestamp: Option<String>,
    /// Sampling rate (Hz)
    pub sample_rate: u32,
    /// Receiver frequencies
    pub frequency: RfParameters,
    /// Modulation family
    pub modulation: Modulation,
    /// Timing payload
    pub signal_data: SignalData,
    /// Signal quality
    pub quality: Option<SignalQuality>,
    /// Timing and estimates
    pub timing: Option<TimingInfo>,
}

/// A burst recovered from a [`SignalMessage`]
#[derive(Clone, Debug, PartialEq)]
pub struct DecodedSignal {
    /// Widths and metadata
    ///
    /// Empty if the message carried only rfraw hex.
    pub pulse: PulseData,
    /// Modulation family declared by the sender
    pub modulation: Modulation,
    /// Timestamp text, if sent
    pub timestamp: Option<String>,
    /// rfraw hex, if the message carried no pulse array
    pub hex: Option<String>,
    /// Sender sequence number, if sent
    pub package_id: Option<u32>,
}

impl SignalMessage {
    /// Envelope for `data`
    ///
    /// Bursts of 16 pulses or more travel losslessly as a pulse
    /// array. Shorter bursts fall back to rfraw hex. If the
    /// burst cannot be compressed either, it cannot be sent.
    pub fn from_pulse(data: &PulseData, package_id: u32) -> Result<SignalMessage, EnvelopeError> {
        Self::from_pulse_with_hex(data, package_id, None)
    }

    /// Envelope for `data`, with a known rfraw fallback
    ///
    /// If `hex` is `None` and a fallback is needed, it is
    /// computed from `data`.
    pub fn from_pulse_with_hex(
        data: &PulseData,
        package_id: u32,
        hex: Option<&str>,
    ) -> Result<SignalMessage, EnvelopeError> {
        if data.sample_rate() > MAX_SAMPLE_RATE {
            return Err(EnvelopeError::SampleRate(data.sample_rate() as i64));
        }

        let signal_data = if data.num_pulses() >= PD_MIN_PULSES {
            SignalData::Pulses {
                sample_rate: data.sample_rate(),
                pulses: data.to_alternating(),
            }
        } else {
            let hex = match hex {
                Some(h) if !h.trim().is_empty() => Some(h.to_owned()),
                _ => rfraw::encode(data),
            };
            match hex {
                Some(h) => SignalData::from_hex(&h)?,
                None => return Err(EnvelopeError::TooShort(data.num_pulses())),
            }
        };

        Ok(SignalMessage {
            package_id: Some(package_id),
            timestamp: None,
            sample_rate: data.sample_rate(),
            frequency: RfParameters {
                center_freq: data.centerfreq_hz.round() as i64,
                freq1: nonzero_f(data.freq1_hz),
                freq2: nonzero_f(data.freq2_hz),
            },
            modulation: data.modulation(),
            signal_data,
            quality: quality_of(data),
            timing: timing_of(data),
        })
    }

    /// Attach a timestamp
    ///
    /// Accepts anything [`to_generalized_time()`] understands.
    /// Unparseable timestamps are dropped.
    pub fn with_timestamp(mut self, timestamp: &str) -> Self {
        self.timestamp = to_generalized_time(timestamp);
        if self.timestamp.is_none() {
            debug!("envelope: ignoring unparseable timestamp \"{}\"", timestamp);
        }
        self
    }

    /// Rebuild the burst
    ///
    /// A pulse array is copied width for width. Hex payloads
    /// are returned as text and leave the pulse array empty; use
    /// [`rfraw::decode()`] to expand them.
    pub fn to_pulse(&self) -> Result<DecodedSignal, EnvelopeError> {
        let rate = match &self.signal_data {
            SignalData::Pulses { sample_rate, .. } if *sample_rate > 0 => *sample_rate,
            _ => self.sample_rate,
        };
        let mut pulse = PulseData::new(rate)?;

        if let SignalData::Pulses { pulses, .. } = &self.signal_data {
            if pulses.len() / 2 > PD_MAX {
                warn!(
                    "envelope: {} pulses exceed {}; truncating",
                    pulses.len() / 2,
                    PD_MAX
                );
            }
            for pair in pulses.chunks(2) {
                if !pulse.push(pair[0], pair.get(1).copied().unwrap_or(0)) {
                    break;
                }
            }
        }

        pulse.centerfreq_hz = self.frequency.center_freq as f64;
        pulse.freq1_hz = self.frequency.freq1.unwrap_or(0) as f64;
        pulse.freq2_hz = self.frequency.freq2.unwrap_or(0) as f64;

        if let Some(q) = &self.quality {
            pulse.rssi_db = q.rssi_db.unwrap_or(0.0) as f32;
            pulse.snr_db = q.snr_db.unwrap_or(0.0) as f32;
            pulse.noise_db = q.noise_db.unwrap_or(0.0) as f32;
            pulse.range_db = q.range_db.unwrap_or(0.0) as f32;
            pulse.depth_bits = narrow("depthBits", q.depth_bits)?;
        }

        if let Some(t) = &self.timing {
            pulse.offset = narrow("offset", t.offset)?;
            pulse.start_ago = narrow("startAgo", t.start_ago)?;
            pulse.end_ago = narrow("endAgo", t.end_ago)?;
            pulse.ook_low_estimate = narrow("ookLowEstimate", t.ook_low_estimate)?;
            pulse.ook_high_estimate = narrow("ookHighEstimate", t.ook_high_estimate)?;
            pulse.fsk_f1_est = narrow("fskF1Est", t.fsk_f1_est)?;
            pulse.fsk_f2_est = narrow("fskF2Est", t.fsk_f2_est)?;
        }

        Ok(DecodedSignal {
            pulse,
            modulation: self.modulation,
            timestamp: self.timestamp.clone(),
            hex: self.signal_data.hex(),
            package_id: self.package_id,
        })
    }

    fn write(&self, w: &mut BitWriter) -> Result<(), EnvelopeError> {
        w.write_preamble(
            true,
            &[
                self.package_id.is_some(),
                self.timestamp.is_some(),
                self.quality.is_some(),
                self.timing.is_some(),
            ],
        );
        if let Some(id) = self.package_id {
            w.write_integer(id as i64)?;
        }
        if let Some(ts) = &self.timestamp {
            w.write_visible(ts)?;
        }
        if self.sample_rate == 0 || self.sample_rate > MAX_SAMPLE_RATE {
            return Err(EnvelopeError::SampleRate(self.sample_rate as i64));
        }
        w.write_constrained(self.sample_rate as i64, 1, MAX_SAMPLE_RATE as i64)?;

        w.write_preamble(
            true,
            &[self.frequency.freq1.is_some(), self.frequency.freq2.is_some()],
        );
        w.write_integer(self.frequency.center_freq)?;
        write_opt_integer(w, self.frequency.freq1)?;
        write_opt_integer(w, self.frequency.freq2)?;

        let modulation = match self.modulation {
            Modulation::Ook => 0,
            Modulation::Fsk => 1,
            Modulation::Ask => 2,
        };
        w.write_index(modulation, 3, true)?;

        match &self.signal_data {
            SignalData::Pulses {
                sample_rate,
                pulses,
            } => {
                w.write_index(0, 3, true)?;
                w.write_preamble(true, &[]);
                let count = pulses.len() / 2;
                if pulses.len() % 2 != 0 {
                    return Err(EnvelopeError::PulseCount {
                        count,
                        len: pulses.len(),
                    });
                }
                w.write_constrained(count as i64, PD_MIN_PULSES as i64, 65535)?;
                w.write_integer(*sample_rate as i64)?;
                w.write_length(pulses.len())?;
                for p in pulses {
                    w.write_integer(*p as i64)?;
                }
            }
            SignalData::HexStrings(frames) => {
                w.write_index(1, 3, true)?;
                w.write_constrained_length(frames.len(), 1, MAX_HEX_STRINGS)?;
                for f in frames {
                    w.write_octet_string(f, Some((1, MAX_HEX_OCTETS)))?;
                }
            }
            SignalData::HexString(frame) => {
                w.write_index(2, 3, true)?;
                w.write_octet_string(frame, Some((1, MAX_HEX_OCTETS)))?;
            }
        }

        if let Some(q) = &self.quality {
            w.write_preamble(
                true,
                &[
                    q.rssi_db.is_some(),
                    q.snr_db.is_some(),
                    q.noise_db.is_some(),
                    q.range_db.is_some(),
                    q.depth_bits.is_some(),
                ],
            );
            for v in [q.rssi_db, q.snr_db, q.noise_db, q.range_db].into_iter().flatten() {
                w.write_real(v)?;
            }
            write_opt_integer(w, q.depth_bits)?;
        }

        if let Some(t) = &self.timing {
            let fields = [
                t.offset,
                t.start_ago,
                t.end_ago,
                t.ook_low_estimate,
                t.ook_high_estimate,
                t.fsk_f1_est,
                t.fsk_f2_est,
            ];
            let present: Vec<bool> = fields.iter().map(Option::is_some).collect();
            w.write_preamble(true, &present);
            for v in fields.into_iter().flatten() {
                w.write_integer(v)?;
            }
        }
        Ok(())
    }

    fn read(r: &mut BitReader<'_>) -> Result<Self, EnvelopeError> {
        let (extended, present) = r.read_preamble(true, 4)?;
        let package_id = if present[0] {
            Some(read_package_id(r)?)
        } else {
            None
        };
        let timestamp = if present[1] {
            Some(r.read_visible()?)
        } else {
            None
        };
        let sample_rate = r.read_constrained(1, MAX_SAMPLE_RATE as i64)? as u32;

        let (freq_ext, freq_present) = r.read_preamble(true, 2)?;
        let center_freq = r.read_integer()?;
        let freq1 = read_opt_integer(r, freq_present[0])?;
        let freq2 = read_opt_integer(r, freq_present[1])?;
        if freq_ext {
            r.skip_extensions()?;
        }

        let modulation = match r.read_index(3, true)? {
            0 => Modulation::Ook,
            1 => Modulation::Fsk,
            _ => Modulation::Ask,
        };

        let signal_data = match r.read_index(3, true)? {
            0 => {
                let (ext, _) = r.read_preamble(true, 0)?;
                let count = r.read_constrained(PD_MIN_PULSES as i64, 65535)? as usize;
                let rate = r.read_integer()?;
                if rate < 0 || rate > u32::MAX as i64 {
                    return Err(EnvelopeError::SampleRate(rate));
                }
                let len = r.read_length()?;
                if len != 2 * count {
                    return Err(EnvelopeError::PulseCount { count, len });
                }
                let mut pulses = Vec::with_capacity(len);
                for _ in 0..len {
                    let v = r.read_integer()?;
                    if v < 0 || v > u32::MAX as i64 {
                        return Err(EnvelopeError::PulseWidth(v));
                    }
                    pulses.push(v as u32);
                }
                if ext {
                    r.skip_extensions()?;
                }
                SignalData::Pulses {
                    sample_rate: rate as u32,
                    pulses,
                }
            }
            1 => {
                let n = r.read_constrained_length(1, MAX_HEX_STRINGS)?;
                let frames = (0..n)
                    .map(|_| r.read_octet_string(Some((1, MAX_HEX_OCTETS))))
                    .collect::<Result<Vec<Vec<u8>>, PerError>>()?;
                SignalData::HexStrings(frames)
            }
            _ => SignalData::HexString(r.read_octet_string(Some((1, MAX_HEX_OCTETS)))?),
        };

        let quality = if present[2] {
            let (ext, p) = r.read_preamble(true, 5)?;
            let q = SignalQuality {
                rssi_db: read_opt_real(r, p[0])?,
                snr_db: read_opt_real(r, p[1])?,
                noise_db: read_opt_real(r, p[2])?,
                range_db: read_opt_real(r, p[3])?,
                depth_bits: read_opt_integer(r, p[4])?,
            };
            if ext {
                r.skip_extensions()?;
            }
            Some(q)
        } else {
            None
        };

        let timing = if present[3] {
            let (ext, p) = r.read_preamble(true, 7)?;
            let t = TimingInfo {
                offset: read_opt_integer(r, p[0])?,
                start_ago: read_opt_integer(r, p[1])?,
                end_ago: read_opt_integer(r, p[2])?,
                ook_low_estimate: read_opt_integer(r, p[3])?,
                ook_high_estimate: read_opt_integer(r, p[4])?,
                fsk_f1_est: read_opt_integer(r, p[5])?,
                fsk_f2_est: read_opt_integer(r, p[6])?,
            };
            if ext {
                r.skip_extensions()?;
            }
            Some(t)
        } else {
            None
        };

        if extended {
            r.skip_extensions()?;
        }

        Ok(SignalMessage {
            package_id,
            timestamp,
            sample_rate,
            frequency: RfParameters {
                center_freq,
                freq1,
                freq2,
            },
            modulation,
            signal_data,
            quality,
            timing,
        })
    }
}

/// Device identity
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DeviceInfo {
    /// Device model
    pub model: String,
    /// Device category
    pub device_type: Option<String>,
    /// Device identifier
    pub device_id: Option<String>,
    /// Protocol name
    pub protocol: Option<String>,
}

/// How a detection was made
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DetectionMetadata {
    /// Decoder confidence (percent)
    pub confidence: u8,
    /// True if bit errors were corrected
    pub error_correction: bool,
    /// Protocol revision
    pub protocol_version: Option<String>,
    /// Raw decoded bits
    pub raw_bits: Option<Vec<u8>>,
}

/// A decoded device on the wire
#[derive(Clone, Debug, PartialEq)]
pub struct DetectedMessage {
    /// Sequence number of the originating signal
    pub package_id: Option<u32>,
    /// `GeneralizedTime` text
    pub timestamp: Option<String>,
    /// Device identity
    pub device: DeviceInfo,
    /// Decoded fields, in decoder order
    pub fields: Vec<(String, FieldValue)>,
    /// How the detection was made
    pub metadata: Option<DetectionMetadata>,
}

impl DetectedMessage {
    /// Envelope for a decoded `record`
    pub fn from_record(record: &DeviceRecord, package_id: Option<u32>, timestamp: Option<&str>) -> Self {
        DetectedMessage {
            package_id,
            timestamp: timestamp.and_then(to_generalized_time),
            device: DeviceInfo {
                model: record.model.clone(),
                device_type: record.device_type.clone(),
                device_id: record.id.clone(),
                protocol: record.protocol.clone(),
            },
            fields: record.fields().to_vec(),
            metadata: None,
        }
    }

    fn write(&self, w: &mut BitWriter) -> Result<(), EnvelopeError> {
        w.write_preamble(
            true,
            &[
                self.package_id.is_some(),
                self.timestamp.is_some(),
                self.metadata.is_some(),
            ],
        );
        if let Some(id) = self.package_id {
            w.write_integer(id as i64)?;
        }
        if let Some(ts) = &self.timestamp {
            w.write_visible(ts)?;
        }

        let d = &self.device;
        w.write_preamble(
            true,
            &[
                d.device_type.is_some(),
                d.device_id.is_some(),
                d.protocol.is_some(),
            ],
        );
        w.write_utf8(&d.model)?;
        for s in [&d.device_type, &d.device_id, &d.protocol].into_iter().flatten() {
            w.write_utf8(s)?;
        }

        w.write_length(self.fields.len())?;
        for (name, value) in &self.fields {
            w.write_preamble(true, &[]);
            w.write_utf8(name)?;
            match value {
                FieldValue::Int(v) => {
                    w.write_index(0, 5, true)?;
                    w.write_integer(*v)?;
                }
                FieldValue::Real(v) => {
                    w.write_index(1, 5, true)?;
                    w.write_real(*v)?;
                }
                FieldValue::Text(v) => {
                    w.write_index(2, 5, true)?;
                    w.write_utf8(v)?;
                }
                FieldValue::Bool(v) => {
                    w.write_index(3, 5, true)?;
                    w.write_bool(*v);
                }
                FieldValue::Bytes(v) => {
                    w.write_index(4, 5, true)?;
                    w.write_octet_string(v, None)?;
                }
            }
        }

        if let Some(m) = &self.metadata {
            w.write_preamble(
                true,
                &[m.protocol_version.is_some(), m.raw_bits.is_some()],
            );
            w.write_constrained(m.confidence.min(100) as i64, 0, 100)?;
            w.write_bool(m.error_correction);
            if let Some(v) = &m.protocol_version {
                w.write_utf8(v)?;
            }
            if let Some(bits) = &m.raw_bits {
                w.write_octet_string(bits, None)?;
            }
        }
        Ok(())
    }

    fn read(r: &mut BitReader<'_>) -> Result<Self, EnvelopeError> {
        let (extended, present) = r.read_preamble(true, 3)?;
        let package_id = if present[0] {
            Some(read_package_id(r)?)
        } else {
            None
        };
        let timestamp = if present[1] {
            Some(r.read_visible()?)
        } else {
            None
        };

        let (dev_ext, dp) = r.read_preamble(true, 3)?;
        let model = r.read_utf8()?;
        let device_type = read_opt_utf8(r, dp[0])?;
        let device_id = read_opt_utf8(r, dp[1])?;
        let protocol = read_opt_utf8(r, dp[2])?;
        if dev_ext {
            r.skip_extensions()?;
        }

        let nfields = r.read_length()?;
        let mut fields = Vec::with_capacity(nfields);
        for _ in 0..nfields {
            let (ext, _) = r.read_preamble(true, 0)?;
            let name = r.read_utf8()?;
            let value = match r.read_index(5, true)? {
                0 => FieldValue::Int(r.read_integer()?),
                1 => FieldValue::Real(r.read_real()?),
                2 => FieldValue::Text(r.read_utf8()?),
                3 => FieldValue::Bool(r.read_bool()?),
                _ => FieldValue::Bytes(r.read_octet_string(None)?),
            };
            if ext {
                r.skip_extensions()?;
            }
            fields.push((name, value));
        }

        let metadata = if present[2] {
            let (ext, mp) = r.read_preamble(true, 2)?;
            let confidence = r.read_constrained(0, 100)? as u8;
            let error_correction = r.read_bool()?;
            let protocol_version = read_opt_utf8(r, mp[0])?;
            let raw_bits = if mp[1] {
                Some(r.read_octet_string(None)?)
            } else {
                None
            };
            if ext {
                r.skip_extensions()?;
            }
            Some(DetectionMetadata {
                confidence,
                error_correction,
                protocol_version,
                raw_bits,
            })
        } else {
            None
        };

        if extended {
            r.skip_extensions()?;
        }

        Ok(DetectedMessage {
            package_id,
            timestamp,
            device: DeviceInfo {
                model,
                device_type,
                device_id,
                protocol,
            },
            fields,
            metadata,
        })
    }
}

/// Health report of one component
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StatusMessage {
    /// `GeneralizedTime` text
    pub timestamp: Option<String>,
    /// Reporting component
    pub source: String,
    /// Seconds since start
    pub uptime_s: Option<u64>,
    /// Named counters
    pub counters: Vec<(String, u64)>,
}

impl StatusMessage {
    fn write(&self, w: &mut BitWriter) -> Result<(), EnvelopeError> {
        w.write_preamble(true, &[self.timestamp.is_some(), self.uptime_s.is_some()]);
        if let Some(ts) = &self.timestamp {
            w.write_visible(ts)?;
        }
        w.write_utf8(&self.source)?;
        if let Some(up) = self.uptime_s {
            w.write_semi_constrained(up.min(i64::MAX as u64) as i64, 0)?;
        }
        w.write_length(self.counters.len())?;
        for (name, value) in &self.counters {
            w.write_preamble(true, &[]);
            w.write_utf8(name)?;
            w.write_semi_constrained((*value).min(i64::MAX as u64) as i64, 0)?;
        }
        Ok(())
    }

    fn read(r: &mut BitReader<'_>) -> Result<Self, EnvelopeError> {
        let (extended, present) = r.read_preamble(true, 2)?;
        let timestamp = if present[0] {
            Some(r.read_visible()?)
        } else {
            None
        };
        let source = r.read_utf8()?;
        let uptime_s = if present[1] {
            Some(r.read_semi_constrained(0)? as u64)
        } else {
            None
        };
        let n = r.read_length()?;
        let mut counters = Vec::with_capacity(n);
        for _ in 0..n {
            let (ext, _) = r.read_preamble(true, 0)?;
            let name = r.read_utf8()?;
            let value = r.read_semi_constrained(0)? as u64;
            if ext {
                r.skip_extensions()?;
            }
            counters.push((name, value));
        }
        if extended {
            r.skip_extensions()?;
        }
        Ok(StatusMessage {
            timestamp,
            source,
            uptime_s,
            counters,
        })
    }
}

/// Configuration key/value pairs
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ConfigMessage {
    /// `GeneralizedTime` text
    pub timestamp: Option<String>,
    /// Settings, in order
    pub entries: Vec<(String, String)>,
}

impl ConfigMessage {
    fn write(&self, w: &mut BitWriter) -> Result<(), EnvelopeError> {
        w.write_preamble(true, &[self.timestamp.is_some()]);
        if let Some(ts) = &self.timestamp {
            w.write_visible(ts)?;
        }
        w.write_length(self.entries.len())?;
        for (name, value) in &self.entries {
            w.write_preamble(true, &[]);
            w.write_utf8(name)?;
            w.write_utf8(value)?;
        }
        Ok(())
    }

    fn read(r: &mut BitReader<'_>) -> Result<Self, EnvelopeError> {
        let (extended, present) = r.read_preamble(true, 1)?;
        let timestamp = if present[0] {
            Some(r.read_visible()?)
        } else {
            None
        };
        let n = r.read_length()?;
        let mut entries = Vec::with_capacity(n);
        for _ in 0..n {
            let (ext, _) = r.read_preamble(true, 0)?;
            let name = r.read_utf8()?;
            let value = r.read_utf8()?;
            if ext {
                r.skip_extensions()?;
            }
            entries.push((name, value));
        }
        if extended {
            r.skip_extensions()?;
        }
        Ok(ConfigMessage { timestamp, entries })
    }
}

/// Convert a timestamp to `GeneralizedTime` text
///
/// Understands
///
/// * relative times `@<seconds>s`, counted from
///   [`RELATIVE_TIME_BASE`]
/// * UNIX seconds, with an optional fraction
/// * `YYYY-MM-DD HH:MM:SS[.fff]` and `YYYY-MM-DDTHH:MM:SS[.fff]`,
///   taken as UTC
/// * RFC 3339
/// * `GeneralizedTime` itself
///
/// Returns `None` for anything else.
pub fn to_generalized_time(timestamp: &str) -> Option<String> {
    let ts = timestamp.trim();
    if ts.is_empty() {
        return None;
    }

    if let Some(rel) = ts.strip_prefix('@') {
        let secs: f64 = rel.trim_end_matches('s').parse().ok()?;
        return from_unix(RELATIVE_TIME_BASE, secs).map(format_generalized);
    }

    if ts.ends_with('Z')
        && ts.len() >= 15
        && ts.as_bytes()[..14].iter().all(u8::is_ascii_digit)
        && !ts.contains('-')
    {
        return NaiveDateTime::parse_from_str(ts.trim_end_matches('Z'), "%Y%m%d%H%M%S%.f")
            .ok()
            .map(|n| format_generalized(Utc.from_utc_datetime(&n)));
    }

    if let Ok(secs) = ts.parse::<f64>() {
        return from_unix(0, secs).map(format_generalized);
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(ts) {
        return Some(format_generalized(dt.with_timezone(&Utc)));
    }

    for fmt in ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"] {
        if let Ok(n) = NaiveDateTime::parse_from_str(ts, fmt) {
            return Some(format_generalized(Utc.from_utc_datetime(&n)));
        }
    }
    None
}

/// Current time as `GeneralizedTime` text
pub fn generalized_now() -> String {
    format_generalized(Utc::now())
}

fn format_generalized(dt: DateTime<Utc>) -> String {
    dt.format("%Y%m%d%H%M%S%.fZ").to_string()
}

// `base + secs`, without losing the fraction to the base's magnitude
fn from_unix(base: i64, secs: f64) -> Option<DateTime<Utc>> {
    if !secs.is_finite() || secs.abs() > 1.0e12 {
        return None;
    }
    let mut whole = secs.floor() as i64;
    let mut nanos = ((secs - secs.floor()) * 1.0e9).round() as u32;
    if nanos >= 1_000_000_000 {
        whole += 1;
        nanos -= 1_000_000_000;
    }
    DateTime::from_timestamp(base.checked_add(whole)?, nanos)
}

fn hex_to_bytes(text: &str) -> Option<Vec<u8>> {
    let digits: Vec<u8> = text
        .chars()
        .filter(|c| !c.is_whitespace())
        .map(|c| c.to_digit(16).map(|d| d as u8))
        .collect::<Option<Vec<u8>>>()?;
    if digits.len() % 2 != 0 {
        return None;
    }
    Some(digits.chunks(2).map(|d| (d[0] << 4) | d[1]).collect())
}

fn nonzero_f(v: f64) -> Option<i64> {
    let r = v.round() as i64;
    if r != 0 {
        Some(r)
    } else {
        None
    }
}

fn nonzero_i<T: Into<i64>>(v: T) -> Option<i64> {
    let v = v.into();
    if v != 0 {
        Some(v)
    } else {
        None
    }
}

fn nonzero_db(v: f32) -> Option<f64> {
    if v != 0.0 {
        Some(v as f64)
    } else {
        None
    }
}

fn quality_of(data: &PulseData) -> Option<SignalQuality> {
    let q = SignalQuality {
        rssi_db: nonzero_db(data.rssi_db),
        snr_db: nonzero_db(data.snr_db),
        noise_db: nonzero_db(data.noise_db),
        range_db: nonzero_db(data.range_db),
        depth_bits: nonzero_i(data.depth_bits),
    };
    if q == SignalQuality::default() {
        None
    } else {
        Some(q)
    }
}

fn timing_of(data: &PulseData) -> Option<TimingInfo> {
    let t = TimingInfo {
        offset: nonzero_i(data.offset.min(i64::MAX as u64) as i64),
        start_ago: nonzero_i(data.start_ago),
        end_ago: nonzero_i(data.end_ago),
        ook_low_estimate: nonzero_i(data.ook_low_estimate),
        ook_high_estimate: nonzero_i(data.ook_high_estimate),
        fsk_f1_est: nonzero_i(data.fsk_f1_est),
        fsk_f2_est: nonzero_i(data.fsk_f2_est),
    };
    if t == TimingInfo::default() {
        None
    } else {
        Some(t)
    }
}

fn write_opt_integer(w: &mut BitWriter, v: Option<i64>) -> Result<(), PerError> {
    match v {
        Some(v) => w.write_integer(v),
        None => Ok(()),
    }
}

fn read_opt_integer(r: &mut BitReader<'_>, present: bool) -> Result<Option<i64>, PerError> {
    if present {
        Ok(Some(r.read_integer()?))
    } else {
        Ok(None)
    }
}

fn read_opt_real(r: &mut BitReader<'_>, present: bool) -> Result<Option<f64>, PerError> {
    if present {
        Ok(Some(r.read_real()?))
    } else {
        Ok(None)
    }
}

fn read_opt_utf8(r: &mut BitReader<'_>, present: bool) -> Result<Option<String>, PerError> {
    if present {
        Ok(Some(r.read_utf8()?))
    } else {
        Ok(None)
    }
}


// An optional schema INTEGER as a burst field; absent is zero
fn narrow<T>(field: &'static str, value: Option<i64>) -> Result<T, EnvelopeError>
where
    T: TryFrom<i64> + Default,
{
    match value {
        None => Ok(T::default()),
        Some(v) => T::try_from(v).map_err(|_| EnvelopeError::OutOfRange { field, value: v }),
    }
}

fn read_package_id(r: &mut BitReader<'_>) -> Result<u32, EnvelopeError> {
    let value = r.read_integer()?;
    u32::try_from(value).map_err(|_| EnvelopeError::OutOfRange {
        field: "packageId",
        value,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fsk_burst() -> PulseData {
        let mut widths = vec![40, 60, 40, 64];
        for i in 0..54u32 {
            widths.push(40 + (i % 3) * 40);
            widths.push(60 + (i % 2) * 40);
        }
        widths.push(140);
        widths.push(0);

        let mut pd = PulseData::from_pairs(250000, &widths).unwrap();
        pd.centerfreq_hz = 433920000.0;
        pd.freq1_hz = 433942000.0;
        pd.freq2_hz = 433899000.0;
        pd.rssi_db = -12.5;
        pd.snr_db = 18.25;
        pd.noise_db = -30.75;
        pd.range_db = 42.1442;
        pd.depth_bits = 8;
        pd.ook_low_estimate = 120;
        pd.ook_high_estimate = 9000;
        pd.fsk_f1_est = 5540;
        pd.fsk_f2_est = -10916;
        pd.offset = 1234567;
        pd.start_ago = 70000;
        pd.end_ago = 60000;
        pd
    }

    #[test]
    fn test_pulses_array_round_trip() {
        let pd = fsk_burst();
        assert_eq!(pd.num_pulses(), 57);

        let msg = SignalMessage::from_pulse(&pd, 7)
            .unwrap()
            .with_timestamp("@0.262144s");
        assert_eq!(msg.modulation, Modulation::Fsk);
        assert_eq!(msg.timestamp.as_deref(), Some("20240101000000.262144Z"));

        let bytes = Message::Signal(msg.clone()).encode().unwrap();
        // pure function
        assert_eq!(bytes, Message::Signal(msg.clone()).encode().unwrap());

        let back = match Message::decode(&bytes).unwrap() {
            Message::Signal(m) => m,
            other => panic!("unexpected {:?}", other),
        };
        assert_eq!(back, msg);

        let dec = back.to_pulse().unwrap();
        assert_eq!(dec.package_id, Some(7));
        assert_eq!(dec.hex, None);
        assert_eq!(dec.pulse, pd);
        assert_eq!(dec.pulse.fsk_f2_est, -10916);
    }

    #[test]
    fn test_short_burst_uses_hex() {
        let pd = PulseData::from_pairs(
            250000,
            &[
                100, 200, 200, 100, 100, 200, 100, 200, 200, 100, 100, 200, 200, 100, 100, 200,
                100, 200, 200, 100, 100, 200, 100, 2500,
            ],
        )
        .unwrap();
        assert_eq!(pd.num_pulses(), 12);

        let msg = SignalMessage::from_pulse(&pd, 1).unwrap();
        let hex = msg.signal_data.hex().expect("hex form");
        assert_eq!(Some(hex.clone()), rfraw::encode(&pd));

        let bytes = Message::Signal(msg).encode().unwrap();
        let back = match Message::decode(&bytes).unwrap() {
            Message::Signal(m) => m,
            other => panic!("unexpected {:?}", other),
        };
        let dec = back.to_pulse().unwrap();
        assert!(dec.pulse.is_empty());
        assert_eq!(dec.hex.as_deref(), Some(hex.as_str()));
        assert_eq!(rfraw::decode(&hex).unwrap().num_pulses(), 12);
    }

    #[test]
    fn test_too_short() {
        // eight pulses, ten distinct widths
        let widths: Vec<u32> = (0..16).map(|i| 20 * 2u32.pow(i % 10)).collect();
        let pd = PulseData::from_pairs(1000000, &widths).unwrap();
        assert_eq!(pd.num_pulses(), 8);
        assert_eq!(
            SignalMessage::from_pulse(&pd, 1),
            Err(EnvelopeError::TooShort(8))
        );

        let empty = PulseData::new(250000).unwrap();
        assert_eq!(
            SignalMessage::from_pulse(&empty, 1),
            Err(EnvelopeError::TooShort(0))
        );

        // an empty burst with an externally supplied fallback
        let msg = SignalMessage::from_pulse_with_hex(&empty, 2, Some("AAB1010064 8055")).unwrap();
        assert_eq!(msg.signal_data, SignalData::HexString(vec![0xaa, 0xb1, 0x01, 0x00, 0x64, 0x80, 0x55]));
    }

    #[test]
    fn test_fifteen_pulses_rejected_by_array() {
        let mut msg = SignalMessage::from_pulse(&fsk_burst(), 3).unwrap();
        msg.signal_data = SignalData::Pulses {
            sample_rate: 250000,
            pulses: vec![50; 30],
        };
        assert!(matches!(
            Message::Signal(msg).encode(),
            Err(EnvelopeError::Per(PerError::OutOfRange { .. }))
        ));
    }

    #[test]
    fn test_truncation_fails() {
        let msg = SignalMessage::from_pulse(&fsk_burst(), 9).unwrap();
        let bytes = Message::Signal(msg).encode().unwrap();
        for cut in 1..bytes.len() {
            assert!(Message::decode(&bytes[..bytes.len() - cut]).is_err());
        }
    }

    #[test]
    fn test_multi_frame_hex() {
        let data = SignalData::from_hex("AAB0 0A 02 01 0064 00C8 81 55+AAB0 0A 02 02 0064 00C8 90 55")
            .unwrap();
        match &data {
            SignalData::HexStrings(frames) => assert_eq!(frames.len(), 2),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(
            data.hex().unwrap(),
            "AAB00A0201006400C88155+AAB00A0202006400C89055"
        );
        assert_eq!(SignalData::from_hex("AAB"), Err(EnvelopeError::InvalidHex));
        assert_eq!(SignalData::from_hex("+"), Err(EnvelopeError::InvalidHex));
    }

    #[test]
    fn test_detected_round_trip() {
        let rec = DeviceRecord::new("Generic-TPMS")
            .with_type("TPMS")
            .with_id("00a1b2c3")
            .with("pressure_kPa", 231.5)
            .with("temperature_C", 21i64)
            .with("status", "ok")
            .with("battery_ok", true)
            .with("raw", vec![0xa1u8, 0xb2]);
        let mut msg = DetectedMessage::from_record(&rec, Some(42), Some("2024-05-01 12:30:00"));
        assert_eq!(msg.timestamp.as_deref(), Some("20240501123000Z"));
        msg.metadata = Some(DetectionMetadata {
            confidence: 90,
            error_correction: false,
            protocol_version: Some("1".to_owned()),
            raw_bits: None,
        });

        let bytes = Message::Detected(msg.clone()).encode().unwrap();
        assert_eq!(Message::decode(&bytes).unwrap(), Message::Detected(msg));
    }

    #[test]
    fn test_status_and_config_round_trip() {
        let status = Message::Status(StatusMessage {
            timestamp: Some("20240101000000Z".to_owned()),
            source: "pulsehub".to_owned(),
            uptime_s: Some(3600),
            counters: vec![("signals_received".to_owned(), 12), ("errors".to_owned(), 0)],
        });
        let bytes = status.encode().unwrap();
        assert_eq!(Message::decode(&bytes).unwrap(), status);

        let config = Message::Config(ConfigMessage {
            timestamp: None,
            entries: vec![("frequency".to_owned(), "433920000".to_owned())],
        });
        let bytes = config.encode().unwrap();
        assert_eq!(Message::decode(&bytes).unwrap(), config);
    }

    #[test]
    fn test_timestamps() {
        assert_eq!(
            to_generalized_time("@0s").as_deref(),
            Some("20240101000000Z")
        );
        assert_eq!(
            to_generalized_time("@1.5s").as_deref(),
            Some("20240101000001.500Z")
        );
        assert_eq!(
            to_generalized_time("1704067200").as_deref(),
            Some("20240101000000Z")
        );
        assert_eq!(
            to_generalized_time("2024-01-01T00:00:10Z").as_deref(),
            Some("20240101000010Z")
        );
        assert_eq!(
            to_generalized_time("20240101000010Z").as_deref(),
            Some("20240101000010Z")
        );
        assert_eq!(to_generalized_time("yesterday"), None);
        assert_eq!(to_generalized_time(""), None);
    }

    #[test]
    fn test_out_of_range_timing() {
        let mut msg = SignalMessage::from_pulse(&fsk_burst(), 7).unwrap();
        let timing = msg.timing.get_or_insert_with(TimingInfo::default);
        timing.start_ago = Some(-1);
        timing.end_ago = Some((1 << 32) + 7);

        // the wire carries any INTEGER; the burst model refuses it
        let bytes = Message::Signal(msg.clone()).encode().unwrap();
        let back = match Message::decode(&bytes).unwrap() {
            Message::Signal(m) => m,
            other => panic!("unexpected {:?}", other),
        };
        assert_eq!(back.timing, msg.timing);
        assert_eq!(
            back.to_pulse().unwrap_err(),
            EnvelopeError::OutOfRange {
                field: "startAgo",
                value: -1
            }
        );

        msg.timing.as_mut().unwrap().start_ago = Some(5);
        assert_eq!(
            msg.to_pulse().unwrap_err(),
            EnvelopeError::OutOfRange {
                field: "endAgo",
                value: (1 << 32) + 7
            }
        );

        let timing = msg.timing.as_mut().unwrap();
        timing.end_ago = Some(4);
        timing.fsk_f2_est = Some(i64::from(i32::MIN) - 1);
        assert!(matches!(
            msg.to_pulse(),
            Err(EnvelopeError::OutOfRange { field: "fskF2Est", .. })
        ));

        let timing = msg.timing.as_mut().unwrap();
        timing.fsk_f2_est = Some(-10916);
        timing.offset = Some(-3);
        assert!(matches!(
            msg.to_pulse(),
            Err(EnvelopeError::OutOfRange { field: "offset", .. })
        ));

        msg.timing.as_mut().unwrap().offset = None;
        msg.quality.get_or_insert_with(SignalQuality::default).depth_bits = Some(-8);
        assert!(matches!(
            msg.to_pulse(),
            Err(EnvelopeError::OutOfRange { field: "depthBits", .. })
        ));

        msg.quality.as_mut().unwrap().depth_bits = Some(8);
        let pulse = msg.to_pulse().unwrap().pulse;
        assert_eq!(pulse.start_ago, 5);
        assert_eq!(pulse.end_ago, 4);
        assert_eq!(pulse.offset, 0);
    }

    #[test]
    fn test_out_of_range_package_id() {
        for (value, ok) in [(7, true), (i64::from(u32::MAX), true), (-1, false), (1 << 32, false)] {
            let mut w = BitWriter::new();
            w.write_integer(value).unwrap();
            let bytes = w.into_bytes();
            let got = read_package_id(&mut BitReader::new(&bytes));
            if ok {
                assert_eq!(got.unwrap() as i64, value);
            } else {
                assert_eq!(
                    got.unwrap_err(),
                    EnvelopeError::OutOfRange {
                        field: "packageId",
                        value
                    }
                );
            }
        }
    }
}
