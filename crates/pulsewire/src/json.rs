//! Legacy JSON signal format
//!
//! Older clients publish each burst as one flat JSON object:
//!
//! ```json
//! {"package_id":7,"mod":"FSK","count":58,"pulses":[160,240,…],
//!  "freq_Hz":433920000,"freq1_Hz":433942000,"freq2_Hz":433899000,
//!  "rate_Hz":250000,"depth_bits":8,"range_dB":42.1442,
//!  "rssi_dB":-12.5,"snr_dB":18.25,"noise_dB":-30.75,
//!  "offset":1234567,"start_ago":70000,"end_ago":60000,
//!  "ook_low_estimate":120,"ook_high_estimate":9000,
//!  "fsk_f1_est":5540,"fsk_f2_est":-10916}
//! ```
//!
//! Unlike every other representation in this crate, the
//! `pulses` array is in **microseconds**. It is converted to
//! samples at the `rate_Hz` of the message.

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::envelope::DecodedSignal;
use crate::pulse::{Modulation, PulseData, PD_MAX, PD_MIN_PULSES};
use crate::record::DeviceRecord;

#[cfg(not(test))]
use log::{debug, warn};

#[cfg(test)]
use std::{println as debug, println as warn};

/// Sampling rate assumed when a message has none, or a bad one
pub const DEFAULT_SAMPLE_RATE: u32 = 250_000;

const MAX_SAMPLE_RATE: i64 = 10_000_000;

// second frequency estimate assumed for FSK messages without one
const FSK_F2_PLACEHOLDER: i32 = -1000;

/// Error reading a JSON signal
#[derive(Error, Debug)]
pub enum JsonError {
    /// Not JSON, or not a signal object
    #[error("invalid JSON signal: {0}")]
    Syntax(#[from] serde_json::Error),

    /// Neither `pulses` nor `hex_string` has content
    #[error("JSON signal carries neither pulses nor hex_string")]
    NoPulses,
}

/// One burst in the legacy JSON format
///
/// Keys are accepted under their legacy aliases: `rssi_db` for
/// `rssi_dB`, `sample_rate` for `rate_Hz`, `frequency` for
/// `freq_Hz`, `modulation` for `mod`, `num_pulses` for `count`.
/// Unknown keys are ignored.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct LegacySignal {
    /// Sender sequence number
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub package_id: Option<u32>,

    /// `"OOK"` or `"FSK"`
    #[serde(
        rename = "mod",
        alias = "modulation",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub modulation: Option<String>,

    /// Number of pulses
    #[serde(alias = "num_pulses", default)]
    pub count: usize,

    /// `pulse, gap, …` in microseconds
    #[serde(default, deserialize_with = "lenient_widths")]
    pub pulses: Vec<u32>,

    /// Center frequency (Hz)
    #[serde(
        rename = "freq_Hz",
        alias = "frequency",
        default,
        deserialize_with = "lenient_int"
    )]
    pub freq_hz: i64,

    /// FSK mark frequency (Hz)
    #[serde(
        rename = "freq1_Hz",
        default,
        deserialize_with = "lenient_opt_int",
        skip_serializing_if = "Option::is_none"
    )]
    pub freq1_hz: Option<i64>,

    /// FSK space frequency (Hz)
    #[serde(
        rename = "freq2_Hz",
        default,
        deserialize_with = "lenient_opt_int",
        skip_serializing_if = "Option::is_none"
    )]
    pub freq2_hz: Option<i64>,

    /// Sampling rate (Hz)
    #[serde(
        rename = "rate_Hz",
        alias = "sample_rate",
        default,
        deserialize_with = "lenient_int"
    )]
    pub rate_hz: i64,

    /// Sample depth (bits)
    #[serde(default)]
    pub depth_bits: u32,

    /// Dynamic range (dB)
    #[serde(rename = "range_dB", alias = "range_db", default)]
    pub range_db: f32,

    /// Signal strength (dB)
    #[serde(rename = "rssi_dB", alias = "rssi_db", default)]
    pub rssi_db: f32,

    /// Signal to noise ratio (dB)
    #[serde(rename = "snr_dB", alias = "snr_db", default)]
    pub snr_db: f32,

    /// Noise floor (dB)
    #[serde(rename = "noise_dB", alias = "noise_db", default)]
    pub noise_db: f32,

    /// Sample position of the burst start
    #[serde(default)]
    pub offset: u64,

    /// Samples from burst start to emission
    #[serde(default)]
    pub start_ago: u32,

    /// Samples from burst end to emission
    #[serde(default)]
    pub end_ago: u32,

    /// Envelope level of gaps
    #[serde(default)]
    pub ook_low_estimate: i32,

    /// Envelope level of pulses
    #[serde(default)]
    pub ook_high_estimate: i32,

    /// Mark frequency estimate
    #[serde(default)]
    pub fsk_f1_est: i32,

    /// Space frequency estimate
    #[serde(default)]
    pub fsk_f2_est: i32,

    /// rfraw hex, frames joined with `+`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hex_string: Option<String>,

    /// Capture time
    #[serde(alias = "timestamp", default, skip_serializing_if = "Option::is_none")]
    pub time: Option<String>,
}

impl LegacySignal {
    /// Legacy form of `data`
    ///
    /// Widths are converted to whole microseconds.
    pub fn from_pulse(data: &PulseData, package_id: u32) -> Self {
        let pulses = data
            .to_alternating()
            .into_iter()
            .map(|w| data.samples_to_us(w).round() as u32)
            .collect();

        LegacySignal {
            package_id: Some(package_id),
            modulation: Some(data.modulation().to_string()),
            count: data.num_pulses(),
            pulses,
            freq_hz: data.centerfreq_hz.round() as i64,
            freq1_hz: nonzero(data.freq1_hz),
            freq2_hz: nonzero(data.freq2_hz),
            rate_hz: data.sample_rate() as i64,
            depth_bits: data.depth_bits,
            range_db: data.range_db,
            rssi_db: data.rssi_db,
            snr_db: data.snr_db,
            noise_db: data.noise_db,
            offset: data.offset,
            start_ago: data.start_ago,
            end_ago: data.end_ago,
            ook_low_estimate: data.ook_low_estimate,
            ook_high_estimate: data.ook_high_estimate,
            fsk_f1_est: data.fsk_f1_est,
            fsk_f2_est: data.fsk_f2_est,
            hex_string: None,
            time: None,
        }
    }

    /// Attach an rfraw rendition
    pub fn with_hex<S: Into<String>>(mut self, hex: S) -> Self {
        self.hex_string = Some(hex.into());
        self
    }

    /// Attach a capture time
    pub fn with_time<S: Into<String>>(mut self, time: S) -> Self {
        self.time = Some(time.into());
        self
    }

    /// Rebuild the burst
    ///
    /// A missing, zero or absurd (> 10 MHz) sampling rate is
    /// replaced with [`DEFAULT_SAMPLE_RATE`]. If the declared
    /// `mod` disagrees with `fsk_f2_est`, the declared
    /// modulation wins. A message with only `hex_string`
    /// yields an empty pulse array; expand the hex with
    /// [`rfraw::decode()`](crate::rfraw::decode).
    pub fn to_pulse(&self) -> Result<DecodedSignal, JsonError> {
        let hex = self
            .hex_string
            .as_deref()
            .map(str::trim)
            .filter(|h| !h.is_empty())
            .map(str::to_owned);
        if self.pulses.len() < 2 && hex.is_none() {
            return Err(JsonError::NoPulses);
        }

        let rate = if self.rate_hz <= 0 || self.rate_hz > MAX_SAMPLE_RATE {
            warn!(
                "json: sample rate {} is invalid; assuming {} Hz",
                self.rate_hz, DEFAULT_SAMPLE_RATE
            );
            DEFAULT_SAMPLE_RATE
        } else {
            self.rate_hz as u32
        };

        let mut pulse = PulseData::new(rate).map_err(|_| JsonError::NoPulses)?;

        let mut npairs = self.pulses.len() / 2;
        if self.count > 0 && self.count != npairs {
            debug!(
                "json: count {} disagrees with {} pulse/gap pairs",
                self.count, npairs
            );
            npairs = npairs.min(self.count);
        }
        for pair in self.pulses.chunks_exact(2).take(npairs.min(PD_MAX + 1)) {
            let p = pulse.us_to_samples(pair[0] as f64);
            let g = pulse.us_to_samples(pair[1] as f64);
            if !pulse.push(p, g) {
                break;
            }
        }

        pulse.centerfreq_hz = self.freq_hz as f64;
        pulse.freq1_hz = self.freq1_hz.unwrap_or(0) as f64;
        pulse.freq2_hz = self.freq2_hz.unwrap_or(0) as f64;
        pulse.depth_bits = self.depth_bits;
        pulse.range_db = self.range_db;
        pulse.rssi_db = self.rssi_db;
        pulse.snr_db = self.snr_db;
        pulse.noise_db = self.noise_db;
        pulse.offset = self.offset;
        pulse.start_ago = self.start_ago;
        pulse.end_ago = self.end_ago;
        pulse.ook_low_estimate = self.ook_low_estimate;
        pulse.ook_high_estimate = self.ook_high_estimate;
        pulse.fsk_f1_est = self.fsk_f1_est;
        pulse.fsk_f2_est = self.fsk_f2_est;

        let declared = self
            .modulation
            .as_deref()
            .and_then(|m| m.trim().parse::<Modulation>().ok());
        match declared {
            Some(Modulation::Fsk) if pulse.fsk_f2_est == 0 => {
                let delta = self.freq2_hz.unwrap_or(0) - self.freq_hz;
                pulse.fsk_f2_est = if self.freq2_hz.is_some() && delta != 0 {
                    delta.clamp(i32::MIN as i64, i32::MAX as i64) as i32
                } else {
                    FSK_F2_PLACEHOLDER
                };
            }
            Some(Modulation::Ook) | Some(Modulation::Ask) => pulse.fsk_f2_est = 0,
            _ => {}
        }

        Ok(DecodedSignal {
            modulation: declared.unwrap_or_else(|| pulse.modulation()),
            pulse,
            timestamp: self.time.clone(),
            hex,
            package_id: self.package_id,
        })
    }
}

/// Serialize a burst to legacy JSON
///
/// A burst shorter than [`PD_MIN_PULSES`] which has a `hex`
/// rendition is sent as hex only, with an empty `pulses` array.
pub fn pulse_to_json(
    data: &PulseData,
    package_id: u32,
    hex: Option<&str>,
    time: Option<&str>,
) -> Result<String, JsonError> {
    let mut msg = LegacySignal::from_pulse(data, package_id);
    if let Some(h) = hex {
        if data.num_pulses() < PD_MIN_PULSES {
            msg.pulses.clear();
        }
        msg = msg.with_hex(h);
    }
    if let Some(t) = time {
        msg = msg.with_time(t);
    }
    Ok(serde_json::to_string(&msg)?)
}

/// Parse a burst from legacy JSON
pub fn json_to_pulse(payload: &[u8]) -> Result<DecodedSignal, JsonError> {
    let msg: LegacySignal = serde_json::from_slice(payload)?;
    msg.to_pulse()
}

/// Serialize a decoded device to JSON
///
/// The object is the record's own
/// [`to_json()`](DeviceRecord::to_json) followed by `time` and
/// `package_id`, when known.
pub fn detected_to_json(record: &DeviceRecord, package_id: Option<u32>, time: Option<&str>) -> String {
    let mut out: Map<String, Value> = record.to_json();
    if let Some(t) = time {
        out.insert("time".to_owned(), Value::from(t));
    }
    if let Some(id) = package_id {
        out.insert("package_id".to_owned(), Value::from(id));
    }
    Value::Object(out).to_string()
}

/// Current UTC time in the format of the `time` key
///
/// `YYYY-MM-DD HH:MM:SS.fff`
pub fn time_now() -> String {
    chrono::Utc::now()
        .format("%Y-%m-%d %H:%M:%S%.3f")
        .to_string()
}

fn nonzero(hz: f64) -> Option<i64> {
    let hz = hz.round() as i64;
    if hz != 0 {
        Some(hz)
    } else {
        None
    }
}

fn value_to_i64(v: &Value) -> Option<i64> {
    match v {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f.round() as i64)),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

// integers which may have been written as floats or strings
fn lenient_int<'de, D: Deserializer<'de>>(d: D) -> Result<i64, D::Error> {
    let v = Value::deserialize(d)?;
    value_to_i64(&v).ok_or_else(|| D::Error::custom(format!("expected an integer, found {}", v)))
}

fn lenient_opt_int<'de, D: Deserializer<'de>>(d: D) -> Result<Option<i64>, D::Error> {
    match Option::<Value>::deserialize(d)? {
        None | Some(Value::Null) => Ok(None),
        Some(v) => value_to_i64(&v)
            .map(Some)
            .ok_or_else(|| D::Error::custom(format!("expected an integer, found {}", v))),
    }
}

fn lenient_widths<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u32>, D::Error> {
    let values = Vec::<Value>::deserialize(d)?;
    values
        .iter()
        .map(|v| match value_to_i64(v) {
            Some(w) if (0..=u32::MAX as i64).contains(&w) => Ok(w as u32),
            _ => Err(D::Error::custom(format!("invalid pulse width {}", v))),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    use assert_approx_eq::assert_approx_eq;

    fn burst() -> PulseData {
        let mut pd = PulseData::from_pairs(250000, &[40, 60, 40, 64, 41, 59, 140, 0]).unwrap();
        pd.centerfreq_hz = 433920000.0;
        pd.freq1_hz = 433942000.0;
        pd.freq2_hz = 433899000.0;
        pd.rssi_db = -12.5;
        pd.snr_db = 18.3;
        pd.noise_db = -30.8;
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
    fn test_round_trip() {
        let pd = burst();
        let text = pulse_to_json(&pd, 11, None, Some("@1.5s")).unwrap();
        assert!(text.contains(r#""mod":"FSK""#));
        assert!(text.contains(r#""pulses":[160,240,160,256,164,236,560,0]"#));
        assert!(text.contains(r#""rate_Hz":250000"#));

        let back = json_to_pulse(text.as_bytes()).unwrap();
        assert_eq!(back.package_id, Some(11));
        assert_eq!(back.modulation, Modulation::Fsk);
        assert_eq!(back.timestamp.as_deref(), Some("@1.5s"));
        assert_eq!(back.hex, None);
        // 4 µs per sample: every width survives exactly
        assert_eq!(back.pulse, pd);
    }

    #[test]
    fn test_rounding_at_odd_rate() {
        let pd = PulseData::from_pairs(1024000, &[100, 205, 3, 1000]).unwrap();
        let text = pulse_to_json(&pd, 1, None, None).unwrap();
        let back = json_to_pulse(text.as_bytes()).unwrap().pulse;
        assert_eq!(back.num_pulses(), 2);
        for (a, b) in back.to_alternating().iter().zip(pd.to_alternating()) {
            assert!((*a as i64 - b as i64).abs() <= 1);
        }
    }

    #[test]
    fn test_aliases_and_default_rate() {
        let text = r#"{"modulation":"OOK","num_pulses":2,"pulses":[400,800.0,"400",8000],
            "frequency":433.92e6,"sample_rate":0,"rssi_db":-3.5,"snr_db":9,"noise_db":-12.5,
            "model":"ignored"}"#;
        let dec = json_to_pulse(text.as_bytes()).unwrap();
        assert_eq!(dec.pulse.sample_rate(), DEFAULT_SAMPLE_RATE);
        assert_eq!(dec.pulse.to_alternating(), vec![100, 200, 100, 2000]);
        assert_approx_eq!(dec.pulse.centerfreq_hz, 433920000.0f64);
        assert_approx_eq!(dec.pulse.rssi_db, -3.5f32);
        assert_approx_eq!(dec.pulse.snr_db, 9.0f32);
        assert_eq!(dec.modulation, Modulation::Ook);
        assert_eq!(dec.package_id, None);

        let text = r#"{"mod":"OOK","count":1,"pulses":[100,100],"rate_Hz":20000000}"#;
        let dec = json_to_pulse(text.as_bytes()).unwrap();
        assert_eq!(dec.pulse.sample_rate(), DEFAULT_SAMPLE_RATE);
    }

    #[test]
    fn test_hex_only_and_fsk_hint() {
        let text = r#"{"package_id":3,"mod":"FSK","count":0,"rate_Hz":250000,
            "freq_Hz":433920000,"freq2_Hz":433900000,"hex_string":"AAB10301F403E8138881918255"}"#;
        let dec = json_to_pulse(text.as_bytes()).unwrap();
        assert!(dec.pulse.is_empty());
        assert_eq!(dec.hex.as_deref(), Some("AAB10301F403E8138881918255"));
        assert_eq!(dec.pulse.fsk_f2_est, -20000);
        assert_eq!(dec.pulse.modulation(), Modulation::Fsk);
    }

    #[test]
    fn test_rejects() {
        assert!(matches!(
            json_to_pulse(b"{\"mod\":\"OOK\",\"count\":0}"),
            Err(JsonError::NoPulses)
        ));
        assert!(matches!(
            json_to_pulse(b"not json"),
            Err(JsonError::Syntax(_))
        ));
        assert!(matches!(
            json_to_pulse(b"{\"pulses\":[-5,10]}"),
            Err(JsonError::Syntax(_))
        ));
    }

    #[test]
    fn test_detected_json() {
        let rec = DeviceRecord::new("Generic-TPMS")
            .with_id("00a1b2c3")
            .with("pressure_kPa", 231.5);
        assert_eq!(
            detected_to_json(&rec, Some(9), Some("2024-01-01 00:00:00")),
            r#"{"model":"Generic-TPMS","id":"00a1b2c3","pressure_kPa":231.5,"time":"2024-01-01 00:00:00","package_id":9}"#
        );
    }
}
