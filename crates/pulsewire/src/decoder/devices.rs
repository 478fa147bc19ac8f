//! Built-in decoders and device definition files
//!
//! The built-in catalog is a handful of generic [flex](crate::flex)
//! decoders plus a generic FSK Manchester tire-pressure decoder.
//! More flex decoders can be loaded from device definition files:
//!
//! ```txt
//! { "name": "doorbell", "modulation": "OOK_PWM",
//!   "description": "Front door chime",
//!   "flex_spec": "s=400,l=800,r=8000,bits>=24",
//!   "enabled": true, "priority": 10 }
//! ```
//!
//! A JSON file holds one such object or an array of them. An INI
//! file holds one `[section]` per device, with the same keys as
//! `key = value` lines.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Deserializer};
use thiserror::Error;

#[cfg(not(test))]
use log::{debug, info, warn};

#[cfg(test)]
use std::{println as debug, println as info, println as warn};

use super::{DecodeError, Decoder, Registry, RegistryError};
use crate::bitbuffer::{crc8, manchester_decode, search};
use crate::flex::{FlexDecoder, FlexError};
use crate::pulse::PulseData;
use crate::record::DeviceRecord;
use crate::slicer::{slice, Coding, Timing};

/// Flex specifications of the built-in decoders, in protocol order
pub const BUILTIN_FLEX: &[&str] = &[
    "n=Generic-Remote-PWM,m=OOK_PWM,s=400,l=1200,g=2000,r=9000,bits>=24,repeats>=2",
    "n=EV1527-Remote,m=OOK_PWM,s=300,l=900,g=2500,r=12000,bits=24,repeats>=3",
    "n=Generic-Sensor-PPM,m=OOK_PPM,s=1000,l=2000,g=3000,r=5000,bits>=32",
    "n=Generic-Manchester,m=OOK_MC_ZEROBIT,s=500,r=5000,bits>=32",
    "n=Generic-FSK-PCM,m=FSK_PCM,s=52,l=52,r=1000,preamble=aaaa2dd4,bits>=48",
];

/// Error loading device definitions
#[derive(Error, Debug)]
pub enum DeviceConfigError {
    /// The file or directory could not be read
    #[error("unable to read \"{path}\": {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Malformed JSON
    #[error("bad device JSON: {0}")]
    Json(#[from] serde_json::Error),

    /// Malformed INI line
    #[error("bad device INI at line {line}: {message}")]
    Ini { line: usize, message: String },

    /// A definition lacks a required key
    #[error("device definition \"{device}\" has no \"{field}\"")]
    MissingField {
        device: String,
        field: &'static str,
    },

    /// The flex specification does not parse
    #[error("device \"{device}\": {source}")]
    Flex {
        device: String,
        #[source]
        source: FlexError,
    },

    /// A decoder selector names no decoder
    #[error("{0}")]
    Registry(#[from] RegistryError),
}

/// Definition file syntax
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DefinitionFormat {
    /// JSON object or array of objects
    Json,
    /// INI sections
    Ini,
}

impl DefinitionFormat {
    /// Format implied by a file extension
    pub fn from_path(path: &Path) -> Option<DefinitionFormat> {
        let ext = path.extension()?.to_str()?.to_ascii_lowercase();
        match ext.as_str() {
            "json" => Some(DefinitionFormat::Json),
            "ini" | "conf" => Some(DefinitionFormat::Ini),
            _ => None,
        }
    }

    /// Guess the format from the text itself
    pub fn sniff(text: &str) -> DefinitionFormat {
        match text.trim_start().chars().next() {
            Some('{') | Some('[') => DefinitionFormat::Json,
            _ => DefinitionFormat::Ini,
        }
    }
}

/// One device definition
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct DeviceDefinition {
    /// Model name
    pub name: String,

    /// Line coding, if the flex spec does not give one
    #[serde(default)]
    pub modulation: Option<String>,

    /// Free text
    #[serde(default)]
    pub description: Option<String>,

    /// Flex specification
    pub flex_spec: String,

    /// Disabled definitions are loaded but not registered
    #[serde(default = "enabled_default", deserialize_with = "de_flag")]
    pub enabled: bool,

    /// Registration order, ascending
    #[serde(default)]
    pub priority: i32,
}

fn enabled_default() -> bool {
    true
}

// accept true, "true", "1" or 1
fn de_flag<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    let value = serde_json::Value::deserialize(deserializer)?;
    Ok(match value {
        serde_json::Value::Bool(b) => b,
        serde_json::Value::Number(n) => n.as_i64() != Some(0),
        serde_json::Value::String(s) => parse_flag(&s),
        _ => false,
    })
}

fn parse_flag(s: &str) -> bool {
    matches!(
        s.trim().to_ascii_lowercase().as_str(),
        "true" | "1" | "yes" | "on"
    )
}

impl DeviceDefinition {
    /// Build the flex decoder for this definition
    ///
    /// The definition's `name` and `modulation` apply unless the
    /// flex specification overrides them.
    pub fn to_decoder(&self) -> Result<FlexDecoder, DeviceConfigError> {
        let mut spec = format!("n={}", self.name);
        if let Some(m) = self.modulation.as_deref().filter(|m| !m.trim().is_empty()) {
            spec.push_str(",m=");
            spec.push_str(m.trim());
        }
        spec.push(',');
        spec.push_str(&self.flex_spec);

        FlexDecoder::parse(&spec).map_err(|source| DeviceConfigError::Flex {
            device: self.name.clone(),
            source,
        })
    }

    fn validate(self) -> Result<Self, DeviceConfigError> {
        if self.name.trim().is_empty() {
            return Err(DeviceConfigError::MissingField {
                device: self.name,
                field: "name",
            });
        }
        if self.flex_spec.trim().is_empty() {
            return Err(DeviceConfigError::MissingField {
                device: self.name,
                field: "flex_spec",
            });
        }
        Ok(self)
    }
}

/// Parse definitions from JSON text
///
/// The text holds one definition object or an array of them.
pub fn parse_json(text: &str) -> Result<Vec<DeviceDefinition>, DeviceConfigError> {
    let defs = if text.trim_start().starts_with('[') {
        serde_json::from_str::<Vec<DeviceDefinition>>(text)?
    } else {
        vec![serde_json::from_str::<DeviceDefinition>(text)?]
    };
    defs.into_iter().map(DeviceDefinition::validate).collect()
}

/// Parse definitions from INI text
///
/// Each `[section]` starts a device named after the section
/// unless a `name` key follows. Lines starting with `#` or `;`
/// are comments. Keys before the first section form a device of
/// their own.
pub fn parse_ini(text: &str) -> Result<Vec<DeviceDefinition>, DeviceConfigError> {
    #[derive(Default)]
    struct Partial {
        section: String,
        name: Option<String>,
        modulation: Option<String>,
        description: Option<String>,
        flex_spec: Option<String>,
        enabled: Option<bool>,
        priority: Option<i32>,
        touched: bool,
    }

    impl Partial {
        fn finish(self) -> Result<Option<DeviceDefinition>, DeviceConfigError> {
            if !self.touched {
                return Ok(None);
            }
            let name = self
                .name
                .or_else(|| Some(self.section.clone()).filter(|s| !s.is_empty()))
                .ok_or_else(|| DeviceConfigError::MissingField {
                    device: self.section.clone(),
                    field: "name",
                })?;
            let flex_spec = self
                .flex_spec
                .ok_or_else(|| DeviceConfigError::MissingField {
                    device: name.clone(),
                    field: "flex_spec",
                })?;
            DeviceDefinition {
                name,
                modulation: self.modulation,
                description: self.description,
                flex_spec,
                enabled: self.enabled.unwrap_or(true),
                priority: self.priority.unwrap_or(0),
            }
            .validate()
            .map(Some)
        }
    }

    let mut out = Vec::new();
    let mut cur = Partial::default();

    for (lineno, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
            continue;
        }

        if let Some(section) = line.strip_prefix('[') {
            let section = section.strip_suffix(']').ok_or_else(|| DeviceConfigError::Ini {
                line: lineno + 1,
                message: "unterminated section header".to_owned(),
            })?;
            let prev = std::mem::replace(
                &mut cur,
                Partial {
                    section: section.trim().to_owned(),
                    touched: true,
                    ..Partial::default()
                },
            );
            out.extend(prev.finish()?);
            continue;
        }

        let (key, value) = line.split_once('=').ok_or_else(|| DeviceConfigError::Ini {
            line: lineno + 1,
            message: format!("expected key = value, got \"{}\"", line),
        })?;
        let value = unquote(value.trim()).to_owned();
        cur.touched = true;
        match key.trim().to_ascii_lowercase().as_str() {
            "name" => cur.name = Some(value),
            "modulation" => cur.modulation = Some(value),
            "description" => cur.description = Some(value),
            "flex_spec" => cur.flex_spec = Some(value),
            "enabled" => cur.enabled = Some(parse_flag(&value)),
            "priority" => {
                cur.priority = Some(value.parse().map_err(|_| DeviceConfigError::Ini {
                    line: lineno + 1,
                    message: format!("bad priority \"{}\"", value),
                })?)
            }
            other => debug!("devices: ignoring INI key \"{}\"", other),
        }
    }
    out.extend(cur.finish()?);
    Ok(out)
}

fn unquote(s: &str) -> &str {
    s.strip_prefix('"')
        .and_then(|s| s.strip_suffix('"'))
        .unwrap_or(s)
}

/// Parse definitions in the given format
pub fn parse_definitions(
    text: &str,
    format: DefinitionFormat,
) -> Result<Vec<DeviceDefinition>, DeviceConfigError> {
    match format {
        DefinitionFormat::Json => parse_json(text),
        DefinitionFormat::Ini => parse_ini(text),
    }
}

/// Load definitions from a file or a directory of files
///
/// In a directory, every `.json`, `.ini` and `.conf` file is
/// loaded in name order and other files are ignored. A single
/// file without a known extension is sniffed.
pub fn load_path(path: &Path) -> Result<Vec<DeviceDefinition>, DeviceConfigError> {
    let io_err = |source| DeviceConfigError::Io {
        path: path.to_owned(),
        source,
    };

    if path.is_dir() {
        let mut files: Vec<PathBuf> = fs::read_dir(path)
            .map_err(io_err)?
            .filter_map(|e| e.ok().map(|e| e.path()))
            .filter(|p| p.is_file() && DefinitionFormat::from_path(p).is_some())
            .collect();
        files.sort();

        let mut out = Vec::new();
        for file in files {
            out.extend(load_file(&file)?);
        }
        info!(
            "devices: loaded {} definition(s) from {}",
            out.len(),
            path.display()
        );
        return Ok(out);
    }

    load_file(path)
}

fn load_file(path: &Path) -> Result<Vec<DeviceDefinition>, DeviceConfigError> {
    let text = fs::read_to_string(path).map_err(|source| DeviceConfigError::Io {
        path: path.to_owned(),
        source,
    })?;
    let format = DefinitionFormat::from_path(path).unwrap_or_else(|| DefinitionFormat::sniff(&text));
    let defs = parse_definitions(&text, format)?;
    for def in &defs {
        debug!("devices: {} from {}", def.name, path.display());
    }
    Ok(defs)
}

/// Register enabled definitions in ascending priority
///
/// Every definition is checked before any is registered.
/// Returns the protocol numbers assigned.
pub fn register_definitions(
    registry: &mut Registry,
    defs: &[DeviceDefinition],
) -> Result<Vec<usize>, DeviceConfigError> {
    let mut enabled: Vec<&DeviceDefinition> = defs.iter().filter(|d| d.enabled).collect();
    enabled.sort_by_key(|d| d.priority);

    let decoders = enabled
        .iter()
        .map(|d| d.to_decoder())
        .collect::<Result<Vec<_>, _>>()?;

    for def in defs.iter().filter(|d| !d.enabled) {
        info!("devices: {} is disabled", def.name);
    }
    Ok(decoders
        .into_iter()
        .map(|d| registry.register(Box::new(d)))
        .collect())
}

/// Every built-in decoder, in protocol order
pub fn builtin_decoders() -> Vec<Box<dyn Decoder>> {
    let mut out: Vec<Box<dyn Decoder>> = Vec::with_capacity(BUILTIN_FLEX.len() + 1);
    for spec in BUILTIN_FLEX {
        match FlexDecoder::parse(spec) {
            Ok(dec) => out.push(Box::new(dec)),
            Err(e) => warn!("devices: built-in \"{}\": {}", spec, e),
        }
    }
    out.push(Box::new(TpmsDecoder::default()));
    out
}

/// Registry holding the built-in decoders
pub fn builtin_registry() -> Registry {
    let mut registry = Registry::new();
    for dec in builtin_decoders() {
        registry.register(dec);
    }
    registry
}

/// Decoder selection from the command line
///
/// The registry is assembled in this order:
///
/// 1. the built-in decoders
/// 2. definitions from each `config_files` entry
/// 3. each of the `flex_specs`
///
/// and then the `selectors` are applied with
/// [`Registry::select()`].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RegistryOptions {
    /// Inline flex specifications (`-X`)
    pub flex_specs: Vec<String>,
    /// Device definition files or directories (`-c`)
    pub config_files: Vec<PathBuf>,
    /// Enable/disable selectors (`-R`)
    pub selectors: Vec<i64>,
}

impl RegistryOptions {
    /// Assemble the registry
    pub fn build(&self) -> Result<Registry, DeviceConfigError> {
        let mut registry = builtin_registry();

        for path in &self.config_files {
            let defs = load_path(path)?;
            let numbers = register_definitions(&mut registry, &defs)?;
            info!(
                "devices: {} decoder(s) from \"{}\"",
                numbers.len(),
                path.display()
            );
        }

        for spec in &self.flex_specs {
            let dec = FlexDecoder::parse(spec).map_err(|source| DeviceConfigError::Flex {
                device: spec.clone(),
                source,
            })?;
            registry.register(Box::new(dec));
        }

        registry.select(&self.selectors)?;
        info!(
            "devices: {} of {} decoders enabled",
            registry.num_enabled(),
            registry.len()
        );
        Ok(registry)
    }
}

/// Generic FSK tire pressure sensor
///
/// Bits are sent at 160 µs per symbol. A run of alternating
/// preamble bits is followed by the sync word `111000` and
/// 64 Manchester-coded data bits (`10` = 1, `01` = 0):
///
/// ```txt
/// IIIIIIII PP TT FF CC
/// ```
///
/// * `I`: sensor ID
/// * `P`: pressure, 2.5 kPa per count
/// * `T`: temperature, °C + 40
/// * `F`: status flags
/// * `C`: CRC-8 (poly 0x07, init 0) over the first seven bytes
#[derive(Clone, Debug)]
pub struct TpmsDecoder {
    timing: Timing,
}

impl TpmsDecoder {
    /// Model name
    pub const MODEL: &'static str = "Generic-TPMS";

    const SYNC: [u8; 1] = [0xe0];
    const SYNC_BITS: usize = 6;
    const PAYLOAD_BITS: usize = 64;

    fn decode_row(&self, row: &[u8], len: usize) -> Result<DeviceRecord, DecodeError> {
        let pos = search(row, len, 0, &Self::SYNC, Self::SYNC_BITS);
        if pos + Self::SYNC_BITS >= len {
            return Err(DecodeError::AbortEarly);
        }

        let (bits, _) = manchester_decode(row, len, pos + Self::SYNC_BITS, Self::PAYLOAD_BITS);
        let b = match bits.row(0) {
            Some((b, n)) if n == Self::PAYLOAD_BITS => b,
            _ => return Err(DecodeError::AbortLength),
        };

        if crc8(&b[..7], 0x07, 0x00) != b[7] {
            return Err(DecodeError::FailMic);
        }

        let id = u32::from_be_bytes([b[0], b[1], b[2], b[3]]);
        Ok(DeviceRecord::new(Self::MODEL)
            .with_type("TPMS")
            .with_id(format!("{:08X}", id))
            .with_protocol(Coding::FskPcm.to_string())
            .with("pressure_kPa", b[4] as f64 * 2.5)
            .with("temperature_C", b[5] as i64 - 40)
            .with("flags", b[6] as i64)
            .with("mic", "CRC"))
    }
}

impl Default for TpmsDecoder {
    fn default() -> Self {
        Self {
            timing: Timing {
                short_us: 160.0,
                long_us: 160.0,
                reset_us: 4000.0,
                ..Timing::default()
            },
        }
    }
}

impl Decoder for TpmsDecoder {
    fn name(&self) -> &str {
        Self::MODEL
    }

    fn coding(&self) -> Coding {
        Coding::FskPcm
    }

    fn timing(&self) -> Timing {
        self.timing
    }

    fn decode(&self, data: &PulseData) -> Result<Vec<DeviceRecord>, DecodeError> {
        let bits = slice(Coding::FskPcm, &self.timing, data);

        // report the most specific failure
        let mut err = DecodeError::AbortEarly;
        for (row, len) in bits.rows() {
            match self.decode_row(row, len) {
                Ok(rec) => return Ok(vec![rec]),
                Err(DecodeError::AbortEarly) => {}
                Err(e) => {
                    if err == DecodeError::AbortEarly || e == DecodeError::FailMic {
                        err = e;
                    }
                }
            }
        }
        Err(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // FSK burst at 250 kHz carrying a TPMS payload
    fn tpms_burst(payload: &[u8; 8]) -> PulseData {
        let mut symbols = String::new();
        symbols.push_str(&"10".repeat(6));
        symbols.push_str("111000");
        for i in 0..64 {
            let bit = crate::bitbuffer::bit_at(payload, i);
            symbols.push_str(if bit { "10" } else { "01" });
        }
        symbols.push('0');

        let mut widths = vec![40, 60, 40, 64];
        let mut chars = symbols.chars().peekable();
        while let Some(c) = chars.next() {
            let mut run = 1;
            while chars.peek() == Some(&c) {
                chars.next();
                run += 1;
            }
            widths.push(run * 40);
        }
        widths.extend([140, 0]);

        let mut data = PulseData::from_pairs(250_000, &widths).unwrap();
        data.fsk_f2_est = -10916;
        data
    }

    #[test]
    fn test_builtin_registry() {
        let registry = builtin_registry();
        let list = registry.list();
        assert_eq!(list.len(), BUILTIN_FLEX.len() + 1);
        assert_eq!(list[0].number, 1);
        assert_eq!(list[0].name, "Generic-Remote-PWM");
        assert_eq!(list[5].name, TpmsDecoder::MODEL);
        assert_eq!(list[5].coding, Coding::FskPcm);
        assert!(list.iter().all(|d| d.enabled));
    }

    #[test]
    fn test_tpms_decode() {
        let payload = [0x1a, 0x2b, 0x3c, 0x4d, 0x5c, 0x41, 0x00, 0xba];
        let data = tpms_burst(&payload);
        assert_eq!(data.num_pulses(), 58);

        let recs = TpmsDecoder::default().decode(&data).unwrap();
        assert_eq!(recs.len(), 1);
        let r = &recs[0];
        assert_eq!(r.model, "Generic-TPMS");
        assert_eq!(r.id.as_deref(), Some("1A2B3C4D"));
        assert_eq!(r.field("pressure_kPa"), Some(&230.0.into()));
        assert_eq!(r.field("temperature_C"), Some(&25i64.into()));
        assert_eq!(r.field("flags"), Some(&0i64.into()));

        // only the TPMS decoder claims it
        let dispatcher = crate::decoder::Dispatcher::new(builtin_registry());
        let out = dispatcher.dispatch(&data);
        assert_eq!(out.records.len(), 1);
        assert!(!out.fallback);
    }

    #[test]
    fn test_tpms_reject() {
        let mut payload = [0x1a, 0x2b, 0x3c, 0x4d, 0x5c, 0x41, 0x00, 0xba];
        payload[7] ^= 0x01;
        let data = tpms_burst(&payload);
        assert_eq!(TpmsDecoder::default().decode(&data), Err(DecodeError::FailMic));

        let noise = PulseData::from_pairs(250_000, &[40, 40, 40, 40, 40, 0]).unwrap();
        assert_eq!(TpmsDecoder::default().decode(&noise), Err(DecodeError::AbortEarly));
    }

    #[test]
    fn test_parse_json() {
        let defs = parse_json(
            r#"{"name": "doorbell", "modulation": "OOK_PWM",
                "flex_spec": "s=400,l=800,r=8000", "enabled": "true", "priority": 3}"#,
        )
        .unwrap();
        assert_eq!(defs.len(), 1);
        assert_eq!(defs[0].name, "doorbell");
        assert!(defs[0].enabled);
        assert_eq!(defs[0].priority, 3);

        let defs = parse_json(
            r#"[{"name": "a", "flex_spec": "m=OOK_PPM,s=1,l=2"},
                {"name": "b", "flex_spec": "m=OOK_PCM,s=1", "enabled": false}]"#,
        )
        .unwrap();
        assert_eq!(defs.len(), 2);
        assert!(defs[0].enabled);
        assert_eq!(defs[0].priority, 0);
        assert!(!defs[1].enabled);

        assert!(matches!(
            parse_json(r#"{"flex_spec": "m=OOK_PCM,s=1"}"#),
            Err(DeviceConfigError::Json(_))
        ));
        assert!(matches!(
            parse_json(r#"{"name": "x", "flex_spec": " "}"#),
            Err(DeviceConfigError::MissingField { field: "flex_spec", .. })
        ));
    }

    #[test]
    fn test_parse_ini() {
        let text = "\
# devices
[doorbell]
modulation = OOK_PWM
flex_spec = \"s=400,l=800,r=8000\"
priority = 5

; second
[gate]
name = Gate-Opener
flex_spec = m=OOK_PPM,s=1000,l=2000
enabled = 0
";
        let defs = parse_ini(text).unwrap();
        assert_eq!(defs.len(), 2);
        assert_eq!(defs[0].name, "doorbell");
        assert_eq!(defs[0].modulation.as_deref(), Some("OOK_PWM"));
        assert_eq!(defs[0].flex_spec, "s=400,l=800,r=8000");
        assert_eq!(defs[0].priority, 5);
        assert!(defs[0].enabled);
        assert_eq!(defs[1].name, "Gate-Opener");
        assert!(!defs[1].enabled);

        assert!(matches!(
            parse_ini("[x]\nflex_spec\n"),
            Err(DeviceConfigError::Ini { line: 2, .. })
        ));
        assert!(matches!(
            parse_ini("[x]\nname = y\n"),
            Err(DeviceConfigError::MissingField { field: "flex_spec", .. })
        ));
    }

    #[test]
    fn test_format() {
        assert_eq!(
            DefinitionFormat::from_path(Path::new("a/b.JSON")),
            Some(DefinitionFormat::Json)
        );
        assert_eq!(
            DefinitionFormat::from_path(Path::new("x.conf")),
            Some(DefinitionFormat::Ini)
        );
        assert_eq!(DefinitionFormat::from_path(Path::new("x.txt")), None);
        assert_eq!(DefinitionFormat::sniff("  [\n{}]"), DefinitionFormat::Json);
        assert_eq!(DefinitionFormat::sniff("[dev]\nname=x"), DefinitionFormat::Ini);
    }

    #[test]
    fn test_register_definitions() {
        let defs = vec![
            DeviceDefinition {
                name: "late".to_owned(),
                modulation: Some("OOK_PPM".to_owned()),
                description: None,
                flex_spec: "s=1000,l=2000".to_owned(),
                enabled: true,
                priority: 9,
            },
            DeviceDefinition {
                name: "off".to_owned(),
                modulation: None,
                description: None,
                flex_spec: "m=OOK_PCM,s=100".to_owned(),
                enabled: false,
                priority: 0,
            },
            DeviceDefinition {
                name: "early".to_owned(),
                modulation: None,
                description: Some("first".to_owned()),
                flex_spec: "m=OOK_PCM,s=100".to_owned(),
                enabled: true,
                priority: 1,
            },
        ];

        let mut registry = builtin_registry();
        let numbers = register_definitions(&mut registry, &defs).unwrap();
        assert_eq!(numbers, vec![7, 8]);
        let list = registry.list();
        assert_eq!(list[6].name, "early");
        assert_eq!(list[7].name, "late");
        assert_eq!(list[7].coding, Coding::OokPpm);

        let bad = vec![DeviceDefinition {
            name: "bad".to_owned(),
            modulation: None,
            description: None,
            flex_spec: "s=100".to_owned(),
            enabled: true,
            priority: 0,
        }];
        let mut registry = Registry::new();
        assert!(matches!(
            register_definitions(&mut registry, &bad),
            Err(DeviceConfigError::Flex { .. })
        ));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_registry_options() {
        let opts = RegistryOptions {
            flex_specs: vec!["n=gate,m=OOK_PPM,s=1000,l=2000".to_owned()],
            config_files: Vec::new(),
            selectors: vec![-1, -7],
        };
        let registry = opts.build().unwrap();
        let list = registry.list();
        assert_eq!(list.len(), 7);
        assert_eq!(list[6].name, "gate");
        assert!(!list[0].enabled);
        assert!(!list[6].enabled);
        assert_eq!(registry.num_enabled(), 5);

        let opts = RegistryOptions {
            selectors: vec![6],
            ..RegistryOptions::default()
        };
        assert_eq!(opts.build().unwrap().num_enabled(), 1);

        let opts = RegistryOptions {
            selectors: vec![99],
            ..RegistryOptions::default()
        };
        assert!(matches!(opts.build(), Err(DeviceConfigError::Registry(_))));

        let opts = RegistryOptions {
            flex_specs: vec!["n=x,m=OOK_PWM".to_owned()],
            ..RegistryOptions::default()
        };
        assert!(matches!(opts.build(), Err(DeviceConfigError::Flex { .. })));

        let opts = RegistryOptions {
            config_files: vec![PathBuf::from("/nonexistent/devices.json")],
            ..RegistryOptions::default()
        };
        assert!(matches!(opts.build(), Err(DeviceConfigError::Io { .. })));
    }
}
