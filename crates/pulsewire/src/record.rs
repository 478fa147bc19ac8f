//! Decoded device records

use serde_json::{Map, Number, Value};

/// Value of one decoded field
#[derive(Clone, Debug, PartialEq)]
pub enum FieldValue {
    /// Integer
    Int(i64),
    /// Floating-point
    Real(f64),
    /// Text
    Text(String),
    /// Flag
    Bool(bool),
    /// Raw octets
    Bytes(Vec<u8>),
}

impl FieldValue {
    /// JSON representation
    ///
    /// Bytes become an uppercase hex string. Non-finite reals,
    /// which JSON cannot carry, become `null`.
    pub fn to_json(&self) -> Value {
        match self {
            FieldValue::Int(v) => Value::from(*v),
            FieldValue::Real(v) => Number::from_f64(*v).map_or(Value::Null, Value::Number),
            FieldValue::Text(v) => Value::from(v.as_str()),
            FieldValue::Bool(v) => Value::from(*v),
            FieldValue::Bytes(v) => Value::from(hex_upper(v)),
        }
    }

    /// Interpret a JSON scalar
    ///
    /// Arrays and objects have no field representation and
    /// return `None`.
    pub fn from_json(value: &Value) -> Option<FieldValue> {
        match value {
            Value::Bool(b) => Some(FieldValue::Bool(*b)),
            Value::Number(n) => match n.as_i64() {
                Some(i) => Some(FieldValue::Int(i)),
                None => n.as_f64().map(FieldValue::Real),
            },
            Value::String(s) => Some(FieldValue::Text(s.clone())),
            _ => None,
        }
    }
}

impl From<i64> for FieldValue {
    fn from(v: i64) -> Self {
        FieldValue::Int(v)
    }
}

impl From<f64> for FieldValue {
    fn from(v: f64) -> Self {
        FieldValue::Real(v)
    }
}

impl From<bool> for FieldValue {
    fn from(v: bool) -> Self {
        FieldValue::Bool(v)
    }
}

impl From<&str> for FieldValue {
    fn from(v: &str) -> Self {
        FieldValue::Text(v.to_owned())
    }
}

impl From<String> for FieldValue {
    fn from(v: String) -> Self {
        FieldValue::Text(v)
    }
}

impl From<Vec<u8>> for FieldValue {
    fn from(v: Vec<u8>) -> Self {
        FieldValue::Bytes(v)
    }
}

/// One device identified in a burst
///
/// Every record names the `model` which produced it. The
/// remaining fields are open-ended and entirely up to the
/// decoder; consumers must tolerate fields they do not know.
#[derive(Clone, Debug, PartialEq)]
pub struct DeviceRecord {
    /// Device model, e.g. `"Generic-TPMS"`
    pub model: String,
    /// Device category, e.g. `"TPMS"`
    pub device_type: Option<String>,
    /// Device identifier
    pub id: Option<String>,
    /// Protocol name
    pub protocol: Option<String>,
    fields: Vec<(String, FieldValue)>,
}

impl DeviceRecord {
    /// Record for `model` with no fields
    pub fn new<S: Into<String>>(model: S) -> Self {
        Self {
            model: model.into(),
            device_type: None,
            id: None,
            protocol: None,
            fields: Vec::new(),
        }
    }

    /// Set the device category
    pub fn with_type<S: Into<String>>(mut self, device_type: S) -> Self {
        self.device_type = Some(device_type.into());
        self
    }

    /// Set the device identifier
    pub fn with_id<S: Into<String>>(mut self, id: S) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Set the protocol name
    pub fn with_protocol<S: Into<String>>(mut self, protocol: S) -> Self {
        self.protocol = Some(protocol.into());
        self
    }

    /// Append a field
    pub fn with<S, V>(mut self, name: S, value: V) -> Self
    where
        S: Into<String>,
        V: Into<FieldValue>,
    {
        self.fields.push((name.into(), value.into()));
        self
    }

    /// Value of the first field called `name`
    pub fn field(&self, name: &str) -> Option<&FieldValue> {
        self.fields
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v)
    }

    /// All fields, in insertion order
    pub fn fields(&self) -> &[(String, FieldValue)] {
        &self.fields
    }

    /// Flat JSON object
    ///
    /// `model` comes first, followed by `type`, `id` and
    /// `protocol` when known, then every field.
    pub fn to_json(&self) -> Map<String, Value> {
        let mut out = Map::new();
        out.insert("model".to_owned(), Value::from(self.model.as_str()));
        if let Some(t) = &self.device_type {
            out.insert("type".to_owned(), Value::from(t.as_str()));
        }
        if let Some(id) = &self.id {
            out.insert("id".to_owned(), Value::from(id.as_str()));
        }
        if let Some(p) = &self.protocol {
            out.insert("protocol".to_owned(), Value::from(p.as_str()));
        }
        for (name, value) in &self.fields {
            out.insert(name.clone(), value.to_json());
        }
        out
    }
}

pub(crate) fn hex_upper(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02X}", b)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_json() {
        let rec = DeviceRecord::new("Generic-TPMS")
            .with_type("TPMS")
            .with_id("1a2b3c")
            .with("pressure_kPa", 231.5)
            .with("flags", 3i64)
            .with("battery_ok", true)
            .with("raw", vec![0xdeu8, 0xad]);

        assert_eq!(rec.field("flags"), Some(&FieldValue::Int(3)));
        assert_eq!(rec.field("nope"), None);

        let json = Value::Object(rec.to_json()).to_string();
        assert_eq!(
            json,
            r#"{"model":"Generic-TPMS","type":"TPMS","id":"1a2b3c","pressure_kPa":231.5,"flags":3,"battery_ok":true,"raw":"DEAD"}"#
        );
    }

    #[test]
    fn test_field_from_json() {
        assert_eq!(
            FieldValue::from_json(&Value::from(7)),
            Some(FieldValue::Int(7))
        );
        assert_eq!(
            FieldValue::from_json(&Value::from(1.5)),
            Some(FieldValue::Real(1.5))
        );
        assert_eq!(FieldValue::from_json(&Value::Null), None);
        assert_eq!(FieldValue::Real(f64::NAN).to_json(), Value::Null);
    }
}
