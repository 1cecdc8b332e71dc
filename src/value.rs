// src/value.rs - Decoded register values
use crate::scan_plan::{DataType, TagSpec};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Engineering value decoded from one tag's registers.
///
/// ```rust
/// use regscan::Value;
///
/// assert_eq!(Value::Int(42).as_float(), Some(42.0));
/// assert_eq!(Value::Float(1.5).as_float(), Some(1.5));
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value")]
pub enum Value {
    /// Unscaled INTEGER register
    Int(i64),
    /// REAL register pair or scaled INTEGER
    Float(f64),
    /// DIGITAL register, labelled bits only
    Bits(BTreeMap<String, bool>),
}

impl Value {
    /// Numeric view used by alarm evaluation. `Bits` has none.
    pub fn as_float(&self) -> Option<f64> {
        match self {
            Value::Int(i) => Some(*i as f64),
            Value::Float(f) => Some(*f),
            Value::Bits(_) => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            Value::Float(f) if f.is_finite() => Some(*f as i64),
            _ => None,
        }
    }

    pub fn bit(&self, label: &str) -> Option<bool> {
        match self {
            Value::Bits(bits) => bits.get(label).copied(),
            _ => None,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Bits(_) => "bits",
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Int(i) => write!(f, "{}", i),
            Value::Float(v) => write!(f, "{}", v),
            Value::Bits(bits) => {
                let items: Vec<String> = bits
                    .iter()
                    .map(|(label, on)| format!("{}: {}", label, if *on { "ON" } else { "OFF" }))
                    .collect();
                write!(f, "{{{}}}", items.join(", "))
            }
        }
    }
}

/// Latest value of a tag together with the raw words it came from.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Reading {
    pub value: Value,
    pub raw: Vec<u16>,
    pub timestamp: DateTime<Utc>,
}

/// Linear raw to engineering conversion.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Scaling {
    pub raw_zero: f64,
    pub raw_full: f64,
    pub eng_zero: f64,
    pub eng_full: f64,
}

impl Scaling {
    /// Scaling is defined only when all four parameters are present.
    pub fn from_parts(
        raw_zero: Option<f64>,
        raw_full: Option<f64>,
        eng_zero: Option<f64>,
        eng_full: Option<f64>,
    ) -> Option<Self> {
        Some(Self {
            raw_zero: raw_zero?,
            raw_full: raw_full?,
            eng_zero: eng_zero?,
            eng_full: eng_full?,
        })
    }

    /// `None` when the raw span is zero.
    pub fn apply(&self, raw: f64) -> Option<f64> {
        let span = self.raw_full - self.raw_zero;
        if span == 0.0 {
            return None;
        }
        Some(self.eng_zero + (raw - self.raw_zero) * (self.eng_full - self.eng_zero) / span)
    }
}

/// Combine a high and low word into a big-endian IEEE-754 single.
pub fn registers_to_f32(high: u16, low: u16) -> f32 {
    f32::from_bits((u32::from(high) << 16) | u32::from(low))
}

/// Decode `registers` (exactly the tag's footprint) into a reading.
///
/// Returns `None` when the footprint is short or a REAL is not finite.
pub fn decode(tag: &TagSpec, registers: &[u16], timestamp: DateTime<Utc>) -> Option<Reading> {
    if registers.len() < usize::from(tag.read_count) {
        return None;
    }

    let value = match tag.data_type {
        DataType::Integer => {
            let raw = registers[0];
            match tag.scaling.as_ref() {
                Some(scaling) => match scaling.apply(f64::from(raw)) {
                    Some(scaled) => Value::Float(scaled),
                    None => Value::Int(i64::from(raw)),
                },
                None => Value::Int(i64::from(raw)),
            }
        }
        DataType::Real => {
            let v = registers_to_f32(registers[0], registers[1]);
            if !v.is_finite() {
                return None;
            }
            let v = f64::from(v);
            Value::Float(tag.scaling.as_ref().and_then(|s| s.apply(v)).unwrap_or(v))
        }
        DataType::Digital => {
            let raw = registers[0];
            let bits = tag
                .bits
                .iter()
                .map(|(bit, label)| (label.clone(), raw & (1 << bit) != 0))
                .collect();
            Value::Bits(bits)
        }
    };

    Some(Reading {
        value,
        raw: registers[..usize::from(tag.read_count)].to_vec(),
        timestamp,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scan_plan::TagDefinition;

    fn spec(data_type: DataType, scaling: Option<[f64; 4]>, bits: &[(&str, &str)]) -> TagSpec {
        let definition = TagDefinition {
            address: 40010,
            data_type,
            description: None,
            unit: None,
            raw_zero_scale: scaling.map(|s| s[0]),
            raw_full_scale: scaling.map(|s| s[1]),
            eng_zero_scale: scaling.map(|s| s[2]),
            eng_full_scale: scaling.map(|s| s[3]),
            bits: if bits.is_empty() {
                None
            } else {
                Some(
                    bits.iter()
                        .map(|(k, v)| (k.to_string(), v.to_string()))
                        .collect(),
                )
            },
        };
        TagSpec::from_definition(vec!["t".into()], &definition).unwrap()
    }

    #[test]
    fn test_real_big_endian() {
        assert_eq!(registers_to_f32(0x3F80, 0x0000), 1.0);
        assert_eq!(registers_to_f32(0xC2C8, 0x0000), -100.0);
    }

    #[test]
    fn test_integer_scaling() {
        let tag = spec(DataType::Integer, Some([0.0, 27648.0, 0.0, 100.0]), &[]);
        let reading = decode(&tag, &[13824], Utc::now()).unwrap();
        assert_eq!(reading.value, Value::Float(50.0));
        assert_eq!(reading.raw, vec![13824]);
    }

    #[test]
    fn test_integer_without_scaling() {
        let tag = spec(DataType::Integer, None, &[]);
        assert_eq!(decode(&tag, &[7], Utc::now()).unwrap().value, Value::Int(7));

        // Zero raw span leaves the value unscaled
        let flat = spec(DataType::Integer, Some([5.0, 5.0, 0.0, 10.0]), &[]);
        assert_eq!(decode(&flat, &[7], Utc::now()).unwrap().value, Value::Int(7));
    }

    #[test]
    fn test_real_nan_is_missing() {
        let tag = spec(DataType::Real, None, &[]);
        assert!(decode(&tag, &[0x7FC0, 0x0000], Utc::now()).is_none());
        assert!(decode(&tag, &[0x3F80], Utc::now()).is_none());
    }

    #[test]
    fn test_digital_bits() {
        let tag = spec(DataType::Digital, None, &[("BIT 0", "RUNNING"), ("BIT 9", "PUMP ON")]);
        let reading = decode(&tag, &[0b10_0000_0000], Utc::now()).unwrap();
        assert_eq!(reading.value.bit("PUMP ON"), Some(true));
        assert_eq!(reading.value.bit("RUNNING"), Some(false));
        assert_eq!(reading.value.as_float(), None);
    }
}
