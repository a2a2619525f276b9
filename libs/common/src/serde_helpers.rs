//! Shared Serde deserializers
//!
//! Configuration values in the bridge come from JSON files and environment
//! variables, so numbers may arrive either natively or as strings:
//! - Native number `502` → 502
//! - String number `"502"` → 502 (surrounding whitespace ignored)

use std::num::NonZeroU32;

use serde::{Deserialize, Deserializer};
use serde_json::Value;

#[derive(Deserialize)]
#[serde(untagged)]
enum IntOrString {
    Int(u64),
    String(String),
}

fn deserialize_unsigned<'de, D>(deserializer: D, max: u64, kind: &str) -> Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    use serde::de::Error;

    let value = match IntOrString::deserialize(deserializer)? {
        IntOrString::Int(i) => i,
        IntOrString::String(s) => s.trim().parse::<u64>().map_err(|e| {
            D::Error::custom(format!("Invalid {} value '{}': {}", kind, s, e))
        })?,
    };

    if value > max {
        return Err(D::Error::custom(format!(
            "Value {} out of range for {}",
            value, kind
        )));
    }
    Ok(value)
}

/// Custom deserializer for u16 fields that accepts numbers and numeric strings
pub fn deserialize_u16_flexible<'de, D>(deserializer: D) -> Result<u16, D::Error>
where
    D: Deserializer<'de>,
{
    deserialize_unsigned(deserializer, u64::from(u16::MAX), "u16").map(|v| v as u16)
}

/// Custom deserializer for u32 fields that accepts numbers and numeric strings
pub fn deserialize_u32_flexible<'de, D>(deserializer: D) -> Result<u32, D::Error>
where
    D: Deserializer<'de>,
{
    deserialize_unsigned(deserializer, u64::from(u32::MAX), "u32").map(|v| v as u32)
}

/// Custom deserializer for u8 fields (Modbus unit identifiers)
pub fn deserialize_u8_flexible<'de, D>(deserializer: D) -> Result<u8, D::Error>
where
    D: Deserializer<'de>,
{
    deserialize_unsigned(deserializer, u64::from(u8::MAX), "u8").map(|v| v as u8)
}

/// Interpret a loosely-typed JSON value as a positive number of seconds.
///
/// Accepted: integers, floats with no fractional part, numeric strings.
/// Rejected: zero, negatives, fractions, values above `u32::MAX`, and any
/// non-numeric shape (bool, null, array, object).
pub fn parse_positive_seconds(value: &Value) -> Result<NonZeroU32, String> {
    let seconds: u64 = match value {
        Value::Number(n) => {
            if let Some(u) = n.as_u64() {
                u
            } else if let Some(i) = n.as_i64() {
                return Err(format!("expected a positive number of seconds, got {}", i));
            } else {
                let f = n.as_f64().unwrap_or(f64::NAN);
                if !f.is_finite() || f.fract() != 0.0 || f < 0.0 || f > f64::from(u32::MAX) {
                    return Err(format!("expected a whole number of seconds, got {}", n));
                }
                f as u64
            }
        },
        Value::String(s) => s
            .trim()
            .parse::<u64>()
            .map_err(|e| format!("cannot parse '{}' as seconds: {}", s, e))?,
        other => return Err(format!("expected a number of seconds, got {}", other)),
    };

    let seconds = u32::try_from(seconds)
        .map_err(|_| format!("{} seconds is out of range", seconds))?;
    NonZeroU32::new(seconds).ok_or_else(|| "interval must be greater than zero".to_string())
}
