//! Measuring-block decoding
//!
//! A KWP ReadDataByLocalIdentifier response body is a sequence of three-byte
//! `(type, A, B)` triplets. The type byte selects a VW-specific conversion
//! formula turning the two operands into an engineering value with a unit.
//! The decoder is pure and total: unknown types fall back to a hex rendering,
//! a trailing partial triplet is dropped.

use serde::Serialize;

/// A decoded engineering value
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Value {
    /// Numeric result, rounded to two decimal places
    Number(f64),
    /// Textual result (odometer renderings, unknown types)
    Text(String),
}

/// One decoded `(type, A, B)` triplet
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Measurement {
    /// Decoded value
    pub value: Value,
    /// Unit string (EG: `rpm`, `°C`, `km/h`)
    pub unit: String,
    /// Raw type byte that selected the formula
    #[serde(rename = "type")]
    pub kind: u8,
}

/// Decodes a measuring-block response body (leading group byte already
/// stripped) into an ordered list of measurements
pub fn decode_block(body: &[u8]) -> Vec<Measurement> {
    body.chunks_exact(3)
        .map(|t| {
            let (value, unit) = decode_value(t[0], t[1], t[2]);
            Measurement {
                value,
                unit,
                kind: t[0],
            }
        })
        .collect()
}

/// Applies the conversion formula for one triplet
pub fn decode_value(kind: u8, a: u8, b: u8) -> (Value, String) {
    let a_f = f64::from(a);
    let b_f = f64::from(b);
    let (value, unit): (f64, &str) = match kind {
        1 => (a_f * b_f / 5.0, "rpm"),
        2 => (0.002 * a_f * b_f, "%"),
        3 => (0.002 * a_f * b_f, "deg"),
        5 => (0.1 * a_f * (b_f - 100.0), "°C"),
        6 => (0.001 * a_f * b_f, "V"),
        7 => (a_f * b_f / 100.0, "km/h"),
        9 => (0.02 * a_f * (b_f - 127.0), "deg"),
        15 => (0.01 * a_f * b_f, "ms"),
        18 => (0.04 * a_f * b_f, "mbar"),
        19 => (0.01 * a_f * b_f, "l"),
        20 => (a_f * (b_f - 128.0) / 128.0, "%"),
        21 => (0.001 * a_f * b_f, "V"),
        23 => (b_f / 256.0 * a_f, "%"),
        25 => (a_f / 182.0 + 1.421 * b_f, "g/s"),
        26 => (b_f - a_f, "°C"),
        27 => (0.01 * a_f * (b_f - 128.0).abs(), "deg"),
        33 => {
            if a == 0 {
                (100.0 * b_f, "%")
            } else {
                (100.0 * b_f / a_f, "%")
            }
        }
        34 => (0.01 * a_f * (b_f - 128.0), "kW"),
        35 => (0.01 * a_f * b_f, "l/h"),
        36 => return (Value::Text(format!("{a} {b}")), "km".to_string()),
        43 => (0.1 * b_f + 25.5 * a_f, "V"),
        52 => (0.02 * a_f * b_f - a_f, "Nm"),
        56 => (256.0 * a_f + b_f, "WSC"),
        66 => (a_f * b_f / 511.12, "V"),
        67 => (640.0 * a_f + 2.5 * b_f, "deg"),
        83 => (0.01 * (256.0 * a_f + b_f), "bar"),
        other => {
            return (
                Value::Text(format!("0x{a:02X}{b:02X}")),
                format!("Type_{other}"),
            );
        }
    };
    (Value::Number(round2(value)), unit.to_string())
}

fn round2(x: f64) -> f64 {
    (x * 100.0).round() / 100.0
}
