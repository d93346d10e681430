//! Kubernetes resource quantities
//!
//! Quantities travel as strings (`"500m"`, `"128Mi"`, `"2e3"`) and are only
//! converted to floating point when a ratio has to be computed.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QuantityError {
    #[error("empty quantity")]
    Empty,
    #[error("invalid number in quantity {0:?}")]
    InvalidNumber(String),
    #[error("unknown suffix {suffix:?} in quantity {quantity:?}")]
    UnknownSuffix { quantity: String, suffix: String },
}

/// A resource quantity as reported by the API server
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Quantity(pub String);

impl Quantity {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Approximate numeric value in base units (cores, bytes, ...)
    pub fn to_f64(&self) -> Result<f64, QuantityError> {
        parse_quantity(&self.0)
    }
}

impl From<&str> for Quantity {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for Quantity {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl fmt::Display for Quantity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Parse a quantity string into its approximate value
pub fn parse_quantity(raw: &str) -> Result<f64, QuantityError> {
    let s = raw.trim();
    if s.is_empty() {
        return Err(QuantityError::Empty);
    }

    let split = s
        .char_indices()
        .find(|(i, c)| !(c.is_ascii_digit() || *c == '.' || (*i == 0 && (*c == '+' || *c == '-'))))
        .map(|(i, _)| i)
        .unwrap_or(s.len());
    let (number, suffix) = s.split_at(split);

    if !number.chars().any(|c| c.is_ascii_digit()) {
        return Err(QuantityError::InvalidNumber(raw.to_string()));
    }
    let value: f64 = number
        .parse()
        .map_err(|_| QuantityError::InvalidNumber(raw.to_string()))?;

    let multiplier = suffix_multiplier(suffix).ok_or_else(|| QuantityError::UnknownSuffix {
        quantity: raw.to_string(),
        suffix: suffix.to_string(),
    })?;

    Ok(value * multiplier)
}

fn suffix_multiplier(suffix: &str) -> Option<f64> {
    let m = match suffix {
        "" => 1.0,
        "n" => 1e-9,
        "u" => 1e-6,
        "m" => 1e-3,
        "k" => 1e3,
        "M" => 1e6,
        "G" => 1e9,
        "T" => 1e12,
        "P" => 1e15,
        "E" => 1e18,
        "Ki" => 1024.0,
        "Mi" => 1024.0 * 1024.0,
        "Gi" => 1024.0 * 1024.0 * 1024.0,
        "Ti" => 1024f64.powi(4),
        "Pi" => 1024f64.powi(5),
        "Ei" => 1024f64.powi(6),
        _ => return decimal_exponent(suffix),
    };
    Some(m)
}

// "e3", "E-2"
fn decimal_exponent(suffix: &str) -> Option<f64> {
    let rest = suffix
        .strip_prefix('e')
        .or_else(|| suffix.strip_prefix('E'))?;
    let exp: i32 = rest.parse().ok()?;
    Some(10f64.powi(exp))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn approx(a: f64, b: f64) -> bool {
        (a - b).abs() <= 1e-9 * b.abs().max(1.0)
    }

    #[test]
    fn test_plain_and_decimal_si() {
        assert!(approx(parse_quantity("2").unwrap(), 2.0));
        assert!(approx(parse_quantity("1.5").unwrap(), 1.5));
        assert!(approx(parse_quantity("500m").unwrap(), 0.5));
        assert!(approx(parse_quantity("250000n").unwrap(), 0.00025));
        assert!(approx(parse_quantity("3k").unwrap(), 3000.0));
        assert!(approx(parse_quantity("1G").unwrap(), 1e9));
    }

    #[test]
    fn test_binary_si() {
        assert!(approx(parse_quantity("1Ki").unwrap(), 1024.0));
        assert!(approx(parse_quantity("128Mi").unwrap(), 134_217_728.0));
        assert!(approx(parse_quantity("2Gi").unwrap(), 2_147_483_648.0));
    }

    #[test]
    fn test_exponent_and_exa() {
        assert!(approx(parse_quantity("2e3").unwrap(), 2000.0));
        assert!(approx(parse_quantity("5E-1").unwrap(), 0.5));
        assert!(approx(parse_quantity("1E").unwrap(), 1e18));
    }

    #[test]
    fn test_zero() {
        assert_eq!(parse_quantity("0").unwrap(), 0.0);
        assert_eq!(parse_quantity("0m").unwrap(), 0.0);
    }

    #[test]
    fn test_invalid_quantities() {
        assert_eq!(parse_quantity(""), Err(QuantityError::Empty));
        assert!(matches!(
            parse_quantity("abc"),
            Err(QuantityError::InvalidNumber(_))
        ));
        assert!(matches!(
            parse_quantity("10Xi"),
            Err(QuantityError::UnknownSuffix { .. })
        ));
        assert!(matches!(
            parse_quantity("."),
            Err(QuantityError::InvalidNumber(_))
        ));
    }

    #[test]
    fn test_quantity_serde_is_transparent() {
        let q: Quantity = serde_json::from_str("\"250m\"").unwrap();
        assert_eq!(q, Quantity::from("250m"));
        assert_eq!(serde_json::to_string(&q).unwrap(), "\"250m\"");
    }
}
