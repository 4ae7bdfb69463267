//! Physical units and quantities.
//!
//! Only what the feature pipelines need: a unit is a base symbol plus an SI
//! scale factor, and a quantity can be converted between units sharing the
//! same base.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{DaqError, DaqResult};

const BASE_UNITS: &[&str] = &[
    "V", "A", "Hz", "s", "W", "Ohm", "F", "H", "K", "m", "g", "rad", "deg",
];

const PREFIXES: &[(&str, f64)] = &[
    ("p", 1e-12),
    ("n", 1e-9),
    ("u", 1e-6),
    ("µ", 1e-6),
    ("m", 1e-3),
    ("c", 1e-2),
    ("k", 1e3),
    ("M", 1e6),
    ("G", 1e9),
];

/// A unit such as `mV` or `kHz`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Unit {
    symbol: String,
    base: String,
    scale: f64,
}

impl Unit {
    /// Parse a unit symbol, accepting an optional SI prefix.
    pub fn parse(symbol: &str) -> DaqResult<Self> {
        let symbol = symbol.trim();
        if BASE_UNITS.contains(&symbol) {
            return Ok(Self {
                symbol: symbol.to_string(),
                base: symbol.to_string(),
                scale: 1.0,
            });
        }
        for (prefix, scale) in PREFIXES {
            if let Some(rest) = symbol.strip_prefix(prefix) {
                if BASE_UNITS.contains(&rest) {
                    return Ok(Self {
                        symbol: symbol.to_string(),
                        base: rest.to_string(),
                        scale: *scale,
                    });
                }
            }
        }
        Err(DaqError::Unit(format!("unknown unit '{symbol}'")))
    }

    /// Symbol as written, e.g. `"mV"`.
    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    /// Base unit, e.g. `"V"`.
    pub fn base(&self) -> &str {
        &self.base
    }

    /// Whether values in `self` can be expressed in `other`.
    pub fn is_compatible(&self, other: &Unit) -> bool {
        self.base == other.base
    }
}

impl fmt::Display for Unit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.symbol)
    }
}

/// A magnitude attached to a unit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Quantity {
    /// Numeric part.
    pub magnitude: f64,
    /// Unit of the magnitude.
    pub unit: Unit,
}

impl Quantity {
    /// Quantity of `magnitude` in `unit`.
    pub fn new(magnitude: f64, unit: Unit) -> Self {
        Self { magnitude, unit }
    }

    /// Build a quantity from a magnitude and a unit symbol.
    pub fn parse(magnitude: f64, unit: &str) -> DaqResult<Self> {
        Ok(Self::new(magnitude, Unit::parse(unit)?))
    }

    /// Express the quantity in another unit with the same base.
    pub fn to(&self, unit: &Unit) -> DaqResult<Quantity> {
        if !self.unit.is_compatible(unit) {
            return Err(DaqError::Unit(format!(
                "cannot convert {} to {}",
                self.unit, unit
            )));
        }
        Ok(Quantity::new(
            self.magnitude * self.unit.scale / unit.scale,
            unit.clone(),
        ))
    }

    /// Magnitude once converted to `unit`.
    pub fn magnitude_in(&self, unit: &Unit) -> DaqResult<f64> {
        Ok(self.to(unit)?.magnitude)
    }
}

impl PartialEq for Quantity {
    fn eq(&self, other: &Self) -> bool {
        match other.to(&self.unit) {
            Ok(converted) => {
                let scale = self.magnitude.abs().max(converted.magnitude.abs()).max(1.0);
                (self.magnitude - converted.magnitude).abs() <= 1e-12 * scale
            }
            Err(_) => false,
        }
    }
}

impl fmt::Display for Quantity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.magnitude, self.unit)
    }
}
