//! Numeric limits validators.
//!
//! Limits can be static (declared on a feature) or built per driver instance
//! from a named factory declared on the class and fetched with
//! `Node::get_limits`.

use std::fmt;
use std::sync::Arc;

use crate::driver::Node;
use crate::error::{DaqError, DaqResult};
use crate::unit::Unit;
use crate::value::Value;

/// Prefix of methods declaring named limits.
pub const LIMITS_PREFIX: &str = "_limits_";

/// Builds the limits identified by a name for one driver instance.
pub type LimitFactory = Arc<dyn Fn(&Node<'_>) -> DaqResult<LimitsValidator> + Send + Sync>;

/// Integer range with optional step.
#[derive(Debug, Clone, PartialEq)]
pub struct IntLimits {
    /// Smallest allowed value.
    pub minimum: Option<i64>,
    /// Largest allowed value.
    pub maximum: Option<i64>,
    /// Values must be `minimum + k * step`.
    pub step: Option<i64>,
}

/// Float range with optional step and unit.
#[derive(Debug, Clone, PartialEq)]
pub struct FloatLimits {
    /// Smallest allowed value.
    pub minimum: Option<f64>,
    /// Largest allowed value.
    pub maximum: Option<f64>,
    /// Values must be `minimum + k * step`.
    pub step: Option<f64>,
    /// Unit of the bounds.
    pub unit: Option<Unit>,
}

/// Validates numbers against a range.
#[derive(Debug, Clone, PartialEq)]
pub enum LimitsValidator {
    Int(IntLimits),
    Float(FloatLimits),
}

const FLOAT_STEP_TOLERANCE: f64 = 1e-9;

impl LimitsValidator {
    /// Integer limits. At least one bound is required.
    pub fn int(minimum: Option<i64>, maximum: Option<i64>, step: Option<i64>) -> DaqResult<Self> {
        if minimum.is_none() && maximum.is_none() {
            return Err(DaqError::Configuration(
                "limits need a minimum or a maximum".to_string(),
            ));
        }
        if step == Some(0) {
            return Err(DaqError::Configuration("limits step cannot be 0".to_string()));
        }
        if step.is_some() && minimum.is_none() {
            return Err(DaqError::Configuration(
                "stepped limits need a minimum".to_string(),
            ));
        }
        Ok(LimitsValidator::Int(IntLimits {
            minimum,
            maximum,
            step,
        }))
    }

    /// Float limits. At least one bound is required.
    pub fn float(minimum: Option<f64>, maximum: Option<f64>, step: Option<f64>) -> DaqResult<Self> {
        if minimum.is_none() && maximum.is_none() {
            return Err(DaqError::Configuration(
                "limits need a minimum or a maximum".to_string(),
            ));
        }
        if let Some(step) = step.filter(|s| !s.is_finite() || *s <= 0.0) {
            return Err(DaqError::Configuration(format!(
                "limits step must be a positive number, got {step}"
            )));
        }
        if step.is_some() && minimum.is_none() {
            return Err(DaqError::Configuration(
                "stepped limits need a minimum".to_string(),
            ));
        }
        Ok(LimitsValidator::Float(FloatLimits {
            minimum,
            maximum,
            step,
            unit: None,
        }))
    }

    /// Attach a unit to float limits so quantities are converted first.
    pub fn with_unit(self, unit: &str) -> DaqResult<Self> {
        match self {
            LimitsValidator::Float(mut limits) => {
                limits.unit = Some(Unit::parse(unit)?);
                Ok(LimitsValidator::Float(limits))
            }
            LimitsValidator::Int(_) => Err(DaqError::Configuration(
                "integer limits cannot carry a unit".to_string(),
            )),
        }
    }

    /// Lower bound as a float.
    pub fn minimum(&self) -> Option<f64> {
        match self {
            LimitsValidator::Int(l) => l.minimum.map(|v| v as f64),
            LimitsValidator::Float(l) => l.minimum,
        }
    }

    /// Upper bound as a float.
    pub fn maximum(&self) -> Option<f64> {
        match self {
            LimitsValidator::Int(l) => l.maximum.map(|v| v as f64),
            LimitsValidator::Float(l) => l.maximum,
        }
    }

    /// Whether `value` lies within the limits (and on the step grid).
    pub fn validate(&self, value: &Value) -> DaqResult<bool> {
        match self {
            LimitsValidator::Int(limits) => {
                let v = value.as_i64().ok_or_else(|| {
                    DaqError::Conversion(format!("{value} is not an integer"))
                })?;
                if limits.minimum.is_some_and(|min| v < min)
                    || limits.maximum.is_some_and(|max| v > max)
                {
                    return Ok(false);
                }
                Ok(match (limits.step, limits.minimum) {
                    (Some(step), Some(min)) => {
                        (i128::from(v) - i128::from(min)) % i128::from(step) == 0
                    }
                    _ => true,
                })
            }
            LimitsValidator::Float(limits) => {
                let v = match (value, &limits.unit) {
                    (Value::Quantity(q), Some(unit)) => q.magnitude_in(unit)?,
                    _ => value.as_f64().ok_or_else(|| {
                        DaqError::Conversion(format!("{value} is not a number"))
                    })?,
                };
                if limits.minimum.is_some_and(|min| v < min)
                    || limits.maximum.is_some_and(|max| v > max)
                {
                    return Ok(false);
                }
                Ok(match (limits.step, limits.minimum) {
                    (Some(step), Some(min)) => {
                        let ratio = (v - min) / step;
                        (ratio - ratio.round()).abs() < FLOAT_STEP_TOLERANCE
                    }
                    _ => true,
                })
            }
        }
    }
}

impl fmt::Display for LimitsValidator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let bound = |v: Option<String>| v.unwrap_or_else(|| "-".to_string());
        match self {
            LimitsValidator::Int(l) => {
                write!(
                    f,
                    "[{}, {}]",
                    bound(l.minimum.map(|v| v.to_string())),
                    bound(l.maximum.map(|v| v.to_string()))
                )?;
                if let Some(step) = l.step {
                    write!(f, " step {step}")?;
                }
                Ok(())
            }
            LimitsValidator::Float(l) => {
                write!(
                    f,
                    "[{}, {}]",
                    bound(l.minimum.map(|v| v.to_string())),
                    bound(l.maximum.map(|v| v.to_string()))
                )?;
                if let Some(step) = l.step {
                    write!(f, " step {step}")?;
                }
                if let Some(unit) = &l.unit {
                    write!(f, " {unit}")?;
                }
                Ok(())
            }
        }
    }
}

/// Error raised when a value falls outside limits.
pub fn limits_error(name: &str, value: &Value, limits: &LimitsValidator) -> DaqError {
    DaqError::OutOfLimits(format!(
        "the provided value {value} is out of bounds for {name}: {limits}"
    ))
}

/// Limits id encoded in a `_limits_<id>` method name.
pub fn limit_id_from_method(method: &str) -> DaqResult<String> {
    method
        .strip_prefix(LIMITS_PREFIX)
        .filter(|id| !id.is_empty())
        .map(str::to_string)
        .ok_or_else(|| {
            DaqError::Configuration(format!(
                "limits method '{method}' must be named {LIMITS_PREFIX}<id>"
            ))
        })
}
