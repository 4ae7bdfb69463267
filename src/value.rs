//! Dynamic values flowing through feature and action pipelines.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{DaqError, DaqResult};
use crate::unit::{Quantity, Unit};

/// A value read from or written to an instrument.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub enum Value {
    #[default]
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Quantity(Quantity),
    List(Vec<Value>),
    Map(BTreeMap<String, Value>),
    Register(RegisterValue),
}

impl Value {
    /// Whether this is `Value::None`.
    pub fn is_none(&self) -> bool {
        matches!(self, Value::None)
    }

    /// Boolean view.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Integer view; integral floats and registers convert.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            Value::Bool(b) => Some(i64::from(*b)),
            Value::Float(f) if f.fract() == 0.0 => Some(*f as i64),
            Value::Register(r) => i64::try_from(r.bits).ok(),
            _ => None,
        }
    }

    /// Numeric view; quantities yield their bare magnitude.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(i) => Some(*i as f64),
            Value::Float(f) => Some(*f),
            Value::Quantity(q) => Some(q.magnitude),
            _ => None,
        }
    }

    /// String view.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Quantity view.
    pub fn as_quantity(&self) -> Option<&Quantity> {
        match self {
            Value::Quantity(q) => Some(q),
            _ => None,
        }
    }

    /// Map view.
    pub fn as_map(&self) -> Option<&BTreeMap<String, Value>> {
        match self {
            Value::Map(m) => Some(m),
            _ => None,
        }
    }

    /// Equality used for caching and membership tests.
    ///
    /// Numbers compare numerically regardless of representation and
    /// quantities compare after unit conversion.
    pub fn loose_eq(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Quantity(a), Value::Quantity(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Int(_) | Value::Float(_), Value::Int(_) | Value::Float(_)) => {
                match (self.as_f64(), other.as_f64()) {
                    (Some(a), Some(b)) => a == b,
                    _ => false,
                }
            }
            (Value::List(a), Value::List(b)) => {
                a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.loose_eq(y))
            }
            (Value::Register(a), Value::Register(b)) => a.bits == b.bits,
            _ => self == other,
        }
    }

    /// Text sent to an instrument: strings are not quoted.
    pub fn to_command_text(&self) -> String {
        match self {
            Value::Str(s) => s.clone(),
            Value::Bool(b) => u8::from(*b).to_string(),
            Value::Quantity(q) => q.magnitude.to_string(),
            Value::Register(r) => r.bits.to_string(),
            other => other.to_string(),
        }
    }

    /// Attach a unit to a numeric value.
    pub fn with_unit(&self, unit: &Unit) -> DaqResult<Value> {
        match self {
            Value::Quantity(q) => Ok(Value::Quantity(q.to(unit)?)),
            other => other
                .as_f64()
                .map(|m| Value::Quantity(Quantity::new(m, unit.clone())))
                .ok_or_else(|| DaqError::Unit(format!("cannot attach {unit} to {other}"))),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::None => f.write_str("None"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Int(i) => write!(f, "{i}"),
            Value::Float(x) => write!(f, "{x}"),
            Value::Str(s) => write!(f, "'{s}'"),
            Value::Quantity(q) => write!(f, "{q}"),
            Value::List(items) => {
                f.write_str("[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{item}")?;
                }
                f.write_str("]")
            }
            Value::Map(map) => {
                f.write_str("{")?;
                for (i, (k, v)) in map.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{k}: {v}")?;
                }
                f.write_str("}")
            }
            Value::Register(r) => write!(f, "{r}"),
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(i64::from(v))
    }
}

impl From<u32> for Value {
    fn from(v: u32) -> Self {
        Value::Int(i64::from(v))
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Str(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Str(v)
    }
}

impl From<Quantity> for Value {
    fn from(v: Quantity) -> Self {
        Value::Quantity(v)
    }
}

impl From<RegisterValue> for Value {
    fn from(v: RegisterValue) -> Self {
        Value::Register(v)
    }
}

impl<T: Into<Value>> From<Vec<T>> for Value {
    fn from(v: Vec<T>) -> Self {
        Value::List(v.into_iter().map(Into::into).collect())
    }
}

/// Identifier of one channel instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ChannelId {
    Int(i64),
    Str(String),
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelId::Int(i) => write!(f, "{i}"),
            ChannelId::Str(s) => f.write_str(s),
        }
    }
}

impl From<i64> for ChannelId {
    fn from(v: i64) -> Self {
        ChannelId::Int(v)
    }
}

impl From<i32> for ChannelId {
    fn from(v: i32) -> Self {
        ChannelId::Int(i64::from(v))
    }
}

impl From<&str> for ChannelId {
    fn from(v: &str) -> Self {
        ChannelId::Str(v.to_string())
    }
}

impl From<String> for ChannelId {
    fn from(v: String) -> Self {
        ChannelId::Str(v)
    }
}

impl From<ChannelId> for Value {
    fn from(id: ChannelId) -> Self {
        match id {
            ChannelId::Int(i) => Value::Int(i),
            ChannelId::Str(s) => Value::Str(s),
        }
    }
}

impl TryFrom<&Value> for ChannelId {
    type Error = DaqError;

    fn try_from(value: &Value) -> DaqResult<Self> {
        match value {
            Value::Int(i) => Ok(ChannelId::Int(*i)),
            Value::Str(s) => Ok(ChannelId::Str(s.clone())),
            other => Err(DaqError::Conversion(format!(
                "{other} cannot be used as a channel id"
            ))),
        }
    }
}

/// Integer value decomposed into named bit flags.
///
/// `names[i]` names bit `i`; unnamed bits are reported as `BIT_i`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegisterValue {
    /// Flag type name, e.g. `"StatusFlags"`.
    pub type_name: String,
    /// Raw bits.
    pub bits: u64,
    /// Bit names, index `i` naming bit `i`.
    pub names: Vec<String>,
}

impl RegisterValue {
    /// Build flag names for a register of `length` bits.
    pub fn flag_names(names: &[Option<String>], length: u32) -> Vec<String> {
        (0..length as usize)
            .map(|i| match names.get(i) {
                Some(Some(name)) => name.clone(),
                _ => format!("BIT_{i}"),
            })
            .collect()
    }

    pub fn new(type_name: impl Into<String>, bits: u64, names: Vec<String>) -> Self {
        Self {
            type_name: type_name.into(),
            bits,
            names,
        }
    }

    /// Whether the flag called `name` is set.
    pub fn is_set(&self, name: &str) -> bool {
        self.names
            .iter()
            .position(|n| n == name)
            .map(|i| self.bits & (1 << i) != 0)
            .unwrap_or(false)
    }

    /// Names of all set flags, lowest bit first.
    pub fn active(&self) -> Vec<&str> {
        self.names
            .iter()
            .enumerate()
            .filter(|(i, _)| self.bits & (1 << i) != 0)
            .map(|(_, n)| n.as_str())
            .collect()
    }

    /// Build the integer from a map of flag name to state.
    pub fn from_flags(
        type_name: impl Into<String>,
        names: Vec<String>,
        flags: &BTreeMap<String, Value>,
    ) -> DaqResult<Self> {
        let mut bits = 0u64;
        for (flag, state) in flags {
            let index = names.iter().position(|n| n == flag).ok_or_else(|| {
                DaqError::Conversion(format!("unknown register flag '{flag}'"))
            })?;
            if state.as_bool().unwrap_or(false) {
                bits |= 1 << index;
            }
        }
        Ok(Self::new(type_name, bits, names))
    }
}

impl fmt::Display for RegisterValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.type_name, self.active().join("|"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_value_serde() {
        let value = Value::Map(
            [
                ("range".to_string(), Value::Int(2)),
                ("mode".to_string(), Value::List(vec![Value::Str("AC".into()), Value::None])),
            ]
            .into_iter()
            .collect(),
        );
        let json = serde_json::to_string(&value).unwrap();
        assert_eq!(serde_json::from_str::<Value>(&json).unwrap(), value);
        assert_eq!(serde_json::to_string(&ChannelId::Int(1)).unwrap(), r#"{"Int":1}"#);
    }

    #[test]
    fn test_loose_equality() {
        assert!(Value::Int(10).loose_eq(&Value::Float(10.0)));
        assert!(!Value::Int(10).loose_eq(&Value::Str("10".into())));
        let a = Value::Quantity(Quantity::parse(1.0, "V").unwrap());
        let b = Value::Quantity(Quantity::parse(1000.0, "mV").unwrap());
        assert!(a.loose_eq(&b));
    }

    #[test]
    fn test_register_flags() {
        let names = RegisterValue::flag_names(&[Some("ready".into()), None], 3);
        assert_eq!(names, vec!["ready", "BIT_1", "BIT_2"]);
        let reg = RegisterValue::new("StatusFlags", 0b101, names);
        assert!(reg.is_set("ready"));
        assert!(!reg.is_set("BIT_1"));
        assert_eq!(reg.active(), vec!["ready", "BIT_2"]);
        assert_eq!(reg.to_string(), "StatusFlags(ready|BIT_2)");
        assert_eq!(Value::Register(reg).as_i64(), Some(5));
        let high = RegisterValue::new("StatusFlags", u64::MAX, Vec::new());
        assert_eq!(Value::Register(high).as_i64(), None);
    }

    #[test]
    fn test_command_text() {
        assert_eq!(Value::Str("ON".into()).to_command_text(), "ON");
        assert_eq!(Value::Float(10.5).to_command_text(), "10.5");
        assert_eq!(Value::Bool(true).to_command_text(), "1");
    }
}
