//! Call arguments and their binding to an action signature.

use std::fmt;

use crate::error::{DaqError, DaqResult};
use crate::value::Value;

/// One declared action parameter.
#[derive(Debug, Clone, PartialEq)]
pub struct Param {
    /// Parameter name.
    pub name: String,
    /// Value used when the caller omits the argument.
    pub default: Option<Value>,
}

impl Param {
    /// Required parameter.
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            default: None,
        }
    }

    /// Optional parameter.
    pub fn with_default(name: &str, default: impl Into<Value>) -> Self {
        Self {
            name: name.to_string(),
            default: Some(default.into()),
        }
    }
}

/// Arguments as given by the caller.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Args {
    /// Arguments given by position.
    pub positional: Vec<Value>,
    /// Arguments given by name.
    pub keywords: Vec<(String, Value)>,
}

impl Args {
    /// No arguments.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a positional argument.
    pub fn arg(mut self, value: impl Into<Value>) -> Self {
        self.positional.push(value.into());
        self
    }

    /// Add a keyword argument.
    pub fn kwarg(mut self, name: &str, value: impl Into<Value>) -> Self {
        self.keywords.push((name.to_string(), value.into()));
        self
    }
}

impl<V: Into<Value>> FromIterator<V> for Args {
    fn from_iter<I: IntoIterator<Item = V>>(iter: I) -> Self {
        Self {
            positional: iter.into_iter().map(Into::into).collect(),
            keywords: Vec::new(),
        }
    }
}

impl fmt::Display for Args {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self
            .positional
            .iter()
            .map(Value::to_string)
            .chain(self.keywords.iter().map(|(k, v)| format!("{k}={v}")))
            .collect();
        write!(f, "({})", parts.join(", "))
    }
}

/// Arguments bound to parameter names, in declaration order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BoundArgs {
    entries: Vec<(String, Value)>,
}

impl BoundArgs {
    /// Bound value of `name`.
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.entries.iter().find(|(n, _)| n == name).map(|(_, v)| v)
    }

    /// Value of a parameter, failing for unknown names.
    pub fn value(&self, name: &str) -> DaqResult<&Value> {
        self.get(name).ok_or_else(|| DaqError::InvalidArguments {
            action: String::new(),
            detail: format!("no argument named '{name}'"),
        })
    }

    /// Overwrite the bound value of `name`.
    pub fn set(&mut self, name: &str, value: Value) {
        match self.entries.iter_mut().find(|(n, _)| n == name) {
            Some((_, slot)) => *slot = value,
            None => self.entries.push((name.to_string(), value)),
        }
    }

    /// Bound arguments in signature order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.entries.iter().map(|(n, v)| (n.as_str(), v))
    }

    /// Bound values in signature order.
    pub fn values(&self) -> Vec<Value> {
        self.entries.iter().map(|(_, v)| v.clone()).collect()
    }

    /// Number of bound arguments.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing is bound.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// `(name, value)` pairs usable as expression locals.
    pub fn locals(&self) -> Vec<(&str, Value)> {
        self.entries
            .iter()
            .map(|(n, v)| (n.as_str(), v.clone()))
            .collect()
    }
}

impl fmt::Display for BoundArgs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.entries.iter().map(|(k, v)| format!("{k}={v}")).collect();
        write!(f, "({})", parts.join(", "))
    }
}

/// Ordered parameter list of an action.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Signature {
    params: Vec<Param>,
}

impl Signature {
    /// Signature over `params`; names must be unique.
    pub fn new(params: Vec<Param>) -> DaqResult<Self> {
        for (i, param) in params.iter().enumerate() {
            if params[..i].iter().any(|p| p.name == param.name) {
                return Err(DaqError::Configuration(format!(
                    "parameter '{}' is declared twice",
                    param.name
                )));
            }
        }
        Ok(Self { params })
    }

    /// Declared parameters.
    pub fn params(&self) -> &[Param] {
        &self.params
    }

    /// Whether a parameter is named `name`.
    pub fn contains(&self, name: &str) -> bool {
        self.params.iter().any(|p| p.name == name)
    }

    /// Bind call arguments, filling defaults.
    pub fn bind(&self, action: &str, args: &Args) -> DaqResult<BoundArgs> {
        let error = |detail: String| DaqError::InvalidArguments {
            action: action.to_string(),
            detail,
        };
        if args.positional.len() > self.params.len() {
            return Err(error(format!(
                "takes {} arguments but {} were given",
                self.params.len(),
                args.positional.len()
            )));
        }
        let mut slots: Vec<Option<Value>> = args
            .positional
            .iter()
            .cloned()
            .map(Some)
            .chain(std::iter::repeat(None))
            .take(self.params.len())
            .collect();
        for (name, value) in &args.keywords {
            let index = self
                .params
                .iter()
                .position(|p| p.name == *name)
                .ok_or_else(|| error(format!("unexpected keyword argument '{name}'")))?;
            if slots[index].is_some() {
                return Err(error(format!("got multiple values for argument '{name}'")));
            }
            slots[index] = Some(value.clone());
        }
        let entries = self
            .params
            .iter()
            .zip(slots)
            .map(|(param, slot)| {
                slot.or_else(|| param.default.clone())
                    .map(|value| (param.name.clone(), value))
                    .ok_or_else(|| error(format!("missing required argument '{}'", param.name)))
            })
            .collect::<DaqResult<Vec<_>>>()?;
        Ok(BoundArgs { entries })
    }
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self
            .params
            .iter()
            .map(|p| match &p.default {
                Some(default) => format!("{}={default}", p.name),
                None => p.name.clone(),
            })
            .collect();
        write!(f, "(driver, {})", parts.join(", "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn signature() -> Signature {
        Signature::new(vec![Param::new("a"), Param::with_default("b", 2)]).unwrap()
    }

    #[test]
    fn test_bind_positional_and_keywords() {
        let bound = signature().bind("ramp", &Args::new().arg(1).kwarg("b", 5)).unwrap();
        assert_eq!(bound.get("a"), Some(&Value::Int(1)));
        assert_eq!(bound.get("b"), Some(&Value::Int(5)));
        assert_eq!(bound.to_string(), "(a=1, b=5)");
    }

    #[test]
    fn test_bind_fills_defaults() {
        let bound = signature().bind("ramp", &Args::new().kwarg("a", 1)).unwrap();
        assert_eq!(bound.values(), vec![Value::Int(1), Value::Int(2)]);
    }

    #[test]
    fn test_bind_errors() {
        let sig = signature();
        assert!(sig.bind("ramp", &Args::new()).is_err());
        assert!(sig.bind("ramp", &[1, 2, 3].into_iter().collect()).is_err());
        assert!(sig.bind("ramp", &Args::new().arg(1).kwarg("a", 2)).is_err());
        assert!(sig.bind("ramp", &Args::new().arg(1).kwarg("c", 2)).is_err());
    }

    #[test]
    fn test_duplicate_parameter() {
        assert!(Signature::new(vec![Param::new("a"), Param::new("a")]).is_err());
    }
}
