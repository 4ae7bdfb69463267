//! Features: instrument properties with get/set pipelines.
//!
//! A feature is declared from a [`FeatureKwargs`] value. The kwargs are kept on
//! the built [`Feature`] so it can be rebuilt when a subclass clones it or
//! overrides some arguments with `set_feat`.
//!
//! # Example
//!
//! ```rust,ignore
//! use daq_features::features;
//!
//! let freq = features::float()
//!     .getter("?FREQ")
//!     .setter("FREQ {}")
//!     .unit("Hz")
//!     .limits((1.0, 1e6))
//!     .checks("driver.output == true");
//! ```

mod factories;
mod feature;
mod kinds;

pub use factories::{conditional, constant, Conditional, Constant, GetSetFactory};
pub use feature::{
    CheckFn, Feature, FeatureFn, FeatureLimits, FeatureStage, InspectFn, QueryFn, TransformFn,
};
pub(crate) use feature::camel_case;
pub(crate) use kinds::{enabling_get, enabling_set};

use std::fmt;
use std::sync::Arc;

use crate::limits::LimitsValidator;
use crate::value::Value;

// =============================================================================
// Declaration types
// =============================================================================

/// How a feature talks to the instrument.
#[derive(Clone)]
pub enum Command {
    /// Command template handed to the backend, e.g. `FREQ {}`.
    Text(String),
    /// The stage is provided through a customization.
    Custom,
    /// The stage is built by a factory.
    Factory(Arc<dyn GetSetFactory>),
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::Text(cmd) => f.debug_tuple("Text").field(cmd).finish(),
            Command::Custom => f.write_str("Custom"),
            Command::Factory(factory) => {
                f.debug_tuple("Factory").field(&factory.describe()).finish()
            }
        }
    }
}

impl From<&str> for Command {
    fn from(cmd: &str) -> Self {
        Command::Text(cmd.to_string())
    }
}

impl From<String> for Command {
    fn from(cmd: String) -> Self {
        Command::Text(cmd)
    }
}

impl From<Constant> for Command {
    fn from(factory: Constant) -> Self {
        Command::Factory(Arc::new(factory))
    }
}

impl From<Conditional> for Command {
    fn from(factory: Conditional) -> Self {
        Command::Factory(Arc::new(factory))
    }
}

/// Check expressions run before getting and/or setting.
#[derive(Debug, Clone, PartialEq)]
pub enum Checks {
    Both(String),
    Split {
        get: Option<String>,
        set: Option<String>,
    },
}

impl Checks {
    /// Checks run before get.
    pub fn get(&self) -> Option<&str> {
        match self {
            Checks::Both(c) => Some(c),
            Checks::Split { get, .. } => get.as_deref(),
        }
    }

    /// Checks run before set.
    pub fn set(&self) -> Option<&str> {
        match self {
            Checks::Both(c) => Some(c),
            Checks::Split { set, .. } => set.as_deref(),
        }
    }
}

/// Cached state invalidated after a successful set.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Discard {
    /// Feature paths whose cache is cleared.
    pub features: Vec<String>,
    /// Limits ids to rebuild on next use.
    pub limits: Vec<String>,
}

/// Bidirectional mapping between user values and instrument values.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Mapping {
    /// `(user value, instrument value)` pairs.
    pub pairs: Vec<(Value, Value)>,
}

impl Mapping {
    /// Instrument value for a user value.
    pub fn to_instrument(&self, value: &Value) -> Option<&Value> {
        self.pairs
            .iter()
            .find(|(user, _)| user.loose_eq(value))
            .map(|(_, inst)| inst)
    }

    /// User value for an instrument reply; replies are compared as text.
    pub fn from_instrument(&self, reply: &Value) -> Option<&Value> {
        let text = reply.to_command_text();
        let text = text.trim();
        self.pairs
            .iter()
            .find(|(_, inst)| inst.loose_eq(reply) || inst.to_command_text() == text)
            .map(|(user, _)| user)
    }

    /// User side of the mapping.
    pub fn user_values(&self) -> Vec<&Value> {
        self.pairs.iter().map(|(user, _)| user).collect()
    }
}

/// Limits declared on a feature.
#[derive(Debug, Clone, PartialEq)]
pub enum LimitsSpec {
    /// Numeric range; integer or float depending on the feature kind.
    Range {
        minimum: Option<f64>,
        maximum: Option<f64>,
        step: Option<f64>,
    },
    Validator(LimitsValidator),
    /// Limits built per instance by the class limit of that id.
    Named(String),
}

impl From<&str> for LimitsSpec {
    fn from(id: &str) -> Self {
        LimitsSpec::Named(id.to_string())
    }
}

impl From<LimitsValidator> for LimitsSpec {
    fn from(limits: LimitsValidator) -> Self {
        LimitsSpec::Validator(limits)
    }
}

impl From<(f64, f64)> for LimitsSpec {
    fn from((minimum, maximum): (f64, f64)) -> Self {
        LimitsSpec::Range {
            minimum: Some(minimum),
            maximum: Some(maximum),
            step: None,
        }
    }
}

impl From<(f64, f64, f64)> for LimitsSpec {
    fn from((minimum, maximum, step): (f64, f64, f64)) -> Self {
        LimitsSpec::Range {
            minimum: Some(minimum),
            maximum: Some(maximum),
            step: Some(step),
        }
    }
}

/// Value handling strategy of a feature.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum FeatureKind {
    /// Values are passed through untouched.
    #[default]
    Generic,
    Str,
    Int,
    Float {
        unit: Option<String>,
    },
    Bool {
        aliases: Vec<(bool, Vec<Value>)>,
    },
    Register {
        names: Vec<Option<String>>,
        length: u32,
    },
    Options {
        names: Vec<String>,
    },
    /// Forwards to another feature, `.` addressing the parent.
    Alias {
        target: String,
        settable: bool,
    },
}

// =============================================================================
// FeatureKwargs
// =============================================================================

/// Every argument a feature was declared with.
#[derive(Debug, Clone, Default)]
pub struct FeatureKwargs {
    /// Value kind.
    pub kind: FeatureKind,
    /// Command or factory used to read.
    pub getter: Option<Command>,
    /// Command or factory used to write.
    pub setter: Option<Command>,
    /// Pattern extracting the value from the reply.
    pub extract: Option<String>,
    /// Retries on retryable communication errors.
    pub retries: Option<u32>,
    /// Assertions run before get and set.
    pub checks: Option<Checks>,
    /// State discarded after a set.
    pub discard: Option<Discard>,
    /// Expression gating the feature on installed options.
    pub options: Option<String>,
    /// Allowed values.
    pub values: Vec<Value>,
    /// User to instrument value mapping.
    pub mapping: Option<Mapping>,
    /// Limits of written values.
    pub limits: Option<LimitsSpec>,
}

impl FeatureKwargs {
    /// Bare declaration of `kind`.
    pub fn new(kind: FeatureKind) -> Self {
        Self {
            kind,
            ..Self::default()
        }
    }

    /// Command or factory used to read.
    pub fn getter(mut self, cmd: impl Into<Command>) -> Self {
        self.getter = Some(cmd.into());
        self
    }

    /// Command or factory used to write.
    pub fn setter(mut self, cmd: impl Into<Command>) -> Self {
        self.setter = Some(cmd.into());
        self
    }

    /// Readable, with the `get` stage supplied by a customization.
    pub fn custom_getter(mut self) -> Self {
        self.getter = Some(Command::Custom);
        self
    }

    /// Settable, with the `set` stage supplied by a customization.
    pub fn custom_setter(mut self) -> Self {
        self.setter = Some(Command::Custom);
        self
    }

    /// Pattern extracting the value from the reply, e.g. `"VOLT {}"`.
    pub fn extract(mut self, pattern: &str) -> Self {
        self.extract = Some(pattern.to_string());
        self
    }

    /// Retry get and set this many times.
    pub fn retries(mut self, retries: u32) -> Self {
        self.retries = Some(retries);
        self
    }

    /// Checks run before both get and set.
    pub fn checks(mut self, checks: &str) -> Self {
        self.checks = Some(Checks::Both(checks.to_string()));
        self
    }

    /// Different checks for get and set.
    pub fn split_checks(mut self, get: Option<&str>, set: Option<&str>) -> Self {
        self.checks = Some(Checks::Split {
            get: get.map(str::to_string),
            set: set.map(str::to_string),
        });
        self
    }

    /// Features whose cache is cleared after a set.
    pub fn discard<S: AsRef<str>>(mut self, features: impl IntoIterator<Item = S>) -> Self {
        self.discard.get_or_insert_with(Discard::default).features =
            features.into_iter().map(|s| s.as_ref().to_string()).collect();
        self
    }

    /// Limits ids discarded after a set.
    pub fn discard_limits<S: AsRef<str>>(mut self, limits: impl IntoIterator<Item = S>) -> Self {
        self.discard.get_or_insert_with(Discard::default).limits =
            limits.into_iter().map(|s| s.as_ref().to_string()).collect();
        self
    }

    /// Only accessible while `options` holds.
    pub fn options(mut self, options: &str) -> Self {
        self.options = Some(options.to_string());
        self
    }

    /// Allowed values.
    pub fn values<V: Into<Value>>(mut self, values: impl IntoIterator<Item = V>) -> Self {
        self.values = values.into_iter().map(Into::into).collect();
        self
    }

    /// User to instrument value pairs.
    pub fn mapping<K: Into<Value>, V: Into<Value>>(
        mut self,
        pairs: impl IntoIterator<Item = (K, V)>,
    ) -> Self {
        self.mapping = Some(Mapping {
            pairs: pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        });
        self
    }

    /// A range, a validator or a limits id.
    pub fn limits(mut self, limits: impl Into<LimitsSpec>) -> Self {
        self.limits = Some(limits.into());
        self
    }

    /// Unit of a float feature.
    pub fn unit(mut self, unit: &str) -> Self {
        if let FeatureKind::Float { unit: slot } = &mut self.kind {
            *slot = Some(unit.to_string());
        }
        self
    }

    /// Extra instrument replies accepted for `true`/`false`.
    pub fn aliases<V: Into<Value>>(mut self, state: bool, aliases: impl IntoIterator<Item = V>) -> Self {
        if let FeatureKind::Bool { aliases: slot } = &mut self.kind {
            slot.push((state, aliases.into_iter().map(Into::into).collect()));
        }
        self
    }

    /// Whether the declaration can be read.
    pub fn is_readable(&self) -> bool {
        matches!(self.kind, FeatureKind::Alias { .. }) || self.getter.is_some()
    }

    /// Whether the declaration can be written.
    pub fn is_settable(&self) -> bool {
        match &self.kind {
            FeatureKind::Alias { settable, .. } => *settable,
            _ => self.setter.is_some(),
        }
    }
}

// =============================================================================
// Constructors
// =============================================================================

/// Feature passing values through untouched.
pub fn feature() -> FeatureKwargs {
    FeatureKwargs::new(FeatureKind::Generic)
}

/// Feature whose replies are strings.
pub fn string() -> FeatureKwargs {
    FeatureKwargs::new(FeatureKind::Str)
}

/// Integer feature.
pub fn int() -> FeatureKwargs {
    FeatureKwargs::new(FeatureKind::Int)
}

/// Float feature, optionally unit bearing (see [`FeatureKwargs::unit`]).
pub fn float() -> FeatureKwargs {
    FeatureKwargs::new(FeatureKind::Float { unit: None })
}

/// Boolean feature. Without a mapping `true`/`false` are sent as `1`/`0`.
pub fn boolean() -> FeatureKwargs {
    FeatureKwargs::new(FeatureKind::Bool {
        aliases: Vec::new(),
    })
}

/// Bit field feature. `names[i]` names bit `i`.
pub fn register<S: Into<String>>(names: impl IntoIterator<Item = Option<S>>, length: u32) -> FeatureKwargs {
    FeatureKwargs::new(FeatureKind::Register {
        names: names.into_iter().map(|n| n.map(Into::into)).collect(),
        length,
    })
}

/// Map of instrument options, used by `options` expressions.
pub fn options<S: Into<String>>(names: impl IntoIterator<Item = S>) -> FeatureKwargs {
    FeatureKwargs::new(FeatureKind::Options {
        names: names.into_iter().map(Into::into).collect(),
    })
}

/// Feature forwarding to another one, e.g. `.output` for the parent's output.
pub fn alias(target: &str, settable: bool) -> FeatureKwargs {
    FeatureKwargs::new(FeatureKind::Alias {
        target: target.to_string(),
        settable,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kwargs_builder() {
        let kw = float()
            .getter("?VOLT")
            .setter("VOLT {}")
            .unit("V")
            .limits((0.0, 10.0))
            .discard(["current"]);
        assert!(kw.is_readable());
        assert!(kw.is_settable());
        assert_eq!(kw.kind, FeatureKind::Float { unit: Some("V".into()) });
        assert_eq!(kw.discard.unwrap().features, vec!["current".to_string()]);
    }

    #[test]
    fn test_mapping_lookup() {
        let mapping = Mapping {
            pairs: vec![(Value::Bool(true), Value::Str("ON".into()))],
        };
        assert_eq!(
            mapping.to_instrument(&Value::Bool(true)),
            Some(&Value::Str("ON".into()))
        );
        assert_eq!(
            mapping.from_instrument(&Value::Str("ON\n".into())),
            Some(&Value::Bool(true))
        );
        assert!(mapping.from_instrument(&Value::Str("OFF".into())).is_none());
    }

    #[test]
    fn test_alias_is_readable() {
        let kw = alias(".output", false);
        assert!(kw.is_readable());
        assert!(!kw.is_settable());
    }
}
