//! Actions: instrument methods with a `pre_call -> call -> post_call` pipeline.
//!
//! # Example
//!
//! ```rust,ignore
//! use daq_features::actions;
//!
//! let ramp = actions::action(["target", "rate"], |driver, args| {
//!     driver.backend().write(&format!("RAMP {},{}", args.value("target")?, args.value("rate")?))
//! })
//! .limits("rate", (0.0, 10.0))
//! .units(["V"], [Some("V"), Some("V")])
//! .lock();
//! ```

mod action;
mod args;

pub use action::{Action, ActionFn, ActionStage, FinishFn, InvokeFn, PrepareFn};
pub(crate) use action::enabling_call;
pub use args::{Args, BoundArgs, Param, Signature};

use std::fmt;
use std::sync::Arc;

use crate::driver::Node;
use crate::error::DaqResult;
use crate::features::LimitsSpec;
use crate::value::Value;

/// User function run by the `call` stage.
pub type CallFn = Arc<dyn Fn(&Node<'_>, &BoundArgs) -> DaqResult<Value> + Send + Sync>;

/// Units of the return value(s) and of each parameter.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ActionUnits {
    /// One unit per returned value; several units mean a list is returned.
    pub returns: Vec<Option<String>>,
    /// One entry per parameter, in declaration order.
    pub params: Vec<Option<String>>,
}

/// Every argument an action was declared with.
#[derive(Clone, Default)]
pub struct ActionKwargs {
    /// Declared parameters.
    pub params: Vec<Param>,
    /// Body of the `call` stage.
    pub func: Option<CallFn>,
    /// Assertions evaluated before the call.
    pub checks: Option<String>,
    /// Allowed values per parameter.
    pub values: Vec<(String, Vec<Value>)>,
    /// Limits per parameter.
    pub limits: Vec<(String, LimitsSpec)>,
    /// Return and parameter units.
    pub units: Option<ActionUnits>,
    /// Expression gating the action on installed options.
    pub options: Option<String>,
    /// Whether the call holds the driver lock.
    pub lock: bool,
    /// Retries on retryable communication errors.
    pub retries: Option<u32>,
    /// Bit names and length of a register result.
    pub register: Option<(Vec<Option<String>>, u32)>,
}

impl ActionKwargs {
    /// Optional parameter with a default value.
    pub fn param_default(mut self, name: &str, default: impl Into<Value>) -> Self {
        match self.params.iter_mut().find(|p| p.name == name) {
            Some(param) => param.default = Some(default.into()),
            None => self.params.push(Param::with_default(name, default)),
        }
        self
    }

    /// Assertions over the driver and the arguments, separated by `;`.
    pub fn checks(mut self, checks: &str) -> Self {
        self.checks = Some(checks.to_string());
        self
    }

    /// Allowed values of one parameter.
    pub fn values<V: Into<Value>>(mut self, param: &str, values: impl IntoIterator<Item = V>) -> Self {
        self.values
            .push((param.to_string(), values.into_iter().map(Into::into).collect()));
        self
    }

    /// Limits of one parameter: a range, a validator or a limits id.
    pub fn limits(mut self, param: &str, limits: impl Into<LimitsSpec>) -> Self {
        self.limits.push((param.to_string(), limits.into()));
        self
    }

    /// Units of the results and of the parameters, in signature order.
    pub fn units<R, P>(
        mut self,
        returns: impl IntoIterator<Item = R>,
        params: impl IntoIterator<Item = Option<P>>,
    ) -> Self
    where
        R: Into<String>,
        P: Into<String>,
    {
        self.units = Some(ActionUnits {
            returns: returns.into_iter().map(|r| Some(r.into())).collect(),
            params: params.into_iter().map(|p| p.map(Into::into)).collect(),
        });
        self
    }

    /// Only callable while `options` holds.
    pub fn options(mut self, options: &str) -> Self {
        self.options = Some(options.to_string());
        self
    }

    /// Hold the driver lock for the whole call.
    pub fn lock(mut self) -> Self {
        self.lock = true;
        self
    }

    /// Retry the call this many times.
    pub fn retries(mut self, retries: u32) -> Self {
        self.retries = Some(retries);
        self
    }
}

impl fmt::Debug for ActionKwargs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActionKwargs")
            .field("params", &self.params)
            .field("checks", &self.checks)
            .field("values", &self.values)
            .field("limits", &self.limits)
            .field("units", &self.units)
            .field("options", &self.options)
            .field("lock", &self.lock)
            .field("retries", &self.retries)
            .field("register", &self.register)
            .finish()
    }
}

/// Declare an action calling `func` with the bound arguments.
pub fn action<S: AsRef<str>>(
    params: impl IntoIterator<Item = S>,
    func: impl Fn(&Node<'_>, &BoundArgs) -> DaqResult<Value> + Send + Sync + 'static,
) -> ActionKwargs {
    ActionKwargs {
        params: params.into_iter().map(|p| Param::new(p.as_ref())).collect(),
        func: Some(Arc::new(func)),
        ..ActionKwargs::default()
    }
}

/// Action whose integer result is decoded into named bit flags.
pub fn register_action<S: AsRef<str>, N: Into<String>>(
    names: impl IntoIterator<Item = Option<N>>,
    length: u32,
    params: impl IntoIterator<Item = S>,
    func: impl Fn(&Node<'_>, &BoundArgs) -> DaqResult<Value> + Send + Sync + 'static,
) -> ActionKwargs {
    let mut kwargs = action(params, func);
    kwargs.register = Some((names.into_iter().map(|n| n.map(Into::into)).collect(), length));
    kwargs
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_action_kwargs_builder() {
        let kw = action(["a", "b"], |_, _| Ok(Value::None))
            .param_default("b", 2)
            .values("a", [1, 2, 3])
            .lock()
            .retries(2);
        assert_eq!(kw.params.len(), 2);
        assert_eq!(kw.params[1].default, Some(Value::Int(2)));
        assert!(kw.lock);
        assert_eq!(kw.retries, Some(2));
        assert_eq!(kw.values[0].1.len(), 3);
    }
}
