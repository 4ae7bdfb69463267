//! Factories building the `get`/`set` stages of a feature.

use crate::checks::Expression;
use crate::driver::Node;
use crate::error::{DaqError, DaqResult};
use crate::features::{Feature, FeatureFn};
use crate::value::Value;

/// Builds the base functions of the `get` and `set` stages.
pub trait GetSetFactory: Send + Sync {
    fn build_getter(&self) -> DaqResult<FeatureFn>;

    fn build_setter(&self) -> DaqResult<FeatureFn>;

    /// Short description used in docs and debug output.
    fn describe(&self) -> String;
}

/// Makes a feature always return the same value. Getter only.
#[derive(Debug, Clone)]
pub struct Constant {
    value: Value,
}

/// Getter returning `value` without talking to the instrument.
pub fn constant(value: impl Into<Value>) -> Constant {
    Constant {
        value: value.into(),
    }
}

impl GetSetFactory for Constant {
    fn build_getter(&self) -> DaqResult<FeatureFn> {
        let value = self.value.clone();
        Ok(FeatureFn::query(move |_feat: &Feature, _driver: &Node<'_>| {
            Ok(value.clone())
        }))
    }

    fn build_setter(&self) -> DaqResult<FeatureFn> {
        Err(DaqError::Configuration(
            "a constant cannot be used as a setter".to_string(),
        ))
    }

    fn describe(&self) -> String {
        format!("constant({})", self.value)
    }
}

/// Chooses a value or a command from the driver state.
///
/// The expression may read `driver.<path>` and, when setting, `value`. With
/// `default` the result is a command passed to the backend; otherwise the
/// getter returns it directly. Setters always require `default`.
#[derive(Debug, Clone)]
pub struct Conditional {
    expression: Expression,
    default: bool,
}

/// Build a conditional factory, e.g.
/// `conditional("if(driver.fast, \"FREQ:FAST?\", \"FREQ?\")", true)`.
pub fn conditional(expression: &str, default: bool) -> DaqResult<Conditional> {
    Ok(Conditional {
        expression: Expression::parse(expression)?,
        default,
    })
}

impl GetSetFactory for Conditional {
    fn build_getter(&self) -> DaqResult<FeatureFn> {
        let expression = self.expression.clone();
        let default = self.default;
        Ok(FeatureFn::query(move |feat: &Feature, driver: &Node<'_>| {
            let selected = expression.eval(|ident| driver.resolve_identifier(ident, &[]))?;
            if default {
                let cmd = selected.to_command_text();
                driver.default_get_feature(feat, &cmd, &[])
            } else {
                Ok(selected)
            }
        }))
    }

    fn build_setter(&self) -> DaqResult<FeatureFn> {
        if !self.default {
            return Err(DaqError::Configuration(
                "a conditional setter requires default = true".to_string(),
            ));
        }
        let expression = self.expression.clone();
        Ok(FeatureFn::transform(
            move |feat: &Feature, driver: &Node<'_>, value: Value| {
                let selected = expression
                    .eval(|ident| driver.resolve_identifier(ident, &[("value", value.clone())]))?;
                driver.default_set_feature(feat, &selected.to_command_text(), &[value])
            },
        ))
    }

    fn describe(&self) -> String {
        format!("conditional({})", self.expression.text())
    }
}
