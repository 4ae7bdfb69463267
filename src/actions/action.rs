//! The `Action` descriptor and its call pipeline.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use tracing::debug;

use crate::actions::{ActionKwargs, Args, BoundArgs, Signature};
use crate::checks::Checker;
use crate::composition::{Customs, Slot, Specifier, SupportMethodCustomization};
use crate::config::DriverConfig;
use crate::driver::Node;
use crate::error::{DaqError, DaqResult};
use crate::features::{camel_case, LimitsSpec};
use crate::limits::{limits_error, LimitsValidator};
use crate::unit::Unit;
use crate::value::{RegisterValue, Value};

/// `pre_call` fragment: receives and returns the bound arguments.
pub type PrepareFn =
    Arc<dyn Fn(&Action, &Node<'_>, BoundArgs) -> DaqResult<BoundArgs> + Send + Sync>;
/// `call` function.
pub type InvokeFn = Arc<dyn Fn(&Action, &Node<'_>, &BoundArgs) -> DaqResult<Value> + Send + Sync>;
/// `post_call` fragment: receives and returns the result.
pub type FinishFn =
    Arc<dyn Fn(&Action, &Node<'_>, Value, &BoundArgs) -> DaqResult<Value> + Send + Sync>;

/// A function usable in one of the action stages.
#[derive(Clone)]
pub enum ActionFn {
    /// Runs in `pre_call`; may rewrite the bound arguments.
    Prepare(PrepareFn),
    /// Runs in `call`; produces the result.
    Invoke(InvokeFn),
    /// Runs in `post_call`; may rewrite the result.
    Finish(FinishFn),
}

impl ActionFn {
    /// Wrap a `pre_call` function.
    pub fn prepare(
        f: impl Fn(&Action, &Node<'_>, BoundArgs) -> DaqResult<BoundArgs> + Send + Sync + 'static,
    ) -> Self {
        ActionFn::Prepare(Arc::new(f))
    }

    /// Wrap a `call` function.
    pub fn invoke(
        f: impl Fn(&Action, &Node<'_>, &BoundArgs) -> DaqResult<Value> + Send + Sync + 'static,
    ) -> Self {
        ActionFn::Invoke(Arc::new(f))
    }

    /// Wrap a `post_call` function.
    pub fn finish(
        f: impl Fn(&Action, &Node<'_>, Value, &BoundArgs) -> DaqResult<Value> + Send + Sync + 'static,
    ) -> Self {
        ActionFn::Finish(Arc::new(f))
    }

    fn shape(&self) -> &'static str {
        match self {
            ActionFn::Prepare(_) => "prepare",
            ActionFn::Invoke(_) => "invoke",
            ActionFn::Finish(_) => "finish",
        }
    }
}

impl fmt::Debug for ActionFn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ActionFn::{}", self.shape())
    }
}

/// Pipeline stages of an action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActionStage {
    /// Argument checks and conversions.
    PreCall,
    /// The call itself, retried on retryable errors.
    Call,
    /// Result conversions.
    PostCall,
}

impl ActionStage {
    /// Stages in pipeline order.
    pub const ALL: [ActionStage; 3] = [ActionStage::PreCall, ActionStage::Call, ActionStage::PostCall];

    /// Name used by customizers, e.g. `"pre_call"`.
    pub fn name(self) -> &'static str {
        match self {
            ActionStage::PreCall => "pre_call",
            ActionStage::Call => "call",
            ActionStage::PostCall => "post_call",
        }
    }

    fn chain_on(self) -> &'static [&'static str] {
        match self {
            ActionStage::PreCall => &["args"],
            ActionStage::Call => &[],
            ActionStage::PostCall => &["result"],
        }
    }

    fn expected(self) -> &'static str {
        match self {
            ActionStage::PreCall => "prepare (action, driver, args) -> args",
            ActionStage::Call => "invoke (action, driver, args) -> result",
            ActionStage::PostCall => "finish (action, driver, result, args) -> result",
        }
    }

    fn accepts(self, func: &ActionFn) -> bool {
        matches!(
            (self, func),
            (ActionStage::PreCall, ActionFn::Prepare(_))
                | (ActionStage::Call, ActionFn::Invoke(_))
                | (ActionStage::PostCall, ActionFn::Finish(_))
        )
    }
}

impl fmt::Display for ActionStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ActionStage {
    type Err = DaqError;

    fn from_str(s: &str) -> DaqResult<Self> {
        ActionStage::ALL
            .into_iter()
            .find(|stage| stage.name() == s)
            .ok_or_else(|| DaqError::InvalidSpecifier(format!("unknown action stage '{s}'")))
    }
}

/// Validator attached to one parameter.
#[derive(Debug, Clone)]
enum ParamCheck {
    Values(Vec<Value>),
    Limits(Arc<LimitsValidator>),
    NamedLimits(String),
}

/// One instrument method.
pub struct Action {
    name: String,
    raw_doc: Option<String>,
    doc: String,
    kwargs: ActionKwargs,
    signature: Signature,
    pre_call: Slot<ActionFn>,
    call: Slot<ActionFn>,
    post_call: Slot<ActionFn>,
    customs: Customs<ActionStage, ActionFn>,
    checks: Option<Checker>,
    options: Option<Checker>,
    param_checks: Vec<(String, ParamCheck)>,
    param_units: Vec<(String, Unit)>,
    return_units: Vec<Option<Unit>>,
    register_names: Vec<String>,
}

impl Action {
    /// Build the action named `name` and install its validation fragments.
    pub fn new(name: &str, kwargs: ActionKwargs) -> DaqResult<Self> {
        let signature = Signature::new(kwargs.params.clone())?;
        let checks = kwargs.checks.as_deref().map(Checker::parse).transpose()?;
        let options = kwargs.options.as_deref().map(Checker::parse).transpose()?;
        let param_checks = build_param_checks(name, &signature, &kwargs)?;

        let (param_units, return_units) = match &kwargs.units {
            Some(units) => {
                if units.params.len() != signature.params().len() {
                    return Err(DaqError::Configuration(format!(
                        "{name} declares {} parameter units for {} parameters",
                        units.params.len(),
                        signature.params().len()
                    )));
                }
                let params = signature
                    .params()
                    .iter()
                    .zip(&units.params)
                    .filter_map(|(param, unit)| {
                        unit.as_deref()
                            .map(|u| Unit::parse(u).map(|u| (param.name.clone(), u)))
                    })
                    .collect::<DaqResult<Vec<_>>>()?;
                let returns = units
                    .returns
                    .iter()
                    .map(|u| u.as_deref().map(Unit::parse).transpose())
                    .collect::<DaqResult<Vec<_>>>()?;
                (params, returns)
            }
            None => (Vec::new(), Vec::new()),
        };

        let register_names = match &kwargs.register {
            Some((names, length)) => {
                if names.len() > *length as usize || *length > 64 {
                    return Err(DaqError::Configuration(format!(
                        "{name}: register of length {length} cannot hold {} names",
                        names.len()
                    )));
                }
                RegisterValue::flag_names(names, *length)
            }
            None => Vec::new(),
        };

        let call = match &kwargs.func {
            Some(func) => {
                let func = func.clone();
                ActionFn::invoke(move |_, driver, args| func(driver, args))
            }
            None => ActionFn::invoke(|action: &Action, _: &Node<'_>, _: &BoundArgs| {
                Err(DaqError::Configuration(format!(
                    "{} has no function and its call stage was not customized",
                    action.name
                )))
            }),
        };

        let mut action = Self {
            name: name.to_string(),
            raw_doc: None,
            doc: String::new(),
            signature,
            pre_call: Slot::trivial(ActionFn::prepare(|_, _, args| Ok(args))),
            call: Slot::base(call),
            post_call: Slot::trivial(ActionFn::finish(|_, _, result, _| Ok(result))),
            customs: Customs::default(),
            checks,
            options,
            param_checks,
            param_units,
            return_units,
            register_names,
            kwargs,
        };
        action.install_internal_fragments()?;
        Ok(action)
    }

    fn install_internal_fragments(&mut self) -> DaqResult<()> {
        use ActionStage::*;

        if !self.param_units.is_empty() {
            self.internal(PreCall, ActionFn::prepare(strip_units), Specifier::Prepend, "units")?;
        }
        if self.checks.is_some() {
            self.internal(PreCall, ActionFn::prepare(run_checks), Specifier::Append, "checks")?;
        }
        if !self.param_checks.is_empty() {
            self.internal(PreCall, ActionFn::prepare(validate_args), Specifier::Append, "validate")?;
        }
        if !self.return_units.is_empty() {
            self.internal(PostCall, ActionFn::finish(attach_units), Specifier::Append, "units")?;
        }
        if self.kwargs.register.is_some() {
            self.internal(PostCall, ActionFn::finish(to_register), Specifier::Append, "register")?;
        }
        Ok(())
    }

    fn internal(&mut self, stage: ActionStage, func: ActionFn, spec: Specifier, id: &str) -> DaqResult<()> {
        self.modify_behavior(stage, Some(func), spec, id, true)
    }

    /// Attribute name in the owning class.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Composed documentation.
    pub fn doc(&self) -> &str {
        &self.doc
    }

    /// Declaration the action was built from.
    pub fn kwargs(&self) -> &ActionKwargs {
        &self.kwargs
    }

    pub fn signature(&self) -> &Signature {
        &self.signature
    }

    /// Expression gating the call on installed options.
    pub fn options_checker(&self) -> Option<&Checker> {
        self.options.as_ref()
    }

    /// Current content of one stage.
    pub fn stage(&self, stage: ActionStage) -> &Slot<ActionFn> {
        match stage {
            ActionStage::PreCall => &self.pre_call,
            ActionStage::Call => &self.call,
            ActionStage::PostCall => &self.post_call,
        }
    }

    fn stage_mut(&mut self, stage: ActionStage) -> &mut Slot<ActionFn> {
        match stage {
            ActionStage::PreCall => &mut self.pre_call,
            ActionStage::Call => &mut self.call,
            ActionStage::PostCall => &mut self.post_call,
        }
    }

    /// Name of the bit flag type produced by a register action.
    pub fn register_type_name(&self) -> String {
        format!("{}Flags", camel_case(&self.name))
    }

    /// Run the action. Every failure is wrapped in `FailedCall`.
    pub fn call(&self, driver: &Node<'_>, args: Args) -> DaqResult<Value> {
        self.invoke(driver, &args).map_err(|source| DaqError::FailedCall {
            action: self.name.clone(),
            args: args.to_string(),
            source: Box::new(source),
        })
    }

    fn invoke(&self, driver: &Node<'_>, args: &Args) -> DaqResult<Value> {
        let _guard = self.kwargs.lock.then(|| driver.lock());
        let bound = self.signature.bind(&self.name, args)?;
        let bound = self
            .pre_call
            .fragments()
            .try_fold(bound, |bound, fragment| match fragment {
                ActionFn::Prepare(f) => f(self, driver, bound),
                other => Err(self.mismatch(ActionStage::PreCall, other)),
            })?;

        let retries = self
            .kwargs
            .retries
            .unwrap_or_else(|| driver.config().default_retries);
        let result = driver.with_retries(retries, &self.name, || match self.call.fragments().next() {
            Some(ActionFn::Invoke(f)) => f(self, driver, &bound),
            Some(other) => Err(self.mismatch(ActionStage::Call, other)),
            None => Err(DaqError::Configuration(format!("{} has an empty call stage", self.name))),
        })?;
        debug!(action = %self.name, args = %bound, %result, "action called");

        self.post_call
            .fragments()
            .try_fold(result, |result, fragment| match fragment {
                ActionFn::Finish(f) => f(self, driver, result, &bound),
                other => Err(self.mismatch(ActionStage::PostCall, other)),
            })
    }

    fn mismatch(&self, stage: ActionStage, func: &ActionFn) -> DaqError {
        DaqError::SignatureMismatch {
            stage: format!("{}.{stage}", self.name),
            expected: format!("{}, got {}", stage.expected(), func.shape()),
        }
    }

    /// Settings created for every driver instance.
    pub fn default_settings(&self, config: &DriverConfig) -> BTreeMap<String, Value> {
        let mut settings = BTreeMap::new();
        if !self.return_units.is_empty() {
            settings.insert("unit_return".to_string(), Value::Bool(config.unit_return));
        }
        settings
    }

    /// Independent copy rebuilt from kwargs with the recorded edits replayed.
    pub fn clone_action(&self) -> DaqResult<Action> {
        self.customize(|_| {})
    }

    /// Rebuild with patched kwargs, keeping name, doc and recorded edits.
    pub fn customize(&self, patch: impl FnOnce(&mut ActionKwargs)) -> DaqResult<Action> {
        let mut kwargs = self.kwargs.clone();
        patch(&mut kwargs);
        let mut action = Action::new(&self.name, kwargs)?;
        action.raw_doc = self.raw_doc.clone();
        action.doc = self.doc.clone();
        action.copy_custom_behaviors(self)?;
        Ok(action)
    }

    /// Compose the documentation from the user text and the declaration.
    pub fn make_doc(&mut self, doc: Option<&str>) {
        if let Some(doc) = doc {
            self.raw_doc = Some(doc.trim().to_string());
        }
        let mut sections: Vec<String> = self.raw_doc.iter().cloned().collect();
        let mut notes = vec![format!("Signature: {}{}.", self.name, self.signature)];
        for (param, check) in &self.param_checks {
            match check {
                ParamCheck::Values(values) => {
                    let values: Vec<String> = values.iter().map(Value::to_string).collect();
                    notes.push(format!("{param} must be one of: {}.", values.join(", ")));
                }
                ParamCheck::Limits(limits) => notes.push(format!("{param} limits: {limits}.")),
                ParamCheck::NamedLimits(id) => {
                    notes.push(format!("{param} limits: driver limits '{id}'."))
                }
            }
        }
        if let Some(checks) = &self.checks {
            notes.push(format!("Checked before calling: {}.", checks.source()));
        }
        if let Some(options) = &self.options {
            notes.push(format!("Available when: {}.", options.source()));
        }
        sections.push(notes.join("\n"));
        self.doc = sections.join("\n\n");
    }
}

impl fmt::Debug for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Action")
            .field("name", &self.name)
            .field("signature", &self.signature)
            .field("pre_call", &self.pre_call)
            .field("post_call", &self.post_call)
            .field("customs", &self.customs)
            .finish()
    }
}

impl SupportMethodCustomization for Action {
    type Stage = ActionStage;
    type Func = ActionFn;

    fn customs(&self) -> &Customs<ActionStage, ActionFn> {
        &self.customs
    }

    fn customs_mut(&mut self) -> &mut Customs<ActionStage, ActionFn> {
        &mut self.customs
    }

    fn stage_names(&self, stage: ActionStage) -> Vec<String> {
        self.stage(stage).names()
    }

    fn analyse_function(
        &self,
        stage: ActionStage,
        func: Option<&ActionFn>,
        spec: &Specifier,
    ) -> DaqResult<Specifier> {
        if let Some(func) = func {
            if !stage.accepts(func) {
                return Err(self.mismatch(stage, func));
            }
        }
        if stage == ActionStage::Call && *spec != Specifier::Override {
            return Err(DaqError::InvalidSpecifier(
                "call can only be replaced, not composed".to_string(),
            ));
        }
        if spec.is_insertion() && self.stage(stage).is_trivial() {
            return Ok(Specifier::Override);
        }
        Ok(spec.clone())
    }

    fn apply_edit(
        &mut self,
        stage: ActionStage,
        func: Option<ActionFn>,
        spec: &Specifier,
        id: &str,
    ) -> DaqResult<()> {
        self.stage_mut(stage)
            .apply(stage.name(), "action", stage.chain_on(), spec, id, func)
    }
}

fn build_param_checks(
    name: &str,
    signature: &Signature,
    kwargs: &ActionKwargs,
) -> DaqResult<Vec<(String, ParamCheck)>> {
    let mut checks = Vec::new();
    for (param, values) in &kwargs.values {
        if !signature.contains(param) {
            return Err(DaqError::Configuration(format!(
                "{name} has no parameter '{param}' to restrict"
            )));
        }
        checks.push((param.clone(), ParamCheck::Values(values.clone())));
    }
    for (param, limits) in &kwargs.limits {
        if !signature.contains(param) {
            return Err(DaqError::Configuration(format!(
                "{name} has no parameter '{param}' to limit"
            )));
        }
        if checks.iter().any(|(p, _)| p == param) {
            return Err(DaqError::ConflictingValidators {
                action: name.to_string(),
                param: param.clone(),
            });
        }
        let check = match limits {
            LimitsSpec::Named(id) => ParamCheck::NamedLimits(id.clone()),
            LimitsSpec::Validator(limits) => ParamCheck::Limits(Arc::new(limits.clone())),
            LimitsSpec::Range {
                minimum,
                maximum,
                step,
            } => ParamCheck::Limits(Arc::new(LimitsValidator::float(*minimum, *maximum, *step)?)),
        };
        checks.push((param.clone(), check));
    }
    Ok(checks)
}

// =============================================================================
// Internal fragments
// =============================================================================

fn strip_units(action: &Action, _driver: &Node<'_>, mut args: BoundArgs) -> DaqResult<BoundArgs> {
    for (param, unit) in &action.param_units {
        if let Some(Value::Quantity(q)) = args.get(param) {
            let magnitude = q.magnitude_in(unit)?;
            args.set(param, Value::Float(magnitude));
        }
    }
    Ok(args)
}

fn run_checks(action: &Action, driver: &Node<'_>, args: BoundArgs) -> DaqResult<BoundArgs> {
    if let Some(checker) = &action.checks {
        let locals = args.locals();
        checker.check(|ident| driver.resolve_identifier(ident, &locals))?;
    }
    Ok(args)
}

fn validate_args(action: &Action, driver: &Node<'_>, args: BoundArgs) -> DaqResult<BoundArgs> {
    for (param, check) in &action.param_checks {
        let Some(value) = args.get(param) else {
            continue;
        };
        let limits = match check {
            ParamCheck::Values(values) => {
                if !values.iter().any(|allowed| allowed.loose_eq(value)) {
                    let allowed: Vec<String> = values.iter().map(Value::to_string).collect();
                    return Err(DaqError::InvalidValue {
                        name: format!("{}({param})", action.name),
                        value: value.to_string(),
                        allowed: allowed.join(", "),
                    });
                }
                continue;
            }
            ParamCheck::Limits(limits) => limits.clone(),
            ParamCheck::NamedLimits(id) => driver.get_limits(id)?,
        };
        if !limits.validate(value)? {
            return Err(limits_error(&format!("{}({param})", action.name), value, &limits));
        }
    }
    Ok(args)
}

fn attach_units(action: &Action, driver: &Node<'_>, result: Value, _args: &BoundArgs) -> DaqResult<Value> {
    if !driver.unit_return(&action.name) {
        return Ok(result);
    }
    match (action.return_units.as_slice(), result) {
        ([Some(unit)], value) => value.with_unit(unit),
        ([_], value) => Ok(value),
        (units, Value::List(values)) if units.len() == values.len() => units
            .iter()
            .zip(values)
            .map(|(unit, value)| match unit {
                Some(unit) => value.with_unit(unit),
                None => Ok(value),
            })
            .collect::<DaqResult<Vec<_>>>()
            .map(Value::List),
        (units, value) => Err(DaqError::Unit(format!(
            "{} declares {} return units but returned {value}",
            action.name,
            units.len()
        ))),
    }
}

fn to_register(action: &Action, _driver: &Node<'_>, result: Value, _args: &BoundArgs) -> DaqResult<Value> {
    let bits = result
        .as_i64()
        .or_else(|| result.as_str().and_then(|s| s.trim().parse::<i64>().ok()))
        .and_then(|i| u64::try_from(i).ok())
        .ok_or_else(|| {
            DaqError::Conversion(format!("{}: '{result}' is not a register value", action.name))
        })?;
    Ok(Value::Register(RegisterValue::new(
        action.register_type_name(),
        bits,
        action.register_names.clone(),
    )))
}

/// `pre_call` guard failing when the owning subsystem or channel is disabled.
pub(crate) fn enabling_call(action: &Action, driver: &Node<'_>, args: BoundArgs) -> DaqResult<BoundArgs> {
    driver.ensure_enabled(&action.name)?;
    Ok(args)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actions::{action, register_action};

    fn names(action: &Action, stage: ActionStage) -> Vec<String> {
        action.stage(stage).names()
    }

    #[test]
    fn test_values_and_limits_conflict() {
        let kw = action(["a"], |_, _| Ok(Value::None))
            .values("a", [1, 2, 3])
            .limits("a", (0.0, 5.0));
        let err = Action::new("ramp", kw).unwrap_err();
        assert!(matches!(err, DaqError::ConflictingValidators { ref param, .. } if param == "a"));
        assert!(err.is_configuration());
    }

    #[test]
    fn test_units_must_match_params() {
        let kw = action(["a", "b"], |_, _| Ok(Value::None)).units(["V"], [Some("V")]);
        assert!(Action::new("ramp", kw).unwrap_err().is_configuration());
    }

    #[test]
    fn test_unknown_param_restriction() {
        let kw = action(["a"], |_, _| Ok(Value::None)).values("b", [1]);
        assert!(Action::new("ramp", kw).is_err());
    }

    #[test]
    fn test_internal_fragment_order() {
        let kw = action(["a"], |_, _| Ok(Value::None))
            .units(["V"], [Some("V")])
            .checks("a > 0")
            .limits("a", (0.0, 5.0));
        let act = Action::new("ramp", kw).unwrap();
        assert_eq!(names(&act, ActionStage::PreCall), ["units", "checks", "validate"]);
        assert_eq!(names(&act, ActionStage::PostCall), ["units"]);
        assert!(act.customs().is_empty());
    }

    #[test]
    fn test_call_stage_is_override_only() {
        let mut act = Action::new("ramp", action(["a"], |_, _| Ok(Value::None))).unwrap();
        let err = act
            .modify_behavior(
                ActionStage::Call,
                Some(ActionFn::invoke(|_, _, _| Ok(Value::Int(1)))),
                Specifier::Append,
                "extra",
                false,
            )
            .unwrap_err();
        assert!(matches!(err, DaqError::InvalidSpecifier(_)));
        act.modify_behavior(
            ActionStage::Call,
            Some(ActionFn::invoke(|_, _, _| Ok(Value::Int(1)))),
            Specifier::Override,
            "",
            false,
        )
        .unwrap();
        assert_eq!(names(&act, ActionStage::Call), ["old"]);
    }

    #[test]
    fn test_clone_is_independent() {
        let mut act = Action::new("ramp", action(["a"], |_, _| Ok(Value::None))).unwrap();
        act.modify_behavior(
            ActionStage::PostCall,
            Some(ActionFn::finish(|_, _, r, _| Ok(r))),
            Specifier::Append,
            "log",
            false,
        )
        .unwrap();
        let mut copy = act.clone_action().unwrap();
        copy.modify_behavior(
            ActionStage::PostCall,
            Some(ActionFn::finish(|_, _, r, _| Ok(r))),
            Specifier::Append,
            "scale",
            false,
        )
        .unwrap();
        assert_eq!(names(&act, ActionStage::PostCall), ["log"]);
        assert_eq!(names(&copy, ActionStage::PostCall), ["log", "scale"]);
    }

    #[test]
    fn test_register_type_name() {
        let kw = register_action([Some("ready"), None, Some("error")], 8, Vec::<&str>::new(), |_, _| {
            Ok(Value::Int(5))
        });
        let act = Action::new("read_status_byte", kw).unwrap();
        assert_eq!(act.register_type_name(), "ReadStatusByteFlags");
        assert_eq!(names(&act, ActionStage::PostCall), ["register"]);
    }
}
