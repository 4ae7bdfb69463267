//! The `Feature` descriptor and its get/set pipelines.
//!
//! Reading runs `pre_get -> get -> post_get`, writing runs
//! `pre_set -> set -> post_set`. `get` and `set` are retried on retryable
//! communication errors after reopening the connection. Both pipelines run
//! under the driver lock together with the cache lookup and update.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use tracing::debug;

use crate::checks::{Checker, Extractor};
use crate::composition::{Customs, Slot, Specifier, SupportMethodCustomization};
use crate::config::DriverConfig;
use crate::driver::Node;
use crate::error::{DaqError, DaqResult};
use crate::features::kinds;
use crate::features::{Command, FeatureKind, FeatureKwargs, LimitsSpec};
use crate::limits::LimitsValidator;
use crate::unit::{Quantity, Unit};
use crate::value::Value;

// =============================================================================
// Stage functions
// =============================================================================

/// `pre_get` fragment.
pub type CheckFn = Arc<dyn Fn(&Feature, &Node<'_>) -> DaqResult<()> + Send + Sync>;
/// `get` function.
pub type QueryFn = Arc<dyn Fn(&Feature, &Node<'_>) -> DaqResult<Value> + Send + Sync>;
/// `post_get`, `pre_set` and `set` fragments: value in, value out.
pub type TransformFn = Arc<dyn Fn(&Feature, &Node<'_>, Value) -> DaqResult<Value> + Send + Sync>;
/// `post_set` fragment receiving the value, the instrument value and the response.
pub type InspectFn =
    Arc<dyn Fn(&Feature, &Node<'_>, &Value, &Value, &Value) -> DaqResult<()> + Send + Sync>;

/// A function usable in one of the feature stages.
#[derive(Clone)]
pub enum FeatureFn {
    /// `pre_get`: may refuse the read.
    Check(CheckFn),
    /// `get`: produces the raw value.
    Query(QueryFn),
    /// `post_get`, `pre_set` and `set`: threads the value.
    Transform(TransformFn),
    /// `post_set`: sees the value, the instrument value and the response.
    Inspect(InspectFn),
}

impl FeatureFn {
    /// Wrap a `pre_get` function.
    pub fn check(f: impl Fn(&Feature, &Node<'_>) -> DaqResult<()> + Send + Sync + 'static) -> Self {
        FeatureFn::Check(Arc::new(f))
    }

    /// Wrap a `get` function.
    pub fn query(
        f: impl Fn(&Feature, &Node<'_>) -> DaqResult<Value> + Send + Sync + 'static,
    ) -> Self {
        FeatureFn::Query(Arc::new(f))
    }

    /// Wrap a value transforming function.
    pub fn transform(
        f: impl Fn(&Feature, &Node<'_>, Value) -> DaqResult<Value> + Send + Sync + 'static,
    ) -> Self {
        FeatureFn::Transform(Arc::new(f))
    }

    /// Wrap a `post_set` function.
    pub fn inspect(
        f: impl Fn(&Feature, &Node<'_>, &Value, &Value, &Value) -> DaqResult<()>
            + Send
            + Sync
            + 'static,
    ) -> Self {
        FeatureFn::Inspect(Arc::new(f))
    }

    fn shape(&self) -> &'static str {
        match self {
            FeatureFn::Check(_) => "check",
            FeatureFn::Query(_) => "query",
            FeatureFn::Transform(_) => "transform",
            FeatureFn::Inspect(_) => "inspect",
        }
    }
}

impl fmt::Debug for FeatureFn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FeatureFn::{}", self.shape())
    }
}

/// Pipeline stages of a feature.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FeatureStage {
    /// Before reading; checks and enabling.
    PreGet,
    /// Reads from the instrument.
    Get,
    /// Converts the instrument reply.
    PostGet,
    /// Validates and converts the user value.
    PreSet,
    /// Writes to the instrument.
    Set,
    /// Checks the operation and discards dependent state.
    PostSet,
}

impl FeatureStage {
    /// Stages in pipeline order.
    pub const ALL: [FeatureStage; 6] = [
        FeatureStage::PreGet,
        FeatureStage::Get,
        FeatureStage::PostGet,
        FeatureStage::PreSet,
        FeatureStage::Set,
        FeatureStage::PostSet,
    ];

    /// Name used by customizers, e.g. `"post_get"`.
    pub fn name(self) -> &'static str {
        match self {
            FeatureStage::PreGet => "pre_get",
            FeatureStage::Get => "get",
            FeatureStage::PostGet => "post_get",
            FeatureStage::PreSet => "pre_set",
            FeatureStage::Set => "set",
            FeatureStage::PostSet => "post_set",
        }
    }

    fn chain_on(self) -> &'static [&'static str] {
        match self {
            FeatureStage::PostGet | FeatureStage::PreSet | FeatureStage::Set => &["value"],
            _ => &[],
        }
    }

    fn expected(self) -> &'static str {
        match self {
            FeatureStage::PreGet => "check (feat, driver) -> ()",
            FeatureStage::Get => "query (feat, driver) -> value",
            FeatureStage::PostGet | FeatureStage::PreSet | FeatureStage::Set => {
                "transform (feat, driver, value) -> value"
            }
            FeatureStage::PostSet => "inspect (feat, driver, value, i_value, response) -> ()",
        }
    }

    fn accepts(self, func: &FeatureFn) -> bool {
        matches!(
            (self, func),
            (FeatureStage::PreGet, FeatureFn::Check(_))
                | (FeatureStage::Get, FeatureFn::Query(_))
                | (FeatureStage::PostGet, FeatureFn::Transform(_))
                | (FeatureStage::PreSet, FeatureFn::Transform(_))
                | (FeatureStage::Set, FeatureFn::Transform(_))
                | (FeatureStage::PostSet, FeatureFn::Inspect(_))
        )
    }
}

impl fmt::Display for FeatureStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for FeatureStage {
    type Err = DaqError;

    fn from_str(s: &str) -> DaqResult<Self> {
        FeatureStage::ALL
            .into_iter()
            .find(|stage| stage.name() == s)
            .ok_or_else(|| DaqError::InvalidSpecifier(format!("unknown feature stage '{s}'")))
    }
}

/// Limits resolved at construction.
#[derive(Debug, Clone)]
pub enum FeatureLimits {
    /// Fixed limits built with the feature.
    Static(Arc<LimitsValidator>),
    /// Limits declared on the driver, built per instance.
    Named(String),
}

// =============================================================================
// Feature
// =============================================================================

/// One instrument property.
pub struct Feature {
    name: String,
    raw_doc: Option<String>,
    doc: String,
    kwargs: FeatureKwargs,
    pre_get: Slot<FeatureFn>,
    get: Slot<FeatureFn>,
    post_get: Slot<FeatureFn>,
    pre_set: Slot<FeatureFn>,
    set: Slot<FeatureFn>,
    post_set: Slot<FeatureFn>,
    customs: Customs<FeatureStage, FeatureFn>,
    get_checks: Option<Checker>,
    set_checks: Option<Checker>,
    options: Option<Checker>,
    extractor: Option<Extractor>,
    unit: Option<Unit>,
    limits: Option<FeatureLimits>,
    register_names: Vec<String>,
}

impl Feature {
    /// Build a feature and install the fragments its kwargs call for.
    pub fn new(kwargs: FeatureKwargs) -> DaqResult<Self> {
        let checks = kwargs.checks.clone();
        let get_checks = checks.as_ref().and_then(|c| c.get()).map(Checker::parse).transpose()?;
        let set_checks = checks.as_ref().and_then(|c| c.set()).map(Checker::parse).transpose()?;
        let options = kwargs.options.as_deref().map(Checker::parse).transpose()?;
        let extractor = kwargs.extract.as_deref().map(Extractor::new).transpose()?;
        let unit = match &kwargs.kind {
            FeatureKind::Float { unit: Some(unit) } => Some(Unit::parse(unit)?),
            _ => None,
        };
        let limits = build_limits(&kwargs, unit.as_ref())?;
        if limits.is_some() && !kwargs.values.is_empty() {
            return Err(DaqError::Configuration(
                "a feature cannot declare both values and limits".to_string(),
            ));
        }
        let register_names = match &kwargs.kind {
            FeatureKind::Register { names, length } => {
                if names.len() > *length as usize || *length > 64 {
                    return Err(DaqError::Configuration(format!(
                        "register of length {length} cannot hold {} names",
                        names.len()
                    )));
                }
                crate::value::RegisterValue::flag_names(names, *length)
            }
            _ => Vec::new(),
        };

        let is_alias = matches!(kwargs.kind, FeatureKind::Alias { .. });
        let get = match (&kwargs.kind, &kwargs.getter) {
            (FeatureKind::Alias { .. }, _) => FeatureFn::query(kinds::alias_get),
            (_, Some(Command::Factory(factory))) => factory.build_getter()?,
            _ => FeatureFn::query(default_get),
        };
        let set = match (&kwargs.kind, &kwargs.setter) {
            (FeatureKind::Alias { .. }, _) => FeatureFn::transform(kinds::alias_set),
            (_, Some(Command::Factory(factory))) => factory.build_setter()?,
            _ => FeatureFn::transform(default_set),
        };
        let post_set = if is_alias {
            Slot::trivial(FeatureFn::inspect(|_, _, _, _, _| Ok(())))
        } else {
            Slot::base(FeatureFn::inspect(check_operation))
        };

        let mut feat = Self {
            name: String::new(),
            raw_doc: None,
            doc: String::new(),
            pre_get: Slot::trivial(FeatureFn::check(|_, _| Ok(()))),
            get: Slot::base(get),
            post_get: Slot::trivial(FeatureFn::transform(|_, _, value| Ok(value))),
            pre_set: Slot::trivial(FeatureFn::transform(|_, _, value| Ok(value))),
            set: Slot::base(set),
            post_set,
            customs: Customs::default(),
            get_checks,
            set_checks,
            options,
            extractor,
            unit,
            limits,
            register_names,
            kwargs,
        };
        feat.install_internal_fragments()?;
        Ok(feat)
    }

    fn install_internal_fragments(&mut self) -> DaqResult<()> {
        use FeatureStage::*;

        if self.get_checks.is_some() {
            self.internal(PreGet, FeatureFn::check(kinds::check_get), Specifier::Prepend, "checks")?;
        }
        if self.set_checks.is_some() {
            self.internal(PreSet, FeatureFn::transform(kinds::check_set), Specifier::Prepend, "checks")?;
        }
        if self.extractor.is_some() {
            self.internal(PostGet, FeatureFn::transform(kinds::extract), Specifier::Prepend, "extract")?;
        }

        let has_mapping = self.kwargs.mapping.is_some();
        let post_get = match &self.kwargs.kind {
            FeatureKind::Bool { .. } => Some(("map", FeatureFn::transform(kinds::bool_from_instrument))),
            _ if has_mapping => Some(("map", FeatureFn::transform(kinds::reverse_map))),
            FeatureKind::Str => Some(("cast", FeatureFn::transform(kinds::cast_str))),
            FeatureKind::Int => Some(("cast", FeatureFn::transform(kinds::cast_int))),
            FeatureKind::Float { .. } => Some(("cast", FeatureFn::transform(kinds::cast_float))),
            FeatureKind::Register { .. } => Some(("cast", FeatureFn::transform(kinds::cast_register))),
            FeatureKind::Options { .. } => Some(("cast", FeatureFn::transform(kinds::cast_options))),
            FeatureKind::Generic | FeatureKind::Alias { .. } => None,
        };
        if let Some((id, func)) = post_get {
            self.internal(PostGet, func, Specifier::Append, id)?;
        }

        if self.unit.is_some() {
            self.internal(PreSet, FeatureFn::transform(kinds::convert_unit), Specifier::Append, "convert")?;
        }
        if !self.kwargs.values.is_empty() {
            self.internal(PreSet, FeatureFn::transform(kinds::validate_values), Specifier::Append, "validate")?;
        } else if self.limits.is_some() {
            self.internal(PreSet, FeatureFn::transform(kinds::validate_limits), Specifier::Append, "validate")?;
        }
        match &self.kwargs.kind {
            FeatureKind::Bool { .. } => {
                self.internal(PreSet, FeatureFn::transform(kinds::bool_to_instrument), Specifier::Append, "map")?;
            }
            FeatureKind::Register { .. } => {
                self.internal(PreSet, FeatureFn::transform(kinds::register_to_int), Specifier::Append, "cast")?;
            }
            _ if has_mapping => {
                self.internal(PreSet, FeatureFn::transform(kinds::forward_map), Specifier::Append, "map")?;
            }
            _ => {}
        }

        if self.kwargs.discard.is_some() {
            self.internal(PostSet, FeatureFn::inspect(kinds::discard), Specifier::Append, "discard")?;
        }
        Ok(())
    }

    fn internal(&mut self, stage: FeatureStage, func: FeatureFn, spec: Specifier, id: &str) -> DaqResult<()> {
        self.modify_behavior(stage, Some(func), spec, id, true)
    }

    // -------------------------------------------------------------------------
    // Accessors
    // -------------------------------------------------------------------------

    /// Attribute name in the owning class.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn set_name(&mut self, name: &str) {
        self.name = name.to_string();
    }

    /// Composed documentation.
    pub fn doc(&self) -> &str {
        &self.doc
    }

    /// Declaration the feature was built from.
    pub fn kwargs(&self) -> &FeatureKwargs {
        &self.kwargs
    }

    /// Whether the feature can be read.
    pub fn is_readable(&self) -> bool {
        self.kwargs.is_readable()
    }

    /// Whether the feature can be written.
    pub fn is_settable(&self) -> bool {
        self.kwargs.is_settable()
    }

    /// Whether the feature forwards to another one.
    pub fn is_alias(&self) -> bool {
        matches!(self.kwargs.kind, FeatureKind::Alias { .. })
    }

    /// Whether the feature lists installed instrument options.
    pub fn is_options(&self) -> bool {
        matches!(self.kwargs.kind, FeatureKind::Options { .. })
    }

    /// Unit of a float feature.
    pub fn unit(&self) -> Option<&Unit> {
        self.unit.as_ref()
    }

    /// Limits validating written values.
    pub fn limits(&self) -> Option<&FeatureLimits> {
        self.limits.as_ref()
    }

    /// Expression gating access on installed options.
    pub fn options_checker(&self) -> Option<&Checker> {
        self.options.as_ref()
    }

    pub(crate) fn get_checks(&self) -> Option<&Checker> {
        self.get_checks.as_ref()
    }

    pub(crate) fn set_checks(&self) -> Option<&Checker> {
        self.set_checks.as_ref()
    }

    pub(crate) fn extractor(&self) -> Option<&Extractor> {
        self.extractor.as_ref()
    }

    pub(crate) fn register_names(&self) -> &[String] {
        &self.register_names
    }

    /// Name of the bit flag type produced by a register feature.
    pub fn register_type_name(&self) -> String {
        format!("{}Flags", camel_case(&self.name))
    }

    /// Current content of one stage.
    pub fn stage(&self, stage: FeatureStage) -> &Slot<FeatureFn> {
        match stage {
            FeatureStage::PreGet => &self.pre_get,
            FeatureStage::Get => &self.get,
            FeatureStage::PostGet => &self.post_get,
            FeatureStage::PreSet => &self.pre_set,
            FeatureStage::Set => &self.set,
            FeatureStage::PostSet => &self.post_set,
        }
    }

    fn stage_mut(&mut self, stage: FeatureStage) -> &mut Slot<FeatureFn> {
        match stage {
            FeatureStage::PreGet => &mut self.pre_get,
            FeatureStage::Get => &mut self.get,
            FeatureStage::PostGet => &mut self.post_get,
            FeatureStage::PreSet => &mut self.pre_set,
            FeatureStage::Set => &mut self.set,
            FeatureStage::PostSet => &mut self.post_set,
        }
    }

    fn retries(&self, driver: &Node<'_>) -> u32 {
        self.kwargs
            .retries
            .unwrap_or_else(|| driver.config().default_retries)
    }

    // -------------------------------------------------------------------------
    // Pipelines
    // -------------------------------------------------------------------------

    /// Read the feature, serving the cached value when there is one.
    pub fn get_value(&self, driver: &Node<'_>) -> DaqResult<Value> {
        if !self.is_readable() {
            return Err(DaqError::NotReadable(self.name.clone()));
        }
        if self.is_alias() {
            return self.get_chain(driver);
        }
        let _guard = driver.lock();
        if let Some(entry) = driver.cached(&self.name) {
            debug!(feature = %self.name, "cache hit");
            return Ok(self.read_cache(driver, &entry));
        }
        let value = self.get_chain(driver)?;
        if driver.use_cache() {
            let entry = self.make_cache_entry(&value)?;
            driver.store_cache(&self.name, entry);
        }
        Ok(value)
    }

    /// Write the feature unless the value is already cached.
    pub fn set_value(&self, driver: &Node<'_>, value: Value) -> DaqResult<()> {
        if !self.is_settable() {
            return Err(DaqError::NotSettable(self.name.clone()));
        }
        if self.is_alias() {
            return self.set_chain(driver, value);
        }
        let _guard = driver.lock();
        if let Some(entry) = driver.cached(&self.name) {
            if self.cache_matches(&entry, &value) {
                debug!(feature = %self.name, %value, "value already cached, skipping set");
                return Ok(());
            }
        }
        driver.wait_inter_set_delay(&self.name);
        let result = self.set_chain(driver, value.clone());
        driver.mark_set(&self.name);
        result?;
        if driver.use_cache() {
            let entry = self.make_cache_entry(&value)?;
            driver.store_cache(&self.name, entry);
        }
        Ok(())
    }

    /// Run `pre_get -> get -> post_get` without touching the cache.
    pub fn get_chain(&self, driver: &Node<'_>) -> DaqResult<Value> {
        for fragment in self.pre_get.fragments() {
            match fragment {
                FeatureFn::Check(f) => f(self, driver)?,
                other => return Err(self.mismatch(FeatureStage::PreGet, other)),
            }
        }
        let raw = driver.with_retries(self.retries(driver), &self.name, || {
            self.run_query(driver)
        })?;
        self.run_transforms(FeatureStage::PostGet, driver, raw)
    }

    /// Run `pre_set -> set -> post_set` without touching the cache.
    pub fn set_chain(&self, driver: &Node<'_>, value: Value) -> DaqResult<()> {
        let i_value = self.run_transforms(FeatureStage::PreSet, driver, value.clone())?;
        let response = driver.with_retries(self.retries(driver), &self.name, || {
            self.run_transforms(FeatureStage::Set, driver, i_value.clone())
        })?;
        for fragment in self.post_set.fragments() {
            match fragment {
                FeatureFn::Inspect(f) => f(self, driver, &value, &i_value, &response)?,
                other => return Err(self.mismatch(FeatureStage::PostSet, other)),
            }
        }
        Ok(())
    }

    fn run_query(&self, driver: &Node<'_>) -> DaqResult<Value> {
        match self.get.fragments().next() {
            Some(FeatureFn::Query(f)) => f(self, driver),
            Some(other) => Err(self.mismatch(FeatureStage::Get, other)),
            None => Err(DaqError::Configuration(format!(
                "{} has an empty get stage",
                self.name
            ))),
        }
    }

    fn run_transforms(&self, stage: FeatureStage, driver: &Node<'_>, value: Value) -> DaqResult<Value> {
        self.stage(stage)
            .fragments()
            .try_fold(value, |value, fragment| match fragment {
                FeatureFn::Transform(f) => f(self, driver, value),
                other => Err(self.mismatch(stage, other)),
            })
    }

    fn mismatch(&self, stage: FeatureStage, func: &FeatureFn) -> DaqError {
        DaqError::SignatureMismatch {
            stage: format!("{}.{stage}", self.name),
            expected: format!("{}, got {}", stage.expected(), func.shape()),
        }
    }

    // -------------------------------------------------------------------------
    // Cache primitives
    // -------------------------------------------------------------------------

    /// All representations cached for a value; the last one is returned on read.
    pub(crate) fn make_cache_entry(&self, value: &Value) -> DaqResult<Vec<Value>> {
        match (&self.kwargs.kind, &self.unit) {
            (_, Some(unit)) => {
                let quantity = match value {
                    Value::Quantity(q) => q.to(unit)?,
                    other => Quantity::new(
                        other.as_f64().ok_or_else(|| {
                            DaqError::Conversion(format!("{other} is not a number"))
                        })?,
                        unit.clone(),
                    ),
                };
                Ok(vec![Value::Float(quantity.magnitude), Value::Quantity(quantity)])
            }
            (FeatureKind::Float { .. }, None) => Ok(vec![value
                .as_f64()
                .map(Value::Float)
                .unwrap_or_else(|| value.clone())]),
            (FeatureKind::Int, None) if self.kwargs.mapping.is_none() => Ok(vec![value
                .as_i64()
                .map(Value::Int)
                .unwrap_or_else(|| value.clone())]),
            _ => Ok(vec![value.clone()]),
        }
    }

    pub(crate) fn read_cache(&self, driver: &Node<'_>, entry: &[Value]) -> Value {
        match (&self.unit, entry) {
            (Some(_), [magnitude, quantity]) => {
                if driver.unit_return(&self.name) {
                    quantity.clone()
                } else {
                    magnitude.clone()
                }
            }
            _ => entry.last().cloned().unwrap_or_default(),
        }
    }

    pub(crate) fn cache_matches(&self, entry: &[Value], value: &Value) -> bool {
        entry.iter().any(|cached| cached.loose_eq(value))
    }

    /// Settings created for every driver instance.
    pub fn default_settings(&self, config: &DriverConfig) -> BTreeMap<String, Value> {
        let mut settings = BTreeMap::new();
        settings.insert(
            "inter_set_delay".to_string(),
            Value::Float(config.inter_set_delay_ms as f64 / 1000.0),
        );
        if self.unit.is_some() {
            settings.insert("unit_return".to_string(), Value::Bool(config.unit_return));
        }
        settings
    }

    // -------------------------------------------------------------------------
    // Cloning and docs
    // -------------------------------------------------------------------------

    /// Independent copy: rebuilt from kwargs, then the recorded edits replayed.
    pub fn clone_feature(&self) -> DaqResult<Feature> {
        self.customize(|_| {})
    }

    /// Rebuild with patched kwargs, keeping name, doc and recorded edits.
    pub fn customize(&self, patch: impl FnOnce(&mut FeatureKwargs)) -> DaqResult<Feature> {
        let mut kwargs = self.kwargs.clone();
        patch(&mut kwargs);
        let mut feat = Feature::new(kwargs)?;
        feat.name = self.name.clone();
        feat.raw_doc = self.raw_doc.clone();
        feat.doc = self.doc.clone();
        feat.copy_custom_behaviors(self)?;
        Ok(feat)
    }

    /// Compose the documentation from the user text and the declaration.
    pub fn make_doc(&mut self, doc: Option<&str>) {
        if let Some(doc) = doc {
            self.raw_doc = Some(doc.trim().to_string());
        }
        let mut sections: Vec<String> = self.raw_doc.iter().cloned().collect();

        let access = match (self.is_readable(), self.is_settable()) {
            (true, true) => "readable and settable",
            (true, false) => "read only",
            (false, true) => "write only",
            (false, false) => "not accessible",
        };
        let mut notes = vec![format!("The feature is {access}.")];
        if let FeatureKind::Alias { target, .. } = &self.kwargs.kind {
            notes.push(format!("Alias of {target}."));
        }
        if let Some(unit) = &self.unit {
            notes.push(format!("Unit: {unit}."));
        }
        if !self.kwargs.values.is_empty() {
            let values: Vec<String> = self.kwargs.values.iter().map(Value::to_string).collect();
            notes.push(format!("Allowed values: {}.", values.join(", ")));
        }
        match &self.limits {
            Some(FeatureLimits::Static(limits)) => notes.push(format!("Limits: {limits}.")),
            Some(FeatureLimits::Named(id)) => notes.push(format!("Limits: driver limits '{id}'.")),
            None => {}
        }
        if let Some(options) = &self.options {
            notes.push(format!("Available when: {}.", options.source()));
        }
        if let Some(checks) = &self.get_checks {
            notes.push(format!("Checked before getting: {}.", checks.source()));
        }
        if let Some(checks) = &self.set_checks {
            notes.push(format!("Checked before setting: {}.", checks.source()));
        }
        if let Some(discard) = &self.kwargs.discard {
            if !discard.features.is_empty() {
                notes.push(format!(
                    "Setting discards the cached value of: {}.",
                    discard.features.join(", ")
                ));
            }
            if !discard.limits.is_empty() {
                notes.push(format!("Setting discards the limits: {}.", discard.limits.join(", ")));
            }
        }
        sections.push(notes.join("\n"));
        self.doc = sections.join("\n\n");
    }
}

impl fmt::Debug for Feature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Feature")
            .field("name", &self.name)
            .field("kind", &self.kwargs.kind)
            .field("pre_get", &self.pre_get)
            .field("post_get", &self.post_get)
            .field("pre_set", &self.pre_set)
            .field("post_set", &self.post_set)
            .field("customs", &self.customs)
            .finish()
    }
}

impl SupportMethodCustomization for Feature {
    type Stage = FeatureStage;
    type Func = FeatureFn;

    fn customs(&self) -> &Customs<FeatureStage, FeatureFn> {
        &self.customs
    }

    fn customs_mut(&mut self) -> &mut Customs<FeatureStage, FeatureFn> {
        &mut self.customs
    }

    fn stage_names(&self, stage: FeatureStage) -> Vec<String> {
        self.stage(stage).names()
    }

    fn analyse_function(
        &self,
        stage: FeatureStage,
        func: Option<&FeatureFn>,
        spec: &Specifier,
    ) -> DaqResult<Specifier> {
        if let Some(func) = func {
            if !stage.accepts(func) {
                return Err(DaqError::SignatureMismatch {
                    stage: format!("{}.{stage}", self.name),
                    expected: format!("{}, got {}", stage.expected(), func.shape()),
                });
            }
        }
        if matches!(stage, FeatureStage::Get | FeatureStage::Set) && *spec != Specifier::Override {
            return Err(DaqError::InvalidSpecifier(format!(
                "{stage} can only be replaced, not composed"
            )));
        }
        if spec.is_insertion() && self.stage(stage).is_trivial() {
            return Ok(Specifier::Override);
        }
        Ok(spec.clone())
    }

    fn apply_edit(
        &mut self,
        stage: FeatureStage,
        func: Option<FeatureFn>,
        spec: &Specifier,
        id: &str,
    ) -> DaqResult<()> {
        self.stage_mut(stage)
            .apply(stage.name(), "feat", stage.chain_on(), spec, id, func)
    }
}

// =============================================================================
// Default stage functions
// =============================================================================

fn default_get(feat: &Feature, driver: &Node<'_>) -> DaqResult<Value> {
    match &feat.kwargs.getter {
        Some(Command::Text(cmd)) => driver.default_get_feature(feat, cmd, &[]),
        _ => Err(DaqError::Configuration(format!(
            "{} has no getter command and its get stage was not customized",
            feat.name
        ))),
    }
}

fn default_set(feat: &Feature, driver: &Node<'_>, value: Value) -> DaqResult<Value> {
    match &feat.kwargs.setter {
        Some(Command::Text(cmd)) => driver.default_set_feature(feat, cmd, &[value]),
        _ => Err(DaqError::Configuration(format!(
            "{} has no setter command and its set stage was not customized",
            feat.name
        ))),
    }
}

fn check_operation(
    feat: &Feature,
    driver: &Node<'_>,
    value: &Value,
    i_value: &Value,
    response: &Value,
) -> DaqResult<()> {
    let (ok, detail) = driver.default_check_operation(feat, value, i_value, response)?;
    if ok {
        Ok(())
    } else {
        Err(DaqError::OperationFailed {
            feature: feat.name.clone(),
            value: value.to_string(),
            detail,
        })
    }
}

fn build_limits(kwargs: &FeatureKwargs, unit: Option<&Unit>) -> DaqResult<Option<FeatureLimits>> {
    let Some(spec) = &kwargs.limits else {
        return Ok(None);
    };
    let limits = match spec {
        LimitsSpec::Named(id) => return Ok(Some(FeatureLimits::Named(id.clone()))),
        LimitsSpec::Validator(limits) => limits.clone(),
        LimitsSpec::Range {
            minimum,
            maximum,
            step,
        } => match &kwargs.kind {
            FeatureKind::Int => LimitsValidator::int(
                minimum.map(|v| v as i64),
                maximum.map(|v| v as i64),
                step.map(|v| v as i64),
            )?,
            FeatureKind::Float { .. } => {
                let limits = LimitsValidator::float(*minimum, *maximum, *step)?;
                match unit {
                    Some(unit) => limits.with_unit(unit.symbol())?,
                    None => limits,
                }
            }
            other => {
                return Err(DaqError::Configuration(format!(
                    "numeric limits are not supported by {other:?} features"
                )))
            }
        },
    };
    Ok(Some(FeatureLimits::Static(Arc::new(limits))))
}

pub(crate) fn camel_case(name: &str) -> String {
    name.split('_')
        .filter(|part| !part.is_empty())
        .map(|part| {
            let mut chars = part.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect::<String>(),
                None => String::new(),
            }
        })
        .collect()
}
