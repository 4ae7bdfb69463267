//! Declaration vocabulary for driver classes.
//!
//! A class body is an explicit accumulator: features, actions, overrides of
//! inherited members, customizers, limits and nested subparts are recorded in
//! declaration order and consumed once by [`ClassBody::build`].
//!
//! # Example
//!
//! ```rust,ignore
//! use daq_features::prelude::*;
//!
//! let lockin = ClassBody::new("Lockin")
//!     .version("1.0")
//!     .feature("freq", features::float().getter("?FREQ").setter("FREQ {}").unit("Hz"))
//!     .subsystem("output", |ss| {
//!         ss.checks("driver.enabled == true")
//!             .feature("enabled", features::boolean().getter("OUT?").setter("OUT {}"))
//!             .feature("level", features::float().getter("LVL?").setter("LVL {}"))
//!     })
//!     .channel("input", |ch| {
//!         ch.available(Available::ids([1, 2]))
//!             .alias("A", 1)
//!             .feature("range", features::int().getter("RNG{id}?").setter("RNG{id} {}"))
//!     })
//!     .build()?;
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use crate::actions::{ActionFn, ActionKwargs};
use crate::class::{DriverClass, Subpart};
use crate::composition::Specifier;
use crate::driver::Node;
use crate::error::{DaqError, DaqResult};
use crate::features::{FeatureFn, FeatureKwargs};
use crate::limits::{limit_id_from_method, LimitFactory, LimitsValidator, LIMITS_PREFIX};
use crate::value::{ChannelId, Value};

/// Lists the channel ids available on a parent instance.
pub type AvailableFn = Arc<dyn Fn(&Node<'_>) -> DaqResult<Vec<ChannelId>> + Send + Sync>;

/// Patch applied to the kwargs of an inherited feature.
pub type FeaturePatch = Arc<dyn Fn(&mut FeatureKwargs) + Send + Sync>;

/// Patch applied to the kwargs of an inherited action.
pub type ActionPatch = Arc<dyn Fn(&mut ActionKwargs) + Send + Sync>;

// =============================================================================
// Channel listing
// =============================================================================

/// How the ids of a channel are discovered.
#[derive(Clone)]
pub enum Available {
    /// Fixed list of ids.
    Static(Vec<ChannelId>),
    /// Name of a parameterless action of the parent returning the ids.
    Action(String),
    /// Function of the parent instance returning the ids.
    Fn(AvailableFn),
}

impl Available {
    /// Fixed ids.
    pub fn ids<I: Into<ChannelId>>(ids: impl IntoIterator<Item = I>) -> Self {
        Available::Static(ids.into_iter().map(Into::into).collect())
    }

    /// Ids returned by the parent's action `name`.
    pub fn action(name: &str) -> Self {
        Available::Action(name.to_string())
    }

    /// Ids computed from the parent instance.
    pub fn from_fn(
        f: impl Fn(&Node<'_>) -> DaqResult<Vec<ChannelId>> + Send + Sync + 'static,
    ) -> Self {
        Available::Fn(Arc::new(f))
    }

    /// Ids available on `parent`, the instance owning the channel.
    pub fn list(&self, parent: &Node<'_>) -> DaqResult<Vec<ChannelId>> {
        match self {
            Available::Static(ids) => Ok(ids.clone()),
            Available::Fn(f) => f(parent),
            Available::Action(name) => match parent.call(name, Default::default())? {
                Value::List(items) => items.iter().map(ChannelId::try_from).collect(),
                single => Ok(vec![ChannelId::try_from(&single)?]),
            },
        }
    }
}

impl fmt::Debug for Available {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Available::Static(ids) => f.debug_tuple("Static").field(ids).finish(),
            Available::Action(name) => f.debug_tuple("Action").field(name).finish(),
            Available::Fn(_) => f.write_str("Fn"),
        }
    }
}

// =============================================================================
// Customizers
// =============================================================================

/// Function handed to a class level customizer.
#[derive(Clone, Debug)]
pub enum CustomFn {
    Feature(FeatureFn),
    Action(ActionFn),
}

impl From<FeatureFn> for CustomFn {
    fn from(f: FeatureFn) -> Self {
        CustomFn::Feature(f)
    }
}

impl From<ActionFn> for CustomFn {
    fn from(f: ActionFn) -> Self {
        CustomFn::Action(f)
    }
}

/// `customize(target, stage, specifier, id)` applied once the class members
/// are final.
#[derive(Clone, Debug)]
pub struct Customizer {
    /// Member to edit.
    pub target: String,
    /// Stage name, e.g. `"post_get"`.
    pub stage: String,
    /// Where the fragment goes.
    pub specifier: Specifier,
    /// Fragment id.
    pub id: String,
    /// Fragment; `None` for removals.
    pub func: Option<CustomFn>,
}

// =============================================================================
// ClassBody
// =============================================================================

/// Everything declared in the body of one driver class.
#[derive(Default)]
pub struct ClassBody {
    pub(crate) name: String,
    pub(crate) bases: Vec<Arc<DriverClass>>,
    pub(crate) version: Option<String>,
    pub(crate) doc: Option<String>,
    pub(crate) features: Vec<(String, FeatureKwargs)>,
    pub(crate) actions: Vec<(String, ActionKwargs)>,
    pub(crate) feature_patches: Vec<(String, FeaturePatch)>,
    pub(crate) action_patches: Vec<(String, ActionPatch)>,
    pub(crate) customizers: Vec<Customizer>,
    pub(crate) limits: Vec<(String, LimitFactory)>,
    pub(crate) subparts: Vec<SubpartDecl>,
    pub(crate) docs: BTreeMap<String, String>,
    pub(crate) errors: Vec<DaqError>,
}

impl ClassBody {
    /// Empty body of class `name`.
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Self::default()
        }
    }

    /// Inherit from `base`. The first base listed wins name collisions.
    pub fn base(mut self, base: &Arc<DriverClass>) -> Self {
        self.bases.push(base.clone());
        self
    }

    /// Driver version, required by the registry.
    pub fn version(mut self, version: &str) -> Self {
        self.version = Some(version.to_string());
        self
    }

    /// Class documentation.
    pub fn doc(mut self, doc: &str) -> Self {
        self.doc = Some(doc.to_string());
        self
    }

    /// Class name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Run the class construction.
    pub fn build(self) -> DaqResult<Arc<DriverClass>> {
        crate::class::build_driver(self)
    }
}

impl fmt::Debug for ClassBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClassBody")
            .field("name", &self.name)
            .field("features", &self.features.iter().map(|(n, _)| n).collect::<Vec<_>>())
            .field("actions", &self.actions.iter().map(|(n, _)| n).collect::<Vec<_>>())
            .field("limits", &self.limits.iter().map(|(n, _)| n).collect::<Vec<_>>())
            .field("subparts", &self.subparts)
            .finish()
    }
}

// =============================================================================
// Subparts
// =============================================================================

/// Kind of subpart declaration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubpartKind {
    /// Single nested group.
    Subsystem,
    /// Group instantiated once per channel id.
    Channel,
}

/// Declaration of a subsystem or channel inside a class body.
#[derive(Debug)]
pub struct SubpartDecl {
    pub(crate) kind: SubpartKind,
    pub(crate) checks: Option<String>,
    pub(crate) options: Option<String>,
    pub(crate) available: Option<Available>,
    pub(crate) aliases: BTreeMap<String, ChannelId>,
    pub(crate) body: ClassBody,
}

impl SubpartDecl {
    fn new(kind: SubpartKind, name: &str) -> Self {
        Self {
            kind,
            checks: None,
            options: None,
            available: None,
            aliases: BTreeMap::new(),
            body: ClassBody::new(name),
        }
    }

    /// Attribute name in the parent.
    pub fn name(&self) -> &str {
        &self.body.name
    }

    /// Subsystem or channel.
    pub fn kind(&self) -> SubpartKind {
        self.kind
    }

    /// Enabling checks; members are disabled while they evaluate to false.
    pub fn checks(mut self, checks: &str) -> Self {
        self.checks = Some(checks.to_string());
        self
    }

    /// Options expression gating access to the subpart.
    pub fn options(mut self, options: &str) -> Self {
        self.options = Some(options.to_string());
        self
    }

    /// Extra base class of the generated subpart class.
    pub fn base(mut self, base: &Arc<DriverClass>) -> Self {
        self.body.bases.push(base.clone());
        self
    }

    /// Subpart documentation.
    pub fn doc(mut self, doc: &str) -> Self {
        self.body.doc = Some(doc.to_string());
        self
    }

    /// How channel ids are listed. Required for channels.
    pub fn available(mut self, available: Available) -> Self {
        self.available = Some(available);
        self
    }

    /// Alternative name for a channel id.
    pub fn alias(mut self, alias: &str, id: impl Into<ChannelId>) -> Self {
        self.aliases.insert(alias.to_string(), id.into());
        self
    }

    /// Merge the configuration of the same-named subpart of a base class.
    ///
    /// Checks and options are concatenated with `;` (ancestor first) and the
    /// ancestor class becomes a base of the new one. Channel listing and
    /// aliases are inherited unless redeclared.
    pub fn update_from_ancestor(&mut self, ancestor: &Subpart) {
        self.checks = merge_expressions(ancestor.checks(), self.checks.as_deref());
        self.options = merge_expressions(ancestor.options(), self.options.as_deref());
        if !self
            .body
            .bases
            .iter()
            .any(|b| Arc::ptr_eq(b, ancestor.class()))
        {
            self.body.bases.push(ancestor.class().clone());
        }
        if self.available.is_none() {
            self.available = ancestor.available().cloned();
        }
        for (alias, id) in ancestor.aliases() {
            self.aliases
                .entry(alias.clone())
                .or_insert_with(|| id.clone());
        }
    }
}

fn merge_expressions(ancestor: Option<&str>, own: Option<&str>) -> Option<String> {
    match (ancestor, own) {
        (Some(a), Some(o)) if a != o => Some(format!("{a}; {o}")),
        (Some(a), _) => Some(a.to_string()),
        (None, o) => o.map(str::to_string),
    }
}

// =============================================================================
// Declaration trait
// =============================================================================

/// Member declarations shared by class bodies and subpart declarations.
pub trait Declare: Sized {
    fn body_mut(&mut self) -> &mut ClassBody;

    fn feature(mut self, name: &str, kwargs: FeatureKwargs) -> Self {
        self.body_mut().features.push((name.to_string(), kwargs));
        self
    }

    fn action(mut self, name: &str, kwargs: ActionKwargs) -> Self {
        self.body_mut().actions.push((name.to_string(), kwargs));
        self
    }

    /// Documentation of a member declared in this body.
    fn document(mut self, member: &str, doc: &str) -> Self {
        self.body_mut()
            .docs
            .insert(member.to_string(), doc.to_string());
        self
    }

    /// Rebuild an inherited feature with patched kwargs.
    fn set_feat(mut self, name: &str, patch: impl Fn(&mut FeatureKwargs) + Send + Sync + 'static) -> Self {
        self.body_mut()
            .feature_patches
            .push((name.to_string(), Arc::new(patch)));
        self
    }

    /// Rebuild an inherited action with patched kwargs.
    fn set_action(mut self, name: &str, patch: impl Fn(&mut ActionKwargs) + Send + Sync + 'static) -> Self {
        self.body_mut()
            .action_patches
            .push((name.to_string(), Arc::new(patch)));
        self
    }

    /// Edit one pipeline stage of `target`, e.g.
    /// `customize("freq", "post_get", Specifier::Append, "scale", f)`.
    fn customize(
        mut self,
        target: &str,
        stage: &str,
        specifier: Specifier,
        id: &str,
        func: impl Into<CustomFn>,
    ) -> Self {
        self.body_mut().customizers.push(Customizer {
            target: target.to_string(),
            stage: stage.to_string(),
            specifier,
            id: id.to_string(),
            func: Some(func.into()),
        });
        self
    }

    /// Remove the fragment `id` from a stage of `target`.
    fn remove_fragment(mut self, target: &str, stage: &str, id: &str) -> Self {
        self.body_mut().customizers.push(Customizer {
            target: target.to_string(),
            stage: stage.to_string(),
            specifier: Specifier::Remove(id.to_string()),
            id: id.to_string(),
            func: None,
        });
        self
    }

    /// Limits built lazily for each instance. `id` may also be given in the
    /// `_limits_<id>` method form.
    fn limit(
        mut self,
        id: &str,
        factory: impl Fn(&Node<'_>) -> DaqResult<LimitsValidator> + Send + Sync + 'static,
    ) -> Self {
        let body = self.body_mut();
        let id = if id.starts_with(LIMITS_PREFIX) {
            match limit_id_from_method(id) {
                Ok(id) => id,
                Err(err) => {
                    body.errors.push(err);
                    return self;
                }
            }
        } else {
            id.to_string()
        };
        body.limits.push((id, Arc::new(factory)));
        self
    }

    fn subsystem(mut self, name: &str, declare: impl FnOnce(SubpartDecl) -> SubpartDecl) -> Self {
        let decl = declare(SubpartDecl::new(SubpartKind::Subsystem, name));
        self.body_mut().subparts.push(decl);
        self
    }

    fn channel(mut self, name: &str, declare: impl FnOnce(SubpartDecl) -> SubpartDecl) -> Self {
        let decl = declare(SubpartDecl::new(SubpartKind::Channel, name));
        self.body_mut().subparts.push(decl);
        self
    }
}

impl Declare for ClassBody {
    fn body_mut(&mut self) -> &mut ClassBody {
        self
    }
}

impl Declare for SubpartDecl {
    fn body_mut(&mut self) -> &mut ClassBody {
        &mut self.body
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features;

    #[test]
    fn test_body_accumulates_in_order() {
        let body = ClassBody::new("Source")
            .feature("b", features::int().getter("B?"))
            .feature("a", features::int().getter("A?"))
            .set_feat("c", |kw| kw.retries = Some(1))
            .document("a", "The a value.");
        let names: Vec<&str> = body.features.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(names, ["b", "a"]);
        assert_eq!(body.feature_patches.len(), 1);
        assert_eq!(body.docs.get("a").map(String::as_str), Some("The a value."));
    }

    #[test]
    fn test_limit_method_name() {
        let body = ClassBody::new("Source")
            .limit("_limits_volt", |_| LimitsValidator::float(Some(0.0), Some(1.0), None))
            .limit("_limits_", |_| LimitsValidator::float(Some(0.0), None, None));
        assert_eq!(body.limits.len(), 1);
        assert_eq!(body.limits[0].0, "volt");
        assert_eq!(body.errors.len(), 1);
    }

    #[test]
    fn test_merge_expressions() {
        assert_eq!(merge_expressions(Some("a"), Some("b")).as_deref(), Some("a; b"));
        assert_eq!(merge_expressions(Some("a"), Some("a")).as_deref(), Some("a"));
        assert_eq!(merge_expressions(None, Some("b")).as_deref(), Some("b"));
        assert_eq!(merge_expressions(None, None), None);
    }

    #[test]
    fn test_channel_declaration() {
        let body = ClassBody::new("Scope").channel("ch", |ch| {
            ch.available(Available::ids([1, 2]))
                .alias("A", 1)
                .feature("range", features::int().getter("RNG{id}?"))
        });
        let decl = &body.subparts[0];
        assert_eq!(decl.kind(), SubpartKind::Channel);
        assert_eq!(decl.name(), "ch");
        assert_eq!(decl.aliases.get("A"), Some(&ChannelId::Int(1)));
        assert!(matches!(decl.available, Some(Available::Static(ref ids)) if ids.len() == 2));
    }
}
