//! Class construction.
//!
//! [`ClassBody::build`](crate::declarative::ClassBody::build) turns a body into
//! a [`DriverClass`] in one pass:
//!
//! 1. the body is already partitioned into features, actions, overrides,
//!    customizers, limits and subparts;
//! 2. own members are built and named, and receive an `enabling` guard when
//!    the class supports runtime enabling;
//! 3. subparts are merged with same-named inherited subparts and built into
//!    their own classes;
//! 4. `set_feat`/`set_action` rebuild inherited members from patched kwargs;
//! 5. base registries are merged, the first base winning collisions;
//! 6. inherited members not owned yet are cloned;
//! 7. customizers edit the now final members;
//! 8. documentation is composed;
//! 9. the registries are stored on the class.
//!
//! Every class owns its members: nothing built here is shared with a base, so
//! customizing a subclass can never alter its ancestors.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use tracing::debug;

use crate::actions::{enabling_call, Action, ActionFn, ActionStage};
use crate::checks::Checker;
use crate::composition::{Specifier, SupportMethodCustomization};
use crate::declarative::{Available, ClassBody, CustomFn, Customizer, SubpartDecl, SubpartKind};
use crate::error::{DaqError, DaqResult};
use crate::features::{camel_case, enabling_get, enabling_set, Feature, FeatureFn, FeatureStage};
use crate::limits::LimitFactory;
use crate::value::ChannelId;

/// Id of the guard prepended to the stages of members of enabled subparts.
pub const ENABLING_ID: &str = "enabling";

/// What a class describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClassKind {
    /// Top-level driver.
    Driver,
    /// Single nested group.
    Subsystem,
    /// Group instantiated once per channel id.
    Channel,
}

/// Runtime enabling of a subpart class.
#[derive(Debug, Clone)]
pub(crate) enum Enabling {
    Never,
    /// Enabled while the checks hold and the parent is enabled.
    Checks(Checker),
    /// Enabled while the parent is.
    Parent,
}

// =============================================================================
// Subpart
// =============================================================================

/// A subsystem or channel attached to a class.
#[derive(Debug, Clone)]
pub struct Subpart {
    kind: SubpartKind,
    class: Arc<DriverClass>,
    checks: Option<String>,
    options: Option<String>,
    options_checker: Option<Checker>,
    available: Option<Available>,
    aliases: BTreeMap<String, ChannelId>,
}

impl Subpart {
    /// Subsystem or channel.
    pub fn kind(&self) -> SubpartKind {
        self.kind
    }

    /// Class of the subpart instances.
    pub fn class(&self) -> &Arc<DriverClass> {
        &self.class
    }

    /// Enabling checks as declared.
    pub fn checks(&self) -> Option<&str> {
        self.checks.as_deref()
    }

    /// Options expression as declared.
    pub fn options(&self) -> Option<&str> {
        self.options.as_deref()
    }

    /// Parsed options expression.
    pub fn options_checker(&self) -> Option<&Checker> {
        self.options_checker.as_ref()
    }

    /// How channel ids are listed.
    pub fn available(&self) -> Option<&Available> {
        self.available.as_ref()
    }

    /// Channel id aliases.
    pub fn aliases(&self) -> &BTreeMap<String, ChannelId> {
        &self.aliases
    }
}

// =============================================================================
// DriverClass
// =============================================================================

/// A fully built driver, subsystem or channel class.
pub struct DriverClass {
    name: String,
    kind: ClassKind,
    version: Option<String>,
    doc: String,
    bases: Vec<Arc<DriverClass>>,
    features: BTreeMap<String, Feature>,
    actions: BTreeMap<String, Action>,
    subsystems: BTreeMap<String, Subpart>,
    channels: BTreeMap<String, Subpart>,
    limits: BTreeMap<String, LimitFactory>,
    enabling: Enabling,
}

impl DriverClass {
    /// Class name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Driver, subsystem or channel.
    pub fn kind(&self) -> ClassKind {
        self.kind
    }

    /// Driver version, inherited from the bases when unset.
    pub fn version(&self) -> Option<&str> {
        self.version.as_deref()
    }

    /// Class documentation.
    pub fn doc(&self) -> &str {
        &self.doc
    }

    /// Direct bases.
    pub fn bases(&self) -> &[Arc<DriverClass>] {
        &self.bases
    }

    /// Feature named `name`.
    pub fn feature(&self, name: &str) -> Option<&Feature> {
        self.features.get(name)
    }

    /// All features, own and inherited.
    pub fn features(&self) -> impl Iterator<Item = (&str, &Feature)> {
        self.features.iter().map(|(n, f)| (n.as_str(), f))
    }

    /// Action named `name`.
    pub fn action(&self, name: &str) -> Option<&Action> {
        self.actions.get(name)
    }

    /// All actions, own and inherited.
    pub fn actions(&self) -> impl Iterator<Item = (&str, &Action)> {
        self.actions.iter().map(|(n, a)| (n.as_str(), a))
    }

    /// Subsystem named `name`.
    pub fn subsystem(&self, name: &str) -> Option<&Subpart> {
        self.subsystems.get(name)
    }

    /// Names of the subsystems.
    pub fn subsystem_names(&self) -> impl Iterator<Item = &str> {
        self.subsystems.keys().map(String::as_str)
    }

    /// Channel named `name`.
    pub fn channel(&self, name: &str) -> Option<&Subpart> {
        self.channels.get(name)
    }

    /// Names of the channels.
    pub fn channel_names(&self) -> impl Iterator<Item = &str> {
        self.channels.keys().map(String::as_str)
    }

    /// Ids of the limits this class knows how to build.
    pub fn declared_limits(&self) -> Vec<&str> {
        self.limits.keys().map(String::as_str).collect()
    }

    pub(crate) fn limit(&self, id: &str) -> Option<&LimitFactory> {
        self.limits.get(id)
    }

    /// Whether members carry an enabling guard.
    pub fn supports_enabling(&self) -> bool {
        !matches!(self.enabling, Enabling::Never)
    }

    pub(crate) fn enabling(&self) -> &Enabling {
        &self.enabling
    }

    /// True when `self` is `other` or derives from it.
    pub fn inherits_from(&self, other: &DriverClass) -> bool {
        std::ptr::eq(self, other) || self.bases.iter().any(|b| b.inherits_from(other))
    }
}

impl fmt::Debug for DriverClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DriverClass")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("version", &self.version)
            .field("features", &self.features.keys().collect::<Vec<_>>())
            .field("actions", &self.actions.keys().collect::<Vec<_>>())
            .field("subsystems", &self.subsystems.keys().collect::<Vec<_>>())
            .field("channels", &self.channels.keys().collect::<Vec<_>>())
            .field("limits", &self.limits.keys().collect::<Vec<_>>())
            .finish()
    }
}

// =============================================================================
// Construction
// =============================================================================

pub(crate) fn build_driver(body: ClassBody) -> DaqResult<Arc<DriverClass>> {
    build_class(body, ClassKind::Driver, Enabling::Never)
}

fn build_class(mut body: ClassBody, kind: ClassKind, enabling: Enabling) -> DaqResult<Arc<DriverClass>> {
    if !body.errors.is_empty() {
        return Err(body.errors.remove(0));
    }
    let class_name = body.name.clone();
    let bases = std::mem::take(&mut body.bases);
    let supports_enabling = !matches!(enabling, Enabling::Never);

    // Own members.
    let mut features = BTreeMap::new();
    for (name, kwargs) in std::mem::take(&mut body.features) {
        let mut feat = Feature::new(kwargs)?;
        feat.set_name(&name);
        if supports_enabling {
            add_feature_guard(&mut feat)?;
        }
        if features.insert(name.clone(), feat).is_some() {
            return Err(duplicate(&class_name, &name));
        }
    }
    let mut actions = BTreeMap::new();
    for (name, kwargs) in std::mem::take(&mut body.actions) {
        let mut action = Action::new(&name, kwargs)?;
        if supports_enabling {
            action.modify_behavior(
                ActionStage::PreCall,
                Some(ActionFn::prepare(enabling_call)),
                Specifier::Prepend,
                ENABLING_ID,
                false,
            )?;
        }
        if features.contains_key(&name) || actions.insert(name.clone(), action).is_some() {
            return Err(duplicate(&class_name, &name));
        }
    }

    // Inherited registries, walked in reverse so the first base wins.
    let mut inherited_features: BTreeMap<&str, &Feature> = BTreeMap::new();
    let mut inherited_actions: BTreeMap<&str, &Action> = BTreeMap::new();
    let mut subsystems: BTreeMap<String, Subpart> = BTreeMap::new();
    let mut channels: BTreeMap<String, Subpart> = BTreeMap::new();
    let mut limits: BTreeMap<String, LimitFactory> = BTreeMap::new();
    for base in bases.iter().rev() {
        inherited_features.extend(base.features.iter().map(|(n, f)| (n.as_str(), f)));
        inherited_actions.extend(base.actions.iter().map(|(n, a)| (n.as_str(), a)));
        subsystems.extend(base.subsystems.iter().map(|(n, s)| (n.clone(), s.clone())));
        channels.extend(base.channels.iter().map(|(n, s)| (n.clone(), s.clone())));
        limits.extend(base.limits.iter().map(|(n, l)| (n.clone(), l.clone())));
    }
    limits.extend(std::mem::take(&mut body.limits));

    // Subparts.
    for mut decl in std::mem::take(&mut body.subparts) {
        let registry = match decl.kind() {
            SubpartKind::Subsystem => &mut subsystems,
            SubpartKind::Channel => &mut channels,
        };
        if let Some(ancestor) = registry.get(decl.name()) {
            decl.update_from_ancestor(ancestor);
        }
        let name = decl.name().to_string();
        let subpart = build_subpart(&class_name, decl, supports_enabling)?;
        registry.insert(name, subpart);
    }

    // Overrides of inherited members.
    for (name, patch) in std::mem::take(&mut body.feature_patches) {
        let source = features
            .get(&name)
            .or_else(|| inherited_features.get(name.as_str()).copied())
            .ok_or_else(|| unknown(&class_name, &name))?;
        let patched = source.customize(|kwargs| patch(kwargs))?;
        debug!(class = %class_name, feature = %name, "feature overridden with set_feat");
        features.insert(name, patched);
    }
    for (name, patch) in std::mem::take(&mut body.action_patches) {
        let source = actions
            .get(&name)
            .or_else(|| inherited_actions.get(name.as_str()).copied())
            .ok_or_else(|| unknown(&class_name, &name))?;
        let patched = source.customize(|kwargs| patch(kwargs))?;
        debug!(class = %class_name, action = %name, "action overridden with set_action");
        actions.insert(name, patched);
    }

    // Clone what is still shared with a base.
    for (name, feat) in inherited_features {
        if !features.contains_key(name) && !actions.contains_key(name) {
            features.insert(name.to_string(), feat.clone_feature()?);
        }
    }
    for (name, action) in inherited_actions {
        if !actions.contains_key(name) && !features.contains_key(name) {
            actions.insert(name.to_string(), action.clone_action()?);
        }
    }

    for customizer in std::mem::take(&mut body.customizers) {
        apply_customizer(&class_name, &mut features, &mut actions, customizer)?;
    }

    for (name, feat) in features.iter_mut() {
        feat.make_doc(body.docs.get(name).map(String::as_str));
    }
    for (name, action) in actions.iter_mut() {
        action.make_doc(body.docs.get(name).map(String::as_str));
    }

    let version = body
        .version
        .take()
        .or_else(|| bases.iter().find_map(|b| b.version.clone()));
    debug!(
        class = %class_name,
        ?kind,
        features = features.len(),
        actions = actions.len(),
        subsystems = subsystems.len(),
        channels = channels.len(),
        "class built"
    );
    Ok(Arc::new(DriverClass {
        name: class_name,
        kind,
        version,
        doc: body.doc.take().map(|d| d.trim().to_string()).unwrap_or_default(),
        bases,
        features,
        actions,
        subsystems,
        channels,
        limits,
        enabling,
    }))
}

fn build_subpart(parent: &str, decl: SubpartDecl, parent_enabling: bool) -> DaqResult<Subpart> {
    let SubpartDecl {
        kind,
        checks,
        options,
        available,
        aliases,
        mut body,
    } = decl;
    let attribute = body.name.clone();
    if kind == SubpartKind::Channel && available.is_none() {
        return Err(DaqError::MissingChannelListing(format!("{parent}.{attribute}")));
    }
    let options_checker = options.as_deref().map(Checker::parse).transpose()?;
    let enabling = match &checks {
        Some(checks) => Enabling::Checks(Checker::parse(checks)?),
        None => body
            .bases
            .iter()
            .map(|b| b.enabling.clone())
            .find(|e| !matches!(e, Enabling::Never))
            .unwrap_or(if parent_enabling {
                Enabling::Parent
            } else {
                Enabling::Never
            }),
    };
    body.name = format!("{parent}{}", camel_case(&attribute));
    let class_kind = match kind {
        SubpartKind::Subsystem => ClassKind::Subsystem,
        SubpartKind::Channel => ClassKind::Channel,
    };
    let class = build_class(body, class_kind, enabling)?;
    Ok(Subpart {
        kind,
        class,
        checks,
        options,
        options_checker,
        available,
        aliases,
    })
}

fn add_feature_guard(feat: &mut Feature) -> DaqResult<()> {
    feat.modify_behavior(
        FeatureStage::PreGet,
        Some(FeatureFn::check(enabling_get)),
        Specifier::Prepend,
        ENABLING_ID,
        false,
    )?;
    feat.modify_behavior(
        FeatureStage::PreSet,
        Some(FeatureFn::transform(enabling_set)),
        Specifier::Prepend,
        ENABLING_ID,
        false,
    )
}

fn apply_customizer(
    class: &str,
    features: &mut BTreeMap<String, Feature>,
    actions: &mut BTreeMap<String, Action>,
    customizer: Customizer,
) -> DaqResult<()> {
    let Customizer {
        target,
        stage,
        specifier,
        id,
        func,
    } = customizer;
    let mismatch = |expected: &str| DaqError::SignatureMismatch {
        stage: format!("{target}.{stage}"),
        expected: expected.to_string(),
    };
    if let Some(feat) = features.get_mut(&target) {
        let func = match func {
            Some(CustomFn::Feature(f)) => Some(f),
            Some(CustomFn::Action(_)) => return Err(mismatch("a feature function")),
            None => None,
        };
        let stage: FeatureStage = stage.parse()?;
        return feat.modify_behavior(stage, func, specifier, &id, false);
    }
    if let Some(action) = actions.get_mut(&target) {
        let func = match func {
            Some(CustomFn::Action(f)) => Some(f),
            Some(CustomFn::Feature(_)) => return Err(mismatch("an action function")),
            None => None,
        };
        let stage: ActionStage = stage.parse()?;
        return action.modify_behavior(stage, func, specifier, &id, false);
    }
    Err(unknown(class, &target))
}

fn unknown(class: &str, name: &str) -> DaqError {
    DaqError::UnknownMember {
        owner: class.to_string(),
        name: name.to_string(),
    }
}

fn duplicate(class: &str, name: &str) -> DaqError {
    DaqError::Configuration(format!("{class} declares '{name}' more than once"))
}
