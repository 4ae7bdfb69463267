//! Method composition and the customization protocol.
//!
//! Features and actions expose their behavior as named pipeline stages
//! (`pre_get`, `post_set`, `call`, ...). Each stage holds a [`Slot`]: either a
//! single base function or a [`MethodComposer`] chaining several named
//! fragments. Driver authors edit those stages through
//! [`SupportMethodCustomization::modify_behavior`], and every non-internal edit
//! is written to a [`Customs`] log so it can be replayed onto a clone with
//! [`SupportMethodCustomization::copy_custom_behaviors`].
//!
//! # Example
//!
//! ```rust,ignore
//! let mut composer = MethodComposer::new("pre_set", "feat", &["value"], "old", base);
//! composer.append("a", fa)?;
//! composer.prepend("b", fb)?;
//! composer.add_after("old", "c", fc)?;
//! assert_eq!(composer.names(), ["b", "old", "c", "a"]);
//! ```

use std::fmt;

use tracing::debug;

use crate::error::{DaqError, DaqResult};

/// Id given to the base fragment of a stage.
pub const BASE_ID: &str = "old";

// =============================================================================
// Specifier
// =============================================================================

/// How a modification is applied to a pipeline stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Specifier {
    /// Replace the whole stage.
    Override,
    /// Run first.
    Prepend,
    /// Run last.
    Append,
    /// Run right before the fragment with the given id.
    AddBefore(String),
    /// Run right after the fragment with the given id.
    AddAfter(String),
    /// Replace the fragment with the given id.
    Replace(String),
    /// Remove the fragment with the given id.
    Remove(String),
}

impl Specifier {
    /// Build a specifier from its operation name and optional anchor.
    ///
    /// An empty operation means a full override.
    pub fn parse(op: &str, anchor: Option<&str>) -> DaqResult<Self> {
        let anchored = |make: fn(String) -> Specifier| {
            anchor
                .filter(|a| !a.is_empty())
                .map(|a| make(a.to_string()))
                .ok_or_else(|| DaqError::InvalidSpecifier(format!("'{op}' requires an anchor id")))
        };
        match op {
            "" => Ok(Specifier::Override),
            "prepend" => Ok(Specifier::Prepend),
            "append" => Ok(Specifier::Append),
            "add_before" => anchored(Specifier::AddBefore),
            "add_after" => anchored(Specifier::AddAfter),
            "replace" => anchored(Specifier::Replace),
            "remove" => anchored(Specifier::Remove),
            other => Err(DaqError::InvalidSpecifier(format!(
                "unknown operation '{other}'"
            ))),
        }
    }

    /// Fragment id the specifier refers to, if any.
    pub fn anchor(&self) -> Option<&str> {
        match self {
            Specifier::AddBefore(a)
            | Specifier::AddAfter(a)
            | Specifier::Replace(a)
            | Specifier::Remove(a) => Some(a),
            _ => None,
        }
    }

    /// Operations that add a new fragment to the stage.
    pub fn is_insertion(&self) -> bool {
        matches!(
            self,
            Specifier::Prepend
                | Specifier::Append
                | Specifier::AddBefore(_)
                | Specifier::AddAfter(_)
        )
    }
}

impl fmt::Display for Specifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Specifier::Override => f.write_str("override"),
            Specifier::Prepend => f.write_str("prepend"),
            Specifier::Append => f.write_str("append"),
            Specifier::AddBefore(a) => write!(f, "add_before({a})"),
            Specifier::AddAfter(a) => write!(f, "add_after({a})"),
            Specifier::Replace(a) => write!(f, "replace({a})"),
            Specifier::Remove(a) => write!(f, "remove({a})"),
        }
    }
}

// =============================================================================
// MethodComposer
// =============================================================================

/// Ordered list of named fragments executed as one stage.
///
/// The fragment functions are shared between clones; the name and method
/// lists are not.
#[derive(Clone)]
pub struct MethodComposer<F> {
    stage: String,
    alias: String,
    chain_on: Vec<String>,
    names: Vec<String>,
    methods: Vec<F>,
}

impl<F: Clone> MethodComposer<F> {
    /// Create a composer holding `func` under `id`.
    pub fn new(stage: &str, alias: &str, chain_on: &[&str], id: &str, func: F) -> Self {
        Self {
            stage: stage.to_string(),
            alias: alias.to_string(),
            chain_on: chain_on.iter().map(|s| s.to_string()).collect(),
            names: vec![id.to_string()],
            methods: vec![func],
        }
    }

    /// Fragment ids in execution order.
    pub fn names(&self) -> &[String] {
        &self.names
    }

    /// Fragments in execution order.
    pub fn methods(&self) -> &[F] {
        &self.methods
    }

    /// Number of fragments.
    pub fn len(&self) -> usize {
        self.names.len()
    }

    /// Whether every fragment was removed.
    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// Whether a fragment is registered under `id`.
    pub fn contains(&self, id: &str) -> bool {
        self.names.iter().any(|n| n == id)
    }

    /// Fragment registered under `id`.
    pub fn get(&self, id: &str) -> Option<&F> {
        self.index(id).ok().map(|i| &self.methods[i])
    }

    /// Human readable description of the composed call.
    pub fn signature(&self) -> String {
        if self.chain_on.is_empty() {
            format!("{}({}, driver)", self.stage, self.alias)
        } else {
            let chained = self.chain_on.join(", ");
            format!("{}({}, driver, {chained}) -> {chained}", self.stage, self.alias)
        }
    }

    /// Insert `func` first.
    pub fn prepend(&mut self, id: &str, func: F) -> DaqResult<()> {
        self.insert_at(0, id, func)
    }

    /// Insert `func` last.
    pub fn append(&mut self, id: &str, func: F) -> DaqResult<()> {
        let end = self.names.len();
        self.insert_at(end, id, func)
    }

    /// Insert `func` right before `anchor`.
    pub fn add_before(&mut self, anchor: &str, id: &str, func: F) -> DaqResult<()> {
        let index = self.index(anchor)?;
        self.insert_at(index, id, func)
    }

    /// Insert `func` right after `anchor`.
    pub fn add_after(&mut self, anchor: &str, id: &str, func: F) -> DaqResult<()> {
        let index = self.index(anchor)?;
        self.insert_at(index + 1, id, func)
    }

    /// Swap the fragment registered under `id`.
    pub fn replace(&mut self, id: &str, func: F) -> DaqResult<()> {
        let index = self.index(id)?;
        self.methods[index] = func;
        Ok(())
    }

    /// Drop the fragment registered under `id`.
    pub fn remove(&mut self, id: &str) -> DaqResult<()> {
        let index = self.index(id)?;
        self.names.remove(index);
        self.methods.remove(index);
        Ok(())
    }

    fn index(&self, id: &str) -> DaqResult<usize> {
        self.names
            .iter()
            .position(|n| n == id)
            .ok_or_else(|| DaqError::MissingAnchor {
                stage: self.stage.clone(),
                anchor: id.to_string(),
            })
    }

    fn insert_at(&mut self, index: usize, id: &str, func: F) -> DaqResult<()> {
        if self.contains(id) {
            return Err(DaqError::DuplicateModification {
                stage: self.stage.clone(),
                id: id.to_string(),
            });
        }
        self.names.insert(index, id.to_string());
        self.methods.insert(index, func);
        Ok(())
    }
}

impl<F> fmt::Debug for MethodComposer<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MethodComposer")
            .field("stage", &self.stage)
            .field("names", &self.names)
            .finish()
    }
}

// =============================================================================
// Slot
// =============================================================================

/// Content of one pipeline stage.
#[derive(Clone)]
pub enum Slot<F> {
    /// A single function. `trivial` marks the framework's no-op defaults.
    Base {
        /// Fragment id, `"old"` unless an insertion replaced a trivial default.
        id: String,
        /// The function.
        func: F,
        /// Whether this is a framework no-op.
        trivial: bool,
    },
    /// Several named fragments.
    Composed(MethodComposer<F>),
}

impl<F: Clone> Slot<F> {
    /// A base function registered as `"old"`.
    pub fn base(func: F) -> Self {
        Slot::Base {
            id: BASE_ID.to_string(),
            func,
            trivial: false,
        }
    }

    /// A no-op default; the first insertion into it simply replaces it.
    pub fn trivial(func: F) -> Self {
        Slot::Base {
            id: BASE_ID.to_string(),
            func,
            trivial: true,
        }
    }

    /// Whether the stage still holds its no-op default.
    pub fn is_trivial(&self) -> bool {
        matches!(self, Slot::Base { trivial: true, .. })
    }

    /// Whether the stage chains several fragments.
    pub fn is_composed(&self) -> bool {
        matches!(self, Slot::Composed(_))
    }

    /// Fragment ids in execution order.
    pub fn names(&self) -> Vec<String> {
        match self {
            Slot::Base { id, .. } => vec![id.clone()],
            Slot::Composed(c) => c.names().to_vec(),
        }
    }

    /// Fragments in execution order.
    pub fn fragments(&self) -> std::slice::Iter<'_, F> {
        match self {
            Slot::Base { func, .. } => std::slice::from_ref(func).iter(),
            Slot::Composed(c) => c.methods().iter(),
        }
    }

    /// Apply an already analysed edit.
    ///
    /// `Override` installs `func` as the new base under `id` (or `"old"` when
    /// `id` is empty). Any other specifier turns the slot into a composer. The
    /// slot is left untouched when the edit fails.
    pub fn apply(
        &mut self,
        stage: &str,
        alias: &str,
        chain_on: &[&str],
        spec: &Specifier,
        id: &str,
        func: Option<F>,
    ) -> DaqResult<()> {
        let require = |func: Option<F>| {
            func.ok_or_else(|| {
                DaqError::InvalidSpecifier(format!("{spec} on {stage} requires a function"))
            })
        };
        if *spec == Specifier::Override {
            *self = Slot::Base {
                id: if id.is_empty() { BASE_ID } else { id }.to_string(),
                func: require(func)?,
                trivial: false,
            };
            return Ok(());
        }

        let mut composer = match self {
            Slot::Base { id, func, .. } => {
                MethodComposer::new(stage, alias, chain_on, id, func.clone())
            }
            Slot::Composed(c) => c.clone(),
        };
        match spec {
            Specifier::Prepend => composer.prepend(id, require(func)?)?,
            Specifier::Append => composer.append(id, require(func)?)?,
            Specifier::AddBefore(anchor) => composer.add_before(anchor, id, require(func)?)?,
            Specifier::AddAfter(anchor) => composer.add_after(anchor, id, require(func)?)?,
            Specifier::Replace(target) => composer.replace(target, require(func)?)?,
            Specifier::Remove(target) => composer.remove(target)?,
            Specifier::Override => {}
        }
        *self = Slot::Composed(composer);
        Ok(())
    }
}

impl<F> fmt::Debug for Slot<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Slot::Base { id, trivial, .. } => f
                .debug_struct("Base")
                .field("id", id)
                .field("trivial", trivial)
                .finish(),
            Slot::Composed(c) => c.fmt(f),
        }
    }
}

// =============================================================================
// Customs (edit log)
// =============================================================================

/// One recorded anchored modification.
#[derive(Clone)]
pub struct Modification<F> {
    /// Id of the fragment added, replaced or removed.
    pub id: String,
    /// New fragment; `None` for removals.
    pub func: Option<F>,
    /// Where the fragment goes.
    pub specifier: Specifier,
}

/// Edits recorded for a single stage.
#[derive(Clone)]
pub enum StageRecord<F> {
    /// The stage was replaced outright.
    Replaced(F),
    /// Ordered composer edits, applied on top of `base` when the stage was
    /// replaced before being edited.
    Modified {
        /// Replacement installed before the edits.
        base: Option<F>,
        /// Edits in the order they were made.
        edits: Vec<Modification<F>>,
    },
}

/// Ordered per-stage log of user edits.
#[derive(Clone)]
pub struct Customs<S, F> {
    records: Vec<(S, StageRecord<F>)>,
}

impl<S, F> Default for Customs<S, F> {
    fn default() -> Self {
        Self {
            records: Vec::new(),
        }
    }
}

impl<S: Copy + PartialEq, F: Clone> Customs<S, F> {
    /// Whether nothing was recorded.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Record of one stage.
    pub fn get(&self, stage: S) -> Option<&StageRecord<F>> {
        self.records.iter().find(|(s, _)| *s == stage).map(|(_, r)| r)
    }

    /// Records in the order stages were first edited.
    pub fn iter(&self) -> impl Iterator<Item = &(S, StageRecord<F>)> {
        self.records.iter()
    }

    /// Ids of the modifications recorded for `stage`.
    pub fn ids(&self, stage: S) -> Vec<&str> {
        match self.get(stage) {
            Some(StageRecord::Modified { base, edits }) => base
                .iter()
                .map(|_| BASE_ID)
                .chain(edits.iter().map(|m| m.id.as_str()))
                .collect(),
            Some(StageRecord::Replaced(_)) => vec![BASE_ID],
            None => Vec::new(),
        }
    }

    /// Log an edit exactly as it was requested.
    pub fn record(&mut self, stage: S, id: &str, func: Option<F>, spec: &Specifier) {
        if *spec == Specifier::Override {
            if let Some(func) = func {
                self.set(stage, StageRecord::Replaced(func));
            }
            return;
        }

        let (mut base, mut mods) = match self.take(stage) {
            None => (None, Vec::new()),
            Some(StageRecord::Replaced(old)) => (Some(old), Vec::new()),
            Some(StageRecord::Modified { base, edits }) => (base, edits),
        };
        match spec {
            Specifier::Replace(target)
                if target == BASE_ID && base.is_some() && !mods.iter().any(|m| m.id == *target) =>
            {
                if func.is_some() {
                    base = func;
                }
            }
            Specifier::Remove(target) => match mods.iter().position(|m| m.id == *target) {
                Some(index) => {
                    mods.remove(index);
                }
                None => mods.push(Modification {
                    id: target.clone(),
                    func: None,
                    specifier: spec.clone(),
                }),
            },
            Specifier::Replace(target) => match mods.iter().position(|m| m.id == *target) {
                Some(index) => mods[index].func = func,
                None => mods.push(Modification {
                    id: target.clone(),
                    func,
                    specifier: spec.clone(),
                }),
            },
            _ => mods.push(Modification {
                id: id.to_string(),
                func,
                specifier: spec.clone(),
            }),
        }
        self.set(stage, StageRecord::Modified { base, edits: mods });
    }

    fn take(&mut self, stage: S) -> Option<StageRecord<F>> {
        let index = self.records.iter().position(|(s, _)| *s == stage)?;
        Some(self.records.remove(index).1)
    }

    fn set(&mut self, stage: S, record: StageRecord<F>) {
        match self.records.iter().position(|(s, _)| *s == stage) {
            Some(index) => self.records[index].1 = record,
            None => self.records.push((stage, record)),
        }
    }
}

impl<S: fmt::Debug, F> fmt::Debug for Customs<S, F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut map = f.debug_map();
        for (stage, record) in &self.records {
            match record {
                StageRecord::Replaced(_) => map.entry(stage, &"replaced"),
                StageRecord::Modified { base, edits } => map.entry(
                    stage,
                    &base
                        .iter()
                        .map(|_| format!("{BASE_ID}: override"))
                        .chain(edits.iter().map(|m| format!("{}: {}", m.id, m.specifier)))
                        .collect::<Vec<_>>(),
                ),
            };
        }
        map.finish()
    }
}

// =============================================================================
// Customization protocol
// =============================================================================

/// Objects whose pipeline stages can be edited and whose edits can be replayed.
pub trait SupportMethodCustomization {
    /// Pipeline stage identifier.
    type Stage: Copy + PartialEq + fmt::Display;
    /// Fragment function type accepted by the stages.
    type Func: Clone;

    /// Edits recorded so far.
    fn customs(&self) -> &Customs<Self::Stage, Self::Func>;

    /// Mutable access to the edit log.
    fn customs_mut(&mut self) -> &mut Customs<Self::Stage, Self::Func>;

    /// Fragment ids currently installed on `stage`.
    fn stage_names(&self, stage: Self::Stage) -> Vec<String>;

    /// Check that `func` fits `stage` and return the specifier to apply.
    ///
    /// An insertion into a stage that only holds a trivial default is
    /// simplified to an override. The fragment then keeps the modification
    /// id rather than `"old"`: a no-op default has no behavior worth
    /// anchoring on, while later edits can still anchor on the id the author
    /// chose. Anchoring on `"old"` in such a stage fails with
    /// [`DaqError::MissingAnchor`] when the edit is made.
    fn analyse_function(
        &self,
        stage: Self::Stage,
        func: Option<&Self::Func>,
        spec: &Specifier,
    ) -> DaqResult<Specifier>;

    /// Apply an analysed edit to the stage.
    fn apply_edit(
        &mut self,
        stage: Self::Stage,
        func: Option<Self::Func>,
        spec: &Specifier,
        id: &str,
    ) -> DaqResult<()>;

    /// Modify one pipeline stage and record the edit unless it is internal.
    fn modify_behavior(
        &mut self,
        stage: Self::Stage,
        func: Option<Self::Func>,
        spec: Specifier,
        id: &str,
        internal: bool,
    ) -> DaqResult<()> {
        let analysed = self.analyse_function(stage, func.as_ref(), &spec)?;
        let apply_id = if spec == Specifier::Override { "" } else { id };
        self.apply_edit(stage, func.clone(), &analysed, apply_id)?;
        debug!(%stage, id, specifier = %spec, internal, "modified behavior");
        if !internal {
            self.customs_mut().record(stage, id, func, &spec);
        }
        Ok(())
    }

    /// Replay the edits recorded on `source` onto `self`.
    ///
    /// A stage that was replaced and then edited gets the replacement first,
    /// so the edits land on the same base as on `source`.
    ///
    /// Anchored edits whose anchor is missing here are relocated: the
    /// source ordering is walked from the edit's own position (backward for
    /// `add_after` and `replace`, forward for `add_before`) until a fragment
    /// also present on `self` is found. Without a common fragment, `add_after`
    /// becomes `append` and `add_before`/`replace` become `prepend`. Removing a
    /// fragment that does not exist here is skipped.
    fn copy_custom_behaviors(&mut self, source: &Self) -> DaqResult<()>
    where
        Self: Sized,
    {
        let records: Vec<(Self::Stage, StageRecord<Self::Func>)> =
            source.customs().iter().cloned().collect();
        for (stage, record) in records {
            let mods = match record {
                StageRecord::Replaced(func) => {
                    self.modify_behavior(stage, Some(func), Specifier::Override, "", false)?;
                    continue;
                }
                StageRecord::Modified { base, edits } => {
                    if let Some(func) = base {
                        self.modify_behavior(stage, Some(func), Specifier::Override, "", false)?;
                    }
                    edits
                }
            };
            let theirs = source.stage_names(stage);
            for m in mods {
                let ours = self.stage_names(stage);
                let spec = match &m.specifier {
                    Specifier::Remove(target) if !ours.contains(target) => {
                        debug!(%stage, id = %target, "skipping removal of absent fragment");
                        continue;
                    }
                    Specifier::AddAfter(anchor)
                    | Specifier::AddBefore(anchor)
                    | Specifier::Replace(anchor)
                        if !ours.contains(anchor) =>
                    {
                        relocate(&m.specifier, &m.id, &theirs, &ours)
                    }
                    other => other.clone(),
                };
                self.modify_behavior(stage, m.func, spec, &m.id, false)?;
            }
        }
        Ok(())
    }
}

/// Fallback position for an edit whose anchor vanished.
fn relocate(spec: &Specifier, id: &str, theirs: &[String], ours: &[String]) -> Specifier {
    let backward = !matches!(spec, Specifier::AddBefore(_));
    let found = theirs.iter().position(|n| n == id).and_then(|start| {
        let candidates: Box<dyn Iterator<Item = &String>> = if backward {
            Box::new(theirs[..start].iter().rev())
        } else {
            Box::new(theirs[start + 1..].iter())
        };
        candidates.filter(|n| *n != id).find(|n| ours.contains(n)).cloned()
    });
    match (spec, found) {
        (Specifier::AddBefore(_), Some(anchor)) => Specifier::AddBefore(anchor),
        (_, Some(anchor)) => Specifier::AddAfter(anchor),
        (Specifier::AddAfter(_), None) => Specifier::Append,
        (_, None) => Specifier::Prepend,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    type Frag = Arc<dyn Fn(i64) -> i64 + Send + Sync>;

    fn frag(f: impl Fn(i64) -> i64 + Send + Sync + 'static) -> Frag {
        Arc::new(f)
    }

    fn run(slot: &Slot<Frag>, input: i64) -> i64 {
        slot.fragments().fold(input, |acc, f| f(acc))
    }

    #[test]
    fn test_composer_ordering() {
        let mut composer = MethodComposer::new("pre_set", "feat", &["value"], "old", frag(|v| v));
        composer.append("a", frag(|v| v)).unwrap();
        composer.prepend("b", frag(|v| v)).unwrap();
        composer.add_after("old", "c", frag(|v| v)).unwrap();
        assert_eq!(composer.names(), ["b", "old", "c", "a"]);
        composer.add_before("b", "d", frag(|v| v)).unwrap();
        assert_eq!(composer.names(), ["d", "b", "old", "c", "a"]);
    }

    #[test]
    fn test_composer_rejects_duplicates_and_missing_anchors() {
        let mut composer = MethodComposer::new("post_get", "feat", &["value"], "old", frag(|v| v));
        composer.append("a", frag(|v| v)).unwrap();
        assert!(matches!(
            composer.append("a", frag(|v| v)),
            Err(DaqError::DuplicateModification { .. })
        ));
        assert!(matches!(
            composer.add_after("missing", "x", frag(|v| v)),
            Err(DaqError::MissingAnchor { .. })
        ));
        assert!(composer.remove("missing").is_err());
        assert!(composer.replace("missing", frag(|v| v)).is_err());
        assert_eq!(composer.names(), ["old", "a"]);
    }

    #[test]
    fn test_composer_clone_is_independent() {
        let mut original = MethodComposer::new("pre_set", "feat", &["value"], "old", frag(|v| v + 1));
        let mut copy = original.clone();
        copy.append("double", frag(|v| v * 2)).unwrap();
        original.remove("old").unwrap();
        assert_eq!(copy.names(), ["old", "double"]);
        assert!(original.is_empty());
    }

    #[test]
    fn test_slot_value_threading() {
        let mut slot = Slot::base(frag(|v| v + 1));
        slot.apply("post_get", "feat", &["value"], &Specifier::Append, "double", Some(frag(|v| v * 2)))
            .unwrap();
        slot.apply("post_get", "feat", &["value"], &Specifier::Prepend, "ten", Some(frag(|v| v + 10)))
            .unwrap();
        assert_eq!(slot.names(), ["ten", "old", "double"]);
        assert_eq!(run(&slot, 0), 22);

        slot.apply("post_get", "feat", &["value"], &Specifier::Replace("old".into()), "", Some(frag(|v| v)))
            .unwrap();
        assert_eq!(run(&slot, 0), 20);
    }

    #[test]
    fn test_failed_edit_leaves_slot_untouched() {
        let mut slot = Slot::base(frag(|v| v));
        let err = slot.apply(
            "pre_get",
            "feat",
            &[],
            &Specifier::AddAfter("checks".into()),
            "custom",
            Some(frag(|v| v)),
        );
        assert!(err.is_err());
        assert!(!slot.is_composed());
    }

    #[test]
    fn test_specifier_parsing() {
        assert_eq!(Specifier::parse("", None).unwrap(), Specifier::Override);
        assert_eq!(
            Specifier::parse("add_after", Some("old")).unwrap(),
            Specifier::AddAfter("old".into())
        );
        assert!(Specifier::parse("add_after", None).is_err());
        assert!(Specifier::parse("insert", None).is_err());
    }

    #[test]
    fn test_customs_recording() {
        let mut customs: Customs<&'static str, Frag> = Customs::default();
        customs.record("post_get", "", Some(frag(|v| v)), &Specifier::Override);
        customs.record("post_get", "a", Some(frag(|v| v)), &Specifier::Append);
        assert_eq!(customs.ids("post_get"), vec!["old", "a"]);

        customs.record("post_get", "", None, &Specifier::Remove("a".into()));
        assert_eq!(customs.ids("post_get"), vec!["old"]);

        customs.record("post_get", "", None, &Specifier::Remove("validate".into()));
        customs.record("post_get", "", Some(frag(|v| v)), &Specifier::Replace("cast".into()));
        assert_eq!(customs.ids("post_get"), vec!["old", "validate", "cast"]);
    }

    #[test]
    fn test_customs_keep_replaced_base() {
        let mut customs: Customs<&'static str, Frag> = Customs::default();
        customs.record("post_set", "", Some(frag(|v| v + 1)), &Specifier::Override);
        customs.record("post_set", "log", Some(frag(|v| v * 2)), &Specifier::Append);
        match customs.get("post_set") {
            Some(StageRecord::Modified { base: Some(base), edits }) => {
                assert_eq!(base(1), 2);
                assert_eq!(edits.len(), 1);
                assert_eq!(edits[0].specifier, Specifier::Append);
            }
            _ => panic!("expected edits over a replaced base"),
        }

        customs.record("post_set", "", Some(frag(|v| v + 10)), &Specifier::Replace("old".into()));
        assert_eq!(customs.ids("post_set"), vec!["old", "log"]);
        match customs.get("post_set") {
            Some(StageRecord::Modified { base: Some(base), .. }) => assert_eq!(base(1), 11),
            _ => panic!("base lost on replace"),
        }
    }

    #[test]
    fn test_relocate_walks_source_order() {
        let theirs: Vec<String> = ["checks", "validate", "custom"].iter().map(|s| s.to_string()).collect();
        let ours: Vec<String> = vec!["checks".into()];
        assert_eq!(
            relocate(&Specifier::AddAfter("validate".into()), "custom", &theirs, &ours),
            Specifier::AddAfter("checks".into())
        );
        assert_eq!(
            relocate(&Specifier::AddAfter("validate".into()), "custom", &theirs, &[]),
            Specifier::Append
        );
        let theirs: Vec<String> = ["custom", "validate", "map"].iter().map(|s| s.to_string()).collect();
        assert_eq!(
            relocate(&Specifier::AddBefore("validate".into()), "custom", &theirs, &["map".to_string()]),
            Specifier::AddBefore("map".into())
        );
        assert_eq!(
            relocate(&Specifier::AddBefore("validate".into()), "custom", &theirs, &[]),
            Specifier::Prepend
        );
    }
}
