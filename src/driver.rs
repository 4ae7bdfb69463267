//! Driver instances.
//!
//! A [`Driver`] owns the whole tree of its subsystem and channel instances in
//! an arena; a [`Node`] is a cheap copyable handle (driver reference plus
//! arena index) through which features are read and written and actions are
//! called. Children only know the index of their parent, so the tree holds no
//! reference cycles.
//!
//! All nodes share the driver's reentrant lock. The arena itself sits behind a
//! separate mutex that is only held for short bookkeeping sections, never
//! while a pipeline or a backend call runs.
//!
//! # Example
//!
//! ```rust,ignore
//! let driver = Driver::new(class, Arc::new(backend), DriverConfig::default())?;
//! driver.set("freq", 10.0)?;
//! let level = driver.subsystem("output")?.get("level")?;
//! for channel in driver.channels("input")?.iter()? {
//!     channel.set("range", 2)?;
//! }
//! ```

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::ops::Deref;
use std::sync::{Arc, Weak};
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, ReentrantMutex, ReentrantMutexGuard};
use tracing::{debug, info, trace, warn};

use crate::actions::Args;
use crate::backend::{Backend, CommandKwargs};
use crate::checks::{check_options, Checker};
use crate::class::{ClassKind, DriverClass, Enabling, Subpart};
use crate::config::DriverConfig;
use crate::error::{DaqError, DaqResult};
use crate::features::Feature;
use crate::limits::LimitsValidator;
use crate::value::{ChannelId, Value};

// =============================================================================
// Instance tree
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum ChildKey {
    Subsystem(String),
    Channel(String, ChannelId),
}

/// Runtime state of one driver, subsystem or channel instance.
struct NodeState {
    class: Arc<DriverClass>,
    parent: Option<usize>,
    attribute: String,
    channel_id: Option<ChannelId>,
    use_cache: bool,
    cache: HashMap<String, Vec<Value>>,
    settings: HashMap<String, BTreeMap<String, Value>>,
    last_set: HashMap<String, Instant>,
    limits: HashMap<String, Arc<LimitsValidator>>,
    options: HashMap<String, (bool, String)>,
    children: HashMap<ChildKey, usize>,
    enabling_in_progress: bool,
}

impl NodeState {
    fn new(
        class: Arc<DriverClass>,
        parent: Option<usize>,
        attribute: &str,
        channel_id: Option<ChannelId>,
        use_cache: bool,
    ) -> Self {
        Self {
            class,
            parent,
            attribute: attribute.to_string(),
            channel_id,
            use_cache,
            cache: HashMap::new(),
            settings: HashMap::new(),
            last_set: HashMap::new(),
            limits: HashMap::new(),
            options: HashMap::new(),
            children: HashMap::new(),
            enabling_in_progress: false,
        }
    }
}

struct Tree {
    nodes: Vec<NodeState>,
}

/// Dotted names split by the instance they address.
struct PathGroups<'s> {
    own: Vec<&'s str>,
    parent: Vec<&'s str>,
    children: BTreeMap<&'s str, Vec<&'s str>>,
}

/// `""` before the first dot addresses the parent, any other prefix a
/// subsystem or every instance of a channel.
fn group_paths<'s>(names: &[&'s str]) -> PathGroups<'s> {
    let mut groups = PathGroups {
        own: Vec::new(),
        parent: Vec::new(),
        children: BTreeMap::new(),
    };
    for &name in names {
        match name.split_once('.') {
            Some(("", rest)) => groups.parent.push(rest),
            Some((child, rest)) => groups.children.entry(child).or_default().push(rest),
            None => groups.own.push(name),
        }
    }
    groups
}

// =============================================================================
// Driver
// =============================================================================

/// One connected instrument.
pub struct Driver {
    class: Arc<DriverClass>,
    backend: Arc<dyn Backend>,
    config: DriverConfig,
    connection_id: String,
    lock: ReentrantMutex<()>,
    tree: Mutex<Tree>,
}

impl Driver {
    /// Driver over `backend`; fails on invalid config or a subpart class.
    pub fn new(class: Arc<DriverClass>, backend: Arc<dyn Backend>, config: DriverConfig) -> DaqResult<Self> {
        config.validate()?;
        if class.kind() != ClassKind::Driver {
            return Err(DaqError::Configuration(format!(
                "{} is a {:?} class and cannot be instantiated on its own",
                class.name(),
                class.kind()
            )));
        }
        let root = NodeState::new(class.clone(), None, class.name(), None, config.caching_allowed);
        info!(class = %class.name(), "driver created");
        Ok(Self {
            class,
            backend,
            config,
            connection_id: String::new(),
            lock: ReentrantMutex::new(()),
            tree: Mutex::new(Tree { nodes: vec![root] }),
        })
    }

    /// Identifier of the connection, used by [`DriverRegistry`].
    pub fn with_connection_id(mut self, connection_id: &str) -> Self {
        self.connection_id = connection_id.to_string();
        self
    }

    /// Class of the driver.
    pub fn class(&self) -> &Arc<DriverClass> {
        &self.class
    }

    /// Backend shared by every instance.
    pub fn backend(&self) -> &dyn Backend {
        self.backend.as_ref()
    }

    /// Driver configuration.
    pub fn config(&self) -> &DriverConfig {
        &self.config
    }

    /// Connection id used by the registry.
    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    /// Handle on the top level instance.
    pub fn root(&self) -> Node<'_> {
        Node {
            driver: self,
            index: 0,
        }
    }

    /// Read a root feature.
    pub fn get(&self, name: &str) -> DaqResult<Value> {
        self.root().get(name)
    }

    /// Write a root feature.
    pub fn set(&self, name: &str, value: impl Into<Value>) -> DaqResult<()> {
        self.root().set(name, value)
    }

    /// Call a root action.
    pub fn call(&self, name: &str, args: Args) -> DaqResult<Value> {
        self.root().call(name, args)
    }

    /// Root subsystem `name`.
    pub fn subsystem(&self, name: &str) -> DaqResult<Node<'_>> {
        self.root().subsystem(name)
    }

    /// Root channel container `name`.
    pub fn channels(&self, name: &str) -> DaqResult<ChannelContainer<'_>> {
        self.root().channels(name)
    }

    /// Root channel `name[id]`.
    pub fn channel(&self, name: &str, id: impl Into<ChannelId>) -> DaqResult<Node<'_>> {
        self.root().channel(name, id)
    }

    /// Clear root caches, see [`Node::clear_cache`].
    pub fn clear_cache(&self, subsystems: bool, channels: bool, features: Option<&[&str]>) {
        self.root().clear_cache(subsystems, channels, features)
    }

    /// Root caches, see [`Node::check_cache`].
    pub fn check_cache(&self, subsystems: bool, channels: bool, features: Option<&[&str]>) -> CacheSnapshot {
        self.root().check_cache(subsystems, channels, features)
    }

    /// Open the connection.
    pub fn initialize(&self) -> DaqResult<()> {
        let _guard = self.lock.lock();
        self.backend.initialize()?;
        info!(class = %self.class.name(), connection = %self.connection_id, "driver initialized");
        Ok(())
    }

    /// Close the connection. Every cached value is dropped.
    pub fn finalize(&self) -> DaqResult<()> {
        let _guard = self.lock.lock();
        self.root().clear_cache(true, true, None);
        self.backend.finalize()?;
        info!(class = %self.class.name(), connection = %self.connection_id, "driver finalized");
        Ok(())
    }

    /// Whether the backend is connected.
    pub fn is_connected(&self) -> bool {
        self.backend.is_connected()
    }

    /// Initialize now and finalize when the guard is dropped.
    pub fn session(&self) -> DaqResult<Session<'_>> {
        self.initialize()?;
        Ok(Session { driver: self })
    }
}

impl fmt::Debug for Driver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Driver")
            .field("class", &self.class.name())
            .field("connection_id", &self.connection_id)
            .field("config", &self.config)
            .finish()
    }
}

/// Scoped connection returned by [`Driver::session`].
pub struct Session<'a> {
    driver: &'a Driver,
}

impl Deref for Session<'_> {
    type Target = Driver;

    fn deref(&self) -> &Driver {
        self.driver
    }
}

impl Drop for Session<'_> {
    fn drop(&mut self) {
        if let Err(err) = self.driver.finalize() {
            warn!(class = %self.driver.class.name(), error = %err, "failed to finalize driver");
        }
    }
}

// =============================================================================
// Node
// =============================================================================

/// Handle on one instance of a driver tree.
#[derive(Clone, Copy)]
pub struct Node<'a> {
    driver: &'a Driver,
    index: usize,
}

impl<'a> Node<'a> {
    fn with_state<R>(&self, f: impl FnOnce(&mut NodeState) -> R) -> R {
        let mut tree = self.driver.tree.lock();
        f(&mut tree.nodes[self.index])
    }

    fn at(&self, index: usize) -> Node<'a> {
        Node {
            driver: self.driver,
            index,
        }
    }

    /// Driver owning this instance.
    pub fn driver(&self) -> &'a Driver {
        self.driver
    }

    /// Class of this instance.
    pub fn class(&self) -> Arc<DriverClass> {
        self.with_state(|s| s.class.clone())
    }

    /// Enclosing instance; `None` at the root.
    pub fn parent(&self) -> Option<Node<'a>> {
        self.with_state(|s| s.parent).map(|index| self.at(index))
    }

    /// Attribute name under which the parent exposes this instance.
    pub fn attribute(&self) -> String {
        self.with_state(|s| s.attribute.clone())
    }

    /// Id of this instance when it is a channel.
    pub fn channel_id(&self) -> Option<ChannelId> {
        self.with_state(|s| s.channel_id.clone())
    }

    /// Path of the instance, e.g. `Lockin.output` or `Scope.ch[2]`.
    pub fn owner_name(&self) -> String {
        let (attribute, channel_id, parent) =
            self.with_state(|s| (s.attribute.clone(), s.channel_id.clone(), s.parent));
        match (parent, channel_id) {
            (None, _) => attribute,
            (Some(parent), None) => format!("{}.{attribute}", self.at(parent).owner_name()),
            (Some(parent), Some(id)) => format!("{}.{attribute}[{id}]", self.at(parent).owner_name()),
        }
    }

    /// Driver configuration.
    pub fn config(&self) -> &'a DriverConfig {
        &self.driver.config
    }

    /// Backend shared with the driver.
    pub fn backend(&self) -> &'a dyn Backend {
        self.driver.backend.as_ref()
    }

    /// The driver wide reentrant lock.
    pub fn lock(&self) -> ReentrantMutexGuard<'a, ()> {
        self.driver.lock.lock()
    }

    fn unknown(&self, name: &str) -> DaqError {
        DaqError::UnknownMember {
            owner: self.owner_name(),
            name: name.to_string(),
        }
    }

    // -------------------------------------------------------------------------
    // Members
    // -------------------------------------------------------------------------

    /// Read a feature.
    pub fn get(&self, name: &str) -> DaqResult<Value> {
        let class = self.class();
        let feat = class.feature(name).ok_or_else(|| self.unknown(name))?;
        if let Some(options) = feat.options_checker() {
            self.check_member_options(name, options)?;
        }
        feat.get_value(self)
    }

    /// Write a feature.
    pub fn set(&self, name: &str, value: impl Into<Value>) -> DaqResult<()> {
        let class = self.class();
        let feat = class.feature(name).ok_or_else(|| self.unknown(name))?;
        if let Some(options) = feat.options_checker() {
            self.check_member_options(name, options)?;
        }
        feat.set_value(self, value.into())
    }

    /// Call an action.
    pub fn call(&self, name: &str, args: Args) -> DaqResult<Value> {
        let class = self.class();
        let action = class.action(name).ok_or_else(|| self.unknown(name))?;
        if let Some(options) = action.options_checker() {
            self.check_member_options(name, options)?;
        }
        action.call(self, args)
    }

    /// Subsystem `name` of this instance.
    pub fn subsystem(&self, name: &str) -> DaqResult<Node<'a>> {
        let class = self.class();
        let subpart = class.subsystem(name).ok_or_else(|| self.unknown(name))?;
        if let Some(options) = subpart.options_checker() {
            self.check_member_options(name, options)?;
        }
        Ok(self.child(ChildKey::Subsystem(name.to_string()), subpart.class(), name, None))
    }

    /// Channel container `name` of this instance.
    pub fn channels(&self, name: &str) -> DaqResult<ChannelContainer<'a>> {
        let class = self.class();
        let subpart = class.channel(name).ok_or_else(|| self.unknown(name))?;
        if let Some(options) = subpart.options_checker() {
            self.check_member_options(name, options)?;
        }
        Ok(ChannelContainer {
            parent: *self,
            name: name.to_string(),
            subpart: subpart.clone(),
        })
    }

    /// Channel `name[id]` of this instance.
    pub fn channel(&self, name: &str, id: impl Into<ChannelId>) -> DaqResult<Node<'a>> {
        self.channels(name)?.get(id)
    }

    fn child(
        &self,
        key: ChildKey,
        class: &Arc<DriverClass>,
        attribute: &str,
        channel_id: Option<ChannelId>,
    ) -> Node<'a> {
        let mut tree = self.driver.tree.lock();
        if let Some(&index) = tree.nodes[self.index].children.get(&key) {
            return self.at(index);
        }
        let use_cache = tree.nodes[self.index].use_cache;
        let index = tree.nodes.len();
        tree.nodes.push(NodeState::new(
            class.clone(),
            Some(self.index),
            attribute,
            channel_id,
            use_cache,
        ));
        tree.nodes[self.index].children.insert(key, index);
        debug!(class = %class.name(), attribute, "instance created");
        self.at(index)
    }

    /// Instantiated children matching `filter`.
    fn existing_children(&self, filter: impl Fn(&ChildKey) -> bool) -> Vec<Node<'a>> {
        let mut indices: Vec<usize> = self.with_state(|s| {
            s.children
                .iter()
                .filter(|(key, _)| filter(key))
                .map(|(_, &index)| index)
                .collect()
        });
        indices.sort_unstable();
        indices.into_iter().map(|index| self.at(index)).collect()
    }

    /// Instantiated subsystem `name` or instances of channel `name`.
    fn existing_targets(&self, name: &str) -> Vec<Node<'a>> {
        self.existing_children(|key| match key {
            ChildKey::Subsystem(n) | ChildKey::Channel(n, _) => n == name,
        })
    }

    // -------------------------------------------------------------------------
    // Expressions and paths
    // -------------------------------------------------------------------------

    /// Value of an identifier used in a check expression.
    ///
    /// `locals` are looked up first (`value`, action arguments). Otherwise the
    /// identifier must be a `driver.` path: `parent` walks up, subsystem
    /// names walk down and the last segment is a feature, or `id` for the
    /// channel id.
    pub fn resolve_identifier(&self, ident: &str, locals: &[(&str, Value)]) -> DaqResult<Value> {
        if let Some((_, value)) = locals.iter().find(|(name, _)| *name == ident) {
            return Ok(value.clone());
        }
        let Some(path) = ident.strip_prefix("driver.") else {
            return Err(DaqError::Configuration(format!(
                "unknown identifier '{ident}' in an expression of {}",
                self.owner_name()
            )));
        };
        let mut segments: Vec<&str> = path.split('.').collect();
        let name = segments.pop().unwrap_or_default();
        let mut node = *self;
        for segment in segments {
            node = match segment {
                "parent" => node.parent().ok_or_else(|| {
                    DaqError::Configuration(format!("{} has no parent", node.owner_name()))
                })?,
                subsystem => node.subsystem(subsystem)?,
            };
        }
        if name == "id" && node.class().feature("id").is_none() {
            return node.channel_id().map(Value::from).ok_or_else(|| {
                DaqError::Configuration(format!("{} is not a channel", node.owner_name()))
            });
        }
        node.get(name)
    }

    /// Node addressed by `segments`: `""` is the parent, other names subsystems.
    pub fn resolve_path(&self, segments: &[&str]) -> DaqResult<Node<'a>> {
        let mut node = *self;
        for segment in segments {
            node = match *segment {
                "" => node.parent().ok_or_else(|| {
                    DaqError::Configuration(format!("{} has no parent", node.owner_name()))
                })?,
                subsystem => node.subsystem(subsystem)?,
            };
        }
        Ok(node)
    }

    // -------------------------------------------------------------------------
    // Backend
    // -------------------------------------------------------------------------

    /// Named command arguments: `id` is the innermost channel id and every
    /// channel level adds `<channel>_id`.
    pub fn command_kwargs(&self) -> CommandKwargs {
        let mut kwargs = CommandKwargs::new();
        let mut current = Some(*self);
        while let Some(node) = current {
            let (attribute, channel_id, parent) =
                node.with_state(|s| (s.attribute.clone(), s.channel_id.clone(), s.parent));
            if let Some(id) = channel_id {
                let id = Value::from(id);
                kwargs.entry("id".to_string()).or_insert_with(|| id.clone());
                kwargs.entry(format!("{attribute}_id")).or_insert(id);
            }
            current = parent.map(|index| self.at(index));
        }
        kwargs
    }

    /// Run the backend get for `cmd` with retries.
    pub fn default_get_feature(&self, feat: &Feature, cmd: &str, args: &[Value]) -> DaqResult<Value> {
        self.backend()
            .default_get_feature(feat, cmd, args, &self.command_kwargs())
    }

    /// Run the backend set for `cmd` with retries.
    pub fn default_set_feature(&self, feat: &Feature, cmd: &str, args: &[Value]) -> DaqResult<Value> {
        self.backend()
            .default_set_feature(feat, cmd, args, &self.command_kwargs())
    }

    /// Ask the backend whether the last set succeeded.
    pub fn default_check_operation(
        &self,
        feat: &Feature,
        value: &Value,
        i_value: &Value,
        response: &Value,
    ) -> DaqResult<(bool, String)> {
        self.backend()
            .default_check_operation(feat, value, i_value, response)
    }

    /// Run `op`, retrying up to `retries` times on retryable communication
    /// errors. The connection is reopened before each new attempt and the
    /// last error is returned unchanged.
    pub fn with_retries<T>(
        &self,
        retries: u32,
        member: &str,
        mut op: impl FnMut() -> DaqResult<T>,
    ) -> DaqResult<T> {
        let backend = self.backend();
        let mut attempt = 0;
        loop {
            match op() {
                Ok(value) => return Ok(value),
                Err(err) => {
                    let retryable = err
                        .comm_kind()
                        .is_some_and(|kind| backend.retries_exceptions().contains(&kind));
                    if !retryable || attempt >= retries {
                        return Err(err);
                    }
                    attempt += 1;
                    warn!(
                        owner = %self.owner_name(),
                        member,
                        attempt,
                        retries,
                        error = %err,
                        "communication failed, reopening connection"
                    );
                    backend.reopen_connection()?;
                    let delay = self.config().reopen_delay();
                    if !delay.is_zero() {
                        thread::sleep(delay);
                    }
                }
            }
        }
    }

    // -------------------------------------------------------------------------
    // Cache
    // -------------------------------------------------------------------------

    /// Whether reads may be served from the cache.
    pub fn use_cache(&self) -> bool {
        self.config().caching_allowed && self.with_state(|s| s.use_cache)
    }

    /// Enable or disable caching on this instance. Disabling drops the cache.
    pub fn set_use_cache(&self, enabled: bool) {
        self.with_state(|s| {
            s.use_cache = enabled;
            if !enabled {
                s.cache.clear();
            }
        });
    }

    /// Cache entry of `name`.
    pub fn cached(&self, name: &str) -> Option<Vec<Value>> {
        if !self.use_cache() {
            return None;
        }
        self.with_state(|s| s.cache.get(name).cloned())
    }

    /// Store the cache entry of `name`.
    pub fn store_cache(&self, name: &str, entry: Vec<Value>) {
        self.with_state(|s| {
            s.cache.insert(name.to_string(), entry);
        });
    }

    /// Clear cached feature values.
    ///
    /// Without `features` the whole cache of this instance goes, then the
    /// instantiated subsystems and/or channels are cleared recursively.
    /// Feature names may be dotted paths (see [`Node::discard_limits`]).
    pub fn clear_cache(&self, subsystems: bool, channels: bool, features: Option<&[&str]>) {
        let Some(names) = features else {
            self.with_state(|s| {
                s.cache.clear();
                s.options.clear();
            });
            debug!(owner = %self.owner_name(), "cache cleared");
            let children = self.existing_children(|key| match key {
                ChildKey::Subsystem(_) => subsystems,
                ChildKey::Channel(..) => channels,
            });
            for child in children {
                child.clear_cache(subsystems, channels, None);
            }
            return;
        };

        let groups = group_paths(names);
        self.with_state(|s| {
            for name in &groups.own {
                s.cache.remove(*name);
            }
        });
        trace!(owner = %self.owner_name(), features = ?groups.own, "cache entries cleared");
        if !groups.parent.is_empty() {
            if let Some(parent) = self.parent() {
                parent.clear_cache(false, false, Some(groups.parent.as_slice()));
            }
        }
        for (child, rest) in &groups.children {
            for node in self.existing_targets(child) {
                node.clear_cache(false, false, Some(rest.as_slice()));
            }
        }
    }

    /// Copy of the cached values.
    ///
    /// Only instantiated subsystems and channels appear in the snapshot.
    pub fn check_cache(&self, subsystems: bool, channels: bool, features: Option<&[&str]>) -> CacheSnapshot {
        let class = self.class();
        let mut snapshot = CacheSnapshot::default();
        let (entries, children) = match features {
            None => {
                let entries: Vec<(String, Vec<Value>)> = self.with_state(|s| {
                    s.cache.iter().map(|(n, e)| (n.clone(), e.clone())).collect()
                });
                let children = self.existing_children(|key| match key {
                    ChildKey::Subsystem(_) => subsystems,
                    ChildKey::Channel(..) => channels,
                });
                let children: Vec<(Node<'a>, Option<Vec<&str>>)> =
                    children.into_iter().map(|c| (c, None)).collect();
                (entries, children)
            }
            Some(names) => {
                let groups = group_paths(names);
                let entries: Vec<(String, Vec<Value>)> = self.with_state(|s| {
                    groups
                        .own
                        .iter()
                        .filter_map(|n| s.cache.get(*n).map(|e| (n.to_string(), e.clone())))
                        .collect()
                });
                let mut children = Vec::new();
                for (child, rest) in groups.children {
                    for node in self.existing_targets(child) {
                        children.push((node, Some(rest.clone())));
                    }
                }
                (entries, children)
            }
        };

        for (name, entry) in entries {
            let value = match class.feature(&name) {
                Some(feat) => feat.read_cache(self, &entry),
                None => entry.last().cloned().unwrap_or_default(),
            };
            snapshot.values.insert(name, value);
        }
        for (node, rest) in children {
            let nested = match &rest {
                Some(rest) => node.check_cache(false, false, Some(rest.as_slice())),
                None => node.check_cache(subsystems, channels, None),
            };
            match node.channel_id() {
                Some(id) => {
                    snapshot
                        .channels
                        .entry(node.attribute())
                        .or_default()
                        .insert(id, nested);
                }
                None => {
                    snapshot.subsystems.insert(node.attribute(), nested);
                }
            }
        }
        snapshot
    }

    // -------------------------------------------------------------------------
    // Settings
    // -------------------------------------------------------------------------

    fn default_settings(&self, name: &str) -> DaqResult<BTreeMap<String, Value>> {
        let class = self.class();
        if let Some(feat) = class.feature(name) {
            Ok(feat.default_settings(self.config()))
        } else if let Some(action) = class.action(name) {
            Ok(action.default_settings(self.config()))
        } else {
            Err(self.unknown(name))
        }
    }

    fn with_settings<R>(&self, name: &str, f: impl FnOnce(&mut BTreeMap<String, Value>) -> R) -> DaqResult<R> {
        let defaults = if self.with_state(|s| s.settings.contains_key(name)) {
            None
        } else {
            Some(self.default_settings(name)?)
        };
        Ok(self.with_state(|s| {
            let settings = s
                .settings
                .entry(name.to_string())
                .or_insert_with(|| defaults.unwrap_or_default());
            f(settings)
        }))
    }

    /// Public settings of a feature or action.
    pub fn read_settings(&self, name: &str) -> DaqResult<BTreeMap<String, Value>> {
        self.with_settings(name, |settings| {
            settings
                .iter()
                .filter(|(key, _)| !key.starts_with('_'))
                .map(|(key, value)| (key.clone(), value.clone()))
                .collect()
        })
    }

    /// Current value of one setting of `name`.
    pub fn setting(&self, name: &str, key: &str) -> DaqResult<Value> {
        self.with_settings(name, |settings| settings.get(key).cloned())?
            .ok_or_else(|| DaqError::UnknownSetting {
                name: name.to_string(),
                key: key.to_string(),
            })
    }

    /// Change an existing setting. Keys starting with `_` are private.
    pub fn set_setting(&self, name: &str, key: &str, value: impl Into<Value>) -> DaqResult<()> {
        let value = value.into();
        self.with_settings(name, |settings| {
            if key.starts_with('_') || !settings.contains_key(key) {
                return Err(DaqError::UnknownSetting {
                    name: name.to_string(),
                    key: key.to_string(),
                });
            }
            settings.insert(key.to_string(), value);
            Ok(())
        })?
    }

    /// Change a setting until the returned guard is dropped.
    pub fn temporary_setting(
        &self,
        name: &str,
        key: &str,
        value: impl Into<Value>,
    ) -> DaqResult<TemporarySetting<'a>> {
        let previous = self.setting(name, key)?;
        self.set_setting(name, key, value)?;
        Ok(TemporarySetting {
            node: *self,
            name: name.to_string(),
            key: key.to_string(),
            previous: Some(previous),
        })
    }

    /// Whether getters of `name` attach units to their values.
    pub fn unit_return(&self, name: &str) -> bool {
        self.with_settings(name, |settings| {
            settings.get("unit_return").and_then(Value::as_bool)
        })
        .ok()
        .flatten()
        .unwrap_or(self.config().unit_return)
    }

    /// Sleep until `inter_set_delay` seconds have passed since the last set.
    pub fn wait_inter_set_delay(&self, name: &str) {
        let delay = self
            .with_settings(name, |settings| {
                settings.get("inter_set_delay").and_then(Value::as_f64)
            })
            .ok()
            .flatten()
            .unwrap_or(0.0);
        if !(delay.is_finite() && delay > 0.0) {
            return;
        }
        let Some(last) = self.with_state(|s| s.last_set.get(name).copied()) else {
            return;
        };
        let delay = Duration::from_secs_f64(delay);
        let elapsed = last.elapsed();
        if elapsed < delay {
            let wait = delay - elapsed;
            trace!(feature = name, ?wait, "waiting inter set delay");
            thread::sleep(wait);
        }
    }

    /// Record the time of a set on `name`.
    pub fn mark_set(&self, name: &str) {
        self.with_state(|s| {
            s.last_set.insert(name.to_string(), Instant::now());
        });
    }

    // -------------------------------------------------------------------------
    // Limits
    // -------------------------------------------------------------------------

    /// Limits `id`, built on first use by the closest class declaring them.
    pub fn get_limits(&self, id: &str) -> DaqResult<Arc<LimitsValidator>> {
        if let Some(limits) = self.with_state(|s| s.limits.get(id).cloned()) {
            return Ok(limits);
        }
        let class = self.class();
        match class.limit(id) {
            Some(factory) => {
                let limits = Arc::new(factory(self)?);
                self.with_state(|s| s.limits.insert(id.to_string(), limits.clone()));
                debug!(owner = %self.owner_name(), limits = id, %limits, "limits built");
                Ok(limits)
            }
            None => match self.parent() {
                Some(parent) => parent.get_limits(id),
                None => Err(DaqError::UnknownMember {
                    owner: self.owner_name(),
                    name: format!("limits '{id}'"),
                }),
            },
        }
    }

    /// Drop cached limits so they are rebuilt on next use.
    ///
    /// `.volt` addresses the parent, `output.volt` the `output` subsystem
    /// and `ch.volt` every instantiated instance of channel `ch`.
    pub fn discard_limits(&self, ids: &[&str]) {
        let groups = group_paths(ids);
        self.with_state(|s| {
            for id in &groups.own {
                s.limits.remove(*id);
            }
        });
        trace!(owner = %self.owner_name(), limits = ?groups.own, "limits discarded");
        if !groups.parent.is_empty() {
            if let Some(parent) = self.parent() {
                parent.discard_limits(&groups.parent);
            }
        }
        for (child, rest) in &groups.children {
            for node in self.existing_targets(child) {
                node.discard_limits(rest);
            }
        }
    }

    // -------------------------------------------------------------------------
    // Enabling and options
    // -------------------------------------------------------------------------

    /// Fail with `Disabled` when this instance or an enclosing subpart is
    /// disabled.
    pub fn ensure_enabled(&self, member: &str) -> DaqResult<()> {
        let mut current = Some(*self);
        while let Some(node) = current {
            let class = node.class();
            match class.enabling() {
                Enabling::Never => return Ok(()),
                Enabling::Parent => {}
                Enabling::Checks(checker) => node.evaluate_enabling(member, checker)?,
            }
            current = node.parent();
        }
        Ok(())
    }

    fn evaluate_enabling(&self, member: &str, checker: &Checker) -> DaqResult<()> {
        let _guard = self.lock();
        // Reads issued by the checks themselves are not guarded.
        if self.with_state(|s| std::mem::replace(&mut s.enabling_in_progress, true)) {
            return Ok(());
        }
        let result = checker.evaluate(|ident| self.resolve_identifier(ident, &[]));
        self.with_state(|s| s.enabling_in_progress = false);
        match result? {
            (true, _) => Ok(()),
            (false, detail) => {
                debug!(owner = %self.owner_name(), member, %detail, "member disabled");
                Err(DaqError::Disabled {
                    name: member.to_string(),
                    owner: format!("{} ({detail})", self.owner_name()),
                })
            }
        }
    }

    /// Evaluate an options expression gating `member`; the outcome is cached
    /// until the cache of this instance is cleared.
    pub fn check_member_options(&self, member: &str, checker: &Checker) -> DaqResult<()> {
        let (ok, detail) = match self.with_state(|s| s.options.get(member).cloned()) {
            Some(outcome) => outcome,
            None => {
                let mut options = BTreeMap::new();
                for ident in checker.identifiers() {
                    let Some((feature, _)) = ident.split_once('.') else {
                        continue;
                    };
                    if options.contains_key(feature) {
                        continue;
                    }
                    let owner = self.options_owner(feature)?;
                    options.insert(feature.to_string(), owner.get(feature)?);
                }
                let outcome = check_options(checker, &options)?;
                self.with_state(|s| s.options.insert(member.to_string(), outcome.clone()));
                outcome
            }
        };
        if ok {
            Ok(())
        } else {
            Err(DaqError::AccessDenied {
                name: member.to_string(),
                reason: detail,
            })
        }
    }

    /// Closest instance, this one included, declaring options feature `name`.
    fn options_owner(&self, name: &str) -> DaqResult<Node<'a>> {
        let mut current = Some(*self);
        while let Some(node) = current {
            if node.class().feature(name).is_some_and(|f| f.is_options()) {
                return Ok(node);
            }
            current = node.parent();
        }
        Err(self.unknown(name))
    }
}

impl fmt::Debug for Node<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Node").field(&self.owner_name()).finish()
    }
}

/// Restores a setting when dropped.
pub struct TemporarySetting<'a> {
    node: Node<'a>,
    name: String,
    key: String,
    previous: Option<Value>,
}

impl Drop for TemporarySetting<'_> {
    fn drop(&mut self) {
        if let Some(previous) = self.previous.take() {
            if let Err(err) = self.node.set_setting(&self.name, &self.key, previous) {
                warn!(member = %self.name, key = %self.key, error = %err, "failed to restore setting");
            }
        }
    }
}

// =============================================================================
// Channels
// =============================================================================

/// Lazily instantiated channels of one kind.
#[derive(Debug, Clone)]
pub struct ChannelContainer<'a> {
    parent: Node<'a>,
    name: String,
    subpart: Subpart,
}

impl<'a> ChannelContainer<'a> {
    /// Attribute name of the channels.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Ids currently available on the instrument.
    pub fn available(&self) -> DaqResult<Vec<ChannelId>> {
        match self.subpart.available() {
            Some(available) => available.list(&self.parent),
            None => Err(DaqError::MissingChannelListing(format!(
                "{}.{}",
                self.parent.owner_name(),
                self.name
            ))),
        }
    }

    /// Id aliases.
    pub fn aliases(&self) -> &BTreeMap<String, ChannelId> {
        self.subpart.aliases()
    }

    /// Instance for `id` (or an alias of it), created on first access.
    pub fn get(&self, id: impl Into<ChannelId>) -> DaqResult<Node<'a>> {
        let id = id.into();
        let aliased = match &id {
            ChannelId::Str(alias) => self.subpart.aliases().get(alias).cloned(),
            ChannelId::Int(_) => None,
        };
        let id = aliased.unwrap_or(id);
        if !self.available()?.contains(&id) {
            return Err(DaqError::UnknownMember {
                owner: format!("{}.{}", self.parent.owner_name(), self.name),
                name: id.to_string(),
            });
        }
        Ok(self.parent.child(
            ChildKey::Channel(self.name.clone(), id.clone()),
            self.subpart.class(),
            &self.name,
            Some(id),
        ))
    }

    /// Every available instance.
    pub fn iter(&self) -> DaqResult<Vec<Node<'a>>> {
        self.available()?.into_iter().map(|id| self.get(id)).collect()
    }
}

// =============================================================================
// Cache snapshot
// =============================================================================

/// Cached values of an instance and of its instantiated children.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CacheSnapshot {
    /// Own cached values.
    pub values: BTreeMap<String, Value>,
    /// Snapshots of instantiated subsystems.
    pub subsystems: BTreeMap<String, CacheSnapshot>,
    /// Snapshots of instantiated channels, by id.
    pub channels: BTreeMap<String, BTreeMap<ChannelId, CacheSnapshot>>,
}

impl CacheSnapshot {
    /// Cached value of `name`.
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.values.get(name)
    }

    /// Whether nothing is cached anywhere in the snapshot.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
            && self.subsystems.values().all(CacheSnapshot::is_empty)
            && self
                .channels
                .values()
                .all(|instances| instances.values().all(CacheSnapshot::is_empty))
    }
}

// =============================================================================
// Registry
// =============================================================================

/// Shares one driver per `(class, connection)` pair.
///
/// Entries are weak: once every handle on a driver is dropped, the next
/// request creates a new one.
#[derive(Default)]
pub struct DriverRegistry {
    drivers: Mutex<HashMap<(String, String), Weak<Driver>>>,
}

impl DriverRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Existing driver for `connection_id`, or a new one using the backend
    /// returned by `connect`. The class must declare a version.
    pub fn get_or_create(
        &self,
        class: &Arc<DriverClass>,
        connection_id: &str,
        config: DriverConfig,
        connect: impl FnOnce() -> DaqResult<Arc<dyn Backend>>,
    ) -> DaqResult<Arc<Driver>> {
        if class.version().is_none() {
            return Err(DaqError::MissingVersion(class.name().to_string()));
        }
        let key = (class.name().to_string(), connection_id.to_string());
        let mut drivers = self.drivers.lock();
        if let Some(driver) = drivers.get(&key).and_then(Weak::upgrade) {
            debug!(class = %class.name(), connection = connection_id, "reusing driver");
            return Ok(driver);
        }
        let driver = Arc::new(Driver::new(class.clone(), connect()?, config)?.with_connection_id(connection_id));
        drivers.retain(|_, weak| weak.strong_count() > 0);
        drivers.insert(key, Arc::downgrade(&driver));
        Ok(driver)
    }

    /// Number of drivers still alive.
    pub fn len(&self) -> usize {
        self.drivers
            .lock()
            .values()
            .filter(|weak| weak.strong_count() > 0)
            .count()
    }

    /// Whether no driver is alive.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl fmt::Debug for DriverRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DriverRegistry").field("live", &self.len()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MockBackend;
    use crate::declarative::{Available, ClassBody, Declare};
    use crate::error::CommErrorKind;
    use crate::features;

    fn driver_with(class: Arc<DriverClass>, mock: Arc<MockBackend>) -> Driver {
        Driver::new(class, mock, DriverConfig::default()).unwrap()
    }

    fn scope() -> Arc<DriverClass> {
        ClassBody::new("Scope")
            .version("1.0")
            .feature("mode", features::string().getter("MODE?").setter("MODE {}"))
            .channel("ch", |ch| {
                ch.available(Available::ids([1, 2]))
                    .alias("A", 1)
                    .feature("range", features::int().getter("RNG{id}?").setter("RNG{id} {}"))
                    .channel("sensor", |p| {
                        p.available(Available::ids(["x", "y"]))
                            .feature("gain", features::int().getter("G{ch_id}{id}?"))
                    })
            })
            .build()
            .unwrap()
    }

    #[test]
    fn test_group_paths() {
        let groups = group_paths(&["a", ".b", "ss.c", "ss.d", "ch.e.f"]);
        assert_eq!(groups.own, ["a"]);
        assert_eq!(groups.parent, ["b"]);
        assert_eq!(groups.children.get("ss"), Some(&vec!["c", "d"]));
        assert_eq!(groups.children.get("ch"), Some(&vec!["e.f"]));
    }

    #[test]
    fn test_channel_ids_reach_the_backend() {
        let mock = Arc::new(
            MockBackend::new()
                .with_response("RNG1?", "5")
                .with_response("G1x?", "3"),
        );
        let driver = driver_with(scope(), mock.clone());
        let ch = driver.channel("ch", "A").unwrap();
        assert_eq!(ch.channel_id(), Some(ChannelId::Int(1)));
        assert_eq!(ch.owner_name(), "Scope.ch[1]");
        assert_eq!(ch.get("range").unwrap(), Value::Int(5));

        let sensor = ch.channel("sensor", "x").unwrap();
        let kwargs = sensor.command_kwargs();
        assert_eq!(kwargs.get("id"), Some(&Value::Str("x".into())));
        assert_eq!(kwargs.get("ch_id"), Some(&Value::Int(1)));
        assert_eq!(kwargs.get("sensor_id"), Some(&Value::Str("x".into())));
        assert_eq!(sensor.get("gain").unwrap(), Value::Int(3));
    }

    #[test]
    fn test_channel_container() {
        let driver = driver_with(scope(), Arc::new(MockBackend::new()));
        let container = driver.channels("ch").unwrap();
        assert_eq!(container.available().unwrap(), vec![ChannelId::Int(1), ChannelId::Int(2)]);
        assert_eq!(container.iter().unwrap().len(), 2);
        let err = container.get(7).unwrap_err();
        assert!(matches!(err, DaqError::UnknownMember { .. }));
        let first = container.get(1).unwrap();
        let again = driver.channel("ch", "A").unwrap();
        assert_eq!(first.index, again.index);
    }

    #[test]
    fn test_dotted_clear_cache_reaches_channels() {
        let mock = Arc::new(MockBackend::new().with_response("RNG1?", "5").with_response("RNG2?", "6"));
        let driver = driver_with(scope(), mock.clone());
        for ch in driver.channels("ch").unwrap().iter().unwrap() {
            ch.get("range").unwrap();
        }
        assert_eq!(mock.get_count(), 2);
        let snapshot = driver.check_cache(true, true, None);
        assert_eq!(snapshot.channels["ch"][&ChannelId::Int(2)].get("range"), Some(&Value::Int(6)));

        driver.clear_cache(false, false, Some(&["ch.range"]));
        assert!(driver.check_cache(true, true, None).is_empty());
        driver.channel("ch", 1).unwrap().get("range").unwrap();
        assert_eq!(mock.get_count(), 3);
    }

    #[test]
    fn test_resolve_identifier() {
        let mock = Arc::new(MockBackend::new().with_response("MODE?", "AUTO"));
        let driver = driver_with(scope(), mock);
        let ch = driver.channel("ch", 2).unwrap();
        assert_eq!(
            ch.resolve_identifier("value", &[("value", Value::Int(3))]).unwrap(),
            Value::Int(3)
        );
        assert_eq!(ch.resolve_identifier("driver.id", &[]).unwrap(), Value::Int(2));
        assert_eq!(
            ch.resolve_identifier("driver.parent.mode", &[]).unwrap(),
            Value::Str("AUTO".into())
        );
        assert!(ch.resolve_identifier("mode", &[]).is_err());
    }

    #[test]
    fn test_settings() {
        let driver = driver_with(scope(), Arc::new(MockBackend::new()));
        let root = driver.root();
        let settings = root.read_settings("mode").unwrap();
        assert_eq!(settings.get("inter_set_delay"), Some(&Value::Float(0.0)));

        let err = root.set_setting("mode", "bogus", 1).unwrap_err();
        assert!(matches!(err, DaqError::UnknownSetting { .. }));
        assert!(root.read_settings("missing").is_err());

        {
            let _guard = root.temporary_setting("mode", "inter_set_delay", 0.5).unwrap();
            assert_eq!(root.setting("mode", "inter_set_delay").unwrap(), Value::Float(0.5));
        }
        assert_eq!(root.setting("mode", "inter_set_delay").unwrap(), Value::Float(0.0));
    }

    #[test]
    fn test_limits_are_cached_and_discarded() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        let built = Arc::new(AtomicUsize::new(0));
        let counter = built.clone();
        let class = ClassBody::new("Source")
            .limit("volt", move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                LimitsValidator::float(Some(0.0), Some(10.0), None)
            })
            .subsystem("output", |ss| ss)
            .build()
            .unwrap();
        let driver = driver_with(class, Arc::new(MockBackend::new()));
        let output = driver.subsystem("output").unwrap();

        output.get_limits("volt").unwrap();
        driver.root().get_limits("volt").unwrap();
        assert_eq!(built.load(Ordering::SeqCst), 1);

        output.discard_limits(&[".volt"]);
        driver.root().get_limits("volt").unwrap();
        assert_eq!(built.load(Ordering::SeqCst), 2);
        assert!(driver.root().get_limits("amp").is_err());
    }

    #[test]
    fn test_retries_reopen_between_attempts() {
        let mock = Arc::new(MockBackend::new());
        let driver = driver_with(scope(), mock.clone());
        let root = driver.root();
        let mut calls = 0;
        let err = root
            .with_retries(2, "sensor", || -> DaqResult<()> {
                calls += 1;
                Err(DaqError::comm(CommErrorKind::Timeout, "no answer"))
            })
            .unwrap_err();
        assert_eq!(calls, 3);
        assert_eq!(mock.reopen_count(), 2);
        assert_eq!(err.comm_kind(), Some(CommErrorKind::Timeout));

        let mut calls = 0;
        root.with_retries(2, "sensor", || -> DaqResult<()> {
            calls += 1;
            Err(DaqError::Instrument("bad".into()))
        })
        .unwrap_err();
        assert_eq!(calls, 1);
    }

    #[test]
    fn test_enabling_checks() {
        let class = ClassBody::new("Source")
            .subsystem("output", |ss| {
                ss.checks("driver.enabled == true")
                    .feature("enabled", features::boolean().getter("OUT?").setter("OUT {}"))
                    .feature("level", features::int().getter("LVL?"))
            })
            .build()
            .unwrap();
        let mock = Arc::new(MockBackend::new().with_response("OUT?", "0").with_response("LVL?", "5"));
        let driver = driver_with(class, mock.clone());
        let output = driver.subsystem("output").unwrap();

        let err = output.get("level").unwrap_err();
        assert!(matches!(err, DaqError::Disabled { ref name, .. } if name == "level"));

        mock.set_response("OUT?", "1");
        output.clear_cache(true, true, None);
        assert_eq!(output.get("level").unwrap(), Value::Int(5));
    }

    #[test]
    fn test_options_gate_access() {
        let class = ClassBody::new("Source")
            .feature("opts", features::options(["high_voltage"]).getter("OPT?"))
            .feature(
                "hv_level",
                features::float().getter("HV?").options("opts.high_voltage == true"),
            )
            .build()
            .unwrap();
        let installed: BTreeMap<String, Value> =
            [("high_voltage".to_string(), Value::Bool(false))].into_iter().collect();
        let mock = Arc::new(
            MockBackend::new()
                .with_response("OPT?", Value::Map(installed))
                .with_response("HV?", "1.0"),
        );
        let driver = driver_with(class, mock.clone());
        let err = driver.get("hv_level").unwrap_err();
        assert!(matches!(err, DaqError::AccessDenied { ref name, .. } if name == "hv_level"));
        assert_eq!(mock.commands(), vec!["OPT?".to_string()]);
    }

    #[test]
    fn test_registry_shares_drivers() {
        let registry = DriverRegistry::new();
        let class = scope();
        let first = registry
            .get_or_create(&class, "GPIB::1", DriverConfig::default(), || {
                Ok(Arc::new(MockBackend::new()))
            })
            .unwrap();
        let second = registry
            .get_or_create(&class, "GPIB::1", DriverConfig::default(), || {
                Err(DaqError::Instrument("should not reconnect".into()))
            })
            .unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(registry.len(), 1);
        drop(first);
        drop(second);
        assert!(registry.is_empty());

        let unversioned = ClassBody::new("Bare").build().unwrap();
        let err = registry
            .get_or_create(&unversioned, "GPIB::2", DriverConfig::default(), || {
                Ok(Arc::new(MockBackend::new()))
            })
            .unwrap_err();
        assert!(matches!(err, DaqError::MissingVersion(_)));
    }

    #[test]
    fn test_session_finalizes() {
        let mock = Arc::new(MockBackend::new().with_response("MODE?", "AUTO"));
        let driver = driver_with(scope(), mock.clone());
        {
            let session = driver.session().unwrap();
            session.get("mode").unwrap();
            assert!(session.is_connected());
        }
        assert!(!driver.is_connected());
        assert!(driver.check_cache(true, true, None).is_empty());
    }

    #[test]
    fn test_subpart_class_cannot_be_instantiated() {
        let class = scope();
        let ch = class.channel("ch").unwrap().class().clone();
        let err = Driver::new(ch, Arc::new(MockBackend::new()), DriverConfig::default()).unwrap_err();
        assert!(err.is_configuration());
    }
}
