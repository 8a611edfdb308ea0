//! Configuration tree, module definitions and the persistence port.
//!
//! ```text
//!   ConfigStore (NVS / memory) ──load──▶ ConfigManager ──fragment──▶ Module
//!                              ◀──save──  (ConfigTree)
//! ```
//!
//! The whole device configuration is one JSON document.  Values are
//! addressed with dot-notation keys; numeric segments index arrays:
//!
//! ```text
//! global_config.device_name
//! modules.0.config.instance_name
//! ```
//!
//! Every module receives an immutable [`ConfigFragment`] (its `config`
//! object) at construction time and only sees a new one through an
//! explicit `reconfigure`.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use log::{info, warn};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::ConfigError;
use crate::module::InitLevel;

/// Longest module instance name accepted by the registry.
pub const MAX_NAME_LEN: usize = 32;

// ───────────────────────────────────────────────────────────────
// Read access shared by trees and fragments
// ───────────────────────────────────────────────────────────────

fn lookup<'a>(root: &'a Value, path: &str) -> Option<&'a Value> {
    if path.is_empty() {
        return Some(root);
    }
    path.split('.').try_fold(root, |node, seg| match node {
        Value::Object(map) => map.get(seg),
        Value::Array(items) => seg.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

/// Typed, dot-notation read access over a JSON document.
///
/// The `get_*` accessors fall back to the default when the key is missing
/// (or holds the wrong type, which is also logged).  The strict accessors
/// return [`ConfigError`] instead.
pub trait ConfigRead {
    fn root(&self) -> &Value;

    fn get(&self, path: &str) -> Option<&Value> {
        lookup(self.root(), path)
    }

    fn contains(&self, path: &str) -> bool {
        self.get(path).is_some()
    }

    fn string(&self, path: &str) -> Result<&str, ConfigError> {
        match self.get(path) {
            None => Err(ConfigError::Missing(path.to_owned())),
            Some(v) => v
                .as_str()
                .ok_or_else(|| ConfigError::TypeMismatch(path.to_owned())),
        }
    }

    fn int(&self, path: &str) -> Result<i64, ConfigError> {
        match self.get(path) {
            None => Err(ConfigError::Missing(path.to_owned())),
            Some(v) => v
                .as_i64()
                .ok_or_else(|| ConfigError::TypeMismatch(path.to_owned())),
        }
    }

    fn bool(&self, path: &str) -> Result<bool, ConfigError> {
        match self.get(path) {
            None => Err(ConfigError::Missing(path.to_owned())),
            Some(v) => v
                .as_bool()
                .ok_or_else(|| ConfigError::TypeMismatch(path.to_owned())),
        }
    }

    fn get_string(&self, path: &str, default: &str) -> String {
        or_default(self.string(path).map(str::to_owned), default.to_owned())
    }

    fn get_int(&self, path: &str, default: i64) -> i64 {
        or_default(self.int(path), default)
    }

    fn get_bool(&self, path: &str, default: bool) -> bool {
        or_default(self.bool(path), default)
    }
}

fn or_default<T>(value: Result<T, ConfigError>, default: T) -> T {
    match value {
        Ok(v) => v,
        Err(ConfigError::Missing(_)) => default,
        Err(e) => {
            warn!("Config: {}, using default", e);
            default
        }
    }
}

// ───────────────────────────────────────────────────────────────
// ConfigTree — the mutable whole-device document
// ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct ConfigTree {
    root: Value,
}

impl ConfigTree {
    /// An empty document (`{}`).
    pub fn empty() -> Self {
        Self {
            root: Value::Object(Map::new()),
        }
    }

    pub fn from_value(root: Value) -> Result<Self, ConfigError> {
        if root.is_object() {
            Ok(Self { root })
        } else {
            Err(ConfigError::TypeMismatch(String::new()))
        }
    }

    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        Self::from_value(serde_json::from_str(json)?)
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self, ConfigError> {
        Self::from_value(serde_json::from_slice(bytes)?)
    }

    pub fn to_json(&self) -> Result<String, ConfigError> {
        Ok(serde_json::to_string(&self.root)?)
    }

    /// Set `path` to `value`, creating intermediate objects as needed.
    /// Array segments must index an existing element.
    pub fn set(&mut self, path: &str, value: Value) -> Result<(), ConfigError> {
        if path.is_empty() || path.split('.').any(str::is_empty) {
            return Err(ConfigError::Invalid(format!("bad key '{path}'")));
        }
        let mut node = &mut self.root;
        let mut segments = path.split('.').peekable();
        while let Some(seg) = segments.next() {
            let last = segments.peek().is_none();
            if node.is_null() {
                *node = Value::Object(Map::new());
            }
            node = match node {
                Value::Object(map) => {
                    if last {
                        map.insert(seg.to_owned(), value);
                        return Ok(());
                    }
                    map.entry(seg.to_owned())
                        .or_insert_with(|| Value::Object(Map::new()))
                }
                Value::Array(items) => {
                    let slot = seg
                        .parse::<usize>()
                        .ok()
                        .and_then(|i| items.get_mut(i))
                        .ok_or_else(|| ConfigError::Missing(path.to_owned()))?;
                    if last {
                        *slot = value;
                        return Ok(());
                    }
                    slot
                }
                _ => return Err(ConfigError::TypeMismatch(path.to_owned())),
            };
        }
        Ok(())
    }

    /// Immutable copy of the sub-tree at `path` (empty object when absent).
    pub fn fragment(&self, path: &str) -> ConfigFragment {
        self.get(path)
            .map_or_else(ConfigFragment::empty, |v| ConfigFragment::new(v.clone()))
    }

    /// Raw entries of the `modules` array (empty when the key is absent).
    pub fn module_entries(&self) -> Result<&[Value], ConfigError> {
        match self.get("modules") {
            None => Ok(&[]),
            Some(Value::Array(items)) => Ok(items),
            Some(_) => Err(ConfigError::TypeMismatch("modules".into())),
        }
    }
}

impl ConfigRead for ConfigTree {
    fn root(&self) -> &Value {
        &self.root
    }
}

impl Default for ConfigTree {
    fn default() -> Self {
        Self::empty()
    }
}

// ───────────────────────────────────────────────────────────────
// ConfigFragment — what a module sees
// ───────────────────────────────────────────────────────────────

/// Read-only, cheaply clonable view of one module's configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct ConfigFragment(Arc<Value>);

impl ConfigFragment {
    pub fn new(value: Value) -> Self {
        Self(Arc::new(value))
    }

    pub fn empty() -> Self {
        Self::new(Value::Object(Map::new()))
    }

    pub fn to_value(&self) -> Value {
        (*self.0).clone()
    }
}

impl ConfigRead for ConfigFragment {
    fn root(&self) -> &Value {
        &self.0
    }
}

// ───────────────────────────────────────────────────────────────
// Module definitions
// ───────────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct RawDefinition {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default = "enabled_by_default")]
    enabled: bool,
    #[serde(default)]
    init_level: Option<u8>,
    #[serde(default)]
    config: Option<Value>,
}

fn enabled_by_default() -> bool {
    true
}

/// One entry of the configuration's `modules` array.
#[derive(Debug, Clone, PartialEq)]
pub struct ModuleDefinition {
    /// Constructor name, looked up in the factory.
    pub kind: String,
    /// Unique module name (`config.instance_name`, else the kind).
    pub instance_name: String,
    /// Overrides the kind's default init level when present.
    pub init_level: Option<InitLevel>,
    pub config: ConfigFragment,
}

impl ModuleDefinition {
    pub fn new(kind: &str, config: Value) -> Self {
        let config = ConfigFragment::new(config);
        let instance_name = config.get_string("instance_name", kind);
        Self {
            kind: kind.to_owned(),
            instance_name,
            init_level: None,
            config,
        }
    }

    #[must_use]
    pub fn with_init_level(mut self, level: InitLevel) -> Self {
        self.init_level = Some(level);
        self
    }

    /// Parse one `modules[]` entry.  `Ok(None)` for `"enabled": false`.
    pub fn from_entry(entry: &Value) -> Result<Option<Self>, ConfigError> {
        let raw = RawDefinition::deserialize(entry)
            .map_err(|e| ConfigError::Invalid(format!("module entry: {e}")))?;
        if !raw.enabled {
            return Ok(None);
        }
        let config = match raw.config {
            None => Value::Object(Map::new()),
            Some(v @ Value::Object(_)) => v,
            Some(_) => return Err(ConfigError::TypeMismatch("config".into())),
        };
        let mut def = Self::new(&raw.kind, config);
        if let Some(level) = raw.init_level {
            def.init_level = Some(InitLevel::new(level).ok_or_else(|| {
                ConfigError::Invalid(format!("init_level {level} exceeds 100"))
            })?);
        }
        def.validate()?;
        Ok(Some(def))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.kind.is_empty() {
            return Err(ConfigError::Invalid("empty module type".into()));
        }
        if self.instance_name.is_empty() || self.instance_name.len() > MAX_NAME_LEN {
            return Err(ConfigError::Invalid(format!(
                "instance name '{}' must be 1-{} bytes",
                self.instance_name, MAX_NAME_LEN
            )));
        }
        Ok(())
    }
}

// ───────────────────────────────────────────────────────────────
// Kernel tunables (`global_config.framework`)
// ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FrameworkConfig {
    /// Run event dispatch on a dedicated thread instead of the main loop.
    pub spawn_dispatcher: bool,
    /// Stack size of the dispatcher thread in bytes.
    pub dispatcher_stack_size: usize,
    /// Worker threads in the shared task pool.
    pub task_workers: usize,
    /// Stack size of each task-pool thread in bytes.
    pub task_stack_size: usize,
}

impl Default for FrameworkConfig {
    fn default() -> Self {
        Self {
            spawn_dispatcher: false,
            dispatcher_stack_size: 8 * 1024,
            task_workers: 2,
            task_stack_size: 4 * 1024,
        }
    }
}

impl FrameworkConfig {
    pub const PATH: &'static str = "global_config.framework";

    pub fn from_tree(tree: &ConfigTree) -> Result<Self, ConfigError> {
        let Some(section) = tree.get(Self::PATH) else {
            return Ok(Self::default());
        };
        let cfg = Self::deserialize(section)
            .map_err(|e| ConfigError::Invalid(format!("{}: {e}", Self::PATH)))?;
        if cfg.dispatcher_stack_size < 2048 || cfg.task_stack_size < 2048 {
            return Err(ConfigError::Invalid(
                "thread stack sizes must be at least 2048".into(),
            ));
        }
        if !(1..=8).contains(&cfg.task_workers) {
            return Err(ConfigError::Invalid("task_workers must be 1-8".into()));
        }
        Ok(cfg)
    }
}

// ───────────────────────────────────────────────────────────────
// Persistence port
// ───────────────────────────────────────────────────────────────

/// Loads and persists the configuration document.
///
/// Implementations store the document atomically; a partially written
/// document must never be returned by `load`.
pub trait ConfigStore: Send + Sync {
    /// `Ok(None)` when nothing has been stored yet.
    fn load(&self) -> Result<Option<ConfigTree>, ConfigError>;

    fn save(&self, tree: &ConfigTree) -> Result<(), ConfigError>;
}

// ───────────────────────────────────────────────────────────────
// ConfigManager
// ───────────────────────────────────────────────────────────────

/// Owns the live configuration document and its backing store.
pub struct ConfigManager {
    tree: RwLock<ConfigTree>,
    store: Option<Box<dyn ConfigStore>>,
    dirty: AtomicBool,
}

impl ConfigManager {
    /// Load the document from `store`, starting empty if nothing is stored.
    pub fn load(store: Box<dyn ConfigStore>) -> Result<Self, ConfigError> {
        Self::load_or_seed(store, ConfigTree::empty())
    }

    /// Load the document from `store`.  On first boot (nothing stored) the
    /// manager starts from `defaults` and is marked dirty so the next
    /// `save` writes them back.
    pub fn load_or_seed(
        store: Box<dyn ConfigStore>,
        defaults: ConfigTree,
    ) -> Result<Self, ConfigError> {
        let (tree, seeded) = match store.load()? {
            Some(tree) => {
                info!("ConfigManager: loaded stored configuration");
                (tree, false)
            }
            None => {
                info!("ConfigManager: no stored configuration, using defaults");
                (defaults, true)
            }
        };
        Ok(Self {
            tree: RwLock::new(tree),
            store: Some(store),
            dirty: AtomicBool::new(seeded),
        })
    }

    /// Use `tree` as-is, persisting through `store`.
    pub fn with_store(tree: ConfigTree, store: Box<dyn ConfigStore>) -> Self {
        Self {
            tree: RwLock::new(tree),
            store: Some(store),
            dirty: AtomicBool::new(false),
        }
    }

    /// A manager with no backing store; `save` fails.
    pub fn detached(tree: ConfigTree) -> Self {
        Self {
            tree: RwLock::new(tree),
            store: None,
            dirty: AtomicBool::new(false),
        }
    }

    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        Ok(Self::detached(ConfigTree::from_json(json)?))
    }

    pub fn snapshot(&self) -> ConfigTree {
        self.tree.read().clone()
    }

    pub fn get_string(&self, path: &str, default: &str) -> String {
        self.tree.read().get_string(path, default)
    }

    pub fn get_int(&self, path: &str, default: i64) -> i64 {
        self.tree.read().get_int(path, default)
    }

    pub fn get_bool(&self, path: &str, default: bool) -> bool {
        self.tree.read().get_bool(path, default)
    }

    pub fn fragment(&self, path: &str) -> ConfigFragment {
        self.tree.read().fragment(path)
    }

    pub fn set(&self, path: &str, value: Value) -> Result<(), ConfigError> {
        self.tree.write().set(path, value)?;
        self.dirty.store(true, Ordering::Release);
        Ok(())
    }

    /// Whether `set` has been called since the last successful `save`.
    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    pub fn save(&self) -> Result<(), ConfigError> {
        let store = self
            .store
            .as_ref()
            .ok_or_else(|| ConfigError::Storage("no backing store".into()))?;
        store.save(&self.tree.read())?;
        self.dirty.store(false, Ordering::Release);
        info!("ConfigManager: configuration saved");
        Ok(())
    }
}
