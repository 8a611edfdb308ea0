//! Module factory: maps a definition's `type` to a constructor.
//!
//! ```text
//!  { "type": "bme280", "init_level": 12, "config": { ... } }
//!            │
//!            ▼
//!  ModuleFactory ── kind lookup ──▶ constructor(&ConfigFragment)
//!            │                            │
//!            └──── ModuleSlot::new ◀──────┘ Box<dyn Module>
//! ```
//!
//! Constructors only build the module from its config; they must not
//! touch the bus, services or resources (that happens in `init`).

use log::{info, warn};

use crate::config::{ConfigFragment, ModuleDefinition};
use crate::error::{Error, Result};
use crate::module::{CoreContext, InitLevel, Module, ModuleHandle, ModuleSlot};

type Constructor = Box<dyn Fn(&ConfigFragment) -> Result<Box<dyn Module>> + Send + Sync>;

struct Entry {
    kind: String,
    default_level: InitLevel,
    construct: Constructor,
}

#[derive(Default)]
pub struct ModuleFactory {
    entries: Vec<Entry>,
}

impl ModuleFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a constructor for `kind` with its default init level.
    pub fn register<F>(&mut self, kind: &str, default_level: InitLevel, construct: F) -> Result<()>
    where
        F: Fn(&ConfigFragment) -> Result<Box<dyn Module>> + Send + Sync + 'static,
    {
        if kind.is_empty() {
            return Err(Error::InvalidArgument("empty module kind"));
        }
        if self.entries.iter().any(|e| e.kind == kind) {
            return Err(Error::AlreadyRegistered(kind.to_owned()));
        }
        self.entries.push(Entry {
            kind: kind.to_owned(),
            default_level,
            construct: Box::new(construct),
        });
        Ok(())
    }

    /// Builder-style [`Self::register`] for static tables of kinds.
    #[must_use]
    pub fn with<F>(mut self, kind: &str, default_level: InitLevel, construct: F) -> Self
    where
        F: Fn(&ConfigFragment) -> Result<Box<dyn Module>> + Send + Sync + 'static,
    {
        if let Err(e) = self.register(kind, default_level, construct) {
            warn!("ModuleFactory: '{}' not added: {}", kind, e);
        }
        self
    }

    pub fn kinds(&self) -> Vec<&str> {
        self.entries.iter().map(|e| e.kind.as_str()).collect()
    }

    pub fn default_level(&self, kind: &str) -> Option<InitLevel> {
        self.entries
            .iter()
            .find(|e| e.kind == kind)
            .map(|e| e.default_level)
    }

    /// Validate `def`, run its constructor and wrap the result in a slot.
    pub fn create(&self, def: &ModuleDefinition, core: &CoreContext) -> Result<ModuleHandle> {
        def.validate()?;
        let entry = self
            .entries
            .iter()
            .find(|e| e.kind == def.kind)
            .ok_or_else(|| Error::NotFound(def.kind.clone()))?;
        let level = def.init_level.unwrap_or(entry.default_level);
        let module = (entry.construct)(&def.config).inspect_err(|e| {
            warn!(
                "ModuleFactory: '{}' ({}) constructor failed: {}",
                def.instance_name, def.kind, e
            );
        })?;
        let handle = ModuleSlot::new(
            &def.instance_name,
            &def.kind,
            level,
            module,
            def.config.clone(),
            core.clone(),
        )?;
        info!("ModuleFactory: built '{}' ({})", def.instance_name, def.kind);
        Ok(handle)
    }
}
