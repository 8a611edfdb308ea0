//! Module registry: the append-only table of live module instances.
//!
//! Entries are only removed by [`ModuleRegistry::drain`] during
//! orchestrated shutdown.  Registration order is preserved and used as
//! the tie-break between modules with equal init levels.

use log::{info, warn};
use parking_lot::Mutex;

use crate::error::{Error, Result};
use crate::module::{ModuleHandle, ModuleStatus};

/// Capacity of the registry.
pub const MAX_MODULES: usize = 32;

/// Snapshot row for status listings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleInfo {
    pub name: String,
    pub kind: String,
    pub init_level: u8,
    pub status: ModuleStatus,
}

pub struct ModuleRegistry {
    modules: Mutex<Vec<ModuleHandle>>,
}

impl ModuleRegistry {
    pub fn new() -> Self {
        Self {
            modules: Mutex::new(Vec::new()),
        }
    }

    pub fn register(&self, module: ModuleHandle) -> Result<()> {
        let mut modules = self.modules.lock();
        if modules.iter().any(|m| m.name() == module.name()) {
            warn!("ModuleRegistry: duplicate module name '{}'", module.name());
            return Err(Error::AlreadyRegistered(module.name().to_owned()));
        }
        if modules.len() >= MAX_MODULES {
            warn!("ModuleRegistry: full, '{}' not registered", module.name());
            return Err(Error::Allocation("module registry"));
        }
        info!(
            "ModuleRegistry: '{}' ({}) registered at level {}",
            module.name(),
            module.kind(),
            module.init_level()
        );
        modules.push(module);
        Ok(())
    }

    pub fn find(&self, name: &str) -> Option<ModuleHandle> {
        self.modules.lock().iter().find(|m| m.name() == name).cloned()
    }

    /// All instances built from constructor `kind`, in registration order.
    pub fn find_by_kind(&self, kind: &str) -> Vec<ModuleHandle> {
        self.modules
            .lock()
            .iter()
            .filter(|m| m.kind() == kind)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.modules.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Handles in registration order.
    pub fn all(&self) -> Vec<ModuleHandle> {
        self.modules.lock().clone()
    }

    /// Ascending init level; equal levels keep registration order.
    pub fn startup_order(&self) -> Vec<ModuleHandle> {
        let mut order = self.all();
        order.sort_by_key(|m| m.init_level());
        order
    }

    /// Exact reverse of [`Self::startup_order`].
    pub fn shutdown_order(&self) -> Vec<ModuleHandle> {
        let mut order = self.startup_order();
        order.reverse();
        order
    }

    pub fn infos(&self) -> Vec<ModuleInfo> {
        self.modules
            .lock()
            .iter()
            .map(|m| ModuleInfo {
                name: m.name().to_owned(),
                kind: m.kind().to_owned(),
                init_level: m.init_level().get(),
                status: m.status(),
            })
            .collect()
    }

    /// Remove every entry.  Shutdown only.
    pub(crate) fn drain(&self) -> Vec<ModuleHandle> {
        core::mem::take(&mut *self.modules.lock())
    }
}

impl Default for ModuleRegistry {
    fn default() -> Self {
        Self::new()
    }
}
