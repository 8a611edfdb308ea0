//! Contexts handed to modules.
//!
//! [`CoreContext`] bundles the shared kernel tables and the task pool.  The
//! orchestrator owns one and every module slot keeps a clone, so no global
//! state is needed.  [`ModuleContext`] is the per-call view a module gets:
//! the core tables plus its own identity, config and injected dependencies.

use std::sync::Arc;

use crate::bus::EventBus;
use crate::bus::payload::Payload;
use crate::config::ConfigFragment;
use crate::error::{Error, Result};
use crate::resources::{ResourceLease, ResourceManager, ResourceType};
use crate::services::{ServiceLocator, ServiceType};
use crate::tasks::{JobId, JobKind, TaskPool};

use super::{ModuleHandle, ModuleSlot, Resolved};

// ───────────────────────────────────────────────────────────────
// CoreContext
// ───────────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct CoreContext {
    pub bus: EventBus,
    pub services: Arc<ServiceLocator>,
    pub resources: Arc<ResourceManager>,
    pub tasks: Arc<TaskPool>,
}

impl CoreContext {
    pub fn new() -> Self {
        Self::with_task_pool(TaskPool::default())
    }

    pub fn with_task_pool(tasks: TaskPool) -> Self {
        let bus = EventBus::new();
        Self {
            services: Arc::new(ServiceLocator::new(bus.clone())),
            resources: Arc::new(ResourceManager::new()),
            tasks: Arc::new(tasks),
            bus,
        }
    }
}

impl Default for CoreContext {
    fn default() -> Self {
        Self::new()
    }
}

// ───────────────────────────────────────────────────────────────
// ModuleContext
// ───────────────────────────────────────────────────────────────

/// What a module can reach during a lifecycle call or event handler.
pub struct ModuleContext<'a> {
    slot: &'a ModuleSlot,
}

impl<'a> ModuleContext<'a> {
    pub(crate) fn new(slot: &'a ModuleSlot) -> Self {
        Self { slot }
    }

    pub fn name(&self) -> &str {
        self.slot.name()
    }

    /// The fragment the module was built (or last reconfigured) with.
    pub fn config(&self) -> ConfigFragment {
        self.slot.config()
    }

    pub fn bus(&self) -> &EventBus {
        &self.slot.core().bus
    }

    pub fn services(&self) -> &ServiceLocator {
        &self.slot.core().services
    }

    pub fn resources(&self) -> &Arc<ResourceManager> {
        &self.slot.core().resources
    }

    pub fn tasks(&self) -> &TaskPool {
        &self.slot.core().tasks
    }

    /// Handle to this module, e.g. to pass to other subsystems.
    pub fn handle(&self) -> Option<ModuleHandle> {
        self.slot.weak().upgrade()
    }

    // ── Events ────────────────────────────────────────────────

    pub fn subscribe(&self, event: &str) -> Result<()> {
        self.bus().subscribe_weak(event, self.slot.name(), self.slot.weak())
    }

    pub fn unsubscribe(&self, event: &str) {
        self.bus().unsubscribe_named(event, self.slot.name());
    }

    pub fn post(&self, event: &str, payload: Option<Payload>) -> Result<()> {
        self.bus().post(event, payload)
    }

    // ── Services ──────────────────────────────────────────────

    /// Register a service owned by this module.
    pub fn register_service<I>(&self, name: &str, ty: ServiceType, iface: I) -> Result<()>
    where
        I: Clone + Send + Sync + 'static,
    {
        self.services().register(name, self.slot.name(), ty, iface)
    }

    pub fn service<I>(&self, name: &str) -> Result<I>
    where
        I: Clone + Send + Sync + 'static,
    {
        self.services().get(name)
    }

    // ── Resources ─────────────────────────────────────────────

    pub fn lock_resource(&self, ty: ResourceType, id: u8) -> Result<()> {
        self.resources().lock(ty, id, self.slot.name())
    }

    pub fn release_resource(&self, ty: ResourceType, id: u8) -> Result<()> {
        self.resources().release(ty, id, self.slot.name())
    }

    /// Lock a resource for as long as the returned lease lives.
    pub fn lease_resource(&self, ty: ResourceType, id: u8) -> Result<ResourceLease> {
        self.resources().lease(ty, id, self.slot.name())
    }

    // ── Jobs ──────────────────────────────────────────────────

    /// Schedule a job on the shared pool, owned by this module.  Jobs still
    /// scheduled when the module is shut down are cancelled.
    pub fn schedule_job<F>(&self, kind: JobKind, f: F) -> Result<JobId>
    where
        F: FnMut() + Send + 'static,
    {
        self.tasks().schedule(self.slot.name(), kind, f)
    }

    pub fn cancel_job(&self, id: JobId) -> Result<()> {
        self.tasks().cancel(id)
    }

    // ── Injected dependencies ─────────────────────────────────

    /// Interface of the service injected under `key`.
    pub fn dependency_service<I>(&self, key: &str) -> Result<I>
    where
        I: Clone + Send + Sync + 'static,
    {
        let resolved = self.slot.resolved();
        let name = resolved
            .iter()
            .find_map(|r| match r {
                Resolved::Service { key: k, name } if *k == key => Some(name.clone()),
                _ => None,
            })
            .ok_or_else(|| Error::NotFound(key.to_owned()))?;
        self.services().get(&name)
    }

    /// Handle of the module injected under `key`.
    pub fn dependency_module(&self, key: &str) -> Option<ModuleHandle> {
        self.slot.resolved().into_iter().find_map(|r| match r {
            Resolved::Module { key: k, handle } if k == key => Some(handle),
            _ => None,
        })
    }
}
