//! Orchestrator (system manager): builds the kernel, then drives every
//! module through its lifecycle.
//!
//! ```text
//!  new()      CoreContext (bus · services · resources · task pool)
//!             └─ "system_manager" service
//!             └─ config.modules[] ──▶ factory ──▶ registry
//!
//!  start()    pass 1, ascending init level:  resolve deps ─▶ init
//!             pass 2, ascending init level:  start (INITIALIZED only)
//!             post SYSTEM_START_COMPLETE
//!
//!  shutdown() descending init level: stop ─▶ cancel jobs ─▶ deinit
//!             ─▶ unsubscribe ─▶ unregister services ─▶ release resources
//!             then stop the task pool and the dispatcher
//! ```
//!
//! A failing module is logged, left in ERROR and skipped; every other
//! module carries on.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use log::{debug, error, info, warn};
use serde_json::Value;

use crate::bus::EventBus;
use crate::bus::payload::{EventPayload, Payload};
use crate::config::{ConfigFragment, ConfigManager, ConfigRead, FrameworkConfig, ModuleDefinition};
use crate::error::{ConfigError, Error, Result};
use crate::events;
use crate::factory::ModuleFactory;
use crate::module::{
    CoreContext, DependencyKind, LifecycleOp, ModuleHandle, ModuleStatus, Resolved,
};
use crate::registry::{ModuleInfo, ModuleRegistry};
use crate::resources::ResourceManager;
use crate::services::{ServiceLocator, ServiceStatus, ServiceType};
use crate::tasks::TaskPool;

/// Name of the service the orchestrator publishes about itself.
pub const SYSTEM_SERVICE: &str = "system_manager";

// ───────────────────────────────────────────────────────────────
// System service
// ───────────────────────────────────────────────────────────────

/// Interface published as [`SYSTEM_SERVICE`].
pub trait SystemApi: Send + Sync {
    fn modules(&self) -> Vec<ModuleInfo>;

    /// Ask the main loop to shut the system down (e.g. before a reboot).
    fn request_shutdown(&self);

    fn shutdown_requested(&self) -> bool;
}

struct SystemService {
    registry: Arc<ModuleRegistry>,
    bus: EventBus,
    shutdown: AtomicBool,
}

impl SystemApi for SystemService {
    fn modules(&self) -> Vec<ModuleInfo> {
        self.registry.infos()
    }

    fn request_shutdown(&self) {
        if self.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("Orchestrator: shutdown requested");
        if let Err(e) = self.bus.post(events::SYSTEM_SHUTDOWN_REQUESTED, None) {
            warn!("Orchestrator: shutdown event lost: {}", e);
        }
    }

    fn shutdown_requested(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }
}

// ───────────────────────────────────────────────────────────────
// Startup report
// ───────────────────────────────────────────────────────────────

/// Outcome of [`Orchestrator::start`], also the payload of
/// `SYSTEM_START_COMPLETE`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StartupReport {
    /// Modules that reached RUNNING, in start order.
    pub started: Vec<String>,
    /// Modules that failed, with the error that stopped them.
    pub failed: Vec<(String, Error)>,
}

impl StartupReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

impl EventPayload for StartupReport {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Built,
    Started,
    ShutDown,
}

// ───────────────────────────────────────────────────────────────
// Orchestrator
// ───────────────────────────────────────────────────────────────

pub struct Orchestrator {
    core: CoreContext,
    registry: Arc<ModuleRegistry>,
    factory: ModuleFactory,
    config: ConfigManager,
    framework: FrameworkConfig,
    system: Arc<SystemService>,
    phase: Phase,
}

impl Orchestrator {
    /// Build the kernel tables and instantiate every configured module.
    ///
    /// Individual bad module definitions are logged and skipped; a
    /// malformed `modules` list or framework section aborts.
    pub fn new(config: ConfigManager, factory: ModuleFactory) -> Result<Self> {
        let tree = config.snapshot();
        let framework = FrameworkConfig::from_tree(&tree)?;
        let entries = tree.module_entries()?;

        let core = CoreContext::with_task_pool(TaskPool::new(
            framework.task_workers,
            framework.task_stack_size,
        ));
        let registry = Arc::new(ModuleRegistry::new());
        let system = Arc::new(SystemService {
            registry: registry.clone(),
            bus: core.bus.clone(),
            shutdown: AtomicBool::new(false),
        });
        let api: Arc<dyn SystemApi> = system.clone();
        core.services
            .register(SYSTEM_SERVICE, SYSTEM_SERVICE, ServiceType::System, api)?;

        let orchestrator = Self {
            core,
            registry,
            factory,
            config,
            framework,
            system,
            phase: Phase::Built,
        };

        for (index, entry) in entries.iter().enumerate() {
            match ModuleDefinition::from_entry(entry) {
                Ok(Some(def)) => {
                    if let Err(e) = orchestrator.add_module(&def) {
                        error!("Orchestrator: modules[{}] '{}' omitted: {}", index, def.instance_name, e);
                    }
                }
                Ok(None) => info!("Orchestrator: modules[{}] disabled in config", index),
                Err(e) => error!("Orchestrator: modules[{}] omitted: {}", index, e),
            }
        }
        info!(
            "Orchestrator: {} module(s) registered from {} definition(s)",
            orchestrator.registry.len(),
            entries.len()
        );
        Ok(orchestrator)
    }

    /// Construct and register one module.  It stays DISABLED until
    /// [`Self::start`] or a by-name start/enable.
    pub fn add_module(&self, def: &ModuleDefinition) -> Result<ModuleHandle> {
        if self.phase == Phase::ShutDown {
            return Err(Error::InvalidArgument("orchestrator already shut down"));
        }
        let handle = self.factory.create(def, &self.core)?;
        self.registry.register(handle.clone())?;
        Ok(handle)
    }

    // ── Startup ───────────────────────────────────────────────

    pub fn start(&mut self) -> StartupReport {
        let mut report = StartupReport::default();
        if self.phase != Phase::Built {
            warn!("Orchestrator: start called twice");
            return report;
        }
        if self.framework.spawn_dispatcher {
            if let Err(e) = self
                .core
                .bus
                .spawn_dispatcher(self.framework.dispatcher_stack_size)
            {
                error!("Orchestrator: falling back to inline dispatch: {}", e);
            }
        }

        let order = self.registry.startup_order();
        info!("Orchestrator: initializing {} module(s)", order.len());
        for module in &order {
            if module.status() != ModuleStatus::Disabled {
                continue;
            }
            if let Err(e) = self.init_module(module) {
                report.failed.push((module.name().to_owned(), e));
            }
        }

        for module in &order {
            if module.status() != ModuleStatus::Initialized {
                continue;
            }
            match module.start() {
                Ok(status) => {
                    self.sync_services(module, status);
                    report.started.push(module.name().to_owned());
                }
                Err(e) => {
                    self.sync_services(module, ModuleStatus::Error);
                    report.failed.push((module.name().to_owned(), e));
                }
            }
        }

        self.phase = Phase::Started;
        if let Err(e) = self
            .core
            .services
            .set_status(SYSTEM_SERVICE, ServiceStatus::Active)
        {
            warn!("Orchestrator: {}", e);
        }
        info!(
            "Orchestrator: startup complete, {} running, {} failed",
            report.started.len(),
            report.failed.len()
        );
        if let Err(e) = self.core.bus.post(
            events::SYSTEM_START_COMPLETE,
            Some(Payload::new(report.clone())),
        ) {
            warn!("Orchestrator: start-complete event lost: {}", e);
        }
        report
    }

    fn init_module(&self, module: &ModuleHandle) -> Result<()> {
        let outcome = self.resolve_dependencies(module).and_then(|()| module.init());
        match &outcome {
            Ok(status) => self.sync_services(module, *status),
            Err(_) => self.sync_services(module, ModuleStatus::Error),
        }
        outcome.map(|_| ())
    }

    /// Look up every declared dependency named in the module's config.
    /// Keys absent from config are skipped; named targets must exist.
    fn resolve_dependencies(&self, module: &ModuleHandle) -> Result<()> {
        let config = module.config();
        let mut resolved = Vec::new();
        for dep in module.dependencies() {
            let target = match config.string(dep.key) {
                Ok(target) => target.to_owned(),
                Err(ConfigError::Missing(_)) => {
                    warn!(
                        "Orchestrator: '{}' dependency '{}' not configured, skipping",
                        module.name(),
                        dep.key
                    );
                    continue;
                }
                Err(e) => {
                    return Err(module.fail(LifecycleOp::Init, format!("dependency {e}")));
                }
            };
            match dep.kind {
                DependencyKind::Service if self.core.services.contains(&target) => {
                    resolved.push(Resolved::Service {
                        key: dep.key,
                        name: target,
                    });
                }
                DependencyKind::Module => match self.registry.find(&target) {
                    Some(handle) => resolved.push(Resolved::Module {
                        key: dep.key,
                        handle,
                    }),
                    None => {
                        return Err(module.fail(
                            LifecycleOp::Init,
                            format!("module '{target}' for '{}' not found", dep.key),
                        ));
                    }
                },
                DependencyKind::Service => {
                    return Err(module.fail(
                        LifecycleOp::Init,
                        format!("service '{target}' for '{}' not found", dep.key),
                    ));
                }
            }
        }
        module.set_resolved(resolved);
        Ok(())
    }

    fn sync_services(&self, module: &ModuleHandle, status: ModuleStatus) {
        self.core
            .services
            .set_status_for_owner(module.name(), ServiceStatus::for_module(status));
    }

    // ── Runtime control by name ───────────────────────────────

    fn find(&self, name: &str) -> Result<ModuleHandle> {
        self.registry
            .find(name)
            .ok_or_else(|| Error::NotFound(name.to_owned()))
    }

    fn ensure_initialized(&self, module: &ModuleHandle) -> Result<()> {
        if module.status() == ModuleStatus::Disabled {
            self.init_module(module)?;
        }
        Ok(())
    }

    /// Start `name`, initializing it first if it is still DISABLED.
    pub fn start_module(&self, name: &str) -> Result<()> {
        let module = self.find(name)?;
        self.ensure_initialized(&module)?;
        let outcome = module.start();
        self.sync_services(&module, module.status());
        outcome.map(|_| ())
    }

    pub fn stop_module(&self, name: &str) -> Result<()> {
        let module = self.find(name)?;
        let outcome = module.stop();
        self.sync_services(&module, module.status());
        outcome.map(|_| ())
    }

    /// Enable `name` (initializing it first if needed) and announce it.
    pub fn enable_module(&self, name: &str) -> Result<()> {
        let module = self.find(name)?;
        self.ensure_initialized(&module)?;
        let outcome = module.enable();
        self.sync_services(&module, module.status());
        outcome?;
        self.announce(events::MODULE_ENABLED, name);
        Ok(())
    }

    pub fn disable_module(&self, name: &str) -> Result<()> {
        let module = self.find(name)?;
        let outcome = module.disable();
        self.sync_services(&module, module.status());
        outcome?;
        self.announce(events::MODULE_DISABLED, name);
        Ok(())
    }

    /// Hand `name` a new config object.  The module must be STOPPED or
    /// DISABLED.
    ///
    /// The result reflects the module only.  Once it has accepted the new
    /// fragment the call succeeds; mirroring the fragment into the
    /// configuration tree is best effort and a failure there is logged.
    /// Modules added at runtime have no tree entry to mirror into.
    pub fn reconfigure_module(&self, name: &str, config: Value) -> Result<()> {
        if !config.is_object() {
            return Err(ConfigError::TypeMismatch("config".into()).into());
        }
        let module = self.find(name)?;
        module.reconfigure(ConfigFragment::new(config.clone()))?;
        match self.definition_index(name) {
            Some(index) => {
                let path = format!("modules.{index}.config");
                if let Err(e) = self.update_config(&path, config) {
                    warn!("Orchestrator: '{}' reconfigured but '{}' not updated: {}", name, path, e);
                }
            }
            None => debug!("Orchestrator: '{}' has no definition in the tree", name),
        }
        Ok(())
    }

    pub fn module_status(&self, name: &str) -> Result<ModuleStatus> {
        Ok(self.find(name)?.status())
    }

    pub fn module_config(&self, name: &str) -> Result<ConfigFragment> {
        Ok(self.find(name)?.config())
    }

    pub fn modules(&self) -> Vec<ModuleInfo> {
        self.registry.infos()
    }

    fn definition_index(&self, name: &str) -> Option<usize> {
        let tree = self.config.snapshot();
        let entries = tree.module_entries().ok()?;
        entries.iter().position(|entry| {
            matches!(ModuleDefinition::from_entry(entry), Ok(Some(def)) if def.instance_name == name)
        })
    }

    fn announce(&self, event: &str, name: &str) {
        if let Err(e) = self
            .core
            .bus
            .post(event, Some(Payload::new(name.to_owned())))
        {
            warn!("Orchestrator: '{}' for '{}' lost: {}", event, name, e);
        }
    }

    // ── Configuration ─────────────────────────────────────────

    /// Change one configuration key and post `CONFIG_UPDATED`.
    pub fn update_config(&self, path: &str, value: Value) -> Result<()> {
        self.config.set(path, value)?;
        self.announce(events::CONFIG_UPDATED, path);
        Ok(())
    }

    pub fn save_config(&self) -> Result<()> {
        Ok(self.config.save()?)
    }

    pub fn config(&self) -> &ConfigManager {
        &self.config
    }

    // ── Accessors ─────────────────────────────────────────────

    pub fn core(&self) -> &CoreContext {
        &self.core
    }

    pub fn bus(&self) -> &EventBus {
        &self.core.bus
    }

    pub fn services(&self) -> &ServiceLocator {
        &self.core.services
    }

    pub fn resources(&self) -> &ResourceManager {
        &self.core.resources
    }

    pub fn registry(&self) -> &ModuleRegistry {
        &self.registry
    }

    pub fn shutdown_requested(&self) -> bool {
        self.system.shutdown_requested()
    }

    // ── Shutdown ──────────────────────────────────────────────

    /// Stop and deinitialize every module in reverse startup order, then
    /// tear down their subscriptions, services and resource locks.
    /// Modules that never left DISABLED skip `deinit`.
    pub fn shutdown(&mut self) {
        if self.phase == Phase::ShutDown {
            return;
        }
        let order = self.registry.shutdown_order();
        info!("Orchestrator: shutting down {} module(s)", order.len());
        for module in &order {
            if module.status().is_active() {
                if let Err(e) = module.stop() {
                    warn!("Orchestrator: {}", e);
                }
                self.sync_services(module, module.status());
            }
            let jobs = self.core.tasks.cancel_owned_by(module.name());
            if module.status() != ModuleStatus::Disabled {
                if let Err(e) = module.deinit() {
                    warn!("Orchestrator: {}", e);
                }
            }
            let name = module.name();
            let subs = self.core.bus.unsubscribe_all(name);
            let services = self.core.services.unregister_owned_by(name);
            let locks = self.core.resources.release_all(name);
            info!(
                "Orchestrator: '{}' torn down ({} job(s), {} subscription(s), {} service(s), {} lock(s))",
                name, jobs, subs, services, locks
            );
        }
        self.registry.drain();
        self.core.tasks.stop();
        self.core.bus.stop_dispatcher();
        self.core.bus.dispatch_pending();
        if let Err(e) = self.core.services.unregister(SYSTEM_SERVICE) {
            warn!("Orchestrator: {}", e);
        }
        self.phase = Phase::ShutDown;
        info!("Orchestrator: shutdown complete");
    }
}

impl Drop for Orchestrator {
    fn drop(&mut self) {
        // Slots hold the core context, which holds the system service,
        // which holds the registry: only shutdown breaks that cycle.
        self.shutdown();
    }
}
