//! Module model: the [`Module`] trait, its lifecycle status and the shared
//! slot the kernel keeps for every registered instance.
//!
//! ```text
//! ┌──────────────────────────── ModuleSlot ────────────────────────────┐
//! │ name · kind · init_level                                           │
//! │ status (AtomicU8, lock-free reads)   history (last 8 statuses)     │
//! │ Mutex<Box<dyn Module>>  ◀── lifecycle calls and event delivery     │
//! │ config fragment · resolved dependencies · CoreContext              │
//! └────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Status only changes while the module mutex is held, so lifecycle calls
//! and event handlers of one module never overlap.

pub mod context;
pub mod lifecycle;

use core::cell::RefCell;
use core::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Weak};

use heapless::HistoryBuffer;
use log::{error, info, warn};
use parking_lot::{Mutex, RwLock};

use crate::bus::payload::Payload;
use crate::config::{ConfigFragment, MAX_NAME_LEN};
use crate::error::{Error, Result};

pub use context::{CoreContext, ModuleContext};
pub use lifecycle::LifecycleOp;

/// Fixed-capacity module / owner name.
pub type ModuleName = heapless::String<MAX_NAME_LEN>;

/// Build a [`ModuleName`], rejecting empty or over-long names.
pub fn module_name(name: &str) -> Result<ModuleName> {
    if name.is_empty() {
        return Err(Error::InvalidArgument("empty module name"));
    }
    let mut out = ModuleName::new();
    out.push_str(name)
        .map_err(|()| Error::InvalidArgument("module name longer than 32 bytes"))?;
    Ok(out)
}

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ModuleStatus {
    Disabled = 0,
    Initialized = 1,
    Enabled = 2,
    Running = 3,
    Stopped = 4,
    Error = 5,
    Unknown = 6,
}

impl ModuleStatus {
    /// Decode a status cell; anything unrecognised reads as `Unknown`.
    pub const fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Self::Disabled,
            1 => Self::Initialized,
            2 => Self::Enabled,
            3 => Self::Running,
            4 => Self::Stopped,
            5 => Self::Error,
            _ => Self::Unknown,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Disabled => "DISABLED",
            Self::Initialized => "INITIALIZED",
            Self::Enabled => "ENABLED",
            Self::Running => "RUNNING",
            Self::Stopped => "STOPPED",
            Self::Error => "ERROR",
            Self::Unknown => "UNKNOWN",
        }
    }

    /// Running or enabled: the module is live and must be stopped at shutdown.
    pub const fn is_active(self) -> bool {
        matches!(self, Self::Running | Self::Enabled)
    }
}

impl fmt::Display for ModuleStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Init level
// ---------------------------------------------------------------------------

/// Startup priority, 0 (first) to 100 (last).
///
/// | Band    | Intended for                      |
/// |---------|-----------------------------------|
/// | 0–19    | drivers, resource owners          |
/// | 20–39   | base system services              |
/// | 40–59   | networking, control               |
/// | 60–79   | application logic                 |
/// | 80–100  | composite / high-level modules    |
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct InitLevel(u8);

impl InitLevel {
    pub const MAX: u8 = 100;

    pub const DRIVER: Self = Self(10);
    pub const BASE_SERVICE: Self = Self(30);
    pub const NETWORK: Self = Self(50);
    pub const APPLICATION: Self = Self(70);
    pub const COMPOSITE: Self = Self(90);

    pub const fn new(level: u8) -> Option<Self> {
        if level <= Self::MAX { Some(Self(level)) } else { None }
    }

    pub const fn get(self) -> u8 {
        self.0
    }

    pub const fn band(self) -> &'static str {
        match self.0 {
            0..=19 => "driver",
            20..=39 => "base-service",
            40..=59 => "network",
            60..=79 => "application",
            _ => "composite",
        }
    }
}

impl fmt::Display for InitLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Dependencies
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DependencyKind {
    /// The config value names a service in the locator.
    Service,
    /// The config value names another module instance.
    Module,
}

/// A dependency declared by a module: `key` names a string field in the
/// module's config whose value is the service or module to inject.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Dependency {
    pub key: &'static str,
    pub kind: DependencyKind,
}

impl Dependency {
    pub const fn service(key: &'static str) -> Self {
        Self {
            key,
            kind: DependencyKind::Service,
        }
    }

    pub const fn module(key: &'static str) -> Self {
        Self {
            key,
            kind: DependencyKind::Module,
        }
    }
}

/// A dependency after the orchestrator found its target.
#[derive(Clone)]
pub enum Resolved {
    Service { key: &'static str, name: String },
    Module { key: &'static str, handle: ModuleHandle },
}

impl Resolved {
    pub fn key(&self) -> &'static str {
        match self {
            Self::Service { key, .. } | Self::Module { key, .. } => key,
        }
    }
}

// ---------------------------------------------------------------------------
// Module trait
// ---------------------------------------------------------------------------

/// Capability set every pluggable module implements.
///
/// All calls are made with the module's slot mutex held, on the
/// orchestrator's thread (lifecycle) or the bus dispatch context (events).
/// Returning `Err` from a lifecycle call moves the module to ERROR.
pub trait Module: Send {
    /// Acquire resources, register services, subscribe to events.
    fn init(&mut self, ctx: &ModuleContext<'_>) -> Result<()>;

    fn start(&mut self, _ctx: &ModuleContext<'_>) -> Result<()> {
        Ok(())
    }

    fn stop(&mut self, _ctx: &ModuleContext<'_>) -> Result<()> {
        Ok(())
    }

    fn enable(&mut self, _ctx: &ModuleContext<'_>) -> Result<()> {
        Ok(())
    }

    fn disable(&mut self, _ctx: &ModuleContext<'_>) -> Result<()> {
        Ok(())
    }

    /// Apply a new configuration.  Only called while STOPPED or DISABLED.
    fn reconfigure(&mut self, _ctx: &ModuleContext<'_>, _config: &ConfigFragment) -> Result<()> {
        Ok(())
    }

    fn handle_event(
        &mut self,
        _ctx: &ModuleContext<'_>,
        _event: &str,
        _payload: Option<&Payload>,
    ) -> Result<()> {
        Ok(())
    }

    /// Release everything acquired in `init`.
    fn deinit(&mut self, _ctx: &ModuleContext<'_>) -> Result<()> {
        Ok(())
    }

    /// Services and modules to resolve from config before `init`.
    fn dependencies(&self) -> &[Dependency] {
        &[]
    }
}

// ---------------------------------------------------------------------------
// Module slot
// ---------------------------------------------------------------------------

pub type ModuleHandle = Arc<ModuleSlot>;

const HISTORY_DEPTH: usize = 8;

thread_local! {
    /// Slots whose module mutex is held by a callback on this thread.
    static ACTIVE_SLOTS: RefCell<Vec<usize>> = const { RefCell::new(Vec::new()) };
}

struct ActiveGuard(usize);

impl ActiveGuard {
    fn enter(slot: &ModuleSlot) -> Self {
        let key = core::ptr::from_ref(slot) as usize;
        ACTIVE_SLOTS.with(|s| s.borrow_mut().push(key));
        Self(key)
    }
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        ACTIVE_SLOTS.with(|s| {
            let mut slots = s.borrow_mut();
            if let Some(pos) = slots.iter().rposition(|k| *k == self.0) {
                slots.remove(pos);
            }
        });
    }
}

pub struct ModuleSlot {
    name: ModuleName,
    kind: String,
    init_level: InitLevel,
    status: AtomicU8,
    history: Mutex<HistoryBuffer<ModuleStatus, HISTORY_DEPTH>>,
    module: Mutex<Box<dyn Module>>,
    config: RwLock<ConfigFragment>,
    resolved: Mutex<Vec<Resolved>>,
    core: CoreContext,
    me: Weak<ModuleSlot>,
}

impl ModuleSlot {
    pub fn new(
        name: &str,
        kind: &str,
        init_level: InitLevel,
        module: Box<dyn Module>,
        config: ConfigFragment,
        core: CoreContext,
    ) -> Result<ModuleHandle> {
        let name = module_name(name)?;
        let mut history = HistoryBuffer::new();
        history.write(ModuleStatus::Disabled);
        Ok(Arc::new_cyclic(|me| Self {
            name,
            kind: kind.to_owned(),
            init_level,
            status: AtomicU8::new(ModuleStatus::Disabled as u8),
            history: Mutex::new(history),
            module: Mutex::new(module),
            config: RwLock::new(config),
            resolved: Mutex::new(Vec::new()),
            core,
            me: me.clone(),
        }))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn init_level(&self) -> InitLevel {
        self.init_level
    }

    /// Never blocks.
    pub fn status(&self) -> ModuleStatus {
        ModuleStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    /// Statuses this module passed through, oldest first (last 8).
    pub fn history(&self) -> Vec<ModuleStatus> {
        self.history.lock().oldest_ordered().copied().collect()
    }

    pub fn config(&self) -> ConfigFragment {
        self.config.read().clone()
    }

    pub fn core(&self) -> &CoreContext {
        &self.core
    }

    pub(crate) fn weak(&self) -> Weak<ModuleSlot> {
        self.me.clone()
    }

    pub(crate) fn resolved(&self) -> Vec<Resolved> {
        self.resolved.lock().clone()
    }

    pub(crate) fn set_resolved(&self, resolved: Vec<Resolved>) {
        *self.resolved.lock() = resolved;
    }

    pub fn dependencies(&self) -> Vec<Dependency> {
        self.module.lock().dependencies().to_vec()
    }

    // ── Lifecycle ─────────────────────────────────────────────

    pub fn init(&self) -> Result<ModuleStatus> {
        self.apply(LifecycleOp::Init, |m, ctx| m.init(ctx))
    }

    pub fn start(&self) -> Result<ModuleStatus> {
        self.apply(LifecycleOp::Start, |m, ctx| m.start(ctx))
    }

    pub fn stop(&self) -> Result<ModuleStatus> {
        self.apply(LifecycleOp::Stop, |m, ctx| m.stop(ctx))
    }

    pub fn enable(&self) -> Result<ModuleStatus> {
        self.apply(LifecycleOp::Enable, |m, ctx| m.enable(ctx))
    }

    pub fn disable(&self) -> Result<ModuleStatus> {
        self.apply(LifecycleOp::Disable, |m, ctx| m.disable(ctx))
    }

    /// Hand the module a new fragment; it replaces the stored one on success.
    pub fn reconfigure(&self, config: ConfigFragment) -> Result<ModuleStatus> {
        let status = self.apply(LifecycleOp::Reconfigure, |m, ctx| m.reconfigure(ctx, &config))?;
        *self.config.write() = config;
        Ok(status)
    }

    pub fn deinit(&self) -> Result<ModuleStatus> {
        let result = self.apply(LifecycleOp::Deinit, |m, ctx| m.deinit(ctx));
        self.resolved.lock().clear();
        result
    }

    /// Move to ERROR for a failure detected outside the module itself
    /// (e.g. an unresolved dependency) and return the matching error.
    pub fn fail(&self, op: LifecycleOp, reason: String) -> Error {
        let _module = self.module.lock();
        self.set_status(ModuleStatus::Error);
        error!("module '{}': {} failed: {}", self.name, op, reason);
        Error::Init {
            module: self.name.to_string(),
            op: op.name(),
            reason,
        }
    }

    fn apply<F>(&self, op: LifecycleOp, call: F) -> Result<ModuleStatus>
    where
        F: FnOnce(&mut dyn Module, &ModuleContext<'_>) -> Result<()>,
    {
        let mut module = self.module.lock();
        let from = self.status();
        if !op.permits(from) {
            warn!("module '{}': cannot {} while {}", self.name, op, from);
            return Err(Error::StateConflict {
                module: self.name.to_string(),
                op: op.name(),
                state: from,
            });
        }

        let ctx = ModuleContext::new(self);
        let outcome = {
            let _active = ActiveGuard::enter(self);
            call(module.as_mut(), &ctx)
        };
        match outcome {
            Ok(()) => {
                let to = op.target(from);
                self.set_status(to);
                Ok(to)
            }
            Err(e) => {
                self.set_status(ModuleStatus::Error);
                error!("module '{}': {} failed: {}", self.name, op, e);
                Err(Error::Init {
                    module: self.name.to_string(),
                    op: op.name(),
                    reason: e.to_string(),
                })
            }
        }
    }

    fn set_status(&self, to: ModuleStatus) {
        let from = ModuleStatus::from_u8(self.status.swap(to as u8, Ordering::AcqRel));
        if from != to {
            self.history.lock().write(to);
            info!("module '{}': {} -> {}", self.name, from, to);
        }
    }

    // ── Event delivery ────────────────────────────────────────

    /// Run the module's handler unless `still_subscribed` turns false
    /// before the module mutex is acquired.
    pub(crate) fn deliver(
        &self,
        event: &str,
        payload: Option<&Payload>,
        still_subscribed: impl Fn() -> bool,
    ) -> bool {
        let mut module = self.module.lock();
        if !still_subscribed() {
            return false;
        }
        let ctx = ModuleContext::new(self);
        let _active = ActiveGuard::enter(self);
        if let Err(e) = module.handle_event(&ctx, event, payload) {
            warn!("module '{}': handler for '{}' failed: {}", self.name, event, e);
        }
        true
    }

    /// Whether a callback of this module is executing on the current thread.
    pub(crate) fn is_active_here(&self) -> bool {
        let key = core::ptr::from_ref(self) as usize;
        ACTIVE_SLOTS.with(|s| s.borrow().contains(&key))
    }

    /// Wait until no callback of this module is running on another thread.
    pub(crate) fn quiesce(&self) {
        if !self.is_active_here() {
            drop(self.module.lock());
        }
    }
}

impl fmt::Debug for ModuleSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModuleSlot")
            .field("name", &self.name.as_str())
            .field("kind", &self.kind)
            .field("init_level", &self.init_level)
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}
