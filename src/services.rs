//! Service locator: capability interfaces published by name.
//!
//! Modules register an interface (usually `Arc<dyn SomeApi>`) during
//! `init`; other modules look it up by name or type tag and call it
//! directly.  The locator never interprets the interface and never
//! resolves transitively.
//!
//! | Field   | Meaning                                         |
//! |---------|-------------------------------------------------|
//! | name    | unique key                                      |
//! | owner   | module that registered it (teardown bookkeeping)|
//! | type    | [`ServiceType`] tag, grouped into categories    |
//! | status  | mirrors the owner's lifecycle                   |

use core::any::Any;
use core::fmt;

use log::{debug, info, warn};
use parking_lot::Mutex;

use crate::bus::EventBus;
use crate::bus::payload::{EventPayload, Payload};
use crate::error::{Error, Result};
use crate::events;
use crate::module::ModuleStatus;

// ───────────────────────────────────────────────────────────────
// Type tags
// ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServiceType {
    Display,
    I2cBus,
    SpiBus,
    Uart,
    Wifi,
    Mqtt,
    Http,
    Ble,
    Storage,
    Sensor,
    Actuator,
    System,
    TimeSync,
    Ota,
    Security,
    Audio,
    Power,
    Custom(&'static str),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServiceCategory {
    Display,
    Communication,
    Network,
    Storage,
    Sensor,
    Actuator,
    System,
    Security,
    Audio,
    Power,
    Unknown,
}

impl ServiceType {
    pub const fn category(self) -> ServiceCategory {
        match self {
            Self::Display => ServiceCategory::Display,
            Self::I2cBus | Self::SpiBus | Self::Uart => ServiceCategory::Communication,
            Self::Wifi | Self::Mqtt | Self::Http | Self::Ble => ServiceCategory::Network,
            Self::Storage => ServiceCategory::Storage,
            Self::Sensor => ServiceCategory::Sensor,
            Self::Actuator => ServiceCategory::Actuator,
            Self::System | Self::TimeSync | Self::Ota => ServiceCategory::System,
            Self::Security => ServiceCategory::Security,
            Self::Audio => ServiceCategory::Audio,
            Self::Power => ServiceCategory::Power,
            Self::Custom(_) => ServiceCategory::Unknown,
        }
    }
}

impl fmt::Display for ServiceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Custom(tag) => write!(f, "custom:{tag}"),
            other => write!(f, "{other:?}"),
        }
    }
}

// ───────────────────────────────────────────────────────────────
// Status
// ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServiceStatus {
    Registered,
    Initializing,
    Active,
    Stopping,
    Error,
    Unknown,
}

impl ServiceStatus {
    /// Service status implied by its owner's lifecycle state.
    pub const fn for_module(status: ModuleStatus) -> Self {
        match status {
            ModuleStatus::Disabled => Self::Registered,
            ModuleStatus::Initialized => Self::Initializing,
            ModuleStatus::Enabled | ModuleStatus::Running => Self::Active,
            ModuleStatus::Stopped => Self::Stopping,
            ModuleStatus::Error => Self::Error,
            ModuleStatus::Unknown => Self::Unknown,
        }
    }
}

/// Payload of [`events::SERVICE_STATUS_CHANGED`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusChange {
    pub service: String,
    pub status: ServiceStatus,
}

impl EventPayload for StatusChange {}

// ───────────────────────────────────────────────────────────────
// Locator
// ───────────────────────────────────────────────────────────────

struct Entry {
    name: String,
    owner: String,
    ty: ServiceType,
    status: ServiceStatus,
    iface: Box<dyn Any + Send + Sync>,
}

/// Summary of one registration, without its interface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceInfo {
    pub name: String,
    pub owner: String,
    pub ty: ServiceType,
    pub status: ServiceStatus,
}

pub struct ServiceLocator {
    entries: Mutex<Vec<Entry>>,
    bus: EventBus,
}

impl ServiceLocator {
    pub fn new(bus: EventBus) -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
            bus,
        }
    }

    pub fn register<I>(&self, name: &str, owner: &str, ty: ServiceType, iface: I) -> Result<()>
    where
        I: Clone + Send + Sync + 'static,
    {
        if name.is_empty() {
            return Err(Error::InvalidArgument("empty service name"));
        }
        let mut entries = self.entries.lock();
        if entries.iter().any(|e| e.name == name) {
            warn!("ServiceLocator: '{}' already registered", name);
            return Err(Error::AlreadyRegistered(name.to_owned()));
        }
        entries.push(Entry {
            name: name.to_owned(),
            owner: owner.to_owned(),
            ty,
            status: ServiceStatus::Registered,
            iface: Box::new(iface),
        });
        info!("ServiceLocator: '{}' ({}) registered by '{}'", name, ty, owner);
        Ok(())
    }

    pub fn unregister(&self, name: &str) -> Result<()> {
        let mut entries = self.entries.lock();
        let pos = entries
            .iter()
            .position(|e| e.name == name)
            .ok_or_else(|| Error::NotFound(name.to_owned()))?;
        entries.remove(pos);
        debug!("ServiceLocator: '{}' unregistered", name);
        Ok(())
    }

    /// Drop every service registered by `owner`.  Returns how many.
    pub fn unregister_owned_by(&self, owner: &str) -> usize {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|e| e.owner != owner);
        before - entries.len()
    }

    /// Clone of the interface registered as `name`.
    pub fn get<I>(&self, name: &str) -> Result<I>
    where
        I: Clone + Send + Sync + 'static,
    {
        let entries = self.entries.lock();
        let entry = entries
            .iter()
            .find(|e| e.name == name)
            .ok_or_else(|| Error::NotFound(name.to_owned()))?;
        entry
            .iface
            .downcast_ref::<I>()
            .cloned()
            .ok_or_else(|| Error::TypeMismatch(name.to_owned()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.lock().iter().any(|e| e.name == name)
    }

    pub fn get_type(&self, name: &str) -> Result<ServiceType> {
        self.with_entry(name, |e| e.ty)
    }

    pub fn status(&self, name: &str) -> Result<ServiceStatus> {
        self.with_entry(name, |e| e.status)
    }

    pub fn info(&self, name: &str) -> Result<ServiceInfo> {
        self.with_entry(name, Entry::info)
    }

    /// Every registration tagged `ty`, in registration order.
    pub fn lookup_by_type(&self, ty: ServiceType) -> Vec<ServiceInfo> {
        self.entries
            .lock()
            .iter()
            .filter(|e| e.ty == ty)
            .map(Entry::info)
            .collect()
    }

    pub fn lookup_by_category(&self, category: ServiceCategory) -> Vec<ServiceInfo> {
        self.entries
            .lock()
            .iter()
            .filter(|e| e.ty.category() == category)
            .map(Entry::info)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Update a service's status and announce the change on the bus.
    pub fn set_status(&self, name: &str, status: ServiceStatus) -> Result<()> {
        let changed = {
            let mut entries = self.entries.lock();
            let entry = entries
                .iter_mut()
                .find(|e| e.name == name)
                .ok_or_else(|| Error::NotFound(name.to_owned()))?;
            let changed = entry.status != status;
            entry.status = status;
            changed
        };
        if changed {
            self.announce(name, status);
        }
        Ok(())
    }

    /// Move every service of `owner` to `status`.
    pub fn set_status_for_owner(&self, owner: &str, status: ServiceStatus) {
        let changed: Vec<String> = {
            let mut entries = self.entries.lock();
            entries
                .iter_mut()
                .filter(|e| e.owner == owner && e.status != status)
                .map(|e| {
                    e.status = status;
                    e.name.clone()
                })
                .collect()
        };
        for name in changed {
            self.announce(&name, status);
        }
    }

    fn announce(&self, name: &str, status: ServiceStatus) {
        debug!("ServiceLocator: '{}' -> {:?}", name, status);
        let change = StatusChange {
            service: name.to_owned(),
            status,
        };
        if let Err(e) = self
            .bus
            .post(events::SERVICE_STATUS_CHANGED, Some(Payload::new(change)))
        {
            warn!("ServiceLocator: status event for '{}' lost: {}", name, e);
        }
    }

    fn with_entry<T>(&self, name: &str, f: impl FnOnce(&Entry) -> T) -> Result<T> {
        self.entries
            .lock()
            .iter()
            .find(|e| e.name == name)
            .map(f)
            .ok_or_else(|| Error::NotFound(name.to_owned()))
    }
}

impl Entry {
    fn info(&self) -> ServiceInfo {
        ServiceInfo {
            name: self.name.clone(),
            owner: self.owner.clone(),
            ty: self.ty,
            status: self.status,
        }
    }
}
