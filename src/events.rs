//! Well-known framework event identifiers.
//!
//! Modules define their own ids freely; the kernel itself only posts
//! these.  Payload types are noted per event.
//!
//! ```text
//! ┌───────────────────────────┐        ┌─────────────────────────┐
//! │ Orchestrator              │──────▶│ SYSTEM_START_COMPLETE   │
//! │                           │──────▶│ MODULE_ENABLED/DISABLED │
//! │                           │──────▶│ CONFIG_UPDATED          │
//! │ SystemApi                 │──────▶│ SYSTEM_SHUTDOWN_REQ...  │
//! │ ServiceLocator            │──────▶│ SERVICE_STATUS_CHANGED  │
//! └───────────────────────────┘        └─────────────────────────┘
//! ```

pub use crate::bus::WILDCARD;

/// Every module has been through init and start.  Payload: `StartupReport`.
pub const SYSTEM_START_COMPLETE: &str = "SYSTEM_START_COMPLETE";

/// Something asked the device to shut down or reboot.  No payload.
pub const SYSTEM_SHUTDOWN_REQUESTED: &str = "SYSTEM_SHUTDOWN_REQUESTED";

/// A configuration key changed.  Payload: the dot-notation key (`String`).
pub const CONFIG_UPDATED: &str = "CONFIG_UPDATED";

/// A module was enabled by name.  Payload: module name (`String`).
pub const MODULE_ENABLED: &str = "MODULE_ENABLED";

/// A module was disabled by name.  Payload: module name (`String`).
pub const MODULE_DISABLED: &str = "MODULE_DISABLED";

/// A service changed status.  Payload: `services::StatusChange`.
pub const SERVICE_STATUS_CHANGED: &str = "SERVICE_STATUS_CHANGED";
