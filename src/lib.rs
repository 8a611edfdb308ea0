//! Module orchestration kernel for pluggable IoT firmware.
//!
//! Discovers modules from configuration, builds them through a factory,
//! sequences their lifecycle by init level and lets them cooperate only
//! through the event bus, the service locator and the resource manager.
//! Deferred and periodic work runs on a shared task pool.
//!
//! ```text
//! ┌──────────────────────────── Orchestrator ────────────────────────────┐
//! │  ConfigManager ──▶ ModuleFactory ──▶ ModuleRegistry                  │
//! │                                                                      │
//! │  ┌──────────┐  ┌──────────┐  ┌──────────┐       CoreContext          │
//! │  │ module A │  │ module B │  │ module C │  ◀──  EventBus             │
//! │  └──────────┘  └──────────┘  └──────────┘       ServiceLocator       │
//! │                                                 ResourceManager      │
//! │                                                 TaskPool             │
//! └──────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The library is host-testable.  ESP-IDF specifics (NVS storage, the
//! device binary) are guarded by `#[cfg(target_os = "espidf")]`.

#![deny(unused_must_use)]

pub mod adapters;
pub mod bus;
pub mod config;
pub mod error;
pub mod events;
pub mod factory;
pub mod module;
pub mod registry;
pub mod resources;
pub mod services;
pub mod system;
pub mod tasks;

// Std-backed critical-section implementation for the bus queue's
// CriticalSectionRawMutex.
use critical_section as _;

pub use error::{ConfigError, Error, Result};
pub use system::Orchestrator;
