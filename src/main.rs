//! Firmware entry point: boots the module kernel on ESP-IDF.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │ esp_idf_logger · NvsConfigStore ──▶ ConfigManager         │
//! │                                                          │
//! │ ModuleFactory (device module kinds)                      │
//! │        │                                                 │
//! │        ▼                                                 │
//! │ Orchestrator::new ─▶ start ─▶ main loop ─▶ shutdown      │
//! │                               (dispatch events until     │
//! │                                a shutdown is requested)  │
//! └──────────────────────────────────────────────────────────┘
//! ```
#![deny(unused_must_use)]

use std::time::Duration;

use anyhow::Result;
use log::{info, warn};

use fwkernel::adapters::log_sink::{self, EventLogger};
use fwkernel::adapters::nvs::NvsConfigStore;
use fwkernel::config::{ConfigManager, ConfigTree};
use fwkernel::factory::ModuleFactory;
use fwkernel::system::Orchestrator;

/// Main-loop dispatch period.
const LOOP_PERIOD: Duration = Duration::from_millis(20);

/// Module kinds compiled into this firmware image.
fn device_factory() -> ModuleFactory {
    ModuleFactory::new().with(log_sink::KIND, log_sink::DEFAULT_LEVEL, EventLogger::construct)
}

/// Configuration used on first boot and when NVS holds nothing usable.
fn fallback_config() -> ConfigTree {
    ConfigTree::from_value(serde_json::json!({
        "modules": [ { "type": log_sink::KIND } ]
    }))
    .unwrap_or_default()
}

fn main() -> Result<()> {
    // ── 1. ESP-IDF bootstrap ──────────────────────────────────
    esp_idf_svc::sys::link_patches();
    esp_idf_logger::init()?;
    info!("fwkernel v{}", env!("CARGO_PKG_VERSION"));

    // ── 2. Configuration ──────────────────────────────────────
    let store = NvsConfigStore::new()?;
    let config = match ConfigManager::load_or_seed(Box::new(store), fallback_config()) {
        Ok(cfg) => cfg,
        Err(e) => {
            warn!("Config load failed ({}), using fallback", e);
            ConfigManager::with_store(fallback_config(), Box::new(NvsConfigStore::new()?))
        }
    };
    if config.is_dirty() {
        info!("First boot: writing default configuration");
        if let Err(e) = config.save() {
            warn!("Default config not saved: {}", e);
        }
    }

    // ── 3. Kernel ─────────────────────────────────────────────
    let mut kernel = Orchestrator::new(config, device_factory())?;
    let report = kernel.start();
    for (name, err) in &report.failed {
        warn!("module '{}' not running: {}", name, err);
    }

    // ── 4. Main loop ──────────────────────────────────────────
    while !kernel.shutdown_requested() {
        kernel.bus().dispatch_pending();
        std::thread::sleep(LOOP_PERIOD);
    }

    // ── 5. Orderly teardown and reboot ────────────────────────
    kernel.bus().dispatch_pending();
    if kernel.config().is_dirty() {
        if let Err(e) = kernel.save_config() {
            warn!("Config not saved: {}", e);
        }
    }
    kernel.shutdown();
    info!("Rebooting");
    // SAFETY: all modules are deinitialized; nothing else runs after this.
    unsafe { esp_idf_svc::sys::esp_restart() };
    Ok(())
}
