//! Fuzz target: boot from an arbitrary configuration
//!
//! Builds, starts and shuts down an orchestrator from arbitrary JSON with
//! the event logger as the only module kind, verifying:
//! - No panics or deadlocks for any configuration
//! - Every module that started is stopped again by shutdown
//! - Shutdown leaves no registered modules behind
//!
//! cargo fuzz run fuzz_boot

#![no_main]

use fwkernel::adapters::log_sink::{self, EventLogger};
use fwkernel::config::{ConfigManager, ConfigTree};
use fwkernel::factory::ModuleFactory;
use fwkernel::system::Orchestrator;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Ok(tree) = ConfigTree::from_slice(data) else {
        return;
    };
    let factory =
        ModuleFactory::new().with(log_sink::KIND, log_sink::DEFAULT_LEVEL, EventLogger::construct);
    let Ok(mut kernel) = Orchestrator::new(ConfigManager::detached(tree), factory) else {
        return;
    };

    let registered = kernel.registry().len();
    let report = kernel.start();
    assert_eq!(report.started.len() + report.failed.len(), registered);
    kernel.bus().dispatch_pending();

    kernel.shutdown();
    assert!(kernel.registry().is_empty());
});
