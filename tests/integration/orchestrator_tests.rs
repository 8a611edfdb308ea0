//! Orchestrator scenarios: ordering, failure isolation, dependency
//! injection, runtime control and teardown.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::{Value, json};

use fwkernel::config::{ConfigManager, ConfigRead, ModuleDefinition};
use fwkernel::error::{ConfigError, Error};
use fwkernel::events;
use fwkernel::module::ModuleStatus;
use fwkernel::resources::ResourceType;
use fwkernel::services::ServiceStatus;
use fwkernel::system::{Orchestrator, SYSTEM_SERVICE, SystemApi};

use crate::mock_modules::{Journal, calls, lines_with, scripted_factory};

fn kernel(modules: Value, journal: &Journal) -> Orchestrator {
    let config = ConfigManager::from_json(&json!({ "modules": modules }).to_string()).unwrap();
    Orchestrator::new(config, scripted_factory(journal)).unwrap()
}

fn scripted(name: &str, extra: Value) -> Value {
    let mut config = json!({ "instance_name": name });
    if let (Some(base), Value::Object(more)) = (config.as_object_mut(), extra) {
        base.extend(more);
    }
    json!({ "type": "scripted", "config": config })
}

// ── Ordering ──────────────────────────────────────────────────

#[test]
fn init_levels_order_startup_and_reverse_shutdown() {
    let journal = Journal::default();
    let mut modules = vec![
        scripted("late", json!({})),
        scripted("mid_a", json!({})),
        scripted("first", json!({})),
        scripted("mid_b", json!({})),
    ];
    for (m, level) in modules.iter_mut().zip([90, 50, 10, 50]) {
        m["init_level"] = json!(level);
    }
    let mut k = kernel(Value::Array(modules), &journal);

    let report = k.start();
    assert!(report.is_clean());
    assert_eq!(calls(&journal, "init"), ["first", "mid_a", "mid_b", "late"]);
    assert_eq!(calls(&journal, "start"), ["first", "mid_a", "mid_b", "late"]);
    assert_eq!(report.started, ["first", "mid_a", "mid_b", "late"]);

    let init_count = journal.lock().iter().filter(|l| l.ends_with(":init")).count();
    let first_start = journal
        .lock()
        .iter()
        .position(|l| l.ends_with(":start"))
        .unwrap();
    assert_eq!(init_count, first_start, "all inits happen before any start");

    k.shutdown();
    assert_eq!(calls(&journal, "stop"), ["late", "mid_b", "mid_a", "first"]);
    assert_eq!(calls(&journal, "deinit"), ["late", "mid_b", "mid_a", "first"]);
    assert!(k.registry().is_empty());
}

#[test]
fn kind_default_level_applies_without_override() {
    let journal = Journal::default();
    let mut k = kernel(
        json!([
            scripted("app", json!({})),
            { "type": "driver", "config": { "instance_name": "drv" } }
        ]),
        &journal,
    );
    k.start();
    assert_eq!(calls(&journal, "init"), ["drv", "app"]);
}

// ── Configuration errors ──────────────────────────────────────

#[test]
fn bad_definitions_are_omitted_and_others_start() {
    let journal = Journal::default();
    let mut k = kernel(
        json!([
            scripted("good", json!({})),
            { "enabled": true },
            { "type": "teleporter" },
            scripted("picky", json!({ "fail_construct": true })),
            scripted("good", json!({})),
            { "type": "scripted", "enabled": false, "config": { "instance_name": "off" } }
        ]),
        &journal,
    );
    assert_eq!(k.registry().len(), 1);
    let report = k.start();
    assert_eq!(report.started, ["good"]);
    assert_eq!(k.module_status("good").unwrap(), ModuleStatus::Running);
    assert!(matches!(k.module_status("off"), Err(Error::NotFound(_))));
}

#[test]
fn invalid_module_config_leaves_registry_unchanged() {
    let journal = Journal::default();
    let k = kernel(json!([scripted("a", json!({}))]), &journal);
    let before = k.registry().len();
    let def = ModuleDefinition::new("scripted", json!({ "instance_name": "b", "fail_construct": true }));
    assert!(matches!(
        k.add_module(&def),
        Err(Error::Config(ConfigError::Invalid(_)))
    ));
    assert_eq!(k.registry().len(), before);
}

#[test]
fn malformed_modules_list_aborts_construction() {
    let journal = Journal::default();
    let config = ConfigManager::from_json(r#"{ "modules": { "type": "scripted" } }"#).unwrap();
    assert!(matches!(
        Orchestrator::new(config, scripted_factory(&journal)),
        Err(Error::Config(ConfigError::TypeMismatch(_)))
    ));
}

// ── Failure isolation ─────────────────────────────────────────

#[test]
fn failing_init_is_isolated() {
    let journal = Journal::default();
    let mut k = kernel(
        json!([
            scripted("a", json!({})),
            scripted("broken", json!({ "fail_on": "init" })),
            scripted("c", json!({}))
        ]),
        &journal,
    );
    let report = k.start();
    assert_eq!(report.started, ["a", "c"]);
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].0, "broken");
    assert!(matches!(report.failed[0].1, Error::Init { op: "init", .. }));
    assert_eq!(k.module_status("broken").unwrap(), ModuleStatus::Error);
    assert!(calls(&journal, "start").iter().all(|m| m != "broken"));
}

#[test]
fn failing_start_is_isolated_and_sticky() {
    let journal = Journal::default();
    let mut k = kernel(
        json!([scripted("ok", json!({})), scripted("flaky", json!({ "fail_on": "start" }))]),
        &journal,
    );
    let report = k.start();
    assert_eq!(report.started, ["ok"]);
    assert_eq!(k.module_status("flaky").unwrap(), ModuleStatus::Error);
    assert!(matches!(
        k.start_module("flaky"),
        Err(Error::StateConflict { state: ModuleStatus::Error, .. })
    ));
}

// ── Runtime control ───────────────────────────────────────────

#[test]
fn reconfigure_while_running_is_rejected() {
    let journal = Journal::default();
    let mut k = kernel(json!([scripted("m", json!({}))]), &journal);
    k.start();
    let err = k.reconfigure_module("m", json!({ "instance_name": "m", "x": 1 }));
    assert!(matches!(
        err,
        Err(Error::StateConflict { op: "reconfigure", state: ModuleStatus::Running, .. })
    ));
    assert_eq!(k.module_status("m").unwrap(), ModuleStatus::Running);
    assert!(calls(&journal, "reconfigure").is_empty());
}

#[test]
fn reconfigure_when_stopped_updates_fragment_and_tree() {
    let journal = Journal::default();
    let mut k = kernel(json!([scripted("m", json!({ "rate": 1 }))]), &journal);
    k.start();
    k.stop_module("m").unwrap();
    k.reconfigure_module("m", json!({ "instance_name": "m", "rate": 5 }))
        .unwrap();
    assert_eq!(k.module_status("m").unwrap(), ModuleStatus::Stopped);
    assert_eq!(k.module_config("m").unwrap().int("rate").unwrap(), 5);
    assert_eq!(k.config().get_int("modules.0.config.rate", 0), 5);
    k.start_module("m").unwrap();
    assert_eq!(k.module_status("m").unwrap(), ModuleStatus::Running);
}

#[test]
fn enable_and_disable_announce_on_the_bus() {
    let journal = Journal::default();
    let mut k = kernel(
        json!([
            scripted("watcher", json!({ "subscribe": [events::MODULE_ENABLED, events::MODULE_DISABLED] })),
            scripted("m", json!({}))
        ]),
        &journal,
    );
    k.start();
    k.stop_module("m").unwrap();
    k.enable_module("m").unwrap();
    assert_eq!(k.module_status("m").unwrap(), ModuleStatus::Enabled);
    k.disable_module("m").unwrap();
    assert_eq!(k.module_status("m").unwrap(), ModuleStatus::Stopped);
    k.bus().dispatch_pending();

    assert_eq!(
        lines_with(&journal, "watcher:event"),
        [
            format!("watcher:event:{}(m)", events::MODULE_ENABLED),
            format!("watcher:event:{}(m)", events::MODULE_DISABLED),
        ]
    );
    assert!(matches!(k.enable_module("ghost"), Err(Error::NotFound(_))));
}

#[test]
fn start_module_initializes_late_additions() {
    let journal = Journal::default();
    let mut k = kernel(json!([]), &journal);
    k.start();
    let def = ModuleDefinition::new("scripted", json!({ "instance_name": "hotplug" }));
    k.add_module(&def).unwrap();
    assert_eq!(k.module_status("hotplug").unwrap(), ModuleStatus::Disabled);
    k.start_module("hotplug").unwrap();
    assert_eq!(calls(&journal, "init"), ["hotplug"]);
    assert_eq!(k.module_status("hotplug").unwrap(), ModuleStatus::Running);
}

// ── Dependency injection ──────────────────────────────────────

#[test]
fn dependencies_resolved_from_config() {
    let journal = Journal::default();
    let mut provider = scripted("provider", json!({ "service": "bus0" }));
    provider["init_level"] = json!(20);
    let mut k = kernel(
        json!([
            scripted("consumer", json!({ "needs_deps": true, "bus_service": "bus0", "peer_handle": "provider" })),
            provider
        ]),
        &journal,
    );
    let report = k.start();
    assert!(report.is_clean(), "{:?}", report.failed);
    assert_eq!(
        lines_with(&journal, "consumer:dep"),
        ["consumer:dep_service=7", "consumer:dep_module=provider"]
    );
}

#[test]
fn unconfigured_dependency_is_skipped() {
    let journal = Journal::default();
    let mut k = kernel(json!([scripted("solo", json!({ "needs_deps": true }))]), &journal);
    assert!(k.start().is_clean());
    assert!(lines_with(&journal, "solo:dep").is_empty());
}

#[test]
fn missing_dependency_target_fails_init() {
    let journal = Journal::default();
    let mut k = kernel(
        json!([scripted("needy", json!({ "needs_deps": true, "bus_service": "nowhere" }))]),
        &journal,
    );
    let report = k.start();
    assert_eq!(report.failed.len(), 1);
    assert!(matches!(report.failed[0].1, Error::Init { op: "init", .. }));
    assert_eq!(k.module_status("needy").unwrap(), ModuleStatus::Error);
    assert!(calls(&journal, "init").is_empty());
}

// ── Framework events and services ─────────────────────────────

#[test]
fn start_complete_event_carries_report() {
    let journal = Journal::default();
    let mut k = kernel(
        json!([scripted("listener", json!({ "subscribe": [events::SYSTEM_START_COMPLETE] }))]),
        &journal,
    );
    k.start();
    k.bus().dispatch_pending();
    assert_eq!(
        lines_with(&journal, "listener:event"),
        [format!("listener:event:{}(started=1)", events::SYSTEM_START_COMPLETE)]
    );
}

#[test]
fn service_status_follows_owner() {
    let journal = Journal::default();
    let mut k = kernel(json!([scripted("net", json!({ "service": "wifi" }))]), &journal);
    k.start();
    assert_eq!(k.services().status("wifi").unwrap(), ServiceStatus::Active);
    k.stop_module("net").unwrap();
    assert_eq!(k.services().status("wifi").unwrap(), ServiceStatus::Stopping);
    assert_eq!(
        k.services().status(SYSTEM_SERVICE).unwrap(),
        ServiceStatus::Active
    );
}

#[test]
fn system_service_lists_modules_and_requests_shutdown() {
    let journal = Journal::default();
    let mut k = kernel(
        json!([scripted("m", json!({ "subscribe": [events::SYSTEM_SHUTDOWN_REQUESTED] }))]),
        &journal,
    );
    k.start();
    let api: Arc<dyn SystemApi> = k.services().get(SYSTEM_SERVICE).unwrap();
    let infos = api.modules();
    assert_eq!(infos.len(), 1);
    assert_eq!(infos[0].status, ModuleStatus::Running);

    assert!(!k.shutdown_requested());
    api.request_shutdown();
    api.request_shutdown();
    assert!(k.shutdown_requested());
    k.bus().dispatch_pending();
    assert_eq!(lines_with(&journal, "m:event").len(), 1);
}

#[test]
fn update_config_posts_key() {
    let journal = Journal::default();
    let mut k = kernel(
        json!([scripted("cfg", json!({ "subscribe": [events::CONFIG_UPDATED] }))]),
        &journal,
    );
    k.start();
    k.update_config("global_config.device_name", json!("attic"))
        .unwrap();
    k.bus().dispatch_pending();
    assert_eq!(k.config().get_string("global_config.device_name", ""), "attic");
    assert_eq!(
        lines_with(&journal, "cfg:event"),
        [format!("cfg:event:{}(global_config.device_name)", events::CONFIG_UPDATED)]
    );
    assert!(k.save_config().is_err(), "detached config has no store");
}

// ── Teardown ──────────────────────────────────────────────────

#[test]
fn shutdown_force_releases_everything() {
    let journal = Journal::default();
    let mut k = kernel(
        json!([
            scripted("tidy", json!({ "i2c_port": 0, "service": "tidy_api", "subscribe": ["X"] })),
            scripted("leaky", json!({ "i2c_port": 1, "leak_lock": true, "subscribe": ["X"] }))
        ]),
        &journal,
    );
    k.start();
    assert!(k.resources().is_locked(ResourceType::I2cPort, 1));
    assert_eq!(k.bus().subscriber_count("X"), 2);

    let core = k.core().clone();
    k.shutdown();
    assert!(!core.resources.is_locked(ResourceType::I2cPort, 0));
    assert!(!core.resources.is_locked(ResourceType::I2cPort, 1));
    assert_eq!(core.bus.subscriber_count("X"), 0);
    assert!(core.services.is_empty());
    k.shutdown();
}

#[test]
fn dispatcher_thread_from_framework_config() {
    let journal = Journal::default();
    let config = ConfigManager::from_json(
        &json!({
            "global_config": { "framework": { "spawn_dispatcher": true } },
            "modules": [scripted("l", json!({ "subscribe": [events::SYSTEM_START_COMPLETE] }))]
        })
        .to_string(),
    )
    .unwrap();
    let mut k = Orchestrator::new(config, scripted_factory(&journal)).unwrap();
    k.start();
    assert!(k.bus().is_dispatcher_running());
    assert_eq!(k.bus().dispatch_pending(), 0, "inline dispatch yields to the thread");

    let deadline = Instant::now() + Duration::from_secs(5);
    while lines_with(&journal, "l:event").is_empty() && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(5));
    }
    k.shutdown();
    assert!(!k.bus().is_dispatcher_running());
    assert_eq!(lines_with(&journal, "l:event").len(), 1);
}
