//! Mock modules for integration tests.
//!
//! `Scripted` records every lifecycle call and event delivery in a shared
//! journal so tests can assert on the exact sequence.  Its behaviour is
//! driven entirely by its config fragment:
//!
//! | key              | effect                                         |
//! |------------------|------------------------------------------------|
//! | `fail_on`        | lifecycle op name that returns an error        |
//! | `fail_construct` | constructor rejects the config                 |
//! | `subscribe`      | event ids subscribed in `init`                 |
//! | `service`        | service name registered in `init` (u32 = 7)    |
//! | `i2c_port`       | I²C port locked in `init`                      |
//! | `leak_lock`      | do not release the port in `deinit`            |
//! | `needs_deps`     | declare `bus_service` / `peer_handle` deps     |
//! | `spi_lease`      | SPI host leased in `init`, dropped in `deinit` |
//! | `tick_ms`        | periodic job scheduled in `start`              |

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;

use fwkernel::bus::payload::Payload;
use fwkernel::config::{ConfigFragment, ConfigRead};
use fwkernel::error::{ConfigError, Error, Result};
use fwkernel::factory::ModuleFactory;
use fwkernel::module::{Dependency, InitLevel, Module, ModuleContext};
use fwkernel::resources::{ResourceLease, ResourceType};
use fwkernel::services::ServiceType;
use fwkernel::system::StartupReport;
use fwkernel::tasks::JobKind;

pub type Journal = Arc<Mutex<Vec<String>>>;

const DEPS: [Dependency; 2] = [
    Dependency::service("bus_service"),
    Dependency::module("peer_handle"),
];

pub struct Scripted {
    name: String,
    journal: Journal,
    fail_on: Option<String>,
    subscribe: Vec<String>,
    service: Option<String>,
    i2c_port: Option<u8>,
    leak_lock: bool,
    needs_deps: bool,
    spi_lease: Option<u8>,
    lease: Option<ResourceLease>,
    tick_ms: Option<u64>,
}

impl Scripted {
    pub fn from_config(config: &ConfigFragment, journal: &Journal) -> Result<Self> {
        if config.get_bool("fail_construct", false) {
            return Err(ConfigError::Invalid("module told to reject its config".into()).into());
        }
        let subscribe = config
            .get("subscribe")
            .and_then(Value::as_array)
            .map(|ids| {
                ids.iter()
                    .filter_map(|v| v.as_str().map(str::to_owned))
                    .collect()
            })
            .unwrap_or_default();
        Ok(Self {
            name: config.get_string("instance_name", "scripted"),
            journal: journal.clone(),
            fail_on: config.string("fail_on").ok().map(str::to_owned),
            subscribe,
            service: config.string("service").ok().map(str::to_owned),
            i2c_port: config.int("i2c_port").ok().map(|p| p as u8),
            leak_lock: config.get_bool("leak_lock", false),
            needs_deps: config.get_bool("needs_deps", false),
            spi_lease: config.int("spi_lease").ok().map(|p| p as u8),
            lease: None,
            tick_ms: config.int("tick_ms").ok().map(|ms| ms as u64),
        })
    }

    fn record(&self, op: &str) -> Result<()> {
        self.journal.lock().push(format!("{}:{}", self.name, op));
        if self.fail_on.as_deref() == Some(op) {
            Err(Error::InvalidArgument("module told to fail"))
        } else {
            Ok(())
        }
    }
}

impl Module for Scripted {
    fn init(&mut self, ctx: &ModuleContext<'_>) -> Result<()> {
        self.record("init")?;
        for id in &self.subscribe {
            ctx.subscribe(id)?;
        }
        if let Some(service) = &self.service {
            ctx.register_service(service, ServiceType::Custom("scripted"), 7u32)?;
        }
        if let Some(port) = self.i2c_port {
            ctx.lock_resource(ResourceType::I2cPort, port)?;
        }
        if let Some(host) = self.spi_lease {
            self.lease = Some(ctx.lease_resource(ResourceType::SpiHost, host)?);
            let again = match ctx.lease_resource(ResourceType::SpiHost, host) {
                Ok(_) => "granted",
                Err(_) => "refused",
            };
            self.journal
                .lock()
                .push(format!("{}:lease_again={}", self.name, again));
        }
        if self.needs_deps {
            if let Ok(v) = ctx.dependency_service::<u32>("bus_service") {
                self.journal.lock().push(format!("{}:dep_service={}", self.name, v));
            }
            if let Some(peer) = ctx.dependency_module("peer_handle") {
                self.journal
                    .lock()
                    .push(format!("{}:dep_module={}", self.name, peer.name()));
            }
        }
        Ok(())
    }

    fn start(&mut self, ctx: &ModuleContext<'_>) -> Result<()> {
        self.record("start")?;
        if let Some(ms) = self.tick_ms {
            let journal = self.journal.clone();
            let line = format!("{}:tick", self.name);
            ctx.schedule_job(JobKind::Every(Duration::from_millis(ms)), move || {
                journal.lock().push(line.clone());
            })?;
        }
        Ok(())
    }

    fn stop(&mut self, _ctx: &ModuleContext<'_>) -> Result<()> {
        self.record("stop")
    }

    fn enable(&mut self, _ctx: &ModuleContext<'_>) -> Result<()> {
        self.record("enable")
    }

    fn disable(&mut self, _ctx: &ModuleContext<'_>) -> Result<()> {
        self.record("disable")
    }

    fn reconfigure(&mut self, _ctx: &ModuleContext<'_>, config: &ConfigFragment) -> Result<()> {
        self.record("reconfigure")?;
        self.fail_on = config.string("fail_on").ok().map(str::to_owned);
        Ok(())
    }

    fn handle_event(
        &mut self,
        _ctx: &ModuleContext<'_>,
        event: &str,
        payload: Option<&Payload>,
    ) -> Result<()> {
        let detail = match payload {
            Some(p) => match (p.as_str(), p.downcast_ref::<StartupReport>()) {
                (Some(text), _) => format!("({text})"),
                (None, Some(report)) => format!("(started={})", report.started.len()),
                (None, None) => "(..)".to_owned(),
            },
            None => String::new(),
        };
        self.journal
            .lock()
            .push(format!("{}:event:{}{}", self.name, event, detail));
        Ok(())
    }

    fn deinit(&mut self, ctx: &ModuleContext<'_>) -> Result<()> {
        if let (Some(port), false) = (self.i2c_port, self.leak_lock) {
            ctx.release_resource(ResourceType::I2cPort, port)?;
        }
        self.lease = None;
        self.record("deinit")
    }

    fn dependencies(&self) -> &[Dependency] {
        if self.needs_deps { &DEPS } else { &[] }
    }
}

/// Factory with `scripted` (application level) and `driver` (driver level).
pub fn scripted_factory(journal: &Journal) -> ModuleFactory {
    let app = journal.clone();
    let drv = journal.clone();
    ModuleFactory::new()
        .with("scripted", InitLevel::APPLICATION, move |cfg| {
            Ok(Box::new(Scripted::from_config(cfg, &app)?))
        })
        .with("driver", InitLevel::DRIVER, move |cfg| {
            Ok(Box::new(Scripted::from_config(cfg, &drv)?))
        })
}

/// Journal lines for `op` in order, as module names.
pub fn calls(journal: &Journal, op: &str) -> Vec<String> {
    let suffix = format!(":{op}");
    journal
        .lock()
        .iter()
        .filter_map(|line| line.strip_suffix(&suffix).map(str::to_owned))
        .collect()
}

/// Journal lines mentioning `needle`.
pub fn lines_with(journal: &Journal, needle: &str) -> Vec<String> {
    journal
        .lock()
        .iter()
        .filter(|line| line.contains(needle))
        .cloned()
        .collect()
}
