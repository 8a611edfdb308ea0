//! Log-based event tracer.
//!
//! A module that subscribes to every event (`"*"`) and writes one line per
//! delivery to the logger, which goes to UART / USB-CDC in production.
//! Framework events with known payloads get a structured line.
//!
//! ```json
//! { "type": "event_logger", "config": { "skip": ["TICK"] } }
//! ```

use log::info;

use crate::bus::payload::Payload;
use crate::config::{ConfigFragment, ConfigRead};
use crate::error::Result;
use crate::events;
use crate::module::{InitLevel, Module, ModuleContext};
use crate::services::StatusChange;
use crate::system::StartupReport;

/// Factory kind name.
pub const KIND: &str = "event_logger";

/// Runs among the base services so it sees every later module's events.
pub const DEFAULT_LEVEL: InitLevel = InitLevel::BASE_SERVICE;

pub struct EventLogger {
    skip: Vec<String>,
    logged: u32,
}

impl EventLogger {
    pub fn new(config: &ConfigFragment) -> Self {
        Self {
            skip: skip_list(config),
            logged: 0,
        }
    }

    /// Factory constructor.
    pub fn construct(config: &ConfigFragment) -> Result<Box<dyn Module>> {
        Ok(Box::new(Self::new(config)))
    }

    pub fn logged(&self) -> u32 {
        self.logged
    }
}

fn skip_list(config: &ConfigFragment) -> Vec<String> {
    config
        .get("skip")
        .and_then(|v| v.as_array())
        .map(|items| {
            items
                .iter()
                .filter_map(|v| v.as_str().map(str::to_owned))
                .collect()
        })
        .unwrap_or_default()
}

impl Module for EventLogger {
    fn init(&mut self, ctx: &ModuleContext<'_>) -> Result<()> {
        ctx.subscribe(events::WILDCARD)
    }

    fn reconfigure(&mut self, _ctx: &ModuleContext<'_>, config: &ConfigFragment) -> Result<()> {
        self.skip = skip_list(config);
        Ok(())
    }

    fn handle_event(
        &mut self,
        _ctx: &ModuleContext<'_>,
        event: &str,
        payload: Option<&Payload>,
    ) -> Result<()> {
        if self.skip.iter().any(|s| s == event) {
            return Ok(());
        }
        self.logged = self.logged.wrapping_add(1);
        match (event, payload) {
            (events::SYSTEM_START_COMPLETE, Some(p)) => {
                if let Some(r) = p.downcast_ref::<StartupReport>() {
                    info!(
                        "EVENT | {} | running={} failed={}",
                        event,
                        r.started.len(),
                        r.failed.len()
                    );
                    return Ok(());
                }
            }
            (events::SERVICE_STATUS_CHANGED, Some(p)) => {
                if let Some(c) = p.downcast_ref::<StatusChange>() {
                    info!("EVENT | {} | {} -> {:?}", event, c.service, c.status);
                    return Ok(());
                }
            }
            _ => {}
        }
        match payload.and_then(Payload::as_str) {
            Some(text) => info!("EVENT | {} | {}", event, text),
            None => info!("EVENT | {}", event),
        }
        Ok(())
    }

    fn deinit(&mut self, ctx: &ModuleContext<'_>) -> Result<()> {
        ctx.unsubscribe(events::WILDCARD);
        info!("EventLogger: {} event(s) logged", self.logged);
        Ok(())
    }
}
