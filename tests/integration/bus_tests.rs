//! Event bus delivery: fan-out, payload release, wildcard, and
//! unsubscribe racing an in-flight handler on the dispatcher thread.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use fwkernel::bus::payload::{EventPayload, Payload};
use fwkernel::bus::{EVENT_QUEUE_DEPTH, EventBus};
use fwkernel::config::ConfigFragment;
use fwkernel::error::{Error, Result};
use fwkernel::events::WILDCARD;
use fwkernel::module::{CoreContext, InitLevel, Module, ModuleContext, ModuleHandle, ModuleSlot};

/// Counts handler calls into a shared counter.
struct Counter {
    hits: Arc<AtomicUsize>,
    unsubscribe_on_first: bool,
}

impl Module for Counter {
    fn init(&mut self, _ctx: &ModuleContext<'_>) -> Result<()> {
        Ok(())
    }

    fn handle_event(
        &mut self,
        ctx: &ModuleContext<'_>,
        event: &str,
        _payload: Option<&Payload>,
    ) -> Result<()> {
        self.hits.fetch_add(1, Ordering::SeqCst);
        if self.unsubscribe_on_first {
            ctx.unsubscribe(event);
        }
        Ok(())
    }
}

/// Records how many deliveries had happened when the last reference
/// was released.
struct Tracked {
    hits: Arc<AtomicUsize>,
    released_at: Arc<Mutex<Vec<usize>>>,
}

impl EventPayload for Tracked {
    fn deinit(&mut self) {
        self.released_at.lock().push(self.hits.load(Ordering::SeqCst));
    }
}

fn counter(core: &CoreContext, name: &str, hits: &Arc<AtomicUsize>) -> ModuleHandle {
    ModuleSlot::new(
        name,
        "counter",
        InitLevel::APPLICATION,
        Box::new(Counter {
            hits: hits.clone(),
            unsubscribe_on_first: false,
        }),
        ConfigFragment::empty(),
        core.clone(),
    )
    .unwrap()
}

#[test]
fn fan_out_releases_payload_once_after_last_handler() {
    let core = CoreContext::new();
    let hits = Arc::new(AtomicUsize::new(0));
    let released_at = Arc::new(Mutex::new(Vec::new()));
    let modules: Vec<_> = (0..5)
        .map(|i| counter(&core, &format!("sub{i}"), &hits))
        .collect();
    for m in &modules {
        core.bus.subscribe("READING", m).unwrap();
    }

    core.bus
        .post(
            "READING",
            Some(Payload::new(Tracked {
                hits: hits.clone(),
                released_at: released_at.clone(),
            })),
        )
        .unwrap();
    assert!(released_at.lock().is_empty(), "queued payload is still referenced");
    assert_eq!(core.bus.dispatch_pending(), 1);

    assert_eq!(hits.load(Ordering::SeqCst), 5);
    assert_eq!(*released_at.lock(), [5]);
    assert_eq!(core.bus.stats().delivered, 5);
}

#[test]
fn event_without_subscribers_still_releases_payload() {
    let bus = EventBus::new();
    let hits = Arc::new(AtomicUsize::new(0));
    let released_at = Arc::new(Mutex::new(Vec::new()));
    bus.post(
        "NOBODY",
        Some(Payload::new(Tracked {
            hits,
            released_at: released_at.clone(),
        })),
    )
    .unwrap();
    bus.dispatch_pending();
    assert_eq!(*released_at.lock(), [0]);
}

#[test]
fn full_queue_drops_and_releases() {
    let bus = EventBus::new();
    for _ in 0..EVENT_QUEUE_DEPTH {
        bus.post("FILL", None).unwrap();
    }
    let released_at = Arc::new(Mutex::new(Vec::new()));
    let overflow = bus.post(
        "OVERFLOW",
        Some(Payload::new(Tracked {
            hits: Arc::new(AtomicUsize::new(0)),
            released_at: released_at.clone(),
        })),
    );
    assert!(matches!(overflow, Err(Error::QueueFull(id)) if id == "OVERFLOW"));
    assert_eq!(released_at.lock().len(), 1);
    assert_eq!(bus.backlog(), EVENT_QUEUE_DEPTH);
    let stats = bus.stats();
    assert_eq!((stats.posted, stats.dropped), (EVENT_QUEUE_DEPTH as u32, 1));
}

#[test]
fn wildcard_and_direct_subscription_deliver_once() {
    let core = CoreContext::new();
    let hits = Arc::new(AtomicUsize::new(0));
    let m = counter(&core, "both", &hits);
    core.bus.subscribe("PING", &m).unwrap();
    core.bus.subscribe(WILDCARD, &m).unwrap();
    core.bus.post("PING", None).unwrap();
    core.bus.post("OTHER", None).unwrap();
    core.bus.dispatch_pending();
    assert_eq!(hits.load(Ordering::SeqCst), 2);
}

#[test]
fn handler_may_unsubscribe_itself() {
    let core = CoreContext::new();
    let hits = Arc::new(AtomicUsize::new(0));
    let m = ModuleSlot::new(
        "once",
        "counter",
        InitLevel::APPLICATION,
        Box::new(Counter {
            hits: hits.clone(),
            unsubscribe_on_first: true,
        }),
        ConfigFragment::empty(),
        core.clone(),
    )
    .unwrap();
    core.bus.subscribe("TICK", &m).unwrap();
    core.bus.post("TICK", None).unwrap();
    core.bus.post("TICK", None).unwrap();
    assert_eq!(core.bus.dispatch_pending(), 2);
    assert_eq!(hits.load(Ordering::SeqCst), 1);
    assert!(!core.bus.is_subscribed("TICK", "once"));
}

#[test]
fn dropped_module_is_skipped() {
    let core = CoreContext::new();
    let hits = Arc::new(AtomicUsize::new(0));
    let m = counter(&core, "gone", &hits);
    core.bus.subscribe("PING", &m).unwrap();
    drop(m);
    core.bus.post("PING", None).unwrap();
    core.bus.dispatch_pending();
    assert_eq!(hits.load(Ordering::SeqCst), 0);
}

// ── Unsubscribe vs. in-flight dispatch ────────────────────────

/// Blocks inside its first handler call until the test releases it.
struct Gate {
    entered: Arc<Barrier>,
    release: Arc<Barrier>,
    calls: Arc<AtomicUsize>,
    done: Arc<AtomicBool>,
}

impl Module for Gate {
    fn init(&mut self, _ctx: &ModuleContext<'_>) -> Result<()> {
        Ok(())
    }

    fn handle_event(
        &mut self,
        _ctx: &ModuleContext<'_>,
        _event: &str,
        _payload: Option<&Payload>,
    ) -> Result<()> {
        if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
            self.entered.wait();
            self.release.wait();
            self.done.store(true, Ordering::SeqCst);
        }
        Ok(())
    }
}

#[test]
fn unsubscribe_waits_for_in_flight_handler() {
    let core = CoreContext::new();
    let entered = Arc::new(Barrier::new(2));
    let release = Arc::new(Barrier::new(2));
    let calls = Arc::new(AtomicUsize::new(0));
    let done = Arc::new(AtomicBool::new(false));
    let gate = ModuleSlot::new(
        "gate",
        "gate",
        InitLevel::APPLICATION,
        Box::new(Gate {
            entered: entered.clone(),
            release: release.clone(),
            calls: calls.clone(),
            done: done.clone(),
        }),
        ConfigFragment::empty(),
        core.clone(),
    )
    .unwrap();
    core.bus.subscribe("SLOW", &gate).unwrap();
    core.bus.spawn_dispatcher(16 * 1024).unwrap();

    core.bus.post("SLOW", None).unwrap();
    core.bus.post("SLOW", None).unwrap();
    entered.wait();

    let bus = core.bus.clone();
    let handle = gate.clone();
    let flag = done.clone();
    let unsubscriber = std::thread::spawn(move || {
        bus.unsubscribe("SLOW", &handle);
        flag.load(Ordering::SeqCst)
    });

    let deadline = Instant::now() + Duration::from_secs(5);
    while core.bus.is_subscribed("SLOW", "gate") && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(1));
    }
    assert!(!core.bus.is_subscribed("SLOW", "gate"));
    assert!(!unsubscriber.is_finished(), "unsubscribe returned mid-handler");
    release.wait();

    assert!(unsubscriber.join().unwrap(), "handler finished before unsubscribe returned");
    core.bus.stop_dispatcher();
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}
