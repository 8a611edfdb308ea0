//! Event bus: named events, bounded queue, ordered fan-out.
//!
//! ```text
//!  publisher ──post()──▶ ┌─────────────────────────┐
//!  (any thread,          │ Channel<BusMessage, 32> │ ──▶ dispatch context
//!   never blocks)        └─────────────────────────┘     (dispatch_pending()
//!                                                         or dispatcher thread)
//!                                                              │
//!                           subscription table ◀── snapshot ───┤
//!                           event id ─▶ [module, module, ...]   │
//!                           "*"      ─▶ [module, ...]           ▼
//!                                                   handle_event() per subscriber,
//!                                                   in subscription order
//! ```
//!
//! Handlers for one event run sequentially in the dispatch context with the
//! subscriber's module mutex held.  The subscription table lock is never
//! held while a handler runs, so handlers may post, subscribe and
//! unsubscribe freely.
//!
//! Unsubscribe waits for an in-flight delivery to the same module on
//! another thread before returning; once it returns, that module sees no
//! further deliveries for the event.

pub mod payload;

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::channel::{Channel, TrySendError};
use log::{debug, error, info, warn};
use parking_lot::Mutex;

use crate::error::{Error, Result};
use crate::module::{ModuleHandle, ModuleName, ModuleSlot, module_name};
use payload::Payload;

/// Depth of the pending-event queue.
pub const EVENT_QUEUE_DEPTH: usize = 32;

/// Longest accepted event identifier.
pub const MAX_EVENT_ID_LEN: usize = 48;

/// Subscribers per event id.
pub const MAX_SUBSCRIBERS_PER_EVENT: usize = 16;

/// Subscribing to this id delivers every event.
pub const WILDCARD: &str = "*";

pub type EventId = heapless::String<MAX_EVENT_ID_LEN>;

fn event_id(id: &str) -> Result<EventId> {
    if id.is_empty() {
        return Err(Error::InvalidArgument("empty event id"));
    }
    let mut out = EventId::new();
    out.push_str(id)
        .map_err(|()| Error::InvalidArgument("event id longer than 48 bytes"))?;
    Ok(out)
}

enum BusMessage {
    Event {
        id: EventId,
        payload: Option<Payload>,
    },
    Stop,
}

struct Subscriber {
    module: ModuleName,
    slot: Weak<ModuleSlot>,
    live: AtomicBool,
}

struct Topic {
    id: EventId,
    subscribers: Vec<Arc<Subscriber>>,
}

/// Counter snapshot for diagnostics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BusStats {
    pub posted: u32,
    pub dropped: u32,
    pub delivered: u32,
}

struct BusInner {
    queue: Channel<CriticalSectionRawMutex, BusMessage, EVENT_QUEUE_DEPTH>,
    topics: Mutex<Vec<Topic>>,
    posted: AtomicU32,
    dropped: AtomicU32,
    delivered: AtomicU32,
    dispatcher_running: AtomicBool,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

/// Cheap-to-clone handle to the shared bus.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(BusInner {
                queue: Channel::new(),
                topics: Mutex::new(Vec::new()),
                posted: AtomicU32::new(0),
                dropped: AtomicU32::new(0),
                delivered: AtomicU32::new(0),
                dispatcher_running: AtomicBool::new(false),
                dispatcher: Mutex::new(None),
            }),
        }
    }

    // ── Subscriptions ─────────────────────────────────────────

    /// Subscribe `module` to `event` (or [`WILDCARD`]).  Idempotent.
    pub fn subscribe(&self, event: &str, module: &ModuleHandle) -> Result<()> {
        self.subscribe_weak(event, module.name(), Arc::downgrade(module))
    }

    pub(crate) fn subscribe_weak(
        &self,
        event: &str,
        module: &str,
        slot: Weak<ModuleSlot>,
    ) -> Result<()> {
        let id = event_id(event)?;
        let module = module_name(module)?;
        let mut topics = self.inner.topics.lock();
        let pos = match topics.iter().position(|t| t.id == id) {
            Some(pos) => pos,
            None => {
                topics.push(Topic {
                    id,
                    subscribers: Vec::new(),
                });
                topics.len() - 1
            }
        };
        let topic = &mut topics[pos];
        if topic.subscribers.iter().any(|s| s.module == module) {
            return Ok(());
        }
        if topic.subscribers.len() >= MAX_SUBSCRIBERS_PER_EVENT {
            warn!("EventBus: '{}' has no room for '{}'", event, module);
            return Err(Error::Allocation("subscribers per event"));
        }
        debug!("EventBus: '{}' subscribed to '{}'", module, event);
        topic.subscribers.push(Arc::new(Subscriber {
            module,
            slot,
            live: AtomicBool::new(true),
        }));
        Ok(())
    }

    /// Remove `module`'s subscription to `event`.  Idempotent.
    pub fn unsubscribe(&self, event: &str, module: &ModuleHandle) {
        self.unsubscribe_named(event, module.name());
    }

    pub(crate) fn unsubscribe_named(&self, event: &str, module: &str) {
        let removed = self.detach(module, |id| id == event);
        quiesce(&removed);
    }

    /// Remove every subscription held by `module`.  Returns how many.
    pub fn unsubscribe_all(&self, module: &str) -> usize {
        let removed = self.detach(module, |_| true);
        quiesce(&removed);
        removed.len()
    }

    fn detach(&self, module: &str, matches: impl Fn(&str) -> bool) -> Vec<Arc<Subscriber>> {
        let mut removed = Vec::new();
        let mut topics = self.inner.topics.lock();
        for topic in topics.iter_mut().filter(|t| matches(t.id.as_str())) {
            topic.subscribers.retain(|s| {
                if s.module.as_str() == module {
                    s.live.store(false, Ordering::Release);
                    removed.push(s.clone());
                    false
                } else {
                    true
                }
            });
        }
        topics.retain(|t| !t.subscribers.is_empty());
        removed
    }

    pub fn is_subscribed(&self, event: &str, module: &str) -> bool {
        self.inner.topics.lock().iter().any(|t| {
            t.id.as_str() == event && t.subscribers.iter().any(|s| s.module.as_str() == module)
        })
    }

    /// Direct subscribers of `event` (wildcard subscribers not counted).
    pub fn subscriber_count(&self, event: &str) -> usize {
        self.inner
            .topics
            .lock()
            .iter()
            .find(|t| t.id.as_str() == event)
            .map_or(0, |t| t.subscribers.len())
    }

    // ── Publishing ────────────────────────────────────────────

    /// Queue `event` for dispatch.  Never waits for handlers.
    ///
    /// On a full queue the event is dropped, the payload reference the
    /// queue would have held is released, and `QueueFull` is returned.
    pub fn post(&self, event: &str, payload: Option<Payload>) -> Result<()> {
        let id = event_id(event)?;
        match self.inner.queue.try_send(BusMessage::Event { id, payload }) {
            Ok(()) => {
                self.inner.posted.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(TrySendError::Full(msg)) => {
                drop(msg);
                self.inner.dropped.fetch_add(1, Ordering::Relaxed);
                warn!("EventBus: queue full, dropped '{}'", event);
                Err(Error::QueueFull(event.to_owned()))
            }
        }
    }

    /// Events waiting for dispatch.
    pub fn backlog(&self) -> usize {
        self.inner.queue.len()
    }

    pub fn stats(&self) -> BusStats {
        BusStats {
            posted: self.inner.posted.load(Ordering::Relaxed),
            dropped: self.inner.dropped.load(Ordering::Relaxed),
            delivered: self.inner.delivered.load(Ordering::Relaxed),
        }
    }

    // ── Dispatch contexts ─────────────────────────────────────

    /// Dispatch every queued event on the calling thread.  Returns the
    /// number of events processed (0 while a dispatcher thread owns the
    /// queue).
    pub fn dispatch_pending(&self) -> usize {
        if self.inner.dispatcher_running.load(Ordering::Acquire) {
            debug!("EventBus: dispatcher thread active, skipping inline dispatch");
            return 0;
        }
        let mut processed = 0;
        while let Ok(msg) = self.inner.queue.try_receive() {
            if let BusMessage::Event { id, payload } = msg {
                self.inner.dispatch(&id, payload);
                processed += 1;
            }
        }
        processed
    }

    /// Start a dedicated dispatch thread blocking on the queue.
    pub fn spawn_dispatcher(&self, stack_size: usize) -> Result<()> {
        let mut slot = self.inner.dispatcher.lock();
        if slot.is_some() {
            return Ok(());
        }
        let inner = self.inner.clone();
        self.inner.dispatcher_running.store(true, Ordering::Release);
        let spawned = std::thread::Builder::new()
            .name("event-bus".into())
            .stack_size(stack_size)
            .spawn(move || inner.run());
        match spawned {
            Ok(handle) => {
                *slot = Some(handle);
                info!("EventBus: dispatcher thread started");
                Ok(())
            }
            Err(e) => {
                self.inner.dispatcher_running.store(false, Ordering::Release);
                error!("EventBus: dispatcher spawn failed: {}", e);
                Err(Error::Allocation("dispatcher thread"))
            }
        }
    }

    pub fn is_dispatcher_running(&self) -> bool {
        self.inner.dispatcher_running.load(Ordering::Acquire)
    }

    /// Stop the dispatcher thread after it drains what is already queued.
    pub fn stop_dispatcher(&self) {
        let Some(handle) = self.inner.dispatcher.lock().take() else {
            return;
        };
        futures_lite::future::block_on(self.inner.queue.send(BusMessage::Stop));
        if handle.join().is_err() {
            error!("EventBus: dispatcher thread panicked");
        }
        self.inner.dispatcher_running.store(false, Ordering::Release);
        info!("EventBus: dispatcher thread stopped");
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl BusInner {
    fn run(&self) {
        loop {
            match futures_lite::future::block_on(self.queue.receive()) {
                BusMessage::Event { id, payload } => self.dispatch(&id, payload),
                BusMessage::Stop => break,
            }
        }
    }

    fn dispatch(&self, id: &str, payload: Option<Payload>) {
        let targets = self.targets(id);
        if targets.is_empty() {
            debug!("EventBus: '{}' has no subscribers", id);
            return;
        }
        for sub in &targets {
            if !sub.live.load(Ordering::Acquire) {
                continue;
            }
            let Some(slot) = sub.slot.upgrade() else {
                continue;
            };
            let held = payload.clone();
            if slot.deliver(id, held.as_ref(), || sub.live.load(Ordering::Acquire)) {
                self.delivered.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Direct subscribers of `id` in order, then wildcard subscribers not
    /// already listed.
    fn targets(&self, id: &str) -> Vec<Arc<Subscriber>> {
        let topics = self.topics.lock();
        let mut out: Vec<Arc<Subscriber>> = topics
            .iter()
            .find(|t| t.id.as_str() == id)
            .map(|t| t.subscribers.clone())
            .unwrap_or_default();
        if id != WILDCARD {
            if let Some(wild) = topics.iter().find(|t| t.id.as_str() == WILDCARD) {
                for s in &wild.subscribers {
                    if !out.iter().any(|o| o.module == s.module) {
                        out.push(s.clone());
                    }
                }
            }
        }
        out
    }
}

fn quiesce(removed: &[Arc<Subscriber>]) {
    if let Some(slot) = removed.first().and_then(|s| s.slot.upgrade()) {
        slot.quiesce();
    }
}
