//! Reference-counted event payloads.
//!
//! A [`Payload`] is shared between the event queue and every subscriber
//! currently handling the event.  The wrapped value's
//! [`EventPayload::deinit`] runs exactly once, when the last holder lets
//! go.
//!
//! ```text
//!   post()          queue ref ─┐
//!   dispatch        +1 per handler call, -1 when it returns
//!   dispatch done   queue ref ─┘  ──▶ last drop ──▶ deinit()
//! ```

use core::any::Any;
use core::fmt;
use std::sync::Arc;

/// Data carried by an event.
pub trait EventPayload: Any + Send + Sync {
    /// Called once, after the last reference is released.
    fn deinit(&mut self) {}
}

impl EventPayload for String {}
impl EventPayload for &'static str {}
impl EventPayload for Vec<u8> {}
impl EventPayload for serde_json::Value {}
impl EventPayload for u32 {}
impl EventPayload for i32 {}
impl EventPayload for bool {}

trait Erased: Send + Sync {
    fn as_any(&self) -> &dyn Any;
    fn release(&mut self);
}

impl<T: EventPayload> Erased for T {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn release(&mut self) {
        EventPayload::deinit(self);
    }
}

struct Shared {
    value: Box<dyn Erased>,
}

impl Drop for Shared {
    fn drop(&mut self) {
        self.value.release();
    }
}

/// Shared handle to an event's data.  Cloning takes another reference.
#[derive(Clone)]
pub struct Payload(Arc<Shared>);

impl Payload {
    pub fn new<T: EventPayload>(value: T) -> Self {
        Self(Arc::new(Shared {
            value: Box::new(value),
        }))
    }

    pub fn downcast_ref<T: EventPayload>(&self) -> Option<&T> {
        self.0.value.as_any().downcast_ref::<T>()
    }

    /// Convenience for the common string payloads.
    pub fn as_str(&self) -> Option<&str> {
        self.downcast_ref::<String>()
            .map(String::as_str)
            .or_else(|| self.downcast_ref::<&'static str>().copied())
    }

    /// Number of live references (queue + handlers + caller clones).
    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.0)
    }
}

impl fmt::Debug for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Payload")
            .field("refs", &self.ref_count())
            .finish_non_exhaustive()
    }
}
