//! Inbound handler registry keyed by [`MessageKind`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock, Weak};

use crate::protocol::{ChannelMessage, MessageKind};

/// Boxed inbound message handler.
pub type Handler = Box<dyn Fn(&ChannelMessage) + Send + Sync>;

struct Slot {
    id: u64,
    active: AtomicBool,
    handler: Handler,
}

/// Handlers per message kind, each list in registration order.
#[derive(Default)]
pub struct HandlerRegistry {
    next_id: AtomicU64,
    slots: RwLock<HashMap<MessageKind, Vec<Arc<Slot>>>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `kind`.
    pub fn register(self: &Arc<Self>, kind: MessageKind, handler: Handler) -> Subscription {
        let slot = Arc::new(Slot {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            active: AtomicBool::new(true),
            handler,
        });
        self.slots
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .entry(kind)
            .or_default()
            .push(slot.clone());

        Subscription {
            registry: Arc::downgrade(self),
            kind,
            slot: Some(slot),
        }
    }

    fn remove(&self, kind: MessageKind, id: u64) {
        let mut slots = self.slots.write().unwrap_or_else(|e| e.into_inner());
        if let Some(list) = slots.get_mut(&kind) {
            list.retain(|s| s.id != id);
            if list.is_empty() {
                slots.remove(&kind);
            }
        }
    }

    /// Invoke every live handler for the message's kind, in registration order.
    ///
    /// Returns the number of handlers invoked.
    pub fn dispatch(&self, message: &ChannelMessage) -> usize {
        // Snapshot so handlers may (un)subscribe without deadlocking.
        let snapshot: Vec<Arc<Slot>> = {
            let slots = self.slots.read().unwrap_or_else(|e| e.into_inner());
            match slots.get(&message.kind) {
                Some(list) => list.clone(),
                None => return 0,
            }
        };

        let mut invoked = 0;
        for slot in snapshot {
            if slot.active.load(Ordering::Acquire) {
                (slot.handler)(message);
                invoked += 1;
            }
        }
        invoked
    }

    /// Number of live handlers for `kind`.
    pub fn handler_count(&self, kind: MessageKind) -> usize {
        self.slots
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&kind)
            .map_or(0, Vec::len)
    }
}

/// Handle returned by `subscribe`.
///
/// Unsubscribes when [`unsubscribe`](Subscription::unsubscribe) is called
/// or when dropped. After either, the handler is never invoked again.
///
/// The guarantee covers dispatches that start after `unsubscribe` returns.
/// Dispatch runs on the connection's reader task; when `unsubscribe` is
/// called from another thread, an invocation already in progress there
/// may still be running when it returns. Callers on the reader task
/// itself, including handlers, see no further invocations.
#[must_use = "dropping a Subscription unsubscribes its handler"]
pub struct Subscription {
    registry: Weak<HandlerRegistry>,
    kind: MessageKind,
    slot: Option<Arc<Slot>>,
}

impl Subscription {
    pub fn kind(&self) -> MessageKind {
        self.kind
    }

    pub fn unsubscribe(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if let Some(slot) = self.slot.take() {
            slot.active.store(false, Ordering::Release);
            if let Some(registry) = self.registry.upgrade() {
                registry.remove(self.kind, slot.id);
            }
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.release();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("kind", &self.kind)
            .field("active", &self.slot.is_some())
            .finish()
    }
}
