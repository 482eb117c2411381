//! Event Bus
//!
//! Typed in-process pub/sub with a synchronous fan-out path and a bounded
//! async dispatch path. Handlers for a kind run in registration order on the
//! publisher's thread (sync) or on a pool worker (async).
//!
//! The handler list is copied out from under the lock before invocation so
//! handlers may themselves publish without deadlocking the bus.

use super::event::{Event, EventKind};
use super::worker_pool::WorkerPool;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

pub type SubscriptionId = u64;

type Handler = Arc<dyn Fn(&Event) + Send + Sync>;

pub struct EventBus {
    subscribers: Mutex<HashMap<EventKind, Vec<(SubscriptionId, Handler)>>>,
    next_id: AtomicU64,
    pool: Mutex<Option<WorkerPool>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            subscribers: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            pool: Mutex::new(None),
        }
    }

    /// Register a handler for one event kind.
    ///
    /// The handler may be called from any thread and must not block waiting
    /// on the bus itself.
    pub fn subscribe<F>(&self, kind: EventKind, handler: F) -> SubscriptionId
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.subscribe_shared(kind, Arc::new(handler))
    }

    /// Register an already-shared handler; lets one handler serve many kinds.
    pub fn subscribe_shared(&self, kind: EventKind, handler: Handler) -> SubscriptionId {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.subscribers
            .lock()
            .entry(kind)
            .or_default()
            .push((id, handler));
        id
    }

    /// Idempotent removal; unknown ids are ignored.
    pub fn unsubscribe(&self, id: SubscriptionId) {
        let mut subscribers = self.subscribers.lock();
        for handlers in subscribers.values_mut() {
            handlers.retain(|(sub_id, _)| *sub_id != id);
        }
    }

    /// Invoke every handler for the event's kind on the calling thread.
    pub fn publish(&self, event: &Event) {
        let handlers = self.snapshot_handlers(event.kind);
        dispatch(&handlers, event);
    }

    /// Hand the event to the async dispatch pool. Falls back to synchronous
    /// publish when the pool has not been initialised, so no event is lost.
    pub fn publish_async(&self, event: Event) {
        {
            let pool = self.pool.lock();
            if let Some(pool) = pool.as_ref() {
                let handlers = self.snapshot_handlers(event.kind);
                pool.submit(move || dispatch(&handlers, &event));
                return;
            }
        }
        self.publish(&event);
    }

    /// Spin up the async dispatch pool. Repeated calls are ignored.
    pub fn init_async_pool(&self, num_threads: usize) {
        let mut pool = self.pool.lock();
        if pool.is_none() {
            *pool = Some(WorkerPool::new(num_threads));
            log::info!("Event bus async pool started ({} workers)", num_threads);
        }
    }

    /// Drain pending async dispatches and join the workers.
    pub fn shutdown_async_pool(&self) {
        let taken = self.pool.lock().take();
        if let Some(mut pool) = taken {
            pool.shutdown();
            log::info!("Event bus async pool stopped");
        }
    }

    pub fn subscriber_count(&self, kind: EventKind) -> usize {
        self.subscribers
            .lock()
            .get(&kind)
            .map_or(0, |handlers| handlers.len())
    }

    /// Drop every subscription. Intended for tests and full restarts.
    pub fn clear(&self) {
        self.subscribers.lock().clear();
    }

    fn snapshot_handlers(&self, kind: EventKind) -> Vec<Handler> {
        self.subscribers
            .lock()
            .get(&kind)
            .map(|handlers| handlers.iter().map(|(_, h)| Arc::clone(h)).collect())
            .unwrap_or_default()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Run each handler, containing panics so one bad subscriber cannot take
/// down the publisher thread or starve later handlers.
fn dispatch(handlers: &[Handler], event: &Event) {
    for handler in handlers {
        let result = catch_unwind(AssertUnwindSafe(|| handler(event)));
        if result.is_err() {
            log::error!(
                "Event handler panicked while processing {} (pid {})",
                event.kind.as_str(),
                event.pid
            );
        }
    }
}
