//! Subscription registry
//!
//! Routes inbound [`ThingEvent`]s to every registered handler whose
//! [`Filter`] matches. Each registration owns a bounded queue drained by
//! its own delivery task, so a slow or panicking handler only affects
//! itself. When a handler falls so far behind that its queue is full,
//! further events for it are dropped and logged.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use twinlink_protocol::{AttributePath, EventCategory, ThingEvent};
use twinlink_utils::{Result, TwinError};

/// Events buffered per registration before new ones are dropped
pub const DELIVERY_QUEUE_CAPACITY: usize = 1024;

/// Event callback owned by a registration
///
/// Invoked on Tokio's blocking thread pool, one event at a time and in
/// dispatch order. A handler may block without stalling the runtime.
pub type Handler = Box<dyn FnMut(ThingEvent) + Send + 'static>;

/// Which events a registration receives
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Filter {
    category: EventCategory,
    thing_id: Option<String>,
    path: Option<AttributePath>,
}

impl Filter {
    /// All lifecycle events
    pub fn lifecycle() -> Self {
        Self {
            category: EventCategory::Lifecycle,
            thing_id: None,
            path: None,
        }
    }

    /// All attribute changes
    pub fn attribute_changes() -> Self {
        Self {
            category: EventCategory::AttributeChange,
            thing_id: None,
            path: None,
        }
    }

    /// Attribute changes at or below `path`
    pub fn attribute_path(path: impl Into<AttributePath>) -> Self {
        Self {
            category: EventCategory::AttributeChange,
            thing_id: None,
            path: Some(path.into()),
        }
    }

    /// Narrow the filter to one Thing
    pub fn for_thing(mut self, thing_id: impl Into<String>) -> Self {
        self.thing_id = Some(thing_id.into());
        self
    }

    pub fn category(&self) -> EventCategory {
        self.category
    }

    pub fn thing_id(&self) -> Option<&str> {
        self.thing_id.as_deref()
    }

    pub fn path(&self) -> Option<&AttributePath> {
        self.path.as_ref()
    }

    pub fn matches(&self, event: &ThingEvent) -> bool {
        if event.category() != self.category {
            return false;
        }
        if let Some(thing_id) = &self.thing_id {
            if event.thing_id() != thing_id {
                return false;
            }
        }
        match (&self.path, event.attribute_path()) {
            (None, _) => true,
            (Some(scope), Some(path)) => scope.covers(path),
            (Some(_), None) => false,
        }
    }
}

struct Registration {
    filter: Filter,
    queue: mpsc::Sender<ThingEvent>,
    active: Arc<AtomicBool>,
}

/// Concurrent map of registration id to handler
pub struct SubscriptionRegistry {
    entries: RwLock<HashMap<String, Registration>>,
    runtime: Handle,
    queue_capacity: usize,
}

impl SubscriptionRegistry {
    /// Create a registry whose delivery tasks run on `runtime`
    pub fn new(runtime: Handle) -> Self {
        Self::with_queue_capacity(runtime, DELIVERY_QUEUE_CAPACITY)
    }

    pub fn with_queue_capacity(runtime: Handle, queue_capacity: usize) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            runtime,
            queue_capacity: queue_capacity.max(1),
        }
    }

    pub fn register(&self, id: impl Into<String>, filter: Filter, handler: Handler) -> Result<()> {
        let id = id.into();
        let mut entries = self.entries.write();
        if entries.contains_key(&id) {
            return Err(TwinError::DuplicateRegistration(id));
        }

        let (tx, rx) = mpsc::channel(self.queue_capacity);
        let active = Arc::new(AtomicBool::new(true));
        self.runtime
            .spawn(deliver(id.clone(), rx, active.clone(), handler));

        tracing::debug!(registration = %id, category = ?filter.category(), thing_id = ?filter.thing_id(), "Registered handler");
        entries.insert(
            id,
            Registration {
                filter,
                queue: tx,
                active,
            },
        );
        Ok(())
    }

    /// Remove a registration; returns whether one existed
    ///
    /// Events still queued for the handler are discarded. An invocation
    /// already in progress runs to completion.
    pub fn deregister(&self, id: &str) -> bool {
        match self.entries.write().remove(id) {
            Some(registration) => {
                registration.active.store(false, Ordering::Release);
                tracing::debug!(registration = %id, "Deregistered handler");
                true
            }
            None => false,
        }
    }

    /// Queue `event` for every matching handler; returns the match count
    ///
    /// Never waits: a handler whose queue is full misses this event.
    pub fn dispatch(&self, event: &ThingEvent) -> usize {
        let targets: Vec<(String, mpsc::Sender<ThingEvent>)> = self
            .entries
            .read()
            .iter()
            .filter(|(_, registration)| registration.filter.matches(event))
            .map(|(id, registration)| (id.clone(), registration.queue.clone()))
            .collect();

        for (id, queue) in &targets {
            match queue.try_send(event.clone()) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    tracing::warn!(
                        registration = %id,
                        thing_id = event.thing_id(),
                        capacity = self.queue_capacity,
                        "Handler queue full, event dropped"
                    );
                }
                Err(TrySendError::Closed(_)) => {
                    tracing::debug!(registration = %id, "Delivery task gone, event dropped");
                }
            }
        }

        tracing::trace!(
            thing_id = event.thing_id(),
            category = ?event.category(),
            matched = targets.len(),
            "Dispatched event"
        );
        targets.len()
    }

    /// Remove every registration
    pub fn clear(&self) -> usize {
        let drained: Vec<_> = self.entries.write().drain().collect();
        for (_, registration) in &drained {
            registration.active.store(false, Ordering::Release);
        }
        drained.len()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entries.read().contains_key(id)
    }
}

impl std::fmt::Debug for SubscriptionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionRegistry")
            .field("registrations", &self.len())
            .field("queue_capacity", &self.queue_capacity)
            .finish()
    }
}

/// Drain one registration's queue in order
///
/// The handler moves onto a blocking thread for each event and comes back
/// when the call returns.
async fn deliver(
    id: String,
    mut queue: mpsc::Receiver<ThingEvent>,
    active: Arc<AtomicBool>,
    mut handler: Handler,
) {
    while let Some(event) = queue.recv().await {
        if !active.load(Ordering::Acquire) {
            break;
        }

        let invocation = tokio::task::spawn_blocking(move || {
            let outcome = catch_unwind(AssertUnwindSafe(|| handler(event)));
            (handler, outcome)
        });
        match invocation.await {
            Ok((returned, outcome)) => {
                handler = returned;
                if let Err(panic) = outcome {
                    tracing::error!(
                        registration = %id,
                        panic = %panic_message(panic.as_ref()),
                        "Event handler panicked"
                    );
                }
            }
            Err(e) => {
                // Runtime shutting down
                tracing::debug!(registration = %id, error = %e, "Handler invocation cancelled");
                break;
            }
        }
    }
    tracing::trace!(registration = %id, "Delivery task finished");
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> &str {
    if let Some(msg) = panic.downcast_ref::<&'static str>() {
        msg
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg
    } else {
        "unknown panic"
    }
}
