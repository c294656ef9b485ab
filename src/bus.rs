//! Event distribution facade.
//!
//! [`EventBus`] maps event names to sets of handlers. It outlives any particular transport
//! session: consumers may subscribe before a connection exists, and every handler is replayed
//! into each new session when it reaches `Connected`, so reconnects are invisible to them.
//!
//! # Example
//!
//! ```rust
//! use trading_realtime::bus::EventBus;
//! use serde_json::json;
//!
//! let bus = EventBus::new();
//! let subscription = bus.on("connection-status", |status| println!("status: {status}"));
//!
//! assert_eq!(bus.publish("connection-status", &json!("connected")), 1);
//!
//! drop(subscription);
//! assert_eq!(bus.publish("connection-status", &json!("disconnected")), 0);
//! ```

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::mem;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use async_stream::stream;
use futures::Stream;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::alert::{Alert, Alerter};
use crate::types::{ConnectionStatus, EventName};

/// Callback invoked with the payload of every matching event.
///
/// Handlers are compared by reference: registering the same `Arc` twice for one event name
/// yields a single registry entry.
pub type Handler = Arc<dyn Fn(&Value) + Send + Sync + 'static>;

/// Wrap a closure into a [`Handler`] that can later be passed to [`EventBus::off`].
pub fn handler<F>(f: F) -> Handler
where
    F: Fn(&Value) + Send + Sync + 'static,
{
    Arc::new(f)
}

fn same_handler(a: &Handler, b: &Handler) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}

/// Registry and session binding are only ever mutated in short critical sections that cannot
/// leave them half-updated, so a poisoned lock is still consistent.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

struct Entry {
    id: u64,
    handler: Handler,
    /// Live [`Subscription`] guards pointing at this entry
    guards: usize,
}

#[derive(Default)]
struct Registry {
    handlers: HashMap<EventName, Vec<Entry>>,
    binding: Option<Arc<SessionBinding>>,
    next_id: u64,
}

#[derive(Default)]
struct BusInner {
    registry: Mutex<Registry>,
    alerter: Option<Arc<dyn Alerter>>,
}

impl BusInner {
    fn release(&self, event: &EventName, id: u64) {
        let removed = {
            let mut registry = lock(&self.registry);
            let Registry {
                handlers, binding, ..
            } = &mut *registry;

            let Some(entries) = handlers.get_mut(event) else {
                return;
            };
            let Some(position) = entries.iter().position(|entry| entry.id == id) else {
                return;
            };
            let entry = &mut entries[position];
            entry.guards = entry.guards.saturating_sub(1);
            if entry.guards > 0 {
                return;
            }

            let removed = entries.swap_remove(position);
            if entries.is_empty() {
                handlers.remove(event);
            }
            if let Some(binding) = binding {
                binding.detach(event, &removed.handler);
            }
            removed
        };

        // Handler captures are dropped outside the lock: they may own subscriptions themselves.
        drop(removed);
    }
}

/// Handlers attached to one transport session.
///
/// Built by replaying the registry when a session reaches `Connected`, then kept in sync by
/// [`EventBus::subscribe`] and [`EventBus::off`] for as long as that session lives.
pub(crate) struct SessionBinding {
    session: u64,
    handlers: Mutex<HashMap<EventName, Vec<Handler>>>,
}

impl SessionBinding {
    fn attach(&self, event: &EventName, handler: Handler) {
        lock(&self.handlers)
            .entry(event.clone())
            .or_default()
            .push(handler);
    }

    fn detach(&self, event: &EventName, handler: &Handler) {
        let mut handlers = lock(&self.handlers);
        if let Some(list) = handlers.get_mut(event) {
            list.retain(|candidate| !same_handler(candidate, handler));
            if list.is_empty() {
                handlers.remove(event);
            }
        }
    }

    fn handlers_for(&self, event: &EventName) -> Vec<Handler> {
        lock(&self.handlers).get(event).cloned().unwrap_or_default()
    }

    pub(crate) const fn session(&self) -> u64 {
        self.session
    }

    pub(crate) fn len(&self) -> usize {
        lock(&self.handlers).values().map(Vec::len).sum()
    }
}

/// Connection-agnostic subscribe/unsubscribe facade.
///
/// Cloning is cheap and every clone shares the same registry.
#[derive(Clone, Default)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl EventBus {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A bus that also forwards alertable payloads to `alerter`.
    #[must_use]
    pub fn with_alerter<A: Alerter>(alerter: A) -> Self {
        Self {
            inner: Arc::new(BusInner {
                registry: Mutex::default(),
                alerter: Some(Arc::new(alerter)),
            }),
        }
    }

    /// Register a closure for `event`.
    ///
    /// The returned guard unregisters the closure when dropped.
    pub fn on<E, F>(&self, event: E, f: F) -> Subscription
    where
        E: Into<EventName>,
        F: Fn(&Value) + Send + Sync + 'static,
    {
        self.subscribe(event, Arc::new(f))
    }

    /// Register `handler` for `event`, attaching it to the live session if there is one.
    ///
    /// Registering a handler that is already present for `event` does not add a second entry;
    /// the entry stays until every guard for it is dropped or [`EventBus::off`] removes it.
    pub fn subscribe<E: Into<EventName>>(&self, event: E, handler: Handler) -> Subscription {
        let event = event.into();

        let id = {
            let mut registry = lock(&self.inner.registry);
            registry.next_id = registry.next_id.wrapping_add(1);
            let candidate = registry.next_id;
            let Registry {
                handlers, binding, ..
            } = &mut *registry;

            let entries = handlers.entry(event.clone()).or_default();
            if let Some(entry) = entries
                .iter_mut()
                .find(|entry| same_handler(&entry.handler, &handler))
            {
                entry.guards = entry.guards.saturating_add(1);
                #[cfg(feature = "tracing")]
                tracing::debug!(%event, "Handler already registered, deduplicating");
                entry.id
            } else {
                entries.push(Entry {
                    id: candidate,
                    handler: Arc::clone(&handler),
                    guards: 1,
                });
                if let Some(binding) = binding {
                    binding.attach(&event, handler);
                }
                candidate
            }
        };

        Subscription {
            bus: Arc::downgrade(&self.inner),
            event,
            id: Some(id),
        }
    }

    /// Remove `handler` from `event` and detach it from the live session.
    ///
    /// Returns whether the handler was registered. Outstanding guards for it become inert.
    pub fn off<E: Into<EventName>>(&self, event: E, handler: &Handler) -> bool {
        let event = event.into();

        let removed: Vec<Entry> = {
            let mut registry = lock(&self.inner.registry);
            let Registry {
                handlers, binding, ..
            } = &mut *registry;

            let Some(entries) = handlers.get_mut(&event) else {
                return false;
            };
            let (removed, kept): (Vec<Entry>, Vec<Entry>) = mem::take(entries)
                .into_iter()
                .partition(|entry| same_handler(&entry.handler, handler));
            *entries = kept;
            if entries.is_empty() {
                handlers.remove(&event);
            }
            if !removed.is_empty()
                && let Some(binding) = binding
            {
                binding.detach(&event, handler);
            }
            removed
        };

        !removed.is_empty()
    }

    /// Dispatch a locally produced event to every handler registered for `event`.
    ///
    /// Works whether or not a session is live. Returns how many handlers completed.
    pub fn publish<E: Into<EventName>>(&self, event: E, data: &Value) -> usize {
        let event = event.into();
        let handlers: Vec<Handler> = lock(&self.inner.registry)
            .handlers
            .get(&event)
            .map(|entries| entries.iter().map(|entry| Arc::clone(&entry.handler)).collect())
            .unwrap_or_default();

        invoke(&event, &handlers, data)
    }

    /// Stream every payload of `event`. Dropping the stream unsubscribes.
    pub fn stream<E: Into<EventName>>(&self, event: E) -> impl Stream<Item = Value> + use<E> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let subscription = self.on(event, move |data| {
            _ = tx.send(data.clone());
        });

        stream! {
            let _subscription = subscription;
            while let Some(data) = rx.recv().await {
                yield data;
            }
        }
    }

    /// Number of registered handlers across all event names.
    #[must_use]
    pub fn subscription_count(&self) -> usize {
        lock(&self.inner.registry)
            .handlers
            .values()
            .map(Vec::len)
            .sum()
    }

    /// Number of handlers registered for `event`.
    #[must_use]
    pub fn handler_count<E: Into<EventName>>(&self, event: E) -> usize {
        lock(&self.inner.registry)
            .handlers
            .get(&event.into())
            .map_or(0, Vec::len)
    }

    /// Number of handlers attached to the live session, if one is bound.
    #[must_use]
    pub fn attached_count(&self) -> Option<usize> {
        lock(&self.inner.registry)
            .binding
            .as_ref()
            .map(|binding| binding.len())
    }

    pub(crate) fn publish_status(&self, status: ConnectionStatus) {
        self.publish(EventName::ConnectionStatus, &Value::from(status));
    }

    /// Replay every registered handler into a fresh binding for `session` and make it the live
    /// one. Runs under the registry lock so no concurrent `on`/`off` can slip between the
    /// snapshot and the switch.
    pub(crate) fn bind_session(&self, session: u64) -> Arc<SessionBinding> {
        let mut registry = lock(&self.inner.registry);

        let replayed: HashMap<EventName, Vec<Handler>> = registry
            .handlers
            .iter()
            .map(|(event, entries)| {
                let handlers = entries
                    .iter()
                    .map(|entry| Arc::clone(&entry.handler))
                    .collect();
                (event.clone(), handlers)
            })
            .collect();

        let binding = Arc::new(SessionBinding {
            session,
            handlers: Mutex::new(replayed),
        });
        registry.binding = Some(Arc::clone(&binding));

        #[cfg(feature = "tracing")]
        tracing::debug!(
            session,
            handlers = binding.len(),
            "Replayed registered handlers into new session"
        );

        binding
    }

    pub(crate) fn unbind_session(&self, session: u64) {
        let mut registry = lock(&self.inner.registry);
        if registry
            .binding
            .as_ref()
            .is_some_and(|binding| binding.session() == session)
        {
            registry.binding = None;
        }
    }

    /// Deliver an inbound server event through the session binding, then feed the alerting
    /// side channel.
    pub(crate) fn deliver(&self, binding: &SessionBinding, event: &EventName, data: &Value) -> usize {
        let handlers = binding.handlers_for(event);
        let delivered = invoke(event, &handlers, data);

        if let Some(alerter) = &self.inner.alerter
            && let Some(alert) = Alert::from_event(event, data)
            && catch_unwind(AssertUnwindSafe(|| {
                alerter.alert(&alert.message, alert.severity);
            }))
            .is_err()
        {
            #[cfg(feature = "tracing")]
            tracing::error!(%event, "Alerter panicked");
        }

        delivered
    }

    /// Drop every registration and the live binding.
    pub(crate) fn clear(&self) {
        let (handlers, binding) = {
            let mut registry = lock(&self.inner.registry);
            (mem::take(&mut registry.handlers), registry.binding.take())
        };

        if let Some(binding) = binding {
            drop(mem::take(&mut *lock(&binding.handlers)));
        }
        drop(handlers);
    }
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("subscriptions", &self.subscription_count())
            .field("attached", &self.attached_count())
            .field("alerter", &self.inner.alerter.is_some())
            .finish()
    }
}

/// Invoke each handler, isolating panics so siblings still run.
fn invoke(event: &EventName, handlers: &[Handler], data: &Value) -> usize {
    let mut delivered = 0_usize;

    for handler in handlers {
        match catch_unwind(AssertUnwindSafe(|| handler(data))) {
            Ok(()) => delivered += 1,
            Err(panic) => {
                #[cfg(feature = "tracing")]
                tracing::error!(
                    %event,
                    panic = panic_message(panic.as_ref()),
                    "Event handler panicked"
                );
                #[cfg(not(feature = "tracing"))]
                let _ = (&event, &panic);
            }
        }
    }

    delivered
}

#[cfg_attr(
    not(feature = "tracing"),
    expect(dead_code, reason = "Only used when logging handler panics")
)]
fn panic_message(panic: &(dyn Any + Send)) -> &str {
    panic
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| panic.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("<non-string panic>")
}

/// Scoped registration returned by [`EventBus::on`] and [`EventBus::subscribe`].
///
/// Dropping the guard unregisters the handler.
#[must_use = "dropping a Subscription unregisters its handler"]
pub struct Subscription {
    bus: Weak<BusInner>,
    event: EventName,
    id: Option<u64>,
}

impl Subscription {
    #[must_use]
    pub fn event(&self) -> &EventName {
        &self.event
    }

    /// Unregister now. Equivalent to dropping the guard.
    pub fn unsubscribe(self) {
        drop(self);
    }

    /// Keep the handler registered without holding the guard. Only [`EventBus::off`] or a
    /// disconnect removes it afterwards.
    pub fn detach(mut self) {
        self.id = None;
    }

    /// Whether the handler is still registered.
    #[must_use]
    pub fn is_active(&self) -> bool {
        let (Some(id), Some(inner)) = (self.id, self.bus.upgrade()) else {
            return false;
        };

        lock(&inner.registry)
            .handlers
            .get(&self.event)
            .is_some_and(|entries| entries.iter().any(|entry| entry.id == id))
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(id) = self.id.take()
            && let Some(inner) = self.bus.upgrade()
        {
            inner.release(&self.event, id);
        }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("event", &self.event)
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}
