//! Scoped consumption helpers.
//!
//! A [`Hook`] ties a registration to the lifetime of its owner (a widget, a view model, a task):
//! it registers on mount, unregisters on drop, and re-registers when its dependency value
//! changes. The typed helpers are thin parameterizations of [`EventBus::on`] that interpret each
//! payload with [`Event::parse`] and hand callbacks the typed variant instead of raw JSON.

use serde_json::Value;

use crate::bus::{EventBus, Handler, Subscription};
use crate::types::{BalanceUpdate, ConnectionStatus, Event, EventName, Notification, TradeUpdate};

type Factory<D> = Box<dyn Fn(&D) -> Handler + Send + Sync + 'static>;

/// Registration bound to a dependency value.
///
/// # Example
///
/// ```rust
/// use trading_realtime::bus::{EventBus, handler};
/// use trading_realtime::hooks::Hook;
/// use serde_json::json;
///
/// let bus = EventBus::new();
/// let mut hook = Hook::mount(&bus, "trade-updated", "BTC-USD".to_owned(), |symbol| {
///     let symbol = symbol.clone();
///     handler(move |trade| {
///         if trade["symbol"] == symbol.as_str() {
///             println!("{trade}");
///         }
///     })
/// });
///
/// // Same value: nothing happens. New value: the handler is rebuilt and re-registered.
/// assert!(!hook.update("BTC-USD".to_owned()));
/// assert!(hook.update("ETH-USD".to_owned()));
///
/// drop(hook);
/// assert_eq!(bus.publish("trade-updated", &json!({ "symbol": "ETH-USD" })), 0);
/// ```
pub struct Hook<D> {
    bus: EventBus,
    event: EventName,
    deps: D,
    factory: Factory<D>,
    subscription: Option<Subscription>,
}

impl<D: PartialEq> Hook<D> {
    /// Build a handler from `deps` with `factory` and register it for `event`.
    pub fn mount<E, F>(bus: &EventBus, event: E, deps: D, factory: F) -> Self
    where
        E: Into<EventName>,
        F: Fn(&D) -> Handler + Send + Sync + 'static,
    {
        let event = event.into();
        let subscription = bus.subscribe(event.clone(), factory(&deps));

        Self {
            bus: bus.clone(),
            event,
            deps,
            factory: Box::new(factory),
            subscription: Some(subscription),
        }
    }

    /// Replace the dependency value. Re-registers and returns `true` only if it changed.
    pub fn update(&mut self, deps: D) -> bool {
        if self.deps == deps {
            return false;
        }

        // Unregister before building the replacement so the two never overlap.
        drop(self.subscription.take());
        self.deps = deps;
        self.subscription = Some(
            self.bus
                .subscribe(self.event.clone(), (self.factory)(&self.deps)),
        );
        true
    }

    #[must_use]
    pub fn deps(&self) -> &D {
        &self.deps
    }

    #[must_use]
    pub fn event(&self) -> &EventName {
        &self.event
    }

    /// Whether the current registration is still live; a disconnect clears it.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.subscription
            .as_ref()
            .is_some_and(Subscription::is_active)
    }
}

impl<D: std::fmt::Debug> std::fmt::Debug for Hook<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Hook")
            .field("event", &self.event)
            .field("deps", &self.deps)
            .field("subscription", &self.subscription)
            .finish_non_exhaustive()
    }
}

/// Register `f` for `event`, feeding it whatever `extract` pulls out of the parsed [`Event`].
/// Payloads that fall back to [`Event::Custom`] are skipped.
fn typed<T, F>(
    bus: &EventBus,
    event: EventName,
    extract: fn(Event) -> Option<T>,
    f: F,
) -> Subscription
where
    T: 'static,
    F: Fn(T) + Send + Sync + 'static,
{
    let name = event.clone();
    bus.on(event, move |data: &Value| match extract(Event::parse(&name, data)) {
        Some(payload) => f(payload),
        None => {
            #[cfg(feature = "tracing")]
            tracing::debug!(event = %name, %data, "Ignoring payload that does not match its event type");
        }
    })
}

/// Receive every `balance-updated` payload that parses as a [`BalanceUpdate`].
pub fn balance_updates<F>(bus: &EventBus, f: F) -> Subscription
where
    F: Fn(BalanceUpdate) + Send + Sync + 'static,
{
    typed(
        bus,
        EventName::BalanceUpdated,
        |event| match event {
            Event::BalanceUpdated(update) => Some(update),
            _ => None,
        },
        f,
    )
}

/// Receive every `trade-updated` payload that parses as a [`TradeUpdate`].
pub fn trade_updates<F>(bus: &EventBus, f: F) -> Subscription
where
    F: Fn(TradeUpdate) + Send + Sync + 'static,
{
    typed(
        bus,
        EventName::TradeUpdated,
        |event| match event {
            Event::TradeUpdated(trade) => Some(trade),
            _ => None,
        },
        f,
    )
}

/// Receive every `notification` payload that parses as a [`Notification`].
pub fn notifications<F>(bus: &EventBus, f: F) -> Subscription
where
    F: Fn(Notification) + Send + Sync + 'static,
{
    typed(
        bus,
        EventName::Notification,
        |event| match event {
            Event::Notification(notification) => Some(notification),
            _ => None,
        },
        f,
    )
}

pub fn connection_status<F>(bus: &EventBus, f: F) -> Subscription
where
    F: Fn(ConnectionStatus) + Send + Sync + 'static,
{
    typed(
        bus,
        EventName::ConnectionStatus,
        |event| match event {
            Event::ConnectionStatus(status) => Some(status),
            _ => None,
        },
        f,
    )
}
