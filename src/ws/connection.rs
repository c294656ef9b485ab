#![expect(
    clippy::module_name_repetitions,
    reason = "Connection types expose their domain in the name for clarity"
)]

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use secrecy::SecretString;
use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep, timeout};
use tokio_util::sync::CancellationToken;

use super::config::{Config, ReconnectSchedule};
use super::error::TransportError;
use super::traits::{DisconnectReason, Session, SessionEvent, Transport};
use crate::auth::CredentialSource;
use crate::bus::{EventBus, Handler, Subscription};
use crate::types::{ConnectionStatus, EventName, OutboundFrame};

/// Connection state tracking.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No live session and no attempt in flight
    Disconnected,
    /// Handshake in progress
    Connecting,
    /// Session live; handlers are attached to it
    Connected {
        /// When the session was established
        since: Instant,
        /// Identifier of the live session
        session: u64,
    },
    /// Waiting before the next attempt
    Reconnecting {
        /// Consecutive failures so far
        attempt: u32,
        /// Delay before the next attempt
        delay: Duration,
    },
    /// Retry budget exhausted; only an explicit `connect()` starts over
    Failed,
}

impl ConnectionState {
    /// Check if the connection is currently active.
    #[must_use]
    pub const fn is_connected(self) -> bool {
        matches!(self, Self::Connected { .. })
    }

    /// Status published on `connection-status` when entering this state.
    ///
    /// `Reconnecting` has no status of its own: the preceding `disconnected` or `error` covers it.
    #[must_use]
    pub const fn status(self) -> Option<ConnectionStatus> {
        match self {
            Self::Disconnected => Some(ConnectionStatus::Disconnected),
            Self::Connecting => Some(ConnectionStatus::Connecting),
            Self::Connected { .. } => Some(ConnectionStatus::Connected),
            Self::Reconnecting { .. } => None,
            Self::Failed => Some(ConnectionStatus::Failed),
        }
    }
}

/// Channel into the live session's outbound queue.
struct LiveSession {
    session: u64,
    outbound: mpsc::UnboundedSender<OutboundFrame>,
}

/// How a served session ended.
struct SessionOutcome {
    reason: DisconnectReason,
    /// Whether at least one inbound event arrived
    delivered: bool,
}

/// State shared between the manager handle and its driver task.
struct Shared {
    config: Config,
    transport: Arc<dyn Transport>,
    credentials: Arc<dyn CredentialSource>,
    bus: EventBus,
    state_tx: watch::Sender<ConnectionState>,
    /// Outbound queue of the session in `Connected`. State changes happen under this lock so
    /// a torn-down driver cannot resurrect itself.
    live: Mutex<Option<LiveSession>>,
    next_session: AtomicU64,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Shared {
    /// Move to `state` unless the driver owning `cancel` was torn down. Returns whether the
    /// transition happened; the caller announces the status.
    fn apply(&self, cancel: &CancellationToken, state: ConnectionState) -> bool {
        let _live = lock(&self.live);
        if cancel.is_cancelled() {
            return false;
        }
        self.state_tx.send_replace(state);
        true
    }

    /// [`Shared::apply`] followed by the matching `connection-status` event.
    fn transition(&self, cancel: &CancellationToken, state: ConnectionState) -> bool {
        if !self.apply(cancel, state) {
            return false;
        }

        #[cfg(feature = "tracing")]
        tracing::debug!(?state, "Connection state changed");

        if let Some(status) = state.status() {
            self.announce(cancel, status);
        }
        true
    }

    /// Publish `status` unless the driver owning `cancel` was torn down since its last state
    /// change. Handlers run outside the `live` lock, so a `disconnect()` may land in between.
    fn announce(&self, cancel: &CancellationToken, status: ConnectionStatus) -> bool {
        if cancel.is_cancelled() {
            return false;
        }
        self.bus.publish_status(status);
        true
    }

    fn release(&self, session: u64) {
        {
            let mut live = lock(&self.live);
            if live.as_ref().is_some_and(|live| live.session == session) {
                *live = None;
            }
        }
        self.bus.unbind_session(session);
    }

    /// Hand `frame` to the live session, giving it back if there is none.
    fn enqueue(&self, frame: OutboundFrame) -> Result<(), OutboundFrame> {
        let live = lock(&self.live);
        match live.as_ref() {
            Some(session) => session
                .outbound
                .send(frame)
                .map_err(|mpsc::error::SendError(frame)| frame),
            None => Err(frame),
        }
    }

    /// Connection driver: attempts, serves and retries sessions until cancelled, the
    /// credential disappears, or the retry budget runs out.
    async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let mut schedule = ReconnectSchedule::new(&self.config.reconnect);
        let mut immediate_retry_spent = false;

        loop {
            if !self.transition(&cancel, ConnectionState::Connecting) {
                return;
            }

            let Some(credential) = self.credentials.credential() else {
                #[cfg(feature = "tracing")]
                tracing::warn!("Credential no longer available, stopping");
                self.transition(&cancel, ConnectionState::Disconnected);
                return;
            };

            let opened = tokio::select! {
                biased;

                () = cancel.cancelled() => return,
                opened = self.open(&credential) => opened,
            };

            match opened {
                Ok(session) => {
                    schedule.reset();

                    let Some(outcome) = self.serve(session, &cancel).await else {
                        return;
                    };

                    #[cfg(feature = "tracing")]
                    tracing::info!(reason = %outcome.reason.label(), "Session ended");

                    self.bus
                        .publish(EventName::Disconnect, &Value::String(outcome.reason.label()));
                    if !self.transition(&cancel, ConnectionState::Disconnected) {
                        return;
                    }

                    // A deliberate server close is retried at once, but only once in a row
                    // unless the session did real work in between.
                    let forced = matches!(outcome.reason, DisconnectReason::ServerClosed);
                    if forced && (outcome.delivered || !immediate_retry_spent) {
                        immediate_retry_spent = true;
                        #[cfg(feature = "tracing")]
                        tracing::info!("Server closed the session, reconnecting immediately");
                        continue;
                    }
                    immediate_retry_spent = false;
                }
                Err(e) => {
                    #[cfg(feature = "tracing")]
                    tracing::warn!(error = %e, "Unable to connect");

                    if !self.apply(&cancel, ConnectionState::Disconnected) {
                        return;
                    }
                    self.bus
                        .publish(EventName::ConnectError, &Value::String(e.to_string()));
                    self.announce(&cancel, ConnectionStatus::Error);
                }
            }

            match schedule.next_delay() {
                Some(delay) => {
                    let attempt = schedule.attempts();
                    #[cfg(feature = "tracing")]
                    tracing::info!(attempt, ?delay, "Scheduling reconnect");

                    if !self.transition(&cancel, ConnectionState::Reconnecting { attempt, delay }) {
                        return;
                    }

                    tokio::select! {
                        biased;

                        () = cancel.cancelled() => return,
                        () = sleep(delay) => {}
                    }
                }
                None => {
                    #[cfg(feature = "tracing")]
                    tracing::error!(
                        attempts = schedule.attempts(),
                        "Reconnect attempts exhausted, giving up"
                    );
                    self.transition(&cancel, ConnectionState::Failed);
                    return;
                }
            }
        }
    }

    async fn open(&self, credential: &SecretString) -> crate::Result<Box<dyn Session>> {
        timeout(
            self.config.handshake_timeout,
            self.transport.open(&self.config, credential),
        )
        .await
        .unwrap_or_else(|_elapsed| Err(TransportError::Timeout.into()))
    }

    /// Pump one session until it ends. Returns `None` if the driver was torn down meanwhile.
    async fn serve(
        &self,
        mut session: Box<dyn Session>,
        cancel: &CancellationToken,
    ) -> Option<SessionOutcome> {
        let session_id = self
            .next_session
            .fetch_add(1, Ordering::Relaxed)
            .wrapping_add(1);
        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel();

        // Registered handlers are replayed before the first inbound frame is read.
        let binding = {
            let mut live = lock(&self.live);
            if cancel.is_cancelled() {
                None
            } else {
                let binding = self.bus.bind_session(session_id);
                *live = Some(LiveSession {
                    session: session_id,
                    outbound: outbound_tx,
                });
                self.state_tx.send_replace(ConnectionState::Connected {
                    since: Instant::now(),
                    session: session_id,
                });
                Some(binding)
            }
        };
        let Some(binding) = binding else {
            session.close().await;
            return None;
        };

        #[cfg(feature = "tracing")]
        tracing::info!(session = session_id, "Connected");
        if self.announce(cancel, ConnectionStatus::Connected) {
            self.bus.publish(EventName::Connect, &Value::from(session_id));
        }

        let mut delivered = false;
        let reason = loop {
            tokio::select! {
                biased;

                () = cancel.cancelled() => {
                    self.release(session_id);
                    session.close().await;
                    return None;
                }

                Some(frame) = outbound_rx.recv() => {
                    #[cfg(feature = "tracing")]
                    tracing::trace!(event = %frame.event, "Sending event");

                    if let Err(e) = session.send(&frame).await {
                        break DisconnectReason::Transport(e);
                    }
                }

                event = session.recv() => match event {
                    SessionEvent::Frames(frames) => {
                        for frame in frames {
                            delivered = true;
                            self.bus.deliver(&binding, &frame.event, &frame.data);
                        }
                    }
                    SessionEvent::Closed(reason) => break reason,
                },
            }
        };

        self.release(session_id);
        session.close().await;

        Some(SessionOutcome { reason, delivered })
    }
}

struct Inner {
    shared: Arc<Shared>,
    /// Cancels the current driver task
    driver: Mutex<Option<CancellationToken>>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Some(cancel) = self
            .driver
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            cancel.cancel();
        }
    }
}

/// Owns the single authenticated session to the event server.
///
/// The manager opens the session on [`ConnectionManager::connect`], keeps it alive with
/// exponential-backoff reconnects, and routes inbound events through its [`EventBus`]. Handlers
/// registered on the bus survive reconnects; they are attached to every new session when it
/// reaches `Connected`. Lifecycle changes are published on the `connection-status` event.
///
/// # Example
///
/// ```no_run
/// use trading_realtime::auth::StaticCredential;
/// use trading_realtime::bus::EventBus;
/// use trading_realtime::ws::{Config, ConnectionManager};
///
/// # async fn run() -> trading_realtime::Result<()> {
/// let config = Config::new("wss://api.example.com/realtime")?;
/// let manager = ConnectionManager::new(
///     config,
///     StaticCredential::new("token".to_owned()),
///     EventBus::new(),
/// );
///
/// let _balances = manager.on("balance-updated", |payload| println!("{payload}"));
/// manager.connect();
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

impl ConnectionManager {
    /// Create a manager speaking WebSocket to `config.endpoint`. Nothing connects until
    /// [`ConnectionManager::connect`].
    #[cfg(feature = "ws")]
    #[must_use]
    pub fn new<C: CredentialSource>(config: Config, credentials: C, bus: EventBus) -> Self {
        Self::with_transport(config, super::transport::WsTransport, credentials, bus)
    }

    /// Create a manager on top of a custom [`Transport`].
    #[must_use]
    pub fn with_transport<T, C>(config: Config, transport: T, credentials: C, bus: EventBus) -> Self
    where
        T: Transport,
        C: CredentialSource,
    {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);

        Self {
            inner: Arc::new(Inner {
                shared: Arc::new(Shared {
                    config,
                    transport: Arc::new(transport),
                    credentials: Arc::new(credentials),
                    bus,
                    state_tx,
                    live: Mutex::new(None),
                    next_session: AtomicU64::new(0),
                }),
                driver: Mutex::new(None),
            }),
        }
    }

    /// Open the session in the background.
    ///
    /// Does nothing without a credential, or while a session is live or being established.
    /// From any other state a leftover driver is torn down and a fresh attempt starts with a
    /// clean retry budget. Must be called from within a Tokio runtime.
    pub fn connect(&self) {
        let shared = &self.inner.shared;
        let mut driver = lock(&self.inner.driver);

        let state = *shared.state_tx.borrow();
        if driver.is_some()
            && matches!(
                state,
                ConnectionState::Connected { .. } | ConnectionState::Connecting
            )
        {
            #[cfg(feature = "tracing")]
            tracing::debug!(?state, "Connect ignored, session already active");
            return;
        }

        if shared.credentials.credential().is_none() {
            #[cfg(feature = "tracing")]
            tracing::warn!("No credential available, not connecting");
            return;
        }

        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            #[cfg(feature = "tracing")]
            tracing::error!("Connect called outside a Tokio runtime");
            return;
        };

        if let Some(stale) = driver.take() {
            #[cfg(feature = "tracing")]
            tracing::debug!("Tearing down previous connection driver");
            stale.cancel();
        }

        // The driver announces `connecting` itself; the state flips now so a second call is
        // ignored.
        let cancel = CancellationToken::new();
        shared.apply(&cancel, ConnectionState::Connecting);
        *driver = Some(cancel.clone());

        runtime.spawn(Arc::clone(shared).run(cancel));
    }

    /// Close the session and stop reconnecting.
    ///
    /// Publishes `disconnected`, then drops every handler registration: a later
    /// [`ConnectionManager::connect`] starts with an empty registry.
    pub fn disconnect(&self) {
        let shared = &self.inner.shared;

        if let Some(cancel) = lock(&self.inner.driver).take() {
            cancel.cancel();
        }

        let previous = {
            let mut live = lock(&shared.live);
            *live = None;
            shared.state_tx.send_replace(ConnectionState::Disconnected)
        };

        #[cfg(feature = "tracing")]
        tracing::info!("Disconnected");

        if previous != ConnectionState::Disconnected {
            shared.bus.publish_status(ConnectionStatus::Disconnected);
        }
        shared.bus.clear();
    }

    /// Send `event` with `data` over the live session.
    ///
    /// Returns `false`, and sends nothing, while no session is in `Connected`. Frames are not
    /// buffered across reconnects.
    pub fn emit<E: Into<EventName>>(&self, event: E, data: Value) -> bool {
        match self.inner.shared.enqueue(OutboundFrame::new(event, data)) {
            Ok(()) => true,
            Err(frame) => {
                #[cfg(feature = "tracing")]
                tracing::warn!(event = %frame.event, "Not connected, dropping outbound event");
                #[cfg(not(feature = "tracing"))]
                let _ = &frame;
                false
            }
        }
    }

    /// Register a closure for `event`. See [`EventBus::on`].
    pub fn on<E, F>(&self, event: E, f: F) -> Subscription
    where
        E: Into<EventName>,
        F: Fn(&Value) + Send + Sync + 'static,
    {
        self.inner.shared.bus.on(event, f)
    }

    /// Remove `handler` from `event`. See [`EventBus::off`].
    pub fn off<E: Into<EventName>>(&self, event: E, handler: &Handler) -> bool {
        self.inner.shared.bus.off(event, handler)
    }

    /// Ask the server to add this session to `room`. Returns `false` while disconnected.
    pub fn join_room(&self, room: &str) -> bool {
        self.inner
            .shared
            .enqueue(OutboundFrame::join_room(room))
            .is_ok()
    }

    /// Ask the server to remove this session from `room`. Returns `false` while disconnected.
    pub fn leave_room(&self, room: &str) -> bool {
        self.inner
            .shared
            .enqueue(OutboundFrame::leave_room(room))
            .is_ok()
    }

    /// Get the current connection state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.inner.shared.state_tx.borrow()
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.state().is_connected()
    }

    /// Subscribe to state changes.
    #[must_use]
    pub fn state_receiver(&self) -> watch::Receiver<ConnectionState> {
        self.inner.shared.state_tx.subscribe()
    }

    /// The bus inbound events are routed through.
    #[must_use]
    pub fn bus(&self) -> &EventBus {
        &self.inner.shared.bus
    }

    /// Follow an auth store: connect when a credential appears, disconnect when it is revoked.
    ///
    /// The returned task ends when the sender is dropped or every manager handle is gone.
    /// Returns `None`, and follows nothing, when called outside a Tokio runtime.
    pub fn follow_credentials(
        &self,
        mut credentials: watch::Receiver<Option<SecretString>>,
    ) -> Option<JoinHandle<()>> {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            #[cfg(feature = "tracing")]
            tracing::error!("follow_credentials called outside a Tokio runtime");
            return None;
        };
        let weak = Arc::downgrade(&self.inner);

        let task = runtime.spawn(async move {
            let mut authenticated = false;

            loop {
                let available = credentials.borrow_and_update().is_some();
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                let manager = Self { inner };

                if available {
                    manager.connect();
                } else if authenticated {
                    #[cfg(feature = "tracing")]
                    tracing::info!("Credential revoked, disconnecting");
                    manager.disconnect();
                }
                authenticated = available;
                drop(manager);

                if credentials.changed().await.is_err() {
                    break;
                }
            }
        });

        Some(task)
    }
}

impl fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("endpoint", &self.inner.shared.config.endpoint.as_str())
            .field("state", &self.state())
            .field("bus", &self.inner.shared.bus)
            .finish_non_exhaustive()
    }
}
