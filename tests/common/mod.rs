#![allow(
    clippy::unwrap_used,
    clippy::missing_panics_doc,
    reason = "Do not need additional syntax for setting up tests, and https://github.com/rust-lang/rust-clippy/issues/13981"
)]
#![allow(
    unused,
    reason = "Deeply nested uses in sub-modules are falsely flagged as being unused"
)]

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::time::{Instant, timeout};
use trading_realtime::auth::{ExposeSecret as _, SecretString, StaticCredential};
use trading_realtime::bus::{EventBus, Subscription};
use trading_realtime::types::{EventName, InboundFrame, OutboundFrame};
use trading_realtime::ws::{
    Config, ConnectionManager, ConnectionState, DisconnectReason, Session, SessionEvent,
    Transport, TransportError,
};

pub const TOKEN: &str = "session-token";

/// Generous upper bound for awaits; with a paused clock it only has to outlast the longest
/// backoff delay.
pub const WAIT: Duration = Duration::from_secs(600);

#[must_use]
pub fn config() -> Config {
    Config::new("ws://127.0.0.1:1/realtime").unwrap()
}

#[must_use]
pub fn credential() -> StaticCredential {
    StaticCredential::new(TOKEN.to_owned())
}

/// One recorded `Transport::open` call.
#[derive(Debug, Clone)]
pub struct Attempt {
    pub at: Instant,
    pub credential: String,
}

#[derive(Default)]
struct MockState {
    refuse_all: AtomicBool,
    refusals: AtomicU32,
    attempts: Mutex<Vec<Attempt>>,
}

/// In-memory [`Transport`]: every accepted session is handed to the paired [`MockServer`].
#[derive(Clone)]
pub struct MockTransport {
    state: Arc<MockState>,
    sessions_tx: mpsc::UnboundedSender<ServerSession>,
}

impl MockTransport {
    #[must_use]
    pub fn pair() -> (Self, MockServer) {
        let (sessions_tx, sessions_rx) = mpsc::unbounded_channel();
        let transport = Self {
            state: Arc::default(),
            sessions_tx,
        };
        (transport, MockServer { sessions_rx })
    }

    /// Reject the next `n` attempts.
    pub fn refuse_next(&self, n: u32) {
        self.state.refusals.store(n, Ordering::SeqCst);
    }

    /// Reject every attempt until switched off again.
    pub fn refuse_all(&self, refuse: bool) {
        self.state.refuse_all.store(refuse, Ordering::SeqCst);
    }

    #[must_use]
    pub fn attempts(&self) -> Vec<Attempt> {
        self.state.attempts.lock().unwrap().clone()
    }

    /// Gaps between consecutive attempts.
    #[must_use]
    pub fn delays(&self) -> Vec<Duration> {
        self.attempts()
            .windows(2)
            .map(|pair| pair[1].at - pair[0].at)
            .collect()
    }

    fn refuses(&self) -> bool {
        self.state.refuse_all.load(Ordering::SeqCst)
            || self
                .state
                .refusals
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn open(
        &self,
        _config: &Config,
        credential: &SecretString,
    ) -> trading_realtime::Result<Box<dyn Session>> {
        self.state.attempts.lock().unwrap().push(Attempt {
            at: Instant::now(),
            credential: credential.expose_secret().to_owned(),
        });

        if self.refuses() {
            return Err(TransportError::InvalidMessage("handshake rejected".to_owned()).into());
        }

        let (to_client, inbound) = mpsc::unbounded_channel();
        let (outbound, from_client) = mpsc::unbounded_channel();
        _ = self.sessions_tx.send(ServerSession {
            to_client,
            from_client,
        });

        Ok(Box::new(MockSession { inbound, outbound }))
    }
}

struct MockSession {
    inbound: mpsc::UnboundedReceiver<SessionEvent>,
    outbound: mpsc::UnboundedSender<OutboundFrame>,
}

#[async_trait]
impl Session for MockSession {
    async fn recv(&mut self) -> SessionEvent {
        self.inbound.recv().await.unwrap_or_else(|| {
            SessionEvent::Closed(DisconnectReason::Transport(
                TransportError::ConnectionClosed.into(),
            ))
        })
    }

    async fn send(&mut self, frame: &OutboundFrame) -> trading_realtime::Result<()> {
        self.outbound
            .send(frame.clone())
            .map_err(|_e| TransportError::ConnectionClosed.into())
    }

    async fn close(&mut self) {}
}

/// Server side of the in-memory transport.
pub struct MockServer {
    sessions_rx: mpsc::UnboundedReceiver<ServerSession>,
}

impl MockServer {
    /// Wait for the client to open its next session.
    pub async fn next_session(&mut self) -> ServerSession {
        timeout(WAIT, self.sessions_rx.recv()).await.unwrap().unwrap()
    }

    /// A session opened since the last call, if any.
    pub fn try_next_session(&mut self) -> Option<ServerSession> {
        self.sessions_rx.try_recv().ok()
    }
}

/// Server end of one session. Dropping it looks like a lost connection to the client.
pub struct ServerSession {
    to_client: mpsc::UnboundedSender<SessionEvent>,
    from_client: mpsc::UnboundedReceiver<OutboundFrame>,
}

impl ServerSession {
    pub fn emit(&self, event: &str, data: Value) {
        let frame = InboundFrame::builder().event(event).data(data).build();
        _ = self.to_client.send(SessionEvent::Frames(vec![frame]));
    }

    /// Close the session on purpose, like a server-side close frame.
    pub fn close(&self) {
        _ = self
            .to_client
            .send(SessionEvent::Closed(DisconnectReason::ServerClosed));
    }

    pub async fn recv(&mut self) -> Option<OutboundFrame> {
        timeout(Duration::from_secs(2), self.from_client.recv())
            .await
            .ok()
            .flatten()
    }

    pub fn try_recv(&mut self) -> Option<OutboundFrame> {
        self.from_client.try_recv().ok()
    }
}

/// Every `connection-status` payload seen on a bus.
pub struct StatusLog {
    seen: Arc<Mutex<Vec<String>>>,
    _subscription: Subscription,
}

impl StatusLog {
    #[must_use]
    pub fn attach(bus: &EventBus) -> Self {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let subscription = bus.on(EventName::ConnectionStatus, move |status| {
            sink.lock()
                .unwrap()
                .push(status.as_str().unwrap_or_default().to_owned());
        });

        Self {
            seen,
            _subscription: subscription,
        }
    }

    #[must_use]
    pub fn snapshot(&self) -> Vec<String> {
        self.seen.lock().unwrap().clone()
    }

    #[must_use]
    pub fn count(&self, status: &str) -> usize {
        self.seen
            .lock()
            .unwrap()
            .iter()
            .filter(|seen| *seen == status)
            .count()
    }
}

/// Forward every payload of `event` into a channel.
pub fn capture<E: Into<EventName>>(
    bus: &EventBus,
    event: E,
) -> (Subscription, mpsc::UnboundedReceiver<Value>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let subscription = bus.on(event, move |data| {
        _ = tx.send(data.clone());
    });
    (subscription, rx)
}

pub async fn next_value(rx: &mut mpsc::UnboundedReceiver<Value>) -> Value {
    timeout(WAIT, rx.recv()).await.unwrap().unwrap()
}

pub async fn wait_for_state<F>(manager: &ConnectionManager, predicate: F)
where
    F: Fn(&ConnectionState) -> bool,
{
    let mut rx = manager.state_receiver();
    drop(timeout(WAIT, rx.wait_for(|state| predicate(state)))
        .await
        .unwrap()
        .unwrap());
}

pub async fn wait_connected(manager: &ConnectionManager) {
    wait_for_state(manager, |state| state.is_connected()).await;
}

/// Assert `actual` matches `expected` up to timer granularity.
pub fn assert_delay(actual: Duration, expected: Duration) {
    assert!(
        actual >= expected && actual - expected < Duration::from_millis(10),
        "expected a delay of {expected:?}, got {actual:?}"
    );
}
