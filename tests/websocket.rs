#![cfg(feature = "ws")]
#![allow(
    clippy::unwrap_used,
    clippy::missing_panics_doc,
    reason = "Do not need additional syntax for setting up tests"
)]

mod common;

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use common::{StatusLog, TOKEN, capture, credential, next_value, wait_connected, wait_for_state};
use futures_util::{SinkExt as _, StreamExt as _};
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::{sleep, timeout};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use trading_realtime::bus::EventBus;
use trading_realtime::ws::{Config, ConnectionManager, ConnectionState};

#[derive(Debug, Clone)]
enum Command {
    Text(String),
    /// Send a close frame, then hang up
    Close,
    /// Hang up without a close frame
    Drop,
}

/// Mock WebSocket server.
struct MockWsServer {
    addr: SocketAddr,
    /// Broadcast commands to ALL connected clients
    command_tx: broadcast::Sender<Command>,
    /// Handshake request URIs, sent once the connection is ready for broadcasts
    accepted_rx: mpsc::UnboundedReceiver<String>,
    /// Text frames sent by clients, heartbeats excluded
    request_rx: mpsc::UnboundedReceiver<String>,
    reject_handshakes: Arc<AtomicBool>,
    answer_pings: Arc<AtomicBool>,
}

impl MockWsServer {
    /// Start a mock WebSocket server on a random port.
    async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let (command_tx, _) = broadcast::channel::<Command>(100);
        let (accepted_tx, accepted_rx) = mpsc::unbounded_channel::<String>();
        let (request_tx, request_rx) = mpsc::unbounded_channel::<String>();
        let reject_handshakes = Arc::new(AtomicBool::new(false));
        let answer_pings = Arc::new(AtomicBool::new(true));

        let broadcast_tx = command_tx.clone();
        let reject = Arc::clone(&reject_handshakes);
        let pong = Arc::clone(&answer_pings);

        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };

                let (uri_tx, uri_rx) = oneshot::channel();
                let reject_now = reject.load(Ordering::SeqCst);
                let callback = move |request: &Request, response: Response| {
                    _ = uri_tx.send(request.uri().to_string());
                    if reject_now {
                        let mut denied = ErrorResponse::new(Some("unauthorized".to_owned()));
                        *denied.status_mut() = StatusCode::UNAUTHORIZED;
                        return Err(denied);
                    }
                    Ok(response)
                };

                let Ok(ws_stream) = tokio_tungstenite::accept_hdr_async(stream, callback).await
                else {
                    continue;
                };

                let (mut write, mut read) = ws_stream.split();
                let mut command_rx = broadcast_tx.subscribe();
                let req_tx = request_tx.clone();
                let pong = Arc::clone(&pong);
                _ = accepted_tx.send(uri_rx.await.unwrap_or_default());

                // Spawn a task to handle this connection
                tokio::spawn(async move {
                    loop {
                        tokio::select! {
                            msg = read.next() => {
                                match msg {
                                    Some(Ok(Message::Text(text))) if text == "PING" => {
                                        if pong.load(Ordering::SeqCst)
                                            && write.send(Message::Text("PONG".into())).await.is_err()
                                        {
                                            break;
                                        }
                                    }
                                    Some(Ok(Message::Text(text))) => {
                                        drop(req_tx.send(text.to_string()));
                                    }
                                    Some(Ok(_)) => {}
                                    _ => break,
                                }
                            }
                            command = command_rx.recv() => {
                                match command {
                                    Ok(Command::Text(text)) => {
                                        if write.send(Message::Text(text.into())).await.is_err() {
                                            break;
                                        }
                                    }
                                    Ok(Command::Close) => {
                                        _ = write.send(Message::Close(None)).await;
                                        break;
                                    }
                                    Ok(Command::Drop) | Err(_) => break,
                                }
                            }
                        }
                    }
                });
            }
        });

        Self {
            addr,
            command_tx,
            accepted_rx,
            request_rx,
            reject_handshakes,
            answer_pings,
        }
    }

    fn ws_url(&self, path: &str) -> String {
        format!("ws://{}{}", self.addr, path)
    }

    /// Send a text frame to all connected clients.
    fn send(&self, message: &str) {
        drop(self.command_tx.send(Command::Text(message.to_owned())));
    }

    fn send_event(&self, event: &str, data: &Value) {
        self.send(&json!({ "event": event, "data": data }).to_string());
    }

    fn close_all(&self) {
        drop(self.command_tx.send(Command::Close));
    }

    fn drop_all(&self) {
        drop(self.command_tx.send(Command::Drop));
    }

    fn reject_handshakes(&self, reject: bool) {
        self.reject_handshakes.store(reject, Ordering::SeqCst);
    }

    fn answer_pings(&self, answer: bool) {
        self.answer_pings.store(answer, Ordering::SeqCst);
    }

    /// Wait for the next accepted connection and return its request URI.
    async fn accepted(&mut self) -> Option<String> {
        timeout(Duration::from_secs(2), self.accepted_rx.recv())
            .await
            .ok()
            .flatten()
    }

    /// Receive the next client frame.
    async fn recv_request(&mut self) -> Option<Value> {
        timeout(Duration::from_secs(2), self.request_rx.recv())
            .await
            .ok()
            .flatten()
            .map(|text| serde_json::from_str(&text).unwrap())
    }
}

fn config(server: &MockWsServer) -> Config {
    let mut config = Config::new(&server.ws_url("/realtime")).unwrap();
    config.reconnect.initial_backoff = Duration::from_millis(50);
    config.reconnect.max_backoff = Duration::from_millis(200);
    config
}

fn manager(config: Config, bus: EventBus) -> ConnectionManager {
    ConnectionManager::new(config, credential(), bus)
}

mod session {
    use super::*;

    #[tokio::test]
    async fn handshake_carries_token_query_parameter() {
        let mut server = MockWsServer::start().await;
        let manager = manager(config(&server), EventBus::new());

        manager.connect();
        let uri = server.accepted().await.unwrap();

        assert_eq!(uri, format!("/realtime?token={TOKEN}"));
        wait_connected(&manager).await;
    }

    #[tokio::test]
    async fn server_events_reach_handlers() {
        let mut server = MockWsServer::start().await;
        let manager = manager(config(&server), EventBus::new());
        let (_subscription, mut balances) = capture(manager.bus(), "balance-updated");

        manager.connect();
        server.accepted().await.unwrap();
        wait_connected(&manager).await;

        server.send_event("balance-updated", &json!({ "balance": 100 }));

        assert_eq!(next_value(&mut balances).await, json!({ "balance": 100 }));
    }

    #[tokio::test]
    async fn batched_frame_dispatches_in_order() {
        let mut server = MockWsServer::start().await;
        let manager = manager(config(&server), EventBus::new());
        let (_subscription, mut trades) = capture(manager.bus(), "trade-updated");

        manager.connect();
        server.accepted().await.unwrap();
        wait_connected(&manager).await;

        server.send(
            &json!([
                { "event": "trade-updated", "data": { "id": "t-1" } },
                { "event": "notification", "data": { "title": "ignored" } },
                { "event": "trade-updated", "data": { "id": "t-2" } }
            ])
            .to_string(),
        );

        assert_eq!(next_value(&mut trades).await["id"], "t-1");
        assert_eq!(next_value(&mut trades).await["id"], "t-2");
    }

    #[tokio::test]
    async fn malformed_frames_are_skipped() {
        let mut server = MockWsServer::start().await;
        let manager = manager(config(&server), EventBus::new());
        let (_subscription, mut notifications) = capture(manager.bus(), "notification");

        manager.connect();
        server.accepted().await.unwrap();
        wait_connected(&manager).await;

        server.send("{ not json");
        server.send_event("notification", &json!({ "title": "still alive" }));

        assert_eq!(next_value(&mut notifications).await["title"], "still alive");
        assert!(manager.is_connected());
    }

    #[tokio::test]
    async fn emit_and_rooms_write_json_frames() {
        let mut server = MockWsServer::start().await;
        let manager = manager(config(&server), EventBus::new());

        manager.connect();
        server.accepted().await.unwrap();
        wait_connected(&manager).await;

        assert!(manager.emit("place-order", json!({ "symbol": "BTCUSDT", "side": "buy" })));
        assert!(manager.join_room("room1"));

        assert_eq!(
            server.recv_request().await,
            Some(json!({ "event": "place-order", "data": { "symbol": "BTCUSDT", "side": "buy" } }))
        );
        assert_eq!(
            server.recv_request().await,
            Some(json!({ "event": "join-room", "data": "room1" }))
        );
    }
}

mod heartbeat {
    use super::*;

    fn fast_heartbeat(server: &MockWsServer) -> Config {
        let mut config = config(server);
        config.heartbeat_interval = Duration::from_millis(50);
        config.heartbeat_timeout = Duration::from_millis(200);
        config
    }

    #[tokio::test]
    async fn answered_pings_keep_the_session() {
        let mut server = MockWsServer::start().await;
        let manager = manager(fast_heartbeat(&server), EventBus::new());

        manager.connect();
        server.accepted().await.unwrap();
        wait_connected(&manager).await;

        sleep(Duration::from_millis(600)).await;

        assert!(manager.is_connected());
        assert!(server.accepted().await.is_none(), "no reconnect expected");
    }

    #[tokio::test]
    async fn missing_pong_drops_and_reopens_the_session() {
        let mut server = MockWsServer::start().await;
        let manager = manager(fast_heartbeat(&server), EventBus::new());
        let (_subscription, mut disconnects) = capture(manager.bus(), "disconnect");
        server.answer_pings(false);

        manager.connect();
        server.accepted().await.unwrap();

        let reason = next_value(&mut disconnects).await;
        assert!(reason.as_str().unwrap().contains("Heartbeat"));

        server.answer_pings(true);
        assert!(server.accepted().await.is_some());
        wait_connected(&manager).await;
    }
}

mod reconnection {
    use super::*;

    #[tokio::test]
    async fn handlers_survive_a_dropped_connection() {
        let mut server = MockWsServer::start().await;
        let manager = manager(config(&server), EventBus::new());
        let (_subscription, mut balances) = capture(manager.bus(), "balance-updated");

        manager.connect();
        server.accepted().await.unwrap();
        wait_connected(&manager).await;

        server.drop_all();
        let uri = server.accepted().await;
        assert!(uri.is_some(), "client should reconnect after the connection drops");
        wait_connected(&manager).await;

        server.send_event("balance-updated", &json!({ "balance": 100 }));
        assert_eq!(next_value(&mut balances).await, json!({ "balance": 100 }));
        sleep(Duration::from_millis(50)).await;
        assert!(balances.try_recv().is_err(), "delivered exactly once");
    }

    #[tokio::test]
    async fn close_frame_reconnects_without_backoff() {
        let mut server = MockWsServer::start().await;
        let mut config = config(&server);
        // Far longer than the accept timeout: only an immediate retry can pass.
        config.reconnect.initial_backoff = Duration::from_secs(10);
        config.reconnect.max_backoff = Duration::from_secs(10);
        let manager = manager(config, EventBus::new());

        manager.connect();
        server.accepted().await.unwrap();
        wait_connected(&manager).await;

        server.close_all();

        assert!(server.accepted().await.is_some());
    }

    #[tokio::test]
    async fn rejected_handshake_is_reported_and_retried() {
        let mut server = MockWsServer::start().await;
        let bus = EventBus::new();
        let statuses = StatusLog::attach(&bus);
        let manager = manager(config(&server), bus);
        server.reject_handshakes(true);

        manager.connect();
        wait_for_state(&manager, |state| {
            matches!(state, ConnectionState::Reconnecting { .. })
        })
        .await;
        assert!(statuses.count("error") >= 1);

        server.reject_handshakes(false);
        wait_connected(&manager).await;
        assert_eq!(statuses.snapshot().last().map(String::as_str), Some("connected"));
    }

    #[tokio::test]
    async fn disconnect_closes_the_socket() {
        let mut server = MockWsServer::start().await;
        let manager = manager(config(&server), EventBus::new());

        manager.connect();
        server.accepted().await.unwrap();
        wait_connected(&manager).await;

        manager.disconnect();
        sleep(Duration::from_millis(300)).await;

        assert_eq!(manager.state(), ConnectionState::Disconnected);
        assert!(server.accepted().await.is_none());
    }
}
