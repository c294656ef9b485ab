//! WebSocket implementation of [`Transport`].
//!
//! Every text frame carries JSON events (see [`crate::types::parse_frames`]). Liveness is
//! checked with text `PING`/`PONG` frames: a PING goes out every `heartbeat_interval`, and a
//! session whose PING stays unanswered for `heartbeat_timeout` is reported dead.

use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt as _, StreamExt as _};
use secrecy::{ExposeSecret as _, SecretString};
use tokio::net::TcpStream;
use tokio::time::{Instant, Interval, MissedTickBehavior, interval};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async, tungstenite::Message};

use super::config::Config;
use super::error::TransportError;
use super::traits::{DisconnectReason, Session, SessionEvent, Transport};
use crate::Result;
use crate::types::{OutboundFrame, parse_frames};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Opens sessions with `tokio-tungstenite`, passing the credential as a query parameter.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, Default)]
pub struct WsTransport;

#[async_trait]
impl Transport for WsTransport {
    async fn open(&self, config: &Config, credential: &SecretString) -> Result<Box<dyn Session>> {
        let url = config.authenticated_endpoint(credential.expose_secret());
        let (stream, _) = connect_async(url.as_str()).await?;

        Ok(Box::new(WsSession::new(
            stream,
            config.heartbeat_interval,
            config.heartbeat_timeout,
        )))
    }
}

/// A live WebSocket session.
pub struct WsSession {
    write: SplitSink<WsStream, Message>,
    read: SplitStream<WsStream>,
    ping_interval: Interval,
    heartbeat_timeout: Duration,
    /// When the unanswered PING went out
    awaiting_pong: Option<Instant>,
}

impl WsSession {
    fn new(stream: WsStream, heartbeat_interval: Duration, heartbeat_timeout: Duration) -> Self {
        let (write, read) = stream.split();
        let mut ping_interval = interval(heartbeat_interval);
        ping_interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        Self {
            write,
            read,
            ping_interval,
            heartbeat_timeout,
            awaiting_pong: None,
        }
    }

    async fn heartbeat(&mut self) -> Option<DisconnectReason> {
        if let Some(sent) = self.awaiting_pong {
            if sent.elapsed() >= self.heartbeat_timeout {
                #[cfg(feature = "tracing")]
                tracing::warn!(
                    "Heartbeat timeout: no PONG received within {:?}",
                    self.heartbeat_timeout
                );
                return Some(DisconnectReason::Transport(
                    TransportError::HeartbeatTimeout.into(),
                ));
            }
            return None;
        }

        if let Err(e) = self.write.send(Message::Text("PING".into())).await {
            return Some(DisconnectReason::Transport(e.into()));
        }
        self.awaiting_pong = Some(Instant::now());
        None
    }
}

#[async_trait]
impl Session for WsSession {
    async fn recv(&mut self) -> SessionEvent {
        loop {
            tokio::select! {
                msg = self.read.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) if text == "PONG" => {
                            self.awaiting_pong = None;
                        }
                        Some(Ok(Message::Text(text))) => {
                            #[cfg(feature = "tracing")]
                            tracing::trace!(%text, "Received WebSocket text message");

                            match parse_frames(text.as_bytes()) {
                                Ok(frames) => return SessionEvent::Frames(frames),
                                Err(e) => {
                                    #[cfg(feature = "tracing")]
                                    tracing::warn!(%text, error = %e, "Failed to parse WebSocket message");
                                    #[cfg(not(feature = "tracing"))]
                                    let _ = &e;
                                }
                            }
                        }
                        Some(Ok(Message::Close(_))) => {
                            return SessionEvent::Closed(DisconnectReason::ServerClosed);
                        }
                        Some(Err(e)) => {
                            return SessionEvent::Closed(DisconnectReason::Transport(e.into()));
                        }
                        None => {
                            return SessionEvent::Closed(DisconnectReason::Transport(
                                TransportError::ConnectionClosed.into(),
                            ));
                        }
                        Some(Ok(_)) => {
                            // Binary frames are not part of the protocol; control frames are
                            // answered by tungstenite itself.
                        }
                    }
                }

                _ = self.ping_interval.tick() => {
                    if let Some(reason) = self.heartbeat().await {
                        return SessionEvent::Closed(reason);
                    }
                }
            }
        }
    }

    async fn send(&mut self, frame: &OutboundFrame) -> Result<()> {
        let json = frame.to_json()?;
        self.write.send(Message::Text(json.into())).await?;
        Ok(())
    }

    async fn close(&mut self) {
        _ = self.write.send(Message::Close(None)).await;
        _ = self.write.close().await;
    }
}
