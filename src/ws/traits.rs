//! Seams between the connection manager and the wire.
//!
//! The manager only knows how to open a [`Session`] through a [`Transport`] and how to pump
//! frames in and out of it. [`super::transport::WsTransport`] is the production implementation;
//! tests plug in an in-memory one.

use async_trait::async_trait;
use secrecy::SecretString;

use crate::Result;
use crate::error::Error;
use crate::types::{InboundFrame, OutboundFrame};
use crate::ws::config::Config;

/// Why a live session ended.
#[non_exhaustive]
#[derive(Debug)]
pub enum DisconnectReason {
    /// The server closed the session on purpose (close frame). Retried immediately.
    ServerClosed,
    /// The socket failed, timed out or vanished. Retried with backoff.
    Transport(Error),
}

impl DisconnectReason {
    /// Short label published as the `disconnect` event payload.
    #[must_use]
    pub fn label(&self) -> String {
        match self {
            Self::ServerClosed => "server closed".to_owned(),
            Self::Transport(e) => e.to_string(),
        }
    }
}

/// What a session yielded on its inbound side.
#[non_exhaustive]
#[derive(Debug)]
pub enum SessionEvent {
    /// One text frame worth of events (possibly empty for keep-alives)
    Frames(Vec<InboundFrame>),
    /// The session is over; no further events follow
    Closed(DisconnectReason),
}

/// Factory for transport sessions.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Open a session, presenting `credential` during the handshake.
    ///
    /// Network errors, auth rejections and protocol failures all surface as `Err`.
    async fn open(&self, config: &Config, credential: &SecretString) -> Result<Box<dyn Session>>;
}

/// One live transport session.
///
/// `recv` must be cancel safe: the manager races it against outbound traffic and shutdown.
#[async_trait]
pub trait Session: Send {
    async fn recv(&mut self) -> SessionEvent;

    async fn send(&mut self, frame: &OutboundFrame) -> Result<()>;

    /// Close politely. Errors are ignored; the session is discarded either way.
    async fn close(&mut self);
}
