//! Connection management for the real-time event socket.
//!
//! # Architecture
//!
//! - [`ConnectionManager`]: owns the single authenticated session, reconnects with exponential
//!   backoff and routes inbound events through an [`crate::bus::EventBus`]
//! - [`Transport`] / [`Session`]: the seam to the wire; [`WsTransport`] speaks WebSocket
//! - [`Config`] / [`ReconnectConfig`]: endpoint, heartbeat and retry tuning

pub mod config;
pub mod connection;
pub mod error;
pub mod traits;
#[cfg(feature = "ws")]
pub mod transport;

pub use config::{Config, ReconnectConfig, ReconnectSchedule};
pub use connection::{ConnectionManager, ConnectionState};
pub use error::TransportError;
pub use traits::*;
#[cfg(feature = "ws")]
pub use transport::{WsSession, WsTransport};
