//! Event names, typed payloads and wire frames.
//!
//! The socket multiplexes many named events over a single session. Known names get their own
//! [`EventName`] variant and a typed payload in [`Event`]; every other name travels as
//! [`EventName::Custom`] with its raw JSON payload, so new server events are deliverable without
//! code changes.

pub mod request;
pub mod response;

use std::fmt;

/// Arbitrary precision decimal type for balances, prices and quantities.
pub use rust_decimal::Decimal;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
/// Raw JSON payload carried by every event.
pub use serde_json::Value;

pub use request::OutboundFrame;
pub use response::{
    BalanceUpdate, ConnectionStatus, InboundFrame, Notification, Severity, TradeUpdate,
    parse_frames,
};

/// Name of an event travelling over the socket or published locally.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EventName {
    /// `balance-updated`
    BalanceUpdated,
    /// `trade-updated`
    TradeUpdated,
    /// `notification`
    Notification,
    /// `connection-status`, published locally on every connection state transition
    ConnectionStatus,
    /// `connect`, published locally when a session is established
    Connect,
    /// `disconnect`, published locally when a session ends
    Disconnect,
    /// `connect_error`, published locally when a connect attempt fails
    ConnectError,
    /// `join-room` control message
    JoinRoom,
    /// `leave-room` control message
    LeaveRoom,
    /// Any other event name
    Custom(String),
}

impl EventName {
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::BalanceUpdated => "balance-updated",
            Self::TradeUpdated => "trade-updated",
            Self::Notification => "notification",
            Self::ConnectionStatus => "connection-status",
            Self::Connect => "connect",
            Self::Disconnect => "disconnect",
            Self::ConnectError => "connect_error",
            Self::JoinRoom => "join-room",
            Self::LeaveRoom => "leave-room",
            Self::Custom(name) => name,
        }
    }

    /// Whether payloads of this event feed the alerting side channel.
    #[must_use]
    pub const fn is_alertable(&self) -> bool {
        matches!(
            self,
            Self::BalanceUpdated | Self::TradeUpdated | Self::Notification
        )
    }
}

impl From<&str> for EventName {
    fn from(name: &str) -> Self {
        match name {
            "balance-updated" => Self::BalanceUpdated,
            "trade-updated" => Self::TradeUpdated,
            "notification" => Self::Notification,
            "connection-status" => Self::ConnectionStatus,
            "connect" => Self::Connect,
            "disconnect" => Self::Disconnect,
            "connect_error" => Self::ConnectError,
            "join-room" => Self::JoinRoom,
            "leave-room" => Self::LeaveRoom,
            other => Self::Custom(other.to_owned()),
        }
    }
}

impl From<String> for EventName {
    fn from(name: String) -> Self {
        match Self::from(name.as_str()) {
            Self::Custom(_) => Self::Custom(name),
            known => known,
        }
    }
}

impl From<&EventName> for EventName {
    fn from(name: &EventName) -> Self {
        name.clone()
    }
}

impl fmt::Display for EventName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for EventName {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for EventName {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        String::deserialize(deserializer).map(Self::from)
    }
}

/// A named payload interpreted against the known event set.
#[non_exhaustive]
#[derive(Debug, Clone)]
pub enum Event {
    BalanceUpdated(BalanceUpdate),
    TradeUpdated(TradeUpdate),
    Notification(Notification),
    ConnectionStatus(ConnectionStatus),
    /// Unknown name, or a known name whose payload did not match its typed shape
    Custom { name: EventName, data: Value },
}

impl Event {
    /// Interpret `data` as the payload of `name`.
    ///
    /// Never fails: payloads that do not deserialize into the typed shape fall back to
    /// [`Event::Custom`].
    #[must_use]
    pub fn parse(name: &EventName, data: &Value) -> Self {
        let typed = match name {
            EventName::BalanceUpdated => {
                serde_json::from_value(data.clone()).map(Self::BalanceUpdated)
            }
            EventName::TradeUpdated => serde_json::from_value(data.clone()).map(Self::TradeUpdated),
            EventName::Notification => serde_json::from_value(data.clone()).map(Self::Notification),
            EventName::ConnectionStatus => {
                serde_json::from_value(data.clone()).map(Self::ConnectionStatus)
            }
            _ => {
                return Self::Custom {
                    name: name.clone(),
                    data: data.clone(),
                };
            }
        };

        typed.unwrap_or_else(|_e| Self::Custom {
            name: name.clone(),
            data: data.clone(),
        })
    }

    #[must_use]
    pub fn name(&self) -> EventName {
        match self {
            Self::BalanceUpdated(_) => EventName::BalanceUpdated,
            Self::TradeUpdated(_) => EventName::TradeUpdated,
            Self::Notification(_) => EventName::Notification,
            Self::ConnectionStatus(_) => EventName::ConnectionStatus,
            Self::Custom { name, .. } => name.clone(),
        }
    }
}
