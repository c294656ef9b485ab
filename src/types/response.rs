use bon::Builder;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use super::{Decimal, EventName};
use crate::ws::error::TransportError;

/// One inbound event frame: `{"event": <name>, "data": <payload>}`.
///
/// A missing `data` field is treated as `null`.
#[non_exhaustive]
#[derive(Debug, Clone, Deserialize, Serialize, Builder)]
pub struct InboundFrame {
    /// Name of the event
    #[builder(into)]
    pub event: EventName,
    /// Event-specific payload
    #[serde(default)]
    #[builder(default)]
    pub data: Value,
}

/// Balance change pushed by the server.
#[non_exhaustive]
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize, Builder)]
pub struct BalanceUpdate {
    /// Total balance after the change
    pub balance: Option<Decimal>,
    /// Balance not locked in open orders
    pub available: Option<Decimal>,
    /// Currency or asset code (e.g. `USDT`)
    pub currency: Option<String>,
    /// Human readable message to surface to the user
    pub message: Option<String>,
    #[serde(rename = "type", alias = "severity")]
    pub severity: Option<Severity>,
}

/// Trade status change pushed by the server.
#[non_exhaustive]
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize, Builder)]
pub struct TradeUpdate {
    /// Trade identifier
    #[builder(into)]
    pub id: Option<String>,
    /// Traded symbol (e.g. `BTCUSDT`)
    #[builder(into)]
    pub symbol: Option<String>,
    pub side: Option<String>,
    pub status: Option<String>,
    pub price: Option<Decimal>,
    pub quantity: Option<Decimal>,
    pub message: Option<String>,
    #[serde(rename = "type", alias = "severity")]
    pub severity: Option<Severity>,
}

/// Generic user notification.
#[non_exhaustive]
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize, Builder)]
pub struct Notification {
    pub title: Option<String>,
    #[builder(into)]
    pub message: Option<String>,
    #[serde(rename = "type", alias = "severity")]
    pub severity: Option<Severity>,
}

/// Severity of an alert handed to the UI alerting collaborator.
///
/// Unknown severities deserialize to [`Severity::Info`].
#[non_exhaustive]
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    strum_macros::Display,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Severity {
    Success,
    Error,
    #[default]
    Info,
    Warning,
}

impl Severity {
    /// Parse a severity, falling back to [`Severity::Info`] for anything unrecognised.
    #[must_use]
    pub fn from_lossy(value: &str) -> Self {
        if value.eq_ignore_ascii_case("success") {
            Self::Success
        } else if value.eq_ignore_ascii_case("error") {
            Self::Error
        } else if value.eq_ignore_ascii_case("warning") {
            Self::Warning
        } else {
            Self::Info
        }
    }
}

impl<'de> Deserialize<'de> for Severity {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let value = String::deserialize(deserializer)?;
        Ok(Self::from_lossy(&value))
    }
}

/// Payload of the locally published `connection-status` event.
#[non_exhaustive]
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Deserialize,
    Serialize,
    strum_macros::Display,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ConnectionStatus {
    /// A connect attempt is in flight
    Connecting,
    /// A session is live
    Connected,
    /// The session ended, or `disconnect()` was called
    Disconnected,
    /// A connect attempt failed; a retry may follow
    Error,
    /// The retry budget is exhausted; only an explicit `connect()` resumes
    Failed,
}

impl From<ConnectionStatus> for Value {
    fn from(status: ConnectionStatus) -> Self {
        Value::String(status.to_string())
    }
}

/// Parse a text frame into zero or more events.
///
/// Empty and whitespace-only frames are keep-alives and yield nothing. A JSON array carries
/// several events at once. Malformed JSON is a [`TransportError::MessageParse`].
pub fn parse_frames(bytes: &[u8]) -> crate::Result<Vec<InboundFrame>> {
    let trimmed = bytes
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .map_or(&[][..], |start| &bytes[start..]);

    if trimmed.is_empty() {
        return Ok(Vec::new());
    }

    let frames = if trimmed.first() == Some(&b'[') {
        serde_json::from_slice(trimmed)
    } else {
        serde_json::from_slice::<InboundFrame>(trimmed).map(|frame| vec![frame])
    };

    frames.map_err(|e| TransportError::MessageParse(e).into())
}
