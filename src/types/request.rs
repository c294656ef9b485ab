use bon::Builder;
use serde::Serialize;
use serde_json::Value;

use super::EventName;

/// One outbound event frame: `{"event": <name>, "data": <payload>}`.
#[non_exhaustive]
#[derive(Clone, Debug, PartialEq, Serialize, Builder)]
pub struct OutboundFrame {
    /// Name of the event
    #[builder(into)]
    pub event: EventName,
    /// Event-specific payload
    #[builder(default)]
    pub data: Value,
}

impl OutboundFrame {
    #[must_use]
    pub fn new<E: Into<EventName>>(event: E, data: Value) -> Self {
        Self {
            event: event.into(),
            data,
        }
    }

    /// Ask the server to add this client to `room`.
    #[must_use]
    pub fn join_room(room: &str) -> Self {
        Self::new(EventName::JoinRoom, Value::String(room.to_owned()))
    }

    /// Ask the server to remove this client from `room`.
    #[must_use]
    pub fn leave_room(room: &str) -> Self {
        Self::new(EventName::LeaveRoom, Value::String(room.to_owned()))
    }

    pub fn to_json(&self) -> crate::Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}
