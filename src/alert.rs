//! Alerting side channel.
//!
//! Some server events are also meant for a human: `balance-updated`, `trade-updated` and
//! `notification` payloads that carry a `message` are forwarded to an [`Alerter`] (a toast or
//! alert presenter) in addition to the regular handler dispatch.

use serde_json::Value;

use crate::types::{EventName, Severity};

/// Presents a short message to the user.
pub trait Alerter: Send + Sync + 'static {
    fn alert(&self, message: &str, severity: Severity);
}

impl<F> Alerter for F
where
    F: Fn(&str, Severity) + Send + Sync + 'static,
{
    fn alert(&self, message: &str, severity: Severity) {
        self(message, severity);
    }
}

/// Simplified alert extracted from an event payload.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Alert {
    pub message: String,
    pub severity: Severity,
}

impl Alert {
    /// Extract an alert from `payload` if `event` is alertable and the payload has a string
    /// `message`. Severity comes from `type` (or `severity`) and defaults to `info`.
    #[must_use]
    pub fn from_event(event: &EventName, payload: &Value) -> Option<Self> {
        if !event.is_alertable() {
            return None;
        }

        let message = payload.get("message")?.as_str()?;
        let severity = payload
            .get("type")
            .or_else(|| payload.get("severity"))
            .and_then(Value::as_str)
            .map(Severity::from_lossy)
            .unwrap_or_default();

        Some(Self {
            message: message.to_owned(),
            severity,
        })
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn notification_with_message_and_type() {
        let alert = Alert::from_event(
            &EventName::Notification,
            &json!({ "message": "Order filled", "type": "success" }),
        );

        assert_eq!(
            alert,
            Some(Alert {
                message: "Order filled".to_owned(),
                severity: Severity::Success,
            })
        );
    }

    #[test]
    fn severity_defaults_to_info() {
        let alert =
            Alert::from_event(&EventName::BalanceUpdated, &json!({ "message": "Deposit received" }))
                .unwrap();

        assert_eq!(alert.severity, Severity::Info);
    }

    #[test]
    fn payload_without_message_is_silent() {
        assert!(Alert::from_event(&EventName::TradeUpdated, &json!({ "id": "t-9" })).is_none());
        assert!(Alert::from_event(&EventName::Notification, &json!({ "message": 42 })).is_none());
    }

    #[test]
    fn other_events_never_alert() {
        let payload = json!({ "message": "hello" });

        assert!(Alert::from_event(&EventName::Custom("chat".to_owned()), &payload).is_none());
        assert!(Alert::from_event(&EventName::ConnectionStatus, &payload).is_none());
    }
}
