//! WebSocket protocol message types.
//!
//! Every frame is a named event: `{"event": <name>, "data": <payload>}`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Event name for telemetry broadcasts.
pub const DEFAULT_STATE_EVENT: &str = "aeropendulo_state";

/// Event name for errors sent back to one client.
pub const ERROR_EVENT: &str = "error";

/// Application-level keepalive request.
pub const PING_EVENT: &str = "ping";

/// Application-level keepalive response.
pub const PONG_EVENT: &str = "pong";

// ============================================================================
// Client → Server
// ============================================================================

/// Named event sent from a client.
///
/// Control events carry a number (`{"event":"Kp","data":2.5}`) or an object
/// with a `value` field (`{"event":"Kp","data":{"value":2.5}}`).
#[derive(Debug, Clone, Deserialize)]
pub struct ClientEvent {
    /// Event name.
    pub event: String,
    /// Event payload.
    #[serde(default)]
    pub data: Value,
}

// ============================================================================
// Server → Client
// ============================================================================

/// Named event sent to clients.
#[derive(Debug, Clone, Serialize)]
pub struct ServerEvent<'a, T> {
    /// Event name.
    pub event: &'a str,
    /// Event payload.
    pub data: &'a T,
}

impl<'a, T: Serialize> ServerEvent<'a, T> {
    /// Create an event.
    pub fn new(event: &'a str, data: &'a T) -> Self {
        Self { event, data }
    }
}

/// Payload of an `error` event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorData {
    /// Human-readable message.
    pub message: String,
    /// Machine-readable code.
    pub code: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_scalar_control_event() {
        let event: ClientEvent = serde_json::from_str(r#"{"event":"Kp","data":2.5}"#).unwrap();
        assert_eq!(event.event, "Kp");
        assert_eq!(event.data.as_f64(), Some(2.5));
    }

    #[test]
    fn test_parse_wrapped_control_event() {
        let event: ClientEvent =
            serde_json::from_str(r#"{"event":"freq","data":{"value":10}}"#).unwrap();
        assert_eq!(event.event, "freq");
        assert_eq!(event.data["value"].as_i64(), Some(10));
    }

    #[test]
    fn test_parse_event_without_data() {
        let event: ClientEvent = serde_json::from_str(r#"{"event":"ping"}"#).unwrap();
        assert_eq!(event.event, PING_EVENT);
        assert!(event.data.is_null());
    }

    #[test]
    fn test_reject_missing_event_name() {
        assert!(serde_json::from_str::<ClientEvent>(r#"{"data":1}"#).is_err());
    }

    #[test]
    fn test_serialize_error_event() {
        let data = ErrorData {
            message: "Invalid control value: \"abc\"".to_string(),
            code: "INVALID_CONTROL_VALUE".to_string(),
        };
        let json = serde_json::to_value(ServerEvent::new(ERROR_EVENT, &data)).unwrap();
        assert_eq!(json["event"], "error");
        assert_eq!(json["data"]["code"], "INVALID_CONTROL_VALUE");
    }
}
