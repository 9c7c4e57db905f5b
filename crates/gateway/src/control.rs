//! Control command routing: client event → single-float bus frame.
//!
//! The route table is built once from configuration. Each recognized event
//! name maps to `prefix + name` on the bus.

use crate::bus::Bus;
use crate::codec;
use crate::error::{GatewayError, Result};
use bytes::Bytes;
use metrics::counter;
use serde_json::Value;
use std::collections::HashMap;
use tracing::debug;

/// Subject prefix shared by all device subjects.
pub const DEFAULT_SUBJECT_PREFIX: &str = "aeropendulo.esp32.";

/// Control events the browser UI emits: manual velocity, PID gains, frequency.
pub const DEFAULT_CONTROL_EVENTS: [&str; 5] = ["vel_man", "Kp", "Ki", "Kd", "freq"];

/// A client-originated control command, already coerced.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ControlCommand<'a> {
    pub event: &'a str,
    pub value: f32,
}

/// Result of handling one client event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlOutcome {
    /// The command was published to this subject.
    Published { subject: String },
    /// The event name has no route.
    Ignored,
}

/// Coerce a client-supplied value to `f32`.
///
/// Accepts a JSON number or an object of the form `{"value": <number>}`.
pub fn coerce_value(value: &Value) -> Result<f32> {
    match value {
        Value::Number(n) => n
            .as_f64()
            .map(|v| v as f32)
            .ok_or_else(|| GatewayError::InvalidControlValue(n.to_string())),
        Value::Object(map) => match map.get("value") {
            Some(inner @ Value::Number(_)) => coerce_value(inner),
            Some(other) => Err(GatewayError::InvalidControlValue(other.to_string())),
            None => Err(GatewayError::InvalidControlValue(value.to_string())),
        },
        other => Err(GatewayError::InvalidControlValue(other.to_string())),
    }
}

/// Static event name → subject table plus the publish path.
#[derive(Debug, Clone)]
pub struct ControlPublisher {
    routes: HashMap<String, String>,
}

impl ControlPublisher {
    /// Build the route table. Names must be non-empty, unique and free of
    /// NATS subject separators or wildcards.
    pub fn new<I, S>(prefix: &str, events: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut routes = HashMap::new();
        for event in events {
            let event: String = event.into();
            if event.is_empty() || event.contains(['.', '*', '>', ' ']) {
                return Err(GatewayError::Config(format!(
                    "invalid control event name: {:?}",
                    event
                )));
            }
            let subject = format!("{}{}", prefix, event);
            if routes.insert(event.clone(), subject).is_some() {
                return Err(GatewayError::Config(format!(
                    "duplicate control event: {}",
                    event
                )));
            }
        }
        Ok(Self { routes })
    }

    /// Subject for an event, if recognized.
    pub fn subject_for(&self, event: &str) -> Option<&str> {
        self.routes.get(event).map(String::as_str)
    }

    /// Strict lookup.
    pub fn route(&self, event: &str) -> Result<&str> {
        self.subject_for(event)
            .ok_or_else(|| GatewayError::UnrecognizedControlEvent(event.to_string()))
    }

    /// Recognized event names (unordered).
    pub fn events(&self) -> impl Iterator<Item = &str> {
        self.routes.keys().map(String::as_str)
    }

    /// Look up an event for dispatch. Unrecognized names are logged at debug
    /// and counted, then ignored.
    pub fn recognize(&self, event: &str) -> Option<&str> {
        let subject = self.subject_for(event);
        if subject.is_none() {
            debug!("Ignoring unrecognized control event '{}'", event);
            counter!("gateway_unrecognized_events_total").increment(1);
        }
        subject
    }

    /// Handle one client event: look up, coerce, encode and publish.
    ///
    /// Unrecognized names are ignored without touching the bus. The value is
    /// only validated for recognized names.
    pub async fn dispatch<B: Bus>(&self, bus: &B, event: &str, value: &Value) -> Result<ControlOutcome> {
        match self.recognize(event) {
            Some(subject) => self.send(bus, event, subject, value).await,
            None => Ok(ControlOutcome::Ignored),
        }
    }

    /// Coerce and publish a recognized event to its subject.
    pub async fn send<B: Bus>(
        &self,
        bus: &B,
        event: &str,
        subject: &str,
        value: &Value,
    ) -> Result<ControlOutcome> {
        let command = ControlCommand {
            event,
            value: coerce_value(value)?,
        };
        self.publish(bus, subject, command).await?;

        Ok(ControlOutcome::Published {
            subject: subject.to_string(),
        })
    }

    async fn publish<B: Bus>(&self, bus: &B, subject: &str, command: ControlCommand<'_>) -> Result<()> {
        let payload = Bytes::copy_from_slice(&codec::encode(command.value));
        bus.publish(subject, payload).await?;

        debug!("Published {}={} to {}", command.event, command.value, subject);
        counter!("gateway_controls_published_total").increment(1);
        Ok(())
    }
}

impl Default for ControlPublisher {
    fn default() -> Self {
        let routes = DEFAULT_CONTROL_EVENTS
            .iter()
            .map(|e| (e.to_string(), format!("{}{}", DEFAULT_SUBJECT_PREFIX, e)))
            .collect();
        Self { routes }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::mock::MockBus;
    use serde_json::json;

    #[test]
    fn test_coerce_numbers() {
        assert_eq!(coerce_value(&json!(2.5)).unwrap(), 2.5);
        assert_eq!(coerce_value(&json!(3)).unwrap(), 3.0);
        assert_eq!(coerce_value(&json!(-7)).unwrap(), -7.0);
        assert_eq!(coerce_value(&json!({"value": 0.25})).unwrap(), 0.25);
    }

    #[test]
    fn test_coerce_rejects_non_numeric() {
        for value in [
            json!("2.5"),
            json!(true),
            json!(null),
            json!([1.0]),
            json!({"value": "fast"}),
            json!({"other": 1.0}),
        ] {
            assert!(
                matches!(coerce_value(&value), Err(GatewayError::InvalidControlValue(_))),
                "accepted {}",
                value
            );
        }
    }

    #[test]
    fn test_route_table() {
        let publisher = ControlPublisher::default();
        assert_eq!(publisher.subject_for("Kp"), Some("aeropendulo.esp32.Kp"));
        assert_eq!(publisher.subject_for("vel_man"), Some("aeropendulo.esp32.vel_man"));
        assert_eq!(publisher.subject_for("Tm"), None);
        assert!(matches!(
            publisher.route("Tm"),
            Err(GatewayError::UnrecognizedControlEvent(_))
        ));
        assert_eq!(publisher.events().count(), 5);
        assert_eq!(publisher.recognize("Kd"), Some("aeropendulo.esp32.Kd"));
        assert_eq!(publisher.recognize("Tm"), None);
    }

    #[test]
    fn test_route_table_validation() {
        assert!(ControlPublisher::new("p.", ["Kp", "Kp"]).is_err());
        assert!(ControlPublisher::new("p.", ["K.p"]).is_err());
        assert!(ControlPublisher::new("p.", [""]).is_err());
        assert!(ControlPublisher::new("p.", ["Kp", "Ki"]).is_ok());
    }

    #[tokio::test]
    async fn test_dispatch_publishes_one_frame() {
        let bus = MockBus::new();
        let publisher = ControlPublisher::default();

        let outcome = publisher.dispatch(&bus, "Kp", &json!(2.5)).await.unwrap();
        assert_eq!(
            outcome,
            ControlOutcome::Published {
                subject: "aeropendulo.esp32.Kp".to_string()
            }
        );

        let published = bus.published();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].0, "aeropendulo.esp32.Kp");
        assert_eq!(published[0].1[..], 2.5f32.to_le_bytes());
    }

    #[tokio::test]
    async fn test_dispatch_ignores_unknown_event() {
        let bus = MockBus::new();
        let publisher = ControlPublisher::default();

        let outcome = publisher.dispatch(&bus, "Tm_change", &json!(1)).await.unwrap();
        assert_eq!(outcome, ControlOutcome::Ignored);
        assert!(bus.published().is_empty());
    }

    #[tokio::test]
    async fn test_dispatch_invalid_value_does_not_publish() {
        let bus = MockBus::new();
        let publisher = ControlPublisher::default();

        let err = publisher.dispatch(&bus, "Ki", &json!("abc")).await.unwrap_err();
        assert!(matches!(err, GatewayError::InvalidControlValue(_)));
        assert!(bus.published().is_empty());
    }

    #[tokio::test]
    async fn test_dispatch_surfaces_bus_failure() {
        let bus = MockBus::new();
        bus.fail_publishes(true);
        let publisher = ControlPublisher::default();

        let err = publisher.dispatch(&bus, "Kd", &json!(0.1)).await.unwrap_err();
        assert!(matches!(err, GatewayError::BusUnavailable(_)));
    }
}
