//! Gateway configuration read from the environment.
//!
//! Every option has a default matching the aeropendulum rig, so an empty
//! environment yields a working configuration.

use crate::client::CLIENT_CHANNEL_BUFFER_SIZE;
use crate::control::{DEFAULT_CONTROL_EVENTS, DEFAULT_SUBJECT_PREFIX};
use crate::error::{GatewayError, Result};
use crate::protocol::DEFAULT_STATE_EVENT;
use crate::telemetry::{Layout, DEFAULT_LAYOUT};
use nats_client::client::DEFAULT_MAX_RECONNECTS;
use std::str::FromStr;
use std::time::Duration;

/// Default telemetry subject published by the device.
pub const DEFAULT_TELEMETRY_SUBJECT: &str = "aeropendulo.esp32.state";

/// Default NATS server.
pub const DEFAULT_NATS_URL: &str = "nats://demo.nats.io:4222";

/// What the telemetry loop does when its subscription ends unexpectedly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectPolicy {
    /// Stop and let an external supervisor restart the process.
    Exit,
    /// Re-subscribe in-process with exponential backoff. After `max_attempts`
    /// consecutive failures the relay falls back to [`ReconnectPolicy::Exit`].
    Resubscribe {
        initial_delay: Duration,
        max_delay: Duration,
        max_attempts: u32,
    },
}

/// Relay configuration (bus side and fan-out side).
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Subject carrying device state frames.
    pub telemetry_subject: String,
    /// Field layout of the state frame.
    pub layout: Layout,
    /// Event name used for telemetry broadcasts.
    pub state_event: String,
    /// Prefix prepended to control event names to form bus subjects.
    pub control_prefix: String,
    /// Recognized control event names.
    pub control_events: Vec<String>,
    /// Behaviour on subscription loss.
    pub reconnect: ReconnectPolicy,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            telemetry_subject: DEFAULT_TELEMETRY_SUBJECT.to_string(),
            layout: Layout::default(),
            state_event: DEFAULT_STATE_EVENT.to_string(),
            control_prefix: DEFAULT_SUBJECT_PREFIX.to_string(),
            control_events: DEFAULT_CONTROL_EVENTS.iter().map(|e| e.to_string()).collect(),
            reconnect: ReconnectPolicy::Exit,
        }
    }
}

/// Full process configuration.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// NATS server URL.
    pub nats_url: String,
    /// Transport-level reconnect attempts (`None` = unlimited).
    pub nats_max_reconnects: Option<usize>,
    /// HTTP/WebSocket port.
    pub http_port: u16,
    /// Prometheus exporter port.
    pub metrics_port: u16,
    /// Per-client outbound queue size.
    pub client_buffer_size: usize,
    /// Upper bound on a single socket write before the client is dropped.
    pub client_send_timeout: Duration,
    /// Minimum HTTP response size for gzip compression.
    pub compression_min_bytes: u16,
    /// Relay settings.
    pub relay: RelayConfig,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            nats_url: DEFAULT_NATS_URL.to_string(),
            nats_max_reconnects: Some(DEFAULT_MAX_RECONNECTS),
            http_port: 8002,
            metrics_port: 9093,
            client_buffer_size: CLIENT_CHANNEL_BUFFER_SIZE,
            client_send_timeout: Duration::from_millis(2000),
            compression_min_bytes: 1000,
            relay: RelayConfig::default(),
        }
    }
}

impl GatewayConfig {
    /// Read configuration from process environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read configuration through an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let nats_max_reconnects = match get("NATS_MAX_RECONNECTS") {
            None => defaults.nats_max_reconnects,
            Some(v) if v.eq_ignore_ascii_case("unlimited") => None,
            Some(v) => Some(parse("NATS_MAX_RECONNECTS", &v)?),
        };

        let layout = match get("TELEMETRY_LAYOUT") {
            Some(v) => Layout::new(split_list(&v))?,
            None => Layout::new(DEFAULT_LAYOUT)?,
        };

        let control_events = match get("CONTROL_EVENTS") {
            Some(v) => split_list(&v),
            None => defaults.relay.control_events,
        };

        let reconnect = match get("BUS_RECONNECT_POLICY").as_deref() {
            None | Some("exit") => ReconnectPolicy::Exit,
            Some("resubscribe") => ReconnectPolicy::Resubscribe {
                initial_delay: Duration::from_millis(parse_or(
                    &get,
                    "RESUBSCRIBE_INITIAL_DELAY_MS",
                    1000,
                )?),
                max_delay: Duration::from_millis(parse_or(&get, "RESUBSCRIBE_MAX_DELAY_MS", 30_000)?),
                max_attempts: parse_or(&get, "RESUBSCRIBE_MAX_ATTEMPTS", 10u32)?.max(1),
            },
            Some(other) => {
                return Err(GatewayError::Config(format!(
                    "BUS_RECONNECT_POLICY must be 'exit' or 'resubscribe', got '{}'",
                    other
                )))
            }
        };

        Ok(Self {
            nats_url: get("NATS_URL").unwrap_or(defaults.nats_url),
            nats_max_reconnects,
            http_port: parse_or(&get, "HTTP_PORT", defaults.http_port)?,
            metrics_port: parse_or(&get, "METRICS_PORT", defaults.metrics_port)?,
            client_buffer_size: parse_or(&get, "CLIENT_BUFFER_SIZE", defaults.client_buffer_size)?
                .max(1),
            client_send_timeout: Duration::from_millis(parse_or(
                &get,
                "CLIENT_SEND_TIMEOUT_MS",
                defaults.client_send_timeout.as_millis() as u64,
            )?),
            compression_min_bytes: parse_or(
                &get,
                "COMPRESSION_MIN_BYTES",
                defaults.compression_min_bytes,
            )?,
            relay: RelayConfig {
                telemetry_subject: get("TELEMETRY_SUBJECT")
                    .unwrap_or(defaults.relay.telemetry_subject),
                layout,
                state_event: get("STATE_EVENT").unwrap_or(defaults.relay.state_event),
                control_prefix: get("CONTROL_SUBJECT_PREFIX")
                    .unwrap_or(defaults.relay.control_prefix),
                control_events,
                reconnect,
            },
        })
    }

    /// Transport reconnect limit handed to the NATS client.
    ///
    /// A NATS client that exhausts its reconnects is closed for good, so
    /// under `resubscribe` the transport never gives up.
    pub fn bus_max_reconnects(&self) -> Option<usize> {
        match self.relay.reconnect {
            ReconnectPolicy::Exit => self.nats_max_reconnects,
            ReconnectPolicy::Resubscribe { .. } => None,
        }
    }
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

fn parse<T: FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| GatewayError::Config(format!("{} has an invalid value: '{}'", key, value)))
}

fn parse_or<T, G>(get: &G, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    G: Fn(&str) -> Option<String>,
{
    match get(key) {
        Some(v) => parse(key, &v),
        None => Ok(default),
    }
}
