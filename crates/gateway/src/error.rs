//! Gateway error types.

use thiserror::Error;

/// Gateway error type.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// Telemetry frame length does not match the configured layout.
    #[error("Malformed frame: expected {expected} bytes, got {actual}")]
    MalformedFrame { expected: usize, actual: usize },

    /// Control value could not be coerced to a 32-bit float.
    #[error("Invalid control value: {0}")]
    InvalidControlValue(String),

    /// Bus connection is down, not yet established, or rejected the operation.
    #[error("Bus unavailable: {0}")]
    BusUnavailable(String),

    /// Client event name has no registered control route.
    #[error("Unrecognized control event: {0}")]
    UnrecognizedControlEvent(String),

    /// Invalid static configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// The gateway already owns a bus connection.
    #[error("Gateway already started")]
    AlreadyStarted,

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Channel send error.
    #[error("Channel send error")]
    ChannelSend,
}

impl GatewayError {
    /// Short machine-readable code sent to clients in `error` events.
    pub fn code(&self) -> &'static str {
        match self {
            GatewayError::MalformedFrame { .. } => "MALFORMED_FRAME",
            GatewayError::InvalidControlValue(_) => "INVALID_CONTROL_VALUE",
            GatewayError::BusUnavailable(_) => "BUS_UNAVAILABLE",
            GatewayError::UnrecognizedControlEvent(_) => "UNRECOGNIZED_EVENT",
            GatewayError::Config(_) => "CONFIG_ERROR",
            GatewayError::AlreadyStarted => "ALREADY_STARTED",
            GatewayError::Json(_) => "INVALID_MESSAGE",
            GatewayError::ChannelSend => "CHANNEL_SEND",
        }
    }
}

impl From<tokio::sync::mpsc::error::TrySendError<axum::extract::ws::Message>> for GatewayError {
    fn from(_: tokio::sync::mpsc::error::TrySendError<axum::extract::ws::Message>) -> Self {
        GatewayError::ChannelSend
    }
}

/// Result type for gateway operations.
pub type Result<T> = std::result::Result<T, GatewayError>;
