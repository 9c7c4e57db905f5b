//! NATS client implementation (core pub/sub only).

use anyhow::Result;
use async_nats::{Client, ConnectOptions, Subscriber};
use bytes::Bytes;
use futures::StreamExt;
use tracing::{debug, info, warn};

/// Default number of transport-level reconnect attempts before the client gives up.
pub const DEFAULT_MAX_RECONNECTS: usize = 60;

/// Settings used when opening the connection.
#[derive(Debug, Clone)]
pub struct ConnectSettings {
    /// Server URL (e.g., "nats://demo.nats.io:4222").
    pub url: String,
    /// Connection name reported to the server.
    pub name: String,
    /// Reconnect attempts after a lost connection. `None` retries forever.
    pub max_reconnects: Option<usize>,
}

impl ConnectSettings {
    /// Create settings for a URL with default reconnect behaviour.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            name: "aeropendulo-gateway".to_string(),
            max_reconnects: Some(DEFAULT_MAX_RECONNECTS),
        }
    }

    /// Set the reconnect limit.
    pub fn with_max_reconnects(mut self, max_reconnects: Option<usize>) -> Self {
        self.max_reconnects = max_reconnects;
        self
    }
}

/// Wrapper around the NATS core client.
#[derive(Clone)]
pub struct NatsClient {
    client: Client,
}

impl NatsClient {
    /// Connect to a NATS server.
    pub async fn connect_with(settings: &ConnectSettings) -> Result<Self> {
        info!("Connecting to NATS at {}", settings.url);
        let client = ConnectOptions::new()
            .name(&settings.name)
            .max_reconnects(settings.max_reconnects)
            .event_callback(|event| async move {
                match event {
                    async_nats::Event::Connected => info!("NATS connection event: {}", event),
                    _ => warn!("NATS connection event: {}", event),
                }
            })
            .connect(settings.url.as_str())
            .await?;

        Ok(Self { client })
    }

    /// Subscribe to a subject using NATS Core (low-latency push).
    pub async fn subscribe(&self, subject: &str) -> Result<NatsSubscription> {
        info!("Subscribing to subject: {}", subject);
        let subscriber = self.client.subscribe(subject.to_string()).await?;
        Ok(NatsSubscription::new(subject, subscriber))
    }

    /// Publish a message using NATS Core (fire-and-forget).
    pub async fn publish(&self, subject: &str, payload: Bytes) -> Result<()> {
        self.client.publish(subject.to_string(), payload).await?;
        Ok(())
    }

    /// Drain the connection: flush pending publishes and close.
    pub async fn drain(&self) -> Result<()> {
        info!("Draining NATS connection");
        self.client.drain().await?;
        Ok(())
    }
}

/// A single core subscription.
///
/// Unsubscribing twice is a no-op.
pub struct NatsSubscription {
    subject: String,
    subscriber: Subscriber,
    active: bool,
}

impl NatsSubscription {
    fn new(subject: &str, subscriber: Subscriber) -> Self {
        Self {
            subject: subject.to_string(),
            subscriber,
            active: true,
        }
    }

    /// Wait for the next message payload. `None` once the subscription closes.
    pub async fn next_payload(&mut self) -> Option<Bytes> {
        if !self.active {
            return None;
        }
        let msg = self.subscriber.next().await?;
        Some(msg.payload)
    }

    /// Cancel the subscription.
    pub async fn unsubscribe(&mut self) -> Result<()> {
        if !self.active {
            debug!("Subscription to {} already inactive", self.subject);
            return Ok(());
        }
        self.active = false;
        self.subscriber.unsubscribe().await?;
        info!("Unsubscribed from {}", self.subject);
        Ok(())
    }
}
