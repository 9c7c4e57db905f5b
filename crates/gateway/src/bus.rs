//! Message bus seam.
//!
//! The relay is written against [`Bus`] / [`BusSubscription`] so the NATS
//! connection can be injected at startup. [`NatsClient`] is the production
//! implementation.

use crate::error::{GatewayError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use nats_client::{NatsClient, NatsSubscription};

/// Publish/subscribe connection owned by the gateway.
#[async_trait]
pub trait Bus: Send + Sync + 'static {
    /// Subscription handle returned by [`Bus::subscribe`].
    type Subscription: BusSubscription;

    /// Subscribe to a subject.
    async fn subscribe(&self, subject: &str) -> Result<Self::Subscription>;

    /// Publish a payload without waiting for an acknowledgment.
    async fn publish(&self, subject: &str, payload: Bytes) -> Result<()>;

    /// Flush pending publishes and close the connection.
    async fn drain(&self) -> Result<()>;
}

/// A live subscription.
#[async_trait]
pub trait BusSubscription: Send + 'static {
    /// Next message payload, or `None` once the subscription has closed.
    async fn next_message(&mut self) -> Option<Bytes>;

    /// Cancel the subscription. Cancelling an inactive subscription must not panic.
    async fn unsubscribe(&mut self) -> Result<()>;
}

fn unavailable(e: anyhow::Error) -> GatewayError {
    GatewayError::BusUnavailable(format!("{:#}", e))
}

#[async_trait]
impl Bus for NatsClient {
    type Subscription = NatsSubscription;

    async fn subscribe(&self, subject: &str) -> Result<NatsSubscription> {
        NatsClient::subscribe(self, subject).await.map_err(unavailable)
    }

    async fn publish(&self, subject: &str, payload: Bytes) -> Result<()> {
        NatsClient::publish(self, subject, payload)
            .await
            .map_err(unavailable)
    }

    async fn drain(&self) -> Result<()> {
        NatsClient::drain(self).await.map_err(unavailable)
    }
}

#[async_trait]
impl BusSubscription for NatsSubscription {
    async fn next_message(&mut self) -> Option<Bytes> {
        self.next_payload().await
    }

    async fn unsubscribe(&mut self) -> Result<()> {
        NatsSubscription::unsubscribe(self).await.map_err(unavailable)
    }
}

/// In-memory bus used by unit tests.
#[cfg(test)]
pub(crate) mod mock {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{Arc, Mutex};
    use tokio::sync::mpsc;

    #[derive(Default)]
    struct Inner {
        published: Mutex<Vec<(String, Bytes)>>,
        calls: Mutex<Vec<String>>,
        feeds: Mutex<Vec<mpsc::UnboundedSender<Bytes>>>,
        fail_publishes: AtomicBool,
        fail_subscribe: AtomicBool,
        fail_unsubscribe: AtomicBool,
    }

    /// Records publishes and lifecycle calls; feeds subscriptions by hand.
    #[derive(Clone, Default)]
    pub struct MockBus {
        inner: Arc<Inner>,
    }

    impl MockBus {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn published(&self) -> Vec<(String, Bytes)> {
            self.inner.published.lock().unwrap().clone()
        }

        /// Lifecycle calls in order ("subscribe:<subject>", "unsubscribe", "drain").
        pub fn calls(&self) -> Vec<String> {
            self.inner.calls.lock().unwrap().clone()
        }

        pub fn fail_publishes(&self, fail: bool) {
            self.inner.fail_publishes.store(fail, Ordering::SeqCst);
        }

        pub fn fail_subscribe(&self, fail: bool) {
            self.inner.fail_subscribe.store(fail, Ordering::SeqCst);
        }

        pub fn fail_unsubscribe(&self, fail: bool) {
            self.inner.fail_unsubscribe.store(fail, Ordering::SeqCst);
        }

        /// Deliver a payload to every live subscription.
        pub fn deliver(&self, payload: impl Into<Bytes>) {
            let payload = payload.into();
            let feeds = self.inner.feeds.lock().unwrap();
            for feed in feeds.iter() {
                let _ = feed.send(payload.clone());
            }
        }

        /// Close every live subscription as if the connection was lost.
        pub fn close_subscriptions(&self) {
            self.inner.feeds.lock().unwrap().clear();
        }

        /// Close every subscription and refuse new ones, like a NATS client
        /// that ran out of reconnect attempts.
        pub fn lose_connection(&self) {
            self.fail_subscribe(true);
            self.close_subscriptions();
        }

        /// Number of `subscribe` calls so far, failed ones included.
        pub fn subscribe_attempts(&self) -> usize {
            self.calls().iter().filter(|c| c.starts_with("subscribe:")).count()
        }

        pub fn subscription_count(&self) -> usize {
            self.inner.feeds.lock().unwrap().len()
        }

        fn record(&self, call: impl Into<String>) {
            self.inner.calls.lock().unwrap().push(call.into());
        }
    }

    pub struct MockSubscription {
        rx: mpsc::UnboundedReceiver<Bytes>,
        bus: MockBus,
    }

    #[async_trait]
    impl Bus for MockBus {
        type Subscription = MockSubscription;

        async fn subscribe(&self, subject: &str) -> Result<MockSubscription> {
            self.record(format!("subscribe:{}", subject));
            if self.inner.fail_subscribe.load(Ordering::SeqCst) {
                return Err(GatewayError::BusUnavailable("subscribe refused".to_string()));
            }
            let (tx, rx) = mpsc::unbounded_channel();
            self.inner.feeds.lock().unwrap().push(tx);
            Ok(MockSubscription {
                rx,
                bus: self.clone(),
            })
        }

        async fn publish(&self, subject: &str, payload: Bytes) -> Result<()> {
            if self.inner.fail_publishes.load(Ordering::SeqCst) {
                return Err(GatewayError::BusUnavailable("not connected".to_string()));
            }
            self.inner
                .published
                .lock()
                .unwrap()
                .push((subject.to_string(), payload));
            Ok(())
        }

        async fn drain(&self) -> Result<()> {
            self.record("drain");
            self.close_subscriptions();
            Ok(())
        }
    }

    #[async_trait]
    impl BusSubscription for MockSubscription {
        async fn next_message(&mut self) -> Option<Bytes> {
            self.rx.recv().await
        }

        async fn unsubscribe(&mut self) -> Result<()> {
            self.bus.record("unsubscribe");
            self.rx.close();
            if self.bus.inner.fail_unsubscribe.load(Ordering::SeqCst) {
                return Err(GatewayError::BusUnavailable(
                    "subscription already inactive".to_string(),
                ));
            }
            Ok(())
        }
    }
}
