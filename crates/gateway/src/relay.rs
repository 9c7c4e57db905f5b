//! Telemetry relay: NATS ⇄ WebSocket.
//!
//! Owns the bus connection for the process lifetime. Device state frames on
//! the telemetry subject are decoded and broadcast to every connected client;
//! client control events are encoded and published back to the device.
//!
//! Lifecycle:
//!
//! ```text
//! Disconnected → Connecting → Subscribed → Draining → Disconnected
//! ```

use crate::bus::{Bus, BusSubscription};
use crate::client::ClientRegistry;
use crate::config::{ReconnectPolicy, RelayConfig};
use crate::control::{ControlOutcome, ControlPublisher};
use crate::error::{GatewayError, Result};
use crate::protocol::ServerEvent;
use crate::telemetry::{TelemetryDecoder, TelemetryRecord};
use metrics::counter;
use serde_json::Value;
use std::fmt::Display;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use tokio::sync::{mpsc, watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayState {
    Disconnected,
    Connecting,
    Subscribed,
    Draining,
}

/// Frame counters since startup.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayStats {
    pub frames_decoded: u64,
    pub malformed_frames: u64,
    pub records_broadcast: u64,
}

#[derive(Default)]
struct Counters {
    frames_decoded: AtomicU64,
    malformed_frames: AtomicU64,
    records_broadcast: AtomicU64,
}

/// Handle to the running telemetry task.
struct TelemetryTask {
    shutdown_tx: mpsc::Sender<()>,
    handle: JoinHandle<()>,
}

/// Bidirectional relay between the bus and real-time clients.
pub struct Relay<B: Bus> {
    config: RelayConfig,
    registry: Arc<ClientRegistry>,
    decoder: TelemetryDecoder,
    controls: ControlPublisher,
    /// Set once by `start`; never replaced.
    bus: OnceLock<Arc<B>>,
    state: watch::Sender<RelayState>,
    telemetry_task: Mutex<Option<TelemetryTask>>,
    subscription_lost: AtomicBool,
    lost_notify: Notify,
    counters: Counters,
}

impl<B: Bus> Relay<B> {
    /// Create a disconnected relay. Builds the control route table.
    pub fn new(config: RelayConfig, registry: Arc<ClientRegistry>) -> Result<Self> {
        let controls = ControlPublisher::new(&config.control_prefix, config.control_events.iter().cloned())?;
        let decoder = TelemetryDecoder::new(config.layout.clone());
        let (state, _) = watch::channel(RelayState::Disconnected);

        Ok(Self {
            config,
            registry,
            decoder,
            controls,
            bus: OnceLock::new(),
            state,
            telemetry_task: Mutex::new(None),
            subscription_lost: AtomicBool::new(false),
            lost_notify: Notify::new(),
            counters: Counters::default(),
        })
    }

    /// Current lifecycle state.
    pub fn state(&self) -> RelayState {
        *self.state.borrow()
    }

    /// Watch lifecycle transitions.
    pub fn watch_state(&self) -> watch::Receiver<RelayState> {
        self.state.subscribe()
    }

    /// Client registry used for broadcasts.
    pub fn registry(&self) -> &Arc<ClientRegistry> {
        &self.registry
    }

    /// Frame counters.
    pub fn stats(&self) -> RelayStats {
        RelayStats {
            frames_decoded: self.counters.frames_decoded.load(Ordering::Relaxed),
            malformed_frames: self.counters.malformed_frames.load(Ordering::Relaxed),
            records_broadcast: self.counters.records_broadcast.load(Ordering::Relaxed),
        }
    }

    fn set_state(&self, state: RelayState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            debug!("Relay state {:?} -> {:?}", previous, state);
        }
    }

    /// Move `from` → `to` only if nothing else changed the state meanwhile,
    /// so the telemetry task never overrides a shutdown in progress.
    fn transition(&self, from: RelayState, to: RelayState) -> bool {
        let changed = self.state.send_if_modified(|state| {
            if *state == from {
                *state = to;
                true
            } else {
                false
            }
        });
        if changed {
            debug!("Relay state {:?} -> {:?}", from, to);
        }
        changed
    }

    fn signal_subscription_lost(&self) {
        self.transition(RelayState::Connecting, RelayState::Disconnected);
        self.transition(RelayState::Subscribed, RelayState::Disconnected);
        self.subscription_lost.store(true, Ordering::SeqCst);
        self.lost_notify.notify_waiters();
    }

    fn ready_bus(&self) -> Option<&Arc<B>> {
        self.bus
            .get()
            .filter(|_| self.state() == RelayState::Subscribed)
    }

    /// Connect the bus and subscribe to the telemetry subject.
    ///
    /// Any failure here is fatal for the caller: the relay returns to
    /// `Disconnected` and reports `BusUnavailable`. A relay can own at most
    /// one connection; starting twice fails with `AlreadyStarted`.
    pub async fn start<Fut, E>(self: &Arc<Self>, connect: Fut) -> Result<()>
    where
        Fut: Future<Output = std::result::Result<B, E>>,
        E: Display,
    {
        let claimed = self.state.send_if_modified(|state| {
            if *state == RelayState::Disconnected && self.bus.get().is_none() {
                *state = RelayState::Connecting;
                true
            } else {
                false
            }
        });
        if !claimed {
            return Err(GatewayError::AlreadyStarted);
        }

        let bus = match connect.await {
            Ok(bus) => Arc::new(bus),
            Err(e) => {
                self.set_state(RelayState::Disconnected);
                return Err(GatewayError::BusUnavailable(e.to_string()));
            }
        };
        if self.bus.set(bus.clone()).is_err() {
            return Err(GatewayError::AlreadyStarted);
        }
        info!("Bus connected");

        let subject = &self.config.telemetry_subject;
        let subscription = match bus.subscribe(subject).await {
            Ok(s) => s,
            Err(e) => {
                error!("Failed to subscribe to '{}': {}", subject, e);
                if let Err(drain_err) = bus.drain().await {
                    warn!("Failed to drain bus after subscribe failure: {}", drain_err);
                }
                self.set_state(RelayState::Disconnected);
                return Err(e);
            }
        };

        // Subscribed before the task runs, so a loss it sees is never overwritten.
        self.set_state(RelayState::Subscribed);

        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        let handle = tokio::spawn(self.clone().run_telemetry(bus, subscription, shutdown_rx));
        *self
            .telemetry_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(TelemetryTask {
            shutdown_tx,
            handle,
        });

        info!(
            "Relay subscribed to '{}' ({} fields), broadcasting as '{}'",
            subject,
            self.decoder.layout().len(),
            self.config.state_event
        );
        Ok(())
    }

    /// Telemetry task: one message at a time, in bus delivery order.
    async fn run_telemetry(
        self: Arc<Self>,
        bus: Arc<B>,
        mut subscription: B::Subscription,
        mut shutdown_rx: mpsc::Receiver<()>,
    ) {
        let subject = self.config.telemetry_subject.clone();

        'session: loop {
            loop {
                tokio::select! {
                    biased;

                    _ = shutdown_rx.recv() => {
                        info!("Telemetry loop received shutdown signal");
                        break 'session;
                    }

                    msg = subscription.next_message() => {
                        match msg {
                            Some(payload) => self.handle_frame(&payload),
                            None => break,
                        }
                    }
                }
            }

            warn!("Telemetry subscription on '{}' ended unexpectedly", subject);
            counter!("gateway_subscription_lost_total").increment(1);

            let (initial_delay, max_delay, max_attempts) = match self.config.reconnect {
                ReconnectPolicy::Exit => {
                    self.signal_subscription_lost();
                    break 'session;
                }
                ReconnectPolicy::Resubscribe {
                    initial_delay,
                    max_delay,
                    max_attempts,
                } => (initial_delay, max_delay, max_attempts),
            };
            self.transition(RelayState::Subscribed, RelayState::Connecting);

            let mut delay = initial_delay;
            let mut attempts = 0;
            loop {
                tokio::select! {
                    biased;

                    _ = shutdown_rx.recv() => {
                        info!("Telemetry loop received shutdown signal while resubscribing");
                        break 'session;
                    }

                    _ = tokio::time::sleep(delay) => {}
                }

                attempts += 1;
                match bus.subscribe(&subject).await {
                    Ok(s) => {
                        info!("Resubscribed to '{}' after {} attempt(s)", subject, attempts);
                        subscription = s;
                        self.transition(RelayState::Connecting, RelayState::Subscribed);
                        continue 'session;
                    }
                    Err(e) if attempts >= max_attempts => {
                        error!(
                            "Giving up on '{}' after {} resubscribe attempts: {}",
                            subject, attempts, e
                        );
                        self.signal_subscription_lost();
                        break 'session;
                    }
                    Err(e) => {
                        warn!("Resubscribe to '{}' failed: {}, retrying in {:?}", subject, e, delay);
                        // Exponential backoff
                        delay = (delay * 2).min(max_delay);
                    }
                }
            }
        }

        if let Err(e) = subscription.unsubscribe().await {
            warn!("Unsubscribe from '{}' reported: {} (continuing)", subject, e);
        }
        info!("Telemetry loop stopped");
    }

    /// Decode one frame and broadcast it. Malformed frames are dropped.
    fn handle_frame(&self, payload: &[u8]) {
        match self.decoder.decode(payload) {
            Ok(record) => {
                self.counters.frames_decoded.fetch_add(1, Ordering::Relaxed);
                counter!("gateway_frames_decoded_total").increment(1);
                self.on_telemetry_record(&record);
            }
            Err(e) => {
                self.counters.malformed_frames.fetch_add(1, Ordering::Relaxed);
                counter!("gateway_malformed_frames_total").increment(1);
                error!(
                    "Dropping telemetry frame on '{}': {}",
                    self.config.telemetry_subject, e
                );
            }
        }
    }

    /// Broadcast a record to every connected client.
    /// Returns the number of clients it was queued for.
    pub fn on_telemetry_record(&self, record: &TelemetryRecord) -> usize {
        let delivered = self
            .registry
            .broadcast(&ServerEvent::new(&self.config.state_event, record));

        self.counters.records_broadcast.fetch_add(1, Ordering::Relaxed);
        counter!("gateway_records_broadcast_total").increment(1);
        delivered
    }

    /// Handle a control event from a client.
    ///
    /// Unrecognized names are ignored. Invalid values and bus failures are
    /// returned to the caller; nothing is retried.
    pub async fn on_client_event(&self, event: &str, value: &Value) -> Result<ControlOutcome> {
        let Some(subject) = self.controls.recognize(event) else {
            return Ok(ControlOutcome::Ignored);
        };

        let result = match self.ready_bus() {
            Some(bus) => self.controls.send(bus.as_ref(), event, subject, value).await,
            None => Err(GatewayError::BusUnavailable(format!(
                "relay is {:?}",
                self.state()
            ))),
        };

        if result.is_err() {
            counter!("gateway_control_errors_total").increment(1);
        }
        result
    }

    /// Whether the telemetry subscription was lost for good.
    pub fn is_subscription_lost(&self) -> bool {
        self.subscription_lost.load(Ordering::SeqCst)
    }

    /// Resolves once the telemetry subscription is lost for good: at once under
    /// [`ReconnectPolicy::Exit`], or when resubscribing runs out of attempts.
    pub async fn subscription_lost(&self) {
        loop {
            let notified = self.lost_notify.notified();
            if self.is_subscription_lost() {
                return;
            }
            notified.await;
        }
    }

    /// Cancel the telemetry subscription, then drain the bus.
    ///
    /// The drain runs even if the unsubscribe fails. Calling this again after
    /// it completed is a no-op.
    pub async fn shutdown(&self) -> Result<()> {
        let task = self
            .telemetry_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        let Some(bus) = self.bus.get().cloned() else {
            self.set_state(RelayState::Disconnected);
            return Ok(());
        };
        if task.is_none() && self.state() == RelayState::Disconnected {
            return Ok(());
        }

        info!("Shutting down relay");
        self.set_state(RelayState::Draining);

        if let Some(task) = task {
            // The task may already have exited after a lost subscription.
            let _ = task.shutdown_tx.send(()).await;
            if let Err(e) = task.handle.await {
                error!("Telemetry task failed: {}", e);
            }
        }

        let result = bus.drain().await;
        if let Err(e) = &result {
            error!("Failed to drain bus: {}", e);
        }

        self.set_state(RelayState::Disconnected);
        info!("Relay stopped");
        result
    }
}
