//! HTTP and WebSocket server using Axum.

use crate::bus::Bus;
use crate::client::{ClientRegistry, ClientState};
use crate::control::ControlOutcome;
use crate::error::{GatewayError, Result};
use crate::protocol::{ClientEvent, ErrorData, ServerEvent, ERROR_EVENT, PING_EVENT, PONG_EVENT};
use crate::relay::Relay;
use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::IntoResponse,
    routing::get,
    Router,
};
use futures::{Sink, SinkExt, Stream, StreamExt};
use metrics::{counter, gauge};
use std::fmt::Display;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{interval, timeout};
use tower_http::compression::{predicate::SizeAbove, CompressionLayer};
use tower_http::cors::CorsLayer;
use tracing::{debug, info, warn};

/// Interval between server-initiated keepalive pings.
pub const PING_INTERVAL: Duration = Duration::from_secs(30);

/// A client silent for this long (no ping or pong) is disconnected.
pub const CLIENT_IDLE_TIMEOUT: Duration = Duration::from_secs(90);

/// Shared application state.
pub struct AppState<B: Bus> {
    pub registry: Arc<ClientRegistry>,
    pub relay: Arc<Relay<B>>,
    /// Per-client outbound queue size.
    pub client_buffer_size: usize,
    /// Upper bound on one socket write.
    pub send_timeout: Duration,
    /// Minimum HTTP response size for gzip compression.
    pub compression_min_bytes: u16,
    pub ping_interval: Duration,
    pub idle_timeout: Duration,
}

/// Create the HTTP router.
///
/// Plain HTTP routes are gzip-compressed above the configured size; the
/// WebSocket route is kept out of the compression layer.
pub fn create_router<B: Bus>(state: Arc<AppState<B>>) -> Router {
    let http = Router::new()
        .route("/", get(health_handler))
        .layer(CompressionLayer::new().compress_when(SizeAbove::new(state.compression_min_bytes)));

    let ws = Router::new()
        .route("/ws", get(ws_handler::<B>))
        .with_state(state);

    http.merge(ws).layer(CorsLayer::permissive())
}

/// Health check handler.
async fn health_handler() -> &'static str {
    "ok"
}

/// WebSocket upgrade handler.
async fn ws_handler<B: Bus>(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState<B>>>,
) -> impl IntoResponse {
    ws.on_upgrade(|socket| handle_socket(socket, state))
}

/// Handle a WebSocket connection.
async fn handle_socket<B: Bus>(socket: WebSocket, state: Arc<AppState<B>>) {
    let (ws_tx, ws_rx) = socket.split();
    serve_client(ws_tx, ws_rx, state).await;
}

/// Drive one client from registration to unregistration.
async fn serve_client<B, S, R>(mut ws_tx: S, mut ws_rx: R, state: Arc<AppState<B>>)
where
    B: Bus,
    S: Sink<Message> + Send + Unpin + 'static,
    S::Error: Display + Send,
    R: Stream<Item = std::result::Result<Message, axum::Error>> + Unpin,
{
    let (tx, mut rx) = mpsc::channel::<Message>(state.client_buffer_size);

    let client = Arc::new(ClientState::new(tx));
    let client_id = state.registry.register(client.clone());

    counter!("gateway_connections_total").increment(1);
    gauge!("gateway_active_connections").set(state.registry.client_count() as f64);

    info!("Client {} connected", client_id);

    // Writer: forward queued messages; a write stuck past the timeout drops the client.
    let send_timeout = state.send_timeout;
    let mut send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            match timeout(send_timeout, ws_tx.send(msg)).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    debug!("Write to client {} failed: {}", client_id, e);
                    break;
                }
                Err(_) => {
                    warn!("Client {} write timed out after {:?}", client_id, send_timeout);
                    counter!("gateway_slow_client_disconnects_total").increment(1);
                    break;
                }
            }
        }
    });

    let mut ping_interval = interval(state.ping_interval);
    ping_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            biased;

            msg = ws_rx.next() => {
                match msg {
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(msg)) => {
                        if let Err(e) = handle_message(&state, &client, msg).await {
                            warn!("Error handling message from {}: {}", client_id, e);
                            send_error(&client, &e);
                        }
                    }
                    Some(Err(e)) => {
                        warn!("WebSocket error for {}: {:?}", client_id, e);
                        break;
                    }
                }
            }

            // Writer exited: socket is gone or too slow.
            _ = &mut send_task => break,

            _ = ping_interval.tick() => {
                if client.is_idle(state.idle_timeout) {
                    warn!("Client {} silent for over {:?}, disconnecting", client_id, state.idle_timeout);
                    counter!("gateway_idle_disconnects_total").increment(1);
                    break;
                }
                if !client.try_send_raw(Message::Ping(Vec::new().into())) {
                    debug!("Ping to {} not queued (buffer full)", client_id);
                }
            }
        }
    }

    state.registry.unregister(&client_id);
    send_task.abort();

    counter!("gateway_disconnections_total").increment(1);
    gauge!("gateway_active_connections").set(state.registry.client_count() as f64);

    info!(
        "Client {} disconnected after {:?}",
        client_id,
        client.session_duration()
    );
}

/// Report a per-message failure back to the originating client.
fn send_error(client: &ClientState, err: &GatewayError) {
    let data = ErrorData {
        message: err.to_string(),
        code: err.code().to_string(),
    };
    if let Err(e) = client.send(&ServerEvent::new(ERROR_EVENT, &data)) {
        debug!("Could not notify client {} of error: {}", client.id, e);
    }
}

/// Handle a single WebSocket message.
async fn handle_message<B: Bus>(
    state: &Arc<AppState<B>>,
    client: &Arc<ClientState>,
    msg: Message,
) -> Result<()> {
    match msg {
        Message::Text(text) => {
            let event: ClientEvent = serde_json::from_str(text.as_str())?;
            handle_client_event(state, client, event).await
        }
        Message::Binary(data) => {
            let event: ClientEvent = serde_json::from_slice(&data)?;
            handle_client_event(state, client, event).await
        }
        Message::Ping(_) | Message::Pong(_) => {
            // axum answers pings itself
            client.update_ping();
            Ok(())
        }
        Message::Close(_) => Ok(()),
    }
}

/// Handle a parsed client event.
async fn handle_client_event<B: Bus>(
    state: &Arc<AppState<B>>,
    client: &Arc<ClientState>,
    event: ClientEvent,
) -> Result<()> {
    if event.event == PING_EVENT {
        client.update_ping();
        return client.send(&ServerEvent::new(PONG_EVENT, &()));
    }

    match state.relay.on_client_event(&event.event, &event.data).await? {
        ControlOutcome::Published { subject } => {
            debug!("Client {} sent {} -> {}", client.id, event.event, subject);
        }
        ControlOutcome::Ignored => {}
    }
    Ok(())
}
