//! Gateway service entry point.
//!
//! Relays aeropendulum telemetry from NATS to WebSocket clients and control
//! events back to the device.

use anyhow::{bail, Result};
use gateway::ws_server::{CLIENT_IDLE_TIMEOUT, PING_INTERVAL};
use gateway::{create_router, AppState, ClientRegistry, GatewayConfig, Relay};
use metrics_exporter_prometheus::PrometheusBuilder;
use nats_client::{ConnectSettings, NatsClient};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables from .env file
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("Starting Gateway service");

    let config = GatewayConfig::from_env()?;

    info!("Configuration:");
    info!("  NATS_URL: {}", config.nats_url);
    info!("  HTTP_PORT: {}", config.http_port);
    info!("  METRICS_PORT: {}", config.metrics_port);
    info!("  TELEMETRY_SUBJECT: {}", config.relay.telemetry_subject);
    info!("  TELEMETRY_LAYOUT: {}", config.relay.layout.fields().join(","));
    info!("  CONTROL_EVENTS: {}", config.relay.control_events.join(","));
    info!("  BUS_RECONNECT_POLICY: {:?}", config.relay.reconnect);
    info!("  NATS reconnect limit: {:?}", config.bus_max_reconnects());

    PrometheusBuilder::new()
        .with_http_listener(([0, 0, 0, 0], config.metrics_port))
        .install()?;
    info!("Prometheus metrics server started on port {}", config.metrics_port);

    let registry = Arc::new(ClientRegistry::new());
    let relay = Arc::new(Relay::new(config.relay.clone(), registry.clone())?);

    // Without the bus the gateway has nothing to serve.
    let settings = ConnectSettings::new(&config.nats_url)
        .with_max_reconnects(config.bus_max_reconnects());
    relay.start(NatsClient::connect_with(&settings)).await?;

    let state = Arc::new(AppState {
        registry,
        relay: relay.clone(),
        client_buffer_size: config.client_buffer_size,
        send_timeout: config.client_send_timeout,
        compression_min_bytes: config.compression_min_bytes,
        ping_interval: PING_INTERVAL,
        idle_timeout: CLIENT_IDLE_TIMEOUT,
    });
    let app = create_router(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.http_port));
    let listener = TcpListener::bind(addr).await?;
    info!("Gateway listening on {}", addr);

    let signal_relay = relay.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            tokio::select! {
                _ = shutdown_signal() => {}
                _ = signal_relay.subscription_lost() => {
                    error!("Telemetry subscription lost, shutting down");
                }
            }
        })
        .await?;

    if let Err(e) = relay.shutdown().await {
        error!("Relay shutdown error: {}", e);
    }

    if relay.is_subscription_lost() {
        bail!("telemetry subscription lost");
    }

    info!("Gateway stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!("Failed to install signal handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C"),
        _ = terminate => info!("Received terminate signal"),
    }
}
