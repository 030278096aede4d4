//! Gateway service entry point.

use anyhow::{Context, Result};
use external_services::{open_trade_store, PaymentProcessorClient};
use gateway::{create_router, AuditLog, GatewayConfig, GatewayServer, NatsBackend};
use metrics_exporter_prometheus::PrometheusBuilder;
use nats_client::NatsClient;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables from .env file
    dotenvy::dotenv().ok();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = match GatewayConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("{}", e);
            return Err(e.into());
        }
    };
    info!("Starting gateway {}", config.instance);

    if let Some(port) = config.metrics_port {
        PrometheusBuilder::new()
            .with_http_listener(([0, 0, 0, 0], port))
            .install()
            .context("failed to start Prometheus exporter")?;
        info!("Prometheus metrics server started on port {}", port);
    }

    let audit = AuditLog::open(&config.audit_log_path, &config.instance)?;
    let store = open_trade_store(&config.storage_url)?;
    let issuer = Arc::new(PaymentProcessorClient::new(
        config.payment_processor_url.clone(),
        config.payment_timeout,
    )?);

    let nats = NatsClient::connect(&config.nats_url)
        .await?
        .with_request_timeout(config.backend_timeout);
    let backend = Arc::new(NatsBackend::new(
        nats,
        config.backend_request_subject.clone(),
        config.backend_publish_subject.clone(),
    ));

    let http_port = config.http_port;
    let server = GatewayServer::start(config, audit, backend, store, issuer).await?;
    let app = create_router(server.context());

    let addr = SocketAddr::from(([0, 0, 0, 0], http_port));
    let listener = TcpListener::bind(addr).await?;
    info!("Gateway listening on {}", addr);

    let served = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal(server.context()))
    .await;
    if let Err(e) = &served {
        warn!("HTTP server error: {}", e);
    }

    info!("Shutting down sessions...");
    server.shutdown().await;

    info!("Gateway stopped");
    served.map_err(Into::into)
}

/// Waits for Ctrl+C or SIGTERM, then asks every session to close so that
/// open WebSocket connections do not hold graceful shutdown open.
async fn shutdown_signal(ctx: Arc<gateway::GatewayContext>) {
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

    ctx.registry.close_all();
}
