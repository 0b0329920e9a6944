use std::sync::Arc;

use anyhow::{Context, Result};
use cast_signal::{
    ChannelHub, LoopbackTransport, MediaTransport, SessionRegistry, SignalingCoordinator,
    WebRtcEngine,
};
use clap::Parser;
use metrics_exporter_prometheus::PrometheusHandle;
use tokio::signal;
use tracing::{info, warn};

mod config;
mod livekit;
mod routes;
mod telemetry;
mod ws;

use config::{Cli, GatewayConfig, MediaEngineKind};
use livekit::{LiveKitClient, RoomService};
use routes::{build_router, AppState};

#[tokio::main]
async fn main() -> Result<()> {
    let config = GatewayConfig::try_from(Cli::parse())?;
    let telemetry = telemetry::Telemetry::install(config.otel_stdout)?;

    info!(
        listen_addr = %config.listen_addr,
        media_engine = ?config.media_engine,
        livekit_configured = config.livekit.is_some(),
        "starting cast gateway"
    );

    run(config, telemetry.metrics_handle()).await
}

async fn run(config: GatewayConfig, metrics: PrometheusHandle) -> Result<()> {
    let engine: Arc<dyn MediaTransport> = match config.media_engine {
        MediaEngineKind::Webrtc => Arc::new(
            WebRtcEngine::new(config.webrtc.clone()).context("failed to build webrtc engine")?,
        ),
        MediaEngineKind::Loopback => {
            warn!("loopback media engine selected; offers are answered without real media");
            Arc::new(LoopbackTransport::new())
        }
    };

    let rooms: Option<Arc<dyn RoomService>> = match &config.livekit {
        Some(settings) => {
            info!(host = %settings.host, "livekit room service enabled");
            Some(Arc::new(LiveKitClient::new(settings)))
        }
        None => {
            warn!("LIVEKIT_HOST, LIVEKIT_API_KEY or LIVEKIT_API_SECRET missing; room endpoints disabled");
            None
        }
    };

    let (hub, events) = ChannelHub::new();
    let registry = SessionRegistry::new();
    let coordinator = SignalingCoordinator::new(
        registry.clone(),
        engine,
        Arc::new(hub.clone()),
        config.coordinator.clone(),
    );
    let reaper_handle = coordinator.spawn_reaper();
    let coordinator_handle = tokio::spawn(coordinator.run(events));

    let state = Arc::new(AppState {
        hub,
        registry,
        rooms,
        metrics,
    });
    let router = build_router(state);

    let listener = tokio::net::TcpListener::bind(config.listen_addr)
        .await
        .context("failed to bind listener")?;
    info!("cast gateway listening on {}", config.listen_addr);

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server shutdown with error")?;

    info!(
        grace_seconds = config.shutdown_grace.as_secs(),
        "shutdown signal received; sleeping for graceful period"
    );
    if let Some(handle) = reaper_handle {
        handle.abort();
    }
    tokio::time::sleep(config.shutdown_grace).await;
    coordinator_handle.abort();
    info!("graceful shutdown complete");

    Ok(())
}

async fn shutdown_signal() {
    let _ = signal::ctrl_c().await;
}
