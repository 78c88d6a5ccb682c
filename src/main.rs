mod config;
mod control;
mod error;
mod handlers;
mod instances;
mod mappers;
mod models;
mod router;
mod session;
mod transport;
mod utils;
mod ws;

use std::path::Path;
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use config::Config;
use control::ControlPlane;
use instances::InstanceRegistry;
use mappers::MapperRegistry;
use session::SessionManager;
use transport::SshTransportFactory;
use ws::Hub;

/// Application state shared across handlers
pub struct AppState {
    pub control: Arc<ControlPlane>,
    pub config: Config,
    pub ws_hub: Option<Arc<Hub>>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "vyos_forge=info,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let cfg = Config::load();
    tracing::info!("Starting VyOS Forge");
    tracing::info!("Listen: {}", cfg.listen_addr);
    tracing::info!(
        "Sessions: busy_policy={:?} connect={}s stage={}s commit={}s idle={}s",
        cfg.busy_policy,
        cfg.connect_timeout_secs,
        cfg.stage_timeout_secs,
        cfg.commit_timeout_secs,
        cfg.session_idle_timeout_secs
    );

    // Mapper registry is frozen before any request is served
    let mappers = Arc::new(MapperRegistry::vyos()?);
    let instances = Arc::new(InstanceRegistry::new(mappers.declared_versions().clone()));
    tracing::info!("Supported VyOS versions: {:?}", instances.supported_versions());

    // Initialize WebSocket hub
    let ws_hub = Arc::new(Hub::new());

    // Initialize session manager
    let factory = Arc::new(SshTransportFactory::new(
        cfg.connect_timeout_secs,
        cfg.stage_timeout_secs,
        cfg.commit_timeout_secs,
    ));
    let sessions = SessionManager::new(
        instances.clone(),
        factory,
        cfg.session_settings(),
        Some(ws_hub.clone()),
    );

    let control = ControlPlane::new(mappers, instances, sessions.clone(), Some(ws_hub.clone()));

    // Register seed instances
    if let Some(path) = &cfg.instances_file {
        if let Err(e) = control.load_seed(Path::new(path), cfg.ssh_default_port).await {
            tracing::warn!("Failed to load instance seed: {:#}", e);
        }
    }

    // Start idle session reaper
    let shutdown = CancellationToken::new();
    let reaper = sessions.spawn_idle_reaper(shutdown.clone());

    // Create app state
    let state = Arc::new(AppState {
        control,
        config: cfg.clone(),
        ws_hub: Some(ws_hub),
    });

    // Build router
    let app = router::build(state);

    // Start server
    let listener = tokio::net::TcpListener::bind(&cfg.listen_addr).await?;
    tracing::info!("VyOS Forge listening on {}", cfg.listen_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("VyOS Forge shutting down");
    shutdown.cancel();
    if let Some(handle) = reaper {
        let _ = handle.await;
    }
    sessions.close_all().await;
    Ok(())
}

/// WebSocket upgrade handler
pub async fn ws_upgrade_handler(
    ws: axum::extract::ws::WebSocketUpgrade,
    axum::extract::State(state): axum::extract::State<Arc<AppState>>,
) -> axum::response::Response {
    use axum::response::IntoResponse;

    if let Some(hub) = &state.ws_hub {
        ws::ws_handler(ws, axum::extract::State(hub.clone())).await
    } else {
        axum::http::StatusCode::SERVICE_UNAVAILABLE.into_response()
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
