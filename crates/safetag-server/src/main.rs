mod config;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    Router,
    extract::{State, WebSocketUpgrade},
    response::IntoResponse,
    routing::get,
};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use safetag_api::state::{AppState, AppStateInner};
use safetag_api::sweeper;
use safetag_gateway::{GatewayContext, Rooms, connection};

use crate::config::Config;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "safetag=debug,tower_http=debug".into()),
        )
        .init();

    let config = Config::from_env()?;

    let db = safetag_db::Database::open(&config.db_path)?;
    let rooms = Rooms::new();
    let app_state: AppState =
        AppStateInner::new(db, rooms.clone(), config.jwt_secret.clone(), config.settings.clone())?;

    tokio::spawn(sweeper::run_sweeper(app_state.clone(), config.sweep_interval_secs));

    let ws_route = Router::new()
        .route("/gateway", get(ws_upgrade))
        .with_state(GatewayContext {
            rooms,
            db: app_state.db.clone(),
            jwt_secret: Arc::from(config.jwt_secret.as_str()),
        });

    let app = Router::new()
        .merge(safetag_api::router(app_state))
        .merge(ws_route)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http());

    info!("SafeTag server listening on {}", config.addr);
    if config.settings.google_client_id.is_none() {
        tracing::warn!("SAFETAG_GOOGLE_CLIENT_ID unset; Google tokens are accepted for any audience");
    }
    info!(
        "Tags valid {} days, sessions idle out after {}h, calls ring for {}s",
        config.settings.qr_validity_days,
        config.settings.session_idle_hours,
        config.settings.ring_timeout_secs
    );

    let listener = tokio::net::TcpListener::bind(config.addr).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    Ok(())
}

async fn ws_upgrade(
    State(ctx): State<GatewayContext>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| connection::handle_connection(socket, ctx))
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => info!("Received Ctrl+C, shutting down..."),
                    _ = sigterm.recv() => info!("Received SIGTERM, shutting down..."),
                }
            }
            Err(e) => {
                tracing::warn!("Could not install SIGTERM handler: {}", e);
                ctrl_c.await.ok();
                info!("Received Ctrl+C, shutting down...");
            }
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
        info!("Received Ctrl+C, shutting down...");
    }
}
