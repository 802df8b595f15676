mod errors;
pub mod handlers;

pub use errors::{AppError, ErrorResponse};

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use axum::Router;
use axum::routing::{get, post};
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::cli::ConductorConfig;
use crate::engine::Orchestrator;

/// Shared application state accessible by all handlers.
pub struct AppState {
    pub orchestrator: Orchestrator,
}

/// All control routes, without the server.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route(
            "/sessions",
            post(handlers::create_session).get(handlers::list_sessions),
        )
        .route("/sessions/{id}", get(handlers::get_session))
        .route("/sessions/{id}/pause", post(handlers::pause_session))
        .route("/sessions/{id}/resume", post(handlers::resume_session))
        .route("/sessions/{id}/interrupt", post(handlers::interrupt_session))
        .route("/sessions/{id}/abandon", post(handlers::abandon_session))
        .route("/sessions/{id}/modify", post(handlers::modify_session))
        .route("/sessions/{id}/versions", get(handlers::list_versions))
        .route("/sessions/{id}/diff", get(handlers::diff_versions))
        .route("/events", get(handlers::events))
        .route("/agents", get(handlers::list_agents))
        .route("/health", get(handlers::health))
        .with_state(state)
}

/// Start the HTTP control API and the bus ticker. Runs until Ctrl-C.
pub async fn serve(
    host: &str,
    port: u16,
    orchestrator: Orchestrator,
    config: &ConductorConfig,
) -> Result<()> {
    let ticker_cancel = CancellationToken::new();
    let ticker = crate::cli::start_ticker(&orchestrator, config, ticker_cancel.clone());
    let bus = orchestrator.bus().clone();

    let state = Arc::new(AppState { orchestrator });
    let app = router(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    let addr: SocketAddr = format!("{}:{}", host, port).parse()?;
    info!("Conductor API server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutting down");
            // Ends open event streams so the server can drain.
            bus.close();
        })
        .await?;

    ticker_cancel.cancel();
    let _ = ticker.await;
    Ok(())
}
