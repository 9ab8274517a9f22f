use axum::{
    routing::{get, post, put},
    Router,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::info;

use crate::chain::VersionChain;
use crate::compare::ComparisonCache;
use crate::config::ServerConfig;
use crate::error::{VaultError, VaultResult};
use crate::live::InMemoryLiveRegistry;

pub mod error;
pub mod routes;

#[derive(Clone)]
pub struct AppState {
    pub chain: Arc<VersionChain>,
    pub compare: Arc<ComparisonCache>,
    pub live: Arc<InMemoryLiveRegistry>,
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(routes::health))
        .route(
            "/plugins/:plugin_id/live",
            put(routes::put_live_state).get(routes::get_live_state),
        )
        .route("/plugins/:plugin_id/commits", post(routes::create_commit))
        .route("/plugins/:plugin_id/versions", get(routes::list_versions))
        .route(
            "/plugins/:plugin_id/versions/:version_id",
            get(routes::get_version),
        )
        .route(
            "/plugins/:plugin_id/versions/:version_id/state",
            get(routes::get_version_state),
        )
        .route(
            "/plugins/:plugin_id/versions/:version_id/restore",
            post(routes::restore_version),
        )
        .route(
            "/plugins/:plugin_id/versions/:version_id/publish",
            post(routes::publish_version).delete(routes::unpublish_version),
        )
        .route(
            "/plugins/:plugin_id/versions/:version_id/tags/:tag",
            put(routes::put_tag).delete(routes::delete_tag),
        )
        .route("/plugins/:plugin_id/tags", get(routes::list_tags))
        .route("/plugins/:plugin_id/compare", get(routes::compare_versions))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

pub async fn run_http_server(config: &ServerConfig, state: AppState) -> VaultResult<()> {
    let app = build_router(state);

    let addr: SocketAddr = format!("{}:{}", config.host, config.port)
        .parse()
        .map_err(|err| VaultError::ConfigError(format!("invalid server address: {err}")))?;

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|err| VaultError::Internal(format!("failed to bind server: {err}")))?;
    info!(%addr, "listening");

    axum::serve(listener, app)
        .await
        .map_err(|err| VaultError::Internal(format!("server error: {err}")))?;

    Ok(())
}
