pub mod routes;

use axum::{routing::get, Router};
use std::sync::Arc;
use tower_http::cors::CorsLayer;

use crate::influx::InfluxClient;

pub type SharedClient = Arc<InfluxClient>;

pub fn create_router(client: SharedClient) -> Router {
    Router::new()
        .route("/health", get(routes::health))
        .route("/coins/top", get(routes::get_top_coins))
        .route("/coins/:code", get(routes::get_coin))
        .route("/coins/:code/history", get(routes::get_coin_history))
        .route("/market/overview", get(routes::get_market_overview))
        .with_state(client)
        .layer(CorsLayer::permissive()) // dashboard SPA is served from another origin
}

pub async fn start_server(client: InfluxClient, port: u16) -> anyhow::Result<()> {
    let client = Arc::new(client);
    let app = create_router(client);

    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", port)).await?;

    tracing::info!("Server running on http://localhost:{}", port);
    axum::serve(listener, app).await?;

    Ok(())
}
