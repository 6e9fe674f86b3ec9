//! HTTP surface of the relay.

pub mod api;
pub mod state;

use std::sync::Arc;

use axum::routing::get;
use axum::Router;
use log::info;

use state::AppState;

/// Build the router and serve it on `listen_addr`. Returns an error when
/// the listener cannot bind.
pub async fn start_web_server(
    listen_addr: &str,
    state: Arc<AppState>,
) -> Result<(), Box<dyn std::error::Error>> {
    let app = Router::new()
        .route("/ch/:name", get(api::stream_channel))
        .route("/rtp/:name/:dest", get(api::relay_rtp))
        .route("/channels.m3u", get(api::playlist))
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(listen_addr).await?;
    info!("HTTP server listening on http://{listen_addr}");
    axum::serve(listener, app).await?;

    Ok(())
}
