use std::sync::Arc;

use axum::{Router, routing::get};
use frame_bus::relay::Relay;
use tokio::{net::TcpListener, task::JoinHandle};
use tokio_util::sync::CancellationToken;

use crate::config::config;

pub(crate) fn app_router(relay: Arc<Relay>) -> Router {
    Router::new()
        .route(&config().ws_path, get(crate::handler::frame_ws::frame_ws))
        .merge(crate::handler::status::status_router())
        .with_state(relay)
}

pub(crate) fn start_api_server(cancel: CancellationToken, relay: Arc<Relay>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let app = app_router(relay);
        let listen = &config().listen;

        let listener = match TcpListener::bind(listen).await {
            Ok(listener) => listener,
            Err(e) => {
                log::error!("failed to bind {}: {}", listen, e);
                cancel.cancel();
                return;
            }
        };
        log::info!(
            "frame channel listening on ws://{}{}",
            listen,
            config().ws_path
        );
        if let Err(e) = axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal(cancel.clone()))
            .await
        {
            log::error!("API server error: {}", e);
            cancel.cancel();
        }
    })
}

async fn shutdown_signal(cancel: CancellationToken) {
    cancel.cancelled().await;
    log::info!("shutting down API server...");
}
