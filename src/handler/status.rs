use std::sync::Arc;

use axum::{Json, Router, extract::State, routing::get};
use frame_bus::relay::{Relay, RelayStatus};

pub fn status_router() -> Router<Arc<Relay>> {
    Router::new().route("/status", get(status))
}

async fn status(State(relay): State<Arc<Relay>>) -> Json<RelayStatus> {
    Json(relay.status())
}
