//! Axum Router Configuration
//!
//! This module defines the complete HTTP routing for the application: the
//! call-placement API, the TwiML callback, and the media-stream WebSocket
//! endpoint.

use crate::{handlers, state::AppState, ws::ws_handler};

use axum::{
    Router,
    routing::{any, get, post},
};
use std::sync::Arc;

/// Creates the main Axum router for the application.
pub fn create_router(app_state: Arc<AppState>) -> Router {
    Router::new()
        .route("/make-call", post(handlers::make_call))
        // Twilio may fetch call instructions with either GET or POST.
        .route("/connect", any(handlers::connect))
        .route("/media-stream", get(ws_handler))
        .route("/health", get(handlers::health))
        .with_state(app_state)
}
