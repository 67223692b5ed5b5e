//! Confer Server Library
//!
//! This module exposes the server components for testing and embedding.

pub mod api;
pub mod engine;
pub mod error;
pub mod session;
pub mod signaling;
pub mod state;
pub mod ws;

use anyhow::Result;
use std::sync::Arc;

/// Start the media engine, create the default room and build the HTTP router
pub async fn create_app(config: state::Config) -> Result<(axum::Router, state::AppState)> {
    let engine = engine::MediaEngineAdapter::start(&config.media)?;
    let app_state = state::AppState::new(config, Arc::new(engine));

    app_state.registry.initialize().await;
    app_state
        .signaling
        .create_room(&app_state.config.default_room, None)
        .await;

    let router = api::create_router(app_state.clone());
    Ok((router, app_state))
}
