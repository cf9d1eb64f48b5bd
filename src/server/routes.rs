//! Router definition: one random route, everything else falls through to 404.

use axum::{routing::get, Router};

use super::{handlers, AppState};

/// Build the router for the session's single download route.
pub fn create_router(state: &AppState) -> Router {
    Router::new()
        .route(
            &format!("/{}", state.session.url_path()),
            get(handlers::download),
        )
        .with_state(state.clone())
}
