// API module - HTTP endpoints

pub mod health;
pub mod middleware;
pub mod state;
pub mod unverify;

use axum::{middleware::from_fn_with_state, routing::get, Router};

pub use state::AppState;

/// Builds the HTTP front-end. Everything but `/health` requires the bearer token.
pub fn router(state: AppState) -> Router {
    let protected = unverify::router().route_layer(from_fn_with_state(
        state.clone(),
        middleware::auth::require_token,
    ));

    Router::new()
        .route("/health", get(health::health_check))
        .merge(protected)
        .with_state(state)
}
