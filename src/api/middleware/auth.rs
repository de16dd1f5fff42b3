use axum::{
    extract::{Request, State},
    http::header::AUTHORIZATION,
    middleware::Next,
    response::Response,
};
use secrecy::ExposeSecret;

use crate::api::state::AppState;
use crate::error::AppError;

/// Middleware that requires `Authorization: Bearer <api token>`
pub async fn require_token(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, AppError> {
    let authorized = request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .is_some_and(|token| token == state.api_token.expose_secret().as_str());

    if !authorized {
        tracing::debug!(path = %request.uri().path(), "Rejected request without valid token");
        return Err(AppError::Unauthorized);
    }

    Ok(next.run(request).await)
}
