use axum::{
    extract::{Query, State},
    http::StatusCode,
    routing::post,
    Json, Router,
};
use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;

use crate::api::state::AppState;
use crate::error::{AppError, Result};
use crate::models::UnverifyRecord;
use crate::services::revoker::{RevokeOutcome, RevokeRequest};

const DEFAULT_REASON: &str = "Self unverify";

#[derive(Debug, Deserialize)]
pub struct UnverifyBody {
    pub guild_id: i64,
    pub user_id: i64,
    /// Defaults to one day from now.
    pub end_time: Option<DateTime<Utc>>,
    /// Role and channel names, separated by `;`, `,`, spaces or newlines.
    pub keep: Option<String>,
    pub reason: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub guild_id: Option<i64>,
}

/// Splits a free-text allow-list into role or channel names
pub fn tokenize_keep(raw: &str) -> Vec<String> {
    raw.split(|c: char| matches!(c, ';' | ',' | ' ' | '\n' | '\r' | '\t'))
        .filter(|token| !token.is_empty())
        .map(str::to_string)
        .collect()
}

/// Unverify a member until the given end time
async fn create_unverify(
    State(state): State<AppState>,
    Json(body): Json<UnverifyBody>,
) -> Result<(StatusCode, Json<RevokeOutcome>)> {
    if body.guild_id <= 0 || body.user_id <= 0 {
        return Err(AppError::Validation(
            "guild_id and user_id must be positive ids".to_string(),
        ));
    }

    state.limiter.check(body.guild_id, body.user_id)?;

    let reason_lines = body
        .reason
        .filter(|lines| lines.iter().any(|line| !line.trim().is_empty()))
        .unwrap_or_else(|| vec![DEFAULT_REASON.to_string()]);

    let request = RevokeRequest {
        guild_id: body.guild_id,
        user_id: body.user_id,
        allow_list: body.keep.as_deref().map(tokenize_keep).unwrap_or_default(),
        end_time: body.end_time.unwrap_or_else(|| Utc::now() + Duration::days(1)),
        reason_lines,
    };

    let outcome = state.revoker.revoke(request).await?;

    Ok((StatusCode::CREATED, Json(outcome)))
}

/// List waiting records, optionally for one guild
async fn list_waiting(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> Result<Json<Vec<UnverifyRecord>>> {
    let records = state
        .store
        .get_waiting()
        .await?
        .into_iter()
        .filter(|r| query.guild_id.map_or(true, |g| r.guild_id == g))
        .collect();

    Ok(Json(records))
}

pub fn router() -> Router<AppState> {
    Router::new().route("/unverify", post(create_unverify).get(list_waiting))
}
