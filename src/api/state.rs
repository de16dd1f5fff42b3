use std::sync::Arc;

use secrecy::Secret;

use crate::api::middleware::rate_limit::RevokeRateLimiter;
use crate::db::RecordStore;
use crate::services::gateway::GuildGateway;
use crate::services::revoker::Revoker;

/// Shared handles for the HTTP front-end
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn RecordStore>,
    pub gateway: Arc<dyn GuildGateway>,
    pub revoker: Arc<Revoker>,
    pub limiter: Arc<RevokeRateLimiter>,
    pub api_token: Secret<String>,
}

