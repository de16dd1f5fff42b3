use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::config::EngineSettings;
use crate::db::{RecordStore, StoreError};
use crate::error::{Target, UnverifyError, Warning};
use crate::models::{CreateUnverifyData, Role, UnverifyRecord};
use crate::services::gateway::{GatewayError, GuildGateway};
use crate::services::permission_diff::{self, OverrideChange, PermissionDiff};
use crate::services::reason;

const AUDIT_REASON: &str = "Self unverify";

#[derive(Debug, Clone)]
pub struct RevokeRequest {
    pub guild_id: i64,
    pub user_id: i64,
    /// Role or channel names the member keeps access to.
    pub allow_list: Vec<String>,
    pub end_time: DateTime<Utc>,
    pub reason_lines: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RevokeOutcome {
    pub record: UnverifyRecord,
    pub diff: PermissionDiff,
    pub warnings: Vec<Warning>,
}

/// Strips a member's access down to an allow-list and records what was taken.
pub struct Revoker {
    store: Arc<dyn RecordStore>,
    gateway: Arc<dyn GuildGateway>,
    settings: EngineSettings,
    pending: Arc<Mutex<HashSet<(i64, i64)>>>,
}

/// Holds a member's revoke slot until the revocation returns.
struct PendingGuard {
    pending: Arc<Mutex<HashSet<(i64, i64)>>>,
    key: (i64, i64),
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.key);
    }
}

/// Picks the first configured marker role that exists in the guild
pub fn resolve_marker_role<'a>(roles: &'a [Role], marker_role_ids: &[i64]) -> Option<&'a Role> {
    marker_role_ids
        .iter()
        .find_map(|id| roles.iter().find(|r| r.id == *id))
}

impl Revoker {
    pub fn new(
        store: Arc<dyn RecordStore>,
        gateway: Arc<dyn GuildGateway>,
        settings: EngineSettings,
    ) -> Self {
        Self {
            store,
            gateway,
            settings,
            pending: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Claims the member for this revocation; `None` if another one is running.
    fn reserve(&self, guild_id: i64, user_id: i64) -> Option<PendingGuard> {
        let key = (guild_id, user_id);
        let inserted = self
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key);

        inserted.then(|| PendingGuard {
            pending: self.pending.clone(),
            key,
        })
    }

    /// Revokes the member's access until `request.end_time`.
    ///
    /// Individual role or channel changes that fail are reported as warnings.
    /// Failing to add the marker role or to persist the record fails the
    /// whole operation.
    pub async fn revoke(&self, request: RevokeRequest) -> Result<RevokeOutcome, UnverifyError> {
        let RevokeRequest {
            guild_id,
            user_id,
            allow_list,
            end_time,
            reason_lines,
        } = request;

        let start_time = Utc::now();
        if end_time < start_time {
            return Err(UnverifyError::InvalidEndTime(end_time));
        }

        // Held until the record is persisted, so no second revocation reads
        // the member half-stripped
        let _pending = self
            .reserve(guild_id, user_id)
            .ok_or(UnverifyError::AlreadyUnverified { guild_id, user_id })?;

        let roles = self.gateway.roles(guild_id).await?;
        let marker = resolve_marker_role(&roles, &self.settings.marker_role_ids)
            .cloned()
            .ok_or(UnverifyError::Configuration(guild_id))?;

        if self.store.find_waiting(guild_id, user_id).await?.is_some() {
            return Err(UnverifyError::AlreadyUnverified { guild_id, user_id });
        }

        let member = self
            .gateway
            .member(guild_id, user_id)
            .await?
            .ok_or_else(|| UnverifyError::EntityGone(format!("Member {}", user_id)))?;
        let channels = self.gateway.channels(guild_id, user_id).await?;

        let diff = permission_diff::compute(
            &roles,
            &channels,
            &member,
            &allow_list,
            &self.settings.marker_role_ids,
        );

        tracing::info!(
            guild_id = guild_id,
            user_id = user_id,
            member = %member.display_name,
            until = %end_time,
            roles_to_remove = diff.roles_to_remove.len(),
            channels_to_remove = diff.channels_to_remove.len(),
            "Unverifying member"
        );

        let mut warnings = Vec::new();

        for role_id in &diff.roles_to_remove {
            if let Err(e) = self
                .gateway
                .remove_role(guild_id, user_id, *role_id, AUDIT_REASON)
                .await
            {
                warnings.push(Warning::from_gateway(Target::Role, *role_id, &e));
            }
        }

        if !member.has_role(marker.id) {
            self.gateway
                .add_role(guild_id, user_id, marker.id, AUDIT_REASON)
                .await
                .map_err(|e| match e {
                    GatewayError::PermissionDenied => UnverifyError::PermissionDenied(format!(
                        "cannot add marker role {} in guild {}",
                        marker.name, guild_id
                    )),
                    other => UnverifyError::Gateway(other),
                })?;
        }

        // Let the role change reach the permission cache before reading access again
        tokio::time::sleep(self.settings.grace_period).await;

        let current_channels = match self.gateway.channels(guild_id, user_id).await {
            Ok(current) => current,
            Err(e) => {
                tracing::warn!(
                    guild_id = guild_id,
                    user_id = user_id,
                    error = %e,
                    "Could not refresh channel access, using pre-revocation listing"
                );
                channels
            }
        };

        let plan = diff.overrides(&current_channels);
        for change in &plan {
            if let Err(e) = self
                .gateway
                .set_read_override(
                    guild_id,
                    change.channel_id(),
                    user_id,
                    Some(change.read()),
                    AUDIT_REASON,
                )
                .await
            {
                warnings.push(Warning::from_gateway(
                    Target::Channel,
                    change.channel_id(),
                    &e,
                ));
            }
        }

        let reason = reason::format_reason(&reason_lines);

        // Granted channels are cleared again on restore along with the denied ones
        let mut channels_to_return = diff.channels_to_remove.clone();
        channels_to_return.extend(plan.iter().filter_map(|change| match change {
            OverrideChange::Grant(id) => Some(*id),
            OverrideChange::Deny(_) => None,
        }));

        let record = self
            .store
            .create(CreateUnverifyData {
                guild_id,
                user_id,
                start_time,
                end_time,
                roles_to_return: diff.roles_to_remove.iter().copied().collect(),
                channels_to_return: channels_to_return.into_iter().collect(),
                channels_to_remove: diff.channels_to_keep.iter().copied().collect(),
                channels_to_allow: diff.channels_to_allow.iter().copied().collect(),
                reason,
            })
            .await
            .map_err(|e| {
                tracing::error!(
                    guild_id = guild_id,
                    user_id = user_id,
                    roles = ?diff.roles_to_remove,
                    channels = ?diff.channels_to_remove,
                    error = %e,
                    "Failed to persist unverify record"
                );
                match e {
                    StoreError::Duplicate { guild_id, user_id } => {
                        UnverifyError::AlreadyUnverified { guild_id, user_id }
                    }
                    other => UnverifyError::Store(other),
                }
            })?;

        self.notify(&record).await.unwrap_or_else(|e| {
            warnings.push(Warning::from_gateway(Target::Member, user_id, &e));
        });

        tracing::debug!(
            record_id = %record.id,
            guild_id = guild_id,
            user_id = user_id,
            warnings = warnings.len(),
            "Unverify succeeded"
        );

        Ok(RevokeOutcome {
            record,
            diff,
            warnings,
        })
    }

    async fn notify(&self, record: &UnverifyRecord) -> Result<(), GatewayError> {
        let guild_name = self.gateway.guild_name(record.guild_id).await?;
        let message = format!(
            "Your access on {} has been temporarily removed. It will be returned {}. Reason: {}",
            guild_name,
            record.end_time.format("%d.%m.%Y %H:%M:%S"),
            record.reason
        );
        self.gateway
            .send_direct_message(record.user_id, &message)
            .await
    }
}
