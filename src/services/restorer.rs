use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use crate::config::EngineSettings;
use crate::db::RecordStore;
use crate::error::{Target, UnverifyError, Warning};
use crate::models::{MemberSnapshot, UnverifyRecord};
use crate::services::gateway::{GatewayError, GuildGateway};

const AUDIT_REASON: &str = "Reverify";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RestoreOutcome {
    /// Access returned and the record marked finished.
    Restored { warnings: Vec<Warning> },
    /// Another task finished the record first.
    AlreadyFinished,
    /// The member is not in the guild; the record stays waiting.
    MemberGone,
    /// The member has been gone past the abandonment window; the record was
    /// marked finished without touching the guild.
    Abandoned,
}

/// Returns the access recorded in an unverify record.
pub struct Restorer {
    store: Arc<dyn RecordStore>,
    gateway: Arc<dyn GuildGateway>,
    settings: EngineSettings,
}

impl Restorer {
    pub fn new(
        store: Arc<dyn RecordStore>,
        gateway: Arc<dyn GuildGateway>,
        settings: EngineSettings,
    ) -> Self {
        Self {
            store,
            gateway,
            settings,
        }
    }

    /// Reverses `record`, optionally waiting `delay` first.
    ///
    /// Every side effect is best-effort and idempotent; the record is marked
    /// finished only after all of them were attempted, so an interrupted
    /// restoration is simply retried on a later tick.
    pub async fn restore(
        &self,
        record: &UnverifyRecord,
        delay: Option<Duration>,
    ) -> Result<RestoreOutcome, UnverifyError> {
        let mut member = self.lookup_member(record).await?;

        if let (Some(delay), Some(_)) = (delay, &member) {
            tokio::time::sleep(delay).await;
            member = self.lookup_member(record).await?;
        }

        let Some(member) = member else {
            return self.member_gone(record).await;
        };

        tracing::info!(
            record_id = %record.id,
            guild_id = record.guild_id,
            user_id = record.user_id,
            member = %member.display_name,
            "Reverifying member"
        );

        let mut warnings = Vec::new();
        let (guild_id, user_id) = (record.guild_id, record.user_id);

        let roles = self.gateway.roles(guild_id).await?;
        for role_id in &record.roles_to_return {
            if member.has_role(*role_id) {
                continue;
            }
            if !roles.iter().any(|r| r.id == *role_id) {
                warnings.push(Warning::entity_gone(Target::Role, *role_id));
                continue;
            }
            if let Err(e) = self
                .gateway
                .add_role(guild_id, user_id, *role_id, AUDIT_REASON)
                .await
            {
                warnings.push(Warning::from_gateway(Target::Role, *role_id, &e));
            }
        }

        let channels = self.gateway.channels(guild_id, user_id).await?;
        for channel_id in &record.channels_to_return {
            if !channels.iter().any(|c| c.id == *channel_id) {
                warnings.push(Warning::entity_gone(Target::Channel, *channel_id));
                continue;
            }
            let read = record.channels_to_allow.contains(channel_id).then_some(true);
            if let Err(e) = self
                .gateway
                .set_read_override(guild_id, *channel_id, user_id, read, AUDIT_REASON)
                .await
            {
                warnings.push(Warning::from_gateway(Target::Channel, *channel_id, &e));
            }
        }

        for marker_id in &self.settings.marker_role_ids {
            if !member.has_role(*marker_id) {
                continue;
            }
            if let Err(e) = self
                .gateway
                .remove_role(guild_id, user_id, *marker_id, AUDIT_REASON)
                .await
            {
                warnings.push(Warning::from_gateway(Target::Role, *marker_id, &e));
            }
        }

        if let Err(e) = self.notify(record).await {
            warnings.push(Warning::from_gateway(Target::Member, user_id, &e));
        }

        if !self.store.set_finished(record.id).await? {
            tracing::debug!(record_id = %record.id, "Record already finished by another task");
            return Ok(RestoreOutcome::AlreadyFinished);
        }

        tracing::info!(
            record_id = %record.id,
            warnings = warnings.len(),
            "Member reverified"
        );

        Ok(RestoreOutcome::Restored { warnings })
    }

    async fn lookup_member(
        &self,
        record: &UnverifyRecord,
    ) -> Result<Option<MemberSnapshot>, UnverifyError> {
        match self.gateway.member(record.guild_id, record.user_id).await {
            Ok(member) => Ok(member),
            Err(GatewayError::NotFound) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn member_gone(&self, record: &UnverifyRecord) -> Result<RestoreOutcome, UnverifyError> {
        if Utc::now() - record.end_time < self.settings.abandon_after {
            tracing::debug!(
                record_id = %record.id,
                user_id = record.user_id,
                "Member not in guild, will retry"
            );
            return Ok(RestoreOutcome::MemberGone);
        }

        if !self.store.set_finished(record.id).await? {
            return Ok(RestoreOutcome::AlreadyFinished);
        }

        tracing::warn!(
            record_id = %record.id,
            guild_id = record.guild_id,
            user_id = record.user_id,
            end_time = %record.end_time,
            "Member never returned, abandoning unverify record"
        );

        Ok(RestoreOutcome::Abandoned)
    }

    async fn notify(&self, record: &UnverifyRecord) -> Result<(), GatewayError> {
        let guild_name = self.gateway.guild_name(record.guild_id).await?;
        self.gateway
            .send_direct_message(
                record.user_id,
                &format!("Your access on {} has been returned.", guild_name),
            )
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MemoryRecordStore;
    use crate::models::UnverifyStatus;
    use crate::services::gateway::fake::{scenario::*, FakeGateway};
    use crate::services::revoker::{RevokeRequest, Revoker};
    use chrono::Duration as ChronoDuration;

    async fn revoked(
        gateway: &Arc<FakeGateway>,
        store: &Arc<MemoryRecordStore>,
    ) -> UnverifyRecord {
        let revoker = Revoker::new(store.clone(), gateway.clone(), settings());
        revoker
            .revoke(RevokeRequest {
                guild_id: GUILD,
                user_id: USER,
                allow_list: vec!["general".to_string()],
                end_time: Utc::now() + ChronoDuration::hours(1),
                reason_lines: vec!["Self unverify".to_string()],
            })
            .await
            .unwrap()
            .record
    }

    #[tokio::test(start_paused = true)]
    async fn test_restore_scenario() {
        let gateway = guild();
        let store = Arc::new(MemoryRecordStore::new());
        let record = revoked(&gateway, &store).await;
        let restorer = Restorer::new(store.clone(), gateway.clone(), settings());

        let outcome = restorer.restore(&record, None).await.unwrap();

        assert_eq!(outcome, RestoreOutcome::Restored { warnings: vec![] });
        assert_eq!(gateway.member_roles(USER), vec![GUILD, VIP]);
        assert_eq!(gateway.override_for(STAFF, USER), None);
        assert!(gateway.can_read(STAFF, USER));
        assert!(gateway.can_read(GENERAL, USER));
        assert_eq!(store.get(record.id).unwrap().status, UnverifyStatus::Finished);

        let sent = gateway.state.lock().unwrap().sent_messages.clone();
        assert_eq!(sent.last().unwrap().1, "Your access on Test Guild has been returned.");
    }

    #[tokio::test(start_paused = true)]
    async fn test_restore_twice_matches_restore_once() {
        let gateway = guild();
        let store = Arc::new(MemoryRecordStore::new());
        let record = revoked(&gateway, &store).await;
        let restorer = Restorer::new(store.clone(), gateway.clone(), settings());

        restorer.restore(&record, None).await.unwrap();
        let roles_once = gateway.member_roles(USER);
        let overrides_once = gateway.state.lock().unwrap().overrides.clone();

        // Simulates a crash after the side effects but before the next tick saw Finished
        let second = restorer.restore(&record, None).await.unwrap();

        assert_eq!(second, RestoreOutcome::AlreadyFinished);
        assert_eq!(gateway.member_roles(USER), roles_once);
        assert_eq!(gateway.state.lock().unwrap().overrides, overrides_once);
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_role_and_channel_are_skipped() {
        let gateway = guild();
        let store = Arc::new(MemoryRecordStore::new());
        let record = revoked(&gateway, &store).await;
        gateway.delete_guild_role(VIP);
        gateway.delete_channel(STAFF);
        let restorer = Restorer::new(store.clone(), gateway.clone(), settings());

        let outcome = restorer.restore(&record, None).await.unwrap();

        assert_eq!(
            outcome,
            RestoreOutcome::Restored {
                warnings: vec![
                    Warning::EntityGone { target: Target::Role, id: VIP },
                    Warning::EntityGone { target: Target::Channel, id: STAFF },
                ]
            }
        );
        assert_eq!(gateway.member_roles(USER), vec![GUILD]);
        assert_eq!(store.get(record.id).unwrap().status, UnverifyStatus::Finished);
    }

    #[tokio::test(start_paused = true)]
    async fn test_departed_member_keeps_record_waiting() {
        let gateway = guild();
        let store = Arc::new(MemoryRecordStore::new());
        let record = revoked(&gateway, &store).await;
        gateway.remove_member(USER);
        let restorer = Restorer::new(store.clone(), gateway.clone(), settings());

        let outcome = restorer.restore(&record, None).await.unwrap();

        assert_eq!(outcome, RestoreOutcome::MemberGone);
        assert_eq!(store.get(record.id).unwrap().status, UnverifyStatus::Waiting);
    }

    #[tokio::test(start_paused = true)]
    async fn test_long_departed_member_is_abandoned() {
        let gateway = guild();
        let store = Arc::new(MemoryRecordStore::new());
        let mut record = revoked(&gateway, &store).await;
        record.end_time = Utc::now() - ChronoDuration::days(31);
        gateway.remove_member(USER);
        let restorer = Restorer::new(store.clone(), gateway.clone(), settings());

        let outcome = restorer.restore(&record, None).await.unwrap();

        assert_eq!(outcome, RestoreOutcome::Abandoned);
        assert_eq!(store.get(record.id).unwrap().status, UnverifyStatus::Finished);
    }

    #[tokio::test(start_paused = true)]
    async fn test_notification_failure_still_finishes() {
        let gateway = guild();
        let store = Arc::new(MemoryRecordStore::new());
        let record = revoked(&gateway, &store).await;
        gateway.state.lock().unwrap().dm_fails = true;
        let restorer = Restorer::new(store.clone(), gateway.clone(), settings());

        let outcome = restorer.restore(&record, None).await.unwrap();

        assert_eq!(
            outcome,
            RestoreOutcome::Restored {
                warnings: vec![Warning::PermissionDenied { target: Target::Member, id: USER }]
            }
        );
        assert_eq!(store.get(record.id).unwrap().status, UnverifyStatus::Finished);
    }

    #[tokio::test(start_paused = true)]
    async fn test_own_allow_override_is_written_back() {
        const PRIVATE: i64 = 12;
        let gateway = guild();
        gateway.add_channel(PRIVATE, "private", false, &[]);
        gateway.set_override(PRIVATE, USER, true);
        let store = Arc::new(MemoryRecordStore::new());
        let record = revoked(&gateway, &store).await;

        assert_eq!(record.channels_to_allow, vec![PRIVATE]);
        assert!(!gateway.can_read(PRIVATE, USER));

        let restorer = Restorer::new(store.clone(), gateway.clone(), settings());
        restorer.restore(&record, None).await.unwrap();

        assert_eq!(gateway.override_for(PRIVATE, USER), Some(true));
        assert!(gateway.can_read(PRIVATE, USER));
        assert_eq!(gateway.override_for(STAFF, USER), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_member_is_read_again_after_delay() {
        let gateway = guild();
        let store = Arc::new(MemoryRecordStore::new());
        let record = revoked(&gateway, &store).await;
        let restorer = Restorer::new(store.clone(), gateway.clone(), settings());
        let role_writes = gateway.state.lock().unwrap().role_writes;

        let (outcome, _) = tokio::join!(
            restorer.restore(&record, Some(Duration::from_secs(7))),
            async {
                tokio::time::sleep(Duration::from_secs(1)).await;
                // A moderator hands the roles back by hand during the wait
                gateway.add_member(USER, "karel", &[VIP]);
            }
        );

        assert_eq!(outcome.unwrap(), RestoreOutcome::Restored { warnings: vec![] });
        assert_eq!(gateway.state.lock().unwrap().role_writes, role_writes);
        assert_eq!(gateway.member_roles(USER), vec![GUILD, VIP]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_member_leaving_during_delay_keeps_record_waiting() {
        let gateway = guild();
        let store = Arc::new(MemoryRecordStore::new());
        let record = revoked(&gateway, &store).await;
        let restorer = Restorer::new(store.clone(), gateway.clone(), settings());

        let (outcome, _) = tokio::join!(
            restorer.restore(&record, Some(Duration::from_secs(7))),
            async {
                tokio::time::sleep(Duration::from_secs(1)).await;
                gateway.remove_member(USER);
            }
        );

        assert_eq!(outcome.unwrap(), RestoreOutcome::MemberGone);
        assert_eq!(store.get(record.id).unwrap().status, UnverifyStatus::Waiting);
    }

    #[tokio::test(start_paused = true)]
    async fn test_delay_is_waited_before_side_effects() {
        let gateway = guild();
        let store = Arc::new(MemoryRecordStore::new());
        let record = revoked(&gateway, &store).await;
        let restorer = Restorer::new(store.clone(), gateway.clone(), settings());

        let started = tokio::time::Instant::now();
        restorer
            .restore(&record, Some(Duration::from_secs(7)))
            .await
            .unwrap();

        assert!(started.elapsed() >= Duration::from_secs(7));
        assert_eq!(gateway.member_roles(USER), vec![GUILD, VIP]);
    }
}
