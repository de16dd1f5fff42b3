use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use thiserror::Error;

use crate::models::{ChannelAccess, MemberSnapshot, Role};

const READY_RETRY_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("Missing permissions for this change")]
    PermissionDenied,

    #[error("Entity not found")]
    NotFound,

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Guild API error: {status} - {message}")]
    Api { status: StatusCode, message: String },
}

/// Operations consumed from the group-membership service.
#[async_trait]
pub trait GuildGateway: Send + Sync {
    /// Cheap authenticated call used for readiness and health checks.
    async fn ping(&self) -> Result<(), GatewayError>;

    /// Blocks until the service answers `ping`.
    async fn wait_until_ready(&self) {
        loop {
            match self.ping().await {
                Ok(()) => return,
                Err(e) => {
                    tracing::info!(error = %e, "Guild gateway not ready yet, waiting");
                    tokio::time::sleep(READY_RETRY_INTERVAL).await;
                }
            }
        }
    }

    async fn guild_name(&self, guild_id: i64) -> Result<String, GatewayError>;

    /// `Ok(None)` when the user is not (or no longer) a member.
    async fn member(
        &self,
        guild_id: i64,
        user_id: i64,
    ) -> Result<Option<MemberSnapshot>, GatewayError>;

    async fn roles(&self, guild_id: i64) -> Result<Vec<Role>, GatewayError>;

    /// Every channel of the guild with read access computed for `user_id`.
    async fn channels(&self, guild_id: i64, user_id: i64)
        -> Result<Vec<ChannelAccess>, GatewayError>;

    async fn add_role(
        &self,
        guild_id: i64,
        user_id: i64,
        role_id: i64,
        reason: &str,
    ) -> Result<(), GatewayError>;

    async fn remove_role(
        &self,
        guild_id: i64,
        user_id: i64,
        role_id: i64,
        reason: &str,
    ) -> Result<(), GatewayError>;

    /// Sets the read bit of the member's override on a channel: `Some(true)`
    /// grants, `Some(false)` denies, `None` clears it. Other bits of an
    /// existing override are preserved.
    async fn set_read_override(
        &self,
        guild_id: i64,
        channel_id: i64,
        user_id: i64,
        read: Option<bool>,
        reason: &str,
    ) -> Result<(), GatewayError>;

    async fn send_direct_message(&self, user_id: i64, content: &str) -> Result<(), GatewayError>;
}

/// In-memory guild used by engine tests.
#[cfg(test)]
pub mod fake {
    use std::collections::{HashMap, HashSet};
    use std::sync::Mutex;

    use super::*;

    #[derive(Debug, Clone)]
    pub struct FakeChannel {
        pub id: i64,
        pub name: String,
        pub is_category: bool,
        pub everyone_read: bool,
        pub role_allow: HashSet<i64>,
        pub role_deny: HashSet<i64>,
    }

    #[derive(Debug, Default)]
    pub struct FakeState {
        pub guild_name: String,
        pub roles: Vec<Role>,
        pub channels: Vec<FakeChannel>,
        pub members: HashMap<i64, MemberSnapshot>,
        pub overrides: HashMap<(i64, i64), bool>,
        /// Roles the bot may not add or remove.
        pub protected_roles: HashSet<i64>,
        pub dm_fails: bool,
        pub ready: bool,
        pub sent_messages: Vec<(i64, String)>,
        pub role_writes: usize,
        pub override_writes: usize,
    }

    pub struct FakeGateway {
        pub guild_id: i64,
        pub state: Mutex<FakeState>,
    }

    impl FakeGateway {
        pub fn new(guild_id: i64, guild_name: &str) -> Self {
            let base = Role {
                id: guild_id,
                name: "@everyone".to_string(),
                position: 0,
            };
            Self {
                guild_id,
                state: Mutex::new(FakeState {
                    guild_name: guild_name.to_string(),
                    roles: vec![base],
                    ready: true,
                    ..FakeState::default()
                }),
            }
        }

        pub fn rename_base_role(&self, name: &str) {
            let mut state = self.state.lock().unwrap();
            state.roles[0].name = name.to_string();
        }

        pub fn add_guild_role(&self, id: i64, name: &str) {
            let mut state = self.state.lock().unwrap();
            let position = state.roles.len() as i32;
            state.roles.push(Role {
                id,
                name: name.to_string(),
                position,
            });
        }

        pub fn delete_guild_role(&self, id: i64) {
            self.state.lock().unwrap().roles.retain(|r| r.id != id);
        }

        pub fn add_channel(&self, id: i64, name: &str, everyone_read: bool, role_allow: &[i64]) {
            self.state.lock().unwrap().channels.push(FakeChannel {
                id,
                name: name.to_string(),
                is_category: false,
                everyone_read,
                role_allow: role_allow.iter().copied().collect(),
                role_deny: HashSet::new(),
            });
        }

        pub fn add_category(&self, id: i64, name: &str) {
            self.state.lock().unwrap().channels.push(FakeChannel {
                id,
                name: name.to_string(),
                is_category: true,
                everyone_read: true,
                role_allow: HashSet::new(),
                role_deny: HashSet::new(),
            });
        }

        /// Makes `role_id` deny read access on every non-category channel.
        pub fn deny_role_everywhere(&self, role_id: i64) {
            let mut state = self.state.lock().unwrap();
            for channel in state.channels.iter_mut().filter(|c| !c.is_category) {
                channel.role_deny.insert(role_id);
            }
        }

        pub fn delete_channel(&self, id: i64) {
            self.state.lock().unwrap().channels.retain(|c| c.id != id);
        }

        pub fn add_member(&self, user_id: i64, name: &str, role_ids: &[i64]) {
            let mut role_ids = role_ids.to_vec();
            if !role_ids.contains(&self.guild_id) {
                role_ids.insert(0, self.guild_id);
            }
            self.state.lock().unwrap().members.insert(
                user_id,
                MemberSnapshot {
                    user_id,
                    display_name: name.to_string(),
                    role_ids,
                },
            );
        }

        /// Sets the member's own read override on a channel.
        pub fn set_override(&self, channel_id: i64, user_id: i64, read: bool) {
            self.state
                .lock()
                .unwrap()
                .overrides
                .insert((channel_id, user_id), read);
        }

        pub fn remove_member(&self, user_id: i64) {
            self.state.lock().unwrap().members.remove(&user_id);
        }

        pub fn member_roles(&self, user_id: i64) -> Vec<i64> {
            let state = self.state.lock().unwrap();
            let mut roles = state.members[&user_id].role_ids.clone();
            roles.sort_unstable();
            roles
        }

        pub fn override_for(&self, channel_id: i64, user_id: i64) -> Option<bool> {
            self.state
                .lock()
                .unwrap()
                .overrides
                .get(&(channel_id, user_id))
                .copied()
        }

        pub fn can_read(&self, channel_id: i64, user_id: i64) -> bool {
            let state = self.state.lock().unwrap();
            let channel = state.channels.iter().find(|c| c.id == channel_id).unwrap();
            Self::readable(&state, channel, user_id)
        }

        fn readable(state: &FakeState, channel: &FakeChannel, user_id: i64) -> bool {
            let Some(member) = state.members.get(&user_id) else {
                return false;
            };
            let mut read = channel.everyone_read;
            if member.role_ids.iter().any(|r| channel.role_deny.contains(r)) {
                read = false;
            }
            if member.role_ids.iter().any(|r| channel.role_allow.contains(r)) {
                read = true;
            }
            if let Some(explicit) = state.overrides.get(&(channel.id, user_id)) {
                read = *explicit;
            }
            read
        }
    }

    #[async_trait]
    impl GuildGateway for FakeGateway {
        async fn ping(&self) -> Result<(), GatewayError> {
            if self.state.lock().unwrap().ready {
                Ok(())
            } else {
                Err(GatewayError::NotFound)
            }
        }

        async fn guild_name(&self, _guild_id: i64) -> Result<String, GatewayError> {
            Ok(self.state.lock().unwrap().guild_name.clone())
        }

        async fn member(
            &self,
            _guild_id: i64,
            user_id: i64,
        ) -> Result<Option<MemberSnapshot>, GatewayError> {
            Ok(self.state.lock().unwrap().members.get(&user_id).cloned())
        }

        async fn roles(&self, _guild_id: i64) -> Result<Vec<Role>, GatewayError> {
            Ok(self.state.lock().unwrap().roles.clone())
        }

        async fn channels(
            &self,
            _guild_id: i64,
            user_id: i64,
        ) -> Result<Vec<ChannelAccess>, GatewayError> {
            let state = self.state.lock().unwrap();
            Ok(state
                .channels
                .iter()
                .map(|c| ChannelAccess {
                    id: c.id,
                    name: c.name.clone(),
                    is_category: c.is_category,
                    can_read: Self::readable(&state, c, user_id),
                    own_override: state.overrides.get(&(c.id, user_id)).copied(),
                })
                .collect())
        }

        async fn add_role(
            &self,
            _guild_id: i64,
            user_id: i64,
            role_id: i64,
            _reason: &str,
        ) -> Result<(), GatewayError> {
            let mut state = self.state.lock().unwrap();
            if state.protected_roles.contains(&role_id) {
                return Err(GatewayError::PermissionDenied);
            }
            if !state.roles.iter().any(|r| r.id == role_id) {
                return Err(GatewayError::NotFound);
            }
            state.role_writes += 1;
            let member = state.members.get_mut(&user_id).ok_or(GatewayError::NotFound)?;
            if !member.role_ids.contains(&role_id) {
                member.role_ids.push(role_id);
            }
            Ok(())
        }

        async fn remove_role(
            &self,
            _guild_id: i64,
            user_id: i64,
            role_id: i64,
            _reason: &str,
        ) -> Result<(), GatewayError> {
            let mut state = self.state.lock().unwrap();
            if state.protected_roles.contains(&role_id) {
                return Err(GatewayError::PermissionDenied);
            }
            state.role_writes += 1;
            let member = state.members.get_mut(&user_id).ok_or(GatewayError::NotFound)?;
            member.role_ids.retain(|r| *r != role_id);
            Ok(())
        }

        async fn set_read_override(
            &self,
            _guild_id: i64,
            channel_id: i64,
            user_id: i64,
            read: Option<bool>,
            _reason: &str,
        ) -> Result<(), GatewayError> {
            let mut state = self.state.lock().unwrap();
            if !state.channels.iter().any(|c| c.id == channel_id) {
                return Err(GatewayError::NotFound);
            }
            state.override_writes += 1;
            match read {
                Some(value) => state.overrides.insert((channel_id, user_id), value),
                None => state.overrides.remove(&(channel_id, user_id)),
            };
            Ok(())
        }

        async fn send_direct_message(&self, user_id: i64, content: &str) -> Result<(), GatewayError> {
            let mut state = self.state.lock().unwrap();
            if state.dm_fails {
                return Err(GatewayError::PermissionDenied);
            }
            state.sent_messages.push((user_id, content.to_string()));
            Ok(())
        }
    }

    /// Base role "Member", a VIP role and the marker role; `general` is
    /// readable by everyone, `staff` only through VIP. The member holds VIP.
    pub mod scenario {
        use std::sync::Arc;

        use super::FakeGateway;
        use crate::config::EngineSettings;

        pub const GUILD: i64 = 1;
        pub const USER: i64 = 500;
        pub const VIP: i64 = 2;
        pub const MARKER: i64 = 3;
        pub const GENERAL: i64 = 10;
        pub const STAFF: i64 = 11;

        pub fn guild() -> Arc<FakeGateway> {
            let gateway = FakeGateway::new(GUILD, "Test Guild");
            gateway.rename_base_role("Member");
            gateway.add_guild_role(VIP, "VIP");
            gateway.add_guild_role(MARKER, "Unverified");
            gateway.add_channel(GENERAL, "general", true, &[]);
            gateway.add_channel(STAFF, "staff", false, &[VIP]);
            gateway.add_category(20, "Text");
            gateway.add_member(USER, "karel", &[VIP]);
            Arc::new(gateway)
        }

        pub fn settings() -> EngineSettings {
            EngineSettings {
                marker_role_ids: vec![99, MARKER],
                ..EngineSettings::default()
            }
        }
    }
}
