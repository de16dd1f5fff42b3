//! Permission diff: what to strip from a member and what to give back.
//!
//! The diff is computed from one snapshot of the guild taken before any
//! mutation. The channel override plan is evaluated separately, against a
//! listing taken once the role removal has propagated, so kept channels that
//! lost their role-based access get an explicit grant.

use std::collections::BTreeSet;

use serde::Serialize;

use crate::models::{ChannelAccess, MemberSnapshot, Role};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PermissionDiff {
    pub roles_to_keep: BTreeSet<i64>,
    pub roles_to_remove: BTreeSet<i64>,
    pub channels_to_keep: BTreeSet<i64>,
    /// Readable channels that get an explicit deny override.
    pub channels_to_remove: BTreeSet<i64>,
    /// Channels of `channels_to_remove` the member could read through their
    /// own allow override. Restoration writes that allow back.
    pub channels_to_allow: BTreeSet<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverrideChange {
    Grant(i64),
    Deny(i64),
}

impl OverrideChange {
    pub fn channel_id(&self) -> i64 {
        match self {
            OverrideChange::Grant(id) | OverrideChange::Deny(id) => *id,
        }
    }

    pub fn read(&self) -> bool {
        matches!(self, OverrideChange::Grant(_))
    }
}

/// Computes the diff for `member` given an allow-list of role or channel names.
///
/// Names matching neither a role nor a channel are ignored, as are category
/// names. The base role and the `marker_role_ids` are never removed.
pub fn compute(
    roles: &[Role],
    channels: &[ChannelAccess],
    member: &MemberSnapshot,
    allow_list: &[String],
    marker_role_ids: &[i64],
) -> PermissionDiff {
    let mut diff = PermissionDiff::default();

    for name in allow_list {
        let role = roles.iter().find(|r| &r.name == name);
        let channel = channels.iter().find(|c| !c.is_category && &c.name == name);

        match (role, channel) {
            (Some(role), _) if member.has_role(role.id) => {
                diff.roles_to_keep.insert(role.id);
            }
            (_, Some(channel)) if channel.can_read => {
                diff.channels_to_keep.insert(channel.id);
            }
            _ => {}
        }
    }

    let base_roles: BTreeSet<i64> = roles.iter().filter(|r| r.is_base()).map(|r| r.id).collect();

    diff.roles_to_remove = member
        .role_ids
        .iter()
        .copied()
        .filter(|id| {
            !diff.roles_to_keep.contains(id)
                && !base_roles.contains(id)
                && !marker_role_ids.contains(id)
        })
        .collect();

    diff.channels_to_remove = channels
        .iter()
        .filter(|c| !c.is_category && c.can_read && !diff.channels_to_keep.contains(&c.id))
        .map(|c| c.id)
        .collect();

    diff.channels_to_allow = channels
        .iter()
        .filter(|c| diff.channels_to_remove.contains(&c.id) && c.own_override == Some(true))
        .map(|c| c.id)
        .collect();

    diff
}

impl PermissionDiff {
    /// Override changes to apply on `channels`.
    ///
    /// Kept channels the member cannot read get a grant; channels marked for
    /// removal get a deny. Channels missing from the listing are skipped.
    pub fn overrides(&self, channels: &[ChannelAccess]) -> Vec<OverrideChange> {
        channels
            .iter()
            .filter(|c| !c.is_category)
            .filter_map(|c| {
                if self.channels_to_keep.contains(&c.id) {
                    (!c.can_read).then_some(OverrideChange::Grant(c.id))
                } else if self.channels_to_remove.contains(&c.id) {
                    Some(OverrideChange::Deny(c.id))
                } else {
                    None
                }
            })
            .collect()
    }
}
