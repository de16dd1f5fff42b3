// Snapshots of guild state as reported by the guild gateway

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Role {
    pub id: i64,
    pub name: String,
    pub position: i32,
}

impl Role {
    /// The implicit role every member holds. Never removable.
    pub fn is_base(&self) -> bool {
        self.position == 0
    }
}

/// A channel as seen by one member.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelAccess {
    pub id: i64,
    pub name: String,
    pub is_category: bool,
    /// Effective read access after roles and overrides.
    pub can_read: bool,
    /// Read bit of the member's own override, `None` when unset.
    pub own_override: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberSnapshot {
    pub user_id: i64,
    pub display_name: String,
    pub role_ids: Vec<i64>,
}

impl MemberSnapshot {
    pub fn has_role(&self, role_id: i64) -> bool {
        self.role_ids.contains(&role_id)
    }
}
