use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

/// Lifecycle of a record: `Waiting` until the member's access is returned,
/// `Finished` afterwards. Never goes back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "unverify_status", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum UnverifyStatus {
    Waiting,
    Finished,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct UnverifyRecord {
    pub id: Uuid,
    pub guild_id: i64,
    pub user_id: i64,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub roles_to_return: Vec<i64>,
    pub channels_to_return: Vec<i64>, // denied at revocation, cleared at restoration
    pub channels_to_remove: Vec<i64>, // kept readable at revocation, audit only
    pub channels_to_allow: Vec<i64>,  // subset of channels_to_return with a prior member allow
    pub reason: String,
    pub status: UnverifyStatus,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct CreateUnverifyData {
    pub guild_id: i64,
    pub user_id: i64,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub roles_to_return: Vec<i64>,
    pub channels_to_return: Vec<i64>,
    pub channels_to_remove: Vec<i64>,
    pub channels_to_allow: Vec<i64>,
    pub reason: String,
}

impl UnverifyRecord {
    /// Creates a new waiting record
    pub async fn create(pool: &PgPool, data: CreateUnverifyData) -> Result<Self, sqlx::Error> {
        let record = sqlx::query_as::<_, Self>(
            r#"
            INSERT INTO unverify_records (
                guild_id, user_id, start_time, end_time,
                roles_to_return, channels_to_return, channels_to_remove,
                channels_to_allow, reason, status
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, 'waiting')
            RETURNING *
            "#,
        )
        .bind(data.guild_id)
        .bind(data.user_id)
        .bind(data.start_time)
        .bind(data.end_time)
        .bind(&data.roles_to_return)
        .bind(&data.channels_to_return)
        .bind(&data.channels_to_remove)
        .bind(&data.channels_to_allow)
        .bind(&data.reason)
        .fetch_one(pool)
        .await?;

        Ok(record)
    }

    /// Finds all records still waiting for restoration
    pub async fn find_waiting(pool: &PgPool) -> Result<Vec<Self>, sqlx::Error> {
        let records = sqlx::query_as::<_, Self>(
            r#"
            SELECT * FROM unverify_records
            WHERE status = 'waiting'
            ORDER BY end_time ASC
            "#,
        )
        .fetch_all(pool)
        .await?;

        Ok(records)
    }

    /// Finds all records whose access has been returned
    pub async fn find_finished(pool: &PgPool) -> Result<Vec<Self>, sqlx::Error> {
        let records = sqlx::query_as::<_, Self>(
            r#"
            SELECT * FROM unverify_records
            WHERE status = 'finished'
            ORDER BY end_time ASC
            "#,
        )
        .fetch_all(pool)
        .await?;

        Ok(records)
    }

    /// Finds the waiting record of a member, if any
    pub async fn find_waiting_for_member(
        pool: &PgPool,
        guild_id: i64,
        user_id: i64,
    ) -> Result<Option<Self>, sqlx::Error> {
        let record = sqlx::query_as::<_, Self>(
            r#"
            SELECT * FROM unverify_records
            WHERE guild_id = $1 AND user_id = $2 AND status = 'waiting'
            "#,
        )
        .bind(guild_id)
        .bind(user_id)
        .fetch_optional(pool)
        .await?;

        Ok(record)
    }

    /// Marks a record as finished
    ///
    /// Returns `true` only for the call that performed the transition.
    pub async fn set_finished(pool: &PgPool, id: Uuid) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            r#"
            UPDATE unverify_records
            SET status = 'finished'
            WHERE id = $1 AND status = 'waiting'
            "#,
        )
        .bind(id)
        .execute(pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    pub async fn delete(pool: &PgPool, id: Uuid) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            DELETE FROM unverify_records WHERE id = $1
            "#,
        )
        .bind(id)
        .execute(pool)
        .await?;

        Ok(())
    }

    /// Checks if the restoration time has passed
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.end_time <= now
    }

    /// Time left until the restoration is due, zero when overdue
    pub fn remaining(&self, now: DateTime<Utc>) -> std::time::Duration {
        (self.end_time - now).to_std().unwrap_or_default()
    }

    /// Checks if a finished record has outlived the retention window
    pub fn is_expired(&self, now: DateTime<Utc>, retention: chrono::Duration) -> bool {
        self.status == UnverifyStatus::Finished && now - self.end_time >= retention
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn record(end_time: DateTime<Utc>, status: UnverifyStatus) -> UnverifyRecord {
        UnverifyRecord {
            id: Uuid::new_v4(),
            guild_id: 1,
            user_id: 2,
            start_time: end_time - Duration::hours(1),
            end_time,
            roles_to_return: vec![],
            channels_to_return: vec![],
            channels_to_remove: vec![],
            channels_to_allow: vec![],
            reason: String::new(),
            status,
            created_at: end_time - Duration::hours(1),
        }
    }

    #[test]
    fn test_remaining_is_zero_when_overdue() {
        let now = Utc::now();
        let overdue = record(now - Duration::seconds(30), UnverifyStatus::Waiting);
        assert!(overdue.is_due(now));
        assert_eq!(overdue.remaining(now), std::time::Duration::ZERO);

        let pending = record(now + Duration::seconds(4), UnverifyStatus::Waiting);
        assert!(!pending.is_due(now));
        assert_eq!(pending.remaining(now), std::time::Duration::from_secs(4));
    }

    #[test]
    fn test_expiry_respects_retention_window() {
        let now = Utc::now();
        let retention = Duration::days(7);

        assert!(record(now - Duration::days(8), UnverifyStatus::Finished).is_expired(now, retention));
        assert!(!record(now - Duration::days(6), UnverifyStatus::Finished).is_expired(now, retention));
        // Waiting records are never garbage collected
        assert!(!record(now - Duration::days(30), UnverifyStatus::Waiting).is_expired(now, retention));
    }

    #[test]
    fn test_status_serializes_lowercase() {
        assert_eq!(
            serde_json::to_string(&UnverifyStatus::Waiting).unwrap(),
            "\"waiting\""
        );
    }
}
