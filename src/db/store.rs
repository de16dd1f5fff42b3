//! Record store: the persistence seam for unverify records.
//!
//! The store is the single source of truth for pending restorations. Nothing
//! about pending work is cached in memory across restarts.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;
use chrono::Utc;
use sqlx::PgPool;
use thiserror::Error;
use uuid::Uuid;

use crate::models::{CreateUnverifyData, UnverifyRecord, UnverifyStatus};

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Member {user_id} already has a waiting record in guild {guild_id}")]
    Duplicate { guild_id: i64, user_id: i64 },
}

/// Single-record operations over the `unverify_records` table.
///
/// Every method is one atomic statement; records are independent, so no
/// multi-record transactions are needed.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Persist a new waiting record. The store assigns the id.
    async fn create(&self, data: CreateUnverifyData) -> Result<UnverifyRecord, StoreError>;

    async fn get_waiting(&self) -> Result<Vec<UnverifyRecord>, StoreError>;

    async fn get_finished(&self) -> Result<Vec<UnverifyRecord>, StoreError>;

    async fn find_waiting(
        &self,
        guild_id: i64,
        user_id: i64,
    ) -> Result<Option<UnverifyRecord>, StoreError>;

    /// Waiting -> Finished. Returns `true` only for the caller that performed
    /// the transition; later calls on the same record return `false`.
    async fn set_finished(&self, id: Uuid) -> Result<bool, StoreError>;

    async fn delete(&self, id: Uuid) -> Result<(), StoreError>;

    /// Connectivity check for the health endpoint.
    async fn ping(&self) -> Result<(), StoreError>;
}

/// PostgreSQL-backed store.
#[derive(Clone)]
pub struct PgRecordStore {
    pool: PgPool,
}

impl PgRecordStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl RecordStore for PgRecordStore {
    async fn create(&self, data: CreateUnverifyData) -> Result<UnverifyRecord, StoreError> {
        let (guild_id, user_id) = (data.guild_id, data.user_id);

        UnverifyRecord::create(&self.pool, data)
            .await
            .map_err(|e| match e {
                sqlx::Error::Database(ref db) if db.is_unique_violation() => {
                    StoreError::Duplicate { guild_id, user_id }
                }
                other => StoreError::Database(other),
            })
    }

    async fn get_waiting(&self) -> Result<Vec<UnverifyRecord>, StoreError> {
        Ok(UnverifyRecord::find_waiting(&self.pool).await?)
    }

    async fn get_finished(&self) -> Result<Vec<UnverifyRecord>, StoreError> {
        Ok(UnverifyRecord::find_finished(&self.pool).await?)
    }

    async fn find_waiting(
        &self,
        guild_id: i64,
        user_id: i64,
    ) -> Result<Option<UnverifyRecord>, StoreError> {
        Ok(UnverifyRecord::find_waiting_for_member(&self.pool, guild_id, user_id).await?)
    }

    async fn set_finished(&self, id: Uuid) -> Result<bool, StoreError> {
        Ok(UnverifyRecord::set_finished(&self.pool, id).await?)
    }

    async fn delete(&self, id: Uuid) -> Result<(), StoreError> {
        Ok(UnverifyRecord::delete(&self.pool, id).await?)
    }

    async fn ping(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

/// In-memory store with the same semantics as [`PgRecordStore`].
///
/// Used by tests; all data is lost when dropped.
#[derive(Default)]
pub struct MemoryRecordStore {
    records: RwLock<HashMap<Uuid, UnverifyRecord>>,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a record as-is, bypassing the waiting-uniqueness check.
    pub fn insert(&self, record: UnverifyRecord) {
        self.records
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(record.id, record);
    }

    pub fn get(&self, id: Uuid) -> Option<UnverifyRecord> {
        self.records
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.records.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn with_status(&self, status: UnverifyStatus) -> Vec<UnverifyRecord> {
        let records = self.records.read().unwrap_or_else(PoisonError::into_inner);
        let mut matching: Vec<_> = records
            .values()
            .filter(|r| r.status == status)
            .cloned()
            .collect();
        matching.sort_by_key(|r| r.end_time);
        matching
    }
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    async fn create(&self, data: CreateUnverifyData) -> Result<UnverifyRecord, StoreError> {
        let mut records = self.records.write().unwrap_or_else(PoisonError::into_inner);

        let duplicate = records.values().any(|r| {
            r.status == UnverifyStatus::Waiting
                && r.guild_id == data.guild_id
                && r.user_id == data.user_id
        });
        if duplicate {
            return Err(StoreError::Duplicate {
                guild_id: data.guild_id,
                user_id: data.user_id,
            });
        }

        let record = UnverifyRecord {
            id: Uuid::new_v4(),
            guild_id: data.guild_id,
            user_id: data.user_id,
            start_time: data.start_time,
            end_time: data.end_time,
            roles_to_return: data.roles_to_return,
            channels_to_return: data.channels_to_return,
            channels_to_remove: data.channels_to_remove,
            channels_to_allow: data.channels_to_allow,
            reason: data.reason,
            status: UnverifyStatus::Waiting,
            created_at: Utc::now(),
        };
        records.insert(record.id, record.clone());

        Ok(record)
    }

    async fn get_waiting(&self) -> Result<Vec<UnverifyRecord>, StoreError> {
        Ok(self.with_status(UnverifyStatus::Waiting))
    }

    async fn get_finished(&self) -> Result<Vec<UnverifyRecord>, StoreError> {
        Ok(self.with_status(UnverifyStatus::Finished))
    }

    async fn find_waiting(
        &self,
        guild_id: i64,
        user_id: i64,
    ) -> Result<Option<UnverifyRecord>, StoreError> {
        let records = self.records.read().unwrap_or_else(PoisonError::into_inner);
        Ok(records
            .values()
            .find(|r| {
                r.status == UnverifyStatus::Waiting && r.guild_id == guild_id && r.user_id == user_id
            })
            .cloned())
    }

    async fn set_finished(&self, id: Uuid) -> Result<bool, StoreError> {
        let mut records = self.records.write().unwrap_or_else(PoisonError::into_inner);
        match records.get_mut(&id) {
            Some(record) if record.status == UnverifyStatus::Waiting => {
                record.status = UnverifyStatus::Finished;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn delete(&self, id: Uuid) -> Result<(), StoreError> {
        self.records
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id);
        Ok(())
    }

    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }
}
