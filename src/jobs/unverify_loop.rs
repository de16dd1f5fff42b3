use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};

use chrono::Utc;
use tokio::task::JoinHandle;
use tokio_cron_scheduler::{Job, JobScheduler, JobSchedulerError};
use uuid::Uuid;

use crate::config::EngineSettings;
use crate::db::{RecordStore, StoreError};
use crate::models::UnverifyRecord;
use crate::services::gateway::GuildGateway;
use crate::services::restorer::{RestoreOutcome, Restorer};

#[derive(Debug, Default)]
pub struct TickReport {
    pub dispatched: Vec<JoinHandle<()>>,
    pub skipped_in_flight: usize,
    pub deleted: usize,
}

/// Recurring job that restores due records and deletes old finished ones.
///
/// Each tick:
/// 1. Load waiting records
/// 2. Dispatch overdue ones immediately and near-due ones with a precise delay
/// 3. Delete finished records past the retention window
pub struct UnverifyLoop {
    store: Arc<dyn RecordStore>,
    restorer: Arc<Restorer>,
    settings: EngineSettings,
    in_flight: Arc<Mutex<HashSet<Uuid>>>,
}

/// Releases a record's in-flight slot when its restoration task ends.
struct InFlightGuard {
    in_flight: Arc<Mutex<HashSet<Uuid>>>,
    id: Uuid,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.id);
    }
}

impl UnverifyLoop {
    pub fn new(store: Arc<dyn RecordStore>, restorer: Arc<Restorer>, settings: EngineSettings) -> Self {
        Self {
            store,
            restorer,
            settings,
            in_flight: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Waits for the gateway, runs a catch-up tick, then registers the
    /// recurring job and starts the scheduler.
    pub async fn start(
        self: Arc<Self>,
        gateway: Arc<dyn GuildGateway>,
    ) -> Result<JobScheduler, JobSchedulerError> {
        gateway.wait_until_ready().await;
        tracing::info!("Guild gateway ready, starting unverify loop");

        self.run_tick().await;

        let scheduler = JobScheduler::new().await?;
        let this = self.clone();
        let job = Job::new_repeated_async(self.settings.tick_interval, move |_id, _lock| {
            let this = this.clone();
            Box::pin(async move {
                this.run_tick().await;
            })
        })?;
        scheduler.add(job).await?;
        scheduler.start().await?;

        tracing::info!(
            interval_secs = self.settings.tick_interval.as_secs(),
            "Unverify loop scheduled"
        );

        Ok(scheduler)
    }

    async fn run_tick(&self) {
        match self.tick().await {
            Ok(report) => {
                if !report.dispatched.is_empty() || report.deleted > 0 {
                    tracing::debug!(
                        dispatched = report.dispatched.len(),
                        skipped_in_flight = report.skipped_in_flight,
                        deleted = report.deleted,
                        "Unverify tick completed"
                    );
                }
            }
            // Nothing was marked; the next tick retries
            Err(e) => tracing::error!(error = %e, "Unverify tick failed"),
        }
    }

    pub async fn tick(&self) -> Result<TickReport, StoreError> {
        let now = Utc::now();
        let mut report = TickReport::default();

        for record in self.store.get_waiting().await? {
            let delay = if record.is_due(now) {
                None
            } else {
                let remaining = record.remaining(now);
                if remaining >= self.settings.tick_interval {
                    continue;
                }
                Some(remaining)
            };

            match self.dispatch(record, delay) {
                Some(handle) => report.dispatched.push(handle),
                None => report.skipped_in_flight += 1,
            }
        }

        for record in self.store.get_finished().await? {
            if !record.is_expired(now, self.settings.retention) {
                continue;
            }
            tracing::debug!(
                record_id = %record.id,
                guild_id = record.guild_id,
                user_id = record.user_id,
                end_time = %record.end_time,
                status = ?record.status,
                reason = %record.reason,
                "Deleting expired unverify record"
            );
            self.store.delete(record.id).await?;
            report.deleted += 1;
        }

        Ok(report)
    }

    fn dispatch(
        &self,
        record: UnverifyRecord,
        delay: Option<std::time::Duration>,
    ) -> Option<JoinHandle<()>> {
        let inserted = self
            .in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(record.id);
        if !inserted {
            return None;
        }

        let guard = InFlightGuard {
            in_flight: self.in_flight.clone(),
            id: record.id,
        };
        let restorer = self.restorer.clone();

        Some(tokio::spawn(async move {
            let _guard = guard;
            match restorer.restore(&record, delay).await {
                Ok(RestoreOutcome::Restored { warnings }) if !warnings.is_empty() => {
                    tracing::warn!(
                        record_id = %record.id,
                        warnings = warnings.len(),
                        "Restoration finished with skipped changes"
                    );
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::error!(
                        record_id = %record.id,
                        error = %e,
                        "Restoration failed, will retry"
                    );
                }
            }
        }))
    }
}
