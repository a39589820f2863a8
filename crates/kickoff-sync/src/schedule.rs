use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Datelike, Duration, NaiveTime, Utc, Weekday};
use kickoff_adapters::{AdapterError, ProviderAdapter, SyncOutcome};
use kickoff_core::CancelToken;
use kickoff_storage::HealthRecorder;
use tracing::{error, info, warn};

use crate::config::ScheduleConfig;

/// Today's `hour_utc:00` if still ahead of `now`. Once it has passed, daily schedules roll
/// to tomorrow and weekly schedules to the next Monday.
pub fn next_trigger(now: DateTime<Utc>, hour_utc: u32, weekly: bool) -> DateTime<Utc> {
    let at = NaiveTime::from_hms_opt(hour_utc.min(23), 0, 0).unwrap_or_default();
    let today = now.date_naive().and_time(at).and_utc();
    if today > now {
        return today;
    }
    let mut candidate = today + Duration::days(1);
    if weekly {
        while candidate.weekday() != Weekday::Mon {
            candidate += Duration::days(1);
        }
    }
    candidate
}

/// Timer loop around one adapter's `sync_latest`.
pub struct ScheduledDriver {
    adapter: Arc<dyn ProviderAdapter>,
    health: Arc<dyn HealthRecorder>,
    schedule: ScheduleConfig,
}

impl ScheduledDriver {
    pub fn new(
        adapter: Arc<dyn ProviderAdapter>,
        health: Arc<dyn HealthRecorder>,
        schedule: ScheduleConfig,
    ) -> Self {
        Self {
            adapter,
            health,
            schedule,
        }
    }

    pub fn integration(&self) -> &'static str {
        self.adapter.integration()
    }

    /// One pass with health reporting. Cancellation is passed through unrecorded and a
    /// manually disabled integration is skipped without touching the provider.
    pub async fn run_once(&self, cancel: &CancelToken) -> Result<SyncOutcome, AdapterError> {
        let integration = self.adapter.integration();
        if let Some(reason) = self.health.disabled_reason(integration).await {
            info!(integration, %reason, "integration disabled; skipping pass");
            return Ok(SyncOutcome::default());
        }
        let started = Instant::now();
        match self.adapter.sync_latest(cancel).await {
            Ok(outcome) => {
                info!(
                    integration,
                    fetched = outcome.fetched,
                    upserted = outcome.upserted,
                    unmatched = outcome.unmatched,
                    quota_stopped = outcome.quota_stopped,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "scheduled sync finished"
                );
                if let Err(err) = self.health.record_success(integration, started.elapsed()).await {
                    warn!(integration, error = %err, "could not record integration success");
                }
                Ok(outcome)
            }
            Err(err) if err.is_cancelled() => {
                info!(integration, "scheduled sync cancelled");
                Err(err)
            }
            Err(err) => {
                error!(
                    integration,
                    transient = err.is_transient(),
                    error = %err,
                    "scheduled sync failed"
                );
                if let Err(record_err) = self
                    .health
                    .record_failure(integration, &err.to_string(), Some(format!("{err:?}")))
                    .await
                {
                    warn!(integration, error = %record_err, "could not record integration failure");
                }
                Err(err)
            }
        }
    }

    /// Sleeps until each trigger and runs a pass, until `cancel` fires.
    pub async fn run(self, cancel: CancelToken) {
        let integration = self.integration();
        loop {
            let now = Utc::now();
            let next = next_trigger(now, self.schedule.hour_utc, self.schedule.weekly);
            let wait = (next - now).to_std().unwrap_or_default();
            info!(integration, next = %next, "next scheduled sync");

            tokio::select! {
                _ = cancel.cancelled() => {
                    info!(integration, "scheduler stopping");
                    return;
                }
                _ = tokio::time::sleep(wait) => {}
            }

            if let Err(err) = self.run_once(&cancel).await {
                if err.is_cancelled() {
                    return;
                }
            }
        }
    }
}
