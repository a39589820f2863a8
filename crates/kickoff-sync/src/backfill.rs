//! Resumable season and day backfills.
//!
//! Each unit (one season of one competition, or one calendar day) is synced, checkpointed,
//! and reported before the next one starts. A failed unit leaves the previous checkpoint in
//! place so the next invocation resumes at the failed unit.

use std::ops::RangeInclusive;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use chrono::NaiveDate;
use kickoff_adapters::{AdapterError, DailyAdapter, ProviderAdapter, SeasonalAdapter, SyncOutcome};
use kickoff_core::{checkpoint_key, CancelToken, DataQualityReport, GLOBAL_SCOPE};
use kickoff_storage::{Checkpoints, HealthRecorder};
use tracing::{error, info, warn};

/// True when the error chain carries a cancelled adapter call.
pub fn is_cancelled(err: &anyhow::Error) -> bool {
    err.downcast_ref::<AdapterError>()
        .map(AdapterError::is_cancelled)
        .unwrap_or(false)
}

pub fn remaining_seasons(from: i32, to: i32, last_completed: Option<i32>) -> RangeInclusive<i32> {
    let start = last_completed.map_or(from, |last| from.max(last + 1));
    start..=to
}

pub fn remaining_days(from: NaiveDate, to: NaiveDate, last_completed: Option<NaiveDate>) -> Vec<NaiveDate> {
    let start = last_completed
        .and_then(|last| last.succ_opt())
        .map_or(from, |next| from.max(next));
    start
        .iter_days()
        .take_while(|day| *day <= to)
        .collect()
}

pub struct BackfillOrchestrator {
    checkpoints: Checkpoints,
    health: Arc<dyn HealthRecorder>,
}

impl BackfillOrchestrator {
    pub fn new(checkpoints: Checkpoints, health: Arc<dyn HealthRecorder>) -> Self {
        Self {
            checkpoints,
            health,
        }
    }

    pub async fn backfill_seasons(
        &self,
        adapter: &dyn SeasonalAdapter,
        competition: &str,
        from: i32,
        to: i32,
        cancel: &CancelToken,
    ) -> Result<Vec<DataQualityReport>> {
        let key = checkpoint_key(adapter.checkpoint_source(), competition);
        let last = self.checkpoints.last_season(&key).await?;
        let seasons = remaining_seasons(from, to, last);
        if seasons.is_empty() {
            info!(%key, from, to, last_completed = ?last, "season backfill already caught up");
            return Ok(Vec::new());
        }
        info!(%key, start = *seasons.start(), to, "season backfill starting");

        let mut reports = Vec::new();
        for season in seasons {
            if cancel.is_cancelled() {
                return Err(AdapterError::Cancelled.into());
            }
            let started = Instant::now();
            let outcome = adapter.sync_season(competition, season, cancel).await;
            let outcome = self
                .settle(adapter, &key, &format!("season {season}"), started, outcome)
                .await?;

            self.checkpoints
                .save_season(&key, season)
                .await
                .with_context(|| format!("saving checkpoint {key} at season {season}"))?;

            let report = adapter.season_quality(competition, season, &outcome).await;
            log_report(&report, &outcome);
            reports.push(report);
        }
        Ok(reports)
    }

    /// Runs the season backfill for every competition the adapter is configured with, in order.
    pub async fn backfill_all_competitions(
        &self,
        adapter: &dyn SeasonalAdapter,
        from: i32,
        to: i32,
        cancel: &CancelToken,
    ) -> Result<Vec<DataQualityReport>> {
        let mut reports = Vec::new();
        for competition in adapter.competitions() {
            let batch = self
                .backfill_seasons(adapter, &competition, from, to, cancel)
                .await?;
            reports.extend(batch);
        }
        Ok(reports)
    }

    pub async fn backfill_days(
        &self,
        adapter: &dyn DailyAdapter,
        from: NaiveDate,
        to: NaiveDate,
        cancel: &CancelToken,
    ) -> Result<Vec<DataQualityReport>> {
        let key = checkpoint_key(adapter.checkpoint_source(), GLOBAL_SCOPE);
        let last = self.checkpoints.last_date(&key).await?;
        let days = remaining_days(from, to, last);
        if days.is_empty() {
            info!(%key, %from, %to, last_completed = ?last, "day backfill already caught up");
            return Ok(Vec::new());
        }
        info!(%key, start = %days[0], %to, days = days.len(), "day backfill starting");

        let mut reports = Vec::with_capacity(days.len());
        for day in days {
            if cancel.is_cancelled() {
                return Err(AdapterError::Cancelled.into());
            }
            let started = Instant::now();
            let outcome = adapter.sync_date(day, cancel).await;
            let outcome = self
                .settle(adapter, &key, &day.to_string(), started, outcome)
                .await?;

            self.checkpoints
                .save_date(&key, day)
                .await
                .with_context(|| format!("saving checkpoint {key} at {day}"))?;

            let report = adapter.date_quality(day, &outcome).await;
            log_report(&report, &outcome);
            reports.push(report);
        }
        Ok(reports)
    }

    /// Records health for one unit and turns an adapter error into the run's error.
    async fn settle(
        &self,
        adapter: &(impl ProviderAdapter + ?Sized),
        key: &str,
        unit: &str,
        started: Instant,
        outcome: Result<SyncOutcome, AdapterError>,
    ) -> Result<SyncOutcome> {
        let integration = adapter.integration();
        match outcome {
            Ok(outcome) => {
                if let Err(err) = self.health.record_success(integration, started.elapsed()).await {
                    warn!(integration, error = %err, "could not record integration success");
                }
                Ok(outcome)
            }
            Err(err) if err.is_cancelled() => {
                info!(%key, unit, "backfill cancelled");
                Err(err.into())
            }
            Err(err) => {
                error!(
                    %key,
                    unit,
                    transient = err.is_transient(),
                    error = %err,
                    "backfill unit failed; checkpoint not advanced"
                );
                let detail = Some(format!("{key} {unit}"));
                if let Err(record_err) = self
                    .health
                    .record_failure(integration, &err.to_string(), detail)
                    .await
                {
                    warn!(integration, error = %record_err, "could not record integration failure");
                }
                Err(anyhow::Error::new(err).context(format!("backfilling {key} {unit}")))
            }
        }
    }
}

fn log_report(report: &DataQualityReport, outcome: &SyncOutcome) {
    info!(
        source = %report.source,
        scope = %report.scope,
        expected = report.expected,
        available = report.available,
        coverage_percent = report.coverage_percent,
        missing_rate_percent = report.missing_rate_percent,
        unmatched = outcome.unmatched,
        invalid = outcome.invalid,
        no_data = outcome.no_data,
        "data quality"
    );
}
