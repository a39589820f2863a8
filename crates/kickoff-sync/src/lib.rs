//! Composition root for the Kickoff sync pipeline: configuration, backfills, and schedules.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use kickoff_adapters::{
    DailyAdapter, EloAdapter, InjuryAdapter, OddsAdapter, ProviderAdapter, QuotaGovernor,
    SeasonalAdapter, XgAdapter,
};
use kickoff_core::{CancelToken, IntegrationStatus};
use kickoff_storage::{Checkpoints, DataStore, HttpFetcher};
use tracing::{info, warn};

pub mod backfill;
pub mod config;
pub mod schedule;

pub use backfill::{is_cancelled, BackfillOrchestrator};
pub use config::{ProviderConfig, ScheduleConfig, SyncConfig};
pub use schedule::{next_trigger, ScheduledDriver};

pub const CRATE_NAME: &str = "kickoff-sync";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source {
    Elo,
    Xg,
    Odds,
    Injuries,
}

impl Source {
    pub const ALL: [Source; 4] = [Source::Elo, Source::Xg, Source::Odds, Source::Injuries];

    pub fn as_str(&self) -> &'static str {
        match self {
            Source::Elo => "elo",
            Source::Xg => "xg",
            Source::Odds => "odds",
            Source::Injuries => "injuries",
        }
    }
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Source {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        Source::ALL
            .into_iter()
            .find(|source| source.as_str().eq_ignore_ascii_case(s.trim()))
            .with_context(|| format!("unknown source {s:?} (expected elo, xg, odds or injuries)"))
    }
}

/// Every long-lived collaborator, built once from [`SyncConfig`].
pub struct Pipeline {
    config: SyncConfig,
    store: Arc<DataStore>,
    governor: Arc<QuotaGovernor>,
    elo: Arc<EloAdapter>,
    xg: Arc<XgAdapter>,
    odds: Arc<OddsAdapter>,
    injuries: Arc<InjuryAdapter>,
}

impl Pipeline {
    pub async fn new(config: SyncConfig) -> Result<Self> {
        let store = Arc::new(
            DataStore::open(&config.data_path)
                .await
                .with_context(|| format!("opening data store {}", config.data_path.display()))?,
        );
        Self::with_store(config, store)
    }

    pub fn with_store(config: SyncConfig, store: Arc<DataStore>) -> Result<Self> {
        let http = Arc::new(HttpFetcher::new(config.http_client())?);
        let governor = Arc::new(QuotaGovernor::new(config.injuries.quota));
        if config.injuries.adapter.api_key.is_empty() {
            warn!("API_FOOTBALL_KEY is not set; injury requests will be rejected upstream");
        }

        let elo = Arc::new(EloAdapter::new(
            http.clone(),
            store.clone(),
            config.elo.base_url.clone(),
        ));
        let xg = Arc::new(XgAdapter::new(
            http.clone(),
            store.clone(),
            config.xg.base_url.clone(),
            config.xg.competitions.clone(),
        ));
        let odds = Arc::new(OddsAdapter::new(
            http.clone(),
            store.clone(),
            config.odds.base_url.clone(),
            config.odds.competitions.clone(),
        ));
        let injuries = Arc::new(InjuryAdapter::new(
            http,
            store.clone(),
            governor.clone(),
            config.injuries.adapter.clone(),
        ));

        Ok(Self {
            config,
            store,
            governor,
            elo,
            xg,
            odds,
            injuries,
        })
    }

    pub async fn from_env() -> Result<Self> {
        Self::new(SyncConfig::from_env()?).await
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<DataStore> {
        &self.store
    }

    pub fn governor(&self) -> &Arc<QuotaGovernor> {
        &self.governor
    }

    pub fn orchestrator(&self) -> BackfillOrchestrator {
        BackfillOrchestrator::new(Checkpoints::new(self.store.clone()), self.store.clone())
    }

    pub fn adapter(&self, source: Source) -> Arc<dyn ProviderAdapter> {
        match source {
            Source::Elo => self.elo.clone(),
            Source::Xg => self.xg.clone(),
            Source::Odds => self.odds.clone(),
            Source::Injuries => self.injuries.clone(),
        }
    }

    /// Adapters backfilled season by season.
    pub fn seasonal(&self, source: Source) -> Option<Arc<dyn SeasonalAdapter>> {
        match source {
            Source::Xg => Some(self.xg.clone() as Arc<dyn SeasonalAdapter>),
            Source::Odds => Some(self.odds.clone() as Arc<dyn SeasonalAdapter>),
            Source::Elo | Source::Injuries => None,
        }
    }

    /// Elo is the only source backfilled day by day.
    pub fn daily(&self) -> Arc<dyn DailyAdapter> {
        self.elo.clone()
    }

    fn schedule_for(&self, source: Source) -> ScheduleConfig {
        match source {
            Source::Elo => self.config.elo.schedule,
            Source::Xg => self.config.xg.schedule,
            Source::Odds => self.config.odds.schedule,
            Source::Injuries => self.config.injuries.schedule,
        }
    }

    pub fn driver(&self, source: Source) -> ScheduledDriver {
        ScheduledDriver::new(
            self.adapter(source),
            self.store.clone(),
            self.schedule_for(source),
        )
    }

    /// One driver per source whose schedule is enabled.
    pub fn drivers(&self) -> Vec<ScheduledDriver> {
        Source::ALL
            .into_iter()
            .filter(|source| self.schedule_for(*source).enabled)
            .map(|source| self.driver(source))
            .collect()
    }

    /// Runs every enabled driver until `cancel` fires.
    pub async fn run_scheduler(&self, cancel: &CancelToken) -> Result<()> {
        let drivers = self.drivers();
        if drivers.is_empty() {
            warn!("no schedules enabled; nothing to run");
            return Ok(());
        }
        info!(drivers = drivers.len(), "scheduler started");

        let handles: Vec<_> = drivers
            .into_iter()
            .map(|driver| tokio::spawn(driver.run(cancel.clone())))
            .collect();
        for handle in handles {
            handle.await.context("scheduled driver task panicked")?;
        }
        info!("scheduler stopped");
        Ok(())
    }

    pub async fn statuses(&self) -> Vec<IntegrationStatus> {
        self.store
            .read(|t| t.integration_statuses.values().cloned().collect())
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sources_parse_case_insensitively() {
        assert_eq!("XG".parse::<Source>().unwrap(), Source::Xg);
        assert_eq!(" injuries ".parse::<Source>().unwrap(), Source::Injuries);
        assert!("weather".parse::<Source>().is_err());
    }

    #[tokio::test]
    async fn pipeline_wires_adapters_and_schedules() {
        let mut config = SyncConfig::default();
        config.odds.schedule.enabled = false;
        let pipeline = Pipeline::with_store(config, Arc::new(DataStore::in_memory())).unwrap();

        assert_eq!(pipeline.adapter(Source::Elo).integration(), "ClubElo");
        assert_eq!(pipeline.adapter(Source::Injuries).integration(), "ApiFootball");
        assert!(pipeline.seasonal(Source::Elo).is_none());
        assert_eq!(
            pipeline.seasonal(Source::Odds).unwrap().competitions().len(),
            8
        );

        let integrations: Vec<&str> = pipeline.drivers().iter().map(|d| d.integration()).collect();
        assert_eq!(integrations, vec!["ClubElo", "Understat", "ApiFootball"]);
        assert!(pipeline.statuses().await.is_empty());
    }

    #[tokio::test]
    async fn reopened_pipeline_sees_saved_checkpoints() {
        let dir = tempfile::tempdir().unwrap();
        let config = SyncConfig {
            data_path: dir.path().join("kickoff.json"),
            ..Default::default()
        };

        let first = Pipeline::new(config.clone()).await.unwrap();
        Checkpoints::new(first.store().clone())
            .save_season("Backfill:Understat:PL", 2022)
            .await
            .unwrap();

        let second = Pipeline::new(config).await.unwrap();
        let last = Checkpoints::new(second.store().clone())
            .last_season("Backfill:Understat:PL")
            .await
            .unwrap();
        assert_eq!(last, Some(2022));
    }
}
