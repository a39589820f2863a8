use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use kickoff_core::{
    IntegrationStatus, Match, MatchOdds, MatchStats, PlayerInjury, PlayerRole, Team,
    TeamEloRating, TeamInjuries, TeamInjurySnapshot, TeamXgStats, API_FOOTBALL, CLUB_ELO,
    FOOTBALL_DATA_UK, UNDERSTAT,
};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

/// Typed collections persisted together as one JSON snapshot.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Tables {
    pub teams: Vec<Team>,
    pub matches: Vec<Match>,
    pub player_roles: Vec<PlayerRole>,
    pub elo_ratings: Vec<TeamEloRating>,
    pub xg_stats: Vec<TeamXgStats>,
    pub match_odds: Vec<MatchOdds>,
    pub match_stats: Vec<MatchStats>,
    pub player_injuries: Vec<PlayerInjury>,
    pub team_injuries: Vec<TeamInjuries>,
    pub injury_snapshots: Vec<TeamInjurySnapshot>,
    pub integration_statuses: BTreeMap<String, IntegrationStatus>,
    pub checkpoints: BTreeMap<String, serde_json::Value>,
}

impl Tables {
    pub fn team(&self, id: Uuid) -> Option<&Team> {
        self.teams.iter().find(|t| t.id == id)
    }

    pub fn teams_in_competition(&self, competition_code: &str) -> Vec<Team> {
        let by_code: Vec<Team> = self
            .teams
            .iter()
            .filter(|t| t.competition_code.as_deref() == Some(competition_code))
            .cloned()
            .collect();
        if !by_code.is_empty() {
            return by_code;
        }
        let mut ids: Vec<Uuid> = self
            .matches
            .iter()
            .filter(|m| m.competition_code == competition_code)
            .flat_map(|m| [m.home_team_id, m.away_team_id])
            .collect();
        ids.sort();
        ids.dedup();
        if ids.is_empty() {
            return self.teams.clone();
        }
        self.teams
            .iter()
            .filter(|t| ids.binary_search(&t.id).is_ok())
            .cloned()
            .collect()
    }
}

pub fn default_stale_threshold_hours(integration: &str) -> i64 {
    match integration {
        CLUB_ELO => 48,
        UNDERSTAT | FOOTBALL_DATA_UK => 8 * 24,
        API_FOOTBALL => 24,
        _ => 24,
    }
}

/// In-process store; `save` writes the whole snapshot with a temp-file rename.
#[derive(Debug)]
pub struct DataStore {
    path: Option<PathBuf>,
    tables: Mutex<Tables>,
}

impl DataStore {
    pub fn in_memory() -> Self {
        Self::with_tables(Tables::default())
    }

    pub fn with_tables(tables: Tables) -> Self {
        Self {
            path: None,
            tables: Mutex::new(tables),
        }
    }

    pub async fn open(path: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let path = path.into();
        let tables = if fs::try_exists(&path)
            .await
            .with_context(|| format!("checking store path {}", path.display()))?
        {
            let text = fs::read_to_string(&path)
                .await
                .with_context(|| format!("reading {}", path.display()))?;
            serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))?
        } else {
            Tables::default()
        };
        Ok(Self {
            path: Some(path),
            tables: Mutex::new(tables),
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub async fn read<R>(&self, f: impl FnOnce(&Tables) -> R) -> R {
        let tables = self.tables.lock().await;
        f(&tables)
    }

    pub async fn write<R>(&self, f: impl FnOnce(&mut Tables) -> R) -> R {
        let mut tables = self.tables.lock().await;
        f(&mut tables)
    }

    pub async fn save(&self) -> anyhow::Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let bytes = {
            let tables = self.tables.lock().await;
            serde_json::to_vec_pretty(&*tables).context("serializing store snapshot")?
        };
        write_atomically(path, &bytes).await?;
        debug!(path = %path.display(), bytes = bytes.len(), "store snapshot saved");
        Ok(())
    }
}

async fn write_atomically(path: &Path, bytes: &[u8]) -> anyhow::Result<()> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent)
        .await
        .with_context(|| format!("creating store directory {}", parent.display()))?;

    let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&temp_path)
        .await
        .with_context(|| format!("opening temp snapshot {}", temp_path.display()))?;
    file.write_all(bytes)
        .await
        .with_context(|| format!("writing temp snapshot {}", temp_path.display()))?;
    file.flush()
        .await
        .with_context(|| format!("flushing temp snapshot {}", temp_path.display()))?;
    drop(file);

    if let Err(err) = fs::rename(&temp_path, path).await {
        let _ = fs::remove_file(&temp_path).await;
        return Err(err).with_context(|| {
            format!(
                "atomically renaming snapshot {} -> {}",
                temp_path.display(),
                path.display()
            )
        });
    }
    Ok(())
}

/// Sink for per-integration success/failure timings.
#[async_trait]
pub trait HealthRecorder: Send + Sync {
    async fn record_success(&self, integration: &str, duration: Duration) -> anyhow::Result<()>;

    async fn record_failure(
        &self,
        integration: &str,
        message: &str,
        detail: Option<String>,
    ) -> anyhow::Result<()>;

    /// Reason an operator switched the integration off, if they did.
    async fn disabled_reason(&self, integration: &str) -> Option<String>;
}

#[async_trait]
impl HealthRecorder for DataStore {
    async fn record_success(&self, integration: &str, duration: Duration) -> anyhow::Result<()> {
        self.write(|t| {
            t.integration_statuses
                .entry(integration.to_string())
                .or_insert_with(|| {
                    IntegrationStatus::new(integration, default_stale_threshold_hours(integration))
                })
                .record_success(duration);
        })
        .await;
        self.save().await
    }

    async fn record_failure(
        &self,
        integration: &str,
        message: &str,
        detail: Option<String>,
    ) -> anyhow::Result<()> {
        self.write(|t| {
            t.integration_statuses
                .entry(integration.to_string())
                .or_insert_with(|| {
                    IntegrationStatus::new(integration, default_stale_threshold_hours(integration))
                })
                .record_failure(message, detail);
        })
        .await;
        self.save().await
    }

    async fn disabled_reason(&self, integration: &str) -> Option<String> {
        self.read(|t| {
            t.integration_statuses
                .get(integration)
                .filter(|status| status.manually_disabled)
                .map(|status| {
                    status
                        .disabled_reason
                        .clone()
                        .unwrap_or_else(|| "disabled manually".to_string())
                })
        })
        .await
    }
}

impl DataStore {
    /// `Some(reason)` switches the integration off; `None` switches it back on.
    pub async fn set_disabled(&self, integration: &str, reason: Option<String>) -> anyhow::Result<()> {
        self.write(|t| {
            let status = t
                .integration_statuses
                .entry(integration.to_string())
                .or_insert_with(|| {
                    IntegrationStatus::new(integration, default_stale_threshold_hours(integration))
                });
            match reason {
                Some(reason) => status.disable(reason),
                None => status.enable(),
            }
        })
        .await;
        self.save().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kickoff_core::HealthState;
    use tempfile::tempdir;

    #[tokio::test]
    async fn snapshot_survives_reopen() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("nested").join("store.json");

        let store = DataStore::open(&path).await.expect("open");
        store
            .write(|t| t.teams.push(Team::new("Arsenal", Some("ARS"))))
            .await;
        store.save().await.expect("save");

        let reopened = DataStore::open(&path).await.expect("reopen");
        let names = reopened
            .read(|t| t.teams.iter().map(|t| t.name.clone()).collect::<Vec<_>>())
            .await;
        assert_eq!(names, vec!["Arsenal".to_string()]);
    }

    #[tokio::test]
    async fn in_memory_save_is_a_noop() {
        let store = DataStore::in_memory();
        store.save().await.expect("save");
        assert!(store.path().is_none());
    }

    #[tokio::test]
    async fn health_recorder_tracks_named_integrations() {
        let store = DataStore::in_memory();
        store
            .record_failure(UNDERSTAT, "http status 503", Some("league/EPL/2024".into()))
            .await
            .unwrap();
        store
            .record_success(CLUB_ELO, Duration::from_millis(20))
            .await
            .unwrap();

        let (understat, elo) = store
            .read(|t| {
                (
                    t.integration_statuses[UNDERSTAT].clone(),
                    t.integration_statuses[CLUB_ELO].clone(),
                )
            })
            .await;
        assert_eq!(understat.health, HealthState::Degraded);
        assert_eq!(understat.stale_threshold_hours, 8 * 24);
        assert_eq!(elo.health, HealthState::Healthy);
    }

    #[tokio::test]
    async fn disabled_integrations_report_their_reason() {
        let store = DataStore::in_memory();
        assert_eq!(store.disabled_reason(UNDERSTAT).await, None);
        store
            .set_disabled(UNDERSTAT, Some("layout change".into()))
            .await
            .unwrap();
        assert_eq!(
            store.disabled_reason(UNDERSTAT).await.as_deref(),
            Some("layout change")
        );
        store.set_disabled(UNDERSTAT, None).await.unwrap();
        assert_eq!(store.disabled_reason(UNDERSTAT).await, None);
    }

    #[test]
    fn competition_teams_fall_back_to_match_participants() {
        let home = Team::new("Arsenal", None);
        let away = Team::new("Chelsea", None);
        let other = Team::new("Real Madrid", None);
        let tables = Tables {
            matches: vec![Match {
                id: Uuid::new_v4(),
                competition_code: "PL".into(),
                season: 2024,
                home_team_id: home.id,
                away_team_id: away.id,
                kickoff_utc: chrono::Utc::now(),
            }],
            teams: vec![home, away, other],
            ..Default::default()
        };
        let names: Vec<String> = tables
            .teams_in_competition("PL")
            .into_iter()
            .map(|t| t.name)
            .collect();
        assert_eq!(names, vec!["Arsenal".to_string(), "Chelsea".to_string()]);
    }
}
