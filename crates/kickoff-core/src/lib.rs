//! Core domain rows, integration health, and backfill progress types for Kickoff.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Datelike, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use uuid::Uuid;

pub const CRATE_NAME: &str = "kickoff-core";

pub const CLUB_ELO: &str = "ClubElo";
pub const UNDERSTAT: &str = "Understat";
pub const FOOTBALL_DATA_UK: &str = "FootballDataUk";
pub const API_FOOTBALL: &str = "ApiFootball";

/// First calendar month of a European season; July 2024 belongs to season 2024.
pub const SEASON_START_MONTH: u32 = 7;

/// Consecutive failures after which an integration is reported as failed.
pub const FAILED_AFTER_CONSECUTIVE_FAILURES: u32 = 5;

pub const GLOBAL_SCOPE: &str = "Global";

pub fn season_for_date(date: NaiveDate) -> i32 {
    if date.month() >= SEASON_START_MONTH {
        date.year()
    } else {
        date.year() - 1
    }
}

pub fn checkpoint_key(source: &str, scope: &str) -> String {
    format!("Backfill:{source}:{scope}")
}

/// Canonical team owned by the wider domain; the pipeline only resolves names to it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Team {
    pub id: Uuid,
    pub external_id: Option<i64>,
    pub name: String,
    pub short_name: Option<String>,
    pub competition_code: Option<String>,
}

impl Team {
    pub fn new(name: impl Into<String>, short_name: Option<&str>) -> Self {
        Self {
            id: Uuid::new_v4(),
            external_id: None,
            name: name.into(),
            short_name: short_name.map(ToString::to_string),
            competition_code: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Match {
    pub id: Uuid,
    pub competition_code: String,
    pub season: i32,
    pub home_team_id: Uuid,
    pub away_team_id: Uuid,
    pub kickoff_utc: DateTime<Utc>,
}

/// Squad flags maintained outside the pipeline and read by the injury impact score.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlayerRole {
    pub team_id: Uuid,
    pub player_external_id: i64,
    pub key_player: bool,
    pub top_scorer: bool,
    pub captain: bool,
    pub starting_goalkeeper: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TeamEloRating {
    pub id: Uuid,
    pub team_id: Uuid,
    pub rating_date: NaiveDate,
    pub elo: f64,
    pub rank: Option<u32>,
    pub country: Option<String>,
    pub synced_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TeamXgStats {
    pub id: Uuid,
    pub team_id: Uuid,
    pub competition_code: String,
    pub season: i32,
    pub source_team_id: String,
    pub matches_played: u32,
    pub xg_for: f64,
    pub xg_against: f64,
    pub goals_scored: u32,
    pub goals_conceded: u32,
    /// Mean xG over the trailing five matches.
    pub xg_for_last5: f64,
    pub xg_against_last5: f64,
    pub last_synced_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Outcome {
    Home,
    Draw,
    Away,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchOdds {
    pub id: Uuid,
    pub match_id: Uuid,
    pub source: String,
    pub bookmaker: String,
    pub home_odds: f64,
    pub draw_odds: f64,
    pub away_odds: f64,
    pub home_probability: f64,
    pub draw_probability: f64,
    pub away_probability: f64,
    /// Sum of raw implied probabilities minus one.
    pub overround: f64,
    pub favorite: Outcome,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MatchStatLine {
    pub home_goals: Option<u32>,
    pub away_goals: Option<u32>,
    pub home_shots: Option<u32>,
    pub away_shots: Option<u32>,
    pub home_shots_on_target: Option<u32>,
    pub away_shots_on_target: Option<u32>,
    pub home_corners: Option<u32>,
    pub away_corners: Option<u32>,
    pub home_fouls: Option<u32>,
    pub away_fouls: Option<u32>,
    pub home_yellow_cards: Option<u32>,
    pub away_yellow_cards: Option<u32>,
    pub home_red_cards: Option<u32>,
    pub away_red_cards: Option<u32>,
}

impl MatchStatLine {
    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchStats {
    pub id: Uuid,
    pub match_id: Uuid,
    pub line: MatchStatLine,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Position {
    #[serde(rename = "GK")]
    Goalkeeper,
    #[serde(rename = "DEF")]
    Defender,
    #[serde(rename = "MID")]
    Midfielder,
    #[serde(rename = "FWD")]
    Forward,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Severity {
    Minor,
    Moderate,
    Severe,
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlayerInjury {
    pub id: Uuid,
    pub team_id: Uuid,
    pub player_external_id: Option<i64>,
    pub player_name: String,
    pub position: Position,
    pub reason: String,
    pub severity: Severity,
    pub is_doubtful: bool,
    pub injury_date: Option<NaiveDate>,
    pub expected_return: Option<NaiveDate>,
    pub is_active: bool,
    pub synced_at: DateTime<Utc>,
}

/// Aggregated injury counts for one team plus the bounded impact score.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InjuryImpact {
    pub total_injured: u32,
    pub key_players_injured: u32,
    pub long_term_injuries: u32,
    pub doubtful_players: u32,
    pub top_scorer_injured: bool,
    pub captain_injured: bool,
    pub starting_gk_injured: bool,
    pub impact_score: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TeamInjuries {
    pub team_id: Uuid,
    pub impact: InjuryImpact,
    pub last_synced_at: DateTime<Utc>,
}

/// One immutable row per team per UTC day.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TeamInjurySnapshot {
    pub id: Uuid,
    pub team_id: Uuid,
    pub snapshot_date: NaiveDate,
    pub impact: InjuryImpact,
    pub captured_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum HealthState {
    #[default]
    Unknown,
    Healthy,
    Degraded,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntegrationStatus {
    pub name: String,
    pub health: HealthState,
    pub consecutive_failures: u32,
    pub successes_24h: u32,
    pub failures_24h: u32,
    pub window_started_at: Option<DateTime<Utc>>,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub last_success_at: Option<DateTime<Utc>>,
    pub last_failure_at: Option<DateTime<Utc>>,
    pub last_error_message: Option<String>,
    pub last_error_detail: Option<String>,
    pub last_duration_ms: Option<u64>,
    pub stale_threshold_hours: i64,
    pub data_fresh_as_of: Option<DateTime<Utc>>,
    pub manually_disabled: bool,
    pub disabled_reason: Option<String>,
}

impl IntegrationStatus {
    pub fn new(name: impl Into<String>, stale_threshold_hours: i64) -> Self {
        Self {
            name: name.into(),
            health: HealthState::Unknown,
            consecutive_failures: 0,
            successes_24h: 0,
            failures_24h: 0,
            window_started_at: None,
            last_attempt_at: None,
            last_success_at: None,
            last_failure_at: None,
            last_error_message: None,
            last_error_detail: None,
            last_duration_ms: None,
            stale_threshold_hours,
            data_fresh_as_of: None,
            manually_disabled: false,
            disabled_reason: None,
        }
    }

    pub fn record_success(&mut self, duration: Duration) {
        self.record_success_at(Utc::now(), duration);
    }

    pub fn record_failure(&mut self, message: impl Into<String>, detail: Option<String>) {
        self.record_failure_at(Utc::now(), message, detail);
    }

    pub fn record_success_at(&mut self, now: DateTime<Utc>, duration: Duration) {
        self.roll_window(now);
        self.successes_24h += 1;
        self.consecutive_failures = 0;
        self.health = HealthState::Healthy;
        self.last_attempt_at = Some(now);
        self.last_success_at = Some(now);
        self.data_fresh_as_of = Some(now);
        self.last_duration_ms = Some(duration.as_millis().min(u64::MAX as u128) as u64);
    }

    pub fn record_failure_at(
        &mut self,
        now: DateTime<Utc>,
        message: impl Into<String>,
        detail: Option<String>,
    ) {
        self.roll_window(now);
        self.failures_24h += 1;
        self.consecutive_failures += 1;
        self.health = if self.consecutive_failures >= FAILED_AFTER_CONSECUTIVE_FAILURES {
            HealthState::Failed
        } else {
            HealthState::Degraded
        };
        self.last_attempt_at = Some(now);
        self.last_failure_at = Some(now);
        self.last_error_message = Some(message.into());
        self.last_error_detail = detail;
    }

    pub fn disable(&mut self, reason: impl Into<String>) {
        self.manually_disabled = true;
        self.disabled_reason = Some(reason.into());
    }

    pub fn enable(&mut self) {
        self.manually_disabled = false;
        self.disabled_reason = None;
    }

    pub fn is_data_stale(&self, now: DateTime<Utc>) -> bool {
        match self.data_fresh_as_of {
            Some(fresh) => now - fresh > chrono::Duration::hours(self.stale_threshold_hours),
            None => true,
        }
    }

    fn roll_window(&mut self, now: DateTime<Utc>) {
        let expired = self
            .window_started_at
            .map(|start| now - start >= chrono::Duration::hours(24))
            .unwrap_or(true);
        if expired {
            self.window_started_at = Some(now);
            self.successes_24h = 0;
            self.failures_24h = 0;
        }
    }
}

/// Last completed backfill unit for one (source, scope) key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Progress {
    Season(i32),
    Date(NaiveDate),
}

/// Persisted checkpoint document; only the field matching the progress kind is set.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckpointPayload {
    pub last_completed_season: Option<i32>,
    pub last_completed_date_utc: Option<NaiveDate>,
}

impl From<Progress> for CheckpointPayload {
    fn from(progress: Progress) -> Self {
        match progress {
            Progress::Season(season) => Self {
                last_completed_season: Some(season),
                last_completed_date_utc: None,
            },
            Progress::Date(date) => Self {
                last_completed_season: None,
                last_completed_date_utc: Some(date),
            },
        }
    }
}

impl CheckpointPayload {
    pub fn progress(&self) -> Option<Progress> {
        match (self.last_completed_season, self.last_completed_date_utc) {
            (Some(season), _) => Some(Progress::Season(season)),
            (None, Some(date)) => Some(Progress::Date(date)),
            (None, None) => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataQualityReport {
    pub source: String,
    pub scope: String,
    pub expected: usize,
    pub available: usize,
    pub coverage_percent: f64,
    pub missing_rate_percent: f64,
}

impl DataQualityReport {
    pub fn new(
        source: impl Into<String>,
        scope: impl Into<String>,
        expected: usize,
        available: usize,
    ) -> Self {
        let coverage_percent = if expected == 0 {
            0.0
        } else {
            (available as f64 / expected as f64 * 100.0).clamp(0.0, 100.0)
        };
        Self {
            source: source.into(),
            scope: scope.into(),
            expected,
            available,
            coverage_percent,
            missing_rate_percent: 100.0 - coverage_percent,
        }
    }
}

/// Cooperative cancellation shared between a driver and the work it spawns.
#[derive(Debug, Clone)]
pub struct CancelToken {
    sender: Arc<watch::Sender<bool>>,
    receiver: watch::Receiver<bool>,
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelToken {
    pub fn new() -> Self {
        let (sender, receiver) = watch::channel(false);
        Self {
            sender: Arc::new(sender),
            receiver,
        }
    }

    pub fn cancel(&self) {
        self.sender.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.receiver.borrow()
    }

    /// Resolves once `cancel` has been called on any clone.
    pub async fn cancelled(&self) {
        let mut receiver = self.receiver.clone();
        loop {
            if *receiver.borrow_and_update() {
                return;
            }
            if receiver.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, hour, 0, 0).single().unwrap()
    }

    #[test]
    fn failures_degrade_then_fail_and_success_recovers() {
        let mut status = IntegrationStatus::new(CLUB_ELO, 24);
        for _ in 0..4 {
            status.record_failure_at(at(1), "timeout", None);
        }
        assert_eq!(status.health, HealthState::Degraded);
        assert_eq!(status.consecutive_failures, 4);

        status.record_failure_at(at(2), "timeout", Some("connect".into()));
        assert_eq!(status.health, HealthState::Failed);
        assert_eq!(status.last_error_detail.as_deref(), Some("connect"));

        status.record_success_at(at(3), Duration::from_millis(1500));
        assert_eq!(status.health, HealthState::Healthy);
        assert_eq!(status.consecutive_failures, 0);
        assert_eq!(status.successes_24h, 1);
        assert_eq!(status.failures_24h, 5);
        assert_eq!(status.last_duration_ms, Some(1500));
    }

    #[test]
    fn daily_counters_reset_after_a_day() {
        let mut status = IntegrationStatus::new(UNDERSTAT, 24);
        status.record_failure_at(at(1), "boom", None);
        status.record_success_at(at(1) + chrono::Duration::hours(25), Duration::ZERO);
        assert_eq!(status.failures_24h, 0);
        assert_eq!(status.successes_24h, 1);
    }

    #[test]
    fn staleness_is_derived_from_fresh_as_of() {
        let mut status = IntegrationStatus::new(API_FOOTBALL, 12);
        assert!(status.is_data_stale(at(0)));
        status.record_success_at(at(0), Duration::ZERO);
        assert!(!status.is_data_stale(at(12)));
        assert!(status.is_data_stale(at(13)));
    }

    #[test]
    fn disabling_keeps_health_history() {
        let mut status = IntegrationStatus::new(FOOTBALL_DATA_UK, 24);
        status.record_failure_at(at(1), "boom", None);
        status.disable("provider moved the CSVs");
        assert!(status.manually_disabled);
        assert_eq!(status.health, HealthState::Degraded);
        status.enable();
        assert!(!status.manually_disabled);
        assert_eq!(status.disabled_reason, None);
    }

    #[test]
    fn checkpoint_payload_keeps_one_field() {
        let date = NaiveDate::from_ymd_opt(2024, 5, 19).unwrap();
        let payload = CheckpointPayload::from(Progress::Date(date));
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"lastCompletedSeason": null, "lastCompletedDateUtc": "2024-05-19"})
        );
        assert_eq!(payload.progress(), Some(Progress::Date(date)));
        assert_eq!(CheckpointPayload::default().progress(), None);
    }

    #[test]
    fn quality_report_is_clamped() {
        let over = DataQualityReport::new(UNDERSTAT, "PL:2023", 20, 25);
        assert_eq!(over.coverage_percent, 100.0);
        assert_eq!(over.missing_rate_percent, 0.0);

        let partial = DataQualityReport::new(FOOTBALL_DATA_UK, "PL:2023", 380, 361);
        assert!((partial.coverage_percent - 95.0).abs() < 1e-9);

        let empty = DataQualityReport::new(CLUB_ELO, GLOBAL_SCOPE, 0, 0);
        assert_eq!(empty.coverage_percent, 0.0);
    }

    #[test]
    fn season_boundary_is_july() {
        assert_eq!(season_for_date(NaiveDate::from_ymd_opt(2024, 6, 30).unwrap()), 2023);
        assert_eq!(season_for_date(NaiveDate::from_ymd_opt(2024, 7, 1).unwrap()), 2024);
        assert_eq!(checkpoint_key(UNDERSTAT, "PL"), "Backfill:Understat:PL");
    }

    #[tokio::test]
    async fn cancel_token_wakes_waiters() {
        let token = CancelToken::new();
        let waiter = token.clone();
        let handle = tokio::spawn(async move { waiter.cancelled().await });
        token.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("waiter woke")
            .expect("join");
        assert!(token.is_cancelled());
    }
}
