//! API-Football injury lists for teams with fixtures coming up.
//!
//! Every injury request is cleared with the shared [`QuotaGovernor`] first. The provider's
//! `/v3/status` figure is read once per run and tightens the local counter; when that call
//! fails the local counter alone decides. A refusal ends the run early.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, NaiveDate, Utc};
use kickoff_core::{
    season_for_date, CancelToken, InjuryImpact, PlayerInjury, PlayerRole, Position, Severity,
    TeamInjuries, TeamInjurySnapshot, API_FOOTBALL,
};
use kickoff_storage::{DataStore, HttpFetcher};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::quota::{QuotaDecision, QuotaGovernor};
use crate::{AdapterError, ProviderAdapter, SyncOutcome};

pub const API_KEY_HEADER: &str = "x-apisports-key";

const SUSPENSION_MARKERS: &[&str] = &["suspension", "suspended", "missing"];
const SEVERE_MARKERS: &[&str] = &["acl", "cruciate", "fracture", "broken", "rupture"];
const MODERATE_MARKERS: &[&str] = &["strain", "sprain", "hamstring", "muscle", "groin", "calf"];
const DOUBTFUL_TYPES: &[&str] = &["questionable", "doubtful"];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InjuryAdapterConfig {
    pub base_url: String,
    pub api_key: String,
    /// Teams playing within this many days are candidates.
    pub lookahead_days: i64,
    /// Teams synced more recently than this are skipped.
    pub staleness_hours: i64,
    pub competition: Option<String>,
    /// Defaults to the season of the run date.
    pub season: Option<i32>,
}

impl Default for InjuryAdapterConfig {
    fn default() -> Self {
        Self {
            base_url: "https://v3.football.api-sports.io".to_string(),
            api_key: String::new(),
            lookahead_days: 3,
            staleness_hours: 12,
            competition: None,
            season: None,
        }
    }
}

pub fn classify_position(raw: Option<&str>) -> Position {
    match raw.map(|p| p.trim().to_lowercase()).as_deref() {
        Some("goalkeeper") => Position::Goalkeeper,
        Some("defender") => Position::Defender,
        Some("midfielder") => Position::Midfielder,
        Some("attacker") => Position::Forward,
        _ => Position::Unknown,
    }
}

pub fn classify_severity(reason: &str) -> Severity {
    let reason = reason.trim().to_lowercase();
    if reason.is_empty() {
        Severity::Unknown
    } else if SEVERE_MARKERS.iter().any(|m| reason.contains(m)) {
        Severity::Severe
    } else if MODERATE_MARKERS.iter().any(|m| reason.contains(m)) {
        Severity::Moderate
    } else {
        Severity::Minor
    }
}

pub fn is_suspension(reason: &str) -> bool {
    let reason = reason.to_lowercase();
    SUSPENSION_MARKERS.iter().any(|m| reason.contains(m))
}

pub fn expected_return(
    injury_date: Option<NaiveDate>,
    severity: Severity,
    doubtful: bool,
) -> Option<NaiveDate> {
    let days = if doubtful {
        3
    } else {
        match severity {
            Severity::Severe => 45,
            Severity::Moderate => 14,
            Severity::Minor => 5,
            Severity::Unknown => 10,
        }
    };
    injury_date.map(|d| d + Duration::days(days))
}

pub fn impact_score(impact: &InjuryImpact) -> f64 {
    let flag = |b: bool| if b { 1.0 } else { 0.0 };
    let score = 5.0 * f64::from(impact.total_injured)
        + 15.0 * f64::from(impact.key_players_injured)
        + 8.0 * f64::from(impact.long_term_injuries)
        + 2.0 * f64::from(impact.doubtful_players)
        + 20.0 * flag(impact.top_scorer_injured)
        + 10.0 * flag(impact.captain_injured)
        + 15.0 * flag(impact.starting_gk_injured);
    score.min(100.0)
}

/// Counts and flags for one team's active set, with the score filled in.
pub fn summarize(injuries: &[PlayerInjury], roles: &[PlayerRole]) -> InjuryImpact {
    let mut impact = InjuryImpact {
        total_injured: injuries.len() as u32,
        ..Default::default()
    };
    for injury in injuries {
        if injury.severity == Severity::Severe {
            impact.long_term_injuries += 1;
        }
        if injury.is_doubtful {
            impact.doubtful_players += 1;
        }
        let role = injury.player_external_id.and_then(|pid| {
            roles
                .iter()
                .find(|r| r.team_id == injury.team_id && r.player_external_id == pid)
        });
        if let Some(role) = role {
            if role.key_player {
                impact.key_players_injured += 1;
            }
            impact.top_scorer_injured |= role.top_scorer;
            impact.captain_injured |= role.captain;
            impact.starting_gk_injured |= role.starting_goalkeeper;
        }
    }
    impact.impact_score = impact_score(&impact);
    impact
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiInjury {
    pub player: ApiPlayer,
    #[serde(default)]
    pub fixture: Option<ApiFixture>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiPlayer {
    #[serde(default)]
    pub id: Option<i64>,
    pub name: String,
    #[serde(rename = "type", default)]
    pub kind: Option<String>,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub position: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiFixture {
    #[serde(default)]
    pub date: Option<String>,
}

impl ApiInjury {
    fn fixture_date(&self) -> Option<NaiveDate> {
        let raw = self.fixture.as_ref()?.date.as_deref()?;
        DateTime::parse_from_rfc3339(raw)
            .ok()
            .map(|d| d.with_timezone(&Utc).date_naive())
    }
}

fn has_errors(errors: &Value) -> bool {
    match errors {
        Value::Null => false,
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
        _ => true,
    }
}

const RATE_LIMIT_KEYS: &[&str] = &["requests", "rateLimit"];

/// API-Football answers an exhausted plan with HTTP 200 and an `errors.requests` or
/// `errors.rateLimit` entry.
fn is_rate_limited(errors: &Value) -> bool {
    let keyed = |value: &Value| {
        value
            .as_object()
            .is_some_and(|map| RATE_LIMIT_KEYS.iter().any(|key| map.contains_key(*key)))
    };
    match errors {
        Value::Array(items) => items.iter().any(keyed),
        other => keyed(other),
    }
}

/// Entries that do not deserialize are counted and skipped.
pub fn parse_injuries(body: &str) -> Result<(Vec<ApiInjury>, usize), AdapterError> {
    let envelope: Value = serde_json::from_str(body)
        .map_err(|e| AdapterError::Message(format!("injury payload is not JSON: {e}")))?;
    if let Some(errors) = envelope.get("errors").filter(|e| has_errors(e)) {
        if is_rate_limited(errors) {
            return Err(AdapterError::QuotaExhausted(errors.to_string()));
        }
        return Err(AdapterError::Message(format!("provider reported errors: {errors}")));
    }
    let items = envelope
        .get("response")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();

    let mut entries = Vec::with_capacity(items.len());
    let mut invalid = 0usize;
    for item in items {
        match serde_json::from_value::<ApiInjury>(item) {
            Ok(entry) => entries.push(entry),
            Err(err) => {
                debug!(error = %err, "skipping malformed injury entry");
                invalid += 1;
            }
        }
    }
    Ok((entries, invalid))
}

/// Remaining daily calls from a `/v3/status` body.
pub fn parse_status_remaining(body: &str) -> Option<u32> {
    let value: Value = serde_json::from_str(body).ok()?;
    let requests = value.get("response")?.get("requests")?;
    let current = requests.get("current")?.as_u64()?;
    let limit = requests.get("limit_day")?.as_u64()?;
    u32::try_from(limit.saturating_sub(current)).ok()
}

/// One row per player (latest fixture wins), suspensions dropped.
pub fn build_active_set(
    team_id: Uuid,
    entries: &[ApiInjury],
    synced_at: DateTime<Utc>,
) -> Vec<PlayerInjury> {
    let mut latest: HashMap<String, &ApiInjury> = HashMap::new();
    for entry in entries {
        let key = entry
            .player
            .id
            .map(|id| id.to_string())
            .unwrap_or_else(|| entry.player.name.to_lowercase());
        let keep = latest
            .get(&key)
            .map(|seen| entry.fixture_date() > seen.fixture_date())
            .unwrap_or(true);
        if keep {
            latest.insert(key, entry);
        }
    }

    let mut injuries: Vec<PlayerInjury> = latest
        .into_values()
        .filter_map(|entry| {
            let reason = entry.player.reason.clone().unwrap_or_default();
            if is_suspension(&reason) {
                return None;
            }
            let severity = classify_severity(&reason);
            let is_doubtful = entry
                .player
                .kind
                .as_deref()
                .map(|k| DOUBTFUL_TYPES.contains(&k.trim().to_lowercase().as_str()))
                .unwrap_or(false);
            let injury_date = entry.fixture_date();
            Some(PlayerInjury {
                id: Uuid::new_v4(),
                team_id,
                player_external_id: entry.player.id,
                player_name: entry.player.name.clone(),
                position: classify_position(entry.player.position.as_deref()),
                reason,
                severity,
                is_doubtful,
                injury_date,
                expected_return: expected_return(injury_date, severity, is_doubtful),
                is_active: true,
                synced_at,
            })
        })
        .collect();
    injuries.sort_by(|a, b| a.player_name.cmp(&b.player_name));
    injuries
}

#[derive(Debug, Clone, Copy)]
struct Candidate {
    team_id: Uuid,
    external_id: i64,
}

pub struct InjuryAdapter {
    http: Arc<HttpFetcher>,
    store: Arc<DataStore>,
    governor: Arc<QuotaGovernor>,
    config: InjuryAdapterConfig,
}

impl InjuryAdapter {
    pub fn new(
        http: Arc<HttpFetcher>,
        store: Arc<DataStore>,
        governor: Arc<QuotaGovernor>,
        config: InjuryAdapterConfig,
    ) -> Self {
        Self {
            http,
            store,
            governor,
            config,
        }
    }

    /// Latest daily snapshot on or before `date`.
    pub async fn injuries_as_of(&self, team_id: Uuid, date: NaiveDate) -> Option<TeamInjurySnapshot> {
        self.store
            .read(|t| {
                t.injury_snapshots
                    .iter()
                    .filter(|s| s.team_id == team_id && s.snapshot_date <= date)
                    .max_by_key(|s| s.snapshot_date)
                    .cloned()
            })
            .await
    }

    pub async fn active_injuries(&self, team_id: Uuid) -> Vec<PlayerInjury> {
        self.store
            .read(|t| {
                t.player_injuries
                    .iter()
                    .filter(|i| i.team_id == team_id && i.is_active)
                    .cloned()
                    .collect()
            })
            .await
    }

    fn headers(&self) -> [(&str, &str); 1] {
        [(API_KEY_HEADER, self.config.api_key.as_str())]
    }

    /// Stale teams playing in `[now, now + lookahead]`, earliest kickoff first, plus the
    /// number of fixtures inside the next 24 hours.
    async fn candidates(&self, now: DateTime<Utc>) -> (Vec<Candidate>, u32) {
        let horizon = now + Duration::days(self.config.lookahead_days);
        let imminent_until = now + Duration::hours(24);
        let stale_before = now - Duration::hours(self.config.staleness_hours);
        let competition = self.config.competition.clone();

        self.store
            .read(|t| {
                let mut upcoming: Vec<_> = t
                    .matches
                    .iter()
                    .filter(|m| m.kickoff_utc >= now && m.kickoff_utc <= horizon)
                    .filter(|m| {
                        competition
                            .as_deref()
                            .map(|c| m.competition_code == c)
                            .unwrap_or(true)
                    })
                    .collect();
                upcoming.sort_by_key(|m| m.kickoff_utc);
                let imminent = upcoming
                    .iter()
                    .filter(|m| m.kickoff_utc <= imminent_until)
                    .count() as u32;

                let mut seen = Vec::new();
                let mut candidates = Vec::new();
                for team_id in upcoming
                    .iter()
                    .flat_map(|m| [m.home_team_id, m.away_team_id])
                {
                    if seen.contains(&team_id) {
                        continue;
                    }
                    seen.push(team_id);
                    let Some(external_id) = t.team(team_id).and_then(|team| team.external_id)
                    else {
                        continue;
                    };
                    let fresh = t
                        .team_injuries
                        .iter()
                        .any(|ti| ti.team_id == team_id && ti.last_synced_at > stale_before);
                    if !fresh {
                        candidates.push(Candidate {
                            team_id,
                            external_id,
                        });
                    }
                }
                (candidates, imminent)
            })
            .await
    }

    async fn reported_remaining(&self, cancel: &CancelToken) -> Result<Option<u32>, AdapterError> {
        let url = format!("{}/v3/status", self.config.base_url.trim_end_matches('/'));
        match self.http.fetch_text(API_FOOTBALL, &url, &self.headers(), cancel).await {
            Ok(body) => {
                let remaining = parse_status_remaining(&body);
                if remaining.is_none() {
                    warn!("unparseable API-Football status; using local quota counter");
                }
                Ok(remaining)
            }
            Err(err) => {
                let err = AdapterError::from(err);
                if err.is_cancelled() {
                    return Err(err);
                }
                warn!(error = %err, "API-Football status check failed; using local quota counter");
                Ok(None)
            }
        }
    }

    async fn store_team(
        &self,
        team_id: Uuid,
        entries: &[ApiInjury],
        now: DateTime<Utc>,
    ) -> anyhow::Result<InjuryImpact> {
        let injuries = build_active_set(team_id, entries, now);
        let today = now.date_naive();

        let impact = self
            .store
            .write(|t| {
                t.player_injuries.retain(|i| !(i.team_id == team_id && i.is_active));
                let impact = summarize(&injuries, &t.player_roles);
                t.player_injuries.extend(injuries);

                match t.team_injuries.iter_mut().find(|ti| ti.team_id == team_id) {
                    Some(current) => {
                        current.impact = impact.clone();
                        current.last_synced_at = now;
                    }
                    None => t.team_injuries.push(TeamInjuries {
                        team_id,
                        impact: impact.clone(),
                        last_synced_at: now,
                    }),
                }
                match t
                    .injury_snapshots
                    .iter_mut()
                    .find(|s| s.team_id == team_id && s.snapshot_date == today)
                {
                    Some(snapshot) => {
                        snapshot.impact = impact.clone();
                        snapshot.captured_at = now;
                    }
                    None => t.injury_snapshots.push(TeamInjurySnapshot {
                        id: Uuid::new_v4(),
                        team_id,
                        snapshot_date: today,
                        impact: impact.clone(),
                        captured_at: now,
                    }),
                }
                impact
            })
            .await;
        self.store.save().await?;
        Ok(impact)
    }

    pub async fn sync_upcoming_at(
        &self,
        now: DateTime<Utc>,
        cancel: &CancelToken,
    ) -> Result<SyncOutcome, AdapterError> {
        let (candidates, imminent) = self.candidates(now).await;
        if candidates.is_empty() {
            info!("no teams need an injury refresh");
            return Ok(SyncOutcome::default());
        }

        let season = self
            .config
            .season
            .unwrap_or_else(|| season_for_date(now.date_naive()));
        let reported = self.reported_remaining(cancel).await?;
        let base = self.config.base_url.trim_end_matches('/').to_string();

        let mut outcome = SyncOutcome::default();
        let mut calls_made = 0u32;
        let mut refreshed = 0usize;
        let mut failures = 0usize;
        let mut last_error = None;

        for candidate in &candidates {
            if cancel.is_cancelled() {
                return Err(AdapterError::Cancelled);
            }
            let remaining = reported.map(|r| r.saturating_sub(calls_made));
            match self.governor.try_acquire(remaining, imminent).await {
                QuotaDecision::Granted { remaining } => {
                    debug!(remaining, team = candidate.external_id, "injury call granted");
                }
                QuotaDecision::Refused(reason) => {
                    info!(?reason, pending = candidates.len() - refreshed - failures, "injury quota exhausted; stopping run");
                    outcome.quota_stopped = true;
                    break;
                }
            }
            calls_made += 1;

            let url = format!(
                "{base}/v3/injuries?team={}&season={season}",
                candidate.external_id
            );
            let body = match self.http.fetch_text(API_FOOTBALL, &url, &self.headers(), cancel).await {
                Ok(body) => body,
                Err(err) => {
                    let err = AdapterError::from(err);
                    if err.is_cancelled() {
                        return Err(err);
                    }
                    warn!(
                        team = candidate.external_id,
                        transient = err.is_transient(),
                        error = %err,
                        "injury fetch failed"
                    );
                    failures += 1;
                    last_error = Some(err.to_string());
                    continue;
                }
            };
            let (entries, invalid) = match parse_injuries(&body) {
                Ok(parsed) => parsed,
                Err(AdapterError::QuotaExhausted(detail)) => {
                    info!(%detail, team = candidate.external_id, "provider reports quota exhausted; stopping run");
                    outcome.quota_stopped = true;
                    break;
                }
                Err(err) => {
                    warn!(team = candidate.external_id, error = %err, "injury payload rejected");
                    failures += 1;
                    last_error = Some(err.to_string());
                    continue;
                }
            };
            outcome.fetched += entries.len();
            outcome.invalid += invalid;

            let impact = self.store_team(candidate.team_id, &entries, now).await?;
            debug!(
                team = candidate.external_id,
                injured = impact.total_injured,
                score = impact.impact_score,
                "team injuries stored"
            );
            refreshed += 1;
        }
        outcome.upserted = refreshed;

        if refreshed == 0 && failures > 0 {
            return Err(AdapterError::Message(format!(
                "all {failures} injury fetches failed: {}",
                last_error.unwrap_or_default()
            )));
        }
        info!(
            teams = refreshed,
            failures,
            quota_stopped = outcome.quota_stopped,
            "injury sync finished"
        );
        Ok(outcome)
    }
}

#[async_trait]
impl ProviderAdapter for InjuryAdapter {
    fn integration(&self) -> &'static str {
        API_FOOTBALL
    }

    async fn sync_latest(&self, cancel: &CancelToken) -> Result<SyncOutcome, AdapterError> {
        self.sync_upcoming_at(Utc::now(), cancel).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quota::QuotaPolicy;
    use chrono::TimeZone;
    use kickoff_core::{Match, Team};
    use kickoff_storage::{HttpClientConfig, Tables};
    use std::path::Path;
    use wiremock::matchers::{header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn fixture(name: &str) -> String {
        let root = Path::new(env!("CARGO_MANIFEST_DIR")).join("../..");
        std::fs::read_to_string(root.join("fixtures/api-football").join(name))
            .expect("api-football fixture")
    }

    fn run_time() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 4, 9, 0, 0).single().unwrap()
    }

    fn roles(team_id: Uuid) -> Vec<PlayerRole> {
        vec![
            PlayerRole {
                team_id,
                player_external_id: 101,
                key_player: true,
                top_scorer: false,
                captain: false,
                starting_goalkeeper: false,
            },
            PlayerRole {
                team_id,
                player_external_id: 102,
                key_player: false,
                top_scorer: false,
                captain: false,
                starting_goalkeeper: true,
            },
        ]
    }

    fn tables() -> Tables {
        let mut arsenal = Team::new("Arsenal", None);
        arsenal.external_id = Some(42);
        let mut brentford = Team::new("Brentford", None);
        brentford.external_id = Some(55);
        let player_roles = roles(arsenal.id);
        let matches = vec![Match {
            id: Uuid::new_v4(),
            competition_code: "PL".into(),
            season: 2023,
            home_team_id: arsenal.id,
            away_team_id: brentford.id,
            kickoff_utc: run_time() + Duration::hours(30),
        }];
        Tables {
            teams: vec![arsenal, brentford],
            matches,
            player_roles,
            ..Default::default()
        }
    }

    fn adapter(server: &MockServer, store: Arc<DataStore>, policy: QuotaPolicy) -> InjuryAdapter {
        let http = Arc::new(HttpFetcher::new(HttpClientConfig::default()).unwrap());
        InjuryAdapter::new(
            http,
            store,
            Arc::new(QuotaGovernor::new(policy)),
            InjuryAdapterConfig {
                base_url: server.uri(),
                api_key: "test-key".into(),
                ..Default::default()
            },
        )
    }

    #[test]
    fn classification_rules() {
        assert_eq!(classify_position(Some("Attacker")), Position::Forward);
        assert_eq!(classify_position(Some("goalkeeper")), Position::Goalkeeper);
        assert_eq!(classify_position(None), Position::Unknown);
        assert_eq!(classify_severity("Cruciate Ligament Injury"), Severity::Severe);
        assert_eq!(classify_severity("Hamstring"), Severity::Moderate);
        assert_eq!(classify_severity("Illness"), Severity::Minor);
        assert_eq!(classify_severity("  "), Severity::Unknown);
        assert!(is_suspension("Suspended"));
        assert!(is_suspension("Red Card Suspension"));
        assert!(!is_suspension("Knee Injury"));
    }

    #[test]
    fn expected_return_offsets() {
        let day = NaiveDate::from_ymd_opt(2024, 3, 2).unwrap();
        assert_eq!(
            expected_return(Some(day), Severity::Severe, false),
            NaiveDate::from_ymd_opt(2024, 4, 16)
        );
        assert_eq!(
            expected_return(Some(day), Severity::Severe, true),
            NaiveDate::from_ymd_opt(2024, 3, 5)
        );
        assert_eq!(expected_return(None, Severity::Minor, false), None);
    }

    #[test]
    fn impact_of_key_forward_and_injured_keeper() {
        let team_id = Uuid::new_v4();
        let (entries, invalid) = parse_injuries(&fixture("injuries_team_42.json")).unwrap();
        assert_eq!((entries.len(), invalid), (4, 1));

        let active = build_active_set(team_id, &entries, run_time());
        assert_eq!(active.len(), 2);
        let keeper = active.iter().find(|i| i.player_external_id == Some(102)).unwrap();
        assert_eq!(keeper.position, Position::Goalkeeper);
        assert_eq!(keeper.severity, Severity::Severe);
        let winger = active.iter().find(|i| i.player_external_id == Some(101)).unwrap();
        assert_eq!(winger.injury_date, NaiveDate::from_ymd_opt(2024, 3, 2));
        assert_eq!(winger.expected_return, NaiveDate::from_ymd_opt(2024, 3, 7));

        let impact = summarize(&active, &roles(team_id));
        assert_eq!(impact.total_injured, 2);
        assert_eq!(impact.key_players_injured, 1);
        assert_eq!(impact.long_term_injuries, 1);
        assert!(impact.starting_gk_injured);
        assert_eq!(impact.impact_score, 48.0);
    }

    #[test]
    fn impact_is_capped() {
        let impact = InjuryImpact {
            total_injured: 12,
            key_players_injured: 4,
            ..Default::default()
        };
        assert_eq!(impact_score(&impact), 100.0);
    }

    #[test]
    fn provider_errors_reject_the_payload() {
        let body = r#"{"errors":{"token":"Error/Missing application key."},"response":[]}"#;
        assert!(parse_injuries(body).is_err());
        assert_eq!(parse_status_remaining(&fixture("status.json")), Some(88));
    }

    #[tokio::test]
    async fn refreshes_stale_teams_once_and_snapshots_the_day() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v3/status"))
            .respond_with(ResponseTemplate::new(200).set_body_string(fixture("status.json")))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v3/injuries"))
            .and(query_param("team", "42"))
            .and(query_param("season", "2023"))
            .and(header(API_KEY_HEADER, "test-key"))
            .respond_with(
                ResponseTemplate::new(200).set_body_string(fixture("injuries_team_42.json")),
            )
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v3/injuries"))
            .and(query_param("team", "55"))
            .respond_with(
                ResponseTemplate::new(200).set_body_string(r#"{"errors":[],"response":[]}"#),
            )
            .expect(1)
            .mount(&server)
            .await;

        let store = Arc::new(DataStore::with_tables(tables()));
        let adapter = adapter(&server, store.clone(), QuotaPolicy::default());
        let cancel = CancelToken::new();

        let outcome = adapter.sync_upcoming_at(run_time(), &cancel).await.unwrap();
        assert_eq!(outcome.upserted, 2);
        assert!(!outcome.quota_stopped);

        // Both teams are now fresh, so a second pass makes no injury calls.
        let again = adapter.sync_upcoming_at(run_time(), &cancel).await.unwrap();
        assert_eq!(again.upserted, 0);

        let arsenal = store.read(|t| t.teams[0].id).await;
        assert_eq!(adapter.active_injuries(arsenal).await.len(), 2);
        let snapshot = adapter
            .injuries_as_of(arsenal, run_time().date_naive())
            .await
            .unwrap();
        assert_eq!(snapshot.impact.impact_score, 48.0);
        let yesterday = run_time().date_naive() - Duration::days(1);
        assert!(adapter.injuries_as_of(arsenal, yesterday).await.is_none());
        assert_eq!(store.read(|t| t.injury_snapshots.len()).await, 2);
    }

    #[tokio::test]
    async fn fully_reserved_budget_makes_no_injury_calls() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v3/status"))
            .respond_with(ResponseTemplate::new(200).set_body_string(fixture("status.json")))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v3/injuries"))
            .respond_with(ResponseTemplate::new(200).set_body_string("{}"))
            .expect(0)
            .mount(&server)
            .await;

        let store = Arc::new(DataStore::with_tables(tables()));
        let policy = QuotaPolicy {
            hard_daily_limit: 10,
            operational_cap: 10,
            max_calls_per_day: 10,
            safety_reserve: 10,
        };
        let outcome = adapter(&server, store, policy)
            .sync_upcoming_at(run_time(), &CancelToken::new())
            .await
            .unwrap();
        assert!(outcome.quota_stopped);
        assert_eq!(outcome.upserted, 0);
    }

    #[tokio::test]
    async fn provider_rate_limit_payload_stops_the_run() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v3/status"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v3/injuries"))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                r#"{"errors":{"requests":"You have reached the request limit for the day"},"response":[]}"#,
            ))
            .expect(1)
            .mount(&server)
            .await;

        let store = Arc::new(DataStore::with_tables(tables()));
        let outcome = adapter(&server, store.clone(), QuotaPolicy::default())
            .sync_upcoming_at(run_time(), &CancelToken::new())
            .await
            .unwrap();
        assert!(outcome.quota_stopped);
        assert_eq!(outcome.upserted, 0);
        assert!(store.read(|t| t.team_injuries.is_empty()).await);
    }

    #[test]
    fn only_request_limit_errors_count_as_quota() {
        let limited = parse_injuries(r#"{"errors":{"rateLimit":"Too many requests"}}"#);
        assert!(matches!(limited, Err(AdapterError::QuotaExhausted(_))));
        let other = parse_injuries(r#"{"errors":{"token":"Missing application key"}}"#);
        assert!(matches!(other, Err(AdapterError::Message(_))));
    }

    #[tokio::test]
    async fn unreachable_status_falls_back_to_local_counter() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v3/status"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v3/injuries"))
            .respond_with(
                ResponseTemplate::new(200).set_body_string(r#"{"errors":[],"response":[]}"#),
            )
            .expect(2)
            .mount(&server)
            .await;

        let store = Arc::new(DataStore::with_tables(tables()));
        let outcome = adapter(&server, store, QuotaPolicy::default())
            .sync_upcoming_at(run_time(), &CancelToken::new())
            .await
            .unwrap();
        assert_eq!(outcome.upserted, 2);
    }
}
