//! Understat season xG tables, embedded in the league page as an escaped JSON literal.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use kickoff_core::{
    season_for_date, CancelToken, DataQualityReport, TeamXgStats, UNDERSTAT,
};
use kickoff_storage::{DataStore, FetchError, HttpFetcher};
use scraper::{Html, Selector};
use serde::Deserialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::teams::resolve_team;
use crate::{AdapterError, CompetitionSweep, ProviderAdapter, SeasonalAdapter, SyncOutcome};

const TEAMS_MARKER: &str = "teamsData";
const PARSE_OPEN: &str = "JSON.parse('";
const PARSE_CLOSE: &str = "')";
const ROLLING_WINDOW: usize = 5;

pub fn understat_league_slug(competition: &str) -> Option<&'static str> {
    match competition {
        "PL" => Some("EPL"),
        "PD" => Some("La_liga"),
        "BL1" => Some("Bundesliga"),
        "SA" => Some("Serie_A"),
        "FL1" => Some("Ligue_1"),
        _ => None,
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct UnderstatTeam {
    pub id: String,
    pub title: String,
    pub history: Vec<UnderstatMatch>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UnderstatMatch {
    #[serde(rename = "xG")]
    pub xg: f64,
    #[serde(rename = "xGA")]
    pub xga: f64,
    pub scored: u32,
    pub missed: u32,
    #[serde(default)]
    pub date: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct XgAggregate {
    pub matches_played: u32,
    pub xg_for: f64,
    pub xg_against: f64,
    pub goals_scored: u32,
    pub goals_conceded: u32,
    pub xg_for_last5: f64,
    pub xg_against_last5: f64,
}

impl UnderstatTeam {
    pub fn aggregate(&self) -> XgAggregate {
        let mut history: Vec<&UnderstatMatch> = self.history.iter().collect();
        history.sort_by(|a, b| a.date.cmp(&b.date));

        let recent = &history[history.len().saturating_sub(ROLLING_WINDOW)..];

        XgAggregate {
            matches_played: history.len() as u32,
            xg_for: history.iter().map(|m| m.xg).sum(),
            xg_against: history.iter().map(|m| m.xga).sum(),
            goals_scored: history.iter().map(|m| m.scored).sum(),
            goals_conceded: history.iter().map(|m| m.missed).sum(),
            xg_for_last5: mean(recent.iter().map(|m| m.xg)),
            xg_against_last5: mean(recent.iter().map(|m| m.xga)),
        }
    }
}

fn mean(values: impl ExactSizeIterator<Item = f64>) -> f64 {
    let n = values.len();
    if n == 0 {
        0.0
    } else {
        values.sum::<f64>() / n as f64
    }
}

/// Decodes the single-quoted JS literal: `\xHH` byte escapes, `\uHHHH`, and backslash escapes.
pub fn unescape_js_string(raw: &str) -> String {
    let mut out: Vec<u8> = Vec::with_capacity(raw.len());
    let mut buf = [0u8; 4];
    let mut chars = raw.chars();

    while let Some(c) = chars.next() {
        if c != '\\' {
            out.extend_from_slice(c.encode_utf8(&mut buf).as_bytes());
            continue;
        }
        match chars.next() {
            Some('x') => {
                let hex: String = chars.by_ref().take(2).collect();
                match u8::from_str_radix(&hex, 16) {
                    Ok(byte) => out.push(byte),
                    Err(_) => {
                        out.extend_from_slice(b"\\x");
                        out.extend_from_slice(hex.as_bytes());
                    }
                }
            }
            Some('u') => {
                let hex: String = chars.by_ref().take(4).collect();
                if let Some(ch) = u32::from_str_radix(&hex, 16).ok().and_then(char::from_u32) {
                    out.extend_from_slice(ch.encode_utf8(&mut buf).as_bytes());
                }
            }
            Some('n') => out.push(b'\n'),
            Some('t') => out.push(b'\t'),
            Some('r') => out.push(b'\r'),
            Some(other) => out.extend_from_slice(other.encode_utf8(&mut buf).as_bytes()),
            None => out.push(b'\\'),
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn literal_after_marker(text: &str) -> Option<&str> {
    let rest = &text[text.find(TEAMS_MARKER)?..];
    let start = rest.find(PARSE_OPEN)? + PARSE_OPEN.len();
    let len = rest[start..].find(PARSE_CLOSE)?;
    Some(&rest[start..start + len])
}

/// Unescaped `teamsData` JSON, looked up in `<script>` bodies first and the raw page second.
pub fn extract_teams_data(html: &str) -> Result<Option<String>, AdapterError> {
    let document = Html::parse_document(html);
    let sel = Selector::parse("script").map_err(|e| AdapterError::Message(e.to_string()))?;
    let from_scripts = document.select(&sel).find_map(|node| {
        let body = node.text().collect::<String>();
        literal_after_marker(&body).map(unescape_js_string)
    });
    Ok(from_scripts.or_else(|| literal_after_marker(html).map(unescape_js_string)))
}

/// Teams that fail to deserialize are counted, not fatal.
pub fn parse_teams_data(json: &str) -> Result<(Vec<UnderstatTeam>, usize), AdapterError> {
    let raw: BTreeMap<String, serde_json::Value> = serde_json::from_str(json)
        .map_err(|e| AdapterError::Message(format!("teamsData is not a JSON object: {e}")))?;
    let mut teams = Vec::with_capacity(raw.len());
    let mut invalid = 0usize;
    for (key, value) in raw {
        match serde_json::from_value::<UnderstatTeam>(value) {
            Ok(team) => teams.push(team),
            Err(err) => {
                debug!(team_key = %key, error = %err, "skipping malformed Understat team");
                invalid += 1;
            }
        }
    }
    Ok((teams, invalid))
}

pub struct XgAdapter {
    http: Arc<HttpFetcher>,
    store: Arc<DataStore>,
    base_url: String,
    competitions: Vec<String>,
}

impl XgAdapter {
    pub fn new(
        http: Arc<HttpFetcher>,
        store: Arc<DataStore>,
        base_url: impl Into<String>,
        competitions: Vec<String>,
    ) -> Self {
        Self {
            http,
            store,
            base_url: base_url.into(),
            competitions,
        }
    }

    /// Latest stored season row that had already been synced at `as_of`.
    pub async fn xg_as_of(&self, team_id: Uuid, as_of: DateTime<Utc>) -> Option<TeamXgStats> {
        let season_cap = season_for_date(as_of.date_naive());
        self.store
            .read(|t| {
                t.xg_stats
                    .iter()
                    .filter(|x| {
                        x.team_id == team_id && x.last_synced_at <= as_of && x.season <= season_cap
                    })
                    .max_by_key(|x| (x.season, x.last_synced_at))
                    .cloned()
            })
            .await
    }

    async fn import_season(
        &self,
        competition: &str,
        season: i32,
        cancel: &CancelToken,
    ) -> Result<SyncOutcome, AdapterError> {
        let slug = understat_league_slug(competition).ok_or_else(|| {
            AdapterError::Message(format!("no Understat league for competition {competition}"))
        })?;
        let url = format!(
            "{}/league/{slug}/{season}",
            self.base_url.trim_end_matches('/')
        );
        let html = match self.http.fetch_text(UNDERSTAT, &url, &[], cancel).await {
            Ok(html) => html,
            Err(FetchError::NotFound { url }) => {
                warn!(competition, season, %url, "no Understat page for season");
                return Ok(SyncOutcome::no_data());
            }
            Err(err) => return Err(err.into()),
        };

        let Some(json) = extract_teams_data(&html)? else {
            warn!(competition, season, "Understat page carries no teamsData");
            return Ok(SyncOutcome::no_data());
        };
        let (source_teams, invalid) = parse_teams_data(&json)?;
        let candidates = self.store.read(|t| t.teams_in_competition(competition)).await;

        let mut outcome = SyncOutcome {
            fetched: source_teams.len(),
            invalid,
            ..Default::default()
        };
        let mut resolved = Vec::new();
        for source in &source_teams {
            match resolve_team(&source.title, &candidates) {
                Some(team) => resolved.push((team.id, source.id.clone(), source.aggregate())),
                None => {
                    debug!(title = %source.title, "no canonical team for Understat team");
                    outcome.unmatched += 1;
                }
            }
        }

        let now = Utc::now();
        outcome.upserted = self
            .store
            .write(|t| {
                for (team_id, source_team_id, agg) in &resolved {
                    let existing = t.xg_stats.iter().position(|x| {
                        x.team_id == *team_id
                            && x.competition_code == competition
                            && x.season == season
                    });
                    let idx = match existing {
                        Some(idx) => idx,
                        None => {
                            t.xg_stats.push(TeamXgStats {
                                id: Uuid::new_v4(),
                                team_id: *team_id,
                                competition_code: competition.to_string(),
                                season,
                                source_team_id: String::new(),
                                matches_played: 0,
                                xg_for: 0.0,
                                xg_against: 0.0,
                                goals_scored: 0,
                                goals_conceded: 0,
                                xg_for_last5: 0.0,
                                xg_against_last5: 0.0,
                                last_synced_at: now,
                            });
                            t.xg_stats.len() - 1
                        }
                    };
                    let row = &mut t.xg_stats[idx];
                    row.source_team_id = source_team_id.clone();
                    row.matches_played = agg.matches_played;
                    row.xg_for = agg.xg_for;
                    row.xg_against = agg.xg_against;
                    row.goals_scored = agg.goals_scored;
                    row.goals_conceded = agg.goals_conceded;
                    row.xg_for_last5 = agg.xg_for_last5;
                    row.xg_against_last5 = agg.xg_against_last5;
                    row.last_synced_at = now;
                }
                resolved.len()
            })
            .await;
        self.store.save().await?;

        info!(
            competition,
            season,
            fetched = outcome.fetched,
            upserted = outcome.upserted,
            unmatched = outcome.unmatched,
            invalid = outcome.invalid,
            "Understat xG imported"
        );
        Ok(outcome)
    }
}

#[async_trait]
impl ProviderAdapter for XgAdapter {
    fn integration(&self) -> &'static str {
        UNDERSTAT
    }

    async fn sync_latest(&self, cancel: &CancelToken) -> Result<SyncOutcome, AdapterError> {
        let season = season_for_date(Utc::now().date_naive());
        let mut sweep = CompetitionSweep::new();
        for competition in &self.competitions {
            let result = self.import_season(competition, season, cancel).await;
            sweep.record(UNDERSTAT, competition, result)?;
        }
        sweep.finish()
    }
}

#[async_trait]
impl SeasonalAdapter for XgAdapter {
    fn competitions(&self) -> Vec<String> {
        self.competitions.clone()
    }

    async fn sync_season(
        &self,
        competition: &str,
        season: i32,
        cancel: &CancelToken,
    ) -> Result<SyncOutcome, AdapterError> {
        self.import_season(competition, season, cancel).await
    }

    async fn season_quality(
        &self,
        competition: &str,
        season: i32,
        outcome: &SyncOutcome,
    ) -> DataQualityReport {
        let available = self
            .store
            .read(|t| {
                t.xg_stats
                    .iter()
                    .filter(|x| x.competition_code == competition && x.season == season)
                    .count()
            })
            .await;
        DataQualityReport::new(
            UNDERSTAT,
            format!("{competition}:{season}"),
            outcome.fetched,
            available,
        )
    }
}
