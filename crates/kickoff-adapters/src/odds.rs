//! football-data.co.uk season CSVs: closing 1X2 odds plus the secondary match stats.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use kickoff_core::{
    season_for_date, CancelToken, DataQualityReport, Match, MatchOdds, MatchStatLine, MatchStats,
    Outcome, FOOTBALL_DATA_UK,
};
use kickoff_storage::{DataStore, FetchError, HttpFetcher};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::teams::resolve_team;
use crate::{
    AdapterError, CompetitionSweep, CsvRow, CsvTable, ProviderAdapter, SeasonalAdapter, SyncOutcome,
};

const REQUIRED_COLUMNS: &[&str] = &["Date", "HomeTeam", "AwayTeam"];

/// Bookmaker column prefixes in order of preference.
const ODDS_PREFIXES: &[&str] = &["B365", "BW", "PS", "Avg", "BbAv"];

/// Kickoff may fall this many days before / after the CSV date.
const WINDOW_DAYS_BEFORE: i64 = 1;
const WINDOW_DAYS_AFTER: i64 = 2;

pub fn football_data_file(competition: &str) -> Option<&'static str> {
    match competition {
        "PL" => Some("E0"),
        "PD" => Some("SP1"),
        "BL1" => Some("D1"),
        "SA" => Some("I1"),
        "FL1" => Some("F1"),
        "ELC" => Some("E1"),
        "DED" => Some("N1"),
        "PPL" => Some("P1"),
        _ => None,
    }
}

/// `2023` becomes `2324`.
pub fn season_code(season: i32) -> String {
    format!(
        "{:02}{:02}",
        season.rem_euclid(100),
        (season + 1).rem_euclid(100)
    )
}

pub fn parse_match_date(raw: &str) -> Option<NaiveDate> {
    let raw = raw.trim();
    let year_digits = raw.rsplit('/').next().map(str::len).unwrap_or(0);
    let format = if year_digits == 4 { "%d/%m/%Y" } else { "%d/%m/%y" };
    NaiveDate::parse_from_str(raw, format).ok()
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ImpliedProbabilities {
    pub home: f64,
    pub draw: f64,
    pub away: f64,
    pub overround: f64,
    pub favorite: Outcome,
}

pub fn implied_probabilities(home: f64, draw: f64, away: f64) -> Option<ImpliedProbabilities> {
    let odds = [home, draw, away];
    if odds.iter().any(|o| !o.is_finite() || *o <= 0.0) {
        return None;
    }
    let raw = odds.map(|o| 1.0 / o);
    let total: f64 = raw.iter().sum();

    let favorite = if raw[0] >= raw[1] && raw[0] >= raw[2] {
        Outcome::Home
    } else if raw[1] >= raw[2] {
        Outcome::Draw
    } else {
        Outcome::Away
    };
    Some(ImpliedProbabilities {
        home: raw[0] / total,
        draw: raw[1] / total,
        away: raw[2] / total,
        overround: total - 1.0,
        favorite,
    })
}

#[derive(Debug, Clone, PartialEq)]
pub struct OddsRow {
    pub date: NaiveDate,
    pub home_team: String,
    pub away_team: String,
    pub bookmaker: String,
    pub home_odds: f64,
    pub draw_odds: f64,
    pub away_odds: f64,
    pub stats: MatchStatLine,
}

fn price(row: &CsvRow<'_>, prefix: &str, side: char) -> Option<f64> {
    row.parse::<f64>(&format!("{prefix}{side}"))
        .filter(|o| o.is_finite() && *o > 0.0)
}

fn first_price(row: &CsvRow<'_>, side: char) -> Option<(&'static str, f64)> {
    ODDS_PREFIXES
        .iter()
        .find_map(|prefix| price(row, prefix, side).map(|o| (*prefix, o)))
}

/// Home, draw and away prices from the first bookmaker quoting all three. Rows where no
/// single bookmaker does fall back to the first price per outcome, and the bookmaker
/// label lists every prefix used, e.g. `B365+BW`.
fn price_triple(row: &CsvRow<'_>) -> Option<(String, [f64; 3])> {
    let complete = ODDS_PREFIXES.iter().find_map(|prefix| {
        Some((
            prefix.to_string(),
            [
                price(row, prefix, 'H')?,
                price(row, prefix, 'D')?,
                price(row, prefix, 'A')?,
            ],
        ))
    });
    if complete.is_some() {
        return complete;
    }

    let (home_book, home) = first_price(row, 'H')?;
    let (draw_book, draw) = first_price(row, 'D')?;
    let (away_book, away) = first_price(row, 'A')?;
    let mut books: Vec<&str> = Vec::with_capacity(3);
    for book in [home_book, draw_book, away_book] {
        if !books.contains(&book) {
            books.push(book);
        }
    }
    Some((books.join("+"), [home, draw, away]))
}

fn stat_line(row: &CsvRow<'_>) -> MatchStatLine {
    MatchStatLine {
        home_goals: row.parse("FTHG"),
        away_goals: row.parse("FTAG"),
        home_shots: row.parse("HS"),
        away_shots: row.parse("AS"),
        home_shots_on_target: row.parse("HST"),
        away_shots_on_target: row.parse("AST"),
        home_corners: row.parse("HC"),
        away_corners: row.parse("AC"),
        home_fouls: row.parse("HF"),
        away_fouls: row.parse("AF"),
        home_yellow_cards: row.parse("HY"),
        away_yellow_cards: row.parse("AY"),
        home_red_cards: row.parse("HR"),
        away_red_cards: row.parse("AR"),
    }
}

/// `None` when the header lacks the fixture columns; otherwise the usable rows and the
/// number of rows dropped for an unparseable date, team or price.
pub fn parse_odds_csv(text: &str) -> Option<(Vec<OddsRow>, usize)> {
    let table = CsvTable::parse(text);
    if !table.has_columns(REQUIRED_COLUMNS) {
        return None;
    }

    let mut rows = Vec::new();
    let mut invalid = 0usize;
    for row in table.rows() {
        match odds_row(&row) {
            Some(r) => rows.push(r),
            None => invalid += 1,
        }
    }
    Some((rows, invalid))
}

fn odds_row(row: &CsvRow<'_>) -> Option<OddsRow> {
    let date = parse_match_date(row.get("Date")?)?;
    let home_team = row.get("HomeTeam")?;
    let away_team = row.get("AwayTeam")?;
    let (bookmaker, [home_odds, draw_odds, away_odds]) = price_triple(row)?;
    Some(OddsRow {
        date,
        home_team: home_team.to_string(),
        away_team: away_team.to_string(),
        bookmaker,
        home_odds,
        draw_odds,
        away_odds,
        stats: stat_line(row),
    })
}

/// Closest persisted fixture between the two teams whose kickoff date lies in the window
/// around `date`.
pub fn find_match<'a>(
    matches: &'a [Match],
    home_team_id: Uuid,
    away_team_id: Uuid,
    date: NaiveDate,
) -> Option<&'a Match> {
    matches
        .iter()
        .filter(|m| m.home_team_id == home_team_id && m.away_team_id == away_team_id)
        .filter_map(|m| {
            let offset = (m.kickoff_utc.date_naive() - date).num_days();
            (-WINDOW_DAYS_BEFORE..=WINDOW_DAYS_AFTER)
                .contains(&offset)
                .then_some((m, offset.abs()))
        })
        .min_by_key(|(_, distance)| *distance)
        .map(|(m, _)| m)
}

pub struct OddsAdapter {
    http: Arc<HttpFetcher>,
    store: Arc<DataStore>,
    base_url: String,
    competitions: Vec<String>,
}

impl OddsAdapter {
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

    pub async fn odds_for_match(&self, match_id: Uuid) -> Option<MatchOdds> {
        self.store
            .read(|t| t.match_odds.iter().find(|o| o.match_id == match_id).cloned())
            .await
    }

    pub async fn stats_for_match(&self, match_id: Uuid) -> Option<MatchStats> {
        self.store
            .read(|t| t.match_stats.iter().find(|s| s.match_id == match_id).cloned())
            .await
    }

    async fn import_season(
        &self,
        competition: &str,
        season: i32,
        cancel: &CancelToken,
    ) -> Result<SyncOutcome, AdapterError> {
        let file = football_data_file(competition).ok_or_else(|| {
            AdapterError::Message(format!("no football-data file for competition {competition}"))
        })?;
        let url = format!(
            "{}/mmz4281/{}/{file}.csv",
            self.base_url.trim_end_matches('/'),
            season_code(season)
        );
        let text = match self.http.fetch_text(FOOTBALL_DATA_UK, &url, &[], cancel).await {
            Ok(text) => text,
            Err(FetchError::NotFound { url }) => {
                warn!(competition, season, %url, "no football-data CSV for season");
                return Ok(SyncOutcome::no_data());
            }
            Err(err) => return Err(err.into()),
        };

        let Some((rows, invalid)) = parse_odds_csv(&text) else {
            warn!(competition, season, %url, "football-data CSV is missing fixture columns");
            return Ok(SyncOutcome::no_data());
        };

        let (teams, matches) = self
            .store
            .read(|t| {
                let matches: Vec<Match> = t
                    .matches
                    .iter()
                    .filter(|m| m.competition_code == competition)
                    .cloned()
                    .collect();
                (t.teams_in_competition(competition), matches)
            })
            .await;

        let mut outcome = SyncOutcome {
            fetched: rows.len(),
            invalid,
            ..Default::default()
        };
        let mut resolved = Vec::new();
        for row in rows {
            let home = resolve_team(&row.home_team, &teams);
            let away = resolve_team(&row.away_team, &teams);
            let (Some(home), Some(away)) = (home, away) else {
                debug!(home = %row.home_team, away = %row.away_team, "unresolved football-data teams");
                outcome.unmatched += 1;
                continue;
            };
            match find_match(&matches, home.id, away.id, row.date) {
                Some(m) => resolved.push((m.id, row)),
                None => {
                    debug!(home = %home.name, away = %away.name, date = %row.date, "no persisted match near CSV date");
                    outcome.unmatched += 1;
                }
            }
        }

        let now = Utc::now();
        outcome.upserted = self
            .store
            .write(|t| {
                let mut upserted = 0usize;
                for (match_id, row) in &resolved {
                    let Some(implied) =
                        implied_probabilities(row.home_odds, row.draw_odds, row.away_odds)
                    else {
                        continue;
                    };
                    let odds = MatchOdds {
                        id: Uuid::new_v4(),
                        match_id: *match_id,
                        source: FOOTBALL_DATA_UK.to_string(),
                        bookmaker: row.bookmaker.clone(),
                        home_odds: row.home_odds,
                        draw_odds: row.draw_odds,
                        away_odds: row.away_odds,
                        home_probability: implied.home,
                        draw_probability: implied.draw,
                        away_probability: implied.away,
                        overround: implied.overround,
                        favorite: implied.favorite,
                        updated_at: now,
                    };
                    match t.match_odds.iter_mut().find(|o| o.match_id == *match_id) {
                        Some(existing) => *existing = MatchOdds { id: existing.id, ..odds },
                        None => t.match_odds.push(odds),
                    }
                    upserted += 1;

                    if row.stats.is_empty() {
                        continue;
                    }
                    match t.match_stats.iter_mut().find(|s| s.match_id == *match_id) {
                        Some(existing) => {
                            existing.line = row.stats.clone();
                            existing.updated_at = now;
                        }
                        None => t.match_stats.push(MatchStats {
                            id: Uuid::new_v4(),
                            match_id: *match_id,
                            line: row.stats.clone(),
                            updated_at: now,
                        }),
                    }
                }
                upserted
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
            "football-data odds imported"
        );
        Ok(outcome)
    }
}

#[async_trait]
impl ProviderAdapter for OddsAdapter {
    fn integration(&self) -> &'static str {
        FOOTBALL_DATA_UK
    }

    async fn sync_latest(&self, cancel: &CancelToken) -> Result<SyncOutcome, AdapterError> {
        let season = season_for_date(Utc::now().date_naive());
        let mut sweep = CompetitionSweep::new();
        for competition in &self.competitions {
            let result = self.import_season(competition, season, cancel).await;
            sweep.record(FOOTBALL_DATA_UK, competition, result)?;
        }
        sweep.finish()
    }
}

#[async_trait]
impl SeasonalAdapter for OddsAdapter {
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
        let (scheduled, with_odds) = self
            .store
            .read(|t| {
                let ids: Vec<Uuid> = t
                    .matches
                    .iter()
                    .filter(|m| m.competition_code == competition && m.season == season)
                    .map(|m| m.id)
                    .collect();
                let with_odds = t
                    .match_odds
                    .iter()
                    .filter(|o| ids.contains(&o.match_id))
                    .count();
                (ids.len(), with_odds)
            })
            .await;
        let (expected, available) = if scheduled == 0 {
            (outcome.fetched, outcome.upserted)
        } else {
            (scheduled, with_odds)
        };
        DataQualityReport::new(
            FOOTBALL_DATA_UK,
            format!("{competition}:{season}"),
            expected,
            available,
        )
    }
}
