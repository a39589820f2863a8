//! ClubElo daily ratings (`GET {base}/{yyyy-MM-dd}`, CSV).

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use kickoff_core::{CancelToken, DataQualityReport, TeamEloRating, CLUB_ELO, GLOBAL_SCOPE};
use kickoff_storage::{DataStore, FetchError, HttpFetcher};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::teams::resolve_team;
use crate::{AdapterError, CsvTable, DailyAdapter, ProviderAdapter, SyncOutcome};

#[derive(Debug, Clone, PartialEq)]
pub struct EloRow {
    pub rank: Option<u32>,
    pub club: String,
    pub country: Option<String>,
    pub elo: f64,
}

/// Top-flight rows only; rows with an unusable level or rating are counted as invalid.
pub fn parse_elo_csv(text: &str) -> (Vec<EloRow>, usize) {
    let table = CsvTable::parse(text);
    let mut rows = Vec::new();
    let mut invalid = 0usize;

    for row in table.rows() {
        let Some(level) = row.parse::<u32>("Level") else {
            invalid += 1;
            continue;
        };
        if level != 1 {
            continue;
        }
        let (Some(club), Some(elo)) = (row.get("Club"), row.parse::<f64>("Elo")) else {
            invalid += 1;
            continue;
        };
        if !elo.is_finite() {
            invalid += 1;
            continue;
        }
        rows.push(EloRow {
            rank: row.parse("Rank"),
            club: club.to_string(),
            country: row.get("Country").map(ToString::to_string),
            elo,
        });
    }
    (rows, invalid)
}

pub struct EloAdapter {
    http: Arc<HttpFetcher>,
    store: Arc<DataStore>,
    base_url: String,
}

impl EloAdapter {
    pub fn new(http: Arc<HttpFetcher>, store: Arc<DataStore>, base_url: impl Into<String>) -> Self {
        Self {
            http,
            store,
            base_url: base_url.into(),
        }
    }

    pub async fn rating_as_of(&self, team_id: Uuid, as_of: NaiveDate) -> Option<TeamEloRating> {
        self.store
            .read(|t| {
                t.elo_ratings
                    .iter()
                    .filter(|r| r.team_id == team_id && r.rating_date <= as_of)
                    .max_by_key(|r| r.rating_date)
                    .cloned()
            })
            .await
    }

    async fn import_date(
        &self,
        date: NaiveDate,
        cancel: &CancelToken,
    ) -> Result<SyncOutcome, AdapterError> {
        let url = format!(
            "{}/{}",
            self.base_url.trim_end_matches('/'),
            date.format("%Y-%m-%d")
        );
        let text = match self.http.fetch_text(CLUB_ELO, &url, &[], cancel).await {
            Ok(text) => text,
            Err(FetchError::NotFound { url }) => {
                warn!(%date, %url, "no Elo ratings published for date");
                return Ok(SyncOutcome::no_data());
            }
            Err(err) => return Err(err.into()),
        };

        let (rows, invalid) = parse_elo_csv(&text);
        let teams = self.store.read(|t| t.teams.clone()).await;
        let mut outcome = SyncOutcome {
            fetched: rows.len(),
            invalid,
            ..Default::default()
        };

        let mut resolved = Vec::new();
        for row in rows {
            match resolve_team(&row.club, &teams) {
                Some(team) => resolved.push((team.id, row)),
                None => {
                    debug!(club = %row.club, "no canonical team for Elo club");
                    outcome.unmatched += 1;
                }
            }
        }

        let now = Utc::now();
        outcome.upserted = self
            .store
            .write(|t| {
                for (team_id, row) in &resolved {
                    match t
                        .elo_ratings
                        .iter_mut()
                        .find(|r| r.team_id == *team_id && r.rating_date == date)
                    {
                        Some(existing) => {
                            existing.elo = row.elo;
                            existing.rank = row.rank;
                            existing.country = row.country.clone();
                            existing.synced_at = now;
                        }
                        None => t.elo_ratings.push(TeamEloRating {
                            id: Uuid::new_v4(),
                            team_id: *team_id,
                            rating_date: date,
                            elo: row.elo,
                            rank: row.rank,
                            country: row.country.clone(),
                            synced_at: now,
                        }),
                    }
                }
                resolved.len()
            })
            .await;
        self.store.save().await?;

        info!(
            %date,
            fetched = outcome.fetched,
            upserted = outcome.upserted,
            unmatched = outcome.unmatched,
            invalid = outcome.invalid,
            "Elo ratings imported"
        );
        Ok(outcome)
    }
}

#[async_trait]
impl ProviderAdapter for EloAdapter {
    fn integration(&self) -> &'static str {
        CLUB_ELO
    }

    fn checkpoint_source(&self) -> &'static str {
        "Elo"
    }

    async fn sync_latest(&self, cancel: &CancelToken) -> Result<SyncOutcome, AdapterError> {
        self.import_date(Utc::now().date_naive(), cancel).await
    }
}

#[async_trait]
impl DailyAdapter for EloAdapter {
    async fn sync_date(
        &self,
        date: NaiveDate,
        cancel: &CancelToken,
    ) -> Result<SyncOutcome, AdapterError> {
        self.import_date(date, cancel).await
    }

    async fn date_quality(&self, date: NaiveDate, _outcome: &SyncOutcome) -> DataQualityReport {
        let (expected, available) = self
            .store
            .read(|t| {
                (
                    t.teams.len(),
                    t.elo_ratings.iter().filter(|r| r.rating_date == date).count(),
                )
            })
            .await;
        DataQualityReport::new(
            CLUB_ELO,
            format!("{GLOBAL_SCOPE}:{date}"),
            expected,
            available,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kickoff_core::Team;
    use kickoff_storage::{HttpClientConfig, Tables};
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const CSV: &str = "Rank,Club,Country,Level,Elo,From,To\n\
1,Man City,ENG,1,2051.7,2024-03-01,2024-03-03\n\
2,\"Arsenal\",ENG,1,1987.2,2024-03-01,2024-03-03\n\
None,Leeds,ENG,2,1650.0,2024-03-01,2024-03-03\n\
4,Spurs,ENG,1,not-a-number,2024-03-01,2024-03-03\n\
5,Real Madrid,ESP,1,1960.4,2024-03-01,2024-03-03\n";

    fn store() -> Arc<DataStore> {
        Arc::new(DataStore::with_tables(Tables {
            teams: vec![
                Team::new("Manchester City", Some("Man City")),
                Team::new("Arsenal", None),
                Team::new("Tottenham Hotspur", None),
            ],
            ..Default::default()
        }))
    }

    #[test]
    fn parser_keeps_top_flight_and_skips_bad_ratings() {
        let (rows, invalid) = parse_elo_csv(CSV);
        let clubs: Vec<&str> = rows.iter().map(|r| r.club.as_str()).collect();
        assert_eq!(clubs, vec!["Man City", "Arsenal", "Real Madrid"]);
        assert_eq!(invalid, 1);
        assert_eq!(rows[0].rank, Some(1));
    }

    #[tokio::test]
    async fn import_is_idempotent_and_queryable_as_of() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/2024-03-02"))
            .respond_with(ResponseTemplate::new(200).set_body_string(CSV))
            .expect(2)
            .mount(&server)
            .await;

        let store = store();
        let http = Arc::new(HttpFetcher::new(HttpClientConfig::default()).unwrap());
        let adapter = EloAdapter::new(http, store.clone(), server.uri());
        let date = NaiveDate::from_ymd_opt(2024, 3, 2).unwrap();
        let cancel = CancelToken::new();

        let first = adapter.sync_date(date, &cancel).await.unwrap();
        let rows_after_first = store.read(|t| t.elo_ratings.len()).await;
        let second = adapter.sync_date(date, &cancel).await.unwrap();
        let rows_after_second = store.read(|t| t.elo_ratings.len()).await;

        assert_eq!(first.upserted, 2);
        assert_eq!(first.unmatched, 1);
        assert_eq!(second, first);
        assert_eq!(rows_after_first, 2);
        assert_eq!(rows_after_second, rows_after_first);

        let city = store.read(|t| t.teams[0].id).await;
        let later = NaiveDate::from_ymd_opt(2024, 4, 1).unwrap();
        let earlier = NaiveDate::from_ymd_opt(2024, 3, 1).unwrap();
        assert_eq!(adapter.rating_as_of(city, later).await.unwrap().elo, 2051.7);
        assert!(adapter.rating_as_of(city, earlier).await.is_none());

        let report = adapter.date_quality(date, &first).await;
        assert_eq!((report.expected, report.available), (3, 2));
    }

    #[tokio::test]
    async fn missing_date_is_no_data() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        let http = Arc::new(HttpFetcher::new(HttpClientConfig::default()).unwrap());
        let adapter = EloAdapter::new(http, store(), server.uri());
        let outcome = adapter
            .sync_date(NaiveDate::from_ymd_opt(2030, 1, 1).unwrap(), &CancelToken::new())
            .await
            .unwrap();
        assert!(outcome.no_data);
    }
}
