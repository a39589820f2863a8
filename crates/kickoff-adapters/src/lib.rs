//! Provider adapter contracts and the per-source adapters (Elo, xG, odds, injuries).

use async_trait::async_trait;
use chrono::NaiveDate;
use kickoff_core::{CancelToken, DataQualityReport};
use kickoff_storage::FetchError;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

pub mod elo;
pub mod injuries;
pub mod odds;
pub mod quota;
pub mod teams;
pub mod xg;

pub use elo::EloAdapter;
pub use injuries::{InjuryAdapter, InjuryAdapterConfig};
pub use odds::OddsAdapter;
pub use quota::{QuotaDecision, QuotaGovernor, QuotaPolicy, QuotaRefusal};
pub use teams::resolve_team;
pub use xg::XgAdapter;

pub const CRATE_NAME: &str = "kickoff-adapters";

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("{0}")]
    Message(String),
    #[error("sync cancelled")]
    Cancelled,
    #[error("provider quota exhausted: {0}")]
    QuotaExhausted(String),
    #[error(transparent)]
    Fetch(FetchError),
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

impl From<FetchError> for AdapterError {
    fn from(err: FetchError) -> Self {
        match err {
            FetchError::Cancelled => Self::Cancelled,
            other => Self::Fetch(other),
        }
    }
}

impl AdapterError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Timeouts, connect failures, 5xx and 429; worth retrying on the next pass.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Fetch(err) if err.is_transient())
    }
}

/// Row accounting for one adapter call.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncOutcome {
    pub fetched: usize,
    pub upserted: usize,
    pub unmatched: usize,
    pub invalid: usize,
    pub no_data: bool,
    pub quota_stopped: bool,
}

impl SyncOutcome {
    pub fn no_data() -> Self {
        Self {
            no_data: true,
            ..Default::default()
        }
    }

    pub fn merge(&mut self, other: &SyncOutcome) {
        self.fetched += other.fetched;
        self.upserted += other.upserted;
        self.unmatched += other.unmatched;
        self.invalid += other.invalid;
        self.no_data &= other.no_data;
        self.quota_stopped |= other.quota_stopped;
    }
}

/// Totals for a pass over several competitions. A failed league is logged and skipped;
/// the pass fails only when every league failed.
#[derive(Debug, Default)]
pub struct CompetitionSweep {
    total: Option<SyncOutcome>,
    failures: usize,
    last_error: Option<String>,
}

impl CompetitionSweep {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cancellation is handed back to the caller; every other error is absorbed.
    pub fn record(
        &mut self,
        integration: &'static str,
        competition: &str,
        result: Result<SyncOutcome, AdapterError>,
    ) -> Result<(), AdapterError> {
        match result {
            Ok(outcome) => {
                self.total
                    .get_or_insert_with(SyncOutcome::no_data)
                    .merge(&outcome);
                Ok(())
            }
            Err(err) if err.is_cancelled() => Err(err),
            Err(err) => {
                warn!(
                    integration,
                    competition,
                    transient = err.is_transient(),
                    error = %err,
                    "competition sync failed; continuing with the next one"
                );
                self.failures += 1;
                self.last_error = Some(err.to_string());
                Ok(())
            }
        }
    }

    pub fn failures(&self) -> usize {
        self.failures
    }

    pub fn finish(self) -> Result<SyncOutcome, AdapterError> {
        match self.total {
            Some(total) => Ok(total),
            None if self.failures > 0 => Err(AdapterError::Message(format!(
                "all {} competitions failed: {}",
                self.failures,
                self.last_error.unwrap_or_default()
            ))),
            None => Ok(SyncOutcome::no_data()),
        }
    }
}

#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    /// Integration name used for health reporting.
    fn integration(&self) -> &'static str;

    /// Source segment of backfill checkpoint keys.
    fn checkpoint_source(&self) -> &'static str {
        self.integration()
    }

    async fn sync_latest(&self, cancel: &CancelToken) -> Result<SyncOutcome, AdapterError>;
}

/// Adapters whose unit of backfill is one season of one competition.
#[async_trait]
pub trait SeasonalAdapter: ProviderAdapter {
    fn competitions(&self) -> Vec<String>;

    async fn sync_season(
        &self,
        competition: &str,
        season: i32,
        cancel: &CancelToken,
    ) -> Result<SyncOutcome, AdapterError>;

    async fn season_quality(
        &self,
        competition: &str,
        season: i32,
        outcome: &SyncOutcome,
    ) -> DataQualityReport;
}

/// Adapters whose unit of backfill is one calendar day.
#[async_trait]
pub trait DailyAdapter: ProviderAdapter {
    async fn sync_date(
        &self,
        date: NaiveDate,
        cancel: &CancelToken,
    ) -> Result<SyncOutcome, AdapterError>;

    async fn date_quality(&self, date: NaiveDate, outcome: &SyncOutcome) -> DataQualityReport;
}

/// Splits one CSV line, honouring double-quoted fields and `""` escapes.
pub fn split_csv_line(line: &str) -> Vec<String> {
    let mut fields = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut chars = line.chars().peekable();

    while let Some(ch) = chars.next() {
        match ch {
            '"' if in_quotes && chars.peek() == Some(&'"') => {
                current.push('"');
                chars.next();
            }
            '"' => in_quotes = !in_quotes,
            ',' if !in_quotes => fields.push(std::mem::take(&mut current)),
            _ => current.push(ch),
        }
    }
    fields.push(current);
    fields
}

#[derive(Debug, Clone, Default)]
pub struct CsvTable {
    pub headers: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

impl CsvTable {
    pub fn parse(text: &str) -> Self {
        let mut lines = text
            .trim_start_matches('\u{feff}')
            .lines()
            .map(|l| l.trim_end_matches('\r'))
            .filter(|l| !l.trim().is_empty());
        let headers = lines
            .next()
            .map(|h| split_csv_line(h).into_iter().map(|s| s.trim().to_string()).collect())
            .unwrap_or_default();
        let rows = lines.map(split_csv_line).collect();
        Self { headers, rows }
    }

    pub fn column(&self, name: &str) -> Option<usize> {
        self.headers.iter().position(|h| h == name)
    }

    pub fn has_columns(&self, names: &[&str]) -> bool {
        names.iter().all(|n| self.column(n).is_some())
    }

    pub fn rows(&self) -> impl Iterator<Item = CsvRow<'_>> {
        self.rows.iter().map(move |cells| CsvRow { table: self, cells })
    }
}

#[derive(Debug, Clone, Copy)]
pub struct CsvRow<'a> {
    table: &'a CsvTable,
    cells: &'a [String],
}

impl<'a> CsvRow<'a> {
    /// Trimmed, non-empty cell under `column`.
    pub fn get(&self, column: &str) -> Option<&'a str> {
        let idx = self.table.column(column)?;
        let value = self.cells.get(idx)?.trim();
        if value.is_empty() {
            None
        } else {
            Some(value)
        }
    }

    pub fn parse<T: std::str::FromStr>(&self, column: &str) -> Option<T> {
        self.get(column)?.parse().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn csv_split_honours_quotes_and_embedded_commas() {
        assert_eq!(
            split_csv_line(r#"1,"Bayern, Munich",GER,1,"1990.5""#),
            vec!["1", "Bayern, Munich", "GER", "1", "1990.5"]
        );
        assert_eq!(split_csv_line(r#""say ""hi""",,x"#), vec![r#"say "hi""#, "", "x"]);
    }

    #[test]
    fn csv_table_reads_named_columns() {
        let table = CsvTable::parse("\u{feff}Date,HomeTeam,FTHG\r\n01/02/2024,Arsenal,2\r\n\r\n02/02/2024,Chelsea,\r\n");
        assert!(table.has_columns(&["Date", "HomeTeam"]));
        assert!(!table.has_columns(&["AwayTeam"]));
        let rows: Vec<_> = table.rows().collect();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].parse::<u32>("FTHG"), Some(2));
        assert_eq!(rows[1].get("FTHG"), None);
        assert_eq!(rows[1].get("Missing"), None);
    }

    #[test]
    fn cancelled_fetches_become_cancelled_adapter_errors() {
        assert!(AdapterError::from(FetchError::Cancelled).is_cancelled());
        let other = AdapterError::from(FetchError::NotFound { url: "x".into() });
        assert!(!other.is_cancelled());
    }

    #[test]
    fn sweep_skips_failed_competitions_but_not_cancellation() {
        let unavailable = || {
            AdapterError::from(FetchError::HttpStatus {
                status: 503,
                url: "x".into(),
            })
        };
        assert!(unavailable().is_transient());
        assert!(!AdapterError::Message("bad".into()).is_transient());

        let mut sweep = CompetitionSweep::new();
        sweep.record("Understat", "PL", Err(unavailable())).unwrap();
        sweep
            .record(
                "Understat",
                "PD",
                Ok(SyncOutcome {
                    fetched: 4,
                    upserted: 4,
                    ..Default::default()
                }),
            )
            .unwrap();
        let err = sweep
            .record("Understat", "SA", Err(AdapterError::Cancelled))
            .unwrap_err();
        assert!(err.is_cancelled());
        assert_eq!(sweep.failures(), 1);
        let total = sweep.finish().unwrap();
        assert_eq!((total.fetched, total.upserted, total.no_data), (4, 4, false));

        let mut failed = CompetitionSweep::new();
        failed.record("Understat", "PL", Err(unavailable())).unwrap();
        assert!(failed.finish().is_err());
        assert!(CompetitionSweep::new().finish().unwrap().no_data);
    }

    #[test]
    fn outcomes_merge() {
        let mut total = SyncOutcome::no_data();
        total.merge(&SyncOutcome {
            fetched: 3,
            upserted: 2,
            unmatched: 1,
            ..Default::default()
        });
        assert!(!total.no_data);
        assert_eq!((total.fetched, total.upserted, total.unmatched), (3, 2, 1));
    }
}
