use anyhow::{bail, Context, Result};
use chrono::{NaiveDate, Utc};
use clap::{Parser, Subcommand};
use kickoff_core::{CancelToken, DataQualityReport};
use kickoff_sync::{is_cancelled, Pipeline, Source};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "kickoff")]
#[command(about = "Kickoff external football data sync")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one latest-data pass for a source (elo, xg, odds, injuries).
    Sync { source: Source },
    #[command(subcommand)]
    Backfill(BackfillCommand),
    /// Run every enabled schedule until Ctrl-C.
    Run,
    /// Print integration health.
    Status,
    /// Stop scheduled passes for a source until it is enabled again.
    Disable {
        source: Source,
        #[arg(long, default_value = "disabled manually")]
        reason: String,
    },
    Enable { source: Source },
}

#[derive(Debug, Subcommand)]
enum BackfillCommand {
    /// Season-by-season backfill for xg or odds.
    Seasons {
        source: Source,
        #[arg(long, conflicts_with = "all_competitions")]
        competition: Option<String>,
        #[arg(long)]
        all_competitions: bool,
        #[arg(long)]
        from: i32,
        #[arg(long)]
        to: i32,
    },
    /// Day-by-day Elo backfill.
    Elo {
        #[arg(long)]
        from_date: NaiveDate,
        #[arg(long)]
        to_date: NaiveDate,
    },
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .init();
}

/// Cancels the returned token on the first Ctrl-C.
fn cancel_on_ctrl_c() -> CancelToken {
    let cancel = CancelToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received; stopping after the current step");
            trigger.cancel();
        }
    });
    cancel
}

fn print_reports(reports: &[DataQualityReport]) {
    for report in reports {
        println!(
            "{:<12} {:<20} {:>5}/{:<5} coverage={:>6.2}% missing={:>6.2}%",
            report.source,
            report.scope,
            report.available,
            report.expected,
            report.coverage_percent,
            report.missing_rate_percent
        );
    }
}

async fn backfill(pipeline: &Pipeline, command: BackfillCommand, cancel: &CancelToken) -> Result<()> {
    let orchestrator = pipeline.orchestrator();
    let reports = match command {
        BackfillCommand::Seasons {
            source,
            competition,
            all_competitions,
            from,
            to,
        } => {
            let adapter = pipeline
                .seasonal(source)
                .with_context(|| format!("{source} has no season backfill"))?;
            match (competition, all_competitions) {
                (_, true) => {
                    orchestrator
                        .backfill_all_competitions(adapter.as_ref(), from, to, cancel)
                        .await?
                }
                (Some(competition), false) => {
                    orchestrator
                        .backfill_seasons(adapter.as_ref(), &competition, from, to, cancel)
                        .await?
                }
                (None, false) => bail!("pass --competition <CODE> or --all-competitions"),
            }
        }
        BackfillCommand::Elo { from_date, to_date } => {
            orchestrator
                .backfill_days(pipeline.daily().as_ref(), from_date, to_date, cancel)
                .await?
        }
    };
    print_reports(&reports);
    Ok(())
}

async fn status(pipeline: &Pipeline) {
    let mut statuses = pipeline.statuses().await;
    if statuses.is_empty() {
        println!("no integration has run yet");
        return;
    }
    statuses.sort_by(|a, b| a.name.cmp(&b.name));
    let now = Utc::now();
    for status in statuses {
        let state = match &status.disabled_reason {
            Some(reason) if status.manually_disabled => format!("disabled ({reason})"),
            _ if status.manually_disabled => "disabled".to_string(),
            _ => "enabled".to_string(),
        };
        println!(
            "{:<14} {:<9} {} stale={} failures={} ok_24h={} failed_24h={} last_success={} last_error={}",
            status.name,
            format!("{:?}", status.health),
            state,
            status.is_data_stale(now),
            status.consecutive_failures,
            status.successes_24h,
            status.failures_24h,
            status
                .last_success_at
                .map(|at| at.to_rfc3339())
                .unwrap_or_else(|| "-".to_string()),
            status.last_error_message.as_deref().unwrap_or("-"),
        );
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let pipeline = Pipeline::from_env().await?;
    let cancel = cancel_on_ctrl_c();

    let result = match cli.command.unwrap_or(Commands::Status) {
        Commands::Sync { source } => pipeline
            .driver(source)
            .run_once(&cancel)
            .await
            .map(|outcome| {
                println!(
                    "sync complete: source={} fetched={} upserted={} unmatched={} invalid={} no_data={} quota_stopped={}",
                    source,
                    outcome.fetched,
                    outcome.upserted,
                    outcome.unmatched,
                    outcome.invalid,
                    outcome.no_data,
                    outcome.quota_stopped
                );
            })
            .map_err(anyhow::Error::from),
        Commands::Backfill(command) => backfill(&pipeline, command, &cancel).await,
        Commands::Run => pipeline.run_scheduler(&cancel).await,
        Commands::Status => {
            status(&pipeline).await;
            Ok(())
        }
        Commands::Disable { source, reason } => {
            let integration = pipeline.adapter(source).integration();
            pipeline
                .store()
                .set_disabled(integration, Some(reason))
                .await
                .map(|()| println!("{integration} disabled"))
        }
        Commands::Enable { source } => {
            let integration = pipeline.adapter(source).integration();
            pipeline
                .store()
                .set_disabled(integration, None)
                .await
                .map(|()| println!("{integration} enabled"))
        }
    };

    match result {
        Err(err) if is_cancelled(&err) => {
            info!("stopped by interrupt; progress is checkpointed");
            Ok(())
        }
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_season_backfill() {
        let cli = Cli::try_parse_from([
            "kickoff",
            "backfill",
            "seasons",
            "xg",
            "--competition",
            "PL",
            "--from",
            "2021",
            "--to",
            "2023",
        ])
        .unwrap();
        match cli.command {
            Some(Commands::Backfill(BackfillCommand::Seasons {
                source,
                competition,
                all_competitions,
                from,
                to,
            })) => {
                assert_eq!(source, Source::Xg);
                assert_eq!(competition.as_deref(), Some("PL"));
                assert!(!all_competitions);
                assert_eq!((from, to), (2021, 2023));
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn competition_and_all_competitions_conflict() {
        let result = Cli::try_parse_from([
            "kickoff",
            "backfill",
            "seasons",
            "odds",
            "--competition",
            "PL",
            "--all-competitions",
            "--from",
            "2021",
            "--to",
            "2023",
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn disable_takes_an_optional_reason() {
        let cli = Cli::try_parse_from(["kickoff", "disable", "odds", "--reason", "feed moved"]).unwrap();
        match cli.command {
            Some(Commands::Disable { source, reason }) => {
                assert_eq!(source, Source::Odds);
                assert_eq!(reason, "feed moved");
            }
            other => panic!("unexpected command: {other:?}"),
        }
        let cli = Cli::try_parse_from(["kickoff", "disable", "xg"]).unwrap();
        assert!(matches!(
            cli.command,
            Some(Commands::Disable { ref reason, .. }) if reason == "disabled manually"
        ));
    }

    #[test]
    fn elo_backfill_takes_iso_dates() {
        let cli = Cli::try_parse_from([
            "kickoff",
            "backfill",
            "elo",
            "--from-date",
            "2024-03-01",
            "--to-date",
            "2024-03-03",
        ])
        .unwrap();
        assert!(matches!(
            cli.command,
            Some(Commands::Backfill(BackfillCommand::Elo { .. }))
        ));
        assert!(Cli::try_parse_from(["kickoff", "sync", "weather"]).is_err());
    }
}
