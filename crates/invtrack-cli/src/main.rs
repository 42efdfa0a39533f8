use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use invtrack_feeds::parse_report_date;
use invtrack_sync::{FeedRunner, LogOutcome, SyncConfig};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "invtrack")]
#[command(about = "Exchange inventory tracker")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one feed snapshot through its source log and the dashboard.
    Ingest { snapshot: PathBuf },
    /// Write header rows for the dashboard and every source log.
    Init,
    /// Print the dashboard row for a data date.
    Show { date: String },
    /// Re-derive every dashboard row.
    Recompute,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    let cli = Cli::parse();
    let config = SyncConfig::from_env();

    match cli.command {
        Commands::Ingest { snapshot } => {
            let summary = invtrack_sync::run_feed_from_env(&snapshot).await?;
            let log = match &summary.log {
                Some(LogOutcome::Appended { row }) => format!("appended row {row}"),
                Some(LogOutcome::Duplicate { .. }) => "already logged".to_string(),
                None => "none".to_string(),
            };
            println!(
                "ingest complete: run_id={} source={} date={} log={} summary_row={} action={:?}",
                summary.run_id,
                summary.source_id,
                summary.data_date,
                log,
                summary.upsert.row,
                summary.upsert.action
            );
        }
        Commands::Init => {
            let runner = FeedRunner::from_config(&config)?;
            for (sheet, outcome) in runner.init_sheets().await? {
                println!("{sheet}: {outcome:?}");
            }
        }
        Commands::Show { date } => {
            let date = parse_report_date(&date).with_context(|| format!("parsing date {date:?}"))?;
            let runner = FeedRunner::from_config(&config)?;
            let engine = runner.engine();
            match engine.find_row(runner.summary_store(), date).await? {
                Some((index, row)) => {
                    let layout = engine.layout();
                    let derived = layout.derived_columns();
                    println!("row {index}");
                    for (i, (header, value)) in layout.headers().iter().zip(row.cells()).enumerate() {
                        let role = if layout.manual_columns().contains(&i) {
                            " (manual)"
                        } else if derived.contains(&i) {
                            " (derived)"
                        } else {
                            ""
                        };
                        println!("  {header}{role}: {value}");
                    }
                }
                None => println!("no dashboard row for {date}"),
            }
        }
        Commands::Recompute => {
            let runner = FeedRunner::from_config(&config)?;
            let summary = runner.engine().recompute_all(runner.summary_store()).await?;
            println!(
                "recompute complete: scanned={} rewritten={}",
                summary.rows_scanned, summary.rows_rewritten
            );
        }
    }

    Ok(())
}
