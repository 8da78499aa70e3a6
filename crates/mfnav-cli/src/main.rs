use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::{Local, NaiveDate};
use clap::{Parser, Subcommand};
use mfnav_sync::{PipelineConfig, SyncPipeline};
use tracing::info;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "mfnav")]
#[command(about = "Mutual fund NAV warehouse: daily sync, backfill and masterdata")]
struct Cli {
    /// Overrides MFNAV_DATA_DIR.
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Fetch missing days, consolidate and refresh masterdata.
    Sync {
        #[arg(long)]
        today: Option<NaiveDate>,
    },
    /// Download the NAV history report for a date range into batch files.
    Backfill {
        #[arg(long)]
        from: NaiveDate,
        #[arg(long)]
        to: NaiveDate,
    },
    /// Rebuild the consolidated NAV table from local files.
    Consolidate,
    /// Fetch the scheme list and merge it into the masterdata.
    Masterdata {
        #[arg(long)]
        as_of: Option<NaiveDate>,
    },
    /// Print the weekdays that still need fetching.
    Gaps {
        #[arg(long)]
        today: Option<NaiveDate>,
    },
    /// Run the daily sync on the configured cron schedule until Ctrl-C.
    Schedule,
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!(
        "{}",
        serde_json::to_string_pretty(value).context("serializing summary")?
    );
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .from_env_lossy(),
        )
        .init();

    let cli = Cli::parse();
    let mut config = PipelineConfig::from_env();
    if let Some(dir) = cli.data_dir {
        config.data_dir = dir;
    }
    let today = Local::now().date_naive();
    info!(data_dir = %config.data_dir.display(), "starting mfnav");

    match cli.command.unwrap_or(Commands::Sync { today: None }) {
        Commands::Sync { today: run_day } => {
            let pipeline = SyncPipeline::new(config)?;
            let summary = pipeline.run_daily(run_day.unwrap_or(today)).await?;
            print_json(&summary)?;
        }
        Commands::Backfill { from, to } => {
            if from > to {
                bail!("--from {from} is after --to {to}");
            }
            let pipeline = SyncPipeline::new(config)?;
            let summary = pipeline.run_backfill(from, to).await?;
            print_json(&summary)?;
        }
        Commands::Consolidate => {
            let pipeline = SyncPipeline::new(config)?;
            let report = pipeline.consolidate_only().await?;
            print_json(&report)?;
        }
        Commands::Masterdata { as_of } => {
            let pipeline = SyncPipeline::new(config)?;
            let summary = pipeline.masterdata_only(as_of.unwrap_or(today)).await?;
            print_json(&summary)?;
        }
        Commands::Gaps { today: run_day } => {
            let pipeline = SyncPipeline::new(config)?;
            for date in pipeline.gaps(run_day.unwrap_or(today)).await? {
                println!("{date}");
            }
        }
        Commands::Schedule => {
            config.scheduler_enabled = true;
            let pipeline = Arc::new(SyncPipeline::new(config)?);
            let Some(sched) = pipeline.maybe_build_scheduler().await? else {
                bail!("scheduler could not be built");
            };
            sched.start().await.context("starting scheduler")?;
            info!(cron = %pipeline.config().sync_cron, "scheduler running; Ctrl-C to stop");
            tokio::signal::ctrl_c()
                .await
                .context("waiting for Ctrl-C")?;
        }
    }

    Ok(())
}
