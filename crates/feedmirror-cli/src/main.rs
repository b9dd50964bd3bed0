use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use feedmirror_sync::{inspect_store, StoreBackend, SyncConfig, SyncPipeline};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const LOG_TARGETS: &[&str] = &[
    "feedmirror_cli",
    "feedmirror_sync",
    "feedmirror_adapters",
    "feedmirror_storage",
];

#[derive(Debug, Parser)]
#[command(name = "feedmirror")]
#[command(about = "Incrementally mirror a blog feed into a record store")]
struct Cli {
    /// Increase log verbosity (-v debug, -vv trace).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[arg(long, value_enum, default_value_t = LogFormat::Text, global = true)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum StoreArg {
    File,
    Kv,
}

#[derive(Debug, Default, clap::Args)]
struct SyncArgs {
    /// Feed URL, or a path to a local Atom document.
    #[arg(long)]
    feed_url: Option<String>,
    #[arg(long, value_enum)]
    store: Option<StoreArg>,
    #[arg(long)]
    store_path: Option<PathBuf>,
    /// Drop stored records that no longer appear in the feed.
    #[arg(long)]
    prune: bool,
    #[arg(long)]
    max_refreshes: Option<usize>,
    /// Reconcile and report without writing the snapshot.
    #[arg(long)]
    dry_run: bool,
    /// Skip page scraping and keyword extraction.
    #[arg(long)]
    offline: bool,
    #[arg(long)]
    reports_dir: Option<PathBuf>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one sync pass.
    Sync(SyncArgs),
    /// Summarize the stored snapshot.
    Inspect {
        #[arg(long, value_enum)]
        store: Option<StoreArg>,
        #[arg(long)]
        store_path: Option<PathBuf>,
    },
    /// Run sync passes on the configured cron schedule until interrupted.
    Schedule(SyncArgs),
}

impl SyncArgs {
    fn apply(self, config: &mut SyncConfig) {
        if let Some(feed_url) = self.feed_url {
            config.feed_url = feed_url;
        }
        apply_store(config, self.store, self.store_path);
        if self.max_refreshes.is_some() {
            config.max_refreshes = self.max_refreshes;
        }
        if self.reports_dir.is_some() {
            config.reports_dir = self.reports_dir;
        }
        config.prune_missing |= self.prune;
        config.dry_run |= self.dry_run;
        config.offline |= self.offline;
    }
}

fn apply_store(config: &mut SyncConfig, store: Option<StoreArg>, store_path: Option<PathBuf>) {
    if let Some(store) = store {
        config.store_backend = match store {
            StoreArg::File => StoreBackend::File,
            StoreArg::Kv => StoreBackend::Kv,
        };
    }
    if let Some(path) = store_path {
        config.store_path = path;
    }
}

/// Workspace crates log at `level`; dependencies only surface warnings.
fn default_directives(level: &str) -> String {
    let mut directives: Vec<String> = LOG_TARGETS
        .iter()
        .map(|target| format!("{target}={level}"))
        .collect();
    directives.push("warn".to_string());
    directives.join(",")
}

fn init_tracing(verbose: u8, format: LogFormat) -> Result<()> {
    let level = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_directives(level)))?;
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.log_format)?;

    let mut config = SyncConfig::from_env();

    match cli.command.unwrap_or(Commands::Sync(SyncArgs::default())) {
        Commands::Sync(args) => {
            args.apply(&mut config);
            let pipeline = SyncPipeline::new(config)?;
            let cancel = pipeline.cancel_flag();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    warn!("interrupt received; finishing the current entry and skipping the write");
                    cancel.cancel();
                }
            });

            let summary = pipeline.run_once().await?;
            println!(
                "sync complete: run_id={} entries={} records={} new={} updated={} backfilled={} reused={} deferred={} written={}",
                summary.run_id,
                summary.fetched_entries,
                summary.records,
                summary.stats.new,
                summary.stats.updated,
                summary.stats.backfilled,
                summary.stats.reused,
                summary.stats.deferred,
                summary.written,
            );
            if let Some(report) = summary.report_path {
                println!("report: {report}");
            }
        }
        Commands::Inspect { store, store_path } => {
            apply_store(&mut config, store, store_path);
            let inspection = inspect_store(&config).await?;
            println!("{}", serde_json::to_string_pretty(&inspection)?);
        }
        Commands::Schedule(args) => {
            args.apply(&mut config);
            config.scheduler_enabled = true;
            let cron = config.sync_cron.clone();
            let pipeline = Arc::new(SyncPipeline::new(config)?);
            let cancel = pipeline.cancel_flag();
            let Some(mut sched) = Arc::clone(&pipeline).maybe_build_scheduler().await? else {
                return Ok(());
            };
            sched.start().await?;
            info!(%cron, "scheduler started");

            tokio::signal::ctrl_c().await?;
            cancel.cancel();
            sched.shutdown().await?;
            info!("scheduler stopped");
        }
    }

    Ok(())
}
