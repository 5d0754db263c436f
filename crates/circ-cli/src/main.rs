use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use circ_core::MergedSnapshot;
use circ_storage::SnapshotStore;
use circ_sync::{report_markdown, SyncConfig, SyncPipeline};
use clap::{Args, Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "circ")]
#[command(about = "Collects, merges and serves department circular listings")]
struct Cli {
    #[command(flatten)]
    paths: PathArgs,
    #[command(subcommand)]
    command: Option<Commands>,
}

/// Overrides for the matching `CIRC_*` environment variables.
#[derive(Debug, Args)]
struct PathArgs {
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,
    #[arg(long, global = true)]
    output: Option<PathBuf>,
    #[arg(long, global = true)]
    baseline: Option<PathBuf>,
    #[arg(long, global = true)]
    sources: Option<PathBuf>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Fetch one source and overwrite its snapshot.
    Fetch {
        source_id: String,
        /// Parse a saved listing page instead of fetching.
        #[arg(long)]
        from_file: Option<PathBuf>,
    },
    /// Fetch every enabled source within the run budget.
    FetchAll,
    /// Merge snapshots into the output file.
    Merge,
    /// Fetch everything, then merge.
    Run,
    /// Print a summary of the merged output.
    Verify {
        #[arg(long, default_value_t = 5)]
        top: usize,
    },
    Serve {
        #[arg(long, env = "CIRC_WEB_PORT", default_value_t = 8000)]
        port: u16,
    },
    /// Run the sync on the configured cron schedule until interrupted.
    Schedule,
}

fn load_config(paths: PathArgs) -> SyncConfig {
    let mut config = SyncConfig::from_env();
    if let Some(dir) = paths.data_dir {
        let rooted = SyncConfig::with_data_dir(&dir);
        if std::env::var_os("CIRC_OUTPUT").is_none() {
            config.output_path = rooted.output_path;
        }
        if std::env::var_os("CIRC_BASELINE").is_none() {
            config.baseline_path = rooted.baseline_path;
        }
        config.data_dir = dir;
    }
    if let Some(output) = paths.output {
        config.output_path = output;
    }
    if let Some(baseline) = paths.baseline {
        config.baseline_path = baseline;
    }
    if let Some(sources) = paths.sources {
        config.sources_path = sources;
    }
    config
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("circ=info".parse()?))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = load_config(cli.paths);

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Fetch { source_id, from_file } => {
            let pipeline = SyncPipeline::new(config)?;
            let report = match from_file {
                Some(path) => pipeline.fetch_source_from_file(&source_id, &path).await?,
                None => pipeline.fetch_source(&source_id).await?,
            };
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Commands::FetchAll => {
            let pipeline = SyncPipeline::new(config)?;
            let summary = pipeline.fetch_all().await;
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        Commands::Merge => {
            let pipeline = SyncPipeline::new(config)?;
            let merged = pipeline.merge().await?;
            println!(
                "merge complete: total={} status={} output={}",
                merged.total_circulars,
                merged.scraping_status.as_str(),
                pipeline.config().output_path.display()
            );
        }
        Commands::Run => {
            let pipeline = SyncPipeline::new(config)?;
            let summary = pipeline.run_once().await?;
            println!(
                "sync complete: run_id={} sources={} fetched={} skipped={} total={} status={}",
                summary.run_id,
                summary.enabled_sources,
                summary.fetched_sources,
                summary.skipped_sources.len(),
                summary.total_circulars,
                summary.scraping_status.as_str()
            );
        }
        Commands::Verify { top } => {
            let pipeline = SyncPipeline::new(config)?;
            let output = &pipeline.config().output_path;
            let snapshot: MergedSnapshot = SnapshotStore::new(&pipeline.config().data_dir)
                .read_json(output)
                .await
                .with_context(|| format!("reading {}", output.display()))?;
            print!("{}", report_markdown(&snapshot, &pipeline.registry().enabled(), top));
        }
        Commands::Serve { port } => {
            let registry = circ_sync::SourceRegistry::load_or_builtin(&config.sources_path);
            circ_web::serve(circ_web::AppState::new(config.output_path, registry.enabled()), port).await?;
        }
        Commands::Schedule => {
            let pipeline = Arc::new(SyncPipeline::new(SyncConfig {
                scheduler_enabled: true,
                ..config
            })?);
            let Some(mut sched) = pipeline.maybe_build_scheduler().await? else {
                return Ok(());
            };
            sched.start().await.context("starting scheduler")?;
            info!(
                cron_1 = %pipeline.config().sync_cron_1,
                cron_2 = %pipeline.config().sync_cron_2,
                "scheduler running, ctrl-c to stop"
            );
            tokio::signal::ctrl_c().await?;
            sched.shutdown().await.context("stopping scheduler")?;
        }
    }

    Ok(())
}
