use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use chrono::Utc;
use deckharvest_core::JobRun;
use deckharvest_storage::PgDeckStore;
use deckharvest_sync::monitor::TimerSummary;
use deckharvest_sync::{
    FetchDecksOptions, HarvestConfig, HarvestMetrics, HarvestScheduler, JobKind, StoreBackend,
};
use serde::Serialize;
use tracing_subscriber::EnvFilter;

/// Recorded runs read back for health, metrics and alert reports.
const REPORT_HISTORY: usize = 500;

#[derive(Debug, Parser)]
#[command(name = "deckharvest")]
#[command(about = "Commander deck discovery, ingestion and card normalization")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run every job once, in schedule order.
    RunOnce,
    /// Run a single job.
    Run {
        #[arg(value_enum)]
        job: JobKind,
    },
    /// Run jobs on their cron schedules until ctrl-c.
    Schedule,
    /// Deck ids for one commander from Archidekt search, most viewed first.
    Discover {
        #[arg(long)]
        commander: String,
        #[arg(long, default_value_t = 3)]
        max_pages: u32,
        /// Upper bound in seconds of the randomized delay between pages.
        #[arg(long, default_value_t = 5.0)]
        politeness: f64,
    },
    /// Discover ids for every commander in a file and write them as JSON.
    Crawl {
        #[arg(long)]
        commanders: PathBuf,
        #[arg(long)]
        out: PathBuf,
        #[arg(long, default_value_t = 2)]
        max_pages: u32,
        #[arg(long, default_value_t = 5.0)]
        politeness: f64,
    },
    /// Save the raw Archidekt JSON of every id in a consolidated crawl file.
    FetchDecks {
        #[arg(long, default_value = "consolidated_deck_ids.json")]
        ids: PathBuf,
        #[arg(long)]
        out: PathBuf,
        #[arg(long)]
        max_decks: Option<usize>,
        /// Ids to skip from the front of the list.
        #[arg(long, default_value_t = 0)]
        start_from: usize,
        #[arg(long, default_value_t = 2.0)]
        politeness: f64,
    },
    /// Resolve card names to oracle ids.
    NormalizeNames {
        #[arg(required = true)]
        names: Vec<String>,
    },
    /// Closest known names for an unmapped card.
    UnmappedSuggest {
        name: String,
        #[arg(long, default_value_t = 5)]
        limit: usize,
    },
    /// Most recent job runs, newest first.
    History {
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    Stats,
    /// Last run per job, rate-limit pressure and normalization coverage.
    Health {
        #[arg(long)]
        json: bool,
    },
    /// Run counters, store gauges and job duration percentiles from recorded runs.
    Metrics {
        #[arg(long)]
        json: bool,
    },
    /// Error-heavy jobs, stale sources and low normalization.
    Alerts {
        /// Days of runs considered for error rates.
        #[arg(long, default_value_t = 7)]
        days: i64,
        #[arg(long)]
        json: bool,
    },
    Migrate,
}

fn print_run(run: &JobRun) {
    println!(
        "{} {}: status={} decks={} cards={} errors={} http_429={} duration={:.1}s{}",
        run.source_name,
        run.operation,
        run.status,
        run.decks_processed,
        run.cards_processed,
        run.errors_count,
        run.http_429_count,
        run.duration.as_secs_f64(),
        run.message
            .as_deref()
            .map(|m| format!(" message={m:?}"))
            .unwrap_or_default()
    );
}

fn politeness(secs: f64) -> Duration {
    Duration::from_secs_f64(secs.max(0.0))
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn print_timer(key: &str, timer: &TimerSummary) {
    println!(
        "{key}: count={} mean={:.1}ms p95={:.1}ms p99={:.1}ms max={:.1}ms",
        timer.count, timer.mean_ms, timer.p95_ms, timer.p99_ms, timer.max_ms
    );
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env().add_directive("deckharvest=info".parse()?),
        )
        .init();

    let cli = Cli::parse();
    let config = HarvestConfig::from_env()?;

    match cli.command.unwrap_or(Commands::RunOnce) {
        Commands::RunOnce => {
            let jobs = deckharvest_sync::jobs_from_config(&config).await?;
            for run in jobs.run_all(deckharvest_sync::RUN_ONCE_EXPORT_CAP).await? {
                print_run(&run);
            }
            jobs.release_browsers().await;
        }
        Commands::Run { job } => {
            let jobs = deckharvest_sync::jobs_from_config(&config).await?;
            let run = jobs.run(job).await?;
            print_run(&run);
        }
        Commands::Schedule => {
            if !config.scheduler_enabled {
                eprintln!("scheduler disabled; set DECKHARVEST_SCHEDULER_ENABLED=true to run it");
                return Ok(());
            }
            let jobs = Arc::new(deckharvest_sync::jobs_from_config(&config).await?);
            HarvestScheduler::new(jobs, config.crons.clone())
                .run_until_ctrl_c()
                .await?;
        }
        Commands::Discover {
            commander,
            max_pages,
            politeness: secs,
        } => {
            let registry = deckharvest_sync::load_registry(&config).await?;
            let adapter = deckharvest_sync::archidekt_adapter(&config, &registry)?;
            let ids =
                discover_top_viewed(&adapter, &commander, max_pages, politeness(secs)).await?;
            println!("{commander}: {} deck ids", ids.len());
            for id in ids {
                println!("{id}");
            }
        }
        Commands::Crawl {
            commanders,
            out,
            max_pages,
            politeness: secs,
        } => {
            let registry = deckharvest_sync::load_registry(&config).await?;
            let adapter = deckharvest_sync::archidekt_adapter(&config, &registry)?;
            let summary = deckharvest_sync::crawl_commanders(
                &adapter,
                &commanders,
                &out,
                max_pages,
                politeness(secs),
            )
            .await?;
            println!(
                "crawl complete: commanders={} failed={} unique_deck_ids={} consolidated={}",
                summary.commanders,
                summary.failed,
                summary.unique_deck_ids,
                summary.consolidated_path.display()
            );
        }
        Commands::FetchDecks {
            ids,
            out,
            max_decks,
            start_from,
            politeness: secs,
        } => {
            let registry = deckharvest_sync::load_registry(&config).await?;
            let adapter = deckharvest_sync::archidekt_adapter(&config, &registry)?;
            let options = FetchDecksOptions {
                start_from,
                max_decks,
                politeness: politeness(secs),
            };
            let summary = deckharvest_sync::fetch_deck_lists(&adapter, &ids, &out, &options).await?;
            println!(
                "deck fetch complete: requested={} fetched={} failed={} skipped_existing={}",
                summary.requested, summary.fetched, summary.failed, summary.skipped_existing
            );
        }
        Commands::NormalizeNames { names } => {
            let normalizer = deckharvest_sync::build_normalizer(&config)?;
            let resolved = normalizer
                .resolve_batch(&names)
                .await
                .context("resolving card names")?;
            for name in &names {
                match resolved.get(name).and_then(Option::as_deref) {
                    Some(id) => println!("{name} -> {id}"),
                    None => println!("{name} -> unmapped"),
                }
            }
        }
        Commands::UnmappedSuggest { name, limit } => {
            let normalizer = deckharvest_sync::build_normalizer(&config)?;
            let suggestions = normalizer
                .suggest(&name, limit)
                .await
                .context("ranking suggestions")?;
            if suggestions.is_empty() {
                println!("no suggestions for {name:?}");
            }
            for s in suggestions {
                println!("{:.3} {} ({})", s.score, s.name, s.canonical_id);
            }
        }
        Commands::History { limit } => {
            let store = deckharvest_sync::build_store(&config).await?;
            for run in store.recent_job_runs(limit).await? {
                print!("{} ", run.timestamp.format("%Y-%m-%d %H:%M:%S"));
                print_run(&run);
            }
        }
        Commands::Stats => {
            let store = deckharvest_sync::build_store(&config).await?;
            let stats = store.stats().await?;
            println!(
                "decks={} cards={} normalized={} ({:.1}%) unmapped_names={}",
                stats.total_decks,
                stats.total_cards,
                stats.normalized_cards,
                stats.normalization_percentage(),
                stats.unmapped_unique_names
            );
        }
        Commands::Health { json } => {
            let store = deckharvest_sync::build_store(&config).await?;
            let runs = store.recent_job_runs(REPORT_HISTORY).await?;
            let report = deckharvest_sync::health_report(&runs, &store.stats().await?, Utc::now());
            if json {
                return print_json(&report);
            }
            println!("overall: {}", report.status);
            for job in &report.jobs {
                let last = match (job.last_status, job.last_run_at) {
                    (Some(status), Some(at)) => {
                        format!("last={status} at {}", at.format("%Y-%m-%d %H:%M:%S"))
                    }
                    _ => "last=none".to_string(),
                };
                let note = job.note.as_deref().map(|n| format!(" ({n})")).unwrap_or_default();
                println!("  {}: {} {last}{note}", job.job, job.status);
            }
            println!(
                "http_429={} over {} runs ({:.2} per run) normalization={:.1}%",
                report.http_429_total,
                report.runs_considered,
                report.http_429_rate,
                report.normalization_percentage
            );
            for note in &report.notes {
                println!("  warning: {note}");
            }
        }
        Commands::Metrics { json } => {
            let store = deckharvest_sync::build_store(&config).await?;
            let runs = store.recent_job_runs(REPORT_HISTORY).await?;
            let snapshot = HarvestMetrics::from_history(&runs, &store.stats().await?).snapshot();
            if json {
                return print_json(&snapshot);
            }
            println!("counters:");
            for (key, value) in &snapshot.counters {
                println!("  {key}: {value}");
            }
            println!("gauges:");
            for (key, value) in &snapshot.gauges {
                println!("  {key}: {value:.1}");
            }
            println!("timers:");
            for (key, timer) in &snapshot.timers {
                print_timer(key, timer);
            }
        }
        Commands::Alerts { days, json } => {
            let store = deckharvest_sync::build_store(&config).await?;
            let runs = store.recent_job_runs(REPORT_HISTORY).await?;
            let found = deckharvest_sync::alerts(
                &runs,
                &store.stats().await?,
                Utc::now(),
                chrono::Duration::days(days.max(1)),
            );
            if json {
                return print_json(&found);
            }
            if found.is_empty() {
                println!("no alerts");
            }
            for (i, alert) in found.iter().enumerate() {
                println!(
                    "{}. [{}] {}: {}",
                    i + 1,
                    alert.severity.as_str(),
                    alert.kind.as_str(),
                    alert.message
                );
            }
        }
        Commands::Migrate => {
            anyhow::ensure!(
                config.store_backend == StoreBackend::Postgres,
                "migrate needs DECKHARVEST_STORE=postgres"
            );
            let store = PgDeckStore::connect(&config.database_url).await?;
            store.migrate().await?;
            println!("migrations applied");
        }
    }

    Ok(())
}

async fn discover_top_viewed(
    adapter: &deckharvest_adapters::ArchidektAdapter,
    commander: &str,
    max_pages: u32,
    politeness: Duration,
) -> Result<Vec<String>> {
    let ids = deckharvest_adapters::discovery::discover_top_viewed_deck_ids_by_commander(
        adapter, commander, max_pages, politeness,
    )
    .await
    .with_context(|| format!("discovering decks for {commander}"))?;
    Ok(ids.into_iter().collect())
}
