use anyhow::{Context, Result};
use beatgrid::analyzer::{Orchestrator, PipelineError, PipelineSettings, Ports};
use beatgrid::config::AppConfig;
use beatgrid::db::Database;
use beatgrid::db::jobs::DeleteOutcome;
use beatgrid::db::models::TrackStatus;
use beatgrid::dispatch::{self, Dispatcher};
use beatgrid::storage::{LocalStorage, keys};
use beatgrid::timeline::{self, TimelineError};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "beatgrid", version, about = "Beat grids, 8-count alignment and per-stem rhythm events")]
struct Cli {
    /// Path to the SQLite database
    #[arg(long, global = true)]
    db_path: Option<PathBuf>,

    /// Path to the config file (defaults to the XDG config dir)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Add audio files (or directories of them) to the library
    Add {
        /// Files or directories to add
        paths: Vec<PathBuf>,

        /// Download a track from a URL instead
        #[arg(long, conflicts_with = "paths")]
        url: Option<String>,
    },

    /// Queue tracks for analysis
    Enqueue {
        #[arg(required = true)]
        ids: Vec<i64>,
    },

    /// Show a track's status, latest analysis and job history
    Status { id: i64 },

    /// List tracks
    List {
        /// Only tracks with this status
        #[arg(long)]
        status: Option<TrackStatus>,
    },

    /// Print a finished track's timeline as JSON
    Timeline {
        id: i64,

        /// Single-line JSON
        #[arg(long)]
        compact: bool,
    },

    /// Delete a track with its analysis, stems and stored audio
    Delete { id: i64 },

    /// Run analysis workers against the job queue
    Worker {
        /// Number of parallel workers (0 = auto-detect from config)
        #[arg(short = 'j', long, default_value = "0")]
        jobs: usize,

        /// Exit once nothing is queued or running
        #[arg(long)]
        burst: bool,
    },

    /// Queue tracks (default: all pending) and analyze them now
    Analyze {
        ids: Vec<i64>,

        /// Number of parallel workers (0 = auto-detect from config)
        #[arg(short = 'j', long, default_value = "0")]
        jobs: usize,
    },

    /// Time out expired jobs and purge old job records once
    Sweep,

    /// Show library statistics
    Stats,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Set up logging based on verbosity
    let log_level = match cli.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(log_level))
        .format_timestamp(None)
        .init();

    // Load config file (optional, defaults if missing)
    let config = AppConfig::load(cli.config.as_deref());

    // Resolve database path: CLI > config > XDG default
    let db_path = cli
        .db_path
        .or(config.db_path.clone())
        .unwrap_or_else(beatgrid::config::default_db_path);
    log::info!("Database: {}", db_path.display());

    let db = Database::open(&db_path).context("Failed to open database")?;
    let storage = LocalStorage::new(config.resolve_storage_dir());
    log::debug!("Storage: {}", storage.root().display());

    match cli.command {
        Commands::Add { paths, url } => {
            if let Some(url) = url {
                let id = beatgrid::ingest::add_url(&db, &storage, &url)
                    .with_context(|| format!("Failed to add {url}"))?;
                println!("Added track {id} from {url}");
            } else {
                if paths.is_empty() {
                    anyhow::bail!("Nothing to add. Pass files, directories or --url.");
                }
                let result = beatgrid::ingest::add_paths(&db, &storage, &paths);
                println!(
                    "Add complete: {} found, {} added, {} errors",
                    result.found,
                    result.added.len(),
                    result.errors
                );
            }
        }

        Commands::Enqueue { ids } => {
            for id in ids {
                match dispatch::enqueue(&db, id) {
                    Ok(job_id) => println!("Track {id}: queued (job {job_id})"),
                    Err(e @ (PipelineError::Conflict { .. } | PipelineError::NotFound(_))) => {
                        println!("Track {id}: {e}")
                    }
                    Err(e) => return Err(e).context("Enqueue failed"),
                }
            }
        }

        Commands::Status { id } => {
            let track = db
                .get_track(id)
                .context("Query failed")?
                .with_context(|| format!("No track with id {id}"))?;
            println!("Track {}: {}", track.id, track.title.as_deref().unwrap_or("(untitled)"));
            println!("  status:   {}", track.status);
            println!("  source:   {} {}", track.source_kind, track.source_uri);
            if let (Some(rate), Some(ms)) = (track.sample_rate, track.duration_ms) {
                println!("  audio:    {} Hz, {:.1}s", rate, ms as f64 / 1000.0);
            }
            if let Some(a) = db.latest_analysis(id).context("Query failed")? {
                println!(
                    "  analysis: {:.1} bpm, phase {} ms, {} measures, confidence {:.2}",
                    a.bpm, a.phase_shift_ms, a.measures, a.confidence
                );
            }
            let jobs = db.jobs_for_track(id).context("Query failed")?;
            if !jobs.is_empty() {
                println!("  jobs:");
                for j in &jobs {
                    println!(
                        "    #{:<5} attempt {} {:<10} {}",
                        j.id,
                        j.attempt,
                        j.status,
                        j.error.as_deref().unwrap_or("")
                    );
                }
            }
        }

        Commands::List { status } => {
            let tracks = db.list_tracks(status).context("Query failed")?;
            if tracks.is_empty() {
                println!("No tracks.");
                return Ok(());
            }
            println!("{:>6}  {:<10}  {:>8}  Title", "ID", "Status", "Length");
            println!("{}", "-".repeat(60));
            for t in &tracks {
                let length = t
                    .duration_ms
                    .map(|ms| format!("{:.1}s", ms as f64 / 1000.0))
                    .unwrap_or_else(|| "-".into());
                println!(
                    "{:>6}  {:<10}  {:>8}  {}",
                    t.id,
                    t.status,
                    length,
                    t.title.as_deref().unwrap_or("(untitled)")
                );
            }
        }

        Commands::Timeline { id, compact } => match timeline::build_timeline(&db, id) {
            Ok(tl) => {
                let json = if compact {
                    serde_json::to_string(&tl)?
                } else {
                    serde_json::to_string_pretty(&tl)?
                };
                println!("{json}");
            }
            Err(e @ (TimelineError::NotReady { .. } | TimelineError::NotFound(_))) => {
                println!("{e}");
            }
            Err(e) => return Err(e).context("Timeline failed"),
        },

        Commands::Delete { id } => {
            let track = db
                .get_track(id)
                .context("Query failed")?
                .with_context(|| format!("No track with id {id}"))?;
            match db.delete_idle_track(id).context("Delete failed")? {
                DeleteOutcome::Deleted => {}
                DeleteOutcome::Rejected(status) => {
                    anyhow::bail!("Track {id} is {status}; wait for its run to finish")
                }
                DeleteOutcome::Missing => anyhow::bail!("No track with id {id}"),
            }

            for result in [
                storage.remove(&track.storage_path),
                storage.remove(&keys::normalized(id)),
                storage.remove_dir(&keys::stems_dir(id)),
            ] {
                if let Err(e) = result {
                    log::warn!("Track {id}: {e}");
                }
            }
            println!("Deleted track {id}");
        }

        Commands::Worker { jobs, burst } => {
            let workers = if jobs > 0 { jobs } else { config.resolve_workers() };
            let orchestrator = build_orchestrator(&config, storage);
            let report = Dispatcher::new(&orchestrator, config.dispatch.clone())
                .run_workers(&db_path, workers, burst)
                .context("Worker pool failed")?;
            println!(
                "Workers finished: {} succeeded, {} failed, {} retried",
                report.succeeded, report.failed, report.retried
            );
        }

        Commands::Analyze { ids, jobs } => {
            let ids = if ids.is_empty() {
                db.list_tracks(Some(TrackStatus::Pending))
                    .context("Query failed")?
                    .iter()
                    .map(|t| t.id)
                    .collect()
            } else {
                ids
            };

            let mut queued = 0u64;
            for id in ids {
                match dispatch::enqueue(&db, id) {
                    Ok(_) => queued += 1,
                    Err(e @ (PipelineError::Conflict { .. } | PipelineError::NotFound(_))) => {
                        log::warn!("Skipping track {id}: {e}")
                    }
                    Err(e) => return Err(e).context("Enqueue failed"),
                }
            }
            if queued == 0 {
                println!("No tracks to analyze");
                return Ok(());
            }

            let workers = if jobs > 0 { jobs } else { config.resolve_workers() };
            let orchestrator = build_orchestrator(&config, storage);
            let pb = beatgrid::progress_bar(queued);
            let report = Dispatcher::new(&orchestrator, config.dispatch.clone())
                .with_progress(&pb)
                .run_workers(&db_path, workers, true)
                .context("Analysis failed")?;
            pb.finish_with_message(format!(
                "Done: {} succeeded, {} failed",
                report.succeeded, report.failed
            ));
            println!(
                "Analysis complete: {} succeeded, {} failed, {} retried",
                report.succeeded, report.failed, report.retried
            );
        }

        Commands::Sweep => {
            let orchestrator = build_orchestrator(&config, storage);
            let report = Dispatcher::new(&orchestrator, config.dispatch.clone())
                .sweep(&db)
                .context("Sweep failed")?;
            println!(
                "Sweep complete: {} timed out, {} abandoned, {} re-queued, {} purged",
                report.reaped, report.abandoned, report.retried, report.purged
            );
        }

        Commands::Stats => {
            let stats = db.stats().context("Failed to get stats")?;
            println!("Library Statistics");
            println!("==================");
            println!("Total tracks:     {}", stats.total_tracks);
            println!("Total duration:   {:.1} hours", stats.total_duration_hours);
            println!("Stem events:      {}", stats.events);
            println!();

            let sections = [
                ("Tracks by status:", stats.by_status.iter().map(|(s, n)| (s.to_string(), *n)).collect::<Vec<_>>()),
                ("Stems:", stats.stems.iter().map(|(s, n)| (s.to_string(), *n)).collect()),
                ("Jobs:", stats.jobs.iter().map(|(s, n)| (s.to_string(), *n)).collect()),
            ];
            for (heading, rows) in sections {
                if rows.is_empty() {
                    continue;
                }
                println!("{heading}");
                for (name, count) in rows {
                    println!("  {:<12} {}", name, count);
                }
                println!();
            }
        }
    }

    Ok(())
}

fn build_orchestrator(config: &AppConfig, storage: LocalStorage) -> Orchestrator {
    let ports = Ports::from_config(config, &storage);
    Orchestrator::new(ports, storage, PipelineSettings::from(config))
}
