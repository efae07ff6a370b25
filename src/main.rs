use anyhow::Result;
use clap::{Parser, Subcommand};
use reviewtask::analyzer::{AnalyzeOptions, AnalyzeReport, Analyzer};
use reviewtask::checkpoint::CheckpointStore;
use reviewtask::config::Config;
use reviewtask::error::PipelineError;
use reviewtask::incremental::RunStatus;
use reviewtask::monitor::ResponseMonitor;
use reviewtask::oracle;
use reviewtask::storage::Storage;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

/// Exit code for a run that stopped at a checkpoint and can be resumed.
const EXIT_RESUMABLE: u8 = 2;

#[derive(Parser, Debug)]
#[command(
    name = "reviewtask",
    about = "Turn pull request review comments into a durable task list",
    version
)]
struct Args {
    /// Project root holding the .pr-review directory
    #[arg(short = 'C', long, default_value = ".", global = true)]
    project: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Extract tasks from a PR's review comments
    Analyze {
        /// Pull request number
        pr: u64,

        /// Reviews JSON file (defaults to the cached .pr-review/PR-<n>/reviews.json)
        #[arg(long)]
        reviews: Option<PathBuf>,

        /// Resume from an existing checkpoint (default)
        #[arg(long, conflicts_with = "no_resume")]
        resume: bool,

        /// Ignore any existing checkpoint and start over
        #[arg(long)]
        no_resume: bool,

        /// Comments per batch
        #[arg(long)]
        batch_size: Option<usize>,

        /// Stop after this many batches, keeping the checkpoint
        #[arg(long)]
        max_batches: Option<usize>,

        /// Shorter prompts; skip very short comments
        #[arg(long)]
        fast: bool,

        /// Deadline for the whole run, in seconds
        #[arg(long)]
        timeout: Option<u64>,
    },

    /// Print oracle response analytics
    Report,

    /// Show or clear the checkpoint for a PR
    Checkpoint {
        pr: u64,

        #[arg(long)]
        clear: bool,
    },
}

fn init_logging() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("reviewtask=info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

#[tokio::main]
async fn main() -> ExitCode {
    init_logging();
    let args = Args::parse();

    match run(args).await {
        Ok(code) => code,
        Err(err) => {
            eprintln!("Error: {:#}", err);
            ExitCode::from(exit_code_for(&err))
        }
    }
}

async fn run(args: Args) -> Result<ExitCode> {
    let storage = Storage::new(&args.project);
    let config = Config::load(storage.data_dir());

    match args.command {
        Command::Analyze {
            pr,
            reviews,
            resume: _,
            no_resume,
            batch_size,
            max_batches,
            fast,
            timeout,
        } => {
            let oracle = oracle::from_config(&config)?;
            let options = AnalyzeOptions {
                reviews_file: reviews,
                resume: !no_resume,
                batch_size,
                max_batches,
                fast_mode: fast,
                timeout: timeout.map(Duration::from_secs),
            };
            let analyzer = Analyzer::new(storage, config);
            let report = analyzer.analyze(oracle.as_ref(), pr, &options).await?;
            print_report(pr, &report);
            Ok(match report.status {
                RunStatus::Completed => ExitCode::SUCCESS,
                RunStatus::BatchLimit => {
                    eprintln!(
                        "Batch limit reached. Run `reviewtask analyze {}` again to continue.",
                        pr
                    );
                    ExitCode::from(EXIT_RESUMABLE)
                }
                RunStatus::Incomplete => {
                    eprintln!(
                        "{} comment(s) failed. Run `reviewtask analyze {}` again to retry them.",
                        report.failed.len(),
                        pr
                    );
                    ExitCode::FAILURE
                }
            })
        }
        Command::Report => {
            let monitor = ResponseMonitor::with_events(
                storage.load_analytics(),
                chrono::Duration::days(config.ai_settings.analytics_retention_days.max(1)),
            );
            println!("{}", monitor.report());
            Ok(ExitCode::SUCCESS)
        }
        Command::Checkpoint { pr, clear } => {
            if clear {
                storage.delete_checkpoint(pr)?;
                println!("Checkpoint for PR {} cleared.", pr);
                return Ok(ExitCode::SUCCESS);
            }
            match storage.load_checkpoint(pr)? {
                Some(state) => {
                    let stale = state.is_stale(config.checkpoint_max_age());
                    println!(
                        "PR {}: {}/{} comments processed in {} batch(es), {} partial task(s)",
                        pr,
                        state.processed_count(),
                        state.total_comments,
                        state.batch_count,
                        state.partial_tasks.len()
                    );
                    println!(
                        "started {}, updated {}{}",
                        state.started_at.format("%Y-%m-%d %H:%M:%S UTC"),
                        state.updated_at.format("%Y-%m-%d %H:%M:%S UTC"),
                        if stale { " (stale, will be ignored)" } else { "" }
                    );
                }
                None => println!("No checkpoint for PR {}.", pr),
            }
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn print_report(pr: u64, report: &AnalyzeReport) {
    println!("PR {}", pr);
    println!(
        "  comments: {} ({} resolved, {} nitpick filtered){}",
        report.contexts,
        report.resolved_filtered,
        report.nitpick_filtered,
        if report.resumed { ", resumed" } else { "" }
    );
    println!("  processed: {}/{}", report.processed, report.contexts);
    println!(
        "  tasks: {} generated, {} added, {} updated, {} cancelled, {} total",
        report.tasks_generated,
        report.merge.added,
        report.merge.updated,
        report.merge.cancelled,
        report.merge.total
    );
}

fn exit_code_for(err: &anyhow::Error) -> u8 {
    match err.downcast_ref::<PipelineError>() {
        Some(PipelineError::DeadlineExceeded { .. }) => EXIT_RESUMABLE,
        Some(PipelineError::Critical { source, .. }) => {
            if let Some(hint) = source.remediation() {
                eprintln!("{}", hint);
            }
            1
        }
        _ => 1,
    }
}
