use std::collections::{HashSet, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio::sync::mpsc;

use storyrun::agent::CommandExecutor;
use storyrun::config::{Config, STORE_DIR_ENV};
use storyrun::core::{group_stories_by_phase, validate_dependencies, Story, StoryId};
use storyrun::orchestration::{
    install_shutdown_handlers, resolve_story_id_from_env, CommandSpawner, ExecutionResult,
    Orchestrator, OrchestratorEvent, ProcessGovernor, RecoveryBreaker, Worker, WorkerOptions,
    WORKSPACE_ENV,
};
use storyrun::store::{JsonStoryStore, StoryStore};
use storyrun::workspace::DirectoryProvisioner;
use storyrun::{slog, slog_error, slog_warn, Error, Result};

/// storyrun - run dependent stories in parallel, isolated worker processes
#[derive(Parser, Debug)]
#[command(name = "storyrun")]
#[command(version, about, long_about = None)]
#[command(
    after_help = "ENVIRONMENT:\n    STORYRUN_DEBUG=1     Enable debug logging (alternative to --debug)\n    STORYRUN_HOME        Config and log directory (default ~/.storyrun)"
)]
pub struct Cli {
    /// Enable debug logging (writes to <home>/storyrun.log)
    #[arg(short = 'd', long, global = true)]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Execute stories phase by phase (all stories when no ids are given)
    Run {
        /// Stories to run; their dependencies are pulled in automatically
        ids: Vec<String>,

        /// Override the configured concurrency limit
        #[arg(short = 'j', long)]
        concurrency: Option<usize>,
    },
    /// Execute a single story and speak IPC over stdin/stdout
    #[command(hide = true)]
    Worker {
        /// Story id (falls back to STORYRUN_STORY_ID)
        story_id: Option<String>,

        /// Workspace directory (falls back to STORYRUN_WORKSPACE, then the cwd)
        #[arg(long)]
        workspace: Option<PathBuf>,
    },
    /// Check the stored stories for missing dependencies and cycles
    Validate,
    /// Show every stored story with its status and recovery counter
    Status,
    /// Re-admit a story blocked by the recovery limit
    Unblock {
        id: String,

        /// Also zero its lifetime recovery counter
        #[arg(long)]
        reset: bool,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Workers exit with the protocol exit code, never through `Result`.
    if let Command::Worker {
        story_id,
        workspace,
    } = &cli.command
    {
        std::process::exit(run_worker(cli.debug, story_id.clone(), workspace.clone()));
    }

    storyrun::log::init_with_debug(cli.debug);
    let config = Config::load()?;
    let rt = tokio::runtime::Runtime::new()?;

    match cli.command {
        Command::Run { ids, concurrency } => {
            let results = rt.block_on(run_stories(config, ids, concurrency, cli.debug))?;
            println!("{}", serde_json::to_string_pretty(&results)?);
            if results.iter().any(|r| !r.success) {
                std::process::exit(1);
            }
            Ok(())
        }
        Command::Validate => rt.block_on(run_validate(config)),
        Command::Status => rt.block_on(run_status(config)),
        Command::Unblock { id, reset } => rt.block_on(run_unblock(config, id, reset)),
        Command::Worker { .. } => Ok(()),
    }
}

/// Worker process entry. Returns the process exit code.
fn run_worker(debug: bool, story_id: Option<String>, workspace: Option<PathBuf>) -> i32 {
    let story_id = match resolve_story_id_from_env(story_id.as_deref()) {
        Ok(id) => id,
        Err(e) => {
            eprintln!("storyrun worker: {}", e);
            return 1;
        }
    };
    storyrun::log::init_worker(debug, story_id.as_str());

    let config = Config::load().unwrap_or_else(|e| {
        slog_warn!("Could not load config, using defaults: {}", e);
        Config::default()
    });
    let store_dir = match config.store_path() {
        Ok(dir) => dir,
        Err(e) => {
            slog_error!("Cannot resolve story store: {}", e);
            return 1;
        }
    };
    let workspace = workspace
        .or_else(|| std::env::var_os(WORKSPACE_ENV).map(PathBuf::from))
        .or_else(|| std::env::current_dir().ok())
        .unwrap_or_else(|| PathBuf::from("."));

    let rt = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            slog_error!("Cannot start runtime: {}", e);
            return 1;
        }
    };

    let options = WorkerOptions {
        max_retries: config.worker.max_retries,
        backoff_initial: Duration::from_millis(config.orchestrator.backoff_initial_ms),
        backoff_max: Duration::from_millis(config.orchestrator.backoff_max_ms),
    };
    let mut worker = Worker::new(
        story_id,
        workspace,
        Arc::new(JsonStoryStore::new(store_dir)),
        Arc::new(CommandExecutor::from_settings(&config.worker)),
    )
    .with_options(options);

    let code = rt.block_on(worker.run_stdio());
    // A stdin read may still be parked on a blocking thread; dropping the
    // runtime would wait for it while the orchestrator holds the pipe open.
    rt.shutdown_background();
    code
}

async fn run_stories(
    config: Config,
    ids: Vec<String>,
    concurrency: Option<usize>,
    debug: bool,
) -> Result<Vec<ExecutionResult>> {
    CommandExecutor::from_settings(&config.worker).check_available()?;

    let store_dir = config.store_path()?;
    let store = Arc::new(JsonStoryStore::new(&store_dir));
    let all = store.list().await?;
    let stories = if ids.is_empty() {
        all
    } else {
        with_dependencies(&ids, &all)?
    };
    slog!("Run command: {} stories, store={}", stories.len(), store_dir.display());

    let mut orch_config = config.orchestrator_config();
    if let Some(n) = concurrency {
        orch_config.concurrency = n;
    }
    let grace = orch_config.shutdown_grace;

    let mut spawner =
        CommandSpawner::current_exe()?.env(STORE_DIR_ENV, store_dir.to_string_lossy());
    if debug {
        spawner = spawner.env("STORYRUN_DEBUG", "1");
    }

    let governor = ProcessGovernor::new();
    let (tx, mut rx) = mpsc::channel(256);
    let orchestrator = Orchestrator::new(
        orch_config,
        governor.clone(),
        Arc::new(spawner),
        store,
        Arc::new(DirectoryProvisioner::new(config.workspaces_path()?)),
    )
    .with_events(tx);

    let signals = install_shutdown_handlers(governor, orchestrator.cancellation_token(), grace)?;
    let printer = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            print_event(&event);
        }
    });

    let results = orchestrator.execute(&stories).await;
    signals.abort();
    drop(orchestrator);
    let _ = printer.await;
    results
}

/// `ids` plus everything they transitively depend on, in store order.
fn with_dependencies(ids: &[String], all: &[Story]) -> Result<Vec<Story>> {
    let known: HashSet<&StoryId> = all.iter().map(|s| &s.id).collect();
    let mut wanted: HashSet<StoryId> = HashSet::new();
    let mut queue: VecDeque<StoryId> = ids.iter().map(|id| StoryId::from(id.as_str())).collect();

    while let Some(id) = queue.pop_front() {
        if !known.contains(&id) {
            return Err(Error::StoryNotFound(id));
        }
        if !wanted.insert(id.clone()) {
            continue;
        }
        if let Some(story) = all.iter().find(|s| s.id == id) {
            queue.extend(story.dependencies.iter().cloned());
        }
    }

    Ok(all
        .iter()
        .filter(|s| wanted.contains(&s.id))
        .cloned()
        .collect())
}

fn print_event(event: &OrchestratorEvent) {
    match event {
        OrchestratorEvent::PhaseStarted { index, stories } => {
            let ids: Vec<&str> = stories.iter().map(|s| s.as_str()).collect();
            eprintln!("phase {}: {}", index + 1, ids.join(", "));
        }
        OrchestratorEvent::StoryStarted {
            story_id,
            attempt,
            pid,
        } => eprintln!("  start   {} (attempt {}, pid {})", story_id, attempt, pid),
        OrchestratorEvent::StoryProgress { .. } => {}
        OrchestratorEvent::StoryCompleted { story_id, duration } => {
            eprintln!("  done    {} in {:.1}s", story_id, duration.as_secs_f64())
        }
        OrchestratorEvent::StoryFailed { story_id, error } => {
            eprintln!("  failed  {}: {}", story_id, error)
        }
        OrchestratorEvent::RetryScheduled {
            story_id,
            recovery_attempt,
            delay,
        } => eprintln!(
            "  retry   {} in {:.1}s (recovery {})",
            story_id,
            delay.as_secs_f64(),
            recovery_attempt
        ),
        OrchestratorEvent::StoryBlocked { story_id, reason } => {
            eprintln!("  blocked {}: {}", story_id, reason)
        }
        OrchestratorEvent::StorySkipped { story_id, reason } => {
            eprintln!("  skipped {}: {}", story_id, reason)
        }
        OrchestratorEvent::PhaseCompleted {
            index,
            succeeded,
            failed,
        } => eprintln!(
            "phase {} complete: {} succeeded, {} failed",
            index + 1,
            succeeded,
            failed
        ),
        OrchestratorEvent::AllPhasesComplete { succeeded, failed } => {
            eprintln!("all phases complete: {} succeeded, {} failed", succeeded, failed)
        }
    }
}

async fn run_validate(config: Config) -> Result<()> {
    let store = JsonStoryStore::new(config.store_path()?);
    let stories = store.list().await?;
    let issues = validate_dependencies(&stories);
    if let Some(issue) = issues.into_iter().next() {
        return Err(issue.into());
    }

    let phases = group_stories_by_phase(&stories)?;
    println!("{} stories, {} phase(s)", stories.len(), phases.len());
    for phase in &phases {
        let ids: Vec<String> = phase.ids().iter().map(|id| id.to_string()).collect();
        println!("  phase {}: {}", phase.index + 1, ids.join(", "));
    }
    Ok(())
}

async fn run_status(config: Config) -> Result<()> {
    let ceiling = config.orchestrator.recovery_ceiling;
    let store = JsonStoryStore::new(config.store_path()?);
    let stories = store.list().await?;
    if stories.is_empty() {
        println!("No stories in {}", store.dir().display());
        return Ok(());
    }

    println!("{:<16} {:<12} {:>9}  TITLE", "ID", "STATUS", "RECOVERY");
    for story in &stories {
        println!(
            "{:<16} {:<12} {:>4}/{:<4}  {}",
            story.id.as_str(),
            story.status.to_string(),
            story.total_recovery_attempts,
            ceiling,
            story.title
        );
        if let Some(reason) = &story.blocked_reason {
            println!("{:<16} {}", "", reason);
        }
    }
    Ok(())
}

async fn run_unblock(config: Config, id: String, reset: bool) -> Result<()> {
    let store = JsonStoryStore::new(config.store_path()?);
    let breaker = RecoveryBreaker::new(config.orchestrator.recovery_ceiling);
    let story = breaker
        .unblock(&store, &StoryId::from(id.as_str()), reset)
        .await?;
    println!(
        "{} is {} ({} recovery attempts recorded)",
        story.id, story.status, story.total_recovery_attempts
    );
    Ok(())
}
