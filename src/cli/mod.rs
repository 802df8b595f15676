pub mod config;

pub use config::ConductorConfig;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context as _, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::agents::AgentRegistry;
use crate::bus::{BusEvent, EventBus, EventKind, Subscription, SubscriptionFilter};
use crate::engine::types::{SessionFilter, SessionStatus, StepStatus, WorkflowSession};
use crate::engine::{Orchestrator, RuntimeContext, dag};
use crate::lua::LuaPlanner;
use crate::planner::{Planner, SingleStepPlanner, StaticPlanner};
use crate::storage::FileSessionStore;
use crate::workspace::DirWorkspaceProvider;

#[derive(Parser)]
#[command(name = "conductor", version, about = "Agent workflow orchestrator")]
pub struct Cli {
    /// Path to a .env file to load (default: auto-detect .env in cwd)
    #[arg(long, global = true)]
    dotenv: Option<PathBuf>,

    /// Path to conductor.yaml (default: auto-detect in cwd)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Session store directory
    #[arg(long, global = true, env = "CONDUCTOR_STORE_DIR")]
    store_dir: Option<PathBuf>,

    /// Directory for per-session workspaces
    #[arg(long, global = true, env = "CONDUCTOR_WORKSPACE_DIR")]
    workspace_dir: Option<PathBuf>,

    /// Plan file (.yaml/.yml or .lua) used to plan goals
    #[arg(long, global = true, env = "CONDUCTOR_PLAN")]
    plan: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Plan a goal and run it, streaming progress
    Run {
        /// The goal to work towards
        goal: String,

        /// Print every text chunk and tool call
        #[arg(short, long)]
        verbose: bool,
    },

    /// Show the plan for a goal without running it
    Plan {
        goal: String,
    },

    /// List sessions
    Sessions {
        /// Filter by status (pending, running, paused, interrupted, completed, failed, cancelled)
        #[arg(short, long)]
        status: Option<String>,

        /// Only sessions whose goal contains this text
        #[arg(long)]
        goal: Option<String>,

        /// Output format (table, json)
        #[arg(long, default_value = "table")]
        format: String,
    },

    /// Inspect a stored session
    Inspect {
        session_id: String,

        /// Show the state at this version instead of the latest
        #[arg(long)]
        version: Option<String>,
    },

    /// List the stored versions of a session
    Versions {
        session_id: String,
    },

    /// Compare two versions of a session
    Diff {
        session_id: String,
        from: String,
        to: String,
    },

    /// Resume an interrupted or paused session and stream its progress
    Resume {
        session_id: String,

        /// Restart from this version instead of the latest
        #[arg(long)]
        version: Option<String>,

        #[arg(short, long)]
        verbose: bool,
    },

    /// Cancel an interrupted session for good
    Abandon {
        session_id: String,
    },

    /// List available agent kinds
    Agents,

    /// Start the HTTP control API
    Serve {
        /// Host to bind to
        #[arg(long, env = "HOST")]
        host: Option<String>,

        /// Port to listen on
        #[arg(short, long, env = "PORT")]
        port: Option<u16>,
    },
}

/// Resolved settings: CLI flag, then environment, then config file, then default.
pub struct Settings {
    pub config: ConductorConfig,
    pub store_dir: PathBuf,
    pub workspace_dir: PathBuf,
    pub plan: Option<PathBuf>,
}

impl Settings {
    fn resolve(cli: &Cli) -> Result<Self> {
        let config = ConductorConfig::load(cli.config.as_deref())?;
        let store_dir = cli
            .store_dir
            .clone()
            .or_else(|| config.store_dir.as_ref().map(PathBuf::from))
            .unwrap_or_else(|| PathBuf::from("data/sessions"));
        let workspace_dir = cli
            .workspace_dir
            .clone()
            .or_else(|| config.workspace_dir.as_ref().map(PathBuf::from))
            .unwrap_or_else(|| PathBuf::from("data/workspaces"));
        let plan = cli
            .plan
            .clone()
            .or_else(|| config.plan.as_ref().map(PathBuf::from));
        Ok(Self {
            config,
            store_dir,
            workspace_dir,
            plan,
        })
    }
}

pub async fn run_cli() -> Result<()> {
    let cli = Cli::parse();

    // Load .env file
    load_dotenv(cli.dotenv.as_deref());

    let settings = Settings::resolve(&cli)?;

    match cli.command {
        Commands::Run { goal, verbose } => cmd_run(&settings, &goal, verbose).await,
        Commands::Plan { goal } => cmd_plan(&settings, &goal).await,
        Commands::Sessions {
            status,
            goal,
            format,
        } => cmd_sessions(&settings, status, goal, format).await,
        Commands::Inspect {
            session_id,
            version,
        } => cmd_inspect(&settings, &session_id, version.as_deref()).await,
        Commands::Versions { session_id } => cmd_versions(&settings, &session_id).await,
        Commands::Diff {
            session_id,
            from,
            to,
        } => cmd_diff(&settings, &session_id, &from, &to).await,
        Commands::Resume {
            session_id,
            version,
            verbose,
        } => cmd_resume(&settings, &session_id, version.as_deref(), verbose).await,
        Commands::Abandon { session_id } => cmd_abandon(&settings, &session_id).await,
        Commands::Agents => cmd_agents(&settings),
        Commands::Serve { host, port } => {
            let host = host
                .or_else(|| settings.config.host.clone())
                .unwrap_or_else(|| "0.0.0.0".to_string());
            let port = port.or(settings.config.port).unwrap_or(3000);
            let orchestrator = build_orchestrator(&settings)?;
            crate::api::serve(&host, port, orchestrator, &settings.config).await
        }
    }
}

/// Load environment variables from a .env file.
/// If an explicit path is given, load from that path (error if missing).
/// Otherwise, auto-detect .env in the current working directory (silently skip if absent).
fn load_dotenv(explicit_path: Option<&Path>) {
    match explicit_path {
        Some(path) => match dotenvy::from_path(path) {
            Ok(()) => info!("Loaded env from {}", path.display()),
            Err(e) => {
                eprintln!(
                    "Warning: Failed to load dotenv file '{}': {}",
                    path.display(),
                    e
                );
            }
        },
        None => match dotenvy::dotenv() {
            Ok(path) => info!("Loaded env from {}", path.display()),
            Err(dotenvy::Error::Io(_)) => {}
            Err(e) => {
                eprintln!("Warning: Failed to parse .env file: {}", e);
            }
        },
    }
}

/// Pick a planner from the plan file's extension, or plan single steps.
pub fn load_planner(
    plan: Option<&Path>,
    default_agent: &str,
    agents: &AgentRegistry,
) -> Result<Arc<dyn Planner>> {
    let Some(path) = plan else {
        return Ok(Arc::new(SingleStepPlanner::new(default_agent)));
    };
    match path.extension().and_then(|e| e.to_str()) {
        Some("lua") => Ok(Arc::new(LuaPlanner::from_file(path, agents)?)),
        Some("yaml") | Some("yml") => Ok(Arc::new(StaticPlanner::from_file(path)?)),
        _ => anyhow::bail!(
            "Unsupported plan file '{}': expected .yaml, .yml or .lua",
            path.display()
        ),
    }
}

/// Wire up the runtime described by `settings`.
pub fn build_orchestrator(settings: &Settings) -> Result<Orchestrator> {
    let config = &settings.config;
    let backend = config.agent_backend()?;
    let agents = Arc::new(config.agent_registry(backend));
    let default_agent = config.default_agent.as_deref().unwrap_or("researcher");
    let planner = load_planner(settings.plan.as_deref(), default_agent, &agents)?;

    let ctx = RuntimeContext::new(
        EventBus::new(config.bus.queues.clone()),
        Arc::new(FileSessionStore::new(&settings.store_dir)),
        planner,
        agents,
        Arc::new(DirWorkspaceProvider::new(&settings.workspace_dir)),
    );
    Ok(Orchestrator::new(ctx, config.orchestrator_config()))
}

async fn cmd_run(settings: &Settings, goal: &str, verbose: bool) -> Result<()> {
    let orchestrator = build_orchestrator(settings)?;
    let subscription = orchestrator.bus().subscribe(SubscriptionFilter::all());

    let session_id = orchestrator.execute(goal).await?;
    println!("Session: {}", session_id);

    let session = follow(&orchestrator, &session_id, subscription, verbose).await?;
    print_summary(&orchestrator, &session).await?;
    exit_status(&session)
}

async fn cmd_resume(
    settings: &Settings,
    session_id: &str,
    version: Option<&str>,
    verbose: bool,
) -> Result<()> {
    let orchestrator = build_orchestrator(settings)?;
    let subscription = orchestrator.bus().subscribe(SubscriptionFilter::session(session_id));

    orchestrator
        .resume_from(session_id, version)
        .await
        .with_context(|| format!("Failed to resume session '{}'", session_id))?;
    println!("Resumed: {}", session_id);

    let session = follow(&orchestrator, session_id, subscription, verbose).await?;
    print_summary(&orchestrator, &session).await?;
    exit_status(&session)
}

fn exit_status(session: &WorkflowSession) -> Result<()> {
    match session.status {
        SessionStatus::Completed => Ok(()),
        SessionStatus::Interrupted => {
            println!(
                "\nResume with: conductor resume {}   (or discard with: conductor abandon {})",
                session.id, session.id
            );
            Ok(())
        }
        status => anyhow::bail!("Session {} ended {}", session.id, status),
    }
}

/// Print a session's events until it settles. Ctrl-C interrupts it.
async fn follow(
    orchestrator: &Orchestrator,
    session_id: &str,
    mut subscription: Subscription,
    verbose: bool,
) -> Result<WorkflowSession> {
    let waiter = orchestrator.wait(session_id);
    tokio::pin!(waiter);
    let mut interrupted = false;

    loop {
        tokio::select! {
            biased;
            event = subscription.recv() => match event {
                Some(ev) if ev.session_id.as_deref().is_none_or(|id| id == session_id) => {
                    print_event(&ev, verbose)
                }
                Some(_) => {}
                None => return Ok(waiter.await?),
            },
            _ = tokio::signal::ctrl_c(), if !interrupted => {
                interrupted = true;
                println!("\nInterrupting (waiting for active steps to stop)...");
                if let Err(e) = orchestrator.interrupt(session_id).await {
                    eprintln!("Interrupt failed: {}", e);
                }
            }
            session = &mut waiter => {
                let session = session?;
                while let Some(ev) = subscription.try_recv() {
                    if ev.session_id.as_deref() == Some(session_id) {
                        print_event(&ev, verbose);
                    }
                }
                return Ok(session);
            }
        }
    }
}

fn print_event(event: &BusEvent, verbose: bool) {
    let step = event.step_id.as_deref().unwrap_or("-");
    let field = |key: &str| {
        event
            .payload
            .get(key)
            .map(|v| v.as_str().map(str::to_string).unwrap_or_else(|| v.to_string()))
            .unwrap_or_default()
    };
    match event.kind {
        EventKind::WorkflowStarted => println!("▶ {}", field("goal")),
        EventKind::WorkflowStatus => println!("  [{} → {}]", field("from"), field("to")),
        EventKind::StepStarted => {
            println!("⟳ {} [{}] attempt {}", step, field("agent_kind"), field("attempt"))
        }
        EventKind::TextChunk if verbose => print!("{}", field("content")),
        EventKind::ToolUse if verbose => println!("    tool: {}", field("tool")),
        EventKind::StepCompleted => println!("✓ {}", step),
        EventKind::StepFailed if event.payload.get("status").is_some() => println!("⊘ {}", step),
        EventKind::StepFailed => println!("✗ {}: {}", step, field("error")),
        EventKind::Interrupted => println!("⏸ {} interrupted", step),
        EventKind::WorkflowModified => println!("  plan modified"),
        EventKind::Alert => println!("! {}", field("message")),
        _ => {}
    }
}

async fn print_summary(orchestrator: &Orchestrator, session: &WorkflowSession) -> Result<()> {
    let results = orchestrator.step_results(&session.id).await?;

    println!("\nSession: {}", session.id);
    println!("Status: {}", session.status);
    if let Some(ref err) = session.error {
        println!("Error: {}", err);
    }

    println!("\nSteps:");
    for step in &session.steps {
        let status = session.step_status(&step.id);
        let icon = match status {
            StepStatus::Completed => "✓",
            StepStatus::Recovered => "↺",
            StepStatus::Failed => "✗",
            StepStatus::Skipped => "⊘",
            StepStatus::Running => "⟳",
            StepStatus::Interrupted => "⏸",
            StepStatus::Pending => "○",
        };
        let attempts = results.get(&step.id).map(|r| r.attempts).unwrap_or(0);
        println!("  {} {} [{}] (attempts {})", icon, step.id, step.agent_kind, attempts);
        if let Some(err) = results.get(&step.id).and_then(|r| r.error.as_ref()) {
            println!("    Error: {}", err);
        }
    }

    let m = &session.metrics;
    println!(
        "\nMetrics: {} words, {} tokens, {} tool calls, {} api calls, {} errors",
        m.words_generated, m.tokens_used, m.tool_calls, m.api_calls, m.errors
    );
    Ok(())
}

async fn cmd_plan(settings: &Settings, goal: &str) -> Result<()> {
    let orchestrator = build_orchestrator(settings)?;
    let planner = &orchestrator.context().planner;
    let steps = planner.plan(goal).await?;

    println!("Planner: {}", planner.name());
    println!("Steps: {}", steps.len());

    let errors = dag::plan_errors(&steps, Some(&orchestrator.context().agents));
    if !errors.is_empty() {
        println!("Validation: FAILED");
        for err in &errors {
            println!("  - {}", err);
        }
        anyhow::bail!("{} validation error(s) found", errors.len());
    }
    println!("Validation: OK");

    println!("\nExecution phases:");
    let phases = dag::execution_phases(&steps).map_err(anyhow::Error::msg)?;
    for (i, phase) in phases.iter().enumerate() {
        println!("  {}. {}", i + 1, phase.join(", "));
    }

    println!("\nSteps:");
    for step in &steps {
        let deps = if step.dependencies.is_empty() {
            String::from("(no dependencies)")
        } else {
            format!("depends on: {}", step.dependencies.join(", "))
        };
        println!("  {} [{}] {}", step.id, step.agent_kind, deps);
        if let Some(ref group) = step.parallel_group {
            println!("    group: {}", group);
        }
        if let Some(ref retry) = step.retry {
            println!(
                "    retries: {}, backoff: {}s",
                retry.max_retries, retry.backoff_s
            );
        }
        if let Some(ref handler) = step.on_error {
            println!("    on_error: {}", handler);
        }
    }
    Ok(())
}

async fn cmd_sessions(
    settings: &Settings,
    status: Option<String>,
    goal: Option<String>,
    format: String,
) -> Result<()> {
    let orchestrator = build_orchestrator(settings)?;
    let filter = SessionFilter {
        status: status
            .as_deref()
            .map(|s| {
                s.parse::<SessionStatus>()
                    .map_err(|_| anyhow::anyhow!("Invalid status filter: {}", s))
            })
            .transpose()?,
        goal_contains: goal,
    };
    let sessions = orchestrator.list_sessions(&filter).await?;

    if sessions.is_empty() {
        println!("No sessions found.");
        return Ok(());
    }

    if format == "json" {
        println!("{}", serde_json::to_string_pretty(&sessions)?);
        return Ok(());
    }

    println!(
        "{:<38} {:<12} {:<8} {:<20} GOAL",
        "SESSION ID", "STATUS", "STEPS", "STARTED"
    );
    println!("{}", "-".repeat(100));

    for s in &sessions {
        let goal: String = s.goal.chars().take(40).collect();
        println!(
            "{:<38} {:<12} {:<8} {:<20} {}",
            s.id,
            s.status,
            format!("{}/{}", s.completed_steps, s.total_steps),
            s.started_at.format("%Y-%m-%d %H:%M:%S"),
            goal
        );
    }

    println!("\nTotal: {} session(s)", sessions.len());
    Ok(())
}

async fn cmd_inspect(settings: &Settings, session_id: &str, version: Option<&str>) -> Result<()> {
    let store = FileSessionStore::new(&settings.store_dir);
    let state = crate::storage::SessionStore::resume(&store, session_id, version)
        .await
        .with_context(|| format!("Session '{}' not found", session_id))?;
    println!("{}", serde_json::to_string_pretty(&state)?);
    Ok(())
}

async fn cmd_versions(settings: &Settings, session_id: &str) -> Result<()> {
    let orchestrator = build_orchestrator(settings)?;
    let versions = orchestrator.versions(session_id).await?;
    for (i, v) in versions.iter().enumerate() {
        println!("{:>4}  {}", i + 1, v);
    }
    println!("\nTotal: {} version(s)", versions.len());
    Ok(())
}

async fn cmd_diff(settings: &Settings, session_id: &str, from: &str, to: &str) -> Result<()> {
    let orchestrator = build_orchestrator(settings)?;
    let diff = orchestrator.diff(session_id, from, to).await?;
    if diff.is_empty() {
        println!("No differences.");
    } else {
        println!("{}", serde_json::to_string_pretty(&diff)?);
    }
    Ok(())
}

async fn cmd_abandon(settings: &Settings, session_id: &str) -> Result<()> {
    let orchestrator = build_orchestrator(settings)?;
    orchestrator.abandon(session_id).await?;
    println!("Session {} cancelled.", session_id);
    Ok(())
}

fn cmd_agents(settings: &Settings) -> Result<()> {
    let backend = settings.config.agent_backend()?;
    let backend_name = backend.name().to_string();
    let registry = settings.config.agent_registry(backend);
    let agents = registry.list();

    println!("{:<20} DESCRIPTION", "AGENT KIND");
    println!("{}", "-".repeat(60));

    for (kind, desc) in &agents {
        println!("{:<20} {}", kind, desc);
    }

    println!("\nTotal: {} agent kind(s), backend: {}", agents.len(), backend_name);
    Ok(())
}

/// Ticker intervals from the config file.
pub(crate) fn ticker_intervals(config: &ConductorConfig) -> (Duration, Duration) {
    let secs = |s: f64, fallback: f64| Duration::from_secs_f64(if s > 0.0 { s } else { fallback });
    (
        secs(config.bus.heartbeat_interval_s, 30.0),
        secs(config.bus.sample_interval_s, 5.0),
    )
}

/// Start the ticker for `orchestrator` as configured; stops with `cancel`.
pub(crate) fn start_ticker(
    orchestrator: &Orchestrator,
    config: &ConductorConfig,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    let (heartbeat, sample) = ticker_intervals(config);
    orchestrator.start_monitoring(heartbeat, sample, config.bus.alerts.clone(), cancel)
}
