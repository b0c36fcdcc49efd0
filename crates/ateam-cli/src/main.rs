use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use ateam_core::context::should_warn;
use ateam_core::dispatch::resolve_route;
use ateam_core::permissions::ConfirmationPort;
use ateam_core::rate_limit::default_limits;
use ateam_core::session::validate_room_name;
use ateam_core::{
    CancellationToken, ContextWindowManager, Dispatcher, FileSystemExecutor, Message, Operation,
    PermissionEngine, PermissionMode, PermissionOutcome, ProviderRegistry, RateLimiter, Role,
    RoomSession, SessionReply, SqliteHistory, SystemClock, ToolExecutor, ToolRequest, TurnReport,
    export_room,
};

mod config;

use config::AteamConfig;

#[derive(Parser)]
#[command(name = "ateam")]
#[command(version)]
#[command(about = "A-Team: several AI agents in one room")]
struct Cli {
    /// Path to config file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize config directory and default config
    Init,

    /// Show current configuration
    Config,

    /// Open (or create) a room and read messages and /directives from stdin
    Join {
        /// Room name: letters, digits, '-' and '_'
        room: String,
    },

    /// List rooms, most recently active first
    Rooms,

    /// Write a room's transcript as Markdown
    Export {
        room: String,
        /// Directory for the file (defaults to the current directory)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Show which agents a message would go to, and how
    Route {
        /// The message, with @Agent tags
        message: String,
        /// Agent for untagged messages (defaults to the configured one)
        #[arg(long)]
        default: Option<String>,
    },

    /// Prune a JSON transcript to fit an agent's context window
    Prune {
        /// JSON array of messages
        transcript: PathBuf,
        /// Agent whose window and system prompt to use
        #[arg(long)]
        agent: Option<String>,
        /// Override the token budget
        #[arg(long)]
        max_tokens: Option<usize>,
    },

    /// Check (and optionally run) a tool request against the permission engine
    Tool {
        /// Requesting agent
        agent: String,
        /// Operation or tool name (read, write_file, delete, shell, ...)
        operation: String,
        /// Target path
        path: PathBuf,
        /// File content, move destination, chmod mode or shell command
        #[arg(long)]
        content: Option<String>,
        /// Override the configured permission mode
        #[arg(long)]
        mode: Option<PermissionMode>,
        /// Run the request if allowed (asks on stdin when confirmation is needed)
        #[arg(long)]
        execute: bool,
    },

    /// Show configured rate limits
    Limits,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Set up logging
    let filter = if cli.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Init => cmd_init().await,
        Commands::Config => cmd_config(&cli.config).await,
        Commands::Join { room } => cmd_join(&cli.config, &room).await,
        Commands::Rooms => cmd_rooms(&cli.config).await,
        Commands::Export { room, output } => cmd_export(&cli.config, &room, output).await,
        Commands::Route { message, default } => {
            cmd_route(&cli.config, &message, default.as_deref()).await
        }
        Commands::Prune {
            transcript,
            agent,
            max_tokens,
        } => cmd_prune(&cli.config, &transcript, agent.as_deref(), max_tokens).await,
        Commands::Tool {
            agent,
            operation,
            path,
            content,
            mode,
            execute,
        } => {
            let mut request = ToolRequest::new(Operation::from_tool_name(&operation), path);
            if let Some(content) = content {
                request = request.with_content(content);
            }
            cmd_tool(&cli.config, &agent, request, mode, execute).await
        }
        Commands::Limits => cmd_limits(&cli.config).await,
    }
}

async fn cmd_init() -> Result<()> {
    let config_dir = config::config_dir();
    tokio::fs::create_dir_all(&config_dir)
        .await
        .with_context(|| format!("Failed to create config dir: {}", config_dir.display()))?;

    let config_path = config_dir.join("config.toml");
    if config_path.exists() {
        warn!("Config already exists at {}", config_path.display());
    } else {
        let default_config = include_str!("../../../config/default.toml");
        tokio::fs::write(&config_path, default_config).await?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            tokio::fs::set_permissions(&config_path, std::fs::Permissions::from_mode(0o600))
                .await?;
        }
        info!("Created default config at {}", config_path.display());
    }

    let rooms = config_dir.join("rooms");
    tokio::fs::create_dir_all(&rooms).await?;

    println!("ateam initialized at {}", config_dir.display());
    println!("Edit {} to configure your agents.", config_path.display());
    Ok(())
}

async fn cmd_config(config_path: &Option<PathBuf>) -> Result<()> {
    let config = AteamConfig::load(config_path)?;
    let rendered = toml::to_string_pretty(&config).context("Failed to render config")?;
    println!("{rendered}");
    Ok(())
}

async fn cmd_route(
    config_path: &Option<PathBuf>,
    message: &str,
    default_agent: Option<&str>,
) -> Result<()> {
    let config = AteamConfig::load(config_path)?;
    let agents = config.agent_manager()?;
    let parsed = resolve_route(&agents, message, default_agent)?;

    println!("Mode:    {}", parsed.mode);
    println!(
        "Agents:  {}",
        parsed
            .target_agents
            .iter()
            .map(|a| format!("@{a}"))
            .collect::<Vec<_>>()
            .join(" -> ")
    );
    println!("Message: {}", parsed.clean_message);
    Ok(())
}

async fn cmd_prune(
    config_path: &Option<PathBuf>,
    transcript: &Path,
    agent: Option<&str>,
    max_tokens: Option<usize>,
) -> Result<()> {
    let config = AteamConfig::load(config_path)?;
    let agents = config.agent_manager()?;
    let agent = agent.unwrap_or_else(|| agents.default_agent());
    let Some(profile) = agents.get(agent) else {
        bail!("Unknown agent '@{}'", agent);
    };

    let raw = tokio::fs::read_to_string(transcript)
        .await
        .with_context(|| format!("Failed to read {}", transcript.display()))?;
    let messages: Vec<Message> = serde_json::from_str(&raw)
        .with_context(|| format!("{} is not a JSON array of messages", transcript.display()))?;

    let mut context = config.dispatcher.context;
    if max_tokens.is_some() {
        context.max_tokens = max_tokens;
    }
    let budget = context.budget_for(profile);
    let manager = ContextWindowManager::default();
    let system_tokens = manager.count(&profile.system_prompt);

    let pruned = manager.prune(&messages, system_tokens, budget)?;
    let usage = manager.token_usage(&pruned.messages, system_tokens, budget);

    eprintln!(
        "{} -> {} messages, {} tokens removed, {} of {} tokens ({}%)",
        messages.len(),
        pruned.messages.len(),
        pruned.tokens_removed,
        usage.total,
        usage.max_tokens,
        usage.percent
    );
    if should_warn(usage.total, usage.max_tokens) {
        warn!("Context is above 85% of the window for @{}", agent);
    }
    println!("{}", serde_json::to_string_pretty(&pruned.messages)?);
    Ok(())
}

/// Print `prompt` and read one line; `None` at end of input
async fn prompt_line(prompt: String) -> Option<String> {
    tokio::task::spawn_blocking(move || {
        use std::io::{BufRead, Write};
        print!("{prompt}");
        let _ = std::io::stdout().flush();
        let mut line = String::new();
        match std::io::stdin().lock().read_line(&mut line) {
            Ok(0) | Err(_) => None,
            Ok(_) => Some(line),
        }
    })
    .await
    .ok()
    .flatten()
}

/// Asks on the terminal; anything but y/yes is a no
struct StdinConfirmation;

#[async_trait]
impl ConfirmationPort for StdinConfirmation {
    async fn confirm(&self, agent: &str, request: &ToolRequest, reason: &str) -> bool {
        let prompt = format!("@{agent} wants to {request} ({reason}). Allow? [y/N] ");
        prompt_line(prompt)
            .await
            .is_some_and(|line| matches!(line.trim().to_lowercase().as_str(), "y" | "yes"))
    }
}

async fn cmd_join(config_path: &Option<PathBuf>, room: &str) -> Result<()> {
    let config = AteamConfig::load(config_path)?;
    let agents = config.agent_manager()?;
    let rooms_dir = config.rooms_dir();
    let clock = Arc::new(SystemClock::new());

    let mut limits = default_limits();
    limits.extend(config.rate_limits.clone());
    let limiter = Arc::new(RateLimiter::new(clock.clone()).with_limits(limits));

    let permissions = PermissionEngine::new(&config.permissions, &config.workspace(), clock);
    let tools = Arc::new(FileSystemExecutor::new(permissions.base_dir()));
    // provider adapters are registered by embedders; this binary ships none
    let dispatcher = Dispatcher::new(
        agents,
        ProviderRegistry::new(),
        Arc::new(SqliteHistory::new(&rooms_dir)),
        tools,
    )
    .with_rate_limiter(limiter)
    .with_confirmation(Arc::new(StdinConfirmation))
    .with_config(config.dispatcher.clone());

    let mut session = RoomSession::open(room, &rooms_dir, &dispatcher, permissions).await?;
    println!("Joined room '{}'. Type /help for directives, Ctrl-C cancels a running turn.", room);

    loop {
        let prompt = format!("[{}] @{}> ", room, session.default_agent());
        let Some(line) = prompt_line(prompt).await else {
            let dropped = session.close();
            if dropped > 0 {
                println!("{dropped} queued operations were denied.");
            }
            break;
        };

        let cancel = CancellationToken::new();
        let reply = {
            let turn = session.handle_input(&dispatcher, &line, &cancel);
            tokio::pin!(turn);
            loop {
                tokio::select! {
                    reply = &mut turn => break reply,
                    _ = tokio::signal::ctrl_c() => {
                        warn!("Cancelling the current turn");
                        cancel.cancel();
                    }
                }
            }
        };

        match reply {
            Ok(SessionReply::Turn(report)) => print_report(&report),
            Ok(SessionReply::Batch(batch)) => println!("{}", batch.render()),
            Ok(SessionReply::Notice(text)) => println!("{text}"),
            Ok(SessionReply::Exit { dropped }) => {
                if dropped > 0 {
                    println!("{dropped} queued operations were denied.");
                }
                break;
            }
            Ok(SessionReply::Ignored) => {}
            Err(e) => eprintln!("Error: {e}"),
        }
    }
    println!("Left room '{room}'.");
    Ok(())
}

fn print_report(report: &TurnReport) {
    for outcome in &report.outcomes {
        for message in &outcome.messages {
            match message.role {
                Role::Assistant => println!("@{}: {}", outcome.agent, message.content),
                _ => println!("  {}", message.content.replace('\n', "\n  ")),
            }
        }
        if let Some(e) = &outcome.error {
            eprintln!("@{} failed: {}", outcome.agent, e);
        }
    }
    for warning in report.warnings() {
        eprintln!("warning: {warning}");
    }
    if report.queued() > 0 {
        println!("{} operations queued; use /approve, /deny or /review.", report.queued());
    }
    if !report.skipped.is_empty() {
        println!("Skipped: {}", report.skipped.iter().map(|a| format!("@{a}")).collect::<Vec<_>>().join(", "));
    }
    if report.cancelled {
        println!("Turn cancelled.");
    }
}

async fn cmd_rooms(config_path: &Option<PathBuf>) -> Result<()> {
    let config = AteamConfig::load(config_path)?;
    let rooms = SqliteHistory::new(config.rooms_dir()).list_rooms().await?;
    if rooms.is_empty() {
        println!("No rooms found. Create one with: ateam join <room>");
        return Ok(());
    }

    println!("{:<32} {:>8}  LAST ACTIVE", "ROOM", "MESSAGES");
    for room in &rooms {
        let last = room
            .last_active
            .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
            .unwrap_or_else(|| "-".to_string());
        println!("{:<32} {:>8}  {}", room.name, room.message_count, last);
    }
    println!("\nTotal: {} room(s)", rooms.len());
    Ok(())
}

async fn cmd_export(config_path: &Option<PathBuf>, room: &str, output: Option<PathBuf>) -> Result<()> {
    validate_room_name(room)?;
    let config = AteamConfig::load(config_path)?;
    let rooms_dir = config.rooms_dir();
    if !rooms_dir.join(room).join("history.db").is_file() {
        bail!("Room '{}' not found in {}", room, rooms_dir.display());
    }

    let history = SqliteHistory::new(&rooms_dir);
    let out_dir = output.unwrap_or_else(|| PathBuf::from("."));
    let path = export_room(&history, room, &out_dir).await?;
    println!("Transcript written to {}", path.display());
    Ok(())
}

async fn cmd_tool(
    config_path: &Option<PathBuf>,
    agent: &str,
    request: ToolRequest,
    mode: Option<PermissionMode>,
    execute: bool,
) -> Result<()> {
    let config = AteamConfig::load(config_path)?;
    let agents = config.agent_manager()?;
    let Some(profile) = agents.get(agent) else {
        bail!("Unknown agent '@{}'", agent);
    };

    let workspace = config.workspace();
    let mut permissions = config.permissions.clone();
    if let Some(mode) = mode {
        permissions.mode = mode;
    }
    let mut engine = PermissionEngine::new(&permissions, &workspace, Arc::new(SystemClock::new()));
    engine.set_agent_ceiling(agent, profile.trust_level);

    let decision = engine.authorize(agent, &request);
    println!("{:?}: {}", decision.outcome, decision.reason);
    if !execute {
        return Ok(());
    }

    let approved = match decision.outcome {
        PermissionOutcome::Allow => true,
        PermissionOutcome::Deny => false,
        PermissionOutcome::NeedsConfirmation => {
            StdinConfirmation
                .confirm(agent, &request, &decision.reason)
                .await
        }
    };
    if !approved {
        bail!("Permission denied: {}", request);
    }

    let executor = FileSystemExecutor::new(engine.base_dir());
    let output = executor.execute(&request).await?;
    println!("{output}");
    Ok(())
}

async fn cmd_limits(config_path: &Option<PathBuf>) -> Result<()> {
    let config = AteamConfig::load(config_path)?;
    let mut limits = default_limits();
    limits.extend(config.rate_limits.clone());

    let mut keys: Vec<&String> = limits.keys().collect();
    keys.sort();
    for key in keys {
        let limit = limits[key];
        println!("{:<12} {:>5} calls / {}s", key, limit.limit, limit.window_secs);
    }
    Ok(())
}
