//! Kioku CLI - inspect and administer the session persistence engine.

#![allow(clippy::print_stdout)] // CLI program intentionally uses stdout

use clap::{Args, Parser, Subcommand};
use kioku::prelude::*;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::Level;
use tracing_subscriber::EnvFilter;

/// Kioku - dual-tier conversation persistence engine
#[derive(Parser)]
#[command(name = "kioku")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Verbosity level (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Configuration file path
    #[arg(short, long, env = "KIOKU_CONFIG", global = true)]
    config: Option<PathBuf>,

    /// Database file path (overrides configuration)
    #[arg(long, env = "KIOKU_DB", global = true)]
    db: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show engine status and tier health
    Status,

    /// List sessions for an owner
    Sessions(SessionsArgs),

    /// Print the conversation history of a session
    History(HistoryArgs),

    /// Show stored and recomputed statistics for a session
    Stats(SessionArg),

    /// Check session counters against the stored message rows
    Reconcile(SessionArg),

    /// Migrate a session to the durable store and archive it
    Close(SessionArg),

    /// Permanently delete a session and all its messages
    Cleanup(SessionArg),

    /// Manage configuration
    Config(ConfigArgs),
}

/// Arguments for the sessions command
#[derive(Args)]
struct SessionsArgs {
    /// Owner identifier
    owner: String,
}

/// Arguments for the history command
#[derive(Args)]
struct HistoryArgs {
    /// Session id
    session: String,

    /// Maximum number of messages to print
    #[arg(short, long)]
    limit: Option<usize>,

    /// Number of messages to skip
    #[arg(short, long, default_value_t = 0)]
    offset: usize,
}

/// A single session-id argument
#[derive(Args)]
struct SessionArg {
    /// Session id
    session: String,
}

/// Arguments for the config command
#[derive(Args)]
struct ConfigArgs {
    #[command(subcommand)]
    command: ConfigCommands,
}

#[derive(Subcommand)]
enum ConfigCommands {
    /// Show current configuration
    Show,
    /// Show configuration file path
    Path,
    /// Write a default configuration file
    Init,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    init_logging(cli.verbose);

    let rt = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            tracing::error!("failed to create tokio runtime: {e}");
            return ExitCode::FAILURE;
        }
    };

    match rt.block_on(run(cli)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("{e}");
            ExitCode::FAILURE
        }
    }
}

/// Initialize logging with the given verbosity level.
fn init_logging(verbosity: u8) {
    let level = match verbosity {
        0 => Level::INFO,
        1 => Level::DEBUG,
        _ => Level::TRACE,
    };

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "kioku={level},{}",
            if verbosity >= 2 { "debug" } else { "warn" }
        ))
    });

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(verbosity >= 2)
        .init();
}

/// Main async entry point.
async fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Status => cmd_status(cli.config, cli.db).await,
        Commands::Sessions(args) => cmd_sessions(args, cli.config, cli.db).await,
        Commands::History(args) => cmd_history(args, cli.config, cli.db).await,
        Commands::Stats(args) => cmd_stats(args, cli.config, cli.db).await,
        Commands::Reconcile(args) => cmd_reconcile(args, cli.config, cli.db).await,
        Commands::Close(args) => cmd_close(args, cli.config, cli.db).await,
        Commands::Cleanup(args) => cmd_cleanup(args, cli.config, cli.db).await,
        Commands::Config(args) => cmd_config(args, cli.config).await,
    }
}

/// Load configuration and assemble an engine.
async fn build_engine(config_path: Option<PathBuf>, db: Option<PathBuf>) -> Result<Engine> {
    let mut config = load_config(config_path.as_ref()).await?;
    if let Some(db) = db {
        config.durable.path = db;
    }
    Engine::builder().config(config).build()
}

/// Show engine status.
async fn cmd_status(config_override: Option<PathBuf>, db: Option<PathBuf>) -> Result<()> {
    let config = load_config(config_override.as_ref()).await?;
    let db_path = db.clone().unwrap_or_else(|| config.durable.path.clone());

    println!("Kioku Status\n");
    println!("Configuration:");
    println!("  Path:     {}", config_override.unwrap_or_else(config_path).display());
    println!("  Database: {}", db_path.display());
    println!(
        "  Idle timeout: {}s",
        config.cache.idle_timeout_ms / 1_000
    );

    let mut engine_config = config;
    engine_config.durable.path = db_path;
    let engine = Engine::builder().config(engine_config).build()?;
    let snapshot = engine.probe_now().await;
    println!();
    println!("Tiers:");
    println!("  Cache:   {}", if snapshot.cache { "up" } else { "down" });
    println!("  Durable: {}", if snapshot.durable { "up" } else { "down" });
    println!("  Overall: {:?}", snapshot.state());

    Ok(())
}

/// List sessions for an owner.
async fn cmd_sessions(
    args: SessionsArgs,
    config_path: Option<PathBuf>,
    db: Option<PathBuf>,
) -> Result<()> {
    let engine = build_engine(config_path, db).await?;
    let sessions = engine.list_sessions(&args.owner).await?;

    if sessions.is_empty() {
        println!("No sessions for owner '{}'.", args.owner);
        return Ok(());
    }

    for session in sessions {
        println!(
            "{}  [{}]  {} messages  {}",
            session.id,
            session.status.as_str(),
            session.total_count,
            session.title,
        );
    }
    Ok(())
}

/// Print conversation history.
async fn cmd_history(
    args: HistoryArgs,
    config_path: Option<PathBuf>,
    db: Option<PathBuf>,
) -> Result<()> {
    let engine = build_engine(config_path, db).await?;
    let history = engine
        .get_history(&args.session, args.limit, args.offset)
        .await?;

    for message in history {
        let tool = message
            .tool_name
            .as_deref()
            .map(|name| format!(" [tool: {name}]"))
            .unwrap_or_default();
        println!(
            "{:>5}  {:<5}{}  {}",
            message.order,
            message.role.as_str(),
            tool,
            message.content,
        );
    }
    Ok(())
}

/// Show session statistics.
async fn cmd_stats(
    args: SessionArg,
    config_path: Option<PathBuf>,
    db: Option<PathBuf>,
) -> Result<()> {
    let engine = build_engine(config_path, db).await?;
    let stats = engine.get_session_stats(&args.session).await?;

    println!("Session {}", stats.session.id);
    println!("  Owner:  {}", stats.session.owner);
    println!("  Title:  {}", stats.session.title);
    println!("  Status: {}", stats.session.status.as_str());
    println!();
    println!("Stored counters:");
    println!("  Total: {}", stats.session.total_count);
    println!("  User:  {}", stats.session.user_count);
    println!("  Agent: {}", stats.session.agent_count);
    println!();
    println!("Recomputed:");
    println!("  Total:        {}", stats.recomputed.total);
    println!("  User:         {}", stats.recomputed.user);
    println!("  Agent:        {}", stats.recomputed.agent);
    println!("  Tool queries: {}", stats.recomputed.tool_queries);

    Ok(())
}

/// Reconcile counters against message rows.
async fn cmd_reconcile(
    args: SessionArg,
    config_path: Option<PathBuf>,
    db: Option<PathBuf>,
) -> Result<()> {
    let engine = build_engine(config_path, db).await?;
    let report = engine.reconcile(&args.session).await?;

    println!("Session {}", report.session_id);
    println!(
        "  Stored:     total={} user={} agent={}",
        report.stored.0, report.stored.1, report.stored.2
    );
    println!(
        "  Recomputed: total={} user={} agent={}",
        report.actual.total, report.actual.user, report.actual.agent
    );
    println!(
        "  Consistent: {}",
        if report.consistent { "yes" } else { "NO" }
    );
    Ok(())
}

/// Close (migrate and archive) a session.
async fn cmd_close(
    args: SessionArg,
    config_path: Option<PathBuf>,
    db: Option<PathBuf>,
) -> Result<()> {
    let engine = build_engine(config_path, db).await?;
    engine.close_session(&args.session).await?;
    println!("Session {} archived.", args.session);
    Ok(())
}

/// Permanently delete a session.
async fn cmd_cleanup(
    args: SessionArg,
    config_path: Option<PathBuf>,
    db: Option<PathBuf>,
) -> Result<()> {
    let engine = build_engine(config_path, db).await?;
    engine.cleanup_session(&args.session).await?;
    println!("Session {} deleted.", args.session);
    Ok(())
}

/// Configuration management.
async fn cmd_config(args: ConfigArgs, config_override: Option<PathBuf>) -> Result<()> {
    let config_file = config_override.unwrap_or_else(config_path);

    match args.command {
        ConfigCommands::Path => {
            println!("{}", config_file.display());
        }
        ConfigCommands::Show => {
            if config_file.exists() {
                let content = tokio::fs::read_to_string(&config_file).await?;
                println!("{content}");
            } else {
                println!("Configuration file does not exist.");
                println!("Run 'kioku config init' to create one.");
            }
        }
        ConfigCommands::Init => {
            if config_file.exists() {
                println!("Configuration already exists at: {}", config_file.display());
                return Ok(());
            }
            save_config(&EngineConfig::default(), Some(&config_file)).await?;
            println!("Configuration created: {}", config_file.display());
        }
    }
    Ok(())
}
