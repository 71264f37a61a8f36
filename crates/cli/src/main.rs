mod config;
mod error;

use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{Local, TimeZone};
use clap::{Parser, Subcommand};
use policy::Capability;
use runtime::consent::{self, ConsentChannel, ConsentDesk, ConsentPrompt};
use runtime::{Authority, EscalationOutcome, Session};
use storage::{Event, EventKind, EventStore};
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use config::Config;
use error::{Error, Result};

const CONFIG_FILE: &str = "capgate.toml";
const LOG_ENV: &str = "CAPGATE_LOG";
const DEFAULT_REASON: &str = "interactive request";

#[derive(Parser)]
#[command(name = "capgate")]
#[command(about = "Capability authority for mixing sessions", long_about = None)]
#[command(version)]
struct Cli {
    /// Path to the config file (defaults to ./capgate.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start an interactive capability session
    Session,
    /// List recorded sessions
    Sessions {
        /// Show only the last N sessions
        #[arg(short, long, default_value = "10")]
        limit: usize,
    },
    /// Show audit events for a session
    Logs {
        /// Session ID (prefix match supported)
        #[arg(short, long)]
        session: String,
        /// Filter by event kind (denied, halted, escalation_settled, ...)
        #[arg(short, long)]
        kind: Option<String>,
    },
    /// Print the effective policy
    Policy,
}

#[tokio::main]
async fn main() {
    init_tracing();
    if let Err(e) = run().await {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_target(false)
        .init();
}

async fn run() -> Result<()> {
    let cli = Cli::parse();
    let (config, source) = load_config(cli.config.as_deref())?;

    match cli.command {
        Some(Commands::Session) | None => cmd_session(config, &source).await,
        Some(Commands::Sessions { limit }) => cmd_sessions(&config, limit),
        Some(Commands::Logs { session, kind }) => cmd_logs(&config, &session, kind.as_deref()),
        Some(Commands::Policy) => cmd_policy(&config, &source),
    }
}

/// What a REPL command asks the loop to do next.
enum Flow {
    Continue,
    Quit,
}

async fn cmd_session(config: Config, source: &str) -> Result<()> {
    println!("capgate v{}", env!("CARGO_PKG_VERSION"));
    println!("Policy: {source}");

    let mut session_config = config.session_config();
    if let Some(path) = audit_path(&config)? {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        session_config = session_config.with_audit(EventStore::open(&path)?);
        println!("Audit log: {}", path.display());
    }

    let session = Session::init(session_config)?;
    let authority = Arc::clone(session.authority());
    let (channel, mut desk) = consent::channel(1);

    println!("Session ID: {}", session.id());
    println!("Bound to process: {}", authority.process_identity().pid);
    println!("Type 'help' for commands, 'quit' or Ctrl+D to exit.\n");

    loop {
        let Some(line) = read_line("> ")? else {
            break;
        };
        let mut words = line.split_whitespace();
        let Some(command) = words.next() else {
            continue;
        };
        let args: Vec<&str> = words.collect();

        match run_command(&authority, &channel, &mut desk, command, &args).await {
            Ok(Flow::Continue) => {}
            Ok(Flow::Quit) => break,
            Err(e) => {
                debug!(command, error = %e, "command failed");
                eprintln!("Error: {e}\n");
            }
        }
    }

    session.teardown();
    println!("\nSession ended.");
    Ok(())
}

async fn run_command(
    authority: &Arc<Authority>,
    channel: &ConsentChannel,
    desk: &mut ConsentDesk,
    command: &str,
    args: &[&str],
) -> Result<Flow> {
    match command {
        "quit" | "exit" => return Ok(Flow::Quit),
        "help" => print_help(),
        "check" => {
            let Some((capability, reason)) = parse_request(args)? else {
                println!("usage: check <capability> [reason]");
                return Ok(Flow::Continue);
            };
            let before = authority.last_denial();
            let allowed = authority.check(capability, &reason);
            report_check(authority, &capability.to_string(), allowed, before);
        }
        "all" => {
            let Some(list) = args.first() else {
                println!("usage: all <capability,capability,...> [reason]");
                return Ok(Flow::Continue);
            };
            let capabilities = list
                .split(',')
                .filter(|s| !s.is_empty())
                .map(str::parse)
                .collect::<std::result::Result<Vec<Capability>, _>>()?;
            let reason = join_reason(&args[1..]);
            let before = authority.last_denial();
            let allowed = authority.check_all_of(&capabilities, &reason);
            report_check(authority, list, allowed, before);
        }
        "escalate" => {
            let Some((capability, reason)) = parse_request(args)? else {
                println!("usage: escalate <capability> [reason]");
                return Ok(Flow::Continue);
            };
            escalate(authority, channel, desk, capability, reason).await?;
        }
        "revoke" => {
            let Some((capability, _)) = parse_request(args)? else {
                println!("usage: revoke <capability>");
                return Ok(Flow::Continue);
            };
            let count = authority.revoke(capability)?;
            println!("revoked {count} grant(s) for {capability}");
        }
        "expire" => {
            let count = authority.expire_pending();
            println!("expired {count} pending checkpoint(s)");
        }
        "status" => {
            let status = serde_json::to_string_pretty(&authority.status())
                .map_err(|e| Error::Encode(e.to_string()))?;
            println!("{status}");
        }
        "verify" => {
            match args.first() {
                Some(pid) => {
                    let pid = pid
                        .parse::<u32>()
                        .map_err(|e| Error::Usage(format!("invalid pid '{pid}': {e}")))?;
                    authority.verify_identity(pid)?;
                    println!("process {pid} matches the session binding");
                }
                None => {
                    authority.verify_current_process()?;
                    println!("this process matches the session binding");
                }
            }
        }
        other => println!("unknown command '{other}', type 'help' for commands"),
    }
    Ok(Flow::Continue)
}

fn print_help() {
    println!("  check <capability> [reason]       check a single capability");
    println!("  all <cap,cap,...> [reason]        check that every capability is held");
    println!("  escalate <capability> [reason]    request step-up consent");
    println!("  revoke <capability>               remove grants for a capability");
    println!("  expire                            expire overdue checkpoints");
    println!("  status                            print the session status");
    println!("  verify [pid]                      verify the process identity");
    println!("  quit                              end the session");
    println!();
    let names: Vec<_> = Capability::ALL.iter().map(Capability::as_str).collect();
    println!("capabilities: {}", names.join(", "));
}

fn parse_request(args: &[&str]) -> Result<Option<(Capability, String)>> {
    let Some(name) = args.first() else {
        return Ok(None);
    };
    let capability = name.parse::<Capability>()?;
    Ok(Some((capability, join_reason(&args[1..]))))
}

fn join_reason(words: &[&str]) -> String {
    if words.is_empty() {
        DEFAULT_REASON.to_string()
    } else {
        words.join(" ")
    }
}

fn report_check(
    authority: &Authority,
    what: &str,
    allowed: bool,
    before: Option<runtime::DenialRecord>,
) {
    if allowed {
        println!("{what}: allowed");
        return;
    }
    match authority.last_denial() {
        Some(denial) if Some(&denial) != before.as_ref() => {
            println!("{what}: denied ({}): {}", denial.error.kind, denial.error.message);
        }
        _ => println!("{what}: not granted"),
    }
}

/// Run one checkpoint with this terminal as the consent surface.
async fn escalate(
    authority: &Arc<Authority>,
    channel: &ConsentChannel,
    desk: &mut ConsentDesk,
    capability: Capability,
    reason: String,
) -> Result<()> {
    let mut task = tokio::spawn({
        let authority = Arc::clone(authority);
        let channel = channel.clone();
        async move { channel.escalate(&authority, capability, &reason).await }
    });

    let outcome = tokio::select! {
        result = &mut task => result?,
        prompt = desk.next() => {
            if let Some(prompt) = prompt {
                answer(prompt)?;
            }
            task.await?
        }
    };

    let outcome = outcome?;
    info!(%capability, outcome = outcome.as_str(), "escalation finished");
    match outcome {
        EscalationOutcome::Confirmed => println!("{capability} granted for this session"),
        outcome => println!("{capability} not granted ({})", outcome.as_str()),
    }
    Ok(())
}

fn answer(prompt: ConsentPrompt) -> Result<()> {
    println!("\n{}", prompt.token.challenge_payload);
    println!("(press Enter to dismiss)");
    match read_line("consent> ")? {
        Some(response) if !response.is_empty() => prompt.respond(response),
        _ => prompt.dismiss(),
    }
    Ok(())
}

/// Read one trimmed line. `None` on EOF.
fn read_line(prompt: &str) -> Result<Option<String>> {
    let mut stdout = io::stdout();
    print!("{prompt}");
    stdout.flush()?;

    let mut line = String::new();
    if io::stdin().lock().read_line(&mut line)? == 0 {
        return Ok(None);
    }
    Ok(Some(line.trim().to_string()))
}

fn cmd_sessions(config: &Config, limit: usize) -> Result<()> {
    let store = open_store(config)?;
    let sessions = store.list_sessions()?;

    if sessions.is_empty() {
        println!("No sessions found.");
        return Ok(());
    }

    println!(
        "{:<36}  {:<20}  {:<8}  STATUS",
        "SESSION ID", "STARTED", "DENIALS"
    );
    println!("{}", "-".repeat(80));

    for summary in sessions.into_iter().take(limit) {
        let started = Local
            .from_utc_datetime(&summary.started_at.naive_utc())
            .format("%Y-%m-%d %H:%M");
        let status = if summary.halted {
            "halted"
        } else if summary.ended_at.is_some() {
            "ended"
        } else {
            "active"
        };
        println!(
            "{:<36}  {:<20}  {:<8}  {status}",
            summary.id, started, summary.denial_count
        );
    }

    Ok(())
}

fn cmd_logs(config: &Config, session_prefix: &str, kind_filter: Option<&str>) -> Result<()> {
    let store = open_store(config)?;

    let sessions = store.list_sessions()?;
    let matching: Vec<_> = sessions
        .iter()
        .filter(|s| s.id.to_string().starts_with(session_prefix))
        .collect();

    let session_id = match matching.as_slice() {
        [] => {
            return Err(Error::SessionNotFound {
                prefix: session_prefix.to_string(),
            });
        }
        [only] => only.id,
        _ => {
            return Err(Error::AmbiguousSession {
                prefix: session_prefix.to_string(),
                matches: matching.iter().map(|s| s.id.to_string()).collect(),
            });
        }
    };

    let events = store.load_events(session_id, kind_filter)?;

    if events.is_empty() {
        println!("No events found for session {session_id}");
        return Ok(());
    }

    println!("Session: {session_id}\n");

    for event in events {
        print_event(&event);
    }

    Ok(())
}

fn print_event(event: &Event) {
    let time = Local
        .from_utc_datetime(&event.timestamp.naive_utc())
        .format("%H:%M:%S");

    match &event.kind {
        EventKind::SessionStart { pid } => {
            println!("[{time}] === Session started (pid {pid}) ===");
        }
        EventKind::SessionEnd => {
            println!("[{time}] === Session ended ===");
        }
        EventKind::GrantAdded {
            capability,
            ephemeral,
        } => {
            let scope = if *ephemeral { "step-up" } else { "standing" };
            println!("[{time}] GRANT: {capability} ({scope})");
        }
        EventKind::GrantRevoked { capability, count } => {
            println!("[{time}] REVOKE: {capability} x{count}");
        }
        EventKind::Denied {
            capabilities,
            reason,
            error_kind,
            message,
        } => {
            let names: Vec<_> = capabilities.iter().map(Capability::as_str).collect();
            println!(
                "[{time}] DENIED [{}] {error_kind}: {message} (reason: {reason})",
                names.join(", ")
            );
        }
        EventKind::EscalationRequested {
            token_id,
            capability,
            reason,
        } => {
            println!("[{time}] ESCALATE: {capability} token {token_id} (reason: {reason})");
        }
        EventKind::EscalationSettled {
            token_id,
            capability,
            outcome,
        } => {
            println!(
                "[{time}] SETTLED: {capability} token {token_id} {}",
                outcome.as_str()
            );
        }
        EventKind::Halted { message } => {
            println!("[{time}] !!! HALTED: {message}");
        }
    }
}

fn cmd_policy(config: &Config, source: &str) -> Result<()> {
    let policy = toml::to_string_pretty(&config.policy).map_err(|e| Error::Encode(e.to_string()))?;
    println!("# source: {source}");
    println!(
        "# consent: challenge={:?} token_ttl_secs={}",
        config.consent.challenge, config.consent.token_ttl_secs
    );
    match audit_path(config) {
        Ok(Some(path)) => println!("# audit: {}", path.display()),
        Ok(None) => println!("# audit: disabled"),
        Err(e) => println!("# audit: {e}"),
    }
    println!();
    print!("{policy}");
    Ok(())
}

fn load_config(path: Option<&Path>) -> Result<(Config, String)> {
    if let Some(path) = path {
        return Ok((Config::load(path)?, path.display().to_string()));
    }
    let default_path = Path::new(CONFIG_FILE);
    if default_path.exists() {
        Ok((Config::load(default_path)?, CONFIG_FILE.to_string()))
    } else {
        Ok((Config::default_config(), "default (restrictive)".to_string()))
    }
}

/// Where audit events go, or `None` when auditing is disabled.
fn audit_path(config: &Config) -> Result<Option<PathBuf>> {
    if !config.audit.enabled {
        return Ok(None);
    }
    if let Some(path) = &config.audit.path {
        return Ok(Some(path.clone()));
    }
    dirs_data_dir()
        .map(|dir| Some(dir.join("audit.db")))
        .ok_or(Error::NoDataDir)
}

fn open_store(config: &Config) -> Result<EventStore> {
    let db_path = match &config.audit.path {
        Some(path) => path.clone(),
        None => dirs_data_dir().ok_or(Error::NoDataDir)?.join("audit.db"),
    };

    if !db_path.exists() {
        return Err(Error::DatabaseNotFound { path: db_path });
    }

    Ok(EventStore::open(&db_path)?)
}

fn dirs_data_dir() -> Option<PathBuf> {
    #[cfg(target_os = "macos")]
    {
        std::env::var_os("HOME").map(|h| PathBuf::from(h).join(".local/share/capgate"))
    }
    #[cfg(target_os = "linux")]
    {
        std::env::var_os("XDG_DATA_HOME")
            .map(PathBuf::from)
            .or_else(|| std::env::var_os("HOME").map(|h| PathBuf::from(h).join(".local/share")))
            .map(|p| p.join("capgate"))
    }
    #[cfg(target_os = "windows")]
    {
        std::env::var_os("APPDATA").map(|h| PathBuf::from(h).join("capgate"))
    }
    #[cfg(not(any(target_os = "macos", target_os = "linux", target_os = "windows")))]
    {
        None
    }
}
