//! sessionreel - command line tools for the session capture agent
//!
//! This tool provides commands for:
//! - Checking agent configuration and collector settings
//! - Inspecting and rotating the persisted session record
//! - Replaying a captured JSONL event stream through the delivery pipeline
//!
//! Uses XDG Base Directory specification for file locations:
//! - Config: $XDG_CONFIG_HOME/sessionreel/config.toml (~/.config/sessionreel/config.toml)
//! - Session record and logs: $XDG_STATE_HOME/sessionreel/ (~/.local/state/sessionreel/)

use anyhow::{bail, Context, Result};
use chrono::{TimeZone, Utc};
use clap::{Parser, Subcommand};
use sessionreel_core::transport::MemoryTransport;
use sessionreel_core::{
    AgentConfig, CaptureAgent, Config, DeliveryStats, Event, FileSessionStore, SessionIdentity,
    SessionStore, SystemClock, TerminationPolicy,
};
use std::io::BufRead;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Collector host used for dry runs when none is configured
const DRY_RUN_HOST: &str = "http://localhost";

#[derive(Parser)]
#[command(name = "sessionreel")]
#[command(about = "Session capture agent tools")]
#[command(version)]
struct Args {
    /// Verbose output (writes a log file to the state directory)
    #[arg(short, long)]
    verbose: bool,

    /// Use this config file instead of the default location
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Show agent configuration and status
    Status,

    /// Inspect or reset the persisted session record
    Session {
        #[command(subcommand)]
        action: SessionAction,
    },

    /// Replay a JSONL event capture (one event per line) as a single session
    Replay {
        /// Capture file to replay
        file: PathBuf,

        /// Run the pipeline against an in-memory collector and report what would be sent
        #[arg(long)]
        dry_run: bool,
    },
}

#[derive(Subcommand)]
enum SessionAction {
    /// Show the persisted session record
    Show,

    /// Discard the persisted session and start a new one
    Rotate,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => Config::load_from(path),
        None => Config::load(),
    }
    .context("failed to load configuration")?;

    // Keep the guard alive for the whole command
    let _log_guard = if args.verbose {
        Some(sessionreel_core::logging::init(&config.logging).context("failed to initialize logging")?)
    } else {
        None
    };

    match args.command {
        Command::Status => cmd_status(&config),
        Command::Session { action } => match action {
            SessionAction::Show => cmd_session_show(&config),
            SessionAction::Rotate => cmd_session_rotate(&config),
        },
        Command::Replay { file, dry_run } => cmd_replay(config.agent, &file, dry_run),
    }
}

fn cmd_status(config: &Config) -> Result<()> {
    println!("sessionreel Agent Configuration");
    println!("===============================");
    println!();

    let agent = &config.agent;

    println!(
        "API Host:        {}",
        agent.api_host.as_deref().unwrap_or("<not set>")
    );
    println!(
        "API Key:         {}",
        if agent.api_key.is_some() {
            "<set>"
        } else {
            "<not set>"
        }
    );
    println!("Max Events:      {}", agent.max_events_per_session);
    println!("Flush Threshold: {}", agent.flush_threshold);
    println!("Flush Interval:  {}s", agent.flush_interval_secs);
    match agent.heartbeat_interval() {
        Some(interval) => println!("Heartbeat:       {}s", interval.as_secs()),
        None => println!("Heartbeat:       disabled"),
    }
    println!("Idle Timeout:    {}m", agent.idle_timeout_mins);
    println!("Max Retries:     {}", agent.max_retries);
    println!("Termination:     {}", describe_policy(&agent.termination));
    println!();
    println!("Config File:     {}", Config::config_path().display());
    println!("Session Record:  {}", Config::session_record_path().display());

    println!();
    match agent.validate() {
        Ok(()) => println!("Status: Ready"),
        Err(e) => {
            println!("Status: Not ready ({})", e);
            println!();
            println!("Set the collector in config.toml:");
            println!();
            println!("  [agent]");
            println!("  api_host = \"https://your-collector.example\"");
            println!("  api_key = \"sk_live_xxxxxxxxxxxx\"");
        }
    }

    Ok(())
}

fn describe_policy(policy: &TerminationPolicy) -> String {
    match policy {
        TerminationPolicy::VisibilityBased => "visibility based".to_string(),
        TerminationPolicy::DurationGated { min_duration_secs } => {
            format!("duration gated ({}s minimum)", min_duration_secs)
        }
    }
}

fn cmd_session_show(config: &Config) -> Result<()> {
    let store = FileSessionStore::default_location();
    let record = store
        .load()
        .with_context(|| format!("failed to read {}", store.path().display()))?;

    let Some(record) = record else {
        println!("No persisted session at {}", store.path().display());
        return Ok(());
    };

    let now_ms = Utc::now().timestamp_millis();
    let idle = chrono::Duration::milliseconds(now_ms.saturating_sub(record.last_seen_at));
    let fresh = idle.to_std().unwrap_or_default() < config.agent.idle_timeout();
    let last_seen = Utc
        .timestamp_millis_opt(record.last_seen_at)
        .single()
        .map(|t| t.to_rfc3339())
        .unwrap_or_else(|| record.last_seen_at.to_string());

    println!("Session ID:  {}", record.session_id);
    println!("Last Seen:   {} ({}m ago)", last_seen, idle.num_minutes());
    println!(
        "Next Start:  {}",
        if fresh {
            "reuses this session"
        } else {
            "starts a new session (idle timeout passed)"
        }
    );

    Ok(())
}

fn cmd_session_rotate(config: &Config) -> Result<()> {
    let store = FileSessionStore::default_location();
    let identity = SessionIdentity::new(
        Some(Arc::new(store.clone())),
        Arc::new(SystemClock),
        config.agent.idle_timeout(),
    );

    let previous = store.load().ok().flatten();
    let session_id = identity.rotate();

    // rotate() only logs storage failures; confirm the record landed
    let persisted = store
        .load()
        .with_context(|| format!("failed to read {}", store.path().display()))?;
    if persisted.map(|r| r.session_id) != Some(session_id.clone()) {
        bail!("failed to persist session record to {}", store.path().display());
    }

    if let Some(previous) = previous {
        println!("Previous:    {}", previous.session_id);
    }
    println!("New Session: {}", session_id);

    Ok(())
}

fn read_capture(path: &Path) -> Result<Vec<Event>> {
    let file =
        std::fs::File::open(path).with_context(|| format!("failed to open {}", path.display()))?;

    let mut events = Vec::new();
    for (index, line) in std::io::BufReader::new(file).lines().enumerate() {
        let line = line.with_context(|| format!("failed to read {}", path.display()))?;
        if line.trim().is_empty() {
            continue;
        }
        let event = serde_json::from_str(&line)
            .with_context(|| format!("{}:{}: invalid JSON event", path.display(), index + 1))?;
        events.push(event);
    }
    Ok(events)
}

fn cmd_replay(mut agent_config: AgentConfig, file: &Path, dry_run: bool) -> Result<()> {
    let events = read_capture(file)?;
    tracing::info!(file = %file.display(), events = events.len(), dry_run, "Replaying capture");

    let transport = dry_run.then(|| Arc::new(MemoryTransport::new()));
    if dry_run && agent_config.api_host.is_none() {
        agent_config.api_host = Some(DRY_RUN_HOST.to_string());
    }

    let mut builder = CaptureAgent::builder(agent_config);
    if let Some(transport) = &transport {
        builder = builder.transport(transport.clone()).without_persistence();
    }
    let agent = builder.build().context("failed to create capture agent")?;

    // Same single-threaded runtime shape the agent would get embedded in a page
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to build tokio runtime")?;

    let event_count = events.len();
    let (session_id, stats) = runtime.block_on(async {
        agent.start().await;
        let session_id = agent
            .session()
            .map(|s| s.session_id)
            .unwrap_or_default();
        for event in events {
            agent.record(event).await;
        }
        agent.stop().await;
        (session_id, agent.stats())
    });

    println!("Session:         {}", session_id);
    println!("Events read:     {}", event_count);
    print_stats(&stats);

    if let Some(transport) = transport {
        println!();
        println!("Dry run: {} request(s) recorded", transport.sent().len());
        println!("  Batches:       {}", transport.uploads().len());
        println!("  Events:        {}", transport.uploaded_events().len());
        println!("  End signals:   {}", transport.beacons().len());
    }

    if stats.events_requeued > 0 && stats.uploads_ok == 0 {
        bail!("no batch was accepted by the collector");
    }

    Ok(())
}

fn print_stats(stats: &DeliveryStats) {
    println!();
    println!("Stats:");
    println!("  Accepted:      {}", stats.events_accepted);
    println!("  Dropped:       {}", stats.events_dropped);
    println!("  Uploads:       {}", stats.uploads_ok);
    println!("  Failures:      {}", stats.uploads_failed);
    println!("  Requeued:      {}", stats.events_requeued);
    println!("  End signals:   {}", stats.termination_signals);
}
