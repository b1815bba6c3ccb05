//! pairsync CLI: run the relay, pair devices, and manage local records.

use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{CommandFactory, Parser, Subcommand, ValueEnum};
use clap_complete::aot::Generator;
use clap_complete::{generate, shells};
use pairsync::config::Config;
use pairsync::store::{Record, RecordStore, SqliteRecordStore, SyncLogEntry};
use pairsync::sync::protocol::MetadataPayload;
use pairsync::sync::{
    run_sync, ClientOptions, EngineOptions, PairingPayload, SyncEngine, SyncProgress,
};
use pairsync::util::{epoch_millis, truncate_with_ellipsis};
use serde::Serialize;

#[derive(Parser)]
#[command(name = "pairsync")]
#[command(about = "Sync local-first devices through an ephemeral relay")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to config.toml (defaults to the platform config dir)
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Path to the local record database
    #[arg(long, global = true, value_name = "PATH")]
    db_path: Option<PathBuf>,

    /// Log output format
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Pretty)]
    log_format: LogFormat,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the relay server
    Relay {
        /// Bind address (overrides config)
        #[arg(long)]
        host: Option<String>,
        /// Bind port (overrides config and PORT)
        #[arg(short, long)]
        port: Option<u16>,
    },
    /// Start a session, print its pairing code, and sync with joiners
    Pair {
        /// Relay WebSocket URL (overrides config)
        #[arg(long)]
        relay_url: Option<String>,
        /// Number of devices expected to join
        #[arg(long, default_value = "1")]
        peers: usize,
    },
    /// Join a session from a pairing code and sync
    Join {
        /// Pairing code printed by `pairsync pair`
        code: String,
    },
    /// Manage local records
    Records {
        #[command(subcommand)]
        command: RecordCommands,
    },
    /// Show recent sync attempts
    Log {
        /// Number of entries to show
        #[arg(short, long, default_value = "20")]
        limit: usize,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show or rename this device
    Device {
        /// New display name
        #[arg(long)]
        rename: Option<String>,
    },
    /// Generate shell completion scripts
    Completions {
        /// Target shell
        #[arg(value_enum)]
        shell: CompletionShell,
        /// Optional output path (stdout when omitted)
        #[arg(short, long, value_name = "PATH")]
        output: Option<PathBuf>,
    },
}

#[derive(Subcommand)]
enum RecordCommands {
    /// Create a record (JSON, or plain text stored as a string)
    Add { payload: String },
    /// Replace a record's payload
    Edit { id: String, payload: String },
    /// Delete a record (kept as a tombstone so the deletion syncs)
    Delete { id: String },
    /// List records
    List {
        /// Include deleted records
        #[arg(long)]
        all: bool,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, ValueEnum)]
enum LogFormat {
    Pretty,
    Json,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, ValueEnum)]
enum CompletionShell {
    Bash,
    Zsh,
    Fish,
}

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        eprintln!("Error: {error:#}");
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    if let Commands::Completions { shell, output } = &cli.command {
        return run_completions(*shell, output.as_deref());
    }

    let mut config = Config::load(cli.config.as_deref())?;
    if let Some(db_path) = &cli.db_path {
        config.sync.database_path = db_path.display().to_string();
    }

    match cli.command {
        Commands::Relay { host, port } => {
            if let Some(host) = host {
                config.relay.host = host;
            }
            if let Some(port) = port {
                config.relay.port = port;
            }
            pairsync::gateway::run_gateway(config.relay).await
        }
        Commands::Pair { relay_url, peers } => run_pair(&config, relay_url, peers).await,
        Commands::Join { code } => run_join(&config, &code).await,
        Commands::Records { command } => run_records(&config, command),
        Commands::Log { limit, json } => run_log(&config, limit, json),
        Commands::Device { rename } => run_device(&config, rename.as_deref()),
        Commands::Completions { .. } => Ok(()),
    }
}

fn init_tracing(format: LogFormat) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("pairsync=info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr);
    match format {
        LogFormat::Pretty => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

fn open_store(config: &Config) -> Result<Arc<SqliteRecordStore>> {
    let path = config.database_path();
    let store = SqliteRecordStore::open(&path)
        .with_context(|| format!("Failed to open record store {}", path.display()))?;
    Ok(Arc::new(store))
}

fn engine_options(config: &Config, expected_peers: usize) -> EngineOptions {
    EngineOptions {
        chunk_size: config.sync.chunk_size,
        skew_tolerance_ms: config.sync.clock_skew_tolerance_ms(),
        expected_peers,
    }
}

// ── Sync ────────────────────────────────────────────────────────

async fn run_pair(config: &Config, relay_url: Option<String>, peers: usize) -> Result<()> {
    if peers == 0 {
        bail!("--peers must be at least 1");
    }
    let store = open_store(config)?;
    let device = store.local_device()?;
    let relay_url = relay_url.unwrap_or_else(|| config.sync.relay_url.clone());

    let metadata = MetadataPayload::from_versions(store.list_versions()?);
    let ttl = Duration::from_secs(config.sync.pairing_ttl_secs);
    let payload =
        PairingPayload::create(&device.device_id, &metadata, &relay_url, ttl, epoch_millis());

    println!("Pairing code (valid for {}s):\n", ttl.as_secs());
    println!("{}\n", payload.encode()?);
    println!("Run `pairsync join <code>` on the other device.");

    let mut engine = SyncEngine::new(
        Arc::clone(&store) as Arc<dyn RecordStore>,
        device.device_id.as_str(),
        payload.session_id.as_str(),
        engine_options(config, peers),
    );
    let options = ClientOptions::from_config(&config.sync).with_device_name(device.device_name);
    let progress = run_sync(&mut engine, &relay_url, &options).await?;
    print_summary(&progress);
    Ok(())
}

async fn run_join(config: &Config, code: &str) -> Result<()> {
    let payload = PairingPayload::decode(code)?;
    // Expired codes never reach the network.
    let now = epoch_millis();
    payload.validate(now)?;

    let store = open_store(config)?;
    let device = store.local_device()?;
    if device.device_id == payload.device_id {
        bail!("This pairing code was created by this device");
    }
    println!(
        "Joining session {} with {} ({} records, code valid for {}s)",
        truncate_with_ellipsis(&payload.session_id, 8),
        truncate_with_ellipsis(&payload.device_id, 8),
        payload.record_count,
        payload.remaining(now).as_secs()
    );

    let mut engine = SyncEngine::new(
        Arc::clone(&store) as Arc<dyn RecordStore>,
        device.device_id.as_str(),
        payload.session_id.as_str(),
        engine_options(config, 1),
    );
    let options = ClientOptions::from_config(&config.sync).with_device_name(device.device_name);
    let progress = run_sync(&mut engine, &payload.relay_url, &options).await?;
    print_summary(&progress);
    Ok(())
}

fn print_summary(progress: &SyncProgress) {
    println!(
        "Sync complete: {} sent, {} received ({} new, {} updated), {} peer(s).",
        progress.sent, progress.received, progress.inserted, progress.updated, progress.peers_done
    );
    if progress.skewed > 0 {
        println!(
            "Warning: {} received record(s) had timestamps far from this device's clock.",
            progress.skewed
        );
    }
}

// ── Records ─────────────────────────────────────────────────────

#[derive(Serialize)]
struct RecordListItem<'a> {
    id: &'a str,
    payload: &'a serde_json::Value,
    device_id: &'a str,
    created_at: i64,
    updated_at: i64,
    deleted: bool,
}

impl<'a> From<&'a Record> for RecordListItem<'a> {
    fn from(r: &'a Record) -> Self {
        Self {
            id: &r.id,
            payload: &r.payload,
            device_id: &r.device_id,
            created_at: r.created_at,
            updated_at: r.updated_at,
            deleted: r.deleted,
        }
    }
}

/// JSON payloads are stored as given; anything else becomes a JSON string.
fn parse_payload(raw: &str) -> serde_json::Value {
    serde_json::from_str(raw).unwrap_or_else(|_| serde_json::Value::String(raw.to_string()))
}

fn run_records(config: &Config, command: RecordCommands) -> Result<()> {
    let store = open_store(config)?;
    match command {
        RecordCommands::Add { payload } => {
            let device = store.local_device()?;
            let record = Record::new(&device.device_id, parse_payload(&payload), epoch_millis());
            store.upsert(&record)?;
            println!("{}", record.id);
        }
        RecordCommands::Edit { id, payload } => {
            let mut record = live_record(store.as_ref(), &id)?;
            record.edit(parse_payload(&payload), epoch_millis());
            store.upsert(&record)?;
            println!("Updated {id}");
        }
        RecordCommands::Delete { id } => {
            let mut record = live_record(store.as_ref(), &id)?;
            record.tombstone(epoch_millis());
            store.upsert(&record)?;
            println!("Deleted {id}");
        }
        RecordCommands::List { all, json } => {
            let records = store.list_records(all)?;
            if json {
                let items: Vec<RecordListItem<'_>> =
                    records.iter().map(RecordListItem::from).collect();
                println!("{}", serde_json::to_string_pretty(&items)?);
            } else {
                for record in &records {
                    println!("{}", format_record_line(record));
                }
            }
        }
    }
    Ok(())
}

fn live_record(store: &dyn RecordStore, id: &str) -> Result<Record> {
    match store.get(id)? {
        Some(record) if !record.deleted => Ok(record),
        Some(_) => bail!("Record {id} is deleted"),
        None => bail!("Record {id} not found"),
    }
}

fn format_record_line(record: &Record) -> String {
    let marker = if record.deleted { " (deleted)" } else { "" };
    format!(
        "{}  {}  {}{marker}",
        record.id,
        format_millis(record.updated_at),
        truncate_with_ellipsis(&record.payload.to_string(), 60)
    )
}

fn format_millis(ms: i64) -> String {
    chrono::DateTime::from_timestamp_millis(ms)
        .map(|dt| dt.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| ms.to_string())
}

// ── History & device ────────────────────────────────────────────

#[derive(Serialize)]
struct LogItem<'a> {
    session_id: &'a str,
    remote_device_id: &'a str,
    direction: &'static str,
    status: &'static str,
    sent_count: u64,
    received_count: u64,
    started_at: i64,
    completed_at: i64,
    error: Option<&'a str>,
}

impl<'a> From<&'a SyncLogEntry> for LogItem<'a> {
    fn from(e: &'a SyncLogEntry) -> Self {
        Self {
            session_id: &e.session_id,
            remote_device_id: &e.remote_device_id,
            direction: e.direction.as_str(),
            status: e.status.as_str(),
            sent_count: e.sent_count,
            received_count: e.received_count,
            started_at: e.started_at,
            completed_at: e.completed_at,
            error: e.error.as_deref(),
        }
    }
}

fn run_log(config: &Config, limit: usize, json: bool) -> Result<()> {
    let store = open_store(config)?;
    let history = store.sync_history(limit)?;
    if json {
        let items: Vec<LogItem<'_>> = history.iter().map(LogItem::from).collect();
        println!("{}", serde_json::to_string_pretty(&items)?);
        return Ok(());
    }
    if history.is_empty() {
        println!("No sync attempts yet.");
    }
    for entry in &history {
        let error = entry
            .error
            .as_deref()
            .map(|e| format!("  {e}"))
            .unwrap_or_default();
        println!(
            "{}  {:<8}  {:<4}  {} sent / {} received  peer {}{error}",
            format_millis(entry.started_at),
            entry.status.as_str(),
            entry.direction.as_str(),
            entry.sent_count,
            entry.received_count,
            truncate_with_ellipsis(&entry.remote_device_id, 8),
        );
    }
    Ok(())
}

fn run_device(config: &Config, rename: Option<&str>) -> Result<()> {
    let store = open_store(config)?;
    if let Some(name) = rename {
        if name.trim().is_empty() {
            bail!("Device name cannot be empty");
        }
        store.rename_local_device(name)?;
    }
    let device = store.local_device()?;
    println!("{}  {}", device.device_id, device.device_name);
    Ok(())
}

// ── Completions ─────────────────────────────────────────────────

fn run_completions(shell: CompletionShell, output_path: Option<&Path>) -> Result<()> {
    let mut command = Cli::command();
    let mut buffer = Vec::new();

    match shell {
        CompletionShell::Bash => generate_for_shell(shells::Bash, &mut command, &mut buffer),
        CompletionShell::Zsh => generate_for_shell(shells::Zsh, &mut command, &mut buffer),
        CompletionShell::Fish => generate_for_shell(shells::Fish, &mut command, &mut buffer),
    }

    if let Some(path) = output_path {
        std::fs::write(path, &buffer)
            .with_context(|| format!("Failed to write {}", path.display()))?;
        println!("{}", path.display());
    } else {
        io::stdout().write_all(&buffer)?;
    }
    Ok(())
}

fn generate_for_shell<G: Generator>(
    generator: G,
    command: &mut clap::Command,
    buffer: &mut Vec<u8>,
) {
    generate(generator, command, "pairsync", buffer);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn payload_accepts_json_or_text() {
        assert_eq!(parse_payload(r#"{"title":"a"}"#), serde_json::json!({"title": "a"}));
        assert_eq!(parse_payload("buy milk"), serde_json::json!("buy milk"));
    }

    #[test]
    fn parses_record_subcommands() {
        let cli = Cli::try_parse_from(["pairsync", "records", "edit", "id-1", "{}"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::Records {
                command: RecordCommands::Edit { .. }
            }
        ));
        let cli =
            Cli::try_parse_from(["pairsync", "--log-format", "json", "log", "-l", "5"]).unwrap();
        assert_eq!(cli.log_format, LogFormat::Json);
    }

    #[test]
    fn completions_write_bash_script() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pairsync.bash");
        run_completions(CompletionShell::Bash, Some(&path)).unwrap();
        let script = std::fs::read_to_string(&path).unwrap();
        assert!(script.contains("_pairsync()"));
    }

    #[test]
    fn deleted_records_are_not_editable() {
        let store = SqliteRecordStore::open_in_memory().unwrap();
        let mut record = Record::new("dev-a", serde_json::json!(1), 10);
        store.upsert(&record).unwrap();
        assert!(live_record(&store, &record.id).is_ok());
        record.tombstone(20);
        store.upsert(&record).unwrap();
        assert!(live_record(&store, &record.id).is_err());
        assert!(live_record(&store, "missing").is_err());
    }

    #[test]
    fn record_line_marks_tombstones() {
        let mut record = Record::new("dev-a", serde_json::json!("x"), 0);
        record.tombstone(0);
        let line = format_record_line(&record);
        assert!(line.ends_with("(deleted)"));
        assert!(line.contains("1970-01-01 00:00:00"));
    }
}
