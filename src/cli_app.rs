//! Top-level CLI definition and dispatch.

use std::io::{self, IsTerminal, Write};
use std::path::PathBuf;
use std::thread::JoinHandle;

use clap::{Args, CommandFactory, Parser, Subcommand};
use clap_complete::{Shell as CompletionShell, generate};
use colored::{Colorize, control};
use serde_json::{Value, json};
use thiserror::Error;

use alert_ingest::core::config::Config;
use alert_ingest::core::errors::IngestError;
use alert_ingest::ingest::{CancelToken, Pipeline, PipelineOptions};
use alert_ingest::logger::{EventLoggerConfig, EventLoggerHandle, IngestEvent, spawn_event_logger};
use alert_ingest::model::run::{IngestionRun, RunStatus};
use alert_ingest::source::registry::SourceRegistry;
use alert_ingest::storage::AlertStore;
use alert_ingest::storage::sqlite::SqliteStore;

/// Astronomical alert ingestion with per-source reassociation tracking.
#[derive(Debug, Parser)]
#[command(
    name = "alert-ingest",
    author,
    version,
    about = "Ingest astronomical alerts into SQLite and track SSO reassociations",
    long_about = None,
    arg_required_else_help = true
)]
pub struct Cli {
    /// Override config file path.
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,
    /// Override the SQLite database path.
    #[arg(long, global = true, value_name = "PATH")]
    database: Option<PathBuf>,
    /// Force JSON output mode.
    #[arg(long, global = true)]
    json: bool,
    /// Disable colored output.
    #[arg(long, global = true)]
    no_color: bool,
    /// Increase verbosity.
    #[arg(short, long, global = true, conflicts_with = "quiet")]
    verbose: bool,
    /// Quiet mode (errors only).
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    quiet: bool,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Subcommand)]
enum Command {
    /// Run one ingestion pass from a source into storage.
    Ingest(IngestArgs),
    /// List recent ingestion runs.
    Runs(RunsArgs),
    /// Show storage statistics.
    Stats,
    /// Show tracked state for one detection source.
    State(StateArgs),
    /// Remove state rows not observed recently.
    Cleanup(CleanupArgs),
    /// Copy the database to another file while it stays online.
    Backup(BackupArgs),
    /// List registered source names.
    Sources,
    /// View configuration state.
    Config(ConfigArgs),
    /// Generate shell completions.
    Completions(CompletionsArgs),
}

#[derive(Debug, Clone, Args, Default)]
struct IngestArgs {
    /// Registry name of the source (defaults to `source.name`).
    #[arg(long, value_name = "NAME")]
    source: Option<String>,
    /// File or directory for file-backed sources.
    #[arg(long, value_name = "PATH")]
    path: Option<PathBuf>,
    /// Alerts to generate (mock source).
    #[arg(long, value_name = "N")]
    count: Option<u64>,
    /// RNG seed (mock source).
    #[arg(long, value_name = "SEED")]
    seed: Option<u64>,
    #[arg(long, value_name = "N")]
    batch_size: Option<usize>,
    /// Stop after receiving this many alerts.
    #[arg(long, value_name = "N")]
    max_records: Option<u64>,
    /// Stop after this many seconds.
    #[arg(long, value_name = "SECONDS")]
    max_duration_secs: Option<u64>,
    /// Classify without writing anything.
    #[arg(long)]
    dry_run: bool,
    /// Do not skip alerts that are already stored.
    #[arg(long)]
    no_dedup: bool,
    /// Do not classify or update per-source state.
    #[arg(long)]
    no_state: bool,
}

#[derive(Debug, Clone, Args)]
struct RunsArgs {
    /// Maximum number of runs to show.
    #[arg(long, default_value_t = 10, value_name = "N")]
    limit: u32,
}

#[derive(Debug, Clone, Args)]
struct StateArgs {
    /// Detection source identifier.
    #[arg(value_name = "ENTITY_ID", allow_hyphen_values = true)]
    entity_id: i64,
}

#[derive(Debug, Clone, Args)]
struct CleanupArgs {
    /// Age threshold in days (defaults to `retention.state_max_age_days`).
    #[arg(long, value_name = "DAYS")]
    days: Option<u32>,
    /// Compact the database afterwards.
    #[arg(long)]
    vacuum: bool,
}

#[derive(Debug, Clone, Args)]
struct BackupArgs {
    /// Destination file for the copy.
    #[arg(value_name = "PATH")]
    path: PathBuf,
}

#[derive(Debug, Clone, Args, Default)]
struct ConfigArgs {
    #[command(subcommand)]
    command: Option<ConfigCommand>,
}

#[derive(Debug, Clone, Subcommand)]
enum ConfigCommand {
    /// Print resolved config file path.
    Path,
    /// Print effective merged configuration.
    Show,
    /// Validate configuration and exit.
    Validate,
}

#[derive(Debug, Clone, Args)]
struct CompletionsArgs {
    /// Shell to generate completion script for.
    #[arg(value_enum)]
    shell: CompletionShell,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OutputMode {
    Human,
    Json,
}

/// CLI error type with explicit exit-code mapping.
#[derive(Debug, Error)]
pub enum CliError {
    /// Invalid user input or configuration.
    #[error("{0}")]
    User(String),
    /// Environment/runtime failure.
    #[error("{0}")]
    Runtime(String),
    /// Internal bug or invariant violation.
    #[error("{0}")]
    Internal(String),
    /// Run finished but some alerts were not stored.
    #[error("{0}")]
    Partial(String),
    #[error("failed to serialize output: {0}")]
    Json(#[from] serde_json::Error),
    #[error("failed to write output: {0}")]
    Io(#[from] io::Error),
}

impl CliError {
    /// Process exit code contract for the CLI.
    pub const fn exit_code(&self) -> i32 {
        match self {
            Self::User(_) => 1,
            Self::Runtime(_) | Self::Io(_) => 2,
            Self::Internal(_) | Self::Json(_) => 3,
            Self::Partial(_) => 4,
        }
    }
}

impl From<IngestError> for CliError {
    fn from(e: IngestError) -> Self {
        match e {
            IngestError::InvalidConfig { .. }
            | IngestError::MissingConfig { .. }
            | IngestError::ConfigParse { .. }
            | IngestError::InvalidRecord { .. }
            | IngestError::UnknownSource { .. }
            | IngestError::DuplicateSource { .. } => Self::User(e.to_string()),
            IngestError::PipelineReused | IngestError::ChannelClosed { .. } => {
                Self::Internal(e.to_string())
            }
            _ => Self::Runtime(e.to_string()),
        }
    }
}

/// Dispatch CLI commands.
pub fn run(cli: &Cli) -> Result<(), CliError> {
    if cli.no_color {
        control::set_override(false);
    }

    match &cli.command {
        Command::Ingest(args) => run_ingest(cli, args),
        Command::Runs(args) => run_runs(cli, args),
        Command::Stats => run_stats(cli),
        Command::State(args) => run_state(cli, args),
        Command::Cleanup(args) => run_cleanup(cli, args),
        Command::Backup(args) => run_backup(cli, args),
        Command::Sources => run_sources(cli),
        Command::Config(args) => run_config(cli, args),
        Command::Completions(args) => {
            let mut command = Cli::command();
            let binary_name = command.get_name().to_string();
            generate(args.shell, &mut command, binary_name, &mut io::stdout());
            Ok(())
        }
    }
}

fn load_config(cli: &Cli) -> Result<Config, CliError> {
    let mut config = Config::load(cli.config.as_deref())?;
    if let Some(db) = &cli.database {
        config.storage.database.clone_from(db);
    }
    Ok(config)
}

fn open_store(config: &Config) -> Result<SqliteStore, CliError> {
    let store =
        SqliteStore::open_with_timeout(&config.storage.database, config.storage.busy_timeout_ms)?;
    Ok(store)
}

/// Event logger thread, or `None` when logging is disabled.
fn start_event_logger(
    cli: &Cli,
    config: &Config,
) -> Option<(EventLoggerHandle, JoinHandle<()>)> {
    if !config.logging.enabled {
        return None;
    }
    match spawn_event_logger(EventLoggerConfig::from_logging(&config.logging)) {
        Ok(pair) => Some(pair),
        Err(e) => {
            if !cli.quiet {
                eprintln!("[AIN-CLI] event log disabled: {e}");
            }
            None
        }
    }
}

fn stop_event_logger(logger: Option<(EventLoggerHandle, JoinHandle<()>)>) {
    if let Some((handle, join)) = logger {
        handle.shutdown();
        let _ = join.join();
    }
}

fn apply_ingest_overrides(config: &mut Config, args: &IngestArgs) {
    if let Some(name) = &args.source {
        config.source.name = name.trim().to_ascii_lowercase();
    }
    if let Some(path) = &args.path {
        config.source.path = Some(path.clone());
    }
    if let Some(count) = args.count {
        config.source.count = count;
    }
    if let Some(seed) = args.seed {
        config.source.seed = seed;
    }
    if let Some(batch_size) = args.batch_size {
        config.ingest.batch_size = batch_size;
    }
    if args.max_records.is_some() {
        config.ingest.max_records = args.max_records;
    }
    if args.max_duration_secs.is_some() {
        config.ingest.max_duration_secs = args.max_duration_secs;
    }
    if args.dry_run {
        config.ingest.dry_run = true;
    }
    if args.no_dedup {
        config.ingest.skip_duplicates = false;
    }
    if args.no_state {
        config.ingest.track_state = false;
    }
}

fn run_ingest(cli: &Cli, args: &IngestArgs) -> Result<(), CliError> {
    let mut config = load_config(cli)?;
    apply_ingest_overrides(&mut config, args);
    config.validate()?;

    let registry = SourceRegistry::with_builtins();
    let source = registry.create(&config.source.name, &config.source)?;
    let mut store = open_store(&config)?;
    let config_hash = config.stable_hash()?;
    if cli.verbose {
        eprintln!(
            "[AIN-CLI] source={} database={} config_hash={config_hash}",
            config.source.name,
            config.storage.database.display()
        );
    }

    let logger = if config.ingest.dry_run {
        None
    } else {
        start_event_logger(cli, &config)
    };
    if let Some((handle, _)) = &logger {
        handle.send(IngestEvent::ConfigLoaded {
            path: config.paths.config_file.to_string_lossy().into_owned(),
            config_hash: config_hash.clone(),
        });
        let migration = store.migration();
        if migration.migrated() {
            handle.send(IngestEvent::SchemaMigrated {
                from_version: migration.from_version,
                to_version: migration.to_version,
            });
        }
    }

    let mut pipeline = Pipeline::new(source, &mut store, PipelineOptions::from(&config.ingest))
        .with_cancel_token(CancelToken::with_signal_handlers())
        .with_metadata("config_hash", config_hash)
        .with_metadata("source", config.source.name.clone());
    if let Some((handle, _)) = &logger {
        pipeline = pipeline.with_event_logger(handle.clone());
    }

    let outcome = pipeline.run();
    let last_run = pipeline.last_run().cloned();
    drop(pipeline);
    stop_event_logger(logger);

    if let Some(run) = &last_run {
        emit_run_summary(cli, run, config.ingest.dry_run)?;
    }
    let run = outcome?;
    if run.counts.alerts_failed > 0 {
        return Err(CliError::Partial(format!(
            "{} of {} alerts failed to store",
            run.counts.alerts_failed, run.counts.alerts_received
        )));
    }
    Ok(())
}

fn emit_run_summary(cli: &Cli, run: &IngestionRun, dry_run: bool) -> Result<(), CliError> {
    match output_mode(cli) {
        OutputMode::Human => {
            if cli.quiet {
                return Ok(());
            }
            let c = &run.counts;
            let id = run.id.map_or_else(|| "-".to_string(), |id| id.to_string());
            let prefix = if dry_run { "[dry run] " } else { "" };
            println!(
                "{prefix}Run {id} ({}) {}",
                run.source_name,
                status_label(run.status)
            );
            if let Some(reason) = run.stop_reason {
                println!("  Stop reason:     {}", reason.as_str());
            }
            println!("  Received:        {}", c.alerts_received);
            println!("  Stored:          {}", c.alerts_stored);
            println!("  Duplicates:      {}", c.duplicates_skipped);
            println!("  Failed:          {}", c.alerts_failed);
            println!("  Invalid skipped: {}", c.records_skipped);
            println!("  New sources:     {}", c.new_sources);
            println!("  Updated sources: {}", c.updated_sources);
            println!("  Reassociations:  {}", c.reassociations_detected);
            println!(
                "  Batches:         {} written, {} failed",
                c.batches_written, c.batches_failed
            );
            if c.state_update_failures > 0 {
                println!("  State failures:  {}", c.state_update_failures);
            }
            if c.unflushed_on_failure > 0 {
                println!("  Unflushed:       {}", c.unflushed_on_failure);
            }
            println!(
                "  Duration:        {:.2}s ({:.1} alerts/s, {:.1}% success)",
                run.duration_secs(),
                run.processing_rate(),
                run.success_rate() * 100.0
            );
            if let Some(message) = &run.error_message {
                println!("  Error:           {}", message.red());
            }
        }
        OutputMode::Json => {
            let payload = json!({
                "command": "ingest",
                "dry_run": dry_run,
                "run": serde_json::to_value(run)?,
                "duration_seconds": run.duration_secs(),
                "alerts_per_second": run.processing_rate(),
                "success_rate": run.success_rate(),
            });
            write_json_line(&payload)?;
        }
    }
    Ok(())
}

fn status_label(status: RunStatus) -> String {
    let label = status.as_str().to_ascii_uppercase();
    match status {
        RunStatus::Completed => label.green().to_string(),
        RunStatus::Failed => label.red().bold().to_string(),
        RunStatus::Cancelled => label.yellow().to_string(),
        RunStatus::Running => label.cyan().to_string(),
    }
}

fn run_runs(cli: &Cli, args: &RunsArgs) -> Result<(), CliError> {
    let config = load_config(cli)?;
    let store = open_store(&config)?;
    let runs = store.recent_runs(args.limit)?;

    match output_mode(cli) {
        OutputMode::Human => {
            if runs.is_empty() {
                println!("No ingestion runs recorded.");
                return Ok(());
            }
            println!(
                "{:>5}  {:<24}  {:<10}  {:<11}  {:>9}  {:>9}  {:>7}  {:>7}",
                "ID", "STARTED", "SOURCE", "STATUS", "RECEIVED", "STORED", "FAILED", "REASSOC"
            );
            for run in &runs {
                println!(
                    "{:>5}  {:<24}  {:<10}  {:<11}  {:>9}  {:>9}  {:>7}  {:>7}",
                    run.id.unwrap_or_default(),
                    run.started_at.format("%Y-%m-%d %H:%M:%S UTC"),
                    run.source_name,
                    status_label(run.status),
                    run.counts.alerts_received,
                    run.counts.alerts_stored,
                    run.counts.alerts_failed,
                    run.counts.reassociations_detected,
                );
            }
        }
        OutputMode::Json => {
            let payload = json!({
                "command": "runs",
                "runs": serde_json::to_value(&runs)?,
            });
            write_json_line(&payload)?;
        }
    }
    Ok(())
}

fn run_stats(cli: &Cli) -> Result<(), CliError> {
    let config = load_config(cli)?;
    let store = open_store(&config)?;
    let stats = store.stats()?;

    match output_mode(cli) {
        OutputMode::Human => {
            println!("Database: {}", config.storage.database.display());
            println!("  Schema version:    {}", stats.schema_version);
            println!("  Alerts:            {}", stats.alerts);
            println!("  SSO-associated:    {}", stats.sso_alerts);
            println!("  Reassociations:    {}", stats.reassociation_alerts);
            println!("  Tracked sources:   {}", stats.tracked_sources);
            println!("  Ingestion runs:    {}", stats.ingestion_runs);
            if let (Some(min), Some(max)) = (stats.min_mjd, stats.max_mjd) {
                println!(
                    "  MJD range:         {min:.5} .. {max:.5} ({:.2} days)",
                    stats.mjd_span_days().unwrap_or_default()
                );
            }
            if let Some(bytes) = stats.file_size_bytes {
                println!("  File size:         {bytes} bytes");
            }
        }
        OutputMode::Json => {
            let payload = json!({
                "command": "stats",
                "database": config.storage.database.to_string_lossy(),
                "stats": serde_json::to_value(&stats)?,
            });
            write_json_line(&payload)?;
        }
    }
    Ok(())
}

fn run_state(cli: &Cli, args: &StateArgs) -> Result<(), CliError> {
    let config = load_config(cli)?;
    let store = open_store(&config)?;
    let Some(state) = store.get_state(args.entity_id)? else {
        if output_mode(cli) == OutputMode::Json {
            write_json_line(&json!({
                "command": "state",
                "dia_source_id": args.entity_id,
                "found": false,
            }))?;
        }
        return Err(CliError::User(format!(
            "no tracked state for detection source {}",
            args.entity_id
        )));
    };

    match output_mode(cli) {
        OutputMode::Human => {
            println!("Detection source {}", state.dia_source_id);
            println!("  First seen (MJD):  {:.5}", state.first_seen_mjd);
            println!("  Last seen (MJD):   {:.5}", state.last_seen_mjd);
            println!("  Observations:      {}", state.observation_count);
            println!(
                "  SSO object:        {}",
                state.ss_object_id.as_deref().unwrap_or("-")
            );
            if let Some(t) = state.ss_object_reassoc_time_mjd {
                println!("  Reassociated at:   {t:.5}");
            }
            println!("  Updated:           {}", state.updated_at.to_rfc3339());
        }
        OutputMode::Json => {
            let payload = json!({
                "command": "state",
                "found": true,
                "state": serde_json::to_value(&state)?,
            });
            write_json_line(&payload)?;
        }
    }
    Ok(())
}

fn run_cleanup(cli: &Cli, args: &CleanupArgs) -> Result<(), CliError> {
    let config = load_config(cli)?;
    let days = args.days.unwrap_or(config.retention.state_max_age_days);
    if days == 0 {
        return Err(CliError::User("--days must be at least 1".to_string()));
    }
    let mut store = open_store(&config)?;
    let removed = store.cleanup_old_state(days)?;
    if args.vacuum {
        store.vacuum()?;
    }

    let logger = start_event_logger(cli, &config);
    if let Some((handle, _)) = &logger {
        handle.send(IngestEvent::StateCleanup {
            max_age_days: days,
            removed: removed as u64,
        });
    }
    stop_event_logger(logger);

    match output_mode(cli) {
        OutputMode::Human => {
            if !cli.quiet {
                println!("Removed {removed} source states not seen in {days} days.");
            }
        }
        OutputMode::Json => {
            let payload = json!({
                "command": "cleanup",
                "max_age_days": days,
                "removed": removed,
                "vacuumed": args.vacuum,
            });
            write_json_line(&payload)?;
        }
    }
    Ok(())
}

fn run_backup(cli: &Cli, args: &BackupArgs) -> Result<(), CliError> {
    let config = load_config(cli)?;
    let store = open_store(&config)?;
    store.backup(&args.path)?;
    let bytes = std::fs::metadata(&args.path).map(|m| m.len()).ok();

    match output_mode(cli) {
        OutputMode::Human => {
            if !cli.quiet {
                println!(
                    "Backed up {} to {}.",
                    config.storage.database.display(),
                    args.path.display()
                );
            }
        }
        OutputMode::Json => {
            let payload = json!({
                "command": "backup",
                "database": config.storage.database.to_string_lossy(),
                "path": args.path.to_string_lossy(),
                "bytes": bytes,
            });
            write_json_line(&payload)?;
        }
    }
    Ok(())
}

fn run_sources(cli: &Cli) -> Result<(), CliError> {
    let registry = SourceRegistry::with_builtins();
    let names = registry.names();
    match output_mode(cli) {
        OutputMode::Human => {
            for name in &names {
                println!("{name}");
            }
        }
        OutputMode::Json => {
            write_json_line(&json!({ "command": "sources", "sources": names }))?;
        }
    }
    Ok(())
}

fn run_config(cli: &Cli, args: &ConfigArgs) -> Result<(), CliError> {
    match &args.command {
        None | Some(ConfigCommand::Path) => {
            let path = cli.config.clone().unwrap_or_else(Config::default_path);
            let exists = path.exists();

            match output_mode(cli) {
                OutputMode::Human => {
                    println!("{}", path.display());
                    if !exists {
                        println!("  (file does not exist; defaults will be used)");
                    }
                }
                OutputMode::Json => {
                    let payload = json!({
                        "command": "config path",
                        "path": path.to_string_lossy(),
                        "exists": exists,
                    });
                    write_json_line(&payload)?;
                }
            }
            Ok(())
        }
        Some(ConfigCommand::Show) => {
            let config = load_config(cli)?;
            match output_mode(cli) {
                OutputMode::Human => println!("{}", config.to_toml()?),
                OutputMode::Json => {
                    let payload = json!({
                        "command": "config show",
                        "config": serde_json::to_value(&config)?,
                    });
                    write_json_line(&payload)?;
                }
            }
            Ok(())
        }
        Some(ConfigCommand::Validate) => match load_config(cli) {
            Ok(config) => {
                let hash = config.stable_hash()?;
                match output_mode(cli) {
                    OutputMode::Human => {
                        println!("Configuration is valid.");
                        println!("  Source: {}", config.paths.config_file.display());
                        println!("  Hash: {hash}");
                    }
                    OutputMode::Json => {
                        let payload = json!({
                            "command": "config validate",
                            "valid": true,
                            "path": config.paths.config_file.to_string_lossy(),
                            "hash": hash,
                        });
                        write_json_line(&payload)?;
                    }
                }
                Ok(())
            }
            Err(e) => {
                match output_mode(cli) {
                    OutputMode::Human => eprintln!("Configuration is INVALID: {e}"),
                    OutputMode::Json => {
                        let payload = json!({
                            "command": "config validate",
                            "valid": false,
                            "error": e.to_string(),
                        });
                        write_json_line(&payload)?;
                    }
                }
                Err(CliError::User(format!("invalid config: {e}")))
            }
        },
    }
}

fn write_json_line(payload: &Value) -> Result<(), CliError> {
    let mut stdout = io::stdout().lock();
    serde_json::to_writer(&mut stdout, payload)?;
    writeln!(stdout)?;
    Ok(())
}

fn output_mode(cli: &Cli) -> OutputMode {
    let env_mode = std::env::var("ALERT_INGEST_OUTPUT_FORMAT").ok();
    resolve_output_mode(cli.json, env_mode.as_deref(), io::stdout().is_terminal())
}

fn resolve_output_mode(json_flag: bool, env_mode: Option<&str>, stdout_is_tty: bool) -> OutputMode {
    if json_flag {
        return OutputMode::Json;
    }

    let fallback = if stdout_is_tty {
        OutputMode::Human
    } else {
        OutputMode::Json
    };

    match env_mode
        .map(str::trim)
        .map(str::to_ascii_lowercase)
        .as_deref()
    {
        Some("json") => OutputMode::Json,
        Some("human") => OutputMode::Human,
        _ => fallback,
    }
}
