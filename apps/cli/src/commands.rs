//! CLI command definitions, routing, and tracing setup.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use color_eyre::eyre::{Result, eyre};
use indicatif::{ProgressBar, ProgressStyle};
use tracing::{info, warn};

use warehouse_core::{ExecutionRegistry, IngestService, query_status};
use warehouse_shared::{
    AppConfig, ExecutionStatus, HistoryEntry, HistoryFilter, HistoryStatus, MetadataUpdate, WorkerConfig,
    expand_home, init_config, load_config, resolve_source_credentials,
};
use warehouse_source::ErpSource;
use warehouse_storage::Storage;

/// How often `run` checks on its execution.
const RUN_POLL_INTERVAL: Duration = Duration::from_millis(250);

// ---------------------------------------------------------------------------
// CLI structure
// ---------------------------------------------------------------------------

/// Warehouse: ingest ERP datasets and track pipeline runs.
#[derive(Parser)]
#[command(
    name = "warehouse",
    version,
    about = "Pull datasets from an ERP source into a local store and track ingestion runs.",
    long_about = None,
)]
pub(crate) struct Cli {
    /// Log format: text (default) or json.
    #[arg(long, default_value = "text", global = true)]
    pub log_format: LogFormat,

    /// Verbosity level (-v, -vv, -vvv).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Database path (overrides `defaults.database_path`).
    #[arg(long, global = true, env = "WAREHOUSE_DB")]
    pub db: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

/// Log output format.
#[derive(Clone, Debug, clap::ValueEnum)]
pub(crate) enum LogFormat {
    Text,
    Json,
}

/// Top-level CLI subcommands.
#[derive(Subcommand)]
pub(crate) enum Command {
    /// Ingest a pipeline's dataset and wait for the run to finish.
    Run {
        /// Pipeline / dataset identifier (e.g. soil_collection).
        pipeline: String,

        /// Requester id.
        #[arg(short, long)]
        user: String,

        /// Requester display name (defaults to the id).
        #[arg(short, long)]
        name: Option<String>,
    },

    /// Show the latest execution status for a dataset and requester.
    Status {
        dataset: String,

        #[arg(short, long)]
        user: String,
    },

    /// Show pipeline run history.
    History {
        /// Pipeline name. Omit to list every pipeline.
        pipeline: Option<String>,

        /// Only runs whose requester name contains this text.
        #[arg(long, requires = "pipeline")]
        requester: Option<String>,

        /// Only pipelines whose name contains this text.
        #[arg(long, conflicts_with = "pipeline")]
        search: Option<String>,

        /// Only runs at or after this RFC 3339 timestamp.
        #[arg(long)]
        since: Option<DateTime<Utc>>,
    },

    /// List datasets a requester owns.
    Datasets {
        #[arg(short, long)]
        user: String,
    },

    /// Print one dataset as JSON.
    Show {
        dataset: String,

        /// Include the stored rows.
        #[arg(long)]
        rows: bool,
    },

    /// Edit a dataset's description, tags or permissions.
    Describe {
        dataset: String,

        #[arg(long)]
        description: Option<String>,

        /// Replace the tag list (comma-separated).
        #[arg(long, value_delimiter = ',')]
        tags: Option<Vec<String>>,

        #[arg(long)]
        permissions: Option<String>,
    },

    /// Configuration management.
    Config {
        /// Config subcommand.
        #[command(subcommand)]
        action: ConfigAction,
    },
}

/// Config subcommands.
#[derive(Subcommand)]
pub(crate) enum ConfigAction {
    /// Initialize config file with defaults.
    Init,
    /// Show resolved configuration.
    Show,
}

// ---------------------------------------------------------------------------
// Tracing setup
// ---------------------------------------------------------------------------

/// Initialize tracing based on CLI flags.
pub(crate) fn init_tracing(cli: &Cli) {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = match cli.verbose {
        0 => "warehouse=info",
        1 => "warehouse=debug",
        _ => "warehouse=trace",
    };

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

    match cli.log_format {
        LogFormat::Text => {
            fmt()
                .with_env_filter(env_filter)
                .with_target(false)
                .with_writer(std::io::stderr)
                .init();
        }
        LogFormat::Json => {
            fmt()
                .json()
                .with_env_filter(env_filter)
                .with_writer(std::io::stderr)
                .init();
        }
    }
}

// ---------------------------------------------------------------------------
// Command dispatch
// ---------------------------------------------------------------------------

/// Run the CLI command.
pub(crate) async fn run(cli: Cli) -> Result<()> {
    let db = cli.db;
    match cli.command {
        Command::Run {
            pipeline,
            user,
            name,
        } => cmd_run(db, &pipeline, &user, name.as_deref()).await,
        Command::Status { dataset, user } => cmd_status(db, &dataset, &user).await,
        Command::History {
            pipeline,
            requester,
            search,
            since,
        } => {
            let filter = HistoryFilter {
                name_contains: requester.or(search),
                since,
            };
            cmd_history(db, pipeline.as_deref(), &filter).await
        }
        Command::Datasets { user } => cmd_datasets(db, &user).await,
        Command::Show { dataset, rows } => cmd_show(db, &dataset, rows).await,
        Command::Describe {
            dataset,
            description,
            tags,
            permissions,
        } => {
            let update = MetadataUpdate {
                description,
                tags,
                permissions,
            };
            cmd_describe(db, &dataset, &update).await
        }
        Command::Config { action } => match action {
            ConfigAction::Init => cmd_config_init().await,
            ConfigAction::Show => cmd_config_show().await,
        },
    }
}

fn database_path(db: Option<PathBuf>, config: &AppConfig) -> Result<PathBuf> {
    match db {
        Some(path) => Ok(path),
        None => Ok(expand_home(&config.defaults.database_path)?),
    }
}

/// Open the store for queries. A missing database is reported, not created.
async fn open_for_reading(db: Option<PathBuf>) -> Result<Storage> {
    let config = load_config()?;
    let path = database_path(db, &config)?;
    if !path.exists() {
        return Err(eyre!(
            "no database at {}; run `warehouse run <pipeline>` first",
            path.display()
        ));
    }
    Ok(Storage::open_readonly(&path).await?)
}

// ---------------------------------------------------------------------------
// Command handlers
// ---------------------------------------------------------------------------

async fn cmd_run(db: Option<PathBuf>, pipeline: &str, user: &str, name: Option<&str>) -> Result<()> {
    let config = load_config()?;
    let credentials = resolve_source_credentials(&config)?;
    let storage = Arc::new(Storage::open(&database_path(db, &config)?).await?);
    let source = Arc::new(ErpSource::new(credentials, config.pipelines.clone())?);
    let service = IngestService::new(storage, source, &WorkerConfig::from(&config));

    let requester_name = name.unwrap_or(user);
    let receipt = service.submit(pipeline, user, requester_name).await?;
    info!(
        pipeline,
        user,
        execution_id = %receipt.execution_id,
        kind = %receipt.kind,
        "ingestion started"
    );

    let spinner = RunSpinner::new(pipeline);
    let execution_id = receipt.execution_id;
    let record = tokio::select! {
        record = service.wait_for(&execution_id, RUN_POLL_INTERVAL) => record,
        _ = tokio::signal::ctrl_c() => {
            warn!("interrupted, cancelling ingestion");
            spinner.message("cancelling");
            service.shutdown().await;
            service.execution(&execution_id)
        }
    };
    // Let the runner finish its pointer and history writes.
    service.shutdown().await;
    spinner.finish();

    let record = record.ok_or_else(|| eyre!("execution {execution_id} is no longer tracked"))?;
    match record.status {
        ExecutionStatus::Completed => {
            let records = service
                .dataset(pipeline)
                .await?
                .map(|doc| doc.record_count)
                .unwrap_or(0);
            println!();
            println!("  Ingestion completed");
            println!("  Pipeline:  {pipeline}");
            println!("  Execution: {execution_id}");
            println!("  Kind:      {}", receipt.kind);
            println!("  Records:   {records}");
            println!();
            Ok(())
        }
        ExecutionStatus::Error => Err(eyre!(
            "execution {execution_id} failed: {}",
            record.error_detail.unwrap_or_default()
        )),
        ExecutionStatus::Running => Err(eyre!("execution {execution_id} did not finish")),
    }
}

async fn cmd_status(db: Option<PathBuf>, dataset: &str, user: &str) -> Result<()> {
    let storage = open_for_reading(db).await?;
    // Live state only exists inside the process that ran the execution.
    let registry = ExecutionRegistry::new();
    let report = query_status(&storage, &registry, dataset, user).await?;
    info!(dataset, user, status = %report, "status resolved");
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

async fn cmd_history(db: Option<PathBuf>, pipeline: Option<&str>, filter: &HistoryFilter) -> Result<()> {
    let storage = open_for_reading(db).await?;
    let entries = match pipeline {
        Some(pipeline) => storage.list_history(pipeline, filter).await?,
        None => storage.search_history(filter).await?,
    };

    if entries.is_empty() {
        println!("No history entries.");
        return Ok(());
    }
    for entry in &entries {
        print_history_entry(entry);
    }
    Ok(())
}

fn print_history_entry(entry: &HistoryEntry) {
    let marker = match entry.status {
        HistoryStatus::Completed => "✓",
        HistoryStatus::Failed => "✗",
        HistoryStatus::Running => "…",
    };
    println!(
        "{marker} {:<24} {}  {:<9}  {} ({})  {}",
        entry.pipeline_name,
        entry.timestamp.format("%Y-%m-%d %H:%M:%S"),
        entry.status,
        entry.requester_name,
        entry.requester_id,
        entry.execution_id,
    );
}

async fn cmd_datasets(db: Option<PathBuf>, user: &str) -> Result<()> {
    let storage = open_for_reading(db).await?;
    let datasets = storage.list_datasets_for_owner(user).await?;

    if datasets.is_empty() {
        println!("No datasets owned by {user}.");
        return Ok(());
    }
    for dataset in &datasets {
        println!(
            "{:<24} {:<28} {:>6} records  updated {}",
            dataset.dataset_id,
            dataset.display_name,
            dataset.record_count,
            dataset.updated_at.format("%Y-%m-%d %H:%M:%S"),
        );
    }
    Ok(())
}

async fn cmd_show(db: Option<PathBuf>, dataset: &str, rows: bool) -> Result<()> {
    let storage = open_for_reading(db).await?;
    let mut doc = storage
        .get_dataset(dataset)
        .await?
        .ok_or_else(|| eyre!("dataset '{dataset}' not found"))?;
    if !rows {
        doc.rows.clear();
    }
    println!("{}", serde_json::to_string_pretty(&doc)?);
    Ok(())
}

async fn cmd_describe(db: Option<PathBuf>, dataset: &str, update: &MetadataUpdate) -> Result<()> {
    if update.description.is_none() && update.tags.is_none() && update.permissions.is_none() {
        return Err(eyre!("nothing to change: pass --description, --tags or --permissions"));
    }
    let config = load_config()?;
    let storage = Storage::open(&database_path(db, &config)?).await?;
    if !storage.update_dataset_metadata(dataset, update).await? {
        return Err(eyre!("dataset '{dataset}' not found"));
    }
    println!("Updated {dataset}.");
    Ok(())
}

async fn cmd_config_init() -> Result<()> {
    let path = init_config()?;
    println!("Config initialized at: {}", path.display());
    Ok(())
}

async fn cmd_config_show() -> Result<()> {
    let config: AppConfig = load_config()?;
    let toml_str = toml::to_string_pretty(&config)?;
    println!("{toml_str}");
    Ok(())
}

// ---------------------------------------------------------------------------
// Run spinner
// ---------------------------------------------------------------------------

/// Spinner shown on stderr while a run is in flight.
struct RunSpinner {
    spinner: ProgressBar,
}

impl RunSpinner {
    fn new(pipeline: &str) -> Self {
        let spinner = ProgressBar::new_spinner();
        let style = ProgressStyle::with_template("{spinner:.cyan} {msg} [{elapsed}]")
            .unwrap_or_else(|_| ProgressStyle::default_spinner())
            .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]);
        spinner.set_style(style);
        spinner.set_message(format!("ingesting {pipeline}"));
        spinner.enable_steady_tick(Duration::from_millis(80));
        Self { spinner }
    }

    fn message(&self, msg: &str) {
        self.spinner.set_message(msg.to_string());
    }

    fn finish(&self) {
        self.spinner.finish_and_clear();
    }
}
