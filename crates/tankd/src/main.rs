use clap::{Parser, Subcommand, ValueEnum};
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use tankd_core::{QueryOptions, TankdError};
use tankd_dataset::{
    DatasetConfig, DatasetService, EncryptionSummaryOptions, Job, KeySyncTask, LockOptions,
    UnlockDataset, UnlockOptions,
};
use tankd_storage::{Datastore, RedbBackend};
use tankd_zfs::{CliZfs, LocalFs, ProcFs};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "tankd", about = "ZFS pool dataset service")]
struct Cli {
    /// YAML configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Path to the redb database file
    #[arg(
        long,
        global = true,
        env = "TANKD_DATASTORE",
        default_value = "/var/db/tankd.redb"
    )]
    datastore: PathBuf,
    /// Altroot pools are imported under
    #[arg(long, global = true)]
    mount_root: Option<String>,
    /// Run as the passive controller: no imports, no key reconciliation
    #[arg(long, global = true)]
    passive: bool,
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Import pools, then keep escrowed keys reconciled until interrupted
    Serve,
    /// Import and unlock recorded pools once
    ImportOnBoot,
    /// Query datasets
    Query {
        /// Filters as a JSON list, e.g. '[["pool", "=", "tank"]]'
        #[arg(long, default_value = "[]")]
        filters: String,
        /// Query options as a JSON object
        #[arg(long, default_value = "{}")]
        options: String,
    },
    /// Report which encryption roots under a dataset could be unlocked
    EncryptionSummary {
        id: String,
        /// JSON object of dataset names to keys
        #[arg(long)]
        key_file: Option<PathBuf>,
        #[arg(long)]
        force: bool,
    },
    /// Write escrowed keys under a dataset as JSON
    ExportKeys {
        id: String,
        /// Defaults to stdout
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// Drop escrowed keys that no longer open their datasets
    SyncKeys { pool: Option<String> },
    /// Lock a passphrase encrypted dataset
    Lock {
        id: String,
        #[arg(long)]
        force_umount: bool,
    },
    /// Unlock an encrypted dataset
    Unlock {
        id: String,
        /// JSON object of dataset names to keys
        #[arg(long)]
        key_file: Option<PathBuf>,
        /// Passphrase for the dataset itself
        #[arg(long, env = "TANKD_PASSPHRASE", hide_env_values = true)]
        passphrase: Option<String>,
        #[arg(long)]
        recursive: bool,
        /// Move aside whatever occupies the mountpoints
        #[arg(long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> miette::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    let service = Arc::new(create_service(&cli)?);

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => run_serve(service).await,
        Commands::ImportOnBoot => run_import(&service).await,
        Commands::Query { filters, options } => run_query(&service, &filters, &options).await,
        Commands::EncryptionSummary { id, key_file, force } => {
            let key_file = read_key_file(key_file.as_ref())?;
            let options = EncryptionSummaryOptions {
                key_file: key_file.is_some(),
                force,
                datasets: Vec::new(),
            };
            let summary = service
                .encryption_summary(&id, options, key_file.as_deref())
                .await
                .map_err(|e| failed("Encryption summary", e))?;
            print_json(&summary)
        }
        Commands::ExportKeys { id, output } => run_export_keys(&service, &id, output).await,
        Commands::SyncKeys { pool } => {
            service.sync_db_keys(pool.as_deref()).await;
            Ok(())
        }
        Commands::Lock { id, force_umount } => {
            service
                .lock(&id, LockOptions { force_umount })
                .await
                .map_err(|e| failed("Lock", e))?;
            info!("Locked {}", id);
            Ok(())
        }
        Commands::Unlock {
            id,
            key_file,
            passphrase,
            recursive,
            force,
        } => {
            let key_file = read_key_file(key_file.as_ref())?;
            let options = UnlockOptions {
                force,
                key_file: key_file.is_some(),
                recursive,
                toggle_attachments: true,
                datasets: passphrase
                    .map(|p| vec![UnlockDataset::with_passphrase(&id, p)])
                    .unwrap_or_default(),
            };
            let result = service
                .unlock(&id, options, key_file.as_deref())
                .await
                .map_err(|e| failed("Unlock", e))?;
            print_json(&result)
        }
    }
}

fn init_tracing(format: LogFormat) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    match format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Text => builder.init(),
    }
}

fn failed(what: &str, e: TankdError) -> miette::Report {
    miette::miette!("{} failed: {}", what, e)
}

/// Build the service over the host's ZFS, filesystem and process table
fn create_service(cli: &Cli) -> miette::Result<DatasetService> {
    let mut config = match &cli.config {
        Some(path) => DatasetConfig::from_file(path)
            .map_err(|e| miette::miette!("Failed to load config '{}': {}", path.display(), e))?,
        None => DatasetConfig::default(),
    };
    if let Some(mount_root) = &cli.mount_root {
        config.mount_root = mount_root.clone();
    }
    if cli.passive {
        config.is_active_node = false;
    }

    let backend = RedbBackend::new(&cli.datastore).map_err(|e| {
        miette::miette!(
            "Failed to open datastore at '{}': {}",
            cli.datastore.display(),
            e
        )
    })?;
    let datastore = Datastore::new(Arc::new(backend));

    Ok(DatasetService::new(
        Arc::new(CliZfs::new()),
        datastore,
        Arc::new(LocalFs::new()),
        Arc::new(ProcFs::new()),
        config,
    ))
}

async fn run_import(service: &DatasetService) -> miette::Result<()> {
    let job = Job::new("pool.import_on_boot");
    service
        .import_on_boot(&job)
        .await
        .map_err(|e| failed("Import", e))
}

/// Boot import followed by periodic key sync until Ctrl-C
async fn run_serve(service: Arc<DatasetService>) -> miette::Result<()> {
    info!("Starting tankd");
    let token = CancellationToken::new();

    let job = Job::new("pool.import_on_boot").with_token(token.child_token());
    if let Err(e) = service.import_on_boot(&job).await {
        error!("Boot import failed: {}", e);
    }

    let task = KeySyncTask::new(service.clone());
    let task_token = token.clone();
    let task_handle = tokio::spawn(async move {
        task.run(task_token).await;
    });

    tokio::signal::ctrl_c()
        .await
        .map_err(|e| miette::miette!("Failed to listen for ctrl-c: {}", e))?;

    info!("Shutting down gracefully...");
    token.cancel();

    let shutdown_timeout = std::time::Duration::from_secs(5);
    let _ = tokio::time::timeout(shutdown_timeout, task_handle).await;

    info!("Shutdown complete");
    Ok(())
}

async fn run_query(service: &DatasetService, filters: &str, options: &str) -> miette::Result<()> {
    let filters: Value = serde_json::from_str(filters)
        .map_err(|e| miette::miette!("Invalid filters '{}': {}", filters, e))?;
    let options: QueryOptions = serde_json::from_str(options)
        .map_err(|e| miette::miette!("Invalid query options '{}': {}", options, e))?;
    let result = service
        .query_json(&filters, options)
        .await
        .map_err(|e| failed("Query", e))?;
    print_json(&result.into_value())
}

async fn run_export_keys(
    service: &DatasetService,
    id: &str,
    output: Option<PathBuf>,
) -> miette::Result<()> {
    match output {
        Some(path) => {
            let file = std::fs::File::create(&path)
                .map_err(|e| miette::miette!("Failed to create '{}': {}", path.display(), e))?;
            service
                .export_keys(id, std::io::BufWriter::new(file))
                .await
                .map_err(|e| failed("Key export", e))?;
            info!("Keys of {} written to {}", id, path.display());
        }
        None => {
            service
                .export_keys(id, std::io::stdout())
                .await
                .map_err(|e| failed("Key export", e))?;
            println!();
        }
    }
    Ok(())
}

fn read_key_file(path: Option<&PathBuf>) -> miette::Result<Option<Vec<u8>>> {
    path.map(|p| {
        std::fs::read(p).map_err(|e| miette::miette!("Failed to read key file '{}': {}", p.display(), e))
    })
    .transpose()
}

fn print_json<T: serde::Serialize>(value: &T) -> miette::Result<()> {
    let out = serde_json::to_string_pretty(value)
        .map_err(|e| miette::miette!("Failed to serialize output: {}", e))?;
    println!("{}", out);
    Ok(())
}
