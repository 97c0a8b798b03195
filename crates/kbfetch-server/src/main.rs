//! kbfetch-server: polling daemon and operator commands

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use kbfetch_common::logging::init_logging;
use kbfetch_common::types::StorageAccount;
use kbfetch_ingest::{ConcurrencyController, HttpFetcher, UpdateCatalogClient};
use kbfetch_server::{
    commands,
    config::Config,
    db::{self, PgStore, Store},
    pipeline::{DaemonLoop, PipelineOrchestrator, PipelineSettings},
    storage::S3BlobStoreFactory,
};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "kbfetch-server")]
#[command(author, version, about = "Update package acquisition daemon")]
struct Cli {
    /// TOML configuration file
    #[arg(short, long, global = true, env = "KBFETCH_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Poll for registered sessions and process them until terminated
    Daemon,

    /// Register sessions for one or more KB numbers
    Register {
        /// Session identity shared by all keys (random UUID if omitted)
        #[arg(short, long)]
        session: Option<String>,

        /// KB numbers, comma separated
        #[arg(short = 'n', long = "kb", value_delimiter = ',', required = true, num_args = 1..)]
        kbnos: Vec<i64>,

        /// Storage account name (access key id); enables upload
        #[arg(long, requires = "account_key")]
        account_name: Option<String>,

        /// Storage account key (secret)
        #[arg(long, requires = "account_name", env = "KBFETCH_ACCOUNT_KEY", hide_env_values = true)]
        account_key: Option<String>,
    },

    /// Print a session's packages as CSV
    Export {
        #[arg(short, long)]
        session: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref())?;

    let log_config = config.log.clone().merge_env().unwrap_or_else(|_| config.log.clone());
    let _guard = init_logging(&log_config)?;

    let pool = db::create_pool(&config.database)
        .await
        .context("Failed to connect to database")?;
    db::run_migrations(&pool).await?;
    let store: Arc<dyn Store> = Arc::new(PgStore::new(pool));

    match cli.command {
        Command::Daemon => run_daemon(config, store).await,
        Command::Register {
            session,
            kbnos,
            account_name,
            account_key,
        } => {
            let account = account_name
                .zip(account_key)
                .map(|(name, key)| StorageAccount { name, key });
            let id = commands::register_sessions(store.as_ref(), session, &kbnos, account).await?;
            println!("{}", id);
            Ok(())
        },
        Command::Export { session } => {
            let count =
                commands::export_packages(store.as_ref(), &session, std::io::stdout().lock()).await?;
            info!(session_id = %session, packages = count, "Export complete");
            Ok(())
        },
    }
}

async fn run_daemon(config: Config, store: Arc<dyn Store>) -> Result<()> {
    info!("Starting kbfetch daemon");

    tokio::fs::create_dir_all(&config.daemon.staging_dir)
        .await
        .with_context(|| {
            format!(
                "Failed to create staging directory {}",
                config.daemon.staging_dir.display()
            )
        })?;

    let catalog = Arc::new(UpdateCatalogClient::new(&config.http)?);
    let fetcher = Arc::new(HttpFetcher::new(config.http.clone())?);
    let blobs = Arc::new(S3BlobStoreFactory::new(config.storage.clone()));
    let gate = ConcurrencyController::new(config.daemon.max_concurrent_operations);

    let orchestrator = PipelineOrchestrator::new(
        Arc::clone(&store),
        catalog,
        fetcher,
        blobs,
        gate,
        PipelineSettings::from_config(&config),
    );

    DaemonLoop::new(store, orchestrator, &config.daemon)
        .run_until(shutdown_signal())
        .await;

    info!("Daemon shut down gracefully");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            },
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            },
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, starting graceful shutdown");
        },
        _ = terminate => {
            info!("Received terminate signal, starting graceful shutdown");
        },
    }
}
