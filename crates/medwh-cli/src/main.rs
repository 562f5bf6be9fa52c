mod pipeline;
mod runs;
mod scheduler;

use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "medwh")]
#[command(about = "Medical channel warehouse: ingestion, enrichment and orchestration")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Database maintenance
    Db {
        #[command(subcommand)]
        command: DbCommands,
    },
    /// Run the full pipeline once
    Run {
        /// Override every source's lookback window (days)
        #[arg(long)]
        days_back: Option<u32>,
    },
    /// Collect and load messages without transform or enrichment
    Collect {
        /// Only collect this source id
        #[arg(long)]
        source: Option<String>,
        /// Override the lookback window (days)
        #[arg(long)]
        days_back: Option<u32>,
    },
    /// Classify images that have no detection yet
    Enrich {
        /// Re-classify every image, including already processed ones
        #[arg(long)]
        reprocess: bool,
    },
    /// Inspect recorded pipeline runs
    Runs {
        #[command(subcommand)]
        command: runs::RunsCommands,
    },
    /// Show source cursors and warehouse totals
    Status,
    /// Run the scheduler (daily cron + new-data sensor) until interrupted
    Daemon,
}

#[derive(Debug, Subcommand)]
enum DbCommands {
    /// Apply pending migrations
    Migrate,
    /// Check database connectivity
    Ping,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    dotenvy::dotenv().ok();
    let config = Arc::new(medwh_core::load_app_config()?);
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(config.log_level.clone()))?;
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    let Some(command) = cli.command else {
        println!("medwh: no command given; see --help");
        return Ok(());
    };

    let pool = medwh_db::connect_pool_from_config(&config).await?;
    let cancel = CancellationToken::new();
    tokio::spawn(cancel_on_shutdown(cancel.clone()));

    match command {
        Commands::Db {
            command: DbCommands::Migrate,
        } => {
            let applied = medwh_db::run_migrations(&pool).await?;
            println!("applied {applied} migration(s)");
        }
        Commands::Db {
            command: DbCommands::Ping,
        } => {
            medwh_db::health_check(&pool).await?;
            println!("database reachable");
        }
        Commands::Run { days_back } => {
            pipeline::run_full(&pool, &config, days_back, &cancel).await?;
        }
        Commands::Collect { source, days_back } => {
            pipeline::run_collect(&pool, &config, source.as_deref(), days_back, &cancel).await?;
        }
        Commands::Enrich { reprocess } => {
            pipeline::run_enrich(&pool, &config, reprocess, &cancel).await?;
        }
        Commands::Runs {
            command: runs::RunsCommands::List { limit },
        } => runs::run_runs_list(&pool, limit).await?,
        Commands::Runs {
            command: runs::RunsCommands::Show { run_id },
        } => runs::run_runs_show(&pool, run_id).await?,
        Commands::Status => runs::run_status(&pool).await?,
        Commands::Daemon => scheduler::run_daemon(pool, config, cancel).await?,
    }

    Ok(())
}

/// Cancels `cancel` on Ctrl-C or SIGTERM so in-flight work can wind down.
async fn cancel_on_shutdown(cancel: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    tracing::info!("received shutdown signal, cancelling in-flight work");
    cancel.cancel();
}
