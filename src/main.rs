use anyhow::Context;
use clap::Parser;
use cycleguard::adapters::PostgresStore;
use cycleguard::cli::{self, Cli, Commands};
use cycleguard::config::{AppConfig, LoggingConfig};
use cycleguard::coordination::LockCoordinator;
use std::path::Path;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = cli.load_config()?;
    init_logging(&config.logging);

    if cli.command.needs_database() {
        if let Err(problems) = config.validate() {
            for p in &problems {
                error!("Invalid configuration: {}", p);
            }
            anyhow::bail!("{} configuration problem(s)", problems.len());
        }
    }

    match &cli.command {
        Commands::Validate { file } => {
            let report = cli::validate_file(Path::new(file), &config.validator)?;
            println!("{}", report);
        }
        Commands::Migrate => {
            let store = connect(&config).await?;
            cli::run_migrations(&store).await?;
            store.close().await;
        }
        Commands::Sweep { watch } => {
            let store = connect(&config).await?;
            let sweeper = cli::postgres_sweeper(&store, &config);
            if *watch {
                let handle = sweeper.start();
                shutdown_signal().await;
                info!("Shutdown signal received, stopping sweeper");
                sweeper.stop();
                if let Err(e) = handle.await {
                    warn!("Sweeper task ended abnormally: {}", e);
                }
            } else {
                cli::sweep_once(&sweeper).await?;
            }
            store.close().await;
        }
        Commands::Locks => {
            let store = connect(&config).await?;
            let locks = LockCoordinator::postgres(store.pool().clone());
            cli::show_locks(&locks).await?;
            store.close().await;
        }
        Commands::Status => {
            let store = connect(&config).await?;
            let locks = LockCoordinator::postgres(store.pool().clone());
            cli::show_status(&store, &locks).await?;
            store.close().await;
        }
    }

    Ok(())
}

async fn connect(config: &AppConfig) -> anyhow::Result<PostgresStore> {
    PostgresStore::new(&config.database.url, config.database.max_connections)
        .await
        .context("cannot connect to database")
}

fn init_logging(config: &LoggingConfig) {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("{},sqlx=warn", config.level)));

    // `rolling::daily` panics if it cannot create the first file, so check writability first.
    let file_layer = config.dir.as_deref().and_then(|log_dir| {
        if let Err(e) = std::fs::create_dir_all(log_dir) {
            eprintln!(
                "Warning: Could not create log directory {} ({}), file logging disabled",
                log_dir, e
            );
            return None;
        }

        let test_path = Path::new(log_dir).join(".cycleguard_write_test");
        match std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&test_path)
        {
            Ok(_) => {
                let _ = std::fs::remove_file(&test_path);

                let file_appender = tracing_appender::rolling::daily(log_dir, "cycleguard.log");
                let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

                // The process logs until exit; the guard must outlive main.
                Box::leak(Box::new(guard));

                Some(
                    tracing_subscriber::fmt::layer()
                        .with_writer(non_blocking)
                        .with_ansi(false)
                        .with_target(true),
                )
            }
            Err(e) => {
                eprintln!(
                    "Warning: Could not write to log directory {} ({}), file logging disabled",
                    log_dir, e
                );
                None
            }
        }
    });

    let json_layer = config
        .json
        .then(|| tracing_subscriber::fmt::layer().json().with_target(true));
    let console_layer = (!config.json).then(|| {
        tracing_subscriber::fmt::layer()
            .with_target(true)
            .with_thread_ids(false)
            .with_file(false)
            .with_line_number(false)
    });

    let file_logging_enabled = file_layer.is_some();
    tracing_subscriber::registry()
        .with(filter)
        .with(console_layer)
        .with(json_layer)
        .with(file_layer)
        .init();

    if file_logging_enabled {
        info!("File logging enabled: {}/cycleguard.log", config.dir.as_deref().unwrap_or_default());
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => error!("Failed to install SIGTERM handler: {}", e),
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
