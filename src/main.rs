use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

use qrtrace::api::{self, AppState};
use qrtrace::movement::SqliteMovementLog;
use qrtrace::{config, db, reverse};

#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// Print an example configuration and exit
    #[arg(long)]
    print_example_config: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();
    if args.print_example_config {
        print!("{}", config::example());
        return Ok(());
    }
    let cfg = config::load(Some(&args.config))?;
    cfg.ensure_dirs()?;

    let pool = db::init_pool(&cfg.database_url()).await?;
    db::run_migrations(&pool).await?;

    let settings = cfg.worker_settings();
    if cfg.worker.enabled {
        // One job at a time; the HTTP trigger may still run alongside and
        // the claim keeps the two apart.
        let worker_pool = pool.clone();
        let worker_settings = settings.clone();
        let poll_sleep = Duration::from_millis(cfg.worker.poll_interval_ms);
        tokio::spawn(async move {
            loop {
                match reverse::run_once(&worker_pool, &worker_settings).await {
                    Ok(outcome) => {
                        if !outcome.processed {
                            tokio::time::sleep(poll_sleep).await;
                        }
                    }
                    Err(err) => {
                        error!(?err, "reverse worker error");
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }
        });
    }

    let app = api::router(AppState {
        pool: pool.clone(),
        worker_token: cfg.server.worker_token.clone(),
        settings,
        movements: Arc::new(SqliteMovementLog::new(pool)),
    });
    let listener = tokio::net::TcpListener::bind(&cfg.server.bind).await?;
    info!(address = %cfg.server.bind, worker = cfg.worker.enabled, "qrtrace listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutting down");
        })
        .await?;

    Ok(())
}
