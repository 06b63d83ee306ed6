use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use tracing::{info, warn};

use qrtrace::{config, db, reverse};

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Process queued reverse jobs one at a time and exit when the queue is empty"
)]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// Stop after this many jobs even if more are queued
    #[arg(long)]
    max_jobs: Option<usize>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();
    let cfg = config::load(Some(&args.config))?;
    cfg.ensure_dirs()?;

    let pool = db::init_pool(&cfg.database_url()).await?;
    db::run_migrations(&pool).await?;
    let settings = cfg.worker_settings();

    let mut completed = 0usize;
    let mut failed = 0usize;
    loop {
        if args.max_jobs.is_some_and(|max| completed + failed >= max) {
            info!(completed, failed, "job limit reached");
            break;
        }
        let outcome = reverse::run_once(&pool, &settings).await?;
        if !outcome.processed {
            break;
        }
        match (outcome.job_id, outcome.error) {
            (job_id, Some(err)) => {
                failed += 1;
                warn!(?job_id, %err, "reverse job failed");
            }
            (job_id, None) => {
                completed += 1;
                info!(?job_id, result = ?outcome.result, "reverse job completed");
            }
        }
    }

    info!(completed, failed, "queue drained");
    Ok(())
}
