//! Reverse batch jobs: replacement codes for spoiled units.
//!
//! - `submission`: validates operator input and enqueues a job.
//! - `worker`: claims the oldest queued job and fills the prepared-code queue.
//!
//! Job rows are mutated only by the worker and by `requeue_job`.

pub mod submission;
pub mod worker;

use sqlx::SqliteConnection;
use tracing::{info, instrument};

use crate::db::{Pool, PreparedCode, ReverseJob, ReverseJobItem, ReverseJobLog, ReverseJobRow};
use crate::error::{Result, TraceError};
use crate::model::{JobStatus, LogLevel};

pub use submission::{submit_filtered, submit_spoiled, FilteredRequest, SpoiledRequest, SubmittedJob};
pub use worker::{claim_next_job, process_job, run_once, WorkerOutcome};

const JOB_SELECT: &str = "SELECT id, batch_id, order_id, manufacturer_org_id, spoiled_case_number, \
     spoiled_variant_key, filter_variant_id, filter_case_numbers, exclude_codes, status, progress, \
     prepared_count, duplicate_count, invalid_count, total_available_in_batch, remaining_to_prepare, \
     result_summary, error_message, created_by, created_at, started_at, completed_at \
     FROM qr_reverse_jobs";

pub async fn get_job(pool: &Pool, job_id: i64) -> Result<ReverseJob> {
    let row = sqlx::query_as::<_, ReverseJobRow>(&format!("{JOB_SELECT} WHERE id = ?"))
        .bind(job_id)
        .fetch_optional(pool)
        .await?
        .ok_or_else(|| TraceError::not_found(format!("reverse job {job_id}")))?;
    ReverseJob::try_from(row)
}

pub async fn job_items(pool: &Pool, job_id: i64) -> Result<Vec<ReverseJobItem>> {
    let items = sqlx::query_as::<_, ReverseJobItem>(
        "SELECT id, job_id, code_id, code, sequence_number FROM qr_reverse_job_items \
         WHERE job_id = ? ORDER BY sequence_number",
    )
    .bind(job_id)
    .fetch_all(pool)
    .await?;
    Ok(items)
}

pub async fn job_logs(pool: &Pool, job_id: i64) -> Result<Vec<ReverseJobLog>> {
    let logs = sqlx::query_as::<_, ReverseJobLog>(
        "SELECT id, job_id, level, message, created_at FROM qr_reverse_job_logs \
         WHERE job_id = ? ORDER BY id",
    )
    .bind(job_id)
    .fetch_all(pool)
    .await?;
    Ok(logs)
}

/// The prepared-code queue of one batch, oldest first.
pub async fn prepared_codes(pool: &Pool, order_id: i64, batch_id: i64) -> Result<Vec<PreparedCode>> {
    let rows = sqlx::query_as::<_, PreparedCode>(
        "SELECT id, order_id, batch_id, code, code_id, job_id FROM qr_prepared_codes \
         WHERE order_id = ? AND batch_id = ? ORDER BY id",
    )
    .bind(order_id)
    .bind(batch_id)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

pub async fn append_log(
    conn: &mut SqliteConnection,
    job_id: i64,
    level: LogLevel,
    message: &str,
) -> Result<()> {
    sqlx::query("INSERT INTO qr_reverse_job_logs (job_id, level, message) VALUES (?, ?, ?)")
        .bind(job_id)
        .bind(level.as_str())
        .bind(message)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

/// Put a failed job back in the queue. Retrying is an explicit operator
/// decision; the worker never does it on its own.
#[instrument(skip(pool))]
pub async fn requeue_job(pool: &Pool, job_id: i64) -> Result<ReverseJob> {
    let result = sqlx::query(
        "UPDATE qr_reverse_jobs SET status = ?, progress = 0, error_message = NULL, \
         started_at = NULL, completed_at = NULL, prepared_count = 0, duplicate_count = 0, \
         invalid_count = 0 WHERE id = ? AND status = ?",
    )
    .bind(JobStatus::Queued)
    .bind(job_id)
    .bind(JobStatus::Failed)
    .execute(pool)
    .await?;
    if result.rows_affected() == 0 {
        let job = get_job(pool, job_id).await?;
        return Err(TraceError::conflict(format!(
            "reverse job {job_id} is {} and only failed jobs can be requeued",
            job.status.as_str()
        )));
    }
    let mut conn = pool.acquire().await?;
    append_log(&mut conn, job_id, LogLevel::Info, "requeued by operator").await?;
    info!(job_id, "reverse job requeued");
    get_job(pool, job_id).await
}
