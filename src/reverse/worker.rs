//! Polled worker for reverse jobs.
//!
//! Each invocation claims at most one job. The claim is a single conditional
//! update, so overlapping invocations cannot both win the same job, and no
//! job is claimed while another is running.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use sqlx::SqliteConnection;
use tracing::{error, info, instrument, warn};

use crate::code_format;
use crate::config::WorkerSettings;
use crate::db::{JobSummary, Pool, QrCode, ReverseJob};
use crate::error::{is_transient, is_unique_violation, Result, TraceError};
use crate::identity::{self, CodeFilter};
use crate::model::{JobStatus, LogLevel, QrStatus};
use crate::reverse::{append_log, get_job};

const PROGRESS_CLAIMED: i64 = 5;
const PROGRESS_RESOLVED: i64 = 30;
const PROGRESS_WRITING_SPAN: i64 = 60;

/// What one trigger invocation did.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct WorkerOutcome {
    pub processed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<JobSummary>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct ChunkCounts {
    prepared: i64,
    duplicates: i64,
    invalid: i64,
}

/// Flip the oldest queued job to `running`. Returns `None` when the queue is
/// empty or a job is already running.
#[instrument(skip_all)]
pub async fn claim_next_job(pool: &Pool) -> Result<Option<ReverseJob>> {
    let claimed: Option<i64> = sqlx::query_scalar(
        "UPDATE qr_reverse_jobs SET status = 'running', progress = ?, started_at = CURRENT_TIMESTAMP \
         WHERE id = (SELECT id FROM qr_reverse_jobs WHERE status = 'queued' ORDER BY created_at, id LIMIT 1) \
           AND status = 'queued' \
           AND NOT EXISTS (SELECT 1 FROM qr_reverse_jobs WHERE status = 'running') \
         RETURNING id",
    )
    .bind(PROGRESS_CLAIMED)
    .fetch_optional(pool)
    .await?;
    match claimed {
        Some(job_id) => {
            info!(job_id, "reverse job claimed");
            Ok(Some(get_job(pool, job_id).await?))
        }
        None => Ok(None),
    }
}

/// Trigger entry point: claim and process at most one job.
///
/// A job failure is recorded on the job and reported in the outcome; it is
/// never returned as an error, so the next invocation can move on.
#[instrument(skip_all)]
pub async fn run_once(pool: &Pool, settings: &WorkerSettings) -> Result<WorkerOutcome> {
    let Some(job) = claim_next_job(pool).await? else {
        return Ok(WorkerOutcome::default());
    };
    match process_job(pool, &job, settings).await {
        Ok(summary) => Ok(WorkerOutcome {
            processed: true,
            job_id: Some(job.id),
            result: Some(summary),
            error: None,
        }),
        Err(err) => Ok(WorkerOutcome {
            processed: true,
            job_id: Some(job.id),
            result: None,
            error: Some(err.to_string()),
        }),
    }
}

/// Run a claimed job to completion. On failure the job is marked `failed`
/// with the error message and the error is returned.
#[instrument(skip_all, fields(job_id = job.id))]
pub async fn process_job(
    pool: &Pool,
    job: &ReverseJob,
    settings: &WorkerSettings,
) -> Result<JobSummary> {
    match run_job(pool, job, settings).await {
        Ok(summary) => Ok(summary),
        Err(err) => {
            error!(job_id = job.id, error = %err, "reverse job failed");
            if let Err(mark_err) = fail_job(pool, job.id, &err.to_string()).await {
                error!(job_id = job.id, error = %mark_err, "could not record job failure");
            }
            Err(err)
        }
    }
}

async fn run_job(pool: &Pool, job: &ReverseJob, settings: &WorkerSettings) -> Result<JobSummary> {
    let (available, excluded_count) = available_codes(pool, job).await?;
    let total = available.len() as i64;

    sqlx::query(
        "UPDATE qr_reverse_jobs SET total_available_in_batch = ?, remaining_to_prepare = ?, \
         prepared_count = 0, duplicate_count = 0, invalid_count = 0, progress = ? WHERE id = ?",
    )
    .bind(total)
    .bind(total)
    .bind(PROGRESS_RESOLVED)
    .bind(job.id)
    .execute(pool)
    .await?;
    info!(job_id = job.id, total_available = total, excluded_count, "eligible codes resolved");

    let chunk_size = settings.chunk_size.max(1);
    let chunks_total = available.chunks(chunk_size).len() as i64;
    let mut totals = ChunkCounts::default();
    for (index, chunk) in available.chunks(chunk_size).enumerate() {
        let counts = write_chunk(pool, job, chunk, settings.chunk_attempts).await?;
        totals.prepared += counts.prepared;
        totals.duplicates += counts.duplicates;
        totals.invalid += counts.invalid;

        let done = index as i64 + 1;
        let progress = PROGRESS_RESOLVED + PROGRESS_WRITING_SPAN * done / chunks_total;
        let remaining = total - totals.prepared - totals.duplicates;
        sqlx::query(
            "UPDATE qr_reverse_jobs SET prepared_count = ?, duplicate_count = ?, invalid_count = ?, \
             remaining_to_prepare = ?, progress = ? WHERE id = ?",
        )
        .bind(totals.prepared)
        .bind(totals.duplicates)
        .bind(totals.invalid)
        .bind(remaining)
        .bind(progress)
        .bind(job.id)
        .execute(pool)
        .await?;

        if done < chunks_total && !settings.chunk_delay.is_zero() {
            tokio::time::sleep(settings.chunk_delay).await;
        }
    }

    let summary = JobSummary {
        prepared: totals.prepared,
        duplicates: totals.duplicates,
        invalid: totals.invalid,
        total_available: total,
        excluded_count,
    };
    complete_job(pool, job.id, &summary).await?;
    info!(
        job_id = job.id,
        prepared = summary.prepared,
        duplicates = summary.duplicates,
        invalid = summary.invalid,
        "reverse job completed"
    );
    Ok(summary)
}

/// Codes of the job's batch that can be handed out as replacements, plus how
/// many eligible codes the exclusion list removed.
///
/// A code is available when it matches the job's filters, is not excluded,
/// is not packed into a case, is still `generated` and is not blocked.
async fn available_codes(pool: &Pool, job: &ReverseJob) -> Result<(Vec<QrCode>, i64)> {
    let case_numbers = match job.filter_case_numbers.as_deref() {
        Some(requested) if !requested.is_empty() => {
            let matched = identity::master_cases_in_batch(pool, job.batch_id, requested).await?;
            if matched.is_empty() {
                info!(job_id = job.id, ?requested, "case filter matched no master codes");
                return Ok((Vec::new(), 0));
            }
            Some(matched)
        }
        _ => None,
    };
    let eligible = identity::find_codes_by_batch(
        pool,
        job.batch_id,
        &CodeFilter {
            variant_id: job.filter_variant_id,
            case_numbers,
        },
    )
    .await?;

    let exclude: HashSet<&str> = job
        .exclude_codes
        .iter()
        .map(|c| code_format::normalize(c))
        .collect();
    let mut excluded_count = 0;
    let mut available = Vec::with_capacity(eligible.len());
    for code in eligible {
        if exclude.contains(code.code.as_str()) {
            excluded_count += 1;
            continue;
        }
        if code.master_code_id.is_some() || code.is_blocked || code.status != QrStatus::Generated {
            continue;
        }
        available.push(code);
    }
    Ok((available, excluded_count))
}

/// Write one chunk, retrying the whole chunk on transient storage errors.
async fn write_chunk(
    pool: &Pool,
    job: &ReverseJob,
    chunk: &[QrCode],
    attempts: u32,
) -> Result<ChunkCounts> {
    let attempts = attempts.max(1);
    let mut attempt = 0;
    loop {
        attempt += 1;
        match try_write_chunk(pool, job, chunk).await {
            Ok(counts) => return Ok(counts),
            Err(err) if is_transient(&err) && attempt < attempts => {
                warn!(job_id = job.id, attempt, error = %err, "chunk write failed; retrying");
                tokio::time::sleep(std::time::Duration::from_millis(50 * u64::from(attempt))).await;
            }
            Err(err) => return Err(TraceError::Storage(err)),
        }
    }
}

/// Insert each code into the prepared queue. A row already present for the
/// same order/batch/code is a duplicate, unless this job wrote it on an
/// earlier, interrupted run, in which case it counts as prepared again.
async fn try_write_chunk(
    pool: &Pool,
    job: &ReverseJob,
    chunk: &[QrCode],
) -> std::result::Result<ChunkCounts, sqlx::Error> {
    let mut tx = pool.begin().await?;
    let mut counts = ChunkCounts::default();
    for code in chunk {
        let inserted = sqlx::query(
            "INSERT INTO qr_prepared_codes (order_id, batch_id, code, code_id, job_id) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(job.order_id)
        .bind(job.batch_id)
        .bind(&code.code)
        .bind(code.id)
        .bind(job.id)
        .execute(&mut *tx)
        .await;
        match inserted {
            Ok(_) => counts.prepared += 1,
            Err(err) if is_unique_violation(&err) => {
                if prepared_owner(&mut tx, job, &code.code).await? == Some(job.id) {
                    counts.prepared += 1;
                } else {
                    counts.duplicates += 1;
                }
            }
            Err(err) if is_transient(&err) => return Err(err),
            Err(err) => {
                warn!(job_id = job.id, code = %code.code, error = %err, "code could not be prepared");
                counts.invalid += 1;
            }
        }
    }
    tx.commit().await?;
    Ok(counts)
}

async fn prepared_owner(
    conn: &mut SqliteConnection,
    job: &ReverseJob,
    code: &str,
) -> std::result::Result<Option<i64>, sqlx::Error> {
    sqlx::query_scalar(
        "SELECT job_id FROM qr_prepared_codes WHERE order_id = ? AND batch_id = ? AND code = ?",
    )
    .bind(job.order_id)
    .bind(job.batch_id)
    .bind(code)
    .fetch_optional(&mut *conn)
    .await
}

async fn complete_job(pool: &Pool, job_id: i64, summary: &JobSummary) -> Result<()> {
    let summary_json = serde_json::to_string(summary)?;
    let mut tx = pool.begin().await?;
    sqlx::query(
        "UPDATE qr_reverse_jobs SET status = ?, progress = 100, result_summary = ?, \
         remaining_to_prepare = ?, completed_at = CURRENT_TIMESTAMP WHERE id = ?",
    )
    .bind(JobStatus::Completed)
    .bind(summary_json)
    .bind(summary.total_available - summary.prepared - summary.duplicates)
    .bind(job_id)
    .execute(&mut *tx)
    .await?;
    append_log(
        &mut tx,
        job_id,
        LogLevel::Info,
        &format!(
            "completed: {} prepared, {} duplicates, {} invalid of {} available",
            summary.prepared, summary.duplicates, summary.invalid, summary.total_available
        ),
    )
    .await?;
    tx.commit().await?;
    Ok(())
}

async fn fail_job(pool: &Pool, job_id: i64, message: &str) -> Result<()> {
    let mut tx = pool.begin().await?;
    sqlx::query(
        "UPDATE qr_reverse_jobs SET status = ?, error_message = ?, completed_at = CURRENT_TIMESTAMP \
         WHERE id = ?",
    )
    .bind(JobStatus::Failed)
    .bind(message)
    .bind(job_id)
    .execute(&mut *tx)
    .await?;
    append_log(&mut tx, job_id, LogLevel::Error, message).await?;
    tx.commit().await?;
    Ok(())
}
