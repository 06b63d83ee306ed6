use serde::{Deserialize, Serialize};
use sqlx::{QueryBuilder, Sqlite};
use tracing::{info, instrument, warn};

use crate::code_format;
use crate::compensation::{Compensation, Undo};
use crate::db::{Pool, QrCode};
use crate::error::{Result, TraceError};
use crate::identity::{self, CaseInfo};
use crate::model::{JobStatus, LogLevel, QrStatus};
use crate::reverse::append_log;
use crate::state_machine;

/// Spoiled units reported by an operator.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpoiledRequest {
    pub batch_id: i64,
    pub order_id: i64,
    /// Bare sequence numbers, tracking URLs or raw code strings.
    pub spoiled_inputs: Vec<String>,
    #[serde(default)]
    pub created_by: Option<i64>,
}

/// Explicit exclusion and filter variant.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FilteredRequest {
    pub batch_id: i64,
    pub order_id: i64,
    #[serde(default)]
    pub exclude_codes: Vec<String>,
    #[serde(default)]
    pub filter_variant_id: Option<i64>,
    #[serde(default)]
    pub filter_case_numbers: Option<Vec<i64>>,
    pub manufacturer_org_id: i64,
    #[serde(default)]
    pub created_by: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SubmittedJob {
    pub job_id: i64,
    pub status: JobStatus,
    pub case_number: Option<i64>,
    pub variant_key: Option<String>,
    pub item_count: usize,
    /// Inputs that could not be read as a sequence number.
    pub invalid_inputs: Vec<String>,
}

struct NewJob<'a> {
    batch_id: i64,
    order_id: i64,
    manufacturer_org_id: i64,
    spoiled: Option<&'a CaseInfo>,
    filter_variant_id: Option<i64>,
    filter_case_numbers: Option<&'a [i64]>,
    exclude_codes: &'a [String],
    created_by: Option<i64>,
}

/// Split inputs into unique sequence numbers (first-seen order) and the inputs
/// that did not parse.
pub fn parse_inputs(inputs: &[String]) -> (Vec<i64>, Vec<String>) {
    let mut sequences = Vec::new();
    let mut invalid = Vec::new();
    for input in inputs {
        match code_format::parse_sequence(input) {
            Some(seq) if !sequences.contains(&seq) => sequences.push(seq),
            Some(_) => {}
            None => invalid.push(input.clone()),
        }
    }
    (sequences, invalid)
}

/// Validate a spoiled-units request and enqueue one job with one item per unit.
///
/// All units must belong to one case, and none may already be spoiled. The
/// job, its items and the spoiled marking are written as a compensating
/// sequence: if a later step fails the earlier ones are undone.
#[instrument(skip_all, fields(batch_id = req.batch_id, order_id = req.order_id))]
pub async fn submit_spoiled(pool: &Pool, req: &SpoiledRequest) -> Result<SubmittedJob> {
    let batch = identity::batch_for_order(pool, req.batch_id, req.order_id).await?;

    let (sequences, invalid_inputs) = parse_inputs(&req.spoiled_inputs);
    let Some(&first_seq) = sequences.first() else {
        return Err(TraceError::validation(format!(
            "none of the {} inputs is a sequence number or code: {}",
            req.spoiled_inputs.len(),
            invalid_inputs.join(", ")
        )));
    };
    if !invalid_inputs.is_empty() {
        warn!(invalid = ?invalid_inputs, "ignoring unparseable spoiled inputs");
    }

    let first = identity::find_code_by_sequence(pool, batch.id, first_seq).await?;
    let target = identity::resolve_master_for_code(&first)?;

    let mut codes: Vec<QrCode> = vec![first];
    let mut mixed = Vec::new();
    for &seq in &sequences[1..] {
        let code = identity::find_code_by_sequence(pool, batch.id, seq).await?;
        let info = identity::resolve_master_for_code(&code)?;
        if info.case_number != target.case_number {
            mixed.push(format!("sequence {seq} is in case {}", info.case_number));
        }
        codes.push(code);
    }
    if !mixed.is_empty() {
        return Err(TraceError::validation(format!(
            "request targets case {} but {}",
            target.case_number,
            mixed.join(", ")
        )));
    }

    let already: Vec<String> = codes
        .iter()
        .filter(|c| c.status == QrStatus::Spoiled)
        .map(|c| c.sequence_number.to_string())
        .collect();
    if !already.is_empty() {
        return Err(TraceError::validation(format!(
            "sequences already spoiled: {}",
            already.join(", ")
        )));
    }
    for code in &codes {
        state_machine::check_transition(code.status, QrStatus::Spoiled)?;
    }

    let exclude: Vec<String> = codes.iter().map(|c| c.code.clone()).collect();
    let mut steps = Compensation::new("reverse_submission");

    let job_id = match insert_job(
        pool,
        &NewJob {
            batch_id: batch.id,
            order_id: batch.order_id,
            manufacturer_org_id: batch.manufacturer_org_id,
            spoiled: Some(&target),
            filter_variant_id: codes[0].variant_id,
            filter_case_numbers: None,
            exclude_codes: &exclude,
            created_by: req.created_by,
        },
    )
    .await
    {
        Ok(id) => id,
        Err(err) => return steps.abort(pool, err).await,
    };
    steps.record(Undo::DeleteJob { job_id });

    if let Err(err) = insert_items(pool, job_id, &codes).await {
        return steps.abort(pool, err).await;
    }
    steps.record(Undo::DeleteJobItems { job_id });

    if let Err(err) = mark_spoiled(pool, job_id, &codes).await {
        return steps.abort(pool, err).await;
    }
    steps.complete();

    info!(
        job_id,
        case_number = target.case_number,
        items = codes.len(),
        "reverse job queued"
    );
    Ok(SubmittedJob {
        job_id,
        status: JobStatus::Queued,
        case_number: Some(target.case_number),
        variant_key: Some(target.variant_key),
        item_count: codes.len(),
        invalid_inputs,
    })
}

/// Enqueue a job from explicit exclusions and filters. No items are recorded.
#[instrument(skip_all, fields(batch_id = req.batch_id, order_id = req.order_id))]
pub async fn submit_filtered(pool: &Pool, req: &FilteredRequest) -> Result<SubmittedJob> {
    let batch = identity::batch_for_order(pool, req.batch_id, req.order_id).await?;
    if req.manufacturer_org_id != batch.manufacturer_org_id {
        return Err(TraceError::validation(format!(
            "batch {} was produced by organization {}, not {}",
            batch.id, batch.manufacturer_org_id, req.manufacturer_org_id
        )));
    }
    let mut exclude: Vec<String> = Vec::with_capacity(req.exclude_codes.len());
    for raw in &req.exclude_codes {
        let code = code_format::normalize(raw);
        if code.is_empty() {
            return Err(TraceError::validation(format!("exclude code {raw:?} is empty")));
        }
        if !exclude.iter().any(|c| c == code) {
            exclude.push(code.to_string());
        }
    }
    let job_id = insert_job(
        pool,
        &NewJob {
            batch_id: batch.id,
            order_id: batch.order_id,
            manufacturer_org_id: req.manufacturer_org_id,
            spoiled: None,
            filter_variant_id: req.filter_variant_id,
            filter_case_numbers: req.filter_case_numbers.as_deref(),
            exclude_codes: &exclude,
            created_by: req.created_by,
        },
    )
    .await?;
    info!(job_id, excluded = exclude.len(), "filtered reverse job queued");
    Ok(SubmittedJob {
        job_id,
        status: JobStatus::Queued,
        case_number: None,
        variant_key: None,
        item_count: 0,
        invalid_inputs: Vec::new(),
    })
}

async fn insert_job(pool: &Pool, job: &NewJob<'_>) -> Result<i64> {
    let filter_cases = job
        .filter_case_numbers
        .map(serde_json::to_string)
        .transpose()?;
    let exclude = serde_json::to_string(job.exclude_codes)?;
    let mut tx = pool.begin().await?;
    let job_id: i64 = sqlx::query_scalar(
        "INSERT INTO qr_reverse_jobs (batch_id, order_id, manufacturer_org_id, spoiled_case_number, \
         spoiled_variant_key, filter_variant_id, filter_case_numbers, exclude_codes, status, created_by) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?) RETURNING id",
    )
    .bind(job.batch_id)
    .bind(job.order_id)
    .bind(job.manufacturer_org_id)
    .bind(job.spoiled.map(|s| s.case_number))
    .bind(job.spoiled.map(|s| s.variant_key.as_str()))
    .bind(job.filter_variant_id)
    .bind(filter_cases)
    .bind(exclude)
    .bind(JobStatus::Queued)
    .bind(job.created_by)
    .fetch_one(&mut *tx)
    .await?;
    append_log(&mut tx, job_id, LogLevel::Info, "job queued").await?;
    tx.commit().await?;
    Ok(job_id)
}

async fn insert_items(pool: &Pool, job_id: i64, codes: &[QrCode]) -> Result<()> {
    let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(
        "INSERT INTO qr_reverse_job_items (job_id, code_id, code, sequence_number) ",
    );
    qb.push_values(codes, |mut row, code| {
        row.push_bind(job_id)
            .push_bind(code.id)
            .push_bind(code.code.clone())
            .push_bind(code.sequence_number);
    });
    qb.build().execute(pool).await?;
    Ok(())
}

/// Mark every unit spoiled in one statement, then re-derive affected cases.
async fn mark_spoiled(pool: &Pool, job_id: i64, codes: &[QrCode]) -> Result<()> {
    let mut tx = pool.begin().await?;
    let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new("UPDATE qr_codes SET status = ");
    qb.push_bind(QrStatus::Spoiled)
        .push(" WHERE status NOT IN ('spoiled', 'void') AND id IN (");
    let mut ids = qb.separated(", ");
    for code in codes {
        ids.push_bind(code.id);
    }
    ids.push_unseparated(")");
    let result = qb.build().execute(&mut *tx).await?;
    if result.rows_affected() != codes.len() as u64 {
        return Err(TraceError::conflict(format!(
            "only {} of {} units could be marked spoiled",
            result.rows_affected(),
            codes.len()
        )));
    }
    let mut masters: Vec<i64> = codes.iter().filter_map(|c| c.master_code_id).collect();
    masters.sort_unstable();
    masters.dedup();
    for master_id in masters {
        state_machine::sync_master_status(&mut tx, master_id).await?;
    }
    append_log(
        &mut tx,
        job_id,
        LogLevel::Info,
        &format!("{} units marked spoiled", codes.len()),
    )
    .await?;
    tx.commit().await?;
    Ok(())
}
