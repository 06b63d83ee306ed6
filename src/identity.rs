//! Identity and aggregation model: batches, unit codes and the master codes
//! (cases) that group them.

use serde::{Deserialize, Serialize};
use sqlx::{QueryBuilder, Sqlite, SqliteConnection};
use tracing::{info, instrument};

use crate::code_format;
use crate::db::{Batch, MasterCode, Pool, QrCode};
use crate::error::{Result, TraceError};
use crate::model::{PackingStatus, QrStatus, ReceivingStatus};
use crate::state_machine;

/// Code columns, with the case number falling back to the linked master's.
const CODE_SELECT: &str = "SELECT c.id, c.code, c.status, c.batch_id, c.master_code_id, \
     c.variant_id, c.order_id, c.current_owner_org_id, c.sequence_number, \
     COALESCE(c.case_number, m.case_number) AS case_number, c.variant_key, c.is_blocked, \
     c.last_scanned_at, c.last_scanned_by \
     FROM qr_codes c LEFT JOIN qr_master_codes m ON m.id = c.master_code_id";

const MASTER_SELECT: &str = "SELECT id, master_code, case_number, batch_id, status, \
     expected_unit_count, actual_unit_count, warehouse_org_id, manufacturer_org_id, \
     distributor_org_id, shipment_order_id, receive_order_id, manufacturer_scanned_at \
     FROM qr_master_codes";

const BATCH_SELECT: &str = "SELECT id, order_id, manufacturer_org_id, code_prefix, \
     packing_status, receiving_status, total_unique_codes FROM qr_batches";

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CodeFilter {
    pub variant_id: Option<i64>,
    /// `None` or an empty list means no case filter.
    pub case_numbers: Option<Vec<i64>>,
}

/// Case and variant grouping of a unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaseInfo {
    pub case_number: i64,
    pub variant_key: String,
}

#[derive(Debug, Clone)]
pub struct NewBatch {
    pub order_id: i64,
    pub manufacturer_org_id: i64,
    pub code_prefix: String,
}

#[derive(Debug, Clone)]
pub struct GenerateCodes {
    pub batch_id: i64,
    pub variant_id: Option<i64>,
    pub variant_key: String,
    pub case_number: i64,
    pub count: i64,
}

#[derive(Debug, Clone)]
pub struct NewMasterCode {
    pub batch_id: i64,
    pub case_number: i64,
    pub expected_unit_count: i64,
    pub warehouse_org_id: Option<i64>,
    pub manufacturer_org_id: Option<i64>,
}

// ----- batches -----

#[instrument(skip_all)]
pub async fn create_batch(pool: &Pool, new: &NewBatch) -> Result<Batch> {
    if new.code_prefix.trim().is_empty()
        || !new
            .code_prefix
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        return Err(TraceError::validation(format!(
            "code prefix {:?} must be alphanumeric",
            new.code_prefix
        )));
    }
    let id: i64 = sqlx::query_scalar(
        "INSERT INTO qr_batches (order_id, manufacturer_org_id, code_prefix) VALUES (?, ?, ?) RETURNING id",
    )
    .bind(new.order_id)
    .bind(new.manufacturer_org_id)
    .bind(&new.code_prefix)
    .fetch_one(pool)
    .await?;
    get_batch(pool, id).await
}

pub async fn get_batch(pool: &Pool, batch_id: i64) -> Result<Batch> {
    let mut conn = pool.acquire().await?;
    get_batch_tx(&mut conn, batch_id).await
}

pub async fn get_batch_tx(conn: &mut SqliteConnection, batch_id: i64) -> Result<Batch> {
    sqlx::query_as::<_, Batch>(&format!("{BATCH_SELECT} WHERE id = ?"))
        .bind(batch_id)
        .fetch_optional(&mut *conn)
        .await?
        .ok_or_else(|| TraceError::not_found(format!("batch {batch_id}")))
}

/// Load a batch and check it belongs to `order_id`.
pub async fn batch_for_order(pool: &Pool, batch_id: i64, order_id: i64) -> Result<Batch> {
    let batch = get_batch(pool, batch_id).await?;
    if batch.order_id != order_id {
        return Err(TraceError::validation(format!(
            "batch {batch_id} belongs to order {}, not order {order_id}",
            batch.order_id
        )));
    }
    Ok(batch)
}

#[instrument(skip(pool))]
pub async fn set_batch_packing_status(
    pool: &Pool,
    batch_id: i64,
    to: PackingStatus,
) -> Result<Batch> {
    let batch = get_batch(pool, batch_id).await?;
    if to < batch.packing_status {
        return Err(TraceError::conflict(format!(
            "batch {batch_id} packing status cannot move from {} back to {}",
            batch.packing_status.as_str(),
            to.as_str()
        )));
    }
    sqlx::query("UPDATE qr_batches SET packing_status = ? WHERE id = ?")
        .bind(to)
        .bind(batch_id)
        .execute(pool)
        .await?;
    get_batch(pool, batch_id).await
}

#[instrument(skip(pool))]
pub async fn set_batch_receiving_status(
    pool: &Pool,
    batch_id: i64,
    to: ReceivingStatus,
) -> Result<Batch> {
    let batch = get_batch(pool, batch_id).await?;
    if to < batch.receiving_status {
        return Err(TraceError::conflict(format!(
            "batch {batch_id} receiving status cannot move from {} back to {}",
            batch.receiving_status.as_str(),
            to.as_str()
        )));
    }
    sqlx::query("UPDATE qr_batches SET receiving_status = ? WHERE id = ?")
        .bind(to)
        .bind(batch_id)
        .execute(pool)
        .await?;
    get_batch(pool, batch_id).await
}

// ----- unit codes -----

/// Create `count` sequenced codes in a batch, continuing after the highest
/// existing sequence number. New codes are `generated` and owned by the
/// batch's manufacturer.
#[instrument(skip_all, fields(batch_id = req.batch_id, count = req.count))]
pub async fn generate_codes(pool: &Pool, req: &GenerateCodes) -> Result<Vec<QrCode>> {
    if req.count <= 0 {
        return Err(TraceError::validation("count must be positive"));
    }
    if req.variant_key.is_empty()
        || !req
            .variant_key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
    {
        return Err(TraceError::validation(format!(
            "variant key {:?} must be alphanumeric",
            req.variant_key
        )));
    }
    let mut tx = pool.begin().await?;
    let batch = get_batch_tx(&mut tx, req.batch_id).await?;
    let max_seq: Option<i64> =
        sqlx::query_scalar("SELECT MAX(sequence_number) FROM qr_codes WHERE batch_id = ?")
            .bind(req.batch_id)
            .fetch_one(&mut *tx)
            .await?;
    let start = max_seq.unwrap_or(0) + 1;
    let mut ids = Vec::with_capacity(req.count as usize);
    for seq in start..start + req.count {
        let code =
            code_format::format_code(&batch.code_prefix, req.case_number, &req.variant_key, seq);
        let id: i64 = sqlx::query_scalar(
            "INSERT INTO qr_codes (code, status, batch_id, variant_id, order_id, current_owner_org_id, \
             sequence_number, case_number, variant_key) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?) RETURNING id",
        )
        .bind(&code)
        .bind(QrStatus::Generated)
        .bind(batch.id)
        .bind(req.variant_id)
        .bind(batch.order_id)
        .bind(batch.manufacturer_org_id)
        .bind(seq)
        .bind(req.case_number)
        .bind(&req.variant_key)
        .fetch_one(&mut *tx)
        .await?;
        ids.push(id);
    }
    sqlx::query(
        "UPDATE qr_batches SET total_unique_codes = (SELECT COUNT(*) FROM qr_codes WHERE batch_id = ?) WHERE id = ?",
    )
    .bind(batch.id)
    .bind(batch.id)
    .execute(&mut *tx)
    .await?;
    let mut codes = Vec::with_capacity(ids.len());
    for id in ids {
        codes.push(get_code_tx(&mut tx, id).await?);
    }
    tx.commit().await?;
    info!(batch_id = batch.id, first = start, count = req.count, "codes generated");
    Ok(codes)
}

pub async fn get_code(pool: &Pool, code_id: i64) -> Result<QrCode> {
    let mut conn = pool.acquire().await?;
    get_code_tx(&mut conn, code_id).await
}

pub async fn get_code_tx(conn: &mut SqliteConnection, code_id: i64) -> Result<QrCode> {
    sqlx::query_as::<_, QrCode>(&format!("{CODE_SELECT} WHERE c.id = ?"))
        .bind(code_id)
        .fetch_optional(&mut *conn)
        .await?
        .ok_or_else(|| TraceError::not_found(format!("code {code_id}")))
}

/// Look a code up by its string, raw or URL-embedded.
pub async fn find_code_by_string(pool: &Pool, code: &str) -> Result<QrCode> {
    let mut conn = pool.acquire().await?;
    find_code_by_string_tx(&mut conn, code).await
}

pub async fn find_code_by_string_tx(conn: &mut SqliteConnection, code: &str) -> Result<QrCode> {
    let normalized = code_format::normalize(code);
    sqlx::query_as::<_, QrCode>(&format!("{CODE_SELECT} WHERE c.code = ? OR c.code = ? LIMIT 1"))
        .bind(code.trim())
        .bind(normalized)
        .fetch_optional(&mut *conn)
        .await?
        .ok_or_else(|| TraceError::not_found(format!("code {normalized}")))
}

pub async fn find_code_by_sequence(pool: &Pool, batch_id: i64, sequence: i64) -> Result<QrCode> {
    sqlx::query_as::<_, QrCode>(&format!(
        "{CODE_SELECT} WHERE c.batch_id = ? AND c.sequence_number = ?"
    ))
    .bind(batch_id)
    .bind(sequence)
    .fetch_optional(pool)
    .await?
    .ok_or_else(|| {
        TraceError::not_found(format!("sequence {sequence} in batch {batch_id}"))
    })
}

/// All codes of a batch matching the optional variant and case filters,
/// ordered by sequence number.
#[instrument(skip(pool))]
pub async fn find_codes_by_batch(
    pool: &Pool,
    batch_id: i64,
    filter: &CodeFilter,
) -> Result<Vec<QrCode>> {
    let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(CODE_SELECT);
    qb.push(" WHERE c.batch_id = ").push_bind(batch_id);
    if let Some(variant_id) = filter.variant_id {
        qb.push(" AND c.variant_id = ").push_bind(variant_id);
    }
    if let Some(cases) = filter.case_numbers.as_ref().filter(|c| !c.is_empty()) {
        qb.push(" AND COALESCE(c.case_number, m.case_number) IN (");
        let mut sep = qb.separated(", ");
        for case in cases {
            sep.push_bind(*case);
        }
        sep.push_unseparated(")");
    }
    qb.push(" ORDER BY c.sequence_number");
    let codes = qb.build_query_as::<QrCode>().fetch_all(pool).await?;
    Ok(codes)
}

pub async fn codes_for_master(conn: &mut SqliteConnection, master_id: i64) -> Result<Vec<QrCode>> {
    let codes = sqlx::query_as::<_, QrCode>(&format!(
        "{CODE_SELECT} WHERE c.master_code_id = ? ORDER BY c.sequence_number"
    ))
    .bind(master_id)
    .fetch_all(&mut *conn)
    .await?;
    Ok(codes)
}

/// Case number and variant key of a unit, preferring the stored fields and
/// falling back to the code string.
pub fn resolve_master_for_code(code: &QrCode) -> Result<CaseInfo> {
    let parsed = code_format::parse_code(&code.code);
    let case_number = code
        .case_number
        .or_else(|| parsed.as_ref().map(|p| p.case_number))
        .ok_or_else(|| {
            TraceError::Configuration(format!("code {} has no case number", code.code))
        })?;
    let variant_key = code
        .variant_key
        .clone()
        .or_else(|| parsed.map(|p| p.variant_key))
        .ok_or_else(|| {
            TraceError::Configuration(format!("code {} has no variant key", code.code))
        })?;
    Ok(CaseInfo {
        case_number,
        variant_key,
    })
}

// ----- master codes -----

#[instrument(skip_all, fields(batch_id = new.batch_id, case_number = new.case_number))]
pub async fn create_master_code(pool: &Pool, new: &NewMasterCode) -> Result<MasterCode> {
    if new.expected_unit_count <= 0 {
        return Err(TraceError::validation("expected unit count must be positive"));
    }
    let batch = get_batch(pool, new.batch_id).await?;
    let master_code = code_format::format_master_code(&batch.code_prefix, new.case_number);
    let id: i64 = sqlx::query_scalar(
        "INSERT INTO qr_master_codes (master_code, case_number, batch_id, status, expected_unit_count, \
         warehouse_org_id, manufacturer_org_id) VALUES (?, ?, ?, ?, ?, ?, ?) RETURNING id",
    )
    .bind(&master_code)
    .bind(new.case_number)
    .bind(batch.id)
    .bind(QrStatus::Generated)
    .bind(new.expected_unit_count)
    .bind(new.warehouse_org_id)
    .bind(new.manufacturer_org_id.or(Some(batch.manufacturer_org_id)))
    .fetch_one(pool)
    .await?;
    get_master(pool, id).await
}

pub async fn get_master(pool: &Pool, master_id: i64) -> Result<MasterCode> {
    let mut conn = pool.acquire().await?;
    get_master_tx(&mut conn, master_id).await
}

pub async fn get_master_tx(conn: &mut SqliteConnection, master_id: i64) -> Result<MasterCode> {
    sqlx::query_as::<_, MasterCode>(&format!("{MASTER_SELECT} WHERE id = ?"))
        .bind(master_id)
        .fetch_optional(&mut *conn)
        .await?
        .ok_or_else(|| TraceError::not_found(format!("master code {master_id}")))
}

pub async fn find_master_by_string_tx(
    conn: &mut SqliteConnection,
    master_code: &str,
) -> Result<MasterCode> {
    let normalized = code_format::normalize(master_code);
    sqlx::query_as::<_, MasterCode>(&format!("{MASTER_SELECT} WHERE master_code = ?"))
        .bind(normalized)
        .fetch_optional(&mut *conn)
        .await?
        .ok_or_else(|| TraceError::not_found(format!("master code {normalized}")))
}

/// Master cases present in a batch among `case_numbers`.
pub async fn master_cases_in_batch(
    pool: &Pool,
    batch_id: i64,
    case_numbers: &[i64],
) -> Result<Vec<i64>> {
    if case_numbers.is_empty() {
        return Ok(Vec::new());
    }
    let mut qb: QueryBuilder<Sqlite> =
        QueryBuilder::new("SELECT case_number FROM qr_master_codes WHERE batch_id = ");
    qb.push_bind(batch_id).push(" AND case_number IN (");
    let mut sep = qb.separated(", ");
    for case in case_numbers {
        sep.push_bind(*case);
    }
    sep.push_unseparated(") ORDER BY case_number");
    let rows = qb.build_query_as::<(i64,)>().fetch_all(pool).await?;
    Ok(rows.into_iter().map(|(case,)| case).collect())
}

fn before_warehouse(status: QrStatus) -> bool {
    matches!(
        (status.rank(), QrStatus::ReceivedWarehouse.rank()),
        (Some(s), Some(w)) if s < w
    )
}

/// Attach codes to a case. A code already in another case is a conflict, and
/// so is exceeding the expected unit count unless `allow_overfill` is set.
#[instrument(skip(pool, code_ids), fields(count = code_ids.len()))]
pub async fn link_codes_to_master(
    pool: &Pool,
    master_id: i64,
    code_ids: &[i64],
    allow_overfill: bool,
) -> Result<MasterCode> {
    let mut tx = pool.begin().await?;
    let master = get_master_tx(&mut tx, master_id).await?;
    if !before_warehouse(master.status) {
        return Err(TraceError::conflict(format!(
            "master code {} is {} and can no longer be repacked",
            master.master_code, master.status
        )));
    }
    for &code_id in code_ids {
        let code = get_code_tx(&mut tx, code_id).await?;
        if code.batch_id != master.batch_id {
            return Err(TraceError::validation(format!(
                "code {} is not in batch {}",
                code.code, master.batch_id
            )));
        }
        if code.status.is_terminal() {
            return Err(TraceError::conflict(format!(
                "code {} is {} and cannot be packed",
                code.code, code.status
            )));
        }
        match code.master_code_id {
            Some(other) if other != master_id => {
                return Err(TraceError::conflict(format!(
                    "code {} already belongs to master code {other}",
                    code.code
                )));
            }
            _ => {}
        }
        sqlx::query("UPDATE qr_codes SET master_code_id = ?, case_number = ? WHERE id = ?")
            .bind(master_id)
            .bind(master.case_number)
            .bind(code_id)
            .execute(&mut *tx)
            .await?;
    }
    let linked: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM qr_codes WHERE master_code_id = ?")
        .bind(master_id)
        .fetch_one(&mut *tx)
        .await?;
    if linked > master.expected_unit_count && !allow_overfill {
        return Err(TraceError::conflict(format!(
            "master code {} expects {} units, linking would make {linked}",
            master.master_code, master.expected_unit_count
        )));
    }
    sqlx::query("UPDATE qr_master_codes SET actual_unit_count = ? WHERE id = ?")
        .bind(linked)
        .bind(master_id)
        .execute(&mut *tx)
        .await?;
    state_machine::sync_master_status(&mut tx, master_id).await?;
    let master = get_master_tx(&mut tx, master_id).await?;
    tx.commit().await?;
    info!(master_id, actual = master.actual_unit_count, "codes linked to master");
    Ok(master)
}

/// Detach every code from a case. Only allowed before the case reaches a warehouse.
#[instrument(skip(pool))]
pub async fn unlink_master(pool: &Pool, master_id: i64) -> Result<MasterCode> {
    let mut tx = pool.begin().await?;
    let master = get_master_tx(&mut tx, master_id).await?;
    if !before_warehouse(master.status) {
        return Err(TraceError::conflict(format!(
            "master code {} is {}; cases processed by a warehouse cannot be unlinked",
            master.master_code, master.status
        )));
    }
    let result = sqlx::query("UPDATE qr_codes SET master_code_id = NULL WHERE master_code_id = ?")
        .bind(master_id)
        .execute(&mut *tx)
        .await?;
    sqlx::query("UPDATE qr_master_codes SET actual_unit_count = 0 WHERE id = ?")
        .bind(master_id)
        .execute(&mut *tx)
        .await?;
    let master = get_master_tx(&mut tx, master_id).await?;
    tx.commit().await?;
    info!(master_id, unlinked = result.rows_affected(), "master code unlinked");
    Ok(master)
}
