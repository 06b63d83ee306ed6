//! Shipment reconciliation sessions.
//!
//! A warehouse operator starts a session against a distributor, scans cases
//! and loose units, then completes or cancels it. Scanning moves codes from
//! `received_warehouse` to `warehouse_packed` and hands custody to the
//! distributor; cancelling puts everything back.
//!
//! Each scan stores where the case and units it moved stood before, and
//! writes its movements in the same transaction. Cancel puts back exactly
//! those: masters with their codes first, then loose codes, then the session
//! delete. Each step commits with its own movement rows and skips anything
//! already restored, so a cancel that failed halfway can simply be retried.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use sqlx::SqliteConnection;
use tracing::{info, instrument, warn};

use crate::db::{
    ExpectedQuantities, PackedCase, PackedUnit, Pool, ScannedQuantities, Shortfall,
    ValidationSession, ValidationSessionRow,
};
use crate::error::{Result, TraceError};
use crate::identity;
use crate::model::{MovementType, QrStatus, ValidationStatus};
use crate::movement::{MovementRecord, MovementSink};
use crate::state_machine;

const SESSION_SELECT: &str = "SELECT id, warehouse_org_id, distributor_org_id, source_order_id, \
     destination_order_id, expected_quantities, scanned_quantities, master_codes_scanned, \
     unique_codes_scanned, discrepancy_details, packed_state, validation_status, is_matched, \
     approved_by, approved_at, approval_notes, created_by, created_at FROM qr_validation_sessions";

/// Variant bucket for cases or units with no product variant.
pub const UNASSIGNED_VARIANT: &str = "unassigned";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartSession {
    pub warehouse_org_id: i64,
    pub distributor_org_id: i64,
    #[serde(default)]
    pub source_order_id: Option<i64>,
    #[serde(default)]
    pub destination_order_id: Option<i64>,
    #[serde(default)]
    pub created_by: Option<i64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompleteSession {
    #[serde(default)]
    pub approve_discrepancy: bool,
    #[serde(default)]
    pub approved_by: Option<i64>,
    #[serde(default)]
    pub notes: Option<String>,
}

fn variant_bucket(variant_id: Option<i64>) -> String {
    variant_id
        .map(|v| v.to_string())
        .unwrap_or_else(|| UNASSIGNED_VARIANT.to_string())
}

pub async fn get_session(pool: &Pool, session_id: i64) -> Result<ValidationSession> {
    let mut conn = pool.acquire().await?;
    get_session_tx(&mut conn, session_id).await
}

async fn get_session_tx(conn: &mut SqliteConnection, session_id: i64) -> Result<ValidationSession> {
    let row = sqlx::query_as::<_, ValidationSessionRow>(&format!("{SESSION_SELECT} WHERE id = ?"))
        .bind(session_id)
        .fetch_optional(&mut *conn)
        .await?
        .ok_or_else(|| TraceError::not_found(format!("validation session {session_id}")))?;
    ValidationSession::try_from(row)
}

/// Write back the scan state of a session.
async fn save_scan_state(conn: &mut SqliteConnection, session: &ValidationSession) -> Result<()> {
    sqlx::query(
        "UPDATE qr_validation_sessions SET scanned_quantities = ?, master_codes_scanned = ?, \
         unique_codes_scanned = ?, discrepancy_details = ?, packed_state = ? WHERE id = ?",
    )
    .bind(serde_json::to_string(&session.scanned_quantities)?)
    .bind(serde_json::to_string(&session.master_codes_scanned)?)
    .bind(serde_json::to_string(&session.unique_codes_scanned)?)
    .bind(serde_json::to_string(&session.discrepancy_details)?)
    .bind(serde_json::to_string(&session.packed_state)?)
    .bind(session.id)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

fn ensure_open(session: &ValidationSession) -> Result<()> {
    match session.validation_status {
        ValidationStatus::Pending | ValidationStatus::Discrepancy => Ok(()),
        other => Err(TraceError::conflict(format!(
            "validation session {} is {} and no longer accepts scans",
            session.id,
            other.as_str()
        ))),
    }
}

/// Open a session with a snapshot of the cases sitting at the warehouse.
#[instrument(skip(pool))]
pub async fn start_session(pool: &Pool, req: &StartSession) -> Result<ValidationSession> {
    let masters: Vec<(i64, i64, i64, Option<i64>)> = sqlx::query_as(
        "SELECT m.id, m.actual_unit_count, m.expected_unit_count, \
         (SELECT c.variant_id FROM qr_codes c WHERE c.master_code_id = m.id AND c.variant_id IS NOT NULL \
          ORDER BY c.sequence_number LIMIT 1) \
         FROM qr_master_codes m WHERE m.status = ? AND m.warehouse_org_id = ? ORDER BY m.id",
    )
    .bind(QrStatus::ReceivedWarehouse)
    .bind(req.warehouse_org_id)
    .fetch_all(pool)
    .await?;

    let mut expected = ExpectedQuantities::default();
    for (_, actual, planned, variant_id) in &masters {
        let units = if *actual > 0 { *actual } else { *planned };
        expected.cases_available += 1;
        expected.units_available += units;
        let entry = expected.by_variant.entry(variant_bucket(*variant_id)).or_default();
        entry.cases += 1;
        entry.units += units;
    }

    let id: i64 = sqlx::query_scalar(
        "INSERT INTO qr_validation_sessions (warehouse_org_id, distributor_org_id, source_order_id, \
         destination_order_id, expected_quantities, scanned_quantities, validation_status, created_by) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?) RETURNING id",
    )
    .bind(req.warehouse_org_id)
    .bind(req.distributor_org_id)
    .bind(req.source_order_id)
    .bind(req.destination_order_id)
    .bind(serde_json::to_string(&expected)?)
    .bind(serde_json::to_string(&ScannedQuantities::default())?)
    .bind(ValidationStatus::Pending)
    .bind(req.created_by)
    .fetch_one(pool)
    .await?;
    info!(
        session_id = id,
        cases = expected.cases_available,
        units = expected.units_available,
        "validation session started"
    );
    get_session(pool, id).await
}

/// Ship a whole case to the session's distributor.
#[instrument(skip(pool, sink))]
pub async fn scan_master(
    pool: &Pool,
    session_id: i64,
    master_code: &str,
    actor: Option<i64>,
    sink: &dyn MovementSink,
) -> Result<ValidationSession> {
    let mut tx = pool.begin().await?;
    let mut session = get_session_tx(&mut tx, session_id).await?;
    ensure_open(&session)?;
    let master = identity::find_master_by_string_tx(&mut tx, master_code).await?;

    if session.master_codes_scanned.contains(&master.id) {
        warn!(session_id, master = %master.master_code, "case scanned twice");
        session
            .discrepancy_details
            .warnings
            .push(format!("master code {} scanned more than once", master.master_code));
        save_scan_state(&mut tx, &session).await?;
        tx.commit().await?;
        return Ok(session);
    }
    if master.status != QrStatus::ReceivedWarehouse
        || master.warehouse_org_id != Some(session.warehouse_org_id)
    {
        return Err(TraceError::conflict(format!(
            "master code {} is {} and not available at warehouse {}",
            master.master_code, master.status, session.warehouse_org_id
        )));
    }

    let ship = |code_id: Option<i64>| MovementRecord {
        code_id,
        master_code_id: Some(master.id),
        from_org_id: Some(session.warehouse_org_id),
        to_org_id: Some(session.distributor_org_id),
        movement_type: MovementType::WarehouseShip,
        session_id: Some(session.id),
        notes: None,
    };
    let mut records = vec![ship(None)];
    let mut packed = Vec::new();

    let codes = identity::codes_for_master(&mut tx, master.id).await?;
    for code in &codes {
        if code.status != QrStatus::ReceivedWarehouse {
            continue;
        }
        state_machine::transition_code_tx(
            &mut tx,
            code.id,
            QrStatus::WarehousePacked,
            actor,
            Some(session.distributor_org_id),
        )
        .await?;
        packed.push(PackedUnit {
            code_id: code.id,
            master_code_id: Some(master.id),
            previous_owner_org_id: code.current_owner_org_id,
        });
        records.push(ship(Some(code.id)));
    }
    sqlx::query(
        "UPDATE qr_master_codes SET shipment_order_id = COALESCE(?, shipment_order_id), \
         distributor_org_id = ? WHERE id = ?",
    )
    .bind(session.destination_order_id)
    .bind(session.distributor_org_id)
    .bind(master.id)
    .execute(&mut *tx)
    .await?;

    let units = packed.len() as i64;
    let variant = variant_bucket(codes.iter().find_map(|c| c.variant_id));
    let scanned = &mut session.scanned_quantities;
    scanned.total_cases += 1;
    scanned.total_units += units;
    let entry = scanned.by_variant.entry(variant).or_default();
    entry.cases += 1;
    entry.units += units;
    if units < master.expected_unit_count {
        session.discrepancy_details.shortfalls.push(Shortfall {
            reference: master.master_code.clone(),
            expected_units: master.expected_unit_count,
            actual_units: units,
            missing_units: master.expected_unit_count - units,
        });
    }
    session.master_codes_scanned.push(master.id);
    session.packed_state.cases.push(PackedCase {
        master_code_id: master.id,
        previous_shipment_order_id: master.shipment_order_id,
        previous_distributor_org_id: master.distributor_org_id,
    });
    session.packed_state.units.extend(packed);
    save_scan_state(&mut tx, &session).await?;
    sink.append_tx(&mut tx, &records).await?;
    tx.commit().await?;
    info!(session_id, master = %master.master_code, units, "case scanned");
    Ok(session)
}

/// Ship a single loose unit to the session's distributor.
#[instrument(skip(pool, sink))]
pub async fn scan_code(
    pool: &Pool,
    session_id: i64,
    code: &str,
    actor: Option<i64>,
    sink: &dyn MovementSink,
) -> Result<ValidationSession> {
    let mut tx = pool.begin().await?;
    let mut session = get_session_tx(&mut tx, session_id).await?;
    ensure_open(&session)?;
    let unit = identity::find_code_by_string_tx(&mut tx, code).await?;

    let covered = unit
        .master_code_id
        .is_some_and(|m| session.master_codes_scanned.contains(&m));
    if covered || session.unique_codes_scanned.contains(&unit.id) {
        warn!(session_id, code = %unit.code, "unit already counted");
        session
            .discrepancy_details
            .warnings
            .push(format!("code {} already counted in this session", unit.code));
        save_scan_state(&mut tx, &session).await?;
        tx.commit().await?;
        return Ok(session);
    }
    if unit.status != QrStatus::ReceivedWarehouse
        || unit.current_owner_org_id != Some(session.warehouse_org_id)
    {
        return Err(TraceError::conflict(format!(
            "code {} is {} and not available at warehouse {}",
            unit.code, unit.status, session.warehouse_org_id
        )));
    }
    state_machine::transition_code_tx(
        &mut tx,
        unit.id,
        QrStatus::WarehousePacked,
        actor,
        Some(session.distributor_org_id),
    )
    .await?;

    session.scanned_quantities.total_units += 1;
    session
        .scanned_quantities
        .by_variant
        .entry(variant_bucket(unit.variant_id))
        .or_default()
        .units += 1;
    session.unique_codes_scanned.push(unit.id);
    session.packed_state.units.push(PackedUnit {
        code_id: unit.id,
        master_code_id: None,
        previous_owner_org_id: unit.current_owner_org_id,
    });
    save_scan_state(&mut tx, &session).await?;
    let record = MovementRecord {
        code_id: Some(unit.id),
        master_code_id: unit.master_code_id,
        from_org_id: Some(session.warehouse_org_id),
        to_org_id: Some(session.distributor_org_id),
        movement_type: MovementType::WarehouseShip,
        session_id: Some(session.id),
        notes: None,
    };
    sink.append_tx(&mut tx, &[record]).await?;
    tx.commit().await?;
    Ok(session)
}

/// Record a shortfall noticed outside of scanning, e.g. a damaged case.
#[instrument(skip(pool))]
pub async fn record_shortfall(
    pool: &Pool,
    session_id: i64,
    shortfall: Shortfall,
) -> Result<ValidationSession> {
    if shortfall.reference.trim().is_empty() {
        return Err(TraceError::validation("shortfall reference is empty"));
    }
    if shortfall.missing_units < 0 || shortfall.actual_units < 0 {
        return Err(TraceError::validation(format!(
            "shortfall for {} has negative unit counts",
            shortfall.reference
        )));
    }
    let mut tx = pool.begin().await?;
    let mut session = get_session_tx(&mut tx, session_id).await?;
    ensure_open(&session)?;
    session.discrepancy_details.shortfalls.push(shortfall);
    save_scan_state(&mut tx, &session).await?;
    tx.commit().await?;
    Ok(session)
}

/// Settle a session. Calling it again on a settled session returns the
/// stored result unchanged.
#[instrument(skip(pool, req))]
pub async fn complete_session(
    pool: &Pool,
    session_id: i64,
    req: &CompleteSession,
) -> Result<ValidationSession> {
    let session = get_session(pool, session_id).await?;
    match session.validation_status {
        ValidationStatus::Approved | ValidationStatus::Matched => return Ok(session),
        ValidationStatus::Pending | ValidationStatus::Discrepancy => {}
    }

    let outcome = if !session.discrepancy_details.has_discrepancy() {
        ValidationStatus::Matched
    } else if req.approve_discrepancy {
        ValidationStatus::Approved
    } else {
        ValidationStatus::Discrepancy
    };
    if !write_outcome(pool, session_id, outcome, req).await? {
        warn!(session_id, "validation session settled by another request");
        return get_session(pool, session_id).await;
    }
    match outcome {
        ValidationStatus::Matched => info!(session_id, "validation session matched"),
        ValidationStatus::Approved => {
            info!(session_id, approved_by = ?req.approved_by, "discrepancy approved")
        }
        _ => info!(
            session_id,
            shortfalls = session.discrepancy_details.shortfalls.len(),
            "validation session has discrepancies"
        ),
    }
    get_session(pool, session_id).await
}

/// Store a completion result. Only an unsettled session is written; returns
/// false when the session was already matched or approved.
async fn write_outcome(
    pool: &Pool,
    session_id: i64,
    outcome: ValidationStatus,
    req: &CompleteSession,
) -> Result<bool> {
    let (approved_by, approved_at, notes) = match outcome {
        ValidationStatus::Approved => (req.approved_by, Some(Utc::now()), req.notes.as_deref()),
        _ => (None, None, None),
    };
    let written = sqlx::query(
        "UPDATE qr_validation_sessions SET validation_status = ?, is_matched = ?, approved_by = ?, \
         approved_at = ?, approval_notes = ? WHERE id = ? AND validation_status IN (?, ?)",
    )
    .bind(outcome)
    .bind(outcome == ValidationStatus::Matched)
    .bind(approved_by)
    .bind(approved_at)
    .bind(notes)
    .bind(session_id)
    .bind(ValidationStatus::Pending)
    .bind(ValidationStatus::Discrepancy)
    .execute(pool)
    .await?;
    Ok(written.rows_affected() == 1)
}

/// Undo every scan of an unsettled session and delete it.
///
/// Any failure stops before the delete; the session stays in place and the
/// cancel can be retried.
#[instrument(skip(pool, sink))]
pub async fn cancel_session(pool: &Pool, session_id: i64, sink: &dyn MovementSink) -> Result<()> {
    let session = get_session(pool, session_id).await?;
    match session.validation_status {
        ValidationStatus::Pending | ValidationStatus::Discrepancy => {}
        other => {
            return Err(TraceError::conflict(format!(
                "validation session {session_id} is {} and cannot be cancelled",
                other.as_str()
            )))
        }
    }
    let warehouse = session.warehouse_org_id;
    let movement = |code_id: Option<i64>, master_code_id: Option<i64>| MovementRecord {
        code_id,
        master_code_id,
        from_org_id: Some(warehouse),
        to_org_id: Some(warehouse),
        movement_type: MovementType::WarehouseCancel,
        session_id: Some(session_id),
        notes: None,
    };
    let packed = &session.packed_state;
    let mut restored = 0usize;

    for case in &packed.cases {
        let mut tx = pool.begin().await?;
        let mut records = Vec::new();
        let master = identity::get_master_tx(&mut tx, case.master_code_id).await?;
        if master.status != QrStatus::ReceivedWarehouse
            || master.shipment_order_id != case.previous_shipment_order_id
            || master.distributor_org_id != case.previous_distributor_org_id
        {
            sqlx::query(
                "UPDATE qr_master_codes SET status = ?, shipment_order_id = ?, distributor_org_id = ? \
                 WHERE id = ?",
            )
            .bind(QrStatus::ReceivedWarehouse)
            .bind(case.previous_shipment_order_id)
            .bind(case.previous_distributor_org_id)
            .bind(master.id)
            .execute(&mut *tx)
            .await?;
            records.push(movement(None, Some(master.id)));
        }
        for unit in packed
            .units
            .iter()
            .filter(|u| u.master_code_id == Some(master.id))
        {
            if restore_unit(&mut tx, unit, warehouse).await? {
                records.push(movement(Some(unit.code_id), Some(master.id)));
            }
        }
        sink.append_tx(&mut tx, &records).await?;
        tx.commit().await?;
        restored += records.len();
    }

    for unit in packed.units.iter().filter(|u| u.master_code_id.is_none()) {
        let mut tx = pool.begin().await?;
        if restore_unit(&mut tx, unit, warehouse).await? {
            let code = identity::get_code_tx(&mut tx, unit.code_id).await?;
            sink.append_tx(&mut tx, &[movement(Some(code.id), code.master_code_id)])
                .await?;
            restored += 1;
        }
        tx.commit().await?;
    }

    sqlx::query("DELETE FROM qr_validation_sessions WHERE id = ?")
        .bind(session_id)
        .execute(pool)
        .await?;
    info!(session_id, restored, "validation session cancelled");
    Ok(())
}

/// Put a scanned unit back in `received_warehouse` with its pre-scan
/// custodian. Returns false when there is nothing to do: already restored,
/// or terminal since the scan.
async fn restore_unit(
    conn: &mut SqliteConnection,
    unit: &PackedUnit,
    warehouse_org_id: i64,
) -> Result<bool> {
    let code = identity::get_code_tx(conn, unit.code_id).await?;
    let owner = unit.previous_owner_org_id.or(Some(warehouse_org_id));
    let (Some(current), Some(target)) = (code.status.rank(), QrStatus::ReceivedWarehouse.rank())
    else {
        return Ok(false);
    };
    if current < target || (current == target && code.current_owner_org_id == owner) {
        return Ok(false);
    }
    state_machine::revert_code_tx(conn, code.id, QrStatus::ReceivedWarehouse, owner).await?;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{DiscrepancyDetails, PackedState};

    #[test]
    fn variant_bucket_falls_back_to_unassigned() {
        assert_eq!(variant_bucket(Some(42)), "42");
        assert_eq!(variant_bucket(None), UNASSIGNED_VARIANT);
    }

    #[test]
    fn settled_sessions_reject_scans() {
        let mut session = ValidationSession {
            id: 1,
            warehouse_org_id: 2,
            distributor_org_id: 3,
            source_order_id: None,
            destination_order_id: None,
            expected_quantities: ExpectedQuantities::default(),
            scanned_quantities: ScannedQuantities::default(),
            master_codes_scanned: vec![],
            unique_codes_scanned: vec![],
            discrepancy_details: DiscrepancyDetails::default(),
            packed_state: PackedState::default(),
            validation_status: ValidationStatus::Pending,
            is_matched: false,
            approved_by: None,
            approved_at: None,
            approval_notes: None,
            created_by: None,
            created_at: Utc::now(),
        };
        assert!(ensure_open(&session).is_ok());
        session.validation_status = ValidationStatus::Discrepancy;
        assert!(ensure_open(&session).is_ok());
        session.validation_status = ValidationStatus::Matched;
        assert!(matches!(ensure_open(&session), Err(TraceError::Conflict(_))));
    }

    #[tokio::test]
    async fn settled_outcome_is_never_overwritten() {
        let pool = Pool::connect("sqlite::memory:").await.unwrap();
        sqlx::migrate!("./migrations").run(&pool).await.unwrap();
        let session = start_session(
            &pool,
            &StartSession {
                warehouse_org_id: 2,
                distributor_org_id: 3,
                source_order_id: None,
                destination_order_id: None,
                created_by: None,
            },
        )
        .await
        .unwrap();
        let approve = CompleteSession {
            approve_discrepancy: true,
            approved_by: Some(9),
            notes: Some("counted twice".into()),
        };

        assert!(write_outcome(&pool, session.id, ValidationStatus::Approved, &approve)
            .await
            .unwrap());
        // A slower request that read the session while it was still pending.
        let late = write_outcome(&pool, session.id, ValidationStatus::Discrepancy, &CompleteSession::default())
            .await
            .unwrap();
        assert!(!late);

        let stored = get_session(&pool, session.id).await.unwrap();
        assert_eq!(stored.validation_status, ValidationStatus::Approved);
        assert_eq!(stored.approved_by, Some(9));
        assert_eq!(stored.approval_notes.as_deref(), Some("counted twice"));
    }
}
