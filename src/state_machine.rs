//! Status transitions for Unique Codes, and the Master Code status derived
//! from them.
//!
//! ```text
//!   generated → packed → shipped_distributor → received_warehouse → warehouse_packed → opened
//!        └──────────────┴──────── any non-terminal ───────┴──────────────→ spoiled | void
//! ```
//!
//! Forward moves go exactly one step. Administrative reverts may jump back to
//! any earlier state. `spoiled` and `void` are terminal.
//!
//! A Master Code's status is the minimum over its linked, non-terminal codes.
//! Every code write re-derives it in the same transaction, so the two never
//! drift.

use sqlx::SqliteConnection;
use tracing::{debug, instrument};

use crate::db::{Pool, QrCode};
use crate::error::{Result, TraceError};
use crate::identity;
use crate::model::QrStatus;

/// Validate a forward transition.
pub fn check_transition(from: QrStatus, to: QrStatus) -> Result<()> {
    let invalid = || TraceError::InvalidTransition { from, to };
    if from.is_terminal() {
        return Err(invalid());
    }
    if to.is_terminal() || from.next() == Some(to) {
        Ok(())
    } else {
        Err(invalid())
    }
}

/// Validate an administrative revert: backwards or in place, never forward,
/// never touching a terminal state.
pub fn check_revert(from: QrStatus, to: QrStatus) -> Result<()> {
    match (from.rank(), to.rank()) {
        (Some(f), Some(t)) if t <= f => Ok(()),
        _ => Err(TraceError::InvalidTransition { from, to }),
    }
}

/// Minimum status over the ranked values; terminal codes do not hold a case back.
pub fn derive_master_status<I>(statuses: I) -> Option<QrStatus>
where
    I: IntoIterator<Item = QrStatus>,
{
    statuses
        .into_iter()
        .filter_map(|s| s.rank().map(|r| (r, s)))
        .min_by_key(|(r, _)| *r)
        .map(|(_, s)| s)
}

/// Persist the derived status of a master. Masters with no ranked code keep
/// their stored status. Returns the status after the sync.
pub async fn sync_master_status(conn: &mut SqliteConnection, master_id: i64) -> Result<QrStatus> {
    let stored: QrStatus = sqlx::query_scalar("SELECT status FROM qr_master_codes WHERE id = ?")
        .bind(master_id)
        .fetch_optional(&mut *conn)
        .await?
        .ok_or_else(|| TraceError::not_found(format!("master code {master_id}")))?;
    let linked: Vec<QrStatus> =
        sqlx::query_scalar("SELECT status FROM qr_codes WHERE master_code_id = ?")
            .bind(master_id)
            .fetch_all(&mut *conn)
            .await?;
    let Some(derived) = derive_master_status(linked) else {
        return Ok(stored);
    };
    if derived != stored {
        sqlx::query("UPDATE qr_master_codes SET status = ? WHERE id = ?")
            .bind(derived)
            .bind(master_id)
            .execute(&mut *conn)
            .await?;
        debug!(master_id, from = %stored, to = %derived, "master status re-derived");
    }
    Ok(derived)
}

/// Move a code one step forward (or into `spoiled`/`void`), optionally
/// handing custody to `owner_org`.
#[instrument(skip(pool))]
pub async fn transition_code(
    pool: &Pool,
    code_id: i64,
    to: QrStatus,
    actor: Option<i64>,
    owner_org: Option<i64>,
) -> Result<QrCode> {
    let mut tx = pool.begin().await?;
    let code = transition_code_tx(&mut tx, code_id, to, actor, owner_org).await?;
    tx.commit().await?;
    Ok(code)
}

pub async fn transition_code_tx(
    conn: &mut SqliteConnection,
    code_id: i64,
    to: QrStatus,
    actor: Option<i64>,
    owner_org: Option<i64>,
) -> Result<QrCode> {
    let code = identity::get_code_tx(conn, code_id).await?;
    if code.is_blocked && !to.is_terminal() {
        return Err(TraceError::conflict(format!("code {} is blocked", code.code)));
    }
    check_transition(code.status, to)?;
    sqlx::query(
        "UPDATE qr_codes SET status = ?, current_owner_org_id = COALESCE(?, current_owner_org_id), \
         last_scanned_at = CURRENT_TIMESTAMP, last_scanned_by = COALESCE(?, last_scanned_by) \
         WHERE id = ?",
    )
    .bind(to)
    .bind(owner_org)
    .bind(actor)
    .bind(code_id)
    .execute(&mut *conn)
    .await?;
    if let Some(master_id) = code.master_code_id {
        sync_master_status(conn, master_id).await?;
    }
    identity::get_code_tx(conn, code_id).await
}

/// Walk a code forward step by step until it reaches `target`.
pub async fn advance_code(
    pool: &Pool,
    code_id: i64,
    target: QrStatus,
    actor: Option<i64>,
    owner_org: Option<i64>,
) -> Result<QrCode> {
    let mut tx = pool.begin().await?;
    let mut code = identity::get_code_tx(&mut tx, code_id).await?;
    let target_rank = target
        .rank()
        .ok_or(TraceError::InvalidTransition { from: code.status, to: target })?;
    while code.status != target {
        let next = match code.status.rank() {
            Some(r) if r < target_rank => code.status.next(),
            _ => None,
        }
        .ok_or(TraceError::InvalidTransition { from: code.status, to: target })?;
        code = transition_code_tx(&mut tx, code_id, next, actor, owner_org).await?;
    }
    tx.commit().await?;
    Ok(code)
}

#[instrument(skip(pool))]
pub async fn revert_code(
    pool: &Pool,
    code_id: i64,
    to: QrStatus,
    owner_org: Option<i64>,
) -> Result<QrCode> {
    let mut tx = pool.begin().await?;
    let code = revert_code_tx(&mut tx, code_id, to, owner_org).await?;
    tx.commit().await?;
    Ok(code)
}

/// Administrative revert. Reverting to the current status is a no-op for the
/// status; custody is still applied so a retried compensation converges.
pub async fn revert_code_tx(
    conn: &mut SqliteConnection,
    code_id: i64,
    to: QrStatus,
    owner_org: Option<i64>,
) -> Result<QrCode> {
    let code = identity::get_code_tx(conn, code_id).await?;
    check_revert(code.status, to)?;
    sqlx::query(
        "UPDATE qr_codes SET status = ?, current_owner_org_id = COALESCE(?, current_owner_org_id) \
         WHERE id = ?",
    )
    .bind(to)
    .bind(owner_org)
    .bind(code_id)
    .execute(&mut *conn)
    .await?;
    if let Some(master_id) = code.master_code_id {
        sync_master_status(conn, master_id).await?;
    }
    identity::get_code_tx(conn, code_id).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use QrStatus::*;

    #[test]
    fn forward_one_step_only() {
        assert!(check_transition(Generated, Packed).is_ok());
        assert!(check_transition(ReceivedWarehouse, WarehousePacked).is_ok());
        assert!(check_transition(Generated, ShippedDistributor).is_err());
        assert!(check_transition(Packed, Generated).is_err());
        assert!(check_transition(Packed, Packed).is_err());
        assert!(check_transition(Opened, Opened).is_err());
    }

    #[test]
    fn absorbing_states() {
        assert!(check_transition(Generated, Spoiled).is_ok());
        assert!(check_transition(WarehousePacked, Void).is_ok());
        let err = check_transition(Spoiled, Packed).unwrap_err();
        assert!(matches!(
            err,
            TraceError::InvalidTransition { from: Spoiled, to: Packed }
        ));
        assert!(check_transition(Void, Spoiled).is_err());
    }

    #[test]
    fn reverts_go_backwards_only() {
        assert!(check_revert(Opened, Generated).is_ok());
        assert!(check_revert(WarehousePacked, ReceivedWarehouse).is_ok());
        assert!(check_revert(ReceivedWarehouse, ReceivedWarehouse).is_ok());
        assert!(check_revert(Packed, ReceivedWarehouse).is_err());
        assert!(check_revert(Spoiled, Generated).is_err());
        assert!(check_revert(Packed, Void).is_err());
    }

    #[test]
    fn master_status_is_minimum_of_ranked_codes() {
        assert_eq!(
            derive_master_status([WarehousePacked, ReceivedWarehouse, Opened]),
            Some(ReceivedWarehouse)
        );
        assert_eq!(derive_master_status([Spoiled, Packed]), Some(Packed));
        assert_eq!(derive_master_status([Spoiled, Void]), None);
        assert_eq!(derive_master_status(Vec::new()), None);
    }
}
