//! Append-only custody movement log.
//!
//! Reconciliation writes through the [`MovementSink`] trait so a failing
//! audit store can be simulated in tests. Movements are appended inside the
//! transaction that moved the codes; a sink error rolls the move back.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sqlx::{QueryBuilder, Sqlite, SqliteConnection};
use tracing::debug;

use crate::db::{Movement, Pool};
use crate::error::Result;
use crate::model::MovementType;

/// Rows per INSERT; seven binds each keeps a statement well under SQLite's
/// bind-parameter limit.
const ROWS_PER_INSERT: usize = 500;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MovementRecord {
    pub code_id: Option<i64>,
    pub master_code_id: Option<i64>,
    pub from_org_id: Option<i64>,
    pub to_org_id: Option<i64>,
    pub movement_type: MovementType,
    pub session_id: Option<i64>,
    pub notes: Option<String>,
}

#[async_trait]
pub trait MovementSink: Send + Sync {
    /// Persist all records or none.
    async fn append(&self, records: &[MovementRecord]) -> Result<()>;

    /// Append as part of the caller's open transaction. Sinks that live
    /// outside the database fall back to [`MovementSink::append`].
    async fn append_tx(&self, _conn: &mut SqliteConnection, records: &[MovementRecord]) -> Result<()> {
        self.append(records).await
    }
}

/// Sink backed by the `qr_movements` table.
#[derive(Clone)]
pub struct SqliteMovementLog {
    pool: Pool,
}

impl SqliteMovementLog {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl MovementSink for SqliteMovementLog {
    async fn append(&self, records: &[MovementRecord]) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }
        let mut tx = self.pool.begin().await?;
        insert_movements(&mut tx, records).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn append_tx(&self, conn: &mut SqliteConnection, records: &[MovementRecord]) -> Result<()> {
        insert_movements(conn, records).await
    }
}

async fn insert_movements(conn: &mut SqliteConnection, records: &[MovementRecord]) -> Result<()> {
    for chunk in records.chunks(ROWS_PER_INSERT) {
        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(
            "INSERT INTO qr_movements (code_id, master_code_id, from_org_id, to_org_id, movement_type, session_id, notes) ",
        );
        qb.push_values(chunk, |mut row, rec| {
            row.push_bind(rec.code_id)
                .push_bind(rec.master_code_id)
                .push_bind(rec.from_org_id)
                .push_bind(rec.to_org_id)
                .push_bind(rec.movement_type.as_str())
                .push_bind(rec.session_id)
                .push_bind(rec.notes.clone());
        });
        qb.build().execute(&mut *conn).await?;
    }
    if !records.is_empty() {
        debug!(count = records.len(), "movements appended");
    }
    Ok(())
}

pub async fn movements_for_session(pool: &Pool, session_id: i64) -> Result<Vec<Movement>> {
    let rows = sqlx::query_as::<_, Movement>(
        "SELECT id, code_id, master_code_id, from_org_id, to_org_id, movement_type, session_id, notes \
         FROM qr_movements WHERE session_id = ? ORDER BY id",
    )
    .bind(session_id)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn appends_all_records() {
        let pool = Pool::connect("sqlite::memory:").await.unwrap();
        sqlx::migrate!("./migrations").run(&pool).await.unwrap();
        let sink = SqliteMovementLog::new(pool.clone());

        sink.append(&[]).await.unwrap();
        let records: Vec<MovementRecord> = (1..=3)
            .map(|code_id| MovementRecord {
                code_id: Some(code_id),
                master_code_id: None,
                from_org_id: Some(5),
                to_org_id: Some(5),
                movement_type: MovementType::WarehouseCancel,
                session_id: Some(9),
                notes: None,
            })
            .collect();
        sink.append(&records).await.unwrap();

        let rows = movements_for_session(&pool, 9).await.unwrap();
        assert_eq!(rows.len(), 3);
        assert!(rows.iter().all(|m| m.movement_type == "warehouse_cancel"));
        assert_eq!(rows[2].code_id, Some(3));
    }

    #[tokio::test]
    async fn large_appends_are_split_across_statements() {
        let pool = Pool::connect("sqlite::memory:").await.unwrap();
        sqlx::migrate!("./migrations").run(&pool).await.unwrap();
        let sink = SqliteMovementLog::new(pool.clone());

        // 6000 rows at seven binds each would overflow a single statement.
        let records: Vec<MovementRecord> = (1..=6000)
            .map(|code_id| MovementRecord {
                code_id: Some(code_id),
                master_code_id: Some(1),
                from_org_id: Some(20),
                to_org_id: Some(30),
                movement_type: MovementType::WarehouseShip,
                session_id: Some(4),
                notes: None,
            })
            .collect();
        sink.append(&records).await.unwrap();

        let rows = movements_for_session(&pool, 4).await.unwrap();
        assert_eq!(rows.len(), 6000);
        assert_eq!(rows.last().and_then(|m| m.code_id), Some(6000));
    }

    #[tokio::test]
    async fn in_transaction_appends_roll_back_with_the_caller() {
        let pool = Pool::connect("sqlite::memory:").await.unwrap();
        sqlx::migrate!("./migrations").run(&pool).await.unwrap();
        let sink = SqliteMovementLog::new(pool.clone());
        let record = MovementRecord {
            code_id: Some(1),
            master_code_id: None,
            from_org_id: Some(20),
            to_org_id: Some(30),
            movement_type: MovementType::WarehouseShip,
            session_id: Some(2),
            notes: None,
        };

        let mut tx = pool.begin().await.unwrap();
        sink.append_tx(&mut tx, &[record]).await.unwrap();
        tx.rollback().await.unwrap();

        assert!(movements_for_session(&pool, 2).await.unwrap().is_empty());
    }
}
