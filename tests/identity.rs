use qrtrace::db::{Batch, MasterCode, QrCode};
use qrtrace::error::TraceError;
use qrtrace::identity::{self, CodeFilter, GenerateCodes, NewBatch, NewMasterCode};
use qrtrace::model::QrStatus;
use qrtrace::state_machine;

async fn setup_pool() -> sqlx::SqlitePool {
    let pool = sqlx::SqlitePool::connect("sqlite::memory:").await.unwrap();
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    pool
}

async fn seed(pool: &sqlx::SqlitePool) -> (Batch, Vec<QrCode>) {
    let batch = identity::create_batch(
        pool,
        &NewBatch {
            order_id: 3,
            manufacturer_org_id: 1,
            code_prefix: "ORD3".into(),
        },
    )
    .await
    .unwrap();
    let mut codes = Vec::new();
    for (case_number, variant_id, key) in [(1, 11, "RED"), (2, 12, "BLUE")] {
        codes.extend(
            identity::generate_codes(
                pool,
                &GenerateCodes {
                    batch_id: batch.id,
                    variant_id: Some(variant_id),
                    variant_key: key.into(),
                    case_number,
                    count: 4,
                },
            )
            .await
            .unwrap(),
        );
    }
    (batch, codes)
}

async fn master(pool: &sqlx::SqlitePool, batch: &Batch, case_number: i64, expected: i64) -> MasterCode {
    identity::create_master_code(
        pool,
        &NewMasterCode {
            batch_id: batch.id,
            case_number,
            expected_unit_count: expected,
            warehouse_org_id: Some(20),
            manufacturer_org_id: None,
        },
    )
    .await
    .unwrap()
}

fn ids(codes: &[QrCode]) -> Vec<i64> {
    codes.iter().map(|c| c.id).collect()
}

#[tokio::test]
async fn filters_by_variant_and_case() {
    let pool = setup_pool().await;
    let (batch, codes) = seed(&pool).await;

    let all = identity::find_codes_by_batch(&pool, batch.id, &CodeFilter::default())
        .await
        .unwrap();
    assert_eq!(all.len(), 8);

    let blue = identity::find_codes_by_batch(
        &pool,
        batch.id,
        &CodeFilter {
            variant_id: Some(12),
            case_numbers: None,
        },
    )
    .await
    .unwrap();
    assert_eq!(ids(&blue), ids(&codes[4..]));

    let case_one = identity::find_codes_by_batch(
        &pool,
        batch.id,
        &CodeFilter {
            variant_id: None,
            case_numbers: Some(vec![1]),
        },
    )
    .await
    .unwrap();
    assert_eq!(ids(&case_one), ids(&codes[..4]));

    let unfiltered = identity::find_codes_by_batch(
        &pool,
        batch.id,
        &CodeFilter {
            variant_id: None,
            case_numbers: Some(vec![]),
        },
    )
    .await
    .unwrap();
    assert_eq!(unfiltered.len(), 8);

    let by_seq = identity::find_code_by_sequence(&pool, batch.id, 6).await.unwrap();
    assert_eq!(by_seq.code, "ORD3-C0002-BLUE-000006");
    let by_url = identity::find_code_by_string(&pool, "https://t.example/q/ORD3-C0002-BLUE-000006?src=label")
        .await
        .unwrap();
    assert_eq!(by_url.id, by_seq.id);
}

#[tokio::test]
async fn linking_enforces_single_case_and_capacity() {
    let pool = setup_pool().await;
    let (batch, codes) = seed(&pool).await;
    let first = master(&pool, &batch, 1, 4).await;
    let second = master(&pool, &batch, 2, 2).await;

    let linked = identity::link_codes_to_master(&pool, first.id, &ids(&codes[..4]), false)
        .await
        .unwrap();
    assert_eq!(linked.actual_unit_count, 4);
    assert_eq!(
        identity::master_cases_in_batch(&pool, batch.id, &[1, 2, 9]).await.unwrap(),
        vec![1, 2]
    );

    let err = identity::link_codes_to_master(&pool, second.id, &[codes[0].id], false)
        .await
        .unwrap_err();
    assert!(matches!(err, TraceError::Conflict(_)));

    let err = identity::link_codes_to_master(&pool, second.id, &ids(&codes[4..7]), false)
        .await
        .unwrap_err();
    assert!(matches!(err, TraceError::Conflict(_)));
    // The failed link left nothing behind.
    let code = identity::get_code(&pool, codes[4].id).await.unwrap();
    assert_eq!(code.master_code_id, None);

    let overfilled = identity::link_codes_to_master(&pool, second.id, &ids(&codes[4..7]), true)
        .await
        .unwrap();
    assert_eq!(overfilled.actual_unit_count, 3);

    // Relinking into the same case is harmless.
    let again = identity::link_codes_to_master(&pool, first.id, &[codes[0].id], false)
        .await
        .unwrap();
    assert_eq!(again.actual_unit_count, 4);
}

#[tokio::test]
async fn unlink_only_before_the_warehouse() {
    let pool = setup_pool().await;
    let (batch, codes) = seed(&pool).await;
    let case = master(&pool, &batch, 1, 4).await;
    identity::link_codes_to_master(&pool, case.id, &ids(&codes[..4]), false)
        .await
        .unwrap();

    let unlinked = identity::unlink_master(&pool, case.id).await.unwrap();
    assert_eq!(unlinked.actual_unit_count, 0);
    let code = identity::get_code(&pool, codes[0].id).await.unwrap();
    assert_eq!(code.master_code_id, None);

    identity::link_codes_to_master(&pool, case.id, &ids(&codes[..4]), false)
        .await
        .unwrap();
    for code in &codes[..4] {
        state_machine::advance_code(&pool, code.id, QrStatus::ReceivedWarehouse, None, Some(20))
            .await
            .unwrap();
    }
    let err = identity::unlink_master(&pool, case.id).await.unwrap_err();
    assert!(matches!(err, TraceError::Conflict(_)));
    let code = identity::get_code(&pool, codes[0].id).await.unwrap();
    assert_eq!(code.master_code_id, Some(case.id));
}

#[tokio::test]
async fn master_status_tracks_its_slowest_unit() {
    let pool = setup_pool().await;
    let (batch, codes) = seed(&pool).await;
    let case = master(&pool, &batch, 1, 4).await;
    identity::link_codes_to_master(&pool, case.id, &ids(&codes[..4]), false)
        .await
        .unwrap();

    for code in &codes[..3] {
        state_machine::advance_code(&pool, code.id, QrStatus::ShippedDistributor, Some(8), None)
            .await
            .unwrap();
    }
    let status = identity::get_master(&pool, case.id).await.unwrap().status;
    assert_eq!(status, QrStatus::Generated);

    state_machine::transition_code(&pool, codes[3].id, QrStatus::Packed, Some(8), None)
        .await
        .unwrap();
    let status = identity::get_master(&pool, case.id).await.unwrap().status;
    assert_eq!(status, QrStatus::Packed);

    // A spoiled unit no longer holds the case back.
    let spoiled = state_machine::transition_code(&pool, codes[3].id, QrStatus::Spoiled, None, None)
        .await
        .unwrap();
    assert_eq!(spoiled.status, QrStatus::Spoiled);
    let status = identity::get_master(&pool, case.id).await.unwrap().status;
    assert_eq!(status, QrStatus::ShippedDistributor);

    let linked: Vec<QrStatus> = sqlx::query_scalar("SELECT status FROM qr_codes WHERE master_code_id = ?")
        .bind(case.id)
        .fetch_all(&pool)
        .await
        .unwrap();
    let min_rank = linked.iter().filter_map(|s| s.rank()).min().unwrap();
    assert!(status.rank().unwrap() <= min_rank);
}

#[tokio::test]
async fn transitions_reject_skips_and_terminal_codes() {
    let pool = setup_pool().await;
    let (_, codes) = seed(&pool).await;

    let err = state_machine::transition_code(&pool, codes[0].id, QrStatus::ShippedDistributor, None, None)
        .await
        .unwrap_err();
    assert!(matches!(err, TraceError::InvalidTransition { .. }));

    state_machine::transition_code(&pool, codes[0].id, QrStatus::Void, None, None)
        .await
        .unwrap();
    let err = state_machine::transition_code(&pool, codes[0].id, QrStatus::Packed, None, None)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        TraceError::InvalidTransition {
            from: QrStatus::Void,
            to: QrStatus::Packed
        }
    ));

    sqlx::query("UPDATE qr_codes SET is_blocked = 1 WHERE id = ?")
        .bind(codes[1].id)
        .execute(&pool)
        .await
        .unwrap();
    let err = state_machine::transition_code(&pool, codes[1].id, QrStatus::Packed, None, None)
        .await
        .unwrap_err();
    assert!(matches!(err, TraceError::Conflict(_)));

    let stamped = state_machine::transition_code(&pool, codes[2].id, QrStatus::Packed, Some(4), Some(2))
        .await
        .unwrap();
    assert_eq!(stamped.last_scanned_by, Some(4));
    assert_eq!(stamped.current_owner_org_id, Some(2));
    assert!(stamped.last_scanned_at.is_some());
}

#[tokio::test]
async fn reverts_are_idempotent_and_never_touch_terminal_codes() {
    let pool = setup_pool().await;
    let (_, codes) = seed(&pool).await;
    state_machine::advance_code(&pool, codes[0].id, QrStatus::WarehousePacked, None, Some(30))
        .await
        .unwrap();

    let reverted = state_machine::revert_code(&pool, codes[0].id, QrStatus::ReceivedWarehouse, Some(20))
        .await
        .unwrap();
    assert_eq!(reverted.status, QrStatus::ReceivedWarehouse);
    assert_eq!(reverted.current_owner_org_id, Some(20));
    let again = state_machine::revert_code(&pool, codes[0].id, QrStatus::ReceivedWarehouse, Some(20))
        .await
        .unwrap();
    assert_eq!(again.status, QrStatus::ReceivedWarehouse);

    let err = state_machine::revert_code(&pool, codes[0].id, QrStatus::Opened, None)
        .await
        .unwrap_err();
    assert!(matches!(err, TraceError::InvalidTransition { .. }));

    state_machine::transition_code(&pool, codes[1].id, QrStatus::Spoiled, None, None)
        .await
        .unwrap();
    let err = state_machine::revert_code(&pool, codes[1].id, QrStatus::Generated, None)
        .await
        .unwrap_err();
    assert!(matches!(err, TraceError::InvalidTransition { .. }));
}
