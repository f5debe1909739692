use std::time::Duration;

use lista_contracts::canonical;
use lista_contracts::token::generate_grant_hash;
use lista_contracts::unix_epoch_ms_now;
use lista_contracts::{
    BatchActionKind, ItemType, RegulationRecord, RegulationStatus, ScheduleRecord, ScheduleStatus,
};
use lista_store::{
    GrantStore, IssueOutcome, MutationOutcome, NewAttachment, NewGrant, RegulationPatch,
    SchedulePatch, UploadOutcome,
};
use sqlx::Row;

fn test_db_url() -> Option<String> {
    std::env::var("LISTA_TEST_DB_URL")
        .ok()
        .or_else(|| std::env::var("DATABASE_URL").ok())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

fn schema_db_url(base: &str, schema: &str) -> String {
    let separator = if base.contains('?') { "&" } else { "?" };
    format!("{base}{separator}options=-csearch_path%3D{schema}")
}

struct TestDb {
    admin: sqlx::PgPool,
    schema: String,
    schema_url: String,
    store: GrantStore,
}

async fn setup() -> Option<TestDb> {
    let Some(db_url) = test_db_url() else {
        eprintln!("skipping store test; set LISTA_TEST_DB_URL to enable");
        return None;
    };

    let schema = format!("lista_test_{}", ulid::Ulid::new());
    let schema_url = schema_db_url(&db_url, &schema);

    let admin = sqlx::postgres::PgPoolOptions::new()
        .max_connections(1)
        .connect(&db_url)
        .await
        .expect("DB connect should succeed");

    let create_schema = format!("CREATE SCHEMA {}", schema);
    sqlx::query(&create_schema)
        .execute(&admin)
        .await
        .expect("create schema should succeed");

    let store = GrantStore::connect_and_migrate(&schema_url, Duration::from_millis(2000))
        .await
        .expect("store init should succeed");

    Some(TestDb {
        admin,
        schema,
        schema_url,
        store,
    })
}

impl TestDb {
    async fn verify_pool(&self) -> sqlx::PgPool {
        sqlx::postgres::PgPoolOptions::new()
            .max_connections(1)
            .connect(&self.schema_url)
            .await
            .expect("DB connect should succeed")
    }

    async fn teardown(self) {
        self.store.close().await;
        let drop_schema = format!("DROP SCHEMA {} CASCADE", self.schema);
        let _ = sqlx::query(&drop_schema).execute(&self.admin).await;
        self.admin.close().await;
    }
}

fn sample_regulation(id: i64) -> RegulationRecord {
    RegulationRecord {
        id,
        citizen_name: "Maria Aparecida Souza".to_string(),
        citizen_cpf: Some("52998224725".to_string()),
        citizen_cns: Some("706002729640003".to_string()),
        care_list: "Consulta Cardiologia".to_string(),
        status: RegulationStatus::Pending,
        notes: None,
    }
}

fn sample_schedule(id: i64) -> ScheduleRecord {
    ScheduleRecord {
        id,
        citizen_name: "Joao Pedro Lima".to_string(),
        citizen_cpf: Some("11144477735".to_string()),
        citizen_cns: Some("898001160660003".to_string()),
        scheduled_at_epoch_ms: None,
        professional: None,
        status: ScheduleStatus::Scheduled,
        notes: None,
    }
}

fn new_grant<'a>(
    hash: &'a str,
    item_type: ItemType,
    action_kind: BatchActionKind,
    item_ids: &'a [i64],
    expires_at_epoch_ms: i64,
    access_limit: u32,
) -> NewGrant<'a> {
    NewGrant {
        grant_hash: hash,
        subscriber_id: "muni-001",
        item_type,
        action_kind,
        item_ids,
        expires_at_epoch_ms,
        access_limit,
        created_by: "staff-ana",
        created_at_epoch_ms: unix_epoch_ms_now(),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn grant_roundtrip_preserves_item_order() {
    let Some(db) = setup().await else {
        return;
    };

    db.store
        .upsert_subscriber("muni-001", "Municipio de Itapevi")
        .await
        .expect("subscriber upsert should succeed");
    for id in [3, 5, 9] {
        db.store
            .insert_regulation("muni-001", &sample_regulation(id))
            .await
            .expect("regulation insert should succeed");
    }

    db.store.migrate().await.expect("migrations should be idempotent");

    let hash = generate_grant_hash();
    let expires = unix_epoch_ms_now() + 3_600_000;
    let outcome = db
        .store
        .issue_grant(new_grant(
            &hash,
            ItemType::Regulation,
            BatchActionKind::StatusUpdate,
            &[5, 9, 3],
            expires,
            3,
        ))
        .await
        .expect("issue should succeed");
    assert_eq!(outcome, IssueOutcome::Issued);

    let grant = db
        .store
        .load_grant(&hash)
        .await
        .expect("load should succeed")
        .expect("grant should exist");
    assert_eq!(grant.grant_hash, hash);
    assert_eq!(grant.subscriber_id, "muni-001");
    assert_eq!(grant.subscriber_name, "Municipio de Itapevi");
    assert_eq!(grant.item_type, ItemType::Regulation);
    assert_eq!(grant.action_kind, BatchActionKind::StatusUpdate);
    assert_eq!(grant.item_ids, vec![5, 9, 3]);
    assert_eq!(grant.expires_at_epoch_ms, expires);
    assert_eq!(grant.access_limit, 3);
    assert_eq!(grant.access_count, 0);
    assert_eq!(grant.created_by, "staff-ana");

    let unknown = "ab".repeat(32);
    let missing = db
        .store
        .load_grant(&unknown)
        .await
        .expect("load should succeed");
    assert!(missing.is_none());

    db.teardown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn issue_rejects_items_outside_subscriber_scope() {
    let Some(db) = setup().await else {
        return;
    };

    db.store
        .upsert_subscriber("muni-001", "Municipio de Itapevi")
        .await
        .expect("subscriber upsert should succeed");
    db.store
        .upsert_subscriber("muni-002", "Municipio de Cotia")
        .await
        .expect("subscriber upsert should succeed");
    db.store
        .insert_regulation("muni-001", &sample_regulation(11))
        .await
        .expect("regulation insert should succeed");
    db.store
        .insert_regulation("muni-002", &sample_regulation(21))
        .await
        .expect("regulation insert should succeed");

    let expires = unix_epoch_ms_now() + 3_600_000;

    let cross_tenant_hash = generate_grant_hash();
    let outcome = db
        .store
        .issue_grant(new_grant(
            &cross_tenant_hash,
            ItemType::Regulation,
            BatchActionKind::StatusUpdate,
            &[11, 21],
            expires,
            3,
        ))
        .await
        .expect("issue should not error");
    assert_eq!(outcome, IssueOutcome::ItemsNotVisible);
    assert!(
        db.store
            .load_grant(&cross_tenant_hash)
            .await
            .expect("load should succeed")
            .is_none(),
        "a refused issuance must persist nothing"
    );

    let verify = db.verify_pool().await;
    sqlx::query("UPDATE lista_regulations SET deleted_at = now() WHERE id = $1")
        .bind(11i64)
        .execute(&verify)
        .await
        .expect("soft delete should succeed");
    verify.close().await;

    let deleted_hash = generate_grant_hash();
    let outcome = db
        .store
        .issue_grant(new_grant(
            &deleted_hash,
            ItemType::Regulation,
            BatchActionKind::StatusUpdate,
            &[11],
            expires,
            3,
        ))
        .await
        .expect("issue should not error");
    assert_eq!(outcome, IssueOutcome::ItemsNotVisible);

    db.teardown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn patch_applies_status_and_consumes_one_slot() {
    let Some(db) = setup().await else {
        return;
    };

    db.store
        .upsert_subscriber("muni-001", "Municipio de Itapevi")
        .await
        .expect("subscriber upsert should succeed");
    db.store
        .insert_regulation("muni-001", &sample_regulation(101))
        .await
        .expect("regulation insert should succeed");

    let hash = generate_grant_hash();
    let outcome = db
        .store
        .issue_grant(new_grant(
            &hash,
            ItemType::Regulation,
            BatchActionKind::StatusUpdate,
            &[101],
            unix_epoch_ms_now() + 3_600_000,
            3,
        ))
        .await
        .expect("issue should succeed");
    assert_eq!(outcome, IssueOutcome::Issued);

    let outcome = db
        .store
        .apply_regulation_patch(RegulationPatch {
            grant_hash: &hash,
            item_id: 101,
            status: Some(RegulationStatus::Approved),
            notes: Some("liberado pelo regulador"),
            actor: "batch-link",
            now_epoch_ms: unix_epoch_ms_now(),
        })
        .await
        .expect("patch should succeed");
    let MutationOutcome::Applied { audit_event_id } = outcome else {
        panic!("expected Applied, got {outcome:?}");
    };

    let grant = db
        .store
        .load_grant(&hash)
        .await
        .expect("load should succeed")
        .expect("grant should exist");
    assert_eq!(grant.access_count, 1);

    let records = db
        .store
        .load_regulations(&[101])
        .await
        .expect("load should succeed");
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].status, RegulationStatus::Approved);
    assert_eq!(records[0].notes.as_deref(), Some("liberado pelo regulador"));

    let verify = db.verify_pool().await;
    let row = sqlx::query(
        "SELECT event_type, actor, item_id, payload_json, payload_hash \
         FROM lista_audit_events WHERE event_id = $1",
    )
    .bind(&audit_event_id)
    .fetch_one(&verify)
    .await
    .expect("audit event should exist");

    let event_type: String = row.try_get("event_type").expect("event_type should exist");
    assert_eq!(event_type, "ITEM_STATUS_UPDATED");
    let actor: String = row.try_get("actor").expect("actor should exist");
    assert_eq!(actor, "batch-link");
    let item_id: i64 = row.try_get("item_id").expect("item_id should exist");
    assert_eq!(item_id, 101);

    let payload_json: serde_json::Value =
        row.try_get("payload_json").expect("payload_json should exist");
    let payload_hash: String = row.try_get("payload_hash").expect("payload_hash should exist");
    assert_eq!(payload_hash, canonical::hash_canonical_json(&payload_json));

    verify.close().await;
    db.teardown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn patch_misses_do_not_consume() {
    let Some(db) = setup().await else {
        return;
    };

    db.store
        .upsert_subscriber("muni-001", "Municipio de Itapevi")
        .await
        .expect("subscriber upsert should succeed");
    db.store
        .insert_regulation("muni-001", &sample_regulation(101))
        .await
        .expect("regulation insert should succeed");

    let hash = generate_grant_hash();
    db.store
        .issue_grant(new_grant(
            &hash,
            ItemType::Regulation,
            BatchActionKind::StatusUpdate,
            &[101],
            unix_epoch_ms_now() + 3_600_000,
            3,
        ))
        .await
        .expect("issue should succeed");

    let outcome = db
        .store
        .apply_regulation_patch(RegulationPatch {
            grant_hash: &hash,
            item_id: 999,
            status: Some(RegulationStatus::Approved),
            notes: None,
            actor: "batch-link",
            now_epoch_ms: unix_epoch_ms_now(),
        })
        .await
        .expect("patch should not error");
    assert_eq!(outcome, MutationOutcome::ItemNotInBatch);

    let verify = db.verify_pool().await;
    sqlx::query("UPDATE lista_regulations SET deleted_at = now() WHERE id = $1")
        .bind(101i64)
        .execute(&verify)
        .await
        .expect("soft delete should succeed");
    verify.close().await;

    let outcome = db
        .store
        .apply_regulation_patch(RegulationPatch {
            grant_hash: &hash,
            item_id: 101,
            status: Some(RegulationStatus::Approved),
            notes: None,
            actor: "batch-link",
            now_epoch_ms: unix_epoch_ms_now(),
        })
        .await
        .expect("patch should not error");
    assert_eq!(outcome, MutationOutcome::ItemNotInBatch);

    let grant = db
        .store
        .load_grant(&hash)
        .await
        .expect("load should succeed")
        .expect("grant should exist");
    assert_eq!(grant.access_count, 0, "misses must not consume slots");

    db.teardown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn gate_closed_rolls_back_record_updates() {
    let Some(db) = setup().await else {
        return;
    };

    db.store
        .upsert_subscriber("muni-001", "Municipio de Itapevi")
        .await
        .expect("subscriber upsert should succeed");
    db.store
        .insert_regulation("muni-001", &sample_regulation(101))
        .await
        .expect("regulation insert should succeed");

    let hash = generate_grant_hash();
    db.store
        .issue_grant(new_grant(
            &hash,
            ItemType::Regulation,
            BatchActionKind::StatusUpdate,
            &[101],
            unix_epoch_ms_now() + 3_600_000,
            1,
        ))
        .await
        .expect("issue should succeed");

    let outcome = db
        .store
        .apply_regulation_patch(RegulationPatch {
            grant_hash: &hash,
            item_id: 101,
            status: Some(RegulationStatus::Approved),
            notes: Some("primeira tentativa"),
            actor: "batch-link",
            now_epoch_ms: unix_epoch_ms_now(),
        })
        .await
        .expect("patch should succeed");
    assert!(matches!(outcome, MutationOutcome::Applied { .. }));

    let outcome = db
        .store
        .apply_regulation_patch(RegulationPatch {
            grant_hash: &hash,
            item_id: 101,
            status: Some(RegulationStatus::Denied),
            notes: Some("segunda tentativa"),
            actor: "batch-link",
            now_epoch_ms: unix_epoch_ms_now(),
        })
        .await
        .expect("patch should not error");
    assert_eq!(outcome, MutationOutcome::GateClosed);

    let records = db
        .store
        .load_regulations(&[101])
        .await
        .expect("load should succeed");
    assert_eq!(records[0].status, RegulationStatus::Approved);
    assert_eq!(records[0].notes.as_deref(), Some("primeira tentativa"));

    let grant = db
        .store
        .load_grant(&hash)
        .await
        .expect("load should succeed")
        .expect("grant should exist");
    assert_eq!(grant.access_count, 1);

    let expired_hash = generate_grant_hash();
    db.store
        .issue_grant(new_grant(
            &expired_hash,
            ItemType::Regulation,
            BatchActionKind::StatusUpdate,
            &[101],
            unix_epoch_ms_now() - 1_000,
            5,
        ))
        .await
        .expect("issue should succeed");

    let outcome = db
        .store
        .apply_regulation_patch(RegulationPatch {
            grant_hash: &expired_hash,
            item_id: 101,
            status: Some(RegulationStatus::Denied),
            notes: None,
            actor: "batch-link",
            now_epoch_ms: unix_epoch_ms_now(),
        })
        .await
        .expect("patch should not error");
    assert_eq!(outcome, MutationOutcome::GateClosed);

    db.teardown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn attachments_accumulate_without_dedup() {
    let Some(db) = setup().await else {
        return;
    };

    db.store
        .upsert_subscriber("muni-001", "Municipio de Itapevi")
        .await
        .expect("subscriber upsert should succeed");
    db.store
        .insert_regulation("muni-001", &sample_regulation(101))
        .await
        .expect("regulation insert should succeed");

    let hash = generate_grant_hash();
    db.store
        .issue_grant(new_grant(
            &hash,
            ItemType::Regulation,
            BatchActionKind::DocumentUpload,
            &[101],
            unix_epoch_ms_now() + 3_600_000,
            5,
        ))
        .await
        .expect("issue should succeed");

    let body = b"laudo medico em pdf";
    let mut attachment_ids = Vec::new();
    for _ in 0..2 {
        let outcome = db
            .store
            .store_attachment(NewAttachment {
                grant_hash: &hash,
                item_id: 101,
                document_type: "laudo",
                file_name: "laudo.pdf",
                content_type: "application/pdf",
                body,
                notes: None,
                actor: "batch-link",
                now_epoch_ms: unix_epoch_ms_now(),
            })
            .await
            .expect("upload should succeed");
        let UploadOutcome::Stored { attachment_id, .. } = outcome else {
            panic!("expected Stored, got {outcome:?}");
        };
        attachment_ids.push(attachment_id);
    }
    assert_ne!(attachment_ids[0], attachment_ids[1]);

    let verify = db.verify_pool().await;
    let row = sqlx::query(
        "SELECT count(*) AS total FROM lista_attachments WHERE regulation_id = $1",
    )
    .bind(101i64)
    .fetch_one(&verify)
    .await
    .expect("count should succeed");
    let total: i64 = row.try_get("total").expect("total should exist");
    assert_eq!(total, 2, "resends are stored as new attachments");

    let row = sqlx::query(
        "SELECT content_sha256 FROM lista_attachments WHERE attachment_id = $1",
    )
    .bind(attachment_ids[0])
    .fetch_one(&verify)
    .await
    .expect("fetch should succeed");
    let stored_sha: String = row.try_get("content_sha256").expect("sha should exist");
    assert_eq!(stored_sha, canonical::sha256_hex(body));
    verify.close().await;

    let records = db
        .store
        .load_regulations(&[101])
        .await
        .expect("load should succeed");
    assert_eq!(
        records[0].status,
        RegulationStatus::Pending,
        "uploads never change the record status"
    );

    let grant = db
        .store
        .load_grant(&hash)
        .await
        .expect("load should succeed")
        .expect("grant should exist");
    assert_eq!(grant.access_count, 2);

    db.teardown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn schedule_patch_updates_schedule_fields() {
    let Some(db) = setup().await else {
        return;
    };

    db.store
        .upsert_subscriber("muni-001", "Municipio de Itapevi")
        .await
        .expect("subscriber upsert should succeed");
    db.store
        .insert_schedule("muni-001", &sample_schedule(201))
        .await
        .expect("schedule insert should succeed");

    let hash = generate_grant_hash();
    db.store
        .issue_grant(new_grant(
            &hash,
            ItemType::Schedule,
            BatchActionKind::ScheduleAndStatus,
            &[201],
            unix_epoch_ms_now() + 3_600_000,
            3,
        ))
        .await
        .expect("issue should succeed");

    let scheduled_at = unix_epoch_ms_now() + 86_400_000;
    let outcome = db
        .store
        .apply_schedule_patch(SchedulePatch {
            grant_hash: &hash,
            item_id: 201,
            status: Some(ScheduleStatus::Confirmed),
            notes: None,
            scheduled_at_epoch_ms: Some(scheduled_at),
            professional: Some("Dr. Carlos Lima"),
            actor: "batch-link",
            now_epoch_ms: unix_epoch_ms_now(),
        })
        .await
        .expect("patch should succeed");
    let MutationOutcome::Applied { audit_event_id } = outcome else {
        panic!("expected Applied, got {outcome:?}");
    };

    let records = db
        .store
        .load_schedules(&[201])
        .await
        .expect("load should succeed");
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].status, ScheduleStatus::Confirmed);
    assert_eq!(records[0].scheduled_at_epoch_ms, Some(scheduled_at));
    assert_eq!(records[0].professional.as_deref(), Some("Dr. Carlos Lima"));

    let verify = db.verify_pool().await;
    let row = sqlx::query("SELECT event_type FROM lista_audit_events WHERE event_id = $1")
        .bind(&audit_event_id)
        .fetch_one(&verify)
        .await
        .expect("audit event should exist");
    let event_type: String = row.try_get("event_type").expect("event_type should exist");
    assert_eq!(event_type, "ITEM_SCHEDULED");
    verify.close().await;

    db.teardown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn audit_and_grant_item_tables_are_append_only() {
    let Some(db) = setup().await else {
        return;
    };

    db.store
        .upsert_subscriber("muni-001", "Municipio de Itapevi")
        .await
        .expect("subscriber upsert should succeed");
    db.store
        .insert_regulation("muni-001", &sample_regulation(101))
        .await
        .expect("regulation insert should succeed");

    let hash = generate_grant_hash();
    db.store
        .issue_grant(new_grant(
            &hash,
            ItemType::Regulation,
            BatchActionKind::StatusUpdate,
            &[101],
            unix_epoch_ms_now() + 3_600_000,
            3,
        ))
        .await
        .expect("issue should succeed");

    let verify = db.verify_pool().await;

    let update_err = sqlx::query("UPDATE lista_audit_events SET actor = 'tampered' WHERE grant_hash = $1")
        .bind(&hash)
        .execute(&verify)
        .await
        .expect_err("audit update must be rejected");
    assert!(
        format!("{update_err:?}").contains("append-only table"),
        "expected append-only error, got: {update_err:?}"
    );

    let delete_err = sqlx::query("DELETE FROM lista_audit_events WHERE grant_hash = $1")
        .bind(&hash)
        .execute(&verify)
        .await
        .expect_err("audit delete must be rejected");
    assert!(
        format!("{delete_err:?}").contains("append-only table"),
        "expected append-only error, got: {delete_err:?}"
    );

    let item_err = sqlx::query("DELETE FROM lista_batch_grant_items WHERE grant_hash = $1")
        .bind(&hash)
        .execute(&verify)
        .await
        .expect_err("grant item delete must be rejected");
    assert!(
        format!("{item_err:?}").contains("append-only table"),
        "expected append-only error, got: {item_err:?}"
    );

    verify.close().await;
    db.teardown().await;
}
