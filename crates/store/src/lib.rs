use std::time::Duration;

use lista_contracts::canonical;
use lista_contracts::{
    BatchActionKind, ItemType, RegulationRecord, RegulationStatus, ScheduleRecord, ScheduleStatus,
};
use sqlx::Row;
use sqlx::postgres::PgPoolOptions;
use ulid::Ulid;

#[derive(Debug)]
pub enum StoreError {
    Timeout,
    Sqlx(sqlx::Error),
    Decode(&'static str),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::Timeout => write!(f, "store operation timed out"),
            StoreError::Sqlx(err) => write!(f, "store sql error: {}", err),
            StoreError::Decode(what) => write!(f, "store decode error: {}", what),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<sqlx::Error> for StoreError {
    fn from(value: sqlx::Error) -> Self {
        StoreError::Sqlx(value)
    }
}

#[derive(Clone)]
pub struct GrantStore {
    pool: sqlx::PgPool,
    write_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct GrantRecord {
    pub grant_hash: String,
    pub subscriber_id: String,
    pub subscriber_name: String,
    pub item_type: ItemType,
    pub action_kind: BatchActionKind,
    pub item_ids: Vec<i64>,
    pub expires_at_epoch_ms: i64,
    pub access_limit: u32,
    pub access_count: u32,
    pub created_by: String,
    pub created_at_epoch_ms: i64,
}

pub struct NewGrant<'a> {
    pub grant_hash: &'a str,
    pub subscriber_id: &'a str,
    pub item_type: ItemType,
    pub action_kind: BatchActionKind,
    pub item_ids: &'a [i64],
    pub expires_at_epoch_ms: i64,
    pub access_limit: u32,
    pub created_by: &'a str,
    pub created_at_epoch_ms: i64,
}

#[derive(Debug, PartialEq, Eq)]
pub enum IssueOutcome {
    Issued,
    ItemsNotVisible,
}

#[derive(Debug, PartialEq, Eq)]
pub enum MutationOutcome {
    Applied { audit_event_id: String },
    ItemNotInBatch,
    GateClosed,
}

#[derive(Debug, PartialEq, Eq)]
pub enum UploadOutcome {
    Stored {
        attachment_id: i64,
        audit_event_id: String,
    },
    ItemNotInBatch,
    GateClosed,
}

pub struct RegulationPatch<'a> {
    pub grant_hash: &'a str,
    pub item_id: i64,
    pub status: Option<RegulationStatus>,
    pub notes: Option<&'a str>,
    pub actor: &'a str,
    pub now_epoch_ms: i64,
}

pub struct SchedulePatch<'a> {
    pub grant_hash: &'a str,
    pub item_id: i64,
    pub status: Option<ScheduleStatus>,
    pub notes: Option<&'a str>,
    pub scheduled_at_epoch_ms: Option<i64>,
    pub professional: Option<&'a str>,
    pub actor: &'a str,
    pub now_epoch_ms: i64,
}

pub struct NewAttachment<'a> {
    pub grant_hash: &'a str,
    pub item_id: i64,
    pub document_type: &'a str,
    pub file_name: &'a str,
    pub content_type: &'a str,
    pub body: &'a [u8],
    pub notes: Option<&'a str>,
    pub actor: &'a str,
    pub now_epoch_ms: i64,
}

const CONSUME_SLOT_SQL: &str = "UPDATE lista_batch_grants SET access_count = access_count + 1 \
     WHERE grant_hash = $1 AND access_count < access_limit AND expires_at_ms > $2";

const MEMBERSHIP_SQL: &str =
    "SELECT 1 AS present FROM lista_batch_grant_items WHERE grant_hash = $1 AND item_id = $2";

const APPEND_AUDIT_SQL: &str = "INSERT INTO lista_audit_events \
     (event_id, grant_hash, event_type, actor, item_id, payload_json, payload_hash) \
     VALUES ($1, $2, $3, $4, $5, $6, $7)";

impl GrantStore {
    pub async fn connect(db_url: &str, write_timeout: Duration) -> Result<Self, StoreError> {
        let pool = tokio::time::timeout(
            Duration::from_secs(2),
            PgPoolOptions::new().max_connections(8).connect(db_url),
        )
        .await
        .map_err(|_| StoreError::Timeout)??;

        Ok(Self {
            pool,
            write_timeout,
        })
    }

    pub async fn connect_and_migrate(
        db_url: &str,
        write_timeout: Duration,
    ) -> Result<Self, StoreError> {
        let store = Self::connect(db_url, write_timeout).await?;
        store.migrate().await?;
        Ok(store)
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        tokio::time::timeout(Duration::from_secs(10), migrate(&self.pool))
            .await
            .map_err(|_| StoreError::Timeout)??;
        Ok(())
    }

    pub async fn ping(&self) -> Result<(), StoreError> {
        tokio::time::timeout(self.write_timeout, sqlx::query("SELECT 1").execute(&self.pool))
            .await
            .map_err(|_| StoreError::Timeout)??;
        Ok(())
    }

    pub async fn upsert_subscriber(
        &self,
        subscriber_id: &str,
        display_name: &str,
    ) -> Result<(), StoreError> {
        tokio::time::timeout(
            self.write_timeout,
            sqlx::query(
                "INSERT INTO lista_subscribers (subscriber_id, display_name) VALUES ($1, $2) \
                 ON CONFLICT (subscriber_id) DO UPDATE SET display_name = EXCLUDED.display_name",
            )
            .bind(subscriber_id)
            .bind(display_name)
            .execute(&self.pool),
        )
        .await
        .map_err(|_| StoreError::Timeout)??;
        Ok(())
    }

    pub async fn subscriber_name(&self, subscriber_id: &str) -> Result<Option<String>, StoreError> {
        let row = sqlx::query("SELECT display_name FROM lista_subscribers WHERE subscriber_id = $1")
            .bind(subscriber_id)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => Ok(Some(row.try_get("display_name")?)),
            None => Ok(None),
        }
    }

    pub async fn insert_regulation(
        &self,
        subscriber_id: &str,
        record: &RegulationRecord,
    ) -> Result<(), StoreError> {
        tokio::time::timeout(
            self.write_timeout,
            sqlx::query(
                "INSERT INTO lista_regulations \
                 (id, subscriber_id, citizen_name, citizen_cpf, citizen_cns, care_list, status, notes) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
            )
            .bind(record.id)
            .bind(subscriber_id)
            .bind(&record.citizen_name)
            .bind(&record.citizen_cpf)
            .bind(&record.citizen_cns)
            .bind(&record.care_list)
            .bind(record.status.as_str())
            .bind(&record.notes)
            .execute(&self.pool),
        )
        .await
        .map_err(|_| StoreError::Timeout)??;
        Ok(())
    }

    pub async fn insert_schedule(
        &self,
        subscriber_id: &str,
        record: &ScheduleRecord,
    ) -> Result<(), StoreError> {
        tokio::time::timeout(
            self.write_timeout,
            sqlx::query(
                "INSERT INTO lista_schedules \
                 (id, subscriber_id, citizen_name, citizen_cpf, citizen_cns, scheduled_at_ms, professional, status, notes) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
            )
            .bind(record.id)
            .bind(subscriber_id)
            .bind(&record.citizen_name)
            .bind(&record.citizen_cpf)
            .bind(&record.citizen_cns)
            .bind(record.scheduled_at_epoch_ms)
            .bind(&record.professional)
            .bind(record.status.as_str())
            .bind(&record.notes)
            .execute(&self.pool),
        )
        .await
        .map_err(|_| StoreError::Timeout)??;
        Ok(())
    }

    pub async fn issue_grant(&self, grant: NewGrant<'_>) -> Result<IssueOutcome, StoreError> {
        let item_table = match grant.item_type {
            ItemType::Regulation => "lista_regulations",
            ItemType::Schedule => "lista_schedules",
        };
        let visibility_sql = format!(
            "SELECT count(*) AS visible FROM {item_table} \
             WHERE id = ANY($1) AND subscriber_id = $2 AND deleted_at IS NULL"
        );

        let payload_json = serde_json::json!({
            "item_type": grant.item_type.as_str(),
            "action_kind": grant.action_kind.as_str(),
            "item_count": grant.item_ids.len(),
            "expires_at_ms": grant.expires_at_epoch_ms,
            "access_limit": grant.access_limit,
            "subscriber_id": grant.subscriber_id,
        });
        let payload_hash = canonical::hash_canonical_json(&payload_json);
        let event_id = Ulid::new().to_string();

        let outcome = tokio::time::timeout(self.write_timeout, async {
            let mut tx = self.pool.begin().await?;

            let row = sqlx::query(&visibility_sql)
                .bind(grant.item_ids)
                .bind(grant.subscriber_id)
                .fetch_one(&mut *tx)
                .await?;
            let visible: i64 = row.try_get("visible")?;
            if visible != grant.item_ids.len() as i64 {
                return Ok(IssueOutcome::ItemsNotVisible);
            }

            sqlx::query(
                "INSERT INTO lista_batch_grants \
                 (grant_hash, subscriber_id, item_type, action_kind, expires_at_ms, access_limit, created_by, created_at_ms) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
            )
            .bind(grant.grant_hash)
            .bind(grant.subscriber_id)
            .bind(grant.item_type.as_str())
            .bind(grant.action_kind.as_str())
            .bind(grant.expires_at_epoch_ms)
            .bind(grant.access_limit as i32)
            .bind(grant.created_by)
            .bind(grant.created_at_epoch_ms)
            .execute(&mut *tx)
            .await?;

            for (ordinal, item_id) in grant.item_ids.iter().enumerate() {
                sqlx::query(
                    "INSERT INTO lista_batch_grant_items (grant_hash, ordinal, item_id) VALUES ($1, $2, $3)",
                )
                .bind(grant.grant_hash)
                .bind(ordinal as i32)
                .bind(item_id)
                .execute(&mut *tx)
                .await?;
            }

            sqlx::query(APPEND_AUDIT_SQL)
                .bind(&event_id)
                .bind(grant.grant_hash)
                .bind("GRANT_ISSUED")
                .bind(grant.created_by)
                .bind(Option::<i64>::None)
                .bind(&payload_json)
                .bind(&payload_hash)
                .execute(&mut *tx)
                .await?;

            tx.commit().await?;
            Ok::<IssueOutcome, sqlx::Error>(IssueOutcome::Issued)
        })
        .await
        .map_err(|_| StoreError::Timeout)??;

        Ok(outcome)
    }

    pub async fn load_grant(&self, grant_hash: &str) -> Result<Option<GrantRecord>, StoreError> {
        let row = sqlx::query(
            "SELECT g.grant_hash, g.subscriber_id, s.display_name, g.item_type, g.action_kind, \
             g.expires_at_ms, g.access_limit, g.access_count, g.created_by, g.created_at_ms \
             FROM lista_batch_grants g \
             JOIN lista_subscribers s ON s.subscriber_id = g.subscriber_id \
             WHERE g.grant_hash = $1",
        )
        .bind(grant_hash)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let item_rows =
            sqlx::query("SELECT item_id FROM lista_batch_grant_items WHERE grant_hash = $1 ORDER BY ordinal")
                .bind(grant_hash)
                .fetch_all(&self.pool)
                .await?;
        let mut item_ids = Vec::with_capacity(item_rows.len());
        for item_row in &item_rows {
            item_ids.push(item_row.try_get("item_id")?);
        }

        let item_type_raw: String = row.try_get("item_type")?;
        let item_type = ItemType::parse(&item_type_raw)
            .ok_or(StoreError::Decode("grant row carries an unknown item_type"))?;
        let action_kind_raw: String = row.try_get("action_kind")?;
        let action_kind = BatchActionKind::parse(&action_kind_raw)
            .ok_or(StoreError::Decode("grant row carries an unknown action_kind"))?;
        let access_limit: i32 = row.try_get("access_limit")?;
        let access_count: i32 = row.try_get("access_count")?;

        Ok(Some(GrantRecord {
            grant_hash: row.try_get("grant_hash")?,
            subscriber_id: row.try_get("subscriber_id")?,
            subscriber_name: row.try_get("display_name")?,
            item_type,
            action_kind,
            item_ids,
            expires_at_epoch_ms: row.try_get("expires_at_ms")?,
            access_limit: access_limit as u32,
            access_count: access_count as u32,
            created_by: row.try_get("created_by")?,
            created_at_epoch_ms: row.try_get("created_at_ms")?,
        }))
    }

    pub async fn load_regulations(&self, ids: &[i64]) -> Result<Vec<RegulationRecord>, StoreError> {
        let rows = sqlx::query(
            "SELECT id, citizen_name, citizen_cpf, citizen_cns, care_list, status, notes \
             FROM lista_regulations WHERE id = ANY($1) AND deleted_at IS NULL",
        )
        .bind(ids)
        .fetch_all(&self.pool)
        .await?;

        let mut records = Vec::with_capacity(rows.len());
        for row in rows {
            let status_raw: String = row.try_get("status")?;
            let status = RegulationStatus::parse(&status_raw)
                .ok_or(StoreError::Decode("regulation row carries an unknown status"))?;
            records.push(RegulationRecord {
                id: row.try_get("id")?,
                citizen_name: row.try_get("citizen_name")?,
                citizen_cpf: row.try_get("citizen_cpf")?,
                citizen_cns: row.try_get("citizen_cns")?,
                care_list: row.try_get("care_list")?,
                status,
                notes: row.try_get("notes")?,
            });
        }
        Ok(records)
    }

    pub async fn load_schedules(&self, ids: &[i64]) -> Result<Vec<ScheduleRecord>, StoreError> {
        let rows = sqlx::query(
            "SELECT id, citizen_name, citizen_cpf, citizen_cns, scheduled_at_ms, professional, status, notes \
             FROM lista_schedules WHERE id = ANY($1) AND deleted_at IS NULL",
        )
        .bind(ids)
        .fetch_all(&self.pool)
        .await?;

        let mut records = Vec::with_capacity(rows.len());
        for row in rows {
            let status_raw: String = row.try_get("status")?;
            let status = ScheduleStatus::parse(&status_raw)
                .ok_or(StoreError::Decode("schedule row carries an unknown status"))?;
            records.push(ScheduleRecord {
                id: row.try_get("id")?,
                citizen_name: row.try_get("citizen_name")?,
                citizen_cpf: row.try_get("citizen_cpf")?,
                citizen_cns: row.try_get("citizen_cns")?,
                scheduled_at_epoch_ms: row.try_get("scheduled_at_ms")?,
                professional: row.try_get("professional")?,
                status,
                notes: row.try_get("notes")?,
            });
        }
        Ok(records)
    }

    pub async fn apply_regulation_patch(
        &self,
        patch: RegulationPatch<'_>,
    ) -> Result<MutationOutcome, StoreError> {
        let event_id = Ulid::new().to_string();
        let payload_json = serde_json::json!({
            "item_id": patch.item_id,
            "status": patch.status.map(|s| s.as_str()),
            "notes_changed": patch.notes.is_some(),
        });
        let payload_hash = canonical::hash_canonical_json(&payload_json);

        let outcome = tokio::time::timeout(self.write_timeout, async {
            let mut tx = self.pool.begin().await?;

            let member = sqlx::query(MEMBERSHIP_SQL)
                .bind(patch.grant_hash)
                .bind(patch.item_id)
                .fetch_optional(&mut *tx)
                .await?;
            if member.is_none() {
                return Ok(MutationOutcome::ItemNotInBatch);
            }

            let updated = sqlx::query(
                "UPDATE lista_regulations SET status = COALESCE($1, status), notes = COALESCE($2, notes) \
                 WHERE id = $3 AND deleted_at IS NULL",
            )
            .bind(patch.status.map(|s| s.as_str()))
            .bind(patch.notes)
            .bind(patch.item_id)
            .execute(&mut *tx)
            .await?;
            if updated.rows_affected() == 0 {
                return Ok(MutationOutcome::ItemNotInBatch);
            }

            // Zero rows here means the grant is expired or out of slots; the
            // record update above rolls back with the transaction.
            let consumed = sqlx::query(CONSUME_SLOT_SQL)
                .bind(patch.grant_hash)
                .bind(patch.now_epoch_ms)
                .execute(&mut *tx)
                .await?;
            if consumed.rows_affected() == 0 {
                return Ok(MutationOutcome::GateClosed);
            }

            sqlx::query(APPEND_AUDIT_SQL)
                .bind(&event_id)
                .bind(patch.grant_hash)
                .bind("ITEM_STATUS_UPDATED")
                .bind(patch.actor)
                .bind(patch.item_id)
                .bind(&payload_json)
                .bind(&payload_hash)
                .execute(&mut *tx)
                .await?;

            tx.commit().await?;
            Ok::<MutationOutcome, sqlx::Error>(MutationOutcome::Applied {
                audit_event_id: event_id,
            })
        })
        .await
        .map_err(|_| StoreError::Timeout)??;

        Ok(outcome)
    }

    pub async fn apply_schedule_patch(
        &self,
        patch: SchedulePatch<'_>,
    ) -> Result<MutationOutcome, StoreError> {
        let event_id = Ulid::new().to_string();
        let event_type = if patch.scheduled_at_epoch_ms.is_some() || patch.professional.is_some() {
            "ITEM_SCHEDULED"
        } else {
            "ITEM_STATUS_UPDATED"
        };
        let payload_json = serde_json::json!({
            "item_id": patch.item_id,
            "status": patch.status.map(|s| s.as_str()),
            "scheduled_at_ms": patch.scheduled_at_epoch_ms,
            "professional": patch.professional,
            "notes_changed": patch.notes.is_some(),
        });
        let payload_hash = canonical::hash_canonical_json(&payload_json);

        let outcome = tokio::time::timeout(self.write_timeout, async {
            let mut tx = self.pool.begin().await?;

            let member = sqlx::query(MEMBERSHIP_SQL)
                .bind(patch.grant_hash)
                .bind(patch.item_id)
                .fetch_optional(&mut *tx)
                .await?;
            if member.is_none() {
                return Ok(MutationOutcome::ItemNotInBatch);
            }

            let updated = sqlx::query(
                "UPDATE lista_schedules SET status = COALESCE($1, status), notes = COALESCE($2, notes), \
                 scheduled_at_ms = COALESCE($3, scheduled_at_ms), professional = COALESCE($4, professional) \
                 WHERE id = $5 AND deleted_at IS NULL",
            )
            .bind(patch.status.map(|s| s.as_str()))
            .bind(patch.notes)
            .bind(patch.scheduled_at_epoch_ms)
            .bind(patch.professional)
            .bind(patch.item_id)
            .execute(&mut *tx)
            .await?;
            if updated.rows_affected() == 0 {
                return Ok(MutationOutcome::ItemNotInBatch);
            }

            let consumed = sqlx::query(CONSUME_SLOT_SQL)
                .bind(patch.grant_hash)
                .bind(patch.now_epoch_ms)
                .execute(&mut *tx)
                .await?;
            if consumed.rows_affected() == 0 {
                return Ok(MutationOutcome::GateClosed);
            }

            sqlx::query(APPEND_AUDIT_SQL)
                .bind(&event_id)
                .bind(patch.grant_hash)
                .bind(event_type)
                .bind(patch.actor)
                .bind(patch.item_id)
                .bind(&payload_json)
                .bind(&payload_hash)
                .execute(&mut *tx)
                .await?;

            tx.commit().await?;
            Ok::<MutationOutcome, sqlx::Error>(MutationOutcome::Applied {
                audit_event_id: event_id,
            })
        })
        .await
        .map_err(|_| StoreError::Timeout)??;

        Ok(outcome)
    }

    pub async fn store_attachment(
        &self,
        attachment: NewAttachment<'_>,
    ) -> Result<UploadOutcome, StoreError> {
        let event_id = Ulid::new().to_string();
        let content_sha256 = canonical::sha256_hex(attachment.body);

        let outcome = tokio::time::timeout(self.write_timeout, async {
            let mut tx = self.pool.begin().await?;

            let member = sqlx::query(MEMBERSHIP_SQL)
                .bind(attachment.grant_hash)
                .bind(attachment.item_id)
                .fetch_optional(&mut *tx)
                .await?;
            if member.is_none() {
                return Ok(UploadOutcome::ItemNotInBatch);
            }

            let target = sqlx::query(
                "SELECT 1 AS present FROM lista_regulations WHERE id = $1 AND deleted_at IS NULL",
            )
            .bind(attachment.item_id)
            .fetch_optional(&mut *tx)
            .await?;
            if target.is_none() {
                return Ok(UploadOutcome::ItemNotInBatch);
            }

            let row = sqlx::query(
                "INSERT INTO lista_attachments \
                 (regulation_id, grant_hash, document_type, file_name, content_type, body, content_sha256, notes, uploaded_by, created_at_ms) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10) \
                 RETURNING attachment_id",
            )
            .bind(attachment.item_id)
            .bind(attachment.grant_hash)
            .bind(attachment.document_type)
            .bind(attachment.file_name)
            .bind(attachment.content_type)
            .bind(attachment.body)
            .bind(&content_sha256)
            .bind(attachment.notes)
            .bind(attachment.actor)
            .bind(attachment.now_epoch_ms)
            .fetch_one(&mut *tx)
            .await?;
            let attachment_id: i64 = row.try_get("attachment_id")?;

            let consumed = sqlx::query(CONSUME_SLOT_SQL)
                .bind(attachment.grant_hash)
                .bind(attachment.now_epoch_ms)
                .execute(&mut *tx)
                .await?;
            if consumed.rows_affected() == 0 {
                return Ok(UploadOutcome::GateClosed);
            }

            let payload_json = serde_json::json!({
                "item_id": attachment.item_id,
                "attachment_id": attachment_id,
                "document_type": attachment.document_type,
                "content_sha256": content_sha256,
                "size_bytes": attachment.body.len(),
            });
            let payload_hash = canonical::hash_canonical_json(&payload_json);

            sqlx::query(APPEND_AUDIT_SQL)
                .bind(&event_id)
                .bind(attachment.grant_hash)
                .bind("DOCUMENT_UPLOADED")
                .bind(attachment.actor)
                .bind(attachment.item_id)
                .bind(&payload_json)
                .bind(&payload_hash)
                .execute(&mut *tx)
                .await?;

            tx.commit().await?;
            Ok::<UploadOutcome, sqlx::Error>(UploadOutcome::Stored {
                attachment_id,
                audit_event_id: event_id,
            })
        })
        .await
        .map_err(|_| StoreError::Timeout)??;

        Ok(outcome)
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

pub async fn migrate(pool: &sqlx::PgPool) -> Result<(), sqlx::Error> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

pub async fn migrate_url(db_url: &str) -> Result<(), sqlx::Error> {
    let pool = sqlx::PgPool::connect(db_url).await?;
    migrate(&pool).await?;
    pool.close().await;
    Ok(())
}
