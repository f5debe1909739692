use std::collections::HashMap;

use lista_contracts::mask::{mask_cns, mask_cpf};
use lista_contracts::{
    BatchAction, BatchActionKind, BatchItem, CitizenSummary, ItemType, RegulationRecord,
    ScheduleRecord, UpdateItemRequest,
};

// Total mapping from the issued kind to the mutations the gateway will
// accept. Supplier views are read-only, so their set is empty.
pub fn allowed_actions(kind: BatchActionKind) -> &'static [BatchAction] {
    match kind {
        BatchActionKind::StatusUpdate => &[BatchAction::Status],
        BatchActionKind::DocumentUpload => &[BatchAction::UploadRegulation],
        BatchActionKind::SupplierView => &[],
        BatchActionKind::ScheduleAndStatus => &[BatchAction::Status, BatchAction::Schedule],
    }
}

pub fn action_allowed(kind: BatchActionKind, action: BatchAction) -> bool {
    allowed_actions(kind).contains(&action)
}

pub fn kind_accepts_item_type(kind: BatchActionKind, item_type: ItemType) -> bool {
    match kind {
        BatchActionKind::StatusUpdate | BatchActionKind::SupplierView => true,
        BatchActionKind::DocumentUpload => item_type == ItemType::Regulation,
        BatchActionKind::ScheduleAndStatus => item_type == ItemType::Schedule,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GrantGate {
    pub expires_at_epoch_ms: i64,
    pub access_count: u32,
    pub access_limit: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessDenial {
    NotFound,
    Expired,
    Exhausted,
}

impl AccessDenial {
    pub fn as_str(self) -> &'static str {
        match self {
            AccessDenial::NotFound => "not_found",
            AccessDenial::Expired => "expired",
            AccessDenial::Exhausted => "exhausted",
        }
    }
}

// Expiry wins over exhaustion when both hold: the grant was void before
// the counter could matter.
pub fn check_access(gate: &GrantGate, now_epoch_ms: i64) -> Result<(), AccessDenial> {
    if now_epoch_ms >= gate.expires_at_epoch_ms {
        return Err(AccessDenial::Expired);
    }
    if gate.access_count >= gate.access_limit {
        return Err(AccessDenial::Exhausted);
    }
    Ok(())
}

pub fn implied_actions(update: &UpdateItemRequest) -> Vec<BatchAction> {
    let mut actions = Vec::new();
    if update.status.is_some() {
        actions.push(BatchAction::Status);
    }
    if update.scheduled_date.is_some() || update.professional.is_some() {
        actions.push(BatchAction::Schedule);
    }
    actions
}

pub fn project_regulation(record: &RegulationRecord, kind: BatchActionKind) -> BatchItem {
    BatchItem {
        id: record.id,
        citizen: citizen_summary(
            &record.citizen_name,
            record.citizen_cpf.as_deref(),
            record.citizen_cns.as_deref(),
            kind,
        ),
        status: record.status.as_str().to_string(),
        care_list: Some(record.care_list.clone()),
        scheduled_date: None,
        professional: None,
        notes: record.notes.clone(),
    }
}

pub fn project_schedule(record: &ScheduleRecord, kind: BatchActionKind) -> BatchItem {
    BatchItem {
        id: record.id,
        citizen: citizen_summary(
            &record.citizen_name,
            record.citizen_cpf.as_deref(),
            record.citizen_cns.as_deref(),
            kind,
        ),
        status: record.status.as_str().to_string(),
        care_list: None,
        scheduled_date: record.scheduled_at_epoch_ms,
        professional: record.professional.clone(),
        notes: record.notes.clone(),
    }
}

// Projection preserves issuance order: the issuing staff member chose
// it (route order for field visits). Records missing from `records`
// were soft-deleted after issuance and are dropped silently.
pub fn project_regulations(
    item_ids: &[i64],
    records: &[RegulationRecord],
    kind: BatchActionKind,
) -> Vec<BatchItem> {
    let by_id: HashMap<i64, &RegulationRecord> =
        records.iter().map(|record| (record.id, record)).collect();

    item_ids
        .iter()
        .filter_map(|id| by_id.get(id))
        .map(|record| project_regulation(record, kind))
        .collect()
}

pub fn project_schedules(
    item_ids: &[i64],
    records: &[ScheduleRecord],
    kind: BatchActionKind,
) -> Vec<BatchItem> {
    let by_id: HashMap<i64, &ScheduleRecord> =
        records.iter().map(|record| (record.id, record)).collect();

    item_ids
        .iter()
        .filter_map(|id| by_id.get(id))
        .map(|record| project_schedule(record, kind))
        .collect()
}

fn citizen_summary(
    name: &str,
    cpf: Option<&str>,
    cns: Option<&str>,
    kind: BatchActionKind,
) -> CitizenSummary {
    if kind == BatchActionKind::SupplierView {
        CitizenSummary {
            name: name.to_string(),
            cpf: cpf.map(mask_cpf),
            cns: cns.map(mask_cns),
        }
    } else {
        CitizenSummary {
            name: name.to_string(),
            cpf: cpf.map(|v| v.to_string()),
            cns: cns.map(|v| v.to_string()),
        }
    }
}
