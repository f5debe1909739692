use serde::{Deserialize, Serialize};

pub mod canonical;
pub mod mask;
pub mod token;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ItemType {
    Regulation,
    Schedule,
}

impl ItemType {
    pub fn as_str(self) -> &'static str {
        match self {
            ItemType::Regulation => "REGULATION",
            ItemType::Schedule => "SCHEDULE",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "REGULATION" => Some(ItemType::Regulation),
            "SCHEDULE" => Some(ItemType::Schedule),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BatchActionKind {
    StatusUpdate,
    DocumentUpload,
    SupplierView,
    ScheduleAndStatus,
}

impl BatchActionKind {
    pub fn as_str(self) -> &'static str {
        match self {
            BatchActionKind::StatusUpdate => "STATUS_UPDATE",
            BatchActionKind::DocumentUpload => "DOCUMENT_UPLOAD",
            BatchActionKind::SupplierView => "SUPPLIER_VIEW",
            BatchActionKind::ScheduleAndStatus => "SCHEDULE_AND_STATUS",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "STATUS_UPDATE" => Some(BatchActionKind::StatusUpdate),
            "DOCUMENT_UPLOAD" => Some(BatchActionKind::DocumentUpload),
            "SUPPLIER_VIEW" => Some(BatchActionKind::SupplierView),
            "SCHEDULE_AND_STATUS" => Some(BatchActionKind::ScheduleAndStatus),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BatchAction {
    Status,
    UploadRegulation,
    Schedule,
}

impl BatchAction {
    pub fn as_str(self) -> &'static str {
        match self {
            BatchAction::Status => "STATUS",
            BatchAction::UploadRegulation => "UPLOAD_REGULATION",
            BatchAction::Schedule => "SCHEDULE",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RegulationStatus {
    Pending,
    InReview,
    Approved,
    Denied,
    Completed,
    Canceled,
}

impl RegulationStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RegulationStatus::Pending => "PENDING",
            RegulationStatus::InReview => "IN_REVIEW",
            RegulationStatus::Approved => "APPROVED",
            RegulationStatus::Denied => "DENIED",
            RegulationStatus::Completed => "COMPLETED",
            RegulationStatus::Canceled => "CANCELED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(RegulationStatus::Pending),
            "IN_REVIEW" => Some(RegulationStatus::InReview),
            "APPROVED" => Some(RegulationStatus::Approved),
            "DENIED" => Some(RegulationStatus::Denied),
            "COMPLETED" => Some(RegulationStatus::Completed),
            "CANCELED" => Some(RegulationStatus::Canceled),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ScheduleStatus {
    Scheduled,
    Confirmed,
    Completed,
    Missed,
    Canceled,
}

impl ScheduleStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ScheduleStatus::Scheduled => "SCHEDULED",
            ScheduleStatus::Confirmed => "CONFIRMED",
            ScheduleStatus::Completed => "COMPLETED",
            ScheduleStatus::Missed => "MISSED",
            ScheduleStatus::Canceled => "CANCELED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "SCHEDULED" => Some(ScheduleStatus::Scheduled),
            "CONFIRMED" => Some(ScheduleStatus::Confirmed),
            "COMPLETED" => Some(ScheduleStatus::Completed),
            "MISSED" => Some(ScheduleStatus::Missed),
            "CANCELED" => Some(ScheduleStatus::Canceled),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RegulationRecord {
    pub id: i64,
    pub citizen_name: String,
    pub citizen_cpf: Option<String>,
    pub citizen_cns: Option<String>,
    pub care_list: String,
    pub status: RegulationStatus,
    pub notes: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScheduleRecord {
    pub id: i64,
    pub citizen_name: String,
    pub citizen_cpf: Option<String>,
    pub citizen_cns: Option<String>,
    pub scheduled_at_epoch_ms: Option<i64>,
    pub professional: Option<String>,
    pub status: ScheduleStatus,
    pub notes: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct GenerateListRequest {
    pub ids: Vec<i64>,
    #[serde(rename = "type")]
    pub item_type: ItemType,
    pub batch_type: BatchActionKind,
    // Sent by the legacy issuing UI; the server derives the set itself.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allowed_actions: Option<Vec<BatchAction>>,
    pub expiry_hours: u32,
    pub access_limit: u32,
}

impl GenerateListRequest {
    pub const EXPIRY_HOURS_CHOICES: [u32; 5] = [1, 2, 4, 8, 12];
    pub const ACCESS_LIMIT_MIN: u32 = 1;
    pub const ACCESS_LIMIT_MAX: u32 = 5;
    pub const MAX_ITEMS_HARD_LIMIT: usize = 200;

    pub fn validate(&self) -> Result<(), &'static str> {
        if self.ids.is_empty() {
            return Err("ids must be non-empty");
        }
        if self.ids.len() > Self::MAX_ITEMS_HARD_LIMIT {
            return Err("ids exceeds the per-batch hard limit");
        }
        if self.ids.iter().any(|id| *id <= 0) {
            return Err("ids must be positive record references");
        }
        let mut seen = self.ids.clone();
        seen.sort_unstable();
        seen.dedup();
        if seen.len() != self.ids.len() {
            return Err("ids must not contain duplicates");
        }
        if !Self::EXPIRY_HOURS_CHOICES.contains(&self.expiry_hours) {
            return Err("expiryHours must be one of 1, 2, 4, 8, 12");
        }
        if !(Self::ACCESS_LIMIT_MIN..=Self::ACCESS_LIMIT_MAX).contains(&self.access_limit) {
            return Err("accessLimit out of range");
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchSummary {
    pub uuid: String,
    #[serde(rename = "type")]
    pub batch_type: BatchActionKind,
    pub allowed_actions: Vec<BatchAction>,
    pub expires_at: i64,
    pub access_limit: u32,
    pub access_count: u32,
    pub subscriber_name: String,
    pub created_at: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateListResponse {
    pub hash: String,
    pub link: String,
    pub batch: BatchSummary,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CitizenSummary {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpf: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cns: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchItem {
    pub id: i64,
    pub citizen: CitizenSummary,
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub care_list: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheduled_date: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub professional: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListResponse {
    pub batch: BatchSummary,
    pub item_type: ItemType,
    pub items: Vec<BatchItem>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct UpdateItemRequest {
    pub item_id: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheduled_date: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub professional: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadResponse {
    pub ok: bool,
    pub attachment_id: i64,
    pub item_id: i64,
    pub document_type: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
    #[serde(default)]
    pub retryable: bool,
}

pub fn unix_epoch_ms_now() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};

    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_request() -> GenerateListRequest {
        GenerateListRequest {
            ids: vec![5, 9, 3],
            item_type: ItemType::Regulation,
            batch_type: BatchActionKind::StatusUpdate,
            allowed_actions: None,
            expiry_hours: 4,
            access_limit: 3,
        }
    }

    #[test]
    fn generate_request_accepts_valid_input() {
        valid_request().validate().expect("request should validate");
    }

    #[test]
    fn generate_request_rejects_empty_ids() {
        let mut req = valid_request();
        req.ids = Vec::new();
        assert_eq!(req.validate().unwrap_err(), "ids must be non-empty");
    }

    #[test]
    fn generate_request_rejects_duplicate_ids() {
        let mut req = valid_request();
        req.ids = vec![5, 9, 5];
        assert_eq!(req.validate().unwrap_err(), "ids must not contain duplicates");
    }

    #[test]
    fn generate_request_rejects_nonpositive_ids() {
        let mut req = valid_request();
        req.ids = vec![5, 0];
        assert_eq!(
            req.validate().unwrap_err(),
            "ids must be positive record references"
        );
    }

    #[test]
    fn generate_request_rejects_unlisted_expiry_hours() {
        let mut req = valid_request();
        req.expiry_hours = 3;
        assert_eq!(
            req.validate().unwrap_err(),
            "expiryHours must be one of 1, 2, 4, 8, 12"
        );
    }

    #[test]
    fn generate_request_rejects_access_limit_out_of_range() {
        let mut zero = valid_request();
        zero.access_limit = 0;
        assert_eq!(zero.validate().unwrap_err(), "accessLimit out of range");

        let mut high = valid_request();
        high.access_limit = GenerateListRequest::ACCESS_LIMIT_MAX + 1;
        assert_eq!(high.validate().unwrap_err(), "accessLimit out of range");
    }

    #[test]
    fn generate_request_rejects_oversized_batches() {
        let mut req = valid_request();
        req.ids = (1..=(GenerateListRequest::MAX_ITEMS_HARD_LIMIT as i64 + 1)).collect();
        assert_eq!(
            req.validate().unwrap_err(),
            "ids exceeds the per-batch hard limit"
        );
    }

    #[test]
    fn generate_request_parses_legacy_wire_shape() {
        let req: GenerateListRequest = serde_json::from_str(
            r#"{
                "ids": [12, 7],
                "type": "SCHEDULE",
                "batchType": "SCHEDULE_AND_STATUS",
                "allowedActions": ["STATUS", "SCHEDULE"],
                "expiryHours": 2,
                "accessLimit": 1
            }"#,
        )
        .expect("legacy body should parse");

        assert_eq!(req.item_type, ItemType::Schedule);
        assert_eq!(req.batch_type, BatchActionKind::ScheduleAndStatus);
        assert_eq!(
            req.allowed_actions,
            Some(vec![BatchAction::Status, BatchAction::Schedule])
        );
    }

    #[test]
    fn generate_request_rejects_unknown_fields() {
        let err = serde_json::from_str::<GenerateListRequest>(
            r#"{"ids":[1],"type":"REGULATION","batchType":"STATUS_UPDATE","expiryHours":1,"accessLimit":1,"extra":true}"#,
        )
        .expect_err("unknown field must be rejected");
        assert!(err.to_string().contains("extra"));
    }

    #[test]
    fn batch_summary_serializes_legacy_field_names() {
        let summary = BatchSummary {
            uuid: "a".repeat(64),
            batch_type: BatchActionKind::SupplierView,
            allowed_actions: Vec::new(),
            expires_at: 1_700_000_000_000,
            access_limit: 2,
            access_count: 0,
            subscriber_name: "Municipio Demo".to_string(),
            created_at: 1_699_996_400_000,
        };

        let value = serde_json::to_value(&summary).expect("summary should serialize");
        let obj = value.as_object().expect("summary must be an object");
        for key in [
            "uuid",
            "type",
            "allowedActions",
            "expiresAt",
            "accessLimit",
            "accessCount",
            "subscriberName",
            "createdAt",
        ] {
            assert!(obj.contains_key(key), "missing wire key {}", key);
        }
        assert_eq!(value["type"], "SUPPLIER_VIEW");
    }

    #[test]
    fn update_request_allows_partial_bodies() {
        let req: UpdateItemRequest =
            serde_json::from_str(r#"{"itemId": 101, "status": "APPROVED"}"#)
                .expect("partial body should parse");
        assert_eq!(req.item_id, 101);
        assert_eq!(req.status.as_deref(), Some("APPROVED"));
        assert!(req.scheduled_date.is_none());
        assert!(req.professional.is_none());
    }

    #[test]
    fn status_parse_is_exact_match_only() {
        assert_eq!(
            RegulationStatus::parse("APPROVED"),
            Some(RegulationStatus::Approved)
        );
        assert_eq!(RegulationStatus::parse("approved"), None);
        assert_eq!(
            ScheduleStatus::parse("CONFIRMED"),
            Some(ScheduleStatus::Confirmed)
        );
        assert_eq!(ScheduleStatus::parse("SCHEDULE"), None);
    }
}
