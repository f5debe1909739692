use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use axum::extract::rejection::JsonRejection;
use axum::extract::{DefaultBodyLimit, Multipart, Path, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use lista_auth::{OidcAuthenticator, Principal};
use lista_contracts::token;
use lista_contracts::{
    BatchAction, BatchItem, BatchSummary, ErrorResponse, GenerateListRequest, GenerateListResponse,
    ItemType, ListResponse, RegulationStatus, ScheduleStatus, UpdateItemRequest, UploadResponse,
    unix_epoch_ms_now,
};
use lista_policy::{AccessDenial, GrantGate};
use lista_store::{
    GrantRecord, GrantStore, IssueOutcome, MutationOutcome, NewAttachment, NewGrant,
    RegulationPatch, SchedulePatch, StoreError, UploadOutcome,
};
use serde::Serialize;
use tracing::Instrument;
use ulid::Ulid;

use crate::config::{AuthMode, GatewayConfig, StartupError};
use crate::rate_limit::RateLimiter;

// Audit actor label for anonymous capability-link mutations.
const BATCH_LINK_ACTOR: &str = "batch-link";

const MAX_DOCUMENT_TYPE_CHARS: usize = 64;

#[derive(Clone)]
pub struct AppState {
    pub config: GatewayConfig,
    oidc: Option<OidcAuthenticator>,
    store: GrantStore,
    rate_limiter: RateLimiter,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

pub async fn router(config: GatewayConfig) -> Result<Router, StartupError> {
    let oidc = match config.auth_mode {
        AuthMode::Oidc => {
            let Some(oidc_config) = config.oidc.clone() else {
                return Err(StartupError {
                    code: "ERR_INVALID_CONFIG",
                    message: "oidc auth mode requires oidc settings".to_string(),
                });
            };
            let authenticator =
                OidcAuthenticator::new(oidc_config)
                    .await
                    .map_err(|err| StartupError {
                        code: err.code,
                        message: err.message,
                    })?;
            Some(authenticator)
        }
        AuthMode::Local => None,
    };

    let store = GrantStore::connect_and_migrate(
        &config.db_url,
        Duration::from_millis(config.db_write_timeout_ms),
    )
    .await
    .map_err(|err| StartupError {
        code: "ERR_STORE_UNAVAILABLE",
        message: format!("failed to prepare postgres store: {}", err),
    })?;

    let rate_limiter = RateLimiter::new(
        Duration::from_secs(config.rate_limit_window_secs.max(1)),
        16_384,
    );

    // Room for multipart boundaries and part headers on top of the file
    // itself.
    let upload_body_cap = config.max_upload_bytes.saturating_add(64 * 1024);

    let state = AppState {
        config,
        oidc,
        store,
        rate_limiter,
    };

    Ok(Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics))
        .route("/api/lists/generate", post(generate_list))
        .route("/api/lists/{hash}", get(fetch_list).patch(update_item))
        .route(
            "/api/lists/{hash}/upload",
            post(upload_document).layer(DefaultBodyLimit::max(upload_body_cap)),
        )
        .with_state(state))
}

#[derive(Debug, Serialize)]
struct HealthzResponse {
    status: &'static str,
}

async fn healthz() -> Json<HealthzResponse> {
    Json(HealthzResponse { status: "ok" })
}

#[derive(Debug, Serialize)]
struct ReadyzResponse {
    status: &'static str,
    checks: BTreeMap<&'static str, bool>,
}

async fn readyz(State(state): State<AppState>) -> axum::response::Response {
    let database = state.store.ping().await.is_ok();
    let checks = BTreeMap::from([("database", database)]);

    if database {
        (
            StatusCode::OK,
            Json(ReadyzResponse {
                status: "ready",
                checks,
            }),
        )
            .into_response()
    } else {
        json_error(
            StatusCode::SERVICE_UNAVAILABLE,
            "ERR_UNAVAILABLE",
            "database is unreachable".to_string(),
            true,
        )
        .into_response()
    }
}

async fn metrics(State(state): State<AppState>, headers: HeaderMap) -> axum::response::Response {
    if state.config.metrics_require_auth
        && let Err(err) = extract_principal(&state, &headers).await
    {
        return err.into_response();
    }

    match crate::metrics::render() {
        Ok((body, content_type)) => {
            ([(header::CONTENT_TYPE, content_type)], body).into_response()
        }
        Err(_) => json_error(
            StatusCode::INTERNAL_SERVER_ERROR,
            "ERR_INTERNAL",
            "failed to render metrics".to_string(),
            false,
        )
        .into_response(),
    }
}

async fn generate_list(
    State(state): State<AppState>,
    headers: HeaderMap,
    req: Result<Json<GenerateListRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<GenerateListResponse>), ApiError> {
    let principal = extract_principal(&state, &headers).await?;

    if !state.rate_limiter.allow(
        &format!("generate:{}", principal.principal_id),
        state.config.rate_limit_generate_per_window,
    ) {
        crate::metrics::observe_rate_limited("generate");
        return Err(json_error(
            StatusCode::TOO_MANY_REQUESTS,
            "ERR_RATE_LIMITED",
            "issuance rate limit exceeded".to_string(),
            true,
        ));
    }

    let request_id = extract_request_id(&headers);
    let trace_id = extract_trace_id(&headers);

    let Json(req) = req.map_err(|_| {
        json_error(
            StatusCode::BAD_REQUEST,
            "ERR_INVALID_INPUT",
            "invalid JSON body".to_string(),
            false,
        )
    })?;

    req.validate()
        .map_err(|reason| json_error(StatusCode::BAD_REQUEST, "ERR_INVALID_INPUT", reason, false))?;

    if !lista_policy::kind_accepts_item_type(req.batch_type, req.item_type) {
        return Err(json_error(
            StatusCode::BAD_REQUEST,
            "ERR_INVALID_INPUT",
            "batchType does not accept the requested item type".to_string(),
            false,
        ));
    }

    let span = tracing::info_span!(
        "lists.generate",
        trace_id = %trace_id,
        request_id = %request_id,
        principal_id = %principal.principal_id,
        subscriber_id = %principal.subscriber_id,
        grant_hash = tracing::field::Empty,
        latency_ms = tracing::field::Empty,
        outcome = tracing::field::Empty,
    );
    let started = Instant::now();

    let result = async move {
        let subscriber_name = state
            .store
            .subscriber_name(&principal.subscriber_id)
            .await
            .map_err(store_unavailable)?
            .ok_or_else(|| {
                json_error(
                    StatusCode::UNAUTHORIZED,
                    "ERR_UNAUTHORIZED",
                    "subscriber is not registered".to_string(),
                    false,
                )
            })?;

        let hash = token::generate_grant_hash();
        tracing::Span::current().record("grant_hash", token::hash_prefix(&hash));

        let now = unix_epoch_ms_now();
        let expires_at = now + i64::from(req.expiry_hours) * 3_600_000;

        let outcome = state
            .store
            .issue_grant(NewGrant {
                grant_hash: &hash,
                subscriber_id: &principal.subscriber_id,
                item_type: req.item_type,
                action_kind: req.batch_type,
                item_ids: &req.ids,
                expires_at_epoch_ms: expires_at,
                access_limit: req.access_limit,
                created_by: &principal.principal_id,
                created_at_epoch_ms: now,
            })
            .await
            .map_err(store_unavailable)?;

        if outcome == IssueOutcome::ItemsNotVisible {
            return Err(json_error(
                StatusCode::UNAUTHORIZED,
                "ERR_UNAUTHORIZED",
                "one or more records are not available to this subscriber".to_string(),
                false,
            ));
        }

        crate::metrics::observe_grant_issued(req.item_type.as_str(), req.batch_type.as_str());

        tracing::info!(
            trace_id = %trace_id,
            request_id = %request_id,
            grant_hash = %token::hash_prefix(&hash),
            item_count = req.ids.len(),
            "lists.generate issued"
        );

        let link = format!("{}/list/{}", state.config.public_base_url, hash);
        let batch = BatchSummary {
            uuid: hash.clone(),
            batch_type: req.batch_type,
            allowed_actions: lista_policy::allowed_actions(req.batch_type).to_vec(),
            expires_at,
            access_limit: req.access_limit,
            access_count: 0,
            subscriber_name,
            created_at: now,
        };

        let latency_ms = started.elapsed().as_millis() as u64;
        tracing::Span::current().record("latency_ms", latency_ms);
        tracing::Span::current().record("outcome", "ok");

        Ok((
            StatusCode::CREATED,
            Json(GenerateListResponse { hash, link, batch }),
        ))
    }
    .instrument(span)
    .await;

    let status = match &result {
        Ok((status, _)) => *status,
        Err((status, _)) => *status,
    };
    crate::metrics::observe_http_request(
        "/api/lists/generate",
        "POST",
        status.as_u16(),
        started.elapsed(),
    );
    result
}

async fn fetch_list(
    State(state): State<AppState>,
    Path(hash): Path<String>,
    headers: HeaderMap,
) -> Result<Json<ListResponse>, ApiError> {
    if !token::is_grant_hash(&hash) {
        return Err(denial_response(AccessDenial::NotFound));
    }

    if !state.rate_limiter.allow(
        &format!("lookup:{}", hash),
        state.config.rate_limit_lookup_per_window,
    ) {
        crate::metrics::observe_rate_limited("lookup");
        return Err(json_error(
            StatusCode::TOO_MANY_REQUESTS,
            "ERR_RATE_LIMITED",
            "lookup rate limit exceeded".to_string(),
            true,
        ));
    }

    let request_id = extract_request_id(&headers);
    let trace_id = extract_trace_id(&headers);

    let span = tracing::info_span!(
        "lists.fetch",
        trace_id = %trace_id,
        request_id = %request_id,
        grant_hash = %token::hash_prefix(&hash),
        latency_ms = tracing::field::Empty,
        outcome = tracing::field::Empty,
    );
    let started = Instant::now();

    let result = async move {
        let grant = load_open_grant(&state, &hash).await?;
        let items = load_items(&state, &grant).await?;

        let latency_ms = started.elapsed().as_millis() as u64;
        tracing::Span::current().record("latency_ms", latency_ms);
        tracing::Span::current().record("outcome", "ok");

        Ok(Json(ListResponse {
            batch: batch_summary(&grant),
            item_type: grant.item_type,
            items,
        }))
    }
    .instrument(span)
    .await;

    let status = match &result {
        Ok(_) => StatusCode::OK,
        Err((status, _)) => *status,
    };
    crate::metrics::observe_http_request(
        "/api/lists/{hash}",
        "GET",
        status.as_u16(),
        started.elapsed(),
    );
    result
}

async fn update_item(
    State(state): State<AppState>,
    Path(hash): Path<String>,
    headers: HeaderMap,
    req: Result<Json<UpdateItemRequest>, JsonRejection>,
) -> Result<Json<BatchItem>, ApiError> {
    if !token::is_grant_hash(&hash) {
        return Err(denial_response(AccessDenial::NotFound));
    }

    if !state.rate_limiter.allow(
        &format!("mutate:{}", hash),
        state.config.rate_limit_lookup_per_window,
    ) {
        crate::metrics::observe_rate_limited("mutate");
        return Err(json_error(
            StatusCode::TOO_MANY_REQUESTS,
            "ERR_RATE_LIMITED",
            "mutation rate limit exceeded".to_string(),
            true,
        ));
    }

    let request_id = extract_request_id(&headers);
    let trace_id = extract_trace_id(&headers);

    let Json(req) = req.map_err(|_| {
        json_error(
            StatusCode::BAD_REQUEST,
            "ERR_INVALID_INPUT",
            "invalid JSON body".to_string(),
            false,
        )
    })?;

    let span = tracing::info_span!(
        "lists.update",
        trace_id = %trace_id,
        request_id = %request_id,
        grant_hash = %token::hash_prefix(&hash),
        item_id = req.item_id,
        latency_ms = tracing::field::Empty,
        outcome = tracing::field::Empty,
    );
    let started = Instant::now();

    let result = async move {
        let grant = load_open_grant(&state, &hash).await?;

        if !grant.item_ids.contains(&req.item_id) {
            return Err(item_not_in_batch());
        }

        let implied = lista_policy::implied_actions(&req);
        if implied.is_empty() {
            return Err(json_error(
                StatusCode::BAD_REQUEST,
                "ERR_INVALID_INPUT",
                "update carries no status or schedule change".to_string(),
                false,
            ));
        }
        if implied
            .iter()
            .any(|action| !lista_policy::action_allowed(grant.action_kind, *action))
        {
            return Err(json_error(
                StatusCode::FORBIDDEN,
                "ERR_ACTION_NOT_ALLOWED",
                "link does not permit this action".to_string(),
                false,
            ));
        }

        let now = unix_epoch_ms_now();
        let outcome = match grant.item_type {
            ItemType::Regulation => {
                let status = parse_regulation_status(req.status.as_deref())?;
                state
                    .store
                    .apply_regulation_patch(RegulationPatch {
                        grant_hash: &hash,
                        item_id: req.item_id,
                        status,
                        notes: req.notes.as_deref(),
                        actor: BATCH_LINK_ACTOR,
                        now_epoch_ms: now,
                    })
                    .await
                    .map_err(store_unavailable)?
            }
            ItemType::Schedule => {
                let status = parse_schedule_status(req.status.as_deref())?;
                state
                    .store
                    .apply_schedule_patch(SchedulePatch {
                        grant_hash: &hash,
                        item_id: req.item_id,
                        status,
                        notes: req.notes.as_deref(),
                        scheduled_at_epoch_ms: req.scheduled_date,
                        professional: req.professional.as_deref(),
                        actor: BATCH_LINK_ACTOR,
                        now_epoch_ms: now,
                    })
                    .await
                    .map_err(store_unavailable)?
            }
        };

        let audit_event_id = match outcome {
            MutationOutcome::Applied { audit_event_id } => audit_event_id,
            MutationOutcome::ItemNotInBatch => return Err(item_not_in_batch()),
            MutationOutcome::GateClosed => return Err(gate_closed_denial(&state, &hash).await),
        };

        let action = if req.scheduled_date.is_some() || req.professional.is_some() {
            "schedule"
        } else {
            "status"
        };
        crate::metrics::observe_mutation(action);

        tracing::info!(
            trace_id = %trace_id,
            request_id = %request_id,
            grant_hash = %token::hash_prefix(&hash),
            item_id = req.item_id,
            audit_event_id = %audit_event_id,
            "lists.update applied"
        );

        let item = reload_item(&state, &grant, req.item_id).await?;

        let latency_ms = started.elapsed().as_millis() as u64;
        tracing::Span::current().record("latency_ms", latency_ms);
        tracing::Span::current().record("outcome", "ok");

        Ok(Json(item))
    }
    .instrument(span)
    .await;

    let status = match &result {
        Ok(_) => StatusCode::OK,
        Err((status, _)) => *status,
    };
    crate::metrics::observe_http_request(
        "/api/lists/{hash}",
        "PATCH",
        status.as_u16(),
        started.elapsed(),
    );
    result
}

async fn upload_document(
    State(state): State<AppState>,
    Path(hash): Path<String>,
    headers: HeaderMap,
    multipart: Multipart,
) -> Result<Json<UploadResponse>, ApiError> {
    if !token::is_grant_hash(&hash) {
        return Err(denial_response(AccessDenial::NotFound));
    }

    if !state.rate_limiter.allow(
        &format!("mutate:{}", hash),
        state.config.rate_limit_lookup_per_window,
    ) {
        crate::metrics::observe_rate_limited("mutate");
        return Err(json_error(
            StatusCode::TOO_MANY_REQUESTS,
            "ERR_RATE_LIMITED",
            "mutation rate limit exceeded".to_string(),
            true,
        ));
    }

    let request_id = extract_request_id(&headers);
    let trace_id = extract_trace_id(&headers);

    let span = tracing::info_span!(
        "lists.upload",
        trace_id = %trace_id,
        request_id = %request_id,
        grant_hash = %token::hash_prefix(&hash),
        item_id = tracing::field::Empty,
        latency_ms = tracing::field::Empty,
        outcome = tracing::field::Empty,
    );
    let started = Instant::now();

    let result = async move {
        let form = read_upload_form(multipart, state.config.max_upload_bytes).await?;
        tracing::Span::current().record("item_id", form.item_id);

        let grant = load_open_grant(&state, &hash).await?;

        if !grant.item_ids.contains(&form.item_id) {
            return Err(item_not_in_batch());
        }

        if !lista_policy::action_allowed(grant.action_kind, BatchAction::UploadRegulation) {
            return Err(json_error(
                StatusCode::FORBIDDEN,
                "ERR_ACTION_NOT_ALLOWED",
                "link does not permit document upload".to_string(),
                false,
            ));
        }

        let outcome = state
            .store
            .store_attachment(NewAttachment {
                grant_hash: &hash,
                item_id: form.item_id,
                document_type: &form.document_type,
                file_name: &form.file_name,
                content_type: &form.content_type,
                body: &form.bytes,
                notes: form.notes.as_deref(),
                actor: BATCH_LINK_ACTOR,
                now_epoch_ms: unix_epoch_ms_now(),
            })
            .await
            .map_err(upload_failed)?;

        let (attachment_id, audit_event_id) = match outcome {
            UploadOutcome::Stored {
                attachment_id,
                audit_event_id,
            } => (attachment_id, audit_event_id),
            UploadOutcome::ItemNotInBatch => return Err(item_not_in_batch()),
            UploadOutcome::GateClosed => return Err(gate_closed_denial(&state, &hash).await),
        };

        crate::metrics::observe_mutation("upload");

        tracing::info!(
            trace_id = %trace_id,
            request_id = %request_id,
            grant_hash = %token::hash_prefix(&hash),
            item_id = form.item_id,
            attachment_id,
            audit_event_id = %audit_event_id,
            size_bytes = form.bytes.len(),
            "lists.upload stored"
        );

        let latency_ms = started.elapsed().as_millis() as u64;
        tracing::Span::current().record("latency_ms", latency_ms);
        tracing::Span::current().record("outcome", "ok");

        Ok(Json(UploadResponse {
            ok: true,
            attachment_id,
            item_id: form.item_id,
            document_type: form.document_type,
        }))
    }
    .instrument(span)
    .await;

    let status = match &result {
        Ok(_) => StatusCode::OK,
        Err((status, _)) => *status,
    };
    crate::metrics::observe_http_request(
        "/api/lists/{hash}/upload",
        "POST",
        status.as_u16(),
        started.elapsed(),
    );
    result
}

async fn load_open_grant(state: &AppState, hash: &str) -> Result<GrantRecord, ApiError> {
    let Some(grant) = state
        .store
        .load_grant(hash)
        .await
        .map_err(store_unavailable)?
    else {
        return Err(denial_response(AccessDenial::NotFound));
    };

    let gate = GrantGate {
        expires_at_epoch_ms: grant.expires_at_epoch_ms,
        access_count: grant.access_count,
        access_limit: grant.access_limit,
    };
    if let Err(denial) = lista_policy::check_access(&gate, unix_epoch_ms_now()) {
        return Err(denial_response(denial));
    }

    Ok(grant)
}

fn batch_summary(grant: &GrantRecord) -> BatchSummary {
    BatchSummary {
        uuid: grant.grant_hash.clone(),
        batch_type: grant.action_kind,
        allowed_actions: lista_policy::allowed_actions(grant.action_kind).to_vec(),
        expires_at: grant.expires_at_epoch_ms,
        access_limit: grant.access_limit,
        access_count: grant.access_count,
        subscriber_name: grant.subscriber_name.clone(),
        created_at: grant.created_at_epoch_ms,
    }
}

async fn load_items(state: &AppState, grant: &GrantRecord) -> Result<Vec<BatchItem>, ApiError> {
    match grant.item_type {
        ItemType::Regulation => {
            let records = state
                .store
                .load_regulations(&grant.item_ids)
                .await
                .map_err(store_unavailable)?;
            Ok(lista_policy::project_regulations(
                &grant.item_ids,
                &records,
                grant.action_kind,
            ))
        }
        ItemType::Schedule => {
            let records = state
                .store
                .load_schedules(&grant.item_ids)
                .await
                .map_err(store_unavailable)?;
            Ok(lista_policy::project_schedules(
                &grant.item_ids,
                &records,
                grant.action_kind,
            ))
        }
    }
}

async fn reload_item(
    state: &AppState,
    grant: &GrantRecord,
    item_id: i64,
) -> Result<BatchItem, ApiError> {
    let ids = [item_id];
    let mut items = match grant.item_type {
        ItemType::Regulation => {
            let records = state
                .store
                .load_regulations(&ids)
                .await
                .map_err(store_unavailable)?;
            lista_policy::project_regulations(&ids, &records, grant.action_kind)
        }
        ItemType::Schedule => {
            let records = state
                .store
                .load_schedules(&ids)
                .await
                .map_err(store_unavailable)?;
            lista_policy::project_schedules(&ids, &records, grant.action_kind)
        }
    };

    items.pop().ok_or_else(|| {
        json_error(
            StatusCode::SERVICE_UNAVAILABLE,
            "ERR_UNAVAILABLE",
            "updated item could not be reloaded".to_string(),
            true,
        )
    })
}

// The conditional UPDATE does not say which bound closed the gate;
// re-read the grant and classify.
async fn gate_closed_denial(state: &AppState, hash: &str) -> ApiError {
    match state.store.load_grant(hash).await {
        Ok(Some(grant)) => {
            let gate = GrantGate {
                expires_at_epoch_ms: grant.expires_at_epoch_ms,
                access_count: grant.access_count,
                access_limit: grant.access_limit,
            };
            match lista_policy::check_access(&gate, unix_epoch_ms_now()) {
                Err(denial) => denial_response(denial),
                Ok(()) => denial_response(AccessDenial::Exhausted),
            }
        }
        Ok(None) => denial_response(AccessDenial::NotFound),
        Err(_) => denial_response(AccessDenial::Exhausted),
    }
}

fn denial_response(denial: AccessDenial) -> ApiError {
    crate::metrics::observe_grant_denial(denial.as_str());
    tracing::Span::current().record("outcome", denial.as_str());

    match denial {
        AccessDenial::NotFound => json_error(
            StatusCode::NOT_FOUND,
            "ERR_NOT_FOUND",
            "unknown list".to_string(),
            false,
        ),
        AccessDenial::Expired => json_error(
            StatusCode::GONE,
            "ERR_EXPIRED",
            "list link has expired".to_string(),
            false,
        ),
        AccessDenial::Exhausted => json_error(
            StatusCode::GONE,
            "ERR_EXHAUSTED",
            "list link has no remaining accesses".to_string(),
            false,
        ),
    }
}

fn item_not_in_batch() -> ApiError {
    tracing::Span::current().record("outcome", "item_not_in_batch");
    json_error(
        StatusCode::CONFLICT,
        "ERR_ITEM_NOT_IN_BATCH",
        "item is not part of this list".to_string(),
        false,
    )
}

fn parse_regulation_status(raw: Option<&str>) -> Result<Option<RegulationStatus>, ApiError> {
    match raw {
        None => Ok(None),
        Some(s) => RegulationStatus::parse(s).map(Some).ok_or_else(|| {
            json_error(
                StatusCode::BAD_REQUEST,
                "ERR_INVALID_INPUT",
                "status is not valid for regulation items".to_string(),
                false,
            )
        }),
    }
}

fn parse_schedule_status(raw: Option<&str>) -> Result<Option<ScheduleStatus>, ApiError> {
    match raw {
        None => Ok(None),
        Some(s) => ScheduleStatus::parse(s).map(Some).ok_or_else(|| {
            json_error(
                StatusCode::BAD_REQUEST,
                "ERR_INVALID_INPUT",
                "status is not valid for schedule items".to_string(),
                false,
            )
        }),
    }
}

struct UploadForm {
    item_id: i64,
    document_type: String,
    file_name: String,
    content_type: String,
    bytes: Vec<u8>,
    notes: Option<String>,
}

async fn read_upload_form(
    mut multipart: Multipart,
    max_upload_bytes: usize,
) -> Result<UploadForm, ApiError> {
    let mut item_id = None;
    let mut document_type = None;
    let mut notes = None;
    let mut file = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|_| invalid_multipart())?
    {
        match field.name() {
            Some("file") => {
                let file_name = field
                    .file_name()
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .unwrap_or("upload.bin")
                    .to_string();
                let content_type = field
                    .content_type()
                    .unwrap_or("application/octet-stream")
                    .to_string();
                let bytes = field.bytes().await.map_err(|_| invalid_multipart())?;
                file = Some((file_name, content_type, bytes));
            }
            Some("itemId") => {
                let raw = field.text().await.map_err(|_| invalid_multipart())?;
                let parsed = raw.trim().parse::<i64>().map_err(|_| {
                    json_error(
                        StatusCode::BAD_REQUEST,
                        "ERR_INVALID_INPUT",
                        "itemId must be an integer".to_string(),
                        false,
                    )
                })?;
                item_id = Some(parsed);
            }
            Some("documentType") => {
                let raw = field.text().await.map_err(|_| invalid_multipart())?;
                document_type = Some(raw.trim().to_string());
            }
            Some("notes") => {
                let raw = field.text().await.map_err(|_| invalid_multipart())?;
                let trimmed = raw.trim();
                if !trimmed.is_empty() {
                    notes = Some(trimmed.to_string());
                }
            }
            _ => {}
        }
    }

    let (file_name, content_type, bytes) = file.ok_or_else(|| {
        json_error(
            StatusCode::BAD_REQUEST,
            "ERR_INVALID_INPUT",
            "file part is required".to_string(),
            false,
        )
    })?;
    if bytes.is_empty() {
        return Err(json_error(
            StatusCode::BAD_REQUEST,
            "ERR_INVALID_INPUT",
            "file part must not be empty".to_string(),
            false,
        ));
    }
    if bytes.len() > max_upload_bytes {
        return Err(json_error(
            StatusCode::BAD_REQUEST,
            "ERR_INVALID_INPUT",
            "file exceeds the upload size cap".to_string(),
            false,
        ));
    }

    let item_id = item_id.ok_or_else(|| {
        json_error(
            StatusCode::BAD_REQUEST,
            "ERR_INVALID_INPUT",
            "itemId part is required".to_string(),
            false,
        )
    })?;

    let document_type = document_type.unwrap_or_default();
    if document_type.is_empty() || document_type.chars().count() > MAX_DOCUMENT_TYPE_CHARS {
        return Err(json_error(
            StatusCode::BAD_REQUEST,
            "ERR_INVALID_INPUT",
            "documentType must be 1..=64 characters".to_string(),
            false,
        ));
    }

    Ok(UploadForm {
        item_id,
        document_type,
        file_name,
        content_type,
        bytes: bytes.to_vec(),
        notes,
    })
}

fn invalid_multipart() -> ApiError {
    json_error(
        StatusCode::BAD_REQUEST,
        "ERR_INVALID_INPUT",
        "malformed multipart body".to_string(),
        false,
    )
}

async fn extract_principal(state: &AppState, headers: &HeaderMap) -> Result<Principal, ApiError> {
    match state.config.auth_mode {
        AuthMode::Local => {
            validate_local_auth_shared_secret(
                headers,
                state.config.local_auth_shared_secret.as_deref(),
            )?;
            let principal_id = required_header(headers, "x-lista-principal-id")?;
            let subscriber_id = required_header(headers, "x-lista-subscriber-id")?;
            Ok(Principal {
                principal_id,
                subscriber_id,
                roles: Vec::new(),
            })
        }
        AuthMode::Oidc => {
            let Some(auth) = state.oidc.as_ref() else {
                return Err(json_error(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "ERR_INTERNAL",
                    "oidc authenticator is not initialized".to_string(),
                    false,
                ));
            };

            auth.authenticate(headers)
                .await
                .map_err(|err| match err.code {
                    "ERR_AUTH_UNAVAILABLE" => json_error(
                        StatusCode::SERVICE_UNAVAILABLE,
                        "ERR_UNAVAILABLE",
                        "authentication backend unavailable".to_string(),
                        true,
                    ),
                    _ => json_error(
                        StatusCode::UNAUTHORIZED,
                        "ERR_UNAUTHORIZED",
                        err.message,
                        false,
                    ),
                })
        }
    }
}

fn validate_local_auth_shared_secret(
    headers: &HeaderMap,
    expected_secret: Option<&str>,
) -> Result<(), ApiError> {
    let Some(expected_secret) = expected_secret else {
        return Ok(());
    };

    let provided_secret = headers
        .get("x-lista-auth-secret")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim())
        .filter(|v| !v.is_empty())
        .ok_or_else(|| {
            json_error(
                StatusCode::UNAUTHORIZED,
                "ERR_UNAUTHORIZED",
                "missing local auth secret".to_string(),
                false,
            )
        })?;

    if provided_secret != expected_secret {
        return Err(json_error(
            StatusCode::UNAUTHORIZED,
            "ERR_UNAUTHORIZED",
            "invalid local auth secret".to_string(),
            false,
        ));
    }

    Ok(())
}

fn required_header(headers: &HeaderMap, name: &'static str) -> Result<String, ApiError> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim())
        .filter(|v| !v.is_empty())
        .map(|v| v.to_string())
        .ok_or_else(|| {
            json_error(
                StatusCode::UNAUTHORIZED,
                "ERR_UNAUTHORIZED",
                format!("missing {} header", name),
                false,
            )
        })
}

fn extract_request_id(headers: &HeaderMap) -> String {
    headers
        .get("x-lista-request-id")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim())
        .filter(|v| !v.is_empty())
        .and_then(sanitize_request_id)
        .unwrap_or_else(|| Ulid::new().to_string())
}

fn extract_trace_id(headers: &HeaderMap) -> String {
    headers
        .get("x-lista-trace-id")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim())
        .filter(|v| !v.is_empty())
        .and_then(|v| v.parse::<Ulid>().ok())
        .map(|u| u.to_string())
        .unwrap_or_else(|| Ulid::new().to_string())
}

fn sanitize_request_id(raw: &str) -> Option<String> {
    const MAX_LEN: usize = 64;
    let mut out = String::with_capacity(raw.len().min(MAX_LEN));

    for ch in raw.chars() {
        if out.len() >= MAX_LEN {
            break;
        }
        if ch.is_ascii_alphanumeric() || matches!(ch, '-' | '_' | '.') {
            out.push(ch);
        }
    }

    (!out.is_empty()).then_some(out)
}

fn json_error(
    status: StatusCode,
    code: impl Into<String>,
    message: impl Into<String>,
    retryable: bool,
) -> (StatusCode, Json<ErrorResponse>) {
    (
        status,
        Json(ErrorResponse {
            error: code.into(),
            message: message.into(),
            retryable,
        }),
    )
}

fn store_unavailable(_: StoreError) -> ApiError {
    json_error(
        StatusCode::SERVICE_UNAVAILABLE,
        "ERR_UNAVAILABLE",
        "storage unavailable".to_string(),
        true,
    )
}

fn upload_failed(_: StoreError) -> ApiError {
    json_error(
        StatusCode::SERVICE_UNAVAILABLE,
        "ERR_UPLOAD_FAILED",
        "document storage failed".to_string(),
        true,
    )
}
