use axum::extract::{Extension, Path, Query, State};
use axum::{
    Json, Router,
    http::{HeaderMap, StatusCode},
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use validator::Validate;

use fiscalis_domain::aggregation::{AggregationReport, AggregationService};
use fiscalis_domain::backfill::BackfillService;
use fiscalis_domain::dedup::{
    BatchDuplicateVerdict, CandidateMessage, DuplicateChecker, DuplicateVerdict, EnrollmentVerdict,
    SequenceGuard,
};
use fiscalis_domain::idempotency::BeginOutcome;
use fiscalis_domain::identity::{Recipient, RecipientRole};
use fiscalis_domain::messages::{
    CampaignMessage, CancelReason, EnrollSequenceInput, MessageService, ScheduleInput,
    SequenceStep,
};
use fiscalis_domain::notifications::{
    LegacyNotificationRecord, Notification, NotificationIngest, NotificationPriority,
    NotificationStatus,
};
use fiscalis_domain::ports::idempotency::{IdempotencyKey, IdempotencyResponse};
use fiscalis_domain::query::{NotificationFilters, NotificationQueryService};

use crate::error::{ApiError, map_domain_error};
use crate::middleware::AuthContext;
use crate::{middleware as app_middleware, observability, state::AppState, validation};

pub fn router(state: AppState) -> Router {
    let protected = Router::new()
        .route("/v1/messages/check-duplicate", post(check_duplicate))
        .route("/v1/messages/check-scheduled", post(check_scheduled))
        .route("/v1/messages/schedule", post(schedule_message))
        .route("/v1/messages/:message_id/cancel", post(cancel_message))
        .route("/v1/messages/:message_id/sent", post(mark_message_sent))
        .route(
            "/v1/messages/:message_id/archive-duplicate",
            post(archive_duplicate),
        )
        .route(
            "/v1/sequences/:sequence_id/enrollment",
            get(check_enrollment),
        )
        .route("/v1/sequences/enroll", post(enroll_sequence))
        .route(
            "/v1/notifications",
            post(ingest_notification).get(list_notifications),
        )
        .route(
            "/v1/notifications/unread-count",
            get(unread_notification_count),
        )
        .route(
            "/v1/notifications/:notification_id/read",
            post(mark_notification_read),
        )
        .route("/v1/aggregation/run", post(run_aggregation))
        .route("/v1/aggregation/backfill", post(run_backfill))
        .route("/v1/aggregation/import-legacy", post(import_legacy))
        .route_layer(middleware::from_fn(app_middleware::require_auth_middleware));

    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .merge(protected)
        .layer(middleware::from_fn(app_middleware::metrics_layer))
        .layer(app_middleware::timeout_layer())
        .layer(app_middleware::trace_layer())
        .layer(app_middleware::set_request_id_layer())
        .layer(app_middleware::propagate_request_id_layer())
        .layer(middleware::from_fn(app_middleware::actor_middleware))
        .layer(middleware::from_fn(
            app_middleware::correlation_id_middleware,
        ))
        .with_state(state)
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    environment: String,
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        environment: state.config.app_env.clone(),
    })
}

async fn metrics() -> Response {
    match observability::render_metrics() {
        Some(body) => (StatusCode::OK, body).into_response(),
        None => ApiError::Internal.into_response(),
    }
}

#[derive(Debug, Deserialize, Validate)]
struct CheckDuplicateRequest {
    #[validate(length(min = 1, max = 128))]
    prospect_id: String,
    #[validate(length(min = 1, max = 256))]
    subject: String,
    #[validate(length(min = 1, max = 50_000))]
    body: String,
}

async fn check_duplicate(
    State(state): State<AppState>,
    Json(payload): Json<CheckDuplicateRequest>,
) -> Result<Json<DuplicateVerdict>, ApiError> {
    validation::validate(&payload)?;
    let checker = DuplicateChecker::new(state.message_repo.clone());
    let verdict = checker
        .is_content_already_sent(&payload.prospect_id, &payload.subject, &payload.body)
        .await;
    observability::register_duplicate_verdict("content", verdict.is_duplicate);
    Ok(Json(verdict))
}

#[derive(Debug, Deserialize, Serialize, Validate)]
struct CandidatePayload {
    step: u32,
    #[validate(length(min = 1, max = 256))]
    subject: String,
    #[validate(length(min = 1, max = 50_000))]
    body: String,
}

#[derive(Debug, Deserialize, Validate)]
struct CheckScheduledRequest {
    #[validate(length(min = 1, max = 128))]
    prospect_id: String,
    #[validate(length(min = 1, max = 32), nested)]
    candidates: Vec<CandidatePayload>,
}

async fn check_scheduled(
    State(state): State<AppState>,
    Json(payload): Json<CheckScheduledRequest>,
) -> Result<Json<BatchDuplicateVerdict>, ApiError> {
    validation::validate(&payload)?;
    let candidates = payload
        .candidates
        .into_iter()
        .map(|candidate| CandidateMessage {
            step: candidate.step,
            subject: candidate.subject,
            body: candidate.body,
        })
        .collect::<Vec<_>>();
    let checker = DuplicateChecker::new(state.message_repo.clone());
    let verdict = checker
        .are_any_already_scheduled_or_sent(&payload.prospect_id, &candidates)
        .await;
    observability::register_duplicate_verdict("batch", verdict.has_duplicates);
    Ok(Json(verdict))
}

#[derive(Debug, Deserialize)]
struct EnrollmentQuery {
    prospect_id: String,
}

async fn check_enrollment(
    State(state): State<AppState>,
    Path(sequence_id): Path<String>,
    Query(query): Query<EnrollmentQuery>,
) -> Result<Json<EnrollmentVerdict>, ApiError> {
    if query.prospect_id.trim().is_empty() {
        return Err(ApiError::Validation("prospect_id is required".into()));
    }
    let guard = SequenceGuard::new(state.message_repo.clone());
    let verdict = guard
        .is_sequence_already_scheduled(&query.prospect_id, &sequence_id)
        .await;
    Ok(Json(verdict))
}

#[derive(Debug, Deserialize, Serialize, Validate)]
struct SequenceStepPayload {
    #[validate(length(min = 1, max = 256))]
    subject: String,
    #[validate(length(min = 1, max = 50_000))]
    body: String,
    scheduled_for_ms: Option<i64>,
}

#[derive(Debug, Deserialize, Validate)]
struct EnrollSequenceRequest {
    #[validate(length(min = 1, max = 128))]
    prospect_id: String,
    #[validate(length(min = 1, max = 128))]
    sequence_id: String,
    #[validate(length(min = 1, max = 12), nested)]
    steps: Vec<SequenceStepPayload>,
}

async fn enroll_sequence(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<EnrollSequenceRequest>,
) -> Result<Response, ApiError> {
    validation::validate(&payload)?;
    let request_id = request_id_from_headers(&headers)?;
    let correlation_id = correlation_id_from_headers(&headers)?;

    let key = IdempotencyKey::new(
        "sequence_enroll",
        format!("{}:{}", payload.prospect_id, payload.sequence_id),
        request_id.clone(),
    );
    let outcome = state.idempotency.begin(&key).await.map_err(|err| {
        tracing::error!(error = %err, "idempotency begin failed");
        ApiError::Internal
    })?;

    match outcome {
        BeginOutcome::Replay(response) => Ok(to_response(response)),
        BeginOutcome::InProgress => Err(ApiError::Conflict),
        BeginOutcome::Started => {
            let service = MessageService::new(state.message_repo.clone());
            let input = EnrollSequenceInput {
                prospect_id: payload.prospect_id,
                sequence_id: payload.sequence_id,
                steps: payload
                    .steps
                    .into_iter()
                    .map(|step| SequenceStep {
                        subject: step.subject,
                        body: step.body,
                        scheduled_for_ms: step.scheduled_for_ms,
                    })
                    .collect(),
                request_id,
                correlation_id,
            };
            let enrollment = service
                .enroll_sequence(input)
                .await
                .map_err(map_domain_error)?;

            let response = IdempotencyResponse {
                status_code: StatusCode::CREATED.as_u16(),
                body: serde_json::to_value(&enrollment).map_err(|_| ApiError::Internal)?,
            };
            state
                .idempotency
                .complete(&key, response.clone())
                .await
                .map_err(|err| {
                    tracing::error!(error = %err, "idempotency complete failed");
                    ApiError::Internal
                })?;
            Ok(to_response(response))
        }
    }
}

#[derive(Debug, Deserialize, Validate)]
struct ScheduleMessageRequest {
    #[validate(length(min = 1, max = 128))]
    prospect_id: String,
    #[validate(length(min = 1, max = 256))]
    subject: String,
    #[validate(length(min = 1, max = 50_000))]
    body: String,
    sequence_id: Option<String>,
    step: Option<u32>,
    scheduled_for_ms: Option<i64>,
}

async fn schedule_message(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<ScheduleMessageRequest>,
) -> Result<Response, ApiError> {
    validation::validate(&payload)?;
    let request_id = request_id_from_headers(&headers)?;
    let correlation_id = correlation_id_from_headers(&headers)?;

    let key = IdempotencyKey::new(
        "message_schedule",
        payload.prospect_id.clone(),
        request_id.clone(),
    );
    let outcome = state.idempotency.begin(&key).await.map_err(|err| {
        tracing::error!(error = %err, "idempotency begin failed");
        ApiError::Internal
    })?;

    match outcome {
        BeginOutcome::Replay(response) => Ok(to_response(response)),
        BeginOutcome::InProgress => Err(ApiError::Conflict),
        BeginOutcome::Started => {
            let service = MessageService::new(state.message_repo.clone());
            let message = service
                .schedule(ScheduleInput {
                    prospect_id: payload.prospect_id,
                    subject: payload.subject,
                    body: payload.body,
                    sequence_id: payload.sequence_id,
                    step: payload.step,
                    scheduled_for_ms: payload.scheduled_for_ms,
                    request_id,
                    correlation_id,
                })
                .await
                .map_err(map_domain_error)?;

            let response = IdempotencyResponse {
                status_code: StatusCode::CREATED.as_u16(),
                body: serde_json::to_value(&message).map_err(|_| ApiError::Internal)?,
            };
            state
                .idempotency
                .complete(&key, response.clone())
                .await
                .map_err(|err| {
                    tracing::error!(error = %err, "idempotency complete failed");
                    ApiError::Internal
                })?;
            Ok(to_response(response))
        }
    }
}

#[derive(Debug, Deserialize)]
struct CancelMessageRequest {
    reason: Option<CancelReason>,
}

async fn cancel_message(
    State(state): State<AppState>,
    Path(message_id): Path<String>,
    Json(payload): Json<CancelMessageRequest>,
) -> Result<Json<CampaignMessage>, ApiError> {
    let service = MessageService::new(state.message_repo.clone());
    let message = service
        .cancel(
            &message_id,
            payload.reason.unwrap_or(CancelReason::OperatorRequest),
        )
        .await
        .map_err(map_domain_error)?;
    Ok(Json(message))
}

async fn mark_message_sent(
    State(state): State<AppState>,
    Path(message_id): Path<String>,
) -> Result<Json<CampaignMessage>, ApiError> {
    let service = MessageService::new(state.message_repo.clone());
    let message = service
        .mark_sent(&message_id)
        .await
        .map_err(map_domain_error)?;
    Ok(Json(message))
}

#[derive(Debug, Deserialize, Validate)]
struct ArchiveDuplicateRequest {
    #[validate(length(min = 1, max = 128))]
    duplicate_of: String,
}

async fn archive_duplicate(
    State(state): State<AppState>,
    Path(message_id): Path<String>,
    Json(payload): Json<ArchiveDuplicateRequest>,
) -> Result<Json<CampaignMessage>, ApiError> {
    validation::validate(&payload)?;
    let service = MessageService::new(state.message_repo.clone());
    let message = service
        .archive_as_duplicate(&message_id, &payload.duplicate_of)
        .await
        .map_err(map_domain_error)?;
    Ok(Json(message))
}

#[derive(Debug, Deserialize, Validate)]
struct IngestNotificationRequest {
    #[validate(length(min = 1, max = 128))]
    user_id: String,
    role: RecipientRole,
    #[validate(length(min = 1, max = 64))]
    notification_type: String,
    #[validate(length(min = 1, max = 256))]
    title: String,
    #[validate(length(min = 1, max = 4_000))]
    message: String,
    priority: Option<NotificationPriority>,
    action_url: Option<String>,
    action_data: Option<serde_json::Value>,
    metadata: Option<serde_json::Value>,
    dedupe_key: Option<String>,
    created_at_ms: Option<i64>,
}

async fn ingest_notification(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<IngestNotificationRequest>,
) -> Result<Response, ApiError> {
    validation::validate(&payload)?;
    let request_id = request_id_from_headers(&headers)?;
    let correlation_id = correlation_id_from_headers(&headers)?;

    let key = IdempotencyKey::new(
        "notification_ingest",
        payload.user_id.clone(),
        request_id.clone(),
    );
    let outcome = state.idempotency.begin(&key).await.map_err(|err| {
        tracing::error!(error = %err, "idempotency begin failed");
        ApiError::Internal
    })?;

    match outcome {
        BeginOutcome::Replay(response) => Ok(to_response(response)),
        BeginOutcome::InProgress => Err(ApiError::Conflict),
        BeginOutcome::Started => {
            let service = NotificationQueryService::new(state.notification_repo.clone());
            let input = NotificationIngest {
                user_id: payload.user_id,
                role: payload.role,
                notification_type: payload.notification_type,
                title: payload.title,
                message: payload.message,
                priority: payload.priority.unwrap_or(NotificationPriority::Medium),
                action_url: payload.action_url,
                action_data: payload.action_data,
                metadata: payload.metadata,
                request_id,
                correlation_id,
                dedupe_key: payload.dedupe_key,
                created_at_ms: payload.created_at_ms,
            };
            let notification = service.ingest(input).await.map_err(map_domain_error)?;

            let response = IdempotencyResponse {
                status_code: StatusCode::CREATED.as_u16(),
                body: serde_json::to_value(&notification).map_err(|_| ApiError::Internal)?,
            };
            state
                .idempotency
                .complete(&key, response.clone())
                .await
                .map_err(|err| {
                    tracing::error!(error = %err, "idempotency complete failed");
                    ApiError::Internal
                })?;
            Ok(to_response(response))
        }
    }
}

#[derive(Debug, Deserialize)]
struct ListNotificationsQuery {
    status: Option<String>,
    notification_type: Option<String>,
    priority: Option<String>,
    search: Option<String>,
    from_ms: Option<i64>,
    to_ms: Option<i64>,
    dedupe: Option<bool>,
    limit: Option<usize>,
    offset: Option<usize>,
}

async fn list_notifications(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Query(query): Query<ListNotificationsQuery>,
) -> Result<Json<Vec<Notification>>, ApiError> {
    let recipient = auth.recipient()?;
    let filters = build_filters(query)?;
    let service = NotificationQueryService::new(state.notification_repo.clone());
    let notifications = service
        .list(&recipient, filters)
        .await
        .map_err(map_domain_error)?;
    Ok(Json(notifications))
}

fn build_filters(query: ListNotificationsQuery) -> Result<NotificationFilters, ApiError> {
    let status = query
        .status
        .as_deref()
        .map(|value| {
            NotificationStatus::parse(value)
                .ok_or_else(|| ApiError::Validation(format!("unknown status '{value}'")))
        })
        .transpose()?;
    let priority = query
        .priority
        .as_deref()
        .map(|value| {
            NotificationPriority::parse(value)
                .ok_or_else(|| ApiError::Validation(format!("unknown priority '{value}'")))
        })
        .transpose()?;
    Ok(NotificationFilters {
        status,
        notification_type: query.notification_type,
        priority,
        search: query.search,
        from_ms: query.from_ms,
        to_ms: query.to_ms,
        dedupe: query.dedupe.unwrap_or(false),
        limit: query.limit,
        offset: query.offset.unwrap_or(0),
    })
}

async fn unread_notification_count(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let recipient = auth.recipient()?;
    let service = NotificationQueryService::new(state.notification_repo.clone());
    let count = service
        .unread_count(&recipient)
        .await
        .map_err(map_domain_error)?;
    Ok(Json(json!({ "unread": count })))
}

async fn mark_notification_read(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path(notification_id): Path<String>,
) -> Result<Json<Notification>, ApiError> {
    let recipient = auth.recipient()?;
    let service = NotificationQueryService::new(state.notification_repo.clone());
    let notification = service
        .mark_as_read(&recipient, &notification_id)
        .await
        .map_err(map_domain_error)?;
    Ok(Json(notification))
}

#[derive(Debug, Deserialize, Default)]
struct RunAggregationRequest {
    user_id: Option<String>,
    role: Option<RecipientRole>,
}

async fn run_aggregation(
    State(state): State<AppState>,
    payload: Option<Json<RunAggregationRequest>>,
) -> Result<Json<AggregationReport>, ApiError> {
    let Json(payload) = payload.unwrap_or_default();
    let service = AggregationService::new(state.notification_repo.clone());

    let report = match payload.user_id {
        Some(user_id) => {
            let role = payload
                .role
                .ok_or_else(|| ApiError::Validation("role is required with user_id".into()))?;
            let recipient = Recipient::new(user_id.clone(), role);
            let report = service
                .aggregate_recipient(&recipient)
                .await
                .map_err(map_domain_error)?;
            service
                .cleanup_orphan_parents(Some(&user_id))
                .await
                .map_err(map_domain_error)?;
            report
        }
        None => {
            let report = service.aggregate_all().await.map_err(map_domain_error)?;
            service
                .cleanup_orphan_parents(None)
                .await
                .map_err(map_domain_error)?;
            report
        }
    };

    observability::register_aggregation_run("api", &report);
    Ok(Json(report))
}

async fn run_backfill(
    State(state): State<AppState>,
) -> Result<Json<fiscalis_domain::backfill::MigrationReport>, ApiError> {
    let service = BackfillService::new(state.notification_repo.clone());
    let report = service.run().await.map_err(map_domain_error)?;
    Ok(Json(report))
}

async fn import_legacy(
    State(state): State<AppState>,
    Json(rows): Json<Vec<LegacyNotificationRecord>>,
) -> Result<Json<fiscalis_domain::backfill::LegacyImportReport>, ApiError> {
    let service = BackfillService::new(state.notification_repo.clone());
    let report = service
        .import_legacy(rows)
        .await
        .map_err(map_domain_error)?;
    Ok(Json(report))
}

fn request_id_from_headers(headers: &HeaderMap) -> Result<String, ApiError> {
    headers
        .get("x-request-id")
        .and_then(|value| value.to_str().ok())
        .filter(|value| !value.is_empty())
        .map(std::string::ToString::to_string)
        .ok_or_else(|| ApiError::Validation("missing request id".into()))
}

fn correlation_id_from_headers(headers: &HeaderMap) -> Result<String, ApiError> {
    headers
        .get(app_middleware::CORRELATION_ID_HEADER)
        .and_then(|value| value.to_str().ok())
        .filter(|value| !value.is_empty())
        .map(std::string::ToString::to_string)
        .ok_or_else(|| ApiError::Validation("missing correlation id".into()))
}

fn to_response(response: IdempotencyResponse) -> Response {
    let status = StatusCode::from_u16(response.status_code).unwrap_or(StatusCode::OK);
    (status, Json(response.body)).into_response()
}
