use std::sync::Arc;

use axum::Router;
use axum::body::{Body, to_bytes};
use axum::http::header::CONTENT_TYPE;
use axum::http::{Request, StatusCode};
use fiscalis_domain::idempotency::InMemoryIdempotencyStore;
use fiscalis_infra::config::AppConfig;
use fiscalis_infra::repositories::{InMemoryMessageRepository, InMemoryNotificationRepository};
use serde_json::{Value, json};
use tower::ServiceExt;

use crate::routes;
use crate::state::AppState;

fn test_config() -> AppConfig {
    AppConfig {
        app_env: "test".to_string(),
        port: 0,
        log_level: "info".to_string(),
        data_backend: "memory".to_string(),
        surreal_endpoint: "ws://127.0.0.1:8000".to_string(),
        surreal_ns: "fiscalis".to_string(),
        surreal_db: "notifications".to_string(),
        surreal_user: "root".to_string(),
        surreal_pass: "root".to_string(),
        redis_url: "redis://127.0.0.1:6379".to_string(),
        worker_aggregation_interval_ms: 60_000,
    }
}

fn test_app() -> Router {
    let state = AppState::with_stores(
        test_config(),
        Arc::new(InMemoryIdempotencyStore::new("test")),
        Arc::new(InMemoryMessageRepository::new()),
        Arc::new(InMemoryNotificationRepository::new()),
    );
    routes::router(state)
}

struct RequestSpec<'a> {
    method: &'a str,
    uri: &'a str,
    actor: Option<(&'a str, &'a str)>,
    request_id: Option<&'a str>,
    body: Option<Value>,
}

impl<'a> RequestSpec<'a> {
    fn get(uri: &'a str, actor: (&'a str, &'a str)) -> Self {
        Self {
            method: "GET",
            uri,
            actor: Some(actor),
            request_id: None,
            body: None,
        }
    }

    fn post(uri: &'a str, actor: (&'a str, &'a str), body: Value) -> Self {
        Self {
            method: "POST",
            uri,
            actor: Some(actor),
            request_id: None,
            body: Some(body),
        }
    }

    fn with_request_id(mut self, request_id: &'a str) -> Self {
        self.request_id = Some(request_id);
        self
    }
}

async fn send(app: &Router, spec: RequestSpec<'_>) -> (StatusCode, Value) {
    let mut builder = Request::builder().method(spec.method).uri(spec.uri);
    if let Some((actor_id, role)) = spec.actor {
        builder = builder
            .header("x-actor-id", actor_id)
            .header("x-actor-role", role);
    }
    if let Some(request_id) = spec.request_id {
        builder = builder.header("x-request-id", request_id);
    }
    let request = match spec.body {
        Some(body) => builder
            .header(CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string())),
        None => builder.body(Body::empty()),
    }
    .expect("request");

    let response = app.clone().oneshot(request).await.expect("response");
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.expect("body");
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::String(
            String::from_utf8_lossy(&bytes).to_string(),
        ))
    };
    (status, value)
}

fn document_review(user_id: &str, case_id: &str, case_name: &str) -> Value {
    json!({
        "user_id": user_id,
        "role": "client",
        "notification_type": "document_review",
        "title": "Document reviewed",
        "message": format!("A document on {case_name} was reviewed."),
        "action_data": { "case_id": case_id, "case_name": case_name },
    })
}

async fn ingest(app: &Router, request_id: &str, body: Value) -> Value {
    let (status, value) = send(
        app,
        RequestSpec::post("/v1/notifications", ("svc-events", "admin"), body)
            .with_request_id(request_id),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED, "ingest failed: {value}");
    value
}

async fn enroll(
    app: &Router,
    request_id: &str,
    prospect_id: &str,
    sequence_id: &str,
) -> (StatusCode, Value) {
    let steps = (1..=3)
        .map(|step| {
            json!({
                "subject": format!("Relance {step}"),
                "body": format!("Corps de l'étape {step}."),
            })
        })
        .collect::<Vec<_>>();
    send(
        app,
        RequestSpec::post(
            "/v1/sequences/enroll",
            ("ops-1", "admin"),
            json!({
                "prospect_id": prospect_id,
                "sequence_id": sequence_id,
                "steps": steps,
            }),
        )
        .with_request_id(request_id),
    )
    .await
}

#[tokio::test]
async fn health_is_public() {
    let app = test_app();
    let request = Request::builder()
        .uri("/health")
        .body(Body::empty())
        .expect("request");
    let response = app.oneshot(request).await.expect("response");
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn protected_routes_reject_anonymous_callers() {
    let app = test_app();
    let request = Request::builder()
        .uri("/v1/notifications")
        .body(Body::empty())
        .expect("request");
    let response = app.oneshot(request).await.expect("response");
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn document_reviews_fold_into_one_parent_plus_singleton() {
    let app = test_app();
    for index in 0..3 {
        ingest(
            &app,
            &format!("req-a-{index}"),
            document_review("client-42", "case-a", "TICPE 2025"),
        )
        .await;
    }
    ingest(&app, "req-b-0", document_review("client-42", "case-b", "URSSAF")).await;

    let (status, report) = send(
        &app,
        RequestSpec::post(
            "/v1/aggregation/run",
            ("ops-1", "admin"),
            json!({ "user_id": "client-42", "role": "client" }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(report["parents_created"], 1);
    assert_eq!(report["children_linked"], 3);
    assert_eq!(report["singletons_left"], 1);

    let (status, listed) = send(
        &app,
        RequestSpec::get("/v1/notifications", ("client-42", "client")),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let listed = listed.as_array().expect("array").clone();
    assert_eq!(listed.len(), 2);

    let parent = listed
        .iter()
        .find(|row| row["is_parent"] == true)
        .expect("parent");
    assert_eq!(parent["children_count"], 3);
    // Fresh notifications get the baseline badge, not an escalated one.
    assert!(parent["title"].as_str().expect("title").starts_with("📋"));
    assert_eq!(parent["metadata"]["target_entity_id"], "case-a");

    let singleton = listed
        .iter()
        .find(|row| row["is_parent"] == false)
        .expect("singleton");
    assert_eq!(singleton["action_data"]["case_id"], "case-b");

    // A second sweep changes nothing.
    let (_, rerun) = send(
        &app,
        RequestSpec::post(
            "/v1/aggregation/run",
            ("ops-1", "admin"),
            json!({ "user_id": "client-42", "role": "client" }),
        ),
    )
    .await;
    assert_eq!(rerun["parents_created"], 0);
    assert_eq!(rerun["children_linked"], 0);

    let (_, relisted) = send(
        &app,
        RequestSpec::get("/v1/notifications", ("client-42", "client")),
    )
    .await;
    assert_eq!(relisted.as_array().expect("array").len(), 2);
}

#[tokio::test]
async fn backfill_covers_everyone_and_reruns_clean() {
    let app = test_app();
    for index in 0..3 {
        ingest(
            &app,
            &format!("req-a-{index}"),
            document_review("client-1", "case-a", "TICPE 2025"),
        )
        .await;
    }
    for index in 0..2 {
        ingest(
            &app,
            &format!("req-b-{index}"),
            document_review("client-2", "case-b", "Foncier"),
        )
        .await;
    }

    let (status, report) = send(
        &app,
        RequestSpec::post("/v1/aggregation/backfill", ("ops-1", "admin"), json!({})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(report["recipients_processed"], 2);
    assert_eq!(report["parents_created"], 2);
    assert_eq!(report["children_linked"], 5);

    let (_, rerun) = send(
        &app,
        RequestSpec::post("/v1/aggregation/backfill", ("ops-1", "admin"), json!({})),
    )
    .await;
    assert_eq!(rerun["parents_created"], 0);
    assert_eq!(rerun["children_linked"], 0);
}

#[tokio::test]
async fn legacy_import_is_idempotent_and_respects_status_precedence() {
    let app = test_app();
    let rows = json!([
        {
            "id": "legacy-1",
            "user_id": "client-1",
            "user_type": "client",
            "notification_type": "document_review",
            "title": "Document reviewed",
            "message": "An old review.",
            "is_read": false,
            "archived_at_ms": 2000,
            "created_at_ms": 1000,
        },
        {
            "id": "legacy-2",
            "user_id": "client-1",
            "user_type": "client",
            "notification_type": "document_review",
            "title": "Document reviewed",
            "message": "Another old review.",
            "created_at_ms": 1000,
        }
    ]);

    let (status, report) = send(
        &app,
        RequestSpec::post(
            "/v1/aggregation/import-legacy",
            ("ops-1", "admin"),
            rows.clone(),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(report["imported"], 2);

    let (_, rerun) = send(
        &app,
        RequestSpec::post("/v1/aggregation/import-legacy", ("ops-1", "admin"), rows),
    )
    .await;
    assert_eq!(rerun["imported"], 0);
    assert_eq!(rerun["already_present"], 2);

    // The archived legacy row never resurfaces in the default listing.
    let (_, listed) = send(
        &app,
        RequestSpec::get("/v1/notifications", ("client-1", "client")),
    )
    .await;
    let listed = listed.as_array().expect("array");
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0]["notification_id"], "legacy-2");
}

#[tokio::test]
async fn mark_read_is_scoped_to_the_owner() {
    let app = test_app();
    let created = ingest(
        &app,
        "req-1",
        document_review("client-42", "case-a", "TICPE 2025"),
    )
    .await;
    let notification_id = created["notification_id"].as_str().expect("id").to_string();

    let (status, _) = send(
        &app,
        RequestSpec::post(
            &format!("/v1/notifications/{notification_id}/read"),
            ("client-7", "client"),
            json!({}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, updated) = send(
        &app,
        RequestSpec::post(
            &format!("/v1/notifications/{notification_id}/read"),
            ("client-42", "client"),
            json!({}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(updated["status"], "read");
}

#[tokio::test]
async fn unread_count_tracks_reads() {
    let app = test_app();
    let created = ingest(
        &app,
        "req-1",
        document_review("client-42", "case-a", "TICPE 2025"),
    )
    .await;
    ingest(&app, "req-2", document_review("client-42", "case-b", "URSSAF")).await;

    let (_, counted) = send(
        &app,
        RequestSpec::get("/v1/notifications/unread-count", ("client-42", "client")),
    )
    .await;
    assert_eq!(counted["unread"], 2);

    let notification_id = created["notification_id"].as_str().expect("id").to_string();
    send(
        &app,
        RequestSpec::post(
            &format!("/v1/notifications/{notification_id}/read"),
            ("client-42", "client"),
            json!({}),
        ),
    )
    .await;

    let (_, counted) = send(
        &app,
        RequestSpec::get("/v1/notifications/unread-count", ("client-42", "client")),
    )
    .await;
    assert_eq!(counted["unread"], 1);
}

#[tokio::test]
async fn enrollment_is_guarded_and_idempotent() {
    let app = test_app();
    let (status, first) = enroll(&app, "req-enroll", "p-7", "seq-onboarding").await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(first["scheduled"].as_array().expect("scheduled").len(), 3);

    // Same request id: replayed, not re-executed.
    let (status, replay) = enroll(&app, "req-enroll", "p-7", "seq-onboarding").await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(replay, first);

    // New request id: refused, the sequence is already live.
    let (status, _) = enroll(&app, "req-enroll-2", "p-7", "seq-onboarding").await;
    assert_eq!(status, StatusCode::CONFLICT);

    let (_, verdict) = send(
        &app,
        RequestSpec::get(
            "/v1/sequences/seq-onboarding/enrollment?prospect_id=p-7",
            ("ops-1", "admin"),
        ),
    )
    .await;
    assert_eq!(verdict["is_scheduled"], true);
    assert_eq!(verdict["email_count"], 3);
}

#[tokio::test]
async fn edited_step_clears_content_check_but_sequence_stays_enrolled() {
    let app = test_app();
    let (_, enrollment) = enroll(&app, "req-enroll", "p-7", "seq-onboarding").await;
    let step2_id = enrollment["scheduled"]
        .as_array()
        .expect("scheduled")
        .iter()
        .find(|message| message["step"] == 2)
        .expect("step 2")["message_id"]
        .as_str()
        .expect("id")
        .to_string();

    // Operator edits step 2 before step 1 sends: cancel, reschedule edited.
    let (status, _) = send(
        &app,
        RequestSpec::post(
            &format!("/v1/messages/{step2_id}/cancel"),
            ("ops-1", "admin"),
            json!({ "reason": "operator_request" }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (status, _) = send(
        &app,
        RequestSpec::post(
            "/v1/messages/schedule",
            ("ops-1", "admin"),
            json!({
                "prospect_id": "p-7",
                "subject": "Relance 2",
                "body": "Corps de l'étape 2, version corrigée.",
                "sequence_id": "seq-onboarding",
                "step": 2,
            }),
        )
        .with_request_id("req-edit"),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);

    // The original step-2 wording no longer counts as scheduled...
    let (_, verdict) = send(
        &app,
        RequestSpec::post(
            "/v1/messages/check-scheduled",
            ("ops-1", "admin"),
            json!({
                "prospect_id": "p-7",
                "candidates": [
                    { "step": 2, "subject": "Relance 2", "body": "Corps de l'étape 2." }
                ],
            }),
        ),
    )
    .await;
    assert_eq!(verdict["has_duplicates"], false);

    // ...while the enrollment itself still blocks a re-trigger.
    let (_, enrollment) = send(
        &app,
        RequestSpec::get(
            "/v1/sequences/seq-onboarding/enrollment?prospect_id=p-7",
            ("ops-1", "admin"),
        ),
    )
    .await;
    assert_eq!(enrollment["is_scheduled"], true);
    assert_eq!(enrollment["email_count"], 3);
}

#[tokio::test]
async fn sent_content_is_reported_as_duplicate_with_its_original() {
    let app = test_app();
    let (_, enrollment) = enroll(&app, "req-enroll", "p-9", "seq-onboarding").await;
    let first_id = enrollment["scheduled"]
        .as_array()
        .expect("scheduled")
        .first()
        .expect("step 1")["message_id"]
        .as_str()
        .expect("id")
        .to_string();

    let (status, _) = send(
        &app,
        RequestSpec::post(
            &format!("/v1/messages/{first_id}/sent"),
            ("svc-delivery", "admin"),
            json!({}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (_, verdict) = send(
        &app,
        RequestSpec::post(
            "/v1/messages/check-duplicate",
            ("ops-1", "admin"),
            json!({
                "prospect_id": "p-9",
                "subject": "Relance 1",
                "body": "Corps de l'étape 1.",
            }),
        ),
    )
    .await;
    assert_eq!(verdict["is_duplicate"], true);
    assert_eq!(verdict["original"]["message_id"], first_id.as_str());

    // Different prospect, same wording: clean.
    let (_, verdict) = send(
        &app,
        RequestSpec::post(
            "/v1/messages/check-duplicate",
            ("ops-1", "admin"),
            json!({
                "prospect_id": "p-10",
                "subject": "Relance 1",
                "body": "Corps de l'étape 1.",
            }),
        ),
    )
    .await;
    assert_eq!(verdict["is_duplicate"], false);

    // Resolving the duplicate by archiving the original releases the slot.
    let second_id = enrollment["scheduled"]
        .as_array()
        .expect("scheduled")
        .iter()
        .find(|message| message["step"] == 2)
        .expect("step 2")["message_id"]
        .as_str()
        .expect("id")
        .to_string();
    let (status, archived) = send(
        &app,
        RequestSpec::post(
            &format!("/v1/messages/{first_id}/archive-duplicate"),
            ("ops-1", "admin"),
            json!({ "duplicate_of": second_id }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(archived["archived_as_duplicate"], true);

    let (_, verdict) = send(
        &app,
        RequestSpec::post(
            "/v1/messages/check-duplicate",
            ("ops-1", "admin"),
            json!({
                "prospect_id": "p-9",
                "subject": "Relance 1",
                "body": "Corps de l'étape 1.",
            }),
        ),
    )
    .await;
    assert_eq!(verdict["is_duplicate"], false);
}

#[tokio::test]
async fn cancelling_a_sent_message_replays_as_success() {
    let app = test_app();
    let (_, enrollment) = enroll(&app, "req-enroll", "p-11", "seq-onboarding").await;
    let first_id = enrollment["scheduled"]
        .as_array()
        .expect("scheduled")
        .first()
        .expect("step 1")["message_id"]
        .as_str()
        .expect("id")
        .to_string();

    send(
        &app,
        RequestSpec::post(
            &format!("/v1/messages/{first_id}/sent"),
            ("svc-delivery", "admin"),
            json!({}),
        ),
    )
    .await;

    let (status, message) = send(
        &app,
        RequestSpec::post(
            &format!("/v1/messages/{first_id}/cancel"),
            ("ops-1", "admin"),
            json!({ "reason": "duplicate_content_detected" }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(message["status"], "sent");
    assert_eq!(message["cancel_reason"], Value::Null);
}
