use std::sync::Arc;
use std::time::Duration;

use fiscalis_domain::idempotency::{
    BeginOutcome, IdempotencyConfig, IdempotencyService, InMemoryIdempotencyStore,
};
use fiscalis_domain::ports::idempotency::{IdempotencyKey, IdempotencyResponse};
use serde_json::json;

fn service(in_progress_ttl: Duration) -> IdempotencyService {
    IdempotencyService::new(
        Arc::new(InMemoryIdempotencyStore::new("test")),
        IdempotencyConfig {
            in_progress_ttl,
            completed_ttl: Duration::from_secs(60),
        },
    )
}

#[tokio::test]
async fn completed_write_replays_its_response() {
    let service = service(Duration::from_secs(60));
    let key = IdempotencyKey::new("sequence_enroll", "p-1", "req-1");

    assert_eq!(service.begin(&key).await.unwrap(), BeginOutcome::Started);

    let response = IdempotencyResponse {
        status_code: 201,
        body: json!({ "scheduled": 3 }),
    };
    service.complete(&key, response.clone()).await.unwrap();

    assert_eq!(
        service.begin(&key).await.unwrap(),
        BeginOutcome::Replay(response)
    );
}

#[tokio::test]
async fn concurrent_attempt_sees_in_progress() {
    let service = service(Duration::from_secs(60));
    let key = IdempotencyKey::new("sequence_enroll", "p-2", "req-2");

    assert_eq!(service.begin(&key).await.unwrap(), BeginOutcome::Started);
    assert_eq!(service.begin(&key).await.unwrap(), BeginOutcome::InProgress);
}

#[tokio::test]
async fn abandoned_claim_expires() {
    let service = service(Duration::from_millis(10));
    let key = IdempotencyKey::new("sequence_enroll", "p-3", "req-3");

    assert_eq!(service.begin(&key).await.unwrap(), BeginOutcome::Started);
    tokio::time::sleep(Duration::from_millis(25)).await;
    assert_eq!(service.begin(&key).await.unwrap(), BeginOutcome::Started);
}
