use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::ports::idempotency::{
    IdempotencyError, IdempotencyKey, IdempotencyRecord, IdempotencyResponse, IdempotencyState,
    IdempotencyStore, PutOutcome,
};

#[derive(Clone, Debug)]
pub struct IdempotencyConfig {
    pub in_progress_ttl: Duration,
    pub completed_ttl: Duration,
}

impl Default for IdempotencyConfig {
    fn default() -> Self {
        Self {
            in_progress_ttl: Duration::from_secs(120),
            completed_ttl: Duration::from_secs(60 * 60 * 48),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum BeginOutcome {
    Started,
    InProgress,
    Replay(IdempotencyResponse),
}

/// Request-level replay guard wrapped around every API write: `begin`
/// claims the key or reports what an earlier attempt did, `complete`
/// records the response for future replays.
#[derive(Clone)]
pub struct IdempotencyService {
    store: Arc<dyn IdempotencyStore>,
    config: IdempotencyConfig,
}

impl IdempotencyService {
    pub fn new(store: Arc<dyn IdempotencyStore>, config: IdempotencyConfig) -> Self {
        Self { store, config }
    }

    pub async fn begin(&self, key: &IdempotencyKey) -> Result<BeginOutcome, IdempotencyError> {
        let claim = IdempotencyRecord::in_progress();
        let outcome = self
            .store
            .put_if_absent(key, &claim, self.config.in_progress_ttl)
            .await?;
        match outcome {
            PutOutcome::Stored => Ok(BeginOutcome::Started),
            PutOutcome::Existing(existing) => match existing.state {
                IdempotencyState::InProgress => Ok(BeginOutcome::InProgress),
                IdempotencyState::Completed => existing
                    .response
                    .map(BeginOutcome::Replay)
                    .ok_or_else(|| {
                        IdempotencyError::Store("completed record missing response".into())
                    }),
            },
        }
    }

    pub async fn complete(
        &self,
        key: &IdempotencyKey,
        response: IdempotencyResponse,
    ) -> Result<(), IdempotencyError> {
        self.store
            .update(
                key,
                &IdempotencyRecord::completed(response),
                self.config.completed_ttl,
            )
            .await
    }
}

#[derive(Clone, Debug)]
pub struct InMemoryIdempotencyStore {
    prefix: String,
    entries: Arc<Mutex<HashMap<String, StoredEntry>>>,
}

#[derive(Clone, Debug)]
struct StoredEntry {
    record: IdempotencyRecord,
    expires_at: Option<Instant>,
}

impl StoredEntry {
    fn expired(&self) -> bool {
        self.expires_at
            .map(|deadline| Instant::now() >= deadline)
            .unwrap_or(false)
    }
}

impl InMemoryIdempotencyStore {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            entries: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn cache_key(&self, key: &IdempotencyKey) -> String {
        key.cache_key(&self.prefix)
    }

    fn deadline(ttl: Duration) -> Option<Instant> {
        if ttl.is_zero() {
            None
        } else {
            Some(Instant::now() + ttl)
        }
    }
}

impl IdempotencyStore for InMemoryIdempotencyStore {
    fn get(
        &self,
        key: &IdempotencyKey,
    ) -> crate::ports::BoxFuture<'_, Result<Option<IdempotencyRecord>, IdempotencyError>> {
        let cache_key = self.cache_key(key);
        let entries = self.entries.clone();
        Box::pin(async move {
            let mut guard = entries.lock().expect("idempotency store lock");
            match guard.get(&cache_key) {
                Some(entry) if entry.expired() => {
                    guard.remove(&cache_key);
                    Ok(None)
                }
                Some(entry) => Ok(Some(entry.record.clone())),
                None => Ok(None),
            }
        })
    }

    fn put_if_absent(
        &self,
        key: &IdempotencyKey,
        record: &IdempotencyRecord,
        ttl: Duration,
    ) -> crate::ports::BoxFuture<'_, Result<PutOutcome, IdempotencyError>> {
        let cache_key = self.cache_key(key);
        let entries = self.entries.clone();
        let record = record.clone();
        Box::pin(async move {
            let mut guard = entries.lock().expect("idempotency store lock");
            if let Some(entry) = guard.get(&cache_key) {
                if !entry.expired() {
                    return Ok(PutOutcome::Existing(entry.record.clone()));
                }
                guard.remove(&cache_key);
            }
            guard.insert(
                cache_key,
                StoredEntry {
                    record,
                    expires_at: Self::deadline(ttl),
                },
            );
            Ok(PutOutcome::Stored)
        })
    }

    fn update(
        &self,
        key: &IdempotencyKey,
        record: &IdempotencyRecord,
        ttl: Duration,
    ) -> crate::ports::BoxFuture<'_, Result<(), IdempotencyError>> {
        let cache_key = self.cache_key(key);
        let entries = self.entries.clone();
        let record = record.clone();
        Box::pin(async move {
            let mut guard = entries.lock().expect("idempotency store lock");
            guard.insert(
                cache_key,
                StoredEntry {
                    record,
                    expires_at: Self::deadline(ttl),
                },
            );
            Ok(())
        })
    }
}
