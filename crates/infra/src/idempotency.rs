use std::time::Duration;

use fiscalis_domain::ports::idempotency::{
    IdempotencyError, IdempotencyKey, IdempotencyRecord, IdempotencyStore, PutOutcome,
};
use redis::AsyncCommands;
use redis::aio::ConnectionManager;

const DEFAULT_PREFIX: &str = "fiscalis:idemp";

#[derive(Clone)]
pub struct RedisIdempotencyStore {
    manager: ConnectionManager,
    prefix: String,
}

impl RedisIdempotencyStore {
    pub async fn connect(redis_url: &str) -> Result<Self, IdempotencyError> {
        Self::connect_with_prefix(redis_url, DEFAULT_PREFIX).await
    }

    pub async fn connect_with_prefix(
        redis_url: &str,
        prefix: impl Into<String>,
    ) -> Result<Self, IdempotencyError> {
        let client = redis::Client::open(redis_url)
            .map_err(|err| IdempotencyError::Unavailable(err.to_string()))?;
        let manager = ConnectionManager::new(client)
            .await
            .map_err(|err| IdempotencyError::Unavailable(err.to_string()))?;
        Ok(Self {
            manager,
            prefix: prefix.into(),
        })
    }

    fn cache_key(&self, key: &IdempotencyKey) -> String {
        key.cache_key(&self.prefix)
    }

    fn ttl_ms(ttl: Duration) -> u64 {
        (ttl.as_millis() as u64).max(1)
    }

    fn encode(record: &IdempotencyRecord) -> Result<String, IdempotencyError> {
        serde_json::to_string(record)
            .map_err(|err| IdempotencyError::Serialization(err.to_string()))
    }

    fn decode(payload: &str) -> Result<IdempotencyRecord, IdempotencyError> {
        serde_json::from_str(payload)
            .map_err(|err| IdempotencyError::Serialization(err.to_string()))
    }
}

impl IdempotencyStore for RedisIdempotencyStore {
    fn get(
        &self,
        key: &IdempotencyKey,
    ) -> fiscalis_domain::ports::BoxFuture<'_, Result<Option<IdempotencyRecord>, IdempotencyError>>
    {
        let cache_key = self.cache_key(key);
        Box::pin(async move {
            let mut conn = self.manager.clone();
            let value: Option<String> = conn
                .get(cache_key)
                .await
                .map_err(|err| IdempotencyError::Store(err.to_string()))?;
            value.as_deref().map(Self::decode).transpose()
        })
    }

    fn put_if_absent(
        &self,
        key: &IdempotencyKey,
        record: &IdempotencyRecord,
        ttl: Duration,
    ) -> fiscalis_domain::ports::BoxFuture<'_, Result<PutOutcome, IdempotencyError>> {
        let cache_key = self.cache_key(key);
        let record = record.clone();
        Box::pin(async move {
            let payload = Self::encode(&record)?;
            let ttl_ms = Self::ttl_ms(ttl);
            let mut conn = self.manager.clone();

            let claimed: Option<String> = redis::cmd("SET")
                .arg(&cache_key)
                .arg(&payload)
                .arg("NX")
                .arg("PX")
                .arg(ttl_ms)
                .query_async(&mut conn)
                .await
                .map_err(|err| IdempotencyError::Store(err.to_string()))?;
            if claimed.is_some() {
                return Ok(PutOutcome::Stored);
            }

            // Someone holds the key; report what they stored. The key can
            // expire between the two commands, in which case the claim is
            // simply retried by the caller's next begin.
            let existing: Option<String> = conn
                .get(&cache_key)
                .await
                .map_err(|err| IdempotencyError::Store(err.to_string()))?;
            match existing {
                Some(payload) => Ok(PutOutcome::Existing(Self::decode(&payload)?)),
                None => Err(IdempotencyError::Store(
                    "idempotency key vanished during claim".into(),
                )),
            }
        })
    }

    fn update(
        &self,
        key: &IdempotencyKey,
        record: &IdempotencyRecord,
        ttl: Duration,
    ) -> fiscalis_domain::ports::BoxFuture<'_, Result<(), IdempotencyError>> {
        let cache_key = self.cache_key(key);
        let record = record.clone();
        Box::pin(async move {
            let payload = Self::encode(&record)?;
            let ttl_ms = Self::ttl_ms(ttl);
            let mut conn = self.manager.clone();
            let _: String = redis::cmd("SET")
                .arg(&cache_key)
                .arg(&payload)
                .arg("PX")
                .arg(ttl_ms)
                .query_async(&mut conn)
                .await
                .map_err(|err| IdempotencyError::Store(err.to_string()))?;
            Ok(())
        })
    }
}
