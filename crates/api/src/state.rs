use std::sync::Arc;

use fiscalis_domain::idempotency::{IdempotencyConfig, IdempotencyService};
use fiscalis_domain::ports::idempotency::IdempotencyStore;
use fiscalis_domain::ports::messages::MessageRepository;
use fiscalis_domain::ports::notifications::NotificationRepository;
use fiscalis_domain::ports::db::DbAdapter;
use fiscalis_infra::config::AppConfig;
use fiscalis_infra::db::{DbConfig, SurrealAdapter};
use fiscalis_infra::idempotency::RedisIdempotencyStore;
use fiscalis_infra::repositories::{
    InMemoryMessageRepository, InMemoryNotificationRepository, SurrealMessageRepository,
    SurrealNotificationRepository,
};

#[derive(Clone)]
pub struct AppState {
    pub config: AppConfig,
    pub idempotency: IdempotencyService,
    pub message_repo: Arc<dyn MessageRepository>,
    pub notification_repo: Arc<dyn NotificationRepository>,
}

impl AppState {
    pub async fn new(config: AppConfig) -> anyhow::Result<Self> {
        let store = RedisIdempotencyStore::connect(&config.redis_url).await?;
        let idempotency = IdempotencyService::new(Arc::new(store), IdempotencyConfig::default());

        let (message_repo, notification_repo): (
            Arc<dyn MessageRepository>,
            Arc<dyn NotificationRepository>,
        ) = if config.data_backend.eq_ignore_ascii_case("surreal") {
            let db_config = DbConfig::from_app_config(&config);
            let adapter = SurrealAdapter::new(db_config.clone());
            if let Err(err) = adapter.health_check().await {
                tracing::warn!(error = %err, backend = adapter.name(), "store health check failed");
            }
            (
                Arc::new(SurrealMessageRepository::new(&db_config).await?),
                Arc::new(SurrealNotificationRepository::new(&db_config).await?),
            )
        } else {
            (
                Arc::new(InMemoryMessageRepository::new()),
                Arc::new(InMemoryNotificationRepository::new()),
            )
        };

        Ok(Self {
            config,
            idempotency,
            message_repo,
            notification_repo,
        })
    }

    #[allow(dead_code)]
    pub fn with_stores(
        config: AppConfig,
        idempotency_store: Arc<dyn IdempotencyStore>,
        message_repo: Arc<dyn MessageRepository>,
        notification_repo: Arc<dyn NotificationRepository>,
    ) -> Self {
        let idempotency =
            IdempotencyService::new(idempotency_store, IdempotencyConfig::default());
        Self {
            config,
            idempotency,
            message_repo,
            notification_repo,
        }
    }
}
