mod observability;

use std::sync::Arc;
use std::time::{Duration, Instant};

use fiscalis_domain::aggregation::AggregationService;
use fiscalis_domain::ports::db::DbAdapter;
use fiscalis_domain::ports::notifications::NotificationRepository;
use fiscalis_infra::config::AppConfig;
use fiscalis_infra::db::{DbConfig, SurrealAdapter};
use fiscalis_infra::logging::init_tracing;
use fiscalis_infra::repositories::{
    InMemoryNotificationRepository, SurrealNotificationRepository,
};
use tracing::{info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = AppConfig::load()?;
    init_tracing(&config)?;
    observability::init_metrics()?;

    let repository: Arc<dyn NotificationRepository> =
        if config.data_backend.eq_ignore_ascii_case("surreal") {
            let db_config = DbConfig::from_app_config(&config);
            let adapter = SurrealAdapter::new(db_config.clone());
            if let Err(err) = adapter.health_check().await {
                warn!(error = %err, backend = adapter.name(), "store health check failed");
            }
            Arc::new(SurrealNotificationRepository::new(&db_config).await?)
        } else {
            warn!("running the aggregation worker on the in-memory backend");
            Arc::new(InMemoryNotificationRepository::new())
        };
    let aggregation = AggregationService::new(repository);

    let interval = Duration::from_millis(config.worker_aggregation_interval_ms.max(1_000));
    info!(interval_ms = interval.as_millis() as u64, "worker starting");

    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => run_sweep(&aggregation).await,
            _ = tokio::signal::ctrl_c() => {
                info!("worker shutdown");
                break;
            }
        }
    }

    Ok(())
}

async fn run_sweep(aggregation: &AggregationService) {
    let started = Instant::now();
    match aggregation.aggregate_all().await {
        Ok(report) => {
            let orphans = match aggregation.cleanup_orphan_parents(None).await {
                Ok(orphans) => orphans,
                Err(err) => {
                    warn!(error = %err, "orphan parent cleanup failed");
                    0
                }
            };
            info!(
                recipients = report.recipients_processed,
                parents_created = report.parents_created,
                parents_extended = report.parents_extended,
                children_linked = report.children_linked,
                groups_skipped = report.groups_skipped,
                orphans_archived = orphans,
                "aggregation sweep finished"
            );
            observability::register_sweep("ok", &report, started.elapsed());
        }
        Err(err) => {
            warn!(error = %err, "aggregation sweep failed");
            observability::register_sweep_failure(started.elapsed());
        }
    }
}
