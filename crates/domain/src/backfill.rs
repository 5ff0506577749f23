use std::sync::Arc;

use serde::Serialize;

use crate::DomainResult;
use crate::aggregation::{AggregationReport, AggregationService};
use crate::error::DomainError;
use crate::notifications::{LegacyNotificationRecord, normalize};
use crate::ports::notifications::NotificationRepository;

#[derive(Clone, Debug, Default, Serialize, PartialEq, Eq)]
pub struct MigrationReport {
    pub recipients_processed: usize,
    pub recipients_failed: usize,
    pub parents_created: usize,
    pub parents_extended: usize,
    pub children_linked: usize,
    pub singletons_left: usize,
    pub groups_skipped: usize,
    pub orphan_parents_archived: usize,
}

#[derive(Clone, Debug, Default, Serialize, PartialEq, Eq)]
pub struct LegacyImportReport {
    pub imported: usize,
    pub already_present: usize,
    pub skipped: usize,
}

impl MigrationReport {
    fn absorb(&mut self, partial: &AggregationReport) {
        self.recipients_processed += partial.recipients_processed;
        self.parents_created += partial.parents_created;
        self.parents_extended += partial.parents_extended;
        self.children_linked += partial.children_linked;
        self.singletons_left += partial.singletons_left;
        self.groups_skipped += partial.groups_skipped;
    }
}

/// Historical backfill: the steady-state aggregation applied to the entire
/// flat notification store. It deliberately reuses `AggregationService`
/// rather than carrying a second folding code path that could drift.
///
/// Because parents are found-or-created by natural key, the job is safe to
/// interrupt and re-run: a restart only tops up groups the previous run did
/// not reach, and a second run over an unchanged dataset is a no-op.
#[derive(Clone)]
pub struct BackfillService {
    repository: Arc<dyn NotificationRepository>,
    aggregation: AggregationService,
}

impl BackfillService {
    pub fn new(repository: Arc<dyn NotificationRepository>) -> Self {
        let aggregation = AggregationService::new(repository.clone());
        Self {
            repository,
            aggregation,
        }
    }

    pub async fn run(&self) -> DomainResult<MigrationReport> {
        let recipients = self.repository.recipients_with_ungrouped().await?;
        tracing::info!(recipients = recipients.len(), "backfill starting");

        let mut report = MigrationReport::default();
        for recipient in recipients {
            match self.aggregation.aggregate_recipient(&recipient).await {
                Ok(partial) => report.absorb(&partial),
                Err(err) => {
                    tracing::warn!(
                        error = %err,
                        user_id = %recipient.user_id,
                        "backfill failed for recipient; continuing"
                    );
                    report.recipients_failed += 1;
                }
            }
        }

        match self.aggregation.cleanup_orphan_parents(None).await {
            Ok(archived) => report.orphan_parents_archived = archived,
            Err(err) => {
                tracing::warn!(error = %err, "orphan parent cleanup failed; continuing");
            }
        }

        tracing::info!(
            parents_created = report.parents_created,
            children_linked = report.children_linked,
            groups_skipped = report.groups_skipped,
            "backfill finished"
        );
        Ok(report)
    }

    /// Bring rows from the flat historical store into the canonical shape.
    /// The normalizer resolves the three legacy read-state encodings; the
    /// `legacy:<id>` dedupe key makes re-importing the same export a no-op,
    /// so an interrupted import can simply be restarted.
    pub async fn import_legacy(
        &self,
        rows: Vec<LegacyNotificationRecord>,
    ) -> DomainResult<LegacyImportReport> {
        let mut report = LegacyImportReport::default();
        for row in rows {
            if row.id.trim().is_empty() || row.user_id.trim().is_empty() {
                tracing::warn!(legacy_id = %row.id, "legacy row missing identifiers; skipped");
                report.skipped += 1;
                continue;
            }
            let notification = normalize(&row);
            match self.repository.create(&notification).await {
                Ok(_) => report.imported += 1,
                Err(DomainError::Conflict) => report.already_present += 1,
                Err(err) => {
                    tracing::warn!(
                        error = %err,
                        legacy_id = %notification.notification_id,
                        "legacy row failed to import; skipped"
                    );
                    report.skipped += 1;
                }
            }
        }
        tracing::info!(
            imported = report.imported,
            already_present = report.already_present,
            skipped = report.skipped,
            "legacy import finished"
        );
        Ok(report)
    }
}
