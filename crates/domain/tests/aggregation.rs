use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use fiscalis_domain::DomainResult;
use fiscalis_domain::aggregation::{AggregationService, PARENT_NOTIFICATION_TYPE};
use fiscalis_domain::backfill::BackfillService;
use fiscalis_domain::error::DomainError;
use fiscalis_domain::identity::{Recipient, RecipientRole};
use fiscalis_domain::notifications::{
    LegacyNotificationRecord, NOTIF_TYPE_DOCUMENT_REVIEW, Notification, NotificationIngest,
    NotificationPriority, NotificationStatus, target_entity_id,
};
use fiscalis_domain::ports::BoxFuture;
use fiscalis_domain::ports::notifications::NotificationRepository;
use fiscalis_domain::query::{NotificationFilters, NotificationQueryService};
use serde_json::json;
use tokio::sync::RwLock;

#[derive(Default)]
struct MemoryNotificationRepo {
    rows: Arc<RwLock<HashMap<String, Notification>>>,
}

impl MemoryNotificationRepo {
    fn is_ungrouped(row: &Notification) -> bool {
        !row.is_parent
            && !row.is_child
            && row.parent_id.is_none()
            && row.status == NotificationStatus::Unread
    }
}

impl NotificationRepository for MemoryNotificationRepo {
    fn create(&self, notification: &Notification) -> BoxFuture<'_, DomainResult<Notification>> {
        let notification = notification.clone();
        let rows = self.rows.clone();
        Box::pin(async move {
            let mut rows = rows.write().await;
            if rows.contains_key(&notification.notification_id) {
                return Err(DomainError::Conflict);
            }
            if !notification.is_parent
                && rows.values().any(|row| {
                    row.user_id == notification.user_id && row.dedupe_key == notification.dedupe_key
                })
            {
                return Err(DomainError::Conflict);
            }
            if notification.is_parent {
                let target = target_entity_id(&notification);
                if rows.values().any(|row| {
                    row.is_open_parent()
                        && row.user_id == notification.user_id
                        && target_entity_id(row) == target
                }) {
                    return Err(DomainError::Conflict);
                }
            }
            rows.insert(notification.notification_id.clone(), notification.clone());
            Ok(notification)
        })
    }

    fn get(&self, notification_id: &str) -> BoxFuture<'_, DomainResult<Option<Notification>>> {
        let notification_id = notification_id.to_string();
        let rows = self.rows.clone();
        Box::pin(async move { Ok(rows.read().await.get(&notification_id).cloned()) })
    }

    fn get_by_dedupe_key(
        &self,
        user_id: &str,
        dedupe_key: &str,
    ) -> BoxFuture<'_, DomainResult<Option<Notification>>> {
        let user_id = user_id.to_string();
        let dedupe_key = dedupe_key.to_string();
        let rows = self.rows.clone();
        Box::pin(async move {
            Ok(rows
                .read()
                .await
                .values()
                .find(|row| row.user_id == user_id && row.dedupe_key == dedupe_key)
                .cloned())
        })
    }

    fn list_visible(
        &self,
        user_id: &str,
        role: RecipientRole,
    ) -> BoxFuture<'_, DomainResult<Vec<Notification>>> {
        let user_id = user_id.to_string();
        let rows = self.rows.clone();
        Box::pin(async move {
            Ok(rows
                .read()
                .await
                .values()
                .filter(|row| row.user_id == user_id && row.role == role && !row.hidden_in_list)
                .cloned()
                .collect())
        })
    }

    fn list_ungrouped(
        &self,
        user_id: &str,
        role: RecipientRole,
    ) -> BoxFuture<'_, DomainResult<Vec<Notification>>> {
        let user_id = user_id.to_string();
        let rows = self.rows.clone();
        Box::pin(async move {
            Ok(rows
                .read()
                .await
                .values()
                .filter(|row| {
                    row.user_id == user_id && row.role == role && Self::is_ungrouped(row)
                })
                .cloned()
                .collect())
        })
    }

    fn find_open_parent(
        &self,
        user_id: &str,
        target: &str,
    ) -> BoxFuture<'_, DomainResult<Option<Notification>>> {
        let user_id = user_id.to_string();
        let target = target.to_string();
        let rows = self.rows.clone();
        Box::pin(async move {
            Ok(rows
                .read()
                .await
                .values()
                .find(|row| {
                    row.is_open_parent()
                        && row.user_id == user_id
                        && target_entity_id(row).as_deref() == Some(target.as_str())
                })
                .cloned())
        })
    }

    fn link_children(
        &self,
        parent_id: &str,
        child_ids: &[String],
        updated_at_ms: i64,
    ) -> BoxFuture<'_, DomainResult<usize>> {
        let parent_id = parent_id.to_string();
        let child_ids = child_ids.to_vec();
        let rows = self.rows.clone();
        Box::pin(async move {
            let mut rows = rows.write().await;
            let mut linked = 0usize;
            for child_id in &child_ids {
                let Some(row) = rows.get_mut(child_id) else {
                    continue;
                };
                if row.parent_id.as_deref() == Some(parent_id.as_str()) {
                    continue;
                }
                row.parent_id = Some(parent_id.clone());
                row.is_child = true;
                row.hidden_in_list = true;
                row.updated_at_ms = updated_at_ms;
                linked += 1;
            }
            Ok(linked)
        })
    }

    fn list_children(&self, parent_id: &str) -> BoxFuture<'_, DomainResult<Vec<Notification>>> {
        let parent_id = parent_id.to_string();
        let rows = self.rows.clone();
        Box::pin(async move {
            Ok(rows
                .read()
                .await
                .values()
                .filter(|row| row.parent_id.as_deref() == Some(parent_id.as_str()))
                .cloned()
                .collect())
        })
    }

    fn count_unread_children(&self, parent_id: &str) -> BoxFuture<'_, DomainResult<usize>> {
        let parent_id = parent_id.to_string();
        let rows = self.rows.clone();
        Box::pin(async move {
            Ok(rows
                .read()
                .await
                .values()
                .filter(|row| {
                    row.parent_id.as_deref() == Some(parent_id.as_str())
                        && row.status == NotificationStatus::Unread
                })
                .count())
        })
    }

    fn update(&self, notification: &Notification) -> BoxFuture<'_, DomainResult<Notification>> {
        let notification = notification.clone();
        let rows = self.rows.clone();
        Box::pin(async move {
            let mut rows = rows.write().await;
            if !rows.contains_key(&notification.notification_id) {
                return Err(DomainError::NotFound);
            }
            rows.insert(notification.notification_id.clone(), notification.clone());
            Ok(notification)
        })
    }

    fn mark_as_read(
        &self,
        notification_id: &str,
        read_at_ms: i64,
    ) -> BoxFuture<'_, DomainResult<Notification>> {
        let notification_id = notification_id.to_string();
        let rows = self.rows.clone();
        Box::pin(async move {
            let mut rows = rows.write().await;
            let row = rows.get_mut(&notification_id).ok_or(DomainError::NotFound)?;
            row.status = NotificationStatus::Read;
            row.read_at_ms = Some(read_at_ms);
            row.updated_at_ms = read_at_ms;
            Ok(row.clone())
        })
    }

    fn unread_count(&self, user_id: &str) -> BoxFuture<'_, DomainResult<usize>> {
        let user_id = user_id.to_string();
        let rows = self.rows.clone();
        Box::pin(async move {
            Ok(rows
                .read()
                .await
                .values()
                .filter(|row| {
                    row.user_id == user_id
                        && row.status == NotificationStatus::Unread
                        && !row.hidden_in_list
                })
                .count())
        })
    }

    fn list_open_parents(
        &self,
        user_id: Option<&str>,
    ) -> BoxFuture<'_, DomainResult<Vec<Notification>>> {
        let user_id = user_id.map(str::to_string);
        let rows = self.rows.clone();
        Box::pin(async move {
            Ok(rows
                .read()
                .await
                .values()
                .filter(|row| {
                    row.is_open_parent()
                        && user_id
                            .as_deref()
                            .is_none_or(|user_id| row.user_id == user_id)
                })
                .cloned()
                .collect())
        })
    }

    fn recipients_with_ungrouped(&self) -> BoxFuture<'_, DomainResult<Vec<Recipient>>> {
        let rows = self.rows.clone();
        Box::pin(async move {
            let rows = rows.read().await;
            let mut recipients = Vec::new();
            for row in rows.values() {
                if !Self::is_ungrouped(row) {
                    continue;
                }
                let recipient = Recipient::new(row.user_id.clone(), row.role);
                if !recipients.contains(&recipient) {
                    recipients.push(recipient);
                }
            }
            Ok(recipients)
        })
    }
}

/// Simulates the check-then-create race: the first `find_open_parent` call
/// misses even though a concurrent writer has already created the parent.
struct RacingRepo {
    inner: Arc<MemoryNotificationRepo>,
    miss_once: AtomicBool,
}

impl NotificationRepository for RacingRepo {
    fn create(&self, notification: &Notification) -> BoxFuture<'_, DomainResult<Notification>> {
        self.inner.create(notification)
    }

    fn get(&self, notification_id: &str) -> BoxFuture<'_, DomainResult<Option<Notification>>> {
        self.inner.get(notification_id)
    }

    fn get_by_dedupe_key(
        &self,
        user_id: &str,
        dedupe_key: &str,
    ) -> BoxFuture<'_, DomainResult<Option<Notification>>> {
        self.inner.get_by_dedupe_key(user_id, dedupe_key)
    }

    fn list_visible(
        &self,
        user_id: &str,
        role: RecipientRole,
    ) -> BoxFuture<'_, DomainResult<Vec<Notification>>> {
        self.inner.list_visible(user_id, role)
    }

    fn list_ungrouped(
        &self,
        user_id: &str,
        role: RecipientRole,
    ) -> BoxFuture<'_, DomainResult<Vec<Notification>>> {
        self.inner.list_ungrouped(user_id, role)
    }

    fn find_open_parent(
        &self,
        user_id: &str,
        target: &str,
    ) -> BoxFuture<'_, DomainResult<Option<Notification>>> {
        if self.miss_once.swap(false, Ordering::SeqCst) {
            return Box::pin(async { Ok(None) });
        }
        self.inner.find_open_parent(user_id, target)
    }

    fn link_children(
        &self,
        parent_id: &str,
        child_ids: &[String],
        updated_at_ms: i64,
    ) -> BoxFuture<'_, DomainResult<usize>> {
        self.inner.link_children(parent_id, child_ids, updated_at_ms)
    }

    fn list_children(&self, parent_id: &str) -> BoxFuture<'_, DomainResult<Vec<Notification>>> {
        self.inner.list_children(parent_id)
    }

    fn count_unread_children(&self, parent_id: &str) -> BoxFuture<'_, DomainResult<usize>> {
        self.inner.count_unread_children(parent_id)
    }

    fn update(&self, notification: &Notification) -> BoxFuture<'_, DomainResult<Notification>> {
        self.inner.update(notification)
    }

    fn mark_as_read(
        &self,
        notification_id: &str,
        read_at_ms: i64,
    ) -> BoxFuture<'_, DomainResult<Notification>> {
        self.inner.mark_as_read(notification_id, read_at_ms)
    }

    fn unread_count(&self, user_id: &str) -> BoxFuture<'_, DomainResult<usize>> {
        self.inner.unread_count(user_id)
    }

    fn list_open_parents(
        &self,
        user_id: Option<&str>,
    ) -> BoxFuture<'_, DomainResult<Vec<Notification>>> {
        self.inner.list_open_parents(user_id)
    }

    fn recipients_with_ungrouped(&self) -> BoxFuture<'_, DomainResult<Vec<Recipient>>> {
        self.inner.recipients_with_ungrouped()
    }
}

fn ingest(user_id: &str, case_id: &str, request_id: &str) -> NotificationIngest {
    NotificationIngest {
        user_id: user_id.into(),
        role: RecipientRole::Client,
        notification_type: NOTIF_TYPE_DOCUMENT_REVIEW.into(),
        title: "Document reviewed".into(),
        message: "Your document was reviewed.".into(),
        priority: NotificationPriority::Medium,
        action_url: None,
        action_data: Some(json!({ "case_id": case_id, "case_name": "TICPE 2025" })),
        metadata: None,
        request_id: request_id.into(),
        correlation_id: "corr".into(),
        dedupe_key: None,
        created_at_ms: None,
    }
}

async fn seed(queries: &NotificationQueryService, user_id: &str, case_id: &str, count: usize) {
    for index in 0..count {
        queries
            .ingest(ingest(user_id, case_id, &format!("req-{case_id}-{index}")))
            .await
            .expect("ingest");
    }
}

fn recipient(user_id: &str) -> Recipient {
    Recipient::new(user_id, RecipientRole::Client)
}

async fn open_parents(repo: &Arc<MemoryNotificationRepo>, user_id: &str) -> Vec<Notification> {
    repo.list_open_parents(Some(user_id)).await.expect("parents")
}

#[tokio::test]
async fn five_children_fold_into_one_parent_and_replay_is_idempotent() {
    let repo = Arc::new(MemoryNotificationRepo::default());
    let queries = NotificationQueryService::new(repo.clone());
    let service = AggregationService::new(repo.clone());
    seed(&queries, "u-1", "case-1", 5).await;

    let first = service.aggregate_recipient(&recipient("u-1")).await.expect("run");
    assert_eq!(first.parents_created, 1);
    assert_eq!(first.children_linked, 5);

    let second = service.aggregate_recipient(&recipient("u-1")).await.expect("rerun");
    assert_eq!(second.parents_created, 0);
    assert_eq!(second.parents_extended, 0);
    assert_eq!(second.children_linked, 0);

    let parents = open_parents(&repo, "u-1").await;
    assert_eq!(parents.len(), 1);
    assert_eq!(parents[0].children_count, 5);
    assert_eq!(parents[0].notification_type, PARENT_NOTIFICATION_TYPE);
}

#[tokio::test]
async fn a_lone_child_is_never_wrapped() {
    let repo = Arc::new(MemoryNotificationRepo::default());
    let queries = NotificationQueryService::new(repo.clone());
    let service = AggregationService::new(repo.clone());
    seed(&queries, "u-1", "case-1", 1).await;

    let report = service.aggregate_recipient(&recipient("u-1")).await.expect("run");
    assert_eq!(report.parents_created, 0);
    assert_eq!(report.singletons_left, 1);
    assert!(open_parents(&repo, "u-1").await.is_empty());
}

#[tokio::test]
async fn rows_without_a_target_stay_visible_and_ungrouped() {
    let repo = Arc::new(MemoryNotificationRepo::default());
    let queries = NotificationQueryService::new(repo.clone());
    let service = AggregationService::new(repo.clone());

    for index in 0..3 {
        let mut input = ingest("u-1", "unused", &format!("req-{index}"));
        input.action_data = None;
        queries.ingest(input).await.expect("ingest");
    }

    let report = service.aggregate_recipient(&recipient("u-1")).await.expect("run");
    assert_eq!(report.parents_created, 0);
    assert_eq!(report.singletons_left, 3);

    let listed = queries
        .list(&recipient("u-1"), NotificationFilters::default())
        .await
        .expect("list");
    assert_eq!(listed.len(), 3);
}

#[tokio::test]
async fn new_children_extend_the_open_parent() {
    let repo = Arc::new(MemoryNotificationRepo::default());
    let queries = NotificationQueryService::new(repo.clone());
    let service = AggregationService::new(repo.clone());

    seed(&queries, "u-1", "case-1", 2).await;
    service.aggregate_recipient(&recipient("u-1")).await.expect("run");
    seed(&queries, "u-1", "case-1", 2).await;
    let second = service.aggregate_recipient(&recipient("u-1")).await.expect("rerun");

    assert_eq!(second.parents_created, 0);
    assert_eq!(second.parents_extended, 1);
    assert_eq!(second.children_linked, 2);

    let parents = open_parents(&repo, "u-1").await;
    assert_eq!(parents.len(), 1);
    assert_eq!(parents[0].children_count, 4);
    assert!(parents[0].title.contains("4 actions"));
}

#[tokio::test]
async fn a_read_parent_is_closed_and_a_fresh_one_is_created() {
    let repo = Arc::new(MemoryNotificationRepo::default());
    let queries = NotificationQueryService::new(repo.clone());
    let service = AggregationService::new(repo.clone());

    seed(&queries, "u-1", "case-1", 2).await;
    service.aggregate_recipient(&recipient("u-1")).await.expect("run");
    let first_parent = open_parents(&repo, "u-1").await.remove(0);
    queries
        .mark_as_read(&recipient("u-1"), &first_parent.notification_id)
        .await
        .expect("read");

    seed(&queries, "u-1", "case-1", 2).await;
    let report = service.aggregate_recipient(&recipient("u-1")).await.expect("rerun");
    assert_eq!(report.parents_created, 1);

    let parents = open_parents(&repo, "u-1").await;
    assert_eq!(parents.len(), 1);
    assert_ne!(parents[0].notification_id, first_parent.notification_id);
    assert_eq!(parents[0].children_count, 2);
}

#[tokio::test]
async fn racing_creates_converge_on_one_parent() {
    let inner = Arc::new(MemoryNotificationRepo::default());
    let queries = NotificationQueryService::new(inner.clone());
    seed(&queries, "u-1", "case-1", 2).await;

    // A concurrent sweep already produced the parent.
    AggregationService::new(inner.clone())
        .aggregate_recipient(&recipient("u-1"))
        .await
        .expect("first sweep");
    seed(&queries, "u-1", "case-1", 2).await;

    // This sweep misses the existing parent on its first lookup, hits the
    // natural-key conflict on create, and must fall back to extending.
    let racing = Arc::new(RacingRepo {
        inner: inner.clone(),
        miss_once: AtomicBool::new(true),
    });
    let report = AggregationService::new(racing)
        .aggregate_recipient(&recipient("u-1"))
        .await
        .expect("racing sweep");

    assert_eq!(report.parents_created, 0);
    assert_eq!(report.parents_extended, 1);
    let parents = open_parents(&inner, "u-1").await;
    assert_eq!(parents.len(), 1);
    assert_eq!(parents[0].children_count, 4);
}

#[tokio::test]
async fn orphaned_parent_is_archived_once_children_are_read() {
    let repo = Arc::new(MemoryNotificationRepo::default());
    let queries = NotificationQueryService::new(repo.clone());
    let service = AggregationService::new(repo.clone());

    seed(&queries, "u-1", "case-1", 2).await;
    service.aggregate_recipient(&recipient("u-1")).await.expect("run");
    let parent = open_parents(&repo, "u-1").await.remove(0);

    for child in repo.list_children(&parent.notification_id).await.expect("children") {
        repo.mark_as_read(&child.notification_id, 1).await.expect("read child");
    }

    let archived = service.cleanup_orphan_parents(Some("u-1")).await.expect("cleanup");
    assert_eq!(archived, 1);
    assert!(open_parents(&repo, "u-1").await.is_empty());
}

#[tokio::test]
async fn structurally_corrupt_parent_skips_its_group_without_hiding_members() {
    let repo = Arc::new(MemoryNotificationRepo::default());
    let queries = NotificationQueryService::new(repo.clone());
    let service = AggregationService::new(repo.clone());

    seed(&queries, "u-1", "case-1", 2).await;
    service.aggregate_recipient(&recipient("u-1")).await.expect("run");

    // A dirty historical parent claiming to also be a child.
    let mut parent = open_parents(&repo, "u-1").await.remove(0);
    parent.is_child = true;
    repo.update(&parent).await.expect("corrupt");

    seed(&queries, "u-1", "case-1", 2).await;
    let report = service.aggregate_recipient(&recipient("u-1")).await.expect("rerun");
    assert_eq!(report.parents_created, 0);
    assert_eq!(report.parents_extended, 0);
    assert_eq!(report.groups_skipped, 1);

    // The new members were not swallowed: still visible, still ungrouped.
    let listed = queries
        .list(&recipient("u-1"), NotificationFilters::default())
        .await
        .expect("list");
    assert_eq!(
        listed
            .iter()
            .filter(|row| !row.is_parent && row.parent_id.is_none())
            .count(),
        2
    );
}

#[tokio::test]
async fn legacy_import_normalizes_and_reimports_clean() {
    let repo = Arc::new(MemoryNotificationRepo::default());
    let backfill = BackfillService::new(repo.clone());

    let legacy_row = |id: &str| LegacyNotificationRecord {
        id: id.to_string(),
        user_id: "client-1".into(),
        user_type: Some("client".into()),
        notification_type: Some(NOTIF_TYPE_DOCUMENT_REVIEW.into()),
        title: Some("Document reviewed".into()),
        message: Some("An old review.".into()),
        action_data: Some(json!({ "case_id": "case-a", "case_name": "TICPE 2023" })),
        created_at_ms: Some(1_000),
        ..LegacyNotificationRecord::default()
    };

    let mut archived = legacy_row("legacy-3");
    archived.is_read = Some(false);
    archived.archived_at_ms = Some(2_000);
    let mut nameless = legacy_row("");

    nameless.user_type = None;
    let rows = vec![
        legacy_row("legacy-1"),
        legacy_row("legacy-2"),
        archived,
        nameless,
    ];

    let first = backfill.import_legacy(rows.clone()).await.expect("import");
    assert_eq!(first.imported, 3);
    assert_eq!(first.skipped, 1);

    // The archival marker won over is_read=false.
    let archived_row = repo.get("legacy-3").await.expect("get").expect("row");
    assert_eq!(archived_row.status, NotificationStatus::Archived);

    // Restarting the import only skips what is already there.
    let second = backfill.import_legacy(rows).await.expect("reimport");
    assert_eq!(second.imported, 0);
    assert_eq!(second.already_present, 3);

    // The two unread legacy rows then fold like any other children.
    let report = backfill.run().await.expect("backfill");
    assert_eq!(report.parents_created, 1);
    assert_eq!(report.children_linked, 2);
}

#[tokio::test]
async fn backfill_covers_all_recipients_and_reruns_clean() {
    let repo = Arc::new(MemoryNotificationRepo::default());
    let queries = NotificationQueryService::new(repo.clone());
    let backfill = BackfillService::new(repo.clone());

    seed(&queries, "client-1", "case-a", 3).await;
    seed(&queries, "client-2", "case-b", 2).await;
    seed(&queries, "client-2", "case-c", 1).await;

    let first = backfill.run().await.expect("backfill");
    assert_eq!(first.recipients_processed, 2);
    assert_eq!(first.parents_created, 2);
    assert_eq!(first.children_linked, 5);
    assert_eq!(first.singletons_left, 1);
    assert_eq!(first.recipients_failed, 0);

    let second = backfill.run().await.expect("rerun");
    assert_eq!(second.parents_created, 0);
    assert_eq!(second.parents_extended, 0);
    assert_eq!(second.children_linked, 0);
}
