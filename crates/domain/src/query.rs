use std::collections::HashMap;
use std::sync::Arc;

use crate::DomainResult;
use crate::error::DomainError;
use crate::identity::Recipient;
use crate::notifications::{
    Notification, NotificationIngest, NotificationPriority, NotificationStatus, target_entity_id,
};
use crate::ports::notifications::NotificationRepository;
use crate::util::now_ms;

const DEFAULT_LIMIT: usize = 20;
const MAX_LIMIT: usize = 100;

/// Bucket name for rows without an extractable target entity.
pub const UNGROUPED_BUCKET: &str = "ungrouped";

#[derive(Clone, Debug, Default)]
pub struct NotificationFilters {
    /// `None` means "everything except archived"; ask for
    /// `Some(Archived)` explicitly to see archived rows.
    pub status: Option<NotificationStatus>,
    pub notification_type: Option<String>,
    pub priority: Option<NotificationPriority>,
    pub search: Option<String>,
    pub from_ms: Option<i64>,
    pub to_ms: Option<i64>,
    /// Collapse near-duplicate rows (same recipient, type and target/case/
    /// document references) to the newest one before paginating.
    pub dedupe: bool,
    pub limit: Option<usize>,
    pub offset: usize,
}

#[derive(Clone)]
pub struct NotificationQueryService {
    repository: Arc<dyn NotificationRepository>,
}

impl NotificationQueryService {
    pub fn new(repository: Arc<dyn NotificationRepository>) -> Self {
        Self { repository }
    }

    /// Persist a raw producer event as an ungrouped child row. A replayed
    /// event (same recipient and dedupe key) returns the original row.
    pub async fn ingest(&self, input: NotificationIngest) -> DomainResult<Notification> {
        validate_ingest(&input)?;
        let now = now_ms();
        let dedupe_key = input.dedupe_key.unwrap_or_else(|| {
            format!("{}:{}", input.notification_type, input.request_id)
        });
        let notification = Notification {
            notification_id: crate::util::uuid_v7_without_dashes(),
            user_id: input.user_id,
            role: input.role,
            notification_type: input.notification_type,
            title: input.title,
            message: input.message,
            priority: input.priority,
            status: NotificationStatus::Unread,
            read_at_ms: None,
            archived_at_ms: None,
            action_url: input.action_url,
            action_data: input.action_data,
            metadata: input.metadata,
            is_parent: false,
            is_child: false,
            parent_id: None,
            hidden_in_list: false,
            children_count: 0,
            dedupe_key,
            request_id: input.request_id,
            correlation_id: input.correlation_id,
            created_at_ms: input.created_at_ms.unwrap_or(now),
            updated_at_ms: now,
        };

        match self.repository.create(&notification).await {
            Ok(notification) => Ok(notification),
            Err(DomainError::Conflict) => self
                .repository
                .get_by_dedupe_key(&notification.user_id, &notification.dedupe_key)
                .await?
                .ok_or(DomainError::Conflict),
            Err(err) => Err(err),
        }
    }

    /// Filtered page of a recipient's visible rows, newest first. Hidden
    /// children never appear; archived rows only when asked for.
    pub async fn list(
        &self,
        recipient: &Recipient,
        filters: NotificationFilters,
    ) -> DomainResult<Vec<Notification>> {
        let limit = normalize_limit(filters.limit)?;
        let mut rows = self
            .repository
            .list_visible(&recipient.user_id, recipient.role)
            .await?;

        rows.retain(|row| matches_filters(row, &filters));
        if filters.dedupe {
            rows = deduplicate(rows);
        } else {
            rows.sort_by(|a, b| {
                b.created_at_ms
                    .cmp(&a.created_at_ms)
                    .then_with(|| b.notification_id.cmp(&a.notification_id))
            });
        }

        Ok(rows
            .into_iter()
            .skip(filters.offset)
            .take(limit)
            .collect())
    }

    /// Recipient-scoped read transition; already-read rows replay cleanly.
    pub async fn mark_as_read(
        &self,
        recipient: &Recipient,
        notification_id: &str,
    ) -> DomainResult<Notification> {
        let notification = self
            .repository
            .get(notification_id)
            .await?
            .ok_or(DomainError::NotFound)?;
        if notification.user_id != recipient.user_id {
            return Err(DomainError::Forbidden(
                "notification belongs to another user".into(),
            ));
        }
        if notification.status != NotificationStatus::Unread {
            return Ok(notification);
        }
        self.repository.mark_as_read(notification_id, now_ms()).await
    }

    pub async fn unread_count(&self, recipient: &Recipient) -> DomainResult<usize> {
        self.repository.unread_count(&recipient.user_id).await
    }
}

fn normalize_limit(limit: Option<usize>) -> DomainResult<usize> {
    let limit = limit.unwrap_or(DEFAULT_LIMIT);
    if !(1..=MAX_LIMIT).contains(&limit) {
        Err(DomainError::Validation(format!(
            "limit must be between 1 and {MAX_LIMIT}"
        )))
    } else {
        Ok(limit)
    }
}

fn matches_filters(notification: &Notification, filters: &NotificationFilters) -> bool {
    let status_ok = match filters.status {
        Some(status) => notification.status == status,
        None => notification.status != NotificationStatus::Archived,
    };
    status_ok
        && filters
            .notification_type
            .as_deref()
            .is_none_or(|kind| notification.notification_type == kind)
        && filters
            .priority
            .is_none_or(|priority| notification.priority == priority)
        && filters
            .search
            .as_deref()
            .is_none_or(|query| matches_search(notification, query))
        && filters
            .from_ms
            .is_none_or(|from| notification.created_at_ms >= from)
        && filters
            .to_ms
            .is_none_or(|to| notification.created_at_ms <= to)
}

fn matches_search(notification: &Notification, query: &str) -> bool {
    let query = query.to_lowercase();
    notification.title.to_lowercase().contains(&query)
        || notification.message.to_lowercase().contains(&query)
}

/// Collapse near-duplicate rows written for the same underlying occurrence,
/// keeping the newest per composite key. The accumulator is local to the
/// call — result sets are request-scoped, so a process-wide seen-set would
/// only grow stale.
pub fn deduplicate(notifications: Vec<Notification>) -> Vec<Notification> {
    let mut best: HashMap<String, Notification> = HashMap::new();
    for notification in notifications {
        let key = dedup_key(&notification);
        match best.get(&key) {
            Some(existing) if existing.created_at_ms >= notification.created_at_ms => {}
            _ => {
                best.insert(key, notification);
            }
        }
    }
    let mut rows = best.into_values().collect::<Vec<_>>();
    rows.sort_by(|a, b| {
        b.created_at_ms
            .cmp(&a.created_at_ms)
            .then_with(|| b.notification_id.cmp(&a.notification_id))
    });
    rows
}

fn dedup_key(notification: &Notification) -> String {
    let target = target_entity_id(notification).unwrap_or_default();
    let case = payload_str(notification, "case_id");
    let document = payload_str(notification, "document_id");
    format!(
        "{}:{}:{}:{}:{}",
        notification.user_id, notification.notification_type, target, case, document
    )
}

fn payload_str(notification: &Notification, key: &str) -> String {
    notification
        .action_data
        .as_ref()
        .and_then(|value| value.get(key))
        .and_then(serde_json::Value::as_str)
        .unwrap_or_default()
        .to_string()
}

/// Partition rows by extracted target entity; rows without one land in the
/// `ungrouped` bucket and stay standalone. Each bucket is newest first.
/// This is the direct input to the aggregation engine.
pub fn group_by_target_entity(
    notifications: Vec<Notification>,
) -> HashMap<String, Vec<Notification>> {
    let mut groups: HashMap<String, Vec<Notification>> = HashMap::new();
    for notification in notifications {
        let bucket =
            target_entity_id(&notification).unwrap_or_else(|| UNGROUPED_BUCKET.to_string());
        groups.entry(bucket).or_default().push(notification);
    }
    for bucket in groups.values_mut() {
        bucket.sort_by(|a, b| {
            b.created_at_ms
                .cmp(&a.created_at_ms)
                .then_with(|| b.notification_id.cmp(&a.notification_id))
        });
    }
    groups
}

fn validate_ingest(input: &NotificationIngest) -> DomainResult<()> {
    if input.user_id.trim().is_empty() {
        return Err(DomainError::Validation("user_id is required".into()));
    }
    if input.notification_type.trim().is_empty() {
        return Err(DomainError::Validation(
            "notification_type is required".into(),
        ));
    }
    if input.title.trim().is_empty() {
        return Err(DomainError::Validation("title is required".into()));
    }
    if input.message.trim().is_empty() {
        return Err(DomainError::Validation("message is required".into()));
    }
    Ok(())
}
