use std::collections::HashMap;
use std::sync::Arc;

use fiscalis_domain::DomainResult;
use fiscalis_domain::content_hash::ContentId;
use fiscalis_domain::error::DomainError;
use fiscalis_domain::identity::{Recipient, RecipientRole};
use fiscalis_domain::messages::{CampaignMessage, CancelReason, MessageStatus};
use fiscalis_domain::notifications::{Notification, NotificationStatus, target_entity_id};
use fiscalis_domain::ports::BoxFuture;
use fiscalis_domain::ports::messages::MessageRepository;
use fiscalis_domain::ports::notifications::NotificationRepository;
use tokio::sync::RwLock;

/// Development/test backend. The write path takes the map's write lock for
/// the whole check-then-insert, which is what makes the natural-key
/// uniqueness race-free on this backend.
#[derive(Default)]
pub struct InMemoryMessageRepository {
    rows: Arc<RwLock<HashMap<String, CampaignMessage>>>,
}

impl InMemoryMessageRepository {
    pub fn new() -> Self {
        Self::default()
    }

    fn occupies_slot(row: &CampaignMessage, prospect_id: &str, content_id: &ContentId) -> bool {
        row.prospect_id == prospect_id
            && &row.content_id == content_id
            && row.status.is_live()
            && !row.archived_as_duplicate
    }
}

impl MessageRepository for InMemoryMessageRepository {
    fn create(&self, message: &CampaignMessage) -> BoxFuture<'_, DomainResult<CampaignMessage>> {
        let message = message.clone();
        let rows = self.rows.clone();
        Box::pin(async move {
            let mut rows = rows.write().await;
            if rows.contains_key(&message.message_id) {
                return Err(DomainError::Conflict);
            }
            if rows
                .values()
                .any(|row| Self::occupies_slot(row, &message.prospect_id, &message.content_id))
            {
                return Err(DomainError::Conflict);
            }
            rows.insert(message.message_id.clone(), message.clone());
            Ok(message)
        })
    }

    fn get(&self, message_id: &str) -> BoxFuture<'_, DomainResult<Option<CampaignMessage>>> {
        let message_id = message_id.to_string();
        let rows = self.rows.clone();
        Box::pin(async move { Ok(rows.read().await.get(&message_id).cloned()) })
    }

    fn find_sent_by_content(
        &self,
        prospect_id: &str,
        content_id: &ContentId,
    ) -> BoxFuture<'_, DomainResult<Vec<CampaignMessage>>> {
        let prospect_id = prospect_id.to_string();
        let content_id = content_id.clone();
        let rows = self.rows.clone();
        Box::pin(async move {
            Ok(rows
                .read()
                .await
                .values()
                .filter(|row| {
                    row.prospect_id == prospect_id
                        && row.content_id == content_id
                        && row.status == MessageStatus::Sent
                        && !row.archived_as_duplicate
                })
                .cloned()
                .collect())
        })
    }

    fn find_live_by_content(
        &self,
        prospect_id: &str,
        content_ids: &[ContentId],
    ) -> BoxFuture<'_, DomainResult<Vec<CampaignMessage>>> {
        let prospect_id = prospect_id.to_string();
        let content_ids = content_ids.to_vec();
        let rows = self.rows.clone();
        Box::pin(async move {
            Ok(rows
                .read()
                .await
                .values()
                .filter(|row| {
                    row.prospect_id == prospect_id
                        && content_ids.contains(&row.content_id)
                        && row.status.is_live()
                        && !row.archived_as_duplicate
                })
                .cloned()
                .collect())
        })
    }

    fn list_by_sequence(
        &self,
        prospect_id: &str,
        sequence_id: &str,
    ) -> BoxFuture<'_, DomainResult<Vec<CampaignMessage>>> {
        let prospect_id = prospect_id.to_string();
        let sequence_id = sequence_id.to_string();
        let rows = self.rows.clone();
        Box::pin(async move {
            let mut matches = rows
                .read()
                .await
                .values()
                .filter(|row| {
                    row.prospect_id == prospect_id
                        && row.sequence_id.as_deref() == Some(sequence_id.as_str())
                })
                .cloned()
                .collect::<Vec<_>>();
            matches.sort_by_key(|row| row.step);
            Ok(matches)
        })
    }

    fn mark_sent(
        &self,
        message_id: &str,
        sent_at_ms: i64,
    ) -> BoxFuture<'_, DomainResult<CampaignMessage>> {
        let message_id = message_id.to_string();
        let rows = self.rows.clone();
        Box::pin(async move {
            let mut rows = rows.write().await;
            let row = rows.get_mut(&message_id).ok_or(DomainError::NotFound)?;
            row.status = MessageStatus::Sent;
            row.sent_at_ms = Some(sent_at_ms);
            row.updated_at_ms = sent_at_ms;
            Ok(row.clone())
        })
    }

    fn cancel(
        &self,
        message_id: &str,
        reason: CancelReason,
        cancelled_at_ms: i64,
    ) -> BoxFuture<'_, DomainResult<CampaignMessage>> {
        let message_id = message_id.to_string();
        let rows = self.rows.clone();
        Box::pin(async move {
            let mut rows = rows.write().await;
            let row = rows.get_mut(&message_id).ok_or(DomainError::NotFound)?;
            row.status = MessageStatus::Cancelled;
            row.cancel_reason = Some(reason);
            row.cancelled_at_ms = Some(cancelled_at_ms);
            row.updated_at_ms = cancelled_at_ms;
            Ok(row.clone())
        })
    }

    fn archive_as_duplicate(
        &self,
        message_id: &str,
        duplicate_of: &str,
        updated_at_ms: i64,
    ) -> BoxFuture<'_, DomainResult<CampaignMessage>> {
        let message_id = message_id.to_string();
        let duplicate_of = duplicate_of.to_string();
        let rows = self.rows.clone();
        Box::pin(async move {
            let mut rows = rows.write().await;
            let row = rows.get_mut(&message_id).ok_or(DomainError::NotFound)?;
            row.archived_as_duplicate = true;
            row.duplicate_of = Some(duplicate_of);
            row.updated_at_ms = updated_at_ms;
            Ok(row.clone())
        })
    }
}

#[derive(Default)]
pub struct InMemoryNotificationRepository {
    rows: Arc<RwLock<HashMap<String, Notification>>>,
}

impl InMemoryNotificationRepository {
    pub fn new() -> Self {
        Self::default()
    }

    fn is_ungrouped(row: &Notification) -> bool {
        !row.is_parent
            && !row.is_child
            && row.parent_id.is_none()
            && row.status == NotificationStatus::Unread
    }
}

impl NotificationRepository for InMemoryNotificationRepository {
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
                .filter(|row| row.user_id == user_id && row.role == role && Self::is_ungrouped(row))
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
            if row.status == NotificationStatus::Unread {
                row.status = NotificationStatus::Read;
                row.read_at_ms = Some(read_at_ms);
                row.updated_at_ms = read_at_ms;
            }
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
