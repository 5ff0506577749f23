use std::sync::Arc;

use fiscalis_domain::DomainResult;
use fiscalis_domain::content_hash::ContentId;
use fiscalis_domain::error::DomainError;
use fiscalis_domain::identity::{Recipient, RecipientRole};
use fiscalis_domain::messages::{CampaignMessage, CancelReason, MessageStatus};
use fiscalis_domain::notifications::{
    Notification, NotificationPriority, NotificationStatus, target_entity_id,
};
use fiscalis_domain::ports::BoxFuture;
use fiscalis_domain::ports::messages::MessageRepository;
use fiscalis_domain::ports::notifications::NotificationRepository;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use surrealdb::{
    Surreal,
    engine::remote::ws::{Client, Ws},
    opt::auth::Root,
};
use time::{OffsetDateTime, format_description::well_known::Rfc3339};

use crate::db::DbConfig;

const MESSAGE_FIELDS: &str = "message_id, prospect_id, subject, body, content_id, sequence_id, \
     step, status, \
     IF scheduled_for = NONE { NONE } ELSE { <string>scheduled_for } AS scheduled_for, \
     IF sent_at = NONE { NONE } ELSE { <string>sent_at } AS sent_at, \
     IF cancelled_at = NONE { NONE } ELSE { <string>cancelled_at } AS cancelled_at, \
     cancel_reason, duplicate_of, archived_as_duplicate, request_id, correlation_id, \
     <string>created_at AS created_at, <string>updated_at AS updated_at";

const NOTIFICATION_FIELDS: &str = "notification_id, user_id, role, notification_type, title, \
     message, priority, status, \
     IF read_at = NONE { NONE } ELSE { <string>read_at } AS read_at, \
     IF archived_at = NONE { NONE } ELSE { <string>archived_at } AS archived_at, \
     action_url, action_data, metadata, is_parent, is_child, parent_id, hidden_in_list, \
     children_count, dedupe_key, request_id, correlation_id, \
     <string>created_at AS created_at, <string>updated_at AS updated_at";

async fn connect(db_config: &DbConfig) -> anyhow::Result<Arc<Surreal<Client>>> {
    let db = Surreal::<Client>::init();
    db.connect::<Ws>(&db_config.endpoint).await?;
    db.signin(Root {
        username: &db_config.username,
        password: &db_config.password,
    })
    .await?;
    db.use_ns(&db_config.namespace)
        .use_db(&db_config.database)
        .await?;
    Ok(Arc::new(db))
}

fn parse_rfc3339(value: &str) -> DomainResult<i64> {
    let dt = OffsetDateTime::parse(value, &Rfc3339)
        .map_err(|err| DomainError::Validation(format!("invalid timestamp: {err}")))?;
    Ok((dt.unix_timestamp_nanos() / 1_000_000) as i64)
}

fn to_rfc3339(epoch_ms: i64) -> DomainResult<String> {
    let dt = OffsetDateTime::from_unix_timestamp_nanos(epoch_ms as i128 * 1_000_000)
        .map_err(|err| DomainError::Validation(format!("invalid ms timestamp: {err}")))?;
    Ok(dt
        .format(&Rfc3339)
        .unwrap_or_else(|_| "1970-01-01T00:00:00Z".to_string()))
}

fn map_surreal_error(err: surrealdb::Error) -> DomainError {
    let error_message = err.to_string().to_lowercase();
    if error_message.contains("conflict")
        || error_message.contains("already exists")
        || error_message.contains("duplicate")
        || error_message.contains("unique")
    {
        return DomainError::Conflict;
    }
    if error_message.contains("connection") || error_message.contains("websocket") {
        return DomainError::Unavailable(format!("surreal unreachable: {error_message}"));
    }
    DomainError::Validation(format!("surreal query failed: {error_message}"))
}

pub struct SurrealMessageRepository {
    client: Arc<Surreal<Client>>,
}

impl SurrealMessageRepository {
    pub fn with_client(client: Arc<Surreal<Client>>) -> Self {
        Self { client }
    }

    pub async fn new(db_config: &DbConfig) -> anyhow::Result<Self> {
        Ok(Self {
            client: connect(db_config).await?,
        })
    }

    fn decode_rows(rows: Vec<Value>) -> DomainResult<Vec<CampaignMessage>> {
        rows.into_iter()
            .map(|row| {
                let row = serde_json::from_value::<SurrealMessageRow>(row).map_err(|err| {
                    DomainError::Validation(format!("invalid campaign message row: {err}"))
                })?;
                Ok(CampaignMessage {
                    message_id: row.message_id,
                    prospect_id: row.prospect_id,
                    subject: row.subject,
                    body: row.body,
                    content_id: ContentId::from_stored(row.content_id),
                    sequence_id: row.sequence_id,
                    step: row.step,
                    status: row.status.parse::<MessageStatus>().map_err(|()| {
                        DomainError::Validation(format!("invalid message status '{}'", row.status))
                    })?,
                    scheduled_for_ms: row.scheduled_for.as_deref().map(parse_rfc3339).transpose()?,
                    sent_at_ms: row.sent_at.as_deref().map(parse_rfc3339).transpose()?,
                    cancelled_at_ms: row.cancelled_at.as_deref().map(parse_rfc3339).transpose()?,
                    cancel_reason: row
                        .cancel_reason
                        .as_deref()
                        .map(|reason| {
                            reason.parse::<CancelReason>().map_err(|()| {
                                DomainError::Validation(format!(
                                    "invalid cancel reason '{reason}'"
                                ))
                            })
                        })
                        .transpose()?,
                    duplicate_of: row.duplicate_of,
                    archived_as_duplicate: row.archived_as_duplicate,
                    request_id: row.request_id,
                    correlation_id: row.correlation_id,
                    created_at_ms: parse_rfc3339(&row.created_at)?,
                    updated_at_ms: parse_rfc3339(&row.updated_at)?,
                })
            })
            .collect()
    }

    async fn select_one(&self, message_id: String) -> DomainResult<Option<CampaignMessage>> {
        let mut response = self
            .client
            .query(format!(
                "SELECT {MESSAGE_FIELDS} FROM campaign_message \
                 WHERE message_id = $message_id LIMIT 1"
            ))
            .bind(("message_id", message_id))
            .await
            .map_err(map_surreal_error)?;
        let rows: Vec<Value> = response
            .take(0)
            .map_err(|err| DomainError::Validation(format!("invalid query result: {err}")))?;
        Ok(Self::decode_rows(rows)?.pop())
    }
}

#[derive(Debug, Deserialize)]
struct SurrealMessageRow {
    message_id: String,
    prospect_id: String,
    subject: String,
    body: String,
    content_id: String,
    sequence_id: Option<String>,
    step: Option<u32>,
    status: String,
    scheduled_for: Option<String>,
    sent_at: Option<String>,
    cancelled_at: Option<String>,
    cancel_reason: Option<String>,
    duplicate_of: Option<String>,
    archived_as_duplicate: bool,
    request_id: String,
    correlation_id: String,
    created_at: String,
    updated_at: String,
}

impl MessageRepository for SurrealMessageRepository {
    fn create(&self, message: &CampaignMessage) -> BoxFuture<'_, DomainResult<CampaignMessage>> {
        let message = message.clone();
        Box::pin(async move {
            let created_at = to_rfc3339(message.created_at_ms)?;
            let updated_at = to_rfc3339(message.updated_at_ms)?;
            let scheduled_for = message.scheduled_for_ms.map(to_rfc3339).transpose()?;

            // Conditional write: the content-slot check and the insert run in
            // one transaction, which is what closes the check-then-act race
            // on this backend.
            let mut query = String::from(
                "BEGIN TRANSACTION; \
                 LET $existing = (SELECT message_id FROM campaign_message \
                     WHERE prospect_id = $prospect_id \
                       AND content_id = $content_id \
                       AND status IN ['scheduled', 'sent'] \
                       AND archived_as_duplicate = false); \
                 IF array::len($existing) > 0 { THROW 'conflict: content slot occupied' }; \
                 CREATE campaign_message SET \
                     message_id = $message_id, \
                     prospect_id = $prospect_id, \
                     subject = $subject, \
                     body = $body, \
                     content_id = $content_id, \
                     sequence_id = $sequence_id, \
                     step = $step, \
                     status = $status, \
                     sent_at = NONE, \
                     cancelled_at = NONE, \
                     cancel_reason = NONE, \
                     duplicate_of = NONE, \
                     archived_as_duplicate = $archived_as_duplicate, \
                     request_id = $request_id, \
                     correlation_id = $correlation_id, \
                     created_at = <datetime>$created_at, \
                     updated_at = <datetime>$updated_at",
            );
            if scheduled_for.is_some() {
                query.push_str(", scheduled_for = <datetime>$scheduled_for");
            } else {
                query.push_str(", scheduled_for = NONE");
            }
            query.push_str("; COMMIT TRANSACTION;");

            let mut pending = self.client.query(&query);
            pending = pending.bind(("message_id", message.message_id.clone()));
            pending = pending.bind(("prospect_id", message.prospect_id.clone()));
            pending = pending.bind(("subject", message.subject.clone()));
            pending = pending.bind(("body", message.body.clone()));
            pending = pending.bind(("content_id", message.content_id.as_str().to_string()));
            pending = pending.bind(("sequence_id", message.sequence_id.clone()));
            pending = pending.bind(("step", message.step.map(i64::from)));
            pending = pending.bind(("status", message.status.as_str()));
            pending = pending.bind(("archived_as_duplicate", message.archived_as_duplicate));
            pending = pending.bind(("request_id", message.request_id.clone()));
            pending = pending.bind(("correlation_id", message.correlation_id.clone()));
            pending = pending.bind(("created_at", created_at));
            pending = pending.bind(("updated_at", updated_at));
            if let Some(scheduled_for) = scheduled_for {
                pending = pending.bind(("scheduled_for", scheduled_for));
            }
            pending.await.map_err(map_surreal_error)?;

            self.select_one(message.message_id.clone())
                .await?
                .ok_or_else(|| DomainError::Validation("create returned no row".to_string()))
        })
    }

    fn get(&self, message_id: &str) -> BoxFuture<'_, DomainResult<Option<CampaignMessage>>> {
        let message_id = message_id.to_string();
        Box::pin(async move { self.select_one(message_id).await })
    }

    fn find_sent_by_content(
        &self,
        prospect_id: &str,
        content_id: &ContentId,
    ) -> BoxFuture<'_, DomainResult<Vec<CampaignMessage>>> {
        let prospect_id = prospect_id.to_string();
        let content_id = content_id.as_str().to_string();
        Box::pin(async move {
            let mut response = self
                .client
                .query(format!(
                    "SELECT {MESSAGE_FIELDS} FROM campaign_message \
                     WHERE prospect_id = $prospect_id \
                       AND content_id = $content_id \
                       AND status = 'sent' \
                       AND archived_as_duplicate = false \
                     ORDER BY sent_at DESC"
                ))
                .bind(("prospect_id", prospect_id))
                .bind(("content_id", content_id))
                .await
                .map_err(map_surreal_error)?;
            let rows: Vec<Value> = response
                .take(0)
                .map_err(|err| DomainError::Validation(format!("invalid query result: {err}")))?;
            Self::decode_rows(rows)
        })
    }

    fn find_live_by_content(
        &self,
        prospect_id: &str,
        content_ids: &[ContentId],
    ) -> BoxFuture<'_, DomainResult<Vec<CampaignMessage>>> {
        let prospect_id = prospect_id.to_string();
        let content_ids = content_ids
            .iter()
            .map(|content_id| content_id.as_str().to_string())
            .collect::<Vec<_>>();
        Box::pin(async move {
            let mut response = self
                .client
                .query(format!(
                    "SELECT {MESSAGE_FIELDS} FROM campaign_message \
                     WHERE prospect_id = $prospect_id \
                       AND content_id INSIDE $content_ids \
                       AND status IN ['scheduled', 'sent'] \
                       AND archived_as_duplicate = false"
                ))
                .bind(("prospect_id", prospect_id))
                .bind(("content_ids", content_ids))
                .await
                .map_err(map_surreal_error)?;
            let rows: Vec<Value> = response
                .take(0)
                .map_err(|err| DomainError::Validation(format!("invalid query result: {err}")))?;
            Self::decode_rows(rows)
        })
    }

    fn list_by_sequence(
        &self,
        prospect_id: &str,
        sequence_id: &str,
    ) -> BoxFuture<'_, DomainResult<Vec<CampaignMessage>>> {
        let prospect_id = prospect_id.to_string();
        let sequence_id = sequence_id.to_string();
        Box::pin(async move {
            let mut response = self
                .client
                .query(format!(
                    "SELECT {MESSAGE_FIELDS} FROM campaign_message \
                     WHERE prospect_id = $prospect_id \
                       AND sequence_id = $sequence_id \
                     ORDER BY step ASC"
                ))
                .bind(("prospect_id", prospect_id))
                .bind(("sequence_id", sequence_id))
                .await
                .map_err(map_surreal_error)?;
            let rows: Vec<Value> = response
                .take(0)
                .map_err(|err| DomainError::Validation(format!("invalid query result: {err}")))?;
            Self::decode_rows(rows)
        })
    }

    fn mark_sent(
        &self,
        message_id: &str,
        sent_at_ms: i64,
    ) -> BoxFuture<'_, DomainResult<CampaignMessage>> {
        let message_id = message_id.to_string();
        Box::pin(async move {
            let sent_at = to_rfc3339(sent_at_ms)?;
            self.client
                .query(
                    "UPDATE campaign_message SET \
                         status = 'sent', \
                         sent_at = <datetime>$sent_at, \
                         updated_at = <datetime>$sent_at \
                     WHERE message_id = $message_id",
                )
                .bind(("message_id", message_id.clone()))
                .bind(("sent_at", sent_at))
                .await
                .map_err(map_surreal_error)?;
            self.select_one(message_id)
                .await?
                .ok_or(DomainError::NotFound)
        })
    }

    fn cancel(
        &self,
        message_id: &str,
        reason: CancelReason,
        cancelled_at_ms: i64,
    ) -> BoxFuture<'_, DomainResult<CampaignMessage>> {
        let message_id = message_id.to_string();
        Box::pin(async move {
            let cancelled_at = to_rfc3339(cancelled_at_ms)?;
            self.client
                .query(
                    "UPDATE campaign_message SET \
                         status = 'cancelled', \
                         cancel_reason = $cancel_reason, \
                         cancelled_at = <datetime>$cancelled_at, \
                         updated_at = <datetime>$cancelled_at \
                     WHERE message_id = $message_id",
                )
                .bind(("message_id", message_id.clone()))
                .bind(("cancel_reason", reason.as_str()))
                .bind(("cancelled_at", cancelled_at))
                .await
                .map_err(map_surreal_error)?;
            self.select_one(message_id)
                .await?
                .ok_or(DomainError::NotFound)
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
        Box::pin(async move {
            let updated_at = to_rfc3339(updated_at_ms)?;
            self.client
                .query(
                    "UPDATE campaign_message SET \
                         archived_as_duplicate = true, \
                         duplicate_of = $duplicate_of, \
                         updated_at = <datetime>$updated_at \
                     WHERE message_id = $message_id",
                )
                .bind(("message_id", message_id.clone()))
                .bind(("duplicate_of", duplicate_of))
                .bind(("updated_at", updated_at))
                .await
                .map_err(map_surreal_error)?;
            self.select_one(message_id)
                .await?
                .ok_or(DomainError::NotFound)
        })
    }
}

pub struct SurrealNotificationRepository {
    client: Arc<Surreal<Client>>,
}

impl SurrealNotificationRepository {
    pub fn with_client(client: Arc<Surreal<Client>>) -> Self {
        Self { client }
    }

    pub async fn new(db_config: &DbConfig) -> anyhow::Result<Self> {
        Ok(Self {
            client: connect(db_config).await?,
        })
    }

    fn decode_rows(rows: Vec<Value>) -> DomainResult<Vec<Notification>> {
        rows.into_iter()
            .map(|row| {
                let row = serde_json::from_value::<SurrealNotificationRow>(row).map_err(|err| {
                    DomainError::Validation(format!("invalid notification row: {err}"))
                })?;
                Ok(Notification {
                    notification_id: row.notification_id,
                    user_id: row.user_id,
                    role: RecipientRole::parse(&row.role).ok_or_else(|| {
                        DomainError::Validation(format!("invalid recipient role '{}'", row.role))
                    })?,
                    notification_type: row.notification_type,
                    title: row.title,
                    message: row.message,
                    priority: NotificationPriority::parse(&row.priority).ok_or_else(|| {
                        DomainError::Validation(format!("invalid priority '{}'", row.priority))
                    })?,
                    status: NotificationStatus::parse(&row.status).ok_or_else(|| {
                        DomainError::Validation(format!("invalid status '{}'", row.status))
                    })?,
                    read_at_ms: row.read_at.as_deref().map(parse_rfc3339).transpose()?,
                    archived_at_ms: row.archived_at.as_deref().map(parse_rfc3339).transpose()?,
                    action_url: row.action_url,
                    action_data: row.action_data,
                    metadata: row.metadata,
                    is_parent: row.is_parent,
                    is_child: row.is_child,
                    parent_id: row.parent_id,
                    hidden_in_list: row.hidden_in_list,
                    children_count: row.children_count,
                    dedupe_key: row.dedupe_key,
                    request_id: row.request_id,
                    correlation_id: row.correlation_id,
                    created_at_ms: parse_rfc3339(&row.created_at)?,
                    updated_at_ms: parse_rfc3339(&row.updated_at)?,
                })
            })
            .collect()
    }

    async fn select_one(&self, notification_id: String) -> DomainResult<Option<Notification>> {
        let mut response = self
            .client
            .query(format!(
                "SELECT {NOTIFICATION_FIELDS} FROM notification \
                 WHERE notification_id = $notification_id LIMIT 1"
            ))
            .bind(("notification_id", notification_id))
            .await
            .map_err(map_surreal_error)?;
        let rows: Vec<Value> = response
            .take(0)
            .map_err(|err| DomainError::Validation(format!("invalid query result: {err}")))?;
        Ok(Self::decode_rows(rows)?.pop())
    }

    async fn select_many(
        &self,
        query: String,
        bindings: Vec<(&'static str, Value)>,
    ) -> DomainResult<Vec<Notification>> {
        let mut pending = self.client.query(query);
        for (name, value) in bindings {
            pending = pending.bind((name, value));
        }
        let mut response = pending.await.map_err(map_surreal_error)?;
        let rows: Vec<Value> = response
            .take(0)
            .map_err(|err| DomainError::Validation(format!("invalid query result: {err}")))?;
        Self::decode_rows(rows)
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct SurrealNotificationRow {
    notification_id: String,
    user_id: String,
    role: String,
    notification_type: String,
    title: String,
    message: String,
    priority: String,
    status: String,
    read_at: Option<String>,
    archived_at: Option<String>,
    action_url: Option<String>,
    action_data: Option<Value>,
    metadata: Option<Value>,
    is_parent: bool,
    is_child: bool,
    parent_id: Option<String>,
    hidden_in_list: bool,
    children_count: u32,
    dedupe_key: String,
    request_id: String,
    correlation_id: String,
    created_at: String,
    updated_at: String,
}

impl NotificationRepository for SurrealNotificationRepository {
    fn create(&self, notification: &Notification) -> BoxFuture<'_, DomainResult<Notification>> {
        let notification = notification.clone();
        Box::pin(async move {
            let created_at = to_rfc3339(notification.created_at_ms)?;
            let updated_at = to_rfc3339(notification.updated_at_ms)?;
            let target = target_entity_id(&notification);

            // One transaction per natural key: open-parent uniqueness for
            // parents, dedupe-key replay protection for everything else.
            let guard_clause = if notification.is_parent {
                "LET $existing = (SELECT notification_id FROM notification \
                     WHERE user_id = $user_id \
                       AND is_parent = true \
                       AND status = 'unread' \
                       AND target_entity_id = $target_entity_id); \
                 IF array::len($existing) > 0 { THROW 'conflict: open parent exists' }; "
            } else {
                "LET $existing = (SELECT notification_id FROM notification \
                     WHERE user_id = $user_id AND dedupe_key = $dedupe_key); \
                 IF array::len($existing) > 0 { THROW 'conflict: dedupe key taken' }; "
            };
            let query = format!(
                "BEGIN TRANSACTION; \
                 {guard_clause}\
                 CREATE notification SET \
                     notification_id = $notification_id, \
                     user_id = $user_id, \
                     role = $role, \
                     notification_type = $notification_type, \
                     title = $title, \
                     message = $message, \
                     priority = $priority, \
                     status = $status, \
                     read_at = NONE, \
                     archived_at = NONE, \
                     action_url = $action_url, \
                     action_data = $action_data, \
                     metadata = $metadata, \
                     is_parent = $is_parent, \
                     is_child = $is_child, \
                     parent_id = $parent_id, \
                     hidden_in_list = $hidden_in_list, \
                     children_count = $children_count, \
                     dedupe_key = $dedupe_key, \
                     target_entity_id = $target_entity_id, \
                     request_id = $request_id, \
                     correlation_id = $correlation_id, \
                     created_at = <datetime>$created_at, \
                     updated_at = <datetime>$updated_at; \
                 COMMIT TRANSACTION;"
            );

            let mut pending = self.client.query(query);
            pending = pending.bind(("notification_id", notification.notification_id.clone()));
            pending = pending.bind(("user_id", notification.user_id.clone()));
            pending = pending.bind(("role", notification.role.as_str()));
            pending = pending.bind((
                "notification_type",
                notification.notification_type.clone(),
            ));
            pending = pending.bind(("title", notification.title.clone()));
            pending = pending.bind(("message", notification.message.clone()));
            pending = pending.bind(("priority", notification.priority.as_str()));
            pending = pending.bind(("status", notification.status.as_str()));
            pending = pending.bind(("action_url", notification.action_url.clone()));
            pending = pending.bind(("action_data", notification.action_data.clone()));
            pending = pending.bind(("metadata", notification.metadata.clone()));
            pending = pending.bind(("is_parent", notification.is_parent));
            pending = pending.bind(("is_child", notification.is_child));
            pending = pending.bind(("parent_id", notification.parent_id.clone()));
            pending = pending.bind(("hidden_in_list", notification.hidden_in_list));
            pending = pending.bind(("children_count", i64::from(notification.children_count)));
            pending = pending.bind(("dedupe_key", notification.dedupe_key.clone()));
            pending = pending.bind(("target_entity_id", target));
            pending = pending.bind(("request_id", notification.request_id.clone()));
            pending = pending.bind(("correlation_id", notification.correlation_id.clone()));
            pending = pending.bind(("created_at", created_at));
            pending = pending.bind(("updated_at", updated_at));
            pending.await.map_err(map_surreal_error)?;

            self.select_one(notification.notification_id.clone())
                .await?
                .ok_or_else(|| DomainError::Validation("create returned no row".to_string()))
        })
    }

    fn get(&self, notification_id: &str) -> BoxFuture<'_, DomainResult<Option<Notification>>> {
        let notification_id = notification_id.to_string();
        Box::pin(async move { self.select_one(notification_id).await })
    }

    fn get_by_dedupe_key(
        &self,
        user_id: &str,
        dedupe_key: &str,
    ) -> BoxFuture<'_, DomainResult<Option<Notification>>> {
        let user_id = user_id.to_string();
        let dedupe_key = dedupe_key.to_string();
        Box::pin(async move {
            Ok(self
                .select_many(
                    format!(
                        "SELECT {NOTIFICATION_FIELDS} FROM notification \
                         WHERE user_id = $user_id AND dedupe_key = $dedupe_key LIMIT 1"
                    ),
                    vec![
                        ("user_id", Value::String(user_id)),
                        ("dedupe_key", Value::String(dedupe_key)),
                    ],
                )
                .await?
                .pop())
        })
    }

    fn list_visible(
        &self,
        user_id: &str,
        role: RecipientRole,
    ) -> BoxFuture<'_, DomainResult<Vec<Notification>>> {
        let user_id = user_id.to_string();
        Box::pin(async move {
            self.select_many(
                format!(
                    "SELECT {NOTIFICATION_FIELDS} FROM notification \
                     WHERE user_id = $user_id AND role = $role AND hidden_in_list = false \
                     ORDER BY created_at DESC"
                ),
                vec![
                    ("user_id", Value::String(user_id)),
                    ("role", Value::String(role.as_str().to_string())),
                ],
            )
            .await
        })
    }

    fn list_ungrouped(
        &self,
        user_id: &str,
        role: RecipientRole,
    ) -> BoxFuture<'_, DomainResult<Vec<Notification>>> {
        let user_id = user_id.to_string();
        Box::pin(async move {
            self.select_many(
                format!(
                    "SELECT {NOTIFICATION_FIELDS} FROM notification \
                     WHERE user_id = $user_id AND role = $role \
                       AND is_parent = false AND is_child = false \
                       AND parent_id = NONE AND status = 'unread' \
                     ORDER BY created_at DESC"
                ),
                vec![
                    ("user_id", Value::String(user_id)),
                    ("role", Value::String(role.as_str().to_string())),
                ],
            )
            .await
        })
    }

    fn find_open_parent(
        &self,
        user_id: &str,
        target: &str,
    ) -> BoxFuture<'_, DomainResult<Option<Notification>>> {
        let user_id = user_id.to_string();
        let target = target.to_string();
        Box::pin(async move {
            Ok(self
                .select_many(
                    format!(
                        "SELECT {NOTIFICATION_FIELDS} FROM notification \
                         WHERE user_id = $user_id AND is_parent = true \
                           AND status = 'unread' AND target_entity_id = $target_entity_id \
                         LIMIT 1"
                    ),
                    vec![
                        ("user_id", Value::String(user_id)),
                        ("target_entity_id", Value::String(target)),
                    ],
                )
                .await?
                .pop())
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
        Box::pin(async move {
            let updated_at = to_rfc3339(updated_at_ms)?;
            let mut response = self
                .client
                .query(
                    "UPDATE notification SET \
                         parent_id = $parent_id, \
                         is_child = true, \
                         hidden_in_list = true, \
                         updated_at = <datetime>$updated_at \
                     WHERE notification_id INSIDE $child_ids \
                       AND parent_id != $parent_id \
                     RETURN AFTER",
                )
                .bind(("parent_id", parent_id))
                .bind(("child_ids", child_ids))
                .bind(("updated_at", updated_at))
                .await
                .map_err(map_surreal_error)?;
            let rows: Vec<Value> = response
                .take(0)
                .map_err(|err| DomainError::Validation(format!("invalid query result: {err}")))?;
            Ok(rows.len())
        })
    }

    fn list_children(&self, parent_id: &str) -> BoxFuture<'_, DomainResult<Vec<Notification>>> {
        let parent_id = parent_id.to_string();
        Box::pin(async move {
            self.select_many(
                format!(
                    "SELECT {NOTIFICATION_FIELDS} FROM notification \
                     WHERE parent_id = $parent_id ORDER BY created_at DESC"
                ),
                vec![("parent_id", Value::String(parent_id))],
            )
            .await
        })
    }

    fn count_unread_children(&self, parent_id: &str) -> BoxFuture<'_, DomainResult<usize>> {
        let parent_id = parent_id.to_string();
        Box::pin(async move {
            let mut response = self
                .client
                .query(
                    "SELECT count() AS total FROM notification \
                     WHERE parent_id = $parent_id AND status = 'unread' GROUP ALL",
                )
                .bind(("parent_id", parent_id))
                .await
                .map_err(map_surreal_error)?;
            let rows: Vec<Value> = response
                .take(0)
                .map_err(|err| DomainError::Validation(format!("invalid query result: {err}")))?;
            Ok(rows
                .first()
                .and_then(|row| row.get("total"))
                .and_then(Value::as_u64)
                .unwrap_or(0) as usize)
        })
    }

    fn update(&self, notification: &Notification) -> BoxFuture<'_, DomainResult<Notification>> {
        let notification = notification.clone();
        Box::pin(async move {
            let updated_at = to_rfc3339(notification.updated_at_ms)?;
            let read_at = notification.read_at_ms.map(to_rfc3339).transpose()?;
            let archived_at = notification.archived_at_ms.map(to_rfc3339).transpose()?;
            let target = target_entity_id(&notification);

            let mut query = String::from(
                "UPDATE notification SET \
                     title = $title, \
                     message = $message, \
                     priority = $priority, \
                     status = $status, \
                     action_url = $action_url, \
                     action_data = $action_data, \
                     metadata = $metadata, \
                     is_parent = $is_parent, \
                     is_child = $is_child, \
                     parent_id = $parent_id, \
                     hidden_in_list = $hidden_in_list, \
                     children_count = $children_count, \
                     target_entity_id = $target_entity_id, \
                     updated_at = <datetime>$updated_at",
            );
            if read_at.is_some() {
                query.push_str(", read_at = <datetime>$read_at");
            } else {
                query.push_str(", read_at = NONE");
            }
            if archived_at.is_some() {
                query.push_str(", archived_at = <datetime>$archived_at");
            } else {
                query.push_str(", archived_at = NONE");
            }
            query.push_str(" WHERE notification_id = $notification_id RETURN AFTER");

            let mut pending = self.client.query(&query);
            pending = pending.bind(("notification_id", notification.notification_id.clone()));
            pending = pending.bind(("title", notification.title.clone()));
            pending = pending.bind(("message", notification.message.clone()));
            pending = pending.bind(("priority", notification.priority.as_str()));
            pending = pending.bind(("status", notification.status.as_str()));
            pending = pending.bind(("action_url", notification.action_url.clone()));
            pending = pending.bind(("action_data", notification.action_data.clone()));
            pending = pending.bind(("metadata", notification.metadata.clone()));
            pending = pending.bind(("is_parent", notification.is_parent));
            pending = pending.bind(("is_child", notification.is_child));
            pending = pending.bind(("parent_id", notification.parent_id.clone()));
            pending = pending.bind(("hidden_in_list", notification.hidden_in_list));
            pending = pending.bind(("children_count", i64::from(notification.children_count)));
            pending = pending.bind(("target_entity_id", target));
            pending = pending.bind(("updated_at", updated_at));
            if let Some(read_at) = read_at {
                pending = pending.bind(("read_at", read_at));
            }
            if let Some(archived_at) = archived_at {
                pending = pending.bind(("archived_at", archived_at));
            }
            let mut response = pending.await.map_err(map_surreal_error)?;
            let rows: Vec<Value> = response
                .take(0)
                .map_err(|err| DomainError::Validation(format!("invalid query result: {err}")))?;
            if rows.is_empty() {
                return Err(DomainError::NotFound);
            }
            self.select_one(notification.notification_id.clone())
                .await?
                .ok_or(DomainError::NotFound)
        })
    }

    fn mark_as_read(
        &self,
        notification_id: &str,
        read_at_ms: i64,
    ) -> BoxFuture<'_, DomainResult<Notification>> {
        let notification_id = notification_id.to_string();
        Box::pin(async move {
            let read_at = to_rfc3339(read_at_ms)?;
            self.client
                .query(
                    "UPDATE notification SET \
                         status = 'read', \
                         read_at = <datetime>$read_at, \
                         updated_at = <datetime>$read_at \
                     WHERE notification_id = $notification_id AND status = 'unread'",
                )
                .bind(("notification_id", notification_id.clone()))
                .bind(("read_at", read_at))
                .await
                .map_err(map_surreal_error)?;
            self.select_one(notification_id)
                .await?
                .ok_or(DomainError::NotFound)
        })
    }

    fn unread_count(&self, user_id: &str) -> BoxFuture<'_, DomainResult<usize>> {
        let user_id = user_id.to_string();
        Box::pin(async move {
            let mut response = self
                .client
                .query(
                    "SELECT count() AS total FROM notification \
                     WHERE user_id = $user_id AND status = 'unread' \
                       AND hidden_in_list = false GROUP ALL",
                )
                .bind(("user_id", user_id))
                .await
                .map_err(map_surreal_error)?;
            let rows: Vec<Value> = response
                .take(0)
                .map_err(|err| DomainError::Validation(format!("invalid query result: {err}")))?;
            Ok(rows
                .first()
                .and_then(|row| row.get("total"))
                .and_then(Value::as_u64)
                .unwrap_or(0) as usize)
        })
    }

    fn list_open_parents(
        &self,
        user_id: Option<&str>,
    ) -> BoxFuture<'_, DomainResult<Vec<Notification>>> {
        let user_id = user_id.map(str::to_string);
        Box::pin(async move {
            match user_id {
                Some(user_id) => {
                    self.select_many(
                        format!(
                            "SELECT {NOTIFICATION_FIELDS} FROM notification \
                             WHERE user_id = $user_id AND is_parent = true \
                               AND status = 'unread'"
                        ),
                        vec![("user_id", Value::String(user_id))],
                    )
                    .await
                }
                None => {
                    self.select_many(
                        format!(
                            "SELECT {NOTIFICATION_FIELDS} FROM notification \
                             WHERE is_parent = true AND status = 'unread'"
                        ),
                        vec![],
                    )
                    .await
                }
            }
        })
    }

    fn recipients_with_ungrouped(&self) -> BoxFuture<'_, DomainResult<Vec<Recipient>>> {
        Box::pin(async move {
            let mut response = self
                .client
                .query(
                    "SELECT user_id, role FROM notification \
                     WHERE is_parent = false AND is_child = false \
                       AND parent_id = NONE AND status = 'unread' \
                     GROUP BY user_id, role",
                )
                .await
                .map_err(map_surreal_error)?;
            let rows: Vec<Value> = response
                .take(0)
                .map_err(|err| DomainError::Validation(format!("invalid query result: {err}")))?;
            rows.into_iter()
                .map(|row| {
                    let user_id = row
                        .get("user_id")
                        .and_then(Value::as_str)
                        .ok_or_else(|| {
                            DomainError::Validation("recipient row missing user_id".to_string())
                        })?
                        .to_string();
                    let role = row
                        .get("role")
                        .and_then(Value::as_str)
                        .and_then(RecipientRole::parse)
                        .ok_or_else(|| {
                            DomainError::Validation("recipient row missing role".to_string())
                        })?;
                    Ok(Recipient::new(user_id, role))
                })
                .collect()
        })
    }
}
