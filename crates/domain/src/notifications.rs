use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::identity::RecipientRole;
use crate::util::now_ms;

pub const NOTIF_TYPE_DOCUMENT_UPLOADED: &str = "document_uploaded";
pub const NOTIF_TYPE_DOCUMENT_VALIDATED: &str = "document_validated";
pub const NOTIF_TYPE_DOCUMENT_REJECTED: &str = "document_rejected";
pub const NOTIF_TYPE_DOCUMENT_REVIEW: &str = "document_review";
pub const NOTIF_TYPE_EXPERT_ASSIGNED: &str = "expert_assigned";
pub const NOTIF_TYPE_DEADLINE_REMINDER: &str = "deadline_reminder";
pub const NOTIF_TYPE_CONTACT_MESSAGE: &str = "contact_message";
pub const NOTIF_TYPE_CASE_STATE_CHANGED: &str = "case_state_changed";

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum NotificationPriority {
    Low,
    Medium,
    High,
    Urgent,
}

impl NotificationPriority {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationPriority::Low => "low",
            NotificationPriority::Medium => "medium",
            NotificationPriority::High => "high",
            NotificationPriority::Urgent => "urgent",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "low" => Some(NotificationPriority::Low),
            "medium" | "normal" => Some(NotificationPriority::Medium),
            "high" => Some(NotificationPriority::High),
            "urgent" | "critical" => Some(NotificationPriority::Urgent),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum NotificationStatus {
    Unread,
    Read,
    Archived,
}

impl NotificationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationStatus::Unread => "unread",
            NotificationStatus::Read => "read",
            NotificationStatus::Archived => "archived",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "unread" => Some(NotificationStatus::Unread),
            "read" => Some(NotificationStatus::Read),
            "archived" => Some(NotificationStatus::Archived),
            _ => None,
        }
    }
}

/// Canonical in-app notification row.
///
/// A parent owns children through `parent_id`; children carry
/// `hidden_in_list` so primary listings only show the summary. A row is
/// never both parent and child.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Notification {
    pub notification_id: String,
    pub user_id: String,
    pub role: RecipientRole,
    pub notification_type: String,
    pub title: String,
    pub message: String,
    pub priority: NotificationPriority,
    pub status: NotificationStatus,
    pub read_at_ms: Option<i64>,
    pub archived_at_ms: Option<i64>,
    pub action_url: Option<String>,
    pub action_data: Option<Value>,
    pub metadata: Option<Value>,
    pub is_parent: bool,
    pub is_child: bool,
    pub parent_id: Option<String>,
    pub hidden_in_list: bool,
    pub children_count: u32,
    pub dedupe_key: String,
    pub request_id: String,
    pub correlation_id: String,
    pub created_at_ms: i64,
    pub updated_at_ms: i64,
}

impl Notification {
    /// An open parent still collects new children for its target entity.
    pub fn is_open_parent(&self) -> bool {
        self.is_parent && self.status == NotificationStatus::Unread
    }

    /// A dirty historical row can carry both structural flags at once;
    /// such a row is skipped per record, never fatal to a batch.
    pub fn has_structural_conflict(&self) -> bool {
        self.is_parent && self.is_child
    }
}

/// Raw event written by a producer (case lifecycle, document review,
/// inbound contact form). Becomes an ungrouped child row.
#[derive(Clone, Debug)]
pub struct NotificationIngest {
    pub user_id: String,
    pub role: RecipientRole,
    pub notification_type: String,
    pub title: String,
    pub message: String,
    pub priority: NotificationPriority,
    pub action_url: Option<String>,
    pub action_data: Option<Value>,
    pub metadata: Option<Value>,
    pub request_id: String,
    pub correlation_id: String,
    pub dedupe_key: Option<String>,
    pub created_at_ms: Option<i64>,
}

/// Historical row as stored before the canonical shape: read state was
/// encoded three ways over the years (a boolean, a status string, an
/// archival timestamp), and most columns were nullable.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct LegacyNotificationRecord {
    pub id: String,
    pub user_id: String,
    pub user_type: Option<String>,
    pub notification_type: Option<String>,
    pub title: Option<String>,
    pub message: Option<String>,
    pub priority: Option<String>,
    pub status: Option<String>,
    pub is_read: Option<bool>,
    pub read_at_ms: Option<i64>,
    pub archived_at_ms: Option<i64>,
    pub action_url: Option<String>,
    pub action_data: Option<Value>,
    pub metadata: Option<Value>,
    pub is_parent: Option<bool>,
    pub is_child: Option<bool>,
    pub parent_id: Option<String>,
    pub hidden_in_list: Option<bool>,
    pub children_count: Option<u32>,
    pub request_id: Option<String>,
    pub correlation_id: Option<String>,
    pub created_at_ms: Option<i64>,
    pub updated_at_ms: Option<i64>,
}

/// Sole authority for the legacy read-state precedence. Total: every
/// combination of the three historical encodings maps to one status.
///
/// Precedence: an archival marker wins over everything; otherwise any read
/// marker (boolean, status string, or read timestamp) wins over unread.
pub fn normalize(raw: &LegacyNotificationRecord) -> Notification {
    let status = resolve_status(raw);
    let created_at_ms = raw.created_at_ms.unwrap_or_else(now_ms);
    let dedupe_key = format!("legacy:{}", raw.id);
    Notification {
        notification_id: raw.id.clone(),
        user_id: raw.user_id.clone(),
        role: raw
            .user_type
            .as_deref()
            .and_then(RecipientRole::parse)
            // Unknown historical roles get the least privileged visibility.
            .unwrap_or(RecipientRole::Client),
        notification_type: raw
            .notification_type
            .clone()
            .unwrap_or_else(|| "info".to_string()),
        title: raw.title.clone().unwrap_or_default(),
        message: raw.message.clone().unwrap_or_default(),
        priority: raw
            .priority
            .as_deref()
            .and_then(NotificationPriority::parse)
            .unwrap_or(NotificationPriority::Medium),
        status,
        read_at_ms: match status {
            NotificationStatus::Unread => None,
            _ => raw.read_at_ms,
        },
        archived_at_ms: raw.archived_at_ms,
        action_url: raw.action_url.clone(),
        action_data: raw.action_data.clone(),
        metadata: raw.metadata.clone(),
        is_parent: raw.is_parent.unwrap_or(false),
        is_child: raw.is_child.unwrap_or(false),
        parent_id: raw.parent_id.clone(),
        hidden_in_list: raw.hidden_in_list.unwrap_or(false),
        children_count: raw.children_count.unwrap_or(0),
        dedupe_key,
        request_id: raw.request_id.clone().unwrap_or_default(),
        correlation_id: raw.correlation_id.clone().unwrap_or_default(),
        created_at_ms,
        updated_at_ms: raw.updated_at_ms.unwrap_or(created_at_ms),
    }
}

fn resolve_status(raw: &LegacyNotificationRecord) -> NotificationStatus {
    let status_marker = raw.status.as_deref().map(str::trim);
    if raw.archived_at_ms.is_some() || status_marker == Some("archived") {
        return NotificationStatus::Archived;
    }
    if raw.is_read == Some(true) || status_marker == Some("read") || raw.read_at_ms.is_some() {
        return NotificationStatus::Read;
    }
    NotificationStatus::Unread
}

/// Grouping key for aggregation: the business entity the row concerns.
/// Checked in order: explicit metadata marker, then the case reference in
/// the action payload, then the client reference. A row with none of them
/// is never aggregated.
pub fn target_entity_id(notification: &Notification) -> Option<String> {
    json_str(&notification.metadata, "target_entity_id")
        .or_else(|| json_str(&notification.action_data, "case_id"))
        .or_else(|| json_str(&notification.action_data, "client_id"))
}

pub fn target_display_name(notification: &Notification) -> String {
    json_str(&notification.action_data, "case_name")
        .or_else(|| json_str(&notification.metadata, "case_name"))
        .unwrap_or_else(|| "Case".to_string())
}

/// Short label used when a parent summarizes its members.
pub fn action_label(notification_type: &str) -> &'static str {
    match notification_type {
        NOTIF_TYPE_DOCUMENT_UPLOADED => "Document uploaded",
        NOTIF_TYPE_DOCUMENT_VALIDATED => "Document validated",
        NOTIF_TYPE_DOCUMENT_REJECTED => "Document rejected",
        NOTIF_TYPE_DOCUMENT_REVIEW => "Document reviewed",
        NOTIF_TYPE_EXPERT_ASSIGNED => "Expert assigned",
        NOTIF_TYPE_DEADLINE_REMINDER => "Deadline approaching",
        NOTIF_TYPE_CONTACT_MESSAGE => "New message",
        NOTIF_TYPE_CASE_STATE_CHANGED => "Case updated",
        _ => "Update",
    }
}

fn json_str(value: &Option<Value>, key: &str) -> Option<String> {
    value
        .as_ref()
        .and_then(|value| value.get(key))
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn raw() -> LegacyNotificationRecord {
        LegacyNotificationRecord {
            id: "n-1".into(),
            user_id: "u-1".into(),
            user_type: Some("client".into()),
            ..LegacyNotificationRecord::default()
        }
    }

    #[test]
    fn status_precedence_table() {
        // (is_read, status, read_at, archived_at) -> expected
        let cases: Vec<(Option<bool>, Option<&str>, Option<i64>, Option<i64>, NotificationStatus)> = vec![
            (None, None, None, None, NotificationStatus::Unread),
            (Some(false), None, None, None, NotificationStatus::Unread),
            (Some(true), None, None, None, NotificationStatus::Read),
            (None, Some("read"), None, None, NotificationStatus::Read),
            (None, None, Some(10), None, NotificationStatus::Read),
            (Some(false), Some("unread"), Some(10), None, NotificationStatus::Read),
            // The archival marker beats every read marker, including an
            // explicit is_read=false.
            (Some(false), None, None, Some(20), NotificationStatus::Archived),
            (Some(true), Some("read"), Some(10), Some(20), NotificationStatus::Archived),
            (None, Some("archived"), None, None, NotificationStatus::Archived),
            (Some(false), Some("archived"), None, None, NotificationStatus::Archived),
        ];

        for (is_read, status, read_at_ms, archived_at_ms, expected) in cases {
            let mut record = raw();
            record.is_read = is_read;
            record.status = status.map(str::to_string);
            record.read_at_ms = read_at_ms;
            record.archived_at_ms = archived_at_ms;
            assert_eq!(
                normalize(&record).status,
                expected,
                "is_read={is_read:?} status={status:?} read_at={read_at_ms:?} archived_at={archived_at_ms:?}"
            );
        }
    }

    #[test]
    fn normalize_is_total_over_empty_records() {
        let record = LegacyNotificationRecord {
            id: "n-2".into(),
            user_id: "u-2".into(),
            ..LegacyNotificationRecord::default()
        };
        let notification = normalize(&record);
        assert_eq!(notification.role, RecipientRole::Client);
        assert_eq!(notification.priority, NotificationPriority::Medium);
        assert_eq!(notification.status, NotificationStatus::Unread);
        assert_eq!(notification.children_count, 0);
    }

    #[test]
    fn unread_rows_drop_stray_read_timestamps() {
        let mut record = raw();
        record.is_read = Some(false);
        let notification = normalize(&record);
        assert_eq!(notification.read_at_ms, None);
    }

    #[test]
    fn priority_total_order() {
        use NotificationPriority::*;
        assert!(Urgent > High && High > Medium && Medium > Low);
        assert_eq!(NotificationPriority::parse("URGENT"), Some(Urgent));
        assert_eq!(NotificationPriority::parse("weird"), None);
    }

    #[test]
    fn target_extraction_prefers_metadata_marker() {
        let mut record = raw();
        record.metadata = Some(json!({ "target_entity_id": "case-9" }));
        record.action_data = Some(json!({ "case_id": "case-1" }));
        let notification = normalize(&record);
        assert_eq!(target_entity_id(&notification), Some("case-9".into()));

        let mut record = raw();
        record.action_data = Some(json!({ "case_id": "case-1", "case_name": "TICPE 2025" }));
        let notification = normalize(&record);
        assert_eq!(target_entity_id(&notification), Some("case-1".into()));
        assert_eq!(target_display_name(&notification), "TICPE 2025");
    }

    #[test]
    fn rows_without_target_are_unaggregatable() {
        let notification = normalize(&raw());
        assert_eq!(target_entity_id(&notification), None);
        assert_eq!(target_display_name(&notification), "Case");
    }

    #[test]
    fn structural_conflict_is_detected() {
        let mut record = raw();
        record.is_parent = Some(true);
        record.is_child = Some(true);
        assert!(normalize(&record).has_structural_conflict());
    }
}
