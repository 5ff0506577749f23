use crate::DomainResult;
use crate::identity::{Recipient, RecipientRole};
use crate::notifications::Notification;

use super::BoxFuture;

/// Store port for notification rows.
///
/// `create` is the single enforcement point for two natural keys:
/// - any row: `(user_id, dedupe_key)` must be unique;
/// - parent rows: at most one OPEN (unread) parent per
///   `(user_id, target entity)` may exist at a time.
/// Violations surface as `DomainError::Conflict`; callers resolve the race
/// by re-reading the winner. Backends enforce this with a uniqueness
/// constraint or a conditional write, not a separate read-then-write.
#[allow(clippy::needless_pass_by_value)]
pub trait NotificationRepository: Send + Sync {
    fn create(&self, notification: &Notification) -> BoxFuture<'_, DomainResult<Notification>>;

    fn get(&self, notification_id: &str) -> BoxFuture<'_, DomainResult<Option<Notification>>>;

    fn get_by_dedupe_key(
        &self,
        user_id: &str,
        dedupe_key: &str,
    ) -> BoxFuture<'_, DomainResult<Option<Notification>>>;

    /// Rows shown in primary listings: `hidden_in_list = false`.
    fn list_visible(
        &self,
        user_id: &str,
        role: RecipientRole,
    ) -> BoxFuture<'_, DomainResult<Vec<Notification>>>;

    /// Aggregation input: unread top-level rows that are neither parent nor
    /// child and have no parent link yet.
    fn list_ungrouped(
        &self,
        user_id: &str,
        role: RecipientRole,
    ) -> BoxFuture<'_, DomainResult<Vec<Notification>>>;

    fn find_open_parent(
        &self,
        user_id: &str,
        target_entity_id: &str,
    ) -> BoxFuture<'_, DomainResult<Option<Notification>>>;

    /// Atomically relabel a batch of rows as children of `parent_id`
    /// (`parent_id`, `is_child`, `hidden_in_list`). Returns how many rows
    /// were newly linked; rows already under this parent are left alone.
    fn link_children(
        &self,
        parent_id: &str,
        child_ids: &[String],
        updated_at_ms: i64,
    ) -> BoxFuture<'_, DomainResult<usize>>;

    fn list_children(&self, parent_id: &str) -> BoxFuture<'_, DomainResult<Vec<Notification>>>;

    fn count_unread_children(&self, parent_id: &str) -> BoxFuture<'_, DomainResult<usize>>;

    /// Full-row update; the row must already exist.
    fn update(&self, notification: &Notification) -> BoxFuture<'_, DomainResult<Notification>>;

    fn mark_as_read(
        &self,
        notification_id: &str,
        read_at_ms: i64,
    ) -> BoxFuture<'_, DomainResult<Notification>>;

    fn unread_count(&self, user_id: &str) -> BoxFuture<'_, DomainResult<usize>>;

    fn list_open_parents(
        &self,
        user_id: Option<&str>,
    ) -> BoxFuture<'_, DomainResult<Vec<Notification>>>;

    /// Every recipient currently holding ungrouped rows — the work list for
    /// a full aggregation sweep or the historical backfill.
    fn recipients_with_ungrouped(&self) -> BoxFuture<'_, DomainResult<Vec<Recipient>>>;
}
