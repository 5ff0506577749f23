use crate::DomainResult;
use crate::content_hash::ContentId;
use crate::messages::{CampaignMessage, CancelReason};

use super::BoxFuture;

/// Store port for campaign messages.
///
/// `create` is the single enforcement point for the content-slot invariant:
/// it must reject with `DomainError::Conflict` when the prospect already has
/// a live (`scheduled` or `sent`), non-`archived_as_duplicate` row carrying
/// the same content id. Backends enforce this with a uniqueness constraint
/// or an equivalent conditional write, not a separate read-then-write.
#[allow(clippy::needless_pass_by_value)]
pub trait MessageRepository: Send + Sync {
    fn create(&self, message: &CampaignMessage) -> BoxFuture<'_, DomainResult<CampaignMessage>>;

    fn get(&self, message_id: &str) -> BoxFuture<'_, DomainResult<Option<CampaignMessage>>>;

    /// Sent rows for the prospect with this content id, excluding rows
    /// already archived as duplicates.
    fn find_sent_by_content(
        &self,
        prospect_id: &str,
        content_id: &ContentId,
    ) -> BoxFuture<'_, DomainResult<Vec<CampaignMessage>>>;

    /// Live (scheduled or sent) rows for the prospect matching any of the
    /// given content ids, excluding archived duplicates. One pass over both
    /// stores.
    fn find_live_by_content(
        &self,
        prospect_id: &str,
        content_ids: &[ContentId],
    ) -> BoxFuture<'_, DomainResult<Vec<CampaignMessage>>>;

    fn list_by_sequence(
        &self,
        prospect_id: &str,
        sequence_id: &str,
    ) -> BoxFuture<'_, DomainResult<Vec<CampaignMessage>>>;

    fn mark_sent(
        &self,
        message_id: &str,
        sent_at_ms: i64,
    ) -> BoxFuture<'_, DomainResult<CampaignMessage>>;

    fn cancel(
        &self,
        message_id: &str,
        reason: CancelReason,
        cancelled_at_ms: i64,
    ) -> BoxFuture<'_, DomainResult<CampaignMessage>>;

    fn archive_as_duplicate(
        &self,
        message_id: &str,
        duplicate_of: &str,
        updated_at_ms: i64,
    ) -> BoxFuture<'_, DomainResult<CampaignMessage>>;
}
