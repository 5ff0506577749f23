use std::sync::Arc;

use serde::Serialize;
use serde_json::json;

use crate::DomainResult;
use crate::error::DomainError;
use crate::identity::Recipient;
use crate::notifications::{
    Notification, NotificationPriority, NotificationStatus, action_label, target_display_name,
};
use crate::ports::notifications::NotificationRepository;
use crate::query::{self, UNGROUPED_BUCKET};
use crate::util::now_ms;

pub const PARENT_NOTIFICATION_TYPE: &str = "case_actions_summary";

/// Presentation tuning. Day thresholds pick the urgency badge; the preview
/// size caps how many member labels the summary body spells out before
/// collapsing into "+N more".
pub const SUMMARY_PREVIEW_SIZE: usize = 3;
pub const CRITICAL_AFTER_DAYS: i64 = 5;
pub const ELEVATED_AFTER_DAYS: i64 = 2;

const BADGE_CRITICAL: &str = "🚨";
const BADGE_ELEVATED: &str = "⚠️";
const BADGE_STANDARD: &str = "📋";

const MS_PER_DAY: i64 = 24 * 60 * 60 * 1000;

#[derive(Clone, Debug, Default, Serialize, PartialEq, Eq)]
pub struct AggregationReport {
    pub recipients_processed: usize,
    pub parents_created: usize,
    pub parents_extended: usize,
    pub children_linked: usize,
    pub singletons_left: usize,
    pub groups_skipped: usize,
}

impl AggregationReport {
    pub fn absorb(&mut self, other: &AggregationReport) {
        self.recipients_processed += other.recipients_processed;
        self.parents_created += other.parents_created;
        self.parents_extended += other.parents_extended;
        self.children_linked += other.children_linked;
        self.singletons_left += other.singletons_left;
        self.groups_skipped += other.groups_skipped;
    }
}

struct GroupOutcome {
    created: bool,
    children_linked: usize,
}

/// Folds a recipient's ungrouped child rows into one summary parent per
/// target entity. The parent is found-or-created by its natural key
/// (recipient, target entity, still unread), so replays and concurrent
/// sweeps converge on a single parent instead of stacking duplicates.
#[derive(Clone)]
pub struct AggregationService {
    repository: Arc<dyn NotificationRepository>,
}

impl AggregationService {
    pub fn new(repository: Arc<dyn NotificationRepository>) -> Self {
        Self { repository }
    }

    pub async fn aggregate_recipient(
        &self,
        recipient: &Recipient,
    ) -> DomainResult<AggregationReport> {
        let rows = self
            .repository
            .list_ungrouped(&recipient.user_id, recipient.role)
            .await?;

        let mut report = AggregationReport {
            recipients_processed: 1,
            ..AggregationReport::default()
        };

        let mut clean = Vec::with_capacity(rows.len());
        for row in rows {
            if row.has_structural_conflict() {
                tracing::warn!(
                    notification_id = %row.notification_id,
                    "row is flagged both parent and child; skipping"
                );
                report.groups_skipped += 1;
                continue;
            }
            clean.push(row);
        }

        for (target, members) in query::group_by_target_entity(clean) {
            if target == UNGROUPED_BUCKET {
                // No extractable target entity: these stay standalone and
                // visible rather than disappearing into a bogus group.
                report.singletons_left += members.len();
                continue;
            }
            if members.len() < 2 {
                // A "summary of one" would only hide the event.
                report.singletons_left += members.len();
                continue;
            }

            match self.fold_group(recipient, &target, &members).await {
                Ok(outcome) => {
                    if outcome.created {
                        report.parents_created += 1;
                    } else {
                        report.parents_extended += 1;
                    }
                    report.children_linked += outcome.children_linked;
                }
                Err(err) => {
                    // The members stay visible and ungrouped; a later sweep
                    // retries them.
                    tracing::warn!(
                        error = %err,
                        user_id = %recipient.user_id,
                        target_entity_id = %target,
                        "failed to fold group; leaving members ungrouped"
                    );
                    report.groups_skipped += 1;
                }
            }
        }

        Ok(report)
    }

    /// Sweep every recipient that has ungrouped rows. One bad recipient
    /// never aborts the run.
    pub async fn aggregate_all(&self) -> DomainResult<AggregationReport> {
        let recipients = self.repository.recipients_with_ungrouped().await?;
        let mut report = AggregationReport::default();
        for recipient in recipients {
            match self.aggregate_recipient(&recipient).await {
                Ok(partial) => report.absorb(&partial),
                Err(err) => {
                    tracing::warn!(
                        error = %err,
                        user_id = %recipient.user_id,
                        "aggregation failed for recipient; continuing"
                    );
                    report.groups_skipped += 1;
                }
            }
        }
        Ok(report)
    }

    /// Archive open parents whose unread children have all gone away.
    pub async fn cleanup_orphan_parents(&self, user_id: Option<&str>) -> DomainResult<usize> {
        let parents = self.repository.list_open_parents(user_id).await?;
        let mut archived = 0usize;
        for parent in parents {
            if self
                .repository
                .count_unread_children(&parent.notification_id)
                .await?
                > 0
            {
                continue;
            }
            let now = now_ms();
            let mut parent = parent;
            parent.status = NotificationStatus::Archived;
            parent.archived_at_ms = Some(now);
            parent.updated_at_ms = now;
            self.repository.update(&parent).await?;
            archived += 1;
        }
        Ok(archived)
    }

    async fn fold_group(
        &self,
        recipient: &Recipient,
        target: &str,
        members: &[Notification],
    ) -> DomainResult<GroupOutcome> {
        let now = now_ms();
        if let Some(parent) = self
            .repository
            .find_open_parent(&recipient.user_id, target)
            .await?
        {
            if parent.has_structural_conflict() {
                return Err(DomainError::Validation(format!(
                    "parent {} is flagged both parent and child",
                    parent.notification_id
                )));
            }
            let linked = self.extend_parent(&parent, members, now).await?;
            return Ok(GroupOutcome {
                created: false,
                children_linked: linked,
            });
        }

        let parent = build_parent(recipient, target, members, now);
        match self.repository.create(&parent).await {
            Ok(parent) => {
                let child_ids = member_ids(members);
                let linked = self
                    .repository
                    .link_children(&parent.notification_id, &child_ids, now)
                    .await?;
                Ok(GroupOutcome {
                    created: true,
                    children_linked: linked,
                })
            }
            // A concurrent sweep created the parent first; extend the winner.
            Err(DomainError::Conflict) => {
                let parent = self
                    .repository
                    .find_open_parent(&recipient.user_id, target)
                    .await?
                    .ok_or(DomainError::Conflict)?;
                let linked = self.extend_parent(&parent, members, now).await?;
                Ok(GroupOutcome {
                    created: false,
                    children_linked: linked,
                })
            }
            Err(err) => Err(err),
        }
    }

    /// Link the new members, then rebuild the parent from its full child
    /// set. Counts are recomputed from the store, never accumulated, so a
    /// replay cannot double-count.
    async fn extend_parent(
        &self,
        parent: &Notification,
        members: &[Notification],
        now: i64,
    ) -> DomainResult<usize> {
        let child_ids = member_ids(members);
        let linked = self
            .repository
            .link_children(&parent.notification_id, &child_ids, now)
            .await?;

        let children = self
            .repository
            .list_children(&parent.notification_id)
            .await?;
        let mut refreshed = parent.clone();
        refresh_parent(&mut refreshed, &children, now);
        self.repository.update(&refreshed).await?;
        Ok(linked)
    }
}

fn member_ids(members: &[Notification]) -> Vec<String> {
    members
        .iter()
        .map(|member| member.notification_id.clone())
        .collect()
}

fn build_parent(
    recipient: &Recipient,
    target: &str,
    members: &[Notification],
    now: i64,
) -> Notification {
    let urgency_days = most_urgent_days(members, now);
    let display_name = members
        .first()
        .map(target_display_name)
        .unwrap_or_else(|| "Case".to_string());
    Notification {
        notification_id: crate::util::uuid_v7_without_dashes(),
        user_id: recipient.user_id.clone(),
        role: recipient.role,
        notification_type: PARENT_NOTIFICATION_TYPE.to_string(),
        title: build_title(&display_name, members.len(), urgency_days),
        message: build_summary(members),
        priority: highest_priority(members),
        status: NotificationStatus::Unread,
        read_at_ms: None,
        archived_at_ms: None,
        action_url: Some(format!("/cases/{target}")),
        action_data: Some(json!({
            "case_id": target,
            "case_name": display_name,
            "pending_actions_count": members.len(),
        })),
        metadata: Some(json!({
            "target_entity_id": target,
            "grouped_by": "target_entity",
            "most_urgent_days": urgency_days,
            "aggregated_at_ms": now,
        })),
        is_parent: true,
        is_child: false,
        parent_id: None,
        hidden_in_list: false,
        children_count: members.len() as u32,
        dedupe_key: format!("{PARENT_NOTIFICATION_TYPE}:{target}:{now}"),
        request_id: format!("aggregation:{}:{target}", recipient.user_id),
        correlation_id: format!("aggregation:{now}"),
        created_at_ms: now,
        updated_at_ms: now,
    }
}

fn refresh_parent(parent: &mut Notification, children: &[Notification], now: i64) {
    let urgency_days = most_urgent_days(children, now);
    let display_name = children
        .first()
        .map(target_display_name)
        .unwrap_or_else(|| target_display_name(parent));
    parent.title = build_title(&display_name, children.len(), urgency_days);
    parent.message = build_summary(children);
    parent.priority = highest_priority(children);
    parent.children_count = children.len() as u32;
    parent.updated_at_ms = now;
    if let Some(metadata) = parent.metadata.as_mut().and_then(|value| value.as_object_mut()) {
        metadata.insert("most_urgent_days".into(), json!(urgency_days));
        metadata.insert("aggregated_at_ms".into(), json!(now));
    }
    if let Some(action_data) = parent
        .action_data
        .as_mut()
        .and_then(|value| value.as_object_mut())
    {
        action_data.insert("pending_actions_count".into(), json!(children.len()));
    }
}

/// Whole days the oldest member has been waiting.
fn most_urgent_days(members: &[Notification], now_ms: i64) -> i64 {
    members
        .iter()
        .map(|member| ((now_ms - member.created_at_ms) / MS_PER_DAY).max(0))
        .max()
        .unwrap_or(0)
}

fn highest_priority(members: &[Notification]) -> NotificationPriority {
    members
        .iter()
        .map(|member| member.priority)
        .max()
        .unwrap_or(NotificationPriority::Medium)
}

fn urgency_badge(urgency_days: i64) -> &'static str {
    if urgency_days >= CRITICAL_AFTER_DAYS {
        BADGE_CRITICAL
    } else if urgency_days >= ELEVATED_AFTER_DAYS {
        BADGE_ELEVATED
    } else {
        BADGE_STANDARD
    }
}

fn build_title(display_name: &str, count: usize, urgency_days: i64) -> String {
    let plural = if count > 1 { "s" } else { "" };
    format!(
        "{} {display_name} - {count} action{plural}",
        urgency_badge(urgency_days)
    )
}

fn build_summary(members: &[Notification]) -> String {
    let labels = members
        .iter()
        .take(SUMMARY_PREVIEW_SIZE)
        .map(|member| action_label(&member.notification_type))
        .collect::<Vec<_>>()
        .join(", ");
    let overflow = members.len().saturating_sub(SUMMARY_PREVIEW_SIZE);
    if overflow > 0 {
        format!("{labels} +{overflow} more")
    } else {
        labels
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::RecipientRole;
    use crate::notifications::{NOTIF_TYPE_DOCUMENT_REVIEW, NOTIF_TYPE_EXPERT_ASSIGNED};

    fn member(id: &str, created_at_ms: i64, priority: NotificationPriority) -> Notification {
        Notification {
            notification_id: id.to_string(),
            user_id: "u-1".into(),
            role: RecipientRole::Client,
            notification_type: NOTIF_TYPE_DOCUMENT_REVIEW.to_string(),
            title: "Document reviewed".into(),
            message: "m".into(),
            priority,
            status: NotificationStatus::Unread,
            read_at_ms: None,
            archived_at_ms: None,
            action_url: None,
            action_data: Some(serde_json::json!({
                "case_id": "case-1",
                "case_name": "TICPE 2025",
            })),
            metadata: None,
            is_parent: false,
            is_child: false,
            parent_id: None,
            hidden_in_list: false,
            children_count: 0,
            dedupe_key: format!("test:{id}"),
            request_id: "req".into(),
            correlation_id: "corr".into(),
            created_at_ms,
            updated_at_ms: created_at_ms,
        }
    }

    #[test]
    fn urgency_counts_whole_days_from_oldest_member() {
        let now = 10 * MS_PER_DAY;
        let members = vec![
            member("a", now - 3 * MS_PER_DAY, NotificationPriority::Low),
            member("b", now - MS_PER_DAY / 2, NotificationPriority::Low),
        ];
        assert_eq!(most_urgent_days(&members, now), 3);
    }

    #[test]
    fn badge_thresholds() {
        assert_eq!(urgency_badge(0), BADGE_STANDARD);
        assert_eq!(urgency_badge(1), BADGE_STANDARD);
        assert_eq!(urgency_badge(2), BADGE_ELEVATED);
        assert_eq!(urgency_badge(4), BADGE_ELEVATED);
        assert_eq!(urgency_badge(5), BADGE_CRITICAL);
    }

    #[test]
    fn title_carries_badge_name_and_count() {
        assert_eq!(build_title("TICPE 2025", 3, 0), "📋 TICPE 2025 - 3 actions");
        assert_eq!(build_title("TICPE 2025", 1, 6), "🚨 TICPE 2025 - 1 action");
    }

    #[test]
    fn summary_previews_then_collapses() {
        let mut members = vec![
            member("a", 0, NotificationPriority::Low),
            member("b", 0, NotificationPriority::Low),
        ];
        assert_eq!(
            build_summary(&members),
            "Document reviewed, Document reviewed"
        );

        members.push(member("c", 0, NotificationPriority::Low));
        let mut fourth = member("d", 0, NotificationPriority::Low);
        fourth.notification_type = NOTIF_TYPE_EXPERT_ASSIGNED.to_string();
        members.push(fourth);
        members.push(member("e", 0, NotificationPriority::Low));
        assert_eq!(
            build_summary(&members),
            "Document reviewed, Document reviewed, Document reviewed +2 more"
        );
    }

    #[test]
    fn priority_takes_the_maximum() {
        let members = vec![
            member("a", 0, NotificationPriority::Low),
            member("b", 0, NotificationPriority::Urgent),
            member("c", 0, NotificationPriority::High),
        ];
        assert_eq!(highest_priority(&members), NotificationPriority::Urgent);
    }

    #[test]
    fn parent_carries_natural_key_metadata() {
        let recipient = Recipient::new("u-1", RecipientRole::Client);
        let members = vec![
            member("a", 0, NotificationPriority::Medium),
            member("b", 0, NotificationPriority::Medium),
        ];
        let parent = build_parent(&recipient, "case-1", &members, MS_PER_DAY);
        assert!(parent.is_parent);
        assert!(!parent.is_child);
        assert_eq!(parent.children_count, 2);
        assert_eq!(parent.action_url.as_deref(), Some("/cases/case-1"));
        assert_eq!(
            crate::notifications::target_entity_id(&parent),
            Some("case-1".into())
        );
    }
}
