use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;

use crate::content_hash::ContentId;
use crate::messages::MessageStatus;
use crate::ports::messages::MessageRepository;

#[derive(Clone, Debug, Serialize, PartialEq)]
pub struct DuplicateMatch {
    pub message_id: String,
    pub subject: String,
    pub sent_at_ms: Option<i64>,
}

#[derive(Clone, Debug, Serialize, PartialEq)]
pub struct DuplicateVerdict {
    pub is_duplicate: bool,
    pub original: Option<DuplicateMatch>,
}

impl DuplicateVerdict {
    fn clear() -> Self {
        Self {
            is_duplicate: false,
            original: None,
        }
    }
}

#[derive(Clone, Debug)]
pub struct CandidateMessage {
    pub step: u32,
    pub subject: String,
    pub body: String,
}

#[derive(Clone, Debug, Serialize, PartialEq)]
pub struct ScheduledOrSentMatch {
    pub step: u32,
    pub message_id: String,
    pub status: MessageStatus,
    pub scheduled_for_ms: Option<i64>,
    pub sent_at_ms: Option<i64>,
    pub subject: String,
}

#[derive(Clone, Debug, Serialize, PartialEq)]
pub struct BatchDuplicateVerdict {
    pub has_duplicates: bool,
    pub duplicates: Vec<ScheduledOrSentMatch>,
}

impl BatchDuplicateVerdict {
    fn clear() -> Self {
        Self {
            has_duplicates: false,
            duplicates: Vec::new(),
        }
    }
}

#[derive(Clone, Debug, Serialize, PartialEq)]
pub struct EnrollmentVerdict {
    pub is_scheduled: bool,
    pub email_count: usize,
    pub statuses: Vec<MessageStatus>,
}

impl EnrollmentVerdict {
    fn clear() -> Self {
        Self {
            is_scheduled: false,
            email_count: 0,
            statuses: Vec::new(),
        }
    }
}

/// Content-level duplicate gate over the message store.
///
/// Both lookups fail OPEN: when the store itself errors, the verdict is
/// "not a duplicate". A missed duplicate can be archived after the fact;
/// a false positive silently drops a legitimate communication and nobody
/// ever finds out.
#[derive(Clone)]
pub struct DuplicateChecker {
    repository: Arc<dyn MessageRepository>,
}

impl DuplicateChecker {
    pub fn new(repository: Arc<dyn MessageRepository>) -> Self {
        Self { repository }
    }

    pub async fn is_content_already_sent(
        &self,
        prospect_id: &str,
        subject: &str,
        body: &str,
    ) -> DuplicateVerdict {
        let content_id = ContentId::of(subject, body);
        let rows = match self
            .repository
            .find_sent_by_content(prospect_id, &content_id)
            .await
        {
            Ok(rows) => rows,
            Err(err) => {
                tracing::warn!(
                    error = %err,
                    prospect_id,
                    "duplicate lookup failed; failing open"
                );
                return DuplicateVerdict::clear();
            }
        };

        let original = rows
            .into_iter()
            .filter(|row| !row.archived_as_duplicate)
            .max_by_key(|row| row.sent_at_ms.unwrap_or(row.created_at_ms));
        match original {
            Some(row) => DuplicateVerdict {
                is_duplicate: true,
                original: Some(DuplicateMatch {
                    message_id: row.message_id,
                    subject: row.subject,
                    sent_at_ms: row.sent_at_ms,
                }),
            },
            None => DuplicateVerdict::clear(),
        }
    }

    /// Batch variant used before enrolling a prospect into a sequence:
    /// checks scheduled and sent rows in one pass and reports every
    /// colliding candidate, so the caller can skip only those steps.
    pub async fn are_any_already_scheduled_or_sent(
        &self,
        prospect_id: &str,
        candidates: &[CandidateMessage],
    ) -> BatchDuplicateVerdict {
        if candidates.is_empty() {
            return BatchDuplicateVerdict::clear();
        }

        let mut steps_by_content: HashMap<ContentId, Vec<u32>> = HashMap::new();
        for candidate in candidates {
            steps_by_content
                .entry(ContentId::of(&candidate.subject, &candidate.body))
                .or_default()
                .push(candidate.step);
        }
        let content_ids = steps_by_content.keys().cloned().collect::<Vec<_>>();

        let rows = match self
            .repository
            .find_live_by_content(prospect_id, &content_ids)
            .await
        {
            Ok(rows) => rows,
            Err(err) => {
                tracing::warn!(
                    error = %err,
                    prospect_id,
                    "batch duplicate lookup failed; failing open"
                );
                return BatchDuplicateVerdict::clear();
            }
        };

        let mut duplicates = Vec::new();
        for row in rows {
            let Some(steps) = steps_by_content.get(&row.content_id) else {
                continue;
            };
            for step in steps {
                duplicates.push(ScheduledOrSentMatch {
                    step: *step,
                    message_id: row.message_id.clone(),
                    status: row.status,
                    scheduled_for_ms: row.scheduled_for_ms,
                    sent_at_ms: row.sent_at_ms,
                    subject: row.subject.clone(),
                });
            }
        }
        duplicates.sort_by_key(|duplicate| duplicate.step);

        BatchDuplicateVerdict {
            has_duplicates: !duplicates.is_empty(),
            duplicates,
        }
    }
}

/// Sequence-level enrollment gate, blind to content.
///
/// Catches a failure mode the content checker cannot: a retriggered
/// workflow regenerating the same sequence with slightly different step
/// text (a timestamp in the body is enough to defeat content hashing).
#[derive(Clone)]
pub struct SequenceGuard {
    repository: Arc<dyn MessageRepository>,
}

impl SequenceGuard {
    pub fn new(repository: Arc<dyn MessageRepository>) -> Self {
        Self { repository }
    }

    pub async fn is_sequence_already_scheduled(
        &self,
        prospect_id: &str,
        sequence_id: &str,
    ) -> EnrollmentVerdict {
        let rows = match self
            .repository
            .list_by_sequence(prospect_id, sequence_id)
            .await
        {
            Ok(rows) => rows,
            Err(err) => {
                tracing::warn!(
                    error = %err,
                    prospect_id,
                    sequence_id,
                    "sequence lookup failed; failing open"
                );
                return EnrollmentVerdict::clear();
            }
        };

        let statuses = rows
            .iter()
            .filter(|row| row.status.is_live())
            .map(|row| row.status)
            .collect::<Vec<_>>();
        EnrollmentVerdict {
            is_scheduled: !statuses.is_empty(),
            email_count: statuses.len(),
            statuses,
        }
    }
}
