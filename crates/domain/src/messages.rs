use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::DomainResult;
use crate::content_hash::ContentId;
use crate::dedup::{DuplicateChecker, SequenceGuard};
use crate::error::DomainError;
use crate::ports::messages::MessageRepository;
use crate::util::now_ms;

const MAX_SUBJECT_LENGTH: usize = 256;
const MAX_BODY_LENGTH: usize = 50_000;
const MAX_SEQUENCE_STEPS: usize = 12;

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    Scheduled,
    Sent,
    Cancelled,
}

impl MessageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageStatus::Scheduled => "scheduled",
            MessageStatus::Sent => "sent",
            MessageStatus::Cancelled => "cancelled",
        }
    }

    /// Live statuses occupy the one-per-content slot for a prospect;
    /// cancelled rows do not.
    pub fn is_live(&self) -> bool {
        matches!(self, MessageStatus::Scheduled | MessageStatus::Sent)
    }
}

impl FromStr for MessageStatus {
    type Err = ();

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "scheduled" => Ok(MessageStatus::Scheduled),
            "sent" => Ok(MessageStatus::Sent),
            "cancelled" => Ok(MessageStatus::Cancelled),
            _ => Err(()),
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CancelReason {
    DuplicateContentDetected,
    SequenceAlreadyScheduled,
    OperatorRequest,
}

impl CancelReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            CancelReason::DuplicateContentDetected => "duplicate_content_detected",
            CancelReason::SequenceAlreadyScheduled => "sequence_already_scheduled",
            CancelReason::OperatorRequest => "operator_request",
        }
    }
}

impl FromStr for CancelReason {
    type Err = ();

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "duplicate_content_detected" => Ok(CancelReason::DuplicateContentDetected),
            "sequence_already_scheduled" => Ok(CancelReason::SequenceAlreadyScheduled),
            "operator_request" => Ok(CancelReason::OperatorRequest),
            _ => Err(()),
        }
    }
}

/// One outbound communication unit for a prospect, scheduled by a campaign
/// or a single-send action.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct CampaignMessage {
    pub message_id: String,
    pub prospect_id: String,
    pub subject: String,
    pub body: String,
    pub content_id: ContentId,
    pub sequence_id: Option<String>,
    pub step: Option<u32>,
    pub status: MessageStatus,
    pub scheduled_for_ms: Option<i64>,
    pub sent_at_ms: Option<i64>,
    pub cancelled_at_ms: Option<i64>,
    pub cancel_reason: Option<CancelReason>,
    pub duplicate_of: Option<String>,
    pub archived_as_duplicate: bool,
    pub request_id: String,
    pub correlation_id: String,
    pub created_at_ms: i64,
    pub updated_at_ms: i64,
}

#[derive(Clone, Debug)]
pub struct ScheduleInput {
    pub prospect_id: String,
    pub subject: String,
    pub body: String,
    pub sequence_id: Option<String>,
    pub step: Option<u32>,
    pub scheduled_for_ms: Option<i64>,
    pub request_id: String,
    pub correlation_id: String,
}

#[derive(Clone, Debug)]
pub struct SequenceStep {
    pub subject: String,
    pub body: String,
    pub scheduled_for_ms: Option<i64>,
}

#[derive(Clone, Debug)]
pub struct EnrollSequenceInput {
    pub prospect_id: String,
    pub sequence_id: String,
    pub steps: Vec<SequenceStep>,
    pub request_id: String,
    pub correlation_id: String,
}

#[derive(Clone, Debug, Serialize)]
pub struct SkippedStep {
    pub step: u32,
    pub reason: CancelReason,
    pub existing_message_id: Option<String>,
}

#[derive(Clone, Debug, Serialize)]
pub struct EnrollmentOutcome {
    pub scheduled: Vec<CampaignMessage>,
    pub skipped: Vec<SkippedStep>,
}

#[derive(Clone)]
pub struct MessageService {
    repository: Arc<dyn MessageRepository>,
}

impl MessageService {
    pub fn new(repository: Arc<dyn MessageRepository>) -> Self {
        Self { repository }
    }

    pub async fn schedule(&self, input: ScheduleInput) -> DomainResult<CampaignMessage> {
        let input = validate_schedule_input(input)?;
        let now = now_ms();
        let message = CampaignMessage {
            message_id: crate::util::uuid_v7_without_dashes(),
            content_id: ContentId::of(&input.subject, &input.body),
            prospect_id: input.prospect_id,
            subject: input.subject,
            body: input.body,
            sequence_id: input.sequence_id,
            step: input.step,
            status: MessageStatus::Scheduled,
            scheduled_for_ms: Some(input.scheduled_for_ms.unwrap_or(now)),
            sent_at_ms: None,
            cancelled_at_ms: None,
            cancel_reason: None,
            duplicate_of: None,
            archived_as_duplicate: false,
            request_id: input.request_id,
            correlation_id: input.correlation_id,
            created_at_ms: now,
            updated_at_ms: now,
        };
        self.repository.create(&message).await
    }

    /// Enroll a prospect into a multi-step sequence. Both guards run first:
    /// a prior live enrollment of the same sequence refuses the whole call,
    /// while content collisions skip only the colliding steps.
    pub async fn enroll_sequence(
        &self,
        input: EnrollSequenceInput,
    ) -> DomainResult<EnrollmentOutcome> {
        let input = validate_enroll_input(input)?;

        let guard = SequenceGuard::new(self.repository.clone());
        let enrollment = guard
            .is_sequence_already_scheduled(&input.prospect_id, &input.sequence_id)
            .await;
        if enrollment.is_scheduled {
            return Err(DomainError::Conflict);
        }

        let checker = DuplicateChecker::new(self.repository.clone());
        let candidates = input
            .steps
            .iter()
            .enumerate()
            .map(|(index, step)| crate::dedup::CandidateMessage {
                step: index as u32 + 1,
                subject: step.subject.clone(),
                body: step.body.clone(),
            })
            .collect::<Vec<_>>();
        let batch = checker
            .are_any_already_scheduled_or_sent(&input.prospect_id, &candidates)
            .await;

        let mut outcome = EnrollmentOutcome {
            scheduled: Vec::with_capacity(input.steps.len()),
            skipped: Vec::new(),
        };

        for (index, step) in input.steps.into_iter().enumerate() {
            let step_number = index as u32 + 1;
            if let Some(hit) = batch
                .duplicates
                .iter()
                .find(|duplicate| duplicate.step == step_number)
            {
                outcome.skipped.push(SkippedStep {
                    step: step_number,
                    reason: CancelReason::DuplicateContentDetected,
                    existing_message_id: Some(hit.message_id.clone()),
                });
                continue;
            }

            let scheduled = self
                .schedule(ScheduleInput {
                    prospect_id: input.prospect_id.clone(),
                    subject: step.subject,
                    body: step.body,
                    sequence_id: Some(input.sequence_id.clone()),
                    step: Some(step_number),
                    scheduled_for_ms: step.scheduled_for_ms,
                    request_id: format!("{}:step-{step_number}", input.request_id),
                    correlation_id: input.correlation_id.clone(),
                })
                .await;

            match scheduled {
                Ok(message) => outcome.scheduled.push(message),
                // A send racing this enrollment claimed the content slot
                // between the batch check and the write.
                Err(DomainError::Conflict) => outcome.skipped.push(SkippedStep {
                    step: step_number,
                    reason: CancelReason::DuplicateContentDetected,
                    existing_message_id: None,
                }),
                Err(err) => return Err(err),
            }
        }

        Ok(outcome)
    }

    /// Delivery-worker transition. Already-sent rows replay as a success.
    pub async fn mark_sent(&self, message_id: &str) -> DomainResult<CampaignMessage> {
        let message = self
            .repository
            .get(message_id)
            .await?
            .ok_or(DomainError::NotFound)?;
        match message.status {
            MessageStatus::Sent => Ok(message),
            MessageStatus::Cancelled => Err(DomainError::Conflict),
            MessageStatus::Scheduled => self.repository.mark_sent(message_id, now_ms()).await,
        }
    }

    /// Cancel a scheduled message. A cancellation racing the delivery worker
    /// is expected, so cancelling an already-sent row is a no-op success.
    pub async fn cancel(
        &self,
        message_id: &str,
        reason: CancelReason,
    ) -> DomainResult<CampaignMessage> {
        let message = self
            .repository
            .get(message_id)
            .await?
            .ok_or(DomainError::NotFound)?;
        match message.status {
            MessageStatus::Sent | MessageStatus::Cancelled => Ok(message),
            MessageStatus::Scheduled => self.repository.cancel(message_id, reason, now_ms()).await,
        }
    }

    /// Flag a sent row as a resolved duplicate of another message, releasing
    /// its content slot for future duplicate checks.
    pub async fn archive_as_duplicate(
        &self,
        message_id: &str,
        duplicate_of: &str,
    ) -> DomainResult<CampaignMessage> {
        if message_id == duplicate_of {
            return Err(DomainError::Validation(
                "a message cannot be a duplicate of itself".into(),
            ));
        }
        self.repository
            .get(duplicate_of)
            .await?
            .ok_or(DomainError::NotFound)?;
        self.repository
            .archive_as_duplicate(message_id, duplicate_of, now_ms())
            .await
    }

    pub async fn get(&self, message_id: &str) -> DomainResult<CampaignMessage> {
        self.repository
            .get(message_id)
            .await?
            .ok_or(DomainError::NotFound)
    }
}

fn validate_schedule_input(mut input: ScheduleInput) -> DomainResult<ScheduleInput> {
    input.prospect_id = input.prospect_id.trim().to_string();
    if input.prospect_id.is_empty() {
        return Err(DomainError::Validation("prospect_id is required".into()));
    }
    validate_content(&input.subject, &input.body)?;
    if let Some(sequence_id) = &input.sequence_id {
        if sequence_id.trim().is_empty() {
            return Err(DomainError::Validation("sequence_id cannot be empty".into()));
        }
    }
    Ok(input)
}

fn validate_enroll_input(mut input: EnrollSequenceInput) -> DomainResult<EnrollSequenceInput> {
    input.prospect_id = input.prospect_id.trim().to_string();
    input.sequence_id = input.sequence_id.trim().to_string();
    if input.prospect_id.is_empty() {
        return Err(DomainError::Validation("prospect_id is required".into()));
    }
    if input.sequence_id.is_empty() {
        return Err(DomainError::Validation("sequence_id is required".into()));
    }
    if input.steps.is_empty() {
        return Err(DomainError::Validation(
            "a sequence needs at least one step".into(),
        ));
    }
    if input.steps.len() > MAX_SEQUENCE_STEPS {
        return Err(DomainError::Validation(format!(
            "sequence exceeds max of {MAX_SEQUENCE_STEPS} steps"
        )));
    }
    for step in &input.steps {
        validate_content(&step.subject, &step.body)?;
    }
    Ok(input)
}

fn validate_content(subject: &str, body: &str) -> DomainResult<()> {
    if subject.trim().is_empty() {
        return Err(DomainError::Validation("subject is required".into()));
    }
    if subject.chars().count() > MAX_SUBJECT_LENGTH {
        return Err(DomainError::Validation(format!(
            "subject exceeds max length of {MAX_SUBJECT_LENGTH}"
        )));
    }
    if body.trim().is_empty() {
        return Err(DomainError::Validation("body is required".into()));
    }
    if body.chars().count() > MAX_BODY_LENGTH {
        return Err(DomainError::Validation(format!(
            "body exceeds max length of {MAX_BODY_LENGTH}"
        )));
    }
    Ok(())
}
