//! Usage records emitted for downstream analytics.
//!
//! One record per terminal job and one per completed payment. Emitting them
//! is best-effort and never feeds back into job or ledger state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::job::{GenerationJob, JobState};
use crate::payment::PaymentIntent;
use crate::UserId;

/// A usage record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageRecord {
    /// Job or payment intent id.
    pub subject_id: String,

    /// The affected user.
    pub user_id: UserId,

    /// What happened.
    pub kind: UsageKind,

    /// Credits charged, refunded or added.
    pub credits: i64,

    /// When the outcome was reached.
    pub timestamp: DateTime<Utc>,

    /// Additional context (provider, resolution, match token, ...).
    pub metadata: serde_json::Value,
}

impl UsageRecord {
    /// Record for a job that reached a terminal state. `None` if it has not.
    #[must_use]
    pub fn for_job(job: &GenerationJob) -> Option<Self> {
        let kind = match job.state {
            JobState::Succeeded => UsageKind::GenerationCharged,
            JobState::Failed => UsageKind::GenerationRefunded,
            JobState::Expired => UsageKind::GenerationExpired,
            _ => return None,
        };
        Some(Self {
            subject_id: job.id.to_string(),
            user_id: job.owner_id,
            kind,
            credits: job.cost_estimate,
            timestamp: job.terminal_at.unwrap_or(job.updated_at),
            metadata: serde_json::json!({
                "provider": job.provider,
                "provider_task_id": job.provider_task_id,
                "resolution": job.request.resolution.as_str(),
                "image_inputs": job.request.image_inputs.len(),
            }),
        })
    }

    /// Record for a completed payment.
    #[must_use]
    pub fn for_payment(intent: &PaymentIntent) -> Self {
        Self {
            subject_id: intent.id.to_string(),
            user_id: intent.owner_id,
            kind: UsageKind::PaymentCompleted,
            credits: intent.expected_amount,
            timestamp: intent.completed_at.unwrap_or_else(Utc::now),
            metadata: serde_json::json!({
                "match_token": intent.match_token,
                "received_amount": intent.received_amount,
            }),
        }
    }
}

/// Kind of usage record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UsageKind {
    /// A job succeeded and its hold was settled.
    GenerationCharged,
    /// A job failed and its hold was released.
    GenerationRefunded,
    /// A job expired and its hold was released.
    GenerationExpired,
    /// A payment credited the ledger.
    PaymentCompleted,
}

impl UsageKind {
    /// Name used in logs.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::GenerationCharged => "generation_charged",
            Self::GenerationRefunded => "generation_refunded",
            Self::GenerationExpired => "generation_expired",
            Self::PaymentCompleted => "payment_completed",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{GenerationRequest, JobTransition};

    #[test]
    fn only_terminal_jobs_produce_records() {
        let mut job = GenerationJob::new(UserId::generate(), "kie", GenerationRequest::new("x"), 100);
        assert!(UsageRecord::for_job(&job).is_none());

        job.apply(&JobTransition::expired("timeout"), Utc::now()).unwrap();
        let record = UsageRecord::for_job(&job).unwrap();
        assert_eq!(record.kind, UsageKind::GenerationExpired);
        assert_eq!(record.credits, 100);
        assert_eq!(record.subject_id, job.id.to_string());
    }
}
