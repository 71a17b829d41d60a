//! Generation job types and the job state machine.
//!
//! A job is created with a hold on the owner's ledger, handed to the
//! provider, and eventually reaches exactly one terminal state. Reaching the
//! terminal state is what decides the single ledger effect for the job:
//! success settles the hold, failure or expiry releases it.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{BillingError, Result};
use crate::{JobId, UserId};

/// Longest prompt accepted by the provider.
pub const MAX_PROMPT_CHARS: usize = 10_000;

/// Most reference images a single request may carry.
pub const MAX_IMAGE_INPUTS: usize = 8;

/// What the user asked to generate. Immutable once the job is created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenerationRequest {
    /// Text prompt.
    pub prompt: String,

    /// URLs of reference images.
    #[serde(default)]
    pub image_inputs: Vec<String>,

    /// Output aspect ratio.
    #[serde(default)]
    pub aspect_ratio: AspectRatio,

    /// Output resolution tier.
    #[serde(default)]
    pub resolution: Resolution,

    /// Output image format.
    #[serde(default)]
    pub output_format: OutputFormat,
}

impl GenerationRequest {
    /// Create a request with default ratio, resolution and format.
    #[must_use]
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            image_inputs: Vec::new(),
            aspect_ratio: AspectRatio::default(),
            resolution: Resolution::default(),
            output_format: OutputFormat::default(),
        }
    }

    /// Check the request before any credit is reserved for it.
    ///
    /// # Errors
    ///
    /// `InvalidRequest` describing the first problem found.
    pub fn validate(&self) -> Result<()> {
        let prompt = self.prompt.trim();
        if prompt.is_empty() {
            return Err(BillingError::InvalidRequest("prompt is empty".into()));
        }
        if prompt.chars().count() > MAX_PROMPT_CHARS {
            return Err(BillingError::InvalidRequest(format!(
                "prompt exceeds {MAX_PROMPT_CHARS} characters"
            )));
        }
        if self.image_inputs.len() > MAX_IMAGE_INPUTS {
            return Err(BillingError::InvalidRequest(format!(
                "at most {MAX_IMAGE_INPUTS} image inputs are allowed"
            )));
        }
        if let Some(bad) = self
            .image_inputs
            .iter()
            .find(|url| !(url.starts_with("https://") || url.starts_with("http://")))
        {
            return Err(BillingError::InvalidRequest(format!(
                "image input is not an http(s) URL: {bad}"
            )));
        }
        Ok(())
    }
}

/// Supported aspect ratios.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AspectRatio {
    /// 1:1
    #[default]
    #[serde(rename = "1:1")]
    Square,
    /// 2:3
    #[serde(rename = "2:3")]
    Portrait2x3,
    /// 3:2
    #[serde(rename = "3:2")]
    Landscape3x2,
    /// 3:4
    #[serde(rename = "3:4")]
    Portrait3x4,
    /// 4:3
    #[serde(rename = "4:3")]
    Landscape4x3,
    /// 4:5
    #[serde(rename = "4:5")]
    Portrait4x5,
    /// 5:4
    #[serde(rename = "5:4")]
    Landscape5x4,
    /// 9:16
    #[serde(rename = "9:16")]
    Portrait9x16,
    /// 16:9
    #[serde(rename = "16:9")]
    Landscape16x9,
    /// 21:9
    #[serde(rename = "21:9")]
    Ultrawide,
    /// Let the provider decide.
    #[serde(rename = "auto")]
    Auto,
}

impl AspectRatio {
    /// Wire representation.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Square => "1:1",
            Self::Portrait2x3 => "2:3",
            Self::Landscape3x2 => "3:2",
            Self::Portrait3x4 => "3:4",
            Self::Landscape4x3 => "4:3",
            Self::Portrait4x5 => "4:5",
            Self::Landscape5x4 => "5:4",
            Self::Portrait9x16 => "9:16",
            Self::Landscape16x9 => "16:9",
            Self::Ultrawide => "21:9",
            Self::Auto => "auto",
        }
    }
}

/// Output resolution tiers. Price depends on the tier.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Resolution {
    /// ~1024px on the long edge.
    #[default]
    #[serde(rename = "1K")]
    OneK,
    /// ~2048px.
    #[serde(rename = "2K")]
    TwoK,
    /// ~4096px.
    #[serde(rename = "4K")]
    FourK,
}

impl Resolution {
    /// Wire representation.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::OneK => "1K",
            Self::TwoK => "2K",
            Self::FourK => "4K",
        }
    }
}

/// Output file format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    /// PNG.
    #[default]
    Png,
    /// JPEG.
    Jpg,
}

impl OutputFormat {
    /// Wire representation.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Png => "png",
            Self::Jpg => "jpg",
        }
    }
}

/// Lifecycle state of a generation job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Persisted with a hold, not yet sent to the provider.
    Created,
    /// Submission to the provider is in progress.
    Submitting,
    /// Accepted by the provider, queued.
    Waiting,
    /// The provider reports work has started.
    Processing,
    /// Finished with a result. Hold settled.
    Succeeded,
    /// Finished without a result. Hold released.
    Failed,
    /// Timed out or abandoned. Hold released.
    Expired,
}

impl JobState {
    /// Whether the job has reached its final state.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Expired)
    }

    /// Whether the job is waiting on the provider and should be polled.
    #[must_use]
    pub const fn is_pending(self) -> bool {
        matches!(self, Self::Waiting | Self::Processing)
    }

    /// Whether the state machine has an edge from `self` to `to`.
    ///
    /// `Waiting → Waiting` and `Processing → Processing` are allowed so that
    /// poll bookkeeping can be written through the same guarded path.
    #[must_use]
    pub const fn can_transition_to(self, to: Self) -> bool {
        use JobState::{Created, Expired, Failed, Processing, Submitting, Succeeded, Waiting};
        matches!(
            (self, to),
            (Created, Submitting | Expired)
                | (Submitting, Waiting | Processing | Failed | Expired)
                | (Waiting, Waiting | Processing | Succeeded | Failed | Expired)
                | (Processing, Processing | Succeeded | Failed | Expired)
        )
    }

    /// Name used in API responses and logs.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Submitting => "submitting",
            Self::Waiting => "waiting",
            Self::Processing => "processing",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Expired => "expired",
        }
    }
}

/// A generation job and everything known about it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenerationJob {
    /// Caller-visible identifier.
    pub id: JobId,

    /// Who pays for the job.
    pub owner_id: UserId,

    /// Which provider integration runs the job.
    pub provider: String,

    /// Task id assigned by the provider once submission succeeds.
    pub provider_task_id: Option<String>,

    /// Credits held for the job, and charged on success.
    pub cost_estimate: i64,

    /// The original request.
    pub request: GenerationRequest,

    /// Current lifecycle state.
    pub state: JobState,

    /// Result URL once the job succeeded.
    pub result_ref: Option<String>,

    /// Internal failure detail. Not shown to users.
    pub failure_reason: Option<String>,

    /// Consecutive transient errors seen while talking to the provider.
    pub provider_errors: u32,

    /// When the job was created.
    pub created_at: DateTime<Utc>,

    /// When the job last changed.
    pub updated_at: DateTime<Utc>,

    /// When the job reached a terminal state.
    pub terminal_at: Option<DateTime<Utc>>,
}

impl GenerationJob {
    /// Create a job in the `Created` state.
    #[must_use]
    pub fn new(
        owner_id: UserId,
        provider: impl Into<String>,
        request: GenerationRequest,
        cost_estimate: i64,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: JobId::generate(),
            owner_id,
            provider: provider.into(),
            provider_task_id: None,
            cost_estimate,
            request,
            state: JobState::Created,
            result_ref: None,
            failure_reason: None,
            provider_errors: 0,
            created_at: now,
            updated_at: now,
            terminal_at: None,
        }
    }

    /// Whether the job has outlived `timeout` without reaching a terminal state.
    #[must_use]
    pub fn is_overdue(&self, now: DateTime<Utc>, timeout: Duration) -> bool {
        !self.state.is_terminal() && now - self.created_at > timeout
    }

    /// Apply a transition and report the ledger effect it implies.
    ///
    /// The caller is responsible for having checked that the persisted state
    /// is still `self.state` (compare-and-swap); this only enforces the
    /// shape of the state machine and the fields each edge needs.
    ///
    /// # Errors
    ///
    /// `IllegalTransition` if the edge does not exist, `InvalidRequest` if a
    /// required field is missing.
    pub fn apply(&mut self, transition: &JobTransition, now: DateTime<Utc>) -> Result<LedgerEffect> {
        let to = transition.to;
        if !self.state.can_transition_to(to) {
            return Err(BillingError::IllegalTransition {
                from: self.state,
                to,
            });
        }

        if let Some(task_id) = &transition.provider_task_id {
            self.provider_task_id = Some(task_id.clone());
        }
        if to.is_pending() && self.provider_task_id.is_none() {
            return Err(BillingError::InvalidRequest(
                "a job cannot wait on the provider without a task id".into(),
            ));
        }

        match to {
            JobState::Succeeded => {
                let result = transition.result_ref.clone().ok_or_else(|| {
                    BillingError::InvalidRequest("a succeeded job needs a result reference".into())
                })?;
                self.result_ref = Some(result);
            }
            JobState::Failed | JobState::Expired => {
                self.failure_reason = transition.failure_reason.clone();
            }
            _ => {}
        }

        if transition.provider_error {
            self.provider_errors = self.provider_errors.saturating_add(1);
        } else if to != self.state {
            self.provider_errors = 0;
        }

        self.state = to;
        self.updated_at = now;

        if !to.is_terminal() {
            return Ok(LedgerEffect::None);
        }
        self.terminal_at = Some(now);
        Ok(match to {
            JobState::Succeeded => LedgerEffect::Settle(self.cost_estimate),
            _ => LedgerEffect::Release(self.cost_estimate),
        })
    }
}

/// A requested state change plus the fields it carries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobTransition {
    /// Target state.
    pub to: JobState,
    /// Provider task id learned during submission.
    pub provider_task_id: Option<String>,
    /// Result URL for `Succeeded`.
    pub result_ref: Option<String>,
    /// Internal reason for `Failed` / `Expired`.
    pub failure_reason: Option<String>,
    /// Count one more transient provider error.
    pub provider_error: bool,
}

impl JobTransition {
    /// A bare transition to `to`.
    #[must_use]
    pub const fn to(to: JobState) -> Self {
        Self {
            to,
            provider_task_id: None,
            result_ref: None,
            failure_reason: None,
            provider_error: false,
        }
    }

    /// Provider accepted the job under `task_id`.
    #[must_use]
    pub fn accepted(task_id: impl Into<String>) -> Self {
        Self {
            provider_task_id: Some(task_id.into()),
            ..Self::to(JobState::Waiting)
        }
    }

    /// Provider finished the job with `result_ref`.
    #[must_use]
    pub fn succeeded(result_ref: impl Into<String>) -> Self {
        Self {
            result_ref: Some(result_ref.into()),
            ..Self::to(JobState::Succeeded)
        }
    }

    /// Job failed for `reason`.
    #[must_use]
    pub fn failed(reason: impl Into<String>) -> Self {
        Self {
            failure_reason: Some(reason.into()),
            ..Self::to(JobState::Failed)
        }
    }

    /// Job expired for `reason`.
    #[must_use]
    pub fn expired(reason: impl Into<String>) -> Self {
        Self {
            failure_reason: Some(reason.into()),
            ..Self::to(JobState::Expired)
        }
    }

    /// Stay in `state` but count a transient provider error.
    #[must_use]
    pub fn provider_error(state: JobState) -> Self {
        Self {
            provider_error: true,
            ..Self::to(state)
        }
    }
}

/// The ledger consequence of a job transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedgerEffect {
    /// Nothing to do.
    None,
    /// Convert the hold into a permanent debit.
    Settle(i64),
    /// Return the hold to the available balance.
    Release(i64),
}
