//! Generation job handlers.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use serde::Serialize;

use imgen_core::{GenerationJob, GenerationRequest, JobId, JobState};
use imgen_store::Store;

use crate::auth::AuthUser;
use crate::error::ApiError;
use crate::reconciler::GENERATION_FAILED_MESSAGE;
use crate::state::AppState;

/// Response to a job submission.
#[derive(Debug, Serialize)]
pub struct SubmitJobResponse {
    /// Job ID to poll.
    pub job_id: String,
    /// Credits held for the job.
    pub cost: i64,
    /// Initial state.
    pub state: JobState,
}

/// Submit a generation job.
///
/// The cost is held before this returns; the provider call happens in the
/// background.
pub async fn submit_job(
    State(state): State<Arc<AppState>>,
    auth: AuthUser,
    Json(request): Json<GenerationRequest>,
) -> Result<(StatusCode, Json<SubmitJobResponse>), ApiError> {
    let job = state.jobs.submit_job(auth.user_id, request)?;

    let jobs = Arc::clone(&state.jobs);
    let job_id = job.id;
    tokio::spawn(async move {
        if let Err(e) = jobs.dispatch(&job_id).await {
            tracing::error!(job_id = %job_id, error = %e, "Job dispatch failed");
        }
    });

    Ok((
        StatusCode::ACCEPTED,
        Json(SubmitJobResponse {
            job_id: job.id.to_string(),
            cost: job.cost_estimate,
            state: job.state,
        }),
    ))
}

/// Job status response.
#[derive(Debug, Serialize)]
pub struct JobResponse {
    /// Job ID.
    pub job_id: String,
    /// Lifecycle state.
    pub state: JobState,
    /// Credits held or charged.
    pub cost: i64,
    /// Result URL once succeeded.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result_url: Option<String>,
    /// User-facing failure message.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// The submitted request.
    pub request: GenerationRequest,
    /// Created timestamp.
    pub created_at: String,
    /// When the job finished.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<String>,
}

impl From<GenerationJob> for JobResponse {
    fn from(job: GenerationJob) -> Self {
        let error = matches!(job.state, JobState::Failed | JobState::Expired)
            .then(|| GENERATION_FAILED_MESSAGE.to_string());
        Self {
            job_id: job.id.to_string(),
            state: job.state,
            cost: job.cost_estimate,
            result_url: job.result_ref,
            error,
            request: job.request,
            created_at: job.created_at.to_rfc3339(),
            completed_at: job.terminal_at.map(|t| t.to_rfc3339()),
        }
    }
}

/// Get the status of one of the caller's jobs.
pub async fn get_job(
    State(state): State<Arc<AppState>>,
    auth: AuthUser,
    Path(job_id): Path<String>,
) -> Result<Json<JobResponse>, ApiError> {
    let job_id: JobId = job_id
        .parse()
        .map_err(|_| ApiError::BadRequest("Invalid job ID".into()))?;

    let job = state
        .store
        .get_job(&job_id)?
        .filter(|job| job.owner_id == auth.user_id)
        .ok_or_else(|| ApiError::NotFound("Job not found".into()))?;

    Ok(Json(JobResponse::from(job)))
}
