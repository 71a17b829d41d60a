//! Generation job reconciliation.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};

use imgen_core::{
    EventKey, GenerationJob, GenerationRequest, JobId, JobState, JobTransition, PricingConfig,
    UsageRecord, UserId,
};
use imgen_store::{Store, StoreError};

use super::ReconcileError;
use crate::analytics::UsageReporter;
use crate::config::JobSettings;
use crate::provider::{CallbackStatus, NormalizedState, NormalizedStatus, ProviderGateway};

/// Upper bound of the submit backoff.
const SUBMIT_MAX_BACKOFF: Duration = Duration::from_secs(5);

/// What an observation did to a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Observation {
    /// Nothing changed, or another worker won the race to change it.
    Unchanged,
    /// Moved to another non-terminal state.
    Progressed(JobState),
    /// Reached a terminal state and applied its ledger effect.
    Finalized(JobState),
    /// The job was already terminal; nothing was applied.
    AlreadyFinal,
}

/// Drives jobs through their lifecycle.
pub struct JobReconciler {
    store: Arc<dyn Store>,
    gateway: Arc<dyn ProviderGateway>,
    settings: JobSettings,
    pricing: PricingConfig,
    usage: UsageReporter,
}

impl JobReconciler {
    /// Create a reconciler.
    #[must_use]
    pub fn new(
        store: Arc<dyn Store>,
        gateway: Arc<dyn ProviderGateway>,
        settings: JobSettings,
        pricing: PricingConfig,
        usage: UsageReporter,
    ) -> Self {
        Self {
            store,
            gateway,
            settings,
            pricing,
            usage,
        }
    }

    /// The gateway jobs are dispatched to.
    #[must_use]
    pub fn gateway(&self) -> &Arc<dyn ProviderGateway> {
        &self.gateway
    }

    /// Price `request`, hold the price on the owner's account and persist a
    /// `Created` job. Nothing is persisted if the hold fails.
    ///
    /// # Errors
    ///
    /// `Billing` for an invalid request, or `Store` with
    /// `InsufficientCredits` when the owner cannot cover the price.
    pub fn submit_job(
        &self,
        owner_id: UserId,
        request: GenerationRequest,
    ) -> Result<GenerationJob, ReconcileError> {
        request.validate()?;
        let cost = self.pricing.cost_of(&request);
        let job = GenerationJob::new(owner_id, self.gateway.name(), request, cost);

        self.store.create_job(&job)?;

        tracing::info!(
            job_id = %job.id,
            user_id = %owner_id,
            cost = cost,
            resolution = job.request.resolution.as_str(),
            "Generation job created"
        );
        Ok(job)
    }

    /// Hand a `Created` job to the provider.
    ///
    /// Transient gateway errors are retried with exponential backoff up to the
    /// configured attempt count, after which the job expires. A rejected
    /// request fails the job at once. Both release the hold.
    ///
    /// # Errors
    ///
    /// `Store` with `StaleTransition` if the job is no longer `Created`.
    /// Gateway failures are not returned; they end the job instead.
    pub async fn dispatch(&self, job_id: &JobId) -> Result<GenerationJob, ReconcileError> {
        let job = self.store.transition_job(
            job_id,
            JobState::Created,
            &JobTransition::to(JobState::Submitting),
            None,
        )?;

        let mut attempt = 0;
        let mut backoff = self.settings.submit_backoff;

        loop {
            attempt += 1;
            match self.gateway.submit(&job.request).await {
                Ok(task_id) => {
                    let job = self.store.transition_job(
                        job_id,
                        JobState::Submitting,
                        &JobTransition::accepted(task_id.as_str()),
                        None,
                    )?;
                    tracing::info!(
                        job_id = %job_id,
                        task_id = %task_id,
                        attempt = attempt,
                        "Job accepted by provider"
                    );
                    return Ok(job);
                }
                Err(e) if !e.is_transient() => {
                    tracing::warn!(job_id = %job_id, error = %e, "Provider rejected job");
                    return self.finish(job_id, JobState::Submitting, JobTransition::failed(e.to_string()), None);
                }
                Err(e) if attempt >= self.settings.submit_max_attempts => {
                    tracing::warn!(
                        job_id = %job_id,
                        attempt = attempt,
                        error = %e,
                        "Provider unavailable, giving up on job"
                    );
                    return self.finish(
                        job_id,
                        JobState::Submitting,
                        JobTransition::expired(format!("submission abandoned after {attempt} attempts: {e}")),
                        None,
                    );
                }
                Err(e) => {
                    tracing::debug!(
                        job_id = %job_id,
                        attempt = attempt,
                        backoff = ?backoff,
                        error = %e,
                        "Submit failed, retrying"
                    );
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(SUBMIT_MAX_BACKOFF);
                }
            }
        }
    }

    /// Apply one status observation to `job`.
    ///
    /// Safe under concurrent and repeated delivery: the terminal effect is
    /// guarded by the job's compare-and-swap and by the `(provider, task)`
    /// idempotency key, and the loser of a race reports `Unchanged` or
    /// `AlreadyFinal` without touching the ledger.
    ///
    /// # Errors
    ///
    /// Returns an error only if the store fails.
    pub fn observe(
        &self,
        job: &GenerationJob,
        status: &NormalizedStatus,
    ) -> Result<Observation, ReconcileError> {
        if job.state.is_terminal() {
            return Ok(Observation::AlreadyFinal);
        }
        let Some(task_id) = job.provider_task_id.as_deref() else {
            // Not submitted yet, nothing to reconcile against.
            return Ok(Observation::Unchanged);
        };

        let transition = match (status.state, status.result_ref.as_deref()) {
            (NormalizedState::Waiting, _) => self.steady(job, JobState::Waiting),
            (NormalizedState::Processing, _) => self.steady(job, JobState::Processing),
            (NormalizedState::Success, Some(url)) => Some(JobTransition::succeeded(url)),
            (NormalizedState::Success, None) => self.steady(job, JobState::Processing),
            (NormalizedState::Failed, _) => Some(JobTransition::failed(
                status
                    .error_detail
                    .clone()
                    .unwrap_or_else(|| "provider reported failure".into()),
            )),
        };
        let Some(transition) = transition else {
            return Ok(Observation::Unchanged);
        };

        let event = EventKey::provider_task(&job.provider, task_id);
        let event = transition.to.is_terminal().then_some(event);
        match self.store.transition_job(&job.id, job.state, &transition, event.as_ref()) {
            Ok(updated) if updated.state.is_terminal() => {
                self.report_terminal(&updated);
                Ok(Observation::Finalized(updated.state))
            }
            Ok(updated) if updated.state == job.state => Ok(Observation::Unchanged),
            Ok(updated) => {
                tracing::debug!(job_id = %job.id, state = updated.state.as_str(), "Job progressed");
                Ok(Observation::Progressed(updated.state))
            }
            Err(StoreError::DuplicateEvent { event_id }) => {
                tracing::debug!(job_id = %job.id, event_id = %event_id, "Terminal status already processed");
                Ok(Observation::AlreadyFinal)
            }
            Err(StoreError::StaleTransition { .. }) => self.lost_race(&job.id),
            Err(e) => Err(e.into()),
        }
    }

    /// Apply a status pushed by the provider.
    ///
    /// Progress hints are applied as they come. A pushed terminal status is
    /// not trusted on its own: the task is re-fetched from the provider and
    /// that answer is applied instead.
    ///
    /// # Errors
    ///
    /// `NotFound` if no job carries the task id, otherwise as [`Self::poll`].
    pub async fn handle_callback(
        &self,
        callback: &CallbackStatus,
    ) -> Result<Observation, ReconcileError> {
        let job = self
            .store
            .get_job_by_task(self.gateway.name(), &callback.task_id)?
            .ok_or_else(|| ReconcileError::NotFound(format!("provider task {}", callback.task_id)))?;

        match callback.status.state {
            NormalizedState::Waiting | NormalizedState::Processing => {
                self.observe(&job, &callback.status)
            }
            NormalizedState::Success | NormalizedState::Failed => self.poll(&job).await,
        }
    }

    /// Fetch the provider status of one pending job and apply it.
    ///
    /// # Errors
    ///
    /// Storage failures. A provider that refuses the fetch fails the job
    /// rather than the call.
    pub async fn poll(&self, job: &GenerationJob) -> Result<Observation, ReconcileError> {
        let Some(task_id) = job.provider_task_id.as_deref() else {
            return Ok(Observation::Unchanged);
        };

        match self.gateway.fetch_status(task_id).await {
            Ok(status) => self.observe(job, &status),
            Err(e) if e.is_transient() => {
                let errors = job.provider_errors.saturating_add(1);
                let transition = if errors >= self.settings.max_poll_errors {
                    tracing::warn!(job_id = %job.id, errors = errors, error = %e, "Provider keeps failing, expiring job");
                    JobTransition::expired(format!("provider unavailable after {errors} attempts: {e}"))
                } else {
                    tracing::debug!(job_id = %job.id, errors = errors, error = %e, "Status fetch failed");
                    JobTransition::provider_error(job.state)
                };
                self.apply_fetch_outcome(job, &transition)
            }
            Err(e) => {
                tracing::warn!(job_id = %job.id, error = %e, "Provider refused status fetch, failing job");
                self.apply_fetch_outcome(job, &JobTransition::failed(e.to_string()))
            }
        }
    }

    /// Poll every pending job with bounded concurrency. Returns how many jobs
    /// reached a terminal state.
    ///
    /// # Errors
    ///
    /// Returns an error if the pending jobs cannot be listed. Per-job
    /// failures are logged and skipped.
    pub async fn poll_pending(&self) -> Result<usize, ReconcileError> {
        let jobs = self.store.list_pending_jobs()?;
        if jobs.is_empty() {
            return Ok(0);
        }

        let finalized = AtomicUsize::new(0);
        stream::iter(jobs)
            .for_each_concurrent(self.settings.poll_concurrency.max(1), |job| {
                let finalized = &finalized;
                async move {
                    match self.poll(&job).await {
                        Ok(Observation::Finalized(_)) => {
                            finalized.fetch_add(1, Ordering::Relaxed);
                        }
                        Ok(_) => {}
                        Err(e) => {
                            tracing::error!(job_id = %job.id, error = %e, "Failed to reconcile job");
                        }
                    }
                }
            })
            .await;

        Ok(finalized.into_inner())
    }

    /// Dispatch `Created` jobs older than the grace period whose background
    /// hand-off never ran, for instance because the process restarted.
    /// Returns how many were accepted by the provider.
    ///
    /// A job the request handler is still dispatching loses the
    /// `Created → Submitting` swap here and is skipped.
    ///
    /// # Errors
    ///
    /// Returns an error if the live jobs cannot be listed. Failures of single
    /// jobs are logged.
    pub async fn dispatch_stranded(&self, now: DateTime<Utc>) -> Result<usize, ReconcileError> {
        let grace = chrono::Duration::from_std(self.settings.dispatch_grace)
            .unwrap_or_else(|_| chrono::Duration::zero());
        let stranded: Vec<GenerationJob> = self
            .store
            .list_live_jobs()?
            .into_iter()
            .filter(|job| job.state == JobState::Created && now - job.created_at >= grace)
            .collect();
        if stranded.is_empty() {
            return Ok(0);
        }

        let accepted = AtomicUsize::new(0);
        stream::iter(stranded)
            .for_each_concurrent(self.settings.poll_concurrency.max(1), |job| {
                let accepted = &accepted;
                async move {
                    match self.dispatch(&job.id).await {
                        Ok(updated) if !updated.state.is_terminal() => {
                            accepted.fetch_add(1, Ordering::Relaxed);
                        }
                        Ok(_) | Err(ReconcileError::Store(StoreError::StaleTransition { .. })) => {}
                        Err(e) => {
                            tracing::error!(job_id = %job.id, error = %e, "Failed to dispatch stranded job");
                        }
                    }
                }
            })
            .await;

        let accepted = accepted.into_inner();
        if accepted > 0 {
            tracing::info!(count = accepted, "Dispatched stranded jobs");
        }
        Ok(accepted)
    }

    /// Expire every non-terminal job older than the configured timeout.
    /// Returns how many were expired.
    ///
    /// # Errors
    ///
    /// Propagates store errors from listing or expiring a job.
    pub fn expire_overdue(&self, now: DateTime<Utc>) -> Result<usize, ReconcileError> {
        let timeout = chrono::Duration::from_std(self.settings.timeout)
            .unwrap_or_else(|_| chrono::Duration::days(1));
        let mut expired = 0;

        for job in self.store.list_live_jobs()? {
            if !job.is_overdue(now, timeout) {
                continue;
            }
            let event = job
                .provider_task_id
                .as_deref()
                .map(|task_id| EventKey::provider_task(&job.provider, task_id));
            match self.finish(
                &job.id,
                job.state,
                JobTransition::expired("timed out waiting for provider"),
                event.as_ref(),
            ) {
                Ok(_) => expired += 1,
                Err(ReconcileError::Store(
                    StoreError::StaleTransition { .. } | StoreError::DuplicateEvent { .. },
                )) => {}
                Err(e) => {
                    tracing::error!(job_id = %job.id, error = %e, "Failed to expire job");
                }
            }
        }

        if expired > 0 {
            tracing::info!(count = expired, "Expired overdue jobs");
        }
        Ok(expired)
    }

    /// A same-state transition, only worth writing to clear an error streak.
    fn steady(&self, job: &GenerationJob, observed: JobState) -> Option<JobTransition> {
        if job.state == JobState::Processing && observed == JobState::Waiting {
            // Never move backwards; a stale "waiting" only clears errors.
            return (job.provider_errors > 0).then(|| JobTransition::to(JobState::Processing));
        }
        if job.state != observed {
            return Some(JobTransition::to(observed));
        }
        (job.provider_errors > 0).then(|| JobTransition::to(observed))
    }

    fn apply_fetch_outcome(
        &self,
        job: &GenerationJob,
        transition: &JobTransition,
    ) -> Result<Observation, ReconcileError> {
        let event = if transition.to.is_terminal() {
            job.provider_task_id
                .as_deref()
                .map(|task_id| EventKey::provider_task(&job.provider, task_id))
        } else {
            None
        };
        match self.store.transition_job(&job.id, job.state, transition, event.as_ref()) {
            Ok(updated) if updated.state.is_terminal() => {
                self.report_terminal(&updated);
                Ok(Observation::Finalized(updated.state))
            }
            Ok(_) => Ok(Observation::Unchanged),
            Err(StoreError::DuplicateEvent { .. }) => Ok(Observation::AlreadyFinal),
            Err(StoreError::StaleTransition { .. }) => self.lost_race(&job.id),
            Err(e) => Err(e.into()),
        }
    }

    fn finish(
        &self,
        job_id: &JobId,
        from: JobState,
        transition: JobTransition,
        event: Option<&EventKey>,
    ) -> Result<GenerationJob, ReconcileError> {
        let job = self.store.transition_job(job_id, from, &transition, event)?;
        self.report_terminal(&job);
        Ok(job)
    }

    fn lost_race(&self, job_id: &JobId) -> Result<Observation, ReconcileError> {
        let current = self
            .store
            .get_job(job_id)?
            .ok_or_else(|| ReconcileError::NotFound(format!("job {job_id}")))?;
        Ok(if current.state.is_terminal() {
            Observation::AlreadyFinal
        } else {
            Observation::Unchanged
        })
    }

    fn report_terminal(&self, job: &GenerationJob) {
        tracing::info!(
            job_id = %job.id,
            user_id = %job.owner_id,
            state = job.state.as_str(),
            reason = ?job.failure_reason,
            "Job finished"
        );
        if let Some(record) = UsageRecord::for_job(job) {
            self.usage.report(record);
        }
    }
}
