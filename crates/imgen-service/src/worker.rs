//! Background reconciliation loop.
//!
//! Each tick, in order: expire overdue jobs, dispatch jobs stranded in
//! `Created`, poll pending jobs, expire stale payment intents, finish intents
//! left in `Matched`. A failing step is logged and the tick moves on.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;

use crate::reconciler::{JobReconciler, PaymentReconciler};
use crate::state::AppState;

/// Periodic driver of both reconcilers.
pub struct Worker {
    jobs: Arc<JobReconciler>,
    payments: Arc<PaymentReconciler>,
    interval: Duration,
}

impl Worker {
    /// Create a worker ticking every `interval`.
    #[must_use]
    pub fn new(
        jobs: Arc<JobReconciler>,
        payments: Arc<PaymentReconciler>,
        interval: Duration,
    ) -> Self {
        Self {
            jobs,
            payments,
            interval,
        }
    }

    /// Create a worker from application state.
    #[must_use]
    pub fn from_state(state: &AppState) -> Self {
        Self::new(
            state.jobs.clone(),
            state.payments.clone(),
            Duration::from_secs(state.config.poll_interval_seconds.max(1)),
        )
    }

    /// Run one reconciliation pass.
    pub async fn tick(&self) {
        let now = Utc::now();

        if let Err(e) = self.jobs.expire_overdue(now) {
            tracing::error!(error = %e, "Job expiry sweep failed");
        }

        if let Err(e) = self.jobs.dispatch_stranded(now).await {
            tracing::error!(error = %e, "Stranded job dispatch failed");
        }

        match self.jobs.poll_pending().await {
            Ok(0) => {}
            Ok(finalized) => tracing::debug!(finalized = finalized, "Poll pass finished jobs"),
            Err(e) => tracing::error!(error = %e, "Job poll pass failed"),
        }

        if let Err(e) = self.payments.expire_intents(now) {
            tracing::error!(error = %e, "Payment intent expiry sweep failed");
        }

        match self.payments.resume_matched() {
            Ok(0) => {}
            Ok(completed) => tracing::info!(completed = completed, "Resumed matched payments"),
            Err(e) => tracing::error!(error = %e, "Payment resume pass failed"),
        }
    }

    /// Tick until `shutdown` flips to `true` or its sender is dropped.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tracing::info!(interval = ?self.interval, "Reconciliation worker started");

        loop {
            tokio::select! {
                _ = ticker.tick() => self.tick().await,
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        tracing::info!("Reconciliation worker stopped");
    }
}
