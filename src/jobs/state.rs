//! Per-job state machine
//!
//! All status changes go through [`JobHandle::transition`], which checks the
//! lifecycle under the job's lock. The first terminal status wins; any later
//! transition is rejected.

use chrono::{DateTime, Utc};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::watch;

use super::{JobError, JobOutcome};
use crate::models::{AiInsights, InsightSummary, JobId, JobStatus, JobStatusView, SuspiciousIp};

#[derive(Debug)]
struct JobState {
    status: JobStatus,
    history: Vec<JobStatus>,
    outcome: Option<Arc<JobOutcome>>,
    error: Option<String>,
    finished_at: Option<DateTime<Utc>>,
}

pub(crate) struct JobHandle {
    id: JobId,
    created_at: DateTime<Utc>,
    state: Mutex<JobState>,
    status_tx: watch::Sender<JobStatus>,
}

impl JobHandle {
    pub(crate) fn new(id: JobId) -> Self {
        let (status_tx, _) = watch::channel(JobStatus::Queued);
        JobHandle {
            id,
            created_at: Utc::now(),
            state: Mutex::new(JobState {
                status: JobStatus::Queued,
                history: vec![JobStatus::Queued],
                outcome: None,
                error: None,
                finished_at: None,
            }),
            status_tx,
        }
    }

    fn lock(&self) -> MutexGuard<'_, JobState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn status(&self) -> JobStatus {
        self.lock().status
    }

    pub(crate) fn is_canceled(&self) -> bool {
        self.status() == JobStatus::Canceled
    }

    pub(crate) fn history(&self) -> Vec<JobStatus> {
        self.lock().history.clone()
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<JobStatus> {
        self.status_tx.subscribe()
    }

    pub(crate) fn outcome(&self) -> Option<Arc<JobOutcome>> {
        self.lock().outcome.clone()
    }

    /// When the job reached its terminal status
    pub(crate) fn finished_at(&self) -> Option<DateTime<Utc>> {
        self.lock().finished_at
    }

    /// Move to `next` if the lifecycle allows it. `apply` runs under the
    /// same lock, so results land atomically with the status.
    fn transition(
        &self,
        next: JobStatus,
        apply: impl FnOnce(&mut JobState),
    ) -> Result<(), JobError> {
        let mut state = self.lock();
        if !state.status.can_transition_to(next) {
            log::warn!(
                "Job {}: rejected transition {} -> {}",
                self.id,
                state.status,
                next
            );
            return Err(JobError::InvalidTransition {
                from: state.status,
                to: next,
            });
        }
        apply(&mut state);
        if next.is_terminal() {
            state.finished_at = Some(Utc::now());
        }
        state.status = next;
        state.history.push(next);
        drop(state);

        log::info!("Job {} is now {}", self.id, next);
        self.status_tx.send_replace(next);
        Ok(())
    }

    /// Exclusive claim by the worker
    pub(crate) fn start(&self) -> Result<(), JobError> {
        self.transition(JobStatus::Processing, |_| {})
    }

    pub(crate) fn complete(&self, outcome: JobOutcome) -> Result<(), JobError> {
        self.transition(JobStatus::Completed, |state| {
            state.outcome = Some(Arc::new(outcome))
        })
    }

    pub(crate) fn fail(&self, cause: String) -> Result<(), JobError> {
        self.transition(JobStatus::Failed, |state| state.error = Some(cause))
    }

    pub(crate) fn cancel(&self) -> Result<(), JobError> {
        self.transition(JobStatus::Canceled, |_| {})
    }

    /// Read model; results are only exposed once completed
    pub(crate) fn view(&self) -> JobStatusView {
        let state = self.lock();
        let completed = state
            .outcome
            .as_ref()
            .filter(|_| state.status == JobStatus::Completed);

        JobStatusView {
            id: self.id,
            status: state.status,
            created_at: self.created_at,
            total_logs: completed.map(|o| o.records.len()).unwrap_or(0),
            skipped_records: completed.map(|o| o.skipped).unwrap_or(0),
            ai_insights: completed.map(|o| AiInsights {
                summary: InsightSummary {
                    risk_level: o.synthesis.risk_level,
                    total_anomalies: o.synthesis.total_anomalies,
                },
                concerns: o.synthesis.concerns.clone(),
                recommendations: o.synthesis.recommendations.clone(),
            }),
            suspicious_ips: completed
                .map(|o| o.synthesis.suspicious.iter().map(SuspiciousIp::from).collect())
                .unwrap_or_default(),
            statistics: completed.map(|o| o.statistics.clone()),
            error: state.error.clone(),
        }
    }
}
