//! Analysis jobs
//!
//! A [`JobManager`] owns every submitted job. Each job runs on its own tokio
//! task through the [`Pipeline`] and moves through
//! `queued -> processing -> {completed | failed | canceled}`, reaching a
//! terminal status exactly once. Finished jobs are kept up to a retention
//! cap; the oldest are dropped when new jobs are submitted.

pub mod pipeline;
mod state;

pub use pipeline::{Pipeline, PipelineError};

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use thiserror::Error;
use tokio::sync::watch;
use uuid::Uuid;

use crate::config::JobsConfig;
use crate::filter::{FilterError, FilterRequest, FilterResult, RecordFilter};
use crate::models::{AnomalyFinding, JobId, JobStatistics, JobStatus, JobStatusView, LogRecord};
use crate::normalizer::RawInput;
use crate::synthesis::Synthesis;
use state::JobHandle;

#[derive(Error, Debug)]
pub enum JobError {
    #[error("job {0} not found")]
    NotFound(JobId),

    #[error("job cannot move from {from} to {to}")]
    InvalidTransition { from: JobStatus, to: JobStatus },
}

/// Immutable result of a completed job
#[derive(Debug, Clone)]
pub struct JobOutcome {
    pub records: Vec<LogRecord>,
    /// Records dropped as unparseable
    pub skipped: usize,
    pub statistics: JobStatistics,
    pub findings: Vec<AnomalyFinding>,
    pub synthesis: Synthesis,
}

pub struct JobManager {
    pipeline: Arc<Pipeline>,
    jobs: RwLock<HashMap<JobId, Arc<JobHandle>>>,
    max_matches: usize,
    max_finished: usize,
}

impl JobManager {
    pub fn new(pipeline: Pipeline, max_matches: usize) -> Self {
        JobManager {
            pipeline: Arc::new(pipeline),
            jobs: RwLock::new(HashMap::new()),
            max_matches,
            max_finished: JobsConfig::default().max_finished_jobs,
        }
    }

    /// Keep at most `max_finished` terminal jobs
    pub fn with_retention(mut self, max_finished: usize) -> Self {
        self.max_finished = max_finished;
        self
    }

    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    fn handle(&self, id: JobId) -> Result<Arc<JobHandle>, JobError> {
        self.jobs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .cloned()
            .ok_or(JobError::NotFound(id))
    }

    /// Queue a job and start its worker. Must be called within a tokio runtime.
    pub fn submit(&self, inputs: Vec<RawInput>) -> JobId {
        self.prune_finished();
        let id = Uuid::new_v4();
        let handle = Arc::new(JobHandle::new(id));
        self.jobs
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, Arc::clone(&handle));
        log::info!("Job {} queued with {} inputs", id, inputs.len());

        let pipeline = Arc::clone(&self.pipeline);
        tokio::spawn(run_job(pipeline, handle, inputs));
        id
    }

    pub fn status(&self, id: JobId) -> Result<JobStatusView, JobError> {
        Ok(self.handle(id)?.view())
    }

    /// Statuses the job has passed through, in order
    pub fn history(&self, id: JobId) -> Result<Vec<JobStatus>, JobError> {
        Ok(self.handle(id)?.history())
    }

    /// Cancel a queued or processing job. The worker stops at its next
    /// stage boundary.
    pub fn cancel(&self, id: JobId) -> Result<(), JobError> {
        self.handle(id)?.cancel()
    }

    pub fn subscribe(&self, id: JobId) -> Result<watch::Receiver<JobStatus>, JobError> {
        Ok(self.handle(id)?.subscribe())
    }

    /// Resolve once the job is terminal
    pub async fn wait(&self, id: JobId) -> Result<JobStatusView, JobError> {
        let handle = self.handle(id)?;
        let mut rx = handle.subscribe();
        loop {
            let status = *rx.borrow_and_update();
            if status.is_terminal() || rx.changed().await.is_err() {
                break;
            }
        }
        Ok(handle.view())
    }

    /// Result of a completed job
    pub fn outcome(&self, id: JobId) -> Result<Option<Arc<JobOutcome>>, JobError> {
        Ok(self.handle(id)?.outcome())
    }

    /// Views of every job, oldest first
    pub fn list(&self) -> Vec<JobStatusView> {
        let mut views: Vec<JobStatusView> = self
            .jobs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .map(|handle| handle.view())
            .collect();
        views.sort_by_key(|view| view.created_at);
        views
    }

    /// Drop the oldest terminal jobs beyond the retention cap. Queued and
    /// processing jobs are never dropped.
    pub fn prune_finished(&self) -> usize {
        let mut jobs = self.jobs.write().unwrap_or_else(PoisonError::into_inner);
        let mut finished: Vec<(DateTime<Utc>, JobId)> = jobs
            .iter()
            .filter_map(|(id, handle)| handle.finished_at().map(|at| (at, *id)))
            .collect();
        if finished.len() <= self.max_finished {
            return 0;
        }

        finished.sort();
        let excess = finished.len() - self.max_finished;
        for (_, id) in finished.iter().take(excess) {
            jobs.remove(id);
        }
        log::debug!("Dropped {} finished jobs past the retention cap", excess);
        excess
    }

    /// Query a completed job's records
    pub fn filter(&self, id: JobId, request: &FilterRequest) -> Result<FilterResult, FilterError> {
        let handle = self.handle(id)?;
        let status = handle.status();
        let outcome = handle
            .outcome()
            .filter(|_| status == JobStatus::Completed)
            .ok_or_else(|| {
                FilterError::InvalidFilter(format!("job {} is {}, not completed", id, status))
            })?;

        let filter = RecordFilter::from_request(request)?;
        Ok(filter.apply(&outcome.records, self.max_matches))
    }
}

async fn run_job(pipeline: Arc<Pipeline>, handle: Arc<JobHandle>, inputs: Vec<RawInput>) {
    if handle.start().is_err() {
        // Canceled while queued
        return;
    }

    let worker = {
        let handle = Arc::clone(&handle);
        tokio::spawn(async move { pipeline.run(inputs, || handle.is_canceled()).await })
    };

    let settled = match worker.await {
        Ok(Ok(outcome)) => handle.complete(outcome),
        Ok(Err(PipelineError::Canceled)) => Ok(()),
        Ok(Err(e)) => {
            log::error!("Job failed: {}", e);
            handle.fail(e.to_string())
        }
        Err(e) => {
            log::error!("Job worker aborted: {}", e);
            handle.fail(format!("analysis worker aborted: {}", e))
        }
    };
    if let Err(e) = settled {
        log::debug!("Job result discarded: {}", e);
    }
}
