//! Analysis pipeline: normalize, detect, look up reputation, synthesize
//!
//! Cancellation is cooperative and checked between stages. A stage that has
//! started runs to completion, so provider calls in flight still land in the
//! shared cache. Normalization and detection are CPU-bound and run on the
//! blocking pool.

use std::collections::BTreeSet;
use std::net::IpAddr;
use std::sync::Arc;
use thiserror::Error;

use super::JobOutcome;
use crate::config::Config;
use crate::detection::AnomalyDetector;
use crate::models::JobStatistics;
use crate::narrative::{NarrativeAnalyzer, NarrativeRequest, OllamaNarrator};
use crate::normalizer::{IngestionError, Normalizer, RawInput};
use crate::reputation::{ReputationAggregator, ReputationCache};
use crate::synthesis::RiskSynthesizer;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error(transparent)]
    Ingestion(#[from] IngestionError),

    #[error("job was canceled")]
    Canceled,

    #[error("pipeline setup failed: {0}")]
    Setup(String),

    #[error("analysis worker failed: {0}")]
    Worker(String),
}

fn setup(e: impl std::fmt::Display) -> PipelineError {
    PipelineError::Setup(e.to_string())
}

fn worker(e: tokio::task::JoinError) -> PipelineError {
    PipelineError::Worker(e.to_string())
}

pub struct Pipeline {
    normalizer: Arc<Normalizer>,
    detector: Arc<AnomalyDetector>,
    reputation: ReputationAggregator,
    synthesizer: RiskSynthesizer,
    narrator: Option<Arc<dyn NarrativeAnalyzer>>,
}

impl Pipeline {
    pub fn new(
        normalizer: Normalizer,
        detector: AnomalyDetector,
        reputation: ReputationAggregator,
        synthesizer: RiskSynthesizer,
    ) -> Self {
        Pipeline {
            normalizer: Arc::new(normalizer),
            detector: Arc::new(detector),
            reputation,
            synthesizer,
            narrator: None,
        }
    }

    pub fn with_narrator(mut self, narrator: Arc<dyn NarrativeAnalyzer>) -> Self {
        self.narrator = Some(narrator);
        self
    }

    /// Build every stage from configuration, sharing `cache` across jobs
    pub fn from_config(config: &Config, cache: Arc<ReputationCache>) -> Result<Self, PipelineError> {
        let normalizer = Normalizer::new(&config.normalizer).map_err(setup)?;
        let detector = AnomalyDetector::new(&config.detection).map_err(setup)?;
        let reputation =
            ReputationAggregator::from_config(&config.reputation, cache).map_err(setup)?;
        let mut pipeline = Pipeline::new(
            normalizer,
            detector,
            reputation,
            RiskSynthesizer::new(&config.synthesis),
        );

        if config.narrative.enabled {
            let narrator = OllamaNarrator::new(&config.narrative).map_err(setup)?;
            pipeline = pipeline.with_narrator(Arc::new(narrator));
        }
        Ok(pipeline)
    }

    pub fn reputation(&self) -> &ReputationAggregator {
        &self.reputation
    }

    /// Run every stage. `is_canceled` is polled between stages.
    pub async fn run<C>(&self, inputs: Vec<RawInput>, is_canceled: C) -> Result<JobOutcome, PipelineError>
    where
        C: Fn() -> bool,
    {
        let checkpoint = |stage: &str| {
            if is_canceled() {
                log::info!("Stopping before {}: job canceled", stage);
                Err(PipelineError::Canceled)
            } else {
                Ok(())
            }
        };

        checkpoint("normalization")?;
        let normalizer = Arc::clone(&self.normalizer);
        let normalized = tokio::task::spawn_blocking(move || normalizer.normalize(&inputs))
            .await
            .map_err(worker)??;
        log::info!(
            "Normalized {} records ({} dropped)",
            normalized.records.len(),
            normalized.skipped
        );

        checkpoint("detection")?;
        let detector = Arc::clone(&self.detector);
        let (normalized, statistics, findings) = tokio::task::spawn_blocking(move || {
            let findings = detector.detect(&normalized.records);
            let statistics = JobStatistics::from_records(&normalized.records);
            (normalized, statistics, findings)
        })
        .await
        .map_err(worker)?;

        checkpoint("reputation lookup")?;
        let addresses: BTreeSet<IpAddr> = findings.iter().map(|f| f.source_address).collect();
        let reputation = self.reputation.lookup(&addresses).await;

        checkpoint("synthesis")?;
        let narrative = match &self.narrator {
            Some(narrator) => {
                let request = NarrativeRequest::new(&normalized.records, &statistics, &findings);
                match narrator.analyze(&request).await {
                    Ok(narrative) => Some(narrative),
                    Err(e) => {
                        log::warn!("Narrative analysis unavailable: {}", e);
                        None
                    }
                }
            }
            None => None,
        };
        let synthesis = self
            .synthesizer
            .synthesize(&findings, &reputation, narrative.as_ref());

        Ok(JobOutcome {
            records: normalized.records,
            skipped: normalized.skipped,
            statistics,
            findings,
            synthesis,
        })
    }
}
