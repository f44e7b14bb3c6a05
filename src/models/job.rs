use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::net::IpAddr;
use uuid::Uuid;

use super::finding::AnomalyFinding;
use super::stats::JobStatistics;

pub type JobId = Uuid;

/// Lifecycle state of an analysis job.
///
/// Variants are declared in lifecycle order, so `Ord` follows it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Processing,
    Completed,
    Failed,
    Canceled,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Canceled
        )
    }

    /// Whether moving from `self` to `next` is a legal lifecycle step
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        matches!(
            (self, next),
            (JobStatus::Queued, JobStatus::Processing)
                | (JobStatus::Queued, JobStatus::Canceled)
                | (JobStatus::Processing, JobStatus::Completed)
                | (JobStatus::Processing, JobStatus::Failed)
                | (JobStatus::Processing, JobStatus::Canceled)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Canceled => "canceled",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Coarse job-wide classification derived from the worst address score
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    Critical,
}

impl RiskLevel {
    /// Classify a 0-100 score: critical >= 90, high >= 70, medium >= 40
    pub fn from_score(score: u8) -> Self {
        match score {
            90..=255 => RiskLevel::Critical,
            70..=89 => RiskLevel::High,
            40..=69 => RiskLevel::Medium,
            _ => RiskLevel::Low,
        }
    }
}

impl fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RiskLevel::Low => "low",
            RiskLevel::Medium => "medium",
            RiskLevel::High => "high",
            RiskLevel::Critical => "critical",
        };
        f.write_str(s)
    }
}

/// Per-address synthesis result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SuspiciousAddress {
    pub source_address: IpAddr,
    pub aggregated_risk_score: u8,
    pub per_source_scores: BTreeMap<String, f64>,
    pub is_malicious: bool,
    pub contributing_findings: Vec<AnomalyFinding>,
}

/// Status read model handed to polling clients
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobStatusView {
    pub id: JobId,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub total_logs: usize,
    /// Records dropped as unparseable
    pub skipped_records: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ai_insights: Option<AiInsights>,
    pub suspicious_ips: Vec<SuspiciousIp>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub statistics: Option<JobStatistics>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AiInsights {
    pub summary: InsightSummary,
    pub concerns: Vec<String>,
    pub recommendations: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InsightSummary {
    pub risk_level: RiskLevel,
    pub total_anomalies: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SuspiciousIp {
    pub ip: String,
    pub risk_score: u8,
    pub sources: BTreeMap<String, f64>,
    pub is_malicious: bool,
}

impl From<&SuspiciousAddress> for SuspiciousIp {
    fn from(addr: &SuspiciousAddress) -> Self {
        SuspiciousIp {
            ip: addr.source_address.to_string(),
            risk_score: addr.aggregated_risk_score,
            sources: addr.per_source_scores.clone(),
            is_malicious: addr.is_malicious,
        }
    }
}
