use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;

/// Kind of anomaly a finding reports
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FindingCategory {
    SqlInjection,
    Xss,
    PathTraversal,
    BruteForce,
    SensitiveExposure,
    StatisticalOutlier,
    ErrorBurst,
    ServerErrorRate,
    BotActivity,
}

impl FindingCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            FindingCategory::SqlInjection => "sql_injection",
            FindingCategory::Xss => "xss",
            FindingCategory::PathTraversal => "path_traversal",
            FindingCategory::BruteForce => "brute_force",
            FindingCategory::SensitiveExposure => "sensitive_exposure",
            FindingCategory::StatisticalOutlier => "statistical_outlier",
            FindingCategory::ErrorBurst => "error_burst",
            FindingCategory::ServerErrorRate => "server_error_rate",
            FindingCategory::BotActivity => "bot_activity",
        }
    }
}

impl fmt::Display for FindingCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How serious a finding is, independent of the confidence in it
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FindingSeverity {
    Low,
    Medium,
    High,
    Critical,
}

/// A detected anomaly tied to a source address and the record that evidences it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnomalyFinding {
    pub source_address: IpAddr,
    pub category: FindingCategory,
    pub severity: FindingSeverity,
    /// Confidence in [0, 1]
    pub confidence: f64,
    /// Index of the evidence record in the job's record list
    pub evidence_record_ref: usize,
    pub description: String,
}
