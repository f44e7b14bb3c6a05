pub mod finding;
pub mod job;
pub mod record;
pub mod reputation;
pub mod stats;

pub use finding::{AnomalyFinding, FindingCategory, FindingSeverity};
pub use job::{
    AiInsights, InsightSummary, JobId, JobStatus, JobStatusView, RiskLevel, SuspiciousAddress,
    SuspiciousIp,
};
pub use record::{LogRecord, Severity};
pub use reputation::ReputationResult;
pub use stats::{AddressCount, JobStatistics, PathCount};
