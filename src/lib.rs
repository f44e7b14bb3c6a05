pub mod config;
pub mod detection;
pub mod filter;
pub mod jobs;
pub mod models;
pub mod narrative;
pub mod normalizer;
pub mod output;
pub mod reputation;
pub mod synthesis;

// Re-export commonly used types
pub use models::{AnomalyFinding, JobStatistics, JobStatus, JobStatusView, LogRecord, RiskLevel};
pub use detection::AnomalyDetector;
pub use filter::{FilterRequest, FilterResult};
pub use jobs::{JobManager, Pipeline};
pub use normalizer::{Normalizer, RawInput};
pub use reputation::{ReputationAggregator, ReputationCache, ReputationProvider};
pub use synthesis::RiskSynthesizer;
