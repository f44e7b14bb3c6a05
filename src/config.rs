use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

/// Errors raised while loading or validating configuration
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Configuration for the analysis pipeline
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Log format normalization
    pub normalizer: NormalizerConfig,
    /// Anomaly detection rules
    pub detection: DetectionConfig,
    /// Reputation providers, cache and fan-out limits
    pub reputation: ReputationConfig,
    /// Risk score weighting
    pub synthesis: SynthesisConfig,
    /// Generative narrative collaborator
    pub narrative: NarrativeConfig,
    /// Filter query limits
    pub filter: FilterConfig,
    /// Job retention
    pub jobs: JobsConfig,
    /// CLI output
    pub output: OutputConfig,
}

/// Normalizer configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NormalizerConfig {
    /// Year assumed for syslog timestamps, which carry none (defaults to the current year)
    pub reference_year: Option<i32>,
}

/// Detection rules configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectionConfig {
    /// Sliding window for failed-auth counting, in seconds
    pub brute_force_window_seconds: i64,
    /// Failed attempts per address within the window before a finding trips
    pub brute_force_threshold: usize,
    /// Standard deviations above the mean request volume that mark an outlier
    pub outlier_stddev_factor: f64,
    /// Minimum records from one address before it can be an outlier
    pub outlier_min_events: usize,
    /// ERROR and CRITICAL records a job needs before bursts are considered
    pub error_burst_min_total: usize,
    /// Error records within one minute above which the minute is a burst
    pub error_burst_per_minute: usize,
    /// Share of records with a 5xx status above which the job is flagged
    pub server_error_rate: f64,
    /// Most frequent user agents checked for crawler signatures
    pub bot_user_agent_top: usize,
    /// Rule weights feeding finding confidence
    pub weights: RuleWeights,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuleWeights {
    pub sql_injection: f64,
    pub xss: f64,
    pub path_traversal: f64,
    pub sensitive_exposure: f64,
    pub brute_force: f64,
    pub statistical_outlier: f64,
    pub error_burst: f64,
    pub server_errors: f64,
    pub bot_activity: f64,
}

/// Reputation aggregation configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReputationConfig {
    /// Maximum provider calls in flight at once
    pub max_concurrency: usize,
    /// Per-call timeout in milliseconds
    pub provider_timeout_ms: u64,
    /// Cache time-to-live in seconds
    pub cache_ttl_seconds: i64,
    pub abuseipdb: AbuseIpDbConfig,
    pub virustotal: VirusTotalConfig,
    pub blocklist: BlocklistConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AbuseIpDbConfig {
    /// API key; falls back to the ABUSEIPDB_API_KEY environment variable
    pub api_key: Option<String>,
    pub base_url: String,
    pub max_age_days: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VirusTotalConfig {
    /// API key; falls back to the VIRUSTOTAL_API_KEY environment variable
    pub api_key: Option<String>,
    pub base_url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BlocklistConfig {
    /// Use public blocklists even when keyed providers are configured
    pub always_enabled: bool,
    pub urls: Vec<String>,
    /// Score reported for a listed address
    pub listed_score: f64,
}

/// Risk synthesis configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SynthesisConfig {
    pub reputation_weight: f64,
    pub anomaly_weight: f64,
    /// Aggregated score above which an address is flagged malicious
    pub high_risk_threshold: f64,
    pub severity_weights: SeverityWeights,
}

/// Points a finding of each severity contributes at full confidence
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SeverityWeights {
    pub low: f64,
    pub medium: f64,
    pub high: f64,
    pub critical: f64,
}

/// Narrative collaborator configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NarrativeConfig {
    pub enabled: bool,
    /// Base URL of the Ollama server
    pub url: String,
    pub model: String,
    pub timeout_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterConfig {
    /// Cap on records returned by one filter query
    pub max_matches: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct JobsConfig {
    /// Finished jobs kept in memory; the oldest are dropped past this
    pub max_finished_jobs: usize,
}

/// Output configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    /// Output format: "json", "jsonl", or "console"
    pub format: String,
    /// Output file path (stdout when absent)
    pub file_path: Option<PathBuf>,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        DetectionConfig {
            brute_force_window_seconds: 300,
            brute_force_threshold: 5,
            outlier_stddev_factor: 3.0,
            outlier_min_events: 20,
            error_burst_min_total: 10,
            error_burst_per_minute: 5,
            server_error_rate: 0.05,
            bot_user_agent_top: 5,
            weights: RuleWeights::default(),
        }
    }
}

impl Default for RuleWeights {
    fn default() -> Self {
        RuleWeights {
            sql_injection: 0.9,
            xss: 0.85,
            path_traversal: 0.8,
            sensitive_exposure: 0.7,
            brute_force: 0.6,
            statistical_outlier: 0.5,
            error_burst: 0.6,
            server_errors: 0.5,
            bot_activity: 0.4,
        }
    }
}

impl Default for ReputationConfig {
    fn default() -> Self {
        ReputationConfig {
            max_concurrency: 8,
            provider_timeout_ms: 10_000,
            cache_ttl_seconds: 24 * 3600,
            abuseipdb: AbuseIpDbConfig::default(),
            virustotal: VirusTotalConfig::default(),
            blocklist: BlocklistConfig::default(),
        }
    }
}

impl Default for AbuseIpDbConfig {
    fn default() -> Self {
        AbuseIpDbConfig {
            api_key: None,
            base_url: "https://api.abuseipdb.com/api/v2".to_string(),
            max_age_days: 90,
        }
    }
}

impl Default for VirusTotalConfig {
    fn default() -> Self {
        VirusTotalConfig {
            api_key: None,
            base_url: "https://www.virustotal.com/api/v3".to_string(),
        }
    }
}

impl Default for BlocklistConfig {
    fn default() -> Self {
        BlocklistConfig {
            always_enabled: false,
            urls: vec![
                "https://raw.githubusercontent.com/stamparm/ipsum/master/ipsum.txt".to_string(),
                "https://lists.blocklist.de/lists/all.txt".to_string(),
            ],
            listed_score: 75.0,
        }
    }
}

impl Default for SynthesisConfig {
    fn default() -> Self {
        SynthesisConfig {
            reputation_weight: 1.0,
            anomaly_weight: 0.5,
            high_risk_threshold: 70.0,
            severity_weights: SeverityWeights::default(),
        }
    }
}

impl Default for SeverityWeights {
    fn default() -> Self {
        SeverityWeights {
            low: 10.0,
            medium: 25.0,
            high: 40.0,
            critical: 60.0,
        }
    }
}

impl Default for NarrativeConfig {
    fn default() -> Self {
        NarrativeConfig {
            enabled: false,
            url: "http://localhost:11434".to_string(),
            model: "llama3.2".to_string(),
            timeout_seconds: 60,
        }
    }
}

impl Default for FilterConfig {
    fn default() -> Self {
        FilterConfig { max_matches: 1000 }
    }
}

impl Default for JobsConfig {
    fn default() -> Self {
        JobsConfig {
            max_finished_jobs: 100,
        }
    }
}

impl Default for OutputConfig {
    fn default() -> Self {
        OutputConfig {
            format: "json".to_string(),
            file_path: None,
        }
    }
}

impl Config {
    /// Load configuration from a file
    pub fn from_file(path: &PathBuf) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a file
    pub fn to_file(&self, path: &PathBuf) -> Result<(), ConfigError> {
        let contents = toml::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    /// Reject settings the pipeline cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        let s = &self.synthesis;
        let d = &self.detection;
        let w = &d.weights;
        let sw = &s.severity_weights;
        let numbers = [
            ("synthesis.reputation_weight", s.reputation_weight),
            ("synthesis.anomaly_weight", s.anomaly_weight),
            ("synthesis.high_risk_threshold", s.high_risk_threshold),
            ("synthesis.severity_weights.low", sw.low),
            ("synthesis.severity_weights.medium", sw.medium),
            ("synthesis.severity_weights.high", sw.high),
            ("synthesis.severity_weights.critical", sw.critical),
            ("detection.outlier_stddev_factor", d.outlier_stddev_factor),
            ("detection.server_error_rate", d.server_error_rate),
            ("detection.weights.sql_injection", w.sql_injection),
            ("detection.weights.xss", w.xss),
            ("detection.weights.path_traversal", w.path_traversal),
            ("detection.weights.sensitive_exposure", w.sensitive_exposure),
            ("detection.weights.brute_force", w.brute_force),
            ("detection.weights.statistical_outlier", w.statistical_outlier),
            ("detection.weights.error_burst", w.error_burst),
            ("detection.weights.server_errors", w.server_errors),
            ("detection.weights.bot_activity", w.bot_activity),
        ];
        for (name, value) in numbers {
            if !value.is_finite() || value < 0.0 {
                return Err(ConfigError::Invalid(format!(
                    "{} must be a finite, non-negative number (got {})",
                    name, value
                )));
            }
        }
        if d.server_error_rate > 1.0 {
            return Err(ConfigError::Invalid(
                "detection.server_error_rate is a fraction within 0..=1".to_string(),
            ));
        }

        if s.reputation_weight <= 0.0 || s.anomaly_weight <= 0.0 {
            return Err(ConfigError::Invalid(
                "synthesis weights must be positive".to_string(),
            ));
        }
        if s.anomaly_weight > s.reputation_weight {
            return Err(ConfigError::Invalid(format!(
                "anomaly_weight ({}) must not exceed reputation_weight ({})",
                s.anomaly_weight, s.reputation_weight
            )));
        }
        if !(0.0..=100.0).contains(&s.high_risk_threshold) {
            return Err(ConfigError::Invalid(
                "high_risk_threshold must be within 0..=100".to_string(),
            ));
        }
        if self.reputation.max_concurrency == 0 {
            return Err(ConfigError::Invalid(
                "reputation.max_concurrency must be at least 1".to_string(),
            ));
        }
        if self.detection.brute_force_threshold == 0 {
            return Err(ConfigError::Invalid(
                "detection.brute_force_threshold must be at least 1".to_string(),
            ));
        }
        if self.detection.brute_force_window_seconds <= 0 {
            return Err(ConfigError::Invalid(
                "detection.brute_force_window_seconds must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_default_config_is_valid() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn test_roundtrip_through_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("loglens.toml");

        let mut config = Config::default();
        config.detection.brute_force_threshold = 12;
        config.to_file(&path).unwrap();

        let loaded = Config::from_file(&path).unwrap();
        assert_eq!(loaded.detection.brute_force_threshold, 12);
        assert_eq!(loaded.reputation.max_concurrency, 8);
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("partial.toml");
        std::fs::write(&path, "[synthesis]\nanomaly_weight = 0.25\n").unwrap();

        let loaded = Config::from_file(&path).unwrap();
        assert_eq!(loaded.synthesis.anomaly_weight, 0.25);
        assert_eq!(loaded.synthesis.reputation_weight, 1.0);
        assert_eq!(loaded.filter.max_matches, 1000);
    }

    #[test]
    fn test_anomaly_weight_cannot_dominate() {
        let mut config = Config::default();
        config.synthesis.anomaly_weight = 2.0;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_nan_and_negative_numbers_rejected() {
        let mut config = Config::default();
        config.detection.outlier_stddev_factor = f64::NAN;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let mut config = Config::default();
        config.detection.outlier_stddev_factor = -1.0;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let mut config = Config::default();
        config.synthesis.severity_weights.high = -40.0;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let mut config = Config::default();
        config.detection.weights.xss = f64::INFINITY;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let mut config = Config::default();
        config.synthesis.anomaly_weight = f64::NAN;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_nan_weight_in_file_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nan.toml");
        std::fs::write(&path, "[detection.weights]\nsql_injection = nan\n").unwrap();
        assert!(matches!(Config::from_file(&path), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_server_error_rate_is_a_fraction() {
        let mut config = Config::default();
        config.detection.server_error_rate = 5.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_concurrency_rejected() {
        let mut config = Config::default();
        config.reputation.max_concurrency = 0;
        assert!(config.validate().is_err());
    }
}
