//! Generative narrative collaborator
//!
//! Asks a language model for free-text security concerns and
//! recommendations about a job. The narrative is best effort: callers treat
//! any error as an empty narrative.

use async_trait::async_trait;
use regex::Regex;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::time::Duration;
use thiserror::Error;

use crate::config::NarrativeConfig;
use crate::models::{AnomalyFinding, FindingCategory, JobStatistics, LogRecord};

/// Records included verbatim in the prompt
const SAMPLE_SIZE: usize = 10;
/// Length of unstructured model output kept as a single concern
const FALLBACK_CHARS: usize = 200;

#[derive(Error, Debug)]
pub enum NarrativeError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("narrative service returned {status}: {body}")]
    Service { status: u16, body: String },

    #[error("narrative service timed out after {0} seconds")]
    Timeout(u64),

    #[error("invalid narrative response: {0}")]
    InvalidResponse(String),
}

/// What the model is told about a job
#[derive(Debug, Clone, Default)]
pub struct NarrativeRequest {
    pub sample: Vec<LogRecord>,
    pub total_logs: usize,
    /// Share of ERROR and CRITICAL records, in percent
    pub error_rate: f64,
    pub finding_counts: BTreeMap<FindingCategory, usize>,
}

impl NarrativeRequest {
    pub fn new(records: &[LogRecord], statistics: &JobStatistics, findings: &[AnomalyFinding]) -> Self {
        let mut finding_counts = BTreeMap::new();
        for finding in findings {
            *finding_counts.entry(finding.category).or_insert(0) += 1;
        }

        NarrativeRequest {
            sample: records.iter().take(SAMPLE_SIZE).cloned().collect(),
            total_logs: statistics.total_logs,
            error_rate: statistics.error_rate,
            finding_counts,
        }
    }

    pub fn prompt(&self) -> String {
        let sample = serde_json::to_string(&self.sample).unwrap_or_else(|_| "[]".to_string());
        let findings = if self.finding_counts.is_empty() {
            "none".to_string()
        } else {
            self.finding_counts
                .iter()
                .map(|(category, count)| format!("{}: {}", category, count))
                .collect::<Vec<_>>()
                .join(", ")
        };

        format!(
            "Analyze these log entries and provide security insights:\n\n\
             Log Sample:\n{}\n\n\
             Total logs: {}\n\
             Error rate: {:.2}%\n\
             Detected anomalies: {}\n\n\
             Provide:\n\
             1. Main security concerns\n\
             2. Potential attack patterns\n\
             3. Recommendations for improvement\n\
             4. Priority actions\n\n\
             Format as JSON with keys: concerns, patterns, recommendations, priority_actions",
            sample, self.total_logs, self.error_rate, findings
        )
    }
}

/// Free-text findings from the model
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Narrative {
    pub concerns: Vec<String>,
    pub recommendations: Vec<String>,
}

impl Narrative {
    pub fn is_empty(&self) -> bool {
        self.concerns.is_empty() && self.recommendations.is_empty()
    }
}

#[async_trait]
pub trait NarrativeAnalyzer: Send + Sync {
    async fn analyze(&self, request: &NarrativeRequest) -> Result<Narrative, NarrativeError>;
}

/// Narrative backed by an Ollama server's `/api/generate`
pub struct OllamaNarrator {
    client: reqwest::Client,
    url: String,
    model: String,
    timeout: Duration,
    json_block: Regex,
}

impl OllamaNarrator {
    pub fn new(config: &NarrativeConfig) -> Result<Self, NarrativeError> {
        let json_block = Regex::new(r"(?s)\{.*\}")
            .map_err(|e| NarrativeError::InvalidResponse(e.to_string()))?;
        Ok(OllamaNarrator {
            client: reqwest::Client::builder().build()?,
            url: config.url.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            timeout: Duration::from_secs(config.timeout_seconds),
            json_block,
        })
    }

    async fn generate(&self, prompt: String) -> Result<String, NarrativeError> {
        let body = json!({
            "model": self.model,
            "prompt": prompt,
            "stream": false,
        });
        log::debug!("Narrative request to {}/api/generate", self.url);

        let response = self
            .client
            .post(format!("{}/api/generate", self.url))
            .json(&body)
            .send()
            .await?;

        let status = response.status().as_u16();
        if status != 200 {
            let body = response.text().await.unwrap_or_default();
            return Err(NarrativeError::Service { status, body });
        }

        let resp: Value = response.json().await?;
        resp["response"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| NarrativeError::InvalidResponse("missing response field".to_string()))
    }

    /// Read concerns and recommendations from model output. A JSON object
    /// embedded in the text is preferred; otherwise the leading text becomes
    /// a single concern.
    pub fn parse_response(&self, text: &str) -> Narrative {
        let parsed = self
            .json_block
            .find(text)
            .and_then(|m| serde_json::from_str::<Value>(m.as_str()).ok());

        match parsed {
            Some(value) => Narrative {
                concerns: [strings(&value["concerns"]), strings(&value["patterns"])].concat(),
                recommendations: [
                    strings(&value["recommendations"]),
                    strings(&value["priority_actions"]),
                ]
                .concat(),
            },
            None if text.trim().is_empty() => Narrative::default(),
            None => Narrative {
                concerns: vec![text.trim().chars().take(FALLBACK_CHARS).collect()],
                recommendations: vec!["Review logs manually".to_string()],
            },
        }
    }
}

#[async_trait]
impl NarrativeAnalyzer for OllamaNarrator {
    async fn analyze(&self, request: &NarrativeRequest) -> Result<Narrative, NarrativeError> {
        let text = tokio::time::timeout(self.timeout, self.generate(request.prompt()))
            .await
            .map_err(|_| NarrativeError::Timeout(self.timeout.as_secs()))??;
        Ok(self.parse_response(&text))
    }
}

/// String items of a JSON array; objects contribute their description
fn strings(value: &Value) -> Vec<String> {
    let Some(items) = value.as_array() else {
        return match value.as_str() {
            Some(s) if !s.trim().is_empty() => vec![s.trim().to_string()],
            _ => Vec::new(),
        };
    };
    items
        .iter()
        .filter_map(|item| match item {
            Value::String(s) => Some(s.trim().to_string()),
            Value::Object(map) => map
                .get("description")
                .and_then(Value::as_str)
                .map(str::to_string)
                .or_else(|| Some(item.to_string())),
            Value::Null => None,
            other => Some(other.to_string()),
        })
        .filter(|s| !s.is_empty())
        .collect()
}
