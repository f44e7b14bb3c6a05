//! Brute force detection
//!
//! Counts failed authentication attempts per source address over a sliding
//! window of record timestamps. Windows are computed from the records
//! themselves, never from wall-clock time, so replaying the same logs
//! always yields the same findings.

use chrono::{DateTime, Duration, Utc};
use regex::Regex;
use std::collections::{HashMap, VecDeque};
use std::net::IpAddr;

use crate::models::{AnomalyFinding, FindingCategory, FindingSeverity, LogRecord};

/// Failed attempts of one address still inside the window ending at the
/// latest record time. Attempts must be fed in chronological order.
struct AttemptWindow {
    span: Duration,
    attempts: VecDeque<DateTime<Utc>>,
}

impl AttemptWindow {
    fn new(span: Duration) -> Self {
        AttemptWindow {
            span,
            attempts: VecDeque::new(),
        }
    }

    /// Record an attempt at `at` and return how many fall within `span` of it
    fn record(&mut self, at: DateTime<Utc>) -> usize {
        let horizon = at - self.span;
        while self.attempts.front().is_some_and(|&oldest| oldest <= horizon) {
            self.attempts.pop_front();
        }
        self.attempts.push_back(at);
        self.attempts.len()
    }
}

/// Per-address failed-auth tracker
pub struct BruteForceDetector {
    window: Duration,
    threshold: usize,
    weight: f64,
    failed_auth: Regex,
    login_path: Regex,
}

impl BruteForceDetector {
    pub fn new(window: Duration, threshold: usize, weight: f64) -> Result<Self, regex::Error> {
        Ok(BruteForceDetector {
            window,
            threshold,
            weight,
            failed_auth: Regex::new(
                r"(?i)failed password|invalid user|authentication fail|failed login|login failed|logon failure|an account failed to log on|incorrect password",
            )?,
            login_path: Regex::new(r"(?i)(?:login|signin|sign-in|auth|wp-admin|admin|session)")?,
        })
    }

    /// Whether a record is a failed authentication attempt
    pub fn is_failed_auth(&self, record: &LogRecord) -> bool {
        if self.failed_auth.is_match(&record.raw_text) {
            return true;
        }
        // Windows security log: 4625 is a failed logon
        if record.field("event_id") == Some("4625") || record.field("EventID") == Some("4625") {
            return true;
        }
        let rejected = matches!(record.status_code(), Some(401) | Some(403));
        rejected && record.path().is_some_and(|p| self.login_path.is_match(p))
    }

    /// One finding per address, at the record whose attempt first pushes the
    /// window count over the threshold
    pub fn detect(&self, records: &[LogRecord]) -> Vec<AnomalyFinding> {
        let mut attempts: HashMap<IpAddr, Vec<(DateTime<Utc>, usize)>> = HashMap::new();
        for (index, record) in records.iter().enumerate() {
            let Some(address) = record.source_address else {
                continue;
            };
            if self.is_failed_auth(record) {
                attempts
                    .entry(address)
                    .or_default()
                    .push((record.timestamp, index));
            }
        }

        let mut findings = Vec::new();
        for (address, mut events) in attempts {
            events.sort_unstable();

            let mut window = AttemptWindow::new(self.window);
            let mut tripped_at = None;
            let mut peak = 0;
            for &(at, index) in &events {
                let in_window = window.record(at);
                peak = peak.max(in_window);
                if tripped_at.is_none() && in_window > self.threshold {
                    tripped_at = Some(index);
                }
            }

            if let Some(index) = tripped_at {
                log::debug!(
                    "Brute force from {}: peak {} attempts in {}s (threshold {})",
                    address,
                    peak,
                    self.window.num_seconds(),
                    self.threshold
                );
                findings.push(AnomalyFinding {
                    source_address: address,
                    category: FindingCategory::BruteForce,
                    severity: FindingSeverity::High,
                    confidence: self.confidence(peak),
                    evidence_record_ref: index,
                    description: format!(
                        "{} failed authentication attempts from {} within {} seconds (threshold: {})",
                        peak,
                        address,
                        self.window.num_seconds(),
                        self.threshold
                    ),
                });
            }
        }
        findings
    }

    fn confidence(&self, peak: usize) -> f64 {
        (self.weight * peak as f64 / self.threshold as f64).clamp(0.0, 1.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use std::collections::BTreeMap;
    use std::str::FromStr;

    use crate::models::Severity;

    fn failed_login(ip: &str, timestamp: i64) -> LogRecord {
        LogRecord {
            timestamp: Utc.timestamp_opt(timestamp, 0).unwrap(),
            source_address: Some(IpAddr::from_str(ip).unwrap()),
            user: Some("root".to_string()),
            severity: Severity::Error,
            raw_text: format!("sshd[1]: Failed password for root from {} port 22 ssh2", ip),
            parsed_fields: BTreeMap::new(),
        }
    }

    fn detector() -> BruteForceDetector {
        BruteForceDetector::new(Duration::seconds(300), 5, 0.6).unwrap()
    }

    #[test]
    fn test_attempt_window_drops_expired_attempts() {
        let start = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        let mut window = AttemptWindow::new(Duration::seconds(60));
        assert_eq!(window.record(start), 1);
        assert_eq!(window.record(start + Duration::seconds(30)), 2);
        // Exactly one span after the first attempt pushes it out
        assert_eq!(window.record(start + Duration::seconds(60)), 2);
        assert_eq!(window.record(start + Duration::seconds(200)), 1);
    }

    #[test]
    fn test_below_threshold() {
        let records: Vec<_> = (0..5)
            .map(|i| failed_login("1.1.1.1", 1_700_000_000 + i * 10))
            .collect();
        assert!(detector().detect(&records).is_empty());
    }

    #[test]
    fn test_threshold_exceeded_once() {
        let records: Vec<_> = (0..12)
            .map(|i| failed_login("10.0.0.1", 1_700_000_000 + i))
            .collect();
        let findings = detector().detect(&records);

        assert_eq!(findings.len(), 1, "one finding per address");
        let finding = &findings[0];
        assert_eq!(finding.category, FindingCategory::BruteForce);
        // Sixth attempt trips a threshold of five
        assert_eq!(finding.evidence_record_ref, 5);
        // 0.6 * 12 / 5 saturates
        assert_eq!(finding.confidence, 1.0);
    }

    #[test]
    fn test_window_expiry() {
        // Attempts spaced 100s apart never hold more than 3 in a 300s window
        let records: Vec<_> = (0..20)
            .map(|i| failed_login("10.0.0.2", 1_700_000_000 + i * 100))
            .collect();
        assert!(detector().detect(&records).is_empty());
    }

    #[test]
    fn test_input_order_does_not_matter() {
        let mut records: Vec<_> = (0..6)
            .map(|i| failed_login("10.0.0.3", 1_700_000_000 + i))
            .collect();
        records.reverse();
        let findings = detector().detect(&records);
        assert_eq!(findings.len(), 1);
        // Chronologically sixth attempt is the first record after reversal
        assert_eq!(findings[0].evidence_record_ref, 0);
        assert!((findings[0].confidence - 0.72).abs() < 1e-9);
    }

    #[test]
    fn test_http_401_on_login_path() {
        let detector = detector();
        let mut fields = BTreeMap::new();
        fields.insert("status".to_string(), "401".to_string());
        fields.insert("path".to_string(), "/wp-login.php".to_string());
        let record = LogRecord {
            timestamp: Utc::now(),
            source_address: Some(IpAddr::from_str("192.0.2.7").unwrap()),
            user: None,
            severity: Severity::Info,
            raw_text: "POST /wp-login.php 401".to_string(),
            parsed_fields: fields.clone(),
        };
        assert!(detector.is_failed_auth(&record));

        fields.insert("path".to_string(), "/images/logo.png".to_string());
        let not_login = LogRecord {
            parsed_fields: fields,
            raw_text: "GET /images/logo.png 401".to_string(),
            ..record
        };
        assert!(!detector.is_failed_auth(&not_login));
    }
}
