//! Anomaly detection over a job's canonical records
//!
//! Four rule families run over the full record set:
//! - signature rules matched per record (injection, traversal, exposure)
//! - a sliding-window brute force counter per source address
//! - a per-address volume outlier test
//! - job-wide activity patterns (error bursts, 5xx rate, crawlers)

pub mod activity;
pub mod brute_force;
pub mod outlier;
pub mod signatures;

pub use activity::ActivityDetector;
pub use brute_force::BruteForceDetector;
pub use outlier::OutlierDetector;
pub use signatures::SignatureRules;

use chrono::Duration;

use crate::config::DetectionConfig;
use crate::models::{AnomalyFinding, LogRecord};

pub struct AnomalyDetector {
    signatures: SignatureRules,
    brute_force: BruteForceDetector,
    outliers: OutlierDetector,
    activity: ActivityDetector,
}

impl AnomalyDetector {
    pub fn new(config: &DetectionConfig) -> Result<Self, regex::Error> {
        Ok(AnomalyDetector {
            signatures: SignatureRules::new(&config.weights)?,
            brute_force: BruteForceDetector::new(
                Duration::seconds(config.brute_force_window_seconds),
                config.brute_force_threshold,
                config.weights.brute_force,
            )?,
            outliers: OutlierDetector::new(
                config.outlier_stddev_factor,
                config.outlier_min_events,
                config.weights.statistical_outlier,
            ),
            activity: ActivityDetector::new(config)?,
        })
    }

    /// Run every rule and return findings sorted by (address, evidence, category)
    pub fn detect(&self, records: &[LogRecord]) -> Vec<AnomalyFinding> {
        let mut findings: Vec<AnomalyFinding> = records
            .iter()
            .enumerate()
            .flat_map(|(index, record)| self.signatures.check(index, record))
            .collect();
        findings.extend(self.brute_force.detect(records));
        findings.extend(self.outliers.detect(records));
        findings.extend(self.activity.detect(records));

        findings.sort_by(|a, b| {
            (a.source_address, a.evidence_record_ref, a.category).cmp(&(
                b.source_address,
                b.evidence_record_ref,
                b.category,
            ))
        });

        log::info!(
            "Detection produced {} findings over {} records",
            findings.len(),
            records.len()
        );
        findings
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NormalizerConfig;
    use crate::models::FindingCategory;
    use crate::normalizer::{Normalizer, RawInput};
    use std::net::IpAddr;
    use std::str::FromStr;

    fn parse(text: &str) -> Vec<LogRecord> {
        let normalizer = Normalizer::new(&NormalizerConfig::default()).unwrap();
        normalizer
            .normalize(&[RawInput::from_text(Some("access.log".into()), text)])
            .unwrap()
            .records
    }

    #[test]
    fn test_sql_injection_scenario() {
        let records = parse(
            r#"10.0.0.50 - - [10/Oct/2023:13:55:36 +0000] "GET /search?q=' OR '1'='1 HTTP/1.1" 200 512
10.0.0.7 - - [10/Oct/2023:13:55:37 +0000] "GET /index.html HTTP/1.1" 200 1024
"#,
        );
        let detector = AnomalyDetector::new(&DetectionConfig::default()).unwrap();
        let findings = detector.detect(&records);

        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].source_address, IpAddr::from_str("10.0.0.50").unwrap());
        assert_eq!(findings[0].category, FindingCategory::SqlInjection);
        assert_eq!(findings[0].evidence_record_ref, 0);
    }

    #[test]
    fn test_findings_are_sorted_and_deterministic() {
        let mut log = String::new();
        for i in 0..8 {
            log.push_str(&format!(
                "Mar  3 04:05:{:02} web01 sshd[1]: Failed password for root from 203.0.113.5 port 22 ssh2\n",
                i
            ));
        }
        log.push_str(
            "10.0.0.2 - - [03/Mar/2024:04:06:00 +0000] \"GET /../../etc/passwd HTTP/1.1\" 404 0\n",
        );
        let records = parse(&log);
        let detector = AnomalyDetector::new(&DetectionConfig::default()).unwrap();

        let first = detector.detect(&records);
        let second = detector.detect(&records);
        assert_eq!(first, second);

        let categories: Vec<_> = first.iter().map(|f| (f.source_address.to_string(), f.category)).collect();
        assert_eq!(
            categories,
            vec![
                ("10.0.0.2".to_string(), FindingCategory::PathTraversal),
                ("203.0.113.5".to_string(), FindingCategory::BruteForce),
            ]
        );
    }

    #[test]
    fn test_script_inside_xml_cdata_is_detected() {
        let normalizer = Normalizer::new(&NormalizerConfig::default()).unwrap();
        let text = r#"<log><entry timestamp="2024-01-01T00:00:00Z" ip="10.0.0.9"><message><![CDATA[GET /q?<script>alert(1)</script>]]></message></entry></log>"#;
        let records = normalizer
            .normalize(&[RawInput::from_text(Some("events.xml".into()), text)])
            .unwrap()
            .records;
        let detector = AnomalyDetector::new(&DetectionConfig::default()).unwrap();
        let findings = detector.detect(&records);

        assert!(findings
            .iter()
            .any(|f| f.category == FindingCategory::Xss
                && f.source_address == IpAddr::from_str("10.0.0.9").unwrap()));
    }

    #[test]
    fn test_entity_escaped_xml_payload_is_detected() {
        let normalizer = Normalizer::new(&NormalizerConfig::default()).unwrap();
        let text = r#"<log><entry timestamp="2024-01-01T00:00:00Z" ip="10.0.0.4"><message>GET /q?&lt;script src=x&gt;&lt;/script&gt;</message></entry></log>"#;
        let records = normalizer
            .normalize(&[RawInput::from_text(Some("events.xml".into()), text)])
            .unwrap()
            .records;
        let detector = AnomalyDetector::new(&DetectionConfig::default()).unwrap();
        let categories: Vec<_> = detector.detect(&records).iter().map(|f| f.category).collect();
        assert_eq!(categories, vec![FindingCategory::Xss]);
    }

    #[test]
    fn test_no_evidence_no_findings() {
        let records = parse(
            "10.0.0.1 - - [10/Oct/2023:13:55:36 +0000] \"GET / HTTP/1.1\" 200 100\n",
        );
        let detector = AnomalyDetector::new(&DetectionConfig::default()).unwrap();
        assert!(detector.detect(&records).is_empty());
    }
}
