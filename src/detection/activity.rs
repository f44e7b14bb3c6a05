//! Job-wide traffic patterns
//!
//! Error bursts, a high share of 5xx responses and crawler user agents are
//! properties of the whole job rather than of one record. Each finding is
//! attributed to the address contributing most to the pattern.

use regex::Regex;
use std::collections::BTreeMap;
use std::net::IpAddr;

use crate::config::DetectionConfig;
use crate::models::{AnomalyFinding, FindingCategory, FindingSeverity, LogRecord, Severity};

pub struct ActivityDetector {
    burst_min_total: usize,
    burst_per_minute: usize,
    server_error_rate: f64,
    bot_top: usize,
    bot_agent: Regex,
    burst_weight: f64,
    server_error_weight: f64,
    bot_weight: f64,
}

/// Records of one address among a set of record indexes
struct Contribution {
    address: IpAddr,
    count: usize,
    first: usize,
}

impl ActivityDetector {
    pub fn new(config: &DetectionConfig) -> Result<Self, regex::Error> {
        Ok(ActivityDetector {
            burst_min_total: config.error_burst_min_total,
            burst_per_minute: config.error_burst_per_minute,
            server_error_rate: config.server_error_rate,
            bot_top: config.bot_user_agent_top,
            bot_agent: Regex::new(r"(?i)bot|crawler|spider|scraper")?,
            burst_weight: config.weights.error_burst,
            server_error_weight: config.weights.server_errors,
            bot_weight: config.weights.bot_activity,
        })
    }

    pub fn detect(&self, records: &[LogRecord]) -> Vec<AnomalyFinding> {
        let mut findings = self.error_bursts(records);
        findings.extend(self.server_errors(records));
        findings.extend(self.bot_activity(records));
        findings
    }

    /// Minutes holding more than `burst_per_minute` ERROR or CRITICAL
    /// records, once the job has more than `burst_min_total` of them
    fn error_bursts(&self, records: &[LogRecord]) -> Vec<AnomalyFinding> {
        let errors: Vec<usize> = records
            .iter()
            .enumerate()
            .filter(|(_, r)| r.severity >= Severity::Error)
            .map(|(index, _)| index)
            .collect();
        if errors.len() <= self.burst_min_total {
            return Vec::new();
        }

        let mut minutes: BTreeMap<i64, Vec<usize>> = BTreeMap::new();
        for index in errors {
            minutes
                .entry(records[index].timestamp.timestamp().div_euclid(60))
                .or_default()
                .push(index);
        }

        minutes
            .into_values()
            .filter(|indexes| indexes.len() > self.burst_per_minute)
            .filter_map(|indexes| {
                let top = top_contributor(records, &indexes)?;
                let minute = records[indexes[0]].timestamp.format("%Y-%m-%d %H:%M");
                Some(AnomalyFinding {
                    source_address: top.address,
                    category: FindingCategory::ErrorBurst,
                    severity: FindingSeverity::High,
                    confidence: self.burst_weight.clamp(0.0, 1.0),
                    evidence_record_ref: top.first,
                    description: format!(
                        "{} error records in the minute starting {} ({} from {})",
                        indexes.len(),
                        minute,
                        top.count,
                        top.address
                    ),
                })
            })
            .collect()
    }

    /// More than `server_error_rate` of all records answered with 5xx
    fn server_errors(&self, records: &[LogRecord]) -> Option<AnomalyFinding> {
        let failing: Vec<usize> = records
            .iter()
            .enumerate()
            .filter(|(_, r)| r.status_code().is_some_and(|code| (500..600).contains(&code)))
            .map(|(index, _)| index)
            .collect();
        if failing.is_empty() {
            return None;
        }
        let rate = failing.len() as f64 / records.len() as f64;
        if rate <= self.server_error_rate {
            return None;
        }

        let top = top_contributor(records, &failing)?;
        Some(AnomalyFinding {
            source_address: top.address,
            category: FindingCategory::ServerErrorRate,
            severity: FindingSeverity::Medium,
            confidence: self.server_error_weight.clamp(0.0, 1.0),
            evidence_record_ref: top.first,
            description: format!(
                "{:.1}% of records are 5xx responses ({} total, {} from {})",
                rate * 100.0,
                failing.len(),
                top.count,
                top.address
            ),
        })
    }

    /// Crawler signatures among the `bot_top` most frequent user agents;
    /// one finding per address sending a matching agent
    fn bot_activity(&self, records: &[LogRecord]) -> Vec<AnomalyFinding> {
        let mut agents: BTreeMap<&str, Vec<usize>> = BTreeMap::new();
        for (index, record) in records.iter().enumerate() {
            if let Some(agent) = record.user_agent() {
                agents.entry(agent).or_default().push(index);
            }
        }
        let mut ranked: Vec<(&str, Vec<usize>)> = agents.into_iter().collect();
        ranked.sort_by(|a, b| b.1.len().cmp(&a.1.len()));

        let mut findings = Vec::new();
        for (agent, indexes) in ranked.into_iter().take(self.bot_top) {
            if !self.bot_agent.is_match(agent) {
                continue;
            }
            for share in contributions(records, &indexes) {
                findings.push(AnomalyFinding {
                    source_address: share.address,
                    category: FindingCategory::BotActivity,
                    severity: FindingSeverity::Low,
                    confidence: self.bot_weight.clamp(0.0, 1.0),
                    evidence_record_ref: share.first,
                    description: format!(
                        "{} requests from {} with crawler user agent \"{}\"",
                        share.count, share.address, agent
                    ),
                });
            }
        }
        findings
    }
}

/// Per-address counts over `indexes`, in address order
fn contributions(records: &[LogRecord], indexes: &[usize]) -> Vec<Contribution> {
    let mut by_address: BTreeMap<IpAddr, Contribution> = BTreeMap::new();
    for &index in indexes {
        if let Some(address) = records[index].source_address {
            by_address
                .entry(address)
                .or_insert(Contribution {
                    address,
                    count: 0,
                    first: index,
                })
                .count += 1;
        }
    }
    by_address.into_values().collect()
}

/// The address with the most records; ties go to the lowest address
fn top_contributor(records: &[LogRecord], indexes: &[usize]) -> Option<Contribution> {
    contributions(records, indexes)
        .into_iter()
        .fold(None, |best: Option<Contribution>, next| match best {
            Some(best) if best.count >= next.count => Some(best),
            _ => Some(next),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone, Utc};
    use std::str::FromStr;

    fn record(ip: &str, second: i64, severity: Severity, fields: &[(&str, &str)]) -> LogRecord {
        LogRecord {
            timestamp: Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap() + Duration::seconds(second),
            source_address: IpAddr::from_str(ip).ok(),
            user: None,
            severity,
            raw_text: String::new(),
            parsed_fields: fields
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        }
    }

    fn detector() -> ActivityDetector {
        ActivityDetector::new(&DetectionConfig::default()).unwrap()
    }

    #[test]
    fn test_error_burst_in_one_minute() {
        // Seven errors in the first minute, five spread over later minutes
        let mut records: Vec<LogRecord> = (0..7)
            .map(|i| {
                let ip = if i < 5 { "10.0.0.1" } else { "10.0.0.2" };
                record(ip, i, Severity::Error, &[])
            })
            .collect();
        records.extend((0..5).map(|i| record("10.0.0.3", 120 + i * 60, Severity::Critical, &[])));
        records.push(record("10.0.0.4", 1, Severity::Info, &[]));

        let findings = detector().error_bursts(&records);
        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].category, FindingCategory::ErrorBurst);
        assert_eq!(findings[0].source_address, IpAddr::from_str("10.0.0.1").unwrap());
        assert_eq!(findings[0].evidence_record_ref, 0);
        assert!(findings[0].description.starts_with("7 error records"));
    }

    #[test]
    fn test_few_errors_are_not_a_burst() {
        let records: Vec<LogRecord> = (0..10)
            .map(|i| record("10.0.0.1", i, Severity::Error, &[]))
            .collect();
        assert!(detector().error_bursts(&records).is_empty());
    }

    #[test]
    fn test_server_error_rate() {
        let mut records: Vec<LogRecord> = (0..18)
            .map(|i| record("10.0.1.1", i, Severity::Info, &[("status", "200")]))
            .collect();
        records.push(record("10.0.1.2", 30, Severity::Error, &[("status", "502")]));
        records.push(record("10.0.1.2", 31, Severity::Error, &[("status", "500")]));

        // 2 of 20 is 10%
        let finding = detector().server_errors(&records).unwrap();
        assert_eq!(finding.category, FindingCategory::ServerErrorRate);
        assert_eq!(finding.source_address, IpAddr::from_str("10.0.1.2").unwrap());
        assert_eq!(finding.evidence_record_ref, 18);

        // 1 of 21 is under 5%
        records.truncate(19);
        records.extend((0..2).map(|i| record("10.0.1.1", 40 + i, Severity::Info, &[("status", "404")])));
        assert!(detector().server_errors(&records).is_none());
    }

    #[test]
    fn test_bot_user_agents_in_top_agents() {
        let mut records = Vec::new();
        for i in 0..3 {
            records.push(record("10.0.2.1", i, Severity::Info, &[("user_agent", "Googlebot/2.1")]));
        }
        records.push(record("10.0.2.2", 5, Severity::Info, &[("user_agent", "Googlebot/2.1")]));
        for i in 0..4 {
            records.push(record("10.0.2.3", 10 + i, Severity::Info, &[("user_agent", "Mozilla/5.0")]));
        }

        let findings = detector().bot_activity(&records);
        let flagged: Vec<(String, usize)> = findings
            .iter()
            .map(|f| (f.source_address.to_string(), f.evidence_record_ref))
            .collect();
        assert_eq!(
            flagged,
            vec![("10.0.2.1".to_string(), 0), ("10.0.2.2".to_string(), 3)]
        );
        assert!(findings.iter().all(|f| f.category == FindingCategory::BotActivity));
    }

    #[test]
    fn test_rare_bot_outside_top_agents_is_ignored() {
        let mut config = DetectionConfig::default();
        config.bot_user_agent_top = 1;
        let detector = ActivityDetector::new(&config).unwrap();
        let records = vec![
            record("10.0.3.1", 0, Severity::Info, &[("user_agent", "curl/8.0")]),
            record("10.0.3.1", 1, Severity::Info, &[("user_agent", "curl/8.0")]),
            record("10.0.3.2", 2, Severity::Info, &[("user_agent", "SemrushBot")]),
        ];
        assert!(detector.bot_activity(&records).is_empty());
    }
}
