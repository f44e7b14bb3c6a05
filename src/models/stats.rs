use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::IpAddr;

use super::record::{LogRecord, Severity};

/// Entries kept in each ranked list
const TOP_N: usize = 10;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AddressCount {
    pub ip: IpAddr,
    pub count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PathCount {
    pub path: String,
    pub count: usize,
}

/// Job-wide traffic statistics
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobStatistics {
    pub total_logs: usize,
    pub unique_ips: usize,
    pub severity_distribution: BTreeMap<Severity, usize>,
    /// The most frequent HTTP status codes
    pub status_codes: BTreeMap<u16, usize>,
    pub top_ips: Vec<AddressCount>,
    pub top_paths: Vec<PathCount>,
    /// Share of ERROR and CRITICAL records, in percent
    pub error_rate: f64,
}

impl JobStatistics {
    pub fn from_records(records: &[LogRecord]) -> Self {
        let mut severity_distribution = BTreeMap::new();
        let mut statuses: BTreeMap<u16, usize> = BTreeMap::new();
        let mut addresses: BTreeMap<IpAddr, usize> = BTreeMap::new();
        let mut paths: BTreeMap<&str, usize> = BTreeMap::new();

        for record in records {
            *severity_distribution.entry(record.severity).or_insert(0) += 1;
            if let Some(status) = record.status_code() {
                *statuses.entry(status).or_insert(0) += 1;
            }
            if let Some(address) = record.source_address {
                *addresses.entry(address).or_insert(0) += 1;
            }
            if let Some(path) = record.path() {
                *paths.entry(path).or_insert(0) += 1;
            }
        }

        let errors = records
            .iter()
            .filter(|r| r.severity >= Severity::Error)
            .count();
        let error_rate = if records.is_empty() {
            0.0
        } else {
            errors as f64 / records.len() as f64 * 100.0
        };

        JobStatistics {
            total_logs: records.len(),
            unique_ips: addresses.len(),
            severity_distribution,
            status_codes: most_common(statuses).into_iter().collect(),
            top_ips: most_common(addresses)
                .into_iter()
                .map(|(ip, count)| AddressCount { ip, count })
                .collect(),
            top_paths: most_common(paths)
                .into_iter()
                .map(|(path, count)| PathCount {
                    path: path.to_string(),
                    count,
                })
                .collect(),
            error_rate,
        }
    }
}

/// Highest counts first; ties keep key order
fn most_common<K: Ord>(counts: BTreeMap<K, usize>) -> Vec<(K, usize)> {
    let mut ranked: Vec<(K, usize)> = counts.into_iter().collect();
    ranked.sort_by(|a, b| b.1.cmp(&a.1));
    ranked.truncate(TOP_N);
    ranked
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::str::FromStr;

    fn record(ip: &str, severity: Severity, status: &str, path: &str) -> LogRecord {
        let mut parsed_fields = BTreeMap::new();
        parsed_fields.insert("status".to_string(), status.to_string());
        parsed_fields.insert("path".to_string(), path.to_string());
        LogRecord {
            timestamp: Utc::now(),
            source_address: IpAddr::from_str(ip).ok(),
            user: None,
            severity,
            raw_text: String::new(),
            parsed_fields,
        }
    }

    #[test]
    fn test_counts_and_rankings() {
        let records = vec![
            record("10.0.0.1", Severity::Info, "200", "/index.html"),
            record("10.0.0.2", Severity::Info, "200", "/index.html?x=1"),
            record("10.0.0.2", Severity::Error, "500", "/api"),
            record("10.0.0.2", Severity::Critical, "503", "/api"),
        ];
        let stats = JobStatistics::from_records(&records);

        assert_eq!(stats.total_logs, 4);
        assert_eq!(stats.unique_ips, 2);
        assert_eq!(stats.severity_distribution[&Severity::Info], 2);
        assert_eq!(stats.status_codes[&200], 2);
        assert_eq!(stats.top_ips[0].ip, IpAddr::from_str("10.0.0.2").unwrap());
        assert_eq!(stats.top_ips[0].count, 3);
        // Ties keep path order
        assert_eq!(stats.top_paths[0].path, "/api");
        assert_eq!(stats.top_paths[1].path, "/index.html");
        assert_eq!(stats.error_rate, 50.0);
    }

    #[test]
    fn test_empty_job() {
        let stats = JobStatistics::from_records(&[]);
        assert_eq!(stats.total_logs, 0);
        assert_eq!(stats.error_rate, 0.0);
        assert!(stats.top_ips.is_empty());
    }
}
