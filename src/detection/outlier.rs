//! Per-address volume outliers

use std::collections::BTreeMap;
use std::net::IpAddr;

use crate::models::{AnomalyFinding, FindingCategory, FindingSeverity, LogRecord};

pub struct OutlierDetector {
    stddev_factor: f64,
    min_events: usize,
    weight: f64,
}

impl OutlierDetector {
    pub fn new(stddev_factor: f64, min_events: usize, weight: f64) -> Self {
        OutlierDetector {
            stddev_factor,
            min_events,
            weight,
        }
    }

    /// Flag addresses whose record count exceeds `mean + k * stddev` across
    /// all addresses in the job
    pub fn detect(&self, records: &[LogRecord]) -> Vec<AnomalyFinding> {
        // address -> (count, first record index)
        let mut volume: BTreeMap<IpAddr, (usize, usize)> = BTreeMap::new();
        for (index, record) in records.iter().enumerate() {
            if let Some(address) = record.source_address {
                volume.entry(address).or_insert((0, index)).0 += 1;
            }
        }
        if volume.len() < 2 {
            return Vec::new();
        }

        let n = volume.len() as f64;
        let mean = volume.values().map(|(count, _)| *count as f64).sum::<f64>() / n;
        let variance = volume
            .values()
            .map(|(count, _)| (*count as f64 - mean).powi(2))
            .sum::<f64>()
            / n;
        let limit = mean + self.stddev_factor * variance.sqrt();

        volume
            .into_iter()
            .filter(|(_, (count, _))| *count >= self.min_events && *count as f64 > limit)
            .map(|(address, (count, first))| AnomalyFinding {
                source_address: address,
                category: FindingCategory::StatisticalOutlier,
                severity: FindingSeverity::Medium,
                confidence: (self.weight * count as f64 / limit).clamp(0.0, 1.0),
                evidence_record_ref: first,
                description: format!(
                    "{} records from {} against a job limit of {:.1} (mean {:.1})",
                    count, address, limit, mean
                ),
            })
            .collect()
    }
}
