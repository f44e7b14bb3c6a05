//! Risk synthesis
//!
//! Merges anomaly findings and reputation results into one score per
//! address and a job-wide risk level. Scoring is a pure function of the
//! findings and reputation results for an address: input order, timing and
//! provider completion order do not affect it.

use std::collections::{BTreeMap, BTreeSet};
use std::net::IpAddr;

use crate::config::SynthesisConfig;
use crate::models::{AnomalyFinding, FindingCategory, FindingSeverity, RiskLevel, SuspiciousAddress};
use crate::narrative::Narrative;
use crate::reputation::ReputationReport;

const DEGRADED_CONCERN: &str =
    "Reputation providers were unavailable; risk scores are derived from anomaly signals alone";

/// Result of synthesis for one job
#[derive(Debug, Clone, PartialEq)]
pub struct Synthesis {
    /// Sorted by score descending, then address
    pub suspicious: Vec<SuspiciousAddress>,
    pub risk_level: RiskLevel,
    pub total_anomalies: usize,
    pub concerns: Vec<String>,
    pub recommendations: Vec<String>,
}

pub struct RiskSynthesizer {
    config: SynthesisConfig,
}

impl RiskSynthesizer {
    pub fn new(config: &SynthesisConfig) -> Self {
        RiskSynthesizer {
            config: config.clone(),
        }
    }

    pub fn synthesize(
        &self,
        findings: &[AnomalyFinding],
        reputation: &ReputationReport,
        narrative: Option<&Narrative>,
    ) -> Synthesis {
        let mut by_address: BTreeMap<IpAddr, Vec<AnomalyFinding>> = BTreeMap::new();
        for finding in findings {
            by_address
                .entry(finding.source_address)
                .or_default()
                .push(finding.clone());
        }
        let addresses: BTreeSet<IpAddr> = by_address
            .keys()
            .chain(reputation.results.keys())
            .copied()
            .collect();

        let mut suspicious: Vec<SuspiciousAddress> = addresses
            .into_iter()
            .map(|address| {
                let contributing = by_address.remove(&address).unwrap_or_default();
                self.score_address(address, contributing, reputation)
            })
            .collect();
        suspicious.sort_by(|a, b| {
            b.aggregated_risk_score
                .cmp(&a.aggregated_risk_score)
                .then(a.source_address.cmp(&b.source_address))
        });

        let max_score = suspicious
            .iter()
            .map(|s| s.aggregated_risk_score)
            .max()
            .unwrap_or(0);

        let (mut concerns, mut recommendations) = self.templated_insights(findings, &suspicious);
        if reputation.all_failed() {
            concerns.push(DEGRADED_CONCERN.to_string());
        }
        if let Some(narrative) = narrative {
            append_unique(&mut concerns, &narrative.concerns);
            append_unique(&mut recommendations, &narrative.recommendations);
        }

        Synthesis {
            risk_level: RiskLevel::from_score(max_score),
            total_anomalies: findings.len(),
            suspicious,
            concerns,
            recommendations,
        }
    }

    fn score_address(
        &self,
        address: IpAddr,
        mut contributing: Vec<AnomalyFinding>,
        reputation: &ReputationReport,
    ) -> SuspiciousAddress {
        contributing.sort_by(|a, b| {
            (a.evidence_record_ref, a.category).cmp(&(b.evidence_record_ref, b.category))
        });

        let results = reputation.for_address(&address);
        let per_source_scores: BTreeMap<String, f64> = results
            .map(|r| r.iter().map(|(name, result)| (name.clone(), result.score)).collect())
            .unwrap_or_default();
        let flagged = results.is_some_and(|r| r.values().any(|result| result.is_malicious));

        // Worst source wins
        let reputation_component = per_source_scores.values().copied().reduce(f64::max);
        let anomaly_component = self.anomaly_component(&contributing);
        let score = self.combine(reputation_component, anomaly_component);

        SuspiciousAddress {
            source_address: address,
            aggregated_risk_score: score,
            per_source_scores,
            is_malicious: flagged || f64::from(score) > self.config.high_risk_threshold,
            contributing_findings: contributing,
        }
    }

    /// Severity-weighted confidence sum capped at 100; `None` with no findings
    fn anomaly_component(&self, findings: &[AnomalyFinding]) -> Option<f64> {
        if findings.is_empty() {
            return None;
        }
        let mut points: Vec<f64> = findings
            .iter()
            .map(|f| self.severity_weight(f.severity) * f.confidence.clamp(0.0, 1.0))
            .collect();
        // Summing in sorted order keeps the result independent of input order
        points.sort_by(f64::total_cmp);
        Some(points.iter().sum::<f64>().min(100.0))
    }

    fn severity_weight(&self, severity: FindingSeverity) -> f64 {
        let w = &self.config.severity_weights;
        match severity {
            FindingSeverity::Low => w.low,
            FindingSeverity::Medium => w.medium,
            FindingSeverity::High => w.high,
            FindingSeverity::Critical => w.critical,
        }
    }

    /// Weighted sum of the present components, normalized by the largest
    /// present weight, so a lone component scores at full scale
    fn combine(&self, reputation: Option<f64>, anomaly: Option<f64>) -> u8 {
        let present: Vec<(f64, f64)> = [
            reputation.map(|c| (self.config.reputation_weight, c)),
            anomaly.map(|c| (self.config.anomaly_weight, c)),
        ]
        .into_iter()
        .flatten()
        .collect();

        let max_weight = present.iter().map(|(w, _)| *w).fold(0.0, f64::max);
        if max_weight <= 0.0 {
            return 0;
        }
        let weighted: f64 = present.iter().map(|(w, c)| w * c).sum();
        (weighted / max_weight).clamp(0.0, 100.0).round() as u8
    }

    fn templated_insights(
        &self,
        findings: &[AnomalyFinding],
        suspicious: &[SuspiciousAddress],
    ) -> (Vec<String>, Vec<String>) {
        let mut per_category: BTreeMap<FindingCategory, BTreeSet<IpAddr>> = BTreeMap::new();
        for finding in findings {
            per_category
                .entry(finding.category)
                .or_default()
                .insert(finding.source_address);
        }

        let mut concerns = Vec::new();
        let mut recommendations = Vec::new();
        for (category, addresses) in &per_category {
            let (concern, recommendation) = category_template(*category);
            concerns.push(format!("{} from {} address(es)", concern, addresses.len()));
            recommendations.push(recommendation.to_string());
        }

        let malicious: Vec<String> = suspicious
            .iter()
            .filter(|s| s.is_malicious)
            .map(|s| s.source_address.to_string())
            .collect();
        if !malicious.is_empty() {
            concerns.push(format!(
                "{} address(es) classified as malicious",
                malicious.len()
            ));
            recommendations.push(format!(
                "Block malicious addresses at the network edge: {}",
                malicious.join(", ")
            ));
        }
        (concerns, recommendations)
    }
}

fn category_template(category: FindingCategory) -> (&'static str, &'static str) {
    match category {
        FindingCategory::SqlInjection => (
            "SQL injection attempts detected",
            "Use parameterized queries and put a web application firewall in front of the application",
        ),
        FindingCategory::Xss => (
            "Cross-site scripting payloads detected",
            "Encode user-controlled output and enforce a Content-Security-Policy",
        ),
        FindingCategory::PathTraversal => (
            "Path traversal attempts detected",
            "Canonicalize and validate file paths; restrict access outside the web root",
        ),
        FindingCategory::BruteForce => (
            "Brute force authentication attempts detected",
            "Enforce account lockout, login rate limiting and multi-factor authentication",
        ),
        FindingCategory::SensitiveExposure => (
            "Credentials exposed in request parameters",
            "Move secrets out of URLs and rotate any exposed credentials",
        ),
        FindingCategory::StatisticalOutlier => (
            "Abnormal request volume detected",
            "Rate limit high-volume clients and review their traffic",
        ),
        FindingCategory::ErrorBurst => (
            "Bursts of error records detected",
            "Investigate the failing component and correlate the burst with deployments or attacks",
        ),
        FindingCategory::ServerErrorRate => (
            "High rate of 5xx server errors",
            "Check application health and capacity; review the requests triggering server errors",
        ),
        FindingCategory::BotActivity => (
            "Automated crawler activity detected",
            "Review robots.txt and rate limit or block unwanted crawlers",
        ),
    }
}

fn append_unique(target: &mut Vec<String>, extra: &[String]) {
    for item in extra {
        if !target.iter().any(|existing| existing == item) {
            target.push(item.clone());
        }
    }
}
