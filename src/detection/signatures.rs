//! Per-record signature rules
//!
//! Each rule is a set of regexes for one attack category. A record trips a
//! rule when any pattern matches its raw text, the percent-decoded form of
//! it or a decoded field value, so encoded payloads are caught as well.

use regex::Regex;
use std::borrow::Cow;

use crate::config::RuleWeights;
use crate::models::{AnomalyFinding, FindingCategory, FindingSeverity, LogRecord};

struct SignatureRule {
    category: FindingCategory,
    severity: FindingSeverity,
    weight: f64,
    description: &'static str,
    patterns: Vec<Regex>,
}

impl SignatureRule {
    fn new(
        category: FindingCategory,
        severity: FindingSeverity,
        weight: f64,
        description: &'static str,
        patterns: &[&str],
    ) -> Result<Self, regex::Error> {
        let patterns = patterns
            .iter()
            .map(|p| Regex::new(p))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(SignatureRule {
            category,
            severity,
            weight,
            description,
            patterns,
        })
    }

    fn matches(&self, texts: &[&str]) -> bool {
        texts
            .iter()
            .any(|text| self.patterns.iter().any(|re| re.is_match(text)))
    }
}

/// Injection, traversal and exposure signatures
pub struct SignatureRules {
    rules: Vec<SignatureRule>,
}

impl SignatureRules {
    pub fn new(weights: &RuleWeights) -> Result<Self, regex::Error> {
        let rules = vec![
            SignatureRule::new(
                FindingCategory::SqlInjection,
                FindingSeverity::Critical,
                weights.sql_injection,
                "SQL injection attempt",
                &[
                    r"(?i)'\s*(?:or|and)\s+'?\w+'?\s*=\s*'?\w+",
                    r"(?i)\bor\s+1\s*=\s*1\b",
                    r"(?i)\bunion\b(?:\s+all)?\s+select\b",
                    r"(?i);\s*(?:drop|delete|insert|update|truncate|alter)\s+",
                    r"(?i)'\s*(?:--|#|/\*)",
                    r"(?i)\b(?:sleep|benchmark|pg_sleep)\s*\(",
                    r"(?i)\binformation_schema\b",
                ],
            )?,
            SignatureRule::new(
                FindingCategory::Xss,
                FindingSeverity::High,
                weights.xss,
                "Cross-site scripting attempt",
                &[
                    r"(?i)<\s*script\b",
                    r"(?i)javascript\s*:",
                    r"(?i)\bon(?:error|load|mouseover|focus|click)\s*=",
                    r"(?i)<\s*(?:iframe|svg|img|object|embed)\b[^>]*\b(?:src|on\w+)\s*=",
                    r"(?i)document\.(?:cookie|location)",
                    r"(?i)\balert\s*\(",
                ],
            )?,
            SignatureRule::new(
                FindingCategory::PathTraversal,
                FindingSeverity::High,
                weights.path_traversal,
                "Path traversal attempt",
                &[
                    r"\.\./",
                    r"\.\.\\",
                    r"(?i)/etc/(?:passwd|shadow|hosts)\b",
                    r"(?i)c:\\windows\\",
                    r"(?i)/proc/self/",
                    r"(?i)\bboot\.ini\b",
                ],
            )?,
            SignatureRule::new(
                FindingCategory::SensitiveExposure,
                FindingSeverity::Medium,
                weights.sensitive_exposure,
                "Credential exposed in request parameters",
                &[
                    r"(?i)[?&;\s](?:password|passwd|pwd|token|access_token|api_key|apikey|secret|access_key)=[^&\s]+",
                ],
            )?,
        ];
        Ok(SignatureRules { rules })
    }

    /// Findings for one record; at most one per category
    pub fn check(&self, index: usize, record: &LogRecord) -> Vec<AnomalyFinding> {
        let Some(address) = record.source_address else {
            return Vec::new();
        };

        let decoded = percent_decode(&record.raw_text);
        let mut texts: Vec<&str> = vec![record.raw_text.as_str()];
        if decoded != record.raw_text {
            texts.push(decoded.as_ref());
        }
        // Decoded field values (XML entities, JSON escapes) that differ from the raw text
        texts.extend(
            record
                .parsed_fields
                .values()
                .map(String::as_str)
                .filter(|value| !record.raw_text.contains(*value)),
        );

        self.rules
            .iter()
            .filter(|rule| rule.matches(&texts))
            .map(|rule| AnomalyFinding {
                source_address: address,
                category: rule.category,
                severity: rule.severity,
                confidence: rule.weight.clamp(0.0, 1.0),
                evidence_record_ref: index,
                description: format!("{} from {}", rule.description, address),
            })
            .collect()
    }
}

/// Decode `%XX` escapes and `+`; invalid sequences are kept literally
fn percent_decode(text: &str) -> Cow<'_, str> {
    if !text.contains('%') && !text.contains('+') {
        return Cow::Borrowed(text);
    }
    let spaced = text.replace('+', " ");
    let bytes = urlencoding::decode_binary(spaced.as_bytes());
    Cow::Owned(String::from_utf8_lossy(&bytes).into_owned())
}
