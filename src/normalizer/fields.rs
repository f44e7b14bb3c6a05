//! Field extraction shared by every grammar: timestamps, addresses,
//! users and severity.

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use regex::Regex;
use std::collections::BTreeMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

use super::ParseError;
use crate::models::{LogRecord, Severity};

pub(crate) const TIMESTAMP_ALIASES: &[&str] =
    &["timestamp", "@timestamp", "time", "date", "ts", "datetime", "systemtime"];
pub(crate) const ADDRESS_ALIASES: &[&str] = &[
    "ip",
    "source_ip",
    "src_ip",
    "client_ip",
    "remote_addr",
    "address",
    "ipaddress",
];
pub(crate) const USER_ALIASES: &[&str] = &["user", "username", "user_name", "targetusername"];
pub(crate) const SEVERITY_ALIASES: &[&str] = &["severity", "level", "log_level", "loglevel"];
pub(crate) const MESSAGE_ALIASES: &[&str] = &["message", "msg"];

/// Regexes used to pull canonical fields out of free text
pub(crate) struct FieldExtractor {
    ipv4: Regex,
    user_for: Regex,
    user_kv: Regex,
    severity_rules: Vec<(Severity, Regex)>,
}

impl FieldExtractor {
    pub(crate) fn new() -> Result<Self, regex::Error> {
        Ok(FieldExtractor {
            ipv4: Regex::new(r"\b(?:\d{1,3}\.){3}\d{1,3}\b")?,
            user_for: Regex::new(r"(?i)\bfor (?:invalid user |illegal user )?([\w.@-]+) from\b")?,
            user_kv: Regex::new(r"(?i)\buser(?:name)?[=:]\s*([\w.@-]+)")?,
            severity_rules: vec![
                (
                    Severity::Critical,
                    Regex::new(r"(?i)\b(critical|fatal|emerg|emergency|panic)\b")?,
                ),
                (
                    Severity::Error,
                    Regex::new(r"(?i)\b(error|err|failed|failure)\b")?,
                ),
                (Severity::Warning, Regex::new(r"(?i)\b(warning|warn|alert)\b")?),
                (Severity::Debug, Regex::new(r"(?i)\b(debug|trace|verbose)\b")?),
            ],
        })
    }

    /// First IPv4 literal in the text, falling back to the first IPv6 token
    pub(crate) fn find_address(&self, text: &str) -> Option<IpAddr> {
        let v4 = self
            .ipv4
            .find_iter(text)
            .find_map(|m| normalize_address(m.as_str()));
        if v4.is_some() {
            return v4;
        }

        text.split_whitespace()
            .map(|token| token.trim_matches(|c: char| "[](),;\"'".contains(c)))
            .filter(|token| token.contains(':'))
            .find_map(|token| Ipv6Addr::from_str(token).ok().map(IpAddr::V6))
    }

    pub(crate) fn find_user(&self, text: &str) -> Option<String> {
        self.user_for
            .captures(text)
            .or_else(|| self.user_kv.captures(text))
            .and_then(|caps| caps.get(1))
            .map(|m| m.as_str().to_string())
    }

    /// Keyword-based severity, defaulting to INFO
    pub(crate) fn detect_severity(&self, text: &str) -> Severity {
        self.severity_rules
            .iter()
            .find(|(_, re)| re.is_match(text))
            .map(|(severity, _)| *severity)
            .unwrap_or(Severity::Info)
    }

    /// Build a record from a flat field map produced by a structured grammar
    pub(crate) fn record_from_fields(
        &self,
        mut fields: BTreeMap<String, String>,
        raw_text: String,
        format: &str,
    ) -> Result<LogRecord, ParseError> {
        let timestamp = lookup(&fields, TIMESTAMP_ALIASES)
            .ok_or(ParseError::MissingTimestamp)
            .and_then(parse_timestamp)?;

        let message = lookup(&fields, MESSAGE_ALIASES).map(str::to_string);

        let source_address = lookup(&fields, ADDRESS_ALIASES)
            .and_then(normalize_address)
            .or_else(|| message.as_deref().and_then(|m| self.find_address(m)));

        let user = lookup(&fields, USER_ALIASES)
            .filter(|u| !u.is_empty() && *u != "-")
            .map(str::to_string)
            .or_else(|| message.as_deref().and_then(|m| self.find_user(m)));

        let severity = lookup(&fields, SEVERITY_ALIASES)
            .and_then(|s| Severity::from_str(s).ok())
            .unwrap_or_else(|| self.detect_severity(&raw_text));

        fields.insert("format".to_string(), format.to_string());

        Ok(LogRecord {
            timestamp,
            source_address,
            user,
            severity,
            raw_text,
            parsed_fields: fields,
        })
    }
}

/// Case-insensitive lookup of the first non-empty alias
pub(crate) fn lookup<'a>(fields: &'a BTreeMap<String, String>, aliases: &[&str]) -> Option<&'a str> {
    aliases.iter().find_map(|alias| {
        fields
            .iter()
            .find(|(key, value)| key.eq_ignore_ascii_case(alias) && !value.trim().is_empty())
            .map(|(_, value)| value.trim())
    })
}

/// Parse an address, stripping leading zeros from IPv4 octets
pub(crate) fn normalize_address(raw: &str) -> Option<IpAddr> {
    let raw = raw.trim().trim_start_matches('[').trim_end_matches(']');
    let parts: Vec<&str> = raw.split('.').collect();
    if parts.len() == 4 && parts.iter().all(|p| !p.is_empty() && p.chars().all(|c| c.is_ascii_digit())) {
        let mut octets = [0u8; 4];
        for (octet, part) in octets.iter_mut().zip(&parts) {
            *octet = part.parse().ok()?;
        }
        return Some(IpAddr::V4(Ipv4Addr::from(octets)));
    }
    IpAddr::from_str(raw).ok()
}

/// Parse the timestamp shapes seen across supported formats
pub(crate) fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, ParseError> {
    let raw = raw.trim();
    let invalid = || ParseError::InvalidTimestamp(raw.to_string());

    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Ok(dt.with_timezone(&Utc));
    }
    // Apache/nginx access log
    if let Ok(dt) = DateTime::parse_from_str(raw, "%d/%b/%Y:%H:%M:%S %z") {
        return Ok(dt.with_timezone(&Utc));
    }
    for fmt in ["%Y-%m-%dT%H:%M:%S%.f%z", "%Y-%m-%d %H:%M:%S%.f%z"] {
        if let Ok(dt) = DateTime::parse_from_str(raw, fmt) {
            return Ok(dt.with_timezone(&Utc));
        }
    }
    let without_zone = raw.trim_end_matches('Z').replace(',', ".");
    for fmt in ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(&without_zone, fmt) {
            return Ok(Utc.from_utc_datetime(&naive));
        }
    }
    if !raw.is_empty() && raw.chars().all(|c| c.is_ascii_digit() || c == '.') {
        return parse_epoch(raw).ok_or_else(invalid);
    }
    Err(invalid())
}

/// Syslog timestamps carry no year, so one is supplied
pub(crate) fn parse_syslog_timestamp(raw: &str, year: i32) -> Result<DateTime<Utc>, ParseError> {
    let compact = raw.split_whitespace().collect::<Vec<_>>().join(" ");
    NaiveDateTime::parse_from_str(&format!("{} {}", year, compact), "%Y %b %d %H:%M:%S")
        .map(|naive| Utc.from_utc_datetime(&naive))
        .map_err(|_| ParseError::InvalidTimestamp(raw.to_string()))
}

fn parse_epoch(raw: &str) -> Option<DateTime<Utc>> {
    let value: f64 = raw.parse().ok()?;
    // Values this large are milliseconds
    let seconds = if value > 100_000_000_000.0 { value / 1000.0 } else { value };
    let whole = seconds.trunc() as i64;
    let nanos = ((seconds - seconds.trunc()) * 1e9).round() as u32;
    DateTime::from_timestamp(whole, nanos.min(999_999_999))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Datelike, Timelike};

    #[test]
    fn test_normalize_address_strips_leading_zeros() {
        assert_eq!(
            normalize_address("010.000.000.050"),
            Some(IpAddr::from_str("10.0.0.50").unwrap())
        );
        assert_eq!(normalize_address("256.1.1.1"), None);
        assert_eq!(
            normalize_address("2001:db8::1"),
            Some(IpAddr::from_str("2001:db8::1").unwrap())
        );
        assert_eq!(normalize_address("example.com"), None);
    }

    #[test]
    fn test_parse_timestamp_shapes() {
        let apache = parse_timestamp("10/Oct/2023:13:55:36 -0700").unwrap();
        assert_eq!(apache.hour(), 20);

        let rfc = parse_timestamp("2024-03-01T12:00:00Z").unwrap();
        assert_eq!(rfc.day(), 1);

        let plain = parse_timestamp("2024-03-01 12:00:05").unwrap();
        assert_eq!(plain.second(), 5);

        let epoch = parse_timestamp("1700000000").unwrap();
        assert_eq!(epoch.timestamp(), 1700000000);

        let millis = parse_timestamp("1700000000123").unwrap();
        assert_eq!(millis.timestamp(), 1700000000);

        assert!(matches!(
            parse_timestamp("yesterday"),
            Err(ParseError::InvalidTimestamp(_))
        ));
    }

    #[test]
    fn test_parse_syslog_timestamp_single_digit_day() {
        let ts = parse_syslog_timestamp("Jan  5 08:09:10", 2024).unwrap();
        assert_eq!((ts.year(), ts.month(), ts.day()), (2024, 1, 5));
        assert_eq!(ts.hour(), 8);
    }

    #[test]
    fn test_find_address_and_user() {
        let extractor = FieldExtractor::new().unwrap();
        let line = "Failed password for invalid user admin from 192.168.1.100 port 22 ssh2";
        assert_eq!(
            extractor.find_address(line),
            Some(IpAddr::from_str("192.168.1.100").unwrap())
        );
        assert_eq!(extractor.find_user(line).as_deref(), Some("admin"));

        let v6 = "Accepted publickey for bob from 2001:db8::7 port 50022";
        assert_eq!(
            extractor.find_address(v6),
            Some(IpAddr::from_str("2001:db8::7").unwrap())
        );
        assert_eq!(extractor.find_address("no address here 12:00:00"), None);
    }

    #[test]
    fn test_detect_severity() {
        let extractor = FieldExtractor::new().unwrap();
        assert_eq!(extractor.detect_severity("FATAL: disk gone"), Severity::Critical);
        assert_eq!(extractor.detect_severity("Failed password for root"), Severity::Error);
        assert_eq!(extractor.detect_severity("warn: slow query"), Severity::Warning);
        assert_eq!(extractor.detect_severity("GET /index.html 200"), Severity::Info);
    }
}
