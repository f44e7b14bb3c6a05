//! Line-oriented grammars for plain-text logs.

use regex::{Captures, Regex};
use std::collections::BTreeMap;
use std::str::FromStr;

use super::fields::{normalize_address, parse_syslog_timestamp, parse_timestamp, FieldExtractor};
use super::ParseError;
use crate::models::{LogRecord, Severity};

/// Plain-text grammar variants, tried in declaration order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Grammar {
    /// Apache/nginx combined log format (with referer and user agent)
    Combined,
    /// Apache common log format
    Common,
    /// `YYYY-MM-DD HH:MM:SS LEVEL Source EventId message`
    WindowsEvent,
    /// ISO-8601 timestamp followed by free text
    Iso,
    /// BSD syslog: `Mon DD HH:MM:SS host service: message`
    Syslog,
}

impl Grammar {
    const ALL: [Grammar; 5] = [
        Grammar::Combined,
        Grammar::Common,
        Grammar::WindowsEvent,
        Grammar::Iso,
        Grammar::Syslog,
    ];

    fn name(&self) -> &'static str {
        match self {
            Grammar::Combined => "combined",
            Grammar::Common => "common",
            Grammar::WindowsEvent => "windows_event",
            Grammar::Iso => "iso",
            Grammar::Syslog => "syslog",
        }
    }
}

pub(crate) struct TextGrammars {
    patterns: Vec<(Grammar, Regex)>,
    reference_year: i32,
}

impl TextGrammars {
    pub(crate) fn new(reference_year: i32) -> Result<Self, regex::Error> {
        let mut patterns = Vec::with_capacity(Grammar::ALL.len());
        for grammar in Grammar::ALL {
            let pattern = match grammar {
                Grammar::Combined => {
                    r#"^(?P<ip>\S+) (?P<ident>\S+) (?P<user>\S+) \[(?P<timestamp>[^\]]+)\] "(?P<request>[^"]*)" (?P<status>\d{3}) (?P<size>\d+|-) "(?P<referer>[^"]*)" "(?P<user_agent>[^"]*)""#
                }
                Grammar::Common => {
                    r#"^(?P<ip>\S+) (?P<ident>\S+) (?P<user>\S+) \[(?P<timestamp>[^\]]+)\] "(?P<request>[^"]*)" (?P<status>\d{3}) (?P<size>\d+|-)"#
                }
                Grammar::WindowsEvent => {
                    r"^(?P<timestamp>\d{4}-\d{2}-\d{2} \d{2}:\d{2}:\d{2}) (?P<level>[A-Za-z]+) (?P<source>[\w.\-]+) (?P<event_id>\d+) (?P<message>.*)$"
                }
                Grammar::Iso => {
                    r"^\[?(?P<timestamp>\d{4}-\d{2}-\d{2}[T ]\d{2}:\d{2}:\d{2}(?:[.,]\d+)?(?:Z|[+-]\d{2}:?\d{2})?)\]?\s+(?P<message>.+)$"
                }
                Grammar::Syslog => {
                    r"^(?:<\d{1,3}>)?(?P<timestamp>[A-Z][a-z]{2}\s+\d{1,2} \d{2}:\d{2}:\d{2}) (?P<hostname>\S+) (?P<service>[^:\s]+): (?P<message>.*)$"
                }
            };
            patterns.push((grammar, Regex::new(pattern)?));
        }
        Ok(TextGrammars {
            patterns,
            reference_year,
        })
    }

    /// Parse one non-blank line under the first grammar that matches it
    pub(crate) fn parse_line(
        &self,
        line: &str,
        extractor: &FieldExtractor,
    ) -> Result<LogRecord, ParseError> {
        let (grammar, caps) = self
            .patterns
            .iter()
            .find_map(|(grammar, re)| re.captures(line).map(|caps| (*grammar, caps)))
            .ok_or(ParseError::NoGrammar)?;

        let mut fields = BTreeMap::new();
        fields.insert("format".to_string(), grammar.name().to_string());

        match grammar {
            Grammar::Combined | Grammar::Common => self.access_record(line, &caps, fields, extractor),
            Grammar::WindowsEvent | Grammar::Iso | Grammar::Syslog => {
                let raw_ts = &caps["timestamp"];
                let timestamp = if grammar == Grammar::Syslog {
                    parse_syslog_timestamp(raw_ts, self.reference_year)?
                } else {
                    parse_timestamp(raw_ts)?
                };

                copy_groups(&caps, &["hostname", "service", "source", "event_id"], &mut fields);

                let mut message = caps.name("message").map(|m| m.as_str()).unwrap_or("");
                let mut level = caps.name("level").map(|m| m.as_str().to_string());
                if grammar == Grammar::Iso {
                    // A leading "[WARN]" / "ERROR:" token is the level
                    if let Some((first, rest)) = message.split_once(char::is_whitespace) {
                        let token = first.trim_matches(|c: char| c == '[' || c == ']' || c == ':');
                        if Severity::from_str(token).is_ok() {
                            level = Some(token.to_string());
                            message = rest.trim_start();
                        }
                    }
                }
                fields.insert("message".to_string(), message.to_string());

                let severity = level
                    .as_deref()
                    .and_then(|l| Severity::from_str(l).ok())
                    .unwrap_or_else(|| extractor.detect_severity(line));
                if let Some(level) = level {
                    fields.insert("level".to_string(), level);
                }

                Ok(LogRecord {
                    timestamp,
                    source_address: extractor.find_address(message),
                    user: extractor.find_user(message),
                    severity,
                    raw_text: line.to_string(),
                    parsed_fields: fields,
                })
            }
        }
    }

    fn access_record(
        &self,
        line: &str,
        caps: &Captures<'_>,
        mut fields: BTreeMap<String, String>,
        extractor: &FieldExtractor,
    ) -> Result<LogRecord, ParseError> {
        let timestamp = parse_timestamp(&caps["timestamp"])?;

        // The request line is split by hand so unencoded spaces in the
        // path (common in attack traffic) do not defeat the grammar.
        let request = caps["request"].trim();
        let mut tokens: Vec<&str> = request.split(' ').collect();
        let method = if tokens.len() > 1 { tokens.remove(0) } else { "" };
        let has_protocol =
            tokens.len() > 1 && tokens.last().is_some_and(|t| t.starts_with("HTTP/"));
        let protocol = if has_protocol { tokens.pop().unwrap_or("") } else { "" };
        let path = tokens.join(" ");

        fields.insert("method".to_string(), method.to_string());
        fields.insert("path".to_string(), path);
        fields.insert("protocol".to_string(), protocol.to_string());
        copy_groups(caps, &["status", "size", "referer", "user_agent"], &mut fields);

        let user = Some(&caps["user"])
            .filter(|u| *u != "-")
            .map(str::to_string);

        Ok(LogRecord {
            timestamp,
            source_address: normalize_address(&caps["ip"]),
            user,
            severity: extractor.detect_severity(line),
            raw_text: line.to_string(),
            parsed_fields: fields,
        })
    }
}

fn copy_groups(caps: &Captures<'_>, names: &[&str], fields: &mut BTreeMap<String, String>) {
    for name in names {
        if let Some(m) = caps.name(name) {
            fields.insert(name.to_string(), m.as_str().to_string());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Datelike, Timelike};
    use std::net::IpAddr;

    fn grammars() -> (TextGrammars, FieldExtractor) {
        (TextGrammars::new(2024).unwrap(), FieldExtractor::new().unwrap())
    }

    #[test]
    fn test_combined_line() {
        let (g, x) = grammars();
        let line = r#"203.0.113.9 - alice [10/Oct/2023:13:55:36 +0000] "GET /index.html HTTP/1.1" 200 2326 "-" "Mozilla/5.0""#;
        let record = g.parse_line(line, &x).unwrap();
        assert_eq!(record.format(), "combined");
        assert_eq!(record.source_address, Some(IpAddr::from_str("203.0.113.9").unwrap()));
        assert_eq!(record.user.as_deref(), Some("alice"));
        assert_eq!(record.field("path"), Some("/index.html"));
        assert_eq!(record.field("user_agent"), Some("Mozilla/5.0"));
        assert_eq!(record.field("status"), Some("200"));
    }

    #[test]
    fn test_common_line_with_raw_spaces_in_path() {
        let (g, x) = grammars();
        let line = r#"10.0.0.50 - - [10/Oct/2023:13:55:36 +0000] "GET /search?q=' OR '1'='1 HTTP/1.1" 200 512"#;
        let record = g.parse_line(line, &x).unwrap();
        assert_eq!(record.format(), "common");
        assert_eq!(record.user, None);
        assert_eq!(record.field("method"), Some("GET"));
        assert_eq!(record.field("path"), Some("/search?q=' OR '1'='1"));
        assert_eq!(record.field("protocol"), Some("HTTP/1.1"));
    }

    #[test]
    fn test_syslog_line() {
        let (g, x) = grammars();
        let line = "<34>Mar  3 04:05:06 web01 sshd[1234]: Failed password for root from 198.51.100.7 port 22 ssh2";
        let record = g.parse_line(line, &x).unwrap();
        assert_eq!(record.format(), "syslog");
        assert_eq!(record.timestamp.year(), 2024);
        assert_eq!(record.timestamp.day(), 3);
        assert_eq!(record.field("service"), Some("sshd[1234]"));
        assert_eq!(record.source_address, Some(IpAddr::from_str("198.51.100.7").unwrap()));
        assert_eq!(record.user.as_deref(), Some("root"));
        assert_eq!(record.severity, Severity::Error);
    }

    #[test]
    fn test_windows_event_line() {
        let (g, x) = grammars();
        let line = "2024-02-01 10:00:00 Warning Microsoft.Security 4625 Logon failure from 192.0.2.44";
        let record = g.parse_line(line, &x).unwrap();
        assert_eq!(record.format(), "windows_event");
        assert_eq!(record.severity, Severity::Warning);
        assert_eq!(record.field("event_id"), Some("4625"));
        assert_eq!(record.timestamp.hour(), 10);
    }

    #[test]
    fn test_iso_line_with_level_token() {
        let (g, x) = grammars();
        let line = "2024-02-01T10:00:00Z [CRITICAL] payment service down user=ops";
        let record = g.parse_line(line, &x).unwrap();
        assert_eq!(record.format(), "iso");
        assert_eq!(record.severity, Severity::Critical);
        assert_eq!(record.field("message"), Some("payment service down user=ops"));
        assert_eq!(record.user.as_deref(), Some("ops"));
        assert_eq!(record.source_address, None);
    }

    #[test]
    fn test_unmatched_line_fails() {
        let (g, x) = grammars();
        assert!(matches!(
            g.parse_line("%%%% not a log line", &x),
            Err(ParseError::NoGrammar)
        ));
    }

    #[test]
    fn test_bad_timestamp_fails() {
        let (g, x) = grammars();
        let line = r#"1.2.3.4 - - [not a date] "GET / HTTP/1.1" 200 1"#;
        assert!(matches!(
            g.parse_line(line, &x),
            Err(ParseError::InvalidTimestamp(_))
        ));
    }
}
