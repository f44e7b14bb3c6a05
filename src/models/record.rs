use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

/// Log level of a canonical record
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    Debug,
    Info,
    Warning,
    Error,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Debug => "DEBUG",
            Severity::Info => "INFO",
            Severity::Warning => "WARNING",
            Severity::Error => "ERROR",
            Severity::Critical => "CRITICAL",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Severity {
    type Err = String;

    /// Accepts the canonical names plus the common syslog/framework aliases
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "debug" | "trace" | "verbose" => Ok(Severity::Debug),
            "info" | "information" | "notice" | "informational" => Ok(Severity::Info),
            "warning" | "warn" => Ok(Severity::Warning),
            "error" | "err" => Ok(Severity::Error),
            "critical" | "crit" | "fatal" | "alert" | "emerg" | "emergency" => {
                Ok(Severity::Critical)
            }
            other => Err(format!("unknown severity '{}'", other)),
        }
    }
}

/// One normalized log entry, independent of the format it was read from.
///
/// Records are created by the normalizer and never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogRecord {
    pub timestamp: DateTime<Utc>,
    /// Source address; `None` when the grammar carried no address
    #[serde(rename = "ip")]
    pub source_address: Option<IpAddr>,
    pub user: Option<String>,
    pub severity: Severity,
    #[serde(rename = "raw")]
    pub raw_text: String,
    #[serde(rename = "fields")]
    pub parsed_fields: BTreeMap<String, String>,
}

impl LogRecord {
    /// Look up a parsed field by name
    pub fn field(&self, name: &str) -> Option<&str> {
        self.parsed_fields.get(name).map(String::as_str)
    }

    /// Name of the grammar that produced this record
    pub fn format(&self) -> &str {
        self.field("format").unwrap_or("unknown")
    }

    fn first_field(&self, names: &[&str]) -> Option<&str> {
        names.iter().find_map(|name| self.field(name))
    }

    /// HTTP status code, when the record carries one
    pub fn status_code(&self) -> Option<u16> {
        self.first_field(&["status", "status_code", "http.status_code", "response_code"])
            .and_then(|s| s.trim().parse().ok())
    }

    pub fn user_agent(&self) -> Option<&str> {
        self.first_field(&["user_agent", "useragent", "http.user_agent", "agent"])
            .filter(|ua| !ua.is_empty() && *ua != "-")
    }

    /// Requested path without its query string
    pub fn path(&self) -> Option<&str> {
        self.first_field(&["path", "url", "uri", "request_path"])
            .map(|p| p.split('?').next().unwrap_or(p))
            .filter(|p| !p.is_empty())
    }
}
