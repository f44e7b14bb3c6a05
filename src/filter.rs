//! Filter queries over a completed job's records
//!
//! All given predicates must hold; an omitted predicate matches everything.
//! Time bounds are inclusive.

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::str::FromStr;
use thiserror::Error;

use crate::jobs::JobError;
use crate::models::{LogRecord, Severity};
use crate::normalizer::parse_address;

#[derive(Error, Debug)]
pub enum FilterError {
    #[error("invalid filter: {0}")]
    InvalidFilter(String),

    #[error(transparent)]
    Job(#[from] JobError),
}

/// Filter request as sent by clients
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FilterRequest {
    pub ip: Option<String>,
    pub user: Option<String>,
    pub severity: Option<String>,
    #[serde(alias = "start_time")]
    pub start_time: Option<String>,
    #[serde(alias = "end_time")]
    pub end_time: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FilterResult {
    /// Number of matching records, before the response cap
    pub total: usize,
    pub matches: Vec<LogRecord>,
}

/// A validated filter
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecordFilter {
    pub address: Option<IpAddr>,
    /// Substring of the record's user
    pub user: Option<String>,
    pub severity: Option<Severity>,
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
}

/// Blank strings count as omitted
fn given(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

fn parse_bound(name: &str, raw: &str) -> Result<DateTime<Utc>, FilterError> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Ok(dt.with_timezone(&Utc));
    }
    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
        .map(|naive| Utc.from_utc_datetime(&naive))
        .ok_or_else(|| FilterError::InvalidFilter(format!("{} '{}' is not an RFC 3339 time", name, raw)))
}

impl RecordFilter {
    pub fn from_request(request: &FilterRequest) -> Result<Self, FilterError> {
        let address = given(&request.ip)
            .map(|raw| {
                parse_address(raw)
                    .ok_or_else(|| FilterError::InvalidFilter(format!("'{}' is not an IP address", raw)))
            })
            .transpose()?;

        let severity = given(&request.severity)
            .map(|raw| {
                Severity::from_str(raw)
                    .map_err(|_| FilterError::InvalidFilter(format!("unknown severity '{}'", raw)))
            })
            .transpose()?;

        let start = given(&request.start_time)
            .map(|raw| parse_bound("startTime", raw))
            .transpose()?;
        let end = given(&request.end_time)
            .map(|raw| parse_bound("endTime", raw))
            .transpose()?;
        if let (Some(start), Some(end)) = (start, end) {
            if start > end {
                return Err(FilterError::InvalidFilter(
                    "startTime is after endTime".to_string(),
                ));
            }
        }

        Ok(RecordFilter {
            address,
            user: given(&request.user).map(str::to_string),
            severity,
            start,
            end,
        })
    }

    pub fn matches(&self, record: &LogRecord) -> bool {
        self.address.map_or(true, |a| record.source_address == Some(a))
            && self.user.as_deref().map_or(true, |u| {
                record.user.as_deref().is_some_and(|ru| ru.contains(u))
            })
            && self.severity.map_or(true, |s| record.severity == s)
            && self.start.map_or(true, |start| record.timestamp >= start)
            && self.end.map_or(true, |end| record.timestamp <= end)
    }

    /// Matching records in job order, at most `max_matches` of them
    pub fn apply(&self, records: &[LogRecord], max_matches: usize) -> FilterResult {
        let mut total = 0;
        let mut matches = Vec::new();
        for record in records.iter().filter(|r| self.matches(r)) {
            total += 1;
            if matches.len() < max_matches {
                matches.push(record.clone());
            }
        }
        FilterResult { total, matches }
    }
}
