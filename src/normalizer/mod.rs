//! Format normalizer
//!
//! Turns raw log inputs of any supported format into canonical
//! [`LogRecord`]s. Each input is classified into one [`LogFormat`] and parsed
//! by that format's grammar. Records that fail to parse are dropped and
//! counted; only an input set that yields no records at all is an error.

mod fields;
mod structured;
mod text;

use chrono::{Datelike, Utc};
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::config::NormalizerConfig;
use crate::models::LogRecord;
use fields::FieldExtractor;
use structured::RecordResults;
use text::TextGrammars;

/// Fatal ingestion failures
#[derive(Error, Debug)]
pub enum IngestionError {
    #[error("no records could be parsed from {bytes} bytes of input ({skipped} malformed records dropped)")]
    NoRecords { bytes: usize, skipped: usize },

    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// A single record that could not be parsed; recovered by dropping it
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ParseError {
    #[error("line matches no known log grammar")]
    NoGrammar,

    #[error("unparseable timestamp '{0}'")]
    InvalidTimestamp(String),

    #[error("record has no timestamp field")]
    MissingTimestamp,

    #[error("malformed JSON record: {0}")]
    Malformed(String),

    #[error("malformed CSV record: {0}")]
    Csv(String),

    #[error("malformed XML event: {0}")]
    Xml(String),
}

/// Supported input formats
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    PlainText,
    Json,
    Csv,
    Xml,
}

impl LogFormat {
    /// Parse an explicit format hint ("text", "json", "jsonl", "csv", "xml")
    pub fn from_hint(hint: &str) -> Option<Self> {
        match hint.trim().to_ascii_lowercase().as_str() {
            "text" | "txt" | "plain" | "log" => Some(LogFormat::PlainText),
            "json" | "jsonl" | "ndjson" | "json-lines" => Some(LogFormat::Json),
            "csv" => Some(LogFormat::Csv),
            "xml" => Some(LogFormat::Xml),
            _ => None,
        }
    }

    fn from_extension(name: &str) -> Option<Self> {
        let ext = Path::new(name).extension()?.to_str()?.to_ascii_lowercase();
        match ext.as_str() {
            "json" | "jsonl" | "ndjson" => Some(LogFormat::Json),
            "csv" => Some(LogFormat::Csv),
            "xml" => Some(LogFormat::Xml),
            _ => None,
        }
    }
}

/// One raw log source: an uploaded file, a fetched server log, etc.
#[derive(Debug, Clone)]
pub struct RawInput {
    /// File name, used for extension-based classification
    pub name: Option<String>,
    /// Explicit format declared by the caller
    pub hint: Option<LogFormat>,
    text: String,
    bytes: usize,
}

impl RawInput {
    /// Wrap raw bytes; invalid UTF-8 is replaced rather than rejected
    pub fn from_bytes(name: Option<String>, data: &[u8]) -> Self {
        RawInput {
            name,
            hint: None,
            text: String::from_utf8_lossy(data).into_owned(),
            bytes: data.len(),
        }
    }

    pub fn from_text(name: Option<String>, text: impl Into<String>) -> Self {
        let text = text.into();
        RawInput {
            name,
            hint: None,
            bytes: text.len(),
            text,
        }
    }

    /// Read a local file
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self, IngestionError> {
        let path = path.as_ref();
        let data = std::fs::read(path).map_err(|source| IngestionError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let name = path.file_name().map(|n| n.to_string_lossy().into_owned());
        Ok(Self::from_bytes(name, &data))
    }

    pub fn with_hint(mut self, hint: LogFormat) -> Self {
        self.hint = Some(hint);
        self
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn len(&self) -> usize {
        self.bytes
    }

    pub fn is_empty(&self) -> bool {
        self.text.trim().is_empty()
    }
}

/// Pick the grammar for an input: explicit hint, then file extension,
/// then content sniffing, falling back to plain text
pub fn classify(input: &RawInput) -> LogFormat {
    if let Some(hint) = input.hint {
        return hint;
    }
    if let Some(format) = input.name.as_deref().and_then(LogFormat::from_extension) {
        return format;
    }
    sniff(input.text())
}

fn sniff(text: &str) -> LogFormat {
    let trimmed = text.trim_start();
    match trimmed.chars().next() {
        Some('{') | Some('[') => return LogFormat::Json,
        Some('<') => {
            // Syslog priority prefixes ("<34>Jan ...") also start with '<'
            let is_priority = trimmed
                .strip_prefix('<')
                .and_then(|rest| rest.split_once('>'))
                .is_some_and(|(pri, _)| !pri.is_empty() && pri.chars().all(|c| c.is_ascii_digit()));
            if !is_priority {
                return LogFormat::Xml;
            }
        }
        _ => {}
    }

    let header = trimmed.lines().next().unwrap_or("").to_ascii_lowercase();
    let columns: Vec<&str> = header.split(',').map(str::trim).collect();
    let names_time = columns
        .iter()
        .any(|c| fields::TIMESTAMP_ALIASES.contains(&c.trim_matches('"')));
    if columns.len() >= 3 && names_time {
        return LogFormat::Csv;
    }
    LogFormat::PlainText
}

/// Parse an address the way record addresses are normalized
/// (IPv4 leading zeros stripped)
pub fn parse_address(raw: &str) -> Option<IpAddr> {
    fields::normalize_address(raw)
}

/// Lazy sequence of records parsed from one input.
///
/// Malformed records are skipped and counted; see [`RecordStream::skipped`].
pub struct RecordStream<'a> {
    inner: RecordResults<'a>,
    skipped: usize,
}

impl<'a> RecordStream<'a> {
    /// Records dropped so far
    pub fn skipped(&self) -> usize {
        self.skipped
    }
}

impl Iterator for RecordStream<'_> {
    type Item = LogRecord;

    fn next(&mut self) -> Option<LogRecord> {
        loop {
            match self.inner.next()? {
                Ok(record) => return Some(record),
                Err(e) => {
                    self.skipped += 1;
                    log::debug!("Dropping unparseable record: {}", e);
                }
            }
        }
    }
}

/// All records parsed from a job's inputs
#[derive(Debug, Clone, Default)]
pub struct Normalized {
    pub records: Vec<LogRecord>,
    pub skipped: usize,
}

/// Parses raw inputs into canonical records
pub struct Normalizer {
    extractor: FieldExtractor,
    grammars: TextGrammars,
}

impl Normalizer {
    pub fn new(config: &NormalizerConfig) -> Result<Self, regex::Error> {
        let year = config.reference_year.unwrap_or_else(|| Utc::now().year());
        Ok(Normalizer {
            extractor: FieldExtractor::new()?,
            grammars: TextGrammars::new(year)?,
        })
    }

    /// Lazily parse one input. Calling again restarts from the beginning.
    pub fn records<'a>(&'a self, input: &'a RawInput) -> RecordStream<'a> {
        let text = input.text();
        let inner: RecordResults<'a> = match classify(input) {
            LogFormat::PlainText => Box::new(
                text.lines()
                    .filter(|line| !line.trim().is_empty())
                    .map(move |line| self.grammars.parse_line(line.trim_end(), &self.extractor)),
            ),
            LogFormat::Json => structured::json_records(text, &self.extractor),
            LogFormat::Csv => structured::csv_records(text, &self.extractor),
            LogFormat::Xml => structured::xml_records(text, &self.extractor),
        };
        RecordStream { inner, skipped: 0 }
    }

    /// Parse every input of a job.
    ///
    /// Fails only when the inputs held data but not a single record parsed.
    pub fn normalize(&self, inputs: &[RawInput]) -> Result<Normalized, IngestionError> {
        let mut normalized = Normalized::default();
        for input in inputs {
            let format = classify(input);
            let mut stream = self.records(input);
            normalized.records.extend(&mut stream);
            normalized.skipped += stream.skipped();
            log::info!(
                "Parsed input {} as {:?}: {} records so far, {} dropped",
                input.name.as_deref().unwrap_or("<inline>"),
                format,
                normalized.records.len(),
                normalized.skipped
            );
        }

        let has_data = inputs.iter().any(|input| !input.is_empty());
        if normalized.records.is_empty() && has_data {
            return Err(IngestionError::NoRecords {
                bytes: inputs.iter().map(RawInput::len).sum(),
                skipped: normalized.skipped,
            });
        }
        Ok(normalized)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Severity;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn normalizer() -> Normalizer {
        Normalizer::new(&NormalizerConfig {
            reference_year: Some(2024),
        })
        .unwrap()
    }

    const ACCESS_LOG: &str = r#"10.0.0.1 - - [10/Oct/2023:13:55:36 +0000] "GET / HTTP/1.1" 200 100
10.0.0.2 - - [10/Oct/2023:13:55:37 +0000] "GET /about HTTP/1.1" 200 100

this line is not a log
10.0.0.3 - - [10/Oct/2023:13:55:38 +0000] "POST /login HTTP/1.1" 401 12
"#;

    #[test]
    fn test_classify_precedence() {
        let json_text = RawInput::from_text(Some("app.log".into()), "{\"a\":1}");
        assert_eq!(classify(&json_text), LogFormat::Json);

        let by_ext = RawInput::from_text(Some("events.csv".into()), "{\"a\":1}");
        assert_eq!(classify(&by_ext), LogFormat::Csv);

        let hinted = by_ext.clone().with_hint(LogFormat::Json);
        assert_eq!(classify(&hinted), LogFormat::Json);

        let xml = RawInput::from_text(None, "<events></events>");
        assert_eq!(classify(&xml), LogFormat::Xml);

        let syslog = RawInput::from_text(None, "<34>Jan  1 12:00:00 host sshd[1]: hello");
        assert_eq!(classify(&syslog), LogFormat::PlainText);

        let csv = RawInput::from_text(None, "timestamp,ip,message\n2024-01-01 00:00:00,1.1.1.1,hi");
        assert_eq!(classify(&csv), LogFormat::Csv);

        let plain = RawInput::from_text(Some("access.log".into()), ACCESS_LOG);
        assert_eq!(classify(&plain), LogFormat::PlainText);
    }

    #[test]
    fn test_stream_counts_skipped_and_restarts() {
        let n = normalizer();
        let input = RawInput::from_text(None, ACCESS_LOG);

        let mut stream = n.records(&input);
        let records: Vec<_> = stream.by_ref().collect();
        assert_eq!(records.len(), 3);
        assert_eq!(stream.skipped(), 1);

        // Re-invoking on the same input yields the same sequence
        let again: Vec<_> = n.records(&input).collect();
        assert_eq!(records, again);
    }

    #[test]
    fn test_total_counts_parsed_records_not_lines() {
        let n = normalizer();
        let inputs = vec![
            RawInput::from_text(Some("a.log".into()), ACCESS_LOG),
            RawInput::from_text(
                Some("b.jsonl".into()),
                "{\"ts\":\"2024-01-01T00:00:00Z\",\"ip\":\"10.9.9.9\",\"level\":\"critical\"}\n",
            ),
        ];
        let normalized = n.normalize(&inputs).unwrap();
        assert_eq!(normalized.records.len(), 4);
        assert_eq!(normalized.skipped, 1);
        assert_eq!(normalized.records[3].severity, Severity::Critical);
    }

    #[test]
    fn test_garbage_input_is_fatal() {
        let n = normalizer();
        let garbage = RawInput::from_bytes(
            Some("garbage.bin".into()),
            b"\x00\x01garbage!!@@##$$%%^^&&**(()){{}}||~~garbage....\xff\xfe",
        );
        assert_eq!(garbage.len(), 50);
        let err = n.normalize(&[garbage]).unwrap_err();
        assert!(matches!(err, IngestionError::NoRecords { bytes: 50, .. }));
    }

    #[test]
    fn test_empty_input_is_not_fatal() {
        let n = normalizer();
        let normalized = n.normalize(&[RawInput::from_text(None, "\n\n")]).unwrap();
        assert!(normalized.records.is_empty());
    }

    #[test]
    fn test_from_path() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(ACCESS_LOG.as_bytes()).unwrap();

        let input = RawInput::from_path(file.path()).unwrap();
        assert!(input.name.is_some());
        assert_eq!(normalizer().records(&input).count(), 3);

        let missing = RawInput::from_path("/definitely/not/here.log");
        assert!(matches!(missing, Err(IngestionError::Read { .. })));
    }
}
