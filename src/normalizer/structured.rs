//! Structured-input grammars: JSON (array, object or lines), CSV and XML events.

use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use serde_json::Value;
use std::collections::BTreeMap;
use std::iter;

use super::fields::FieldExtractor;
use super::ParseError;
use crate::models::LogRecord;

pub(crate) type RecordResults<'a> = Box<dyn Iterator<Item = Result<LogRecord, ParseError>> + 'a>;

/// JSON input: a top-level array, a single (possibly pretty-printed) object,
/// or one object per line
pub(crate) fn json_records<'a>(text: &'a str, extractor: &'a FieldExtractor) -> RecordResults<'a> {
    let trimmed = text.trim_start();
    if trimmed.starts_with('[') {
        if let Ok(Value::Array(items)) = serde_json::from_str::<Value>(text) {
            return Box::new(
                items
                    .into_iter()
                    .map(move |item| json_value_record(item, None, extractor)),
            );
        }
    } else if trimmed.starts_with('{') {
        if let Ok(value @ Value::Object(_)) = serde_json::from_str::<Value>(text) {
            return Box::new(iter::once(json_value_record(value, None, extractor)));
        }
    }

    Box::new(
        text.lines()
            .filter(|line| !line.trim().is_empty())
            .map(move |line| {
                serde_json::from_str::<Value>(line)
                    .map_err(|e| ParseError::Malformed(e.to_string()))
                    .and_then(|value| json_value_record(value, Some(line), extractor))
            }),
    )
}

fn json_value_record(
    value: Value,
    raw: Option<&str>,
    extractor: &FieldExtractor,
) -> Result<LogRecord, ParseError> {
    let Value::Object(map) = &value else {
        return Err(ParseError::Malformed("expected a JSON object".to_string()));
    };

    let mut fields = BTreeMap::new();
    flatten_json("", map, &mut fields);

    let raw_text = match raw {
        Some(line) => line.to_string(),
        None => value.to_string(),
    };
    extractor.record_from_fields(fields, raw_text, "json")
}

/// Nested objects become dotted keys; arrays are kept as JSON text
fn flatten_json(
    prefix: &str,
    map: &serde_json::Map<String, Value>,
    fields: &mut BTreeMap<String, String>,
) {
    for (key, value) in map {
        let name = if prefix.is_empty() {
            key.clone()
        } else {
            format!("{}.{}", prefix, key)
        };
        match value {
            Value::Null => {}
            Value::String(s) => {
                fields.insert(name, s.clone());
            }
            Value::Object(inner) => flatten_json(&name, inner, fields),
            other => {
                fields.insert(name, other.to_string());
            }
        }
    }
}

/// CSV input: the first row names the columns
pub(crate) fn csv_records<'a>(text: &'a str, extractor: &'a FieldExtractor) -> RecordResults<'a> {
    let mut reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .from_reader(text.as_bytes());

    let headers = match reader.headers() {
        Ok(headers) => headers.clone(),
        Err(e) => return Box::new(iter::once(Err(ParseError::Csv(e.to_string())))),
    };

    Box::new(reader.into_records().map(move |row| {
        let row = row.map_err(|e| ParseError::Csv(e.to_string()))?;
        let fields: BTreeMap<String, String> = headers
            .iter()
            .zip(row.iter())
            .filter(|(_, value)| !value.is_empty())
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect();
        let raw_text = row.iter().collect::<Vec<_>>().join(",");
        extractor.record_from_fields(fields, raw_text, "csv")
    }))
}

/// XML event input.
///
/// Every child element of the document root is one event. Attributes at any
/// depth and the text of nested elements become fields; an element carrying a
/// `Name` attribute (Windows `<Data Name="IpAddress">`) stores its text under
/// that name. A malformed event fails alone; a document the reader cannot get
/// past stops at the first syntax error.
pub(crate) fn xml_records<'a>(text: &'a str, extractor: &'a FieldExtractor) -> RecordResults<'a> {
    Box::new(parse_events(text, extractor).into_iter())
}

struct EventBuilder {
    start: usize,
    fields: BTreeMap<String, String>,
    error: Option<String>,
}

/// An open element and the field its text is stored under
struct OpenElement {
    name: String,
    target: Option<String>,
    text: String,
}

fn parse_events(doc: &str, extractor: &FieldExtractor) -> Vec<Result<LogRecord, ParseError>> {
    let mut reader = Reader::from_str(doc);
    // Mismatched closing tags are handled per event below
    reader.check_end_names(false);

    let mut results = Vec::new();
    let mut stack: Vec<OpenElement> = Vec::new();
    let mut current: Option<EventBuilder> = None;
    let mut root_seen = false;

    loop {
        let before = reader.buffer_position();
        let event = match reader.read_event() {
            Ok(event) => event,
            Err(e) => {
                current = None;
                results.push(Err(ParseError::Xml(format!(
                    "at byte {}: {}",
                    reader.buffer_position(),
                    e
                ))));
                break;
            }
        };
        let after = reader.buffer_position();

        match event {
            Event::Start(ref start) | Event::Empty(ref start) => {
                let self_closing = matches!(event, Event::Empty(_));
                let name = String::from_utf8_lossy(start.name().as_ref()).into_owned();
                let (attrs, attr_error) = match attributes(start) {
                    Ok(attrs) => (attrs, None),
                    Err(message) => (Vec::new(), Some(message)),
                };

                if stack.is_empty() {
                    root_seen = true;
                    if !self_closing {
                        stack.push(OpenElement { name, target: None, text: String::new() });
                    }
                    continue;
                }

                if stack.len() == 1 {
                    let mut builder = EventBuilder {
                        start: before,
                        fields: BTreeMap::new(),
                        error: attr_error,
                    };
                    builder.fields.insert("tag".to_string(), name.clone());
                    builder.fields.extend(attrs);
                    if self_closing {
                        results.push(finish_event(builder, doc, after, extractor));
                    } else {
                        current = Some(builder);
                        stack.push(OpenElement {
                            name,
                            target: Some("text".to_string()),
                            text: String::new(),
                        });
                    }
                    continue;
                }

                let target = attrs
                    .iter()
                    .find(|(key, _)| key == "Name")
                    .map(|(_, value)| value.clone())
                    .unwrap_or_else(|| name.clone());
                if let Some(builder) = current.as_mut() {
                    if let Some(message) = attr_error {
                        builder.error.get_or_insert(message);
                    }
                    for (key, value) in attrs {
                        if key != "Name" {
                            builder.fields.insert(key, value);
                        }
                    }
                }
                if !self_closing {
                    stack.push(OpenElement { name, target: Some(target), text: String::new() });
                }
            }
            Event::Text(text) => {
                let decoded = match text.unescape() {
                    Ok(decoded) => decoded.into_owned(),
                    Err(e) => {
                        if let Some(builder) = current.as_mut() {
                            builder.error.get_or_insert(e.to_string());
                        }
                        continue;
                    }
                };
                if let Some(open) = stack.last_mut() {
                    open.text.push_str(&decoded);
                }
            }
            Event::CData(data) => {
                if let Some(open) = stack.last_mut() {
                    open.text.push_str(&String::from_utf8_lossy(&data));
                }
            }
            Event::End(end) => {
                let name = String::from_utf8_lossy(end.name().as_ref()).into_owned();
                match stack.iter().rposition(|open| open.name == name) {
                    Some(pos) => {
                        if pos != stack.len() - 1 {
                            if let Some(builder) = current.as_mut() {
                                builder
                                    .error
                                    .get_or_insert(format!("unclosed element inside </{}>", name));
                            }
                        }
                        let closed = stack.split_off(pos);
                        if let Some(builder) = current.as_mut() {
                            for open in &closed {
                                store_text(builder, open);
                            }
                        }
                    }
                    None => {
                        if let Some(builder) = current.as_mut() {
                            builder
                                .error
                                .get_or_insert(format!("unexpected closing tag </{}>", name));
                        }
                        continue;
                    }
                }
                if stack.len() <= 1 {
                    if let Some(builder) = current.take() {
                        results.push(finish_event(builder, doc, after, extractor));
                    }
                }
            }
            Event::Eof => break,
            // Declarations, comments, processing instructions, doctype
            _ => {}
        }
    }

    if let Some(builder) = current {
        results.push(Err(ParseError::Xml(format!(
            "unterminated event starting at byte {}",
            builder.start
        ))));
    }
    if !root_seen {
        results.push(Err(ParseError::Xml("no root element".to_string())));
    }
    results
}

fn attributes(start: &BytesStart<'_>) -> Result<Vec<(String, String)>, String> {
    start
        .attributes()
        .map(|attr| {
            let attr = attr.map_err(|e| e.to_string())?;
            let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
            let value = attr.unescape_value().map_err(|e| e.to_string())?;
            Ok((key, value.into_owned()))
        })
        .collect()
}

fn store_text(builder: &mut EventBuilder, open: &OpenElement) {
    let text = open.text.trim();
    if let Some(target) = &open.target {
        if !text.is_empty() {
            builder.fields.insert(target.clone(), text.to_string());
        }
    }
}

fn finish_event(
    builder: EventBuilder,
    doc: &str,
    end: usize,
    extractor: &FieldExtractor,
) -> Result<LogRecord, ParseError> {
    if let Some(error) = builder.error {
        return Err(ParseError::Xml(error));
    }
    let raw_text = doc.get(builder.start..end).unwrap_or_default().to_string();
    extractor.record_from_fields(builder.fields, raw_text, "xml")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Severity;
    use std::net::IpAddr;
    use std::str::FromStr;

    fn collect(iter: RecordResults<'_>) -> (Vec<LogRecord>, usize) {
        let mut ok = Vec::new();
        let mut failed = 0;
        for item in iter {
            match item {
                Ok(record) => ok.push(record),
                Err(_) => failed += 1,
            }
        }
        (ok, failed)
    }

    #[test]
    fn test_json_lines_with_bad_line() {
        let x = FieldExtractor::new().unwrap();
        let text = concat!(
            r#"{"timestamp":"2024-01-01T00:00:00Z","ip":"10.0.0.1","level":"error","msg":"boom"}"#,
            "\n",
            "{not json}\n",
            "\n",
            r#"{"time":1700000000,"client_ip":"10.0.0.2","user":"bob"}"#,
            "\n"
        );
        let (records, failed) = collect(json_records(text, &x));
        assert_eq!(records.len(), 2);
        assert_eq!(failed, 1);
        assert_eq!(records[0].severity, Severity::Error);
        assert_eq!(records[0].format(), "json");
        assert_eq!(records[1].user.as_deref(), Some("bob"));
        assert_eq!(records[1].source_address, Some(IpAddr::from_str("10.0.0.2").unwrap()));
    }

    #[test]
    fn test_json_array_and_nested_fields() {
        let x = FieldExtractor::new().unwrap();
        let text = r#"[
            {"@timestamp":"2024-01-01T00:00:00Z","source":{"ip":"192.0.2.1"},"message":"ok"},
            {"message":"no timestamp here"}
        ]"#;
        let (records, failed) = collect(json_records(text, &x));
        assert_eq!(records.len(), 1);
        assert_eq!(failed, 1);
        assert_eq!(records[0].field("source.ip"), Some("192.0.2.1"));
    }

    #[test]
    fn test_pretty_printed_single_object() {
        let x = FieldExtractor::new().unwrap();
        let text = "{\n  \"ts\": \"2024-01-01 10:00:00\",\n  \"ip\": \"192.0.2.9\"\n}\n";
        let (records, failed) = collect(json_records(text, &x));
        assert_eq!((records.len(), failed), (1, 0));
    }

    #[test]
    fn test_csv_rows() {
        let x = FieldExtractor::new().unwrap();
        let text = "timestamp,ip,user,severity,message\n\
                    2024-01-01 00:00:00,10.1.1.1,alice,WARNING,disk almost full\n\
                    2024-01-01 00:00:01,10.1.1.2\n\
                    garbage,10.1.1.3,carol,INFO,bad time\n";
        let (records, failed) = collect(csv_records(text, &x));
        assert_eq!(records.len(), 1);
        assert_eq!(failed, 2);
        assert_eq!(records[0].severity, Severity::Warning);
        assert_eq!(records[0].user.as_deref(), Some("alice"));
        assert_eq!(records[0].format(), "csv");
    }

    #[test]
    fn test_xml_windows_events() {
        let x = FieldExtractor::new().unwrap();
        let text = r#"<?xml version="1.0"?>
<Events>
  <Event>
    <System><EventID>4625</EventID><TimeCreated SystemTime="2024-02-01T10:00:00Z"/></System>
    <EventData>
      <Data Name="TargetUserName">admin</Data>
      <Data Name="IpAddress">192.0.2.10</Data>
    </EventData>
  </Event>
  <Event><System><EventID>4624</EventID></System></Event>
</Events>"#;
        let (records, failed) = collect(xml_records(text, &x));
        assert_eq!(records.len(), 1);
        assert_eq!(failed, 1);
        let record = &records[0];
        assert_eq!(record.field("EventID"), Some("4625"));
        assert_eq!(record.user.as_deref(), Some("admin"));
        assert_eq!(record.source_address, Some(IpAddr::from_str("192.0.2.10").unwrap()));
        assert!(record.raw_text.starts_with("<Event>"));
    }

    #[test]
    fn test_xml_attribute_events_and_mismatch() {
        let x = FieldExtractor::new().unwrap();
        let text = r#"<log>
  <entry timestamp="2024-01-01T00:00:00Z" ip="10.0.0.9" level="critical"><message>a &amp; b</message></entry>
  <entry timestamp="2024-01-01T00:00:01Z"><message>broken</msg></entry>
  <entry timestamp="2024-01-01T00:00:02Z" ip="10.0.0.8"/>
</log>"#;
        let (records, failed) = collect(xml_records(text, &x));
        assert_eq!(records.len(), 2);
        assert_eq!(failed, 1);
        assert_eq!(records[0].severity, Severity::Critical);
        assert_eq!(records[0].field("message"), Some("a & b"));
    }

    #[test]
    fn test_xml_cdata_payload_kept_as_text() {
        let x = FieldExtractor::new().unwrap();
        let text = r#"<log><entry timestamp="2024-01-01T00:00:00Z" ip="10.0.0.9" level="error"><message><![CDATA[GET /q?<script>alert(1)</script>]]></message></entry></log>"#;
        let (records, failed) = collect(xml_records(text, &x));
        assert_eq!((records.len(), failed), (1, 0));
        let record = &records[0];
        assert_eq!(record.field("message"), Some("GET /q?<script>alert(1)</script>"));
        assert_eq!(record.field("script"), None);
        assert_eq!(record.severity, Severity::Error);
    }

    #[test]
    fn test_xml_quoted_gt_and_character_references() {
        let x = FieldExtractor::new().unwrap();
        let text = r#"<log>
  <entry timestamp="2024-01-01T00:00:00Z" ip="10.0.0.9" note="a>b" level="warning"><message>x &#39;y&#39; &#x3C;z&#x3E;</message></entry>
</log>"#;
        let (records, failed) = collect(xml_records(text, &x));
        assert_eq!((records.len(), failed), (1, 0));
        let record = &records[0];
        assert_eq!(record.field("note"), Some("a>b"));
        assert_eq!(record.severity, Severity::Warning);
        assert_eq!(record.field("message"), Some("x 'y' <z>"));
        assert_eq!(record.field("text"), None);
        assert!(record.raw_text.starts_with("<entry "));
        assert!(record.raw_text.ends_with("</entry>"));
    }

    #[test]
    fn test_xml_without_root() {
        let x = FieldExtractor::new().unwrap();
        let (records, failed) = collect(xml_records("just text", &x));
        assert!(records.is_empty());
        assert_eq!(failed, 1);
    }
}
