//! Input encoding detection and the raw record stream.
//!
//! Three encodings are accepted:
//! - an envelope mapping whose `body` is an array (or a string holding one), or whose
//!   `data` is an array
//! - a bare JSON array
//! - newline-delimited JSON
//!
//! The whole payload is parsed once; if that yields an envelope or an array the records
//! come out of it, otherwise the payload is treated as NDJSON and parsed line by line,
//! stopping at the first line that is not valid JSON.

use serde_json::Value;
use std::fs;
use std::path::Path;
use tracing::{debug, info};

use crate::constants::REQUEST_ID_KEYS;
use crate::error::{PipelineError, Result};

/// One record exactly as it appeared in the source.
#[derive(Debug, Clone, PartialEq)]
pub struct RawRecord {
    /// 0-based position within the stream
    pub position: usize,
    pub value: Value,
}

/// The encoding a payload was classified as.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputFormat {
    Envelope,
    JsonArray,
    Ndjson,
}

impl InputFormat {
    pub fn as_str(self) -> &'static str {
        match self {
            InputFormat::Envelope => "envelope",
            InputFormat::JsonArray => "json_array",
            InputFormat::Ndjson => "ndjson",
        }
    }
}

enum Source {
    Array(std::vec::IntoIter<Value>),
    Lines { text: String, offset: usize, line_no: usize },
}

/// Lazy, single-pass stream of raw records.
///
/// Yields `Err` at most once (the first malformed NDJSON line) and then ends.
pub struct RecordStream {
    format: InputFormat,
    source: Source,
    position: usize,
    failed: bool,
}

impl RecordStream {
    pub fn open(path: &Path) -> Result<Self> {
        let bytes = fs::read(path).map_err(|e| {
            PipelineError::Format(format!("cannot read input '{}': {}", path.display(), e))
        })?;
        let text = String::from_utf8_lossy(&bytes).into_owned();
        let stream = Self::from_text(text)?;
        info!(
            path = %path.display(),
            format = stream.format.as_str(),
            "Detected input encoding"
        );
        Ok(stream)
    }

    pub fn from_text(text: String) -> Result<Self> {
        let trimmed = text.trim_start_matches('\u{feff}').trim();
        if trimmed.is_empty() {
            return Err(PipelineError::Format("input is empty".into()));
        }

        if let Ok(whole) = serde_json::from_str::<Value>(trimmed) {
            match whole {
                Value::Object(mut map) => {
                    if let Some(records) = unwrap_envelope(&mut map)? {
                        return Ok(Self::array(InputFormat::Envelope, records));
                    }
                    debug!("Top-level mapping has no body array; reading as a single NDJSON line");
                }
                Value::Array(records) => return Ok(Self::array(InputFormat::JsonArray, records)),
                other => {
                    return Err(PipelineError::Format(format!(
                        "top-level JSON {} is neither an envelope, an array, nor a record",
                        json_kind(&other)
                    )));
                }
            }
        }

        Ok(Self {
            format: InputFormat::Ndjson,
            source: Source::Lines {
                text,
                offset: 0,
                line_no: 0,
            },
            position: 0,
            failed: false,
        })
    }

    fn array(format: InputFormat, records: Vec<Value>) -> Self {
        Self {
            format,
            source: Source::Array(records.into_iter()),
            position: 0,
            failed: false,
        }
    }

    pub fn format(&self) -> InputFormat {
        self.format
    }

    fn next_line(&mut self) -> Option<Result<Value>> {
        let Source::Lines { text, offset, line_no } = &mut self.source else {
            return None;
        };
        while *offset < text.len() {
            let rest = &text[*offset..];
            let (line, consumed) = match rest.find('\n') {
                Some(i) => (&rest[..i], i + 1),
                None => (rest, rest.len()),
            };
            *offset += consumed;
            *line_no += 1;

            let line = line.trim().trim_start_matches('\u{feff}');
            if line.is_empty() {
                continue;
            }
            return Some(serde_json::from_str::<Value>(line).map_err(|e| {
                PipelineError::Format(format!(
                    "line {} is not valid JSON ({}); input is not an envelope, a JSON array, or NDJSON",
                    line_no, e
                ))
            }));
        }
        None
    }
}

impl Iterator for RecordStream {
    type Item = Result<RawRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        let value = match &mut self.source {
            Source::Array(iter) => iter.next().map(Ok),
            Source::Lines { .. } => self.next_line(),
        }?;
        match value {
            Ok(value) => {
                let record = RawRecord {
                    position: self.position,
                    value,
                };
                self.position += 1;
                Some(Ok(record))
            }
            Err(e) => {
                self.failed = true;
                Some(Err(e))
            }
        }
    }
}

/// Pull the record array out of an envelope mapping, if it is one. A mapping that
/// carries a request id is a record, whatever its other fields hold.
fn unwrap_envelope(map: &mut serde_json::Map<String, Value>) -> Result<Option<Vec<Value>>> {
    if REQUEST_ID_KEYS.iter().any(|k| map.contains_key(*k)) {
        return Ok(None);
    }
    match map.remove("body") {
        Some(Value::Array(records)) => return Ok(Some(records)),
        Some(Value::String(body)) => {
            let body = body.trim();
            if body.starts_with('[') {
                return match serde_json::from_str::<Value>(body) {
                    Ok(Value::Array(records)) => Ok(Some(records)),
                    Ok(other) => Err(PipelineError::Format(format!(
                        "envelope body string holds {} instead of an array",
                        json_kind(&other)
                    ))),
                    Err(e) => Err(PipelineError::Format(format!(
                        "envelope body string is not valid JSON: {}",
                        e
                    ))),
                };
            }
        }
        Some(other) => {
            // not an envelope after all; put it back so the record stays intact
            map.insert("body".to_string(), other);
        }
        None => {}
    }
    if let Some(Value::Array(_)) = map.get("data") {
        if let Some(Value::Array(records)) = map.remove("data") {
            return Ok(Some(records));
        }
    }
    Ok(None)
}

fn json_kind(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collect(text: &str) -> (InputFormat, Vec<Value>) {
        let stream = RecordStream::from_text(text.to_string()).unwrap();
        let format = stream.format();
        let values = stream.map(|r| r.unwrap().value).collect();
        (format, values)
    }

    #[test]
    fn envelope_with_body_array() {
        let (format, values) = collect(r#"{"body":[{"id":"1"},{"id":"2"}],"statusCode":200}"#);
        assert_eq!(format, InputFormat::Envelope);
        assert_eq!(values.len(), 2);
        assert_eq!(values[1]["id"], "2");
    }

    #[test]
    fn envelope_with_stringified_body() {
        let (format, values) = collect(r#"{"body":"[{\"id\":\"7\"}]"}"#);
        assert_eq!(format, InputFormat::Envelope);
        assert_eq!(values[0]["id"], "7");
    }

    #[test]
    fn envelope_with_data_array() {
        let (format, values) = collect(r#"{"data":[{"id":"9"}]}"#);
        assert_eq!(format, InputFormat::Envelope);
        assert_eq!(values.len(), 1);
    }

    #[test]
    fn record_with_a_data_field_is_not_an_envelope() {
        let (format, values) = collect(r#"{"service_request_id":"5","data":[1,2,3],"body":[]}"#);
        assert_eq!(format, InputFormat::Ndjson);
        assert_eq!(values.len(), 1);
        assert_eq!(values[0]["service_request_id"], "5");
        assert_eq!(values[0]["data"], serde_json::json!([1, 2, 3]));
    }

    #[test]
    fn bare_array() {
        let (format, values) = collect("[{\"id\":1},{\"id\":2},{\"id\":3}]");
        assert_eq!(format, InputFormat::JsonArray);
        assert_eq!(values.len(), 3);
    }

    #[test]
    fn ndjson_skips_blank_lines() {
        let (format, values) = collect("{\"id\":\"a\"}\n\n  \n{\"id\":\"b\"}\r\n");
        assert_eq!(format, InputFormat::Ndjson);
        assert_eq!(values.len(), 2);
    }

    #[test]
    fn single_record_mapping_is_one_ndjson_line() {
        let (format, values) = collect(r#"{"id":"solo","description":"x"}"#);
        assert_eq!(format, InputFormat::Ndjson);
        assert_eq!(values.len(), 1);
        assert_eq!(values[0]["id"], "solo");
    }

    #[test]
    fn positions_are_sequential() {
        let stream = RecordStream::from_text("[{},{},{}]".to_string()).unwrap();
        let positions: Vec<usize> = stream.map(|r| r.unwrap().position).collect();
        assert_eq!(positions, vec![0, 1, 2]);
    }

    #[test]
    fn bad_ndjson_line_fails_fast_with_line_number() {
        let mut stream =
            RecordStream::from_text("{\"id\":1}\n{\"id\":2}\nnot json\n{\"id\":4}\n".to_string())
                .unwrap();
        assert!(stream.next().unwrap().is_ok());
        assert!(stream.next().unwrap().is_ok());
        let err = stream.next().unwrap().unwrap_err();
        assert!(err.to_string().contains("line 3"), "{}", err);
        assert!(stream.next().is_none());
    }

    #[test]
    fn empty_input_is_a_format_error() {
        assert!(matches!(
            RecordStream::from_text("   \n".to_string()),
            Err(PipelineError::Format(_))
        ));
    }

    #[test]
    fn scalar_top_level_is_a_format_error() {
        assert!(matches!(
            RecordStream::from_text("42".to_string()),
            Err(PipelineError::Format(_))
        ));
    }
}
