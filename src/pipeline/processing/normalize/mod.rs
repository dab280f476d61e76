use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{Map, Value};
use std::collections::HashSet;
use tracing::{debug, instrument, warn};

use crate::config::PipelineConfig;
use crate::constants::{REQUEST_ID_KEYS, SKIP_REASON_SAMPLES};
use crate::domain::{CanonicalRequest, ImageMeta, ProvenanceTags, SkippedRecord};
use crate::error::{PipelineError, Result};
use crate::observability::metrics::NormalizeMetrics;
use crate::pipeline::ingestion::reader::RawRecord;
use crate::pipeline::processing::bins::{PeopleBin, SizeBin};
use crate::pipeline::processing::keywords::KeywordExtractor;

const CREATED_KEYS: &[&str] = &["requested_datetime", "created_at", "createdDate"];
const UPDATED_KEYS: &[&str] = &["updated_datetime", "updated_at", "updatedDate"];
const STATUS_NOTES_KEYS: &[&str] = &["status_notes", "statusNotes"];
const DISTRICT_KEYS: &[&str] = &["police_district", "policeDistrict", "supervisor_district", "district"];
const CATEGORY_KEYS: &[&str] = &["service_name", "category", "service_subtype"];
const LATITUDE_KEYS: &[&str] = &["lat", "latitude"];
const LONGITUDE_KEYS: &[&str] = &["long", "lon", "longitude"];
const TEXT_KEYS: &[&str] = &["description", "text", "details"];
const PHOTO_KEYS: &[&str] = &["photos", "photo_urls", "media_url", "media_urls", "image_urls"];
const TAGS_KEY: &str = "homeless_tags";

/// Offset-aware timestamp formats, tried after RFC 3339.
const ZONED_FORMATS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%S%z",
    "%Y-%m-%dT%H:%M:%S%.f%z",
    "%Y-%m-%d %H:%M:%S%z",
];

/// Naive formats, read as UTC.
const NAIVE_FORMATS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%d %H:%M:%S",
    "%m/%d/%Y %H:%M",
];

/// Limits applied while normalizing.
#[derive(Debug, Clone)]
pub struct NormalizeOptions {
    /// Cap (in characters) on the stored description; features always see the full text
    pub max_text_len: usize,
    pub size_feet_max: f64,
    pub num_people_max: f64,
}

impl From<&PipelineConfig> for NormalizeOptions {
    fn from(cfg: &PipelineConfig) -> Self {
        Self {
            max_text_len: cfg.max_text_len,
            size_feet_max: cfg.size_feet_max,
            num_people_max: cfg.num_people_max,
        }
    }
}

/// Converts one raw record into its canonical shape.
pub trait Normalizer {
    fn normalize(&self, record: &RawRecord) -> Result<CanonicalRequest>;
}

/// Alias-aware normalizer for SF311 exports.
pub struct FieldNormalizer {
    extractor: KeywordExtractor,
    options: NormalizeOptions,
}

/// Outcome of normalizing a whole stream.
#[derive(Debug, Default)]
pub struct NormalizeOutcome {
    pub records: Vec<CanonicalRequest>,
    pub skipped: Vec<SkippedRecord>,
    pub read: usize,
}

impl NormalizeOutcome {
    /// The first few skip reasons, for the run summary.
    pub fn sample_reasons(&self) -> Vec<String> {
        self.skipped
            .iter()
            .take(SKIP_REASON_SAMPLES)
            .map(|s| match &s.request_id {
                Some(id) => format!("#{} ({}): {}", s.position, id, s.reason),
                None => format!("#{}: {}", s.position, s.reason),
            })
            .collect()
    }
}

impl FieldNormalizer {
    pub fn new(extractor: KeywordExtractor, options: NormalizeOptions) -> Self {
        Self { extractor, options }
    }

    pub fn extractor(&self) -> &KeywordExtractor {
        &self.extractor
    }

    /// Normalize every record of `stream`.
    ///
    /// Bad rows are skipped and recorded; a malformed stream (a format error from the
    /// reader) aborts. A repeated request id keeps the first occurrence.
    #[instrument(skip_all)]
    pub fn normalize_stream<I>(&self, stream: I) -> Result<NormalizeOutcome>
    where
        I: IntoIterator<Item = Result<RawRecord>>,
    {
        let mut outcome = NormalizeOutcome::default();
        let mut seen: HashSet<String> = HashSet::new();

        for item in stream {
            let raw = item?;
            outcome.read += 1;

            let skip = match self.normalize(&raw) {
                Ok(record) => {
                    if seen.insert(record.request_id.clone()) {
                        NormalizeMetrics::record_processed();
                        outcome.records.push(record);
                        None
                    } else {
                        Some(SkippedRecord {
                            position: raw.position,
                            request_id: Some(record.request_id),
                            reason: "duplicate request_id".to_string(),
                        })
                    }
                }
                Err(PipelineError::Record { position, reason }) => Some(SkippedRecord {
                    position,
                    request_id: peek_request_id(&raw.value),
                    reason,
                }),
                Err(other) => return Err(other),
            };

            if let Some(skipped) = skip {
                warn!(
                    position = skipped.position,
                    request_id = skipped.request_id.as_deref().unwrap_or("-"),
                    reason = %skipped.reason,
                    "Skipping record"
                );
                NormalizeMetrics::record_skipped();
                outcome.skipped.push(skipped);
            }
        }

        debug!(
            read = outcome.read,
            kept = outcome.records.len(),
            skipped = outcome.skipped.len(),
            "Normalization finished"
        );
        Ok(outcome)
    }

    fn reject(position: usize, reason: impl Into<String>) -> PipelineError {
        PipelineError::Record {
            position,
            reason: reason.into(),
        }
    }

    /// Parse the first present timestamp alias. Present but unparseable is an error.
    fn extract_timestamp(
        &self,
        data: &Map<String, Value>,
        keys: &[&'static str],
        position: usize,
    ) -> Result<Option<DateTime<Utc>>> {
        let Some((key, value)) = first_present(data, keys) else {
            return Ok(None);
        };
        match parse_timestamp(value) {
            Some(ts) => Ok(Some(ts)),
            None => Err(Self::reject(
                position,
                format!("unparseable timestamp in '{}': {}", key, value),
            )),
        }
    }

    /// Trim and collapse whitespace, returning `(full, stored, truncated)`.
    fn extract_text(&self, data: &Map<String, Value>) -> (String, Option<String>, bool) {
        let full = first_present(data, TEXT_KEYS)
            .and_then(|(_, v)| v.as_str())
            .map(collapse_whitespace)
            .unwrap_or_default();
        if full.is_empty() {
            return (full, None, false);
        }
        let char_count = full.chars().count();
        if char_count > self.options.max_text_len {
            let stored: String = full.chars().take(self.options.max_text_len).collect();
            let stored = stored.trim_end().to_string();
            (full, Some(stored), true)
        } else {
            let stored = full.clone();
            (full, Some(stored), false)
        }
    }

    fn extract_provenance(&self, data: &Map<String, Value>) -> ProvenanceTags {
        let Some(Value::Object(tags)) = data.get(TAGS_KEY) else {
            return ProvenanceTags::default();
        };
        ProvenanceTags {
            tag_safety_issue: tags.get("safety_issue").and_then(to_bool),
            tag_drugs: tags.get("drugs").and_then(to_bool),
            tag_person_position: tags
                .get("person_position")
                .and_then(to_text)
                .map(|s| s.to_lowercase()),
            tag_lying_face_down: tags
                .get("person_lying_face_down_on_sidewalk")
                .and_then(to_bool),
            tag_tents_present: tags.get("tents_or_makeshift_present").and_then(to_bool),
            tag_size_feet: tags.get("size_feet").and_then(to_num),
            tag_num_people: tags.get("num_people").and_then(to_num),
        }
    }
}

impl Normalizer for FieldNormalizer {
    fn normalize(&self, record: &RawRecord) -> Result<CanonicalRequest> {
        let position = record.position;
        let Value::Object(data) = &record.value else {
            return Err(Self::reject(position, "record is not a JSON object"));
        };

        let request_id = first_present(data, REQUEST_ID_KEYS)
            .and_then(|(_, v)| to_text(v))
            .ok_or_else(|| Self::reject(position, "missing request id"))?;

        let created_at = self.extract_timestamp(data, CREATED_KEYS, position)?;
        let updated_at = self.extract_timestamp(data, UPDATED_KEYS, position)?;

        let (full_text, text, text_truncated) = self.extract_text(data);
        let features = self.extractor.extract(&full_text);

        let status_notes = first_present(data, STATUS_NOTES_KEYS).and_then(|(_, v)| to_text(v));
        let responder_goa = self.extractor.responder_goa(status_notes.as_deref());

        let photo_urls = extract_photo_urls(data);
        let images = ImageMeta {
            image_paths: vec![None; photo_urls.len()],
            image_checksums: vec![None; photo_urls.len()],
            image_fetch_status: vec![None; photo_urls.len()],
        };

        let provenance = self.extract_provenance(data);
        let num_people_bin = PeopleBin::from_tag(provenance.tag_num_people, self.options.num_people_max);
        let size_feet_bin = SizeBin::from_tag(provenance.tag_size_feet, self.options.size_feet_max);

        Ok(CanonicalRequest {
            request_id,
            created_at,
            updated_at,
            status: data.get("status").and_then(to_text),
            status_notes,
            category: first_present(data, CATEGORY_KEYS).and_then(|(_, v)| to_text(v)),
            district: first_present(data, DISTRICT_KEYS).and_then(|(_, v)| to_text(v)),
            latitude: first_present(data, LATITUDE_KEYS).and_then(|(_, v)| to_num(v)),
            longitude: first_present(data, LONGITUDE_KEYS).and_then(|(_, v)| to_num(v)),
            desc_len: full_text.chars().count() as u64,
            text,
            text_truncated,
            has_photo: !photo_urls.is_empty(),
            photo_urls,
            features,
            responder_goa,
            num_people_bin: num_people_bin.label().to_string(),
            size_feet_bin: size_feet_bin.label().to_string(),
            images,
            provenance,
            keyword_table_version: self.extractor.table_version().to_string(),
        })
    }
}

/// First alias whose value is neither null nor a blank string.
fn first_present<'a>(data: &'a Map<String, Value>, keys: &[&'static str]) -> Option<(&'static str, &'a Value)> {
    keys.iter().find_map(|k| match data.get(*k) {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) if s.trim().is_empty() => None,
        Some(v) => Some((*k, v)),
    })
}

fn peek_request_id(value: &Value) -> Option<String> {
    value
        .as_object()
        .and_then(|data| first_present(data, REQUEST_ID_KEYS))
        .and_then(|(_, v)| to_text(v))
}

fn collapse_whitespace(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Strings (trimmed, non-empty) and numbers as text.
fn to_text(v: &Value) -> Option<String> {
    match v {
        Value::String(s) => {
            let s = collapse_whitespace(s);
            if s.is_empty() {
                None
            } else {
                Some(s)
            }
        }
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn to_bool(v: &Value) -> Option<bool> {
    match v {
        Value::Bool(b) => Some(*b),
        Value::Number(n) => match n.as_f64() {
            Some(x) if x == 1.0 => Some(true),
            Some(x) if x == 0.0 => Some(false),
            _ => None,
        },
        Value::String(s) => match s.trim().to_lowercase().as_str() {
            "true" | "t" | "yes" | "y" | "1" => Some(true),
            "false" | "f" | "no" | "n" | "0" => Some(false),
            _ => None,
        },
        _ => None,
    }
}

fn to_num(v: &Value) -> Option<f64> {
    match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => first_number(s),
        _ => None,
    }
}

static EMBEDDED_NUMBER: Lazy<Option<Regex>> = Lazy::new(|| Regex::new(r"[-+]?\d+(?:\.\d+)?").ok());

/// First signed decimal embedded in `s`, e.g. `"about 30 ft"` -> 30.
fn first_number(s: &str) -> Option<f64> {
    EMBEDDED_NUMBER.as_ref()?.find(s)?.as_str().parse().ok()
}

fn parse_timestamp(v: &Value) -> Option<DateTime<Utc>> {
    match v {
        Value::String(s) => parse_timestamp_str(s.trim()),
        Value::Number(n) => n.as_i64().and_then(|secs| DateTime::from_timestamp(secs, 0)),
        _ => None,
    }
}

fn parse_timestamp_str(s: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    for fmt in ZONED_FORMATS {
        if let Ok(dt) = DateTime::parse_from_str(s, fmt) {
            return Some(dt.with_timezone(&Utc));
        }
    }
    for fmt in NAIVE_FORMATS {
        if let Ok(dt) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(dt.and_utc());
        }
    }
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|dt| dt.and_utc())
}

/// Photo URLs from every alias, in order, without repeats.
fn extract_photo_urls(data: &Map<String, Value>) -> Vec<String> {
    fn push(url: &str, out: &mut Vec<String>) {
        let url = url.trim();
        if !url.is_empty() && !out.iter().any(|u| u == url) {
            out.push(url.to_string());
        }
    }
    fn collect(v: &Value, out: &mut Vec<String>) {
        match v {
            Value::String(s) => push(s, out),
            Value::Object(obj) => {
                if let Some(Value::String(s)) = obj.get("url") {
                    push(s, out);
                }
            }
            Value::Array(items) => {
                for item in items {
                    if !item.is_array() {
                        collect(item, out);
                    }
                }
            }
            _ => {}
        }
    }

    let mut urls = Vec::new();
    for key in PHOTO_KEYS {
        if let Some(v) = data.get(*key) {
            collect(v, &mut urls);
        }
    }
    urls
}
