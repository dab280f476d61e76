use anyhow::Result;
use serde_json::{json, Value};
use std::path::Path;
use tempfile::tempdir;

use sf311_pipeline::domain::CanonicalRequest;
use sf311_pipeline::pipeline::ingestion::{InputFormat, RecordStream};
use sf311_pipeline::pipeline::processing::keywords::{KeywordExtractor, KeywordTable};
use sf311_pipeline::pipeline::processing::normalize::{FieldNormalizer, NormalizeOptions};
use sf311_pipeline::storage::{self, OutputPaths};

fn normalizer() -> Result<FieldNormalizer> {
    Ok(FieldNormalizer::new(
        KeywordExtractor::new(KeywordTable::pinned()?),
        NormalizeOptions {
            max_text_len: 1000,
            size_feet_max: 400.0,
            num_people_max: 25.0,
        },
    ))
}

fn raw_rows() -> Vec<Value> {
    vec![
        json!({
            "service_request_id": "101",
            "requested_datetime": "2024-01-05T10:00:00.000",
            "updated_datetime": "2024-01-06 09:30:00",
            "status": "Closed",
            "status_notes": "Gone on arrival",
            "service_name": "Encampments",
            "police_district": "MISSION",
            "lat": 37.7599,
            "long": -122.4148,
            "description": "  Two tents   blocking the sidewalk, needles on ground ",
            "media_url": {"url": "https://img.example/101/a.jpg"},
            "homeless_tags": {
                "tents_or_makeshift_present": "yes",
                "size_feet": "about 30 ft",
                "num_people": 3,
                "person_position": "Sitting"
            }
        }),
        json!({
            "id": 102,
            "created_at": "2024-01-07T08:00:00-08:00",
            "text": "Person passed out face down near the on-ramp",
            "photos": ["https://img.example/102/a.jpg", "https://img.example/102/b.jpg"],
            "homeless_tags": {
                "person_lying_face_down_on_sidewalk": true,
                "person_position": "lying",
                "num_people": 1
            }
        }),
        json!({
            "request_id": "103",
            "details": "Caller reports a fire with a propane tank",
            "latitude": "37.78",
            "longitude": "-122.41"
        }),
    ]
}

fn normalize_text(text: &str) -> Result<(InputFormat, Vec<CanonicalRequest>)> {
    let stream = RecordStream::from_text(text.to_string())?;
    let format = stream.format();
    let mut outcome = normalizer()?.normalize_stream(stream)?;
    outcome.records.sort_by(|a, b| a.request_id.cmp(&b.request_id));
    Ok((format, outcome.records))
}

#[test]
fn three_encodings_produce_identical_records() -> Result<()> {
    let rows = raw_rows();
    let envelope = json!({ "statusCode": 200, "body": rows }).to_string();
    let array = Value::Array(rows.clone()).to_string();
    let ndjson = rows
        .iter()
        .map(|r| r.to_string())
        .collect::<Vec<_>>()
        .join("\n");

    let (f1, from_envelope) = normalize_text(&envelope)?;
    let (f2, from_array) = normalize_text(&array)?;
    let (f3, from_ndjson) = normalize_text(&ndjson)?;

    assert_eq!(f1, InputFormat::Envelope);
    assert_eq!(f2, InputFormat::JsonArray);
    assert_eq!(f3, InputFormat::Ndjson);
    assert_eq!(from_envelope.len(), 3);
    assert_eq!(from_envelope, from_array);
    assert_eq!(from_array, from_ndjson);
    Ok(())
}

#[test]
fn flags_do_not_depend_on_batch_order() -> Result<()> {
    let rows = raw_rows();
    let mut reversed = rows.clone();
    reversed.reverse();

    let (_, forward) = normalize_text(&Value::Array(rows).to_string())?;
    let (_, backward) = normalize_text(&Value::Array(reversed).to_string())?;
    assert_eq!(forward, backward);

    // the same text alone in a batch yields the same flags
    let single = json!([{"id": "103", "details": "Caller reports a fire with a propane tank"}]);
    let (_, alone) = normalize_text(&single.to_string())?;
    assert_eq!(alone[0].features, forward[2].features);
    assert!(alone[0].features.fire && alone[0].features.propane);
    Ok(())
}

#[test]
fn envelope_scenario_from_a_single_complaint() -> Result<()> {
    let payload = r#"{"body":[{"id":"1","text":"tent on ramp, wheelchair visible","photos":[]}]}"#;
    let (_, records) = normalize_text(payload)?;
    let r = &records[0];
    assert!(r.features.tents_present);
    assert!(r.features.on_ramp);
    assert!(r.features.wheelchair);
    assert!(!r.features.fire);
    assert!(r.images.image_fetch_status.is_empty());
    assert!(!r.has_photo);
    assert_eq!(r.size_feet_bin, "0");
    assert_eq!(r.num_people_bin, "0");
    Ok(())
}

#[test]
fn normalized_fields_follow_the_aliases() -> Result<()> {
    let (_, records) = normalize_text(&Value::Array(raw_rows()).to_string())?;
    let first = &records[0];
    assert_eq!(first.request_id, "101");
    assert_eq!(first.district.as_deref(), Some("MISSION"));
    assert_eq!(first.text.as_deref(), Some("Two tents blocking the sidewalk, needles on ground"));
    assert!(first.responder_goa);
    assert_eq!(first.size_feet_bin, "25-99");
    assert_eq!(first.num_people_bin, "2-4");
    assert_eq!(first.provenance.tag_person_position.as_deref(), Some("sitting"));
    assert_eq!(first.photo_urls, vec!["https://img.example/101/a.jpg".to_string()]);

    let second = &records[1];
    assert_eq!(second.request_id, "102");
    assert_eq!(
        second.created_at.map(|t| t.to_rfc3339()),
        Some("2024-01-07T16:00:00+00:00".to_string())
    );
    assert!(second.features.face_down && second.features.passed_out && second.features.on_ramp);
    assert_eq!(second.images.image_paths, vec![None, None]);

    assert_eq!(records[2].latitude, Some(37.78));
    Ok(())
}

fn paths(dir: &Path) -> OutputPaths {
    OutputPaths {
        jsonl: dir.join("out.jsonl"),
        parquet: dir.join("out.parquet"),
        csv: dir.join("out.csv"),
    }
}

#[test]
fn every_output_format_reads_back_the_same_rows() -> Result<()> {
    let (_, records) = normalize_text(&Value::Array(raw_rows()).to_string())?;
    let dir = tempdir()?;
    let out = paths(dir.path());
    let summary = storage::write_all(&records, &out)?;
    assert_eq!(summary.rows, 3);
    assert_eq!(summary.files.len(), 3);

    let from_jsonl = storage::read_any(&out.jsonl)?;
    let from_parquet = storage::read_any(&out.parquet)?;
    let from_csv = storage::read_any(&out.csv)?;
    assert_eq!(from_jsonl, records);
    assert_eq!(from_parquet, records);
    assert_eq!(from_csv, records);

    let leftovers: Vec<_> = std::fs::read_dir(dir.path())?
        .filter_map(|e| e.ok())
        .filter(|e| e.file_name().to_string_lossy().starts_with(".partial-"))
        .collect();
    assert!(leftovers.is_empty());
    Ok(())
}

#[test]
fn bad_rows_are_skipped_not_fatal() -> Result<()> {
    let payload = json!([
        {"id": "1", "text": "ok"},
        "not an object",
        {"text": "no id"},
        {"id": "2", "requested_datetime": "yesterday-ish"},
        {"id": "1", "text": "again"}
    ]);
    let outcome = normalizer()?.normalize_stream(RecordStream::from_text(payload.to_string())?)?;
    assert_eq!(outcome.read, 5);
    assert_eq!(outcome.records.len(), 1);
    assert_eq!(outcome.skipped.len(), 4);
    assert_eq!(outcome.skipped[3].reason, "duplicate request_id");
    assert!(outcome.sample_reasons().len() <= 5);
    Ok(())
}

#[test]
fn malformed_ndjson_aborts_with_line_number() -> Result<()> {
    let text = "{\"id\":\"1\"}\n{\"id\":\"2\"\n";
    let err = normalizer()?
        .normalize_stream(RecordStream::from_text(text.to_string())?)
        .unwrap_err();
    assert!(err.to_string().contains("line 2"), "{}", err);
    Ok(())
}
