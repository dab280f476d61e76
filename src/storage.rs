//! Dataset persistence: three row-equivalent encodings behind one trait.
//!
//! Every format writes through [`atomic::write_atomic`], so a reader either sees the
//! previous complete file or the new complete file.

pub mod atomic;
pub mod columns;
pub mod csv_out;
pub mod jsonl;
pub mod parquet_out;

use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{info, instrument};

use crate::domain::CanonicalRequest;
use crate::error::{PipelineError, Result};
use crate::observability::metrics::WriterMetrics;

pub use csv_out::CsvFormat;
pub use jsonl::JsonlFormat;
pub use parquet_out::ParquetFormat;

/// A file encoding for the canonical dataset.
pub trait DatasetFormat: Send + Sync {
    fn name(&self) -> &'static str;
    fn write(&self, records: &[CanonicalRequest], path: &Path) -> Result<()>;
    fn read(&self, path: &Path) -> Result<Vec<CanonicalRequest>>;
}

/// Where each format lands.
#[derive(Debug, Clone)]
pub struct OutputPaths {
    pub jsonl: PathBuf,
    pub parquet: PathBuf,
    pub csv: PathBuf,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct WriteSummary {
    pub rows: usize,
    pub files: Vec<PathBuf>,
}

/// Write `records` in all three formats. The first failure aborts.
#[instrument(skip(records), fields(rows = records.len()))]
pub fn write_all(records: &[CanonicalRequest], paths: &OutputPaths) -> Result<WriteSummary> {
    let targets: [(&dyn DatasetFormat, &Path); 3] = [
        (&JsonlFormat, paths.jsonl.as_path()),
        (&ParquetFormat, paths.parquet.as_path()),
        (&CsvFormat, paths.csv.as_path()),
    ];

    let mut files = Vec::with_capacity(targets.len());
    for (format, path) in targets {
        let started = Instant::now();
        format.write(records, path)?;
        WriterMetrics::record_written(records.len(), started.elapsed().as_secs_f64());
        info!(format = format.name(), path = %path.display(), rows = records.len(), "Wrote dataset");
        files.push(path.to_path_buf());
    }

    Ok(WriteSummary {
        rows: records.len(),
        files,
    })
}

/// Pick a format from the file extension.
pub fn format_for(path: &Path) -> Result<&'static dyn DatasetFormat> {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "jsonl" | "ndjson" | "json" => Ok(&JsonlFormat),
        "parquet" => Ok(&ParquetFormat),
        "csv" => Ok(&CsvFormat),
        other => Err(PipelineError::Config(format!(
            "unsupported dataset extension '{}' for {}; use .jsonl, .parquet or .csv",
            other,
            path.display()
        ))),
    }
}

/// Read a dataset in whichever format its extension names.
pub fn read_any(path: &Path) -> Result<Vec<CanonicalRequest>> {
    format_for(path)?.read(path)
}

#[cfg(test)]
use crate::domain::{FetchStatus, ImageMeta, KeywordFlag, KeywordFlags, ProvenanceTags};

/// A fully populated record shared by the format tests.
#[cfg(test)]
pub(crate) fn sample_record() -> CanonicalRequest {
    let mut features = KeywordFlags::default();
    features.set(KeywordFlag::TentsPresent, true);
    CanonicalRequest {
        request_id: "101".into(),
        created_at: chrono::DateTime::parse_from_rfc3339("2024-03-01T08:15:00Z")
            .ok()
            .map(|d| d.with_timezone(&chrono::Utc)),
        updated_at: None,
        status: Some("Closed".into()),
        status_notes: None,
        category: Some("Encampments".into()),
        district: Some("MISSION".into()),
        latitude: Some(37.7599),
        longitude: Some(-122.4148),
        text: Some("two tents, \"large\", blocking".into()),
        text_truncated: false,
        desc_len: 28,
        photo_urls: vec!["https://x/a.jpg".into()],
        has_photo: true,
        features,
        responder_goa: false,
        num_people_bin: "2-4".into(),
        size_feet_bin: "25-99".into(),
        images: ImageMeta {
            image_paths: vec![Some("data/images/101/00_a.jpg".into())],
            image_checksums: vec![Some("ab".repeat(32))],
            image_fetch_status: vec![Some(FetchStatus::Ok)],
        },
        provenance: ProvenanceTags {
            tag_tents_present: Some(true),
            tag_size_feet: Some(40.0),
            tag_person_position: Some("sitting".into()),
            ..Default::default()
        },
        keyword_table_version: "test-1".into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extension_dispatch() {
        assert_eq!(format_for(Path::new("a/b.jsonl")).unwrap().name(), "jsonl");
        assert_eq!(format_for(Path::new("b.NDJSON")).unwrap().name(), "jsonl");
        assert_eq!(format_for(Path::new("b.parquet")).unwrap().name(), "parquet");
        assert_eq!(format_for(Path::new("b.csv")).unwrap().name(), "csv");
        assert!(format_for(Path::new("b.xlsx")).is_err());
    }
}
