//! The URL-keyed record of every image the cache has tried to fetch.
//!
//! Stored as NDJSON sorted by URL and rewritten whole at the end of each run.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io::{BufWriter, Write};
use std::path::Path;
use tracing::{debug, warn};

use crate::domain::FetchStatus;
use crate::error::{PipelineError, Result};
use crate::storage::atomic::write_atomic;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub url: String,
    /// Request that owns the cached file
    pub request_id: String,
    pub local_path: Option<String>,
    pub sha256: Option<String>,
    pub status: FetchStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bytes: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub fetched_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Manifest {
    entries: BTreeMap<String, ManifestEntry>,
}

impl Manifest {
    /// Load from `path`; a missing file is an empty manifest.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            debug!(path = %path.display(), "No manifest yet; starting empty");
            return Ok(Self::default());
        }
        let text = fs::read_to_string(path)?;
        let mut entries = BTreeMap::new();
        for (idx, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let entry: ManifestEntry = serde_json::from_str(line).map_err(|e| {
                PipelineError::Format(format!("{} line {}: {}", path.display(), idx + 1, e))
            })?;
            if entries.insert(entry.url.clone(), entry).is_some() {
                warn!(path = %path.display(), line = idx + 1, "Duplicate manifest URL; later line wins");
            }
        }
        Ok(Self { entries })
    }

    /// Write every entry, one per line, sorted by URL.
    pub fn save(&self, path: &Path) -> Result<()> {
        write_atomic(path, |file| {
            let mut out = BufWriter::new(file);
            for entry in self.entries.values() {
                serde_json::to_writer(&mut out, entry)?;
                out.write_all(b"\n")?;
            }
            out.flush()?;
            Ok(())
        })
    }

    pub fn get(&self, url: &str) -> Option<&ManifestEntry> {
        self.entries.get(url)
    }

    pub fn insert(&mut self, entry: ManifestEntry) {
        self.entries.insert(entry.url.clone(), entry);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> impl Iterator<Item = &ManifestEntry> {
        self.entries.values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(url: &str) -> ManifestEntry {
        ManifestEntry {
            url: url.to_string(),
            request_id: "1".into(),
            local_path: Some(format!("img/1/00_{}", url.rsplit('/').next().unwrap())),
            sha256: Some("00".repeat(32)),
            status: FetchStatus::Ok,
            bytes: Some(3),
            error: None,
            fetched_at: DateTime::parse_from_rfc3339("2024-01-01T00:00:00Z")
                .unwrap()
                .with_timezone(&Utc),
        }
    }

    #[test]
    fn saves_sorted_and_reloads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("manifest.jsonl");
        let mut manifest = Manifest::default();
        manifest.insert(entry("https://b/z.jpg"));
        manifest.insert(entry("https://a/y.jpg"));
        manifest.save(&path).unwrap();

        let text = fs::read_to_string(&path).unwrap();
        let first = text.lines().next().unwrap();
        assert!(first.contains("https://a/y.jpg"));
        assert_eq!(Manifest::load(&path).unwrap(), manifest);
    }

    #[test]
    fn missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        assert!(Manifest::load(&dir.path().join("nope.jsonl")).unwrap().is_empty());
    }
}
