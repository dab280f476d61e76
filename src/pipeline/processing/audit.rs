//! Distributional snapshots of a written dataset and drift between consecutive runs.
//!
//! Snapshots are append-only: each lands in the snapshot directory under a new
//! `audit_<UTC timestamp>.json` name and is never rewritten.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::domain::{CanonicalRequest, FetchStatus, KeywordFlag};
use crate::error::Result;
use crate::observability::metrics::AuditMetrics;
use crate::pipeline::processing::bins::{PeopleBin, SizeBin};
use crate::storage::atomic::write_atomic_new;

const SNAPSHOT_PREFIX: &str = "audit_";
const SNAPSHOT_SUFFIX: &str = ".json";
const UNKNOWN: &str = "unknown";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NumericSummary {
    pub count: u64,
    pub mean: Option<f64>,
    pub min: Option<f64>,
    pub max: Option<f64>,
}

impl NumericSummary {
    fn from_values(values: impl Iterator<Item = f64>) -> Self {
        let mut summary = NumericSummary::default();
        let mut sum = 0.0;
        for v in values.filter(|v| v.is_finite()) {
            summary.count += 1;
            sum += v;
            summary.min = Some(summary.min.map_or(v, |m| m.min(v)));
            summary.max = Some(summary.max.map_or(v, |m| m.max(v)));
        }
        if summary.count > 0 {
            summary.mean = Some(sum / summary.count as f64);
        }
        summary
    }
}

/// Aggregate counts over one dataset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditSnapshot {
    pub snapshot_id: Uuid,
    pub generated_at: DateTime<Utc>,
    /// Dataset the snapshot was computed from
    pub source: Option<String>,
    pub total_rows: u64,
    pub has_photo: u64,
    pub photo_coverage: f64,
    pub nonempty_text: u64,
    pub text_truncated: u64,
    pub responder_goa: u64,
    /// Rows whose lying tag is true while the position tag never mentions lying
    pub lying_position_mismatch: u64,
    pub districts: BTreeMap<String, u64>,
    pub keywords: BTreeMap<String, u64>,
    pub num_people_bins: BTreeMap<String, u64>,
    pub size_feet_bins: BTreeMap<String, u64>,
    /// Upstream tag name → value label → count; absent tags count as "null"
    pub tag_distributions: BTreeMap<String, BTreeMap<String, u64>>,
    pub tag_numeric: BTreeMap<String, NumericSummary>,
    /// "ok" / "failed" / "missing" over every photo URL
    pub image_fetch_status: BTreeMap<String, u64>,
}

fn bool_label(v: Option<bool>) -> String {
    match v {
        Some(true) => "true".into(),
        Some(false) => "false".into(),
        None => "null".into(),
    }
}

fn bump(map: &mut BTreeMap<String, u64>, key: impl Into<String>) {
    *map.entry(key.into()).or_insert(0) += 1;
}

impl AuditSnapshot {
    /// Pure aggregation over `records`.
    pub fn compute(records: &[CanonicalRequest], source: Option<&Path>, at: DateTime<Utc>) -> Self {
        let mut districts = BTreeMap::new();
        let mut keywords: BTreeMap<String, u64> =
            KeywordFlag::ALL.iter().map(|f| (f.name().to_string(), 0)).collect();
        let mut num_people_bins: BTreeMap<String, u64> =
            PeopleBin::ALL.iter().map(|b| (b.label().to_string(), 0)).collect();
        let mut size_feet_bins: BTreeMap<String, u64> =
            SizeBin::ALL.iter().map(|b| (b.label().to_string(), 0)).collect();
        let mut tag_distributions: BTreeMap<String, BTreeMap<String, u64>> = BTreeMap::new();
        let mut image_fetch_status: BTreeMap<String, u64> = ["ok", "failed", "missing"]
            .iter()
            .map(|s| (s.to_string(), 0))
            .collect();

        let (mut has_photo, mut nonempty_text, mut text_truncated) = (0u64, 0u64, 0u64);
        let (mut responder_goa, mut lying_position_mismatch) = (0u64, 0u64);

        for r in records {
            has_photo += u64::from(r.has_photo);
            nonempty_text += u64::from(r.text.as_deref().map_or(false, |t| !t.is_empty()));
            text_truncated += u64::from(r.text_truncated);
            responder_goa += u64::from(r.responder_goa);

            bump(&mut districts, r.district.as_deref().unwrap_or(UNKNOWN));
            for flag in r.features.active() {
                bump(&mut keywords, flag.name());
            }
            bump(&mut num_people_bins, r.num_people_bin.as_str());
            bump(&mut size_feet_bins, r.size_feet_bin.as_str());

            let p = &r.provenance;
            let mut tag = |name: &str, label: String| {
                bump(tag_distributions.entry(name.to_string()).or_default(), label);
            };
            tag("tag_safety_issue", bool_label(p.tag_safety_issue));
            tag("tag_drugs", bool_label(p.tag_drugs));
            tag("tag_lying_face_down", bool_label(p.tag_lying_face_down));
            tag("tag_tents_present", bool_label(p.tag_tents_present));
            tag(
                "tag_person_position",
                p.tag_person_position.clone().unwrap_or_else(|| "null".into()),
            );

            let position_says_lying = p
                .tag_person_position
                .as_deref()
                .map_or(false, |pos| pos.contains("lying"));
            if p.tag_lying_face_down == Some(true) && !position_says_lying {
                lying_position_mismatch += 1;
            }

            for idx in 0..r.photo_urls.len() {
                let status = r.images.image_fetch_status.get(idx).copied().flatten();
                let key = match status {
                    Some(FetchStatus::Ok) => "ok",
                    Some(FetchStatus::Failed) => "failed",
                    None => "missing",
                };
                bump(&mut image_fetch_status, key);
            }
        }

        let mut tag_numeric = BTreeMap::new();
        tag_numeric.insert(
            "tag_size_feet".to_string(),
            NumericSummary::from_values(records.iter().filter_map(|r| r.provenance.tag_size_feet)),
        );
        tag_numeric.insert(
            "tag_num_people".to_string(),
            NumericSummary::from_values(records.iter().filter_map(|r| r.provenance.tag_num_people)),
        );

        let total_rows = records.len() as u64;
        let photo_coverage = if total_rows == 0 {
            0.0
        } else {
            has_photo as f64 / total_rows as f64
        };

        Self {
            snapshot_id: Uuid::new_v4(),
            generated_at: at,
            source: source.map(|p| p.display().to_string()),
            total_rows,
            has_photo,
            photo_coverage,
            nonempty_text,
            text_truncated,
            responder_goa,
            lying_position_mismatch,
            districts,
            keywords,
            num_people_bins,
            size_feet_bins,
            tag_distributions,
            tag_numeric,
            image_fetch_status,
        }
    }

    /// Every metric as a named scalar, e.g. `district.MISSION` or `keyword.fire`.
    pub fn flatten(&self) -> BTreeMap<String, f64> {
        let mut out = BTreeMap::new();
        out.insert("total_rows".to_string(), self.total_rows as f64);
        out.insert("has_photo".to_string(), self.has_photo as f64);
        out.insert("photo_coverage".to_string(), self.photo_coverage);
        out.insert("nonempty_text".to_string(), self.nonempty_text as f64);
        out.insert("text_truncated".to_string(), self.text_truncated as f64);
        out.insert("responder_goa".to_string(), self.responder_goa as f64);
        out.insert(
            "lying_position_mismatch".to_string(),
            self.lying_position_mismatch as f64,
        );

        let groups: [(&str, &BTreeMap<String, u64>); 5] = [
            ("district", &self.districts),
            ("keyword", &self.keywords),
            ("num_people_bin", &self.num_people_bins),
            ("size_feet_bin", &self.size_feet_bins),
            ("image_fetch_status", &self.image_fetch_status),
        ];
        for (prefix, counts) in groups {
            for (key, count) in counts {
                out.insert(format!("{}.{}", prefix, key), *count as f64);
            }
        }
        for (tag, counts) in &self.tag_distributions {
            for (value, count) in counts {
                out.insert(format!("{}.{}", tag, value), *count as f64);
            }
        }
        for (tag, summary) in &self.tag_numeric {
            out.insert(format!("{}.count", tag), summary.count as f64);
            let stats = [("mean", summary.mean), ("min", summary.min), ("max", summary.max)];
            for (stat, value) in stats {
                if let Some(v) = value {
                    out.insert(format!("{}.{}", tag, stat), v);
                }
            }
        }
        out
    }

    pub fn file_name(&self) -> String {
        format!(
            "{}{}{}",
            SNAPSHOT_PREFIX,
            self.generated_at.format("%Y%m%dT%H%M%S%.6fZ"),
            SNAPSHOT_SUFFIX
        )
    }

    pub fn load(path: &Path) -> Result<Self> {
        Ok(serde_json::from_str(&fs::read_to_string(path)?)?)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DriftEntry {
    pub metric: String,
    pub previous: f64,
    pub current: f64,
    pub relative_delta: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DriftReport {
    pub previous_snapshot: PathBuf,
    pub threshold: f64,
    pub compared_metrics: usize,
    pub drifted: Vec<DriftEntry>,
}

/// `|Δ| / max(|previous|, 1)`
pub fn relative_delta(previous: f64, current: f64) -> f64 {
    (current - previous).abs() / previous.abs().max(1.0)
}

/// Metrics whose relative delta exceeds `threshold`, sorted by name. A metric present
/// on only one side compares against 0.
pub fn diff(previous: &AuditSnapshot, current: &AuditSnapshot, threshold: f64) -> (usize, Vec<DriftEntry>) {
    let prev = previous.flatten();
    let cur = current.flatten();
    let mut names: Vec<&String> = prev.keys().chain(cur.keys()).collect();
    names.sort();
    names.dedup();

    let drifted = names
        .iter()
        .filter_map(|name| {
            let p = prev.get(*name).copied().unwrap_or(0.0);
            let c = cur.get(*name).copied().unwrap_or(0.0);
            let rel = relative_delta(p, c);
            (rel > threshold).then(|| DriftEntry {
                metric: (*name).clone(),
                previous: p,
                current: c,
                relative_delta: rel,
            })
        })
        .collect();
    (names.len(), drifted)
}

/// The lexicographically latest snapshot file in `dir`, if any.
pub fn latest_snapshot(dir: &Path) -> Result<Option<PathBuf>> {
    if !dir.exists() {
        return Ok(None);
    }
    let mut latest: Option<PathBuf> = None;
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        let is_snapshot = path
            .file_name()
            .and_then(|n| n.to_str())
            .map_or(false, |n| n.starts_with(SNAPSHOT_PREFIX) && n.ends_with(SNAPSHOT_SUFFIX));
        if is_snapshot && latest.as_ref().map_or(true, |l| path > *l) {
            latest = Some(path);
        }
    }
    Ok(latest)
}

/// Write `snapshot` into `dir`; an existing file with the same name is never replaced.
pub fn write_snapshot(dir: &Path, snapshot: &AuditSnapshot) -> Result<PathBuf> {
    let path = dir.join(snapshot.file_name());
    write_atomic_new(&path, |file| {
        let mut out = BufWriter::new(file);
        serde_json::to_writer_pretty(&mut out, snapshot)?;
        out.write_all(b"\n")?;
        out.flush()?;
        Ok(())
    })?;
    Ok(path)
}

#[derive(Debug, Clone, Serialize)]
pub struct AuditOutcome {
    pub snapshot_path: PathBuf,
    pub snapshot: AuditSnapshot,
    pub drift: Option<DriftReport>,
}

pub struct AuditEngine {
    snapshot_dir: PathBuf,
    drift_threshold: f64,
}

impl AuditEngine {
    pub fn new(snapshot_dir: impl Into<PathBuf>, drift_threshold: f64) -> Self {
        Self {
            snapshot_dir: snapshot_dir.into(),
            drift_threshold,
        }
    }

    /// Snapshot `records`, persist it, and diff against the prior snapshot when
    /// `compare` is set and one exists.
    #[instrument(skip(self, records), fields(rows = records.len()))]
    pub fn run(
        &self,
        records: &[CanonicalRequest],
        source: Option<&Path>,
        compare: bool,
    ) -> Result<AuditOutcome> {
        let previous = if compare {
            latest_snapshot(&self.snapshot_dir)?
        } else {
            None
        };

        let snapshot = AuditSnapshot::compute(records, source, Utc::now());
        let snapshot_path = write_snapshot(&self.snapshot_dir, &snapshot)?;
        info!(path = %snapshot_path.display(), rows = snapshot.total_rows, "Wrote audit snapshot");

        let drift = match previous {
            Some(prev_path) => {
                let prev = AuditSnapshot::load(&prev_path)?;
                let (compared_metrics, drifted) = diff(&prev, &snapshot, self.drift_threshold);
                for d in &drifted {
                    warn!(
                        metric = %d.metric,
                        previous = d.previous,
                        current = d.current,
                        relative_delta = d.relative_delta,
                        "Audit drift"
                    );
                }
                Some(DriftReport {
                    previous_snapshot: prev_path,
                    threshold: self.drift_threshold,
                    compared_metrics,
                    drifted,
                })
            }
            None => None,
        };

        AuditMetrics::record_snapshot(
            snapshot.photo_coverage,
            drift.as_ref().map_or(0, |d| d.drifted.len()),
        );
        Ok(AuditOutcome {
            snapshot_path,
            snapshot,
            drift,
        })
    }
}
