use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::io::{BufWriter, Write};
use std::path::Path;
use tracing::{info, instrument, warn};

use crate::config::PipelineConfig;
use crate::domain::{CanonicalRequest, FetchStatus};
use crate::error::Result;
use crate::observability::metrics::EvalMetrics;
use crate::pipeline::processing::bins::{PeopleBin, SizeBin};
use crate::pipeline::processing::keywords::KeywordExtractor;
use crate::storage::atomic::write_atomic;

/// Outcome of a single named assertion
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssertionResult {
    /// Stable assertion name
    pub name: String,
    pub passed: bool,
    /// Rows the assertion applied to
    pub checked: usize,
    /// Total failing rows, even when `failing_ids` is capped
    pub failing_count: usize,
    /// First failing request ids, in dataset order
    pub failing_ids: Vec<String>,
    /// Aggregate statistic for ratio assertions
    pub statistic: Option<f64>,
    /// Human-readable diagnostic
    pub detail: String,
}

/// Ordered assertion results plus the overall verdict
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvalReport {
    pub generated_at: DateTime<Utc>,
    pub rows: usize,
    /// Keyword table the flag recomputation used
    pub keyword_table_version: String,
    pub results: Vec<AssertionResult>,
    pub passed: usize,
    pub failed: usize,
    pub overall_pass: bool,
}

impl EvalReport {
    pub fn result(&self, name: &str) -> Option<&AssertionResult> {
        self.results.iter().find(|r| r.name == name)
    }
}

/// Thresholds and bounds for the assertions
#[derive(Debug, Clone)]
pub struct EvalOptions {
    pub min_photo_coverage: f64,
    pub min_keyword_agreement: f64,
    /// Cap on ids listed per failing assertion
    pub max_failing_ids: usize,
    pub size_feet_max: f64,
    pub num_people_max: f64,
}

impl From<&PipelineConfig> for EvalOptions {
    fn from(cfg: &PipelineConfig) -> Self {
        Self {
            min_photo_coverage: cfg.eval.min_photo_coverage,
            min_keyword_agreement: cfg.eval.min_keyword_agreement,
            max_failing_ids: cfg.eval.max_failing_ids,
            size_feet_max: cfg.size_feet_max,
            num_people_max: cfg.num_people_max,
        }
    }
}

/// Names in evaluation order.
pub const ASSERTIONS: [&str; 10] = [
    "request_ids_unique",
    "numeric_bins_in_enumerated_set",
    "photo_coverage_at_least",
    "keyword_upstream_agreement_at_least",
    "keyword_flags_match_text",
    "has_photo_matches_urls",
    "image_metadata_aligned",
    "lying_position_consistency",
    "tents_size_consistency",
    "size_and_people_tag_bounds",
];

/// Runs the fixed assertion list. Failing assertions are recorded in the report, never
/// raised.
pub struct EvalEngine<'a> {
    extractor: &'a KeywordExtractor,
    options: EvalOptions,
}

impl<'a> EvalEngine<'a> {
    pub fn new(extractor: &'a KeywordExtractor, options: EvalOptions) -> Self {
        Self { extractor, options }
    }

    /// Collect failing ids for a per-row predicate.
    fn per_row<F>(&self, name: &str, records: &[CanonicalRequest], mut applies: F) -> AssertionResult
    where
        F: FnMut(&CanonicalRequest) -> Option<bool>,
    {
        let mut checked = 0;
        let mut failing = Vec::new();
        for r in records {
            if let Some(ok) = applies(r) {
                checked += 1;
                if !ok {
                    failing.push(r.request_id.clone());
                }
            }
        }
        let failing_count = failing.len();
        failing.truncate(self.options.max_failing_ids);
        AssertionResult {
            name: name.to_string(),
            passed: failing_count == 0,
            checked,
            failing_count,
            failing_ids: failing,
            statistic: None,
            detail: format!("{} of {} applicable rows failed", failing_count, checked),
        }
    }

    fn request_ids_unique(&self, records: &[CanonicalRequest]) -> AssertionResult {
        let mut seen = HashSet::new();
        self.per_row("request_ids_unique", records, |r| {
            Some(seen.insert(r.request_id.clone()))
        })
    }

    fn numeric_bins_in_enumerated_set(&self, records: &[CanonicalRequest]) -> AssertionResult {
        self.per_row("numeric_bins_in_enumerated_set", records, |r| {
            Some(
                PeopleBin::from_label(&r.num_people_bin).is_some()
                    && SizeBin::from_label(&r.size_feet_bin).is_some(),
            )
        })
    }

    fn photo_coverage_at_least(&self, records: &[CanonicalRequest]) -> AssertionResult {
        let with_photo = records.iter().filter(|r| r.has_photo).count();
        let coverage = if records.is_empty() {
            0.0
        } else {
            with_photo as f64 / records.len() as f64
        };
        let passed = coverage >= self.options.min_photo_coverage;
        AssertionResult {
            name: "photo_coverage_at_least".into(),
            passed,
            checked: records.len(),
            failing_count: usize::from(!passed),
            failing_ids: Vec::new(),
            statistic: Some(coverage),
            detail: format!(
                "photo coverage {:.4} ({} of {}), minimum {:.4}",
                coverage,
                with_photo,
                records.len(),
                self.options.min_photo_coverage
            ),
        }
    }

    fn keyword_upstream_agreement_at_least(&self, records: &[CanonicalRequest]) -> AssertionResult {
        let (mut compared, mut agreed) = (0usize, 0usize);
        let mut disagreeing = Vec::new();
        for r in records {
            let pairs = [
                (r.features.tents_present, r.provenance.tag_tents_present),
                (r.features.face_down, r.provenance.tag_lying_face_down),
            ];
            let mut row_disagrees = false;
            for (computed, upstream) in pairs {
                if let Some(upstream) = upstream {
                    compared += 1;
                    if computed == upstream {
                        agreed += 1;
                    } else {
                        row_disagrees = true;
                    }
                }
            }
            if row_disagrees {
                disagreeing.push(r.request_id.clone());
            }
        }

        let min = self.options.min_keyword_agreement;
        let (agreement, passed, detail) = if compared == 0 {
            (None, true, "no rows carry a comparable upstream tag".to_string())
        } else {
            let rate = agreed as f64 / compared as f64;
            (
                Some(rate),
                rate >= min,
                format!("{} of {} tag pairs agree ({:.4}), minimum {:.4}", agreed, compared, rate, min),
            )
        };
        let failing_count = disagreeing.len();
        disagreeing.truncate(self.options.max_failing_ids);
        AssertionResult {
            name: "keyword_upstream_agreement_at_least".into(),
            passed,
            checked: compared,
            failing_count,
            failing_ids: disagreeing,
            statistic: agreement,
            detail,
        }
    }

    fn keyword_flags_match_text(&self, records: &[CanonicalRequest]) -> AssertionResult {
        let version = self.extractor.table_version();
        self.per_row("keyword_flags_match_text", records, |r| {
            // stored text is a prefix of what was scanned once truncated
            if r.text_truncated {
                return None;
            }
            if r.keyword_table_version != version {
                return Some(false);
            }
            let recomputed = self.extractor.extract(r.text.as_deref().unwrap_or(""));
            Some(recomputed == r.features)
        })
    }

    fn has_photo_matches_urls(&self, records: &[CanonicalRequest]) -> AssertionResult {
        self.per_row("has_photo_matches_urls", records, |r| {
            Some(r.has_photo == !r.photo_urls.is_empty())
        })
    }

    fn image_metadata_aligned(&self, records: &[CanonicalRequest]) -> AssertionResult {
        self.per_row("image_metadata_aligned", records, |r| {
            let n = r.photo_urls.len();
            let m = &r.images;
            let aligned =
                m.image_paths.len() == n && m.image_checksums.len() == n && m.image_fetch_status.len() == n;
            let ok_have_checksums = m
                .image_fetch_status
                .iter()
                .zip(&m.image_checksums)
                .all(|(status, checksum)| *status != Some(FetchStatus::Ok) || checksum.is_some());
            Some(aligned && ok_have_checksums)
        })
    }

    fn lying_position_consistency(&self, records: &[CanonicalRequest]) -> AssertionResult {
        self.per_row("lying_position_consistency", records, |r| {
            let pos = r.provenance.tag_person_position.as_deref()?;
            if !pos.contains("lying") {
                return None;
            }
            Some(r.provenance.tag_lying_face_down != Some(false))
        })
    }

    fn tents_size_consistency(&self, records: &[CanonicalRequest]) -> AssertionResult {
        self.per_row("tents_size_consistency", records, |r| {
            if r.provenance.tag_tents_present != Some(true) {
                return None;
            }
            r.provenance.tag_size_feet.map(|size| size > 0.0)
        })
    }

    fn size_and_people_tag_bounds(&self, records: &[CanonicalRequest]) -> AssertionResult {
        let within = |v: Option<f64>, max: f64| v.map_or(true, |v| (0.0..=max).contains(&v));
        self.per_row("size_and_people_tag_bounds", records, |r| {
            let p = &r.provenance;
            if p.tag_size_feet.is_none() && p.tag_num_people.is_none() {
                return None;
            }
            Some(
                within(p.tag_size_feet, self.options.size_feet_max)
                    && within(p.tag_num_people, self.options.num_people_max),
            )
        })
    }

    /// Run every assertion in order.
    #[instrument(skip_all, fields(rows = records.len()))]
    pub fn evaluate(&self, records: &[CanonicalRequest]) -> EvalReport {
        let results = vec![
            self.request_ids_unique(records),
            self.numeric_bins_in_enumerated_set(records),
            self.photo_coverage_at_least(records),
            self.keyword_upstream_agreement_at_least(records),
            self.keyword_flags_match_text(records),
            self.has_photo_matches_urls(records),
            self.image_metadata_aligned(records),
            self.lying_position_consistency(records),
            self.tents_size_consistency(records),
            self.size_and_people_tag_bounds(records),
        ];

        for r in results.iter().filter(|r| !r.passed) {
            warn!(assertion = %r.name, failing = r.failing_count, detail = %r.detail, "Eval assertion failed");
        }
        let failed = results.iter().filter(|r| !r.passed).count();
        EvalMetrics::record_report(failed);
        info!(passed = results.len() - failed, failed, "Eval complete");

        EvalReport {
            generated_at: Utc::now(),
            rows: records.len(),
            keyword_table_version: self.extractor.table_version().to_string(),
            passed: results.len() - failed,
            failed,
            overall_pass: failed == 0,
            results,
        }
    }
}

/// Pretty-printed JSON, replaced atomically.
pub fn write_report(report: &EvalReport, path: &Path) -> Result<()> {
    write_atomic(path, |file| {
        let mut out = BufWriter::new(file);
        serde_json::to_writer_pretty(&mut out, report)?;
        out.write_all(b"\n")?;
        out.flush()?;
        Ok(())
    })
}
