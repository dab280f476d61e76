//! Metric catalog for the pipeline phases.
//!
//! Everything goes through the `metrics` facade. This binary installs no recorder, so the
//! calls are no-ops unless an embedding process installs one.

/// Consistent naming: sf311_{phase}_{name}[_total]
macro_rules! phase_metric {
    (counter, $phase:literal, $name:literal) => {
        concat!("sf311_", $phase, "_", $name, "_total")
    };
    (histogram, $phase:literal, $name:literal) => {
        concat!("sf311_", $phase, "_", $name)
    };
    (gauge, $phase:literal, $name:literal) => {
        concat!("sf311_", $phase, "_", $name)
    };
}

pub struct NormalizeMetrics;

impl NormalizeMetrics {
    pub fn record_processed() {
        ::metrics::counter!(phase_metric!(counter, "normalize", "records_processed")).increment(1);
    }

    pub fn record_skipped() {
        ::metrics::counter!(phase_metric!(counter, "normalize", "records_skipped")).increment(1);
    }
}

pub struct ImageCacheMetrics;

impl ImageCacheMetrics {
    pub fn record_fetch_success(bytes: usize, duration_secs: f64) {
        ::metrics::counter!(phase_metric!(counter, "images", "fetch_success")).increment(1);
        ::metrics::histogram!(phase_metric!(histogram, "images", "fetch_bytes")).record(bytes as f64);
        ::metrics::histogram!(phase_metric!(histogram, "images", "fetch_duration_seconds"))
            .record(duration_secs);
    }

    pub fn record_fetch_failure() {
        ::metrics::counter!(phase_metric!(counter, "images", "fetch_failure")).increment(1);
    }

    pub fn record_cache_hit() {
        ::metrics::counter!(phase_metric!(counter, "images", "cache_hits")).increment(1);
    }
}

pub struct WriterMetrics;

impl WriterMetrics {
    pub fn record_written(rows: usize, duration_secs: f64) {
        ::metrics::counter!(phase_metric!(counter, "writer", "rows_written")).increment(rows as u64);
        ::metrics::histogram!(phase_metric!(histogram, "writer", "write_duration_seconds"))
            .record(duration_secs);
    }
}

pub struct AuditMetrics;

impl AuditMetrics {
    pub fn record_snapshot(photo_coverage: f64, drifted_metrics: usize) {
        ::metrics::gauge!(phase_metric!(gauge, "audit", "photo_coverage")).set(photo_coverage);
        ::metrics::gauge!(phase_metric!(gauge, "audit", "drifted_metrics")).set(drifted_metrics as f64);
    }
}

pub struct EvalMetrics;

impl EvalMetrics {
    pub fn record_report(failed_assertions: usize) {
        ::metrics::gauge!(phase_metric!(gauge, "eval", "failed_assertions"))
            .set(failed_assertions as f64);
    }
}

/// Attach descriptions to every metric above.
pub fn describe_all() {
    use ::metrics::{describe_counter, describe_gauge, describe_histogram};

    describe_counter!(
        phase_metric!(counter, "normalize", "records_processed"),
        "Raw records turned into canonical requests"
    );
    describe_counter!(
        phase_metric!(counter, "normalize", "records_skipped"),
        "Raw records rejected during normalization"
    );
    describe_counter!(
        phase_metric!(counter, "images", "fetch_success"),
        "Image downloads that produced a verified file"
    );
    describe_counter!(
        phase_metric!(counter, "images", "fetch_failure"),
        "Image downloads that failed and will be retried"
    );
    describe_counter!(
        phase_metric!(counter, "images", "cache_hits"),
        "Image URLs served from a checksum-verified cache entry"
    );
    describe_histogram!(
        phase_metric!(histogram, "images", "fetch_bytes"),
        "Size of downloaded images"
    );
    describe_histogram!(
        phase_metric!(histogram, "images", "fetch_duration_seconds"),
        "Wall time per image download"
    );
    describe_counter!(
        phase_metric!(counter, "writer", "rows_written"),
        "Rows written across all output formats"
    );
    describe_histogram!(
        phase_metric!(histogram, "writer", "write_duration_seconds"),
        "Wall time per output format"
    );
    describe_gauge!(
        phase_metric!(gauge, "audit", "photo_coverage"),
        "Share of rows with at least one photo in the latest snapshot"
    );
    describe_gauge!(
        phase_metric!(gauge, "audit", "drifted_metrics"),
        "Metrics flagged as drift against the previous snapshot"
    );
    describe_gauge!(
        phase_metric!(gauge, "eval", "failed_assertions"),
        "Failing assertions in the latest eval report"
    );
}
