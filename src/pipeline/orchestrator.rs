//! Stage wiring for the CLI: each subcommand maps onto one method here, and
//! [`Pipeline::run`] chains them in dependency order.

use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::config::PipelineConfig;
use crate::constants::DEFAULT_KEYWORD_TABLE;
use crate::domain::CanonicalRequest;
use crate::error::{PipelineError, Result};
use crate::gateway::{apply_manifest, FetchSummary, HttpFetcher, ImageCache, ImageCacheOptions, ImageFetcher, Manifest};
use crate::pipeline::ingestion::reader::{InputFormat, RecordStream};
use crate::pipeline::processing::audit::{AuditEngine, AuditOutcome};
use crate::pipeline::processing::eval::{write_report, EvalEngine, EvalOptions, EvalReport};
use crate::pipeline::processing::keywords::{KeywordExtractor, KeywordTable};
use crate::pipeline::processing::normalize::{FieldNormalizer, NormalizeOptions, NormalizeOutcome};
use crate::storage::{self, OutputPaths, WriteSummary};

/// What a completed run reports.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub input_format: Option<&'static str>,
    pub records_read: usize,
    pub records_processed: usize,
    pub records_skipped: usize,
    pub skip_samples: Vec<String>,
    pub images: Option<FetchSummary>,
    pub rows_written: Option<usize>,
    pub audit_snapshot: Option<PathBuf>,
    pub drifted_metrics: Option<usize>,
    pub eval_pass: Option<bool>,
}

impl RunSummary {
    fn new() -> Self {
        Self {
            run_id: Uuid::new_v4(),
            input_format: None,
            records_read: 0,
            records_processed: 0,
            records_skipped: 0,
            skip_samples: Vec::new(),
            images: None,
            rows_written: None,
            audit_snapshot: None,
            drifted_metrics: None,
            eval_pass: None,
        }
    }

    fn absorb_normalize(&mut self, format: InputFormat, outcome: &NormalizeOutcome) {
        self.input_format = Some(format.as_str());
        self.records_read = outcome.read;
        self.records_processed = outcome.records.len();
        self.records_skipped = outcome.skipped.len();
        self.skip_samples = outcome.sample_reasons();
    }

    pub fn log(&self) {
        info!(
            run_id = %self.run_id,
            input_format = self.input_format.unwrap_or("-"),
            read = self.records_read,
            processed = self.records_processed,
            skipped = self.records_skipped,
            "Run summary: records"
        );
        for sample in &self.skip_samples {
            info!(run_id = %self.run_id, reason = %sample, "Skipped record sample");
        }
        if let Some(images) = &self.images {
            info!(
                run_id = %self.run_id,
                ok = images.ok,
                failed = images.failed,
                cached = images.cached,
                "Run summary: images"
            );
        }
        if let Some(pass) = self.eval_pass {
            info!(run_id = %self.run_id, overall_pass = pass, "Run summary: eval");
        }
    }
}

/// Load the keyword table at `path`. The default location falls back to the pinned
/// table when the file is absent; any other missing path is an error.
pub fn load_keyword_table(path: &Path) -> Result<KeywordTable> {
    if path.exists() {
        return KeywordTable::load(path);
    }
    if path == Path::new(DEFAULT_KEYWORD_TABLE) {
        warn!(path = %path.display(), "Keyword table not found; using the pinned table");
        return KeywordTable::pinned();
    }
    Err(PipelineError::Config(format!(
        "keyword table '{}' does not exist",
        path.display()
    )))
}

pub struct Pipeline {
    config: PipelineConfig,
    normalizer: FieldNormalizer,
    fetcher: Arc<dyn ImageFetcher>,
}

impl Pipeline {
    pub fn new(config: PipelineConfig) -> Result<Self> {
        config.validate()?;
        let table = load_keyword_table(&config.keyword_table)?;
        info!(version = table.version(), "Loaded keyword table");
        let normalizer = FieldNormalizer::new(KeywordExtractor::new(table), NormalizeOptions::from(&config));
        let fetcher: Arc<dyn ImageFetcher> = Arc::new(HttpFetcher::new(
            &config.images.user_agent,
            config.images.fetch_timeout_secs,
        )?);
        Ok(Self {
            config,
            normalizer,
            fetcher,
        })
    }

    /// Swap the network client, e.g. for an in-process fetcher.
    pub fn with_fetcher(mut self, fetcher: Arc<dyn ImageFetcher>) -> Self {
        self.fetcher = fetcher;
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    fn output_paths(&self) -> OutputPaths {
        OutputPaths {
            jsonl: self.config.jsonl_out.clone(),
            parquet: self.config.parquet_out.clone(),
            csv: self.config.csv_out.clone(),
        }
    }

    /// Read the configured input and normalize it, sorted by request id.
    #[instrument(skip(self), fields(input = %self.config.input.display()))]
    pub fn read_and_normalize(&self) -> Result<(InputFormat, NormalizeOutcome)> {
        let stream = RecordStream::open(&self.config.input)?;
        let format = stream.format();
        let mut outcome = self.normalizer.normalize_stream(stream)?;
        outcome.records.sort_by(|a, b| a.request_id.cmp(&b.request_id));
        info!(
            format = format.as_str(),
            read = outcome.read,
            processed = outcome.records.len(),
            skipped = outcome.skipped.len(),
            "Normalized input"
        );
        Ok((format, outcome))
    }

    /// Normalize, join with the current manifest without fetching, and write all formats.
    pub fn transform(&self) -> Result<RunSummary> {
        let mut summary = RunSummary::new();
        let (format, mut outcome) = self.read_and_normalize()?;
        summary.absorb_normalize(format, &outcome);

        let manifest = Manifest::load(&self.config.images.manifest)?;
        apply_manifest(&mut outcome.records, &manifest);

        let written = storage::write_all(&outcome.records, &self.output_paths())?;
        summary.rows_written = Some(written.rows);
        Ok(summary)
    }

    /// Sync the image cache for `records` and join the result into their metadata.
    pub async fn fetch_images(&self, records: &mut [CanonicalRequest]) -> Result<FetchSummary> {
        let images = &self.config.images;
        let mut manifest = Manifest::load(&images.manifest)?;
        let cache = ImageCache::new(Arc::clone(&self.fetcher), ImageCacheOptions::from(images));
        let fetched = cache.sync(records, &mut manifest).await;
        manifest.save(&images.manifest)?;
        apply_manifest(records, &manifest);
        Ok(fetched)
    }

    /// Standalone image step: read an existing dataset, fetch, and rewrite all formats
    /// with the refreshed image metadata.
    pub async fn fetch_images_for_dataset(&self, dataset: &Path) -> Result<(FetchSummary, WriteSummary)> {
        let mut records = storage::read_any(dataset)?;
        info!(dataset = %dataset.display(), rows = records.len(), "Loaded dataset for image fetch");
        let fetched = self.fetch_images(&mut records).await?;
        let written = storage::write_all(&records, &self.output_paths())?;
        Ok((fetched, written))
    }

    pub fn audit(&self, dataset: &Path, compare: bool) -> Result<AuditOutcome> {
        let records = storage::read_any(dataset)?;
        AuditEngine::new(&self.config.audit.snapshot_dir, self.config.audit.drift_threshold)
            .run(&records, Some(dataset), compare)
    }

    /// Evaluate `dataset` and write the report. A failing report is a normal return.
    pub fn eval(&self, dataset: &Path) -> Result<EvalReport> {
        let records = storage::read_any(dataset)?;
        let report = EvalEngine::new(self.normalizer.extractor(), EvalOptions::from(&self.config))
            .evaluate(&records);
        write_report(&report, &self.config.eval.report)?;
        info!(path = %self.config.eval.report.display(), overall_pass = report.overall_pass, "Wrote eval report");
        Ok(report)
    }

    /// Every stage in order. Audit and eval re-read the written JSONL dataset.
    #[instrument(skip(self))]
    pub async fn run(&self) -> Result<RunSummary> {
        let mut summary = RunSummary::new();
        info!(run_id = %summary.run_id, "Starting pipeline run");

        let (format, mut outcome) = self.read_and_normalize()?;
        summary.absorb_normalize(format, &outcome);

        if self.config.images.enabled {
            summary.images = Some(self.fetch_images(&mut outcome.records).await?);
        } else {
            let manifest = Manifest::load(&self.config.images.manifest)?;
            apply_manifest(&mut outcome.records, &manifest);
        }

        let written = storage::write_all(&outcome.records, &self.output_paths())?;
        summary.rows_written = Some(written.rows);

        let dataset = self.config.jsonl_out.clone();
        let audit = self.audit(&dataset, true)?;
        summary.drifted_metrics = audit.drift.as_ref().map(|d| d.drifted.len());
        summary.audit_snapshot = Some(audit.snapshot_path);

        let report = self.eval(&dataset)?;
        summary.eval_pass = Some(report.overall_pass);

        summary.log();
        Ok(summary)
    }
}
