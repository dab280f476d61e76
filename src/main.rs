use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{error, info};

use sf311_pipeline::constants::DEFAULT_LOG_DIR;
use sf311_pipeline::logging;
use sf311_pipeline::observability;
use sf311_pipeline::pipeline::processing::eval::EvalReport;
use sf311_pipeline::pipeline::Pipeline;
use sf311_pipeline::PipelineConfig;

/// Exit status for `--strict` when any eval assertion fails.
const EVAL_FAILED_EXIT: u8 = 2;

#[derive(Parser)]
#[command(name = "sf311_pipeline")]
#[command(about = "SF311 homelessness complaint ETL, image cache, audit and eval")]
#[command(version = "0.1.0")]
struct Cli {
    /// Config file (defaults to $SF311_CONFIG, then sf311.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(flatten)]
    overrides: Overrides,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Normalize the raw export and write JSONL, Parquet and CSV
    Transform,
    /// Fetch photos referenced by an existing dataset and refresh its image metadata
    FetchImages {
        /// Dataset to read URLs from (defaults to the configured JSONL output)
        #[arg(long)]
        dataset: Option<PathBuf>,
    },
    /// Snapshot dataset statistics and diff against the previous snapshot
    Audit {
        #[arg(long)]
        dataset: Option<PathBuf>,
        /// Write the snapshot without comparing
        #[arg(long)]
        no_compare: bool,
    },
    /// Run the assertion suite and write the report
    Eval {
        #[arg(long)]
        dataset: Option<PathBuf>,
        /// Exit with status 2 when any assertion fails
        #[arg(long)]
        strict: bool,
    },
    /// Transform, fetch images, write, audit and eval in one go
    Run {
        /// Exit with status 2 when any assertion fails
        #[arg(long)]
        strict: bool,
    },
}

/// Command-line overrides for every config option.
#[derive(Args, Default)]
struct Overrides {
    #[arg(long, global = true)]
    input: Option<PathBuf>,
    #[arg(long, global = true)]
    jsonl_out: Option<PathBuf>,
    #[arg(long, global = true)]
    parquet_out: Option<PathBuf>,
    #[arg(long, global = true)]
    csv_out: Option<PathBuf>,
    #[arg(long, global = true)]
    max_text_len: Option<usize>,
    #[arg(long, global = true)]
    size_feet_max: Option<f64>,
    #[arg(long, global = true)]
    num_people_max: Option<f64>,
    #[arg(long, global = true)]
    keyword_table: Option<PathBuf>,
    #[arg(long, global = true)]
    image_dir: Option<PathBuf>,
    #[arg(long, global = true)]
    manifest: Option<PathBuf>,
    #[arg(long, global = true)]
    max_workers: Option<usize>,
    #[arg(long, global = true)]
    fetch_timeout_secs: Option<u64>,
    #[arg(long, global = true)]
    user_agent: Option<String>,
    /// Re-download every image even when the cache verifies
    #[arg(long, global = true)]
    rewrite_images: bool,
    /// Skip the image step of `run`
    #[arg(long, global = true)]
    no_fetch_images: bool,
    #[arg(long, global = true)]
    snapshot_dir: Option<PathBuf>,
    #[arg(long, global = true)]
    drift_threshold: Option<f64>,
    #[arg(long, global = true)]
    eval_report: Option<PathBuf>,
    #[arg(long, global = true)]
    min_photo_coverage: Option<f64>,
    #[arg(long, global = true)]
    min_keyword_agreement: Option<f64>,
    #[arg(long, global = true)]
    max_failing_ids: Option<usize>,
}

impl Overrides {
    fn apply(self, cfg: &mut PipelineConfig) {
        fn set<T>(slot: &mut T, value: Option<T>) {
            if let Some(v) = value {
                *slot = v;
            }
        }
        set(&mut cfg.input, self.input);
        set(&mut cfg.jsonl_out, self.jsonl_out);
        set(&mut cfg.parquet_out, self.parquet_out);
        set(&mut cfg.csv_out, self.csv_out);
        set(&mut cfg.max_text_len, self.max_text_len);
        set(&mut cfg.size_feet_max, self.size_feet_max);
        set(&mut cfg.num_people_max, self.num_people_max);
        set(&mut cfg.keyword_table, self.keyword_table);
        set(&mut cfg.images.image_dir, self.image_dir);
        set(&mut cfg.images.manifest, self.manifest);
        set(&mut cfg.images.max_workers, self.max_workers);
        set(&mut cfg.images.fetch_timeout_secs, self.fetch_timeout_secs);
        set(&mut cfg.images.user_agent, self.user_agent);
        set(&mut cfg.audit.snapshot_dir, self.snapshot_dir);
        set(&mut cfg.audit.drift_threshold, self.drift_threshold);
        set(&mut cfg.eval.report, self.eval_report);
        set(&mut cfg.eval.min_photo_coverage, self.min_photo_coverage);
        set(&mut cfg.eval.min_keyword_agreement, self.min_keyword_agreement);
        set(&mut cfg.eval.max_failing_ids, self.max_failing_ids);
        if self.rewrite_images {
            cfg.images.rewrite = true;
        }
        if self.no_fetch_images {
            cfg.images.enabled = false;
        }
    }
}

fn print_eval(report: &EvalReport) {
    println!("\n🧪 Eval ({} rows):", report.rows);
    for r in &report.results {
        let mark = if r.passed { "✅" } else { "❌" };
        println!("   {} {:<38} {}", mark, r.name, r.detail);
        if !r.failing_ids.is_empty() {
            println!("      failing ids: {}", r.failing_ids.join(", "));
        }
    }
    println!(
        "   Overall: {} ({} passed, {} failed)",
        if report.overall_pass { "PASS" } else { "FAIL" },
        report.passed,
        report.failed
    );
}

fn strict_status(strict: bool, pass: bool) -> u8 {
    if strict && !pass {
        EVAL_FAILED_EXIT
    } else {
        0
    }
}

fn strict_exit(strict: bool, pass: bool) -> ExitCode {
    ExitCode::from(strict_status(strict, pass))
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    dotenv::dotenv().ok();
    let _log_guard = logging::init_logging(DEFAULT_LOG_DIR);
    observability::describe_all();

    let cli = Cli::parse();
    let mut config = PipelineConfig::load(cli.config.as_deref()).context("loading configuration")?;
    cli.overrides.apply(&mut config);

    let pipeline = Pipeline::new(config).context("initializing pipeline")?;
    let default_dataset = pipeline.config().jsonl_out.clone();

    let code = match cli.command {
        Commands::Transform => {
            println!("🔄 Transforming {}...", pipeline.config().input.display());
            let summary = pipeline.transform().context("transform failed")?;
            summary.log();
            println!("   Read: {}", summary.records_read);
            println!("   Processed: {}", summary.records_processed);
            println!("   Skipped: {}", summary.records_skipped);
            for sample in &summary.skip_samples {
                println!("     - {}", sample);
            }
            ExitCode::SUCCESS
        }
        Commands::FetchImages { dataset } => {
            let dataset = dataset.unwrap_or(default_dataset);
            println!("🖼️  Fetching images for {}...", dataset.display());
            let (fetched, written) = pipeline
                .fetch_images_for_dataset(&dataset)
                .await
                .context("image fetch failed")?;
            println!(
                "   ok: {}, failed: {}, cached: {} ({} rows rewritten)",
                fetched.ok, fetched.failed, fetched.cached, written.rows
            );
            ExitCode::SUCCESS
        }
        Commands::Audit { dataset, no_compare } => {
            let dataset = dataset.unwrap_or(default_dataset);
            let outcome = pipeline.audit(&dataset, !no_compare).context("audit failed")?;
            println!("📊 Snapshot: {}", outcome.snapshot_path.display());
            println!(
                "   Rows: {}, photo coverage: {:.3}",
                outcome.snapshot.total_rows, outcome.snapshot.photo_coverage
            );
            match &outcome.drift {
                Some(drift) if drift.drifted.is_empty() => {
                    println!("   No drift against {}", drift.previous_snapshot.display())
                }
                Some(drift) => {
                    println!(
                        "   ⚠️  {} metric(s) drifted against {}:",
                        drift.drifted.len(),
                        drift.previous_snapshot.display()
                    );
                    for d in &drift.drifted {
                        println!(
                            "     - {}: {} → {} ({:.1}%)",
                            d.metric,
                            d.previous,
                            d.current,
                            d.relative_delta * 100.0
                        );
                    }
                }
                None => println!("   No previous snapshot to compare"),
            }
            ExitCode::SUCCESS
        }
        Commands::Eval { dataset, strict } => {
            let dataset = dataset.unwrap_or(default_dataset);
            let report = pipeline.eval(&dataset).context("eval failed")?;
            print_eval(&report);
            strict_exit(strict, report.overall_pass)
        }
        Commands::Run { strict } => {
            println!("🚀 Running full pipeline...");
            let summary = match pipeline.run().await {
                Ok(summary) => summary,
                Err(e) => {
                    error!("Pipeline run failed: {}", e);
                    return Err(e).context("pipeline run failed");
                }
            };
            println!("\n📊 Run {}:", summary.run_id);
            println!("   Read: {}", summary.records_read);
            println!("   Processed: {}", summary.records_processed);
            println!("   Skipped: {}", summary.records_skipped);
            for sample in &summary.skip_samples {
                println!("     - {}", sample);
            }
            if let Some(images) = &summary.images {
                println!(
                    "   Images: ok {}, failed {}, cached {}",
                    images.ok, images.failed, images.cached
                );
            }
            if let Some(drifted) = summary.drifted_metrics {
                println!("   Drifted metrics: {}", drifted);
            }
            let pass = summary.eval_pass.unwrap_or(true);
            println!("   Eval: {}", if pass { "PASS" } else { "FAIL" });
            strict_exit(strict, pass)
        }
    };

    info!("Done");
    Ok(code)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_strict_failures_change_the_exit_status() {
        assert_eq!(strict_status(true, false), 2);
        assert_eq!(strict_status(true, true), 0);
        assert_eq!(strict_status(false, false), 0);
        assert_eq!(strict_status(false, true), 0);
    }

    #[test]
    fn overrides_replace_only_given_options() {
        let cli = Cli::parse_from([
            "sf311_pipeline",
            "--max-workers",
            "3",
            "--no-fetch-images",
            "eval",
            "--strict",
        ]);
        assert!(matches!(cli.command, Commands::Eval { strict: true, .. }));
        let mut cfg = PipelineConfig::default();
        cli.overrides.apply(&mut cfg);
        assert_eq!(cfg.images.max_workers, 3);
        assert!(!cfg.images.enabled);
        assert_eq!(cfg.max_text_len, PipelineConfig::default().max_text_len);
    }
}
