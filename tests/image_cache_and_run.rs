use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tempfile::tempdir;

use sf311_pipeline::domain::FetchStatus;
use sf311_pipeline::gateway::image_cache::sha256_hex;
use sf311_pipeline::gateway::{ImageFetcher, Manifest, ManifestEntry};
use sf311_pipeline::pipeline::Pipeline;
use sf311_pipeline::storage;
use sf311_pipeline::{PipelineConfig, PipelineError};

/// Serves fixed bodies and counts every call; unknown URLs fail like a dead host.
struct CountingFetcher {
    bodies: HashMap<String, Vec<u8>>,
    calls: AtomicUsize,
}

impl CountingFetcher {
    fn new(bodies: &[(&str, &[u8])]) -> Arc<Self> {
        Arc::new(Self {
            bodies: bodies.iter().map(|(u, b)| (u.to_string(), b.to_vec())).collect(),
            calls: AtomicUsize::new(0),
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ImageFetcher for CountingFetcher {
    async fn fetch(&self, url: &str) -> sf311_pipeline::Result<Vec<u8>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.bodies.get(url).cloned().ok_or_else(|| PipelineError::Fetch {
            url: url.to_string(),
            reason: "connection refused".into(),
        })
    }
}

fn config_in(dir: &Path) -> PipelineConfig {
    let mut cfg = PipelineConfig::default();
    cfg.input = dir.join("homeless.txt");
    cfg.jsonl_out = dir.join("out/transformed.jsonl");
    cfg.parquet_out = dir.join("out/transformed.parquet");
    cfg.csv_out = dir.join("out/transformed.csv");
    cfg.keyword_table = PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("config/keywords.toml");
    cfg.images.image_dir = dir.join("images");
    cfg.images.manifest = dir.join("images/manifest.jsonl");
    cfg.images.max_workers = 3;
    cfg.audit.snapshot_dir = dir.join("audit");
    cfg.eval.report = dir.join("eval_report.json");
    cfg
}

fn write_input(path: &Path) -> Result<()> {
    let body = json!([
        {"id": "2", "description": "tarp and tents on the ramp", "photos": ["https://img/2/a.jpg", "https://img/shared.jpg"],
         "homeless_tags": {"tents_or_makeshift_present": true, "size_feet": 60}},
        {"id": "1", "description": "person lying face down", "photos": [{"url": "https://img/shared.jpg"}],
         "homeless_tags": {"person_position": "lying", "person_lying_face_down_on_sidewalk": true}},
        {"id": "3", "description": "no photo here"}
    ]);
    fs::write(path, json!({ "body": body }).to_string())?;
    Ok(())
}

#[tokio::test]
async fn rerun_makes_no_fetches_and_keeps_the_manifest_byte_identical() -> Result<()> {
    let dir = tempdir()?;
    let cfg = config_in(dir.path());
    write_input(&cfg.input)?;
    let fetcher = CountingFetcher::new(&[("https://img/2/a.jpg", b"two-a"), ("https://img/shared.jpg", b"shared")]);

    let pipeline = Pipeline::new(cfg.clone())?.with_fetcher(fetcher.clone());
    let first = pipeline.run().await?;
    assert_eq!(first.records_processed, 3);
    let images = first.images.expect("image step ran");
    assert_eq!((images.ok, images.failed, images.cached), (2, 0, 0));
    assert_eq!(first.eval_pass, Some(true));
    assert!(first.drifted_metrics.is_none());
    let manifest_bytes = fs::read(&cfg.images.manifest)?;

    // shared URL lands under the smallest (request_id, index)
    let manifest = Manifest::load(&cfg.images.manifest)?;
    let shared = manifest.get("https://img/shared.jpg").expect("entry");
    assert_eq!(shared.request_id, "1");
    assert!(shared.local_path.as_deref().unwrap().ends_with("00_shared.jpg"));

    let second = pipeline.run().await?;
    let images = second.images.expect("image step ran");
    assert_eq!((images.ok, images.failed, images.cached), (0, 0, 2));
    assert_eq!(fetcher.calls(), 2);
    assert_eq!(fs::read(&cfg.images.manifest)?, manifest_bytes);
    assert_eq!(second.drifted_metrics, Some(0));

    // written rows carry the joined image metadata, sorted by request id
    let rows = storage::read_any(&cfg.parquet_out)?;
    let ids: Vec<&str> = rows.iter().map(|r| r.request_id.as_str()).collect();
    assert_eq!(ids, vec!["1", "2", "3"]);
    assert_eq!(rows[1].images.image_fetch_status, vec![Some(FetchStatus::Ok); 2]);
    assert_eq!(
        rows[1].images.image_checksums[0].as_deref(),
        Some(sha256_hex(b"two-a").as_str())
    );
    Ok(())
}

#[tokio::test]
async fn verified_cache_entry_is_kept_even_when_the_host_is_down() -> Result<()> {
    let dir = tempdir()?;
    let cfg = config_in(dir.path());
    fs::write(
        &cfg.input,
        json!([{"id": "7", "text": "tent", "photos": ["https://down.example/x.jpg"]}]).to_string(),
    )?;

    let cached_path = cfg.images.image_dir.join("7").join("00_x.jpg");
    fs::create_dir_all(cached_path.parent().unwrap())?;
    fs::write(&cached_path, b"cached bytes")?;
    let entry = ManifestEntry {
        url: "https://down.example/x.jpg".into(),
        request_id: "7".into(),
        local_path: Some(cached_path.to_string_lossy().into_owned()),
        sha256: Some(sha256_hex(b"cached bytes")),
        status: FetchStatus::Ok,
        bytes: Some(12),
        error: None,
        fetched_at: Utc::now(),
    };
    let mut manifest = Manifest::default();
    manifest.insert(entry.clone());
    manifest.save(&cfg.images.manifest)?;

    let fetcher = CountingFetcher::new(&[]);
    let pipeline = Pipeline::new(cfg.clone())?.with_fetcher(fetcher.clone());
    let summary = pipeline.run().await?;

    assert_eq!(fetcher.calls(), 0);
    assert_eq!(summary.images.map(|i| i.cached), Some(1));
    let after = Manifest::load(&cfg.images.manifest)?;
    assert_eq!(after.get("https://down.example/x.jpg"), Some(&entry));
    Ok(())
}

#[tokio::test]
async fn failed_fetch_is_recorded_without_stopping_other_urls() -> Result<()> {
    let dir = tempdir()?;
    let cfg = config_in(dir.path());
    fs::write(
        &cfg.input,
        json!([{"id": "1", "photos": ["https://up/a.jpg", "https://down/b.jpg"]}]).to_string(),
    )?;
    let fetcher = CountingFetcher::new(&[("https://up/a.jpg", b"aaa")]);
    let pipeline = Pipeline::new(cfg.clone())?.with_fetcher(fetcher.clone());

    let summary = pipeline.run().await?;
    let images = summary.images.expect("image step ran");
    assert_eq!((images.ok, images.failed), (1, 1));

    let rows = storage::read_any(&cfg.jsonl_out)?;
    assert_eq!(
        rows[0].images.image_fetch_status,
        vec![Some(FetchStatus::Ok), Some(FetchStatus::Failed)]
    );
    assert_eq!(rows[0].images.image_checksums[1], None);

    // the failure is retried, the success is not
    pipeline.run().await?;
    assert_eq!(fetcher.calls(), 3);
    Ok(())
}

#[tokio::test]
async fn standalone_fetch_reads_an_existing_dataset() -> Result<()> {
    let dir = tempdir()?;
    let mut cfg = config_in(dir.path());
    cfg.images.enabled = false;
    write_input(&cfg.input)?;
    let fetcher = CountingFetcher::new(&[("https://img/2/a.jpg", b"two-a"), ("https://img/shared.jpg", b"shared")]);
    let pipeline = Pipeline::new(cfg.clone())?.with_fetcher(fetcher.clone());

    pipeline.transform()?;
    assert_eq!(fetcher.calls(), 0);
    let before = storage::read_any(&cfg.csv_out)?;
    assert!(before.iter().all(|r| r.images.image_fetch_status.iter().all(Option::is_none)));

    let (fetched, written) = pipeline.fetch_images_for_dataset(&cfg.jsonl_out).await?;
    assert_eq!(fetched.ok, 2);
    assert_eq!(written.rows, 3);
    let after = storage::read_any(&cfg.csv_out)?;
    assert!(after
        .iter()
        .flat_map(|r| r.images.image_fetch_status.iter())
        .all(|s| *s == Some(FetchStatus::Ok)));
    Ok(())
}
