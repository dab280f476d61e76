//! Checksum-verified local cache of complaint photos.
//!
//! Workers only download, hash and store bytes. The coordinating task owns the
//! [`Manifest`] and is the only place entries change.

use chrono::Utc;
use reqwest::Url;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, instrument, warn};

use super::fetcher::ImageFetcher;
use super::manifest::{Manifest, ManifestEntry};
use crate::config::ImageConfig;
use crate::domain::{CanonicalRequest, FetchStatus};
use crate::error::Result;
use crate::observability::metrics::ImageCacheMetrics;

#[derive(Debug, Clone)]
pub struct ImageCacheOptions {
    pub image_dir: PathBuf,
    pub max_workers: usize,
    /// Re-download every URL even when the cached file verifies
    pub rewrite: bool,
}

impl From<&ImageConfig> for ImageCacheOptions {
    fn from(cfg: &ImageConfig) -> Self {
        Self {
            image_dir: cfg.image_dir.clone(),
            max_workers: cfg.max_workers,
            rewrite: cfg.rewrite,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FetchSummary {
    pub ok: usize,
    pub failed: usize,
    pub cached: usize,
}

impl FetchSummary {
    /// Network calls made during the sync.
    pub fn attempted(&self) -> usize {
        self.ok + self.failed
    }
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// `NN_<basename>`, falling back to `NN_image_NN.jpg` when the URL path has no basename.
pub fn file_name_for(url: &str, index: usize) -> String {
    let base = Url::parse(url)
        .ok()
        .and_then(|u| {
            u.path_segments()
                .and_then(|segments| segments.filter(|s| !s.is_empty()).last().map(str::to_string))
        })
        .map(|b| sanitize(&b, true))
        .filter(|b| !b.is_empty() && b != "." && b != "..");
    let base = base.unwrap_or_else(|| format!("image_{:02}.jpg", index));
    format!("{:02}_{}", index, base)
}

/// Replace anything outside `[A-Za-z0-9_-]` (and `.` when `keep_dots`) with `_`.
fn sanitize(raw: &str, keep_dots: bool) -> String {
    raw.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' || (keep_dots && c == '.') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Single path component for a request id. Ids that needed rewriting get a short
/// checksum suffix so two distinct ids never share a directory.
pub fn request_dir_name(request_id: &str) -> String {
    let cleaned = sanitize(request_id, false);
    if cleaned == request_id && !cleaned.is_empty() {
        cleaned
    } else {
        format!("{}-{}", cleaned, &sha256_hex(request_id.as_bytes())[..12])
    }
}

pub fn cache_path(image_dir: &Path, request_id: &str, index: usize, url: &str) -> PathBuf {
    image_dir
        .join(request_dir_name(request_id))
        .join(file_name_for(url, index))
}

fn path_string(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

/// Each URL mapped to its owner: the smallest `(request_id, index)` that references it.
pub fn url_owners(records: &[CanonicalRequest]) -> BTreeMap<String, (String, usize)> {
    let mut owners: BTreeMap<String, (String, usize)> = BTreeMap::new();
    for record in records {
        for (index, url) in record.photo_urls.iter().enumerate() {
            let candidate = (record.request_id.clone(), index);
            match owners.get_mut(url) {
                Some(current) if candidate < *current => *current = candidate,
                Some(_) => {}
                None => {
                    owners.insert(url.clone(), candidate);
                }
            }
        }
    }
    owners
}

/// A manifest entry is reusable when it succeeded, points at the expected file, and
/// that file still hashes to the recorded checksum.
async fn verifies(entry: &ManifestEntry, expected: &str) -> bool {
    if entry.status != FetchStatus::Ok || entry.local_path.as_deref() != Some(expected) {
        return false;
    }
    let Some(recorded) = entry.sha256.as_deref() else {
        return false;
    };
    match tokio::fs::read(expected).await {
        Ok(bytes) => sha256_hex(&bytes) == recorded,
        Err(_) => false,
    }
}

#[derive(Debug)]
struct Job {
    url: String,
    request_id: String,
    path: PathBuf,
    /// A verified copy exists and is only being refreshed
    has_verified_copy: bool,
}

struct Fetched {
    job: Job,
    elapsed_secs: f64,
    result: Result<(String, usize)>,
}

async fn run_job(fetcher: &dyn ImageFetcher, job: Job) -> Fetched {
    let started = Instant::now();
    let result: Result<(String, usize)> = async {
        let bytes = fetcher.fetch(&job.url).await?;
        let checksum = sha256_hex(&bytes);
        if let Some(parent) = job.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&job.path, &bytes).await?;
        Ok((checksum, bytes.len()))
    }
    .await;
    Fetched {
        job,
        elapsed_secs: started.elapsed().as_secs_f64(),
        result,
    }
}

pub struct ImageCache {
    fetcher: Arc<dyn ImageFetcher>,
    options: ImageCacheOptions,
}

impl ImageCache {
    pub fn new(fetcher: Arc<dyn ImageFetcher>, options: ImageCacheOptions) -> Self {
        Self { fetcher, options }
    }

    /// Bring `manifest` up to date with every photo URL in `records`.
    #[instrument(skip_all, fields(records = records.len(), manifest_entries = manifest.len()))]
    pub async fn sync(&self, records: &[CanonicalRequest], manifest: &mut Manifest) -> FetchSummary {
        let mut summary = FetchSummary::default();
        let mut jobs = Vec::new();

        for (url, (request_id, index)) in url_owners(records) {
            let path = cache_path(&self.options.image_dir, &request_id, index, &url);
            let verified = match manifest.get(&url) {
                Some(entry) => verifies(entry, &path_string(&path)).await,
                None => false,
            };
            if verified && !self.options.rewrite {
                ImageCacheMetrics::record_cache_hit();
                summary.cached += 1;
                continue;
            }
            jobs.push(Job {
                url,
                request_id,
                path,
                has_verified_copy: verified,
            });
        }

        if jobs.is_empty() {
            info!(cached = summary.cached, "No images to fetch");
            return summary;
        }
        info!(jobs = jobs.len(), cached = summary.cached, "Fetching images");

        let semaphore = Arc::new(Semaphore::new(self.options.max_workers.max(1)));
        let mut set = JoinSet::new();
        for job in jobs {
            let fetcher = Arc::clone(&self.fetcher);
            let semaphore = Arc::clone(&semaphore);
            set.spawn(async move {
                let _permit = semaphore.acquire_owned().await.ok();
                run_job(fetcher.as_ref(), job).await
            });
        }

        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(fetched) => self.merge(fetched, manifest, &mut summary),
                Err(e) => {
                    warn!(error = %e, "Image fetch task did not complete");
                    ImageCacheMetrics::record_fetch_failure();
                    summary.failed += 1;
                }
            }
        }

        info!(
            ok = summary.ok,
            failed = summary.failed,
            cached = summary.cached,
            "Image sync complete"
        );
        summary
    }

    fn merge(&self, fetched: Fetched, manifest: &mut Manifest, summary: &mut FetchSummary) {
        let Fetched {
            job,
            elapsed_secs,
            result,
        } = fetched;
        let local_path = path_string(&job.path);

        match result {
            Ok((checksum, bytes)) => {
                ImageCacheMetrics::record_fetch_success(bytes, elapsed_secs);
                summary.ok += 1;
                let unchanged = manifest.get(&job.url).map_or(false, |prev| {
                    prev.status == FetchStatus::Ok
                        && prev.sha256.as_deref() == Some(checksum.as_str())
                        && prev.local_path.as_deref() == Some(local_path.as_str())
                });
                if unchanged {
                    debug!(url = %job.url, "Re-fetched bytes match the recorded checksum");
                    return;
                }
                manifest.insert(ManifestEntry {
                    url: job.url,
                    request_id: job.request_id,
                    local_path: Some(local_path),
                    sha256: Some(checksum),
                    status: FetchStatus::Ok,
                    bytes: Some(bytes as u64),
                    error: None,
                    fetched_at: Utc::now(),
                });
            }
            Err(e) => {
                ImageCacheMetrics::record_fetch_failure();
                summary.failed += 1;
                if job.has_verified_copy {
                    warn!(url = %job.url, error = %e, "Refresh failed; keeping the verified cached copy");
                    return;
                }
                warn!(url = %job.url, error = %e, "Image fetch failed; will retry next run");
                manifest.insert(ManifestEntry {
                    url: job.url,
                    request_id: job.request_id,
                    local_path: None,
                    sha256: None,
                    status: FetchStatus::Failed,
                    bytes: None,
                    error: Some(e.to_string()),
                    fetched_at: Utc::now(),
                });
            }
        }
    }
}

/// Copy manifest state into each record's image metadata, index-aligned with
/// `photo_urls`. URLs without an entry stay `None`.
pub fn apply_manifest(records: &mut [CanonicalRequest], manifest: &Manifest) {
    for record in records.iter_mut() {
        let n = record.photo_urls.len();
        let mut paths = Vec::with_capacity(n);
        let mut checksums = Vec::with_capacity(n);
        let mut statuses = Vec::with_capacity(n);
        for url in &record.photo_urls {
            let entry = manifest.get(url);
            paths.push(entry.and_then(|e| e.local_path.clone()));
            checksums.push(entry.and_then(|e| e.sha256.clone()));
            statuses.push(entry.map(|e| e.status));
        }
        record.images.image_paths = paths;
        record.images.image_checksums = checksums;
        record.images.image_fetch_status = statuses;
    }
}
