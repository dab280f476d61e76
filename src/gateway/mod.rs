// Gateway: everything that touches the network, plus the image manifest it maintains

pub mod fetcher;
pub mod image_cache;
pub mod manifest;

pub use fetcher::{HttpFetcher, ImageFetcher};
pub use image_cache::{apply_manifest, FetchSummary, ImageCache, ImageCacheOptions};
pub use manifest::{Manifest, ManifestEntry};
