use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::constants::*;
use crate::error::{PipelineError, Result};

/// Every recognized option of a pipeline run.
///
/// Loaded from a TOML file; fields missing from the file fall back to the defaults in
/// [`crate::constants`]. The CLI applies its flags on top of the loaded value.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PipelineConfig {
    pub input: PathBuf,
    pub jsonl_out: PathBuf,
    pub parquet_out: PathBuf,
    pub csv_out: PathBuf,
    pub max_text_len: usize,
    pub size_feet_max: f64,
    pub num_people_max: f64,
    pub keyword_table: PathBuf,
    pub images: ImageConfig,
    pub audit: AuditConfig,
    pub eval: EvalConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ImageConfig {
    /// Skip the cache step entirely when false
    pub enabled: bool,
    pub image_dir: PathBuf,
    pub manifest: PathBuf,
    pub max_workers: usize,
    pub fetch_timeout_secs: u64,
    pub user_agent: String,
    /// Force a re-download of every URL
    pub rewrite: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AuditConfig {
    pub snapshot_dir: PathBuf,
    pub drift_threshold: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EvalConfig {
    pub report: PathBuf,
    pub min_photo_coverage: f64,
    pub min_keyword_agreement: f64,
    pub max_failing_ids: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            input: PathBuf::from(DEFAULT_INPUT),
            jsonl_out: PathBuf::from(DEFAULT_JSONL_OUT),
            parquet_out: PathBuf::from(DEFAULT_PARQUET_OUT),
            csv_out: PathBuf::from(DEFAULT_CSV_OUT),
            max_text_len: DEFAULT_MAX_TEXT_LEN,
            size_feet_max: DEFAULT_SIZE_FEET_MAX,
            num_people_max: DEFAULT_NUM_PEOPLE_MAX,
            keyword_table: PathBuf::from(DEFAULT_KEYWORD_TABLE),
            images: ImageConfig::default(),
            audit: AuditConfig::default(),
            eval: EvalConfig::default(),
        }
    }
}

impl Default for ImageConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            image_dir: PathBuf::from(DEFAULT_IMAGE_DIR),
            manifest: PathBuf::from(DEFAULT_MANIFEST),
            max_workers: DEFAULT_MAX_WORKERS,
            fetch_timeout_secs: DEFAULT_FETCH_TIMEOUT_SECS,
            user_agent: DEFAULT_USER_AGENT.to_string(),
            rewrite: false,
        }
    }
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            snapshot_dir: PathBuf::from(DEFAULT_SNAPSHOT_DIR),
            drift_threshold: DEFAULT_DRIFT_THRESHOLD,
        }
    }
}

impl Default for EvalConfig {
    fn default() -> Self {
        Self {
            report: PathBuf::from(DEFAULT_EVAL_REPORT),
            min_photo_coverage: DEFAULT_MIN_PHOTO_COVERAGE,
            min_keyword_agreement: DEFAULT_MIN_KEYWORD_AGREEMENT,
            max_failing_ids: DEFAULT_MAX_FAILING_IDS,
        }
    }
}

impl PipelineConfig {
    /// Load configuration from `path`.
    ///
    /// When no path is given, `SF311_CONFIG` is consulted and then `sf311.toml`; a missing
    /// default file yields the built-in defaults, a missing explicit file is an error.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let (config_path, explicit) = match path {
            Some(p) => (p.to_path_buf(), true),
            None => match std::env::var(CONFIG_PATH_ENV) {
                Ok(p) if !p.trim().is_empty() => (PathBuf::from(p), true),
                _ => (PathBuf::from(DEFAULT_CONFIG_PATH), false),
            },
        };

        if !config_path.exists() {
            if explicit {
                return Err(PipelineError::Config(format!(
                    "config file '{}' does not exist",
                    config_path.display()
                )));
            }
            return Ok(Self::default());
        }

        let content = fs::read_to_string(&config_path).map_err(|e| {
            PipelineError::Config(format!(
                "Failed to read config file '{}': {}",
                config_path.display(),
                e
            ))
        })?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let config: PipelineConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_text_len == 0 {
            return Err(PipelineError::Config("max_text_len must be positive".into()));
        }
        if !(self.size_feet_max > 0.0) || !(self.num_people_max > 0.0) {
            return Err(PipelineError::Config(
                "size_feet_max and num_people_max must be positive".into(),
            ));
        }
        if self.images.max_workers == 0 {
            return Err(PipelineError::Config("images.max_workers must be at least 1".into()));
        }
        for (name, v) in [
            ("eval.min_photo_coverage", self.eval.min_photo_coverage),
            ("eval.min_keyword_agreement", self.eval.min_keyword_agreement),
        ] {
            if !(0.0..=1.0).contains(&v) {
                return Err(PipelineError::Config(format!("{} must be within [0, 1], got {}", name, v)));
            }
        }
        if self.audit.drift_threshold < 0.0 {
            return Err(PipelineError::Config("audit.drift_threshold must not be negative".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_yields_defaults() {
        let config = PipelineConfig::from_toml("").unwrap();
        assert_eq!(config, PipelineConfig::default());
    }

    #[test]
    fn partial_sections_keep_remaining_defaults() {
        let config = PipelineConfig::from_toml(
            r#"
            input = "raw/dump.json"
            max_text_len = 200

            [images]
            max_workers = 2

            [eval]
            min_photo_coverage = 0.4
            "#,
        )
        .unwrap();
        assert_eq!(config.input, PathBuf::from("raw/dump.json"));
        assert_eq!(config.max_text_len, 200);
        assert_eq!(config.images.max_workers, 2);
        assert_eq!(config.images.manifest, PathBuf::from(DEFAULT_MANIFEST));
        assert_eq!(config.eval.min_photo_coverage, 0.4);
        assert_eq!(config.eval.min_keyword_agreement, DEFAULT_MIN_KEYWORD_AGREEMENT);
    }

    #[test]
    fn out_of_range_threshold_is_rejected() {
        let err = PipelineConfig::from_toml("[eval]\nmin_keyword_agreement = 1.5\n").unwrap_err();
        assert!(matches!(err, PipelineError::Config(_)));
    }

    #[test]
    fn missing_explicit_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope.toml");
        assert!(PipelineConfig::load(Some(&missing)).is_err());
    }
}
