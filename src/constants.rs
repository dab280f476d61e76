/// Default locations and thresholds shared by the CLI and the config loader.

pub const DEFAULT_CONFIG_PATH: &str = "sf311.toml";
pub const CONFIG_PATH_ENV: &str = "SF311_CONFIG";

pub const DEFAULT_INPUT: &str = "data/homeless.txt";
pub const DEFAULT_JSONL_OUT: &str = "data/transformed.jsonl";
pub const DEFAULT_PARQUET_OUT: &str = "data/transformed.parquet";
pub const DEFAULT_CSV_OUT: &str = "data/transformed.csv";
pub const DEFAULT_KEYWORD_TABLE: &str = "config/keywords.toml";
pub const DEFAULT_IMAGE_DIR: &str = "data/images";
pub const DEFAULT_MANIFEST: &str = "data/images/manifest.jsonl";
pub const DEFAULT_SNAPSHOT_DIR: &str = "data/audit";
pub const DEFAULT_EVAL_REPORT: &str = "data/eval_report.json";
pub const DEFAULT_LOG_DIR: &str = "logs";

pub const DEFAULT_MAX_TEXT_LEN: usize = 1000;
pub const DEFAULT_SIZE_FEET_MAX: f64 = 400.0;
pub const DEFAULT_NUM_PEOPLE_MAX: f64 = 25.0;

pub const DEFAULT_MAX_WORKERS: usize = 8;
pub const DEFAULT_FETCH_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_USER_AGENT: &str = "sf311-pipeline/0.1";

pub const DEFAULT_DRIFT_THRESHOLD: f64 = 0.10;
pub const DEFAULT_MIN_PHOTO_COVERAGE: f64 = 0.0;
pub const DEFAULT_MIN_KEYWORD_AGREEMENT: f64 = 0.5;
pub const DEFAULT_MAX_FAILING_IDS: usize = 25;

/// How many skip reasons are echoed in the run summary.
pub const SKIP_REASON_SAMPLES: usize = 5;

/// Raw keys that carry a record's request id, in precedence order.
pub const REQUEST_ID_KEYS: &[&str] = &["service_request_id", "id", "request_id"];
